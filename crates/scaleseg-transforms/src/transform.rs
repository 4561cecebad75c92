use std::fmt;

use rand::rngs::StdRng;

use crate::error::TransformResult;
use crate::results::SegResults;

/// One pipeline step.
///
/// Steps are configured once and then applied to many records; all
/// randomness comes from the `rng` handed in, so a seeded generator makes a
/// pipeline run reproducible.
pub trait Transform: fmt::Display + Send + Sync {
    fn apply(&self, results: &mut SegResults, rng: &mut StdRng) -> TransformResult<()>;
}

/// Steps applied in order.
#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Compose { transforms }
    }

    pub fn push(&mut self, transform: Box<dyn Transform>) {
        self.transforms.push(transform);
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl Transform for Compose {
    fn apply(&self, results: &mut SegResults, rng: &mut StdRng) -> TransformResult<()> {
        for t in &self.transforms {
            t.apply(results, rng)?;
        }
        Ok(())
    }
}

impl fmt::Display for Compose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compose(")?;
        for t in &self.transforms {
            writeln!(f, "    {}", t)?;
        }
        write!(f, ")")
    }
}
