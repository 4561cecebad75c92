use std::fmt;

use rand::rngs::StdRng;
use rand::Rng;
use scaleseg_config::params;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{invalid, TransformResult};
use crate::results::{FlipDirection, SegResults};
use crate::transform::Transform;

fn default_direction() -> FlipDirection {
    FlipDirection::Horizontal
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RandomFlipParams {
    #[serde(default)]
    prob: Option<f64>,
    #[serde(default = "default_direction")]
    direction: FlipDirection,
}

/// Flip image and label maps with probability `prob`.
///
/// A record that already carries a flip decision keeps it, so paired
/// pipelines (e.g. test-time augmentation) flip consistently.
#[derive(Debug, Clone)]
pub struct RandomFlip {
    prob: Option<f64>,
    direction: FlipDirection,
}

impl RandomFlip {
    const NAME: &'static str = "RandomFlip";

    pub fn new(prob: Option<f64>, direction: FlipDirection) -> TransformResult<Self> {
        if let Some(p) = prob {
            if !(0.0..=1.0).contains(&p) {
                return Err(invalid(Self::NAME, format!("prob {} not in [0, 1]", p)));
            }
        }
        Ok(RandomFlip { prob, direction })
    }

    pub fn from_config(cfg: &Value) -> TransformResult<Self> {
        let p: RandomFlipParams = params(cfg)?;
        Self::new(p.prob, p.direction)
    }
}

impl Transform for RandomFlip {
    fn apply(&self, results: &mut SegResults, rng: &mut StdRng) -> TransformResult<()> {
        let flip = match results.flip {
            Some(flip) => flip,
            None => {
                let flip = self.prob.map(|p| rng.gen::<f64>() < p).unwrap_or(false);
                results.flip = Some(flip);
                flip
            }
        };
        let direction = *results.flip_direction.get_or_insert(self.direction);
        if !flip {
            return Ok(());
        }

        let axis = direction.axis();
        let img = results.img()?.flip_axis(axis)?;
        results.put_img(img);
        results.map_segs(|seg| Ok(seg.flip_axis(axis)?))
    }
}

impl fmt::Display for RandomFlip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.prob {
            Some(p) => write!(f, "RandomFlip(prob={:?})", p),
            None => write!(f, "RandomFlip(prob=None)"),
        }
    }
}
