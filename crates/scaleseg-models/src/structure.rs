use std::fs;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Number of parallel branches in a block.
pub const NUM_BRANCHES: usize = 4;

/// Pooling factor of each branch; branch 0 keeps full resolution.
pub const BRANCH_SCALES: [Option<usize>; NUM_BRANCHES] = [None, Some(2), Some(4), Some(7)];

/// One descriptor entry: per-branch channels followed by the nominal side
/// length of the block's feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStructure {
    pub channels: [usize; NUM_BRANCHES],
    pub side: usize,
}

impl BlockStructure {
    pub fn from_entry(index: usize, entry: &[usize]) -> ModelResult<Self> {
        if entry.len() != NUM_BRANCHES + 1 {
            return Err(ModelError::Structure(format!(
                "entry {} has {} values, expected {} branch widths and a side",
                index,
                entry.len(),
                NUM_BRANCHES
            )));
        }
        let mut channels = [0; NUM_BRANCHES];
        channels.copy_from_slice(&entry[..NUM_BRANCHES]);
        let block = BlockStructure {
            channels,
            side: entry[NUM_BRANCHES],
        };
        if block.total_channels() == 0 {
            return Err(ModelError::Structure(format!("entry {} has no active branch", index)));
        }
        Ok(block)
    }

    /// Input width of the block's final projection.
    pub fn total_channels(&self) -> usize {
        self.channels.iter().sum()
    }

    /// 3 when branch `i` still sees more than one pixel per side after its
    /// nominal down-scaling by `2^i`, 1 otherwise.
    pub fn kernel_size(&self, branch: usize) -> usize {
        if self.side as f64 / (1u64 << branch) as f64 > 1.0 {
            3
        } else {
            1
        }
    }
}

/// The per-block branch widths of a whole backbone, in construction order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureDescriptor {
    blocks: Vec<BlockStructure>,
}

impl StructureDescriptor {
    pub fn from_entries(entries: &[Vec<usize>]) -> ModelResult<Self> {
        let blocks = entries
            .iter()
            .enumerate()
            .map(|(i, e)| BlockStructure::from_entry(i, e))
            .collect::<ModelResult<Vec<_>>>()?;
        Ok(StructureDescriptor { blocks })
    }

    pub fn from_json(text: &str) -> ModelResult<Self> {
        let entries: Vec<Vec<usize>> = serde_json::from_str(text).map_err(|source| ModelError::StructureParse {
            path: "<string>".into(),
            source,
        })?;
        Self::from_entries(&entries)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> ModelResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ModelError::StructureIo {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<Vec<usize>> = serde_json::from_str(&text).map_err(|source| ModelError::StructureParse {
            path: path.to_path_buf(),
            source,
        })?;
        let descriptor = Self::from_entries(&entries)?;
        debug!("loaded {} block structures from {}", descriptor.len(), path.display());
        Ok(descriptor)
    }

    /// Same entry repeated `count` times.
    pub fn uniform(block: BlockStructure, count: usize) -> Self {
        StructureDescriptor {
            blocks: vec![block; count],
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[BlockStructure] {
        &self.blocks
    }

    pub fn cursor(&self) -> StructureCursor<'_> {
        StructureCursor {
            blocks: &self.blocks,
            next: 0,
        }
    }
}

/// Hands out descriptor entries to blocks as they are built.
#[derive(Debug)]
pub struct StructureCursor<'a> {
    blocks: &'a [BlockStructure],
    next: usize,
}

impl StructureCursor<'_> {
    pub fn next_block(&mut self) -> ModelResult<BlockStructure> {
        let block = self.blocks.get(self.next).copied().ok_or_else(|| {
            ModelError::Structure(format!(
                "descriptor has {} entries but block {} was requested",
                self.blocks.len(),
                self.next
            ))
        })?;
        self.next += 1;
        Ok(block)
    }

    pub fn consumed(&self) -> usize {
        self.next
    }

    pub fn remaining(&self) -> usize {
        self.blocks.len() - self.next
    }
}
