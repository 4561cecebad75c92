use rand::Rng;
use scaleseg_core::{Tensor, TensorResult};
use scaleseg_nn::{
    interpolate, join, BatchNorm2D, Conv2D, Conv2DConfig, Interpolation, MaxPool2D, Module, Sequential,
};

use crate::structure::{BlockStructure, BRANCH_SCALES, NUM_BRANCHES};

/// Channel multiplier between a block's bottleneck and its output.
pub const EXPANSION: usize = 4;

/// Pool a feature map for a branch with the given down-scaling factor.
///
/// Maps smaller than `scale` on either side collapse to a single pixel:
/// the window is `(H, H)` with stride `(W, W)`, or the whole map when it is
/// taller than wide.
pub fn branch_pool(x: &Tensor<f32>, scale: usize) -> TensorResult<Tensor<f32>> {
    let (_, _, h, w) = x.shape().nchw()?;
    let pool = if h < scale || w < scale {
        if h <= w {
            MaxPool2D {
                kernel_size: (h, h),
                stride: (w, w),
                padding: 0,
            }
        } else {
            MaxPool2D {
                kernel_size: (h, w),
                stride: (h, w),
                padding: 0,
            }
        }
    } else {
        MaxPool2D::new(scale)
    };
    pool.forward_tensor(x)
}

/// Bottleneck residual block whose middle stage runs up to four branches at
/// different resolutions and concatenates them.
///
/// Parameter names: `downsample.{0,1}`, `conv1`, `bn1`, `conv2.{i}`,
/// `bn2.{i}` (only for active branches), `conv3`, `bn3`.
pub struct SABlock {
    stride: usize,
    structure: BlockStructure,
    downsample: Option<Sequential>,
    conv1: Conv2D,
    bn1: BatchNorm2D,
    conv2: Vec<Option<Conv2D>>,
    bn2: Vec<Option<BatchNorm2D>>,
    conv3: Conv2D,
    bn3: BatchNorm2D,
}

impl SABlock {
    pub fn new<R: Rng + ?Sized>(
        inplanes: usize,
        planes: usize,
        stride: usize,
        downsample: bool,
        structure: BlockStructure,
        dilation: usize,
        rng: &mut R,
    ) -> Self {
        let outplanes = planes * EXPANSION;
        let downsample = downsample.then(|| {
            Sequential::new()
                .add(Box::new(Conv2D::pointwise(inplanes, outplanes, rng)))
                .add(Box::new(BatchNorm2D::new(outplanes)))
        });

        let conv1 = Conv2D::pointwise(inplanes, planes, rng);
        let bn1 = BatchNorm2D::new(planes);

        let mut conv2 = Vec::with_capacity(NUM_BRANCHES);
        let mut bn2 = Vec::with_capacity(NUM_BRANCHES);
        for (i, &width) in structure.channels.iter().enumerate() {
            if width == 0 {
                conv2.push(None);
                bn2.push(None);
                continue;
            }
            let conv = if structure.kernel_size(i) == 3 {
                Conv2D::new(planes, width, (3, 3), Conv2DConfig::same(dilation), false, rng)
            } else {
                Conv2D::pointwise(planes, width, rng)
            };
            conv2.push(Some(conv));
            bn2.push(Some(BatchNorm2D::new(width)));
        }

        let conv3 = Conv2D::pointwise(structure.total_channels(), outplanes, rng);
        let bn3 = BatchNorm2D::new(outplanes);

        SABlock {
            stride,
            structure,
            downsample,
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
        }
    }

    pub fn structure(&self) -> &BlockStructure {
        &self.structure
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn has_downsample(&self) -> bool {
        self.downsample.is_some()
    }

    pub fn out_channels(&self) -> usize {
        self.conv3.out_channels
    }

    /// Run branch `i` on the bottleneck output `out1`: pool, convolve,
    /// resize back to `out1`'s size and normalize. `None` for inactive
    /// branches.
    pub fn forward_branch(&mut self, i: usize, out1: &Tensor<f32>) -> TensorResult<Option<Tensor<f32>>> {
        let (Some(conv), Some(bn)) = (&self.conv2[i], &mut self.bn2[i]) else {
            return Ok(None);
        };
        let (_, _, h, w) = out1.shape().nchw()?;
        let pooled = match BRANCH_SCALES[i] {
            Some(scale) => branch_pool(out1, scale)?,
            None => out1.clone(),
        };
        let mut y = conv.forward_tensor(&pooled)?;
        if BRANCH_SCALES[i].is_some() {
            let (_, _, yh, yw) = y.shape().nchw()?;
            y = interpolate(&y, (h, w), Interpolation::for_upsample((yh, yw), (h, w)))?;
        }
        Ok(Some(bn.forward(&y)?))
    }
}

impl Module for SABlock {
    fn forward(&mut self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let x = if self.stride > 1 {
            MaxPool2D::new(self.stride).forward_tensor(input)?
        } else {
            input.clone()
        };

        let residual = match &mut self.downsample {
            Some(ds) => ds.forward(&x)?,
            None => x.clone(),
        };

        let mut out1 = self.bn1.forward(&self.conv1.forward_tensor(&x)?)?;
        out1.relu_mut();

        let mut branches = Vec::with_capacity(NUM_BRANCHES);
        for i in 0..NUM_BRANCHES {
            if let Some(branch) = self.forward_branch(i, &out1)? {
                branches.push(branch);
            }
        }
        let refs: Vec<&Tensor<f32>> = branches.iter().collect();
        let mut out2 = Tensor::concatenate(&refs, 1)?;
        out2.relu_mut();

        let mut out = self.bn3.forward(&self.conv3.forward_tensor(&out2)?)?;
        out.add_assign(&residual)?;
        out.relu_mut();
        Ok(out)
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(String, &Tensor<f32>)) {
        if let Some(ds) = &self.downsample {
            ds.visit(&join(prefix, "downsample"), f);
        }
        self.conv1.visit(&join(prefix, "conv1"), f);
        self.bn1.visit(&join(prefix, "bn1"), f);
        for (i, conv) in self.conv2.iter().enumerate() {
            if let Some(conv) = conv {
                conv.visit(&join(prefix, &format!("conv2.{}", i)), f);
            }
        }
        for (i, bn) in self.bn2.iter().enumerate() {
            if let Some(bn) = bn {
                bn.visit(&join(prefix, &format!("bn2.{}", i)), f);
            }
        }
        self.conv3.visit(&join(prefix, "conv3"), f);
        self.bn3.visit(&join(prefix, "bn3"), f);
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Tensor<f32>)) {
        if let Some(ds) = &mut self.downsample {
            ds.visit_mut(&join(prefix, "downsample"), f);
        }
        self.conv1.visit_mut(&join(prefix, "conv1"), f);
        self.bn1.visit_mut(&join(prefix, "bn1"), f);
        for (i, conv) in self.conv2.iter_mut().enumerate() {
            if let Some(conv) = conv {
                conv.visit_mut(&join(prefix, &format!("conv2.{}", i)), f);
            }
        }
        for (i, bn) in self.bn2.iter_mut().enumerate() {
            if let Some(bn) = bn {
                bn.visit_mut(&join(prefix, &format!("bn2.{}", i)), f);
            }
        }
        self.conv3.visit_mut(&join(prefix, "conv3"), f);
        self.bn3.visit_mut(&join(prefix, "bn3"), f);
    }

    fn set_training(&mut self, training: bool) {
        self.for_each_norm(&mut |bn| bn.set_training(training));
    }

    fn for_each_norm(&mut self, f: &mut dyn FnMut(&mut BatchNorm2D)) {
        if let Some(ds) = &mut self.downsample {
            ds.for_each_norm(f);
        }
        f(&mut self.bn1);
        for bn in self.bn2.iter_mut().flatten() {
            f(bn);
        }
        f(&mut self.bn3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn structure(channels: [usize; 4], side: usize) -> BlockStructure {
        BlockStructure { channels, side }
    }

    fn block(inplanes: usize, stride: usize, downsample: bool, s: BlockStructure) -> SABlock {
        SABlock::new(inplanes, 4, stride, downsample, s, 1, &mut StdRng::seed_from_u64(7))
    }

    fn input(h: usize, w: usize, c: usize) -> Tensor<f32> {
        Tensor::randn(vec![2, c, h, w], Some(3))
    }

    #[test]
    fn test_branch_pool_sizes() {
        let x = input(15, 20, 1);
        let sizes: Vec<_> = [2, 4, 7]
            .iter()
            .map(|&s| {
                let y = branch_pool(&x, s).unwrap();
                (y.shape_vec()[2], y.shape_vec()[3])
            })
            .collect();
        assert_eq!(sizes, vec![(7, 10), (3, 5), (2, 2)]);
    }

    #[test]
    fn test_branch_pool_collapses_small_maps() {
        // wide map: window (H, H), stride (W, W)
        let y = branch_pool(&input(3, 5, 1), 4).unwrap();
        assert_eq!(y.shape_vec(), vec![2, 1, 1, 1]);
        // tall map: whole map pooled
        let x = input(6, 3, 1);
        let y = branch_pool(&x, 4).unwrap();
        assert_eq!(y.shape_vec(), vec![2, 1, 1, 1]);
        let first = x.narrow(0, 0, 1).unwrap().max_all().unwrap();
        assert_eq!(y.data()[0], first);
    }

    #[test]
    fn test_every_branch_matches_bottleneck_size() {
        for &(h, w) in &[(14, 14), (15, 20), (7, 9), (3, 5), (2, 2), (1, 1)] {
            let mut b = block(4, 1, false, structure([2, 2, 2, 2], 14));
            let out1 = input(h, w, 4);
            for i in 0..NUM_BRANCHES {
                let y = b.forward_branch(i, &out1).unwrap().unwrap();
                assert_eq!(y.shape_vec(), vec![2, 2, h, w], "branch {} at {}x{}", i, h, w);
            }
        }
    }

    #[test]
    fn test_inactive_branches_are_skipped() {
        let s = structure([0, 3, 0, 5], 28);
        let mut b = block(16, 1, false, s);
        assert!(b.forward_branch(0, &input(8, 8, 4)).unwrap().is_none());
        assert_eq!(b.conv3.in_channels, 8);

        let names: Vec<String> = b.state_dict().keys().cloned().collect();
        assert!(names.contains(&"conv2.1.weight".to_string()));
        assert!(names.contains(&"bn2.3.running_var".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("conv2.0") || n.starts_with("bn2.2")));
        assert!(!names.iter().any(|n| n.starts_with("downsample")));

        let out = b.forward(&input(8, 8, 16)).unwrap();
        assert_eq!(out.shape_vec(), vec![2, 16, 8, 8]);
    }

    #[test]
    fn test_kernel_choice_follows_side() {
        let b = block(4, 1, false, structure([1, 1, 1, 1], 4));
        let kernels: Vec<_> = b.conv2.iter().map(|c| c.as_ref().unwrap().kernel_size).collect();
        // 4, 2, 1, 0.5
        assert_eq!(kernels, vec![(3, 3), (3, 3), (1, 1), (1, 1)]);
    }

    #[test]
    fn test_stride_and_downsample() {
        let mut b = block(8, 2, true, structure([4, 4, 4, 4], 14));
        assert!(b.has_downsample());
        let out = b.forward(&input(14, 14, 8)).unwrap();
        assert_eq!(out.shape_vec(), vec![2, 16, 7, 7]);
        assert!(out.data().iter().all(|&v| v >= 0.0));
        assert!(b.state_dict().contains_key("downsample.1.running_mean"));
    }

    #[test]
    fn test_dilated_branches_keep_size() {
        let mut b = SABlock::new(16, 4, 1, false, structure([2, 2, 2, 2], 56), 4, &mut StdRng::seed_from_u64(1));
        let out = b.forward(&input(9, 11, 16)).unwrap();
        assert_eq!(out.shape_vec(), vec![2, 16, 9, 11]);
    }
}
