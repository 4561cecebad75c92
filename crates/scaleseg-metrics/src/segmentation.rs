use scaleseg_core::{Tensor, TensorError, TensorResult};
use serde::Serialize;

/// Per-class pixel counts gathered from prediction/ground-truth pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Areas {
    pub intersect: Vec<u64>,
    pub union: Vec<u64>,
    pub pred: Vec<u64>,
    pub label: Vec<u64>,
}

impl Areas {
    pub fn zeros(num_classes: usize) -> Self {
        Areas {
            intersect: vec![0; num_classes],
            union: vec![0; num_classes],
            pred: vec![0; num_classes],
            label: vec![0; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.label.len()
    }

    pub fn add(&mut self, other: &Areas) {
        let pairs = [
            (&mut self.intersect, &other.intersect),
            (&mut self.union, &other.union),
            (&mut self.pred, &other.pred),
            (&mut self.label, &other.label),
        ];
        for (dst, src) in pairs {
            for (d, s) in dst.iter_mut().zip(src) {
                *d += s;
            }
        }
    }
}

/// Count intersection, union, predicted and labeled pixels per class.
///
/// Pixels whose ground truth is `ignore_index` are skipped, as are values
/// outside `0..num_classes`.
pub fn intersect_and_union(
    pred: &Tensor<u8>,
    gt: &Tensor<u8>,
    num_classes: usize,
    ignore_index: u8,
) -> TensorResult<Areas> {
    if pred.shape() != gt.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: gt.shape_vec(),
            got: pred.shape_vec(),
        });
    }
    let mut areas = Areas::zeros(num_classes);
    for (&p, &g) in pred.data().iter().zip(gt.data()) {
        if g == ignore_index {
            continue;
        }
        let (p, g) = (p as usize, g as usize);
        if g < num_classes {
            areas.label[g] += 1;
        }
        if p < num_classes {
            areas.pred[p] += 1;
            if p == g {
                areas.intersect[p] += 1;
            }
        }
    }
    for c in 0..num_classes {
        areas.union[c] = areas.pred[c] + areas.label[c] - areas.intersect[c];
    }
    Ok(areas)
}

/// Summary of an evaluation; classes absent from both prediction and ground
/// truth have NaN IoU, classes absent from the ground truth NaN accuracy.
#[derive(Debug, Clone, Serialize)]
pub struct IouReport {
    pub iou: Vec<f64>,
    pub acc: Vec<f64>,
    pub all_acc: f64,
    pub miou: f64,
    pub macc: f64,
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        f64::NAN
    } else {
        num as f64 / den as f64
    }
}

fn nan_mean(values: &[f64]) -> f64 {
    let valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        f64::NAN
    } else {
        valid.iter().sum::<f64>() / valid.len() as f64
    }
}

impl IouReport {
    pub fn from_areas(areas: &Areas) -> Self {
        let iou: Vec<f64> = areas.intersect.iter().zip(&areas.union).map(|(&i, &u)| ratio(i, u)).collect();
        let acc: Vec<f64> = areas.intersect.iter().zip(&areas.label).map(|(&i, &l)| ratio(i, l)).collect();
        let all_acc = ratio(areas.intersect.iter().sum(), areas.label.iter().sum());
        IouReport {
            miou: nan_mean(&iou),
            macc: nan_mean(&acc),
            iou,
            acc,
            all_acc,
        }
    }
}

/// Streaming counterpart of [`mean_iou`] for evaluating batch by batch.
#[derive(Debug, Clone)]
pub struct IouAccumulator {
    ignore_index: u8,
    areas: Areas,
}

impl IouAccumulator {
    pub fn new(num_classes: usize, ignore_index: u8) -> Self {
        IouAccumulator {
            ignore_index,
            areas: Areas::zeros(num_classes),
        }
    }

    pub fn update(&mut self, pred: &Tensor<u8>, gt: &Tensor<u8>) -> TensorResult<()> {
        let areas = intersect_and_union(pred, gt, self.areas.num_classes(), self.ignore_index)?;
        self.areas.add(&areas);
        Ok(())
    }

    pub fn areas(&self) -> &Areas {
        &self.areas
    }

    pub fn report(&self) -> IouReport {
        IouReport::from_areas(&self.areas)
    }
}

/// IoU and accuracy over a whole set of prediction/ground-truth pairs.
pub fn mean_iou(
    preds: &[Tensor<u8>],
    gts: &[Tensor<u8>],
    num_classes: usize,
    ignore_index: u8,
) -> TensorResult<IouReport> {
    if preds.len() != gts.len() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![gts.len()],
            got: vec![preds.len()],
        });
    }
    let mut acc = IouAccumulator::new(num_classes, ignore_index);
    for (p, g) in preds.iter().zip(gts) {
        acc.update(p, g)?;
    }
    Ok(acc.report())
}

/// Fraction of non-ignored pixels predicted correctly; NaN when every pixel
/// is ignored.
pub fn pixel_accuracy(pred: &Tensor<u8>, gt: &Tensor<u8>, ignore_index: u8) -> TensorResult<f64> {
    if pred.shape() != gt.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: gt.shape_vec(),
            got: pred.shape_vec(),
        });
    }
    let (correct, total) = pred
        .data()
        .iter()
        .zip(gt.data())
        .filter(|(_, &g)| g != ignore_index)
        .fold((0u64, 0u64), |(c, t), (&p, &g)| (c + (p == g) as u64, t + 1));
    Ok(ratio(correct, total))
}
