use std::marker::PhantomData;

use burn::prelude::*;
use burn::train::metric::state::{FormatOptions, NumericMetricState};
use burn::train::metric::{Metric, MetricEntry, MetricMetadata, Numeric};
use derive_new::new;

/// Smoothing term of the Dice ratio. Keeps two empty masks at distance 0.
pub const DICE_EPSILON: f64 = 1e-7;

pub const LABEL_SPATIAL_AXES: [isize; 3] = [1, 2, 3];

pub(crate) fn resolve_axes<const D: usize>(axes: &[isize]) -> Vec<usize> {
    assert!(!axes.is_empty(), "At least one reduction axis is required");

    let rank = D as isize;
    let mut resolved = Vec::with_capacity(axes.len());
    for &axis in axes {
        assert!(
            (-rank..rank).contains(&axis),
            "Axis {} out of range for a tensor of rank {}",
            axis,
            D
        );
        let axis = (if axis < 0 { axis + rank } else { axis }) as usize;
        assert!(
            !resolved.contains(&axis),
            "Reduction axis {} given more than once",
            axis
        );
        resolved.push(axis);
    }
    resolved
}

pub(crate) fn sum_axes<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    axes: &[usize],
) -> Tensor<B, D> {
    axes.iter().fold(tensor, |acc, &axis| acc.sum_dim(axis))
}

fn mean_axes<B: Backend, const D: usize>(tensor: Tensor<B, D>, axes: &[usize]) -> Tensor<B, D> {
    axes.iter().fold(tensor, |acc, &axis| acc.mean_dim(axis))
}

fn squeeze_axes<B: Backend, const D: usize, const D2: usize>(
    tensor: Tensor<B, D>,
    axes: &[usize],
) -> Tensor<B, D2> {
    let kept: Vec<usize> = tensor
        .dims()
        .iter()
        .enumerate()
        .filter(|(axis, _)| !axes.contains(axis))
        .map(|(_, &size)| size)
        .collect();

    assert_eq!(
        kept.len(),
        D2,
        "Reducing {} axes of a rank {} tensor leaves rank {}, not {}",
        axes.len(),
        D,
        kept.len(),
        D2
    );

    let mut shape = [0usize; D2];
    shape.copy_from_slice(&kept);
    tensor.reshape(shape)
}

fn assert_same_shape<B: Backend, const D: usize>(u: &Tensor<B, D>, v: &Tensor<B, D>) {
    assert_eq!(
        u.dims(),
        v.dims(),
        "Shape mismatch: {:?} vs {:?}",
        u.dims(),
        v.dims()
    );
}

pub(crate) fn dice_keepdim<B: Backend, const D: usize>(
    u: Tensor<B, D>,
    v: Tensor<B, D>,
    axes: &[usize],
) -> Tensor<B, D> {
    let intersection = sum_axes(u.clone() * v.clone(), axes);
    let total = sum_axes(u, axes) + sum_axes(v, axes);

    let coefficient = (intersection * 2.0 + DICE_EPSILON) / (total + DICE_EPSILON);
    coefficient.neg().add_scalar(1.0)
}

/// Dice dissimilarity `1 - (2·Σ(u·v) + ε) / (Σu + Σv + ε)` along `axes`.
///
/// Axes may be negative (`-1` is the last axis). The result has rank `D2`,
/// the input rank minus the number of reduced axes.
pub fn dice<B: Backend, const D: usize, const D2: usize>(
    u: Tensor<B, D>,
    v: Tensor<B, D>,
    axes: &[isize],
) -> Tensor<B, D2> {
    assert_same_shape(&u, &v);
    let axes = resolve_axes::<D>(axes);

    squeeze_axes(dice_keepdim(u, v, &axes), &axes)
}

/// Fraction of disagreeing elements along `axes`.
pub fn hamming<B: Backend, const D: usize, const D2: usize>(
    u: Tensor<B, D>,
    v: Tensor<B, D>,
    axes: &[isize],
) -> Tensor<B, D2> {
    assert_same_shape(&u, &v);
    let axes = resolve_axes::<D>(axes);

    let mismatches = u.not_equal(v).float();
    squeeze_axes(mean_axes(mismatches, &axes), &axes)
}

/// Running mean of Dice values across batches.
///
/// Each element left after the reduction counts as one sample, so feeding two
/// batches gives the same value as one call over their concatenation.
#[derive(Debug, Default, Clone)]
pub struct StreamingDice {
    total: f64,
    count: usize,
}

impl StreamingDice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<B: Backend, const D: usize, const D2: usize>(
        &mut self,
        u: Tensor<B, D>,
        v: Tensor<B, D>,
        axes: &[isize],
    ) -> f64 {
        let values: Tensor<B, D2> = dice(u, v, axes);
        self.accumulate(values)
    }

    pub fn accumulate<B: Backend, const D: usize>(&mut self, values: Tensor<B, D>) -> f64 {
        let count: usize = values.dims().iter().product();

        self.total += values.sum().into_scalar().elem::<f64>();
        self.count += count;
        self.value()
    }

    /// Current running mean, 0 before the first update.
    pub fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Predicted and reference class maps, `[batch, depth, height, width]`.
#[derive(new)]
pub struct ClassMapInput<B: Backend> {
    pub predictions: Tensor<B, 4, Int>,
    pub targets: Tensor<B, 4, Int>,
}

#[derive(Default)]
pub struct DiceMetric<B: Backend> {
    state: NumericMetricState,
    _b: PhantomData<B>,
}

impl<B: Backend> DiceMetric<B> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B: Backend> Metric for DiceMetric<B> {
    type Input = ClassMapInput<B>;
    const NAME: &'static str = "Dice";

    fn update(&mut self, input: &ClassMapInput<B>, _metadata: &MetricMetadata) -> MetricEntry {
        let [batch_size, ..] = input.targets.dims();

        let values: Tensor<B, 1> = dice(
            input.targets.clone().float(),
            input.predictions.clone().float(),
            &LABEL_SPATIAL_AXES,
        );
        let value = values.mean().into_scalar().elem::<f64>();

        self.state.update(
            value,
            batch_size,
            FormatOptions::new(Self::NAME).precision(4),
        )
    }

    fn clear(&mut self) {
        self.state.reset()
    }
}

impl<B: Backend> Numeric for DiceMetric<B> {
    fn value(&self) -> f64 {
        self.state.value()
    }
}

#[derive(Default)]
pub struct HammingMetric<B: Backend> {
    state: NumericMetricState,
    _b: PhantomData<B>,
}

impl<B: Backend> HammingMetric<B> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B: Backend> Metric for HammingMetric<B> {
    type Input = ClassMapInput<B>;
    const NAME: &'static str = "Hamming";

    fn update(&mut self, input: &ClassMapInput<B>, _metadata: &MetricMetadata) -> MetricEntry {
        let [batch_size, ..] = input.targets.dims();

        let values: Tensor<B, 1> = hamming(
            input.targets.clone().float(),
            input.predictions.clone().float(),
            &LABEL_SPATIAL_AXES,
        );
        let value = values.mean().into_scalar().elem::<f64>();

        self.state.update(
            100.0 * value,
            batch_size,
            FormatOptions::new(Self::NAME).unit("%").precision(2),
        )
    }

    fn clear(&mut self) {
        self.state.reset()
    }
}

impl<B: Backend> Numeric for HammingMetric<B> {
    fn value(&self) -> f64 {
        self.state.value()
    }
}
