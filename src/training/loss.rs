use burn::prelude::*;

use super::metrics::{DICE_EPSILON, dice_keepdim, resolve_axes, sum_axes};

pub const VOLUME_SPATIAL_AXES: [isize; 3] = [2, 3, 4];

pub const CLASS_AXIS: isize = 1;

pub const TVERSKY_ALPHA: f32 = 0.3;
pub const TVERSKY_BETA: f32 = 0.7;
pub const TVERSKY_SMOOTH: f64 = 1e-10;

#[derive(Config, Debug)]
pub enum LossConfig {
    Dice,
    /// Tversky loss; `alpha` weights false positives, `beta` false negatives.
    Tversky { alpha: f32, beta: f32 },
    GeneralizedDice,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self::Tversky {
            alpha: TVERSKY_ALPHA,
            beta: TVERSKY_BETA,
        }
    }
}

impl LossConfig {
    pub fn forward<B: Backend>(
        &self,
        labels: Tensor<B, 5>,
        probabilities: Tensor<B, 5>,
    ) -> Tensor<B, 1> {
        match self {
            LossConfig::Dice => dice_loss(labels, probabilities, &VOLUME_SPATIAL_AXES),
            LossConfig::Tversky { alpha, beta } => tversky_loss(
                labels,
                probabilities,
                &VOLUME_SPATIAL_AXES,
                *alpha as f64,
                *beta as f64,
                TVERSKY_SMOOTH,
            ),
            LossConfig::GeneralizedDice => generalized_dice_loss(
                labels,
                probabilities,
                &VOLUME_SPATIAL_AXES,
                CLASS_AXIS,
            ),
        }
    }
}

/// One-hot encode a `[batch, depth, height, width]` class map along a new
/// class axis 1.
pub fn one_hot<B: Backend>(labels: Tensor<B, 4, Int>, n_classes: usize) -> Tensor<B, 5> {
    let classes = (0..n_classes)
        .map(|class_idx| labels.clone().equal_elem(class_idx as i64).float())
        .collect();

    Tensor::stack::<5>(classes, 1)
}

fn assert_loss_inputs<B: Backend, const D: usize>(labels: &Tensor<B, D>, predictions: &Tensor<B, D>) {
    assert_eq!(
        labels.dims(),
        predictions.dims(),
        "Shape mismatch: labels {:?} vs predictions {:?}",
        labels.dims(),
        predictions.dims()
    );
}

pub fn dice_loss<B: Backend, const D: usize>(
    labels: Tensor<B, D>,
    predictions: Tensor<B, D>,
    axes: &[isize],
) -> Tensor<B, 1> {
    assert_loss_inputs(&labels, &predictions);
    let axes = resolve_axes::<D>(axes);

    dice_keepdim(labels, predictions, &axes).mean()
}

/// Tversky loss `1 - mean((TP + s) / (TP + α·FP + β·FN + s))` along `axes`.
pub fn tversky_loss<B: Backend, const D: usize>(
    labels: Tensor<B, D>,
    predictions: Tensor<B, D>,
    axes: &[isize],
    alpha: f64,
    beta: f64,
    smooth: f64,
) -> Tensor<B, 1> {
    assert_loss_inputs(&labels, &predictions);
    assert!(
        alpha >= 0. && beta >= 0.,
        "Tversky weights must be non-negative. Got alpha={}, beta={}",
        alpha,
        beta
    );
    let axes = resolve_axes::<D>(axes);

    let true_positives = sum_axes(predictions.clone() * labels.clone(), &axes);
    let false_positives = sum_axes(
        predictions.clone() * labels.clone().neg().add_scalar(1.0),
        &axes,
    );
    let false_negatives = sum_axes(predictions.neg().add_scalar(1.0) * labels, &axes);

    let numerator = true_positives.clone() + smooth;
    let denominator = true_positives + false_positives * alpha + false_negatives * beta + smooth;

    (numerator / denominator).mean().neg().add_scalar(1.0)
}

/// Generalized Dice loss along `axes`, summing classes over `class_axis`.
///
/// Each class is weighted by `1 / (Σ labels)²`; classes absent from the
/// labels get weight 0.
pub fn generalized_dice_loss<B: Backend, const D: usize>(
    labels: Tensor<B, D>,
    predictions: Tensor<B, D>,
    axes: &[isize],
    class_axis: isize,
) -> Tensor<B, 1> {
    assert_loss_inputs(&labels, &predictions);
    let axes = resolve_axes::<D>(axes);
    let class_axis = resolve_axes::<D>(&[class_axis])[0];
    assert!(
        !axes.contains(&class_axis),
        "Class axis {} is also a reduction axis",
        class_axis
    );

    let class_volume = sum_axes(labels.clone(), &axes);
    let absent = class_volume.clone().equal_elem(0.0);
    let weights = class_volume.powf_scalar(2.0).recip().mask_fill(absent, 0.0);

    let intersection = sum_axes(labels.clone() * predictions.clone(), &axes);
    let total = sum_axes(labels + predictions, &axes);

    let numerator = (weights.clone() * intersection).sum_dim(class_axis);
    let denominator = (weights * total).sum_dim(class_axis);

    let score = (numerator * 2.0 + DICE_EPSILON) / (denominator + DICE_EPSILON);
    score.mean().neg().add_scalar(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f64>;

    const TOLERANCE: f64 = 1e-6;

    /// Two classes over a 1x2x2 volume: class 1 on the first two voxels.
    fn labels() -> Tensor<TestBackend, 4, Int> {
        Tensor::from_data(
            TensorData::new(vec![1i64, 1, 0, 0], [1, 1, 2, 2]),
            &Default::default(),
        )
    }

    fn scalar(tensor: Tensor<TestBackend, 1>) -> f64 {
        tensor.into_scalar()
    }

    #[test]
    fn test_one_hot() {
        let onehot = one_hot(labels(), 3);
        assert_eq!(onehot.dims(), [1, 3, 1, 2, 2]);

        let values = onehot.into_data().to_vec::<f64>().unwrap();
        assert_eq!(
            values,
            vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_perfect_prediction_has_zero_loss() {
        let onehot = one_hot(labels(), 2);

        for config in [
            LossConfig::Dice,
            LossConfig::default(),
            LossConfig::GeneralizedDice,
        ] {
            let loss = scalar(config.forward(onehot.clone(), onehot.clone()));
            assert!(loss.abs() < TOLERANCE, "{:?}: {}", config, loss);
        }
    }

    #[test]
    fn test_inverted_prediction_has_unit_loss() {
        let onehot = one_hot(labels(), 2);
        let inverted = onehot.clone().neg().add_scalar(1.0);

        for config in [
            LossConfig::Dice,
            LossConfig::default(),
            LossConfig::GeneralizedDice,
        ] {
            let loss = scalar(config.forward(onehot.clone(), inverted.clone()));
            assert!((loss - 1.0).abs() < TOLERANCE, "{:?}: {}", config, loss);
        }
    }

    #[test]
    fn test_tversky_weights_false_negatives_higher() {
        let device = Default::default();
        let truth = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0, 0.0, 0.0]], &device);
        // One extra voxel.
        let over = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0, 1.0, 0.0]], &device);
        // One missing voxel.
        let under = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0, 0.0, 0.0]], &device);

        let fp_loss = scalar(tversky_loss(
            truth.clone(),
            over,
            &[-1],
            0.3,
            0.7,
            TVERSKY_SMOOTH,
        ));
        let fn_loss = scalar(tversky_loss(truth, under, &[-1], 0.3, 0.7, TVERSKY_SMOOTH));

        assert!((fp_loss - (1.0 - 2.0 / 2.3)).abs() < TOLERANCE);
        assert!((fn_loss - (1.0 - 1.0 / 1.7)).abs() < TOLERANCE);
        assert!(fn_loss > fp_loss);
    }

    #[test]
    fn test_tversky_with_equal_weights_is_dice() {
        let device = Default::default();
        let truth = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0, 0.0, 1.0]], &device);
        let prediction = Tensor::<TestBackend, 2>::from_floats([[0.9, 0.2, 0.4, 0.6]], &device);

        let tversky = scalar(tversky_loss(
            truth.clone(),
            prediction.clone(),
            &[-1],
            0.5,
            0.5,
            0.0,
        ));
        let dice = scalar(dice_loss(truth, prediction, &[-1]));

        assert!((tversky - dice).abs() < TOLERANCE);
    }

    #[test]
    fn test_generalized_dice_ignores_absent_classes() {
        // Class 2 never occurs; its weight is zero, so it cannot
        // contribute even though the prediction is wrong there.
        let onehot = one_hot(labels(), 3);
        let mut predictions = onehot.clone().into_data().to_vec::<f64>().unwrap();
        predictions[8] = 1.0;
        let predictions = Tensor::<TestBackend, 5>::from_data(
            TensorData::new(predictions, [1, 3, 1, 2, 2]),
            &Default::default(),
        );

        let loss = scalar(generalized_dice_loss(
            onehot,
            predictions,
            &VOLUME_SPATIAL_AXES,
            CLASS_AXIS,
        ));
        assert!(loss.abs() < TOLERANCE);
    }

    #[test]
    #[should_panic(expected = "Class axis 1 is also a reduction axis")]
    fn test_generalized_dice_class_axis_conflict() {
        let onehot = one_hot(labels(), 2);
        generalized_dice_loss(onehot.clone(), onehot, &[1, 2], 1);
    }
}
