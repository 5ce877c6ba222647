use burn::{
    module::Ignored,
    nn::{
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, PaddingConfig3d, Relu,
        conv::{Conv3d, Conv3dConfig},
    },
    prelude::*,
    tensor::activation::softmax,
};
use serde_json::{Map, Value};

#[cfg(feature = "training")]
use burn::{
    tensor::backend::AutodiffBackend,
    train::{TrainOutput, TrainStep, ValidStep},
};

use super::blocks::{ChannelPadding, ResBlock3d, ResBlock3dConfig};
use crate::error::ConfigError;
use crate::training::loss::{LossConfig, one_hot};

#[cfg(feature = "training")]
use crate::{dataset::VolumeBatch, training::learner::SegmentationOutput};

const STEM_FILTERS: usize = 16;
const FEATURE_FILTERS: usize = 80;

/// `(filters, dilation, skip padding per side)` of each residual block.
const RESIDUAL_SCHEDULE: [(usize, usize, usize); 9] = [
    (16, 1, 0),
    (16, 1, 0),
    (16, 1, 0),
    (32, 2, 8),
    (32, 2, 0),
    (32, 2, 0),
    (64, 4, 16),
    (64, 4, 0),
    (64, 4, 0),
];

#[derive(Config, Debug)]
pub struct HighRes3DNetConfig {
    pub n_classes: usize,
    #[config(default = "1")]
    pub in_channels: usize,
    #[config(default = "false")]
    pub one_batchnorm_per_resblock: bool,
    /// Dropout before the logits layer; 0 disables it.
    #[config(default = "0.0")]
    pub dropout_rate: f64,
    #[config(default = "LossConfig::default()")]
    pub loss: LossConfig,
}

impl HighRes3DNetConfig {
    /// Parse parameters from a JSON object. Keys left out take their
    /// defaults; a missing `n_classes` is reported before anything else.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_json::from_str(json).map_err(|err| ConfigError::InvalidFormat(err.to_string()))?;

        let object = value.as_object().ok_or_else(|| {
            ConfigError::InvalidFormat("parameters must be a JSON object".to_string())
        })?;
        for key in Self::REQUIRED_KEYS {
            if !object.contains_key(key) {
                return Err(ConfigError::MissingParam(key));
            }
        }

        let n_classes = json_field(object, "n_classes", Value::as_u64, "a non-negative integer")?
            .unwrap_or_default();
        let mut config = Self::new(n_classes as usize);

        if let Some(in_channels) =
            json_field(object, "in_channels", Value::as_u64, "a non-negative integer")?
        {
            config = config.with_in_channels(in_channels as usize);
        }
        if let Some(one_batchnorm) =
            json_field(object, "one_batchnorm_per_resblock", Value::as_bool, "a boolean")?
        {
            config = config.with_one_batchnorm_per_resblock(one_batchnorm);
        }
        if let Some(dropout_rate) = json_field(object, "dropout_rate", Value::as_f64, "a number")? {
            config = config.with_dropout_rate(dropout_rate);
        }
        if let Some(loss) = object.get("loss") {
            let loss: LossConfig = serde_json::from_value(loss.clone())
                .map_err(|err| ConfigError::InvalidFormat(format!("`loss`: {}", err)))?;
            config = config.with_loss(loss);
        }

        config.validate()?;
        Ok(config)
    }

    pub const REQUIRED_KEYS: [&'static str; 1] = ["n_classes"];

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_classes == 0 {
            return Err(ConfigError::InvalidParam {
                name: "n_classes",
                reason: "must be positive".to_string(),
            });
        }
        if self.in_channels == 0 {
            return Err(ConfigError::InvalidParam {
                name: "in_channels",
                reason: "must be positive".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(ConfigError::InvalidParam {
                name: "dropout_rate",
                reason: format!("must be in [0, 1), got {}", self.dropout_rate),
            });
        }
        if let LossConfig::Tversky { alpha, beta } = &self.loss {
            if !(*alpha >= 0.0 && *beta >= 0.0) {
                return Err(ConfigError::InvalidParam {
                    name: "loss",
                    reason: format!("Tversky weights must be non-negative, got {alpha} and {beta}"),
                });
            }
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> HighRes3DNet<B> {
        if let Err(err) = self.validate() {
            panic!("Invalid HighRes3DNet config: {}", err);
        }

        let mut in_channels = STEM_FILTERS;
        let blocks = RESIDUAL_SCHEDULE
            .iter()
            .enumerate()
            .map(|(idx, &(filters, dilation, padding))| {
                let block = ResBlock3dConfig::new(idx + 1, in_channels, filters)
                    .with_dilation(dilation)
                    .with_padding((padding > 0).then(|| ChannelPadding::symmetric(padding)))
                    .with_one_batchnorm(self.one_batchnorm_per_resblock)
                    .init(device);
                in_channels = filters;
                block
            })
            .collect();

        HighRes3DNet {
            stem_conv: Conv3dConfig::new([self.in_channels, STEM_FILTERS], [3, 3, 3])
                .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
                .init(device),
            stem_norm: BatchNormConfig::new(STEM_FILTERS).init(device),
            activation: Relu::new(),
            blocks,
            features: Conv3dConfig::new([in_channels, FEATURE_FILTERS], [1, 1, 1]).init(device),
            dropout: (self.dropout_rate > 0.0)
                .then(|| DropoutConfig::new(self.dropout_rate).init()),
            logits: Conv3dConfig::new([FEATURE_FILTERS, self.n_classes], [1, 1, 1]).init(device),
            n_classes: self.n_classes,
            loss: Ignored(self.loss.clone()),
        }
    }
}

fn json_field<T>(
    object: &Map<String, Value>,
    key: &str,
    read: impl Fn(&Value) -> Option<T>,
    expected: &str,
) -> Result<Option<T>, ConfigError> {
    match object.get(key) {
        None => Ok(None),
        Some(value) => read(value).map(Some).ok_or_else(|| {
            ConfigError::InvalidFormat(format!("`{}` must be {}, got {}", key, expected, value))
        }),
    }
}

#[derive(Debug, Clone)]
pub struct Predictions<B: Backend> {
    /// `[batch, depth, height, width]` arg-max class indices.
    pub class_ids: Tensor<B, 4, Int>,
    /// `[batch, n_classes, depth, height, width]` softmax probabilities.
    pub probabilities: Tensor<B, 5>,
    /// `[batch, n_classes, depth, height, width]` raw logits.
    pub logits: Tensor<B, 5>,
}

impl<B: Backend> Predictions<B> {
    pub fn from_logits(logits: Tensor<B, 5>) -> Self {
        let probabilities = softmax(logits.clone(), 1);
        let class_ids = probabilities.clone().argmax(1).squeeze::<4>(1);

        Self {
            class_ids,
            probabilities,
            logits,
        }
    }
}

// Li et al., "On the Compactness, Efficiency, and Representation of 3D
// Convolutional Networks: Brain Parcellation as a Pretext Task", IPMI 2017.
#[derive(Module, Debug)]
pub struct HighRes3DNet<B: Backend> {
    stem_conv: Conv3d<B>,
    stem_norm: BatchNorm<B, 3>,
    activation: Relu,
    blocks: Vec<ResBlock3d<B>>,
    features: Conv3d<B>,
    dropout: Option<Dropout>,
    logits: Conv3d<B>,
    n_classes: usize,
    loss: Ignored<LossConfig>,
}

impl<B: Backend> HighRes3DNet<B> {
    /// Logits for a `[batch, in_channels, depth, height, width]` volume.
    pub fn forward(&self, volume: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.stem_conv.forward(volume);
        let x = self.stem_norm.forward(x);
        let mut x = self.activation.forward(x);

        for block in &self.blocks {
            x = block.forward(x);
        }

        let x = self.features.forward(x);
        let x = match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        };

        self.logits.forward(x)
    }

    pub fn predict(&self, volume: Tensor<B, 5>) -> Predictions<B> {
        Predictions::from_logits(self.forward(volume))
    }

    /// Configured loss between `probabilities` and a label map.
    ///
    /// # Panics
    ///
    /// If the label map and the probabilities disagree in batch or spatial
    /// shape.
    pub fn loss(&self, probabilities: Tensor<B, 5>, labels: Tensor<B, 4, Int>) -> Tensor<B, 1> {
        let [batch, _, depth, height, width] = probabilities.dims();
        assert_eq!(
            labels.dims(),
            [batch, depth, height, width],
            "Label map {:?} does not match the predicted volume {:?}",
            labels.dims(),
            probabilities.dims()
        );

        self.loss
            .0
            .forward(one_hot(labels, self.n_classes), probabilities)
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn blocks(&self) -> &[ResBlock3d<B>] {
        &self.blocks
    }

    pub fn loss_config(&self) -> &LossConfig {
        &self.loss.0
    }

    #[cfg(feature = "training")]
    pub fn forward_segmentation(&self, item: VolumeBatch<B>) -> SegmentationOutput<B> {
        let output = softmax(self.forward(item.volumes), 1);
        let loss = self.loss(output.clone(), item.labels.clone());

        SegmentationOutput {
            loss,
            output,
            targets: item.labels,
        }
    }
}

#[cfg(feature = "training")]
impl<B: AutodiffBackend> TrainStep<VolumeBatch<B>, SegmentationOutput<B>> for HighRes3DNet<B> {
    fn step(&self, batch: VolumeBatch<B>) -> TrainOutput<SegmentationOutput<B>> {
        let item = self.forward_segmentation(batch);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

#[cfg(feature = "training")]
impl<B: Backend> ValidStep<VolumeBatch<B>, SegmentationOutput<B>> for HighRes3DNet<B> {
    fn step(&self, batch: VolumeBatch<B>) -> SegmentationOutput<B> {
        self.forward_segmentation(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type B = NdArray<f32>;

    #[test]
    fn test_residual_schedule() {
        let device = Default::default();
        let model: HighRes3DNet<B> = HighRes3DNetConfig::new(3).init(&device);

        let channels: Vec<(usize, usize)> = model
            .blocks()
            .iter()
            .map(|block| (block.in_channels(), block.out_channels()))
            .collect();
        assert_eq!(
            channels,
            vec![
                (16, 16),
                (16, 16),
                (16, 16),
                (16, 32),
                (32, 32),
                (32, 32),
                (32, 64),
                (64, 64),
                (64, 64),
            ]
        );
        assert!(model.blocks().iter().all(|block| block.has_second_norm()));
    }

    #[test]
    fn test_one_batchnorm_per_resblock() {
        let device = Default::default();
        let model: HighRes3DNet<B> = HighRes3DNetConfig::new(2)
            .with_one_batchnorm_per_resblock(true)
            .init(&device);

        assert!(model.blocks().iter().all(|block| !block.has_second_norm()));
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model: HighRes3DNet<B> = HighRes3DNetConfig::new(4).init(&device);

        let volume = Tensor::random([1, 1, 4, 4, 4], Distribution::Default, &device);
        let logits = model.forward(volume);
        assert_eq!(logits.dims(), [1, 4, 4, 4, 4]);
    }

    #[test]
    fn test_predictions_follow_probabilities() {
        let device = Default::default();
        let model: HighRes3DNet<B> = HighRes3DNetConfig::new(3).init(&device);

        let volume = Tensor::random([2, 1, 3, 3, 3], Distribution::Default, &device);
        let predictions = model.predict(volume);

        let sums = predictions
            .probabilities
            .clone()
            .sum_dim(1)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!(sums.iter().all(|sum| (sum - 1.0).abs() < 1e-5));

        let probabilities = predictions.probabilities.into_data().to_vec::<f32>().unwrap();
        let class_ids = predictions.class_ids.into_data().to_vec::<i64>().unwrap();
        let voxels = 2 * 27;
        for (voxel, class_id) in class_ids.iter().enumerate() {
            let (batch, offset) = (voxel / 27, voxel % 27);
            let class_probability =
                |class: usize| probabilities[batch * 3 * 27 + class * 27 + offset];
            let best = (0..3)
                .max_by(|&a, &b| class_probability(a).total_cmp(&class_probability(b)))
                .unwrap();
            assert_eq!(
                class_probability(*class_id as usize),
                class_probability(best),
                "voxel {} of {}",
                voxel,
                voxels
            );
        }
    }

    #[test]
    fn test_training_forward_with_dropout() {
        type AB = Autodiff<NdArray<f32>>;
        let device = Default::default();
        let model: HighRes3DNet<AB> = HighRes3DNetConfig::new(2)
            .with_dropout_rate(0.5)
            .init(&device);

        let volume = Tensor::random([2, 1, 3, 3, 3], Distribution::Default, &device);
        let labels = Tensor::<AB, 4, Int>::zeros([2, 3, 3, 3], &device);

        let probabilities = softmax(model.forward(volume), 1);
        let loss = model.loss(probabilities, labels);
        let value = loss.clone().into_scalar();
        assert!(value.is_finite());

        let grads = loss.backward();
        assert!(model.logits.weight.grad(&grads).is_some());
    }

    #[test]
    fn test_from_json() {
        let config = HighRes3DNetConfig::from_json(r#"{"n_classes": 5, "dropout_rate": 0.25}"#)
            .unwrap();
        assert_eq!(config.n_classes, 5);
        assert_eq!(config.dropout_rate, 0.25);
        assert!(!config.one_batchnorm_per_resblock);
        assert!(matches!(config.loss, LossConfig::Tversky { .. }));

        let config = HighRes3DNetConfig::from_json(r#"{"n_classes": 2, "loss": "GeneralizedDice"}"#)
            .unwrap();
        assert!(matches!(config.loss, LossConfig::GeneralizedDice));

        let config = HighRes3DNetConfig::from_json(r#"{"n_classes": 3}"#).unwrap();
        assert_eq!(config.in_channels, 1);
        assert_eq!(config.dropout_rate, 0.0);

        let config = HighRes3DNetConfig::from_json(
            r#"{"n_classes": 3, "in_channels": 2, "one_batchnorm_per_resblock": true,
                "loss": {"Tversky": {"alpha": 0.5, "beta": 0.5}}}"#,
        )
        .unwrap();
        assert_eq!(config.in_channels, 2);
        assert!(config.one_batchnorm_per_resblock);
        assert!(matches!(
            config.loss,
            LossConfig::Tversky { alpha, beta } if alpha == 0.5 && beta == 0.5
        ));
    }

    #[test]
    fn test_from_json_errors() {
        assert!(matches!(
            HighRes3DNetConfig::from_json(r#"{"dropout_rate": 0.1}"#),
            Err(ConfigError::MissingParam("n_classes"))
        ));
        assert!(matches!(
            HighRes3DNetConfig::from_json(r#"{"n_classes": 0}"#),
            Err(ConfigError::InvalidParam { name: "n_classes", .. })
        ));
        assert!(matches!(
            HighRes3DNetConfig::from_json(r#"{"n_classes": 2, "dropout_rate": 1.0}"#),
            Err(ConfigError::InvalidParam { name: "dropout_rate", .. })
        ));
        assert!(matches!(
            HighRes3DNetConfig::from_json("[1, 2]"),
            Err(ConfigError::InvalidFormat(_))
        ));
        assert!(matches!(
            HighRes3DNetConfig::from_json(r#"{"n_classes": "two"}"#),
            Err(ConfigError::InvalidFormat(_))
        ));
        assert!(matches!(
            HighRes3DNetConfig::from_json(r#"{"n_classes": 2, "loss": "Focal"}"#),
            Err(ConfigError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_validate_rejects_nan_tversky_weights() {
        let config = HighRes3DNetConfig::new(2).with_loss(LossConfig::Tversky {
            alpha: f32::NAN,
            beta: 0.7,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParam { name: "loss", .. })
        ));

        let config = HighRes3DNetConfig::new(2).with_loss(LossConfig::Tversky {
            alpha: 0.3,
            beta: -0.1,
        });
        assert!(config.validate().is_err());
    }
}
