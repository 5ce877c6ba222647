pub mod error;
pub mod estimator;
pub mod model;
pub mod training;

#[cfg(feature = "dataset")]
pub mod dataset;

pub use error::{ConfigError, ModelError};

pub use estimator::{
    EvalSummary, Evaluation, Features, HighRes3DNetEstimator, HighRes3DNetEstimatorConfig,
    LoggingHook, Mode, ModelOutput, TrainStepOutput, TrainingOptimizer, model_fn,
};

pub use model::{
    ChannelPadding, HighRes3DNet, HighRes3DNetConfig, Predictions, ResBlock3d, ResBlock3dConfig,
};

#[cfg(feature = "dataset")]
pub use dataset::{VolumeBatch, VolumeBatcher, VolumeItem};

pub use training::{DiceMetric, HammingMetric, LossConfig, StreamingDice, dice, hamming};

#[cfg(feature = "training")]
pub use training::{SegmentationOutput, TrainingConfig};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
