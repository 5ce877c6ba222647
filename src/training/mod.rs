#[cfg(feature = "training")]
pub mod learner;
pub mod loss;
pub mod metrics;

#[cfg(feature = "training")]
pub use learner::{SegmentationOutput, TrainingConfig, train};
pub use loss::{LossConfig, dice_loss, generalized_dice_loss, one_hot, tversky_loss};
pub use metrics::{DiceMetric, HammingMetric, StreamingDice, dice, hamming};
