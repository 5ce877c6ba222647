use thiserror::Error;

/// Invalid or incomplete hyperparameters.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required parameter `{0}`")]
    MissingParam(&'static str),

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParam { name: &'static str, reason: String },

    #[error("unknown optimizer `{0}`, expected one of adam, sgd, adagrad, rmsprop")]
    UnknownOptimizer(String),

    #[error("a learning rate is required to build optimizer `{0}` by name")]
    MissingLearningRate(String),

    #[error("invalid parameter format: {0}")]
    InvalidFormat(String),
}

/// Failures of the model function and the estimator around it.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("an optimizer is required in train mode")]
    MissingOptimizer,

    #[error("labels are required in {0} mode")]
    MissingLabels(crate::estimator::Mode),

    #[error("features do not contain `{0}`")]
    MissingFeature(String),

    #[error("unknown mode `{0}`")]
    UnknownMode(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}
