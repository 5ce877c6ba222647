use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use burn::{
    LearningRate,
    module::AutodiffModule,
    optim::{AdaGradConfig, AdamConfig, GradientsParams, Optimizer, RmsPropConfig, SgdConfig},
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};

use crate::error::{ConfigError, ModelError};
use crate::model::{HighRes3DNet, HighRes3DNetConfig, Predictions};
use crate::training::loss::{LossConfig, VOLUME_SPATIAL_AXES, one_hot};
use crate::training::metrics::{LABEL_SPATIAL_AXES, StreamingDice, dice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
    Predict,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Train => "train",
            Mode::Eval => "eval",
            Mode::Predict => "infer",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Mode::Train),
            "eval" => Ok(Mode::Eval),
            "infer" | "predict" => Ok(Mode::Predict),
            _ => Err(ModelError::UnknownMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Features<B: Backend> {
    Volume(Tensor<B, 5>),
    Named(HashMap<String, Tensor<B, 5>>),
}

impl<B: Backend> Features<B> {
    pub const VOLUME_KEY: &'static str = "volume";

    pub fn into_volume(self) -> Result<Tensor<B, 5>, ModelError> {
        match self {
            Features::Volume(volume) => Ok(volume),
            Features::Named(mut features) => features
                .remove(Self::VOLUME_KEY)
                .ok_or_else(|| ModelError::MissingFeature(Self::VOLUME_KEY.to_string())),
        }
    }
}

impl<B: Backend> From<Tensor<B, 5>> for Features<B> {
    fn from(volume: Tensor<B, 5>) -> Self {
        Features::Volume(volume)
    }
}

/// An optimizer stepping a [`HighRes3DNet`], with its concrete burn type
/// erased so that one can be picked by name at runtime.
pub trait ModelOptimizer<B: AutodiffBackend>: Send {
    fn update(
        &mut self,
        lr: LearningRate,
        model: HighRes3DNet<B>,
        grads: GradientsParams,
    ) -> HighRes3DNet<B>;
}

impl<B, O> ModelOptimizer<B> for O
where
    B: AutodiffBackend,
    O: Optimizer<HighRes3DNet<B>, B>,
{
    fn update(
        &mut self,
        lr: LearningRate,
        model: HighRes3DNet<B>,
        grads: GradientsParams,
    ) -> HighRes3DNet<B> {
        self.step(lr, model, grads)
    }
}

pub struct TrainingOptimizer<B: AutodiffBackend> {
    optimizer: Box<dyn ModelOptimizer<B>>,
    learning_rate: LearningRate,
}

impl<B: AutodiffBackend> TrainingOptimizer<B> {
    pub fn new<O>(optimizer: O, learning_rate: LearningRate) -> Self
    where
        O: Optimizer<HighRes3DNet<B>, B> + 'static,
    {
        Self {
            optimizer: Box::new(optimizer),
            learning_rate,
        }
    }

    /// Resolve an optimizer by name (case-insensitive): `adam`, `sgd`,
    /// `adagrad` or `rmsprop`, with burn's default settings.
    pub fn from_name(name: &str, learning_rate: LearningRate) -> Result<Self, ConfigError> {
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            return Err(ConfigError::InvalidParam {
                name: "learning_rate",
                reason: format!("must be positive, got {}", learning_rate),
            });
        }

        match name.to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::new(AdamConfig::new().init(), learning_rate)),
            "sgd" => Ok(Self::new(SgdConfig::new().init(), learning_rate)),
            "adagrad" => Ok(Self::new(AdaGradConfig::new().init(), learning_rate)),
            "rmsprop" => Ok(Self::new(RmsPropConfig::new().init(), learning_rate)),
            _ => Err(ConfigError::UnknownOptimizer(name.to_string())),
        }
    }

    pub fn learning_rate(&self) -> LearningRate {
        self.learning_rate
    }

    pub fn step(&mut self, model: HighRes3DNet<B>, grads: GradientsParams) -> HighRes3DNet<B> {
        self.optimizer.update(self.learning_rate, model, grads)
    }
}

#[derive(Debug, Clone)]
pub struct Evaluation<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub dice: Tensor<B, 1>,
}

#[derive(Debug, Clone)]
pub struct TrainStepOutput<B: AutodiffBackend> {
    pub model: HighRes3DNet<B>,
    pub loss: Tensor<B::InnerBackend, 1>,
    pub class_dice: Tensor<B::InnerBackend, 1>,
    pub global_step: usize,
}

#[derive(Debug, Clone)]
pub enum ModelOutput<B: AutodiffBackend> {
    Predict(Predictions<B::InnerBackend>),
    Eval(Evaluation<B::InnerBackend>),
    Train(TrainStepOutput<B>),
}

/// Serve one request in `mode`.
///
/// Parameters, optimizer, labels and features are all checked before the
/// forward pass. Predict and eval run the inference copy of the model
/// (batch-norm on running statistics, no dropout); train runs the autodiff
/// model, whose forward pass updates the batch-norm statistics before the
/// optimizer steps.
pub fn model_fn<B: AutodiffBackend>(
    model: HighRes3DNet<B>,
    features: Features<B>,
    labels: Option<Tensor<B, 4, Int>>,
    mode: Mode,
    config: &HighRes3DNetConfig,
    optimizer: Option<&mut TrainingOptimizer<B>>,
    global_step: usize,
) -> Result<ModelOutput<B>, ModelError> {
    config.validate()?;
    if model.n_classes() != config.n_classes {
        return Err(ConfigError::InvalidParam {
            name: "n_classes",
            reason: format!(
                "model predicts {} classes but {} were requested",
                model.n_classes(),
                config.n_classes
            ),
        }
        .into());
    }
    tracing::debug!(%mode, ?config, "model function parameters");

    match mode {
        Mode::Predict => {
            let volume = features.into_volume()?;
            Ok(ModelOutput::Predict(model.valid().predict(volume.inner())))
        }
        Mode::Eval => {
            let labels = labels.ok_or(ModelError::MissingLabels(mode))?;
            let volume = features.into_volume()?;

            let model = model.valid();
            let labels = labels.inner();
            let predictions = model.predict(volume.inner());

            let loss = model.loss(predictions.probabilities, labels.clone());
            let dice = dice(
                labels.float(),
                predictions.class_ids.float(),
                &LABEL_SPATIAL_AXES,
            );

            Ok(ModelOutput::Eval(Evaluation { loss, dice }))
        }
        Mode::Train => {
            let optimizer = optimizer.ok_or(ModelError::MissingOptimizer)?;
            let labels = labels.ok_or(ModelError::MissingLabels(mode))?;
            let volume = features.into_volume()?;

            let predictions = model.predict(volume);
            let loss = model.loss(predictions.probabilities, labels.clone());

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            let model = optimizer.step(model, grads);

            let class_dice = class_dice(
                labels.inner(),
                predictions.class_ids.inner(),
                config.n_classes,
            );

            Ok(ModelOutput::Train(TrainStepOutput {
                model,
                loss: loss.inner(),
                class_dice,
                global_step: global_step + 1,
            }))
        }
    }
}

pub fn class_dice<B: Backend>(
    labels: Tensor<B, 4, Int>,
    predicted: Tensor<B, 4, Int>,
    n_classes: usize,
) -> Tensor<B, 1> {
    let per_sample: Tensor<B, 2> = dice(
        one_hot(labels, n_classes),
        one_hot(predicted, n_classes),
        &VOLUME_SPATIAL_AXES,
    );

    per_sample.mean_dim(0).squeeze::<1>(0)
}

/// Logs the loss and per-class Dice every `every_n_steps` training steps,
/// starting with the first.
#[derive(Debug, Clone, Copy)]
pub struct LoggingHook {
    every_n_steps: usize,
}

impl LoggingHook {
    pub fn new(every_n_steps: usize) -> Self {
        Self { every_n_steps }
    }

    pub fn should_log(&self, global_step: usize) -> bool {
        self.every_n_steps > 0 && global_step > 0 && (global_step - 1) % self.every_n_steps == 0
    }

    pub fn after_step<B: AutodiffBackend>(&self, output: &TrainStepOutput<B>) -> bool {
        if !self.should_log(output.global_step) {
            return false;
        }

        let loss = output.loss.clone().into_scalar().elem::<f64>();
        let dice = output
            .class_dice
            .clone()
            .into_data()
            .iter::<f64>()
            .collect::<Vec<_>>();
        tracing::info!(step = output.global_step, loss, ?dice, "training");
        true
    }
}

#[derive(Config, Debug)]
pub struct HighRes3DNetEstimatorConfig {
    pub n_classes: usize,
    /// Optimizer name, see [`TrainingOptimizer::from_name`]. Can be left
    /// out when an instance is given with
    /// [`HighRes3DNetEstimator::with_optimizer`], or when only evaluating
    /// and predicting.
    #[config(default = "None")]
    pub optimizer: Option<String>,
    #[config(default = "None")]
    pub learning_rate: Option<f64>,
    #[config(default = "1")]
    pub in_channels: usize,
    #[config(default = "false")]
    pub one_batchnorm_per_resblock: bool,
    #[config(default = "0.0")]
    pub dropout_rate: f64,
    #[config(default = "LossConfig::default()")]
    pub loss: LossConfig,
    #[config(default = "None")]
    pub model_dir: Option<String>,
    /// Checkpoint (without extension) to load the initial weights from.
    #[config(default = "None")]
    pub warm_start_from: Option<String>,
    /// Accepted but not implemented; training always runs on one device.
    #[config(default = "false")]
    pub multi_gpu: bool,
    #[config(default = "100")]
    pub log_every_n_steps: usize,
}

impl HighRes3DNetEstimatorConfig {
    pub fn model_config(&self) -> HighRes3DNetConfig {
        HighRes3DNetConfig::new(self.n_classes)
            .with_in_channels(self.in_channels)
            .with_one_batchnorm_per_resblock(self.one_batchnorm_per_resblock)
            .with_dropout_rate(self.dropout_rate)
            .with_loss(self.loss.clone())
    }

    pub fn init<B: AutodiffBackend>(
        &self,
        device: &B::Device,
    ) -> Result<HighRes3DNetEstimator<B>, ModelError> {
        let model_config = self.model_config();
        model_config.validate()?;

        let optimizer = match (&self.optimizer, self.learning_rate) {
            (Some(name), Some(lr)) => Some(TrainingOptimizer::from_name(name, lr)?),
            (Some(name), None) => return Err(ConfigError::MissingLearningRate(name.clone()).into()),
            (None, _) => None,
        };

        if self.multi_gpu {
            tracing::warn!("multi_gpu is not supported, training on a single device");
        }

        let mut model = model_config.init::<B>(device);
        if let Some(path) = &self.warm_start_from {
            tracing::info!(path = %path, "warm starting from checkpoint");
            model = model
                .load_file(path, &CompactRecorder::new(), device)
                .map_err(|err| ModelError::Checkpoint(format!("{:?}", err)))?;
        }

        Ok(HighRes3DNetEstimator {
            config: self.clone(),
            model_config,
            model,
            optimizer,
            logging_hook: LoggingHook::new(self.log_every_n_steps),
            global_step: 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalSummary {
    pub loss: f64,
    pub dice: f64,
    pub batches: usize,
}

pub struct HighRes3DNetEstimator<B: AutodiffBackend> {
    config: HighRes3DNetEstimatorConfig,
    model_config: HighRes3DNetConfig,
    model: HighRes3DNet<B>,
    optimizer: Option<TrainingOptimizer<B>>,
    logging_hook: LoggingHook,
    global_step: usize,
}

impl<B: AutodiffBackend> HighRes3DNetEstimator<B> {
    pub fn with_optimizer<O>(mut self, optimizer: O, learning_rate: LearningRate) -> Self
    where
        O: Optimizer<HighRes3DNet<B>, B> + 'static,
    {
        self.optimizer = Some(TrainingOptimizer::new(optimizer, learning_rate));
        self
    }

    pub fn model(&self) -> &HighRes3DNet<B> {
        &self.model
    }

    pub fn model_config(&self) -> &HighRes3DNetConfig {
        &self.model_config
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn train_step(
        &mut self,
        volume: Tensor<B, 5>,
        labels: Tensor<B, 4, Int>,
    ) -> Result<Tensor<B::InnerBackend, 1>, ModelError> {
        let output = model_fn(
            self.model.clone(),
            volume.into(),
            Some(labels),
            Mode::Train,
            &self.model_config,
            self.optimizer.as_mut(),
            self.global_step,
        )?;

        match output {
            ModelOutput::Train(output) => {
                self.logging_hook.after_step(&output);
                self.global_step = output.global_step;
                self.model = output.model;
                Ok(output.loss)
            }
            _ => unreachable!("train mode yields a train output"),
        }
    }

    /// Train on `batches`, stopping after `max_steps` steps when given.
    /// Returns the number of steps taken.
    pub fn train<I>(&mut self, batches: I, max_steps: Option<usize>) -> Result<usize, ModelError>
    where
        I: IntoIterator<Item = (Tensor<B, 5>, Tensor<B, 4, Int>)>,
    {
        let mut steps = 0;
        for (volume, labels) in batches {
            if max_steps.is_some_and(|max| steps >= max) {
                break;
            }
            self.train_step(volume, labels)?;
            steps += 1;
        }
        Ok(steps)
    }

    pub fn evaluate<I>(&self, batches: I) -> Result<EvalSummary, ModelError>
    where
        I: IntoIterator<Item = (Tensor<B, 5>, Tensor<B, 4, Int>)>,
    {
        let mut loss_total = 0.0;
        let mut batch_count = 0;
        let mut streaming_dice = StreamingDice::new();

        for (volume, labels) in batches {
            let output = model_fn(
                self.model.clone(),
                volume.into(),
                Some(labels),
                Mode::Eval,
                &self.model_config,
                None,
                self.global_step,
            )?;

            match output {
                ModelOutput::Eval(evaluation) => {
                    loss_total += evaluation.loss.into_scalar().elem::<f64>();
                    streaming_dice.accumulate(evaluation.dice);
                    batch_count += 1;
                }
                _ => unreachable!("eval mode yields an eval output"),
            }
        }

        Ok(EvalSummary {
            loss: if batch_count == 0 {
                0.0
            } else {
                loss_total / batch_count as f64
            },
            dice: streaming_dice.value(),
            batches: batch_count,
        })
    }

    pub fn predict(
        &self,
        features: impl Into<Features<B>>,
    ) -> Result<Predictions<B::InnerBackend>, ModelError> {
        let output = model_fn(
            self.model.clone(),
            features.into(),
            None,
            Mode::Predict,
            &self.model_config,
            None,
            self.global_step,
        )?;

        match output {
            ModelOutput::Predict(predictions) => Ok(predictions),
            _ => unreachable!("predict mode yields predictions"),
        }
    }

    /// Write the model weights and the estimator config under `model_dir`.
    ///
    /// Returns the checkpoint path, or `None` when no `model_dir` is set.
    pub fn save_checkpoint(&self) -> Result<Option<PathBuf>, ModelError> {
        let Some(model_dir) = &self.config.model_dir else {
            return Ok(None);
        };
        let model_dir = Path::new(model_dir);

        std::fs::create_dir_all(model_dir)
            .map_err(|err| ModelError::Checkpoint(err.to_string()))?;
        self.config
            .save(model_dir.join("config.json"))
            .map_err(|err| ModelError::Checkpoint(err.to_string()))?;

        let path = model_dir.join("model");
        self.model
            .clone()
            .save_file(path.clone(), &CompactRecorder::new())
            .map_err(|err| ModelError::Checkpoint(format!("{:?}", err)))?;

        tracing::info!(path = %path.display(), step = self.global_step, "saved checkpoint");
        Ok(Some(path))
    }
}
