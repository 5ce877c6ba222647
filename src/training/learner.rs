use burn::{
    backend::NdArray,
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    optim::AdamConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::{Int, Transaction, backend::AutodiffBackend},
    train::{
        LearnerBuilder,
        metric::{Adaptor, ItemLazy, LossInput, LossMetric},
    },
};
use derive_new::new;

use super::metrics::{ClassMapInput, DiceMetric, HammingMetric};
use crate::dataset::{VolumeBatcher, VolumeItem};
use crate::error::ModelError;
use crate::model::{HighRes3DNet, HighRes3DNetConfig};

#[derive(new)]
pub struct SegmentationOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    /// `[batch, n_classes, depth, height, width]` probabilities.
    pub output: Tensor<B, 5>,
    pub targets: Tensor<B, 4, Int>,
}

impl<B: Backend> ItemLazy for SegmentationOutput<B> {
    type ItemSync = SegmentationOutput<NdArray>;

    fn sync(self) -> Self::ItemSync {
        let [output, loss, targets] = Transaction::default()
            .register(self.output)
            .register(self.loss)
            .register(self.targets)
            .execute()
            .try_into()
            .expect("Correct amount of tensor data");

        let device = &Default::default();

        SegmentationOutput {
            output: Tensor::from_data(output, device),
            loss: Tensor::from_data(loss, device),
            targets: Tensor::from_data(targets, device),
        }
    }
}

impl<B: Backend> Adaptor<LossInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

impl<B: Backend> Adaptor<ClassMapInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> ClassMapInput<B> {
        let predictions = self.output.clone().argmax(1).squeeze::<4>(1);
        ClassMapInput::new(predictions, self.targets.clone())
    }
}

#[derive(Config)]
pub struct TrainingConfig {
    pub model: HighRes3DNetConfig,
    pub optimizer: AdamConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 1)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
}

fn create_artifact_dir(artifact_dir: &str) -> Result<(), ModelError> {
    std::fs::create_dir_all(artifact_dir).map_err(|err| {
        ModelError::Checkpoint(format!("cannot create `{}`: {}", artifact_dir, err))
    })
}

/// Fit a fresh [`HighRes3DNet`] with burn's `Learner`, checkpointing every
/// epoch under `artifact_dir`, and save the final weights as
/// `<artifact_dir>/model`.
pub fn train<B, DT, DV>(
    artifact_dir: &str,
    config: TrainingConfig,
    device: B::Device,
    dataset_train: DT,
    dataset_valid: DV,
) -> Result<HighRes3DNet<B>, ModelError>
where
    B: AutodiffBackend,
    DT: Dataset<VolumeItem> + 'static,
    DV: Dataset<VolumeItem> + 'static,
{
    config.model.validate()?;
    create_artifact_dir(artifact_dir)?;
    config
        .save(format!("{artifact_dir}/config.json"))
        .map_err(|err| ModelError::Checkpoint(err.to_string()))?;

    B::seed(config.seed);

    let n_classes = config.model.n_classes;
    let batcher_train = VolumeBatcher::<B>::new(device.clone(), n_classes);
    let batcher_valid = VolumeBatcher::<B::InnerBackend>::new(device.clone(), n_classes);

    tracing::info!(
        train = dataset_train.len(),
        valid = dataset_valid.len(),
        batch_size = config.batch_size,
        "building dataloaders"
    );
    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset_train);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(dataset_valid);

    let learner = LearnerBuilder::new(artifact_dir)
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_train_numeric(DiceMetric::new())
        .metric_valid_numeric(DiceMetric::new())
        .metric_valid_numeric(HammingMetric::new())
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary()
        .build(
            config.model.init::<B>(&device),
            config.optimizer.init(),
            config.learning_rate,
        );

    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    tracing::info!("saving trained model");
    model_trained
        .clone()
        .save_file(format!("{artifact_dir}/model"), &CompactRecorder::new())
        .map_err(|err| ModelError::Checkpoint(format!("{:?}", err)))?;

    Ok(model_trained)
}
