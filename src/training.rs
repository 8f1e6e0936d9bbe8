use std::path::Path;

use burn::backend::NdArray;
use burn::data::dataloader::DataLoaderBuilder;
use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::optim::AdamConfig;
use burn::prelude::*;
use burn::record::CompactRecorder;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Transaction;
use burn::train::metric::{Adaptor, ItemLazy, LossInput, LossMetric};
use burn::train::{LearnerBuilder, TrainOutput, TrainStep, ValidStep};

use crate::lung_data::{
    paired_items, split_pairs, LungDataset, SegmentationBatch, SegmentationBatcher,
};
use crate::metric::{IoUInput, IoUMetric};
use crate::unet_model::{UNet, UNetConfig};

/// Segmentation output adapted for the loss and IoU metrics.
pub struct SegmentationOutput<B: Backend> {
    /// The loss.
    pub loss: Tensor<B, 1>,

    /// The mask logits.
    pub output: Tensor<B, 4>,

    /// The target masks.
    pub targets: Tensor<B, 3, Int>,
}

impl<B: Backend> Adaptor<LossInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

impl<B: Backend> Adaptor<IoUInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> IoUInput<B> {
        IoUInput::new(sigmoid(self.output.clone()), self.targets.clone())
    }
}

impl<B: Backend> ItemLazy for SegmentationOutput<B> {
    type ItemSync = SegmentationOutput<NdArray>;

    fn sync(self) -> Self::ItemSync {
        let [loss, output, targets] = Transaction::default()
            .register(self.loss)
            .register(self.output)
            .register(self.targets)
            .execute()
            .try_into()
            .expect("Correct amount of tensor data");

        let device = &Default::default();

        SegmentationOutput {
            loss: Tensor::from_data(loss, device),
            output: Tensor::from_data(output, device),
            targets: Tensor::from_data(targets, device),
        }
    }
}

impl<B: Backend> UNet<B> {
    /// Forward pass plus binary cross-entropy with logits.
    pub fn forward_segmentation(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 3, Int>,
    ) -> SegmentationOutput<B> {
        let output = self.forward(images);
        let [batch_size, _channels, height, width] = output.dims();

        let loss = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&output.device())
            .forward(
                output.clone().reshape([batch_size, height * width]),
                targets.clone().reshape([batch_size, height * width]),
            );

        SegmentationOutput {
            loss,
            output,
            targets,
        }
    }
}

impl<B: AutodiffBackend> TrainStep<SegmentationBatch<B>, SegmentationOutput<B>> for UNet<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> TrainOutput<SegmentationOutput<B>> {
        let item = self.forward_segmentation(batch.images, batch.masks);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<SegmentationBatch<B>, SegmentationOutput<B>> for UNet<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> SegmentationOutput<B> {
        self.forward_segmentation(batch.images, batch.masks)
    }
}

#[derive(Config)]
pub struct TrainingConfig {
    pub model: UNetConfig,
    pub optimizer: AdamConfig,
    #[config(default = 75)]
    pub num_epochs: usize,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
}

/// Train a lung segmentation model on the image/mask pairs found under the
/// given directories.
///
/// The run configuration is saved to `<artifact_dir>/config.json`, epoch
/// checkpoints are written by the Learner (keeping the best validation loss),
/// and the final weights land in `<artifact_dir>/model.mpk`.
pub fn train<B: AutodiffBackend>(
    artifact_dir: &str,
    image_dir: impl AsRef<Path>,
    mask_dir: impl AsRef<Path>,
    config: TrainingConfig,
    device: B::Device,
) {
    std::fs::create_dir_all(artifact_dir).ok();
    config
        .save(format!("{artifact_dir}/config.json"))
        .expect("Config should be saved successfully");

    B::seed(config.seed);

    let items = paired_items(image_dir.as_ref(), mask_dir.as_ref())
        .expect("Image and mask directories should contain pairable files");
    let splits = split_pairs(items);

    log::info!(
        "dataset split: {} train / {} valid / {} test (test partition held out)",
        splits.train.len(),
        splits.valid.len(),
        splits.test.len()
    );

    // Dataloaders
    let dataloader_train = DataLoaderBuilder::<B, _, _>::new(SegmentationBatcher)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(LungDataset::from_items(splits.train));

    let dataloader_valid = DataLoaderBuilder::<B::InnerBackend, _, _>::new(SegmentationBatcher)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(LungDataset::from_items(splits.valid));

    // Learner config
    let learner = LearnerBuilder::new(artifact_dir)
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_train_numeric(IoUMetric::new())
        .metric_valid_numeric(IoUMetric::new())
        .metric_train_numeric(IoUMetric::thresholded())
        .metric_valid_numeric(IoUMetric::thresholded())
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary()
        .build(
            config.model.init::<B>(&device),
            config.optimizer.init(),
            config.learning_rate,
        );

    // Training
    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    model_trained
        .save_file(format!("{artifact_dir}/model"), &CompactRecorder::new())
        .expect("Trained model should be saved successfully");
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::cast::ToElement;

    type TestBackend = burn::backend::NdArray;

    #[test]
    fn forward_segmentation_produces_scalar_loss() {
        let device = Default::default();
        let model: UNet<TestBackend> = UNetConfig::new()
            .with_filters(4)
            .with_num_layers(2)
            .init(&device);

        let images = Tensor::zeros([2, 3, 16, 16], &device);
        let targets = Tensor::ones([2, 16, 16], &device);

        let output = model.forward_segmentation(images, targets);

        assert_eq!(output.loss.dims(), [1]);
        assert_eq!(output.output.dims(), [2, 1, 16, 16]);
        assert!(output.loss.into_scalar().to_f64().is_finite());
    }

    #[test]
    fn item_sync_preserves_shapes() {
        let device = Default::default();
        let model: UNet<TestBackend> = UNetConfig::new()
            .with_filters(2)
            .with_num_layers(1)
            .init(&device);

        let output = model.forward_segmentation(
            Tensor::zeros([1, 3, 8, 8], &device),
            Tensor::zeros([1, 8, 8], &device),
        );
        let synced = output.sync();

        assert_eq!(synced.loss.dims(), [1]);
        assert_eq!(synced.output.dims(), [1, 1, 8, 8]);
        assert_eq!(synced.targets.dims(), [1, 8, 8]);
    }

    #[test]
    fn training_config_defaults_match_original_run() {
        let config = TrainingConfig::new(UNetConfig::new(), AdamConfig::new());

        assert_eq!(config.num_epochs, 75);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.seed, 42);
        assert_eq!(config.learning_rate, 1.0e-3);
    }
}
