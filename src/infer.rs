use std::fs;
use std::path::Path;

use burn::config::Config;
use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::activation::sigmoid;
use burn::tensor::{Shape, Tensor, TensorData};
use image::imageops::FilterType;

use crate::lung_data::{HEIGHT, WIDTH};
use crate::training::TrainingConfig;
use crate::unet_model::{UNet, UNetRecord};

/// Predict the lung mask for a single chest X-ray using persisted artifacts.
///
/// Loads the run config and the trained weights from `artifact_dir`, resizes
/// the source image to the training resolution, and writes the thresholded
/// mask to `<output_dir>/<stem>_mask.png`.
pub fn infer<B: Backend>(
    artifact_dir: &Path,
    source_image: &Path,
    output_dir: &Path,
    device: &B::Device,
) {
    let config = TrainingConfig::load(artifact_dir.join("config.json"))
        .expect("Config should exist for the model; run train first");
    let record: UNetRecord<B> = CompactRecorder::new()
        .load(artifact_dir.join("model"), device)
        .expect("Trained model should exist; run train first");

    let model: UNet<B> = config.model.init(device).load_record(record);

    let image = image::open(source_image)
        .expect("Source image should be readable")
        .resize_exact(WIDTH as u32, HEIGHT as u32, FilterType::Triangle)
        .into_rgb8()
        .into_raw();

    let input = Tensor::<B, 3>::from_data(
        TensorData::new(image, Shape::new([HEIGHT, WIDTH, 3])).convert::<B::FloatElem>(),
        device,
    )
    .swap_dims(2, 1)
    .swap_dims(1, 0)
    .reshape([1, 3, HEIGHT, WIDTH]);

    let probabilities = sigmoid(model.forward(input));
    // 0.0 -> black, 1.0 -> white
    let mask: Tensor<B, 2> = probabilities.round().mul_scalar(255.0).reshape([HEIGHT, WIDTH]);

    let bytes = mask
        .into_data()
        .convert::<u8>()
        .to_vec::<u8>()
        .expect("Mask data should convert to bytes");
    let mask_image = image::GrayImage::from_raw(WIDTH as u32, HEIGHT as u32, bytes)
        .expect("Mask buffer should match the training resolution");

    fs::create_dir_all(output_dir).ok();
    let stem = source_image
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");

    mask_image
        .save(output_dir.join(format!("{stem}_mask.png")))
        .expect("Predicted mask should be saved");
}
