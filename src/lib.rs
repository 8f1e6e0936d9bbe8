//! U-Net lung segmentation training on chest X-rays, built on burn.
//!
//! The pipeline pairs image files with mask files by filename convention,
//! resizes everything to a fixed resolution, splits the pairs into
//! train/validation/test partitions with fixed seeds, and delegates model
//! training, metric tracking and checkpointing to burn's Learner.

pub mod infer;
pub mod lung_data;
pub mod metric;
pub mod training;
pub mod unet_model;

pub use lung_data::{LungDataset, SegmentationBatch, SegmentationBatcher};
pub use metric::IoUMetric;
pub use training::TrainingConfig;
pub use unet_model::{UNet, UNetConfig};
