use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::transform::{Mapper, MapperDataset};
use burn::data::dataset::{Dataset, InMemDataset};
use burn::prelude::*;
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width of every image and mask after preprocessing.
pub const WIDTH: usize = 1024;
/// Height of every image and mask after preprocessing.
pub const HEIGHT: usize = 1024;

/// Fraction of all pairs held out as the test partition.
pub const TEST_FRACTION: f64 = 0.16667;
/// Fraction of the remaining pairs held out for validation.
pub const VALID_FRACTION: f64 = 0.166667;
/// Seed for the test partition shuffle.
pub const TEST_SEED: u64 = 42;
/// Seed for the validation partition shuffle.
pub const VALID_SEED: u64 = 32;

/// Error type for dataset construction.
#[derive(Error, Debug)]
pub enum DatasetError {
    /// I/O operation error.
    #[error("I/O error: `{0}`")]
    Io(String),

    /// No image/mask pairs were found.
    #[error("no image/mask pairs found under `{0}`")]
    Empty(String),
}

/// An image/mask path pair on disk.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SegmentationItemRaw {
    /// Chest X-ray image path.
    pub image_path: PathBuf,

    /// Lung mask path.
    pub mask_path: PathBuf,
}

/// A loaded and preprocessed image/mask pair.
///
/// The image is a row-major RGB buffer of `WIDTH * HEIGHT * 3` bytes; the mask
/// is reduced to its first channel, `WIDTH * HEIGHT` bytes of raw 8-bit values.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationItem {
    /// Image bytes, `[H, W, 3]`.
    pub image: Vec<u8>,

    /// Mask bytes, `[H, W]`.
    pub mask: Vec<u8>,
}

/// List the file names (not paths) of a directory's entries.
fn list_file_names(dir: &Path) -> Result<BTreeSet<String>, DatasetError> {
    let entries = std::fs::read_dir(dir).map_err(|err| DatasetError::Io(err.to_string()))?;

    let mut names = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|err| DatasetError::Io(err.to_string()))?;
        if entry.path().is_file() {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }

    Ok(names)
}

/// Pair chest X-ray images with their lung masks by filename convention.
///
/// Two conventions are merged:
/// - identical file names present in both directories,
/// - `<stem>_mask*.png` in the mask directory, paired with `<stem>.png` in the
///   image directory.
///
/// Files matching neither convention are silently excluded. Both lists are
/// sorted lexically, so pairing holds by index.
///
/// # Returns
///
/// Equal-length `(images, masks)` path lists.
pub fn pair_images_with_masks(
    image_dir: &Path,
    mask_dir: &Path,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>), DatasetError> {
    let image_names = list_file_names(image_dir)?;
    let mask_names = list_file_names(mask_dir)?;

    let mut images = Vec::new();
    let mut masks = Vec::new();

    // Same file name in both directories.
    for name in image_names.intersection(&mask_names) {
        images.push(name.clone());
        masks.push(name.clone());
    }

    // "<stem>_mask*.png" in the mask directory.
    for name in &mask_names {
        if let Some(stem) = name.strip_suffix(".png") {
            if let Some((prefix, _)) = stem.split_once("_mask") {
                images.push(format!("{prefix}.png"));
                masks.push(name.clone());
            }
        }
    }

    images.sort();
    masks.sort();

    let images = images.into_iter().map(|name| image_dir.join(name)).collect();
    let masks = masks.into_iter().map(|name| mask_dir.join(name)).collect();

    Ok((images, masks))
}

/// Pair the two directories and zip the result into raw dataset items.
pub fn paired_items(
    image_dir: &Path,
    mask_dir: &Path,
) -> Result<Vec<SegmentationItemRaw>, DatasetError> {
    let (images, masks) = pair_images_with_masks(image_dir, mask_dir)?;

    if images.is_empty() {
        return Err(DatasetError::Empty(image_dir.display().to_string()));
    }

    log::info!("paired {} chest X-ray images with lung masks", images.len());

    Ok(images
        .into_iter()
        .zip(masks)
        .map(|(image_path, mask_path)| SegmentationItemRaw {
            image_path,
            mask_path,
        })
        .collect())
}

/// Shuffle `items` with a fixed seed and split off `ceil(len * test_fraction)`
/// of them.
///
/// # Returns
///
/// `(rest, held_out)`.
pub fn train_test_split<T>(mut items: Vec<T>, test_fraction: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);

    let num_test = (items.len() as f64 * test_fraction).ceil() as usize;
    let rest = items.split_off(num_test.min(items.len()));

    (rest, items)
}

/// Train/validation/test partitions of the raw pairs.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    /// Training pairs.
    pub train: Vec<SegmentationItemRaw>,
    /// Validation pairs.
    pub valid: Vec<SegmentationItemRaw>,
    /// Held-out test pairs.
    pub test: Vec<SegmentationItemRaw>,
}

/// Two-stage split with fixed ratios and fixed seeds: first the test
/// partition is carved off, then the validation partition is carved off the
/// remainder.
pub fn split_pairs(items: Vec<SegmentationItemRaw>) -> DatasetSplits {
    let (rest, test) = train_test_split(items, TEST_FRACTION, TEST_SEED);
    let (train, valid) = train_test_split(rest, VALID_FRACTION, VALID_SEED);

    DatasetSplits { train, valid, test }
}

/// Loads a raw path pair from disk and resizes it to the training resolution.
///
/// The mask is reduced to its first channel.
struct PathToSegmentationItem;

impl Mapper<SegmentationItemRaw, SegmentationItem> for PathToSegmentationItem {
    fn map(&self, item: &SegmentationItemRaw) -> SegmentationItem {
        let image = image::open(&item.image_path)
            .unwrap()
            .resize_exact(WIDTH as u32, HEIGHT as u32, FilterType::Triangle)
            .into_rgb8()
            .into_raw();

        let mask = image::open(&item.mask_path)
            .unwrap()
            .resize_exact(WIDTH as u32, HEIGHT as u32, FilterType::Triangle)
            .into_rgb8()
            .pixels()
            .map(|pixel| pixel.0[0])
            .collect();

        SegmentationItem { image, mask }
    }
}

type PairedDataset =
    MapperDataset<InMemDataset<SegmentationItemRaw>, PathToSegmentationItem, SegmentationItemRaw>;

/// Chest X-ray lung segmentation dataset.
///
/// Items are loaded from disk lazily, on access.
pub struct LungDataset {
    dataset: PairedDataset,
}

impl Dataset<SegmentationItem> for LungDataset {
    fn get(&self, index: usize) -> Option<SegmentationItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl LungDataset {
    /// Create a dataset from an image directory and a mask directory.
    pub fn from_dirs(image_dir: &Path, mask_dir: &Path) -> Result<Self, DatasetError> {
        Ok(Self::from_items(paired_items(image_dir, mask_dir)?))
    }

    /// Create a dataset from already-paired raw items.
    pub fn from_items(items: Vec<SegmentationItemRaw>) -> Self {
        let dataset = MapperDataset::new(InMemDataset::new(items), PathToSegmentationItem);

        Self { dataset }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SegmentationBatcher;

#[derive(Clone, Debug)]
pub struct SegmentationBatch<B: Backend> {
    /// Images, `[batch_size, 3, H, W]`, raw 0..255 values.
    pub images: Tensor<B, 4>,

    /// Binary masks, `[batch_size, H, W]`, values in {0, 1}.
    pub masks: Tensor<B, 3, Int>,
}

impl<B: Backend> Batcher<B, SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher {
    fn batch(&self, items: Vec<SegmentationItem>, device: &B::Device) -> SegmentationBatch<B> {
        let images = items
            .iter()
            .map(|item| TensorData::new(item.image.clone(), Shape::new([HEIGHT, WIDTH, 3])))
            .map(|data| {
                Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), device)
                    // permute(2, 0, 1)
                    .swap_dims(2, 1) // [H, C, W]
                    .swap_dims(1, 0) // [C, H, W]
            })
            .collect();

        let masks = items
            .iter()
            .map(|item| TensorData::new(item.mask.clone(), Shape::new([HEIGHT, WIDTH])))
            .map(|data| Tensor::<B, 2>::from_data(data.convert::<B::FloatElem>(), device))
            .map(|mask| (mask / 255).round().int())
            .collect();

        let images = Tensor::stack(images, 0);
        let masks = Tensor::stack(masks, 0);

        SegmentationBatch { images, masks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    type TestBackend = burn::backend::NdArray;

    fn write_rgb(dir: &Path, name: &str, value: u8) {
        RgbImage::from_pixel(8, 8, Rgb([value, value, value]))
            .save(dir.join(name))
            .unwrap();
    }

    fn write_gray(dir: &Path, name: &str, value: u8) {
        GrayImage::from_pixel(8, 8, Luma([value]))
            .save(dir.join(name))
            .unwrap();
    }

    fn file_name(path: &Path) -> &str {
        path.file_name().unwrap().to_str().unwrap()
    }

    #[test]
    fn pairs_identical_names() {
        let images = tempfile::tempdir().unwrap();
        let masks = tempfile::tempdir().unwrap();

        write_rgb(images.path(), "b.png", 0);
        write_rgb(images.path(), "a.png", 0);
        write_gray(masks.path(), "a.png", 255);
        write_gray(masks.path(), "b.png", 255);

        let (images, masks) = pair_images_with_masks(images.path(), masks.path()).unwrap();

        assert_eq!(images.len(), 2);
        assert_eq!(masks.len(), 2);
        assert_eq!(file_name(&images[0]), "a.png");
        assert_eq!(file_name(&masks[0]), "a.png");
        assert_eq!(file_name(&images[1]), "b.png");
        assert_eq!(file_name(&masks[1]), "b.png");
    }

    #[test]
    fn pairs_mask_suffix() {
        let images = tempfile::tempdir().unwrap();
        let masks = tempfile::tempdir().unwrap();

        write_rgb(images.path(), "x.png", 0);
        write_rgb(images.path(), "y.png", 0);
        write_gray(masks.path(), "x_mask.png", 255);
        write_gray(masks.path(), "y_mask.png", 255);

        let (images, masks) = pair_images_with_masks(images.path(), masks.path()).unwrap();

        assert_eq!(images.len(), masks.len());
        assert_eq!(file_name(&images[0]), "x.png");
        assert_eq!(file_name(&masks[0]), "x_mask.png");
        assert_eq!(file_name(&images[1]), "y.png");
        assert_eq!(file_name(&masks[1]), "y_mask.png");
    }

    #[test]
    fn merges_both_conventions_sorted() {
        let images = tempfile::tempdir().unwrap();
        let masks = tempfile::tempdir().unwrap();

        write_rgb(images.path(), "shared.png", 0);
        write_rgb(images.path(), "annotated.png", 0);
        write_gray(masks.path(), "shared.png", 255);
        write_gray(masks.path(), "annotated_mask.png", 255);

        let (images, masks) = pair_images_with_masks(images.path(), masks.path()).unwrap();

        assert_eq!(images.len(), 2);
        assert_eq!(masks.len(), 2);
        // Both lists are sorted; index alignment holds.
        assert_eq!(file_name(&images[0]), "annotated.png");
        assert_eq!(file_name(&masks[0]), "annotated_mask.png");
        assert_eq!(file_name(&images[1]), "shared.png");
        assert_eq!(file_name(&masks[1]), "shared.png");
    }

    #[test]
    fn orphans_silently_dropped() {
        let images = tempfile::tempdir().unwrap();
        let masks = tempfile::tempdir().unwrap();

        write_rgb(images.path(), "paired.png", 0);
        write_rgb(images.path(), "orphan_image.png", 0);
        write_gray(masks.path(), "paired.png", 255);
        write_gray(masks.path(), "orphan.jpg", 255);

        let (images, masks) = pair_images_with_masks(images.path(), masks.path()).unwrap();

        assert_eq!(images.len(), 1);
        assert_eq!(masks.len(), 1);
        assert_eq!(file_name(&images[0]), "paired.png");
    }

    #[test]
    fn split_sizes_follow_fractions() {
        let items: Vec<usize> = (0..60).collect();
        let (rest, test) = train_test_split(items, TEST_FRACTION, TEST_SEED);

        // ceil(60 * 0.16667) = 11
        assert_eq!(test.len(), 11);
        assert_eq!(rest.len(), 49);
    }

    #[test]
    fn split_is_deterministic_and_disjoint() {
        let items: Vec<usize> = (0..30).collect();

        let (rest_a, test_a) = train_test_split(items.clone(), TEST_FRACTION, TEST_SEED);
        let (rest_b, test_b) = train_test_split(items, TEST_FRACTION, TEST_SEED);

        assert_eq!(rest_a, rest_b);
        assert_eq!(test_a, test_b);

        let mut all: Vec<usize> = rest_a.iter().chain(test_a.iter()).copied().collect();
        all.sort();
        assert_eq!(all, (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn two_stage_split_covers_input() {
        let items: Vec<SegmentationItemRaw> = (0..24)
            .map(|i| SegmentationItemRaw {
                image_path: PathBuf::from(format!("{i}.png")),
                mask_path: PathBuf::from(format!("{i}_mask.png")),
            })
            .collect();

        let splits = split_pairs(items);

        assert_eq!(splits.train.len() + splits.valid.len() + splits.test.len(), 24);
        assert!(!splits.train.is_empty());
        assert!(!splits.valid.is_empty());
        assert!(!splits.test.is_empty());
    }

    #[test]
    fn mapper_resizes_and_selects_mask_channel() {
        let dir = tempfile::tempdir().unwrap();
        write_rgb(dir.path(), "cxr.png", 100);
        write_gray(dir.path(), "cxr_mask.png", 255);

        let dataset = LungDataset::from_items(vec![SegmentationItemRaw {
            image_path: dir.path().join("cxr.png"),
            mask_path: dir.path().join("cxr_mask.png"),
        }]);

        let item = dataset.get(0).unwrap();

        assert_eq!(item.image.len(), WIDTH * HEIGHT * 3);
        assert_eq!(item.mask.len(), WIDTH * HEIGHT);
        assert!(item.mask.iter().all(|&v| v == 255));
    }

    #[test]
    fn batcher_shapes_and_binary_masks() {
        let device = Default::default();
        let batcher = SegmentationBatcher;

        let items = vec![
            SegmentationItem {
                image: vec![0; WIDTH * HEIGHT * 3],
                mask: vec![0; WIDTH * HEIGHT],
            },
            SegmentationItem {
                image: vec![255; WIDTH * HEIGHT * 3],
                mask: vec![255; WIDTH * HEIGHT],
            },
        ];

        let batch: SegmentationBatch<TestBackend> = batcher.batch(items, &device);

        assert_eq!(batch.images.dims(), [2, 3, HEIGHT, WIDTH]);
        assert_eq!(batch.masks.dims(), [2, HEIGHT, WIDTH]);

        // First mask is all zeros, second is all ones.
        let ones: i64 = batch.masks.sum().into_scalar();
        assert_eq!(ones, (WIDTH * HEIGHT) as i64);
    }
}
