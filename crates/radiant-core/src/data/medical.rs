//! Medical anomaly benchmark on disk.
//!
//! ```text
//! {data_dir}/{Brain_AD,Liver_AD,RESC_AD,OCT17_AD,ChestXray_AD,Camelyon16_AD}/
//!     valid/good/img/*            normal images
//!     valid/Ungood/img/*          anomalous images
//!     valid/Ungood/anomaly_mask/* masks, same file name (pixel-supervised groups)
//!     test/…                      same layout, held-out target split
//! ```
//!
//! Zero-shot training uses the `valid` split of every group except the target;
//! evaluation uses the target's `test` split.

use std::path::{Path, PathBuf};

use ndarray::{s, Array2, Array3, Array4};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::class_group::ClassGroup;
use crate::error::DataError;

use super::discovery::discover_images;
use super::preprocess::{load_image, preprocess_image, preprocess_mask};
use super::{TestSample, TrainBatch, TestSource, TrainSource};

const NORMAL_DIR: &str = "good";
const ANOMALOUS_DIR: &str = "Ungood";
const IMAGE_DIR: &str = "img";
const MASK_DIR: &str = "anomaly_mask";

/// One image on disk with its label and optional mask.
#[derive(Debug, Clone, PartialEq)]
struct Entry {
    image: PathBuf,
    label: u8,
    mask: Option<PathBuf>,
}

impl Entry {
    fn load_mask(&self, image_size: u32) -> Result<Array2<f32>, DataError> {
        match &self.mask {
            Some(path) => Ok(preprocess_mask(&load_image(path)?, image_size)),
            None => {
                let size = image_size as usize;
                Ok(Array2::zeros((size, size)))
            }
        }
    }
}

/// Collect `{group_dir}/{split}/{good,Ungood}`.
///
/// Anomalous images of a pixel-supervised group must have a mask.
fn load_split(group: ClassGroup, group_dir: &Path, split: &str) -> Result<Vec<Entry>, DataError> {
    let split_dir = group_dir.join(split);
    if !split_dir.is_dir() {
        return Err(DataError::MissingSplit(split_dir));
    }

    let mut entries: Vec<Entry> = discover_images(&split_dir.join(NORMAL_DIR).join(IMAGE_DIR))
        .into_iter()
        .map(|image| Entry {
            image,
            label: 0,
            mask: None,
        })
        .collect();

    let mask_dir = split_dir.join(ANOMALOUS_DIR).join(MASK_DIR);
    for image in discover_images(&split_dir.join(ANOMALOUS_DIR).join(IMAGE_DIR)) {
        let mask = if group.has_pixel_masks() {
            let Some(file_name) = image.file_name() else {
                continue;
            };
            let mask = mask_dir.join(file_name);
            if !mask.is_file() {
                return Err(DataError::MissingMask(image));
            }
            Some(mask)
        } else {
            None
        };
        entries.push(Entry {
            image,
            label: 1,
            mask,
        });
    }

    tracing::debug!(
        "{}/{}: {} images ({} anomalous)",
        group,
        split,
        entries.len(),
        entries.iter().filter(|e| e.label == 1).count()
    );
    Ok(entries)
}

/// Training set for the zero-shot regime: every class group except the target.
pub struct MedicalTrainSet {
    groups: Vec<(ClassGroup, Vec<Entry>)>,
    /// `(group slot, entry indices)` per batch.
    batches: Vec<(usize, Vec<usize>)>,
    image_size: u32,
    batch_size: usize,
}

impl MedicalTrainSet {
    /// Index the `valid` splits of all non-target groups and form the first
    /// epoch's batches.
    pub fn open(
        data_dir: &Path,
        target: ClassGroup,
        image_size: u32,
        batch_size: usize,
        rng: &mut StdRng,
    ) -> Result<Self, DataError> {
        let mut groups = Vec::new();
        for group in ClassGroup::ALL.into_iter().filter(|&g| g != target) {
            let entries = load_split(group, &data_dir.join(group.dataset_dir()), "valid")?;
            if entries.is_empty() {
                tracing::warn!("Class group {} has no training images", group);
                continue;
            }
            groups.push((group, entries));
        }
        if groups.is_empty() {
            return Err(DataError::Empty {
                name: format!("zero-shot training set for {target}"),
            });
        }

        let mut set = Self {
            groups,
            batches: Vec::new(),
            image_size,
            batch_size: batch_size.max(1),
        };
        set.reshuffle(rng);
        tracing::info!(
            "Training set: {} images across {} class groups, {} batches",
            set.image_count(),
            set.groups.len(),
            set.batches.len()
        );
        Ok(set)
    }

    pub fn image_count(&self) -> usize {
        self.groups.iter().map(|(_, entries)| entries.len()).sum()
    }

    pub fn groups(&self) -> impl Iterator<Item = ClassGroup> + '_ {
        self.groups.iter().map(|(group, _)| *group)
    }
}

impl TrainSource for MedicalTrainSet {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn batch(&self, index: usize) -> Result<TrainBatch, DataError> {
        let (slot, indices) = self.batches.get(index).ok_or(DataError::OutOfRange {
            index,
            len: self.batches.len(),
        })?;
        let (group, entries) = &self.groups[*slot];

        let size = self.image_size as usize;
        let mut images = Array4::<f32>::zeros((indices.len(), 3, size, size));
        let mut masks = Array3::<f32>::zeros((indices.len(), size, size));
        let mut labels = Vec::with_capacity(indices.len());
        for (i, &entry_index) in indices.iter().enumerate() {
            let entry = &entries[entry_index];
            let image = preprocess_image(&load_image(&entry.image)?, self.image_size);
            images.slice_mut(s![i, .., .., ..]).assign(&image.slice(s![0, .., .., ..]));
            masks.slice_mut(s![i, .., ..]).assign(&entry.load_mask(self.image_size)?);
            labels.push(entry.label as f32);
        }

        Ok(TrainBatch {
            images,
            labels,
            masks,
            group: *group,
        })
    }

    /// Shuffle images within each group, chunk into batches, then shuffle the
    /// batch order across groups.
    fn reshuffle(&mut self, rng: &mut StdRng) {
        let mut batches = Vec::new();
        for (slot, (_, entries)) in self.groups.iter().enumerate() {
            let mut order: Vec<usize> = (0..entries.len()).collect();
            order.shuffle(rng);
            for chunk in order.chunks(self.batch_size) {
                batches.push((slot, chunk.to_vec()));
            }
        }
        batches.shuffle(rng);
        self.batches = batches;
    }
}

/// The target group's `test` split, one image per sample.
pub struct MedicalTestSet {
    group: ClassGroup,
    entries: Vec<Entry>,
    image_size: u32,
}

impl MedicalTestSet {
    pub fn open(data_dir: &Path, group: ClassGroup, image_size: u32) -> Result<Self, DataError> {
        let entries = load_split(group, &data_dir.join(group.dataset_dir()), "test")?;
        if entries.is_empty() {
            return Err(DataError::Empty {
                name: format!("{group} test split"),
            });
        }
        tracing::info!("Test set: {} images for {}", entries.len(), group);
        Ok(Self {
            group,
            entries,
            image_size,
        })
    }

    pub fn group(&self) -> ClassGroup {
        self.group
    }
}

impl TestSource for MedicalTestSet {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn sample(&self, index: usize) -> Result<TestSample, DataError> {
        let entry = self.entries.get(index).ok_or(DataError::OutOfRange {
            index,
            len: self.entries.len(),
        })?;
        Ok(TestSample {
            image: preprocess_image(&load_image(&entry.image)?, self.image_size),
            label: entry.label,
            mask: entry.load_mask(self.image_size)?,
        })
    }
}
