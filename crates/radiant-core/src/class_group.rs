//! Anomaly class groups and their signed-index convention.
//!
//! Every dataset belongs to a class group identified by a signed index. The
//! sign says whether the group ships pixel-level masks (positive) or only
//! image-level labels (negative); the magnitude distinguishes classes within a
//! sign. Index 0 is reserved.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// A dataset-defined anomaly category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClassGroup {
    Brain,
    Liver,
    #[serde(rename = "Retina_RESC")]
    RetinaResc,
    #[serde(rename = "Retina_OCT2017")]
    RetinaOct2017,
    Chest,
    Histopathology,
}

impl ClassGroup {
    /// All known class groups, pixel-supervised groups first.
    pub const ALL: [ClassGroup; 6] = [
        ClassGroup::RetinaResc,
        ClassGroup::Liver,
        ClassGroup::Brain,
        ClassGroup::Histopathology,
        ClassGroup::Chest,
        ClassGroup::RetinaOct2017,
    ];

    /// Signed class-group index.
    pub fn index(self) -> i32 {
        match self {
            ClassGroup::Brain => 3,
            ClassGroup::Liver => 2,
            ClassGroup::RetinaResc => 1,
            ClassGroup::RetinaOct2017 => -1,
            ClassGroup::Chest => -2,
            ClassGroup::Histopathology => -3,
        }
    }

    /// Look up a class group by its signed index.
    pub fn from_index(index: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.index() == index)
    }

    /// Whether the group's datasets carry pixel-level ground truth.
    pub fn has_pixel_masks(self) -> bool {
        self.index() > 0
    }

    /// Canonical name, used for config values and checkpoint file names.
    pub fn name(self) -> &'static str {
        match self {
            ClassGroup::Brain => "Brain",
            ClassGroup::Liver => "Liver",
            ClassGroup::RetinaResc => "Retina_RESC",
            ClassGroup::RetinaOct2017 => "Retina_OCT2017",
            ClassGroup::Chest => "Chest",
            ClassGroup::Histopathology => "Histopathology",
        }
    }

    /// Natural-language name substituted into text prompts.
    pub fn prompt_name(self) -> &'static str {
        match self {
            ClassGroup::Brain => "Brain",
            ClassGroup::Liver => "Liver",
            ClassGroup::RetinaResc => "retinal OCT",
            ClassGroup::RetinaOct2017 => "retinal OCT",
            ClassGroup::Chest => "Chest X-ray film",
            ClassGroup::Histopathology => "histopathological image",
        }
    }

    /// Directory holding this group's dataset under the data root.
    pub fn dataset_dir(self) -> &'static str {
        match self {
            ClassGroup::Brain => "Brain_AD",
            ClassGroup::Liver => "Liver_AD",
            ClassGroup::RetinaResc => "RESC_AD",
            ClassGroup::RetinaOct2017 => "OCT17_AD",
            ClassGroup::Chest => "ChestXray_AD",
            ClassGroup::Histopathology => "Camelyon16_AD",
        }
    }
}

impl fmt::Display for ClassGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ClassGroup {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| DataError::UnknownClassGroup(s.to_string()))
    }
}
