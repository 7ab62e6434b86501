//! Per-class-group text tables, built once per run and cached on disk.
//!
//! Each cached table is a raw little-endian f32 file (`dim` normal values
//! followed by `dim` abnormal values) with a `.meta` sidecar holding the hash
//! of everything that produced it: backbone name, text-encoder fingerprint,
//! prompt vocabulary and class name. A hash mismatch means the table is
//! re-encoded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

use crate::class_group::ClassGroup;
use crate::config::PromptConfig;
use crate::error::TextError;

use super::encoder::TextEncoder;
use super::prompt::build_table;
use super::TextTable;

/// Text tables for every class group, keyed by group.
#[derive(Debug, Clone, Default)]
pub struct TextBank {
    tables: BTreeMap<ClassGroup, TextTable>,
}

impl TextBank {
    /// Encode (or load from `cache_dir`) the table of every class group.
    pub fn build(
        encoder: &dyn TextEncoder,
        prompts: &PromptConfig,
        backbone_name: &str,
        cache_dir: Option<&Path>,
    ) -> Result<Self, TextError> {
        let mut tables = BTreeMap::new();
        for group in ClassGroup::ALL {
            let class_name = group.prompt_name();
            let hash = cache_key(backbone_name, encoder.fingerprint(), prompts, class_name);

            let cached = cache_dir.map(|dir| dir.join(format!("{}.bin", group.name())));
            let table = match &cached {
                Some(path) if cache_valid(path, &hash) => load(path, encoder.dim())?,
                _ => {
                    let table = build_table(encoder, prompts, class_name)?;
                    if let Some(path) = &cached {
                        if let Err(e) = save(&table, path, &hash) {
                            tracing::warn!("Text table not cached: {e}");
                        }
                    }
                    table
                }
            };
            tables.insert(group, table);
        }
        tracing::info!("Text bank ready: {} class groups", tables.len());
        Ok(Self { tables })
    }

    pub fn from_tables(tables: impl IntoIterator<Item = (ClassGroup, TextTable)>) -> Self {
        Self {
            tables: tables.into_iter().collect(),
        }
    }

    pub fn get(&self, group: ClassGroup) -> Option<&TextTable> {
        self.tables.get(&group)
    }

    /// `(dim, 2)` tensor of a group's table.
    pub fn tensor(&self, group: ClassGroup, device: &Device) -> Result<Tensor, TextError> {
        let table = self
            .get(group)
            .ok_or_else(|| TextError::MissingTable(group.name().to_string()))?;
        table.to_tensor(device).map_err(|e| TextError::Encoder {
            message: format!("Failed to build text tensor for {group}: {e}"),
        })
    }

    /// Tensors for every group, built once so the training loop can index
    /// them per batch.
    pub fn tensors(&self, device: &Device) -> Result<BTreeMap<ClassGroup, Tensor>, TextError> {
        self.tables
            .keys()
            .map(|&group| Ok((group, self.tensor(group, device)?)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Hash of everything a table depends on.
pub fn cache_key(
    backbone_name: &str,
    encoder_fingerprint: &str,
    prompts: &PromptConfig,
    class_name: &str,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(backbone_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(encoder_fingerprint.as_bytes());
    hasher.update(b"\0");
    hasher.update(class_name.as_bytes());
    for section in [&prompts.normal_states, &prompts.abnormal_states, &prompts.templates] {
        hasher.update(b"\x1e");
        for item in section {
            hasher.update(item.as_bytes());
            hasher.update(b"\0");
        }
    }
    hasher.finalize().to_hex().to_string()
}

fn meta_path(path: &Path) -> PathBuf {
    path.with_extension("meta")
}

/// Whether the sidecar of `path` records `hash`.
fn cache_valid(path: &Path, hash: &str) -> bool {
    if !path.exists() {
        return false;
    }
    let Ok(content) = std::fs::read_to_string(meta_path(path)) else {
        return false;
    };
    content.lines().any(|line| line == format!("hash={hash}"))
}

fn save(table: &TextTable, path: &Path, hash: &str) -> Result<(), TextError> {
    let cache_error = |e: std::io::Error| TextError::Cache {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(cache_error)?;
    }
    let bytes: Vec<u8> = table
        .normal()
        .iter()
        .chain(table.abnormal())
        .flat_map(|f| f.to_le_bytes())
        .collect();
    std::fs::write(path, &bytes).map_err(cache_error)?;
    std::fs::write(
        meta_path(path),
        format!("hash={hash}\ndim={}\n", table.dim()),
    )
    .map_err(cache_error)?;
    tracing::debug!("Cached text table at {:?}", path);
    Ok(())
}

fn load(path: &Path, dim: usize) -> Result<TextTable, TextError> {
    let bytes = std::fs::read(path).map_err(|e| TextError::Cache {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    if bytes.len() != 2 * dim * 4 {
        return Err(TextError::Cache {
            path: path.to_path_buf(),
            message: format!("expected {} bytes for dim {dim}, found {}", 2 * dim * 4, bytes.len()),
        });
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let (normal, abnormal) = values.split_at(dim);
    tracing::debug!("Loaded cached text table from {:?}", path);
    TextTable::new(normal.to_vec(), abnormal.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTextEncoder;

    #[test]
    fn test_bank_covers_every_group() {
        let encoder = FakeTextEncoder::new(16);
        let bank = TextBank::build(&encoder, &PromptConfig::default(), "tiny", None).unwrap();
        assert_eq!(bank.len(), ClassGroup::ALL.len());
        let tensor = bank.tensor(ClassGroup::Brain, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[16, 2]);
    }

    #[test]
    fn test_cache_round_trip_skips_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = PromptConfig::default();
        let encoder = FakeTextEncoder::new(16);
        let first = TextBank::build(&encoder, &prompts, "tiny", Some(dir.path())).unwrap();
        let calls = encoder.calls();
        assert!(calls > 0);

        let second = TextBank::build(&encoder, &prompts, "tiny", Some(dir.path())).unwrap();
        assert_eq!(encoder.calls(), calls);
        for group in ClassGroup::ALL {
            assert_eq!(first.get(group), second.get(group));
        }
    }

    #[test]
    fn test_changed_vocabulary_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FakeTextEncoder::new(16);
        let mut prompts = PromptConfig::default();
        TextBank::build(&encoder, &prompts, "tiny", Some(dir.path())).unwrap();
        let calls = encoder.calls();

        prompts.templates.push("an image of a {}.".to_string());
        TextBank::build(&encoder, &prompts, "tiny", Some(dir.path())).unwrap();
        assert!(encoder.calls() > calls);
    }

    #[test]
    fn test_replaced_text_model_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = PromptConfig::default();
        let old = FakeTextEncoder::new(16).with_fingerprint("weights-v1");
        let first = TextBank::build(&old, &prompts, "tiny", Some(dir.path())).unwrap();

        let new = FakeTextEncoder::new(16)
            .with_fingerprint("weights-v2")
            .with_salt("v2");
        let second = TextBank::build(&new, &prompts, "tiny", Some(dir.path())).unwrap();
        assert!(new.calls() > 0);
        assert_ne!(first.get(ClassGroup::Liver), second.get(ClassGroup::Liver));
    }

    #[test]
    fn test_cache_key_depends_on_inputs() {
        let prompts = PromptConfig::default();
        let a = cache_key("ViT-L-14-336", "f0", &prompts, "Liver");
        assert_eq!(a, cache_key("ViT-L-14-336", "f0", &prompts, "Liver"));
        assert_ne!(a, cache_key("ViT-B-16", "f0", &prompts, "Liver"));
        assert_ne!(a, cache_key("ViT-L-14-336", "f1", &prompts, "Liver"));
        assert_ne!(a, cache_key("ViT-L-14-336", "f0", &prompts, "Brain"));
    }

    #[test]
    fn test_truncated_cache_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Brain.bin");
        std::fs::write(&path, [0u8; 12]).unwrap();
        assert!(matches!(load(&path, 16), Err(TextError::Cache { .. })));
    }
}
