//! Prompt ensembling.
//!
//! Each state phrase ("damaged {}") is filled with the class name, every
//! template ("a photo of the {}.") is filled with the result, and the encoded
//! prompts are averaged into one unit-norm embedding per state set.

use crate::config::PromptConfig;
use crate::error::TextError;
use crate::math::{l2_normalize_in_place, mean_vector};

use super::encoder::TextEncoder;
use super::TextTable;

const PLACEHOLDER: &str = "{}";

/// Every `template × state` prompt for one state set.
pub fn expand_prompts(states: &[String], templates: &[String], class_name: &str) -> Vec<String> {
    states
        .iter()
        .map(|state| state.replace(PLACEHOLDER, class_name))
        .flat_map(|state| {
            templates
                .iter()
                .map(move |template| template.replace(PLACEHOLDER, &state))
        })
        .collect()
}

/// Encode one state set into a single unit-norm embedding.
fn encode_state_set(
    encoder: &dyn TextEncoder,
    prompts: Vec<String>,
    class_name: &str,
) -> Result<Vec<f32>, TextError> {
    if prompts.is_empty() {
        return Err(TextError::EmptyEnsemble {
            class_name: class_name.to_string(),
        });
    }
    let mut embeddings = encoder.encode_batch(&prompts)?;
    if embeddings.len() != prompts.len() {
        return Err(TextError::MissingEmbeddings {
            expected: prompts.len(),
            actual: embeddings.len(),
        });
    }
    embeddings.iter_mut().for_each(|e| l2_normalize_in_place(e));

    let mut mean = mean_vector(&embeddings).ok_or_else(|| TextError::EmptyEnsemble {
        class_name: class_name.to_string(),
    })?;
    l2_normalize_in_place(&mut mean);
    Ok(mean)
}

/// Build the normal/abnormal table for a class name.
pub fn build_table(
    encoder: &dyn TextEncoder,
    prompts: &PromptConfig,
    class_name: &str,
) -> Result<TextTable, TextError> {
    let normal = expand_prompts(&prompts.normal_states, &prompts.templates, class_name);
    let abnormal = expand_prompts(&prompts.abnormal_states, &prompts.templates, class_name);
    tracing::debug!(
        "Encoding prompt ensemble for '{}': {} normal, {} abnormal prompts",
        class_name,
        normal.len(),
        abnormal.len()
    );
    TextTable::new(
        encode_state_set(encoder, normal, class_name)?,
        encode_state_set(encoder, abnormal, class_name)?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTextEncoder;

    fn owned(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_expand_prompts_is_state_major() {
        let prompts = expand_prompts(
            &owned(&["{}", "damaged {}"]),
            &owned(&["a photo of a {}.", "this is the {}."]),
            "Liver",
        );
        assert_eq!(
            prompts,
            vec![
                "a photo of a Liver.",
                "this is the Liver.",
                "a photo of a damaged Liver.",
                "this is the damaged Liver.",
            ]
        );
    }

    #[test]
    fn test_table_columns_are_unit_norm() {
        let encoder = FakeTextEncoder::new(16);
        let table = build_table(&encoder, &PromptConfig::default(), "retinal OCT").unwrap();
        assert_eq!(table.dim(), 16);
        for column in [table.normal(), table.abnormal()] {
            let norm: f32 = column.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
        assert_ne!(table.normal(), table.abnormal());
    }

    #[test]
    fn test_table_is_mean_of_prompt_embeddings() {
        let encoder = FakeTextEncoder::new(8);
        let config = PromptConfig {
            normal_states: owned(&["{}"]),
            abnormal_states: owned(&["broken {}"]),
            templates: owned(&["{}"]),
        };
        let table = build_table(&encoder, &config, "Chest").unwrap();
        let expected = encoder.encode_batch(&owned(&["broken Chest"])).unwrap();
        for (a, b) in table.abnormal().iter().zip(&expected[0]) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_empty_vocabulary_is_an_error() {
        let encoder = FakeTextEncoder::new(8);
        let config = PromptConfig {
            normal_states: vec![],
            ..PromptConfig::default()
        };
        assert!(matches!(
            build_table(&encoder, &config, "Brain"),
            Err(TextError::EmptyEnsemble { .. })
        ));
    }
}
