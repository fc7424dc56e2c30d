//! Review policy loaded from YAML.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Committee-level rules the lifecycle managers consult.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ReviewPolicy {
    /// Code of the only committee whose proposals may send a retrospective
    /// to the secretariat.
    pub retrospective_committee_code: String,
    /// Zero-padding of the numeric sequence in reference codes.
    pub reference_sequence_width: usize,
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self { retrospective_committee_code: "CEEA".to_string(), reference_sequence_width: 3 }
    }
}

impl ReviewPolicy {
    /// Parse a policy file from a path.
    ///
    /// # Errors
    /// Returns a [`PolicyError`] when the file cannot be read, parsed or validated.
    pub fn from_path(path: &Path) -> Result<Self, PolicyError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(content.as_str())
    }

    /// Parse a policy from YAML text. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns a [`PolicyError`] when the YAML is invalid or fails validation.
    pub fn parse(yaml: &str) -> Result<Self, PolicyError> {
        let policy: ReviewPolicy = serde_yaml::from_str(yaml)?;
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.retrospective_committee_code.trim().is_empty() {
            return Err(PolicyError::Validation(
                "retrospective_committee_code cannot be empty".into(),
            ));
        }
        if !(1..=9).contains(&self.reference_sequence_width) {
            return Err(PolicyError::Validation(format!(
                "reference_sequence_width must be between 1 and 9, got {}",
                self.reference_sequence_width
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let policy = ReviewPolicy::parse("{}").unwrap_or_else(|err| panic!("defaults: {err}"));
        assert_eq!(policy, ReviewPolicy::default());
    }

    #[test]
    fn overrides_are_applied() {
        let policy = ReviewPolicy::parse(
            "retrospective_committee_code: CEEA-2\nreference_sequence_width: 4\n",
        )
        .unwrap_or_else(|err| panic!("policy should parse: {err}"));
        assert_eq!(policy.retrospective_committee_code, "CEEA-2");
        assert_eq!(policy.reference_sequence_width, 4);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            ReviewPolicy::parse("reference_sequence_width: 0"),
            Err(PolicyError::Validation(_))
        ));
        assert!(matches!(
            ReviewPolicy::parse("retrospective_committee_code: '  '"),
            Err(PolicyError::Validation(_))
        ));
        assert!(matches!(ReviewPolicy::parse("unknown_key: 1"), Err(PolicyError::Yaml(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let path = std::env::temp_dir().join(format!("ethics-review-policy-{}.yaml", ulid::Ulid::new()));
        assert!(matches!(ReviewPolicy::from_path(&path), Err(PolicyError::Io(_))));
    }
}
