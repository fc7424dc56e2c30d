//! Reference codes: `<form>/<year>/<sequence>`.
//!
//! New and ratification proposals draw the next sequence from the committee's
//! references of the same year (modification copies excluded); ratifications
//! carry an `R` suffix. Modification copies reuse the numeric base of the
//! proposal they copy and append `MR<n>`.

use serde::{Deserialize, Serialize};

use crate::catalog::ProposalKind;
use crate::ReviewError;

const RATIFICATION_MARKER: char = 'R';
const MODIFICATION_MARKER: &str = "MR";

/// A reference already issued by the committee, with the kind of proposal
/// that carries it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReferenceCandidate {
    pub reference: String,
    pub kind: ProposalKind,
}

impl ReferenceCandidate {
    #[must_use]
    pub fn new(reference: impl Into<String>, kind: ProposalKind) -> Self {
        Self { reference: reference.into(), kind }
    }
}

/// Compute the reference for a proposal of `kind` created in `year`.
///
/// `original_reference` is the reference of the proposal being copied and is
/// required for [`ProposalKind::Modification`].
///
/// # Errors
/// Returns [`ReviewError::MalformedReference`] when a stored reference does not
/// split into the expected segments, and [`ReviewError::IllegalArgument`] when a
/// modification is requested without an original reference.
pub fn next_reference(
    kind: ProposalKind,
    form_name: &str,
    year: i32,
    width: usize,
    original_reference: Option<&str>,
    candidates: &[ReferenceCandidate],
) -> Result<String, ReviewError> {
    let prefix = format!("{form_name}/{year}/");
    let sequence = match kind {
        ProposalKind::New | ProposalKind::Ratification => {
            let next = last_sequence(year, candidates)?.map_or(1, |last| last + 1);
            let mut sequence = format!("{next:0width$}");
            if kind == ProposalKind::Ratification {
                sequence.push(RATIFICATION_MARKER);
            }
            sequence
        }
        ProposalKind::Modification => {
            let original = original_reference.ok_or_else(|| {
                ReviewError::illegal("a modification requires the original proposal reference")
            })?;
            let base = sequence_base(original)?;
            let root = format!("{prefix}{base}");
            let mut last = modification_number(original)?;
            for candidate in candidates {
                if root_of(&candidate.reference) == root {
                    last = last.max(modification_number(&candidate.reference)?);
                }
            }
            format!("{base}{MODIFICATION_MARKER}{}", last.map_or(1, |n| n + 1))
        }
    };
    Ok(format!("{prefix}{sequence}"))
}

fn last_sequence(year: i32, candidates: &[ReferenceCandidate]) -> Result<Option<u64>, ReviewError> {
    let year = year.to_string();
    let mut last = None;
    for candidate in candidates {
        if candidate.kind == ProposalKind::Modification {
            continue;
        }
        let segment = sequence_segment(&candidate.reference)?;
        if year_segment(&candidate.reference)? != year {
            continue;
        }
        let digits = segment.split(RATIFICATION_MARKER).next().unwrap_or_default();
        let value = parse_number(digits, &candidate.reference)?;
        last = Some(last.map_or(value, |current: u64| current.max(value)));
    }
    Ok(last)
}

fn sequence_base(reference: &str) -> Result<String, ReviewError> {
    let segment = sequence_segment(root_of(reference))?;
    let digits = segment.split(RATIFICATION_MARKER).next().unwrap_or_default();
    parse_number(digits, reference)?;
    Ok(digits.to_string())
}

fn modification_number(reference: &str) -> Result<Option<u64>, ReviewError> {
    match reference.split_once(MODIFICATION_MARKER) {
        Some((_, suffix)) => parse_number(suffix, reference).map(Some),
        None => Ok(None),
    }
}

fn root_of(reference: &str) -> &str {
    reference.split(MODIFICATION_MARKER).next().unwrap_or_default()
}

fn year_segment(reference: &str) -> Result<&str, ReviewError> {
    reference
        .split('/')
        .nth(1)
        .ok_or_else(|| ReviewError::MalformedReference(reference.to_string()))
}

fn sequence_segment(reference: &str) -> Result<&str, ReviewError> {
    let segments: Vec<&str> = reference.split('/').collect();
    match segments.as_slice() {
        [_, _, sequence] if !sequence.is_empty() => Ok(sequence),
        _ => Err(ReviewError::MalformedReference(reference.to_string())),
    }
}

fn parse_number(digits: &str, reference: &str) -> Result<u64, ReviewError> {
    digits
        .parse::<u64>()
        .map_err(|_| ReviewError::MalformedReference(reference.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn generate(
        kind: ProposalKind,
        original: Option<&str>,
        candidates: &[ReferenceCandidate],
    ) -> String {
        next_reference(kind, "M10", 2024, 3, original, candidates)
            .unwrap_or_else(|err| panic!("reference should generate: {err}"))
    }

    #[test]
    fn first_new_reference_starts_at_one() {
        assert_eq!(generate(ProposalKind::New, None, &[]), "M10/2024/001");
    }

    #[test]
    fn new_reference_follows_highest_sequence_of_the_year() {
        let candidates = vec![
            ReferenceCandidate::new("M10/2024/002", ProposalKind::New),
            ReferenceCandidate::new("M10/2024/009R", ProposalKind::Ratification),
            ReferenceCandidate::new("M10/2024/010", ProposalKind::New),
            ReferenceCandidate::new("M10/2024/050MR1", ProposalKind::Modification),
            ReferenceCandidate::new("M10/2023/120", ProposalKind::New),
        ];
        assert_eq!(generate(ProposalKind::New, None, &candidates), "M10/2024/011");
        assert_eq!(generate(ProposalKind::Ratification, None, &candidates), "M10/2024/011R");
    }

    #[test]
    fn ratification_without_history_carries_marker() {
        assert_eq!(generate(ProposalKind::Ratification, None, &[]), "M10/2024/001R");
    }

    #[test]
    fn modification_appends_next_mr_number() {
        assert_eq!(
            generate(ProposalKind::Modification, Some("M10/2024/004"), &[]),
            "M10/2024/004MR1"
        );

        let candidates = vec![
            ReferenceCandidate::new("M10/2024/004", ProposalKind::New),
            ReferenceCandidate::new("M10/2024/004MR1", ProposalKind::Modification),
            ReferenceCandidate::new("M10/2024/004MR2", ProposalKind::Modification),
            ReferenceCandidate::new("M10/2024/005MR7", ProposalKind::Modification),
        ];
        assert_eq!(
            generate(ProposalKind::Modification, Some("M10/2024/004"), &candidates),
            "M10/2024/004MR3"
        );
        assert_eq!(
            generate(ProposalKind::Modification, Some("M10/2024/004MR1"), &candidates),
            "M10/2024/004MR3"
        );
    }

    #[test]
    fn modification_of_ratification_drops_marker() {
        assert_eq!(
            generate(ProposalKind::Modification, Some("M10/2024/007R"), &[]),
            "M10/2024/007MR1"
        );
    }

    #[test]
    fn modification_suffix_compares_numerically() {
        let candidates = vec![
            ReferenceCandidate::new("M10/2024/004MR9", ProposalKind::Modification),
            ReferenceCandidate::new("M10/2024/004MR10", ProposalKind::Modification),
        ];
        assert_eq!(
            generate(ProposalKind::Modification, Some("M10/2024/004"), &candidates),
            "M10/2024/004MR11"
        );
    }

    #[test]
    fn modification_without_original_is_rejected() {
        let result = next_reference(ProposalKind::Modification, "M10", 2024, 3, None, &[]);
        assert!(matches!(result, Err(ReviewError::IllegalArgument(_))));
    }

    #[test]
    fn malformed_stored_reference_is_fatal() {
        let candidates = vec![ReferenceCandidate::new("M10-2024-001", ProposalKind::New)];
        let result = next_reference(ProposalKind::New, "M10", 2024, 3, None, &candidates);
        assert!(matches!(result, Err(ReviewError::MalformedReference(_))));

        let candidates = vec![ReferenceCandidate::new("M10/2024/abc", ProposalKind::New)];
        let result = next_reference(ProposalKind::New, "M10", 2024, 3, None, &candidates);
        assert!(matches!(result, Err(ReviewError::MalformedReference(_))));
    }

    proptest! {
        #[test]
        fn consecutive_new_references_are_monotonic(count in 1_usize..40) {
            let mut issued: Vec<ReferenceCandidate> = Vec::new();
            for expected in 1..=count {
                let reference = next_reference(ProposalKind::New, "M10", 2024, 3, None, &issued)
                    .unwrap_or_else(|err| panic!("reference should generate: {err}"));
                prop_assert_eq!(&reference, &format!("M10/2024/{expected:03}"));
                issued.push(ReferenceCandidate::new(reference, ProposalKind::New));
            }
        }
    }
}
