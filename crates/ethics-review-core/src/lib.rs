//! Domain core of the ethics committee review workflow.
//!
//! This crate holds the state catalog, the proposal/evaluation model, the
//! reference code generator, and the pure transition rules the lifecycle
//! managers apply. It performs no I/O.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod catalog;
pub mod model;
pub mod reference;
pub mod transitions;

pub use catalog::{EvaluationKind, MeetingKind, ProposalKind, ProposalState, RetrospectiveState, Verdict};
pub use model::{
    Answer, Comment, Committee, ConflictOfInterest, Document, Evaluation, EvaluationRequest,
    Evaluator, Meeting, Proposal, Report, Retrospective, StateHistoryEntry, TeamMember,
};
pub use reference::{next_reference, ReferenceCandidate};
pub use transitions::{
    assignment_target, ensure_removable, previous_retrospective_state, previous_state,
    rollback_allowed, secretariat_submission, verdict_transition, AssignmentTarget,
    AssignmentWindow, PreviousState, StateChange, Submission,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReviewError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("concurrent modification: {0}")]
    Conflict(String),
    #[error("malformed reference code: {0}")]
    MalformedReference(String),
}

impl ReviewError {
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    #[must_use]
    pub fn illegal(message: impl Into<String>) -> Self {
        Self::IllegalArgument(message.into())
    }
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(raw).map(Self)
            }
        }
    };
}

ulid_id!(
    /// Identity of a reviewing committee.
    CommitteeId
);
ulid_id!(
    /// Identity of the evaluation request a proposal originates from.
    RequestId
);
ulid_id!(ProposalId);
ulid_id!(MeetingId);
ulid_id!(EvaluationId);
ulid_id!(DocumentId);
ulid_id!(AnswerId);
ulid_id!(CommentId);
ulid_id!(ReportId);
ulid_id!(EvaluatorId);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    #[must_use]
    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    /// Check that the page size can address at least one row.
    ///
    /// # Errors
    /// Returns [`ReviewError::IllegalArgument`] when `size` is zero.
    pub fn validate(&self) -> Result<(), ReviewError> {
        if self.size == 0 {
            return Err(ReviewError::illegal("page size MUST be >= 1"));
        }
        Ok(())
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 0, size: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: u64,
}

impl<T> Page<T> {
    #[must_use]
    pub fn new(items: Vec<T>, request: PageRequest, total: u64) -> Self {
        Self { items, page: request.page, size: request.size, total }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            size: self.size,
            total: self.total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_display_and_from_str() {
        let id = ProposalId::new();
        let parsed = match id.to_string().parse::<ProposalId>() {
            Ok(parsed) => parsed,
            Err(err) => panic!("display output should parse back: {err}"),
        };
        assert_eq!(parsed, id);
        assert!("not-a-ulid".parse::<EvaluationId>().is_err());
    }

    #[test]
    fn zero_sized_page_is_rejected() {
        assert!(matches!(
            PageRequest::new(0, 0).validate(),
            Err(ReviewError::IllegalArgument(_))
        ));
        assert_eq!(PageRequest::new(3, 10).offset(), 30);
    }

    #[test]
    fn not_found_message_names_entity_and_id() {
        let err = ReviewError::not_found("proposal", "01ABC");
        assert_eq!(err.to_string(), "proposal not found: 01ABC");
    }
}
