use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::catalog::{
    EvaluationKind, MeetingKind, ProposalKind, ProposalState, RetrospectiveState, Verdict,
};
use crate::{
    AnswerId, CommentId, CommitteeId, DocumentId, EvaluationId, EvaluatorId, MeetingId,
    ProposalId, ReportId, RequestId,
};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Committee {
    pub id: CommitteeId,
    /// Short committee code, e.g. `CEEA`.
    pub code: String,
    /// Form code that prefixes every reference issued by this committee.
    pub form_name: String,
    pub active: bool,
}

/// The evaluation request ("peticion de evaluacion") a proposal originates from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EvaluationRequest {
    pub id: RequestId,
    pub title: String,
    pub owner_ref: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TeamMember {
    pub request_id: RequestId,
    pub person_ref: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Retrospective {
    pub state: RetrospectiveState,
    pub review_date: Date,
}

/// A research proposal under review ("memoria").
///
/// `version` never decreases except through an explicit rollback, and
/// `original_id` is only set on modification copies.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Proposal {
    pub id: ProposalId,
    pub reference: String,
    pub request_id: RequestId,
    pub committee_id: CommitteeId,
    pub title: String,
    pub owner_ref: String,
    pub kind: ProposalKind,
    pub state: ProposalState,
    pub submitted_at: Option<Date>,
    pub requires_retrospective: bool,
    pub retrospective: Option<Retrospective>,
    pub version: u32,
    pub original_id: Option<ProposalId>,
    pub active: bool,
}

impl Proposal {
    #[must_use]
    pub fn retrospective_state(&self) -> Option<RetrospectiveState> {
        self.retrospective.map(|retrospective| retrospective.state)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Meeting {
    pub id: MeetingId,
    pub committee_id: CommitteeId,
    pub kind: MeetingKind,
    #[serde(with = "time::serde::rfc3339")]
    pub evaluation_at: OffsetDateTime,
    /// Last submission date a proposal may carry to be assignable.
    pub cutoff_date: Date,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Evaluation {
    pub id: EvaluationId,
    pub proposal_id: ProposalId,
    pub meeting_id: MeetingId,
    pub kind: EvaluationKind,
    pub verdict: Option<Verdict>,
    pub minimal_review: bool,
    pub verdict_date: Option<Date>,
    pub version: u32,
    pub evaluator_1: Option<EvaluatorId>,
    pub evaluator_2: Option<EvaluatorId>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StateHistoryEntry {
    pub id: i64,
    pub proposal_id: ProposalId,
    pub state: ProposalState,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    pub proposal_id: ProposalId,
    pub document_type: String,
    /// Opaque id in the external document store.
    pub document_ref: String,
    pub active: bool,
}

/// Answer to one section of a proposal's form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub id: AnswerId,
    pub proposal_id: ProposalId,
    pub section_ref: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Comment {
    pub id: CommentId,
    pub evaluation_id: EvaluationId,
    pub text: String,
}

/// Generated report tied to a proposal; dropped when a submission is rolled back.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Report {
    pub id: ReportId,
    pub proposal_id: ProposalId,
    pub document_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Evaluator {
    pub id: EvaluatorId,
    pub committee_id: CommitteeId,
    pub person_ref: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConflictOfInterest {
    pub evaluator_id: EvaluatorId,
    pub person_ref: String,
}
