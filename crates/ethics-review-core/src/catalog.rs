//! Fixed catalogs the workflow branches on.
//!
//! Every entry carries the stable numeric id it is persisted under. Ordering
//! between proposal states follows those ids, so enum declaration order MUST
//! match id order.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    New,
    Modification,
    Ratification,
}

impl ProposalKind {
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::New => 1,
            Self::Modification => 2,
            Self::Ratification => 3,
        }
    }

    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::New),
            2 => Some(Self::Modification),
            3 => Some(Self::Ratification),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Modification => "modification",
            Self::Ratification => "ratification",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "modification" => Some(Self::Modification),
            "ratification" => Some(Self::Ratification),
            _ => None,
        }
    }
}

/// Lifecycle state of a proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Drafting,
    Completed,
    InSecretariat,
    InSecretariatMinimalReview,
    InEvaluation,
    FavorablePendingMinimalMods,
    PendingCorrections,
    NotApplicable,
    EndOfEvaluation,
    Archived,
    CompletedAnnualFollowup,
    InSecretariatAnnualFollowup,
    InEvaluationAnnualFollowup,
    EndOfEvaluationAnnualFollowup,
    ModificationRequestedAnnualFollowup,
    CompletedFinalFollowup,
    InSecretariatFinalFollowup,
    InSecretariatFinalFollowupClarifications,
    InEvaluationFinalFollowup,
    EndOfEvaluationFinalFollowup,
    InClarificationFinalFollowup,
}

impl ProposalState {
    pub const ALL: [Self; 21] = [
        Self::Drafting,
        Self::Completed,
        Self::InSecretariat,
        Self::InSecretariatMinimalReview,
        Self::InEvaluation,
        Self::FavorablePendingMinimalMods,
        Self::PendingCorrections,
        Self::NotApplicable,
        Self::EndOfEvaluation,
        Self::Archived,
        Self::CompletedAnnualFollowup,
        Self::InSecretariatAnnualFollowup,
        Self::InEvaluationAnnualFollowup,
        Self::EndOfEvaluationAnnualFollowup,
        Self::ModificationRequestedAnnualFollowup,
        Self::CompletedFinalFollowup,
        Self::InSecretariatFinalFollowup,
        Self::InSecretariatFinalFollowupClarifications,
        Self::InEvaluationFinalFollowup,
        Self::EndOfEvaluationFinalFollowup,
        Self::InClarificationFinalFollowup,
    ];

    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Drafting => 1,
            Self::Completed => 2,
            Self::InSecretariat => 3,
            Self::InSecretariatMinimalReview => 4,
            Self::InEvaluation => 5,
            Self::FavorablePendingMinimalMods => 6,
            Self::PendingCorrections => 7,
            Self::NotApplicable => 8,
            Self::EndOfEvaluation => 9,
            Self::Archived => 10,
            Self::CompletedAnnualFollowup => 11,
            Self::InSecretariatAnnualFollowup => 12,
            Self::InEvaluationAnnualFollowup => 13,
            Self::EndOfEvaluationAnnualFollowup => 14,
            Self::ModificationRequestedAnnualFollowup => 15,
            Self::CompletedFinalFollowup => 16,
            Self::InSecretariatFinalFollowup => 17,
            Self::InSecretariatFinalFollowupClarifications => 18,
            Self::InEvaluationFinalFollowup => 19,
            Self::EndOfEvaluationFinalFollowup => 20,
            Self::InClarificationFinalFollowup => 21,
        }
    }

    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| state.id() == id)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Drafting => "drafting",
            Self::Completed => "completed",
            Self::InSecretariat => "in_secretariat",
            Self::InSecretariatMinimalReview => "in_secretariat_minimal_review",
            Self::InEvaluation => "in_evaluation",
            Self::FavorablePendingMinimalMods => "favorable_pending_minimal_mods",
            Self::PendingCorrections => "pending_corrections",
            Self::NotApplicable => "not_applicable",
            Self::EndOfEvaluation => "end_of_evaluation",
            Self::Archived => "archived",
            Self::CompletedAnnualFollowup => "completed_annual_followup",
            Self::InSecretariatAnnualFollowup => "in_secretariat_annual_followup",
            Self::InEvaluationAnnualFollowup => "in_evaluation_annual_followup",
            Self::EndOfEvaluationAnnualFollowup => "end_of_evaluation_annual_followup",
            Self::ModificationRequestedAnnualFollowup => "modification_requested_annual_followup",
            Self::CompletedFinalFollowup => "completed_final_followup",
            Self::InSecretariatFinalFollowup => "in_secretariat_final_followup",
            Self::InSecretariatFinalFollowupClarifications => {
                "in_secretariat_final_followup_clarifications"
            }
            Self::InEvaluationFinalFollowup => "in_evaluation_final_followup",
            Self::EndOfEvaluationFinalFollowup => "end_of_evaluation_final_followup",
            Self::InClarificationFinalFollowup => "in_clarification_final_followup",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| state.as_str() == value)
    }
}

/// State of the retrospective sub-record. The predecessor of a state is the
/// entry whose id is one lower.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RetrospectiveState {
    Pending,
    Completed,
    InSecretariat,
    InEvaluation,
    EndOfEvaluation,
}

impl RetrospectiveState {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Completed,
        Self::InSecretariat,
        Self::InEvaluation,
        Self::EndOfEvaluation,
    ];

    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Pending => 1,
            Self::Completed => 2,
            Self::InSecretariat => 3,
            Self::InEvaluation => 4,
            Self::EndOfEvaluation => 5,
        }
    }

    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| state.id() == id)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::InSecretariat => "in_secretariat",
            Self::InEvaluation => "in_evaluation",
            Self::EndOfEvaluation => "end_of_evaluation",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationKind {
    Retrospective,
    Proposal,
    AnnualFollowup,
    FinalFollowup,
}

impl EvaluationKind {
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Retrospective => 1,
            Self::Proposal => 2,
            Self::AnnualFollowup => 3,
            Self::FinalFollowup => 4,
        }
    }

    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Retrospective),
            2 => Some(Self::Proposal),
            3 => Some(Self::AnnualFollowup),
            4 => Some(Self::FinalFollowup),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retrospective => "retrospective",
            Self::Proposal => "proposal",
            Self::AnnualFollowup => "annual_followup",
            Self::FinalFollowup => "final_followup",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MeetingKind {
    Ordinary,
    Extraordinary,
    Followup,
}

impl MeetingKind {
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Ordinary => 1,
            Self::Extraordinary => 2,
            Self::Followup => 3,
        }
    }

    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Ordinary),
            2 => Some(Self::Extraordinary),
            3 => Some(Self::Followup),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ordinary => "ordinary",
            Self::Extraordinary => "extraordinary",
            Self::Followup => "followup",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ordinary" => Some(Self::Ordinary),
            "extraordinary" => Some(Self::Extraordinary),
            "followup" => Some(Self::Followup),
            _ => None,
        }
    }
}

/// Dictamen issued on an evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Favorable,
    FavorablePendingMinimalRevision,
    PendingCorrections,
    NotApplicable,
}

impl Verdict {
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Favorable => 1,
            Self::FavorablePendingMinimalRevision => 2,
            Self::PendingCorrections => 3,
            Self::NotApplicable => 4,
        }
    }

    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Favorable),
            2 => Some(Self::FavorablePendingMinimalRevision),
            3 => Some(Self::PendingCorrections),
            4 => Some(Self::NotApplicable),
            _ => None,
        }
    }

    /// Display name as shown on the issued dictamen.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Favorable => "FAVORABLE",
            Self::FavorablePendingMinimalRevision => "FAVORABLE PENDIENTE DE REVISION MINIMA",
            Self::PendingCorrections => "PENDIENTE DE CORRECCIONES",
            Self::NotApplicable => "NO PROCEDE EVALUAR",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Favorable => "favorable",
            Self::FavorablePendingMinimalRevision => "favorable_pending_minimal_revision",
            Self::PendingCorrections => "pending_corrections",
            Self::NotApplicable => "not_applicable",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "favorable" => Some(Self::Favorable),
            "favorable_pending_minimal_revision" => Some(Self::FavorablePendingMinimalRevision),
            "pending_corrections" => Some(Self::PendingCorrections),
            "not_applicable" => Some(Self::NotApplicable),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_state_ids_are_dense_and_follow_declaration_order() {
        for (index, state) in ProposalState::ALL.iter().enumerate() {
            let expected = u8::try_from(index + 1).unwrap_or(u8::MAX);
            assert_eq!(state.id(), expected, "{state:?}");
            assert_eq!(ProposalState::from_id(expected), Some(*state));
            assert_eq!(ProposalState::parse(state.as_str()), Some(*state));
        }
        assert!(ProposalState::InEvaluation > ProposalState::InSecretariat);
        assert_eq!(ProposalState::from_id(0), None);
        assert_eq!(ProposalState::from_id(22), None);
    }

    #[test]
    fn retrospective_states_round_trip_by_id() {
        for state in RetrospectiveState::ALL {
            assert_eq!(RetrospectiveState::from_id(state.id()), Some(state));
        }
    }

    #[test]
    fn catalog_ids_match_persisted_values() {
        assert_eq!(ProposalKind::Modification.id(), 2);
        assert_eq!(EvaluationKind::Proposal.id(), 2);
        assert_eq!(MeetingKind::Followup.id(), 3);
        assert_eq!(Verdict::FavorablePendingMinimalRevision.id(), 2);
        assert_eq!(Verdict::Favorable.name(), "FAVORABLE");
    }
}
