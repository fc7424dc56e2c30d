//! Pure transition rules of the proposal and evaluation lifecycles.
//!
//! Nothing here touches storage: the lifecycle managers load the rows, ask
//! these functions what should happen, and persist the answer.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::catalog::{EvaluationKind, MeetingKind, ProposalState, RetrospectiveState, Verdict};
use crate::model::{Evaluation, StateHistoryEntry};
use crate::ReviewError;

/// State written by an assignment: either the proposal itself or its
/// retrospective sub-record moves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "target", content = "state", rename_all = "snake_case")]
pub enum StateChange {
    Proposal(ProposalState),
    Retrospective(RetrospectiveState),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssignmentTarget {
    pub kind: EvaluationKind,
    pub change: StateChange,
}

/// Derive the evaluation kind and the state change produced by assigning a
/// proposal to a meeting of `meeting_kind`.
#[must_use]
pub fn assignment_target(
    meeting_kind: MeetingKind,
    state: ProposalState,
    requires_retrospective: bool,
    retrospective_state: Option<RetrospectiveState>,
) -> AssignmentTarget {
    match meeting_kind {
        MeetingKind::Followup => {
            if state == ProposalState::InSecretariatAnnualFollowup {
                AssignmentTarget {
                    kind: EvaluationKind::AnnualFollowup,
                    change: StateChange::Proposal(ProposalState::InEvaluationAnnualFollowup),
                }
            } else {
                AssignmentTarget {
                    kind: EvaluationKind::FinalFollowup,
                    change: StateChange::Proposal(ProposalState::InEvaluationFinalFollowup),
                }
            }
        }
        MeetingKind::Ordinary | MeetingKind::Extraordinary => {
            if state > ProposalState::InSecretariat
                && requires_retrospective
                && retrospective_state == Some(RetrospectiveState::InSecretariat)
            {
                AssignmentTarget {
                    kind: EvaluationKind::Retrospective,
                    change: StateChange::Retrospective(RetrospectiveState::InEvaluation),
                }
            } else {
                AssignmentTarget {
                    kind: EvaluationKind::Proposal,
                    change: StateChange::Proposal(ProposalState::InEvaluation),
                }
            }
        }
    }
}

/// Which proposals a meeting may take.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssignmentWindow {
    /// States eligible when the submission date is on or before the cutoff.
    pub states: Vec<ProposalState>,
    /// Whether a retrospective waiting in the secretariat qualifies on its
    /// own, regardless of dates.
    pub retrospective_in_secretariat: bool,
}

impl AssignmentWindow {
    #[must_use]
    pub fn for_meeting(kind: MeetingKind) -> Self {
        match kind {
            MeetingKind::Ordinary | MeetingKind::Extraordinary => Self {
                states: vec![ProposalState::InSecretariat],
                retrospective_in_secretariat: true,
            },
            MeetingKind::Followup => Self {
                states: vec![
                    ProposalState::InSecretariatAnnualFollowup,
                    ProposalState::InSecretariatFinalFollowup,
                ],
                retrospective_in_secretariat: false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Submission {
    pub target: ProposalState,
    /// A minimal-review copy of the latest evaluation must be spawned.
    pub spawn_minimal_review: bool,
}

/// Map the current state of a proposal to the state a secretariat submission
/// moves it to.
///
/// # Errors
/// Returns [`ReviewError::IllegalArgument`] when the proposal cannot be sent
/// to the secretariat from `state`.
pub fn secretariat_submission(state: ProposalState) -> Result<Submission, ReviewError> {
    let (target, spawn_minimal_review) = match state {
        ProposalState::Completed | ProposalState::PendingCorrections | ProposalState::NotApplicable => {
            (ProposalState::InSecretariat, false)
        }
        ProposalState::FavorablePendingMinimalMods => {
            (ProposalState::InSecretariatMinimalReview, true)
        }
        ProposalState::CompletedAnnualFollowup => (ProposalState::InSecretariatAnnualFollowup, false),
        ProposalState::CompletedFinalFollowup => (ProposalState::InSecretariatFinalFollowup, false),
        ProposalState::InClarificationFinalFollowup => {
            (ProposalState::InSecretariatFinalFollowupClarifications, true)
        }
        other => {
            return Err(ReviewError::illegal(format!(
                "proposal in state {} cannot be sent to the secretariat",
                other.as_str()
            )))
        }
    };
    Ok(Submission { target, spawn_minimal_review })
}

/// State the proposal moves to when a verdict is recorded on a minimal-review
/// evaluation. `None` leaves the proposal untouched.
#[must_use]
pub fn verdict_transition(
    verdict: Option<Verdict>,
    minimal_review: bool,
    state: ProposalState,
) -> Option<ProposalState> {
    if !minimal_review {
        return None;
    }
    match verdict? {
        Verdict::Favorable => match state {
            ProposalState::InSecretariatMinimalReview | ProposalState::InEvaluation => {
                Some(ProposalState::EndOfEvaluation)
            }
            ProposalState::InEvaluationAnnualFollowup
            | ProposalState::InSecretariatFinalFollowupClarifications
            | ProposalState::InEvaluationFinalFollowup => {
                Some(ProposalState::EndOfEvaluationFinalFollowup)
            }
            _ => None,
        },
        Verdict::FavorablePendingMinimalRevision => Some(ProposalState::FavorablePendingMinimalMods),
        Verdict::PendingCorrections | Verdict::NotApplicable => None,
    }
}

#[must_use]
pub fn rollback_allowed(state: ProposalState) -> bool {
    matches!(
        state,
        ProposalState::InSecretariat
            | ProposalState::InSecretariatMinimalReview
            | ProposalState::Archived
            | ProposalState::InEvaluation
    )
}

/// Predecessor recovered from the state history.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PreviousState {
    pub state: ProposalState,
    /// Leading history rows recording the current state, newest first; all
    /// of them are removed on rollback.
    pub discarded_entries: Vec<i64>,
}

/// Recover the state a proposal was in before `current`.
///
/// `history` is ordered most recent first. Its head MUST record `current`;
/// the predecessor is the first older row whose state differs, so repeated
/// rows for the same state are skipped and reported for removal together.
///
/// # Errors
/// Returns [`ReviewError::IllegalArgument`] when the head of the history does
/// not match `current` or no earlier distinct state exists.
pub fn previous_state(
    history: &[StateHistoryEntry],
    current: ProposalState,
) -> Result<PreviousState, ReviewError> {
    let Some((head, older)) = history.split_first() else {
        return Err(ReviewError::illegal("proposal has no state history"));
    };
    if head.state != current {
        return Err(ReviewError::illegal(format!(
            "state history is out of step: latest entry is {} but proposal is {}",
            head.state.as_str(),
            current.as_str()
        )));
    }
    let repeated = older.iter().take_while(|entry| entry.state == current).count();
    let previous = older.get(repeated).ok_or_else(|| {
        ReviewError::illegal(format!("no state precedes {} in the history", current.as_str()))
    })?;
    let discarded_entries =
        std::iter::once(head.id).chain(older[..repeated].iter().map(|entry| entry.id)).collect();
    Ok(PreviousState { state: previous.state, discarded_entries })
}

/// The retrospective state one step back.
///
/// # Errors
/// Returns [`ReviewError::IllegalArgument`] for the first state.
pub fn previous_retrospective_state(
    state: RetrospectiveState,
) -> Result<RetrospectiveState, ReviewError> {
    state
        .id()
        .checked_sub(1)
        .and_then(RetrospectiveState::from_id)
        .ok_or_else(|| {
            ReviewError::illegal(format!(
                "retrospective state {} has no predecessor",
                state.as_str()
            ))
        })
}

/// Guard shared by assignment rollback and evaluation deletion.
///
/// # Errors
/// Returns [`ReviewError::IllegalArgument`] when the meeting has already been
/// held, the verdict has been issued, or comments are attached.
pub fn ensure_removable(
    evaluation: &Evaluation,
    meeting_at: OffsetDateTime,
    now: OffsetDateTime,
    comment_count: u64,
) -> Result<(), ReviewError> {
    if meeting_at <= now {
        return Err(ReviewError::illegal("the meeting date is not in the future"));
    }
    if evaluation.verdict.is_some() {
        return Err(ReviewError::illegal("the evaluation already carries a verdict"));
    }
    if comment_count > 0 {
        return Err(ReviewError::illegal("the evaluation has comments attached"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EvaluationId, MeetingId, ProposalId};
    use proptest::prelude::*;
    use time::Duration;

    fn entry(id: i64, state: ProposalState) -> StateHistoryEntry {
        StateHistoryEntry {
            id,
            proposal_id: ProposalId(ulid::Ulid::nil()),
            state,
            recorded_at: OffsetDateTime::UNIX_EPOCH + Duration::seconds(id),
        }
    }

    fn evaluation(verdict: Option<Verdict>) -> Evaluation {
        Evaluation {
            id: EvaluationId::new(),
            proposal_id: ProposalId::new(),
            meeting_id: MeetingId::new(),
            kind: EvaluationKind::Proposal,
            verdict,
            minimal_review: false,
            verdict_date: None,
            version: 1,
            evaluator_1: None,
            evaluator_2: None,
            active: true,
        }
    }

    #[test]
    fn ordinary_meeting_targets_proposal_unless_retrospective_waits() {
        let plain = assignment_target(MeetingKind::Ordinary, ProposalState::InSecretariat, false, None);
        assert_eq!(plain.kind, EvaluationKind::Proposal);
        assert_eq!(plain.change, StateChange::Proposal(ProposalState::InEvaluation));

        let retro = assignment_target(
            MeetingKind::Extraordinary,
            ProposalState::EndOfEvaluation,
            true,
            Some(RetrospectiveState::InSecretariat),
        );
        assert_eq!(retro.kind, EvaluationKind::Retrospective);
        assert_eq!(retro.change, StateChange::Retrospective(RetrospectiveState::InEvaluation));

        // the proposal must be past the secretariat for the retrospective branch
        let early = assignment_target(
            MeetingKind::Ordinary,
            ProposalState::InSecretariat,
            true,
            Some(RetrospectiveState::InSecretariat),
        );
        assert_eq!(early.kind, EvaluationKind::Proposal);
    }

    #[test]
    fn followup_meeting_splits_annual_and_final() {
        let annual = assignment_target(
            MeetingKind::Followup,
            ProposalState::InSecretariatAnnualFollowup,
            false,
            None,
        );
        assert_eq!(annual.kind, EvaluationKind::AnnualFollowup);
        assert_eq!(annual.change, StateChange::Proposal(ProposalState::InEvaluationAnnualFollowup));

        let final_ = assignment_target(
            MeetingKind::Followup,
            ProposalState::InSecretariatFinalFollowup,
            false,
            None,
        );
        assert_eq!(final_.kind, EvaluationKind::FinalFollowup);
        assert_eq!(final_.change, StateChange::Proposal(ProposalState::InEvaluationFinalFollowup));
    }

    #[test]
    fn secretariat_submission_maps_allowed_states() {
        let cases = [
            (ProposalState::Completed, ProposalState::InSecretariat, false),
            (ProposalState::PendingCorrections, ProposalState::InSecretariat, false),
            (ProposalState::NotApplicable, ProposalState::InSecretariat, false),
            (ProposalState::FavorablePendingMinimalMods, ProposalState::InSecretariatMinimalReview, true),
            (ProposalState::CompletedAnnualFollowup, ProposalState::InSecretariatAnnualFollowup, false),
            (ProposalState::CompletedFinalFollowup, ProposalState::InSecretariatFinalFollowup, false),
            (
                ProposalState::InClarificationFinalFollowup,
                ProposalState::InSecretariatFinalFollowupClarifications,
                true,
            ),
        ];
        for (from, target, spawn) in cases {
            assert_eq!(
                secretariat_submission(from),
                Ok(Submission { target, spawn_minimal_review: spawn }),
                "{from:?}"
            );
        }
        assert!(matches!(
            secretariat_submission(ProposalState::Drafting),
            Err(ReviewError::IllegalArgument(_))
        ));
        assert!(matches!(
            secretariat_submission(ProposalState::InEvaluation),
            Err(ReviewError::IllegalArgument(_))
        ));
    }

    #[test]
    fn verdict_effects_only_apply_to_minimal_review() {
        assert_eq!(
            verdict_transition(Some(Verdict::Favorable), true, ProposalState::InEvaluation),
            Some(ProposalState::EndOfEvaluation)
        );
        assert_eq!(
            verdict_transition(Some(Verdict::Favorable), true, ProposalState::InEvaluationFinalFollowup),
            Some(ProposalState::EndOfEvaluationFinalFollowup)
        );
        assert_eq!(
            verdict_transition(
                Some(Verdict::FavorablePendingMinimalRevision),
                true,
                ProposalState::InEvaluationAnnualFollowup
            ),
            Some(ProposalState::FavorablePendingMinimalMods)
        );
        assert_eq!(verdict_transition(Some(Verdict::Favorable), false, ProposalState::InEvaluation), None);
        assert_eq!(verdict_transition(None, true, ProposalState::InEvaluation), None);
        assert_eq!(
            verdict_transition(Some(Verdict::Favorable), true, ProposalState::Completed),
            None
        );
    }

    #[test]
    fn rollback_is_limited_to_secretariat_archive_and_evaluation() {
        let allowed: Vec<ProposalState> =
            ProposalState::ALL.into_iter().filter(|state| rollback_allowed(*state)).collect();
        assert_eq!(
            allowed,
            vec![
                ProposalState::InSecretariat,
                ProposalState::InSecretariatMinimalReview,
                ProposalState::InEvaluation,
                ProposalState::Archived,
            ]
        );
    }

    #[test]
    fn previous_state_skips_repeated_rows() {
        let history = vec![
            entry(5, ProposalState::InEvaluation),
            entry(4, ProposalState::InEvaluation),
            entry(3, ProposalState::InSecretariat),
            entry(1, ProposalState::Drafting),
        ];
        let previous = previous_state(&history, ProposalState::InEvaluation)
            .unwrap_or_else(|err| panic!("predecessor should exist: {err}"));
        assert_eq!(previous.state, ProposalState::InSecretariat);
        assert_eq!(previous.discarded_entries, vec![5, 4]);
    }

    #[test]
    fn previous_state_rejects_out_of_step_or_missing_history() {
        let history = vec![entry(2, ProposalState::InSecretariat), entry(1, ProposalState::Drafting)];
        assert!(matches!(
            previous_state(&history, ProposalState::InEvaluation),
            Err(ReviewError::IllegalArgument(_))
        ));
        assert!(matches!(
            previous_state(&[entry(1, ProposalState::Drafting)], ProposalState::Drafting),
            Err(ReviewError::IllegalArgument(_))
        ));
        assert!(matches!(
            previous_state(&[], ProposalState::Drafting),
            Err(ReviewError::IllegalArgument(_))
        ));
    }

    #[test]
    fn retrospective_steps_back_one_id() {
        assert_eq!(
            previous_retrospective_state(RetrospectiveState::InEvaluation),
            Ok(RetrospectiveState::InSecretariat)
        );
        assert!(previous_retrospective_state(RetrospectiveState::Pending).is_err());
    }

    #[test]
    fn removal_guard_checks_date_verdict_and_comments() {
        let now = OffsetDateTime::UNIX_EPOCH + Duration::days(10);
        let later = now + Duration::days(1);

        assert!(ensure_removable(&evaluation(None), later, now, 0).is_ok());
        assert!(ensure_removable(&evaluation(None), now, now, 0).is_err());
        assert!(ensure_removable(&evaluation(Some(Verdict::Favorable)), later, now, 0).is_err());
        assert!(ensure_removable(&evaluation(None), later, now, 2).is_err());
    }

    fn any_state() -> impl Strategy<Value = ProposalState> {
        (0_usize..ProposalState::ALL.len()).prop_map(|index| ProposalState::ALL[index])
    }

    proptest! {
        #[test]
        fn recovered_predecessor_never_equals_current(
            older in proptest::collection::vec(any_state(), 0..12),
            current in any_state(),
        ) {
            let mut history = vec![entry(100, current)];
            for (offset, state) in older.iter().enumerate() {
                let id = 99 - i64::try_from(offset).unwrap_or(0);
                history.push(entry(id, *state));
            }
            match previous_state(&history, current) {
                Ok(previous) => {
                    prop_assert_ne!(previous.state, current);
                    prop_assert_eq!(previous.discarded_entries.first(), Some(&100));
                    let repeated = older.iter().take_while(|state| **state == current).count();
                    prop_assert_eq!(previous.discarded_entries.len(), repeated + 1);
                }
                Err(_) => prop_assert!(older.iter().all(|state| *state == current)),
            }
        }
    }
}
