//! Evaluation lifecycle: meeting assignment, verdicts and withdrawal.

use ethics_review_core::{
    assignment_target, ensure_removable, previous_retrospective_state, verdict_transition,
    CommitteeId, Evaluation, EvaluationId, EvaluationKind, Evaluator, EvaluatorId, MeetingId, Page,
    PageRequest, ProposalId, ReviewError, StateChange,
};
use ethics_review_store_sqlite::ReviewTx;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::proposal::{enter_state, load_proposal, persist, step_back, withdraw};
use crate::{load_meeting, ReviewApi, ServiceResult};

/// Assignment of a proposal to a meeting. Kind, version, verdict date and
/// the resulting state change are derived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluationInput {
    #[serde(default)]
    pub id: Option<EvaluationId>,
    pub proposal_id: ProposalId,
    pub meeting_id: MeetingId,
    #[serde(default)]
    pub evaluator_1: Option<EvaluatorId>,
    #[serde(default)]
    pub evaluator_2: Option<EvaluatorId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemovableEvaluation {
    #[serde(flatten)]
    pub evaluation: Evaluation,
    /// No verdict, no comments, and the meeting is still ahead.
    pub removable: bool,
}

impl ReviewApi {
    /// Assign a proposal to a meeting.
    ///
    /// A proposal evaluation takes the proposal's next version and bumps the
    /// proposal to match; any other kind follows the latest active evaluation.
    ///
    /// # Errors
    /// `IllegalArgument` when an id is supplied; `NotFound` when the proposal or
    /// meeting is unknown; `Conflict` when another active evaluation already
    /// holds the version.
    pub fn create_evaluation(&self, input: EvaluationInput) -> ServiceResult<Evaluation> {
        debug!(proposal_id = %input.proposal_id, meeting_id = %input.meeting_id, "create_evaluation start");
        if input.id.is_some() {
            return Err(ReviewError::illegal("a new evaluation cannot carry an id").into());
        }
        let now = self.now();

        let evaluation = self.write(|tx| {
            let meeting = load_meeting(tx, input.meeting_id)?;
            let mut proposal = load_proposal(tx, input.proposal_id)?;
            let target = assignment_target(
                meeting.kind,
                proposal.state,
                proposal.requires_retrospective,
                proposal.retrospective_state(),
            );

            let expected = proposal.version;
            let version = if target.kind == EvaluationKind::Proposal {
                proposal.version += 1;
                proposal.version
            } else {
                tx.latest_active_evaluation(proposal.id)?
                    .map_or(1, |latest| latest.version + 1)
            };

            match target.change {
                StateChange::Proposal(state) => enter_state(tx, &mut proposal, state, now)?,
                StateChange::Retrospective(state) => {
                    if let Some(retrospective) = proposal.retrospective.as_mut() {
                        retrospective.state = state;
                    }
                }
            }
            persist(tx, &proposal, expected)?;

            let evaluation = Evaluation {
                id: EvaluationId::new(),
                proposal_id: proposal.id,
                meeting_id: meeting.id,
                kind: target.kind,
                verdict: None,
                minimal_review: false,
                verdict_date: Some(meeting.evaluation_at.date()),
                version,
                evaluator_1: input.evaluator_1,
                evaluator_2: input.evaluator_2,
                active: true,
            };
            tx.insert_evaluation(&evaluation)?;
            Ok(evaluation)
        })?;

        info!(
            evaluation_id = %evaluation.id,
            proposal_id = %evaluation.proposal_id,
            kind = evaluation.kind.as_str(),
            version = evaluation.version,
            "evaluation assigned"
        );
        Ok(evaluation)
    }

    /// Overwrite a stored evaluation, applying the verdict's effect on the
    /// proposal. Minimal-review evaluations get today's date as verdict date.
    ///
    /// # Errors
    /// `NotFound` when the evaluation or its proposal is unknown.
    pub fn update_evaluation(&self, evaluation: Evaluation) -> ServiceResult<Evaluation> {
        debug!(evaluation_id = %evaluation.id, "update_evaluation start");
        let now = self.now();
        let updated = self.write(|tx| {
            let stored = load_evaluation(tx, evaluation.id)?;
            let mut updated = Evaluation { proposal_id: stored.proposal_id, ..evaluation.clone() };
            if updated.minimal_review {
                updated.verdict_date = Some(now.date());
            }

            let mut proposal = load_proposal(tx, stored.proposal_id)?;
            if let Some(state) = verdict_transition(updated.verdict, updated.minimal_review, proposal.state) {
                let expected = proposal.version;
                enter_state(tx, &mut proposal, state, now)?;
                persist(tx, &proposal, expected)?;
            }

            tx.update_evaluation(&updated)?;
            Ok(updated)
        })?;
        debug!(evaluation_id = %updated.id, verdict = ?updated.verdict, "update_evaluation end");
        Ok(updated)
    }

    /// Withdraw an evaluation from its meeting, stepping the proposal (or its
    /// retrospective) back to where the assignment found it.
    ///
    /// # Errors
    /// `NotFound` when the evaluation or proposal is unknown;
    /// `IllegalArgument` when the evaluation belongs to another meeting, the
    /// meeting is not ahead, a verdict exists or comments are attached.
    pub fn delete_evaluation(&self, meeting_id: MeetingId, evaluation_id: EvaluationId) -> ServiceResult<()> {
        debug!(meeting_id = %meeting_id, evaluation_id = %evaluation_id, "delete_evaluation start");
        let now = self.now();
        let proposal = self.write(|tx| {
            let evaluation = load_evaluation(tx, evaluation_id)?;
            if evaluation.meeting_id != meeting_id {
                return Err(ReviewError::illegal(format!(
                    "evaluation {evaluation_id} does not belong to meeting {meeting_id}"
                ))
                .into());
            }
            let mut proposal = load_proposal(tx, evaluation.proposal_id)?;
            ensure_removable_in(tx, &evaluation, now)?;

            let expected = proposal.version;
            if evaluation.kind == EvaluationKind::Retrospective {
                if let Some(retrospective) = proposal.retrospective.as_mut() {
                    retrospective.state = previous_retrospective_state(retrospective.state)?;
                }
            } else {
                step_back(tx, &mut proposal)?;
            }
            withdraw(tx, evaluation, &mut proposal)?;
            persist(tx, &proposal, expected)?;
            Ok(proposal)
        })?;
        info!(
            evaluation_id = %evaluation_id,
            proposal_id = %proposal.id,
            state = proposal.state.as_str(),
            version = proposal.version,
            "evaluation withdrawn"
        );
        Ok(())
    }

    /// # Errors
    /// `NotFound` when the evaluation is unknown.
    pub fn find_evaluation(&self, id: EvaluationId) -> ServiceResult<Evaluation> {
        self.read(|tx| load_evaluation(tx, id))
    }

    /// Active evaluations of an active proposal, newest version first.
    ///
    /// # Errors
    /// `NotFound` when the proposal is unknown or inactive.
    pub fn evaluations_by_proposal(
        &self,
        proposal_id: ProposalId,
        page: PageRequest,
    ) -> ServiceResult<Page<Evaluation>> {
        page.validate()?;
        self.read(|tx| {
            let proposal = load_proposal(tx, proposal_id)?;
            if !proposal.active {
                return Err(ReviewError::not_found("proposal", proposal_id).into());
            }
            Ok(tx.evaluations_by_proposal(proposal_id, page)?)
        })
    }

    /// Evaluations scheduled in a meeting, minimal-review passes excluded,
    /// each flagged with whether it can still be withdrawn.
    ///
    /// # Errors
    /// `NotFound` when the meeting is unknown.
    pub fn evaluations_by_meeting(
        &self,
        meeting_id: MeetingId,
        page: PageRequest,
    ) -> ServiceResult<Page<RemovableEvaluation>> {
        page.validate()?;
        let now = self.now();
        self.read(|tx| {
            let meeting = load_meeting(tx, meeting_id)?;
            let evaluations = tx.evaluations_by_meeting(meeting_id, page)?;
            let mut items = Vec::with_capacity(evaluations.items.len());
            for evaluation in evaluations.items {
                let comments = tx.count_comments(evaluation.id)?;
                let removable = ensure_removable(&evaluation, meeting.evaluation_at, now, comments).is_ok();
                items.push(RemovableEvaluation { evaluation, removable });
            }
            Ok(Page::new(items, page, evaluations.total))
        })
    }

    /// The first active evaluation of a proposal by version descending.
    ///
    /// # Errors
    /// `NotFound` when the proposal is unknown.
    pub fn current_evaluation(&self, proposal_id: ProposalId) -> ServiceResult<Option<Evaluation>> {
        self.read(|tx| {
            load_proposal(tx, proposal_id)?;
            Ok(tx.latest_active_evaluation(proposal_id)?)
        })
    }

    /// Active evaluators of a committee with no conflict of interest against
    /// the team of the proposal's request.
    ///
    /// # Errors
    /// `NotFound` when the proposal is unknown.
    pub fn eligible_evaluators(
        &self,
        committee_id: CommitteeId,
        proposal_id: ProposalId,
        page: PageRequest,
    ) -> ServiceResult<Page<Evaluator>> {
        page.validate()?;
        self.read(|tx| {
            let proposal = load_proposal(tx, proposal_id)?;
            Ok(tx.eligible_evaluators(committee_id, proposal.request_id, page)?)
        })
    }
}

pub(crate) fn load_evaluation(tx: &ReviewTx<'_>, id: EvaluationId) -> ServiceResult<Evaluation> {
    tx.find_evaluation(id)?.ok_or_else(|| ReviewError::not_found("evaluation", id).into())
}

/// Removal guard evaluated against the stored meeting and comment count.
pub(crate) fn ensure_removable_in(
    tx: &ReviewTx<'_>,
    evaluation: &Evaluation,
    now: OffsetDateTime,
) -> ServiceResult<()> {
    let meeting = load_meeting(tx, evaluation.meeting_id)?;
    let comments = tx.count_comments(evaluation.id)?;
    ensure_removable(evaluation, meeting.evaluation_at, now, comments)?;
    Ok(())
}
