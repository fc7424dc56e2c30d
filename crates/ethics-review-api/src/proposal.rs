//! Proposal lifecycle: creation, copy-on-modify, secretariat submission,
//! assignment eligibility and rollback.

use ethics_review_core::{
    next_reference, previous_retrospective_state, previous_state, rollback_allowed,
    secretariat_submission, Answer, AnswerId, AssignmentWindow, Committee, CommitteeId, Document,
    DocumentId, Evaluation, EvaluationId, EvaluationKind, EvaluationRequest, MeetingId,
    MeetingKind, Page, PageRequest, Proposal, ProposalId, ProposalKind, ProposalState, RequestId,
    Retrospective, RetrospectiveState, ReviewError, StateChange, StateHistoryEntry,
};
use ethics_review_store_sqlite::ReviewTx;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::{debug, error, info, warn};

use crate::evaluation::ensure_removable_in;
use crate::{load_meeting, ReviewApi, ServiceError, ServiceResult};

/// Caller-supplied fields of a new proposal. Everything else (reference,
/// state, version, flags) is computed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposalInput {
    /// MUST be absent; present only so a client echoing a stored proposal is
    /// rejected instead of silently re-created.
    #[serde(default)]
    pub id: Option<ProposalId>,
    pub request_id: Option<RequestId>,
    pub committee_id: CommitteeId,
    pub title: String,
    pub owner_ref: String,
    pub kind: ProposalKind,
}

/// Result of [`ReviewApi::rollback_state`]. Only `RolledBack` means the
/// proposal changed; the other two leave the store untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackOutcome {
    RolledBack(Proposal),
    /// A precondition of the rollback did not hold.
    Rejected(ReviewError),
    /// The store failed part-way; the transaction was discarded.
    Failed(String),
}

impl RollbackOutcome {
    #[must_use]
    pub fn rolled_back(&self) -> Option<&Proposal> {
        match self {
            Self::RolledBack(proposal) => Some(proposal),
            Self::Rejected(_) | Self::Failed(_) => None,
        }
    }
}

impl ReviewApi {
    /// Create a NEW or RATIFICATION proposal in DRAFTING with version 0.
    ///
    /// # Errors
    /// `IllegalArgument` when an id is supplied, the kind is MODIFICATION or the
    /// request id is missing; `NotFound` when the request or committee is
    /// unknown or inactive.
    pub fn create_proposal(&self, input: ProposalInput) -> ServiceResult<Proposal> {
        debug!(committee_id = %input.committee_id, kind = input.kind.as_str(), "create_proposal start");
        if !matches!(input.kind, ProposalKind::New | ProposalKind::Ratification) {
            return Err(ReviewError::illegal(
                "only new or ratification proposals can be created directly",
            )
            .into());
        }
        let request_id = validate_input(&input)?;
        let now = self.now();
        let width = self.policy.reference_sequence_width;

        let proposal = self.write(|tx| {
            let committee = check_provenance(tx, request_id, input.committee_id)?;
            let candidates = tx.reference_candidates(committee.id)?;
            let reference =
                next_reference(input.kind, &committee.form_name, now.year(), width, None, &candidates)?;

            let proposal = Proposal {
                id: ProposalId::new(),
                reference,
                request_id,
                committee_id: committee.id,
                title: input.title.clone(),
                owner_ref: input.owner_ref.clone(),
                kind: input.kind,
                state: ProposalState::Drafting,
                submitted_at: None,
                requires_retrospective: false,
                retrospective: None,
                version: 0,
                original_id: None,
                active: true,
            };
            tx.insert_proposal(&proposal)?;
            tx.append_history(proposal.id, ProposalState::Drafting, now)?;
            Ok(proposal)
        })?;

        info!(proposal_id = %proposal.id, reference = %proposal.reference, "proposal created");
        Ok(proposal)
    }

    /// Create a MODIFICATION copy of an active proposal, cloning its active
    /// documents and its answers onto the copy.
    ///
    /// # Errors
    /// `IllegalArgument` when the kind is not MODIFICATION, an id is supplied
    /// or the request id is missing; `NotFound` when the original is unknown or
    /// inactive, or the request or committee lookup misses.
    pub fn create_modified_proposal(
        &self,
        input: ProposalInput,
        original_id: ProposalId,
    ) -> ServiceResult<Proposal> {
        debug!(original_id = %original_id, "create_modified_proposal start");
        if input.kind != ProposalKind::Modification {
            return Err(ReviewError::illegal("a modified proposal must be of kind modification").into());
        }
        let request_id = validate_input(&input)?;
        let now = self.now();
        let width = self.policy.reference_sequence_width;

        let (proposal, copied_documents, copied_answers) = self.write(|tx| {
            check_provenance(tx, request_id, input.committee_id)?;
            let original = tx
                .find_proposal(original_id)?
                .filter(|original| original.active)
                .ok_or_else(|| ReviewError::not_found("proposal", original_id))?;
            let original_committee = tx
                .find_committee(original.committee_id)?
                .ok_or_else(|| ReviewError::not_found("committee", original.committee_id))?;
            let candidates = tx.reference_candidates(original_committee.id)?;
            let reference = next_reference(
                ProposalKind::Modification,
                &original_committee.form_name,
                now.year(),
                width,
                Some(&original.reference),
                &candidates,
            )?;

            let proposal = Proposal {
                id: ProposalId::new(),
                reference,
                request_id,
                committee_id: input.committee_id,
                title: input.title.clone(),
                owner_ref: input.owner_ref.clone(),
                kind: ProposalKind::Modification,
                state: ProposalState::Drafting,
                submitted_at: None,
                requires_retrospective: original.requires_retrospective,
                retrospective: None,
                version: 1,
                original_id: Some(original.id),
                active: true,
            };
            tx.insert_proposal(&proposal)?;
            tx.append_history(proposal.id, ProposalState::Drafting, now)?;

            let documents = tx.active_documents(original.id)?;
            for document in &documents {
                tx.insert_document(&Document {
                    id: DocumentId::new(),
                    proposal_id: proposal.id,
                    ..document.clone()
                })?;
            }
            let answers = tx.answers(original.id)?;
            for answer in &answers {
                tx.insert_answer(&Answer {
                    id: AnswerId::new(),
                    proposal_id: proposal.id,
                    ..answer.clone()
                })?;
            }
            Ok((proposal, documents.len(), answers.len()))
        })?;

        info!(
            proposal_id = %proposal.id,
            original_id = %original_id,
            reference = %proposal.reference,
            copied_documents,
            copied_answers,
            "modified proposal created"
        );
        Ok(proposal)
    }

    /// Overwrite a stored proposal. `proposal.version` MUST equal the stored
    /// version; a stale copy is a `Conflict`. Deactivation is only allowed
    /// from DRAFTING or COMPLETED. `original_id` is never rewritten.
    ///
    /// # Errors
    /// `NotFound` for an unknown id, `IllegalArgument` for a forbidden
    /// deactivation, `Conflict` for a stale version.
    pub fn update_proposal(&self, proposal: Proposal) -> ServiceResult<Proposal> {
        debug!(proposal_id = %proposal.id, "update_proposal start");
        let now = self.now();
        let updated = self.write(|tx| {
            let stored = load_proposal(tx, proposal.id)?;
            if stored.active
                && !proposal.active
                && !matches!(stored.state, ProposalState::Drafting | ProposalState::Completed)
            {
                return Err(ReviewError::illegal(format!(
                    "proposal in state {} cannot be deactivated",
                    stored.state.as_str()
                ))
                .into());
            }
            if proposal.version != stored.version {
                return Err(stale(&stored, proposal.version).into());
            }

            let mut updated = Proposal { original_id: stored.original_id, ..proposal.clone() };
            updated.state = stored.state;
            if proposal.state != stored.state {
                enter_state(tx, &mut updated, proposal.state, now)?;
            }
            persist(tx, &updated, stored.version)?;
            Ok(updated)
        })?;
        debug!(proposal_id = %updated.id, "update_proposal end");
        Ok(updated)
    }

    /// # Errors
    /// `NotFound` when the proposal is unknown.
    pub fn find_proposal(&self, id: ProposalId) -> ServiceResult<Proposal> {
        self.read(|tx| load_proposal(tx, id))
    }

    /// Hard-delete a proposal together with the rows it owns.
    ///
    /// # Errors
    /// `NotFound` when the proposal is unknown.
    pub fn delete_proposal(&self, id: ProposalId) -> ServiceResult<()> {
        self.write(|tx| {
            if tx.delete_proposal(id)? {
                Ok(())
            } else {
                Err(ReviewError::not_found("proposal", id).into())
            }
        })?;
        info!(proposal_id = %id, "proposal deleted");
        Ok(())
    }

    /// Active proposals of an active committee.
    ///
    /// # Errors
    /// `NotFound` when the committee is unknown or inactive; `IllegalArgument`
    /// for an empty page.
    pub fn proposals_by_committee(
        &self,
        committee_id: CommitteeId,
        page: PageRequest,
    ) -> ServiceResult<Page<Proposal>> {
        page.validate()?;
        self.read(|tx| {
            tx.find_committee(committee_id)?
                .filter(|committee| committee.active)
                .ok_or_else(|| ReviewError::not_found("committee", committee_id))?;
            Ok(tx.proposals_by_committee(committee_id, page)?)
        })
    }

    /// State history of a proposal, most recent first.
    ///
    /// # Errors
    /// `NotFound` when the proposal is unknown.
    pub fn state_history(&self, id: ProposalId) -> ServiceResult<Vec<StateHistoryEntry>> {
        self.read(|tx| {
            load_proposal(tx, id)?;
            Ok(tx.state_history(id)?)
        })
    }

    /// The state one step back, without changing anything. With
    /// `retrospective` set, the predecessor of the retrospective sub-record is
    /// computed instead of the proposal's.
    ///
    /// # Errors
    /// `NotFound` when the proposal is unknown; `IllegalArgument` when there is
    /// no predecessor or no retrospective.
    pub fn previous_state(&self, id: ProposalId, retrospective: bool) -> ServiceResult<StateChange> {
        self.read(|tx| {
            let proposal = load_proposal(tx, id)?;
            if retrospective {
                let current = proposal
                    .retrospective_state()
                    .ok_or_else(|| ReviewError::illegal("proposal has no retrospective"))?;
                return Ok(StateChange::Retrospective(previous_retrospective_state(current)?));
            }
            let history = tx.state_history(id)?;
            Ok(StateChange::Proposal(previous_state(&history, proposal.state)?.state))
        })
    }

    /// Move a proposal to `state`, logging the entry in its history.
    ///
    /// # Errors
    /// `NotFound` when the proposal is unknown.
    pub fn advance_state(&self, id: ProposalId, state: ProposalState) -> ServiceResult<Proposal> {
        let now = self.now();
        self.write(|tx| {
            let mut proposal = load_proposal(tx, id)?;
            let expected = proposal.version;
            enter_state(tx, &mut proposal, state, now)?;
            persist(tx, &proposal, expected)?;
            Ok(proposal)
        })
    }

    /// Undo the last transition of a proposal in IN_SECRETARIAT,
    /// IN_SECRETARIAT_MINIMAL_REVIEW, ARCHIVED or IN_EVALUATION.
    ///
    /// Leaving IN_EVALUATION withdraws the assignment: the active evaluation of
    /// the current version is deactivated, provided its meeting is still ahead,
    /// no verdict was issued and nobody commented. Leaving a secretariat state
    /// drops the generated reports.
    ///
    /// Failures after the state check come back as `Rejected` or `Failed`
    /// rather than `Err`; either way nothing is written.
    ///
    /// # Errors
    /// `NotFound` when the proposal is unknown; `IllegalArgument` when its
    /// state cannot be rolled back; a store error when the database is
    /// unreachable before the rollback starts.
    pub fn rollback_state(&self, id: ProposalId) -> ServiceResult<RollbackOutcome> {
        debug!(proposal_id = %id, "rollback_state start");
        let now = self.now();
        let mut store = self.open_store()?;
        let tx = store.transaction()?;
        let proposal = load_proposal(&tx, id)?;
        if !rollback_allowed(proposal.state) {
            return Err(ReviewError::illegal(format!(
                "proposal in state {} cannot be rolled back",
                proposal.state.as_str()
            ))
            .into());
        }

        let from = proposal.state;
        let outcome = match roll_back(&tx, proposal, now) {
            Ok(proposal) => match tx.commit() {
                Ok(()) => RollbackOutcome::RolledBack(proposal),
                Err(err) => RollbackOutcome::Failed(format!("{err:#}")),
            },
            Err(ServiceError::Review(reason)) => RollbackOutcome::Rejected(reason),
            Err(ServiceError::Store(err)) => RollbackOutcome::Failed(format!("{err:#}")),
        };

        match &outcome {
            RollbackOutcome::RolledBack(proposal) => info!(
                proposal_id = %id,
                from = from.as_str(),
                to = proposal.state.as_str(),
                version = proposal.version,
                "proposal rolled back"
            ),
            RollbackOutcome::Rejected(reason) => {
                warn!(proposal_id = %id, from = from.as_str(), %reason, "rollback rejected");
            }
            RollbackOutcome::Failed(cause) => {
                error!(proposal_id = %id, from = from.as_str(), %cause, "rollback failed");
            }
        }
        Ok(outcome)
    }

    /// Send a proposal to the secretariat on behalf of `person_ref`, who MUST
    /// own the originating request. Leaving FAVORABLE_PENDING_MINIMAL_MODS or
    /// IN_CLARIFICATION_FINAL_FOLLOWUP spawns a minimal-review copy of the
    /// current evaluation at the next version.
    ///
    /// # Errors
    /// `NotFound` when the proposal, its request or (when spawning) its current
    /// evaluation is missing; `IllegalArgument` for a wrong state or owner.
    pub fn submit_to_secretariat(&self, id: ProposalId, person_ref: &str) -> ServiceResult<Proposal> {
        debug!(proposal_id = %id, "submit_to_secretariat start");
        let now = self.now();
        let (proposal, spawned) = self.write(|tx| {
            let mut proposal = load_proposal(tx, id)?;
            let submission = secretariat_submission(proposal.state)?;
            ensure_owner(tx, &proposal, person_ref)?;
            let expected = proposal.version;

            let spawned = if submission.spawn_minimal_review {
                let current = tx
                    .latest_active_evaluation(id)?
                    .ok_or_else(|| ReviewError::not_found("evaluation of proposal", id))?;
                // Followup evaluations number past the proposal's own version.
                proposal.version = proposal.version.max(current.version) + 1;
                Some(Evaluation {
                    id: EvaluationId::new(),
                    version: proposal.version,
                    minimal_review: true,
                    ..current
                })
            } else {
                None
            };

            enter_state(tx, &mut proposal, submission.target, now)?;
            proposal.submitted_at = Some(now.date());
            persist(tx, &proposal, expected)?;
            if let Some(evaluation) = &spawned {
                tx.insert_evaluation(evaluation)?;
            }
            Ok((proposal, spawned))
        })?;

        if let Some(evaluation) = spawned {
            info!(
                proposal_id = %id,
                evaluation_id = %evaluation.id,
                version = evaluation.version,
                "minimal review evaluation spawned"
            );
        }
        Ok(proposal)
    }

    /// Send a proposal's retrospective to the secretariat.
    ///
    /// # Errors
    /// `NotFound` when the proposal, committee or request is missing;
    /// `IllegalArgument` unless the proposal is COMPLETED, requires a
    /// retrospective, belongs to the retrospective committee and is owned by
    /// `person_ref`.
    pub fn submit_retrospective_to_secretariat(
        &self,
        id: ProposalId,
        person_ref: &str,
    ) -> ServiceResult<Proposal> {
        debug!(proposal_id = %id, "submit_retrospective_to_secretariat start");
        let committee_code = self.policy.retrospective_committee_code.as_str();
        let proposal = self.write(|tx| {
            let mut proposal = load_proposal(tx, id)?;
            let committee = load_committee(tx, proposal.committee_id)?;
            if proposal.state != ProposalState::Completed
                || !proposal.requires_retrospective
                || committee.code != committee_code
            {
                return Err(ReviewError::illegal(
                    "proposal is not in a state to send its retrospective to the secretariat",
                )
                .into());
            }
            ensure_owner(tx, &proposal, person_ref)?;

            let expected = proposal.version;
            let retrospective = proposal
                .retrospective
                .as_mut()
                .ok_or_else(|| ReviewError::illegal("proposal has no retrospective record"))?;
            retrospective.state = RetrospectiveState::InSecretariat;
            persist(tx, &proposal, expected)?;
            Ok(proposal)
        })?;
        info!(proposal_id = %id, "retrospective sent to the secretariat");
        Ok(proposal)
    }

    /// Flag a proposal as requiring a retrospective review on `review_date`,
    /// opening its retrospective record in PENDING when it has none.
    ///
    /// # Errors
    /// `NotFound` when the proposal is unknown.
    pub fn schedule_retrospective(&self, id: ProposalId, review_date: Date) -> ServiceResult<Proposal> {
        self.write(|tx| {
            let mut proposal = load_proposal(tx, id)?;
            let expected = proposal.version;
            proposal.requires_retrospective = true;
            proposal.retrospective = Some(match proposal.retrospective {
                Some(existing) => Retrospective { review_date, ..existing },
                None => Retrospective { state: RetrospectiveState::Pending, review_date },
            });
            persist(tx, &proposal, expected)?;
            Ok(proposal)
        })
    }

    /// Proposals a meeting may take, with an exact total.
    ///
    /// # Errors
    /// `NotFound` when the meeting is unknown; `IllegalArgument` for an empty page.
    pub fn find_assignable(&self, meeting_id: MeetingId, page: PageRequest) -> ServiceResult<Page<Proposal>> {
        page.validate()?;
        self.read(|tx| {
            let meeting = load_meeting(tx, meeting_id)?;
            let window = AssignmentWindow::for_meeting(meeting.kind);
            Ok(tx.assignable_proposals(meeting.committee_id, &window, meeting.cutoff_date, page)?)
        })
    }

    /// Like [`ReviewApi::find_assignable`], for a meeting that is not stored yet.
    ///
    /// # Errors
    /// `IllegalArgument` for an empty page.
    pub fn find_assignable_for(
        &self,
        committee_id: CommitteeId,
        meeting_kind: MeetingKind,
        cutoff: Date,
        page: PageRequest,
    ) -> ServiceResult<Page<Proposal>> {
        page.validate()?;
        self.read(|tx| {
            let window = AssignmentWindow::for_meeting(meeting_kind);
            Ok(tx.assignable_proposals(committee_id, &window, cutoff, page)?)
        })
    }
}

fn validate_input(input: &ProposalInput) -> ServiceResult<RequestId> {
    if input.id.is_some() {
        return Err(ReviewError::illegal("a new proposal cannot carry an id").into());
    }
    input
        .request_id
        .ok_or_else(|| ReviewError::illegal("the evaluation request id is required").into())
}

/// The originating request and the committee MUST both exist and be active.
fn check_provenance(
    tx: &ReviewTx<'_>,
    request_id: RequestId,
    committee_id: CommitteeId,
) -> ServiceResult<Committee> {
    tx.find_request(request_id)?
        .filter(|request| request.active)
        .ok_or_else(|| ReviewError::not_found("request", request_id))?;
    let committee = tx
        .find_committee(committee_id)?
        .filter(|committee| committee.active)
        .ok_or_else(|| ReviewError::not_found("committee", committee_id))?;
    Ok(committee)
}

fn ensure_owner(tx: &ReviewTx<'_>, proposal: &Proposal, person_ref: &str) -> ServiceResult<EvaluationRequest> {
    let request = tx
        .find_request(proposal.request_id)?
        .ok_or_else(|| ReviewError::not_found("request", proposal.request_id))?;
    if request.owner_ref != person_ref {
        return Err(ReviewError::illegal(format!(
            "{person_ref} does not own evaluation request {}",
            request.id
        ))
        .into());
    }
    Ok(request)
}

fn load_committee(tx: &ReviewTx<'_>, id: CommitteeId) -> ServiceResult<Committee> {
    tx.find_committee(id)?.ok_or_else(|| ReviewError::not_found("committee", id).into())
}

pub(crate) fn load_proposal(tx: &ReviewTx<'_>, id: ProposalId) -> ServiceResult<Proposal> {
    tx.find_proposal(id)?.ok_or_else(|| ReviewError::not_found("proposal", id).into())
}

/// Write `proposal` if the stored version is still `expected`.
pub(crate) fn persist(tx: &ReviewTx<'_>, proposal: &Proposal, expected: u32) -> ServiceResult<()> {
    if tx.update_proposal(proposal, expected)? {
        return Ok(());
    }
    match tx.find_proposal(proposal.id)? {
        Some(stored) => Err(stale(&stored, expected).into()),
        None => Err(ReviewError::not_found("proposal", proposal.id).into()),
    }
}

fn stale(stored: &Proposal, expected: u32) -> ReviewError {
    ReviewError::Conflict(format!(
        "proposal {} is at version {}, not {expected}",
        stored.id, stored.version
    ))
}

/// Record entry into `state` in the history and set it on `proposal`.
pub(crate) fn enter_state(
    tx: &ReviewTx<'_>,
    proposal: &mut Proposal,
    state: ProposalState,
    now: OffsetDateTime,
) -> ServiceResult<()> {
    tx.append_history(proposal.id, state, now)?;
    info!(
        proposal_id = %proposal.id,
        from = proposal.state.as_str(),
        to = state.as_str(),
        "proposal state changed"
    );
    proposal.state = state;
    Ok(())
}

/// Return `proposal` to the state recorded before its current one, dropping
/// every leading history row of the current state.
pub(crate) fn step_back(tx: &ReviewTx<'_>, proposal: &mut Proposal) -> ServiceResult<()> {
    let history = tx.state_history(proposal.id)?;
    let previous = previous_state(&history, proposal.state)?;
    for entry in &previous.discarded_entries {
        tx.delete_history_entry(*entry)?;
    }
    proposal.state = previous.state;
    Ok(())
}

fn roll_back(tx: &ReviewTx<'_>, mut proposal: Proposal, now: OffsetDateTime) -> ServiceResult<Proposal> {
    let expected = proposal.version;
    match proposal.state {
        ProposalState::InEvaluation => {
            let evaluation = tx
                .active_evaluation_for_version(proposal.id, proposal.version)?
                .ok_or_else(|| {
                    ReviewError::not_found(
                        "active evaluation",
                        format!("{} v{}", proposal.id, proposal.version),
                    )
                })?;
            ensure_removable_in(tx, &evaluation, now)?;
            withdraw(tx, evaluation, &mut proposal)?;
        }
        ProposalState::InSecretariatMinimalReview => {
            // The submission spawned a minimal-review copy at the current version.
            if let Some(spawned) = tx
                .active_evaluation_for_version(proposal.id, proposal.version)?
                .filter(|evaluation| evaluation.minimal_review)
            {
                withdraw(tx, spawned, &mut proposal)?;
            }
            let dropped = tx.delete_reports(proposal.id)?;
            debug!(proposal_id = %proposal.id, dropped, "reports dropped");
        }
        ProposalState::InSecretariat => {
            let dropped = tx.delete_reports(proposal.id)?;
            debug!(proposal_id = %proposal.id, dropped, "reports dropped");
        }
        _ => {}
    }
    step_back(tx, &mut proposal)?;
    persist(tx, &proposal, expected)?;
    Ok(proposal)
}

/// Deactivate `evaluation` and give back the version its creation took.
pub(crate) fn withdraw(
    tx: &ReviewTx<'_>,
    mut evaluation: Evaluation,
    proposal: &mut Proposal,
) -> ServiceResult<()> {
    if evaluation.kind == EvaluationKind::Proposal || evaluation.minimal_review {
        proposal.version = proposal.version.saturating_sub(1);
    }
    evaluation.active = false;
    tx.update_evaluation(&evaluation)?;
    debug!(evaluation_id = %evaluation.id, proposal_id = %proposal.id, "evaluation deactivated");
    Ok(())
}
