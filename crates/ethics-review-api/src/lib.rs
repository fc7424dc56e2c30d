//! Lifecycle managers of the ethics review workflow.
//!
//! [`ReviewApi`] runs every operation inside one store transaction: either all
//! rows an operation touches (proposal, evaluation, retrospective, history)
//! commit together or none do.

use std::path::PathBuf;

use ethics_review_core::{
    Answer, AnswerId, Comment, CommentId, Committee, CommitteeId, ConflictOfInterest, Document,
    DocumentId, EvaluationId, EvaluationRequest, Evaluator, EvaluatorId, Meeting, MeetingId,
    MeetingKind, ProposalId, Report, ReportId, RequestId, ReviewError,
};
use ethics_review_store_sqlite::{ReviewTx, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::{debug, info};

mod error;
mod evaluation;
mod policy;
mod proposal;

pub use error::{ServiceError, ServiceResult};
pub use evaluation::{EvaluationInput, RemovableEvaluation};
pub use policy::{PolicyError, ReviewPolicy};
pub use proposal::{ProposalInput, RollbackOutcome};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterCommitteeRequest {
    pub code: String,
    pub form_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequestRequest {
    pub title: String,
    pub owner_ref: String,
    #[serde(default)]
    pub team: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleMeetingRequest {
    pub committee_id: CommitteeId,
    pub kind: MeetingKind,
    #[serde(with = "time::serde::rfc3339")]
    pub evaluation_at: OffsetDateTime,
    pub cutoff_date: Date,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachDocumentRequest {
    pub proposal_id: ProposalId,
    pub document_type: String,
    pub document_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordAnswerRequest {
    pub proposal_id: ProposalId,
    pub section_ref: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ReviewApi {
    db_path: PathBuf,
    policy: ReviewPolicy,
    clock: fn() -> OffsetDateTime,
}

impl ReviewApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_policy(db_path, ReviewPolicy::default())
    }

    #[must_use]
    pub fn with_policy(db_path: PathBuf, policy: ReviewPolicy) -> Self {
        Self { db_path, policy, clock: OffsetDateTime::now_utc }
    }

    /// Replace the wall clock used for dates stamped by the managers.
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &ReviewPolicy {
        &self.policy
    }

    fn now(&self) -> OffsetDateTime {
        (self.clock)()
    }

    fn open_store(&self) -> ServiceResult<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Run `op` in a write transaction and commit when it succeeds.
    fn write<T>(&self, op: impl FnOnce(&ReviewTx<'_>) -> ServiceResult<T>) -> ServiceResult<T> {
        let mut store = self.open_store()?;
        let tx = store.transaction()?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn read<T>(&self, op: impl FnOnce(&ReviewTx<'_>) -> ServiceResult<T>) -> ServiceResult<T> {
        let mut store = self.open_store()?;
        let tx = store.read()?;
        op(&tx)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> ServiceResult<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        Ok(store.schema_status()?)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> ServiceResult<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Register an active committee.
    ///
    /// # Errors
    /// Returns an error when the code or form name is blank, or persistence fails.
    pub fn register_committee(&self, input: RegisterCommitteeRequest) -> ServiceResult<Committee> {
        if input.code.trim().is_empty() || input.form_name.trim().is_empty() {
            return Err(ReviewError::illegal("committee code and form name are required").into());
        }
        let committee = Committee {
            id: CommitteeId::new(),
            code: input.code,
            form_name: input.form_name,
            active: true,
        };
        self.write(|tx| Ok(tx.insert_committee(&committee)?))?;
        info!(committee_id = %committee.id, code = %committee.code, "committee registered");
        Ok(committee)
    }

    /// Register an active evaluation request and its team.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn register_request(&self, input: RegisterRequestRequest) -> ServiceResult<EvaluationRequest> {
        let request = EvaluationRequest {
            id: RequestId::new(),
            title: input.title,
            owner_ref: input.owner_ref,
            active: true,
        };
        self.write(|tx| Ok(tx.insert_request(&request, &input.team)?))?;
        info!(request_id = %request.id, "evaluation request registered");
        Ok(request)
    }

    /// # Errors
    /// Returns `NotFound` when the request is unknown.
    pub fn find_request(&self, id: RequestId) -> ServiceResult<EvaluationRequest> {
        self.read(|tx| tx.find_request(id)?.ok_or_else(|| ReviewError::not_found("request", id).into()))
    }

    /// Schedule a meeting of an existing committee.
    ///
    /// # Errors
    /// Returns `NotFound` when the committee is unknown.
    pub fn schedule_meeting(&self, input: ScheduleMeetingRequest) -> ServiceResult<Meeting> {
        let meeting = Meeting {
            id: MeetingId::new(),
            committee_id: input.committee_id,
            kind: input.kind,
            evaluation_at: input.evaluation_at,
            cutoff_date: input.cutoff_date,
            active: true,
        };
        self.write(|tx| {
            if tx.find_committee(meeting.committee_id)?.is_none() {
                return Err(ReviewError::not_found("committee", meeting.committee_id).into());
            }
            Ok(tx.insert_meeting(&meeting)?)
        })?;
        info!(meeting_id = %meeting.id, kind = meeting.kind.as_str(), "meeting scheduled");
        Ok(meeting)
    }

    /// # Errors
    /// Returns `NotFound` when the meeting is unknown.
    pub fn find_meeting(&self, id: MeetingId) -> ServiceResult<Meeting> {
        self.read(|tx| load_meeting(tx, id))
    }

    /// Attach an active document to a proposal.
    ///
    /// # Errors
    /// Returns `NotFound` when the proposal is unknown.
    pub fn attach_document(&self, input: AttachDocumentRequest) -> ServiceResult<Document> {
        let document = Document {
            id: DocumentId::new(),
            proposal_id: input.proposal_id,
            document_type: input.document_type,
            document_ref: input.document_ref,
            active: true,
        };
        self.write(|tx| {
            proposal::load_proposal(tx, document.proposal_id)?;
            Ok(tx.insert_document(&document)?)
        })?;
        debug!(document_id = %document.id, proposal_id = %document.proposal_id, "document attached");
        Ok(document)
    }

    /// # Errors
    /// Returns `NotFound` when the proposal is unknown.
    pub fn documents(&self, proposal_id: ProposalId) -> ServiceResult<Vec<Document>> {
        self.read(|tx| {
            proposal::load_proposal(tx, proposal_id)?;
            Ok(tx.active_documents(proposal_id)?)
        })
    }

    /// Record the answer to one form section of a proposal.
    ///
    /// # Errors
    /// Returns `NotFound` when the proposal is unknown.
    pub fn record_answer(&self, input: RecordAnswerRequest) -> ServiceResult<Answer> {
        let answer = Answer {
            id: AnswerId::new(),
            proposal_id: input.proposal_id,
            section_ref: input.section_ref,
            value: input.value,
        };
        self.write(|tx| {
            proposal::load_proposal(tx, answer.proposal_id)?;
            Ok(tx.insert_answer(&answer)?)
        })?;
        debug!(answer_id = %answer.id, proposal_id = %answer.proposal_id, "answer recorded");
        Ok(answer)
    }

    /// # Errors
    /// Returns `NotFound` when the proposal is unknown.
    pub fn answers(&self, proposal_id: ProposalId) -> ServiceResult<Vec<Answer>> {
        self.read(|tx| {
            proposal::load_proposal(tx, proposal_id)?;
            Ok(tx.answers(proposal_id)?)
        })
    }

    /// Add a comment to an evaluation. Comments block its removal.
    ///
    /// # Errors
    /// Returns `NotFound` when the evaluation is unknown.
    pub fn add_comment(&self, evaluation_id: EvaluationId, text: String) -> ServiceResult<Comment> {
        let comment = Comment { id: CommentId::new(), evaluation_id, text };
        self.write(|tx| {
            evaluation::load_evaluation(tx, evaluation_id)?;
            Ok(tx.insert_comment(&comment)?)
        })?;
        debug!(comment_id = %comment.id, evaluation_id = %evaluation_id, "comment added");
        Ok(comment)
    }

    /// Attach a generated report to a proposal.
    ///
    /// # Errors
    /// Returns `NotFound` when the proposal is unknown.
    pub fn attach_report(&self, proposal_id: ProposalId, document_ref: String) -> ServiceResult<Report> {
        let report = Report { id: ReportId::new(), proposal_id, document_ref };
        self.write(|tx| {
            proposal::load_proposal(tx, proposal_id)?;
            Ok(tx.insert_report(&report)?)
        })?;
        debug!(report_id = %report.id, proposal_id = %proposal_id, "report attached");
        Ok(report)
    }

    /// # Errors
    /// Returns `NotFound` when the proposal is unknown.
    pub fn reports(&self, proposal_id: ProposalId) -> ServiceResult<Vec<Report>> {
        self.read(|tx| {
            proposal::load_proposal(tx, proposal_id)?;
            Ok(tx.reports(proposal_id)?)
        })
    }

    /// Register an active evaluator of a committee.
    ///
    /// # Errors
    /// Returns `NotFound` when the committee is unknown.
    pub fn register_evaluator(
        &self,
        committee_id: CommitteeId,
        person_ref: String,
    ) -> ServiceResult<Evaluator> {
        let evaluator = Evaluator { id: EvaluatorId::new(), committee_id, person_ref, active: true };
        self.write(|tx| {
            if tx.find_committee(committee_id)?.is_none() {
                return Err(ReviewError::not_found("committee", committee_id).into());
            }
            Ok(tx.insert_evaluator(&evaluator)?)
        })?;
        info!(evaluator_id = %evaluator.id, committee_id = %committee_id, "evaluator registered");
        Ok(evaluator)
    }

    /// Declare that an evaluator has a conflict of interest with a person.
    ///
    /// # Errors
    /// Returns an error when the evaluator is unknown or persistence fails.
    pub fn declare_conflict(&self, conflict: ConflictOfInterest) -> ServiceResult<ConflictOfInterest> {
        self.write(|tx| Ok(tx.insert_conflict(&conflict)?))?;
        debug!(evaluator_id = %conflict.evaluator_id, "conflict of interest declared");
        Ok(conflict)
    }
}

fn load_meeting(tx: &ReviewTx<'_>, id: MeetingId) -> ServiceResult<Meeting> {
    tx.find_meeting(id)?.ok_or_else(|| ReviewError::not_found("meeting", id).into())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::path::PathBuf;

    use ethics_review_core::{Committee, EvaluationRequest, Meeting, MeetingKind};
    use time::{Duration, OffsetDateTime};

    use crate::{
        RegisterCommitteeRequest, RegisterRequestRequest, ReviewApi, ScheduleMeetingRequest,
        ServiceResult,
    };

    pub(crate) fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("ethics-review-api-{}.sqlite3", ulid::Ulid::new()))
    }

    pub(crate) fn cleanup(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    pub(crate) struct World {
        pub api: ReviewApi,
        pub db_path: PathBuf,
        pub committee: Committee,
        pub request: EvaluationRequest,
    }

    impl Drop for World {
        fn drop(&mut self) {
            cleanup(&self.db_path);
        }
    }

    pub(crate) fn world(committee_code: &str) -> ServiceResult<World> {
        let db_path = unique_temp_db_path();
        let api = ReviewApi::new(db_path.clone());
        let committee = api.register_committee(RegisterCommitteeRequest {
            code: committee_code.to_string(),
            form_name: "M10".to_string(),
        })?;
        let request = api.register_request(RegisterRequestRequest {
            title: "Sleep deprivation in rodents".to_string(),
            owner_ref: "owner-1".to_string(),
            team: vec!["owner-1".to_string(), "member-2".to_string()],
        })?;
        Ok(World { api, db_path, committee, request })
    }

    pub(crate) fn meeting_in(world: &World, kind: MeetingKind, offset: Duration) -> ServiceResult<Meeting> {
        let evaluation_at = OffsetDateTime::now_utc() + offset;
        world.api.schedule_meeting(ScheduleMeetingRequest {
            committee_id: world.committee.id,
            kind,
            evaluation_at,
            cutoff_date: OffsetDateTime::now_utc().date() + Duration::days(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{unique_temp_db_path, world};
    use super::*;
    use time::Duration;

    #[test]
    fn migrate_dry_run_then_apply() -> ServiceResult<()> {
        let db_path = unique_temp_db_path();
        let api = ReviewApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        super::fixtures::cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn meeting_requires_known_committee() -> ServiceResult<()> {
        let world = world("CEI")?;
        let result = world.api.schedule_meeting(ScheduleMeetingRequest {
            committee_id: CommitteeId::new(),
            kind: MeetingKind::Ordinary,
            evaluation_at: OffsetDateTime::now_utc() + Duration::days(3),
            cutoff_date: OffsetDateTime::now_utc().date(),
        });
        let Err(err) = result else {
            panic!("unknown committee should be rejected");
        };
        assert!(err.is_not_found());
        Ok(())
    }

    #[test]
    fn blank_committee_code_is_illegal() -> ServiceResult<()> {
        let world = world("CEI")?;
        let result = world
            .api
            .register_committee(RegisterCommitteeRequest { code: " ".to_string(), form_name: "M20".to_string() });
        assert!(result.is_err_and(|err| err.is_illegal_argument()));
        Ok(())
    }
}
