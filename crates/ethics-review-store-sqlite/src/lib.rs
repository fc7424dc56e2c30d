use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ethics_review_core::transitions::AssignmentWindow;
use ethics_review_core::{
    Answer, AnswerId, Comment, Committee, CommitteeId, ConflictOfInterest, Document,
    DocumentId, Evaluation, EvaluationId, EvaluationKind, EvaluationRequest, Evaluator,
    EvaluatorId, Meeting, MeetingId, MeetingKind, Page, PageRequest, Proposal, ProposalId,
    ProposalKind, ProposalState, ReferenceCandidate, Report, ReportId, RequestId, Retrospective,
    RetrospectiveState, ReviewError, StateHistoryEntry, Verdict,
};
use rusqlite::{params, Connection, ErrorCode, Params, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS committees (
  committee_id TEXT PRIMARY KEY,
  code TEXT NOT NULL,
  form_name TEXT NOT NULL,
  active INTEGER NOT NULL CHECK (active IN (0, 1))
);

CREATE TABLE IF NOT EXISTS evaluation_requests (
  request_id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  owner_ref TEXT NOT NULL,
  active INTEGER NOT NULL CHECK (active IN (0, 1))
);

CREATE TABLE IF NOT EXISTS request_team_members (
  request_id TEXT NOT NULL,
  person_ref TEXT NOT NULL,
  PRIMARY KEY (request_id, person_ref),
  FOREIGN KEY (request_id) REFERENCES evaluation_requests(request_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS proposals (
  proposal_id TEXT PRIMARY KEY,
  reference TEXT NOT NULL,
  request_id TEXT NOT NULL,
  committee_id TEXT NOT NULL,
  title TEXT NOT NULL,
  owner_ref TEXT NOT NULL,
  kind INTEGER NOT NULL CHECK (kind BETWEEN 1 AND 3),
  state INTEGER NOT NULL CHECK (state BETWEEN 1 AND 21),
  submitted_at TEXT,
  requires_retrospective INTEGER NOT NULL CHECK (requires_retrospective IN (0, 1)),
  retrospective_state INTEGER CHECK (retrospective_state BETWEEN 1 AND 5),
  retrospective_review_date TEXT,
  version INTEGER NOT NULL CHECK (version >= 0),
  original_id TEXT,
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  CHECK ((retrospective_state IS NULL) = (retrospective_review_date IS NULL)),
  FOREIGN KEY (request_id) REFERENCES evaluation_requests(request_id),
  FOREIGN KEY (committee_id) REFERENCES committees(committee_id),
  FOREIGN KEY (original_id) REFERENCES proposals(proposal_id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS proposal_state_history (
  history_id INTEGER PRIMARY KEY AUTOINCREMENT,
  proposal_id TEXT NOT NULL,
  state INTEGER NOT NULL CHECK (state BETWEEN 1 AND 21),
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (proposal_id) REFERENCES proposals(proposal_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS meetings (
  meeting_id TEXT PRIMARY KEY,
  committee_id TEXT NOT NULL,
  kind INTEGER NOT NULL CHECK (kind BETWEEN 1 AND 3),
  evaluation_at TEXT NOT NULL,
  cutoff_date TEXT NOT NULL,
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  FOREIGN KEY (committee_id) REFERENCES committees(committee_id)
);

CREATE TABLE IF NOT EXISTS evaluators (
  evaluator_id TEXT PRIMARY KEY,
  committee_id TEXT NOT NULL,
  person_ref TEXT NOT NULL,
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  FOREIGN KEY (committee_id) REFERENCES committees(committee_id)
);

CREATE TABLE IF NOT EXISTS evaluator_conflicts (
  evaluator_id TEXT NOT NULL,
  person_ref TEXT NOT NULL,
  PRIMARY KEY (evaluator_id, person_ref),
  FOREIGN KEY (evaluator_id) REFERENCES evaluators(evaluator_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS evaluations (
  evaluation_id TEXT PRIMARY KEY,
  proposal_id TEXT NOT NULL,
  meeting_id TEXT NOT NULL,
  kind INTEGER NOT NULL CHECK (kind BETWEEN 1 AND 4),
  verdict INTEGER CHECK (verdict BETWEEN 1 AND 4),
  minimal_review INTEGER NOT NULL CHECK (minimal_review IN (0, 1)),
  verdict_date TEXT,
  version INTEGER NOT NULL CHECK (version >= 0),
  evaluator_1 TEXT,
  evaluator_2 TEXT,
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  FOREIGN KEY (proposal_id) REFERENCES proposals(proposal_id) ON DELETE CASCADE,
  FOREIGN KEY (meeting_id) REFERENCES meetings(meeting_id),
  FOREIGN KEY (evaluator_1) REFERENCES evaluators(evaluator_id),
  FOREIGN KEY (evaluator_2) REFERENCES evaluators(evaluator_id)
);

CREATE TABLE IF NOT EXISTS evaluation_comments (
  comment_id TEXT PRIMARY KEY,
  evaluation_id TEXT NOT NULL,
  text TEXT NOT NULL,
  FOREIGN KEY (evaluation_id) REFERENCES evaluations(evaluation_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS proposal_documents (
  document_id TEXT PRIMARY KEY,
  proposal_id TEXT NOT NULL,
  document_type TEXT NOT NULL,
  document_ref TEXT NOT NULL,
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  FOREIGN KEY (proposal_id) REFERENCES proposals(proposal_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS proposal_answers (
  answer_id TEXT PRIMARY KEY,
  proposal_id TEXT NOT NULL,
  section_ref TEXT NOT NULL,
  value_json TEXT NOT NULL,
  FOREIGN KEY (proposal_id) REFERENCES proposals(proposal_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS proposal_reports (
  report_id TEXT PRIMARY KEY,
  proposal_id TEXT NOT NULL,
  document_ref TEXT NOT NULL,
  FOREIGN KEY (proposal_id) REFERENCES proposals(proposal_id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_evaluations_active_version
  ON evaluations(proposal_id, version) WHERE active = 1;
CREATE INDEX IF NOT EXISTS idx_proposals_committee ON proposals(committee_id, state);
CREATE INDEX IF NOT EXISTS idx_history_proposal ON proposal_state_history(proposal_id, history_id);
CREATE INDEX IF NOT EXISTS idx_evaluations_meeting ON evaluations(meeting_id);
CREATE INDEX IF NOT EXISTS idx_comments_evaluation ON evaluation_comments(evaluation_id);
";

const PROPOSAL_COLUMNS: &str = "proposal_id, reference, request_id, committee_id, title, owner_ref,
    kind, state, submitted_at, requires_retrospective, retrospective_state,
    retrospective_review_date, version, original_id, active";

const EVALUATION_COLUMNS: &str = "evaluation_id, proposal_id, meeting_id, kind, verdict,
    minimal_review, verdict_date, version, evaluator_1, evaluator_2, active";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed review store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Begin a write transaction that holds the database's reserved lock until
    /// it commits or drops, serializing concurrent writers.
    ///
    /// # Errors
    /// Returns an error when the lock cannot be acquired within the busy timeout.
    pub fn transaction(&mut self) -> Result<ReviewTx<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin immediate transaction")?;
        Ok(ReviewTx { tx })
    }

    /// Begin a read-only (deferred) transaction.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be started.
    pub fn read(&mut self) -> Result<ReviewTx<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .context("failed to begin read transaction")?;
        Ok(ReviewTx { tx })
    }
}

/// One unit of work against the review store. Dropping it without calling
/// [`ReviewTx::commit`] rolls every write back.
pub struct ReviewTx<'conn> {
    tx: Transaction<'conn>,
}

impl ReviewTx<'_> {
    /// # Errors
    /// Returns an error when the commit fails.
    pub fn commit(self) -> Result<()> {
        self.tx.commit().context("failed to commit review transaction")
    }

    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn insert_committee(&self, committee: &Committee) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO committees(committee_id, code, form_name, active) VALUES (?1, ?2, ?3, ?4)",
                params![
                    committee.id.to_string(),
                    committee.code,
                    committee.form_name,
                    committee.active,
                ],
            )
            .context("failed to insert committee")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn find_committee(&self, id: CommitteeId) -> Result<Option<Committee>> {
        let rows = collect(
            &self.tx,
            "SELECT committee_id, code, form_name, active FROM committees WHERE committee_id = ?1",
            params![id.to_string()],
            |row| {
                Ok(Committee {
                    id: CommitteeId(parse_ulid(&row.get::<_, String>(0)?)?),
                    code: row.get(1)?,
                    form_name: row.get(2)?,
                    active: row.get(3)?,
                })
            },
        )?;
        Ok(rows.into_iter().next())
    }

    /// Persist an evaluation request together with its team.
    ///
    /// # Errors
    /// Returns an error when any row cannot be written.
    pub fn insert_request(&self, request: &EvaluationRequest, team: &[String]) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO evaluation_requests(request_id, title, owner_ref, active)
                 VALUES (?1, ?2, ?3, ?4)",
                params![request.id.to_string(), request.title, request.owner_ref, request.active],
            )
            .context("failed to insert evaluation request")?;
        for person_ref in team {
            self.tx
                .execute(
                    "INSERT OR IGNORE INTO request_team_members(request_id, person_ref) VALUES (?1, ?2)",
                    params![request.id.to_string(), person_ref],
                )
                .context("failed to insert team member")?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn find_request(&self, id: RequestId) -> Result<Option<EvaluationRequest>> {
        let rows = collect(
            &self.tx,
            "SELECT request_id, title, owner_ref, active FROM evaluation_requests WHERE request_id = ?1",
            params![id.to_string()],
            |row| {
                Ok(EvaluationRequest {
                    id: RequestId(parse_ulid(&row.get::<_, String>(0)?)?),
                    title: row.get(1)?,
                    owner_ref: row.get(2)?,
                    active: row.get(3)?,
                })
            },
        )?;
        Ok(rows.into_iter().next())
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn team_members(&self, request_id: RequestId) -> Result<Vec<String>> {
        collect(
            &self.tx,
            "SELECT person_ref FROM request_team_members WHERE request_id = ?1 ORDER BY person_ref",
            params![request_id.to_string()],
            |row| Ok(row.get::<_, String>(0)?),
        )
    }

    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn insert_proposal(&self, proposal: &Proposal) -> Result<()> {
        let (retrospective_state, retrospective_review_date) = retrospective_columns(proposal)?;
        self.tx
            .execute(
                &format!(
                    "INSERT INTO proposals({PROPOSAL_COLUMNS}) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15
                    )"
                ),
                params![
                    proposal.id.to_string(),
                    proposal.reference,
                    proposal.request_id.to_string(),
                    proposal.committee_id.to_string(),
                    proposal.title,
                    proposal.owner_ref,
                    proposal.kind.id(),
                    proposal.state.id(),
                    proposal.submitted_at.map(format_date).transpose()?,
                    proposal.requires_retrospective,
                    retrospective_state,
                    retrospective_review_date,
                    i64::from(proposal.version),
                    proposal.original_id.map(|id| id.to_string()),
                    proposal.active,
                ],
            )
            .context("failed to insert proposal")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn find_proposal(&self, id: ProposalId) -> Result<Option<Proposal>> {
        let rows = collect(
            &self.tx,
            &format!("SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE proposal_id = ?1"),
            params![id.to_string()],
            decode_proposal,
        )?;
        Ok(rows.into_iter().next())
    }

    /// Overwrite every mutable column of a proposal, provided the stored
    /// version still equals `expected_version`. `original_id` is never
    /// rewritten.
    ///
    /// Returns `false` when no row matched, i.e. the proposal is unknown or
    /// was modified concurrently.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn update_proposal(&self, proposal: &Proposal, expected_version: u32) -> Result<bool> {
        let (retrospective_state, retrospective_review_date) = retrospective_columns(proposal)?;
        let changed = self
            .tx
            .execute(
                "UPDATE proposals SET
                    reference = ?2, request_id = ?3, committee_id = ?4, title = ?5,
                    owner_ref = ?6, kind = ?7, state = ?8, submitted_at = ?9,
                    requires_retrospective = ?10, retrospective_state = ?11,
                    retrospective_review_date = ?12, version = ?13, active = ?14
                 WHERE proposal_id = ?1 AND version = ?15",
                params![
                    proposal.id.to_string(),
                    proposal.reference,
                    proposal.request_id.to_string(),
                    proposal.committee_id.to_string(),
                    proposal.title,
                    proposal.owner_ref,
                    proposal.kind.id(),
                    proposal.state.id(),
                    proposal.submitted_at.map(format_date).transpose()?,
                    proposal.requires_retrospective,
                    retrospective_state,
                    retrospective_review_date,
                    i64::from(proposal.version),
                    proposal.active,
                    i64::from(expected_version),
                ],
            )
            .context("failed to update proposal")?;
        Ok(changed == 1)
    }

    /// Hard-delete a proposal; history, documents, answers, reports and
    /// evaluations go with it.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_proposal(&self, id: ProposalId) -> Result<bool> {
        let deleted = self
            .tx
            .execute("DELETE FROM proposals WHERE proposal_id = ?1", params![id.to_string()])
            .context("failed to delete proposal")?;
        Ok(deleted == 1)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn proposals_by_committee(
        &self,
        committee_id: CommitteeId,
        page: PageRequest,
    ) -> Result<Page<Proposal>> {
        let (limit, offset) = page_bounds(page)?;
        let total = count(
            &self.tx,
            "SELECT COUNT(*) FROM proposals WHERE committee_id = ?1 AND active = 1",
            params![committee_id.to_string()],
        )?;
        let items = collect(
            &self.tx,
            &format!(
                "SELECT {PROPOSAL_COLUMNS} FROM proposals
                 WHERE committee_id = ?1 AND active = 1
                 ORDER BY reference ASC, proposal_id ASC
                 LIMIT ?2 OFFSET ?3"
            ),
            params![committee_id.to_string(), limit, offset],
            decode_proposal,
        )?;
        Ok(Page::new(items, page, total))
    }

    /// Every reference the committee has issued, with the kind of proposal
    /// carrying it.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn reference_candidates(&self, committee_id: CommitteeId) -> Result<Vec<ReferenceCandidate>> {
        collect(
            &self.tx,
            "SELECT reference, kind FROM proposals WHERE committee_id = ?1",
            params![committee_id.to_string()],
            |row| {
                let kind: u8 = row.get(1)?;
                Ok(ReferenceCandidate {
                    reference: row.get(0)?,
                    kind: ProposalKind::from_id(kind)
                        .ok_or_else(|| anyhow!("unknown proposal kind id: {kind}"))?,
                })
            },
        )
    }

    /// Active proposals of a committee that fall inside a meeting's
    /// assignment window. Dated states require a submission on or before
    /// `cutoff`; a retrospective waiting in the secretariat is not date-gated.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn assignable_proposals(
        &self,
        committee_id: CommitteeId,
        window: &AssignmentWindow,
        cutoff: Date,
        page: PageRequest,
    ) -> Result<Page<Proposal>> {
        let states = window
            .states
            .iter()
            .map(|state| state.id().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let retrospective_clause = if window.retrospective_in_secretariat {
            format!(" OR retrospective_state = {}", RetrospectiveState::InSecretariat.id())
        } else {
            String::new()
        };
        let predicate = format!(
            "committee_id = ?1 AND active = 1
             AND ((state IN ({states}) AND submitted_at IS NOT NULL AND submitted_at <= ?2){retrospective_clause})"
        );
        let cutoff = format_date(cutoff)?;
        let (limit, offset) = page_bounds(page)?;

        let total = count(
            &self.tx,
            &format!("SELECT COUNT(*) FROM proposals WHERE {predicate}"),
            params![committee_id.to_string(), cutoff],
        )?;
        let items = collect(
            &self.tx,
            &format!(
                "SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE {predicate}
                 ORDER BY reference ASC, proposal_id ASC
                 LIMIT ?3 OFFSET ?4"
            ),
            params![committee_id.to_string(), cutoff, limit, offset],
            decode_proposal,
        )?;
        Ok(Page::new(items, page, total))
    }

    /// Append a history row recording entry into `state`.
    ///
    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn append_history(
        &self,
        proposal_id: ProposalId,
        state: ProposalState,
        recorded_at: OffsetDateTime,
    ) -> Result<i64> {
        self.tx
            .execute(
                "INSERT INTO proposal_state_history(proposal_id, state, recorded_at)
                 VALUES (?1, ?2, ?3)",
                params![proposal_id.to_string(), state.id(), rfc3339(recorded_at)?],
            )
            .context("failed to append state history")?;
        Ok(self.tx.last_insert_rowid())
    }

    /// State history of a proposal, most recent first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn state_history(&self, proposal_id: ProposalId) -> Result<Vec<StateHistoryEntry>> {
        collect(
            &self.tx,
            "SELECT history_id, proposal_id, state, recorded_at FROM proposal_state_history
             WHERE proposal_id = ?1
             ORDER BY history_id DESC",
            params![proposal_id.to_string()],
            |row| {
                Ok(StateHistoryEntry {
                    id: row.get(0)?,
                    proposal_id: ProposalId(parse_ulid(&row.get::<_, String>(1)?)?),
                    state: proposal_state(row.get(2)?)?,
                    recorded_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
                })
            },
        )
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_history_entry(&self, history_id: i64) -> Result<bool> {
        let deleted = self
            .tx
            .execute(
                "DELETE FROM proposal_state_history WHERE history_id = ?1",
                params![history_id],
            )
            .context("failed to delete state history row")?;
        Ok(deleted == 1)
    }

    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn insert_meeting(&self, meeting: &Meeting) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO meetings(meeting_id, committee_id, kind, evaluation_at, cutoff_date, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    meeting.id.to_string(),
                    meeting.committee_id.to_string(),
                    meeting.kind.id(),
                    rfc3339(meeting.evaluation_at)?,
                    format_date(meeting.cutoff_date)?,
                    meeting.active,
                ],
            )
            .context("failed to insert meeting")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn find_meeting(&self, id: MeetingId) -> Result<Option<Meeting>> {
        let rows = collect(
            &self.tx,
            "SELECT meeting_id, committee_id, kind, evaluation_at, cutoff_date, active
             FROM meetings WHERE meeting_id = ?1",
            params![id.to_string()],
            |row| {
                let kind: u8 = row.get(2)?;
                Ok(Meeting {
                    id: MeetingId(parse_ulid(&row.get::<_, String>(0)?)?),
                    committee_id: CommitteeId(parse_ulid(&row.get::<_, String>(1)?)?),
                    kind: MeetingKind::from_id(kind)
                        .ok_or_else(|| anyhow!("unknown meeting kind id: {kind}"))?,
                    evaluation_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
                    cutoff_date: parse_date(&row.get::<_, String>(4)?)?,
                    active: row.get(5)?,
                })
            },
        )?;
        Ok(rows.into_iter().next())
    }

    /// Insert an evaluation. A second active evaluation for the same
    /// (proposal, version) surfaces as [`ReviewError::Conflict`].
    ///
    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn insert_evaluation(&self, evaluation: &Evaluation) -> Result<()> {
        let outcome = self.tx.execute(
            &format!(
                "INSERT INTO evaluations({EVALUATION_COLUMNS}) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11
                )"
            ),
            params![
                evaluation.id.to_string(),
                evaluation.proposal_id.to_string(),
                evaluation.meeting_id.to_string(),
                evaluation.kind.id(),
                evaluation.verdict.map(Verdict::id),
                evaluation.minimal_review,
                evaluation.verdict_date.map(format_date).transpose()?,
                i64::from(evaluation.version),
                evaluation.evaluator_1.map(|id| id.to_string()),
                evaluation.evaluator_2.map(|id| id.to_string()),
                evaluation.active,
            ],
        );
        match outcome {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(active_version_conflict(evaluation)),
            Err(err) => Err(anyhow::Error::new(err).context("failed to insert evaluation")),
        }
    }

    /// Overwrite every column of a stored evaluation except its proposal.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn update_evaluation(&self, evaluation: &Evaluation) -> Result<bool> {
        let outcome = self.tx.execute(
            "UPDATE evaluations SET
                meeting_id = ?2, kind = ?3, verdict = ?4, minimal_review = ?5,
                verdict_date = ?6, version = ?7, evaluator_1 = ?8, evaluator_2 = ?9, active = ?10
             WHERE evaluation_id = ?1",
            params![
                evaluation.id.to_string(),
                evaluation.meeting_id.to_string(),
                evaluation.kind.id(),
                evaluation.verdict.map(Verdict::id),
                evaluation.minimal_review,
                evaluation.verdict_date.map(format_date).transpose()?,
                i64::from(evaluation.version),
                evaluation.evaluator_1.map(|id| id.to_string()),
                evaluation.evaluator_2.map(|id| id.to_string()),
                evaluation.active,
            ],
        );
        match outcome {
            Ok(changed) => Ok(changed == 1),
            Err(err) if is_unique_violation(&err) => Err(active_version_conflict(evaluation)),
            Err(err) => Err(anyhow::Error::new(err).context("failed to update evaluation")),
        }
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn find_evaluation(&self, id: EvaluationId) -> Result<Option<Evaluation>> {
        let rows = collect(
            &self.tx,
            &format!("SELECT {EVALUATION_COLUMNS} FROM evaluations WHERE evaluation_id = ?1"),
            params![id.to_string()],
            decode_evaluation,
        )?;
        Ok(rows.into_iter().next())
    }

    /// The current evaluation of a proposal: the first active one by
    /// version descending.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn latest_active_evaluation(&self, proposal_id: ProposalId) -> Result<Option<Evaluation>> {
        let rows = collect(
            &self.tx,
            &format!(
                "SELECT {EVALUATION_COLUMNS} FROM evaluations
                 WHERE proposal_id = ?1 AND active = 1
                 ORDER BY version DESC
                 LIMIT 1"
            ),
            params![proposal_id.to_string()],
            decode_evaluation,
        )?;
        Ok(rows.into_iter().next())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn active_evaluation_for_version(
        &self,
        proposal_id: ProposalId,
        version: u32,
    ) -> Result<Option<Evaluation>> {
        let rows = collect(
            &self.tx,
            &format!(
                "SELECT {EVALUATION_COLUMNS} FROM evaluations
                 WHERE proposal_id = ?1 AND version = ?2 AND active = 1"
            ),
            params![proposal_id.to_string(), i64::from(version)],
            decode_evaluation,
        )?;
        Ok(rows.into_iter().next())
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn evaluations_by_proposal(
        &self,
        proposal_id: ProposalId,
        page: PageRequest,
    ) -> Result<Page<Evaluation>> {
        let (limit, offset) = page_bounds(page)?;
        let total = count(
            &self.tx,
            "SELECT COUNT(*) FROM evaluations WHERE proposal_id = ?1 AND active = 1",
            params![proposal_id.to_string()],
        )?;
        let items = collect(
            &self.tx,
            &format!(
                "SELECT {EVALUATION_COLUMNS} FROM evaluations
                 WHERE proposal_id = ?1 AND active = 1
                 ORDER BY version DESC, evaluation_id ASC
                 LIMIT ?2 OFFSET ?3"
            ),
            params![proposal_id.to_string(), limit, offset],
            decode_evaluation,
        )?;
        Ok(Page::new(items, page, total))
    }

    /// Active evaluations of a meeting that are not minimal-review passes.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn evaluations_by_meeting(
        &self,
        meeting_id: MeetingId,
        page: PageRequest,
    ) -> Result<Page<Evaluation>> {
        let (limit, offset) = page_bounds(page)?;
        let total = count(
            &self.tx,
            "SELECT COUNT(*) FROM evaluations
             WHERE meeting_id = ?1 AND active = 1 AND minimal_review = 0",
            params![meeting_id.to_string()],
        )?;
        let items = collect(
            &self.tx,
            &format!(
                "SELECT {EVALUATION_COLUMNS} FROM evaluations
                 WHERE meeting_id = ?1 AND active = 1 AND minimal_review = 0
                 ORDER BY evaluation_id ASC
                 LIMIT ?2 OFFSET ?3"
            ),
            params![meeting_id.to_string(), limit, offset],
            decode_evaluation,
        )?;
        Ok(Page::new(items, page, total))
    }

    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn insert_document(&self, document: &Document) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO proposal_documents(document_id, proposal_id, document_type, document_ref, active)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    document.id.to_string(),
                    document.proposal_id.to_string(),
                    document.document_type,
                    document.document_ref,
                    document.active,
                ],
            )
            .context("failed to insert document")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn active_documents(&self, proposal_id: ProposalId) -> Result<Vec<Document>> {
        collect(
            &self.tx,
            "SELECT document_id, proposal_id, document_type, document_ref, active
             FROM proposal_documents
             WHERE proposal_id = ?1 AND active = 1
             ORDER BY document_id ASC",
            params![proposal_id.to_string()],
            |row| {
                Ok(Document {
                    id: DocumentId(parse_ulid(&row.get::<_, String>(0)?)?),
                    proposal_id: ProposalId(parse_ulid(&row.get::<_, String>(1)?)?),
                    document_type: row.get(2)?,
                    document_ref: row.get(3)?,
                    active: row.get(4)?,
                })
            },
        )
    }

    /// # Errors
    /// Returns an error when the value cannot be serialized or written.
    pub fn insert_answer(&self, answer: &Answer) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO proposal_answers(answer_id, proposal_id, section_ref, value_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    answer.id.to_string(),
                    answer.proposal_id.to_string(),
                    answer.section_ref,
                    serde_json::to_string(&answer.value).context("failed to serialize answer")?,
                ],
            )
            .context("failed to insert answer")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn answers(&self, proposal_id: ProposalId) -> Result<Vec<Answer>> {
        collect(
            &self.tx,
            "SELECT answer_id, proposal_id, section_ref, value_json FROM proposal_answers
             WHERE proposal_id = ?1
             ORDER BY answer_id ASC",
            params![proposal_id.to_string()],
            |row| {
                let raw: String = row.get(3)?;
                Ok(Answer {
                    id: AnswerId(parse_ulid(&row.get::<_, String>(0)?)?),
                    proposal_id: ProposalId(parse_ulid(&row.get::<_, String>(1)?)?),
                    section_ref: row.get(2)?,
                    value: serde_json::from_str(&raw).context("failed to decode answer value")?,
                })
            },
        )
    }

    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn insert_comment(&self, comment: &Comment) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO evaluation_comments(comment_id, evaluation_id, text) VALUES (?1, ?2, ?3)",
                params![comment.id.to_string(), comment.evaluation_id.to_string(), comment.text],
            )
            .context("failed to insert comment")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the count cannot be read.
    pub fn count_comments(&self, evaluation_id: EvaluationId) -> Result<u64> {
        count(
            &self.tx,
            "SELECT COUNT(*) FROM evaluation_comments WHERE evaluation_id = ?1",
            params![evaluation_id.to_string()],
        )
    }

    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn insert_report(&self, report: &Report) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO proposal_reports(report_id, proposal_id, document_ref) VALUES (?1, ?2, ?3)",
                params![report.id.to_string(), report.proposal_id.to_string(), report.document_ref],
            )
            .context("failed to insert report")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn reports(&self, proposal_id: ProposalId) -> Result<Vec<Report>> {
        collect(
            &self.tx,
            "SELECT report_id, proposal_id, document_ref FROM proposal_reports
             WHERE proposal_id = ?1
             ORDER BY report_id ASC",
            params![proposal_id.to_string()],
            |row| {
                Ok(Report {
                    id: ReportId(parse_ulid(&row.get::<_, String>(0)?)?),
                    proposal_id: ProposalId(parse_ulid(&row.get::<_, String>(1)?)?),
                    document_ref: row.get(2)?,
                })
            },
        )
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_reports(&self, proposal_id: ProposalId) -> Result<usize> {
        self.tx
            .execute(
                "DELETE FROM proposal_reports WHERE proposal_id = ?1",
                params![proposal_id.to_string()],
            )
            .context("failed to delete proposal reports")
    }

    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn insert_evaluator(&self, evaluator: &Evaluator) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO evaluators(evaluator_id, committee_id, person_ref, active)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    evaluator.id.to_string(),
                    evaluator.committee_id.to_string(),
                    evaluator.person_ref,
                    evaluator.active,
                ],
            )
            .context("failed to insert evaluator")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn insert_conflict(&self, conflict: &ConflictOfInterest) -> Result<()> {
        self.tx
            .execute(
                "INSERT OR IGNORE INTO evaluator_conflicts(evaluator_id, person_ref) VALUES (?1, ?2)",
                params![conflict.evaluator_id.to_string(), conflict.person_ref],
            )
            .context("failed to insert conflict of interest")?;
        Ok(())
    }

    /// Active evaluators of a committee that have no declared conflict of
    /// interest with any team member of `request_id`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn eligible_evaluators(
        &self,
        committee_id: CommitteeId,
        request_id: RequestId,
        page: PageRequest,
    ) -> Result<Page<Evaluator>> {
        const PREDICATE: &str = "e.committee_id = ?1 AND e.active = 1
            AND NOT EXISTS (
                SELECT 1 FROM evaluator_conflicts c
                JOIN request_team_members m ON m.person_ref = c.person_ref
                WHERE c.evaluator_id = e.evaluator_id AND m.request_id = ?2
            )";
        let (limit, offset) = page_bounds(page)?;
        let total = count(
            &self.tx,
            &format!("SELECT COUNT(*) FROM evaluators e WHERE {PREDICATE}"),
            params![committee_id.to_string(), request_id.to_string()],
        )?;
        let items = collect(
            &self.tx,
            &format!(
                "SELECT e.evaluator_id, e.committee_id, e.person_ref, e.active
                 FROM evaluators e WHERE {PREDICATE}
                 ORDER BY e.person_ref ASC, e.evaluator_id ASC
                 LIMIT ?3 OFFSET ?4"
            ),
            params![committee_id.to_string(), request_id.to_string(), limit, offset],
            |row| {
                Ok(Evaluator {
                    id: EvaluatorId(parse_ulid(&row.get::<_, String>(0)?)?),
                    committee_id: CommitteeId(parse_ulid(&row.get::<_, String>(1)?)?),
                    person_ref: row.get(2)?,
                    active: row.get(3)?,
                })
            },
        )?;
        Ok(Page::new(items, page, total))
    }
}

/// Render a calendar date the way the store persists it (`YYYY-MM-DD`).
///
/// # Errors
/// Returns an error when the date cannot be formatted.
pub fn format_date(value: Date) -> Result<String> {
    value.format(&Iso8601::DATE).context("failed to format date")
}

/// # Errors
/// Returns an error when `value` is not a `YYYY-MM-DD` date.
pub fn parse_date(value: &str) -> Result<Date> {
    Date::parse(value, &Iso8601::DATE).with_context(|| format!("invalid date: {value}"))
}

fn decode_proposal(row: &Row<'_>) -> Result<Proposal> {
    let kind: u8 = row.get(6)?;
    let retrospective = match (row.get::<_, Option<u8>>(10)?, row.get::<_, Option<String>>(11)?) {
        (Some(state), Some(review_date)) => Some(Retrospective {
            state: RetrospectiveState::from_id(state)
                .ok_or_else(|| anyhow!("unknown retrospective state id: {state}"))?,
            review_date: parse_date(&review_date)?,
        }),
        (None, None) => None,
        _ => return Err(anyhow!("proposal row carries a partial retrospective")),
    };
    let submitted_at = row.get::<_, Option<String>>(8)?.as_deref().map(parse_date).transpose()?;
    let original_id = row
        .get::<_, Option<String>>(13)?
        .as_deref()
        .map(parse_ulid)
        .transpose()?
        .map(ProposalId);

    Ok(Proposal {
        id: ProposalId(parse_ulid(&row.get::<_, String>(0)?)?),
        reference: row.get(1)?,
        request_id: RequestId(parse_ulid(&row.get::<_, String>(2)?)?),
        committee_id: CommitteeId(parse_ulid(&row.get::<_, String>(3)?)?),
        title: row.get(4)?,
        owner_ref: row.get(5)?,
        kind: ProposalKind::from_id(kind).ok_or_else(|| anyhow!("unknown proposal kind id: {kind}"))?,
        state: proposal_state(row.get(7)?)?,
        submitted_at,
        requires_retrospective: row.get(9)?,
        retrospective,
        version: row.get(12)?,
        original_id,
        active: row.get(14)?,
    })
}

fn decode_evaluation(row: &Row<'_>) -> Result<Evaluation> {
    let kind: u8 = row.get(3)?;
    let verdict = match row.get::<_, Option<u8>>(4)? {
        Some(id) => Some(Verdict::from_id(id).ok_or_else(|| anyhow!("unknown verdict id: {id}"))?),
        None => None,
    };
    let evaluator = |index: usize| -> Result<Option<EvaluatorId>> {
        Ok(row.get::<_, Option<String>>(index)?.as_deref().map(parse_ulid).transpose()?.map(EvaluatorId))
    };

    Ok(Evaluation {
        id: EvaluationId(parse_ulid(&row.get::<_, String>(0)?)?),
        proposal_id: ProposalId(parse_ulid(&row.get::<_, String>(1)?)?),
        meeting_id: MeetingId(parse_ulid(&row.get::<_, String>(2)?)?),
        kind: EvaluationKind::from_id(kind)
            .ok_or_else(|| anyhow!("unknown evaluation kind id: {kind}"))?,
        verdict,
        minimal_review: row.get(5)?,
        verdict_date: row.get::<_, Option<String>>(6)?.as_deref().map(parse_date).transpose()?,
        version: row.get(7)?,
        evaluator_1: evaluator(8)?,
        evaluator_2: evaluator(9)?,
        active: row.get(10)?,
    })
}

fn retrospective_columns(proposal: &Proposal) -> Result<(Option<u8>, Option<String>)> {
    match proposal.retrospective {
        Some(retrospective) => Ok((
            Some(retrospective.state.id()),
            Some(format_date(retrospective.review_date)?),
        )),
        None => Ok((None, None)),
    }
}

fn proposal_state(id: u8) -> Result<ProposalState> {
    ProposalState::from_id(id).ok_or_else(|| anyhow!("unknown proposal state id: {id}"))
}

fn collect<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    decode: impl Fn(&Row<'_>) -> Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql).context("failed to prepare query")?;
    let mut rows = stmt.query(params)?;
    let mut items = Vec::new();

    while let Some(row) = rows.next()? {
        items.push(decode(row)?);
    }

    Ok(items)
}

fn count<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<u64> {
    let total = conn
        .query_row(sql, params, |row| row.get::<_, i64>(0))
        .context("failed to count rows")?;
    u64::try_from(total).context("row count out of range")
}

fn page_bounds(page: PageRequest) -> Result<(i64, i64)> {
    page.validate()?;
    let offset = i64::try_from(page.offset()).context("page offset exceeds sqlite range")?;
    Ok((i64::from(page.size), offset))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn active_version_conflict(evaluation: &Evaluation) -> anyhow::Error {
    anyhow::Error::new(ReviewError::Conflict(format!(
        "proposal {} already has an active evaluation for version {}",
        evaluation.proposal_id, evaluation.version
    )))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value.format(&Rfc3339).context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}
