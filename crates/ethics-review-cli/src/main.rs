use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ethics_review_api::{
    AttachDocumentRequest, EvaluationInput, ProposalInput, RegisterCommitteeRequest,
    RegisterRequestRequest, ReviewApi, ReviewPolicy, RollbackOutcome, ScheduleMeetingRequest,
};
use ethics_review_core::{
    CommitteeId, Evaluation, EvaluationId, EvaluatorId, MeetingId, MeetingKind, PageRequest,
    Proposal, ProposalId, ProposalKind, ProposalState, RequestId, Verdict,
};
use ethics_review_store_sqlite::parse_date;
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "erc")]
#[command(about = "Ethics review workflow CLI")]
struct Cli {
    #[arg(long, env = "ERC_DB", default_value = "./ethics_review.sqlite3")]
    db: PathBuf,

    /// Review policy YAML; built-in defaults apply when omitted.
    #[arg(long, env = "ERC_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `ethics_review_api=info`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Committee {
        #[command(subcommand)]
        command: CommitteeCommand,
    },
    Request {
        #[command(subcommand)]
        command: RequestCommand,
    },
    Meeting {
        #[command(subcommand)]
        command: MeetingCommand,
    },
    Proposal {
        #[command(subcommand)]
        command: Box<ProposalCommand>,
    },
    Evaluation {
        #[command(subcommand)]
        command: Box<EvaluationCommand>,
    },
    Document {
        #[command(subcommand)]
        command: DocumentCommand,
    },
    Comment {
        #[command(subcommand)]
        command: CommentCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum CommitteeCommand {
    Add(CommitteeAddArgs),
}

#[derive(Debug, Args)]
struct CommitteeAddArgs {
    #[arg(long)]
    code: String,
    #[arg(long)]
    form_name: String,
}

#[derive(Debug, Subcommand)]
enum RequestCommand {
    Add(RequestAddArgs),
}

#[derive(Debug, Args)]
struct RequestAddArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    owner: String,
    #[arg(long = "team-member")]
    team: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum MeetingCommand {
    Add(MeetingAddArgs),
}

#[derive(Debug, Args)]
struct MeetingAddArgs {
    #[arg(long)]
    committee_id: CommitteeId,
    #[arg(long, value_enum)]
    kind: MeetingKindArg,
    /// RFC 3339 timestamp of the session.
    #[arg(long)]
    evaluation_at: String,
    /// Last submission date (YYYY-MM-DD) eligible for the session.
    #[arg(long)]
    cutoff_date: String,
}

#[derive(Debug, Subcommand)]
enum ProposalCommand {
    Create(ProposalCreateArgs),
    Modify(ProposalModifyArgs),
    Show(ProposalIdArgs),
    History(ProposalIdArgs),
    Advance(ProposalAdvanceArgs),
    Submit(ProposalSubmitArgs),
    SubmitRetrospective(ProposalSubmitArgs),
    Rollback(ProposalIdArgs),
    Assignable(ProposalAssignableArgs),
    Deactivate(ProposalIdArgs),
}

#[derive(Debug, Args)]
struct ProposalFields {
    #[arg(long)]
    request_id: RequestId,
    #[arg(long)]
    committee_id: CommitteeId,
    #[arg(long)]
    title: String,
    #[arg(long)]
    owner: String,
}

#[derive(Debug, Args)]
struct ProposalCreateArgs {
    #[arg(long, value_enum, default_value_t = ProposalKindArg::New)]
    kind: ProposalKindArg,
    #[command(flatten)]
    fields: ProposalFields,
}

#[derive(Debug, Args)]
struct ProposalModifyArgs {
    #[arg(long)]
    original_id: ProposalId,
    #[command(flatten)]
    fields: ProposalFields,
}

#[derive(Debug, Args)]
struct ProposalIdArgs {
    #[arg(long)]
    id: ProposalId,
}

#[derive(Debug, Args)]
struct ProposalAdvanceArgs {
    #[arg(long)]
    id: ProposalId,
    /// Target state, e.g. `completed`.
    #[arg(long)]
    state: String,
}

#[derive(Debug, Args)]
struct ProposalSubmitArgs {
    #[arg(long)]
    id: ProposalId,
    #[arg(long)]
    person: String,
}

#[derive(Debug, Args)]
struct ProposalAssignableArgs {
    #[arg(long)]
    meeting_id: MeetingId,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Args)]
struct PageArgs {
    #[arg(long, default_value_t = 0)]
    page: u32,
    #[arg(long, default_value_t = 20)]
    size: u32,
}

impl PageArgs {
    fn request(&self) -> PageRequest {
        PageRequest::new(self.page, self.size)
    }
}

#[derive(Debug, Subcommand)]
enum EvaluationCommand {
    Assign(EvaluationAssignArgs),
    Verdict(EvaluationVerdictArgs),
    Delete(EvaluationDeleteArgs),
    List(EvaluationListArgs),
}

#[derive(Debug, Args)]
struct EvaluationAssignArgs {
    #[arg(long)]
    proposal_id: ProposalId,
    #[arg(long)]
    meeting_id: MeetingId,
    #[arg(long)]
    evaluator_1: Option<EvaluatorId>,
    #[arg(long)]
    evaluator_2: Option<EvaluatorId>,
}

#[derive(Debug, Args)]
struct EvaluationVerdictArgs {
    #[arg(long)]
    id: EvaluationId,
    #[arg(long, value_enum)]
    verdict: VerdictArg,
    #[arg(long, default_value_t = false)]
    minimal_review: bool,
}

#[derive(Debug, Args)]
struct EvaluationDeleteArgs {
    #[arg(long)]
    meeting_id: MeetingId,
    #[arg(long)]
    id: EvaluationId,
}

#[derive(Debug, Args)]
struct EvaluationListArgs {
    #[arg(long)]
    meeting_id: MeetingId,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Subcommand)]
enum DocumentCommand {
    Add(DocumentAddArgs),
}

#[derive(Debug, Args)]
struct DocumentAddArgs {
    #[arg(long)]
    proposal_id: ProposalId,
    #[arg(long = "type")]
    document_type: String,
    #[arg(long = "ref")]
    document_ref: String,
}

#[derive(Debug, Subcommand)]
enum CommentCommand {
    Add(CommentAddArgs),
}

#[derive(Debug, Args)]
struct CommentAddArgs {
    #[arg(long)]
    evaluation_id: EvaluationId,
    #[arg(long)]
    text: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MeetingKindArg {
    Ordinary,
    Extraordinary,
    Followup,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProposalKindArg {
    New,
    Ratification,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VerdictArg {
    Favorable,
    FavorablePendingMinimalRevision,
    PendingCorrections,
    NotApplicable,
}

impl From<MeetingKindArg> for MeetingKind {
    fn from(value: MeetingKindArg) -> Self {
        match value {
            MeetingKindArg::Ordinary => Self::Ordinary,
            MeetingKindArg::Extraordinary => Self::Extraordinary,
            MeetingKindArg::Followup => Self::Followup,
        }
    }
}

impl From<ProposalKindArg> for ProposalKind {
    fn from(value: ProposalKindArg) -> Self {
        match value {
            ProposalKindArg::New => Self::New,
            ProposalKindArg::Ratification => Self::Ratification,
        }
    }
}

impl From<VerdictArg> for Verdict {
    fn from(value: VerdictArg) -> Self {
        match value {
            VerdictArg::Favorable => Self::Favorable,
            VerdictArg::FavorablePendingMinimalRevision => Self::FavorablePendingMinimalRevision,
            VerdictArg::PendingCorrections => Self::PendingCorrections,
            VerdictArg::NotApplicable => Self::NotApplicable,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to encode output")?)
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    // stdout carries the JSON contract
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let policy = match cli.config.as_ref() {
        Some(path) => ReviewPolicy::from_path(path)
            .with_context(|| format!("failed to load review policy {}", path.display()))?,
        None => ReviewPolicy::default(),
    };
    let api = ReviewApi::with_policy(cli.db, policy);
    tracing::debug!(command = ?cli.command, "erc start");

    match cli.command {
        Command::Db { command } => run_db(&api, command),
        Command::Committee { command } => run_committee(&api, command),
        Command::Request { command } => run_request(&api, command),
        Command::Meeting { command } => run_meeting(&api, command),
        Command::Proposal { command } => run_proposal(&api, *command),
        Command::Evaluation { command } => run_evaluation(&api, *command),
        Command::Document { command } => run_document(&api, command),
        Command::Comment { command } => run_comment(&api, command),
    }
}

fn run_db(api: &ReviewApi, command: DbCommand) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
    }
}

fn run_committee(api: &ReviewApi, command: CommitteeCommand) -> Result<()> {
    match command {
        CommitteeCommand::Add(args) => emit(&api.register_committee(RegisterCommitteeRequest {
            code: args.code,
            form_name: args.form_name,
        })?),
    }
}

fn run_request(api: &ReviewApi, command: RequestCommand) -> Result<()> {
    match command {
        RequestCommand::Add(args) => {
            let mut team = args.team;
            if !team.contains(&args.owner) {
                team.insert(0, args.owner.clone());
            }
            emit(&api.register_request(RegisterRequestRequest {
                title: args.title,
                owner_ref: args.owner,
                team,
            })?)
        }
    }
}

fn run_meeting(api: &ReviewApi, command: MeetingCommand) -> Result<()> {
    match command {
        MeetingCommand::Add(args) => {
            let evaluation_at = OffsetDateTime::parse(&args.evaluation_at, &Rfc3339)
                .with_context(|| format!("invalid --evaluation-at `{}`", args.evaluation_at))?;
            let cutoff_date = parse_date(&args.cutoff_date)
                .with_context(|| format!("invalid --cutoff-date `{}`", args.cutoff_date))?;
            emit(&api.schedule_meeting(ScheduleMeetingRequest {
                committee_id: args.committee_id,
                kind: args.kind.into(),
                evaluation_at,
                cutoff_date,
            })?)
        }
    }
}

fn proposal_input(fields: ProposalFields, kind: ProposalKind) -> ProposalInput {
    ProposalInput {
        id: None,
        request_id: Some(fields.request_id),
        committee_id: fields.committee_id,
        title: fields.title,
        owner_ref: fields.owner,
        kind,
    }
}

fn run_proposal(api: &ReviewApi, command: ProposalCommand) -> Result<()> {
    match command {
        ProposalCommand::Create(args) => {
            emit(&api.create_proposal(proposal_input(args.fields, args.kind.into()))?)
        }
        ProposalCommand::Modify(args) => emit(&api.create_modified_proposal(
            proposal_input(args.fields, ProposalKind::Modification),
            args.original_id,
        )?),
        ProposalCommand::Show(args) => emit(&api.find_proposal(args.id)?),
        ProposalCommand::History(args) => emit(&api.state_history(args.id)?),
        ProposalCommand::Advance(args) => {
            let state = ProposalState::parse(&args.state)
                .ok_or_else(|| anyhow!("unknown proposal state `{}`", args.state))?;
            emit(&api.advance_state(args.id, state)?)
        }
        ProposalCommand::Submit(args) => emit(&api.submit_to_secretariat(args.id, &args.person)?),
        ProposalCommand::SubmitRetrospective(args) => {
            emit(&api.submit_retrospective_to_secretariat(args.id, &args.person)?)
        }
        ProposalCommand::Rollback(args) => run_rollback(api, args.id),
        ProposalCommand::Assignable(args) => {
            emit(&api.find_assignable(args.meeting_id, args.page.request())?)
        }
        ProposalCommand::Deactivate(args) => {
            let proposal = api.find_proposal(args.id)?;
            emit(&api.update_proposal(Proposal { active: false, ..proposal })?)
        }
    }
}

fn run_rollback(api: &ReviewApi, id: ProposalId) -> Result<()> {
    match api.rollback_state(id)? {
        RollbackOutcome::RolledBack(proposal) => emit_json(serde_json::json!({
            "outcome": "rolled_back",
            "proposal": proposal
        })),
        RollbackOutcome::Rejected(reason) => {
            emit_json(serde_json::json!({
                "outcome": "rejected",
                "reason": reason.to_string()
            }))?;
            Err(anyhow!("rollback of proposal {id} rejected: {reason}"))
        }
        RollbackOutcome::Failed(cause) => {
            emit_json(serde_json::json!({
                "outcome": "failed",
                "cause": cause
            }))?;
            Err(anyhow!("rollback of proposal {id} failed: {cause}"))
        }
    }
}

fn run_evaluation(api: &ReviewApi, command: EvaluationCommand) -> Result<()> {
    match command {
        EvaluationCommand::Assign(args) => emit(&api.create_evaluation(EvaluationInput {
            id: None,
            proposal_id: args.proposal_id,
            meeting_id: args.meeting_id,
            evaluator_1: args.evaluator_1,
            evaluator_2: args.evaluator_2,
        })?),
        EvaluationCommand::Verdict(args) => {
            let evaluation = api.find_evaluation(args.id)?;
            emit(&api.update_evaluation(Evaluation {
                verdict: Some(args.verdict.into()),
                minimal_review: args.minimal_review || evaluation.minimal_review,
                ..evaluation
            })?)
        }
        EvaluationCommand::Delete(args) => {
            api.delete_evaluation(args.meeting_id, args.id)?;
            emit_json(serde_json::json!({
                "evaluation_id": args.id,
                "status": "withdrawn"
            }))
        }
        EvaluationCommand::List(args) => {
            emit(&api.evaluations_by_meeting(args.meeting_id, args.page.request())?)
        }
    }
}

fn run_document(api: &ReviewApi, command: DocumentCommand) -> Result<()> {
    match command {
        DocumentCommand::Add(args) => emit(&api.attach_document(AttachDocumentRequest {
            proposal_id: args.proposal_id,
            document_type: args.document_type,
            document_ref: args.document_ref,
        })?),
    }
}

fn run_comment(api: &ReviewApi, command: CommentCommand) -> Result<()> {
    match command {
        CommentCommand::Add(args) => emit(&api.add_comment(args.evaluation_id, args.text)?),
    }
}
