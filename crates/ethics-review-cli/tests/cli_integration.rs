use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{Duration, OffsetDateTime};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}-{}", std::process::id()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

struct Workspace {
    dir: PathBuf,
    db: PathBuf,
}

impl Workspace {
    fn new(prefix: &str) -> Self {
        let dir = unique_temp_dir(prefix);
        let db = dir.join("review.sqlite3");
        Self { dir, db }
    }

    fn run<I, S>(&self, args: I) -> Output
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(env!("CARGO_BIN_EXE_erc"))
            .arg("--db")
            .arg(&self.db)
            .args(args)
            .env_remove("ERC_CONFIG")
            .output()
            .unwrap_or_else(|err| panic!("failed to execute erc binary: {err}"))
    }

    fn json<I, S>(&self, args: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(args);
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            panic!(
                "erc command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
                output.status, stdout, stderr
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let value: Value = serde_json::from_str(&stdout)
            .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
        assert_eq!(as_str(&value, "contract_version"), "cli.v1");
        value
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

struct Seeded {
    committee_id: String,
    request_id: String,
    meeting_id: String,
}

fn seed(ws: &Workspace, code: &str) -> Seeded {
    let committee = ws.json(["committee", "add", "--code", code, "--form-name", "M10"]);
    let committee_id = as_str(&committee, "id").to_string();

    let request = ws.json([
        "request",
        "add",
        "--title",
        "Sleep deprivation in rodents",
        "--owner",
        "owner-1",
        "--team-member",
        "member-2",
    ]);
    let request_id = as_str(&request, "id").to_string();

    let evaluation_at = (OffsetDateTime::now_utc() + Duration::days(14))
        .format(&Rfc3339)
        .unwrap_or_else(|err| panic!("timestamp should format: {err}"));
    let cutoff = (OffsetDateTime::now_utc().date() + Duration::days(1))
        .format(&Iso8601::DATE)
        .unwrap_or_else(|err| panic!("date should format: {err}"));
    let meeting = ws.json([
        "meeting",
        "add",
        "--committee-id",
        committee_id.as_str(),
        "--kind",
        "ordinary",
        "--evaluation-at",
        evaluation_at.as_str(),
        "--cutoff-date",
        cutoff.as_str(),
    ]);
    let meeting_id = as_str(&meeting, "id").to_string();
    Seeded { committee_id, request_id, meeting_id }
}

fn create_proposal(ws: &Workspace, seeded: &Seeded) -> Value {
    ws.json([
        "proposal",
        "create",
        "--request-id",
        seeded.request_id.as_str(),
        "--committee-id",
        seeded.committee_id.as_str(),
        "--title",
        "Sleep deprivation in rodents",
        "--owner",
        "owner-1",
    ])
}

#[test]
fn db_migrate_reports_contract_version() {
    let ws = Workspace::new("erc-migrate");
    let planned = ws.json(["db", "migrate", "--dry-run"]);
    assert_eq!(planned["dry_run"], Value::Bool(true));

    let applied = ws.json(["db", "migrate"]);
    assert_eq!(as_i64(&applied, "after_version"), 1);

    let status = ws.json(["db", "schema-version"]);
    assert_eq!(status["up_to_date"], Value::Bool(true));
}

#[test]
fn proposal_walks_through_assignment_and_rollback() {
    let ws = Workspace::new("erc-lifecycle");
    let seeded = seed(&ws, "CEI");

    let proposal = create_proposal(&ws, &seeded);
    let id = as_str(&proposal, "id").to_string();
    assert_eq!(as_str(&proposal, "state"), "drafting");
    assert_eq!(as_i64(&proposal, "version"), 0);
    assert!(as_str(&proposal, "reference").ends_with("/001"));

    ws.json(["proposal", "advance", "--id", id.as_str(), "--state", "completed"]);
    let submitted = ws.json(["proposal", "submit", "--id", id.as_str(), "--person", "owner-1"]);
    assert_eq!(as_str(&submitted, "state"), "in_secretariat");

    let assignable = ws.json(["proposal", "assignable", "--meeting-id", seeded.meeting_id.as_str()]);
    assert_eq!(as_i64(&assignable, "total"), 1);

    let evaluation = ws.json([
        "evaluation",
        "assign",
        "--proposal-id",
        id.as_str(),
        "--meeting-id",
        seeded.meeting_id.as_str(),
    ]);
    assert_eq!(as_str(&evaluation, "kind"), "proposal");
    assert_eq!(as_i64(&evaluation, "version"), 1);

    let listing = ws.json(["evaluation", "list", "--meeting-id", seeded.meeting_id.as_str()]);
    assert_eq!(listing["items"][0]["removable"], Value::Bool(true));

    let rolled = ws.json(["proposal", "rollback", "--id", id.as_str()]);
    assert_eq!(as_str(&rolled, "outcome"), "rolled_back");
    assert_eq!(as_str(&rolled["proposal"], "state"), "in_secretariat");
    assert_eq!(as_i64(&rolled["proposal"], "version"), 0);

    let history = ws.json(["proposal", "history", "--id", id.as_str()]);
    let entries = history["payload"]
        .as_array()
        .unwrap_or_else(|| panic!("history should be an array: {history}"));
    assert_eq!(entries.len(), 3);
}

#[test]
fn rollback_with_comment_is_rejected_and_exits_non_zero() {
    let ws = Workspace::new("erc-rollback-rejected");
    let seeded = seed(&ws, "CEI");
    let proposal = create_proposal(&ws, &seeded);
    let id = as_str(&proposal, "id").to_string();
    ws.json(["proposal", "advance", "--id", id.as_str(), "--state", "completed"]);
    ws.json(["proposal", "submit", "--id", id.as_str(), "--person", "owner-1"]);
    let evaluation = ws.json([
        "evaluation",
        "assign",
        "--proposal-id",
        id.as_str(),
        "--meeting-id",
        seeded.meeting_id.as_str(),
    ]);
    let evaluation_id = as_str(&evaluation, "id").to_string();
    ws.json(["comment", "add", "--evaluation-id", evaluation_id.as_str(), "--text", "needs rework"]);

    let output = ws.run(["proposal", "rollback", "--id", id.as_str()]);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"rejected\""), "stdout: {stdout}");

    let shown = ws.json(["proposal", "show", "--id", id.as_str()]);
    assert_eq!(as_str(&shown, "state"), "in_evaluation");
}

#[test]
fn submit_by_non_owner_fails() {
    let ws = Workspace::new("erc-owner");
    let seeded = seed(&ws, "CEI");
    let proposal = create_proposal(&ws, &seeded);
    let id = as_str(&proposal, "id").to_string();
    ws.json(["proposal", "advance", "--id", id.as_str(), "--state", "completed"]);

    let output = ws.run(["proposal", "submit", "--id", id.as_str(), "--person", "member-2"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not own"), "stderr: {stderr}");
}

#[test]
fn policy_file_changes_reference_width() {
    let ws = Workspace::new("erc-policy");
    let policy = ws.dir.join("policy.yaml");
    fs::write(&policy, "reference_sequence_width: 5\n")
        .unwrap_or_else(|err| panic!("failed to write policy: {err}"));

    let seeded = seed(&ws, "CEI");
    let output = ws.run([
        "--config",
        path_str(&policy),
        "proposal",
        "create",
        "--request-id",
        seeded.request_id.as_str(),
        "--committee-id",
        seeded.committee_id.as_str(),
        "--title",
        "Zebrafish regeneration",
        "--owner",
        "owner-1",
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let value: Value = serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}"));
    assert!(as_str(&value, "reference").ends_with("/00001"), "{value}");
}

#[test]
fn unknown_policy_key_is_rejected() {
    let ws = Workspace::new("erc-policy-invalid");
    let policy = ws.dir.join("policy.yaml");
    fs::write(&policy, "reference_width: 4\n")
        .unwrap_or_else(|err| panic!("failed to write policy: {err}"));

    let output = ws.run(["--config", path_str(&policy), "db", "schema-version"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to load review policy"), "stderr: {stderr}");
}
