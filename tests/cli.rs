use assert_cmd::Command;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const STORY: &str = r#"{
  "fragments": [
    {
      "id": "F1",
      "title": "Crossroads",
      "body": "Two paths.",
      "kind": "decision",
      "choices": [
        { "text": "Vault", "target": "F2", "required_clues": ["KEY1"] },
        { "text": "Garden", "target": "F3" }
      ],
      "triggers": { "points": 10, "clues": ["KEY1"] }
    },
    { "id": "F2", "title": "Vault", "kind": "story" },
    { "id": "F3", "title": "Garden", "kind": "story", "triggers": { "achievements": ["GARDENER"] } }
  ]
}"#;

#[allow(deprecated)]
fn narrative_cmd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("narrative").unwrap();
    cmd.env("NARRATIVE_DB", dir.join("narrative.db"));
    cmd.env("NARRATIVE_CONFIG", dir.join("config.toml"));
    cmd
}

fn setup() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let story = dir.path().join("story.json");
    std::fs::write(&story, STORY).unwrap();
    narrative_cmd(dir.path())
        .args(["import", story.to_str().unwrap()])
        .assert()
        .success();
    (dir, story)
}

fn stdout_json(cmd: &mut Command) -> serde_json::Value {
    let out = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&out).unwrap()
}

fn stderr_text(assert: assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stderr).into_owned()
}

fn query_db(db: &Path, sql: &str) -> Vec<Vec<String>> {
    let conn =
        rusqlite::Connection::open_with_flags(db, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)
            .unwrap();
    let mut stmt = conn.prepare(sql).unwrap();
    let cols = stmt.column_count();
    stmt.query_map([], |row| {
        let mut vals = Vec::new();
        for i in 0..cols {
            let v: rusqlite::types::Value = row.get(i)?;
            vals.push(match v {
                rusqlite::types::Value::Null => "NULL".into(),
                rusqlite::types::Value::Integer(n) => n.to_string(),
                rusqlite::types::Value::Real(f) => f.to_string(),
                rusqlite::types::Value::Text(s) => s,
                rusqlite::types::Value::Blob(_) => "<blob>".into(),
            });
        }
        Ok(vals)
    })
    .unwrap()
    .collect::<Result<Vec<_>, _>>()
    .unwrap()
}

#[test]
fn import_stores_fragments() {
    let (dir, _) = setup();
    let rows = query_db(
        &dir.path().join("narrative.db"),
        "SELECT id, kind, active FROM fragments ORDER BY id",
    );
    assert_eq!(
        rows,
        vec![
            vec!["F1".to_string(), "decision".into(), "1".into()],
            vec!["F2".to_string(), "story".into(), "1".into()],
            vec!["F3".to_string(), "story".into(), "1".into()],
        ]
    );
}

#[test]
fn start_advance_progress() {
    let (dir, _) = setup();

    let start = stdout_json(narrative_cmd(dir.path()).args(["start", "-u", "u1", "F1"]));
    assert_eq!(start["fragment"]["id"], "F1");
    assert_eq!(start["fragment"]["choices"][0]["available"], false);
    assert_eq!(start["fragment"]["choices"][1]["available"], true);

    let adv = stdout_json(narrative_cmd(dir.path()).args(["advance", "-u", "u1", "1"]));
    assert_eq!(adv["fragment"]["id"], "F3");
    assert_eq!(adv["grant"]["points_awarded"], 10);

    let progress = stdout_json(narrative_cmd(dir.path()).args(["progress", "--user", "u1"]));
    assert_eq!(progress["current_fragment_id"], "F3");
    assert_eq!(progress["completed"], 1);
    assert_eq!(progress["unlocked_clues"][0], "KEY1");
    assert_eq!(progress["state"]["state"], "terminal");

    let rows = query_db(
        &dir.path().join("narrative.db"),
        "SELECT SUM(amount) FROM points_ledger WHERE user_id = 'u1'",
    );
    assert_eq!(rows[0][0], "10");
}

#[test]
fn locked_choice_fails_with_message() {
    let (dir, _) = setup();
    narrative_cmd(dir.path())
        .args(["start", "-u", "u1", "F1"])
        .assert()
        .success();
    let err = stderr_text(
        narrative_cmd(dir.path())
            .args(["advance", "-u", "u1", "0"])
            .assert()
            .failure()
            .code(1),
    );
    assert!(err.contains("KEY1"), "stderr: {err}");
}

#[test]
fn finish_grants_terminal_rewards_once() {
    let (dir, _) = setup();
    let db = dir.path().join("narrative.db");
    narrative_cmd(dir.path()).args(["start", "-u", "u1", "F1"]).assert().success();
    narrative_cmd(dir.path()).args(["advance", "-u", "u1", "1"]).assert().success();
    narrative_cmd(dir.path()).args(["finish", "-u", "u1"]).assert().success();
    narrative_cmd(dir.path()).args(["finish", "-u", "u1"]).assert().success();

    let rows = query_db(&db, "SELECT code FROM user_achievements WHERE user_id = 'u1'");
    assert_eq!(rows, vec![vec!["GARDENER".to_string()]]);
}

#[test]
fn reset_clears_progress_only() {
    let (dir, _) = setup();
    let db = dir.path().join("narrative.db");
    narrative_cmd(dir.path()).args(["start", "-u", "u1", "F1"]).assert().success();
    narrative_cmd(dir.path()).args(["advance", "-u", "u1", "1"]).assert().success();
    narrative_cmd(dir.path()).args(["reset", "-u", "u1"]).assert().success();

    let progress = stdout_json(narrative_cmd(dir.path()).args(["progress", "-u", "u1"]));
    assert_eq!(progress["state"]["state"], "not_started");
    assert_eq!(progress["percentage"], 0.0);
    assert!(progress["current_fragment_id"].is_null());

    let rows = query_db(&db, "SELECT COUNT(*) FROM points_ledger");
    assert_eq!(rows[0][0], "1");
}

#[test]
fn show_requires_a_started_story() {
    let (dir, _) = setup();
    let err = stderr_text(
        narrative_cmd(dir.path())
            .args(["show", "-u", "nobody"])
            .assert()
            .failure(),
    );
    assert!(err.contains("nobody"), "stderr: {err}");
}

#[test]
fn validate_warns_on_inactive_target() {
    let (dir, _) = setup();
    let report = stdout_json(narrative_cmd(dir.path()).arg("validate"));
    assert_eq!(report["errors"].as_array().unwrap().len(), 0);
    assert_eq!(report["warnings"].as_array().unwrap().len(), 0);

    narrative_cmd(dir.path()).args(["deactivate", "F3"]).assert().success();
    let report = stdout_json(narrative_cmd(dir.path()).arg("validate"));
    assert_eq!(report["warnings"][0]["issue"], "inactive_target");
    assert_eq!(report["warnings"][0]["target"], "F3");
}

#[test]
fn validate_fails_on_self_loop() {
    let dir = TempDir::new().unwrap();
    let story = dir.path().join("loop.json");
    std::fs::write(
        &story,
        r#"{"fragments":[{"id":"L","title":"Loop","kind":"decision","choices":[{"text":"Again","target":"L"}]}]}"#,
    )
    .unwrap();
    narrative_cmd(dir.path())
        .args(["import", story.to_str().unwrap()])
        .assert()
        .success();

    let assert = narrative_cmd(dir.path()).arg("validate").assert().failure().code(1);
    let report: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();
    assert_eq!(report["errors"][0]["issue"], "self_loop_only");
}

#[test]
fn import_rejects_unknown_target() {
    let dir = TempDir::new().unwrap();
    let story = dir.path().join("broken.toml");
    std::fs::write(
        &story,
        r#"
[[fragments]]
id = "A"
title = "Start"
kind = "decision"

[[fragments.choices]]
text = "Onward"
target = "MISSING"
"#,
    )
    .unwrap();
    narrative_cmd(dir.path())
        .args(["import", story.to_str().unwrap()])
        .assert()
        .failure();

    let rows = query_db(&dir.path().join("narrative.db"), "SELECT COUNT(*) FROM fragments");
    assert_eq!(rows[0][0], "0");
}

#[test]
fn status_reports_counts() {
    let (dir, _) = setup();
    narrative_cmd(dir.path()).args(["start", "-u", "u1", "F1"]).assert().success();
    let err = stderr_text(narrative_cmd(dir.path()).arg("status").assert().success());
    assert!(err.contains("3 active"), "stderr: {err}");
    assert!(err.contains("1 started"), "stderr: {err}");
}

#[test]
fn status_without_database() {
    let dir = TempDir::new().unwrap();
    let err = stderr_text(narrative_cmd(dir.path()).arg("status").assert().success());
    assert!(err.contains("no database"), "stderr: {err}");
}
