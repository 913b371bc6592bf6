#![allow(clippy::single_match_else)]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn rk_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_rk"))
}

fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rk-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn remove_db(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

fn rk_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(rk_binary_path());
    command.arg("--db").arg(db_path).env("RUST_LOG", "warn");
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run rk command {args:?}: {err}"),
    }
}

fn rk_json(db_path: &Path, args: &[&str]) -> Value {
    let output = rk_output(db_path, args);
    assert!(
        output.status.success(),
        "rk {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn add_event(db_path: &Path, event_id: &str, instance_start: &str, title: &str) -> Value {
    rk_json(
        db_path,
        &[
            "events",
            "add",
            "--event-id",
            event_id,
            "--instance-start",
            instance_start,
            "--instance-end",
            "9000000",
            "--title",
            title,
        ],
    )
}

#[test]
fn help_lists_command_groups() {
    let output = match Command::new(rk_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["events", "settings", "state", "alarm", "schema"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain {required}; output={stdout}"
        );
    }
}

#[test]
fn event_json_shape_is_stable() {
    let db_path = temp_db_path("event-shape");
    let event = add_event(&db_path, "11", "1000", "Planning");

    assert_eq!(event["event_id"], Value::from(11));
    assert_eq!(event["instance_start_time"], Value::from(1000));
    assert_eq!(event["alert_time"], Value::from(1000));
    assert_eq!(event["display_status"], Value::from("displayed_normal"));
    assert_eq!(event["is_repeating"], Value::Bool(false));

    let shown = rk_json(
        &db_path,
        &["events", "show", "--event-id", "11", "--instance-start", "1000"],
    );
    assert_eq!(shown, event);
    remove_db(&db_path);
}

#[test]
fn missing_event_reports_not_found() {
    let db_path = temp_db_path("missing");
    let output = rk_output(
        &db_path,
        &["events", "show", "--event-id", "4", "--instance-start", "1"],
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("event 4@1 not found"),
        "unexpected stderr={stderr}"
    );
    remove_db(&db_path);
}

#[test]
fn move_instance_and_delete_rekey_the_alert() {
    let db_path = temp_db_path("move");
    add_event(&db_path, "3", "1000", "Retro");

    let moved = rk_json(
        &db_path,
        &[
            "events",
            "move-instance",
            "--event-id",
            "3",
            "--instance-start",
            "1000",
            "--new-start",
            "5000",
            "--new-end",
            "6000",
        ],
    );
    assert_eq!(moved["instance_start_time"], Value::from(5000));
    assert_eq!(moved["title"], Value::from("Retro"));

    let listed = rk_json(&db_path, &["events", "list", "--event-id", "3"]);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let deleted = rk_json(
        &db_path,
        &["events", "delete", "--event-id", "3", "--instance-start", "5000"],
    );
    assert_eq!(deleted["instance_start_time"], Value::from(5000));
    assert_eq!(rk_json(&db_path, &["events", "list"]), Value::Array(Vec::new()));
    remove_db(&db_path);
}

#[test]
fn alarm_fire_follows_reminder_protocol() {
    let db_path = temp_db_path("alarm");
    add_event(&db_path, "1", "500000", "Standup");
    rk_json(
        &db_path,
        &[
            "settings",
            "set",
            "--enabled",
            "true",
            "--interval-millis",
            "3600000",
            "--max-reminders",
            "0",
        ],
    );

    let output = rk_output(&db_path, &["alarm", "fire", "--now", "1000000"]);
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("reminder: Standup"), "stderr={stderr}");

    let outcome = stdout_json(&output);
    assert_eq!(outcome["decision"]["fire"], Value::from("regular"));
    assert_eq!(outcome["decision"]["reschedule_at"], Value::from(4_600_000));
    assert_eq!(outcome["decision"]["anomaly"], Value::Null);
    assert_eq!(outcome["state"]["num_reminders_fired"], Value::from(1));
    assert!(outcome["invocation_id"].is_string());

    let pending = rk_json(&db_path, &["alarm", "pending"]);
    assert_eq!(pending[0]["purpose"], Value::from("reminder"));
    assert_eq!(pending[0]["fire_at"], Value::from(4_600_000));

    let replay = rk_json(&db_path, &["alarm", "fire", "--now", "1000000"]);
    assert_eq!(replay["decision"]["reason"], Value::from("early_wakeup"));
    assert_eq!(replay["state"]["num_reminders_fired"], Value::from(1));

    let state = rk_json(&db_path, &["state", "notification-posted", "--at", "2000000"]);
    assert_eq!(state["num_reminders_fired"], Value::from(0));
    assert_eq!(state["notification_last_fire_time"], Value::from(2_000_000));
    remove_db(&db_path);
}

#[test]
fn alarm_with_nothing_active_stops() {
    let db_path = temp_db_path("idle");
    let outcome = rk_json(&db_path, &["alarm", "fire", "--now", "1000000"]);

    assert_eq!(outcome["decision"]["reason"], Value::from("no_active_events"));
    assert_eq!(outcome["decision"]["reschedule_at"], Value::Null);
    assert_eq!(
        outcome["state"]["last_timer_broadcast_received"],
        Value::from(1_000_000)
    );
    remove_db(&db_path);
}

#[test]
fn concurrent_alarm_processes_fire_once() {
    let db_path = temp_db_path("concurrent");
    add_event(&db_path, "1", "500000", "Standup");
    rk_json(
        &db_path,
        &["settings", "set", "--enabled", "true", "--interval-millis", "3600000"],
    );

    let children: Vec<Child> = (0..4)
        .map(|_| {
            let spawned = Command::new(rk_binary_path())
                .arg("--db")
                .arg(&db_path)
                .args(["alarm", "fire", "--now", "1770000000000"])
                .env("RUST_LOG", "warn")
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn();
            match spawned {
                Ok(child) => child,
                Err(err) => panic!("failed to spawn rk alarm fire: {err}"),
            }
        })
        .collect();

    let mut fires = 0;
    for child in children {
        let output = match child.wait_with_output() {
            Ok(output) => output,
            Err(err) => panic!("failed to wait for rk alarm fire: {err}"),
        };
        assert!(
            output.status.success(),
            "rk alarm fire failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        if !stdout_json(&output)["decision"]["fire"].is_null() {
            fires += 1;
        }
    }

    assert_eq!(fires, 1);
    let state = rk_json(&db_path, &["state", "show"]);
    assert_eq!(state["num_reminders_fired"], Value::from(1));
    assert_eq!(state["reminder_last_fire_time"], Value::from(1_770_000_000_000_i64));
    remove_db(&db_path);
}

#[test]
fn invalid_settings_are_rejected() {
    let db_path = temp_db_path("settings");
    let output = rk_output(&db_path, &["settings", "set", "--interval-millis", "0"]);
    assert!(!output.status.success());

    let settings = rk_json(&db_path, &["settings", "show"]);
    assert_eq!(settings["reminders_interval_millis"], Value::from(600_000));
    remove_db(&db_path);
}

#[test]
fn legacy_database_upgrades_on_next_open() {
    let db_path = temp_db_path("upgrade");
    let output = rk_output(
        &db_path,
        &[
            "--schema-version",
            "6",
            "events",
            "add",
            "--event-id",
            "8",
            "--instance-start",
            "1000",
            "--instance-end",
            "2000",
            "--title",
            "Legacy",
            "--repeating",
        ],
    );
    assert!(output.status.success());

    let report = rk_json(&db_path, &["schema", "version"]);
    assert_eq!(report["schema_version"], Value::from(7));

    let events = rk_json(&db_path, &["events", "list"]);
    assert_eq!(events[0]["title"], Value::from("Legacy"));
    assert_eq!(events[0]["is_repeating"], Value::Bool(true));

    let conn = match Connection::open(&db_path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open upgraded db: {err}"),
    };
    let legacy_tables: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'events'",
        [],
        |row| row.get(0),
    ) {
        Ok(count) => count,
        Err(err) => panic!("failed to inspect sqlite_master: {err}"),
    };
    assert_eq!(legacy_tables, 0);
    drop(conn);
    remove_db(&db_path);
}

#[test]
fn unsupported_schema_version_fails_without_creating_db() {
    let db_path = temp_db_path("bad-version");
    let output = rk_output(&db_path, &["--schema-version", "12", "schema", "version"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("events schema version 12 is not supported"),
        "unexpected stderr={stderr}"
    );
    assert!(!db_path.exists());
}
