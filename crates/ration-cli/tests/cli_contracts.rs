#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn ration_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_ration") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/ration");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "ration-cli", "--bin", "ration"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build ration binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn ration_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(ration_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run ration command {:?}: {err}", args),
    }
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

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(ration_binary_path()).args(["--help"]).output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["db", "seed", "inventory", "ledger"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn seed_inventory_and_ledger_contract_round_trip() {
    let db_path = std::env::temp_dir().join(format!("ration-contract-{}.sqlite3", Ulid::new()));

    let output = ration_output(&db_path, &["db", "migrate"]);
    assert!(output.status.success());
    let payload = stdout_json(&output);
    assert_eq!(payload["schema_version"], Value::from(1));

    let output = ration_output(
        &db_path,
        &[
            "seed",
            "add",
            "--content",
            "TRAIN-0001",
            "--content",
            "BIKE-0001",
        ],
    );
    assert!(output.status.success());
    let payload = stdout_json(&output);
    assert_eq!(payload["inserted"], Value::from(2));

    let output = ration_output(&db_path, &["seed", "add", "--content", "TRAIN-0001"]);
    assert!(output.status.success());
    let payload = stdout_json(&output);
    assert_eq!(payload["inserted"], Value::from(0));
    assert_eq!(payload["duplicates"], serde_json::json!(["TRAIN-0001"]));

    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open fixture db: {err}"),
    };
    if let Err(err) = conn.execute(
        "UPDATE records SET reserved_user = 'user-1', reserved_day = '2026-03-01'
         WHERE content = 'TRAIN-0001'",
        [],
    ) {
        panic!("failed to reserve fixture record: {err}");
    }

    let output = ration_output(&db_path, &["inventory", "--json"]);
    assert!(output.status.success());
    let payload = stdout_json(&output);
    assert_eq!(payload["daily_quota"], Value::from(8));
    assert_eq!(
        payload["live_categories"],
        serde_json::json!(["BIKE", "TRAIN"])
    );

    let output = ration_output(
        &db_path,
        &[
            "ledger",
            "--user",
            "user-1",
            "--day",
            "2026-03-01",
            "--json",
        ],
    );
    assert!(output.status.success());
    let payload = stdout_json(&output);
    assert_eq!(payload["issued"], Value::from(1));
    assert_eq!(payload["contents"], serde_json::json!(["TRAIN-0001"]));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn ledger_rejects_malformed_day_keys_with_nonzero_exit() {
    let db_path =
        std::env::temp_dir().join(format!("ration-contract-badday-{}.sqlite3", Ulid::new()));

    let output = ration_output(&db_path, &["db", "migrate"]);
    assert!(output.status.success());

    let output = ration_output(
        &db_path,
        &["ledger", "--user", "user-1", "--day", "garbage", "--json"],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("invalid day key"),
        "expected day validation error, got stderr={stderr}"
    );

    let _ = std::fs::remove_file(&db_path);
}
