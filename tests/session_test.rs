//! Session lifecycle against simulated instruments loaded from a rig file.

mod common;

use rig_daq::config::RigConfig;
use rig_daq::interpreter::ProgramState;
use rig_daq::monitor::{RUNNING, STOPPED};
use rig_daq::{DaqError, Session};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

fn rig_file(dir: &Path) -> RigConfig {
    let path = dir.join("rig.toml");
    std::fs::write(
        &path,
        format!(
            r#"
[application]
name = "bench"
log_level = "info"

[session]
sample = "Hall7"
data_dir = "{}"

[acquisition]
tick_interval_ms = 1000

[interpreter]
wait_poll_secs = 1

[facility]
kind = "bluefors"
lockins = ["r1"]
magnet = "magnet"
bridge = "bridge"

[[instruments]]
id = "r1"
transport = {{ kind = "simulated", model = "sr830" }}

[[instruments]]
id = "magnet"
transport = {{ kind = "simulated", model = "ami430" }}

[[instruments]]
id = "bridge"
transport = {{ kind = "simulated", model = "lakeshore370" }}
"#,
            dir.join("data").display()
        ),
    )
    .unwrap();
    let config = RigConfig::load_from(&path).unwrap();
    config.validate().unwrap();
    config
}

#[tokio::test(start_paused = true)]
async fn check_start_monitor_stop() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::open(&rig_file(dir.path())).await.unwrap();
    let monitor = session.monitor();
    assert_eq!(monitor.status().message, STOPPED);

    let script = "start-simple base\nwait 3 s\n";
    assert_eq!(session.check(script).await.unwrap(), 3.0);
    assert_eq!(monitor.program_state(), ProgramState::Idle);

    session.start(script).await.unwrap();
    assert_eq!(session.wait_program().await.unwrap(), Some(3.0));
    assert_eq!(monitor.program_state(), ProgramState::Complete);

    let report = monitor.status();
    assert_eq!(report.message, RUNNING);
    assert!(report.channels["U1"].is_some());
    assert!(report.channels["U2"].is_none());
    assert_eq!(report.channels["H"], Some(0.0));
    let flat = report.to_flat_map();
    assert_eq!(flat["U2"], Value::Null);
    assert_eq!(flat["message"], Value::from(RUNNING));

    session.stop().await;
    assert_eq!(monitor.status().message, STOPPED);
    assert_eq!(session.wait_program().await.unwrap(), None);

    let day = std::fs::read_dir(dir.path().join("data"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let raw = std::fs::read_dir(day).unwrap().next().unwrap().unwrap().path();
    assert!(raw.to_string_lossy().ends_with("-Hall7-base.txt"));
    assert!(common::data_rows(&raw).len() >= 3);
}

#[tokio::test]
async fn check_survives_estimates_past_the_calendar() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::open(&rig_file(dir.path())).await.unwrap();

    assert_eq!(session.check("wait 1e13 s").await.unwrap(), 1e13);
    assert_eq!(session.monitor().program_state(), ProgramState::Idle);
    assert!(session.check("wait 1e300 s").await.unwrap_err().is_syntax());
}

#[tokio::test(start_paused = true)]
async fn second_program_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::open(&rig_file(dir.path())).await.unwrap();

    session.start("wait 1 h").await.unwrap();
    let err = session.start("wait 1 s").await.unwrap_err();
    assert!(matches!(err, DaqError::State(_)));

    session.stop().await;
    assert_eq!(session.monitor().program_state(), ProgramState::Interrupted);
}

#[tokio::test]
async fn invalid_script_is_not_started() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::open(&rig_file(dir.path())).await.unwrap();

    let err = session
        .start("start-simple a\nwait 5 fortnights\n")
        .await
        .unwrap_err();
    assert!(err.is_syntax());
    assert_eq!(session.wait_program().await.unwrap(), None);
    assert_eq!(session.monitor().status().message, STOPPED);
    assert!(!dir.path().join("data").exists());
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_program_and_engine() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::open(&rig_file(dir.path())).await.unwrap();
    let monitor = session.monitor();

    session.start("start-cooldown cool\nwait 1 h\n").await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(monitor.program_state(), ProgramState::Running { line: 2 });
    let report = monitor.status();
    assert_eq!(report.message, RUNNING);
    assert!(report.channels.contains_key("T1"));

    session.stop().await;
    assert_eq!(monitor.program_state(), ProgramState::Interrupted);
    assert_eq!(monitor.status().message, STOPPED);
}
