#![cfg(unix)]

use model_courier::engine::{CommandEngine, ExitState, ReconstructionParams, Reconstructor};
use model_courier::job::CancelFlag;
use model_courier::workspace::WorkspaceManager;
use std::time::{Duration, Instant};

const PARAMS: ReconstructionParams = ReconstructionParams {
    max_image_size: 1600,
    dense: false,
};

fn sh(script: &str, extra: &[&str]) -> CommandEngine {
    let mut args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
    args.extend(extra.iter().map(|s| s.to_string()));
    CommandEngine::new("sh", args)
}

#[test]
fn nonzero_exit_keeps_both_streams() {
    let base = tempfile::tempdir().unwrap();
    let ws = WorkspaceManager::new(base.path()).unwrap().allocate().unwrap();
    let engine = sh("echo out-line; echo err-line >&2; exit 3", &[]);

    let res = engine.run(&ws, &PARAMS, &CancelFlag::new());

    assert_eq!(res.state, ExitState::Failed { code: Some(3) });
    assert!(res.logs.contains("out-line"));
    assert!(res.logs.contains("err-line"));
    assert!(res.output_dir.is_none());
}

#[test]
fn placeholders_are_substituted_per_argument() {
    let base = tempfile::tempdir().unwrap();
    let ws = WorkspaceManager::new(base.path()).unwrap().allocate().unwrap();
    std::fs::write(ws.input_dir().join("001.jpg"), b"x").unwrap();
    let engine = sh(
        r#"ls "$1" > "$2/inputs.txt"; echo "$3 $4" > "$2/params.txt""#,
        &["{input}", "{output}", "size={max_image_size}", "{dense}"],
    );

    let res = engine.run(&ws, &PARAMS, &CancelFlag::new());

    assert!(res.is_success(), "{}", res.logs);
    assert_eq!(res.output_dir.as_deref(), Some(ws.output_dir().as_path()));
    let inputs = std::fs::read_to_string(ws.output_dir().join("inputs.txt")).unwrap();
    assert_eq!(inputs.trim(), "001.jpg");
    let params = std::fs::read_to_string(ws.output_dir().join("params.txt")).unwrap();
    assert_eq!(params.trim(), "size=1600 0");
}

#[test]
fn arguments_are_not_shell_interpreted() {
    let base = tempfile::tempdir().unwrap();
    let ws = WorkspaceManager::new(base.path()).unwrap().allocate().unwrap();
    let engine = CommandEngine::new("echo", vec!["$(whoami);".into(), "{dense}".into()]);

    let res = engine.run(&ws, &PARAMS, &CancelFlag::new());

    assert!(res.is_success());
    assert!(res.logs.starts_with("$(whoami); 0"));
}

#[test]
fn tool_runs_inside_output_dir() {
    let base = tempfile::tempdir().unwrap();
    let ws = WorkspaceManager::new(base.path()).unwrap().allocate().unwrap();
    let engine = sh("touch marker", &[]);

    assert!(engine.run(&ws, &PARAMS, &CancelFlag::new()).is_success());
    assert!(ws.output_dir().join("marker").is_file());
}

#[test]
fn timeout_kills_the_tool() {
    let base = tempfile::tempdir().unwrap();
    let ws = WorkspaceManager::new(base.path()).unwrap().allocate().unwrap();
    let engine = sh("echo started; exec sleep 5", &[]).with_timeout(Duration::from_millis(300));

    let started = Instant::now();
    let res = engine.run(&ws, &PARAMS, &CancelFlag::new());

    assert!(matches!(res.state, ExitState::TimedOut { .. }), "{:?}", res.state);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(res.logs.contains("started"));
}

#[test]
fn cancellation_kills_the_tool() {
    let base = tempfile::tempdir().unwrap();
    let ws = WorkspaceManager::new(base.path()).unwrap().allocate().unwrap();
    let engine = sh("exec sleep 5", &[]);
    let cancel = CancelFlag::new();

    let trigger = cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        trigger.cancel();
    });
    let started = Instant::now();
    let res = engine.run(&ws, &PARAMS, &cancel);
    canceller.join().unwrap();

    assert_eq!(res.state, ExitState::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn missing_program_is_spawn_failure() {
    let base = tempfile::tempdir().unwrap();
    let ws = WorkspaceManager::new(base.path()).unwrap().allocate().unwrap();
    let engine = CommandEngine::new("/nonexistent/reconstruct", vec![]);

    let res = engine.run(&ws, &PARAMS, &CancelFlag::new());

    assert_eq!(res.state, ExitState::SpawnFailed);
    assert!(res.logs.contains("/nonexistent/reconstruct"));
    assert!(!engine.doctor().ok);
}

#[test]
fn doctor_resolves_from_path() {
    let diag = CommandEngine::new("sh", vec![]).doctor();
    assert!(diag.ok);
    assert!(diag.resolved.is_some());
}
