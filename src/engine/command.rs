use super::{ExitState, ReconstructionParams, ReconstructionResult, Reconstructor, ToolDiag};
use crate::{config::Config, job::CancelFlag, workspace::Workspace};
use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Runs the reconstruction tool as a child process. Arguments come from a
/// template; placeholders are substituted inside each argument and every
/// argument is passed to the OS as-is, with no shell in between.
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let rc = &cfg.reconstruction;
        let mut engine = Self::new(&rc.program, rc.args.clone());
        engine.env = rc.env.clone();
        if rc.timeout_seconds > 0 {
            engine.timeout = Some(Duration::from_secs(rc.timeout_seconds));
        }
        engine
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn render_args(&self, ws: &Workspace, params: &ReconstructionParams) -> Vec<OsString> {
        let subs: [(&str, String); 4] = [
            ("{input}", ws.input_dir().display().to_string()),
            ("{output}", ws.output_dir().display().to_string()),
            ("{max_image_size}", params.max_image_size.to_string()),
            ("{dense}", if params.dense { "1" } else { "0" }.to_string()),
        ];
        self.args
            .iter()
            .map(|arg| {
                let mut out = arg.clone();
                for (key, value) in &subs {
                    out = out.replace(key, value);
                }
                OsString::from(out)
            })
            .collect()
    }

    fn spawn(&self, ws: &Workspace, params: &ReconstructionParams) -> Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(ws, params));
        cmd.current_dir(ws.output_dir());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        debug!(program = %self.program.display(), args = ?self.render_args(ws, params), "spawning reconstruction");
        cmd.spawn()
            .with_context(|| format!("spawning {}", self.program.display()))
    }
}

impl Reconstructor for CommandEngine {
    fn doctor(&self) -> ToolDiag {
        let program = self.program.display().to_string();
        match resolve_program(&self.program) {
            Some(path) => ToolDiag {
                program,
                resolved: Some(path.display().to_string()),
                ok: true,
                error: None,
            },
            None => ToolDiag {
                program,
                resolved: None,
                ok: false,
                error: Some("program not found".into()),
            },
        }
    }

    fn run(
        &self,
        ws: &Workspace,
        params: &ReconstructionParams,
        cancel: &CancelFlag,
    ) -> ReconstructionResult {
        let started = Instant::now();
        let mut child = match self.spawn(ws, params) {
            Ok(child) => child,
            Err(err) => {
                warn!("reconstruction could not start: {err:#}");
                return ReconstructionResult {
                    state: ExitState::SpawnFailed,
                    logs: format!("{err:#}"),
                    output_dir: None,
                };
            }
        };

        let (state, logs) = match wait_with_timeout(&mut child, self.timeout, cancel) {
            Ok(captured) => {
                let state = match captured.ending {
                    Ending::Exited(status) if status.success() => ExitState::Success,
                    Ending::Exited(status) => ExitState::Failed {
                        code: status.code(),
                    },
                    Ending::TimedOut(t) => ExitState::TimedOut {
                        seconds: t.as_secs(),
                    },
                    Ending::Cancelled => ExitState::Cancelled,
                };
                (state, captured.logs)
            }
            Err(err) => (ExitState::Failed { code: None }, format!("{err:#}")),
        };

        info!(
            state = %state,
            elapsed_ms = started.elapsed().as_millis() as u64,
            log_bytes = logs.len(),
            "reconstruction finished"
        );
        debug!("reconstruction log:\n{logs}");

        let output_dir = (state == ExitState::Success).then(|| ws.output_dir());
        ReconstructionResult {
            state,
            logs,
            output_dir,
        }
    }
}

fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

enum Ending {
    Exited(ExitStatus),
    TimedOut(Duration),
    Cancelled,
}

struct Captured {
    ending: Ending,
    logs: String,
}

fn drain<R: Read + Send + 'static>(reader: Option<R>, name: &'static str) -> JoinHandle<Result<Vec<u8>>> {
    std::thread::spawn(move || -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut r) = reader {
            r.read_to_end(&mut buf)
                .with_context(|| format!("read {name}"))?;
        }
        Ok(buf)
    })
}

fn join_drain(handle: JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| anyhow!("pipe reader thread panicked"))?
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
    cancel: &CancelFlag,
) -> Result<Captured> {
    // Pipes are drained on their own threads so a chatty tool cannot block on
    // a full stdout/stderr buffer while we poll.
    let stdout_thread = drain(child.stdout.take(), "stdout");
    let stderr_thread = drain(child.stderr.take(), "stderr");

    let start = Instant::now();
    let ending = loop {
        if let Some(status) = child.try_wait().with_context(|| "try_wait")? {
            break Ending::Exited(status);
        }

        if cancel.is_cancelled() {
            warn!("cancellation requested; killing reconstruction");
            let _ = child.kill();
            child.wait().with_context(|| "wait after kill")?;
            break Ending::Cancelled;
        }

        if let Some(limit) = timeout {
            if start.elapsed() > limit {
                warn!("reconstruction timed out after {:?}", limit);
                let _ = child.kill();
                child.wait().with_context(|| "wait after kill")?;
                break Ending::TimedOut(limit);
            }
        }

        std::thread::sleep(Duration::from_millis(50));
    };

    let stdout = join_drain(stdout_thread)?;
    let stderr = join_drain(stderr_thread)?;
    let logs = format!(
        "{}\n{}",
        String::from_utf8_lossy(&stdout),
        String::from_utf8_lossy(&stderr)
    );
    Ok(Captured { ending, logs })
}
