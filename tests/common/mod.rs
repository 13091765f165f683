#![allow(dead_code)]

use model_courier::{
    acquire::Fetcher,
    config::Config,
    delivery::{EmailMessage, Mailer, TransportError},
    engine::{ExitState, ReconstructionParams, ReconstructionResult, Reconstructor, ToolDiag},
    error::{JobError, JobResult},
    job::{CancelFlag, ImageRef, Outcome},
    notify::{NotifyError, Notifier},
    workspace::Workspace,
};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const KIB: u64 = 1024;

/// Deterministic, incompressible-looking bytes.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 24) as u8
        })
        .collect()
}

pub fn test_config(base: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.paths.base_dir = base.display().to_string();
    cfg.delivery.retry_delay_ms = 0;
    cfg.delivery.budget_bytes = 18 * KIB;
    cfg.delivery.transport_ceiling_bytes = 25 * KIB;
    cfg
}

pub fn jpgs(n: usize) -> Vec<ImageRef> {
    (0..n)
        .map(|i| ImageRef::bytes(format!("IMG_{i}.JPG"), noise(64, i as u64 + 1)))
        .collect()
}

pub fn dir_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

/// Stands in for the external tool: writes `output_bytes` of noise or fails
/// with `fail_logs`.
pub struct FakeEngine {
    pub output_bytes: usize,
    pub fail_logs: Option<String>,
    pub calls: AtomicUsize,
    pub seen_inputs: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn producing(output_bytes: usize) -> Self {
        Self {
            output_bytes,
            fail_logs: None,
            calls: AtomicUsize::new(0),
            seen_inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(logs: &str) -> Self {
        Self {
            fail_logs: Some(logs.to_string()),
            ..Self::producing(0)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Reconstructor for FakeEngine {
    fn doctor(&self) -> ToolDiag {
        ToolDiag {
            program: "fake".into(),
            resolved: None,
            ok: true,
            error: None,
        }
    }

    fn run(&self, ws: &Workspace, _params: &ReconstructionParams, _cancel: &CancelFlag) -> ReconstructionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut names: Vec<String> = std::fs::read_dir(ws.input_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        *self.seen_inputs.lock().unwrap() = names;

        if let Some(logs) = &self.fail_logs {
            return ReconstructionResult {
                state: ExitState::Failed { code: Some(1) },
                logs: logs.clone(),
                output_dir: None,
            };
        }
        let out = ws.output_dir();
        std::fs::create_dir_all(out.join("sparse")).unwrap();
        std::fs::write(out.join("model.ply"), noise(self.output_bytes, 42)).unwrap();
        std::fs::write(out.join("sparse").join("cameras.txt"), b"# cameras\n").unwrap();
        ReconstructionResult {
            state: ExitState::Success,
            logs: "done\n".into(),
            output_dir: Some(out),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachment_name: String,
    pub attachment: Vec<u8>,
}

/// Records every message; optionally fails every send of one subject.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<SentMail>>,
    pub attempts: AtomicUsize,
    pub fail_subject_containing: Option<String>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, msg: &EmailMessage) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(needle) = &self.fail_subject_containing {
            if msg.subject.contains(needle.as_str()) {
                return Err(TransportError::HttpStatus {
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
        }
        self.sent.lock().unwrap().push(SentMail {
            to: msg.to.clone(),
            subject: msg.subject.clone(),
            body: msg.body.clone(),
            attachment_name: msg.attachment_name.clone(),
            attachment: msg.attachment.clone(),
        });
        Ok(())
    }
}

impl Mailer for &RecordingMailer {
    fn send(&self, msg: &EmailMessage) -> Result<(), TransportError> {
        (**self).send(msg)
    }
}

#[derive(Default)]
pub struct CountingFetcher {
    pub calls: AtomicUsize,
    pub fail_url_containing: Option<String>,
}

impl CountingFetcher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for CountingFetcher {
    fn fetch(&self, url: &str) -> JobResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(needle) = &self.fail_url_containing {
            if url.contains(needle.as_str()) {
                return Err(JobError::Fetch {
                    url: url.to_string(),
                    reason: "HTTP 404".into(),
                });
            }
        }
        Ok(noise(32, url.len() as u64))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub posted: Mutex<Vec<(String, Outcome)>>,
    pub always_fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Default::default()
        }
    }

    pub fn posted(&self) -> Vec<(String, Outcome)> {
        self.posted.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn post(&self, url: &str, outcome: &Outcome) -> Result<(), NotifyError> {
        self.posted
            .lock()
            .unwrap()
            .push((url.to_string(), outcome.clone()));
        if self.always_fail {
            return Err(NotifyError::HttpStatus(500));
        }
        Ok(())
    }
}

/// What the one-shot HTTP endpoint received.
#[derive(Debug)]
pub struct CapturedRequest {
    pub request_line: String,
    pub body: Vec<u8>,
}

/// Serves exactly one request on 127.0.0.1 with `status` and `body`, then
/// hands back what it read. Returns the base URL.
pub fn one_shot_http(status: u16, body: &str) -> (String, JoinHandle<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let body = body.to_string();
    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let captured = read_request(&mut BufReader::new(stream.try_clone().unwrap()));
        let reason = if status < 400 { "OK" } else { "Error" };
        let resp = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(resp.as_bytes()).unwrap();
        captured
    });
    (format!("http://{addr}"), handle)
}

fn read_request(reader: &mut impl BufRead) -> CapturedRequest {
    let mut request_line = String::new();
    reader.read_line(&mut request_line).unwrap();
    let mut content_length = None;
    let mut chunked = false;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            match k.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = v.trim().parse::<usize>().ok(),
                "transfer-encoding" => chunked = v.to_ascii_lowercase().contains("chunked"),
                _ => {}
            }
        }
    }

    let mut body = Vec::new();
    if let Some(n) = content_length {
        body.resize(n, 0);
        reader.read_exact(&mut body).unwrap();
    } else if chunked {
        loop {
            let mut size_line = String::new();
            reader.read_line(&mut size_line).unwrap();
            let hex = size_line.trim().split(';').next().unwrap_or("0");
            let size = usize::from_str_radix(hex, 16).unwrap();
            let mut chunk = vec![0; size + 2];
            reader.read_exact(&mut chunk).unwrap();
            if size == 0 {
                break;
            }
            chunk.truncate(size);
            body.extend(chunk);
        }
    }
    CapturedRequest {
        request_line: request_line.trim_end().to_string(),
        body,
    }
}
