use crate::{
    acquire::HttpFetcher,
    chunk_plan::{self, DeliveryPlan},
    config::{Config, DeliveryMode, MailProvider, ResendPolicy, base64_len},
    delivery::{
        DeliveryEngine, EmailTransport, LinkTransport, LocalTransport, SendGridMailer, Transport, email,
    },
    engine::{CommandEngine, Reconstructor},
    job::{CancelFlag, JobRequest},
    notify::WebhookNotifier,
    package::Artifact,
    pipeline::Pipeline,
    util::{ensure_dir, hash_file},
    workspace::{WorkspaceManager, new_job_id},
};
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "model-courier")]
#[command(about = "Photo-to-3D job orchestrator (reconstruction + packaging + chunked delivery)")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./model-courier.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check the reconstruction tool, base directory and mail credentials.
    Doctor {},
    /// Show how an artifact would be delivered.
    Plan {
        #[arg(long)]
        artifact: PathBuf,
        #[arg(long)]
        budget: Option<u64>,
    },
    /// Run one job from a JSON request file.
    Run {
        #[arg(long)]
        request: PathBuf,
        /// Write the archive here instead of using the configured delivery.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run a JSON array of requests concurrently.
    Batch {
        #[arg(long)]
        requests: PathBuf,
    },
    /// (Re)deliver an existing artifact by email.
    Deliver {
        #[arg(long)]
        artifact: PathBuf,
        #[arg(long)]
        email: String,
        #[arg(long, default_value_t = 1)]
        from_part: usize,
    },
    /// Split an artifact into delivery-sized parts.
    Split {
        #[arg(long)]
        artifact: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long)]
        budget: Option<u64>,
    },
    /// Concatenate parts, in the order given, back into one file.
    Join {
        #[arg(long)]
        out: PathBuf,
        parts: Vec<PathBuf>,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg = match resolve_config_path(args.config.as_deref()) {
        Some(path) => Config::load(&path)?,
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            cfg
        }
    };
    let _guard = init_logging(&args, &cfg, resolve_log_path(&cfg).as_deref())?;

    match &args.cmd {
        Command::Doctor {} => doctor(&cfg),
        Command::Plan { artifact, budget } => plan(&cfg, artifact, *budget),
        Command::Run { request, out } => run(&cfg, request, out.as_deref()),
        Command::Batch { requests } => batch(&cfg, requests),
        Command::Deliver {
            artifact,
            email,
            from_part,
        } => deliver(&cfg, artifact, email, *from_part),
        Command::Split {
            artifact,
            out_dir,
            budget,
        } => split(&cfg, artifact, out_dir, *budget),
        Command::Join { out, parts } => join(out, parts),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = user {
        return Some(p.to_path_buf());
    }
    ["model-courier.toml", "model-courier.example.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command output, so logs go to stderr
    let stderr_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from(&cfg.paths.base_dir).join("model-courier.log"))
}

fn build_transport(cfg: &Config) -> Result<Box<dyn Transport>> {
    Ok(match cfg.delivery.mode {
        DeliveryMode::Email => {
            let mailer = email::mailer_from_config(cfg)?;
            Box::new(EmailTransport::from_config(mailer, cfg))
        }
        DeliveryMode::Link => Box::new(LinkTransport::from_config(cfg)?),
        DeliveryMode::Local => Box::new(LocalTransport::from_config(cfg)),
    })
}

fn doctor(cfg: &Config) -> Result<()> {
    let base = PathBuf::from(&cfg.paths.base_dir);
    let writable = WorkspaceManager::new(&base)
        .and_then(|m| {
            let ws = m.allocate()?;
            m.release(&ws.job_id);
            Ok(())
        })
        .map_err(|e| format!("{e:#}"));

    let engine = CommandEngine::from_config(cfg);
    let tool = engine.doctor();

    let mail_configured = match cfg.email.provider {
        MailProvider::Sendgrid => SendGridMailer::from_config(cfg)?.has_credentials(),
        MailProvider::Smtp => !cfg.email.smtp_host.is_empty(),
    };

    let ok = writable.is_ok()
        && tool.ok
        && (cfg.delivery.mode != DeliveryMode::Email || mail_configured);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "ok": ok,
            "base_dir": { "path": base, "writable": writable.is_ok(), "error": writable.err() },
            "reconstruction": tool,
            "delivery": {
                "mode": cfg.delivery.mode,
                "budget_bytes": cfg.delivery.budget_bytes,
                "encoded_budget_bytes": base64_len(cfg.delivery.budget_bytes),
                "transport_ceiling_bytes": cfg.delivery.transport_ceiling_bytes,
            },
            "email": { "provider": cfg.email.provider, "configured": mail_configured },
        }))?
    );
    Ok(())
}

fn plan(cfg: &Config, artifact: &Path, budget: Option<u64>) -> Result<()> {
    let artifact = Artifact::from_path(artifact)
        .with_context(|| format!("reading artifact: {}", artifact.display()))?;
    let budget = budget.unwrap_or(cfg.delivery.budget_bytes);
    let plan = DeliveryPlan::for_size(artifact.size, Some(budget));
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading request: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing request JSON: {}", path.display()))
}

fn run(cfg: &Config, request: &Path, out: Option<&Path>) -> Result<()> {
    let req: JobRequest = load_json(request)?;
    let workspaces = WorkspaceManager::new(&cfg.paths.base_dir)?;
    let engine = CommandEngine::from_config(cfg);
    let fetcher = HttpFetcher::from_config(cfg)?;
    let transport: Box<dyn Transport> = match out {
        Some(path) => Box::new(LocalTransport::to_file(path)),
        None => build_transport(cfg)?,
    };
    let notifier = WebhookNotifier::from_config(cfg)?;
    let pipeline = Pipeline::new(cfg, &workspaces, &engine, &fetcher, &*transport, &notifier)?;

    let report = pipeline.run_job(&req, &CancelFlag::new());
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.outcome.ok {
        bail!(
            "job {} failed: {}",
            report.outcome.job_id,
            report.outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn batch(cfg: &Config, requests: &Path) -> Result<()> {
    let reqs: Vec<JobRequest> = load_json(requests)?;
    let workspaces = WorkspaceManager::new(&cfg.paths.base_dir)?;
    let engine = CommandEngine::from_config(cfg);
    let fetcher = HttpFetcher::from_config(cfg)?;
    let transport = build_transport(cfg)?;
    let notifier = WebhookNotifier::from_config(cfg)?;
    let pipeline = Pipeline::new(cfg, &workspaces, &engine, &fetcher, &*transport, &notifier)?;

    info!(jobs = reqs.len(), workers = cfg.jobs.max_concurrent, "batch starting");
    let reports = pipeline.run_batch(&reqs, cfg.jobs.max_concurrent, &CancelFlag::new());
    println!("{}", serde_json::to_string_pretty(&reports)?);
    let failed = reports.iter().filter(|r| !r.outcome.ok).count();
    if failed > 0 {
        bail!("{failed} of {} jobs failed", reports.len());
    }
    Ok(())
}

fn deliver(cfg: &Config, artifact: &Path, to: &str, from_part: usize) -> Result<()> {
    let start = match cfg.delivery.resend_policy {
        ResendPolicy::Resume => from_part.max(1),
        ResendPolicy::Full => {
            if from_part > 1 {
                warn!(from_part, "resend_policy=full; sending every part");
            }
            1
        }
    };

    let artifact = Artifact::from_path(artifact)
        .with_context(|| format!("reading artifact: {}", artifact.display()))?;
    let mailer = email::mailer_from_config(cfg)?;
    let transport = EmailTransport::from_config(mailer, cfg);
    let engine = DeliveryEngine::from_config(&transport, cfg)?;

    let workspaces = WorkspaceManager::new(&cfg.paths.base_dir)?;
    let guard = workspaces.allocate_guarded(&new_job_id(), false)?;
    let report = engine
        .deliver(&artifact, &guard.workspace().parts_dir(), Some(to), start)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "ok": true,
            "email": to,
            "total": report.plan_total,
            "parts": report.parts,
        }))?
    );
    Ok(())
}

fn split(cfg: &Config, artifact: &Path, out_dir: &Path, budget: Option<u64>) -> Result<()> {
    let artifact = Artifact::from_path(artifact)
        .with_context(|| format!("reading artifact: {}", artifact.display()))?;
    let budget = budget.unwrap_or(cfg.delivery.budget_bytes);
    let plan = DeliveryPlan::for_size(artifact.size, Some(budget));
    ensure_dir(out_dir)?;
    let parts = if plan.is_chunked() {
        chunk_plan::split(&artifact, &plan, out_dir)?
    } else {
        // copied out as part 1/1 so the output layout is the same either way
        let dest = out_dir.join(chunk_plan::part_file_name(&artifact.file_name(), 1, 1));
        std::fs::copy(&artifact.path, &dest)?;
        vec![chunk_plan::Part {
            index: 1,
            total: 1,
            path: dest,
            bytes: artifact.size,
            sha256: artifact.sha256.clone(),
        }]
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "artifact": artifact,
            "parts": parts,
        }))?
    );
    Ok(())
}

fn join(out: &Path, parts: &[PathBuf]) -> Result<()> {
    if parts.is_empty() {
        bail!("no parts given");
    }
    let bytes = chunk_plan::join(parts, out)
        .with_context(|| format!("joining into {}", out.display()))?;
    let sha256 = hash_file(out)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "out": out,
            "bytes": bytes,
            "sha256": sha256,
        }))?
    );
    Ok(())
}
