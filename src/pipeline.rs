use crate::{
    acquire::{self, Fetcher},
    config::Config,
    delivery::{DeliveryEngine, DeliveryReport, Transport},
    engine::{ExitState, Reconstructor},
    error::{JobError, JobResult},
    job::{CancelFlag, JobRequest, JobState, Lifecycle, Outcome},
    notify::{self, NotificationStatus, Notifier},
    package,
    workspace::{WorkspaceManager, new_job_id},
};
use anyhow::Result;
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info, info_span, warn};

/// What a synchronous caller gets back: the job's true outcome plus, on a
/// separate channel, how the webhook notification went.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    #[serde(flatten)]
    pub outcome: Outcome,
    pub notification: NotificationStatus,
}

pub struct Pipeline<'a> {
    cfg: &'a Config,
    workspaces: &'a WorkspaceManager,
    engine: &'a dyn Reconstructor,
    fetcher: &'a dyn Fetcher,
    transport: &'a dyn Transport,
    notifier: &'a dyn Notifier,
    delivery: DeliveryEngine<'a>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        cfg: &'a Config,
        workspaces: &'a WorkspaceManager,
        engine: &'a dyn Reconstructor,
        fetcher: &'a dyn Fetcher,
        transport: &'a dyn Transport,
        notifier: &'a dyn Notifier,
    ) -> Result<Self> {
        let delivery = DeliveryEngine::from_config(transport, cfg)?;
        Ok(Self {
            cfg,
            workspaces,
            engine,
            fetcher,
            transport,
            notifier,
            delivery,
        })
    }

    /// Runs one job end to end on the calling thread. Always returns a
    /// report; failures are folded into the outcome.
    pub fn run_job(&self, req: &JobRequest, cancel: &CancelFlag) -> JobReport {
        let job_id = new_job_id();
        let span = info_span!(
            "job",
            job_id = %job_id,
            order_id = req.order_id.as_deref().unwrap_or("")
        );
        let _enter = span.enter();
        info!(images = req.images.len(), "job created");

        let mut lifecycle = Lifecycle::new(&job_id);
        let outcome = match self.execute(&job_id, req, cancel, &mut lifecycle) {
            Ok(report) => {
                lifecycle.advance(JobState::Succeeded);
                info!(parts = report.parts.len(), "job succeeded");
                Outcome::success(&job_id, req, report.locator, report.parts)
            }
            Err(err) => {
                lifecycle.fail();
                error!(kind = err.kind(), "job failed: {err}");
                Outcome::failure(&job_id, req, &err)
            }
        };

        let notification = notify::notify(self.notifier, req.webhook_url.as_deref(), &outcome);
        JobReport {
            outcome,
            notification,
        }
    }

    fn execute(
        &self,
        job_id: &str,
        req: &JobRequest,
        cancel: &CancelFlag,
        lifecycle: &mut Lifecycle,
    ) -> JobResult<DeliveryReport> {
        lifecycle.advance(JobState::Validating);
        let planned = acquire::validate(self.cfg, req)?;
        if self.transport.needs_recipient() && req.email.is_none() {
            return Err(JobError::validation(format!(
                "{} delivery requires an email address",
                self.transport.name()
            )));
        }
        check_cancel(cancel)?;

        lifecycle.advance(JobState::Acquiring);
        let guard = self
            .workspaces
            .allocate_guarded(job_id, self.cfg.jobs.keep_workspace)?;
        let ws = guard.workspace();
        acquire::acquire(&planned, &ws.input_dir(), self.fetcher)?;
        check_cancel(cancel)?;

        lifecycle.advance(JobState::Reconstructing);
        let params = req.params(self.cfg);
        info!(max_image_size = params.max_image_size, dense = params.dense, "reconstruction starting");
        let result = self.engine.run(ws, &params, cancel);
        let output_dir = match (result.state, result.output_dir) {
            (ExitState::Success, Some(dir)) => dir,
            (ExitState::Success, None) => ws.output_dir(),
            (ExitState::Cancelled, _) => return Err(JobError::Cancelled),
            (state, _) => {
                return Err(JobError::Reconstruction {
                    status: state.to_string(),
                    logs: result.logs,
                });
            }
        };
        check_cancel(cancel)?;

        lifecycle.advance(JobState::Packaging);
        let artifact = package::package(&output_dir, &ws.root.join(&self.cfg.package.archive_name))?;
        check_cancel(cancel)?;

        lifecycle.advance(JobState::Delivering);
        self.delivery
            .deliver(&artifact, &ws.parts_dir(), req.email.as_deref(), 1)
    }

    /// Runs each request on one of `max_concurrent` worker threads. Reports
    /// come back in request order.
    pub fn run_batch(&self, reqs: &[JobRequest], max_concurrent: usize, cancel: &CancelFlag) -> Vec<JobReport> {
        let workers = max_concurrent.clamp(1, reqs.len().max(1));
        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<JobReport>>> = Mutex::new(vec![None; reqs.len()]);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(req) = reqs.get(i) else { break };
                        let report = self.run_job(req, cancel);
                        match slots.lock() {
                            Ok(mut guard) => guard[i] = Some(report),
                            Err(poisoned) => poisoned.into_inner()[i] = Some(report),
                        }
                    }
                });
            }
        });

        let slots = slots.into_inner().unwrap_or_else(|p| p.into_inner());
        slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    warn!(index = i, "batch worker produced no report");
                    let err = JobError::Cancelled;
                    JobReport {
                        outcome: Outcome::failure("", &reqs[i], &err),
                        notification: NotificationStatus::Skipped,
                    }
                })
            })
            .collect()
    }
}

fn check_cancel(cancel: &CancelFlag) -> JobResult<()> {
    if cancel.is_cancelled() {
        Err(JobError::Cancelled)
    } else {
        Ok(())
    }
}
