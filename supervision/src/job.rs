//! Job driver: submits the transactions the pure job logic decides on.
//!
//! A [`Job`] pairs one job document with the status it was last seen in.
//! Every operation reads one snapshot, asks [`crate::core::jobs`] for a
//! decision and issues at most one conditional write (plus, for aborts, the
//! independent aborts of sub-jobs in the same request). Rejected writes are
//! not errors: the job keeps its status and is retried on the next call.

use std::slice;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{debug, info, instrument, warn};

use crate::core::jobs::{self, Commit, Decision, JobContext};
use crate::core::paths;
use crate::core::snapshot::Snapshot;
use crate::core::transaction::{Operation, Transaction};
use crate::core::types::{JobDocument, JobStatus, JobTimeouts, StepOutcome};
use crate::io::agent::{AgentInterface, WriteMode};

pub struct Job<'a, A: AgentInterface + ?Sized> {
    agent: &'a A,
    doc: JobDocument,
    status: JobStatus,
    timeouts: JobTimeouts,
}

impl<'a, A: AgentInterface + ?Sized> Job<'a, A> {
    /// A job that does not exist in the store yet.
    pub fn new(agent: &'a A, doc: JobDocument) -> Self {
        Self {
            agent,
            doc,
            status: JobStatus::NotFound,
            timeouts: JobTimeouts::default(),
        }
    }

    /// The job stored under `job_id`, if any.
    pub fn load(agent: &'a A, snapshot: &Snapshot, job_id: &str) -> Option<Self> {
        let (status, doc) = jobs::find_job(snapshot, job_id)?;
        Some(Self {
            agent,
            doc,
            status,
            timeouts: JobTimeouts::default(),
        })
    }

    pub fn with_timeouts(mut self, timeouts: JobTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn id(&self) -> &str {
        &self.doc.job_id
    }

    pub fn doc(&self) -> &JobDocument {
        &self.doc
    }

    /// Status as of the last operation.
    pub fn state(&self) -> JobStatus {
        self.status
    }

    /// Write the job to ToDo (or straight to Failed for a useless move).
    ///
    /// With an `envelope` the creation is only merged into it and `Ok(true)`
    /// means it was added; the caller submits the envelope. Without one the
    /// document is written on its own and `Ok(false)` means the store
    /// rejected it, for example because the id is taken.
    #[instrument(skip_all, fields(job_id = %self.doc.job_id, job_type = %self.doc.job_type))]
    pub fn create(
        &mut self,
        envelope: Option<&mut Transaction>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (tx, status) = jobs::create(&self.doc, now)
            .with_context(|| format!("serialize job {}", self.doc.job_id))?;
        if let Some(envelope) = envelope {
            envelope.merge(tx).map_err(|conflict| {
                anyhow!("add job {} to envelope: {conflict}", self.doc.job_id)
            })?;
            debug!("job added to envelope");
            return Ok(true);
        }
        let result = self.agent.write(slice::from_ref(&tx), WriteMode::Normal)?;
        if !result.applied(0) {
            debug!("job creation rejected");
            return Ok(false);
        }
        self.adopt_stored(&tx, status);
        self.status = status;
        info!(%status, "job created");
        Ok(true)
    }

    /// Advance a ToDo job.
    #[instrument(skip_all, fields(job_id = %self.doc.job_id, job_type = %self.doc.job_type))]
    pub fn start(
        &mut self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
        rng: &mut dyn RngCore,
    ) -> Result<StepOutcome> {
        if self.status != JobStatus::ToDo {
            return Err(anyhow!(
                "job {} is {} and cannot be started",
                self.doc.job_id,
                self.status
            ));
        }
        let ctx = self.context(snapshot, now);
        let decision = jobs::start(&ctx, &self.doc, rng)
            .with_context(|| format!("serialize job {}", self.doc.job_id))?;
        self.apply(snapshot, now, decision)
    }

    /// Advance a Pending job.
    #[instrument(skip_all, fields(job_id = %self.doc.job_id, job_type = %self.doc.job_type))]
    pub fn run(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) -> Result<StepOutcome> {
        if self.status != JobStatus::Pending {
            return Err(anyhow!(
                "job {} is {} and cannot be run",
                self.doc.job_id,
                self.status
            ));
        }
        let ctx = self.context(snapshot, now);
        let decision = jobs::run(&ctx, &self.doc)
            .with_context(|| format!("serialize job {}", self.doc.job_id))?;
        self.apply(snapshot, now, decision)
    }

    /// Same as [`Job::run`].
    pub fn status(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) -> Result<StepOutcome> {
        self.run(snapshot, now)
    }

    /// Take the job to Failed with `reason`, compensating Plan and locks.
    ///
    /// Errors when the job is not ToDo or Pending, or when the store
    /// rejects the abort transaction.
    #[instrument(skip_all, fields(job_id = %self.doc.job_id, job_type = %self.doc.job_type, reason = %reason))]
    pub fn abort(&mut self, snapshot: &Snapshot, now: DateTime<Utc>, reason: &str) -> Result<()> {
        let ctx = self.context(snapshot, now);
        let plan = jobs::abort(&ctx, &self.doc, self.status, reason).map_err(|err| anyhow!(err))?;
        let mut transactions = Vec::with_capacity(1 + plan.followups.len());
        transactions.push(plan.transaction);
        transactions.extend(plan.followups);
        let result = self.agent.write(&transactions, WriteMode::Normal)?;
        if !result.applied(0) {
            warn!("abort rejected");
            return Err(anyhow!(
                "abort of job {} was rejected by the agency",
                self.doc.job_id
            ));
        }
        let skipped = (1..transactions.len()).filter(|i| !result.applied(*i)).count();
        if skipped > 0 {
            warn!(skipped, "some sub-job aborts were rejected");
        }
        info!(from = %self.status, "job aborted");
        self.status = JobStatus::Failed;
        Ok(())
    }

    /// Take over the document a committed transaction wrote for this job,
    /// so later steps see fields set on the way (for example `isLeader`).
    fn adopt_stored(&mut self, tx: &Transaction, status: JobStatus) {
        let Some(path) = paths::job(status, &self.doc.job_id) else {
            return;
        };
        if let Some(Operation::Set(stored)) = tx.operation(&path) {
            if let Some(doc) = JobDocument::from_json(stored) {
                self.doc = doc;
            }
        }
    }

    fn context<'s>(&self, snapshot: &'s Snapshot, now: DateTime<Utc>) -> JobContext<'s> {
        JobContext::new(snapshot, now).with_timeouts(self.timeouts)
    }

    fn apply(
        &mut self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
        decision: Decision,
    ) -> Result<StepOutcome> {
        match decision {
            Decision::Wait(reason) => {
                debug!(%reason, "job waiting");
                Ok(StepOutcome::Retry { reason })
            }
            Decision::Abort(reason) => Ok(self.abort_step(snapshot, now, &reason)),
            Decision::Commit(commit) => self.commit(snapshot, now, commit),
        }
    }

    fn abort_step(&mut self, snapshot: &Snapshot, now: DateTime<Utc>, reason: &str) -> StepOutcome {
        match self.abort(snapshot, now, reason) {
            Ok(()) => StepOutcome::Terminal {
                status: JobStatus::Failed,
                reason: Some(reason.to_string()),
            },
            Err(err) => StepOutcome::retry(format!("{reason}; {err:#}")),
        }
    }

    fn commit(
        &mut self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
        commit: Commit,
    ) -> Result<StepOutcome> {
        let result = self
            .agent
            .write(slice::from_ref(&commit.transaction), WriteMode::Normal)?;
        if result.applied(0) {
            let from = self.status;
            self.adopt_stored(&commit.transaction, commit.next);
            self.status = commit.next;
            info!(%from, to = %commit.next, "job transition committed");
            if commit.next.is_terminal() {
                return Ok(StepOutcome::Terminal {
                    status: commit.next,
                    reason: commit.reason,
                });
            }
            return Ok(StepOutcome::Progress {
                status: commit.next,
            });
        }

        if let Some(recheck) = commit.recheck {
            let read = self.agent.transact(slice::from_ref(&recheck.path))?;
            if read.accepted && read.results.first() != Some(&recheck.expected) {
                info!(path = %recheck.path, "trigger no longer holds");
                return Ok(self.abort_step(snapshot, now, &recheck.reason));
            }
        }
        debug!("transaction rejected, retrying next cycle");
        Ok(StepOutcome::retry("transaction rejected"))
    }
}
