//! # Evaluation Workers
//!
//! ## Responsibility
//! Run the `Generate → Evaluate` half of an iteration for jobs received
//! from the controller, and send back a typed result.
//!
//! ## Guarantees
//! - Message-only: workers see a [`Job`] and reply with a [`JobResult`];
//!   they never touch the archive or registry
//! - Bounded: every generator call is wrapped in `tokio::time::timeout`, and
//!   every cascade stage carries its own timeout
//! - Clean exit: a worker stops when the job channel closes or the result
//!   channel is dropped
//!
//! ## NOT Responsible For
//! - Choosing parents or ingesting results (see: `controller`)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info_span, Instrument};

use crate::candidate::CandidateId;
use crate::cascade::{run_cascade, CascadeReport};
use crate::config::StageConfig;
use crate::evaluator::Evaluator;
use crate::generator::{GenerationError, GenerationParams, Generator};
use crate::metrics;
use crate::retry::{retry_if, RetryPolicy};

/// One unit of work: generate a child from `prompt`, then evaluate it.
pub(crate) struct Job {
    /// Iteration index assigned at dispatch.
    pub iteration: u64,
    /// Island the child belongs to.
    pub island: usize,
    /// Rendered prompt.
    pub prompt: String,
    /// First parent, if the island had occupants.
    pub parent: Option<(CandidateId, u32)>,
    /// Key of the drawn generator, for logs.
    pub generator_key: String,
    /// The drawn generator.
    pub generator: Arc<dyn Generator>,
}

/// What happened to a job.
#[derive(Debug)]
pub(crate) enum JobOutcome {
    /// Generation failed after all retries; nothing was evaluated.
    Abandoned(GenerationError),
    /// The child went through the cascade.
    Evaluated {
        /// Generated source text.
        source: String,
        /// Cascade result.
        report: CascadeReport,
    },
}

/// Reply for one [`Job`].
#[derive(Debug)]
pub(crate) struct JobResult {
    /// Iteration index from the job.
    pub iteration: u64,
    /// Island from the job.
    pub island: usize,
    /// Parent from the job.
    pub parent: Option<(CandidateId, u32)>,
    /// Outcome.
    pub outcome: JobOutcome,
}

/// Read-only settings shared by every worker.
pub(crate) struct WorkerContext {
    pub evaluator: Arc<dyn Evaluator>,
    pub stages: Vec<StageConfig>,
    pub params: GenerationParams,
    pub retry: RetryPolicy,
    pub generation_timeout: Duration,
    pub max_source_len: usize,
}

/// Worker loop: pull jobs from the shared receiver until it closes.
pub(crate) async fn run_worker(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    results: mpsc::Sender<JobResult>,
) {
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            debug!(worker_id, "worker: job channel closed");
            break;
        };

        let span = info_span!("iteration", iteration = job.iteration, island = job.island, worker_id);
        let result = execute(&ctx, job).instrument(span).await;
        if results.send(result).await.is_err() {
            debug!(worker_id, "worker: result channel closed");
            break;
        }
    }
}

async fn execute(ctx: &WorkerContext, job: Job) -> JobResult {
    let Job {
        iteration,
        island,
        prompt,
        parent,
        generator_key,
        generator,
    } = job;

    let outcome = match generate(ctx, generator.as_ref(), &prompt).await {
        Err(e) => {
            debug!(generator = %generator_key, error = %e, "generation abandoned");
            JobOutcome::Abandoned(e)
        }
        Ok(source) => {
            let report = run_cascade(ctx.evaluator.as_ref(), &source, &ctx.stages).await;
            JobOutcome::Evaluated { source, report }
        }
    };

    JobResult {
        iteration,
        island,
        parent,
        outcome,
    }
}

async fn generate(
    ctx: &WorkerContext,
    generator: &dyn Generator,
    prompt: &str,
) -> Result<String, GenerationError> {
    let source = retry_if(
        &ctx.retry,
        move || async move {
            match tokio::time::timeout(ctx.generation_timeout, generator.generate(prompt, &ctx.params))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout),
            }
        },
        |e: &GenerationError| {
            metrics::record_generation_retry(e.kind());
            true
        },
    )
    .await?;

    // Checked after the retry loop: an oversized reply is not retried.
    let length = source.chars().count();
    if length > ctx.max_source_len {
        return Err(GenerationError::InvalidResponse(format!(
            "source length {length} chars exceeds limit {}",
            ctx.max_source_len
        )));
    }
    Ok(source)
}
