//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sutra_core::jobs::{
    Job, JobId, JobPipeline, JobStore, LogNotifier, PipelineConfig, RenderPayload, RetryPolicy,
    Scheduler, SchedulerConfig, Step, StepContext, StepError, StepExecutor, StepOutput,
};

/// Executor that fails each step a scripted number of times, then succeeds.
#[derive(Default)]
pub struct ScriptedExecutor {
    failures: Mutex<HashMap<Step, Vec<StepError>>>,
    calls: Mutex<Vec<(Step, u32)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `errors` to be returned, in order, by the next runs of `step`.
    pub fn fail(self, step: Step, errors: Vec<StepError>) -> Self {
        self.failures.lock().insert(step, errors);
        self
    }

    pub fn calls(&self) -> Vec<(Step, u32)> {
        self.calls.lock().clone()
    }

    pub fn steps_run(&self) -> Vec<Step> {
        self.calls.lock().iter().map(|(step, _)| *step).collect()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn run(&self, step: Step, ctx: &StepContext) -> Result<StepOutput, StepError> {
        self.calls.lock().push((step, ctx.attempt));
        let next = self.failures.lock().get_mut(&step).and_then(|errors| {
            if errors.is_empty() {
                None
            } else {
                Some(errors.remove(0))
            }
        });
        match next {
            Some(err) => Err(err),
            None => Ok(StepOutput::new(format!("{} done", step))),
        }
    }
}

pub fn job(id: &str) -> Job {
    Job::new(JobId::parse(id).unwrap(), RenderPayload::default())
}

pub fn pipeline_config(max_attempts: u32) -> PipelineConfig {
    PipelineConfig {
        retry: RetryPolicy::immediate(max_attempts),
        step_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn scheduler(
    store: Arc<dyn JobStore>,
    executor: Arc<dyn StepExecutor>,
    max_attempts: u32,
    queue_capacity: usize,
) -> Scheduler {
    let pipeline = JobPipeline::new(store.clone(), executor, pipeline_config(max_attempts));
    Scheduler::new(
        store,
        pipeline,
        Arc::new(LogNotifier),
        SchedulerConfig {
            max_concurrency: 2,
            queue_capacity,
            notify_policy: RetryPolicy::immediate(1),
            redrive_policy: RetryPolicy::immediate(3),
            ..Default::default()
        },
    )
}

/// Poll the store until the job is terminal.
pub async fn wait_terminal(store: &dyn JobStore, id: &JobId) -> Job {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let job = store.get(id).await.unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not reach a terminal status")
}
