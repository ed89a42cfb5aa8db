//! The worker orchestrator: owns a stable identity, the compiled
//! execution pipeline, the controller messenger session, and the store
//! handles, and coordinates the single-slice processing loop with
//! graceful/forced shutdown.
//!
//! A worker is a single-task cooperative state machine: at most one slice
//! is in flight at any time, and the in-flight slot's occupancy is the
//! sole concurrency guard. Parallelism across slices happens at the
//! cluster level by running many worker processes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};

use crate::config::{JobConfig, WorkerContext};
use crate::error::{Result, WorkerError};
use crate::events::{EventBus, WorkerEvent};
use crate::messenger::{MessengerConfig, WorkerMessenger};
use crate::pipeline::{ExecutionPipeline, StageRegistry};
use crate::slice::Slice;
use crate::stores::{open_stores, SliceStatus, Stores};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Initializing,
    Idle,
    Processing,
    ShuttingDown,
    Terminated,
}

pub struct Worker {
    worker_id: String,
    job: JobConfig,
    events: EventBus,
    registry: StageRegistry,
    stores: Stores,
    pipeline: Option<Arc<ExecutionPipeline>>,
    messenger: Option<Arc<WorkerMessenger>>,
    state: RwLock<WorkerState>,
    /// In-flight slot occupancy. Shutdown races this against its watchdog.
    occupied: watch::Sender<bool>,
    /// Recorded shutdown outcome: `None` until shutdown runs, then
    /// `Some(None)` for a clean teardown or `Some(secs)` for a forced one.
    /// Repeated calls observe the same single outcome.
    shutdown_outcome: Mutex<Option<Option<f64>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Construct a worker from its runtime context and job configuration,
    /// opening store handles for the context's configured backend.
    /// Missing or invalid arguments fail synchronously.
    pub fn new(
        context: WorkerContext,
        job: JobConfig,
        events: EventBus,
        registry: StageRegistry,
    ) -> Result<Self> {
        let stores = open_stores(&context.storage)?;
        Self::with_stores(context, job, events, registry, stores)
    }

    /// Like [`Worker::new`] but with explicit store handles.
    pub fn with_stores(
        context: WorkerContext,
        job: JobConfig,
        events: EventBus,
        registry: StageRegistry,
        stores: Stores,
    ) -> Result<Self> {
        context.validate()?;
        job.validate()?;

        let worker_id = format!("{}__{}", context.hostname, context.process_instance_id);
        let (occupied, _) = watch::channel(false);

        Ok(Self {
            worker_id,
            job,
            events,
            registry,
            stores,
            pipeline: None,
            messenger: None,
            state: RwLock::new(WorkerState::Created),
            occupied,
            shutdown_outcome: Mutex::new(None),
        })
    }

    /// Stable identity used as the addressing key in all messenger
    /// traffic: `{hostname}__{process_instance_id}`.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn job(&self) -> &JobConfig {
        &self.job
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Compile the pipeline, then open the messenger session. Must
    /// complete before any slice processing; failure here is fatal.
    pub async fn initialize(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != WorkerState::Created {
                return Err(WorkerError::Config(
                    "worker has already been initialized".into(),
                ));
            }
            *state = WorkerState::Initializing;
        }

        let pipeline = ExecutionPipeline::build(&self.registry, &self.job)?;
        let messenger = WorkerMessenger::connect(
            &self.job.controller_addr(),
            &self.worker_id,
            MessengerConfig {
                action_timeout: self.job.action_timeout(),
                network_latency_buffer: self.job.network_latency_buffer(),
            },
        )
        .await?;

        tracing::info!(
            worker_id = %self.worker_id,
            execution_id = %self.job.execution_id,
            stages = pipeline.stage_count(),
            "worker initialized"
        );

        self.pipeline = Some(Arc::new(pipeline));
        self.messenger = Some(Arc::new(messenger));
        *self.state.write().await = WorkerState::Idle;
        Ok(())
    }

    /// Process exactly one slice: wait for an assignment, record the
    /// start state, run the pipeline, persist the outcome, and report
    /// completion to the controller. Settles exactly once; the caller
    /// invokes it again for the next slice.
    ///
    /// The controller is always notified, success or failure; a stage
    /// failure still rejects here so an outer supervision policy can
    /// decide whether to continue or exit.
    pub async fn run_once(&self) -> Result<()> {
        let (pipeline, messenger) = match (&self.pipeline, &self.messenger) {
            (Some(p), Some(m)) => (Arc::clone(p), Arc::clone(m)),
            _ => {
                return Err(WorkerError::Config(
                    "worker has not been initialized".into(),
                ))
            }
        };
        match *self.state.read().await {
            WorkerState::Idle => {}
            WorkerState::Processing => {
                return Err(WorkerError::WorkerBusy(self.worker_id.clone()))
            }
            WorkerState::ShuttingDown | WorkerState::Terminated => {
                return Err(WorkerError::Connection("worker is shutting down".into()))
            }
            _ => {
                return Err(WorkerError::Config(
                    "worker has not been initialized".into(),
                ))
            }
        }

        // Suspension point: no slice is accepted while the slot is
        // occupied, so this is only reached with an empty slot.
        let slice = messenger.wait_for_slice().await?;

        *self.state.write().await = WorkerState::Processing;
        self.occupied.send_replace(true);
        tracing::info!(
            worker_id = %self.worker_id,
            slice_id = %slice.slice_id,
            "processing slice"
        );

        let result = self.process_slice(&pipeline, &messenger, &slice).await;

        {
            let mut state = self.state.write().await;
            if *state == WorkerState::Processing {
                *state = WorkerState::Idle;
            }
        }
        self.occupied.send_replace(false);
        result
    }

    async fn process_slice(
        &self,
        pipeline: &ExecutionPipeline,
        messenger: &WorkerMessenger,
        slice: &Slice,
    ) -> Result<()> {
        let execution_id = &self.job.execution_id;
        self.stores
            .state
            .create_state(execution_id, slice, SliceStatus::Start)
            .await?;

        match pipeline.run(slice).await {
            Ok((batch, analytics)) => {
                // Store failures must not swallow the completion report;
                // the controller is notified regardless.
                if let Some(analytics) = &analytics {
                    if let Err(e) = self
                        .stores
                        .analytics
                        .record(execution_id, &self.worker_id, analytics)
                        .await
                    {
                        tracing::error!(error = %e, "failed to record slice analytics");
                    }
                }
                if let Err(e) = self
                    .stores
                    .state
                    .update_state(execution_id, slice.slice_id, SliceStatus::Completed, None)
                    .await
                {
                    tracing::error!(error = %e, "failed to persist slice completion state");
                }
                messenger.send_slice_complete(slice, None, analytics).await?;
                tracing::info!(
                    worker_id = %self.worker_id,
                    slice_id = %slice.slice_id,
                    records = batch.len(),
                    "slice completed"
                );
                Ok(())
            }
            Err(cause) => {
                let wrapped = WorkerError::slice_failed(&cause);
                let message = wrapped.to_string();
                tracing::error!(
                    worker_id = %self.worker_id,
                    slice_id = %slice.slice_id,
                    error = %message,
                    "slice failed processing"
                );
                if let Err(e) = self
                    .stores
                    .state
                    .update_state(
                        execution_id,
                        slice.slice_id,
                        SliceStatus::Error,
                        Some(&message),
                    )
                    .await
                {
                    tracing::error!(error = %e, "failed to persist slice error state");
                }
                if let Err(e) = messenger
                    .send_slice_complete(slice, Some(message.clone()), None)
                    .await
                {
                    tracing::error!(error = %e, "failed to notify controller of slice failure");
                }
                Err(wrapped)
            }
        }
    }

    /// Shut the worker down, waiting up to `timeout` (the job's configured
    /// bound when `None`) for an in-flight slice to settle.
    ///
    /// If the slice settles first the teardown is clean and this resolves
    /// without error regardless of the slice's own outcome. If the
    /// watchdog fires first, resources are forcibly released anyway and a
    /// shutdown-timeout error is returned. Idempotent: concurrent or
    /// repeated calls observe the same single outcome, and the
    /// `worker:shutdown` event is emitted exactly once.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<()> {
        let bound = timeout.unwrap_or_else(|| self.job.shutdown_timeout());

        let mut outcome = self.shutdown_outcome.lock().await;
        if let Some(recorded) = *outcome {
            return match recorded {
                None => Ok(()),
                Some(secs) => Err(WorkerError::ShutdownTimeout(secs)),
            };
        }

        *self.state.write().await = WorkerState::ShuttingDown;

        // Race the in-flight slot emptying against the watchdog. Both a
        // successful and a failed slice count as settled. A running stage
        // cannot be preempted; the watchdog only bounds how long we wait
        // before abandoning the slice.
        let mut slot = self.occupied.subscribe();
        let forced = tokio::select! {
            _ = slot.wait_for(|occupied| !*occupied) => false,
            _ = tokio::time::sleep(bound) => true,
        };

        if forced {
            tracing::error!(
                worker_id = %self.worker_id,
                timeout_ms = bound.as_millis() as u64,
                "shutdown watchdog fired, forcing shutdown"
            );
        }
        self.teardown(forced).await;

        let recorded = forced.then(|| bound.as_millis() as f64 / 1000.0);
        *outcome = Some(recorded);
        match recorded {
            None => Ok(()),
            Some(secs) => Err(WorkerError::ShutdownTimeout(secs)),
        }
    }

    async fn teardown(&self, forced: bool) {
        if let Some(messenger) = &self.messenger {
            messenger.close().await;
        }
        if let Err(e) = self.stores.state.shutdown(forced).await {
            tracing::warn!(error = %e, "state store shutdown failed");
        }
        if let Err(e) = self.stores.analytics.shutdown(forced).await {
            tracing::warn!(error = %e, "analytics store shutdown failed");
        }
        *self.state.write().await = WorkerState::Terminated;
        self.events.emit(WorkerEvent::Shutdown {
            worker_id: self.worker_id.clone(),
        });
        tracing::info!(worker_id = %self.worker_id, forced, "worker shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpConfig;

    fn test_job() -> JobConfig {
        serde_json::from_value(serde_json::json!({
            "assignment": "worker",
            "execution_id": "ex-1",
            "job_id": "job-1",
            "controller_port": 1,
            "operations": [{ "_op": "noop" }]
        }))
        .unwrap()
    }

    #[test]
    fn worker_id_is_hostname_and_instance() {
        let worker = Worker::new(
            WorkerContext::new("example.host", "3"),
            test_job(),
            EventBus::default(),
            StageRegistry::default(),
        )
        .unwrap();
        assert_eq!(worker.worker_id(), "example.host__3");
    }

    #[test]
    fn construction_with_empty_context_fails_synchronously() {
        let err = Worker::new(
            WorkerContext::new("", ""),
            test_job(),
            EventBus::default(),
            StageRegistry::default(),
        )
        .unwrap_err();
        assert!(matches!(err, WorkerError::Config(_)));
    }

    #[test]
    fn construction_with_empty_job_fails_synchronously() {
        let mut job = test_job();
        job.operations = Vec::<OpConfig>::new();
        let err = Worker::new(
            WorkerContext::new("host", "1"),
            job,
            EventBus::default(),
            StageRegistry::default(),
        )
        .unwrap_err();
        assert!(matches!(err, WorkerError::Config(_)));
    }

    #[tokio::test]
    async fn run_once_before_initialize_is_an_error() {
        let worker = Worker::new(
            WorkerContext::new("host", "1"),
            test_job(),
            EventBus::default(),
            StageRegistry::default(),
        )
        .unwrap();
        assert_eq!(worker.state().await, WorkerState::Created);
        let err = worker.run_once().await.unwrap_err();
        assert!(err.to_string().contains("not been initialized"));
    }
}
