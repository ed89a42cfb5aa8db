use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkerError};

/// Runtime context a worker process is hosted in: cluster identity plus
/// storage-backend settings. Supplied by whatever supervises the process;
/// the worker treats it as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerContext {
    /// Hostname of the machine this worker runs on.
    pub hostname: String,
    /// Unique id of this worker process within the host (e.g. a cluster
    /// worker number). Together with the hostname it forms the worker id.
    pub process_instance_id: String,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl WorkerContext {
    pub fn new(hostname: impl Into<String>, process_instance_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            process_instance_id: process_instance_id.into(),
            storage: StorageConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(WorkerError::Config("context is missing a hostname".into()));
        }
        if self.process_instance_id.is_empty() {
            return Err(WorkerError::Config(
                "context is missing a process instance id".into(),
            ));
        }
        Ok(())
    }
}

/// Storage-backend selection for the state/analytics stores. Backend
/// internals are external collaborators; only `memory` ships in-crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: String,
    pub namespace: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            namespace: "slice-worker".to_string(),
        }
    }
}

/// One operation in the job's pipeline. The first operation names the
/// reader stage; the rest name processors. Extra fields are passed through
/// to the stage factory untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpConfig {
    #[serde(rename = "_op")]
    pub op: String,
    #[serde(flatten)]
    pub params: HashMap<String, serde_json::Value>,
}

impl OpConfig {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }
}

/// Configuration for one execution, handed to the worker at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Role this process was assigned by the cluster ("worker").
    pub assignment: String,
    pub execution_id: String,
    pub job_id: String,
    /// Host the execution controller listens on.
    #[serde(default = "default_controller_hostname")]
    pub controller_hostname: String,
    pub controller_port: u16,
    /// Collect per-stage record counts and timings for each slice.
    #[serde(default)]
    pub analytics: bool,
    /// Carried for the controller's retry policy; the worker itself never
    /// retries a slice (every failure is reported as final).
    #[serde(default)]
    pub max_retries: u32,
    pub operations: Vec<OpConfig>,
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    #[serde(default)]
    pub network_latency_buffer_ms: u64,
}

fn default_controller_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_action_timeout_ms() -> u64 {
    60_000
}

impl JobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.assignment.is_empty() {
            return Err(WorkerError::Config("job is missing an assignment".into()));
        }
        if self.execution_id.is_empty() {
            return Err(WorkerError::Config("job is missing an execution id".into()));
        }
        if self.job_id.is_empty() {
            return Err(WorkerError::Config("job is missing a job id".into()));
        }
        if self.operations.is_empty() {
            return Err(WorkerError::Config(
                "job must declare at least one operation (the reader)".into(),
            ));
        }
        Ok(())
    }

    pub fn controller_addr(&self) -> String {
        format!("{}:{}", self.controller_hostname, self.controller_port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn network_latency_buffer(&self) -> Duration {
        Duration::from_millis(self.network_latency_buffer_ms)
    }
}
