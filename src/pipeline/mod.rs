//! The ordered multi-stage execution pipeline.
//!
//! A pipeline is compiled once per worker from the job's operation list:
//! stage 0 is a reader that turns the slice descriptor into an initial
//! record batch, stages 1..n are processors that transform the full batch
//! in declared order. The pipeline object persists across slices; only the
//! in-flight batch is per-slice.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{JobConfig, OpConfig};
use crate::error::{Result, WorkerError};
use crate::slice::{Slice, SliceAnalytics};

/// Source stage: converts a slice descriptor into the initial record batch.
#[async_trait]
pub trait Reader: Send + Sync {
    async fn fetch(&self, slice: &Slice) -> Result<Vec<Value>>;
}

/// Transform stage: consumes the previous stage's entire output batch.
///
/// Stages must be stateless with respect to slice identity; any cross-slice
/// accumulation has to be designed in explicitly by the stage author.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn handle(&self, batch: Vec<Value>) -> Result<Vec<Value>>;
}

pub type ReaderFactory = Box<dyn Fn(&OpConfig) -> Result<Box<dyn Reader>> + Send + Sync>;
pub type ProcessorFactory = Box<dyn Fn(&OpConfig) -> Result<Box<dyn Processor>> + Send + Sync>;

/// Registry of operation names resolved once when the worker initializes.
/// An operation name the registry does not know is a configuration error,
/// surfaced before any slice is accepted.
pub struct StageRegistry {
    readers: HashMap<String, ReaderFactory>,
    processors: HashMap<String, ProcessorFactory>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            readers: HashMap::new(),
            processors: HashMap::new(),
        }
    }

    pub fn register_reader(
        &mut self,
        name: impl Into<String>,
        factory: ReaderFactory,
    ) -> &mut Self {
        self.readers.insert(name.into(), factory);
        self
    }

    pub fn register_processor(
        &mut self,
        name: impl Into<String>,
        factory: ProcessorFactory,
    ) -> &mut Self {
        self.processors.insert(name.into(), factory);
        self
    }

    fn build_reader(&self, op: &OpConfig) -> Result<Box<dyn Reader>> {
        let factory = self.readers.get(&op.op).ok_or_else(|| {
            WorkerError::Config(format!("unknown reader operation: {}", op.op))
        })?;
        factory(op)
    }

    fn build_processor(&self, op: &OpConfig) -> Result<Box<dyn Processor>> {
        let factory = self.processors.get(&op.op).ok_or_else(|| {
            WorkerError::Config(format!("unknown processor operation: {}", op.op))
        })?;
        factory(op)
    }
}

impl Default for StageRegistry {
    /// Registry with the builtin operations (`noop`).
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register_processor("noop", Box::new(|_| Ok(Box::new(Noop))));
        registry
    }
}

/// Pass-through builtin processor.
struct Noop;

#[async_trait]
impl Processor for Noop {
    async fn handle(&self, batch: Vec<Value>) -> Result<Vec<Value>> {
        Ok(batch)
    }
}

pub struct ExecutionPipeline {
    reader_op: String,
    reader: Box<dyn Reader>,
    processors: Vec<(String, Box<dyn Processor>)>,
    analytics_enabled: bool,
}

impl std::fmt::Debug for ExecutionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPipeline")
            .field("reader_op", &self.reader_op)
            .field(
                "processors",
                &self.processors.iter().map(|(op, _)| op).collect::<Vec<_>>(),
            )
            .field("analytics_enabled", &self.analytics_enabled)
            .finish_non_exhaustive()
    }
}

impl ExecutionPipeline {
    /// Compile the job's operation list against the registry. The first
    /// operation must resolve to a reader, the rest to processors.
    pub fn build(registry: &StageRegistry, job: &JobConfig) -> Result<Self> {
        let (reader_op, processor_ops) = job
            .operations
            .split_first()
            .ok_or_else(|| WorkerError::Config("job has no operations".into()))?;

        let reader = registry.build_reader(reader_op)?;
        let mut processors = Vec::with_capacity(processor_ops.len());
        for op in processor_ops {
            processors.push((op.op.clone(), registry.build_processor(op)?));
        }

        Ok(Self {
            reader_op: reader_op.op.clone(),
            reader,
            processors,
            analytics_enabled: job.analytics,
        })
    }

    pub fn stage_count(&self) -> usize {
        1 + self.processors.len()
    }

    /// Run one slice through every stage in declared order. Stage *n+1*
    /// only starts once stage *n*'s entire output is available; the first
    /// failure aborts the remaining stages and no partial output survives.
    pub async fn run(&self, slice: &Slice) -> Result<(Vec<Value>, Option<SliceAnalytics>)> {
        let mut analytics = self.analytics_enabled.then(SliceAnalytics::default);

        let started = Instant::now();
        let mut batch = self.reader.fetch(slice).await?;
        if let Some(a) = analytics.as_mut() {
            a.record_stage(
                &self.reader_op,
                batch.len(),
                started.elapsed().as_millis() as u64,
            );
        }

        for (op, processor) in &self.processors {
            let started = Instant::now();
            batch = processor.handle(batch).await?;
            if let Some(a) = analytics.as_mut() {
                a.record_stage(op, batch.len(), started.elapsed().as_millis() as u64);
            }
        }

        Ok((batch, analytics))
    }
}
