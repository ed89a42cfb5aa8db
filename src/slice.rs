use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One immutable unit of dispatched work. Created by the execution
/// controller, assigned to exactly one worker at a time, and consumed
/// read-only by the worker's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    pub slice_id: Uuid,
    pub slicer_id: u64,
    pub slicer_order: u64,
    /// Reader-specific request parameters.
    pub request: serde_json::Value,
    #[serde(rename = "_created")]
    pub created: DateTime<Utc>,
}

impl Slice {
    pub fn new(request: serde_json::Value) -> Self {
        Self {
            slice_id: Uuid::new_v4(),
            slicer_id: 0,
            slicer_order: 0,
            request,
            created: Utc::now(),
        }
    }
}

/// Per-stage metrics collected while a slice runs, flushed to the
/// analytics store when the job has analytics enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SliceAnalytics {
    pub stages: Vec<StageAnalytics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageAnalytics {
    pub op: String,
    pub records: usize,
    pub time_ms: u64,
}

impl SliceAnalytics {
    pub fn record_stage(&mut self, op: &str, records: usize, time_ms: u64) {
        self.stages.push(StageAnalytics {
            op: op.to_string(),
            records,
            time_ms,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_serializes_its_timestamp_under_the_wire_name() {
        let slice = Slice::new(serde_json::json!({ "from": 0 }));
        let value = serde_json::to_value(&slice).unwrap();
        assert!(value.get("_created").is_some());
        assert!(value.get("created").is_none());

        let back: Slice = serde_json::from_value(value).unwrap();
        assert_eq!(back, slice);
    }
}
