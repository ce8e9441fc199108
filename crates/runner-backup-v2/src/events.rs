use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::model::{JobRecord, JobStatus, JobType};

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Emitted when a job is created and when it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub kind: String,
    pub status: JobStatus,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn for_record<T: JobRecord>(record: &T) -> Self {
        Self {
            job_id: record.id(),
            job_type: T::JOB_TYPE,
            kind: record.kind_label(),
            status: record.status(),
            actor: record.actor().to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Audit hook. Delivery is best effort; an error here never changes a job's outcome.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: &JobEvent) -> Result<(), SinkError>;
}

/// Writes every event to the `backup::events` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn notify(&self, event: &JobEvent) -> Result<(), SinkError> {
        info!(
            target: "backup::events",
            job_id = %event.job_id,
            job_type = %event.job_type,
            kind = %event.kind,
            status = %event.status,
            actor = %event.actor,
            "job event"
        );
        Ok(())
    }
}
