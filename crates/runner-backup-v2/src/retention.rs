use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::model::{BackupJob, JobStatus, RetentionClass};
use crate::store::JobStore;

/// Maximum age per retention class. `Permanent` never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default = "default_daily_days")]
    pub daily_days: u32,
    #[serde(default = "default_weekly_days")]
    pub weekly_days: u32,
    #[serde(default = "default_monthly_days")]
    pub monthly_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily_days: default_daily_days(),
            weekly_days: default_weekly_days(),
            monthly_days: default_monthly_days(),
        }
    }
}

impl RetentionPolicy {
    pub fn max_age_days(&self, class: RetentionClass) -> Option<u32> {
        match class {
            RetentionClass::Daily => Some(self.daily_days),
            RetentionClass::Weekly => Some(self.weekly_days),
            RetentionClass::Monthly => Some(self.monthly_days),
            RetentionClass::Permanent => None,
        }
    }

    pub fn max_age(&self, class: RetentionClass) -> Option<Duration> {
        self.max_age_days(class).map(|days| Duration::days(i64::from(days)))
    }

    pub fn is_expired(&self, job: &BackupJob, now: DateTime<Utc>) -> bool {
        if job.status != JobStatus::Success || job.is_retention_exempt() {
            return false;
        }
        let (Some(max_age), Some(completed_at)) = (self.max_age(job.retention_class), job.completed_at)
        else {
            return false;
        };
        now - completed_at > max_age
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub class: Option<RetentionClass>,
    pub examined: usize,
    pub deleted: Vec<Uuid>,
    /// Expired jobs whose archive file was already gone; their records were still removed.
    pub missing_archives: Vec<Uuid>,
    pub errors: Vec<String>,
}

/// Delete every expired successful backup of `class`: archive file first,
/// then the record. A crash in between leaves a record pointing at a missing
/// file, never an archive nobody references.
pub async fn enforce(
    store: &JobStore,
    policy: &RetentionPolicy,
    class: RetentionClass,
    now: DateTime<Utc>,
) -> Result<RetentionReport, EngineError> {
    let mut report = RetentionReport {
        class: Some(class),
        ..Default::default()
    };
    if policy.max_age(class).is_none() {
        return Ok(report);
    }

    let candidates: Vec<BackupJob> = store
        .list(
            |job: &BackupJob| job.retention_class == class && job.status == JobStatus::Success,
            None,
        )
        .await?;
    report.examined = candidates.len();

    for job in candidates.into_iter().filter(|job| policy.is_expired(job, now)) {
        if let Some(path) = job.archive_path.as_ref() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    report.missing_archives.push(job.id);
                }
                Err(err) => {
                    warn!("retention: failed to delete archive {}: {err}", path.display());
                    report
                        .errors
                        .push(format!("{}: failed to delete {}: {err}", job.id, path.display()));
                    continue;
                }
            }
        }

        match store.delete::<BackupJob>(job.id).await {
            Ok(()) => {
                info!("retention: pruned {class} backup {} (completed {:?})", job.id, job.completed_at);
                report.deleted.push(job.id);
            }
            Err(err) => {
                warn!("retention: failed to delete record {}: {err}", job.id);
                report.errors.push(format!("{}: {err}", job.id));
            }
        }
    }

    Ok(report)
}

fn default_daily_days() -> u32 {
    7
}

fn default_weekly_days() -> u32 {
    30
}

fn default_monthly_days() -> u32 {
    90
}
