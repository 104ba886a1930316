//! Delivery collaborator boundary
//!
//! The finisher's plan points into the job's temporary directory, which is
//! removed as soon as the job ends. A [`DeliverySink`] must therefore consume
//! the files during [`deliver`](DeliverySink::deliver) and hand back handles
//! that stay meaningful afterwards; those handles are what the result cache
//! stores.

use crate::error::{Error, Result};
use crate::types::{ArtifactReference, DeliveryPlan, JobId, ResourceClass, UserId};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Who a plan is delivered for
#[derive(Clone, Debug)]
pub struct DeliveryContext {
    /// Job being delivered
    pub job_id: JobId,
    /// Requesting user
    pub user_id: UserId,
    /// Resource class of the job
    pub resource_class: ResourceClass,
}

/// Receives finished plans
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Take ownership of the plan's files and return one handle per part, in order
    async fn deliver(&self, context: &DeliveryContext, plan: &DeliveryPlan)
    -> Result<ArtifactReference>;

    /// Sink name for logging
    fn name(&self) -> &str;
}

/// Sink that copies parts into `output_dir/<job_id>/`
///
/// Handles are the paths of the copies, relative if `output_dir` is.
pub struct DirectorySink {
    output_dir: PathBuf,
}

impl DirectorySink {
    /// Create a sink writing below `output_dir`
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Root directory of delivered files
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn part_name(job_id: &JobId, source: &Path, index: usize, total: usize) -> String {
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        if total == 1 {
            format!("{}{ext}", job_id.short())
        } else {
            format!("{}-part{}of{total}{ext}", job_id.short(), index + 1)
        }
    }

    async fn copy_parts(
        &self,
        dest: &Path,
        context: &DeliveryContext,
        plan: &DeliveryPlan,
    ) -> Result<Vec<String>> {
        tokio::fs::create_dir_all(dest).await?;
        let mut handles = Vec::with_capacity(plan.len());
        for (index, part) in plan.parts.iter().enumerate() {
            let name = Self::part_name(&context.job_id, &part.path, index, plan.len());
            let target = dest.join(name);
            tokio::fs::copy(&part.path, &target).await?;
            handles.push(target.to_string_lossy().into_owned());
        }
        Ok(handles)
    }
}

#[async_trait]
impl DeliverySink for DirectorySink {
    async fn deliver(
        &self,
        context: &DeliveryContext,
        plan: &DeliveryPlan,
    ) -> Result<ArtifactReference> {
        if plan.is_empty() {
            return Err(Error::Delivery("delivery plan has no parts".into()));
        }

        let dest = self.output_dir.join(context.job_id.as_str());
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dest).await?;
        }

        match self.copy_parts(&dest, context, plan).await {
            Ok(handles) => {
                tracing::info!(
                    job_id = %context.job_id,
                    user_id = %context.user_id,
                    parts = handles.len(),
                    dest = %dest.display(),
                    "delivered"
                );
                Ok(ArtifactReference::new(handles))
            }
            Err(e) => {
                // no half-delivered jobs
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dest).await {
                    tracing::debug!(dest = %dest.display(), error = %cleanup, "failed to remove partial delivery");
                }
                Err(Error::Delivery(e.to_string()))
            }
        }
    }

    fn name(&self) -> &str {
        "directory"
    }
}
