//! Resumable upload of one image to one destination object.

use std::sync::Arc;

use pagesync_transfer::{ImageSource, RangeSet};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::UploadError;
use crate::metadata::{ImageMetadata, compare_metadata};
use crate::orchestrator::{UploadContext, UploadOrchestrator};
use crate::storage::{PageStorage, list_all_ranges};
use crate::types::{SessionResult, UploadEvent, UploadOptions};

/// How a session starts against the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStart {
    /// The object was (re)created; every non-empty range is sent.
    Fresh,
    /// A compatible partial upload exists; these ranges are already present.
    Resume(RangeSet),
}

/// Drives the full create-or-resume flow for an image.
pub struct ImageUploader {
    storage: Arc<dyn PageStorage>,
    orchestrator: UploadOrchestrator,
    overwrite: bool,
}

impl ImageUploader {
    pub fn new(storage: Arc<dyn PageStorage>, options: UploadOptions) -> Self {
        Self {
            storage,
            orchestrator: UploadOrchestrator::new(options),
            overwrite: false,
        }
    }

    /// Replace an existing destination object instead of resuming it.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Takes the session event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.orchestrator.take_events()
    }

    /// Validates the destination against `local` and decides how to start.
    ///
    /// Creates the object when it is missing or when overwriting.
    pub async fn prepare(&self, local: &ImageMetadata) -> Result<SessionStart, UploadError> {
        let existing = if self.overwrite {
            None
        } else {
            self.storage.properties().await?
        };
        if let Some(props) = existing {
            if props.content_hash.is_some() {
                return Err(UploadError::AlreadyUploaded);
            }
            let remote = ImageMetadata::from_object_metadata(&props.metadata)?
                .ok_or(UploadError::MissingResumeMetadata)?;
            let mismatches = compare_metadata(&remote, local);
            if !mismatches.is_empty() {
                return Err(UploadError::Precheck(mismatches));
            }
            let existing = list_all_ranges(self.storage.as_ref()).await?;
            info!(
                ranges = existing.len(),
                bytes = existing.total_length(),
                "resuming upload"
            );
            return Ok(SessionStart::Resume(existing));
        }

        info!(size = local.size, overwrite = self.overwrite, "creating destination object");
        self.storage
            .create_object(local.size, local.to_object_metadata()?)
            .await?;
        Ok(SessionStart::Fresh)
    }

    /// Uploads `source` and records its content hash once every range landed.
    ///
    /// Returns [`UploadError::Incomplete`] when some ranges failed; running
    /// `sync` again resumes with only the missing ranges.
    pub async fn sync<S: ImageSource>(
        &self,
        source: S,
        local: &ImageMetadata,
    ) -> Result<SessionResult, UploadError> {
        let (skip, resume) = match self.prepare(local).await? {
            SessionStart::Fresh => (RangeSet::new(), false),
            SessionStart::Resume(existing) => (existing, true),
        };

        let result = self
            .orchestrator
            .upload(UploadContext {
                source,
                skip,
                storage: Arc::clone(&self.storage),
                parallelism: None,
                resume,
            })
            .await?
            .into_result()
            .inspect_err(|e| warn!(error = %e, "upload did not finish"))?;

        self.storage
            .set_content_hash(local.content_hash.clone())
            .await?;
        info!(hash = %local.content_hash, "content hash recorded");
        Ok(result)
    }
}
