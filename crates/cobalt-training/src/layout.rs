use crate::error::TrainingResult;
use crate::job::JobId;
use std::path::{Path, PathBuf};

const BLOB_EXTENSION: &str = "ckpt";
const META_EXTENSION: &str = "meta.json";

/// Filesystem layout for checkpoint containers.
///
/// Default layout is `<root>/<job_id>/checkpoints/ckpt-<seq>-e<epoch>-s<step>.ckpt`
/// with a `.meta.json` sidecar next to each blob.
#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    root: PathBuf,
}

impl CheckpointLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Layout rooted at `.cobalt/checkpoints` inside a working directory.
    #[must_use]
    pub fn for_workspace_root(workspace_root: &Path) -> Self {
        Self::new(workspace_root.join(".cobalt").join("checkpoints"))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.as_str())
    }

    #[must_use]
    pub fn checkpoints_dir(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join("checkpoints")
    }

    #[must_use]
    pub fn blob_path(&self, job_id: &JobId, sequence: u64, epoch: u32, step: u64) -> PathBuf {
        self.checkpoints_dir(job_id)
            .join(format!("ckpt-{sequence:06}-e{epoch}-s{step}.{BLOB_EXTENSION}"))
    }

    /// Sidecar metadata path for a blob path.
    #[must_use]
    pub fn meta_path_for(blob_path: &Path) -> PathBuf {
        blob_path.with_extension(META_EXTENSION)
    }

    #[must_use]
    pub fn is_meta_file(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(&format!(".{META_EXTENSION}")))
    }

    pub fn ensure_job_dirs(&self, job_id: &JobId) -> TrainingResult<()> {
        std::fs::create_dir_all(self.checkpoints_dir(job_id))?;
        Ok(())
    }
}
