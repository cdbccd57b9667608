//! Durable checkpoint storage.
//!
//! Each job owns one container directory (see [`CheckpointLayout`]). A
//! checkpoint is a blob plus a sidecar metadata record; the metadata is only
//! written once the blob is fully on disk, so a metadata record never points at
//! a partial blob. Older checkpoints beyond the retention limit are pruned
//! after every successful save.

use crate::cache::{CacheStats, StateCache};
use crate::error::{TrainingError, TrainingResult};
use crate::job::JobId;
use crate::layout::CheckpointLayout;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_RETENTION: usize = 5;

/// Execution state persisted in a checkpoint blob.
///
/// The payload is opaque to the orchestrator; only the trainer interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub job_id: JobId,
    pub epoch: u32,
    pub step: u64,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
}

impl CheckpointState {
    #[must_use]
    pub fn new(job_id: JobId, epoch: u32, step: u64, payload: Vec<u8>) -> Self {
        Self { job_id, epoch, step, payload }
    }
}

mod payload_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Sidecar metadata describing one checkpoint blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub job_id: JobId,
    pub epoch: u32,
    pub step: u64,
    /// Monotonic per-job counter; higher is more recent.
    pub sequence: u64,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint persistence bound to a single job's container.
///
/// Handed to trainers so they can only write their own job's checkpoints.
pub trait CheckpointWriter: Send + Sync {
    fn save(&self, epoch: u32, step: u64, payload: &[u8]) -> TrainingResult<CheckpointMeta>;
}

#[derive(Debug)]
pub struct CheckpointStore {
    layout: CheckpointLayout,
    retention: usize,
    cache: StateCache,
    save_lock: Mutex<()>,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(layout: CheckpointLayout, retention: usize, cache: StateCache) -> Self {
        Self { layout, retention: retention.max(1), cache, save_lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn with_defaults(root: PathBuf) -> Self {
        Self::new(CheckpointLayout::new(root), DEFAULT_RETENTION, StateCache::new(8))
    }

    #[must_use]
    pub fn layout(&self) -> &CheckpointLayout {
        &self.layout
    }

    #[must_use]
    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Returns a writer restricted to `job_id`'s container.
    #[must_use]
    pub fn writer(self: &Arc<Self>, job_id: JobId) -> JobCheckpointWriter {
        JobCheckpointWriter { store: Arc::clone(self), job_id }
    }

    /// Persists a checkpoint and prunes older ones beyond the retention limit.
    pub fn save(
        &self,
        job_id: &JobId,
        epoch: u32,
        step: u64,
        payload: &[u8],
    ) -> TrainingResult<CheckpointMeta> {
        let _guard = self.save_lock.lock();
        self.layout.ensure_job_dirs(job_id)?;

        let sequence = self.list(job_id)?.last().map_or(1, |m| m.sequence + 1);
        let blob_path = self.layout.blob_path(job_id, sequence, epoch, step);
        let state = CheckpointState::new(job_id.clone(), epoch, step, payload.to_vec());
        let bytes = serde_json::to_vec(&state)?;
        write_atomic(&blob_path, &bytes)?;

        let meta = CheckpointMeta {
            job_id: job_id.clone(),
            epoch,
            step,
            sequence,
            path: blob_path.clone(),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };
        let meta_path = CheckpointLayout::meta_path_for(&blob_path);
        let meta_written = serde_json::to_vec_pretty(&meta)
            .map_err(TrainingError::from)
            .and_then(|meta_bytes| write_atomic(&meta_path, &meta_bytes));
        if let Err(e) = meta_written {
            // Without metadata the blob is unreachable; do not leave it behind.
            let _ = std::fs::remove_file(&blob_path);
            return Err(TrainingError::Checkpoint(format!(
                "failed to write checkpoint metadata for job {job_id}: {e}"
            )));
        }

        info!(job_id = %job_id, epoch, step, sequence, size = meta.size_bytes, "Checkpoint saved");
        self.prune(job_id);
        Ok(meta)
    }

    /// Lists a job's checkpoints, oldest first.
    pub fn list(&self, job_id: &JobId) -> TrainingResult<Vec<CheckpointMeta>> {
        let dir = self.layout.checkpoints_dir(job_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut metas = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !CheckpointLayout::is_meta_file(&path) {
                continue;
            }
            match read_meta(&path) {
                Ok(meta) => metas.push(meta),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint metadata"),
            }
        }
        metas.sort_by_key(|m| m.sequence);
        Ok(metas)
    }

    /// Loads a checkpoint state.
    ///
    /// With an explicit `path`, only that blob is considered. Without one, the
    /// most recent checkpoint that passes verification is returned. `None`
    /// means nothing usable exists.
    pub fn load(&self, job_id: &JobId, path: Option<&Path>) -> Option<Arc<CheckpointState>> {
        if let Some(path) = path {
            return self.load_verified(job_id, path);
        }

        let metas = match self.list(job_id) {
            Ok(metas) => metas,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to list checkpoints");
                return None;
            }
        };
        for meta in metas.iter().rev() {
            if let Some(state) = self.load_verified(job_id, &meta.path) {
                return Some(state);
            }
            warn!(job_id = %job_id, path = %meta.path.display(), "Skipping checkpoint that failed verification");
        }
        None
    }

    /// Metadata of the newest checkpoint that passes verification.
    pub fn latest_valid(&self, job_id: &JobId) -> Option<CheckpointMeta> {
        let metas = self.list(job_id).ok()?;
        metas.into_iter().rev().find(|meta| self.verify_integrity(&meta.path))
    }

    /// Checks that a blob is non-empty and decodes with every required field.
    /// Never fails; any problem yields `false`.
    #[must_use]
    pub fn verify_integrity(&self, path: &Path) -> bool {
        read_state(path).is_ok()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Releases all cached states. Returns how many entries were dropped.
    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    fn load_verified(&self, job_id: &JobId, path: &Path) -> Option<Arc<CheckpointState>> {
        // a blob rewritten or truncated since caching no longer matches its recorded size
        let on_disk_len = std::fs::metadata(path).map_or(0, |m| m.len());
        if let Some(state) = self.cache.get(path, on_disk_len) {
            if state.job_id == *job_id {
                return Some(state);
            }
        }

        match read_state(path) {
            Ok((state, size_bytes)) if state.job_id == *job_id => {
                let state = Arc::new(state);
                self.cache.insert(path.to_path_buf(), Arc::clone(&state), size_bytes);
                Some(state)
            }
            Ok((state, _)) => {
                warn!(job_id = %job_id, owner = %state.job_id, path = %path.display(), "Checkpoint belongs to another job");
                None
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Checkpoint failed verification");
                None
            }
        }
    }

    /// Deletes checkpoints beyond the retention limit. Failures are logged.
    fn prune(&self, job_id: &JobId) -> usize {
        let metas = match self.list(job_id) {
            Ok(metas) => metas,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to list checkpoints for pruning");
                return 0;
            }
        };
        if metas.len() <= self.retention {
            return 0;
        }

        let excess = metas.len() - self.retention;
        let mut deleted = 0;
        for meta in metas.into_iter().take(excess) {
            self.cache.remove(&meta.path);
            let meta_path = CheckpointLayout::meta_path_for(&meta.path);
            if let Err(e) = std::fs::remove_file(&meta_path) {
                warn!(path = %meta_path.display(), error = %e, "Failed to delete checkpoint metadata");
                continue;
            }
            if let Err(e) = std::fs::remove_file(&meta.path) {
                warn!(path = %meta.path.display(), error = %e, "Failed to delete checkpoint blob");
            }
            deleted += 1;
        }
        debug!(job_id = %job_id, deleted, "Pruned old checkpoints");
        deleted
    }
}

/// [`CheckpointWriter`] bound to one job.
#[derive(Debug, Clone)]
pub struct JobCheckpointWriter {
    store: Arc<CheckpointStore>,
    job_id: JobId,
}

impl CheckpointWriter for JobCheckpointWriter {
    fn save(&self, epoch: u32, step: u64, payload: &[u8]) -> TrainingResult<CheckpointMeta> {
        self.store.save(&self.job_id, epoch, step, payload)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> TrainingResult<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn read_meta(path: &Path) -> TrainingResult<CheckpointMeta> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Decodes a blob, returning the state and the number of bytes read.
fn read_state(path: &Path) -> TrainingResult<(CheckpointState, u64)> {
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Err(TrainingError::Checkpoint(format!("empty checkpoint: {}", path.display())));
    }
    Ok((serde_json::from_slice(&bytes)?, bytes.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> CheckpointStore {
        CheckpointStore::with_defaults(temp.path().to_path_buf())
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let job = JobId::from("job-1");
        let blob = b"weights and optimizer state".to_vec();

        let meta = store.save(&job, 2, 400, &blob).unwrap();
        assert_eq!(meta.sequence, 1);
        assert!(meta.path.exists());
        assert!(CheckpointLayout::meta_path_for(&meta.path).exists());

        let state = store.load(&job, None).unwrap();
        assert_eq!(state.payload, blob);
        assert_eq!((state.epoch, state.step), (2, 400));
    }

    #[test]
    fn test_load_skips_truncated_checkpoint() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let job = JobId::from("job-1");

        store.save(&job, 1, 100, b"older").unwrap();
        let newest = store.save(&job, 2, 200, b"newer").unwrap();
        // warm the cache before corrupting the blob
        assert_eq!(store.load(&job, None).unwrap().payload, b"newer");

        std::fs::write(&newest.path, b"").unwrap();
        assert!(!store.verify_integrity(&newest.path));

        let state = store.load(&job, None).unwrap();
        assert_eq!(state.payload, b"older");
        assert_eq!(store.latest_valid(&job).unwrap().step, 100);
    }

    #[test]
    fn test_repeated_load_is_served_from_cache() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let job = JobId::from("job-1");
        let meta = store.save(&job, 0, 1, b"first").unwrap();

        store.load(&job, Some(&meta.path)).unwrap();
        store.load(&job, Some(&meta.path)).unwrap();
        let stats = store.cache_stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));

        let rewritten = CheckpointState::new(job.clone(), 0, 1, b"rewritten payload".to_vec());
        std::fs::write(&meta.path, serde_json::to_vec(&rewritten).unwrap()).unwrap();
        assert_eq!(store.load(&job, Some(&meta.path)).unwrap().payload, b"rewritten payload");
        assert_eq!(store.cache_stats().misses, 2);
    }

    #[test]
    fn test_load_returns_none_without_valid_checkpoints() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let job = JobId::from("job-1");
        assert!(store.load(&job, None).is_none());

        let meta = store.save(&job, 0, 1, b"x").unwrap();
        std::fs::write(&meta.path, b"{\"job_id\":\"job-1\",\"epoch\":0}").unwrap();
        assert!(store.load(&job, None).is_none());
        assert!(store.latest_valid(&job).is_none());
    }

    #[test]
    fn test_verify_rejects_missing_fields_and_garbage() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let path = temp.path().join("garbage.ckpt");
        std::fs::write(&path, b"not json").unwrap();
        assert!(!store.verify_integrity(&path));
        assert!(!store.verify_integrity(&temp.path().join("missing.ckpt")));
    }

    #[test]
    fn test_retention_keeps_most_recent() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let job = JobId::from("job-1");
        for step in 0..7 {
            store.save(&job, 0, step, format!("state-{step}").as_bytes()).unwrap();
        }

        let metas = store.list(&job).unwrap();
        assert_eq!(metas.len(), 5);
        assert_eq!(metas.first().unwrap().step, 2);
        assert_eq!(metas.last().unwrap().step, 6);

        let blobs = std::fs::read_dir(store.layout().checkpoints_dir(&job))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| !CheckpointLayout::is_meta_file(&e.path()))
            .count();
        assert_eq!(blobs, 5);
    }

    #[test]
    fn test_explicit_path_must_belong_to_job() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let meta = store.save(&JobId::from("a"), 0, 1, b"a").unwrap();
        assert!(store.load(&JobId::from("b"), Some(&meta.path)).is_none());
        assert!(store.load(&JobId::from("a"), Some(&meta.path)).is_some());
    }

    #[test]
    fn test_writer_is_bound_to_job() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(store(&temp));
        let writer = store.writer(JobId::from("bound"));
        let meta = writer.save(3, 30, b"payload").unwrap();
        assert_eq!(meta.job_id, JobId::from("bound"));
        assert_eq!(store.list(&JobId::from("bound")).unwrap().len(), 1);
    }
}
