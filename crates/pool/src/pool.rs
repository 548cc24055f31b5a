use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use identity::NodeId;
use tracing::debug;

use crate::download::DownloadTask;
use crate::error::{PoolError, PoolResult};
use crate::segment::{SegmentMeta, SegmentStatus};
use crate::upload::UploadTask;

enum TaskSlot {
    Upload(Arc<Mutex<UploadTask>>),
    Download(Arc<Mutex<DownloadTask>>),
}

/// Process-wide registry of in-flight transfer tasks.
///
/// One outer reader/writer lock guards the task map; each task carries its
/// own inner lock for bitmap and segment updates. Lock order is always
/// outer-then-inner: the outer lock is dropped before an inner lock is
/// taken, so the two can never deadlock against each other.
#[derive(Default)]
pub struct TaskPool {
    tasks: RwLock<HashMap<String, TaskSlot>>,
}

impl TaskPool {
    /// Empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an upload task with its slice table.
    ///
    /// Fails with [`PoolError::DuplicateTask`] when the id is taken by any
    /// task, upload or download.
    pub fn add_upload(
        &self,
        task_id: &str,
        metas: Vec<SegmentMeta>,
        data_segments: usize,
        private_key: Bytes,
        file_metadata: Bytes,
    ) -> PoolResult<()> {
        let task = UploadTask::new(
            task_id.to_owned(),
            metas,
            data_segments,
            private_key,
            file_metadata,
        )?;
        let mut tasks = self.tasks.write().expect("pool lock poisoned");
        if tasks.contains_key(task_id) {
            return Err(PoolError::DuplicateTask(task_id.to_owned()));
        }
        tasks.insert(
            task_id.to_owned(),
            TaskSlot::Upload(Arc::new(Mutex::new(task))),
        );
        debug!(task_id, "registered upload task");
        Ok(())
    }

    /// Registers a download task with its slice table.
    pub fn add_download(
        &self,
        task_id: &str,
        file_id: &str,
        metas: Vec<SegmentMeta>,
        data_segments: usize,
    ) -> PoolResult<()> {
        let task = DownloadTask::new(
            task_id.to_owned(),
            file_id.to_owned(),
            metas,
            data_segments,
        )?;
        let mut tasks = self.tasks.write().expect("pool lock poisoned");
        if tasks.contains_key(task_id) {
            return Err(PoolError::DuplicateTask(task_id.to_owned()));
        }
        tasks.insert(
            task_id.to_owned(),
            TaskSlot::Download(Arc::new(Mutex::new(task))),
        );
        debug!(task_id, file_id, "registered download task");
        Ok(())
    }

    fn upload_handle(&self, task_id: &str) -> PoolResult<Arc<Mutex<UploadTask>>> {
        let tasks = self.tasks.read().expect("pool lock poisoned");
        match tasks.get(task_id) {
            Some(TaskSlot::Upload(handle)) => Ok(Arc::clone(handle)),
            Some(TaskSlot::Download(_)) => Err(PoolError::WrongKind {
                task_id: task_id.to_owned(),
                expected: "upload",
            }),
            None => Err(PoolError::UnknownTask(task_id.to_owned())),
        }
    }

    fn download_handle(&self, task_id: &str) -> PoolResult<Arc<Mutex<DownloadTask>>> {
        let tasks = self.tasks.read().expect("pool lock poisoned");
        match tasks.get(task_id) {
            Some(TaskSlot::Download(handle)) => Ok(Arc::clone(handle)),
            Some(TaskSlot::Upload(_)) => Err(PoolError::WrongKind {
                task_id: task_id.to_owned(),
                expected: "download",
            }),
            None => Err(PoolError::UnknownTask(task_id.to_owned())),
        }
    }

    /// Runs `f` against the upload task under its inner lock.
    pub fn with_upload<R>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut UploadTask) -> R,
    ) -> PoolResult<R> {
        let handle = self.upload_handle(task_id)?;
        let mut task = handle.lock().expect("task lock poisoned");
        Ok(f(&mut task))
    }

    /// Runs `f` against the download task under its inner lock.
    pub fn with_download<R>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut DownloadTask) -> R,
    ) -> PoolResult<R> {
        let handle = self.download_handle(task_id)?;
        let mut task = handle.lock().expect("task lock poisoned");
        Ok(f(&mut task))
    }

    /// Records that `peer` holds (or failed to hold) a segment.
    pub fn update_segment_nodes(
        &self,
        task_id: &str,
        segment_id: &str,
        peer: NodeId,
        active: bool,
    ) -> PoolResult<()> {
        self.for_segment(task_id, segment_id, |segment| {
            segment.set_node(peer, active);
            Ok(())
        })
    }

    /// Applies a status transition to a segment.
    pub fn set_segment_status(
        &self,
        task_id: &str,
        segment_id: &str,
        status: SegmentStatus,
    ) -> PoolResult<()> {
        self.for_segment(task_id, segment_id, |segment| segment.transition(status))
    }

    /// Bumps and returns a segment's retry counter.
    pub fn bump_retries(&self, task_id: &str, segment_id: &str) -> PoolResult<u32> {
        self.for_segment(task_id, segment_id, |segment| Ok(segment.bump_retries()))
    }

    fn for_segment<R>(
        &self,
        task_id: &str,
        segment_id: &str,
        f: impl FnOnce(&mut crate::segment::SegmentState) -> PoolResult<R>,
    ) -> PoolResult<R> {
        let tasks = self.tasks.read().expect("pool lock poisoned");
        let slot = tasks
            .get(task_id)
            .ok_or_else(|| PoolError::UnknownTask(task_id.to_owned()))?;
        match slot {
            TaskSlot::Upload(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                let mut task = handle.lock().expect("task lock poisoned");
                f(task.segment_mut(segment_id)?)
            }
            TaskSlot::Download(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                let mut task = handle.lock().expect("task lock poisoned");
                f(task.segment_mut(segment_id)?)
            }
        }
    }

    /// Sets the progress bit at `index`; returns `true` when the task just
    /// met its completion criterion (all segments for uploads, any
    /// `data_segments` for downloads).
    pub fn mark_completed(&self, task_id: &str, index: usize) -> PoolResult<bool> {
        let tasks = self.tasks.read().expect("pool lock poisoned");
        let slot = tasks
            .get(task_id)
            .ok_or_else(|| PoolError::UnknownTask(task_id.to_owned()))?;
        match slot {
            TaskSlot::Upload(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                let mut task = handle.lock().expect("task lock poisoned");
                task.mark_completed(index)
            }
            TaskSlot::Download(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                let mut task = handle.lock().expect("task lock poisoned");
                task.mark_completed(index)
            }
        }
    }

    /// Segment ids the task still needs; for downloads, parity segments
    /// come last.
    pub fn incomplete_pieces(&self, task_id: &str) -> PoolResult<Vec<String>> {
        let tasks = self.tasks.read().expect("pool lock poisoned");
        let slot = tasks
            .get(task_id)
            .ok_or_else(|| PoolError::UnknownTask(task_id.to_owned()))?;
        match slot {
            TaskSlot::Upload(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                let task = handle.lock().expect("task lock poisoned");
                Ok(task.incomplete_pieces())
            }
            TaskSlot::Download(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                let task = handle.lock().expect("task lock poisoned");
                Ok(task.incomplete_pieces())
            }
        }
    }

    /// Completion fraction in percent (set bits over required bits).
    pub fn progress_percent(&self, task_id: &str) -> PoolResult<f64> {
        let tasks = self.tasks.read().expect("pool lock poisoned");
        let slot = tasks
            .get(task_id)
            .ok_or_else(|| PoolError::UnknownTask(task_id.to_owned()))?;
        match slot {
            TaskSlot::Upload(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                let task = handle.lock().expect("task lock poisoned");
                Ok(task.progress_percent())
            }
            TaskSlot::Download(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                let task = handle.lock().expect("task lock poisoned");
                Ok(task.progress_percent())
            }
        }
    }

    /// Suspends scheduling for the task.
    pub fn pause(&self, task_id: &str) -> PoolResult<()> {
        self.set_paused(task_id, true)
    }

    /// Resumes scheduling for the task.
    pub fn resume(&self, task_id: &str) -> PoolResult<()> {
        self.set_paused(task_id, false)
    }

    fn set_paused(&self, task_id: &str, paused: bool) -> PoolResult<()> {
        let tasks = self.tasks.read().expect("pool lock poisoned");
        let slot = tasks
            .get(task_id)
            .ok_or_else(|| PoolError::UnknownTask(task_id.to_owned()))?;
        match slot {
            TaskSlot::Upload(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                handle.lock().expect("task lock poisoned").set_paused(paused);
            }
            TaskSlot::Download(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                handle
                    .lock()
                    .expect("task lock poisoned")
                    .set_paused(paused);
            }
        }
        Ok(())
    }

    /// Whether the task is paused.
    pub fn is_paused(&self, task_id: &str) -> PoolResult<bool> {
        let tasks = self.tasks.read().expect("pool lock poisoned");
        let slot = tasks
            .get(task_id)
            .ok_or_else(|| PoolError::UnknownTask(task_id.to_owned()))?;
        Ok(match slot {
            TaskSlot::Upload(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                let paused = handle.lock().expect("task lock poisoned").is_paused();
                paused
            }
            TaskSlot::Download(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                let paused = handle.lock().expect("task lock poisoned").is_paused();
                paused
            }
        })
    }

    /// Flags the task as cancelled; drivers observe the flag at their next
    /// scheduling step.
    pub fn cancel(&self, task_id: &str) -> PoolResult<()> {
        let tasks = self.tasks.read().expect("pool lock poisoned");
        let slot = tasks
            .get(task_id)
            .ok_or_else(|| PoolError::UnknownTask(task_id.to_owned()))?;
        match slot {
            TaskSlot::Upload(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                handle.lock().expect("task lock poisoned").set_cancelled();
            }
            TaskSlot::Download(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                handle.lock().expect("task lock poisoned").set_cancelled();
            }
        }
        debug!(task_id, "task cancelled");
        Ok(())
    }

    /// Whether the task was cancelled.
    pub fn is_cancelled(&self, task_id: &str) -> PoolResult<bool> {
        let tasks = self.tasks.read().expect("pool lock poisoned");
        let slot = tasks
            .get(task_id)
            .ok_or_else(|| PoolError::UnknownTask(task_id.to_owned()))?;
        Ok(match slot {
            TaskSlot::Upload(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                let cancelled = handle.lock().expect("task lock poisoned").is_cancelled();
                cancelled
            }
            TaskSlot::Download(handle) => {
                let handle = Arc::clone(handle);
                drop(tasks);
                let cancelled = handle.lock().expect("task lock poisoned").is_cancelled();
                cancelled
            }
        })
    }

    /// Removes a task from the registry.
    pub fn delete(&self, task_id: &str) -> PoolResult<()> {
        let mut tasks = self.tasks.write().expect("pool lock poisoned");
        tasks
            .remove(task_id)
            .map(|_| ())
            .ok_or_else(|| PoolError::UnknownTask(task_id.to_owned()))
    }

    /// Whether any task with this id exists.
    #[must_use]
    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks
            .read()
            .expect("pool lock poisoned")
            .contains_key(task_id)
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.read().expect("pool lock poisoned").len()
    }

    /// Whether the pool holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metas(data: usize, parity: usize) -> Vec<SegmentMeta> {
        (0..data + parity)
            .map(|index| SegmentMeta {
                segment_id: format!("segment-{index}"),
                index,
                is_parity: index >= data,
            })
            .collect()
    }

    fn pool_with_both() -> TaskPool {
        let pool = TaskPool::new();
        pool.add_upload("up", metas(4, 2), 4, Bytes::new(), Bytes::new())
            .expect("fresh id");
        pool.add_download("down", "file-1", metas(4, 2), 4)
            .expect("fresh id");
        pool
    }

    #[test]
    fn duplicate_ids_are_rejected_across_kinds() {
        let pool = pool_with_both();
        assert!(matches!(
            pool.add_upload("down", metas(2, 1), 2, Bytes::new(), Bytes::new()),
            Err(PoolError::DuplicateTask(_))
        ));
        assert!(matches!(
            pool.add_download("up", "f", metas(2, 1), 2),
            Err(PoolError::DuplicateTask(_))
        ));
    }

    #[test]
    fn upload_completes_only_when_all_bits_set() {
        let pool = pool_with_both();
        for index in 0..5 {
            assert!(!pool.mark_completed("up", index).expect("in range"));
        }
        assert!(pool.mark_completed("up", 5).expect("in range"));
    }

    #[test]
    fn download_completes_at_data_count() {
        let pool = pool_with_both();
        assert!(!pool.mark_completed("down", 0).expect("in range"));
        assert!(!pool.mark_completed("down", 4).expect("in range"));
        assert!(!pool.mark_completed("down", 5).expect("in range"));
        assert!(pool.mark_completed("down", 2).expect("in range"));
    }

    #[test]
    fn progress_tracks_required_bits() {
        let pool = pool_with_both();
        pool.mark_completed("down", 0).expect("in range");
        pool.mark_completed("down", 1).expect("in range");
        let percent = pool.progress_percent("down").expect("known task");
        assert!((percent - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn node_attribution_round_trips() {
        let pool = pool_with_both();
        let peer = NodeId::from_bytes([3u8; 32]);
        pool.update_segment_nodes("up", "segment-0", peer, true)
            .expect("known segment");

        let holders = pool
            .with_upload("up", |task| {
                task.segment("segment-0").expect("present").active_nodes()
            })
            .expect("known task");
        assert_eq!(holders, vec![peer]);
    }

    #[test]
    fn pause_resume_cancel_flags() {
        let pool = pool_with_both();
        assert!(!pool.is_paused("up").expect("known"));
        pool.pause("up").expect("known");
        assert!(pool.is_paused("up").expect("known"));
        pool.resume("up").expect("known");
        assert!(!pool.is_paused("up").expect("known"));

        assert!(!pool.is_cancelled("down").expect("known"));
        pool.cancel("down").expect("known");
        assert!(pool.is_cancelled("down").expect("known"));
    }

    #[test]
    fn delete_forgets_the_task() {
        let pool = pool_with_both();
        pool.delete("up").expect("present");
        assert!(!pool.contains("up"));
        assert!(matches!(
            pool.mark_completed("up", 0),
            Err(PoolError::UnknownTask(_))
        ));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let pool = pool_with_both();
        assert!(matches!(
            pool.with_upload("down", |_| ()),
            Err(PoolError::WrongKind { .. })
        ));
        assert!(matches!(
            pool.with_download("up", |_| ()),
            Err(PoolError::WrongKind { .. })
        ));
    }

    #[test]
    fn incomplete_pieces_orders_parity_last_for_downloads() {
        let pool = pool_with_both();
        pool.mark_completed("down", 0).expect("in range");
        let pieces = pool.incomplete_pieces("down").expect("known");
        assert_eq!(
            pieces,
            vec!["segment-1", "segment-2", "segment-3", "segment-4", "segment-5"]
        );

        let upload_pieces = pool.incomplete_pieces("up").expect("known");
        assert_eq!(upload_pieces.len(), 6);
    }

    #[test]
    fn retry_counter_accumulates() {
        let pool = pool_with_both();
        assert_eq!(pool.bump_retries("up", "segment-2").expect("known"), 1);
        assert_eq!(pool.bump_retries("up", "segment-2").expect("known"), 2);
    }
}
