use std::collections::HashMap;
use std::io;
use std::sync::RwLock;

use bytes::Bytes;

/// Blob store the serving side reads segments from and writes them to.
///
/// The on-disk layout is not the engine's concern; nodes plug in whatever
/// backend they run on. Keys are `(file_id, segment_id)`; `task_id` is
/// passed through for backends that account per task.
pub trait SegmentStore: Send + Sync + 'static {
    /// Fetches a stored segment with its metadata, if present.
    fn get(
        &self,
        task_id: &str,
        file_id: &str,
        segment_id: &str,
    ) -> io::Result<Option<(Bytes, Bytes)>>;

    /// Stores a segment with its metadata.
    fn put(
        &self,
        task_id: &str,
        file_id: &str,
        segment_id: &str,
        content: Bytes,
        metadata: Bytes,
    ) -> io::Result<()>;

    /// Removes a stored segment; absent segments are not an error.
    fn remove(&self, file_id: &str, segment_id: &str) -> io::Result<()>;
}

/// Heap-backed [`SegmentStore`] used by nodes without persistence and by
/// the test suites.
#[derive(Default)]
pub struct MemorySegmentStore {
    segments: RwLock<HashMap<(String, String), (Bytes, Bytes)>>,
}

impl MemorySegmentStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.read().expect("store lock poisoned").len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SegmentStore for MemorySegmentStore {
    fn get(
        &self,
        _task_id: &str,
        file_id: &str,
        segment_id: &str,
    ) -> io::Result<Option<(Bytes, Bytes)>> {
        let segments = self.segments.read().expect("store lock poisoned");
        Ok(segments
            .get(&(file_id.to_owned(), segment_id.to_owned()))
            .cloned())
    }

    fn put(
        &self,
        _task_id: &str,
        file_id: &str,
        segment_id: &str,
        content: Bytes,
        metadata: Bytes,
    ) -> io::Result<()> {
        let mut segments = self.segments.write().expect("store lock poisoned");
        segments.insert(
            (file_id.to_owned(), segment_id.to_owned()),
            (content, metadata),
        );
        Ok(())
    }

    fn remove(&self, file_id: &str, segment_id: &str) -> io::Result<()> {
        let mut segments = self.segments.write().expect("store lock poisoned");
        segments.remove(&(file_id.to_owned(), segment_id.to_owned()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let store = MemorySegmentStore::new();
        store
            .put(
                "task",
                "file",
                "segment",
                Bytes::from_static(b"bytes"),
                Bytes::from_static(b"meta"),
            )
            .expect("memory store never fails");

        let (content, metadata) = store
            .get("other-task", "file", "segment")
            .expect("memory store never fails")
            .expect("present");
        assert_eq!(content, Bytes::from_static(b"bytes"));
        assert_eq!(metadata, Bytes::from_static(b"meta"));
    }

    #[test]
    fn missing_segment_is_none_not_error() {
        let store = MemorySegmentStore::new();
        assert!(store.get("t", "f", "s").expect("no error").is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let store = MemorySegmentStore::new();
        store
            .put("t", "f", "s", Bytes::new(), Bytes::new())
            .expect("stores");
        store.remove("f", "s").expect("removes");
        store.remove("f", "s").expect("still fine");
        assert!(store.is_empty());
    }
}
