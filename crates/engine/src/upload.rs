use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{FutureExt, StreamExt, stream::FuturesUnordered};
use identity::{DhtId, Mode};
use pool::{SegmentMeta, SegmentStatus, TaskPool};
use protocol::{Payload, PutAck, PutSegment};
use routing::{PeerInfo, RoutingTable};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::UploadConfig;
use crate::dial::Dialer;
use crate::erasure;
use crate::error::{EngineError, EngineResult};
use crate::slice::{FileManifest, build_slice_table, split_padded};

/// How often a paused task re-checks its flags.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Upload dispersal driver.
///
/// Splits a file into erasure-coded segments and places each one on a peer
/// chosen by XOR proximity to the segment id. Placement runs under a
/// bounded amount of in-flight segments; within a segment, up to
/// `replication` candidates are attempted simultaneously, each peer seeing
/// at most one request for the segment. The first acknowledgement
/// completes the segment and any attempt that had already succeeded is
/// kept as a redundant holder.
pub struct Uploader<D: Dialer> {
    pool: Arc<TaskPool>,
    table: Arc<RoutingTable>,
    dialer: Arc<D>,
    config: UploadConfig,
}

impl<D: Dialer> Uploader<D> {
    /// Driver over the shared pool, routing table and dialer.
    pub fn new(
        pool: Arc<TaskPool>,
        table: Arc<RoutingTable>,
        dialer: Arc<D>,
        config: UploadConfig,
    ) -> Self {
        Self {
            pool,
            table,
            dialer,
            config,
        }
    }

    /// Disperses `data` as `file_id`, returning the manifest a downloader
    /// needs to recover it.
    ///
    /// Completion requires every segment, parity included, to be
    /// acknowledged by at least one peer.
    pub async fn upload(
        &self,
        task_id: &str,
        file_id: &str,
        data: &[u8],
        private_key: Bytes,
        file_metadata: Bytes,
    ) -> EngineResult<FileManifest> {
        if data.is_empty() {
            return Err(EngineError::InvalidConfig(
                "cannot disperse an empty file".into(),
            ));
        }

        // Stage 1+2: chunk and erasure-code.
        let data_shards = split_padded(data, self.config.segment_size);
        let data_segments = data_shards.len();
        let parity_segments = self.config.validate(data_segments)?;
        let shards = erasure::encode(data_shards, parity_segments)?;

        // Stage 3: per-segment metadata.
        let metas = build_slice_table(file_id, &shards, data_segments);
        let manifest = FileManifest {
            file_id: file_id.to_owned(),
            file_len: data.len() as u64,
            segment_size: self.config.segment_size,
            data_segments,
            segments: metas.clone(),
        };
        self.pool.add_upload(
            task_id,
            metas.clone(),
            data_segments,
            private_key,
            file_metadata,
        )?;
        info!(
            task_id,
            file_id,
            data_segments,
            parity_segments,
            "dispersing file"
        );

        // Stage 4+5: schedule placements, bounded by the concurrency cap.
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut workers = JoinSet::new();
        for (meta, content) in metas.into_iter().zip(shards.into_iter()) {
            let pool = Arc::clone(&self.pool);
            let table = Arc::clone(&self.table);
            let dialer = Arc::clone(&self.dialer);
            let semaphore = Arc::clone(&semaphore);
            let config = self.config.clone();
            let task_id = task_id.to_owned();
            let file_id = file_id.to_owned();

            workers.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                place_segment(&pool, &table, &dialer, &config, &task_id, &file_id, meta, content)
                    .await
            });
        }

        let mut first_failure = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(%error, "segment placement failed");
                    first_failure.get_or_insert(error);
                }
                Err(join_error) => {
                    warn!(%join_error, "placement worker died");
                }
            }
        }

        if self.pool.is_cancelled(task_id)? {
            self.pool.delete(task_id)?;
            return Err(EngineError::Cancelled {
                task_id: task_id.to_owned(),
            });
        }

        let (complete, unplaced, total) = self.pool.with_upload(task_id, |task| {
            (
                task.is_complete(),
                task.incomplete_pieces().len(),
                task.total_segments(),
            )
        })?;
        if complete {
            // Terminal: the task leaves the pool on completion.
            self.pool.delete(task_id)?;
            info!(task_id, file_id, total, "dispersal complete");
            Ok(manifest)
        } else {
            if let Some(error) = first_failure {
                debug!(%error, "reporting dispersal failure");
            }
            Err(EngineError::UploadIncomplete {
                failed: unplaced,
                total,
            })
        }
    }
}

/// Waits out pauses; errors when the task is cancelled.
pub(crate) async fn pause_gate(pool: &TaskPool, task_id: &str) -> EngineResult<()> {
    loop {
        if pool.is_cancelled(task_id)? {
            return Err(EngineError::Cancelled {
                task_id: task_id.to_owned(),
            });
        }
        if !pool.is_paused(task_id)? {
            return Ok(());
        }
        tokio::time::sleep(PAUSE_POLL).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn place_segment<D: Dialer>(
    pool: &TaskPool,
    table: &RoutingTable,
    dialer: &D,
    config: &UploadConfig,
    task_id: &str,
    file_id: &str,
    meta: SegmentMeta,
    content: Vec<u8>,
) -> EngineResult<()> {
    pause_gate(pool, task_id).await?;

    let target = DhtId::hash(meta.segment_id.as_bytes());
    let horizon = config.replication + config.max_retries as usize;
    let mut candidates = table
        .nearest_peers(&target, horizon, Some(Mode::Server))
        .into_iter();

    let content = Bytes::from(content);
    let attempt_for = |peer: PeerInfo| {
        let put = PutSegment {
            task_id: task_id.to_owned(),
            file_id: file_id.to_owned(),
            segment_id: meta.segment_id.clone(),
            content: content.clone(),
            metadata: Bytes::new(),
        };
        let deadline = config.attempt_timeout;
        let addr = peer.addr();
        async move { (peer, attempt_put(dialer, addr, deadline, put).await) }
    };

    // Fan out to up to `replication` peers at once; each candidate is used
    // at most once per segment, so no peer ever sees two concurrent
    // requests for it.
    let mut inflight = FuturesUnordered::new();
    for peer in candidates.by_ref().take(config.replication) {
        inflight.push(attempt_for(peer));
    }
    if inflight.is_empty() {
        pool.set_segment_status(task_id, &meta.segment_id, SegmentStatus::Failed)?;
        return Err(EngineError::NoCandidates {
            segment_id: meta.segment_id,
        });
    }
    pool.set_segment_status(task_id, &meta.segment_id, SegmentStatus::InFlight)?;

    let mut launched = inflight.len() as u32;
    let mut failures: u32 = 0;
    let mut placed = false;

    while let Some((peer, outcome)) = inflight.next().await {
        match outcome {
            Ok(()) => {
                pool.update_segment_nodes(task_id, &meta.segment_id, peer.id(), true)?;
                let _ = table.update_last_successful_outbound_at(peer.id(), Instant::now());
                pool.mark_completed(task_id, meta.index)?;
                debug!(
                    segment = %meta.segment_id,
                    holder = %peer.id(),
                    attempts = launched,
                    "segment placed"
                );
                placed = true;
                break;
            }
            Err(error) => {
                warn!(
                    segment = %meta.segment_id,
                    peer = %peer.id(),
                    failures = failures + 1,
                    %error,
                    "placement attempt failed"
                );
                pool.update_segment_nodes(task_id, &meta.segment_id, peer.id(), false)?;
                pool.bump_retries(task_id, &meta.segment_id)?;
                failures += 1;
                // Replace the failed attempt with the next-nearest
                // candidate while the retry budget lasts.
                if failures < config.max_retries {
                    pause_gate(pool, task_id).await?;
                    if let Some(peer) = candidates.next() {
                        launched += 1;
                        inflight.push(attempt_for(peer));
                    }
                }
            }
        }
    }

    if placed {
        // Acknowledgements that had already landed when the first one was
        // processed are redundant holders; attempts still in flight are
        // dropped.
        while let Some(Some((peer, outcome))) = inflight.next().now_or_never() {
            if outcome.is_ok() {
                pool.update_segment_nodes(task_id, &meta.segment_id, peer.id(), true)?;
                let _ = table.update_last_successful_outbound_at(peer.id(), Instant::now());
                debug!(
                    segment = %meta.segment_id,
                    holder = %peer.id(),
                    "redundant holder recorded"
                );
            }
        }
        return Ok(());
    }

    pool.set_segment_status(task_id, &meta.segment_id, SegmentStatus::Failed)?;
    Err(EngineError::SegmentFailed {
        segment_id: meta.segment_id,
        attempts: launched,
    })
}

async fn attempt_put<D: Dialer>(
    dialer: &D,
    addr: std::net::SocketAddr,
    deadline: Duration,
    put: PutSegment,
) -> EngineResult<()> {
    let exchange = async {
        let connection = dialer.dial(addr).await?;
        let expected = put.segment_id.clone();
        connection.send(&Payload::PutSegment(put)).await?;

        loop {
            match connection.recv().await? {
                Payload::PutAck(PutAck::Ok { segment_id }) if segment_id == expected => {
                    return Ok(());
                }
                Payload::PutAck(PutAck::Err { code, message, .. }) => {
                    return Err(EngineError::Rejected { code, message });
                }
                other => {
                    debug!(?other, "ignoring unrelated payload while awaiting ack");
                }
            }
        }
    };

    tokio::time::timeout(deadline, exchange)
        .await
        .map_err(|_| {
            EngineError::Protocol(protocol::ProtocolError::Timeout {
                operation: "segment placement",
            })
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_poll_is_sub_second() {
        // The scheduling step must notice pause/cancel promptly.
        assert!(PAUSE_POLL < Duration::from_secs(1));
    }
}
