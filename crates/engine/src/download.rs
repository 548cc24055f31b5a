use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{FutureExt, StreamExt, stream::FuturesUnordered};
use identity::{DhtId, NodeId};
use pool::{SegmentMeta, SegmentStatus, TaskPool};
use protocol::{Payload, SegmentRequest, SegmentResponse};
use routing::RoutingTable;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;
use crate::dial::Dialer;
use crate::erasure;
use crate::error::{EngineError, EngineResult};
use crate::slice::{FileManifest, reassemble, segment_id};
use crate::upload::pause_gate;

/// Download recovery driver.
///
/// Fetches segments from candidate holders, verifies each against its id,
/// and stops requesting as soon as any `data_segments` distinct segments
/// have arrived; Reed-Solomon reconstruction then rebuilds the original
/// bytes.
pub struct Downloader<D: Dialer> {
    pool: Arc<TaskPool>,
    table: Arc<RoutingTable>,
    dialer: Arc<D>,
    config: DownloadConfig,
}

struct Workspace {
    shards: Mutex<Vec<Option<Vec<u8>>>>,
}

impl<D: Dialer> Downloader<D> {
    /// Driver over the shared pool, routing table and dialer.
    pub fn new(
        pool: Arc<TaskPool>,
        table: Arc<RoutingTable>,
        dialer: Arc<D>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            pool,
            table,
            dialer,
            config,
        }
    }

    /// Recovers the file described by `manifest`.
    ///
    /// `pubkey_hash` is forwarded in every segment request for the serving
    /// side's authorization check.
    pub async fn download(
        &self,
        task_id: &str,
        manifest: &FileManifest,
        pubkey_hash: Bytes,
    ) -> EngineResult<Bytes> {
        let total = manifest.total_segments();
        let required = manifest.data_segments;
        self.pool.add_download(
            task_id,
            &manifest.file_id,
            manifest.segments.clone(),
            required,
        )?;
        info!(
            task_id,
            file_id = %manifest.file_id,
            total,
            required,
            "recovering file"
        );

        let workspace = Arc::new(Workspace {
            shards: Mutex::new(vec![None; total]),
        });
        // Fires once enough segments arrived; outstanding fetches stop.
        let enough = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut workers = JoinSet::new();

        // Data segments are scheduled before parity: if all data arrives,
        // reconstruction is a plain concatenation.
        let mut ordered = manifest.segments.clone();
        ordered.sort_by_key(|meta| (meta.is_parity, meta.index));

        for meta in ordered {
            let pool = Arc::clone(&self.pool);
            let table = Arc::clone(&self.table);
            let dialer = Arc::clone(&self.dialer);
            let semaphore = Arc::clone(&semaphore);
            let workspace = Arc::clone(&workspace);
            let enough = enough.clone();
            let config = self.config.clone();
            let task_id = task_id.to_owned();
            let file_id = manifest.file_id.clone();
            let pubkey_hash = pubkey_hash.clone();

            workers.spawn(async move {
                let permit = tokio::select! {
                    () = enough.cancelled() => return Ok(()),
                    permit = semaphore.acquire_owned() => permit.expect("semaphore never closed"),
                };
                let _permit = permit;
                if enough.is_cancelled() {
                    return Ok(());
                }
                fetch_segment(
                    &pool, &table, &dialer, &config, &task_id, &file_id, &meta, &pubkey_hash,
                    &workspace, &enough,
                )
                .await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(EngineError::Cancelled { task_id })) => {
                    self.pool.delete(&task_id)?;
                    return Err(EngineError::Cancelled { task_id });
                }
                Ok(Err(error)) => {
                    warn!(%error, "segment fetch failed");
                }
                Err(join_error) => {
                    warn!(%join_error, "fetch worker died");
                }
            }
        }

        if self.pool.is_cancelled(task_id)? {
            self.pool.delete(task_id)?;
            return Err(EngineError::Cancelled {
                task_id: task_id.to_owned(),
            });
        }

        let shards = {
            let mut guard = workspace.shards.lock().expect("workspace lock poisoned");
            std::mem::take(&mut *guard)
        };
        let recovered = shards.iter().filter(|shard| shard.is_some()).count();
        if recovered < required {
            return Err(EngineError::DownloadIncomplete {
                recovered,
                required,
            });
        }

        let data_shards = erasure::reconstruct(shards, required, manifest.parity_segments())?;
        // Terminal: the task leaves the pool on completion.
        self.pool.delete(task_id)?;
        info!(task_id, recovered, "recovery complete");
        Ok(reassemble(data_shards, manifest.file_len))
    }
}

/// Candidate holders for a segment: peers already attributed to it first,
/// then table-nearest peers, deduplicated.
fn candidates_for(
    pool: &TaskPool,
    table: &RoutingTable,
    task_id: &str,
    meta: &SegmentMeta,
    replication: usize,
    max_retries: u32,
) -> EngineResult<Vec<(NodeId, std::net::SocketAddr)>> {
    let known: Vec<NodeId> = pool.with_download(task_id, |task| {
        task.segment(&meta.segment_id)
            .map(pool::SegmentState::active_nodes)
            .unwrap_or_default()
    })?;

    let horizon = replication + max_retries as usize;
    let target = DhtId::hash(meta.segment_id.as_bytes());
    let mut out = Vec::new();
    for id in known {
        if let Some(info) = table.find(id) {
            out.push((id, info.addr()));
        }
    }
    for info in table.nearest_peers(&target, horizon, None) {
        if out.iter().all(|(id, _)| *id != info.id()) {
            out.push((info.id(), info.addr()));
        }
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
async fn fetch_segment<D: Dialer>(
    pool: &TaskPool,
    table: &RoutingTable,
    dialer: &D,
    config: &DownloadConfig,
    task_id: &str,
    file_id: &str,
    meta: &SegmentMeta,
    pubkey_hash: &Bytes,
    workspace: &Workspace,
    enough: &CancellationToken,
) -> EngineResult<()> {
    pause_gate(pool, task_id).await?;

    let mut candidates = candidates_for(
        pool,
        table,
        task_id,
        meta,
        config.replication,
        config.max_retries,
    )?
    .into_iter();

    let attempt_for = |peer: NodeId, addr: std::net::SocketAddr| {
        let request = SegmentRequest {
            task_id: task_id.to_owned(),
            file_id: file_id.to_owned(),
            segment_id: meta.segment_id.clone(),
            pubkey_hash: pubkey_hash.clone(),
        };
        let deadline = config.attempt_timeout;
        async move { (peer, attempt_get(dialer, addr, deadline, request).await) }
    };

    // Fan out to up to `replication` holders at once; each candidate is
    // used at most once per segment.
    let mut inflight = FuturesUnordered::new();
    for (peer, addr) in candidates.by_ref().take(config.replication) {
        inflight.push(attempt_for(peer, addr));
    }
    if inflight.is_empty() {
        pool.set_segment_status(task_id, &meta.segment_id, SegmentStatus::Failed)?;
        return Err(EngineError::NoCandidates {
            segment_id: meta.segment_id.clone(),
        });
    }
    pool.set_segment_status(task_id, &meta.segment_id, SegmentStatus::InFlight)?;

    let mut launched = inflight.len() as u32;
    let mut failures: u32 = 0;

    loop {
        let next = tokio::select! {
            () = enough.cancelled() => return Ok(()),
            next = inflight.next() => next,
        };
        let Some((peer, outcome)) = next else { break };

        match outcome {
            // The digest binds file, index and bytes; a holder cannot
            // substitute content.
            Ok(content) if segment_id(file_id, meta.index, &content) == meta.segment_id => {
                {
                    let mut shards = workspace.shards.lock().expect("workspace lock poisoned");
                    shards[meta.index] = Some(content.to_vec());
                }
                pool.update_segment_nodes(task_id, &meta.segment_id, peer, true)?;
                let _ = table.update_last_useful_at(peer, Instant::now());
                if pool.mark_completed(task_id, meta.index)? {
                    debug!(task_id, "recovery threshold reached");
                    enough.cancel();
                }
                // Responses that had already landed attribute extra
                // holders; attempts still in flight are dropped.
                while let Some(Some((other, other_outcome))) = inflight.next().now_or_never() {
                    if let Ok(other_content) = other_outcome {
                        if segment_id(file_id, meta.index, &other_content) == meta.segment_id {
                            pool.update_segment_nodes(task_id, &meta.segment_id, other, true)?;
                            let _ = table.update_last_useful_at(other, Instant::now());
                        }
                    }
                }
                return Ok(());
            }
            other => {
                match other {
                    Ok(_) => {
                        warn!(segment = %meta.segment_id, peer = %peer, "content verification failed");
                    }
                    Err(error) => {
                        warn!(
                            segment = %meta.segment_id,
                            peer = %peer,
                            failures = failures + 1,
                            %error,
                            "fetch attempt failed"
                        );
                    }
                }
                pool.update_segment_nodes(task_id, &meta.segment_id, peer, false)?;
                pool.bump_retries(task_id, &meta.segment_id)?;
                failures += 1;
                // Replace the failed attempt with the next candidate while
                // the retry budget lasts.
                if failures < config.max_retries && !enough.is_cancelled() {
                    pause_gate(pool, task_id).await?;
                    if let Some((peer, addr)) = candidates.next() {
                        launched += 1;
                        inflight.push(attempt_for(peer, addr));
                    }
                }
            }
        }
    }

    if enough.is_cancelled() {
        return Ok(());
    }
    pool.set_segment_status(task_id, &meta.segment_id, SegmentStatus::Failed)?;
    Err(EngineError::SegmentFailed {
        segment_id: meta.segment_id.clone(),
        attempts: launched,
    })
}

async fn attempt_get<D: Dialer>(
    dialer: &D,
    addr: std::net::SocketAddr,
    deadline: Duration,
    request: SegmentRequest,
) -> EngineResult<Bytes> {
    let expected = request.segment_id.clone();
    let exchange = async move {
        let connection = dialer.dial(addr).await?;
        connection.send(&Payload::SegmentRequest(request)).await?;

        loop {
            match connection.recv().await? {
                Payload::SegmentResponse(SegmentResponse::Ok {
                    segment_id,
                    content,
                    ..
                }) if segment_id == expected => return Ok(content),
                Payload::SegmentResponse(SegmentResponse::Err { code, message }) => {
                    return Err(EngineError::Rejected { code, message });
                }
                other => {
                    debug!(?other, "ignoring unrelated payload while awaiting segment");
                }
            }
        }
    };

    tokio::time::timeout(deadline, exchange)
        .await
        .map_err(|_| {
            EngineError::Protocol(protocol::ProtocolError::Timeout {
                operation: "segment fetch",
            })
        })?
}
