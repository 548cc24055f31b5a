use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{
    Connection, ConnectionConfig, Payload, PutAck, PutSegment, SegmentErrorCode, SegmentRequest,
    SegmentResponse,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Authorizer;
use crate::error::EngineResult;
use crate::store::SegmentStore;

/// Server half of the transfer engine: answers `PutSegment` and
/// `SegmentRequest` messages against the local blob store.
///
/// Authorization happens per request, not per connection: the requester's
/// public-key hash rides in each `SegmentRequest` and is checked against
/// the file's access list before any bytes leave the store.
pub struct SegmentService {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl SegmentService {
    /// Binds `addr` and starts serving until [`shutdown`](Self::shutdown).
    pub async fn bind<S: SegmentStore, A: Authorizer>(
        addr: SocketAddr,
        store: Arc<S>,
        authorizer: Arc<A>,
        config: ConnectionConfig,
    ) -> EngineResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            info!(%local_addr, "segment service listening");
            loop {
                let stream = tokio::select! {
                    () = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "inbound connection");
                            stream
                        }
                        Err(error) => {
                            warn!(%error, "accept failed");
                            continue;
                        }
                    },
                };
                tokio::spawn(handle_connection(
                    stream,
                    config.clone(),
                    Arc::clone(&store),
                    Arc::clone(&authorizer),
                    accept_cancel.clone(),
                ));
            }
        });

        Ok(Self { local_addr, cancel })
    }

    /// Address the service is listening on.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and tears down connection handlers.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SegmentService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_connection<S: SegmentStore, A: Authorizer>(
    stream: tokio::net::TcpStream,
    config: ConnectionConfig,
    store: Arc<S>,
    authorizer: Arc<A>,
    cancel: CancellationToken,
) {
    let connection = match Connection::accept(stream, config).await {
        Ok(connection) => connection,
        Err(error) => {
            warn!(%error, "inbound handshake failed");
            return;
        }
    };

    loop {
        let payload = tokio::select! {
            () = cancel.cancelled() => break,
            received = connection.recv() => match received {
                Ok(payload) => payload,
                Err(_) => break,
            },
        };

        let reply = match payload {
            Payload::PutSegment(put) => Payload::PutAck(handle_put(store.as_ref(), put)),
            Payload::SegmentRequest(request) => Payload::SegmentResponse(handle_get(
                store.as_ref(),
                authorizer.as_ref(),
                &request,
            )),
            other => {
                warn!(?other, "unexpected payload on serving connection");
                continue;
            }
        };

        if let Err(error) = connection.send(&reply).await {
            warn!(%error, "failed to answer request");
            break;
        }
    }
}

fn handle_put<S: SegmentStore>(store: &S, put: PutSegment) -> PutAck {
    let PutSegment {
        task_id,
        file_id,
        segment_id,
        content,
        metadata,
    } = put;

    match store.put(&task_id, &file_id, &segment_id, content, metadata) {
        Ok(()) => {
            debug!(%file_id, %segment_id, "stored segment");
            PutAck::Ok { segment_id }
        }
        Err(error) => {
            warn!(%file_id, %segment_id, %error, "segment store rejected put");
            PutAck::Err {
                segment_id,
                code: SegmentErrorCode::System,
                message: error.to_string(),
            }
        }
    }
}

fn handle_get<S: SegmentStore, A: Authorizer>(
    store: &S,
    authorizer: &A,
    request: &SegmentRequest,
) -> SegmentResponse {
    if request.file_id.is_empty() {
        return SegmentResponse::Err {
            code: SegmentErrorCode::InvalidFileId,
            message: "empty file id".into(),
        };
    }
    if request.segment_id.is_empty() {
        return SegmentResponse::Err {
            code: SegmentErrorCode::InvalidSegmentId,
            message: "empty segment id".into(),
        };
    }
    if !authorizer.authorize(&request.file_id, &request.pubkey_hash) {
        return SegmentResponse::Err {
            code: SegmentErrorCode::FilePermission,
            message: format!("not authorized for {}", request.file_id),
        };
    }

    match store.get(&request.task_id, &request.file_id, &request.segment_id) {
        Ok(Some((content, metadata))) => SegmentResponse::Ok {
            segment_id: request.segment_id.clone(),
            content,
            metadata,
        },
        Ok(None) => SegmentResponse::Err {
            code: SegmentErrorCode::SegmentNotFound,
            message: format!("segment {} not held here", request.segment_id),
        },
        Err(error) => SegmentResponse::Err {
            code: SegmentErrorCode::System,
            message: error.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AclAuthorizer, AllowAll};
    use crate::store::MemorySegmentStore;
    use bytes::Bytes;

    fn request(file_id: &str, segment_id: &str, key: &[u8]) -> SegmentRequest {
        SegmentRequest {
            task_id: "task".into(),
            file_id: file_id.into(),
            segment_id: segment_id.into(),
            pubkey_hash: Bytes::copy_from_slice(key),
        }
    }

    #[test]
    fn get_unknown_segment_is_not_found() {
        let store = MemorySegmentStore::new();
        let response = handle_get(&store, &AllowAll, &request("file", "missing", b""));
        assert!(matches!(
            response,
            SegmentResponse::Err {
                code: SegmentErrorCode::SegmentNotFound,
                ..
            }
        ));
    }

    #[test]
    fn get_without_grant_is_permission_denied() {
        let store = MemorySegmentStore::new();
        store
            .put("t", "file", "segment", Bytes::from_static(b"x"), Bytes::new())
            .expect("stores");

        let acl = AclAuthorizer::new();
        let response = handle_get(&store, &acl, &request("file", "segment", b"stranger"));
        assert!(matches!(
            response,
            SegmentResponse::Err {
                code: SegmentErrorCode::FilePermission,
                ..
            }
        ));

        acl.grant("file", b"stranger");
        let response = handle_get(&store, &acl, &request("file", "segment", b"stranger"));
        assert!(matches!(response, SegmentResponse::Ok { .. }));
    }

    #[test]
    fn put_then_get_serves_the_content() {
        let store = MemorySegmentStore::new();
        let ack = handle_put(
            &store,
            PutSegment {
                task_id: "task".into(),
                file_id: "file".into(),
                segment_id: "segment".into(),
                content: Bytes::from_static(b"the bytes"),
                metadata: Bytes::from_static(b"m"),
            },
        );
        assert!(matches!(ack, PutAck::Ok { .. }));

        let response = handle_get(&store, &AllowAll, &request("file", "segment", b""));
        let SegmentResponse::Ok { content, .. } = response else {
            panic!("expected ok");
        };
        assert_eq!(content, Bytes::from_static(b"the bytes"));
    }

    #[test]
    fn empty_identifiers_are_invalid() {
        let store = MemorySegmentStore::new();
        assert!(matches!(
            handle_get(&store, &AllowAll, &request("", "s", b"")),
            SegmentResponse::Err {
                code: SegmentErrorCode::InvalidFileId,
                ..
            }
        ));
        assert!(matches!(
            handle_get(&store, &AllowAll, &request("f", "", b"")),
            SegmentResponse::Err {
                code: SegmentErrorCode::InvalidSegmentId,
                ..
            }
        ));
    }
}
