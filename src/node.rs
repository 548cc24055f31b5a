use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use engine::{
    AllowAll, Authorizer, DownloadConfig, Downloader, FileManifest, MemorySegmentStore,
    SegmentService, SegmentStore, TcpDialer, UploadConfig, Uploader,
};
use identity::{Mode, NodeId};
use pool::TaskPool;
use protocol::ConnectionConfig;
use routing::{RoutingTable, TableConfig};
use tracing::info;

use crate::error::NodeError;

/// Everything needed to bring a node up.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Stable identity of this node.
    pub id: NodeId,
    /// Address the segment service listens on.
    pub listen_addr: SocketAddr,
    /// Routing-table tunables.
    pub table: TableConfig,
    /// Wire-protocol tunables shared by the service and outbound dials.
    pub connection: ConnectionConfig,
    /// Upload driver tunables.
    pub upload: UploadConfig,
    /// Download driver tunables.
    pub download: DownloadConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: NodeId::from_public_key(&rand_identity()),
            listen_addr: "127.0.0.1:0".parse().expect("static addr"),
            table: TableConfig::default(),
            connection: ConnectionConfig::default(),
            upload: UploadConfig::default(),
            download: DownloadConfig::default(),
        }
    }
}

fn rand_identity() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
    bytes
}

/// A running DeFS node: routing table, task pool, transfer drivers and the
/// inbound segment service, wired together.
pub struct Node {
    id: NodeId,
    pool: Arc<TaskPool>,
    table: Arc<RoutingTable>,
    service: SegmentService,
    uploader: Uploader<TcpDialer>,
    downloader: Downloader<TcpDialer>,
}

impl Node {
    /// Starts a node backed by an in-memory segment store that serves
    /// every authorized request.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        Self::start_with(
            config,
            Arc::new(MemorySegmentStore::new()),
            Arc::new(AllowAll),
        )
        .await
    }

    /// Starts a node with explicit store and authorizer implementations.
    pub async fn start_with<S: SegmentStore, A: Authorizer>(
        config: NodeConfig,
        store: Arc<S>,
        authorizer: Arc<A>,
    ) -> Result<Self, NodeError> {
        logging::init();

        let pool = Arc::new(TaskPool::new());
        let table = Arc::new(RoutingTable::new(config.id, config.table));
        let service = SegmentService::bind(
            config.listen_addr,
            store,
            authorizer,
            config.connection.clone(),
        )
        .await?;
        info!(id = %config.id, addr = %service.local_addr(), "node started");

        let dialer = Arc::new(TcpDialer::new(config.connection));
        let uploader = Uploader::new(
            Arc::clone(&pool),
            Arc::clone(&table),
            Arc::clone(&dialer),
            config.upload,
        );
        let downloader = Downloader::new(
            Arc::clone(&pool),
            Arc::clone(&table),
            dialer,
            config.download,
        );

        Ok(Self {
            id: config.id,
            pool,
            table,
            service,
            uploader,
            downloader,
        })
    }

    /// This node's identity.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Address the segment service is listening on.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.service.local_addr()
    }

    /// The shared routing table.
    #[must_use]
    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// The shared task pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    /// Records a peer in the routing table.
    pub fn add_peer(&self, id: NodeId, addr: SocketAddr, mode: Mode) -> Result<(), NodeError> {
        self.table.try_add(id, addr, mode, false, true)?;
        Ok(())
    }

    /// Disperses `data` across the overlay; see [`Uploader::upload`].
    pub async fn upload(
        &self,
        task_id: &str,
        file_id: &str,
        data: &[u8],
        private_key: Bytes,
        file_metadata: Bytes,
    ) -> Result<FileManifest, NodeError> {
        Ok(self
            .uploader
            .upload(task_id, file_id, data, private_key, file_metadata)
            .await?)
    }

    /// Recovers a file from the overlay; see [`Downloader::download`].
    pub async fn download(
        &self,
        task_id: &str,
        manifest: &FileManifest,
        pubkey_hash: Bytes,
    ) -> Result<Bytes, NodeError> {
        Ok(self.downloader.download(task_id, manifest, pubkey_hash).await?)
    }

    /// Stops the inbound service; in-flight tasks observe their
    /// cancellation flags.
    pub fn shutdown(&self) {
        self.service.shutdown();
    }
}
