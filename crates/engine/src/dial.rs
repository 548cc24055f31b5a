use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{Connection, ConnectionConfig, ProtocolResult};

/// Opens protocol connections to peers.
///
/// The drivers are generic over this seam so tests can interpose failure
/// injection or address rewriting without a real network stack.
pub trait Dialer: Send + Sync + 'static {
    /// Dials `addr` and completes the handshake.
    fn dial(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = ProtocolResult<Connection>> + Send;
}

/// Plain TCP dialer carrying one connection configuration.
#[derive(Clone, Debug)]
pub struct TcpDialer {
    config: ConnectionConfig,
}

impl TcpDialer {
    /// Dialer using `config` for every connection.
    #[must_use]
    pub const fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// Connection configuration used per dial.
    #[must_use]
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

impl Dialer for TcpDialer {
    async fn dial(&self, addr: SocketAddr) -> ProtocolResult<Connection> {
        Connection::connect(addr, self.config.clone()).await
    }
}

impl<D: Dialer + ?Sized> Dialer for Arc<D> {
    fn dial(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = ProtocolResult<Connection>> + Send {
        (**self).dial(addr)
    }
}
