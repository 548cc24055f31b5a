use thiserror::Error;

/// Errors surfaced by node assembly and the transfer entry points.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Transfer-engine failure.
    #[error(transparent)]
    Engine(#[from] engine::EngineError),
    /// Routing-table failure.
    #[error(transparent)]
    Table(#[from] routing::TableError),
    /// Task-pool failure.
    #[error(transparent)]
    Pool(#[from] pool::PoolError),
}
