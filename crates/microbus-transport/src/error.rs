/// Errors that can occur in transport operations.
///
/// Variants are kept cloneable so higher layers can fan a single failure out
/// to every pending caller.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    /// The transport endpoint has been closed and cannot post.
    #[error("transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;
