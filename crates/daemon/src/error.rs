use thiserror::Error;

/// Reasons a desired-state payload is rejected before any state is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("interface cannot be empty")]
    EmptyInterface,
    #[error("network name cannot be empty")]
    EmptyNetwork,
    #[error("no peers to add")]
    NoPeers,
}
