//! Error types for the request throttle

use ofs_model::{RemoteError, TransientKind};

/// Failure to obtain a throttle slot
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleError {
    /// Best-effort waiting queue is at its bound
    #[error("throttle queue full ({waiting} waiting)")]
    QueueFull { waiting: usize },

    /// Throttle dropped while the caller was waiting
    #[error("throttle closed")]
    Closed,
}

impl From<ThrottleError> for RemoteError {
    fn from(err: ThrottleError) -> Self {
        match err {
            ThrottleError::QueueFull { waiting } => RemoteError::Overloaded(waiting),
            ThrottleError::Closed => RemoteError::transient(TransientKind::Network, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_maps_to_overloaded() {
        let err: RemoteError = ThrottleError::QueueFull { waiting: 64 }.into();
        assert_eq!(err, RemoteError::Overloaded(64));
        assert!(!err.reached_network());
    }
}
