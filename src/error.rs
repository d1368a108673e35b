//! Error taxonomy for the gul library
//!
//! Errors that cross the supervisor/worker boundary travel as plain strings
//! inside control replies; everything inside one process uses [`GulError`].

use thiserror::Error;

/// Library-wide error type
#[derive(Debug, Error)]
pub enum GulError {
    /// I/O failure on a socket, pipe or file
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed or unexpected control-channel traffic
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The worker process exited while a call was outstanding
    #[error("worker exited before replying")]
    WorkerExited,

    /// No worker process is currently running
    #[error("worker is not running")]
    WorkerNotRunning,

    /// A worker process is already running
    #[error("worker is already running")]
    WorkerRunning,

    /// The rendezvous handshake did not complete in time
    #[error("connection handoff timed out")]
    HandoffTimeout,

    /// A controller failed while handling a request
    #[error("controller {controller} on route '{route}' failed: {message}")]
    Controller {
        route: String,
        controller: usize,
        message: String,
    },

    /// Problem reading or interpreting an application bundle
    #[error("bundle error: {0}")]
    Bundle(String),

    /// Template rendering failed
    #[error("render error: {0}")]
    Render(String),

    /// Worker-side failure reported over the control channel
    #[error("worker error: {0}")]
    Worker(String),
}

/// Convenience alias used throughout the library
pub type Result<T> = std::result::Result<T, GulError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formatting() {
        let err = GulError::Controller {
            route: "/hello/:name".to_string(),
            controller: 2,
            message: "boom".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("/hello/:name"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: GulError = io.into();
        assert!(matches!(err, GulError::Transport(_)));
        assert!(err.to_string().contains("pipe closed"));
    }
}
