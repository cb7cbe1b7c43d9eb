//! Explicit error taxonomy replacing exceptions-as-control-flow: transport
//! and protocol errors are handled in place by the connector and never
//! propagate; only resource and configuration errors are fatal.

use std::io;

use thiserror::Error;

/// Handler return convention: `Disconnected` is the Rust analogue of "−1
/// triggers the direction's err-handler", `Ok` is "0, normal".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    Ok,
    Disconnected,
}

/// Node-level fatal errors. Configuration errors are a separate
/// `ConfigError` type owned by the binary crate, which wraps this one to
/// form its own top-level error.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),
    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
}
