//! KMS activation host.
//!
//! A server is created from an immutable configuration record, the
//! static product catalog, and an optional activation store. Each
//! accepted connection runs its own session; sessions share only those
//! three plus the event sink.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ironkms_catalog::Catalog;
//! use ironkms_server::{KmsServer, ServerError};
//!
//! # async fn stub() -> Result<(), ServerError> {
//! let catalog = Arc::new(Catalog::load_embedded().expect("embedded catalog"));
//!
//! let server = KmsServer::builder()
//!     .with_addr(([0, 0, 0, 0], 1688))
//!     .with_catalog(catalog)
//!     .build();
//!
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

mod activation;
mod builder;
mod config;
mod event;
mod framed;
mod server;

pub use crate::builder::{BuilderDone, KmsServerBuilder, WantsCatalog};
pub use crate::config::{Hwid, HwidParseError, KmsServerOptions, DEFAULT_HWID, DEFAULT_PORT};
pub use crate::event::{EventSink, KmsEvent, NullSink, ProtocolErrorKind, TracingSink};
pub use crate::server::{KmsServer, ShutdownHandle};

use std::net::SocketAddr;

/// Fatal server-level failure.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single session ended.
///
/// None of these reach the client in-band; either a full response was
/// written or the socket closes.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    Protocol(ProtocolErrorKind),
    #[error("session I/O failed")]
    Io(#[from] std::io::Error),
    #[error("failed to encode response")]
    Encode(#[from] ironkms_core::EncodeError),
}
