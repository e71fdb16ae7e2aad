//! Structured event surface of the engine.
//!
//! The engine emits typed events through an [`EventSink`] provided by
//! the embedder; transport and presentation stay outside. The default
//! sink forwards to `tracing` at the levels the protocol taxonomy
//! mandates.

use core::fmt;
use std::net::SocketAddr;

use ironkms_pdu::kms::ProtocolVersion;
use uuid::Uuid;

/// Why a connection was dropped without a response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// PDU or KMS payload failed to parse.
    MalformedPdu,
    /// Operation number other than the activation call.
    UnknownOpnum,
    /// Request before a successful bind.
    BindRequired,
    /// Unexpected PDU type.
    UnexpectedPdu,
    /// KMS protocol version outside 4/5/6.
    UnsupportedVersion,
    /// V4 keyed hash over the inbound request did not match.
    BadV4Hash,
    /// V5 trailing digest did not verify after decryption.
    BadV5Digest,
    /// V6 CMAC did not verify.
    BadV6Cmac,
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MalformedPdu => "MalformedPdu",
            Self::UnknownOpnum => "UnknownOpnum",
            Self::BindRequired => "BindRequired",
            Self::UnexpectedPdu => "UnexpectedPdu",
            Self::UnsupportedVersion => "UnsupportedVersion",
            Self::BadV4Hash => "BadV4Hash",
            Self::BadV5Digest => "BadV5Digest",
            Self::BadV6Cmac => "BadV6Cmac",
        };
        f.write_str(name)
    }
}

/// Events emitted while serving activation traffic.
#[derive(Debug, Clone)]
pub enum KmsEvent {
    /// A well-formed request passed envelope verification.
    RequestAccepted {
        peer: SocketAddr,
        cmid: Uuid,
        version: ProtocolVersion,
        /// Application group display name (hex form when unknown).
        app_group: String,
        /// SKU display name (hex form when unknown).
        sku: String,
        request_time: u64,
        /// Count the client requires to consider itself activated.
        client_count: u32,
        machine_name: String,
        license_status: &'static str,
    },
    /// A response was written back to the client.
    ResponseSent {
        peer: SocketAddr,
        cmid: Uuid,
        epid: String,
        activated_count: u32,
    },
    /// The connection was dropped due to a protocol violation.
    ProtocolError {
        peer: SocketAddr,
        kind: ProtocolErrorKind,
        details: String,
    },
    /// The activation store failed; the response was still served.
    StorageError { cmid: Uuid, kind: &'static str },
}

/// Receives engine events; implementations must be cheap and
/// non-blocking.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &KmsEvent);
}

/// Default sink: forwards events to `tracing`.
///
/// Request/response/error events log at info, storage detail at info,
/// nothing protocol-level at warn or above (KMS has no in-band error
/// signaling to mirror).
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &KmsEvent) {
        match event {
            KmsEvent::RequestAccepted {
                peer,
                cmid,
                version,
                app_group,
                sku,
                request_time,
                client_count,
                machine_name,
                license_status,
            } => {
                tracing::info!(
                    %peer,
                    %cmid,
                    %version,
                    %app_group,
                    %sku,
                    request_time,
                    client_count,
                    %machine_name,
                    license_status,
                    "activation request"
                );
            }
            KmsEvent::ResponseSent {
                peer,
                cmid,
                epid,
                activated_count,
            } => {
                tracing::info!(%peer, %cmid, %epid, activated_count, "activation response sent");
            }
            KmsEvent::ProtocolError { peer, kind, details } => {
                tracing::info!(%peer, %kind, %details, "protocol error, dropping connection");
            }
            KmsEvent::StorageError { cmid, kind } => {
                tracing::info!(%cmid, kind, "activation store failure, record lost");
            }
        }
    }
}

/// Sink discarding everything; for embedders wiring their own streams.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &KmsEvent) {}
}
