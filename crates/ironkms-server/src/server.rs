//! TCP acceptor and per-connection session state machine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ironkms_catalog::Catalog;
use ironkms_core::{decode_cursor, ReadCursor};
use ironkms_pdu::rpc::{
    self, encode_pdu, Bind, CompleteRequest, FaultPdu, PacketType, RequestAssembler, RequestPdu, ResponsePdu,
};
use ironkms_store::ActivationStore;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::debug;

use crate::activation::ActivationEngine;
use crate::builder::{KmsServerBuilder, WantsCatalog};
use crate::config::KmsServerOptions;
use crate::event::{EventSink, ProtocolErrorKind};
use crate::framed::Framed;
use crate::{ServerError, SessionError};

/// Requests a graceful shutdown of the server that handed it out.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stops accepting connections; in-flight sessions get one final
    /// exchange within the configured grace period.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Per-connection protocol state.
///
/// Bind must precede the first request; every served request moves the
/// session to `Active`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SessionState {
    Init,
    BindSeen,
    Active,
}

/// KMS activation host.
pub struct KmsServer {
    options: Arc<KmsServerOptions>,
    engine: Arc<ActivationEngine>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl KmsServer {
    pub fn new(
        options: KmsServerOptions,
        catalog: Arc<Catalog>,
        store: Option<ActivationStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let options = Arc::new(options);
        let engine = Arc::new(ActivationEngine::new(
            Arc::clone(&options),
            catalog,
            store,
            sink,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            options,
            engine,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn builder() -> KmsServerBuilder<WantsCatalog> {
        KmsServerBuilder::new()
    }

    pub fn options(&self) -> &KmsServerOptions {
        &self.options
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Binds the configured address and serves until shut down.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.options.addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.run_with_listener(listener).await
    }

    /// Serves on an already-bound listener (lets tests use port 0).
    pub async fn run_with_listener(self, listener: TcpListener) -> Result<(), ServerError> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "listening for activation traffic");
        }

        let mut sessions = JoinSet::new();
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "connection accepted");
                            let engine = Arc::clone(&self.engine);
                            let options = Arc::clone(&self.options);
                            let shutdown = self.shutdown_rx.clone();
                            sessions.spawn(async move {
                                match serve_connection(stream, peer, engine, options, shutdown).await {
                                    // Protocol violations are already on the event stream.
                                    Ok(()) | Err(SessionError::Protocol(_)) => {}
                                    Err(error) => tracing::info!(%peer, %error, "session ended with error"),
                                }
                                debug!(%peer, "connection closed");
                            });
                        }
                        Err(error) => {
                            // One failed accept does not stop the loop.
                            tracing::info!(%error, "accept failed");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }

            while sessions.try_join_next().is_some() {}
        }

        drop(listener);
        drain_sessions(sessions, self.options.shutdown_grace).await;

        Ok(())
    }
}

async fn drain_sessions(mut sessions: JoinSet<()>, grace: Duration) {
    let drained = tokio::time::timeout(grace, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        debug!("grace period elapsed, aborting remaining sessions");
        sessions.shutdown().await;
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<ActivationEngine>,
    options: Arc<KmsServerOptions>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SessionError> {
    let mut framed = Framed::new(stream);
    let mut state = SessionState::Init;
    let mut assembler = RequestAssembler::new();
    let sec_addr = options.addr.port().to_string();

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let frame = tokio::select! {
            outcome = read_frame(&mut framed, options.timeout_idle) => match outcome {
                ReadOutcome::Frame(frame) => frame?,
                ReadOutcome::IdleTimeout => {
                    debug!(%peer, "read idle timeout, closing");
                    return Ok(());
                }
            },
            _ = shutdown.changed() => return Ok(()),
        };

        let Some(frame) = frame else {
            return Ok(());
        };

        let mut src = ReadCursor::new(&frame);
        let header = match rpc::PduHeader::read(&mut src) {
            Ok(header) => header,
            Err(error) => {
                engine.emit_protocol_error(peer, ProtocolErrorKind::MalformedPdu, error.to_string());
                return Err(SessionError::Protocol(ProtocolErrorKind::MalformedPdu));
            }
        };

        match header.packet_type {
            PacketType::BIND => {
                let bind: Bind = match decode_cursor(&mut src) {
                    Ok(bind) => bind,
                    Err(error) => {
                        engine.emit_protocol_error(peer, ProtocolErrorKind::MalformedPdu, error.to_string());
                        return Err(SessionError::Protocol(ProtocolErrorKind::MalformedPdu));
                    }
                };

                let ack = rpc::negotiate_bind(&bind, sec_addr.as_str());
                framed.write_all(&encode_pdu(PacketType::BIND_ACK, header.call_id, &ack)?).await?;
                debug!(%peer, call_id = header.call_id, "bind acknowledged");

                if state == SessionState::Init {
                    state = SessionState::BindSeen;
                }
            }
            PacketType::REQUEST => {
                if state == SessionState::Init {
                    engine.emit_protocol_error(
                        peer,
                        ProtocolErrorKind::BindRequired,
                        "request before bind".to_owned(),
                    );
                    return Err(SessionError::Protocol(ProtocolErrorKind::BindRequired));
                }

                let pdu: RequestPdu = match decode_cursor(&mut src) {
                    Ok(pdu) => pdu,
                    Err(error) => {
                        engine.emit_protocol_error(peer, ProtocolErrorKind::MalformedPdu, error.to_string());
                        return Err(SessionError::Protocol(ProtocolErrorKind::MalformedPdu));
                    }
                };

                let complete = match assembler.push(&header, pdu) {
                    Ok(Some(complete)) => complete,
                    Ok(None) => continue,
                    Err(error) => {
                        engine.emit_protocol_error(peer, ProtocolErrorKind::MalformedPdu, error.to_string());
                        return Err(SessionError::Protocol(ProtocolErrorKind::MalformedPdu));
                    }
                };

                serve_activation(&mut framed, peer, &engine, complete).await?;
                state = SessionState::Active;

                if *shutdown.borrow() {
                    // Final exchange served during drain.
                    return Ok(());
                }
            }
            other => {
                let fault = FaultPdu {
                    context_id: 0,
                    status: rpc::NCA_S_PROTO_ERROR,
                };
                let _ = framed.write_all(&encode_pdu(PacketType::FAULT, header.call_id, &fault)?).await;
                engine.emit_protocol_error(
                    peer,
                    ProtocolErrorKind::UnexpectedPdu,
                    format!("unexpected PDU type {other}"),
                );
                return Err(SessionError::Protocol(ProtocolErrorKind::UnexpectedPdu));
            }
        }
    }
}

async fn serve_activation(
    framed: &mut Framed,
    peer: SocketAddr,
    engine: &ActivationEngine,
    request: CompleteRequest,
) -> Result<(), SessionError> {
    if request.opnum != rpc::ACTIVATION_OPNUM {
        let fault = FaultPdu {
            context_id: request.context_id,
            status: rpc::NCA_S_OP_RNG_ERROR,
        };
        let _ = framed.write_all(&encode_pdu(PacketType::FAULT, request.call_id, &fault)?).await;
        engine.emit_protocol_error(
            peer,
            ProtocolErrorKind::UnknownOpnum,
            format!("opnum {}", request.opnum),
        );
        return Err(SessionError::Protocol(ProtocolErrorKind::UnknownOpnum));
    }

    let envelope = match rpc::decode_byte_array_stub(&request.stub_data) {
        Ok(envelope) => envelope,
        Err(error) => {
            engine.emit_protocol_error(peer, ProtocolErrorKind::MalformedPdu, error.to_string());
            return Err(SessionError::Protocol(ProtocolErrorKind::MalformedPdu));
        }
    };

    let response_envelope = engine.handle_activation(peer, &envelope).await?;

    let stub = rpc::encode_byte_array_stub(&response_envelope)?;
    let response = ResponsePdu::for_request(&request, stub);
    framed
        .write_all(&encode_pdu(PacketType::RESPONSE, request.call_id, &response)?)
        .await?;

    Ok(())
}

enum ReadOutcome {
    Frame(std::io::Result<Option<bytes::Bytes>>),
    IdleTimeout,
}

async fn read_frame(framed: &mut Framed, idle: Option<Duration>) -> ReadOutcome {
    match idle {
        Some(limit) => match tokio::time::timeout(limit, framed.read_frame()).await {
            Ok(outcome) => ReadOutcome::Frame(outcome),
            Err(_elapsed) => ReadOutcome::IdleTimeout,
        },
        None => ReadOutcome::Frame(framed.read_frame().await),
    }
}
