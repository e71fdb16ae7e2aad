//! Synthetic KMS client: performs the bind and activation exchange a
//! real volume-license client would, and exposes enough raw access to
//! drive malformed-traffic scenarios.

use std::net::SocketAddr;

use anyhow::{bail, Context as _};
use bytes::{Bytes, BytesMut};
use ironkms_core::{decode_cursor, Encode, ReadCursor, WriteCursor};
use ironkms_pdu::kms::{self, ActivationRequest, ActivationResponse};
use ironkms_pdu::rpc::{
    self, Bind, BindAck, ContextElement, FaultPdu, PacketType, PduHeader, PfcFlags, RequestPdu, ResponsePdu,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;

/// Outcome of one activation attempt.
#[derive(Debug)]
pub enum Exchange {
    /// The server answered; envelope bytes and the verified response.
    Response {
        envelope: Vec<u8>,
        response: ActivationResponse,
    },
    /// The server answered with a fault PDU.
    Fault(FaultPdu),
    /// The server closed the connection without answering.
    Closed,
}

pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
    call_id: u32,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("connect")?;
        Ok(Self {
            stream,
            buf: BytesMut::new(),
            call_id: 0,
        })
    }

    /// Binds the KMS activation interface; fails on rejection.
    pub async fn bind(&mut self) -> anyhow::Result<BindAck> {
        let bind = Bind {
            max_xmit_frag: rpc::MAX_FRAG_SIZE,
            max_recv_frag: rpc::MAX_FRAG_SIZE,
            assoc_group: 0,
            contexts: vec![ContextElement {
                context_id: 0,
                abstract_syntax: rpc::KMS_INTERFACE_ID,
                transfer_syntaxes: vec![rpc::NDR_TRANSFER_SYNTAX],
            }],
        };

        self.call_id += 1;
        let pdu = rpc::encode_pdu(PacketType::BIND, self.call_id, &bind)?;
        self.stream.write_all(&pdu).await?;

        let frame = self.read_frame().await?.context("connection closed during bind")?;
        let mut src = ReadCursor::new(&frame);
        let header = PduHeader::read(&mut src)?;
        if header.packet_type != PacketType::BIND_ACK {
            bail!("expected bind_ack, got {}", header.packet_type);
        }

        let ack: BindAck = decode_cursor(&mut src)?;
        Ok(ack)
    }

    /// Seals and sends an activation request, then verifies the
    /// response envelope the way a real client does.
    pub async fn activate(&mut self, request: &ActivationRequest) -> anyhow::Result<Exchange> {
        let envelope = kms::seal_request(request)?;
        self.activate_envelope(&envelope).await
    }

    /// Sends a pre-built (possibly corrupted) activation envelope.
    pub async fn activate_envelope(&mut self, envelope: &[u8]) -> anyhow::Result<Exchange> {
        let stub = rpc::encode_byte_array_stub(envelope)?;
        let pdu = RequestPdu {
            alloc_hint: stub.len() as u32,
            context_id: 0,
            opnum: rpc::ACTIVATION_OPNUM,
            stub_data: stub,
        };

        self.call_id += 1;
        let bytes = rpc::encode_pdu(PacketType::REQUEST, self.call_id, &pdu)?;
        self.stream.write_all(&bytes).await?;

        self.read_exchange().await
    }

    /// Sends an activation request split into `parts` stub fragments.
    pub async fn activate_fragmented(
        &mut self,
        request: &ActivationRequest,
        parts: usize,
    ) -> anyhow::Result<Exchange> {
        assert!(parts >= 2, "use activate() for single fragments");

        let envelope = kms::seal_request(request)?;
        let stub = rpc::encode_byte_array_stub(&envelope)?;
        let chunk = stub.len().div_ceil(parts);

        self.call_id += 1;
        for (index, piece) in stub.chunks(chunk).enumerate() {
            let mut flags = PfcFlags::empty();
            if index == 0 {
                flags |= PfcFlags::FIRST_FRAG;
            }
            if (index + 1) * chunk >= stub.len() {
                flags |= PfcFlags::LAST_FRAG;
            }

            let pdu = RequestPdu {
                alloc_hint: stub.len() as u32,
                context_id: 0,
                opnum: rpc::ACTIVATION_OPNUM,
                stub_data: piece.to_vec(),
            };
            let bytes = encode_pdu_with_flags(PacketType::REQUEST, flags, self.call_id, &pdu)?;
            self.stream.write_all(&bytes).await?;
        }

        self.read_exchange().await
    }

    /// Sends a request with an arbitrary operation number.
    pub async fn call_opnum(&mut self, opnum: u16) -> anyhow::Result<Exchange> {
        let stub = rpc::encode_byte_array_stub(b"")?;
        let pdu = RequestPdu {
            alloc_hint: stub.len() as u32,
            context_id: 0,
            opnum,
            stub_data: stub,
        };

        self.call_id += 1;
        let bytes = rpc::encode_pdu(PacketType::REQUEST, self.call_id, &pdu)?;
        self.stream.write_all(&bytes).await?;

        self.read_exchange().await
    }

    /// Reads one full PDU; `None` once the server closed the socket.
    pub async fn read_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        loop {
            if let Some(length) = rpc::find_frame_size(&self.buf)? {
                if self.buf.len() >= length {
                    return Ok(Some(self.buf.split_to(length).freeze()));
                }
            }

            let read = self.stream.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                bail!("connection closed inside a PDU");
            }
        }
    }

    async fn read_exchange(&mut self) -> anyhow::Result<Exchange> {
        let Some(frame) = self.read_frame().await? else {
            return Ok(Exchange::Closed);
        };

        let mut src = ReadCursor::new(&frame);
        let header = PduHeader::read(&mut src)?;

        match header.packet_type {
            PacketType::RESPONSE => {
                let pdu: ResponsePdu = decode_cursor(&mut src)?;
                let envelope = rpc::decode_byte_array_stub(&pdu.stub_data)?;
                let response = kms::open_response(&envelope)?;
                Ok(Exchange::Response { envelope, response })
            }
            PacketType::FAULT => {
                let fault: FaultPdu = decode_cursor(&mut src)?;
                Ok(Exchange::Fault(fault))
            }
            other => bail!("unexpected PDU type {other}"),
        }
    }
}

/// Like [`rpc::encode_pdu`] with caller-chosen fragment flags.
pub fn encode_pdu_with_flags<T>(
    packet_type: PacketType,
    pfc_flags: PfcFlags,
    call_id: u32,
    body: &T,
) -> anyhow::Result<Vec<u8>>
where
    T: Encode,
{
    let total = PduHeader::SIZE + body.size();
    let header = PduHeader {
        packet_type,
        pfc_flags,
        frag_length: u16::try_from(total).context("fragment too large")?,
        auth_length: 0,
        call_id,
    };

    let mut buf = vec![0; total];
    let mut dst = WriteCursor::new(&mut buf);
    header.write(&mut dst)?;
    body.encode(&mut dst)?;

    Ok(buf)
}
