//! Minimal connection-oriented DCE/RPC 1.0 transport: bind/bind-ack
//! negotiation, request/response with fragment reassembly, and fault
//! reporting. Just enough of NDR for the single byte-array parameter of
//! the activation call.

mod bind;
mod request;

pub use bind::{negotiate_bind, Bind, BindAck, ContextElement, ContextResult, ContextResultCode};
pub use request::{
    decode_byte_array_stub, encode_byte_array_stub, CompleteRequest, FaultPdu, RequestAssembler, RequestPdu,
    ResponsePdu,
};

use bitflags::bitflags;
use core::fmt;
use ironkms_core::{
    cast_length, ensure_fixed_part_size, invalid_field_err, unsupported_version_err, DecodeResult, Encode,
    EncodeResult, ReadCursor, WriteCursor,
};
use uuid::{uuid, Uuid};

use crate::guid::{read_guid, write_guid, GUID_SIZE};

/// Abstract syntax of the KMS activation interface.
pub const KMS_INTERFACE_ID: SyntaxId = SyntaxId {
    uuid: uuid!("51c82175-844e-4750-b0d8-ec255555bc06"),
    version: 1,
    version_minor: 0,
};

/// NDR transfer syntax.
pub const NDR_TRANSFER_SYNTAX: SyntaxId = SyntaxId {
    uuid: uuid!("8a885d04-1ceb-11c9-9fe8-08002b104860"),
    version: 2,
    version_minor: 0,
};

/// Negotiated fragment sizes are capped at this many bytes.
pub const MAX_FRAG_SIZE: u16 = 5840;

/// The only operation of the activation interface.
pub const ACTIVATION_OPNUM: u16 = 0;

/// `nca_s_op_rng_error`: operation number out of range.
pub const NCA_S_OP_RNG_ERROR: u32 = 0x1C01_0002;

/// `nca_s_proto_error`: protocol violation, e.g. an unexpected PDU type.
pub const NCA_S_PROTO_ERROR: u32 = 0x1C01_000B;

/// DCE/RPC packet type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketType(u8);

impl PacketType {
    pub const REQUEST: Self = Self(0x00);
    pub const RESPONSE: Self = Self(0x02);
    pub const FAULT: Self = Self(0x03);
    pub const BIND: Self = Self(0x0B);
    pub const BIND_ACK: Self = Self(0x0C);
    pub const BIND_NAK: Self = Self(0x0D);
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        value.0
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::REQUEST => "request",
            Self::RESPONSE => "response",
            Self::FAULT => "fault",
            Self::BIND => "bind",
            Self::BIND_ACK => "bind_ack",
            Self::BIND_NAK => "bind_nak",
            Self(other) => return write!(f, "unknown ({other})"),
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Per-fragment control flags of the common PDU header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PfcFlags: u8 {
        const FIRST_FRAG = 0x01;
        const LAST_FRAG = 0x02;
        const PENDING_CANCEL = 0x04;
        const CONC_MPX = 0x10;
        const DID_NOT_EXECUTE = 0x20;
        const MAYBE = 0x40;
        const OBJECT_UUID = 0x80;
    }
}

/// Common 16-byte header of every connection-oriented PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub packet_type: PacketType,
    pub pfc_flags: PfcFlags,
    /// Total fragment length, header included.
    pub frag_length: u16,
    pub auth_length: u16,
    pub call_id: u32,
}

impl PduHeader {
    pub const VERSION: u8 = 5;
    pub const VERSION_MINOR: u8 = 0;

    /// Little-endian integer and IEEE float data representation.
    pub const DREP_LE: [u8; 4] = [0x10, 0x00, 0x00, 0x00];

    pub const SIZE: usize = 16;

    pub const NAME: &'static str = "PduHeader";

    const FIXED_PART_SIZE: usize = Self::SIZE;

    pub fn read(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let version = src.read_u8();
        if version != Self::VERSION {
            return Err(unsupported_version_err!("rpc_vers", u16::from(version)));
        }

        let version_minor = src.read_u8();
        if version_minor != Self::VERSION_MINOR {
            return Err(unsupported_version_err!("rpc_vers_minor", u16::from(version_minor)));
        }

        let packet_type = PacketType::from(src.read_u8());
        let pfc_flags = PfcFlags::from_bits_truncate(src.read_u8());

        let drep = src.read_array::<4>();
        if drep[0] != Self::DREP_LE[0] {
            return Err(invalid_field_err!("packed_drep", "only little-endian NDR is supported"));
        }

        let frag_length = src.read_u16();
        if usize::from(frag_length) < Self::SIZE {
            return Err(invalid_field_err!("frag_length", "shorter than the PDU header"));
        }
        let auth_length = src.read_u16();
        let call_id = src.read_u32();

        Ok(Self {
            packet_type,
            pfc_flags,
            frag_length,
            auth_length,
            call_id,
        })
    }

    pub fn write(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);

        dst.write_u8(Self::VERSION);
        dst.write_u8(Self::VERSION_MINOR);
        dst.write_u8(self.packet_type.into());
        dst.write_u8(self.pfc_flags.bits());
        dst.write_array(Self::DREP_LE);
        dst.write_u16(self.frag_length);
        dst.write_u16(self.auth_length);
        dst.write_u32(self.call_id);

        Ok(())
    }
}

/// Finds the next PDU size by peeking at the buffered header bytes.
///
/// Returns `None` when fewer than ten bytes are available yet.
pub fn find_frame_size(bytes: &[u8]) -> DecodeResult<Option<usize>> {
    const FRAG_LENGTH_END: usize = 10;

    if bytes.len() < FRAG_LENGTH_END {
        return Ok(None);
    }

    if bytes[0] != PduHeader::VERSION {
        return Err(unsupported_version_err!("PduHeader", u16::from(bytes[0])));
    }

    let frag_length = u16::from_le_bytes([bytes[8], bytes[9]]);
    if usize::from(frag_length) < PduHeader::SIZE {
        return Err(invalid_field_err!("PduHeader", "frag_length", "shorter than the PDU header"));
    }

    Ok(Some(usize::from(frag_length)))
}

/// Interface or transfer syntax identifier: GUID plus a two-part version.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub version: u16,
    pub version_minor: u16,
}

impl SyntaxId {
    pub const SIZE: usize = GUID_SIZE + 4;

    pub const NAME: &'static str = "SyntaxId";

    const FIXED_PART_SIZE: usize = Self::SIZE;

    /// All-zero placeholder used in rejected presentation results.
    pub const NIL: Self = Self {
        uuid: Uuid::nil(),
        version: 0,
        version_minor: 0,
    };

    pub fn read(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let uuid = read_guid(src)?;
        let version = src.read_u16();
        let version_minor = src.read_u16();

        Ok(Self {
            uuid,
            version,
            version_minor,
        })
    }

    pub fn write(&self, dst: &mut WriteCursor<'_>) {
        write_guid(dst, &self.uuid);
        dst.write_u16(self.version);
        dst.write_u16(self.version_minor);
    }
}

/// Encodes a complete single-fragment PDU: header plus `body`.
pub fn encode_pdu<T>(packet_type: PacketType, call_id: u32, body: &T) -> EncodeResult<Vec<u8>>
where
    T: Encode + ?Sized,
{
    let total = PduHeader::SIZE + body.size();

    let header = PduHeader {
        packet_type,
        pfc_flags: PfcFlags::FIRST_FRAG | PfcFlags::LAST_FRAG,
        frag_length: cast_length!("PduHeader", "frag_length", total)?,
        auth_length: 0,
        call_id,
    };

    let mut buf = vec![0; total];
    let mut dst = WriteCursor::new(&mut buf);
    header.write(&mut dst)?;
    body.encode(&mut dst)?;
    debug_assert_eq!(dst.pos(), total);

    Ok(buf)
}
