//! Request / Response / Fault PDUs, fragment reassembly, and the NDR
//! conformant varying byte array carrying the KMS envelope.

use ironkms_core::{
    cast_length, ensure_fixed_part_size, ensure_size, invalid_field_err, Decode, DecodeResult, Encode, EncodeError,
    EncodeResult, ReadCursor, WriteCursor,
};

use super::{PduHeader, PfcFlags};

/// Reassembled stubs larger than this are treated as hostile.
const MAX_STUB_SIZE: usize = 1024 * 1024;

/// Request PDU body (packet type 0x00).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPdu {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub opnum: u16,
    pub stub_data: Vec<u8>,
}

impl RequestPdu {
    pub const NAME: &'static str = "Request";

    const FIXED_PART_SIZE: usize = 8;
}

impl Encode for RequestPdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        dst.write_u32(self.alloc_hint);
        dst.write_u16(self.context_id);
        dst.write_u16(self.opnum);
        dst.write_slice(&self.stub_data);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.stub_data.len()
    }
}

impl<'de> Decode<'de> for RequestPdu {
    fn decode(src: &mut ReadCursor<'de>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let alloc_hint = src.read_u32();
        let context_id = src.read_u16();
        let opnum = src.read_u16();
        let stub_data = src.read_remaining().to_vec();

        Ok(Self {
            alloc_hint,
            context_id,
            opnum,
            stub_data,
        })
    }
}

/// Response PDU body (packet type 0x02).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePdu {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub stub_data: Vec<u8>,
}

impl ResponsePdu {
    pub const NAME: &'static str = "Response";

    const FIXED_PART_SIZE: usize = 8;

    /// Response carrying `stub_data` for the given request.
    pub fn for_request(request: &CompleteRequest, stub_data: Vec<u8>) -> Self {
        Self {
            alloc_hint: stub_data.len() as u32,
            context_id: request.context_id,
            cancel_count: 0,
            stub_data,
        }
    }
}

impl Encode for ResponsePdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        dst.write_u32(self.alloc_hint);
        dst.write_u16(self.context_id);
        dst.write_u8(self.cancel_count);
        ironkms_core::write_padding!(dst, 1);
        dst.write_slice(&self.stub_data);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.stub_data.len()
    }
}

impl<'de> Decode<'de> for ResponsePdu {
    fn decode(src: &mut ReadCursor<'de>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let alloc_hint = src.read_u32();
        let context_id = src.read_u16();
        let cancel_count = src.read_u8();
        ironkms_core::read_padding!(src, 1);
        let stub_data = src.read_remaining().to_vec();

        Ok(Self {
            alloc_hint,
            context_id,
            cancel_count,
            stub_data,
        })
    }
}

/// Fault PDU body (packet type 0x03).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultPdu {
    pub context_id: u16,
    pub status: u32,
}

impl FaultPdu {
    pub const NAME: &'static str = "Fault";

    const FIXED_PART_SIZE: usize = 16;
}

impl Encode for FaultPdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        dst.write_u32(0); // alloc_hint
        dst.write_u16(self.context_id);
        dst.write_u8(0); // cancel_count
        ironkms_core::write_padding!(dst, 1);
        dst.write_u32(self.status);
        ironkms_core::write_padding!(dst, 4);

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

impl<'de> Decode<'de> for FaultPdu {
    fn decode(src: &mut ReadCursor<'de>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let _alloc_hint = src.read_u32();
        let context_id = src.read_u16();
        let _cancel_count = src.read_u8();
        ironkms_core::read_padding!(src, 1);
        let status = src.read_u32();
        ironkms_core::read_padding!(src, 4);

        Ok(Self { context_id, status })
    }
}

/// A fully reassembled activation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteRequest {
    pub call_id: u32,
    pub context_id: u16,
    pub opnum: u16,
    pub stub_data: Vec<u8>,
}

/// Reassembles multi-fragment requests.
///
/// Request bodies may arrive split over several PDUs carrying
/// `PFC_FIRST_FRAG` / `PFC_LAST_FRAG`; stub bytes are concatenated in
/// arrival order. One call is in flight at a time per connection.
#[derive(Debug, Default)]
pub struct RequestAssembler {
    pending: Option<CompleteRequest>,
}

impl RequestAssembler {
    const NAME: &'static str = "RequestAssembler";

    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one request PDU; returns the reassembled call once the
    /// last fragment arrived.
    pub fn push(&mut self, header: &PduHeader, pdu: RequestPdu) -> DecodeResult<Option<CompleteRequest>> {
        if header.pfc_flags.contains(PfcFlags::OBJECT_UUID) {
            return Err(invalid_field_err!("pfc_flags", "object UUID is not supported"));
        }

        let first = header.pfc_flags.contains(PfcFlags::FIRST_FRAG);
        let last = header.pfc_flags.contains(PfcFlags::LAST_FRAG);

        match (&mut self.pending, first) {
            (None, true) => {
                let call = CompleteRequest {
                    call_id: header.call_id,
                    context_id: pdu.context_id,
                    opnum: pdu.opnum,
                    stub_data: pdu.stub_data,
                };
                if last {
                    return Ok(Some(call));
                }
                self.pending = Some(call);
            }
            (None, false) => {
                return Err(invalid_field_err!("pfc_flags", "continuation without a first fragment"));
            }
            (Some(_), true) => {
                self.pending = None;
                return Err(invalid_field_err!("pfc_flags", "first fragment while reassembling"));
            }
            (Some(call), false) => {
                if call.call_id != header.call_id {
                    self.pending = None;
                    return Err(invalid_field_err!("call_id", "changed between fragments"));
                }
                if call.context_id != pdu.context_id || call.opnum != pdu.opnum {
                    self.pending = None;
                    return Err(invalid_field_err!("context_id", "changed between fragments"));
                }
                if call.stub_data.len() + pdu.stub_data.len() > MAX_STUB_SIZE {
                    self.pending = None;
                    return Err(invalid_field_err!("stub_data", "reassembled stub too large"));
                }
                call.stub_data.extend_from_slice(&pdu.stub_data);
                if last {
                    return Ok(self.pending.take());
                }
            }
        }

        Ok(None)
    }
}

/// Decodes the single parameter of the activation call: an NDR
/// conformant varying array of bytes.
pub fn decode_byte_array_stub(stub: &[u8]) -> DecodeResult<Vec<u8>> {
    const NAME: &str = "ByteArrayStub";

    let mut src = ReadCursor::new(stub);
    ensure_size!(ctx: NAME, in: src, size: 12);

    let max_count = src.read_u32() as usize;
    let offset = src.read_u32() as usize;
    let actual_count = src.read_u32() as usize;

    if offset != 0 {
        return Err(invalid_field_err!(NAME, "offset", "non-zero array offset"));
    }
    if actual_count > max_count {
        return Err(invalid_field_err!(NAME, "actual_count", "exceeds max_count"));
    }
    ensure_size!(ctx: NAME, in: src, size: actual_count);

    // Trailing bytes are alignment padding.
    Ok(src.read_slice(actual_count).to_vec())
}

/// Encodes a payload as an NDR conformant varying array of bytes,
/// padded to a four-byte boundary.
pub fn encode_byte_array_stub(payload: &[u8]) -> EncodeResult<Vec<u8>> {
    const NAME: &str = "ByteArrayStub";

    let count: u32 = {
        let result: Result<u32, EncodeError> = cast_length!(NAME, "actual_count", payload.len());
        result?
    };
    let padding = (4 - payload.len() % 4) % 4;

    let mut out = Vec::with_capacity(12 + payload.len() + padding);
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(payload);
    out.resize(out.len() + padding, 0);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(pfc_flags: PfcFlags, call_id: u32) -> PduHeader {
        PduHeader {
            packet_type: super::super::PacketType::REQUEST,
            pfc_flags,
            frag_length: 0,
            auth_length: 0,
            call_id,
        }
    }

    fn request(stub: &[u8]) -> RequestPdu {
        RequestPdu {
            alloc_hint: stub.len() as u32,
            context_id: 0,
            opnum: 0,
            stub_data: stub.to_vec(),
        }
    }

    #[test]
    fn single_fragment_completes_immediately() {
        let mut assembler = RequestAssembler::new();
        let complete = assembler
            .push(&header(PfcFlags::FIRST_FRAG | PfcFlags::LAST_FRAG, 7), request(b"abc"))
            .unwrap()
            .unwrap();

        assert_eq!(complete.call_id, 7);
        assert_eq!(complete.stub_data, b"abc");
    }

    #[test]
    fn three_fragments_are_concatenated() {
        let mut assembler = RequestAssembler::new();

        assert!(assembler
            .push(&header(PfcFlags::FIRST_FRAG, 3), request(b"aa"))
            .unwrap()
            .is_none());
        assert!(assembler
            .push(&header(PfcFlags::empty(), 3), request(b"bb"))
            .unwrap()
            .is_none());
        let complete = assembler
            .push(&header(PfcFlags::LAST_FRAG, 3), request(b"cc"))
            .unwrap()
            .unwrap();

        assert_eq!(complete.stub_data, b"aabbcc");
    }

    #[test]
    fn continuation_without_first_is_rejected() {
        let mut assembler = RequestAssembler::new();
        assert!(assembler.push(&header(PfcFlags::LAST_FRAG, 1), request(b"x")).is_err());
    }

    #[test]
    fn call_id_change_is_rejected() {
        let mut assembler = RequestAssembler::new();
        assembler
            .push(&header(PfcFlags::FIRST_FRAG, 1), request(b"x"))
            .unwrap();
        assert!(assembler.push(&header(PfcFlags::LAST_FRAG, 2), request(b"y")).is_err());
    }

    #[test]
    fn byte_array_stub_round_trip() {
        let payload = b"kms envelope bytes";
        let stub = encode_byte_array_stub(payload).unwrap();
        assert_eq!(stub.len() % 4, 0);
        assert_eq!(decode_byte_array_stub(&stub).unwrap(), payload);
    }

    #[test]
    fn byte_array_stub_with_bad_offset_is_rejected() {
        let mut stub = encode_byte_array_stub(b"data").unwrap();
        stub[4] = 2;
        assert!(decode_byte_array_stub(&stub).is_err());
    }

    #[test]
    fn truncated_byte_array_stub_is_rejected() {
        let stub = encode_byte_array_stub(b"data").unwrap();
        assert!(decode_byte_array_stub(&stub[..10]).is_err());
    }
}
