//! Bind / BindAck PDUs and presentation context negotiation.

use ironkms_core::{
    cast_length, ensure_fixed_part_size, ensure_size, invalid_field_err, Decode, DecodeError, DecodeResult, Encode,
    EncodeError, EncodeResult, ReadCursor, WriteCursor,
};

use super::{SyntaxId, KMS_INTERFACE_ID, MAX_FRAG_SIZE, NDR_TRANSFER_SYNTAX};

/// Assigned when the client leaves the association group open.
const DEFAULT_ASSOC_GROUP: u32 = 0x1063;

/// One presentation context proposed by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

impl ContextElement {
    const FIXED_PART_SIZE: usize = 4 + SyntaxId::SIZE;

    const NAME: &'static str = "ContextElement";

    fn read(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let context_id = src.read_u16();
        let n_transfer_syn = usize::from(src.read_u8());
        ironkms_core::read_padding!(src, 1);

        if n_transfer_syn == 0 {
            return Err(invalid_field_err!("n_transfer_syn", "no transfer syntax proposed"));
        }

        let abstract_syntax = SyntaxId::read(src)?;

        let mut transfer_syntaxes = Vec::with_capacity(n_transfer_syn);
        for _ in 0..n_transfer_syn {
            transfer_syntaxes.push(SyntaxId::read(src)?);
        }

        Ok(Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes,
        })
    }

    fn write(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let n_transfer_syn: u8 = {
            let result: Result<u8, EncodeError> = cast_length!("n_transfer_syn", self.transfer_syntaxes.len());
            result?
        };

        dst.write_u16(self.context_id);
        dst.write_u8(n_transfer_syn);
        ironkms_core::write_padding!(dst, 1);
        self.abstract_syntax.write(dst);
        for syntax in &self.transfer_syntaxes {
            syntax.write(dst);
        }

        Ok(())
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.transfer_syntaxes.len() * SyntaxId::SIZE
    }
}

/// Bind PDU body (packet type 0x0B).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group: u32,
    pub contexts: Vec<ContextElement>,
}

impl Bind {
    pub const NAME: &'static str = "Bind";

    const FIXED_PART_SIZE: usize = 12;
}

impl Encode for Bind {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        dst.write_u16(self.max_xmit_frag);
        dst.write_u16(self.max_recv_frag);
        dst.write_u32(self.assoc_group);

        let n_context_elem: u8 = {
            let result: Result<u8, EncodeError> = cast_length!("n_context_elem", self.contexts.len());
            result?
        };
        dst.write_u8(n_context_elem);
        ironkms_core::write_padding!(dst, 3);

        for context in &self.contexts {
            context.write(dst)?;
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.contexts.iter().map(ContextElement::size).sum::<usize>()
    }
}

impl<'de> Decode<'de> for Bind {
    fn decode(src: &mut ReadCursor<'de>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let max_xmit_frag = src.read_u16();
        let max_recv_frag = src.read_u16();
        let assoc_group = src.read_u32();
        let n_context_elem = usize::from(src.read_u8());
        ironkms_core::read_padding!(src, 3);

        let mut contexts = Vec::with_capacity(n_context_elem);
        for _ in 0..n_context_elem {
            contexts.push(ContextElement::read(src)?);
        }

        Ok(Self {
            max_xmit_frag,
            max_recv_frag,
            assoc_group,
            contexts,
        })
    }
}

/// Presentation context negotiation result code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ContextResultCode(u16);

impl ContextResultCode {
    pub const ACCEPTANCE: Self = Self(0);
    pub const USER_REJECTION: Self = Self(1);
    pub const PROVIDER_REJECTION: Self = Self(2);

    /// Provider rejection reason: abstract syntax not supported.
    pub const REASON_ABSTRACT_SYNTAX: u16 = 1;
    /// Provider rejection reason: no proposed transfer syntax supported.
    pub const REASON_TRANSFER_SYNTAXES: u16 = 2;
}

impl From<u16> for ContextResultCode {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<ContextResultCode> for u16 {
    fn from(value: ContextResultCode) -> Self {
        value.0
    }
}

/// Outcome for one proposed presentation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextResult {
    pub result: ContextResultCode,
    pub reason: u16,
    pub transfer_syntax: SyntaxId,
}

impl ContextResult {
    const SIZE: usize = 4 + SyntaxId::SIZE;

    fn accepted(transfer_syntax: SyntaxId) -> Self {
        Self {
            result: ContextResultCode::ACCEPTANCE,
            reason: 0,
            transfer_syntax,
        }
    }

    fn rejected(reason: u16) -> Self {
        Self {
            result: ContextResultCode::PROVIDER_REJECTION,
            reason,
            transfer_syntax: SyntaxId::NIL,
        }
    }
}

/// BindAck PDU body (packet type 0x0C).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAck {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group: u32,
    /// Secondary address, conventionally the listening port as text.
    pub sec_addr: String,
    pub results: Vec<ContextResult>,
}

impl BindAck {
    pub const NAME: &'static str = "BindAck";

    const FIXED_PART_SIZE: usize = 8;

    fn sec_addr_wire_len(&self) -> usize {
        // length prefix + text + NUL
        2 + self.sec_addr.len() + 1
    }

    fn sec_addr_padding(&self) -> usize {
        (4 - self.sec_addr_wire_len() % 4) % 4
    }
}

impl Encode for BindAck {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        if !self.sec_addr.is_ascii() {
            return Err(invalid_field_err!("sec_addr", "must be ASCII"));
        }

        dst.write_u16(self.max_xmit_frag);
        dst.write_u16(self.max_recv_frag);
        dst.write_u32(self.assoc_group);

        let addr_len: u16 = {
            let result: Result<u16, EncodeError> = cast_length!("sec_addr", self.sec_addr.len() + 1);
            result?
        };
        dst.write_u16(addr_len);
        dst.write_slice(self.sec_addr.as_bytes());
        dst.write_u8(0);
        for _ in 0..self.sec_addr_padding() {
            dst.write_u8(0);
        }

        let n_results: u8 = {
            let result: Result<u8, EncodeError> = cast_length!("n_results", self.results.len());
            result?
        };
        dst.write_u8(n_results);
        ironkms_core::write_padding!(dst, 3);

        for result in &self.results {
            dst.write_u16(result.result.into());
            dst.write_u16(result.reason);
            result.transfer_syntax.write(dst);
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
            + self.sec_addr_wire_len()
            + self.sec_addr_padding()
            + 4
            + self.results.len() * ContextResult::SIZE
    }
}

impl<'de> Decode<'de> for BindAck {
    fn decode(src: &mut ReadCursor<'de>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let max_xmit_frag = src.read_u16();
        let max_recv_frag = src.read_u16();
        let assoc_group = src.read_u32();

        ensure_size!(in: src, size: 2);
        let addr_len = usize::from(src.read_u16());
        if addr_len == 0 {
            return Err(invalid_field_err!("sec_addr", "empty address"));
        }
        ensure_size!(in: src, size: addr_len);
        let addr_bytes = src.read_slice(addr_len);
        if addr_bytes[addr_len - 1] != 0 {
            return Err(invalid_field_err!("sec_addr", "missing NUL terminator"));
        }
        let sec_addr = core::str::from_utf8(&addr_bytes[..addr_len - 1])
            .map_err(|e| {
                let err: DecodeError = invalid_field_err!("sec_addr", "not valid ASCII");
                err.with_source(e)
            })?
            .to_owned();

        let padding = (4 - (2 + addr_len) % 4) % 4;
        ensure_size!(in: src, size: padding + 4);
        ironkms_core::read_padding!(src, padding);

        let n_results = usize::from(src.read_u8());
        ironkms_core::read_padding!(src, 3);

        let mut results = Vec::with_capacity(n_results);
        for _ in 0..n_results {
            ensure_size!(in: src, size: ContextResult::SIZE);
            let result = ContextResultCode::from(src.read_u16());
            let reason = src.read_u16();
            let transfer_syntax = SyntaxId::read(src)?;
            results.push(ContextResult {
                result,
                reason,
                transfer_syntax,
            });
        }

        Ok(Self {
            max_xmit_frag,
            max_recv_frag,
            assoc_group,
            sec_addr,
            results,
        })
    }
}

/// Negotiates a [`BindAck`] for an incoming [`Bind`].
///
/// Any `call_id` is accepted; fragment sizes echo the client values
/// capped at [`MAX_FRAG_SIZE`]. A context is accepted when it names the
/// KMS activation interface with the NDR transfer syntax.
pub fn negotiate_bind(bind: &Bind, sec_addr: impl Into<String>) -> BindAck {
    let results = bind
        .contexts
        .iter()
        .map(|context| {
            if context.abstract_syntax != KMS_INTERFACE_ID {
                ContextResult::rejected(ContextResultCode::REASON_ABSTRACT_SYNTAX)
            } else if context.transfer_syntaxes.contains(&NDR_TRANSFER_SYNTAX) {
                ContextResult::accepted(NDR_TRANSFER_SYNTAX)
            } else {
                ContextResult::rejected(ContextResultCode::REASON_TRANSFER_SYNTAXES)
            }
        })
        .collect();

    BindAck {
        max_xmit_frag: bind.max_xmit_frag.min(MAX_FRAG_SIZE),
        max_recv_frag: bind.max_recv_frag.min(MAX_FRAG_SIZE),
        assoc_group: if bind.assoc_group != 0 {
            bind.assoc_group
        } else {
            DEFAULT_ASSOC_GROUP
        },
        sec_addr: sec_addr.into(),
        results,
    }
}
