//! Foundation for the wire codecs of this workspace: byte cursors over
//! caller-owned buffers, the [`Encode`] / [`Decode`] traits, and the
//! error kinds shared by every message definition.

#[macro_use]
mod macros;

mod cursor;
mod decode;
mod encode;

pub use crate::cursor::{ReadCursor, WriteCursor};
pub use crate::decode::{DecodeError, DecodeErrorKind, DecodeResult};
pub use crate::encode::{EncodeError, EncodeErrorKind, EncodeResult};

/// Creation of an error signaling a buffer too small for the operation.
pub trait NotEnoughBytesErr {
    /// Creates an error with the `NotEnoughBytes` kind.
    fn not_enough_bytes(context: &'static str, received: usize, expected: usize) -> Self;
}

/// Creation of an error signaling an invalid field.
pub trait InvalidFieldErr {
    /// Creates an error with the `InvalidField` kind.
    fn invalid_field(context: &'static str, field: &'static str, reason: &'static str) -> Self;
}

/// Creation of an error signaling an unexpected message type.
pub trait UnexpectedMessageTypeErr {
    /// Creates an error with the `UnexpectedMessageType` kind.
    fn unexpected_message_type(context: &'static str, got: u8) -> Self;
}

/// Creation of an error signaling an unsupported protocol version.
pub trait UnsupportedVersionErr {
    /// Creates an error with the `UnsupportedVersion` kind.
    fn unsupported_version(context: &'static str, got: u16) -> Self;
}

/// Creation of an error not falling in any other category.
pub trait OtherErr {
    /// Creates an error with the `Other` kind.
    fn other(context: &'static str, description: &'static str) -> Self;
}

/// A message that can be encoded into its binary form.
///
/// The resulting binary payload is a fully encoded message that may be
/// sent to the peer. This trait is object-safe and may be used in a
/// dynamic context.
pub trait Encode {
    /// Encodes this message in-place using the provided `WriteCursor`.
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()>;

    /// Returns the name associated to this message.
    fn name(&self) -> &'static str;

    /// Computes the size in bytes for this message.
    fn size(&self) -> usize;
}

assert_obj_safe!(Encode);

/// Encodes the given message in-place into the provided buffer and returns the number of bytes written.
pub fn encode<T>(msg: &T, dst: &mut [u8]) -> EncodeResult<usize>
where
    T: Encode + ?Sized,
{
    let mut cursor = WriteCursor::new(dst);
    encode_cursor(msg, &mut cursor)?;
    Ok(cursor.pos())
}

/// Encodes the given message in-place using the provided `WriteCursor`.
pub fn encode_cursor<T>(msg: &T, dst: &mut WriteCursor<'_>) -> EncodeResult<()>
where
    T: Encode + ?Sized,
{
    msg.encode(dst)
}

/// Same as `encode` but allocates and returns a new buffer each time.
///
/// This is a convenience function, but it’s not very resource efficient.
pub fn encode_vec<T>(msg: &T) -> EncodeResult<Vec<u8>>
where
    T: Encode + ?Sized,
{
    let msg_size = msg.size();
    let mut buf = vec![0; msg_size];
    let written = encode(msg, buf.as_mut_slice())?;
    debug_assert_eq!(written, msg_size);
    Ok(buf)
}

/// Computes the size in bytes for this message.
pub fn size<T: Encode>(msg: &T) -> usize {
    msg.size()
}

/// A message that can be decoded from a binary input.
///
/// The binary payload must be a full message, not some subset of it.
pub trait Decode<'de>: Sized {
    /// Decodes this message using the provided `ReadCursor`.
    fn decode(src: &mut ReadCursor<'de>) -> DecodeResult<Self>;
}

/// Decodes a message from the binary input.
pub fn decode<'de, T>(src: &'de [u8]) -> DecodeResult<T>
where
    T: Decode<'de>,
{
    let mut cursor = ReadCursor::new(src);
    T::decode(&mut cursor)
}

/// Decodes a message using the provided `ReadCursor`.
pub fn decode_cursor<'de, T>(src: &mut ReadCursor<'de>) -> DecodeResult<T>
where
    T: Decode<'de>,
{
    T::decode(src)
}
