//! GUID wire form.
//!
//! GUIDs are canonical [`Uuid`]s in memory; on the wire the first three
//! fields are little-endian and the last two big-endian (the Microsoft
//! mixed form).

use ironkms_core::{ensure_size, DecodeResult, ReadCursor, WriteCursor};
use uuid::Uuid;

/// Encoded size of a GUID.
pub const GUID_SIZE: usize = 16;

/// Reads a mixed-endian GUID into its canonical form.
pub fn read_guid(src: &mut ReadCursor<'_>) -> DecodeResult<Uuid> {
    ensure_size!(ctx: "GUID", in: src, size: GUID_SIZE);
    Ok(Uuid::from_bytes_le(src.read_array::<16>()))
}

/// Writes a canonical GUID in its mixed-endian wire form.
pub fn write_guid(dst: &mut WriteCursor<'_>, guid: &Uuid) {
    dst.write_array(guid.to_bytes_le());
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::uuid;

    #[test]
    fn wire_form_is_mixed_endian() {
        let id = uuid!("51c82175-844e-4750-b0d8-ec255555bc06");

        let mut buf = [0u8; GUID_SIZE];
        let mut dst = WriteCursor::new(&mut buf);
        write_guid(&mut dst, &id);

        // Fields 1-3 little-endian, fields 4-5 big-endian.
        assert_eq!(
            buf,
            [0x75, 0x21, 0xC8, 0x51, 0x4E, 0x84, 0x50, 0x47, 0xB0, 0xD8, 0xEC, 0x25, 0x55, 0x55, 0xBC, 0x06]
        );
    }

    #[test]
    fn round_trip() {
        let id = uuid!("00112233-4455-6677-8899-aabbccddeeff");

        let mut buf = [0u8; GUID_SIZE];
        write_guid(&mut WriteCursor::new(&mut buf), &id);
        let decoded = read_guid(&mut ReadCursor::new(&buf)).unwrap();

        assert_eq!(decoded, id);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let buf = [0u8; 3];
        assert!(read_guid(&mut ReadCursor::new(&buf)).is_err());
    }
}
