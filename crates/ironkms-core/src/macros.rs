//! Helper macros for message encoding and decoding.
//!
//! The error-builder macros rely on type inference to pick the right
//! error type (`DecodeError` or `EncodeError`), so they work from both
//! sides of a codec.

/// Creates an error with the `NotEnoughBytes` kind.
#[macro_export]
macro_rules! not_enough_bytes_err {
    ( $context:expr, $received:expr , $expected:expr $(,)? ) => {{
        $crate::NotEnoughBytesErr::not_enough_bytes($context, $received, $expected)
    }};
    ( $received:expr , $expected:expr $(,)? ) => {{
        $crate::not_enough_bytes_err!(Self::NAME, $received, $expected)
    }};
}

/// Creates an error with the `InvalidField` kind.
#[macro_export]
macro_rules! invalid_field_err {
    ( $context:expr, $field:expr , $reason:expr $(,)? ) => {{
        $crate::InvalidFieldErr::invalid_field($context, $field, $reason)
    }};
    ( $field:expr , $reason:expr $(,)? ) => {{
        $crate::invalid_field_err!(Self::NAME, $field, $reason)
    }};
}

/// Creates an error with the `UnexpectedMessageType` kind.
#[macro_export]
macro_rules! unexpected_message_type_err {
    ( $context:expr, $got:expr $(,)? ) => {{
        $crate::UnexpectedMessageTypeErr::unexpected_message_type($context, $got)
    }};
    ( $got:expr $(,)? ) => {{
        $crate::unexpected_message_type_err!(Self::NAME, $got)
    }};
}

/// Creates an error with the `UnsupportedVersion` kind.
#[macro_export]
macro_rules! unsupported_version_err {
    ( $context:expr, $got:expr $(,)? ) => {{
        $crate::UnsupportedVersionErr::unsupported_version($context, $got)
    }};
    ( $got:expr $(,)? ) => {{
        $crate::unsupported_version_err!(Self::NAME, $got)
    }};
}

/// Creates an error with the `Other` kind.
#[macro_export]
macro_rules! other_err {
    ( $context:expr, $description:expr $(,)? ) => {{
        $crate::OtherErr::other($context, $description)
    }};
    ( $description:expr $(,)? ) => {{
        $crate::other_err!(Self::NAME, $description)
    }};
}

/// Returns early with a `NotEnoughBytes` error when the buffer is too
/// small for the expected number of bytes.
#[macro_export]
macro_rules! ensure_size {
    (ctx: $ctx:expr, in: $buf:ident, size: $expected:expr) => {{
        let received = $buf.len();
        let expected = $expected;
        if !(received >= expected) {
            return Err($crate::NotEnoughBytesErr::not_enough_bytes($ctx, received, expected));
        }
    }};
    (in: $buf:ident, size: $expected:expr) => {{
        $crate::ensure_size!(ctx: Self::NAME, in: $buf, size: $expected)
    }};
}

/// Same as [`ensure_size!`] for the fixed part of a message (`Self::FIXED_PART_SIZE`).
#[macro_export]
macro_rules! ensure_fixed_part_size {
    (in: $buf:ident) => {{
        $crate::ensure_size!(ctx: Self::NAME, in: $buf, size: Self::FIXED_PART_SIZE)
    }};
}

/// Fallible integer narrowing reported as an `InvalidField` error.
#[macro_export]
macro_rules! cast_length {
    ($ctx:expr, $field:expr, $len:expr) => {{
        $len.try_into().map_err(|e| {
            $crate::InvalidFieldErr::invalid_field($ctx, $field, "too many elements").with_source(e)
        })
    }};
    ($field:expr, $len:expr) => {{
        $crate::cast_length!(Self::NAME, $field, $len)
    }};
}

/// Moves the read cursor, ignoring padding bytes.
#[macro_export]
macro_rules! read_padding {
    ($src:expr, $n:expr) => {{
        $src.advance($n);
    }};
}

/// Writes `$n` zero bytes using as few `write_u*` calls as possible.
#[macro_export]
macro_rules! write_padding {
    ($dst:expr, 1) => {
        $dst.write_u8(0)
    };
    ($dst:expr, 2) => {
        $dst.write_u16(0)
    };
    ($dst:expr, 4) => {
        $dst.write_u32(0)
    };
    ($dst:expr, $n:expr) => {{
        for _ in 0..$n {
            $dst.write_u8(0);
        }
    }};
}

/// Asserts that the traits support dynamic dispatch.
///
/// From <https://docs.rs/static_assertions/1.1.0/src/static_assertions/assert_obj_safe.rs.html#72-76>
#[macro_export]
macro_rules! assert_obj_safe {
    ($($xs:path),+ $(,)?) => {
        $(const _: Option<&dyn $xs> = None;)+
    };
}
