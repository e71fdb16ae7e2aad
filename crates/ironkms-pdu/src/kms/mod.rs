//! KMS message layer: the inner activation request/response shared by
//! all protocol versions, plus the V4/V5/V6 cryptographic envelopes
//! wrapping them on the wire.

mod v4;
mod v5;
mod v6;

use core::fmt;

use ironkms_core::{
    cast_length, decode, encode_vec, ensure_fixed_part_size, ensure_size, invalid_field_err, unsupported_version_err,
    Decode, DecodeError, DecodeResult, Encode, EncodeError, EncodeResult, ReadCursor, WriteCursor,
};
use uuid::Uuid;

use crate::guid::{read_guid, write_guid, GUID_SIZE};
use crate::utf16;

/// KMS protocol version carried in every envelope and inner message.
///
/// The wire order is minor then major, both little-endian.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const V4: Self = Self { major: 4, minor: 0 };
    pub const V5: Self = Self { major: 5, minor: 0 };
    pub const V6: Self = Self { major: 6, minor: 0 };

    pub const SIZE: usize = 4;

    pub const NAME: &'static str = "ProtocolVersion";

    const FIXED_PART_SIZE: usize = Self::SIZE;

    pub fn read(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let minor = src.read_u16();
        let major = src.read_u16();

        Ok(Self { major, minor })
    }

    pub fn write(&self, dst: &mut WriteCursor<'_>) {
        dst.write_u16(self.minor);
        dst.write_u16(self.major);
    }

    /// Reads the version from the first four bytes of an envelope
    /// without consuming them.
    pub fn peek(body: &[u8]) -> DecodeResult<Self> {
        Self::read(&mut ReadCursor::new(body))
    }

    pub fn is_supported(self) -> bool {
        matches!(self, Self::V4 | Self::V5 | Self::V6)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Whether the client reports its product ID as verified.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PidVerification(u32);

impl PidVerification {
    pub const UNVERIFIED: Self = Self(0);
    pub const VERIFIED: Self = Self(1);
}

impl From<u32> for PidVerification {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<PidVerification> for u32 {
    fn from(value: PidVerification) -> Self {
        value.0
    }
}

/// License state reported by the client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LicenseStatus(u32);

impl LicenseStatus {
    pub const UNLICENSED: Self = Self(0);
    pub const ACTIVATED: Self = Self(1);
    pub const GRACE_PERIOD: Self = Self(2);
    pub const OUT_OF_TOLERANCE_GRACE: Self = Self(3);
    pub const NON_GENUINE_GRACE: Self = Self(4);
    pub const NOTIFICATIONS_MODE: Self = Self(5);
    pub const EXTENDED_GRACE: Self = Self(6);

    /// Display name matching the Volume Activation terminology.
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "Unlicensed",
            1 => "Activated",
            2 => "Grace Period",
            3 => "Out-of-Tolerance Grace Period",
            4 => "Non-Genuine Grace Period",
            5 => "Notifications Mode",
            6 => "Extended Grace Period",
            _ => "Unknown",
        }
    }
}

impl From<u32> for LicenseStatus {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<LicenseStatus> for u32 {
    fn from(value: LicenseStatus) -> Self {
        value.0
    }
}

impl fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inner KMS client request, shared by all protocol versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRequest {
    pub version: ProtocolVersion,
    pub is_client_pid_verified: PidVerification,
    pub license_status: LicenseStatus,
    pub graceful_shutdown: u32,
    pub activation_request_count: u32,
    /// Application group the SKU belongs to (Windows, Office, ...).
    pub application_group: Uuid,
    /// Specific SKU being activated.
    pub activation_id: Uuid,
    /// KMS host identity reported by the client.
    pub key_management_id: Uuid,
    /// Client Machine ID.
    pub client_machine_id: Uuid,
    pub required_client_count: u32,
    /// Client wall clock as a FILETIME, echoed in the response.
    pub request_time: u64,
    /// Zero when the machine was never re-imaged.
    pub previous_client_machine_id: Uuid,
    pub machine_name: String,
}

impl ActivationRequest {
    pub const NAME: &'static str = "ActivationRequest";

    /// Everything before the variable-length machine name.
    const FIXED_PART_SIZE: usize = ProtocolVersion::SIZE + 4 * 4 + GUID_SIZE * 4 + 4 + 8 + GUID_SIZE;

    /// Machine names are capped at 64 UTF-16 code units.
    pub const MAX_MACHINE_NAME_UNITS: usize = 64;
}

impl Encode for ActivationRequest {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        let name_units = utf16::utf16le_units(&self.machine_name);
        if name_units > Self::MAX_MACHINE_NAME_UNITS {
            return Err(invalid_field_err!("machine_name", "longer than 64 UTF-16 code units"));
        }

        self.version.write(dst);
        dst.write_u32(self.is_client_pid_verified.into());
        dst.write_u32(self.license_status.into());
        dst.write_u32(self.graceful_shutdown);
        dst.write_u32(self.activation_request_count);
        write_guid(dst, &self.application_group);
        write_guid(dst, &self.activation_id);
        write_guid(dst, &self.key_management_id);
        write_guid(dst, &self.client_machine_id);
        dst.write_u32(self.required_client_count);
        dst.write_u64(self.request_time);
        write_guid(dst, &self.previous_client_machine_id);

        let name_units: u16 = {
            let result: Result<u16, EncodeError> = cast_length!("machine_name", name_units);
            result?
        };
        dst.write_u16(name_units);
        dst.write_slice(&utf16::encode_utf16le(&self.machine_name));

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + 2 + utf16::utf16le_units(&self.machine_name) * 2
    }
}

impl<'de> Decode<'de> for ActivationRequest {
    fn decode(src: &mut ReadCursor<'de>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let version = ProtocolVersion::read(src)?;
        let is_client_pid_verified = PidVerification::from(src.read_u32());
        let license_status = LicenseStatus::from(src.read_u32());
        let graceful_shutdown = src.read_u32();
        let activation_request_count = src.read_u32();
        let application_group = read_guid(src)?;
        let activation_id = read_guid(src)?;
        let key_management_id = read_guid(src)?;
        let client_machine_id = read_guid(src)?;
        let required_client_count = src.read_u32();
        let request_time = src.read_u64();
        let previous_client_machine_id = read_guid(src)?;

        ensure_size!(in: src, size: 2);
        let name_units = usize::from(src.read_u16());
        if name_units > Self::MAX_MACHINE_NAME_UNITS {
            return Err(invalid_field_err!("machine_name", "longer than 64 UTF-16 code units"));
        }
        ensure_size!(in: src, size: name_units * 2);
        let machine_name = utf16::decode_utf16le(src.read_slice(name_units * 2))?;

        Ok(Self {
            version,
            is_client_pid_verified,
            license_status,
            graceful_shutdown,
            activation_request_count,
            application_group,
            activation_id,
            key_management_id,
            client_machine_id,
            required_client_count,
            request_time,
            previous_client_machine_id,
            machine_name,
        })
    }
}

/// Inner KMS response, shared by all protocol versions.
///
/// `client_machine_id`, `response_time` and `version` always echo the
/// request exactly; the remaining fields are server policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationResponse {
    pub version: ProtocolVersion,
    /// ePKey ID issued by this host, at most 31 UTF-16 code units.
    pub kms_epid: String,
    pub client_machine_id: Uuid,
    /// Echo of the request FILETIME; clients bound clock skew with it.
    pub response_time: u64,
    /// Count of activated machines this host reports.
    pub activated_machines: u32,
    /// Minutes between activation attempts.
    pub activation_interval: u32,
    /// Minutes between renewal attempts.
    pub renewal_interval: u32,
    /// Host identifier digest; present in V6 responses only.
    pub kms_host_id: Option<[u8; 16]>,
}

impl ActivationResponse {
    pub const NAME: &'static str = "ActivationResponse";

    const FIXED_PART_SIZE: usize = ProtocolVersion::SIZE + 4;

    /// EPID payload cap, terminator excluded (32 wide chars with it).
    pub const MAX_EPID_UNITS: usize = 31;

    fn epid_wire_len(&self) -> usize {
        // NUL terminator included.
        (utf16::utf16le_units(&self.kms_epid) + 1) * 2
    }

    fn has_host_id(&self) -> bool {
        self.version.major == 6
    }
}

impl Encode for ActivationResponse {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(in: dst, size: self.size());

        if utf16::utf16le_units(&self.kms_epid) > Self::MAX_EPID_UNITS {
            return Err(invalid_field_err!("kms_epid", "longer than 31 UTF-16 code units"));
        }
        if self.has_host_id() != self.kms_host_id.is_some() {
            return Err(invalid_field_err!("kms_host_id", "present exactly when the version is 6"));
        }

        self.version.write(dst);
        let epid_len: u32 = {
            let result: Result<u32, EncodeError> = cast_length!("kms_epid", self.epid_wire_len());
            result?
        };
        dst.write_u32(epid_len);
        dst.write_slice(&utf16::encode_utf16le(&self.kms_epid));
        dst.write_u16(0);
        write_guid(dst, &self.client_machine_id);
        dst.write_u64(self.response_time);
        dst.write_u32(self.activated_machines);
        dst.write_u32(self.activation_interval);
        dst.write_u32(self.renewal_interval);
        if let Some(host_id) = self.kms_host_id {
            dst.write_array(host_id);
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
            + self.epid_wire_len()
            + GUID_SIZE
            + 8
            + 4 * 3
            + if self.has_host_id() { 16 } else { 0 }
    }
}

impl<'de> Decode<'de> for ActivationResponse {
    fn decode(src: &mut ReadCursor<'de>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);

        let version = ProtocolVersion::read(src)?;

        let epid_len = src.read_u32() as usize;
        if epid_len < 2 || epid_len % 2 != 0 || epid_len > (Self::MAX_EPID_UNITS + 1) * 2 {
            return Err(invalid_field_err!("epid_len", "out of range"));
        }
        ensure_size!(in: src, size: epid_len);
        let epid_bytes = src.read_slice(epid_len);
        let (payload, terminator) = epid_bytes.split_at(epid_len - 2);
        if terminator != [0, 0] {
            return Err(invalid_field_err!("kms_epid", "missing NUL terminator"));
        }
        let kms_epid = utf16::decode_utf16le(payload)?;

        ensure_size!(in: src, size: GUID_SIZE + 8 + 4 * 3);
        let client_machine_id = read_guid(src)?;
        let response_time = src.read_u64();
        let activated_machines = src.read_u32();
        let activation_interval = src.read_u32();
        let renewal_interval = src.read_u32();

        let kms_host_id = if version.major == 6 {
            ensure_size!(in: src, size: 16);
            Some(src.read_array::<16>())
        } else {
            None
        };

        Ok(Self {
            version,
            kms_epid,
            client_machine_id,
            response_time,
            activated_machines,
            activation_interval,
            renewal_interval,
            kms_host_id,
        })
    }
}

/// Envelope authentication failure observed while opening a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// V4 keyed hash over the inner bytes did not match.
    V4HashMismatch,
    /// V5 trailing digest did not match after decryption.
    V5DigestMismatch,
    /// V6 CMAC over the IV and ciphertext did not match.
    V6CmacMismatch,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4HashMismatch => write!(f, "V4 hash mismatch"),
            Self::V5DigestMismatch => write!(f, "V5 digest mismatch"),
            Self::V6CmacMismatch => write!(f, "V6 CMAC mismatch"),
        }
    }
}

/// Failure to open a sealed KMS message.
#[derive(Debug, thiserror::Error)]
pub enum KmsOpenError {
    #[error("malformed KMS message")]
    Malformed(#[from] DecodeError),
    #[error("unsupported KMS protocol version {0}")]
    UnsupportedVersion(ProtocolVersion),
    #[error("{0}")]
    Auth(AuthFailure),
}

/// Seals an activation request into its versioned wire envelope.
pub fn seal_request(request: &ActivationRequest) -> EncodeResult<Vec<u8>> {
    let inner = encode_vec(request)?;
    seal(request.version, &inner)
}

/// Seals an activation response into its versioned wire envelope.
pub fn seal_response(response: &ActivationResponse) -> EncodeResult<Vec<u8>> {
    let inner = encode_vec(response)?;
    seal(response.version, &inner)
}

fn seal(version: ProtocolVersion, inner: &[u8]) -> EncodeResult<Vec<u8>> {
    match version.major {
        4 => Ok(v4::seal(inner)),
        5 => Ok(v5::seal(version, inner)),
        6 => Ok(v6::seal(version, inner)),
        other => Err(unsupported_version_err!("KMS envelope", other)),
    }
}

/// Opens a sealed activation request: dispatches on the version header,
/// verifies the envelope, and decodes the inner message.
pub fn open_request(body: &[u8]) -> Result<ActivationRequest, KmsOpenError> {
    let inner = open(body)?;
    let request: ActivationRequest = decode(&inner)?;
    check_inner_version(body, request.version)?;
    Ok(request)
}

/// Opens a sealed activation response, performing the same verification
/// a client would (used by the self-test client and the test suite).
pub fn open_response(body: &[u8]) -> Result<ActivationResponse, KmsOpenError> {
    let inner = open(body)?;
    let response: ActivationResponse = decode(&inner)?;
    check_inner_version(body, response.version)?;
    Ok(response)
}

fn open(body: &[u8]) -> Result<Vec<u8>, KmsOpenError> {
    let version = ProtocolVersion::peek(body)?;
    if !version.is_supported() {
        return Err(KmsOpenError::UnsupportedVersion(version));
    }
    match version.major {
        4 => v4::open(body),
        5 => v5::open(body),
        _ => v6::open(body),
    }
}

// The envelope header must agree with the protected inner message.
fn check_inner_version(body: &[u8], inner_version: ProtocolVersion) -> Result<(), KmsOpenError> {
    let envelope_version = ProtocolVersion::peek(body)?;
    if envelope_version != inner_version {
        return Err(KmsOpenError::Malformed(invalid_field_err!(
            "KMS envelope",
            "version",
            "envelope and inner version differ"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironkms_core::encode_vec;
    use uuid::uuid;

    fn sample_request(version: ProtocolVersion) -> ActivationRequest {
        ActivationRequest {
            version,
            is_client_pid_verified: PidVerification::UNVERIFIED,
            license_status: LicenseStatus::GRACE_PERIOD,
            graceful_shutdown: 0,
            activation_request_count: 1,
            application_group: uuid!("55c92734-d682-4d71-983e-d6ec3f16059f"),
            activation_id: uuid!("2de67392-b7a7-462a-b1ca-108dd189f588"),
            key_management_id: uuid!("58e2134c-8abd-4099-8af0-ebdcc3b1b7a9"),
            client_machine_id: uuid!("00112233-4455-6677-8899-aabbccddeeff"),
            required_client_count: 25,
            request_time: 132_000_000_000_000_000,
            previous_client_machine_id: Uuid::nil(),
            machine_name: "WIN-TEST".to_owned(),
        }
    }

    fn sample_response(version: ProtocolVersion) -> ActivationResponse {
        ActivationResponse {
            version,
            kms_epid: "03612051234560301033.1555526400".to_owned(),
            client_machine_id: uuid!("00112233-4455-6677-8899-aabbccddeeff"),
            response_time: 132_000_000_000_000_000,
            activated_machines: 50,
            activation_interval: 120,
            renewal_interval: 10080,
            kms_host_id: (version.major == 6).then_some([0xAB; 16]),
        }
    }

    #[test]
    fn request_inner_round_trip() {
        let request = sample_request(ProtocolVersion::V6);
        let encoded = encode_vec(&request).unwrap();
        assert_eq!(encoded.len(), request.size());

        let decoded: ActivationRequest = decode(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn response_inner_round_trip_all_versions() {
        for version in [ProtocolVersion::V4, ProtocolVersion::V5, ProtocolVersion::V6] {
            let response = sample_response(version);
            let encoded = encode_vec(&response).unwrap();
            assert_eq!(encoded.len(), response.size());

            let decoded: ActivationResponse = decode(&encoded).unwrap();
            assert_eq!(decoded, response);
        }
    }

    #[test]
    fn sealed_request_round_trip_all_versions() {
        for version in [ProtocolVersion::V4, ProtocolVersion::V5, ProtocolVersion::V6] {
            let request = sample_request(version);
            let sealed = seal_request(&request).unwrap();
            let opened = open_request(&sealed).unwrap();
            assert_eq!(opened, request);
        }
    }

    #[test]
    fn sealed_response_round_trip_all_versions() {
        for version in [ProtocolVersion::V4, ProtocolVersion::V5, ProtocolVersion::V6] {
            let response = sample_response(version);
            let sealed = seal_response(&response).unwrap();
            let opened = open_response(&sealed).unwrap();
            assert_eq!(opened, response);
        }
    }

    #[test]
    fn v5_ciphertext_differs_from_plaintext() {
        let response = sample_response(ProtocolVersion::V5);
        let inner = encode_vec(&response).unwrap();
        let sealed = seal_response(&response).unwrap();

        // version || salt || rc4 stream, digest included
        assert_eq!(sealed.len(), 4 + 16 + inner.len() + 16);
        assert!(!sealed.windows(inner.len().min(24)).any(|w| w == &inner[..inner.len().min(24)]));
    }

    #[test]
    fn v6_payload_is_block_aligned() {
        let request = sample_request(ProtocolVersion::V6);
        let sealed = seal_request(&request).unwrap();
        let payload_len = sealed.len() - 4 - 16 - 16;
        assert_eq!(payload_len % 16, 0);
    }

    #[test]
    fn v4_tampering_is_detected() {
        let request = sample_request(ProtocolVersion::V4);
        let mut sealed = seal_request(&request).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(
            open_request(&sealed),
            Err(KmsOpenError::Auth(AuthFailure::V4HashMismatch))
        ));
    }

    #[test]
    fn v5_tampering_is_detected() {
        let request = sample_request(ProtocolVersion::V5);
        let mut sealed = seal_request(&request).unwrap();
        // Flip a keystream byte past the salt.
        sealed[24] ^= 0x80;

        assert!(matches!(
            open_request(&sealed),
            Err(KmsOpenError::Auth(AuthFailure::V5DigestMismatch))
        ));
    }

    #[test]
    fn v6_tampering_is_detected() {
        let request = sample_request(ProtocolVersion::V6);
        let mut sealed = seal_request(&request).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(
            open_request(&sealed),
            Err(KmsOpenError::Auth(AuthFailure::V6CmacMismatch))
        ));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut body = encode_vec(&sample_request(ProtocolVersion::V4)).unwrap();
        // major = 7
        body[2] = 7;
        assert!(matches!(open_request(&body), Err(KmsOpenError::UnsupportedVersion(_))));
    }

    #[test]
    fn overlong_machine_name_is_rejected() {
        let mut request = sample_request(ProtocolVersion::V4);
        request.machine_name = "x".repeat(65);
        assert!(encode_vec(&request).is_err());
    }

    #[test]
    fn license_status_names() {
        assert_eq!(LicenseStatus::ACTIVATED.name(), "Activated");
        assert_eq!(LicenseStatus::from(42).name(), "Unknown");
        assert_eq!(u32::from(LicenseStatus::from(42)), 42);
    }
}
