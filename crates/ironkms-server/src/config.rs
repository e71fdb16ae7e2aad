//! Immutable server configuration, fixed for the lifetime of the
//! process and shared by reference into every session.

use core::fmt;
use core::str::FromStr;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default KMS listening port.
pub const DEFAULT_PORT: u16 = 1688;

/// Default fixed HWID, as shipped by the reference emulator.
pub const DEFAULT_HWID: Hwid = Hwid::Fixed([0x36, 0x4F, 0x46, 0x3A, 0x88, 0x63, 0xD3, 0x5F]);

/// Source of the 8-byte host hardware identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Hwid {
    /// A fixed value from configuration.
    Fixed([u8; 8]),
    /// Eight random bytes drawn once at startup, not persisted.
    Random,
}

impl Hwid {
    /// Resolves to the concrete identifier used for this process run.
    pub fn resolve(self) -> [u8; 8] {
        match self {
            Self::Fixed(bytes) => bytes,
            Self::Random => ironkms_crypto::rand_array::<8>(),
        }
    }
}

/// HWID strings are 16 hex digits or the literal `RANDOM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwidParseError(String);

impl fmt::Display for HwidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid HWID {:?}: expected 16 hex digits or RANDOM", self.0)
    }
}

impl std::error::Error for HwidParseError {}

impl FromStr for Hwid {
    type Err = HwidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("random") {
            return Ok(Self::Random);
        }

        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HwidParseError(s.to_owned()));
        }

        let mut bytes = [0u8; 8];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hex = core::str::from_utf8(chunk).expect("hex digit pair");
            bytes[i] = u8::from_str_radix(hex, 16).expect("validated hex digit pair");
        }

        Ok(Self::Fixed(bytes))
    }
}

/// Immutable configuration record consumed by the engine.
#[derive(Debug, Clone)]
pub struct KmsServerOptions {
    /// Listening address; `0.0.0.0` or `::` bind all interfaces.
    pub addr: SocketAddr,
    /// EPID override; when absent EPIDs are derived per application
    /// group and kept stable per client machine.
    pub epid: Option<String>,
    /// Host hardware identifier source.
    pub hwid: Hwid,
    /// Language used in derived EPIDs.
    pub lcid: u16,
    /// Reported activated-machine count floor.
    pub client_count: u16,
    /// Response activation interval, minutes.
    pub activation_interval: u32,
    /// Response renewal interval, minutes.
    pub renewal_interval: u32,
    /// Per-session read-idle timeout; blocking reads when unset.
    pub timeout_idle: Option<Duration>,
    /// How long in-flight sessions may finish after a graceful
    /// shutdown is requested.
    pub shutdown_grace: Duration,
}

impl Default for KmsServerOptions {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            epid: None,
            hwid: DEFAULT_HWID,
            lcid: 1033,
            client_count: 50,
            activation_interval: 120,
            renewal_interval: 10080,
            timeout_idle: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
