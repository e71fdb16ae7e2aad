//! Shared fixtures for the workspace tests: well-known catalog UUIDs,
//! request builders, an event-collecting sink, and a synthetic client
//! speaking just enough DCE/RPC to drive a live server.

mod client;

pub use client::{encode_pdu_with_flags, Exchange, TestClient};

use std::sync::Mutex;

use ironkms_pdu::kms::{ActivationRequest, LicenseStatus, PidVerification, ProtocolVersion};
use ironkms_server::{EventSink, KmsEvent};
use uuid::{uuid, Uuid};

pub const WINDOWS_GROUP: Uuid = uuid!("55c92734-d682-4d71-983e-d6ec3f16059f");
pub const OFFICE_GROUP: Uuid = uuid!("0ff1ce15-a989-479d-af46-f275c6370663");

pub const WINDOWS_PRO_SKU: Uuid = uuid!("2de67392-b7a7-462a-b1ca-108dd189f588");
pub const OFFICE_2016_SKU: Uuid = uuid!("d450596f-894d-49e0-966a-fd39ed4c4c64");
pub const UNKNOWN_SKU: Uuid = uuid!("00000000-0000-0000-0000-000000000001");

pub const SAMPLE_CMID: Uuid = uuid!("00112233-4455-6677-8899-aabbccddeeff");
pub const SAMPLE_REQUEST_TIME: u64 = 132_000_000_000_000_000;

/// A plausible Windows client request for the given version and SKU.
pub fn sample_request(version: ProtocolVersion, group: Uuid, sku: Uuid, cmid: Uuid) -> ActivationRequest {
    ActivationRequest {
        version,
        is_client_pid_verified: PidVerification::UNVERIFIED,
        license_status: LicenseStatus::GRACE_PERIOD,
        graceful_shutdown: 0,
        activation_request_count: 1,
        application_group: group,
        activation_id: sku,
        key_management_id: uuid!("58e2134c-8abd-4099-8af0-ebdcc3b1b7a9"),
        client_machine_id: cmid,
        required_client_count: 25,
        request_time: SAMPLE_REQUEST_TIME,
        previous_client_machine_id: Uuid::nil(),
        machine_name: "WIN-TESTCLIENT".to_owned(),
    }
}

/// Event sink collecting everything for later assertions.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<KmsEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<KmsEvent> {
        self.events.lock().expect("sink mutex poisoned").clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &KmsEvent) {
        self.events.lock().expect("sink mutex poisoned").push(event.clone());
    }
}

/// Byte-for-byte equality with hex output on mismatch.
#[macro_export]
macro_rules! assert_eq_hex {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    panic!(
                        "assertion failed: `(left == right)`\n  left: `{:02X?}`,\n right: `{:02X?}`",
                        &*left_val, &*right_val
                    )
                }
            }
        }
    }};
}
