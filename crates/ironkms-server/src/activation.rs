//! Per-request activation policy: envelope verification, catalog
//! naming, EPID assignment, activated-count reporting, bookkeeping.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use ironkms_catalog::Catalog;
use ironkms_crypto::sha256;
use ironkms_pdu::kms::{self, ActivationRequest, ActivationResponse, AuthFailure, KmsOpenError};
use ironkms_pdu::filetime;
use ironkms_store::{ActivationStore, RequestRecord};
use rand::rngs::OsRng;
use rand::Rng as _;
use uuid::Uuid;

use crate::config::KmsServerOptions;
use crate::event::{EventSink, KmsEvent, ProtocolErrorKind};
use crate::SessionError;

/// EPID prefix used when the application group is not in the catalog.
const FALLBACK_PID_PREFIX: &str = "03612";

/// Everything a session needs to answer activation calls. Shared
/// read-only across sessions; the EPID assignment map is the only
/// mutable state.
pub(crate) struct ActivationEngine {
    options: Arc<KmsServerOptions>,
    catalog: Arc<Catalog>,
    store: Option<ActivationStore>,
    sink: Arc<dyn EventSink>,
    kms_host_id: [u8; 16],
    epids: Mutex<HashMap<(Uuid, Uuid), String>>,
}

impl ActivationEngine {
    pub(crate) fn new(
        options: Arc<KmsServerOptions>,
        catalog: Arc<Catalog>,
        store: Option<ActivationStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let hwid = options.hwid.resolve();

        Self {
            options,
            catalog,
            store,
            sink,
            kms_host_id: derive_host_id(&hwid),
            epids: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn emit(&self, event: KmsEvent) {
        self.sink.emit(&event);
    }

    pub(crate) fn emit_protocol_error(&self, peer: SocketAddr, kind: ProtocolErrorKind, details: String) {
        self.emit(KmsEvent::ProtocolError { peer, kind, details });
    }

    /// Serves one activation call: opens the envelope, applies policy,
    /// persists bookkeeping, and returns the sealed response bytes.
    pub(crate) async fn handle_activation(&self, peer: SocketAddr, envelope: &[u8]) -> Result<Vec<u8>, SessionError> {
        let request = match kms::open_request(envelope) {
            Ok(request) => request,
            Err(error) => {
                let kind = protocol_kind(&error);
                self.emit_protocol_error(peer, kind, error.to_string());
                return Err(SessionError::Protocol(kind));
            }
        };

        let app_group = &request.application_group;
        if self.catalog.group(app_group).is_none() {
            tracing::debug!(%app_group, "application group not in catalog, using hex name");
        }
        if self.catalog.sku(&request.activation_id).is_none() {
            tracing::debug!(sku = %request.activation_id, "SKU not in catalog, using hex name");
        }

        self.emit(KmsEvent::RequestAccepted {
            peer,
            cmid: request.client_machine_id,
            version: request.version,
            app_group: self.catalog.app_name(app_group),
            sku: self.catalog.sku_name(&request.activation_id),
            request_time: request.request_time,
            client_count: request.required_client_count,
            machine_name: request.machine_name.clone(),
            license_status: request.license_status.name(),
        });

        let activated_machines = self.activated_count(&request);
        let epid = self.epid_for(&request).await;

        if let Some(store) = &self.store {
            let record = RequestRecord {
                cmid: request.client_machine_id,
                app_group: request.application_group,
                sku: request.activation_id,
                epid: epid.clone(),
                request_time: request.request_time,
            };
            // Storage failure never reaches the client.
            if let Err(error) = store.record_request(record).await {
                self.emit(KmsEvent::StorageError {
                    cmid: request.client_machine_id,
                    kind: error.kind(),
                });
            }
        }

        let response = ActivationResponse {
            version: request.version,
            kms_epid: epid.clone(),
            client_machine_id: request.client_machine_id,
            response_time: request.request_time,
            activated_machines,
            activation_interval: self.options.activation_interval,
            renewal_interval: self.options.renewal_interval,
            kms_host_id: (request.version.major == 6).then_some(self.kms_host_id),
        };

        let sealed = kms::seal_response(&response)?;

        self.emit(KmsEvent::ResponseSent {
            peer,
            cmid: request.client_machine_id,
            epid,
            activated_count: activated_machines,
        });

        Ok(sealed)
    }

    /// Reported count: whatever the client requires, lifted to the
    /// group threshold and the configured figure.
    fn activated_count(&self, request: &ActivationRequest) -> u32 {
        request
            .required_client_count
            .max(self.catalog.min_clients(&request.application_group))
            .max(u32::from(self.options.client_count))
    }

    /// EPID for this (client machine, application group) pair: the
    /// configured override, a previous assignment (memory, then store),
    /// or a freshly derived one, which then sticks.
    async fn epid_for(&self, request: &ActivationRequest) -> String {
        if let Some(forced) = &self.options.epid {
            return clamp_epid(forced);
        }

        let key = (request.client_machine_id, request.application_group);

        if let Some(existing) = self.epids.lock().expect("EPID map poisoned").get(&key) {
            return existing.clone();
        }

        if let Some(store) = &self.store {
            if let Ok(Some(saved)) = store.lookup_epid(key.0, key.1).await {
                return self
                    .epids
                    .lock()
                    .expect("EPID map poisoned")
                    .entry(key)
                    .or_insert(saved)
                    .clone();
            }
        }

        let prefix = self
            .catalog
            .pid_prefix(&request.application_group)
            .unwrap_or(FALLBACK_PID_PREFIX);
        let fresh = derive_epid(prefix, self.options.lcid, request.request_time);

        self.epids
            .lock()
            .expect("EPID map poisoned")
            .entry(key)
            .or_insert(fresh)
            .clone()
    }
}

fn derive_host_id(hwid: &[u8; 8]) -> [u8; 16] {
    let mut material = Vec::with_capacity(8 + 9);
    material.extend_from_slice(hwid);
    material.extend_from_slice(b"Microsoft");

    let digest = sha256(&material);
    digest[..16].try_into().expect("truncated digest")
}

/// Derived EPID: group PID prefix, the `05` marker, a random six-digit
/// group activation counter, the `03` volume channel, the LCID padded
/// to five digits, and the request date as ten digits of Unix seconds.
fn derive_epid(pid_prefix: &str, lcid: u16, request_time: u64) -> String {
    let counter: u32 = OsRng.gen_range(0..1_000_000);
    let date = filetime::unix_seconds(request_time).clamp(0, 9_999_999_999);

    format!("{pid_prefix}05{counter:06}03{lcid:05}.{date:010}")
}

/// Overrides are used verbatim, cut at the response field's capacity.
fn clamp_epid(epid: &str) -> String {
    let mut units = 0;
    let mut out = String::new();
    for ch in epid.chars() {
        units += ch.len_utf16();
        if units > ActivationResponse::MAX_EPID_UNITS {
            break;
        }
        out.push(ch);
    }
    out
}

fn protocol_kind(error: &KmsOpenError) -> ProtocolErrorKind {
    match error {
        KmsOpenError::Malformed(_) => ProtocolErrorKind::MalformedPdu,
        KmsOpenError::UnsupportedVersion(_) => ProtocolErrorKind::UnsupportedVersion,
        KmsOpenError::Auth(AuthFailure::V4HashMismatch) => ProtocolErrorKind::BadV4Hash,
        KmsOpenError::Auth(AuthFailure::V5DigestMismatch) => ProtocolErrorKind::BadV5Digest,
        KmsOpenError::Auth(AuthFailure::V6CmacMismatch) => ProtocolErrorKind::BadV6Cmac,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullSink;
    use ironkms_pdu::kms::{LicenseStatus, PidVerification, ProtocolVersion};
    use uuid::uuid;

    const WINDOWS_GROUP: Uuid = uuid!("55c92734-d682-4d71-983e-d6ec3f16059f");
    const OFFICE_GROUP: Uuid = uuid!("0ff1ce15-a989-479d-af46-f275c6370663");
    const PEER: &str = "127.0.0.1:49152";

    fn engine(options: KmsServerOptions) -> ActivationEngine {
        ActivationEngine::new(
            Arc::new(options),
            Arc::new(Catalog::load_embedded().unwrap()),
            None,
            Arc::new(NullSink),
        )
    }

    fn request(version: ProtocolVersion, group: Uuid, cmid: Uuid) -> ActivationRequest {
        ActivationRequest {
            version,
            is_client_pid_verified: PidVerification::UNVERIFIED,
            license_status: LicenseStatus::GRACE_PERIOD,
            graceful_shutdown: 0,
            activation_request_count: 1,
            application_group: group,
            activation_id: uuid!("2de67392-b7a7-462a-b1ca-108dd189f588"),
            key_management_id: uuid!("58e2134c-8abd-4099-8af0-ebdcc3b1b7a9"),
            client_machine_id: cmid,
            required_client_count: 25,
            request_time: 132_000_000_000_000_000,
            previous_client_machine_id: Uuid::nil(),
            machine_name: "WIN-TEST".to_owned(),
        }
    }

    #[test]
    fn count_respects_group_minimum() {
        let engine = engine(KmsServerOptions {
            client_count: 1,
            ..Default::default()
        });

        let mut req = request(ProtocolVersion::V6, WINDOWS_GROUP, Uuid::nil());
        req.required_client_count = 3;

        assert_eq!(engine.activated_count(&req), 25);
    }

    #[test]
    fn count_is_lifted_to_configuration() {
        let engine = engine(KmsServerOptions::default());

        let mut req = request(ProtocolVersion::V5, OFFICE_GROUP, Uuid::nil());
        req.required_client_count = 5;

        assert_eq!(engine.activated_count(&req), 50);
    }

    #[test]
    fn count_follows_demanding_clients() {
        let engine = engine(KmsServerOptions::default());

        let mut req = request(ProtocolVersion::V6, WINDOWS_GROUP, Uuid::nil());
        req.required_client_count = 200;

        assert_eq!(engine.activated_count(&req), 200);
    }

    #[tokio::test]
    async fn epid_is_stable_per_cmid_and_group() {
        let engine = engine(KmsServerOptions::default());
        let cmid = uuid!("00112233-4455-6677-8899-aabbccddeeff");

        let first = engine.epid_for(&request(ProtocolVersion::V6, WINDOWS_GROUP, cmid)).await;
        let second = engine.epid_for(&request(ProtocolVersion::V6, WINDOWS_GROUP, cmid)).await;
        assert_eq!(first, second);

        let office = engine.epid_for(&request(ProtocolVersion::V5, OFFICE_GROUP, cmid)).await;
        assert_ne!(first, office);
    }

    #[tokio::test]
    async fn derived_epid_has_the_documented_shape() {
        let engine = engine(KmsServerOptions::default());
        let cmid = uuid!("11111111-2222-3333-4444-555555555555");

        let epid = engine.epid_for(&request(ProtocolVersion::V6, WINDOWS_GROUP, cmid)).await;

        assert_eq!(epid.len(), 31);
        assert!(epid.starts_with("03612"));
        assert_eq!(&epid[5..7], "05");
        assert_eq!(&epid[13..15], "03");
        assert_eq!(&epid[15..20], "01033");
        assert_eq!(&epid[20..21], ".");
        assert_eq!(&epid[21..], "1555526400");
    }

    #[tokio::test]
    async fn epid_override_wins() {
        let engine = engine(KmsServerOptions {
            epid: Some("12345-67890-123-456789-01-2345-6789.0000-0000000".to_owned()),
            ..Default::default()
        });

        let epid = engine
            .epid_for(&request(ProtocolVersion::V4, WINDOWS_GROUP, Uuid::nil()))
            .await;

        // Verbatim, cut at the field capacity.
        assert_eq!(epid.len(), ActivationResponse::MAX_EPID_UNITS);
        assert!(epid.starts_with("12345-67890-123"));
    }

    #[tokio::test]
    async fn v6_responses_carry_the_host_id() {
        let engine = engine(KmsServerOptions::default());
        let peer: SocketAddr = PEER.parse().unwrap();

        let req = request(ProtocolVersion::V6, WINDOWS_GROUP, uuid!("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee"));
        let sealed = kms::seal_request(&req).unwrap();
        let response_bytes = engine.handle_activation(peer, &sealed).await.unwrap();
        let response = kms::open_response(&response_bytes).unwrap();

        let expected = {
            let hwid = [0x36, 0x4F, 0x46, 0x3A, 0x88, 0x63, 0xD3, 0x5F];
            derive_host_id(&hwid)
        };
        assert_eq!(response.kms_host_id, Some(expected));
        assert_eq!(response.client_machine_id, req.client_machine_id);
        assert_eq!(response.response_time, req.request_time);
    }

    #[tokio::test]
    async fn tampered_request_is_refused() {
        let engine = engine(KmsServerOptions::default());
        let peer: SocketAddr = PEER.parse().unwrap();

        let req = request(ProtocolVersion::V6, WINDOWS_GROUP, Uuid::nil());
        let mut sealed = kms::seal_request(&req).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(
            engine.handle_activation(peer, &sealed).await,
            Err(SessionError::Protocol(ProtocolErrorKind::BadV6Cmac))
        ));
    }
}
