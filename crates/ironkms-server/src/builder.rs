//! Builder for [`KmsServer`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ironkms_catalog::Catalog;
use ironkms_store::ActivationStore;

use crate::config::{Hwid, KmsServerOptions};
use crate::event::{EventSink, TracingSink};
use crate::server::KmsServer;

pub struct WantsCatalog {
    options: KmsServerOptions,
}

pub struct BuilderDone {
    options: KmsServerOptions,
    catalog: Arc<Catalog>,
    store: Option<ActivationStore>,
    sink: Arc<dyn EventSink>,
}

pub struct KmsServerBuilder<State> {
    state: State,
}

impl KmsServerBuilder<WantsCatalog> {
    pub fn new() -> Self {
        Self {
            state: WantsCatalog {
                options: KmsServerOptions::default(),
            },
        }
    }

    pub fn with_options(mut self, options: KmsServerOptions) -> Self {
        self.state.options = options;
        self
    }

    pub fn with_addr(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.state.options.addr = addr.into();
        self
    }

    pub fn with_epid(mut self, epid: impl Into<String>) -> Self {
        self.state.options.epid = Some(epid.into());
        self
    }

    pub fn with_hwid(mut self, hwid: Hwid) -> Self {
        self.state.options.hwid = hwid;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.state.options.timeout_idle = Some(timeout);
        self
    }

    pub fn with_catalog(self, catalog: Arc<Catalog>) -> KmsServerBuilder<BuilderDone> {
        KmsServerBuilder {
            state: BuilderDone {
                options: self.state.options,
                catalog,
                store: None,
                sink: Arc::new(TracingSink),
            },
        }
    }
}

impl Default for KmsServerBuilder<WantsCatalog> {
    fn default() -> Self {
        Self::new()
    }
}

impl KmsServerBuilder<BuilderDone> {
    pub fn with_store(mut self, store: ActivationStore) -> Self {
        self.state.store = Some(store);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.state.sink = sink;
        self
    }

    pub fn build(self) -> KmsServer {
        KmsServer::new(self.state.options, self.state.catalog, self.state.store, self.state.sink)
    }
}
