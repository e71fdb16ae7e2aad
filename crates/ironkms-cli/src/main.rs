//! Command-line KMS activation host.
//!
//! Thin glue around `ironkms-server`: flag/environment parsing, tracing
//! setup, and the documented process exit codes (0 normal shutdown,
//! 2 bind failure, 3 storage init failure, 4 malformed catalog).

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use ironkms_catalog::Catalog;
use ironkms_server::{Hwid, KmsServer, KmsServerOptions, ServerError};
use ironkms_store::ActivationStore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_BIND_FAILURE: u8 = 2;
const EXIT_STORAGE_FAILURE: u8 = 3;
const EXIT_CATALOG_FAILURE: u8 = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    #[value(name = "MINI")]
    Mini,
    #[value(name = "INFO")]
    Info,
    #[value(name = "DEBUG")]
    Debug,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            Self::Mini => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

/// KMS activation host emulator.
#[derive(Debug, Parser)]
#[command(name = "ironkms", version, about)]
struct Args {
    /// Address to listen on; 0.0.0.0 or :: bind all interfaces.
    #[arg(long, default_value = "0.0.0.0", env = "IRONKMS_IP")]
    ip: IpAddr,

    /// Port to listen on.
    #[arg(long, default_value_t = 1688, env = "IRONKMS_PORT")]
    port: u16,

    /// Fixed EPID to report instead of deriving one per client.
    #[arg(long, env = "IRONKMS_EPID")]
    epid: Option<String>,

    /// 16 hex digits, or RANDOM to draw a fresh HWID at startup.
    #[arg(long, default_value = "364F463A8863D35F", env = "IRONKMS_HWID")]
    hwid: Hwid,

    /// Language code used in derived EPIDs.
    #[arg(long, default_value_t = 1033, env = "IRONKMS_LCID")]
    lcid: u16,

    /// Activated-machine count to report.
    #[arg(long = "client-count", default_value_t = 50, env = "IRONKMS_CLIENT_COUNT")]
    client_count: u16,

    /// Activation interval in minutes.
    #[arg(long = "activation-interval", default_value_t = 120, env = "IRONKMS_ACTIVATION_INTERVAL")]
    activation_interval: u32,

    /// Renewal interval in minutes.
    #[arg(long = "renewal-interval", default_value_t = 10080, env = "IRONKMS_RENEWAL_INTERVAL")]
    renewal_interval: u32,

    /// Close idle connections after this many seconds.
    #[arg(long = "timeout-idle", env = "IRONKMS_TIMEOUT_IDLE")]
    timeout_idle: Option<u64>,

    /// Record activations in this SQLite database.
    #[arg(long = "sqlite", env = "IRONKMS_DATABASE")]
    sqlite: Option<PathBuf>,

    /// Log verbosity.
    #[arg(long, value_enum, ignore_case = true, default_value = "INFO", env = "IRONKMS_LOGLEVEL")]
    loglevel: LogLevel,
}

impl Args {
    fn options(&self) -> KmsServerOptions {
        KmsServerOptions {
            addr: SocketAddr::new(self.ip, self.port),
            epid: self.epid.clone(),
            hwid: self.hwid,
            lcid: self.lcid,
            client_count: self.client_count,
            activation_interval: self.activation_interval,
            renewal_interval: self.renewal_interval,
            timeout_idle: self.timeout_idle.map(Duration::from_secs),
            ..KmsServerOptions::default()
        }
    }
}

fn init_tracing(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.loglevel);

    let catalog = match Catalog::load_embedded() {
        Ok(catalog) => Arc::new(catalog),
        Err(error) => {
            error!(%error, "product catalog failed to load");
            return ExitCode::from(EXIT_CATALOG_FAILURE);
        }
    };
    info!(
        groups = catalog.group_count(),
        skus = catalog.sku_count(),
        "product catalog loaded"
    );

    let store = match &args.sqlite {
        Some(path) => match ActivationStore::open(path) {
            Ok(store) => {
                info!(path = %path.display(), "activation store ready");
                Some(store)
            }
            Err(error) => {
                error!(%error, "activation store failed to initialize");
                return ExitCode::from(EXIT_STORAGE_FAILURE);
            }
        },
        None => None,
    };

    let mut builder = KmsServer::builder().with_options(args.options()).with_catalog(catalog);
    if let Some(store) = store {
        builder = builder.with_store(store);
    }
    let server = builder.build();

    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            handle.shutdown();
        }
    });

    match server.run().await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(error @ ServerError::Bind { .. }) => {
            error!(%error, "cannot listen on the requested address");
            ExitCode::from(EXIT_BIND_FAILURE)
        }
    }
}
