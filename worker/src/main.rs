mod commands;

use anyhow::{anyhow, bail, Context, Result};
use certificate::CertificateProvider;
use clap::{Parser, Subcommand, ValueEnum};
use config::{AppConfig, KeyringSecretStore, TransportKind, KEYCHAIN_SERVICE};
use nfe_core::access_key::region_code;
use nfe_core::{NfeXmlBuilder, SaleStatus};
use processing::{AuditLog, SaleProcessor, SledStore};
use sefaz::simulated::SimulatedTransport;
use sefaz::soap::HttpTransport;
use sefaz::{AuthorityTransport, GatewaySettings, SefazGateway};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const PFX_ENV: &str = "NFE_CERTIFICATE_PFX_B64";
const PASSWORD_ENV: &str = "NFE_CERTIFICATE_PASSWORD";

#[derive(Parser)]
#[command(name = "nfe-worker", version, about = "Issues NFe documents for registered sales")]
struct Cli {
    /// Configuration file; defaults to the platform configuration directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resume interrupted sales, then sweep pending sales until Ctrl-C.
    Run,
    /// Process a single pending sale now.
    Process { id: Uuid },
    /// Register sales from a JSON file or a directory of JSON files.
    Intake { path: PathBuf },
    /// List sales.
    Sales {
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },
    /// List protocols, newest first.
    Protocols {
        #[arg(long, conflicts_with = "key")]
        sale: Option<Uuid>,
        #[arg(long)]
        key: Option<String>,
    },
    /// Show the active signing certificate.
    CertInfo,
    /// Ask the authority whether the authorization service is operational.
    ServiceStatus,
    /// Look up the authority's record for an access key.
    Consult { key: String },
    /// Write the effective configuration (defaults filled in) for editing.
    InitConfig,
    /// Store a PKCS#12 certificate and its password in the OS keychain.
    ImportCertificate {
        pfx: PathBuf,
        /// Falls back to NFE_CERTIFICATE_PASSWORD.
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusFilter {
    Pending,
    Processing,
    Authorized,
    Rejected,
    Error,
}

impl From<StatusFilter> for SaleStatus {
    fn from(f: StatusFilter) -> Self {
        match f {
            StatusFilter::Pending => SaleStatus::Pending,
            StatusFilter::Processing => SaleStatus::Processing,
            StatusFilter::Authorized => SaleStatus::Authorized,
            StatusFilter::Rejected => SaleStatus::Rejected,
            StatusFilter::Error => SaleStatus::Error,
        }
    }
}

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sled=warn".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(p) => config::load_path(p),
        None => config::load(),
    }
}

/// Refuses to start anything that touches sales or the authority with a bad config.
fn ensure_runnable(cfg: &AppConfig) -> Result<()> {
    let errs = cfg.check();
    if errs.is_empty() {
        return Ok(());
    }
    for e in &errs {
        tracing::error!(problem = %e, "configuration error");
    }
    bail!("invalid configuration: {}", errs.join("; "))
}

fn create_secret_store(cfg: &AppConfig) -> Arc<KeyringSecretStore> {
    Arc::new(
        KeyringSecretStore::new(KEYCHAIN_SERVICE)
            .binary(&cfg.certificate.pfx_secret, Some(PFX_ENV))
            .text(&cfg.certificate.password_secret, Some(PASSWORD_ENV)),
    )
}

fn open_store(cfg: &AppConfig) -> Result<Arc<SledStore>> {
    Ok(Arc::new(SledStore::open(cfg.worker.data_dir.join("db"))?))
}

fn create_provider(cfg: &AppConfig) -> Result<Arc<CertificateProvider>> {
    let provider = certificate::provider_from_config(cfg, create_secret_store(cfg))?;
    Ok(Arc::new(provider))
}

fn create_transport(
    cfg: &AppConfig,
    provider: Arc<CertificateProvider>,
) -> Result<Arc<dyn AuthorityTransport>> {
    match cfg.sefaz.transport {
        TransportKind::Http => {
            let endpoints = cfg
                .sefaz
                .endpoints
                .clone()
                .ok_or_else(|| anyhow!("sefaz.endpoints not configured"))?;
            let region = region_code(&cfg.issuer.uf)
                .ok_or_else(|| anyhow!("issuer.uf '{}' is not a known state", cfg.issuer.uf))?;
            tracing::info!(authorization = %endpoints.authorization, "Using SEFAZ web services");
            Ok(Arc::new(
                HttpTransport::new(
                    endpoints,
                    cfg.environment(),
                    region,
                    Duration::from_secs(cfg.sefaz.timeout_secs),
                )
                .with_client_identity(provider),
            ))
        }
        TransportKind::Simulated => {
            tracing::info!("Using simulated authority");
            Ok(Arc::new(SimulatedTransport::new()))
        }
    }
}

fn create_gateway(cfg: &AppConfig, provider: Arc<CertificateProvider>) -> Result<Arc<SefazGateway>> {
    let transport = create_transport(cfg, provider)?;
    Ok(Arc::new(SefazGateway::new(
        transport,
        GatewaySettings::from_config(cfg),
    )))
}

fn create_processor(
    cfg: &AppConfig,
    store: Arc<SledStore>,
    provider: Arc<CertificateProvider>,
) -> Result<Arc<SaleProcessor>> {
    let gateway = create_gateway(cfg, provider.clone())?;
    Ok(Arc::new(SaleProcessor::new(
        store.clone(),
        store,
        provider,
        gateway,
        Arc::new(NfeXmlBuilder::default()),
        cfg.issuer.clone(),
        Arc::new(AuditLog::new(cfg.worker.audit_log_path())),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run => {
            ensure_runnable(&cfg)?;
            let store = open_store(&cfg)?;
            let provider = create_provider(&cfg)?;
            let processor = create_processor(&cfg, store, provider)?;
            commands::run(&cfg, processor).await
        }
        Command::Process { id } => {
            ensure_runnable(&cfg)?;
            let store = open_store(&cfg)?;
            let provider = create_provider(&cfg)?;
            let processor = create_processor(&cfg, store, provider)?;
            commands::process(&processor, id).await
        }
        Command::Intake { path } => commands::intake(&*open_store(&cfg)?, &path),
        Command::Sales { status } => {
            commands::list_sales(&*open_store(&cfg)?, status.map(Into::into))
        }
        Command::Protocols { sale, key } => {
            commands::list_protocols(&*open_store(&cfg)?, sale, key.as_deref())
        }
        Command::CertInfo => {
            ensure_runnable(&cfg)?;
            commands::cert_info(&*create_provider(&cfg)?).await
        }
        Command::ServiceStatus => {
            ensure_runnable(&cfg)?;
            let gateway = create_gateway(&cfg, create_provider(&cfg)?)?;
            commands::service_status(&gateway).await
        }
        Command::Consult { key } => {
            ensure_runnable(&cfg)?;
            let gateway = create_gateway(&cfg, create_provider(&cfg)?)?;
            commands::consult(&gateway, &key).await
        }
        Command::InitConfig => {
            let path = config::store(&cfg, cli.config.as_deref())?;
            println!("configuration written to {}", path.display());
            for problem in cfg.check() {
                println!("still to configure: {problem}");
            }
            Ok(())
        }
        Command::ImportCertificate { pfx, password } => {
            let password = match password {
                Some(p) => p,
                None => std::env::var(PASSWORD_ENV)
                    .map_err(|_| anyhow!("pass --password or set {PASSWORD_ENV}"))?,
            };
            commands::import_certificate(&cfg, &create_secret_store(&cfg), &pfx, &password).await
        }
    }
}
