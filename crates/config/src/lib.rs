use anyhow::{Context, Result};
use nfe_core::models::{Environment, IssuerProfile};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod secrets;

pub use secrets::{KeyringSecretStore, MemorySecretStore, SecretStore, SecretValue};

const APP_NAME: &str = "nfe-issuer";
pub const KEYCHAIN_SERVICE: &str = "nfe.issuer.credentials";

/// Where the process runs. Anything not explicitly `non_production` is treated as production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Deployment {
    #[default]
    Production,
    NonProduction,
}

impl Deployment {
    pub fn is_production(self) -> bool {
        self == Deployment::Production
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub deployment: Deployment,
    #[serde(default)]
    pub issuer: IssuerProfile,
    #[serde(default)]
    pub sefaz: SefazConfig,
    #[serde(default)]
    pub certificate: CertificateConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl AppConfig {
    pub fn environment(&self) -> Environment {
        self.issuer.environment
    }

    /// Configuration errors that must stop the worker before it touches any sale.
    pub fn check(&self) -> Vec<String> {
        let mut errs = Vec::new();
        let production = self.deployment.is_production();

        match self.certificate.source {
            CertificateSourceKind::Unconfigured => errs.push(
                "certificate.source is not set; choose \"secret_store\" or \"self_signed\""
                    .to_string(),
            ),
            CertificateSourceKind::SelfSigned if production => errs.push(
                "certificate.source = \"self_signed\" is not allowed in a production deployment"
                    .to_string(),
            ),
            _ => {}
        }

        if production && self.sefaz.transport == TransportKind::Simulated {
            errs.push(
                "sefaz.transport = \"simulated\" is not allowed in a production deployment"
                    .to_string(),
            );
        }
        if self.sefaz.transport == TransportKind::Http && self.sefaz.endpoints.is_none() {
            errs.push("sefaz.endpoints must be set for the http transport".to_string());
        }
        if self.sefaz.poll_attempts == 0 {
            errs.push("sefaz.poll_attempts must be at least 1".to_string());
        }
        if self.worker.max_parallel == 0 {
            errs.push("worker.max_parallel must be at least 1".to_string());
        }
        errs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Simulated,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SefazEndpoints {
    pub status: String,
    pub authorization: String,
    pub receipt: String,
    pub protocol: String,
}

impl SefazEndpoints {
    /// São Paulo web services (NFe 4.00) for the given environment.
    pub fn sao_paulo(environment: Environment) -> Self {
        let host = match environment {
            Environment::Production => "https://nfe.fazenda.sp.gov.br",
            Environment::Homologation => "https://homologacao.nfe.fazenda.sp.gov.br",
        };
        Self {
            status: format!("{host}/ws/nfestatusservico4.asmx"),
            authorization: format!("{host}/ws/nfeautorizacao4.asmx"),
            receipt: format!("{host}/ws/nferetautorizacao4.asmx"),
            protocol: format!("{host}/ws/nfeconsultaprotocolo4.asmx"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SefazConfig {
    #[serde(default)]
    pub transport: TransportKind,
    pub endpoints: Option<SefazEndpoints>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SefazConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Simulated,
            endpoints: None,
            timeout_secs: default_timeout_secs(),
            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_poll_attempts() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    2000
}

/// Which certificate strategy is active. There is deliberately no usable default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CertificateSourceKind {
    #[default]
    Unconfigured,
    SecretStore,
    SelfSigned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateConfig {
    #[serde(default)]
    pub source: CertificateSourceKind,
    #[serde(default = "default_pfx_secret")]
    pub pfx_secret: String,
    #[serde(default = "default_password_secret")]
    pub password_secret: String,
    #[serde(default = "default_subject")]
    pub self_signed_subject: String,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// PEM files with additional trusted roots for chain building.
    #[serde(default)]
    pub trust_anchors: Vec<PathBuf>,
    /// Only honoured by builds with the `relaxed-validation` feature.
    #[serde(default)]
    pub relax_validation: bool,
    #[serde(default)]
    pub reference: SignatureReference,
}

/// What the XML signature references: the whole document (`URI=""`) or the `infNFe`
/// element by its Id, which is the form the authority's schema expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignatureReference {
    #[default]
    WholeDocument,
    IdentifiedElement,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            source: CertificateSourceKind::Unconfigured,
            pfx_secret: default_pfx_secret(),
            password_secret: default_password_secret(),
            self_signed_subject: default_subject(),
            cache_ttl_secs: default_cache_ttl_secs(),
            trust_anchors: Vec::new(),
            relax_validation: false,
            reference: SignatureReference::WholeDocument,
        }
    }
}

fn default_pfx_secret() -> String {
    "nfe-certificate".to_string()
}

fn default_password_secret() -> String {
    "nfe-certificate-password".to_string()
}

fn default_subject() -> String {
    "CN=NFe Development Certificate".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub audit_log: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            max_parallel: default_max_parallel(),
            data_dir: default_data_dir(),
            audit_log: None,
        }
    }
}

impl WorkerConfig {
    pub fn audit_log_path(&self) -> PathBuf {
        self.audit_log
            .clone()
            .unwrap_or_else(|| self.data_dir.join("audit.jsonl"))
    }
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_max_parallel() -> usize {
    1
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("nfe-data")
}

pub fn load() -> Result<AppConfig> {
    let cfg: AppConfig = confy::load(APP_NAME, None).context("Failed to load app config")?;
    Ok(cfg)
}

pub fn load_path(path: &std::path::Path) -> Result<AppConfig> {
    let cfg: AppConfig = confy::load_path(path)
        .with_context(|| format!("Failed to load app config from {}", path.display()))?;
    Ok(cfg)
}

/// Writes `cfg` to `path`, or to the platform location when `path` is `None`.
pub fn store(cfg: &AppConfig, path: Option<&std::path::Path>) -> Result<PathBuf> {
    let target = match path {
        Some(p) => p.to_path_buf(),
        None => confy::get_configuration_file_path(APP_NAME, None)
            .context("Failed to resolve config path")?,
    };
    confy::store_path(&target, cfg).context("Failed to store app config")?;
    Ok(target)
}
