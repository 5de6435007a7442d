//! Secret lookup: environment first, then the OS keychain.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

#[derive(Clone, PartialEq, Eq)]
pub enum SecretValue {
    Binary(Vec<u8>),
    Text(String),
}

impl SecretValue {
    pub fn is_empty(&self) -> bool {
        match self {
            SecretValue::Binary(b) => b.is_empty(),
            SecretValue::Text(t) => t.is_empty(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SecretValue::Binary(b) => b,
            SecretValue::Text(t) => t.as_bytes(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SecretValue::Binary(b) => std::str::from_utf8(b).ok(),
            SecretValue::Text(t) => Some(t),
        }
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretValue::Binary(b) => write!(f, "Binary(<{} bytes>)", b.len()),
            SecretValue::Text(_) => f.write_str("Text(<redacted>)"),
        }
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when the secret does not exist.
    async fn get_secret(&self, name: &str) -> Result<Option<SecretValue>>;
}

#[derive(Debug, Clone)]
struct SecretSpec {
    env_var: Option<String>,
    binary: bool,
}

/// OS keychain store. Binary secrets are kept base64 encoded.
#[derive(Debug, Clone)]
pub struct KeyringSecretStore {
    service: String,
    specs: HashMap<String, SecretSpec>,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            specs: HashMap::new(),
        }
    }

    /// Registers a binary secret. `env_var`, when set and present, holds it base64 encoded.
    pub fn binary(mut self, name: &str, env_var: Option<&str>) -> Self {
        self.specs.insert(
            name.to_string(),
            SecretSpec {
                env_var: env_var.map(str::to_string),
                binary: true,
            },
        );
        self
    }

    pub fn text(mut self, name: &str, env_var: Option<&str>) -> Self {
        self.specs.insert(
            name.to_string(),
            SecretSpec {
                env_var: env_var.map(str::to_string),
                binary: false,
            },
        );
        self
    }

    fn is_binary(&self, name: &str) -> bool {
        self.specs.get(name).map(|s| s.binary).unwrap_or(false)
    }

    fn decode(&self, name: &str, raw: String) -> Result<SecretValue> {
        if self.is_binary(name) {
            let bytes = STANDARD
                .decode(raw.trim())
                .with_context(|| format!("secret {name} is not valid base64"))?;
            Ok(SecretValue::Binary(bytes))
        } else {
            Ok(SecretValue::Text(raw))
        }
    }

    pub async fn put_secret(&self, name: &str, value: SecretValue) -> Result<()> {
        let encoded = match value {
            SecretValue::Binary(bytes) => STANDARD.encode(bytes),
            SecretValue::Text(text) => text,
        };
        let service = self.service.clone();
        let user = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let entry = keyring::Entry::new(&service, &user)?;
            entry.set_password(&encoded)?;
            Ok(())
        })
        .await
        .context("keychain task panicked")??;
        tracing::info!(secret = %name, "stored secret in keychain");
        Ok(())
    }
}

#[async_trait]
impl SecretStore for KeyringSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<SecretValue>> {
        if let Some(var) = self.specs.get(name).and_then(|s| s.env_var.as_deref()) {
            if let Ok(raw) = std::env::var(var) {
                tracing::debug!(secret = %name, env = %var, "secret taken from environment");
                return self.decode(name, raw).map(Some);
            }
        }

        let service = self.service.clone();
        let user = name.to_string();
        let raw = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let entry = keyring::Entry::new(&service, &user)?;
            match entry.get_password() {
                Ok(value) => Ok(Some(value)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
        .context("keychain task panicked")?
        .with_context(|| format!("keychain lookup for {name} failed"))?;

        raw.map(|r| self.decode(name, r)).transpose()
    }
}

/// Process-local store for tests and ephemeral runs. Counts lookups.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    values: Arc<RwLock<HashMap<String, SecretValue>>>,
    lookups: Arc<RwLock<HashMap<String, usize>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, value: SecretValue) {
        if let Ok(mut values) = self.values.write() {
            values.insert(name.to_string(), value);
        }
    }

    pub fn lookups(&self, name: &str) -> usize {
        self.lookups
            .read()
            .map(|l| l.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<SecretValue>> {
        if let Ok(mut lookups) = self.lookups.write() {
            *lookups.entry(name.to_string()).or_default() += 1;
        }
        let values = self
            .values
            .read()
            .map_err(|_| anyhow::anyhow!("secret store lock poisoned"))?;
        Ok(values.get(name).cloned())
    }
}
