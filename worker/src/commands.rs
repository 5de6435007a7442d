use anyhow::{bail, Context, Result};
use certificate::{CertificateProvider, SigningCertificate};
use chrono::{DateTime, Utc};
use config::{AppConfig, KeyringSecretStore, SecretValue};
use nfe_core::document::format_amount;
use nfe_core::{LineItem, Sale, SaleStatus};
use processing::{ProtocolStore, SaleProcessor, SaleStore, Sweeper};
use sefaz::SefazGateway;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;
use walkdir::WalkDir;

pub async fn run(cfg: &AppConfig, processor: Arc<SaleProcessor>) -> Result<()> {
    let resumed = processor.resume_interrupted().await?;
    if resumed > 0 {
        tracing::info!(resumed, "finished sales interrupted by a previous run");
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested; waiting for in-flight sales");
            let _ = tx.send(true);
        }
    });

    Sweeper::new(
        processor,
        Duration::from_secs(cfg.worker.sweep_interval_secs),
        cfg.worker.max_parallel,
    )
    .run(rx)
    .await
}

pub async fn process(processor: &SaleProcessor, id: Uuid) -> Result<()> {
    match processor.process_sale(id).await? {
        None => bail!("sale {id} does not exist or is not pending"),
        Some(status) => {
            println!("{id}: {status}");
            if let Some(protocol) = processor.protocols().get_latest_for_sale(id)? {
                print_protocol(&protocol);
            }
            Ok(())
        }
    }
}

/// Sale as accepted from intake files. Everything the processor assigns is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleIntake {
    pub client_name: String,
    pub client_document: String,
    pub client_address: String,
    pub items: Vec<LineItem>,
    pub sold_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: String,
    pub series: Option<u16>,
}

impl From<SaleIntake> for Sale {
    fn from(intake: SaleIntake) -> Self {
        let mut sale = Sale::new(
            intake.client_name,
            intake.client_document,
            intake.client_address,
        )
        .with_notes(intake.notes);
        sale.items = intake.items;
        if let Some(at) = intake.sold_at {
            sale = sale.sold_at(at);
        }
        sale.series = intake.series;
        sale
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntakeFile {
    Many(Vec<SaleIntake>),
    One(SaleIntake),
}

/// A file holds one sale object or an array of them.
pub fn parse_intake(json: &str) -> Result<Vec<Sale>> {
    let parsed: IntakeFile = serde_json::from_str(json)?;
    let intakes = match parsed {
        IntakeFile::Many(v) => v,
        IntakeFile::One(one) => vec![one],
    };
    Ok(intakes.into_iter().map(Sale::from).collect())
}

fn intake_files(path: &Path) -> Result<Vec<std::path::PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        bail!("{} is neither a file nor a directory", path.display());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_file() {
            let p = entry.path();
            if let Some(ext) = p.extension().and_then(|e| e.to_str()) {
                if ext.eq_ignore_ascii_case("json") {
                    files.push(p.to_path_buf());
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

pub fn intake(store: &dyn SaleStore, path: &Path) -> Result<()> {
    let mut added = 0;
    for file in intake_files(path)? {
        let text = std::fs::read_to_string(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let sales = match parse_intake(&text) {
            Ok(sales) => sales,
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "skipping unreadable intake file");
                continue;
            }
        };
        for sale in sales {
            store.add(&sale)?;
            tracing::info!(sale_id = %sale.id, file = %file.display(), "sale registered");
            println!("{}  {}  {}", sale.id, sale.client_name, format_amount(sale.total()));
            added += 1;
        }
    }
    println!("{added} sale(s) registered");
    Ok(())
}

pub fn list_sales(store: &dyn SaleStore, status: Option<SaleStatus>) -> Result<()> {
    let sales = match status {
        Some(s) => store.get_by_status(s)?,
        None => store.get_all()?,
    };
    for sale in &sales {
        println!(
            "{}  {:<10}  {}  {:>12}  {:>9}  {}",
            sale.id,
            sale.status,
            sale.sold_at.format("%Y-%m-%d %H:%M"),
            format_amount(sale.total()),
            sale.document_number
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".into()),
            sale.access_key.as_deref().unwrap_or("-"),
        );
    }
    println!("{} sale(s)", sales.len());
    Ok(())
}

fn print_protocol(protocol: &nfe_core::Protocol) {
    println!(
        "{}  sale {}  {:<10}  code {:>3}  {}  {}",
        protocol.recorded_at.format("%Y-%m-%d %H:%M:%S"),
        protocol.sale_id,
        protocol.status,
        protocol.status_code,
        if protocol.protocol_number.is_empty() {
            "-"
        } else {
            protocol.protocol_number.as_str()
        },
        protocol.message,
    );
}

pub fn list_protocols(
    store: &dyn ProtocolStore,
    sale: Option<Uuid>,
    key: Option<&str>,
) -> Result<()> {
    let protocols = match (sale, key) {
        (Some(id), _) => {
            let mut history = store.get_by_sale_id(id)?;
            history.reverse();
            history
        }
        (None, Some(key)) => store.get_by_access_key(key)?.into_iter().collect(),
        (None, None) => store.get_all()?,
    };
    for protocol in &protocols {
        print_protocol(protocol);
    }
    Ok(())
}

pub async fn cert_info(provider: &CertificateProvider) -> Result<()> {
    let handle = provider.handle().await?;
    println!("source:      {}", provider.source_name());
    println!("subject:     {}", handle.subject);
    println!("issuer:      {}", handle.issuer);
    println!("serial:      {}", handle.serial_number);
    println!("thumbprint:  {}", handle.thumbprint);
    println!("valid from:  {}", handle.not_before);
    println!("valid until: {}", handle.not_after);
    println!("days left:   {}", handle.days_until_expiry());
    if handle.is_expiring_soon() {
        println!("warning:     certificate expires within 30 days");
    }
    Ok(())
}

pub async fn service_status(gateway: &SefazGateway) -> Result<()> {
    if gateway.verify_service_status().await {
        println!("authorization service operational");
        Ok(())
    } else {
        bail!("authorization service unavailable")
    }
}

pub async fn consult(gateway: &SefazGateway, key: &str) -> Result<()> {
    let result = gateway.consult_protocol(key).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if let Some(error) = result.error {
        bail!(error);
    }
    Ok(())
}

pub async fn import_certificate(
    cfg: &AppConfig,
    secrets: &KeyringSecretStore,
    pfx: &Path,
    password: &str,
) -> Result<()> {
    let bytes = std::fs::read(pfx).with_context(|| format!("Failed to read {}", pfx.display()))?;
    let cert = SigningCertificate::from_pfx(&bytes, password)?;
    if !cert.has_private_key() {
        bail!("{} carries no private key", pfx.display());
    }

    secrets
        .put_secret(&cfg.certificate.pfx_secret, SecretValue::Binary(bytes))
        .await?;
    secrets
        .put_secret(
            &cfg.certificate.password_secret,
            SecretValue::Text(password.to_string()),
        )
        .await?;

    let handle = cert.handle();
    println!("imported {} ({})", handle.subject, handle.thumbprint);
    println!("valid until {}", handle.not_after);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use processing::MemoryStore;
    use rust_decimal_macros::dec;

    const ONE: &str = r#"{
        "client_name": "Maria Silva",
        "client_document": "12345678909",
        "client_address": "Rua das Flores, 10",
        "items": [
            {"code": "A1", "description": "Caderno", "quantity": 2, "unit_price": "10.50",
             "ncm": "48202000", "cfop": "5102"}
        ]
    }"#;

    #[test]
    fn single_sale_file() {
        let sales = parse_intake(ONE).unwrap();
        assert_eq!(sales.len(), 1);
        let sale = &sales[0];
        assert_eq!(sale.status, SaleStatus::Pending);
        assert_eq!(sale.items[0].unit, "UN");
        assert_eq!(sale.total(), dec!(21.00));
        assert!(sale.access_key.is_none());
        assert!(sale.document_number.is_none());
    }

    #[test]
    fn array_file_gets_distinct_ids() {
        let sales = parse_intake(&format!("[{ONE}, {ONE}]")).unwrap();
        assert_eq!(sales.len(), 2);
        assert_ne!(sales[0].id, sales[1].id);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(parse_intake("{\"client_name\": 1}").is_err());
    }

    #[test]
    fn directory_intake_registers_json_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), ONE).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("b.JSON"), format!("[{ONE}]")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();

        let store = MemoryStore::new();
        intake(&store, dir.path()).unwrap();
        assert_eq!(store.get_pending().unwrap().len(), 2);
    }
}
