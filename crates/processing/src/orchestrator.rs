//! Drives one sale from Pending to a terminal status.

use anyhow::Result;
use async_trait::async_trait;
use certificate::CertificateProvider;
use nfe_core::access_key::{derive_access_key, KeyInputs};
use nfe_core::parsing::compute_sha256_hex;
use nfe_core::validation::validate;
use nfe_core::{DocumentBuilder, IssuerProfile, NfeError, NfeResult, Protocol, Sale, SaleStatus};
use sefaz::{SefazGateway, SubmissionResult};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLog};
use crate::store::{ProtocolStore, SaleStore};

/// Produces the signed form of an unsigned document.
#[async_trait]
pub trait DocumentSigner: Send + Sync {
    async fn sign(&self, document: &str) -> NfeResult<Vec<u8>>;
}

#[async_trait]
impl DocumentSigner for CertificateProvider {
    async fn sign(&self, document: &str) -> NfeResult<Vec<u8>> {
        CertificateProvider::sign(self, document).await
    }
}

pub struct SaleProcessor {
    sales: Arc<dyn SaleStore>,
    protocols: Arc<dyn ProtocolStore>,
    signer: Arc<dyn DocumentSigner>,
    gateway: Arc<SefazGateway>,
    builder: Arc<dyn DocumentBuilder>,
    issuer: IssuerProfile,
    audit: Arc<AuditLog>,
}

/// What a single attempt produced before its outcome is persisted.
#[derive(Default)]
struct Attempt {
    signed_document: Option<String>,
}

impl SaleProcessor {
    pub fn new(
        sales: Arc<dyn SaleStore>,
        protocols: Arc<dyn ProtocolStore>,
        signer: Arc<dyn DocumentSigner>,
        gateway: Arc<SefazGateway>,
        builder: Arc<dyn DocumentBuilder>,
        issuer: IssuerProfile,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            sales,
            protocols,
            signer,
            gateway,
            builder,
            issuer,
            audit,
        }
    }

    pub fn sales(&self) -> &Arc<dyn SaleStore> {
        &self.sales
    }

    pub fn protocols(&self) -> &Arc<dyn ProtocolStore> {
        &self.protocols
    }

    /// Claims and processes one sale. `Ok(None)` when the sale is missing or not
    /// Pending. Once the claim succeeds the outcome is always a terminal status;
    /// only the claim itself can fail with `Err`.
    pub async fn process_sale(&self, id: Uuid) -> Result<Option<SaleStatus>> {
        let Some(sale) = self.sales.claim(id)? else {
            tracing::debug!(sale_id = %id, "sale not pending; skipped");
            return Ok(None);
        };
        self.audit
            .record(AuditEvent::new("sale_claimed", sale.id, SaleStatus::Processing));
        Ok(Some(self.run_claimed(sale).await))
    }

    /// Finishes sales a previous run left in Processing. A sale that already carries an
    /// access key is first looked up at the authority; if it was authorized before the
    /// interruption it is finished from that protocol instead of being resubmitted.
    /// Otherwise the attempt is re-entered with the sale's assigned number and key.
    ///
    /// Must run before the sweeper starts. The sled database is held by one process, so
    /// no other worker can re-enter the same sale.
    pub async fn resume_interrupted(&self) -> Result<usize> {
        let stuck = self.sales.get_by_status(SaleStatus::Processing)?;
        let count = stuck.len();
        for mut sale in stuck {
            tracing::warn!(sale_id = %sale.id, "resuming interrupted sale");
            self.audit
                .record(AuditEvent::new("sale_resumed", sale.id, SaleStatus::Processing));

            if let Some(protocol) = self.already_authorized(&mut sale).await {
                self.persist(&sale, &protocol);
                continue;
            }
            self.run_claimed(sale).await;
        }
        Ok(count)
    }

    async fn already_authorized(&self, sale: &mut Sale) -> Option<Protocol> {
        let key = sale.access_key.clone()?;
        let consultation = self.gateway.consult_protocol(&key).await;
        if !consultation.success {
            tracing::debug!(
                sale_id = %sale.id,
                access_key = %key,
                code = consultation.status_code,
                "no authorization on record; resubmitting"
            );
            return None;
        }

        tracing::info!(sale_id = %sale.id, access_key = %key, "sale was authorized before interruption");
        sale.status = SaleStatus::Authorized;
        let message = consultation
            .inner_message
            .unwrap_or(consultation.message);
        let mut protocol = Protocol::new(sale.id, SaleStatus::Authorized, message);
        protocol.access_key = key;
        protocol.protocol_number = consultation.protocol_number.unwrap_or_default();
        protocol.status_code = consultation
            .inner_status_code
            .unwrap_or(consultation.status_code);
        protocol.response_document = consultation.protocol_document;
        Some(protocol)
    }

    async fn run_claimed(&self, mut sale: Sale) -> SaleStatus {
        let mut attempt = Attempt::default();
        let outcome = self.attempt(&mut sale, &mut attempt).await;
        let protocol = match outcome {
            Ok(result) if result.success => self.authorized(&mut sale, result),
            Ok(result) => self.rejected(&mut sale, result),
            Err(e) => self.failed(&mut sale, attempt, e),
        };
        self.persist(&sale, &protocol);
        sale.status
    }

    async fn attempt(&self, sale: &mut Sale, attempt: &mut Attempt) -> NfeResult<SubmissionResult> {
        if !self.gateway.verify_service_status().await {
            return Err(NfeError::AuthorityUnavailable(
                "SEFAZ authorization service is not operational".into(),
            ));
        }

        validate(sale, &self.issuer).map_err(NfeError::ValidationFailed)?;

        let series = sale.series.unwrap_or(self.issuer.series);
        let number = match sale.document_number {
            Some(n) => n,
            None => {
                let n = self.sales.next_document_number(series)?;
                sale.series = Some(series);
                sale.document_number = Some(n);
                self.sales.update(sale)?;
                n
            }
        };

        let key = derive_access_key(&KeyInputs::for_sale(sale, &self.issuer, number)?)?;
        if !sale.assign_access_key(key.as_str()) {
            return Err(NfeError::InternalError(format!(
                "sale already carries access key {} but derivation gives {}",
                sale.access_key.as_deref().unwrap_or_default(),
                key
            )));
        }
        self.sales.update(sale)?;
        tracing::info!(sale_id = %sale.id, access_key = %key, number, series, "access key assigned");

        let unsigned = self.builder.build(sale, &self.issuer, &key)?;
        let signed = self.signer.sign(&unsigned).await?;
        if signed.is_empty() {
            return Err(NfeError::SigningFailed("signer returned an empty document".into()));
        }
        let signed = String::from_utf8(signed)
            .map_err(|e| NfeError::SigningFailed(format!("signed document is not UTF-8: {e}")))?;
        self.audit.record(
            AuditEvent::new("document_signed", sale.id, SaleStatus::Processing)
                .with_access_key(Some(key.as_str()))
                .with_hash(compute_sha256_hex(&signed)),
        );
        attempt.signed_document = Some(signed.clone());

        Ok(self.gateway.submit(&signed).await)
    }

    fn authorized(&self, sale: &mut Sale, result: SubmissionResult) -> Protocol {
        sale.status = SaleStatus::Authorized;
        if let Some(key) = result.access_key.as_deref() {
            sale.assign_access_key(key);
        }
        if let Some(n) = result.document_number {
            sale.document_number = Some(n);
        }
        if let Some(s) = result.series {
            sale.series = Some(s);
        }
        for warning in &result.warnings {
            tracing::warn!(sale_id = %sale.id, %warning, "authorization warning");
        }

        let mut protocol = Protocol::new(sale.id, SaleStatus::Authorized, result.message);
        protocol.access_key = sale.access_key.clone().unwrap_or_default();
        protocol.protocol_number = result.protocol_number.unwrap_or_default();
        protocol.status_code = result.status_code;
        protocol.signed_document = result.signed_document;
        protocol.response_document = result.protocol_document;
        protocol
    }

    fn rejected(&self, sale: &mut Sale, result: SubmissionResult) -> Protocol {
        sale.status = SaleStatus::Rejected;
        tracing::warn!(
            sale_id = %sale.id,
            code = result.status_code,
            message = %result.message,
            "sale rejected"
        );

        let mut protocol = Protocol::new(sale.id, SaleStatus::Rejected, result.message);
        protocol.access_key = result
            .access_key
            .or_else(|| sale.access_key.clone())
            .unwrap_or_default();
        protocol.status_code = result.status_code;
        protocol.signed_document = result.signed_document;
        protocol.response_document = result.protocol_document;
        protocol
    }

    fn failed(&self, sale: &mut Sale, attempt: Attempt, error: NfeError) -> Protocol {
        sale.status = SaleStatus::Error;
        tracing::error!(sale_id = %sale.id, error = %error, "sale processing failed");

        let mut protocol = Protocol::new(sale.id, SaleStatus::Error, error.to_string());
        protocol.access_key = sale.access_key.clone().unwrap_or_default();
        protocol.signed_document = attempt.signed_document.unwrap_or_default();
        protocol
    }

    fn persist(&self, sale: &Sale, protocol: &Protocol) {
        if let Err(e) = self.sales.update(sale) {
            tracing::error!(sale_id = %sale.id, error = %e, "failed to persist sale outcome");
        }
        if let Err(e) = self.protocols.add(protocol) {
            tracing::error!(sale_id = %sale.id, error = %e, "failed to persist protocol");
        }

        let mut event = AuditEvent::new("sale_finished", sale.id, sale.status)
            .with_access_key(sale.access_key.as_deref())
            .with_protocol_number(
                Some(protocol.protocol_number.as_str()).filter(|n| !n.is_empty()),
            );
        if sale.status != SaleStatus::Authorized {
            event = event.with_error(protocol.message.clone());
        }
        if !protocol.signed_document.is_empty() {
            event = event.with_hash(compute_sha256_hex(&protocol.signed_document));
        }
        self.audit.record(event);

        tracing::info!(
            sale_id = %sale.id,
            status = %sale.status,
            protocol = %protocol.protocol_number,
            "sale finished"
        );
    }
}
