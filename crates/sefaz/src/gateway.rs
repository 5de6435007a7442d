//! Submission flow against the authority: status check, batch send, receipt polling
//! and protocol consultation.

use chrono::{DateTime, Utc};
use config::AppConfig;
use nfe_core::access_key::validate_access_key;
use nfe_core::parsing::parse_document_summary;
use nfe_core::Environment;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::status::{transition_for, AuthorityStatus, Transition};
use crate::{AuthorityReply, AuthorityTransport, InnerProtocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionStatus {
    Authorized,
    Rejected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub success: bool,
    pub access_key: Option<String>,
    pub document_number: Option<u32>,
    pub series: Option<u16>,
    pub protocol_number: Option<String>,
    pub status: SubmissionStatus,
    pub message: String,
    /// 0 when no authority reply was obtained.
    pub status_code: u16,
    pub signed_document: String,
    /// `protNFe` for authorizations, the whole reply for rejections.
    pub protocol_document: String,
    pub protocol_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SubmissionResult {
    fn new(signed_document: &str, status: SubmissionStatus, message: String) -> Self {
        let summary = parse_document_summary(signed_document).ok();
        Self {
            success: status == SubmissionStatus::Authorized,
            access_key: summary.as_ref().map(|s| s.access_key.clone()),
            document_number: summary.as_ref().and_then(|s| s.number),
            series: summary.as_ref().and_then(|s| s.series),
            protocol_number: None,
            status,
            message,
            status_code: 0,
            signed_document: signed_document.to_string(),
            protocol_document: String::new(),
            protocol_at: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn error(signed_document: &str, message: String) -> Self {
        let mut result = Self::new(signed_document, SubmissionStatus::Error, message.clone());
        result.errors.push(message);
        result
    }

    fn rejected(signed_document: &str, reply: &AuthorityReply) -> Self {
        let mut result = Self::new(
            signed_document,
            SubmissionStatus::Rejected,
            reply.message.clone(),
        );
        result.status_code = reply.status_code;
        result.protocol_document = reply.raw.clone();
        result.protocol_at = parse_timestamp(reply.received_at.as_deref());
        result
            .errors
            .push(format!("{} - {}", reply.status_code, reply.message));
        result
    }

    /// Reads the per-document outcome of a processed batch.
    fn from_protocol(signed_document: &str, reply: &AuthorityReply) -> Self {
        let Some(inner) = reply.protocol.as_ref() else {
            return Self::error(
                signed_document,
                format!(
                    "batch processed ({}) but the reply carries no document protocol",
                    reply.status_code
                ),
            );
        };

        let authorized = transition_for(inner.status_code) == Transition::Authorized;
        let status = if authorized {
            SubmissionStatus::Authorized
        } else {
            SubmissionStatus::Rejected
        };
        let mut result = Self::new(signed_document, status, inner.message.clone());
        result.status_code = inner.status_code;
        result.protocol_at = parse_timestamp(inner.received_at.as_deref());
        if !inner.access_key.is_empty() {
            if let Some(sent) = result.access_key.as_deref() {
                if sent != inner.access_key {
                    result.warnings.push(format!(
                        "authority echoed access key {} for document {}",
                        inner.access_key, sent
                    ));
                }
            }
            result.access_key = Some(inner.access_key.clone());
        }

        if authorized {
            result.protocol_number =
                Some(inner.protocol_number.clone()).filter(|n| !n.is_empty());
            result.protocol_document = inner.raw.clone();
            if AuthorityStatus::from_code(inner.status_code) == AuthorityStatus::AuthorizedLate {
                result
                    .warnings
                    .push("authorized outside the issuance deadline".to_string());
            }
        } else {
            result.protocol_document = reply.raw.clone();
            result
                .errors
                .push(format!("{} - {}", inner.status_code, inner.message));
        }
        result
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsultationResult {
    pub success: bool,
    pub status: Option<AuthorityStatus>,
    pub message: String,
    pub status_code: u16,
    pub protocol_document: String,
    pub processed_at: Option<DateTime<Utc>>,
    pub protocol_number: Option<String>,
    pub inner_status_code: Option<u16>,
    pub inner_message: Option<String>,
    /// Set when no authority reply was obtained.
    pub error: Option<String>,
}

impl ConsultationResult {
    fn from_reply(reply: &AuthorityReply, success: bool) -> Self {
        let inner: Option<&InnerProtocol> = reply.protocol.as_ref();
        Self {
            success,
            status: Some(AuthorityStatus::from_code(reply.status_code)),
            message: reply.message.clone(),
            status_code: reply.status_code,
            protocol_document: inner
                .map(|p| p.raw.clone())
                .unwrap_or_else(|| reply.raw.clone()),
            processed_at: parse_timestamp(
                inner
                    .and_then(|p| p.received_at.as_deref())
                    .or(reply.received_at.as_deref()),
            ),
            protocol_number: inner
                .map(|p| p.protocol_number.clone())
                .filter(|n| !n.is_empty()),
            inner_status_code: inner.map(|p| p.status_code),
            inner_message: inner.map(|p| p.message.clone()),
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            message: error.clone(),
            error: Some(error),
            ..Self::default()
        }
    }
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub environment: Environment,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

impl GatewaySettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            environment: cfg.environment(),
            poll_attempts: cfg.sefaz.poll_attempts.max(1),
            poll_interval: Duration::from_millis(cfg.sefaz.poll_interval_ms),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            environment: Environment::Homologation,
            poll_attempts: 10,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Interprets authority replies through the status table. Never returns `Err`:
/// rejections and transport failures come back as unsuccessful results.
pub struct SefazGateway {
    transport: Arc<dyn AuthorityTransport>,
    settings: GatewaySettings,
}

impl SefazGateway {
    pub fn new(transport: Arc<dyn AuthorityTransport>, settings: GatewaySettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    pub fn environment(&self) -> Environment {
        self.settings.environment
    }

    pub async fn verify_service_status(&self) -> bool {
        match self.transport.service_status().await {
            Ok(reply) => {
                let available = transition_for(reply.status_code) == Transition::Available;
                if available {
                    tracing::debug!(code = reply.status_code, "authority service operational");
                } else {
                    tracing::warn!(
                        code = reply.status_code,
                        message = %reply.message,
                        "authority service unavailable"
                    );
                }
                available
            }
            Err(e) => {
                tracing::warn!(error = %e, "authority status check failed");
                false
            }
        }
    }

    /// Sends one signed document as a batch and follows it to a final outcome.
    pub async fn submit(&self, signed_document: &str) -> SubmissionResult {
        if let Err(e) = parse_document_summary(signed_document) {
            return SubmissionResult::error(
                signed_document,
                format!("signed document is unreadable: {e}"),
            );
        }

        let batch_id = batch_id();
        let reply = match self.transport.send_batch(&batch_id, signed_document).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(%batch_id, error = %format!("{e:#}"), "batch submission failed");
                return SubmissionResult::error(
                    signed_document,
                    format!("transport error while sending batch: {e:#}"),
                );
            }
        };
        tracing::info!(
            %batch_id,
            code = reply.status_code,
            message = %reply.message,
            "batch sent"
        );

        let result = self.resolve(signed_document, reply).await;
        match result.status {
            SubmissionStatus::Authorized => tracing::info!(
                access_key = result.access_key.as_deref().unwrap_or_default(),
                protocol = result.protocol_number.as_deref().unwrap_or_default(),
                "document authorized"
            ),
            SubmissionStatus::Rejected => tracing::warn!(
                code = result.status_code,
                message = %result.message,
                "document rejected"
            ),
            SubmissionStatus::Error => tracing::error!(message = %result.message, "submission failed"),
        }
        result
    }

    async fn resolve(&self, signed_document: &str, reply: AuthorityReply) -> SubmissionResult {
        match transition_for(reply.status_code) {
            Transition::Authorized if reply.protocol.is_none() => {
                let mut result = SubmissionResult::new(
                    signed_document,
                    SubmissionStatus::Authorized,
                    reply.message.clone(),
                );
                result.status_code = reply.status_code;
                result.protocol_document = reply.raw.clone();
                result.protocol_at = parse_timestamp(reply.received_at.as_deref());
                result
            }
            Transition::Authorized | Transition::ReadInner => {
                SubmissionResult::from_protocol(signed_document, &reply)
            }
            Transition::AwaitBatch => match reply.receipt.as_deref() {
                Some(receipt) => self.await_batch(signed_document, receipt).await,
                None => SubmissionResult::error(
                    signed_document,
                    "batch received but the reply carries no receipt".to_string(),
                ),
            },
            _ => SubmissionResult::rejected(signed_document, &reply),
        }
    }

    async fn await_batch(&self, signed_document: &str, receipt: &str) -> SubmissionResult {
        for attempt in 1..=self.settings.poll_attempts {
            sleep(self.settings.poll_interval).await;
            let reply = match self.transport.consult_receipt(receipt).await {
                Ok(reply) => reply,
                Err(e) => {
                    return SubmissionResult::error(
                        signed_document,
                        format!("transport error while polling receipt {receipt}: {e:#}"),
                    )
                }
            };
            tracing::debug!(receipt, attempt, code = reply.status_code, "receipt polled");

            match transition_for(reply.status_code) {
                Transition::KeepPolling => continue,
                Transition::ReadInner | Transition::Authorized => {
                    return SubmissionResult::from_protocol(signed_document, &reply)
                }
                _ => return SubmissionResult::rejected(signed_document, &reply),
            }
        }

        SubmissionResult::error(
            signed_document,
            format!(
                "batch {receipt} still processing after {} polls",
                self.settings.poll_attempts
            ),
        )
    }

    /// One receipt consultation; successful only when the batch is processed (104).
    pub async fn poll_batch(&self, receipt: &str) -> ConsultationResult {
        match self.transport.consult_receipt(receipt).await {
            Ok(reply) => {
                let done = transition_for(reply.status_code) == Transition::ReadInner;
                ConsultationResult::from_reply(&reply, done)
            }
            Err(e) => ConsultationResult::failed(format!("transport error: {e:#}")),
        }
    }

    /// Current authority record for a document; successful when it is authorized.
    pub async fn consult_protocol(&self, access_key: &str) -> ConsultationResult {
        if let Err(e) = validate_access_key(access_key) {
            return ConsultationResult::failed(e.to_string());
        }
        match self.transport.consult_protocol(access_key).await {
            Ok(reply) => {
                let authorized = AuthorityStatus::from_code(reply.status_code).is_authorized()
                    || reply
                        .protocol
                        .as_ref()
                        .is_some_and(|p| AuthorityStatus::from_code(p.status_code).is_authorized());
                ConsultationResult::from_reply(&reply, authorized)
            }
            Err(e) => ConsultationResult::failed(format!("transport error: {e:#}")),
        }
    }
}

/// 15-digit batch id (`idLote`) from the current time.
fn batch_id() -> String {
    let millis = Utc::now().timestamp_millis().unsigned_abs();
    format!("{:015}", millis % 1_000_000_000_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{BatchMode, SimulatedTransport};
    use anyhow::{bail, Result};
    use async_trait::async_trait;

    const KEY: &str = "35240612345678000195550010000000011123456787";

    fn doc() -> String {
        format!(
            r#"<NFe xmlns="http://www.portalfiscal.inf.br/nfe"><infNFe versao="4.00" Id="NFe{KEY}"><ide><serie>1</serie><nNF>1</nNF></ide></infNFe></NFe>"#
        )
    }

    fn settings(poll_attempts: u32) -> GatewaySettings {
        GatewaySettings {
            environment: Environment::Homologation,
            poll_attempts,
            poll_interval: Duration::from_millis(1),
        }
    }

    fn gateway(transport: SimulatedTransport, poll_attempts: u32) -> SefazGateway {
        SefazGateway::new(
            Arc::new(transport.with_latency(Duration::ZERO)),
            settings(poll_attempts),
        )
    }

    struct Offline;

    #[async_trait]
    impl AuthorityTransport for Offline {
        async fn service_status(&self) -> Result<AuthorityReply> {
            bail!("connection refused")
        }
        async fn send_batch(&self, _: &str, _: &str) -> Result<AuthorityReply> {
            bail!("connection refused")
        }
        async fn consult_receipt(&self, _: &str) -> Result<AuthorityReply> {
            bail!("connection refused")
        }
        async fn consult_protocol(&self, _: &str) -> Result<AuthorityReply> {
            bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn synchronous_authorization() {
        let gw = gateway(SimulatedTransport::new(), 3);
        assert!(gw.verify_service_status().await);

        let result = gw.submit(&doc()).await;
        assert!(result.success);
        assert_eq!(result.status, SubmissionStatus::Authorized);
        assert_eq!(result.status_code, 100);
        assert_eq!(result.access_key.as_deref(), Some(KEY));
        assert_eq!(result.document_number, Some(1));
        assert_eq!(result.series, Some(1));
        assert_eq!(result.protocol_number.as_ref().map(String::len), Some(15));
        assert!(result.protocol_document.starts_with("<protNFe"));
        assert!(result.protocol_at.is_some());
        assert_eq!(result.signed_document, doc());
    }

    #[tokio::test]
    async fn receipt_is_polled_until_processed() {
        let t = SimulatedTransport::new().with_mode(BatchMode::Receipt { processing_polls: 2 });
        let result = gateway(t, 5).submit(&doc()).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.status_code, 100);
    }

    #[tokio::test]
    async fn poll_exhaustion_is_an_error() {
        let t = SimulatedTransport::new().with_mode(BatchMode::Receipt { processing_polls: 5 });
        let result = gateway(t, 2).submit(&doc()).await;
        assert!(!result.success);
        assert_eq!(result.status, SubmissionStatus::Error);
        assert!(result.message.contains("still processing"));
    }

    #[tokio::test]
    async fn rejection_carries_code_and_message() {
        let t = SimulatedTransport::new().rejecting(539, "Rejeicao: Duplicidade de NF-e");
        let result = gateway(t, 3).submit(&doc()).await;
        assert!(!result.success);
        assert_eq!(result.status, SubmissionStatus::Rejected);
        assert_eq!(result.status_code, 539);
        assert_eq!(result.message, "Rejeicao: Duplicidade de NF-e");
        assert!(result.protocol_number.is_none());
        assert_eq!(result.access_key.as_deref(), Some(KEY));
    }

    #[tokio::test]
    async fn denial_codes_are_rejections() {
        let t = SimulatedTransport::new().rejecting(302, "Uso Denegado");
        let result = gateway(t, 3).submit(&doc()).await;
        assert_eq!(result.status, SubmissionStatus::Rejected);
        assert_eq!(result.status_code, 302);
    }

    #[tokio::test]
    async fn late_authorization_warns() {
        let t = SimulatedTransport::new().rejecting(150, "Autorizado fora de prazo");
        let result = gateway(t, 3).submit(&doc()).await;
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_is_not_an_err() {
        let gw = SefazGateway::new(Arc::new(Offline), settings(3));
        assert!(!gw.verify_service_status().await);

        let result = gw.submit(&doc()).await;
        assert!(!result.success);
        assert_eq!(result.status, SubmissionStatus::Error);
        assert_eq!(result.status_code, 0);
        assert!(result.message.contains("connection refused"));

        let consult = gw.consult_protocol(KEY).await;
        assert!(!consult.success);
        assert!(consult.error.is_some());
    }

    #[tokio::test]
    async fn unavailable_service() {
        let t = SimulatedTransport::new();
        t.set_available(false);
        assert!(!gateway(t, 3).verify_service_status().await);
    }

    #[tokio::test]
    async fn consult_after_authorization() {
        let t = Arc::new(SimulatedTransport::new().with_latency(Duration::ZERO));
        let gw = SefazGateway::new(t.clone(), settings(3));
        let before = gw.consult_protocol(KEY).await;
        assert!(!before.success);
        assert_eq!(before.status_code, 217);

        let submitted = gw.submit(&doc()).await;
        let after = gw.consult_protocol(KEY).await;
        assert!(after.success);
        assert_eq!(after.protocol_number, submitted.protocol_number);
        assert_eq!(after.inner_status_code, Some(100));
    }

    #[tokio::test]
    async fn invalid_key_is_not_sent() {
        let gw = SefazGateway::new(Arc::new(Offline), settings(1));
        let result = gw.consult_protocol("123").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("44 digits"));
    }

    #[tokio::test]
    async fn poll_batch_succeeds_only_when_processed() {
        let t = Arc::new(
            SimulatedTransport::new()
                .with_latency(Duration::ZERO)
                .with_mode(BatchMode::Receipt { processing_polls: 1 }),
        );
        let receipt = t.send_batch("1", &doc()).await.unwrap().receipt.unwrap();
        let gw = SefazGateway::new(t, settings(1));
        let first = gw.poll_batch(&receipt).await;
        assert!(!first.success);
        assert_eq!(first.status, Some(AuthorityStatus::BatchProcessing));
        let second = gw.poll_batch(&receipt).await;
        assert!(second.success);
        assert_eq!(second.inner_status_code, Some(100));
    }

    #[test]
    fn batch_ids_are_fifteen_digits() {
        let id = batch_id();
        assert_eq!(id.len(), 15);
        assert!(id.bytes().all(|b| b.is_ascii_digit()));
    }
}
