use super::envelopes::{
    batch_request, parse_reply, protocol_request, receipt_request, soap_envelope, status_request,
    Service,
};
use super::{AuthorityReply, AuthorityTransport};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use certificate::CertificateProvider;
use config::SefazEndpoints;
use nfe_core::Environment;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// SOAP 1.2 client for the authority's NFe 4.00 web services.
///
/// With a certificate provider attached, requests go out over mutual TLS using the
/// current signing certificate as client identity. The HTTP client is rebuilt whenever
/// the certificate's thumbprint changes.
pub struct HttpTransport {
    endpoints: SefazEndpoints,
    environment: Environment,
    region_code: u8,
    timeout: Duration,
    identity: Option<Arc<CertificateProvider>>,
    client: Mutex<Option<(String, reqwest::Client)>>,
}

impl HttpTransport {
    pub fn new(
        endpoints: SefazEndpoints,
        environment: Environment,
        region_code: u8,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoints,
            environment,
            region_code,
            timeout,
            identity: None,
            client: Mutex::new(None),
        }
    }

    pub fn with_client_identity(mut self, provider: Arc<CertificateProvider>) -> Self {
        self.identity = Some(provider);
        self
    }

    async fn client(&self) -> Result<reqwest::Client> {
        let identity = match &self.identity {
            Some(provider) => Some(
                provider
                    .acquire()
                    .await
                    .context("Failed to acquire client certificate")?,
            ),
            None => None,
        };
        let thumbprint = identity
            .as_ref()
            .map(|c| c.handle().thumbprint.clone())
            .unwrap_or_default();

        let mut slot = self.client.lock().await;
        if let Some((cached, client)) = slot.as_ref() {
            if *cached == thumbprint {
                return Ok(client.clone());
            }
        }

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .tcp_keepalive(Duration::from_secs(60));
        if let Some(cert) = identity {
            let pem = cert.certificate_pem();
            let key = cert.private_key_pem()?;
            let id = reqwest::Identity::from_pkcs8_pem(pem.as_bytes(), key.as_bytes())
                .context("Failed to build TLS client identity")?;
            builder = builder.identity(id);
            tracing::info!(%thumbprint, "authority client identity loaded");
        }
        let client = builder.build().context("Failed to create HTTP client")?;
        *slot = Some((thumbprint, client.clone()));
        Ok(client)
    }

    async fn call(&self, service: Service, url: &str, body: String) -> Result<AuthorityReply> {
        let client = self.client().await?;
        let response = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, service.content_type())
            .body(soap_envelope(service, &body))
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", service.wsdl()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read {} response", service.wsdl()))?;
        if !status.is_success() {
            let detail = match parse_reply(&text) {
                Err(e) => e.to_string(),
                Ok(_) => text.chars().take(200).collect(),
            };
            bail!("{} failed: HTTP {} - {}", service.wsdl(), status, detail);
        }

        let reply = parse_reply(&text)
            .with_context(|| format!("Failed to parse {} response", service.wsdl()))?;
        tracing::debug!(
            service = service.wsdl(),
            code = reply.status_code,
            message = %reply.message,
            "authority replied"
        );
        Ok(reply)
    }
}

#[async_trait]
impl AuthorityTransport for HttpTransport {
    async fn service_status(&self) -> Result<AuthorityReply> {
        let body = status_request(self.environment.code(), self.region_code);
        self.call(Service::Status, &self.endpoints.status, body).await
    }

    async fn send_batch(&self, batch_id: &str, signed_document: &str) -> Result<AuthorityReply> {
        let body = batch_request(batch_id, signed_document);
        self.call(Service::Authorization, &self.endpoints.authorization, body)
            .await
    }

    async fn consult_receipt(&self, receipt: &str) -> Result<AuthorityReply> {
        let body = receipt_request(self.environment.code(), receipt);
        self.call(Service::Receipt, &self.endpoints.receipt, body).await
    }

    async fn consult_protocol(&self, access_key: &str) -> Result<AuthorityReply> {
        let body = protocol_request(self.environment.code(), access_key);
        self.call(Service::Protocol, &self.endpoints.protocol, body).await
    }
}
