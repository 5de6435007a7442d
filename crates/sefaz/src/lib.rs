use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Per-document protocol (`protNFe/infProt`) inside an authority reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerProtocol {
    pub access_key: String,
    pub protocol_number: String,
    pub status_code: u16,
    pub message: String,
    pub received_at: Option<String>,
    /// The `protNFe` element as returned.
    pub raw: String,
}

/// Parsed authority response. `raw` keeps the full reply verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityReply {
    pub status_code: u16,
    pub message: String,
    pub receipt: Option<String>,
    pub received_at: Option<String>,
    pub protocol: Option<InnerProtocol>,
    pub raw: String,
}

/// Wire access to the authority's four web services. Errors mean no usable reply
/// was obtained (network, HTTP status, SOAP fault, unparsable body).
#[async_trait]
pub trait AuthorityTransport: Send + Sync {
    async fn service_status(&self) -> Result<AuthorityReply>;
    async fn send_batch(&self, batch_id: &str, signed_document: &str) -> Result<AuthorityReply>;
    async fn consult_receipt(&self, receipt: &str) -> Result<AuthorityReply>;
    async fn consult_protocol(&self, access_key: &str) -> Result<AuthorityReply>;
}

pub mod envelopes;
pub mod gateway;
pub mod simulated;
pub mod soap;
pub mod status;

pub use gateway::{ConsultationResult, GatewaySettings, SefazGateway, SubmissionResult, SubmissionStatus};
pub use status::{AuthorityStatus, Transition};
