//! In-process stand-in for the authority, used in non-production deployments and tests.

use super::envelopes::parse_reply;
use super::{AuthorityReply, AuthorityTransport};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use nfe_core::document::NFE_NAMESPACE;
use nfe_core::parsing::parse_document_summary;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::time::{sleep, Duration};

/// How batches are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// `send_batch` answers 104 with the document protocol inline.
    Synchronous,
    /// `send_batch` answers 103 with a receipt; `consult_receipt` answers 105
    /// `processing_polls` times, then 104.
    Receipt { processing_polls: u32 },
}

#[derive(Debug, Clone)]
struct Outcome {
    code: u16,
    message: String,
}

struct PendingBatch {
    remaining: u32,
    access_key: String,
}

pub struct SimulatedTransport {
    available: AtomicBool,
    unreachable: AtomicBool,
    mode: BatchMode,
    outcome: Mutex<Outcome>,
    latency: Duration,
    next_receipt: AtomicU32,
    batches: Mutex<HashMap<String, PendingBatch>>,
    issued: Mutex<HashMap<String, String>>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self {
            available: AtomicBool::new(true),
            unreachable: AtomicBool::new(false),
            mode: BatchMode::Synchronous,
            outcome: Mutex::new(Outcome {
                code: 100,
                message: "Autorizado o uso da NF-e".to_string(),
            }),
            latency: Duration::from_millis(200),
            next_receipt: AtomicU32::new(1),
            batches: Mutex::new(HashMap::new()),
            issued: Mutex::new(HashMap::new()),
        }
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_mode(mut self, mode: BatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Every following document is answered with this status instead of 100.
    pub fn rejecting(self, code: u16, message: impl Into<String>) -> Self {
        self.set_outcome(code, message);
        self
    }

    pub fn set_outcome(&self, code: u16, message: impl Into<String>) {
        if let Ok(mut outcome) = self.outcome.lock() {
            *outcome = Outcome {
                code,
                message: message.into(),
            };
        }
    }

    /// Toggles the status service between 107 and 108.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes every call fail as if the network were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    async fn round_trip(&self) -> Result<()> {
        // simulate network latency
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            bail!("simulated authority is unreachable");
        }
        Ok(())
    }

    fn outcome(&self) -> Outcome {
        self.outcome
            .lock()
            .map(|o| o.clone())
            .unwrap_or(Outcome {
                code: 999,
                message: "Rejeicao: Erro nao catalogado".to_string(),
            })
    }

    /// Builds `protNFe` for `access_key` and remembers it when authorized.
    fn protocol_for(&self, access_key: &str) -> String {
        let outcome = self.outcome();
        let now = timestamp();
        let protocol_number = if outcome.code == 100 || outcome.code == 150 {
            let region = access_key.get(0..2).unwrap_or("35");
            let suffix: u64 = rand::thread_rng().gen_range(0..10_000_000_000);
            format!("1{}{}{:010}", region, &now[2..4], suffix)
        } else {
            String::new()
        };
        let prot = format!(
            r#"<protNFe versao="4.00"><infProt><tpAmb>2</tpAmb><verAplic>SIMULATED</verAplic><chNFe>{}</chNFe><dhRecbto>{}</dhRecbto><nProt>{}</nProt><cStat>{}</cStat><xMotivo>{}</xMotivo></infProt></protNFe>"#,
            access_key, now, protocol_number, outcome.code, outcome.message
        );
        if !protocol_number.is_empty() {
            if let Ok(mut issued) = self.issued.lock() {
                issued.insert(access_key.to_string(), prot.clone());
            }
        }
        prot
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn reply(element: &str, code: u16, message: &str, extra: &str) -> Result<AuthorityReply> {
    let xml = format!(
        r#"<{element} xmlns="{NFE_NAMESPACE}" versao="4.00"><tpAmb>2</tpAmb><verAplic>SIMULATED</verAplic><cStat>{code}</cStat><xMotivo>{message}</xMotivo><cUF>35</cUF><dhRecbto>{}</dhRecbto>{extra}</{element}>"#,
        timestamp()
    );
    parse_reply(&xml)
}

#[async_trait]
impl AuthorityTransport for SimulatedTransport {
    async fn service_status(&self) -> Result<AuthorityReply> {
        self.round_trip().await?;
        if self.available.load(Ordering::SeqCst) {
            reply("retConsStatServ", 107, "Servico em Operacao", "")
        } else {
            reply("retConsStatServ", 108, "Servico Paralisado Momentaneamente", "")
        }
    }

    async fn send_batch(&self, batch_id: &str, signed_document: &str) -> Result<AuthorityReply> {
        self.round_trip().await?;
        let summary = match parse_document_summary(signed_document) {
            Ok(summary) => summary,
            Err(_) => return reply("retEnviNFe", 225, "Rejeicao: Falha no Schema XML da NFe", ""),
        };
        tracing::debug!(batch_id, access_key = %summary.access_key, "simulated batch received");

        match self.mode {
            BatchMode::Synchronous => {
                let prot = self.protocol_for(&summary.access_key);
                reply("retEnviNFe", 104, "Lote processado", &prot)
            }
            BatchMode::Receipt { processing_polls } => {
                let n = self.next_receipt.fetch_add(1, Ordering::SeqCst);
                let receipt = format!("35{:013}", n);
                if let Ok(mut batches) = self.batches.lock() {
                    batches.insert(
                        receipt.clone(),
                        PendingBatch {
                            remaining: processing_polls,
                            access_key: summary.access_key,
                        },
                    );
                }
                let inf = format!("<infRec><nRec>{receipt}</nRec><tMed>1</tMed></infRec>");
                reply("retEnviNFe", 103, "Lote recebido com sucesso", &inf)
            }
        }
    }

    async fn consult_receipt(&self, receipt: &str) -> Result<AuthorityReply> {
        self.round_trip().await?;
        let access_key = {
            let mut batches = match self.batches.lock() {
                Ok(b) => b,
                Err(_) => bail!("simulated batch table is poisoned"),
            };
            let done = batches.get_mut(receipt).map(|batch| {
                if batch.remaining > 0 {
                    batch.remaining -= 1;
                    false
                } else {
                    true
                }
            });
            match done {
                None => None,
                Some(false) => Some(None),
                Some(true) => batches.remove(receipt).map(|b| Some(b.access_key)),
            }
        };

        let rec = format!("<nRec>{receipt}</nRec>");
        match access_key {
            None => reply("retConsReciNFe", 223, "Rejeicao: Recibo nao encontrado", &rec),
            Some(None) => reply("retConsReciNFe", 105, "Lote em processamento", &rec),
            Some(Some(key)) => {
                let prot = self.protocol_for(&key);
                reply("retConsReciNFe", 104, "Lote processado", &format!("{rec}{prot}"))
            }
        }
    }

    async fn consult_protocol(&self, access_key: &str) -> Result<AuthorityReply> {
        self.round_trip().await?;
        let prot = self
            .issued
            .lock()
            .ok()
            .and_then(|issued| issued.get(access_key).cloned());
        let key = format!("<chNFe>{access_key}</chNFe>");
        match prot {
            Some(prot) => reply(
                "retConsSitNFe",
                100,
                "Autorizado o uso da NF-e",
                &format!("{key}{prot}"),
            ),
            None => reply(
                "retConsSitNFe",
                217,
                "Rejeicao: NF-e nao consta na base de dados da SEFAZ",
                &key,
            ),
        }
    }
}
