use async_trait::async_trait;
use certificate::{CertificateProvider, ProviderSettings, SelfSignedSource};
use config::Deployment;
use nfe_core::{
    Environment, IssuerProfile, LineItem, NfeResult, NfeXmlBuilder, Sale, SaleStatus,
};
use once_cell::sync::Lazy;
use processing::{
    AuditEvent, AuditLog, DocumentSigner, MemoryStore, ProtocolStore, SaleProcessor, SaleStore,
    Sweeper,
};
use rust_decimal_macros::dec;
use sefaz::simulated::SimulatedTransport;
use sefaz::{GatewaySettings, SefazGateway};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

static PROVIDER: Lazy<Arc<CertificateProvider>> = Lazy::new(|| {
    let source = SelfSignedSource::new("CN=Processing Test", Deployment::NonProduction).unwrap();
    Arc::new(CertificateProvider::new(
        Arc::new(source),
        ProviderSettings {
            production: false,
            ..ProviderSettings::default()
        },
    ))
});

struct EmptySigner;

#[async_trait]
impl DocumentSigner for EmptySigner {
    async fn sign(&self, _document: &str) -> NfeResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

fn issuer() -> IssuerProfile {
    IssuerProfile {
        cnpj: "12.345.678/0001-95".into(),
        legal_name: "Loja Exemplo Ltda".into(),
        trade_name: "Loja Exemplo".into(),
        state_registration: "111222333444".into(),
        address: "Avenida Paulista".into(),
        address_number: "1000".into(),
        district: "Bela Vista".into(),
        postal_code: "01310100".into(),
        environment: Environment::Homologation,
        ..IssuerProfile::default()
    }
}

fn valid_sale() -> Sale {
    Sale::new("Maria Silva", "123.456.789-09", "Rua das Flores, 10")
        .with_item(LineItem::new("A1", "Caderno", 2, dec!(10.50)).ncm("48202000"))
        .with_item(LineItem::new("B2", "Caneta", 3, dec!(2.00)).ncm("96081000"))
}

struct Harness {
    store: Arc<MemoryStore>,
    transport: Arc<SimulatedTransport>,
    processor: Arc<SaleProcessor>,
    dir: TempDir,
}

impl Harness {
    fn new(transport: SimulatedTransport) -> Self {
        Self::with_signer(transport, PROVIDER.clone())
    }

    fn with_signer(transport: SimulatedTransport, signer: Arc<dyn DocumentSigner>) -> Self {
        Self::build(transport.with_latency(Duration::ZERO), signer)
    }

    fn build(transport: SimulatedTransport, signer: Arc<dyn DocumentSigner>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(transport);
        let gateway = Arc::new(SefazGateway::new(
            transport.clone(),
            GatewaySettings {
                environment: Environment::Homologation,
                poll_attempts: 3,
                poll_interval: Duration::from_millis(1),
            },
        ));
        let processor = Arc::new(SaleProcessor::new(
            store.clone(),
            store.clone(),
            signer,
            gateway,
            Arc::new(NfeXmlBuilder::default()),
            issuer(),
            Arc::new(AuditLog::new(dir.path().join("audit.jsonl"))),
        ));
        Self {
            store,
            transport,
            processor,
            dir,
        }
    }

    fn add(&self, sale: &Sale) {
        SaleStore::add(self.store.as_ref(), sale).unwrap();
    }

    fn sale(&self, sale: &Sale) -> Sale {
        SaleStore::get_by_id(self.store.as_ref(), sale.id)
            .unwrap()
            .unwrap()
    }

    fn audit(&self) -> Vec<AuditEvent> {
        std::fs::read_to_string(self.dir.path().join("audit.jsonl"))
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }
}

#[tokio::test]
async fn valid_sale_is_authorized() {
    let h = Harness::new(SimulatedTransport::new());
    let sale = valid_sale();
    h.add(&sale);

    let status = h.processor.process_sale(sale.id).await.unwrap();
    assert_eq!(status, Some(SaleStatus::Authorized));

    let stored = h.sale(&sale);
    assert_eq!(stored.status, SaleStatus::Authorized);
    assert_eq!(stored.document_number, Some(1));
    assert_eq!(stored.series, Some(1));
    let key = stored.access_key.clone().unwrap();
    assert_eq!(key.len(), 44);
    assert!(key.starts_with("35"));
    assert_eq!(&key[6..20], "12345678000195");

    let protocol = h.store.get_latest_for_sale(sale.id).unwrap().unwrap();
    assert_eq!(protocol.status, SaleStatus::Authorized);
    assert_eq!(protocol.access_key, key);
    assert_eq!(protocol.protocol_number.len(), 15);
    assert_eq!(protocol.status_code, 100);
    assert!(protocol.signed_document.contains("<Signature"));
    assert!(protocol.response_document.contains("<protNFe"));

    let events = h.audit();
    assert_eq!(events.first().unwrap().event_type, "sale_claimed");
    assert!(events.iter().any(|e| e.event_type == "document_signed" && e.document_hash.is_some()));
    let last = events.last().unwrap();
    assert_eq!(last.event_type, "sale_finished");
    assert_eq!(last.status, SaleStatus::Authorized);
}

#[tokio::test]
async fn unavailable_authority_marks_error() {
    let transport = SimulatedTransport::new();
    transport.set_available(false);
    let h = Harness::new(transport);
    let sale = valid_sale();
    h.add(&sale);

    let status = h.processor.process_sale(sale.id).await.unwrap();
    assert_eq!(status, Some(SaleStatus::Error));

    let stored = h.sale(&sale);
    assert!(stored.access_key.is_none());
    let protocol = h.store.get_latest_for_sale(sale.id).unwrap().unwrap();
    assert_eq!(protocol.status, SaleStatus::Error);
    assert!(protocol.message.contains("not operational"), "{}", protocol.message);
    assert!(protocol.protocol_number.is_empty());
}

#[tokio::test]
async fn invalid_sale_lists_every_violation() {
    let h = Harness::new(SimulatedTransport::new());
    let sale = Sale::new("", "123.456.789-09", "Rua das Flores, 10")
        .with_item(LineItem::new("A1", "Caderno", 1, dec!(5.00)));
    h.add(&sale);

    let status = h.processor.process_sale(sale.id).await.unwrap();
    assert_eq!(status, Some(SaleStatus::Error));

    let protocol = h.store.get_latest_for_sale(sale.id).unwrap().unwrap();
    assert!(protocol.message.contains("Client name is mandatory"));
    assert!(protocol.message.contains("Item 1: NCM is mandatory"));
    assert!(h.sale(&sale).document_number.is_none());
}

#[tokio::test]
async fn rejection_is_recorded_with_code() {
    let h = Harness::new(SimulatedTransport::new().rejecting(539, "Rejeicao: Duplicidade de NF-e"));
    let sale = valid_sale();
    h.add(&sale);

    let status = h.processor.process_sale(sale.id).await.unwrap();
    assert_eq!(status, Some(SaleStatus::Rejected));

    let stored = h.sale(&sale);
    let protocol = h.store.get_latest_for_sale(sale.id).unwrap().unwrap();
    assert_eq!(protocol.status, SaleStatus::Rejected);
    assert_eq!(protocol.status_code, 539);
    assert_eq!(protocol.message, "Rejeicao: Duplicidade de NF-e");
    assert_eq!(Some(protocol.access_key), stored.access_key);
    assert!(protocol.protocol_number.is_empty());
}

#[tokio::test]
async fn unreachable_authority_marks_error() {
    let h = Harness::new(SimulatedTransport::new());
    let sale = valid_sale();
    h.add(&sale);
    h.transport.set_unreachable(true);

    let status = h.processor.process_sale(sale.id).await.unwrap();
    assert_eq!(status, Some(SaleStatus::Error));
}

#[tokio::test]
async fn empty_signature_marks_error() {
    let h = Harness::with_signer(SimulatedTransport::new(), Arc::new(EmptySigner));
    let sale = valid_sale();
    h.add(&sale);

    let status = h.processor.process_sale(sale.id).await.unwrap();
    assert_eq!(status, Some(SaleStatus::Error));
    let protocol = h.store.get_latest_for_sale(sale.id).unwrap().unwrap();
    assert!(protocol.message.contains("empty"));
    assert!(h.sale(&sale).access_key.is_some());
}

#[tokio::test]
async fn only_pending_sales_are_processed() {
    let h = Harness::new(SimulatedTransport::new());
    let sale = valid_sale();
    h.add(&sale);

    assert!(h.processor.process_sale(sale.id).await.unwrap().is_some());
    assert_eq!(h.processor.process_sale(sale.id).await.unwrap(), None);
    assert_eq!(h.store.get_by_sale_id(sale.id).unwrap().len(), 1);
    assert_eq!(h.processor.process_sale(uuid::Uuid::new_v4()).await.unwrap(), None);
}

#[tokio::test]
async fn document_numbers_and_keys_are_unique() {
    let h = Harness::new(SimulatedTransport::new());
    let first = valid_sale();
    let second = valid_sale();
    h.add(&first);
    h.add(&second);

    h.processor.process_sale(first.id).await.unwrap();
    h.processor.process_sale(second.id).await.unwrap();

    let a = h.sale(&first);
    let b = h.sale(&second);
    assert_eq!(a.document_number, Some(1));
    assert_eq!(b.document_number, Some(2));
    assert_ne!(a.access_key, b.access_key);
}

#[tokio::test]
async fn interrupted_sale_keeps_its_number_on_resume() {
    let h = Harness::new(SimulatedTransport::new());
    let mut sale = valid_sale();
    sale.status = SaleStatus::Processing;
    sale.series = Some(1);
    sale.document_number = Some(42);
    h.add(&sale);

    assert_eq!(h.processor.resume_interrupted().await.unwrap(), 1);
    let stored = h.sale(&sale);
    assert_eq!(stored.status, SaleStatus::Authorized);
    assert_eq!(stored.document_number, Some(42));
    assert_eq!(&stored.access_key.unwrap()[25..34], "000000042");
    assert_eq!(h.processor.resume_interrupted().await.unwrap(), 0);
}

#[tokio::test]
async fn resume_finishes_sale_authorized_before_interruption() {
    let h = Harness::new(SimulatedTransport::new());
    let sale = valid_sale();
    h.add(&sale);
    assert_eq!(
        h.processor.process_sale(sale.id).await.unwrap(),
        Some(SaleStatus::Authorized)
    );
    let first = h.store.get_latest_for_sale(sale.id).unwrap().unwrap();

    // authorized at the authority, outcome never persisted locally
    let mut interrupted = h.sale(&sale);
    interrupted.status = SaleStatus::Processing;
    SaleStore::update(h.store.as_ref(), &interrupted).unwrap();
    h.transport.set_outcome(539, "Rejeicao: Duplicidade de NF-e");

    assert_eq!(h.processor.resume_interrupted().await.unwrap(), 1);
    let stored = h.sale(&sale);
    assert_eq!(stored.status, SaleStatus::Authorized);
    assert_eq!(stored.access_key, interrupted.access_key);
    assert_eq!(stored.document_number, interrupted.document_number);

    let history = h.store.get_by_sale_id(sale.id).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|p| p.status == SaleStatus::Authorized));
    assert_eq!(history[1].protocol_number, first.protocol_number);
    assert_eq!(history[1].status_code, 100);
    let finished = h
        .audit()
        .iter()
        .filter(|e| e.event_type == "sale_finished" && e.status == SaleStatus::Authorized)
        .count();
    assert_eq!(finished, 2);
}

#[tokio::test]
async fn sweep_processes_all_pending_sales() {
    let h = Harness::new(SimulatedTransport::new());
    let sales: Vec<Sale> = (0..4).map(|_| valid_sale()).collect();
    for s in &sales {
        h.add(s);
    }

    let sweeper = Sweeper::new(h.processor.clone(), Duration::from_secs(60), 2);
    let (_tx, rx) = watch::channel(false);
    assert_eq!(sweeper.sweep_once(&rx).await.unwrap(), 4);
    assert!(h.store.get_pending().unwrap().is_empty());
    assert_eq!(
        h.store.get_by_status(SaleStatus::Authorized).unwrap().len(),
        4
    );

    let mut numbers: Vec<u32> = sales
        .iter()
        .filter_map(|s| h.sale(s).document_number)
        .collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn shutdown_while_waiting_for_a_slot_starts_nothing_more() {
    let h = Harness::build(
        SimulatedTransport::new().with_latency(Duration::from_millis(150)),
        PROVIDER.clone(),
    );
    let now = chrono::Utc::now();
    let first = valid_sale().sold_at(now - chrono::Duration::minutes(1));
    let second = valid_sale().sold_at(now);
    h.add(&first);
    h.add(&second);

    let sweeper = Sweeper::new(h.processor.clone(), Duration::from_secs(60), 1);
    let (tx, rx) = watch::channel(false);
    let sweep = tokio::spawn(async move { sweeper.sweep_once(&rx).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    assert_eq!(sweep.await.unwrap().unwrap(), 1);

    assert_eq!(h.sale(&first).status, SaleStatus::Authorized);
    assert_eq!(h.sale(&second).status, SaleStatus::Pending);
}

#[tokio::test]
async fn sweeper_stops_on_shutdown() {
    let h = Harness::new(SimulatedTransport::new());
    h.add(&valid_sale());

    let sweeper = Sweeper::new(h.processor.clone(), Duration::from_secs(3600), 1);
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { sweeper.run(rx).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(30), handle)
        .await
        .expect("sweeper did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn shutdown_before_sweep_starts_nothing() {
    let h = Harness::new(SimulatedTransport::new());
    let sale = valid_sale();
    h.add(&sale);

    let sweeper = Sweeper::new(h.processor.clone(), Duration::from_secs(3600), 1);
    let (_tx, rx) = watch::channel(true);
    assert_eq!(sweeper.sweep_once(&rx).await.unwrap(), 0);
    assert_eq!(h.sale(&sale).status, SaleStatus::Pending);
}
