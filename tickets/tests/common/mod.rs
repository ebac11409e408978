//! Shared fixtures: a fake gateway and a running worker over `MemoryStream`.

#![allow(dead_code)] // Each test binary uses a different subset
#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use courier_core::correlation::current_correlation_id;
use courier_core::memory::MemoryStream;
use courier_runtime::router::RouterError;
use std::sync::{Arc, Mutex};
use tickets::clients::{ClientError, IssueReceiptRequest, ReceiptsClient, SpreadsheetsClient};
use tickets::events::{Price, Ticket, TicketStatus};
use tickets::worker::{BrokerHandle, Clients, TaskSender, Worker, WorkerConfig};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// One recorded client call.
#[derive(Clone, Debug)]
pub struct Call<T> {
    pub request: T,
    pub at: Instant,
    pub correlation_id: Option<String>,
    pub succeeded: bool,
}

#[derive(Default)]
struct GatewayState {
    receipt_failures: usize,
    receipts: Vec<Call<IssueReceiptRequest>>,
    rows: Vec<Call<(String, Vec<String>)>>,
}

/// In-memory receipts and spreadsheets services.
#[derive(Clone, Default)]
pub struct FakeGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl FakeGateway {
    /// Make the next `count` receipt calls fail.
    pub fn fail_receipts(&self, count: usize) {
        self.state.lock().unwrap().receipt_failures = count;
    }

    pub fn receipts(&self) -> Vec<Call<IssueReceiptRequest>> {
        self.state.lock().unwrap().receipts.clone()
    }

    pub fn issued_receipts(&self) -> Vec<IssueReceiptRequest> {
        self.receipts()
            .into_iter()
            .filter(|call| call.succeeded)
            .map(|call| call.request)
            .collect()
    }

    pub fn rows(&self) -> Vec<Call<(String, Vec<String>)>> {
        self.state.lock().unwrap().rows.clone()
    }

    pub fn clients(&self) -> Clients {
        Clients {
            receipts: Arc::new(self.clone()),
            spreadsheets: Arc::new(self.clone()),
        }
    }
}

#[async_trait]
impl ReceiptsClient for FakeGateway {
    async fn issue_receipt(&self, request: IssueReceiptRequest) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        let succeeded = state.receipt_failures == 0;
        if !succeeded {
            state.receipt_failures -= 1;
        }
        state.receipts.push(Call {
            request,
            at: Instant::now(),
            correlation_id: current_correlation_id(),
            succeeded,
        });

        if succeeded {
            Ok(())
        } else {
            Err(ClientError::Status {
                url: "http://gateway/receipts-api/receipts".to_string(),
                status: 503,
            })
        }
    }
}

#[async_trait]
impl SpreadsheetsClient for FakeGateway {
    async fn append_row(&self, sheet: &str, row: Vec<String>) -> Result<(), ClientError> {
        self.state.lock().unwrap().rows.push(Call {
            request: (sheet.to_string(), row),
            at: Instant::now(),
            correlation_id: current_correlation_id(),
            succeeded: true,
        });
        Ok(())
    }
}

/// A worker running on a spawned task.
pub struct Harness {
    pub broker: Arc<MemoryStream>,
    pub gateway: FakeGateway,
    pub sender: TaskSender,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), RouterError>>,
}

impl Harness {
    pub async fn start(config: WorkerConfig) -> Self {
        let broker = Arc::new(MemoryStream::default());
        let gateway = FakeGateway::default();
        let worker = Worker::new(BrokerHandle::new(broker.clone()), gateway.clients(), config).unwrap();

        let sender = worker.sender();
        let mut running = worker.running();
        let (shutdown, rx) = oneshot::channel();
        let handle = tokio::spawn(worker.run(async move {
            let _ = rx.await;
        }));
        assert!(running.wait().await, "worker failed to start");

        Self {
            broker,
            gateway,
            sender,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        self.handle.await.unwrap().unwrap();
    }
}

pub fn ticket(id: &str, status: TicketStatus) -> Ticket {
    Ticket {
        ticket_id: id.to_string(),
        status,
        customer_email: format!("{}@example.com", id.to_lowercase()),
        price: Price {
            amount: "10.00".to_string(),
            currency: "USD".to_string(),
        },
    }
}
