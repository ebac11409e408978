//! Clients of the external receipts and spreadsheets services.
//!
//! Handlers depend on the [`ReceiptsClient`] and [`SpreadsheetsClient`]
//! traits; [`GatewayClient`] implements both over the HTTP gateway. Every
//! request carries the correlation id of the message being handled in the
//! [`CORRELATION_ID_HEADER`] header.

use crate::events::Price;
use async_trait::async_trait;
use courier_core::correlation::current_correlation_id;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Header carrying the correlation id on outgoing requests.
pub const CORRELATION_ID_HEADER: &str = "Correlation-ID";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure of a call to an external service. Always worth retrying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The request could not be sent or the response not read.
    #[error("Request to {url} failed: {reason}")]
    Request {
        /// Target URL
        url: String,
        /// Transport error
        reason: String,
    },

    /// The service answered with a non-2xx status.
    #[error("{url} returned status {status}")]
    Status {
        /// Target URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    Build(String),
}

/// Request body of the receipts API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueReceiptRequest {
    /// Ticket the receipt is for
    pub ticket_id: String,
    /// Amount on the receipt
    pub price: Price,
}

/// Issues payment receipts.
///
/// Implementations must tolerate being called more than once for the same
/// ticket: deliveries are at-least-once.
#[async_trait]
pub trait ReceiptsClient: Send + Sync {
    /// Issue a receipt.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the service could not be reached or
    /// rejected the request.
    async fn issue_receipt(&self, request: IssueReceiptRequest) -> Result<(), ClientError>;
}

/// Appends rows to named spreadsheets.
///
/// Implementations must tolerate being called more than once for the same
/// row: deliveries are at-least-once.
#[async_trait]
pub trait SpreadsheetsClient: Send + Sync {
    /// Append `row` to `sheet`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the service could not be reached or
    /// rejected the request.
    async fn append_row(&self, sheet: &str, row: Vec<String>) -> Result<(), ClientError>;
}

/// HTTP client for the services behind the gateway.
///
/// # Example
///
/// ```no_run
/// use tickets::clients::{GatewayClient, IssueReceiptRequest, ReceiptsClient};
/// use tickets::events::Price;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let gateway = GatewayClient::new("http://localhost:8888")?;
/// gateway
///     .issue_receipt(IssueReceiptRequest {
///         ticket_id: "T1".to_string(),
///         price: Price { amount: "10.00".to_string(), currency: "USD".to_string() },
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct AppendRowRequest<'a> {
    columns: &'a [String],
}

impl GatewayClient {
    /// Create a client for the gateway at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Build`] if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Build(e.to_string()))?;
        Ok(Self::with_client(http, base_url))
    }

    /// Create a client around an existing `reqwest::Client`.
    #[must_use]
    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    async fn post<T: Serialize + Sync + ?Sized>(&self, path: &str, body: &T) -> Result<(), ClientError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.http.post(&url).json(body);
        if let Some(correlation_id) = current_correlation_id() {
            request = request.header(CORRELATION_ID_HEADER, correlation_id);
        }

        let response = request.send().await.map_err(|e| ClientError::Request {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(url = %url, status = status.as_u16(), "Gateway request rejected");
            return Err(ClientError::Status {
                url,
                status: status.as_u16(),
            });
        }

        tracing::debug!(url = %url, status = status.as_u16(), "Gateway request succeeded");
        Ok(())
    }
}

#[async_trait]
impl ReceiptsClient for GatewayClient {
    async fn issue_receipt(&self, request: IssueReceiptRequest) -> Result<(), ClientError> {
        self.post("/receipts-api/receipts", &request).await
    }
}

#[async_trait]
impl SpreadsheetsClient for GatewayClient {
    async fn append_row(&self, sheet: &str, row: Vec<String>) -> Result<(), ClientError> {
        self.post(
            &format!("/spreadsheets-api/sheets/{sheet}/rows"),
            &AppendRowRequest { columns: &row },
        )
        .await
    }
}
