use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The request to place one outbound call through the carrier.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialSpec {
    /// The outbound caller number, E.164.
    pub from: String,
    /// The destination number, E.164.
    pub to: String,
    /// The caller id presented to the callee.
    pub caller_id: String,
    /// Reference to the voice application the carrier bridges the
    /// call into.
    pub app_ref: String,
    /// Opaque correlation id echoed back on every webhook for the call.
    pub correlation_id: String,
}

/// The initial status the carrier reports for an accepted dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CarrierCallStatus {
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "ringing")]
    Ringing,
}

/// The carrier's response to an accepted dial.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialResult {
    pub carrier_id: String,
    pub initial_status: CarrierCallStatus,
}

/// Errors surfaced by carrier providers, classified the way the
/// dispatcher and retry scheduler need them.
#[derive(Debug, Clone, PartialEq)]
pub enum CarrierError {
    /// HTTP 429 analogue.
    RateLimited,
    /// HTTP 401 analogue.
    Auth,
    /// HTTP 5xx analogue.
    Server(String),
    /// Transport-level failure reaching the carrier.
    Network(String),
    /// The destination number was rejected as invalid.
    InvalidNumber,
    /// The destination is blocked for compliance reasons.
    Blocked,
}

impl fmt::Display for CarrierError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CarrierError::RateLimited => write!(f, "carrier rate limited the request"),
            CarrierError::Auth => write!(f, "carrier rejected the credentials"),
            CarrierError::Server(detail) => write!(f, "carrier server error: {detail}"),
            CarrierError::Network(detail) => write!(f, "carrier network error: {detail}"),
            CarrierError::InvalidNumber => write!(f, "carrier rejected the number as invalid"),
            CarrierError::Blocked => write!(f, "destination is blocked for compliance"),
        }
    }
}

impl CarrierError {
    /// Permanent errors mark the contact failed; everything else is
    /// released and handed to the retry scheduler.
    pub fn is_permanent(&self) -> bool {
        matches!(self, CarrierError::InvalidNumber | CarrierError::Blocked)
    }
}

/// The capability set every carrier provider implements.
#[async_trait]
pub trait CarrierClient {
    /// Places an outbound call. The correlation id in the dial spec
    /// is echoed on all subsequent webhooks for the call.
    async fn dial(&self, spec: &DialSpec) -> Result<DialResult, CarrierError>;

    /// Terminates an in-progress call.
    async fn hangup(&self, carrier_id: &str) -> Result<(), CarrierError>;

    /// Fetches the carrier's current status string for a call.
    async fn get_status(&self, carrier_id: &str) -> Result<String, CarrierError>;
}

/// Configuration for the HTTP carrier provider.
#[derive(Debug, Clone)]
pub struct HttpCarrierConfig {
    pub base_url: String,
    pub account_id: String,
    pub auth_token: String,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
}

/// A carrier provider speaking the REST call-control API.
pub struct HttpCarrierClient {
    client: reqwest::Client,
    config: HttpCarrierConfig,
}

impl HttpCarrierClient {
    pub fn new(config: HttpCarrierConfig) -> Result<Self, CarrierError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .map_err(|err| CarrierError::Network(err.to_string()))?;
        Ok(HttpCarrierClient { client, config })
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/accounts/{}/calls",
            self.config.base_url, self.config.account_id
        )
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> CarrierError {
        if status.as_u16() == 429 {
            return CarrierError::RateLimited;
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return CarrierError::Auth;
        }
        if status.is_server_error() {
            return CarrierError::Server(format!("{status}: {body}"));
        }
        // 4xx bodies carry a machine-readable reason for rejected dials.
        if body.contains("invalid_number") {
            return CarrierError::InvalidNumber;
        }
        if body.contains("blocked") || body.contains("compliance") {
            return CarrierError::Blocked;
        }
        CarrierError::Server(format!("{status}: {body}"))
    }
}

#[async_trait]
impl CarrierClient for HttpCarrierClient {
    async fn dial(&self, spec: &DialSpec) -> Result<DialResult, CarrierError> {
        let response = self
            .client
            .post(self.calls_url())
            .bearer_auth(&self.config.auth_token)
            .json(spec)
            .send()
            .await
            .map_err(|err| CarrierError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        response
            .json::<DialResult>()
            .await
            .map_err(|err| CarrierError::Server(format!("malformed dial response: {err}")))
    }

    async fn hangup(&self, carrier_id: &str) -> Result<(), CarrierError> {
        let url = format!("{}/{}/hangup", self.calls_url(), carrier_id);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.auth_token)
            .send()
            .await
            .map_err(|err| CarrierError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }
        Ok(())
    }

    async fn get_status(&self, carrier_id: &str) -> Result<String, CarrierError> {
        let url = format!("{}/{}", self.calls_url(), carrier_id);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.config.auth_token)
            .send()
            .await
            .map_err(|err| CarrierError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        #[derive(Deserialize)]
        struct StatusResponse {
            status: String,
        }
        let parsed = response
            .json::<StatusResponse>()
            .await
            .map_err(|err| CarrierError::Server(format!("malformed status response: {err}")))?;
        Ok(parsed.status)
    }
}

/// A scripted carrier used in tests and sandbox environments: dials
/// pop queued responses and fall back to an accepted `queued` call.
#[derive(Default)]
pub struct MockCarrierClient {
    scripted: Mutex<VecDeque<Result<DialResult, CarrierError>>>,
    dials: Mutex<Vec<DialSpec>>,
    hangups: Mutex<Vec<String>>,
    counter: Mutex<u64>,
}

impl MockCarrierClient {
    pub fn new() -> Self {
        MockCarrierClient::default()
    }

    /// Queues the response returned by the next dial.
    pub fn push_response(&self, response: Result<DialResult, CarrierError>) {
        self.scripted
            .lock()
            .expect("lock should not be poisoned")
            .push_back(response);
    }

    /// All dial specs the carrier has received, in order.
    pub fn dials(&self) -> Vec<DialSpec> {
        self.dials
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }

    pub fn hangups(&self) -> Vec<String> {
        self.hangups
            .lock()
            .expect("lock should not be poisoned")
            .clone()
    }
}

#[async_trait]
impl CarrierClient for MockCarrierClient {
    async fn dial(&self, spec: &DialSpec) -> Result<DialResult, CarrierError> {
        self.dials
            .lock()
            .expect("lock should not be poisoned")
            .push(spec.clone());

        let scripted = self
            .scripted
            .lock()
            .expect("lock should not be poisoned")
            .pop_front();
        match scripted {
            Some(response) => response,
            None => {
                let mut counter = self.counter.lock().expect("lock should not be poisoned");
                *counter += 1;
                Ok(DialResult {
                    carrier_id: format!("carrier-call-{}", *counter),
                    initial_status: CarrierCallStatus::Queued,
                })
            }
        }
    }

    async fn hangup(&self, carrier_id: &str) -> Result<(), CarrierError> {
        self.hangups
            .lock()
            .expect("lock should not be poisoned")
            .push(carrier_id.to_string());
        Ok(())
    }

    async fn get_status(&self, _carrier_id: &str) -> Result<String, CarrierError> {
        Ok("in-progress".to_string())
    }
}

/// The configured carrier providers as tagged variants, avoiding
/// trait objects on the dial hot path.
pub enum CarrierProvider {
    Http(HttpCarrierClient),
    Mock(MockCarrierClient),
}

impl CarrierProvider {
    pub fn mock(&self) -> Option<&MockCarrierClient> {
        match self {
            CarrierProvider::Mock(mock) => Some(mock),
            _ => None,
        }
    }
}

#[async_trait]
impl CarrierClient for CarrierProvider {
    async fn dial(&self, spec: &DialSpec) -> Result<DialResult, CarrierError> {
        debug!(
            to = spec.to.as_str(),
            correlation_id = spec.correlation_id.as_str(),
            "placing outbound call"
        );
        match self {
            CarrierProvider::Http(client) => client.dial(spec).await,
            CarrierProvider::Mock(client) => client.dial(spec).await,
        }
    }

    async fn hangup(&self, carrier_id: &str) -> Result<(), CarrierError> {
        match self {
            CarrierProvider::Http(client) => client.hangup(carrier_id).await,
            CarrierProvider::Mock(client) => client.hangup(carrier_id).await,
        }
    }

    async fn get_status(&self, carrier_id: &str) -> Result<String, CarrierError> {
        match self {
            CarrierProvider::Http(client) => client.get_status(carrier_id).await,
            CarrierProvider::Mock(client) => client.get_status(carrier_id).await,
        }
    }
}
