//! Transaction broadcast through third-party relays.

use std::sync::atomic::{AtomicUsize, Ordering};

use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::config::RelayEndpoint;

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("no relay endpoints configured")]
    NoEndpoints,

    #[error("HTTP request error: {0}")]
    HttpRequestError(#[from] reqwest::Error),
}

/// What the relay made of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayVerdict {
    /// The relay accepted the transaction, or already knew it.
    Accepted { relay: String },
    /// The relay answered but the payload could not be interpreted.
    Unreadable,
    /// The relay refused the transaction.
    Rejected { relay: String, message: String },
}

#[derive(Serialize)]
struct RelayRequest<'tx> {
    rawtx: &'tx str,
}

#[derive(Deserialize)]
struct RelayEnvelope {
    payload: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayPayload {
    #[serde(default)]
    return_result: Option<String>,
    #[serde(default)]
    result_description: Option<String>,
}

/// Descriptions equivalent to acceptance: the transaction is already on its
/// way, so the payment stands.
const ALREADY_KNOWN: [&str; 3] = [
    "Transaction already in the mempool",
    "Transaction already known",
    "257 txn-already-known",
];

/// Submits raw transactions to one of several relay endpoints.
///
/// The active endpoint is a cursor owned by this instance (one per worker
/// context, never a global); a transport failure advances it so the next
/// submission lands on the next relay round-robin.
pub struct Broadcaster {
    client: reqwest::Client,
    endpoints: Vec<RelayEndpoint>,
    cursor: AtomicUsize,
}

impl Broadcaster {
    pub fn new(endpoints: Vec<RelayEndpoint>) -> Self {
        Broadcaster {
            client: reqwest::Client::new(),
            endpoints,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Name of the endpoint the next submission will use.
    pub fn current_relay(&self) -> Option<&str> {
        if self.endpoints.is_empty() {
            return None;
        }
        let n = self.cursor.load(Ordering::Relaxed) % self.endpoints.len();
        Some(&self.endpoints[n].name)
    }

    /// Submit `raw_tx_hex` to the current relay.
    ///
    /// A transport error rotates the cursor and surfaces as `Err`; an
    /// answering relay never rotates, whatever its verdict.
    pub async fn broadcast(&self, raw_tx_hex: &str) -> Result<RelayVerdict, BroadcastError> {
        if self.endpoints.is_empty() {
            return Err(BroadcastError::NoEndpoints);
        }

        let n = self.cursor.load(Ordering::Relaxed) % self.endpoints.len();
        let endpoint = &self.endpoints[n];

        let response = self
            .client
            .post(endpoint.url.clone())
            .headers(header_map(endpoint))
            .json(&RelayRequest { rawtx: raw_tx_hex })
            .send()
            .await
            .inspect_err(|err| {
                tracing::warn!("relay '{}' unreachable, rotating: {err}", endpoint.name);
                self.cursor.fetch_add(1, Ordering::Relaxed);
            })?;

        let Ok(body) = response.text().await else {
            return Ok(RelayVerdict::Unreadable);
        };

        Ok(interpret(&endpoint.name, &body))
    }
}

fn header_map(endpoint: &RelayEndpoint) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &endpoint.extra_headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!("relay '{}': skipping invalid header '{name}'", endpoint.name),
        }
    }
    headers
}

/// Map a relay's response body onto a verdict.
fn interpret(relay: &str, body: &str) -> RelayVerdict {
    let Ok(envelope) = serde_json::from_str::<RelayEnvelope>(body) else {
        return RelayVerdict::Unreadable;
    };
    let Ok(payload) = serde_json::from_str::<RelayPayload>(&envelope.payload) else {
        return RelayVerdict::Unreadable;
    };

    let description = payload.result_description.unwrap_or_default();

    if payload.return_result.as_deref() == Some("success")
        || ALREADY_KNOWN.contains(&description.as_str())
    {
        RelayVerdict::Accepted {
            relay: relay.to_string(),
        }
    } else {
        RelayVerdict::Rejected {
            relay: relay.to_string(),
            message: description,
        }
    }
}
