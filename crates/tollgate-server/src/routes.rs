//! The paywall protocol surface.
//!
//! Soft payment outcomes (validation failure, relay trouble) are HTTP 200
//! with a numeric code so wallets can distinguish them from dead invoices;
//! only malformed input and missing/expired invoices are hard 400/404.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, extract::Query, extract::State};
use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Transaction, TxOut, consensus};
use http::{Method, StatusCode, header};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};

use tollgate_core::errors::PayErrorCode;
use tollgate_core::invoice::{Invoice, InvoiceSpec, InvoiceSpecV1, SpecOutput, is_canonical_id};
use tollgate_core::paywall::MatchResult;
use tollgate_core::validate::validate_payment;

use crate::broadcast::RelayVerdict;
use crate::config::RunEnv;
use crate::context::{AppContext, now_ms};
use crate::error::{Error, Result};
use crate::notify::PaymentEvent;

/// How far in the future a handed-out payment request claims to expire.
/// Wallets re-fetch well inside the 15-minute payment window.
const REQUEST_EXPIRY_MS: i64 = 6 * 60 * 1000;

pub fn router(ctx: Arc<AppContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/status", get(status))
        .route("/invoice", post(create_invoice))
        .route("/invoice/request", get(payment_request).layer(cors.clone()))
        .route("/invoice/pay", post(pay_invoice).layer(cors))
        .route("/invoice/events", get(invoice_events))
        .route("/invoice/devpay", get(devpay))
        .with_state(ctx)
}

async fn status() -> &'static str {
    "OK"
}

/// A hard protocol failure: plain status code, no body to speak of.
struct ApiError(StatusCode);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.0.into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::UnknownSession => ApiError(StatusCode::NOT_FOUND),
            err => {
                tracing::error!("request failed: {err}");
                ApiError(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateInvoice {
    session_id: String,
    url_path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceIssued {
    #[serde(rename = "ref")]
    reference: String,
    url_path: String,
    subtotal: u64,
    #[serde(rename = "paymentURI")]
    payment_uri: String,
    /// End of the reuse window, unix milliseconds.
    expiry: i64,
}

fn accessible() -> Response {
    Json(serde_json::json!({ "error": "ACCESSIBLE" })).into_response()
}

async fn create_invoice(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateInvoice>,
) -> std::result::Result<Response, ApiError> {
    if !is_canonical_id(&body.session_id) {
        return Err(ApiError(StatusCode::BAD_REQUEST));
    }

    let now = now_ms();
    let policy = &ctx.config.policy;

    let Some(matched) = ctx.paywalls().match_url(&body.url_path) else {
        return Ok(accessible());
    };

    let store = ctx.session(&body.session_id, true)?;
    if store.access_check(&matched.matched_prefix, now - policy.access_window_ms())? {
        return Ok(accessible());
    }

    let issued = store.issue_or_reuse(
        &matched.matched_prefix,
        now - policy.reuse_window_ms(),
        || mint_invoice(&ctx, &matched, now),
    );

    let invoice = match issued {
        Ok(invoice) => invoice,
        Err(err) => {
            tracing::error!("invoice issuance for '{}' failed: {err}", body.url_path);
            return Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "ERR_INVOPEN" })),
            )
                .into_response());
        }
    };

    let request_url = format!(
        "https://{}/invoice/request?ref={}&sessionId={}",
        ctx.config.domain, invoice.reference, body.session_id
    );

    Ok(Json(InvoiceIssued {
        reference: invoice.reference.clone(),
        url_path: invoice.url_path.clone(),
        subtotal: invoice.subtotal,
        payment_uri: format!("bitcoin:?r={}", urlencode(&request_url)),
        expiry: invoice.created + policy.reuse_window_ms(),
    })
    .into_response())
}

/// Derive one fresh output per rule output and assemble the invoice.
fn mint_invoice(ctx: &AppContext, matched: &MatchResult, now: i64) -> Result<Invoice> {
    let xpub = ctx.master_key().ok_or(Error::MissingMasterKey)?;
    let master_key = xpub.to_string();

    let mut outputs = Vec::with_capacity(matched.spec.outputs.len());
    for output in &matched.spec.outputs {
        let derived = ctx
            .deriver
            .next_output(&xpub, ctx.config.worker_id, &ctx.counters)?;
        outputs.push(SpecOutput {
            description: output.description.clone(),
            amount: output.amount,
            master_key: master_key.clone(),
            derivation_path: derived.derivation_path,
            script: derived.script,
        });
    }

    let spec = InvoiceSpec::V1(InvoiceSpecV1 {
        pattern: matched.pattern.clone(),
        outputs,
    });

    Ok(Invoice {
        reference: Invoice::new_reference(),
        created: now,
        domain: ctx.config.domain.clone(),
        url_path: matched.matched_prefix.clone(),
        subtotal: spec.subtotal(),
        spec,
        payment_method: None,
        paid_at: None,
        txid: None,
        tx_raw: None,
        copied: false,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceQuery {
    #[serde(rename = "ref")]
    reference: String,
    session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequest {
    network: String,
    outputs: Vec<RequestedOutput>,
    /// Unix seconds, per the wallet-facing payment protocol.
    creation_timestamp: i64,
    expiration_timestamp: i64,
    memo: String,
    payment_url: String,
    merchant_data: String,
}

#[derive(Debug, Serialize)]
struct RequestedOutput {
    script: String,
    amount: u64,
}

/// Load the invoice `query` points at if it is still payable.
fn open_invoice(
    ctx: &AppContext,
    query: &InvoiceQuery,
) -> std::result::Result<(Arc<crate::store::SessionStore>, Invoice), ApiError> {
    if !is_canonical_id(&query.session_id) {
        return Err(ApiError(StatusCode::BAD_REQUEST));
    }

    let store = ctx.session(&query.session_id, false)?;
    let invoice = store
        .invoice_by_ref(&query.reference)?
        .ok_or(ApiError(StatusCode::NOT_FOUND))?;

    if invoice.is_paid() || invoice.is_expired(now_ms(), ctx.config.policy.payment_window_ms()) {
        return Err(ApiError(StatusCode::NOT_FOUND));
    }

    Ok((store, invoice))
}

async fn payment_request(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<InvoiceQuery>,
) -> std::result::Result<Json<PaymentRequest>, ApiError> {
    let (_, invoice) = open_invoice(&ctx, &query)?;
    let now = now_ms();

    let outputs = invoice
        .spec
        .outputs()
        .iter()
        .map(|output| RequestedOutput {
            script: output.script.clone(),
            amount: output.amount,
        })
        .collect();

    Ok(Json(PaymentRequest {
        network: ctx.config.network.clone(),
        outputs,
        creation_timestamp: now / 1000,
        expiration_timestamp: (now + REQUEST_EXPIRY_MS) / 1000,
        memo: format!("https://{}{}", ctx.config.domain, invoice.url_path),
        payment_url: format!(
            "https://{}/invoice/pay?ref={}&sessionId={}",
            ctx.config.domain, query.reference, query.session_id
        ),
        merchant_data: query.reference.clone(),
    }))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaySubmission {
    /// Raw transaction, hex encoded.
    transaction: String,
}

#[derive(Debug, Serialize)]
struct PayAck {
    payment: PaySubmission,
    memo: String,
    error: PayErrorCode,
}

fn ack(payment: PaySubmission, memo: impl Into<String>, error: PayErrorCode) -> Response {
    Json(PayAck {
        payment,
        memo: memo.into(),
        error,
    })
    .into_response()
}

async fn pay_invoice(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<InvoiceQuery>,
    Json(body): Json<PaySubmission>,
) -> std::result::Result<Response, ApiError> {
    let (store, invoice) = open_invoice(&ctx, &query)?;

    let tx_bytes = hex::decode(&body.transaction).map_err(|_| ApiError(StatusCode::BAD_REQUEST))?;
    let tx: Transaction =
        consensus::deserialize(&tx_bytes).map_err(|_| ApiError(StatusCode::BAD_REQUEST))?;

    if validate_payment(invoice.spec.outputs(), &tx).is_err() {
        return Ok(ack(body, "missing output", PayErrorCode::ValidationFailed));
    }

    match ctx.broadcaster.broadcast(&body.transaction).await {
        Err(err) => {
            tracing::warn!("broadcast of invoice {} failed: {err}", query.reference);
            Ok(ack(body, "broadcast failed", PayErrorCode::BroadcastFailed))
        }
        Ok(RelayVerdict::Unreadable) => Ok(ack(
            body,
            "error parsing relay response",
            PayErrorCode::RelayResponseInvalid,
        )),
        Ok(RelayVerdict::Rejected { message, relay }) => {
            tracing::info!("relay '{relay}' rejected invoice {}: {message}", query.reference);
            Ok(ack(body, message, PayErrorCode::RelayRejected))
        }
        Ok(RelayVerdict::Accepted { relay }) => {
            let txid = tx.compute_txid().to_string();
            let updated = store.mark_paid(
                &query.reference,
                now_ms(),
                &format!("relay {relay}"),
                Some(&txid),
                Some(&tx_bytes),
            )?;

            if updated {
                ctx.hub.publish(PaymentEvent {
                    session_id: query.session_id.clone(),
                    reference: query.reference.clone(),
                });
            }

            Ok(ack(body, "Access Granted", PayErrorCode::Success))
        }
    }
}

type EventStream = Pin<Box<dyn Stream<Item = std::result::Result<Event, Infallible>> + Send>>;
type SseResponse = Sse<KeepAliveStream<EventStream>>;

fn paid_event() -> std::result::Result<Event, Infallible> {
    Ok(Event::default().event("paid").data("paid"))
}

fn sse(stream: EventStream) -> SseResponse {
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

async fn invoice_events(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<InvoiceQuery>,
) -> std::result::Result<SseResponse, ApiError> {
    if !is_canonical_id(&query.session_id) {
        return Err(ApiError(StatusCode::BAD_REQUEST));
    }

    let store = ctx.session(&query.session_id, false)?;
    let invoice = store
        .invoice_by_ref(&query.reference)?
        .ok_or(ApiError(StatusCode::NOT_FOUND))?;

    if invoice.is_expired(now_ms(), ctx.config.policy.payment_window_ms()) {
        return Err(ApiError(StatusCode::NOT_FOUND));
    }

    // Wallet apps drop and reopen the stream after switching back from the
    // payment flow; fire immediately when the payment already landed.
    if invoice.is_paid() {
        return Ok(sse(Box::pin(tokio_stream::once(paid_event()))));
    }

    let rx = ctx.hub.subscribe(&query.session_id, &query.reference);

    // The payment may have landed between the read and the subscription.
    let paid_meanwhile = store
        .invoice_by_ref(&query.reference)?
        .is_some_and(|invoice| invoice.is_paid());
    if paid_meanwhile {
        return Ok(sse(Box::pin(tokio_stream::once(paid_event()))));
    }

    let stream = ReceiverStream::new(rx).map(|_| paid_event());
    Ok(sse(Box::pin(stream)))
}

async fn devpay(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<InvoiceQuery>,
) -> std::result::Result<Response, ApiError> {
    if ctx.config.env != RunEnv::Dev {
        return Err(ApiError(StatusCode::NOT_FOUND));
    }
    if !is_canonical_id(&query.session_id) || !is_canonical_id(&query.reference) {
        return Err(ApiError(StatusCode::BAD_REQUEST));
    }

    let store = ctx.session(&query.session_id, false)?;
    let invoice = store
        .invoice_by_ref(&query.reference)?
        .ok_or(ApiError(StatusCode::NOT_FOUND))?;

    // Stand in for the wallet: a transaction funding exactly the invoice.
    let output = invoice
        .spec
        .outputs()
        .iter()
        .map(|output| {
            Ok(TxOut {
                value: Amount::from_sat(output.amount),
                script_pubkey: ScriptBuf::from_hex(&output.script)
                    .map_err(|_| ApiError(StatusCode::INTERNAL_SERVER_ERROR))?,
            })
        })
        .collect::<std::result::Result<Vec<_>, ApiError>>()?;

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![],
        output,
    };
    let raw = consensus::serialize(&tx);
    let txid = tx.compute_txid().to_string();

    let updated = store.mark_paid(&query.reference, now_ms(), "devpay", Some(&txid), Some(&raw))?;
    if updated {
        ctx.hub.publish(PaymentEvent {
            session_id: query.session_id.clone(),
            reference: query.reference.clone(),
        });
    }

    Ok(Json(serde_json::json!({})).into_response())
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
