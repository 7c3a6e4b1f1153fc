//! The invoice model.
//!
//! An invoice ties one gated path and one visitor session to the set of
//! derived outputs the visitor must fund. The output list is persisted as a
//! versioned, tagged record so ledgers written by older servers keep
//! decoding at the boundary instead of leaking untyped JSON into handlers.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// One output the payer must fund, with the public derivation material that
/// produced its script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpecOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Amount in the smallest unit.
    pub amount: u64,
    /// String form of the master public key the script derives from.
    pub master_key: String,
    /// Derivation path of the one-time key, e.g. `m/0/41`.
    pub derivation_path: String,
    /// Expected output script, hex encoded.
    pub script: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceSpecV1 {
    /// The paywall pattern that produced this invoice.
    pub pattern: String,
    pub outputs: Vec<SpecOutput>,
}

/// Versioned invoice payment requirements, as persisted in a ledger row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "version")]
pub enum InvoiceSpec {
    #[serde(rename = "1")]
    V1(InvoiceSpecV1),
}

impl InvoiceSpec {
    pub fn pattern(&self) -> &str {
        match self {
            InvoiceSpec::V1(v1) => &v1.pattern,
        }
    }

    pub fn outputs(&self) -> &[SpecOutput] {
        match self {
            InvoiceSpec::V1(v1) => &v1.outputs,
        }
    }

    pub fn subtotal(&self) -> u64 {
        self.outputs().iter().map(|o| o.amount).sum()
    }
}

/// A request for payment against one gated path, scoped to one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    /// Globally unique, sortable id. Immutable once issued.
    pub reference: String,
    /// Creation time, unix milliseconds.
    pub created: i64,
    pub domain: String,
    /// Canonical matched path the invoice grants access to.
    pub url_path: String,
    pub spec: InvoiceSpec,
    pub subtotal: u64,
    pub payment_method: Option<String>,
    /// Set at most once, never cleared.
    pub paid_at: Option<i64>,
    pub txid: Option<String>,
    pub tx_raw: Option<Vec<u8>>,
    /// Flips false to true once, after the invoice is paid or has expired
    /// and the reconciler has folded it into the site ledger.
    pub copied: bool,
}

impl Invoice {
    pub fn is_paid(&self) -> bool {
        self.paid_at.is_some()
    }

    /// True once the invoice is older than `window_ms`.
    pub fn is_expired(&self, now_ms: i64, window_ms: i64) -> bool {
        now_ms - self.created > window_ms
    }

    /// Mint a fresh invoice reference.
    pub fn new_reference() -> String {
        Ulid::new().to_string()
    }
}

/// Whether `id` is a canonical ULID, the form used for both session ids and
/// invoice references.
pub fn is_canonical_id(id: &str) -> bool {
    id.len() == ulid::ULID_LEN && Ulid::from_string(id).is_ok()
}
