#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Transaction decode error: {0}")]
    TxDecodeError(#[from] bitcoin::consensus::encode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome code returned by the payment-submission endpoint.
///
/// Everything except `Success` leaves the invoice open; the client may
/// correct the problem and resubmit the same invoice.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum PayErrorCode {
    /// Payment accepted, access granted.
    Success,
    /// The transaction does not fund every required output.
    ValidationFailed,
    /// The relay could not be reached; the endpoint rotation advanced.
    BroadcastFailed,
    /// The relay answered with a payload we could not interpret.
    RelayResponseInvalid,
    /// The relay refused the transaction; its message is surfaced as the memo.
    RelayRejected,
}

impl PayErrorCode {
    pub fn code(self) -> u8 {
        match self {
            PayErrorCode::Success => 0,
            PayErrorCode::ValidationFailed => 1,
            PayErrorCode::BroadcastFailed => 2,
            PayErrorCode::RelayResponseInvalid => 3,
            PayErrorCode::RelayRejected => 4,
        }
    }
}

impl serde::Serialize for PayErrorCode {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.code())
    }
}
