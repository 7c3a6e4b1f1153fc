#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    StoreError(#[from] rusqlite::Error),

    #[error("Key derivation error: {0}")]
    DeriveError(#[from] bitcoin::bip32::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    CoreError(#[from] tollgate_core::errors::Error),

    #[error("no master public key configured for this site")]
    MissingMasterKey,

    #[error("unknown session")]
    UnknownSession,

    #[error("counter value {0} is out of range for key derivation")]
    CounterOverflow(i64),
}

pub type Result<T> = std::result::Result<T, Error>;
