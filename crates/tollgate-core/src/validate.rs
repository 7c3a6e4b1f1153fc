//! Payment validation.

use bitcoin::Transaction;

use crate::invoice::SpecOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing output")]
    MissingOutput,
}

/// Check that `tx` funds every output `required` by an invoice.
///
/// Each transaction output may satisfy at most one required output: matching
/// consumes from a working copy, so two required outputs with the same amount
/// and script need two actual outputs. Extra unrelated outputs (change, other
/// payments batched into the transaction) are ignored.
pub fn validate_payment(
    required: &[SpecOutput],
    tx: &Transaction,
) -> Result<(), ValidationError> {
    let mut unclaimed: Vec<(u64, String)> = tx
        .output
        .iter()
        .map(|out| (out.value.to_sat(), out.script_pubkey.to_hex_string()))
        .collect();

    for item in required {
        let found = unclaimed
            .iter()
            .position(|(amount, script)| *amount == item.amount && *script == item.script);

        match found {
            Some(n) => {
                unclaimed.swap_remove(n);
            }
            None => return Err(ValidationError::MissingOutput),
        }
    }

    Ok(())
}
