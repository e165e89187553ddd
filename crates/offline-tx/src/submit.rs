//! Submission of fully signed payloads

use crate::aggregator::assemble_transaction;
use crate::durable::validate_against_nonce;
use crate::error::{LedgerError, TxResult};
use crate::nonce::NonceLedger;
use crate::payload::OfflineTransactionPayload;
use solana_sdk::signature::Signature;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of submitting one payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    pub payload_id: Uuid,
    pub signature: Signature,
    pub confirmed: bool,
}

/// Assemble, submit and confirm a payload
///
/// Durable payloads are checked against their nonce first, so a nonce advanced by
/// someone else surfaces as `NonceError::Advanced` instead of an opaque RPC error.
pub async fn submit_payload<L: NonceLedger + ?Sized>(
    ledger: &L,
    payload: &OfflineTransactionPayload,
) -> TxResult<SubmissionOutcome> {
    let transaction = assemble_transaction(payload)?;

    if payload.durable {
        validate_against_nonce(payload, ledger).await?;
    }

    let signature = ledger.submit_transaction(&transaction).await?;
    info!("Submitted payload {} as {}", payload.id, signature);

    let confirmed = match ledger.confirm_signature(&signature).await {
        Ok(confirmed) => confirmed,
        Err(LedgerError::TransactionFailed { signature, reason }) => {
            warn!("Payload {} failed on-chain: {}", payload.id, reason);
            return Err(LedgerError::TransactionFailed { signature, reason }.into());
        }
        Err(e) => {
            warn!("Could not confirm payload {} ({}): {}", payload.id, signature, e);
            false
        }
    };

    Ok(SubmissionOutcome {
        payload_id: payload.id,
        signature,
        confirmed,
    })
}
