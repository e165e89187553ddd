//! Relayer fee settlement after the primary transfer confirms

use crate::error::{LedgerError, SignatureError, TxResult};
use crate::nonce::NonceLedger;
use crate::payload::OfflineTransactionPayload;
use solana_sdk::message::Message;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Signature, Signer};
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;
use tracing::{info, warn};
use uuid::Uuid;

/// One transfer per distinct recorded relayer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementPlan {
    pub payload_id: Uuid,
    pub transfers: Vec<(Pubkey, u64)>,
}

impl SettlementPlan {
    pub fn for_payload(payload: &OfflineTransactionPayload) -> Self {
        let meta = &payload.relay_metadata;
        let mut transfers: Vec<(Pubkey, u64)> = Vec::with_capacity(meta.relayers.len());
        for relayer in &meta.relayers {
            if !transfers.iter().any(|(seen, _)| seen == relayer) {
                transfers.push((*relayer, meta.relayer_fee_per_hop));
            }
        }

        Self {
            payload_id: payload.id,
            transfers,
        }
    }

    pub fn total(&self) -> u64 {
        self.transfers
            .iter()
            .fold(0u64, |sum, (_, lamports)| sum.saturating_add(*lamports))
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayerPayout {
    pub relayer: Pubkey,
    pub lamports: u64,
    pub result: Result<Signature, LedgerError>,
}

/// Per-relayer results of a settlement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReport {
    pub payload_id: Uuid,
    pub payouts: Vec<RelayerPayout>,
}

impl SettlementReport {
    pub fn paid(&self) -> impl Iterator<Item = &RelayerPayout> {
        self.payouts.iter().filter(|p| p.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &RelayerPayout> {
        self.payouts.iter().filter(|p| p.result.is_err())
    }

    pub fn total_paid(&self) -> u64 {
        self.paid()
            .fold(0u64, |sum, payout| sum.saturating_add(payout.lamports))
    }
}

/// Pay every recorded relayer, but only once `primary_signature` is confirmed
///
/// A failed payout does not stop the others.
pub async fn settle_relayer_fees<L: NonceLedger + ?Sized>(
    ledger: &L,
    payer: &(dyn Signer + Sync),
    payload: &OfflineTransactionPayload,
    primary_signature: &Signature,
) -> TxResult<SettlementReport> {
    if !ledger.confirm_signature(primary_signature).await? {
        return Err(LedgerError::NotConfirmed(*primary_signature).into());
    }

    let plan = SettlementPlan::for_payload(payload);
    let mut payouts = Vec::with_capacity(plan.transfers.len());

    for (relayer, lamports) in plan.transfers {
        if lamports == 0 {
            continue;
        }
        let result = pay_relayer(ledger, payer, &relayer, lamports).await;
        match &result {
            Ok(signature) => info!(
                "Paid relayer {} {} lamports for payload {} ({})",
                relayer, lamports, payload.id, signature
            ),
            Err(e) => warn!(
                "Relayer {} payout for payload {} failed: {}",
                relayer, payload.id, e
            ),
        }
        payouts.push(RelayerPayout {
            relayer,
            lamports,
            result,
        });
    }

    Ok(SettlementReport {
        payload_id: payload.id,
        payouts,
    })
}

async fn pay_relayer<L: NonceLedger + ?Sized>(
    ledger: &L,
    payer: &(dyn Signer + Sync),
    relayer: &Pubkey,
    lamports: u64,
) -> Result<Signature, LedgerError> {
    let blockhash = ledger.latest_blockhash().await?;
    let payer_key = payer.pubkey();
    let message = Message::new_with_blockhash(
        &[system_instruction::transfer(&payer_key, relayer, lamports)],
        Some(&payer_key),
        &blockhash,
    );

    let signature = payer
        .try_sign_message(&message.serialize())
        .map_err(|e| LedgerError::SubmitFailed(SignatureError::from(e).to_string()))?;
    let transaction = Transaction {
        signatures: vec![signature],
        message,
    };

    ledger.submit_transaction(&transaction).await
}
