//! Partial-signature aggregation
//!
//! Signatures are always computed and checked over the payload's stored message
//! bytes. Every function returns a new value and leaves its input untouched.

use crate::error::{SignatureError, TxResult};
use crate::payload::{place_signatures, Multisig, OfflineTransactionPayload, SignatureEntry};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Signature, Signer};
use solana_sdk::transaction::Transaction;
use tracing::{debug, warn};

/// Sign locally with `signer` and accept the signature
pub fn add_signature<T: Multisig>(payload: &T, signer: &dyn Signer) -> Result<T, SignatureError> {
    let public_key = signer.pubkey();
    check_signer(payload, &public_key)?;

    let signature = signer.try_sign_message(payload.message_bytes())?;
    add_detached_signature(payload, public_key, signature)
}

/// Accept a signature produced elsewhere, typically received over the mesh
pub fn add_detached_signature<T: Multisig>(
    payload: &T,
    public_key: Pubkey,
    signature: Signature,
) -> Result<T, SignatureError> {
    check_signer(payload, &public_key)?;

    let entry = SignatureEntry::new(public_key, signature);
    if !entry.verify(payload.message_bytes()) {
        warn!("Rejected invalid signature from {}", public_key);
        return Err(SignatureError::InvalidSignature(public_key));
    }

    let mut next = payload.clone();
    next.accept_signature(entry)?;
    debug!(
        "Accepted signature from {} ({} outstanding)",
        public_key,
        next.required_signers().len()
    );
    Ok(next)
}

/// Fold into `held` every valid signature `incoming` has and `held` still needs
///
/// Signatures that do not verify or are no longer required are skipped.
pub fn merge_signatures<T: Multisig>(held: &T, incoming: &T) -> T {
    let mut merged = held.clone();
    for entry in incoming.signatures() {
        if !merged.required_signers().contains(&entry.public_key) {
            continue;
        }
        match add_detached_signature(&merged, entry.public_key, entry.signature) {
            Ok(next) => merged = next,
            Err(e) => debug!("Not merging signature from {}: {}", entry.public_key, e),
        }
    }
    merged
}

fn check_signer<T: Multisig>(payload: &T, public_key: &Pubkey) -> Result<(), SignatureError> {
    if payload.has_signed(public_key) {
        return Err(SignatureError::DuplicateSigner(*public_key));
    }
    if !payload.required_signers().contains(public_key) {
        return Err(SignatureError::SignerNotRequired(*public_key));
    }
    Ok(())
}

/// Every collected signature verifies against the message bytes
pub fn verify_all<T: Multisig>(payload: &T) -> bool {
    let message = payload.message_bytes();
    payload.signatures().iter().all(|entry| entry.verify(message))
}

/// No signer outstanding and every collected signature valid
pub fn is_fully_signed<T: Multisig>(payload: &T) -> bool {
    payload.required_signers().is_empty() && verify_all(payload)
}

/// Produce the submittable transaction, with each signature in its signer slot
pub fn assemble_transaction(payload: &OfflineTransactionPayload) -> TxResult<Transaction> {
    if !payload.required_signers.is_empty() {
        return Err(SignatureError::MissingSignatures(payload.required_signers.clone()).into());
    }

    if let Some(bad) = payload
        .signatures
        .iter()
        .find(|entry| !entry.verify(&payload.message_bytes))
    {
        return Err(SignatureError::InvalidSignature(bad.public_key).into());
    }

    let transaction = place_signatures(payload.message()?, &payload.signatures);

    let unsigned: Vec<Pubkey> = transaction
        .message
        .account_keys
        .iter()
        .zip(&transaction.signatures)
        .filter(|(_, signature)| **signature == Signature::default())
        .map(|(key, _)| *key)
        .collect();
    if !unsigned.is_empty() {
        return Err(SignatureError::MissingSignatures(unsigned).into());
    }

    Ok(transaction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PartiallySignedTransaction;
    use solana_sdk::hash::Hash;
    use solana_sdk::message::Message;
    use solana_sdk::signature::Keypair;
    use solana_sdk::system_instruction;

    fn two_party(a: &Keypair, b: &Keypair) -> PartiallySignedTransaction {
        let instructions = vec![
            system_instruction::transfer(&a.pubkey(), &Pubkey::new_unique(), 1),
            system_instruction::transfer(&b.pubkey(), &Pubkey::new_unique(), 2),
        ];
        let message = Message::new_with_blockhash(&instructions, Some(&a.pubkey()), &Hash::new_unique());
        PartiallySignedTransaction::new(&message)
    }

    #[test]
    fn test_both_signers_required() {
        let a = Keypair::new();
        let b = Keypair::new();
        let pst = two_party(&a, &b);

        let after_a = add_signature(&pst, &a).unwrap();
        assert!(!is_fully_signed(&after_a));
        assert!(verify_all(&after_a));
        assert_eq!(after_a.required_signers, vec![b.pubkey()]);

        let after_b = add_signature(&after_a, &b).unwrap();
        assert!(is_fully_signed(&after_b));
        assert!(after_b.required_signers.is_empty());

        // inputs are untouched
        assert_eq!(pst.signatures.len(), 0);
        assert_eq!(after_a.signatures.len(), 1);
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let a = Keypair::new();
        let b = Keypair::new();
        let pst = two_party(&a, &b);

        let forged = b.sign_message(b"some other message");
        let result = add_detached_signature(&pst, b.pubkey(), forged);
        assert_eq!(result, Err(SignatureError::InvalidSignature(b.pubkey())));
        assert_eq!(pst.required_signers.len(), 2);
    }

    #[test]
    fn test_duplicate_and_unrequired_signers_rejected() {
        let a = Keypair::new();
        let b = Keypair::new();
        let pst = add_signature(&two_party(&a, &b), &a).unwrap();

        assert_eq!(
            add_signature(&pst, &a),
            Err(SignatureError::DuplicateSigner(a.pubkey()))
        );

        let stranger = Keypair::new();
        assert_eq!(
            add_signature(&pst, &stranger),
            Err(SignatureError::SignerNotRequired(stranger.pubkey()))
        );
    }

    #[test]
    fn test_merge_keeps_signatures_from_both_copies() {
        let a = Keypair::new();
        let b = Keypair::new();
        let pst = two_party(&a, &b);
        let signed_by_a = add_signature(&pst, &a).unwrap();
        let signed_by_b = add_signature(&pst, &b).unwrap();

        let merged = merge_signatures(&signed_by_a, &signed_by_b);
        assert!(is_fully_signed(&merged));
        assert_eq!(merged.signatures.len(), 2);

        // nothing new to take from a copy that knows less
        assert_eq!(merge_signatures(&merged, &signed_by_a), merged);

        let mut forged = signed_by_b.clone();
        forged.signatures[0].signature = b.sign_message(b"elsewhere");
        let merged = merge_signatures(&signed_by_a, &forged);
        assert_eq!(merged, signed_by_a);
    }

    #[test]
    fn test_unreadable_message_fails_instead_of_going_stale() {
        let signer = Keypair::new();
        let message_bytes = vec![0xFF; 7];
        let payload = OfflineTransactionPayload {
            id: uuid::Uuid::new_v4(),
            serialized_tx: vec![],
            message_bytes: message_bytes.clone(),
            nonce_account: None,
            fee_payer: signer.pubkey(),
            recipient: Pubkey::new_unique(),
            amount: 1,
            sender: signer.pubkey().to_string(),
            created_at: chrono::Utc::now(),
            durable: false,
            memo: None,
            signatures: vec![],
            required_signers: vec![signer.pubkey()],
            relay_metadata: crate::payload::RelayMetadata::new(5, 0),
        };

        let result = add_signature(&payload, &signer);
        assert!(matches!(result, Err(SignatureError::MalformedMessage(_))));
        assert_eq!(payload.required_signers, vec![signer.pubkey()]);
        assert!(payload.signatures.is_empty());
        assert_eq!(payload.message_bytes, message_bytes);
    }

    #[test]
    fn test_verify_all_detects_corrupted_entry() {
        let a = Keypair::new();
        let b = Keypair::new();
        let mut pst = add_signature(&two_party(&a, &b), &a).unwrap();
        pst.signatures[0].signature = b.sign_message(&pst.message_bytes);

        assert!(!verify_all(&pst));
        assert!(!is_fully_signed(&pst));
    }
}
