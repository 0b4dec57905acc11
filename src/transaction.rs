//! Transaction module split into types and validation for better modularity

pub mod types;
pub mod validation;

pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Address, KeyPair};
    use crate::error::ChainError;

    fn signed_transfer(amount: u64, fee: u64) -> (KeyPair, Transaction) {
        let keypair = KeyPair::generate();
        let recipient = KeyPair::generate().address();
        let tx = create_transaction(&keypair, recipient, amount, 0, fee).unwrap();
        (keypair, tx)
    }

    fn reason(result: Result<(), ChainError>) -> String {
        match result {
            Err(ChainError::InvalidTransaction(msg)) => msg,
            other => panic!("Expected InvalidTransaction error, got {:?}", other),
        }
    }

    #[test]
    fn test_signed_transaction_is_valid() {
        let (_, tx) = signed_transfer(10, DEFAULT_FEE);
        assert!(tx.is_valid().is_ok());
        assert!(tx.validate_size().is_ok());
    }

    #[test]
    fn test_zero_amount_rejected() {
        let (_, tx) = signed_transfer(0, DEFAULT_FEE);
        assert_eq!(reason(tx.is_valid()), "Amount must be positive");
    }

    #[test]
    fn test_unsigned_transaction_fails() {
        let tx = Transaction::new(
            KeyPair::generate().address(),
            KeyPair::generate().address(),
            5,
            0,
            0,
        );
        assert_eq!(reason(tx.is_valid()), "Transaction not signed");
    }

    #[test]
    fn test_self_send_rejected() {
        let keypair = KeyPair::generate();
        let tx = create_transaction(&keypair, keypair.address(), 5, 0, 0).unwrap();
        assert_eq!(reason(tx.is_valid()), "Cannot send to self");
    }

    #[test]
    fn test_malformed_addresses_rejected() {
        let keypair = KeyPair::generate();
        let tx = create_transaction(&keypair, Address::new_unchecked("bob"), 5, 0, 0).unwrap();
        assert_eq!(reason(tx.is_valid()), "Invalid recipient address format");

        let mut tx = create_transaction(&keypair, KeyPair::generate().address(), 5, 0, 0).unwrap();
        tx.sender = Address::new_unchecked("nous:xyz");
        assert_eq!(reason(tx.is_valid()), "Invalid sender address format");
    }

    #[test]
    fn test_signature_from_other_key_rejected() {
        let (_, mut tx) = signed_transfer(10, 0);
        let impostor = KeyPair::generate();
        let signature = impostor.sign(&tx.hash()).unwrap();
        tx.signature = Some(signature.to_vec());
        tx.public_key = Some(impostor.public_key_bytes().to_vec());
        assert_eq!(reason(tx.is_valid()), "Public key does not match sender address");
    }

    #[test]
    fn test_tampered_amount_breaks_signature() {
        let (_, mut tx) = signed_transfer(10, 0);
        tx.amount = 10_000;
        assert!(reason(tx.is_valid()).starts_with("Bad signature"));
    }

    #[test]
    fn test_identity_excludes_signature() {
        let keypair = KeyPair::generate();
        let unsigned = Transaction::new(keypair.address(), KeyPair::generate().address(), 7, 1, 3);
        let signed = unsigned.clone().signed(&keypair).unwrap();
        assert_eq!(unsigned.tx_id(), signed.tx_id());
        assert_eq!(signed.tx_id().len(), 64);
    }

    #[test]
    fn test_constructors_agree_on_nonce_and_fee() {
        let keypair = KeyPair::generate();
        let recipient = KeyPair::generate().address();
        let signed = create_transaction(&keypair, recipient.clone(), 10, 4, 250).unwrap();
        let built = Transaction::new(keypair.address(), recipient, 10, 4, 250)
            .with_timestamp(signed.timestamp);
        assert_eq!((built.nonce, built.fee), (4, 250));
        assert_eq!(built.tx_id(), signed.tx_id());
    }

    #[test]
    fn test_overflowing_cost_rejected() {
        let (_, tx) = signed_transfer(u64::MAX, 1);
        assert_eq!(reason(tx.is_valid()), "Amount plus fee overflows");
    }

    #[test]
    fn test_wire_encoding_uses_hex_signature() {
        let (_, tx) = signed_transfer(10, 0);
        let json = serde_json::to_value(&tx).unwrap();
        assert!(json["signature"].is_string());
        let decoded: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, tx);
    }
}
