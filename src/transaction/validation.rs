/// Structural validation for transactions, separated from type definitions
use crate::crypto::{verify_signature, Address};
use crate::error::ChainError;
use crate::transaction::types::Transaction;

impl Transaction {
    /// Stateless structural validation: amount, addresses, signature.
    /// Balance and nonce are ledger concerns and are not checked here.
    /// Fees are unsigned, so a negative fee cannot be expressed.
    pub fn is_valid(&self) -> Result<(), ChainError> {
        if self.amount == 0 {
            return Err(invalid("Amount must be positive"));
        }
        self.total_cost()?;

        if !self.sender.is_well_formed() {
            return Err(invalid("Invalid sender address format"));
        }
        if !self.recipient.is_well_formed() {
            return Err(invalid("Invalid recipient address format"));
        }
        if self.sender == self.recipient {
            return Err(invalid("Cannot send to self"));
        }

        let (signature, public_key) = match (&self.signature, &self.public_key) {
            (Some(sig), Some(pk)) => (sig, pk),
            _ => return Err(invalid("Transaction not signed")),
        };

        if Address::from_public_key(public_key) != self.sender {
            return Err(invalid("Public key does not match sender address"));
        }

        verify_signature(public_key, &self.hash(), signature)
            .map_err(|e| ChainError::InvalidTransaction(format!("Bad signature: {}", e)))
    }
}

fn invalid(reason: &str) -> ChainError {
    ChainError::InvalidTransaction(reason.to_string())
}
