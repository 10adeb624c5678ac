//! Persistent relational index of merkle-blocks, transactions and the
//! derived payment, UTXO and fee views.

use std::fmt;

mod payment;
mod store;

pub use payment::{Payment, PaymentState};
pub use store::IndexStore;

#[derive(Debug)]
pub enum IndexError {
    Database(sqlx::Error),
    Corrupt(&'static str),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::Database(err) => write!(f, "{err}"),
            IndexError::Corrupt(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        IndexError::Database(err)
    }
}
