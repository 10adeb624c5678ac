#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PaymentState {
    Sent,
    Received,
    /// No reference address was supplied for the query.
    Unknown,
}

/// One row of confirmed payment history, relative to a query address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Payment {
    pub state: PaymentState,
    pub output_index: u32,
    /// Satoshis moved from the query address's point of view: output value
    /// for received payments, consumed input value for sent ones.
    pub amount: i64,
    pub from_address: String,
    pub to_address: String,
    /// Lowercase hex of the natural-byte-order txid.
    pub tx_id: String,
    pub block_height: Option<u32>,
    pub timestamp: Option<u32>,
    pub confirmations: u32,
    /// `None` when any input's previous output is not locally resolvable.
    pub fee: Option<i64>,
}
