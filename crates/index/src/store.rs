use std::collections::{HashMap, HashSet};
use std::path::Path;

use spvkit_network::{hash_from_hex, hash_to_hex, Hash256, Network};
use spvkit_primitives::{payee_address, payer_address, BlockHeader, Transaction};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;

use crate::{IndexError, Payment, PaymentState};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS block (
        id TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        prev_hash TEXT NOT NULL,
        merkle_root TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        bits INTEGER NOT NULL,
        nonce INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS merkleblock (
        id TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        prev_hash TEXT NOT NULL,
        merkle_root TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        bits INTEGER NOT NULL,
        nonce INTEGER NOT NULL,
        total_transactions INTEGER NOT NULL,
        hashes BLOB NOT NULL,
        flags BLOB NOT NULL,
        height INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tx (
        id TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        lock_time INTEGER NOT NULL,
        block_id TEXT
    )",
    "CREATE TABLE IF NOT EXISTS txin (
        tx_id TEXT NOT NULL,
        input_index INTEGER NOT NULL,
        prev_tx_id TEXT NOT NULL,
        prev_out_index INTEGER NOT NULL,
        script_sig BLOB NOT NULL,
        sequence INTEGER NOT NULL,
        address TEXT NOT NULL,
        PRIMARY KEY (tx_id, input_index)
    )",
    "CREATE TABLE IF NOT EXISTS txout (
        tx_id TEXT NOT NULL,
        out_index INTEGER NOT NULL,
        value INTEGER NOT NULL,
        script_pubkey BLOB NOT NULL,
        address TEXT NOT NULL,
        PRIMARY KEY (tx_id, out_index)
    )",
    "CREATE INDEX IF NOT EXISTS idx_txin_prev ON txin (prev_tx_id, prev_out_index)",
    "CREATE INDEX IF NOT EXISTS idx_txout_address ON txout (address)",
    "CREATE INDEX IF NOT EXISTS idx_merkleblock_height ON merkleblock (height)",
    // Outputs no stored input references.
    "CREATE VIEW IF NOT EXISTS view_utxo AS
        SELECT o.tx_id, o.out_index, o.value, o.script_pubkey, o.address
        FROM txout o
        LEFT JOIN txin i ON i.prev_tx_id = o.tx_id AND i.prev_out_index = o.out_index
        WHERE i.tx_id IS NULL",
    // Fee per transaction; NULL unless every input's previous output is
    // locally resolvable.
    "CREATE VIEW IF NOT EXISTS view_tx_fees AS
        SELECT i.tx_id AS tx_id,
               CASE WHEN COUNT(*) = COUNT(prev.value)
                    THEN SUM(prev.value) -
                         (SELECT SUM(o.value) FROM txout o WHERE o.tx_id = i.tx_id)
                    ELSE NULL END AS fee
        FROM txin i
        LEFT JOIN txout prev
            ON prev.tx_id = i.prev_tx_id AND prev.out_index = i.prev_out_index
        GROUP BY i.tx_id",
    // Payment history at (input x output) granularity, self-transfers
    // filtered out so history shows only economically observable payments.
    "CREATE VIEW IF NOT EXISTS view_tx AS
        SELECT t.id AS tx_id,
               i.input_index AS input_index,
               i.address AS in_address,
               prev.value AS in_value,
               o.out_index AS out_index,
               o.address AS out_address,
               o.value AS out_value,
               m.height AS block_height,
               m.timestamp AS timestamp,
               f.fee AS fee
        FROM tx t
        JOIN txout o ON o.tx_id = t.id
        LEFT JOIN txin i ON i.tx_id = t.id
        LEFT JOIN txout prev
            ON prev.tx_id = i.prev_tx_id AND prev.out_index = i.prev_out_index
        LEFT JOIN merkleblock m ON m.id = t.block_id
        LEFT JOIN view_tx_fees f ON f.tx_id = t.id
        WHERE i.address IS NULL OR i.address != o.address",
];

type ViewTxRow = (
    String,         // tx_id
    Option<i64>,    // input_index
    Option<String>, // in_address
    Option<i64>,    // in_value
    i64,            // out_index
    String,         // out_address
    i64,            // out_value
    Option<i64>,    // block_height
    Option<i64>,    // timestamp
    Option<i64>,    // fee
);

/// All writes funnel through one async writer slot; reads run on the pool.
pub struct IndexStore {
    pool: SqlitePool,
    network: Network,
    write_lock: Mutex<()>,
}

impl IndexStore {
    pub async fn open(
        path: &Path,
        network: Network,
        passphrase: Option<&str>,
        max_readers: u32,
    ) -> Result<Self, IndexError> {
        let mut options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        if let Some(passphrase) = passphrase {
            // Takes effect when the linked SQLite is SQLCipher.
            options = options.pragma("key", passphrase.to_string());
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(max_readers.max(1))
            .connect_with(options)
            .await?;
        Self::finish_open(pool, network).await
    }

    pub async fn open_in_memory(network: Network) -> Result<Self, IndexError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::finish_open(pool, network).await
    }

    async fn finish_open(pool: SqlitePool, network: Network) -> Result<Self, IndexError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        tracing::debug!(
            scheme = network.scheme,
            network = network.name,
            "index schema ready"
        );
        Ok(Self {
            pool,
            network,
            write_lock: Mutex::new(()),
        })
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub async fn add_block(&self, header: &BlockHeader) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT OR REPLACE INTO block
                 (id, version, prev_hash, merkle_root, timestamp, bits, nonce)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(hash_to_hex(&header.hash()))
        .bind(header.version)
        .bind(hash_to_hex(&header.prev_hash))
        .bind(hash_to_hex(&header.merkle_root))
        .bind(header.timestamp as i64)
        .bind(header.bits as i64)
        .bind(header.nonce as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_merkleblock(
        &self,
        header: &BlockHeader,
        total_transactions: u32,
        hashes: &[Hash256],
        flags: &[u8],
        height: u32,
    ) -> Result<(), IndexError> {
        let mut hash_blob = Vec::with_capacity(hashes.len() * 32);
        for hash in hashes {
            hash_blob.extend_from_slice(hash);
        }
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT OR REPLACE INTO merkleblock
                 (id, version, prev_hash, merkle_root, timestamp, bits, nonce,
                  total_transactions, hashes, flags, height)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(hash_to_hex(&header.hash()))
        .bind(header.version)
        .bind(hash_to_hex(&header.prev_hash))
        .bind(hash_to_hex(&header.merkle_root))
        .bind(header.timestamp as i64)
        .bind(header.bits as i64)
        .bind(header.nonce as i64)
        .bind(total_transactions as i64)
        .bind(hash_blob)
        .bind(flags.to_vec())
        .bind(height as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upserts a transaction. Existing input and output rows for the id are
    /// deleted inside the same database transaction before re-insertion, so
    /// a corrected re-emission fully replaces stale rows and partial writes
    /// are never visible.
    pub async fn add_transaction(
        &self,
        tx: &Transaction,
        block_id: Option<&Hash256>,
    ) -> Result<(), IndexError> {
        let txid_hex = hash_to_hex(&tx.txid());
        let _guard = self.write_lock.lock().await;
        let mut dbtx = self.pool.begin().await?;

        // A re-emission without a containing block never downgrades a
        // transaction that is already confirmed.
        sqlx::query(
            "INSERT OR REPLACE INTO tx (id, version, lock_time, block_id)
             VALUES (?1, ?2, ?3,
                     COALESCE(?4, (SELECT block_id FROM tx WHERE id = ?1)))",
        )
        .bind(&txid_hex)
        .bind(tx.version)
        .bind(tx.lock_time as i64)
        .bind(block_id.map(hash_to_hex))
        .execute(&mut *dbtx)
        .await?;

        sqlx::query("DELETE FROM txin WHERE tx_id = ?1")
            .bind(&txid_hex)
            .execute(&mut *dbtx)
            .await?;
        sqlx::query("DELETE FROM txout WHERE tx_id = ?1")
            .bind(&txid_hex)
            .execute(&mut *dbtx)
            .await?;

        for (index, input) in tx.inputs.iter().enumerate() {
            // Unrecognized script shapes store an empty address and simply
            // never surface in address queries.
            let address = payer_address(&input.script_sig, &self.network).unwrap_or_default();
            sqlx::query(
                "INSERT INTO txin
                     (tx_id, input_index, prev_tx_id, prev_out_index,
                      script_sig, sequence, address)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(&txid_hex)
            .bind(index as i64)
            .bind(hash_to_hex(&input.prev_output.hash))
            .bind(input.prev_output.index as i64)
            .bind(input.script_sig.as_slice())
            .bind(input.sequence as i64)
            .bind(address)
            .execute(&mut *dbtx)
            .await?;
        }

        for (index, output) in tx.outputs.iter().enumerate() {
            let address = payee_address(&output.script_pubkey, &self.network).unwrap_or_default();
            sqlx::query(
                "INSERT INTO txout (tx_id, out_index, value, script_pubkey, address)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&txid_hex)
            .bind(index as i64)
            .bind(output.value)
            .bind(output.script_pubkey.as_slice())
            .bind(address)
            .execute(&mut *dbtx)
            .await?;
        }

        dbtx.commit().await?;
        Ok(())
    }

    /// Sum of unspent output values paying `address`.
    pub async fn calculate_balance(&self, address: &str) -> Result<i64, IndexError> {
        let balance: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(value), 0) FROM view_utxo WHERE address = ?1",
        )
        .bind(address)
        .fetch_one(&self.pool)
        .await?;
        Ok(balance)
    }

    /// Confirmed payment history for `address`, newest first, one row per
    /// transaction.
    pub async fn transactions(&self, address: &str) -> Result<Vec<Payment>, IndexError> {
        let rows: Vec<ViewTxRow> = sqlx::query_as(
            "SELECT tx_id, input_index, in_address, in_value, out_index,
                    out_address, out_value, block_height, timestamp, fee
             FROM view_tx
             WHERE in_address = ?1 OR out_address = ?1
             ORDER BY timestamp DESC, tx_id",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;
        let latest_height = self.latest_block_height().await?.unwrap_or(0);
        Ok(group_payments(rows, Some(address), latest_height))
    }

    /// Unspent outputs paying `address`, as received payments.
    pub async fn unspent_transactions(&self, address: &str) -> Result<Vec<Payment>, IndexError> {
        let rows: Vec<(String, i64, i64, Option<i64>, Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT u.tx_id, u.out_index, u.value, m.height, m.timestamp, f.fee
             FROM view_utxo u
             LEFT JOIN tx t ON t.id = u.tx_id
             LEFT JOIN merkleblock m ON m.id = t.block_id
             LEFT JOIN view_tx_fees f ON f.tx_id = u.tx_id
             WHERE u.address = ?1
             ORDER BY m.timestamp DESC, u.tx_id",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;
        let latest_height = self.latest_block_height().await?.unwrap_or(0);
        let payments = rows
            .into_iter()
            .map(|(tx_id, out_index, value, height, timestamp, fee)| Payment {
                state: PaymentState::Received,
                output_index: out_index as u32,
                amount: value,
                from_address: String::new(),
                to_address: address.to_string(),
                tx_id,
                block_height: height.map(|height| height as u32),
                timestamp: timestamp.map(|timestamp| timestamp as u32),
                confirmations: confirmations(latest_height, height),
                fee,
            })
            .collect();
        Ok(payments)
    }

    /// A single transaction by id, with no reference address.
    pub async fn transaction(&self, tx_id: &Hash256) -> Result<Option<Payment>, IndexError> {
        let rows: Vec<ViewTxRow> = sqlx::query_as(
            "SELECT tx_id, input_index, in_address, in_value, out_index,
                    out_address, out_value, block_height, timestamp, fee
             FROM view_tx
             WHERE tx_id = ?1
             ORDER BY input_index, out_index",
        )
        .bind(hash_to_hex(tx_id))
        .fetch_all(&self.pool)
        .await?;
        let latest_height = self.latest_block_height().await?.unwrap_or(0);
        Ok(group_payments(rows, None, latest_height).into_iter().next())
    }

    pub async fn latest_block_hash(&self) -> Result<Option<Hash256>, IndexError> {
        Ok(self.latest_block().await?.map(|(hash, _)| hash))
    }

    pub async fn latest_block_height(&self) -> Result<Option<u32>, IndexError> {
        Ok(self.latest_block().await?.map(|(_, height)| height))
    }

    /// Tip of the stored chain: the merkle-block with the greatest assigned
    /// height.
    pub async fn latest_block(&self) -> Result<Option<(Hash256, u32)>, IndexError> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT id, height FROM merkleblock ORDER BY height DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((id, height)) => {
                let hash =
                    hash_from_hex(&id).ok_or(IndexError::Corrupt("malformed stored block id"))?;
                Ok(Some((hash, height as u32)))
            }
            None => Ok(None),
        }
    }

    pub async fn block_hash_at_height(&self, height: u32) -> Result<Option<Hash256>, IndexError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT id FROM merkleblock WHERE height = ?1 LIMIT 1")
                .bind(height as i64)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((id,)) => Ok(Some(
                hash_from_hex(&id).ok_or(IndexError::Corrupt("malformed stored block id"))?,
            )),
            None => Ok(None),
        }
    }
}

fn confirmations(latest_height: u32, height: Option<i64>) -> u32 {
    match height {
        Some(height) => latest_height.saturating_sub(height as u32),
        None => 0,
    }
}

fn group_payments(
    rows: Vec<ViewTxRow>,
    reference: Option<&str>,
    latest_height: u32,
) -> Vec<Payment> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<ViewTxRow>> = HashMap::new();
    for row in rows {
        if !grouped.contains_key(&row.0) {
            order.push(row.0.clone());
            grouped.insert(row.0.clone(), Vec::new());
        }
        if let Some(bucket) = grouped.get_mut(&row.0) {
            bucket.push(row);
        }
    }
    order
        .into_iter()
        .filter_map(|tx_id| {
            let rows = grouped.remove(&tx_id)?;
            build_payment(tx_id, rows, reference, latest_height)
        })
        .collect()
}

fn build_payment(
    tx_id: String,
    rows: Vec<ViewTxRow>,
    reference: Option<&str>,
    latest_height: u32,
) -> Option<Payment> {
    let first = rows.first()?;
    let block_height = first.7;
    let timestamp = first.8;
    let fee = first.9;

    let first_in_address = rows
        .iter()
        .find_map(|row| row.2.as_deref().filter(|address| !address.is_empty()))
        .unwrap_or("")
        .to_string();

    let (state, output_index, amount, from_address, to_address) = match reference {
        None => {
            let mut seen = HashSet::new();
            let mut total = 0i64;
            for row in &rows {
                if seen.insert(row.4) {
                    total += row.6;
                }
            }
            let to = rows
                .iter()
                .map(|row| row.5.as_str())
                .find(|address| !address.is_empty())
                .unwrap_or("")
                .to_string();
            (
                PaymentState::Unknown,
                first.4 as u32,
                total,
                first_in_address,
                to,
            )
        }
        Some(reference) => {
            let mut received = 0i64;
            let mut received_index = None;
            let mut seen_out = HashSet::new();
            for row in &rows {
                if row.5 == reference && seen_out.insert(row.4) {
                    received += row.6;
                    received_index.get_or_insert(row.4);
                }
            }
            if let Some(index) = received_index {
                (
                    PaymentState::Received,
                    index as u32,
                    received,
                    first_in_address,
                    reference.to_string(),
                )
            } else {
                let mut sent = 0i64;
                let mut seen_in = HashSet::new();
                for row in &rows {
                    if row.2.as_deref() == Some(reference) {
                        if let (Some(index), Some(value)) = (row.1, row.3) {
                            if seen_in.insert(index) {
                                sent += value;
                            }
                        }
                    }
                }
                let counterparty = rows
                    .iter()
                    .find(|row| row.5 != reference && !row.5.is_empty())
                    .map(|row| (row.4, row.5.clone()))
                    .unwrap_or((first.4, String::new()));
                (
                    PaymentState::Sent,
                    counterparty.0 as u32,
                    sent,
                    reference.to_string(),
                    counterparty.1,
                )
            }
        }
    };

    Some(Payment {
        state,
        output_index,
        amount,
        from_address,
        to_address,
        tx_id,
        block_height: block_height.map(|height| height as u32),
        timestamp: timestamp.map(|timestamp| timestamp as u32),
        confirmations: confirmations(latest_height, block_height),
        fee,
    })
}
