//! The sync controller: assigns heights to accepted merkle-blocks, buffers
//! their matched transactions, and commits through the index.
//!
//! Sync progress is always defined by what is persisted, never by what is in
//! flight: a replacement syncer restarts from the stored tip and idempotent
//! inserts absorb the overlap.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use spvkit_index::{IndexError, IndexStore};
use spvkit_network::{hash_to_display_hex, Hash256, Network};
use spvkit_primitives::Transaction;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::message::MerkleBlockMessage;

#[derive(Debug)]
pub enum SyncError {
    Protocol(ProtocolError),
    Store(IndexError),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Protocol(err) => write!(f, "{err}"),
            SyncError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err)
    }
}

impl From<IndexError> for SyncError {
    fn from(err: IndexError) -> Self {
        SyncError::Store(err)
    }
}

/// What became of an incoming merkle-block.
#[derive(Debug, Eq, PartialEq)]
pub enum MerkleOutcome {
    /// Committed immediately (no transactions outstanding).
    Committed { height: u32 },
    /// Buffered until its matched transactions arrive or the assembly
    /// window fires.
    Pending { height: u32 },
    /// The block does not extend the stored tip; the caller should point
    /// the peer back at the returned locator.
    Realign {
        locator: Vec<Hash256>,
        latest_height: u32,
    },
    /// Dropped while waiting for headers to realign.
    Discarded,
}

/// What became of an incoming transaction.
#[derive(Debug, Eq, PartialEq)]
pub struct TxOutcome {
    /// The transaction completed a pending block at this height.
    pub committed_height: Option<u32>,
    /// Whether the pending block was expecting this transaction.
    pub matched: bool,
}

struct PendingBlock {
    block: MerkleBlockMessage,
    height: u32,
    expected: HashSet<Hash256>,
    transactions: Vec<Transaction>,
    deadline: Instant,
}

struct ChainSyncState {
    tip_hash: Hash256,
    tip_height: u32,
    sync_start_height: u32,
    pending: Option<PendingBlock>,
    realigning: bool,
}

/// Tracks the latest-known tip and feeds accepted rows into the index.
pub struct BlockChain {
    network: Arc<Network>,
    index: Arc<IndexStore>,
    assembly_window: std::time::Duration,
    state: Mutex<ChainSyncState>,
}

impl BlockChain {
    /// Loads the tip from the index, falling back to the most recent
    /// built-in checkpoint on a fresh store.
    pub async fn open(
        network: Arc<Network>,
        index: Arc<IndexStore>,
        assembly_window: std::time::Duration,
    ) -> Result<Self, IndexError> {
        let (tip_hash, tip_height) = match index.latest_block().await? {
            Some(tip) => tip,
            None => {
                let checkpoint = network.last_checkpoint();
                (checkpoint.hash, checkpoint.height)
            }
        };
        info!(
            height = tip_height,
            hash = %hash_to_display_hex(&tip_hash),
            "chain tip loaded"
        );
        Ok(Self {
            network,
            index,
            assembly_window,
            state: Mutex::new(ChainSyncState {
                tip_hash,
                tip_height,
                sync_start_height: tip_height,
                pending: None,
                realigning: false,
            }),
        })
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    pub async fn latest(&self) -> (Hash256, u32) {
        let state = self.state.lock().await;
        (state.tip_hash, state.tip_height)
    }

    /// Records the baseline the progress fraction is measured from.
    pub async fn mark_sync_start(&self) {
        let mut state = self.state.lock().await;
        state.sync_start_height = state.tip_height;
    }

    /// Fraction of the distance from the sync baseline to the remote tip.
    pub async fn progress(&self, remote_best: i32) -> f64 {
        let state = self.state.lock().await;
        if remote_best <= 0 {
            return 0.0;
        }
        let remote = remote_best as f64;
        let start = state.sync_start_height as f64;
        if remote <= start {
            return 1.0;
        }
        ((state.tip_height as f64 - start) / (remote - start)).clamp(0.0, 1.0)
    }

    /// Block locator rooted at the stored tip: dense for ten blocks, then
    /// doubling strides back to the genesis anchor.
    pub async fn locator(&self) -> Result<Vec<Hash256>, IndexError> {
        let (tip_hash, tip_height) = self.latest().await;
        let mut locator = vec![tip_hash];
        let mut step = 1u32;
        let mut height = tip_height;
        while height > 0 {
            height = height.saturating_sub(step);
            if locator.len() >= 10 {
                step = step.saturating_mul(2);
            }
            if let Some(hash) = self.index.block_hash_at_height(height).await? {
                locator.push(hash);
            }
            if height == 0 {
                break;
            }
        }
        if locator.last() != Some(&self.network.genesis_hash) {
            locator.push(self.network.genesis_hash);
        }
        Ok(locator)
    }

    pub async fn handle_merkleblock(
        &self,
        block: MerkleBlockMessage,
    ) -> Result<MerkleOutcome, SyncError> {
        let mut state = self.state.lock().await;

        // The ordering contract says a new merkle-block means the previous
        // one's transactions are complete; commit whatever assembled.
        if state.pending.is_some() {
            self.commit_pending(&mut state).await?;
        }

        if block.header.prev_hash != state.tip_hash {
            if state.realigning {
                return Ok(MerkleOutcome::Discarded);
            }
            state.realigning = true;
            drop(state);
            let locator = self.locator().await?;
            let (_, latest_height) = self.latest().await;
            return Ok(MerkleOutcome::Realign {
                locator,
                latest_height,
            });
        }
        state.realigning = false;

        let expected: HashSet<Hash256> = if block.total_transactions == 0 {
            HashSet::new()
        } else {
            let matches = block
                .partial_tree()
                .extract_matches()
                .map_err(|_| ProtocolError::MerkleRootMismatch)?;
            if matches.root != block.header.merkle_root {
                return Err(ProtocolError::MerkleRootMismatch.into());
            }
            matches.matched.into_iter().collect()
        };

        let height = state.tip_height + 1;
        state.pending = Some(PendingBlock {
            block,
            height,
            expected,
            transactions: Vec::new(),
            deadline: Instant::now() + self.assembly_window,
        });

        if state
            .pending
            .as_ref()
            .is_some_and(|pending| pending.expected.is_empty())
        {
            self.commit_pending(&mut state).await?;
            return Ok(MerkleOutcome::Committed { height });
        }
        Ok(MerkleOutcome::Pending { height })
    }

    pub async fn handle_tx(&self, tx: &Transaction) -> Result<TxOutcome, SyncError> {
        let mut state = self.state.lock().await;
        let txid = tx.txid();

        if let Some(pending) = &mut state.pending {
            if pending.expected.remove(&txid) {
                pending.transactions.push(tx.clone());
                if pending.expected.is_empty() {
                    let height = pending.height;
                    self.commit_pending(&mut state).await?;
                    return Ok(TxOutcome {
                        committed_height: Some(height),
                        matched: true,
                    });
                }
                return Ok(TxOutcome {
                    committed_height: None,
                    matched: true,
                });
            }
        }

        // Unsolicited but filter-matched, e.g. a zero-confirmation payment
        // or an echo of our own broadcast. Stored without a block; the
        // upsert on block arrival replaces it.
        self.index.add_transaction(tx, None).await?;
        Ok(TxOutcome {
            committed_height: None,
            matched: false,
        })
    }

    /// Commits the pending block if its assembly window has expired.
    pub async fn flush_due(&self) -> Result<Option<u32>, SyncError> {
        let mut state = self.state.lock().await;
        let due = state
            .pending
            .as_ref()
            .is_some_and(|pending| Instant::now() >= pending.deadline);
        if !due {
            return Ok(None);
        }
        let height = state.pending.as_ref().map(|pending| pending.height);
        warn!(height, "block assembly window expired, committing partial set");
        self.commit_pending(&mut state).await?;
        Ok(height)
    }

    /// Commits any pending block immediately.
    pub async fn flush_all(&self) -> Result<Option<u32>, SyncError> {
        let mut state = self.state.lock().await;
        let height = state.pending.as_ref().map(|pending| pending.height);
        self.commit_pending(&mut state).await?;
        Ok(height)
    }

    /// Transactions persist before the merkle-block row, so the history
    /// view's timestamp join never surfaces partial state.
    async fn commit_pending(&self, state: &mut ChainSyncState) -> Result<(), SyncError> {
        let Some(pending) = state.pending.take() else {
            return Ok(());
        };
        let block_id = pending.block.header.hash();

        for tx in &pending.transactions {
            self.index.add_transaction(tx, Some(&block_id)).await?;
        }
        self.index.add_block(&pending.block.header).await?;
        self.index
            .add_merkleblock(
                &pending.block.header,
                pending.block.total_transactions,
                &pending.block.hashes,
                &pending.block.flags,
                pending.height,
            )
            .await?;

        state.tip_hash = block_id;
        state.tip_height = pending.height;
        debug!(
            height = pending.height,
            transactions = pending.transactions.len(),
            hash = %hash_to_display_hex(&block_id),
            "merkle-block committed"
        );
        Ok(())
    }
}
