//! Per-command transaction coordinator.
//!
//! A [`Transaction`] knows which keys a command touches, which shards own them, and
//! drives the hop protocol over those shards:
//!
//! ```text
//!   single shard:   ── execute hop ──> done
//!
//!   multi shard:    ── arm: hold every shard ───────────> wait until all active
//!                   ── execute: hops through the holds ─> merge in shard-id order
//!                   ── release holds
//! ```
//!
//! While armed, each participating shard runs nothing but this transaction's hops, so
//! a transaction queued later on any of those shards waits until this one has finished
//! everywhere. Observers never see a multi-shard command applied on some shards only.
//! The orchestrating task waits on a [`HopBarrier`], which suspends the task rather
//! than blocking a thread.
//!
//! A transaction whose future is dropped mid-flight is abandoned: hops it already
//! queued still run to completion and their results are discarded. Dropping the
//! transaction releases its holds.

use crate::engine::shard::{HopHandle, OpArgs, ShardHold, ShardId, ShardSet};
use crate::error::EngineResult;
use crate::storage::DbSlice;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    /// Built, nothing queued yet
    Unscheduled,
    /// Every participating shard is held by this transaction
    Armed,
    /// Execute hops are being queued or awaited
    Executing,
    /// All hops finished
    Done,
}

/// Operational details exposed after a command completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxDebugInfo {
    /// Distinct shards that ran at least one hop for this command
    pub shards_count: usize,
}

/// The keys of a transaction that route to one shard, each with its position in the
/// command's key list. Duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardKeys {
    entries: Vec<(usize, Bytes)>,
}

impl ShardKeys {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in argument order.
    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.entries.iter().map(|(_, k)| k)
    }

    /// `(argument index, key)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Bytes)> {
        self.entries.iter().map(|(i, k)| (*i, k))
    }
}

/// A completion counter awaited by the orchestrating task.
#[derive(Debug)]
pub struct HopBarrier {
    pending: AtomicUsize,
    notify: Notify,
}

impl HopBarrier {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(count),
            notify: Notify::new(),
        })
    }

    /// Marks one hop as finished.
    pub fn arrive(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_one();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Suspends until every expected hop has arrived.
    pub async fn wait(&self) {
        while self.pending() != 0 {
            self.notify.notified().await;
        }
    }
}

/// Arrives on its barrier when dropped, so a hold dropped unrun by a closed queue
/// still releases the orchestrator.
struct ArriveOnDrop(Arc<HopBarrier>);

impl Drop for ArriveOnDrop {
    fn drop(&mut self) {
        self.0.arrive();
    }
}

/// Coordinator for one command.
pub struct Transaction {
    name: &'static str,
    shard_set: Arc<ShardSet>,
    keys: Vec<Bytes>,
    shard_keys: BTreeMap<ShardId, ShardKeys>,
    phase: TxPhase,
    touched: BTreeSet<ShardId>,
    holds: BTreeMap<ShardId, ShardHold>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("name", &self.name)
            .field("keys", &self.keys.len())
            .field("shards", &self.shard_keys.keys().collect::<Vec<_>>())
            .field("phase", &self.phase)
            .finish()
    }
}

impl Transaction {
    /// Routes `keys` and records the participating shards. Nothing is scheduled yet.
    pub fn new(shard_set: Arc<ShardSet>, name: &'static str, keys: Vec<Bytes>) -> Self {
        let mut shard_keys: BTreeMap<ShardId, ShardKeys> = BTreeMap::new();
        for (index, key) in keys.iter().enumerate() {
            shard_keys
                .entry(shard_set.route_key(key))
                .or_default()
                .entries
                .push((index, key.clone()));
        }

        Self {
            name,
            shard_set,
            keys,
            shard_keys,
            phase: TxPhase::Unscheduled,
            touched: BTreeSet::new(),
            holds: BTreeMap::new(),
        }
    }

    /// Starts a related transaction over `keys` (for follow-up lookups whose keys are
    /// only known after a first round of hops). Fold it back with [`absorb`](Self::absorb).
    pub fn child(&self, keys: Vec<Bytes>) -> Transaction {
        Transaction::new(Arc::clone(&self.shard_set), self.name, keys)
    }

    /// Counts the shards a finished child transaction touched as our own.
    pub fn absorb(&mut self, child: Transaction) {
        self.touched.extend(child.touched);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn keys(&self) -> &[Bytes] {
        &self.keys
    }

    pub fn phase(&self) -> TxPhase {
        self.phase
    }

    pub fn shard_set(&self) -> &Arc<ShardSet> {
        &self.shard_set
    }

    /// Participating shards, ascending.
    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.shard_keys.keys().copied()
    }

    pub fn unique_shard_cnt(&self) -> usize {
        self.shard_keys.len()
    }

    pub fn is_multi_shard(&self) -> bool {
        self.shard_keys.len() > 1
    }

    /// Shard owning `key`.
    pub fn route(&self, key: &[u8]) -> ShardId {
        self.shard_set.route_key(key)
    }

    pub fn debug_info(&self) -> TxDebugInfo {
        TxDebugInfo {
            shards_count: self.touched.len(),
        }
    }

    /// Takes a hold on every participating shard and waits until all are active.
    /// Single-shard and keyless transactions skip straight to `Armed`: one hop is
    /// already atomic.
    pub async fn arm(&mut self) -> EngineResult<()> {
        self.arm_shards(self.shard_keys.keys().copied().collect()).await
    }

    async fn arm_shards(&mut self, shards: Vec<ShardId>) -> EngineResult<()> {
        if self.phase != TxPhase::Unscheduled {
            return Ok(());
        }

        if shards.len() > 1 {
            let barrier = HopBarrier::new(shards.len());
            let holds = self
                .shard_set
                .hold(&shards, || ArriveOnDrop(Arc::clone(&barrier)));
            barrier.wait().await;
            self.holds = holds.into_iter().map(|h| (h.shard_id(), h)).collect();
            self.touched.extend(shards.iter().copied());
            trace!(tx = self.name, shards = shards.len(), "Transaction armed");
        }

        self.phase = TxPhase::Armed;
        Ok(())
    }

    /// Queues `f` on `shard_id`, through this transaction's hold when it has one.
    fn submit<F, R>(&self, shard_id: ShardId, f: F) -> HopHandle<R>
    where
        F: FnOnce(&mut DbSlice, &OpArgs) -> R + Send + 'static,
        R: Send + 'static,
    {
        match self.holds.get(&shard_id) {
            Some(hold) => hold.schedule(f),
            None => self.shard_set.schedule(shard_id, f),
        }
    }

    /// Lets the held shards go back to their queues.
    fn release(&mut self) {
        if !self.holds.is_empty() {
            trace!(tx = self.name, shards = self.holds.len(), "Transaction released");
            self.holds.clear();
        }
        self.phase = TxPhase::Done;
    }

    /// Runs `cb` once on every participating shard with that shard's keys.
    /// Results come back in ascending shard-id order regardless of completion order.
    pub async fn execute<F, R>(&mut self, cb: F) -> EngineResult<Vec<(ShardId, R)>>
    where
        F: Fn(&ShardKeys, &mut DbSlice, &OpArgs) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        debug_assert_ne!(self.phase, TxPhase::Done, "transaction already finished");

        if self.shard_keys.is_empty() {
            self.phase = TxPhase::Done;
            return Ok(Vec::new());
        }

        self.arm().await?;
        self.phase = TxPhase::Executing;

        let cb = Arc::new(cb);
        let handles: Vec<_> = self
            .shard_keys
            .iter()
            .map(|(&sid, keys)| {
                let cb = Arc::clone(&cb);
                let keys = keys.clone();
                self.submit(sid, move |db, op| cb(&keys, db, op))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let sid = handle.shard_id();
            self.touched.insert(sid);
            results.push((sid, handle.wait().await?));
        }

        self.release();
        Ok(results)
    }

    /// Runs a single hop on `shard_id`, passing the keys of this transaction that route
    /// there (possibly none). Multi-shard transactions are armed first and stay armed
    /// until [`conclude`](Self::conclude), so every chained hop runs in the same
    /// isolated window. Used by commands where one hop's output feeds the next.
    ///
    /// An armed transaction may only target its own shards.
    pub async fn execute_on<F, R>(&mut self, shard_id: ShardId, f: F) -> EngineResult<R>
    where
        F: FnOnce(&ShardKeys, &mut DbSlice, &OpArgs) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.arm().await?;
        self.phase = TxPhase::Executing;
        debug_assert!(
            self.holds.is_empty() || self.holds.contains_key(&shard_id),
            "armed transaction targeting a shard it does not hold"
        );

        let keys = self.shard_keys.get(&shard_id).cloned().unwrap_or_default();
        self.touched.insert(shard_id);
        self.submit(shard_id, move |db, op| f(&keys, db, op))
            .wait()
            .await
    }

    /// Runs `f` on every shard of the set, for keyspace-wide commands. The whole set
    /// is held, so the results form one consistent snapshot.
    pub async fn execute_all<F, R>(&mut self, f: F) -> EngineResult<Vec<R>>
    where
        F: Fn(&mut DbSlice, &OpArgs) -> R + Clone + Send + 'static,
        R: Send + 'static,
    {
        let all: Vec<ShardId> = (0..self.shard_set.size()).map(|s| s as ShardId).collect();
        self.arm_shards(all.clone()).await?;
        self.phase = TxPhase::Executing;

        let handles: Vec<_> = all.iter().map(|&sid| self.submit(sid, f.clone())).collect();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.wait().await?);
        }

        self.touched.extend(all);
        self.release();
        Ok(results)
    }

    /// Marks a chained transaction as finished and releases its shards.
    pub fn conclude(&mut self) {
        self.release();
    }
}
