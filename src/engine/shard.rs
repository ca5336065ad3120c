//! Shards and the shard set.
//!
//! Each shard is a dedicated OS thread that owns one [`DbSlice`] and drains a FIFO
//! queue of hops. A hop is a boxed closure; running it is the *only* way to read or
//! write the partition, and hops on one shard never overlap. That queue order is the
//! engine's isolation mechanism, so there are no per-key locks anywhere.
//!
//! ```text
//!   orchestrating task                      shard thread (one per shard)
//!  ┌──────────────────┐   hop (closure)    ┌───────────────────────────┐
//!  │ schedule(sid, f) │ ─────────────────> │ loop {                    │
//!  │                  │                    │   now = clock.now_ms()    │
//!  │ handle.wait()    │ <───────────────── │   run queued hops(db,now) │
//!  └──────────────────┘   oneshot result   │ }                         │
//!                                          └───────────────────────────┘
//! ```
//!
//! Multi-shard transactions take a [`ShardHold`] on each shard they touch. A hold is a
//! hop that, once it reaches the head of the queue, keeps the shard thread and runs
//! only work submitted through the hold until it is released. Holds are queued under a
//! single lock, so any two transactions are ordered the same way on every shard they
//! share.
//!
//! Failure semantics: a callback that fails returns an `Err` inside its result and the
//! loop keeps going. A callback that panics has left the partition in an unknown
//! state, and the process aborts. [`EngineError::Aborted`] is only seen by hops that
//! were dropped unrun because the queue closed.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::storage::{key_hash, Clock, DbSlice};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Shard identifier, dense in `0..shard_count`.
pub type ShardId = u16;

/// Upper bound on hops run with a single clock sample.
pub const MAX_HOPS_PER_ITERATION: usize = 64;

/// Context handed to every hop callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpArgs {
    /// Shard running the hop
    pub shard_id: ShardId,
    /// Clock sample taken at the start of the current scheduling iteration
    pub now_ms: u64,
}

type HopFn = Box<dyn FnOnce(&mut DbSlice, &OpArgs) + Send + 'static>;

/// Completion side of a scheduled hop.
#[derive(Debug)]
pub struct HopHandle<R> {
    shard_id: ShardId,
    rx: oneshot::Receiver<R>,
}

impl<R> HopHandle<R> {
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Suspends the calling task until the hop has run.
    ///
    /// Dropping the handle instead abandons the result; the hop still runs.
    pub async fn wait(self) -> EngineResult<R> {
        self.rx.await.map_err(|_| EngineError::Aborted(self.shard_id))
    }
}

/// Exclusive claim on one shard's thread for the lifetime of a transaction.
///
/// Work scheduled through the hold runs in submission order. Dropping the hold
/// releases the shard.
#[derive(Debug)]
pub struct ShardHold {
    shard_id: ShardId,
    tx: mpsc::UnboundedSender<HopFn>,
}

impl ShardHold {
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Runs `f` on the held shard and returns a handle to its result.
    pub fn schedule<F, R>(&self, f: F) -> HopHandle<R>
    where
        F: FnOnce(&mut DbSlice, &OpArgs) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let hop: HopFn = Box::new(move |db, op| {
            let _ = tx.send(f(db, op));
        });
        if self.tx.send(hop).is_err() {
            warn!(shard_id = self.shard_id, "Shard hold gone, hop dropped");
        }
        HopHandle {
            shard_id: self.shard_id,
            rx,
        }
    }
}

struct Shard {
    tx: mpsc::UnboundedSender<HopFn>,
    thread: Option<JoinHandle<()>>,
}

/// The fixed set of shards plus the key router.
pub struct ShardSet {
    shards: Vec<Shard>,
    slots_per_shard: usize,
    clock: Clock,
    hold_order: Mutex<()>,
}

impl std::fmt::Debug for ShardSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSet")
            .field("shards", &self.shards.len())
            .field("slots_per_shard", &self.slots_per_shard)
            .field("virtual_clock", &self.clock.is_virtual())
            .finish()
    }
}

impl ShardSet {
    /// Starts one thread per configured shard.
    pub fn new(config: &EngineConfig, clock: Clock) -> EngineResult<Self> {
        config.validate()?;

        let mut shards = Vec::with_capacity(config.shards);
        for index in 0..config.shards {
            let shard_id = index as ShardId;
            let (tx, rx) = mpsc::unbounded_channel();
            let db = DbSlice::new(config.scan_slots);
            let clock = clock.clone();

            let thread = thread::Builder::new()
                .name(format!("shard-{}", shard_id))
                .spawn(move || shard_loop(shard_id, rx, db, clock))?;

            shards.push(Shard {
                tx,
                thread: Some(thread),
            });
        }

        info!(
            shards = config.shards,
            slots_per_shard = config.scan_slots,
            "Shard set started"
        );

        Ok(Self {
            shards,
            slots_per_shard: config.scan_slots,
            clock,
            hold_order: Mutex::new(()),
        })
    }

    /// Number of shards.
    pub fn size(&self) -> usize {
        self.shards.len()
    }

    /// Scan slots in each shard's partition.
    pub fn slots_per_shard(&self) -> usize {
        self.slots_per_shard
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Maps a key to its shard. Stable for the lifetime of the process.
    #[inline]
    pub fn route_key(&self, key: &[u8]) -> ShardId {
        ((key_hash(key) & 0xffff_ffff) % self.shards.len() as u64) as ShardId
    }

    /// Enqueues `f` on `shard_id` and returns a handle to its result.
    pub fn schedule<F, R>(&self, shard_id: ShardId, f: F) -> HopHandle<R>
    where
        F: FnOnce(&mut DbSlice, &OpArgs) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatch(shard_id, move |db, op| {
            // The orchestrator may have gone away; the hop still ran.
            let _ = tx.send(f(db, op));
        });
        HopHandle { shard_id, rx }
    }

    /// Enqueues `f` on `shard_id` without tracking its completion.
    pub fn dispatch<F>(&self, shard_id: ShardId, f: F)
    where
        F: FnOnce(&mut DbSlice, &OpArgs) + Send + 'static,
    {
        let shard = &self.shards[shard_id as usize];
        if shard.tx.send(Box::new(f)).is_err() {
            warn!(shard_id, "Shard queue closed, hop dropped");
        }
    }

    /// Queues a hold on each of `shard_ids`. `on_active` builds a guard per shard that
    /// is dropped once that shard's hold has reached the head of its queue.
    ///
    /// All holds of one call are queued under a set-wide lock: if two callers share
    /// shards, one of them is ahead of the other on every shared shard.
    pub fn hold<G>(
        &self,
        shard_ids: &[ShardId],
        mut on_active: impl FnMut() -> G,
    ) -> Vec<ShardHold>
    where
        G: Send + 'static,
    {
        let _order = self.hold_order.lock().unwrap_or_else(PoisonError::into_inner);

        shard_ids
            .iter()
            .map(|&shard_id| {
                let (tx, mut rx) = mpsc::unbounded_channel::<HopFn>();
                let guard = on_active();
                self.dispatch(shard_id, move |db, op| {
                    drop(guard);
                    let mut ran = 0usize;
                    while let Some(hop) = rx.blocking_recv() {
                        hop(db, op);
                        ran += 1;
                    }
                    trace!(shard_id, hops = ran, "Shard hold released");
                });
                ShardHold { shard_id, tx }
            })
            .collect()
    }

    /// Runs `f` on every shard and returns the results in shard-id order.
    pub async fn run_on_all<F, R>(&self, f: F) -> EngineResult<Vec<R>>
    where
        F: Fn(&mut DbSlice, &OpArgs) -> R + Clone + Send + 'static,
        R: Send + 'static,
    {
        let handles: Vec<_> = (0..self.size())
            .map(|sid| self.schedule(sid as ShardId, f.clone()))
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.wait().await?);
        }
        Ok(results)
    }
}

impl Drop for ShardSet {
    fn drop(&mut self) {
        for (shard_id, shard) in self.shards.drain(..).enumerate() {
            let Shard { tx, thread } = shard;
            // Closing the queue lets the thread finish what is queued and exit.
            drop(tx);
            if let Some(thread) = thread {
                if thread.join().is_err() {
                    error!(shard_id, "Shard thread panicked");
                }
            }
        }
        debug!("Shard set stopped");
    }
}

fn shard_loop(
    shard_id: ShardId,
    mut rx: mpsc::UnboundedReceiver<HopFn>,
    mut db: DbSlice,
    clock: Clock,
) {
    debug!(shard_id, "Shard thread started");

    while let Some(hop) = rx.blocking_recv() {
        let op = OpArgs {
            shard_id,
            now_ms: clock.now_ms(),
        };
        run_hop(hop, &mut db, &op);

        let mut ran = 1;
        while ran < MAX_HOPS_PER_ITERATION {
            match rx.try_recv() {
                Ok(hop) => {
                    run_hop(hop, &mut db, &op);
                    ran += 1;
                }
                Err(_) => break,
            }
        }
        trace!(shard_id, hops = ran, "Scheduling iteration done");
    }

    debug!(shard_id, keys = db.len(), "Shard thread stopped");
}

/// Runs one hop. A panic leaves the partition half-modified, so the process aborts
/// regardless of the build's panic strategy.
fn run_hop(hop: HopFn, db: &mut DbSlice, op: &OpArgs) {
    if panic::catch_unwind(AssertUnwindSafe(|| hop(db, op))).is_err() {
        error!(shard_id = op.shard_id, "Hop panicked, aborting");
        std::process::abort();
    }
}
