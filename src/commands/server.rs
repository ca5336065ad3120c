//! Keyspace-wide server commands.

use crate::engine::Transaction;
use crate::error::EngineResult;
use tracing::info;

/// DBSIZE: stored keys over all shards, including past-due keys not yet reclaimed.
pub async fn dbsize(tx: &mut Transaction) -> EngineResult<i64> {
    let sizes = tx.execute_all(|db, _| db.len()).await?;
    Ok(sizes.into_iter().sum::<usize>() as i64)
}

/// FLUSHDB / FLUSHALL.
pub async fn flush(tx: &mut Transaction) -> EngineResult<()> {
    let removed = tx
        .execute_all(|db, _| {
            let len = db.len();
            db.clear();
            len
        })
        .await?;
    info!(keys = removed.iter().sum::<usize>(), "Keyspace flushed");
    Ok(())
}
