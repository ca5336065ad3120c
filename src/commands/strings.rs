//! String commands: SET, GET, MSET, MGET.

use crate::commands::generic::ExpireAt;
use crate::commands::single_key_hop;
use crate::engine::Transaction;
use crate::error::EngineResult;
use crate::storage::{Entry, Value, ValueType};
use bytes::Bytes;
use std::sync::Arc;

/// NX / XX.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetCondition {
    #[default]
    Always,
    IfMissing,
    IfExists,
}

/// SET options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub expire: Option<ExpireAt>,
    pub condition: SetCondition,
    pub keep_ttl: bool,
}

/// SET: returns false when the NX/XX condition prevented the write.
pub async fn set(tx: &mut Transaction, value: Bytes, opts: SetOptions) -> EngineResult<bool> {
    single_key_hop(tx, move |key, db, op| {
        let now = op.now_ms;
        let current = db.get(key, now).map(|entry| entry.expire_at);

        match (opts.condition, current.is_some()) {
            (SetCondition::IfMissing, true) | (SetCondition::IfExists, false) => return false,
            _ => {}
        }

        let expire_at = match opts.expire {
            Some(when) => Some(when.resolve(now)),
            None if opts.keep_ttl => current.flatten(),
            None => None,
        };
        db.insert(key.clone(), Entry::with_expiry(Value::String(value), expire_at));
        true
    })
    .await
}

/// GET: None for a missing key, WRONGTYPE for a non-string.
pub async fn get(tx: &mut Transaction) -> EngineResult<Option<Bytes>> {
    single_key_hop(tx, |key, db, op| -> EngineResult<Option<Bytes>> {
        db.get_typed(key, ValueType::String, op.now_ms)?
            .map(|entry| entry.value.as_string().cloned())
            .transpose()
    })
    .await?
}

/// MSET: `values[i]` belongs to the i-th key of the transaction.
pub async fn mset(tx: &mut Transaction, values: Vec<Bytes>) -> EngineResult<()> {
    let values = Arc::new(values);
    tx.execute(move |keys, db, _| {
        for (index, key) in keys.iter() {
            db.insert(key.clone(), Entry::new(Value::String(values[index].clone())));
        }
    })
    .await?;
    Ok(())
}

/// MGET: one slot per requested key, None for missing or non-string values.
pub async fn mget(tx: &mut Transaction) -> EngineResult<Vec<Option<Bytes>>> {
    let mut values = vec![None; tx.keys().len()];
    let per_shard = tx
        .execute(|keys, db, op| {
            keys.iter()
                .map(|(index, key)| {
                    let value = match db.get(key, op.now_ms).map(|e| &e.value) {
                        Some(Value::String(s)) => Some(s.clone()),
                        _ => None,
                    };
                    (index, value)
                })
                .collect::<Vec<_>>()
        })
        .await?;

    for (index, value) in per_shard.into_iter().flat_map(|(_, found)| found) {
        values[index] = value;
    }
    Ok(values)
}
