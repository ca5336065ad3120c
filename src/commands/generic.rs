//! Generic key commands: DEL, EXISTS, TTL/PTTL, the EXPIRE family, PERSIST, RENAME,
//! TYPE, KEYS, SCAN and SORT.
//!
//! Every function here receives an already-validated [`Transaction`] and only decides
//! what each shard hop does and how partial results are merged.

use crate::commands::single_key_hop;
use crate::engine::{ScanCursor, Transaction};
use crate::error::{EngineError, EngineResult};
use crate::storage::{Direction, GlobPattern, ScanFilter, Value};
use bytes::Bytes;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::trace;

/// Resolution of TTL replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlUnit {
    Seconds,
    Millis,
}

/// A deadline as given by the client, resolved against the shard's clock sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireAt {
    /// Milliseconds from now (may be negative)
    Relative(i64),
    /// Unix milliseconds (may be in the past)
    Absolute(i64),
}

impl ExpireAt {
    pub fn resolve(self, now_ms: u64) -> u64 {
        match self {
            ExpireAt::Relative(ms) => (now_ms as i64).saturating_add(ms).max(0) as u64,
            ExpireAt::Absolute(ms) => ms.max(0) as u64,
        }
    }
}

/// SCAN arguments.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub cursor: ScanCursor,
    /// Advisory amount of work per call
    pub count: usize,
    pub filter: ScanFilter,
}

/// SORT arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortOptions {
    /// BY pattern; `*` is replaced by each element
    pub by: Option<Bytes>,
    pub alpha: bool,
    pub desc: bool,
    /// LIMIT offset count
    pub limit: Option<(i64, i64)>,
}

/// DEL: number of keys actually removed.
pub async fn del(tx: &mut Transaction) -> EngineResult<i64> {
    let removed = tx
        .execute(|keys, db, op| {
            keys.keys()
                .filter(|key| db.remove(key, op.now_ms).is_some())
                .count()
        })
        .await?;
    Ok(removed.into_iter().map(|(_, n)| n as i64).sum())
}

/// EXISTS: every present occurrence counts, duplicates included.
pub async fn exists(tx: &mut Transaction) -> EngineResult<i64> {
    let found = tx
        .execute(|keys, db, op| keys.keys().filter(|key| db.exists(key, op.now_ms)).count())
        .await?;
    Ok(found.into_iter().map(|(_, n)| n as i64).sum())
}

/// TTL/PTTL: -2 if absent, -1 without deadline, else remaining time.
pub async fn ttl(tx: &mut Transaction, unit: TtlUnit) -> EngineResult<i64> {
    single_key_hop(tx, move |key, db, op| match db.get(key, op.now_ms) {
        None => -2,
        Some(entry) => match entry.ttl_ms(op.now_ms) {
            None => -1,
            Some(ms) => match unit {
                TtlUnit::Millis => ms as i64,
                TtlUnit::Seconds => ((ms + 500) / 1000) as i64,
            },
        },
    })
    .await
}

/// EXPIRE family: 1 if the key existed (and now carries the deadline), else 0.
pub async fn expire(tx: &mut Transaction, when: ExpireAt) -> EngineResult<i64> {
    single_key_hop(tx, move |key, db, op| {
        let deadline = when.resolve(op.now_ms);
        i64::from(db.set_expiry(key, Some(deadline), op.now_ms))
    })
    .await
}

/// PERSIST: 1 if a deadline was removed.
pub async fn persist(tx: &mut Transaction) -> EngineResult<i64> {
    single_key_hop(tx, |key, db, op| {
        let has_deadline = db
            .get(key, op.now_ms)
            .is_some_and(|entry| entry.expire_at.is_some());
        if has_deadline {
            db.set_expiry(key, None, op.now_ms);
        }
        i64::from(has_deadline)
    })
    .await
}

/// RENAME src dst.
///
/// On one shard this is a single atomic hop. Across shards the source hop detaches
/// the entry and the destination hop attaches it, both while the transaction holds
/// the two shards, so no other command observes the move half-done.
pub async fn rename(tx: &mut Transaction, src: Bytes, dst: Bytes) -> EngineResult<()> {
    let src_shard = tx.route(&src);
    let dst_shard = tx.route(&dst);

    if src_shard == dst_shard {
        let result = tx
            .execute_on(src_shard, move |_, db, op| db.rename(&src, dst, op.now_ms))
            .await?;
        tx.conclude();
        return result;
    }

    let detached = tx
        .execute_on(src_shard, move |_, db, op| db.remove(&src, op.now_ms))
        .await?;
    let Some(entry) = detached else {
        tx.conclude();
        return Err(EngineError::NoSuchKey);
    };

    tx.execute_on(dst_shard, move |_, db, _| {
        db.insert(dst, entry);
    })
    .await?;
    tx.conclude();

    trace!(src_shard, dst_shard, "Cross-shard rename done");
    Ok(())
}

/// TYPE: the type name, or `none`.
pub async fn key_type(tx: &mut Transaction) -> EngineResult<&'static str> {
    single_key_hop(tx, |key, db, op| {
        db.get(key, op.now_ms)
            .map(|entry| entry.value_type().as_str())
            .unwrap_or("none")
    })
    .await
}

/// KEYS: every live key matching `pattern`, shard by shard.
pub async fn keys(tx: &mut Transaction, pattern: GlobPattern) -> EngineResult<Vec<Bytes>> {
    let pattern = Arc::new(pattern);
    let per_shard = tx
        .execute_all(move |db, op| db.keys_matching(&pattern, op.now_ms))
        .await?;
    Ok(per_shard.into_iter().flatten().collect())
}

/// SCAN: walks shards in id order and slots in index order from the cursor position.
/// Returns the next cursor (0 when the traversal is complete) and the keys found.
pub async fn scan(tx: &mut Transaction, opts: ScanOptions) -> EngineResult<(u64, Vec<Bytes>)> {
    let shard_count = tx.shard_set().size();
    let slots = tx.shard_set().slots_per_shard();
    let filter = Arc::new(opts.filter);
    let mut position = opts.cursor;
    let mut found = Vec::new();

    loop {
        let filter = Arc::clone(&filter);
        let start = position.slot;
        let count = opts.count;
        let step = tx
            .execute_on(position.shard, move |_, db, op| {
                db.scan(start, count, op.now_ms, &filter)
            })
            .await?;
        found.extend(step.keys);

        match step.next_slot {
            Some(slot) => position.slot = slot,
            None => {
                position = ScanCursor {
                    shard: position.shard + 1,
                    slot: 0,
                };
                if position.shard as usize >= shard_count {
                    tx.conclude();
                    return Ok((0, found));
                }
            }
        }

        if found.len() >= opts.count {
            break;
        }
    }

    tx.conclude();
    Ok((position.encode(slots), found))
}

#[derive(Debug, Clone, PartialEq)]
enum Weight {
    Number(f64),
    Text(Bytes),
}

impl Weight {
    fn compare(&self, other: &Weight) -> Ordering {
        match (self, other) {
            (Weight::Number(a), Weight::Number(b)) => a.total_cmp(b),
            (Weight::Text(a), Weight::Text(b)) => a.cmp(b),
            // Weights of one sort are always the same kind.
            (Weight::Number(_), Weight::Text(_)) => Ordering::Less,
            (Weight::Text(_), Weight::Number(_)) => Ordering::Greater,
        }
    }
}

fn parse_number(raw: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    text.parse::<f64>().ok().filter(|n| !n.is_nan())
}

/// Replaces the first `*` of `pattern` with `element`.
fn substitute(pattern: &[u8], element: &[u8]) -> Option<Bytes> {
    let star = pattern.iter().position(|&b| b == b'*')?;
    let mut key = Vec::with_capacity(pattern.len() + element.len());
    key.extend_from_slice(&pattern[..star]);
    key.extend_from_slice(element);
    key.extend_from_slice(&pattern[star + 1..]);
    Some(Bytes::from(key))
}

fn apply_limit(items: Vec<Bytes>, limit: Option<(i64, i64)>) -> Vec<Bytes> {
    let Some((offset, count)) = limit else {
        return items;
    };
    let offset = offset.max(0) as usize;
    let count = if count < 0 { usize::MAX } else { count as usize };
    items.into_iter().skip(offset).take(count).collect()
}

/// Fetches the string value of every BY-pattern key. Missing keys and non-string
/// values give `None`.
async fn lookup_weights(
    tx: &mut Transaction,
    pattern: &[u8],
    elements: &[Bytes],
) -> EngineResult<Vec<Option<Bytes>>> {
    let weight_keys: Vec<Bytes> = elements
        .iter()
        .filter_map(|e| substitute(pattern, e))
        .collect();

    let mut lookup = tx.child(weight_keys);
    let per_shard = lookup
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
    tx.absorb(lookup);

    let mut weights = vec![None; elements.len()];
    for (index, value) in per_shard.into_iter().flat_map(|(_, found)| found) {
        weights[index] = value;
    }
    Ok(weights)
}

/// SORT key [BY pattern] [LIMIT offset count] [ASC|DESC] [ALPHA].
pub async fn sort(tx: &mut Transaction, key: Bytes, opts: SortOptions) -> EngineResult<Vec<Bytes>> {
    let shard = tx.route(&key);
    let elements = tx
        .execute_on(shard, move |_, db, op| match db.get(&key, op.now_ms) {
            None => Ok(Vec::new()),
            Some(entry) => entry.value.iterate(0, Direction::Forward),
        })
        .await??;

    // A BY pattern without `*` means "don't sort".
    if let Some(pattern) = &opts.by {
        if !pattern.contains(&b'*') {
            tx.conclude();
            return Ok(apply_limit(elements, opts.limit));
        }
    }

    let weights: Vec<Weight> = match &opts.by {
        Some(pattern) => {
            let pattern = pattern.clone();
            lookup_weights(tx, &pattern, &elements)
                .await?
                .into_iter()
                .map(|value| match (opts.alpha, value) {
                    (true, value) => Weight::Text(value.unwrap_or_default()),
                    // Missing or non-numeric weights count as 0.
                    (false, value) => {
                        Weight::Number(value.as_deref().and_then(parse_number).unwrap_or(0.0))
                    }
                })
                .collect()
        }
        None if opts.alpha => elements.iter().cloned().map(Weight::Text).collect(),
        None => elements
            .iter()
            .map(|e| {
                parse_number(e).map(Weight::Number).ok_or_else(|| {
                    EngineError::invalid("One or more scores can't be converted into double")
                })
            })
            .collect::<EngineResult<_>>()?,
    };
    tx.conclude();

    let mut paired: Vec<(Weight, Bytes)> = weights.into_iter().zip(elements).collect();
    // `sort_by` is stable, so equal weights keep source order in both directions.
    if opts.desc {
        paired.sort_by(|a, b| b.0.compare(&a.0));
    } else {
        paired.sort_by(|a, b| a.0.compare(&b.0));
    }

    let sorted = paired.into_iter().map(|(_, element)| element).collect();
    Ok(apply_limit(sorted, opts.limit))
}
