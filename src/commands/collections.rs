//! List, set and sorted-set commands.
//!
//! These exist so that non-string values can be created for TYPE, SCAN ... TYPE and
//! SORT; only the basic create/read operations are provided.

use crate::commands::single_key_hop;
use crate::engine::Transaction;
use crate::error::{EngineError, EngineResult};
use crate::storage::{Direction, Entry, SortedSet, Value, ValueType};
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};

/// Which end of a list LPUSH/RPUSH writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Head,
    Tail,
}

fn push_all(list: &mut VecDeque<Bytes>, values: Vec<Bytes>, end: ListEnd) {
    for value in values {
        match end {
            ListEnd::Head => list.push_front(value),
            ListEnd::Tail => list.push_back(value),
        }
    }
}

/// LPUSH/RPUSH: length of the list after the push.
pub async fn push(tx: &mut Transaction, values: Vec<Bytes>, end: ListEnd) -> EngineResult<i64> {
    single_key_hop(tx, move |key, db, op| -> EngineResult<i64> {
        if let Some(value) = db.value_mut_typed(key, ValueType::List, op.now_ms)? {
            let Value::List(list) = value else {
                return Err(EngineError::WrongType);
            };
            push_all(list, values, end);
            return Ok(list.len() as i64);
        }

        let mut list = VecDeque::with_capacity(values.len());
        push_all(&mut list, values, end);
        let len = list.len() as i64;
        db.insert(key.clone(), Entry::new(Value::List(list)));
        Ok(len)
    })
    .await?
}

/// Resolves LRANGE-style inclusive indexes (negative counts from the tail) against
/// `len`. Returns None for an empty range.
fn resolve_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    (start <= stop && start < len).then_some((start as usize, stop as usize))
}

/// LRANGE key start stop.
pub async fn lrange(tx: &mut Transaction, start: i64, stop: i64) -> EngineResult<Vec<Bytes>> {
    single_key_hop(tx, move |key, db, op| -> EngineResult<Vec<Bytes>> {
        let Some(entry) = db.get_typed(key, ValueType::List, op.now_ms)? else {
            return Ok(Vec::new());
        };
        let Some((from, to)) = resolve_range(start, stop, entry.value.len()) else {
            return Ok(Vec::new());
        };
        let mut elements = entry.value.iterate(from, Direction::Forward)?;
        elements.truncate(to - from + 1);
        Ok(elements)
    })
    .await?
}

/// SADD: number of members that were not already present.
pub async fn sadd(tx: &mut Transaction, members: Vec<Bytes>) -> EngineResult<i64> {
    single_key_hop(tx, move |key, db, op| -> EngineResult<i64> {
        if let Some(value) = db.value_mut_typed(key, ValueType::Set, op.now_ms)? {
            let Value::Set(set) = value else {
                return Err(EngineError::WrongType);
            };
            return Ok(members.into_iter().filter(|m| set.insert(m.clone())).count() as i64);
        }

        let set: HashSet<Bytes> = members.into_iter().collect();
        let added = set.len() as i64;
        db.insert(key.clone(), Entry::new(Value::Set(set)));
        Ok(added)
    })
    .await?
}

/// ZADD key score member [score member ...]: number of new members.
pub async fn zadd(tx: &mut Transaction, pairs: Vec<(f64, Bytes)>) -> EngineResult<i64> {
    single_key_hop(tx, move |key, db, op| -> EngineResult<i64> {
        if let Some(value) = db.value_mut_typed(key, ValueType::ZSet, op.now_ms)? {
            let Value::ZSet(zset) = value else {
                return Err(EngineError::WrongType);
            };
            let added = pairs
                .into_iter()
                .filter(|(score, member)| zset.insert(member.clone(), *score))
                .count();
            return Ok(added as i64);
        }

        let mut zset = SortedSet::default();
        let added = pairs
            .into_iter()
            .filter(|(score, member)| zset.insert(member.clone(), *score))
            .count();
        db.insert(key.clone(), Entry::new(Value::ZSet(zset)));
        Ok(added as i64)
    })
    .await?
}

/// LLEN, SCARD and ZCARD: element count of a value of type `ty`, 0 if missing.
pub async fn cardinality(tx: &mut Transaction, ty: ValueType) -> EngineResult<i64> {
    single_key_hop(tx, move |key, db, op| -> EngineResult<i64> {
        Ok(db
            .get_typed(key, ty, op.now_ms)?
            .map_or(0, |entry| entry.value.len() as i64))
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(0, -1, 5), Some((0, 4)));
        assert_eq!(resolve_range(1, 2, 5), Some((1, 2)));
        assert_eq!(resolve_range(-2, -1, 5), Some((3, 4)));
        assert_eq!(resolve_range(-100, 100, 5), Some((0, 4)));
        assert_eq!(resolve_range(3, 1, 5), None);
        assert_eq!(resolve_range(5, 10, 5), None);
        assert_eq!(resolve_range(0, -1, 0), None);
    }

    #[test]
    fn test_push_all_ends() {
        let mut list = VecDeque::new();
        push_all(&mut list, vec![Bytes::from("a"), Bytes::from("b")], ListEnd::Head);
        push_all(&mut list, vec![Bytes::from("c")], ListEnd::Tail);
        assert_eq!(
            list.into_iter().collect::<Vec<_>>(),
            vec![Bytes::from("b"), Bytes::from("a"), Bytes::from("c")]
        );
    }
}
