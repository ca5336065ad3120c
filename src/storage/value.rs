//! Stored values and the generic value-type interface.
//!
//! The engine itself only needs three things from a value: its type tag, its length,
//! and a way to iterate its elements. Everything else about a value's representation is
//! private to the command family that owns that type.

use crate::error::{EngineError, EngineResult};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Type tag of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    String,
    List,
    Set,
    ZSet,
}

impl ValueType {
    /// Name reported by TYPE and accepted by SCAN ... TYPE.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::List => "list",
            ValueType::Set => "set",
            ValueType::ZSet => "zset",
        }
    }

    /// Parses a type name case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "string" => Some(ValueType::String),
            "list" => Some(ValueType::List),
            "set" => Some(ValueType::Set),
            "zset" => Some(ValueType::ZSet),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Iteration direction for [`Value::iterate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From `start` towards the tail
    Forward,
    /// From `start` (counted from the tail) towards the head
    Backward,
}

/// Sorted set kept as member → score; ordered views are materialized on demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedSet {
    scores: HashMap<Bytes, f64>,
}

impl SortedSet {
    /// Adds or updates a member. Returns true if the member is new.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        self.scores.insert(member, score).is_none()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Members ordered by (score, member).
    pub fn ordered(&self) -> Vec<Bytes> {
        let mut items: Vec<(&Bytes, f64)> = self.scores.iter().map(|(m, s)| (m, *s)).collect();
        items.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        items.into_iter().map(|(m, _)| m.clone()).collect()
    }
}

/// A value stored under a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(Bytes),
    List(VecDeque<Bytes>),
    Set(HashSet<Bytes>),
    ZSet(SortedSet),
}

impl Value {
    /// The type tag of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::List(_) => ValueType::List,
            Value::Set(_) => ValueType::Set,
            Value::ZSet(_) => ValueType::ZSet,
        }
    }

    /// Length of the value: bytes for strings, elements for collections.
    pub fn len(&self) -> usize {
        match self {
            Value::String(s) => s.len(),
            Value::List(l) => l.len(),
            Value::Set(s) => s.len(),
            Value::ZSet(z) => z.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the elements of a collection starting at `start`, walking in
    /// `direction`. Sets have no natural order and are iterated in storage order;
    /// sorted sets in score order.
    ///
    /// Strings are not iterable and yield `WrongType`.
    pub fn iterate(&self, start: usize, direction: Direction) -> EngineResult<Vec<Bytes>> {
        let elements: Vec<Bytes> = match self {
            Value::String(_) => return Err(EngineError::WrongType),
            Value::List(l) => match direction {
                Direction::Forward => return Ok(l.iter().skip(start).cloned().collect()),
                Direction::Backward => {
                    return Ok(l.iter().rev().skip(start).cloned().collect());
                }
            },
            Value::Set(s) => s.iter().cloned().collect(),
            Value::ZSet(z) => z.ordered(),
        };

        Ok(match direction {
            Direction::Forward => elements.into_iter().skip(start).collect(),
            Direction::Backward => elements.into_iter().rev().skip(start).collect(),
        })
    }

    /// Returns the string payload, or `WrongType` for collections.
    pub fn as_string(&self) -> EngineResult<&Bytes> {
        match self {
            Value::String(s) => Ok(s),
            _ => Err(EngineError::WrongType),
        }
    }

    /// Rough memory footprint used by DEBUG-style statistics.
    pub fn approximate_size(&self) -> usize {
        match self {
            Value::String(s) => s.len(),
            Value::List(l) => l.iter().map(|e| e.len() + 16).sum(),
            Value::Set(s) => s.iter().map(|e| e.len() + 32).sum(),
            Value::ZSet(z) => z.scores.keys().map(|e| e.len() + 40).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Value {
        Value::List(items.iter().map(|s| Bytes::from(s.to_string())).collect())
    }

    #[test]
    fn test_type_names_round_trip() {
        for ty in [ValueType::String, ValueType::List, ValueType::Set, ValueType::ZSet] {
            assert_eq!(ValueType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(ValueType::parse("STRING"), Some(ValueType::String));
        assert_eq!(ValueType::parse("hash"), None);
    }

    #[test]
    fn test_list_iterate_directions() {
        let value = list(&["a", "b", "c", "d"]);
        assert_eq!(value.len(), 4);
        assert_eq!(
            value.iterate(1, Direction::Forward).unwrap(),
            vec![Bytes::from("b"), Bytes::from("c"), Bytes::from("d")]
        );
        assert_eq!(
            value.iterate(1, Direction::Backward).unwrap(),
            vec![Bytes::from("c"), Bytes::from("b"), Bytes::from("a")]
        );
        assert!(value.iterate(10, Direction::Forward).unwrap().is_empty());
    }

    #[test]
    fn test_string_is_not_iterable() {
        let value = Value::String(Bytes::from("abc"));
        assert_eq!(value.len(), 3);
        assert!(matches!(
            value.iterate(0, Direction::Forward),
            Err(EngineError::WrongType)
        ));
    }

    #[test]
    fn test_zset_iterates_by_score() {
        let mut z = SortedSet::default();
        z.insert(Bytes::from("c"), 3.0);
        z.insert(Bytes::from("a"), 1.0);
        assert!(!z.insert(Bytes::from("a"), 5.0));
        let value = Value::ZSet(z);
        assert_eq!(
            value.iterate(0, Direction::Forward).unwrap(),
            vec![Bytes::from("c"), Bytes::from("a")]
        );
    }
}
