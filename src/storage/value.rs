//! Typed values held by the keyspace.
//!
//! A key holds exactly one [`Value`] variant. Commands that operate on
//! a specific datatype fail with a WRONGTYPE error when the key holds
//! a different variant; the engine enforces this at every typed
//! accessor.

use crate::storage::stream::Stream;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// The value datatypes a key can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Binary-safe string.
    Str(Bytes),
    /// Ordered sequence with O(1) push/pop at both ends.
    List(VecDeque<Bytes>),
    /// Unordered set of unique members.
    Set(HashSet<Bytes>),
    /// Field → value mapping, insertion order preserved.
    Hash(HashValue),
    /// Members ordered by (score, member).
    SortedSet(SortedSet),
    /// Append-only entry log with monotonic ids.
    Stream(Stream),
}

impl Value {
    /// The name reported by the TYPE command.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
            Value::SortedSet(_) => "zset",
            Value::Stream(_) => "stream",
        }
    }
}

/// A hash value that remembers field insertion order.
///
/// HGETALL / HKEYS / HVALS report fields in the order they were first
/// set; updating an existing field keeps its position. Lookups go
/// through an index map, the order lives in the pair vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HashValue {
    pairs: Vec<(Bytes, Bytes)>,
}

impl HashValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, field: &[u8]) -> Option<&Bytes> {
        self.pairs
            .iter()
            .find(|(f, _)| f.as_ref() == field)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, field: &[u8]) -> bool {
        self.pairs.iter().any(|(f, _)| f.as_ref() == field)
    }

    /// Sets a field. Returns `true` if the field was newly created.
    pub fn set(&mut self, field: Bytes, value: Bytes) -> bool {
        if let Some(slot) = self.pairs.iter_mut().find(|(f, _)| *f == field) {
            slot.1 = value;
            false
        } else {
            self.pairs.push((field, value));
            true
        }
    }

    /// Removes a field. Returns `true` if it existed.
    pub fn remove(&mut self, field: &[u8]) -> bool {
        match self.pairs.iter().position(|(f, _)| f.as_ref() == field) {
            Some(idx) => {
                self.pairs.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Bytes, Bytes)> {
        self.pairs.iter()
    }
}

/// Total order over f64 scores so they can key a BTreeSet.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedScore(f64);

impl Eq for OrderedScore {}

impl PartialOrd for OrderedScore {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedScore {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// A sorted set: unique members ordered by ascending score, ties
/// broken by lexicographic member order.
///
/// Backed by a score-ordered BTreeSet for range queries plus a
/// member → score map for O(1) score lookups. The two structures are
/// kept in lockstep by the mutating methods.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedSet {
    by_score: BTreeSet<(OrderedScore, Bytes)>,
    scores: HashMap<Bytes, f64>,
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// Inserts or updates a member. Returns `true` if the member was
    /// newly added.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        match self.scores.get(&member) {
            Some(&old) => {
                self.by_score.remove(&(OrderedScore(old), member.clone()));
                self.by_score.insert((OrderedScore(score), member.clone()));
                self.scores.insert(member, score);
                false
            }
            None => {
                self.by_score.insert((OrderedScore(score), member.clone()));
                self.scores.insert(member, score);
                true
            }
        }
    }

    /// Removes a member. Returns `true` if it existed.
    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.by_score
                    .remove(&(OrderedScore(score), Bytes::copy_from_slice(member)));
                true
            }
            None => false,
        }
    }

    /// 0-based position of a member in score order.
    pub fn rank(&self, member: &[u8]) -> Option<usize> {
        let score = self.score(member)?;
        let target = (OrderedScore(score), Bytes::copy_from_slice(member));
        self.by_score.iter().position(|item| *item == target)
    }

    /// Members in a 0-based index range, both ends inclusive, negative
    /// indices counting from the end.
    pub fn range_by_index(&self, start: i64, stop: i64) -> Vec<(Bytes, f64)> {
        let len = self.len() as i64;
        let mut start = if start < 0 { len + start } else { start };
        let mut stop = if stop < 0 { len + stop } else { stop };
        if start < 0 {
            start = 0;
        }
        if stop >= len {
            stop = len - 1;
        }
        if start > stop || start >= len {
            return Vec::new();
        }

        self.by_score
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }

    /// Members whose score falls in the given bounds, ascending.
    pub fn range_by_score(&self, min: ScoreBound, max: ScoreBound) -> Vec<(Bytes, f64)> {
        self.by_score
            .iter()
            .filter(|(score, _)| min.allows_lower(score.0) && max.allows_upper(score.0))
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, f64)> {
        self.by_score.iter().map(|(score, member)| (member, score.0))
    }
}

/// One end of a score interval, as parsed from ZRANGEBYSCORE / ZCOUNT
/// arguments (`-inf`, `+inf`, `(x` exclusive, plain inclusive).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    NegInf,
    PosInf,
    Inclusive(f64),
    Exclusive(f64),
}

impl ScoreBound {
    /// Parses a bound from command text.
    pub fn parse(text: &str) -> Option<ScoreBound> {
        match text {
            "-inf" | "-INF" => Some(ScoreBound::NegInf),
            "+inf" | "inf" | "+INF" | "INF" => Some(ScoreBound::PosInf),
            _ => {
                if let Some(rest) = text.strip_prefix('(') {
                    rest.parse::<f64>().ok().map(ScoreBound::Exclusive)
                } else {
                    text.parse::<f64>().ok().map(ScoreBound::Inclusive)
                }
            }
        }
    }

    fn allows_lower(&self, score: f64) -> bool {
        match *self {
            ScoreBound::NegInf => true,
            ScoreBound::PosInf => false,
            ScoreBound::Inclusive(min) => score >= min,
            ScoreBound::Exclusive(min) => score > min,
        }
    }

    fn allows_upper(&self, score: f64) -> bool {
        match *self {
            ScoreBound::NegInf => false,
            ScoreBound::PosInf => true,
            ScoreBound::Inclusive(max) => score <= max,
            ScoreBound::Exclusive(max) => score < max,
        }
    }
}

/// Formats a score for RESP replies: integral scores render without a
/// fractional part, matching the Redis convention.
pub fn format_score(score: f64) -> String {
    if score.is_finite() && score.fract() == 0.0 && score.abs() < 1e17 {
        format!("{}", score as i64)
    } else {
        format!("{}", score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_preserves_insertion_order() {
        let mut hash = HashValue::new();
        assert!(hash.set(Bytes::from("b"), Bytes::from("1")));
        assert!(hash.set(Bytes::from("a"), Bytes::from("2")));
        assert!(!hash.set(Bytes::from("b"), Bytes::from("3")));

        let fields: Vec<_> = hash.iter().map(|(f, _)| f.clone()).collect();
        assert_eq!(fields, vec![Bytes::from("b"), Bytes::from("a")]);
        assert_eq!(hash.get(b"b"), Some(&Bytes::from("3")));
    }

    #[test]
    fn hash_remove() {
        let mut hash = HashValue::new();
        hash.set(Bytes::from("f"), Bytes::from("v"));
        assert!(hash.remove(b"f"));
        assert!(!hash.remove(b"f"));
        assert!(hash.is_empty());
    }

    #[test]
    fn sorted_set_orders_by_score_then_member() {
        let mut zset = SortedSet::new();
        zset.insert(Bytes::from("b"), 2.0);
        zset.insert(Bytes::from("a"), 1.0);
        zset.insert(Bytes::from("c"), 1.0);

        let members: Vec<_> = zset.iter().map(|(m, _)| m.clone()).collect();
        assert_eq!(
            members,
            vec![Bytes::from("a"), Bytes::from("c"), Bytes::from("b")]
        );
    }

    #[test]
    fn sorted_set_update_moves_member() {
        let mut zset = SortedSet::new();
        assert!(zset.insert(Bytes::from("m"), 1.0));
        assert!(!zset.insert(Bytes::from("m"), 5.0));
        assert_eq!(zset.len(), 1);
        assert_eq!(zset.score(b"m"), Some(5.0));
        assert_eq!(zset.rank(b"m"), Some(0));
    }

    #[test]
    fn sorted_set_range_by_index_handles_negatives() {
        let mut zset = SortedSet::new();
        for (member, score) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            zset.insert(Bytes::from(member), score);
        }

        let all = zset.range_by_index(0, -1);
        assert_eq!(all.len(), 3);
        let tail = zset.range_by_index(-2, -1);
        assert_eq!(tail[0].0, Bytes::from("b"));
        assert!(zset.range_by_index(5, 9).is_empty());
    }

    #[test]
    fn sorted_set_range_by_score_bounds() {
        let mut zset = SortedSet::new();
        for (member, score) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            zset.insert(Bytes::from(member), score);
        }

        let mid = zset.range_by_score(ScoreBound::Inclusive(2.0), ScoreBound::Inclusive(3.0));
        assert_eq!(mid.len(), 2);
        let open = zset.range_by_score(ScoreBound::Exclusive(1.0), ScoreBound::PosInf);
        assert_eq!(open.len(), 2);
        let all = zset.range_by_score(ScoreBound::NegInf, ScoreBound::PosInf);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn score_bound_parsing() {
        assert_eq!(ScoreBound::parse("-inf"), Some(ScoreBound::NegInf));
        assert_eq!(ScoreBound::parse("+inf"), Some(ScoreBound::PosInf));
        assert_eq!(ScoreBound::parse("1.5"), Some(ScoreBound::Inclusive(1.5)));
        assert_eq!(ScoreBound::parse("(2"), Some(ScoreBound::Exclusive(2.0)));
        assert_eq!(ScoreBound::parse("abc"), None);
    }

    #[test]
    fn score_formatting() {
        assert_eq!(format_score(3.0), "3");
        assert_eq!(format_score(-2.0), "-2");
        assert_eq!(format_score(1.5), "1.5");
    }
}
