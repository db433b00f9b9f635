//! Stream datatype: append-only entry logs with monotonic ids.
//!
//! A stream entry id is a `(milliseconds, sequence)` pair, ordered
//! lexicographically. XADD enforces that ids strictly increase; the
//! stream remembers its `last_id` to validate explicit ids and to
//! expand the `*` and `ms-*` auto-id forms.

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// A stream entry id: strictly increasing `(ms, seq)` per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Parses an exact `ms-seq` id; a bare `ms` defaults seq to 0.
    pub fn parse(text: &str) -> Result<StreamId, StreamError> {
        match text.split_once('-') {
            Some((ms, seq)) => {
                let ms = ms.parse().map_err(|_| StreamError::MalformedId)?;
                let seq = seq.parse().map_err(|_| StreamError::MalformedId)?;
                Ok(StreamId { ms, seq })
            }
            None => {
                let ms = text.parse().map_err(|_| StreamError::MalformedId)?;
                Ok(StreamId { ms, seq: 0 })
            }
        }
    }

    /// Parses the start of an XRANGE interval: `-` is the minimum id,
    /// a bare `ms` means `ms-0`.
    pub fn parse_range_start(text: &str) -> Result<StreamId, StreamError> {
        if text == "-" {
            return Ok(StreamId::ZERO);
        }
        StreamId::parse(text)
    }

    /// Parses the end of an XRANGE interval: `+` is the maximum id,
    /// a bare `ms` means `ms-<max>`.
    pub fn parse_range_end(text: &str) -> Result<StreamId, StreamError> {
        if text == "+" {
            return Ok(StreamId::MAX);
        }
        match text.split_once('-') {
            Some(_) => StreamId::parse(text),
            None => {
                let ms = text.parse().map_err(|_| StreamError::MalformedId)?;
                Ok(StreamId { ms, seq: u64::MAX })
            }
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// An id argument to XADD before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpec {
    /// Literal `ms-seq` (or bare `ms`, seq 0).
    Exact(StreamId),
    /// `ms-*`: pick the smallest seq that keeps ids increasing.
    MsAuto(u64),
    /// `*`: derive both parts from the clock and `last_id`.
    Auto,
}

impl IdSpec {
    pub fn parse(text: &str) -> Result<IdSpec, StreamError> {
        if text == "*" {
            return Ok(IdSpec::Auto);
        }
        if let Some(ms) = text.strip_suffix("-*") {
            let ms = ms.parse().map_err(|_| StreamError::MalformedId)?;
            return Ok(IdSpec::MsAuto(ms));
        }
        Ok(IdSpec::Exact(StreamId::parse(text)?))
    }
}

/// Errors surfaced by stream operations, with the reply texts clients
/// expect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("ERR Invalid stream ID specified as stream command argument")]
    MalformedId,

    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    IdIsZero,

    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    IdNotIncreasing,
}

/// One appended entry: an id plus its field-value pairs in argument
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Vec<(Bytes, Bytes)>,
}

/// The entry log for one stream key.
///
/// Entries are stored in id order (appends only ever grow the tail),
/// so range queries are two binary searches over the vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stream {
    entries: Vec<StreamEntry>,
    last_id: StreamId,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The id of the most recent append, `0-0` for a fresh stream.
    pub fn last_id(&self) -> StreamId {
        self.last_id
    }

    /// Resolves an [`IdSpec`] against this stream's `last_id`.
    ///
    /// `ms-*` picks seq 0 for a new ms bucket (seq 1 when ms is 0,
    /// since ids must exceed 0-0), otherwise `last seq + 1`. `*` uses
    /// `max(now_ms, last_id.ms)`.
    pub fn resolve_id(&self, spec: IdSpec, now_ms: u64) -> StreamId {
        match spec {
            IdSpec::Exact(id) => id,
            IdSpec::MsAuto(ms) => StreamId {
                ms,
                seq: self.next_seq_for(ms),
            },
            IdSpec::Auto => {
                let ms = now_ms.max(self.last_id.ms);
                StreamId {
                    ms,
                    seq: self.next_seq_for(ms),
                }
            }
        }
    }

    fn next_seq_for(&self, ms: u64) -> u64 {
        if self.entries.is_empty() {
            return if ms == 0 { 1 } else { 0 };
        }
        if self.last_id.ms == ms {
            self.last_id.seq + 1
        } else {
            0
        }
    }

    /// Appends an entry after validating id monotonicity.
    pub fn append(
        &mut self,
        id: StreamId,
        fields: Vec<(Bytes, Bytes)>,
    ) -> Result<StreamId, StreamError> {
        if id == StreamId::ZERO {
            return Err(StreamError::IdIsZero);
        }
        if !self.entries.is_empty() && id <= self.last_id {
            return Err(StreamError::IdNotIncreasing);
        }
        self.entries.push(StreamEntry { id, fields });
        self.last_id = id;
        Ok(id)
    }

    /// Entries with `start <= id <= end`, in ascending id order.
    pub fn range(&self, start: StreamId, end: StreamId) -> &[StreamEntry] {
        let lo = self.entries.partition_point(|e| e.id < start);
        let hi = self.entries.partition_point(|e| e.id <= end);
        &self.entries[lo..hi]
    }

    /// Entries with `id > after`, for XREAD.
    pub fn entries_after(&self, after: StreamId) -> &[StreamEntry] {
        let lo = self.entries.partition_point(|e| e.id <= after);
        &self.entries[lo..]
    }

    pub fn entries(&self) -> &[StreamEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<(Bytes, Bytes)> {
        vec![(Bytes::from("f"), Bytes::from("v"))]
    }

    #[test]
    fn id_parsing() {
        assert_eq!(StreamId::parse("1-2").unwrap(), StreamId::new(1, 2));
        assert_eq!(StreamId::parse("5").unwrap(), StreamId::new(5, 0));
        assert!(StreamId::parse("a-b").is_err());
        assert!(StreamId::parse("").is_err());
    }

    #[test]
    fn range_bound_parsing() {
        assert_eq!(StreamId::parse_range_start("-").unwrap(), StreamId::ZERO);
        assert_eq!(StreamId::parse_range_end("+").unwrap(), StreamId::MAX);
        assert_eq!(
            StreamId::parse_range_end("7").unwrap(),
            StreamId::new(7, u64::MAX)
        );
    }

    #[test]
    fn id_spec_parsing() {
        assert_eq!(IdSpec::parse("*").unwrap(), IdSpec::Auto);
        assert_eq!(IdSpec::parse("3-*").unwrap(), IdSpec::MsAuto(3));
        assert_eq!(
            IdSpec::parse("3-4").unwrap(),
            IdSpec::Exact(StreamId::new(3, 4))
        );
    }

    #[test]
    fn append_enforces_monotonicity() {
        let mut stream = Stream::new();
        stream.append(StreamId::new(1, 1), fields()).unwrap();
        stream.append(StreamId::new(1, 2), fields()).unwrap();

        let err = stream.append(StreamId::new(1, 2), fields()).unwrap_err();
        assert_eq!(err, StreamError::IdNotIncreasing);
        let err = stream.append(StreamId::new(1, 1), fields()).unwrap_err();
        assert_eq!(err, StreamError::IdNotIncreasing);

        assert_eq!(stream.last_id(), StreamId::new(1, 2));
        assert_eq!(stream.len(), 2);
    }

    #[test]
    fn zero_id_rejected() {
        let mut stream = Stream::new();
        let err = stream.append(StreamId::ZERO, fields()).unwrap_err();
        assert_eq!(err, StreamError::IdIsZero);
    }

    #[test]
    fn auto_seq_resolution() {
        let mut stream = Stream::new();
        // Fresh stream: ms 0 starts at seq 1, other ms at seq 0.
        assert_eq!(
            stream.resolve_id(IdSpec::MsAuto(0), 0),
            StreamId::new(0, 1)
        );
        assert_eq!(
            stream.resolve_id(IdSpec::MsAuto(5), 0),
            StreamId::new(5, 0)
        );

        stream.append(StreamId::new(5, 3), fields()).unwrap();
        assert_eq!(
            stream.resolve_id(IdSpec::MsAuto(5), 0),
            StreamId::new(5, 4)
        );
        assert_eq!(
            stream.resolve_id(IdSpec::MsAuto(6), 0),
            StreamId::new(6, 0)
        );
    }

    #[test]
    fn star_uses_clock_or_last_id() {
        let mut stream = Stream::new();
        assert_eq!(stream.resolve_id(IdSpec::Auto, 100), StreamId::new(100, 0));

        stream.append(StreamId::new(200, 0), fields()).unwrap();
        // Clock behind last_id: stay on last_id.ms, bump seq.
        assert_eq!(stream.resolve_id(IdSpec::Auto, 100), StreamId::new(200, 1));
    }

    #[test]
    fn range_is_inclusive_and_ordered() {
        let mut stream = Stream::new();
        for (ms, seq) in [(1, 1), (1, 2), (2, 0), (3, 5)] {
            stream.append(StreamId::new(ms, seq), fields()).unwrap();
        }

        let all = stream.range(StreamId::ZERO, StreamId::MAX);
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let mid = stream.range(StreamId::new(1, 2), StreamId::new(2, 0));
        assert_eq!(mid.len(), 2);
        assert_eq!(mid[0].id, StreamId::new(1, 2));
    }

    #[test]
    fn entries_after_is_exclusive() {
        let mut stream = Stream::new();
        stream.append(StreamId::new(1, 1), fields()).unwrap();
        stream.append(StreamId::new(1, 2), fields()).unwrap();

        let rest = stream.entries_after(StreamId::new(1, 1));
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, StreamId::new(1, 2));
        assert!(stream.entries_after(StreamId::new(1, 2)).is_empty());
    }
}
