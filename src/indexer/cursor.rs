//! Positioned readers returned by seeks

use crate::error::IndexResult;
use crate::trace::{Rank, TraceReader};
use std::fmt;

/// Result of a seek
pub enum SeekOutcome<R: TraceReader> {
    /// A cursor whose next event is the seek target
    Positioned(TraceCursor<R>),
    /// The target lies beyond the last event
    EndOfTrace,
}

impl<R: TraceReader> SeekOutcome<R> {
    pub fn is_end_of_trace(&self) -> bool {
        matches!(self, SeekOutcome::EndOfTrace)
    }

    /// The cursor, or `None` at end of trace
    pub fn into_cursor(self) -> Option<TraceCursor<R>> {
        match self {
            SeekOutcome::Positioned(cursor) => Some(cursor),
            SeekOutcome::EndOfTrace => None,
        }
    }
}

impl<R: TraceReader> fmt::Debug for SeekOutcome<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeekOutcome::Positioned(cursor) => f.debug_tuple("Positioned").field(cursor).finish(),
            SeekOutcome::EndOfTrace => f.write_str("EndOfTrace"),
        }
    }
}

/// Sequential reader positioned at a seek target
///
/// The target event has already been read from the underlying reader to
/// test it; the cursor hands it out first and then continues reading.
pub struct TraceCursor<R: TraceReader> {
    reader: R,
    pending: Option<(Rank, R::Event)>,
    anchor_rank: Rank,
    skipped: u64,
}

impl<R: TraceReader> TraceCursor<R> {
    /// Advance `reader` until `reached` holds for an event
    ///
    /// Returns `None` when the reader runs out first.
    pub(crate) fn position(
        mut reader: R,
        mut reached: impl FnMut(Rank, &R::Event) -> bool,
    ) -> IndexResult<Option<Self>> {
        let anchor_rank = reader.rank();
        let mut skipped = 0u64;

        loop {
            let rank = reader.rank();
            let Some(event) = reader.next_event()? else {
                return Ok(None);
            };

            if reached(rank, &event) {
                return Ok(Some(Self {
                    reader,
                    pending: Some((rank, event)),
                    anchor_rank,
                    skipped,
                }));
            }
            skipped += 1;
        }
    }

    /// Rank of the next event
    pub fn rank(&self) -> Rank {
        match &self.pending {
            Some((rank, _)) => *rank,
            None => self.reader.rank(),
        }
    }

    /// The next event without consuming it, if it has been read already
    pub fn peek(&self) -> Option<&R::Event> {
        self.pending.as_ref().map(|(_, event)| event)
    }

    /// Read the next event together with its rank
    pub fn next_event(&mut self) -> IndexResult<Option<(Rank, R::Event)>> {
        if let Some(pending) = self.pending.take() {
            return Ok(Some(pending));
        }
        let rank = self.reader.rank();
        Ok(self.reader.next_event()?.map(|event| (rank, event)))
    }

    /// Rank of the checkpoint the seek started from
    pub fn anchor_rank(&self) -> Rank {
        self.anchor_rank
    }

    /// Events read past between the checkpoint and the target
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl<R: TraceReader> Iterator for TraceCursor<R> {
    type Item = IndexResult<(Rank, R::Event)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

impl<R: TraceReader> fmt::Debug for TraceCursor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceCursor")
            .field("rank", &self.rank())
            .field("anchor_rank", &self.anchor_rank)
            .field("skipped", &self.skipped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{MemoryTrace, TraceEvent, TraceSource};

    #[test]
    fn test_position_skips_to_target() {
        let trace = MemoryTrace::sequential(100, 10);
        let reader = trace.open_at(&40, 40).unwrap();

        let mut cursor = TraceCursor::position(reader, |rank, _| rank >= 55)
            .unwrap()
            .unwrap();

        assert_eq!(cursor.anchor_rank(), 40);
        assert_eq!(cursor.skipped(), 15);
        assert_eq!(cursor.rank(), 55);
        assert_eq!(cursor.peek().unwrap().timestamp(), 550);

        let (rank, event) = cursor.next_event().unwrap().unwrap();
        assert_eq!((rank, event.timestamp), (55, 550));
        assert_eq!(cursor.rank(), 56);
    }

    #[test]
    fn test_position_past_end() {
        let trace = MemoryTrace::sequential(10, 1);
        let reader = trace.open().unwrap();

        assert!(TraceCursor::position(reader, |_, e| e.timestamp > 100)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_iterates_to_end() {
        let trace = MemoryTrace::sequential(10, 1);
        let cursor = TraceCursor::position(trace.open().unwrap(), |rank, _| rank >= 7)
            .unwrap()
            .unwrap();

        let ranks: Vec<Rank> = cursor.map(|item| item.unwrap().0).collect();
        assert_eq!(ranks, vec![7, 8, 9]);
    }
}
