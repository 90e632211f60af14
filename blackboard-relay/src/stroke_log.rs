//! Append-only stroke log: the single source of truth for event order.
//!
//! ```text
//!   seq:   1      2      3       4      5
//!        [draw] [draw] [clear] [draw] [draw]
//!                       ▲
//!                       └── last_clear: replay window starts here
//! ```
//!
//! A clear never rewrites history; it only moves the start of the replay
//! window handed to late joiners.

use crate::protocol::{DrawingCommand, DrawingEvent, ParticipantId};

/// Counters describing the log contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub total_events: usize,
    pub draw_events: usize,
    pub clear_events: usize,
    /// Events a joiner would receive right now
    pub replay_len: usize,
}

/// Ordered, gap-free record of every accepted drawing event.
#[derive(Debug, Default)]
pub struct StrokeLog {
    events: Vec<DrawingEvent>,
    /// Index of the most recent clear in `events`
    last_clear: Option<usize>,
    clear_count: usize,
}

impl StrokeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next `append` will assign.
    pub fn next_sequence(&self) -> u64 {
        self.head_sequence() + 1
    }

    /// Sequence number of the newest event, 0 when empty.
    pub fn head_sequence(&self) -> u64 {
        self.events.len() as u64
    }

    /// Assign the next sequence number to `command` and store it.
    pub fn append(&mut self, originator: ParticipantId, command: DrawingCommand) -> &DrawingEvent {
        let sequence = self.next_sequence();
        if command.is_clear() {
            self.last_clear = Some(self.events.len());
            self.clear_count += 1;
        }
        self.events.push(DrawingEvent {
            sequence,
            originator,
            command,
        });
        &self.events[self.events.len() - 1]
    }

    /// Events from the most recent clear (inclusive) to the end, or the whole
    /// log when nothing was ever cleared.
    pub fn replay_since_clear(&self) -> &[DrawingEvent] {
        let start = self.last_clear.unwrap_or(0);
        &self.events[start..]
    }

    /// Complete history, including everything superseded by clears.
    pub fn history(&self) -> &[DrawingEvent] {
        &self.events
    }

    /// Look up an event by its sequence number.
    pub fn get(&self, sequence: u64) -> Option<&DrawingEvent> {
        let index = usize::try_from(sequence.checked_sub(1)?).ok()?;
        self.events.get(index)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            total_events: self.events.len(),
            draw_events: self.events.len() - self.clear_count,
            clear_events: self.clear_count,
            replay_len: self.replay_since_clear().len(),
        }
    }
}
