use chrono::{DateTime, Utc};

use crate::event::RideEvent;

/// A closed, immutable group of events processed and written as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct MicroBatch {
    pub id: u64,
    pub events: Vec<RideEvent>,
}

impl MicroBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn max_event_time(&self) -> Option<DateTime<Utc>> {
        self.events.iter().map(|e| e.event_time).max()
    }
}

/// Buffers parsed events until the trigger fires (or the optional size bound is hit),
/// then hands out the buffer as a [`MicroBatch`] with the next sequential index.
///
/// Empty triggers produce no batch and do not consume an index.
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    buffer: Vec<RideEvent>,
    next_id: u64,
    max_batch_size: Option<usize>,
}

impl BatchAccumulator {
    pub fn new(max_batch_size: Option<usize>) -> Self {
        Self {
            buffer: Vec::new(),
            next_id: 0,
            max_batch_size: max_batch_size.filter(|n| *n > 0),
        }
    }

    /// Buffer an event. Returns a closed batch when this push reached `max_batch_size`.
    pub fn push(&mut self, event: RideEvent) -> Option<MicroBatch> {
        self.buffer.push(event);
        match self.max_batch_size {
            Some(max) if self.buffer.len() >= max => self.close(),
            _ => None,
        }
    }

    /// Close the current buffer, if it holds anything.
    pub fn close(&mut self) -> Option<MicroBatch> {
        if self.buffer.is_empty() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        Some(MicroBatch {
            id,
            events: std::mem::take(&mut self.buffer),
        })
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Index the next closed batch will carry.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }
}
