//! Fixed-capacity cyclic buffer holding the most recent log events.
//!
//! The buffer itself is not synchronised; the appender wraps it in a
//! single `Mutex` so pushes and snapshots are serialised.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::event::LogEvent;

/// Default number of events kept in history.
pub const DEFAULT_BUFFER_SIZE: usize = 256;

/// Ordered store of the last `capacity` events, oldest first.
///
/// Pushing into a full buffer evicts exactly one event, the oldest.
#[derive(Debug)]
pub struct CyclicBuffer {
    events: VecDeque<Arc<LogEvent>>,
    capacity: usize,
}

impl CyclicBuffer {
    /// Create an empty buffer.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ValidationError(
                "buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Insert an event, returning the evicted one when the buffer was full.
    pub fn push(&mut self, event: Arc<LogEvent>) -> Option<Arc<LogEvent>> {
        let evicted = if self.events.len() == self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    /// Ordered copy of the current contents. The buffer is left untouched.
    pub fn snapshot(&self) -> Vec<Arc<LogEvent>> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
