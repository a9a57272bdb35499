//! Event identifiers.

use std::fmt;

/// Global insertion sequence number of a label.
pub type Stamp = u32;

/// Identifies a memory location.
pub type Addr = u64;

/// Identifies a message channel.
pub type ChannelId = u32;

/// One program step: the `index`-th event of thread `thread`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Event {
    pub thread: usize,
    pub index: u32,
}

impl Event {
    /// The initializer event: first event of the main thread, which also
    /// acts as the initial write to every location and the empty message
    /// on every channel.
    pub const INIT: Event = Event { thread: 0, index: 0 };

    pub fn new(thread: usize, index: u32) -> Self {
        Self { thread, index }
    }

    pub fn is_initializer(self) -> bool {
        self == Self::INIT
    }

    /// The po-predecessor. Saturates at index 0.
    pub fn prev(self) -> Self {
        Self { thread: self.thread, index: self.index.saturating_sub(1) }
    }

    pub fn next(self) -> Self {
        Self { thread: self.thread, index: self.index + 1 }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_initializer() {
            write!(f, "INIT")
        } else {
            write!(f, "({}, {})", self.thread, self.index)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initializer() {
        assert!(Event::INIT.is_initializer());
        assert!(!Event::new(0, 1).is_initializer());
        assert!(!Event::new(1, 0).is_initializer());
    }

    #[test]
    fn test_order_is_thread_then_index() {
        let mut events = vec![Event::new(1, 0), Event::new(0, 2), Event::new(0, 1)];
        events.sort();
        assert_eq!(events, vec![Event::new(0, 1), Event::new(0, 2), Event::new(1, 0)]);
    }

    #[test]
    fn test_prev_next() {
        let e = Event::new(2, 3);
        assert_eq!(e.prev(), Event::new(2, 2));
        assert_eq!(e.next(), Event::new(2, 4));
        assert_eq!(Event::new(2, 0).prev(), Event::new(2, 0));
    }

    #[test]
    fn test_display() {
        assert_eq!(Event::INIT.to_string(), "INIT");
        assert_eq!(Event::new(1, 4).to_string(), "(1, 4)");
    }
}
