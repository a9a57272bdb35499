//! Vector clocks over graph events.
//!
//! A `View` maps each thread to the number of its events that are known to
//! precede (or be) the owner of the view. Entry `n` for thread `t` means
//! events `(t, 0) ..= (t, n - 1)` are included, so a zero entry includes
//! nothing from that thread.

use std::fmt;

use crate::event::Event;

/// A vector clock indexed by thread ID.
#[derive(Clone, Debug, Default)]
pub struct View {
    clocks: Vec<u32>,
}

impl View {
    pub fn new() -> Self {
        Self { clocks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    /// True when no event of any thread is included.
    pub fn is_empty(&self) -> bool {
        self.clocks.iter().all(|&c| c == 0)
    }

    pub fn get(&self, thread_id: usize) -> u32 {
        self.clocks.get(thread_id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, thread_id: usize, value: u32) {
        if thread_id >= self.clocks.len() {
            self.clocks.resize(thread_id + 1, 0);
        }
        self.clocks[thread_id] = value;
    }

    pub fn increment(&mut self, thread_id: usize) {
        if thread_id >= self.clocks.len() {
            self.clocks.resize(thread_id + 1, 0);
        }
        self.clocks[thread_id] += 1;
    }

    /// Point-wise maximum: self = max(self, other).
    pub fn update(&mut self, other: &View) {
        if other.clocks.len() > self.clocks.len() {
            self.clocks.resize(other.clocks.len(), 0);
        }
        for (a, b) in self.clocks.iter_mut().zip(other.clocks.iter()) {
            *a = (*a).max(*b);
        }
    }

    pub fn contains(&self, e: Event) -> bool {
        e.index < self.get(e.thread)
    }

    /// Returns true if self <= other (component-wise).
    pub fn partial_le(&self, other: &View) -> bool {
        let max_len = self.clocks.len().max(other.clocks.len());
        (0..max_len).all(|i| self.get(i) <= other.get(i))
    }

    /// Every event included in the view, thread by thread.
    pub fn events(&self) -> impl Iterator<Item = Event> + '_ {
        self.clocks
            .iter()
            .enumerate()
            .flat_map(|(thread, &n)| (0..n).map(move |index| Event::new(thread, index)))
    }
}

// Trailing zero entries carry no information.
impl PartialEq for View {
    fn eq(&self, other: &Self) -> bool {
        self.partial_le(other) && other.partial_le(self)
    }
}

impl Eq for View {}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, c) in self.clocks.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, "]")
    }
}
