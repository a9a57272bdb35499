//! Exploration stack for the driver.
//!
//! Revisits are grouped by the stamp of the event they reconsider. The
//! highest stamp is always explored first, so popping a revisit never
//! invalidates the events that the remaining ones refer to. Backward
//! revisits are the exception: the load they move may already have been
//! moved by an earlier one, so they carry their own copy of it. Within a
//! stamp revisits come back in push order.

use std::collections::{BTreeMap, VecDeque};

use crate::event::Stamp;
use crate::revisit::Revisit;

#[derive(Debug, Default)]
pub struct Worklist {
    stacks: BTreeMap<Stamp, VecDeque<Revisit>>,
    len: usize,
}

impl Worklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records an alternative for the event with stamp `stamp`.
    pub fn push(&mut self, stamp: Stamp, revisit: Revisit) {
        self.stacks.entry(stamp).or_default().push_back(revisit);
        self.len += 1;
    }

    /// The next alternative to explore, with the stamp it was pushed under.
    pub fn pop(&mut self) -> Option<(Stamp, Revisit)> {
        let mut entry = self.stacks.last_entry()?;
        let stamp = *entry.key();
        let revisit = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        let revisit = revisit?;
        self.len -= 1;
        Some((stamp, revisit))
    }

    /// Drops every pending alternative.
    pub fn clear(&mut self) {
        self.stacks.clear();
        self.len = 0;
    }
}
