//! Data-race detection for newly added memory accesses.
//!
//! Only the new access is checked: every earlier access was checked against
//! its own past when it was added.

use crate::error::Result;
use crate::event::Event;
use crate::graph::ExecutionGraph;
use crate::label::{Label, LabelKind};

/// Race detector over one graph; `lock_discipline` filters out pairs
/// protected by the same lock.
#[derive(Clone, Copy, Debug)]
pub struct RaceDetector {
    lock_discipline: bool,
}

impl RaceDetector {
    pub fn new(lock_discipline: bool) -> Self {
        Self { lock_discipline }
    }

    pub fn are_in_data_race(&self, g: &ExecutionGraph, a: &Label, b: &Label) -> bool {
        let (pa, pb) = (a.pos(), b.pos());
        if pa == pb || g.is_hb_before(pa, pb) || g.is_hb_before(pb, pa) {
            return false;
        }
        if !a.is_not_atomic() && !b.is_not_atomic() {
            return false;
        }
        if a.addr() != b.addr() {
            return false;
        }
        if !self.lock_discipline {
            return true;
        }

        let (Some(la), Some(lb)) = (g.last_unmatched_lock(pa), g.last_unmatched_lock(pb)) else {
            return true;
        };
        lock_addr(g, la) != lock_addr(g, lb)
    }

    /// First access racing with the memory access at `e`, if any.
    pub fn find_data_race_for_mem_access(
        &self,
        g: &ExecutionGraph,
        e: Event,
    ) -> Result<Option<Event>> {
        let lab = g.event_label(e)?;
        if lab.is_read() {
            self.find_race_for_new_load(g, lab)
        } else if lab.is_write() {
            self.find_race_for_new_store(g, lab)
        } else {
            Ok(None)
        }
    }

    fn find_race_for_new_load(&self, g: &ExecutionGraph, lab: &Label) -> Result<Option<Event>> {
        let before = g.hb_po_before(lab.pos())?;
        let Some(addr) = lab.addr() else { return Ok(None) };
        for s in g.stores_to(addr) {
            if before.contains(s) {
                continue;
            }
            if self.are_in_data_race(g, lab, g.event_label(s)?) {
                return Ok(Some(s));
            }
        }
        Ok(None)
    }

    fn find_race_for_new_store(&self, g: &ExecutionGraph, lab: &Label) -> Result<Option<Event>> {
        let before = g.hb_po_before(lab.pos())?;
        for t in 0..g.num_threads() {
            for other in g.thread_labels(t).iter().skip(before.get(t) as usize) {
                if other.is_mem_access() && self.are_in_data_race(g, lab, other) {
                    return Ok(Some(other.pos()));
                }
            }
        }
        Ok(None)
    }
}

fn lock_addr(g: &ExecutionGraph, lock: Event) -> Option<u64> {
    match g.event_label(lock).ok()?.kind() {
        LabelKind::Lock { lock } => Some(*lock),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrefixViewPolicy;
    use crate::label::MemOrdering;
    use crate::views::update_label_views;

    fn add(g: &mut ExecutionGraph, thread: usize, lab: Label) -> Event {
        let e = g.add_label(thread, lab);
        update_label_views(g, e, None).unwrap();
        e
    }

    fn two_threads() -> ExecutionGraph {
        let mut g = ExecutionGraph::new(PrefixViewPolicy::Porf, false);
        for child in [1, 2] {
            let create = add(&mut g, 0, Label::thread_create(child));
            add(&mut g, child, Label::thread_start(create));
        }
        g
    }

    #[test]
    fn test_plain_writes_race() {
        let mut g = two_threads();
        let a = add(&mut g, 1, Label::write(0x1, 1, MemOrdering::NotAtomic));
        let b = add(&mut g, 2, Label::write(0x1, 2, MemOrdering::NotAtomic));
        let det = RaceDetector::new(false);
        assert_eq!(det.find_data_race_for_mem_access(&g, b).unwrap(), Some(a));
    }

    #[test]
    fn test_atomic_accesses_do_not_race() {
        let mut g = two_threads();
        add(&mut g, 1, Label::write(0x1, 1, MemOrdering::Relaxed));
        let b = add(&mut g, 2, Label::write(0x1, 2, MemOrdering::Relaxed));
        let det = RaceDetector::new(false);
        assert_eq!(det.find_data_race_for_mem_access(&g, b).unwrap(), None);
    }

    #[test]
    fn test_different_addresses_do_not_race() {
        let mut g = two_threads();
        add(&mut g, 1, Label::write(0x1, 1, MemOrdering::NotAtomic));
        let b = add(&mut g, 2, Label::write(0x2, 2, MemOrdering::NotAtomic));
        let det = RaceDetector::new(false);
        assert_eq!(det.find_data_race_for_mem_access(&g, b).unwrap(), None);
    }

    #[test]
    fn test_new_load_races_with_unordered_store() {
        let mut g = two_threads();
        let w = add(&mut g, 1, Label::write(0x1, 1, MemOrdering::NotAtomic));
        let r = g.add_label(2, Label::read(0x1, MemOrdering::Relaxed));
        g.change_rf(r, Some(Event::INIT)).unwrap();
        update_label_views(&mut g, r, None).unwrap();
        let det = RaceDetector::new(false);
        assert_eq!(det.find_data_race_for_mem_access(&g, r).unwrap(), Some(w));
    }

    #[test]
    fn test_hb_ordered_accesses_do_not_race() {
        let mut g = ExecutionGraph::new(PrefixViewPolicy::Porf, false);
        let w = add(&mut g, 0, Label::write(0x1, 1, MemOrdering::NotAtomic));
        let create = add(&mut g, 0, Label::thread_create(1));
        add(&mut g, 1, Label::thread_start(create));
        let b = add(&mut g, 1, Label::write(0x1, 2, MemOrdering::NotAtomic));
        assert!(g.is_hb_before(w, b));
        let det = RaceDetector::new(false);
        assert_eq!(det.find_data_race_for_mem_access(&g, b).unwrap(), None);
    }

    #[test]
    fn test_lock_discipline_filters_same_lock() {
        let mut g = two_threads();
        add(&mut g, 1, Label::lock(0x100));
        add(&mut g, 1, Label::write(0x1, 1, MemOrdering::NotAtomic));
        add(&mut g, 2, Label::lock(0x100));
        let b = add(&mut g, 2, Label::write(0x1, 2, MemOrdering::NotAtomic));

        assert!(RaceDetector::new(false).find_data_race_for_mem_access(&g, b).unwrap().is_some());
        assert_eq!(RaceDetector::new(true).find_data_race_for_mem_access(&g, b).unwrap(), None);
    }

    #[test]
    fn test_lock_discipline_different_locks_race() {
        let mut g = two_threads();
        add(&mut g, 1, Label::lock(0x100));
        let a = add(&mut g, 1, Label::write(0x1, 1, MemOrdering::NotAtomic));
        add(&mut g, 2, Label::lock(0x200));
        let b = add(&mut g, 2, Label::write(0x1, 2, MemOrdering::NotAtomic));
        assert_eq!(RaceDetector::new(true).find_data_race_for_mem_access(&g, b).unwrap(), Some(a));
    }

    #[test]
    fn test_released_lock_does_not_protect() {
        let mut g = two_threads();
        add(&mut g, 1, Label::lock(0x100));
        add(&mut g, 1, Label::unlock(0x100));
        let a = add(&mut g, 1, Label::write(0x1, 1, MemOrdering::NotAtomic));
        add(&mut g, 2, Label::lock(0x100));
        let b = add(&mut g, 2, Label::write(0x1, 2, MemOrdering::NotAtomic));
        assert_eq!(RaceDetector::new(true).find_data_race_for_mem_access(&g, b).unwrap(), Some(a));
    }
}
