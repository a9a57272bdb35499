//! Per-location total orders: coherence order over writes to an address,
//! and send order over sends on a channel.
//!
//! Both are the same algorithm over different label kinds, selected by the
//! `OrderedAccess` parameter. Each location keeps an explicit list of its
//! stores (the initializer is implicitly first and never listed).

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

use crate::calc::{CalculationResult, Calculator, Relation, RelationKind};
use crate::error::{bug, Result};
use crate::event::{Addr, ChannelId, Event};
use crate::graph::ExecutionGraph;
use crate::label::Label;
use crate::vv::View;

/// Selects which labels act as stores and loads of an ordered location.
pub trait OrderedAccess: Clone + fmt::Debug + Default + 'static {
    type Loc: Copy + Ord + Hash + fmt::Debug + fmt::Display;

    const KIND: RelationKind;

    fn store_loc(lab: &Label) -> Option<Self::Loc>;

    fn load_loc(lab: &Label) -> Option<Self::Loc>;

    /// The graph's calculator for this kind of location.
    fn order(g: &ExecutionGraph) -> &OrderCalculator<Self>;

    fn order_mut(g: &mut ExecutionGraph) -> &mut OrderCalculator<Self>;
}

/// Writes and reads, keyed by address.
#[derive(Clone, Debug, Default)]
pub struct MemoryAccess;

impl OrderedAccess for MemoryAccess {
    type Loc = Addr;

    const KIND: RelationKind = RelationKind::Coherence;

    fn store_loc(lab: &Label) -> Option<Addr> {
        if lab.is_write() { lab.addr() } else { None }
    }

    fn load_loc(lab: &Label) -> Option<Addr> {
        if lab.is_read() { lab.addr() } else { None }
    }

    fn order(g: &ExecutionGraph) -> &OrderCalculator<Self> {
        g.coherence()
    }

    fn order_mut(g: &mut ExecutionGraph) -> &mut OrderCalculator<Self> {
        g.coherence_mut()
    }
}

/// Sends and receives, keyed by channel.
#[derive(Clone, Debug, Default)]
pub struct ChannelAccess;

impl OrderedAccess for ChannelAccess {
    type Loc = ChannelId;

    const KIND: RelationKind = RelationKind::SendOrder;

    fn store_loc(lab: &Label) -> Option<ChannelId> {
        if lab.is_send() { lab.channel() } else { None }
    }

    fn load_loc(lab: &Label) -> Option<ChannelId> {
        if lab.is_receive() { lab.channel() } else { None }
    }

    fn order(g: &ExecutionGraph) -> &OrderCalculator<Self> {
        g.send_order()
    }

    fn order_mut(g: &mut ExecutionGraph) -> &mut OrderCalculator<Self> {
        g.send_order_mut()
    }
}

#[derive(Clone, Debug, Default)]
pub struct OrderCalculator<A: OrderedAccess> {
    orders: BTreeMap<A::Loc, Vec<Event>>,
    relations: BTreeMap<A::Loc, Relation>,
    out_of_order: bool,
    _access: PhantomData<A>,
}

pub type CoherenceCalculator = OrderCalculator<MemoryAccess>;
pub type SendOrderCalculator = OrderCalculator<ChannelAccess>;

impl<A: OrderedAccess> OrderCalculator<A> {
    pub fn new(out_of_order: bool) -> Self {
        Self {
            orders: BTreeMap::new(),
            relations: BTreeMap::new(),
            out_of_order,
            _access: PhantomData,
        }
    }

    pub fn locations(&self) -> impl Iterator<Item = A::Loc> + '_ {
        self.orders.keys().copied()
    }

    /// The stores of `loc` in order; empty for untracked locations.
    pub fn order(&self, loc: A::Loc) -> &[Event] {
        self.orders.get(&loc).map_or(&[], |v| v.as_slice())
    }

    pub fn relation(&self, loc: A::Loc) -> Option<&Relation> {
        self.relations.get(&loc)
    }

    /// Position of `e` in the order of `loc`; `None` for the initializer.
    pub fn offset_of(&self, loc: A::Loc, e: Event) -> Result<Option<usize>> {
        if e.is_initializer() {
            return Ok(None);
        }
        self.order(loc)
            .iter()
            .position(|&s| s == e)
            .map(Some)
            .ok_or_else(|| bug!("{e} missing from the order of location {loc}"))
    }

    pub fn add_at_offset(&mut self, loc: A::Loc, e: Event, offset: usize) -> Result<()> {
        let list = self.orders.entry(loc).or_default();
        if offset > list.len() {
            return Err(bug!("offset {offset} out of range for location {loc}"));
        }
        list.insert(offset, e);
        Ok(())
    }

    pub fn add_max(&mut self, loc: A::Loc, e: Event) {
        self.orders.entry(loc).or_default().push(e);
    }

    pub fn add_after(&mut self, loc: A::Loc, e: Event, pred: Event) -> Result<()> {
        let offset = self.offset_of(loc, pred)?.map_or(0, |o| o + 1);
        self.add_at_offset(loc, e, offset)
    }

    pub fn change_offset(&mut self, loc: A::Loc, e: Event, new_offset: usize) -> Result<()> {
        let Some(old) = self.offset_of(loc, e)? else {
            return Err(bug!("cannot move the initializer"));
        };
        let list = self.orders.entry(loc).or_default();
        list.remove(old);
        if new_offset > list.len() {
            return Err(bug!("offset {new_offset} out of range for location {loc}"));
        }
        list.insert(new_offset, e);
        Ok(())
    }

    pub fn is_maximal(&self, loc: A::Loc, e: Event) -> bool {
        let list = self.order(loc);
        if e.is_initializer() {
            list.is_empty()
        } else {
            list.last() == Some(&e)
        }
    }

    pub fn contains(&self, loc: A::Loc, e: Event) -> bool {
        e.is_initializer() || self.order(loc).contains(&e)
    }

    /// Stores ordered after `e`.
    pub fn succs(&self, loc: A::Loc, e: Event) -> Result<&[Event]> {
        let list = self.order(loc);
        let start = self.offset_of(loc, e)?.map_or(0, |o| o + 1);
        Ok(&list[start..])
    }

    /// Stores ordered before `e`.
    pub fn preds(&self, loc: A::Loc, e: Event) -> Result<&[Event]> {
        let list = self.order(loc);
        let end = self.offset_of(loc, e)?.unwrap_or(0);
        Ok(&list[..end])
    }

    /// Index right after the latest store that is `(rf?;hb)`-before `e`.
    pub fn split_before(&self, g: &ExecutionGraph, loc: A::Loc, e: Event) -> usize {
        let list = self.order(loc);
        list.iter()
            .rposition(|&s| s != e && g.is_write_rf_before(s, e.prev()))
            .map_or(0, |i| i + 1)
    }

    /// Index of the earliest store that `e` is `hb;rf?`-before.
    pub fn split_after_hb(&self, g: &ExecutionGraph, loc: A::Loc, e: Event) -> usize {
        let list = self.order(loc);
        list.iter()
            .position(|&s| s != e && g.is_hb_opt_rf_before(e, s))
            .unwrap_or(list.len())
    }

    /// Range of admissible offsets for a new store `e`, inclusive on both
    /// ends.
    pub fn possible_placings(&self, g: &ExecutionGraph, loc: A::Loc, e: Event) -> (usize, usize) {
        let begin = self.split_before(g, loc, e);
        let end = if self.out_of_order {
            self.split_after_hb(g, loc, e).max(begin)
        } else {
            self.order(loc).len()
        };
        (begin, end)
    }

    /// Stores a new load `e` may read from: the latest `(rf?;hb)`-before
    /// store (or the initializer) and every store after it.
    pub fn coherent_stores(&self, g: &ExecutionGraph, loc: A::Loc, e: Event) -> Vec<Event> {
        let list = self.order(loc);
        let begin = self.split_before(g, loc, e);
        let end = if self.out_of_order {
            self.split_after_hb(g, loc, e).max(begin)
        } else {
            list.len()
        };

        let mut stores = Vec::with_capacity(end - begin + 1);
        if begin == 0 {
            stores.push(Event::INIT);
        } else {
            stores.push(list[begin - 1]);
        }
        stores.extend_from_slice(&list[begin..end]);
        stores
    }

    /// `(order;rf?)`-successors of a store.
    pub fn order_rf_after(&self, g: &ExecutionGraph, store: Event) -> Result<Vec<Event>> {
        let loc = self.loc_of_store(g, store)?;
        self.with_readers(g, self.succs(loc, store)?)
    }

    /// `(order⁻¹;rf?)`-predecessors of a store.
    pub fn order_inv_rf_after(&self, g: &ExecutionGraph, store: Event) -> Result<Vec<Event>> {
        let loc = self.loc_of_store(g, store)?;
        self.with_readers(g, self.preds(loc, store)?)
    }

    fn with_readers(&self, g: &ExecutionGraph, stores: &[Event]) -> Result<Vec<Event>> {
        let mut out = Vec::new();
        for &s in stores {
            out.push(s);
            out.extend_from_slice(g.event_label(s)?.readers());
        }
        Ok(out)
    }

    /// Loads that `store` may still revisit without breaking the order.
    pub fn coherent_revisits(&self, g: &ExecutionGraph, store: Event) -> Result<Vec<Event>> {
        let loc = self.loc_of_store(g, store)?;
        let mut loads = g.revisitable(store)?;

        if !self.out_of_order && self.is_maximal(loc, store) {
            return Ok(loads);
        }

        // A load that already sees a later store (or one of its readers)
        // cannot go back to this one.
        let after = self.order_rf_after(g, store)?;
        let mut keep = Vec::with_capacity(loads.len());
        for r in loads.drain(..) {
            let before = g.hb_po_before(r)?;
            if !after.iter().any(|&e| before.contains(e)) {
                keep.push(r);
            }
        }

        if self.out_of_order {
            let preds = self.order_inv_rf_after(g, store)?;
            keep.retain(|&r| !preds.iter().any(|&p| g.is_hb_before(r, p)));
        }
        Ok(keep)
    }

    fn loc_of_store(&self, g: &ExecutionGraph, store: Event) -> Result<A::Loc> {
        A::store_loc(g.event_label(store)?).ok_or_else(|| bug!("{store} is not an ordered store"))
    }

    /// Coherence edges forced by hb and rf on one location, plus RMW
    /// atomicity. Returns false on a violation that cannot be expressed as
    /// an edge between listed stores.
    fn add_derived_edges(&self, g: &ExecutionGraph, loc: A::Loc, rel: &mut Relation) -> bool {
        let list = self.order(loc);
        let loads: Vec<(Event, Event)> = g
            .labels()
            .filter(|lab| A::load_loc(lab) == Some(loc))
            .filter_map(|lab| lab.rf().map(|rf| (lab.pos(), rf)))
            .collect();

        for &a in list {
            for &b in list {
                if a != b && g.is_hb_before(a, b) {
                    rel.add_edge(a, b);
                }
            }
        }

        for &(r, s) in &loads {
            if !s.is_initializer() && g.is_hb_before(r, s) {
                return false;
            }
            for &w in list {
                if w == s {
                    continue;
                }
                if g.is_hb_before(w, r) {
                    if s.is_initializer() {
                        return false;
                    }
                    rel.add_edge(w, s);
                }
                if g.is_hb_before(r, w) && !s.is_initializer() {
                    rel.add_edge(s, w);
                }
            }
        }

        for &(r1, s1) in &loads {
            for &(r2, s2) in &loads {
                if r1 == r2 || s1 == s2 || !g.is_hb_before(r1, r2) || s1.is_initializer() {
                    continue;
                }
                if s2.is_initializer() {
                    return false;
                }
                rel.add_edge(s1, s2);
            }
        }

        for (offset, &w) in list.iter().enumerate() {
            let Ok(lab) = g.event_label(w) else { return false };
            if !lab.is_rmw_write() {
                continue;
            }
            let Some(src) = g.event_label(w.prev()).ok().and_then(Label::rf) else {
                return false;
            };
            let expected = if src.is_initializer() {
                0
            } else {
                match list.iter().position(|&s| s == src) {
                    Some(i) => i + 1,
                    None => return false,
                }
            };
            if offset != expected {
                return false;
            }
        }
        true
    }
}

impl OrderCalculator<ChannelAccess> {
    /// Sends a new receive may take its message from.
    pub fn coherent_sends(&self, g: &ExecutionGraph, ch: ChannelId, receive: Event) -> Vec<Event> {
        self.coherent_stores(g, ch, receive)
    }
}

impl<A: OrderedAccess> Calculator for OrderCalculator<A> {
    fn kind(&self) -> RelationKind {
        A::KIND
    }

    fn init_calc(&mut self, _g: &ExecutionGraph) {
        self.relations.clear();
        for (&loc, list) in &self.orders {
            let mut rel = Relation::new(list.clone());
            for pair in list.windows(2) {
                rel.add_edge(pair[0], pair[1]);
            }
            rel.trans_closure();
            self.relations.insert(loc, rel);
        }
    }

    fn do_calc(&mut self, g: &ExecutionGraph) -> CalculationResult {
        let locs: Vec<A::Loc> = self.orders.keys().copied().collect();
        for loc in locs {
            let mut rel = match self.relations.remove(&loc) {
                Some(rel) => rel,
                None => Relation::new(self.order(loc).to_vec()),
            };
            let ok = self.add_derived_edges(g, loc, &mut rel);
            rel.trans_closure();
            let irreflexive = rel.is_irreflexive();
            self.relations.insert(loc, rel);
            if !ok || !irreflexive {
                tracing::trace!(?loc, kind = ?A::KIND, "order violated");
                return CalculationResult::inconsistent();
            }
        }
        CalculationResult::consistent()
    }

    fn remove_after(&mut self, _g: &ExecutionGraph, preds: &View) {
        for list in self.orders.values_mut() {
            list.retain(|&e| preds.contains(e));
        }
        self.orders.retain(|_, list| !list.is_empty());
        self.relations.clear();
    }

    fn clone_calc(&self) -> Box<dyn Calculator> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrefixViewPolicy;
    use crate::label::{MemOrdering, RmwKind};
    use crate::views::update_label_views;
    use proptest::prelude::*;

    const X: Addr = 0x20;

    fn graph(out_of_order: bool) -> ExecutionGraph {
        ExecutionGraph::new(PrefixViewPolicy::Porf, out_of_order)
    }

    fn add(g: &mut ExecutionGraph, thread: usize, lab: Label) -> Event {
        let e = g.add_label(thread, lab);
        update_label_views(g, e, None).unwrap();
        e
    }

    fn spawn(g: &mut ExecutionGraph, child: usize) {
        let create = add(g, 0, Label::thread_create(child));
        add(g, child, Label::thread_start(create));
    }

    fn store(g: &mut ExecutionGraph, thread: usize) -> Event {
        let w = add(g, thread, Label::write(X, 1, MemOrdering::Relaxed));
        g.coherence_mut().add_max(X, w);
        w
    }

    fn load(g: &mut ExecutionGraph, thread: usize, ord: MemOrdering, src: Event) -> Event {
        let r = g.add_label(thread, Label::read(X, ord));
        g.change_rf(r, Some(src)).unwrap();
        update_label_views(g, r, None).unwrap();
        r
    }

    #[test]
    fn test_placings_after_po_predecessor() {
        let mut g = graph(false);
        spawn(&mut g, 1);
        spawn(&mut g, 2);
        let a = store(&mut g, 1);
        let b = store(&mut g, 2);

        let mine = add(&mut g, 1, Label::write(X, 2, MemOrdering::Relaxed));
        assert_eq!(g.coherence().possible_placings(&g, X, mine), (1, 2));

        let other = add(&mut g, 2, Label::write(X, 3, MemOrdering::Relaxed));
        let co = g.coherence();
        assert_eq!(co.possible_placings(&g, X, other), (2, 2));
        assert_eq!(co.order(X), &[a, b]);
    }

    #[test]
    fn test_placings_bounded_by_hb_successors_out_of_order() {
        let mut g = graph(true);
        spawn(&mut g, 1);
        let early = add(&mut g, 1, Label::write(X, 1, MemOrdering::Relaxed));
        let late = store(&mut g, 1);
        assert_eq!(g.coherence().possible_placings(&g, X, early), (0, 0));

        let mut g2 = graph(false);
        spawn(&mut g2, 1);
        let early = add(&mut g2, 1, Label::write(X, 1, MemOrdering::Relaxed));
        store(&mut g2, 1);
        assert_eq!(g2.coherence().possible_placings(&g2, X, early), (0, 1));
        assert!(g.coherence().contains(X, late));
    }

    #[test]
    fn test_coherent_stores() {
        let mut g = graph(false);
        spawn(&mut g, 1);
        spawn(&mut g, 2);
        let a = store(&mut g, 1);
        let b = store(&mut g, 2);

        let r1 = g.add_label(1, Label::read(X, MemOrdering::Relaxed));
        update_label_views(&mut g, r1, None).unwrap();
        assert_eq!(g.coherence().coherent_stores(&g, X, r1), vec![a, b]);

        spawn(&mut g, 3);
        let r3 = g.add_label(3, Label::read(X, MemOrdering::Relaxed));
        update_label_views(&mut g, r3, None).unwrap();
        assert_eq!(g.coherence().coherent_stores(&g, X, r3), vec![Event::INIT, a, b]);
    }

    #[test]
    fn test_coherent_stores_skip_overwritten_by_observed_reader() {
        let mut g = graph(false);
        spawn(&mut g, 1);
        spawn(&mut g, 2);
        let a = store(&mut g, 1);
        let b = store(&mut g, 1);
        // r0 observed a, so only a and its successors remain.
        load(&mut g, 2, MemOrdering::Acquire, a);
        let r = g.add_label(2, Label::read(X, MemOrdering::Relaxed));
        update_label_views(&mut g, r, None).unwrap();
        assert_eq!(g.coherence().coherent_stores(&g, X, r), vec![a, b]);
    }

    #[test]
    fn test_coherent_sends() {
        let mut g = graph(false);
        spawn(&mut g, 1);
        spawn(&mut g, 2);
        let s1 = add(&mut g, 1, Label::send(4, 1));
        g.send_order_mut().add_max(4, s1);
        let s2 = add(&mut g, 2, Label::send(4, 2));
        g.send_order_mut().add_max(4, s2);

        let after = g.add_label(1, Label::receive(4));
        update_label_views(&mut g, after, None).unwrap();
        assert_eq!(g.send_order().coherent_sends(&g, 4, after), vec![s1, s2]);

        spawn(&mut g, 3);
        let fresh = g.add_label(3, Label::receive(4));
        update_label_views(&mut g, fresh, None).unwrap();
        assert_eq!(g.send_order().coherent_sends(&g, 4, fresh), vec![Event::INIT, s1, s2]);
        assert!(g.send_order().coherent_sends(&g, 5, fresh).contains(&Event::INIT));
    }

    #[test]
    fn test_order_edits() {
        let mut co = CoherenceCalculator::new(false);
        let a = Event::new(1, 1);
        let b = Event::new(2, 1);
        let c = Event::new(3, 1);
        co.add_max(X, a);
        co.add_after(X, b, Event::INIT).unwrap();
        co.add_after(X, c, b).unwrap();
        assert_eq!(co.order(X), &[b, c, a]);
        assert_eq!(co.offset_of(X, Event::INIT).unwrap(), None);
        assert_eq!(co.succs(X, c).unwrap(), &[a]);
        assert_eq!(co.preds(X, c).unwrap(), &[b]);
        assert_eq!(co.succs(X, Event::INIT).unwrap(), &[b, c, a]);

        co.change_offset(X, a, 0).unwrap();
        assert_eq!(co.order(X), &[a, b, c]);
        assert!(co.is_maximal(X, c));
        assert!(!co.is_maximal(X, Event::INIT));
        assert!(co.change_offset(X, Event::INIT, 0).is_err());
        assert!(co.add_at_offset(X, Event::new(4, 1), 9).is_err());
        assert!(co.offset_of(X, Event::new(4, 1)).unwrap_err().is_internal());
    }

    #[test]
    fn test_coherent_revisits_filter_loads_seeing_later_stores() {
        let mut g = graph(false);
        spawn(&mut g, 1);
        spawn(&mut g, 2);
        let w1 = store(&mut g, 2);
        let w2 = store(&mut g, 2);
        let r0 = load(&mut g, 1, MemOrdering::Acquire, w2);
        let r = load(&mut g, 1, MemOrdering::Relaxed, Event::INIT);

        assert_eq!(g.coherence().coherent_revisits(&g, w1).unwrap(), vec![r0]);
        assert_eq!(g.coherence().coherent_revisits(&g, w2).unwrap(), vec![r0, r]);
    }

    #[test]
    fn test_hb_contradicting_order_is_inconsistent() {
        let mut g = graph(false);
        spawn(&mut g, 1);
        let a = store(&mut g, 1);
        let b = add(&mut g, 1, Label::write(X, 2, MemOrdering::Relaxed));
        g.coherence_mut().add_at_offset(X, b, 0).unwrap();
        assert_eq!(g.coherence().order(X), &[b, a]);
        assert!(!g.do_calcs().consistent);
    }

    #[test]
    fn test_rmw_must_follow_its_source() {
        let mut g = graph(false);
        spawn(&mut g, 1);
        spawn(&mut g, 2);
        let rmw = |g: &mut ExecutionGraph, t: usize| {
            load_rmw(g, t);
            let w = add(g, t, Label::rmw_write(X, 1, RmwKind::Fai, MemOrdering::AcqRel));
            g.coherence_mut().add_max(X, w);
            w
        };
        rmw(&mut g, 1);
        rmw(&mut g, 2);
        // Both read the initializer, so the second cannot sit after the first.
        assert!(!g.do_calcs().consistent);
    }

    fn load_rmw(g: &mut ExecutionGraph, thread: usize) -> Event {
        let r = g.add_label(thread, Label::rmw_read(X, RmwKind::Fai, MemOrdering::AcqRel));
        g.change_rf(r, Some(Event::INIT)).unwrap();
        update_label_views(g, r, None).unwrap();
        r
    }

    #[test]
    fn test_remove_after_drops_empty_locations() {
        let g = graph(false);
        let mut co = CoherenceCalculator::new(false);
        co.add_max(X, Event::new(1, 1));
        co.add_max(X + 1, Event::new(2, 1));
        let mut kept = View::new();
        kept.set(1, 2);
        co.remove_after(&g, &kept);
        assert_eq!(co.locations().collect::<Vec<_>>(), vec![X]);
    }

    proptest! {
        #[test]
        fn prop_change_offset_is_a_permutation(n in 1usize..8, from in 0usize..8, to in 0usize..8) {
            let from = from % n;
            let to = to % n;
            let mut co = CoherenceCalculator::new(false);
            let events: Vec<Event> = (0..n).map(|t| Event::new(t + 1, 1)).collect();
            for &e in &events {
                co.add_max(X, e);
            }
            let moved = events[from];
            co.change_offset(X, moved, to).unwrap();
            prop_assert_eq!(co.offset_of(X, moved).unwrap(), Some(to));
            let mut sorted = co.order(X).to_vec();
            sorted.sort();
            let mut expected = events.clone();
            expected.sort();
            prop_assert_eq!(sorted, expected);
        }
    }
}
