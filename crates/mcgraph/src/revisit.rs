//! Revisit records: alternative choices saved for later exploration.
//!
//! Every record names the event (`pos`) whose choice is being reconsidered.
//! Backward revisits additionally own the prefix that has to be grafted
//! back onto the graph, and a copy of the revisited label itself; taking
//! them consumes the record.

use std::fmt;

use crate::error::{bug, Result};
use crate::event::Event;
use crate::graph::ExecutionGraph;
use crate::label::Label;

/// Where a saved store goes back in the order of its location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderPlacement {
    pub event: Event,
    pub offset: usize,
}

impl OrderPlacement {
    pub fn new(event: Event, offset: usize) -> Self {
        Self { event, offset }
    }
}

/// Make the load at `pos` read from `rev` instead, keeping the rest of the
/// graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardRevisit {
    pos: Event,
    rev: Event,
    maximal: bool,
}

impl ForwardRevisit {
    pub fn new(pos: Event, rev: Event, maximal: bool) -> Self {
        Self { pos, rev, maximal }
    }

    pub fn pos(&self) -> Event {
        self.pos
    }

    pub fn rev(&self) -> Event {
        self.rev
    }

    /// Whether `rev` was the order-maximal store when the revisit was made.
    pub fn is_maximal(&self) -> bool {
        self.maximal
    }
}

/// Make the load at `pos` read from the later store `rev`, restoring the
/// saved prefix first.
#[derive(Debug, PartialEq, Eq)]
pub struct BackwardRevisit {
    pos: Event,
    rev: Event,
    revisited: Label,
    prefix: Vec<Label>,
    placements: Vec<OrderPlacement>,
}

impl BackwardRevisit {
    /// Checks that no prefix event is hb-before `pos` and that the prefix
    /// is in stamp order.
    pub fn new(
        g: &ExecutionGraph,
        pos: Event,
        rev: Event,
        prefix: Vec<Label>,
        placements: Vec<OrderPlacement>,
    ) -> Result<Self> {
        let revisited = g.event_label(pos)?;
        let before = revisited.hb_view();
        if let Some(lab) = prefix.iter().find(|lab| before.contains(lab.pos())) {
            return Err(bug!("prefix event {} is hb-before revisited {pos}", lab.pos()));
        }
        if prefix.windows(2).any(|w| w[0].stamp() >= w[1].stamp()) {
            return Err(bug!("prefix of revisit of {pos} is not in stamp order"));
        }
        for p in &placements {
            if !prefix.iter().any(|lab| lab.pos() == p.event) {
                return Err(bug!("placement of {} outside the prefix", p.event));
            }
        }
        let revisited = revisited.detached_copy();
        Ok(Self { pos, rev, revisited, prefix, placements })
    }

    pub fn pos(&self) -> Event {
        self.pos
    }

    pub fn rev(&self) -> Event {
        self.rev
    }

    /// The saved prefix, without releasing it.
    pub fn prefix(&self) -> &[Label] {
        &self.prefix
    }

    pub fn placements(&self) -> &[OrderPlacement] {
        &self.placements
    }

    /// The label at `pos` as it was when the revisit was made. Its stamp is
    /// the worklist key of the record.
    pub fn revisited(&self) -> &Label {
        &self.revisited
    }

    /// Releases the revisited label, the prefix and its placements.
    pub fn take(self) -> (Label, Vec<Label>, Vec<OrderPlacement>) {
        (self.revisited, self.prefix, self.placements)
    }
}

/// Backward revisit routed through an intermediate store `mid` that must
/// still be present after the cut.
#[derive(Debug, PartialEq, Eq)]
pub struct BackwardRevisitHelper {
    revisit: BackwardRevisit,
    mid: Event,
}

impl BackwardRevisitHelper {
    pub fn new(revisit: BackwardRevisit, mid: Event) -> Self {
        Self { revisit, mid }
    }

    pub fn pos(&self) -> Event {
        self.revisit.pos()
    }

    pub fn rev(&self) -> Event {
        self.revisit.rev()
    }

    pub fn mid(&self) -> Event {
        self.mid
    }

    pub fn into_inner(self) -> BackwardRevisit {
        self.revisit
    }
}

/// Move the write at `pos` to a different coherence offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteRevisit {
    pos: Event,
    mo_pos: usize,
}

impl WriteRevisit {
    pub fn new(pos: Event, mo_pos: usize) -> Self {
        Self { pos, mo_pos }
    }

    pub fn pos(&self) -> Event {
        self.pos
    }

    pub fn mo_pos(&self) -> usize {
        self.mo_pos
    }
}

/// Move the send at `pos` to a different send-order offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendRevisit {
    pos: Event,
    so_pos: usize,
}

impl SendRevisit {
    pub fn new(pos: Event, so_pos: usize) -> Self {
        Self { pos, so_pos }
    }

    pub fn pos(&self) -> Event {
        self.pos
    }

    pub fn so_pos(&self) -> usize {
        self.so_pos
    }
}

/// Expand the optional block at `pos`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptionalRevisit {
    pos: Event,
}

impl OptionalRevisit {
    pub fn new(pos: Event) -> Self {
        Self { pos }
    }

    pub fn pos(&self) -> Event {
        self.pos
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Revisit {
    Forward(ForwardRevisit),
    Backward(BackwardRevisit),
    BackwardHelper(BackwardRevisitHelper),
    /// A receive revisited by a send.
    BackwardSR(BackwardRevisit),
    /// A send revisited by a receive; `pos` is the send.
    BackwardRS(BackwardRevisit),
    Write(WriteRevisit),
    Send(SendRevisit),
    Optional(OptionalRevisit),
}

impl Revisit {
    pub fn pos(&self) -> Event {
        match self {
            Revisit::Forward(r) => r.pos(),
            Revisit::Backward(r) | Revisit::BackwardSR(r) | Revisit::BackwardRS(r) => r.pos(),
            Revisit::BackwardHelper(r) => r.pos(),
            Revisit::Write(r) => r.pos(),
            Revisit::Send(r) => r.pos(),
            Revisit::Optional(r) => r.pos(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Revisit::Forward(_) => "Forward",
            Revisit::Backward(_) => "Backward",
            Revisit::BackwardHelper(_) => "BackwardHelper",
            Revisit::BackwardSR(_) => "BackwardSR",
            Revisit::BackwardRS(_) => "BackwardRS",
            Revisit::Write(_) => "Write",
            Revisit::Send(_) => "Send",
            Revisit::Optional(_) => "Optional",
        }
    }
}

impl fmt::Display for Revisit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind_name(), self.pos())?;
        match self {
            Revisit::Forward(r) => write!(f, " <- {}", r.rev()),
            Revisit::Backward(r) | Revisit::BackwardSR(r) | Revisit::BackwardRS(r) => {
                write!(f, " <- {} (prefix {})", r.rev(), r.prefix().len())
            }
            Revisit::BackwardHelper(r) => write!(f, " <- {} via {}", r.rev(), r.mid()),
            Revisit::Write(r) => write!(f, " @{}", r.mo_pos()),
            Revisit::Send(r) => write!(f, " @{}", r.so_pos()),
            Revisit::Optional(_) => Ok(()),
        }
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

    // T1: r = x; T2: x = 1. The write's prefix is T2 only.
    fn read_then_write() -> (ExecutionGraph, Event, Event) {
        let mut g = ExecutionGraph::new(PrefixViewPolicy::Porf, false);
        for child in [1, 2] {
            let create = add(&mut g, 0, Label::thread_create(child));
            add(&mut g, child, Label::thread_start(create));
        }
        let r = g.add_label(1, Label::read(0x1, MemOrdering::Relaxed));
        g.change_rf(r, Some(Event::INIT)).unwrap();
        update_label_views(&mut g, r, None).unwrap();
        let w = add(&mut g, 2, Label::write(0x1, 1, MemOrdering::Relaxed));
        g.coherence_mut().add_max(0x1, w);
        (g, r, w)
    }

    #[test]
    fn test_send_revisit_keeps_supplied_position() {
        let rev = SendRevisit::new(Event::new(1, 2), 3);
        assert_eq!(rev.so_pos(), 3);
        assert_eq!(rev.pos(), Event::new(1, 2));
        let rev = SendRevisit::new(Event::new(1, 2), 0);
        assert_eq!(rev.so_pos(), 0);
    }

    #[test]
    fn test_backward_revisit_take_releases_prefix() {
        let (g, r, w) = read_then_write();
        let prefix = vec![g.event_label(w).unwrap().detached_copy()];
        let placements = vec![OrderPlacement::new(w, 0)];
        let rev = BackwardRevisit::new(&g, r, w, prefix, placements).unwrap();
        assert_eq!(rev.prefix().len(), 1);
        assert_eq!(rev.revisited().stamp(), g.event_label(r).unwrap().stamp());
        let (revisited, prefix, placements) = rev.take();
        assert_eq!(revisited.pos(), r);
        assert_eq!(revisited.rf(), Some(Event::INIT));
        assert_eq!(prefix[0].pos(), w);
        assert_eq!(placements, vec![OrderPlacement::new(w, 0)]);
    }

    #[test]
    fn test_backward_revisit_rejects_hb_before_prefix() {
        let (g, r, w) = read_then_write();
        let start = g.event_label(Event::new(1, 0)).unwrap().detached_copy();
        let err = BackwardRevisit::new(&g, r, w, vec![start], Vec::new()).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_backward_revisit_rejects_stray_placement() {
        let (g, r, w) = read_then_write();
        let err = BackwardRevisit::new(&g, r, w, Vec::new(), vec![OrderPlacement::new(w, 0)])
            .unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_revisit_display() {
        let rev = Revisit::Forward(ForwardRevisit::new(Event::new(1, 1), Event::INIT, true));
        assert_eq!(rev.to_string(), "Forward (1, 1) <- INIT");
        let rev = Revisit::Write(WriteRevisit::new(Event::new(2, 3), 0));
        assert_eq!(rev.to_string(), "Write (2, 3) @0");
        assert_eq!(rev.pos(), Event::new(2, 3));
    }
}
