//! View computation for freshly added or rewired labels.
//!
//! Every label gets an hb view, a porf view and a pporf view; writes and
//! sends also get the message view they publish to synchronizing readers.

use crate::error::{bug, Error, Result};
use crate::event::Event;
use crate::graph::ExecutionGraph;
use crate::interp::PersistencyChecker;
use crate::label::{FenceKind, Label, LabelKind};
use crate::vv::View;

struct Views {
    hb: View,
    porf: View,
    pporf: View,
    msg: Option<View>,
}

/// Recomputes every view of the label at `e` from its predecessors. The
/// persistency hooks run last and see the updated label.
pub fn update_label_views(
    g: &mut ExecutionGraph,
    e: Event,
    persistency: Option<&dyn PersistencyChecker>,
) -> Result<()> {
    let views = calc_views(g, e)?;
    let lab = g.event_label_mut(e)?;
    lab.set_hb_view(views.hb);
    lab.set_porf_view(views.porf);
    lab.set_pporf_view(views.pporf);
    if let Some(msg) = views.msg {
        lab.set_msg_view(msg);
    }

    let Some(pers) = persistency else {
        return Ok(());
    };
    let lab = g.event_label(e)?;
    let pb = match lab.kind() {
        LabelKind::Read(r) if r.disk => pers.calc_dsk_mem_access_pb_view(g, lab),
        LabelKind::Write(w) if w.disk => pers.calc_dsk_mem_access_pb_view(g, lab),
        LabelKind::Fence(k) if *k != FenceKind::Plain => pers.calc_dsk_fence_pb_view(g, lab),
        _ => return Ok(()),
    };
    g.event_label_mut(e)?.set_pb_view(pb);
    Ok(())
}

fn calc_views(g: &ExecutionGraph, e: Event) -> Result<Views> {
    let lab = g.event_label(e)?;
    let views = match lab.kind() {
        LabelKind::Init => return Err(bug!("the initializer has fixed views")),
        LabelKind::Read(_) | LabelKind::Receive(_) => calc_load_views(g, lab)?,
        LabelKind::Write(w) => {
            let mut views = calc_basic_views(g, lab)?;
            let msg = if w.rmw.is_some() {
                calc_rmw_write_msg_view(g, lab, &views.hb)?
            } else {
                calc_write_msg_view(g, lab, &views.hb)?
            };
            views.msg = Some(msg);
            views
        }
        LabelKind::Send(_) => {
            let mut views = calc_basic_views(g, lab)?;
            views.msg = Some(views.hb.clone());
            views
        }
        LabelKind::Fence(_) => {
            let mut views = calc_basic_views(g, lab)?;
            if lab.is_at_least_acquire() {
                calc_fence_rel_rf_po_before(g, e, &mut views.hb)?;
            }
            views
        }
        LabelKind::ThreadStart { parent_create } => calc_start_views(g, e, *parent_create)?,
        LabelKind::ThreadJoin { child } => {
            let mut views = calc_basic_views(g, lab)?;
            if let Some(fin) = g.last_thread_label(*child).filter(|l| l.is_thread_finish()) {
                views.hb.update(fin.hb_view());
                views.porf.update(fin.porf_view());
                views.pporf.update(fin.pporf_view());
            }
            views
        }
        LabelKind::Lkmm(kind) => {
            return Err(Error::UnsupportedConfiguration(format!(
                "LKMM primitive {kind:?} requires the LKMM model"
            )))
        }
        LabelKind::ThreadCreate { .. }
        | LabelKind::ThreadFinish
        | LabelKind::ChannelOpen { .. }
        | LabelKind::Malloc { .. }
        | LabelKind::Free { .. }
        | LabelKind::Lock { .. }
        | LabelKind::Unlock { .. }
        | LabelKind::Optional { .. }
        | LabelKind::DskOpen => calc_basic_views(g, lab)?,
    };
    Ok(views)
}

// po-predecessor views plus the label itself. pporf keeps only the
// thread's own prefix and explicit dependencies.
fn calc_basic_views(g: &ExecutionGraph, lab: &Label) -> Result<Views> {
    let e = lab.pos();
    let prev = g.previous_label(e)?;
    let mut hb = prev.hb_view().clone();
    hb.increment(e.thread);
    let mut porf = prev.porf_view().clone();
    porf.increment(e.thread);

    let mut pporf = View::new();
    pporf.set(e.thread, e.index + 1);
    for &d in lab.deps() {
        pporf.update(g.event_label(d)?.pporf_view());
    }
    Ok(Views { hb, porf, pporf, msg: None })
}

fn calc_load_views(g: &ExecutionGraph, lab: &Label) -> Result<Views> {
    let mut views = calc_basic_views(g, lab)?;
    let Some(src) = lab.rf() else {
        return Ok(views);
    };
    let rf_lab = g.event_label(src)?;
    views.porf.update(rf_lab.porf_view());
    views.pporf.update(rf_lab.pporf_view());
    if lab.is_receive() || lab.is_at_least_acquire() {
        if let Some(msg) = rf_lab.msg_view() {
            views.hb.update(msg);
        }
    }
    Ok(views)
}

fn calc_write_msg_view(g: &ExecutionGraph, lab: &Label, hb: &View) -> Result<View> {
    if lab.is_at_least_release() {
        return Ok(hb.clone());
    }
    let addr = lab.addr().ok_or_else(|| bug!("{} is not a memory access", lab.pos()))?;
    let rel = g.last_thread_release_at_loc(lab.pos(), addr);
    Ok(g.event_label(rel)?.hb_view().clone())
}

fn calc_rmw_write_msg_view(g: &ExecutionGraph, lab: &Label, hb: &View) -> Result<View> {
    let e = lab.pos();
    let read = g.previous_label(e)?;
    if !read.is_rmw_read() {
        return Err(bug!("RMW write {e} does not follow its read"));
    }
    if read.is_not_atomic() {
        return Err(bug!("RMW read {} is not atomic", read.pos()));
    }

    let mut msg = View::new();
    if let Some(src) = read.rf() {
        if let Some(src_msg) = g.event_label(src)?.msg_view() {
            msg.update(src_msg);
        }
    }
    if read.is_at_least_release() {
        msg.update(hb);
    } else {
        let addr = lab.addr().ok_or_else(|| bug!("{e} is not a memory access"))?;
        let rel = g.last_thread_release_at_loc(e, addr);
        msg.update(g.event_label(rel)?.hb_view());
    }
    Ok(msg)
}

// Relaxed reads po-before an acquire fence synchronize through it, back to
// the previous acquire fence.
fn calc_fence_rel_rf_po_before(g: &ExecutionGraph, fence: Event, hb: &mut View) -> Result<()> {
    for lab in g.thread_labels(fence.thread)[1..fence.index as usize].iter().rev() {
        if lab.is_fence() && lab.is_at_least_acquire() {
            break;
        }
        if !lab.is_read() || !lab.is_at_most_release() {
            continue;
        }
        if let Some(src) = lab.rf() {
            if let Some(msg) = g.event_label(src)?.msg_view() {
                hb.update(msg);
            }
        }
    }
    Ok(())
}

// Thread start has acquire semantics over its create.
fn calc_start_views(g: &ExecutionGraph, e: Event, parent_create: Event) -> Result<Views> {
    let create = g.event_label(parent_create)?;
    let mut hb = create.hb_view().clone();
    let mut porf = create.porf_view().clone();
    let mut pporf = create.pporf_view().clone();
    hb.set(e.thread, e.index + 1);
    porf.set(e.thread, e.index + 1);
    pporf.set(e.thread, e.index + 1);
    Ok(Views { hb, porf, pporf, msg: None })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrefixViewPolicy;
    use crate::label::MemOrdering;

    fn graph() -> ExecutionGraph {
        ExecutionGraph::new(PrefixViewPolicy::Porf, false)
    }

    fn add(g: &mut ExecutionGraph, thread: usize, lab: Label) -> Event {
        let e = g.add_label(thread, lab);
        update_label_views(g, e, None).unwrap();
        e
    }

    fn spawn(g: &mut ExecutionGraph, child: usize) -> Event {
        let create = add(g, 0, Label::thread_create(child));
        add(g, child, Label::thread_start(create));
        create
    }

    #[test]
    fn test_basic_views_follow_po() {
        let mut g = graph();
        let a = add(&mut g, 0, Label::write(1, 1, MemOrdering::Relaxed));
        let b = add(&mut g, 0, Label::read(1, MemOrdering::Relaxed));
        let lab = g.event_label(b).unwrap();
        assert!(lab.hb_view().contains(a));
        assert!(lab.hb_view().contains(b));
        assert_eq!(lab.hb_view().get(0), 3);
        assert_eq!(lab.pporf_view().get(0), 3);
    }

    #[test]
    fn test_start_inherits_create() {
        let mut g = graph();
        let w = add(&mut g, 0, Label::write(1, 1, MemOrdering::Relaxed));
        let create = spawn(&mut g, 1);
        let start = g.event_label(Event::new(1, 0)).unwrap();
        assert!(start.hb_view().contains(w));
        assert!(start.hb_view().contains(create));
        assert_eq!(start.hb_view().get(1), 1);
    }

    #[test]
    fn test_acquire_read_synchronizes_with_release_write() {
        let mut g = graph();
        spawn(&mut g, 1);
        spawn(&mut g, 2);
        let data = add(&mut g, 1, Label::write(1, 1, MemOrdering::Relaxed));
        let flag = add(&mut g, 1, Label::write(2, 1, MemOrdering::Release));
        let r = g.add_label(2, Label::read(2, MemOrdering::Acquire));
        g.change_rf(r, Some(flag)).unwrap();
        update_label_views(&mut g, r, None).unwrap();
        assert!(g.is_hb_before(data, r));
        assert_eq!(g.event_label(flag).unwrap().readers(), &[r]);
    }

    #[test]
    fn test_relaxed_read_only_extends_porf() {
        let mut g = graph();
        spawn(&mut g, 1);
        spawn(&mut g, 2);
        let w = add(&mut g, 1, Label::write(2, 1, MemOrdering::Release));
        let r = g.add_label(2, Label::read(2, MemOrdering::Relaxed));
        g.change_rf(r, Some(w)).unwrap();
        update_label_views(&mut g, r, None).unwrap();
        let lab = g.event_label(r).unwrap();
        assert!(!lab.hb_view().contains(w));
        assert!(lab.porf_view().contains(w));
    }

    #[test]
    fn test_acquire_fence_collects_relaxed_reads() {
        let mut g = graph();
        spawn(&mut g, 1);
        spawn(&mut g, 2);
        let w = add(&mut g, 1, Label::write(2, 1, MemOrdering::Release));
        let r = g.add_label(2, Label::read(2, MemOrdering::Relaxed));
        g.change_rf(r, Some(w)).unwrap();
        update_label_views(&mut g, r, None).unwrap();
        let f = add(&mut g, 2, Label::fence(MemOrdering::Acquire));
        assert!(g.is_hb_before(w, f));
        assert!(!g.is_hb_before(w, r));
    }

    #[test]
    fn test_receive_always_synchronizes() {
        let mut g = graph();
        spawn(&mut g, 1);
        spawn(&mut g, 2);
        let before = add(&mut g, 1, Label::write(5, 1, MemOrdering::NotAtomic));
        let s = add(&mut g, 1, Label::send(0, 9));
        let r = g.add_label(2, Label::receive(0));
        g.change_rf(r, Some(s)).unwrap();
        update_label_views(&mut g, r, None).unwrap();
        assert!(g.is_hb_before(before, r));
    }

    #[test]
    fn test_join_waits_for_finish() {
        let mut g = graph();
        spawn(&mut g, 1);
        let w = add(&mut g, 1, Label::write(1, 1, MemOrdering::NotAtomic));
        let early = add(&mut g, 0, Label::thread_join(1));
        assert!(!g.is_hb_before(w, early));

        add(&mut g, 1, Label::thread_finish());
        update_label_views(&mut g, early, None).unwrap();
        assert!(g.is_hb_before(w, early));
    }

    #[test]
    fn test_relaxed_write_publishes_last_release() {
        let mut g = graph();
        spawn(&mut g, 1);
        let f = add(&mut g, 1, Label::fence(MemOrdering::Release));
        let w = add(&mut g, 1, Label::write(3, 1, MemOrdering::Relaxed));
        let msg = g.event_label(w).unwrap().msg_view().unwrap().clone();
        assert!(msg.contains(f));
        assert!(!msg.contains(w));
    }

    #[test]
    fn test_lkmm_is_unsupported() {
        let mut g = graph();
        let e = g.add_label(0, Label::lkmm(crate::label::LkmmKind::SmpFence));
        let err = update_label_views(&mut g, e, None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfiguration(_)));
    }

    struct FixedPb;

    impl PersistencyChecker for FixedPb {
        fn calc_dsk_mem_access_pb_view(&self, _g: &ExecutionGraph, lab: &Label) -> View {
            let mut v = View::new();
            v.set(lab.thread(), 7);
            v
        }

        fn calc_dsk_fence_pb_view(&self, _g: &ExecutionGraph, _lab: &Label) -> View {
            let mut v = View::new();
            v.set(0, 9);
            v
        }
    }

    #[test]
    fn test_persistency_hooks_only_for_disk_labels() {
        let mut g = graph();
        let d = g.add_label(0, Label::disk_write(4, 1, MemOrdering::Relaxed));
        update_label_views(&mut g, d, Some(&FixedPb)).unwrap();
        assert_eq!(g.event_label(d).unwrap().pb_view().get(0), 7);

        let f = g.add_label(0, Label::disk_fence(FenceKind::DskFsync));
        update_label_views(&mut g, f, Some(&FixedPb)).unwrap();
        assert_eq!(g.event_label(f).unwrap().pb_view().get(0), 9);

        let m = g.add_label(0, Label::write(4, 1, MemOrdering::Relaxed));
        update_label_views(&mut g, m, Some(&FixedPb)).unwrap();
        assert!(g.event_label(m).unwrap().pb_view().is_empty());
    }
}
