//! Allocation groups: a process-wide tree attributing memory to the
//! subsystem that asked for it.
//!
//! Groups are immortal. Accounting operations are lock-free atomics; tree
//! growth is serialized by one global lock. Every operation emits an event
//! into the process event queue, but only while a capture iterator exists,
//! so the uninstrumented path costs a single denied submission check.

use crate::event_queue::{EventIterator, EventQueue};
use crate::intern::{intern, InternedString};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

struct GroupNode {
    name: InternedString,
    allocated_here: AtomicU64,
    children: Mutex<Vec<&'static GroupNode>>,
}

lazy_static! {
    static ref ROOT: &'static GroupNode = Box::leak(Box::new(GroupNode {
        name: intern("root"),
        allocated_here: AtomicU64::new(0),
        children: Mutex::new(Vec::new()),
    }));
    static ref GROWTH: Mutex<()> = Mutex::new(());
    static ref EVENTS: EventQueue<AllocationEvent> = EventQueue::new();
}

/// Handle to one node of the allocation group tree.
#[derive(Clone, Copy)]
pub struct AllocationGroup(&'static GroupNode);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationEventKind {
    NewGroup,
    Allocate { amount: u64 },
    Free { amount: u64 },
    Marker { name: InternedString },
}

#[derive(Clone, Copy, Debug)]
pub struct AllocationEvent {
    pub group: AllocationGroup,
    pub kind: AllocationEventKind,
}

impl AllocationGroup {
    pub fn root() -> AllocationGroup {
        AllocationGroup(*ROOT)
    }

    pub fn name(self) -> InternedString {
        self.0.name
    }

    /// Returns the pre-existing child with this name, creating it otherwise.
    pub fn get_or_create_child(self, name: InternedString) -> AllocationGroup {
        let _growth = GROWTH.lock();
        {
            let children = self.0.children.lock();
            if let Some(existing) = children.iter().find(|child| child.name == name) {
                return AllocationGroup(existing);
            }
        }

        let child: &'static GroupNode = Box::leak(Box::new(GroupNode {
            name,
            allocated_here: AtomicU64::new(0),
            children: Mutex::new(Vec::new()),
        }));
        self.0.children.lock().push(child);

        let group = AllocationGroup(child);
        EVENTS.submit_with(|| AllocationEvent {
            group,
            kind: AllocationEventKind::NewGroup,
        });
        group
    }

    pub fn allocate(self, amount: u64) {
        self.0.allocated_here.fetch_add(amount, Ordering::Relaxed);
        EVENTS.submit_with(|| AllocationEvent {
            group: self,
            kind: AllocationEventKind::Allocate { amount },
        });
    }

    /// Must mirror an earlier `allocate`. Underflow asserts in debug builds
    /// and clamps at zero in release builds.
    pub fn free(self, amount: u64) {
        let previous = self
            .0
            .allocated_here
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(amount))
            })
            .unwrap();
        debug_assert!(previous >= amount, "allocation group accounting underflow");

        EVENTS.submit_with(|| AllocationEvent {
            group: self,
            kind: AllocationEventKind::Free { amount },
        });
    }

    pub fn mark(self, marker: InternedString) {
        EVENTS.submit_with(|| AllocationEvent {
            group: self,
            kind: AllocationEventKind::Marker { name: marker },
        });
    }

    pub fn directly_allocated(self) -> u64 {
        self.0.allocated_here.load(Ordering::Relaxed)
    }

    /// Self plus all descendants.
    pub fn total_allocated(self) -> u64 {
        let mut total = self.directly_allocated();
        let children = self.0.children.lock().clone();
        for child in children {
            total += AllocationGroup(child).total_allocated();
        }
        total
    }
}

impl PartialEq for AllocationGroup {
    fn eq(&self, other: &AllocationGroup) -> bool {
        self.0 as *const GroupNode == other.0 as *const GroupNode
    }
}

impl Eq for AllocationGroup {}

impl fmt::Debug for AllocationGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AllocationGroup({})", self.0.name)
    }
}

/// Immutable snapshot of one group and its subtree.
#[derive(Debug)]
pub struct CapturedGroup {
    pub name: InternedString,
    pub source: AllocationGroup,
    pub directly_allocated: u64,
    pub children: Vec<CapturedGroup>,
}

impl CapturedGroup {
    pub fn total_allocated(&self) -> u64 {
        self.directly_allocated
            + self.children.iter().map(CapturedGroup::total_allocated).sum::<u64>()
    }
}

/// Result of [`begin_capture`]: snapshot and event iterator taken at the
/// same instant. The two halves can be dropped independently; destroy the
/// iterator through [`event_queue`] once done draining.
pub struct Capture {
    pub root: CapturedGroup,
    pub events: EventIterator,
}

/// The queue [`Capture::events`] iterates over.
pub fn event_queue() -> &'static EventQueue<AllocationEvent> {
    &EVENTS
}

pub fn begin_capture() -> Capture {
    // The growth lock makes the snapshot and iterator registration atomic
    // with respect to new groups.
    let _growth = GROWTH.lock();
    let events = EVENTS.iterator_create();
    let root = snapshot(*ROOT);
    Capture { root, events }
}

fn snapshot(node: &'static GroupNode) -> CapturedGroup {
    let children = node.children.lock().clone();
    CapturedGroup {
        name: node.name,
        source: AllocationGroup(node),
        directly_allocated: node.allocated_here.load(Ordering::Relaxed),
        children: children.into_iter().map(snapshot).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_lookup_returns_existing() {
        let parent = AllocationGroup::root().get_or_create_child(intern("capture_test_lookup"));
        let a = parent.get_or_create_child(intern("inner"));
        let b = parent.get_or_create_child(intern("inner"));
        assert_eq!(a, b);
    }

    #[test]
    fn accounting_sums_to_root_total() {
        let parent = AllocationGroup::root().get_or_create_child(intern("capture_test_accounting"));
        let left = parent.get_or_create_child(intern("left"));
        let right = parent.get_or_create_child(intern("right"));

        left.allocate(128);
        right.allocate(64);
        right.free(16);

        let capture = begin_capture();
        fn directly_allocated_sum(group: &CapturedGroup) -> u64 {
            group.directly_allocated
                + group.children.iter().map(directly_allocated_sum).sum::<u64>()
        }
        assert_eq!(directly_allocated_sum(&capture.root), capture.root.total_allocated());
        event_queue().iterator_destroy(capture.events);

        left.free(128);
        right.free(48);
    }

    #[test]
    fn events_flow_only_into_live_captures() {
        let group = AllocationGroup::root().get_or_create_child(intern("capture_test_events"));

        // No capture: operations are silent.
        group.allocate(4);
        group.free(4);

        let capture = begin_capture();
        group.allocate(32);
        group.mark(intern("after_allocate"));
        group.free(32);

        let mut kinds = Vec::new();
        while let Some(event) = event_queue().next(&capture.events) {
            if event.group == group {
                kinds.push(event.kind);
            }
        }
        assert_eq!(
            kinds,
            vec![
                AllocationEventKind::Allocate { amount: 32 },
                AllocationEventKind::Marker { name: intern("after_allocate") },
                AllocationEventKind::Free { amount: 32 },
            ]
        );
        event_queue().iterator_destroy(capture.events);
    }
}
