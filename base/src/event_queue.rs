//! Multi-reader single-writer event FIFO.
//!
//! Readers register iterators; an event is retained until every live
//! iterator has advanced past it. Submission is denied outright when no
//! iterator exists, so publishers can skip building the event at all.

use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Cursor into an [`EventQueue`]. Plain token: destroy it explicitly with
/// [`EventQueue::iterator_destroy`] so retained events can be released.
#[derive(Debug)]
pub struct EventIterator {
    id: u32,
}

struct QueueState<T> {
    events: VecDeque<T>,
    /// Sequence number of `events.front()`.
    base: u64,
    /// Iterator id -> next sequence that iterator will read.
    cursors: FxHashMap<u32, u64>,
    next_iterator_id: u32,
}

pub struct EventQueue<T> {
    state: Mutex<QueueState<T>>,
}

impl<T: Clone> EventQueue<T> {
    pub fn new() -> EventQueue<T> {
        EventQueue {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                base: 0,
                cursors: FxHashMap::default(),
                next_iterator_id: 1,
            }),
        }
    }

    pub fn has_iterators(&self) -> bool {
        !self.state.lock().cursors.is_empty()
    }

    /// Submits one event. Returns `false` (nothing stored) when no iterator
    /// exists.
    pub fn submit(&self, event: T) -> bool {
        let mut state = self.state.lock();
        if state.cursors.is_empty() {
            return false;
        }

        state.events.push_back(event);
        true
    }

    /// Deny-before-work variant: the event is only built when somebody will
    /// read it.
    pub fn submit_with(&self, build: impl FnOnce() -> T) -> bool {
        let mut state = self.state.lock();
        if state.cursors.is_empty() {
            return false;
        }

        let event = build();
        state.events.push_back(event);
        true
    }

    pub fn iterator_create(&self) -> EventIterator {
        let mut state = self.state.lock();
        let id = state.next_iterator_id;
        state.next_iterator_id += 1;
        let position = state.base + state.events.len() as u64;
        state.cursors.insert(id, position);
        EventIterator { id }
    }

    /// Reads the next event for this iterator and advances it, or returns
    /// `None` at the end of the queue.
    pub fn next(&self, iterator: &EventIterator) -> Option<T> {
        let mut state = self.state.lock();
        let cursor = *state.cursors.get(&iterator.id)?;
        let offset = (cursor - state.base) as usize;
        if offset >= state.events.len() {
            return None;
        }

        let event = state.events[offset].clone();
        state.cursors.insert(iterator.id, cursor + 1);
        Self::release_consumed(&mut state);
        Some(event)
    }

    pub fn iterator_destroy(&self, iterator: EventIterator) {
        let mut state = self.state.lock();
        state.cursors.remove(&iterator.id);
        if state.cursors.is_empty() {
            let drained = state.events.len() as u64;
            state.events.clear();
            state.base += drained;
        } else {
            Self::release_consumed(&mut state);
        }
    }

    fn release_consumed(state: &mut QueueState<T>) {
        let min_cursor = match state.cursors.values().min() {
            Some(min) => *min,
            None => return,
        };

        while state.base < min_cursor && !state.events.is_empty() {
            state.events.pop_front();
            state.base += 1;
        }
    }
}

impl<T: Clone> Default for EventQueue<T> {
    fn default() -> EventQueue<T> {
        EventQueue::new()
    }
}
