//! Lock-free list of the dependents waiting on one promise.
//!
//! The list head, the settlement state and the "inserts blocked" flag share a
//! single word, so insertion and settlement race through one compare-and-swap.
//! Inserts push onto the head (LIFO); settlement detaches the whole chain and
//! reverses it before dispatch, which restores attachment order.
//!
//! ```text
//!  63                                      3    2      1  0
//! +------------------------------------------+-------+------+
//! |        head pointer (8-byte aligned)      |blocked| state|
//! +------------------------------------------+-------+------+
//! ```
use crate::sync::{AtomicUsize, Ordering};
use std::{fmt, marker::PhantomData, ptr};

const STATE_MASK: usize = 0b011;
const BLOCKED: usize = 0b100;
const TAG_MASK: usize = STATE_MASK | BLOCKED;

/// Terminal state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettledState {
    Resolved,
    Rejected,
    Canceled,
}

impl SettledState {
    fn bits(self) -> usize {
        match self {
            SettledState::Resolved => 1,
            SettledState::Rejected => 2,
            SettledState::Canceled => 3,
        }
    }

    fn from_bits(word: usize) -> Option<Self> {
        match word & STATE_MASK {
            0 => None,
            1 => Some(SettledState::Resolved),
            2 => Some(SettledState::Rejected),
            _ => Some(SettledState::Canceled),
        }
    }

    /// Name of the insert failure caused by a list frozen in this state.
    pub fn insert_failure(self) -> &'static str {
        match self {
            SettledState::Resolved => "FAIL_PROMISE_RESOLVED",
            SettledState::Rejected => "FAIL_PROMISE_REJECTED",
            SettledState::Canceled => "FAIL_PROMISE_CANCELED",
        }
    }
}

/// An insert refused because the list was already settled and drained.
///
/// Hands the item back to the caller.
#[derive(Debug)]
pub struct Blocked<T> {
    pub item: T,
    pub state: SettledState,
}

impl<T> From<Blocked<T>> for crate::Error {
    fn from(blocked: Blocked<T>) -> Self {
        crate::Error::InsertBlocked(blocked.state)
    }
}

#[repr(align(8))]
struct Entry<T> {
    item: T,
    next: *mut Entry<T>,
}

/// Multiple-producer list of dependents, settled exactly once.
///
/// # Examples
///
/// ```
/// use promise_graph::{DependentList, SettledState};
///
/// let list = DependentList::new();
/// list.insert("first").unwrap();
/// list.insert("second").unwrap();
///
/// let mut seen = Vec::new();
/// assert!(list.settle_and_dispatch(SettledState::Resolved, |item| seen.push(item)));
/// assert_eq!(seen, ["first", "second"]);
///
/// let blocked = list.insert("late").unwrap_err();
/// assert_eq!(blocked.state, SettledState::Resolved);
/// ```
pub struct DependentList<T> {
    word: AtomicUsize,
    _marker: PhantomData<Box<Entry<T>>>,
}

// SAFETY: entries are only reachable through the atomic word; ownership of an
// entry moves to exactly one thread, either the inserter before publication or
// the settling thread after detaching the chain.
unsafe impl<T: Send> Send for DependentList<T> {}
unsafe impl<T: Send> Sync for DependentList<T> {}

impl<T> DependentList<T> {
    pub fn new() -> Self {
        Self {
            word: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// A list that was settled before anyone could depend on it.
    pub fn new_settled(state: SettledState) -> Self {
        Self {
            word: AtomicUsize::new(state.bits() | BLOCKED),
            _marker: PhantomData,
        }
    }

    fn head(word: usize) -> *mut Entry<T> {
        (word & !TAG_MASK) as *mut Entry<T>
    }

    /// Adds `item` to the list.
    ///
    /// Succeeds while the list is unresolved, and also while a settlement is
    /// still draining; the item then reaches the visitor of that drain.
    pub fn insert(&self, item: T) -> Result<(), Blocked<T>> {
        let entry = Box::into_raw(Box::new(Entry {
            item,
            next: ptr::null_mut(),
        }));
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if current & BLOCKED != 0 {
                // SAFETY: `entry` was never published, we still own it.
                let entry = unsafe { Box::from_raw(entry) };
                return Err(Blocked {
                    item: entry.item,
                    state: SettledState::from_bits(current).unwrap_or(SettledState::Canceled),
                });
            }
            // SAFETY: as above, `entry` is private until the CAS succeeds.
            unsafe { (*entry).next = Self::head(current) };
            let next = entry as usize | (current & STATE_MASK);
            match self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Moves the list to `state` and hands every item to `visitor` in
    /// insertion order.
    ///
    /// Returns `false` without calling `visitor` if the list was already
    /// settled. Items inserted while the visitor runs are drained as well;
    /// inserts are refused only once a drain finds the list empty.
    pub fn settle_and_dispatch(&self, state: SettledState, mut visitor: impl FnMut(T)) -> bool {
        let target = state.bits();
        let mut current = self.word.load(Ordering::Acquire);
        let mut head = loop {
            if current & STATE_MASK != 0 {
                return false;
            }
            match self
                .word
                .compare_exchange_weak(current, target, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break Self::head(current),
                Err(actual) => current = actual,
            }
        };

        loop {
            Self::dispatch(head, &mut visitor);

            // Pick up late inserts, or freeze the list if there are none.
            let mut current = self.word.load(Ordering::Acquire);
            head = loop {
                let pending = Self::head(current);
                let next = if pending.is_null() { target | BLOCKED } else { target };
                match self
                    .word
                    .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => break pending,
                    Err(actual) => current = actual,
                }
            };
            if head.is_null() {
                return true;
            }
        }
    }

    fn dispatch(mut head: *mut Entry<T>, visitor: &mut impl FnMut(T)) {
        let mut reversed: *mut Entry<T> = ptr::null_mut();
        while !head.is_null() {
            // SAFETY: the detached chain is owned by the settling thread.
            unsafe {
                let next = (*head).next;
                (*head).next = reversed;
                reversed = head;
                head = next;
            }
        }
        while !reversed.is_null() {
            // SAFETY: every entry was created by `Box::into_raw` in `insert`
            // and is visited exactly once.
            let entry = unsafe { Box::from_raw(reversed) };
            reversed = entry.next;
            visitor(entry.item);
        }
    }

    pub fn state(&self) -> Option<SettledState> {
        SettledState::from_bits(self.word.load(Ordering::Acquire))
    }

    pub fn is_settled(&self) -> bool {
        self.state().is_some()
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == Some(SettledState::Resolved)
    }

    pub fn is_rejected(&self) -> bool {
        self.state() == Some(SettledState::Rejected)
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == Some(SettledState::Canceled)
    }

    /// Whether inserts are refused for good.
    pub fn is_blocked(&self) -> bool {
        self.word.load(Ordering::Acquire) & BLOCKED != 0
    }
}

impl<T> Default for DependentList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for DependentList<T> {
    fn drop(&mut self) {
        let mut head = Self::head(self.word.load(Ordering::Acquire));
        while !head.is_null() {
            // SAFETY: no other thread can reach the list during drop.
            let entry = unsafe { Box::from_raw(head) };
            head = entry.next;
        }
    }
}

impl<T> fmt::Debug for DependentList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependentList")
            .field("state", &self.state())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::{DependentList, SettledState};
    use crate::Error;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier,
    };
    use std::thread;

    #[test]
    fn test_dispatch_is_fifo() {
        let list = DependentList::new();
        for i in 0..5 {
            list.insert(i).unwrap();
        }
        let mut seen = vec![];
        assert!(list.settle_and_dispatch(SettledState::Resolved, |i| seen.push(i)));
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_settles_once() {
        let list = DependentList::<u8>::new();
        assert!(list.settle_and_dispatch(SettledState::Rejected, |_| {}));
        assert!(!list.settle_and_dispatch(SettledState::Resolved, |_| unreachable!()));
        assert!(!list.settle_and_dispatch(SettledState::Canceled, |_| unreachable!()));
        assert!(list.is_rejected());
    }

    #[test]
    fn test_blocked_insert_reports_state() {
        for state in [
            SettledState::Resolved,
            SettledState::Rejected,
            SettledState::Canceled,
        ] {
            let list = DependentList::new();
            assert!(list.settle_and_dispatch(state, |_: u8| {}));
            assert!(list.is_blocked());
            let blocked = list.insert(7).unwrap_err();
            assert_eq!(blocked.item, 7);
            assert_eq!(blocked.state, state);
            let error: Error = blocked.into();
            assert_eq!(error.to_string(), state.insert_failure());
        }
    }

    #[test]
    fn test_insert_during_drain_is_delivered() {
        let list = DependentList::new();
        list.insert(1).unwrap();
        let mut seen = vec![];
        list.settle_and_dispatch(SettledState::Resolved, |i| {
            seen.push(i);
            if i < 3 {
                list.insert(i + 1).unwrap();
            }
        });
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(list.insert(4).is_err());
    }

    #[test]
    fn test_new_settled_refuses_inserts() {
        let list = DependentList::new_settled(SettledState::Resolved);
        assert!(list.is_resolved());
        assert_eq!(list.insert(()).unwrap_err().state, SettledState::Resolved);
    }

    #[test]
    fn test_drop_frees_pending_items() {
        let marker = Arc::new(());
        let list = DependentList::new();
        list.insert(Arc::clone(&marker)).unwrap();
        list.insert(Arc::clone(&marker)).unwrap();
        assert_eq!(Arc::strong_count(&marker), 3);
        drop(list);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_concurrent_inserts_race_settlement() {
        const INSERTERS: usize = 8;
        const PER_THREAD: usize = 200;

        for _ in 0..50 {
            let list = Arc::new(DependentList::new());
            let inserted = Arc::new(AtomicUsize::new(0));
            let visited = Arc::new(AtomicUsize::new(0));
            let go = Arc::new(Barrier::new(INSERTERS + 1));

            let handles: Vec<_> = (0..INSERTERS)
                .map(|t| {
                    let list = Arc::clone(&list);
                    let inserted = Arc::clone(&inserted);
                    let go = Arc::clone(&go);
                    thread::spawn(move || {
                        go.wait();
                        for i in 0..PER_THREAD {
                            if list.insert(t * PER_THREAD + i).is_ok() {
                                inserted.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    })
                })
                .collect();

            go.wait();
            let seen = Arc::new(std::sync::Mutex::new(vec![false; INSERTERS * PER_THREAD]));
            {
                let seen = Arc::clone(&seen);
                let visited = Arc::clone(&visited);
                assert!(list.settle_and_dispatch(SettledState::Resolved, move |i| {
                    let mut seen = seen.lock().unwrap();
                    assert!(!seen[i], "item {i} delivered twice");
                    seen[i] = true;
                    visited.fetch_add(1, Ordering::Relaxed);
                }));
            }

            for handle in handles {
                handle.join().expect("The inserter thread has panicked");
            }
            assert_eq!(
                visited.load(Ordering::Relaxed),
                inserted.load(Ordering::Relaxed)
            );
        }
    }
}
