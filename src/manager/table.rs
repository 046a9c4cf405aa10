//! State table: peer address to per-peer state cell.
//!
//! The table mutex covers the mapping; each cell carries its own lock plus a
//! notifier signalled on every write, so operations can wait for a peer's
//! state to move without holding any lock. Lock order is always table before
//! cell, and no lock is ever held across an `await`.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::conn::state::ConnectionState;
use crate::conn::PeerAddr;

/// One peer's state cell: a mutex-guarded variant plus a notifier.
///
/// Cells are compared by `Arc` identity. A cell is never reinserted once its
/// entry has been removed or displaced; a fresh connection for the same peer
/// always allocates a new cell.
pub(crate) struct PeerCell<A, H> {
    state: Mutex<ConnectionState<A, H>>,
    changed: Notify,
}

impl<A: PeerAddr, H> PeerCell<A, H> {
    pub fn new(initial: ConnectionState<A, H>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(initial),
            changed: Notify::new(),
        })
    }

    /// Lock the cell for a (possible) write. Waiters are woken when the
    /// guard drops.
    pub fn lock(&self) -> CellGuard<'_, A, H> {
        CellGuard {
            changed: &self.changed,
            guard: Some(self.state.lock()),
        }
    }

    /// Read the state without waking waiters.
    pub fn peek<R>(&self, f: impl FnOnce(&ConnectionState<A, H>) -> R) -> R {
        f(&self.state.lock())
    }

    /// Wait until the state no longer satisfies `pred`.
    ///
    /// The waiter is registered before the state is re-read, so a write
    /// between the check and the sleep cannot be missed.
    pub async fn wait_while(&self, mut pred: impl FnMut(&ConnectionState<A, H>) -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !pred(&self.state.lock()) {
                return;
            }
            notified.await;
        }
    }
}

/// Guard over a cell's state; notifies every waiter when dropped.
pub(crate) struct CellGuard<'a, A, H> {
    changed: &'a Notify,
    guard: Option<MutexGuard<'a, ConnectionState<A, H>>>,
}

impl<A, H> Deref for CellGuard<'_, A, H> {
    type Target = ConnectionState<A, H>;

    fn deref(&self) -> &Self::Target {
        self.guard.as_ref().expect("cell guard taken")
    }
}

impl<A, H> DerefMut for CellGuard<'_, A, H> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut().expect("cell guard taken")
    }
}

impl<A, H> Drop for CellGuard<'_, A, H> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.changed.notify_waiters();
    }
}

/// The table of per-peer cells, guarded by one mutex.
pub(crate) struct StateTable<A, H> {
    entries: Mutex<HashMap<A, Arc<PeerCell<A, H>>>>,
}

impl<A: PeerAddr, H> StateTable<A, H> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Lock the mapping. Callers may additionally lock individual cells
    /// while holding this guard, never the other way around.
    pub fn entries(&self) -> MutexGuard<'_, HashMap<A, Arc<PeerCell<A, H>>>> {
        self.entries.lock()
    }

    /// The cell currently registered for `addr`.
    pub fn get(&self, addr: &A) -> Option<Arc<PeerCell<A, H>>> {
        self.entries.lock().get(addr).cloned()
    }

    /// Look up `addr` and run `f` on its state with both locks held.
    pub fn with_state<R>(
        &self,
        addr: &A,
        f: impl FnOnce(Option<&mut ConnectionState<A, H>>) -> R,
    ) -> R {
        let entries = self.entries.lock();
        match entries.get(addr) {
            Some(cell) => {
                let cell = cell.clone();
                let mut st = cell.lock();
                f(Some(&mut *st))
            }
            None => f(None),
        }
    }

    /// Remove `addr` if it still maps to `cell` and the state is terminal;
    /// the state is rewritten to `Terminated` first. Returns whether the
    /// entry was removed.
    pub fn finalize_remove(&self, addr: &A, cell: &Arc<PeerCell<A, H>>) -> bool {
        let mut entries = self.entries.lock();
        let Some(current) = entries.get(addr) else {
            return false;
        };
        if !Arc::ptr_eq(current, cell) {
            return false;
        }
        {
            let mut st = cell.lock();
            if !matches!(
                &*st,
                ConnectionState::Terminating { .. } | ConnectionState::Terminated { .. }
            ) {
                return false;
            }
            st.take_terminated();
        }
        entries.remove(addr);
        true
    }

    /// Snapshot of the current entries.
    pub fn snapshot(&self) -> Vec<(A, Arc<PeerCell<A, H>>)> {
        self.entries
            .lock()
            .iter()
            .map(|(addr, cell)| (addr.clone(), cell.clone()))
            .collect()
    }

    /// Take every entry out of the table.
    pub fn drain(&self) -> Vec<(A, Arc<PeerCell<A, H>>)> {
        self.entries.lock().drain().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::state::AbstractState;

    type TestTable = StateTable<&'static str, ()>;

    #[test]
    fn test_insert_and_get() {
        let table = TestTable::new();
        let cell = PeerCell::new(ConnectionState::ReservedOutbound);
        table.entries().insert("peer", cell.clone());

        let found = table.get(&"peer").unwrap();
        assert!(Arc::ptr_eq(&found, &cell));
        assert!(table.get(&"other").is_none());
    }

    #[test]
    fn test_finalize_remove_requires_terminal_state() {
        let table = TestTable::new();
        let cell = PeerCell::new(ConnectionState::ReservedOutbound);
        table.entries().insert("peer", cell.clone());

        // a reservation is not terminal, so it must survive
        assert!(!table.finalize_remove(&"peer", &cell));
        assert_eq!(table.len(), 1);

        *cell.lock() = ConnectionState::Terminated { error: None };
        assert!(table.finalize_remove(&"peer", &cell));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_finalize_remove_ignores_foreign_cell() {
        let table = TestTable::new();
        let resident = PeerCell::new(ConnectionState::Terminated { error: None });
        let stranger = PeerCell::new(ConnectionState::Terminated { error: None });
        table.entries().insert("peer", resident);

        assert!(!table.finalize_remove(&"peer", &stranger));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_while_sees_write() {
        let cell: Arc<PeerCell<&str, ()>> = PeerCell::new(ConnectionState::ReservedOutbound);

        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move {
                cell.wait_while(|st| {
                    matches!(st, ConnectionState::ReservedOutbound)
                })
                .await;
                cell.peek(|st| st.abstract_state())
            })
        };

        tokio::task::yield_now().await;
        *cell.lock() = ConnectionState::Terminated { error: None };

        let observed = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .unwrap();
        assert_eq!(observed, AbstractState::Terminated);
    }
}
