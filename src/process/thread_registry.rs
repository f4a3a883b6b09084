//! Thread registry (component D): maps `Tid` to the last-seen stop status.
//!
//! Entries are created lazily the first time a tid is observed -- attach's
//! principal thread, or any other thread whose stop event arrives later --
//! and removed once that thread's `Terminated` event is classified.
//! A flat map rather than a shared-ownership graph: this core has no
//! session/checkpoint tree to hang thread state off of, just one process
//! at a time.

use crate::address::Tid;
use crate::error::{CoreError, Result};
use crate::process::wait_status::RawWaitStatus;
use std::collections::BTreeMap;

#[derive(Copy, Clone, Debug)]
pub struct ThreadState {
    pub tid: Tid,
    pub last_wait_status: RawWaitStatus,
    pub is_active: bool,
}

#[derive(Default)]
pub struct ThreadRegistry {
    threads: BTreeMap<libc::pid_t, ThreadState>,
    active: Option<Tid>,
}

impl ThreadRegistry {
    pub fn new() -> ThreadRegistry {
        ThreadRegistry::default()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.threads.contains_key(&tid.raw())
    }

    pub fn get(&self, tid: Tid) -> Option<&ThreadState> {
        self.threads.get(&tid.raw())
    }

    /// Registers `tid` if unseen, updates its stored status, and makes it
    /// the active thread. This is the sole mutation path `wait_event` uses.
    pub fn observe(&mut self, tid: Tid, status: RawWaitStatus) {
        let entry = self.threads.entry(tid.raw()).or_insert(ThreadState {
            tid,
            last_wait_status: status,
            is_active: false,
        });
        entry.last_wait_status = status;
        for state in self.threads.values_mut() {
            state.is_active = false;
        }
        self.threads.get_mut(&tid.raw()).unwrap().is_active = true;
        self.active = Some(tid);
    }

    /// Registers `tid` as the sole, active member -- used by `open`/`attach`
    /// to seed the principal thread.
    pub fn register_principal(&mut self, tid: Tid, status: RawWaitStatus) {
        self.threads.clear();
        self.threads.insert(
            tid.raw(),
            ThreadState {
                tid,
                last_wait_status: status,
                is_active: true,
            },
        );
        self.active = Some(tid);
    }

    pub fn remove(&mut self, tid: Tid) {
        self.threads.remove(&tid.raw());
        if self.active == Some(tid) {
            self.active = None;
        }
    }

    pub fn clear(&mut self) {
        self.threads.clear();
        self.active = None;
    }

    pub fn active_tid(&self) -> Result<Tid> {
        self.active.ok_or(CoreError::NotAttached)
    }

    pub fn all_tids(&self) -> impl Iterator<Item = Tid> + '_ {
        self.threads.values().map(|s| s.tid)
    }

    /// The signal to re-inject for `PassSignal`, derived from a thread's
    /// stored raw status: `WTERMSIG` if it was signaled, else `WSTOPSIG` if
    /// it was stopped, else 0.
    pub fn pending_signal(&self, tid: Tid) -> Result<i32> {
        let state = self.get(tid).ok_or(CoreError::UnknownThread(tid))?;
        let status = state.last_wait_status;
        if status.signaled() {
            Ok(status.term_signal())
        } else if status.stopped() {
            Ok(status.stop_signal())
        } else {
            Ok(0)
        }
    }
}
