//! Event classifier (component F): converts a raw wait status into a typed,
//! immutable [`DebugEvent`].

use crate::address::{Pid, Tid};
use crate::process::wait_status::RawWaitStatus;

/// One observed change in a debuggee's lifecycle. Immutable once
/// constructed; every variant carries the originating pid and the
/// reporting tid.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DebugEvent {
    /// Stopped by an ordinary signal (not TRAP, and not a syscall-stop
    /// when syscall tracing is enabled).
    Stopped { pid: Pid, tid: Tid, signal: i32 },
    /// The process (or its last thread) terminated, either by exiting or
    /// by a fatal signal.
    Terminated {
        pid: Pid,
        tid: Tid,
        exit_code: Option<i32>,
        signal: Option<i32>,
        normal: bool,
    },
    /// Stopped by SIGTRAP: a breakpoint, a single-step completion, or the
    /// post-exec stop.
    Trap { pid: Pid, tid: Tid },
    /// Stopped at a syscall boundary. Only produced when the controller
    /// has syscall-stop tracing enabled (see `DebuggerConfig::trap_on_syscall`).
    Syscall { pid: Pid, tid: Tid },
}

impl DebugEvent {
    pub fn pid(&self) -> Pid {
        match *self {
            DebugEvent::Stopped { pid, .. }
            | DebugEvent::Terminated { pid, .. }
            | DebugEvent::Trap { pid, .. }
            | DebugEvent::Syscall { pid, .. } => pid,
        }
    }

    pub fn tid(&self) -> Tid {
        match *self {
            DebugEvent::Stopped { tid, .. }
            | DebugEvent::Terminated { tid, .. }
            | DebugEvent::Trap { tid, .. }
            | DebugEvent::Syscall { tid, .. } => tid,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, DebugEvent::Terminated { .. })
    }
}

/// Classifies a raw wait status into a [`DebugEvent`], in the fixed rule
/// order from the design: exited, then signaled, then TRAP, then (if
/// enabled) syscall-stop, then any other stop.
pub fn classify(
    pid: Pid,
    tid: Tid,
    status: RawWaitStatus,
    trap_on_syscall: bool,
    syscall_stop_signal: i32,
) -> DebugEvent {
    if status.exited() {
        return DebugEvent::Terminated {
            pid,
            tid,
            exit_code: Some(status.exit_status()),
            signal: None,
            normal: true,
        };
    }
    if status.signaled() {
        return DebugEvent::Terminated {
            pid,
            tid,
            exit_code: None,
            signal: Some(status.term_signal()),
            normal: false,
        };
    }
    if status.stopped() {
        let sig = status.stop_signal();
        if sig == libc::SIGTRAP {
            return DebugEvent::Trap { pid, tid };
        }
        if trap_on_syscall && sig == syscall_stop_signal {
            return DebugEvent::Syscall { pid, tid };
        }
        return DebugEvent::Stopped {
            pid,
            tid,
            signal: sig,
        };
    }
    // Not exited, signaled, or stopped: nothing in the POSIX wait-status
    // space is left. Treat conservatively as an ordinary stop with signal 0
    // rather than panicking on a status this adapter has never actually
    // observed in the wild.
    DebugEvent::Stopped {
        pid,
        tid,
        signal: 0,
    }
}
