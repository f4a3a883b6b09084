//! Process controller (component E): the debugger core's centerpiece.
//!
//! Owns the attach/detach/kill lifecycle, the wait-event pump, and the
//! memory/register operations that are only meaningful while a debuggee is
//! stopped. Every operation checks the controller's own state rather than
//! trusting the caller, so a misuse (e.g. `resume` while detached) always
//! comes back as a typed error instead of an OS-level surprise.

use crate::address::{Address, Pid, Tid};
use crate::collaborators::BreakpointRegistry;
use crate::config::DebuggerConfig;
use crate::error::{CoreError, Result};
use crate::process::event::{classify, DebugEvent};
use crate::process::memory;
use crate::process::os_adapter::{OsAdapter, ProcessInfo};
use crate::process::registers::{Arch, FpRegs, GpRegsX64, GpRegsX86, RegisterBank, RegistersSnapshot};
use crate::process::thread_registry::ThreadRegistry;
use std::path::Path;

/// Stops arriving with this signal are classified as syscall-stops rather
/// than ordinary signal-stops, matching the `PTRACE_O_TRACESYSGOOD`-style
/// convention: the high bit of the trap signal is set.
const SYSCALL_STOP_SIGNAL: i32 = libc::SIGTRAP | 0x80;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ControllerState {
    Detached,
    AttachedRunning,
    AttachedStopped,
}

/// What a resumed/stepped thread should do with the signal that stopped it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Disposition {
    /// Leave the process paused; issues no ptrace call.
    Stop,
    /// Resume delivering signal 0 (swallow whatever stopped it).
    Continue,
    /// Resume re-injecting the signal that caused the last stop.
    PassSignal,
}

pub struct ProcessController {
    os: OsAdapter,
    state: ControllerState,
    pid: Option<Pid>,
    arch: Arch,
    registry: ThreadRegistry,
    config: DebuggerConfig,
    breakpoints: Option<Box<dyn BreakpointRegistry>>,
}

impl ProcessController {
    pub fn new(config: DebuggerConfig) -> ProcessController {
        ProcessController {
            os: OsAdapter::new(),
            state: ControllerState::Detached,
            pid: None,
            arch: Arch::X64,
            registry: ThreadRegistry::new(),
            config,
            breakpoints: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The architecture of a freshly attached/opened debuggee is not probed
    /// automatically; callers that know (from the binary-info collaborator,
    /// or from the target they asked for) set it explicitly.
    pub fn set_arch(&mut self, arch: Arch) {
        self.arch = arch;
    }

    pub fn set_breakpoint_registry(&mut self, registry: Box<dyn BreakpointRegistry>) {
        self.breakpoints = Some(registry);
    }

    fn require_attached(&self) -> Result<()> {
        if self.state == ControllerState::Detached {
            Err(CoreError::NotAttached)
        } else {
            Ok(())
        }
    }

    fn require_stopped(&self) -> Result<Tid> {
        if self.state != ControllerState::AttachedStopped {
            return Err(CoreError::NotAttached);
        }
        self.registry.active_tid()
    }

    /// Forks a traced child, execs `path`, and blocks for the post-exec
    /// stop. Legal only in `Detached`. Any failure -- fork, wait, or an
    /// unexpected first event -- leaves the controller in `Detached`.
    pub fn open(&mut self, path: &Path, cwd: Option<&Path>, argv: &[String], tty: Option<&Path>) -> Result<()> {
        if self.state != ControllerState::Detached {
            return Err(CoreError::AlreadyAttached);
        }
        let pid = self.os.spawn_traced(path, cwd, argv, tty)?;
        let (tid, status) = self.os.waitpid_blocking(pid)?;
        let event = classify(pid, tid, status, false, SYSCALL_STOP_SIGNAL);
        match event {
            DebugEvent::Trap { .. } => {
                self.pid = Some(pid);
                self.registry.register_principal(tid, status);
                self.state = ControllerState::AttachedStopped;
                log::debug!("{:?} -> AttachedStopped (spawned {})", ControllerState::Detached, pid);
                Ok(())
            }
            other => {
                self.state = ControllerState::Detached;
                self.pid = None;
                log::error!("unexpected first event after spawn: {:?}", other);
                Err(CoreError::UnexpectedFirstEvent(format!("{:?}", other)))
            }
        }
    }

    /// Attaches to an already-running `pid`. Legal only in `Detached`. Only
    /// the principal thread is registered; any other thread is discovered
    /// lazily as its own stop event arrives through `wait_event`.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        if self.state != ControllerState::Detached {
            return Err(CoreError::AlreadyAttached);
        }
        self.os.attach(pid)?;
        let (tid, status) = self.os.waitpid_blocking(pid)?;
        self.pid = Some(pid);
        self.registry.register_principal(tid, status);
        self.state = ControllerState::AttachedStopped;
        log::debug!("Detached -> AttachedStopped (attached to {})", pid);
        Ok(())
    }

    /// Waits for the next lifecycle event, updating the thread registry
    /// before classifying and returning it. Legal in any attached state.
    pub fn wait_event(&mut self, timeout_ms: u64) -> Result<DebugEvent> {
        self.require_attached()?;
        let pid = self.pid.expect("attached state implies a pid");
        let (tid, status, timed_out) =
            self.os.waitpid_timeout(pid, timeout_ms, self.config.poll_interval_ms)?;
        if timed_out {
            return Err(CoreError::Timeout);
        }
        self.registry.observe(tid, status);
        let event = classify(pid, tid, status, self.config.trap_on_syscall, SYSCALL_STOP_SIGNAL);
        log::debug!("wait_event -> {:?}", event);
        if event.is_terminated() {
            self.registry.remove(tid);
            if self.registry.is_empty() {
                self.state = ControllerState::Detached;
                self.pid = None;
                log::debug!("last thread of {} exited, AttachedRunning -> Detached", pid);
                return Ok(event);
            }
        }
        self.state = ControllerState::AttachedStopped;
        Ok(event)
    }

    /// Resumes the active thread. Legal only in `AttachedStopped`; on
    /// success the controller moves to `AttachedRunning`, except for
    /// `Disposition::Stop`, which is a pure no-op that leaves the process
    /// paused.
    pub fn resume(&mut self, disposition: Disposition) -> Result<()> {
        let tid = self.require_stopped()?;
        match disposition {
            Disposition::Stop => return Ok(()),
            Disposition::Continue => self.os.cont(tid, 0)?,
            Disposition::PassSignal => {
                let signal = self.registry.pending_signal(tid)?;
                self.os.cont(tid, signal)?;
            }
        }
        self.state = ControllerState::AttachedRunning;
        log::debug!("resume({:?}) on {}: AttachedStopped -> AttachedRunning", disposition, tid);
        Ok(())
    }

    /// Single-steps the active thread. Same legality and disposition rules
    /// as `resume`, using the SINGLE_STEP opcode instead of CONTINUE.
    pub fn step(&mut self, disposition: Disposition) -> Result<()> {
        let tid = self.require_stopped()?;
        match disposition {
            Disposition::Stop => return Ok(()),
            Disposition::Continue => self.os.single_step(tid, 0)?,
            Disposition::PassSignal => {
                let signal = self.registry.pending_signal(tid)?;
                self.os.single_step(tid, signal)?;
            }
        }
        self.state = ControllerState::AttachedRunning;
        log::debug!("step({:?}) on {}: AttachedStopped -> AttachedRunning", disposition, tid);
        Ok(())
    }

    /// Sends `SIGSTOP` to every registered thread without waiting for the
    /// resulting stop events.
    pub fn pause(&self) -> Result<()> {
        self.require_attached()?;
        for tid in self.registry.all_tids() {
            self.os.send_sigstop(tid)?;
        }
        Ok(())
    }

    pub fn read_word(&self, address: Address) -> Result<u64> {
        let tid = self.require_stopped()?;
        self.os.read_word(tid, address)
    }

    pub fn write_word(&self, address: Address, value: u64) -> Result<()> {
        let tid = self.require_stopped()?;
        self.os.write_word(tid, address, value)
    }

    /// Stitches an arbitrary byte range out of whole machine words, per the
    /// memory view.
    pub fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>> {
        let tid = self.require_stopped()?;
        memory::read_bytes(&self.os, tid, address, len)
    }

    pub fn write_bytes(&self, address: Address, data: &[u8]) -> Result<()> {
        let tid = self.require_stopped()?;
        memory::write_bytes(&self.os, tid, address, data)
    }

    /// Register snapshot of the active thread. Returns an all-zero snapshot
    /// rather than an error when the controller is `Detached`.
    pub fn get_state(&self) -> Result<RegistersSnapshot> {
        let tid = match self.require_stopped() {
            Ok(tid) => tid,
            Err(_) if self.state == ControllerState::Detached => {
                return Ok(RegistersSnapshot::zeroed(self.arch))
            }
            Err(err) => return Err(err),
        };
        let fp = self.read_fpregs(tid)?;
        let mut snapshot = match self.arch {
            Arch::X64 => RegistersSnapshot::from_x64(self.read_gp_x64(tid)?),
            Arch::X86 => RegistersSnapshot::from_x86(self.read_gp_x86(tid)?),
        };
        snapshot.fp = fp;
        Ok(snapshot)
    }

    pub fn set_state(&mut self, regs: &RegistersSnapshot) -> Result<()> {
        let tid = self.require_stopped()?;
        match (self.arch, regs.as_x64(), regs.as_x86()) {
            (Arch::X64, Some(gp), _) => self.write_gp_x64(tid, gp)?,
            (Arch::X86, _, Some(gp)) => self.write_gp_x86(tid, gp)?,
            _ => {
                return Err(CoreError::InvalidConfig(
                    "register snapshot architecture does not match the attached debuggee".into(),
                ))
            }
        }
        self.write_fpregs(tid, &regs.fp)
    }

    /// Clears any breakpoints, then detaches. Always legal while attached,
    /// regardless of whether the debuggee is currently stopped or running.
    pub fn detach(&mut self) -> Result<()> {
        self.require_attached()?;
        let pid = self.pid.expect("attached state implies a pid");
        if let Some(registry) = self.breakpoints.as_mut() {
            registry.clear_all();
        }
        self.os.detach(pid)?;
        self.registry.clear();
        self.state = ControllerState::Detached;
        self.pid = None;
        log::debug!("detached from {}: -> Detached", pid);
        Ok(())
    }

    /// Clears any breakpoints, then kills and reaps the debuggee. Always
    /// legal while attached, regardless of run state.
    pub fn kill(&mut self) -> Result<()> {
        self.require_attached()?;
        let pid = self.pid.expect("attached state implies a pid");
        if let Some(registry) = self.breakpoints.as_mut() {
            registry.clear_all();
        }
        self.os.kill(pid)?;
        self.registry.clear();
        self.state = ControllerState::Detached;
        self.pid = None;
        log::debug!("killed {}: -> Detached", pid);
        Ok(())
    }

    /// Pass-through process listing; legal in any state.
    pub fn enumerate(&self) -> Result<Vec<ProcessInfo>> {
        self.os.enumerate_processes()
    }

    fn read_gp_x64(&self, tid: Tid) -> Result<GpRegsX64> {
        let mut regs = GpRegsX64::default();
        let buf = unsafe {
            std::slice::from_raw_parts_mut(
                &mut regs as *mut GpRegsX64 as *mut u8,
                std::mem::size_of::<GpRegsX64>(),
            )
        };
        self.os.get_regs_raw(tid, buf)?;
        Ok(regs)
    }

    fn read_gp_x86(&self, tid: Tid) -> Result<GpRegsX86> {
        let mut regs = GpRegsX86::default();
        let buf = unsafe {
            std::slice::from_raw_parts_mut(
                &mut regs as *mut GpRegsX86 as *mut u8,
                std::mem::size_of::<GpRegsX86>(),
            )
        };
        self.os.get_regs_raw(tid, buf)?;
        Ok(regs)
    }

    fn write_gp_x64(&self, tid: Tid, regs: &GpRegsX64) -> Result<()> {
        let buf = unsafe {
            std::slice::from_raw_parts(
                regs as *const GpRegsX64 as *const u8,
                std::mem::size_of::<GpRegsX64>(),
            )
        };
        self.os.set_regs_raw(tid, buf)
    }

    fn write_gp_x86(&self, tid: Tid, regs: &GpRegsX86) -> Result<()> {
        let buf = unsafe {
            std::slice::from_raw_parts(
                regs as *const GpRegsX86 as *const u8,
                std::mem::size_of::<GpRegsX86>(),
            )
        };
        self.os.set_regs_raw(tid, buf)
    }

    fn read_fpregs(&self, tid: Tid) -> Result<FpRegs> {
        let mut fp = FpRegs::default();
        let buf = unsafe {
            std::slice::from_raw_parts_mut(&mut fp as *mut FpRegs as *mut u8, std::mem::size_of::<FpRegs>())
        };
        self.os.get_fpregs_raw(tid, buf)?;
        Ok(fp)
    }

    fn write_fpregs(&self, tid: Tid, fp: &FpRegs) -> Result<()> {
        let buf = unsafe {
            std::slice::from_raw_parts(fp as *const FpRegs as *const u8, std::mem::size_of::<FpRegs>())
        };
        self.os.set_fpregs_raw(tid, buf)
    }
}

impl RegisterBank for ProcessController {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn get_state(&self) -> Result<RegistersSnapshot> {
        ProcessController::get_state(self)
    }

    fn set_state(&mut self, regs: &RegistersSnapshot) -> Result<()> {
        ProcessController::set_state(self, regs)
    }
}


/// Properties that can only be observed against a real tracee. These fork
/// an actual child, so they only run on the BSD target this core is built
/// for, and only when a human or CI job has opted in -- a sandboxed or
/// non-BSD `cargo test` run must never attempt to ptrace anything.
#[cfg(all(test, target_os = "freebsd", feature = "ptrace_integration_tests"))]
mod ptrace_integration_tests {
    use super::*;
    use std::path::PathBuf;

    fn run_enabled() -> bool {
        std::env::var("RD_CORE_RUN_PTRACE_TESTS").as_deref() == Ok("1")
    }

    #[test]
    fn spawn_and_immediate_detach_leaves_no_zombie() {
        if !run_enabled() {
            return;
        }
        crate::test_support::init_logging();
        let mut controller = ProcessController::new(DebuggerConfig::default());
        controller
            .open(&PathBuf::from("/bin/true"), None, &[], None)
            .unwrap();
        assert_eq!(controller.state(), ControllerState::AttachedStopped);
        controller.detach().unwrap();
        assert_eq!(controller.state(), ControllerState::Detached);
        assert_eq!(controller.pid(), None);
    }

    #[test]
    fn register_snapshot_round_trips_through_a_live_tracee() {
        if !run_enabled() {
            return;
        }
        let mut controller = ProcessController::new(DebuggerConfig::default());
        controller
            .open(&PathBuf::from("/bin/sleep"), None, &["5".to_string()], None)
            .unwrap();
        let mut regs = controller.get_state().unwrap();
        let ip = regs.ip();
        regs.set_ip(ip);
        controller.set_state(&regs).unwrap();
        let round_tripped = controller.get_state().unwrap();
        assert!(round_tripped.eq_ignoring_segment_bases(&regs));
        controller.kill().unwrap();
    }

    #[test]
    fn memory_word_round_trips_through_a_live_tracee() {
        if !run_enabled() {
            return;
        }
        let mut controller = ProcessController::new(DebuggerConfig::default());
        controller
            .open(&PathBuf::from("/bin/sleep"), None, &["5".to_string()], None)
            .unwrap();
        let sp = controller.get_state().unwrap().stack_pointer();
        let original = controller.read_word(sp).unwrap();
        controller.write_word(sp, 0x4142_4344_4546_4748).unwrap();
        assert_eq!(controller.read_word(sp).unwrap(), 0x4142_4344_4546_4748);
        controller.write_word(sp, original).unwrap();
        controller.kill().unwrap();
    }

    #[test]
    fn wait_event_times_out_with_no_pending_event() {
        if !run_enabled() {
            return;
        }
        let mut controller = ProcessController::new(DebuggerConfig::default());
        controller
            .open(&PathBuf::from("/bin/sleep"), None, &["5".to_string()], None)
            .unwrap();
        controller.resume(Disposition::Continue).unwrap();
        let start = std::time::Instant::now();
        let result = controller.wait_event(50);
        let elapsed = start.elapsed();
        assert!(matches!(result, Err(CoreError::Timeout)));
        assert!(elapsed.as_millis() >= 50 && elapsed.as_millis() < 200);
        controller.kill().unwrap();
    }
}
