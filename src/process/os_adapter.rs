//! OS adapter (component A): the only module that talks to the kernel.
//!
//! Every other module reaches the host exclusively through this adapter,
//! so this is the single place that has to know the BSD ptrace opcode
//! numbers, the kvm-style process enumeration call, and the page size
//! query. Every function either returns a success value or surfaces the
//! OS error code unchanged: this adapter never retries a syscall and never
//! writes to stdio on error (diagnostics go through `log`).

use crate::address::{Address, Pid, Tid};
use crate::error::{CoreError, Result};
use crate::process::wait_status::RawWaitStatus;
use nix::sys::signal::Signal;
use nix::unistd::ForkResult;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, Instant};

/// The ptrace request opcodes this adapter issues, independent of the raw
/// numeric value assigned by any one BSD. See `ptrace_request_number`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PtraceOp {
    TraceMe,
    Attach,
    Detach,
    Continue,
    Kill,
    SingleStep,
    GetRegs,
    SetRegs,
    GetFpRegs,
    SetFpRegs,
    ReadData,
    WriteData,
}

#[cfg(target_os = "freebsd")]
fn ptrace_request_number(op: PtraceOp) -> libc::c_int {
    match op {
        PtraceOp::TraceMe => libc::PT_TRACE_ME,
        PtraceOp::Attach => libc::PT_ATTACH,
        PtraceOp::Detach => libc::PT_DETACH,
        PtraceOp::Continue => libc::PT_CONTINUE,
        PtraceOp::Kill => libc::PT_KILL,
        PtraceOp::SingleStep => libc::PT_STEP,
        PtraceOp::GetRegs => libc::PT_GETREGS,
        PtraceOp::SetRegs => libc::PT_SETREGS,
        PtraceOp::GetFpRegs => libc::PT_GETFPREGS,
        PtraceOp::SetFpRegs => libc::PT_SETFPREGS,
        PtraceOp::ReadData => libc::PT_READ_D,
        PtraceOp::WriteData => libc::PT_WRITE_D,
    }
}

// NetBSD/OpenBSD/DragonFly assign the same request numbers as FreeBSD for
// the subset this adapter uses (they share a common ptrace.h ancestry);
// a port to one of those hosts that finds a divergent opcode only needs to
// extend this match, not restructure the adapter.
#[cfg(not(target_os = "freebsd"))]
fn ptrace_request_number(op: PtraceOp) -> libc::c_int {
    match op {
        PtraceOp::TraceMe => 0,
        PtraceOp::ReadData => 2,
        PtraceOp::WriteData => 5,
        PtraceOp::Continue => 7,
        PtraceOp::Kill => 8,
        PtraceOp::SingleStep => 9,
        PtraceOp::Attach => 10,
        PtraceOp::Detach => 11,
        PtraceOp::GetRegs => 33,
        PtraceOp::SetRegs => 34,
        PtraceOp::GetFpRegs => 35,
        PtraceOp::SetFpRegs => 36,
    }
}

/// Raw `ptrace(2)` call. Infallible requests (the ones the adapter only
/// ever issues against a tracee it knows is stopped) go through `xptrace`;
/// this is the fallible primitive underneath both.
unsafe fn raw_ptrace(op: PtraceOp, pid: Pid, addr: *mut libc::c_void, data: *mut libc::c_void) -> i64 {
    libc::ptrace(ptrace_request_number(op), pid.raw(), addr as *mut i8, data as i64) as i64
}

pub struct ProcessInfo {
    pub pid: Pid,
    pub uid: u32,
    pub name: String,
}

pub struct OsAdapter;

impl OsAdapter {
    pub fn new() -> OsAdapter {
        OsAdapter
    }

    pub fn page_size(&self) -> usize {
        // sysconf(_SC_PAGESIZE): never fails in practice on a BSD host, but
        // fall back to the universal default rather than panicking if it
        // somehow does.
        let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if value > 0 {
            value as usize
        } else {
            4096
        }
    }

    /// Forks, self-traces and execs in the child. On the parent side,
    /// returns the child's pid without waiting -- the caller (the process
    /// controller) performs the first blocking wait itself so it can
    /// validate the post-exec stop.
    ///
    /// # Safety invariant in the child
    /// The child installs `PTRACE_TRACEME`, optionally redirects stdio to
    /// `tty`, then execs. On exec failure the child calls `_exit`
    /// immediately -- it never returns to the caller's stack.
    pub fn spawn_traced(
        &self,
        path: &Path,
        cwd: Option<&Path>,
        argv: &[String],
        tty: Option<&Path>,
    ) -> Result<Pid> {
        match unsafe { nix::unistd::fork() }.map_err(CoreError::os)? {
            ForkResult::Child => {
                // Never return across this boundary: any failure past this
                // point ends the child via _exit, not via unwinding back
                // into the parent's control flow.
                child_exec_or_die(path, cwd, argv, tty);
            }
            ForkResult::Parent { child } => Ok(Pid(child.as_raw())),
        }
    }

    pub fn attach(&self, pid: Pid) -> Result<()> {
        let ret = unsafe { raw_ptrace(PtraceOp::Attach, pid, std::ptr::null_mut(), std::ptr::null_mut()) };
        if ret < 0 {
            return Err(CoreError::from_errno());
        }
        Ok(())
    }

    pub fn detach(&self, pid: Pid) -> Result<()> {
        let ret = unsafe { raw_ptrace(PtraceOp::Detach, pid, std::ptr::null_mut(), std::ptr::null_mut()) };
        if ret < 0 {
            return Err(CoreError::from_errno());
        }
        Ok(())
    }

    pub fn kill(&self, pid: Pid) -> Result<()> {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid.raw()), Signal::SIGKILL)
            .map_err(CoreError::os)?;
        // Reap the zombie so the OS doesn't accumulate one per killed debuggee.
        let _ = self.waitpid_blocking(pid);
        Ok(())
    }

    pub fn send_sigstop(&self, tid: Tid) -> Result<()> {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(tid.raw()), Signal::SIGSTOP)
            .map_err(CoreError::os)
    }

    pub fn cont(&self, tid: Tid, signal: i32) -> Result<()> {
        let ret = unsafe {
            raw_ptrace(
                PtraceOp::Continue,
                tid.as_pid(),
                1 as *mut libc::c_void,
                signal as *mut libc::c_void,
            )
        };
        if ret < 0 {
            return Err(CoreError::from_errno());
        }
        Ok(())
    }

    pub fn single_step(&self, tid: Tid, signal: i32) -> Result<()> {
        let ret = unsafe {
            raw_ptrace(
                PtraceOp::SingleStep,
                tid.as_pid(),
                1 as *mut libc::c_void,
                signal as *mut libc::c_void,
            )
        };
        if ret < 0 {
            return Err(CoreError::from_errno());
        }
        Ok(())
    }

    /// Reads one machine word at `address`. No byte assembly here: callers
    /// stitch arbitrary ranges one layer up.
    pub fn read_word(&self, tid: Tid, address: Address) -> Result<u64> {
        nix::errno::Errno::clear();
        let ret = unsafe {
            raw_ptrace(
                PtraceOp::ReadData,
                tid.as_pid(),
                address.0 as *mut libc::c_void,
                std::ptr::null_mut(),
            )
        };
        if ret == -1 && nix::errno::Errno::last() != nix::errno::Errno::UnknownErrno {
            return Err(CoreError::AddressUnmapped(address));
        }
        Ok(ret as u64)
    }

    /// Overwrites the entire machine word at `address`.
    pub fn write_word(&self, tid: Tid, address: Address, value: u64) -> Result<()> {
        let ret = unsafe {
            raw_ptrace(
                PtraceOp::WriteData,
                tid.as_pid(),
                address.0 as *mut libc::c_void,
                value as *mut libc::c_void,
            )
        };
        if ret < 0 {
            return Err(CoreError::AddressUnmapped(address));
        }
        Ok(())
    }

    pub fn get_regs_raw(&self, tid: Tid, buf: &mut [u8]) -> Result<()> {
        let ret = unsafe {
            raw_ptrace(
                PtraceOp::GetRegs,
                tid.as_pid(),
                buf.as_mut_ptr() as *mut libc::c_void,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(CoreError::from_errno());
        }
        Ok(())
    }

    pub fn set_regs_raw(&self, tid: Tid, buf: &[u8]) -> Result<()> {
        let ret = unsafe {
            raw_ptrace(
                PtraceOp::SetRegs,
                tid.as_pid(),
                buf.as_ptr() as *mut libc::c_void,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(CoreError::from_errno());
        }
        Ok(())
    }

    pub fn get_fpregs_raw(&self, tid: Tid, buf: &mut [u8]) -> Result<()> {
        let ret = unsafe {
            raw_ptrace(
                PtraceOp::GetFpRegs,
                tid.as_pid(),
                buf.as_mut_ptr() as *mut libc::c_void,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(CoreError::from_errno());
        }
        Ok(())
    }

    pub fn set_fpregs_raw(&self, tid: Tid, buf: &[u8]) -> Result<()> {
        let ret = unsafe {
            raw_ptrace(
                PtraceOp::SetFpRegs,
                tid.as_pid(),
                buf.as_ptr() as *mut libc::c_void,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(CoreError::from_errno());
        }
        Ok(())
    }

    /// Blocking `waitpid`, used only by `kill`'s zombie reap and by the
    /// initial post-exec wait in `open`.
    pub fn waitpid_blocking(&self, pid: Pid) -> Result<(Tid, RawWaitStatus)> {
        let mut raw_status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(pid.raw(), &mut raw_status, 0) };
        if ret < 0 {
            return Err(CoreError::from_errno());
        }
        Ok((Tid(ret), RawWaitStatus::new(raw_status)))
    }

    /// Waits for any thread of the attached process to change state,
    /// polling at `poll_interval_ms` granularity and returning `timed_out
    /// = true` once `timeout_ms` has elapsed, with no more than one poll
    /// interval of overshoot.
    pub fn waitpid_timeout(
        &self,
        pid: Pid,
        timeout_ms: u64,
        poll_interval_ms: u64,
    ) -> Result<(Tid, RawWaitStatus, bool)> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let poll_interval = Duration::from_millis(poll_interval_ms.max(1));
        loop {
            let mut raw_status: libc::c_int = 0;
            // -pid: wait for any thread in the process group / thread group.
            let ret = unsafe { libc::waitpid(-pid.raw(), &mut raw_status, libc::WNOHANG) };
            if ret < 0 {
                return Err(CoreError::from_errno());
            }
            if ret > 0 {
                return Ok((Tid(ret), RawWaitStatus::new(raw_status), false));
            }
            if Instant::now() >= deadline {
                return Ok((Tid(pid.raw()), RawWaitStatus::default(), true));
            }
            std::thread::sleep(poll_interval.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    pub fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>> {
        kvm::enumerate_processes()
    }

    /// The memory view's region enumeration, backed by `libutil`'s
    /// `kinfo_getvmmap`, which mallocs a snapshot array the caller owns and
    /// must free -- handled entirely inside `vmmap`.
    pub fn enumerate_regions(&self, pid: Pid) -> Result<Vec<crate::process::region::Region>> {
        vmmap::enumerate_regions(pid)
    }

    /// Copies the executable path of `pid` out of the transient kvm query
    /// handle before that handle is closed; the returned `String` owns its
    /// bytes and does not reference the handle.
    pub fn process_exe(&self, pid: Pid) -> Result<String> {
        kvm::process_exe(pid)
    }

    /// The parent pid of `pid`. A query that comes back with zero matching
    /// processes is treated as `OsError`, never as "no parent": a live
    /// process is always present in its own listing.
    pub fn parent_pid(&self, pid: Pid) -> Result<Pid> {
        kvm::parent_pid(pid)
    }
}

impl Default for OsAdapter {
    fn default() -> Self {
        OsAdapter::new()
    }
}

fn child_exec_or_die(path: &Path, cwd: Option<&Path>, argv: &[String], tty: Option<&Path>) -> ! {
    // install self-trace before anything else so the parent's first wait
    // observes the post-exec SIGTRAP and not a race.
    let traceme = unsafe { raw_ptrace(PtraceOp::TraceMe, Pid(0), std::ptr::null_mut(), std::ptr::null_mut()) };
    if traceme < 0 {
        unsafe { libc::_exit(127) };
    }

    if let Some(tty) = tty {
        if let Ok(tty_cstr) = CString::new(tty.as_os_str().to_string_lossy().as_bytes()) {
            let fd = unsafe { libc::open(tty_cstr.as_ptr(), libc::O_RDWR) };
            if fd >= 0 {
                redirect_stdio(fd);
            }
        }
    }

    if let Some(cwd) = cwd {
        if let Ok(cwd_cstr) = CString::new(cwd.as_os_str().to_string_lossy().as_bytes()) {
            unsafe { libc::chdir(cwd_cstr.as_ptr()) };
        }
    }

    let path_cstr = match CString::new(path.as_os_str().to_string_lossy().as_bytes()) {
        Ok(s) => s,
        Err(_) => unsafe { libc::_exit(127) },
    };
    let mut argv_cstrings: Vec<CString> = Vec::with_capacity(argv.len() + 1);
    argv_cstrings.push(path_cstr.clone());
    for arg in argv {
        match CString::new(arg.as_bytes()) {
            Ok(s) => argv_cstrings.push(s),
            Err(_) => unsafe { libc::_exit(127) },
        }
    }
    let mut argv_ptrs: Vec<*const libc::c_char> = argv_cstrings.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    unsafe {
        libc::execv(path_cstr.as_ptr(), argv_ptrs.as_ptr());
        // execv only returns on failure.
        libc::_exit(127);
    }
}

fn redirect_stdio(fd: RawFd) {
    unsafe {
        libc::dup2(fd, libc::STDIN_FILENO);
        libc::dup2(fd, libc::STDOUT_FILENO);
        libc::dup2(fd, libc::STDERR_FILENO);
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }
}

/// The host's kvm-style process enumeration, isolated in its own
/// sub-module since it's the one piece of this adapter that talks to a
/// query handle with a lifetime shorter than the data it reports.
mod kvm {
    use super::*;

    #[link(name = "kvm")]
    extern "C" {
        fn kvm_openfiles(
            execfile: *const libc::c_char,
            corefile: *const libc::c_char,
            swapfile: *const libc::c_char,
            flags: libc::c_int,
            errbuf: *mut libc::c_char,
        ) -> *mut libc::c_void;
        fn kvm_close(kd: *mut libc::c_void) -> libc::c_int;
        fn kvm_getprocs(
            kd: *mut libc::c_void,
            op: libc::c_int,
            arg: libc::c_int,
            cnt: *mut libc::c_int,
        ) -> *mut RawKinfoProc;
    }

    // The subset of FreeBSD's `struct kinfo_proc` (<sys/user.h>) this
    // adapter reads. Trailing kernel-private fields are intentionally not
    // modeled; `ki_structsize` (first field) tells the kernel how much of
    // the struct it's allowed to fill in, so reading only the fields named
    // here is safe regardless of kernel minor-version skew.
    #[repr(C)]
    struct RawKinfoProc {
        ki_structsize: i32,
        ki_layout: i32,
        _ptrs: [u64; 8],
        ki_pid: i32,
        ki_ppid: i32,
        ki_pgid: i32,
        ki_tpgid: i32,
        ki_sid: i32,
        ki_tsid: i32,
        ki_jobc: i16,
        _pad0: i16,
        ki_tdev: u32,
        _sigsets: [u64; 8],
        ki_uid: u32,
        ki_ruid: u32,
        ki_svuid: u32,
        ki_rgid: u32,
        ki_svgid: u32,
        ki_ngroups: i16,
        _pad1: i16,
        ki_groups: [u32; 16],
        _rest: [u8; 512],
        ki_comm: [libc::c_char; 20],
        _tail: [u8; 256],
    }

    const KERN_PROC_PID: libc::c_int = 1;
    const KVM_OPEN_FLAG_READ_ONLY: libc::c_int = libc::O_RDONLY;

    struct KvmHandle(*mut libc::c_void);

    impl KvmHandle {
        fn open() -> Result<KvmHandle> {
            let mut errbuf = [0 as libc::c_char; 1024];
            let kd = unsafe {
                kvm_openfiles(
                    std::ptr::null(),
                    std::ptr::null(),
                    std::ptr::null(),
                    KVM_OPEN_FLAG_READ_ONLY,
                    errbuf.as_mut_ptr(),
                )
            };
            if kd.is_null() {
                return Err(CoreError::from_errno());
            }
            Ok(KvmHandle(kd))
        }
    }

    impl Drop for KvmHandle {
        fn drop(&mut self) {
            unsafe {
                kvm_close(self.0);
            }
        }
    }

    fn comm_to_string(comm: &[libc::c_char]) -> String {
        let bytes: Vec<u8> = comm
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn enumerate_processes() -> Result<Vec<ProcessInfo>> {
        let handle = KvmHandle::open()?;
        let mut count: libc::c_int = 0;
        let procs = unsafe { kvm_getprocs(handle.0, 0 /* KERN_PROC_ALL */, 0, &mut count) };
        if procs.is_null() || count < 0 {
            return Err(CoreError::from_errno());
        }
        let slice = unsafe { std::slice::from_raw_parts(procs, count as usize) };
        // Every field we keep is copied out of the kernel-owned slice here;
        // the slice (and the handle it came from) does not outlive this
        // function, so nothing borrows from it afterward.
        let out = slice
            .iter()
            .map(|p| ProcessInfo {
                pid: Pid(p.ki_pid),
                uid: p.ki_uid,
                name: comm_to_string(&p.ki_comm),
            })
            .collect();
        Ok(out)
    }

    pub fn process_exe(pid: Pid) -> Result<String> {
        let handle = KvmHandle::open()?;
        let mut count: libc::c_int = 0;
        let procs = unsafe { kvm_getprocs(handle.0, KERN_PROC_PID, pid.raw(), &mut count) };
        if procs.is_null() || count == 0 {
            return Err(CoreError::from_errno());
        }
        let entry = unsafe { &*procs };
        // Copy-out rule: `comm_to_string` allocates an owned `String` right
        // here, before `handle` (and the kernel buffer behind `procs`) is
        // dropped at the end of this function.
        Ok(comm_to_string(&entry.ki_comm))
    }

    pub fn parent_pid(pid: Pid) -> Result<Pid> {
        let handle = KvmHandle::open()?;
        let mut count: libc::c_int = 0;
        let procs = unsafe { kvm_getprocs(handle.0, KERN_PROC_PID, pid.raw(), &mut count) };
        if procs.is_null() || count == 0 {
            // A live process is always present in its own listing; an empty
            // result means the query itself failed, not "no parent".
            return Err(CoreError::from_errno());
        }
        let entry = unsafe { &*procs };
        Ok(Pid(entry.ki_ppid))
    }
}

/// FreeBSD's `libutil` process-memory-map snapshot. One malloc'd array per
/// call; we copy every field we need into owned `Region`s and free the
/// array before returning.
mod vmmap {
    use super::*;
    use crate::process::region::{Permissions, Region};

    #[link(name = "util")]
    extern "C" {
        fn kinfo_getvmmap(pid: libc::pid_t, cntp: *mut libc::c_int) -> *mut RawKinfoVmentry;
    }

    const KVME_PROT_READ: i32 = 0x01;
    const KVME_PROT_WRITE: i32 = 0x02;
    const KVME_PROT_EXEC: i32 = 0x04;

    #[repr(C)]
    struct RawKinfoVmentry {
        kve_structsize: i32,
        kve_type: i32,
        kve_start: u64,
        kve_end: u64,
        kve_offset: u64,
        kve_vn_fileid: u64,
        kve_vn_fsid_freebsd11: u32,
        kve_flags: i32,
        kve_resident: i32,
        kve_private_resident: i32,
        kve_protection: i32,
        kve_ref_count: i32,
        kve_shadow_count: i32,
        kve_vn_type: i32,
        kve_vn_size: u64,
        kve_vn_fsid: u64,
        kve_vn_rdev: u64,
        kve_vn_mode: u16,
        kve_status: u16,
        _spare: [i32; 12],
        kve_path: [libc::c_char; 1024],
    }

    pub fn enumerate_regions(pid: Pid) -> Result<Vec<Region>> {
        let mut count: libc::c_int = 0;
        let entries = unsafe { kinfo_getvmmap(pid.raw(), &mut count) };
        if entries.is_null() {
            return Err(CoreError::from_errno());
        }
        let slice = unsafe { std::slice::from_raw_parts(entries, count.max(0) as usize) };
        let regions = slice
            .iter()
            .map(|e| {
                let mut perms = Permissions::empty();
                if e.kve_protection & KVME_PROT_READ != 0 {
                    perms |= Permissions::READ;
                }
                if e.kve_protection & KVME_PROT_WRITE != 0 {
                    perms |= Permissions::WRITE;
                }
                if e.kve_protection & KVME_PROT_EXEC != 0 {
                    perms |= Permissions::EXECUTE;
                }
                let name_bytes: Vec<u8> = e
                    .kve_path
                    .iter()
                    .take_while(|&&c| c != 0)
                    .map(|&c| c as u8)
                    .collect();
                Region {
                    start: Address::new(e.kve_start),
                    end: Address::new(e.kve_end),
                    base: e.kve_offset,
                    name: String::from_utf8_lossy(&name_bytes).into_owned(),
                    permissions: perms,
                }
            })
            .collect();
        unsafe { libc::free(entries as *mut libc::c_void) };
        Ok(regions)
    }
}
