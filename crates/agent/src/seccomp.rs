//! Seccomp hardening for guest-spawned exec commands (spec §4.4, Non-goal:
//! no profile text generation — only this fixed load hook is consumed).
use libseccomp::{ScmpAction, ScmpFilterContext, ScmpSyscall, error::SeccompError};
use std::io;

fn seccomp_to_io_error(e: SeccompError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

#[derive(Debug)]
pub struct SeccompFilter;

impl SeccompFilter {
    /// Blocklist filter applied to every command this agent spawns on
    /// behalf of an instance exec request, whether interactive or not: the
    /// caller picked the argv, but it still runs with the guest's full
    /// privileges unless this trims it down. Blocks mount/reboot-class
    /// syscalls and anything that would let the exec'd process re-arrange
    /// ownership or escape the namespace it was launched in; leaves
    /// ordinary file and network I/O alone since a shell session or an
    /// arbitrary command needs both.
    pub fn apply_exec_filter() -> io::Result<()> {
        let mut filter = ScmpFilterContext::new(ScmpAction::Allow).map_err(seccomp_to_io_error)?;

        let blocked_syscalls = [
            // Privilege changes.
            "setuid",
            "setgid",
            "setreuid",
            "setregid",
            "setgroups",
            "setresuid",
            "setresgid",
            "capset",
            // Mount/namespace/system-level operations.
            "mount",
            "umount2",
            "pivot_root",
            "swapon",
            "swapoff",
            "reboot",
            "kexec_load",
            "kexec_file_load",
            // Debugging/introspection that could be used to reach outside
            // the exec'd process's own address space.
            "perf_event_open",
            "bpf",
            "ptrace",
            "process_vm_writev",
        ];

        for syscall_name in blocked_syscalls {
            filter
                .add_rule(
                    ScmpAction::Errno(libc::EPERM),
                    ScmpSyscall::from_name(syscall_name).unwrap(),
                )
                .map_err(seccomp_to_io_error)?;
        }

        filter.load().map_err(seccomp_to_io_error)?;
        Ok(())
    }
}
