//! Graduated termination of job processes.
//!
//! Every termination attempt walks the same fallback chain: signal the process
//! group, and if that fails, signal the process directly. Failures at the end of
//! the chain are logged and swallowed. Exit is never polled here; the launcher
//! reports it to the registry.

use serde::Serialize;
use std::sync::Arc;

use crate::error::SignalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub pid: u32,
    /// Group id when the job was started in its own process group.
    pub pgid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NoProcess,
    Attached(ProcessHandle),
    Stopping(ProcessHandle),
    Exited,
}

impl ProcessState {
    pub fn handle(&self) -> Option<ProcessHandle> {
        match self {
            ProcessState::Attached(h) | ProcessState::Stopping(h) => Some(*h),
            ProcessState::NoProcess | ProcessState::Exited => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Group,
    Direct,
    Failed,
}

pub trait Signaller: Send + Sync {
    fn signal_group(&self, pgid: u32, how: Termination) -> Result<(), SignalError>;
    fn signal_process(&self, pid: u32, how: Termination) -> Result<(), SignalError>;
}

#[derive(Clone)]
pub struct ProcessController {
    signaller: Arc<dyn Signaller>,
}

impl ProcessController {
    pub fn new(signaller: Arc<dyn Signaller>) -> Self {
        Self { signaller }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemSignaller))
    }

    pub fn terminate(&self, handle: ProcessHandle, how: Termination) -> Delivery {
        let pgid = handle.pgid.unwrap_or(handle.pid);
        let group_err = match self.signaller.signal_group(pgid, how) {
            Ok(()) => return Delivery::Group,
            Err(e) => e,
        };
        tracing::debug!(pid = handle.pid, pgid, ?how, error = %group_err, "group signal failed, signalling process");
        match self.signaller.signal_process(handle.pid, how) {
            Ok(()) => Delivery::Direct,
            Err(e) => {
                tracing::warn!(pid = handle.pid, ?how, error = %e, "termination signal not delivered");
                Delivery::Failed
            }
        }
    }
}

pub struct SystemSignaller;

#[cfg(unix)]
impl SystemSignaller {
    fn pid(raw: u32) -> Result<nix::unistd::Pid, SignalError> {
        let raw = i32::try_from(raw).map_err(|_| SignalError::BadPid(raw))?;
        Ok(nix::unistd::Pid::from_raw(raw))
    }

    fn signal(how: Termination) -> nix::sys::signal::Signal {
        match how {
            Termination::Graceful => nix::sys::signal::Signal::SIGTERM,
            Termination::Forced => nix::sys::signal::Signal::SIGKILL,
        }
    }
}

#[cfg(unix)]
impl Signaller for SystemSignaller {
    fn signal_group(&self, pgid: u32, how: Termination) -> Result<(), SignalError> {
        nix::sys::signal::killpg(Self::pid(pgid)?, Self::signal(how))?;
        Ok(())
    }

    fn signal_process(&self, pid: u32, how: Termination) -> Result<(), SignalError> {
        nix::sys::signal::kill(Self::pid(pid)?, Self::signal(how))?;
        Ok(())
    }
}

#[cfg(not(unix))]
impl Signaller for SystemSignaller {
    fn signal_group(&self, _pgid: u32, _how: Termination) -> Result<(), SignalError> {
        Err(SignalError::Unsupported)
    }

    fn signal_process(&self, _pid: u32, _how: Termination) -> Result<(), SignalError> {
        Err(SignalError::Unsupported)
    }
}

/// Records every signal attempt; used by tests across the crate.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Sent {
        Group(u32, Termination),
        Process(u32, Termination),
    }

    #[derive(Default)]
    pub struct RecordingSignaller {
        pub fail_group: bool,
        pub fail_process: bool,
        pub sent: Mutex<Vec<Sent>>,
    }

    impl RecordingSignaller {
        pub fn sent(&self) -> Vec<Sent> {
            self.sent.lock().clone()
        }
    }

    impl Signaller for RecordingSignaller {
        fn signal_group(&self, pgid: u32, how: Termination) -> Result<(), SignalError> {
            self.sent.lock().push(Sent::Group(pgid, how));
            if self.fail_group { Err(SignalError::Unsupported) } else { Ok(()) }
        }

        fn signal_process(&self, pid: u32, how: Termination) -> Result<(), SignalError> {
            self.sent.lock().push(Sent::Process(pid, how));
            if self.fail_process { Err(SignalError::Unsupported) } else { Ok(()) }
        }
    }
}
