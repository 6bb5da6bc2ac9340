use parking_lot::Mutex;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Answers whether a process id still belongs to a running process.
pub trait ProcessProbe: Send + Sync {
    /// True while `pid` is alive and not a zombie.
    fn is_alive(&self, pid: u32) -> bool;
}

/// [`ProcessProbe`] backed by the OS process table via `sysinfo`.
pub struct SysinfoProcessProbe {
    system: Mutex<System>,
}

impl SysinfoProcessProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .unwrap_or(false)
    }
}
