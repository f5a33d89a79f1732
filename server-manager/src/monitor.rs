use sysinfo::{Pid, System};

/// Samples process statistics straight from the OS.
pub struct ServerMonitor {
    system: System,
}

impl ServerMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Resident memory of `pid` in MB, or `None` if the process is gone.
    pub fn resident_memory_mb(&mut self, pid: u32) -> Option<u64> {
        self.system.refresh_all();

        let process = self.system.process(Pid::from_u32(pid))?;
        Some(process.memory() / 1024 / 1024)
    }
}

impl Default for ServerMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_own_process() {
        let mut monitor = ServerMonitor::new();
        assert!(monitor.resident_memory_mb(std::process::id()).is_some());
    }

    #[test]
    fn missing_process_yields_none() {
        let mut monitor = ServerMonitor::new();
        assert_eq!(monitor.resident_memory_mb(u32::MAX - 1), None);
    }
}
