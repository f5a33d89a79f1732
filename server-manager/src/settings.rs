use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the supervisor. Paths are derived from `base_dir`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub base_dir: PathBuf,
    pub java_path: PathBuf,
    /// Written into each instance's plugin config so the plugin can call back.
    pub manager_url: String,
    pub default_proxy_port: u16,
    pub telemetry_interval: Duration,
    pub tps_relax_step: f64,
    pub lock_cleanup_delay: Duration,
    pub proxy_restart_delay: Duration,
    pub proxy_memory_mb: u32,
    pub backup_sweep_interval: Duration,
    pub log_capacity: usize,
    /// Kill leftover `server.jar ... nogui` processes on startup.
    pub reap_orphans: bool,
}

impl Settings {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            java_path: PathBuf::from("java"),
            manager_url: "http://localhost:3000".to_string(),
            default_proxy_port: 25565,
            telemetry_interval: Duration::from_secs(2),
            tps_relax_step: 0.5,
            lock_cleanup_delay: Duration::from_secs(5),
            proxy_restart_delay: Duration::from_secs(2),
            proxy_memory_mb: 512,
            backup_sweep_interval: Duration::from_secs(60),
            log_capacity: 500,
            reap_orphans: true,
        }
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.base_dir.join("instances")
    }

    pub fn instance_dir(&self, id: &uuid::Uuid) -> PathBuf {
        self.instances_dir().join(id.to_string())
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base_dir.join("backups")
    }

    pub fn jars_dir(&self) -> PathBuf {
        self.base_dir.join("jars")
    }

    pub fn proxy_dir(&self) -> PathBuf {
        self.base_dir.join("bungeecord")
    }

    pub fn shared_plugins_dir(&self) -> PathBuf {
        self.base_dir.join("shared-plugins")
    }

    pub fn data_file(&self) -> PathBuf {
        self.base_dir.join("data.json")
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new("./servers")
    }
}
