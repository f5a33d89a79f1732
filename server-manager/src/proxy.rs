//! Keeps the BungeeCord proxy's server list and listen port in line with the
//! fleet, restarting the proxy whenever either changes.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::process::{LaunchSpec, ProcessEvent, ServerProcess};

pub const PROXY_JAR: &str = "BungeeCord.jar";
pub const PROXY_CONFIG: &str = "config.yml";

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyTarget {
    pub name: String,
    pub port: u16,
}

/// Desired proxy state: where to listen and what to route to.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyPlan {
    pub listen_port: u16,
    pub servers: Vec<ProxyTarget>,
}

fn yaml_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn render_config(plan: &ProxyPlan) -> String {
    let priority = plan
        .servers
        .first()
        .map(|s| yaml_quote(&s.name))
        .unwrap_or_else(|| "lobby".to_string());

    let servers = if plan.servers.is_empty() {
        "servers: {}\n".to_string()
    } else {
        let entries: String = plan
            .servers
            .iter()
            .map(|s| {
                format!(
                    "  {name}:\n    motd: {name}\n    address: localhost:{port}\n    restricted: false\n",
                    name = yaml_quote(&s.name),
                    port = s.port
                )
            })
            .collect();
        format!("servers:\n{}", entries)
    };

    format!(
        "listeners:
- query_port: 25577
  motd: '&6MineManager Network'
  priorities:
  - {priority}
  bind_local_address: true
  host: 0.0.0.0:{port}
  max_players: 100
  tab_size: 60
  force_default_server: false
  forced_hosts: {{}}
remote_ping_cache: -1
network_compression_threshold: 256
permissions: {{}}
timeout: 30000
log_pings: true
player_limit: -1
ip_forward: true
online_mode: false
remote_ping_timeout: 5000
{servers}",
        priority = priority,
        port = plan.listen_port,
        servers = servers
    )
}

struct RunningProxy {
    generation: u64,
    process: ServerProcess,
}

#[derive(Default)]
struct ProxySlot {
    running: Option<RunningProxy>,
    generation: u64,
}

pub struct ProxyReconciler {
    dir: PathBuf,
    java_path: PathBuf,
    memory_mb: u32,
    restart_delay: Duration,
    desired: watch::Sender<Option<ProxyPlan>>,
    slot: Arc<Mutex<ProxySlot>>,
}

impl ProxyReconciler {
    pub fn new(dir: PathBuf, java_path: PathBuf, memory_mb: u32, restart_delay: Duration) -> Arc<Self> {
        let (desired, _) = watch::channel(None);
        Arc::new(Self {
            dir,
            java_path,
            memory_mb,
            restart_delay,
            desired,
            slot: Arc::new(Mutex::new(ProxySlot::default())),
        })
    }

    /// Records the new desired state. The background task picks it up;
    /// requests arriving during a restart are coalesced into the next one.
    pub fn request(&self, plan: ProxyPlan) {
        self.desired.send_replace(Some(plan));
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut rx = self.desired.subscribe();
        tokio::spawn(async move {
            let initial = rx.borrow_and_update().clone();
            if let Some(plan) = initial {
                this.apply(&plan).await;
            }
            while rx.changed().await.is_ok() {
                let plan = rx.borrow_and_update().clone();
                if let Some(plan) = plan {
                    this.apply(&plan).await;
                }
            }
        })
    }

    /// Rewrites the config and restarts the proxy. Never fails the caller:
    /// a missing proxy install is logged and skipped.
    pub async fn apply(&self, plan: &ProxyPlan) {
        if !fs::try_exists(&self.dir).await.unwrap_or(false) {
            tracing::debug!("No proxy directory at {:?}, skipping reconciliation", self.dir);
            return;
        }
        if let Err(e) = self.write_config(plan).await {
            tracing::error!("Failed to write proxy config: {:#}", e);
            return;
        }
        self.restart().await;
    }

    async fn write_config(&self, plan: &ProxyPlan) -> Result<()> {
        let path = self.dir.join(PROXY_CONFIG);
        fs::write(&path, render_config(plan))
            .await
            .with_context(|| format!("Failed to write {:?}", path))
    }

    async fn restart(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(mut running) = slot.running.take() {
            tracing::info!("Restarting proxy (pid {})", running.process.pid());
            running.process.kill();
            tokio::time::sleep(self.restart_delay).await;
        }

        let jar = self.dir.join(PROXY_JAR);
        if !fs::try_exists(&jar).await.unwrap_or(false) {
            tracing::info!("BungeeCord not found, skipping proxy start");
            return;
        }

        let spec = LaunchSpec {
            program: self.java_path.clone(),
            args: vec![
                format!("-Xmx{}M", self.memory_mb),
                "-jar".to_string(),
                PROXY_JAR.to_string(),
            ],
            working_dir: self.dir.clone(),
        };
        let (process, mut events) = match ServerProcess::spawn(&spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!("Failed to start proxy: {:#}", e);
                return;
            }
        };
        tracing::info!("Started BungeeCord proxy (pid {})", process.pid());

        slot.generation += 1;
        let generation = slot.generation;
        slot.running = Some(RunningProxy { generation, process });
        drop(slot);

        let slot = self.slot.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Stdout(line) => tracing::info!(target: "proxy", "{}", line),
                    ProcessEvent::Stderr(line) => tracing::warn!(target: "proxy", "{}", line),
                    ProcessEvent::Exited(code) => {
                        tracing::info!("BungeeCord exited with code {:?}", code);
                        let mut slot = slot.lock().await;
                        if slot.running.as_ref().map(|r| r.generation) == Some(generation) {
                            slot.running = None;
                        }
                    }
                }
            }
        });
    }

    pub async fn pid(&self) -> Option<u32> {
        self.slot.lock().await.running.as_ref().map(|r| r.process.pid())
    }

    pub async fn shutdown(&self) {
        if let Some(mut running) = self.slot.lock().await.running.take() {
            running.process.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(port: u16, servers: &[(&str, u16)]) -> ProxyPlan {
        ProxyPlan {
            listen_port: port,
            servers: servers
                .iter()
                .map(|(name, port)| ProxyTarget {
                    name: name.to_string(),
                    port: *port,
                })
                .collect(),
        }
    }

    #[test]
    fn renders_every_server_and_listen_port() {
        let yaml = render_config(&plan(25577, &[("Hub", 25565), ("Survival", 25566)]));
        assert!(yaml.contains("host: 0.0.0.0:25577"));
        assert!(yaml.contains("  - 'Hub'"));
        assert!(yaml.contains("  'Hub':\n    motd: 'Hub'\n    address: localhost:25565"));
        assert!(yaml.contains("  'Survival':\n    motd: 'Survival'\n    address: localhost:25566"));
    }

    #[test]
    fn empty_fleet_falls_back_to_lobby() {
        let yaml = render_config(&plan(25565, &[]));
        assert!(yaml.contains("  - lobby"));
        assert!(yaml.contains("servers: {}"));
    }

    #[test]
    fn quotes_are_escaped() {
        let yaml = render_config(&plan(25565, &[("Bob's", 25565)]));
        assert!(yaml.contains("'Bob''s'"));
    }

    #[tokio::test]
    async fn missing_install_is_a_noop() {
        let base = tempfile::tempdir().unwrap();
        let proxy = ProxyReconciler::new(
            base.path().join("bungeecord"),
            PathBuf::from("java"),
            512,
            Duration::from_millis(10),
        );
        proxy.apply(&plan(25565, &[("Hub", 25566)])).await;
        assert_eq!(proxy.pid().await, None);
    }

    #[tokio::test]
    async fn config_written_without_jar() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("bungeecord");
        std::fs::create_dir_all(&dir).unwrap();
        let proxy = ProxyReconciler::new(dir.clone(), PathBuf::from("java"), 512, Duration::from_millis(10));

        proxy.apply(&plan(25590, &[("Hub", 25566)])).await;

        let yaml = std::fs::read_to_string(dir.join(PROXY_CONFIG)).unwrap();
        assert!(yaml.contains("host: 0.0.0.0:25590"));
        assert_eq!(proxy.pid().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restarts_running_proxy() {
        use std::os::unix::fs::PermissionsExt;

        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("bungeecord");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(PROXY_JAR), b"jar").unwrap();
        let java = base.path().join("fake-java");
        std::fs::write(&java, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&java, std::fs::Permissions::from_mode(0o755)).unwrap();

        let proxy = ProxyReconciler::new(dir, java, 512, Duration::from_millis(10));
        proxy.apply(&plan(25565, &[])).await;
        let first = proxy.pid().await.expect("proxy started");

        proxy.apply(&plan(25566, &[])).await;
        let second = proxy.pid().await.expect("proxy restarted");
        assert_ne!(first, second);

        proxy.shutdown().await;
        assert_eq!(proxy.pid().await, None);
    }
}
