//! The orchestrator: owns every server's runtime state and process, and keeps
//! the store, the proxy and observers in line with it.
//!
//! Each server sits behind its own async mutex, so operations on one server
//! are serialized while different servers proceed in parallel. A published
//! copy of every state is kept in creation order for snapshots and saving.

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::fs;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backup;
use crate::config::{self, PROPERTIES_FILE};
use crate::console::{self, ConsoleDelta};
use crate::downloader::{BinaryProvider, ProgressFn};
use crate::error::{ManagerError, Result};
use crate::fleet;
use crate::monitor::ServerMonitor;
use crate::plugins;
use crate::portal::{NewPortal, PortalRegistry, PortalUpdate};
use crate::process::{self, LaunchSpec, ProcessEvent, ServerProcess};
use crate::proxy::{ProxyPlan, ProxyReconciler, ProxyTarget};
use crate::settings::Settings;
use crate::store::{Store, StoreData};
use crate::types::*;
use crate::world;

pub const SERVER_JAR: &str = "server.jar";
const ORPHAN_SIGNATURE: [&str; 2] = [SERVER_JAR, "nogui"];
const EVENT_BUFFER: usize = 256;

/// Parameters for a new server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewServer {
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: ServerType,
    pub version: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_memory")]
    pub memory: u32,
}

fn default_port() -> u16 {
    25565
}

fn default_memory() -> u32 {
    2048
}

struct Attached {
    run_id: u64,
    process: ServerProcess,
    exited: watch::Receiver<bool>,
}

struct InstanceInner {
    state: ServerState,
    attached: Option<Attached>,
    telemetry: Option<JoinHandle<()>>,
    logs: VecDeque<String>,
    last_lag: Option<Instant>,
    runs: u64,
    deleting: bool,
}

impl InstanceInner {
    fn run_id(&self) -> Option<u64> {
        self.attached.as_ref().map(|a| a.run_id)
    }

    fn push_log(&mut self, line: String, capacity: usize) {
        while self.logs.len() >= capacity.max(1) {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    fn stop_telemetry(&mut self) {
        if let Some(handle) = self.telemetry.take() {
            handle.abort();
        }
    }
}

struct Instance {
    inner: tokio::sync::Mutex<InstanceInner>,
}

impl Instance {
    fn new(state: ServerState) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(InstanceInner {
                state,
                attached: None,
                telemetry: None,
                logs: VecDeque::new(),
                last_lag: None,
                runs: 0,
                deleting: false,
            }),
        }
    }
}

#[derive(Default)]
struct Ledger {
    backup_configs: HashMap<Uuid, BackupConfig>,
    backups: HashMap<Uuid, Vec<Backup>>,
    proxy_port: u16,
}

pub struct Supervisor {
    settings: Settings,
    provider: Arc<dyn BinaryProvider>,
    store: Store,
    instances: RwLock<HashMap<Uuid, Arc<Instance>>>,
    published: RwLock<Vec<ServerState>>,
    ledger: Mutex<Ledger>,
    reserved_ports: Mutex<HashSet<u16>>,
    portals: PortalRegistry,
    proxy: Arc<ProxyReconciler>,
    events: broadcast::Sender<FleetEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Supervisor {
    /// Prepares the directory layout, clears processes left over from a
    /// previous run, loads the store and starts the background tasks.
    pub async fn start(mut settings: Settings, provider: Arc<dyn BinaryProvider>) -> Result<Arc<Self>> {
        fs::create_dir_all(&settings.base_dir).await?;
        settings.base_dir = fs::canonicalize(&settings.base_dir).await?;
        for dir in [
            settings.instances_dir(),
            settings.backups_dir(),
            settings.jars_dir(),
            settings.shared_plugins_dir(),
        ] {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create {:?}", dir))?;
        }

        if settings.reap_orphans {
            let killed = tokio::task::spawn_blocking(|| process::reap_orphans(&ORPHAN_SIGNATURE))
                .await
                .context("Orphan cleanup panicked")?;
            if killed > 0 {
                tracing::warn!("Killed {} orphaned server processes", killed);
            }
        }

        let store = Store::new(settings.data_file());
        let data = store.load().await?;

        let mut instances = HashMap::new();
        let mut published = Vec::with_capacity(data.servers.len());
        for config in data.servers {
            let state = ServerState::new(config);
            instances.insert(state.id(), Arc::new(Instance::new(state.clone())));
            published.push(state);
        }
        tracing::info!("Loaded {} servers from {:?}", published.len(), store.path());

        let ledger = Ledger {
            backup_configs: data.backup_configs,
            backups: data.backups,
            proxy_port: data.bungeecord_port.unwrap_or(settings.default_proxy_port),
        };

        let proxy = ProxyReconciler::new(
            settings.proxy_dir(),
            settings.java_path.clone(),
            settings.proxy_memory_mb,
            settings.proxy_restart_delay,
        );
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let supervisor = Arc::new(Self {
            settings,
            provider,
            store,
            instances: RwLock::new(instances),
            published: RwLock::new(published),
            ledger: Mutex::new(ledger),
            reserved_ports: Mutex::new(HashSet::new()),
            portals: PortalRegistry::new(),
            proxy,
            events,
            tasks: Mutex::new(Vec::new()),
        });

        let proxy_task = supervisor.proxy.spawn();
        let scheduler = backup::spawn_scheduler(
            Arc::downgrade(&supervisor),
            supervisor.settings.backup_sweep_interval,
        );
        lock(&supervisor.tasks).extend([proxy_task, scheduler]);
        supervisor.reconcile_proxy();

        Ok(supervisor)
    }

    /// Asks every live server to stop, waits for them to exit, then stops
    /// the proxy and the background tasks.
    pub async fn shutdown(&self) {
        let mut waits = Vec::new();
        for instance in self.all_instances() {
            let mut inner = instance.inner.lock().await;
            let Some(attached) = &inner.attached else {
                continue;
            };
            if let Err(e) = attached.process.stop() {
                tracing::warn!("Failed to stop {}: {}", inner.state.config.name, e);
            }
            waits.push(attached.exited.clone());
            inner.state.status = ServerStatus::Stopping;
            inner.stop_telemetry();
            self.publish(&inner.state);
        }

        tracing::info!("Waiting for {} servers to stop", waits.len());
        futures::future::join_all(waits.into_iter().map(|mut rx| async move {
            let _ = rx.wait_for(|exited| *exited).await;
        }))
        .await;

        self.proxy.shutdown().await;
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    // ---- queries ----

    pub fn servers(&self) -> Vec<ServerState> {
        self.published_read().clone()
    }

    pub fn server(&self, id: Uuid) -> Result<ServerState> {
        self.published_read()
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or(ManagerError::NotFound(id))
    }

    pub fn contains_server(&self, id: &Uuid) -> bool {
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn fleet(&self) -> FleetSnapshot {
        FleetSnapshot {
            servers: self.servers(),
            server_ip: fleet::host_ip(),
            bungeecord_port: self.bungeecord_port(),
        }
    }

    pub fn available_jars(&self) -> HashMap<ServerType, Vec<String>> {
        self.provider.available_jars()
    }

    pub fn build_status(&self, server_type: ServerType, version: &str) -> Option<BuildStatus> {
        self.provider.build_status(server_type, version)
    }

    pub async fn get_logs(&self, id: Uuid) -> Result<Vec<String>> {
        let instance = self.instance(id)?;
        let inner = instance.inner.lock().await;
        Ok(inner.logs.iter().cloned().collect())
    }

    // ---- lifecycle ----

    pub async fn create_server(&self, request: NewServer) -> Result<ServerState> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(ManagerError::InvalidConfig("name must not be empty".to_string()));
        }
        if request.memory == 0 {
            return Err(ManagerError::InvalidConfig("memory must be positive".to_string()));
        }

        let port = self.reserve_port(request.port)?;
        let config = ServerConfig::new(name, request.server_type, request.version, port, request.memory);
        let result = self.provision(config).await;
        lock(&self.reserved_ports).remove(&port);

        let state = result?;
        self.save().await?;
        self.reconcile_proxy();
        Ok(state)
    }

    fn reserve_port(&self, requested: u16) -> Result<u16> {
        let mut reserved = lock(&self.reserved_ports);
        let mut used: HashSet<u16> = self.published_read().iter().map(|s| s.config.port).collect();
        used.extend(reserved.iter().copied());

        let port = fleet::allocate_port(requested, &used, fleet::port_bound)?;
        if port != requested {
            tracing::info!("Port {} is taken, using {}", requested, port);
        }
        reserved.insert(port);
        Ok(port)
    }

    /// Reserves exactly `port` for server `id`, failing if another server,
    /// a pending creation or another process already holds it.
    fn claim_port(&self, id: Uuid, port: u16) -> Result<()> {
        if port == 0 {
            return Err(ManagerError::InvalidConfig("port must be non-zero".to_string()));
        }
        let mut reserved = lock(&self.reserved_ports);
        let taken = reserved.contains(&port)
            || self
                .published_read()
                .iter()
                .any(|s| s.id() != id && s.config.port == port)
            || fleet::port_bound(port);
        if taken {
            return Err(ManagerError::PortInUse(port));
        }
        reserved.insert(port);
        Ok(())
    }

    async fn provision(&self, config: ServerConfig) -> Result<ServerState> {
        let dir = self.settings.instance_dir(&config.id);
        fs::create_dir_all(&dir).await?;

        if let Err(e) = self.prepare_instance_dir(&config, &dir).await {
            tracing::error!("Failed to create server {}: {}", config.name, e);
            if let Err(cleanup) = fs::remove_dir_all(&dir).await {
                tracing::warn!("Failed to remove {:?}: {}", dir, cleanup);
            }
            return Err(e);
        }

        let state = ServerState::new(config);
        self.instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(state.id(), Arc::new(Instance::new(state.clone())));
        self.published_write().push(state.clone());
        self.broadcast_servers();

        tracing::info!(server_id = %state.id(), "Created server {} on port {}", state.config.name, state.config.port);
        Ok(state)
    }

    async fn prepare_instance_dir(&self, config: &ServerConfig, dir: &Path) -> Result<()> {
        let events = self.events.clone();
        let (server_type, version) = (config.server_type, config.version.clone());
        let progress: ProgressFn = Arc::new(move |progress, message| {
            let _ = events.send(FleetEvent::BuildProgress {
                server_type,
                version: version.clone(),
                progress,
                message: message.to_string(),
            });
        });

        let jar = self
            .provider
            .ensure_binary(config.server_type, &config.version, progress)
            .await?;
        fs::copy(&jar, dir.join(SERVER_JAR))
            .await
            .context("Failed to copy server jar")?;
        write_eula(dir).await?;
        config::initialize_server_properties(dir, config.port).await?;
        plugins::setup_shared_plugins(
            &self.settings.shared_plugins_dir(),
            dir,
            config.id,
            &self.settings.manager_url,
        )
        .await?;
        Ok(())
    }

    /// Launches the server. Does nothing unless it is stopped with no process.
    /// A failed launch leaves the server stopped with the reason in its log.
    pub async fn start_server(self: &Arc<Self>, id: Uuid) -> Result<()> {
        let instance = self.instance(id)?;
        let mut inner = instance.inner.lock().await;
        if inner.state.status != ServerStatus::Stopped || inner.attached.is_some() || inner.deleting {
            tracing::debug!(server_id = %id, "Start ignored in state {:?}", inner.state.status);
            return Ok(());
        }

        inner.state.status = ServerStatus::Starting;
        self.publish(&inner.state);

        let dir = self.settings.instance_dir(&id);
        remove_session_lock(&dir).await;
        if let Err(e) = write_eula(&dir).await {
            tracing::warn!(server_id = %id, "Failed to write eula.txt: {}", e);
        }

        let spec = LaunchSpec::java(&self.settings.java_path, SERVER_JAR, inner.state.config.memory, &dir);
        let (process, events) = match ServerProcess::spawn(&spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                let reason = ManagerError::ProcessSpawn(format!("{:#}", e)).to_string();
                tracing::error!(server_id = %id, "{}", reason);
                self.append_log(&mut inner, reason);
                inner.state.reset_runtime();
                self.publish(&inner.state);
                return Ok(());
            }
        };

        tracing::info!(server_id = %id, "Started {} (pid {})", inner.state.config.name, process.pid());
        inner.runs += 1;
        let run_id = inner.runs;
        let (exited_tx, exited_rx) = watch::channel(false);
        inner.attached = Some(Attached {
            run_id,
            process,
            exited: exited_rx,
        });
        inner.last_lag = None;
        drop(inner);

        self.follow_run(instance, run_id, events, exited_tx);
        Ok(())
    }

    /// Sends a graceful `stop`. Only a running server can be stopped.
    pub async fn stop_server(&self, id: Uuid) -> Result<()> {
        let instance = self.instance(id)?;
        let mut inner = instance.inner.lock().await;
        if inner.state.status != ServerStatus::Running {
            tracing::debug!(server_id = %id, "Stop ignored in state {:?}", inner.state.status);
            return Ok(());
        }
        self.request_stop(&mut inner);
        Ok(())
    }

    fn request_stop(&self, inner: &mut InstanceInner) {
        let id = inner.state.id();
        if let Some(attached) = &inner.attached {
            if let Err(e) = attached.process.stop() {
                tracing::warn!(server_id = %id, "Failed to send stop: {}", e);
            }
        }
        inner.state.status = ServerStatus::Stopping;
        inner.stop_telemetry();
        self.publish(&inner.state);

        let lock_dir = self.settings.instance_dir(&id);
        let delay = self.settings.lock_cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            remove_session_lock(&lock_dir).await;
        });
    }

    /// Stops the server if needed, waits for its process to exit, then
    /// forgets it and removes its directory.
    pub async fn delete_server(&self, id: Uuid) -> Result<()> {
        let instance = self.instance(id)?;
        let exited = {
            let mut inner = instance.inner.lock().await;
            inner.deleting = true;
            let exited = inner.attached.as_ref().map(|a| a.exited.clone());
            if exited.is_some() {
                self.request_stop(&mut inner);
            }
            exited
        };

        if let Some(mut exited) = exited {
            tracing::info!(server_id = %id, "Waiting for server to exit before deleting");
            let _ = exited.wait_for(|done| *done).await;
        }

        self.instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.published_write().retain(|s| s.id() != id);
        {
            let mut ledger = lock(&self.ledger);
            ledger.backup_configs.remove(&id);
            ledger.backups.remove(&id);
        }
        self.portals.remove_owned_by(id);
        self.broadcast_servers();

        let dir = self.settings.instance_dir(&id);
        if let Err(e) = fs::remove_dir_all(&dir).await {
            tracing::warn!(server_id = %id, "Failed to remove {:?}: {}", dir, e);
        }

        self.save().await?;
        self.reconcile_proxy();
        tracing::info!(server_id = %id, "Deleted server");
        Ok(())
    }

    /// Writes a line to the server console. Ignored when nothing is running.
    pub async fn send_command(&self, id: Uuid, command: &str) -> Result<()> {
        let instance = self.instance(id)?;
        let inner = instance.inner.lock().await;
        match &inner.attached {
            Some(attached) => attached.process.send_command(command)?,
            None => tracing::debug!(server_id = %id, "No process for command {:?}", command),
        }
        Ok(())
    }

    // ---- process output ----

    fn follow_run(
        self: &Arc<Self>,
        instance: Arc<Instance>,
        run_id: u64,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
        exited: watch::Sender<bool>,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut exit_code = None;
            while let Some(event) = events.recv().await {
                let line = match event {
                    ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) => line,
                    ProcessEvent::Exited(code) => {
                        exit_code = code;
                        break;
                    }
                };
                let mut inner = instance.inner.lock().await;
                if inner.run_id() == Some(run_id) {
                    supervisor.apply_line(&instance, &mut inner, run_id, line);
                }
            }

            let mut inner = instance.inner.lock().await;
            if inner.run_id() == Some(run_id) {
                supervisor.handle_exit(&mut inner, exit_code);
            }
            drop(inner);
            let _ = exited.send(true);
        });
    }

    fn apply_line(self: &Arc<Self>, instance: &Arc<Instance>, inner: &mut InstanceInner, run_id: u64, line: String) {
        let deltas = console::parse_line(&line);
        self.append_log(inner, line);

        let mut changed = false;
        for delta in deltas {
            match delta {
                ConsoleDelta::Ready => {
                    if inner.state.status == ServerStatus::Starting {
                        inner.state.status = ServerStatus::Running;
                        tracing::info!(server_id = %inner.state.id(), "{} is ready", inner.state.config.name);
                        self.start_telemetry(instance, inner, run_id);
                        changed = true;
                    }
                }
                // a repeated join for someone already online changes nothing
                ConsoleDelta::PlayerJoined(name) => changed |= inner.state.add_player(&name),
                ConsoleDelta::PlayerLeft(name) => changed |= inner.state.remove_player(&name),
                ConsoleDelta::Lag { ms_behind } => {
                    inner.state.set_tps(console::tps_from_lag(ms_behind));
                    inner.last_lag = Some(Instant::now());
                    changed = true;
                }
                ConsoleDelta::Tps(tps) => {
                    inner.state.set_tps(tps);
                    changed = true;
                }
                ConsoleDelta::Memory(mb) => {
                    inner.state.used_memory = mb;
                    changed = true;
                }
            }
        }
        if changed {
            self.publish(&inner.state);
        }
    }

    fn handle_exit(&self, inner: &mut InstanceInner, code: Option<i32>) {
        let id = inner.state.id();
        let code = code.map_or_else(|| "none".to_string(), |c| c.to_string());
        if inner.state.status == ServerStatus::Starting {
            tracing::warn!(server_id = %id, "Server failed to start (exit code: {})", code);
            self.append_log(inner, format!("Server failed to start (exit code: {})", code));
        } else {
            tracing::info!(server_id = %id, "Server exited (exit code: {})", code);
        }

        inner.attached = None;
        inner.stop_telemetry();
        inner.last_lag = None;
        inner.state.reset_runtime();
        self.publish(&inner.state);
    }

    /// Samples resident memory and relaxes TPS while the run stays `running`.
    fn start_telemetry(self: &Arc<Self>, instance: &Arc<Instance>, inner: &mut InstanceInner, run_id: u64) {
        let Some(pid) = inner.attached.as_ref().map(|a| a.process.pid()) else {
            return;
        };
        let supervisor = self.clone();
        let instance = instance.clone();
        let interval = self.settings.telemetry_interval;
        let step = self.settings.tps_relax_step;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut monitor = ServerMonitor::new();
            loop {
                ticker.tick().await;
                let sampled = tokio::task::spawn_blocking(move || {
                    let memory = monitor.resident_memory_mb(pid);
                    (monitor, memory)
                })
                .await;
                let Ok((returned, memory)) = sampled else {
                    break;
                };
                monitor = returned;

                let mut inner = instance.inner.lock().await;
                if inner.run_id() != Some(run_id) || inner.state.status != ServerStatus::Running {
                    break;
                }
                if let Some(mb) = memory {
                    inner.state.used_memory = mb;
                }
                let lagging = inner.last_lag.is_some_and(|at| at.elapsed() < interval);
                if !lagging && inner.state.tps < MAX_TPS {
                    let relaxed = inner.state.tps + step;
                    inner.state.set_tps(relaxed);
                }
                supervisor.publish(&inner.state);
            }
        });

        if let Some(previous) = inner.telemetry.replace(handle) {
            previous.abort();
        }
    }

    fn append_log(&self, inner: &mut InstanceInner, line: String) {
        let _ = self.events.send(FleetEvent::Log {
            server_id: inner.state.id(),
            line: line.clone(),
        });
        inner.push_log(line, self.settings.log_capacity);
    }

    // ---- configuration edits ----

    pub async fn get_server_properties(&self, id: Uuid) -> Result<ServerProperties> {
        self.instance(id)?;
        let path = self.settings.instance_dir(&id).join(PROPERTIES_FILE);
        Ok(config::read_server_properties(&path).await?)
    }

    /// Replaces `server.properties`. A changed `server-port` becomes the
    /// server's port unless another server or process already holds it.
    pub async fn set_server_properties(&self, id: Uuid, properties: ServerProperties) -> Result<()> {
        let instance = self.instance(id)?;
        let mut inner = instance.inner.lock().await;
        ensure_stopped(&inner, "server properties")?;

        let new_port = match properties.get("server-port") {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u16>()
                    .map_err(|_| ManagerError::InvalidConfig(format!("invalid server-port '{}'", raw)))?,
            ),
            None => None,
        };
        let port_changed = new_port.filter(|p| *p != inner.state.config.port);
        if let Some(port) = port_changed {
            self.claim_port(id, port)?;
        }

        let path = self.settings.instance_dir(&id).join(PROPERTIES_FILE);
        let written = config::write_server_properties(&path, &properties).await;

        if let Some(port) = port_changed {
            if written.is_ok() {
                inner.state.config.port = port;
                self.publish(&inner.state);
            }
            lock(&self.reserved_ports).remove(&port);
        }
        drop(inner);
        written?;

        if port_changed.is_some() {
            self.save().await?;
            self.reconcile_proxy();
        }
        Ok(())
    }

    pub async fn set_server_memory(&self, id: Uuid, memory: u32) -> Result<()> {
        if memory == 0 {
            return Err(ManagerError::InvalidConfig("memory must be positive".to_string()));
        }
        let instance = self.instance(id)?;
        let mut inner = instance.inner.lock().await;
        ensure_stopped(&inner, "memory")?;
        inner.state.config.memory = memory;
        self.publish(&inner.state);
        drop(inner);
        self.save().await
    }

    // ---- plugin reports ----

    /// Overwrites live metrics with what the companion plugin reported.
    pub async fn report_metrics(&self, metrics: ServerMetrics) -> Result<()> {
        let instance = self.instance(metrics.server_id)?;
        let mut inner = instance.inner.lock().await;
        if inner.attached.is_none() {
            return Ok(());
        }
        inner.state.set_tps(metrics.tps);
        inner.state.players.clear();
        for player in &metrics.players {
            inner.state.add_player(player);
        }
        inner.state.used_memory = metrics.used_memory;
        self.publish(&inner.state);
        Ok(())
    }

    pub async fn update_player_positions(&self, id: Uuid, positions: Vec<PlayerPosition>) -> Result<()> {
        let instance = self.instance(id)?;
        let mut inner = instance.inner.lock().await;
        if inner.attached.is_none() {
            return Ok(());
        }
        inner.state.player_positions = Some(positions);
        self.publish(&inner.state);
        Ok(())
    }

    // ---- backups ----

    pub fn get_backup_config(&self, id: Uuid) -> Result<BackupConfig> {
        self.instance(id)?;
        Ok(lock(&self.ledger)
            .backup_configs
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn set_backup_config(&self, id: Uuid, backup_config: BackupConfig) -> Result<()> {
        self.instance(id)?;
        backup_config.validate().map_err(ManagerError::InvalidConfig)?;
        lock(&self.ledger).backup_configs.insert(id, backup_config);
        self.save().await
    }

    /// Configured backups of every known server.
    pub fn backup_configs(&self) -> Vec<(Uuid, BackupConfig)> {
        let ledger = lock(&self.ledger);
        ledger
            .backup_configs
            .iter()
            .filter(|(id, _)| self.contains_server(id))
            .map(|(id, cfg)| (*id, cfg.clone()))
            .collect()
    }

    pub fn list_backups(&self, id: Uuid) -> Result<Vec<Backup>> {
        self.instance(id)?;
        Ok(lock(&self.ledger).backups.get(&id).cloned().unwrap_or_default())
    }

    /// Archives the server's worlds and records the result, evicting the
    /// oldest archives beyond the retention count.
    pub async fn create_backup(&self, id: Uuid) -> Result<Backup> {
        let state = self.server(id)?;
        let dir = self.settings.instance_dir(&id);
        let worlds = world::present_worlds(&dir).await;
        if worlds.is_empty() {
            return Err(ManagerError::NoWorldsToBackup);
        }

        let backup_config = self.get_backup_config(id)?;
        // joining an absolute destination replaces the base
        let destination = match backup_config.destination.trim() {
            "" => self.settings.backups_dir().join(id.to_string()),
            custom => self.settings.base_dir.join(custom),
        };

        let created = Utc::now();
        let backup_id = Uuid::new_v4();
        let path = destination.join(backup::archive_file_name(
            &state.config.name,
            &created,
            &backup_id,
            backup_config.format,
        ));

        tracing::info!(server_id = %id, "Backing up {:?} to {:?}", worlds, path);
        let size = world::archive_worlds(&dir, &worlds, backup_config.format, &path).await?;
        let backup = Backup {
            id: backup_id,
            date: created.to_rfc3339_opts(SecondsFormat::Millis, true),
            size,
            path,
        };

        let evicted = {
            let mut ledger = lock(&self.ledger);
            if !self.contains_server(&id) {
                None
            } else {
                let history = ledger.backups.entry(id).or_default();
                Some(backup::record_and_rotate(history, backup.clone(), backup_config.rotation))
            }
        };
        let Some(evicted) = evicted else {
            let _ = fs::remove_file(&backup.path).await;
            return Err(ManagerError::NotFound(id));
        };

        for old in evicted {
            tracing::info!(server_id = %id, "Rotating out backup {:?}", old.path);
            remove_archive(&old.path).await;
        }
        self.save().await?;
        Ok(backup)
    }

    pub async fn delete_backup(&self, id: Uuid, backup_id: Uuid) -> Result<()> {
        self.instance(id)?;
        let removed = {
            let mut ledger = lock(&self.ledger);
            let history = ledger.backups.entry(id).or_default();
            let index = history
                .iter()
                .position(|b| b.id == backup_id)
                .ok_or(ManagerError::NotFound(backup_id))?;
            history.remove(index)
        };
        remove_archive(&removed.path).await;
        self.save().await
    }

    // ---- portals ----

    pub fn create_portal(&self, portal: NewPortal) -> Result<Portal> {
        self.instance(portal.server_id)?;
        self.instance(portal.target_server_id)?;
        Ok(self.portals.create(portal))
    }

    pub fn update_portal(&self, id: Uuid, update: PortalUpdate) -> Result<Portal> {
        if let Some(target) = update.target_server_id {
            self.instance(target)?;
        }
        self.portals.update(id, update)
    }

    pub fn delete_portal(&self, id: Uuid) -> Result<()> {
        self.portals.delete(id)
    }

    pub fn list_portals(&self, server_id: Option<Uuid>) -> Vec<PortalView> {
        let servers = self.published_read();
        self.portals.list(server_id, |id| {
            servers
                .iter()
                .find(|s| s.id() == *id)
                .map(|s| s.config.name.clone())
        })
    }

    // ---- proxy ----

    pub fn bungeecord_port(&self) -> u16 {
        lock(&self.ledger).proxy_port
    }

    pub async fn set_bungeecord_port(&self, port: u16) -> Result<()> {
        if port == 0 {
            return Err(ManagerError::InvalidConfig("port must be non-zero".to_string()));
        }
        lock(&self.ledger).proxy_port = port;
        self.save().await?;
        self.reconcile_proxy();
        Ok(())
    }

    fn reconcile_proxy(&self) {
        let servers = self
            .published_read()
            .iter()
            .map(|s| ProxyTarget {
                name: s.config.name.clone(),
                port: s.config.port,
            })
            .collect();
        self.proxy.request(ProxyPlan {
            listen_port: self.bungeecord_port(),
            servers,
        });
    }

    // ---- internals ----

    fn instance(&self, id: Uuid) -> Result<Arc<Instance>> {
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or(ManagerError::NotFound(id))
    }

    fn all_instances(&self) -> Vec<Arc<Instance>> {
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn published_read(&self) -> RwLockReadGuard<'_, Vec<ServerState>> {
        self.published.read().unwrap_or_else(|e| e.into_inner())
    }

    fn published_write(&self) -> RwLockWriteGuard<'_, Vec<ServerState>> {
        self.published.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Copies `state` into the published list and pushes a fresh snapshot.
    fn publish(&self, state: &ServerState) {
        {
            let mut published = self.published_write();
            match published.iter_mut().find(|s| s.id() == state.id()) {
                Some(slot) => *slot = state.clone(),
                None => return,
            }
        }
        self.broadcast_servers();
    }

    fn broadcast_servers(&self) {
        let _ = self.events.send(FleetEvent::Servers(self.servers()));
    }

    fn store_data(&self) -> StoreData {
        let servers = self.published_read().iter().map(|s| s.config.clone()).collect();
        let ledger = lock(&self.ledger);
        StoreData {
            servers,
            backup_configs: ledger.backup_configs.clone(),
            backups: ledger.backups.clone(),
            bungeecord_port: Some(ledger.proxy_port),
        }
    }

    async fn save(&self) -> Result<()> {
        self.store.save_with(|| self.store_data()).await?;
        Ok(())
    }
}

fn ensure_stopped(inner: &InstanceInner, what: &str) -> Result<()> {
    if inner.state.status != ServerStatus::Stopped || inner.attached.is_some() {
        return Err(ManagerError::InvalidState(format!(
            "{} can only be changed while the server is stopped",
            what
        )));
    }
    Ok(())
}

async fn write_eula(dir: &Path) -> Result<()> {
    fs::write(dir.join("eula.txt"), "eula=true\n").await?;
    Ok(())
}

async fn remove_session_lock(dir: &Path) {
    let lock = dir.join("world").join("session.lock");
    match fs::remove_file(&lock).await {
        Ok(()) => tracing::debug!("Removed stale {:?}", lock),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {:?}: {}", lock, e),
    }
}

async fn remove_archive(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to delete backup {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner() -> InstanceInner {
        let config = ServerConfig::new("Hub".into(), ServerType::Paper, "1.21.1".into(), 25565, 1024);
        Instance::new(ServerState::new(config)).inner.into_inner()
    }

    #[test]
    fn log_ring_keeps_newest_lines() {
        let mut inner = inner();
        for n in 0..10 {
            inner.push_log(format!("line {}", n), 4);
        }
        let logs: Vec<_> = inner.logs.iter().map(String::as_str).collect();
        assert_eq!(logs, vec!["line 6", "line 7", "line 8", "line 9"]);
    }

    #[test]
    fn edits_require_stopped_server() {
        let mut inner = inner();
        assert!(ensure_stopped(&inner, "memory").is_ok());
        inner.state.status = ServerStatus::Running;
        assert!(matches!(
            ensure_stopped(&inner, "memory"),
            Err(ManagerError::InvalidState(_))
        ));
    }

    #[test]
    fn new_server_defaults() {
        let request: NewServer =
            serde_json::from_str(r#"{"name":"Hub","type":"paper","version":"1.21.1"}"#).unwrap();
        assert_eq!(request.port, 25565);
        assert_eq!(request.memory, 2048);
        assert_eq!(request.server_type, ServerType::Paper);
    }
}
