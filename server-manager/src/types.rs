use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Paper,
    Purpur,
    Pufferfish,
    Mohist,
    Arclight,
}

impl ServerType {
    pub const ALL: [ServerType; 5] = [
        ServerType::Paper,
        ServerType::Purpur,
        ServerType::Pufferfish,
        ServerType::Mohist,
        ServerType::Arclight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerType::Paper => "paper",
            ServerType::Purpur => "purpur",
            ServerType::Pufferfish => "pufferfish",
            ServerType::Mohist => "mohist",
            ServerType::Arclight => "arclight",
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServerType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown server type '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Durable part of a server: everything that survives a manager restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: ServerType,
    pub version: String,
    pub port: u16,
    /// Heap size handed to the JVM, in MB.
    pub memory: u32,
}

impl ServerConfig {
    pub fn new(name: String, server_type: ServerType, version: String, port: u16, memory: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            server_type,
            version,
            port,
            memory,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerPosition {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub world: String,
}

/// Runtime view of a server as pushed to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerState {
    #[serde(flatten)]
    pub config: ServerConfig,
    pub status: ServerStatus,
    pub players: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_positions: Option<Vec<PlayerPosition>>,
    pub tps: f64,
    /// Last observed resident memory, in MB.
    pub used_memory: u64,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            status: ServerStatus::Stopped,
            players: Vec::new(),
            player_positions: None,
            tps: MAX_TPS,
            used_memory: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.config.id
    }

    /// Clears everything derived from a live process.
    pub fn reset_runtime(&mut self) {
        self.status = ServerStatus::Stopped;
        self.players.clear();
        self.player_positions = None;
        self.tps = MAX_TPS;
        self.used_memory = 0;
    }

    pub fn add_player(&mut self, name: &str) -> bool {
        if self.players.iter().any(|p| p == name) {
            return false;
        }
        self.players.push(name.to_string());
        true
    }

    pub fn remove_player(&mut self, name: &str) -> bool {
        let before = self.players.len();
        self.players.retain(|p| p != name);
        before != self.players.len()
    }

    pub fn set_tps(&mut self, tps: f64) {
        self.tps = clamp_tps(tps);
    }
}

pub const MAX_TPS: f64 = 20.0;
pub const MIN_TPS: f64 = 1.0;

pub fn clamp_tps(tps: f64) -> f64 {
    if tps.is_nan() {
        return MIN_TPS;
    }
    tps.clamp(MIN_TPS, MAX_TPS)
}

/// Metrics pushed by the companion plugin running inside a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetrics {
    pub server_id: Uuid,
    pub tps: f64,
    pub players: Vec<String>,
    pub used_memory: u64,
    #[serde(default)]
    pub max_memory: u64,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ArchiveFormat {
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar.gz")]
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupSchedule {
    Hourly,
    Daily,
    Weekly,
}

/// Missing fields take their value from `BackupConfig::default()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BackupConfig {
    pub enabled: bool,
    pub format: ArchiveFormat,
    /// Empty means the per-server default folder. Relative paths resolve
    /// against the manager's base directory.
    pub destination: String,
    /// Number of archives to keep.
    pub rotation: usize,
    pub schedule: BackupSchedule,
    /// `HH:MM`, local time.
    pub schedule_time: String,
    /// 0 = Sunday. Only read for weekly schedules.
    pub schedule_day: u8,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            format: ArchiveFormat::Zip,
            destination: String::new(),
            rotation: 5,
            schedule: BackupSchedule::Daily,
            schedule_time: "03:00".to_string(),
            schedule_day: 0,
        }
    }
}

impl BackupConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.rotation < 1 {
            return Err("rotation must be at least 1".to_string());
        }
        if self.schedule_day > 6 {
            return Err("scheduleDay must be between 0 and 6".to_string());
        }
        self.time_of_day().map(|_| ())
    }

    /// Parses `schedule_time` into (hour, minute).
    pub fn time_of_day(&self) -> Result<(u32, u32), String> {
        let (h, m) = self
            .schedule_time
            .split_once(':')
            .ok_or_else(|| format!("invalid scheduleTime '{}'", self.schedule_time))?;
        let hour: u32 = h
            .trim()
            .parse()
            .map_err(|_| format!("invalid hour in '{}'", self.schedule_time))?;
        let minute: u32 = m
            .trim()
            .parse()
            .map_err(|_| format!("invalid minute in '{}'", self.schedule_time))?;
        if hour > 23 || minute > 59 {
            return Err(format!("scheduleTime '{}' out of range", self.schedule_time));
        }
        Ok((hour, minute))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backup {
    pub id: Uuid,
    /// ISO-8601 creation time.
    pub date: String,
    pub size: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PortalShape {
    Sphere,
    #[default]
    Flat,
    Rectangle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Portal {
    pub id: Uuid,
    pub name: String,
    pub server_id: Uuid,
    pub target_server_id: Uuid,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub world: String,
    #[serde(default)]
    pub shape: PortalShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x2: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z2: Option<i32>,
}

/// Portal as returned to callers, with the target's current display name.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortalView {
    #[serde(flatten)]
    pub portal: Portal,
    pub target_server_name: String,
}

/// Everything the dashboard needs to render the fleet.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub servers: Vec<ServerState>,
    pub server_ip: String,
    pub bungeecord_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildStatus {
    pub progress: u8,
    pub message: String,
}

/// Events pushed to observers on every state change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum FleetEvent {
    Servers(Vec<ServerState>),
    #[serde(rename_all = "camelCase")]
    Log { server_id: Uuid, line: String },
    #[serde(rename_all = "camelCase")]
    BuildProgress {
        server_type: ServerType,
        version: String,
        progress: u8,
        message: String,
    },
}

pub type ServerProperties = HashMap<String, String>;
