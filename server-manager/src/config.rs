use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use tokio::fs;

use crate::types::ServerProperties;

pub const PROPERTIES_FILE: &str = "server.properties";

const DEFAULT_PROPERTIES: &[(&str, &str)] = &[
    ("online-mode", "false"),
    ("gamemode", "survival"),
    ("difficulty", "easy"),
    ("max-players", "20"),
    ("motd", "A Minecraft Server"),
    ("level-name", "world"),
    ("level-type", "minecraft:normal"),
    ("spawn-protection", "16"),
    ("allow-nether", "true"),
    ("allow-flight", "false"),
    ("view-distance", "10"),
    ("simulation-distance", "10"),
    ("enable-command-block", "false"),
    ("hardcore", "false"),
    ("pvp", "true"),
    ("generate-structures", "true"),
    ("spawn-monsters", "true"),
    ("spawn-animals", "true"),
    ("spawn-npcs", "true"),
    ("force-gamemode", "false"),
    ("white-list", "false"),
    ("broadcast-console-to-ops", "true"),
    ("op-permission-level", "4"),
    ("function-permission-level", "2"),
    ("resource-pack", ""),
    ("resource-pack-prompt", ""),
    ("resource-pack-sha1", ""),
    ("require-resource-pack", "false"),
    ("enable-jmx-monitoring", "false"),
    ("sync-chunk-writes", "true"),
    ("enable-status", "true"),
    ("hide-online-players", "false"),
    ("max-world-size", "29999984"),
    ("network-compression-threshold", "256"),
    ("max-tick-time", "60000"),
    ("use-native-transport", "true"),
    ("enable-rcon", "false"),
    ("rcon.port", "25575"),
    ("rcon.password", ""),
    ("enable-query", "false"),
    ("generator-settings", "{}"),
    ("level-seed", ""),
    ("enforce-whitelist", "false"),
    ("rate-limit", "0"),
    ("max-chained-neighbor-updates", "1000000"),
];

pub async fn read_server_properties(path: &Path) -> Result<ServerProperties> {
    let raw = fs::read(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;

    java_properties::read(Cursor::new(raw)).context("Failed to parse server.properties")
}

pub async fn write_server_properties(path: &Path, properties: &ServerProperties) -> Result<()> {
    let mut buf = Vec::new();
    java_properties::write(&mut buf, properties).context("Failed to encode server.properties")?;

    fs::write(path, buf)
        .await
        .with_context(|| format!("Failed to write {:?}", path))
}

/// Writes a complete default `server.properties` bound to `port`.
pub async fn initialize_server_properties(server_dir: &Path, port: u16) -> Result<()> {
    let mut properties: HashMap<String, String> = DEFAULT_PROPERTIES
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    properties.insert("server-port".to_string(), port.to_string());
    properties.insert("query.port".to_string(), port.to_string());

    write_server_properties(&server_dir.join(PROPERTIES_FILE), &properties).await
}
