use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;
use uuid::Uuid;

/// Directory name of the companion plugin's config inside `plugins/`.
pub const COMPANION_PLUGIN: &str = "MineManagerPlugin";

/// Links every shared plugin jar into the instance and points the companion
/// plugin back at the manager.
pub async fn setup_shared_plugins(
    shared_dir: &Path,
    server_dir: &Path,
    server_id: Uuid,
    manager_url: &str,
) -> Result<()> {
    let plugins_dir = server_dir.join("plugins");
    fs::create_dir_all(&plugins_dir).await?;
    fs::create_dir_all(shared_dir).await?;

    let mut entries = fs::read_dir(shared_dir)
        .await
        .context("Failed to read shared plugins directory")?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("jar") {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };
        let link = plugins_dir.join(file_name);
        if fs::try_exists(&link).await.unwrap_or(false) {
            continue;
        }
        if let Err(e) = link_or_copy(&path, &link).await {
            tracing::warn!("Failed to install shared plugin {:?}: {}", path, e);
        }
    }

    let config_dir = plugins_dir.join(COMPANION_PLUGIN);
    fs::create_dir_all(&config_dir).await?;
    fs::write(
        config_dir.join("config.yml"),
        format!("server-id: \"{}\"\nmanager-url: \"{}\"\n", server_id, manager_url),
    )
    .await
    .context("Failed to write plugin config")?;

    Ok(())
}

#[cfg(unix)]
async fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if fs::symlink(src, dst).await.is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn links_jars_and_writes_config() {
        let shared = tempfile::tempdir().unwrap();
        let server = tempfile::tempdir().unwrap();
        std::fs::write(shared.path().join("MineManagerPlugin-1.0.0.jar"), b"jar").unwrap();
        std::fs::write(shared.path().join("README.txt"), b"ignored").unwrap();
        let id = Uuid::new_v4();

        setup_shared_plugins(shared.path(), server.path(), id, "http://localhost:3000")
            .await
            .unwrap();

        let plugins = server.path().join("plugins");
        assert!(plugins.join("MineManagerPlugin-1.0.0.jar").exists());
        assert!(!plugins.join("README.txt").exists());
        let config = std::fs::read_to_string(plugins.join(COMPANION_PLUGIN).join("config.yml")).unwrap();
        assert!(config.contains(&id.to_string()));
        assert!(config.contains("http://localhost:3000"));
    }
}
