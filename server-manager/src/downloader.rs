use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::ManagerError;
use crate::types::{BuildStatus, ServerType};

const PAPER_API_BASE: &str = "https://api.papermc.io/v2";
const PURPUR_API_BASE: &str = "https://api.purpurmc.org/v2";
const PUFFERFISH_CI_BASE: &str = "https://ci.pufferfish.host/job";
const MOHIST_API_BASE: &str = "https://api.mohistmc.com/project/mohist";
const ARCLIGHT_RELEASES_URL: &str = "https://api.github.com/repos/IzzelAliz/Arclight/releases";

/// Anything smaller is an error page, not a server jar.
pub const MIN_JAR_SIZE: u64 = 1000;

/// Progress callback: percent (0-100) and a human readable message.
pub type ProgressFn = Arc<dyn Fn(u8, &str) + Send + Sync>;

/// Produces a runnable server jar for an engine/version pair.
///
/// Implementations must return immediately when a valid cached binary exists,
/// and must reject a second concurrent request for a key that is already
/// being acquired with [`ManagerError::AlreadyBuilding`].
#[async_trait]
pub trait BinaryProvider: Send + Sync {
    async fn ensure_binary(
        &self,
        server_type: ServerType,
        version: &str,
        progress: ProgressFn,
    ) -> crate::Result<PathBuf>;

    fn build_status(&self, server_type: ServerType, version: &str) -> Option<BuildStatus>;

    /// Versions with a cached jar, per engine type.
    fn available_jars(&self) -> HashMap<ServerType, Vec<String>> {
        HashMap::new()
    }
}

fn build_key(server_type: ServerType, version: &str) -> String {
    format!("{}-{}", server_type, version)
}

/// Downloads jars from each engine's public API into a shared cache.
pub struct JarDownloader {
    jars_dir: PathBuf,
    client: reqwest::Client,
    building: Arc<Mutex<HashMap<String, BuildStatus>>>,
}

/// Removes the in-flight entry however the acquisition ends.
struct BuildGuard {
    key: String,
    building: Arc<Mutex<HashMap<String, BuildStatus>>>,
}

impl BuildGuard {
    fn update(&self, progress: u8, message: &str) {
        if let Ok(mut building) = self.building.lock() {
            building.insert(
                self.key.clone(),
                BuildStatus {
                    progress,
                    message: message.to_string(),
                },
            );
        }
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        if let Ok(mut building) = self.building.lock() {
            building.remove(&self.key);
        }
    }
}

impl JarDownloader {
    pub fn new(jars_dir: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mineserv-manager/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            jars_dir: jars_dir.into(),
            client,
            building: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn jar_path(&self, server_type: ServerType, version: &str) -> PathBuf {
        self.jars_dir.join(format!("{}.jar", build_key(server_type, version)))
    }

    fn begin(&self, server_type: ServerType, version: &str) -> crate::Result<BuildGuard> {
        let key = build_key(server_type, version);
        let mut building = self
            .building
            .lock()
            .map_err(|_| anyhow::anyhow!("build registry poisoned"))?;
        if building.contains_key(&key) {
            return Err(ManagerError::AlreadyBuilding {
                server_type,
                version: version.to_string(),
            });
        }
        building.insert(
            key.clone(),
            BuildStatus {
                progress: 0,
                message: "Starting...".to_string(),
            },
        );
        Ok(BuildGuard {
            key,
            building: self.building.clone(),
        })
    }

    async fn download_url(&self, server_type: ServerType, version: &str) -> Result<String> {
        match server_type {
            ServerType::Paper => {
                let url = format!("{}/projects/paper/versions/{}/builds", PAPER_API_BASE, version);
                let builds: PaperBuilds = self.get_json(&url).await.context("Paper API error")?;
                let build = builds.builds.last().context("No Paper builds for this version")?;
                Ok(format!(
                    "{}/projects/paper/versions/{}/builds/{}/downloads/{}",
                    PAPER_API_BASE, version, build.build, build.downloads.application.name
                ))
            }
            ServerType::Purpur => {
                let url = format!("{}/purpur/{}", PURPUR_API_BASE, version);
                let info: PurpurVersion = self.get_json(&url).await.context("Purpur API error")?;
                Ok(format!(
                    "{}/purpur/{}/{}/download",
                    PURPUR_API_BASE, version, info.builds.latest
                ))
            }
            ServerType::Pufferfish => {
                // 1.21.1 is built by job Pufferfish-1.21
                let major_minor = version.split('.').take(2).collect::<Vec<_>>().join(".");
                let job = format!("{}/Pufferfish-{}/lastSuccessfulBuild", PUFFERFISH_CI_BASE, major_minor);
                let info: JenkinsBuild = self
                    .get_json(&format!("{}/api/json", job))
                    .await
                    .context("Pufferfish API error")?;
                let artifact = info.artifacts.first().context("Pufferfish artifact not found")?;
                Ok(format!("{}/artifact/{}", job, artifact.relative_path))
            }
            ServerType::Mohist => {
                let url = format!("{}/{}/builds", MOHIST_API_BASE, version);
                let builds: Vec<MohistBuild> = self.get_json(&url).await.context("Mohist API error")?;
                let build = builds.first().context("No Mohist builds available")?;
                let id = match &build.id {
                    serde_json::Value::String(id) => id.clone(),
                    other => other.to_string(),
                };
                Ok(format!("{}/{}/builds/{}/download", MOHIST_API_BASE, version, id))
            }
            ServerType::Arclight => {
                let releases: Vec<GithubRelease> = self
                    .get_json(ARCLIGHT_RELEASES_URL)
                    .await
                    .context("Arclight API error")?;
                let release = releases
                    .iter()
                    .find(|r| r.tag_name.contains(version))
                    .with_context(|| format!("Arclight {} not found", version))?;
                let asset = release
                    .assets
                    .iter()
                    .find(|a| a.name.ends_with(".jar") && a.name.contains("forge"))
                    .context("Arclight JAR not found")?;
                Ok(asset.browser_download_url.clone())
            }
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("{} returned status {}", url, response.status());
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    async fn download_file(
        &self,
        url: &str,
        destination: &Path,
        guard: &BuildGuard,
        progress: &ProgressFn,
    ) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to download file")?;

        if !response.status().is_success() {
            anyhow::bail!("Download failed with status: {}", response.status());
        }

        let total = response.content_length();
        let tmp = destination.with_extension("jar.part");
        let mut file = fs::File::create(&tmp)
            .await
            .context("Failed to create destination file")?;

        let mut written: u64 = 0;
        let mut last_reported = 0u8;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&tmp).await;
                    return Err(e).context("Download interrupted");
                }
            };
            file.write_all(&chunk).await.context("Failed to write file")?;
            written += chunk.len() as u64;

            if let Some(total) = total.filter(|t| *t > 0) {
                // Downloading spans 10..=95 percent
                let pct = 10 + ((written.min(total) * 85) / total) as u8;
                if pct >= last_reported + 5 {
                    last_reported = pct;
                    guard.update(pct, "Downloading...");
                    progress(pct, "Downloading...");
                }
            }
        }
        file.flush().await?;
        drop(file);

        if written < MIN_JAR_SIZE {
            let _ = fs::remove_file(&tmp).await;
            anyhow::bail!("File too small ({} bytes)", written);
        }

        fs::rename(&tmp, destination)
            .await
            .context("Failed to move jar into place")?;
        tracing::info!("Saved {:.1} MB to {:?}", written as f64 / 1024.0 / 1024.0, destination);
        Ok(())
    }
}

pub(crate) async fn is_valid_jar(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > MIN_JAR_SIZE,
        Err(_) => false,
    }
}

#[async_trait]
impl BinaryProvider for JarDownloader {
    async fn ensure_binary(
        &self,
        server_type: ServerType,
        version: &str,
        progress: ProgressFn,
    ) -> crate::Result<PathBuf> {
        let jar_path = self.jar_path(server_type, version);
        if is_valid_jar(&jar_path).await {
            return Ok(jar_path);
        }

        let guard = self.begin(server_type, version)?;
        fs::create_dir_all(&self.jars_dir).await?;

        tracing::info!("Downloading {} {} to {:?}", server_type, version, jar_path);
        guard.update(5, "Resolving download...");
        progress(5, "Resolving download...");

        let result = async {
            let url = self.download_url(server_type, version).await?;
            guard.update(10, "Downloading...");
            progress(10, "Downloading...");
            self.download_file(&url, &jar_path, &guard, &progress).await
        }
        .await;

        match result {
            Ok(()) => {
                progress(100, "Done");
                tracing::info!("Successfully downloaded {} {}", server_type, version);
                Ok(jar_path)
            }
            Err(e) => {
                tracing::error!("Failed to acquire {} {}: {:#}", server_type, version, e);
                Err(ManagerError::BinaryUnavailable(format!("{:#}", e)))
            }
        }
    }

    fn build_status(&self, server_type: ServerType, version: &str) -> Option<BuildStatus> {
        self.building
            .lock()
            .ok()?
            .get(&build_key(server_type, version))
            .cloned()
    }

    fn available_jars(&self) -> HashMap<ServerType, Vec<String>> {
        let mut jars: HashMap<ServerType, Vec<String>> =
            ServerType::ALL.iter().map(|t| (*t, Vec::new())).collect();

        let Ok(entries) = std::fs::read_dir(&self.jars_dir) else {
            return jars;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".jar") else {
                continue;
            };
            let Some((kind, version)) = stem.split_once('-') else {
                continue;
            };
            let Ok(kind) = kind.parse::<ServerType>() else {
                continue;
            };
            let big_enough = entry.metadata().map(|m| m.len() > MIN_JAR_SIZE).unwrap_or(false);
            if big_enough {
                if let Some(versions) = jars.get_mut(&kind) {
                    versions.push(version.to_string());
                }
            }
        }
        jars
    }
}

#[derive(Debug, Deserialize)]
struct PaperBuilds {
    builds: Vec<PaperBuild>,
}

#[derive(Debug, Deserialize)]
struct PaperBuild {
    build: u32,
    downloads: PaperDownloads,
}

#[derive(Debug, Deserialize)]
struct PaperDownloads {
    application: PaperApplication,
}

#[derive(Debug, Deserialize)]
struct PaperApplication {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PurpurVersion {
    builds: PurpurBuilds,
}

#[derive(Debug, Deserialize)]
struct PurpurBuilds {
    latest: String,
}

#[derive(Debug, Deserialize)]
struct JenkinsBuild {
    artifacts: Vec<JenkinsArtifact>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JenkinsArtifact {
    relative_path: String,
}

#[derive(Debug, Deserialize)]
struct MohistBuild {
    id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ProgressFn {
        Arc::new(|_, _| {})
    }

    #[tokio::test]
    async fn cached_jar_is_returned_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = JarDownloader::new(dir.path());
        let path = downloader.jar_path(ServerType::Paper, "1.21.1");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        let got = downloader
            .ensure_binary(ServerType::Paper, "1.21.1", noop())
            .await
            .unwrap();
        assert_eq!(got, path);
    }

    #[test]
    fn second_concurrent_request_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = JarDownloader::new(dir.path());

        let guard = downloader.begin(ServerType::Purpur, "1.21.1").unwrap();
        assert!(matches!(
            downloader.begin(ServerType::Purpur, "1.21.1"),
            Err(ManagerError::AlreadyBuilding { .. })
        ));
        assert!(downloader.begin(ServerType::Paper, "1.21.1").is_ok());
        assert_eq!(
            downloader.build_status(ServerType::Purpur, "1.21.1").map(|s| s.progress),
            Some(0)
        );

        drop(guard);
        assert!(downloader.build_status(ServerType::Purpur, "1.21.1").is_none());
        assert!(downloader.begin(ServerType::Purpur, "1.21.1").is_ok());
    }

    #[test]
    fn lists_cached_jars() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("paper-1.21.1.jar"), vec![0u8; 2048]).unwrap();
        std::fs::write(dir.path().join("purpur-1.20.4.jar"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let jars = JarDownloader::new(dir.path()).available_jars();
        assert_eq!(jars[&ServerType::Paper], vec!["1.21.1".to_string()]);
        assert!(jars[&ServerType::Purpur].is_empty());
        assert_eq!(jars.len(), 5);
    }
}
