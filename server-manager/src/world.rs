use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::types::ArchiveFormat;

/// World directories a backup may contain, in archive order.
pub const WORLD_DIRS: [&str; 3] = ["world", "world_nether", "world_the_end"];

pub async fn present_worlds(server_dir: &Path) -> Vec<&'static str> {
    let mut present = Vec::new();
    for world in WORLD_DIRS {
        if fs::try_exists(server_dir.join(world)).await.unwrap_or(false) {
            present.push(world);
        }
    }
    present
}

/// Archives `worlds` (relative to `server_dir`) into `destination` and
/// returns the archive size in bytes. The archive is written under a
/// temporary name and only renamed into place once complete.
pub async fn archive_worlds(
    server_dir: &Path,
    worlds: &[&str],
    format: ArchiveFormat,
    destination: &Path,
) -> Result<u64> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .await
            .context("Failed to create backup directory")?;
    }
    let partial = partial_path(destination);

    let result = match format {
        ArchiveFormat::Zip => {
            let server_dir = server_dir.to_path_buf();
            let worlds: Vec<String> = worlds.iter().map(|w| w.to_string()).collect();
            let target = partial.clone();
            tokio::task::spawn_blocking(move || write_zip(&server_dir, &worlds, &target))
                .await
                .context("Zip task panicked")?
        }
        ArchiveFormat::TarGz => write_tar_gz(server_dir, worlds, &partial).await,
    };

    if let Err(e) = result {
        let _ = fs::remove_file(&partial).await;
        return Err(e);
    }

    fs::rename(&partial, destination)
        .await
        .context("Failed to move archive into place")?;
    let size = fs::metadata(destination).await?.len();
    Ok(size)
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn write_zip(server_dir: &Path, worlds: &[String], target: &Path) -> Result<()> {
    let file = File::create(target).context("Failed to create backup file")?;

    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for world in worlds {
        add_dir_to_zip(&mut zip, &server_dir.join(world), world, options.clone())?;
    }

    zip.finish().context("Failed to finalize zip")?;
    Ok(())
}

fn add_dir_to_zip(
    zip: &mut zip::ZipWriter<File>,
    dir: &Path,
    prefix: &str,
    options: zip::write::SimpleFileOptions,
) -> Result<()> {
    zip.add_directory(prefix, options.clone())
        .context("Failed to add directory to zip")?;

    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {:?}", dir))? {
        let path = entry?.path();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("Invalid filename")?;
        let zip_path = format!("{}/{}", prefix, name);

        if path.is_dir() {
            add_dir_to_zip(zip, &path, &zip_path, options.clone())?;
        } else {
            // session.lock is held open by a running server
            let content = match std::fs::read(&path) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!("Skipping unreadable file {:?}: {}", path, e);
                    continue;
                }
            };
            zip.start_file(zip_path.as_str(), options.clone())
                .context("Failed to start file in zip")?;
            zip.write_all(&content).context("Failed to write file to zip")?;
        }
    }

    Ok(())
}

/// Runs the host's `tar` binary, which must be on `PATH`. `tar` runs inside
/// `server_dir`, so a relative target is made absolute first.
async fn write_tar_gz(server_dir: &Path, worlds: &[&str], target: &Path) -> Result<()> {
    let target = if target.is_absolute() {
        target.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Failed to resolve backup path")?
            .join(target)
    };
    let output = tokio::process::Command::new("tar")
        .arg("-czf")
        .arg(&target)
        .args(worlds)
        .current_dir(server_dir)
        .output()
        .await
        .context("Failed to run tar")?;

    if !output.status.success() {
        anyhow::bail!("tar failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_world(server_dir: &Path, name: &str) {
        let region = server_dir.join(name).join("region");
        std::fs::create_dir_all(&region).unwrap();
        std::fs::write(server_dir.join(name).join("level.dat"), b"level").unwrap();
        std::fs::write(region.join("r.0.0.mca"), vec![7u8; 4096]).unwrap();
    }

    #[tokio::test]
    async fn only_existing_worlds_are_present() {
        let dir = tempfile::tempdir().unwrap();
        make_world(dir.path(), "world");
        make_world(dir.path(), "world_the_end");

        assert_eq!(present_worlds(dir.path()).await, vec!["world", "world_the_end"]);
    }

    #[tokio::test]
    async fn zip_contains_world_files() {
        let dir = tempfile::tempdir().unwrap();
        make_world(dir.path(), "world");
        let dest = dir.path().join("out").join("backup.zip");

        let size = archive_worlds(dir.path(), &["world"], ArchiveFormat::Zip, &dest)
            .await
            .unwrap();

        assert!(size > 0);
        assert!(!partial_path(&dest).exists());
        let mut archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert!(archive.by_name("world/level.dat").is_ok());
        assert!(archive.by_name("world/region/r.0.0.mca").is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tar_gz_archive_is_written() {
        let dir = tempfile::tempdir().unwrap();
        make_world(dir.path(), "world");
        make_world(dir.path(), "world_nether");
        let dest = dir.path().join("backup.tar.gz");

        let size = archive_worlds(dir.path(), &["world", "world_nether"], ArchiveFormat::TarGz, &dest)
            .await
            .unwrap();

        assert_eq!(size, std::fs::metadata(&dest).unwrap().len());
    }
}
