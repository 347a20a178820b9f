use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use filetime::FileTime;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    error::ClientError,
    library::{Cutoff, PhotoLibrary, qualifying},
    model::Asset,
    prompt::Prompt,
};

const PROGRESS_TEMPLATE: &str = "{bar:40} {pos}/{len} {msg}";
const PARTIAL_EXTENSION: &str = "part";

#[derive(Debug, Default, PartialEq)]
pub struct DownloadSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeleteOptions {
    pub assume_yes: bool,
    pub dry_run: bool,
}

#[derive(Debug, Default, PartialEq)]
pub struct DeleteSummary {
    pub candidates: usize,
    pub deleted: usize,
    pub failed: usize,
    pub cancelled: bool,
}

fn progress_bar(len: usize) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::with_template(PROGRESS_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

/// Where an asset's bytes belong on disk.
#[derive(Debug, PartialEq)]
pub enum Placement {
    /// A file written for this asset by an earlier run.
    Present(PathBuf),
    New(PathBuf),
}

/// Picks a local file name per asset. The first choice is the asset's own
/// filename. Later choices carry a tag derived from the record id only, so
/// a name never depends on which other assets are listed.
#[derive(Default)]
pub struct FileNamer {
    claimed: HashSet<String>,
}

impl FileNamer {
    pub fn place(&mut self, asset: &Asset, dir: &Path) -> io::Result<Placement> {
        let tag = id_tag(&asset.id);
        let base = Path::new(&asset.filename)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.starts_with('.'))
            .map(str::to_string)
            .unwrap_or_else(|| tag.clone());

        let (stem, extension) = match base.rsplit_once('.') {
            Some((stem, extension)) if !stem.is_empty() => (stem.to_string(), format!(".{extension}")),
            _ => (base.clone(), String::new()),
        };

        let mut attempt = 0;
        loop {
            let name = match attempt {
                0 => base.clone(),
                1 => format!("{stem}-{tag}{extension}"),
                n => format!("{stem}-{tag}-{n}{extension}"),
            };
            attempt += 1;

            let key = name.to_lowercase();
            if self.claimed.contains(&key) {
                continue;
            }
            let path = dir.join(&name);
            match std::fs::metadata(&path) {
                Ok(metadata) if written_for(&metadata, asset) => {
                    self.claimed.insert(key);
                    return Ok(Placement::Present(path));
                }
                // Someone else's file under this name.
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.claimed.insert(key);
                    return Ok(Placement::New(path));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A finished download has the asset's size, when known, and its capture time as mtime.
fn written_for(metadata: &std::fs::Metadata, asset: &Asset) -> bool {
    if !metadata.is_file() {
        return false;
    }
    if asset.size.is_some_and(|size| size != metadata.len()) {
        return false;
    }
    match asset.created {
        Some(created) => {
            FileTime::from_last_modification_time(metadata).unix_seconds() == created.timestamp()
        }
        None => true,
    }
}

fn id_tag(id: &str) -> String {
    let tag: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    if !tag.is_empty() {
        return tag;
    }
    hex::encode(Sha256::digest(id.as_bytes()))[..8].to_string()
}

/// Downloads every asset captured on or before `cutoff` into `output_dir`.
/// Files already present are left alone.
pub async fn download_before<L: PhotoLibrary>(
    library: &L,
    cutoff: Cutoff,
    output_dir: &Path,
) -> anyhow::Result<DownloadSummary> {
    fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("Could not create output directory '{}'", output_dir.display()))?;

    let assets = qualifying(library.assets().await?, cutoff);
    println!(
        "Found {total} photos taken on or before {cutoff}. Saving to {dir}...",
        total = assets.len(),
        dir = output_dir.display()
    );

    let mut namer = FileNamer::default();
    let mut summary = DownloadSummary::default();
    let bar = progress_bar(assets.len());
    for asset in &assets {
        bar.set_message(asset.filename.clone());

        match namer.place(asset, output_dir) {
            Ok(Placement::Present(path)) => {
                debug!("{} already downloaded, skipping.", path.display());
                summary.skipped += 1;
            }
            Err(e) => {
                bar.suspend(|| warn!("Could not choose a file for {}: {e}", asset.filename));
                summary.failed += 1;
            }
            Ok(Placement::New(path)) => match save_asset(library, asset, &path).await {
                Ok(bytes) => {
                    bar.suspend(|| {
                        info!(
                            "Downloaded {} taken on {} ({bytes} bytes)",
                            asset.filename,
                            describe_date(asset)
                        )
                    });
                    summary.downloaded += 1;
                }
                Err(e) if e.is_fatal() => {
                    bar.abandon();
                    return Err(e).context("Session lost while downloading");
                }
                Err(e) => {
                    bar.suspend(|| warn!("Failed to download {}: {e}", asset.filename));
                    summary.failed += 1;
                }
            },
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    println!(
        "Downloaded {downloaded} photos to '{dir}'. {skipped} already present, {failed} failed.",
        downloaded = summary.downloaded,
        dir = output_dir.display(),
        skipped = summary.skipped,
        failed = summary.failed
    );
    Ok(summary)
}

async fn save_asset<L: PhotoLibrary>(
    library: &L,
    asset: &Asset,
    path: &Path,
) -> Result<u64, ClientError> {
    let partial = partial_path(path);
    let result = write_partial(library, asset, &partial).await;
    let bytes = match result {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = fs::remove_file(&partial).await;
            return Err(e);
        }
    };
    fs::rename(&partial, path).await?;

    if let Some(created) = asset.created {
        let mtime = FileTime::from_unix_time(created.timestamp(), 0);
        if let Err(e) = filetime::set_file_mtime(path, mtime) {
            warn!("Could not set modification time on {}: {e}", path.display());
        }
    }
    Ok(bytes)
}

async fn write_partial<L: PhotoLibrary>(
    library: &L,
    asset: &Asset,
    partial: &Path,
) -> Result<u64, ClientError> {
    let mut file = fs::File::create(partial).await?;
    let bytes = library.download(asset, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(bytes)
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(PARTIAL_EXTENSION);
    path.with_file_name(name)
}

fn describe_date(asset: &Asset) -> String {
    asset
        .capture_date()
        .map(|date| date.to_string())
        .unwrap_or_else(|| "an unknown date".to_string())
}

/// Deletes every asset captured on or before `cutoff`, after confirmation.
pub async fn delete_before<L: PhotoLibrary, P: Prompt>(
    library: &L,
    cutoff: Cutoff,
    options: DeleteOptions,
    prompt: &mut P,
) -> anyhow::Result<DeleteSummary> {
    let assets = qualifying(library.assets().await?, cutoff);
    let total = assets.len();
    let mut summary = DeleteSummary {
        candidates: total,
        ..Default::default()
    };
    println!("Found {total} photos to delete.");

    if total == 0 {
        println!("Nothing to delete.");
        return Ok(summary);
    }

    if options.dry_run {
        for asset in &assets {
            println!(
                "Would delete {} taken on {}{}",
                asset.filename,
                describe_date(asset),
                asset.size.map(|size| format!(" ({size} bytes)")).unwrap_or_default()
            );
        }
        return Ok(summary);
    }

    if !options.assume_yes {
        let answer = prompt
            .ask("Are you sure you want to delete these photos? This action cannot be undone. (yes/[no]): ")
            .context("Could not read confirmation")?;
        if !answer.eq_ignore_ascii_case("yes") {
            println!("Deletion canceled.");
            summary.cancelled = true;
            return Ok(summary);
        }
    }

    let bar = progress_bar(total);
    for asset in &assets {
        bar.set_message(asset.filename.clone());
        match library.delete(asset).await {
            Ok(()) => {
                bar.suspend(|| info!("Deleted {}", asset.filename));
                summary.deleted += 1;
            }
            Err(e) if e.is_fatal() => {
                bar.abandon();
                return Err(e).context("Session lost while deleting");
            }
            Err(e) => {
                bar.suspend(|| warn!("Failed to delete {}: {e}", asset.filename));
                summary.failed += 1;
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    println!("Deleted {} out of {total} photos.", summary.deleted);
    Ok(summary)
}
