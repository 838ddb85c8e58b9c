//! Best-effort preload of cached container images onto the instance.
//!
//! Runs off the critical path: `update_cluster` spawns this and never waits
//! on it, so failures are logged and aggregated but must not fail an
//! install. Images whose tarball is not in the cache are skipped.

use anyhow::{Result, bail};
use std::path::Path;
use tracing::{debug, warn};

use crate::assets::CopyableFile;
use crate::runner::CommandRunner;

/// Copy each cached image tarball to the instance and `docker load` it.
pub async fn load_images(
    runner: &dyn CommandRunner,
    images: &[String],
    cache_dir: &Path,
) -> Result<()> {
    let mut failed = Vec::new();
    for image in images {
        let tarball = cache_dir.join(sanitized_tarball_name(image));
        if !tarball.is_file() {
            debug!("no cached tarball for {}, skipping", image);
            continue;
        }
        if let Err(e) = load_one(runner, image, &tarball).await {
            warn!("loading cached image {}: {:#}", image, e);
            failed.push(image.clone());
        }
    }
    if !failed.is_empty() {
        bail!("failed to load cached images: {}", failed.join(", "));
    }
    Ok(())
}

async fn load_one(runner: &dyn CommandRunner, image: &str, tarball: &Path) -> Result<()> {
    let remote_name = sanitized_tarball_name(image);
    let file = CopyableFile::from_file(tarball, "/tmp", &remote_name, "0644")?;
    runner.copy(&file).await?;
    runner
        .combined_output(&format!("docker load -i /tmp/{}", remote_name))
        .await?;
    Ok(())
}

/// Registry paths and tags are not filesystem-safe; flatten them.
fn sanitized_tarball_name(image: &str) -> String {
    format!("{}.tar", image.replace(['/', ':'], "_"))
}
