//! Version-keyed binary cache with checksum-verified fetch.
//!
//! Layout is `<root>/cache/<version>/<name>`, one flat directory per
//! version. A file already present in the cache is reused as-is: the fast
//! path performs no re-verification, so a previously corrupted download is
//! never repaired automatically.

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::info;

use crate::constants::LocalPaths;

/// Return the cached path for `name` at `version`, fetching it first if the
/// cache misses.
///
/// On a miss the cache directory is created, the payload fetched from
/// `url`, verified against the checksum published at `checksum_url` (when
/// one is known), and persisted executable before the path is returned.
pub async fn cached_fetch(
    name: &str,
    version: &str,
    url: &str,
    checksum_url: Option<&str>,
    paths: &LocalPaths,
) -> Result<PathBuf> {
    let target_dir = paths.binary_cache_dir(version);
    let target = target_dir.join(name);

    // Present means done; no re-verification on the fast path.
    if target.is_file() {
        info!("using cached {} {}", name, version);
        return Ok(target);
    }

    tokio::fs::create_dir_all(&target_dir)
        .await
        .with_context(|| format!("creating cache dir {}", target_dir.display()))?;

    eprintln!("Downloading {} {}", name, version);
    let data = fetch_bytes(url)
        .await
        .with_context(|| format!("fetching {}", url))?;

    if let Some(checksum_url) = checksum_url {
        let expected = fetch_bytes(checksum_url)
            .await
            .with_context(|| format!("fetching checksum {}", checksum_url))?;
        let expected = String::from_utf8_lossy(&expected);
        let expected = expected.split_whitespace().next().unwrap_or_default();
        verify_checksum(&data, expected)
            .with_context(|| format!("verifying {} {}", name, version))?;
    }

    tokio::fs::write(&target, &data)
        .await
        .with_context(|| format!("writing {}", target.display()))?;
    let perms = std::os::unix::fs::PermissionsExt::from_mode(0o755);
    tokio::fs::set_permissions(&target, perms)
        .await
        .with_context(|| format!("marking {} executable", target.display()))?;
    eprintln!("Finished downloading {} {}", name, version);

    Ok(target)
}

async fn fetch_bytes(url: &str) -> Result<Vec<u8>> {
    let response = reqwest::get(url).await?.error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}

/// SHA-256 the payload and compare against the published hex digest.
fn verify_checksum(data: &[u8], expected_hex: &str) -> Result<()> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected_hex) {
        bail!("checksum mismatch: expected {}, got {}", expected_hex, actual);
    }
    Ok(())
}
