//! Temporary artifacts for in-progress downloads.
//!
//! While a file is transferring, its bytes live next to the destination in
//! `.<basename>.<token>.tmp`. The token is the first 16 hex characters of
//! SHA-256 over `METHOD URL`, so a retry of the same request finds its own
//! artifact again. Artifacts left behind by other requests for the same
//! destination are still accepted for resumption.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::request::Method;

/// Hex characters in an artifact token.
pub const TOKEN_LEN: usize = 16;

/// `.<base>.<token>.tmp`, where the token holds no dot.
#[allow(clippy::expect_used)]
static TEMP_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\.(.+)\.([^.]+)\.tmp$").expect("temp name regex is valid"));

/// Splits an artifact file name into its base name and token.
#[must_use]
pub fn parse_temp_name(name: &str) -> Option<(&str, &str)> {
    let captures = TEMP_NAME.captures(name)?;
    let base = captures.get(1)?.as_str();
    let token = captures.get(2)?.as_str();
    Some((base, token))
}

/// Token identifying the artifact of one request.
#[must_use]
pub fn request_token(method: Method, url: &str) -> String {
    let digest = Sha256::digest(format!("{method} {url}").as_bytes());
    let mut token: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    token.truncate(TOKEN_LEN);
    token
}

/// Artifact path for `destination` with `token`.
#[must_use]
pub fn temp_path(destination: &Path, token: &str) -> PathBuf {
    let base = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    parent_dir(destination).join(format!(".{base}.{token}.tmp"))
}

/// Finds a resumable artifact for `destination`.
///
/// An artifact carrying `token` wins; otherwise the first other artifact
/// for the same base name in name order is returned.
pub async fn find_resumable(destination: &Path, token: &str) -> Option<PathBuf> {
    let base = destination.file_name()?.to_string_lossy().into_owned();
    let mut entries = tokio::fs::read_dir(parent_dir(destination)).await.ok()?;

    let mut candidates = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some((found_base, found_token)) = parse_temp_name(name) else {
            continue;
        };
        if found_base != base {
            continue;
        }
        if !entry.file_type().await.is_ok_and(|kind| kind.is_file()) {
            continue;
        }
        if found_token == token {
            return Some(entry.path());
        }
        candidates.push(entry.path());
    }

    candidates.sort();
    let found = candidates.into_iter().next();
    if let Some(path) = &found {
        debug!(path = %path.display(), "reusing artifact from another request");
    }
    found
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
