//! Collision-free naming for received files
// (c) 2025 droplink contributors

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Directory used when none is configured, relative to the working directory
pub const DEFAULT_INCOMING_DIR: &str = "received";

/// Produces destination paths for incoming file payloads.
///
/// Two transfers declaring the same file name must never land on the same
/// path, including transfers arriving within the same millisecond, so each
/// name combines a receive-time timestamp with a monotonic sequence number.
/// The original name survives as the suffix (extension included) for later
/// handler use; it is not trusted, though: any directory components the peer
/// smuggled into it are stripped so a name like `../../x` cannot escape the
/// incoming directory.
#[derive(Debug)]
pub struct IncomingFiles {
    dir: PathBuf,
    seq: AtomicU64,
}

impl Default for IncomingFiles {
    fn default() -> Self {
        Self::new(DEFAULT_INCOMING_DIR)
    }
}

impl IncomingFiles {
    /// Creates a namer rooted at `dir`. The directory itself is created
    /// lazily, on the first call to [`name_for`](Self::name_for).
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    /// The directory received files are written into
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Picks a fresh destination path for a file the peer calls
    /// `original_name`, creating the incoming directory if needed.
    ///
    /// The returned path does not exist at the time of return. Never
    /// overwrites: if a candidate somehow exists already (say, a leftover
    /// from an earlier process run in the same millisecond), the sequence
    /// number advances and we try again.
    pub async fn name_for(&self, original_name: &str) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let base = sanitise(original_name);
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        loop {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let candidate = self.dir.join(format!("{stamp}-{seq:04}_{base}"));
            if !tokio::fs::try_exists(&candidate).await? {
                debug!("naming incoming {original_name:?} as {}", candidate.display());
                return Ok(candidate);
            }
        }
    }
}

/// Reduces a peer-supplied name to a single safe path component.
fn sanitise(name: &str) -> &str {
    // Strip directory components under either separator convention; the
    // sending platform is not necessarily ours.
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base {
        "" | "." | ".." => "unnamed",
        other => other,
    }
}
