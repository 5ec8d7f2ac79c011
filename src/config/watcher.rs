//! Debounced catalog file watcher.
//!
//! A background task polls the catalog file's metadata every 100 ms and,
//! after a 100 ms debounce to coalesce multi-write editors, reloads the
//! file and delivers the freshly parsed catalog together with a per-field
//! diff. An unparseable file is logged and ignored; the in-memory catalog
//! is preserved.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::catalog::Catalog;
use crate::core::events::ConfigDiff;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEBOUNCE: Duration = Duration::from_millis(100);

/// A change delivered to the supervisor: the new catalog and its diff
/// against the previous one.
#[derive(Debug, Clone)]
pub struct CatalogChange {
    pub catalog: Catalog,
    pub diff: ConfigDiff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSignature {
    modified: Option<SystemTime>,
    len: u64,
}

fn signature(path: &std::path::Path) -> Option<FileSignature> {
    let meta = std::fs::metadata(path).ok()?;
    Some(FileSignature {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

/// Spawn the watcher task. It runs until `token` is cancelled.
///
/// `baseline` is the catalog currently held in memory; diffs are computed
/// against the last successfully loaded state.
pub fn spawn_watcher(
    path: PathBuf,
    baseline: Catalog,
    token: CancellationToken,
    tx: mpsc::Sender<CatalogChange>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_sig = signature(&path);
        let mut last_catalog = baseline;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(path = %path.display(), "catalog watcher stopping");
                    return;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let sig = signature(&path);
            if sig == last_sig {
                continue;
            }
            // Let editors finish their write burst before reading.
            tokio::time::sleep(DEBOUNCE).await;
            last_sig = signature(&path);

            if last_sig.is_none() {
                // File deleted; treat like an absent catalog only once it
                // reappears. Nothing to reload now.
                continue;
            }

            debug!(path = %path.display(), "catalog file changed, reloading");
            match Catalog::load(&path) {
                Ok(catalog) => {
                    let diff = last_catalog.diff(&catalog);
                    if diff.is_empty() {
                        continue;
                    }
                    last_catalog = catalog.clone();
                    if tx.send(CatalogChange { catalog, diff }).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring invalid catalog change");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const INITIAL: &str = r#"{"servers":{"zebra":{"command":"echo z"},"alpha":{"command":"echo a"},"beta":{"command":"echo b"}}}"#;
    const REORDERED: &str = r#"{"servers":{"gamma":{"command":"echo g"},"alpha":{"command":"echo a"},"beta":{"command":"echo b"}}}"#;

    #[tokio::test]
    async fn rewrite_fires_a_diff_within_half_a_second() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, INITIAL).unwrap();

        let baseline = Catalog::load(&path).unwrap();
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_watcher(path.clone(), baseline, token.clone(), tx);

        // Give the watcher a tick to record the initial signature, then
        // rewrite with a different length so the signature changes even on
        // coarse-mtime filesystems.
        tokio::time::sleep(Duration::from_millis(150)).await;
        std::fs::write(&path, REORDERED).unwrap();

        let change = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("watcher did not fire in time")
            .expect("watcher channel closed");

        assert_eq!(change.catalog.server_order, vec!["gamma", "alpha", "beta"]);
        assert_eq!(change.diff.added, vec!["gamma"]);
        assert_eq!(change.diff.removed, vec!["zebra"]);

        token.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn invalid_rewrite_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, INITIAL).unwrap();

        let baseline = Catalog::load(&path).unwrap();
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_watcher(path.clone(), baseline, token.clone(), tx);

        tokio::time::sleep(Duration::from_millis(150)).await;
        std::fs::write(&path, "{ this is not json").unwrap();

        assert!(
            timeout(Duration::from_millis(400), rx.recv()).await.is_err(),
            "invalid catalog must not produce a change"
        );

        // A subsequent valid write still gets through.
        std::fs::write(&path, REORDERED).unwrap();
        let change = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("valid rewrite after garbage did not fire")
            .unwrap();
        assert_eq!(change.diff.removed, vec!["zebra"]);

        token.cancel();
        let _ = handle.await;
    }
}
