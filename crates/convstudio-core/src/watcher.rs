//! Polling watcher for the input and output directory trees

use crate::config::{WatchedRoot, WatcherConfig};
use crate::hub::{EventHub, Subscription};
use crate::types::{FileTreeEvent, FileTreeNode, NodeKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

struct WatcherInner {
    roots: Vec<WatchedRoot>,
    interval: Duration,
    hub: EventHub<FileTreeEvent>,
    last: Mutex<HashMap<String, FileTreeEvent>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

/// Publishes a fresh snapshot of a root whenever its tree changes
#[derive(Clone)]
pub struct DirectoryWatcher {
    inner: Arc<WatcherInner>,
}

impl DirectoryWatcher {
    pub fn new(config: &WatcherConfig, subscriber_capacity: usize) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                roots: config.roots.clone(),
                interval: config.poll_interval(),
                hub: EventHub::new(subscriber_capacity),
                last: Mutex::new(HashMap::new()),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<FileTreeEvent> {
        self.inner.hub.subscribe()
    }

    pub fn hub(&self) -> &EventHub<FileTreeEvent> {
        &self.inner.hub
    }

    /// Last published snapshot of every root, in configuration order
    pub fn latest(&self) -> Vec<FileTreeEvent> {
        let last = self.inner.last.lock();
        self.inner
            .roots
            .iter()
            .filter_map(|root| last.get(&root.id).cloned())
            .collect()
    }

    /// Snapshot every root once; returns how many updates were published
    pub async fn poll_once(&self) -> usize {
        let mut published = 0;
        for root in &self.inner.roots {
            let path = root.path.clone();
            let data = match tokio::task::spawn_blocking(move || snapshot(&path)).await {
                Ok(Ok(data)) => data,
                Ok(Err(e)) => {
                    tracing::warn!("Failed to list {} ({:?}): {}", root.id, root.path, e);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Snapshot task for {} failed: {}", root.id, e);
                    continue;
                }
            };

            let event = FileTreeEvent::FileTreeUpdate {
                folder_type: root.id.clone(),
                data,
            };
            {
                let mut last = self.inner.last.lock();
                if last.get(&root.id) == Some(&event) {
                    continue;
                }
                last.insert(root.id.clone(), event.clone());
            }
            tracing::debug!("File tree of {} changed", root.id);
            self.inner.hub.publish(event);
            published += 1;
        }
        published
    }

    /// Spawn the polling loop. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Directory watcher already running");
            return false;
        }

        let watcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watcher.inner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = watcher.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        watcher.poll_once().await;
                    }
                }
            }
            tracing::info!("Directory watcher stopped");
        });

        tracing::info!(
            "Watching {} roots every {:?}",
            self.inner.roots.len(),
            self.inner.interval
        );
        true
    }

    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.hub.close();
    }
}

/// Recursive listing of `root`; a missing root is an empty tree
pub fn snapshot(root: &Path) -> std::io::Result<Vec<FileTreeNode>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    list_dir(root, "")
}

fn list_dir(dir: &Path, prefix: &str) -> std::io::Result<Vec<FileTreeNode>> {
    let mut nodes = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("Skipping unreadable entry in {:?}: {}", dir, e);
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };

        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        // Symlinked directories are not followed
        if file_type.is_dir() {
            let children = list_dir(&entry.path(), &path).unwrap_or_else(|e| {
                tracing::debug!("Cannot list {:?}: {}", entry.path(), e);
                Vec::new()
            });
            nodes.push(FileTreeNode {
                name,
                path,
                kind: NodeKind::Folder,
                size: None,
                modified: None,
                children,
            });
        } else {
            let meta = entry.metadata().ok();
            nodes.push(FileTreeNode {
                name,
                path,
                kind: NodeKind::File,
                size: meta.as_ref().map(|m| m.len()),
                modified: meta
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs_f64()),
                children: Vec::new(),
            });
        }
    }

    nodes.sort_by(|a, b| {
        let rank = |n: &FileTreeNode| matches!(n.kind, NodeKind::File);
        rank(a)
            .cmp(&rank(b))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(nodes)
}
