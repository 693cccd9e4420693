//! Display hotplug monitor.
//!
//! Watches a DRM device directory (default `/dev/dri`) and tracks which
//! `card*` nodes are present. Uses `notify` for change events and falls back
//! to periodic rescans when the directory cannot be watched.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use super::{Module, ModuleContext};
use crate::constants::MODULE_STOP_POLL;

/// Present connector nodes, shared with observers.
pub type DisplaySet = Arc<Mutex<BTreeSet<String>>>;

/// Hotplug monitor module.
#[derive(Debug)]
pub struct Hotplug {
    dir: PathBuf,
    poll: Duration,
    displays: DisplaySet,
}

/// Change between two scans.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Change {
    /// Newly present nodes.
    pub added: Vec<String>,
    /// Nodes that went away.
    pub removed: Vec<String>,
}

impl Change {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl Hotplug {
    /// Monitor `dir`, rescanning at least every `poll` when unwatched.
    pub fn new(dir: PathBuf, poll: Duration) -> Self {
        Self { dir, poll, displays: Arc::default() }
    }

    /// Handle to the current display set.
    pub fn displays(&self) -> DisplaySet {
        Arc::clone(&self.displays)
    }

    fn apply_scan(&self, ctx: &ModuleContext) {
        let now = scan_cards(&self.dir);
        let mut current = self.displays.lock().unwrap_or_else(PoisonError::into_inner);
        let change = diff(&current, &now);
        for name in &change.added {
            ctx.info(format!("display connected: {name}"));
        }
        for name in &change.removed {
            ctx.info(format!("display disconnected: {name}"));
        }
        *current = now;
    }
}

impl Module for Hotplug {
    fn name(&self) -> &str {
        "hotplug"
    }

    fn run(self: Box<Self>, ctx: ModuleContext) {
        let (tx, rx) = mpsc::channel();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .and_then(|mut w: RecommendedWatcher| {
            w.watch(&self.dir, RecursiveMode::NonRecursive)?;
            Ok(w)
        });
        let watcher = match watcher {
            Ok(w) => {
                ctx.debug(format!("watching {}", self.dir.display()));
                Some(w)
            }
            Err(e) => {
                ctx.error(format!(
                    "cannot watch {}: {e}; rescanning every {:?}",
                    self.dir.display(),
                    self.poll
                ));
                None
            }
        };
        let watching = watcher.is_some();

        self.apply_scan(&ctx);
        let mut last_scan = Instant::now();

        while !ctx.is_stopped() {
            let dirty = match rx.recv_timeout(MODULE_STOP_POLL) {
                Ok(Ok(_event)) => true,
                Ok(Err(e)) => {
                    ctx.error(format!("watch error: {e}"));
                    true
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    !watching && last_scan.elapsed() >= self.poll
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    if !ctx.wait(self.poll) {
                        break;
                    }
                    true
                }
            };
            if dirty {
                // Coalesce bursts of events into one rescan.
                while rx.try_recv().is_ok() {}
                self.apply_scan(&ctx);
                last_scan = Instant::now();
            }
        }
    }
}

/// Names of `card*` entries in `dir`. A missing directory yields nothing.
pub fn scan_cards(dir: &Path) -> BTreeSet<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return BTreeSet::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| is_card(name))
        .collect()
}

fn is_card(name: &str) -> bool {
    name.strip_prefix("card")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// What changed from `before` to `after`.
pub fn diff(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Change {
    Change {
        added: after.difference(before).cloned().collect(),
        removed: before.difference(after).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ModuleHost;
    use crate::runtime::{Runtime, SharedRuntime};

    #[test]
    fn test_card_names() {
        assert!(is_card("card0"));
        assert!(is_card("card12"));
        assert!(!is_card("card"));
        assert!(!is_card("renderD128"));
        assert!(!is_card("card0-HDMI-A-1"));
    }

    #[test]
    fn test_scan_and_diff() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("card0"), b"").unwrap();
        std::fs::write(tmp.path().join("renderD128"), b"").unwrap();
        let before = scan_cards(tmp.path());
        assert_eq!(before.iter().collect::<Vec<_>>(), vec!["card0"]);

        std::fs::write(tmp.path().join("card1"), b"").unwrap();
        std::fs::remove_file(tmp.path().join("card0")).unwrap();
        let change = diff(&before, &scan_cards(tmp.path()));
        assert_eq!(change.added, vec!["card1".to_owned()]);
        assert_eq!(change.removed, vec!["card0".to_owned()]);
        assert!(!change.is_empty());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        assert!(scan_cards(Path::new("/nonexistent/vrms-dri")).is_empty());
    }

    #[test]
    fn test_module_tracks_new_card() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("card0"), b"").unwrap();

        let module = Hotplug::new(tmp.path().to_path_buf(), Duration::from_millis(20));
        let displays = module.displays();
        let runtime: Arc<dyn Runtime> = Arc::new(SharedRuntime::default());
        let mut host = ModuleHost::new(runtime);
        host.spawn(Box::new(module)).unwrap();

        let has = |name: &str| displays.lock().unwrap().contains(name);
        for _ in 0..250 {
            if has("card0") {
                break;
            }
            std::thread::sleep(Duration::from_millis(4));
        }
        assert!(has("card0"));

        std::fs::write(tmp.path().join("card1"), b"").unwrap();
        for _ in 0..250 {
            if has("card1") {
                break;
            }
            std::thread::sleep(Duration::from_millis(4));
        }
        host.shutdown();
        assert!(has("card1"));
    }
}
