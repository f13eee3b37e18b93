use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use anyhow::Context as _;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;

use crate::monitor::log::{log_err, log_msg, Severity};

/// Hard ceiling on symlink hops along the configuration path; prevents
/// watch-set construction from chasing a cycle.
const MAX_SYMLINK_HOPS: usize = 100;

/// What a batch of filesystem events means for the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfEvent {
    /// The configuration file itself was written or replaced.
    Changed,
    /// A symbolic link on the configured path was repointed; the canonical
    /// path must be re-resolved and all watches rebuilt.
    PathSwapped,
}

/// Watches the configuration file, its directory, and the parent directory
/// of every symbolic-link hop along the configured (uncanonicalized) path,
/// so that both direct writes and atomic link swaps trigger a reload.
pub struct ConfWatcher {
    original_path: PathBuf,
    canonical_path: PathBuf,
    confdir: PathBuf,
    watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    /// Directory path to the set of basenames that are symlink hops under
    /// it. Rebuilt on every swap.
    hop_watches: HashMap<PathBuf, HashSet<OsString>>,
}

impl ConfWatcher {
    /// Canonicalize `original_path` and install the full watch set.
    /// Failures here are startup-fatal.
    pub fn new(original_path: &Path) -> anyhow::Result<ConfWatcher> {
        let canonical_path = std::fs::canonicalize(original_path)
            .with_context(|| format!("No configuration file at {}", original_path.display()))?;
        let confdir = canonical_path
            .parent()
            .context("configuration file has no parent directory")?
            .to_path_buf();

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .context("create filesystem watcher")?;

        let mut this = ConfWatcher {
            original_path: original_path.to_path_buf(),
            canonical_path,
            confdir,
            watcher,
            rx,
            hop_watches: HashMap::new(),
        };

        this.watcher
            .watch(&this.canonical_path, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch conf file {}", this.canonical_path.display()))?;
        log_msg(
            Severity::Info,
            format!("Watching config file {}", this.canonical_path.display()),
        );
        this.watcher
            .watch(&this.confdir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch conf dir {}", this.confdir.display()))?;
        log_msg(Severity::Info, format!("Watching config dir {}", this.confdir.display()));

        this.hop_watches = symlink_hops(&this.original_path)?;
        let dirs: Vec<PathBuf> = this.hop_watches.keys().cloned().collect();
        for dir in dirs {
            this.watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("watch symlink parent {}", dir.display()))?;
            log_msg(
                Severity::Info,
                format!("Watching parent directory of symlink under {}", dir.display()),
            );
        }

        Ok(this)
    }

    pub fn canonical_path(&self) -> &Path {
        &self.canonical_path
    }

    /// Wait for the next event that concerns the configuration path. Watch
    /// backend errors are logged and skipped.
    pub async fn next_event(&mut self) -> ConfEvent {
        loop {
            match self.rx.recv().await {
                Some(Ok(event)) => {
                    if let Some(verdict) = self.classify(&event) {
                        return verdict;
                    }
                }
                Some(Err(e)) => {
                    log_msg(Severity::Warning, format!("Filesystem watch error: {e}"));
                }
                // The sender lives inside our own watcher; it cannot close
                // while we exist.
                None => std::future::pending::<()>().await,
            }
        }
    }

    fn classify(&self, event: &notify::Event) -> Option<ConfEvent> {
        let created_or_moved_in = matches!(
            event.kind,
            EventKind::Create(_)
                | EventKind::Modify(ModifyKind::Name(
                    RenameMode::To | RenameMode::Both | RenameMode::Any
                ))
        );
        let write_closed = matches!(
            event.kind,
            EventKind::Access(AccessKind::Close(AccessMode::Write))
        );

        for path in &event.paths {
            if created_or_moved_in {
                if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
                    if self
                        .hop_watches
                        .get(parent)
                        .is_some_and(|names| names.contains(name))
                    {
                        log_msg(
                            Severity::Info,
                            format!("Changes detected on watched symlink {}", path.display()),
                        );
                        return Some(ConfEvent::PathSwapped);
                    }
                }
            }

            if *path == self.canonical_path && (write_closed || created_or_moved_in) {
                return Some(ConfEvent::Changed);
            }
        }

        None
    }

    /// Re-establish the watch set after a reload trigger. The conffile and
    /// confdir watches are always dropped and re-added because a replaced
    /// file carries a new inode. With `swapped`, the canonical path is
    /// re-resolved and the symlink-hop watches are rebuilt first.
    ///
    /// Returns `Ok(false)` when re-resolution failed and the reload should
    /// be skipped, and `Err` when the configuration file can no longer be
    /// watched, which is fatal.
    pub fn reinstall(&mut self, swapped: bool) -> anyhow::Result<bool> {
        if swapped {
            let resolved = match std::fs::canonicalize(&self.original_path) {
                Ok(p) => p,
                Err(e) => {
                    log_err(
                        "realpath",
                        &e,
                        format!(
                            "Error re-resolving {}, continuing",
                            self.original_path.display()
                        ),
                    );
                    return Ok(false);
                }
            };

            let dirs: Vec<PathBuf> = self.hop_watches.keys().cloned().collect();
            for dir in dirs {
                if self.watcher.unwatch(&dir).is_err() {
                    log_msg(
                        Severity::Info,
                        format!("Could not remove watch on {}, continuing", dir.display()),
                    );
                }
            }
            self.hop_watches.clear();

            self.remove_conf_watches();
            self.canonical_path = resolved;
            self.confdir = self
                .canonical_path
                .parent()
                .context("configuration file has no parent directory")?
                .to_path_buf();
        } else {
            self.remove_conf_watches();
        }

        // Losing the ability to watch the configuration file leaves the
        // monitor blind to further changes; treat it as fatal.
        self.watcher
            .watch(&self.canonical_path, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch conf file {}", self.canonical_path.display()))?;
        log_msg(
            Severity::Info,
            format!("Watching config file {}", self.canonical_path.display()),
        );
        self.watcher
            .watch(&self.confdir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch conf dir {}", self.confdir.display()))?;
        log_msg(Severity::Info, format!("Watching config dir {}", self.confdir.display()));

        if swapped {
            match symlink_hops(&self.original_path) {
                Ok(hops) => {
                    self.hop_watches = hops;
                    let dirs: Vec<PathBuf> = self.hop_watches.keys().cloned().collect();
                    for dir in dirs {
                        if let Err(e) = self.watcher.watch(&dir, RecursiveMode::NonRecursive) {
                            log_msg(
                                Severity::Warning,
                                format!("Unable to watch symlink parent {}: {e}", dir.display()),
                            );
                        }
                    }
                }
                Err(e) => {
                    // The next reload rebuilds from scratch and retries.
                    log_msg(Severity::Warning, format!("Unable to rebuild symlink watches: {e:#}"));
                }
            }
        }

        Ok(true)
    }

    fn remove_conf_watches(&mut self) {
        if self.watcher.unwatch(&self.canonical_path).is_err() {
            log_msg(Severity::Info, "Could not remove conf file watch, continuing");
        }
        if self.watcher.unwatch(&self.confdir).is_err() {
            log_msg(Severity::Info, "Could not remove conf dir watch, continuing");
        }
    }
}

/// Walk every prefix of `path` and, for each symbolic link encountered
/// (following chains link by link), record the link's basename under its
/// parent directory. The returned map is the watch set that detects atomic
/// swaps of any hop.
pub fn symlink_hops(path: &Path) -> anyhow::Result<HashMap<PathBuf, HashSet<OsString>>> {
    let mut hops: HashMap<PathBuf, HashSet<OsString>> = HashMap::new();

    let mut prefix = PathBuf::new();
    for component in path.components() {
        prefix.push(component);
        if matches!(component, Component::RootDir | Component::Prefix(_)) {
            continue;
        }

        let mut subpath = prefix.clone();
        let mut level = 0;
        loop {
            let meta = std::fs::symlink_metadata(&subpath)
                .with_context(|| format!("lstat {}", subpath.display()))?;
            if !meta.file_type().is_symlink() {
                break;
            }
            level += 1;
            if level > MAX_SYMLINK_HOPS {
                anyhow::bail!("Too many nested symlinks in path {}", path.display());
            }

            let parent = subpath
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"));
            let name = subpath
                .file_name()
                .with_context(|| format!("symlink {} has no basename", subpath.display()))?
                .to_os_string();
            hops.entry(parent.clone()).or_default().insert(name);

            let target = std::fs::read_link(&subpath)
                .with_context(|| format!("readlink {}", subpath.display()))?;
            subpath = if target.is_absolute() {
                target
            } else {
                parent.join(target)
            };
        }
    }

    Ok(hops)
}

/// Make a path absolute without resolving symlinks, against the current
/// working directory. The original (non-canonical) path is what the
/// symlink-hop walk operates on.
pub fn absolute_path(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("getcwd")?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::fs::symlink;

    // Tests build their fixtures under a canonicalized root so the only
    // symlink hops present are the ones they create.

    #[test]
    fn plain_path_has_no_hops() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let conf = root.join("fdb.conf");
        std::fs::write(&conf, "").unwrap();
        assert!(symlink_hops(&conf).unwrap().is_empty());
    }

    #[test]
    fn link_hop_records_parent_and_basename() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let releases = root.join("releases");
        std::fs::create_dir(&releases).unwrap();
        std::fs::write(releases.join("fdb.conf"), "").unwrap();
        let current = root.join("current");
        symlink(&releases, &current).unwrap();

        let hops = symlink_hops(&current.join("fdb.conf")).unwrap();
        let names = hops.get(&root).expect("parent dir watched");
        assert!(names.contains(&OsString::from("current")));
        assert_eq!(hops.len(), 1);
    }

    #[test]
    fn chained_links_are_all_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let real = root.join("real");
        std::fs::create_dir(&real).unwrap();
        std::fs::write(real.join("fdb.conf"), "").unwrap();
        let second = root.join("second");
        symlink(&real, &second).unwrap();
        let first = root.join("first");
        symlink("second", &first).unwrap();

        let hops = symlink_hops(&first.join("fdb.conf")).unwrap();
        let names = hops.get(&root).expect("parent dir watched");
        assert!(names.contains(&OsString::from("first")));
        assert!(names.contains(&OsString::from("second")));
    }

    #[test]
    fn symlink_cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let a = root.join("a");
        let b = root.join("b");
        symlink("b", &a).unwrap();
        symlink("a", &b).unwrap();

        let err = symlink_hops(&a.join("fdb.conf")).unwrap_err();
        assert!(err.to_string().contains("Too many nested symlinks"));
    }
}
