//! File watcher feeding the dev session.
//!
//! Raw `notify` events are filtered, classified as add/change/unlink and
//! coalesced: a batch is flushed once no event arrived for
//! [`COALESCE_WINDOW`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hotwire_core::{DevConfig, FileEventKind};
use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// Event coalescing window.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(50);

/// Directory names never watched, wherever they appear.
const IGNORED_NAMES: &[&str] = &["node_modules", ".git"];

/// One coalesced batch: files grouped by event kind.
pub type WatchBatch = Vec<(FileEventKind, Vec<PathBuf>)>;

/// Paths the watcher drops.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    dirs: Vec<PathBuf>,
}

impl IgnoreRules {
    pub fn for_config(config: &DevConfig) -> Self {
        Self {
            dirs: vec![config.cache_dir()],
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        self.dirs.iter().any(|dir| path.starts_with(dir))
            || path
                .components()
                .any(|c| IGNORED_NAMES.iter().any(|name| c.as_os_str() == *name))
    }
}

/// Watch `root` recursively. Dropping the returned watcher stops it.
pub fn spawn(
    root: &Path,
    ignore: IgnoreRules,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<WatchBatch>)> {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<(FileEventKind, PathBuf)>();
    let (batch_tx, batch_rx) = mpsc::unbounded_channel();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for (kind, path) in classify(&event) {
                    if ignore.is_ignored(&path) {
                        continue;
                    }
                    if raw_tx.send((kind, path)).is_err() {
                        trace!("watch consumer gone");
                    }
                }
            }
            Err(e) => error!(error = %e, "watch error"),
        },
        Config::default(),
    )?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    debug!(root = %root.display(), "watching project");

    tokio::spawn(coalesce(raw_rx, batch_tx, COALESCE_WINDOW));
    Ok((watcher, batch_rx))
}

/// Map one notify event to (kind, path) pairs. Directory and metadata
/// events are dropped.
fn classify(event: &Event) -> Vec<(FileEventKind, PathBuf)> {
    let kind = match &event.kind {
        EventKind::Create(CreateKind::File | CreateKind::Any)
        | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FileEventKind::Add,
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => FileEventKind::Change,
        EventKind::Remove(RemoveKind::File | RemoveKind::Any)
        | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => FileEventKind::Unlink,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            return match event.paths.as_slice() {
                [from, to] => vec![
                    (FileEventKind::Unlink, from.clone()),
                    (FileEventKind::Add, to.clone()),
                ],
                _ => Vec::new(),
            };
        }
        _ => return Vec::new(),
    };
    event.paths.iter().map(|path| (kind, path.clone())).collect()
}

/// Combine two events for the same path within one window.
fn merge(previous: Option<FileEventKind>, next: FileEventKind) -> FileEventKind {
    match (previous, next) {
        (Some(FileEventKind::Add), FileEventKind::Change) => FileEventKind::Add,
        (Some(FileEventKind::Unlink), FileEventKind::Add) => FileEventKind::Change,
        (_, next) => next,
    }
}

fn group(pending: BTreeMap<PathBuf, FileEventKind>) -> WatchBatch {
    let mut batch: WatchBatch = Vec::new();
    for kind in [FileEventKind::Unlink, FileEventKind::Add, FileEventKind::Change] {
        let files: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, k)| **k == kind)
            .map(|(path, _)| path.clone())
            .collect();
        if !files.is_empty() {
            batch.push((kind, files));
        }
    }
    batch
}

async fn coalesce(
    mut rx: mpsc::UnboundedReceiver<(FileEventKind, PathBuf)>,
    tx: mpsc::UnboundedSender<WatchBatch>,
    window: Duration,
) {
    let mut pending: BTreeMap<PathBuf, FileEventKind> = BTreeMap::new();
    loop {
        match tokio::time::timeout(window, rx.recv()).await {
            Ok(Some((kind, path))) => {
                let merged = merge(pending.get(&path).copied(), kind);
                pending.insert(path, merged);
            }
            Ok(None) => {
                debug!("watch event channel closed");
                break;
            }
            Err(_) => {
                if pending.is_empty() {
                    continue;
                }
                debug!(count = pending.len(), "processing coalesced file events");
                if tx.send(group(std::mem::take(&mut pending))).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_rules() {
        let mut config = DevConfig::for_root("/app");
        config.cache_dir = Some(PathBuf::from(".cache/hotwire"));
        let rules = IgnoreRules::for_config(&config);
        assert!(rules.is_ignored(Path::new("/app/node_modules/react/index.js")));
        assert!(rules.is_ignored(Path::new("/app/packages/ui/node_modules/x.js")));
        assert!(rules.is_ignored(Path::new("/app/.git/HEAD")));
        assert!(rules.is_ignored(Path::new("/app/.cache/hotwire/deps/_metadata.json")));
        assert!(!rules.is_ignored(Path::new("/app/src/main.js")));
    }

    #[test]
    fn test_classify_rename_both() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/app/a.js"))
            .add_path(PathBuf::from("/app/b.js"));
        assert_eq!(
            classify(&event),
            vec![
                (FileEventKind::Unlink, PathBuf::from("/app/a.js")),
                (FileEventKind::Add, PathBuf::from("/app/b.js")),
            ]
        );
    }

    #[test]
    fn test_classify_ignores_metadata() {
        let event = Event::new(EventKind::Modify(ModifyKind::Metadata(
            notify::event::MetadataKind::Permissions,
        )))
        .add_path(PathBuf::from("/app/a.js"));
        assert!(classify(&event).is_empty());
    }

    #[test]
    fn test_merge_rules() {
        assert_eq!(merge(Some(FileEventKind::Add), FileEventKind::Change), FileEventKind::Add);
        assert_eq!(merge(Some(FileEventKind::Unlink), FileEventKind::Add), FileEventKind::Change);
        assert_eq!(merge(Some(FileEventKind::Change), FileEventKind::Unlink), FileEventKind::Unlink);
        assert_eq!(merge(None, FileEventKind::Change), FileEventKind::Change);
    }

    #[tokio::test]
    async fn test_events_within_window_form_one_batch() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        tokio::spawn(coalesce(raw_rx, batch_tx, Duration::from_millis(30)));

        raw_tx.send((FileEventKind::Change, PathBuf::from("/app/a.js"))).unwrap();
        raw_tx.send((FileEventKind::Add, PathBuf::from("/app/new.js"))).unwrap();
        raw_tx.send((FileEventKind::Change, PathBuf::from("/app/new.js"))).unwrap();
        raw_tx.send((FileEventKind::Change, PathBuf::from("/app/a.js"))).unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(2), batch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            batch,
            vec![
                (FileEventKind::Add, vec![PathBuf::from("/app/new.js")]),
                (FileEventKind::Change, vec![PathBuf::from("/app/a.js")]),
            ]
        );
    }
}
