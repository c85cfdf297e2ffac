//! Debounced filesystem watching for the `updated_project_info` broadcast.
//!
//! Raw notify events stream into a dedicated thread that coalesces them:
//! a batch is released only after the watched roots have been quiet for the
//! debounce window, and within a batch each absolute path appears once with
//! its most recent change type.

use std::{
    collections::HashMap,
    path::PathBuf,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, select, unbounded, Sender};
use jod_thread::JoinHandle;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::bus::interface::{FileChangeEvent, FileChangeType};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

pub type ChangeListener = Box<dyn Fn(Vec<FileChangeEvent>) + Send>;

/// Watches the project roots and delivers debounced change batches to a
/// single listener.
///
/// Dropping the watcher stops the debounce thread; the thread is reached
/// only through channels.
pub struct ChangeWatcher {
    shutdown_sender: Sender<()>,

    /// Joined on drop, after the shutdown signal lands.
    #[allow(unused)]
    job_thread: JoinHandle<()>,
}

impl ChangeWatcher {
    pub fn start(roots: Vec<PathBuf>, listener: ChangeListener) -> Result<Self, notify::Error> {
        let roots = dedupe_roots(roots);

        let (event_sender, event_receiver) = unbounded::<FileChangeEvent>();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                match result {
                    Ok(event) => {
                        let Some(change_type) = classify(&event.kind) else {
                            return;
                        };
                        for path in event.paths {
                            let _ = event_sender.send(FileChangeEvent {
                                change_type,
                                absolute_path: path.to_string_lossy().into_owned(),
                            });
                        }
                    }
                    Err(err) => {
                        log::warn!("File watcher error: {}", err);
                    }
                }
            })?;

        for root in &roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            log::debug!("Watching {}", root.display());
        }

        let (shutdown_sender, shutdown_receiver) = bounded(1);

        let job_thread = jod_thread::Builder::new()
            .name("ChangeWatcher thread".to_owned())
            .spawn(move || {
                // Owning the watcher here keeps the notify backend alive for
                // the thread's lifetime.
                let _watcher = watcher;

                let mut pending: HashMap<String, FileChangeType> = HashMap::new();
                let mut deadline: Option<Instant> = None;

                loop {
                    let timeout = match deadline {
                        Some(due) => due
                            .saturating_duration_since(Instant::now())
                            .max(Duration::from_millis(5)),
                        None => Duration::from_millis(500),
                    };

                    select! {
                        recv(event_receiver) -> event => {
                            let Ok(event) = event else { return };
                            // Most recent change type wins per path.
                            pending.insert(event.absolute_path, event.change_type);
                            deadline = Some(Instant::now() + DEBOUNCE_WINDOW);
                        },
                        recv(shutdown_receiver) -> _ => {
                            return;
                        },
                        default(timeout) => {
                            let due = deadline.is_some_and(|due| Instant::now() >= due);
                            if due && !pending.is_empty() {
                                let mut batch: Vec<FileChangeEvent> = pending
                                    .drain()
                                    .map(|(absolute_path, change_type)| FileChangeEvent {
                                        change_type,
                                        absolute_path,
                                    })
                                    .collect();
                                batch.sort_by(|a, b| a.absolute_path.cmp(&b.absolute_path));
                                deadline = None;
                                listener(batch);
                            } else if due {
                                deadline = None;
                            }
                        },
                    }
                }
            })
            .expect("Could not start ChangeWatcher thread");

        Ok(ChangeWatcher {
            shutdown_sender,
            job_thread,
        })
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        let _ = self.shutdown_sender.send(());
    }
}

fn classify(kind: &EventKind) -> Option<FileChangeType> {
    match kind {
        EventKind::Create(_) => Some(FileChangeType::Added),
        EventKind::Remove(_) => Some(FileChangeType::Removed),
        EventKind::Modify(_) => Some(FileChangeType::Changed),
        _ => None,
    }
}

/// Drops any root that lives under another root; the parent's recursive
/// watch already covers it.
fn dedupe_roots(roots: Vec<PathBuf>) -> Vec<PathBuf> {
    let canonical: Vec<PathBuf> = roots
        .into_iter()
        .map(|root| root.canonicalize().unwrap_or(root))
        .collect();

    let mut kept: Vec<PathBuf> = Vec::new();
    for root in &canonical {
        let absorbed = canonical
            .iter()
            .any(|other| other != root && root.starts_with(other));
        if !absorbed && !kept.contains(root) {
            kept.push(root.clone());
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    #[test]
    fn descendant_roots_are_absorbed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let nested = root.join("packages/app");
        fs_err::create_dir_all(&nested).unwrap();

        let kept = dedupe_roots(vec![root.clone(), nested, root.clone()]);
        assert_eq!(kept, vec![root]);
    }

    #[test]
    fn changes_coalesce_into_one_batch_per_quiet_window() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let batches: Arc<Mutex<Vec<Vec<FileChangeEvent>>>> = Arc::new(Mutex::new(Vec::new()));
        let batches_handle = Arc::clone(&batches);

        let _watcher = ChangeWatcher::start(
            vec![root.clone()],
            Box::new(move |batch| {
                batches_handle.lock().unwrap().push(batch);
            }),
        )
        .unwrap();

        // Give the watcher backend a moment to arm before generating events.
        std::thread::sleep(Duration::from_millis(250));

        fs_err::write(root.join("a.tsx"), "one").unwrap();
        fs_err::write(root.join("a.tsx"), "two").unwrap();
        fs_err::write(root.join("b.tsx"), "three").unwrap();

        // Wait out the debounce window plus scheduling slack.
        std::thread::sleep(Duration::from_millis(900));

        let batches = batches.lock().unwrap();
        assert!(!batches.is_empty(), "expected at least one batch");

        // Each batch mentions a path at most once.
        for batch in batches.iter() {
            let mut paths: Vec<&str> =
                batch.iter().map(|event| event.absolute_path.as_str()).collect();
            let before = paths.len();
            paths.dedup();
            assert_eq!(before, paths.len());
        }

        let all: Vec<&FileChangeEvent> = batches.iter().flatten().collect();
        assert!(all.iter().any(|event| event.absolute_path.ends_with("a.tsx")));
        assert!(all.iter().any(|event| event.absolute_path.ends_with("b.tsx")));
    }
}
