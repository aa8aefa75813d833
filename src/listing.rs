//! Bounded-parallelism snapshot-size listing (spec §5). Grounded on the
//! teacher's scoped-resource discipline ("files opened only while being
//! read, guaranteed release on every exit path"), extended here with
//! `tokio`'s semaphore/timeout/cancellation primitives — the teacher's
//! own workspace sibling crates already depend on `tokio` for similar
//! bounded-worker orchestration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

const MAX_CONCURRENT_WORKERS: usize = 3;
const PROGRESS_TICK: Duration = Duration::from_millis(200);
const PER_DIRECTORY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComputedSize {
    Bytes(u64),
    /// The hard wall-clock timeout fired before the walk completed.
    Timeout,
}

#[derive(Clone, Debug)]
pub struct SizeResult {
    pub path: PathBuf,
    pub size: ComputedSize,
}

/// One worker's live progress, read lock-free by the reporter.
struct ActiveWork {
    files_visited: Arc<AtomicU64>,
}

type ActiveMap = Arc<RwLock<HashMap<PathBuf, ActiveWork>>>;

async fn walk_directory_size(path: PathBuf, counter: Arc<AtomicU64>, cancel: CancellationToken) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![path];
    while let Some(dir) = stack.pop() {
        if cancel.is_cancelled() {
            break;
        }
        let entries = match tokio::task::spawn_blocking({
            let dir = dir.clone();
            move || std::fs::read_dir(&dir).map(|rd| rd.filter_map(|e| e.ok()).collect::<Vec<_>>())
        })
        .await
        {
            Ok(Ok(entries)) => entries,
            _ => continue,
        };
        for entry in entries {
            if cancel.is_cancelled() {
                break;
            }
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    total
}

async fn compute_one(path: PathBuf, active: ActiveMap) -> SizeResult {
    let counter = Arc::new(AtomicU64::new(0));
    active.write().await.insert(
        path.clone(),
        ActiveWork {
            files_visited: counter.clone(),
        },
    );

    let cancel = CancellationToken::new();
    let result = tokio::time::timeout(PER_DIRECTORY_TIMEOUT, walk_directory_size(path.clone(), counter, cancel.clone())).await;

    active.write().await.remove(&path);

    match result {
        Ok(bytes) => SizeResult {
            path,
            size: ComputedSize::Bytes(bytes),
        },
        Err(_) => {
            cancel.cancel();
            log::warn!("size computation for {} exceeded {:?}, reporting timeout", path.display(), PER_DIRECTORY_TIMEOUT);
            SizeResult {
                path,
                size: ComputedSize::Timeout,
            }
        }
    }
}

/// A lock-per-read, lock-per-write progress reporter that ticks every
/// 200 ms, logging how many files each in-flight worker has visited.
async fn progress_reporter(active: ActiveMap, stop: CancellationToken) {
    let mut interval = tokio::time::interval(PROGRESS_TICK);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let snapshot: Vec<(PathBuf, u64)> = active
                    .read()
                    .await
                    .iter()
                    .map(|(path, work)| (path.clone(), work.files_visited.load(Ordering::Relaxed)))
                    .collect();
                for (path, count) in snapshot {
                    log::debug!("{}: {count} files visited so far", path.display());
                }
            }
        }
    }
}

/// Compute the on-disk size of every path in `paths`, at most
/// [`MAX_CONCURRENT_WORKERS`] at a time.
pub async fn compute_sizes(paths: Vec<PathBuf>) -> Vec<SizeResult> {
    let active: ActiveMap = Arc::new(RwLock::new(HashMap::new()));
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_WORKERS));
    let stop_reporter = CancellationToken::new();

    let reporter_handle = tokio::spawn(progress_reporter(active.clone(), stop_reporter.clone()));

    let mut handles = Vec::new();
    for path in paths {
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        let active = active.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            compute_one(path, active).await
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        if let Ok(result) = handle.await {
            results.push(result);
        }
    }

    stop_reporter.cancel();
    let _ = reporter_handle.await;
    results
}
