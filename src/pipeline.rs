//! Bounded producer / worker pool / single writer ingestion.
//!
//! ```text
//! producer --files(Q)--> W parser workers --users(Q)--> storage writer --> Repository
//!                                    \------outcomes(Q)--> aggregator
//! ```
//!
//! Every queue is a bounded `tokio::sync::mpsc` channel. The producer reads a
//! group's payload before pushing it, so at most `queue_capacity` payloads
//! are held in memory at once. The writer is the only owner of the
//! repository for the whole run.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::normalize::Normalizer;
use crate::parser::parse_group;
use crate::repository::Repository;
use crate::source::SourceGroup;
use crate::types::{Summary, UserRecord};

/// What the storage writer does when a batch fails to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageErrorPolicy {
    /// Stop the run on the first failed batch.
    #[default]
    Abort,
    /// Retry the batch, sleeping `backoff * attempt` between tries, then abort.
    Retry { attempts: u32, backoff: Duration },
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub queue_capacity: usize,
    pub workers: usize,
    pub batch_users: usize,
    pub progress_every: u64,
    pub storage_policy: StorageErrorPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 50,
            workers: 10,
            batch_users: 1000,
            progress_every: 1000,
            storage_policy: StorageErrorPolicy::Abort,
        }
    }
}

/// A group that was dropped without being stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedGroup {
    pub user_key: String,
    pub sources: Vec<String>,
    pub reason: String,
}

/// Run-wide totals printed at the end of an ingest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub summary: Summary,
    pub groups_total: usize,
    pub groups_parsed: u64,
    pub skipped: Vec<SkippedGroup>,
    pub users_stored: u64,
    pub batches_flushed: u64,
}

struct Payload {
    group: SourceGroup,
    bytes: Vec<u8>,
}

#[derive(Debug)]
enum GroupOutcome {
    Parsed(Summary),
    Skipped(SkippedGroup),
}

#[derive(Debug, Default)]
struct WriterStats {
    users_stored: u64,
    batches_flushed: u64,
}

#[derive(Debug, Default)]
struct Totals {
    summary: Summary,
    groups_parsed: u64,
    skipped: Vec<SkippedGroup>,
}

pub struct Ingester {
    options: PipelineOptions,
    normalizer: Normalizer,
    progress: Arc<watch::Sender<u64>>,
}

impl Ingester {
    pub fn new(options: PipelineOptions, normalizer: Normalizer) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            options,
            normalizer,
            progress: Arc::new(progress),
        }
    }

    /// Groups finished (parsed or skipped) so far in the current run.
    pub fn progress(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    /// Ingest every group and store the results through `repository`.
    ///
    /// Group-local failures are reported in the returned `IngestReport`. A
    /// source read failure or a storage failure (after the configured policy)
    /// ends the run once every task has wound down.
    pub async fn run<R>(&self, groups: Vec<SourceGroup>, repository: R) -> Result<IngestReport>
    where
        R: Repository + Send + 'static,
    {
        let capacity = self.options.queue_capacity.max(1);
        let worker_count = self.options.workers.max(1);
        let groups_total = groups.len();
        info!(
            "ingesting {groups_total} user groups with {worker_count} workers (queue {capacity}, batch {})",
            self.options.batch_users
        );

        let (file_tx, file_rx) = mpsc::channel::<Payload>(capacity);
        let (user_tx, user_rx) = mpsc::channel::<UserRecord>(capacity);
        let (outcome_tx, outcome_rx) = mpsc::channel::<GroupOutcome>(capacity);

        let writer = {
            let batch_users = self.options.batch_users.max(1);
            let policy = self.options.storage_policy;
            tokio::task::spawn_blocking(move || {
                write_users(repository, user_rx, batch_users, policy)
            })
        };
        self.progress.send_replace(0);
        let aggregator = tokio::spawn(aggregate(
            outcome_rx,
            self.options.progress_every,
            Arc::clone(&self.progress),
        ));

        let producer = {
            let outcome_tx = outcome_tx.clone();
            tokio::task::spawn_blocking(move || produce(groups, file_tx, outcome_tx))
        };

        let file_rx = Arc::new(Mutex::new(file_rx));
        let workers: Vec<_> = (0..worker_count)
            .map(|id| {
                let file_rx = Arc::clone(&file_rx);
                let user_tx = user_tx.clone();
                let outcome_tx = outcome_tx.clone();
                let normalizer = self.normalizer.clone();
                tokio::task::spawn_blocking(move || {
                    parse_worker(id, file_rx, user_tx, outcome_tx, normalizer)
                })
            })
            .collect();
        drop(file_rx);

        let worker_results = join_all(workers).await;
        // Workers are done; closing these lets the writer and aggregator drain and exit.
        drop(user_tx);
        drop(outcome_tx);

        let produced = producer.await;
        let written = writer.await;
        let totals = aggregator.await;

        for result in worker_results {
            result?;
        }
        produced??;
        let stats = written??;
        let totals = totals?;

        let report = IngestReport {
            summary: totals.summary,
            groups_total,
            groups_parsed: totals.groups_parsed,
            skipped: totals.skipped,
            users_stored: stats.users_stored,
            batches_flushed: stats.batches_flushed,
        };
        info!(
            "ingest finished: {} groups parsed, {} skipped, {} users stored in {} batches",
            report.groups_parsed,
            report.skipped.len(),
            report.users_stored,
            report.batches_flushed
        );
        Ok(report)
    }
}

/// Stage A. Stops early when every worker has gone away.
fn produce(
    groups: Vec<SourceGroup>,
    files: Sender<Payload>,
    outcomes: Sender<GroupOutcome>,
) -> Result<()> {
    for group in groups {
        let bytes = group.read_payload().inspect_err(|e| error!("{e}"))?;
        if bytes.is_empty() {
            warn!("skipping user {}: empty payload", group.user_key);
            let skipped = SkippedGroup {
                user_key: group.user_key.clone(),
                sources: group.source_names(),
                reason: "empty payload".to_string(),
            };
            let _ = outcomes.blocking_send(GroupOutcome::Skipped(skipped));
            continue;
        }
        if files.blocking_send(Payload { group, bytes }).is_err() {
            debug!("file queue closed, producer stopping");
            break;
        }
    }
    Ok(())
}

/// Stage B.
fn parse_worker(
    id: usize,
    files: Arc<Mutex<Receiver<Payload>>>,
    users: Sender<UserRecord>,
    outcomes: Sender<GroupOutcome>,
    normalizer: Normalizer,
) {
    loop {
        let next = files.lock().blocking_recv();
        let Some(payload) = next else {
            break;
        };

        match parse_group(&payload.bytes, &normalizer) {
            Ok(parsed) => {
                debug!(
                    "worker {id}: user {} has {} items, {} geotagged, {} profile changes",
                    parsed.user.id,
                    parsed.user.timeline.len(),
                    parsed.user.geotagged.len(),
                    parsed.user.profiles.len()
                );
                if users.blocking_send(parsed.user).is_err() {
                    debug!("worker {id}: storage writer gone, stopping");
                    break;
                }
                let _ = outcomes.blocking_send(GroupOutcome::Parsed(parsed.summary));
            }
            Err(e) => {
                if e.is_group_local() {
                    warn!("skipping user {}: {e}", payload.group.user_key);
                } else {
                    error!("skipping user {}: {e}", payload.group.user_key);
                }
                let skipped = SkippedGroup {
                    user_key: payload.group.user_key.clone(),
                    sources: payload.group.source_names(),
                    reason: e.to_string(),
                };
                let _ = outcomes.blocking_send(GroupOutcome::Skipped(skipped));
            }
        }
    }
    debug!("worker {id} exiting");
}

/// Stage C. Returning early drops the receiver, which stops the workers.
fn write_users<R: Repository>(
    mut repository: R,
    mut users: Receiver<UserRecord>,
    batch_users: usize,
    policy: StorageErrorPolicy,
) -> Result<WriterStats> {
    let mut stats = WriterStats::default();
    let mut buffer = Vec::with_capacity(batch_users);

    while let Some(user) = users.blocking_recv() {
        buffer.push(user);
        if buffer.len() >= batch_users {
            flush(&mut repository, &mut buffer, policy, &mut stats)?;
        }
    }
    if !buffer.is_empty() {
        flush(&mut repository, &mut buffer, policy, &mut stats)?;
    }
    Ok(stats)
}

fn flush<R: Repository>(
    repository: &mut R,
    buffer: &mut Vec<UserRecord>,
    policy: StorageErrorPolicy,
    stats: &mut WriterStats,
) -> Result<()> {
    let users = buffer.len() as u64;
    let mut activities = Vec::new();
    let mut profiles = Vec::new();
    for user in buffer.drain(..) {
        activities.extend(user.geotagged);
        profiles.extend(user.profiles);
    }

    let mut attempt = 0;
    loop {
        match repository.insert_batch(&activities, &profiles) {
            Ok(()) => break,
            Err(e) => match policy {
                StorageErrorPolicy::Retry { attempts, backoff } if attempt < attempts => {
                    attempt += 1;
                    warn!("batch of {users} users failed ({e}), retry {attempt}/{attempts}");
                    std::thread::sleep(backoff * attempt);
                }
                _ => {
                    error!("batch of {users} users failed: {e}");
                    return Err(e);
                }
            },
        }
    }

    stats.users_stored += users;
    stats.batches_flushed += 1;
    info!(
        "stored batch {} ({users} users, {} activities, {} profiles)",
        stats.batches_flushed,
        activities.len(),
        profiles.len()
    );
    Ok(())
}

/// Stage D.
async fn aggregate(
    mut outcomes: Receiver<GroupOutcome>,
    progress_every: u64,
    progress: Arc<watch::Sender<u64>>,
) -> Totals {
    let mut totals = Totals::default();
    let mut processed = 0u64;

    while let Some(outcome) = outcomes.recv().await {
        match outcome {
            GroupOutcome::Parsed(summary) => {
                totals.summary += &summary;
                totals.groups_parsed += 1;
            }
            GroupOutcome::Skipped(skipped) => totals.skipped.push(skipped),
        }
        processed += 1;
        progress.send_replace(processed);
        if progress_every > 0 && processed % progress_every == 0 {
            info!(
                "processed {processed} groups: {} records, {} duplicates, {} geotagged",
                totals.summary.records, totals.summary.duplicates, totals.summary.geotagged
            );
        }
    }
    totals
}
