use crate::cache::ThumbnailCache;
use crate::config::{ConfigError, EngineConfig};
use crate::core::cluster::{ClusterBuilder, EdgeKind};
use crate::core::fingerprint::{FingerprintError, Fingerprinter, Fingerprints, PerceptualHash};
use crate::core::similarity::{HashKind, SimilarityIndex};
use crate::core::tracker::ScanTracker;
use crate::database::models::{DuplicateGroup, PhotoRecord, RunStatus};
use crate::database::{DatabaseError, Store};
use crate::source::{FetchError, PhotoSource, SourceItem};
use chrono::Utc;
use glob::Pattern;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("listing failed: {0}")]
    Listing(#[from] FetchError),

    #[error("invalid engine configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("worker pool failure: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
pub enum ScanPhase {
    Listing,
    Hashing,
    Grouping,
    Complete,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanProgress {
    pub phase: ScanPhase,
    pub items_done: usize,
    /// Zero while the total is still unknown (listing).
    pub items_total: usize,
    pub current: String,
}

/// One item the run gave up on, with the reason, so the operator can chase
/// individual failures instead of a bare count.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedItem {
    pub id: String,
    pub reason: String,
}

/// Operator-facing outcome of one run. Failure counters let "nothing new"
/// and "N items failed" be told apart.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub listed: usize,
    pub excluded: usize,
    pub unchanged: usize,
    pub pending: usize,
    pub processed: usize,
    pub decode_failures: usize,
    pub transient_failures: usize,
    pub permanent_failures: usize,
    pub groups_total: usize,
    pub groups_exact: usize,
    pub groups_similar: usize,
    pub cancelled: bool,
    pub skipped: Vec<SkippedItem>,
}

/// What the engine hands to the report renderer: the full current partition
/// plus the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub groups: Vec<DuplicateGroup>,
}

enum WorkOutcome {
    Hashed {
        item: SourceItem,
        fingerprints: Fingerprints,
    },
    DecodeFailed {
        item: SourceItem,
    },
    FetchFailed {
        item: SourceItem,
        permanent: bool,
    },
}

/// Orchestrates one incremental scan: drain the source listing, diff against
/// persisted state, fetch and fingerprint pending items on a bounded worker
/// pool, and fold results sequentially into the similarity index and the
/// duplicate-group partition.
pub struct ScanEngine<S: PhotoSource + 'static> {
    store: Store,
    cache: ThumbnailCache,
    source: Arc<S>,
    config: EngineConfig,
    fingerprinter: Arc<Fingerprinter>,
    exclude_patterns: Vec<Pattern>,
    progress_sender: Option<mpsc::UnboundedSender<ScanProgress>>,
    cancellation_token: Arc<AtomicBool>,
}

impl<S: PhotoSource + 'static> ScanEngine<S> {
    pub fn new(
        store: Store,
        cache: ThumbnailCache,
        source: Arc<S>,
        config: EngineConfig,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        let exclude_patterns = config
            .exclude_patterns
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::Invalid(format!("bad exclude pattern: {}", e)))?;

        let fingerprinter = Arc::new(Fingerprinter::new(config.hash_size));
        Ok(Self {
            store,
            cache,
            source,
            config,
            fingerprinter,
            exclude_patterns,
            progress_sender: None,
            cancellation_token: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_progress_sender(mut self, sender: mpsc::UnboundedSender<ScanProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    /// Cooperative stop: dispatching halts, in-flight fetches finish and
    /// their results are still persisted, the partition is materialized from
    /// whatever committed. Never corrupts state.
    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn into_store(self) -> Store {
        self.store
    }

    /// Execute one incremental run. The store is locked for the duration;
    /// a second concurrent run against the same store is refused.
    pub async fn run(&mut self) -> Result<RunReport, ScanError> {
        let run_id = format!("run_{}", Uuid::new_v4().simple());
        self.store.acquire_run_lock(&run_id)?;

        let result = self.run_inner(&run_id).await;

        if result.is_err() {
            // Best effort; the original error is the one worth surfacing.
            let _ = self.store.runs().finish(
                &run_id,
                RunStatus::Failed,
                &Utc::now().to_rfc3339(),
                0,
                0,
                0,
            );
        }
        if let Err(err) = self.store.release_run_lock(&run_id) {
            log::warn!("failed to release run lock: {}", err);
        }
        result
    }

    async fn run_inner(&mut self, run_id: &str) -> Result<RunReport, ScanError> {
        self.store.verify_integrity()?;

        let started_at = Utc::now().to_rfc3339();
        self.store.runs().start(run_id, &started_at)?;

        // Phase 1: drain the listing completely. Diffing against a partial
        // listing would mark absent items as unseen forever.
        let mut listing: Vec<SourceItem> = Vec::new();
        let mut excluded = 0usize;
        let mut page_token: Option<String> = None;
        let mut cancelled = false;

        loop {
            if self.cancellation_token.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }

            let page = self.fetch_listing_page(page_token.clone()).await?;
            for item in page.items {
                if !item.is_image() || self.is_excluded(&item.filename) {
                    excluded += 1;
                    continue;
                }
                self.store.photos().upsert_listing(&item)?;
                listing.push(item);
            }

            self.send_progress(ScanProgress {
                phase: ScanPhase::Listing,
                items_done: listing.len(),
                items_total: 0,
                current: format!("{} items listed", listing.len()),
            });

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        if cancelled {
            // The diff needs a full listing; report the existing partition.
            log::info!("run {} cancelled during listing", run_id);
            let groups = self.store.groups().load_partition()?;
            return self.finish_run(
                run_id,
                &started_at,
                RunStatus::Cancelled,
                listing.len(),
                excluded,
                0,
                0,
                Counters::default(),
                groups,
                true,
            );
        }

        // Phase 2: diff.
        let states = self.store.photos().scan_states()?;
        let plan = ScanTracker::plan(listing, &states);
        let listed = plan.pending.len() + plan.unchanged;
        log::info!(
            "run {}: {} listed, {} pending, {} unchanged",
            run_id,
            listed,
            plan.pending.len(),
            plan.unchanged
        );

        // Phase 3: seed transient structures from persisted state. Pending
        // items are about to be re-fingerprinted, so their stored hashes
        // stay out of the index.
        let pending_ids: HashSet<String> =
            plan.pending.iter().map(|item| item.id.clone()).collect();

        let mut index = SimilarityIndex::new();
        let mut clusters = ClusterBuilder::new();
        // content hash -> representative id, for exact linking of new items
        let mut content_rep: HashMap<String, String> = HashMap::new();
        // id -> content hash, to keep exact pairs off the similar path
        let mut content_of: HashMap<String, String> = HashMap::new();

        for record in self.store.photos().all_fingerprinted()? {
            if pending_ids.contains(&record.id) {
                continue;
            }
            let (phash, dhash) = parse_record_hashes(&record)?;
            let content_hash = record.content_hash.clone().unwrap_or_default();
            content_rep
                .entry(content_hash.clone())
                .or_insert_with(|| record.id.clone());
            content_of.insert(record.id.clone(), content_hash);
            index.insert(&record.id, phash, dhash);
        }

        for group in self.store.groups().load_partition()? {
            clusters.seed_group(&group.members, group.match_kind);
        }

        // Phase 4: bounded fetch+hash pool feeding a single consumer.
        let total_pending = plan.pending.len();
        let (tx, mut rx) = mpsc::channel::<WorkOutcome>(self.config.workers.max(1) * 2);
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));

        let dispatcher = {
            let pending = plan.pending;
            let source = self.source.clone();
            let cache = self.cache.clone();
            let fingerprinter = self.fingerprinter.clone();
            let cancel = self.cancellation_token.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                for item in pending {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    let tx = tx.clone();
                    let source = source.clone();
                    let cache = cache.clone();
                    let fingerprinter = fingerprinter.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        let outcome =
                            process_item(item, source, cache, fingerprinter, &config).await;
                        let _ = tx.send(outcome).await;
                        drop(permit);
                    });
                }
            })
        };

        let mut counters = Counters::default();
        while let Some(outcome) = rx.recv().await {
            match outcome {
                WorkOutcome::Hashed { item, fingerprints } => {
                    self.absorb(
                        &item,
                        &fingerprints,
                        &mut index,
                        &mut clusters,
                        &mut content_rep,
                        &mut content_of,
                    )?;
                    counters.processed += 1;
                }
                WorkOutcome::DecodeFailed { item } => {
                    log::warn!("skipping {}: thumbnail not decodable", item.id);
                    counters.decode_failures += 1;
                    counters.skip(item.id, "undecodable thumbnail");
                }
                WorkOutcome::FetchFailed { item, permanent } => {
                    if permanent {
                        log::warn!("skipping {}: gone at the source", item.id);
                        counters.permanent_failures += 1;
                        counters.skip(item.id, "gone at the source");
                    } else {
                        log::warn!("skipping {}: retries exhausted", item.id);
                        counters.transient_failures += 1;
                        counters.skip(item.id, "fetch retries exhausted");
                    }
                }
            }

            self.send_progress(ScanProgress {
                phase: ScanPhase::Hashing,
                items_done: counters.total(),
                items_total: total_pending,
                current: format!("{}/{} items", counters.total(), total_pending),
            });
        }
        dispatcher.await?;

        let cancelled = self.cancellation_token.load(Ordering::Relaxed);

        // Phase 5: materialize and persist the partition.
        self.send_progress(ScanProgress {
            phase: ScanPhase::Grouping,
            items_done: counters.total(),
            items_total: total_pending,
            current: "materializing groups".to_string(),
        });

        let capture_times = self.store.photos().capture_times()?;
        let groups = clusters.partition(&capture_times);
        self.store.groups().replace_partition(&groups)?;

        let status = if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        self.finish_run(
            run_id,
            &started_at,
            status,
            listed,
            excluded,
            plan.unchanged,
            total_pending,
            counters,
            groups,
            cancelled,
        )
    }

    /// Fold one fingerprinted item into store, index and forest. Runs on the
    /// single consumer; ordering here is what keeps the structures coherent
    /// without locks.
    fn absorb(
        &self,
        item: &SourceItem,
        fingerprints: &Fingerprints,
        index: &mut SimilarityIndex,
        clusters: &mut ClusterBuilder,
        content_rep: &mut HashMap<String, String>,
        content_of: &mut HashMap<String, String>,
    ) -> Result<(), ScanError> {
        self.store.photos().record_fingerprints(
            &item.id,
            &fingerprints.content_hash,
            &fingerprints.phash.to_hex(),
            &fingerprints.dhash.to_hex(),
            &item.modified_at.to_rfc3339(),
            &Utc::now().to_rfc3339(),
        )?;

        match content_rep.get(&fingerprints.content_hash) {
            Some(rep) if rep != &item.id => {
                clusters.union(&item.id, rep, EdgeKind::Exact);
            }
            Some(_) => {}
            None => {
                content_rep.insert(fingerprints.content_hash.clone(), item.id.clone());
            }
        }

        let threshold = self.config.similarity_threshold;
        let hits = index
            .query(&fingerprints.phash, HashKind::Phash, threshold)
            .into_iter()
            .chain(index.query(&fingerprints.dhash, HashKind::Dhash, threshold));
        for (other, _distance) in hits {
            if other == item.id {
                continue;
            }
            // Byte-identical pairs are linked by their exact edge; a
            // distance-0 perceptual hit must not downgrade the group.
            if content_of.get(&other) == Some(&fingerprints.content_hash) {
                continue;
            }
            clusters.union(&item.id, &other, EdgeKind::Similar);
        }

        index.insert(
            &item.id,
            fingerprints.phash.clone(),
            fingerprints.dhash.clone(),
        );
        content_of.insert(item.id.clone(), fingerprints.content_hash.clone());
        Ok(())
    }

    /// Re-derive the entire partition from persisted fingerprints alone.
    /// This is the recovery path when group tables are lost, and the reset
    /// path when the threshold changed: groups are only a cache of a pure
    /// function over fingerprints.
    pub fn rebuild_groups(&mut self) -> Result<Vec<DuplicateGroup>, ScanError> {
        let records = self.store.photos().all_fingerprinted()?;
        let mut index = SimilarityIndex::new();
        let mut clusters = ClusterBuilder::new();
        let mut content_rep: HashMap<String, String> = HashMap::new();
        let mut content_of: HashMap<String, String> = HashMap::new();
        let threshold = self.config.similarity_threshold;

        for record in &records {
            let (phash, dhash) = parse_record_hashes(record)?;
            let content_hash = record.content_hash.clone().unwrap_or_default();

            match content_rep.get(&content_hash) {
                Some(rep) => clusters.union(&record.id, rep, EdgeKind::Exact),
                None => {
                    content_rep.insert(content_hash.clone(), record.id.clone());
                }
            }

            let hits = index
                .query(&phash, HashKind::Phash, threshold)
                .into_iter()
                .chain(index.query(&dhash, HashKind::Dhash, threshold));
            for (other, _distance) in hits {
                if content_of.get(&other) == Some(&content_hash) {
                    continue;
                }
                clusters.union(&record.id, &other, EdgeKind::Similar);
            }

            index.insert(&record.id, phash, dhash);
            content_of.insert(record.id.clone(), content_hash);
        }

        let capture_times = self.store.photos().capture_times()?;
        let groups = clusters.partition(&capture_times);
        self.store.groups().replace_partition(&groups)?;
        Ok(groups)
    }

    async fn fetch_listing_page(
        &self,
        page_token: Option<String>,
    ) -> Result<crate::source::SourcePage, ScanError> {
        let mut attempt = 0;
        loop {
            match self
                .source
                .list_page(self.config.page_size, page_token.clone())
                .await
            {
                Ok(page) => return Ok(page),
                Err(err @ FetchError::Permanent(_)) => return Err(err.into()),
                Err(FetchError::Transient(reason)) => {
                    attempt += 1;
                    if attempt > self.config.fetch_retries {
                        return Err(FetchError::Transient(reason).into());
                    }
                    let delay = self.config.retry_backoff_ms << (attempt - 1);
                    log::warn!(
                        "listing page failed ({}), retry {} in {}ms",
                        reason,
                        attempt,
                        delay
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    fn is_excluded(&self, filename: &str) -> bool {
        self.exclude_patterns.iter().any(|p| p.matches(filename))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_run(
        &self,
        run_id: &str,
        started_at: &str,
        status: RunStatus,
        listed: usize,
        excluded: usize,
        unchanged: usize,
        pending: usize,
        counters: Counters,
        groups: Vec<DuplicateGroup>,
        cancelled: bool,
    ) -> Result<RunReport, ScanError> {
        let finished_at = Utc::now().to_rfc3339();
        self.store.runs().finish(
            run_id,
            status,
            &finished_at,
            listed as i64,
            counters.processed as i64,
            counters.failed() as i64,
        )?;

        self.send_progress(ScanProgress {
            phase: ScanPhase::Complete,
            items_done: counters.total(),
            items_total: pending,
            current: "run complete".to_string(),
        });

        let groups_exact = groups
            .iter()
            .filter(|g| g.match_kind == crate::database::models::MatchKind::Exact)
            .count();
        let failed = counters.failed();
        let summary = RunSummary {
            run_id: run_id.to_string(),
            started_at: started_at.to_string(),
            finished_at,
            listed,
            excluded,
            unchanged,
            pending,
            processed: counters.processed,
            decode_failures: counters.decode_failures,
            transient_failures: counters.transient_failures,
            permanent_failures: counters.permanent_failures,
            groups_total: groups.len(),
            groups_exact,
            groups_similar: groups.len() - groups_exact,
            cancelled,
            skipped: counters.skipped,
        };
        log::info!(
            "run {} {}: {} processed, {} failed, {} groups",
            summary.run_id,
            status.as_str(),
            summary.processed,
            failed,
            summary.groups_total
        );
        Ok(RunReport { summary, groups })
    }

    fn send_progress(&self, progress: ScanProgress) {
        if let Some(sender) = &self.progress_sender {
            let _ = sender.send(progress);
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Counters {
    processed: usize,
    decode_failures: usize,
    transient_failures: usize,
    permanent_failures: usize,
    skipped: Vec<SkippedItem>,
}

impl Counters {
    fn failed(&self) -> usize {
        self.decode_failures + self.transient_failures + self.permanent_failures
    }

    fn total(&self) -> usize {
        self.processed + self.failed()
    }

    fn skip(&mut self, id: String, reason: &str) {
        self.skipped.push(SkippedItem {
            id,
            reason: reason.to_string(),
        });
    }
}

fn parse_record_hashes(
    record: &PhotoRecord,
) -> Result<(PerceptualHash, PerceptualHash), DatabaseError> {
    let phash = record
        .phash
        .as_deref()
        .and_then(PerceptualHash::from_hex)
        .ok_or_else(|| {
            DatabaseError::Consistency(format!("photo {} has a malformed phash", record.id))
        })?;
    let dhash = record
        .dhash
        .as_deref()
        .and_then(PerceptualHash::from_hex)
        .ok_or_else(|| {
            DatabaseError::Consistency(format!("photo {} has a malformed dhash", record.id))
        })?;
    Ok((phash, dhash))
}

/// One worker's share: cache lookup, fetch with timeout and bounded retries,
/// fingerprint on a blocking thread. Pure per-item work; nothing here touches
/// shared mutable state.
async fn process_item<S: PhotoSource + 'static>(
    item: SourceItem,
    source: Arc<S>,
    cache: ThumbnailCache,
    fingerprinter: Arc<Fingerprinter>,
    config: &EngineConfig,
) -> WorkOutcome {
    let marker = item.modified_at.to_rfc3339();

    let cached = match cache.get(&item.id, &marker) {
        Ok(hit) => hit,
        Err(err) => {
            log::warn!("thumbnail cache read failed for {}: {}", item.id, err);
            None
        }
    };

    let bytes = match cached {
        Some(bytes) => bytes,
        None => {
            let fetched = fetch_with_retries(&item, source, config).await;
            match fetched {
                Ok(bytes) => {
                    if let Err(err) = cache.put(&item.id, &marker, &bytes) {
                        log::warn!("thumbnail cache write failed for {}: {}", item.id, err);
                    }
                    bytes
                }
                Err(permanent) => return WorkOutcome::FetchFailed { item, permanent },
            }
        }
    };

    let worker_fingerprinter = fingerprinter.clone();
    let computed =
        tokio::task::spawn_blocking(move || worker_fingerprinter.compute(&bytes)).await;

    match computed {
        Ok(Ok(fingerprints)) => WorkOutcome::Hashed { item, fingerprints },
        Ok(Err(FingerprintError::Decode(err))) => {
            log::warn!("decode failed for {}: {}", item.id, err);
            WorkOutcome::DecodeFailed { item }
        }
        Err(join_err) => {
            log::error!("fingerprint task for {} failed: {}", item.id, join_err);
            WorkOutcome::DecodeFailed { item }
        }
    }
}

/// Ok(bytes) on success; Err(permanent?) once the retry budget is spent or
/// the failure is permanent.
async fn fetch_with_retries<S: PhotoSource + 'static>(
    item: &SourceItem,
    source: Arc<S>,
    config: &EngineConfig,
) -> Result<Vec<u8>, bool> {
    let timeout = Duration::from_secs(config.fetch_timeout_secs);
    let mut attempt = 0;
    loop {
        let result = tokio::time::timeout(timeout, source.fetch_thumbnail(&item.thumbnail_ref)).await;
        let reason = match result {
            Ok(Ok(bytes)) => return Ok(bytes),
            Ok(Err(FetchError::Permanent(reason))) => {
                log::debug!("permanent fetch failure for {}: {}", item.id, reason);
                return Err(true);
            }
            Ok(Err(FetchError::Transient(reason))) => reason,
            Err(_) => format!("timed out after {}s", config.fetch_timeout_secs),
        };

        attempt += 1;
        if attempt > config.fetch_retries {
            log::debug!("giving up on {} after {} attempts: {}", item.id, attempt, reason);
            return Err(false);
        }
        let delay = config.retry_backoff_ms << (attempt - 1);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourcePage;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use image::{ImageBuffer, Rgb};
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeSource {
        items: Mutex<Vec<SourceItem>>,
        thumbs: Mutex<HashMap<String, Vec<u8>>>,
        permanent_failures: Mutex<HashSet<String>>,
        transient_failures: Mutex<HashSet<String>>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                items: Mutex::new(Vec::new()),
                thumbs: Mutex::new(HashMap::new()),
                permanent_failures: Mutex::new(HashSet::new()),
                transient_failures: Mutex::new(HashSet::new()),
            }
        }

        fn push(&self, item: SourceItem, bytes: Vec<u8>) {
            self.thumbs
                .lock()
                .unwrap()
                .insert(item.thumbnail_ref.clone(), bytes);
            self.items.lock().unwrap().push(item);
        }

        fn fail_permanently(&self, thumbnail_ref: &str) {
            self.permanent_failures
                .lock()
                .unwrap()
                .insert(thumbnail_ref.to_string());
        }

        fn fail_transiently(&self, thumbnail_ref: &str) {
            self.transient_failures
                .lock()
                .unwrap()
                .insert(thumbnail_ref.to_string());
        }
    }

    #[async_trait]
    impl PhotoSource for FakeSource {
        async fn list_page(
            &self,
            page_size: usize,
            page_token: Option<String>,
        ) -> Result<SourcePage, FetchError> {
            let items = self.items.lock().unwrap();
            let start: usize = page_token
                .map(|t| t.parse().expect("fake page token"))
                .unwrap_or(0);
            let end = (start + page_size).min(items.len());
            let next_page_token = if end < items.len() {
                Some(end.to_string())
            } else {
                None
            };
            Ok(SourcePage {
                items: items[start..end].to_vec(),
                next_page_token,
            })
        }

        async fn fetch_thumbnail(&self, thumbnail_ref: &str) -> Result<Vec<u8>, FetchError> {
            if self
                .permanent_failures
                .lock()
                .unwrap()
                .contains(thumbnail_ref)
            {
                return Err(FetchError::Permanent("item gone".to_string()));
            }
            if self
                .transient_failures
                .lock()
                .unwrap()
                .contains(thumbnail_ref)
            {
                return Err(FetchError::Transient("flaky network".to_string()));
            }
            self.thumbs
                .lock()
                .unwrap()
                .get(thumbnail_ref)
                .cloned()
                .ok_or_else(|| FetchError::Permanent("unknown thumbnail".to_string()))
        }
    }

    fn gradient_png() -> Vec<u8> {
        encode_png(&ImageBuffer::from_fn(100, 100, |x, y| {
            let intensity = ((x + y) % 256) as u8;
            Rgb([intensity, intensity, intensity])
        }))
    }

    fn tweaked_gradient_png() -> Vec<u8> {
        let mut img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(100, 100, |x, y| {
            let intensity = ((x + y) % 256) as u8;
            Rgb([intensity, intensity, intensity])
        });
        img.put_pixel(50, 50, Rgb([255, 0, 0]));
        encode_png(&img)
    }

    fn checkerboard_png() -> Vec<u8> {
        encode_png(&ImageBuffer::from_fn(100, 100, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        }))
    }

    fn encode_png(img: &ImageBuffer<Rgb<u8>, Vec<u8>>) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn item(id: &str, capture_year: i32) -> SourceItem {
        SourceItem {
            id: id.to_string(),
            filename: format!("{}.jpg", id),
            mime_type: "image/jpeg".to_string(),
            capture_time: Utc.with_ymd_and_hms(capture_year, 1, 1, 0, 0, 0).unwrap(),
            modified_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            thumbnail_ref: format!("t-{}", id),
        }
    }

    fn quick_config() -> EngineConfig {
        EngineConfig {
            workers: 4,
            page_size: 2,
            fetch_retries: 1,
            retry_backoff_ms: 1,
            fetch_timeout_secs: 5,
            ..EngineConfig::default()
        }
    }

    fn new_engine(
        source: Arc<FakeSource>,
        dir: &TempDir,
        config: EngineConfig,
    ) -> ScanEngine<FakeSource> {
        let store = Store::open(dir.path().join("photos.db")).unwrap();
        let cache = ThumbnailCache::open(dir.path().join("cache")).unwrap();
        ScanEngine::new(store, cache, source, config).unwrap()
    }

    fn standard_corpus(source: &FakeSource) {
        // a and b are byte-identical, c is a near-duplicate of them, d is
        // unrelated.
        source.push(item("a", 2019), gradient_png());
        source.push(item("b", 2020), gradient_png());
        source.push(item("c", 2021), tweaked_gradient_png());
        source.push(item("d", 2022), checkerboard_png());
    }

    #[tokio::test]
    async fn test_run_groups_exact_and_similar_members() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new());
        standard_corpus(&source);

        let mut engine = new_engine(source, &dir, quick_config());
        let report = engine.run().await.unwrap();

        assert_eq!(report.summary.listed, 4);
        assert_eq!(report.summary.pending, 4);
        assert_eq!(report.summary.processed, 4);
        assert_eq!(report.summary.groups_total, 1);
        assert_eq!(report.summary.groups_similar, 1);
        assert!(!report.summary.cancelled);

        // The exact pair a/b plus the perceptual neighbor c form one group,
        // downgraded to similar by c's edge; d stays out.
        let group = &report.groups[0];
        assert_eq!(group.match_kind, crate::database::models::MatchKind::Similar);
        assert_eq!(group.members, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new());
        standard_corpus(&source);

        let mut engine = new_engine(source, &dir, quick_config());
        let first = engine.run().await.unwrap();
        let second = engine.run().await.unwrap();

        assert_eq!(second.summary.pending, 0);
        assert_eq!(second.summary.unchanged, 4);
        assert_eq!(first.groups, second.groups);
    }

    #[tokio::test]
    async fn test_incremental_matches_single_batch() {
        // Two-batch run.
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new());
        source.push(item("a", 2019), gradient_png());
        source.push(item("b", 2020), gradient_png());

        let mut engine = new_engine(source.clone(), &dir, quick_config());
        let first = engine.run().await.unwrap();
        assert_eq!(first.groups.len(), 1);
        assert_eq!(
            first.groups[0].match_kind,
            crate::database::models::MatchKind::Exact
        );

        source.push(item("c", 2021), tweaked_gradient_png());
        source.push(item("d", 2022), checkerboard_png());
        let incremental = engine.run().await.unwrap();
        assert_eq!(incremental.summary.pending, 2);

        // Single-batch run over the same corpus on a fresh store.
        let batch_dir = TempDir::new().unwrap();
        let batch_source = Arc::new(FakeSource::new());
        standard_corpus(&batch_source);
        let mut batch_engine = new_engine(batch_source, &batch_dir, quick_config());
        let batch = batch_engine.run().await.unwrap();

        assert_eq!(incremental.groups, batch.groups);
    }

    #[tokio::test]
    async fn test_decode_failure_skipped_and_eligible_next_run() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new());
        source.push(item("a", 2019), gradient_png());
        source.push(item("bad", 2020), b"not an image at all".to_vec());

        let mut engine = new_engine(source, &dir, quick_config());
        let first = engine.run().await.unwrap();
        assert_eq!(first.summary.decode_failures, 1);
        assert_eq!(first.summary.processed, 1);
        assert_eq!(first.summary.skipped.len(), 1);
        assert_eq!(first.summary.skipped[0].id, "bad");
        assert!(first.groups.is_empty());

        let record = engine.store().photos().find_by_id("bad").unwrap().unwrap();
        assert!(!record.is_fingerprinted());

        // Still undecodable, so it is retried (and fails) again.
        let second = engine.run().await.unwrap();
        assert_eq!(second.summary.pending, 1);
        assert_eq!(second.summary.decode_failures, 1);
    }

    #[tokio::test]
    async fn test_permanent_fetch_failure_skips_item() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new());
        source.push(item("a", 2019), gradient_png());
        source.push(item("gone", 2020), gradient_png());
        source.fail_permanently("t-gone");

        let mut engine = new_engine(source, &dir, quick_config());
        let report = engine.run().await.unwrap();

        assert_eq!(report.summary.permanent_failures, 1);
        assert_eq!(report.summary.processed, 1);
        let record = engine.store().photos().find_by_id("gone").unwrap().unwrap();
        assert!(!record.is_fingerprinted());
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retries() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new());
        source.push(item("flaky", 2019), gradient_png());
        source.fail_transiently("t-flaky");

        let mut engine = new_engine(source, &dir, quick_config());
        let report = engine.run().await.unwrap();

        assert_eq!(report.summary.transient_failures, 1);
        assert_eq!(report.summary.processed, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_run_leaves_store_usable() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new());
        standard_corpus(&source);

        let mut engine = new_engine(source, &dir, quick_config());
        engine.cancel();
        let report = engine.run().await.unwrap();

        assert!(report.summary.cancelled);
        assert_eq!(report.summary.processed, 0);
        assert!(report.groups.is_empty());
        engine.store().verify_integrity().unwrap();
    }

    #[tokio::test]
    async fn test_previously_listed_but_unfingerprinted_item_is_processed() {
        // Simulates a crash between listing and fingerprint persistence:
        // metadata exists, fingerprints do not.
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new());
        source.push(item("x", 2019), gradient_png());
        source.push(item("y", 2020), gradient_png());

        let mut engine = new_engine(source, &dir, quick_config());
        engine.store().photos().upsert_listing(&item("x", 2019)).unwrap();
        let record = engine.store().photos().find_by_id("x").unwrap().unwrap();
        assert!(!record.is_fingerprinted());

        let report = engine.run().await.unwrap();
        assert_eq!(report.summary.pending, 2);
        assert_eq!(report.summary.processed, 2);
        let record = engine.store().photos().find_by_id("x").unwrap().unwrap();
        assert!(record.is_fingerprinted());
    }

    #[tokio::test]
    async fn test_rebuild_groups_from_fingerprints_alone() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new());
        standard_corpus(&source);

        let mut engine = new_engine(source, &dir, quick_config());
        let report = engine.run().await.unwrap();
        assert!(!report.groups.is_empty());

        // Lose the group tables entirely, then re-derive.
        engine.store().groups().replace_partition(&[]).unwrap();
        assert!(engine.store().groups().load_partition().unwrap().is_empty());

        let rebuilt = engine.rebuild_groups().unwrap();
        assert_eq!(rebuilt, report.groups);
        assert_eq!(
            engine.store().groups().load_partition().unwrap(),
            report.groups
        );
    }

    #[tokio::test]
    async fn test_exclusions_filter_listing() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new());
        source.push(item("a", 2019), gradient_png());

        let mut screenshot = item("shot", 2020);
        screenshot.filename = "shot.screenshot.png".to_string();
        source.push(screenshot, gradient_png());

        let mut video = item("v", 2021);
        video.mime_type = "video/mp4".to_string();
        source.push(video, gradient_png());

        let config = EngineConfig {
            exclude_patterns: vec!["*.screenshot.png".to_string()],
            ..quick_config()
        };
        let mut engine = new_engine(source, &dir, config);
        let report = engine.run().await.unwrap();

        assert_eq!(report.summary.excluded, 2);
        assert_eq!(report.summary.listed, 1);
        assert!(engine.store().photos().find_by_id("shot").unwrap().is_none());
        assert!(engine.store().photos().find_by_id("v").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_progress_events_cover_all_phases() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new());
        standard_corpus(&source);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut engine =
            new_engine(source, &dir, quick_config()).with_progress_sender(progress_tx);
        engine.run().await.unwrap();

        let mut phases = HashSet::new();
        while let Ok(progress) = progress_rx.try_recv() {
            phases.insert(progress.phase);
        }
        assert!(phases.contains(&ScanPhase::Listing));
        assert!(phases.contains(&ScanPhase::Hashing));
        assert!(phases.contains(&ScanPhase::Grouping));
        assert!(phases.contains(&ScanPhase::Complete));
    }
}
