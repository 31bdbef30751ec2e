//! Fetch Orchestrator
//!
//! Drives a whole run:
//! 1. Resolves identifiers into concrete entries, exhausting pool and artist listings first
//! 2. Dispatches entries in tiered groups through the [`Scheduler`]
//! 3. Classifies and normalizes every response
//! 4. Re-sends transient failures of a group after a backoff, then moves to the next group
//! 5. Yields one [`FetchReport`] per entry, in input order, as a lazy stream

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::danbooru::backoff::{BackoffPolicy, GroupSummary};
use crate::danbooru::classifier::{
    ClassifiedOutcome, ForbiddenReason, ServerFault, classify, classify_transport_error,
};
use crate::danbooru::identifier::Identifier;
use crate::danbooru::listing::{ListingCursor, ListingEntry, ListingError, ListingOptions};
use crate::danbooru::record::{Anomaly, Field, PostRecord, normalize};
use crate::danbooru::scheduler::{Scheduler, TierTable};
use crate::danbooru::sender::{Credential, Transport, TransportError};

/// Terminal result for one entry.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success(PostRecord),
    Degraded(PostRecord, Vec<Anomaly>),
    NotFound,
    Forbidden(ForbiddenReason),
    RateLimited(Option<Duration>),
    ServerError(ServerFault),
    Malformed(String),
}

impl FetchOutcome {
    pub fn record(&self) -> Option<&PostRecord> {
        match self {
            FetchOutcome::Success(record) | FetchOutcome::Degraded(record, _) => Some(record),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchOutcome::Success(_) => "success",
            FetchOutcome::Degraded(_, _) => "degraded",
            FetchOutcome::NotFound => "not_found",
            FetchOutcome::Forbidden(_) => "forbidden",
            FetchOutcome::RateLimited(_) => "rate_limited",
            FetchOutcome::ServerError(_) => "server_error",
            FetchOutcome::Malformed(_) => "malformed",
        }
    }
}

/// One emitted item: where it came from and what happened to it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchReport {
    /// 1-based position in the expanded sequence.
    pub position: usize,
    /// The identifier the caller supplied.
    pub origin: Identifier,
    /// The post this report is about. `Absent` when a listing itself failed.
    pub post_id: Field<u64>,
    /// Pool name, when the origin is a pool that has one.
    pub title: Option<String>,
    /// 1-based page within the pool, for pools selected by order.
    pub page: Option<usize>,
    pub outcome: FetchOutcome,
}

/// Failures that end the whole run rather than one item.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("Authentication failed while fetching {origin}: invalid API key or username")]
    AuthenticationFailure { origin: Identifier },
}

/// Counters across every run of one orchestrator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchStats {
    pub groups_dispatched: usize,
    pub retry_rounds: usize,
    pub success: usize,
    pub degraded: usize,
    pub not_found: usize,
    pub forbidden: usize,
    pub rate_limited: usize,
    pub server_errors: usize,
    pub malformed: usize,
}

impl FetchStats {
    fn record(&mut self, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::Success(_) => self.success += 1,
            FetchOutcome::Degraded(_, _) => self.degraded += 1,
            FetchOutcome::NotFound => self.not_found += 1,
            FetchOutcome::Forbidden(_) => self.forbidden += 1,
            FetchOutcome::RateLimited(_) => self.rate_limited += 1,
            FetchOutcome::ServerError(_) => self.server_errors += 1,
            FetchOutcome::Malformed(_) => self.malformed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.success
            + self.degraded
            + self.not_found
            + self.forbidden
            + self.rate_limited
            + self.server_errors
            + self.malformed
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound for a single request, on top of whatever the transport enforces.
    pub item_timeout: Duration,
    /// How many times transient members of a group are re-sent.
    pub max_group_retries: usize,
    pub listing: ListingOptions,
    pub tiers: TierTable,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            item_timeout: Duration::from_secs(30),
            max_group_retries: 2,
            listing: ListingOptions::default(),
            tiers: TierTable::default(),
        }
    }
}

/// Where an entry's payload comes from.
#[derive(Debug, Clone)]
enum ItemSource {
    Fetch(u64),
    Inline { post_id: Option<u64>, body: serde_json::Value },
    /// Already decided while resolving the listing.
    Settled(ClassifiedOutcome),
}

#[derive(Debug, Clone)]
struct WorkItem {
    origin: Identifier,
    title: Option<String>,
    page: Option<usize>,
    source: ItemSource,
}

/// What every concurrent request needs, shared by reference into the group.
#[derive(Clone)]
struct Executor {
    transport: Arc<dyn Transport>,
    credential: Credential,
    item_timeout: Duration,
}

impl Executor {
    async fn execute(&self, item: &WorkItem) -> ClassifiedOutcome {
        match &item.source {
            ItemSource::Fetch(post_id) => {
                let path = format!("posts/{}.json", post_id);
                let response =
                    tokio::time::timeout(self.item_timeout, self.transport.get(&path, &self.credential)).await;
                match response {
                    Ok(Ok(response)) => classify(&response),
                    Ok(Err(error)) => classify_transport_error(&error),
                    Err(_) => classify_transport_error(&TransportError::Timeout),
                }
            }
            ItemSource::Inline { body, .. } => ClassifiedOutcome::Success(body.clone()),
            ItemSource::Settled(outcome) => outcome.clone(),
        }
    }
}

/// Entry point of the fetch engine.
pub struct Orchestrator {
    executor: Executor,
    backoff: Arc<dyn BackoffPolicy>,
    config: OrchestratorConfig,
    stats: Arc<Mutex<FetchStats>>,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        credential: Credential,
        backoff: Arc<dyn BackoffPolicy>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            executor: Executor {
                transport,
                credential,
                item_timeout: config.item_timeout,
            },
            backoff,
            config,
            stats: Arc::new(Mutex::new(FetchStats::default())),
        }
    }

    pub fn stats(&self) -> FetchStats {
        self.stats.lock().clone()
    }

    /// Fetches `identifiers` and yields one report per resolved entry, in input order.
    ///
    /// Nothing is requested until the stream is polled. The stream ends early after yielding
    /// [`RunError`], or at the next group boundary once `cancel` fires. `run_id` tags the run's span.
    pub fn fetch(
        &self,
        run_id: Uuid,
        identifiers: impl IntoIterator<Item = Identifier>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<FetchReport, RunError>> {
        let run = FetchRun {
            executor: self.executor.clone(),
            backoff: self.backoff.clone(),
            listing: self.config.listing.clone(),
            max_group_retries: self.config.max_group_retries,
            stats: self.stats.clone(),
            cancel,
            identifiers: identifiers.into_iter().collect(),
            queue: VecDeque::new(),
            ready: VecDeque::new(),
            scheduler: Scheduler::new(self.config.tiers.clone()),
            pending_delay: None,
            finished: false,
        };
        info!(run_id = %run_id, identifiers = run.identifiers.len(), "Starting fetch run");

        let span = info_span!("fetch_run", run_id = %run_id);
        stream::unfold(run, move |mut run| {
            let span = span.clone();
            async move {
                let item = run.next_item().await?;
                Some((item, run))
            }
            .instrument(span)
        })
        .boxed()
    }
}

struct FetchRun {
    executor: Executor,
    backoff: Arc<dyn BackoffPolicy>,
    listing: ListingOptions,
    max_group_retries: usize,
    stats: Arc<Mutex<FetchStats>>,
    cancel: CancellationToken,
    identifiers: VecDeque<Identifier>,
    /// Resolved entries not yet dispatched.
    queue: VecDeque<WorkItem>,
    /// Finished items not yet handed to the caller.
    ready: VecDeque<Result<FetchReport, RunError>>,
    scheduler: Scheduler,
    /// Backoff owed before the next group.
    pending_delay: Option<Duration>,
    finished: bool,
}

impl FetchRun {
    async fn next_item(&mut self) -> Option<Result<FetchReport, RunError>> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some(item);
            }
            if self.finished {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.finish_cancelled();
                continue;
            }

            self.fill_queue().await;
            if self.cancel.is_cancelled() {
                self.finish_cancelled();
                continue;
            }
            if self.queue.is_empty() {
                debug!("Nothing left to dispatch");
                self.finished = true;
                continue;
            }

            self.settle_backoff().await;
            // Cancellation is only honoured between groups.
            if self.cancel.is_cancelled() {
                self.finish_cancelled();
                continue;
            }

            self.run_group().await;
        }
    }

    fn finish_cancelled(&mut self) {
        info!(
            next_position = self.scheduler.next_position(),
            undispatched = self.queue.len() + self.identifiers.len(),
            "Fetch run cancelled"
        );
        self.finished = true;
    }

    async fn pause(&self, delay: Duration) {
        debug!("Backing off for {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Sleeps off the backoff owed by the last troubled request, before any further traffic.
    async fn settle_backoff(&mut self) {
        if let Some(delay) = self.pending_delay.take() {
            self.pause(delay).await;
        }
    }

    /// Resolves identifiers until the next group can be filled or the input runs out.
    async fn fill_queue(&mut self) {
        while self.queue.len() < self.scheduler.wanted() {
            if self.cancel.is_cancelled() {
                return;
            }
            let Some(identifier) = self.identifiers.pop_front() else {
                return;
            };
            if let Identifier::Post(post_id) = identifier {
                self.queue.push_back(WorkItem {
                    origin: identifier,
                    title: None,
                    page: None,
                    source: ItemSource::Fetch(post_id),
                });
                continue;
            }

            let resolved = self.resolve_listing(&identifier).await;
            if resolved.entries.is_empty() && resolved.failure.is_none() {
                warn!(origin = %identifier, "Listing resolved to no posts");
            }
            self.queue.extend(resolved.entries.into_iter().map(|entry| {
                let (page, source) = match entry {
                    ListingEntry::Post(post_id) => (None, ItemSource::Fetch(post_id)),
                    ListingEntry::Page { post_id, page } => (Some(page), ItemSource::Fetch(post_id)),
                    ListingEntry::Inline { post_id, body } => (None, ItemSource::Inline { post_id, body }),
                };
                WorkItem {
                    origin: identifier.clone(),
                    title: resolved.title.clone(),
                    page,
                    source,
                }
            }));

            if let Some(outcome) = resolved.failure {
                warn!(origin = %identifier, kind = outcome.kind(), "Listing could not be resolved");
                if outcome == ClassifiedOutcome::AuthenticationFailure {
                    // Every later request would fail the same way.
                    self.identifiers.clear();
                }
                self.queue.push_back(WorkItem {
                    origin: identifier,
                    title: resolved.title,
                    page: None,
                    source: ItemSource::Settled(outcome),
                });
            }
        }
    }

    /// Walks a listing page by page. Transient page failures are retried under the backoff policy.
    ///
    /// Entries from pages that arrived are kept even when a later page fails for good.
    async fn resolve_listing(&mut self, identifier: &Identifier) -> ResolvedListing {
        let mut cursor = ListingCursor::new(identifier.clone(), self.listing.clone())
            .with_timeout(self.executor.item_timeout);
        let mut entries = Vec::new();
        let mut attempt = 0;

        self.settle_backoff().await;
        let failure = loop {
            if self.cancel.is_cancelled() {
                break None;
            }
            let page = cursor
                .next_page(self.executor.transport.as_ref(), &self.executor.credential)
                .await;
            let outcome = match page {
                Ok(Some(page)) => {
                    entries.extend(page);
                    attempt = 0;
                    continue;
                }
                Ok(None) => break None,
                Err(ListingError::Request(outcome)) => outcome,
                Err(ListingError::Shape(detail)) => break Some(ClassifiedOutcome::Malformed(detail)),
            };
            if !outcome.is_transient() {
                break Some(outcome);
            }

            let delay = self
                .backoff
                .after_group(&summarize(self.scheduler.next_position(), std::slice::from_ref(&outcome)));
            if attempt >= self.max_group_retries {
                self.pending_delay = delay;
                break Some(outcome);
            }

            attempt += 1;
            self.stats.lock().retry_rounds += 1;
            warn!(origin = %identifier, kind = outcome.kind(), attempt, "Listing request failed, retrying after backoff");
            if let Some(delay) = delay {
                self.pause(delay).await;
            }
        };

        ResolvedListing {
            entries,
            title: cursor.title().map(str::to_string),
            failure,
        }
    }

    async fn run_group(&mut self) {
        let Some(plan) = self.scheduler.next_group(self.queue.len()) else {
            return;
        };
        let items: Vec<WorkItem> = self.queue.drain(..plan.len).collect();
        self.stats.lock().groups_dispatched += 1;
        info!(start = plan.start, len = plan.len, limit = plan.limit, "Dispatching group");

        let executor = self.executor.clone();
        let mut results = self
            .scheduler
            .dispatch(plan.limit, items.iter().collect::<Vec<&WorkItem>>(), |item| executor.execute(item))
            .await;

        let mut attempt = 0;
        loop {
            let summary = summarize(plan.start, &results);
            let delay = self.backoff.after_group(&summary);

            let auth_failed = results
                .iter()
                .any(|outcome| *outcome == ClassifiedOutcome::AuthenticationFailure);
            let retryable: Vec<usize> = results
                .iter()
                .enumerate()
                .filter(|(index, outcome)| {
                    outcome.is_transient() && matches!(items[*index].source, ItemSource::Fetch(_))
                })
                .map(|(index, _)| index)
                .collect();

            if auth_failed || retryable.is_empty() || attempt >= self.max_group_retries {
                self.pending_delay = delay;
                break;
            }

            attempt += 1;
            self.stats.lock().retry_rounds += 1;
            warn!(
                start = plan.start,
                retrying = retryable.len(),
                attempt,
                "Transient failures in group, retrying after backoff"
            );
            if let Some(delay) = delay {
                self.pause(delay).await;
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let retry_items: Vec<&WorkItem> = retryable.iter().map(|index| &items[*index]).collect();
            let retried = self
                .scheduler
                .dispatch(plan.limit, retry_items, |item| executor.execute(item))
                .await;
            for (index, outcome) in retryable.into_iter().zip(retried) {
                results[index] = outcome;
            }
        }

        self.emit(plan.start, items, results);
    }

    /// Turns a resolved group into reports, stopping at the first authentication failure.
    fn emit(&mut self, start: usize, items: Vec<WorkItem>, results: Vec<ClassifiedOutcome>) {
        for (offset, (item, classified)) in items.into_iter().zip(results).enumerate() {
            let position = start + offset;
            match into_report(position, item, classified) {
                Ok(report) => {
                    self.stats.lock().record(&report.outcome);
                    log_report(&report);
                    self.ready.push_back(Ok(report));
                }
                Err(run_error) => {
                    error!(position, "{}", run_error);
                    self.ready.push_back(Err(run_error));
                    self.finished = true;
                    self.queue.clear();
                    self.identifiers.clear();
                    return;
                }
            }
        }
    }
}

/// What one listing walk produced.
struct ResolvedListing {
    entries: Vec<ListingEntry>,
    title: Option<String>,
    /// Why the walk stopped early, if it did.
    failure: Option<ClassifiedOutcome>,
}

fn summarize(start: usize, results: &[ClassifiedOutcome]) -> GroupSummary {
    let mut summary = GroupSummary {
        start,
        len: results.len(),
        ..GroupSummary::default()
    };
    for outcome in results {
        match outcome {
            ClassifiedOutcome::RateLimited(hint) => {
                summary.rate_limited += 1;
                summary.retry_after = summary.retry_after.max(*hint);
            }
            ClassifiedOutcome::ServerError(_) => summary.server_errors += 1,
            _ => {}
        }
    }
    summary
}

fn into_report(position: usize, item: WorkItem, classified: ClassifiedOutcome) -> Result<FetchReport, RunError> {
    let WorkItem {
        origin,
        title,
        page,
        source,
    } = item;
    let requested = match &source {
        ItemSource::Fetch(post_id) => Some(*post_id),
        ItemSource::Inline { post_id, .. } => *post_id,
        ItemSource::Settled(_) => None,
    };

    let outcome = match classified {
        ClassifiedOutcome::Success(body) => match normalize(&body) {
            Ok(record) => match (&source, &record.id) {
                // Never hand out another post's file under this id.
                (ItemSource::Fetch(expected), Field::Present(actual)) if expected != actual => {
                    FetchOutcome::Malformed(format!(
                        "requested post {} but received post {}",
                        expected, actual
                    ))
                }
                _ => {
                    let degrading = record.degrading_anomalies();
                    if degrading.is_empty() {
                        FetchOutcome::Success(record)
                    } else {
                        FetchOutcome::Degraded(record, degrading)
                    }
                }
            },
            Err(e) => FetchOutcome::Malformed(e.to_string()),
        },
        ClassifiedOutcome::NotFound => FetchOutcome::NotFound,
        ClassifiedOutcome::Forbidden(reason) => FetchOutcome::Forbidden(reason),
        ClassifiedOutcome::RateLimited(hint) => FetchOutcome::RateLimited(hint),
        ClassifiedOutcome::ServerError(fault) => FetchOutcome::ServerError(fault),
        ClassifiedOutcome::Malformed(detail) => FetchOutcome::Malformed(detail),
        ClassifiedOutcome::AuthenticationFailure => {
            return Err(RunError::AuthenticationFailure { origin });
        }
    };

    let post_id = match (&source, outcome.record()) {
        (ItemSource::Fetch(post_id), _) => Field::Present(*post_id),
        (ItemSource::Inline { .. }, Some(record)) => record.id.clone(),
        _ => Field::from_option(requested),
    };

    Ok(FetchReport {
        position,
        origin,
        post_id,
        title,
        page,
        outcome,
    })
}

fn log_report(report: &FetchReport) {
    match &report.outcome {
        FetchOutcome::Forbidden(ForbiddenReason::InvalidParameters(detail)) => {
            // Rejected parameters mean the request was built wrong, not that the post is off limits.
            error!(
                position = report.position,
                origin = %report.origin,
                detail = %detail,
                "Request rejected for invalid parameters"
            );
        }
        FetchOutcome::Forbidden(reason) => {
            debug!(position = report.position, origin = %report.origin, detail = reason.detail(), "Forbidden");
        }
        FetchOutcome::Malformed(detail) => {
            warn!(position = report.position, origin = %report.origin, detail = %detail, "Malformed response");
        }
        FetchOutcome::Degraded(record, anomalies) => {
            let anomalies: Vec<&str> = anomalies.iter().map(Anomaly::as_str).collect();
            debug!(
                position = report.position,
                origin = %report.origin,
                anomalies = ?anomalies,
                manual_source = ?record.manual_download_url(),
                "Degraded post"
            );
        }
        outcome => {
            debug!(position = report.position, origin = %report.origin, kind = outcome.kind(), "Post resolved");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::danbooru::backoff::{FixedBackoff, NoBackoff};
    use crate::danbooru::classifier::ServerErrorCause;
    use crate::danbooru::sender::RawResponse;
    use crate::danbooru::test_support::{ScriptedTransport, post_body};
    use futures::StreamExt;
    use serde_json::json;

    fn orchestrator(transport: Arc<ScriptedTransport>, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(transport, Credential::Anonymous, Arc::new(NoBackoff), config)
    }

    fn with_fixed_backoff(transport: Arc<ScriptedTransport>, delay: Duration, max_group_retries: usize) -> Orchestrator {
        let config = OrchestratorConfig {
            max_group_retries,
            ..OrchestratorConfig::default()
        };
        Orchestrator::new(transport, Credential::Anonymous, Arc::new(FixedBackoff { delay }), config)
    }

    fn kinds(reports: &[Result<FetchReport, RunError>]) -> Vec<&'static str> {
        reports.iter().map(|r| r.as_ref().expect("report").outcome.kind()).collect()
    }

    fn with_posts(ids: impl IntoIterator<Item = u64>) -> ScriptedTransport {
        ids.into_iter().fold(ScriptedTransport::new(), |transport, id| {
            transport.respond(&format!("posts/{}.json", id), RawResponse::new(200, post_body(id)))
        })
    }

    async fn collect(stream: BoxStream<'static, Result<FetchReport, RunError>>) -> Vec<Result<FetchReport, RunError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_reports_follow_input_order() {
        let transport = Arc::new(
            with_posts([1, 2, 3])
                .delay("posts/1.json", Duration::from_millis(60))
                .delay("posts/2.json", Duration::from_millis(30)),
        );
        let engine = orchestrator(transport.clone(), OrchestratorConfig::default());

        let ids = [1, 2, 3].map(Identifier::Post);
        let reports = collect(engine.fetch(Uuid::new_v4(), ids, CancellationToken::new())).await;

        let post_ids: Vec<Field<u64>> = reports
            .into_iter()
            .map(|report| report.expect("report").post_id)
            .collect();
        assert_eq!(post_ids, vec![Field::Present(1), Field::Present(2), Field::Present(3)]);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_first_tier() {
        let ids: Vec<u64> = (1..=60).collect();
        let transport = ids.iter().fold(with_posts(ids.clone()), |transport, id| {
            transport.delay(&format!("posts/{}.json", id), Duration::from_millis(5))
        });
        let transport = Arc::new(transport);
        let engine = orchestrator(transport.clone(), OrchestratorConfig::default());

        let reports = collect(engine.fetch(Uuid::new_v4(), ids.into_iter().map(Identifier::Post), CancellationToken::new())).await;

        assert_eq!(reports.len(), 60);
        assert!(transport.peak_in_flight() <= 10);
        // Five groups of ten, then two groups of five.
        assert_eq!(engine.stats().groups_dispatched, 7);
        assert_eq!(engine.stats().success, 60);
    }

    #[tokio::test]
    async fn test_banned_post_without_permission_is_degraded() {
        let body = json!({
            "source": "https://www.pixiv.net/en/artworks/555",
            "pixiv_id": 555,
            "tag_string": "1girl",
            "tag_string_general": "1girl",
            "tag_string_meta": "",
            "is_banned": true
        });
        let transport = Arc::new(ScriptedTransport::new().respond("posts/77.json", RawResponse::new(200, body.to_string())));
        let engine = orchestrator(transport, OrchestratorConfig::default());

        let reports = collect(engine.fetch(Uuid::new_v4(), [Identifier::Post(77)], CancellationToken::new())).await;
        let report = reports.into_iter().next().expect("one report").expect("report");

        assert_eq!(report.post_id, Field::Present(77));
        match report.outcome {
            FetchOutcome::Degraded(record, anomalies) => {
                assert_eq!(anomalies, vec![Anomaly::Banned]);
                assert_eq!(record.id, Field::Withheld);
                assert_eq!(record.md5, Field::Withheld);
                assert_eq!(record.file_url, Field::Withheld);
                assert_eq!(record.large_file_url, Field::Withheld);
                assert_eq!(record.pixiv_id, Some(555));
                assert!(record.source.is_some());
            }
            other => panic!("expected degraded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pool_listing_order_is_kept() {
        let transport = with_posts([900, 12, 450]).respond(
            "pools/3.json",
            RawResponse::new(200, r#"{"id": 3, "name": "pool", "post_ids": [900, 12, 450]}"#),
        );
        let engine = orchestrator(Arc::new(transport), OrchestratorConfig::default());

        let reports = collect(engine.fetch(Uuid::new_v4(), [Identifier::Pool(3)], CancellationToken::new())).await;
        let reports: Vec<FetchReport> = reports.into_iter().map(|r| r.expect("report")).collect();
        let ids: Vec<Field<u64>> = reports.iter().map(|r| r.post_id.clone()).collect();
        assert_eq!(ids, vec![Field::Present(900), Field::Present(12), Field::Present(450)]);

        let pages: Vec<Option<usize>> = reports.iter().map(|r| r.page).collect();
        assert_eq!(pages, vec![Some(1), Some(2), Some(3)]);
        assert!(reports.iter().all(|r| r.title.as_deref() == Some("pool")));
    }

    #[tokio::test]
    async fn test_not_found_is_isolated() {
        let transport = Arc::new(with_posts([1, 3]));
        let engine = orchestrator(transport, OrchestratorConfig::default());

        let reports = collect(engine.fetch(Uuid::new_v4(), [1, 2, 3].map(Identifier::Post), CancellationToken::new())).await;
        let kinds: Vec<&str> = reports.iter().map(|r| r.as_ref().expect("report").outcome.kind()).collect();
        assert_eq!(kinds, vec!["success", "not_found", "success"]);
    }

    #[tokio::test]
    async fn test_authentication_failure_aborts_run() {
        let transport = with_posts([1, 3, 11]).respond("posts/2.json", RawResponse::new(401, "{}"));
        let transport = Arc::new(transport);
        let engine = orchestrator(transport.clone(), OrchestratorConfig::default());

        let ids: Vec<Identifier> = (1..=11).map(Identifier::Post).collect();
        let reports = collect(engine.fetch(Uuid::new_v4(), ids, CancellationToken::new())).await;

        assert_eq!(reports.len(), 2);
        assert!(reports[0].is_ok());
        assert_eq!(
            reports[1],
            Err(RunError::AuthenticationFailure { origin: Identifier::Post(2) })
        );
        // The eleventh post belonged to a second group and was never requested.
        assert!(!transport.requests().contains(&"posts/11.json".to_string()));
    }

    #[tokio::test]
    async fn test_cancellation_drains_current_group_only() {
        let ids: Vec<u64> = (1..=15).collect();
        let transport = Arc::new(with_posts(ids.clone()));
        let engine = orchestrator(transport.clone(), OrchestratorConfig::default());
        let cancel = CancellationToken::new();

        let mut stream = engine.fetch(Uuid::new_v4(), ids.into_iter().map(Identifier::Post), cancel.clone());
        let first = stream.next().await.expect("first").expect("report");
        assert_eq!(first.position, 1);
        cancel.cancel();

        let rest: Vec<_> = stream.collect().await;
        assert_eq!(rest.len(), 9);
        assert_eq!(transport.requests().len(), 10);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_at_group_level() {
        let transport = with_posts([1])
            .respond("posts/2.json", RawResponse::new(503, "busy"))
            .respond("posts/2.json", RawResponse::new(200, post_body(2)))
            .respond("posts/3.json", RawResponse::new(500, "down"));
        let transport = Arc::new(transport);
        let config = OrchestratorConfig {
            max_group_retries: 1,
            ..OrchestratorConfig::default()
        };
        let engine = Orchestrator::new(
            transport.clone(),
            Credential::Anonymous,
            Arc::new(FixedBackoff { delay: Duration::from_millis(10) }),
            config,
        );

        let reports = collect(engine.fetch(Uuid::new_v4(), [1, 2, 3].map(Identifier::Post), CancellationToken::new())).await;
        let kinds: Vec<&str> = reports.iter().map(|r| r.as_ref().expect("report").outcome.kind()).collect();

        assert_eq!(kinds, vec!["success", "success", "server_error"]);
        assert_eq!(engine.stats().retry_rounds, 1);
        let requests = transport.requests();
        assert_eq!(requests.iter().filter(|path| *path == "posts/1.json").count(), 1);
        assert_eq!(requests.iter().filter(|path| *path == "posts/3.json").count(), 2);
    }

    #[tokio::test]
    async fn test_hanging_request_times_out_as_server_error() {
        let transport = Arc::new(ScriptedTransport::new().hang("posts/5.json"));
        let config = OrchestratorConfig {
            item_timeout: Duration::from_millis(50),
            max_group_retries: 0,
            ..OrchestratorConfig::default()
        };
        let engine = orchestrator(transport, config);

        let reports = collect(engine.fetch(Uuid::new_v4(), [Identifier::Post(5)], CancellationToken::new())).await;
        let report = reports.into_iter().next().expect("report").expect("report");
        assert_eq!(
            report.outcome,
            FetchOutcome::ServerError(ServerFault { status: None, cause: ServerErrorCause::Timeout })
        );
    }

    #[tokio::test]
    async fn test_mismatched_post_id_is_malformed() {
        let transport = Arc::new(ScriptedTransport::new().respond("posts/8.json", RawResponse::new(200, post_body(9))));
        let engine = orchestrator(transport, OrchestratorConfig::default());

        let reports = collect(engine.fetch(Uuid::new_v4(), [Identifier::Post(8)], CancellationToken::new())).await;
        let report = reports.into_iter().next().expect("report").expect("report");
        assert!(matches!(report.outcome, FetchOutcome::Malformed(_)));
    }

    #[tokio::test]
    async fn test_failed_listing_yields_one_tagged_report() {
        let transport = Arc::new(with_posts([4]));
        let engine = orchestrator(transport, OrchestratorConfig::default());

        let reports = collect(engine.fetch(Uuid::new_v4(), [Identifier::Pool(404), Identifier::Post(4)], CancellationToken::new())).await;
        let reports: Vec<FetchReport> = reports.into_iter().map(|r| r.expect("report")).collect();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].origin, Identifier::Pool(404));
        assert_eq!(reports[0].post_id, Field::Absent);
        assert_eq!(reports[0].outcome, FetchOutcome::NotFound);
        assert_eq!(reports[1].post_id, Field::Present(4));
        assert_eq!(reports[1].position, 2);
    }

    #[tokio::test]
    async fn test_artist_listing_keeps_gated_entries_inline() {
        let page = json!([
            serde_json::from_str::<serde_json::Value>(&post_body(31)).expect("json"),
            {"tag_string": "loli", "tag_string_general": "loli", "pixiv_id": 12}
        ]);
        let transport = Arc::new(
            ScriptedTransport::new().respond("posts.json?tags=artist_x&limit=200", RawResponse::new(200, page.to_string())),
        );
        let engine = orchestrator(transport.clone(), OrchestratorConfig::default());

        let reports = collect(engine.fetch(Uuid::new_v4(), [Identifier::Artist("artist_x".to_string())], CancellationToken::new())).await;
        let reports: Vec<FetchReport> = reports.into_iter().map(|r| r.expect("report")).collect();

        assert_eq!(reports[0].post_id, Field::Present(31));
        assert_eq!(reports[0].outcome.kind(), "success");
        assert_eq!(reports[1].post_id, Field::Withheld);
        assert!(matches!(
            &reports[1].outcome,
            FetchOutcome::Degraded(_, anomalies) if anomalies == &vec![Anomaly::GoldExclusive]
        ));
        // Inline payloads are not fetched a second time.
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_backoff_is_owed_between_groups_without_retries() {
        let transport = Arc::new(with_posts(2..=11).respond("posts/1.json", RawResponse::new(503, "busy")));
        let engine = with_fixed_backoff(transport.clone(), Duration::from_millis(200), 0);

        let reports = collect(engine.fetch(Uuid::new_v4(), (1..=11).map(Identifier::Post), CancellationToken::new())).await;

        assert_eq!(kinds(&reports)[0], "server_error");
        assert_eq!(engine.stats().retry_rounds, 0);
        let troubled = transport.requested_at("posts/1.json").expect("post 1");
        let next_group = transport.requested_at("posts/11.json").expect("post 11");
        assert!(next_group.duration_since(troubled) >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_listing_request_waits_out_owed_backoff() {
        let transport = with_posts(2..=11)
            .respond("posts/1.json", RawResponse::new(503, "busy"))
            .respond("pools/7.json", RawResponse::new(200, r#"{"id": 7, "name": "p", "post_ids": [11]}"#));
        let transport = Arc::new(transport);
        let engine = with_fixed_backoff(transport.clone(), Duration::from_millis(200), 0);

        let mut ids: Vec<Identifier> = (1..=10).map(Identifier::Post).collect();
        ids.push(Identifier::Pool(7));
        let reports = collect(engine.fetch(Uuid::new_v4(), ids, CancellationToken::new())).await;

        assert_eq!(reports.len(), 11);
        let troubled = transport.requested_at("posts/1.json").expect("post 1");
        let listing = transport.requested_at("pools/7.json").expect("pool");
        assert!(listing.duration_since(troubled) >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_connection_error_is_server_error() {
        let transport = Arc::new(
            with_posts([3]).fail("posts/4.json", TransportError::Connection("connection reset".to_string())),
        );
        let config = OrchestratorConfig {
            max_group_retries: 0,
            ..OrchestratorConfig::default()
        };
        let engine = orchestrator(transport, config);

        let reports = collect(engine.fetch(Uuid::new_v4(), [3, 4].map(Identifier::Post), CancellationToken::new())).await;
        let reports: Vec<FetchReport> = reports.into_iter().map(|r| r.expect("report")).collect();

        assert_eq!(reports[0].outcome.kind(), "success");
        assert_eq!(
            reports[1].outcome,
            FetchOutcome::ServerError(ServerFault { status: None, cause: ServerErrorCause::Connection })
        );
        assert_eq!(engine.stats().server_errors, 1);
    }

    #[tokio::test]
    async fn test_concurrency_drops_past_the_first_tier() {
        let ids: Vec<u64> = (1..=60).collect();
        let transport = ids.iter().fold(with_posts(ids.clone()), |transport, id| {
            transport.delay(&format!("posts/{}.json", id), Duration::from_millis(20))
        });
        let transport = Arc::new(transport);
        let engine = orchestrator(transport.clone(), OrchestratorConfig::default());

        let mut stream = engine.fetch(Uuid::new_v4(), ids.into_iter().map(Identifier::Post), CancellationToken::new());
        for _ in 0..50 {
            stream.next().await.expect("report").expect("report");
        }
        assert!(transport.peak_in_flight() <= 10);

        // Group barriers mean nothing from the first tier is still outstanding here.
        transport.reset_peak();
        let rest: Vec<_> = stream.collect().await;

        assert_eq!(rest.len(), 10);
        assert!(transport.peak_in_flight() <= 5);
        assert!(transport.peak_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_transient_listing_failure_is_retried() {
        let transport = with_posts([11])
            .respond("pools/7.json", RawResponse::new(503, "busy"))
            .respond("pools/7.json", RawResponse::new(200, r#"{"id": 7, "name": "p", "post_ids": [11]}"#));
        let transport = Arc::new(transport);
        let engine = with_fixed_backoff(transport.clone(), Duration::from_millis(10), 1);

        let reports = collect(engine.fetch(Uuid::new_v4(), [Identifier::Pool(7)], CancellationToken::new())).await;

        assert_eq!(kinds(&reports), vec!["success"]);
        assert_eq!(engine.stats().retry_rounds, 1);
        assert_eq!(
            transport.requests(),
            vec!["pools/7.json".to_string(), "pools/7.json".to_string(), "posts/11.json".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_artist_page_keeps_earlier_entries() {
        let page_one = json!([
            serde_json::from_str::<serde_json::Value>(&post_body(40)).expect("json"),
            serde_json::from_str::<serde_json::Value>(&post_body(30)).expect("json")
        ]);
        let transport = ScriptedTransport::new()
            .respond("posts.json?tags=artist_y&limit=2", RawResponse::new(200, page_one.to_string()))
            .respond("posts.json?tags=artist_y&limit=2&page=b30", RawResponse::new(500, "down"));
        let config = OrchestratorConfig {
            max_group_retries: 0,
            listing: ListingOptions {
                posts_per_page: 2,
                ..ListingOptions::default()
            },
            ..OrchestratorConfig::default()
        };
        let engine = orchestrator(Arc::new(transport), config);

        let reports = collect(engine.fetch(
            Uuid::new_v4(),
            [Identifier::Artist("artist_y".to_string())],
            CancellationToken::new(),
        ))
        .await;
        let reports: Vec<FetchReport> = reports.into_iter().map(|r| r.expect("report")).collect();

        let ids: Vec<Field<u64>> = reports.iter().map(|r| r.post_id.clone()).collect();
        assert_eq!(ids, vec![Field::Present(40), Field::Present(30), Field::Absent]);
        assert_eq!(reports[2].outcome.kind(), "server_error");
    }
}
