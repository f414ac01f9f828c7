// src/aggregator.rs
use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::feed;
use crate::models::{Direction, TaggedTransfer, TransferPage};
use crate::source::{FetchError, TransferSource};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const DEFAULT_BUFFER_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorOptions {
    /// Records handed out per call.
    pub page_size: usize,
    /// Extra unconsumed records to keep buffered before fetching again.
    pub buffer_size: usize,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl AggregatorOptions {
    /// Records requested from each upstream page
    pub fn fetch_size(&self) -> usize {
        2 * self.page_size + self.buffer_size
    }

    /// Unconsumed records at or below which another page is fetched
    pub fn refill_threshold(&self) -> usize {
        self.page_size + self.buffer_size
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchMetadata {
    pub has_more: bool,
    /// Everything was served and both directions are exhausted.
    pub caught_up: bool,
    /// Returned by `try_get_more_transactions` while a cycle was running.
    pub in_progress: bool,
    pub current_position: usize,
    pub total_in_memory: usize,
    pub outgoing_buffered: usize,
    pub incoming_buffered: usize,
    pub outgoing_page: u32,
    pub incoming_page: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferBatch {
    pub transfers: Vec<TaggedTransfer>,
    pub metadata: BatchMetadata,
}

/// Diagnostic snapshot, see `TransferAggregator::stats`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub address: String,
    pub initialized: bool,
    pub is_processing: bool,
    pub outgoing_buffered: usize,
    pub incoming_buffered: usize,
    pub feed_length: usize,
    pub feed_position: usize,
    pub has_more_outgoing: bool,
    pub has_more_incoming: bool,
    pub outgoing_page: u32,
    pub incoming_page: u32,
    pub last_outgoing_error: Option<String>,
    pub last_incoming_error: Option<String>,
    pub generation: u64,
}

#[derive(Debug)]
struct DirectionCursor {
    buffer: Vec<TaggedTransfer>,
    next_page: u32,
    has_more: bool,
    last_error: Option<String>,
}

impl Default for DirectionCursor {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            next_page: 0,
            has_more: true,
            last_error: None,
        }
    }
}

#[derive(Debug, Default)]
struct FeedCache {
    generation: u64,
    entries: Vec<TaggedTransfer>,
}

#[derive(Debug, Default)]
struct AggregatorState {
    outgoing: DirectionCursor,
    incoming: DirectionCursor,
    initialized: bool,
    /// Bumped on every buffer change; the feed cache is valid for one value.
    generation: u64,
    feed: FeedCache,
    position: usize,
    /// Bumped by `reset`; cycles started under an older epoch are discarded.
    epoch: u64,
}

struct FetchPlan {
    epoch: u64,
    outgoing: Option<u32>,
    incoming: Option<u32>,
}

impl AggregatorState {
    fn cursor_mut(&mut self, direction: Direction) -> &mut DirectionCursor {
        match direction {
            Direction::Out => &mut self.outgoing,
            Direction::In => &mut self.incoming,
        }
    }

    fn any_source_has_more(&self) -> bool {
        self.outgoing.has_more || self.incoming.has_more
    }

    fn remaining(&self) -> usize {
        self.feed.entries.len() - self.position
    }

    /// Rebuilds the combined feed if the buffers moved since the last build
    /// and carries the served prefix over to the new order.
    fn refresh_feed(&mut self) {
        if self.feed.generation == self.generation {
            return;
        }
        let entries = feed::build_feed(&self.outgoing.buffer, &self.incoming.buffer);
        let realigned = feed::realign_position(&self.feed.entries[..self.position], &entries);
        self.position = realigned.max(self.position).min(entries.len());
        self.feed = FeedCache {
            generation: self.generation,
            entries,
        };
    }

    fn fetch_plan(&mut self, options: &AggregatorOptions) -> Option<FetchPlan> {
        self.refresh_feed();
        let refill = self.remaining() <= options.refill_threshold() && self.any_source_has_more();
        if self.initialized && !refill {
            return None;
        }
        Some(FetchPlan {
            epoch: self.epoch,
            outgoing: self.outgoing.has_more.then_some(self.outgoing.next_page),
            incoming: self.incoming.has_more.then_some(self.incoming.next_page),
        })
    }

    fn apply_page(&mut self, direction: Direction, result: Result<TransferPage, FetchError>) {
        let cursor = self.cursor_mut(direction);
        match result {
            Ok(page) => {
                let fetched = page.transfers.len();
                cursor.next_page += 1;
                cursor.has_more = page.has_more;
                cursor
                    .buffer
                    .extend(page.transfers.into_iter().map(|t| t.tagged(direction)));
                debug!(
                    "{} page {} → {} transfers (buffered {}, more: {})",
                    direction.as_param(),
                    cursor.next_page - 1,
                    fetched,
                    cursor.buffer.len(),
                    cursor.has_more
                );
                if fetched > 0 {
                    self.generation += 1;
                }
            }
            Err(e) => {
                warn!(
                    "Fetching {} transfers failed, giving up on that direction: {}",
                    direction.as_param(),
                    e
                );
                cursor.has_more = false;
                cursor.last_error = Some(e.to_string());
            }
        }
    }

    fn metadata(&self, has_more: bool, caught_up: bool, in_progress: bool) -> BatchMetadata {
        BatchMetadata {
            has_more,
            caught_up,
            in_progress,
            current_position: self.position,
            total_in_memory: self.feed.entries.len(),
            outgoing_buffered: self.outgoing.buffer.len(),
            incoming_buffered: self.incoming.buffer.len(),
            outgoing_page: self.outgoing.next_page,
            incoming_page: self.incoming.next_page,
        }
    }

    fn next_batch(&mut self, page_size: usize) -> TransferBatch {
        self.refresh_feed();
        if self.remaining() == 0 && !self.any_source_has_more() {
            return TransferBatch {
                transfers: Vec::new(),
                metadata: self.metadata(false, true, false),
            };
        }

        let end = (self.position + page_size).min(self.feed.entries.len());
        let transfers = self.feed.entries[self.position..end].to_vec();
        self.position = end;
        let has_more = self.remaining() > 0 || self.any_source_has_more();
        TransferBatch {
            transfers,
            metadata: self.metadata(has_more, false, false),
        }
    }

    /// Batch for a caller that made no progress: nothing served, state as-is.
    fn idle_batch(&self, in_progress: bool) -> TransferBatch {
        let has_more = self.remaining() > 0 || self.any_source_has_more();
        TransferBatch {
            transfers: Vec::new(),
            metadata: self.metadata(has_more, false, in_progress),
        }
    }
}

struct InFlight {
    id: u64,
    batch: Shared<BoxFuture<'static, TransferBatch>>,
}

struct Inner<S> {
    source: Arc<S>,
    address: String,
    options: AggregatorOptions,
    state: Mutex<AggregatorState>,
    in_flight: Mutex<Option<InFlight>>,
    next_cycle: AtomicU64,
}

impl<S: TransferSource> Inner<S> {
    fn state(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch(&self, direction: Direction, page: Option<u32>) -> Option<Result<TransferPage, FetchError>> {
        let page = page?;
        Some(
            self.source
                .fetch_transfers(&self.address, direction, page, self.options.fetch_size())
                .await,
        )
    }

    /// One fetch-and-rebuild cycle. The two fetches are the only await points.
    async fn run_cycle(&self) -> TransferBatch {
        let plan = self.state().fetch_plan(&self.options);

        if let Some(plan) = plan {
            let (outgoing, incoming) = future::join(
                self.fetch(Direction::Out, plan.outgoing),
                self.fetch(Direction::In, plan.incoming),
            )
            .await;

            let mut state = self.state();
            if state.epoch != plan.epoch {
                debug!("Discarding fetch results for {} started before reset", self.address);
                return state.idle_batch(false);
            }
            if let Some(result) = outgoing {
                state.apply_page(Direction::Out, result);
            }
            if let Some(result) = incoming {
                state.apply_page(Direction::In, result);
            }
            state.initialized = true;
        }

        self.state().next_batch(self.options.page_size)
    }

    fn finish_cycle(&self, id: u64) {
        let mut slot = self.in_flight();
        if slot.as_ref().is_some_and(|f| f.id == id) {
            slot.take();
        }
    }
}

/// Clears the in-flight slot when the cycle task ends, panics included.
struct CycleGuard<S: TransferSource> {
    inner: Arc<Inner<S>>,
    id: u64,
}

impl<S: TransferSource> Drop for CycleGuard<S> {
    fn drop(&mut self) {
        self.inner.finish_cycle(self.id);
    }
}

/// Chronological, deduplicated, paginated view over the incoming and
/// outgoing transfers of one address.
///
/// Both directions are fetched page by page from a `TransferSource` and kept
/// in memory. Each call to `get_more_transactions` returns the next
/// `page_size` records of the merged feed, newest first.
pub struct TransferAggregator<S> {
    inner: Arc<Inner<S>>,
}

impl<S: TransferSource> TransferAggregator<S> {
    pub fn new(source: Arc<S>, address: impl Into<String>, options: AggregatorOptions) -> Self {
        let address = address.into();
        info!(
            "Transfer aggregator for {} (page {}, buffer {}, fetch {})",
            address,
            options.page_size,
            options.buffer_size,
            options.fetch_size()
        );
        Self {
            inner: Arc::new(Inner {
                source,
                address,
                options,
                state: Mutex::new(AggregatorState::default()),
                in_flight: Mutex::new(None),
                next_cycle: AtomicU64::new(0),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Hands out the running cycle, or starts one when none is running.
    /// With `join_running` false a running cycle yields `None` instead.
    ///
    /// The cycle runs on its own task, so it completes even when every
    /// caller waiting on it goes away.
    fn cycle(&self, join_running: bool) -> Option<Shared<BoxFuture<'static, TransferBatch>>> {
        let mut slot = self.inner.in_flight();
        if let Some(running) = slot.as_ref() {
            if !join_running {
                return None;
            }
            debug!("Joining in-flight cycle {} for {}", running.id, self.inner.address);
            return Some(running.batch.clone());
        }

        let id = self.inner.next_cycle.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            async move {
                let _guard = CycleGuard {
                    inner: Arc::clone(&inner),
                    id,
                };
                inner.run_cycle().await
            }
        });

        let inner = Arc::clone(&self.inner);
        let batch = async move {
            match task.await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("Fetch cycle {} for {} did not complete: {}", id, inner.address, e);
                    inner.state().idle_batch(false)
                }
            }
        }
        .boxed()
        .shared();
        *slot = Some(InFlight {
            id,
            batch: batch.clone(),
        });
        Some(batch)
    }

    /// Returns the next batch of the feed, fetching more upstream pages when
    /// the unconsumed part runs low.
    ///
    /// Concurrent callers share the cycle already in flight and all receive
    /// its batch; only one fetch-and-rebuild runs at a time. Never fails:
    /// a direction whose fetch errors is treated as exhausted.
    pub async fn get_more_transactions(&self) -> TransferBatch {
        match self.cycle(true) {
            Some(batch) => batch.await,
            None => self.inner.state().idle_batch(false),
        }
    }

    /// Non-blocking variant: while a cycle is running this returns at once
    /// with an empty batch flagged `in_progress`, and `has_more` reflecting
    /// what is already known.
    pub async fn try_get_more_transactions(&self) -> TransferBatch {
        match self.cycle(false) {
            Some(batch) => batch.await,
            None => self.inner.state().idle_batch(true),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.inner.in_flight().is_some()
    }

    /// Drops everything fetched so far. A cycle still in flight finishes its
    /// fetches but its results are discarded.
    pub fn reset(&self) {
        {
            let mut state = self.inner.state();
            let epoch = state.epoch + 1;
            let generation = state.generation + 1;
            *state = AggregatorState {
                epoch,
                generation,
                feed: FeedCache {
                    generation,
                    entries: Vec::new(),
                },
                ..Default::default()
            };
        }
        self.inner.in_flight().take();
        info!("Transfer aggregator for {} reset", self.inner.address);
    }

    pub fn stats(&self) -> AggregatorStats {
        let is_processing = self.is_processing();
        let state = self.inner.state();
        AggregatorStats {
            address: self.inner.address.clone(),
            initialized: state.initialized,
            is_processing,
            outgoing_buffered: state.outgoing.buffer.len(),
            incoming_buffered: state.incoming.buffer.len(),
            feed_length: state.feed.entries.len(),
            feed_position: state.position,
            has_more_outgoing: state.outgoing.has_more,
            has_more_incoming: state.incoming.has_more,
            outgoing_page: state.outgoing.next_page,
            incoming_page: state.incoming.next_page,
            last_outgoing_error: state.outgoing.last_error.clone(),
            last_incoming_error: state.incoming.last_error.clone(),
            generation: state.generation,
        }
    }
}
