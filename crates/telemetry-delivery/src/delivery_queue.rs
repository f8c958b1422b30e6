// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching and backpressure between point producers and the HTTP endpoint.
//!
//! ```text
//!   producers ──add()──> pending (VecDeque, oldest first)
//!                            │ drain <= batch_size
//!                            v
//!                      JSON + gzip ──> BoundedTransport POST
//!                            │
//!                 2xx ───────┴─────── error / non-2xx
//!                  │                        │
//!               discard        drop stale points, push the rest
//!                              back on the head of the queue, back off
//! ```
//!
//! A single delivery loop drains the queue so points leave in submission order and at most one
//! batch is in flight. Producers never see delivery failures; they only show up in the counters.

use crate::constants;
use crate::errors::DeliveryError;
use crate::payload;
use crate::point::{unix_now, Point, Tags};
use crate::transport::BoundedTransport;
use reqwest::header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Method, Request, Url};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::{sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub url: Url,
    pub batch_size: usize,
    /// Points older than this are dropped rather than restaged after a failure.
    pub stale_after: Duration,
    pub failure_backoff: Duration,
    pub idle_interval: Duration,
    /// New points are dropped while the queue holds this many. `None` is unbounded.
    pub max_queue_len: Option<usize>,
    /// Merged into every submitted point; explicit tags win.
    pub default_tags: Tags,
}

impl QueueConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            batch_size: constants::BATCH_SIZE,
            stale_after: constants::STALE_AFTER,
            failure_backoff: constants::FAILURE_BACKOFF,
            idle_interval: constants::IDLE_INTERVAL,
            max_queue_len: None,
            default_tags: Tags::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped_stale: AtomicU64,
    dropped_invalid: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_encoding: AtomicU64,
    failed_batches: AtomicU64,
}

/// Snapshot of the delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub sent: u64,
    pub dropped_stale: u64,
    pub dropped_invalid: u64,
    pub dropped_overflow: u64,
    pub dropped_encoding: u64,
    pub failed_batches: u64,
    pub queued: usize,
}

/// What one call to [`DeliveryQueue::send_batch`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was queued.
    Idle,
    /// The endpoint accepted this many points.
    Delivered(usize),
    /// Delivery failed; fresh points went back to the queue, stale ones were dropped.
    Failed { restaged: usize, dropped: usize },
    /// The batch could not be encoded and was dropped.
    Discarded(usize),
}

pub struct DeliveryQueue {
    config: QueueConfig,
    transport: Arc<BoundedTransport>,
    pending: Mutex<VecDeque<Point>>,
    counters: Counters,
}

impl DeliveryQueue {
    pub fn new(config: QueueConfig, transport: Arc<BoundedTransport>) -> Self {
        DeliveryQueue {
            config,
            transport,
            pending: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Point>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a measurement stamped with the current time.
    pub fn add(&self, metric: impl Into<String>, value: f64, tags: Tags) {
        self.push(Point::now(metric, value, tags));
    }

    /// Queues a point, keeping its timestamp.
    pub fn push(&self, mut point: Point) {
        for (k, v) in &self.config.default_tags {
            point
                .tags
                .entry(k.clone())
                .or_insert_with(|| v.clone());
        }
        if let Err(reason) = point.validate() {
            self.counters.dropped_invalid.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping point: {reason}");
            return;
        }

        let mut pending = self.lock();
        if let Some(max) = self.config.max_queue_len {
            if pending.len() >= max {
                drop(pending);
                self.counters
                    .dropped_overflow
                    .fetch_add(1, Ordering::Relaxed);
                debug!("Queue full ({max} points), dropping {}", point.metric);
                return;
            }
        }
        pending.push_back(point);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped_stale: self.counters.dropped_stale.load(Ordering::Relaxed),
            dropped_invalid: self.counters.dropped_invalid.load(Ordering::Relaxed),
            dropped_overflow: self.counters.dropped_overflow.load(Ordering::Relaxed),
            dropped_encoding: self.counters.dropped_encoding.load(Ordering::Relaxed),
            failed_batches: self.counters.failed_batches.load(Ordering::Relaxed),
            queued: self.len(),
        }
    }

    /// Runs one delivery cycle over at most `batch_size` of the oldest points.
    pub async fn send_batch(&self) -> CycleOutcome {
        self.cycle(None).await
    }

    /// One cycle; when `give_up` passes while the batch is in flight the attempt is abandoned and
    /// the batch is treated as failed.
    async fn cycle(&self, give_up: Option<Instant>) -> CycleOutcome {
        let batch: Vec<Point> = {
            let mut pending = self.lock();
            let take = pending.len().min(self.config.batch_size);
            pending.drain(..take).collect()
        };
        if batch.is_empty() {
            return CycleOutcome::Idle;
        }

        debug!("Delivering {} points", batch.len());
        let result = match give_up {
            Some(give_up) => tokio::select! {
                result = self.deliver(&batch) => result,
                () = sleep_until(give_up.into()) => Err(DeliveryError::BudgetExhausted),
            },
            None => self.deliver(&batch).await,
        };
        self.settle(batch, result)
    }

    /// Accounts for a finished delivery attempt of `batch`.
    fn settle(&self, batch: Vec<Point>, result: Result<(), DeliveryError>) -> CycleOutcome {
        let count = batch.len();
        match result {
            Ok(()) => {
                self.counters
                    .sent
                    .fetch_add(count as u64, Ordering::Relaxed);
                debug!("Successfully delivered {count} points");
                CycleOutcome::Delivered(count)
            }
            Err(DeliveryError::Encode(e)) => {
                self.counters
                    .dropped_encoding
                    .fetch_add(count as u64, Ordering::Relaxed);
                error!("Failed to prepare payload. {count} points dropped: {e}");
                CycleOutcome::Discarded(count)
            }
            Err(e) => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                let (restaged, dropped) = self.restage(batch);
                error!(restaged, dropped, "Error delivering points: {e}");
                CycleOutcome::Failed { restaged, dropped }
            }
        }
    }

    async fn deliver(&self, batch: &[Point]) -> Result<(), DeliveryError> {
        let body = payload::encode_batch(batch)?;

        let mut request = Request::new(Method::POST, self.config.url.clone());
        let headers = request.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(payload::CONTENT_TYPE),
        );
        headers.insert(
            CONTENT_ENCODING,
            HeaderValue::from_static(payload::CONTENT_ENCODING),
        );
        *request.body_mut() = Some(body.into());

        let response = self.transport.execute(request).await?;
        let status = response.status();
        if status.is_success() {
            // drain so the connection can go back to the pool
            if let Err(e) = response.bytes().await {
                debug!("Ignoring error while reading response body: {e}");
            }
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        warn!("{status}: Failed to push to endpoint: {body:?}");
        Err(DeliveryError::Status(status))
    }

    /// Puts the non-stale points of a failed batch back on the head of the queue in their original
    /// order. Returns `(restaged, dropped)`.
    fn restage(&self, batch: Vec<Point>) -> (usize, usize) {
        let now = unix_now();
        let max_age = i64::try_from(self.config.stale_after.as_secs()).unwrap_or(i64::MAX);
        let total = batch.len();
        let fresh: Vec<Point> = batch
            .into_iter()
            .filter(|point| point.age_secs(now) <= max_age)
            .collect();
        let restaged = fresh.len();
        let dropped = total - restaged;

        {
            let mut pending = self.lock();
            for point in fresh.into_iter().rev() {
                pending.push_front(point);
            }
        }
        if dropped > 0 {
            self.counters
                .dropped_stale
                .fetch_add(dropped as u64, Ordering::Relaxed);
            warn!("Dropped {dropped} stale points older than {max_age}s");
        }
        (restaged, dropped)
    }

    /// Delivers batches until `cancel` fires.
    ///
    /// Sleeps `idle_interval` when the queue is empty and `failure_backoff` after a failed cycle.
    /// Only one loop may run per queue.
    pub async fn run(&self, cancel: CancellationToken) {
        debug!("Delivery loop started");
        loop {
            let pause = match self.send_batch().await {
                CycleOutcome::Idle => Some(self.config.idle_interval),
                CycleOutcome::Failed { .. } => Some(self.config.failure_backoff),
                CycleOutcome::Delivered(_) | CycleOutcome::Discarded(_) => None,
            };
            if cancel.is_cancelled() {
                break;
            }
            if let Some(pause) = pause {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = sleep(pause) => {}
                }
            }
        }
        debug!("Delivery loop stopped");
    }

    /// Sends queued batches until the queue is empty, a cycle fails or `budget` runs out.
    ///
    /// A batch still in flight when the budget runs out is abandoned and restaged. Meant for
    /// shutdown, after [`DeliveryQueue::run`] has returned. Returns whether the queue was emptied.
    pub async fn flush(&self, budget: Duration) -> bool {
        let give_up = Instant::now() + budget;
        while Instant::now() < give_up {
            match self.cycle(Some(give_up)).await {
                CycleOutcome::Idle => return true,
                CycleOutcome::Failed { .. } => return false,
                CycleOutcome::Delivered(_) | CycleOutcome::Discarded(_) => {}
            }
        }
        self.is_empty()
    }

    /// Queues the pipeline's own counters as points.
    pub fn record_self_metrics(&self) {
        let stats = self.stats();
        let prefix = constants::SELF_METRIC_PREFIX;
        self.add(format!("{prefix}.sent"), stats.sent as f64, Tags::new());
        self.add(
            format!("{prefix}.failed_batches"),
            stats.failed_batches as f64,
            Tags::new(),
        );
        for (reason, count) in [
            ("stale", stats.dropped_stale),
            ("invalid", stats.dropped_invalid),
            ("overflow", stats.dropped_overflow),
            ("encoding", stats.dropped_encoding),
        ] {
            let tags = Tags::from([("reason".to_string(), reason.to_string())]);
            self.add(format!("{prefix}.dropped"), count as f64, tags);
        }
        self.add(format!("{prefix}.queued"), stats.queued as f64, Tags::new());
    }

    #[cfg(test)]
    fn snapshot(&self) -> Vec<Point> {
        self.lock().iter().cloned().collect()
    }
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
