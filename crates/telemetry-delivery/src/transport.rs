// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP executor with a hard wall-clock budget per request.
//!
//! reqwest's pooled client has no per-request deadline that also covers streaming the body, so
//! every attempt registers a cancellation token in a shared [`DeadlineQueue`]. A background sweep
//! wakes up on a fixed tick, pops everything whose deadline has passed and cancels it. The
//! exchange future races that token, so a hung request fails within one tick of its deadline no
//! matter where it is stuck.
//!
//! Transient failures of GET requests are retried up to `max_tries` attempts. Every other request
//! gets exactly one attempt; callers such as the delivery queue own retries for those.

use crate::constants;
use crate::deadline_queue::{DeadlineQueue, Poll, QueueEntry};
use crate::errors::TransportError;
use crate::response::{AttemptGuard, TrackedResponse};
use crate::retry;
use crate::stats::{AttemptObserver, AttemptRecord};
use crate::tls;
use reqwest::{Client, Method, Request, Response, Url};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type ProxySelector = Arc<dyn Fn(&Url) -> Option<Url> + Send + Sync>;

/// How requests pick a proxy.
#[derive(Clone, Default)]
pub enum ProxyMode {
    /// Connect directly, ignoring proxy environment variables.
    #[default]
    Direct,
    /// Send every request through this proxy URL.
    Url(String),
    /// Choose per target URL; `None` connects directly.
    Custom(ProxySelector),
}

impl std::fmt::Debug for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "Direct"),
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

#[derive(Clone)]
pub struct TransportOptions {
    pub proxy: ProxyMode,
    /// Validate server certificates and host names.
    pub tls_verify: bool,
    /// Close connections after each exchange instead of pooling them.
    pub disable_keep_alives: bool,
    /// Do not advertise or transparently decode compressed responses.
    pub disable_compression: bool,
    pub max_idle_per_host: usize,
    pub dial_timeout: Option<Duration>,
    pub response_header_timeout: Option<Duration>,
    /// Budget for the whole exchange, body included. `None` never expires.
    pub request_timeout: Option<Duration>,
    /// Attempts per GET request, first one included.
    pub max_tries: u32,
    pub sweep_interval: Duration,
    pub observer: Option<AttemptObserver>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            proxy: ProxyMode::Direct,
            tls_verify: true,
            disable_keep_alives: false,
            disable_compression: false,
            max_idle_per_host: constants::MAX_IDLE_PER_HOST,
            dial_timeout: Some(constants::DIAL_TIMEOUT),
            response_header_timeout: Some(constants::RESPONSE_HEADER_TIMEOUT),
            request_timeout: Some(constants::REQUEST_TIMEOUT),
            max_tries: constants::MAX_TRIES,
            sweep_interval: constants::SWEEP_INTERVAL,
            observer: None,
        }
    }
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("proxy", &self.proxy)
            .field("tls_verify", &self.tls_verify)
            .field("disable_keep_alives", &self.disable_keep_alives)
            .field("disable_compression", &self.disable_compression)
            .field("max_idle_per_host", &self.max_idle_per_host)
            .field("dial_timeout", &self.dial_timeout)
            .field("response_header_timeout", &self.response_header_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("max_tries", &self.max_tries)
            .field("sweep_interval", &self.sweep_interval)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Started lazily on the first request.
struct Running {
    client: Mutex<Option<Client>>,
    stop: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

pub struct BoundedTransport {
    options: TransportOptions,
    queue: Arc<DeadlineQueue<CancellationToken>>,
    running: OnceCell<Running>,
    closed: AtomicBool,
}

impl BoundedTransport {
    #[must_use]
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            queue: Arc::new(DeadlineQueue::new()),
            running: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Requests currently tracked against a deadline.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Sends a GET request to `url`.
    pub async fn get(&self, url: Url) -> Result<TrackedResponse, TransportError> {
        self.execute(Request::new(Method::GET, url)).await
    }

    /// Runs `request` under the configured deadline, retrying transient GET failures.
    pub async fn execute(&self, mut request: Request) -> Result<TrackedResponse, TransportError> {
        let client = self.client().await?;
        let max_tries = self.options.max_tries.max(1);
        let replayable = retry::is_idempotent(request.method());
        let mut attempt = 0;

        loop {
            let spare = if replayable && attempt + 1 < max_tries {
                request.try_clone()
            } else {
                None
            };
            let method = request.method().clone();
            let url = request.url().clone();

            let (err, elapsed) = match self.attempt(&client, request, attempt).await {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };

            let retry_pending = spare.is_some() && retry::is_retryable(&err);
            self.observe(&AttemptRecord {
                method: method.clone(),
                url: url.clone(),
                status: None,
                error: Some(err.to_string()),
                header_time: elapsed,
                body_time: Duration::ZERO,
                retry: attempt,
                retry_pending,
            });

            match spare {
                Some(next) if retry_pending => {
                    debug!(%method, %url, attempt, "retrying after transient error: {err}");
                    request = next;
                    attempt += 1;
                }
                _ => return Err(err),
            }
        }
    }

    async fn attempt(
        &self,
        client: &Client,
        request: Request,
        retry: u32,
    ) -> Result<TrackedResponse, (TransportError, Duration)> {
        let started = Instant::now();
        let timeout = self.options.request_timeout;
        let deadline = timeout.map(|budget| started + budget);
        let entry = QueueEntry::new(CancellationToken::new(), deadline);
        if deadline.is_some() {
            self.queue.push(&entry);
        }

        let method = request.method().clone();
        let url = request.url().clone();
        let exchange = with_header_timeout(
            client.execute(request),
            self.options.response_header_timeout,
        );

        let result = tokio::select! {
            biased;
            () = entry.handle().cancelled() => {
                Err(TransportError::DeadlineExceeded(timeout.unwrap_or_default()))
            }
            response = exchange => response,
        };

        match result {
            Ok(response) => {
                let guard = AttemptGuard {
                    entry,
                    queue: Arc::clone(&self.queue),
                    observer: self.options.observer.clone(),
                    method,
                    url,
                    status: response.status(),
                    timeout,
                    started,
                    header_time: started.elapsed(),
                    retry,
                    error: None,
                    released: false,
                };
                Ok(TrackedResponse::new(response, guard))
            }
            Err(err) => {
                self.queue.remove(&entry);
                Err((err, started.elapsed()))
            }
        }
    }

    fn observe(&self, record: &AttemptRecord) {
        if let Some(observer) = &self.options.observer {
            observer(record);
        }
    }

    async fn client(&self) -> Result<Client, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let running = self
            .running
            .get_or_try_init(|| async { self.start() })
            .await?;
        self.checkout(running)
    }

    /// Hands out the pooled client, unless a shutdown raced the lazy start. In that case the
    /// freshly started sweep and pool are torn down here, since `shutdown` found nothing to stop.
    fn checkout(&self, running: &Running) -> Result<Client, TransportError> {
        let mut client = running
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            client.take();
            running.stop.cancel();
            return Err(TransportError::Closed);
        }
        client.clone().ok_or(TransportError::Closed)
    }

    fn start(&self) -> Result<Running, TransportError> {
        let client = build_client(&self.options)?;
        let stop = CancellationToken::new();
        let sweeper = tokio::spawn(sweep(
            Arc::clone(&self.queue),
            self.options.sweep_interval,
            stop.clone(),
        ));
        debug!(
            "Started transport with {:?} sweep interval",
            self.options.sweep_interval
        );
        Ok(Running {
            client: Mutex::new(Some(client)),
            stop,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Drops the connection pool and stops the sweep, returning once the sweep has exited.
    ///
    /// Requests still in flight keep their connection until they finish, but are no longer
    /// cancelled on expiry.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let Some(running) = self.running.get() else {
            return;
        };
        running
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        running.stop.cancel();
        let sweeper = running
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                warn!("Deadline sweep ended abnormally: {e}");
            }
        }
        debug!("Transport shut down");
    }
}

impl Drop for BoundedTransport {
    fn drop(&mut self) {
        if let Some(running) = self.running.get() {
            running.stop.cancel();
        }
    }
}

impl std::fmt::Debug for BoundedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedTransport")
            .field("options", &self.options)
            .field("pending", &self.queue.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

async fn with_header_timeout(
    exchange: impl Future<Output = Result<Response, reqwest::Error>>,
    limit: Option<Duration>,
) -> Result<Response, TransportError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| TransportError::HeaderTimeout(limit))?
            .map_err(TransportError::from),
        None => exchange.await.map_err(TransportError::from),
    }
}

/// Cancels every request whose deadline has passed, once per tick, until `stop` fires.
async fn sweep(
    queue: Arc<DeadlineQueue<CancellationToken>>,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        let mut expired = 0usize;
        while let Poll::Due(entry) = queue.pop_if_due(now) {
            entry.handle().cancel();
            expired += 1;
        }
        if expired > 0 {
            debug!(expired, "Cancelled requests past their deadline");
        }
    }
    debug!("Deadline sweep stopped");
}

fn build_client(options: &TransportOptions) -> Result<Client, TransportError> {
    let idle_per_host = if options.disable_keep_alives {
        0
    } else {
        options.max_idle_per_host
    };
    let mut builder = tls::client_builder(options.tls_verify)?
        .pool_max_idle_per_host(idle_per_host)
        .gzip(!options.disable_compression);
    if let Some(dial_timeout) = options.dial_timeout {
        builder = builder.connect_timeout(dial_timeout);
    }
    builder = match &options.proxy {
        ProxyMode::Direct => builder.no_proxy(),
        ProxyMode::Url(url) => builder.proxy(
            reqwest::Proxy::all(url.as_str())
                .map_err(|e| TransportError::Build(format!("invalid proxy {url}: {e}")))?,
        ),
        ProxyMode::Custom(selector) => {
            let selector = Arc::clone(selector);
            builder.proxy(reqwest::Proxy::custom(move |url| selector(url)))
        }
    };
    builder
        .build()
        .map_err(|e| TransportError::Build(e.to_string()))
}
