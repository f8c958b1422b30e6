// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Response handle that keeps the deadline bookkeeping alive while the body is read.

use crate::deadline_queue::{DeadlineQueue, QueueEntry};
use crate::errors::TransportError;
use crate::stats::{AttemptObserver, AttemptRecord};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Bookkeeping for one successful exchange, released exactly once.
pub(crate) struct AttemptGuard {
    pub(crate) entry: Arc<QueueEntry<CancellationToken>>,
    pub(crate) queue: Arc<DeadlineQueue<CancellationToken>>,
    pub(crate) observer: Option<AttemptObserver>,
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) status: StatusCode,
    pub(crate) timeout: Option<Duration>,
    pub(crate) started: Instant,
    pub(crate) header_time: Duration,
    pub(crate) retry: u32,
    pub(crate) error: Option<String>,
    pub(crate) released: bool,
}

impl AttemptGuard {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.queue.remove(&self.entry);
        if let Some(observer) = &self.observer {
            observer(&AttemptRecord {
                method: self.method.clone(),
                url: self.url.clone(),
                status: Some(self.status),
                error: self.error.take(),
                header_time: self.header_time,
                body_time: self.started.elapsed().saturating_sub(self.header_time),
                retry: self.retry,
                retry_pending: false,
            });
        }
    }

    fn cancelled_error(&self) -> TransportError {
        TransportError::DeadlineExceeded(self.timeout.unwrap_or_default())
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// A response whose body can still be cancelled by the expiry sweep.
///
/// Reading the whole body, calling [`TrackedResponse::close`] or dropping the value removes the
/// request from the deadline queue and reports the attempt.
pub struct TrackedResponse {
    response: reqwest::Response,
    guard: AttemptGuard,
}

impl TrackedResponse {
    pub(crate) fn new(response: reqwest::Response, guard: AttemptGuard) -> Self {
        Self { response, guard }
    }

    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.response.headers()
    }

    pub fn url(&self) -> &Url {
        self.response.url()
    }

    /// Reads the remaining body.
    pub async fn bytes(mut self) -> Result<Vec<u8>, TransportError> {
        let mut body = Vec::new();
        loop {
            let chunk = tokio::select! {
                biased;
                () = self.guard.entry.handle().cancelled() => Err(self.guard.cancelled_error()),
                chunk = self.response.chunk() => {
                    chunk.map_err(|e| TransportError::Body(e.to_string()))
                }
            };
            match chunk {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => {
                    self.guard.error = Some(e.to_string());
                    return Err(e);
                }
            }
        }
        self.guard.release();
        Ok(body)
    }

    /// Reads the remaining body as lossy UTF-8.
    pub async fn text(self) -> Result<String, TransportError> {
        let body = self.bytes().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Drops the body without reading it.
    pub fn close(self) {
        drop(self);
    }
}

impl std::fmt::Debug for TrackedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedResponse")
            .field("status", &self.response.status())
            .field("url", self.response.url())
            .field("retry", &self.guard.retry)
            .finish_non_exhaustive()
    }
}
