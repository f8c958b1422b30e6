// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::{Method, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;

/// Observable outcome of one request attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub method: Method,
    pub url: Url,
    pub status: Option<StatusCode>,
    pub error: Option<String>,
    /// Time until response headers arrived, or until the attempt failed.
    pub header_time: Duration,
    /// Time spent reading and closing the body after the headers.
    pub body_time: Duration,
    /// 0 for the first attempt.
    pub retry: u32,
    /// Another attempt follows this one.
    pub retry_pending: bool,
}

impl AttemptRecord {
    pub fn total_time(&self) -> Duration {
        self.header_time + self.body_time
    }
}

/// Per-attempt callback, usually feeding self-monitoring.
pub type AttemptObserver = Arc<dyn Fn(&AttemptRecord) + Send + Sync>;
