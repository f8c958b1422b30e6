// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// How often the transport cancels requests past their deadline.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(25);

pub const MAX_TRIES: u32 = 3;
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_IDLE_PER_HOST: usize = 2;

/// Maximum number of points in one delivery.
pub const BATCH_SIZE: usize = 500;
/// Points older than this are dropped instead of being restaged after a failed delivery.
pub const STALE_AFTER: Duration = Duration::from_secs(30 * 60);
/// Pause after a failed delivery.
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(5);
/// Pause when there is nothing to send.
pub const IDLE_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_HOST: &str = "localhost:4242";
pub const DEFAULT_PATH: &str = "/api/put";

/// Prefix of the metrics the pipeline reports about itself.
pub const SELF_METRIC_PREFIX: &str = "telemetry";
