// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;
use std::time::Duration;

/// Failure of a single request/response exchange.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no response headers within {0:?}")]
    HeaderTimeout(Duration),

    /// The expiry sweep cancelled the exchange.
    #[error("request canceled: deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("transport is shut down")]
    Closed,

    #[error("failed to build HTTP client: {0}")]
    Build(String),

    #[error("failed to read response body: {0}")]
    Body(String),
}

/// Failure to turn a batch into a request body.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to serialize batch: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to compress batch: {0}")]
    Compress(#[from] std::io::Error),
}

/// Failure of one delivery cycle.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unexpected response status {0}")]
    Status(StatusCode),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The caller's time budget ran out while the batch was in flight.
    #[error("delivery abandoned: flush budget exhausted")]
    BudgetExhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("not a put line: {0}")]
    NotPut(String),
    #[error("put line is missing fields")]
    MissingFields,
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("invalid tag: {0}")]
    InvalidTag(String),
}
