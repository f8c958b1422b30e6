// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded-latency delivery of metric points to an HTTP time-series endpoint.
//!
//! [`delivery_queue::DeliveryQueue`] batches submitted points and posts them as gzip-compressed
//! JSON through a [`transport::BoundedTransport`], which puts a hard wall-clock limit on every
//! request with the help of a [`deadline_queue::DeadlineQueue`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod constants;
pub mod deadline_queue;
pub mod delivery_queue;
pub mod errors;
pub mod listener;
pub mod payload;
pub mod point;
pub mod response;
pub mod retry;
pub mod stats;
pub mod tls;
pub mod transport;
