// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry eligibility of transport failures.

use crate::errors::TransportError;
use reqwest::Method;
use std::error::Error;
use std::io;

/// Error message endings that identify failures likely to succeed on a fresh attempt.
const TRANSIENT_SUFFIXES: [&str; 7] = [
    "connection refused",
    "connection reset by peer",
    "operation timed out",
    "no such host",
    "handshake failure",
    "unexpected eof",
    "eof",
];

/// Whether `err` is worth a fresh attempt.
///
/// Expiry cancellations are never retryable here; the caller owns that decision.
pub fn is_retryable(err: &TransportError) -> bool {
    match err {
        TransportError::HeaderTimeout(_) => true,
        TransportError::Http(e) => e.is_connect() || e.is_timeout() || chain_is_transient(e),
        TransportError::DeadlineExceeded(_)
        | TransportError::Closed
        | TransportError::Build(_)
        | TransportError::Body(_) => false,
    }
}

/// Only GET exchanges are replayed automatically.
pub fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET
}

/// Checks a message against the known transient endings, ignoring case and trailing whitespace.
pub fn has_transient_suffix(message: &str) -> bool {
    let message = message.trim_end().to_ascii_lowercase();
    TRANSIENT_SUFFIXES
        .iter()
        .any(|suffix| message.ends_with(suffix))
}

fn chain_is_transient(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        if has_transient_suffix(&e.to_string()) {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transient_suffixes() {
        assert!(has_transient_suffix("dial tcp 10.0.0.1:4242: connection refused"));
        assert!(has_transient_suffix("read: Connection reset by peer"));
        assert!(has_transient_suffix("lookup tsdb.invalid: no such host"));
        assert!(has_transient_suffix("remote error: tls: handshake failure"));
        assert!(has_transient_suffix("unexpected EOF\n"));
        assert!(has_transient_suffix("EOF"));
        assert!(!has_transient_suffix("permission denied"));
        assert!(!has_transient_suffix("connection refused by policy engine"));
    }

    #[test]
    fn test_io_error_kinds_in_chain() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "socket closed");
        assert!(chain_is_transient(&err));

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(!chain_is_transient(&err));
    }

    #[test]
    fn test_cancellation_is_not_retryable() {
        assert!(!is_retryable(&TransportError::DeadlineExceeded(
            Duration::from_millis(50)
        )));
        assert!(!is_retryable(&TransportError::Closed));
        assert!(is_retryable(&TransportError::HeaderTimeout(
            Duration::from_secs(1)
        )));
    }

    #[test]
    fn test_only_get_is_idempotent() {
        assert!(is_idempotent(&Method::GET));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PUT));
    }
}
