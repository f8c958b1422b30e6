// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP server accepting telnet-style `put` lines and feeding them to a [`DeliveryQueue`].
//!
//! Each datagram may carry several newline-separated lines. Lines that fail to parse are logged
//! and skipped; the rest of the datagram is still processed.

use crate::delivery_queue::DeliveryQueue;
use crate::errors::ParseError;
use crate::point::parse_put_line;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

// Large enough for a full UDP payload on loopback.
const BUFFER_SIZE: usize = 65_535;

pub struct ListenerConfig {
    /// Host to bind the UDP socket to (e.g., "0.0.0.0")
    pub host: String,
    /// Port to bind to; 0 picks a free port
    pub port: u16,
}

pub struct PutListener {
    cancel_token: CancellationToken,
    queue: Arc<DeliveryQueue>,
    socket: UdpSocket,
}

impl PutListener {
    /// Binds the UDP socket. Points are submitted to `queue` until `cancel_token` fires.
    pub async fn new(
        config: &ListenerConfig,
        queue: Arc<DeliveryQueue>,
        cancel_token: CancellationToken,
    ) -> std::io::Result<PutListener> {
        let socket = UdpSocket::bind((config.host.as_str(), config.port)).await?;
        debug!("Listening for put lines on {}", socket.local_addr()?);
        Ok(PutListener {
            cancel_token,
            queue,
            socket,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives datagrams until cancelled.
    pub async fn spin(self) {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let received = tokio::select! {
                () = self.cancel_token.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((amt, src)) => self.consume(&buf[..amt], src),
                Err(e) => error!("Failed to receive put lines: {e}"),
            }
        }
        debug!("Put line listener stopped");
    }

    fn consume(&self, buf: &[u8], src: SocketAddr) {
        let msgs = String::from_utf8_lossy(buf);
        trace!("Received message: {} from {}", msgs, src);
        let inserted = insert_lines(&self.queue, &msgs);
        if inserted > 0 {
            debug!("Queued {inserted} points from {src}");
        }
    }
}

/// Parses every non-empty line of `msgs` and queues the valid ones. Returns how many were queued.
pub fn insert_lines(queue: &DeliveryQueue, msgs: &str) -> usize {
    let mut inserted = 0;
    for line in msgs.lines().map(str::trim).filter(|line| !line.is_empty()) {
        match parse_put_line(line) {
            Ok(put) => {
                queue.add(put.metric, put.value, put.tags);
                inserted += 1;
            }
            Err(e @ ParseError::NotPut(_)) => debug!("Ignoring line: {e}"),
            Err(e) => error!("Failed to parse put line {line:?}: {e}"),
        }
    }
    inserted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery_queue::QueueConfig;
    use crate::transport::{BoundedTransport, TransportOptions};
    use reqwest::Url;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn queue() -> Arc<DeliveryQueue> {
        let config = QueueConfig::new(Url::parse("http://127.0.0.1:1/api/put").expect("url"));
        let transport = Arc::new(BoundedTransport::new(TransportOptions::default()));
        Arc::new(DeliveryQueue::new(config, transport))
    }

    #[test]
    fn test_insert_lines_skips_bad_lines() {
        let queue = queue();
        let inserted = insert_lines(
            &queue,
            "put sys.cpu 1356998400 1.5 host=a\n\nversion\nput sys.mem 1356998400 x\r\nput sys.io 1 2\n",
        );
        assert_eq!(inserted, 2);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_udp_lines_reach_the_queue() {
        let queue = queue();
        let cancel_token = CancellationToken::new();
        let listener = PutListener::new(
            &ListenerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            Arc::clone(&queue),
            cancel_token.clone(),
        )
        .await
        .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(listener.spin());

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
        client
            .send_to(b"put os.cpu 1356998400 42 host=web01\n", addr)
            .await
            .expect("send");

        let arrived = async {
            while queue.is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(Duration::from_secs(1), arrived)
            .await
            .expect("timed out waiting for the point");

        cancel_token.cancel();
        server.await.expect("listener panicked");
        assert_eq!(queue.len(), 1);
    }
}
