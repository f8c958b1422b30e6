// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request body codec: a JSON array of points, gzip-compressed.

use crate::errors::EncodeError;
use crate::point::Point;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub const CONTENT_TYPE: &str = "application/json";
pub const CONTENT_ENCODING: &str = "gzip";

pub fn encode_batch(points: &[Point]) -> Result<Vec<u8>, EncodeError> {
    let json = serde_json::to_vec(points)?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

pub fn decode_batch(body: &[u8]) -> Result<Vec<Point>, EncodeError> {
    let mut json = Vec::new();
    GzDecoder::new(body).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Tags;

    #[test]
    fn test_round_trip() {
        let points: Vec<Point> = (0..50)
            .map(|i| Point {
                metric: format!("os.net.bytes.{i}"),
                timestamp: 1_700_000_000 + i,
                value: i as f64 * 1.5,
                tags: [("host".to_string(), "web01".to_string())]
                    .into_iter()
                    .collect(),
            })
            .collect();

        let body = encode_batch(&points).expect("encode");
        let decoded = decode_batch(&body).expect("decode");
        assert_eq!(decoded, points);
    }

    #[test]
    fn test_wire_shape() {
        let point = Point {
            metric: "os.cpu".to_string(),
            timestamp: 1_356_998_400,
            value: 42.0,
            tags: Tags::new(),
        };
        let body = encode_batch(&[point]).expect("encode");

        let mut json = String::new();
        GzDecoder::new(body.as_slice())
            .read_to_string(&mut json)
            .expect("gunzip");
        assert_eq!(
            json,
            r#"[{"metric":"os.cpu","timestamp":1356998400,"value":42.0,"tags":{}}]"#
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_batch(b"not gzip"),
            Err(EncodeError::Compress(_))
        ));
    }
}
