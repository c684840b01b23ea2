// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request body acquisition: content-coding handling and the zstd decoder
//! pool.
//!
//! zstd decompression contexts are expensive enough to be worth reusing, but
//! scaling them with cores behaves badly under container CPU limits, so the
//! pool is a small fixed constant for the process lifetime. Acquisition
//! blocks until a context frees up; release re-initializes the streaming
//! state before the context can be handed out again.
//!
//! gzip and identity bodies are cheap and allocate per request. Bodies are
//! always fully materialized so that decode errors surface before
//! classification starts.

use std::io::{self, Read};
use std::sync::Mutex;

use flate2::read::GzDecoder;
use tokio::sync::Semaphore;
use tracing::warn;
use zstd::stream::raw::{Decoder as ZstdDecoder, InBuffer, Operation, OutBuffer};

/// Number of pooled zstd decoders. Static rather than a config option: a
/// multiple of the CPUs goes south under kubernetes CPU limits.
pub const NUM_ZSTD_DECODERS: usize = 4;

const DECODE_CHUNK_SIZE: usize = 16 * 1024;

/// Fixed-capacity pool of reusable zstd streaming decompression contexts.
pub struct DecoderPool {
    decoders: Mutex<Vec<ZstdDecoder<'static>>>,
    permits: Semaphore,
}

impl DecoderPool {
    /// Builds the pool eagerly; a context construction failure here aborts
    /// router startup.
    pub fn new(size: usize) -> io::Result<Self> {
        let mut decoders = Vec::with_capacity(size);
        for _ in 0..size {
            decoders.push(ZstdDecoder::new()?);
        }
        Ok(DecoderPool {
            decoders: Mutex::new(decoders),
            permits: Semaphore::new(size),
        })
    }

    /// Takes a decoder out of the pool, waiting for one when all are in use.
    pub async fn acquire(&self) -> io::Result<PooledDecoder<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| io::Error::other("decoder pool is closed"))?;
        permit.forget();

        let decoder = self
            .decoders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        match decoder {
            Some(decoder) => Ok(PooledDecoder {
                pool: self,
                decoder: Some(decoder),
            }),
            // a permit guarantees a free slot; this is unreachable unless the
            // pool accounting is broken
            None => Err(io::Error::other("decoder pool accounting error")),
        }
    }

    /// Decoders currently free. Test observability only.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A pooled decoder on loan. Dropping it resets the streaming state and
/// returns the context to the pool.
pub struct PooledDecoder<'a> {
    pool: &'a DecoderPool,
    decoder: Option<ZstdDecoder<'static>>,
}

impl PooledDecoder<'_> {
    /// Streams `input` through the context, erroring on malformed or
    /// truncated frames and on outputs exceeding `limit` bytes.
    pub fn decompress(&mut self, input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(io::Error::other("decoder already released"));
        };

        let mut src = InBuffer::around(input);
        let mut chunk = [0u8; DECODE_CHUNK_SIZE];
        let mut decoded = Vec::new();

        loop {
            let written;
            let hint;
            {
                let mut dst = OutBuffer::around(&mut chunk[..]);
                hint = decoder.run(&mut src, &mut dst)?;
                written = dst.pos();
            }
            decoded.extend_from_slice(&chunk[..written]);
            if decoded.len() > limit {
                return Err(io::Error::other("decompressed body exceeds size limit"));
            }

            let input_done = src.pos == input.len();
            if hint == 0 && input_done {
                return Ok(decoded);
            }
            if input_done && written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated zstd frame",
                ));
            }
        }
    }
}

impl Drop for PooledDecoder<'_> {
    fn drop(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            if let Err(err) = decoder.reinit() {
                warn!(error = %err, "failed to reset pooled zstd decoder");
            }
            self.pool
                .decoders
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(decoder);
            self.pool.permits.add_permits(1);
        }
    }
}

/// Resolves the request body according to its content coding. `gzip` and
/// `zstd` are recognized; anything else (including absence) is identity.
pub async fn decode_body(
    pool: &DecoderPool,
    content_encoding: &str,
    body: &[u8],
    limit: usize,
) -> io::Result<Vec<u8>> {
    match content_encoding {
        "gzip" => {
            let mut decoded = Vec::new();
            GzDecoder::new(body)
                .take(limit as u64 + 1)
                .read_to_end(&mut decoded)?;
            if decoded.len() > limit {
                return Err(io::Error::other("decompressed body exceeds size limit"));
            }
            Ok(decoded)
        }
        "zstd" => {
            let mut decoder = pool.acquire().await?;
            decoder.decompress(body, limit)
        }
        _ => Ok(body.to_vec()),
    }
}
