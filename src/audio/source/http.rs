//! Streaming HTTP byte source with Range-based seeking.
//!
//! Reads pull body chunks from the live response; a seek outside the
//! current chunk reopens the request at the target offset.

use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;
use reqwest::{StatusCode, header};
use symphonia::core::io::MediaSource;
use tokio::runtime::Handle;
use tracing::{debug, info};

use super::AudioSource;
use crate::common::errors::NodeError;

/// Map a non-success status onto the error taxonomy.
pub fn status_error(status: StatusCode, url: &str) -> NodeError {
    match status {
        StatusCode::FORBIDDEN => NodeError::Forbidden(url.to_string()),
        StatusCode::TOO_MANY_REQUESTS => NodeError::RateLimited(url.to_string()),
        StatusCode::NOT_FOUND | StatusCode::GONE => NodeError::NotFound(url.to_string()),
        other => NodeError::Transport(format!("stream fetch failed ({}): {}", other, url)),
    }
}

pub struct HttpSource {
    client: reqwest::Client,
    url: String,
    handle: Handle,
    response: Option<reqwest::Response>,
    chunk: Bytes,
    pos: u64,
    len: Option<u64>,
    seekable: bool,
    content_type: Option<String>,
}

impl HttpSource {
    /// Issue the first request. Blocks on `handle`; call from a worker thread.
    pub fn open(client: reqwest::Client, url: &str, handle: Handle) -> Result<Self, NodeError> {
        let response = handle.block_on(fetch(&client, url, 0))?;

        let range_len = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse::<u64>().ok());
        let len = range_len.or_else(|| response.content_length());

        let seekable = response.status() == StatusCode::PARTIAL_CONTENT
            || response
                .headers()
                .get(header::ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        info!("Opened HttpSource: {} (len={:?}, seekable={})", url, len, seekable);

        Ok(Self {
            client,
            url: url.to_string(),
            handle,
            response: Some(response),
            chunk: Bytes::new(),
            pos: 0,
            len,
            seekable: seekable && len.is_some(),
            content_type,
        })
    }

    fn reopen_at(&mut self, offset: u64) -> io::Result<()> {
        debug!("HttpSource: range request {} from byte {}", self.url, offset);
        self.chunk = Bytes::new();
        self.response = None;
        if self.len.is_some_and(|len| offset >= len) {
            return Ok(());
        }
        let response = self
            .handle
            .block_on(fetch(&self.client, &self.url, offset))
            .map_err(io::Error::other)?;
        self.response = Some(response);
        Ok(())
    }
}

async fn fetch(client: &reqwest::Client, url: &str, offset: u64) -> Result<reqwest::Response, NodeError> {
    let response = client
        .get(url)
        .header(header::ACCEPT, "*/*")
        .header(header::ACCEPT_ENCODING, "identity")
        .header(header::RANGE, format!("bytes={}-", offset))
        .send()
        .await
        .map_err(|e| NodeError::Transport(format!("{}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(status_error(response.status(), url));
    }
    Ok(response)
}

impl AudioSource for HttpSource {
    fn content_type(&self) -> Option<String> {
        self.content_type.clone()
    }
}

impl Read for HttpSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.chunk.is_empty() {
            let Some(response) = self.response.as_mut() else {
                return Ok(0);
            };
            match self.handle.block_on(response.chunk()) {
                Ok(Some(bytes)) => self.chunk = bytes,
                Ok(None) => {
                    self.response = None;
                    return Ok(0);
                }
                Err(e) => return Err(io::Error::other(e)),
            }
        }

        let n = buf.len().min(self.chunk.len());
        buf[..n].copy_from_slice(&self.chunk[..n]);
        let _ = self.chunk.split_to(n);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for HttpSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::Current(delta) => self.pos.saturating_add_signed(delta),
            SeekFrom::End(delta) => {
                let len = self.len.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "stream length unknown")
                })?;
                len.saturating_add_signed(delta)
            }
        };

        if target == self.pos {
            return Ok(self.pos);
        }

        // Short forward hop inside the chunk we already hold.
        let forward = target.saturating_sub(self.pos);
        if target > self.pos && forward <= self.chunk.len() as u64 {
            let _ = self.chunk.split_to(forward as usize);
            self.pos = target;
            return Ok(self.pos);
        }

        if !self.seekable {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "origin does not support range requests",
            ));
        }

        self.reopen_at(target)?;
        self.pos = target;
        Ok(self.pos)
    }
}

impl MediaSource for HttpSource {
    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn byte_len(&self) -> Option<u64> {
        self.len
    }
}
