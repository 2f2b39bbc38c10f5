//! Locator resolution for the local backend: plain files or HTTP range streams, plus the
//! existence probe used to refine error notices.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use symphonia::core::io::MediaSource;
use symphonia::core::probe::Hint;

use crate::codec::ResourceProbe;
use crate::error::LoadError;

#[derive(Clone, Debug)]
pub struct HttpRangeConfig {
    pub block_size: usize,
    pub timeout: Duration,
}

impl Default for HttpRangeConfig {
    fn default() -> Self {
        Self {
            block_size: 512 * 1024,
            timeout: Duration::from_secs(10),
        }
    }
}

fn is_http(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

/// Split a locator into its path part and its `transcode=` hint, if any.
pub fn split_locator(locator: &str) -> (&str, Option<&str>) {
    let (path, query) = match locator.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (locator, None),
    };
    let transcode = query.and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "transcode")
            .map(|(_, value)| value)
    });
    (path, transcode)
}

/// Extension the demuxer should expect. Only remote locators are transcoded, so only
/// they take the `transcode=` target; files go by their own extension.
pub fn hint_extension(locator: &str) -> Option<&str> {
    let (path, transcode) = split_locator(locator);
    let from_path = || Path::new(path).extension().and_then(|e| e.to_str());
    if is_http(locator) {
        transcode.or_else(from_path)
    } else {
        from_path()
    }
}

pub fn hint_for(locator: &str) -> Hint {
    let mut hint = Hint::new();
    if let Some(ext) = hint_extension(locator) {
        hint.with_extension(ext);
    }
    hint
}

/// Open `locator` for decoding. HTTP locators keep their query so the server can
/// transcode; file locators drop it and are decoded as stored.
pub fn open_media_source(
    locator: &str,
    config: &HttpRangeConfig,
    cancel: Arc<AtomicBool>,
) -> Result<Box<dyn MediaSource>, LoadError> {
    if is_http(locator) {
        let mut source = HttpRangeSource::new(locator.to_string(), config.clone(), Some(cancel));
        source.ensure_len()?;
        return Ok(Box::new(source));
    }
    let (path, _) = split_locator(locator);
    let file = File::open(path).map_err(|source| LoadError::Open {
        path: path.to_string(),
        source,
    })?;
    Ok(Box::new(file))
}

/// Buffered HTTP range reader.
pub struct HttpRangeSource {
    url: String,
    config: HttpRangeConfig,
    pos: u64,
    len: Option<u64>,
    buf: Vec<u8>,
    buf_start: u64,
    cancel: Option<Arc<AtomicBool>>,
}

impl HttpRangeSource {
    pub fn new(url: String, config: HttpRangeConfig, cancel: Option<Arc<AtomicBool>>) -> Self {
        Self {
            url,
            config,
            pos: 0,
            len: None,
            buf: Vec::new(),
            buf_start: 0,
            cancel,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.load(Ordering::Relaxed))
    }

    fn ensure_len(&mut self) -> Result<u64, LoadError> {
        if let Some(len) = self.len {
            return Ok(len);
        }
        let (data, len) = self.fetch_range(0, 0)?;
        let len = len.ok_or_else(|| LoadError::Http("content length unavailable".to_string()))?;
        self.buf = data;
        self.buf_start = 0;
        self.len = Some(len);
        Ok(len)
    }

    fn fetch_range(&self, start: u64, end: u64) -> Result<(Vec<u8>, Option<u64>), LoadError> {
        let range = format!("bytes={start}-{end}");
        let response = ureq::get(&self.url)
            .config()
            .timeout_per_call(Some(self.config.timeout))
            .http_status_as_error(false)
            .build()
            .header("Range", &range)
            .call()
            .map_err(|e| LoadError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::Status(status.as_u16()));
        }
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_range = header("Content-Range");
        let content_length = header("Content-Length").and_then(|s| s.parse::<u64>().ok());

        let mut data = Vec::new();
        let (_, body) = response.into_parts();
        body.into_reader()
            .read_to_end(&mut data)
            .map_err(|e| LoadError::Http(e.to_string()))?;

        let len = match status {
            ureq::http::StatusCode::PARTIAL_CONTENT => content_range
                .as_deref()
                .and_then(content_range_total)
                .or(content_length),
            _ => content_length,
        };
        Ok((data, len))
    }

    fn refill(&mut self) -> io::Result<()> {
        let start = self.pos;
        let mut end = start.saturating_add(self.config.block_size as u64).saturating_sub(1);
        if let Some(len) = self.len.filter(|len| *len > 0) {
            end = end.min(len - 1);
        }
        let (data, len) = self
            .fetch_range(start, end)
            .map_err(|e| io::Error::other(e.to_string()))?;
        if len.is_some() {
            self.len = len;
        }
        self.buf = data;
        self.buf_start = start;
        Ok(())
    }
}

impl Read for HttpRangeSource {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() || self.is_cancelled() {
            return Ok(0);
        }
        if self.len.is_some_and(|len| self.pos >= len) {
            return Ok(0);
        }
        let buffered_end = self.buf_start.saturating_add(self.buf.len() as u64);
        if self.buf.is_empty() || self.pos < self.buf_start || self.pos >= buffered_end {
            self.refill()?;
        }
        let offset = self.pos.saturating_sub(self.buf_start) as usize;
        if offset >= self.buf.len() {
            return Ok(0);
        }
        let count = (self.buf.len() - offset).min(out.len());
        out[..count].copy_from_slice(&self.buf[offset..offset + count]);
        self.pos += count as u64;
        Ok(count)
    }
}

impl Seek for HttpRangeSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(x) => x,
            SeekFrom::Current(delta) => offset_by(self.pos, delta),
            SeekFrom::End(delta) => {
                let len = self.ensure_len().map_err(|e| io::Error::other(e.to_string()))?;
                offset_by(len, delta)
            }
        };
        Ok(self.pos)
    }
}

impl MediaSource for HttpRangeSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        self.len
    }
}

/// Total from a `bytes start-end/total` header.
fn content_range_total(header: &str) -> Option<u64> {
    header.split_once('/')?.1.parse().ok()
}

fn offset_by(base: u64, delta: i64) -> u64 {
    if delta >= 0 {
        base.saturating_add(delta as u64)
    } else {
        base.saturating_sub(delta.unsigned_abs())
    }
}

/// HTTP-like status for `locator`; `None` when the target could not be reached.
pub fn probe_status(locator: &str, timeout: Duration) -> Option<u16> {
    if is_http(locator) {
        let response = ureq::head(locator)
            .config()
            .timeout_per_call(Some(timeout))
            .http_status_as_error(false)
            .build()
            .call();
        return match response {
            Ok(response) => Some(response.status().as_u16()),
            Err(err) => {
                tracing::debug!(error = %err, locator, "existence probe failed");
                None
            }
        };
    }
    let (path, _) = split_locator(locator);
    match std::fs::metadata(path) {
        Ok(_) => Some(200),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Some(404),
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => Some(403),
        Err(_) => Some(500),
    }
}

/// Result of an existence probe, tagged with the engine's token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeReply {
    pub token: u64,
    pub status: Option<u16>,
}

/// [`ResourceProbe`] that runs each probe on its own thread and reports over a channel.
pub struct ThreadedProbe {
    replies: Sender<ProbeReply>,
    timeout: Duration,
}

impl ThreadedProbe {
    pub fn new(replies: Sender<ProbeReply>, timeout: Duration) -> Self {
        Self { replies, timeout }
    }
}

impl ResourceProbe for ThreadedProbe {
    fn probe(&mut self, locator: &str, token: u64) {
        let locator = locator.to_string();
        let replies = self.replies.clone();
        let timeout = self.timeout;
        thread::spawn(move || {
            let status = probe_status(&locator, timeout);
            tracing::debug!(token, ?status, "existence probe finished");
            let _ = replies.send(ProbeReply { token, status });
        });
    }
}
