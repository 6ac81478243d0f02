//! Remote FLAC prefetching over HTTP range requests.
//!
//! A probe of the first bytes yields the total size (from `Content-Range`),
//! the seek table and the header prefix. Any time window can then be fetched
//! as a byte range and turned back into a self-contained FLAC stream by
//! prepending the header.
use crate::flac::{
    parse_metadata, seek_point_at_or_after, seek_point_at_or_before, FlacError, FlacMetadata,
    SeekPoint,
};
use crate::playback::decoder_process::{DecodeInput, DecodeWindow};
use crate::playback::PlaybackError;
use crate::retry::retry_with_backoff;
use async_trait::async_trait;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::{debug, info};

/// Size of the initial metadata probe
pub const PROBE_BYTES: u64 = 64 * 1024;
const FETCH_ATTEMPTS: u32 = 3;

/// Streaming body of a range response
#[async_trait]
pub trait RangeBody: Send {
    /// Next chunk of bytes, or None at the end of the range
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, PlaybackError>;

    async fn read_all(&mut self) -> Result<Vec<u8>, PlaybackError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

pub struct RangeResponse {
    /// Size of the whole resource, from `Content-Range`
    pub total_bytes: u64,
    pub body: Box<dyn RangeBody>,
}

/// Fetches inclusive byte ranges of a remote resource
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Fetch `[start, end]`, or `[start, EOF)` when `end` is None.
    ///
    /// Must fail with `PlaybackError::RangeNotSupported` when the server
    /// does not answer with partial content.
    async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<RangeResponse, PlaybackError>;
}

/// Total size from a `Content-Range: bytes a-b/total` value
pub fn parse_content_range(value: &str) -> Option<u64> {
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}

/// `RangeFetcher` over plain HTTP
#[derive(Clone, Default)]
pub struct HttpRangeFetcher {
    client: reqwest::Client,
}

impl HttpRangeFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

struct HttpBody {
    response: reqwest::Response,
}

#[async_trait]
impl RangeBody for HttpBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, PlaybackError> {
        Ok(self.response.chunk().await?.map(|bytes| bytes.to_vec()))
    }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<RangeResponse, PlaybackError> {
        let range = match end {
            Some(end) => format!("bytes={}-{}", start, end),
            None => format!("bytes={}-", start),
        };
        debug!("GET {} ({})", url, range);
        let response = self.client.get(url).header(RANGE, range).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PlaybackError::http(format!("{} returned {}", url, status)));
        }
        let total_bytes = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        match (status, total_bytes) {
            (StatusCode::PARTIAL_CONTENT, Some(total_bytes)) => Ok(RangeResponse {
                total_bytes,
                body: Box::new(HttpBody { response }),
            }),
            _ => Err(PlaybackError::RangeNotSupported(format!(
                "{} answered {} without a usable Content-Range header",
                url, status
            ))),
        }
    }
}

/// Inclusive byte range for a time window, plus where its audio starts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowRange {
    pub start_byte: u64,
    pub end_byte: u64,
    /// Sample number of the seek point the range starts at
    pub start_sample: u64,
}

/// A remote FLAC whose layout has been resolved
pub struct RemoteFlac {
    url: String,
    fetcher: Arc<dyn RangeFetcher>,
    total_bytes: u64,
    metadata: FlacMetadata,
}

impl RemoteFlac {
    /// Probe the head of the file and resolve its layout.
    ///
    /// Fails if the server ignores range requests, the container is not
    /// FLAC, or there is no seek table.
    pub async fn prefetch(
        url: &str,
        fetcher: Arc<dyn RangeFetcher>,
    ) -> Result<Self, PlaybackError> {
        let mut probe = fetcher.fetch_range(url, 0, Some(PROBE_BYTES - 1)).await?;
        let total_bytes = probe.total_bytes;
        let mut head = probe.body.read_all().await?;

        let metadata = loop {
            match parse_metadata(&head) {
                Ok(metadata) => break metadata,
                Err(FlacError::Truncated { needed }) if (head.len() as u64) < total_bytes => {
                    // Large embedded artwork can push metadata past the probe
                    let end = needed.max(head.len() as u64 * 2).min(total_bytes) - 1;
                    debug!("Metadata exceeds {} bytes, fetching up to {}", head.len(), end);
                    let mut more = fetcher
                        .fetch_range(url, head.len() as u64, Some(end))
                        .await?;
                    let chunk = more.body.read_all().await?;
                    if chunk.is_empty() {
                        return Err(PlaybackError::http(format!(
                            "{} returned no bytes past offset {} while reading metadata",
                            url,
                            head.len()
                        )));
                    }
                    head.extend(chunk);
                }
                Err(e) => return Err(e.into()),
            }
        };
        metadata.require_seek_table()?;

        info!(
            "Remote FLAC {}: {} bytes, {} Hz, {} channels, {:.1}s, {} seek points",
            url,
            total_bytes,
            metadata.sample_rate,
            metadata.channels,
            metadata.duration_secs(),
            metadata.seek_points.len()
        );
        Ok(Self {
            url: url.to_string(),
            fetcher,
            total_bytes,
            metadata,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn metadata(&self) -> &FlacMetadata {
        &self.metadata
    }

    /// Byte range covering `[start_secs, end_secs)` at the source sample rate.
    ///
    /// Starts at the last seek point at or before the start; ends just before
    /// the first seek point at or after the end, or at end of file.
    pub fn byte_range_for(&self, start_secs: f64, end_secs: f64) -> WindowRange {
        let rate = self.metadata.sample_rate as f64;
        let points = &self.metadata.seek_points;
        let last_byte = self.total_bytes.saturating_sub(1);

        let target_start = (start_secs.max(0.0) * rate).floor() as u64;
        let start = seek_point_at_or_before(points, target_start).unwrap_or(SeekPoint {
            sample_number: 0,
            byte_offset: self.metadata.audio_offset,
        });

        let target_end = (end_secs.max(0.0) * rate).ceil() as u64;
        let end_byte = if target_end >= self.metadata.total_samples {
            last_byte
        } else {
            seek_point_at_or_after(points, target_end)
                .filter(|p| p.byte_offset > start.byte_offset)
                .map(|p| p.byte_offset - 1)
                .unwrap_or(last_byte)
        };

        WindowRange {
            start_byte: start.byte_offset,
            end_byte: end_byte.min(last_byte),
            start_sample: start.sample_number,
        }
    }

    /// Fetch a window and package it as decoder input.
    pub async fn fetch_window(&self, window: &DecodeWindow) -> Result<DecodeInput, PlaybackError> {
        let range = self.byte_range_for(window.start_secs, window.end_secs);
        debug!(
            "Window {:.3}s-{:.3}s -> bytes {}-{} (seek point sample {})",
            window.start_secs, window.end_secs, range.start_byte, range.end_byte, range.start_sample
        );
        let response = retry_with_backoff(FETCH_ATTEMPTS, "Range fetch", || {
            self.fetcher
                .fetch_range(&self.url, range.start_byte, Some(range.end_byte))
        })
        .await?;
        Ok(DecodeInput::Pipe {
            header: self.metadata.header_bytes.clone(),
            body: response.body,
            start_secs: range.start_sample as f64 / self.metadata.sample_rate.max(1) as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flac::build_test_header;
    use std::sync::Mutex;

    struct MemoryBody(Option<Vec<u8>>);

    #[async_trait]
    impl RangeBody for MemoryBody {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, PlaybackError> {
            Ok(self.0.take())
        }
    }

    /// Serves byte ranges of an in-memory file
    struct MemoryFetcher {
        data: Vec<u8>,
        requests: Mutex<Vec<(u64, Option<u64>)>>,
    }

    impl MemoryFetcher {
        fn new(data: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                data,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RangeFetcher for MemoryFetcher {
        async fn fetch_range(
            &self,
            _url: &str,
            start: u64,
            end: Option<u64>,
        ) -> Result<RangeResponse, PlaybackError> {
            self.requests.lock().unwrap().push((start, end));
            let len = self.data.len() as u64;
            let end = end.unwrap_or(len - 1).min(len - 1);
            Ok(RangeResponse {
                total_bytes: len,
                body: Box::new(MemoryBody(Some(
                    self.data[start as usize..=end as usize].to_vec(),
                ))),
            })
        }
    }

    struct NoRangeFetcher;

    #[async_trait]
    impl RangeFetcher for NoRangeFetcher {
        async fn fetch_range(
            &self,
            url: &str,
            _start: u64,
            _end: Option<u64>,
        ) -> Result<RangeResponse, PlaybackError> {
            Err(PlaybackError::RangeNotSupported(url.to_string()))
        }
    }

    /// 10 second 44.1kHz file with seek points every 2 seconds up to 8s
    fn remote_file(audio_len: usize) -> Vec<u8> {
        let points: Vec<(u64, u64)> = (0..5).map(|i| (i * 88200, i * 20_000)).collect();
        let mut data = build_test_header(44100, 2, 441_000, &points);
        data.extend(std::iter::repeat_n(0xAAu8, audio_len));
        data
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 0-65535/1234567"), Some(1234567));
        assert_eq!(parse_content_range("bytes */500"), Some(500));
        assert_eq!(parse_content_range("bytes 0-10/*"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
    }

    #[tokio::test]
    async fn test_prefetch_resolves_layout() {
        let data = remote_file(120_000);
        let fetcher = MemoryFetcher::new(data.clone());
        let remote = RemoteFlac::prefetch("http://host/a.flac", fetcher.clone())
            .await
            .unwrap();

        assert_eq!(remote.total_bytes(), data.len() as u64);
        assert_eq!(remote.metadata().sample_rate, 44100);
        assert_eq!(remote.metadata().seek_points.len(), 5);
        assert_eq!(
            fetcher.requests.lock().unwrap()[0],
            (0, Some(PROBE_BYTES - 1))
        );
    }

    #[tokio::test]
    async fn test_prefetch_fetches_more_when_metadata_is_large() {
        // A padding block bigger than the probe
        let mut data = b"fLaC".to_vec();
        let header = build_test_header(44100, 2, 441_000, &[(0, 0)]);
        let big = 100_000usize;
        data.extend_from_slice(&header[4..header.len() - 12]);
        data.extend_from_slice(&[0x01, (big >> 16) as u8, (big >> 8) as u8, big as u8]);
        data.extend(std::iter::repeat_n(0u8, big));
        data.extend_from_slice(&header[header.len() - 12..]);
        data.extend(std::iter::repeat_n(0xAAu8, 10_000));

        let fetcher = MemoryFetcher::new(data);
        let remote = RemoteFlac::prefetch("http://host/a.flac", fetcher.clone())
            .await
            .unwrap();
        assert_eq!(remote.metadata().seek_points.len(), 1);
        assert!(fetcher.requests.lock().unwrap().len() > 1);
    }

    #[tokio::test]
    async fn test_prefetch_requires_seek_table() {
        let mut data = build_test_header(44100, 2, 441_000, &[]);
        data.extend(std::iter::repeat_n(0u8, 1000));
        let result = RemoteFlac::prefetch("http://host/a.flac", MemoryFetcher::new(data)).await;
        assert!(matches!(
            result,
            Err(PlaybackError::Flac(FlacError::MissingSeekTable))
        ));
    }

    #[tokio::test]
    async fn test_prefetch_rejects_non_flac() {
        let result =
            RemoteFlac::prefetch("http://host/a.mp3", MemoryFetcher::new(vec![0x49; 4096])).await;
        assert!(matches!(result, Err(PlaybackError::Flac(FlacError::BadMagic))));
    }

    #[tokio::test]
    async fn test_prefetch_fails_without_range_support() {
        let result = RemoteFlac::prefetch("http://host/a.flac", Arc::new(NoRangeFetcher)).await;
        assert!(matches!(result, Err(PlaybackError::RangeNotSupported(_))));
    }

    #[tokio::test]
    async fn test_byte_range_between_seek_points() {
        let data = remote_file(120_000);
        let remote = RemoteFlac::prefetch("http://host/a.flac", MemoryFetcher::new(data))
            .await
            .unwrap();
        let audio = remote.metadata().audio_offset;

        // 3s falls after the 2s point; 5s ends before the 6s point
        let range = remote.byte_range_for(3.0, 5.0);
        assert_eq!(range.start_sample, 88200);
        assert_eq!(range.start_byte, audio + 20_000);
        assert_eq!(range.end_byte, audio + 60_000 - 1);
    }

    #[tokio::test]
    async fn test_byte_range_to_end_of_file_without_later_seek_point() {
        let data = remote_file(120_000);
        let total = data.len() as u64;
        let remote = RemoteFlac::prefetch("http://host/a.flac", MemoryFetcher::new(data))
            .await
            .unwrap();

        let range = remote.byte_range_for(9.9, 10.0);
        assert_eq!(range.end_byte, total - 1);
        assert_eq!(range.start_sample, 4 * 88200);

        // Window ending past the last seek point but before the end
        let range = remote.byte_range_for(8.5, 9.5);
        assert_eq!(range.end_byte, total - 1);
    }

    #[test]
    fn test_byte_range_uses_seek_point_before_target() {
        let metadata = FlacMetadata {
            sample_rate: 44100,
            channels: 2,
            total_samples: 441_000,
            audio_offset: 100,
            seek_points: [(0, 100), (44100, 5100), (88200, 10100)]
                .iter()
                .map(|&(sample_number, byte_offset)| SeekPoint {
                    sample_number,
                    byte_offset,
                })
                .collect(),
            header_bytes: Vec::new(),
        };
        let remote = RemoteFlac {
            url: "http://host/a.flac".to_string(),
            fetcher: Arc::new(NoRangeFetcher),
            total_bytes: 200_000,
            metadata,
        };

        // Sample 50000 lies between the 44100 and 88200 points
        let range = remote.byte_range_for(50_000.0 / 44_100.0, 1.5);
        assert_eq!(range.start_byte, 5100);
        assert_eq!(range.start_sample, 44100);
        assert_eq!(range.end_byte, 10099);

        let range = remote.byte_range_for(0.5, 3.0);
        assert_eq!(range.start_byte, 100);
        assert_eq!(range.end_byte, 199_999);
    }

    /// Serves the probe, then answers every later range with an empty body
    struct StallingFetcher {
        head: Vec<u8>,
        requests: Mutex<usize>,
    }

    #[async_trait]
    impl RangeFetcher for StallingFetcher {
        async fn fetch_range(
            &self,
            _url: &str,
            start: u64,
            _end: Option<u64>,
        ) -> Result<RangeResponse, PlaybackError> {
            *self.requests.lock().unwrap() += 1;
            let body = if start == 0 {
                self.head.clone()
            } else {
                Vec::new()
            };
            Ok(RangeResponse {
                total_bytes: 200_000,
                body: Box::new(MemoryBody(Some(body))),
            })
        }
    }

    #[tokio::test]
    async fn test_prefetch_fails_when_metadata_fetch_returns_nothing() {
        // STREAMINFO, then a padding block claiming 100 KB
        let header = build_test_header(44100, 2, 441_000, &[]);
        let mut head = header[..header.len() - 12].to_vec();
        let big = 100_000usize;
        head.extend_from_slice(&[0x01, (big >> 16) as u8, (big >> 8) as u8, big as u8]);
        head.resize(PROBE_BYTES as usize, 0);

        let fetcher = Arc::new(StallingFetcher {
            head,
            requests: Mutex::new(0),
        });
        let result = RemoteFlac::prefetch("http://host/a.flac", fetcher.clone()).await;
        assert!(matches!(result, Err(PlaybackError::Http(_))));
        assert_eq!(*fetcher.requests.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fetch_window_prefixes_header() {
        let data = remote_file(120_000);
        let fetcher = MemoryFetcher::new(data.clone());
        let remote = RemoteFlac::prefetch("http://host/a.flac", fetcher.clone())
            .await
            .unwrap();

        let input = remote
            .fetch_window(&DecodeWindow::new(4.0, 6.0))
            .await
            .unwrap();
        match input {
            DecodeInput::Pipe {
                header,
                mut body,
                start_secs,
            } => {
                assert_eq!(header, remote.metadata().header_bytes);
                assert_eq!(&header[0..4], b"fLaC");
                assert_eq!(start_secs, 4.0);
                assert_eq!(body.read_all().await.unwrap().len(), 20_000);
            }
            DecodeInput::File(_) => panic!("expected piped input"),
        }
    }
}
