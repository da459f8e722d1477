//! Live video feed reader.
//!
//! The backend serves the camera as `multipart/x-mixed-replace` JPEG frames on
//! a separate HTTP resource. This module reads that resource on its own
//! thread, independent of the prediction transport:
//! - multipart responses are split into JPEG frames by SOI/EOI markers
//! - any other response is treated as a single snapshot and re-fetched
//! - on error the reader waits `reconnect_delay` and reconnects
//!
//! Only frame metadata is kept (count, size, optional dimensions). Frame
//! bytes are dropped as soon as they are accounted for.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK_BYTES: usize = 8192;
const CONNECT_GRACE: Duration = Duration::from_secs(5);
const FRAME_GRACE: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct FrameSourceConfig {
    /// Feed URL, e.g. `http://host:8000/video_feed`.
    pub url: String,
    pub reconnect_delay: Duration,
    /// Re-fetch cadence when the feed serves single JPEG snapshots.
    pub snapshot_interval: Duration,
    pub read_timeout: Duration,
}

impl Default for FrameSourceConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000/video_feed".to_string(),
            reconnect_delay: Duration::from_secs(2),
            snapshot_interval: Duration::from_millis(500),
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared counters written by the reader thread.
#[derive(Clone, Debug, Default)]
struct FrameStats {
    connected_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    frames_received: u64,
    last_frame_bytes: usize,
    dimensions: Option<(u32, u32)>,
    reconnects: u64,
    last_error: Option<String>,
}

/// Point-in-time view of the feed, for rendering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameView {
    pub url: String,
    pub frames_received: u64,
    pub last_frame_bytes: usize,
    pub dimensions: Option<(u32, u32)>,
    pub healthy: bool,
    pub last_error: Option<String>,
}

impl FrameView {
    /// View for a client running without a video feed.
    pub fn disabled() -> Self {
        Self {
            url: String::new(),
            frames_received: 0,
            last_frame_bytes: 0,
            dimensions: None,
            healthy: false,
            last_error: None,
        }
    }
}

pub struct FrameSource;

impl FrameSource {
    /// Spawn the reader thread.
    pub fn start(config: FrameSourceConfig) -> Result<FrameSourceHandle> {
        let stats = Arc::new(Mutex::new(FrameStats::default()));
        let (stop_tx, stop_rx) = mpsc::channel();
        let reader = FeedReader {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(config.read_timeout)
                .timeout_read(config.read_timeout)
                .build(),
            config: config.clone(),
            stats: stats.clone(),
            stop_rx,
        };
        let handle = std::thread::Builder::new()
            .name("frame-source".to_string())
            .spawn(move || reader.run())
            .context("spawn frame source thread")?;
        log::info!("frame source reading {}", config.url);
        Ok(FrameSourceHandle {
            url: config.url,
            stats,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

pub struct FrameSourceHandle {
    url: String,
    stats: Arc<Mutex<FrameStats>>,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FrameSourceHandle {
    pub fn view(&self, now: Instant) -> FrameView {
        let stats = lock_stats(&self.stats).clone();
        FrameView {
            url: self.url.clone(),
            frames_received: stats.frames_received,
            last_frame_bytes: stats.last_frame_bytes,
            dimensions: stats.dimensions,
            healthy: is_healthy(&stats, now),
            last_error: stats.last_error,
        }
    }

    pub fn frames_received(&self) -> u64 {
        lock_stats(&self.stats).frames_received
    }

    /// Stop the reader and wait for it. The current blocking read may take up
    /// to the configured read timeout to return.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("frame source thread panicked");
            }
        }
    }
}

impl Drop for FrameSourceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FeedReader {
    agent: ureq::Agent,
    config: FrameSourceConfig,
    stats: Arc<Mutex<FrameStats>>,
    stop_rx: mpsc::Receiver<()>,
}

impl FeedReader {
    fn run(self) {
        loop {
            if self.stopped() {
                return;
            }
            match self.read_feed() {
                Ok(()) => return,
                Err(e) => {
                    log::warn!("frame source {}: {:#}", self.config.url, e);
                    let mut stats = lock_stats(&self.stats);
                    stats.connected_at = None;
                    stats.last_error = Some(format!("{:#}", e));
                    stats.reconnects += 1;
                }
            }
            if self.wait(self.config.reconnect_delay) {
                return;
            }
        }
    }

    /// Returns `Ok(())` only when asked to stop.
    fn read_feed(&self) -> Result<()> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("connect to video feed {}", self.config.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        {
            let mut stats = lock_stats(&self.stats);
            stats.connected_at = Some(Instant::now());
            stats.last_error = None;
        }

        if !content_type.contains("multipart") {
            let mut bytes = Vec::new();
            response
                .into_reader()
                .take(MAX_JPEG_BYTES as u64)
                .read_to_end(&mut bytes)
                .context("read jpeg snapshot")?;
            self.record_frame(&bytes)?;
            loop {
                if self.wait(self.config.snapshot_interval) {
                    return Ok(());
                }
                let bytes = self.fetch_snapshot()?;
                self.record_frame(&bytes)?;
            }
        }

        let mut stream = MjpegStream::new(response.into_reader());
        loop {
            if self.stopped() {
                return Ok(());
            }
            let jpeg = stream.read_next_jpeg()?;
            self.record_frame(&jpeg)?;
        }
    }

    fn fetch_snapshot(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("fetch snapshot from {}", self.config.url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        Ok(bytes)
    }

    fn record_frame(&self, jpeg: &[u8]) -> Result<()> {
        if jpeg.is_empty() {
            return Err(anyhow!("empty jpeg frame"));
        }
        let dimensions = frame_dimensions(jpeg);
        let mut stats = lock_stats(&self.stats);
        stats.frames_received += 1;
        stats.last_frame_at = Some(Instant::now());
        stats.last_frame_bytes = jpeg.len();
        if dimensions.is_some() {
            stats.dimensions = dimensions;
        }
        Ok(())
    }

    fn stopped(&self) -> bool {
        !matches!(self.stop_rx.try_recv(), Err(mpsc::TryRecvError::Empty))
    }

    fn wait(&self, interval: Duration) -> bool {
        !matches!(
            self.stop_rx.recv_timeout(interval),
            Err(RecvTimeoutError::Timeout)
        )
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
    chunk: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
            chunk: vec![0u8; READ_CHUNK_BYTES],
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self
                .reader
                .read(&mut self.chunk)
                .context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&self.chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                // Keep the tail in case it holds the first byte of a marker.
                let keep = 2usize.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer
        .windows(2)
        .position(|pair| pair == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|pair| pair == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(feature = "frame-dimensions")]
fn frame_dimensions(jpeg: &[u8]) -> Option<(u32, u32)> {
    use image::GenericImageView;
    match image::load_from_memory(jpeg) {
        Ok(image) => Some(image.dimensions()),
        Err(e) => {
            log::debug!("skipping undecodable frame: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "frame-dimensions"))]
fn frame_dimensions(_jpeg: &[u8]) -> Option<(u32, u32)> {
    None
}

fn is_healthy(stats: &FrameStats, now: Instant) -> bool {
    let Some(connected_at) = stats.connected_at else {
        return false;
    };
    match stats.last_frame_at {
        Some(last) => now.saturating_duration_since(last) <= FRAME_GRACE,
        None => now.saturating_duration_since(connected_at) <= CONNECT_GRACE,
    }
}

fn lock_stats(stats: &Mutex<FrameStats>) -> std::sync::MutexGuard<'_, FrameStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
