use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytebuffer::ByteBuffer;
use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, timeout};
use tokio::{spawn, task};
use tracing::{debug, info, warn};

use crate::config::VideoConfig;
use crate::errors::{Result, TelloError};
use crate::transport::DatagramSource;

pub const VIDEO_WIDTH: u32 = 960;
pub const VIDEO_HEIGHT: u32 = 720;

/// Size of every fragment of a frame except the last.
pub const MAX_CHUNK_SIZE: usize = 1460;

const RECV_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// How far above `stable_after_frames` the stability score may climb.
const STABLE_SCORE_HEADROOM: u32 = 10;

/// One complete H.264-encoded 720p frame from the drone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoStreamState {
    /// No stream requested.
    Disconnected,
    /// Requested, waiting for enough clean frames.
    Initializing,
    Streaming,
    /// Packets stopped arriving after the stream was up.
    Error,
}

fn starts_with_start_code(chunk: &[u8]) -> bool {
    chunk.starts_with(&[0, 0, 0, 1]) || chunk.starts_with(&[0, 0, 1])
}

/// Rebuilds frames from the drone's fragments.
///
/// The drone splits each frame into `MAX_CHUNK_SIZE` datagrams; a shorter
/// datagram marks the end of the frame.
#[derive(Debug)]
pub struct FrameAssembler {
    buf: ByteBuffer,
    /// Dropping fragments until the next end-of-frame.
    skipping: bool,
    max_frame_bytes: usize,
}

impl FrameAssembler {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { buf: ByteBuffer::new(), skipping: false, max_frame_bytes }
    }

    /// Feeds one datagram. Returns a frame when `chunk` completes one, or a
    /// decode error when a fragment had to be thrown away.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<VideoFrame>> {
        if chunk.is_empty() {
            return Ok(None);
        }
        let last = chunk.len() < MAX_CHUNK_SIZE;

        if chunk.len() > MAX_CHUNK_SIZE {
            self.reset(!last);
            return Err(decode_error(format!("fragment of {} bytes is too large", chunk.len())));
        }

        if self.skipping {
            if last {
                self.skipping = false;
            }
            return Ok(None);
        }

        let frame_start = starts_with_start_code(chunk);

        if self.buf.len() == 0 && !frame_start {
            self.reset(!last);
            return Err(decode_error("fragment without a frame start".to_string()));
        }

        if self.buf.len() > 0 && frame_start {
            // the end of the previous frame was lost; a full-size start
            // carries on as the next frame
            let size = self.buf.len();
            self.reset(false);
            if !last {
                self.buf.write_bytes(chunk);
            }
            return Err(decode_error(format!("new frame started inside a {size} byte partial frame")));
        }

        self.buf.write_bytes(chunk);

        if self.buf.len() > self.max_frame_bytes {
            let size = self.buf.len();
            self.reset(!last);
            return Err(decode_error(format!("frame exceeds {} bytes ({size})", self.max_frame_bytes)));
        }

        if !last {
            return Ok(None);
        }

        let buf = std::mem::replace(&mut self.buf, ByteBuffer::new());
        Ok(Some(VideoFrame { data: Bytes::from(buf.into_vec()) }))
    }

    /// Throws away the partial frame.
    pub fn reset(&mut self, skip_rest: bool) {
        self.buf = ByteBuffer::new();
        self.skipping = skip_rest;
    }
}

fn decode_error(msg: String) -> TelloError {
    TelloError::Decode { msg }
}

/// Frame and fragment counters for the video channel.
#[derive(Debug, Default)]
pub struct VideoStats {
    frames: AtomicU64,
    discarded: AtomicU64,
}

impl VideoStats {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Fragments or partial frames thrown away by the assembler.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// Completed frames, oldest first. Frames the subscriber was too slow for
/// are skipped.
#[derive(Debug)]
pub struct FrameStream {
    rx: broadcast::Receiver<VideoFrame>,
}

impl FrameStream {
    /// The next frame, or `None` once the video loop has stopped.
    pub async fn next(&mut self) -> Option<VideoFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("[Video] subscriber lagging, skipped {n} frame(s)");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct VideoMonitor<S> {
    source: S,
    assembler: FrameAssembler,
    stable_after_frames: u32,
    stall_timeout: Duration,
    state: Arc<watch::Sender<VideoStreamState>>,
    frames: broadcast::Sender<VideoFrame>,
    stats: Arc<VideoStats>,
}

impl<S: DatagramSource> VideoMonitor<S> {
    async fn run(mut self) {
        // good frames add one, discards take two; once streaming the score
        // is capped so a long clean run cannot hide a burst of losses
        let mut score: u32 = 0;

        loop {
            let streaming = *self.state.borrow() == VideoStreamState::Streaming;

            let received = if streaming {
                match timeout(self.stall_timeout, self.source.recv()).await {
                    Ok(r) => r,
                    Err(_) => {
                        warn!("[Video] no packets for {:?}, stream stalled", self.stall_timeout);
                        self.transition(VideoStreamState::Streaming, VideoStreamState::Error);
                        self.assembler.reset(false);
                        score = 0;
                        continue;
                    }
                }
            } else {
                self.source.recv().await
            };

            let chunk = match received {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("[Video] receive failed ({e})");
                    sleep(RECV_ERROR_PAUSE).await;
                    continue;
                }
            };

            if *self.state.borrow() == VideoStreamState::Disconnected {
                // not asked for; drop whatever is in flight
                self.assembler.reset(false);
                score = 0;
                continue;
            }

            self.transition(VideoStreamState::Error, VideoStreamState::Initializing);

            match self.assembler.push(&chunk) {
                Ok(Some(frame)) => {
                    self.stats.frames.fetch_add(1, Ordering::Relaxed);
                    score += 1;
                    if *self.state.borrow() == VideoStreamState::Streaming {
                        score = score.min(self.stable_after_frames + STABLE_SCORE_HEADROOM);
                    } else if score >= self.stable_after_frames {
                        info!("[Video] stream stable after {score} frames");
                        self.transition(VideoStreamState::Initializing, VideoStreamState::Streaming);
                    }
                    // no subscribers is fine
                    let _ = self.frames.send(frame);
                }
                Ok(None) => {}
                Err(e) => {
                    self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                    debug!("[Video] {e}");
                    score = score.saturating_sub(2);
                    if score < self.stable_after_frames && *self.state.borrow() == VideoStreamState::Streaming {
                        warn!("[Video] stream destabilised, too many broken frames");
                        self.transition(VideoStreamState::Streaming, VideoStreamState::Error);
                    }
                }
            }
        }
    }

    fn transition(&self, from: VideoStreamState, to: VideoStreamState) {
        self.state.send_if_modified(|s| {
            if *s != from {
                return false;
            }
            debug!("[Video] {from:?} -> {to:?}");
            *s = to;
            true
        });
    }
}

#[derive(Debug)]
pub(crate) struct VideoListener {
    task: task::JoinHandle<()>,
    state: Arc<watch::Sender<VideoStreamState>>,
    frames: broadcast::Sender<VideoFrame>,
    stats: Arc<VideoStats>,
    subscribed: AtomicBool,
}

impl VideoListener {
    pub(crate) fn start_listening<S: DatagramSource>(source: S, config: &VideoConfig) -> Self {
        info!("[Video] START LISTENING");

        let (state, _) = watch::channel(VideoStreamState::Disconnected);
        let state = Arc::new(state);
        let (frames, _) = broadcast::channel(config.frame_buffer.max(1));
        let stats = Arc::new(VideoStats::default());

        let monitor = VideoMonitor {
            source,
            assembler: FrameAssembler::new(config.max_frame_bytes),
            stable_after_frames: config.stable_after_frames.max(1),
            stall_timeout: config.stall_timeout,
            state: state.clone(),
            frames: frames.clone(),
            stats: stats.clone(),
        };
        let task = spawn(monitor.run());

        Self { task, state, frames, stats, subscribed: AtomicBool::new(false) }
    }

    /// Called when `streamon` is about to be sent.
    pub(crate) fn expect_stream(&self) {
        self.state.send_if_modified(|s| {
            if matches!(s, VideoStreamState::Initializing | VideoStreamState::Streaming) {
                return false;
            }
            *s = VideoStreamState::Initializing;
            true
        });
    }

    /// Called once `streamoff` has been sent, or `streamon` failed.
    pub(crate) fn end_stream(&self) {
        self.state.send_replace(VideoStreamState::Disconnected);
    }

    pub(crate) fn state(&self) -> VideoStreamState {
        *self.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<VideoStreamState> {
        self.state.subscribe()
    }

    pub(crate) fn stats(&self) -> Arc<VideoStats> {
        self.stats.clone()
    }

    /// The frame stream. Only one subscriber is handed out.
    pub(crate) fn subscribe(&self) -> Result<FrameStream> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(TelloError::AlreadySubscribed);
        }
        Ok(FrameStream { rx: self.frames.subscribe() })
    }

    /// Stops the loop and waits for the socket to be released. Any frame
    /// stream ends.
    pub(crate) async fn stop_listening(self) {
        info!("[Video] STOP LISTENING");
        self.task.abort();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{datagram_link, DatagramInjector};

    /// A frame of `fragments` full chunks plus a short tail.
    fn frame(fragments: usize, fill: u8) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        for i in 0..fragments {
            let mut chunk = vec![fill; MAX_CHUNK_SIZE];
            if i == 0 {
                chunk[..4].copy_from_slice(&[0, 0, 0, 1]);
            }
            chunks.push(chunk);
        }
        chunks.push(vec![fill; 100]);
        if fragments == 0 {
            chunks[0][..4].copy_from_slice(&[0, 0, 0, 1]);
        }
        chunks
    }

    #[test]
    fn test_assembles_fragments() {
        let mut assembler = FrameAssembler::new(1024 * 1024);
        let chunks = frame(2, 7);

        assert_eq!(assembler.push(&chunks[0]).unwrap(), None);
        assert_eq!(assembler.push(&chunks[1]).unwrap(), None);
        let f = assembler.push(&chunks[2]).unwrap().unwrap();

        assert_eq!(f.data.len(), 2 * MAX_CHUNK_SIZE + 100);
        assert_eq!(&f.data[..4], &[0, 0, 0, 1]);
        assert_eq!(f.data[f.data.len() - 1], 7);
    }

    #[test]
    fn test_orphan_fragment_skips_to_next_frame() {
        let mut assembler = FrameAssembler::new(1024 * 1024);
        let lost_start = frame(2, 1);

        assert!(matches!(assembler.push(&lost_start[1]), Err(TelloError::Decode { .. })));
        assert_eq!(assembler.push(&lost_start[2]).unwrap(), None);

        let next = frame(1, 2);
        assert_eq!(assembler.push(&next[0]).unwrap(), None);
        let f = assembler.push(&next[1]).unwrap().unwrap();
        assert_eq!(f.data.len(), MAX_CHUNK_SIZE + 100);
    }

    #[test]
    fn test_oversized_frame_is_dropped() {
        let mut assembler = FrameAssembler::new(2 * MAX_CHUNK_SIZE);
        let big = frame(3, 3);

        assert_eq!(assembler.push(&big[0]).unwrap(), None);
        assert_eq!(assembler.push(&big[1]).unwrap(), None);
        assert!(assembler.push(&big[2]).is_err());
        assert_eq!(assembler.push(&big[3]).unwrap(), None);

        let small = frame(0, 4);
        assert_eq!(assembler.push(&small[0]).unwrap().unwrap().data.len(), 100);
    }

    #[test]
    fn test_frame_start_mid_frame_begins_a_new_frame() {
        let mut assembler = FrameAssembler::new(1024 * 1024);
        let lost_tail = frame(1, 5);
        let next = frame(1, 6);

        assert_eq!(assembler.push(&lost_tail[0]).unwrap(), None);
        assert!(matches!(assembler.push(&next[0]), Err(TelloError::Decode { .. })));

        let f = assembler.push(&next[1]).unwrap().unwrap();
        assert_eq!(f.data.len(), MAX_CHUNK_SIZE + 100);
        assert!(f.data[4..].iter().all(|b| *b == 6));
    }

    fn listener(stable_after_frames: u32) -> (VideoListener, DatagramInjector) {
        let (source, injector) = datagram_link();
        let config = VideoConfig {
            frame_buffer: 2,
            stable_after_frames,
            stall_timeout: Duration::from_secs(1),
            ..VideoConfig::default()
        };
        (VideoListener::start_listening(source, &config), injector)
    }

    fn send_frame(injector: &DatagramInjector, fill: u8) {
        for chunk in frame(1, fill) {
            injector.send(&chunk);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_stabilises_then_stalls() {
        let (listener, injector) = listener(3);
        let mut state = listener.watch_state();
        listener.expect_stream();
        assert_eq!(listener.state(), VideoStreamState::Initializing);

        for i in 0..3 {
            send_frame(&injector, i);
        }
        state.wait_for(|s| *s == VideoStreamState::Streaming).await.unwrap();
        assert_eq!(listener.stats().frames(), 3);

        state.wait_for(|s| *s == VideoStreamState::Error).await.unwrap();

        send_frame(&injector, 9);
        state.wait_for(|s| *s == VideoStreamState::Initializing).await.unwrap();

        listener.stop_listening().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_frames_destabilise_the_stream() {
        let (listener, injector) = listener(2);
        let mut state = listener.watch_state();
        listener.expect_stream();

        // the score tops out at 12 however long the clean run
        for i in 0..15 {
            send_frame(&injector, i);
        }
        while listener.stats().frames() < 15 {
            sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(listener.state(), VideoStreamState::Streaming);

        for _ in 0..5 {
            injector.send(&[9; 50]);
        }
        while listener.stats().discarded() < 5 {
            sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(listener.state(), VideoStreamState::Streaming);

        injector.send(&[9; 50]);
        state.wait_for(|s| *s == VideoStreamState::Error).await.unwrap();
        assert_eq!(listener.stats().discarded(), 6);

        listener.stop_listening().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_packets_ignored_until_requested() {
        let (listener, injector) = listener(1);
        let mut frames = listener.subscribe().unwrap();

        send_frame(&injector, 1);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(listener.stats().frames(), 0);

        listener.expect_stream();
        send_frame(&injector, 2);
        let f = frames.next().await.unwrap();
        assert_eq!(f.data[f.data.len() - 1], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_subscriber_gets_newest_frames() {
        let (listener, injector) = listener(100);
        let mut frames = listener.subscribe().unwrap();
        assert!(matches!(listener.subscribe(), Err(TelloError::AlreadySubscribed)));

        listener.expect_stream();
        for i in 0..5 {
            send_frame(&injector, i);
        }
        let mut state = listener.watch_state();
        while listener.stats().frames() < 5 {
            sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(*state.borrow_and_update(), VideoStreamState::Initializing);

        // buffer of two: frames 0 to 2 were dropped
        assert_eq!(frames.next().await.unwrap().data[200], 3);
        assert_eq!(frames.next().await.unwrap().data[200], 4);

        listener.stop_listening().await;
        assert_eq!(frames.next().await, None);
    }
}
