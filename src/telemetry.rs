use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tokio::{spawn, task};
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::TelemetryConfig;
use crate::transport::DatagramSource;

const RECV_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// The live state of the drone, as of its most recent status datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySnapshot {
    pub battery_pct: u8,
    pub height_cm: i16,
    pub attitude: Attitude,
    pub temperature: Temperature,
    /// Motor-on time.
    pub flight_time: Duration,
    /// Distance to the ground from the time-of-flight sensor.
    pub tof_cm: i16,
    pub barometer: f32,
    pub velocity: Vector3<i16>,
    pub acceleration: Vector3<f32>,
    /// When the datagram was received.
    pub timestamp: Instant,
}

/// Degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attitude {
    pub pitch: i16,
    pub roll: i16,
    pub yaw: i16,
}

/// Degrees Celsius.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Temperature {
    pub low: i16,
    pub high: i16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vector3<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}

/// Reported by the telemetry monitor to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Nothing received for `silence`.
    Lost { silence: Duration },
    /// Datagrams are arriving again after a loss.
    Restored,
}

pub type TelemetryReceiver = watch::Receiver<Option<TelemetrySnapshot>>;

/// Datagram counters for the status channel.
#[derive(Debug, Default)]
pub struct TelemetryStats {
    received: AtomicU64,
    malformed: AtomicU64,
}

impl TelemetryStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Datagrams discarded because they did not parse.
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// Owns the status socket and the published snapshot. Never touches the
/// command queue; connection loss is only ever reported.
struct TelemetryMonitor<S> {
    source: S,
    liveness_window: Duration,
    snapshot: watch::Sender<Option<TelemetrySnapshot>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    stats: Arc<TelemetryStats>,
}

impl<S: DatagramSource> TelemetryMonitor<S> {
    async fn run(mut self) {
        // liveness is only judged once the drone has started talking
        let mut heard = false;
        let mut lost = false;

        loop {
            let received = if heard && !lost {
                match timeout(self.liveness_window, self.source.recv()).await {
                    Ok(r) => r,
                    Err(_) => {
                        lost = true;
                        warn!("[State] no status for {:?}, link lost", self.liveness_window);
                        let _ = self.events.send(LinkEvent::Lost { silence: self.liveness_window });
                        continue;
                    }
                }
            } else {
                self.source.recv().await
            };

            let bytes = match received {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("[State] receive failed ({e})");
                    sleep(RECV_ERROR_PAUSE).await;
                    continue;
                }
            };

            heard = true;
            self.stats.received.fetch_add(1, Ordering::Relaxed);
            if lost {
                lost = false;
                info!("[State] status stream restored");
                let _ = self.events.send(LinkEvent::Restored);
            }

            match codec::decode_telemetry(&bytes) {
                Ok(state) => {
                    self.snapshot.send_replace(Some(state));
                }
                Err(e) => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    debug!("[State] discarding malformed status ({e})");
                }
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct TelemetryListener {
    task: task::JoinHandle<()>,
    snapshots: TelemetryReceiver,
    stats: Arc<TelemetryStats>,
}

impl TelemetryListener {
    pub(crate) fn start_listening<S: DatagramSource>(
        source: S,
        config: &TelemetryConfig,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        info!("[State] START LISTENING");

        let (snapshot, snapshots) = watch::channel(None);
        let stats = Arc::new(TelemetryStats::default());

        let monitor = TelemetryMonitor {
            source,
            liveness_window: config.liveness_window,
            snapshot,
            events,
            stats: stats.clone(),
        };
        let task = spawn(monitor.run());

        Self { task, snapshots, stats }
    }

    pub(crate) fn snapshots(&self) -> TelemetryReceiver {
        self.snapshots.clone()
    }

    pub(crate) fn stats(&self) -> Arc<TelemetryStats> {
        self.stats.clone()
    }

    /// Stops the loop and waits for the socket to be released.
    pub(crate) async fn stop_listening(self) {
        info!("[State] STOP LISTENING");
        self.task.abort();
        let _ = self.task.await;
    }
}
