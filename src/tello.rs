use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio::{spawn, task};
use tracing::{info, warn};

use crate::codec::Measurement;
use crate::command::{
    CommandRequest, CommandResult, Direction, FlipDirection, Priority, Query, Reply, Rotation, TelloCommand,
};
use crate::config::TelloConfig;
use crate::connection::ConnectionState;
use crate::dispatcher::{self, DispatcherHandle, PendingResult};
use crate::errors::{Result, TelloError};
use crate::telemetry::{TelemetryListener, TelemetryReceiver, TelemetrySnapshot, TelemetryStats};
use crate::transport::{CommandLink, DatagramSource, Links, UdpCommandLink, UdpDatagramSource};
use crate::video::{FrameStream, VideoListener, VideoStats, VideoStreamState};

const MAX_STATUS_DATAGRAM: usize = 1024;
const MAX_VIDEO_DATAGRAM: usize = 2048;

/// How long `cleanup` lets the dispatcher fail its queue before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

// states
#[derive(Debug)]
pub struct Disconnected;

#[derive(Debug)]
pub struct Connected {
    dispatcher: DispatcherHandle,
    dispatch_task: task::JoinHandle<()>,
    telemetry: TelemetryListener,
    video: VideoListener,
    battery_guard: Option<task::JoinHandle<()>>,
}

/// A Tello EDU drone.
///
/// ```no_run
/// # async fn fly() -> tello_control::Result<()> {
/// use tello_control::Tello;
///
/// let drone = Tello::new().connect().await?;
/// drone.take_off().await?;
/// drone.land().await?;
/// drone.cleanup().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Tello<S = Disconnected> {
    config: TelloConfig,
    state: S,
}

impl Default for Tello<Disconnected> {
    fn default() -> Self {
        Self::new()
    }
}

impl Tello<Disconnected> {
    pub fn new() -> Self {
        Self::with_config(TelloConfig::default())
    }

    pub fn with_config(config: TelloConfig) -> Self {
        Self { config, state: Disconnected }
    }

    pub fn config(&self) -> &TelloConfig {
        &self.config
    }

    /// Binds the command, status and video sockets and puts the drone into
    /// SDK mode.
    ///
    /// *nb* Status and video are sent to the UDP broadcast address so they
    /// only arrive in AP mode, ie using the drone's own WiFi network
    pub async fn connect(&self) -> Result<Tello<Connected>> {
        let local_address = self.config.local_address(self.config.command_port);
        let drone_address = self.config.drone_command_address();
        info!("[Tello] CONNECT {local_address} → {drone_address}");

        let command = UdpCommandLink::connect(&local_address, &drone_address).await?;
        let status =
            UdpDatagramSource::bind(&self.config.local_address(self.config.state_port), MAX_STATUS_DATAGRAM).await?;
        let video =
            UdpDatagramSource::bind(&self.config.local_address(self.config.video_port), MAX_VIDEO_DATAGRAM).await?;

        self.connect_over(Links { command, status, video }).await
    }

    /// Like [`connect`](Self::connect), over any transport.
    pub async fn connect_over<C, S, V>(&self, links: Links<C, S, V>) -> Result<Tello<Connected>>
    where
        C: CommandLink,
        S: DatagramSource,
        V: DatagramSource,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let telemetry = TelemetryListener::start_listening(links.status, &self.config.telemetry, events_tx);
        let (dispatcher, dispatch_task) =
            dispatcher::spawn(links.command, self.config.dispatch.clone(), events_rx, telemetry.snapshots());
        let video = VideoListener::start_listening(links.video, &self.config.video);

        let battery_guard = self
            .config
            .telemetry
            .auto_land_battery_pct
            .map(|pct| spawn(guard_battery(dispatcher.clone(), telemetry.snapshots(), pct)));

        let drone = Tello {
            config: self.config.clone(),
            state: Connected { dispatcher, dispatch_task, telemetry, video, battery_guard },
        };

        info!("[Tello] putting drone in command mode...");
        match drone.enter_sdk_mode().await {
            Ok(()) => {
                info!("[Tello] CONNECTED");
                Ok(drone)
            }
            Err(e) => {
                warn!("[Tello] failed to enter command mode ({e})");
                drone.cleanup().await;
                Err(e)
            }
        }
    }
}

impl Tello<Connected> {
    async fn enter_sdk_mode(&self) -> Result<()> {
        self.send(CommandRequest::new(TelloCommand::EnterSdkMode).with_priority(Priority::Safety))
            .await
            .map(|_| ())
    }

    /// Recovers from a lost link by entering SDK mode again.
    pub async fn reconnect(&self) -> Result<()> {
        let state = self.state.dispatcher.reconnect().await?;
        if state.accepts_commands() {
            return Ok(());
        }
        info!("[Tello] RECONNECT");
        self.enter_sdk_mode().await
    }

    /// Submits a command and waits for its terminal outcome.
    pub async fn submit(&self, request: impl Into<CommandRequest>) -> Result<CommandResult> {
        self.state.dispatcher.submit(request).await
    }

    /// Queues a command without waiting.
    pub fn enqueue(&self, request: impl Into<CommandRequest>) -> Result<PendingResult> {
        self.state.dispatcher.enqueue(request)
    }

    async fn send(&self, request: impl Into<CommandRequest>) -> Result<Reply> {
        self.submit(request).await?.into_result()
    }

    async fn send_command(&self, command: TelloCommand) -> Result<()> {
        self.send(command).await.map(|_| ())
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state.dispatcher.connection_state()
    }

    /// The most recent status report, if any has arrived yet.
    pub fn current_telemetry(&self) -> Option<TelemetrySnapshot> {
        self.state.telemetry.snapshots().borrow().clone()
    }

    /// Notified on every status report.
    pub fn watch_telemetry(&self) -> TelemetryReceiver {
        self.state.telemetry.snapshots()
    }

    pub fn telemetry_stats(&self) -> Arc<TelemetryStats> {
        self.state.telemetry.stats()
    }

    pub fn video_state(&self) -> VideoStreamState {
        self.state.video.state()
    }

    pub fn video_stats(&self) -> Arc<VideoStats> {
        self.state.video.stats()
    }

    /// The stream of completed video frames. Can only be taken once.
    pub fn subscribe_frames(&self) -> Result<FrameStream> {
        self.state.video.subscribe()
    }

    pub async fn take_off(&self) -> Result<()> {
        self.send_command(TelloCommand::TakeOff).await
    }

    pub async fn land(&self) -> Result<()> {
        self.send_command(TelloCommand::Land).await
    }

    /// Hovers in place, abandoning any movement in progress.
    pub async fn stop_and_hover(&self) -> Result<()> {
        self.send_command(TelloCommand::StopAndHover).await
    }

    /// Stops the motors immediately. The drone will fall.
    pub async fn emergency_stop(&self) -> Result<()> {
        self.send_command(TelloCommand::EmergencyStop).await
    }

    async fn move_in(&self, direction: Direction, distance_cm: u16) -> Result<()> {
        self.send_command(TelloCommand::Move { direction, distance_cm }).await
    }

    /// Distances are 20 to 500 cm.
    pub async fn move_up(&self, distance_cm: u16) -> Result<()> {
        self.move_in(Direction::Up, distance_cm).await
    }

    pub async fn move_down(&self, distance_cm: u16) -> Result<()> {
        self.move_in(Direction::Down, distance_cm).await
    }

    pub async fn move_left(&self, distance_cm: u16) -> Result<()> {
        self.move_in(Direction::Left, distance_cm).await
    }

    pub async fn move_right(&self, distance_cm: u16) -> Result<()> {
        self.move_in(Direction::Right, distance_cm).await
    }

    pub async fn move_forward(&self, distance_cm: u16) -> Result<()> {
        self.move_in(Direction::Forward, distance_cm).await
    }

    pub async fn move_back(&self, distance_cm: u16) -> Result<()> {
        self.move_in(Direction::Back, distance_cm).await
    }

    pub async fn turn_clockwise(&self, degrees: u16) -> Result<()> {
        self.send_command(TelloCommand::Rotate { rotation: Rotation::Clockwise, degrees }).await
    }

    pub async fn turn_counterclockwise(&self, degrees: u16) -> Result<()> {
        self.send_command(TelloCommand::Rotate { rotation: Rotation::CounterClockwise, degrees }).await
    }

    pub async fn flip_left(&self) -> Result<()> {
        self.send_command(TelloCommand::Flip(FlipDirection::Left)).await
    }

    pub async fn flip_right(&self) -> Result<()> {
        self.send_command(TelloCommand::Flip(FlipDirection::Right)).await
    }

    pub async fn flip_forward(&self) -> Result<()> {
        self.send_command(TelloCommand::Flip(FlipDirection::Forward)).await
    }

    pub async fn flip_back(&self) -> Result<()> {
        self.send_command(TelloCommand::Flip(FlipDirection::Back)).await
    }

    /// Cruise speed in cm/s, 1 to 100.
    pub async fn set_speed(&self, speed: u8) -> Result<()> {
        self.send_command(TelloCommand::SetSpeed(speed)).await
    }

    /// Joystick-style control, each value -100 to 100. Fire and forget.
    pub async fn remote_control(&self, left_right: i8, forwards_backwards: i8, up_down: i8, yaw: i8) -> Result<()> {
        self.send_command(TelloCommand::RemoteControl { left_right, forwards_backwards, up_down, yaw }).await
    }

    /// Starts the video stream and waits until it is delivering clean
    /// frames.
    pub async fn start_video(&self) -> Result<()> {
        let video = &self.state.video;
        let mut state = video.watch_state();
        video.expect_stream();

        if let Err(e) = self.send_command(TelloCommand::StartVideo).await {
            video.end_stream();
            return Err(e);
        }

        let settle = timeout(
            self.config.video.stall_timeout,
            state.wait_for(|s| matches!(s, VideoStreamState::Streaming | VideoStreamState::Error)),
        )
        .await;

        match settle {
            Ok(Ok(s)) if *s == VideoStreamState::Streaming => Ok(()),
            _ => {
                warn!("[Tello] video did not stabilise");
                Err(TelloError::VideoNotStreaming)
            }
        }
    }

    pub async fn stop_video(&self) -> Result<()> {
        self.send_command(TelloCommand::StopVideo).await?;
        self.state.video.end_stream();
        Ok(())
    }

    async fn query(&self, query: Query) -> Result<Measurement> {
        match self.send(TelloCommand::Query(query)).await? {
            Reply::Value(m) => Ok(m),
            other => Err(TelloError::Protocol { reason: format!("expected a value, got {other:?}") }),
        }
    }

    /// Battery charge in percent.
    pub async fn query_battery(&self) -> Result<u8> {
        let m = self.query(Query::Battery).await?;
        Ok(m.value.clamp(0.0, 100.0) as u8)
    }

    /// Cruise speed in cm/s.
    pub async fn query_speed(&self) -> Result<f64> {
        Ok(self.query(Query::Speed).await?.value)
    }

    /// Height in cm.
    pub async fn query_height(&self) -> Result<f64> {
        let m = self.query(Query::Height).await?;
        m.centimetres()
            .ok_or_else(|| TelloError::Decode { msg: format!("unknown height unit \"{}\"", m.unit) })
    }

    /// Stops every loop and releases the sockets. Commands still queued
    /// resolve as shut down.
    pub async fn cleanup(self) {
        info!("[Tello] CLEANUP");
        let Connected { dispatcher, mut dispatch_task, telemetry, video, battery_guard } = self.state;

        if let Some(guard) = battery_guard {
            guard.abort();
            let _ = guard.await;
        }

        dispatcher.shutdown();
        if timeout(SHUTDOWN_GRACE, &mut dispatch_task).await.is_err() {
            warn!("[Tello] dispatcher did not stop in time, aborting");
            dispatch_task.abort();
            let _ = dispatch_task.await;
        }

        telemetry.stop_listening().await;
        video.stop_listening().await;
        info!("[Tello] DISCONNECTED");
    }
}

/// Sends a flying drone a safety landing once the battery gets too low.
async fn guard_battery(dispatcher: DispatcherHandle, mut telemetry: TelemetryReceiver, land_below_pct: u8) {
    let mut landing_requested = false;

    while telemetry.changed().await.is_ok() {
        let battery = telemetry.borrow_and_update().as_ref().map(|t| t.battery_pct);

        if !dispatcher.connection_state().is_flying() {
            landing_requested = false;
            continue;
        }

        match battery {
            Some(pct) if pct < land_below_pct && !landing_requested => {
                warn!("[Tello] battery at {pct}%, landing");
                if dispatcher.enqueue(TelloCommand::Land).is_err() {
                    return;
                }
                landing_requested = true;
            }
            _ => {}
        }
    }
}
