//! The protocol engine.
//!
//! The Tello SDK has no sequence numbers: a reply is matched to a command
//! only by arriving while that command is the one outstanding. The
//! dispatcher therefore owns the command link outright and never has more
//! than one command on the wire. Everything else (queueing, retries,
//! interlocks, connection state) hangs off that single loop.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::codec::{self, DecodedResponse};
use crate::command::{
    Command, CommandRequest, CommandResult, Outcome, Priority, Reply, TelloCommand, NACK_DISCONNECTED,
    NACK_NOT_CONNECTED, NACK_SHUTDOWN, NACK_SUPERSEDED,
};
use crate::config::DispatchConfig;
use crate::connection::{ConnectionState, Phase};
use crate::errors::{Result, TelloError};
use crate::queue::{Entry, PriorityCommandQueue};
use crate::telemetry::{LinkEvent, TelemetryReceiver};
use crate::transport::CommandLink;

type Responder = oneshot::Sender<CommandResult>;

/// Stand-in for "never" when a deadline or backoff is too long to represent.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

fn instant_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or(now + FAR_FUTURE)
}

/// What the dispatcher is doing with the head of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Idle,
    AwaitingAck,
    Retrying,
    Failed,
    Complete,
}

#[derive(Debug)]
enum Control {
    Submit(Entry<Responder>),
    Reconnect(oneshot::Sender<ConnectionState>),
    Shutdown,
}

/// The eventual [`CommandResult`] of an enqueued command.
#[derive(Debug)]
pub struct PendingResult {
    rx: oneshot::Receiver<CommandResult>,
}

impl Future for PendingResult {
    type Output = Result<CommandResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.map_err(|_| TelloError::Shutdown))
    }
}

/// Cloneable front end to a running dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    control: mpsc::UnboundedSender<Control>,
    connection: watch::Receiver<ConnectionState>,
    phase: watch::Receiver<DispatchPhase>,
    sequence: Arc<AtomicU64>,
    config: Arc<DispatchConfig>,
}

impl DispatcherHandle {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queues a command without waiting. Out-of-range arguments are refused
    /// here and never reach the queue.
    pub fn enqueue(&self, request: impl Into<CommandRequest>) -> Result<PendingResult> {
        let command = request.into().into_command(self.next_sequence(), &self.config)?;
        debug!("[Dispatch] ENQUEUE #{} \"{}\" ({:?})", command.sequence, command.text, command.priority);

        let (responder, rx) = oneshot::channel();
        self.control
            .send(Control::Submit(Entry { command, responder }))
            .map_err(|_| TelloError::Shutdown)?;
        Ok(PendingResult { rx })
    }

    /// Queues a command and waits for its result.
    pub async fn submit(&self, request: impl Into<CommandRequest>) -> Result<CommandResult> {
        self.enqueue(request)?.await
    }

    /// Leaves the error phase so that SDK mode can be entered again.
    pub async fn reconnect(&self) -> Result<ConnectionState> {
        let (tx, rx) = oneshot::channel();
        self.control.send(Control::Reconnect(tx)).map_err(|_| TelloError::Shutdown)?;
        rx.await.map_err(|_| TelloError::Shutdown)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn dispatch_phase(&self) -> DispatchPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<DispatchPhase> {
        self.phase.clone()
    }

    /// Asks the loop to stop. Everything still queued resolves NACK("shutdown").
    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }
}

/// Starts the dispatcher loop on `link`.
pub fn spawn<L: CommandLink>(
    link: L,
    config: DispatchConfig,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    telemetry: TelemetryReceiver,
) -> (DispatcherHandle, task::JoinHandle<()>) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (connection_tx, connection_rx) = watch::channel(ConnectionState::default());
    let (phase_tx, phase_rx) = watch::channel(DispatchPhase::Idle);
    let config = Arc::new(config);

    let handle = DispatcherHandle {
        control: control_tx,
        connection: connection_rx,
        phase: phase_rx,
        sequence: Arc::new(AtomicU64::new(0)),
        config: config.clone(),
    };

    info!("[Dispatch] START over {}", link.name());
    let dispatcher = Dispatcher {
        link,
        config,
        queue: PriorityCommandQueue::new(),
        control: control_rx,
        control_open: true,
        link_events: Some(link_events),
        telemetry,
        connection: connection_tx,
        phase: phase_tx,
        progress: None,
    };

    (handle, task::spawn(dispatcher.run()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Why an attempt did not succeed.
#[derive(Debug)]
enum Failure {
    Timeout,
    /// Malformed, or not the kind of reply the command expects.
    Unmatched,
    Nack(String),
}

impl Failure {
    fn into_outcome(self) -> Outcome {
        match self {
            Failure::Timeout | Failure::Unmatched => Outcome::Timeout,
            Failure::Nack(reason) => Outcome::Nack(reason),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Timeout => f.write_str("timed out"),
            Failure::Unmatched => f.write_str("unexpected reply"),
            Failure::Nack(reason) => write!(f, "refused: {reason}"),
        }
    }
}

enum Attempt {
    Acked(Reply),
    Failed(Failure),
    Interrupted(Flow),
}

enum Wake {
    Reply(Result<Vec<u8>>),
    Deadline,
    Interrupted(Flow),
}

/// Bookkeeping for the in-flight command.
#[derive(Debug, Clone, Copy)]
struct Progress {
    first_sent: Instant,
    attempts: u32,
}

struct Dispatcher<L> {
    link: L,
    config: Arc<DispatchConfig>,
    queue: PriorityCommandQueue<Responder>,
    control: mpsc::UnboundedReceiver<Control>,
    control_open: bool,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    telemetry: TelemetryReceiver,
    connection: watch::Sender<ConnectionState>,
    phase: watch::Sender<DispatchPhase>,
    progress: Option<Progress>,
}

async fn recv_event(events: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>) -> Option<LinkEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn respond(responder: Responder, result: CommandResult) {
    if let Err(result) = responder.send(result) {
        debug!("[Dispatch] nobody waiting for \"{}\"", result.command.text);
    }
}

fn unsent(entry: Entry<Responder>, outcome: Outcome) {
    let result = CommandResult { command: entry.command, outcome, latency: Duration::ZERO, attempts: 0 };
    respond(entry.responder, result);
}

impl<L: CommandLink> Dispatcher<L> {
    async fn run(mut self) {
        loop {
            // take in everything already submitted so the head is chosen
            // from the full set
            while let Ok(ctl) = self.control.try_recv() {
                if self.handle_control(ctl) == Flow::Stop {
                    return self.stop();
                }
            }

            if self.queue.is_empty() {
                self.set_phase(DispatchPhase::Idle);
                let flow = tokio::select! {
                    ctl = self.control.recv() => match ctl {
                        Some(ctl) => self.handle_control(ctl),
                        None => Flow::Stop,
                    },
                    ev = recv_event(&mut self.link_events) => {
                        self.handle_link_event(ev);
                        Flow::Continue
                    }
                };
                if flow == Flow::Stop {
                    break;
                }
                continue;
            }

            if self.dispatch_head().await == Flow::Stop {
                break;
            }
        }

        self.stop();
    }

    fn handle_control(&mut self, ctl: Control) -> Flow {
        match ctl {
            Control::Submit(entry) => {
                for old in self.queue.enqueue(entry.command, entry.responder) {
                    info!("[Dispatch] #{} \"{}\" superseded", old.command.sequence, old.command.text);
                    unsent(old, Outcome::Nack(NACK_SUPERSEDED.to_string()));
                }
                Flow::Continue
            }
            Control::Reconnect(reply) => {
                if self.connection.borrow().phase == Phase::Error {
                    info!("[Dispatch] reconnect requested");
                    self.set_connection_phase(Phase::Disconnected);
                }
                let _ = reply.send(*self.connection.borrow());
                Flow::Continue
            }
            Control::Shutdown => Flow::Stop,
        }
    }

    /// Returns true if the link was lost.
    fn handle_link_event(&mut self, ev: Option<LinkEvent>) -> bool {
        match ev {
            Some(LinkEvent::Lost { silence }) => {
                warn!("[Dispatch] link lost after {silence:?} of silence, failing all pending commands");
                self.set_connection_phase(Phase::Error);
                self.fail_all(NACK_DISCONNECTED);
                true
            }
            Some(LinkEvent::Restored) => {
                info!("[Dispatch] status stream is back, waiting for reconnect");
                false
            }
            None => {
                debug!("[Dispatch] telemetry monitor has gone away");
                self.link_events = None;
                false
            }
        }
    }

    async fn dispatch_head(&mut self) -> Flow {
        let Some(entry) = self.queue.start_head() else {
            return Flow::Continue;
        };
        let mut command = entry.command.clone();

        if let Some(outcome) = self.gate(&command) {
            warn!("[Dispatch] REJECT \"{}\" ({outcome:?})", command.text);
            self.finish(command, outcome);
            return Flow::Continue;
        }

        let stale = self.link.discard_stale();
        if stale > 0 {
            debug!("[Dispatch] discarded {stale} stale reply(s)");
        }

        self.before_send(&command.kind);

        let bytes = codec::encode(&command);
        self.progress = Some(Progress { first_sent: Instant::now(), attempts: 0 });

        loop {
            self.set_phase(DispatchPhase::AwaitingAck);
            let attempts = self.progress.as_mut().map_or(1, |p| {
                p.attempts += 1;
                p.attempts
            });
            debug!("[Dispatch] SEND \"{}\" (attempt {attempts})", command.text);

            let attempt = match self.link.send(&bytes).await {
                Err(e) => Attempt::Failed(Failure::Nack(format!("send failed: {e}"))),
                Ok(()) if !command.kind.expects_reply() => Attempt::Acked(Reply::Unacknowledged),
                Ok(()) => {
                    let deadline = instant_after(command.deadline);
                    match self.wait(deadline, true).await {
                        Wake::Reply(Ok(bytes)) => self.match_reply(&command, &bytes),
                        Wake::Reply(Err(e)) => Attempt::Failed(Failure::Nack(format!("receive failed: {e}"))),
                        Wake::Deadline => Attempt::Failed(Failure::Timeout),
                        Wake::Interrupted(flow) => Attempt::Interrupted(flow),
                    }
                }
            };

            match attempt {
                Attempt::Interrupted(flow) => return flow,
                Attempt::Acked(reply) => {
                    self.set_phase(DispatchPhase::Complete);
                    debug!("[Dispatch] COMPLETE \"{}\" {reply:?}", command.text);
                    self.after_ack(&command.kind);
                    self.finish(command, Outcome::Ack(reply));
                    return Flow::Continue;
                }
                Attempt::Failed(failure) if command.retries_remaining == 0 => {
                    self.set_phase(DispatchPhase::Failed);
                    warn!("[Dispatch] FAILED \"{}\" after {attempts} attempt(s): {failure}", command.text);
                    self.after_failure(&command.kind);
                    self.finish(command, failure.into_outcome());
                    return Flow::Continue;
                }
                Attempt::Failed(failure) => {
                    self.set_phase(DispatchPhase::Retrying);
                    command.retries_remaining -= 1;
                    let delay = self.config.backoff.delay(attempts);
                    warn!(
                        "[Dispatch] \"{}\" {failure}, retrying in {delay:?} ({} left)",
                        command.text, command.retries_remaining
                    );
                    if let Wake::Interrupted(flow) = self.wait(instant_after(delay), false).await {
                        return flow;
                    }
                }
            }
        }
    }

    /// Sleeps until `until`, or until a reply arrives when `listen` is set,
    /// while still taking submissions and link events.
    async fn wait(&mut self, until: Instant, listen: bool) -> Wake {
        loop {
            tokio::select! {
                _ = sleep_until(until) => return Wake::Deadline,
                reply = self.link.recv(), if listen => return Wake::Reply(reply),
                ctl = self.control.recv(), if self.control_open => match ctl {
                    Some(ctl) => {
                        if self.handle_control(ctl) == Flow::Stop {
                            return Wake::Interrupted(Flow::Stop);
                        }
                    }
                    None => self.control_open = false,
                },
                ev = recv_event(&mut self.link_events) => {
                    if self.handle_link_event(ev) {
                        return Wake::Interrupted(Flow::Continue);
                    }
                }
            }
        }
    }

    fn match_reply(&mut self, command: &Command, bytes: &[u8]) -> Attempt {
        let decoded = codec::decode(bytes);
        debug!("[Dispatch] RECEIVED {decoded:?} for \"{}\"", command.text);

        if decoded != DecodedResponse::Malformed {
            self.connection.send_modify(|s| s.last_seen = Some(Instant::now()));
        }

        match decoded {
            DecodedResponse::Ack if !command.kind.is_query() => Attempt::Acked(Reply::Ok),
            DecodedResponse::Value(m) if command.kind.is_query() => Attempt::Acked(Reply::Value(m)),
            DecodedResponse::Nack(reason) => Attempt::Failed(Failure::Nack(reason)),
            other => {
                warn!("[Dispatch] unexpected reply {other:?} to \"{}\"", command.text);
                Attempt::Failed(Failure::Unmatched)
            }
        }
    }

    /// Local checks made before a command is first sent.
    fn gate(&self, command: &Command) -> Option<Outcome> {
        let state = *self.connection.borrow();

        match state.phase {
            Phase::Error => return Some(Outcome::Nack(NACK_DISCONNECTED.to_string())),
            Phase::Disconnected | Phase::Connecting if command.kind != TelloCommand::EnterSdkMode => {
                return Some(Outcome::Nack(NACK_NOT_CONNECTED.to_string()));
            }
            _ => {}
        }

        if command.kind == TelloCommand::TakeOff && state.phase == Phase::Flying {
            return Some(Outcome::Rejected("already flying".to_string()));
        }

        if command.priority != Priority::Normal {
            return None;
        }

        if command.kind.is_motion() && state.phase != Phase::Flying {
            return Some(Outcome::Rejected(format!("\"{}\" needs the drone to be flying", command.text)));
        }

        if command.kind.is_flight() {
            let threshold = self.config.battery_threshold_pct;
            if let Some(t) = self.telemetry.borrow().as_ref() {
                if t.battery_pct < threshold {
                    return Some(Outcome::Rejected(format!(
                        "battery at {}% is below the {threshold}% safety threshold",
                        t.battery_pct
                    )));
                }
            }
        }

        None
    }

    fn before_send(&mut self, kind: &TelloCommand) {
        let phase = self.connection.borrow().phase;
        match kind {
            TelloCommand::EnterSdkMode if phase == Phase::Disconnected => {
                self.set_connection_phase(Phase::Connecting)
            }
            TelloCommand::Land if phase == Phase::Flying => self.set_connection_phase(Phase::Landing),
            _ => {}
        }
    }

    fn after_ack(&mut self, kind: &TelloCommand) {
        let phase = self.connection.borrow().phase;
        match kind {
            TelloCommand::EnterSdkMode if phase == Phase::Connecting => {
                self.set_connection_phase(Phase::Connected)
            }
            TelloCommand::TakeOff => self.set_connection_phase(Phase::Flying),
            TelloCommand::Land | TelloCommand::EmergencyStop => self.set_connection_phase(Phase::Connected),
            _ => {}
        }
    }

    /// A failed takeoff or landing may still have happened; telemetry has
    /// the final say on which side of the ground the drone is.
    fn after_failure(&mut self, kind: &TelloCommand) {
        let phase = self.connection.borrow().phase;
        let height = self.telemetry.borrow().as_ref().map(|t| t.height_cm);
        let airborne = height.map(|h| h > self.config.flying_height_cm);

        match (kind, height) {
            (TelloCommand::EnterSdkMode, _) => self.set_connection_phase(Phase::Error),
            (TelloCommand::TakeOff, Some(h)) if airborne == Some(true) => {
                warn!("[Dispatch] takeoff was not acknowledged but the drone is at {h} cm");
                self.set_connection_phase(Phase::Flying);
            }
            (TelloCommand::Land, _) if airborne == Some(false) => {
                warn!("[Dispatch] landing was not acknowledged but the drone is on the ground");
                self.set_connection_phase(Phase::Connected);
            }
            (TelloCommand::Land, _) if phase == Phase::Landing => self.set_connection_phase(Phase::Flying),
            _ => {}
        }
    }

    /// Resolves the head of the queue.
    fn finish(&mut self, command: Command, outcome: Outcome) {
        let progress = self.progress.take();
        let Some(entry) = self.queue.pop_on_ack() else {
            return;
        };
        let (latency, attempts) = progress.map_or((Duration::ZERO, 0), |p| (p.first_sent.elapsed(), p.attempts));
        respond(entry.responder, CommandResult { command, outcome, latency, attempts });
    }

    /// Resolves everything queued, in-flight command included, with NACK(`reason`).
    fn fail_all(&mut self, reason: &str) {
        let progress = if self.queue.in_flight().is_some() { self.progress.take() } else { None };
        let mut progress = progress.into_iter();

        for entry in self.queue.drain() {
            let (latency, attempts) = progress
                .next()
                .map_or((Duration::ZERO, 0), |p| (p.first_sent.elapsed(), p.attempts));
            let result = CommandResult {
                command: entry.command,
                outcome: Outcome::Nack(reason.to_string()),
                latency,
                attempts,
            };
            respond(entry.responder, result);
        }
    }

    fn stop(&mut self) {
        self.fail_all(NACK_SHUTDOWN);
        self.control.close();
        while let Ok(ctl) = self.control.try_recv() {
            if let Control::Submit(entry) = ctl {
                unsent(entry, Outcome::Nack(NACK_SHUTDOWN.to_string()));
            }
        }
        self.set_phase(DispatchPhase::Idle);
        info!("[Dispatch] STOPPED");
    }

    fn set_phase(&self, phase: DispatchPhase) {
        self.phase.send_if_modified(|p| {
            let changed = *p != phase;
            *p = phase;
            changed
        });
    }

    fn set_connection_phase(&self, phase: Phase) {
        self.connection.send_if_modified(|s| {
            if s.phase == phase {
                return false;
            }
            info!("[Dispatch] {:?} -> {:?}", s.phase, phase);
            s.phase = phase;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_telemetry;
    use crate::command::{Direction, Query};
    use crate::config::Backoff;
    use crate::telemetry::TelemetrySnapshot;
    use crate::transport::memory::{command_link, SimulatedDrone};
    use tokio::time::timeout;

    struct Harness {
        handle: DispatcherHandle,
        drone: SimulatedDrone,
        events: mpsc::UnboundedSender<LinkEvent>,
        telemetry: watch::Sender<Option<TelemetrySnapshot>>,
        task: task::JoinHandle<()>,
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            command_deadline: Duration::from_secs(1),
            motion_deadline: Duration::from_secs(5),
            retries: 2,
            backoff: Backoff::Fixed { delay: Duration::ZERO },
            ..DispatchConfig::default()
        }
    }

    fn harness(config: DispatchConfig) -> Harness {
        let (link, drone) = command_link();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (telemetry, telemetry_rx) = watch::channel(None);
        let (handle, task) = spawn(link, config, events_rx, telemetry_rx);
        Harness { handle, drone, events, telemetry, task }
    }

    async fn connected(config: DispatchConfig) -> Harness {
        let mut h = harness(config);
        let pending = h.handle.enqueue(TelloCommand::EnterSdkMode).unwrap();
        assert_eq!(h.drone.next_command().await.as_deref(), Some("command"));
        h.drone.reply("ok");
        assert!(pending.await.unwrap().is_ack());
        assert_eq!(h.handle.connection_state().phase, Phase::Connected);
        h
    }

    async fn flying(config: DispatchConfig) -> Harness {
        let mut h = connected(config).await;
        let pending = h.handle.enqueue(TelloCommand::TakeOff).unwrap();
        assert_eq!(h.drone.next_command().await.as_deref(), Some("takeoff"));
        h.drone.reply("ok");
        assert!(pending.await.unwrap().is_ack());
        assert_eq!(h.handle.connection_state().phase, Phase::Flying);
        h
    }

    fn snapshot(bat: u8, h: i16) -> Option<TelemetrySnapshot> {
        Some(decode_telemetry(format!("pitch:0;roll:0;yaw:0;h:{h};bat:{bat};").as_bytes()).unwrap())
    }

    fn forward(cm: u16) -> TelloCommand {
        TelloCommand::Move { direction: Direction::Forward, distance_cm: cm }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sets_last_seen() {
        let h = connected(config()).await;
        assert!(h.handle.connection_state().last_seen.is_some());
        assert_eq!(h.handle.dispatch_phase(), DispatchPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_command_in_flight_at_a_time() {
        let mut h = connected(config()).await;

        let queries = [Query::Battery, Query::Speed, Query::FlightTime];
        let pending: Vec<_> = queries
            .iter()
            .map(|q| h.handle.enqueue(TelloCommand::Query(*q)).unwrap())
            .collect();

        for (expected, value) in [("battery?", "87"), ("speed?", "10.0"), ("time?", "0s")] {
            assert_eq!(h.drone.next_command().await.as_deref(), Some(expected));
            assert_eq!(h.handle.dispatch_phase(), DispatchPhase::AwaitingAck);

            // nothing else goes out while this one is unanswered
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert_eq!(h.drone.try_next_command(), None);

            h.drone.reply(value);
        }

        let mut values = Vec::new();
        for p in pending {
            match p.await.unwrap().outcome {
                Outcome::Ack(Reply::Value(m)) => values.push(m.value),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(values, [87.0, 10.0, 0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_overtakes_queued_takeoff() {
        let mut h = connected(config()).await;

        let takeoff = h.handle.enqueue(TelloCommand::TakeOff).unwrap();
        let emergency = h.handle.enqueue(TelloCommand::EmergencyStop).unwrap();

        assert_eq!(h.drone.next_command().await.as_deref(), Some("emergency"));
        h.drone.reply("ok");
        assert_eq!(h.drone.next_command().await.as_deref(), Some("takeoff"));
        h.drone.reply("ok");

        assert!(emergency.await.unwrap().is_ack());
        assert!(takeoff.await.unwrap().is_ack());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_emergency_supersedes_pending_one() {
        let mut h = connected(config()).await;

        let query = h.handle.enqueue(TelloCommand::Query(Query::Battery)).unwrap();
        let first = h.handle.enqueue(TelloCommand::EmergencyStop).unwrap();
        let second = h.handle.enqueue(TelloCommand::EmergencyStop).unwrap();

        let superseded = first.await.unwrap();
        assert_eq!(superseded.outcome, Outcome::Nack(NACK_SUPERSEDED.to_string()));
        assert_eq!(superseded.attempts, 0);

        assert_eq!(h.drone.next_command().await.as_deref(), Some("emergency"));
        h.drone.reply("ok");
        assert_eq!(h.drone.next_command().await.as_deref(), Some("battery?"));
        h.drone.reply("50");

        assert!(second.await.unwrap().is_ack());
        assert!(query.await.unwrap().is_ack());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_drone_fails_after_all_attempts() {
        let mut h = connected(config()).await;
        let deadline = Duration::from_secs(2);

        let started = Instant::now();
        let request = CommandRequest::new(TelloCommand::Query(Query::Battery))
            .with_deadline(deadline)
            .with_retries(3);
        let result = h.handle.submit(request).await.unwrap();

        assert_eq!(result.outcome, Outcome::Timeout);
        assert_eq!(result.attempts, 4);
        assert_eq!(result.command.retries_remaining, 0);
        assert!(started.elapsed() >= deadline * 4);

        let mut sent = Vec::new();
        while let Some(c) = h.drone.try_next_command() {
            sent.push(c);
        }
        assert_eq!(sent, ["battery?"; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_on_second_attempt() {
        let mut h = connected(config()).await;

        let pending = h.handle.enqueue(TelloCommand::StartVideo).unwrap();
        let first = h.drone.next_command().await.unwrap();
        let second = h.drone.next_command().await.unwrap();
        assert_eq!(first, second);
        h.drone.reply("ok");

        let result = pending.await.unwrap();
        assert_eq!(result.outcome, Outcome::Ack(Reply::Ok));
        assert_eq!(result.command.retries_remaining, 1);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_is_retried_then_surfaced() {
        let mut h = connected(config()).await;

        let pending = h.handle.enqueue(TelloCommand::SetSpeed(50)).unwrap();
        for _ in 0..3 {
            assert_eq!(h.drone.next_command().await.as_deref(), Some("speed 50"));
            h.drone.reply("error");
        }

        let result = pending.await.unwrap();
        assert_eq!(result.outcome, Outcome::Nack("error".to_string()));
        assert!(matches!(result.into_result(), Err(TelloError::Protocol { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_reply_fails_attempt_immediately() {
        let mut h = connected(config()).await;

        let started = Instant::now();
        let pending = h.handle.enqueue(CommandRequest::new(TelloCommand::StopVideo).with_retries(0)).unwrap();
        h.drone.next_command().await.unwrap();
        h.drone.reply_bytes(&[0xff, 0x00, 0x13]);

        let result = pending.await.unwrap();
        assert_eq!(result.outcome, Outcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_not_matched_to_next_command() {
        let mut h = connected(config()).await;

        let request = CommandRequest::new(TelloCommand::Query(Query::Battery)).with_retries(0);
        let result = h.handle.submit(request).await.unwrap();
        assert_eq!(result.outcome, Outcome::Timeout);

        // the answer to "battery?" turns up after it was given up on
        h.drone.next_command().await.unwrap();
        h.drone.reply("87");

        let pending = h.handle.enqueue(TelloCommand::Query(Query::Speed)).unwrap();
        assert_eq!(h.drone.next_command().await.as_deref(), Some("speed?"));
        h.drone.reply("10");

        match pending.await.unwrap().outcome {
            Outcome::Ack(Reply::Value(m)) => assert_eq!(m.value, 10.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_refused_on_the_ground() {
        let mut h = connected(config()).await;

        let result = h.handle.submit(forward(50)).await.unwrap();
        assert!(matches!(result.outcome, Outcome::Rejected(_)));
        assert_eq!(result.attempts, 0);
        assert_eq!(h.drone.try_next_command(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_battery_blocks_normal_flight_commands_only() {
        let mut h = flying(config()).await;
        h.telemetry.send_replace(snapshot(4, 120));

        let result = h.handle.submit(forward(50)).await.unwrap();
        assert!(matches!(result.outcome, Outcome::Rejected(ref r) if r.contains("battery")));

        let land = h.handle.enqueue(TelloCommand::Land).unwrap();
        assert_eq!(h.drone.next_command().await.as_deref(), Some("land"));
        assert_eq!(h.handle.connection_state().phase, Phase::Landing);
        h.drone.reply("ok");

        assert!(land.await.unwrap().is_ack());
        assert_eq!(h.handle.connection_state().phase, Phase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_control_needs_no_reply() {
        let mut h = flying(config()).await;

        let rc = TelloCommand::RemoteControl { left_right: 0, forwards_backwards: 30, up_down: 0, yaw: -20 };
        let result = h.handle.submit(rc).await.unwrap();
        assert_eq!(result.outcome, Outcome::Ack(Reply::Unacknowledged));
        assert_eq!(h.drone.next_command().await.as_deref(), Some("rc 0 30 0 -20"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_fails_everything_until_reconnect() {
        let mut h = connected(config()).await;

        let in_flight = h.handle.enqueue(TelloCommand::TakeOff).unwrap();
        let queued = h.handle.enqueue(TelloCommand::Query(Query::Battery)).unwrap();
        assert_eq!(h.drone.next_command().await.as_deref(), Some("takeoff"));

        h.events.send(LinkEvent::Lost { silence: Duration::from_secs(3) }).unwrap();

        for p in [in_flight, queued] {
            let result = p.await.unwrap();
            assert_eq!(result.outcome, Outcome::Nack(NACK_DISCONNECTED.to_string()));
            assert!(matches!(result.into_result(), Err(TelloError::ConnectionLost)));
        }
        assert_eq!(h.handle.connection_state().phase, Phase::Error);

        // refused without touching the wire
        let result = h.handle.submit(TelloCommand::Query(Query::Battery)).await.unwrap();
        assert_eq!(result.outcome, Outcome::Nack(NACK_DISCONNECTED.to_string()));
        assert_eq!(h.drone.try_next_command(), None);

        assert_eq!(h.handle.reconnect().await.unwrap().phase, Phase::Disconnected);
        let pending = h.handle.enqueue(TelloCommand::EnterSdkMode).unwrap();
        assert_eq!(h.drone.next_command().await.as_deref(), Some("command"));
        h.drone.reply("ok");
        assert!(pending.await.unwrap().is_ack());
        assert_eq!(h.handle.connection_state().phase, Phase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_refused_before_connecting() {
        let mut h = harness(config());
        let result = h.handle.submit(TelloCommand::TakeOff).await.unwrap();
        assert!(matches!(result.into_result(), Err(TelloError::NotConnected)));
        assert_eq!(h.drone.try_next_command(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_takeoff_reconciled_from_telemetry() {
        let h = connected(config()).await;
        h.telemetry.send_replace(snapshot(80, 95));

        let result = h.handle.submit(CommandRequest::new(TelloCommand::TakeOff).with_retries(0)).await.unwrap();
        assert_eq!(result.outcome, Outcome::Timeout);
        assert_eq!(h.handle.connection_state().phase, Phase::Flying);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_land_on_the_ground_counts_as_landed() {
        let h = flying(config()).await;
        h.telemetry.send_replace(snapshot(80, 0));

        let result = h.handle.submit(CommandRequest::new(TelloCommand::Land).with_retries(0)).await.unwrap();
        assert_eq!(result.outcome, Outcome::Timeout);
        assert_eq!(h.handle.connection_state().phase, Phase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_land_in_the_air_stays_flying() {
        let h = flying(config()).await;
        h.telemetry.send_replace(snapshot(80, 120));

        let result = h.handle.submit(CommandRequest::new(TelloCommand::Land).with_retries(0)).await.unwrap();
        assert_eq!(result.outcome, Outcome::Timeout);
        assert_eq!(h.handle.connection_state().phase, Phase::Flying);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_takeoff_refused_while_flying() {
        let mut h = flying(config()).await;

        let result = h.handle.submit(TelloCommand::TakeOff).await.unwrap();
        assert_eq!(result.outcome, Outcome::Rejected("already flying".to_string()));
        assert_eq!(result.attempts, 0);
        assert_eq!(h.drone.try_next_command(), None);
        assert_eq!(h.handle.connection_state().phase, Phase::Flying);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_deadline_keeps_the_loop_alive() {
        let mut h = connected(config()).await;

        let pending = h
            .handle
            .enqueue(CommandRequest::new(TelloCommand::Query(Query::Battery)).with_deadline(Duration::MAX))
            .unwrap();
        assert_eq!(h.drone.next_command().await.as_deref(), Some("battery?"));
        h.drone.reply("87");
        assert!(pending.await.unwrap().is_ack());

        let pending = h.handle.enqueue(TelloCommand::Query(Query::Speed)).unwrap();
        assert_eq!(h.drone.next_command().await.as_deref(), Some("speed?"));
        h.drone.reply("10");
        assert!(pending.await.unwrap().is_ack());
        assert!(!h.task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_backoff_waits_until_shutdown() {
        let config = DispatchConfig { backoff: Backoff::Fixed { delay: Duration::MAX }, ..config() };
        let mut h = connected(config).await;

        let pending = h.handle.enqueue(TelloCommand::Query(Query::Battery)).unwrap();
        h.drone.next_command().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.handle.dispatch_phase(), DispatchPhase::Retrying);
        assert!(!h.task.is_finished());

        h.handle.shutdown();
        assert_eq!(pending.await.unwrap().outcome, Outcome::Nack(NACK_SHUTDOWN.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_retry() {
        let config = DispatchConfig { backoff: Backoff::Fixed { delay: Duration::from_secs(30) }, ..config() };
        let mut h = connected(config).await;

        let pending = h.handle.enqueue(TelloCommand::Query(Query::Battery)).unwrap();
        h.drone.next_command().await.unwrap();
        // let the first deadline pass so the loop is in its backoff
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.handle.dispatch_phase(), DispatchPhase::Retrying);

        h.handle.shutdown();
        let result = pending.await.unwrap();
        assert_eq!(result.outcome, Outcome::Nack(NACK_SHUTDOWN.to_string()));
        assert_eq!(result.attempts, 1);

        timeout(Duration::from_secs(1), h.task).await.unwrap().unwrap();
        assert!(matches!(h.handle.enqueue(TelloCommand::Land), Err(TelloError::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_happens_at_enqueue() {
        let h = connected(config()).await;
        let err = h.handle.enqueue(forward(501)).unwrap_err();
        assert!(matches!(err, TelloError::Validation { .. }));
    }
}
