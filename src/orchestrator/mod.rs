//! Session orchestrator
//!
//! One orchestrator task owns a device's entire tracking run: the
//! detector state, the relay client, the sensor stream, and every timer.
//! All outside input arrives as messages (commands from the UI, events
//! from the relay, samples from the sensor), so the detector is never
//! touched from two places and no locks are needed.
//!
//! While listening to a remote session, local detection is disabled
//! entirely; inbound relay data writes to a separate display view and
//! never feeds the detector.

mod source;

pub use source::{MotionSource, SensorError};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::detector::{BreathDetector, DetectorConfig};
use crate::protocol::{BreathData, ClientEvent, ConnId, ServerEvent, SessionCode, Snapshot};
use crate::relay::{ClientNotice, RelayClient};
use crate::ring::Ring;
use crate::sample::{now_unix_ms, MotionSample, PlotPoint};
use crate::signal::{ConditionerConfig, SignalConditioner};
use crate::storage::{BreathSessionRecord, RecordSample, SessionStore};

/// Orchestrator tuning. Defaults match the cadences the UI is built for.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Opaque owner id stamped on saved records
    pub user_id: String,
    /// Initial detector sensitivity, 1..=5
    pub sensitivity: u8,
    pub detector: DetectorConfig,
    pub conditioner: ConditionerConfig,
    /// BPM recompute cadence
    pub bpm_interval: Duration,
    /// Producer live-broadcast cadence
    pub broadcast_interval: Duration,
    /// Listener inbound-flush cadence
    pub flush_interval: Duration,
    /// Hard stop if no sample ever arrives after start
    pub startup_watchdog: Duration,
    /// Durable relay role memory for reconnects
    pub role_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            user_id: "local".into(),
            sensitivity: 3,
            detector: DetectorConfig::default(),
            conditioner: ConditionerConfig::default(),
            bpm_interval: Duration::from_secs(1),
            broadcast_interval: Duration::from_millis(800),
            flush_interval: Duration::from_millis(200),
            startup_watchdog: Duration::from_secs(2),
            role_path: None,
        }
    }
}

/// Commands from the owning UI.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Pause,
    Resume,
    Reset,
    StopAndSave,
    SetSensitivity(u8),
    CreateSession,
    JoinSession(SessionCode),
    LeaveSession,
    EndSession,
    /// The relay transport dropped and came back; re-establish the
    /// previously held role from durable state.
    RelayReconnected,
    Shutdown,
}

/// Everything a UI needs to render.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayState {
    pub breath_in: u32,
    pub breath_out: u32,
    pub bpm: f64,
    pub points: Vec<PlotPoint>,
    pub tracking: bool,
    pub paused: bool,
}

/// Notifications to the owning UI.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Display(DisplayState),
    SensorFailed { message: String },
    SessionSaved { id: String },
    SaveFailed { message: String },
    SessionCreated { code: SessionCode },
    Joined { code: SessionCode },
    JoinFailed { message: String },
    JoinTimedOut,
    SessionEnded,
    ListenerCount(usize),
    RelayUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Tracking { paused: bool },
}

/// Display view fed by relay data while listening. Counters are
/// latest-value-wins; points accumulate between flush ticks.
struct RemoteView {
    breath_in: u32,
    breath_out: u32,
    bpm: f64,
    points: Ring<PlotPoint>,
    pending_points: Vec<PlotPoint>,
    dirty: bool,
}

impl RemoteView {
    fn new(plot_capacity: usize) -> Self {
        Self {
            breath_in: 0,
            breath_out: 0,
            bpm: 0.0,
            points: Ring::new(plot_capacity),
            pending_points: Vec::new(),
            dirty: false,
        }
    }
}

struct Engine {
    config: OrchestratorConfig,
    detector: BreathDetector,
    relay: RelayClient,
    store: Arc<dyn SessionStore>,
    ui_tx: mpsc::UnboundedSender<UiEvent>,
    phase: Phase,
    started_at_ms: u64,
    saw_sample: bool,
    watchdog: Option<Instant>,
    history: Vec<RecordSample>,
    listeners: usize,
    remote: RemoteView,
    /// A reconnect re-join is in flight; its success is reported quietly
    resuming: bool,
}

impl Engine {
    fn notify(&self, event: UiEvent) {
        // UI gone means shutdown is underway
        let _ = self.ui_tx.send(event);
    }

    fn is_tracking(&self) -> bool {
        matches!(self.phase, Phase::Tracking { .. })
    }

    fn is_active(&self) -> bool {
        self.phase == Phase::Tracking { paused: false }
    }

    fn begin_tracking(&mut self) {
        self.detector.reset();
        self.history.clear();
        self.phase = Phase::Tracking { paused: false };
        self.started_at_ms = now_unix_ms();
        self.saw_sample = false;
        self.watchdog = Some(Instant::now() + self.config.startup_watchdog);
        info!(user = %self.config.user_id, "Tracking started");
        self.notify(UiEvent::Display(self.local_display()));
    }

    fn set_paused(&mut self, paused: bool) {
        if self.is_tracking() {
            self.phase = Phase::Tracking { paused };
            self.notify(UiEvent::Display(self.local_display()));
        }
    }

    fn on_sample(&mut self, sample: &MotionSample) {
        self.watchdog = None;
        self.saw_sample = true;
        if self.is_active() {
            self.detector.process_sample(sample);
        }
    }

    fn on_bpm_tick(&mut self) {
        let now = now_unix_ms();
        self.detector.recompute_bpm(now);
        self.history.push(RecordSample {
            t: now.saturating_sub(self.started_at_ms),
            inhale: Some(self.detector.breath_in()),
            exhale: Some(self.detector.breath_out()),
            rr: Some(self.detector.bpm()),
        });
        self.notify(UiEvent::Display(self.local_display()));
    }

    fn sensor_timed_out(&mut self) {
        self.phase = Phase::Idle;
        warn!("No motion data after start; stopping");
        self.notify(UiEvent::SensorFailed {
            message: SensorError::NoData(self.config.startup_watchdog).to_string(),
        });
    }

    fn sensor_stream_ended(&mut self) {
        if self.is_tracking() {
            self.phase = Phase::Idle;
            self.watchdog = None;
            self.notify(UiEvent::SensorFailed {
                message: "motion sample stream ended".into(),
            });
        }
    }

    async fn stop_and_save(&mut self) {
        if !self.is_tracking() {
            return;
        }
        self.phase = Phase::Idle;
        self.watchdog = None;

        let ended = now_unix_ms();
        let rates: Vec<f64> = self
            .history
            .iter()
            .filter_map(|s| s.rr)
            .filter(|r| *r > 0.0)
            .collect();
        let avg = if rates.is_empty() {
            0.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };
        let record = BreathSessionRecord {
            user_id: self.config.user_id.clone(),
            started_at: self.started_at_ms,
            ended_at: ended,
            duration_seconds: ended.saturating_sub(self.started_at_ms) / 1000,
            avg_respiratory_rate: avg,
            samples: std::mem::take(&mut self.history),
            notes: None,
        };
        match self.store.save(&record).await {
            Ok(id) => self.notify(UiEvent::SessionSaved { id }),
            Err(e) => {
                warn!(error = %e, "Failed to save session record");
                self.notify(UiEvent::SaveFailed {
                    message: e.to_string(),
                });
            }
        }
    }

    fn enter_listening(&mut self, code: SessionCode) {
        self.phase = Phase::Idle;
        self.watchdog = None;
        self.remote = RemoteView::new(self.config.detector.plot_ring_capacity);
        info!(code = %code, "Listening to remote session");
        // A reconnect re-join restores a session the UI already shows
        if self.resuming {
            self.resuming = false;
            debug!(code = %code, "Rejoined after reconnect");
        } else {
            self.notify(UiEvent::Joined { code });
        }
    }

    fn broadcast_live(&mut self) {
        let Some(code) = self.relay.session_code().cloned() else {
            return;
        };
        let data = BreathData {
            code,
            t: Some(now_unix_ms()),
            breath_in: Some(self.detector.breath_in()),
            breath_out: Some(self.detector.breath_out()),
            bpm: Some(self.detector.bpm()),
            point: self.detector.last_plot_point(),
            samples: None,
        };
        if self.relay.send(ClientEvent::BreathData(data)).is_err() {
            debug!("Relay unavailable; skipping live broadcast");
        }
    }

    fn send_snapshot(&mut self, to: ConnId) {
        let snapshot = Snapshot {
            breath_in: self.detector.breath_in(),
            breath_out: self.detector.breath_out(),
            bpm: self.detector.bpm(),
            points: self.detector.plot_points(),
        };
        if self
            .relay
            .send(ClientEvent::SessionSnapshot {
                to: Some(to),
                snapshot,
            })
            .is_err()
        {
            debug!("Relay unavailable; skipping snapshot");
        }
    }

    fn flush_remote(&mut self) {
        if self.remote.pending_points.is_empty() && !self.remote.dirty {
            return;
        }
        let pending = std::mem::take(&mut self.remote.pending_points);
        for p in pending {
            self.remote.points.push(p);
        }
        self.remote.dirty = false;
        self.notify(UiEvent::Display(self.remote_display()));
    }

    fn apply_notice(&mut self, notice: ClientNotice) {
        match notice {
            ClientNotice::SessionCreated { code } => {
                // Always announced, even on a reconnect re-create: the
                // code is freshly drawn and the UI must show the new one.
                self.resuming = false;
                self.listeners = 0;
                info!(code = %code, "Producer session created");
                self.notify(UiEvent::SessionCreated { code });
            }
            // Handled by the run loop so the sensor can be torn down
            ClientNotice::Joined { code } => self.enter_listening(code),
            ClientNotice::JoinFailed { message } => {
                self.resuming = false;
                self.notify(UiEvent::JoinFailed { message });
            }
            ClientNotice::RequestTimedOut => {
                self.resuming = false;
                self.notify(UiEvent::JoinTimedOut);
            }
            ClientNotice::ListenerJoined { listener } => {
                self.listeners += 1;
                debug!(listener = %listener, count = self.listeners, "Listener joined");
                self.notify(UiEvent::ListenerCount(self.listeners));
            }
            ClientNotice::ListenerLeft { listener } => {
                self.listeners = self.listeners.saturating_sub(1);
                debug!(listener = %listener, count = self.listeners, "Listener left");
                self.notify(UiEvent::ListenerCount(self.listeners));
            }
            ClientNotice::SnapshotRequested { to } => self.send_snapshot(to),
            ClientNotice::Data(data) => {
                if let Some(v) = data.breath_in {
                    self.remote.breath_in = v;
                    self.remote.dirty = true;
                }
                if let Some(v) = data.breath_out {
                    self.remote.breath_out = v;
                    self.remote.dirty = true;
                }
                if let Some(v) = data.bpm {
                    self.remote.bpm = v;
                    self.remote.dirty = true;
                }
                if let Some(p) = data.point {
                    self.remote.pending_points.push(p);
                }
                if let Some(samples) = data.samples {
                    for s in samples {
                        if let Some(v) = s.breath_in {
                            self.remote.breath_in = v;
                            self.remote.dirty = true;
                        }
                        if let Some(v) = s.breath_out {
                            self.remote.breath_out = v;
                            self.remote.dirty = true;
                        }
                        if let Some(v) = s.bpm {
                            self.remote.bpm = v;
                            self.remote.dirty = true;
                        }
                        if let Some(p) = s.point {
                            self.remote.pending_points.push(p);
                        }
                    }
                }
            }
            ClientNotice::Snapshot(snapshot) => {
                self.remote.breath_in = snapshot.breath_in;
                self.remote.breath_out = snapshot.breath_out;
                self.remote.bpm = snapshot.bpm;
                self.remote.points.clear();
                self.remote.pending_points.clear();
                for p in snapshot.points {
                    self.remote.points.push(p);
                }
                self.notify(UiEvent::Display(self.remote_display()));
            }
            ClientNotice::SessionEnded { code } => {
                info!(code = %code, "Session ended");
                self.listeners = 0;
                self.notify(UiEvent::SessionEnded);
            }
        }
    }

    fn local_display(&self) -> DisplayState {
        DisplayState {
            breath_in: self.detector.breath_in(),
            breath_out: self.detector.breath_out(),
            bpm: self.detector.bpm(),
            points: self.detector.plot_points(),
            tracking: self.is_tracking(),
            paused: self.phase == Phase::Tracking { paused: true },
        }
    }

    fn remote_display(&self) -> DisplayState {
        DisplayState {
            breath_in: self.remote.breath_in,
            breath_out: self.remote.breath_out,
            bpm: self.remote.bpm,
            points: self.remote.points.iter().copied().collect(),
            tracking: false,
            paused: false,
        }
    }
}

/// The orchestrator task. Construct with [`Orchestrator::new`], then
/// `tokio::spawn(orch.run())` and drive it through the command sender.
pub struct Orchestrator {
    engine: Engine,
    source: Box<dyn MotionSource>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    server_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        source: Box<dyn MotionSource>,
        store: Arc<dyn SessionStore>,
        relay_tx: mpsc::UnboundedSender<ClientEvent>,
        server_rx: mpsc::UnboundedReceiver<ServerEvent>,
        ui_tx: mpsc::UnboundedSender<UiEvent>,
    ) -> (Self, mpsc::UnboundedSender<Command>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let detector = BreathDetector::new(
            config.detector.clone(),
            SignalConditioner::new(config.conditioner.clone(), config.sensitivity),
        );
        let relay = RelayClient::new(relay_tx, config.role_path.clone());
        let plot_capacity = config.detector.plot_ring_capacity;
        let engine = Engine {
            config,
            detector,
            relay,
            store,
            ui_tx,
            phase: Phase::Idle,
            started_at_ms: 0,
            saw_sample: false,
            watchdog: None,
            history: Vec::new(),
            listeners: 0,
            remote: RemoteView::new(plot_capacity),
            resuming: false,
        };
        (
            Self {
                engine,
                source,
                cmd_rx,
                server_rx,
            },
            cmd_tx,
        )
    }

    pub async fn run(self) {
        let Self {
            mut engine,
            mut source,
            mut cmd_rx,
            mut server_rx,
        } = self;

        let mut sample_rx: Option<mpsc::Receiver<MotionSample>> = None;
        let mut bpm_tick = time::interval(engine.config.bpm_interval);
        let mut broadcast_tick = time::interval(engine.config.broadcast_interval);
        let mut flush_tick = time::interval(engine.config.flush_interval);
        bpm_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        broadcast_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let watchdog_at = engine.watchdog.unwrap_or_else(far_future);
            let join_at = engine.relay.request_deadline().unwrap_or_else(far_future);

            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Command::Start => {
                            if engine.is_tracking() {
                                debug!("Already tracking; ignoring start");
                                continue;
                            }
                            match source.acquire().await {
                                Ok(rx) => {
                                    sample_rx = Some(rx);
                                    engine.begin_tracking();
                                }
                                Err(e) => engine.notify(UiEvent::SensorFailed {
                                    message: e.to_string(),
                                }),
                            }
                        }
                        Command::Pause => engine.set_paused(true),
                        Command::Resume => engine.set_paused(false),
                        Command::Reset => {
                            engine.detector.reset();
                            engine.history.clear();
                            engine.notify(UiEvent::Display(engine.local_display()));
                        }
                        Command::StopAndSave => {
                            engine.stop_and_save().await;
                            sample_rx = None;
                            source.release().await;
                        }
                        Command::SetSensitivity(s) => engine.detector.set_sensitivity(s),
                        Command::CreateSession => {
                            if engine.relay.create().is_err() {
                                engine.notify(UiEvent::RelayUnavailable);
                            }
                        }
                        Command::JoinSession(code) => {
                            if engine.relay.join(code).is_err() {
                                engine.notify(UiEvent::RelayUnavailable);
                            }
                        }
                        Command::LeaveSession => {
                            if engine.relay.leave().await.is_err() {
                                engine.notify(UiEvent::RelayUnavailable);
                            }
                        }
                        Command::EndSession => {
                            if engine.relay.end().await.is_err() {
                                engine.notify(UiEvent::RelayUnavailable);
                            }
                        }
                        Command::RelayReconnected => {
                            match engine.relay.resume().await {
                                Ok(started) => engine.resuming = started,
                                Err(_) => engine.notify(UiEvent::RelayUnavailable),
                            }
                        }
                        Command::Shutdown => break,
                    }
                }

                ev = server_rx.recv() => {
                    let Some(ev) = ev else { break };
                    match engine.relay.handle_event(ev).await {
                        // Listening disables local detection; tear the
                        // sensor down before switching views.
                        Some(ClientNotice::Joined { code }) => {
                            sample_rx = None;
                            source.release().await;
                            engine.enter_listening(code);
                        }
                        Some(notice) => engine.apply_notice(notice),
                        None => {}
                    }
                }

                sample = next_sample(&mut sample_rx), if sample_rx.is_some() => {
                    match sample {
                        Some(s) => engine.on_sample(&s),
                        None => {
                            sample_rx = None;
                            source.release().await;
                            engine.sensor_stream_ended();
                        }
                    }
                }

                _ = time::sleep_until(watchdog_at), if engine.watchdog.is_some() => {
                    engine.watchdog = None;
                    if !engine.saw_sample {
                        sample_rx = None;
                        source.release().await;
                        engine.sensor_timed_out();
                    }
                }

                _ = time::sleep_until(join_at), if engine.relay.request_deadline().is_some() => {
                    if let Some(notice) = engine.relay.check_request_timeout(Instant::now()) {
                        engine.apply_notice(notice);
                    }
                }

                _ = bpm_tick.tick(), if engine.is_active() => engine.on_bpm_tick(),

                _ = broadcast_tick.tick(),
                    if engine.is_tracking() && engine.relay.is_producing() =>
                {
                    engine.broadcast_live();
                }

                _ = flush_tick.tick(), if engine.relay.is_listening() => engine.flush_remote(),
            }
        }

        source.release().await;
        debug!("Orchestrator stopped");
    }
}

async fn next_sample(rx: &mut Option<mpsc::Receiver<MotionSample>>) -> Option<MotionSample> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;

    /// Delivers a pre-baked sample set, then stays open and silent.
    struct ScriptedSource {
        samples: Vec<MotionSample>,
        hold: Option<mpsc::Sender<MotionSample>>,
    }

    impl ScriptedSource {
        fn new(samples: Vec<MotionSample>) -> Self {
            Self {
                samples,
                hold: None,
            }
        }
    }

    #[async_trait]
    impl MotionSource for ScriptedSource {
        async fn acquire(&mut self) -> Result<mpsc::Receiver<MotionSample>, SensorError> {
            let (tx, rx) = mpsc::channel(self.samples.len().max(1));
            for s in self.samples.clone() {
                let _ = tx.try_send(s);
            }
            self.hold = Some(tx);
            Ok(rx)
        }

        async fn release(&mut self) {
            self.hold = None;
        }
    }

    struct FailingSource;

    #[async_trait]
    impl MotionSource for FailingSource {
        async fn acquire(&mut self) -> Result<mpsc::Receiver<MotionSample>, SensorError> {
            Err(SensorError::PermissionDenied)
        }

        async fn release(&mut self) {}
    }

    struct Harness {
        cmd: mpsc::UnboundedSender<Command>,
        ui: mpsc::UnboundedReceiver<UiEvent>,
        relay_rx: mpsc::UnboundedReceiver<ClientEvent>,
        server_tx: mpsc::UnboundedSender<ServerEvent>,
        store: Arc<MemoryStore>,
    }

    fn spawn_with(source: Box<dyn MotionSource>, config: OrchestratorConfig) -> Harness {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui) = mpsc::unbounded_channel();
        let store = Arc::new(MemoryStore::new());
        let (orch, cmd) =
            Orchestrator::new(config, source, store.clone(), relay_tx, server_rx, ui_tx);
        tokio::spawn(orch.run());
        Harness {
            cmd,
            ui,
            relay_rx,
            server_tx,
            store,
        }
    }

    fn spawn(source: Box<dyn MotionSource>) -> Harness {
        spawn_with(
            source,
            OrchestratorConfig {
                user_id: "tester".into(),
                ..Default::default()
            },
        )
    }

    async fn wait_for(
        ui: &mut mpsc::UnboundedReceiver<UiEvent>,
        mut pred: impl FnMut(&UiEvent) -> bool,
    ) -> UiEvent {
        loop {
            let ev = time::timeout(Duration::from_secs(60), ui.recv())
                .await
                .expect("no matching ui event")
                .expect("ui channel closed");
            if pred(&ev) {
                return ev;
            }
        }
    }

    fn breathing_samples() -> Vec<MotionSample> {
        let mut samples = Vec::new();
        let mut t = 0u64;
        while t <= 30_000 {
            let phase = (t % 4_000) as f64 / 4_000.0 * std::f64::consts::TAU;
            samples.push(MotionSample::new(t, None, Some(9.81 + 0.5 * phase.sin()), None));
            t += 20;
        }
        samples
    }

    fn code(s: &str) -> SessionCode {
        SessionCode::new(s).unwrap()
    }

    #[tokio::test]
    async fn acquire_failure_surfaces_as_sensor_error() {
        let mut h = spawn(Box::new(FailingSource));
        h.cmd.send(Command::Start).unwrap();
        let ev = wait_for(&mut h.ui, |e| matches!(e, UiEvent::SensorFailed { .. })).await;
        match ev {
            UiEvent::SensorFailed { message } => assert!(message.contains("permission")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn startup_watchdog_stops_silent_sensor() {
        let mut h = spawn(Box::new(ScriptedSource::new(Vec::new())));
        h.cmd.send(Command::Start).unwrap();
        let ev = wait_for(&mut h.ui, |e| matches!(e, UiEvent::SensorFailed { .. })).await;
        match ev {
            UiEvent::SensorFailed { message } => assert!(message.contains("no motion data")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_save_persists_a_record() {
        let mut h = spawn(Box::new(ScriptedSource::new(breathing_samples())));
        h.cmd.send(Command::Start).unwrap();
        // Let a few bpm ticks accumulate history
        wait_for(&mut h.ui, |e| matches!(e, UiEvent::Display(_))).await;
        time::sleep(Duration::from_secs(3)).await;

        h.cmd.send(Command::StopAndSave).unwrap();
        let ev = wait_for(&mut h.ui, |e| matches!(e, UiEvent::SessionSaved { .. })).await;
        match ev {
            UiEvent::SessionSaved { id } => assert!(id.starts_with("tester-")),
            other => panic!("unexpected event {other:?}"),
        }

        let records = h.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_id, "tester");
        assert!(!records[0].samples.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_preserve_detector_state() {
        let mut h = spawn(Box::new(ScriptedSource::new(breathing_samples())));
        h.cmd.send(Command::Start).unwrap();

        let counted = loop {
            match wait_for(&mut h.ui, |e| matches!(e, UiEvent::Display(_))).await {
                UiEvent::Display(d) if d.breath_in > 0 => break d.breath_in,
                _ => {}
            }
        };

        h.cmd.send(Command::Pause).unwrap();
        let paused = wait_for(&mut h.ui, |e| matches!(e, UiEvent::Display(d) if d.paused)).await;
        match paused {
            UiEvent::Display(d) => assert!(d.breath_in >= counted),
            other => panic!("unexpected event {other:?}"),
        }

        h.cmd.send(Command::Resume).unwrap();
        let resumed = wait_for(
            &mut h.ui,
            |e| matches!(e, UiEvent::Display(d) if !d.paused && d.tracking),
        )
        .await;
        match resumed {
            UiEvent::Display(d) => assert!(d.breath_in >= counted, "counts were cleared"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn join_timeout_surfaces_exactly_once() {
        let mut h = spawn(Box::new(ScriptedSource::new(Vec::new())));
        h.cmd.send(Command::JoinSession(code("123456"))).unwrap();
        assert_eq!(
            h.relay_rx.recv().await,
            Some(ClientEvent::JoinSession { code: code("123456") })
        );

        wait_for(&mut h.ui, |e| matches!(e, UiEvent::JoinTimedOut)).await;

        // Let more than another watchdog window elapse, then check no
        // second timeout was emitted.
        time::sleep(Duration::from_secs(15)).await;
        h.cmd.send(Command::Reset).unwrap();
        wait_for(&mut h.ui, |e| matches!(e, UiEvent::Display(_))).await;
        let mut extra_timeouts = 0;
        while let Ok(ev) = h.ui.try_recv() {
            if ev == UiEvent::JoinTimedOut {
                extra_timeouts += 1;
            }
        }
        assert_eq!(extra_timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_display_updates_on_flush_tick() {
        let mut h = spawn(Box::new(ScriptedSource::new(Vec::new())));
        h.cmd.send(Command::JoinSession(code("222222"))).unwrap();
        h.server_tx
            .send(ServerEvent::Joined { code: code("222222") })
            .unwrap();
        wait_for(&mut h.ui, |e| matches!(e, UiEvent::Joined { .. })).await;

        h.server_tx
            .send(ServerEvent::BreathData(BreathData {
                code: code("222222"),
                t: Some(10_000),
                breath_in: Some(3),
                breath_out: Some(2),
                bpm: Some(12.0),
                point: Some(PlotPoint { x: 10_000, y: 0.01 }),
                samples: None,
            }))
            .unwrap();

        let ev = wait_for(&mut h.ui, |e| matches!(e, UiEvent::Display(_))).await;
        match ev {
            UiEvent::Display(d) => {
                assert_eq!(d.breath_in, 3);
                assert_eq!(d.breath_out, 2);
                assert_eq!(d.bpm, 12.0);
                assert_eq!(d.points, vec![PlotPoint { x: 10_000, y: 0.01 }]);
                assert!(!d.tracking);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_request_is_answered_with_full_state() {
        let mut h = spawn(Box::new(ScriptedSource::new(breathing_samples())));
        h.cmd.send(Command::Start).unwrap();
        h.cmd.send(Command::CreateSession).unwrap();
        h.server_tx
            .send(ServerEvent::SessionCreated { code: code("333333") })
            .unwrap();
        wait_for(&mut h.ui, |e| matches!(e, UiEvent::SessionCreated { .. })).await;

        h.server_tx
            .send(ServerEvent::RequestSnapshot { to: ConnId(9) })
            .unwrap();

        loop {
            let ev = time::timeout(Duration::from_secs(30), h.relay_rx.recv())
                .await
                .expect("no snapshot sent")
                .expect("relay channel closed");
            if let ClientEvent::SessionSnapshot { to, snapshot } = ev {
                assert_eq!(to, Some(ConnId(9)));
                assert!(!snapshot.points.is_empty());
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn producer_broadcasts_on_a_cadence() {
        let mut h = spawn(Box::new(ScriptedSource::new(breathing_samples())));
        h.cmd.send(Command::Start).unwrap();
        h.cmd.send(Command::CreateSession).unwrap();
        h.server_tx
            .send(ServerEvent::SessionCreated { code: code("444444") })
            .unwrap();

        let mut broadcasts = 0;
        while broadcasts < 3 {
            let ev = time::timeout(Duration::from_secs(30), h.relay_rx.recv())
                .await
                .expect("no broadcast")
                .expect("relay channel closed");
            if let ClientEvent::BreathData(data) = ev {
                assert_eq!(data.code, code("444444"));
                assert!(data.breath_in.is_some());
                broadcasts += 1;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_rejoins_remembered_session_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            user_id: "tester".into(),
            role_path: Some(dir.path().join("role.json")),
            ..Default::default()
        };
        let mut h = spawn_with(Box::new(ScriptedSource::new(Vec::new())), config);

        h.cmd.send(Command::JoinSession(code("777777"))).unwrap();
        assert_eq!(
            h.relay_rx.recv().await,
            Some(ClientEvent::JoinSession { code: code("777777") })
        );
        h.server_tx
            .send(ServerEvent::Joined { code: code("777777") })
            .unwrap();
        wait_for(&mut h.ui, |e| matches!(e, UiEvent::Joined { .. })).await;

        // The transport drops and comes back; the listener role should
        // be re-established from durable state without prompting.
        h.cmd.send(Command::RelayReconnected).unwrap();
        assert_eq!(
            h.relay_rx.recv().await,
            Some(ClientEvent::JoinSession { code: code("777777") })
        );

        // The re-join succeeding is not announced again
        h.server_tx
            .send(ServerEvent::Joined { code: code("777777") })
            .unwrap();
        time::sleep(Duration::from_secs(1)).await;
        while let Ok(ev) = h.ui.try_recv() {
            assert!(
                !matches!(ev, UiEvent::Joined { .. }),
                "rejoin was announced twice"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn joining_while_tracking_stops_local_detection() {
        let mut h = spawn(Box::new(ScriptedSource::new(breathing_samples())));
        h.cmd.send(Command::Start).unwrap();
        wait_for(&mut h.ui, |e| matches!(e, UiEvent::Display(_))).await;

        h.cmd.send(Command::JoinSession(code("555555"))).unwrap();
        h.server_tx
            .send(ServerEvent::Joined { code: code("555555") })
            .unwrap();
        wait_for(&mut h.ui, |e| matches!(e, UiEvent::Joined { .. })).await;
        // Discard display updates queued before the join took effect
        while h.ui.try_recv().is_ok() {}

        // Local tracking is off: no watchdog, no bpm ticks. The only
        // display updates now come from flushed relay data.
        h.server_tx
            .send(ServerEvent::BreathData(BreathData {
                code: code("555555"),
                t: None,
                breath_in: Some(7),
                breath_out: None,
                bpm: None,
                point: None,
                samples: None,
            }))
            .unwrap();
        let ev = wait_for(&mut h.ui, |e| matches!(e, UiEvent::Display(_))).await;
        match ev {
            UiEvent::Display(d) => {
                assert_eq!(d.breath_in, 7);
                assert!(!d.tracking);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
