//! Relay controller
//!
//! The controller is the only owner of the session. Every transition runs on
//! one worker thread, which serializes user commands (`start`, `stop`) with
//! the asynchronous outcomes that feed back into the state machine: link
//! negotiation results and fatal stream errors.
//!
//! ```text
//!            start(Device)
//!   Idle ─────────────────────────────┐
//!    │ ▲                              ▼
//!    │ │ failed/cancelled        Streaming ──stop/error──▶ Stopping ──▶ Idle
//!    │ │                              ▲
//!    ▼ │        link connected        │
//!   Negotiating ──────────────────────┘
//!   (start(Bluetooth))
//! ```

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use uuid::Uuid;

use crate::audio::capture::AudioSource;
use crate::audio::format::PcmFormat;
use crate::audio::playback::AudioSink;
use crate::bluetooth::{LinkFailure, LinkNegotiator, PendingLink};
use crate::constants;
use crate::error::{AudioError, BluetoothError, Error, RelayError, Result};
use crate::relay::capability::Capabilities;
use crate::relay::event::{EventCallback, RelayEvent};
use crate::relay::session::{Session, SessionCounters, SessionInfo, SessionState, SourceMode};

/// Acknowledgment returned by [`RelayController::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAck {
    /// Audio is flowing
    Streaming,
    /// Link negotiation has begun; streaming starts when the link is up
    Negotiating,
}

enum Command {
    Start {
        mode: SourceMode,
        reply: Sender<Result<StartAck>>,
    },
    Stop {
        reply: Sender<()>,
    },
    Shutdown,
}

/// Outcomes reported back to the worker from other threads
#[derive(Debug)]
enum Outcome {
    LinkConnected { session: Uuid },
    LinkFailed { session: Uuid, reason: LinkFailure },
    StreamFailed { session: Uuid, error: AudioError },
}

type SharedSink = Arc<Mutex<Box<dyn AudioSink>>>;

/// State readable from any thread
#[derive(Default)]
struct Shared {
    state: RwLock<SessionState>,
    session: RwLock<Option<(SessionInfo, Arc<SessionCounters>)>>,
}

impl Shared {
    fn publish(&self, session: Option<&Session>) {
        *self.state.write() = session.map(|s| s.state).unwrap_or_default();
        *self.session.write() = session.map(|s| (s.snapshot(), s.counters.clone()));
    }
}

/// Builder for [`RelayController`]
pub struct RelayBuilder {
    source: Box<dyn AudioSource>,
    sink: Box<dyn AudioSink>,
    negotiator: LinkNegotiator,
    format: PcmFormat,
    chunk_size: usize,
    capabilities: Capabilities,
    on_event: Option<EventCallback>,
}

impl RelayBuilder {
    /// Session PCM format and chunk size in bytes
    pub fn format(mut self, format: PcmFormat, chunk_size: usize) -> Self {
        self.format = format;
        self.chunk_size = chunk_size;
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(RelayEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(callback));
        self
    }

    pub fn event_callback(mut self, callback: EventCallback) -> Self {
        self.on_event = Some(callback);
        self
    }

    /// Check capabilities and the session format, then start the worker
    pub fn build(self) -> Result<RelayController> {
        self.capabilities.require_all()?;
        self.format.validate_chunk_size(self.chunk_size)?;

        let shared = Arc::new(Shared::default());
        let (command_tx, command_rx) = bounded(0);
        let (outcome_tx, outcome_rx) = unbounded();

        let mut worker = Worker {
            source: self.source,
            sink: Arc::new(Mutex::new(self.sink)),
            negotiator: self.negotiator,
            format: self.format,
            chunk_size: self.chunk_size,
            on_event: self.on_event,
            shared: shared.clone(),
            outcomes: outcome_tx,
            active: None,
        };

        let handle = thread::Builder::new()
            .name("relay-controller".to_string())
            .spawn(move || worker.run(command_rx, outcome_rx))?;

        tracing::info!(
            "Relay controller ready ({}, {} byte chunks)",
            self.format,
            self.chunk_size
        );

        Ok(RelayController {
            commands: command_tx,
            shared,
            worker: Some(handle),
        })
    }
}

/// Orchestrates negotiator, source and sink for one session at a time
pub struct RelayController {
    commands: Sender<Command>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl RelayController {
    pub fn builder(
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
        negotiator: LinkNegotiator,
    ) -> RelayBuilder {
        RelayBuilder {
            source,
            sink,
            negotiator,
            format: PcmFormat::default(),
            chunk_size: constants::DEFAULT_CHUNK_SIZE,
            capabilities: Capabilities::all(),
            on_event: None,
        }
    }

    /// Start a session
    ///
    /// Device mode returns once audio is flowing or startup has failed.
    /// Bluetooth mode returns [`StartAck::Negotiating`] as soon as the link
    /// request is issued. Rejected with `SessionActive` while another
    /// session is negotiating or streaming.
    pub fn start(&self, mode: SourceMode) -> Result<StartAck> {
        let (reply, response) = bounded(1);
        self.commands
            .send(Command::Start { mode, reply })
            .map_err(|_| RelayError::ControllerClosed)?;
        response.recv().map_err(|_| RelayError::ControllerClosed)?
    }

    /// Stop the current session, if any
    ///
    /// Idempotent. When this returns every resource of the session has been
    /// released and no further chunk will reach the sink.
    pub fn stop(&self) -> Result<()> {
        let (reply, response) = bounded(1);
        self.commands
            .send(Command::Stop { reply })
            .map_err(|_| RelayError::ControllerClosed)?;
        response.recv().map_err(|_| RelayError::ControllerClosed)?;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.read()
    }

    /// Snapshot of the current session with live counters
    pub fn session(&self) -> Option<SessionInfo> {
        self.shared.session.read().as_ref().map(|(info, counters)| {
            let mut info = info.clone();
            info.chunks_relayed = counters.chunks();
            info.bytes_relayed = counters.bytes();
            info
        })
    }
}

impl Drop for RelayController {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// A session plus the resources it holds
struct Active {
    session: Session,
    pending: Option<PendingLink>,
    /// Open while the sink accepts chunks for this session
    gate: Arc<AtomicBool>,
}

struct Worker {
    source: Box<dyn AudioSource>,
    sink: SharedSink,
    negotiator: LinkNegotiator,
    format: PcmFormat,
    chunk_size: usize,
    on_event: Option<EventCallback>,
    shared: Arc<Shared>,
    outcomes: Sender<Outcome>,
    active: Option<Active>,
}

impl Worker {
    fn run(&mut self, commands: Receiver<Command>, outcomes: Receiver<Outcome>) {
        loop {
            select! {
                recv(commands) -> command => match command {
                    Ok(Command::Start { mode, reply }) => {
                        let result = self.start(mode);
                        let _ = reply.send(result);
                    }
                    Ok(Command::Stop { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                    }
                    Ok(Command::Shutdown) | Err(_) => {
                        self.stop();
                        break;
                    }
                },
                recv(outcomes) -> outcome => {
                    if let Ok(outcome) = outcome {
                        self.handle(outcome);
                    }
                }
            }
        }
        tracing::debug!("Relay controller worker exited");
    }

    fn emit(&self, event: RelayEvent) {
        if let Some(callback) = &self.on_event {
            callback(event);
        }
    }

    fn report(&self, err: &Error) {
        self.emit(RelayEvent::Error {
            code: err.reason_code(),
            message: err.to_string(),
        });
    }

    fn state(&self) -> SessionState {
        self.active.as_ref().map(|a| a.session.state).unwrap_or_default()
    }

    fn set_state(&mut self, to: SessionState) {
        let from = self.state();
        if from == to {
            return;
        }
        match self.active.as_mut() {
            Some(active) => {
                active.session.state = to;
                if to == SessionState::Streaming {
                    active.session.streaming_since = Some(chrono::Utc::now());
                }
            }
            None => return,
        }
        tracing::info!("Relay state: {} -> {}", from, to);
        self.shared.publish(self.active.as_ref().map(|a| &a.session));
        self.emit(RelayEvent::StateChanged { from, to });
    }

    /// Drop the session and return to Idle
    fn finish(&mut self) {
        let from = self.state();
        self.active = None;
        self.shared.publish(None);
        if from != SessionState::Idle {
            tracing::info!("Relay state: {} -> {}", from, SessionState::Idle);
            self.emit(RelayEvent::StateChanged {
                from,
                to: SessionState::Idle,
            });
        }
    }

    fn is_current(&self, session: Uuid, state: SessionState) -> bool {
        self.active
            .as_ref()
            .map(|a| a.session.id == session && a.session.state == state)
            .unwrap_or(false)
    }

    fn start(&mut self, mode: SourceMode) -> Result<StartAck> {
        let state = self.state();
        if state.is_active() {
            tracing::warn!("Start({}) rejected, session is {}", mode, state);
            let err: Error = RelayError::SessionActive(state.to_string()).into();
            self.report(&err);
            return Err(err);
        }

        if mode == SourceMode::Bluetooth && !self.negotiator.is_supported() {
            tracing::warn!("Bluetooth hands-free audio is not supported");
            let err: Error = BluetoothError::Unsupported.into();
            self.emit(RelayEvent::BluetoothUnsupported);
            self.report(&err);
            return Err(err);
        }

        let session = Session::new(mode, self.format, self.chunk_size);
        tracing::info!("New {} session {}", mode, session.id);
        self.active = Some(Active {
            session,
            pending: None,
            gate: Arc::new(AtomicBool::new(false)),
        });
        self.shared.publish(self.active.as_ref().map(|a| &a.session));

        match mode {
            SourceMode::Device => match self.begin_streaming() {
                Ok(()) => Ok(StartAck::Streaming),
                Err(e) => {
                    self.report(&e);
                    Err(e)
                }
            },
            SourceMode::Bluetooth => {
                self.begin_negotiation();
                Ok(StartAck::Negotiating)
            }
        }
    }

    fn begin_negotiation(&mut self) {
        let Some(id) = self.active.as_ref().map(|a| a.session.id) else {
            return;
        };
        self.set_state(SessionState::Negotiating);
        self.emit(RelayEvent::Negotiating);

        let connected_tx = self.outcomes.clone();
        let failed_tx = self.outcomes.clone();
        let pending = self.negotiator.request_link(
            move || {
                let _ = connected_tx.send(Outcome::LinkConnected { session: id });
            },
            move |reason| {
                let _ = failed_tx.send(Outcome::LinkFailed { session: id, reason });
            },
        );
        if let Some(active) = self.active.as_mut() {
            active.pending = Some(pending);
        }
    }

    /// Open the sink, enter Streaming and start the capture loop
    ///
    /// On failure every resource acquired so far is released and the
    /// controller is back in Idle.
    fn begin_streaming(&mut self) -> Result<()> {
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };
        let id = active.session.id;
        let gate = active.gate.clone();
        let counters = active.session.counters.clone();

        let opened = self.sink.lock().init(self.format);
        if let Err(e) = opened {
            tracing::error!("Failed to open playback: {}", e);
            self.negotiator_cleanup();
            self.finish();
            return Err(e.into());
        }

        gate.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Streaming);

        let sink = self.sink.clone();
        let chunk_gate = gate.clone();
        let write_failed = self.outcomes.clone();
        let on_chunk = Box::new(move |chunk: crate::audio::PcmChunk| {
            let mut sink = sink.lock();
            if !chunk_gate.load(Ordering::SeqCst) {
                return ControlFlow::Break(());
            }
            let len = chunk.len();
            match sink.write(chunk) {
                Ok(()) => {
                    counters.record(len);
                    ControlFlow::Continue(())
                }
                Err(error) => {
                    chunk_gate.store(false, Ordering::SeqCst);
                    let _ = write_failed.send(Outcome::StreamFailed { session: id, error });
                    ControlFlow::Break(())
                }
            }
        });
        let read_failed = self.outcomes.clone();
        let on_error = Box::new(move |error: AudioError| {
            let _ = read_failed.send(Outcome::StreamFailed { session: id, error });
        });

        let started = self
            .source
            .start(self.format, self.chunk_size, on_chunk, on_error);
        if let Err(e) = started {
            tracing::error!("Failed to start capture from '{}': {}", self.source.name(), e);
            self.teardown();
            return Err(e.into());
        }

        tracing::info!(
            "Relaying {} -> {} ({})",
            self.source.name(),
            self.sink.lock().name(),
            self.format
        );
        let mode = self.active.as_ref().map(|a| a.session.mode);
        if let Some(mode) = mode {
            self.emit(RelayEvent::Streaming { mode });
        }
        Ok(())
    }

    fn negotiator_cleanup(&mut self) {
        if let Err(e) = self.negotiator.release_link() {
            tracing::warn!("Failed to release Bluetooth link: {}", e);
            self.report(&e.into());
        }
    }

    /// Stopping: release source, sink and link, each independently
    fn teardown(&mut self) {
        let Some(gate) = self.active.as_ref().map(|a| a.gate.clone()) else {
            return;
        };
        {
            // No write is in flight once the sink lock is held
            let _sink = self.sink.lock();
            gate.store(false, Ordering::SeqCst);
        }
        self.set_state(SessionState::Stopping);

        self.source.stop();

        let released = self.sink.lock().release();
        if let Err(e) = released {
            tracing::warn!("Failed to release playback: {}", e);
            self.report(&e.into());
        }

        self.negotiator_cleanup();
        self.finish();
        self.emit(RelayEvent::Stopped);
    }

    fn stop(&mut self) {
        match self.state() {
            SessionState::Idle => {}
            SessionState::Negotiating => {
                // Nothing is streaming yet, so cancellation goes straight to Idle
                if let Some(pending) = self.active.as_mut().and_then(|a| a.pending.take()) {
                    pending.cancel();
                }
                // A link that won the race against cancellation is taken down here
                self.negotiator_cleanup();
                self.finish();
                self.emit(RelayEvent::Stopped);
            }
            SessionState::Streaming | SessionState::Stopping => self.teardown(),
        }
    }

    fn handle(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::LinkConnected { session } => {
                if !self.is_current(session, SessionState::Negotiating) {
                    tracing::debug!("Ignoring link-up for stale session {}", session);
                    return;
                }
                if let Some(active) = self.active.as_mut() {
                    active.pending = None;
                }
                self.emit(RelayEvent::LinkConnected);
                if let Err(e) = self.begin_streaming() {
                    tracing::error!("Bluetooth session failed to start streaming: {}", e);
                    self.report(&e);
                }
            }
            Outcome::LinkFailed { session, reason } => {
                if !self.is_current(session, SessionState::Negotiating) {
                    tracing::debug!("Ignoring link failure for stale session {}", session);
                    return;
                }
                tracing::warn!("Bluetooth link negotiation failed: {}", reason);
                let err: Error = BluetoothError::from(reason.clone()).into();
                self.emit(RelayEvent::NegotiationFailed { reason });
                self.report(&err);
                self.finish();
            }
            Outcome::StreamFailed { session, error } => {
                if !self.is_current(session, SessionState::Streaming) {
                    return;
                }
                tracing::error!("Stream failed: {}", error);
                self.report(&error.into());
                self.teardown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::{RecordingSink, ScriptedSource};
    use crate::bluetooth::mock::MockRouting;
    use crate::bluetooth::LinkState;
    use std::time::{Duration, Instant};

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn events() -> (EventCallback, Arc<Mutex<Vec<RelayEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let callback: EventCallback = Arc::new(move |event| log.lock().push(event));
        (callback, seen)
    }

    fn format() -> PcmFormat {
        PcmFormat::mono16(16000)
    }

    #[test]
    fn test_missing_capability_fails_construction() {
        let result = RelayController::builder(
            Box::new(ScriptedSource::uniform(1, 64, Duration::from_millis(1))),
            Box::new(RecordingSink::new()),
            LinkNegotiator::new(Arc::new(MockRouting::silent()), Duration::from_secs(1)),
        )
        .capabilities(Capabilities {
            audio_capture: true,
            bluetooth_control: false,
        })
        .build();

        match result {
            Err(e) => assert_eq!(e.reason_code(), "permission"),
            Ok(_) => panic!("controller built without bluetooth control"),
        }
    }

    #[test]
    fn test_device_session_streams_and_stops() {
        let source = ScriptedSource::uniform(10, 64, Duration::from_millis(1));
        let source_log = source.log();
        let sink = RecordingSink::new();
        let sink_log = sink.log();
        let (callback, seen) = events();

        let controller = RelayController::builder(
            Box::new(source),
            Box::new(sink),
            LinkNegotiator::new(Arc::new(MockRouting::silent()), Duration::from_secs(1)),
        )
        .format(format(), 64)
        .event_callback(callback)
        .build()
        .unwrap();

        assert_eq!(controller.start(SourceMode::Device).unwrap(), StartAck::Streaming);
        assert_eq!(controller.state(), SessionState::Streaming);
        assert!(wait_for(|| sink_log.write_count() == 10));
        assert_eq!(controller.session().unwrap().chunks_relayed, 10);

        controller.stop().unwrap();
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(controller.session().is_none());
        assert_eq!(sink_log.release_count(), 1);
        assert!(!source_log.is_running());

        let seen = seen.lock();
        assert!(seen.contains(&RelayEvent::Streaming { mode: SourceMode::Device }));
        assert_eq!(seen.last(), Some(&RelayEvent::Stopped));
    }

    #[test]
    fn test_sink_init_failure_leaves_source_untouched() {
        let source = ScriptedSource::uniform(5, 64, Duration::from_millis(1));
        let source_log = source.log();
        let sink = RecordingSink::new().failing_init(AudioError::DeviceOpen("busy".into()));

        let controller = RelayController::builder(
            Box::new(source),
            Box::new(sink),
            LinkNegotiator::new(Arc::new(MockRouting::silent()), Duration::from_secs(1)),
        )
        .format(format(), 64)
        .build()
        .unwrap();

        let err = controller.start(SourceMode::Device).unwrap_err();
        assert_eq!(err.reason_code(), "device_open");
        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(source_log.start_calls(), 0);
    }

    #[test]
    fn test_missing_microphone_is_a_device_error() {
        let source = ScriptedSource::uniform(5, 64, Duration::from_millis(1))
            .failing_on_start(AudioError::DeviceNotFound("No default input device".into()));

        let controller = RelayController::builder(
            Box::new(source),
            Box::new(RecordingSink::new()),
            LinkNegotiator::new(Arc::new(MockRouting::silent()), Duration::from_secs(1)),
        )
        .format(format(), 64)
        .build()
        .unwrap();

        let err = controller.start(SourceMode::Device).unwrap_err();
        assert_eq!(err.reason_code(), "device_open");
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[test]
    fn test_source_failure_releases_sink() {
        let source = ScriptedSource::uniform(5, 64, Duration::from_millis(1))
            .failing_on_start(AudioError::DeviceOpen("mic busy".into()));
        let sink = RecordingSink::new();
        let sink_log = sink.log();

        let controller = RelayController::builder(
            Box::new(source),
            Box::new(sink),
            LinkNegotiator::new(Arc::new(MockRouting::silent()), Duration::from_secs(1)),
        )
        .format(format(), 64)
        .build()
        .unwrap();

        let err = controller.start(SourceMode::Device).unwrap_err();
        assert_eq!(err.reason_code(), "device_open");
        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(sink_log.release_count(), 1);
        assert!(!sink_log.is_open());
    }

    #[test]
    fn test_write_failure_stops_session() {
        let source = ScriptedSource::continuous(64, Duration::from_millis(1));
        let sink = RecordingSink::new().failing_write_at(3);
        let sink_log = sink.log();
        let (callback, seen) = events();

        let controller = RelayController::builder(
            Box::new(source),
            Box::new(sink),
            LinkNegotiator::new(Arc::new(MockRouting::silent()), Duration::from_secs(1)),
        )
        .format(format(), 64)
        .event_callback(callback)
        .build()
        .unwrap();

        controller.start(SourceMode::Device).unwrap();
        assert!(wait_for(|| controller.state() == SessionState::Idle));
        assert_eq!(sink_log.release_count(), 1);
        assert!(seen
            .lock()
            .iter()
            .any(|e| matches!(e, RelayEvent::Error { code: "stream_io", .. })));
    }

    #[test]
    fn test_read_failure_stops_session() {
        let source = ScriptedSource::uniform(2, 64, Duration::from_millis(1))
            .failing_after_script(AudioError::StreamIo("device unplugged".into()));
        let sink = RecordingSink::new();
        let sink_log = sink.log();

        let controller = RelayController::builder(
            Box::new(source),
            Box::new(sink),
            LinkNegotiator::new(Arc::new(MockRouting::silent()), Duration::from_secs(1)),
        )
        .format(format(), 64)
        .build()
        .unwrap();

        controller.start(SourceMode::Device).unwrap();
        assert!(wait_for(|| controller.state() == SessionState::Idle));
        assert_eq!(sink_log.write_count(), 2);
        assert_eq!(sink_log.release_count(), 1);
    }

    #[test]
    fn test_negotiation_failure_returns_to_idle() {
        let routing = Arc::new(MockRouting::responding_with(
            LinkState::Disconnected,
            Duration::from_millis(5),
        ));
        let source = ScriptedSource::uniform(5, 64, Duration::from_millis(1));
        let source_log = source.log();
        let (callback, seen) = events();

        let controller = RelayController::builder(
            Box::new(source),
            Box::new(RecordingSink::new()),
            LinkNegotiator::new(routing.clone(), Duration::from_secs(1)),
        )
        .format(format(), 64)
        .event_callback(callback)
        .build()
        .unwrap();

        assert_eq!(controller.start(SourceMode::Bluetooth).unwrap(), StartAck::Negotiating);
        assert!(wait_for(|| controller.state() == SessionState::Idle));
        assert_eq!(source_log.start_calls(), 0);
        assert!(seen.lock().contains(&RelayEvent::NegotiationFailed {
            reason: LinkFailure::Disconnected
        }));
    }

    #[test]
    fn test_stop_during_negotiation_cancels() {
        let routing = Arc::new(MockRouting::silent());
        let source = ScriptedSource::uniform(5, 64, Duration::from_millis(1));
        let source_log = source.log();

        let controller = RelayController::builder(
            Box::new(source),
            Box::new(RecordingSink::new()),
            LinkNegotiator::new(routing.clone(), Duration::from_secs(5)),
        )
        .format(format(), 64)
        .build()
        .unwrap();

        controller.start(SourceMode::Bluetooth).unwrap();
        assert_eq!(controller.state(), SessionState::Negotiating);
        assert_eq!(routing.subscriber_count(), 1);

        controller.stop().unwrap();
        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(routing.subscriber_count(), 0);

        routing.emit(LinkState::Connected);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(source_log.start_calls(), 0);
    }

    #[test]
    fn test_stale_link_up_after_restart_is_ignored() {
        let routing = Arc::new(MockRouting::silent());
        let controller = RelayController::builder(
            Box::new(ScriptedSource::uniform(1, 64, Duration::from_millis(1))),
            Box::new(RecordingSink::new()),
            LinkNegotiator::new(routing.clone(), Duration::from_secs(5)),
        )
        .format(format(), 64)
        .build()
        .unwrap();

        controller.start(SourceMode::Bluetooth).unwrap();
        let first = controller.session().unwrap().id;
        controller.stop().unwrap();
        controller.start(SourceMode::Bluetooth).unwrap();
        let second = controller.session().unwrap().id;
        assert_ne!(first, second);

        routing.emit(LinkState::Connected);
        assert!(wait_for(|| controller.state() == SessionState::Streaming));
        assert_eq!(controller.session().unwrap().id, second);
        controller.stop().unwrap();
    }

    #[test]
    fn test_drop_releases_active_session() {
        let sink = RecordingSink::new();
        let sink_log = sink.log();
        let controller = RelayController::builder(
            Box::new(ScriptedSource::continuous(64, Duration::from_millis(1))),
            Box::new(sink),
            LinkNegotiator::new(Arc::new(MockRouting::silent()), Duration::from_secs(1)),
        )
        .format(format(), 64)
        .build()
        .unwrap();

        controller.start(SourceMode::Device).unwrap();
        drop(controller);
        assert_eq!(sink_log.release_count(), 1);
    }
}
