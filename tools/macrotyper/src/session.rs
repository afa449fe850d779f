use crate::buffers::{needs_ending_decision, seal, Buffer, BufferList, Macro, SavePoint, StopPoint};
use crate::capture::{CaptureRouter, PlaybackSink, RecordingSink};
use crate::config::{AppConfig, EndingStopPolicy};
use crate::errors::TyperError;
use crate::fsm::{Action, Event, ExitReason, RecordingPhase, SessionMachine, SessionState};
use crate::hooks::{Feedback, Hook, Sound};
use crate::logging::append_run_log;
use crate::macro_store::{MacroStorage, MacroSummary};
use crate::play::autoplay::{self, AutoplayControl};
use crate::play::keys::{KeyMode, KeyRouter};
use crate::play::sequencer::{self, PlaybackOutcome, PlaybackReport, SequencerIo, StepCommand};
use crate::record::coordinator;
use crate::record::manager::{self, ManagerDeps, ManagerRequest, UndoOutcome};
use crate::runtime::{ContinueDecision, EditorSurface, FileSystem, Prompter};
use serde_json::json;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

type Reply<T> = oneshot::Sender<Result<T, TyperError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingDecision {
    Save,
    Discard,
    Cancelled,
}

/// Notifications from session tasks back to the controller.
#[derive(Debug)]
pub enum Signal {
    Transition(Event),
    Failure(TyperError),
    RecordingClosed {
        list: BufferList,
        decision: RecordingDecision,
    },
    PlaybackFinished(Result<PlaybackReport, TyperError>),
}

#[derive(Debug)]
enum Request {
    Record(Reply<()>),
    EndRecording(Reply<()>),
    CancelRecording(Reply<()>),
    InsertStop {
        name: Option<String>,
        reply: Reply<()>,
    },
    Undo(Reply<UndoOutcome>),
    Play {
        name: String,
        reply: Reply<()>,
    },
    CancelPlaying(Reply<()>),
    ToggleSilence(Reply<bool>),
    List(Reply<Vec<MacroSummary>>),
    Delete {
        names: Vec<String>,
        reply: Reply<Vec<String>>,
    },
    Export {
        name: String,
        path: PathBuf,
        reply: Reply<()>,
    },
    Import {
        path: PathBuf,
        reply: Reply<Macro>,
    },
    LoadFinalState {
        name: String,
        reply: Reply<bool>,
    },
}

/// Collaborators the session drives.
#[derive(Clone)]
pub struct TyperDeps {
    pub editor: Arc<dyn EditorSurface>,
    pub storage: Arc<dyn MacroStorage>,
    pub prompter: Arc<dyn Prompter>,
    pub feedback: Arc<dyn Feedback>,
    pub file_system: Arc<dyn FileSystem>,
}

/// Client side of a running session controller.
#[derive(Clone)]
pub struct TyperHandle {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<SessionState>,
    capture: CaptureRouter,
}

/// Starts the session controller on the current tokio runtime.
pub fn spawn_typer(config: &AppConfig, deps: TyperDeps) -> TyperHandle {
    let (requests_tx, requests_rx) = mpsc::channel(8);
    let (signal_tx, signal_rx) = mpsc::channel(16);
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);
    let capture = CaptureRouter::new();

    deps.feedback.invoke(Hook::SetSilent(config.feedback.silent));
    deps.feedback
        .invoke(Hook::SetAppState(SessionState::Idle.label().to_string()));

    let controller = Controller {
        interval: config.playback.autoplay_interval(),
        keys: KeyRouter::from_config(&config.playback),
        ending_stop: config.recording.ending_stop,
        silent: config.feedback.silent,
        deps,
        machine: SessionMachine::default(),
        capture: capture.clone(),
        signal_tx,
        state_tx,
        recording: None,
        playing: None,
    };
    tokio::spawn(controller.run(requests_rx, signal_rx));

    TyperHandle {
        requests: requests_tx,
        state: state_rx,
        capture,
    }
}

impl TyperHandle {
    pub fn capture(&self) -> CaptureRouter {
        self.capture.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Resolves with the first published state matching `predicate`.
    pub async fn wait_until(
        &self,
        predicate: impl Fn(&SessionState) -> bool,
    ) -> Result<SessionState, TyperError> {
        let mut state = self.state.clone();
        let matched = state
            .wait_for(|current| predicate(current))
            .await
            .map_err(|_| TyperError::ChannelClosed("session state".to_string()))?;
        Ok(*matched)
    }

    pub async fn record(&self) -> Result<(), TyperError> {
        self.call(Request::Record).await
    }

    /// Stops capture; the save prompt follows once queued input is drained.
    pub async fn end_recording(&self) -> Result<(), TyperError> {
        self.call(Request::EndRecording).await
    }

    pub async fn cancel_recording(&self) -> Result<(), TyperError> {
        self.call(Request::CancelRecording).await
    }

    pub async fn insert_stop(&self, name: Option<&str>) -> Result<(), TyperError> {
        let name = name.map(str::to_string);
        self.call(|reply| Request::InsertStop { name, reply }).await
    }

    pub async fn undo(&self) -> Result<UndoOutcome, TyperError> {
        self.call(Request::Undo).await
    }

    pub async fn play(&self, name: &str) -> Result<(), TyperError> {
        let name = name.to_string();
        self.call(|reply| Request::Play { name, reply }).await
    }

    pub async fn cancel_playing(&self) -> Result<(), TyperError> {
        self.call(Request::CancelPlaying).await
    }

    /// Returns the new silence setting.
    pub async fn toggle_silence(&self) -> Result<bool, TyperError> {
        self.call(Request::ToggleSilence).await
    }

    pub async fn list(&self) -> Result<Vec<MacroSummary>, TyperError> {
        self.call(Request::List).await
    }

    /// Returns the names that existed and were removed.
    pub async fn delete(&self, names: &[&str]) -> Result<Vec<String>, TyperError> {
        let names = names.iter().map(|name| name.to_string()).collect();
        self.call(|reply| Request::Delete { names, reply }).await
    }

    pub async fn export(&self, name: &str, path: impl Into<PathBuf>) -> Result<(), TyperError> {
        let name = name.to_string();
        let path = path.into();
        self.call(|reply| Request::Export { name, path, reply })
            .await
    }

    pub async fn import(&self, path: impl Into<PathBuf>) -> Result<Macro, TyperError> {
        let path = path.into();
        self.call(|reply| Request::Import { path, reply }).await
    }

    /// Opens the macro's closing snapshot. `false` when it has none.
    pub async fn load_final_state(&self, name: &str) -> Result<bool, TyperError> {
        let name = name.to_string();
        self.call(|reply| Request::LoadFinalState { name, reply })
            .await
    }

    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> Result<T, TyperError> {
        let (reply, reply_rx) = oneshot::channel();
        self.requests
            .send(request(reply))
            .await
            .map_err(|_| TyperError::ChannelClosed("session controller".to_string()))?;
        reply_rx
            .await
            .map_err(|_| TyperError::ChannelClosed("session reply".to_string()))?
    }
}

// ── Controller ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingContext {
    list: Option<BufferList>,
    buffer_tx: Option<mpsc::Sender<Buffer>>,
    manager_tx: Option<mpsc::Sender<ManagerRequest>>,
}

struct PlayingContext {
    pending: Option<(Vec<Buffer>, mpsc::Receiver<StepCommand>)>,
    control_tx: mpsc::Sender<AutoplayControl>,
    cancel_tx: watch::Sender<bool>,
    /// Resolves once the sequencer has returned and no edit is in flight.
    drained: Option<oneshot::Receiver<()>>,
}

struct Controller {
    interval: Duration,
    keys: KeyRouter,
    ending_stop: EndingStopPolicy,
    silent: bool,
    deps: TyperDeps,
    machine: SessionMachine,
    capture: CaptureRouter,
    signal_tx: mpsc::Sender<Signal>,
    state_tx: watch::Sender<SessionState>,
    recording: Option<RecordingContext>,
    playing: Option<PlayingContext>,
}

impl Controller {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut signals: mpsc::Receiver<Signal>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
            }
        }
        self.teardown();
        append_run_log("info", "session.stopped", json!({}));
    }

    fn teardown(&mut self) {
        self.capture.deregister_recording();
        self.capture.deregister_playback();
        if let Some(playing) = self.playing.take() {
            let _ = playing.cancel_tx.send(true);
        }
        self.recording = None;
    }

    async fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Transition(event) => self.process(event).await,
            Signal::Failure(err) => self.show_error(&err),
            Signal::RecordingClosed { list, decision } => {
                if !self.machine.state().is_recording() {
                    return;
                }
                let context = self.recording.get_or_insert_with(RecordingContext::default);
                context.list = Some(list);
                context.manager_tx = None;
                match decision {
                    RecordingDecision::Save => self.process(Event::SaveRequested).await,
                    RecordingDecision::Discard => {
                        self.show_message("Recording discarded");
                        self.process(Event::DoneRecording(ExitReason::Discarded))
                            .await;
                    }
                    RecordingDecision::Cancelled => {
                        self.show_message("Recording cancelled");
                        self.process(Event::DoneRecording(ExitReason::Cancelled))
                            .await;
                    }
                }
            }
            Signal::PlaybackFinished(result) => match result {
                Ok(report) if report.outcome == PlaybackOutcome::Completed => {
                    self.show_message("Done playing");
                    if self.machine.state().is_playing() {
                        self.process(Event::DonePlaying).await;
                    }
                }
                // Cancellation only comes from our own teardown.
                Ok(_) => {}
                Err(err) => {
                    self.show_error(&err);
                    if self.machine.state().is_playing() {
                        self.process(Event::DonePlaying).await;
                    }
                }
            },
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Record(reply) => {
                let result = self.start_recording().await;
                self.reply(reply, result);
            }
            Request::EndRecording(reply) => {
                let result = self.end_recording();
                self.reply(reply, result);
            }
            Request::CancelRecording(reply) => {
                let result = self.cancel_recording().await;
                self.reply(reply, result);
            }
            Request::InsertStop { name, reply } => match self.capturing_buffers() {
                Ok(buffer_tx) => {
                    append_run_log("info", "record.stop_inserted", json!({ "name": name }));
                    // Queued behind pending frames without blocking the loop.
                    tokio::spawn(async move {
                        let sent = buffer_tx
                            .send(Buffer::StopPoint(StopPoint::named(name)))
                            .await
                            .map_err(|_| TyperError::ChannelClosed("recording".to_string()));
                        let _ = reply.send(sent);
                    });
                }
                Err(err) => self.reply(reply, Err(err)),
            },
            Request::Undo(reply) => match self.manager_requests() {
                Ok(manager_tx) => {
                    tokio::spawn(async move {
                        if let Err(mpsc::error::SendError(ManagerRequest::Undo { reply })) =
                            manager_tx.send(ManagerRequest::Undo { reply }).await
                        {
                            let _ = reply
                                .send(Err(TyperError::ChannelClosed("recording".to_string())));
                        }
                    });
                }
                Err(err) => self.reply(reply, Err(err)),
            },
            Request::Play { name, reply } => {
                let result = self.start_playing(&name).await;
                self.reply(reply, result);
            }
            Request::CancelPlaying(reply) => {
                let result = if self.machine.state().is_playing() {
                    self.show_message("Playback cancelled");
                    self.process(Event::DonePlaying).await;
                    Ok(())
                } else {
                    Err(TyperError::Unavailable("no macro is playing".to_string()))
                };
                self.reply(reply, result);
            }
            Request::ToggleSilence(reply) => {
                let result = if self.machine.state().is_playing() {
                    self.process(Event::ToggleSilence).await;
                    Ok(self.silent)
                } else {
                    Err(TyperError::Unavailable(
                        "silence can only be toggled while playing".to_string(),
                    ))
                };
                self.reply(reply, result);
            }
            Request::List(reply) => {
                let result = match self.require_idle("list") {
                    Ok(()) => self.with_storage(|storage| storage.list()).await,
                    Err(err) => Err(err),
                };
                self.reply(reply, result);
            }
            Request::Delete { names, reply } => {
                let result = match self.require_idle("delete") {
                    Ok(()) => self.delete_macros(names).await,
                    Err(err) => Err(err),
                };
                self.reply(reply, result);
            }
            Request::Export { name, path, reply } => {
                let result = match self.require_idle("export") {
                    Ok(()) => {
                        let fs = self.deps.file_system.clone();
                        self.with_storage(move |storage| storage.export(&name, &path, fs.as_ref()))
                            .await
                    }
                    Err(err) => Err(err),
                };
                if result.is_ok() {
                    self.show_message("Macro exported");
                }
                self.reply(reply, result);
            }
            Request::Import { path, reply } => {
                let result = match self.require_idle("import") {
                    Ok(()) => {
                        let fs = self.deps.file_system.clone();
                        self.with_storage(move |storage| storage.import(&path, fs.as_ref()))
                            .await
                    }
                    Err(err) => Err(err),
                };
                if let Ok(imported) = &result {
                    self.show_message(&format!("Imported macro {}", imported.name));
                }
                self.reply(reply, result);
            }
            Request::LoadFinalState { name, reply } => {
                let result = match self.require_idle("load final state") {
                    Ok(()) => self.load_final_state(name).await,
                    Err(err) => Err(err),
                };
                self.reply(reply, result);
            }
        }
    }

    /// Replies, surfacing failures through the error hook.
    fn reply<T>(&self, reply: Reply<T>, result: Result<T, TyperError>) {
        if let Err(err) = &result {
            self.show_error(err);
        }
        let _ = reply.send(result);
    }

    // ── Recording ─────────────────────────────────────────────────────────────

    async fn start_recording(&mut self) -> Result<(), TyperError> {
        self.require_idle("record")?;
        if !self.deps.editor.has_active_document() {
            return Err(TyperError::NoActiveEditor);
        }
        self.process(Event::Record).await;
        Ok(())
    }

    fn end_recording(&mut self) -> Result<(), TyperError> {
        self.capturing_buffers()?;
        self.capture.deregister_recording();
        if let Some(context) = self.recording.as_mut() {
            context.buffer_tx = None;
        }
        append_run_log("info", "record.ending", json!({}));
        Ok(())
    }

    async fn cancel_recording(&mut self) -> Result<(), TyperError> {
        if !self.machine.state().is_recording() {
            return Err(TyperError::Unavailable("no recording in progress".to_string()));
        }
        self.capture.deregister_recording();
        let manager_tx = self.recording.as_mut().and_then(|context| {
            context.buffer_tx = None;
            context.manager_tx.take()
        });
        match manager_tx {
            Some(manager_tx) => {
                tokio::spawn(async move {
                    let _ = manager_tx.send(ManagerRequest::Cancel).await;
                });
            }
            None => {
                self.process(Event::DoneRecording(ExitReason::Cancelled))
                    .await
            }
        }
        Ok(())
    }

    fn capturing_buffers(&self) -> Result<mpsc::Sender<Buffer>, TyperError> {
        self.recording
            .as_ref()
            .filter(|_| self.is_capturing())
            .and_then(|context| context.buffer_tx.clone())
            .ok_or_else(|| TyperError::NoActiveRecording("not recording".to_string()))
    }

    fn manager_requests(&self) -> Result<mpsc::Sender<ManagerRequest>, TyperError> {
        self.recording
            .as_ref()
            .filter(|_| self.is_capturing())
            .and_then(|context| context.manager_tx.clone())
            .ok_or_else(|| TyperError::NoActiveRecording("not recording".to_string()))
    }

    fn is_capturing(&self) -> bool {
        matches!(
            self.machine.state(),
            SessionState::Recording(RecordingPhase::Recording | RecordingPhase::Resumed)
        )
    }

    fn snapshot(&self) -> Result<SavePoint, TyperError> {
        Ok(SavePoint {
            content: self.deps.editor.document_text(None)?,
            language: self.deps.editor.language(),
            selections: self.deps.editor.selections(),
        })
    }

    fn wire_recording(&mut self) -> Result<(), TyperError> {
        let list = match self.recording.as_mut().and_then(|context| context.list.take()) {
            Some(list) => list,
            None => BufferList::new(self.snapshot()?),
        };
        let (documents, documents_rx) = mpsc::channel(1);
        let (selections, selections_rx) = mpsc::channel(1);
        let (buffer_tx, buffer_rx) = mpsc::channel(1);
        let (manager_tx, manager_rx) = mpsc::channel(1);

        tokio::spawn(coordinator::run(
            documents_rx,
            selections_rx,
            buffer_tx.clone(),
        ));
        tokio::spawn(manager::run(
            list,
            manager_rx,
            buffer_rx,
            ManagerDeps {
                editor: self.deps.editor.clone(),
                prompter: self.deps.prompter.clone(),
                gate: self.capture.gate(),
                signals: self.signal_tx.clone(),
            },
        ));
        self.capture.register_recording(RecordingSink {
            documents,
            selections,
        });

        let context = self.recording.get_or_insert_with(RecordingContext::default);
        context.buffer_tx = Some(buffer_tx);
        context.manager_tx = Some(manager_tx);
        Ok(())
    }

    /// Freezes the recording and stores it. The live list is kept so the
    /// user can carry on after a failed save.
    async fn save_recording(&mut self) -> Result<Macro, TyperError> {
        let buffers = self
            .recording
            .as_ref()
            .and_then(|context| context.list.as_ref())
            .map(|list| list.buffers().to_vec())
            .ok_or_else(|| TyperError::NoActiveRecording("nothing recorded".to_string()))?;
        if buffers.len() < 2 {
            return Err(TyperError::EmptyRecording);
        }
        let add_ending_stop = needs_ending_decision(&buffers)
            && match self.ending_stop {
                EndingStopPolicy::Prompt => self.deps.prompter.add_ending_stop(),
                EndingStopPolicy::Always => true,
                EndingStopPolicy::Never => false,
            };
        let sealed = seal(&buffers, add_ending_stop, self.snapshot()?)?;
        let name = self
            .deps
            .prompter
            .macro_name()
            .filter(|name| !name.trim().is_empty())
            .ok_or(TyperError::SaveCancelled)?;
        let recorded = Macro {
            description: self.deps.prompter.macro_description(&name),
            name,
            buffers: sealed,
        };
        self.with_storage(move |storage| storage.save(recorded))
            .await
    }

    // ── Playing ───────────────────────────────────────────────────────────────

    async fn start_playing(&mut self, name: &str) -> Result<(), TyperError> {
        self.require_idle("play")?;
        let lookup = name.to_string();
        let recorded = self
            .with_storage(move |storage| storage.load(&lookup))
            .await?
            .filter(|recorded| !recorded.buffers.is_empty())
            .ok_or_else(|| TyperError::NoActiveRecording(name.to_string()))?;
        if !matches!(recorded.buffers.first(), Some(Buffer::SavePoint(_)))
            && !self.deps.editor.has_active_document()
        {
            return Err(TyperError::NoActiveEditor);
        }
        append_run_log(
            "info",
            "play.requested",
            json!({ "name": recorded.name, "buffers": recorded.buffers.len() }),
        );

        let (command_tx, command_rx) = mpsc::channel(1);
        let (control_tx, control_rx) = mpsc::channel(1);
        let (cancel_tx, _) = watch::channel(false);
        tokio::spawn(autoplay::run(self.interval, control_rx, command_tx.clone()));
        self.keys.set_mode(KeyMode::Manual);
        self.capture.register_playback(PlaybackSink {
            keys: self.keys.clone(),
            commands: command_tx,
            autoplay: control_tx.clone(),
            signals: self.signal_tx.clone(),
        });
        self.playing = Some(PlayingContext {
            pending: Some((recorded.buffers, command_rx)),
            control_tx,
            cancel_tx,
            drained: None,
        });
        self.process(Event::Play).await;
        Ok(())
    }

    fn launch_sequencer(&mut self) -> Result<(), TyperError> {
        let context = self
            .playing
            .as_mut()
            .ok_or_else(|| TyperError::NoActiveRecording("no macro loaded".to_string()))?;
        let (buffers, commands) = context
            .pending
            .take()
            .ok_or_else(|| TyperError::NoActiveRecording("no macro loaded".to_string()))?;
        let io = SequencerIo {
            commands,
            cancel: context.cancel_tx.subscribe(),
            signals: self.signal_tx.clone(),
        };
        let editor = self.deps.editor.clone();
        let signals = self.signal_tx.clone();
        let (drained_tx, drained_rx) = oneshot::channel();
        context.drained = Some(drained_rx);
        tokio::spawn(async move {
            let result = sequencer::run(buffers, editor, io).await;
            let _ = drained_tx.send(());
            let _ = signals.send(Signal::PlaybackFinished(result)).await;
        });
        self.deps
            .feedback
            .invoke(Hook::ShowMessage(self.keys.controls_legend()));
        Ok(())
    }

    async fn autoplay(&mut self, control: AutoplayControl) {
        match control {
            AutoplayControl::Play => self.keys.set_mode(KeyMode::Auto),
            AutoplayControl::Quit => self.keys.set_mode(KeyMode::Manual),
            AutoplayControl::Pause | AutoplayControl::Resume => {}
        }
        if let Some(context) = self.playing.as_ref() {
            let _ = context.control_tx.send(control).await;
        }
    }

    // ── Idle commands ─────────────────────────────────────────────────────────

    fn require_idle(&self, command: &str) -> Result<(), TyperError> {
        if self.machine.state().is_idle() {
            Ok(())
        } else {
            Err(TyperError::Unavailable(format!(
                "{command} is only available while idle ({})",
                self.machine.state().label()
            )))
        }
    }

    async fn delete_macros(&self, names: Vec<String>) -> Result<Vec<String>, TyperError> {
        let deleted = self
            .with_storage(move |storage| {
                let mut deleted = Vec::new();
                for name in names {
                    if storage.delete(&name)? {
                        deleted.push(name);
                    }
                }
                Ok(deleted)
            })
            .await?;
        self.show_message(&format!("Deleted {} macro(s)", deleted.len()));
        Ok(deleted)
    }

    async fn load_final_state(&self, name: String) -> Result<bool, TyperError> {
        let lookup = name.clone();
        let recorded = self
            .with_storage(move |storage| storage.load(&lookup))
            .await?
            .ok_or(TyperError::NoActiveRecording(name))?;
        let Some(save) = recorded.final_save_point() else {
            self.show_message("No save point at end");
            return Ok(false);
        };
        self.deps.editor.open_document(&save.content, &save.language)?;
        self.deps.editor.set_selections(save.selections.clone())?;
        Ok(true)
    }

    async fn with_storage<T, F>(&self, call: F) -> Result<T, TyperError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MacroStorage) -> Result<T, TyperError> + Send + 'static,
    {
        let storage = self.deps.storage.clone();
        tokio::task::spawn_blocking(move || call(storage.as_ref()))
            .await
            .map_err(|e| TyperError::Storage(e.to_string()))?
    }

    // ── Statechart ────────────────────────────────────────────────────────────

    /// Runs `event` and everything it triggers to completion.
    async fn process(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let before = self.machine.state();
            let actions = match self.machine.dispatch(event) {
                Ok(actions) => actions,
                Err(err) => {
                    append_run_log(
                        "debug",
                        "session.event_ignored",
                        json!({ "error": err.to_string() }),
                    );
                    continue;
                }
            };
            append_run_log(
                "debug",
                "session.transition",
                json!({
                    "event": format!("{event:?}"),
                    "from": before.label(),
                    "to": self.machine.state().label(),
                    "actions": actions.iter().map(|a| format!("{a:?}")).collect::<Vec<_>>(),
                }),
            );
            for action in actions {
                if let Err(err) = self.perform(action, &mut queue).await {
                    append_run_log(
                        "warn",
                        "session.action_failed",
                        json!({ "action": format!("{action:?}"), "error": err.to_string() }),
                    );
                    self.show_error(&err);
                }
            }
            let after = self.machine.state();
            if after.label() != before.label() {
                self.deps
                    .feedback
                    .invoke(Hook::SetAppState(after.label().to_string()));
            }
            self.state_tx.send_replace(after);
        }
    }

    async fn perform(
        &mut self,
        action: Action,
        queue: &mut VecDeque<Event>,
    ) -> Result<(), TyperError> {
        match action {
            Action::EnableIdling | Action::DisableIdling => {}
            Action::EnableRecording => {
                self.recording = Some(RecordingContext {
                    list: Some(BufferList::new(self.snapshot()?)),
                    ..RecordingContext::default()
                });
            }
            Action::StartRecording | Action::ResumeRecording => {
                if let Err(err) = self.wire_recording() {
                    queue.push_back(Event::DoneRecording(ExitReason::Cancelled));
                    return Err(err);
                }
                self.show_message("Recording");
            }
            Action::SaveRecording => match self.save_recording().await {
                Ok(saved) => {
                    append_run_log(
                        "info",
                        "record.saved",
                        json!({ "name": saved.name, "buffers": saved.buffers.len() }),
                    );
                    self.show_message(&format!("Saved macro {}", saved.name));
                    queue.push_back(Event::RecordingSaved);
                }
                Err(err) => {
                    queue.push_back(Event::RecordingNotSaved);
                    return Err(err);
                }
            },
            Action::ContinueOrEndRecording => {
                queue.push_back(match self.deps.prompter.continue_or_end() {
                    ContinueDecision::Continue => Event::ResumeRecording,
                    ContinueDecision::End => Event::DoneRecording(ExitReason::Done),
                });
            }
            Action::DisableRecording => {
                self.capture.deregister_recording();
                self.recording = None;
            }
            Action::EnablePlaying => {}
            Action::StartPlaying => {
                if let Err(err) = self.launch_sequencer() {
                    queue.push_back(Event::DonePlaying);
                    return Err(err);
                }
            }
            Action::PlayPauseSound => self.play_sound(Sound::Pause),
            Action::PlayEndSound => self.play_sound(Sound::End),
            Action::StartAutoplay | Action::ResumeAutoplay => {
                self.autoplay(AutoplayControl::Play).await
            }
            Action::PauseAutoplay => self.autoplay(AutoplayControl::Pause).await,
            Action::StopAutoplay => self.autoplay(AutoplayControl::Quit).await,
            Action::DisablePlaying => {
                self.capture.deregister_playback();
                if let Some(context) = self.playing.take() {
                    let _ = context.cancel_tx.send(true);
                    // Hold the document until an in-flight edit is confirmed.
                    if let Some(drained) = context.drained {
                        let _ = drained.await;
                    }
                    append_run_log("debug", "play.drained", json!({}));
                }
            }
            Action::ToggleSilence => {
                self.silent = !self.silent;
                self.deps.feedback.invoke(Hook::SetSilent(self.silent));
            }
        }
        Ok(())
    }

    fn play_sound(&self, sound: Sound) {
        if !self.silent {
            self.deps.feedback.invoke(Hook::PlaySound(sound));
        }
    }

    fn show_message(&self, message: &str) {
        self.deps
            .feedback
            .invoke(Hook::ShowMessage(message.to_string()));
    }

    fn show_error(&self, err: &TyperError) {
        append_run_log("warn", "session.error", json!({ "error": err.to_string() }));
        self.deps.feedback.invoke(Hook::ShowError(err.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::Frame;
    use crate::edit::{EditOp, Position, SelectionSet};
    use crate::fsm::{AutoplayOn, AutoplayPhase, PlayingState, RunPhase};
    use crate::hooks::RecordedFeedback;
    use crate::macro_store::MemoryStorage;
    use crate::runtime::{FakeFileSystem, MemoryEditor, ScriptedPrompter};
    use std::sync::Mutex;

    struct Rig {
        handle: TyperHandle,
        editor: MemoryEditor,
        storage: MemoryStorage,
        prompter: ScriptedPrompter,
        feedback: RecordedFeedback,
    }

    fn rig(editor: MemoryEditor) -> Rig {
        let storage = MemoryStorage::default();
        let prompter = ScriptedPrompter::default();
        let feedback = RecordedFeedback::default();
        let mut config = AppConfig::default();
        config.playback.autoplay_interval_ms = 5;
        let handle = spawn_typer(
            &config,
            TyperDeps {
                editor: Arc::new(editor.clone()),
                storage: Arc::new(storage.clone()),
                prompter: Arc::new(prompter.clone()),
                feedback: Arc::new(feedback.clone()),
                file_system: Arc::new(FakeFileSystem::default()),
            },
        );
        editor.echo_to(handle.capture());
        Rig {
            handle,
            editor,
            storage,
            prompter,
            feedback,
        }
    }

    fn typed_macro(name: &str) -> Macro {
        let frame = |column: usize, text: &str| {
            Buffer::Frame(Frame {
                edits: vec![EditOp::Insert {
                    at: Position::new(0, column),
                    text: text.to_string(),
                }],
                selections: SelectionSet::cursor(Position::new(0, column + 1)),
            })
        };
        Macro {
            name: name.to_string(),
            description: String::new(),
            buffers: vec![
                Buffer::SavePoint(SavePoint {
                    content: String::new(),
                    language: "plaintext".to_string(),
                    selections: SelectionSet::cursor(Position::new(0, 0)),
                }),
                frame(0, "a"),
                frame(1, "b"),
                Buffer::StopPoint(StopPoint::default()),
                frame(2, "c"),
                Buffer::StopPoint(StopPoint::ending()),
            ],
        }
    }

    /// Applies edits at once but confirms them only when told to.
    #[derive(Clone, Default)]
    struct HeldEditor {
        inner: MemoryEditor,
        held: Arc<Mutex<Vec<oneshot::Sender<Result<(), TyperError>>>>>,
    }

    impl HeldEditor {
        fn held(&self) -> usize {
            self.held.lock().expect("held lock").len()
        }

        fn release_all(&self) {
            for reply in self.held.lock().expect("held lock").drain(..) {
                let _ = reply.send(Ok(()));
            }
        }
    }

    impl EditorSurface for HeldEditor {
        fn has_active_document(&self) -> bool {
            self.inner.has_active_document()
        }

        fn open_document(&self, content: &str, language: &str) -> Result<(), TyperError> {
            self.inner.open_document(content, language)
        }

        fn apply_edits(&self, ops: Vec<EditOp>) -> crate::runtime::EditConfirmation {
            drop(self.inner.apply_edits(ops));
            let (reply, confirmation) = oneshot::channel();
            self.held.lock().expect("held lock").push(reply);
            confirmation
        }

        fn selections(&self) -> SelectionSet {
            self.inner.selections()
        }

        fn set_selections(&self, selections: SelectionSet) -> Result<(), TyperError> {
            self.inner.set_selections(selections)
        }

        fn document_text(&self, range: Option<crate::edit::Range>) -> Result<String, TyperError> {
            self.inner.document_text(range)
        }

        fn language(&self) -> String {
            self.inner.language()
        }
    }

    #[tokio::test]
    async fn record_without_editor_stays_idle_and_reports() {
        let rig = rig(MemoryEditor::new());
        let err = rig.handle.record().await.expect_err("no editor");
        assert_eq!(err, TyperError::NoActiveEditor);
        assert!(rig.handle.state().is_idle());
        assert_eq!(rig.feedback.errors(), vec!["no active editor"]);
    }

    #[tokio::test]
    async fn recorded_typing_is_saved_with_ending_stop_and_snapshot() {
        let rig = rig(MemoryEditor::with_document("", "plaintext"));
        rig.prompter.push_name(Some("hello"));
        rig.handle.record().await.expect("record");
        rig.editor.user_type("h").await.expect("type");
        rig.editor.user_type("i").await.expect("type");
        rig.handle.end_recording().await.expect("end");
        rig.handle
            .wait_until(SessionState::is_idle)
            .await
            .expect("idle");

        let saved = rig.storage.load("hello").expect("load").expect("saved");
        assert_eq!(saved.frame_count(), 2);
        assert!(saved.buffers[saved.buffers.len() - 2].is_ending_stop());
        assert_eq!(
            saved.final_save_point().map(|save| save.content.as_str()),
            Some("hi")
        );
        assert_eq!(
            rig.prompter.asked(),
            vec!["save_or_discard", "add_ending_stop", "macro_name", "continue_or_end"]
        );
        assert!(rig.feedback.messages().contains(&"Saved macro hello".to_string()));
    }

    #[tokio::test]
    async fn escaped_name_prompt_returns_to_recording_without_losing_work() {
        let rig = rig(MemoryEditor::with_document("", "plaintext"));
        rig.prompter.push_name(None).push_name(Some("kept"));
        rig.handle.record().await.expect("record");
        rig.editor.user_type("x").await.expect("type");
        rig.handle.end_recording().await.expect("end");
        rig.handle
            .wait_until(|state| *state == SessionState::Recording(RecordingPhase::Recording))
            .await
            .expect("back to recording");
        assert!(rig.feedback.errors().contains(&"save cancelled".to_string()));

        rig.editor.user_type("y").await.expect("type");
        rig.handle.end_recording().await.expect("end again");
        rig.handle
            .wait_until(SessionState::is_idle)
            .await
            .expect("idle");
        let saved = rig.storage.load("kept").expect("load").expect("saved");
        assert_eq!(saved.frame_count(), 2);
    }

    #[tokio::test]
    async fn undo_during_recording_reverts_the_editor_and_the_list() {
        let rig = rig(MemoryEditor::with_document("", "plaintext"));
        rig.prompter.push_name(Some("undone"));
        rig.handle.record().await.expect("record");
        rig.editor.user_type("a").await.expect("type");
        rig.editor.user_type("b").await.expect("type");
        // Undo outranks queued input; let both frames land first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            rig.handle.undo().await.expect("undo"),
            UndoOutcome::Undone { removed: 1 }
        );
        assert_eq!(rig.editor.text().as_deref(), Some("a"));
        rig.handle.end_recording().await.expect("end");
        rig.handle
            .wait_until(SessionState::is_idle)
            .await
            .expect("idle");
        let saved = rig.storage.load("undone").expect("load").expect("saved");
        assert_eq!(saved.frame_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_recording_saves_nothing() {
        let rig = rig(MemoryEditor::with_document("", "plaintext"));
        rig.handle.record().await.expect("record");
        rig.editor.user_type("a").await.expect("type");
        rig.handle.cancel_recording().await.expect("cancel");
        rig.handle
            .wait_until(SessionState::is_idle)
            .await
            .expect("idle");
        assert!(rig.storage.list().expect("list").is_empty());
        assert!(rig.prompter.asked().is_empty());
    }

    #[tokio::test]
    async fn typed_keys_drive_playback_to_completion() {
        let rig = rig(MemoryEditor::new());
        rig.storage.save(typed_macro("abc")).expect("seed");
        rig.handle.play("abc").await.expect("play");
        let capture = rig.handle.capture();
        for key in ["x", "x", "x"] {
            assert!(capture.typed(key).await);
        }
        rig.handle
            .wait_until(|state| {
                matches!(
                    state,
                    SessionState::Playing(PlayingState {
                        run: RunPhase::Paused { at_end: false },
                        ..
                    })
                )
            })
            .await
            .expect("paused at stop");
        assert_eq!(rig.editor.text().as_deref(), Some("ab"));
        assert!(capture.typed("\n").await);
        assert!(capture.typed("x").await);
        assert!(capture.typed("x").await);
        rig.handle
            .wait_until(|state| {
                matches!(
                    state,
                    SessionState::Playing(PlayingState {
                        run: RunPhase::Paused { at_end: true },
                        ..
                    })
                )
            })
            .await
            .expect("paused at end");
        assert!(capture.typed("\n").await);
        rig.handle
            .wait_until(SessionState::is_idle)
            .await
            .expect("idle");
        assert_eq!(rig.editor.text().as_deref(), Some("abc"));
        assert!(rig.feedback.messages().contains(&"Done playing".to_string()));
        assert_eq!(rig.feedback.sounds(), vec![Sound::Pause, Sound::End]);
    }

    #[tokio::test]
    async fn autoplay_runs_to_the_ending_stop() {
        let rig = rig(MemoryEditor::new());
        rig.storage.save(typed_macro("abc")).expect("seed");
        rig.handle.play("abc").await.expect("play");
        let capture = rig.handle.capture();
        assert!(capture.typed("`").await);
        rig.handle
            .wait_until(|state| {
                matches!(
                    state,
                    SessionState::Playing(PlayingState {
                        run: RunPhase::Paused { at_end: false },
                        autoplay: AutoplayPhase::On(AutoplayOn::Paused),
                    })
                )
            })
            .await
            .expect("autoplay paused at stop");
        assert!(capture.typed("\n").await);
        rig.handle
            .wait_until(|state| {
                matches!(
                    state,
                    SessionState::Playing(PlayingState {
                        run: RunPhase::Paused { at_end: true },
                        autoplay: AutoplayPhase::Off,
                    })
                )
            })
            .await
            .expect("at end");
        assert_eq!(rig.editor.text().as_deref(), Some("abc"));
        assert!(capture.typed("\n").await);
        rig.handle
            .wait_until(SessionState::is_idle)
            .await
            .expect("idle");
    }

    #[tokio::test]
    async fn idle_commands_are_unavailable_while_playing() {
        let rig = rig(MemoryEditor::new());
        rig.storage.save(typed_macro("abc")).expect("seed");
        rig.handle.play("abc").await.expect("play");
        let err = rig.handle.list().await.expect_err("busy");
        assert!(matches!(err, TyperError::Unavailable(_)));
        assert!(rig.handle.toggle_silence().await.expect("silence"));
        rig.handle.cancel_playing().await.expect("cancel");
        assert!(rig.handle.state().is_idle());
        assert_eq!(rig.handle.list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn missing_macro_and_final_state_messages() {
        let rig = rig(MemoryEditor::new());
        let err = rig.handle.play("nope").await.expect_err("missing");
        assert!(matches!(err, TyperError::NoActiveRecording(_)));
        assert!(rig.handle.state().is_idle());

        rig.storage.save(typed_macro("abc")).expect("seed");
        assert!(!rig.handle.load_final_state("abc").await.expect("load"));
        assert!(rig
            .feedback
            .messages()
            .contains(&"No save point at end".to_string()));
        assert_eq!(
            rig.handle.delete(&["abc", "nope"]).await.expect("delete"),
            vec!["abc".to_string()]
        );
    }

    #[tokio::test]
    async fn cancel_waits_for_the_in_flight_edit_before_idling() {
        let editor = HeldEditor::default();
        let storage = MemoryStorage::default();
        storage.save(typed_macro("abc")).expect("seed");
        let handle = spawn_typer(
            &AppConfig::default(),
            TyperDeps {
                editor: Arc::new(editor.clone()),
                storage: Arc::new(storage),
                prompter: Arc::new(ScriptedPrompter::default()),
                feedback: Arc::new(RecordedFeedback::default()),
                file_system: Arc::new(FakeFileSystem::default()),
            },
        );
        handle.play("abc").await.expect("play");
        assert!(handle.capture().typed("x").await);
        while editor.held() == 0 {
            tokio::task::yield_now().await;
        }

        let cancelling = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.cancel_playing().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!cancelling.is_finished());
        assert!(handle.state().is_playing());

        editor.release_all();
        cancelling.await.expect("join").expect("cancel");
        assert!(handle.state().is_idle());
        assert_eq!(editor.inner.text().as_deref(), Some("a"));
    }
}
