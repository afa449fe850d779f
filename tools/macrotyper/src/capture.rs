use crate::edit::{ContentChange, SelectionSet};
use crate::fsm::Event;
use crate::play::autoplay::AutoplayControl;
use crate::play::keys::{KeyAction, KeyMode, KeyRouter};
use crate::play::sequencer::StepCommand;
use crate::session::Signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Intake side of a recording session.
#[derive(Debug, Clone)]
pub struct RecordingSink {
    pub documents: mpsc::Sender<Vec<ContentChange>>,
    pub selections: mpsc::Sender<SelectionSet>,
}

/// Intake side of a playback session.
#[derive(Debug, Clone)]
pub struct PlaybackSink {
    pub keys: KeyRouter,
    pub commands: mpsc::Sender<StepCommand>,
    pub autoplay: mpsc::Sender<AutoplayControl>,
    pub signals: mpsc::Sender<Signal>,
}

#[derive(Debug, Default)]
struct Sinks {
    recording: Option<RecordingSink>,
    playback: Option<PlaybackSink>,
}

/// Delivers host editor notifications to whichever session sink is
/// registered. Input with no sink, or arriving while capture is suspended,
/// is dropped and reported as not delivered.
#[derive(Debug, Clone, Default)]
pub struct CaptureRouter {
    sinks: Arc<Mutex<Sinks>>,
    suspended: Arc<AtomicBool>,
}

impl CaptureRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_recording(&self, sink: RecordingSink) {
        self.sinks.lock().expect("capture lock").recording = Some(sink);
    }

    pub fn deregister_recording(&self) {
        self.sinks.lock().expect("capture lock").recording = None;
    }

    pub fn register_playback(&self, sink: PlaybackSink) {
        self.sinks.lock().expect("capture lock").playback = Some(sink);
    }

    pub fn deregister_playback(&self) {
        self.sinks.lock().expect("capture lock").playback = None;
    }

    pub fn gate(&self) -> CaptureGate {
        CaptureGate {
            suspended: self.suspended.clone(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.sinks.lock().expect("capture lock").recording.is_some()
    }

    pub async fn document_changed(&self, changes: Vec<ContentChange>) -> bool {
        let Some(sink) = self.recording_sink() else {
            return false;
        };
        sink.documents.send(changes).await.is_ok()
    }

    pub async fn selection_changed(&self, selections: SelectionSet) -> bool {
        let Some(sink) = self.recording_sink() else {
            return false;
        };
        sink.selections.send(selections).await.is_ok()
    }

    /// A key typed while a macro plays. Nothing reaches the document.
    pub async fn typed(&self, text: &str) -> bool {
        let sink = self.sinks.lock().expect("capture lock").playback.clone();
        let Some(sink) = sink else {
            return false;
        };
        match sink.keys.route(text) {
            KeyAction::Step(command) => sink.commands.send(command).await.is_ok(),
            KeyAction::StartAutoplay => {
                sink.keys.set_mode(KeyMode::Auto);
                sink.signals
                    .send(Signal::Transition(Event::AutoplayStarted))
                    .await
                    .is_ok()
            }
            KeyAction::PauseAutoplay => {
                sink.keys.set_mode(KeyMode::Manual);
                sink.signals
                    .send(Signal::Transition(Event::AutoplayPaused))
                    .await
                    .is_ok()
            }
            KeyAction::ResumeAutoplay => sink
                .autoplay
                .send(AutoplayControl::Resume)
                .await
                .is_ok(),
            KeyAction::Ignore => true,
        }
    }

    fn recording_sink(&self) -> Option<RecordingSink> {
        if self.suspended.load(Ordering::SeqCst) {
            return None;
        }
        self.sinks.lock().expect("capture lock").recording.clone()
    }
}

/// Suspends recording intake while the session itself edits the document.
#[derive(Debug, Clone)]
pub struct CaptureGate {
    suspended: Arc<AtomicBool>,
}

impl CaptureGate {
    pub fn suspend(&self) -> SuspendGuard {
        self.suspended.store(true, Ordering::SeqCst);
        SuspendGuard {
            suspended: self.suspended.clone(),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}

/// Resumes intake on drop.
#[derive(Debug)]
pub struct SuspendGuard {
    suspended: Arc<AtomicBool>,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.suspended.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::{Position, Range};

    fn recording(router: &CaptureRouter) -> (mpsc::Receiver<Vec<ContentChange>>, mpsc::Receiver<SelectionSet>) {
        let (documents, doc_rx) = mpsc::channel(1);
        let (selections, sel_rx) = mpsc::channel(1);
        router.register_recording(RecordingSink {
            documents,
            selections,
        });
        (doc_rx, sel_rx)
    }

    #[tokio::test]
    async fn unregistered_input_is_dropped() {
        let router = CaptureRouter::new();
        assert!(!router.selection_changed(SelectionSet::default()).await);
        assert!(!router.typed("x").await);
    }

    #[tokio::test]
    async fn suspended_gate_drops_changes_until_guard_ends() {
        let router = CaptureRouter::new();
        let (mut docs, _sels) = recording(&router);
        let change = ContentChange {
            range: Range::empty(Position::new(0, 0)),
            text: "a".to_string(),
        };
        {
            let _guard = router.gate().suspend();
            assert!(router.gate().is_suspended());
            assert!(!router.document_changed(vec![change.clone()]).await);
        }
        assert!(router.document_changed(vec![change.clone()]).await);
        assert_eq!(docs.recv().await, Some(vec![change]));
        router.deregister_recording();
        assert!(!router.is_recording());
    }

    #[tokio::test]
    async fn typed_keys_route_by_mode() {
        let router = CaptureRouter::new();
        let (commands, mut commands_rx) = mpsc::channel(4);
        let (autoplay, mut autoplay_rx) = mpsc::channel(4);
        let (signals, mut signals_rx) = mpsc::channel(4);
        let keys = KeyRouter::new('\n', '`');
        router.register_playback(PlaybackSink {
            keys: keys.clone(),
            commands,
            autoplay,
            signals,
        });

        assert!(router.typed("q").await);
        assert_eq!(commands_rx.recv().await, Some(StepCommand::Advance));
        assert!(router.typed("`").await);
        assert_eq!(keys.mode(), KeyMode::Auto);
        assert!(matches!(
            signals_rx.recv().await,
            Some(Signal::Transition(Event::AutoplayStarted))
        ));
        assert!(router.typed("q").await);
        assert!(commands_rx.try_recv().is_err());
        assert!(router.typed("\n").await);
        assert_eq!(autoplay_rx.recv().await, Some(AutoplayControl::Resume));
        assert!(router.typed("`").await);
        assert_eq!(keys.mode(), KeyMode::Manual);
    }
}
