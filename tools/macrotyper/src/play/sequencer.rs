use crate::buffers::{Buffer, Frame};
use crate::errors::TyperError;
use crate::fsm::Event;
use crate::logging::append_run_log;
use crate::runtime::{confirmed, EditorSurface};
use crate::session::Signal;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCommand {
    Advance,
    Breakout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackReport {
    pub outcome: PlaybackOutcome,
    pub frames_applied: usize,
    pub stop_points_passed: usize,
    pub failed_edits: usize,
}

impl PlaybackReport {
    fn new() -> Self {
        Self {
            outcome: PlaybackOutcome::Completed,
            frames_applied: 0,
            stop_points_passed: 0,
            failed_edits: 0,
        }
    }

    fn finish(mut self, outcome: PlaybackOutcome) -> Self {
        self.outcome = outcome;
        append_run_log(
            "info",
            "play.finished",
            json!({
                "outcome": format!("{outcome:?}"),
                "frames_applied": self.frames_applied,
                "stop_points_passed": self.stop_points_passed,
                "failed_edits": self.failed_edits,
            }),
        );
        self
    }
}

/// Channels a running sequencer listens and reports on.
pub struct SequencerIo {
    pub commands: mpsc::Receiver<StepCommand>,
    pub cancel: watch::Receiver<bool>,
    pub signals: mpsc::Sender<Signal>,
}

enum Wake {
    Cancelled,
    Command(StepCommand),
}

/// Walks `buffers` one step command at a time, driving `editor`.
pub async fn run(
    buffers: Vec<Buffer>,
    editor: Arc<dyn EditorSurface>,
    mut io: SequencerIo,
) -> Result<PlaybackReport, TyperError> {
    let walk = walked_buffers(buffers);
    match walk.first() {
        Some(Buffer::SavePoint(save)) => {
            editor.open_document(&save.content, &save.language)?;
            editor.set_selections(save.selections.clone())?;
        }
        _ if !editor.has_active_document() => return Err(TyperError::NoActiveEditor),
        _ => {}
    }
    let ending = ending_index(&walk);
    let mut cursor = usize::from(matches!(walk.first(), Some(Buffer::SavePoint(_))));
    let mut report = PlaybackReport::new();

    append_run_log(
        "info",
        "play.started",
        json!({ "buffers": walk.len(), "ending": ending }),
    );

    loop {
        while matches!(walk.get(cursor), Some(Buffer::SavePoint(_))) {
            cursor += 1;
        }
        let Some(buffer) = walk.get(cursor) else {
            append_run_log(
                "debug",
                "play.exhausted",
                json!({ "reason": TyperError::BufferListExhausted.to_string() }),
            );
            return Ok(report.finish(PlaybackOutcome::Completed));
        };

        let command = match next_wake(&mut io).await {
            Wake::Cancelled => return Ok(report.finish(PlaybackOutcome::Cancelled)),
            Wake::Command(command) => command,
        };

        match buffer {
            Buffer::Frame(frame) => {
                match apply_frame(frame, editor.as_ref(), &mut io.cancel).await {
                    FrameResult::Applied => report.frames_applied += 1,
                    FrameResult::Failed(err) => {
                        report.failed_edits += 1;
                        append_run_log(
                            "warn",
                            "play.edit_failed",
                            json!({ "cursor": cursor, "error": err.to_string() }),
                        );
                        let _ = io.signals.send(Signal::Failure(err)).await;
                    }
                    FrameResult::Cancelled => {
                        return Ok(report.finish(PlaybackOutcome::Cancelled))
                    }
                }
                cursor += 1;
            }
            Buffer::StopPoint(_) if Some(cursor) == ending => {
                if command == StepCommand::Breakout {
                    report.stop_points_passed += 1;
                    return Ok(report.finish(PlaybackOutcome::Completed));
                }
                let _ = io
                    .signals
                    .send(Signal::Transition(Event::PlayPausedAtEnd))
                    .await;
            }
            Buffer::StopPoint(_) => {
                if command == StepCommand::Breakout {
                    report.stop_points_passed += 1;
                    cursor += 1;
                    let _ = io.signals.send(Signal::Transition(Event::ResumePlay)).await;
                } else {
                    let _ = io.signals.send(Signal::Transition(Event::PlayPaused)).await;
                }
            }
            Buffer::SavePoint(_) => cursor += 1,
        }
        append_run_log(
            "debug",
            "play.step",
            json!({ "command": format!("{command:?}"), "cursor": cursor }),
        );
    }
}

fn walked_buffers(mut buffers: Vec<Buffer>) -> Vec<Buffer> {
    if buffers.len() > 1 && matches!(buffers.last(), Some(Buffer::SavePoint(_))) {
        buffers.pop();
    }
    buffers
}

fn ending_index(walk: &[Buffer]) -> Option<usize> {
    walk.iter()
        .position(Buffer::is_ending_stop)
        .or_else(|| match walk.last() {
            Some(Buffer::StopPoint(_)) => Some(walk.len() - 1),
            _ => None,
        })
}

/// Resolves once cancellation is requested or the controller is gone. The
/// watch borrow is released before returning.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

async fn next_wake(io: &mut SequencerIo) -> Wake {
    tokio::select! {
        biased;
        () = cancelled(&mut io.cancel) => Wake::Cancelled,
        command = io.commands.recv() => match command {
            Some(command) => Wake::Command(command),
            None => Wake::Cancelled,
        },
    }
}

enum FrameResult {
    Applied,
    Failed(TyperError),
    Cancelled,
}

async fn apply_frame(
    frame: &Frame,
    editor: &dyn EditorSurface,
    cancel: &mut watch::Receiver<bool>,
) -> FrameResult {
    let mut confirmation = std::pin::pin!(confirmed(editor.apply_edits(frame.edits.clone())));
    let result = tokio::select! {
        biased;
        () = cancelled(cancel) => {
            // The edit is already in flight; let it land before teardown.
            let _ = confirmation.as_mut().await;
            return FrameResult::Cancelled;
        }
        result = confirmation.as_mut() => result,
    };
    if let Err(err) = result {
        return FrameResult::Failed(err);
    }
    match editor.set_selections(frame.selections.clone()) {
        Ok(()) => FrameResult::Applied,
        Err(err) => FrameResult::Failed(err),
    }
}
