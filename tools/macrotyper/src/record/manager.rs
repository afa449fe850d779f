use crate::buffers::{Buffer, BufferList, UndoPlan};
use crate::capture::CaptureGate;
use crate::document::TextDocument;
use crate::errors::TyperError;
use crate::logging::append_run_log;
use crate::runtime::{confirmed, EditorSurface, Prompter, SaveDecision};
use crate::session::{RecordingDecision, Signal};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOutcome {
    Undone { removed: usize },
    NothingToUndo,
}

#[derive(Debug)]
pub enum ManagerRequest {
    Undo {
        reply: oneshot::Sender<Result<UndoOutcome, TyperError>>,
    },
    Cancel,
}

pub struct ManagerDeps {
    pub editor: Arc<dyn EditorSurface>,
    pub prompter: Arc<dyn Prompter>,
    pub gate: CaptureGate,
    pub signals: mpsc::Sender<Signal>,
}

/// Owns the in-progress buffer list. Control requests are served ahead of
/// queued buffers. Hands the list back to the session once the buffer queue
/// closes or the recording is cancelled.
pub async fn run(
    mut list: BufferList,
    mut requests: mpsc::Receiver<ManagerRequest>,
    mut buffers: mpsc::Receiver<Buffer>,
    deps: ManagerDeps,
) {
    let mut requests_open = true;
    loop {
        tokio::select! {
            biased;
            request = requests.recv(), if requests_open => match request {
                Some(ManagerRequest::Undo { reply }) => {
                    let result = undo(&mut list, &deps).await;
                    if let Err(err) = &result {
                        let _ = deps.signals.send(Signal::Failure(err.clone())).await;
                    }
                    let _ = reply.send(result);
                }
                Some(ManagerRequest::Cancel) => {
                    list.clear();
                    append_run_log("info", "record.cancelled", json!({}));
                    close(list, RecordingDecision::Cancelled, &deps).await;
                    return;
                }
                // The session dropped its handle; keep draining buffers.
                None => requests_open = false,
            },
            buffer = buffers.recv() => match buffer {
                Some(buffer) => {
                    append_run_log(
                        "debug",
                        "record.buffer_appended",
                        json!({ "index": list.len(), "buffer": buffer.describe() }),
                    );
                    list.push(buffer);
                }
                None => {
                    let decision = match deps.prompter.save_or_discard() {
                        SaveDecision::Save => RecordingDecision::Save,
                        SaveDecision::Discard => RecordingDecision::Discard,
                    };
                    close(list, decision, &deps).await;
                    return;
                }
            },
        }
    }
}

async fn close(list: BufferList, decision: RecordingDecision, deps: &ManagerDeps) {
    append_run_log(
        "info",
        "record.closed",
        json!({ "buffers": list.len(), "decision": format!("{decision:?}") }),
    );
    let _ = deps
        .signals
        .send(Signal::RecordingClosed { list, decision })
        .await;
}

async fn undo(list: &mut BufferList, deps: &ManagerDeps) -> Result<UndoOutcome, TyperError> {
    let Some(plan) = list.plan_undo() else {
        append_run_log("debug", "record.undo.nothing", json!({ "buffers": list.len() }));
        return Ok(UndoOutcome::NothingToUndo);
    };

    let _suspended = deps.gate.suspend();
    let _ = check_live_document(&plan, deps.editor.as_ref());
    confirmed(deps.editor.apply_edits(plan.inverse.clone())).await?;
    list.commit_undo(&plan);
    deps.editor.set_selections(plan.selections.clone())?;

    append_run_log(
        "info",
        "record.undo",
        json!({ "removed": plan.removed, "remaining": list.len() }),
    );
    Ok(UndoOutcome::Undone {
        removed: plan.removed,
    })
}

/// Compares every inverse op's expected text with the live document, walking
/// the inverse in order on a copy. Returns how many ops diverged.
fn check_live_document(plan: &UndoPlan, editor: &dyn EditorSurface) -> usize {
    let live = match editor.document_text(None) {
        Ok(text) => text,
        Err(err) => {
            append_run_log(
                "warn",
                "record.undo.document_diverged",
                json!({ "error": err.to_string() }),
            );
            return plan.expected.len();
        }
    };
    let mut walk = TextDocument::new(live, editor.language());
    let mut diverged = 0;
    for (op, (range, expected)) in plan.inverse.iter().zip(&plan.expected) {
        let found = walk.apply(op);
        if &found != expected {
            diverged += 1;
            append_run_log(
                "warn",
                "record.undo.document_diverged",
                json!({ "range": range.to_string(), "expected": expected, "live": found }),
            );
        }
    }
    diverged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::{Frame, SavePoint, StopPoint};
    use crate::capture::CaptureRouter;
    use crate::edit::{EditOp, Position, Range, SelectionSet};
    use crate::runtime::{MemoryEditor, ScriptedPrompter};

    fn initial(content: &str) -> SavePoint {
        SavePoint {
            content: content.to_string(),
            language: "plaintext".to_string(),
            selections: SelectionSet::cursor(Position::new(0, 0)),
        }
    }

    fn insert(column: usize, text: &str) -> Buffer {
        Buffer::Frame(Frame {
            edits: vec![EditOp::Insert {
                at: Position::new(0, column),
                text: text.to_string(),
            }],
            selections: SelectionSet::cursor(Position::new(0, column + text.len())),
        })
    }

    struct Running {
        requests: mpsc::Sender<ManagerRequest>,
        buffers: mpsc::Sender<Buffer>,
        signals: mpsc::Receiver<Signal>,
    }

    fn start(
        editor: &MemoryEditor,
        prompter: &ScriptedPrompter,
        router: &CaptureRouter,
    ) -> Running {
        let (requests, requests_rx) = mpsc::channel(1);
        let (buffers, buffers_rx) = mpsc::channel(1);
        let (signals_tx, signals) = mpsc::channel(8);
        let text = editor.text().unwrap_or_default();
        tokio::spawn(run(
            BufferList::new(initial(&text)),
            requests_rx,
            buffers_rx,
            ManagerDeps {
                editor: Arc::new(editor.clone()),
                prompter: Arc::new(prompter.clone()),
                gate: router.gate(),
                signals: signals_tx,
            },
        ));
        Running {
            requests,
            buffers,
            signals,
        }
    }

    async fn request_undo(running: &Running) -> Result<UndoOutcome, TyperError> {
        let (reply, rx) = oneshot::channel();
        running
            .requests
            .send(ManagerRequest::Undo { reply })
            .await
            .expect("send undo");
        rx.await.expect("undo reply")
    }

    async fn typed(editor: &MemoryEditor, running: &Running, column: usize, text: &str) {
        editor.user_type(text).await.expect("type");
        running.buffers.send(insert(column, text)).await.expect("push");
        // The slot frees once the manager has taken the frame.
        drop(running.buffers.reserve().await.expect("drained"));
    }

    #[tokio::test]
    async fn undo_reverts_last_frame_and_restores_selection() {
        let editor = MemoryEditor::with_document("", "plaintext");
        let router = CaptureRouter::new();
        let running = start(&editor, &ScriptedPrompter::default(), &router);
        typed(&editor, &running, 0, "a").await;
        typed(&editor, &running, 1, "b").await;

        let outcome = request_undo(&running).await.expect("undo");
        assert_eq!(outcome, UndoOutcome::Undone { removed: 1 });
        assert_eq!(editor.text().as_deref(), Some("a"));
        assert_eq!(editor.selections(), SelectionSet::cursor(Position::new(0, 1)));
        assert!(!router.gate().is_suspended());
    }

    #[tokio::test]
    async fn undo_with_only_the_initial_save_point_is_a_no_op() {
        let editor = MemoryEditor::with_document("seed", "plaintext");
        let router = CaptureRouter::new();
        let running = start(&editor, &ScriptedPrompter::default(), &router);
        running
            .buffers
            .send(Buffer::StopPoint(StopPoint::default()))
            .await
            .expect("stop");
        assert_eq!(
            request_undo(&running).await.expect("undo"),
            UndoOutcome::NothingToUndo
        );
        assert_eq!(editor.text().as_deref(), Some("seed"));
        assert!(editor.applied().is_empty());
    }

    #[tokio::test]
    async fn rejected_inverse_keeps_the_frame_and_signals_failure() {
        let editor = MemoryEditor::with_document("", "plaintext");
        let router = CaptureRouter::new();
        let mut running = start(&editor, &ScriptedPrompter::default(), &router);
        typed(&editor, &running, 0, "a").await;
        editor.set_fail_next(TyperError::EditApplicationFailed("locked".to_string()));

        let err = request_undo(&running).await.expect_err("rejected");
        assert!(matches!(err, TyperError::EditApplicationFailed(_)));
        assert!(matches!(
            running.signals.recv().await,
            Some(Signal::Failure(TyperError::EditApplicationFailed(_)))
        ));
        assert_eq!(
            request_undo(&running).await.expect("retry"),
            UndoOutcome::Undone { removed: 1 }
        );
        assert_eq!(editor.text().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn closed_buffer_queue_asks_to_save_and_hands_back_the_list() {
        let editor = MemoryEditor::with_document("", "plaintext");
        let prompter = ScriptedPrompter::default();
        prompter.push_save(SaveDecision::Discard);
        let router = CaptureRouter::new();
        let mut running = start(&editor, &prompter, &router);
        typed(&editor, &running, 0, "a").await;
        drop(running.buffers);

        match running.signals.recv().await {
            Some(Signal::RecordingClosed { list, decision }) => {
                assert_eq!(decision, RecordingDecision::Discard);
                assert_eq!(list.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(prompter.asked(), vec!["save_or_discard"]);
    }

    #[tokio::test]
    async fn cancel_clears_the_list_without_prompting() {
        let editor = MemoryEditor::with_document("", "plaintext");
        let prompter = ScriptedPrompter::default();
        let router = CaptureRouter::new();
        let mut running = start(&editor, &prompter, &router);
        typed(&editor, &running, 0, "a").await;
        running
            .requests
            .send(ManagerRequest::Cancel)
            .await
            .expect("cancel");

        match running.signals.recv().await {
            Some(Signal::RecordingClosed { list, decision }) => {
                assert_eq!(decision, RecordingDecision::Cancelled);
                assert!(list.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(prompter.asked().is_empty());
    }

    #[test]
    fn divergence_is_checked_for_every_inverse_op() {
        let editor = MemoryEditor::with_document("xyz", "plaintext");
        let delete = |from: usize, to: usize| EditOp::Delete {
            range: Range::new(Position::new(0, from), Position::new(0, to)),
        };
        let span =
            |from: usize, to: usize| Range::new(Position::new(0, from), Position::new(0, to));
        let plan = UndoPlan {
            truncate_to: 1,
            removed: 1,
            inverse: vec![delete(2, 3), delete(0, 1)],
            expected: vec![
                (span(2, 3), "z".to_string()),
                (span(0, 1), "q".to_string()),
            ],
            selections: SelectionSet::cursor(Position::new(0, 0)),
        };

        assert_eq!(check_live_document(&plan, &editor), 1);
        assert_eq!(editor.text().as_deref(), Some("xyz"));
    }
}
