use crate::buffers::{Buffer, Frame};
use crate::edit::{ContentChange, EditOp, SelectionSet};
use crate::logging::append_run_log;
use serde_json::json;
use tokio::sync::mpsc;

enum Intake {
    Document(Vec<ContentChange>),
    Selection(SelectionSet),
    Closed,
}

/// Turns raw editor notifications into buffers.
///
/// A document change is held until its selection change arrives; each edit
/// in the notification then becomes its own frame carrying that selection.
/// A selection change on its own becomes a selection-only frame. Pending
/// document changes are taken first so a queued pair is never split. Returns
/// when either input closes, which closes `buffers` behind it.
pub async fn run(
    mut documents: mpsc::Receiver<Vec<ContentChange>>,
    mut selections: mpsc::Receiver<SelectionSet>,
    buffers: mpsc::Sender<Buffer>,
) {
    loop {
        let intake = tokio::select! {
            biased;
            changes = documents.recv() => changes.map_or(Intake::Closed, Intake::Document),
            selection = selections.recv() => selection.map_or(Intake::Closed, Intake::Selection),
        };

        let frames = match intake {
            Intake::Closed => break,
            Intake::Selection(selection) => vec![Frame::selection_only(selection)],
            Intake::Document(changes) => {
                let Some(selection) = selections.recv().await else {
                    break;
                };
                frames_for(changes, selection)
            }
        };

        for frame in frames {
            append_run_log(
                "debug",
                "record.frame",
                json!({ "edits": frame.edits.len(), "selections": frame.selections.describe() }),
            );
            if buffers.send(Buffer::Frame(frame)).await.is_err() {
                return;
            }
        }
    }
    append_run_log("debug", "record.intake_closed", json!({}));
}

/// Simultaneous changes all address the pre-edit document. Emitting them
/// back to front keeps every later frame's range valid when the frames are
/// applied one after another.
fn frames_for(mut changes: Vec<ContentChange>, selection: SelectionSet) -> Vec<Frame> {
    if changes.is_empty() {
        return vec![Frame::selection_only(selection)];
    }
    changes.sort_by(|a, b| b.range.start().cmp(&a.range.start()));
    changes
        .into_iter()
        .map(|change| Frame {
            edits: vec![EditOp::from_change(change)],
            selections: selection.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::{Position, Range};

    struct Inputs {
        documents: mpsc::Sender<Vec<ContentChange>>,
        selections: mpsc::Sender<SelectionSet>,
        buffers: mpsc::Receiver<Buffer>,
    }

    fn start() -> Inputs {
        let (documents, doc_rx) = mpsc::channel(1);
        let (selections, sel_rx) = mpsc::channel(1);
        let (buffer_tx, buffers) = mpsc::channel(1);
        tokio::spawn(run(doc_rx, sel_rx, buffer_tx));
        Inputs {
            documents,
            selections,
            buffers,
        }
    }

    fn insert(line: usize, column: usize, text: &str) -> ContentChange {
        ContentChange {
            range: Range::empty(Position::new(line, column)),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn document_change_waits_for_its_selection() {
        let mut inputs = start();
        inputs
            .documents
            .send(vec![insert(0, 0, "a")])
            .await
            .expect("doc");
        let cursor = SelectionSet::cursor(Position::new(0, 1));
        inputs.selections.send(cursor.clone()).await.expect("sel");

        let Some(Buffer::Frame(frame)) = inputs.buffers.recv().await else {
            panic!("expected a frame");
        };
        assert_eq!(frame.selections, cursor);
        assert_eq!(
            frame.edits,
            vec![EditOp::Insert {
                at: Position::new(0, 0),
                text: "a".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn multi_edit_notification_splits_into_frames_in_order() {
        let mut inputs = start();
        inputs
            .documents
            .send(vec![insert(2, 0, "y"), insert(0, 0, "x")])
            .await
            .expect("doc");
        inputs
            .selections
            .send(SelectionSet::cursor(Position::new(0, 1)))
            .await
            .expect("sel");

        let mut lines = Vec::new();
        for _ in 0..2 {
            match inputs.buffers.recv().await {
                Some(Buffer::Frame(frame)) => lines.push(frame.edits[0].removed_range().start().line),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(lines, vec![2, 0]);
    }

    #[tokio::test]
    async fn ascending_simultaneous_changes_replay_against_the_original_text() {
        let mut inputs = start();
        inputs
            .documents
            .send(vec![insert(0, 0, "x"), insert(0, 5, "y")])
            .await
            .expect("doc");
        inputs
            .selections
            .send(SelectionSet::cursor(Position::new(0, 7)))
            .await
            .expect("sel");

        let mut document = crate::document::TextDocument::new("hello world", "plaintext");
        for _ in 0..2 {
            match inputs.buffers.recv().await {
                Some(Buffer::Frame(frame)) => {
                    document.apply_all(&frame.edits);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(document.text(), "xhelloy world");
    }

    #[tokio::test]
    async fn lone_selection_becomes_selection_only_frame() {
        let mut inputs = start();
        let selection = SelectionSet::cursor(Position::new(3, 4));
        inputs.selections.send(selection.clone()).await.expect("sel");
        assert_eq!(
            inputs.buffers.recv().await,
            Some(Buffer::Frame(Frame::selection_only(selection)))
        );
    }

    #[tokio::test]
    async fn closing_an_input_closes_the_buffer_queue() {
        let mut inputs = start();
        drop(inputs.documents);
        assert_eq!(inputs.buffers.recv().await, None);
        drop(inputs.selections);
    }
}
