use crate::document::TextDocument;
use crate::edit::{invert_all, EditOp, Range, SelectionSet};
use crate::errors::TyperError;
use serde::{Deserialize, Serialize};

/// Full-document snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavePoint {
    pub content: String,
    pub language: String,
    pub selections: SelectionSet,
}

/// Pause marker. Carries no edits and no selection of its own.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StopPoint {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ending: bool,
}

impl StopPoint {
    pub fn named(name: Option<String>) -> Self {
        Self {
            name,
            ending: false,
        }
    }

    pub fn ending() -> Self {
        Self {
            name: None,
            ending: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub edits: Vec<EditOp>,
    pub selections: SelectionSet,
}

impl Frame {
    pub fn selection_only(selections: SelectionSet) -> Self {
        Self {
            edits: Vec::new(),
            selections,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Buffer {
    SavePoint(SavePoint),
    StopPoint(StopPoint),
    Frame(Frame),
}

impl Buffer {
    /// Selections this buffer establishes. Stop points inherit theirs.
    pub fn selections(&self) -> Option<&SelectionSet> {
        match self {
            Self::SavePoint(save) => Some(&save.selections),
            Self::Frame(frame) => Some(&frame.selections),
            Self::StopPoint(_) => None,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Self::StopPoint(_))
    }

    pub fn is_ending_stop(&self) -> bool {
        matches!(self, Self::StopPoint(stop) if stop.ending)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::SavePoint(save) => format!(
                "save point: {} chars of {}, {}",
                save.content.chars().count(),
                save.language,
                save.selections.describe()
            ),
            Self::StopPoint(stop) => {
                let label = if stop.ending { "ending stop" } else { "stop" };
                match &stop.name {
                    Some(name) => format!("{label} {name:?}"),
                    None => label.to_string(),
                }
            }
            Self::Frame(frame) if frame.edits.is_empty() => {
                format!("move: {}", frame.selections.describe())
            }
            Self::Frame(frame) => {
                let edits = frame
                    .edits
                    .iter()
                    .map(EditOp::describe)
                    .collect::<Vec<_>>()
                    .join("; ");
                format!("edit: {edits}; {}", frame.selections.describe())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macro {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub buffers: Vec<Buffer>,
}

impl Macro {
    /// Trailing snapshot, when the macro was saved with one.
    pub fn final_save_point(&self) -> Option<&SavePoint> {
        match self.buffers.last() {
            Some(Buffer::SavePoint(save)) if self.buffers.len() > 1 => Some(save),
            _ => None,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.buffers
            .iter()
            .filter(|buffer| matches!(buffer, Buffer::Frame(_)))
            .count()
    }

    pub fn validate(&self) -> Result<(), TyperError> {
        if self.name.trim().is_empty() {
            return Err(TyperError::Storage("macro name must not be empty".to_string()));
        }
        match self.buffers.first() {
            Some(Buffer::SavePoint(_)) => {}
            Some(_) => {
                return Err(TyperError::Storage(format!(
                    "macro {:?} does not start with a save point",
                    self.name
                )))
            }
            None => return Err(TyperError::NoActiveRecording(self.name.clone())),
        }
        let endings = self
            .buffers
            .iter()
            .filter(|buffer| buffer.is_ending_stop())
            .count();
        if endings > 1 {
            return Err(TyperError::Storage(format!(
                "macro {:?} has {endings} ending stop points",
                self.name
            )));
        }
        Ok(())
    }
}

/// Seals a copy of a recording for storage. A trailing stop point becomes
/// the ending stop; otherwise one is appended when `add_ending_stop` is set.
/// `snapshot` lands last.
pub fn seal(
    buffers: &[Buffer],
    add_ending_stop: bool,
    snapshot: SavePoint,
) -> Result<Vec<Buffer>, TyperError> {
    if buffers.len() < 2 {
        return Err(TyperError::EmptyRecording);
    }
    let mut sealed = buffers.to_vec();
    for buffer in sealed.iter_mut() {
        if let Buffer::StopPoint(stop) = buffer {
            stop.ending = false;
        }
    }
    match sealed.last_mut() {
        Some(Buffer::StopPoint(stop)) => stop.ending = true,
        _ if add_ending_stop => sealed.push(Buffer::StopPoint(StopPoint::ending())),
        _ => {}
    }
    sealed.push(Buffer::SavePoint(snapshot));
    Ok(sealed)
}

/// True when sealing would need a decision about adding an ending stop.
pub fn needs_ending_decision(buffers: &[Buffer]) -> bool {
    !matches!(buffers.last(), Some(Buffer::StopPoint(_)))
}

// ── In-progress recording ─────────────────────────────────────────────────────

/// What one undo removes and how to revert it on the live document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoPlan {
    pub truncate_to: usize,
    pub removed: usize,
    pub inverse: Vec<EditOp>,
    /// For each inverse op, the range it removes and the text expected there.
    pub expected: Vec<(Range, String)>,
    pub selections: SelectionSet,
}

/// The mutable buffer list of a recording in progress.
///
/// A shadow document tracks the text the recording has produced so far, so
/// that each frame's displaced text is known at append time.
#[derive(Debug, Clone)]
pub struct BufferList {
    buffers: Vec<Buffer>,
    displaced: Vec<Vec<String>>,
    shadow: TextDocument,
}

impl BufferList {
    pub fn new(initial: SavePoint) -> Self {
        let shadow = TextDocument::new(initial.content.clone(), initial.language.clone());
        Self {
            buffers: vec![Buffer::SavePoint(initial)],
            displaced: vec![Vec::new()],
            shadow,
        }
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn shadow(&self) -> &TextDocument {
        &self.shadow
    }

    pub fn push(&mut self, buffer: Buffer) {
        let displaced = match &buffer {
            Buffer::Frame(frame) => self.shadow.apply_all(&frame.edits),
            Buffer::SavePoint(save) => {
                self.shadow.reset(save.content.clone(), save.language.clone());
                Vec::new()
            }
            Buffer::StopPoint(_) => Vec::new(),
        };
        self.buffers.push(buffer);
        self.displaced.push(displaced);
    }

    /// Plans the removal of the most recent frame together with the stop
    /// points after it and the stop points directly before it. `None` when
    /// no frame follows the initial save point.
    pub fn plan_undo(&self) -> Option<UndoPlan> {
        let mut idx = self.buffers.len();
        while idx > 1 && self.buffers[idx - 1].is_stop() {
            idx -= 1;
        }
        if idx <= 1 {
            return None;
        }
        let frame_idx = idx - 1;
        let Buffer::Frame(frame) = &self.buffers[frame_idx] else {
            return None;
        };

        let mut truncate_to = frame_idx;
        while truncate_to > 1 && self.buffers[truncate_to - 1].is_stop() {
            truncate_to -= 1;
        }
        let selections = self.buffers[..truncate_to]
            .iter()
            .rev()
            .find_map(Buffer::selections)
            .cloned()
            .unwrap_or_default();

        let inverse = invert_all(&frame.edits, &self.displaced[frame_idx]);
        let mut probe = self.shadow.clone();
        let expected = inverse
            .iter()
            .map(|op| {
                let range = op.removed_range();
                let text = probe.slice(range);
                probe.apply(op);
                (range, text)
            })
            .collect();

        Some(UndoPlan {
            truncate_to,
            removed: self.buffers.len() - truncate_to,
            inverse,
            expected,
            selections,
        })
    }

    /// Drops the planned tail once its inverse has been applied.
    pub fn commit_undo(&mut self, plan: &UndoPlan) {
        self.shadow.apply_all(&plan.inverse);
        self.buffers.truncate(plan.truncate_to);
        self.displaced.truncate(plan.truncate_to);
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.displaced.clear();
        self.shadow.reset("", "");
    }
}
