use serde::{Deserialize, Serialize};

/// A `(line, column)` location. Columns count `char`s, not bytes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(from = "(usize, usize)", into = "(usize, usize)")]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl From<(usize, usize)> for Position {
    fn from((line, column): (usize, usize)) -> Self {
        Self { line, column }
    }
}

impl From<Position> for (usize, usize) {
    fn from(value: Position) -> Self {
        (value.line, value.column)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "(Position, Position)", into = "(Position, Position)")]
pub struct Range {
    start: Position,
    end: Position,
}

impl Range {
    /// Builds a range from two endpoints in either order.
    pub fn new(a: Position, b: Position) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    pub fn empty(at: Position) -> Self {
        Self { start: at, end: at }
    }

    pub fn start(&self) -> Position {
        self.start
    }

    pub fn end(&self) -> Position {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl From<(Position, Position)> for Range {
    fn from((a, b): (Position, Position)) -> Self {
        Self::new(a, b)
    }
}

impl From<Range> for (Position, Position) {
    fn from(value: Range) -> Self {
        (value.start, value.end)
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Position,
    pub active: Position,
}

impl Selection {
    pub fn cursor(at: Position) -> Self {
        Self {
            anchor: at,
            active: at,
        }
    }

    pub fn range(&self) -> Range {
        Range::new(self.anchor, self.active)
    }
}

/// Ordered selections; the primary selection comes first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionSet(Vec<Selection>);

impl SelectionSet {
    pub fn new(selections: Vec<Selection>) -> Self {
        Self(selections)
    }

    pub fn cursor(at: Position) -> Self {
        Self(vec![Selection::cursor(at)])
    }

    pub fn primary(&self) -> Option<&Selection> {
        self.0.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Selection> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn describe(&self) -> String {
        self.0
            .iter()
            .map(|selection| {
                if selection.anchor == selection.active {
                    format!("cursor {}", selection.active)
                } else {
                    format!("select {} -> {}", selection.anchor, selection.active)
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl From<Vec<Selection>> for SelectionSet {
    fn from(value: Vec<Selection>) -> Self {
        Self(value)
    }
}

/// A raw change notification as a host editor reports it: the affected
/// range and the text that now occupies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentChange {
    pub range: Range,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditOp {
    Insert { at: Position, text: String },
    Delete { range: Range },
    Replace { range: Range, text: String },
}

impl EditOp {
    pub fn from_change(change: ContentChange) -> Self {
        if change.text.is_empty() {
            Self::Delete {
                range: change.range,
            }
        } else if change.range.is_empty() {
            Self::Insert {
                at: change.range.start(),
                text: change.text,
            }
        } else {
            Self::Replace {
                range: change.range,
                text: change.text,
            }
        }
    }

    /// The region of the pre-edit document this op removes.
    pub fn removed_range(&self) -> Range {
        match self {
            Self::Insert { at, .. } => Range::empty(*at),
            Self::Delete { range } | Self::Replace { range, .. } => *range,
        }
    }

    pub fn inserted_text(&self) -> &str {
        match self {
            Self::Insert { text, .. } | Self::Replace { text, .. } => text,
            Self::Delete { .. } => "",
        }
    }

    /// Inverse of this op. `displaced` is the text that occupied
    /// `removed_range()` before the op was applied.
    pub fn invert(&self, displaced: &str) -> EditOp {
        match self {
            Self::Insert { at, text } => Self::Delete {
                range: Range::new(*at, end_after_insert(*at, text)),
            },
            Self::Delete { range } => Self::Insert {
                at: range.start(),
                text: displaced.to_string(),
            },
            Self::Replace { range, text } => Self::Replace {
                range: Range::new(range.start(), end_after_insert(range.start(), text)),
                text: displaced.to_string(),
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Insert { at, text } => format!("insert {text:?} at {at}"),
            Self::Delete { range } => format!("delete {range}"),
            Self::Replace { range, text } => format!("replace {range} with {text:?}"),
        }
    }
}

/// Position just past `text` when it is inserted at `at`.
pub fn end_after_insert(at: Position, text: &str) -> Position {
    let newlines = text.matches('\n').count();
    if newlines == 0 {
        return Position::new(at.line, at.column + text.chars().count());
    }
    let tail = text.rsplit('\n').next().unwrap_or_default();
    Position::new(at.line + newlines, tail.chars().count())
}

/// Inverts an ordered op sequence. `displaced[i]` belongs to `ops[i]`;
/// missing entries count as empty text.
pub fn invert_all(ops: &[EditOp], displaced: &[String]) -> Vec<EditOp> {
    ops.iter()
        .enumerate()
        .rev()
        .map(|(idx, op)| op.invert(displaced.get(idx).map(String::as_str).unwrap_or("")))
        .collect()
}
