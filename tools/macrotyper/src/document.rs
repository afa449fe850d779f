use crate::edit::{end_after_insert, EditOp, Position, Range};

/// Plain in-memory text addressed by `(line, column)`.
///
/// Positions past the end of a line clamp to the line end; lines past the
/// end of the text clamp to the end of the document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextDocument {
    text: String,
    language: String,
}

impl TextDocument {
    pub fn new(text: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: language.into(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn reset(&mut self, text: impl Into<String>, language: impl Into<String>) {
        self.text = text.into();
        self.language = language.into();
    }

    pub fn end_position(&self) -> Position {
        end_after_insert(Position::default(), &self.text)
    }

    /// True when `position` addresses an existing line and a column within it.
    pub fn contains(&self, position: Position) -> bool {
        match self.text.split('\n').nth(position.line) {
            Some(line) => position.column <= line.chars().count(),
            None => false,
        }
    }

    pub fn offset_at(&self, position: Position) -> usize {
        let mut line_start = 0;
        let mut line_no = 0;
        loop {
            let rest = &self.text[line_start..];
            let line_len = rest.find('\n').unwrap_or(rest.len());
            let is_last = line_start + line_len == self.text.len();
            if line_no == position.line {
                let line = &rest[..line_len];
                let column = line
                    .char_indices()
                    .nth(position.column)
                    .map(|(idx, _)| idx)
                    .unwrap_or(line.len());
                return line_start + column;
            }
            if is_last {
                return self.text.len();
            }
            line_start += line_len + 1;
            line_no += 1;
        }
    }

    pub fn slice(&self, range: Range) -> String {
        let start = self.offset_at(range.start());
        let end = self.offset_at(range.end()).max(start);
        self.text[start..end].to_string()
    }

    /// Applies one op and returns the text it displaced.
    pub fn apply(&mut self, op: &EditOp) -> String {
        let range = op.removed_range();
        let start = self.offset_at(range.start());
        let end = self.offset_at(range.end()).max(start);
        let displaced = self.text[start..end].to_string();
        self.text.replace_range(start..end, op.inserted_text());
        displaced
    }

    /// Applies ops in order, each against the result of the previous one.
    pub fn apply_all(&mut self, ops: &[EditOp]) -> Vec<String> {
        ops.iter().map(|op| self.apply(op)).collect()
    }
}
