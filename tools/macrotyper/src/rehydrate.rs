//! Parsing of exported macro files, including the older field-presence
//! format where buffers carry no kind tag and positions are objects.

use crate::buffers::{Buffer, Frame, Macro, SavePoint, StopPoint};
use crate::edit::{ContentChange, EditOp, Position, Range, Selection, SelectionSet};
use crate::errors::TyperError;
use serde::Deserialize;

/// Stop point name that marked the ending stop in the older format.
pub const LEGACY_ENDING_NAME: &str = "END_OF_MACRO";

#[derive(Debug, Deserialize)]
struct LegacyPosition {
    line: usize,
    character: usize,
}

#[derive(Debug, Deserialize)]
struct LegacySelection {
    anchor: LegacyPosition,
    active: LegacyPosition,
}

#[derive(Debug, Deserialize)]
struct LegacyChange {
    range: (LegacyPosition, LegacyPosition),
    text: String,
}

#[derive(Debug, Deserialize)]
struct LegacyChangeInfo {
    changes: Vec<LegacyChange>,
}

#[derive(Debug, Deserialize)]
struct LegacyStop {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyBuffer {
    Stop {
        stop: LegacyStop,
    },
    SavePoint {
        content: String,
        language: String,
        selections: Vec<LegacySelection>,
    },
    Frame {
        #[serde(rename = "changeInfo")]
        change_info: LegacyChangeInfo,
        selections: Vec<LegacySelection>,
    },
}

#[derive(Debug, Deserialize)]
struct LegacyMacro {
    name: String,
    #[serde(default)]
    description: Option<String>,
    buffers: Vec<LegacyBuffer>,
}

/// Parses an exported macro in either the current or the older format.
pub fn parse_macro(json: &str) -> Result<Macro, TyperError> {
    let current_err = match serde_json::from_str::<Macro>(json) {
        Ok(parsed) => return Ok(parsed),
        Err(err) => err,
    };
    let legacy: LegacyMacro = serde_json::from_str(json).map_err(|legacy_err| {
        TyperError::Storage(format!(
            "unrecognized macro file: {current_err}; legacy format: {legacy_err}"
        ))
    })?;
    Ok(Macro {
        name: legacy.name,
        description: legacy.description.unwrap_or_default(),
        buffers: legacy.buffers.into_iter().map(rehydrate_buffer).collect(),
    })
}

fn rehydrate_buffer(buffer: LegacyBuffer) -> Buffer {
    match buffer {
        LegacyBuffer::Stop { stop } => {
            let ending = stop.name.as_deref() == Some(LEGACY_ENDING_NAME);
            Buffer::StopPoint(StopPoint {
                name: if ending {
                    None
                } else {
                    stop.name.filter(|name| !name.is_empty())
                },
                ending,
            })
        }
        LegacyBuffer::SavePoint {
            content,
            language,
            selections,
        } => Buffer::SavePoint(SavePoint {
            content,
            language,
            selections: rehydrate_selections(selections),
        }),
        LegacyBuffer::Frame {
            change_info,
            selections,
        } => {
            // Simultaneous changes address the pre-edit document; applying
            // them back to front keeps every range valid.
            let mut changes = change_info
                .changes
                .into_iter()
                .map(|change| ContentChange {
                    range: Range::new(position(change.range.0), position(change.range.1)),
                    text: change.text,
                })
                .collect::<Vec<_>>();
            changes.sort_by(|a, b| b.range.start().cmp(&a.range.start()));
            Buffer::Frame(Frame {
                edits: changes.into_iter().map(EditOp::from_change).collect(),
                selections: rehydrate_selections(selections),
            })
        }
    }
}

fn position(legacy: LegacyPosition) -> Position {
    Position::new(legacy.line, legacy.character)
}

fn rehydrate_selections(selections: Vec<LegacySelection>) -> SelectionSet {
    selections
        .into_iter()
        .map(|selection| Selection {
            anchor: position(selection.anchor),
            active: position(selection.active),
        })
        .collect::<Vec<_>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::parse_macro;
    use crate::buffers::Buffer;
    use crate::edit::{EditOp, Position};

    const LEGACY: &str = r#"{
      "name": "hello",
      "buffers": [
        {"content": "", "language": "plaintext",
         "selections": [{"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 0},
                         "active": {"line": 0, "character": 0}, "anchor": {"line": 0, "character": 0}}]},
        {"changeInfo": {"changes": [{"range": [{"line": 0, "character": 0}, {"line": 0, "character": 0}],
                                      "rangeOffset": 0, "rangeLength": 0, "text": "h"}]},
         "selections": [{"active": {"line": 0, "character": 1}, "anchor": {"line": 0, "character": 1}}]},
        {"stop": {"name": null}},
        {"stop": {"name": "END_OF_MACRO"}},
        {"content": "h", "language": "plaintext", "selections": []}
      ]
    }"#;

    #[test]
    fn legacy_export_rehydrates_into_tagged_buffers() {
        let parsed = parse_macro(LEGACY).expect("parse");
        assert_eq!(parsed.name, "hello");
        assert_eq!(parsed.description, "");
        assert_eq!(parsed.buffers.len(), 5);
        let Buffer::Frame(frame) = &parsed.buffers[1] else {
            panic!("expected frame");
        };
        assert_eq!(
            frame.edits,
            vec![EditOp::Insert {
                at: Position::new(0, 0),
                text: "h".to_string()
            }]
        );
        assert!(!parsed.buffers[2].is_ending_stop());
        assert!(parsed.buffers[3].is_ending_stop());
        assert_eq!(
            parsed.final_save_point().map(|save| save.content.as_str()),
            Some("h")
        );
        parsed.validate().expect("valid");
    }

    #[test]
    fn current_format_parses_directly() {
        let json = r#"{"name":"n","description":"d","buffers":[
            {"kind":"save_point","content":"x","language":"rust","selections":[]},
            {"kind":"stop_point","name":null,"ending":true}]}"#;
        let parsed = parse_macro(json).expect("parse");
        assert_eq!(parsed.description, "d");
        assert!(parsed.buffers[1].is_ending_stop());
    }

    #[test]
    fn garbage_is_a_storage_error() {
        let err = parse_macro("{\"nope\": 1}").expect_err("reject");
        assert!(matches!(err, crate::errors::TyperError::Storage(message) if message.contains("unrecognized")));
    }
}
