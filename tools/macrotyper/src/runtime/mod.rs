use crate::capture::CaptureRouter;
use crate::document::TextDocument;
use crate::edit::{ContentChange, EditOp, Position, Range, SelectionSet};
use crate::errors::TyperError;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Resolves once the editor has applied (or rejected) a submitted edit.
pub type EditConfirmation = oneshot::Receiver<Result<(), TyperError>>;

pub trait EditorSurface: Send + Sync {
    fn has_active_document(&self) -> bool;
    fn open_document(&self, content: &str, language: &str) -> Result<(), TyperError>;
    /// Applies `ops` in order, each against the result of the previous one.
    fn apply_edits(&self, ops: Vec<EditOp>) -> EditConfirmation;
    fn selections(&self) -> SelectionSet;
    fn set_selections(&self, selections: SelectionSet) -> Result<(), TyperError>;
    fn document_text(&self, range: Option<Range>) -> Result<String, TyperError>;
    fn language(&self) -> String;
}

/// Waits for an edit confirmation, treating a dropped sender as a rejection.
pub async fn confirmed(confirmation: EditConfirmation) -> Result<(), TyperError> {
    confirmation.await.map_err(|_| {
        TyperError::EditApplicationFailed("editor dropped the edit confirmation".to_string())
    })?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDecision {
    Save,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueDecision {
    Continue,
    End,
}

pub trait Prompter: Send + Sync {
    fn save_or_discard(&self) -> SaveDecision;
    fn add_ending_stop(&self) -> bool;
    /// `None` when the user escapes the prompt.
    fn macro_name(&self) -> Option<String>;
    fn continue_or_end(&self) -> ContinueDecision;

    fn macro_description(&self, _name: &str) -> String {
        String::new()
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, TyperError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), TyperError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), TyperError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), TyperError>;
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, TyperError> {
        std::fs::read_to_string(path).map_err(|e| TyperError::Io(e.to_string()))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), TyperError> {
        std::fs::write(path, contents).map_err(|e| TyperError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), TyperError> {
        std::fs::create_dir_all(path).map_err(|e| TyperError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), TyperError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| TyperError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub file_system: Arc<dyn FileSystem>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

// ── In-memory editor ──────────────────────────────────────────────────────────

#[derive(Default)]
struct EditorState {
    document: Option<TextDocument>,
    selections: SelectionSet,
}

/// Editor surface over an in-memory document.
///
/// With an echo router attached it behaves like a host editor: every applied
/// edit is reported back through input capture as a document change followed
/// by a selection change, and the confirmation resolves only after both
/// notifications were handed off. Programmatic selection updates are not
/// echoed.
#[derive(Default, Clone)]
pub struct MemoryEditor {
    state: Arc<Mutex<EditorState>>,
    fail_next: Arc<Mutex<Option<TyperError>>>,
    echo: Arc<Mutex<Option<CaptureRouter>>>,
    applied: Arc<Mutex<Vec<Vec<EditOp>>>>,
}

impl MemoryEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(text: impl Into<String>, language: impl Into<String>) -> Self {
        let editor = Self::default();
        editor.state.lock().expect("editor lock").document = Some(TextDocument::new(text, language));
        editor
    }

    pub fn set_fail_next(&self, error: TyperError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    pub fn echo_to(&self, router: CaptureRouter) {
        *self.echo.lock().expect("echo lock") = Some(router);
    }

    pub fn text(&self) -> Option<String> {
        self.state
            .lock()
            .expect("editor lock")
            .document
            .as_ref()
            .map(|doc| doc.text().to_string())
    }

    /// Every batch of ops this editor accepted, in order.
    pub fn applied(&self) -> Vec<Vec<EditOp>> {
        self.applied.lock().expect("applied lock").clone()
    }

    /// Simulates the user editing the document: applies the change, moves the
    /// cursor behind the inserted text and reports both through capture.
    pub async fn user_edit(&self, change: ContentChange) -> Result<(), TyperError> {
        let op = EditOp::from_change(change.clone());
        let cursor = {
            let mut state = self.state.lock().expect("editor lock");
            let document = state.document.as_mut().ok_or(TyperError::NoActiveEditor)?;
            if !document.contains(change.range.start()) || !document.contains(change.range.end()) {
                return Err(TyperError::EditApplicationFailed(format!(
                    "range {} is outside the document",
                    change.range
                )));
            }
            document.apply(&op);
            let cursor = crate::edit::end_after_insert(change.range.start(), &change.text);
            state.selections = SelectionSet::cursor(cursor);
            cursor
        };
        if let Some(router) = self.echo_router() {
            router.document_changed(vec![change]).await;
            router.selection_changed(SelectionSet::cursor(cursor)).await;
        }
        Ok(())
    }

    /// Types `text` at the primary cursor, replacing any selected text.
    pub async fn user_type(&self, text: &str) -> Result<(), TyperError> {
        let range = self
            .selections()
            .primary()
            .map(|selection| selection.range())
            .unwrap_or_default();
        self.user_edit(ContentChange {
            range,
            text: text.to_string(),
        })
        .await
    }

    /// Simulates the user moving the cursor or selection.
    pub async fn user_select(&self, selections: SelectionSet) {
        self.state.lock().expect("editor lock").selections = selections.clone();
        if let Some(router) = self.echo_router() {
            router.selection_changed(selections).await;
        }
    }

    pub fn cursor_at(&self, position: Position) {
        self.state.lock().expect("editor lock").selections = SelectionSet::cursor(position);
    }

    fn echo_router(&self) -> Option<CaptureRouter> {
        self.echo.lock().expect("echo lock").clone()
    }

    fn apply_now(&self, ops: &[EditOp]) -> Result<Vec<ContentChange>, TyperError> {
        if let Some(error) = self.fail_next.lock().expect("fail lock").take() {
            return Err(error);
        }
        let mut state = self.state.lock().expect("editor lock");
        let document = state.document.as_mut().ok_or(TyperError::NoActiveEditor)?;
        let mut scratch = document.clone();
        let mut changes = Vec::with_capacity(ops.len());
        for op in ops {
            let range = op.removed_range();
            if !scratch.contains(range.start()) || !scratch.contains(range.end()) {
                return Err(TyperError::EditApplicationFailed(format!(
                    "{} is outside the document",
                    op.describe()
                )));
            }
            scratch.apply(op);
            changes.push(ContentChange {
                range,
                text: op.inserted_text().to_string(),
            });
        }
        *document = scratch;
        drop(state);
        self.applied
            .lock()
            .expect("applied lock")
            .push(ops.to_vec());
        Ok(changes)
    }
}

impl EditorSurface for MemoryEditor {
    fn has_active_document(&self) -> bool {
        self.state.lock().expect("editor lock").document.is_some()
    }

    fn open_document(&self, content: &str, language: &str) -> Result<(), TyperError> {
        let mut state = self.state.lock().expect("editor lock");
        match state.document.as_mut() {
            Some(document) => document.reset(content, language),
            None => state.document = Some(TextDocument::new(content, language)),
        }
        Ok(())
    }

    fn apply_edits(&self, ops: Vec<EditOp>) -> EditConfirmation {
        let (reply, confirmation) = oneshot::channel();
        match (self.apply_now(&ops), self.echo_router()) {
            (Ok(changes), Some(router)) if !changes.is_empty() => {
                let selections = self.selections();
                tokio::spawn(async move {
                    router.document_changed(changes).await;
                    router.selection_changed(selections).await;
                    let _ = reply.send(Ok(()));
                });
            }
            (result, _) => {
                let _ = reply.send(result.map(|_| ()));
            }
        }
        confirmation
    }

    fn selections(&self) -> SelectionSet {
        self.state.lock().expect("editor lock").selections.clone()
    }

    fn set_selections(&self, selections: SelectionSet) -> Result<(), TyperError> {
        let mut state = self.state.lock().expect("editor lock");
        if state.document.is_none() {
            return Err(TyperError::NoActiveEditor);
        }
        state.selections = selections;
        Ok(())
    }

    fn document_text(&self, range: Option<Range>) -> Result<String, TyperError> {
        let state = self.state.lock().expect("editor lock");
        let document = state.document.as_ref().ok_or(TyperError::NoActiveEditor)?;
        Ok(match range {
            Some(range) => document.slice(range),
            None => document.text().to_string(),
        })
    }

    fn language(&self) -> String {
        self.state
            .lock()
            .expect("editor lock")
            .document
            .as_ref()
            .map(|doc| doc.language().to_string())
            .unwrap_or_default()
    }
}

// ── Scripted prompter ─────────────────────────────────────────────────────────

/// Answers prompts from queued responses. Empty queues fall back to save,
/// add the ending stop, escape the name prompt and end the recording.
#[derive(Default, Clone)]
pub struct ScriptedPrompter {
    saves: Arc<Mutex<VecDeque<SaveDecision>>>,
    endings: Arc<Mutex<VecDeque<bool>>>,
    names: Arc<Mutex<VecDeque<Option<String>>>>,
    continues: Arc<Mutex<VecDeque<ContinueDecision>>>,
    asked: Arc<Mutex<Vec<&'static str>>>,
}

impl ScriptedPrompter {
    pub fn push_save(&self, decision: SaveDecision) -> &Self {
        self.saves.lock().expect("saves lock").push_back(decision);
        self
    }

    pub fn push_ending(&self, add: bool) -> &Self {
        self.endings.lock().expect("endings lock").push_back(add);
        self
    }

    pub fn push_name(&self, name: Option<&str>) -> &Self {
        self.names
            .lock()
            .expect("names lock")
            .push_back(name.map(str::to_string));
        self
    }

    pub fn push_continue(&self, decision: ContinueDecision) -> &Self {
        self.continues
            .lock()
            .expect("continues lock")
            .push_back(decision);
        self
    }

    /// Prompt kinds in the order they were asked.
    pub fn asked(&self) -> Vec<&'static str> {
        self.asked.lock().expect("asked lock").clone()
    }

    fn note(&self, prompt: &'static str) {
        self.asked.lock().expect("asked lock").push(prompt);
    }
}

impl Prompter for ScriptedPrompter {
    fn save_or_discard(&self) -> SaveDecision {
        self.note("save_or_discard");
        self.saves
            .lock()
            .expect("saves lock")
            .pop_front()
            .unwrap_or(SaveDecision::Save)
    }

    fn add_ending_stop(&self) -> bool {
        self.note("add_ending_stop");
        self.endings
            .lock()
            .expect("endings lock")
            .pop_front()
            .unwrap_or(true)
    }

    fn macro_name(&self) -> Option<String> {
        self.note("macro_name");
        self.names
            .lock()
            .expect("names lock")
            .pop_front()
            .flatten()
    }

    fn continue_or_end(&self) -> ContinueDecision {
        self.note("continue_or_end");
        self.continues
            .lock()
            .expect("continues lock")
            .pop_front()
            .unwrap_or(ContinueDecision::End)
    }
}

// ── Fakes ─────────────────────────────────────────────────────────────────────

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<TyperError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: TyperError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    pub fn file(&self, path: &Path) -> Option<String> {
        self.files.lock().expect("files lock").get(path).cloned()
    }

    fn maybe_fail(&self) -> Result<(), TyperError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, TyperError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| TyperError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), TyperError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), TyperError> {
        self.maybe_fail()?;
        self.dirs
            .lock()
            .expect("dirs lock")
            .push(path.to_path_buf());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), TyperError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }
}
