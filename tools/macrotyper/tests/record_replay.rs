use macrotyper::config::AppConfig;
use macrotyper::edit::{Position, SelectionSet};
use macrotyper::fsm::{PlayingState, RunPhase, SessionState};
use macrotyper::hooks::{RecordedFeedback, Sound};
use macrotyper::macro_store::{MacroStorage, MacroStore, MemoryStorage};
use macrotyper::record::manager::UndoOutcome;
use macrotyper::runtime::{EditorSurface, FakeFileSystem, MemoryEditor, ScriptedPrompter};
use macrotyper::session::{spawn_typer, TyperDeps, TyperHandle};
use std::sync::Arc;
use std::time::Duration;

// ── helpers ───────────────────────────────────────────────────────────────────

struct Desk {
    handle: TyperHandle,
    editor: MemoryEditor,
    prompter: ScriptedPrompter,
    feedback: RecordedFeedback,
}

fn desk(editor: MemoryEditor, storage: Arc<dyn MacroStorage>) -> Desk {
    let prompter = ScriptedPrompter::default();
    let feedback = RecordedFeedback::default();
    let mut config = AppConfig::default();
    config.playback.autoplay_interval_ms = 5;
    let handle = spawn_typer(
        &config,
        TyperDeps {
            editor: Arc::new(editor.clone()),
            storage,
            prompter: Arc::new(prompter.clone()),
            feedback: Arc::new(feedback.clone()),
            file_system: Arc::new(FakeFileSystem::default()),
        },
    );
    editor.echo_to(handle.capture());
    Desk {
        handle,
        editor,
        prompter,
        feedback,
    }
}

fn paused(at_end: bool) -> impl Fn(&SessionState) -> bool {
    move |state| {
        matches!(
            state,
            SessionState::Playing(PlayingState {
                run: RunPhase::Paused { at_end: end },
                ..
            }) if *end == at_end
        )
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn recorded_session_replays_into_a_fresh_document() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn MacroStorage> =
        Arc::new(MacroStore::open(dir.path().join("macros.sqlite")).expect("open"));

    let recorder = desk(
        MemoryEditor::with_document("fn main() {}\n", "rust"),
        store.clone(),
    );
    recorder.prompter.push_name(Some("demo"));
    recorder
        .editor
        .cursor_at(Position::new(0, "fn main() {".chars().count()));
    recorder.handle.record().await.expect("record");
    recorder.editor.user_type(" ok").await.expect("type");
    settle().await;
    recorder.handle.insert_stop(Some("explain")).await.expect("stop");
    recorder.editor.user_type(";").await.expect("type");
    recorder.handle.end_recording().await.expect("end");
    recorder
        .handle
        .wait_until(SessionState::is_idle)
        .await
        .expect("idle");
    let recorded_text = recorder.editor.text().expect("document");
    let recorded_selections = recorder.editor.selections();
    assert_eq!(recorded_text, "fn main() { ok;}\n");

    let saved = store.load("demo").expect("load").expect("saved");
    assert_eq!(saved.frame_count(), 2);
    assert!(saved.buffers.iter().any(|buffer| buffer.describe() == "stop \"explain\""));

    let player = desk(MemoryEditor::new(), store.clone());
    player.handle.play("demo").await.expect("play");

    let capture = player.handle.capture();
    assert!(capture.typed("x").await);
    assert!(capture.typed("x").await);
    player.handle.wait_until(paused(false)).await.expect("stop");
    assert_eq!(player.editor.text().as_deref(), Some("fn main() { ok}\n"));

    assert!(capture.typed("\n").await);
    assert!(capture.typed("x").await);
    assert!(capture.typed("x").await);
    player.handle.wait_until(paused(true)).await.expect("end");
    assert!(capture.typed("\n").await);
    player
        .handle
        .wait_until(SessionState::is_idle)
        .await
        .expect("idle");

    assert_eq!(player.editor.text(), Some(recorded_text));
    assert_eq!(player.editor.selections(), recorded_selections);
    assert_eq!(player.feedback.sounds(), vec![Sound::Pause, Sound::End]);
}

#[tokio::test]
async fn undone_frames_never_reach_storage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn MacroStorage> =
        Arc::new(MacroStore::open(dir.path().join("macros.sqlite")).expect("open"));
    let recorder = desk(MemoryEditor::with_document("", "plaintext"), store.clone());
    recorder.prompter.push_name(Some("fixed"));

    recorder.handle.record().await.expect("record");
    recorder.editor.user_type("tpyo").await.expect("type");
    settle().await;
    assert_eq!(
        recorder.handle.undo().await.expect("undo"),
        UndoOutcome::Undone { removed: 1 }
    );
    recorder.editor.user_type("typo").await.expect("type");
    recorder.handle.end_recording().await.expect("end");
    recorder
        .handle
        .wait_until(SessionState::is_idle)
        .await
        .expect("idle");

    let saved = store.load("fixed").expect("load").expect("saved");
    assert_eq!(saved.frame_count(), 1);
    assert_eq!(
        saved.final_save_point().map(|save| save.content.as_str()),
        Some("typo")
    );
}

#[tokio::test]
async fn selection_moves_are_recorded_and_replayed() {
    let store: Arc<dyn MacroStorage> = Arc::new(MemoryStorage::default());
    let recorder = desk(MemoryEditor::with_document("ab", "plaintext"), store.clone());
    recorder.prompter.push_name(Some("moves"));

    recorder.handle.record().await.expect("record");
    recorder
        .editor
        .user_select(SelectionSet::cursor(Position::new(0, 1)))
        .await;
    settle().await;
    recorder.editor.user_type("-").await.expect("type");
    recorder.handle.end_recording().await.expect("end");
    recorder
        .handle
        .wait_until(SessionState::is_idle)
        .await
        .expect("idle");
    let recorded_selections = recorder.editor.selections();
    assert_eq!(recorded_selections, SelectionSet::cursor(Position::new(0, 2)));

    let saved = store.load("moves").expect("load").expect("saved");
    assert_eq!(saved.frame_count(), 2);
    assert!(saved.buffers[1].describe().starts_with("move:"));

    let player = desk(MemoryEditor::new(), store);
    player.handle.play("moves").await.expect("play");
    let capture = player.handle.capture();
    for _ in 0..3 {
        assert!(capture.typed("x").await);
    }
    player.handle.wait_until(paused(true)).await.expect("end");
    assert_eq!(player.editor.text().as_deref(), Some("a-b"));
    assert_eq!(player.editor.selections(), recorded_selections);
    player.handle.cancel_playing().await.expect("cancel");
    player
        .handle
        .wait_until(SessionState::is_idle)
        .await
        .expect("idle");
}
