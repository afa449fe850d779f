use crate::runtime::Terminal;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sound {
    Pause,
    End,
}

/// User-facing side effects requested by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hook {
    ShowMessage(String),
    ShowError(String),
    SetAppState(String),
    PlaySound(Sound),
    SetSilent(bool),
}

pub trait Feedback: Send + Sync {
    fn invoke(&self, hook: Hook);
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StatusLine {
    state: String,
    silent: bool,
}

/// Renders hooks as status lines: `{app} {state}{ (silent)}: {message}`.
pub struct StatusFeedback {
    app_name: String,
    terminal: Arc<dyn Terminal>,
    status: Mutex<StatusLine>,
}

impl StatusFeedback {
    pub fn new(app_name: impl Into<String>, silent: bool, terminal: Arc<dyn Terminal>) -> Self {
        Self {
            app_name: app_name.into(),
            terminal,
            status: Mutex::new(StatusLine {
                state: "idle".to_string(),
                silent,
            }),
        }
    }

    fn render(&self, message: &str) -> String {
        let status = self.status.lock().expect("status lock");
        let silent = if status.silent { " (silent)" } else { "" };
        format!("{} {}{silent}: {message}", self.app_name, status.state)
    }

    fn emit(&self, line: String) {
        if self.terminal.write_line(&line).is_err() {
            eprintln!("{line}");
        }
    }
}

impl Feedback for StatusFeedback {
    fn invoke(&self, hook: Hook) {
        match hook {
            Hook::ShowMessage(message) => self.emit(self.render(&message)),
            Hook::ShowError(message) => self.emit(self.render(&format!("error: {message}"))),
            Hook::SetAppState(state) => self.status.lock().expect("status lock").state = state,
            Hook::SetSilent(silent) => self.status.lock().expect("status lock").silent = silent,
            Hook::PlaySound(Sound::Pause) => self.emit(self.render("*pause*")),
            Hook::PlaySound(Sound::End) => self.emit(self.render("*end*")),
        }
    }
}

/// Keeps every hook for inspection.
#[derive(Debug, Default, Clone)]
pub struct RecordedFeedback {
    hooks: Arc<Mutex<Vec<Hook>>>,
}

impl RecordedFeedback {
    pub fn hooks(&self) -> Vec<Hook> {
        self.hooks.lock().expect("hooks lock").clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.hooks()
            .into_iter()
            .filter_map(|hook| match hook {
                Hook::ShowMessage(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.hooks()
            .into_iter()
            .filter_map(|hook| match hook {
                Hook::ShowError(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn sounds(&self) -> Vec<Sound> {
        self.hooks()
            .into_iter()
            .filter_map(|hook| match hook {
                Hook::PlaySound(sound) => Some(sound),
                _ => None,
            })
            .collect()
    }
}

impl Feedback for RecordedFeedback {
    fn invoke(&self, hook: Hook) {
        self.hooks.lock().expect("hooks lock").push(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeTerminal;

    #[test]
    fn status_line_carries_app_state_and_silence() {
        let terminal = FakeTerminal::default();
        let feedback = StatusFeedback::new("HackerTyper", false, Arc::new(terminal.clone()));
        feedback.invoke(Hook::ShowMessage("ready".to_string()));
        feedback.invoke(Hook::SetAppState("playing".to_string()));
        feedback.invoke(Hook::SetSilent(true));
        feedback.invoke(Hook::ShowError("no active editor".to_string()));
        feedback.invoke(Hook::PlaySound(Sound::End));

        assert_eq!(
            terminal.written_lines(),
            vec![
                "HackerTyper idle: ready",
                "HackerTyper playing (silent): error: no active editor",
                "HackerTyper playing (silent): *end*",
            ]
        );
    }

    #[test]
    fn recorded_feedback_filters_by_kind() {
        let feedback = RecordedFeedback::default();
        feedback.invoke(Hook::ShowMessage("saved".to_string()));
        feedback.invoke(Hook::PlaySound(Sound::Pause));
        feedback.invoke(Hook::ShowError("boom".to_string()));
        assert_eq!(feedback.messages(), vec!["saved"]);
        assert_eq!(feedback.errors(), vec!["boom"]);
        assert_eq!(feedback.sounds(), vec![Sound::Pause]);
        assert_eq!(feedback.hooks().len(), 3);
    }
}
