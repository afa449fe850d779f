use crate::config::PlaybackConfig;
use crate::play::sequencer::StepCommand;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBinding {
    pub key: char,
    pub action: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Step(StepCommand),
    StartAutoplay,
    PauseAutoplay,
    ResumeAutoplay,
    Ignore,
}

/// Routes typed text during playback. The mode is shared so the session can
/// flip it when autoplay starts or stops.
#[derive(Debug, Clone)]
pub struct KeyRouter {
    breakout: char,
    toggle: char,
    mode: Arc<Mutex<KeyMode>>,
}

impl KeyRouter {
    pub fn new(breakout: char, toggle: char) -> Self {
        Self {
            breakout,
            toggle,
            mode: Arc::new(Mutex::new(KeyMode::Manual)),
        }
    }

    pub fn from_config(cfg: &PlaybackConfig) -> Self {
        Self::new(cfg.breakout_char(), cfg.autoplay_toggle_char())
    }

    pub fn mode(&self) -> KeyMode {
        *self.mode.lock().expect("key mode lock")
    }

    pub fn set_mode(&self, mode: KeyMode) {
        *self.mode.lock().expect("key mode lock") = mode;
    }

    pub fn route(&self, text: &str) -> KeyAction {
        let single = single_char(text);
        match self.mode() {
            KeyMode::Manual => match single {
                Some(key) if key == self.breakout => KeyAction::Step(StepCommand::Breakout),
                Some(key) if key == self.toggle => KeyAction::StartAutoplay,
                _ => KeyAction::Step(StepCommand::Advance),
            },
            KeyMode::Auto => match single {
                Some(key) if key == self.breakout => KeyAction::ResumeAutoplay,
                Some(key) if key == self.toggle => KeyAction::PauseAutoplay,
                _ => KeyAction::Ignore,
            },
        }
    }

    pub fn bindings(&self) -> Vec<KeyBinding> {
        match self.mode() {
            KeyMode::Manual => vec![
                KeyBinding {
                    key: self.breakout,
                    action: "break out",
                },
                KeyBinding {
                    key: self.toggle,
                    action: "autoplay",
                },
            ],
            KeyMode::Auto => vec![
                KeyBinding {
                    key: self.breakout,
                    action: "resume",
                },
                KeyBinding {
                    key: self.toggle,
                    action: "pause autoplay",
                },
            ],
        }
    }

    pub fn controls_legend(&self) -> String {
        let mut legend = format_bindings("Keys: ", &self.bindings());
        if self.mode() == KeyMode::Manual {
            legend.push_str("  any other key advances");
        }
        legend
    }
}

fn single_char(text: &str) -> Option<char> {
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(key), None) => Some(key),
        _ => None,
    }
}

fn key_label(key: char) -> String {
    match key {
        '\n' => "enter".to_string(),
        '\t' => "tab".to_string(),
        ' ' => "space".to_string(),
        other => other.to_string(),
    }
}

fn format_bindings(prefix: &str, bindings: &[KeyBinding]) -> String {
    let parts = bindings
        .iter()
        .map(|binding| format!("{} {}", key_label(binding.key), binding.action))
        .collect::<Vec<_>>();
    format!("{prefix}{}", parts.join("  "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_mode_maps_every_key_to_a_step_or_autoplay() {
        let router = KeyRouter::new('\n', '`');
        assert_eq!(router.route("\n"), KeyAction::Step(StepCommand::Breakout));
        assert_eq!(router.route("`"), KeyAction::StartAutoplay);
        assert_eq!(router.route("x"), KeyAction::Step(StepCommand::Advance));
        assert_eq!(router.route("``"), KeyAction::Step(StepCommand::Advance));
    }

    #[test]
    fn auto_mode_never_steps() {
        let router = KeyRouter::new('\n', '`');
        router.set_mode(KeyMode::Auto);
        assert_eq!(router.route("\n"), KeyAction::ResumeAutoplay);
        assert_eq!(router.route("`"), KeyAction::PauseAutoplay);
        assert_eq!(router.route("x"), KeyAction::Ignore);
    }

    #[test]
    fn clones_share_the_mode() {
        let router = KeyRouter::new('\n', '`');
        let clone = router.clone();
        clone.set_mode(KeyMode::Auto);
        assert_eq!(router.mode(), KeyMode::Auto);
    }

    #[test]
    fn legend_names_special_keys() {
        let router = KeyRouter::new('\n', '`');
        assert_eq!(
            router.controls_legend(),
            "Keys: enter break out  ` autoplay  any other key advances"
        );
        router.set_mode(KeyMode::Auto);
        assert_eq!(router.controls_legend(), "Keys: enter resume  ` pause autoplay");
    }
}
