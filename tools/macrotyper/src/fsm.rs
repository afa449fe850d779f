use crate::errors::TyperError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingPhase {
    Recording,
    Saving,
    Saved,
    Resumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Playing,
    Paused { at_end: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoplayOn {
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoplayPhase {
    Off,
    On(AutoplayOn),
}

/// The two concurrently active regions of the playing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayingState {
    pub run: RunPhase,
    pub autoplay: AutoplayPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Recording(RecordingPhase),
    Playing(PlayingState),
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, Self::Recording(_))
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, Self::Playing(_))
    }

    /// Short label for status display.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording(RecordingPhase::Saving) => "saving",
            Self::Recording(RecordingPhase::Saved) => "saved",
            Self::Recording(_) => "recording",
            Self::Playing(PlayingState {
                run: RunPhase::Paused { at_end: true },
                ..
            }) => "at end",
            Self::Playing(PlayingState {
                run: RunPhase::Paused { .. },
                ..
            }) => "paused",
            Self::Playing(PlayingState {
                autoplay: AutoplayPhase::On(AutoplayOn::Playing),
                ..
            }) => "autoplaying",
            Self::Playing(_) => "playing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Done,
    Cancelled,
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Record,
    Play,
    SaveRequested,
    RecordingSaved,
    RecordingNotSaved,
    ResumeRecording,
    DoneRecording(ExitReason),
    PlayPaused,
    PlayPausedAtEnd,
    ResumePlay,
    DonePlaying,
    ToggleSilence,
    AutoplayStarted,
    AutoplayPaused,
}

/// Named side effects. The machine only names them; the session controller
/// carries them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    EnableIdling,
    DisableIdling,
    EnableRecording,
    StartRecording,
    SaveRecording,
    ContinueOrEndRecording,
    ResumeRecording,
    DisableRecording,
    EnablePlaying,
    StartPlaying,
    PlayPauseSound,
    PlayEndSound,
    StartAutoplay,
    PauseAutoplay,
    ResumeAutoplay,
    StopAutoplay,
    DisablePlaying,
    ToggleSilence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMachine {
    state: SessionState,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }
}

impl SessionMachine {
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Applies `event` and returns the actions to run, exit actions first.
    /// An event with no edge from the current state is rejected and leaves
    /// the state untouched.
    pub fn dispatch(&mut self, event: Event) -> Result<Vec<Action>, TyperError> {
        let (next, actions) = step(self.state, event)?;
        self.state = next;
        Ok(actions)
    }
}

fn step(state: SessionState, event: Event) -> Result<(SessionState, Vec<Action>), TyperError> {
    use Action as A;
    use RecordingPhase as R;

    let outcome = match (state, event) {
        (SessionState::Idle, Event::Record) => {
            // Capture is wired by the entry actions; there is no resting
            // state between idle and recording.
            (
                SessionState::Recording(R::Recording),
                vec![A::DisableIdling, A::EnableRecording, A::StartRecording],
            )
        }
        (SessionState::Idle, Event::Play) => (
            SessionState::Playing(PlayingState {
                run: RunPhase::Playing,
                autoplay: AutoplayPhase::Off,
            }),
            vec![A::DisableIdling, A::EnablePlaying, A::StartPlaying],
        ),

        (SessionState::Recording(_), Event::DoneRecording(_)) => {
            (SessionState::Idle, vec![A::DisableRecording, A::EnableIdling])
        }
        (SessionState::Recording(R::Recording | R::Resumed), Event::SaveRequested) => {
            (SessionState::Recording(R::Saving), vec![A::SaveRecording])
        }
        (SessionState::Recording(R::Saving), Event::RecordingSaved) => (
            SessionState::Recording(R::Saved),
            vec![A::ContinueOrEndRecording],
        ),
        (SessionState::Recording(R::Saving), Event::RecordingNotSaved) => (
            SessionState::Recording(R::Recording),
            vec![A::ResumeRecording],
        ),
        (SessionState::Recording(R::Saved), Event::ResumeRecording) => {
            (SessionState::Recording(R::Resumed), vec![A::ResumeRecording])
        }

        (SessionState::Playing(_), Event::DonePlaying) => (
            SessionState::Idle,
            vec![A::StopAutoplay, A::DisablePlaying, A::EnableIdling],
        ),
        (SessionState::Playing(playing), Event::ToggleSilence) => {
            (SessionState::Playing(playing), vec![A::ToggleSilence])
        }
        (SessionState::Playing(playing), event) => match step_playing(playing, event) {
            Some((next, actions)) => (SessionState::Playing(next), actions),
            None => return Err(illegal(state, event)),
        },

        _ => return Err(illegal(state, event)),
    };
    Ok(outcome)
}

/// Run and autoplay region updates for one event. Repeated pause or resume
/// notifications are accepted without side effects.
fn step_playing(playing: PlayingState, event: Event) -> Option<(PlayingState, Vec<Action>)> {
    use Action as A;

    let mut next = playing;
    let mut actions = Vec::new();
    match event {
        Event::PlayPaused => {
            if playing.run != RunPhase::Playing {
                return Some((playing, actions));
            }
            next.run = RunPhase::Paused { at_end: false };
            actions.push(A::PlayPauseSound);
            if playing.autoplay == AutoplayPhase::On(AutoplayOn::Playing) {
                next.autoplay = AutoplayPhase::On(AutoplayOn::Paused);
                actions.push(A::PauseAutoplay);
            }
        }
        Event::PlayPausedAtEnd => {
            if playing.run == (RunPhase::Paused { at_end: true }) {
                return Some((playing, actions));
            }
            next.run = RunPhase::Paused { at_end: true };
            next.autoplay = AutoplayPhase::Off;
            actions.extend([A::PlayEndSound, A::StopAutoplay]);
        }
        Event::ResumePlay => {
            if !matches!(playing.run, RunPhase::Paused { .. }) {
                return Some((playing, actions));
            }
            next.run = RunPhase::Playing;
            if playing.autoplay == AutoplayPhase::On(AutoplayOn::Paused) {
                next.autoplay = AutoplayPhase::On(AutoplayOn::Playing);
                actions.push(A::ResumeAutoplay);
            }
        }
        Event::AutoplayStarted => {
            if playing.autoplay == AutoplayPhase::On(AutoplayOn::Playing) {
                return Some((playing, actions));
            }
            next.autoplay = AutoplayPhase::On(AutoplayOn::Playing);
            actions.push(A::StartAutoplay);
        }
        Event::AutoplayPaused => {
            if playing.autoplay != AutoplayPhase::On(AutoplayOn::Playing) {
                return Some((playing, actions));
            }
            next.autoplay = AutoplayPhase::On(AutoplayOn::Paused);
            actions.push(A::PauseAutoplay);
        }
        _ => return None,
    }
    Some((next, actions))
}

fn illegal(state: SessionState, event: Event) -> TyperError {
    TyperError::InvalidTransition(format!("{event:?} in {state:?}"))
}
