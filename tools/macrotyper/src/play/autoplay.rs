use crate::logging::append_run_log;
use crate::play::sequencer::StepCommand;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoplayControl {
    Play,
    Pause,
    /// Break out of the current stop point on the next tick, then keep playing.
    Resume,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Off,
    Playing,
    Paused,
    Resuming,
}

/// Periodic step source. Lives for the whole playback session and returns
/// when the control channel closes or the step channel is dropped.
pub async fn run(
    interval: Duration,
    mut control: mpsc::Receiver<AutoplayControl>,
    steps: mpsc::Sender<StepCommand>,
) {
    let mut state = TimerState::Off;
    loop {
        let received = match state {
            TimerState::Off | TimerState::Paused => match control.recv().await {
                Some(cmd) => Some(cmd),
                None => return,
            },
            TimerState::Playing | TimerState::Resuming => {
                tokio::select! {
                    biased;
                    cmd = control.recv() => match cmd {
                        Some(cmd) => Some(cmd),
                        None => return,
                    },
                    _ = tokio::time::sleep(interval) => None,
                }
            }
        };

        if let Some(cmd) = received {
            state = apply_control(state, cmd);
            continue;
        }

        let step = match state {
            TimerState::Resuming => StepCommand::Breakout,
            _ => StepCommand::Advance,
        };
        // A control arriving while the sequencer is busy wins over the tick.
        tokio::select! {
            biased;
            cmd = control.recv() => match cmd {
                Some(cmd) => state = apply_control(state, cmd),
                None => return,
            },
            sent = steps.send(step) => {
                if sent.is_err() {
                    return;
                }
                if state == TimerState::Resuming {
                    state = TimerState::Playing;
                }
            }
        }
    }
}

fn apply_control(state: TimerState, cmd: AutoplayControl) -> TimerState {
    let next = match cmd {
        AutoplayControl::Play => TimerState::Playing,
        AutoplayControl::Pause if state == TimerState::Off => TimerState::Off,
        AutoplayControl::Pause => TimerState::Paused,
        AutoplayControl::Resume => TimerState::Resuming,
        AutoplayControl::Quit => TimerState::Off,
    };
    if next != state {
        append_run_log(
            "debug",
            "play.autoplay.state",
            json!({ "from": format!("{state:?}"), "to": format!("{next:?}") }),
        );
    }
    next
}
