pub mod autoplay;
pub mod keys;
pub mod sequencer;
