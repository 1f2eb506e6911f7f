pub mod controller;
pub mod state;

pub use controller::{run_playlist, PlaybackController};
pub use state::{PlaybackState, PlaybackStatus, PlaybackTick};
