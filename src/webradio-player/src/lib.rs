pub mod channel;
pub mod controller;
mod pending;
pub mod persistence;
pub mod protocol;

pub use channel::{ChannelError, LineChannel, LineReader, ReadOutcome};
pub use controller::{ControllerError, ControllerResult, PlayOptions, PlaybackState, PlayerController};
pub use persistence::{PersistentState, StatePersistenceError, StateStore};
pub use protocol::{Command, StatusLine};
