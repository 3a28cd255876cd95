pub mod core;
pub mod player;

pub use crate::core::{PlayerError, PlayerOptions, Result};
pub use crate::player::{HostCommand, Player, PlayerEvent};
