pub mod turns;

pub use turns::{Speaker, Turn, TurnLog};
