pub mod commands;
pub mod error;
pub mod round;
pub mod state;
