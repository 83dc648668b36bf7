pub mod health;
pub mod round_actions;
pub mod round_stream;
