pub mod actions;
pub mod animator;
pub mod backend;
pub mod clock;
pub mod config;
pub mod odds;
pub mod pipeline;
pub mod ready_check;
pub mod reconciler;
pub mod session;
pub mod status;
pub mod timer;
pub mod types;

pub const ROUND_CREATED_EVENT: &str = "round_created";
pub const ROUND_UPDATED_EVENT: &str = "round_updated";
pub const ACTION_ACK_EVENT: &str = "action_ack";
pub const ACTION_ERROR_EVENT: &str = "action_error";
pub const PRICE_SAMPLE_EVENT: &str = "price_sample";
