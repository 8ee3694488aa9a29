pub mod health;
pub mod long_poll;
pub mod socket;
pub mod targets;

// Re-export all handlers for easy route registration
pub use health::{health_handler, health_live_handler, metrics_handler};
pub use long_poll::target_post;
pub use socket::{devtool_socket, log_lifecycle, target_get};
pub use targets::get_targets;
