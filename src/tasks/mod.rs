//! Embassy tasks module
//!
//! Contains all async tasks for the firmware, organised by functionality.

pub mod admin;
pub mod handlers;
pub mod led;
pub mod session;

pub use admin::{admin_task, AdminCommand, AdminReceiver, ADMIN_CHANNEL};
pub use handlers::device_registry;
pub use led::{led_task, LedCommand, LedReceiver, LedSender, LED_CHANNEL};
pub use session::{base_task, remote_task, CommandSender, COMMAND_CHANNEL};
