#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod clock;
pub mod commands;
pub mod config;
pub mod lora;
pub mod protocol;
pub mod provision;
pub mod security;
pub mod session;
pub mod storage;
pub mod transfer;

// These modules depend on embassy/esp-hal and only build with the embedded feature
#[cfg(feature = "embedded")]
pub mod debug;
#[cfg(feature = "embedded")]
pub mod tasks;
