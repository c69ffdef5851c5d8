//! Command envelope types
//!
//! Commands travel as text in the `cmd` field of a frame:
//!
//! ```text
//! target:function(arg,arg,...)
//! ```
//!
//! - `target`: a unit id, or `*` for every unit
//! - `function`: name of a registered handler
//! - `args`: zero or more comma-separated plain tokens
//!
//! Handlers answer with a short result text that goes back to the base in
//! an `ack_cmd` frame.

use crate::config::commands::{MAX_ARGS, MAX_ARG_LEN, MAX_NAME_LEN};
use crate::config::protocol::MAX_UNIT_ID_LEN;
use core::fmt;
use core::str::FromStr;
use heapless::{String, Vec};

/// Longest result text a handler can return
pub const MAX_RESULT_LEN: usize = 32;

/// Errors that can occur when parsing or executing a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// Envelope does not match `target:function(args)`
    Malformed,
    /// Target or function contains illegal characters or is too long
    InvalidName,
    TooManyArgs,
    ArgTooLong,
    /// No handler registered under that name
    UnknownCommand,
    /// Name already registered
    Duplicate,
    /// Registry has no free entry
    RegistryFull,
    /// Handler rejected its arguments
    InvalidArgs,
    /// Handler could not complete the action
    Failed,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CommandError::Malformed => "malformed command",
            CommandError::InvalidName => "invalid name",
            CommandError::TooManyArgs => "too many arguments",
            CommandError::ArgTooLong => "argument too long",
            CommandError::UnknownCommand => "unknown command",
            CommandError::Duplicate => "duplicate command",
            CommandError::RegistryFull => "registry full",
            CommandError::InvalidArgs => "invalid arguments",
            CommandError::Failed => "command failed",
        };
        f.write_str(text)
    }
}

/// Who a command is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Unit(String<MAX_UNIT_ID_LEN>),
    Broadcast,
}

impl Target {
    /// Whether a unit called `unit_id` should execute the command
    pub fn matches(&self, unit_id: &str) -> bool {
        match self {
            Target::Unit(id) => id.as_str() == unit_id,
            Target::Broadcast => true,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Unit(id) => f.write_str(id),
            Target::Broadcast => f.write_str(crate::config::protocol::BROADCAST),
        }
    }
}

/// Positional command arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandArgs {
    args: Vec<String<MAX_ARG_LEN>, MAX_ARGS>,
}

impl CommandArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument
    pub fn push(&mut self, arg: &str) -> Result<(), CommandError> {
        let mut value = String::new();
        value.push_str(arg).map_err(|_| CommandError::ArgTooLong)?;
        self.args.push(value).map_err(|_| CommandError::TooManyArgs)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&str> {
        self.args.get(idx).map(|a| a.as_str())
    }

    /// Parse argument `idx` as `T`
    pub fn parse<T: FromStr>(&self, idx: usize) -> Result<T, CommandError> {
        self.get(idx)
            .ok_or(CommandError::InvalidArgs)?
            .parse()
            .map_err(|_| CommandError::InvalidArgs)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(|a| a.as_str())
    }
}

/// A parsed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub target: Target,
    pub function: String<MAX_NAME_LEN>,
    pub args: CommandArgs,
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}(", self.target, self.function)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(arg)?;
        }
        f.write_str(")")
    }
}

/// Successful handler result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    text: String<MAX_RESULT_LEN>,
}

impl CommandOutcome {
    /// Plain success, reported as `ok`
    pub fn ok() -> Self {
        Self::with(crate::protocol::RESULT_OK)
    }

    /// Success with a result text (truncated to [`MAX_RESULT_LEN`])
    pub fn with(text: &str) -> Self {
        let mut value = String::new();
        for c in text.chars() {
            if value.push(c).is_err() {
                break;
            }
        }
        Self { text: value }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}
