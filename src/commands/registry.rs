//! Fixed-capacity command table
//!
//! Only functions registered here can run; an envelope naming anything else
//! is rejected and logged.

use crate::commands::parser::CommandParser;
use crate::commands::types::{CommandArgs, CommandError, CommandOutcome, Envelope};
use crate::config::commands::{MAX_HANDLERS, MAX_NAME_LEN};
use heapless::{String, Vec};

/// Command handler
pub type Handler = fn(&CommandArgs) -> Result<CommandOutcome, CommandError>;

struct Entry {
    name: String<MAX_NAME_LEN>,
    handler: Handler,
}

/// Allow-list of command handlers
pub struct CommandRegistry {
    parser: CommandParser,
    entries: Vec<Entry, MAX_HANDLERS>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            parser: CommandParser::new(),
            entries: Vec::new(),
        }
    }

    /// Register `handler` under `name`
    pub fn register_command(&mut self, name: &str, handler: Handler) -> Result<(), CommandError> {
        if self.contains(name) {
            return Err(CommandError::Duplicate);
        }
        let mut key = String::new();
        key.push_str(name).map_err(|_| CommandError::InvalidName)?;
        self.entries
            .push(Entry { name: key, handler })
            .map_err(|_| CommandError::RegistryFull)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name.as_str() == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the handler named by `envelope`
    pub fn dispatch(&self, envelope: &Envelope) -> Result<CommandOutcome, CommandError> {
        let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.name == envelope.function)
        else {
            log::warn!("commands: rejected unknown command '{}'", envelope.function);
            return Err(CommandError::UnknownCommand);
        };
        log::info!("commands: running {}", envelope);
        (entry.handler)(&envelope.args)
    }

    /// Parse `text` and run it if it targets `unit_id`
    ///
    /// Returns `None` for a well-formed command addressed to another unit.
    pub fn execute(&self, unit_id: &str, text: &str) -> Option<Result<CommandOutcome, CommandError>> {
        let envelope = match self.parser.parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("commands: cannot parse '{}': {}", text, e);
                return Some(Err(e));
            }
        };
        if !envelope.target.matches(unit_id) {
            log::debug!("commands: '{}' is for {}", text, envelope.target);
            return None;
        }
        Some(self.dispatch(&envelope))
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static CALLS: AtomicU32 = AtomicU32::new(0);

    fn count(_: &CommandArgs) -> Result<CommandOutcome, CommandError> {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(CommandOutcome::ok())
    }

    fn echo(args: &CommandArgs) -> Result<CommandOutcome, CommandError> {
        let n: u32 = args.parse(0)?;
        Ok(CommandOutcome::with(if n > 10 { "big" } else { "small" }))
    }

    #[test]
    fn test_dispatch_registered() {
        let mut registry = CommandRegistry::new();
        registry.register_command("echo", echo).unwrap();

        let outcome = registry.execute("r1", "r1:echo(42)").unwrap().unwrap();
        assert_eq!(outcome.text(), "big");
        assert_eq!(
            registry.execute("r1", "r1:echo(x)"),
            Some(Err(CommandError::InvalidArgs))
        );
    }

    #[test]
    fn test_unknown_command_never_runs() {
        let mut registry = CommandRegistry::new();
        registry.register_command("count", count).unwrap();
        let before = CALLS.load(Ordering::SeqCst);

        assert_eq!(
            registry.execute("r1", "r1:format_flash()"),
            Some(Err(CommandError::UnknownCommand))
        );
        assert_eq!(CALLS.load(Ordering::SeqCst), before);
    }

    #[test]
    fn test_targeting() {
        let mut registry = CommandRegistry::new();
        registry.register_command("echo", echo).unwrap();

        assert_eq!(registry.execute("r1", "r2:echo(1)"), None);
        assert!(registry.execute("r2", "*:echo(1)").unwrap().is_ok());
        assert_eq!(
            registry.execute("r1", "garbage"),
            Some(Err(CommandError::Malformed))
        );
    }

    #[test]
    fn test_duplicates_and_capacity() {
        let mut registry = CommandRegistry::new();
        registry.register_command("echo", echo).unwrap();
        assert_eq!(
            registry.register_command("echo", count),
            Err(CommandError::Duplicate)
        );

        let names = ["a", "b", "c", "d", "e", "f", "g"];
        for name in names {
            registry.register_command(name, count).unwrap();
        }
        assert_eq!(registry.len(), MAX_HANDLERS);
        assert_eq!(
            registry.register_command("h", count),
            Err(CommandError::RegistryFull)
        );
    }
}
