//! Command envelope parser
//!
//! Parsing is strict: anything that is not exactly
//! `target:function(arg,...)` with legal characters is rejected before a
//! handler is looked up.

use crate::commands::types::{CommandArgs, CommandError, Envelope, Target};
use crate::config::commands::MAX_NAME_LEN;
use crate::config::protocol::{BROADCAST, MAX_UNIT_ID_LEN};
use heapless::String;

/// Parser for command envelopes
pub struct CommandParser;

impl CommandParser {
    /// Create a new command parser
    pub fn new() -> Self {
        Self
    }

    /// Parse an envelope such as `r1:led_on()` or `*:interval(30)`
    pub fn parse(&self, text: &str) -> Result<Envelope, CommandError> {
        let text = text.trim();
        let (target, call) = text.split_once(':').ok_or(CommandError::Malformed)?;
        let target = Self::parse_target(target)?;

        let open = call.find('(').ok_or(CommandError::Malformed)?;
        if !call.ends_with(')') {
            return Err(CommandError::Malformed);
        }
        let function = &call[..open];
        let inner = &call[open + 1..call.len() - 1];
        if inner.contains(['(', ')']) {
            return Err(CommandError::Malformed);
        }

        if !Self::is_identifier(function) || function.len() > MAX_NAME_LEN {
            return Err(CommandError::InvalidName);
        }
        let mut name = String::new();
        name.push_str(function).map_err(|_| CommandError::InvalidName)?;

        Ok(Envelope {
            target,
            function: name,
            args: Self::parse_args(inner)?,
        })
    }

    fn parse_target(target: &str) -> Result<Target, CommandError> {
        if target == BROADCAST {
            return Ok(Target::Broadcast);
        }
        if target.is_empty()
            || target.len() > MAX_UNIT_ID_LEN
            || !target.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(CommandError::InvalidName);
        }
        let mut id = String::new();
        id.push_str(target).map_err(|_| CommandError::InvalidName)?;
        Ok(Target::Unit(id))
    }

    fn parse_args(inner: &str) -> Result<CommandArgs, CommandError> {
        let mut args = CommandArgs::new();
        if inner.trim().is_empty() {
            return Ok(args);
        }
        for arg in inner.split(',') {
            let arg = arg.trim();
            if arg.is_empty() || !arg.chars().all(Self::is_arg_char) {
                return Err(CommandError::Malformed);
            }
            args.push(arg)?;
        }
        Ok(args)
    }

    /// `[A-Za-z_][A-Za-z0-9_]*`
    fn is_identifier(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    fn is_arg_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '.')
    }
}

impl Default for CommandParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_no_args() {
        let parser = CommandParser::new();
        let env = parser.parse("r1:led_on()").unwrap();

        assert!(matches!(env.target, Target::Unit(ref id) if id.as_str() == "r1"));
        assert!(!env.target.matches("r2"));
        assert_eq!(env.function.as_str(), "led_on");
        assert!(env.args.is_empty());
    }

    #[test]
    fn test_parse_broadcast_with_args() {
        let parser = CommandParser::new();
        let env = parser.parse("*:interval(30, fast)").unwrap();

        assert_eq!(env.target, Target::Broadcast);
        assert!(env.target.matches("anything"));
        assert_eq!(env.args.len(), 2);
        assert_eq!(env.args.parse::<u32>(0), Ok(30));
        assert_eq!(env.args.get(1), Some("fast"));
    }

    #[test]
    fn test_display_round_trips_text() {
        let parser = CommandParser::new();
        let env = parser.parse("base-2:set(a,-1.5)").unwrap();
        assert_eq!(env.to_string(), "base-2:set(a,-1.5)");
    }

    #[test]
    fn test_rejects_malformed() {
        let parser = CommandParser::new();
        for text in [
            "",
            "led_on()",
            "r1:led_on",
            "r1:led_on(",
            "r1:led_on())",
            "r1:led(on(x))",
            "r1:led_on(a,)",
            "r1:led_on(a b)",
            "r1:led_on(a;b)",
        ] {
            assert_eq!(parser.parse(text), Err(CommandError::Malformed), "{}", text);
        }
    }

    #[test]
    fn test_rejects_bad_names() {
        let parser = CommandParser::new();
        assert_eq!(parser.parse("r 1:led_on()"), Err(CommandError::InvalidName));
        assert_eq!(parser.parse(":led_on()"), Err(CommandError::InvalidName));
        assert_eq!(parser.parse("r1:1led()"), Err(CommandError::InvalidName));
        assert_eq!(parser.parse("r1:led-on()"), Err(CommandError::InvalidName));
        assert_eq!(
            parser.parse("r1:a_really_long_function_name_here()"),
            Err(CommandError::InvalidName)
        );
    }

    #[test]
    fn test_argument_bounds() {
        let parser = CommandParser::new();
        assert_eq!(parser.parse("r1:f(1,2,3,4,5)"), Err(CommandError::TooManyArgs));
        assert_eq!(
            parser.parse("r1:f(abcdefghijklmnopqrstuvwxyz)"),
            Err(CommandError::ArgTooLong)
        );
    }
}
