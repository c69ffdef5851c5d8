pub mod parser;
pub mod registry;
pub mod types;

pub use parser::CommandParser;
pub use registry::{CommandRegistry, Handler};
pub use types::{CommandArgs, CommandError, CommandOutcome, Envelope, Target};
