//! Built-in job handlers.

pub mod command;

pub use command::ExternalCommandHandler;
