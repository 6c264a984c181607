//! Command-line dialer for relay sessions: argument parsing, logging setup
//! and a line-oriented observer.

pub mod cli;
pub mod logging;
pub mod printer;

pub use cli::{Cli, ConfigError, IceArgs, LoggingArgs, MediaArgs, RoleArg, load_profile};
pub use printer::LinePrinter;
