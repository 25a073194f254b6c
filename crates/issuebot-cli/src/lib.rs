//! CLI argument model, flag validation and token/allow-list loading for the
//! `issuebot` binary.

pub mod cli_args;
pub mod token_loading;
pub mod validation;

pub use cli_args::Cli;
pub use token_loading::{load_allow_list, load_token};
pub use validation::{validate_cli, ConfigError, TokenSource, TokenSources};
