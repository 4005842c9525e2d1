//! Command line configuration for the bridge processes.
//!
//! Every entry point takes positional arguments only. Too few (or
//! malformed) arguments print the entry point's usage line to stderr and
//! terminate the process with exit code -1. Values may start with a hyphen
//! and arguments past the last positional are ignored. Only a lone
//! `--help` or `-h` prints help.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use thiserror::Error;
use url::Url;

/// Ledger user whose primary party the operator processes act for.
pub const OPERATOR_USER: &str = "operator";
/// Ledger user whose primary party the alice process acts for.
pub const ALICE_USER: &str = "alice";

/// Application ids used when submitting commands.
pub const OPERATOR_APP_ID: &str = "OperatorMainApp";
pub const ALICE_APP_ID: &str = "AliceMainApp";

pub const DEFAULT_PROCESSOR_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{reason}\n{usage}")]
    Usage { usage: &'static str, reason: String },
    /// `--help` output; not a failure.
    #[error("{0}")]
    Informational(String),
    #[error("Invalid ledger address {0}")]
    LedgerAddress(String),
}

/// Arguments of one entry point.
pub trait EntryArgs: Parser {
    const USAGE: &'static str;
}

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(
    about = "Operator: accepts transfer requests and broadcasts signed transfers",
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct OperatorArgs {
    #[arg(value_name = "HOST", allow_hyphen_values = true)]
    pub host: String,
    #[arg(value_name = "PORT")]
    pub port: u16,
    #[arg(value_name = "PROJECTID", allow_hyphen_values = true)]
    pub project_id: String,
    #[arg(value_name = "APIKEY", allow_hyphen_values = true)]
    pub api_key: String,
    #[arg(hide = true, allow_hyphen_values = true, trailing_var_arg = true)]
    pub extra: Vec<String>,
}

impl EntryArgs for OperatorArgs {
    const USAGE: &'static str = "Usage: HOST PORT PROJECTID APIKEY";
}

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(
    about = "Alice: signs unsigned transfers with a local keyfile",
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct AliceArgs {
    #[arg(value_name = "HOST", allow_hyphen_values = true)]
    pub host: String,
    #[arg(value_name = "PORT")]
    pub port: u16,
    #[arg(value_name = "PROJECTID", allow_hyphen_values = true)]
    pub project_id: String,
    #[arg(value_name = "APIKEY", allow_hyphen_values = true)]
    pub api_key: String,
    #[arg(value_name = "KEYFILENAME", allow_hyphen_values = true)]
    pub keyfile: PathBuf,
    #[arg(value_name = "KEYFILEPASSWORD", allow_hyphen_values = true)]
    pub password: String,
    #[arg(hide = true, allow_hyphen_values = true, trailing_var_arg = true)]
    pub extra: Vec<String>,
}

impl EntryArgs for AliceArgs {
    const USAGE: &'static str = "Usage: HOST PORT PROJECTID APIKEY KEYFILENAME KEYFILEPASSWORD";
}

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(
    about = "Asset operator: mints and transfers assets",
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct AssetOperatorArgs {
    #[arg(value_name = "HOST", allow_hyphen_values = true)]
    pub host: String,
    #[arg(value_name = "PORT")]
    pub port: u16,
    #[arg(value_name = "PROJECTID", allow_hyphen_values = true)]
    pub project_id: String,
    #[arg(value_name = "APIKEY", allow_hyphen_values = true)]
    pub api_key: String,
    #[arg(value_name = "KEYFILENAME", allow_hyphen_values = true)]
    pub keyfile: PathBuf,
    #[arg(value_name = "KEYFILEPASSWORD", allow_hyphen_values = true)]
    pub password: String,
    #[arg(hide = true, allow_hyphen_values = true, trailing_var_arg = true)]
    pub extra: Vec<String>,
}

impl EntryArgs for AssetOperatorArgs {
    const USAGE: &'static str = "Usage: HOST PORT PROJECTID APIKEY KEYFILENAME KEYFILEPASSWORD";
}

/// Parses `args` (including the program name) into `A`.
pub fn parse_args<A, I, T>(args: I) -> Result<A, ConfigError>
where
    A: EntryArgs,
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    if let [_, flag] = args.as_slice() {
        if flag == "--help" || flag == "-h" {
            return Err(ConfigError::Informational(
                A::command().render_help().to_string(),
            ));
        }
    }
    A::try_parse_from(args).map_err(|e| ConfigError::Usage {
        usage: A::USAGE,
        reason: e.render().to_string().trim_end().to_owned(),
    })
}

/// Parses the process arguments, exiting with -1 and a usage line on failure.
pub fn parse_or_exit<A: EntryArgs>() -> A {
    match parse_args::<A, _, _>(std::env::args_os()) {
        Ok(args) => args,
        Err(ConfigError::Informational(text)) => {
            println!("{}", text);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(-1);
        }
    }
}

/// Base URL of the ledger's JSON API.
pub fn ledger_url(host: &str, port: u16) -> Result<Url, ConfigError> {
    let address = format!("http://{}:{}", host, port);
    Url::parse(&address).or(Err(ConfigError::LedgerAddress(address)))
}
