use clap::{Args, Subcommand};

use crate::exit::CliResult;

pub mod demo;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a channel and an envelope over an in-process transport.
    Demo(DemoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command) -> CliResult<i32> {
    match command {
        Command::Demo(args) => demo::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Document content pushed to the editor.
    #[arg(long, default_value = "hello from the channel")]
    pub content: String,
    /// File extension advertised in the init handshake.
    #[arg(long, default_value = "txt")]
    pub file_extension: String,
    /// Locale pushed to the editor after the handshake.
    #[arg(long)]
    pub locale: Option<String>,
    /// Overall timeout for the scripted run (e.g. 5s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build information.
    #[arg(long)]
    pub extended: bool,
}

/// Parse a human duration like `5s`, `500ms`, or `2m`.
pub fn parse_duration(input: &str) -> Option<std::time::Duration> {
    let input = input.trim();
    let (digits, unit) = input.split_at(input.find(|c: char| !c.is_ascii_digit())?);
    let value: u64 = digits.parse().ok()?;
    match unit {
        "ms" => Some(std::time::Duration::from_millis(value)),
        "s" => Some(std::time::Duration::from_secs(value)),
        "m" => Some(std::time::Duration::from_secs(value * 60)),
        _ => None,
    }
}
