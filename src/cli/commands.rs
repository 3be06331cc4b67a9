//! CLI command definitions

use clap::Args;

/// Run the greeting pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Id of the greeting human
    #[arg(long, default_value = "h1")]
    pub greeter_id: String,

    /// Id of the greeted robot (unknown ids are rejected)
    #[arg(long, default_value = "r1")]
    pub greetee_id: String,

    #[arg(long, default_value = "Hello")]
    pub salutation: String,

    /// Keep documents in memory instead of SQLite
    #[arg(long)]
    pub in_memory: bool,

    /// Extra scope values (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub var: Vec<(String, String)>,
}

/// Publish through a shared broker ladder
#[derive(Debug, Args, Clone)]
pub struct BrokerCommand {
    /// Concurrent publishers
    #[arg(short, long, default_value_t = 4)]
    pub publishers: usize,

    /// Connection attempts refused before the broker accepts
    #[arg(long, default_value_t = 2)]
    pub fail_connects: usize,

    /// Model whose manager topology is declared
    #[arg(long, default_value = "Human")]
    pub model: String,

    /// Event routing key the publishers use
    #[arg(long, default_value = "human.add")]
    pub event: String,
}

/// Validate a runtime configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Output the effective configuration as JSON
    #[arg(long)]
    pub json: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}
