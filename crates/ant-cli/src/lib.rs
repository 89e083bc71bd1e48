//! Ant CLI library

pub mod commands;
pub mod config;
pub mod error;
pub mod telemetry;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::AntConfig;
use crate::telemetry::LogFormat;

/// Ant - marabunta fleet agent
#[derive(Parser, Debug)]
#[command(name = "ant")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Defaults to `start`
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Options shared by every subcommand; they override `ant.yml`
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// `ant.yml` configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Agent home directory [default: ~/.marabunta]
    #[arg(long, env = "ANT_HOME", global = true)]
    pub home: Option<PathBuf>,

    /// marabunta host
    #[arg(long, global = true)]
    pub marabunta: Option<String>,

    /// Enrollment (HTTPS) port
    #[arg(long, global = true)]
    pub http_port: Option<u16>,

    /// Control stream (gRPC) port
    #[arg(long, global = true)]
    pub grpc_port: Option<u16>,

    /// Client certificate
    #[arg(long, global = true)]
    pub tls_crt: Option<PathBuf>,

    /// Client private key
    #[arg(long, global = true)]
    pub tls_key: Option<PathBuf>,

    /// CA bundle for marabunta's certificate
    #[arg(long, global = true)]
    pub tls_ca: Option<PathBuf>,

    /// Name marabunta's certificate must be valid for
    #[arg(long, global = true)]
    pub server_name: Option<String>,

    /// Enrollment endpoint URL
    #[arg(long, global = true)]
    pub enrollment_url: Option<String>,

    /// CA bundle for the enrollment endpoint
    #[arg(long, global = true)]
    pub enrollment_ca: Option<PathBuf>,

    /// Do not verify the enrollment server certificate
    #[arg(long, global = true)]
    pub insecure_enrollment: bool,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Print the agent identity, creating it if needed
    Id,
    /// Obtain a signed certificate if none is present
    Bootstrap,
    /// Bootstrap if needed, then stream to marabunta until interrupted
    Start,
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let config = AntConfig::from_args(&self.global)?;
        let settings = config.agent_settings()?;

        match self.command.unwrap_or(Commands::Start) {
            Commands::Id => commands::id::run(settings),
            Commands::Bootstrap => commands::bootstrap::run(settings).await,
            Commands::Start => commands::start::run(settings).await,
        }
    }
}
