//! Shipwright CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(about = "Two-stage build-and-release pipelines for Rust services", long_about = None)]
struct Cli {
    /// Docker daemon to talk to (unix://, tcp:// or http://)
    #[arg(long, global = true, env = "DOCKER_HOST")]
    docker_host: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline definition
    Validate {
        /// Path to the definition file
        #[arg(default_value = "shipwright.kdl")]
        path: PathBuf,
        /// Source directory to check the artifact name against
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Print the rendered Dockerfile
    Render {
        #[arg(default_value = "shipwright.kdl")]
        path: PathBuf,
        /// Print the .dockerignore for the exclusion list instead
        #[arg(long)]
        dockerignore: bool,
    },
    /// Build, verify and publish the release image
    Build {
        #[arg(default_value = "shipwright.kdl")]
        path: PathBuf,
        /// Skip the verification probes
        #[arg(long)]
        no_verify: bool,
        /// Push every tag after verification
        #[arg(long)]
        push: bool,
        /// Keep the Build Stage image after the run
        #[arg(long)]
        keep_builder: bool,
        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
        /// Extra tag variable, usable as ${NAME} (repeatable)
        #[arg(long = "var", value_name = "NAME=VALUE", value_parser = commands::build::parse_var)]
        vars: Vec<(String, String)>,
        /// Registry user for pushes
        #[arg(long, env = "SHIPWRIGHT_REGISTRY_USERNAME")]
        registry_username: Option<String>,
        /// Registry password or token for pushes
        #[arg(long, env = "SHIPWRIGHT_REGISTRY_PASSWORD", hide_env_values = true)]
        registry_password: Option<String>,
    },
    /// Run the verification probes against an existing image
    Verify {
        /// Image reference
        image: String,
        #[arg(default_value = "shipwright.kdl")]
        path: PathBuf,
    },
    /// Print the process configuration as KEY=value lines
    Env {
        #[arg(default_value = "shipwright.kdl")]
        path: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let docker_host = cli.docker_host.as_deref();

    match cli.command {
        Commands::Validate { path, source } => {
            commands::validate(&path, source.as_deref())?;
        }
        Commands::Render { path, dockerignore } => {
            commands::render(&path, dockerignore)?;
        }
        Commands::Build {
            path,
            no_verify,
            push,
            keep_builder,
            json,
            vars,
            registry_username,
            registry_password,
        } => {
            let options = shipwright_runner::RunOptions {
                verify: !no_verify,
                push,
                keep_builder,
            };
            let login = commands::RegistryLogin::from_args(registry_username, registry_password)?;
            commands::build::run(&path, docker_host, login, options, &vars, json).await?;
        }
        Commands::Verify { image, path } => {
            commands::verify::run(&image, &path, docker_host).await?;
        }
        Commands::Env { path } => {
            commands::env(&path)?;
        }
    }

    Ok(())
}
