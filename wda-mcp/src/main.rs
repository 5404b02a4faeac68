//! `wda-mcp`: WebDriverAgent build-and-sign tool server.
//!
//! Without a subcommand the binary serves JSON-RPC over stdio. `profiles` and
//! `build-sign` run a single operation and print its result as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use wda_mcp::exit_codes;
use wda_mcp::io::config::{ServerConfig, load_config};
use wda_mcp::io::process::CancelToken;
use wda_mcp::io::profiles::{list_profiles, resolve_profile, resolve_profiles_dir};
use wda_mcp::logging;
use wda_mcp::mcp::server::ToolServer;
use wda_mcp::mcp::transport;
use wda_mcp::pipeline::{Backends, PipelineRequest, run_pipeline};

#[derive(Parser)]
#[command(
    name = "wda-mcp",
    version,
    about = "Build and re-sign WebDriverAgent behind a stdio tool server"
)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve newline-delimited JSON-RPC on stdin/stdout (default).
    Serve,
    /// Print the installed provisioning profiles as JSON.
    Profiles,
    /// Build, package and sign once without the server.
    BuildSign {
        /// Provisioning profile to sign with.
        #[arg(long, value_name = "PATH")]
        profile: PathBuf,
        /// Directory containing WebDriverAgent.xcodeproj; searched for when omitted.
        #[arg(long, value_name = "DIR")]
        project: Option<PathBuf>,
        /// The profile belongs to a free developer account.
        #[arg(long)]
        free_account: bool,
        /// Bundle identifier to stamp (free accounts only).
        #[arg(long, value_name = "ID")]
        bundle_id: Option<String>,
        /// Signed archive destination.
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => cmd_serve(config),
        Command::Profiles => cmd_profiles(&config),
        Command::BuildSign {
            profile,
            project,
            free_account,
            bundle_id,
            output,
        } => cmd_build_sign(
            &config,
            BuildSignArgs {
                profile,
                project,
                free_account,
                bundle_id,
                output,
            },
        ),
    }
}

fn cmd_serve(config: ServerConfig) -> Result<()> {
    let backends = Backends::from_config(&config);
    let server = Arc::new(ToolServer::new(config, backends).context("start tool server")?);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;

    info!("serving on stdio");
    let served = runtime.block_on(transport::serve(
        server,
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown_signal(),
    ));
    // A pending stdin read would otherwise hold the runtime open.
    runtime.shutdown_background();
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(err = %err, "cannot listen for interrupt");
        std::future::pending::<()>().await;
    }
}

fn cmd_profiles(config: &ServerConfig) -> Result<()> {
    let backends = Backends::from_config(config);
    let dir = resolve_profiles_dir(config, backends.xcode.as_ref())?;
    let profiles = list_profiles(&dir)?;
    print_json(&profiles)
}

struct BuildSignArgs {
    profile: PathBuf,
    project: Option<PathBuf>,
    free_account: bool,
    bundle_id: Option<String>,
    output: Option<PathBuf>,
}

fn cmd_build_sign(config: &ServerConfig, args: BuildSignArgs) -> Result<()> {
    let backends = Backends::from_config(config);
    let request = PipelineRequest {
        profile: resolve_profile(Some(&args.profile))?,
        project_path: args.project,
        is_free_account: args.free_account,
        bundle_id: args.bundle_id,
        output_path: args.output,
    };
    let outcome = run_pipeline(
        config,
        backends.builder.as_ref(),
        backends.signer.as_ref(),
        &request,
        &CancelToken::new(),
    )?;
    print_json(&outcome)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
