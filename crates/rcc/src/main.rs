//! rcc CLI entry point.
//!
//! Every subcommand runs under a [`LifecycleGuard`], which flushes pending
//! telemetry and logs before the process exits, whatever the outcome.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rcc::commands;
use rcc::lifecycle::{LifecycleContext, LifecycleGuard};
use rcc::logging::init_logging;
use rcc::telemetry::{LogSink, Telemetry};
use rcc_env::Locations;

#[derive(Parser, Debug)]
#[command(name = "rcc")]
#[command(about = "Run commands inside isolated, content-identified environments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Append log output to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Who is driving this run; metrics are reported as `rcc.<controller>`
    #[arg(long, global = true, default_value = "user")]
    controller: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the content fingerprint of a directory
    Fingerprint {
        dir: PathBuf,

        /// Also print the fingerprint of every subdirectory
        #[arg(long)]
        index: bool,
    },

    /// Print the variables for running inside an environment
    Env {
        /// Environment prefix directory
        location: PathBuf,

        /// Environment hash (default: short fingerprint of the location)
        #[arg(long)]
        hash: Option<String>,

        /// Include the inherited process environment
        #[arg(long)]
        full: bool,
    },

    /// Run a command inside an environment
    Run {
        /// Environment prefix directory
        location: PathBuf,

        /// Environment hash (default: short fingerprint of the location)
        #[arg(long)]
        hash: Option<String>,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Report the installed micromamba version
    Micromamba,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Fingerprint { .. } => "fingerprint",
            Commands::Env { .. } => "env",
            Commands::Run { .. } => "run",
            Commands::Micromamba => "micromamba",
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level, cli.log_file.as_deref()) {
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let locations = Locations::from_env();
    let telemetry = Telemetry::new(Arc::new(LogSink), rcc_env::tracking_allowed());
    let ctx = Arc::new(LifecycleContext::new(
        locations,
        cli.controller,
        cli.command.name(),
        telemetry,
    ));

    let termination = runtime.block_on(async {
        let guard = LifecycleGuard::start(ctx.clone());
        guard.run(execute(cli.command, ctx.clone())).await
    });

    // Leftover recycling deletions are detached; do not wait for them.
    runtime.shutdown_background();
    termination.apply();
}

async fn execute(command: Commands, ctx: Arc<LifecycleContext>) -> anyhow::Result<()> {
    let result = dispatch(command, &ctx).await;
    commands::after_command(&ctx, result)
}

async fn dispatch(command: Commands, ctx: &LifecycleContext) -> anyhow::Result<()> {
    match command {
        Commands::Fingerprint { dir, index } => {
            for line in commands::fingerprint_report(&dir, index)? {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::Env {
            location,
            hash,
            full,
        } => {
            let assembler = commands::assembler_for(ctx.locations(), &location, hash)?;
            for line in commands::environment_report(&assembler, &location, full) {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::Run {
            location,
            hash,
            command,
        } => {
            let assembler = commands::assembler_for(ctx.locations(), &location, hash)?;
            commands::run_in_environment(&assembler, &location, &command).await
        }
        Commands::Micromamba => {
            for line in commands::micromamba_report(ctx.locations()).await {
                println!("{}", line);
            }
            Ok(())
        }
    }
}
