mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use depscan::config::{Settings, RC_CONF_FILE};
use depscan::manager::{Manager, ManagerError, ServiceState};

#[derive(Parser)]
#[command(name = "depscan")]
#[command(about = "Cache service dependencies and track service state")]
struct Args {
    /// Shell-style config file holding svcdir
    #[arg(long, default_value = RC_CONF_FILE)]
    config: PathBuf,

    /// Service directory (overrides the config file)
    #[arg(long)]
    svcdir: Option<PathBuf>,

    /// Directory holding init scripts
    #[arg(long)]
    init_dir: Option<PathBuf>,

    /// Directory holding one subdirectory per runlevel
    #[arg(long)]
    runlevels_dir: Option<PathBuf>,

    /// Do not require root for commands that modify svcdir
    #[arg(long)]
    skip_root_check: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recreate the svcdir skeleton and refresh the dependency cache
    Update {
        /// Rebuild even if the cache is current
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Print the start (or stop) order of a runlevel or services
    Order {
        /// Print the stop order instead
        #[arg(long)]
        stop: bool,

        /// A runlevel name, or one or more service names
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Show service states
    Status {
        /// Only this service
        service: Option<String>,
    },

    /// Move a service from one state to another
    Transition {
        service: String,
        from: ServiceState,
        to: ServiceState,
    },

    /// Mark services interrupted mid-transition as broken
    Recover,

    /// Remove volatile svcdir subdirectories
    Prune,
}

impl Args {
    fn settings(&self) -> Result<Settings, ManagerError> {
        let mut settings = match &self.svcdir {
            Some(svcdir) => Settings {
                svcdir: svcdir.clone(),
                ..Settings::default()
            },
            None => Settings::from_config_file(&self.config)?,
        };
        if let Some(dir) = &self.init_dir {
            settings.init_dir = dir.clone();
        }
        if let Some(dir) = &self.runlevels_dir {
            settings.runlevels_dir = dir.clone();
        }
        Ok(settings)
    }
}

async fn run(args: Args) -> Result<(), ManagerError> {
    let mut manager = Manager::new(args.settings()?);
    if args.skip_root_check {
        manager = manager.skip_root_check();
    }

    match args.command {
        Command::Update { force } => commands::update(&manager, force).await,
        Command::Order { stop, targets } => commands::order(&manager, &targets, stop).await,
        Command::Status { service } => commands::status(&manager, service.as_deref()),
        Command::Transition { service, from, to } => {
            commands::transition(&manager, &service, from, to)
        }
        Command::Recover => commands::recover(&manager),
        Command::Prune => commands::prune(&manager),
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("depscan: {}", e);
        std::process::exit(1);
    }
}
