//! vrms server binary.
//!
//! Runs the scene server and the built-in modules. See the `vrms` library
//! for the protocol, store and module host.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vrms::client::Client;
use vrms::config::Config;
use vrms::constants::SIGNAL_POLL_INTERVAL;
use vrms::modules::{self, ModuleHost};
use vrms::runtime::{Runtime, SharedRuntime};
use vrms::server::Server;
use vrms::store::ObjectStore;

/// mimalloc handles the many small per-request allocations better than the
/// system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

// CLI
#[derive(Parser)]
#[command(name = "vrms-server")]
#[command(version)]
#[command(about = "Shared-memory scene server for VR compositors")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Listening socket path
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Seconds of client silence before disconnect (0 disables)
    #[arg(long)]
    idle_timeout: Option<u64>,
    /// Do not start head tracker, hotplug or script modules
    #[arg(long)]
    no_modules: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default)
    Serve(ServeArgs),
    /// Print the effective configuration
    Config,
    /// Connect to a running server, create and destroy a scene
    Probe {
        /// Socket to probe (defaults to the configured path)
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

fn init_logging(config: &Config) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Some(path) = &config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file at {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        default_hook(panic_info);
    }));
    Ok(())
}

fn serve(mut config: Config, args: ServeArgs) -> Result<()> {
    if let Some(socket) = args.socket {
        config.socket_path = Some(socket);
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout_secs = secs;
    }

    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let runtime: Arc<dyn Runtime> =
        Arc::new(SharedRuntime::new(ObjectStore::new(config.max_objects_per_scene)));

    // Modules stop and join on every exit path, including a failed bind.
    let mut host = scopeguard::guard(ModuleHost::new(Arc::clone(&runtime)), |mut host| {
        host.shutdown();
    });
    if args.no_modules {
        log::info!("[main] modules disabled");
    } else {
        for module in modules::from_config(&config.modules) {
            host.spawn(module)?;
        }
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async {
        let server = Server::bind(&config.server_config(), runtime)?;
        let token = server.shutdown_token();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SIGNAL_POLL_INTERVAL);
            loop {
                tick.tick().await;
                if SHUTDOWN_FLAG.load(Ordering::Relaxed) {
                    log::info!("[main] shutdown signal received");
                    token.cancel();
                    break;
                }
                if token.is_cancelled() {
                    break;
                }
            }
        });

        server.run().await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn probe(config: &Config, socket: Option<PathBuf>) -> Result<()> {
    let path = socket.unwrap_or_else(|| config.socket_path());
    let mut client = Client::connect(&path)?;

    let created = client.create_scene("vrms-probe")?;
    println!("CREATE_SCENE  -> id={} error={}", created.id, created.error);
    let destroyed = client.destroy_scene()?;
    println!("DESTROY_SCENE -> id={} error={}", destroyed.id, destroyed.error);

    created.into_result()?;
    destroyed.into_result()?;
    println!("{} is serving", path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    init_logging(&config)?;

    match cli.command {
        None => serve(config, cli.serve)?,
        Some(Commands::Serve(args)) => serve(config, args)?,
        Some(Commands::Config) => println!("{}", serde_json::to_string_pretty(&config)?),
        Some(Commands::Probe { socket }) => probe(&config, socket)?,
    }

    Ok(())
}
