use anyhow::Context;
use clap::Parser;
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::Arc;
use webserv::{CredentialValidator, Server, ServerConfig, TriggerMode, UserStore, logging};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Static-file HTTP/1.1 server on an epoll reactor.
#[derive(Parser, Debug)]
#[command(name = "webserv", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Host address to bind
    #[arg(long)]
    host: Option<String>,

    /// Directory static resources are served from
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Idle connection timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Register connections level-triggered instead of edge-triggered
    #[arg(long)]
    level_triggered: bool,

    /// Linger on close so queued output is flushed
    #[arg(long)]
    linger: bool,

    /// JSON file of users to seed the credential store with
    #[arg(long)]
    users: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Write daily log files here instead of stdout
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(root) = self.root {
            config.root_dir = root;
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout_ms = ms;
        }
        if let Some(n) = self.workers {
            config.workers = n;
        }
        if self.level_triggered {
            config.trigger_mode = TriggerMode::Level;
        }
        if self.linger {
            config.open_linger = true;
        }
        if let Some(users) = self.users {
            config.users_file = Some(users);
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Some(dir) = self.log_dir {
            config.log.dir = Some(dir);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = ServerConfig::from_env().context("loading configuration")?;
    cli.apply(&mut config);

    let _log_guard = logging::init_logging(&config.log).context("initializing logging")?;

    let store = match &config.users_file {
        Some(path) => UserStore::from_json_file(config.user_pool_size, path)
            .with_context(|| format!("loading users from {}", path.display()))?,
        None => UserStore::new(config.user_pool_size),
    };
    let validator: Arc<dyn CredentialValidator> = Arc::new(store);

    let server = Server::bind(config, validator).context("starting server")?;
    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("received interrupt, shutting down");
        handle.shutdown();
    })
    .context("installing Ctrl-C handler")?;

    server.run()?;
    Ok(())
}
