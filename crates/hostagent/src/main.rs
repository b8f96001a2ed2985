use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use hostagent::checksum::compute_checksum;
use hostagent::client::AgentClient;
use hostagent::config::{
    AgentConfig, default_config_path, expand_str_path, load_config, write_default_config,
};
use hostagent::logging::{init_logging, parse_level};
use hostagent::process_table::SystemProcessTable;
use hostagent::server::AgentServer;
use hostagent::shell::PowerShell;
use hostagent::transport::Listener;
use hostagent::{WaitEvent, build_service};
use hostagent_protocol::{StartRequest, parse_exposes, parse_volume_paths};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.common.config {
        Some(path) => expand_str_path(&path.to_string_lossy())?,
        None => default_config_path()?,
    };
    let config = load_config(&config_path)?;

    let level = cli.common.log_level(&config);
    init_logging(level, cli.common.json || config.logging.json);
    debug!("config file: {}", config_path.display());

    match cli.command {
        Command::Serve => serve(config),
        Command::Process {
            command: ProcessCommand::Run(args),
        } => {
            let code = run_process(config, args)?;
            if let Some(code) = code.filter(|c| *c != 0) {
                std::process::exit(code);
            }
            Ok(())
        }
        Command::Process {
            command: ProcessCommand::Kill { name },
        } => kill_process(config, name),
        Command::Volume {
            command: VolumeCommand::Mount(args),
        } => mount_volumes(config, args),
        Command::Checksum { path } => print_checksum(path),
        Command::Version => print_version(config),
        Command::Config { command } => handle_config(&config, &config_path, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Host agent: runs host binaries for containers and manages their firewall rules.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true, env = "HOSTAGENT_CONFIG")]
    config: Option<PathBuf>,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -v)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

impl CommonOpts {
    fn log_level(&self, config: &AgentConfig) -> LevelFilter {
        if self.trace {
            LevelFilter::Trace
        } else if self.debug || config.debug {
            LevelFilter::Debug
        } else {
            match self.verbose {
                0 => parse_level(&config.logging.level),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the agent in the foreground
    Serve,
    /// Manage host processes through a running agent
    Process {
        #[command(subcommand)]
        command: ProcessCommand,
    },
    /// Manage volume links through a running agent
    #[command(alias = "vol")]
    Volume {
        #[command(subcommand)]
        command: VolumeCommand,
    },
    /// Print the SHA-1 checksum of a file
    Checksum { path: PathBuf },
    /// Print agent and host versions reported by a running agent
    Version,
    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ProcessCommand {
    /// Start a host binary, stream its output and stop it on exit or Ctrl-C
    Run(RunArgs),
    /// Kill a managed process by name
    Kill { name: String },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Binary located on the host
    #[arg(long)]
    path: PathBuf,
    /// Working directory, defaults to the binary's directory
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Exposed ports, e.g. TCP:443 UDP:4789-4790
    #[arg(long, num_args = 1.., value_delimiter = ' ')]
    exposes: Vec<String>,
    /// Environment variables, e.g. KEY=value
    #[arg(long, num_args = 1..)]
    envs: Vec<String>,
    /// Keep-alive ping interval in seconds
    #[arg(long, default_value_t = 60)]
    keepalive_interval: u64,
    /// Arguments passed to the binary
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum VolumeCommand {
    /// Link paths mounted into a container onto host paths
    Mount(MountArgs),
}

#[derive(Debug, Args)]
struct MountArgs {
    /// Labels of the container this runs in, e.g. app=flannel tier=node
    #[arg(long, required = true, num_args = 1.., value_delimiter = ' ')]
    selectors: Vec<String>,
    /// Paths to link as CONTAINER_PATH:HOST_PATH
    #[arg(long, num_args = 1.., value_delimiter = ' ')]
    paths: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn serve(config: AgentConfig) -> Result<()> {
    let service = build_service(
        Arc::new(PowerShell::new()),
        Arc::new(SystemProcessTable::new()),
        Arc::new(config.container_lookup()),
        config.supervisor_config(),
        config.allow_list(),
    );
    if config.allow_list().is_enabled() {
        info!(
            "Process path allow-list active ({} entries)",
            config.white_list.process_paths.len()
        );
    }

    let listener = Listener::bind(&config.listen)
        .await
        .with_context(|| format!("binding to {}", config.listen))?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    Arc::new(AgentServer::new(service))
        .serve(listener, shutdown)
        .await
}

fn resolve_binary(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("resolving current directory")?
            .join(path)
    };
    if !absolute.is_file() {
        anyhow::bail!("--path {} is invalid: not a file", path.display());
    }
    Ok(absolute)
}

#[tokio::main]
async fn run_process(config: AgentConfig, args: RunArgs) -> Result<Option<i32>> {
    let path = resolve_binary(&args.path)?;
    let checksum = compute_checksum(&path)
        .await
        .with_context(|| format!("failed to get checksum for --path {}", path.display()))?;
    let exposes = parse_exposes(&args.exposes).context("failed to parse --exposes")?;
    let dir = match args.dir {
        Some(dir) => dir,
        None => path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let client = AgentClient::new(config.listen.clone());
    let process_name = client
        .start(StartRequest {
            path: path.to_string_lossy().into_owned(),
            checksum,
            args: args.args,
            envs: args.envs,
            dir: dir.to_string_lossy().into_owned(),
            exposes,
        })
        .await?;
    info!("Started {process_name}");

    let mut session = client.keep_alive(&process_name).await?;
    let mut wait = client.wait(&process_name).await?;
    let mut ticker = tokio::time::interval(Duration::from_secs(args.keepalive_interval.max(1)));
    ticker.tick().await;

    let outcome: Result<Option<i32>> = async {
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        loop {
            tokio::select! {
                event = wait.next() => match event? {
                    Some(WaitEvent::Stdout(data)) => {
                        stdout.write_all(&data).await?;
                        stdout.flush().await?;
                    }
                    Some(WaitEvent::Stderr(data)) => {
                        stderr.write_all(&data).await?;
                        stderr.flush().await?;
                    }
                    Some(WaitEvent::Exited(code)) => {
                        info!("{process_name} exited with {code:?}");
                        return Ok(code);
                    }
                    None => return Ok(None),
                },
                _ = ticker.tick() => {
                    if let Err(e) = session.ping().await {
                        warn!("Failed to keep alive: {e}");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping {process_name}");
                    return Ok(None);
                }
            }
        }
    }
    .await;

    // Closing the session kills the process and its firewall rules.
    let closed = session.close().await;
    let code = outcome?;
    closed?;
    Ok(code)
}

#[tokio::main]
async fn kill_process(config: AgentConfig, name: String) -> Result<()> {
    AgentClient::new(config.listen).kill(&name).await?;
    println!("killed {name}");
    Ok(())
}

#[tokio::main]
async fn mount_volumes(config: AgentConfig, args: MountArgs) -> Result<()> {
    let paths = parse_volume_paths(&args.paths).context("failed to parse --paths")?;
    let mounted = AgentClient::new(config.listen)
        .mount(args.selectors, paths)
        .await?;
    for destination in mounted {
        println!("mounted {destination}");
    }
    Ok(())
}

#[tokio::main]
async fn print_checksum(path: PathBuf) -> Result<()> {
    let sum = compute_checksum(&path).await?;
    println!("{sum}  {}", path.display());
    Ok(())
}

#[tokio::main]
async fn print_version(config: AgentConfig) -> Result<()> {
    let version = AgentClient::new(config.listen).version().await?;
    println!("{}", serde_json::to_string_pretty(&version)?);
    Ok(())
}

fn handle_config(config: &AgentConfig, path: &Path, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            println!("# {}", path.display());
            print!("{}", config.to_toml()?);
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            write_default_config(path)?;
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}
