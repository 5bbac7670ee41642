use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{LevelFilter, debug, info};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use docwsd::config::{APP_NAME, AppConfig, expand};
use docwsd::engine::LoopbackEngine;
use docwsd::pool::jail::JailSpec;
use docwsd::pool::privilege::{Capability, DebugIdentity, platform_controller};
use docwsd::pool::supervisor::{LaunchSpec, SupervisorExit};
use docwsd::server::{self, ServerOptions};
use docwsd::worker::{self, WorkerOptions};
use docwsd::{EXIT_UNAVAILABLE, client, transfer};

/// Marks failures that leave the service unable to start.
#[derive(Debug, Error)]
#[error("startup failed")]
struct StartupFailed;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(exit_code(&err));
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<StartupFailed>().is_some() {
        EXIT_UNAVAILABLE
    } else {
        1
    }
}

#[tokio::main]
async fn async_client(url: String) -> Result<()> {
    client::run(&url).await
}

#[tokio::main]
async fn async_container(port: u16) -> Result<()> {
    handle_container(port).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Children skip the config file and directory setup.
        Command::Worker(cmd) => {
            RuntimeContext::bare(cli.common)
                .init_child_logging(&format!("worker {}", cmd.worker_id));
            handle_worker(cmd)
        }
        Command::Container(cmd) => {
            RuntimeContext::bare(cli.common).init_child_logging("container");
            handle_container_startup()?;
            async_container(cmd.transfer_port)
        }
        Command::Serve(cmd) => handle_serve(&RuntimeContext::init(cli.common)?, cmd),
        Command::Client(cmd) => {
            RuntimeContext::init(cli.common)?;
            async_client(cmd.url.unwrap_or_else(client::default_url))
        }
        Command::Config { command } => {
            handle_config(&RuntimeContext::init(cli.common)?, command)
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Document editing WebSocket relay with a jailed worker pool",
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
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the relay server and its worker pool
    Serve(ServeCommand),
    /// Interactive client: send stdin lines, print replies
    Client(ClientCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Run one worker process (launched by the server)
    #[command(hide = true)]
    Worker(WorkerCommand),
    /// Run the container process (launched by the server)
    #[command(hide = true)]
    Container(ContainerCommand),
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Address for the client listener
    #[arg(long)]
    host: Option<String>,
    /// Client listener port
    #[arg(long)]
    port: Option<u16>,
    /// Loopback port workers connect back to
    #[arg(long)]
    worker_port: Option<u16>,
    /// Loopback port of the file-transfer helper
    #[arg(long)]
    transfer_port: Option<u16>,
    /// Number of workers kept ready
    #[arg(long)]
    prespawn: Option<usize>,
    /// Directory holding the system template
    #[arg(long, value_name = "PATH")]
    sys_template: Option<String>,
    /// Directory holding the application template
    #[arg(long, value_name = "PATH")]
    app_template: Option<String>,
    /// Directory under which jails are created
    #[arg(long, value_name = "PATH")]
    child_root: Option<String>,
    /// Tile cache directory
    #[arg(long, value_name = "PATH")]
    cache_dir: Option<String>,
    /// Run workers without a jail
    #[arg(long)]
    no_jail: bool,
}

impl ServeCommand {
    fn apply(self, config: &mut AppConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.client_port = port;
        }
        if let Some(port) = self.worker_port {
            config.server.worker_port = port;
        }
        if let Some(port) = self.transfer_port {
            config.server.transfer_port = port;
        }
        if let Some(prespawn) = self.prespawn {
            config.pool.prespawn = prespawn;
        }
        if self.sys_template.is_some() {
            config.jail.sys_template = self.sys_template;
        }
        if self.app_template.is_some() {
            config.jail.app_template = self.app_template;
        }
        if self.child_root.is_some() {
            config.jail.child_root = self.child_root;
        }
        if self.cache_dir.is_some() {
            config.paths.cache_dir = self.cache_dir;
        }
        if self.no_jail {
            config.jail.enabled = false;
        }
    }
}

#[derive(Debug, Clone, Args)]
struct ClientCommand {
    /// Server URL (default ws://127.0.0.1:9980/ws)
    #[arg(long)]
    url: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct WorkerCommand {
    #[arg(long)]
    worker_id: u64,
    #[arg(long)]
    worker_port: u16,
    #[arg(long, value_name = "PATH")]
    lock_file: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    child_root: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    sys_template: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    app_template: Option<PathBuf>,
    #[arg(long, value_name = "PATH", default_value = "app")]
    app_subpath: PathBuf,
    #[arg(long)]
    no_jail: bool,
    #[arg(long)]
    simulate_non_root: bool,
    #[arg(long)]
    debug_uid: Option<u32>,
    /// Seconds to keep retrying the connection to the server
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,
}

impl WorkerCommand {
    fn into_options(self) -> Result<WorkerOptions> {
        let jail = match (self.no_jail, self.child_root, self.sys_template, self.app_template) {
            (true, ..) => None,
            (false, Some(child_root), Some(sys_template), Some(app_template)) => Some(JailSpec {
                child_root,
                sys_template,
                app_template,
                app_subpath: self.app_subpath,
            }),
            _ => {
                return Err(anyhow!(
                    "either --no-jail or --child-root, --sys-template and --app-template are required"
                ));
            }
        };
        Ok(WorkerOptions {
            worker_id: self.worker_id,
            worker_port: self.worker_port,
            lock_file: self.lock_file,
            jail,
            debug: DebugIdentity {
                simulate_non_root: self.simulate_non_root,
                uid: self.debug_uid,
            },
            connect_timeout: Duration::from_secs(self.connect_timeout),
        })
    }
}

#[derive(Debug, Clone, Args)]
struct ContainerCommand {
    #[arg(long)]
    transfer_port: u16,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    /// Full context with logging initialized.
    fn init(common: CommonOpts) -> Result<Self> {
        let ctx = Self::new(common)?;
        ctx.init_logging()?;
        debug!("resolved paths: {:#?}", ctx.paths);
        Ok(ctx)
    }

    fn bare(common: CommonOpts) -> Self {
        Self {
            common,
            paths: AppPaths::default(),
            config: AppConfig::default(),
        }
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.log_filter()));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(self.use_color()))
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    /// Children log through env_logger with a prefix naming the process.
    fn init_child_logging(&self, prefix: &str) {
        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return;
        }

        let prefix = prefix.to_string();
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        if env::var_os("RUST_LOG").is_none() {
            builder.filter_level(self.effective_log_level());
        }
        builder
            .format(move |buf, record| {
                writeln!(
                    buf,
                    "[{}] {} {} {}",
                    prefix,
                    chrono::Utc::now().format("%H:%M:%S%.3f"),
                    record.level(),
                    record.args()
                )
            })
            .try_init()
            .ok();
    }

    fn use_color(&self) -> bool {
        let force_color =
            matches!(self.common.color, ColorOption::Always) || env::var_os("FORCE_COLOR").is_some();
        let disable_color = self.common.no_color
            || matches!(self.common.color, ColorOption::Never)
            || env::var_os("NO_COLOR").is_some()
            || (!force_color && !io::stderr().is_terminal());
        !disable_color
    }

    /// Filter used when `RUST_LOG` is unset; also handed to children.
    fn log_filter(&self) -> String {
        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };
        format!("{APP_NAME}={level},docwsd_protocol={level},tower_http={level}")
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure state dir {}",
                self.paths.state_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct AppPaths {
    config_file: PathBuf,
    state_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            state_dir: default_state_dir()?,
        })
    }
}

fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let mut config = ctx.config.clone();
    cmd.apply(&mut config);
    config.validate().context(StartupFailed)?;

    let options = server_options(ctx, &config).context(StartupFailed)?;
    if ctx.common.dry_run {
        info!("dry-run: would serve with {:#?}", options);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.pool.runtime_threads())
        .enable_all()
        .build()
        .context("building runtime")?;

    let exit = runtime.block_on(async move {
        let server = server::start(options).await.context(StartupFailed)?;
        let token = server.shutdown_token();
        tokio::spawn(async move {
            shutdown_signal(token.clone()).await;
            info!("Shutdown signal received, stopping workers...");
            token.cancel();
        });
        server.wait().await
    })?;

    match exit {
        SupervisorExit::Shutdown => Ok(()),
        SupervisorExit::Exhausted => Err(anyhow!("worker supervision stopped unexpectedly")),
    }
}

fn server_options(ctx: &RuntimeContext, config: &AppConfig) -> Result<ServerOptions> {
    let program = match &config.pool.worker_program {
        Some(program) => expand(program)?,
        None => env::current_exe().context("locating own executable")?,
    };
    let lock_file = match &config.paths.lock_file {
        Some(path) => expand(path)?,
        None => ctx.paths.state_dir.join(format!("{APP_NAME}.lock")),
    };

    Ok(ServerOptions {
        host: config.host()?,
        client_port: config.server.client_port,
        worker_port: config.server.worker_port,
        prespawn: config.pool.prespawn,
        claim_timeout: config.pool.claim_timeout(),
        spawn_backoff: config.pool.spawn_backoff(),
        launch: LaunchSpec {
            program,
            worker_port: config.server.worker_port,
            transfer_port: config.server.transfer_port,
            lock_file,
            jail: config.jail_spec()?,
            debug: config.debug_identity(),
            log_filter: Some(
                env::var("RUST_LOG").unwrap_or_else(|_| ctx.log_filter()),
            ),
        },
    })
}

fn handle_worker(cmd: WorkerCommand) -> Result<()> {
    let options = cmd.into_options()?;
    // Jail and privilege drop happen before the runtime spawns any thread.
    worker::prepare(&options).context(StartupFailed)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(worker::run(&options, Box::new(LoopbackEngine::default())))
}

fn handle_container_startup() -> Result<()> {
    platform_controller(DebugIdentity::default())
        .drop_privileges(Capability::SysChroot)
        .context(StartupFailed)?;
    Ok(())
}

async fn handle_container(port: u16) -> Result<()> {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);
    let listener = server::bind(addr, 16)
        .with_context(|| format!("binding transfer listener on {addr}"))
        .context(StartupFailed)?;

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(token.clone()).await;
        token.cancel();
    });
    transfer::serve(listener, shutdown).await
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => {},
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    AppConfig::load(&paths.config_file, &env_prefix())
        .with_context(|| format!("loading {}", paths.config_file.display()))
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        Ok(expand(text)?)
    } else {
        Ok(path)
    }
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("docwsd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_worker_accepts_launch_arguments() {
        let spec = LaunchSpec {
            program: PathBuf::from("/usr/bin/docwsd"),
            worker_port: 9981,
            transfer_port: 9979,
            lock_file: PathBuf::from("/tmp/docwsd.lock"),
            jail: Some(JailSpec {
                child_root: PathBuf::from("/srv/jails"),
                sys_template: PathBuf::from("/srv/sys"),
                app_template: PathBuf::from("/srv/app"),
                app_subpath: PathBuf::from("lo"),
            }),
            debug: DebugIdentity {
                simulate_non_root: true,
                uid: Some(1000),
            },
            log_filter: None,
        };
        let args = spec.worker_args(7);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let Command::Worker(cmd) = parse(&args).command else {
            panic!("expected worker command");
        };
        let options = cmd.into_options().unwrap();
        assert_eq!(options.worker_id, 7);
        assert_eq!(options.worker_port, 9981);
        assert_eq!(options.lock_file, Some(PathBuf::from("/tmp/docwsd.lock")));
        let jail = options.jail.unwrap();
        assert_eq!(jail.child_root, PathBuf::from("/srv/jails"));
        assert_eq!(jail.app_subpath, PathBuf::from("lo"));
        assert!(options.debug.simulate_non_root);
        assert_eq!(options.debug.uid, Some(1000));
    }

    #[test]
    fn test_worker_without_jail() {
        let Command::Worker(cmd) =
            parse(&["worker", "--worker-id", "3", "--worker-port", "1", "--no-jail"]).command
        else {
            panic!("expected worker command");
        };
        assert!(cmd.into_options().unwrap().jail.is_none());
    }

    #[test]
    fn test_worker_requires_jail_or_opt_out() {
        let Command::Worker(cmd) = parse(&["worker", "--worker-id", "3", "--worker-port", "1"]).command
        else {
            panic!("expected worker command");
        };
        assert!(cmd.into_options().is_err());
    }

    #[test]
    fn test_container_accepts_launch_arguments() {
        let spec = LaunchSpec {
            program: PathBuf::from("docwsd"),
            worker_port: 1,
            transfer_port: 4567,
            lock_file: PathBuf::from("lock"),
            jail: None,
            debug: DebugIdentity::default(),
            log_filter: None,
        };
        let args = spec.container_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let Command::Container(cmd) = parse(&args).command else {
            panic!("expected container command");
        };
        assert_eq!(cmd.transfer_port, 4567);
    }

    #[test]
    fn test_serve_flags_override_config() {
        let Command::Serve(cmd) = parse(&[
            "serve",
            "--port",
            "8000",
            "--prespawn",
            "2",
            "--no-jail",
        ])
        .command
        else {
            panic!("expected serve command");
        };
        let mut config = AppConfig::default();
        cmd.apply(&mut config);
        assert_eq!(config.server.client_port, 8000);
        assert_eq!(config.server.worker_port, 9981);
        assert_eq!(config.pool.prespawn, 2);
        assert!(!config.jail.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_startup_failures_map_to_unavailable() {
        let err = anyhow!("boom").context(StartupFailed);
        assert_eq!(exit_code(&err), EXIT_UNAVAILABLE);
        let err = Err::<(), _>(StartupFailed)
            .context("outer")
            .unwrap_err();
        assert_eq!(exit_code(&err), EXIT_UNAVAILABLE);
        assert_eq!(exit_code(&anyhow!("other")), 1);
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "DOCWSD");
    }
}
