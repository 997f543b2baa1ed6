// L2TP/IPsec Gateway

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use l2tp_gateway::{
    config::load_config,
    dhcp_hook::{self, DhcpEvent},
    exec::{Executor, SystemExecutor},
    firewall::{ApplyMode, Firewall},
    ppp::{HookKind, HookParams, NukeOptions, PppManager},
    runner::{install_signal_handlers, Runner, RunnerOptions},
    state_file,
    store::StatusStore,
    supervisor::{Supervisor, SupervisorOptions},
    types::{Config, RunMode},
};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

/// Exit code of a hook or helper command that failed
const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "l2tp-gateway")]
#[command(about = "L2TP/IPsec VPN gateway", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/l2tpgw/config.toml")]
    config: PathBuf,

    /// Alternate status store location, honored by every subcommand
    #[arg(long, global = true)]
    rdf_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one gateway incarnation until it stops; the exit code tells why
    Run {
        #[arg(long, value_enum, default_value_t = RunMode::Full)]
        mode: RunMode,
        /// Accepted for compatibility with older supervisors, unused
        #[arg(long)]
        import_path: Option<PathBuf>,
        /// Do not restart the distribution's networking after stopping
        #[arg(long)]
        no_distro_restart: bool,
    },
    /// Start the runner as a child and stop it on SIGTERM or SIGINT
    Supervise {
        #[arg(long, value_enum, default_value_t = RunMode::Full)]
        mode: RunMode,
        #[arg(long)]
        no_distro_restart: bool,
    },
    /// Print a summary of the gateway status
    Status,
    /// Print the status store as JSON
    Dumpstatus,
    /// Print the parsed configuration
    Dumpconfig,
    /// Clear the status store
    Resetstate,
    /// pppd ip-pre-up hook
    IpPreUp {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// pppd ip-up hook
    IpUp {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// pppd ip-down hook
    IpDown {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Terminate PPP devices and retire their records
    Nuke {
        #[arg(required = true)]
        devices: Vec<String>,
        /// Seconds to wait after SIGTERM, defaults to the configured timeout
        #[arg(long)]
        soft_wait: Option<u64>,
        /// Seconds to wait after SIGKILL, defaults to the configured timeout
        #[arg(long)]
        hard_wait: Option<u64>,
    },
    /// dhclient script hook, parameters come from the environment
    DhclientEvent,
}

/// Get the IPv4 address currently assigned to a network interface
fn get_interface_ip(interface: &str) -> Result<Option<Ipv4Addr>> {
    let interfaces = if_addrs::get_if_addrs().context("Failed to get interface addresses")?;

    for iface in interfaces {
        if iface.name == interface {
            if let if_addrs::IfAddr::V4(ipv4) = iface.addr {
                return Ok(Some(ipv4.ip));
            }
        }
    }

    Ok(None)
}

fn main() -> Result<()> {
    // Two workers: the main loop plus process spawns and signal tasks
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("l2tp-gateway")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_time()
        .enable_io()
        .build()?;

    let code = runtime.block_on(async_main())?;
    drop(runtime);
    std::process::exit(code)
}

async fn async_main() -> Result<i32> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?
        .with_status_file(args.rdf_file.clone());

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    match args.command {
        Command::Run {
            mode,
            import_path,
            no_distro_restart,
        } => {
            if let Some(path) = import_path {
                log::debug!("ignoring --import-path {}", path.display());
            }
            run(config, mode, !no_distro_restart).await
        }
        Command::Supervise {
            mode,
            no_distro_restart,
        } => {
            let opts = SupervisorOptions {
                program: std::env::current_exe().context("Cannot locate own executable")?,
                config: Some(args.config),
                mode,
                rdf_file: args.rdf_file,
                distro_restart: !no_distro_restart,
            };
            supervise(&opts).await
        }
        Command::Status => {
            print_status(&config)?;
            Ok(0)
        }
        Command::Dumpstatus => {
            let status = open_store(&config).snapshot()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(0)
        }
        Command::Dumpconfig => {
            println!("{:#?}", config);
            Ok(0)
        }
        Command::Resetstate => {
            open_store(&config).reset()?;
            log::info!("status store cleared");
            Ok(0)
        }
        Command::IpPreUp { args } => ppp_hook(config, HookKind::PreUp, &args).await,
        Command::IpUp { args } => ppp_hook(config, HookKind::Up, &args).await,
        Command::IpDown { args } => ppp_hook(config, HookKind::Down, &args).await,
        Command::Nuke {
            devices,
            soft_wait,
            hard_wait,
        } => {
            let t = &config.timeouts;
            let opts = NukeOptions::soft_then_hard(
                Duration::from_secs(soft_wait.unwrap_or(t.nuke_soft_wait)),
                Duration::from_secs(hard_wait.unwrap_or(t.nuke_hard_wait)),
            );
            let all_gone = ppp_manager(config).nuke_ppp_devices(&devices, opts).await?;
            if !all_gone {
                log::warn!("some pppd processes survived");
                return Ok(EXIT_FAILURE);
            }
            Ok(0)
        }
        Command::DhclientEvent => {
            let event = DhcpEvent::from_env()?;
            log::debug!("dhclient event: {:?}", event);
            dhcp_hook::handle_event(&config, &SystemExecutor, &event)?;
            Ok(0)
        }
    }
}

fn open_store(config: &Config) -> StatusStore {
    StatusStore::open(&config.paths.status_file)
}

fn ppp_manager(config: Config) -> PppManager {
    let config = Arc::new(config);
    let exec: Arc<dyn Executor> = Arc::new(SystemExecutor);
    let firewall = Firewall::new(exec.clone(), config.paths.firewall_lock.clone(), ApplyMode::Apply);
    PppManager::new(config.clone(), open_store(&config), exec, firewall)
}

async fn run(config: Config, mode: RunMode, distro_restart: bool) -> Result<i32> {
    log::info!("Starting l2tp-gateway runner in {} mode", mode.as_str());

    let signals = install_signal_handlers()?;
    let store = open_store(&config);
    let state_path = config.paths.state_file.clone();

    let mut runner = Runner::new(
        config,
        store,
        Arc::new(SystemExecutor),
        RunnerOptions { mode, distro_restart },
        signals,
    );
    let code = runner.run().await;

    state_file::cleanup(&state_path);
    Ok(code)
}

async fn supervise(opts: &SupervisorOptions) -> Result<i32> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;

    let mut sup = Supervisor::start(opts)?;
    log::info!("runner started with pid {}", sup.pid());

    tokio::select! {
        running = sup.wait_running() => {
            if running? {
                log::info!("runner is running");
            } else {
                log::warn!("runner stopped before reaching RUNNING");
            }
        }
        _ = sigterm.recv() => sup.stop(),
        _ = sigint.recv() => sup.stop(),
    }

    tokio::select! {
        code = sup.wait_stopped() => {
            return Ok(code?.unwrap_or(EXIT_FAILURE));
        }
        _ = sigterm.recv() => log::info!("Received SIGTERM, stopping runner"),
        _ = sigint.recv() => log::info!("Received SIGINT, stopping runner"),
    }
    sup.stop();

    let code = sup.wait_stopped().await?;
    log::info!("Shutdown complete");
    Ok(code.unwrap_or(EXIT_FAILURE))
}

async fn ppp_hook(config: Config, kind: HookKind, args: &[String]) -> Result<i32> {
    let params = HookParams::from_env(args).with_context(|| format!("Invalid {} parameters", kind))?;
    let ok = ppp_manager(config).run_hook(kind, &params).await;
    Ok(if ok { 0 } else { EXIT_FAILURE })
}

fn print_status(config: &Config) -> Result<()> {
    let status = open_store(config).snapshot()?;

    let state = status.state.map(|s| s.as_str()).unwrap_or("UNKNOWN");
    match status.substate {
        Some(sub) => println!("state:        {} {}", state, sub.as_str()),
        None => println!("state:        {}", state),
    }
    if let Some(t) = status.start_time {
        println!("started:      {}", t.to_rfc3339());
    }
    if let Some(t) = status.last_poll_time {
        println!("last poll:    {}", t.to_rfc3339());
    }

    for iface in [&status.public_interface, &status.private_interface].into_iter().flatten() {
        let live = get_interface_ip(&iface.device)?
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "none".to_string());
        println!(
            "{:<13} {}/{} (live address {})",
            format!("{}:", iface.device),
            iface.address,
            iface.prefix,
            live
        );
    }

    let health = |v: Option<bool>| match v {
        Some(true) => "ok",
        Some(false) => "FAILED",
        None => "-",
    };
    println!("processes:    {}", health(status.process_health_check));
    println!("routers:      {}", health(status.router_health_check));
    println!("servers:      {}", health(status.server_health_check));
    println!("site-to-site: {}", health(status.site_to_site_health_check));

    println!("ppp devices:  {}", status.ppp_devices.len());
    for dev in &status.ppp_devices {
        println!(
            "  {:<10} {:<20} {} via {}{}",
            dev.device_name.as_deref().unwrap_or("?"),
            dev.username.as_deref().unwrap_or("?"),
            dev.remote_address,
            dev.outer_address,
            if dev.restricted { " (restricted)" } else { "" }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdf_file_reaches_hooks_and_inspection_commands() {
        let args = Args::try_parse_from([
            "l2tp-gateway",
            "--rdf-file",
            "/tmp/alt.json",
            "ip-up",
            "ppp0",
            "/dev/pts/3",
            "0",
            "192.168.100.254",
            "192.168.100.7",
        ])
        .unwrap();
        assert_eq!(args.rdf_file, Some(PathBuf::from("/tmp/alt.json")));
        assert!(matches!(args.command, Command::IpUp { ref args } if args.len() == 5));

        for cmd in ["status", "dumpstatus", "resetstate"] {
            let args = Args::try_parse_from(["l2tp-gateway", cmd, "--rdf-file", "/tmp/alt.json"]).unwrap();
            assert_eq!(args.rdf_file, Some(PathBuf::from("/tmp/alt.json")), "{}", cmd);
        }

        let args = Args::try_parse_from(["l2tp-gateway", "nuke", "--rdf-file", "/tmp/alt.json", "ppp0"]).unwrap();
        assert_eq!(args.rdf_file, Some(PathBuf::from("/tmp/alt.json")));
    }

    #[test]
    fn test_rdf_file_accepted_after_run_subcommand() {
        // Layout produced by the supervisor for its child
        let args = Args::try_parse_from([
            "l2tp-gateway",
            "--config",
            "/etc/l2tpgw/test.toml",
            "run",
            "--mode",
            "FULL",
            "--rdf-file",
            "/tmp/test.json",
            "--no-distro-restart",
        ])
        .unwrap();
        assert_eq!(args.rdf_file, Some(PathBuf::from("/tmp/test.json")));
        assert!(matches!(
            args.command,
            Command::Run { mode: RunMode::Full, no_distro_restart: true, .. }
        ));

        let args = Args::try_parse_from(["l2tp-gateway", "status"]).unwrap();
        assert_eq!(args.rdf_file, None);
    }
}
