//! CATio daemon entry point.
//!
//! Serves a simulated EtherCAT I/O server over AMS/ADS and offers client
//! tools against any such server: device discovery, symbol listing,
//! notification monitoring and route management.

mod signals;
mod simulate;

use anyhow::{bail, Context, Result};
use catio_ads::route::{self, RouteEntry, RouteResponder};
use catio_ads::{
    discover, AdsClient, AdsServer, ChangeSet, ClientOptions, DeviceTree, FieldSpec,
    NotificationMonitor, NotificationReducer, Topology, TransmissionMode,
};
use catio_common::config::BridgeConfig;
use catio_common::net_id::{AmsAddr, NetId};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::signals::shutdown_signal;
use crate::simulate::{spawn_simulator, InputSimulator};

/// CATio command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "catio",
    about = "CATio - AMS/ADS bridge to TwinCAT EtherCAT I/O servers",
    version,
    long_about = None
)]
struct Args {
    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info", global = true)]
    log_level: String,

    /// Server address (host:port), overrides the client config.
    #[arg(long, short = 'a', value_name = "ADDR", global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the simulated I/O server until SIGINT or SIGTERM.
    Serve {
        /// Drive input channels with generated values at this period.
        #[arg(long, value_name = "PERIOD", value_parser = parse_period)]
        simulate: Option<Duration>,

        /// Do not start the UDP route responder.
        #[arg(long)]
        no_route: bool,
    },

    /// Discover devices and slaves of a server.
    Scan {
        /// Print the device tree as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Upload and list the symbol table.
    Symbols {
        /// Read and print one symbol instead of listing.
        #[arg(long, value_name = "NAME")]
        read: Option<String>,
    },

    /// Subscribe to symbols and print change sets as JSON lines.
    Monitor {
        /// Symbols to watch; every symbol when empty.
        names: Vec<String>,

        /// Sample only when a value changes.
        #[arg(long)]
        on_change: bool,

        /// Stop after this long.
        #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },

    /// Query or edit the routes of a target over UDP.
    Route {
        /// Route service address (host:port); defaults to the discovery config.
        #[arg(long, short = 't', value_name = "ADDR")]
        target: Option<SocketAddr>,

        #[command(subcommand)]
        action: RouteAction,
    },
}

#[derive(Subcommand, Debug)]
enum RouteAction {
    /// Print name, NetId and version of the target.
    Info,
    /// Register a route.
    Add {
        /// NetId the route points to.
        net_id: NetId,
        /// Host name or IP address of the route.
        host: String,
        /// Route name; defaults to the discovery config.
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove a route by name.
    Delete {
        /// Route name.
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting CATio");

    let mut config = load_config(&args)?;
    if let Some(address) = &args.address {
        config.client.address.clone_from(address);
    }

    match args.command {
        Command::Serve { simulate, no_route } => run_server(&config, simulate, no_route).await,
        Command::Scan { json } => run_scan(&config, json).await,
        Command::Symbols { read } => run_symbols(&config, read.as_deref()).await,
        Command::Monitor {
            names,
            on_change,
            duration,
        } => run_monitor(&config, &names, on_change, duration).await,
        Command::Route { target, action } => run_route(&config, target, action).await,
    }
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("catio={level},catio_ads={level},catio_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `CATIO_CONFIG_PATH` environment variable
/// 3. `/etc/catio/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<BridgeConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return BridgeConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("CATIO_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from CATIO_CONFIG_PATH");
            return BridgeConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from CATIO_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "CATIO_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/catio/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return BridgeConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using defaults");
    Ok(BridgeConfig::default())
}

async fn run_server(config: &BridgeConfig, simulate: Option<Duration>, no_route: bool) -> Result<()> {
    let topology = Topology::from_config(&config.topology);
    info!(
        devices = topology.tree.devices.len(),
        slaves = topology.tree.slave_count(),
        symbols = topology.symbols.len(),
        "Topology built"
    );
    let simulator = simulate.map(|period| (InputSimulator::new(&topology), period));

    let server = AdsServer::new(config.server.clone(), topology)
        .spawn()
        .await
        .context("Failed to start ADS server")?;

    let responder = if no_route {
        None
    } else {
        let responder = RouteResponder::new(config.server.net_id, &config.server.device_name)
            .spawn(&config.discovery.bind_addr)
            .await
            .context("Failed to start route responder")?;
        Some(responder)
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let simulation = simulator
        .map(|(simulator, period)| spawn_simulator(simulator, server.state(), period, stop_rx));

    let signal = shutdown_signal().await;
    info!(%signal, connections = server.connection_count(), "Shutting down");

    let _ = stop_tx.send(true);
    if let Some(task) = simulation {
        let _ = task.await;
    }
    if let Some(responder) = responder {
        responder.shutdown().await;
    }
    server.shutdown().await;
    info!("CATio stopped");
    Ok(())
}

async fn connect(config: &BridgeConfig) -> Result<AdsClient> {
    let options = ClientOptions::from_config(&config.client);
    let address = options.address.clone();
    AdsClient::connect(options)
        .await
        .with_context(|| format!("Failed to connect to {address}"))
}

async fn run_scan(config: &BridgeConfig, json: bool) -> Result<()> {
    let client = connect(config).await?;
    let discovered = discover(&client).await;
    client.close().await?;
    let tree = discovered.context("Device discovery failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tree)?);
    } else {
        print_tree(&tree);
    }
    Ok(())
}

fn print_tree(tree: &DeviceTree) {
    for device in &tree.devices {
        println!(
            "Device {} '{}' netid={} state=0x{:04X} frames={}",
            device.id, device.name, device.net_id, device.master_state, device.frame_counters.cyclic_sent
        );
        for slave in &device.slaves {
            let state = slave
                .ecat_state()
                .map_or_else(|| format!("0x{:02X}", slave.state), |s| format!("{s:?}"));
            println!(
                "  {:>5} {:<12} vendor=0x{:08X} product=0x{:08X} state={} crc={}",
                slave.address,
                slave.name,
                slave.identity.vendor_id,
                slave.identity.product_code,
                state,
                slave.crc.total()
            );
        }
    }
}

async fn run_symbols(config: &BridgeConfig, read: Option<&str>) -> Result<()> {
    let client = connect(config).await?;
    let result = list_symbols(&client, read).await;
    client.close().await?;
    result
}

async fn list_symbols(client: &AdsClient, read: Option<&str>) -> Result<()> {
    let count = client.upload_symbols().await.context("Symbol upload failed")?;
    info!(count, "Symbols uploaded");

    if let Some(name) = read {
        let entry = client.symbol_entry(name)?;
        let data = client.read_symbol(name).await?;
        match FieldSpec::for_symbol(&entry, 0).and_then(|spec| spec.decode(&data)) {
            Some(value) => println!("{name} = {}", serde_json::to_string(&value)?),
            None => println!("{name} = {data:02X?}"),
        }
        return Ok(());
    }

    for entry in client.symbols() {
        println!(
            "{:<48} 0x{:08X}:{:<6} {:>4} {}",
            entry.name, entry.index_group, entry.index_offset, entry.size, entry.type_name
        );
    }
    Ok(())
}

async fn run_monitor(
    config: &BridgeConfig,
    names: &[String],
    on_change: bool,
    duration: Option<Duration>,
) -> Result<()> {
    let client = connect(config).await?;
    let result = monitor(&client, config, names, on_change, duration).await;
    client.close().await?;
    result
}

async fn monitor(
    client: &AdsClient,
    config: &BridgeConfig,
    names: &[String],
    on_change: bool,
    duration: Option<Duration>,
) -> Result<()> {
    client.upload_symbols().await.context("Symbol upload failed")?;
    let names: Vec<String> = if names.is_empty() {
        client.symbols().into_iter().map(|e| e.name).collect()
    } else {
        names.to_vec()
    };
    if names.is_empty() {
        bail!("Server has no symbols to monitor");
    }

    let mode = if on_change {
        TransmissionMode::ServerOnChange
    } else {
        TransmissionMode::ServerCycle
    };
    let Some(streams) = client.take_notifications() else {
        bail!("Notification stream already taken");
    };

    let mut fields = Vec::with_capacity(names.len());
    for name in &names {
        let (handle, spec) = client
            .subscribe_symbol(
                name,
                mode,
                config.notification.max_delay,
                config.notification.cycle_time,
            )
            .await
            .with_context(|| format!("Failed to subscribe to {name}"))?;
        info!(name, handle, "Subscribed");
        fields.push(spec);
    }

    let (changes_tx, mut changes) = mpsc::channel::<ChangeSet>(16);
    let monitor = NotificationMonitor::spawn(
        streams,
        NotificationReducer::new(fields),
        config.notification.flush_window,
        changes_tx,
    );

    let stop = async {
        let deadline = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            () = deadline => {}
            signal = shutdown_signal() => info!(%signal, "Stopping monitor"),
        }
    };
    let printed = print_changes(&mut changes, stop, &mut std::io::stdout()).await;

    drop(changes);
    monitor.abort();
    printed
}

/// Write change sets as JSON lines until the stream ends or `stop` resolves.
async fn print_changes<W: Write>(
    changes: &mut mpsc::Receiver<ChangeSet>,
    stop: impl Future<Output = ()>,
    out: &mut W,
) -> Result<()> {
    tokio::pin!(stop);
    loop {
        tokio::select! {
            set = changes.recv() => match set {
                Some(set) => {
                    writeln!(out, "{}", serde_json::to_string(&set)?)?;
                    out.flush()?;
                }
                None => {
                    warn!("Notification stream ended");
                    break;
                }
            },
            () = &mut stop => break,
        }
    }
    Ok(())
}

fn parse_period(s: &str) -> Result<Duration, String> {
    let period = humantime::parse_duration(s).map_err(|e| e.to_string())?;
    if period.is_zero() {
        return Err("period must be greater than zero".into());
    }
    Ok(period)
}

async fn run_route(
    config: &BridgeConfig,
    target: Option<SocketAddr>,
    action: RouteAction,
) -> Result<()> {
    let target = match target {
        Some(target) => target,
        None => config
            .discovery
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid route address {}", config.discovery.bind_addr))?,
    };
    let sender = AmsAddr::new(config.client.source_net_id, config.client.source_port);
    let timeout = config.discovery.reply_timeout;

    match action {
        RouteAction::Info => {
            let info = route::query_server_info(target, sender, timeout).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        RouteAction::Add { net_id, host, name } => {
            let entry = RouteEntry {
                name: name.unwrap_or_else(|| config.discovery.route_name.clone()),
                net_id,
                host,
            };
            route::add_route(target, sender, &entry, timeout).await?;
            info!(name = %entry.name, %target, "Route added");
        }
        RouteAction::Delete { name } => {
            route::delete_route(target, sender, &name, timeout).await?;
            info!(%name, %target, "Route deleted");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use catio_ads::FieldValue;
    use catio_common::time::FileTime;

    #[test]
    fn test_parse_monitor_args() {
        let args = Args::parse_from([
            "catio",
            "-a",
            "10.0.0.5:48898",
            "monitor",
            "--on-change",
            "--duration",
            "2s",
            "Device 1 (EtherCAT).EL1004.Input 1",
        ]);
        assert_eq!(args.address.as_deref(), Some("10.0.0.5:48898"));
        match args.command {
            Command::Monitor {
                names,
                on_change,
                duration,
            } => {
                assert_eq!(names, vec!["Device 1 (EtherCAT).EL1004.Input 1"]);
                assert!(on_change);
                assert_eq!(duration, Some(Duration::from_secs(2)));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_route_add() {
        let args = Args::parse_from([
            "catio",
            "route",
            "--target",
            "192.168.1.10:48899",
            "add",
            "192.168.1.20.1.1",
            "192.168.1.20",
        ]);
        match args.command {
            Command::Route {
                target,
                action: RouteAction::Add { net_id, host, name },
            } => {
                assert_eq!(target, Some("192.168.1.10:48899".parse().unwrap()));
                assert_eq!(net_id, NetId::new(192, 168, 1, 20, 1, 1));
                assert_eq!(host, "192.168.1.20");
                assert!(name.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_zero_simulation_period_rejected() {
        assert!(Args::try_parse_from(["catio", "serve", "--simulate", "0s"]).is_err());
        let args = Args::parse_from(["catio", "serve", "--simulate", "250ms"]);
        match args.command {
            Command::Serve { simulate, .. } => {
                assert_eq!(simulate, Some(Duration::from_millis(250)));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_print_changes_until_stopped() {
        let (tx, mut rx) = mpsc::channel(4);
        for value in [1.0, 2.0] {
            let mut changes = std::collections::BTreeMap::new();
            changes.insert("AI 1".to_string(), FieldValue::Scalar(value));
            tx.send(ChangeSet {
                timestamp: FileTime(7),
                changes,
            })
            .await
            .unwrap();
        }

        let mut out = Vec::new();
        let stop = tokio::time::sleep(Duration::from_millis(50));
        print_changes(&mut rx, stop, &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"AI 1\""));
        // The sender is still alive, so only `stop` ended the loop.
        assert!(!tx.is_closed());
    }

    #[tokio::test]
    async fn test_print_changes_ends_with_stream() {
        let (tx, mut rx) = mpsc::channel::<ChangeSet>(1);
        drop(tx);
        let mut out = Vec::new();
        print_changes(&mut rx, std::future::pending(), &mut out)
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_load_config_from_argument() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catio.toml");
        std::fs::write(
            &path,
            "[server]\nbind_addr = \"0.0.0.0:48898\"\ndevice_name = \"Rack A\"\n",
        )
        .unwrap();
        let args = Args::parse_from(["catio", "-c", path.to_str().unwrap(), "scan"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:48898");
        assert_eq!(config.server.device_name, "Rack A");
    }

    #[test]
    fn test_load_config_missing_file_fails() {
        let args = Args::parse_from(["catio", "-c", "/nonexistent/catio.toml", "scan"]);
        assert!(load_config(&args).is_err());
    }
}
