//! Monitor daemon entry point.
//!
//! `mkfs` seeds a data directory from a membership list; `run` opens it,
//! binds the TCP transport and hands the thread to the monitor event loop.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use crossbeam::channel;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shoal_mon::clock::Clock;
use shoal_mon::config::Config;
use shoal_mon::monitor::{self, Monitor};
use shoal_mon::monmap::MonMap;
use shoal_mon::network::tcp::{NetEvent, TcpMessenger, TcpNet};
use shoal_mon::network::Messenger;
use shoal_mon::store::log::LogStore;
use shoal_mon::store::{Store, KEY_LATEST, PREFIX_MONMAP};
use shoal_mon::Error;

#[derive(Parser)]
#[command(name = "shoal-mon", about = "Shoal cluster monitor")]
struct Cli {
    /// Path to a `key = value` configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Configuration overrides, `key=value`, repeatable.
    #[arg(long = "set", value_parser = parse_kv)]
    sets: Vec<(String, String)>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Initialize the data directory from a seed membership list.
    Mkfs {
        /// Cluster fsid; generated when omitted.
        #[arg(long)]
        fsid: Option<uuid::Uuid>,

        /// Seed members, `name=host:port`, repeatable. Must include this
        /// monitor's own name.
        #[arg(long = "member", value_parser = parse_kv, required = true)]
        members: Vec<(String, String)>,
    },
    /// Run the monitor.
    Run,
}

fn parse_kv(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

fn load_config(cli: &Cli) -> Result<Config, Error> {
    let mut map = HashMap::new();
    if let Some(path) = &cli.config {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("cannot read {}: {e}", path.display())))?;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (k, v) = line
                .split_once('=')
                .ok_or_else(|| Error::ConfigInvalid(format!("bad config line {line:?}")))?;
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    for (k, v) in &cli.sets {
        map.insert(k.clone(), v.clone());
    }
    Config::from_map(&map)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(e.code() as u8);
        }
    };

    let result = match &cli.cmd {
        Cmd::Mkfs { fsid, members } => run_mkfs(&cfg, *fsid, members),
        Cmd::Run => run_monitor(cfg),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.code() as u8)
        }
    }
}

fn run_mkfs(cfg: &Config, fsid: Option<uuid::Uuid>, members: &[(String, String)]) -> Result<(), Error> {
    let mut seed = Vec::new();
    for (name, addr) in members {
        let addr = addr
            .parse()
            .map_err(|_| Error::ConfigInvalid(format!("bad member address {addr:?}")))?;
        seed.push((name.clone(), addr));
    }
    let fsid = fsid.unwrap_or_else(uuid::Uuid::new_v4);
    let created_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let monmap = MonMap::build(fsid, created_ms, cfg.features, seed);

    let store: Rc<dyn Store> = Rc::new(LogStore::open(&cfg.data_dir)?);
    monitor::mkfs(&store, &cfg.name, &monmap)?;
    println!("initialized {} for mon.{} (fsid {fsid})", cfg.data_dir.display(), cfg.name);
    Ok(())
}

fn run_monitor(cfg: Config) -> Result<(), Error> {
    let store: Rc<dyn Store> = Rc::new(LogStore::open(&cfg.data_dir)?);

    let monmap_raw = store
        .get(PREFIX_MONMAP, KEY_LATEST)
        .ok_or_else(|| Error::ConfigInvalid("data directory not initialized (run mkfs)".into()))?;
    let monmap =
        MonMap::decode(monmap_raw).map_err(|_| Error::StoreCorrupt("undecodable monmap".into()))?;
    let rank = monmap
        .rank_of(&cfg.name)
        .ok_or_else(|| Error::ConfigInvalid(format!("{:?} not in monmap", cfg.name)))?;
    let peer_addrs = monmap.peers().iter().map(|p| (p.rank, p.addr)).collect();

    let (events_tx, events_rx) = channel::unbounded::<NetEvent>();
    let net_core = TcpNet::spawn(cfg.bind_addr, rank, peer_addrs, events_tx)
        .map_err(|e| Error::NetworkUnreachable(format!("bind {}: {e}", cfg.bind_addr)))?;
    let net: Rc<dyn Messenger> = Rc::new(TcpMessenger::new(net_core));

    info!(name = %cfg.name, rank, addr = %cfg.bind_addr, "monitor starting");
    let mut mon = Monitor::new(cfg, store, net, Clock::system(), Vec::new())?;
    mon.bootstrap()?;

    let ticker = channel::tick(Duration::from_millis(50));
    loop {
        let step = channel::select! {
            recv(events_rx) -> ev => match ev {
                Ok(NetEvent::Peer(env)) => mon.dispatch_peer(env),
                Ok(NetEvent::Client { con, msg }) => mon.dispatch_client(con, msg),
                Ok(NetEvent::ClientReset { con }) => {
                    mon.session_reset(con);
                    Ok(())
                }
                Err(_) => break,
            },
            recv(ticker) -> _ => mon.tick(),
        };
        if let Err(e) = step {
            if e.is_fatal() {
                // A failed store write means we can no longer promise
                // anything; the supervisor restarts us into probing.
                error!("fatal: {e}");
                return Err(e);
            }
            error!("{e}");
        }
    }
    Ok(())
}
