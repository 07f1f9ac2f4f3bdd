//! Demo binary for the `objstore` engine (§10.5): wires up a single
//! `StorageEngine` plus the process-wide `AlarmScheduler` over a
//! caller-chosen backing store, and exposes a minimal line-oriented REPL
//! for manual exercise. Trimmed of `kv-cli`'s SQL-like query language
//! (`ast`/`command`/`npm`/`new`/`rusty`/`show`) — host-object addressing
//! and a query surface are both out of scope for the engine itself.

mod trace;

use std::io::{stdin, BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use objstore::alarm::AlarmScheduler;
use objstore::config::{BackendKind, Config};
use objstore::engine::{AlarmBridge, ObjectKey, StorageEngine};
use objstore::storage::file::FileStorage;
use objstore::storage::memory::MemoryStorage;
use objstore::storage::Storage;
use objstore::{CResult, Error, ListOptions};

#[derive(Debug, Parser)]
#[command(version, about = "objstore demo REPL")]
struct Args {
    /// Configuration file path (JSON), following `Config`'s shape.
    #[clap(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Backing store kind, overriding whatever the config file says.
    #[clap(long, value_enum)]
    backend: Option<Backend>,

    /// Directory holding the object's data and (if disk-backed) the
    /// alarm registry's own log file.
    #[clap(long, default_value = "./objstore-data")]
    data_dir: PathBuf,

    /// Object key this session's engine and alarms are addressed under.
    #[clap(long, default_value = "default")]
    object: String,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    /// A single command to execute non-interactively, instead of
    /// dropping into the REPL.
    #[clap(long)]
    query: Option<String>,

    #[clap(short = 'q', long, default_value = "false")]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Backend {
    Memory,
    Disk,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_dir = format!("{}/.objstore-cli", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &args.log_level).await?;
    info!("objstore-cli starting with args: {:?}", &args);

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(backend) = args.backend {
        config.backend = Some(match backend {
            Backend::Memory => BackendKind::Memory,
            Backend::Disk => BackendKind::Disk { path: args.data_dir.join("objstore.db") },
        });
    }
    let resolved = config.resolved();

    if !args.quiet {
        eprintln!("objstore-cli: object={} backend={:?}", args.object, resolved.backend);
    }

    match resolved.backend.clone() {
        BackendKind::Memory => {
            let engine = StorageEngine::new(ObjectKey::from(args.object.as_str()), MemoryStorage::new(), true);
            let alarms = AlarmScheduler::new(MemoryStorage::new(), &resolved);
            run(engine, alarms, &args).await
        }
        BackendKind::Disk { path } => {
            std::fs::create_dir_all(&args.data_dir)?;
            let store = FileStorage::create(path)?;
            let alarm_store = FileStorage::create(args.data_dir.join("objstore-alarms.db"))?;
            let engine = StorageEngine::new(ObjectKey::from(args.object.as_str()), store, true);
            let alarms = AlarmScheduler::new(alarm_store, &resolved);
            run(engine, alarms, &args).await
        }
    }
}

async fn run<S: Storage + 'static>(
    engine: StorageEngine<S>,
    alarms: AlarmScheduler<S>,
    args: &Args,
) -> Result<()> {
    let bridge: Arc<dyn AlarmBridge> = Arc::new(alarms.clone());
    let engine = engine.with_alarm_bridge(bridge);

    alarms.setup_store().await?;
    alarms
        .setup_alarms(|key| {
            Box::pin(async move {
                info!("alarm fired for object {key}");
                println!("alarm fired for object {key}");
            })
        })
        .await;

    let is_terminal = stdin().is_terminal();
    if let Some(query) = &args.query {
        run_line(&engine, query).await;
        return Ok(());
    }
    if is_terminal && !args.quiet {
        println!("Welcome to objstore-cli. Type `help` for commands, `exit` to quit.");
    }

    let stdin = stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        run_line(&engine, line).await;
    }

    alarms.dispose().await;
    Ok(())
}

async fn run_line<S: Storage + 'static>(engine: &StorageEngine<S>, line: &str) {
    if let Err(err) = dispatch(engine, line).await {
        eprintln!("error: {err}");
    }
}

async fn dispatch<S: Storage + 'static>(engine: &StorageEngine<S>, line: &str) -> CResult<()> {
    let mut parts = line.splitn(3, ' ');
    let cmd = parts.next().unwrap_or("");
    match cmd {
        "help" => {
            println!("commands: get <key> | put <key> <value> | delete <key> | list [prefix] | alarm get|set <ms-from-now>|delete | sync | exit");
            Ok(())
        }
        "get" => {
            let key = parts.next().ok_or(Error::UndefinedKey { op: "get" })?;
            match engine.get(key.as_bytes()).await? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(not found)"),
            }
            Ok(())
        }
        "put" => {
            let key = parts.next().ok_or(Error::UndefinedKey { op: "put" })?;
            let value = parts.next().ok_or(Error::UndefinedValue { op: "put" })?;
            engine.put(key.as_bytes(), value.as_bytes().to_vec()).await?;
            println!("ok");
            Ok(())
        }
        "delete" => {
            let key = parts.next().ok_or(Error::UndefinedKey { op: "delete" })?;
            let existed = engine.delete(key.as_bytes()).await?;
            println!("{existed}");
            Ok(())
        }
        "list" => {
            let prefix = parts.next().map(|p| p.as_bytes().to_vec());
            let opts = ListOptions { prefix, ..Default::default() };
            for (key, value) in engine.list(opts).await? {
                println!("{} = {}", String::from_utf8_lossy(&key), String::from_utf8_lossy(&value));
            }
            Ok(())
        }
        "alarm" => dispatch_alarm(engine, parts.next(), parts.next()).await,
        "sync" => {
            engine.sync().await;
            println!("ok");
            Ok(())
        }
        other => {
            println!("unknown command: {other} (try `help`)");
            Ok(())
        }
    }
}

async fn dispatch_alarm<S: Storage + 'static>(
    engine: &StorageEngine<S>,
    sub: Option<&str>,
    arg: Option<&str>,
) -> CResult<()> {
    match sub {
        Some("get") => {
            match engine.get_alarm().await? {
                Some(t) => println!("{t}"),
                None => println!("(no alarm set)"),
            }
            Ok(())
        }
        Some("set") => {
            let delta_ms: i64 = arg
                .and_then(|s| s.parse().ok())
                .ok_or(Error::InvalidListOptions("alarm set requires a millisecond delta".to_string()))?;
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("system clock before epoch")
                .as_millis() as i64;
            engine.set_alarm(now_ms + delta_ms).await?;
            println!("ok");
            Ok(())
        }
        Some("delete") => {
            engine.delete_alarm().await?;
            println!("ok");
            Ok(())
        }
        _ => {
            println!("usage: alarm get|set <ms-from-now>|delete");
            Ok(())
        }
    }
}
