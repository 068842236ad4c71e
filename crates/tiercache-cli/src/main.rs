//! tiercache - command-line driver for the tiered cache.
//!
//! Fetches endpoints through the request scheduler, keeps them fresh with the
//! adaptive fetch controller, and inspects or clears the persisted tiers.

use std::io;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use serde_json::{Map, Value};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache_core::api::Priority;
use tiercache_core::cache::{CacheEntry, DurableStore, FlatStore};
use tiercache_core::context::open_persisted;
use tiercache_core::utils::{format_duration, truncate_string};
use tiercache_core::{Config, Context, FetchTarget, RequestConfig, RequestOptions, StartOptions};

/// How often `watch` polls controller stats for changes.
const WATCH_POLL_INTERVAL_MS: u64 = 500;

/// Maximum characters of a response shown per line by `watch`.
const PREVIEW_WIDTH: usize = 80;

/// Environment variable overriding `base_url` from the config file.
const BASE_URL_ENV: &str = "TIERCACHE_BASE_URL";

const USAGE: &str = "\
Usage: tiercache <command> [options]

Commands:
  fetch <endpoint>...   Fetch endpoints through the cache and print JSON
  watch <endpoint>...   Keep endpoints fresh until Ctrl-C
  stats                 Summarize the persisted cache tiers
  clear                 Remove every cached entry

Options:
  --key <key>           Cache key (single endpoint only)
  --no-cache            Always go to the network (fetch)
  --priority <level>    background | low | normal | high | critical (fetch)
  --interval <secs>     Base refresh interval (watch)
";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Fetch {
        endpoints: Vec<String>,
        key: Option<String>,
        use_cache: bool,
        priority: Priority,
    },
    Watch {
        endpoints: Vec<String>,
        key: Option<String>,
        interval: Option<Duration>,
    },
    Stats,
    Clear,
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some(command) = args.first() else {
        return Ok(Command::Help);
    };

    let mut endpoints = Vec::new();
    let mut key = None;
    let mut use_cache = true;
    let mut priority = Priority::Normal;
    let mut interval = None;

    let mut rest = args[1..].iter();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--key" => {
                key = Some(rest.next().context("--key needs a value")?.clone());
            }
            "--no-cache" => use_cache = false,
            "--priority" => {
                let level = rest.next().context("--priority needs a value")?;
                priority = parse_priority(level)?;
            }
            "--interval" => {
                let secs: u64 = rest
                    .next()
                    .context("--interval needs a value")?
                    .parse()
                    .context("--interval must be a whole number of seconds")?;
                interval = Some(Duration::from_secs(secs));
            }
            flag if flag.starts_with("--") => bail!("Unknown option: {}", flag),
            endpoint => endpoints.push(endpoint.to_string()),
        }
    }

    if key.is_some() && endpoints.len() > 1 {
        bail!("--key applies to a single endpoint");
    }

    match command.as_str() {
        "fetch" | "watch" if endpoints.is_empty() => bail!("{} needs at least one endpoint", command),
        "fetch" => Ok(Command::Fetch {
            endpoints,
            key,
            use_cache,
            priority,
        }),
        "watch" => Ok(Command::Watch {
            endpoints,
            key,
            interval,
        }),
        "stats" => Ok(Command::Stats),
        "clear" => Ok(Command::Clear),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => bail!("Unknown command: {}", other),
    }
}

fn parse_priority(level: &str) -> Result<Priority> {
    match level.to_ascii_lowercase().as_str() {
        "background" => Ok(Priority::Background),
        "low" => Ok(Priority::Low),
        "normal" => Ok(Priority::Normal),
        "high" => Ok(Priority::High),
        "critical" => Ok(Priority::Critical),
        other => bail!("Unknown priority: {}", other),
    }
}

/// Initialize the tracing subscriber for logging.
///
/// RUST_LOG controls the level (default "warn"). With a log directory, a
/// daily-rotated file layer is added and its guard must outlive the program.
fn init_tracing(log_dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tiercache.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn load_config() -> Result<Config> {
    let mut config = Config::load()?;
    if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
        config.base_url = Some(base_url);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    let config = load_config()?;

    let log_dir = match &command {
        Command::Watch { .. } => {
            let dir = config.cache_dir()?;
            std::fs::create_dir_all(&dir)?;
            Some(dir)
        }
        _ => None,
    };
    let _guard = init_tracing(log_dir.as_deref());

    match command {
        Command::Fetch {
            endpoints,
            key,
            use_cache,
            priority,
        } => fetch(config, endpoints, key, use_cache, priority).await,
        Command::Watch {
            endpoints,
            key,
            interval,
        } => watch(config, endpoints, key, interval).await,
        Command::Stats => stats(&config).await,
        Command::Clear => clear(config).await,
        Command::Help => {
            print!("{}", USAGE);
            Ok(())
        }
    }
}

async fn fetch(
    config: Config,
    endpoints: Vec<String>,
    key: Option<String>,
    use_cache: bool,
    priority: Priority,
) -> Result<()> {
    let context = Context::from_config(config)?;

    let configs = endpoints
        .iter()
        .map(|endpoint| {
            let mut options = RequestOptions::default().with_priority(priority);
            options.use_cache = use_cache;
            options.cache_key = key.clone();
            RequestConfig::new(endpoint.clone()).with_options(options)
        })
        .collect();
    let results = context.scheduler.create_batch_request(configs).await;

    let mut output = Map::new();
    let mut failures = 0;
    for (endpoint, result) in endpoints.iter().zip(results) {
        match result {
            Ok(value) => {
                output.insert(endpoint.clone(), value);
            }
            Err(e) => {
                failures += 1;
                eprintln!("{}: {}", endpoint, e);
            }
        }
    }

    let output = if endpoints.len() == 1 {
        output.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null)
    } else {
        Value::Object(output)
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    let stats = context.scheduler.get_stats();
    info!(
        requests = stats.request_count,
        average_latency = %format_duration(stats.average_latency),
        cache_hit_rate = stats.cache_hit_rate,
        "Fetch complete"
    );

    if failures > 0 {
        bail!("{} of {} requests failed", failures, endpoints.len());
    }
    Ok(())
}

async fn watch(
    config: Config,
    endpoints: Vec<String>,
    key: Option<String>,
    interval: Option<Duration>,
) -> Result<()> {
    let context = Context::from_config(config)?;
    let controller = context.fetch_controller();

    let targets: Vec<FetchTarget> = endpoints
        .iter()
        .map(|endpoint| {
            let target = FetchTarget::new(endpoint.clone());
            match &key {
                Some(key) => target.with_cache_key(key.clone()),
                None => target,
            }
        })
        .collect();

    controller.start(StartOptions {
        base_interval: interval,
        ..StartOptions::new(targets.clone())
    });
    eprintln!("Watching {} endpoint(s), Ctrl-C to stop", targets.len());

    let mut ticker = tokio::time::interval(Duration::from_millis(WATCH_POLL_INTERVAL_MS));
    let mut seen = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = controller.get_stats();
                if stats.fetch_count == seen {
                    continue;
                }
                seen = stats.fetch_count;

                let when = stats
                    .last_fetch_time
                    .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
                    .unwrap_or_default();
                eprintln!(
                    "[{}] fetch #{} strategy={:?} next in {} network={:?}",
                    when,
                    stats.fetch_count,
                    stats.strategy,
                    format_duration(stats.interval),
                    stats.network_quality,
                );
                for target in &targets {
                    let key = target.cache_key.as_deref().unwrap_or(&target.endpoint);
                    if let Some(value) = context.cache.get::<Value>(key).await {
                        eprintln!("  {} {}", target.endpoint, truncate_string(&value.to_string(), PREVIEW_WIDTH));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.stop();
    info!(fetches = seen, "Watch stopped");
    Ok(())
}

async fn stats(config: &Config) -> Result<()> {
    let (durable, flat) = open_persisted(config)?;
    let prefix = &config.cache.flat_key_prefix;

    let durable_entries = durable.len().await?;
    let flat_keys: Vec<String> = flat
        .keys()?
        .into_iter()
        .filter(|k| k.starts_with(prefix.as_str()))
        .collect();

    println!("Cache directory: {}", config.cache_dir()?.display());
    println!("Durable tier:    {} entries", durable_entries);
    println!(
        "Flat tier:       {} entries, {} of {} bytes",
        flat_keys.len(),
        flat.used_bytes(),
        config.cache.flat_quota_bytes
    );

    let now = chrono::Utc::now();
    for flat_key in &flat_keys {
        let Some(raw) = flat.get_item(flat_key)? else {
            continue;
        };
        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let state = if entry.is_valid(now, &config.cache.version) {
            "valid"
        } else {
            "expired"
        };
        println!(
            "  {:<40} {:>8} bytes  {:<10} {}",
            truncate_string(&entry.key, 40),
            entry.size,
            entry.age_display(now),
            state
        );
    }
    Ok(())
}

async fn clear(config: Config) -> Result<()> {
    let cache_dir = config.cache_dir()?;
    let context = Context::cache_only(config)?;
    context.cache.clear().await;
    println!("Cleared cache in {}", cache_dir.display());
    Ok(())
}
