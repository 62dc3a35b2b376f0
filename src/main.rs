// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use torrentctl::config::{config_path, load_config, save_config, AppConfig};
use torrentctl::engine::{SimulatedEngine, TransferProfile};
use torrentctl::error::{format_download_error, format_error};
use torrentctl::logging::init_logging;
use torrentctl::{Category, DownloadManager, Snapshot, TaskId};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const MIB: u64 = 1024 * 1024;

#[derive(Parser)]
#[command(name = "torrentctl")]
#[command(version = VERSION)]
#[command(about = "Run and control many torrent downloads at once.")]
#[command(long_about = "torrentctl - concurrent download control\n\n\
    Simulate downloads:  torrentctl simulate <URL>...\n\
    Show config:         torrentctl config show\n\n\
    While downloads run, type: pause N, resume N, stop N, list, quit")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run downloads on the in-memory engine with live progress
    ///
    /// Examples:
    ///   torrentctl simulate "magnet:?xt=urn:btih:c9e1...&xl=104857600"
    ///   torrentctl simulate https://example.org/a.torrent --rate-kbs 500
    Simulate {
        /// Magnet links or .torrent URLs
        #[arg(required = true)]
        urls: Vec<String>,
        /// Directory to save into (defaults to the configured download dir)
        #[arg(short, long)]
        save_path: Option<PathBuf>,
        /// Simulated rate per download in kB/s
        #[arg(long, default_value_t = 2048)]
        rate_kbs: u64,
        /// Payload size in MiB when the link carries no exact length
        #[arg(long, default_value_t = 64)]
        size_mb: u64,
        /// Poll interval in milliseconds (overrides the config file)
        #[arg(long)]
        tick_ms: Option<u64>,
    },

    /// View or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// A line typed by the user while downloads run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Pause(usize),
    Resume(usize),
    Stop(usize),
    List(Option<Category>),
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or("").to_ascii_lowercase();
    let arg = words.next();

    let row = |arg: Option<&str>| -> Result<usize, String> {
        let raw = arg.ok_or_else(|| format!("usage: {} <row>", verb))?;
        match raw.parse::<usize>() {
            Ok(n) if n >= 1 => Ok(n),
            _ => Err(format!("not a row number: {}", raw)),
        }
    };

    match verb.as_str() {
        "pause" | "p" => row(arg).map(Command::Pause),
        "resume" | "r" => row(arg).map(Command::Resume),
        "stop" | "s" => row(arg).map(Command::Stop),
        "list" | "ls" => match arg {
            Some(name) => name.parse::<Category>().map(|c| Command::List(Some(c))),
            None => Ok(Command::List(None)),
        },
        "help" | "?" => Ok(Command::Help),
        "quit" | "q" | "exit" => Ok(Command::Quit),
        "" => Err("empty command".to_string()),
        other => Err(format!("unknown command: {} (try help)", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{} {:#}; using defaults", "[!]".yellow(), err);
            AppConfig::default()
        }
    };
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_logging(&config.log_level);

    match cli.command {
        Commands::Simulate {
            urls,
            save_path,
            rate_kbs,
            size_mb,
            tick_ms,
        } => {
            if let Some(ms) = tick_ms {
                config.manager.tick_interval_ms = ms;
            }
            let save_path = save_path.unwrap_or_else(|| config.save_dir());
            let profile = TransferProfile {
                rate_bps: rate_kbs.saturating_mul(1000),
                default_size: size_mb.saturating_mul(MIB),
            };
            run_simulation(&config, &urls, save_path, profile).await
        }
        Commands::Config { action } => handle_config(action, &config),
    }
}

fn handle_config(action: ConfigAction, config: &AppConfig) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ConfigAction::Path => {
            println!("{}", config_path()?.display());
        }
        ConfigAction::Init { force } => {
            let path = config_path()?;
            if path.exists() && !force {
                println!("{} {} already exists (use --force to overwrite)", "[!]".yellow(), path.display());
                return Ok(());
            }
            let written = save_config(&AppConfig::default())?;
            println!("{} Wrote {}", "[OK]".green(), written.display());
        }
    }
    Ok(())
}

struct Row {
    id: TaskId,
    bar: ProgressBar,
}

fn bar_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::with_template("{prefix:>3} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
        .context("invalid progress template")?
        .progress_chars("=> "))
}

async fn run_simulation(
    config: &AppConfig,
    urls: &[String],
    save_path: PathBuf,
    profile: TransferProfile,
) -> Result<()> {
    let engine = Arc::new(SimulatedEngine::new(profile));
    let manager = DownloadManager::new(engine, config.manager.clone())?;
    let events = manager.subscribe()?;

    let multi = MultiProgress::new();
    let style = bar_style()?;
    let mut rows: Vec<Row> = Vec::new();

    for url in urls {
        match manager.add(url, &save_path) {
            Ok(id) => {
                let bar = multi.add(ProgressBar::new(100));
                bar.set_style(style.clone());
                bar.set_prefix(format!("{}", rows.len() + 1));
                bar.set_message("starting");
                rows.push(Row { id, bar });
            }
            Err(err) => eprint!("{}", format_download_error(&err)),
        }
    }

    if rows.is_empty() {
        eprint!(
            "{}",
            format_error("No downloads started", &[], &["Check the URLs and --save-path"])
        );
        return Ok(());
    }

    let (interrupt_tx, mut interrupt_rx) = watch::channel(false);
    if let Err(err) = ctrlc::set_handler(move || {
        interrupt_tx.send_replace(true);
    }) {
        tracing::warn!(error = %err, "could not install Ctrl+C handler");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            snapshot = events.recv() => {
                let Some(snapshot) = snapshot else { break };
                render(&rows, &snapshot);
                if all_stopped(&manager) {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if handle_line(&manager, &rows, &multi, &line) || all_stopped(&manager) {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => stdin_open = false,
                }
            }
            _ = interrupt_rx.wait_for(|interrupted| *interrupted) => {
                let _ = multi.println("Interrupted, stopping downloads");
                break;
            }
        }
    }

    manager.shutdown();
    for snapshot in events.drain() {
        render(&rows, &snapshot);
    }
    manager.join_workers().await;

    for row in &rows {
        if !row.bar.is_finished() {
            row.bar.abandon_with_message("stopped");
        }
    }
    let counts = manager.counts();
    println!(
        "{} {} downloads, {} stopped",
        "[OK]".green(),
        counts.total(),
        counts.stopped
    );
    Ok(())
}

fn all_stopped(manager: &DownloadManager) -> bool {
    let counts = manager.counts();
    counts.downloading + counts.queued == 0 && manager.bus_stats().pending == 0
}

fn render(rows: &[Row], snapshot: &Snapshot) {
    let Some(row) = rows.iter().find(|row| &row.id == snapshot.task_id()) else {
        return;
    };
    row.bar.set_position(u64::from(snapshot.progress_percent()));
    if snapshot.finished() {
        row.bar.finish_with_message(format!("{}", snapshot.to_string().green()));
    } else if snapshot.error().is_some() {
        row.bar.abandon_with_message(format!("{}", snapshot.to_string().red()));
    } else {
        row.bar.set_message(snapshot.to_string());
    }
}

/// Apply one typed command. Returns true when the user asked to quit.
fn handle_line(manager: &DownloadManager, rows: &[Row], multi: &MultiProgress, line: &str) -> bool {
    let command = match parse_command(line) {
        Ok(command) => command,
        Err(message) => {
            let _ = multi.println(format!("{} {}", "[!]".yellow(), message));
            return false;
        }
    };

    let target = |n: usize| rows.get(n - 1).map(|row| &row.id);
    let result = match command {
        Command::Quit => return true,
        Command::Help => {
            let _ = multi.println("pause N | resume N | stop N | list [downloading|queued|stopped] | quit");
            return false;
        }
        Command::List(filter) => {
            list(manager, rows, multi, filter);
            return false;
        }
        Command::Pause(n) => target(n).map(|id| manager.pause(id)),
        Command::Resume(n) => target(n).map(|id| manager.resume(id)),
        Command::Stop(n) => target(n).map(|id| manager.stop(id)),
    };

    match result {
        None => {
            let _ = multi.println(format!("{} no row {}", "[!]".yellow(), line.trim()));
        }
        Some(Err(err)) => {
            let _ = multi.println(format_download_error(&err).trim_end());
        }
        Some(Ok(())) => {}
    }
    false
}

fn list(manager: &DownloadManager, rows: &[Row], multi: &MultiProgress, filter: Option<Category>) {
    let layout = manager.layout();
    let categories: Vec<Category> = match filter {
        Some(category) => vec![category],
        None => Category::ALL.to_vec(),
    };
    for category in categories {
        let ids = layout.category(category);
        let _ = multi.println(format!("{} ({})", category.label().bold(), ids.len()));
        for id in ids {
            let row = rows.iter().position(|row| &row.id == id).map_or(0, |i| i + 1);
            let detail = manager
                .task(id)
                .and_then(|task| task.latest_snapshot())
                .map_or_else(|| "no data yet".to_string(), |s| s.to_string());
            let _ = multi.println(format!("  {:>3}  {}", row, detail));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_commands() {
        assert_eq!(parse_command("pause 2"), Ok(Command::Pause(2)));
        assert_eq!(parse_command("  R 1 "), Ok(Command::Resume(1)));
        assert_eq!(parse_command("stop 3"), Ok(Command::Stop(3)));
        assert_eq!(parse_command("quit"), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_list_filter() {
        assert_eq!(parse_command("list"), Ok(Command::List(None)));
        assert_eq!(parse_command("ls queued"), Ok(Command::List(Some(Category::Queued))));
        assert!(parse_command("list archived").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_rows() {
        assert!(parse_command("pause").is_err());
        assert!(parse_command("pause 0").is_err());
        assert!(parse_command("stop two").is_err());
        assert!(parse_command("frobnicate 1").is_err());
        assert!(parse_command("").is_err());
    }
}
