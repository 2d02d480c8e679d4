//! Indexio CLI
//!
//! Maintenance interface for index storage files:
//! - Check header state (clean, dirty, version changed)
//! - Show container map statistics
//! - Compact a container map's value log
//! - Generate a default config file

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indexio::config::{generate_default_config, init_logging, Config};
use indexio::index::{PersistentContainerMap, OPTIONS_VERSION_BITS};
use indexio::storage::{CreationOptions, HeaderInfo, HeaderState};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "indexio-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Maintenance tool for indexio storage files")]
#[command(long_about = "Inspect and maintain indexio storage files.\nPaths name a container map or enumerator without extension, e.g. data/words/words.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Report whether storages were closed cleanly
    Check {
        /// Storage paths
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Expected format version; a different clean version is reported as changed
        #[arg(long)]
        expect_version: Option<u32>,
    },

    /// Show statistics of a container map
    Stats {
        /// Map path
        path: PathBuf,
    },

    /// Rewrite a container map's value log keeping live values only
    Compact {
        /// Map path
        path: PathBuf,
        /// Compact even if little garbage has accumulated
        #[arg(long)]
        force: bool,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_logging(&config.logging);

    match cli.command {
        Commands::Check {
            paths,
            expect_version,
        } => {
            let mut rows = Vec::new();
            let mut unhealthy = false;
            for path in paths {
                let row = match HeaderInfo::read(&path) {
                    Ok(info) => {
                        let status = describe_header(&info.state, expect_version);
                        unhealthy |= status != "clean";
                        serde_json::json!({
                            "path": path,
                            "status": status,
                            "records": info.record_count,
                            "header": info,
                        })
                    }
                    Err(e) => {
                        unhealthy = true;
                        serde_json::json!({
                            "path": path,
                            "status": "unreadable",
                            "error": e.to_string(),
                        })
                    }
                };
                rows.push(row);
            }

            match cli.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
                _ => {
                    println!("{:<40} {:<16} {}", "Path", "Status", "Records");
                    println!("{}", "-".repeat(70));
                    for row in &rows {
                        println!(
                            "{:<40} {:<16} {}",
                            row["path"].as_str().unwrap_or("-"),
                            row["status"].as_str().unwrap_or("-"),
                            row["records"]
                                .as_i64()
                                .map(|r| r.to_string())
                                .unwrap_or_else(|| "-".to_string())
                        );
                    }
                }
            }

            if unhealthy {
                std::process::exit(1);
            }
        }

        Commands::Stats { path } => {
            let map = PersistentContainerMap::open_for_maintenance(&path, true)
                .with_context(|| format!("Cannot open {:?}", path))?;
            let header = HeaderInfo::read(&path)?;
            let stats = map.stats();

            match cli.format.as_str() {
                "json" => {
                    let body = serde_json::json!({
                        "path": path,
                        "header": header,
                        "map": stats,
                    });
                    println!("{}", serde_json::to_string_pretty(&body)?);
                }
                _ => {
                    println!("Container map {:?}", path);
                    println!();
                    if let HeaderState::Clean { version } = header.state {
                        let options = CreationOptions::from_version(
                            version & ((1 << OPTIONS_VERSION_BITS) - 1),
                        );
                        println!("Format version:    {}", version >> OPTIONS_VERSION_BITS);
                        if let Some(options) = options {
                            println!("Compression:       {}", options.compression);
                            println!("Chunked values:    {}", !options.has_no_chunks);
                        }
                    }
                    println!("Keys:              {}", stats.keys);
                    println!("Live keys:         {}", stats.live_keys);
                    println!("Garbage keys:      {}", stats.garbage_keys);
                    println!("Compaction due:    {}", stats.compaction_recommended);
                    println!("Value log size:    {}", format_bytes(stats.values.size));
                    if let Some(compression) = &stats.values.compression {
                        println!(
                            "Compressed blocks: {} ({} -> {}, ratio {:.2})",
                            compression.block_count,
                            format_bytes(compression.uncompressed_size),
                            format_bytes(compression.compressed_size),
                            compression.ratio
                        );
                    }
                }
            }
        }

        Commands::Compact { path, force } => {
            let mut map = PersistentContainerMap::open_for_maintenance(&path, false)
                .with_context(|| format!("Cannot open {:?}", path))?;

            if !force && !map.is_compaction_recommended() {
                println!(
                    "Compaction not needed: {} live keys, {} garbage keys (use --force to compact anyway)",
                    map.live_keys(),
                    map.garbage_keys()
                );
                map.close()?;
                return Ok(());
            }

            let summary = map.compact()?;
            map.close()?;

            match cli.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
                _ => {
                    println!("Compacted {:?}", path);
                    println!("  Live keys: {}", summary.live_keys);
                    println!(
                        "  Size:      {} -> {}",
                        format_bytes(summary.old_size),
                        format_bytes(summary.new_size)
                    );
                    println!(
                        "  Chunks:    {} -> {}",
                        summary.fragments, summary.new_fragments
                    );
                    println!("  Took:      {} ms", summary.elapsed_ms);
                }
            }
        }

        Commands::Config { output } => {
            let config = generate_default_config();
            if let Some(path) = output {
                if path.exists() {
                    bail!("Refusing to overwrite {:?}", path);
                }
                std::fs::write(&path, config)?;
                println!("Config written to {:?}", path);
            } else {
                print!("{}", config);
            }
        }
    }

    Ok(())
}

fn describe_header(state: &HeaderState, expected: Option<u32>) -> &'static str {
    match (state, expected) {
        (HeaderState::Clean { version }, Some(expected)) if *version != expected => {
            "version-changed"
        }
        (HeaderState::Clean { .. }, _) => "clean",
        (HeaderState::Dirty, _) => "dirty",
        (HeaderState::Unknown { .. }, _) => "unknown-format",
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
