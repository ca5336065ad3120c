//! shardkv - interactive shell over the sharded engine
//!
//! Reads one command per line from stdin (redis-cli inline syntax, quotes allowed),
//! runs it against an in-process shard set, and prints the reply.

use bytes::Bytes;
use shardkv::commands::CommandHandler;
use shardkv::config::EngineConfig;
use shardkv::engine::ShardSet;
use shardkv::storage::{Clock, ExpirySweeper};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Shell configuration
struct Config {
    engine: EngineConfig,
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut engine = EngineConfig::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--shards" | "-s" => {
                    engine.shards = parse_value(&args, i, "--shards");
                    i += 2;
                }
                "--slots" => {
                    engine.scan_slots = parse_value(&args, i, "--slots");
                    i += 2;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("shardkv version {}", shardkv::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        if let Err(e) = engine.validate() {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }

        Config { engine }
    }
}

fn parse_value(args: &[String], i: usize, flag: &str) -> usize {
    let Some(raw) = args.get(i + 1) else {
        eprintln!("Error: {} requires a value", flag);
        std::process::exit(1);
    };
    raw.parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value for {}: {}", flag, raw);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
shardkv - Sharded In-Memory Key-Value Store (interactive shell)

USAGE:
    shardkv [OPTIONS]

OPTIONS:
    -s, --shards <N>     Number of shard threads (default: available cores)
        --slots <N>      Scan slots per shard, a power of two (default: 1024)
    -v, --version        Print version information
    -h, --help           Print this help message

ENVIRONMENT:
    RUST_LOG             Log filter (default: info), e.g. RUST_LOG=shardkv=trace

EXAMPLE:
    $ shardkv --shards 4
    shardkv> SET name "Ariz"
    OK
    shardkv> GET name
    "Ariz"
    shardkv> QUIT
"#
    );
}

/// Splits an inline command into arguments. Supports `"..."` with backslash escapes
/// and `'...'` taken literally.
fn split_line(line: &str) -> Result<Vec<Bytes>, String> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            return Ok(args);
        };

        let mut current = String::new();
        match first {
            '"' => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => current.push('\n'),
                            Some('t') => current.push('\t'),
                            Some(c) => current.push(c),
                            None => return Err("unbalanced quotes".to_string()),
                        },
                        Some(c) => current.push(c),
                        None => return Err("unbalanced quotes".to_string()),
                    }
                }
            }
            '\'' => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err("unbalanced quotes".to_string()),
                    }
                }
            }
            _ => {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    current.push(c);
                    chars.next();
                }
            }
        }
        args.push(Bytes::from(current));
    }
}

fn prompt() {
    print!("shardkv> ");
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    // Logs go to stderr so they don't interleave with replies.
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let shards = Arc::new(ShardSet::new(&config.engine, Clock::system())?);

    let sweeper = ExpirySweeper::start(Arc::clone(&shards), config.engine.expiry.clone());
    let mut handler = CommandHandler::new(Arc::clone(&shards));

    println!("shardkv v{} - type QUIT to exit", shardkv::VERSION);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt();
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = signal::ctrl_c() => {
                info!("Interrupt received, shutting down...");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        let argv = match split_line(&line) {
            Ok(argv) if argv.is_empty() => continue,
            Ok(argv) => argv,
            Err(e) => {
                println!("(error) ERR {}", e);
                continue;
            }
        };
        if argv[0].eq_ignore_ascii_case(b"quit") || argv[0].eq_ignore_ascii_case(b"exit") {
            break;
        }

        let reply = handler.execute(argv).await;
        if let Some(info) = handler.last_debug_info() {
            if info.shards_count > 1 {
                debug!(shards = info.shards_count, "Multi-shard command");
            }
        }
        println!("{}", reply);
    }

    drop(sweeper);
    for (shard, stats) in shards.run_on_all(|db, _| db.stats()).await?.iter().enumerate() {
        info!(
            shard,
            keys = stats.keys,
            expires = stats.expires,
            expired = stats.expired_keys,
            used_memory = stats.used_memory,
            "Shard stats"
        );
    }
    drop(handler);
    drop(shards);
    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(line: &str) -> Vec<String> {
        split_line(line)
            .unwrap()
            .into_iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_split_plain() {
        assert_eq!(split("SET key value"), vec!["SET", "key", "value"]);
        assert_eq!(split("   GET   key  "), vec!["GET", "key"]);
        assert!(split("").is_empty());
    }

    #[test]
    fn test_split_quotes() {
        assert_eq!(split(r#"SET k "hello world""#), vec!["SET", "k", "hello world"]);
        assert_eq!(split(r#"SET k "a\"b\n""#), vec!["SET", "k", "a\"b\n"]);
        assert_eq!(split("SET k 'raw \\n'"), vec!["SET", "k", "raw \\n"]);
        assert!(split_line(r#"SET k "open"#).is_err());
    }
}
