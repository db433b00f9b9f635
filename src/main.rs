//! CoolCache server entry point: CLI parsing, logging, bootstrap.

use coolcache::server::{Server, ServerConfig};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Parsed command-line options.
struct CliArgs {
    config: ServerConfig,
}

impl CliArgs {
    fn parse() -> Self {
        let mut config = ServerConfig::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--port" | "-p" => {
                    config.port = Self::value(&args, &mut i, "--port")
                        .parse()
                        .unwrap_or_else(|_| {
                            eprintln!("Error: invalid port number");
                            std::process::exit(1);
                        });
                }
                "--dir" => {
                    config.dir = PathBuf::from(Self::value(&args, &mut i, "--dir"));
                }
                "--dbfilename" => {
                    config.dbfilename = Self::value(&args, &mut i, "--dbfilename");
                }
                "--replicaof" => {
                    // Either one quoted "host port" value or two
                    // separate tokens.
                    let first = Self::value(&args, &mut i, "--replicaof");
                    let (host, port_text) = match first.split_once(' ') {
                        Some((host, port)) => (host.to_string(), port.to_string()),
                        None => {
                            let second = Self::value(&args, &mut i, "--replicaof");
                            (first, second)
                        }
                    };
                    let port = port_text.parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid --replicaof port");
                        std::process::exit(1);
                    });
                    config.replicaof = Some((host, port));
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {}", other);
                    print_help();
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        Self { config }
    }

    fn value(args: &[String], i: &mut usize, flag: &str) -> String {
        *i += 1;
        match args.get(*i) {
            Some(value) => value.clone(),
            None => {
                eprintln!("Error: {} requires a value", flag);
                std::process::exit(1);
            }
        }
    }
}

fn print_help() {
    println!(
        r#"CoolCache - an in-memory key-value server speaking the Redis protocol

USAGE:
    coolcache [OPTIONS]

OPTIONS:
    -p, --port <PORT>          Port to listen on (default: 6379)
        --dir <PATH>           Directory holding the RDB file (default: ./)
        --dbfilename <NAME>    Snapshot file name (default: dump.rdb)
        --replicaof <HOST> <PORT>
                               Run as a replica of the given leader
        --help                 Print this help message

CONNECTING:
    Any Redis client works:
    $ redis-cli -p 6379
    127.0.0.1:6379> SET greeting hello
    OK
"#
    );
}

#[tokio::main]
async fn main() {
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let cli = CliArgs::parse();
    info!(
        port = cli.config.port,
        dir = %cli.config.dir.display(),
        dbfilename = %cli.config.dbfilename,
        role = if cli.config.replicaof.is_some() { "replica" } else { "leader" },
        "starting coolcache"
    );

    // Bind failures and corrupt snapshots are fatal at startup.
    let server = match Server::bind(cli.config).await {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, "startup failed");
            std::process::exit(1);
        }
    };

    let shutdown = async {
        signal::ctrl_c().await.ok();
        info!("shutdown signal received");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(err) = result {
                error!(error = %err, "server terminated");
                std::process::exit(1);
            }
        }
        _ = shutdown => {}
    }

    info!("server shutdown complete");
}
