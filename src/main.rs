//! Binary entrypoint for the termbbs CLI.
//!
//! Commands:
//! - `start` - run the board until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `status` - print a config summary and store statistics
//! - `passwd <user>` - interactively set an account password (argon2 hashed)
//!
//! See the library crate docs for module-level details: `termbbs::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use termbbs::bbs::auth::StoreAuthenticator;
use termbbs::bbs::BbsServer;
use termbbs::config::Config;
use termbbs::storage::{EngineOptions, StorageEngine, Store};

#[derive(Parser)]
#[command(name = "termbbs")]
#[command(about = "A multi-user terminal BBS over telnet, SSH and SFTP")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the BBS server
    Start,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show configuration and storage statistics
    Status,
    /// Set or change an account password
    Passwd {
        /// Account name (created if missing)
        username: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = Config::load(&cli.config).await?;
            init_logging(Some(&config), cli.verbose);
            info!("Starting termbbs v{}", env!("CARGO_PKG_VERSION"));
            let mut bbs = match BbsServer::new(config).await {
                Ok(b) => b,
                Err(e) => {
                    error!("startup failed: {}", e);
                    return Err(e);
                }
            };
            bbs.run().await?;
        }
        Commands::Init { force } => {
            init_logging(None, cli.verbose);
            if !force && tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                return Err(anyhow!(
                    "{} already exists (use --force to overwrite)",
                    cli.config
                ));
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = Config::load(&cli.config).await?;
            init_logging(Some(&config), cli.verbose);
            show_status(&config)?;
        }
        Commands::Passwd { username } => {
            let config = Config::load(&cli.config).await?;
            init_logging(Some(&config), cli.verbose);
            let pass1 = rpassword::prompt_password("New password: ")?;
            let pass2 = rpassword::prompt_password("Confirm password: ")?;
            if pass1 != pass2 {
                println!("Error: passwords do not match.");
                return Ok(());
            }
            let proxy = StorageEngine::open(
                &config.storage.data_dir,
                EngineOptions::from_config(&config.storage),
            )?
            .start();
            let argon2 = config.security.as_ref().and_then(|s| s.argon2.as_ref());
            let auth = StoreAuthenticator::new(&proxy, argon2)?;
            let result = auth.set_password(&username, &pass1).await;
            drop(auth);
            proxy.shutdown().await?;
            match result {
                Ok(name) => println!("Password updated for '{}'.", name),
                Err(e) => println!("Error: {}", e),
            }
        }
    }

    Ok(())
}

fn show_status(config: &Config) -> Result<()> {
    println!("Board:     {} (sysop {})", config.bbs.name, config.bbs.sysop);
    println!("Nodes:     {}", config.bbs.max_sessions);
    match config.bbs.idle_timeout() {
        Some(t) => println!("Idle:      {} min", t.as_secs() / 60),
        None => println!("Idle:      disabled"),
    }
    let onoff = |b: bool| if b { "on" } else { "off" };
    println!(
        "Telnet:    {} ({})",
        onoff(config.telnet.enabled),
        config.telnet.bind
    );
    println!("SSH:       {} ({})", onoff(config.ssh.enabled), config.ssh.bind);
    println!(
        "SFTP:      {} ({})",
        onoff(config.ssh.enabled && config.sftp.enabled),
        config.sftp.root
    );
    println!("Data dir:  {}", config.storage.data_dir);

    match Store::open(&config.storage.data_dir) {
        Ok(store) => {
            let stats = store.stats()?;
            println!(
                "Store:     {} record(s) in {} namespace(s), {} persisted lock(s)",
                stats.records, stats.namespaces, stats.locks
            );
        }
        Err(e) => println!("Store:     not inspected ({})", e),
    }
    Ok(())
}

fn init_logging(config: Option<&Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let configured = config
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    // CLI verbosity overrides config
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // sled is chatty at debug
    builder.filter_module("sled", log::LevelFilter::Warn);
    if let Some(cfg) = config {
        let security_path = cfg.logging.security_file.clone();
        let file = cfg.logging.file.as_ref().and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });
        let write_mutex = file.map(|f| std::sync::Arc::new(std::sync::Mutex::new(f)));
        // With no log file, or in the foreground, the console gets every line too.
        let to_console = write_mutex.is_none() || atty::is(atty::Stream::Stdout);

        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());

            if let Some(m) = &write_mutex {
                if let Ok(mut guard) = m.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
            }

            if record.target() == "security" {
                if let Some(ref sec_path) = security_path {
                    if let Ok(mut sf) = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(sec_path)
                    {
                        let _ = writeln!(sf, "{}", line);
                    }
                }
            }

            if to_console {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
