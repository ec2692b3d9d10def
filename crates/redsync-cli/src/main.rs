//! `redsync` - run a command while holding a distributed lock

mod logging;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use redsync::{Mutex, MutexOptions, Profile, RedsyncConfig, quorum};
use tokio::process::Command;
use tracing::{error, info, warn};

/// Exit code when the lock is held elsewhere (EX_TEMPFAIL)
const EXIT_CONTENDED: u8 = 75;

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "redsync", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long, env = "REDSYNC_CONFIG")]
    config: Option<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Acquire a lock, run a command under it, then release it
    Run {
        /// Lock name
        #[arg(short = 'n', long)]
        name: String,

        /// Option preset, overriding the configured one
        #[arg(short = 'p', long)]
        profile: Option<Profile>,

        /// Acquisition attempts
        #[arg(long)]
        tries: Option<u32>,

        /// Lease duration in milliseconds
        #[arg(long)]
        expiry_ms: Option<u64>,

        /// Wait between attempts in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Command and arguments to run while holding the lock
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Print the quorum size for a node count
    Quorum {
        nodes: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Quorum { nodes } => {
            println!("{}", quorum(nodes));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            name,
            profile,
            tries,
            expiry_ms,
            delay_ms,
            command,
        } => {
            let cfg = RedsyncConfig::load(cli.config.as_deref())?;

            let mut opts = match profile {
                Some(profile) => MutexOptions::from(profile),
                None => cfg.mutex_options()?,
            };
            if let Some(tries) = tries {
                opts.tries = tries;
            }
            if let Some(ms) = expiry_ms {
                opts.expiry = Duration::from_millis(ms);
            }
            if let Some(ms) = delay_ms {
                opts.delay = Duration::from_millis(ms);
            }
            opts.validate()?;

            let rs = cfg.connect().await?;
            let mut mutex = rs.new_mutex(name, opts);
            run_locked(&mut mutex, &command).await
        }
    }
}

async fn run_locked(mutex: &mut Mutex, command: &[String]) -> anyhow::Result<ExitCode> {
    match mutex.lock().await {
        Ok(()) => info!(name = mutex.name(), "Lock acquired"),
        Err(e) if e.is_contention() => {
            warn!(name = mutex.name(), "Lock is held elsewhere");
            return Ok(ExitCode::from(EXIT_CONTENDED));
        }
        Err(e) => return Err(e.into()),
    }

    let result = supervise(mutex, command).await;

    if mutex.unlock().await {
        info!(name = mutex.name(), "Lock released");
    } else {
        warn!(name = mutex.name(), "Lock release did not reach a quorum");
    }
    result
}

/// Run the child, extending the lease every third of its duration
async fn supervise(mutex: &mut Mutex, command: &[String]) -> anyhow::Result<ExitCode> {
    let Some((program, args)) = command.split_first() else {
        bail!("no command given");
    };
    let mut child = Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", program))?;

    let period = (mutex.options().expiry / 3).max(Duration::from_millis(1));
    let mut keepalive = tokio::time::interval(period);
    // The first tick completes immediately
    keepalive.tick().await;

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for child")?;
                info!(%status, "Command finished");
                return Ok(exit_code(status.code()));
            }
            _ = keepalive.tick() => {
                if !mutex.extend().await {
                    error!(name = mutex.name(), "Lease lost, stopping command");
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill child: {}", e);
                    }
                    return Ok(ExitCode::FAILURE);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping command");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill child: {}", e);
                }
                return Ok(ExitCode::from(130));
            }
        }
    }
}

fn exit_code(code: Option<i32>) -> ExitCode {
    match code {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "redsync",
            "--config",
            "conf/redsync.yml",
            "run",
            "--name",
            "nightly",
            "--profile",
            "non-blocking",
            "--expiry-ms",
            "3000",
            "--",
            "echo",
            "hello",
        ])
        .unwrap();

        assert_eq!(cli.config.as_deref(), Some("conf/redsync.yml"));
        match cli.command {
            Commands::Run {
                name,
                profile,
                tries,
                expiry_ms,
                command,
                ..
            } => {
                assert_eq!(name, "nightly");
                assert_eq!(profile, Some(Profile::NonBlocking));
                assert_eq!(tries, None);
                assert_eq!(expiry_ms, Some(3000));
                assert_eq!(command, vec!["echo", "hello"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Cli::try_parse_from(["redsync", "run", "--name", "x"]).is_err());
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let parsed = Cli::try_parse_from([
            "redsync", "run", "--name", "x", "--profile", "eager", "--", "true",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_quorum() {
        let cli = Cli::try_parse_from(["redsync", "quorum", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::Quorum { nodes: 5 }));
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(Some(0)), ExitCode::SUCCESS);
        assert_eq!(exit_code(Some(3)), ExitCode::from(3));
        assert_eq!(exit_code(Some(-1)), ExitCode::from(1));
        assert_eq!(exit_code(None), ExitCode::FAILURE);
    }
}
