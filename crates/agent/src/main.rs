// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use onsembl_agent::config::Config;
use onsembl_agent::credential::{
    self, CredentialStore, FileCredentialStore, StaticWithFallback,
};
use onsembl_agent::error::{ExitCode, AUTH_HINT};
use onsembl_agent::heartbeat::MetricsState;
use onsembl_agent::session::{hostname, AgentIdentity, Session, SessionEnd};
use onsembl_agent::supervisor::{Supervisor, SupervisorExit};

#[derive(Parser)]
#[command(name = "onsembl-agent", version, about = "Wrapper for AI coding agents.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Credential management.
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
    /// Supervise an agent and join the control plane.
    Start {
        #[command(flatten)]
        config: Config,
    },
}

#[derive(Subcommand)]
enum AuthAction {
    /// Store an API key in the credential store.
    Login {
        /// API key; read from stdin when omitted.
        #[arg(long, env = "ONSEMBL_API_KEY")]
        api_key: Option<String>,
        #[arg(long, env = "ONSEMBL_STATE_DIR")]
        state_dir: Option<PathBuf>,
    },
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    match config.log_file {
        Some(ref path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path);
            match file {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false)
                        .init();
                }
                Err(e) => {
                    eprintln!("warning: cannot open log file: {e}");
                    tracing_subscriber::fmt().with_env_filter(filter).init();
                }
            }
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn auth_login(api_key: Option<String>, state_dir: Option<PathBuf>) -> i32 {
    let key = match api_key {
        Some(key) => key,
        None => {
            eprintln!("paste API key, then EOF:");
            let mut buf = String::new();
            if std::io::stdin().read_to_string(&mut buf).is_err() {
                eprintln!("error: could not read API key from stdin");
                return ExitCode::ConfigError.code();
            }
            buf.trim().to_owned()
        }
    };
    if key.is_empty() {
        eprintln!("error: empty API key");
        return ExitCode::ConfigError.code();
    }
    let dir = match credential::state_dir(state_dir.as_deref()) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::ConfigError.code();
        }
    };
    let store = FileCredentialStore::new(&dir);
    match store.store(&key) {
        Ok(()) => {
            println!("credential stored in {}", dir.display());
            ExitCode::Normal.code()
        }
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::ConfigError.code();
        }
    }
}

async fn start(config: Config) -> i32 {
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        return ExitCode::ConfigError.code();
    }
    init_tracing(&config);

    let kind = match config.kind() {
        Ok(kind) => kind,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::ConfigError.code();
        }
    };
    let state_dir = match credential::state_dir(config.state_dir.as_deref()) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::ConfigError.code();
        }
    };

    let credentials: Arc<dyn CredentialStore> = match config.api_key {
        Some(ref key) => Arc::new(StaticWithFallback::new(key.clone(), &state_dir)),
        None => Arc::new(FileCredentialStore::new(&state_dir)),
    };
    match credentials.get() {
        Ok(Some(_)) => {}
        _ => {
            eprintln!("error: no credential available; {AUTH_HINT}");
            return ExitCode::AuthRequired.code();
        }
    }

    let agent_name =
        config.agent_name.clone().unwrap_or_else(|| format!("{kind}@{}", hostname()));
    let agent_id = match credential::load_or_create_agent_id(&state_dir, &agent_name) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::ConfigError.code();
        }
    };

    let shutdown = CancellationToken::new();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            ctrl_c_shutdown.cancel();
        }
    });

    let child_pid = Arc::new(AtomicU32::new(0));
    let metrics = MetricsState::new(Arc::clone(&child_pid));
    let (events_tx, events_rx) = mpsc::channel(256);
    let (directives_tx, directives_rx) = mpsc::channel(16);

    let supervisor =
        Supervisor::new(config.clone(), kind, events_tx, shutdown.clone(), child_pid);
    let supervisor_task = tokio::spawn(supervisor.run(directives_rx));

    let session = Session::new(
        config,
        AgentIdentity { agent_id, agent_name, kind },
        credentials,
        directives_tx,
        metrics,
        shutdown.clone(),
    );
    let end = session.run(events_rx).await;

    shutdown.cancel();
    let supervisor_exit = supervisor_task.await.unwrap_or(SupervisorExit::Stopped);

    match (end, supervisor_exit) {
        (SessionEnd::AuthRequired, _) => ExitCode::AuthRequired.code(),
        (SessionEnd::TransportExhausted, _) => ExitCode::Transport.code(),
        (_, SupervisorExit::ChildFatal) => ExitCode::ChildFatal.code(),
        _ => ExitCode::Normal.code(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Auth { action: AuthAction::Login { api_key, state_dir } } => {
            auth_login(api_key, state_dir)
        }
        Commands::Start { config } => {
            let code = start(config).await;
            if code != 0 {
                error!(code, "exiting");
            }
            code
        }
    };
    std::process::exit(code);
}
