// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::auth::TokenState;
use crate::config::Config;
use crate::directory::AgentDirectory;
use crate::heartbeat::HeartbeatTracker;
use crate::registry::ConnectionRegistry;
use crate::router::{CommandRouter, RouterSettings};

/// Shared server state passed to all handlers via axum `State` extractor.
pub struct Store {
    pub config: Config,
    pub registry: Arc<ConnectionRegistry>,
    pub directory: Arc<AgentDirectory>,
    pub router: Arc<CommandRouter>,
    pub audit: AuditLog,
    pub tokens: TokenState,
    pub heartbeats: Arc<HeartbeatTracker>,
    pub shutdown: CancellationToken,
}

impl Store {
    pub fn new(config: Config, shutdown: CancellationToken) -> Arc<Self> {
        let data_dir = config.data_dir.as_deref();
        let registry = Arc::new(ConnectionRegistry::new(config.send_buffer_frames));
        let directory = Arc::new(AgentDirectory::open(data_dir));
        let audit = AuditLog::open(data_dir, config.audit_retention());
        let output_dir = config.data_dir.as_ref().map(|d| d.join("outputs"));
        let router = CommandRouter::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            audit.clone(),
            RouterSettings {
                command_timeout: config.command_timeout(),
                interrupt_grace: config.interrupt_grace(),
            },
            output_dir,
        );
        let tokens = TokenState::new(config.auth_token.clone());

        Arc::new(Self {
            config,
            registry,
            directory,
            router,
            audit,
            tokens,
            heartbeats: Arc::new(HeartbeatTracker::new()),
            shutdown,
        })
    }
}
