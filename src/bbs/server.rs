use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::auth::{Authenticator, StoreAuthenticator, USERS_NS};
use super::manager::SessionManager;
use super::session::SessionApp;
use super::shell::Shell;
use crate::config::Config;
use crate::metrics;
use crate::protocol::sftp::SftpServer;
use crate::protocol::telnet::TelnetAdapter;
use crate::protocol::{ProtocolAdapter, ProtocolKind};
use crate::storage::{DbProxy, EngineOptions, StorageEngine};

/// How long sessions get to wind down on shutdown before the engine stops anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Applications available to new sessions, chosen by terminal kind.
#[derive(Clone)]
pub struct Apps {
    pub shell: Arc<dyn SessionApp>,
    pub sftp: Option<Arc<dyn SessionApp>>,
}

impl Apps {
    fn for_kind(&self, kind: ProtocolKind) -> Option<Arc<dyn SessionApp>> {
        match kind {
            ProtocolKind::Sftp => self.sftp.clone(),
            ProtocolKind::Telnet | ProtocolKind::Ssh => Some(self.shell.clone()),
        }
    }
}

/// # BBS Server
///
/// Wires the storage engine, session manager and protocol listeners together and runs
/// until interrupted.
///
/// ## Startup
///
/// 1. open the storage engine (reconciling locks left by a crashed run)
/// 2. create the session manager with the configured capacity
/// 3. bind every enabled listener
///
/// ## Shutdown
///
/// On Ctrl-C all sessions are terminated with a farewell, given a grace period to
/// release their proxy handles, and then the engine flushes and stops. If the engine
/// task dies the server shuts down too, since no session can make progress without it.
pub struct BbsServer {
    config: Config,
    proxy: DbProxy,
    engine: JoinHandle<()>,
    manager: SessionManager,
    apps: Apps,
    listeners: Vec<JoinHandle<()>>,
}

impl BbsServer {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let engine = StorageEngine::open(
            &config.storage.data_dir,
            EngineOptions::from_config(&config.storage),
        )?;
        let (proxy, engine) = engine.spawn();

        let argon2 = config.security.as_ref().and_then(|s| s.argon2.as_ref());
        let auth = StoreAuthenticator::new(&proxy, argon2)?;
        if auth
            .handle()
            .get(USERS_NS, &config.bbs.sysop.to_ascii_lowercase())
            .await?
            .is_none()
        {
            warn!(
                "sysop account '{}' has no password yet; run `termbbs passwd {}`",
                config.bbs.sysop, config.bbs.sysop
            );
        }

        let manager = SessionManager::new(
            config.bbs.max_sessions,
            proxy.clone(),
            config.bbs.idle_timeout(),
        );
        let auth: Arc<dyn Authenticator> = auth;
        let sftp: Option<Arc<dyn SessionApp>> = if config.ssh.enabled && config.sftp.enabled {
            std::fs::create_dir_all(&config.sftp.root)
                .map_err(|e| anyhow!("cannot create sftp root {}: {}", config.sftp.root, e))?;
            Some(Arc::new(SftpServer::from_config(&config.sftp)))
        } else {
            None
        };
        let apps = Apps {
            shell: Arc::new(Shell::new(&config, auth.clone())),
            sftp,
        };

        let mut server = Self {
            config,
            proxy,
            engine,
            manager,
            apps,
            listeners: Vec::new(),
        };
        server.bind_listeners(auth).await?;
        Ok(server)
    }

    async fn bind_listeners(&mut self, auth: Arc<dyn Authenticator>) -> Result<()> {
        if self.config.telnet.enabled {
            let adapter = TelnetAdapter::bind(
                &self.config.telnet.bind,
                self.config.telnet.negotiate_timeout(),
            )
            .await
            .map_err(|e| anyhow!("telnet bind {}: {}", self.config.telnet.bind, e))?;
            self.listeners.push(tokio::spawn(serve_adapter(
                Arc::new(adapter),
                self.manager.clone(),
                self.apps.clone(),
            )));
        }

        #[cfg(feature = "ssh")]
        if self.config.ssh.enabled {
            let adapter = crate::protocol::ssh::SshAdapter::bind(
                &self.config.ssh,
                self.apps.sftp.is_some(),
                auth.clone(),
            )
            .await
            .map_err(|e| anyhow!("ssh bind {}: {}", self.config.ssh.bind, e))?;
            self.listeners.push(tokio::spawn(serve_adapter(
                Arc::new(adapter),
                self.manager.clone(),
                self.apps.clone(),
            )));
        }
        #[cfg(not(feature = "ssh"))]
        if self.config.ssh.enabled {
            warn!("ssh is enabled in config but this build has no ssh support");
        }
        drop(auth);

        if self.listeners.is_empty() {
            return Err(anyhow!("no listener could be started"));
        }
        Ok(())
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn proxy(&self) -> &DbProxy {
        &self.proxy
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(
            "BBS '{}' started by {} ({} nodes)",
            self.config.bbs.name, self.config.bbs.sysop, self.config.bbs.max_sessions
        );
        let mut stats_tick = tokio::time::interval(Duration::from_secs(300));
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break Ok(());
                }
                res = &mut self.engine => {
                    error!("storage engine stopped unexpectedly: {:?}", res);
                    break Err(anyhow!("storage engine stopped"));
                }
                _ = stats_tick.tick() => {
                    let m = metrics::snapshot();
                    debug!(
                        "sessions: {} active, {} peak, {} started, {} refused, {} faults",
                        m.active, m.peak, m.sessions_started, m.refused_capacity, m.faults
                    );
                }
            }
        };
        self.shutdown().await;
        result
    }

    pub async fn shutdown(&mut self) {
        for l in self.listeners.drain(..) {
            l.abort();
        }
        let n = self.manager.terminate_all("The board is shutting down. Goodbye.");
        if n > 0 {
            info!("terminating {} session(s)", n);
        }
        if !self.manager.drain(SHUTDOWN_GRACE).await {
            warn!("{} session(s) did not finish in time", self.manager.active());
        }
        if let Err(e) = self.proxy.shutdown().await {
            debug!("engine already stopped: {}", e);
        }
        info!("BBS '{}' stopped", self.config.bbs.name);
    }
}

/// Accept loop for one adapter. Runs until aborted.
pub async fn serve_adapter(adapter: Arc<dyn ProtocolAdapter>, manager: SessionManager, apps: Apps) {
    let kind = adapter.kind();
    loop {
        let conn = match adapter.accept().await {
            Ok(c) => c,
            Err(e) => {
                warn!("{} accept failed: {}", kind, e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        metrics::inc_connections_accepted();
        let peer = conn.peer;

        let permit = match manager.try_admit() {
            Ok(p) => p,
            Err(e) => {
                info!("{} {} refused: {}", kind, peer, e);
                let adapter = adapter.clone();
                tokio::spawn(async move {
                    if let Err(e) = adapter.refuse(conn, &e.to_string()).await {
                        debug!("{} refuse to {} failed: {}", kind, peer, e);
                    }
                });
                continue;
            }
        };

        let adapter = adapter.clone();
        let manager = manager.clone();
        let apps = apps.clone();
        tokio::spawn(async move {
            let io = match adapter.negotiate(conn).await {
                Ok(io) => io,
                Err(e) => {
                    metrics::inc_negotiation_failures();
                    debug!("{} negotiation with {} failed: {}", kind, peer, e);
                    return;
                }
            };
            let Some(app) = apps.for_kind(io.kind()) else {
                io.close("Service not available.");
                return;
            };
            if let Err(e) = manager.spawn(permit, io, app) {
                error!("could not start session for {}: {}", peer, e);
            }
        });
    }
}
