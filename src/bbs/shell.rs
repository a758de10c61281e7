//! Built-in line shell for telnet and SSH sessions.
//!
//! Commands are case-insensitive. `KICK` and `BROADCAST` require being logged in as the
//! configured sysop.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::auth::Authenticator;
use super::session::{SessionApp, SessionContext, SessionId};
use crate::config::Config;
use crate::error::{BbsError, Result};
use crate::logutil::escape_log;
use crate::protocol::Style;

pub const LASTCALL_NS: &str = "lastcall";

/// Persisted per-user record of the previous call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastCall {
    pub at: DateTime<Utc>,
    pub peer: String,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Who,
    Msg { target: String, text: String },
    Login { username: Option<String> },
    Kick { target: String },
    Broadcast { text: String },
    Quit,
    Empty,
    Unknown(String),
}

/// Parse one input line.
pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    match word.to_ascii_uppercase().as_str() {
        "HELP" | "H" | "?" => Command::Help,
        "WHO" | "W" => Command::Who,
        "MSG" | "M" => match rest.split_once(char::is_whitespace) {
            Some((target, text)) if !text.trim().is_empty() => Command::Msg {
                target: target.to_string(),
                text: text.trim().to_string(),
            },
            _ => Command::Unknown(line.to_string()),
        },
        "LOGIN" | "L" => Command::Login {
            username: (!rest.is_empty()).then(|| rest.to_string()),
        },
        "KICK" if !rest.is_empty() => Command::Kick {
            target: rest.to_string(),
        },
        "BROADCAST" | "B" if !rest.is_empty() => Command::Broadcast {
            text: rest.to_string(),
        },
        "QUIT" | "Q" | "BYE" | "LOGOUT" => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    }
}

pub struct Shell {
    board_name: String,
    welcome: String,
    sysop: String,
    auth: Arc<dyn Authenticator>,
}

impl Shell {
    pub fn new(config: &Config, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            board_name: config.bbs.name.clone(),
            welcome: config.bbs.welcome_message.clone(),
            sysop: config.bbs.sysop.to_ascii_lowercase(),
            auth,
        }
    }

    fn is_sysop(&self, ctx: &SessionContext) -> bool {
        ctx.info.username.as_deref() == Some(self.sysop.as_str())
    }

    fn resolve_target(&self, ctx: &SessionContext, target: &str) -> Option<SessionId> {
        if let Ok(n) = target.parse::<u64>() {
            let id = SessionId(n);
            return ctx.manager().registry().find(id).map(|i| i.id);
        }
        ctx.manager()
            .registry()
            .find_user(target)
            .first()
            .map(|i| i.id)
    }

    fn help(&self, ctx: &SessionContext) {
        let io = &ctx.io;
        io.write_styled(Style::Bold, "Commands:\n");
        io.write_line("  HELP               this list");
        io.write_line("  WHO                who is online");
        io.write_line("  MSG <id|user> <t>  private message");
        io.write_line("  LOGIN [user]       log in");
        io.write_line("  QUIT               disconnect");
        if self.is_sysop(ctx) {
            io.write_line("  KICK <id|user>     disconnect a session");
            io.write_line("  BROADCAST <text>   message everyone");
        }
    }

    fn who(&self, ctx: &SessionContext) {
        let sessions = ctx.manager().registry().list();
        ctx.io.write_line(&format!(
            "{:>4}  {:<16} {:<7} {:<22} {:>6}",
            "ID", "USER", "VIA", "FROM", "ON"
        ));
        for s in &sessions {
            let marker = if s.id == ctx.id() { "*" } else { " " };
            ctx.io.write_line(&format!(
                "{:>3}{} {:<16} {:<7} {:<22} {:>6}",
                s.id.0,
                marker,
                s.display_name(),
                s.kind,
                s.peer,
                s.online_for()
            ));
        }
        ctx.io.write_line(&format!(
            "{} of {} nodes in use.",
            ctx.manager().active(),
            ctx.manager().max_sessions()
        ));
    }

    async fn login(&self, ctx: &mut SessionContext, username: Option<String>) -> Result<()> {
        let username = match username {
            Some(u) => u,
            None => {
                ctx.io.write_str("Username: ");
                match ctx.io.read_line().await? {
                    Some(u) if !u.trim().is_empty() => u.trim().to_string(),
                    Some(_) => return Ok(()),
                    None => return Err(BbsError::Protocol("disconnected at login".into())),
                }
            }
        };
        ctx.io.write_str("Password: ");
        let Some(password) = ctx.io.read_masked('*').await? else {
            return Err(BbsError::Protocol("disconnected at login".into()));
        };
        match self.auth.authenticate(&username, &password).await {
            Ok(name) => {
                ctx.set_username(&name)?;
                ctx.io
                    .write_styled(Style::Bold, &format!("Welcome back, {}.\n", name));
                self.record_call(ctx, &name).await?;
                Ok(())
            }
            Err(BbsError::Auth(_)) => {
                ctx.io.write_styled(Style::Error, "Login failed.\n");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn record_call(&self, ctx: &SessionContext, name: &str) -> Result<()> {
        if let Some(prev) = ctx.db.get_json::<LastCall>(LASTCALL_NS, name).await? {
            ctx.io.write_line(&format!(
                "Last call: {} via {} from {}",
                prev.at.format("%Y-%m-%d %H:%M UTC"),
                prev.protocol,
                prev.peer
            ));
        }
        let now = LastCall {
            at: Utc::now(),
            peer: ctx.info.peer.to_string(),
            protocol: ctx.info.kind.to_string(),
        };
        match ctx.db.set_json(LASTCALL_NS, name, &now).await {
            // Another session of the same user holds the record; skip this update.
            Err(BbsError::StorageConflict { .. }) => Ok(()),
            other => other,
        }
    }

    async fn execute(&self, ctx: &mut SessionContext, cmd: Command) -> Result<bool> {
        match cmd {
            Command::Empty => {}
            Command::Help => self.help(ctx),
            Command::Who => self.who(ctx),
            Command::Msg { target, text } => match self.resolve_target(ctx, &target) {
                Some(to) if ctx.manager().send(ctx.id(), to, &text) => {
                    ctx.io.write_line("Message sent.");
                }
                _ => {
                    ctx.io.write_styled(Style::Error, "No such session.\n");
                }
            },
            Command::Login { username } => self.login(ctx, username).await?,
            Command::Kick { target } => {
                if !self.is_sysop(ctx) {
                    ctx.io.write_styled(Style::Error, "Permission denied.\n");
                } else {
                    match self.resolve_target(ctx, &target) {
                        Some(id) if id == ctx.id() => {
                            ctx.io.write_line("Use QUIT to leave.");
                        }
                        Some(id) => {
                            let ok = ctx
                                .manager()
                                .terminate_with(id, "You have been disconnected by the sysop.");
                            info!(
                                target: "security",
                                "sysop {} kicked session {}",
                                self.sysop,
                                id
                            );
                            ctx.io.write_line(if ok {
                                "Session disconnected."
                            } else {
                                "Session already gone."
                            });
                        }
                        None => {
                            ctx.io.write_styled(Style::Error, "No such session.\n");
                        }
                    }
                }
            }
            Command::Broadcast { text } => {
                if !self.is_sysop(ctx) {
                    ctx.io.write_styled(Style::Error, "Permission denied.\n");
                } else {
                    let n = ctx
                        .manager()
                        .broadcast(&format!("Broadcast from {}: {}", self.sysop, text));
                    ctx.io.write_line(&format!("Delivered to {} session(s).", n));
                }
            }
            Command::Quit => return Ok(false),
            Command::Unknown(line) => {
                debug!("session {}: unknown command {}", ctx.id(), escape_log(&line));
                ctx.io.write_line("Unknown command. Type HELP.");
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl SessionApp for Shell {
    async fn run(&self, ctx: &mut SessionContext) -> Result<()> {
        ctx.io.write_styled(Style::Bold, &format!("{}\n", self.board_name));
        if !self.welcome.is_empty() {
            ctx.io.write_line(&self.welcome);
        }
        if let Some(name) = ctx.info.username.clone() {
            ctx.io.write_line(&format!("Logged in as {}.", name));
            self.record_call(ctx, &name).await?;
        }
        loop {
            ctx.io.write_str(&format!("{}> ", ctx.info.display_name()));
            let Some(line) = ctx.io.read_line().await? else {
                return Ok(());
            };
            ctx.touch();
            if !self.execute(ctx, parse_command(&line)).await? {
                return Ok(());
            }
        }
    }
}
