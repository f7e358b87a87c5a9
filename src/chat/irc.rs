//! Twitch chat over IRC
//!
//! Login is `CAP REQ`, `PASS oauth:<token>`, `NICK <login>`; the session is
//! up once the server sends `001`. Twitch reports bad credentials with a
//! `NOTICE *` instead of an IRC error numeric.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{normalize_channel, BotCredentials, ChatConnector, ChatEvent, ChatLink, ChatSession};
use crate::types::{Result, RuinousError};

pub const DEFAULT_IRC_HOST: &str = "irc.chat.twitch.tv";
pub const DEFAULT_IRC_PORT: u16 = 6667;

/// Write half of the chat socket; every line must go out within `limit`
struct LineWriter {
    half: Mutex<OwnedWriteHalf>,
    limit: Duration,
}

type Writer = Arc<LineWriter>;

/// Connects the bot to Twitch chat
pub struct TwitchIrcConnector {
    host: String,
    port: u16,
    login: String,
    login_timeout: Duration,
}

impl TwitchIrcConnector {
    pub fn new(host: impl Into<String>, port: u16, login: impl Into<String>, login_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            login: login.into().to_ascii_lowercase(),
            login_timeout,
        }
    }
}

#[async_trait]
impl ChatConnector for TwitchIrcConnector {
    async fn connect(&self, credentials: &BotCredentials) -> Result<ChatLink> {
        let stream = tokio::time::timeout(
            self.login_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| RuinousError::Timeout(format!("connecting to {}:{}", self.host, self.port)))?
        .map_err(|e| RuinousError::Chat(format!("failed to connect to chat: {e}")))?;

        let (read_half, write_half) = stream.into_split();
        let writer: Writer = Arc::new(LineWriter {
            half: Mutex::new(write_half),
            limit: self.login_timeout,
        });
        let mut lines = BufReader::new(read_half).lines();

        write_line(&writer, "CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership").await?;
        write_line(&writer, &format!("PASS oauth:{}", credentials.access_token)).await?;
        write_line(&writer, &format!("NICK {}", self.login)).await?;

        tokio::time::timeout(self.login_timeout, await_welcome(&mut lines, &writer))
            .await
            .map_err(|_| RuinousError::Timeout("waiting for chat login".into()))??;

        info!(nick = %self.login, "Registered with chat");

        let (events_tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(lines, Arc::clone(&writer), events_tx));

        Ok(ChatLink {
            session: Box::new(IrcSession {
                nick: self.login.clone(),
                writer,
                reader,
            }),
            events,
        })
    }
}

async fn await_welcome(lines: &mut Lines<BufReader<OwnedReadHalf>>, writer: &Writer) -> Result<()> {
    while let Some(line) = lines.next_line().await? {
        match classify(line.trim_end_matches('\r')) {
            ServerLine::Ping(token) => write_line(writer, &format!("PONG {token}")).await?,
            ServerLine::Welcome => return Ok(()),
            ServerLine::AuthFailed(reason) => return Err(RuinousError::Auth(reason)),
            _ => {}
        }
    }
    Err(RuinousError::Chat("connection closed during login".into()))
}

async fn read_loop(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    writer: Writer,
    events: mpsc::UnboundedSender<ChatEvent>,
) {
    let reason = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break None,
            Err(e) => break Some(e.to_string()),
        };

        let event = match classify(line.trim_end_matches('\r')) {
            ServerLine::Ping(token) => {
                if let Err(e) = write_line(&writer, &format!("PONG {token}")).await {
                    break Some(e.to_string());
                }
                continue;
            }
            ServerLine::AuthFailed(reason) => ChatEvent::AuthFailed(reason),
            ServerLine::Reconnect => break Some("server requested reconnect".into()),
            ServerLine::Event(event) => event,
            ServerLine::Welcome | ServerLine::Other => continue,
        };

        let fatal = matches!(event, ChatEvent::AuthFailed(_));
        if events.send(event).is_err() || fatal {
            return;
        }
    };

    debug!(?reason, "Chat reader finished");
    let _ = events.send(ChatEvent::Closed(reason));
}

async fn write_line(writer: &Writer, line: &str) -> Result<()> {
    let write = async {
        let mut half = writer.half.lock().await;
        half.write_all(line.as_bytes()).await?;
        half.write_all(b"\r\n").await?;
        Ok::<(), RuinousError>(())
    };

    // Only the command word: PASS lines carry the token
    let command = line.split(' ').next().unwrap_or_default();
    tokio::time::timeout(writer.limit, write)
        .await
        .map_err(|_| RuinousError::Timeout(format!("writing {command} to chat")))?
}

struct IrcSession {
    nick: String,
    writer: Writer,
    reader: JoinHandle<()>,
}

#[async_trait]
impl ChatSession for IrcSession {
    fn nick(&self) -> &str {
        &self.nick
    }

    async fn join(&mut self, channel: &str) -> Result<()> {
        write_line(&self.writer, &format!("JOIN #{}", normalize_channel(channel))).await
    }

    async fn part(&mut self, channel: &str) -> Result<()> {
        write_line(&self.writer, &format!("PART #{}", normalize_channel(channel))).await
    }

    async fn say(&mut self, channel: &str, text: &str) -> Result<()> {
        write_line(
            &self.writer,
            &format!("PRIVMSG #{} :{}", normalize_channel(channel), text),
        )
        .await
    }

    async fn quit(&mut self) {
        if let Err(e) = write_line(&self.writer, "QUIT").await {
            warn!("Failed to send QUIT: {}", e);
        }
        self.reader.abort();
    }
}

impl Drop for IrcSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[derive(Debug, PartialEq)]
enum ServerLine {
    Ping(String),
    Welcome,
    AuthFailed(String),
    Reconnect,
    Event(ChatEvent),
    Other,
}

fn classify(line: &str) -> ServerLine {
    if let Some(token) = line.strip_prefix("PING ") {
        return ServerLine::Ping(token.to_string());
    }

    let (tags, payload) = parse_irc_tags(line);
    let mut parts = payload.splitn(4, ' ');
    let (Some(prefix), Some(command)) = (parts.next(), parts.next()) else {
        return ServerLine::Other;
    };
    let target = parts.next().unwrap_or_default();
    let trailing = parts.next().unwrap_or_default();
    let text = trailing.strip_prefix(':').unwrap_or(trailing);
    let user = prefix_user(prefix);

    match command {
        "001" => ServerLine::Welcome,
        "RECONNECT" => ServerLine::Reconnect,
        "NOTICE" if target == "*" && is_auth_failure(text) => ServerLine::AuthFailed(text.to_string()),
        "PRIVMSG" if !user.is_empty() => {
            let channel = normalize_channel(target);
            let is_broadcaster = tags
                .get("badges")
                .map(|b| b.split(',').any(|badge| badge.starts_with("broadcaster/")))
                .unwrap_or(false)
                || user == channel;
            ServerLine::Event(ChatEvent::Message {
                channel,
                user: tags
                    .get("display-name")
                    .filter(|name| !name.is_empty())
                    .cloned()
                    .unwrap_or(user),
                text: text.to_string(),
                is_broadcaster,
            })
        }
        "JOIN" if !user.is_empty() => ServerLine::Event(ChatEvent::Joined {
            channel: normalize_channel(target),
            user,
        }),
        "PART" if !user.is_empty() => ServerLine::Event(ChatEvent::Parted {
            channel: normalize_channel(target),
            user,
        }),
        _ => ServerLine::Other,
    }
}

fn is_auth_failure(text: &str) -> bool {
    text.contains("Login authentication failed") || text.contains("Improperly formatted auth")
}

fn prefix_user(prefix: &str) -> String {
    let Some(prefix) = prefix.strip_prefix(':') else {
        return String::new();
    };
    if !prefix.contains('!') {
        return String::new();
    }
    prefix
        .split('!')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn parse_irc_tags(line: &str) -> (HashMap<String, String>, &str) {
    let Some(stripped) = line.strip_prefix('@') else {
        return (HashMap::new(), line);
    };
    let Some((tags_part, payload)) = stripped.split_once(' ') else {
        return (HashMap::new(), line);
    };

    let tags = tags_part
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), decode_irc_tag_value(value)))
        .collect();
    (tags, payload)
}

fn decode_irc_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some(':') => out.push(';'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
