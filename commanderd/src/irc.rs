//! Minimal IRC transport.
//!
//! Only the subset the bridge needs: NICK/USER registration with bounded
//! collision retries, PING/PONG, JOIN, PRIVMSG in both directions, QUIT.
//! The read half belongs to the ingress loop; the write half is a cloneable
//! handle shared with the result-relay loop.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::CommanderConfig;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_NICK_RETRIES: u32 = 5;
// Single IRC lines are capped around 512 bytes including framing.
const MAX_LINE_LEN: usize = 400;

pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Parsed IRC line: `[:prefix] COMMAND params [:trailing]`.
#[derive(Debug, Default, Clone)]
pub struct IrcMessage {
    pub nick: String,
    pub command: String,
    pub params: Vec<String>,
    pub trailing: String,
}

impl IrcMessage {
    /// Target channel or nick for PRIVMSG/NOTICE.
    pub fn channel(&self) -> &str {
        self.params.first().map(String::as_str).unwrap_or("")
    }
}

pub fn parse_line(raw: &str) -> IrcMessage {
    let mut msg = IrcMessage::default();
    let mut line = raw.trim_end_matches(['\r', '\n']).trim();
    if line.is_empty() {
        return msg;
    }

    if let Some(idx) = line.find(" :") {
        msg.trailing = line[idx + 2..].to_string();
        line = &line[..idx];
    }

    let mut parts = line.split_whitespace();
    let mut first = parts.next().unwrap_or("");

    if let Some(prefix) = first.strip_prefix(':') {
        msg.nick = prefix.split('!').next().unwrap_or(prefix).to_string();
        first = parts.next().unwrap_or("");
    }

    msg.command = first.to_uppercase();
    msg.params = parts.map(str::to_string).collect();
    msg
}

/// Cloneable write handle; safe for concurrent use from both loops.
#[derive(Clone)]
pub struct IrcWriter {
    inner: Arc<Mutex<WriteHalf<Box<dyn Transport>>>>,
}

impl IrcWriter {
    fn new(half: WriteHalf<Box<dyn Transport>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(half)),
        }
    }

    pub async fn send_raw(&self, line: &str) -> io::Result<()> {
        debug!(">> {}", line);
        let mut guard = self.inner.lock().await;
        guard.write_all(line.as_bytes()).await?;
        guard.write_all(b"\r\n").await?;
        guard.flush().await
    }

    pub async fn privmsg(&self, target: &str, text: &str) -> io::Result<()> {
        let mut text = text.replace(['\r', '\n'], " ");
        if text.len() > MAX_LINE_LEN {
            let mut cut = MAX_LINE_LEN;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        self.send_raw(&format!("PRIVMSG {} :{}", target, text)).await
    }

    pub async fn pong(&self, token: &str) -> io::Result<()> {
        self.send_raw(&format!("PONG :{}", token)).await
    }

    pub async fn quit(&self, reason: &str) -> io::Result<()> {
        self.send_raw(&format!("QUIT :{}", reason)).await
    }
}

pub struct IrcConnection {
    reader: BufReader<ReadHalf<Box<dyn Transport>>>,
    writer: IrcWriter,
    nick: String,
}

impl IrcConnection {
    /// Connect, register (retrying on nick collision), and join channels.
    pub async fn connect(cfg: &CommanderConfig) -> Result<Self> {
        let stream = open_stream(cfg).await?;
        let (read_half, write_half) = tokio::io::split(stream);

        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: IrcWriter::new(write_half),
            nick: cfg.irc_nick.clone(),
        };
        conn.register(cfg).await?;
        Ok(conn)
    }

    pub fn writer(&self) -> IrcWriter {
        self.writer.clone()
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Read one line; `Err` means the connection is gone.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .context("transport read failed")?;
        if n == 0 {
            bail!("transport closed by server");
        }
        Ok(line)
    }

    async fn register(&mut self, cfg: &CommanderConfig) -> Result<()> {
        self.writer
            .send_raw(&format!("NICK {}", self.nick))
            .await?;
        self.writer
            .send_raw(&format!("USER {} 0 * :fleet commander", cfg.irc_nick))
            .await?;

        let mut collisions: u32 = 0;
        loop {
            let line = timeout(REGISTRATION_TIMEOUT, self.read_line())
                .await
                .context("timed out waiting for registration")??;
            let msg = parse_line(&line);
            match msg.command.as_str() {
                // Welcome: nick is ours.
                "001" => break,
                // Nick in use / unavailable: retry with a suffix, capped.
                "433" | "436" => {
                    collisions += 1;
                    if collisions > MAX_NICK_RETRIES {
                        bail!(
                            "could not claim a nick after {} collisions",
                            MAX_NICK_RETRIES
                        );
                    }
                    self.nick = format!("{}-{}", cfg.irc_nick, collisions);
                    warn!("Nick collision, retrying as {}", self.nick);
                    self.writer
                        .send_raw(&format!("NICK {}", self.nick))
                        .await?;
                }
                "PING" => self.writer.pong(&msg.trailing).await?,
                _ => {}
            }
        }

        info!("Registered as {} on {}", self.nick, cfg.irc_server);
        for channel in &cfg.irc_channels {
            self.writer.send_raw(&format!("JOIN {}", channel)).await?;
            info!("Joined {}", channel);
        }
        Ok(())
    }
}

async fn open_stream(cfg: &CommanderConfig) -> Result<Box<dyn Transport>> {
    let addr = format!("{}:{}", cfg.irc_server, cfg.irc_port);
    let tcp = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connecting to {}", addr))?;

    if !cfg.irc_use_tls {
        return Ok(Box::new(tcp));
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_cfg = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_cfg));
    let name = ServerName::try_from(cfg.irc_server.clone())
        .with_context(|| format!("invalid TLS server name {}", cfg.irc_server))?;
    let tls = connector
        .connect(name, tcp)
        .await
        .context("TLS handshake failed")?;
    Ok(Box::new(tls))
}
