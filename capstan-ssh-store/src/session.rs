use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio::process::{Child, Command};
use tracing::debug;

use capstan_protocol::{
    Deserialize as _, IoErrorContext as _, ProtocolError, ProtocolVersion, Serialize as _,
    MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, SERVE_MAGIC_1, SERVE_MAGIC_2,
};

use crate::counting::{CountingReader, CountingWriter};
use crate::error::SessionError;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// How to reach one worker.
#[derive(Debug, Clone)]
pub struct SshStoreConfig {
    /// `user@host`, a bare host name, or `localhost` to skip SSH entirely.
    pub host: String,
    pub ssh_key: Option<PathBuf>,
    /// Advertised to the worker via `--option system-features`.
    pub system_features: BTreeSet<String>,
    /// The serve endpoint on the worker, by default `nix-store`.
    pub remote_program: String,
}

impl SshStoreConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ssh_key: None,
            system_features: BTreeSet::new(),
            remote_program: "nix-store".to_string(),
        }
    }

    pub fn is_localhost(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "ssh://localhost")
    }

    fn command(&self, log: std::fs::File) -> Command {
        let mut cmd = if self.is_localhost() {
            Command::new(&self.remote_program)
        } else {
            let mut cmd = Command::new("ssh");
            cmd.arg("-x").arg("-a");
            if let Some(key) = &self.ssh_key {
                cmd.arg("-i").arg(key);
            }
            let host = self.host.strip_prefix("ssh://").unwrap_or(&self.host);
            cmd.arg(host).arg("--").arg(&self.remote_program);
            cmd
        };
        cmd.arg("--serve").arg("--write");
        if !self.system_features.is_empty() {
            let features: Vec<&str> = self.system_features.iter().map(String::as_str).collect();
            cmd.arg("--option")
                .arg("system-features")
                .arg(features.join(","));
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log))
            .kill_on_drop(true);
        cmd
    }

    fn render(&self) -> String {
        if self.is_localhost() {
            format!("{} --serve --write", self.remote_program)
        } else {
            format!("ssh {} {} --serve --write", self.host, self.remote_program)
        }
    }
}

/// The framed, version-negotiated pair of halves of one session.
///
/// One logical task owns the connection at a time; writes must be flushed
/// before a response is expected.
pub struct ServeConnection {
    pub from: CountingReader<BoxedRead>,
    pub to: CountingWriter<BoxedWrite>,
    remote_version: ProtocolVersion,
}

impl ServeConnection {
    /// Perform the client half of the serve handshake over an established
    /// byte stream.
    pub async fn handshake(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Result<Self, SessionError> {
        let mut from = CountingReader::new(Box::new(reader) as BoxedRead);
        let mut to = CountingWriter::new(Box::new(writer) as BoxedWrite);

        SERVE_MAGIC_1.serialize(&mut to, PROTOCOL_VERSION).await?;
        u64::from(PROTOCOL_VERSION)
            .serialize(&mut to, PROTOCOL_VERSION)
            .await?;
        to.flush().await.io_context("flushing handshake")?;

        let magic = u64::deserialize(&mut from, PROTOCOL_VERSION).await?;
        if magic != SERVE_MAGIC_2 {
            return Err(ProtocolError::InvalidMagic {
                expected: SERVE_MAGIC_2,
                actual: magic,
            }
            .into());
        }
        let remote_version =
            ProtocolVersion::from(u64::deserialize(&mut from, PROTOCOL_VERSION).await?);
        if remote_version.major != PROTOCOL_VERSION.major || remote_version < MIN_PROTOCOL_VERSION
        {
            return Err(ProtocolError::IncompatibleVersion {
                server: remote_version,
                min: MIN_PROTOCOL_VERSION,
                max: PROTOCOL_VERSION,
            }
            .into());
        }
        debug!(version = %remote_version, "serve handshake complete");

        Ok(Self {
            from,
            to,
            remote_version,
        })
    }

    pub fn remote_version(&self) -> ProtocolVersion {
        self.remote_version
    }

    /// The negotiated minor version; optional protocol fields are gated on
    /// this.
    pub fn protocol_minor(&self) -> u8 {
        self.remote_version.minor
    }

    pub async fn flush(&mut self) -> Result<(), ProtocolError> {
        self.to.flush().await.io_context("flushing connection")
    }
}

/// A long-running session with one worker.
pub struct Session {
    conn: ServeConnection,
    child: Option<Child>,
}

impl Session {
    /// Spawn the worker process and complete the handshake. The worker's
    /// stderr (the build log) goes to `log`.
    pub async fn open(config: &SshStoreConfig, log: std::fs::File) -> Result<Self, SessionError> {
        let mut child = config.command(log).spawn().map_err(|source| {
            SessionError::Spawn {
                command: config.render(),
                source,
            }
        })?;
        let stdin = child.stdin.take().ok_or(SessionError::MissingPipes)?;
        let stdout = child.stdout.take().ok_or(SessionError::MissingPipes)?;
        let conn = ServeConnection::handshake(stdout, stdin).await?;
        Ok(Self {
            conn,
            child: Some(child),
        })
    }

    /// Wrap an already-handshaken connection (an in-process peer).
    pub fn from_connection(conn: ServeConnection) -> Self {
        Self { conn, child: None }
    }

    /// The established framed pair. Repeated calls return the same
    /// connection.
    pub fn connection(&mut self) -> &mut ServeConnection {
        &mut self.conn
    }

    pub fn remote_version(&self) -> ProtocolVersion {
        self.conn.remote_version
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn bytes_read(&self) -> u64 {
        self.conn.from.bytes()
    }

    pub fn bytes_written(&self) -> u64 {
        self.conn.to.bytes()
    }

    /// Flush and release the transport, then reap the worker process.
    pub async fn close(self) -> Result<(), SessionError> {
        let Session { mut conn, child } = self;
        conn.to
            .flush()
            .await
            .map_err(|e| SessionError::io("flushing session", e))?;
        let _ = conn.to.shutdown().await;
        drop(conn);
        if let Some(mut child) = child {
            let status = child
                .wait()
                .await
                .map_err(|e| SessionError::io("waiting for worker", e))?;
            debug!(%status, "worker exited");
        }
        Ok(())
    }
}
