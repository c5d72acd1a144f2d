//! PostgreSQL replication session
//!
//! A minimal frontend speaking the startup and authentication flow with
//! `replication=database`, then `START_REPLICATION ... (proto_version '1')`
//! into CopyBoth mode. The normal query path is deliberately absent: scans
//! run on a separate driver connection, and this session only ever carries
//! replication traffic.

use anyhow::{anyhow, bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::frontend;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::scram::ScramExchange;

/// Upper bound on a single backend message; anything larger means a corrupt
/// stream.
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Seconds between the Unix and PostgreSQL epochs (2000-01-01 UTC).
const POSTGRES_EPOCH_UNIX_SECS: u64 = 946_684_800;

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

// Authentication request codes carried in 'R' messages.
const AUTH_OK: i32 = 0;
const AUTH_CLEARTEXT: i32 = 3;
const AUTH_MD5: i32 = 5;
const AUTH_SASL: i32 = 10;
const AUTH_SASL_CONTINUE: i32 = 11;
const AUTH_SASL_FINAL: i32 = 12;

/// A connected, authenticated replication session.
pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
}

impl ReplicationClient {
    /// Connect and authenticate in replication mode.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        database: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        info!(host, port, user, database, "connecting replication session");
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("connecting to {host}:{port}"))?;
        let mut stream = BufReader::new(stream);

        let params = [
            ("user", user),
            ("database", database),
            ("replication", "database"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params, &mut buf)?;
        stream.write_all(&buf).await?;
        stream.flush().await?;

        authenticate(&mut stream, user, password).await?;

        // Drain ParameterStatus/BackendKeyData until the session is ready.
        loop {
            let (code, body) = read_message(&mut stream).await?;
            match code {
                b'Z' => break,
                b'E' => bail!("session setup failed: {}", error_message(&body)),
                _ => {}
            }
        }
        debug!("replication session ready");

        Ok(Self { stream })
    }

    /// Start streaming from a slot, entering CopyBoth mode.
    pub async fn start_replication(
        mut self,
        slot_name: &str,
        start_lsn: u64,
        publication_name: &str,
    ) -> Result<ReplicationSocket> {
        let command = format!(
            "START_REPLICATION SLOT {} LOGICAL {:X}/{:X} (proto_version '1', publication_names '{}')",
            slot_name,
            start_lsn >> 32,
            start_lsn as u32,
            publication_name,
        );
        debug!(command = %command, "starting replication");

        let mut buf = BytesMut::new();
        frontend::query(&command, &mut buf)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        loop {
            let (code, body) = read_message(&mut self.stream).await?;
            match code {
                // CopyBothResponse
                b'W' => {
                    info!(slot = %slot_name, "entered CopyBoth mode");
                    return Ok(ReplicationSocket {
                        stream: self.stream,
                    });
                }
                b'E' => bail!("START_REPLICATION failed: {}", error_message(&body)),
                b'N' => debug!("notice: {}", error_message(&body)),
                other => bail!(
                    "unexpected response {:?} to START_REPLICATION",
                    other as char
                ),
            }
        }
    }
}

/// The CopyBoth data channel of a started replication session.
pub struct ReplicationSocket {
    stream: BufReader<TcpStream>,
}

impl ReplicationSocket {
    /// Read the next CopyData payload.
    ///
    /// Returns `None` when the server ends the copy stream.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            let (code, body) = read_message(&mut self.stream).await?;
            match code {
                b'd' => return Ok(Some(Bytes::from(body))),
                b'c' => return Ok(None),
                b'E' => bail!("replication stream error: {}", error_message(&body)),
                b'N' => debug!("notice: {}", error_message(&body)),
                other => {
                    warn!(code = %(other as char), "ignoring unexpected copy message");
                }
            }
        }
    }

    /// Send a standby status update confirming everything up to `lsn` as
    /// written, flushed, and applied.
    pub async fn send_status_update(&mut self, lsn: u64) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(lsn);
        payload.put_u64(lsn);
        payload.put_u64(lsn);
        payload.put_i64(postgres_epoch_micros());
        payload.put_u8(0); // no reply requested

        let mut frame = BytesMut::with_capacity(5 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

async fn authenticate(
    stream: &mut BufReader<TcpStream>,
    user: &str,
    password: Option<&str>,
) -> Result<()> {
    loop {
        let (code, body) = read_message(stream).await?;
        match code {
            b'E' => bail!("authentication failed: {}", error_message(&body)),
            b'N' => {
                debug!("notice: {}", error_message(&body));
                continue;
            }
            b'R' => {}
            other => bail!("unexpected message {:?} during authentication", other as char),
        }

        match auth_code(&body)? {
            AUTH_OK => {
                debug!("authentication successful");
                return Ok(());
            }
            AUTH_CLEARTEXT => {
                let pass = password.ok_or_else(|| anyhow!("password required"))?;
                let mut buf = BytesMut::new();
                frontend::password_message(pass.as_bytes(), &mut buf)?;
                stream.write_all(&buf).await?;
                stream.flush().await?;
            }
            AUTH_MD5 => {
                let pass = password.ok_or_else(|| anyhow!("password required"))?;
                let salt = body
                    .get(4..8)
                    .ok_or_else(|| anyhow!("md5 request is missing its salt"))?;
                let hash = md5_password(user, pass, salt);
                let mut buf = BytesMut::new();
                frontend::password_message(hash.as_bytes(), &mut buf)?;
                stream.write_all(&buf).await?;
                stream.flush().await?;
            }
            AUTH_SASL => {
                let pass = password.ok_or_else(|| anyhow!("password required"))?;
                let mechanisms = cstr_list(&body[4..]);
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    bail!("server offers no supported SASL mechanism (got {mechanisms:?})");
                }
                sasl_exchange(stream, user, pass).await?;
            }
            other => bail!("unsupported authentication request {other}"),
        }
    }
}

async fn sasl_exchange(
    stream: &mut BufReader<TcpStream>,
    user: &str,
    password: &str,
) -> Result<()> {
    let mut scram = ScramExchange::new(user, password);

    let mut buf = BytesMut::new();
    let first = scram.client_first_message();
    frontend::sasl_initial_response(SCRAM_SHA_256, first.as_bytes(), &mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let (code, body) = read_message(stream).await?;
    if code == b'E' {
        bail!("authentication failed: {}", error_message(&body));
    }
    if code != b'R' || auth_code(&body)? != AUTH_SASL_CONTINUE {
        bail!("expected SASL continuation, got {:?}", code as char);
    }
    let client_final = scram.client_final_message(&body[4..])?;

    let mut buf = BytesMut::new();
    frontend::sasl_response(client_final.as_bytes(), &mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let (code, body) = read_message(stream).await?;
    if code == b'E' {
        bail!("authentication failed: {}", error_message(&body));
    }
    if code != b'R' || auth_code(&body)? != AUTH_SASL_FINAL {
        bail!("expected SASL final message, got {:?}", code as char);
    }
    scram.verify_server_final(&body[4..])?;
    Ok(())
}

async fn read_message(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let code = stream.read_u8().await.context("reading message type")?;
    let len = stream.read_i32().await.context("reading message length")? as usize;
    if !(4..=MAX_MESSAGE_SIZE).contains(&len) {
        bail!("invalid message length {len}");
    }
    let mut body = vec![0u8; len - 4];
    stream
        .read_exact(&mut body)
        .await
        .context("reading message body")?;
    Ok((code, body))
}

fn auth_code(body: &[u8]) -> Result<i32> {
    let bytes = body
        .get(..4)
        .ok_or_else(|| anyhow!("authentication request is too short"))?;
    Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Pull the human-readable message field out of an ErrorResponse or
/// NoticeResponse body.
fn error_message(body: &[u8]) -> String {
    let mut i = 0;
    while i < body.len() {
        let field = body[i];
        if field == 0 {
            break;
        }
        i += 1;
        let end = match body[i..].iter().position(|&b| b == 0) {
            Some(offset) => i + offset,
            None => break,
        };
        if field == b'M' {
            return String::from_utf8_lossy(&body[i..end]).into_owned();
        }
        i = end + 1;
    }
    "unknown error".to_string()
}

fn cstr_list(body: &[u8]) -> Vec<String> {
    body.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password);
    hasher.update(user);
    let inner = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner);
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}

fn postgres_epoch_micros() -> i64 {
    let pg_epoch = std::time::SystemTime::UNIX_EPOCH
        + std::time::Duration::from_secs(POSTGRES_EPOCH_UNIX_SECS);
    std::time::SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
