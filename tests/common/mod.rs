//! In-process mock PostgreSQL backend for integration tests.
//!
//! Speaks enough of wire-protocol v3 to drive the proxy's real TCP path:
//! startup (trust auth), the extended-query exchange, the empty simple
//! query used as a liveness check, and Terminate. Responses are scripted
//! per SQL text, with configurable latency and failure injection.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use pg_http_proxy::config::{BackendOpts, SslMode};

const SSL_REQUEST_CODE: i32 = 80877103;

/// How the mock answers one extended-query exchange.
pub struct MockResponse {
    /// Simulated execution latency, applied before any response bytes.
    pub delay: Duration,
    pub kind: ResponseKind,
    /// Close the socket after completing this exchange (the connection
    /// then looks dead on its next use).
    pub close_after: bool,
}

impl MockResponse {
    pub fn rows(columns: &[(&str, u32)], rows: &[&[Option<&str>]]) -> Self {
        Self {
            delay: Duration::ZERO,
            kind: ResponseKind::Rows {
                columns: columns
                    .iter()
                    .map(|(n, t)| (n.to_string(), *t))
                    .collect(),
                rows: rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|field| field.map(|s| s.to_string()))
                            .collect()
                    })
                    .collect(),
                tag: format!("SELECT {}", rows.len()),
            },
            close_after: false,
        }
    }

    pub fn command(tag: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            kind: ResponseKind::Command {
                tag: tag.to_string(),
            },
            close_after: false,
        }
    }

    pub fn sql_error(code: &str, message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            kind: ResponseKind::SqlError {
                code: code.to_string(),
                message: message.to_string(),
            },
            close_after: false,
        }
    }

    pub fn disconnect() -> Self {
        Self {
            delay: Duration::ZERO,
            kind: ResponseKind::Disconnect,
            close_after: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_close_after(mut self) -> Self {
        self.close_after = true;
        self
    }
}

pub enum ResponseKind {
    /// RowDescription + DataRows + CommandComplete.
    Rows {
        columns: Vec<(String, u32)>,
        rows: Vec<Vec<Option<String>>>,
        tag: String,
    },
    /// NoData + CommandComplete (statement without a result set).
    Command { tag: String },
    /// ErrorResponse followed by ReadyForQuery; connection stays healthy.
    SqlError { code: String, message: String },
    /// Drop the socket mid-exchange without responding.
    Disconnect,
}

/// Scripted response selection by SQL text.
pub type Responder = Arc<dyn Fn(&str) -> MockResponse + Send + Sync>;

#[derive(Default)]
pub struct Stats {
    /// Connections accepted since spawn.
    pub connections: AtomicUsize,
    /// Queries currently between Sync and response completion.
    concurrent: AtomicUsize,
    /// High-water mark of `concurrent`.
    pub max_concurrent: AtomicUsize,
}

impl Stats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    fn enter_query(&self) {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
    }

    fn leave_query(&self) {
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockBackend {
    pub addr: std::net::SocketAddr,
    pub stats: Arc<Stats>,
}

impl MockBackend {
    /// Start a mock backend with the given responder script.
    pub async fn spawn(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::default());

        let accept_stats = Arc::clone(&stats);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                accept_stats.connections.fetch_add(1, Ordering::SeqCst);
                let responder = Arc::clone(&responder);
                let stats = Arc::clone(&accept_stats);
                tokio::spawn(async move {
                    let _ = serve_conn(socket, responder, stats).await;
                });
            }
        });

        Self { addr, stats }
    }

    /// Spawn a backend that answers every query the same way.
    pub async fn spawn_fixed(response: impl Fn() -> MockResponse + Send + Sync + 'static) -> Self {
        Self::spawn(Arc::new(move |_: &str| response())).await
    }

    /// Backend options pointing at this mock.
    pub fn opts(&self) -> BackendOpts {
        BackendOpts {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            user: "test".into(),
            database: Some("testdb".into()),
            ssl_mode: SslMode::Disable,
            ..BackendOpts::default()
        }
    }
}

async fn serve_conn(
    mut socket: TcpStream,
    responder: Responder,
    stats: Arc<Stats>,
) -> std::io::Result<()> {
    // Startup phase: untagged messages (SSLRequest gets refused).
    loop {
        let mut len_buf = [0u8; 4];
        socket.read_exact(&mut len_buf).await?;
        let len = i32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len - 4];
        socket.read_exact(&mut payload).await?;

        let code = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if code == SSL_REQUEST_CODE {
            socket.write_all(b"N").await?;
            continue;
        }
        break;
    }

    // Trust auth: AuthenticationOk, a ParameterStatus, BackendKeyData, ReadyForQuery.
    write_msg(&mut socket, b'R', &0_i32.to_be_bytes()).await?;
    write_msg(&mut socket, b'S', &param_status("server_version", "16.1")).await?;
    let mut key = 4242_u32.to_be_bytes().to_vec();
    key.extend_from_slice(&7_u32.to_be_bytes());
    write_msg(&mut socket, b'K', &key).await?;
    write_msg(&mut socket, b'Z', b"I").await?;

    let mut current_sql = String::new();
    loop {
        let (tag, payload) = read_msg(&mut socket).await?;
        match tag {
            b'P' => {
                // Parse: statement name, then SQL text.
                let rest = skip_cstr(&payload);
                current_sql = read_cstr_owned(rest);
            }
            b'B' | b'D' | b'E' | b'H' => {}
            b'Q' => {
                // Simple query: only the empty liveness check is scripted.
                write_msg(&mut socket, b'I', b"").await?;
                write_msg(&mut socket, b'Z', b"I").await?;
            }
            b'S' => {
                let response = responder(&current_sql);
                stats.enter_query();
                tokio::time::sleep(response.delay).await;
                stats.leave_query();

                match &response.kind {
                    ResponseKind::Rows { columns, rows, tag } => {
                        write_msg(&mut socket, b'1', b"").await?;
                        write_msg(&mut socket, b'2', b"").await?;
                        write_msg(&mut socket, b'T', &row_description(columns)).await?;
                        for row in rows {
                            write_msg(&mut socket, b'D', &data_row(row)).await?;
                        }
                        write_msg(&mut socket, b'C', &cstr(tag)).await?;
                        write_msg(&mut socket, b'Z', b"I").await?;
                    }
                    ResponseKind::Command { tag } => {
                        write_msg(&mut socket, b'1', b"").await?;
                        write_msg(&mut socket, b'2', b"").await?;
                        write_msg(&mut socket, b'n', b"").await?;
                        write_msg(&mut socket, b'C', &cstr(tag)).await?;
                        write_msg(&mut socket, b'Z', b"I").await?;
                    }
                    ResponseKind::SqlError { code, message } => {
                        write_msg(&mut socket, b'E', &error_fields(code, message)).await?;
                        write_msg(&mut socket, b'Z', b"I").await?;
                    }
                    ResponseKind::Disconnect => return Ok(()),
                }

                if response.close_after {
                    return Ok(());
                }
            }
            b'X' => return Ok(()),
            _ => {}
        }
    }
}

async fn read_msg(socket: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    socket.read_exact(&mut header).await?;
    let tag = header[0];
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len - 4];
    socket.read_exact(&mut payload).await?;
    Ok((tag, payload))
}

async fn write_msg(socket: &mut TcpStream, tag: u8, payload: &[u8]) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(payload.len() + 5);
    buf.push(tag);
    buf.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
    buf.extend_from_slice(payload);
    socket.write_all(&buf).await?;
    socket.flush().await
}

fn cstr(s: &str) -> Vec<u8> {
    let mut buf = s.as_bytes().to_vec();
    buf.push(0);
    buf
}

fn skip_cstr(data: &[u8]) -> &[u8] {
    match data.iter().position(|&b| b == 0) {
        Some(pos) => &data[pos + 1..],
        None => &[],
    }
}

fn read_cstr_owned(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn param_status(name: &str, value: &str) -> Vec<u8> {
    let mut buf = cstr(name);
    buf.extend_from_slice(&cstr(value));
    buf
}

fn row_description(columns: &[(String, u32)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(columns.len() as u16).to_be_bytes());
    for (name, type_oid) in columns {
        buf.extend_from_slice(&cstr(name));
        buf.extend_from_slice(&0_u32.to_be_bytes()); // table oid
        buf.extend_from_slice(&0_i16.to_be_bytes()); // column id
        buf.extend_from_slice(&type_oid.to_be_bytes());
        buf.extend_from_slice(&(-1_i16).to_be_bytes()); // type size
        buf.extend_from_slice(&(-1_i32).to_be_bytes()); // type modifier
        buf.extend_from_slice(&0_u16.to_be_bytes()); // format: text
    }
    buf
}

fn data_row(fields: &[Option<String>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(fields.len() as u16).to_be_bytes());
    for field in fields {
        match field {
            Some(value) => {
                buf.extend_from_slice(&(value.len() as i32).to_be_bytes());
                buf.extend_from_slice(value.as_bytes());
            }
            None => buf.extend_from_slice(&(-1_i32).to_be_bytes()),
        }
    }
    buf
}

fn error_fields(code: &str, message: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(b'S');
    buf.extend_from_slice(&cstr("ERROR"));
    buf.push(b'V');
    buf.extend_from_slice(&cstr("ERROR"));
    buf.push(b'C');
    buf.extend_from_slice(&cstr(code));
    buf.push(b'M');
    buf.extend_from_slice(&cstr(message));
    buf.push(0);
    buf
}
