//! Asynchronous backend connection: one authenticated socket, at most one
//! in-flight query.

mod stream;

pub use stream::Stream;

use std::time::Instant;

use tokio::net::TcpStream;

use crate::config::BackendOpts;
use crate::error::{Error, Result};
use crate::protocol::backend::msg_type;
use crate::protocol::frontend::{write_query, write_terminate};
use crate::protocol::types::TransactionStatus;
use crate::state::startup::SslDecision;
use crate::state::{Action, FrameBuf, QueryStateMachine, StartupAction, StartupStateMachine};
use crate::value::{QueryRequest, ResultSet};

/// One authenticated backend connection.
///
/// The wire protocol has no in-flight multiplexing, so a `Conn` is never
/// shared: the pool's lease is the sole access token, and one query fully
/// completes before the connection accepts another.
pub struct Conn {
    stream: Stream,
    frame: FrameBuf,
    backend_pid: u32,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    is_broken: bool,
    last_used: Instant,
}

impl Conn {
    /// Connect and run the startup handshake (SSL negotiation,
    /// authentication, parameter consumption) to ReadyForQuery.
    pub async fn open(opts: &BackendOpts) -> Result<Self> {
        if opts.host.is_empty() {
            return Err(Error::Config("backend host is empty".into()));
        }
        let addr = format!("{}:{}", opts.host, opts.port);
        let tcp = TcpStream::connect(&addr).await?;
        tcp.set_nodelay(true)?;
        let mut stream = Stream::tcp(tcp);

        let mut frame = FrameBuf::default();
        let mut sm = StartupStateMachine::new(opts.clone());

        match sm.start() {
            StartupAction::WriteAndReadByte => {
                stream.write_all(&sm.write_buffer).await?;
                let byte = stream.read_byte().await?;
                match sm.process_ssl_response(byte)? {
                    SslDecision::StartHandshake => {
                        stream = stream.upgrade_to_tls(&opts.host).await?;
                        sm.ssl_handshake_complete();
                    }
                    SslDecision::SendStartup => {}
                }
                stream.write_all(&sm.write_buffer).await?;
            }
            StartupAction::WriteAndReadMessage => {
                stream.write_all(&sm.write_buffer).await?;
            }
        }

        loop {
            stream.read_frame(&mut frame).await?;
            match sm.step(&frame)? {
                Action::ReadMessage => {}
                Action::WriteAndReadMessage => stream.write_all(&sm.write_buffer).await?,
                Action::Finished => break,
            }
        }

        Ok(Self {
            stream,
            frame,
            backend_pid: sm.backend_key().map_or(0, |k| k.process_id()),
            server_params: sm.take_server_params(),
            transaction_status: sm.transaction_status(),
            is_broken: false,
            last_used: Instant::now(),
        })
    }

    /// Backend process ID, for log correlation.
    pub fn backend_pid(&self) -> u32 {
        self.backend_pid
    }

    /// Server parameters reported during startup.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Transaction status from the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// True once the connection hit a timeout, network, or protocol
    /// failure. A broken connection must never return to the pool.
    pub fn is_broken(&self) -> bool {
        self.is_broken
    }

    /// Time since this connection last finished an operation.
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used.elapsed()
    }

    /// Execute one parameterized query, accumulating the full result set.
    ///
    /// `deadline` bounds the whole exchange. On timeout the connection is
    /// marked broken: there is no safe mid-query resynchronization, so the
    /// pool discards it rather than guess at the stream position.
    pub async fn execute(
        &mut self,
        request: &QueryRequest,
        deadline: Instant,
    ) -> Result<ResultSet> {
        let result = match tokio::time::timeout_at(deadline.into(), self.execute_inner(request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::QueryTimeout),
        };

        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        self.last_used = Instant::now();
        result
    }

    async fn execute_inner(&mut self, request: &QueryRequest) -> Result<ResultSet> {
        let mut sm = QueryStateMachine::new(request);
        let mut action = sm.start();

        loop {
            match action {
                Action::WriteAndReadMessage => {
                    self.stream.write_all(&sm.write_buffer).await?;
                }
                Action::ReadMessage => {}
                Action::Finished => break,
            }
            self.stream.read_frame(&mut self.frame).await?;
            action = sm.step(&self.frame)?;
        }

        self.transaction_status = sm.transaction_status();
        sm.into_result()
    }

    /// Lightweight liveness check: an empty simple query round-trip.
    pub async fn ping(&mut self, deadline: Instant) -> Result<()> {
        let result = match tokio::time::timeout_at(deadline.into(), self.ping_inner()).await {
            Ok(result) => result,
            Err(_) => Err(Error::QueryTimeout),
        };

        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        self.last_used = Instant::now();
        result
    }

    async fn ping_inner(&mut self) -> Result<()> {
        let mut buf = Vec::with_capacity(8);
        write_query(&mut buf, "");
        self.stream.write_all(&buf).await?;

        loop {
            self.stream.read_frame(&mut self.frame).await?;
            match self.frame.type_byte {
                msg_type::READY_FOR_QUERY => return Ok(()),
                msg_type::EMPTY_QUERY_RESPONSE
                | msg_type::NOTICE_RESPONSE
                | msg_type::PARAMETER_STATUS
                | msg_type::NOTIFICATION_RESPONSE => {}
                msg_type::ERROR_RESPONSE => {
                    // Keep draining; ReadyForQuery still follows.
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during ping: '{}'",
                        other as char
                    )));
                }
            }
        }
    }

    /// Close the connection gracefully with a Terminate message.
    pub async fn close(mut self) -> Result<()> {
        let mut buf = Vec::with_capacity(8);
        write_terminate(&mut buf);
        self.stream.write_all(&buf).await?;
        Ok(())
    }
}
