//! Connection startup and authentication state machine.

use crate::config::{BackendOpts, SslMode};
use crate::error::{Error, Result};
use crate::protocol::auth::{ScramClient, md5_password};
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, ReadyForQuery, is_async_type, msg_type,
};
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_ssl_request,
    write_startup,
};
use crate::protocol::types::TransactionStatus;

use super::{Action, FrameBuf};

/// Connection state during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupState {
    Initial,
    WaitingSslResponse,
    SslHandshake,
    WaitingAuth,
    SaslInProgress,
    WaitingAuthResult,
    WaitingReady,
    Ready,
    Failed,
}

/// First action of the startup sequence, which differs from the steady
/// state: SSL negotiation reads a single raw byte, not a framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupAction {
    /// Write `write_buffer`, then read exactly one byte ('S' or 'N') and
    /// call `process_ssl_response`.
    WriteAndReadByte,
    /// Write `write_buffer`, then read messages and call `step`.
    WriteAndReadMessage,
}

/// What to do after the SSL response byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslDecision {
    /// Perform the TLS handshake, then call `ssl_handshake_complete`.
    StartHandshake,
    /// Server declined SSL; `write_buffer` now holds the startup message.
    SendStartup,
}

/// Connection startup state machine.
pub struct StartupStateMachine {
    state: StartupState,
    opts: BackendOpts,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    scram_client: Option<ScramClient>,
    /// Bytes the driver must write before its next read.
    pub write_buffer: Vec<u8>,
}

impl StartupStateMachine {
    /// Create a new startup state machine.
    pub fn new(opts: BackendOpts) -> Self {
        Self {
            state: StartupState::Initial,
            opts,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            scram_client: None,
            write_buffer: Vec::new(),
        }
    }

    /// Get the current startup state.
    pub fn state(&self) -> StartupState {
        self.state
    }

    /// Take accumulated server parameters.
    pub fn take_server_params(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.server_params)
    }

    /// Get the backend key data (for diagnostics).
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    /// Get the transaction status reported by the final ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Begin the startup sequence.
    pub fn start(&mut self) -> StartupAction {
        self.write_buffer.clear();

        match self.opts.ssl_mode {
            SslMode::Disable => {
                self.write_startup_message();
                self.state = StartupState::WaitingAuth;
                StartupAction::WriteAndReadMessage
            }
            SslMode::Prefer | SslMode::Require => {
                write_ssl_request(&mut self.write_buffer);
                self.state = StartupState::WaitingSslResponse;
                StartupAction::WriteAndReadByte
            }
        }
    }

    /// Process the SSL response byte ('S' or 'N').
    pub fn process_ssl_response(&mut self, response: u8) -> Result<SslDecision> {
        if self.state != StartupState::WaitingSslResponse {
            return Err(Error::Protocol("unexpected SSL response".into()));
        }
        match response {
            b'S' => {
                self.state = StartupState::SslHandshake;
                Ok(SslDecision::StartHandshake)
            }
            b'N' => {
                if self.opts.ssl_mode == SslMode::Require {
                    self.state = StartupState::Failed;
                    return Err(Error::Auth(
                        "SSL required but not supported by server".into(),
                    ));
                }

                self.write_buffer.clear();
                self.write_startup_message();
                self.state = StartupState::WaitingAuth;
                Ok(SslDecision::SendStartup)
            }
            other => {
                self.state = StartupState::Failed;
                Err(Error::Protocol(format!(
                    "unexpected SSL response byte: {}",
                    other
                )))
            }
        }
    }

    /// Called after the TLS handshake completes; `write_buffer` then holds
    /// the startup message.
    pub fn ssl_handshake_complete(&mut self) {
        self.write_buffer.clear();
        self.write_startup_message();
        self.state = StartupState::WaitingAuth;
    }

    /// Process a message from the server.
    pub fn step(&mut self, frame: &FrameBuf) -> Result<Action> {
        let type_byte = frame.type_byte;

        // Notices and parameter updates can arrive at any time; during
        // startup they carry nothing the proxy needs beyond the cache.
        if is_async_type(type_byte) {
            if type_byte == msg_type::PARAMETER_STATUS {
                self.record_parameter_status(&frame.payload)?;
            }
            return Ok(Action::ReadMessage);
        }

        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(&frame.payload)?;
            self.state = StartupState::Failed;
            // Class 28 is invalid authorization; everything else surfaces
            // with the server's own fields.
            let invalid_authorization = error
                .fields
                .code
                .as_deref()
                .is_some_and(|code| code.starts_with("28"));
            return Err(if invalid_authorization {
                Error::Auth(error.fields.message.clone().unwrap_or_default())
            } else {
                error.into_error()
            });
        }

        match self.state {
            StartupState::WaitingAuth => self.handle_auth_message(frame),
            StartupState::SaslInProgress => self.handle_sasl_message(frame),
            StartupState::WaitingAuthResult => self.handle_auth_result(frame),
            StartupState::WaitingReady => self.handle_ready_message(frame),
            _ => Err(Error::Protocol(format!(
                "unexpected message '{}' in startup state {:?}",
                type_byte as char, self.state
            ))),
        }
    }

    fn write_startup_message(&mut self) {
        let mut params: Vec<(&str, &str)> =
            vec![("user", &self.opts.user), ("client_encoding", "UTF8")];

        if let Some(ref db) = self.opts.database {
            params.push(("database", db));
        }

        if let Some(ref app) = self.opts.application_name {
            params.push(("application_name", app));
        }

        for (name, value) in &self.opts.params {
            params.push((name, value));
        }

        write_startup(&mut self.write_buffer, &params);
    }

    fn require_password(&self) -> Result<&str> {
        self.opts
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("password required but not configured".into()))
    }

    fn handle_auth_message(&mut self, frame: &FrameBuf) -> Result<Action> {
        if frame.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected Authentication message, got '{}'",
                frame.type_byte as char
            )));
        }

        let auth = AuthenticationMessage::parse(&frame.payload)?;

        match auth {
            AuthenticationMessage::Ok => {
                self.state = StartupState::WaitingReady;
                Ok(Action::ReadMessage)
            }
            AuthenticationMessage::CleartextPassword => {
                let password = self.require_password()?.to_string();
                self.write_buffer.clear();
                write_password(&mut self.write_buffer, &password);
                self.state = StartupState::WaitingAuthResult;
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::Md5Password { salt } => {
                let password = self.require_password()?;
                let hashed = md5_password(&self.opts.user, password, &salt);
                self.write_buffer.clear();
                write_password(&mut self.write_buffer, &hashed);
                self.state = StartupState::WaitingAuthResult;
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::Sasl { mechanisms } => {
                if !mechanisms.iter().any(|m| *m == "SCRAM-SHA-256") {
                    return Err(Error::Auth(format!(
                        "no supported SASL mechanism, server offers: {:?}",
                        mechanisms
                    )));
                }

                let password = self.require_password()?;
                let scram = ScramClient::new(password);
                let client_first = scram.client_first_message();

                self.write_buffer.clear();
                write_sasl_initial_response(
                    &mut self.write_buffer,
                    "SCRAM-SHA-256",
                    client_first.as_bytes(),
                );

                self.scram_client = Some(scram);
                self.state = StartupState::SaslInProgress;
                Ok(Action::WriteAndReadMessage)
            }
            other => Err(Error::Auth(format!(
                "unsupported authentication method: {:?}",
                other
            ))),
        }
    }

    fn handle_sasl_message(&mut self, frame: &FrameBuf) -> Result<Action> {
        if frame.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected Authentication message, got '{}'",
                frame.type_byte as char
            )));
        }

        let auth = AuthenticationMessage::parse(&frame.payload)?;

        match auth {
            AuthenticationMessage::SaslContinue { data } => {
                let scram = self
                    .scram_client
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;

                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("invalid server-first-message: {}", e)))?;

                let client_final = scram
                    .process_server_first(server_first)
                    .map_err(Error::Auth)?;

                self.write_buffer.clear();
                write_sasl_response(&mut self.write_buffer, client_final.as_bytes());
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::SaslFinal { data } => {
                let scram = self
                    .scram_client
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;

                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("invalid server-final-message: {}", e)))?;

                scram.verify_server_final(server_final).map_err(Error::Auth)?;

                self.state = StartupState::WaitingAuthResult;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "unexpected SASL message: {:?}",
                other
            ))),
        }
    }

    fn handle_auth_result(&mut self, frame: &FrameBuf) -> Result<Action> {
        if frame.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected AuthenticationOk, got '{}'",
                frame.type_byte as char
            )));
        }

        let auth = AuthenticationMessage::parse(&frame.payload)?;

        match auth {
            AuthenticationMessage::Ok => {
                self.state = StartupState::WaitingReady;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Auth(format!("unexpected auth result: {:?}", other))),
        }
    }

    fn handle_ready_message(&mut self, frame: &FrameBuf) -> Result<Action> {
        match frame.type_byte {
            msg_type::BACKEND_KEY_DATA => {
                let key = BackendKeyData::parse(&frame.payload)?;
                self.backend_key = Some(*key);
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(&frame.payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = StartupState::Ready;
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "unexpected message during startup: '{}'",
                other as char
            ))),
        }
    }

    fn record_parameter_status(&mut self, payload: &[u8]) -> Result<()> {
        let param = crate::protocol::backend::ParameterStatus::parse(payload)?;
        if let Some(entry) = self.server_params.iter_mut().find(|(n, _)| n == param.name) {
            entry.1 = param.value.to_string();
        } else {
            self.server_params
                .push((param.name.to_string(), param.value.to_string()));
        }
        Ok(())
    }
}
