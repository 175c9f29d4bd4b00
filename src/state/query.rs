//! Extended query protocol state machine.
//!
//! Runs one Parse → Bind → Describe → Execute → Sync exchange over the
//! unnamed statement and portal, accumulating the result set. A clean
//! ErrorResponse does not abort the machine: the server skips to the Sync
//! response, so the machine keeps consuming messages until ReadyForQuery
//! and only then surfaces the error. That drain is what lets the owning
//! connection return to the pool in a known state.

use crate::error::{Error, Result};
use crate::protocol::backend::{
    CommandComplete, DataRow, ErrorResponse, ReadyForQuery, RowDescription, is_async_type, msg_type,
};
use crate::protocol::frontend::{
    write_bind, write_describe_portal, write_execute, write_parse, write_sync,
};
use crate::protocol::types::TransactionStatus;
use crate::value::{Column, QueryRequest, ResultSet};

use super::{Action, FrameBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    WaitingParse,
    WaitingBind,
    WaitingRowDesc,
    ProcessingRows,
    WaitingReady,
    Finished,
}

/// Extended query protocol state machine.
pub struct QueryStateMachine {
    state: State,
    result: ResultSet,
    error: Option<Error>,
    transaction_status: TransactionStatus,
    /// Bytes the driver must write before its next read.
    pub write_buffer: Vec<u8>,
}

impl QueryStateMachine {
    /// Create a state machine for one query request.
    pub fn new(request: &QueryRequest) -> Self {
        let mut write_buffer = Vec::with_capacity(request.sql.len() + 128);
        write_parse(&mut write_buffer, "", &request.sql);
        write_bind(&mut write_buffer, "", "", &request.params);
        write_describe_portal(&mut write_buffer, "");
        write_execute(&mut write_buffer, "", 0);
        write_sync(&mut write_buffer);

        Self {
            state: State::Initial,
            result: ResultSet::default(),
            error: None,
            transaction_status: TransactionStatus::Idle,
            write_buffer,
        }
    }

    /// Begin the exchange: the driver writes `write_buffer` and reads.
    pub fn start(&mut self) -> Action {
        self.state = State::WaitingParse;
        Action::WriteAndReadMessage
    }

    /// Get the transaction status from the final ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Consume the machine after `Action::Finished`.
    pub fn into_result(self) -> Result<ResultSet> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }

    /// Process a message from the server.
    pub fn step(&mut self, frame: &FrameBuf) -> Result<Action> {
        let type_byte = frame.type_byte;

        // Notices / parameter updates may interleave anywhere.
        if is_async_type(type_byte) {
            if type_byte == msg_type::NOTICE_RESPONSE {
                let notice = crate::protocol::backend::NoticeResponse::parse(&frame.payload)?;
                tracing::debug!(notice = %notice.fields, "backend notice");
            }
            return Ok(Action::ReadMessage);
        }

        // A clean backend error: remember it, then drain to ReadyForQuery.
        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(&frame.payload)?;
            if self.error.is_none() {
                self.error = Some(error.into_error());
            }
            self.state = State::WaitingReady;
            return Ok(Action::ReadMessage);
        }

        match self.state {
            State::WaitingParse => self.expect(type_byte, msg_type::PARSE_COMPLETE, State::WaitingBind),
            State::WaitingBind => self.expect(type_byte, msg_type::BIND_COMPLETE, State::WaitingRowDesc),
            State::WaitingRowDesc => self.handle_row_desc(frame),
            State::ProcessingRows => self.handle_rows(frame),
            State::WaitingReady => self.handle_ready(frame),
            _ => Err(Error::Protocol(format!(
                "unexpected message '{}' in state {:?}",
                type_byte as char, self.state
            ))),
        }
    }

    fn expect(&mut self, got: u8, want: u8, next: State) -> Result<Action> {
        if got != want {
            return Err(Error::Protocol(format!(
                "expected '{}', got '{}'",
                want as char, got as char
            )));
        }
        self.state = next;
        Ok(Action::ReadMessage)
    }

    fn handle_row_desc(&mut self, frame: &FrameBuf) -> Result<Action> {
        match frame.type_byte {
            msg_type::ROW_DESCRIPTION => {
                let desc = RowDescription::parse(&frame.payload)?;
                self.result.columns = desc
                    .fields()
                    .iter()
                    .map(|f| Column {
                        name: f.name.to_string(),
                        type_oid: f.type_oid(),
                    })
                    .collect();
                self.state = State::ProcessingRows;
                Ok(Action::ReadMessage)
            }
            msg_type::NO_DATA => {
                // Statement returns no rows (e.g., INSERT without RETURNING)
                self.state = State::ProcessingRows;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "expected RowDescription or NoData, got '{}'",
                other as char
            ))),
        }
    }

    fn handle_rows(&mut self, frame: &FrameBuf) -> Result<Action> {
        match frame.type_byte {
            msg_type::DATA_ROW => {
                let row = DataRow::parse(&frame.payload)?;
                if row.len() != self.result.columns.len() {
                    return Err(Error::Protocol(format!(
                        "DataRow has {} fields, RowDescription declared {}",
                        row.len(),
                        self.result.columns.len()
                    )));
                }
                self.result
                    .rows
                    .push(row.iter().map(|v| v.map(|b| b.to_vec())).collect());
                Ok(Action::ReadMessage)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(&frame.payload)?;
                self.result.rows_affected = complete.rows_affected();
                self.state = State::WaitingReady;
                Ok(Action::ReadMessage)
            }
            msg_type::EMPTY_QUERY_RESPONSE | msg_type::PORTAL_SUSPENDED => {
                self.state = State::WaitingReady;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "unexpected message in row stream: '{}'",
                other as char
            ))),
        }
    }

    fn handle_ready(&mut self, frame: &FrameBuf) -> Result<Action> {
        if frame.type_byte != msg_type::READY_FOR_QUERY {
            // Between an error and Sync the server may still emit leftovers
            // of the aborted sequence; skip them.
            if self.error.is_some() {
                return Ok(Action::ReadMessage);
            }
            return Err(Error::Protocol(format!(
                "expected ReadyForQuery, got '{}'",
                frame.type_byte as char
            )));
        }

        let ready = ReadyForQuery::parse(&frame.payload)?;
        self.transaction_status = ready.transaction_status().unwrap_or_default();
        self.state = State::Finished;
        Ok(Action::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::QueryRequest;
    use serde_json::json;

    fn frame(type_byte: u8, payload: Vec<u8>) -> FrameBuf {
        FrameBuf { type_byte, payload }
    }

    fn row_description(cols: &[(&str, u32)]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(cols.len() as u16).to_be_bytes());
        for (name, type_oid) in cols {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&0_u32.to_be_bytes()); // table oid
            payload.extend_from_slice(&0_i16.to_be_bytes()); // column id
            payload.extend_from_slice(&type_oid.to_be_bytes());
            payload.extend_from_slice(&(-1_i16).to_be_bytes()); // type size
            payload.extend_from_slice(&(-1_i32).to_be_bytes()); // type modifier
            payload.extend_from_slice(&0_u16.to_be_bytes()); // format: text
        }
        payload
    }

    fn data_row(fields: &[Option<&[u8]>]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for field in fields {
            match field {
                Some(bytes) => {
                    payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    payload.extend_from_slice(bytes);
                }
                None => payload.extend_from_slice(&(-1_i32).to_be_bytes()),
            }
        }
        payload
    }

    fn request() -> QueryRequest {
        QueryRequest::new(
            "SELECT $1::text AS v, $2::int AS n, $3::text AS z".into(),
            &[json!("a"), json!(1), serde_json::Value::Null],
            None,
        )
        .unwrap()
    }

    #[test]
    fn successful_exchange_builds_result_set() {
        let mut sm = QueryStateMachine::new(&request());
        assert_eq!(sm.start(), Action::WriteAndReadMessage);

        assert_eq!(sm.step(&frame(b'1', vec![])).unwrap(), Action::ReadMessage);
        assert_eq!(sm.step(&frame(b'2', vec![])).unwrap(), Action::ReadMessage);
        assert_eq!(
            sm.step(&frame(
                b'T',
                row_description(&[("v", 25), ("n", 23), ("z", 25)])
            ))
            .unwrap(),
            Action::ReadMessage
        );
        assert_eq!(
            sm.step(&frame(
                b'D',
                data_row(&[Some(b"a"), Some(b"1"), None])
            ))
            .unwrap(),
            Action::ReadMessage
        );
        assert_eq!(
            sm.step(&frame(b'C', b"SELECT 1\0".to_vec())).unwrap(),
            Action::ReadMessage
        );
        assert_eq!(sm.step(&frame(b'Z', vec![b'I'])).unwrap(), Action::Finished);

        let result = sm.into_result().unwrap();
        assert_eq!(result.columns.len(), 3);
        assert_eq!(result.columns[0].name, "v");
        assert_eq!(result.rows_affected, Some(1));
        assert_eq!(result.rows, vec![vec![
            Some(b"a".to_vec()),
            Some(b"1".to_vec()),
            None
        ]]);
    }

    #[test]
    fn error_response_drains_to_ready() {
        let mut sm = QueryStateMachine::new(&request());
        sm.start();

        let mut payload = Vec::new();
        payload.push(b'S');
        payload.extend_from_slice(b"ERROR\0");
        payload.push(b'C');
        payload.extend_from_slice(b"23505\0");
        payload.push(b'M');
        payload.extend_from_slice(b"duplicate key\0");
        payload.push(0);

        // Error arrives instead of ParseComplete; machine keeps reading.
        assert_eq!(sm.step(&frame(b'E', payload)).unwrap(), Action::ReadMessage);
        assert_eq!(sm.step(&frame(b'Z', vec![b'I'])).unwrap(), Action::Finished);

        let err = sm.into_result().unwrap_err();
        assert_eq!(err.sqlstate(), Some("23505"));
        assert!(!err.is_connection_broken());
    }

    #[test]
    fn phase_violation_is_protocol_error() {
        let mut sm = QueryStateMachine::new(&request());
        sm.start();

        // DataRow before ParseComplete is not valid for this phase
        let err = sm
            .step(&frame(b'D', data_row(&[Some(b"a")])))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn mismatched_row_width_is_protocol_error() {
        let mut sm = QueryStateMachine::new(&request());
        sm.start();
        sm.step(&frame(b'1', vec![])).unwrap();
        sm.step(&frame(b'2', vec![])).unwrap();
        sm.step(&frame(b'T', row_description(&[("v", 25)]))).unwrap();

        let err = sm
            .step(&frame(b'D', data_row(&[Some(b"a"), Some(b"b")])))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
