//! Decoded request envelope bound for dispatch.
//!
//! A [`Request`] is created by the codec when a frame decodes successfully
//! and consumed exactly once by the dispatcher. It carries the two routing
//! codes, the keyed payload map, and a weak back-reference to the session it
//! arrived on — weak so that an in-flight request never keeps a closed
//! connection alive.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::{
    message::{CmdCode, DataCode, OpCode, Payload},
    session::{SendError, Session},
};

/// Errors raised by request payload access and reply helpers.
#[derive(Debug, Error)]
pub enum RequestError {
    /// `set_all` was handed an empty replacement map.
    #[error("request data empty")]
    EmptyData,
    /// The request was never bound to a session (for example, in tests).
    #[error("request client not set")]
    NoClient,
    /// The originating session has already been torn down.
    #[error("request client no longer connected")]
    ClientGone,
    /// The reply could not be written to the socket.
    #[error(transparent)]
    Send(#[from] SendError),
}

/// One decoded frame, addressed by operation and command code.
#[derive(Debug)]
pub struct Request {
    /// Unix-millisecond timestamp doubling as the per-process identifier.
    uid: i64,
    op_code: OpCode,
    cmd_code: CmdCode,
    data: Payload,
    client: Option<Weak<Session>>,
}

impl Request {
    /// Create a request stamped with the current time and an empty payload.
    #[must_use]
    pub fn new(op_code: OpCode, cmd_code: CmdCode) -> Self {
        Self {
            uid: Utc::now().timestamp_millis(),
            op_code,
            cmd_code,
            data: Payload::new(),
            client: None,
        }
    }

    /// Rebuild a request from decoded wire fields.
    pub(crate) fn from_wire(uid: i64, op_code: OpCode, cmd_code: CmdCode, data: Payload) -> Self {
        Self {
            uid,
            op_code,
            cmd_code,
            data,
            client: None,
        }
    }

    /// The sender-stamped identifier (unix milliseconds).
    #[must_use]
    pub fn uid(&self) -> i64 { self.uid }

    /// The identifier interpreted as the request's creation time.
    #[must_use]
    pub fn request_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.uid).unwrap_or_default()
    }

    /// Operation code used for dispatch.
    #[must_use]
    pub fn op_code(&self) -> OpCode { self.op_code }

    /// Command code interpreted by the handler.
    #[must_use]
    pub fn cmd_code(&self) -> CmdCode { self.cmd_code }

    /// Whether a value exists under `code`.
    #[must_use]
    pub fn contains(&self, code: DataCode) -> bool { self.data.contains_key(&code) }

    /// Value stored under `code`, if any.
    #[must_use]
    pub fn get(&self, code: DataCode) -> Option<&Value> { self.data.get(&code) }

    /// String value stored under `code`, if it is one.
    #[must_use]
    pub fn get_str(&self, code: DataCode) -> Option<&str> {
        self.get(code).and_then(Value::as_str)
    }

    /// Integer value stored under `code`, if it is one.
    #[must_use]
    pub fn get_i64(&self, code: DataCode) -> Option<i64> {
        self.get(code).and_then(Value::as_i64)
    }

    /// Store `value` under `code`, replacing any existing entry.
    pub fn set(&mut self, code: DataCode, value: impl Into<Value>) {
        self.data.insert(code, value.into());
    }

    /// Replace the whole payload map.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::EmptyData`] when handed an empty map, which
    /// almost always indicates a caller bug.
    pub fn set_all(&mut self, data: Payload) -> Result<(), RequestError> {
        if data.is_empty() {
            return Err(RequestError::EmptyData);
        }
        self.data = data;
        Ok(())
    }

    /// Borrow the full payload map.
    #[must_use]
    pub fn data(&self) -> &Payload { &self.data }

    /// Bind this request to the session it arrived on.
    pub(crate) fn bind_client(&mut self, client: &Arc<Session>) {
        self.client = Some(Arc::downgrade(client));
    }

    /// The originating session.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::NoClient`] when the request was never bound
    /// and [`RequestError::ClientGone`] when the session has been dropped.
    pub fn client(&self) -> Result<Arc<Session>, RequestError> {
        self.client
            .as_ref()
            .ok_or(RequestError::NoClient)?
            .upgrade()
            .ok_or(RequestError::ClientGone)
    }

    /// Reply to this request: same routing codes, same timestamp.
    ///
    /// # Errors
    ///
    /// Fails when the request has no live session or the write fails.
    pub async fn respond(&self, payload: &Payload) -> Result<(), RequestError> {
        self.send(self.request_time(), self.op_code, self.cmd_code, payload)
            .await
    }

    /// Send an arbitrary frame back over the originating session.
    ///
    /// # Errors
    ///
    /// Fails when the request has no live session or the write fails.
    pub async fn send(
        &self,
        send_time: DateTime<Utc>,
        op_code: OpCode,
        cmd_code: CmdCode,
        payload: &Payload,
    ) -> Result<(), RequestError> {
        let client = self.client()?;
        client.send(send_time, op_code, cmd_code, payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn payload_accessors() {
        let mut request = Request::new(2, 98);
        request.set(0, "123");
        request.set(1, 321);

        assert!(request.contains(0));
        assert!(!request.contains(9));
        assert_eq!(request.get_str(0), Some("123"));
        assert_eq!(request.get_i64(1), Some(321));
        assert_eq!(request.get(2), None);
    }

    #[test]
    fn set_all_rejects_an_empty_map() {
        let mut request = Request::new(1, 1);
        let err = request.set_all(Payload::new()).expect_err("must fail");
        assert!(matches!(err, RequestError::EmptyData));

        request
            .set_all(Payload::from([(0, json!(true))]))
            .expect("non-empty map accepted");
        assert_eq!(request.get(0), Some(&json!(true)));
    }

    #[tokio::test]
    async fn unbound_request_rejects_replies() {
        let request = Request::new(1, 1);
        assert!(matches!(request.client(), Err(RequestError::NoClient)));

        let err = request
            .respond(&Payload::new())
            .await
            .expect_err("no client");
        assert!(matches!(err, RequestError::NoClient));
    }

    #[test]
    fn request_time_mirrors_uid() {
        let request = Request::new(0, 0);
        assert_eq!(request.request_time().timestamp_millis(), request.uid());
    }
}
