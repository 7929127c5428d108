//! Protocol vocabulary shared by requests, responses, and system events.
//!
//! Routing on the wire uses single-byte codes: each frame carries an
//! operation code selecting a handler and a command code the handler
//! interprets itself. Payload maps are keyed by small unsigned integers
//! whose meaning is application-defined per operation/command pair.

use std::collections::HashMap;

use serde_json::Value;

/// Selects the [`Operation`](crate::operation::Operation) a request routes to.
pub type OpCode = u8;

/// Sub-command within an operation; opaque to the dispatcher.
pub type CmdCode = u8;

/// Key into a [`Payload`] map.
pub type DataCode = u16;

/// Identifies a registered [`Subsystem`](crate::subsystem::Subsystem).
pub type SystemCode = u8;

/// Identifies a [`SystemEvent`](crate::subsystem::SystemEvent) kind.
pub type EventCode = u8;

/// JSON payload carried by frames and system events.
///
/// Order is irrelevant; on the wire the integer keys are encoded as JSON
/// object keys (`{"0": "123", "1": 321}`).
pub type Payload = HashMap<DataCode, Value>;
