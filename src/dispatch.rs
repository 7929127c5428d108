//! Request routing with execution budgets and failure isolation.
//!
//! The [`Dispatcher`] owns the operation registry. Dispatching a request
//! looks up the handler by operation code and runs it on its own task,
//! bounded by a wall-clock budget. The budget is a soft deadline: when it
//! expires the dispatcher stops waiting and logs, but the handler task
//! keeps running — cooperative cancellation is a contract on handler
//! authors, not something the dispatcher enforces. Panics inside handlers
//! are contained at the join boundary and logged; they never take the
//! server down.

use std::{any::Any, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use log::{error, warn};
use thiserror::Error;
use tokio::time::timeout;

use crate::{
    message::OpCode, operation::Operation, request::Request, server::Server,
    session::Session, subsystem::SystemEvent,
};

/// Errors raised while registering an operation.
#[derive(Debug, Error)]
pub enum RegisterError {
    /// The operation code is already bound; the first registration wins.
    #[error("operation code {0} already registered; keeping the first")]
    Duplicate(OpCode),
    /// The operation's init hook failed; nothing was registered.
    #[error("operation init failed: {0}")]
    Init(#[source] anyhow::Error),
}

/// Registry of operation code → handler, with budgeted execution.
pub struct Dispatcher {
    operations: DashMap<OpCode, Arc<dyn Operation>>,
    budget: Duration,
}

impl Dispatcher {
    /// Create a dispatcher enforcing `budget` per handler run.
    #[must_use]
    pub fn new(budget: Duration) -> Self {
        Self {
            operations: DashMap::new(),
            budget,
        }
    }

    /// Execution budget applied to each dispatched handler.
    #[must_use]
    pub fn budget(&self) -> Duration { self.budget }

    /// Register `operation` under its code and run its init hook.
    ///
    /// Duplicate codes are rejected: the first registration is kept and a
    /// warning is logged, so registration order is deterministic.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::Duplicate`] for an already-bound code and
    /// [`RegisterError::Init`] when the init hook fails.
    pub async fn register(
        &self,
        operation: Arc<dyn Operation>,
        server: &Arc<Server>,
    ) -> Result<(), RegisterError> {
        let code = operation.op_code();
        if self.operations.contains_key(&code) {
            warn!("operation code {code} already registered; keeping the first");
            return Err(RegisterError::Duplicate(code));
        }
        operation
            .on_init(Arc::clone(server))
            .await
            .map_err(RegisterError::Init)?;
        match self.operations.entry(code) {
            Entry::Occupied(_) => {
                warn!("operation code {code} already registered; keeping the first");
                Err(RegisterError::Duplicate(code))
            }
            Entry::Vacant(slot) => {
                slot.insert(operation);
                Ok(())
            }
        }
    }

    /// Handler bound to `code`, if any.
    #[must_use]
    pub fn operation(&self, code: OpCode) -> Option<Arc<dyn Operation>> {
        self.operations.get(&code).map(|entry| Arc::clone(&entry))
    }

    /// Route one request to its handler.
    ///
    /// Unrouted requests are logged at warn level and dropped; they are not
    /// an error. The handler runs on its own task so the caller (the
    /// session read loop) regains control after at most the budget.
    pub async fn dispatch(&self, request: Request) {
        let op_code = request.op_code();
        let cmd_code = request.cmd_code();
        let Some(operation) = self.operation(op_code) else {
            warn!("no operation registered for op code {op_code}; dropping request");
            return;
        };

        let task = tokio::spawn(async move { operation.command(request).await });
        match timeout(self.budget, task).await {
            Err(_) => warn!(
                "operation {op_code} cmd {cmd_code} exceeded its {:?} budget; handler abandoned",
                self.budget,
            ),
            Ok(Err(join_err)) if join_err.is_panic() => error!(
                "recovered panic in operation {op_code} cmd {cmd_code}: {}",
                describe_panic(join_err.into_panic()),
            ),
            Ok(Err(join_err)) => {
                error!("operation {op_code} cmd {cmd_code} task failed: {join_err}");
            }
            Ok(Ok(Err(err))) => {
                error!("operation {op_code} cmd {cmd_code} failed: {err:#}");
            }
            Ok(Ok(Ok(()))) => {}
        }
    }

    fn snapshot(&self) -> Vec<(OpCode, Arc<dyn Operation>)> {
        self.operations
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    /// Fan `on_server_start` out to every registered operation.
    pub(crate) async fn notify_server_start(&self) {
        for (code, operation) in self.snapshot() {
            if let Err(err) = operation.on_server_start().await {
                error!("operation {code} failed on server start: {err:#}");
            }
        }
    }

    /// Fan `on_server_close` out to every registered operation.
    pub(crate) async fn notify_server_close(&self) {
        for (code, operation) in self.snapshot() {
            if let Err(err) = operation.on_server_close().await {
                error!("operation {code} failed on server close: {err:#}");
            }
        }
    }

    /// Fan `on_client_connect` out to every registered operation.
    pub(crate) async fn notify_client_connect(&self, session: &Arc<Session>) {
        for (code, operation) in self.snapshot() {
            if let Err(err) = operation.on_client_connect(session).await {
                error!(
                    "operation {code} failed on connect of session {}: {err:#}",
                    session.id(),
                );
            }
        }
    }

    /// Fan `on_client_disconnect` out to every registered operation.
    pub(crate) async fn notify_client_disconnect(&self, session: &Arc<Session>) {
        for (code, operation) in self.snapshot() {
            if let Err(err) = operation.on_client_disconnect(session).await {
                error!(
                    "operation {code} failed on disconnect of session {}: {err:#}",
                    session.id(),
                );
            }
        }
    }

    /// Fan a system event out to every registered operation.
    pub(crate) async fn notify_event(&self, session: &Arc<Session>, event: &SystemEvent) {
        for (code, operation) in self.snapshot() {
            if let Err(err) = operation.on_event_notify(session, event).await {
                error!(
                    "operation {code} failed on event {}: {err:#}",
                    event.event_code(),
                );
            }
        }
    }
}

/// Render a recovered panic payload for the log line.
fn describe_panic(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_str_and_string_payloads() {
        assert_eq!(describe_panic(Box::new("boom")), "boom");
        assert_eq!(describe_panic(Box::new(String::from("boom"))), "boom");
        assert_eq!(describe_panic(Box::new(5_u32)), "non-string panic payload");
    }
}
