//! Handler capability trait for registered operations.
//!
//! One concrete [`Operation`] is registered per operation code. Beyond
//! handling commands, an operation may opt into server and client
//! lifecycle notifications; every hook has a no-op default so simple
//! handlers implement only [`command`](Operation::command).

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    message::OpCode, request::Request, server::Server, session::Session,
    subsystem::SystemEvent,
};

/// A registered handler bound to one operation code.
///
/// `command` runs on its own task under the dispatcher's execution budget;
/// a handler that outlives the budget is abandoned, not cancelled, so
/// long-running handlers must watch their own cancellation signals.
#[async_trait]
pub trait Operation: Send + Sync {
    /// The operation code this handler is registered under.
    fn op_code(&self) -> OpCode;

    /// Handle one dispatched request.
    ///
    /// # Errors
    ///
    /// Errors are logged by the dispatcher; they never tear down the
    /// originating session.
    async fn command(&self, request: Request) -> anyhow::Result<()>;

    /// Called once at registration with a reference to the server.
    ///
    /// # Errors
    ///
    /// An error aborts the registration.
    async fn on_init(&self, server: Arc<Server>) -> anyhow::Result<()> {
        let _ = server;
        Ok(())
    }

    /// Called when the server starts accepting connections.
    ///
    /// # Errors
    ///
    /// Errors are logged and do not stop the server.
    async fn on_server_start(&self) -> anyhow::Result<()> { Ok(()) }

    /// Called during the shutdown sequence.
    ///
    /// # Errors
    ///
    /// Errors are logged and do not interrupt shutdown.
    async fn on_server_close(&self) -> anyhow::Result<()> { Ok(()) }

    /// Called after a new session is installed.
    ///
    /// # Errors
    ///
    /// Errors are logged; the session stays connected.
    async fn on_client_connect(&self, session: &Arc<Session>) -> anyhow::Result<()> {
        let _ = session;
        Ok(())
    }

    /// Called after a session closes and leaves the live set.
    ///
    /// # Errors
    ///
    /// Errors are logged.
    async fn on_client_disconnect(&self, session: &Arc<Session>) -> anyhow::Result<()> {
        let _ = session;
        Ok(())
    }

    /// Called when a system event is broadcast on behalf of a session.
    ///
    /// # Errors
    ///
    /// Errors are logged; other listeners still receive the event.
    async fn on_event_notify(
        &self,
        session: &Arc<Session>,
        event: &SystemEvent,
    ) -> anyhow::Result<()> {
        let _ = (session, event);
        Ok(())
    }
}
