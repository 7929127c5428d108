//! Cross-cutting subsystems and the system events delivered to them.
//!
//! Subsystems sit beside operations: they never handle wire requests, but
//! they receive the same server and client lifecycle notifications plus
//! broadcast [`SystemEvent`]s. One concrete subsystem is registered per
//! system code; the manager is state owned by the server, not a
//! process-wide registry.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use log::{error, warn};
use serde_json::Value;
use thiserror::Error;

use crate::{
    message::{DataCode, EventCode, Payload, SystemCode},
    resources::ServerResources,
    server::Server,
    session::Session,
};

/// A broadcast notification delivered to subsystems and operations.
#[derive(Clone, Debug)]
pub struct SystemEvent {
    code: EventCode,
    data: Payload,
}

impl SystemEvent {
    /// Create an event with an empty payload.
    #[must_use]
    pub fn new(code: EventCode) -> Self {
        Self {
            code,
            data: Payload::new(),
        }
    }

    /// Create an event carrying `data`.
    #[must_use]
    pub fn with_data(code: EventCode, data: Payload) -> Self {
        Self { code, data }
    }

    /// The event kind.
    #[must_use]
    pub fn event_code(&self) -> EventCode { self.code }

    /// Whether a value exists under `code`.
    #[must_use]
    pub fn contains(&self, code: DataCode) -> bool { self.data.contains_key(&code) }

    /// Value stored under `code`, if any.
    #[must_use]
    pub fn get(&self, code: DataCode) -> Option<&Value> { self.data.get(&code) }

    /// Store `value` under `code`.
    pub fn set(&mut self, code: DataCode, value: impl Into<Value>) {
        self.data.insert(code, value.into());
    }

    /// Borrow the full payload map.
    #[must_use]
    pub fn data(&self) -> &Payload { &self.data }
}

/// A cross-cutting system registered under one system code.
#[async_trait]
pub trait Subsystem: Send + Sync {
    /// The system code this subsystem is registered under.
    fn system_code(&self) -> SystemCode;

    /// Called once at registration with the server and its collaborator
    /// resources (database handles and the like, stored opaquely).
    ///
    /// # Errors
    ///
    /// An error aborts the registration.
    async fn on_init(
        &self,
        server: Arc<Server>,
        resources: &ServerResources,
    ) -> anyhow::Result<()> {
        let _ = (server, resources);
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
    /// Errors are logged; other subsystems still receive the event.
    async fn on_event_notify(
        &self,
        session: &Arc<Session>,
        event: &SystemEvent,
    ) -> anyhow::Result<()> {
        let _ = (session, event);
        Ok(())
    }
}

/// Errors raised while registering a subsystem.
#[derive(Debug, Error)]
pub enum SubsystemError {
    /// The system code is already bound; the first registration wins.
    #[error("system code {0} already registered; keeping the first")]
    Duplicate(SystemCode),
    /// The subsystem's init hook failed; nothing was registered.
    #[error("subsystem init failed: {0}")]
    Init(#[source] anyhow::Error),
}

/// Registry of system code → subsystem with failure-isolated fan-out.
#[derive(Default)]
pub struct SubsystemManager {
    systems: DashMap<SystemCode, Arc<dyn Subsystem>>,
}

impl SubsystemManager {
    pub(crate) fn new() -> Self { Self::default() }

    /// Register `subsystem` under its code and run its init hook.
    ///
    /// # Errors
    ///
    /// Returns [`SubsystemError::Duplicate`] for an already-bound code and
    /// [`SubsystemError::Init`] when the init hook fails.
    pub(crate) async fn register(
        &self,
        subsystem: Arc<dyn Subsystem>,
        server: &Arc<Server>,
    ) -> Result<(), SubsystemError> {
        let code = subsystem.system_code();
        if self.systems.contains_key(&code) {
            warn!("system code {code} already registered; keeping the first");
            return Err(SubsystemError::Duplicate(code));
        }
        subsystem
            .on_init(Arc::clone(server), server.resources())
            .await
            .map_err(SubsystemError::Init)?;
        match self.systems.entry(code) {
            Entry::Occupied(_) => {
                warn!("system code {code} already registered; keeping the first");
                Err(SubsystemError::Duplicate(code))
            }
            Entry::Vacant(slot) => {
                slot.insert(subsystem);
                Ok(())
            }
        }
    }

    /// Subsystem bound to `code`, if any.
    #[must_use]
    pub fn get(&self, code: SystemCode) -> Option<Arc<dyn Subsystem>> {
        self.systems.get(&code).map(|entry| Arc::clone(&entry))
    }

    fn snapshot(&self) -> Vec<(SystemCode, Arc<dyn Subsystem>)> {
        self.systems
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    /// Deliver `event` to every subsystem, isolating individual failures.
    pub(crate) async fn notify(&self, session: &Arc<Session>, event: &SystemEvent) {
        for (code, system) in self.snapshot() {
            if let Err(err) = system.on_event_notify(session, event).await {
                error!(
                    "subsystem {code} failed on event {}: {err:#}",
                    event.event_code(),
                );
            }
        }
    }

    pub(crate) async fn notify_server_start(&self) {
        for (code, system) in self.snapshot() {
            if let Err(err) = system.on_server_start().await {
                error!("subsystem {code} failed on server start: {err:#}");
            }
        }
    }

    pub(crate) async fn notify_server_close(&self) {
        for (code, system) in self.snapshot() {
            if let Err(err) = system.on_server_close().await {
                error!("subsystem {code} failed on server close: {err:#}");
            }
        }
    }

    pub(crate) async fn notify_client_connect(&self, session: &Arc<Session>) {
        for (code, system) in self.snapshot() {
            if let Err(err) = system.on_client_connect(session).await {
                error!(
                    "subsystem {code} failed on connect of session {}: {err:#}",
                    session.id(),
                );
            }
        }
    }

    pub(crate) async fn notify_client_disconnect(&self, session: &Arc<Session>) {
        for (code, system) in self.snapshot() {
            if let Err(err) = system.on_client_disconnect(session).await {
                error!(
                    "subsystem {code} failed on disconnect of session {}: {err:#}",
                    session.id(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn event_payload_round_trips() {
        let mut event = SystemEvent::new(3);
        assert_eq!(event.event_code(), 3);
        assert!(!event.contains(0));

        event.set(0, json!("ready"));
        assert!(event.contains(0));
        assert_eq!(event.get(0), Some(&json!("ready")));
    }

    #[test]
    fn with_data_keeps_the_payload() {
        let event = SystemEvent::with_data(1, Payload::from([(5, json!(42))]));
        assert_eq!(event.get(5), Some(&json!(42)));
    }
}
