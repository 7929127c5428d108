//! Server lifecycle: listen, accept, track sessions, shut down on signal.
//!
//! The [`Server`] binds its listener at construction (failure to bind is
//! fatal), then [`run`](Server::run) accepts connections until an OS
//! termination signal arrives. Shutdown is cooperative: one shared
//! [`CancellationToken`] unwinds every session loop, `on_server_close` is
//! fanned out to operations and subsystems, and a grace period lets
//! in-flight work finish before the call returns.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{Local, NaiveDate};
use dashmap::DashMap;
use log::{info, warn};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, tcp::OwnedReadHalf};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::ServerConfig,
    dispatch::{Dispatcher, RegisterError},
    operation::Operation,
    resources::ServerResources,
    session::{DisconnectReason, Session},
    subsystem::{Subsystem, SubsystemError, SubsystemManager, SystemEvent},
};

const INITIAL_ACCEPT_DELAY: Duration = Duration::from_millis(10);
const MAX_ACCEPT_DELAY: Duration = Duration::from_secs(1);

/// Errors raised while constructing or running a server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound; construction fails.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
    /// `run` was called while another run already consumed the listener.
    #[error("server already running")]
    AlreadyRunning,
}

struct IdAllocator {
    day: NaiveDate,
    serial: u64,
}

/// TCP application-protocol server owning the live session set.
pub struct Server {
    config: ServerConfig,
    /// Taken exactly once by the accept loop.
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    sessions: DashMap<String, Arc<Session>>,
    dispatcher: Arc<Dispatcher>,
    subsystems: SubsystemManager,
    resources: ServerResources,
    ids: Mutex<IdAllocator>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

impl Server {
    /// Bind a listener and prepare empty registries.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] when the configured address cannot be
    /// bound.
    pub async fn bind(config: ServerConfig) -> Result<Arc<Self>, ServerError> {
        Self::bind_with_resources(config, ServerResources::new()).await
    }

    /// Bind a listener, carrying `resources` for init hooks.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] when the configured address cannot be
    /// bound.
    pub async fn bind_with_resources(
        config: ServerConfig,
        resources: ServerResources,
    ) -> Result<Arc<Self>, ServerError> {
        let listener = TcpListener::bind(config.listen_addr())
            .await
            .map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;
        info!(
            "{} ({}) listening on {local_addr}",
            config.name, config.environment,
        );
        let dispatcher = Arc::new(Dispatcher::new(config.operation_budget()));
        Ok(Arc::new(Self {
            config,
            listener: Mutex::new(Some(listener)),
            local_addr,
            sessions: DashMap::new(),
            dispatcher,
            subsystems: SubsystemManager::new(),
            resources,
            ids: Mutex::new(IdAllocator {
                day: Local::now().date_naive(),
                serial: 0,
            }),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Address the listener actually bound (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// The configuration this server was built from.
    #[must_use]
    pub fn config(&self) -> &ServerConfig { &self.config }

    /// Collaborator handles available to init hooks.
    #[must_use]
    pub fn resources(&self) -> &ServerResources { &self.resources }

    /// The dispatcher owning the operation registry.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> { &self.dispatcher }

    /// The live session with `id`, if any.
    #[must_use]
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(&entry))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize { self.sessions.len() }

    /// Snapshot of the live sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Register an operation and run its init hook.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::register`].
    pub async fn register_operation(
        self: &Arc<Self>,
        operation: Arc<dyn Operation>,
    ) -> Result<(), RegisterError> {
        self.dispatcher.register(operation, self).await
    }

    /// Register a subsystem and run its init hook.
    ///
    /// # Errors
    ///
    /// See [`SubsystemManager::register`](crate::subsystem::SubsystemManager).
    pub async fn add_subsystem(
        self: &Arc<Self>,
        subsystem: Arc<dyn Subsystem>,
    ) -> Result<(), SubsystemError> {
        self.subsystems.register(subsystem, self).await
    }

    /// Broadcast a system event to every subsystem and operation.
    pub async fn notify_event(&self, session: &Arc<Session>, event: &SystemEvent) {
        self.subsystems.notify(session, event).await;
        self.dispatcher.notify_event(session, event).await;
    }

    /// Run until an OS termination signal (interrupt/terminate/quit).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyRunning`] if called twice.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        self.run_until(wait_for_signal()).await
    }

    /// Run until `shutdown` resolves (or [`stop`](Self::stop) is called).
    ///
    /// Fans out `on_server_start`, spawns the accept loop, and on shutdown
    /// performs the full stop sequence, waits the configured grace period,
    /// and drains the tracked session tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyRunning`] if called twice.
    pub async fn run_until<S>(self: Arc<Self>, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        let listener = self
            .listener
            .lock()
            .expect("listener lock poisoned")
            .take()
            .ok_or(ServerError::AlreadyRunning)?;

        self.dispatcher.notify_server_start().await;
        self.subsystems.notify_server_start().await;
        info!("{} started", self.config.name);

        self.tracker.spawn(Arc::clone(&self).accept_loop(listener));

        tokio::select! {
            () = shutdown => {}
            () = self.shutdown.cancelled() => {}
        }

        self.stop().await;
        tokio::time::sleep(self.config.shutdown_grace()).await;
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }

    /// Shutdown sequence: cancel every loop, fan out `on_server_close`,
    /// close the listener. Idempotent — only the first call does work.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("{} stopping", self.config.name);
        self.shutdown.cancel();
        self.dispatcher.notify_server_close().await;
        self.subsystems.notify_server_close().await;
        drop(self.listener.lock().expect("listener lock poisoned").take());
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut delay = INITIAL_ACCEPT_DELAY;
        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((stream, addr)) => {
                        delay = INITIAL_ACCEPT_DELAY;
                        self.admit(stream, addr).await;
                    }
                    Err(err) => {
                        warn!("accept error: {err}");
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(MAX_ACCEPT_DELAY);
                    }
                },
            }
        }
        // Dropping the listener here closes it.
    }

    async fn admit(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_session_id(addr);
        let (session, reader) = match Session::accept(id, stream, self.config.idle_timeout()) {
            Ok(pair) => pair,
            Err(err) => {
                warn!("failed to set up connection from {addr}: {err}");
                return;
            }
        };
        self.install(session, reader).await;
    }

    /// Install a session in the live set and start its loops.
    ///
    /// No two live sessions may share an id: a collision force-closes the
    /// previous holder before the new session takes its place.
    async fn install(self: &Arc<Self>, session: Arc<Session>, reader: OwnedReadHalf) {
        if let Some(previous) = self.sessions.get(session.id()).map(|e| Arc::clone(&e)) {
            warn!(
                "session id {} repeated; closing the previous connection",
                session.id(),
            );
            previous.close(DisconnectReason::IdCollision).await;
            self.sessions
                .remove_if(session.id(), |_, live| Arc::ptr_eq(live, &previous));
        }
        self.sessions
            .insert(session.id().to_owned(), Arc::clone(&session));

        self.tracker.spawn(Arc::clone(&session).read_loop(
            reader,
            Arc::clone(&self.dispatcher),
            self.shutdown.clone(),
            self.config.read_buffer_bytes,
        ));
        self.tracker
            .spawn(Arc::clone(&session).heartbeat_loop(self.shutdown.clone()));

        // Reap the session from the live set once it closes, whatever the
        // reason, and fan out the disconnect notification.
        let server = Arc::clone(self);
        let watched = Arc::clone(&session);
        self.tracker.spawn(async move {
            watched.wait_closed().await;
            server
                .sessions
                .remove_if(watched.id(), |_, live| Arc::ptr_eq(live, &watched));
            server.dispatcher.notify_client_disconnect(&watched).await;
            server.subsystems.notify_client_disconnect(&watched).await;
        });

        info!(
            "session {} connected from {}",
            session.id(),
            session.remote_addr(),
        );
        self.dispatcher.notify_client_connect(&session).await;
        self.subsystems.notify_client_connect(&session).await;
    }

    /// Compose a session id: local date, remote address, per-day serial.
    /// The serial resets at local midnight.
    fn next_session_id(&self, addr: SocketAddr) -> String {
        let today = Local::now().date_naive();
        let mut ids = self.ids.lock().expect("id allocator lock poisoned");
        if ids.day != today {
            ids.day = today;
            ids.serial = 0;
        }
        ids.serial += 1;
        format!("{}-{}-{}", today.format("%Y%m%d"), addr, ids.serial)
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::{
        ctrl_c,
        unix::{SignalKind, signal},
    };

    let handlers = (signal(SignalKind::terminate()), signal(SignalKind::quit()));
    let (Ok(mut terminate), Ok(mut quit)) = handlers else {
        warn!("failed to install unix signal handlers; falling back to ctrl-c");
        let _ = ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = ctrl_c() => warn!("received interrupt signal"),
        _ = terminate.recv() => warn!("received terminate signal"),
        _ = quit.recv() => warn!("received quit signal"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    warn!("received interrupt signal");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".parse().expect("loopback"),
            port: 0,
            shutdown_grace_secs: 0,
            ..ServerConfig::default()
        }
    }

    /// Fabricate an accepted server-side stream over loopback.
    async fn accepted_stream() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (accepted, _) = listener.accept().await.expect("accept");
        (accepted, client)
    }

    #[tokio::test]
    async fn duplicate_session_id_closes_the_previous_holder() {
        let server = Server::bind(loopback_config()).await.expect("bind");

        let (stream_a, _client_a) = accepted_stream().await;
        let (first, reader_a) =
            Session::accept("dup".into(), stream_a, Duration::from_secs(30)).expect("session");
        server.install(Arc::clone(&first), reader_a).await;
        assert_eq!(server.session_count(), 1);

        let (stream_b, _client_b) = accepted_stream().await;
        let (second, reader_b) =
            Session::accept("dup".into(), stream_b, Duration::from_secs(30)).expect("session");
        server.install(Arc::clone(&second), reader_b).await;

        assert!(first.is_closed());
        assert_eq!(first.close_reason(), Some(DisconnectReason::IdCollision));
        assert_eq!(server.session_count(), 1);
        let live = server.session("dup").expect("live session");
        assert!(Arc::ptr_eq(&live, &second));
    }

    #[tokio::test]
    async fn session_ids_carry_date_address_and_serial() {
        let server = Server::bind(loopback_config()).await.expect("bind");
        let addr: SocketAddr = "10.0.0.1:5000".parse().expect("addr");

        let first = server.next_session_id(addr);
        let second = server.next_session_id(addr);

        let date = Local::now().date_naive().format("%Y%m%d").to_string();
        assert_eq!(first, format!("{date}-10.0.0.1:5000-1"));
        assert_eq!(second, format!("{date}-10.0.0.1:5000-2"));
    }

    #[tokio::test]
    async fn run_twice_reports_already_running() {
        let server = Server::bind(loopback_config()).await.expect("bind");

        let runner = tokio::spawn(Arc::clone(&server).run_until(async {
            // Resolves immediately; the run still consumes the listener.
        }));
        runner.await.expect("join").expect("first run succeeds");

        let err = Arc::clone(&server)
            .run_until(async {})
            .await
            .expect_err("second run fails");
        assert!(matches!(err, ServerError::AlreadyRunning));
    }
}
