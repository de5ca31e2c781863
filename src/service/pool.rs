//! # Connection Pool
//!
//! Server-side registry of live connections.
//!
//! [`ConnectionPool::serve`] spawns the accept loop and the maintenance task.
//! Every accepted socket becomes an acceptor-role [`Connection`] with a fresh
//! session value from the pool's session factory.
//!
//! Maintenance runs every `maintenance_interval`:
//! - closed connections are removed, then handed to the pool shutdown hooks;
//! - connections still handshaking after `handshake_timeout` are shut down;
//! - pool periodic tasks run against every live connection.
//!
//! The connection map is the only lock shared between connections. Hooks and
//! tasks always run on a snapshot taken outside it.
//!
//! Sockets still completing a TLS accept count against `max_connections`.

use crate::config::{ConnectionConfig, NetworkConfig, ServerConfig};
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::Role;
use crate::protocol::message::MessageInstance;
use crate::protocol::registry::TypeRegistry;
use crate::service::connection::{Connection, ConnectionHandle, ConnectionState};
use crate::service::listener::Listener;
use crate::utils::timeout::ExponentialBackoff;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

type SessionFactory<S> = Box<dyn Fn() -> S + Send + Sync>;
type PoolTask = Arc<dyn Fn(&ConnectionHandle) + Send + Sync>;
type ConnectionTask<S> = Arc<dyn Fn(&mut S, &ConnectionHandle) -> Result<()> + Send + Sync>;
type ConnectionHook<S> = Arc<dyn Fn(&mut S, &ConnectionHandle) + Send + Sync>;

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PoolInner<S> {
    registry: Arc<TypeRegistry>,
    dispatcher: Arc<Dispatcher<S>>,
    server: ServerConfig,
    connection: ConnectionConfig,
    sessions: SessionFactory<S>,
    connections: Mutex<HashMap<u64, Arc<Connection<S>>>>,
    pending_accepts: AtomicUsize,
    periodic: Mutex<Vec<PoolTask>>,
    shutdown_hooks: Mutex<Vec<PoolTask>>,
    connection_tasks: Mutex<Vec<ConnectionTask<S>>>,
    connection_hooks: Mutex<Vec<ConnectionHook<S>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Shared handle to a set of server-side connections
pub struct ConnectionPool<S> {
    inner: Arc<PoolInner<S>>,
}

impl<S> Clone for ConnectionPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Send + 'static> ConnectionPool<S> {
    pub fn new<F>(
        registry: Arc<TypeRegistry>,
        dispatcher: Arc<Dispatcher<S>>,
        server: ServerConfig,
        connection: ConnectionConfig,
        sessions: F,
    ) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                registry,
                dispatcher,
                server,
                connection,
                sessions: Box::new(sessions),
                connections: Mutex::new(HashMap::new()),
                pending_accepts: AtomicUsize::new(0),
                periodic: Mutex::new(Vec::new()),
                shutdown_hooks: Mutex::new(Vec::new()),
                connection_tasks: Mutex::new(Vec::new()),
                connection_hooks: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn from_config<F>(
        config: &NetworkConfig,
        registry: Arc<TypeRegistry>,
        dispatcher: Arc<Dispatcher<S>>,
        sessions: F,
    ) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self::new(
            registry,
            dispatcher,
            config.server.clone(),
            config.connection.clone(),
            sessions,
        )
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.inner.registry
    }

    pub fn max_connections(&self) -> usize {
        self.inner.server.max_connections
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pooled connections plus sockets still in a TLS accept
    fn occupancy(&self) -> usize {
        self.len() + self.inner.pending_accepts.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection<S>>> {
        lock(&self.inner.connections).get(&id).cloned()
    }

    /// Snapshot of the pooled connections
    pub fn connections(&self) -> Vec<Arc<Connection<S>>> {
        lock(&self.inner.connections).values().cloned().collect()
    }

    /// Run `task` against every live connection on each maintenance pass
    pub fn add_periodic_task<F>(&self, task: F)
    where
        F: Fn(&ConnectionHandle) + Send + Sync + 'static,
    {
        lock(&self.inner.periodic).push(Arc::new(task));
    }

    /// Run `hook` once for every connection leaving the pool
    pub fn add_shutdown_hook<F>(&self, hook: F)
    where
        F: Fn(&ConnectionHandle) + Send + Sync + 'static,
    {
        lock(&self.inner.shutdown_hooks).push(Arc::new(hook));
    }

    /// Attach `task` as a periodic task to every connection created afterwards
    pub fn add_connection_task<F>(&self, task: F)
    where
        F: Fn(&mut S, &ConnectionHandle) -> Result<()> + Send + Sync + 'static,
    {
        lock(&self.inner.connection_tasks).push(Arc::new(task));
    }

    /// Attach `hook` as a shutdown hook to every connection created afterwards
    pub fn add_connection_shutdown_hook<F>(&self, hook: F)
    where
        F: Fn(&mut S, &ConnectionHandle) + Send + Sync + 'static,
    {
        lock(&self.inner.connection_hooks).push(Arc::new(hook));
    }

    /// Wrap an accepted stream in a started acceptor connection and pool it
    pub fn attach<T>(&self, stream: T, peer_addr: Option<SocketAddr>) -> Result<Arc<Connection<S>>>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let connection = Connection::new(
            Role::Acceptor,
            peer_addr,
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.dispatcher),
            self.inner.connection.clone(),
            (self.inner.sessions)(),
        )?;

        for task in lock(&self.inner.connection_tasks).iter() {
            let task = Arc::clone(task);
            connection.add_periodic_task(move |session, handle| task(session, handle));
        }
        for hook in lock(&self.inner.connection_hooks).iter() {
            let hook = Arc::clone(hook);
            connection.add_shutdown_hook(move |session, handle| hook(session, handle));
        }

        connection.start(stream)?;
        let connection = Arc::new(connection);
        {
            let mut connections = lock(&self.inner.connections);
            // shutdown cancels before it drains the map
            if self.is_shutdown() {
                drop(connections);
                connection.shutdown();
                return Err(ProtocolError::ConnectionClosed);
            }
            connections.insert(connection.id(), Arc::clone(&connection));
        }
        debug!(connection = connection.id(), ?peer_addr, "Connection pooled");
        Ok(connection)
    }

    /// Spawn the accept loop over `listener` and the maintenance task
    #[instrument(skip(self, listener), fields(address = ?listener.local_addr().ok(), tls = listener.is_tls()))]
    pub fn serve(&self, listener: Listener) -> Result<()> {
        if self.is_shutdown() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let accept = tokio::spawn(accept_loop(self.clone(), listener));
        let maintenance = tokio::spawn(maintenance_loop(self.clone()));
        lock(&self.inner.tasks).extend([accept, maintenance]);
        info!("Server listening");
        Ok(())
    }

    /// Queue a copy of `message` to every live, secure connection
    pub fn broadcast(&self, message: &MessageInstance) -> usize {
        let mut delivered = 0;
        for connection in self.connections() {
            let handle = connection.handle();
            if handle.is_secure() && handle.state() < ConnectionState::ShuttingDown {
                match handle.queue_message(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => debug!(connection = handle.id(), error = %e, "Broadcast skipped"),
                }
            }
        }
        delivered
    }

    /// One maintenance pass
    pub fn maintain(&self) {
        let snapshot = self.connections();
        let periodic: Vec<PoolTask> = lock(&self.inner.periodic).clone();
        let hooks: Vec<PoolTask> = lock(&self.inner.shutdown_hooks).clone();
        let handshake_timeout = self.inner.connection.handshake_timeout;

        for connection in snapshot {
            let handle = connection.handle();
            match handle.state() {
                ConnectionState::Closed => {
                    let removed = lock(&self.inner.connections).remove(&handle.id()).is_some();
                    if removed {
                        for hook in &hooks {
                            hook(handle);
                        }
                        debug!(connection = handle.id(), "Removed closed connection");
                    }
                    continue;
                }
                ConnectionState::Handshaking if handle.age() > handshake_timeout => {
                    warn!(connection = handle.id(), "Handshake timed out");
                    connection.shutdown();
                    continue;
                }
                ConnectionState::ShuttingDown => continue,
                _ => {}
            }
            for task in &periodic {
                task(handle);
            }
        }
    }

    /// Stop accepting, shut every connection down and run pool shutdown hooks
    /// for each. Does not wait for the connections to drain.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let drained: Vec<Arc<Connection<S>>> = lock(&self.inner.connections)
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        let hooks: Vec<PoolTask> = lock(&self.inner.shutdown_hooks).clone();

        for connection in &drained {
            connection.shutdown();
            for hook in &hooks {
                hook(connection.handle());
            }
        }
        info!(connections = drained.len(), "Connection pool shut down");
    }

    /// Wait for the accept loop and maintenance task to stop
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Pool task panicked");
            }
        }
    }
}

async fn accept_loop<S: Send + 'static>(pool: ConnectionPool<S>, listener: Listener) {
    let token = pool.inner.shutdown.clone();
    let mut backoff = ExponentialBackoff::new(ACCEPT_BACKOFF_INITIAL, ACCEPT_BACKOFF_MAX);
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                let delay = backoff.next_delay();
                error!(error = %e, retry_in = ?delay, "Error accepting connection");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };
        backoff.reset();

        if pool.occupancy() >= pool.max_connections() {
            warn!(%peer, max = pool.max_connections(), "Connection limit reached; dropping socket");
            drop(stream);
            continue;
        }

        match listener.tls() {
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                let pool = pool.clone();
                pool.inner.pending_accepts.fetch_add(1, Ordering::AcqRel);
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            if let Err(e) = pool.attach(tls_stream, Some(peer)) {
                                warn!(%peer, error = %e, "Failed to attach connection");
                            }
                        }
                        Err(e) => warn!(%peer, error = %e, "TLS handshake failed"),
                    }
                    // held until attach has inserted into the map
                    pool.inner.pending_accepts.fetch_sub(1, Ordering::AcqRel);
                });
            }
            None => {
                if let Err(e) = pool.attach(stream, Some(peer)) {
                    warn!(%peer, error = %e, "Failed to attach connection");
                }
            }
        }
    }
    debug!("Accept loop stopped");
}

async fn maintenance_loop<S: Send + 'static>(pool: ConnectionPool<S>) {
    let token = pool.inner.shutdown.clone();
    let mut ticker = tokio::time::interval(pool.inner.server.maintenance_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => pool.maintain(),
        }
    }
    debug!("Maintenance stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pool() -> ConnectionPool<u32> {
        ConnectionPool::new(
            Arc::new(TypeRegistry::new()),
            Arc::new(Dispatcher::new()),
            ServerConfig::default(),
            ConnectionConfig::default(),
            || 0,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn attach_racing_shutdown_leaves_nothing_pooled() {
        for _ in 0..50 {
            let pool = pool();
            let racer = pool.clone();
            let (stream, _peer) = tokio::io::duplex(1024);
            let attach = tokio::spawn(async move { racer.attach(stream, None).map(|c| c.id()) });
            pool.shutdown();
            let _ = attach.await.unwrap();
            assert!(pool.is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_connection_hooks_run_once_alongside_shutdown() {
        for _ in 0..20 {
            let pool = pool();
            let runs = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&runs);
            pool.add_shutdown_hook(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            let (stream, _peer) = tokio::io::duplex(1024);
            let connection = pool.attach(stream, None).unwrap();
            connection.shutdown();
            tokio::time::timeout(Duration::from_secs(5), connection.closed())
                .await
                .unwrap();

            let maintainer = pool.clone();
            let maintenance = tokio::task::spawn_blocking(move || maintainer.maintain());
            pool.shutdown();
            maintenance.await.unwrap();
            assert_eq!(runs.load(Ordering::SeqCst), 1);
        }
    }
}
