//! Message name to handler table with two-phase execution.
//!
//! A handler is registered as a [`HandlerFactory`]: for every received message the
//! reader task asks the factory for a fresh [`Executable`], runs its
//! [`immediate`](Executable::immediate) phase on the spot, then hands it to the
//! connection's update task where [`deferred`](Executable::deferred) runs with
//! mutable access to the session state. Deferred phases of one connection run one
//! at a time, in the order their messages were received.
//!
//! Names marked disabled resolve to a sentinel whose factory refuses to build an
//! executable; the connection treats that refusal as fatal.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::MessageInstance;
use crate::protocol::registry::TypeRegistry;
use crate::service::connection::ConnectionHandle;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info};

/// Work produced for one received message
pub trait Executable<S>: Send {
    /// Runs on the reader task as soon as the message is decoded
    fn immediate(&mut self, _connection: &ConnectionHandle) -> Result<()> {
        Ok(())
    }

    /// Runs later on the update task, exactly once
    fn deferred(self: Box<Self>, session: &mut S, connection: &ConnectionHandle) -> Result<()>;
}

/// Builds one [`Executable`] per received message
pub trait HandlerFactory<S>: Send + Sync {
    fn create(&self, message: MessageInstance) -> Result<Box<dyn Executable<S>>>;
}

/// Factory backed by a plain closure
pub struct FnFactory<F>(pub F);

impl<S, F> HandlerFactory<S> for FnFactory<F>
where
    F: Fn(MessageInstance) -> Result<Box<dyn Executable<S>>> + Send + Sync,
{
    fn create(&self, message: MessageInstance) -> Result<Box<dyn Executable<S>>> {
        (self.0)(message)
    }
}

/// Executable with only a deferred phase
struct Deferred<S, D> {
    message: MessageInstance,
    run: Arc<D>,
    _session: PhantomData<fn(&mut S)>,
}

impl<S, D> Executable<S> for Deferred<S, D>
where
    D: Fn(&MessageInstance, &mut S, &ConnectionHandle) -> Result<()> + Send + Sync,
{
    fn deferred(self: Box<Self>, session: &mut S, connection: &ConnectionHandle) -> Result<()> {
        (self.run)(&self.message, session, connection)
    }
}

/// Executable whose immediate phase produces the input of its deferred phase
struct TwoPhase<S, T, I, D> {
    message: MessageInstance,
    immediate: Arc<I>,
    deferred: Arc<D>,
    carried: Option<T>,
    _session: PhantomData<fn(&mut S)>,
}

impl<S, T, I, D> Executable<S> for TwoPhase<S, T, I, D>
where
    T: Send,
    I: Fn(&MessageInstance, &ConnectionHandle) -> Result<T> + Send + Sync,
    D: Fn(T, &mut S, &ConnectionHandle) -> Result<()> + Send + Sync,
{
    fn immediate(&mut self, connection: &ConnectionHandle) -> Result<()> {
        self.carried = Some((self.immediate)(&self.message, connection)?);
        Ok(())
    }

    fn deferred(self: Box<Self>, session: &mut S, connection: &ConnectionHandle) -> Result<()> {
        let this = *self;
        match this.carried {
            Some(carried) => (this.deferred)(carried, session, connection),
            None => Err(ProtocolError::Custom(format!(
                "Deferred phase of {} ran before its immediate phase",
                this.message.name()
            ))),
        }
    }
}

/// Sentinel installed for disabled message names
pub struct DisabledHandler {
    name: String,
}

impl<S> HandlerFactory<S> for DisabledHandler {
    fn create(&self, _message: MessageInstance) -> Result<Box<dyn Executable<S>>> {
        error!(message = %self.name, "Received a disabled message");
        Err(ProtocolError::DisabledMessage(self.name.clone()))
    }
}

/// Routes received messages to registered handlers by name
pub struct Dispatcher<S> {
    handlers: RwLock<HashMap<String, Arc<dyn HandlerFactory<S>>>>,
    disabled: RwLock<HashSet<String>>,
}

impl<S: 'static> Default for Dispatcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> Dispatcher<S> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            disabled: RwLock::new(HashSet::new()),
        }
    }

    /// Register a factory for `name`, replacing any previous one
    pub fn register<H>(&self, name: &str, factory: H) -> Result<()>
    where
        H: HandlerFactory<S> + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.into()))?;
        if handlers.insert(name.to_string(), Arc::new(factory)).is_some() {
            debug!(message = name, "Replaced message handler");
        }
        Ok(())
    }

    /// Register a handler that only has a deferred phase
    pub fn on<D>(&self, name: &str, handler: D) -> Result<()>
    where
        D: Fn(&MessageInstance, &mut S, &ConnectionHandle) -> Result<()> + Send + Sync + 'static,
    {
        let run = Arc::new(handler);
        self.register(
            name,
            FnFactory(move |message: MessageInstance| -> Result<Box<dyn Executable<S>>> {
                Ok(Box::new(Deferred {
                    message,
                    run: Arc::clone(&run),
                    _session: PhantomData,
                }))
            }),
        )
    }

    /// Register a handler with both phases; `immediate` hands its result to `deferred`
    pub fn on_two_phase<T, I, D>(&self, name: &str, immediate: I, deferred: D) -> Result<()>
    where
        T: Send + 'static,
        I: Fn(&MessageInstance, &ConnectionHandle) -> Result<T> + Send + Sync + 'static,
        D: Fn(T, &mut S, &ConnectionHandle) -> Result<()> + Send + Sync + 'static,
    {
        let immediate = Arc::new(immediate);
        let deferred = Arc::new(deferred);
        self.register(
            name,
            FnFactory(move |message: MessageInstance| -> Result<Box<dyn Executable<S>>> {
                Ok(Box::new(TwoPhase {
                    message,
                    immediate: Arc::clone(&immediate),
                    deferred: Arc::clone(&deferred),
                    carried: None,
                    _session: PhantomData,
                }))
            }),
        )
    }

    /// Mark `name` as disabled; it then resolves to [`DisabledHandler`]
    pub fn disable(&self, name: &str) -> Result<()> {
        self.disabled
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.into()))?
            .insert(name.to_string());
        Ok(())
    }

    /// Disable every name the registry's schema documents listed as disabled
    pub fn apply_schema(&self, registry: &TypeRegistry) -> Result<()> {
        let mut count = 0;
        for name in registry.disabled() {
            self.disable(name)?;
            count += 1;
        }
        if count > 0 {
            info!(count, "Disabled messages from schema");
        }
        Ok(())
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Find the factory for `name`; `None` when nothing is registered
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn HandlerFactory<S>>> {
        if self.is_disabled(name) {
            return Some(Arc::new(DisabledHandler {
                name: name.to_string(),
            }));
        }
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::protocol::handshake::Role;

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry
            .register(
                r#"{"messages":[
                    {"id":1,"name":"Echo","arguments":[{"name":"text","type":"string"}]},
                    {"id":2,"name":"Legacy","arguments":[]}],
                  "disabled":["Legacy"]}"#,
            )
            .unwrap();
        registry
    }

    fn handle(registry: TypeRegistry) -> ConnectionHandle {
        ConnectionHandle::detached(Role::Acceptor, Arc::new(registry), ConnectionConfig::default())
            .unwrap()
    }

    #[test]
    fn unregistered_name_does_not_resolve() {
        let dispatcher = Dispatcher::<Vec<String>>::new();
        assert!(dispatcher.resolve("Echo").is_none());
    }

    #[test]
    fn deferred_handler_sees_session() {
        let registry = registry();
        let message = registry.instance("Echo").unwrap().with("text", "hi").unwrap();
        let connection = handle(registry);

        let dispatcher = Dispatcher::<Vec<String>>::new();
        dispatcher
            .on("Echo", |message, session: &mut Vec<String>, _| {
                session.push(message.string("text")?.to_string());
                Ok(())
            })
            .unwrap();

        let mut executable = dispatcher.resolve("Echo").unwrap().create(message).unwrap();
        executable.immediate(&connection).unwrap();

        let mut session = Vec::new();
        executable.deferred(&mut session, &connection).unwrap();
        assert_eq!(session, vec!["hi".to_string()]);
    }

    #[test]
    fn immediate_result_reaches_deferred_phase() {
        let registry = registry();
        let message = registry.instance("Echo").unwrap().with("text", "abc").unwrap();
        let connection = handle(registry);

        let dispatcher = Dispatcher::<usize>::new();
        dispatcher
            .on_two_phase(
                "Echo",
                |message, _| Ok(message.string("text")?.len()),
                |len, total: &mut usize, _| {
                    *total += len;
                    Ok(())
                },
            )
            .unwrap();

        let mut executable = dispatcher.resolve("Echo").unwrap().create(message).unwrap();
        executable.immediate(&connection).unwrap();
        let mut total = 0;
        executable.deferred(&mut total, &connection).unwrap();
        assert_eq!(total, 3);
    }

    #[test]
    fn disabled_names_resolve_to_sentinel() {
        let registry = registry();
        let message = registry.instance("Legacy").unwrap();

        let dispatcher = Dispatcher::<()>::new();
        dispatcher.on("Legacy", |_, _, _| Ok(())).unwrap();
        dispatcher.apply_schema(&registry).unwrap();

        assert!(dispatcher.is_disabled("Legacy"));
        match dispatcher.resolve("Legacy").unwrap().create(message) {
            Err(ProtocolError::DisabledMessage(name)) => assert_eq!(name, "Legacy"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("disabled message produced an executable"),
        }
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let dispatcher = Dispatcher::<u8>::new();
        dispatcher.on("Echo", |_, s: &mut u8, _| {
            *s = 1;
            Ok(())
        })
        .unwrap();
        dispatcher.on("Echo", |_, s: &mut u8, _| {
            *s = 2;
            Ok(())
        })
        .unwrap();
        assert_eq!(dispatcher.handler_count(), 1);

        let registry = registry();
        let message = registry.instance("Echo").unwrap().with("text", "x").unwrap();
        let connection = handle(registry);
        let executable = dispatcher.resolve("Echo").unwrap().create(message).unwrap();
        let mut state = 0;
        executable.deferred(&mut state, &connection).unwrap();
        assert_eq!(state, 2);
    }
}
