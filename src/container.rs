//! Listener container: registration, startup and shutdown.
//!
//! The application registers every listener explicitly with its
//! declaration, then starts the container once. Startup handles each
//! listener independently:
//!
//! 1. check that the listener can receive its declared payload type
//! 2. resolve the effective configuration against subject overrides
//! 3. provision the stream and durable consumer
//! 4. start the worker pool and bind the subscription
//!
//! A failure in any step stops only that listener and is reported in the
//! returned [`StartupReport`]. Active subscriptions stay registered until
//! [`ListenerContainer::shutdown`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::codec::{Codec, JsonCodec, PayloadDecoder};
use crate::config::{EffectiveConfig, ListenerDeclaration, SubjectOverrides};
use crate::dispatch::{DispatchStats, Dispatcher, DrainMode, SinkPtr};
use crate::provision::Provisioner;
use crate::publisher::Publisher;
use crate::subscription::{ActiveSubscription, SubscriptionInfo};
use crate::{
    //
    lock_ignore_poison,
    log_error,
    log_info,
    BrokerPtr,
    Listener,
    ListenerError,
    Result,
};

/// A registered listener whose concrete type has been erased.
trait Registration<C: Codec>: Send + Sync {
    // ---
    fn name(&self) -> &str;

    fn declaration(&self) -> &ListenerDeclaration;

    fn check_capability(&self) -> Result<()>;

    fn dispatcher(&self, config: &EffectiveConfig, codec: Arc<C>) -> SinkPtr;
}

struct TypedRegistration<L> {
    name: String,
    listener: Arc<L>,
    declaration: ListenerDeclaration,
}

impl<L: Listener, C: Codec> Registration<C> for TypedRegistration<L> {
    // ---
    fn name(&self) -> &str {
        &self.name
    }

    fn declaration(&self) -> &ListenerDeclaration {
        &self.declaration
    }

    fn check_capability(&self) -> Result<()> {
        PayloadDecoder::<L::Message>::new(L::PAYLOAD).check_capability(&self.name)
    }

    fn dispatcher(&self, config: &EffectiveConfig, codec: Arc<C>) -> SinkPtr {
        Arc::new(Dispatcher::new(config, self.listener.clone(), codec))
    }
}

/// Outcome of [`ListenerContainer::start`].
#[derive(Debug, Default)]
pub struct StartupReport {
    /// Listeners that are subscribed and receiving.
    pub started: Vec<String>,
    /// Listeners whose registration failed, with the reason.
    pub failed: Vec<(String, ListenerError)>,
}

impl StartupReport {
    /// `true` when every registered listener started.
    pub fn is_healthy(&self) -> bool {
        self.failed.is_empty()
    }

    /// Failure of the named listener, if it failed.
    pub fn failure(&self, name: &str) -> Option<&ListenerError> {
        self.failed
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, err)| err)
    }
}

/// Builder for [`ListenerContainer`].
pub struct ListenerContainerBuilder<C: Codec = JsonCodec> {
    // ---
    broker: BrokerPtr,
    codec: Arc<C>,
    overrides: SubjectOverrides,
    registrations: Vec<Box<dyn Registration<C>>>,
    names: HashSet<String>,
    duplicate: Option<String>,
}

impl<C: Codec> ListenerContainerBuilder<C> {
    // ---
    /// Apply per-subject overrides to every listener.
    pub fn overrides(mut self, overrides: SubjectOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Register `listener` under `name`.
    ///
    /// Names must be unique within a container; a duplicate makes
    /// [`build`](Self::build) fail.
    pub fn register<L: Listener>(
        mut self,
        name: impl Into<String>,
        listener: L,
        declaration: ListenerDeclaration,
    ) -> Self {
        self.push(name.into(), Arc::new(listener), declaration);
        self
    }

    /// Register a listener the application keeps a handle to.
    pub fn register_shared<L: Listener>(
        mut self,
        name: impl Into<String>,
        listener: Arc<L>,
        declaration: ListenerDeclaration,
    ) -> Self {
        self.push(name.into(), listener, declaration);
        self
    }

    fn push<L: Listener>(&mut self, name: String, listener: Arc<L>, declaration: ListenerDeclaration) {
        // ---
        if !self.names.insert(name.clone()) {
            self.duplicate.get_or_insert(name);
            return;
        }
        self.registrations.push(Box::new(TypedRegistration {
            name,
            listener,
            declaration,
        }));
    }

    /// Build the container (consumes self).
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::DuplicateListener`] if a name was
    /// registered twice.
    pub fn build(self) -> Result<ListenerContainer<C>> {
        // ---
        if let Some(name) = self.duplicate {
            return Err(ListenerError::DuplicateListener(name));
        }

        Ok(ListenerContainer {
            inner: Arc::new(Inner {
                broker: self.broker,
                codec: self.codec,
                overrides: self.overrides,
                state: Mutex::new(State::Created(self.registrations)),
            }),
        })
    }
}

enum State<C: Codec> {
    Created(Vec<Box<dyn Registration<C>>>),
    Running(Vec<ActiveSubscription>),
    Stopped,
}

struct Inner<C: Codec> {
    broker: BrokerPtr,
    codec: Arc<C>,
    overrides: SubjectOverrides,
    state: Mutex<State<C>>,
}

/// Registry of listeners and their subscriptions for the process lifetime.
///
/// `ListenerContainer` is cheap to clone; clones share the same registry.
///
/// # Example
///
/// ```no_run
/// use mom_listener::{
///     create_memory_broker, text_listener_fn, DrainMode, HandlerError,
///     ListenerContainer, ListenerDeclaration,
/// };
///
/// # async fn run() -> mom_listener::Result<()> {
/// let broker = create_memory_broker().await?;
///
/// let container = ListenerContainer::builder(broker)
///     .register(
///         "audit",
///         text_listener_fn(|text: String| async move {
///             println!("{text}");
///             Ok::<(), HandlerError>(())
///         }),
///         ListenerDeclaration::builder()
///             .stream("ORDERS")
///             .filter_subject("orders.new")
///             .build()?,
///     )
///     .build()?;
///
/// let report = container.start().await?;
/// assert!(report.is_healthy());
///
/// container.shutdown(DrainMode::Complete).await?;
/// # Ok(())
/// # }
/// ```
pub struct ListenerContainer<C: Codec = JsonCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: Codec> Clone for ListenerContainer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ListenerContainer<JsonCodec> {
    /// Start building a container that decodes structured payloads as JSON.
    pub fn builder(broker: BrokerPtr) -> ListenerContainerBuilder<JsonCodec> {
        Self::builder_with_codec(broker, JsonCodec)
    }
}

impl<C: Codec> ListenerContainer<C> {
    // ---
    /// Start building a container with a custom codec.
    pub fn builder_with_codec(broker: BrokerPtr, codec: C) -> ListenerContainerBuilder<C> {
        // ---
        ListenerContainerBuilder {
            broker,
            codec: Arc::new(codec),
            overrides: SubjectOverrides::new(),
            registrations: Vec::new(),
            names: HashSet::new(),
            duplicate: None,
        }
    }

    /// Provision and subscribe every registered listener.
    ///
    /// Per-listener failures are collected in the report; they never stop
    /// other listeners from starting.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::AlreadyStarted`] on a second call and
    /// [`ListenerError::ShutDown`] after shutdown.
    pub async fn start(&self) -> Result<StartupReport> {
        // ---
        let registrations = {
            let mut state = lock_ignore_poison(&self.inner.state);
            match std::mem::replace(&mut *state, State::Running(Vec::new())) {
                State::Created(registrations) => registrations,
                previous @ State::Running(_) => {
                    *state = previous;
                    return Err(ListenerError::AlreadyStarted);
                }
                State::Stopped => {
                    *state = State::Stopped;
                    return Err(ListenerError::ShutDown);
                }
            }
        };

        let provisioner = Provisioner::new(self.inner.broker.clone());
        let mut report = StartupReport::default();

        for registration in registrations {
            let name = registration.name().to_string();

            match self.activate(&provisioner, registration.as_ref()).await {
                Ok(subscription) => {
                    let late = {
                        let mut state = lock_ignore_poison(&self.inner.state);
                        match &mut *state {
                            State::Running(active) => {
                                active.push(subscription);
                                None
                            }
                            State::Created(_) | State::Stopped => Some(subscription),
                        }
                    };
                    match late {
                        None => report.started.push(name),
                        // shut down while starting
                        Some(subscription) => {
                            subscription.close(DrainMode::NakPending).await;
                            report.failed.push((name, ListenerError::ShutDown));
                        }
                    }
                }
                Err(err) => {
                    log_error!("listener {name} failed to start: {err}");
                    report.failed.push((name, err));
                }
            }
        }

        log_info!(
            "listener container started: {} active, {} failed",
            report.started.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn activate(
        &self,
        provisioner: &Provisioner,
        registration: &dyn Registration<C>,
    ) -> Result<ActiveSubscription> {
        // ---
        registration.check_capability()?;

        let config = EffectiveConfig::resolve(
            registration.name(),
            registration.declaration(),
            &self.inner.overrides,
        );
        let consumer = provisioner.provision(&config).await?;

        let sink = registration.dispatcher(&config, self.inner.codec.clone());
        match ActiveSubscription::open(&self.inner.broker, config, consumer, sink.clone()).await {
            Ok(subscription) => Ok(subscription),
            Err(err) => {
                sink.shutdown(DrainMode::Complete).await;
                Err(err)
            }
        }
    }

    /// Snapshots of every active subscription.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        // ---
        match &*lock_ignore_poison(&self.inner.state) {
            State::Running(active) => active.iter().map(ActiveSubscription::info).collect(),
            State::Created(_) | State::Stopped => Vec::new(),
        }
    }

    /// Snapshot of one active subscription.
    pub fn subscription(&self, name: &str) -> Option<SubscriptionInfo> {
        // ---
        match &*lock_ignore_poison(&self.inner.state) {
            State::Running(active) => active.iter().find(|s| s.name() == name).map(|s| s.info()),
            State::Created(_) | State::Stopped => None,
        }
    }

    /// Publisher sharing this container's broker and codec.
    pub fn publisher(&self) -> Publisher<C> {
        Publisher::from_shared(self.inner.broker.clone(), self.inner.codec.clone())
    }

    /// Stop every subscription.
    ///
    /// Pull loops and push subscriptions stop first, then each worker pool
    /// drains according to `mode`. Handlers already running always finish
    /// and settle their message. The broker connection itself stays open;
    /// it is shared and closed by its owner.
    ///
    /// Returns final dispatch counters per listener. Calling it again is a
    /// no-op.
    pub async fn shutdown(&self, mode: DrainMode) -> Result<Vec<(String, DispatchStats)>> {
        // ---
        let active = {
            let mut state = lock_ignore_poison(&self.inner.state);
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Running(active) => active,
                State::Created(_) | State::Stopped => Vec::new(),
            }
        };

        log_info!("stopping {} listener(s), drain mode {mode:?}", active.len());

        let closing = active.into_iter().map(|subscription| async move {
            let name = subscription.name().to_string();
            (name, subscription.close(mode).await)
        });
        Ok(futures_util::future::join_all(closing).await)
    }
}
