// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Middleware context.
//!
//! A [`Context`] owns everything shared by the entities of one middleware
//! instance: the entity registry, the directory, the registration carrier
//! with its broadcast and receive threads, the directory watchdog, the
//! shared-memory channel arena and the two job pools.
//!
//! ```text
//!   Publisher / Subscriber / ServiceServer / ServiceClient
//!        |  register / leave           ^ directory events
//!        v                             |
//!   EntityRegistry --tick--> RegistrationProvider --apply--> Directory
//!                                  |                           ^
//!                                  v                           |
//!                         RegistrationTransport --> RegistrationReceiver
//! ```
//!
//! Several contexts may live in one process. With
//! [`RegistrationTransportKind::InProcess`] each context gets its own bus
//! unless one is shared through [`ContextBuilder::registration_transport`].

use crate::config::{Config, ConfigError, RegistrationTransportKind, RuntimeConfig};
use crate::directory::{Directory, ObserverId, TopicFilter, Watchdog};
use crate::entity::{local_host_name, DataTypeInformation, EntityId, EntityIdAllocator, EntityKind};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::monitoring::MonitoringSnapshot;
use crate::pubsub::{Publisher, Subscriber};
use crate::registration::{
    InProcessBus, ProcessInfo, ProcessSeverity, RegistrationProvider, RegistrationReceiver,
    RegistrationSample, RegistrationTransport, SampleBody, ShmRegistration, UdpRegistration,
};
use crate::registry::EntityRegistry;
use crate::service::{ServiceClient, ServiceServer};
use crate::transport::shm::ChannelArena;
use crate::worker::WorkerThread;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// Shared state
// ============================================================================

/// State shared between a context and its entities.
pub(crate) struct ContextInner {
    pub(crate) config: Config,
    pub(crate) runtime: Arc<RuntimeConfig>,
    pub(crate) registry: Arc<EntityRegistry>,
    pub(crate) directory: Arc<Directory>,
    pub(crate) provider: Arc<RegistrationProvider>,
    pub(crate) arena: ChannelArena,
    /// User callbacks (responses, session and layer events)
    pub(crate) callbacks: Executor,
    /// Server method handlers
    pub(crate) handlers: Executor,
    pub(crate) process: EntityId,
    closed: AtomicBool,
}

impl ContextInner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ContextClosed);
        }
        Ok(())
    }

    /// Unregister `id` and announce its departure.
    pub(crate) fn leave(&self, id: &EntityId) {
        if let Some(sample) = self.registry.unregister(id) {
            self.provider.announce(&[sample]);
        }
    }
}

/// Background threads of a running context.
struct Running {
    provider: WorkerThread,
    _watchdog: Watchdog,
    _receiver: RegistrationReceiver,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for a [`Context`].
#[derive(Default)]
pub struct ContextBuilder {
    config: Option<Config>,
    transport: Option<Arc<dyn RegistrationTransport>>,
    unit_name: Option<String>,
}

impl ContextBuilder {
    /// Use `config` instead of [`Config::from_env`].
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Carry registration over `transport` whatever the configured kind.
    ///
    /// Contexts sharing one [`InProcessBus`] discover each other.
    #[must_use]
    pub fn registration_transport(mut self, transport: Arc<dyn RegistrationTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Name announced in the process registration.
    #[must_use]
    pub fn unit_name(mut self, name: impl Into<String>) -> Self {
        self.unit_name = Some(name.into());
        self
    }

    /// Validate the configuration and start registration.
    pub fn start(self) -> Result<Context> {
        crate::trace_fn!("ContextBuilder::start");
        let config = self.config.unwrap_or_else(Config::from_env);
        config.validate()?;

        let filter = TopicFilter::new(
            &config.monitoring.filter_include,
            &config.monitoring.filter_exclude,
        )
        .map_err(|e| ConfigError::InvalidFilter(e.to_string()))?;
        let runtime = Arc::new(RuntimeConfig::new(filter));

        let transport: Arc<dyn RegistrationTransport> = match self.transport {
            Some(transport) => transport,
            None => match config.registration.transport {
                RegistrationTransportKind::Udp => {
                    Arc::new(UdpRegistration::open(&config.transport.udp)?)
                }
                RegistrationTransportKind::Shm => Arc::new(ShmRegistration::open(
                    &config.registration,
                    &config.transport.shm,
                )?),
                RegistrationTransportKind::InProcess => Arc::new(InProcessBus::new()),
            },
        };

        let registry = Arc::new(EntityRegistry::new(EntityIdAllocator::new(local_host_name())));
        let directory = Arc::new(Directory::new(
            config.registration.timeout,
            Arc::clone(&runtime),
        ));
        let process_name = process_name();
        let process = registry.register(SampleBody::Process(ProcessInfo {
            unit_name: self.unit_name.unwrap_or_else(|| process_name.clone()),
            process_name,
            severity: ProcessSeverity::Healthy,
            state_info: String::new(),
            attributes: runtime.attributes(),
        }));
        let provider = Arc::new(RegistrationProvider::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&transport),
            Arc::clone(&runtime),
            process.clone(),
        ));

        let tcp = &config.transport.tcp;
        let callbacks = Executor::new("cb", tcp.reader_executors)?;
        let handlers = Executor::new("handler", tcp.writer_executors)?;

        let receiver = RegistrationReceiver::start(
            transport.as_ref(),
            Arc::clone(&directory),
            Arc::clone(&registry),
            config.registration.loopback,
        )?;
        let watchdog = Watchdog::start(Arc::clone(&directory), config.registration.refresh)?;
        let provider_thread = provider.spawn(config.registration.refresh)?;

        log::info!(
            "[REG] context {} started over {} (refresh {:?}, timeout {:?})",
            process,
            transport.name(),
            config.registration.refresh,
            config.registration.timeout
        );
        let inner = Arc::new(ContextInner {
            config,
            runtime,
            registry,
            directory,
            provider,
            arena: ChannelArena::new(),
            callbacks,
            handlers,
            process,
            closed: AtomicBool::new(false),
        });
        Ok(Context {
            inner,
            running: Mutex::new(Some(Running {
                provider: provider_thread,
                _watchdog: watchdog,
                _receiver: receiver,
            })),
        })
    }
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| format!("pid-{}", std::process::id()))
}

// ============================================================================
// Context
// ============================================================================

/// One middleware instance.
///
/// ```rust,no_run
/// use hcal::{Config, Context};
///
/// let ctx = Context::builder().config(Config::in_process()).start()?;
/// let publisher = ctx.create_publisher("chatter", Default::default())?;
/// let subscriber = ctx.create_subscriber("chatter", Default::default())?;
/// publisher.send_bytes(b"hello")?;
/// # Ok::<(), hcal::Error>(())
/// ```
pub struct Context {
    inner: Arc<ContextInner>,
    running: Mutex<Option<Running>>,
}

impl Context {
    #[must_use]
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Start with [`Config::from_env`].
    pub fn new() -> Result<Self> {
        Self::builder().start()
    }

    // ------------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------------

    pub fn create_publisher(&self, topic: &str, data_type: DataTypeInformation) -> Result<Publisher> {
        Publisher::create(&self.inner, topic, data_type)
    }

    pub fn create_subscriber(
        &self,
        topic: &str,
        data_type: DataTypeInformation,
    ) -> Result<Subscriber> {
        Subscriber::create(&self.inner, topic, data_type)
    }

    pub fn create_service_server(&self, name: &str) -> Result<ServiceServer> {
        ServiceServer::create(&self.inner, name)
    }

    /// Server that only accepts protocol versions in `versions`.
    pub fn create_service_server_with_versions(
        &self,
        name: &str,
        versions: (u8, u8),
    ) -> Result<ServiceServer> {
        ServiceServer::create_with_versions(&self.inner, name, versions)
    }

    pub fn create_service_client(&self, name: &str) -> Result<ServiceClient> {
        ServiceClient::create(&self.inner, name)
    }

    /// Client that only offers protocol versions in `versions`.
    pub fn create_service_client_with_versions(
        &self,
        name: &str,
        versions: (u8, u8),
    ) -> Result<ServiceClient> {
        ServiceClient::create_with_versions(&self.inner, name, versions)
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Observe every registration sample of `kind` applied to the directory.
    ///
    /// Runs on the thread applying the sample; keep it short.
    pub fn add_registration_callback<F>(&self, kind: EntityKind, callback: F) -> ObserverId
    where
        F: Fn(&RegistrationSample) + Send + Sync + 'static,
    {
        self.inner
            .directory
            .add_registration_callback(kind, Arc::new(callback))
    }

    pub fn remove_registration_callback(&self, id: ObserverId) {
        self.inner.directory.remove_registration_callback(id);
    }

    /// Change the health announced for this process.
    pub fn set_process_state(&self, severity: ProcessSeverity, info: impl Into<String>) {
        let info = info.into();
        let updated = self.inner.registry.update(&self.inner.process, |body| {
            if let SampleBody::Process(process) = body {
                process.severity = severity;
                process.state_info = info;
            }
        });
        if let Some(sample) = updated {
            self.inner.provider.announce(&[sample]);
        }
    }

    /// Snapshot of the directory and of local entities.
    #[must_use]
    pub fn monitoring(&self) -> MonitoringSnapshot {
        MonitoringSnapshot::capture(&self.inner)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Attributes and topic filter, changeable while running.
    #[must_use]
    pub fn runtime(&self) -> &Arc<RuntimeConfig> {
        &self.inner.runtime
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<Directory> {
        &self.inner.directory
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Id of this context's process registration.
    #[must_use]
    pub fn process_id(&self) -> &EntityId {
        &self.inner.process
    }

    #[must_use]
    pub fn host_name(&self) -> &str {
        self.inner.registry.host_name()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.ensure_open().is_ok()
    }

    /// Announce departure and stop background threads.
    ///
    /// Entities still alive stop receiving registrations; creating new ones
    /// fails with [`Error::ContextClosed`]. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(mut running) = self.running.lock().take() else {
            return;
        };
        running.provider.stop();
        self.inner.leave(&self.inner.process);
        drop(running);
        self.inner.callbacks.shutdown();
        self.inner.handlers.shutdown();
        log::info!("[REG] context {} stopped", self.inner.process);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("process", &self.inner.process)
            .field("running", &self.is_running())
            .field("entities", &self.inner.registry.len())
            .finish()
    }
}
