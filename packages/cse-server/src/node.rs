//! Node assembly: wires storage, transport, the Method Domain, the
//! event-driven engines and the request pipeline, and owns their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;

use crate::service::config::CseConfig;
use crate::service::domain::announcement::AnnouncementEngine;
use crate::service::domain::events::{EventConsumer, EventDispatcher, EventSink};
use crate::service::domain::expiration::{ExpirationSweeper, RefreshEngine};
use crate::service::domain::notification::NotificationEngine;
use crate::service::domain::registration::RegistrationService;
use crate::service::domain::{DomainCore, MethodDomain};
use crate::service::middleware::{build_request_pipeline, RequestPipeline};
use crate::service::registry::{ServiceContext, ServiceRegistry};
use crate::service::router::ControllerRegistry;
use crate::service::worker::BackgroundWorker;
use crate::storage::{Database, MemoryDb};
use crate::transport::{ClientAdapter, HttpClientAdapter, TransportDomain};

/// Builder for a [`CseNode`].
///
/// Defaults: an in-memory database and the HTTP client adapter.
pub struct CseNodeBuilder {
    config: CseConfig,
    database: Option<Arc<dyn Database>>,
    adapters: Vec<Arc<dyn ClientAdapter>>,
    own_poa: Vec<String>,
    consumers: Vec<Arc<dyn EventConsumer>>,
}

impl CseNodeBuilder {
    #[must_use]
    pub fn database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    /// Adds a client adapter; a later adapter wins a scheme registered twice.
    #[must_use]
    pub fn adapter(mut self, adapter: Arc<dyn ClientAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    #[must_use]
    pub fn own_poa(mut self, poa: Vec<String>) -> Self {
        self.own_poa = poa;
        self
    }

    /// Adds an event consumer running after the built-in engines.
    #[must_use]
    pub fn consumer(mut self, consumer: Arc<dyn EventConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    /// Starts the node: event dispatch first, then the managed services
    /// (CSE base bootstrap, peer registration), then the expiration sweep.
    ///
    /// # Errors
    ///
    /// Invalid configuration, adapter construction or service init failures.
    pub async fn start(self) -> anyhow::Result<CseNode> {
        let config = Arc::new(self.config);
        config.validate().context("invalid CSE configuration")?;

        let mut adapters: Vec<Arc<dyn ClientAdapter>> = vec![Arc::new(HttpClientAdapter::new(
            Duration::from_millis(config.default_request_timeout_ms),
        )?)];
        adapters.extend(self.adapters);
        let transport = TransportDomain::new(adapters);
        transport.set_own_poa(self.own_poa);

        let database = self
            .database
            .unwrap_or_else(|| Arc::new(MemoryDb::new()) as Arc<dyn Database>);

        let (tx, rx) = BackgroundWorker::<EventDispatcher>::channel();
        let core = DomainCore::new(
            Arc::clone(&config),
            database,
            ControllerRegistry::with_defaults(),
            transport.clone(),
            EventSink::new(tx.clone()),
        );
        let domain = MethodDomain::new(core);

        let notifications = Arc::new(NotificationEngine::new(domain.clone()));
        let announcements = Arc::new(AnnouncementEngine::new(domain.clone()));
        let refresher = Arc::new(RefreshEngine::new(domain.clone()));
        let mut consumers: Vec<Arc<dyn EventConsumer>> = vec![
            Arc::new(transport),
            notifications.clone(),
            announcements.clone(),
            refresher.clone(),
        ];
        consumers.extend(self.consumers);
        let dispatcher = BackgroundWorker::start_with_channel(
            EventDispatcher::new(consumers),
            tx,
            rx,
            config.event_tick_interval_ms,
        );

        let services = ServiceRegistry::new();
        services.register(domain.clone());
        services.register(RegistrationService::new(domain.clone()));
        services
            .init_all(&ServiceContext {
                config: Arc::clone(&config),
            })
            .await?;

        let sweeper = BackgroundWorker::start(
            ExpirationSweeper::new(domain.clone()),
            config.expiration_sweep_interval_ms,
        );
        let pipeline = build_request_pipeline(domain.clone(), &config);

        tracing::info!(
            cse_id = %config.cse_id,
            base = %config.cse_base_name,
            peers = config.remote_cses.len(),
            "CSE node started"
        );
        Ok(CseNode {
            config,
            domain,
            pipeline,
            services,
            notifications,
            announcements,
            refresher,
            dispatcher,
            sweeper,
        })
    }
}

/// A running CSE.
pub struct CseNode {
    config: Arc<CseConfig>,
    domain: MethodDomain,
    pipeline: RequestPipeline,
    services: ServiceRegistry,
    notifications: Arc<NotificationEngine>,
    announcements: Arc<AnnouncementEngine>,
    refresher: Arc<RefreshEngine>,
    dispatcher: BackgroundWorker<EventDispatcher>,
    sweeper: BackgroundWorker<ExpirationSweeper>,
}

impl CseNode {
    #[must_use]
    pub fn builder(config: CseConfig) -> CseNodeBuilder {
        CseNodeBuilder {
            config,
            database: None,
            adapters: Vec::new(),
            own_poa: Vec::new(),
            consumers: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Arc<CseConfig> {
        &self.config
    }

    /// The middleware-wrapped entry point used by the bindings.
    #[must_use]
    pub fn pipeline(&self) -> RequestPipeline {
        self.pipeline.clone()
    }

    #[must_use]
    pub fn domain(&self) -> &MethodDomain {
        &self.domain
    }

    #[must_use]
    pub fn notifications(&self) -> &Arc<NotificationEngine> {
        &self.notifications
    }

    #[must_use]
    pub fn announcements(&self) -> &Arc<AnnouncementEngine> {
        &self.announcements
    }

    #[must_use]
    pub fn refresher(&self) -> &Arc<RefreshEngine> {
        &self.refresher
    }

    /// Stops the node. Unless `terminate` is set, peers are told this node
    /// is leaving before the workers stop.
    pub async fn stop(&mut self, terminate: bool) {
        self.sweeper.stop().await;
        if let Err(e) = self.services.shutdown_all(terminate).await {
            tracing::warn!(error = %e, "service shutdown reported errors");
        }
        self.dispatcher.stop().await;
        tracing::info!(cse_id = %self.config.cse_id, terminate, "CSE node stopped");
    }
}
