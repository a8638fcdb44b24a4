use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;

use crate::aggregator::{AggregateWindowHandler, AggregationPolicy, StatAggregator};
use crate::broker::{Broker, TaskKind};
use crate::config::PipelineConfig;
use crate::events::{InProcEventBus, JobEventPublisher};
use crate::executor::ExecuteJobHandler;
use crate::provider::ProviderClient;
use crate::registry::{TaskHandler, TaskRegistry};
use crate::store::Store;

use super::supervisor::PipelineRuntime;

/// Builder for constructing a `PipelineRuntime` with explicit dependencies.
///
/// The broker, store and provider are required. Without an explicit event
/// publisher an [`InProcEventBus`] is used. `build` registers the
/// `execute_job` and `aggregate_window` handlers; extra task kinds can be
/// added with [`with_handler`](Self::with_handler).
///
/// # Example
///
/// ```ignore
/// use tally::*;
///
/// let runtime = PipelineRuntimeBuilder::new(config)
///     .with_broker(broker)
///     .with_store(store)
///     .with_provider(provider)
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct PipelineRuntimeBuilder<B, S, P>
where
    B: Broker + 'static,
    S: Store + 'static,
    P: ProviderClient + 'static,
{
    config: PipelineConfig,
    broker: Option<Arc<B>>,
    store: Option<Arc<S>>,
    provider: Option<Arc<P>>,
    events: Option<Arc<dyn JobEventPublisher + 'static>>,
    extra_handlers: Vec<(TaskKind, Arc<dyn TaskHandler>)>,
}

impl<B, S, P> fmt::Debug for PipelineRuntimeBuilder<B, S, P>
where
    B: Broker + 'static,
    S: Store + 'static,
    P: ProviderClient + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PipelineRuntimeBuilder");
        debug.field("config", &self.config);
        debug.field("broker_set", &self.broker.is_some());
        debug.field("store_set", &self.store.is_some());
        debug.field("provider_set", &self.provider.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.field(
            "extra_kinds",
            &self
                .extra_handlers
                .iter()
                .map(|(kind, _)| kind.as_str())
                .collect::<Vec<_>>(),
        );

        if self.broker.is_some() {
            debug.field("broker_type", &type_name::<B>());
        }
        if self.store.is_some() {
            debug.field("store_type", &type_name::<S>());
        }
        if self.provider.is_some() {
            debug.field("provider_type", &type_name::<P>());
        }

        debug.finish()
    }
}

impl<B, S, P> PipelineRuntimeBuilder<B, S, P>
where
    B: Broker + 'static,
    S: Store + 'static,
    P: ProviderClient + 'static,
{
    /// Create a new builder with the given pipeline configuration.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            broker: None,
            store: None,
            provider: None,
            events: None,
            extra_handlers: Vec::new(),
        }
    }

    /// Set the task broker.
    pub fn with_broker(mut self, broker: Arc<B>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the persistent store.
    pub fn with_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the provider client jobs are executed against.
    pub fn with_provider(mut self, provider: Arc<P>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the event publisher.
    pub fn with_events(mut self, events: Arc<dyn JobEventPublisher + 'static>) -> Self {
        self.events = Some(events);
        self
    }

    /// Register a handler for an additional task kind.
    pub fn with_handler(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.extra_handlers.push((kind, handler));
        self
    }

    /// Build the runtime, validating configuration and required dependencies.
    pub fn build(self) -> anyhow::Result<PipelineRuntime<B, S>> {
        self.config.validate()?;

        let broker = self
            .broker
            .ok_or_else(|| anyhow!("broker dependency missing"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow!("store dependency missing"))?;
        let provider = self
            .provider
            .ok_or_else(|| anyhow!("provider dependency missing"))?;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::default()) as Arc<dyn JobEventPublisher>);

        let executor = ExecuteJobHandler::new(
            Arc::clone(&store),
            provider,
            Arc::clone(&events),
            &self.config,
        );
        let aggregator = StatAggregator::new(
            Arc::clone(&store),
            Arc::clone(&events),
            AggregationPolicy::from(&self.config),
            self.config.store_timeout(),
        );

        let mut registry = TaskRegistry::new()
            .with(TaskKind::EXECUTE_JOB, Arc::new(executor))
            .with(
                TaskKind::AGGREGATE_WINDOW,
                Arc::new(AggregateWindowHandler::new(
                    Arc::new(aggregator),
                    self.config.retry.clone(),
                )),
            );
        for (kind, handler) in self.extra_handlers {
            registry.register(kind, handler);
        }

        Ok(PipelineRuntime::new(
            self.config,
            broker,
            store,
            registry,
            events,
        ))
    }
}
