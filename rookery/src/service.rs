//! Service schemas.
//!
//! A [`ServiceSpec`] is the flat, fully-resolved description the registry
//! works with: a name, optional version, settings and the action/event
//! handlers. Specs are assembled through [`ServiceBuilder`], which folds
//! mixins in at build time (later mixins override earlier ones, the
//! concrete schema overrides every mixin), so nothing downstream ever
//! sees a mixin.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use crate::cacher::CachePolicy;
use crate::config::{BulkheadConfig, CircuitBreakerConfig, RetryPolicy};
use crate::context::Context;
use crate::error::BrokerError;
use crate::transit::packet::{ActionInfo, EventInfo, ServiceInfo};

pub(crate) type ActionFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, BrokerError>>>>;
type ActionHandler = Box<dyn Fn(Context) -> ActionFuture>;

pub(crate) type EventFuture = Pin<Box<dyn Future<Output = Result<(), BrokerError>>>>;
type EventHandler = Box<dyn Fn(Context) -> EventFuture>;

type FallbackFn = Box<dyn Fn(&Context, &BrokerError) -> serde_json::Value>;
type ValidateFn = Box<dyn Fn(&serde_json::Value) -> Result<(), String>>;

/// One callable action: a handler plus its per-action policy overrides.
pub struct ActionSpec {
    name: String,
    handler: ActionHandler,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) circuit_breaker: Option<CircuitBreakerConfig>,
    pub(crate) bulkhead: Option<BulkheadConfig>,
    pub(crate) cache: Option<CachePolicy>,
    pub(crate) fallback: Option<FallbackFn>,
    pub(crate) validate: Option<ValidateFn>,
}

impl ActionSpec {
    pub fn new<F, Fut>(name: &str, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + 'static,
        Fut: Future<Output = Result<serde_json::Value, BrokerError>> + 'static,
    {
        Self {
            name: name.to_string(),
            handler: Box::new(move |ctx| Box::pin(handler(ctx))),
            timeout: None,
            retry: None,
            circuit_breaker: None,
            bulkhead: None,
            cache: None,
            fallback: None,
            validate: None,
        }
    }

    /// Short name within the service (`add`, not `math.add`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_circuit_breaker(mut self, cfg: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(cfg);
        self
    }

    pub fn with_bulkhead(mut self, cfg: BulkheadConfig) -> Self {
        self.bulkhead = Some(cfg);
        self
    }

    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    /// Value substituted when the call ultimately fails.
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&Context, &BrokerError) -> serde_json::Value + 'static,
    {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// Param check run before the handler; an `Err` message becomes a
    /// `Validation` error carrying the offending params.
    pub fn with_validate<F>(mut self, validate: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<(), String> + 'static,
    {
        self.validate = Some(Box::new(validate));
        self
    }

    pub(crate) fn invoke(&self, ctx: Context) -> ActionFuture {
        (self.handler)(ctx)
    }
}

impl fmt::Debug for ActionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSpec")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("cache", &self.cache)
            .finish()
    }
}

/// One event subscription: a pattern (wildcards allowed) plus a handler.
pub struct EventSpec {
    name: String,
    group: Option<String>,
    handler: EventHandler,
}

impl EventSpec {
    pub fn new<F, Fut>(name: &str, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + 'static,
        Fut: Future<Output = Result<(), BrokerError>> + 'static,
    {
        Self {
            name: name.to_string(),
            group: None,
            handler: Box::new(move |ctx| Box::pin(handler(ctx))),
        }
    }

    /// Subscription pattern (`user.created`, `user.*`, `user.**`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivery group; unset falls back to the service full name.
    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub(crate) fn resolved_group(&self, service_full_name: &str) -> String {
        self.group
            .clone()
            .unwrap_or_else(|| service_full_name.to_string())
    }

    pub(crate) fn invoke(&self, ctx: Context) -> EventFuture {
        (self.handler)(ctx)
    }
}

impl fmt::Debug for EventSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSpec")
            .field("name", &self.name)
            .field("group", &self.group)
            .finish()
    }
}

/// Flat, resolved service description.
#[derive(Debug)]
pub struct ServiceSpec {
    name: String,
    version: Option<String>,
    settings: serde_json::Value,
    actions: Vec<Rc<ActionSpec>>,
    events: Vec<Rc<EventSpec>>,
}

impl ServiceSpec {
    pub fn builder(name: &str) -> ServiceBuilder {
        ServiceBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// `{version}.{name}` when versioned, plain name otherwise.
    pub fn full_name(&self) -> String {
        match &self.version {
            Some(version) => format!("{version}.{}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn settings(&self) -> &serde_json::Value {
        &self.settings
    }

    pub fn actions(&self) -> &[Rc<ActionSpec>] {
        &self.actions
    }

    pub fn events(&self) -> &[Rc<EventSpec>] {
        &self.events
    }

    /// The INFO manifest entry for this service.
    pub(crate) fn manifest(&self) -> ServiceInfo {
        let full_name = self.full_name();
        ServiceInfo {
            name: full_name.clone(),
            version: self.version.clone(),
            settings: self.settings.clone(),
            actions: self
                .actions
                .iter()
                .map(|action| ActionInfo {
                    name: format!("{full_name}.{}", action.name),
                    timeout_ms: action.timeout.map(|t| t.as_millis() as u64),
                })
                .collect(),
            events: self
                .events
                .iter()
                .map(|event| EventInfo {
                    name: event.name.clone(),
                    group: event.resolved_group(&full_name),
                })
                .collect(),
        }
    }
}

/// Builder folding mixins and the concrete schema into a [`ServiceSpec`].
#[derive(Debug, Default)]
pub struct ServiceBuilder {
    name: String,
    version: Option<String>,
    settings: serde_json::Map<String, serde_json::Value>,
    mixins: Vec<ServiceSpec>,
    actions: Vec<ActionSpec>,
    events: Vec<EventSpec>,
}

impl ServiceBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    /// Shallow-merged over mixin settings at build time.
    pub fn settings(mut self, settings: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = settings {
            self.settings = map;
        }
        self
    }

    /// Add a mixin. Later mixins override earlier ones per action/event
    /// name; the concrete schema overrides all of them.
    pub fn mixin(mut self, mixin: ServiceSpec) -> Self {
        self.mixins.push(mixin);
        self
    }

    pub fn action(mut self, action: ActionSpec) -> Self {
        self.actions.push(action);
        self
    }

    pub fn event(mut self, event: EventSpec) -> Self {
        self.events.push(event);
        self
    }

    pub fn build(self) -> ServiceSpec {
        let mut settings = serde_json::Map::new();
        let mut actions: Vec<Rc<ActionSpec>> = Vec::new();
        let mut events: Vec<Rc<EventSpec>> = Vec::new();

        for mixin in &self.mixins {
            if let serde_json::Value::Object(map) = &mixin.settings {
                for (key, value) in map {
                    settings.insert(key.clone(), value.clone());
                }
            }
            for action in &mixin.actions {
                upsert(&mut actions, Rc::clone(action), |a| a.name.as_str());
            }
            for event in &mixin.events {
                upsert(&mut events, Rc::clone(event), |e| e.name.as_str());
            }
        }

        for (key, value) in self.settings {
            settings.insert(key, value);
        }
        for action in self.actions {
            upsert(&mut actions, Rc::new(action), |a| a.name.as_str());
        }
        for event in self.events {
            upsert(&mut events, Rc::new(event), |e| e.name.as_str());
        }

        ServiceSpec {
            name: self.name,
            version: self.version,
            settings: serde_json::Value::Object(settings),
            actions,
            events,
        }
    }
}

/// Replace the entry with the same key in place, or append.
fn upsert<T, K>(list: &mut Vec<Rc<T>>, item: Rc<T>, key: K)
where
    K: Fn(&T) -> &str,
{
    match list.iter_mut().find(|existing| key(existing) == key(&item)) {
        Some(slot) => *slot = item,
        None => list.push(item),
    }
}
