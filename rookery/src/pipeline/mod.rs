//! The fault-tolerance pipeline around every action call.
//!
//! ```text
//!   caller side                          executing side
//!   ───────────                          ──────────────
//!   depth gate                           bulkhead (slot or queue)
//!     └─ retry loop                        └─ param validation
//!          ├─ deadline gate                     └─ cache lookup
//!          ├─ breaker gate                           └─ handler ⏱
//!          └─ dispatch ───────────────▶              └─ cache store
//!     └─ fallback
//! ```
//!
//! The caller owns deadline, retry, breaker and fallback; bulkhead,
//! validation and cache run on whichever node executes the handler, so
//! remote callers share the callee's concurrency bound and cache. A retry
//! re-resolves the endpoint (it may land on a healthier peer) but keeps the
//! call id, so the callee side can tell attempts of one logical call apart
//! from new calls.

use std::rc::Rc;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::bus::BrokerEvent;
use crate::cacher::cache_key;
use crate::config::RetryPolicy;
use crate::context::{CallOptions, Context};
use crate::error::BrokerError;
use crate::registry::ActionEndpoint;
use crate::service::ActionSpec;
use crate::transit::packet::{Packet, PacketRequest};

pub(crate) mod bulkhead;
pub mod circuit_breaker;
pub(crate) mod retry;

use circuit_breaker::{Admission, BreakerTransition, CircuitBreaker};
use retry::RetrySchedule;

/// Run one action call through the full caller-side pipeline.
pub(crate) async fn run_call(
    broker: &Rc<Broker>,
    action: &str,
    ctx: Context,
    options: CallOptions,
) -> Result<serde_json::Value, BrokerError> {
    let max_level = broker.options().max_call_level;
    if max_level > 0 && ctx.level() > max_level {
        return apply_fallback(
            action,
            &ctx,
            options.fallback.clone(),
            None,
            BrokerError::MaxCallLevel { level: ctx.level() },
        );
    }

    if let Some(extra) = &options.meta {
        ctx.merge_meta(extra);
    }
    let meta = ctx.meta_snapshot();

    // The first resolution fixes the deadline and the retry budget; later
    // attempts re-resolve but keep both.
    let first = match broker
        .registry()
        .resolve_action(action, options.node_id.as_ref(), ctx.params(), &meta)
    {
        Ok(endpoint) => endpoint,
        Err(error) => return apply_fallback(action, &ctx, options.fallback.clone(), None, error),
    };

    let parent_deadline = ctx.deadline();
    let ctx = ctx.with_deadline(resolve_deadline(
        options.timeout,
        first.action_timeout(),
        broker.options().request_timeout,
        parent_deadline,
    ));
    let mut schedule = RetrySchedule::new(resolve_retry_policy(broker, &options, &first));
    let mut last_local_spec = first.action().map(Rc::clone);
    let mut endpoint = first;

    let terminal = loop {
        if ctx.expired() {
            break BrokerError::RequestSkipped {
                action: action.to_string(),
            };
        }

        let started = Instant::now();
        let node = endpoint.node_id().clone();
        match attempt(broker, action, &ctx, &endpoint).await {
            Ok((value, from_cache)) => {
                let elapsed = started.elapsed();
                if let Some(BreakerTransition::Closed) = endpoint.breaker().on_success() {
                    info!(action, node = %node, "circuit breaker closed");
                    broker.bus().publish(BrokerEvent::BreakerStateChanged {
                        action: action.to_string(),
                        node: node.clone(),
                        state: endpoint.breaker().state(),
                    });
                }
                broker.registry().on_call_finished(action, &node, elapsed);
                broker.bus().publish(BrokerEvent::CallFinished {
                    action: action.to_string(),
                    node,
                    elapsed,
                    ok: true,
                    from_cache,
                });
                return Ok(value);
            }
            Err(error) => {
                let elapsed = started.elapsed();
                if error.counts_for_breaker() {
                    if let Some(BreakerTransition::Opened) = endpoint.breaker().on_failure() {
                        warn!(action, node = %node, %error, "circuit breaker opened");
                        broker.bus().publish(BrokerEvent::BreakerStateChanged {
                            action: action.to_string(),
                            node: node.clone(),
                            state: endpoint.breaker().state(),
                        });
                    }
                } else {
                    // An expected failure says nothing about endpoint
                    // health. If this attempt was the half-open probe, free
                    // the slot so the breaker can admit another probe.
                    endpoint.breaker().abandon_probe();
                }
                broker.bus().publish(BrokerEvent::CallFinished {
                    action: action.to_string(),
                    node,
                    elapsed,
                    ok: false,
                    from_cache: false,
                });

                match schedule.next_delay(&error, ctx.remaining()) {
                    Some(delay) => {
                        debug!(
                            action,
                            retry = schedule.attempts_used(),
                            delay_ms = delay.as_millis() as u64,
                            %error,
                            "retrying after failure"
                        );
                        sleep(delay).await;
                        match broker.registry().resolve_action(
                            action,
                            options.node_id.as_ref(),
                            ctx.params(),
                            &meta,
                        ) {
                            Ok(next) => {
                                if let Some(spec) = next.action() {
                                    last_local_spec = Some(Rc::clone(spec));
                                }
                                endpoint = next;
                            }
                            Err(resolve_error) => break resolve_error,
                        }
                    }
                    None => break error,
                }
            }
        }
    };

    apply_fallback(
        action,
        &ctx,
        options.fallback,
        last_local_spec.as_ref(),
        terminal,
    )
}

/// One admission-gated dispatch to the chosen endpoint.
async fn attempt(
    broker: &Rc<Broker>,
    action: &str,
    ctx: &Context,
    endpoint: &Rc<ActionEndpoint>,
) -> Result<(serde_json::Value, bool), BrokerError> {
    let breaker = endpoint.breaker();
    let mut probe = ProbeGuard {
        breaker,
        armed: false,
    };
    match breaker.try_acquire() {
        Admission::Rejected => {
            return Err(BrokerError::CircuitBreakerOpen {
                action: action.to_string(),
                node: endpoint.node_id().clone(),
            })
        }
        Admission::AllowedProbe => {
            probe.armed = true;
            warn!(action, node = %endpoint.node_id(), "half-open breaker admits a probe");
            broker.bus().publish(BrokerEvent::BreakerStateChanged {
                action: action.to_string(),
                node: endpoint.node_id().clone(),
                state: breaker.state(),
            });
        }
        Admission::Allowed => {}
    }

    let outcome = match endpoint.action() {
        Some(spec) => local_execute(broker, action, Rc::clone(spec), ctx).await,
        None => remote_execute(broker, action, ctx, endpoint)
            .await
            .map(|value| (value, false)),
    };
    probe.armed = false;
    outcome
}

/// Execute a local action: bulkhead, validation, cache, then the handler
/// under the remaining deadline. Reports whether the result came from cache.
pub(crate) async fn local_execute(
    broker: &Rc<Broker>,
    action: &str,
    spec: Rc<ActionSpec>,
    ctx: &Context,
) -> Result<(serde_json::Value, bool), BrokerError> {
    let bulkhead = broker.bulkhead_for(action, spec.bulkhead.as_ref());
    let _permit = match &bulkhead {
        Some(bulkhead) => bulkhead.acquire(action).await?,
        None => None,
    };

    if let Some(validate) = &spec.validate {
        if let Err(message) = validate(ctx.params()) {
            return Err(BrokerError::Validation {
                message,
                data: Some(ctx.params().clone()),
            });
        }
    }

    let cache = match (&spec.cache, broker.cacher()) {
        (Some(policy), Some(cacher)) => {
            let key = cache_key(action, ctx.params(), policy.keys.as_deref());
            Some((policy, cacher, key))
        }
        _ => None,
    };
    if let Some((_, cacher, key)) = &cache {
        if let Some(hit) = cacher.get(key).await {
            debug!(action, "serving cached result");
            return Ok((hit, true));
        }
    }

    let started = Instant::now();
    let invocation = spec.invoke(ctx.clone());
    let result = match ctx.remaining() {
        Some(remaining) => match timeout(remaining, invocation).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::RequestTimeout {
                action: action.to_string(),
                node: Some(broker.node_id().clone()),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        },
        None => invocation.await,
    };

    match result {
        Ok(value) => {
            if let Some((policy, cacher, key)) = &cache {
                cacher.set(key, value.clone(), policy.ttl).await;
            }
            Ok((value, false))
        }
        Err(error) => Err(error),
    }
}

/// Ship the call to a remote endpoint and wait for its RESPONSE.
async fn remote_execute(
    broker: &Rc<Broker>,
    action: &str,
    ctx: &Context,
    endpoint: &Rc<ActionEndpoint>,
) -> Result<serde_json::Value, BrokerError> {
    let node = endpoint.node_id().clone();
    let transit = match broker.transit() {
        Some(transit) => transit,
        None => return Err(BrokerError::NodeUnavailable { node }),
    };

    let remaining = ctx.remaining();
    let packet = Packet::Request(PacketRequest {
        sender: broker.node_id().clone(),
        id: ctx.id().to_string(),
        action: action.to_string(),
        params: ctx.params().clone(),
        meta: ctx.meta_snapshot(),
        timeout_ms: remaining.map(|r| r.as_millis() as u64),
        level: ctx.level(),
        parent_id: ctx.parent_id().map(str::to_string),
        request_id: ctx.request_id().to_string(),
        caller: ctx.caller().map(str::to_string),
    });

    let receiver = transit.pending().register(ctx.id(), action, &node);
    let started = Instant::now();
    if let Err(error) = transit.send_to(&node, &packet).await {
        transit.pending().drop_call(ctx.id());
        return Err(error);
    }

    let reply = match remaining {
        Some(remaining) => match timeout(remaining, receiver).await {
            Ok(resolved) => resolved,
            Err(_) => {
                // Forget the call so a late RESPONSE is dropped on arrival.
                transit.pending().drop_call(ctx.id());
                return Err(BrokerError::RequestTimeout {
                    action: action.to_string(),
                    node: Some(node),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
        },
        None => receiver.await,
    };

    match reply {
        Ok(Ok(reply)) => {
            ctx.merge_meta(&reply.meta);
            Ok(reply.data)
        }
        Ok(Err(error)) => Err(error),
        Err(_) => Err(BrokerError::NodeUnavailable { node }),
    }
}

/// Deadline for this call: explicit option, else the action's own timeout,
/// else the broker default; zero disables. A parent deadline caps whatever
/// the child would otherwise get.
fn resolve_deadline(
    option_timeout: Option<Duration>,
    action_timeout: Option<Duration>,
    default_timeout: Duration,
    parent: Option<Instant>,
) -> Option<Instant> {
    let budget = option_timeout.or(action_timeout).unwrap_or(default_timeout);
    let own = if budget.is_zero() {
        None
    } else {
        Some(Instant::now() + budget)
    };
    match (own, parent) {
        (Some(own), Some(parent)) => Some(own.min(parent)),
        (own, parent) => own.or(parent),
    }
}

fn resolve_retry_policy(
    broker: &Rc<Broker>,
    options: &CallOptions,
    endpoint: &Rc<ActionEndpoint>,
) -> RetryPolicy {
    let mut policy = endpoint
        .action()
        .and_then(|spec| spec.retry.clone())
        .unwrap_or_else(|| broker.options().retry.clone());
    if let Some(retries) = options.retries {
        // Only the attempt count is overridden; the backoff shape still
        // comes from the action or broker policy.
        policy.retries = retries;
    }
    policy
}

fn apply_fallback(
    action: &str,
    ctx: &Context,
    call_fallback: Option<serde_json::Value>,
    spec: Option<&Rc<ActionSpec>>,
    error: BrokerError,
) -> Result<serde_json::Value, BrokerError> {
    if let Some(value) = call_fallback {
        debug!(action, %error, "substituting call-level fallback");
        return Ok(value);
    }
    if let Some(spec) = spec {
        if let Some(fallback) = &spec.fallback {
            debug!(action, %error, "substituting action-level fallback");
            return Ok(fallback(ctx, &error));
        }
    }
    Err(error)
}

/// Frees the half-open probe slot if the attempt never completed.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_prefers_option_then_action_then_default() {
        let now = Instant::now();
        let deadline = resolve_deadline(
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(5)),
            Duration::from_secs(10),
            None,
        );
        assert_eq!(deadline, Some(now + Duration::from_secs(1)));

        let deadline = resolve_deadline(
            None,
            Some(Duration::from_secs(5)),
            Duration::from_secs(10),
            None,
        );
        assert_eq!(deadline, Some(now + Duration::from_secs(5)));

        let deadline = resolve_deadline(None, None, Duration::from_secs(10), None);
        assert_eq!(deadline, Some(now + Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_disables_the_deadline() {
        assert_eq!(
            resolve_deadline(Some(Duration::ZERO), None, Duration::from_secs(10), None),
            None
        );
        assert_eq!(resolve_deadline(None, None, Duration::ZERO, None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_deadline_caps_the_child() {
        let now = Instant::now();
        let parent = now + Duration::from_secs(2);
        let deadline = resolve_deadline(
            Some(Duration::from_secs(30)),
            None,
            Duration::from_secs(10),
            Some(parent),
        );
        assert_eq!(deadline, Some(parent));

        // A tighter own budget wins over a roomier parent.
        let deadline = resolve_deadline(
            Some(Duration::from_secs(1)),
            None,
            Duration::from_secs(10),
            Some(parent),
        );
        assert_eq!(deadline, Some(now + Duration::from_secs(1)));

        // Even with its own timeout disabled the child honors the parent.
        let deadline =
            resolve_deadline(Some(Duration::ZERO), None, Duration::from_secs(10), Some(parent));
        assert_eq!(deadline, Some(parent));
    }

    #[test]
    fn test_call_fallback_beats_action_fallback() {
        let ctx = Context::test_local(serde_json::json!({}));
        let spec = Rc::new(
            ActionSpec::new("probe", |_ctx| async { Ok(serde_json::Value::Null) })
                .with_fallback(|_ctx, _err| serde_json::json!("from-action")),
        );
        let error = BrokerError::ServiceNotFound {
            action: "x".to_string(),
        };

        let out = apply_fallback(
            "x",
            &ctx,
            Some(serde_json::json!("from-call")),
            Some(&spec),
            error,
        )
        .expect("fallback value");
        assert_eq!(out, serde_json::json!("from-call"));
    }

    #[test]
    fn test_action_fallback_and_passthrough() {
        let ctx = Context::test_local(serde_json::json!({}));
        let spec = Rc::new(
            ActionSpec::new("probe", |_ctx| async { Ok(serde_json::Value::Null) })
                .with_fallback(|_ctx, _err| serde_json::json!("from-action")),
        );

        let out = apply_fallback(
            "x",
            &ctx,
            None,
            Some(&spec),
            BrokerError::ServiceNotFound {
                action: "x".to_string(),
            },
        )
        .expect("fallback value");
        assert_eq!(out, serde_json::json!("from-action"));

        let bare = Rc::new(ActionSpec::new("probe", |_ctx| async {
            Ok(serde_json::Value::Null)
        }));
        let through = apply_fallback(
            "x",
            &ctx,
            None,
            Some(&bare),
            BrokerError::ServiceNotFound {
                action: "x".to_string(),
            },
        );
        assert!(matches!(
            through,
            Err(BrokerError::ServiceNotFound { .. })
        ));
    }
}
