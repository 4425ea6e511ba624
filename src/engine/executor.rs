//! Plugin execution with failure containment
//!
//! Every admitted plugin runs in its own task, bounded by a worker pool. A
//! plugin's deadline starts once it holds a worker; at the deadline the
//! task is abandoned and `TimedOut` is recorded. Errors and panics become
//! `Failed`. The whole cycle is bounded too, so the renderer always gets a
//! terminal result for every plugin.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use super::cache::{ CacheKey, ResultCache };
use super::result::PluginResult;
use crate::config::{ CYCLE_DEADLINE_SLACK_MS, Config };
use crate::error::EngineError;
use crate::plugins::entrypoint::InvocationContext;
use crate::plugins::env::get_plugin_env_vars;
use crate::plugins::registry::PluginDescriptor;
use crate::{ log_debug, log_warn };

/// One planned plugin invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    pub descriptor: Arc<PluginDescriptor>,
    pub timeout: Duration,
    /// Whole-result cache TTL and scope; `None` when not cacheable
    pub cache: Option<(Duration, String)>,
    pub settings: toml::Table,
}

impl Invocation {
    /// Resolve deadline, cache policy and settings for `descriptor`
    ///
    /// The plugin's config section overrides its metadata, which overrides
    /// the `[general]` defaults.
    pub fn plan(descriptor: &Arc<PluginDescriptor>, config: &Config) -> Self {
        let name = descriptor.name.as_str();
        let timeout = config
            .plugin_timeout(name)
            .or(descriptor.timeout)
            .unwrap_or_else(|| config.default_timeout());

        let scope = descriptor.cache
            .as_ref()
            .map(|spec| spec.scope.clone())
            .unwrap_or_default();
        let ttl = config.plugin_cache_ttl(name).or(descriptor.cache.as_ref().map(|spec| spec.ttl));
        let cache = ttl.filter(|ttl| !ttl.is_zero()).map(|ttl| (ttl, scope));

        Self {
            descriptor: descriptor.clone(),
            timeout,
            cache,
            settings: config.plugin_settings(name),
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    cache: ResultCache,
    env: Arc<HashMap<String, String>>,
}

impl Executor {
    pub fn new(cache: ResultCache, env: HashMap<String, String>) -> Self {
        Self {
            cache,
            env: Arc::new(env),
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Overall bound for a cycle of `plans`
    pub fn cycle_deadline(plans: &[Invocation], config: &Config) -> Duration {
        if let Some(ms) = config.general.cycle_deadline_ms.filter(|ms| *ms > 0) {
            return Duration::from_millis(ms);
        }

        let workers = config.general.workers.max(1);
        let rounds = plans.len().div_ceil(workers) as u32;
        let longest = plans
            .iter()
            .map(|plan| plan.timeout)
            .max()
            .unwrap_or_else(|| config.default_timeout());
        longest.saturating_mul(rounds) + Duration::from_millis(CYCLE_DEADLINE_SLACK_MS)
    }

    /// Run every plugin once; results come back in input order
    pub async fn run_cycle(&self, plugins: &[Arc<PluginDescriptor>], config: &Config) -> Vec<PluginResult> {
        let plans: Vec<Invocation> = plugins
            .iter()
            .map(|plugin| Invocation::plan(plugin, config))
            .collect();
        let deadline = Instant::now() + Self::cycle_deadline(&plans, config);
        let semaphore = Arc::new(Semaphore::new(config.general.workers.max(1)));

        let mut tasks = Vec::with_capacity(plans.len());
        for plan in plans {
            let name = plan.descriptor.name.clone();
            let permit = semaphore.clone();
            let executor = self.clone();

            let task = tokio::spawn(async move {
                let Ok(_permit) = permit.acquire_owned().await else {
                    return PluginResult::failed(plan.descriptor.name.clone(), "worker pool closed");
                };
                executor.execute(plan).await
            });
            tasks.push((name, task));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for (name, mut task) in tasks {
            let result = match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => PluginResult::failed(name, format!("task failed: {}", e)),
                Err(_) => {
                    task.abort();
                    log_warn!("Plugin {} still pending at the cycle deadline", name);
                    PluginResult::timed_out(name)
                }
            };
            results.push(result);
        }

        results
    }

    /// Run one plugin, through the result cache when it is cacheable
    pub async fn execute(&self, plan: Invocation) -> PluginResult {
        let descriptor = plan.descriptor.clone();
        let ctx = InvocationContext {
            plugin: descriptor.name.clone(),
            version: descriptor.version.clone(),
            settings: plan.settings,
            cache: self.cache.clone(),
            env: get_plugin_env_vars(&descriptor.permissions.env_vars, &self.env),
            deadline: std::time::Instant::now() + plan.timeout,
        };
        let timeout = plan.timeout;

        match plan.cache {
            Some((ttl, scope)) => {
                let key = CacheKey::new(descriptor.name.as_str(), scope);
                self.cache.get_or_compute(key, ttl, move || invoke_bounded(descriptor, ctx, timeout)).await
            }
            None => invoke_bounded(descriptor, ctx, timeout).await,
        }
    }
}

/// Invoke the entrypoint in its own task and give up on it at `timeout`
///
/// An error returned once the deadline has passed is the script being
/// interrupted, and counts as a timeout.
async fn invoke_bounded(
    descriptor: Arc<PluginDescriptor>,
    ctx: InvocationContext,
    timeout: Duration
) -> PluginResult {
    let name = descriptor.name.clone();
    let deadline = ctx.deadline;
    let entrypoint = descriptor.entrypoint.clone();
    let mut task = tokio::spawn(async move { entrypoint.invoke(ctx).await });

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(placeholders))) => {
            log_debug!("Plugin {} produced {} placeholder(s)", name, placeholders.len());
            PluginResult::success(name, placeholders)
        }
        Ok(Ok(Err(_))) if std::time::Instant::now() >= deadline => timed_out(name, timeout),
        Ok(Ok(Err(e))) => failure(name, format!("{:#}", e)),
        Ok(Err(e)) if e.is_panic() => {
            failure(name, format!("panicked: {}", panic_message(e.into_panic())))
        }
        Ok(Err(e)) => failure(name, format!("task failed: {}", e)),
        Err(_) => {
            task.abort();
            timed_out(name, timeout)
        }
    }
}

fn timed_out(name: String, timeout: Duration) -> PluginResult {
    let error = EngineError::ExecutionTimeout {
        name: name.clone(),
        timeout_ms: timeout.as_millis(),
    };
    log_warn!("{}", error);
    PluginResult::timed_out(name)
}

fn failure(name: String, reason: String) -> PluginResult {
    let error = EngineError::ExecutionFailure {
        name: name.clone(),
        reason: reason.clone(),
    };
    log_warn!("{}", error);
    PluginResult::failed(name, reason)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
