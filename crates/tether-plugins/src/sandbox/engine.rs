//! One isolated QuickJS evaluation.
//!
//! Runs on a blocking worker thread. Each call builds its own interpreter
//! runtime and context, so nothing a handler defines outlives the call.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Runtime, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sanitize::sanitize_message;
use super::{HostContext, SandboxConfig};
use crate::error::{PluginError, PluginResult};

const PRELUDE: &str = include_str!("prelude.js");

/// Property the prelude stamps on the errors it throws for failed
/// capability calls. It only carries an index into [`HostErrors`].
const HOST_ERROR_ID: &str = "__hostErrorId";

const NOT_INTERRUPTED: u8 = 0;
const INTERRUPTED_DEADLINE: u8 = 1;
const INTERRUPTED_CANCELLED: u8 = 2;

/// Everything one evaluation needs, moved onto the worker thread.
pub(super) struct Invocation {
    pub(super) code: String,
    pub(super) params: serde_json::Value,
    pub(super) host: Arc<dyn HostContext>,
    pub(super) config: SandboxConfig,
    pub(super) deadline: Instant,
    pub(super) token: CancellationToken,
    pub(super) handle: tokio::runtime::Handle,
}

/// Capability errors raised during one evaluation.
///
/// The bridge keeps each error here and hands plugin code only its index.
/// An uncaught exception keeps a capability error's kind only when its
/// stamped index resolves to an error this evaluation actually raised.
#[derive(Clone, Default)]
struct HostErrors(Arc<Mutex<Vec<Option<PluginError>>>>);

impl HostErrors {
    fn mint(&self, error: PluginError) -> Option<u32> {
        let mut slots = self.0.lock().ok()?;
        let id = u32::try_from(slots.len()).ok()?;
        slots.push(Some(error));
        Some(id)
    }

    fn take(&self, id: u32) -> Option<PluginError> {
        let index = usize::try_from(id).ok()?;
        self.0.lock().ok()?.get_mut(index)?.take()
    }
}

/// How an evaluation failed, before the interrupt cause is applied.
enum Failure {
    /// A capability error that plugin code did not catch.
    Host(PluginError),
    /// Anything plugin code threw, unsanitized.
    Thrown(String),
    OutOfMemory,
    /// Engine-level failure unrelated to plugin code.
    Engine(String),
}

pub(super) fn run(invocation: Invocation) -> PluginResult<serde_json::Value> {
    let plugin = invocation.host.plugin().to_owned();
    let config = invocation.config.clone();

    let rt = Runtime::new().map_err(|e| runtime_error(&plugin, &e.to_string()))?;
    rt.set_memory_limit(config.memory_limit_bytes());
    rt.set_max_stack_size(config.max_stack_bytes());

    let cause = Arc::new(AtomicU8::new(NOT_INTERRUPTED));
    {
        let cause = Arc::clone(&cause);
        let token = invocation.token.clone();
        let deadline = invocation.deadline;
        rt.set_interrupt_handler(Some(Box::new(move || {
            if Instant::now() >= deadline {
                cause.store(INTERRUPTED_DEADLINE, Ordering::SeqCst);
                true
            } else if token.is_cancelled() {
                cause.store(INTERRUPTED_CANCELLED, Ordering::SeqCst);
                true
            } else {
                false
            }
        })));
    }

    let ctx = Context::full(&rt).map_err(|e| runtime_error(&plugin, &e.to_string()))?;
    let host_errors = HostErrors::default();
    let outcome = ctx.with(|ctx| evaluate(&ctx, &invocation, &host_errors));

    match cause.load(Ordering::SeqCst) {
        INTERRUPTED_DEADLINE => {
            debug!(plugin = %plugin, "handler interrupted at deadline");
            return Err(timeout_error(&plugin, &config));
        },
        INTERRUPTED_CANCELLED => return Err(destroyed_error(&plugin)),
        _ => {},
    }

    match outcome {
        Ok(json) => serde_json::from_str(&json)
            .map_err(|e| runtime_error(&plugin, &format!("handler result is not JSON: {e}"))),
        Err(Failure::Host(error)) => Err(error),
        Err(Failure::Thrown(message)) => Err(runtime_error(&plugin, &sanitize_message(&message))),
        Err(Failure::OutOfMemory) => Err(PluginError::MemoryExceeded {
            plugin,
            limit_mb: config.memory_limit_mb,
        }),
        Err(Failure::Engine(message)) => {
            warn!(plugin = %plugin, error = %message, "sandbox engine failure");
            Err(runtime_error(&plugin, &sanitize_message(&message)))
        },
    }
}

/// Build the context, evaluate the handler, call it, and settle its result.
fn evaluate<'js>(
    ctx: &Ctx<'js>,
    invocation: &Invocation,
    host_errors: &HostErrors,
) -> Result<String, Failure> {
    let descriptor = invocation.host.describe().to_string();
    let params = invocation.params.to_string();

    let attempt = || -> rquickjs::Result<Option<String>> {
        let factory: Function<'js> = ctx.eval(PRELUDE)?;
        let bridge = Function::new(ctx.clone(), bridge(invocation, host_errors.clone()))?;
        let build: Function<'js> = factory.call((bridge,))?;
        let context: Value<'js> = build.call((ctx.json_parse(descriptor.clone())?,))?;

        let handler: Function<'js> = ctx.eval(invocation.code.clone())?;
        let result: Value<'js> = handler.call((ctx.json_parse(params.clone())?, context))?;
        let settled = match result.clone().into_promise() {
            Some(promise) => promise.finish::<Value<'js>>()?,
            None => result,
        };

        ctx.json_stringify(settled)?
            .map(|s| s.to_string())
            .transpose()
    };

    match attempt().catch(ctx) {
        Ok(json) => Ok(json.unwrap_or_else(|| "null".to_owned())),
        Err(caught) => Err(classify(ctx, caught, host_errors)),
    }
}

/// The synchronous host function plugin code reaches through the prelude.
///
/// Each call blocks this worker on the async host, bounded by whatever is
/// left of the invocation's deadline.
fn bridge(
    invocation: &Invocation,
    host_errors: HostErrors,
) -> impl Fn(String, String) -> String + 'static {
    let host = Arc::clone(&invocation.host);
    let handle = invocation.handle.clone();
    let token = invocation.token.clone();
    let deadline = invocation.deadline;
    let config = invocation.config.clone();

    move |method: String, args: String| -> String {
        let plugin = host.plugin().to_owned();
        let args: Vec<serde_json::Value> = serde_json::from_str(&args).unwrap_or_default();

        let result = if token.is_cancelled() {
            Err(destroyed_error(&plugin))
        } else {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                Err(timeout_error(&plugin, &config))
            } else {
                handle.block_on(async {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => Err(destroyed_error(&plugin)),
                        res = tokio::time::timeout(remaining, host.invoke(&method, args)) => {
                            res.unwrap_or_else(|_| Err(timeout_error(&plugin, &config)))
                        }
                    }
                })
            }
        };

        match result {
            Ok(value) => serde_json::json!({ "ok": value }).to_string(),
            Err(e) => {
                debug!(plugin = %plugin, method = %method, error = %e, "capability call failed");
                let message = e.to_string();
                match host_errors.mint(e) {
                    Some(id) => serde_json::json!({ "err": { "id": id, "message": message } }),
                    None => serde_json::json!({ "err": { "message": message } }),
                }
                .to_string()
            },
        }
    }
}

fn classify<'js>(ctx: &Ctx<'js>, caught: CaughtError<'js>, host_errors: &HostErrors) -> Failure {
    match caught {
        CaughtError::Exception(exception) => {
            let id: Option<u32> = exception.as_object().get(HOST_ERROR_ID).ok().flatten();
            if let Some(error) = id.and_then(|id| host_errors.take(id)) {
                return Failure::Host(error);
            }
            let message = exception.message().unwrap_or_default();
            if message.contains("out of memory") {
                return Failure::OutOfMemory;
            }
            let name: Option<String> = exception.as_object().get("name").ok().flatten();
            Failure::Thrown(match name {
                Some(name) if !name.is_empty() => format!("{name}: {message}"),
                _ => message,
            })
        },
        CaughtError::Value(value) => {
            if let Some(s) = value.as_string().and_then(|s| s.to_string().ok()) {
                return Failure::Thrown(s);
            }
            if value.is_null() || value.is_undefined() {
                return Failure::Thrown("plugin threw a null value".to_owned());
            }
            let rendered = ctx
                .json_stringify(value)
                .ok()
                .flatten()
                .and_then(|s| s.to_string().ok())
                .unwrap_or_else(|| "plugin threw a non-error value".to_owned());
            Failure::Thrown(format!("uncaught: {rendered}"))
        },
        CaughtError::Error(rquickjs::Error::Allocation) => Failure::OutOfMemory,
        CaughtError::Error(rquickjs::Error::WouldBlock) => {
            Failure::Thrown("handler returned a promise that never settled".to_owned())
        },
        CaughtError::Error(e) => {
            let message = e.to_string();
            if message.contains("out of memory") {
                Failure::OutOfMemory
            } else {
                Failure::Engine(message)
            }
        },
    }
}

fn runtime_error(plugin: &str, message: &str) -> PluginError {
    PluginError::Runtime {
        plugin: plugin.to_owned(),
        message: message.to_owned(),
    }
}

fn timeout_error(plugin: &str, config: &SandboxConfig) -> PluginError {
    PluginError::Timeout {
        plugin: plugin.to_owned(),
        limit_ms: config.timeout_ms(),
    }
}

pub(super) fn destroyed_error(plugin: &str) -> PluginError {
    runtime_error(plugin, "sandbox destroyed")
}
