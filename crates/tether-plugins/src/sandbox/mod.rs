//! Isolated execution of plugin handler code.
//!
//! Handlers run in embedded QuickJS (`rquickjs`). Every [`Sandbox::execute`]
//! call gets a fresh interpreter on a blocking worker thread with:
//!
//! - a memory ceiling (interpreter allocator limit) and a stack ceiling,
//! - a wall-clock ceiling enforced by an interrupt handler the interpreter
//!   polls, with an outer async timeout as a backstop,
//! - no filesystem, network, process or timer APIs. Plugin code reaches the
//!   host only through the `context` object built from a [`HostContext`].
//!
//! Capability calls made by plugin code block the worker on the async host
//! (the same `Handle::block_on` bridge host functions use elsewhere), bounded
//! by the invocation's remaining time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::error::{PluginError, PluginResult};

mod engine;
mod sanitize;

pub use sanitize::sanitize_message;

/// Extra time the outer timeout allows beyond the interpreter deadline
/// before abandoning a worker that has not returned.
const OUTER_GRACE: Duration = Duration::from_millis(250);

/// The host side of a handler's `context`.
#[async_trait]
pub trait HostContext: Send + Sync {
    /// Name of the plugin the context belongs to.
    fn plugin(&self) -> &str;

    /// JSON descriptor: `plugin`, `version`, `config`, and a `capabilities`
    /// object of booleans (`sheets`, `drive`, `network`, `storage`).
    fn describe(&self) -> Value;

    /// Perform a bridged call such as `sheets.get` with positional args.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> PluginResult<Value>;
}

/// Resource ceilings for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Interpreter heap ceiling in MB.
    pub memory_limit_mb: u64,
    /// Wall-clock ceiling.
    pub timeout: Duration,
    /// Interpreter stack ceiling in KB.
    pub max_stack_kb: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 64,
            timeout: Duration::from_millis(5000),
            max_stack_kb: 1024,
        }
    }
}

impl SandboxConfig {
    fn memory_limit_bytes(&self) -> usize {
        usize::try_from(self.memory_limit_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    fn max_stack_bytes(&self) -> usize {
        usize::try_from(self.max_stack_kb.saturating_mul(1024)).unwrap_or(usize::MAX)
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Inputs bound into one handler call.
pub struct Bindings {
    /// Passed as the handler's first argument.
    pub params: Value,
    /// Backs the handler's second argument.
    pub context: Arc<dyn HostContext>,
}

/// Executes handler code under memory and time ceilings.
#[derive(Debug)]
pub struct Sandbox {
    config: SandboxConfig,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl Sandbox {
    /// Create a sandbox with the given ceilings.
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The configured ceilings.
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Evaluate `code` (an expression yielding a function) and call it with
    /// `(params, context)`. A returned promise is driven to completion.
    ///
    /// # Errors
    ///
    /// - [`PluginError::Timeout`] when the wall-clock ceiling is hit.
    /// - [`PluginError::MemoryExceeded`] when the heap ceiling is hit.
    /// - A capability error the handler let escape, with its kind intact.
    /// - [`PluginError::Runtime`] for anything else the handler threw
    ///   (sanitized), or when the sandbox has been destroyed.
    pub async fn execute(&self, code: &str, bindings: Bindings) -> PluginResult<Value> {
        let plugin = bindings.context.plugin().to_owned();
        if self.shutdown.is_cancelled() {
            return Err(engine::destroyed_error(&plugin));
        }

        let token = self.shutdown.child_token();
        let _cancel_on_exit = token.clone().drop_guard();
        let _active = ActiveGuard::enter(&self.active);

        let timeout = self.config.timeout;
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(Instant::now);
        let invocation = engine::Invocation {
            code: code.to_owned(),
            params: bindings.params,
            host: bindings.context,
            config: self.config.clone(),
            deadline,
            token,
            handle: tokio::runtime::Handle::current(),
        };

        let span = tracing::Span::current();
        let worker = tokio::task::spawn_blocking(move || span.in_scope(|| engine::run(invocation)));

        match tokio::time::timeout(timeout.saturating_add(OUTER_GRACE), worker)
            .instrument(tracing::Span::current())
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(PluginError::Runtime {
                plugin,
                message: format!("sandbox worker failed: {join}"),
            }),
            Err(_) => {
                warn!(plugin = %plugin, "sandbox worker missed its deadline, abandoning it");
                Err(PluginError::Timeout {
                    plugin,
                    limit_ms: self.config.timeout_ms(),
                })
            },
        }
    }

    /// Cancel every in-flight execution and refuse new ones. Idempotent.
    pub fn destroy(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(
            active = self.active_executions(),
            "Destroying sandbox"
        );
        self.shutdown.cancel();
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Executions currently in flight.
    #[must_use]
    pub fn active_executions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

/// Counts an execution as active until dropped.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        debug!(active = now, "sandbox execution started");
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
