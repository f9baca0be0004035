//! Isolated evaluation of script-authored pipelines.
//!
//! Each evaluation gets a brand-new QuickJS runtime with no host bindings:
//! no module loader, no `std`/`os` objects, no filesystem or network. Only the
//! JSON text produced by `JSON.stringify` crosses back into Rust. The runtime
//! is dropped when evaluation ends, whether it returned, threw or was
//! interrupted.

use crate::error::TranslateError;
use rquickjs::{Context, Ctx, Runtime};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Cooperative cancellation shared between a request and its translations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub memory_limit_bytes: usize,
    pub max_stack_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            memory_limit_bytes: 32 * 1024 * 1024,
            max_stack_bytes: 512 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    /// Evaluates `script` as a zero-argument function expression and returns
    /// the JSON text of the value it produces.
    pub fn evaluate(&self, script: &str, cancel: &CancelFlag) -> Result<String, TranslateError> {
        if cancel.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }

        let started = Instant::now();
        let deadline = started + self.limits.timeout;
        let outcome = self.run(script, deadline, cancel);
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "sandbox evaluation finished");

        match outcome {
            Ok(json) => Ok(json),
            Err(_) if cancel.is_cancelled() => Err(TranslateError::Cancelled),
            Err(_) if Instant::now() >= deadline => {
                warn!(budget_ms = self.budget_ms(), "sandbox evaluation exceeded its budget");
                Err(TranslateError::SandboxTimeout {
                    budget_ms: self.budget_ms(),
                })
            }
            Err(err) => Err(err),
        }
    }

    fn budget_ms(&self) -> u64 {
        u64::try_from(self.limits.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    fn run(
        &self,
        script: &str,
        deadline: Instant,
        cancel: &CancelFlag,
    ) -> Result<String, TranslateError> {
        let runtime = Runtime::new().map_err(runtime_error)?;
        runtime.set_memory_limit(self.limits.memory_limit_bytes);
        runtime.set_max_stack_size(self.limits.max_stack_bytes);

        let flag = cancel.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            flag.is_cancelled() || Instant::now() >= deadline
        })));

        let context = Context::full(&runtime).map_err(runtime_error)?;
        let source = wrap_script(script);

        context.with(|ctx| match ctx.eval::<Option<String>, _>(source) {
            Ok(Some(json)) => Ok(json),
            Ok(None) => Err(TranslateError::SandboxEvaluation(
                "query function did not return a JSON-serializable value".to_string(),
            )),
            Err(rquickjs::Error::Exception) => {
                Err(TranslateError::SandboxEvaluation(exception_message(&ctx)))
            }
            Err(err) => Err(TranslateError::SandboxEvaluation(err.to_string())),
        })
    }
}

fn wrap_script(script: &str) -> String {
    format!("const fn = {script}\nconst result = fn()\nJSON.stringify(result)")
}

fn exception_message(ctx: &Ctx<'_>) -> String {
    let thrown = ctx.catch();
    if let Some(exception) = thrown.as_exception() {
        return exception
            .message()
            .unwrap_or_else(|| "uncaught exception".to_string());
    }
    if let Some(text) = thrown.as_string() {
        if let Ok(text) = text.to_string() {
            return text;
        }
    }
    "uncaught exception".to_string()
}

fn runtime_error(err: rquickjs::Error) -> TranslateError {
    TranslateError::SandboxEvaluation(format!("failed to start script runtime: {err}"))
}
