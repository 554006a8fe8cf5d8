//! Execution sandbox for packaged capabilities.
//!
//! Every invocation gets its own QuickJS runtime and context, created from
//! scratch and dropped on return. The only host surface is `log` and
//! `payload` (see `globals`). Limits:
//!
//! - wall clock: the engine interrupt handler aborts the script once the
//!   budget is spent, and `run_blocking_task` adds an outer tokio timeout;
//! - heap: `Runtime::set_memory_limit`;
//! - stack: `Runtime::set_max_stack_size`.
//!
//! Source is compiled to bytecode once per digest through `ScriptCache`;
//! every execution, including the first, loads that bytecode.

pub mod cache;
pub mod globals;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::{CatchResultExt, Context, Ctx, Function, Module, Promise, Runtime, Value};
use tracing::{debug, warn};

use crate::packager::{Digest, PackagedScript, BUNDLE_NAME};

pub use self::cache::{CompiledEntry, ScriptCache};

/// Extra time the async wrapper waits beyond the engine budget.
const BLOCKING_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("script rejected by the engine: {0}")]
    Compile(String),

    #[error("script failed: {0}")]
    Runtime(String),

    #[error("script exceeded its {}ms budget", .0.as_millis())]
    Timeout(Duration),

    #[error("script engine unavailable: {0}")]
    Engine(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    /// Heap limit in bytes.
    pub memory_limit: usize,
    /// Stack limit in bytes.
    pub max_stack: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            memory_limit: 64 * 1024 * 1024,
            max_stack: 1024 * 1024,
        }
    }
}

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Created,
    Compiled,
    GlobalsBound,
    Executed,
    ResultExtracted,
    Closed,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Created => "created",
            Stage::Compiled => "compiled",
            Stage::GlobalsBound => "globals_bound",
            Stage::Executed => "executed",
            Stage::ResultExtracted => "result_extracted",
            Stage::Closed => "closed",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks the stage reached and logs the outcome when dropped, which
/// happens after the runtime and context of the invocation are gone.
struct Invocation {
    digest: Digest,
    stage: Stage,
    started: Instant,
}

impl Invocation {
    fn new(digest: Digest) -> Self {
        Self {
            digest,
            stage: Stage::Created,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, stage: Stage) {
        debug!(digest = %self.digest.short(), "Sandbox stage: {} -> {stage}", self.stage);
        self.stage = stage;
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        let reached = self.stage;
        let outcome = if reached == Stage::ResultExtracted {
            Stage::Closed
        } else {
            Stage::Failed
        };
        debug!(
            digest = %self.digest.short(),
            "Sandbox {outcome} after {reached} in {:?}",
            self.started.elapsed()
        );
    }
}

pub struct Sandbox {
    limits: SandboxLimits,
    cache: Arc<ScriptCache>,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits, cache: Arc<ScriptCache>) -> Self {
        Self { limits, cache }
    }

    #[cfg(test)]
    pub fn cache(&self) -> &Arc<ScriptCache> {
        &self.cache
    }

    /// Runs `globalThis.transform(payload)` for the packaged script and
    /// returns its JSON-serialised result.
    pub fn run(&self, script: &PackagedScript, payload: &[u8]) -> Result<serde_json::Value, SandboxError> {
        let mut invocation = Invocation::new(script.digest);

        let payload = std::str::from_utf8(payload)
            .map_err(|e| SandboxError::Runtime(format!("payload is not valid UTF-8: {e}")))?;

        let deadline = Instant::now() + self.limits.timeout;
        let interrupted = Arc::new(AtomicBool::new(false));
        let (_runtime, context) = self.isolate(deadline, Arc::clone(&interrupted))?;

        let entry = self.compiled(script)?;
        invocation.advance(Stage::Compiled);

        let result = context.with(|ctx| execute(&ctx, &entry, script.digest, payload, &mut invocation));

        match result {
            Err(_) if interrupted.load(Ordering::SeqCst) => Err(SandboxError::Timeout(self.limits.timeout)),
            other => other,
        }
    }

    /// `run` on tokio's blocking pool, bounded by the budget plus a grace period.
    pub async fn run_blocking_task(
        self: &Arc<Self>,
        script: Arc<PackagedScript>,
        payload: Vec<u8>,
    ) -> Result<serde_json::Value, SandboxError> {
        let budget = self.limits.timeout + BLOCKING_GRACE;
        let sandbox = Arc::clone(self);
        let task = tokio::task::spawn_blocking(move || sandbox.run(&script, &payload));

        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SandboxError::Engine(format!("execution task failed: {e}"))),
            Err(_) => Err(SandboxError::Timeout(self.limits.timeout)),
        }
    }

    /// Compiles the script ahead of the first request.
    pub fn warm(&self, script: &PackagedScript) -> Result<(), SandboxError> {
        self.compiled(script).map(|_| ())
    }

    fn isolate(&self, deadline: Instant, interrupted: Arc<AtomicBool>) -> Result<(Runtime, Context), SandboxError> {
        let runtime = Runtime::new().map_err(|e| SandboxError::Engine(e.to_string()))?;
        runtime.set_memory_limit(self.limits.memory_limit);
        runtime.set_max_stack_size(self.limits.max_stack);
        runtime.set_interrupt_handler(Some(Box::new(move || {
            let expired = Instant::now() >= deadline;
            if expired {
                interrupted.store(true, Ordering::SeqCst);
            }
            expired
        })));
        let context = Context::full(&runtime).map_err(|e| SandboxError::Engine(e.to_string()))?;
        Ok((runtime, context))
    }

    /// Cached bytecode for `script`, compiling it on first use. An entry
    /// that fails validation is dropped and rebuilt.
    fn compiled(&self, script: &PackagedScript) -> Result<Arc<CompiledEntry>, SandboxError> {
        let entry = self.cache.get_or_compile(&script.digest, || compile(script))?;
        if entry.is_valid_for(&script.digest) {
            return Ok(entry);
        }

        warn!(digest = %script.digest.short(), "Cached bytecode failed validation, recompiling");
        self.cache.invalidate(&script.digest);
        let entry = self.cache.get_or_compile(&script.digest, || compile(script))?;
        if entry.is_valid_for(&script.digest) {
            Ok(entry)
        } else {
            Err(SandboxError::Engine("compiled bytecode does not match its checksum".to_string()))
        }
    }
}

/// Compiles script source to module bytecode in a throwaway runtime.
pub fn compile(script: &PackagedScript) -> Result<CompiledEntry, SandboxError> {
    let runtime = Runtime::new().map_err(|e| SandboxError::Engine(e.to_string()))?;
    let context = Context::full(&runtime).map_err(|e| SandboxError::Engine(e.to_string()))?;
    let bytecode = context.with(|ctx| {
        let module = Module::declare(ctx.clone(), BUNDLE_NAME, script.code.as_str())
            .catch(&ctx)
            .map_err(|e| SandboxError::Compile(e.to_string()))?;
        module
            .write_le()
            .map_err(|e| SandboxError::Engine(format!("cannot serialize bytecode: {e}")))
    })?;
    Ok(CompiledEntry::new(script.digest, bytecode))
}

/// Parses `code` with the engine without running it.
pub fn check_syntax(code: &str) -> Result<(), String> {
    let runtime = Runtime::new().map_err(|e| e.to_string())?;
    let context = Context::full(&runtime).map_err(|e| e.to_string())?;
    context.with(|ctx| {
        Module::declare(ctx.clone(), BUNDLE_NAME, code)
            .catch(&ctx)
            .map(|_| ())
            .map_err(|e| e.to_string())
    })
}

fn execute<'js>(
    ctx: &Ctx<'js>,
    entry: &CompiledEntry,
    digest: Digest,
    payload: &str,
    invocation: &mut Invocation,
) -> Result<serde_json::Value, SandboxError> {
    let runtime_error = |e: rquickjs::CaughtError<'js>| SandboxError::Runtime(e.to_string());

    // Safety: the bytecode was produced by `compile` with this engine version
    // and its checksum was verified against the cache entry.
    let module = unsafe { Module::load(ctx.clone(), &entry.bytecode) }
        .catch(ctx)
        .map_err(|e| SandboxError::Compile(e.to_string()))?;

    globals::bind(ctx, digest, payload)
        .catch(ctx)
        .map_err(|e| SandboxError::Engine(format!("cannot bind globals: {e}")))?;
    invocation.advance(Stage::GlobalsBound);

    let (_module, evaluated) = module.eval().catch(ctx).map_err(runtime_error)?;
    settle(ctx, &evaluated)?;

    let transform: Value = ctx.globals().get("transform").catch(ctx).map_err(runtime_error)?;
    let Some(transform) = transform.into_function() else {
        return Err(SandboxError::Runtime(
            "capability does not export a transform function".to_string(),
        ));
    };
    let output = call_transform(ctx, &transform, payload)?;
    invocation.advance(Stage::Executed);

    let json = ctx.json_stringify(output).catch(ctx).map_err(runtime_error)?;
    let value = match json {
        Some(text) => {
            let text = text.to_string().map_err(|e| SandboxError::Runtime(e.to_string()))?;
            serde_json::from_str(&text)
                .map_err(|e| SandboxError::Runtime(format!("result is not valid JSON: {e}")))?
        }
        None => serde_json::Value::Null,
    };
    invocation.advance(Stage::ResultExtracted);
    Ok(value)
}

/// Calls `transform(payload)`. A returned promise is driven to completion
/// on the context's job queue.
fn call_transform<'js>(
    ctx: &Ctx<'js>,
    transform: &Function<'js>,
    payload: &str,
) -> Result<Value<'js>, SandboxError> {
    let output: Value = transform
        .call((payload,))
        .catch(ctx)
        .map_err(|e| SandboxError::Runtime(e.to_string()))?;
    match output.as_promise() {
        Some(promise) => settle(ctx, promise),
        None => Ok(output),
    }
}

fn settle<'js>(ctx: &Ctx<'js>, promise: &Promise<'js>) -> Result<Value<'js>, SandboxError> {
    match promise.finish::<Value>() {
        Err(rquickjs::Error::WouldBlock) => Err(SandboxError::Runtime(
            "promise never settled".to_string(),
        )),
        other => other
            .catch(ctx)
            .map_err(|e| SandboxError::Runtime(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(code: &str) -> PackagedScript {
        PackagedScript::from_code(code.to_string())
    }

    fn sandbox() -> Sandbox {
        Sandbox::new(SandboxLimits::default(), Arc::new(ScriptCache::new()))
    }

    const ECHO: &str = "globalThis.transform = function (p) { const r = JSON.parse(p); return { seen: r.n + 1 }; };";

    // ── Execution ───────────────────────────────────────

    #[test]
    fn test_run_returns_json_value() {
        let out = sandbox().run(&script(ECHO), br#"{"n": 41}"#).unwrap();
        assert_eq!(out, serde_json::json!({"seen": 42}));
    }

    #[test]
    fn test_cold_and_warm_runs_match() {
        let sandbox = sandbox();
        let s = script(ECHO);
        let cold = sandbox.run(&s, br#"{"n": 1}"#).unwrap();
        let warm = sandbox.run(&s, br#"{"n": 1}"#).unwrap();
        assert_eq!(cold, warm);
        assert_eq!(sandbox.cache().compile_count(), 1);
    }

    #[test]
    fn test_undefined_result_is_null() {
        let s = script("globalThis.transform = function () {};");
        assert_eq!(sandbox().run(&s, b"").unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn test_async_transform_is_awaited() {
        let s = script("globalThis.transform = async function (p) { await null; return p.length; };");
        assert_eq!(sandbox().run(&s, b"abcd").unwrap(), serde_json::json!(4));
    }

    #[test]
    fn test_unsettled_promise_is_runtime_error() {
        let s = script("globalThis.transform = function () { return new Promise(() => {}); };");
        match sandbox().run(&s, b"").unwrap_err() {
            SandboxError::Runtime(message) => assert!(message.contains("never settled")),
            other => panic!("expected Runtime, got {other:?}"),
        }
    }

    #[test]
    fn test_fresh_context_per_run() {
        let s = script("globalThis.transform = function () { globalThis.count = (globalThis.count || 0) + 1; return globalThis.count; };");
        let sandbox = sandbox();
        assert_eq!(sandbox.run(&s, b"").unwrap(), serde_json::json!(1));
        assert_eq!(sandbox.run(&s, b"").unwrap(), serde_json::json!(1));
    }

    // ── Failures ────────────────────────────────────────

    #[test]
    fn test_missing_transform_is_runtime_error() {
        let err = sandbox().run(&script("var x = 1;"), b"").unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(_)));
    }

    #[test]
    fn test_throw_is_runtime_error() {
        let s = script("globalThis.transform = function () { throw new Error('nope'); };");
        match sandbox().run(&s, b"").unwrap_err() {
            SandboxError::Runtime(message) => assert!(message.contains("nope")),
            other => panic!("expected Runtime, got {other:?}"),
        }
    }

    #[test]
    fn test_syntax_error_is_compile_error() {
        let err = sandbox().run(&script("globalThis.transform = function ( {"), b"").unwrap_err();
        assert!(matches!(err, SandboxError::Compile(_)));
    }

    #[test]
    fn test_invalid_utf8_payload() {
        let err = sandbox().run(&script(ECHO), &[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(_)));
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let limits = SandboxLimits {
            timeout: Duration::from_millis(200),
            ..SandboxLimits::default()
        };
        let sandbox = Sandbox::new(limits, Arc::new(ScriptCache::new()));
        let s = script("globalThis.transform = function () { for (;;) {} };");
        let started = Instant::now();
        let err = sandbox.run(&s, b"").unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_memory_limit_is_enforced() {
        let limits = SandboxLimits {
            memory_limit: 4 * 1024 * 1024,
            ..SandboxLimits::default()
        };
        let sandbox = Sandbox::new(limits, Arc::new(ScriptCache::new()));
        let s = script("globalThis.transform = function () { const a = []; for (;;) a.push('x'.repeat(1024)); };");
        assert!(sandbox.run(&s, b"").is_err());
    }

    // ── Cache ───────────────────────────────────────────

    #[test]
    fn test_corrupted_cache_entry_is_rebuilt() {
        let sandbox = sandbox();
        let s = script(ECHO);
        sandbox.cache().put(s.digest, CompiledEntry::new(Digest::of(b"other"), vec![1, 2, 3]));
        let out = sandbox.run(&s, br#"{"n": 0}"#).unwrap();
        assert_eq!(out, serde_json::json!({"seen": 1}));
        assert_eq!(sandbox.cache().get(&s.digest).unwrap().digest, s.digest);
    }

    #[tokio::test]
    async fn test_concurrent_first_runs_compile_once() {
        let sandbox = Arc::new(sandbox());
        let s = Arc::new(script(ECHO));
        let runs = (0..8).map(|n| {
            let payload = format!("{{\"n\": {n}}}").into_bytes();
            sandbox.run_blocking_task(Arc::clone(&s), payload)
        });
        let results = futures::future::join_all(runs).await;
        for (n, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), serde_json::json!({"seen": n + 1}));
        }
        assert_eq!(sandbox.cache().compile_count(), 1);
    }

    // ── Syntax check ────────────────────────────────────

    #[test]
    fn test_check_syntax() {
        assert!(check_syntax(ECHO).is_ok());
        assert!(check_syntax("function (").is_err());
    }
}
