//! In-process JavaScript evaluator
//!
//! Each call gets a brand new QuickJS runtime on a dedicated thread (QuickJS
//! values are `!Send`). The global scope is pruned to the capability
//! allowlist before user code runs, then the host installs `console`,
//! `print` and the clamped timers.
//!
//! A wall-clock deadline is enforced by the engine's interrupt handler while
//! JS runs and by the timer loop while waiting, so runaway code is killed
//! instead of hanging the invocation.

pub mod capabilities;
pub mod console;
pub mod timers;

use async_trait::async_trait;
use rquickjs::function::{Opt, Rest};
use rquickjs::{
    CatchResultExt, CaughtError, Context, Ctx, Function, Object, Persistent, Runtime, Value,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use self::capabilities::{standard_scope, Capability, CapabilityScope, TimerBounds};
use self::timers::TimerQueue;
use super::Executor;
use crate::config::RunnerConfig;
use crate::errors::RuntimeLoadError;
use crate::events::EventEmitter;
use crate::result::{
    ConsoleLine, ExecutionResult, Failure, OutputBudget, Phase, StreamTag, Success,
    OUTPUT_TRUNCATED,
};

/// Native stack available to the engine
const MAX_STACK_SIZE: usize = 1024 * 1024;
/// Stack of the evaluation thread (must exceed `MAX_STACK_SIZE`)
const THREAD_STACK_SIZE: usize = 4 * 1024 * 1024;

/// Resource limits for one evaluation
#[derive(Debug, Clone, Copy)]
pub struct ScriptLimits {
    pub time_limit: Duration,
    pub memory_limit_bytes: usize,
    /// Cap on console text kept and streamed
    pub max_output_bytes: usize,
}

impl ScriptLimits {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            time_limit: config.script_time_limit(),
            memory_limit_bytes: config.script_memory_limit_mb * 1024 * 1024,
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// Executor for JavaScript evaluated inside the host process
pub struct InProcessExecutor {
    limits: ScriptLimits,
}

impl InProcessExecutor {
    pub fn new(config: &RunnerConfig) -> Self {
        Self::with_limits(ScriptLimits::from_config(config))
    }

    pub fn with_limits(limits: ScriptLimits) -> Self {
        Self { limits }
    }

    async fn evaluate(&self, source: &str, events: &EventEmitter) -> ExecutionResult {
        let source = source.to_string();
        let events = events.clone();
        let limits = self.limits;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name("coderun-js".to_string())
            .stack_size(THREAD_STACK_SIZE)
            .spawn(move || {
                let result = run_script(&source, &events, limits, standard_scope());
                if tx.send(result).is_err() {
                    warn!("Script result receiver dropped before result was sent");
                }
            });

        if let Err(e) = spawned {
            return Failure::new(Phase::Runtime, "failed to start evaluation thread", 0)
                .with_detail(format!("{:?}", e))
                .into();
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Failure::new(Phase::Runtime, "evaluation thread panicked", 0).into(),
        }
    }
}

#[async_trait]
impl Executor for InProcessExecutor {
    async fn load_runtime(&self) -> Result<(), RuntimeLoadError> {
        // The engine is linked into the host
        Ok(())
    }

    async fn execute(&self, source: &str, events: &EventEmitter) -> ExecutionResult {
        debug!("Evaluating {} bytes of JavaScript in process", source.len());

        let result = self.evaluate(source, events).await;

        info!(
            "In-process evaluation finished: success={}, killed={}, time_ms={}",
            result.is_success(),
            result.is_killed(),
            result.execution_time_ms()
        );

        events.finish(&result);
        result
    }
}

/// Why evaluation stopped early
enum ScriptError {
    Thrown {
        message: String,
        stack: Option<String>,
    },
    Interrupted,
}

/// A rejected promise that had no handler at the last check
struct PendingRejection {
    promise: Persistent<Value<'static>>,
    error: ScriptError,
}

/// State shared between the host bindings of one evaluation
struct ScriptState {
    events: EventEmitter,
    console: RefCell<Vec<ConsoleLine>>,
    budget: RefCell<OutputBudget>,
    timers: RefCell<TimerQueue<Persistent<Function<'static>>>>,
    rejections: RefCell<Vec<PendingRejection>>,
    timer_bounds: TimerBounds,
}

impl ScriptState {
    fn new(events: EventEmitter, timer_bounds: TimerBounds, max_output_bytes: usize) -> Self {
        Self {
            events,
            console: RefCell::new(Vec::new()),
            budget: RefCell::new(OutputBudget::new(max_output_bytes)),
            timers: RefCell::new(TimerQueue::new()),
            rejections: RefCell::new(Vec::new()),
            timer_bounds,
        }
    }

    /// Forward a console line and buffer it while the output cap allows
    fn record(&self, mut line: ConsoleLine) {
        let mut budget = self.budget.borrow_mut();
        if budget.is_truncated() {
            return;
        }
        let (kept, exhausted) = budget.admit(&line.text);
        let kept = kept.len();
        drop(budget);

        if !exhausted {
            self.push(line);
            return;
        }
        line.text.truncate(kept);
        if !line.text.is_empty() {
            self.push(line);
        }
        self.push(ConsoleLine::new(StreamTag::Warn, OUTPUT_TRUNCATED));
    }

    fn push(&self, line: ConsoleLine) {
        self.events.console(line.clone());
        self.console.borrow_mut().push(line);
    }

    fn take_console(&self) -> Vec<ConsoleLine> {
        std::mem::take(&mut *self.console.borrow_mut())
    }

    /// Host promise rejection tracker. A rejection is forgotten again once a
    /// handler is attached to the same promise.
    fn track_rejection<'js>(
        &self,
        ctx: &Ctx<'js>,
        promise: Value<'js>,
        reason: Value<'js>,
        is_handled: bool,
    ) {
        if is_handled {
            self.rejections.borrow_mut().retain(|rejection| {
                rejection
                    .promise
                    .clone()
                    .restore(ctx)
                    .map(|tracked| tracked != promise)
                    .unwrap_or(true)
            });
            return;
        }

        // Describing the reason can run script code, so no borrow is held
        let caught = match reason.as_exception() {
            Some(exception) => CaughtError::Exception(exception.clone()),
            None => CaughtError::Value(reason),
        };
        let error = thrown(ctx, caught);
        self.rejections.borrow_mut().push(PendingRejection {
            promise: Persistent::save(ctx, promise),
            error,
        });
    }

    /// First rejection still unhandled after a job checkpoint
    fn unhandled_rejection(&self) -> Option<ScriptError> {
        let mut pending = self.rejections.borrow_mut();
        if pending.is_empty() {
            None
        } else {
            Some(pending.remove(0).error)
        }
    }
}

/// Pins the higher-ranked signature QuickJS expects of a rejection tracker
fn rejection_tracker<F>(tracker: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Value<'js>, Value<'js>, bool) + 'static,
{
    tracker
}

/// Evaluate `source` in a fresh runtime. Runs on the evaluation thread.
fn run_script(
    source: &str,
    events: &EventEmitter,
    limits: ScriptLimits,
    scope: CapabilityScope,
) -> ExecutionResult {
    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            return Failure::new(Phase::Runtime, "failed to create script runtime", 0)
                .with_detail(e.to_string())
                .into()
        }
    };
    runtime.set_memory_limit(limits.memory_limit_bytes);
    runtime.set_max_stack_size(MAX_STACK_SIZE);

    let context = match Context::full(&runtime) {
        Ok(context) => context,
        Err(e) => {
            return Failure::new(Phase::Runtime, "failed to create script context", 0)
                .with_detail(e.to_string())
                .into()
        }
    };

    let state = Rc::new(ScriptState::new(
        events.clone(),
        scope.timer_bounds(),
        limits.max_output_bytes,
    ));
    {
        let state = state.clone();
        runtime.set_host_promise_rejection_tracker(Some(Box::new(rejection_tracker(
            move |ctx, promise, reason, is_handled| {
                state.track_rejection(&ctx, promise, reason, is_handled)
            },
        ))));
    }

    let prepared = context.with(|ctx| -> rquickjs::Result<()> {
        let _: Value = ctx.eval(scope.bootstrap_script())?;
        install_host_bindings(&ctx, &scope, &state)
    });
    if let Err(e) = prepared {
        return Failure::new(Phase::Runtime, "failed to prepare evaluation scope", 0)
            .with_detail(e.to_string())
            .into();
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let started = Instant::now();
    let deadline = started + limits.time_limit;
    {
        let interrupted = interrupted.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            if Instant::now() >= deadline {
                interrupted.store(true, Ordering::SeqCst);
                true
            } else {
                false
            }
        })));
    }

    let outcome = evaluate(&runtime, &context, &state, source, deadline, &interrupted);
    let execution_time_ms = started.elapsed().as_millis() as u64;

    // Persistent handles must be released before the runtime is dropped
    state.timers.borrow_mut().clear();
    state.rejections.borrow_mut().clear();

    match outcome {
        Ok(result_value) => Success {
            result_value: result_value.map(|value| clip_value(value, limits.max_output_bytes)),
            console_lines: state.take_console(),
            execution_time_ms,
            note: None,
            killed: false,
        }
        .into(),
        Err(ScriptError::Thrown { message, stack }) => {
            ensure_error_line(&state, &message);
            let mut failure = Failure::new(Phase::Runtime, message, execution_time_ms)
                .with_console(state.take_console());
            if let Some(stack) = stack {
                failure = failure.with_detail(stack);
            }
            failure.into()
        }
        Err(ScriptError::Interrupted) => {
            let message = format!(
                "execution exceeded the {}ms time limit",
                limits.time_limit.as_millis()
            );
            ensure_error_line(&state, &message);
            Failure::new(Phase::Runtime, message, execution_time_ms)
                .with_console(state.take_console())
                .killed()
                .into()
        }
    }
}

/// Append an error line unless the script already logged one
fn ensure_error_line(state: &ScriptState, message: &str) {
    let has_error_line = state
        .console
        .borrow()
        .iter()
        .any(|line| line.stream == StreamTag::Error);
    if !has_error_line {
        state.push(ConsoleLine::new(StreamTag::Error, message));
    }
}

/// Cut an oversized completion value down to the output cap
fn clip_value(mut value: String, max_bytes: usize) -> String {
    let (kept, exhausted) = OutputBudget::new(max_bytes).admit(&value);
    if exhausted {
        let kept = kept.len();
        value.truncate(kept);
        value.push('\n');
        value.push_str(OUTPUT_TRUNCATED);
    }
    value
}

/// Run the script body, then pending jobs and timers until both are empty
fn evaluate(
    runtime: &Runtime,
    context: &Context,
    state: &ScriptState,
    source: &str,
    deadline: Instant,
    interrupted: &AtomicBool,
) -> Result<Option<String>, ScriptError> {
    let result_value = context.with(|ctx| {
        match ctx.eval::<Value, _>(source).catch(&ctx) {
            Ok(value) if value.is_undefined() => Ok(None),
            Ok(value) => Ok(Some(console::format_value(&ctx, &value))),
            Err(caught) => Err(describe(&ctx, caught, interrupted)),
        }
    })?;

    drain_jobs(runtime, context, state, interrupted)?;

    loop {
        let next = state.timers.borrow_mut().pop_next();
        let Some(timer) = next else {
            break;
        };

        if timer.due > deadline {
            interrupted.store(true, Ordering::SeqCst);
            return Err(ScriptError::Interrupted);
        }
        let now = Instant::now();
        if timer.due > now {
            std::thread::sleep(timer.due - now);
        }

        let callback = timer.callback.clone();
        if let Some(period) = timer.repeat {
            // Requeued before firing so clearInterval inside the callback works
            state
                .timers
                .borrow_mut()
                .requeue(timer, Instant::now() + period);
        }

        context.with(|ctx| {
            let fired = callback
                .restore(&ctx)
                .and_then(|f| f.call::<_, Value>(()))
                .catch(&ctx);
            match fired {
                Ok(_) => Ok(()),
                Err(caught) => Err(describe(&ctx, caught, interrupted)),
            }
        })?;

        drain_jobs(runtime, context, state, interrupted)?;
    }

    Ok(result_value)
}

/// Run queued promise jobs, then fail on any rejection left without a handler
fn drain_jobs(
    runtime: &Runtime,
    context: &Context,
    state: &ScriptState,
    interrupted: &AtomicBool,
) -> Result<(), ScriptError> {
    while runtime.is_job_pending() {
        if runtime.execute_pending_job().is_err() {
            if interrupted.load(Ordering::SeqCst) {
                return Err(ScriptError::Interrupted);
            }
            let message = context.with(|ctx| {
                let thrown = ctx.catch();
                if thrown.is_undefined() {
                    "uncaught exception in pending job".to_string()
                } else {
                    console::format_value(&ctx, &thrown)
                }
            });
            return Err(ScriptError::Thrown {
                message,
                stack: None,
            });
        }
    }

    match state.unhandled_rejection() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn describe<'js>(ctx: &Ctx<'js>, caught: CaughtError<'js>, interrupted: &AtomicBool) -> ScriptError {
    if interrupted.load(Ordering::SeqCst) {
        return ScriptError::Interrupted;
    }
    thrown(ctx, caught)
}

/// "Name: message" plus the stack for an exception, or the formatted value
fn thrown<'js>(ctx: &Ctx<'js>, caught: CaughtError<'js>) -> ScriptError {
    match caught {
        CaughtError::Exception(exception) => {
            let name = exception
                .as_object()
                .get::<_, String>("name")
                .unwrap_or_else(|_| "Error".to_string());
            let message = match exception.message() {
                Some(message) if !message.is_empty() => format!("{}: {}", name, message),
                _ => name,
            };
            let stack = exception.stack().filter(|s| !s.trim().is_empty());
            ScriptError::Thrown { message, stack }
        }
        CaughtError::Value(value) => ScriptError::Thrown {
            message: format!("Uncaught {}", console::format_value(ctx, &value)),
            stack: None,
        },
        CaughtError::Error(error) => ScriptError::Thrown {
            message: error.to_string(),
            stack: None,
        },
    }
}

/// Install `console`, `print` and the timer functions
fn install_host_bindings<'js>(
    ctx: &Ctx<'js>,
    scope: &CapabilityScope,
    state: &Rc<ScriptState>,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    if scope.has(Capability::Console) {
        let console_object = Object::new(ctx.clone())?;
        for (method, stream) in [
            ("log", StreamTag::Log),
            ("info", StreamTag::Info),
            ("warn", StreamTag::Warn),
            ("error", StreamTag::Error),
            ("debug", StreamTag::Debug),
        ] {
            console_object.set(method, console_function(ctx, state, stream)?)?;
        }
        globals.set("console", console_object)?;
        globals.set("print", console_function(ctx, state, StreamTag::Log)?)?;
    }

    if scope.has(Capability::Timers) {
        let timers = state.clone();
        let set_timeout = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, callback: Function<'js>, delay: Opt<f64>| -> u32 {
                let delay = timers.timer_bounds.clamp_delay(delay.0.unwrap_or(0.0));
                let callback = Persistent::save(&ctx, callback);
                timers
                    .timers
                    .borrow_mut()
                    .schedule(callback, Instant::now(), delay, None)
            },
        )?;
        globals.set("setTimeout", set_timeout)?;

        let timers = state.clone();
        let set_interval = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, callback: Function<'js>, interval: Opt<f64>| -> u32 {
                let period = timers.timer_bounds.clamp_interval(interval.0.unwrap_or(0.0));
                let callback = Persistent::save(&ctx, callback);
                timers
                    .timers
                    .borrow_mut()
                    .schedule(callback, Instant::now(), period, Some(period))
            },
        )?;
        globals.set("setInterval", set_interval)?;

        for name in ["clearTimeout", "clearInterval"] {
            let timers = state.clone();
            let clear = Function::new(ctx.clone(), move |id: Opt<Value<'js>>| {
                if let Some(id) = id.0.and_then(|v| v.as_number()) {
                    timers.timers.borrow_mut().cancel(id as u32);
                }
            })?;
            globals.set(name, clear)?;
        }
    }

    Ok(())
}

fn console_function<'js>(
    ctx: &Ctx<'js>,
    state: &Rc<ScriptState>,
    stream: StreamTag,
) -> rquickjs::Result<Function<'js>> {
    let state = state.clone();
    Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
        let text = console::format_args(&ctx, &args.0);
        state.record(ConsoleLine::new(stream, text));
    })
}
