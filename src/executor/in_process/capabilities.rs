//! Capability allowlist for in-process evaluation
//!
//! The evaluation scope is built from an explicit set of capabilities. Every
//! global binding not named here is removed before user code runs, so the
//! trust boundary is exactly what `standard_scope()` returns.

use std::collections::BTreeSet;
use std::time::Duration;

/// Minimum interval accepted by `setInterval`
pub const MIN_INTERVAL_MS: u64 = 100;
/// Maximum delay accepted by `setTimeout`
pub const MAX_TIMEOUT_MS: u64 = 5_000;

/// A group of global bindings exposed to evaluated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Math,
    Json,
    Strings,
    Numbers,
    Collections,
    Dates,
    RegExps,
    Errors,
    UriCoding,
    Promises,
    /// Host-provided `console` and `print`
    Console,
    /// Host-provided clamped timers
    Timers,
}

impl Capability {
    /// Global names this capability keeps in scope
    pub fn bindings(self) -> &'static [&'static str] {
        match self {
            Capability::Math => &["Math"],
            Capability::Json => &["JSON"],
            Capability::Strings => &["String"],
            Capability::Numbers => &[
                "Number",
                "Boolean",
                "BigInt",
                "parseInt",
                "parseFloat",
                "isNaN",
                "isFinite",
                "NaN",
                "Infinity",
            ],
            Capability::Collections => &["Array", "Object", "Map", "Set", "WeakMap", "WeakSet", "Symbol"],
            Capability::Dates => &["Date"],
            Capability::RegExps => &["RegExp"],
            Capability::Errors => &[
                "Error",
                "TypeError",
                "RangeError",
                "SyntaxError",
                "ReferenceError",
                "EvalError",
                "URIError",
                "AggregateError",
            ],
            Capability::UriCoding => &[
                "encodeURI",
                "decodeURI",
                "encodeURIComponent",
                "decodeURIComponent",
            ],
            Capability::Promises => &["Promise"],
            Capability::Console => &["console", "print"],
            Capability::Timers => &["setTimeout", "setInterval", "clearTimeout", "clearInterval"],
        }
    }

    /// Whether the host installs this capability (as opposed to the engine)
    pub fn is_host_provided(self) -> bool {
        matches!(self, Capability::Console | Capability::Timers)
    }
}

/// Bindings that always survive pruning
const ALWAYS_KEPT: &[&str] = &["globalThis", "undefined"];

/// Bounds applied to timer arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerBounds {
    pub min_interval: Duration,
    pub max_delay: Duration,
}

impl Default for TimerBounds {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(MIN_INTERVAL_MS),
            max_delay: Duration::from_millis(MAX_TIMEOUT_MS),
        }
    }
}

impl TimerBounds {
    /// Clamp a `setTimeout` delay into `[0, max_delay]`
    pub fn clamp_delay(&self, delay_ms: f64) -> Duration {
        millis(delay_ms).min(self.max_delay)
    }

    /// Clamp a `setInterval` period up to at least `min_interval`
    pub fn clamp_interval(&self, interval_ms: f64) -> Duration {
        millis(interval_ms).max(self.min_interval)
    }
}

fn millis(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_millis(value as u64)
    } else {
        Duration::ZERO
    }
}

/// Enumerated set of permitted bindings for one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityScope {
    capabilities: BTreeSet<Capability>,
    timer_bounds: TimerBounds,
}

/// The scope every in-process evaluation runs with
pub fn standard_scope() -> CapabilityScope {
    CapabilityScope::new(
        [
            Capability::Math,
            Capability::Json,
            Capability::Strings,
            Capability::Numbers,
            Capability::Collections,
            Capability::Dates,
            Capability::RegExps,
            Capability::Errors,
            Capability::UriCoding,
            Capability::Promises,
            Capability::Console,
            Capability::Timers,
        ],
        TimerBounds::default(),
    )
}

impl CapabilityScope {
    pub fn new(
        capabilities: impl IntoIterator<Item = Capability>,
        timer_bounds: TimerBounds,
    ) -> Self {
        Self {
            capabilities: capabilities.into_iter().collect(),
            timer_bounds,
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn timer_bounds(&self) -> TimerBounds {
        self.timer_bounds
    }

    /// Every global name allowed to exist once the scope is built
    pub fn globals(&self) -> BTreeSet<&'static str> {
        self.capabilities
            .iter()
            .flat_map(|c| c.bindings().iter().copied())
            .chain(ALWAYS_KEPT.iter().copied())
            .collect()
    }

    pub fn allows(&self, name: &str) -> bool {
        self.globals().contains(name)
    }

    /// Allowed names the engine itself must supply
    pub fn engine_globals(&self) -> BTreeSet<&'static str> {
        self.capabilities
            .iter()
            .filter(|c| !c.is_host_provided())
            .flat_map(|c| c.bindings().iter().copied())
            .chain(ALWAYS_KEPT.iter().copied())
            .collect()
    }

    /// Script that prunes the engine's globals down to the allowlist.
    ///
    /// Runs before host bindings are installed, so an engine binding that
    /// shares a name with a host capability is removed too. It also detaches
    /// the `constructor` of every function prototype so code cannot rebuild
    /// `Function` from a closure.
    pub fn bootstrap_script(&self) -> String {
        let allowed = self
            .engine_globals()
            .iter()
            .map(|name| format!("{:?}", name))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            r#"(function (allowed) {{
    const detach = (proto) => Object.defineProperty(proto, "constructor", {{
        value: undefined, configurable: false, writable: false
    }});
    detach(Function.prototype);
    detach(Object.getPrototypeOf(async function () {{}}));
    detach(Object.getPrototypeOf(function* () {{}}));
    detach(Object.getPrototypeOf(async function* () {{}}));
    for (const name of Object.getOwnPropertyNames(globalThis)) {{
        if (!allowed.includes(name)) {{
            try {{ delete globalThis[name]; }} catch (_) {{ globalThis[name] = undefined; }}
        }}
    }}
}})([{}]);
"#,
            allowed
        )
    }
}
