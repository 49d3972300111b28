//! PAC execution bridge.
//!
//! # Responsibility
//! - Host one PAC script in an embedded QuickJS context together with the
//!   standard PAC helper library and native `dnsResolve` / `myIpAddress`.
//! - Call `FindProxyForURL(url, host)` and return its string result.
//!
//! # Invariants
//! - Every script execution (top-level evaluation and each call) runs under
//!   an interrupt deadline and the runtime's memory limit.
//! - Script failures never escape as panics; callers see `None` / `DIRECT`.
//! - Script text and results are never logged, only sizes and outcomes.
//!
//! # See also
//! - `pac::directives` for translating results into candidate URLs.

pub mod directives;

pub use directives::parse_directives;

use crate::dns::{HostResolver, SystemResolver};
use crate::logging::sanitize_message;
use log::{debug, warn};
use rquickjs::{CatchResultExt, Context, Function, Runtime, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PAC_UTILS: &str = include_str!("pac_utils.js");
const ENTRY_POINT: &str = "FindProxyForURL";
const MAX_ERROR_CHARS: usize = 200;

pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_SCRIPT_MEMORY_LIMIT: usize = 32 * 1024 * 1024;
pub const DIRECT_RESULT: &str = "DIRECT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacError {
    /// Script failed to parse or threw during top-level evaluation.
    ScriptFailure(String),
    /// Script evaluated but defines no callable `FindProxyForURL`.
    MissingEntryPoint,
    /// Embedded engine could not be created or configured.
    Runtime(String),
}

impl Display for PacError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScriptFailure(message) => write!(f, "PAC script failed: {message}"),
            Self::MissingEntryPoint => write!(f, "PAC script does not define {ENTRY_POINT}"),
            Self::Runtime(message) => write!(f, "PAC runtime error: {message}"),
        }
    }
}

impl Error for PacError {}

impl From<rquickjs::Error> for PacError {
    fn from(err: rquickjs::Error) -> Self {
        Self::Runtime(sanitize_message(&err.to_string(), MAX_ERROR_CHARS))
    }
}

pub type PacResult<T> = Result<T, PacError>;

/// Resource bounds for one script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacLimits {
    pub timeout: Duration,
    pub memory_limit: usize,
}

impl Default for PacLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SCRIPT_TIMEOUT,
            memory_limit: DEFAULT_SCRIPT_MEMORY_LIMIT,
        }
    }
}

const DISARMED: u64 = u64::MAX;

/// Execution deadline polled by the engine's interrupt handler.
struct Deadline {
    origin: Instant,
    expires_at_ms: AtomicU64,
    tripped: AtomicBool,
}

impl Deadline {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            expires_at_ms: AtomicU64::new(DISARMED),
            tripped: AtomicBool::new(false),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn arm(&self, budget: Duration) {
        let budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX - 1);
        let expires = self.elapsed_ms().saturating_add(budget_ms).min(DISARMED - 1);
        self.tripped.store(false, Ordering::SeqCst);
        self.expires_at_ms.store(expires, Ordering::SeqCst);
    }

    fn disarm(&self) -> bool {
        self.expires_at_ms.store(DISARMED, Ordering::SeqCst);
        self.tripped.swap(false, Ordering::SeqCst)
    }

    fn expired(&self) -> bool {
        let expires = self.expires_at_ms.load(Ordering::SeqCst);
        if expires != DISARMED && self.elapsed_ms() >= expires {
            self.tripped.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }
}

/// One compiled PAC script in its own engine instance.
pub struct PacRunner {
    context: Context,
    _runtime: Runtime,
    deadline: Arc<Deadline>,
    limits: PacLimits,
}

impl PacRunner {
    /// Creates a fresh engine, installs the helpers and evaluates `script`.
    ///
    /// # Errors
    /// - [`PacError::Runtime`] when the engine cannot be created.
    /// - [`PacError::ScriptFailure`] when the script fails to evaluate or
    ///   exceeds its execution budget.
    /// - [`PacError::MissingEntryPoint`] when `FindProxyForURL` is absent.
    pub fn new(
        script: &str,
        resolver: Arc<dyn HostResolver>,
        limits: PacLimits,
    ) -> PacResult<Self> {
        let started_at = Instant::now();
        let runtime = Runtime::new()?;
        runtime.set_memory_limit(limits.memory_limit);

        let deadline = Arc::new(Deadline::new());
        let handler_deadline = Arc::clone(&deadline);
        runtime.set_interrupt_handler(Some(Box::new(move || handler_deadline.expired())));

        let context = Context::full(&runtime)?;
        install_natives(&context, resolver)?;

        deadline.arm(limits.timeout);
        let evaluated = context.with(|ctx| -> PacResult<bool> {
            ctx.eval::<Value, _>(PAC_UTILS)
                .catch(&ctx)
                .map_err(|err| PacError::Runtime(sanitize_message(&err.to_string(), MAX_ERROR_CHARS)))?;
            ctx.eval::<Value, _>(script)
                .catch(&ctx)
                .map_err(|err| {
                    PacError::ScriptFailure(sanitize_message(&err.to_string(), MAX_ERROR_CHARS))
                })?;

            let entry: Value = ctx.globals().get(ENTRY_POINT)?;
            Ok(entry.is_function())
        });
        let timed_out = deadline.disarm();

        let has_entry_point = match evaluated {
            Ok(has_entry_point) => has_entry_point,
            Err(PacError::ScriptFailure(_)) if timed_out => {
                return Err(PacError::ScriptFailure(
                    "script evaluation exceeded its execution budget".to_string(),
                ))
            }
            Err(err) => {
                warn!(
                    "event=pac_compile module=pac status=error bytes={} duration_ms={} error={}",
                    script.len(),
                    started_at.elapsed().as_millis(),
                    err
                );
                return Err(err);
            }
        };
        if !has_entry_point {
            warn!(
                "event=pac_compile module=pac status=error bytes={} reason=missing_entry_point",
                script.len()
            );
            return Err(PacError::MissingEntryPoint);
        }

        debug!(
            "event=pac_compile module=pac status=ok bytes={} duration_ms={}",
            script.len(),
            started_at.elapsed().as_millis()
        );
        Ok(Self {
            context,
            _runtime: runtime,
            deadline,
            limits,
        })
    }

    pub fn limits(&self) -> PacLimits {
        self.limits
    }

    /// Calls `FindProxyForURL(url, host)`.
    ///
    /// Returns `None` on exception, timeout, non-string or blank result.
    pub fn find_proxy(&self, url: &str, host: &str) -> Option<String> {
        let started_at = Instant::now();
        // One deadline per call; `with` serializes callers.
        let (outcome, timed_out) = self.context.with(|ctx| {
            self.deadline.arm(self.limits.timeout);
            let outcome = (|| -> Result<Option<String>, String> {
                let entry: Function = ctx
                    .globals()
                    .get(ENTRY_POINT)
                    .map_err(|err| err.to_string())?;
                let result: Value = entry
                    .call((url.to_string(), host.to_string()))
                    .catch(&ctx)
                    .map_err(|err| err.to_string())?;

                match result.as_string() {
                    Some(text) => text.to_string().map(Some).map_err(|err| err.to_string()),
                    None => Ok(None),
                }
            })();
            (outcome, self.deadline.disarm())
        });

        let status = match &outcome {
            Ok(Some(text)) if !text.trim().is_empty() => "ok",
            Ok(_) => "empty",
            Err(_) if timed_out => "timeout",
            Err(_) => "error",
        };
        match &outcome {
            Err(err) => warn!(
                "event=pac_eval module=pac status={} duration_ms={} error={}",
                status,
                started_at.elapsed().as_millis(),
                sanitize_message(err, MAX_ERROR_CHARS)
            ),
            Ok(_) => debug!(
                "event=pac_eval module=pac status={} duration_ms={}",
                status,
                started_at.elapsed().as_millis()
            ),
        }

        outcome
            .ok()
            .flatten()
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
    }
}

fn install_natives(context: &Context, resolver: Arc<dyn HostResolver>) -> PacResult<()> {
    context.with(|ctx| -> PacResult<()> {
        let globals = ctx.globals();

        let lookup = Arc::clone(&resolver);
        globals.set(
            "__pacResolve",
            Function::new(ctx.clone(), move |host: String| -> Option<String> {
                lookup.resolve(&host).map(|addr| addr.to_string())
            })?,
        )?;

        let local = resolver;
        globals.set(
            "myIpAddress",
            Function::new(ctx.clone(), move || -> String {
                local
                    .local_address()
                    .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
                    .to_string()
            })?,
        )?;
        Ok(())
    })
}

/// One-shot evaluation with the system resolver and default limits.
///
/// Any failure yields `"DIRECT"`.
pub fn evaluate(script: &str, url: &str, host: &str) -> String {
    PacRunner::new(script, Arc::new(SystemResolver::default()), PacLimits::default())
        .ok()
        .and_then(|runner| runner.find_proxy(url, host))
        .unwrap_or_else(|| DIRECT_RESULT.to_string())
}

#[cfg(test)]
mod tests {
    use super::{evaluate, PacError, PacLimits, PacRunner};
    use crate::dns::HostResolver;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    struct FixedResolver {
        hosts: HashMap<&'static str, IpAddr>,
    }

    impl HostResolver for FixedResolver {
        fn resolve(&self, host: &str) -> Option<IpAddr> {
            self.hosts.get(host).copied()
        }

        fn local_address(&self) -> Option<IpAddr> {
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
        }
    }

    fn resolver() -> Arc<dyn HostResolver> {
        Arc::new(FixedResolver {
            hosts: HashMap::from([("intranet.corp", IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)))]),
        })
    }

    fn runner(script: &str) -> PacRunner {
        PacRunner::new(script, resolver(), PacLimits::default()).expect("script should compile")
    }

    #[test]
    fn constant_script_returns_its_directive() {
        let runner = runner("function FindProxyForURL(url, host) { return 'PROXY 1.2.3.4:8080'; }");
        assert_eq!(
            runner.find_proxy("http://example.com/", "example.com").as_deref(),
            Some("PROXY 1.2.3.4:8080")
        );
    }

    #[test]
    fn throwing_script_yields_none_and_direct() {
        let script = "function FindProxyForURL(url, host) { throw new Error('boom'); }";
        assert_eq!(runner(script).find_proxy("http://a/", "a"), None);
        assert_eq!(evaluate(script, "http://a/", "a"), "DIRECT");
    }

    #[test]
    fn compile_errors_are_classified() {
        let broken = PacRunner::new("function (", resolver(), PacLimits::default());
        assert!(matches!(broken, Err(PacError::ScriptFailure(_))));

        let missing = PacRunner::new("var x = 1;", resolver(), PacLimits::default());
        assert!(matches!(missing, Err(PacError::MissingEntryPoint)));
    }

    #[test]
    fn helpers_and_natives_are_available() {
        let runner = runner(
            r#"
            function FindProxyForURL(url, host) {
              if (isPlainHostName(host)) return "DIRECT";
              if (isInNet(host, "10.0.0.0", "255.0.0.0")) return "PROXY inner:3128";
              if (shExpMatch(host, "*.example.?om")) return "SOCKS5 socks:1080";
              if (dnsDomainIs(host, ".org") && dnsDomainLevels(host) == 2) return "HTTPS tls:443";
              if (localHostOrDomainIs(host, "www.test.net")) return "PROXY local:1";
              return "PROXY " + myIpAddress() + ":8080";
            }
            "#,
        );
        assert_eq!(runner.find_proxy("http://intranet/", "intranet").as_deref(), Some("DIRECT"));
        assert_eq!(
            runner.find_proxy("http://intranet.corp/", "intranet.corp").as_deref(),
            Some("PROXY inner:3128")
        );
        assert_eq!(
            runner.find_proxy("http://a.example.com/", "a.example.com").as_deref(),
            Some("SOCKS5 socks:1080")
        );
        assert_eq!(
            runner.find_proxy("http://www.gnu.org/", "www.gnu.org").as_deref(),
            Some("HTTPS tls:443")
        );
        assert_eq!(runner.find_proxy("http://www/", "www").as_deref(), Some("DIRECT"));
        assert_eq!(
            runner.find_proxy("http://other.net/", "other.net").as_deref(),
            Some("PROXY 192.168.1.20:8080")
        );
    }

    #[test]
    fn unresolvable_hosts_are_not_in_net() {
        let runner = runner(
            "function FindProxyForURL(u, h) { return isResolvable(h) + ' ' + isInNet(h, '10.0.0.0', '255.0.0.0'); }",
        );
        assert_eq!(runner.find_proxy("http://x.y/", "x.y").as_deref(), Some("false false"));
    }

    #[test]
    fn time_helpers_accept_full_ranges() {
        let runner = runner(
            "function FindProxyForURL(u, h) { return String(weekdayRange('SUN', 'SAT') && timeRange(0, 0, 0, 23, 59, 59) && dateRange('JAN', 'DEC') && !weekdayRange('FOO')); }",
        );
        assert_eq!(runner.find_proxy("http://a/", "a").as_deref(), Some("true"));
    }

    #[test]
    fn runaway_script_is_interrupted() {
        let limits = PacLimits {
            timeout: Duration::from_millis(50),
            ..PacLimits::default()
        };
        let runner = PacRunner::new(
            "function FindProxyForURL(u, h) { while (true) {} }",
            resolver(),
            limits,
        )
        .expect("script should compile");

        let started_at = Instant::now();
        assert_eq!(runner.find_proxy("http://a/", "a"), None);
        assert!(started_at.elapsed() < Duration::from_secs(5));

        let looping_top_level = PacRunner::new("while (true) {}", resolver(), limits);
        assert!(matches!(looping_top_level, Err(PacError::ScriptFailure(_))));
    }

    #[test]
    fn non_string_results_are_ignored() {
        assert_eq!(runner("function FindProxyForURL(u, h) { return 42; }").find_proxy("http://a/", "a"), None);
        assert_eq!(runner("function FindProxyForURL(u, h) { return '  '; }").find_proxy("http://a/", "a"), None);
    }
}
