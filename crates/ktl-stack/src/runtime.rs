use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::helm::HelmDriver;
use crate::kube::KubeApi;

/// Wall-clock source. Injected so tests can pin time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Cooperative cancellation flag shared between the scheduler and workers.
///
/// Workers observe it at suspension points (between phases, between
/// readiness polls, around subprocess waits) and abort promptly.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Human-facing progress sink, separate from the structured event stream.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter that discards everything; for embedding and tests.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Everything a component needs from the outside world, passed explicitly.
///
/// There is no global configuration: the clock, the drivers, and the
/// reporter all arrive through this context so tests can substitute fakes
/// wholesale.
#[derive(Clone)]
pub struct RuntimeContext {
    pub clock: Arc<dyn Clock>,
    pub helm: Arc<dyn HelmDriver>,
    pub kube: Arc<dyn KubeApi>,
    pub reporter: Arc<Mutex<dyn Reporter + Send>>,
    /// Version string of the running ktl binary.
    pub ktl_version: String,
    /// Commit the running ktl binary was built from, when known.
    pub ktl_commit: Option<String>,
}

impl RuntimeContext {
    pub fn new(helm: Arc<dyn HelmDriver>, kube: Arc<dyn KubeApi>) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            helm,
            kube,
            reporter: Arc::new(Mutex::new(NullReporter)),
            ktl_version: env!("CARGO_PKG_VERSION").to_string(),
            ktl_commit: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<Mutex<dyn Reporter + Send>>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn info(&self, msg: &str) {
        if let Ok(mut reporter) = self.reporter.lock() {
            reporter.info(msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        if let Ok(mut reporter) = self.reporter.lock() {
            reporter.warn(msg);
        }
    }

    pub fn error(&self, msg: &str) {
        if let Ok(mut reporter) = self.reporter.lock() {
            reporter.error(msg);
        }
    }
}
