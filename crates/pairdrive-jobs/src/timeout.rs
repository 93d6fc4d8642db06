//! Request-duration telemetry for timeout detection
//!
//! A process-wide helper accumulates per-request durations binned by a
//! configured precision. When the count of outlier durations inside a rolling
//! window exceeds a threshold, the network layer classifies subsequent
//! failures as `NetworkTimeout` instead of generic network errors.
//!
//! The detector is one of the two pieces of process-wide state in the system
//! (the other being the logging target); both have explicit init/teardown.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tracing::debug;

/// Configuration for the detector
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Durations are rounded down to a multiple of this before counting.
    pub precision: Duration,
    /// A request slower than this is an outlier.
    pub outlier_bound: Duration,
    /// Number of recent requests kept in the rolling window.
    pub window: usize,
    /// Outliers within the window before failures classify as timeouts.
    pub threshold: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            precision: Duration::from_millis(500),
            outlier_bound: Duration::from_secs(10),
            window: 50,
            threshold: 5,
        }
    }
}

/// Rolling-window outlier counter
#[derive(Debug)]
pub struct TimeoutDetector {
    config: TimeoutConfig,
    samples: Mutex<VecDeque<Duration>>,
}

impl TimeoutDetector {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Records one request duration, binned by the configured precision.
    pub fn record(&self, duration: Duration) {
        let precision = self.config.precision.as_millis().max(1) as u64;
        let binned = Duration::from_millis((duration.as_millis() as u64 / precision) * precision);

        let mut samples = self.samples.lock().expect("timeout detector poisoned");
        samples.push_back(binned);
        while samples.len() > self.config.window {
            samples.pop_front();
        }
    }

    /// True when enough recent requests ran long that failures should be
    /// reported as timeouts.
    pub fn is_timing_out(&self) -> bool {
        let samples = self.samples.lock().expect("timeout detector poisoned");
        let outliers = samples
            .iter()
            .filter(|d| **d >= self.config.outlier_bound)
            .count();
        outliers >= self.config.threshold
    }

    pub fn reset(&self) {
        self.samples
            .lock()
            .expect("timeout detector poisoned")
            .clear();
    }
}

static INSTANCE: OnceLock<Mutex<Option<Arc<TimeoutDetector>>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<Arc<TimeoutDetector>>> {
    INSTANCE.get_or_init(|| Mutex::new(None))
}

/// Installs the process-wide detector.
pub fn init(config: TimeoutConfig) {
    let mut guard = slot().lock().expect("timeout slot poisoned");
    *guard = Some(Arc::new(TimeoutDetector::new(config)));
    debug!("Timeout detector initialized");
}

/// Returns the installed detector, if any.
pub fn instance() -> Option<Arc<TimeoutDetector>> {
    slot().lock().expect("timeout slot poisoned").clone()
}

/// Removes the process-wide detector.
pub fn teardown() {
    let mut guard = slot().lock().expect("timeout slot poisoned");
    *guard = None;
    debug!("Timeout detector torn down");
}
