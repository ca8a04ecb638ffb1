//! Health monitoring and failure prediction
//!
//! Each module boundary keeps a bounded rolling window per
//! [`MetricCategory`], summarized as mean, variance and least-squares trend.
//! [`HealthMonitor::predict`] scores the latest summaries through a
//! [`ScoringModel`] and maps the failure probability onto a [`HealthStatus`].
//!
//! # Hot path
//!
//! Transactions never wait on the monitor. They hand samples over with
//! [`HealthMonitor::submit`], a non-blocking channel send that drops the
//! sample when the channel is full, and read predictions with
//! [`HealthMonitor::prediction`], which gives up instead of waiting when the
//! table is locked. The background loops started by
//! [`HealthMonitor::spawn`] drain the channel and refresh predictions.
//!
//! # Learning
//!
//! Observed outcomes arrive through the same channel and nudge the model
//! off the hot path. Outcomes that contradict the last prediction are kept
//! in a bounded misprediction log for offline retraining.

use crate::config::HealthConfig;
use crate::event::{EventBus, HealthEvent};
use crate::model::ScoringModel;
use crate::recovery::ErrorCategory;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use hotswap_core::{Clock, ModuleId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Number of features scored by the failure model
pub const FEATURE_COUNT: usize = 4;

/// Kind of metric tracked per module boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricCategory {
    /// 1.0 per failed call, 0.0 per successful call
    ErrorRate,
    /// Milliseconds
    Latency,
    /// Fraction of the module's budget in use
    ResourceUsage,
    /// 1.0 per call that hit a conflict, 0.0 otherwise
    ConflictDensity,
}

/// Predicted health, from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Critical,
    Failing,
}

impl HealthStatus {
    /// Status for a failure probability
    pub fn from_probability(p: f64) -> Self {
        if p < 0.3 {
            HealthStatus::Healthy
        } else if p < 0.6 {
            HealthStatus::Degraded
        } else if p < 0.85 {
            HealthStatus::Critical
        } else {
            HealthStatus::Failing
        }
    }
}

/// Statistical summary of one metric window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub category: MetricCategory,
    pub latest: f64,
    pub mean: f64,
    pub variance: f64,
    /// Least-squares slope, units per second
    pub trend: f64,
    pub samples: usize,
}

#[derive(Debug, Clone)]
struct MetricSeries {
    samples: VecDeque<(u64, f64)>,
    capacity: usize,
}

impl MetricSeries {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, at: u64, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, value));
    }

    fn summary(&self, category: MetricCategory) -> MetricSummary {
        let n = self.samples.len();
        let latest = self.samples.back().map_or(0.0, |(_, v)| *v);
        if n == 0 {
            return MetricSummary {
                category,
                latest,
                mean: 0.0,
                variance: 0.0,
                trend: 0.0,
                samples: 0,
            };
        }

        let nf = n as f64;
        let mean = self.samples.iter().map(|(_, v)| v).sum::<f64>() / nf;
        let variance = self
            .samples
            .iter()
            .map(|(_, v)| (v - mean).powi(2))
            .sum::<f64>()
            / nf;

        let origin = self.samples.front().map_or(0, |(t, _)| *t);
        let secs = |t: u64| t.saturating_sub(origin) as f64 / 1_000_000.0;
        let mean_t = self.samples.iter().map(|(t, _)| secs(*t)).sum::<f64>() / nf;
        let (mut num, mut den) = (0.0, 0.0);
        for (t, v) in &self.samples {
            let dt = secs(*t) - mean_t;
            num += dt * (v - mean);
            den += dt * dt;
        }
        let trend = if den > f64::EPSILON { num / den } else { 0.0 };

        MetricSummary {
            category,
            latest,
            mean,
            variance,
            trend,
            samples: n,
        }
    }
}

/// Forward-looking risk for a module boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePrediction {
    pub module: ModuleId,
    pub status: HealthStatus,
    pub failure_probability: f64,
    pub confidence: f64,
    /// Estimated time until the error rate reaches 100%
    pub time_to_failure_ms: Option<u64>,
    /// Predictions below the confidence floor must not drive decisions
    pub valid: bool,
    pub features: Vec<f64>,
    pub at: u64,
}

/// Health snapshot handed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleHealth {
    pub module: ModuleId,
    pub status: HealthStatus,
    pub prediction: Option<FailurePrediction>,
    pub message: String,
    pub most_common_error: Option<ErrorCategory>,
    pub metrics: Vec<MetricSummary>,
}

/// An outcome the last prediction got wrong
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Misprediction {
    pub module: ModuleId,
    pub predicted: HealthStatus,
    pub failure_probability: f64,
    pub failed: bool,
    pub features: Vec<f64>,
    pub at: u64,
}

/// Input accepted by the monitor channel
#[derive(Debug, Clone, PartialEq)]
pub enum HealthSignal {
    Metric {
        module: ModuleId,
        category: MetricCategory,
        value: f64,
        at: u64,
    },
    /// Whether a call against the module ended in failure
    Outcome { module: ModuleId, failed: bool },
    /// An error of `category` was reported for the module
    Error {
        module: ModuleId,
        category: ErrorCategory,
    },
}

#[derive(Debug, Default)]
struct BoundaryHealth {
    series: BTreeMap<MetricCategory, MetricSeries>,
    prediction: Option<FailurePrediction>,
    status: HealthStatus,
    errors: BTreeMap<ErrorCategory, u64>,
}

impl BoundaryHealth {
    fn most_common_error(&self) -> Option<ErrorCategory> {
        self.errors
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(category, _)| *category)
    }
}

/// Per-module health tracking and failure prediction
pub struct HealthMonitor {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    model: Arc<dyn ScoringModel>,
    events: Arc<EventBus>,
    boundaries: RwLock<HashMap<ModuleId, BoundaryHealth>>,
    tx: Sender<HealthSignal>,
    rx: Receiver<HealthSignal>,
    mispredictions: Mutex<VecDeque<Misprediction>>,
    dropped: AtomicU64,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        model: Arc<dyn ScoringModel>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        let (tx, rx) = bounded(config.channel_capacity);
        Self {
            config,
            clock,
            model,
            events,
            boundaries: RwLock::new(HashMap::new()),
            tx,
            rx,
            mispredictions: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a signal without blocking; returns false if it was dropped
    pub fn submit(&self, signal: HealthSignal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Queue a metric sample stamped with the current time
    pub fn sample(&self, module: ModuleId, category: MetricCategory, value: f64) -> bool {
        self.submit(HealthSignal::Metric {
            module,
            category,
            value,
            at: self.clock.now_micros(),
        })
    }

    /// Signals dropped because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Append a sample directly to the rolling window
    pub fn record(&self, module: ModuleId, category: MetricCategory, value: f64) {
        let at = self.clock.now_micros();
        self.record_at(module, category, value, at);
    }

    fn record_at(&self, module: ModuleId, category: MetricCategory, value: f64, at: u64) {
        let window = self.config.window;
        self.boundaries
            .write()
            .entry(module)
            .or_default()
            .series
            .entry(category)
            .or_insert_with(|| MetricSeries::new(window))
            .push(at, value);
    }

    /// Drain queued signals into the metric windows
    pub fn pump(&self) -> usize {
        let mut handled = 0;
        while let Ok(signal) = self.rx.try_recv() {
            match signal {
                HealthSignal::Metric {
                    module,
                    category,
                    value,
                    at,
                } => self.record_at(module, category, value, at),
                HealthSignal::Outcome { module, failed } => self.observe_outcome(module, failed),
                HealthSignal::Error { module, category } => {
                    *self
                        .boundaries
                        .write()
                        .entry(module)
                        .or_default()
                        .errors
                        .entry(category)
                        .or_default() += 1;
                }
            }
            handled += 1;
        }
        handled
    }

    /// Score `module` and store the prediction
    ///
    /// Emits a health alert when the status got worse.
    pub fn predict(&self, module: ModuleId) -> FailurePrediction {
        let now = self.clock.now_micros();
        let summaries = self.summaries(module);
        let get = |category| {
            summaries
                .iter()
                .find(|s| s.category == category)
                .copied()
        };

        let error_rate = get(MetricCategory::ErrorRate);
        let latency = get(MetricCategory::Latency);
        let features = vec![
            error_rate.map_or(0.0, |s| s.mean.clamp(0.0, 1.0)),
            latency.map_or(0.0, |s| (s.trend / (s.mean.abs() + 1.0)).clamp(-1.0, 1.0)),
            get(MetricCategory::ResourceUsage).map_or(0.0, |s| s.mean.clamp(0.0, 1.0)),
            get(MetricCategory::ConflictDensity).map_or(0.0, |s| s.mean.clamp(0.0, 1.0)),
        ];
        let failure_probability = self.model.score(&features);

        let samples = summaries.iter().map(|s| s.samples).max().unwrap_or(0);
        let sample_factor = (samples as f64 / self.config.min_samples.max(1) as f64).min(1.0);
        let spread = latency
            .filter(|s| s.mean > f64::EPSILON)
            .map_or(0.0, |s| s.variance.sqrt() / s.mean);
        let confidence = sample_factor / (1.0 + spread);

        let time_to_failure_ms = error_rate
            .filter(|s| s.trend > f64::EPSILON && s.latest < 1.0)
            .map(|s| ((1.0 - s.latest) / s.trend * 1_000.0) as u64);

        let status = HealthStatus::from_probability(failure_probability);
        let prediction = FailurePrediction {
            module,
            status,
            failure_probability,
            confidence,
            time_to_failure_ms,
            valid: confidence >= self.config.confidence_floor,
            features,
            at: now,
        };

        let previous = {
            let mut boundaries = self.boundaries.write();
            let boundary = boundaries.entry(module).or_default();
            let previous = boundary.status;
            boundary.prediction = Some(prediction.clone());
            if prediction.valid {
                boundary.status = status;
            }
            previous
        };

        if prediction.valid && status > previous {
            let message = describe(status, &prediction);
            warn!(%module, ?previous, ?status, failure_probability, "module health degraded");
            self.events.health(HealthEvent {
                module,
                previous,
                status,
                failure_probability,
                message,
            });
        }
        debug!(%module, ?status, failure_probability, confidence, "prediction updated");
        prediction
    }

    /// Predict every known module
    pub fn predict_all(&self) -> Vec<FailurePrediction> {
        let modules: Vec<ModuleId> = self.boundaries.read().keys().copied().collect();
        modules.into_iter().map(|m| self.predict(m)).collect()
    }

    /// Last valid prediction, without waiting on the monitor
    ///
    /// Returns `None` when no valid prediction exists or the table is busy.
    pub fn prediction(&self, module: ModuleId) -> Option<FailurePrediction> {
        let boundaries = self.boundaries.try_read()?;
        boundaries
            .get(&module)?
            .prediction
            .clone()
            .filter(|p| p.valid)
    }

    /// Health snapshot of `module`
    pub fn health(&self, module: ModuleId) -> ModuleHealth {
        let summaries = self.summaries(module);
        let boundaries = self.boundaries.read();
        let boundary = boundaries.get(&module);
        let status = boundary.map_or(HealthStatus::Healthy, |b| b.status);
        let prediction = boundary.and_then(|b| b.prediction.clone());
        let message = match &prediction {
            Some(p) if p.valid => describe(status, p),
            Some(_) => format!("{:?}: not enough data for a prediction", status),
            None => format!("{:?}: no prediction yet", status),
        };
        ModuleHealth {
            module,
            status,
            prediction,
            message,
            most_common_error: boundary.and_then(BoundaryHealth::most_common_error),
            metrics: summaries,
        }
    }

    /// Summaries of every metric tracked for `module`
    pub fn summaries(&self, module: ModuleId) -> Vec<MetricSummary> {
        self.boundaries.read().get(&module).map_or_else(Vec::new, |b| {
            b.series
                .iter()
                .map(|(category, series)| series.summary(*category))
                .collect()
        })
    }

    /// Learn from an observed outcome against the stored prediction
    pub fn observe_outcome(&self, module: ModuleId, failed: bool) {
        let Some(prediction) = self
            .boundaries
            .read()
            .get(&module)
            .and_then(|b| b.prediction.clone())
        else {
            return;
        };

        self.model
            .update(&prediction.features, if failed { 1.0 } else { 0.0 });

        let predicted_failure = prediction.failure_probability >= 0.5;
        if predicted_failure != failed {
            let mut log = self.mispredictions.lock();
            if log.len() == self.config.misprediction_log {
                log.pop_front();
            }
            log.push_back(Misprediction {
                module,
                predicted: prediction.status,
                failure_probability: prediction.failure_probability,
                failed,
                features: prediction.features,
                at: self.clock.now_micros(),
            });
        }
    }

    /// Logged mispredictions, oldest first
    pub fn mispredictions(&self) -> Vec<Misprediction> {
        self.mispredictions.lock().iter().cloned().collect()
    }

    pub fn model_accuracy(&self) -> f64 {
        self.model.accuracy()
    }

    /// Start the monitor and prediction loops
    pub fn spawn(self: &Arc<Self>) -> MonitorHandle {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let monitor_interval = Duration::from_millis(self.config.monitor_interval_ms.max(1));
        let prediction_interval = Duration::from_millis(self.config.prediction_interval_ms.max(1));

        let monitor = {
            let this = Arc::clone(self);
            let stop = stop_rx.clone();
            std::thread::spawn(move || run_every(&stop, monitor_interval, || {
                this.pump();
            }))
        };
        let predictor = {
            let this = Arc::clone(self);
            std::thread::spawn(move || run_every(&stop_rx, prediction_interval, || {
                this.predict_all();
            }))
        };

        MonitorHandle {
            stop: Some(stop_tx),
            threads: vec![monitor, predictor],
        }
    }
}

fn run_every(stop: &Receiver<()>, interval: Duration, mut work: impl FnMut()) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => work(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn describe(status: HealthStatus, prediction: &FailurePrediction) -> String {
    let mut message = format!(
        "{:?}: failure probability {:.0}% (confidence {:.0}%)",
        status,
        prediction.failure_probability * 100.0,
        prediction.confidence * 100.0
    );
    if let Some(ms) = prediction.time_to_failure_ms {
        message.push_str(&format!(", failure expected in ~{} ms", ms));
    }
    message
}

/// Handle to the background loops; stops them when dropped
pub struct MonitorHandle {
    stop: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stop both loops and wait for them to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects both loops
        self.stop.take();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
