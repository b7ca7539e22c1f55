//! Adaptive backend selection.
//!
//! Owns the active NLU backend, tracks per-backend performance with an
//! exponential moving average, and switches backends in the background
//! when the active one degrades. Parse latency never pays for a switch:
//! degradation checks run on a separate thread and the active slot swap
//! is a single mutex-guarded assignment.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use labvoice_common::config::{AiConfig, BackendKind};
use labvoice_common::ollama::OllamaApi;
use labvoice_common::types::{Command, TranscriptionResult};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::classifier::ClassifierBackend;
use super::model::ModelBackend;
use super::{NluBackend, NluError};
use crate::interpret;

/// EMA smoothing factor; ~10 observations of history.
const EMA_ALPHA: f64 = 0.1;

/// Success-rate floor below which a backend counts as degraded.
const DEGRADED_SUCCESS_RATE: f64 = 0.8;

/// Replacement candidates when the active backend degrades, fastest
/// first.
const ALTERNATIVES: [BackendKind; 3] = [
    BackendKind::Classification,
    BackendKind::OllamaLight,
    BackendKind::Llamacpp,
];

/// Canonical utterances used to seed performance stats after activation.
pub const BENCHMARK_COMMANDS: [&str; 5] = [
    "rat 5 cage 3 weight 280 grams",
    "change weight to 300 grams",
    "move rat 7 to cage 12",
    "show rats around 250 grams",
    "stop listening",
];

/// Per-backend performance EMA. The first observation seeds the average
/// directly instead of blending against zero.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PerfStats {
    pub avg_time_ms: f64,
    pub success_rate: f64,
    pub samples: u64,
}

impl PerfStats {
    pub fn observe(&mut self, elapsed_ms: f64, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        if self.samples == 0 {
            self.avg_time_ms = elapsed_ms;
            self.success_rate = outcome;
        } else {
            self.avg_time_ms = self.avg_time_ms * (1.0 - EMA_ALPHA) + elapsed_ms * EMA_ALPHA;
            self.success_rate = self.success_rate * (1.0 - EMA_ALPHA) + outcome * EMA_ALPHA;
        }
        self.samples += 1;
    }
}

/// Snapshot for the status report.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub active_backend: BackendKind,
    pub available_backends: Vec<BackendKind>,
    pub performance: BTreeMap<String, PerfStats>,
    pub recommendations: Vec<String>,
}

struct Inner {
    ai: AiConfig,
    client: Arc<dyn OllamaApi>,
    active: Mutex<NluBackend>,
    perf: Mutex<HashMap<BackendKind, PerfStats>>,
    /// Guards against stacking degradation-check threads.
    checking: AtomicBool,
}

/// The adaptive selector. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct AdaptiveNlu {
    inner: Arc<Inner>,
}

impl AdaptiveNlu {
    /// Cheap construction with the classifier active; no network I/O
    /// happens until [`initialize`](Self::initialize).
    pub fn new(ai: AiConfig, client: Arc<dyn OllamaApi>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ai,
                client,
                active: Mutex::new(NluBackend::Classifier(ClassifierBackend::new())),
                perf: Mutex::new(HashMap::new()),
                checking: AtomicBool::new(false),
            }),
        }
    }

    /// Probe backends in priority order and activate the first working
    /// one. Cannot fail: the classifier needs no runtime and is forced
    /// active when every model tier is unavailable.
    pub fn initialize(&self) {
        for kind in self.priority() {
            match self.try_backend(kind) {
                Ok(backend) => {
                    info!(backend = %kind, "activated NLU backend");
                    *self.inner.active.lock().unwrap() = backend;
                    if self.inner.ai.enable_benchmarking {
                        self.run_benchmark();
                    }
                    return;
                }
                Err(e) => warn!(backend = %kind, "backend unavailable: {e}"),
            }
        }

        // Unreachable with a validated config, but the guarantee holds
        // regardless of what the fallback order says.
        warn!("no configured backend available, forcing classifier");
        *self.inner.active.lock().unwrap() = NluBackend::Classifier(ClassifierBackend::new());
    }

    /// Preferred backend first, then the fallback order minus the
    /// preferred entry.
    fn priority(&self) -> Vec<BackendKind> {
        let preferred = self.inner.ai.preferred_backend;
        let mut order = vec![preferred];
        order.extend(
            self.inner
                .ai
                .fallback_order
                .iter()
                .copied()
                .filter(|k| *k != preferred),
        );
        order
    }

    /// Construct and availability-probe one backend.
    fn try_backend(&self, kind: BackendKind) -> Result<NluBackend, NluError> {
        if kind == BackendKind::Classification {
            return Ok(NluBackend::Classifier(ClassifierBackend::new()));
        }

        let backend = ModelBackend::new(kind, Arc::clone(&self.inner.client))?;
        let info = backend.model_info();
        if !info.available {
            let hint = kind
                .info()
                .setup_command
                .map(|c| format!("; run `{c}`"))
                .unwrap_or_default();
            return Err(NluError::Unavailable(
                kind,
                format!("model {} not installed{hint}", info.model_name),
            ));
        }
        Ok(NluBackend::Model(backend))
    }

    pub fn active_backend(&self) -> BackendKind {
        self.inner.active.lock().unwrap().kind()
    }

    pub fn stats(&self, kind: BackendKind) -> Option<PerfStats> {
        self.inner.perf.lock().unwrap().get(&kind).copied()
    }

    /// Parse one transcription into a command.
    ///
    /// A failing model backend degrades to the classifier on the same
    /// text within this call, so the caller still gets a command; only a
    /// classifier failure (a logic error) surfaces as `Err`.
    pub fn parse_command(
        &self,
        transcription: &TranscriptionResult,
    ) -> Result<Command, NluError> {
        let backend = self.inner.active.lock().unwrap().clone();
        let kind = backend.kind();

        let start = Instant::now();
        match backend.parse(&transcription.text) {
            Ok(mut nlu) => {
                let elapsed = start.elapsed().as_millis() as u64;
                nlu.processing_time_ms = Some(elapsed);
                self.observe(kind, elapsed as f64, true);

                if elapsed > self.inner.ai.max_inference_time_ms {
                    warn!(backend = %kind, elapsed_ms = elapsed, "slow parse");
                    self.spawn_degradation_check();
                }

                Ok(interpret::to_command(&nlu, transcription))
            }
            Err(e) => {
                self.observe(kind, start.elapsed().as_millis() as f64, false);
                if kind == BackendKind::Classification {
                    return Err(e);
                }

                warn!(backend = %kind, "backend failed, degrading to classifier: {e}");
                self.spawn_degradation_check();

                let nlu = ClassifierBackend::new().classify(&transcription.text);
                Ok(interpret::to_command(&nlu, transcription))
            }
        }
    }

    fn observe(&self, kind: BackendKind, elapsed_ms: f64, success: bool) {
        self.inner
            .perf
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .observe(elapsed_ms, success);
    }

    /// Run the degradation check off the parse path. At most one check
    /// runs at a time.
    fn spawn_degradation_check(&self) {
        if self
            .inner
            .checking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let this = self.clone();
        std::thread::spawn(move || {
            this.check_degradation();
            this.inner.checking.store(false, Ordering::SeqCst);
        });
    }

    /// Switch away from a degraded active backend. Returns true when a
    /// switch happened. Degradation means EMA latency above the budget or
    /// success rate below the floor.
    pub fn check_degradation(&self) -> bool {
        let active = self.active_backend();
        let Some(stats) = self.stats(active) else {
            return false;
        };

        let degraded = stats.avg_time_ms > self.inner.ai.max_inference_time_ms as f64
            || stats.success_rate < DEGRADED_SUCCESS_RATE;
        if !degraded {
            return false;
        }

        info!(
            backend = %active,
            avg_ms = stats.avg_time_ms,
            success_rate = stats.success_rate,
            "active backend degraded, looking for alternative"
        );

        for candidate in ALTERNATIVES {
            if candidate == active {
                continue;
            }
            match self.try_backend(candidate) {
                Ok(backend) => {
                    info!(from = %active, to = %candidate, "switched NLU backend");
                    *self.inner.active.lock().unwrap() = backend;
                    return true;
                }
                Err(e) => debug!(backend = %candidate, "alternative unavailable: {e}"),
            }
        }

        warn!(backend = %active, "degraded but no alternative available");
        false
    }

    /// Explicit operator-driven switch. Returns false (and keeps the
    /// current backend) when the target is unavailable.
    pub fn switch_backend(&self, kind: BackendKind) -> bool {
        match self.try_backend(kind) {
            Ok(backend) => {
                info!(backend = %kind, "manual backend switch");
                *self.inner.active.lock().unwrap() = backend;
                true
            }
            Err(e) => {
                warn!(backend = %kind, "switch refused: {e}");
                false
            }
        }
    }

    /// Probe everything and report: active backend, which tiers would
    /// work right now, performance so far, and setup hints for installable
    /// tiers that are missing.
    pub fn system_status(&self) -> SystemStatus {
        let mut available = Vec::new();
        let mut recommendations = Vec::new();

        for kind in BackendKind::ALL {
            match self.try_backend(kind) {
                Ok(_) => available.push(kind),
                Err(_) => {
                    let info = kind.info();
                    if let Some(cmd) = info.setup_command {
                        if kind != BackendKind::Llamacpp {
                            recommendations
                                .push(format!("Install {} ({}): {}", info.name, info.size, cmd));
                        }
                    }
                }
            }
        }

        let performance = self
            .inner
            .perf
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), *v))
            .collect();

        SystemStatus {
            active_backend: self.active_backend(),
            available_backends: available,
            performance,
            recommendations,
        }
    }

    /// Seed performance stats by parsing the canonical command set
    /// against the freshly activated backend.
    fn run_benchmark(&self) {
        let backend = self.inner.active.lock().unwrap().clone();
        let kind = backend.kind();

        let mut failures = 0usize;
        for text in BENCHMARK_COMMANDS {
            let start = Instant::now();
            let ok = backend.parse(text).is_ok();
            if !ok {
                failures += 1;
            }
            self.observe(kind, start.elapsed().as_millis() as f64, ok);
        }

        if let Some(stats) = self.stats(kind) {
            info!(
                backend = %kind,
                avg_ms = stats.avg_time_ms,
                failures,
                "benchmark complete"
            );
        }
    }
}
