//! AcquisitionEngine - state machine for swept lock-in acquisition
//!
//! The engine is the only component that talks to the hardware capabilities
//! and the only owner of run-lifetime state. Each [`tick`](AcquisitionEngine::tick)
//! takes one lock-in sample. [`start`](AcquisitionEngine::start) schedules the
//! tick loop on a tokio task; [`arm`](AcquisitionEngine::arm) prepares a run
//! without scheduling it, for callers that drive `tick` themselves.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  start()  ┌─────────┐  last point of last repeat  ┌─────────┐
//! │ Idle │──────────▶│ Running │────────────────────────────▶│ Stopped │
//! └──────┘           └────┬────┘                             └─────────┘
//!                         │ request_stop()                        ▲
//!                         │ request_stop_after_current_sweep()    │
//!                         ▼                                       │
//!                ┌─────────────────────┐  next tick / next wrap   │
//!                │ StoppingAfterPoint  │──────────────────────────┤
//!                │ StoppingAfterSweep  │                          │
//!                └─────────────────────┘                          │
//!   any state above ── capability error / timeout ──▶ Faulted     │
//! ```
//!
//! Stopped and Faulted are terminal until the next `start()`.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = Arc::new(AcquisitionEngine::new(microwave, magnet, lockin, EngineConfig::default()));
//! let mut events = engine.subscribe();
//!
//! engine.start_configured().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         EngineEvent::PointUpdated { point, series, .. } => plot(point, &series),
//!         EngineEvent::StateChanged(state) if state.is_terminal() => break,
//!         _ => {}
//!     }
//! }
//! let reason = engine.join().await?;
//! ```

use crate::plan::{settle_time_from_time_constants, ScanPlan, SweepAxis, SweepRequest};
use crate::progress::{self, ProgressEstimate};
use crate::reduction;
use chrono::{DateTime, Utc};
use daq_core::capabilities::{AxisKind, LockIn, PersistenceSink, SourceAxis};
use daq_core::data::{AveragedSeries, ChannelSample, RunRecord, SampleCube};
use daq_core::error::{AppResult, DaqError};
use daq_core::limits::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_MAX_SAMPLE_RETRIES, NOISE_FLOOR, SAMPLE_RETRY_BACKOFF,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Capacity of the engine event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// States and events
// =============================================================================

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcquisitionState {
    /// No run has been started
    Idle,
    /// Taking samples
    Running,
    /// Stop requested, honored at the next tick
    StoppingAfterPoint,
    /// Stop requested, honored when the current sweep wraps
    StoppingAfterSweep,
    /// Run ended normally or by request
    Stopped,
    /// Run ended by a hardware or sample error
    Faulted,
}

impl AcquisitionState {
    /// A run owns the hardware in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::StoppingAfterPoint | Self::StoppingAfterSweep
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Faulted)
    }
}

impl std::fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionState::Idle => write!(f, "idle"),
            AcquisitionState::Running => write!(f, "running"),
            AcquisitionState::StoppingAfterPoint => write!(f, "stopping after point"),
            AcquisitionState::StoppingAfterSweep => write!(f, "stopping after sweep"),
            AcquisitionState::Stopped => write!(f, "stopped"),
            AcquisitionState::Faulted => write!(f, "faulted"),
        }
    }
}

/// Why a run reached `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// Every repeat was measured
    Completed,
    /// `request_stop()`
    CancelledByUser,
    /// `request_stop_after_current_sweep()`
    StoppedAfterSweep,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Completed => write!(f, "completed"),
            StopReason::CancelledByUser => write!(f, "cancelled by user"),
            StopReason::StoppedAfterSweep => write!(f, "stopped after sweep"),
        }
    }
}

/// Notification broadcast to subscribers
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The engine entered a new state
    StateChanged(AcquisitionState),
    /// A point finished its accumulations and was re-averaged
    PointUpdated {
        point: usize,
        repeat: usize,
        series: Arc<AveragedSeries>,
    },
    /// Remaining-time estimate after a completed point
    Progress(ProgressEstimate),
}

/// Sample counters of the current or last run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    /// Valid samples stored in the cube
    pub samples: u64,
    /// Re-reads of samples below the noise floor
    pub retries: u64,
}

/// Counters locating the next sample of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AcquisitionPosition {
    /// Repeats completed (index of the sweep in progress)
    pub repeat: usize,
    /// Point in the sweep in progress
    pub point: usize,
    /// Accumulations already stored at `point` in this repeat
    pub accumulation: usize,
}

// =============================================================================
// Configuration
// =============================================================================

/// Timing and retry policy of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout of every capability call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Readings with any channel magnitude below this are re-read
    pub noise_floor: f64,
    /// Pause between re-reads of an invalid sample
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Re-reads allowed per sample before the run faults
    pub max_sample_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            noise_floor: NOISE_FLOOR,
            retry_backoff: SAMPLE_RETRY_BACKOFF,
            max_sample_retries: DEFAULT_MAX_SAMPLE_RETRIES,
        }
    }
}

/// Operator-editable measurement parameters.
///
/// Owned by the engine while a run is active: `update_settings` fails with
/// `EngineBusy` until the run reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSettings {
    pub sweep: SweepRequest,
    pub repeats: usize,
    pub accumulations_per_point: usize,
    /// Settle time = largest lock-in time constant * this factor
    pub waiting_time_factor: f64,
}

impl MeasurementSettings {
    pub fn validate(&self) -> AppResult<()> {
        if self.repeats == 0 {
            return Err(DaqError::InvalidParameter(
                "repeats must be at least 1".to_string(),
            ));
        }
        if self.accumulations_per_point == 0 {
            return Err(DaqError::InvalidParameter(
                "accumulations per point must be at least 1".to_string(),
            ));
        }
        if !(self.waiting_time_factor.is_finite() && self.waiting_time_factor > 0.0) {
            return Err(DaqError::InvalidParameter(format!(
                "waiting time factor must be positive, got {}",
                self.waiting_time_factor
            )));
        }
        Ok(())
    }
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            sweep: SweepRequest::Frequency {
                start: 2800e6,
                step: 2e6,
                stop: 2950e6,
                fixed_field: 3480.0,
                power: -30.0,
            },
            repeats: 1,
            accumulations_per_point: 10,
            waiting_time_factor: 1.0,
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

/// State of the current (or last) run
struct RunContext {
    run_uid: String,
    plan: ScanPlan,
    x: Vec<f64>,
    cube: SampleCube,
    position: AcquisitionPosition,
    rehoming: Duration,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    counters: RunCounters,
    time_constants: Option<Vec<f64>>,
    waiting_time_factor: Option<f64>,
}

/// Lock-in setup a configured run was built from, kept for the parameter snapshot
struct LockInSetup {
    time_constants: Vec<f64>,
    waiting_time_factor: f64,
}

// =============================================================================
// AcquisitionEngine
// =============================================================================

/// Drives one swept acquisition at a time.
pub struct AcquisitionEngine {
    microwave: Arc<dyn SourceAxis>,
    magnet: Arc<dyn SourceAxis>,
    lockin: Arc<dyn LockIn>,
    config: EngineConfig,

    state: RwLock<AcquisitionState>,
    stop_reason: RwLock<Option<StopReason>>,
    last_fault: RwLock<Option<String>>,

    stop_requested: AtomicBool,
    stop_after_sweep_requested: AtomicBool,

    /// Snapshots readable at any time
    series: RwLock<Arc<AveragedSeries>>,
    progress: RwLock<ProgressEstimate>,
    position: RwLock<AcquisitionPosition>,
    counters: RwLock<RunCounters>,
    run_uid: RwLock<Option<String>>,

    settings: RwLock<MeasurementSettings>,
    time_constants: RwLock<Option<Vec<f64>>>,

    /// Serializes ticks; holds the raw data of the current or last run
    run: Mutex<Option<RunContext>>,
    /// Tick loop scheduled by `start`
    driver: parking_lot::Mutex<Option<JoinHandle<AppResult<StopReason>>>>,

    event_tx: broadcast::Sender<EngineEvent>,
}

impl AcquisitionEngine {
    /// Create an idle engine over a microwave source, a magnet and a lock-in.
    pub fn new(
        microwave: Arc<dyn SourceAxis>,
        magnet: Arc<dyn SourceAxis>,
        lockin: Arc<dyn LockIn>,
        config: EngineConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            microwave,
            magnet,
            lockin,
            config,
            state: RwLock::new(AcquisitionState::Idle),
            stop_reason: RwLock::new(None),
            last_fault: RwLock::new(None),
            stop_requested: AtomicBool::new(false),
            stop_after_sweep_requested: AtomicBool::new(false),
            series: RwLock::new(Arc::new(AveragedSeries::new(Vec::new()))),
            progress: RwLock::new(ProgressEstimate::default()),
            position: RwLock::new(AcquisitionPosition::default()),
            counters: RwLock::new(RunCounters::default()),
            run_uid: RwLock::new(None),
            settings: RwLock::new(MeasurementSettings::default()),
            time_constants: RwLock::new(None),
            run: Mutex::new(None),
            driver: parking_lot::Mutex::new(None),
            event_tx,
        }
    }

    /// Start from the given settings instead of the defaults.
    pub fn with_settings(self, settings: MeasurementSettings) -> Self {
        *self.settings.write() = settings;
        self
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> AcquisitionState {
        *self.state.read()
    }

    /// Why the last run stopped; `None` while running or after a fault.
    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.stop_reason.read()
    }

    /// Message of the error that faulted the last run.
    pub fn last_fault(&self) -> Option<String> {
        self.last_fault.read().clone()
    }

    pub fn position(&self) -> AcquisitionPosition {
        *self.position.read()
    }

    pub fn counters(&self) -> RunCounters {
        *self.counters.read()
    }

    /// Unique id of the current or last run
    pub fn run_uid(&self) -> Option<String> {
        self.run_uid.read().clone()
    }

    /// Averaged spectrum collected so far.
    pub fn current_series(&self) -> Arc<AveragedSeries> {
        Arc::clone(&self.series.read())
    }

    pub fn current_progress(&self) -> ProgressEstimate {
        *self.progress.read()
    }

    pub fn settings(&self) -> MeasurementSettings {
        self.settings.read().clone()
    }

    /// Lock-in time constants last read or written by the engine.
    pub fn time_constants(&self) -> Option<Vec<f64>> {
        self.time_constants.read().clone()
    }

    /// Copy of the raw samples of the current or last run.
    pub async fn raw_data(&self) -> Option<SampleCube> {
        self.run.lock().await.as_ref().map(|ctx| ctx.cube.clone())
    }

    fn ensure_not_busy(&self, action: &str) -> AppResult<()> {
        if self.state().is_active() {
            return Err(DaqError::EngineBusy(action.to_string()));
        }
        Ok(())
    }

    /// Replace the measurement settings.
    #[instrument(skip(self, settings))]
    pub fn update_settings(&self, settings: MeasurementSettings) -> AppResult<()> {
        self.ensure_not_busy("change measurement settings")?;
        settings.validate()?;
        debug!(?settings, "Measurement settings updated");
        *self.settings.write() = settings;
        Ok(())
    }

    /// Program both lock-in time constants.
    ///
    /// # Returns
    /// The time constants the lock-in applied.
    #[instrument(skip(self))]
    pub async fn set_time_constants(&self, tau_a: f64, tau_b: f64) -> AppResult<(f64, f64)> {
        self.ensure_not_busy("change lock-in time constants")?;
        let applied = self
            .call(
                "set_time_constants",
                self.lockin.set_time_constants(tau_a, tau_b),
            )
            .await?;
        info!(tau_a = applied.0, tau_b = applied.1, "Lock-in time constants set");
        *self.time_constants.write() = Some(vec![applied.0, applied.1]);
        Ok(applied)
    }

    /// Build a plan from the current settings and the lock-in time constants.
    #[instrument(skip(self))]
    pub async fn build_plan(&self) -> AppResult<ScanPlan> {
        self.ensure_not_busy("build a plan")?;
        let (plan, _) = self.build_configured_plan().await?;
        Ok(plan)
    }

    async fn build_configured_plan(&self) -> AppResult<(ScanPlan, LockInSetup)> {
        let settings = self.settings();
        settings.validate()?;

        let taus = self
            .call("time_constants", self.lockin.time_constants())
            .await?;
        *self.time_constants.write() = Some(taus.clone());
        let settle_time = settle_time_from_time_constants(&taus, settings.waiting_time_factor)?;

        let axis = settings
            .sweep
            .normalize(&self.microwave.limits(), &self.magnet.limits())?;
        let plan = ScanPlan::new(
            axis,
            settings.repeats,
            settings.accumulations_per_point,
            settle_time,
        )?;

        debug!(
            points = plan.point_count(),
            settle_time = ?plan.settle_time,
            "Plan built from settings"
        );
        Ok((
            plan,
            LockInSetup {
                time_constants: taus,
                waiting_time_factor: settings.waiting_time_factor,
            },
        ))
    }

    /// Expected duration of `plan` on the connected sources.
    pub fn estimated_duration(&self, plan: &ScanPlan) -> Duration {
        progress::total_time(plan, self.source(plan.axis.kind()).rehoming_time())
    }

    /// Build a plan from the settings and start it.
    #[instrument(skip(self))]
    pub async fn start_configured(self: &Arc<Self>) -> AppResult<ScanPlan> {
        let plan = self.arm_configured().await?;
        self.schedule();
        Ok(plan)
    }

    /// Start a run and schedule its ticks on a tokio task.
    ///
    /// Validates the plan against the live source limits, preallocates the
    /// sample cube and programs the sources. The run then proceeds on its own
    /// until it completes, faults or a stop request is honored;
    /// [`join`](Self::join) waits for that outcome.
    #[instrument(skip_all, fields(axis = %plan.axis.kind(), points = plan.point_count()))]
    pub async fn start(self: &Arc<Self>, plan: ScanPlan) -> AppResult<()> {
        self.arm(plan).await?;
        self.schedule();
        Ok(())
    }

    /// Like [`start_configured`](Self::start_configured), without scheduling ticks.
    #[instrument(skip(self))]
    pub async fn arm_configured(&self) -> AppResult<ScanPlan> {
        self.ensure_not_busy("start a run")?;
        let (plan, setup) = self.build_configured_plan().await?;
        self.begin(plan.clone(), Some(setup)).await?;
        Ok(plan)
    }

    /// Prepare a run like [`start`](Self::start) but leave it to the caller
    /// to drive it with [`tick`](Self::tick) or [`run`](Self::run).
    #[instrument(skip_all, fields(axis = %plan.axis.kind(), points = plan.point_count()))]
    pub async fn arm(&self, plan: ScanPlan) -> AppResult<()> {
        self.begin(plan, None).await
    }

    fn schedule(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.run().await });
        if let Some(previous) = self.driver.lock().replace(handle) {
            // The previous run is terminal, so its loop has already returned
            debug!(finished = previous.is_finished(), "Replaced tick loop handle");
        }
    }

    /// Wait for the run scheduled by `start` to end.
    ///
    /// Without a scheduled loop this reports the outcome of the last run.
    pub async fn join(&self) -> AppResult<StopReason> {
        let handle = self.driver.lock().take();
        match handle {
            Some(handle) => handle.await.map_err(|e| {
                DaqError::HardwareComm(format!("acquisition task ended abnormally: {}", e))
            })?,
            None => self.outcome(),
        }
    }

    /// Result of a terminal run, or why there is none.
    fn outcome(&self) -> AppResult<StopReason> {
        match self.state() {
            AcquisitionState::Stopped => Ok(self.stop_reason().unwrap_or(StopReason::Completed)),
            AcquisitionState::Faulted => Err(DaqError::HardwareComm(
                self.last_fault()
                    .unwrap_or_else(|| "run faulted".to_string()),
            )),
            AcquisitionState::Idle => Err(DaqError::InvalidParameter(
                "no run has been started".to_string(),
            )),
            _ => Err(DaqError::InvalidParameter(
                "run is armed but not scheduled, drive it with run()".to_string(),
            )),
        }
    }

    async fn begin(&self, plan: ScanPlan, setup: Option<LockInSetup>) -> AppResult<()> {
        self.ensure_not_busy("start a run")?;
        let mut guard = self.run.lock().await;
        // A concurrent start may have won the lock
        self.ensure_not_busy("start a run")?;

        plan.validate()?;
        let axis = plan
            .axis
            .to_request()
            .normalize(&self.microwave.limits(), &self.magnet.limits())?;
        let plan = ScanPlan { axis, ..plan };
        let cube = SampleCube::try_new(
            plan.repeats,
            plan.accumulations_per_point,
            plan.point_count(),
        )?;

        let x = plan.axis.values();
        let rehoming = self.source(plan.axis.kind()).rehoming_time();
        let run_uid = uuid::Uuid::new_v4().to_string();
        let estimate = progress::estimate(&plan, 0, 0, rehoming);

        self.stop_requested.store(false, Ordering::SeqCst);
        self.stop_after_sweep_requested
            .store(false, Ordering::SeqCst);
        *self.stop_reason.write() = None;
        *self.last_fault.write() = None;
        *self.series.write() = Arc::new(AveragedSeries::new(x.clone()));
        *self.progress.write() = estimate;
        *self.position.write() = AcquisitionPosition::default();
        *self.counters.write() = RunCounters::default();
        *self.run_uid.write() = Some(run_uid.clone());

        info!(
            run_uid = %run_uid,
            axis = %plan.axis.kind(),
            points = plan.point_count(),
            repeats = plan.repeats,
            accumulations = plan.accumulations_per_point,
            settle_time = ?plan.settle_time,
            "Starting acquisition"
        );

        let (time_constants, waiting_time_factor) = match setup {
            Some(setup) => (Some(setup.time_constants), Some(setup.waiting_time_factor)),
            None => (self.time_constants(), None),
        };
        let ctx = guard.insert(RunContext {
            run_uid,
            plan,
            x,
            cube,
            position: AcquisitionPosition::default(),
            rehoming,
            started_at: Utc::now(),
            finished_at: None,
            counters: RunCounters::default(),
            time_constants,
            waiting_time_factor,
        });

        self.set_state(AcquisitionState::Running);
        if let Err(e) = self.program_sources(&ctx.plan).await {
            return Err(self.fault(ctx, e));
        }
        let _ = self.event_tx.send(EngineEvent::Progress(estimate));
        Ok(())
    }

    /// Program the sweep list, park the companion source and go to the first point.
    async fn program_sources(&self, plan: &ScanPlan) -> AppResult<()> {
        let kind = plan.axis.kind();
        let active = self.source(kind);
        let companion = self.companion(kind);
        let grid = plan.axis.grid();

        let applied = self
            .call(
                "set_sweep",
                active.set_sweep(grid.start, grid.step, grid.stop, plan.axis.power()),
            )
            .await?;
        if applied != (grid.start, grid.step, grid.stop) {
            warn!(
                requested = ?(grid.start, grid.step, grid.stop),
                applied = ?applied,
                "Source coerced the sweep list"
            );
        }

        let (value, power) = self
            .call(
                "set_cw",
                companion.set_cw(plan.axis.companion_value(), plan.axis.power()),
            )
            .await?;
        debug!(value, power, "Companion source set");

        self.call("reset_to_start", active.reset_to_start()).await
    }

    fn source(&self, kind: AxisKind) -> &Arc<dyn SourceAxis> {
        match kind {
            AxisKind::Frequency => &self.microwave,
            AxisKind::Field => &self.magnet,
        }
    }

    fn companion(&self, kind: AxisKind) -> &Arc<dyn SourceAxis> {
        match kind {
            AxisKind::Frequency => &self.magnet,
            AxisKind::Field => &self.microwave,
        }
    }

    /// Stop at the next tick, keeping everything measured so far.
    #[instrument(skip(self))]
    pub fn request_stop(&self) {
        let mut state = self.state.write();
        match *state {
            AcquisitionState::Running | AcquisitionState::StoppingAfterSweep => {
                self.stop_requested.store(true, Ordering::SeqCst);
                *state = AcquisitionState::StoppingAfterPoint;
                drop(state);
                info!("Stop requested");
                let _ = self.event_tx.send(EngineEvent::StateChanged(
                    AcquisitionState::StoppingAfterPoint,
                ));
            }
            current => debug!(state = %current, "Stop request ignored"),
        }
    }

    /// Stop once the sweep in progress has wrapped back to its first point.
    #[instrument(skip(self))]
    pub fn request_stop_after_current_sweep(&self) {
        let mut state = self.state.write();
        match *state {
            AcquisitionState::Running => {
                self.stop_after_sweep_requested
                    .store(true, Ordering::SeqCst);
                *state = AcquisitionState::StoppingAfterSweep;
                drop(state);
                info!("Stop after current sweep requested");
                let _ = self.event_tx.send(EngineEvent::StateChanged(
                    AcquisitionState::StoppingAfterSweep,
                ));
            }
            current => debug!(state = %current, "Stop-after-sweep request ignored"),
        }
    }

    // =========================================================================
    // Tick loop
    // =========================================================================

    /// Take one sample and advance the run.
    ///
    /// Returns the state after the tick. A capability failure or an
    /// unrecoverable invalid sample moves the engine to `Faulted` and is
    /// returned as the error.
    #[instrument(skip(self), level = "debug")]
    pub async fn tick(&self) -> AppResult<AcquisitionState> {
        let mut guard = self.run.lock().await;
        let state = self.state();
        let Some(ctx) = guard.as_mut() else {
            return Ok(state);
        };
        if !state.is_active() {
            return Ok(state);
        }

        if self.stop_requested.load(Ordering::SeqCst) {
            self.finish(ctx, StopReason::CancelledByUser);
            return Ok(self.state());
        }
        if self.stop_after_sweep_requested.load(Ordering::SeqCst)
            && ctx.position.point == 0
            && ctx.position.accumulation == 0
            && ctx.position.repeat > 0
        {
            self.finish(ctx, StopReason::StoppedAfterSweep);
            return Ok(self.state());
        }

        let at = ctx.position;
        let (sample, retries) = match self.acquire(ctx.plan.settle_time, at.point).await {
            Ok(read) => read,
            Err(e) => return Err(self.fault(ctx, e)),
        };
        ctx.counters.samples += 1;
        ctx.counters.retries += u64::from(retries);
        *self.counters.write() = ctx.counters;
        if let Err(e) = ctx
            .cube
            .store(at.repeat, at.accumulation, at.point, &sample)
        {
            return Err(self.fault(ctx, e));
        }
        ctx.position.accumulation += 1;

        if ctx.position.accumulation == ctx.plan.accumulations_per_point {
            if let Err(e) = self.complete_point(ctx).await {
                return Err(self.fault(ctx, e));
            }
        } else {
            *self.position.write() = ctx.position;
        }

        Ok(self.state())
    }

    /// Settle, then read until the lock-in returns a valid sample.
    ///
    /// Returns the sample and the number of re-reads it took.
    async fn acquire(&self, settle_time: Duration, point: usize) -> AppResult<(ChannelSample, u32)> {
        tokio::time::sleep(settle_time).await;

        let mut attempts: u32 = 0;
        loop {
            let sample = self.call("read_sample", self.lockin.read_sample()).await?;
            attempts = attempts.saturating_add(1);
            if self.is_valid(&sample) {
                return Ok((sample, attempts - 1));
            }
            if attempts > self.config.max_sample_retries {
                return Err(DaqError::SampleInvalid { point, attempts });
            }
            debug!(point, attempts, ?sample, "Sample below noise floor, re-reading");
            tokio::time::sleep(self.config.retry_backoff).await;
        }
    }

    fn is_valid(&self, sample: &ChannelSample) -> bool {
        sample
            .iter()
            .all(|v| v.is_finite() && v.abs() >= self.config.noise_floor)
    }

    /// Reduce the finished point, then step or wrap the active source.
    async fn complete_point(&self, ctx: &mut RunContext) -> AppResult<()> {
        let point = ctx.position.point;
        let repeat = ctx.position.repeat;

        let mean = reduction::reduce(
            &ctx.cube,
            point,
            repeat,
            ctx.plan.accumulations_per_point,
        )?;
        let series = {
            let mut series = self.series.write();
            Arc::make_mut(&mut series).set(point, mean)?;
            Arc::clone(&series)
        };
        let _ = self.event_tx.send(EngineEvent::PointUpdated {
            point,
            repeat,
            series,
        });
        debug!(point, repeat, ?mean, "Point averaged");

        ctx.position.accumulation = 0;
        ctx.position.point += 1;
        let active = Arc::clone(self.source(ctx.plan.axis.kind()));

        if ctx.position.point < ctx.plan.point_count() {
            if self.stop_requested.load(Ordering::SeqCst) {
                self.finish(ctx, StopReason::CancelledByUser);
                return Ok(());
            }
            self.call("trigger_next", active.trigger_next()).await?;
        } else {
            ctx.position.point = 0;
            ctx.position.repeat += 1;
            info!(
                run_uid = %ctx.run_uid,
                completed_repeats = ctx.position.repeat,
                repeats = ctx.plan.repeats,
                "Sweep complete"
            );
            self.call("reset_to_start", active.reset_to_start()).await?;

            let reason = if ctx.position.repeat >= ctx.plan.repeats {
                Some(StopReason::Completed)
            } else if self.stop_requested.load(Ordering::SeqCst) {
                Some(StopReason::CancelledByUser)
            } else if self.stop_after_sweep_requested.load(Ordering::SeqCst) {
                Some(StopReason::StoppedAfterSweep)
            } else {
                None
            };
            if let Some(reason) = reason {
                self.finish(ctx, reason);
                return Ok(());
            }
        }

        *self.position.write() = ctx.position;
        let estimate = progress::estimate(
            &ctx.plan,
            ctx.position.point,
            ctx.position.repeat,
            ctx.rehoming,
        );
        *self.progress.write() = estimate;
        let _ = self.event_tx.send(EngineEvent::Progress(estimate));
        Ok(())
    }

    fn finish(&self, ctx: &mut RunContext, reason: StopReason) {
        ctx.finished_at = Some(Utc::now());
        *self.position.write() = ctx.position;

        let estimate = ProgressEstimate::finished(
            progress::total_time(&ctx.plan, ctx.rehoming),
            ctx.position.repeat,
            ctx.position.point,
        );
        *self.progress.write() = estimate;
        *self.stop_reason.write() = Some(reason);

        info!(
            run_uid = %ctx.run_uid,
            reason = %reason,
            completed_repeats = ctx.position.repeat,
            samples = ctx.counters.samples,
            retries = ctx.counters.retries,
            "Acquisition stopped"
        );
        let _ = self.event_tx.send(EngineEvent::Progress(estimate));
        self.set_state(AcquisitionState::Stopped);
    }

    fn fault(&self, ctx: &mut RunContext, err: DaqError) -> DaqError {
        ctx.finished_at = Some(Utc::now());
        *self.position.write() = ctx.position;
        *self.last_fault.write() = Some(err.to_string());

        error!(
            run_uid = %ctx.run_uid,
            repeat = ctx.position.repeat,
            point = ctx.position.point,
            error = %err,
            "Acquisition faulted"
        );
        self.set_state(AcquisitionState::Faulted);
        err
    }

    fn set_state(&self, state: AcquisitionState) {
        *self.state.write() = state;
        debug!(state = %state, "Engine state changed");
        let _ = self.event_tx.send(EngineEvent::StateChanged(state));
    }

    /// Run a capability call under the engine's call timeout.
    async fn call<T, F>(&self, operation: &'static str, fut: F) -> AppResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DaqError::HardwareComm(format!("{} failed: {:#}", operation, e))),
            Err(_) => Err(DaqError::HardwareComm(format!(
                "{} timed out after {:?}",
                operation, self.config.call_timeout
            ))),
        }
    }

    /// Tick until the run reaches a terminal state.
    ///
    /// Drives a run prepared with [`arm`](Self::arm) in the calling task.
    #[instrument(skip(self))]
    pub async fn run(&self) -> AppResult<StopReason> {
        loop {
            let state = self.tick().await?;
            if !state.is_active() {
                return self.outcome();
            }
            // Let stop requests from tasks on the same thread get in
            tokio::task::yield_now().await;
        }
    }

    /// Arm a plan and run it to completion in the calling task.
    pub async fn run_plan(&self, plan: ScanPlan) -> AppResult<StopReason> {
        self.arm(plan).await?;
        self.run().await
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Snapshot of the current or last run for persistence.
    pub async fn run_record(&self) -> AppResult<RunRecord> {
        let guard = self.run.lock().await;
        let ctx = guard
            .as_ref()
            .ok_or_else(|| DaqError::InvalidParameter("no run to record".to_string()))?;

        let completed = ctx.position.repeat;
        let series = reduction::completed_repeats_series(&ctx.cube, &ctx.x, completed)?;
        let partial_repeats = if completed >= ctx.plan.repeats {
            ctx.plan.repeats
        } else {
            completed + 1
        };
        let repeat_series = reduction::repeat_series(&ctx.cube, &ctx.x, partial_repeats)?;

        Ok(RunRecord {
            run_uid: ctx.run_uid.clone(),
            axis: ctx.plan.axis.kind(),
            series,
            repeat_series,
            raw: ctx.cube.clone(),
            parameters: self.parameter_snapshot(ctx),
        })
    }

    fn parameter_snapshot(&self, ctx: &RunContext) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = Vec::new();
        let mut push = |key: &str, value: String| params.push((key.to_string(), value));

        match ctx.plan.axis {
            SweepAxis::FrequencySweep {
                start,
                step,
                stop,
                fixed_field,
                power,
            } => {
                push("Magnetic Field (G)", fixed_field.to_string());
                push("Microwave Power (dBm)", power.to_string());
                push("Start Frequency (Hz)", start.to_string());
                push("Step Size (Hz)", step.to_string());
                push("Stop Frequency (Hz)", stop.to_string());
            }
            SweepAxis::FieldSweep {
                start,
                step,
                stop,
                fixed_frequency,
                power,
            } => {
                push("Microwave Frequency (Hz)", fixed_frequency.to_string());
                push("Microwave Power (dBm)", power.to_string());
                push("Start Field (G)", start.to_string());
                push("Step Size (G)", step.to_string());
                push("Stop Field (G)", stop.to_string());
            }
        }

        let end = ctx.finished_at.unwrap_or_else(Utc::now);
        let secs = (end - ctx.started_at).num_seconds().max(0);
        push(
            "Duration Of The Experiment",
            format!("{:02}h{:02}m{:02}s", secs / 3600, (secs / 60) % 60, secs % 60),
        );
        push("Elapsed Sweeps", ctx.position.repeat.to_string());
        push("Sweeps", ctx.plan.repeats.to_string());
        push(
            "Accumulations Per Point",
            ctx.plan.accumulations_per_point.to_string(),
        );
        push("Settle Time", format!("{:?}", ctx.plan.settle_time));
        push("Sample Retries", ctx.counters.retries.to_string());
        if let Some(taus) = &ctx.time_constants {
            if let Some(tau_a) = taus.first() {
                push("Lockin tau A (s)", tau_a.to_string());
            }
            if let Some(tau_b) = taus.get(1) {
                push("Lockin tau B (s)", tau_b.to_string());
            }
        }
        if let Some(factor) = ctx.waiting_time_factor {
            push("Lockin Waiting Time Factor", factor.to_string());
        }
        if let Some(reason) = self.stop_reason() {
            push("Stop Reason", reason.to_string());
        }
        if let Some(fault) = self.last_fault() {
            push("Fault", fault);
        }
        push("Run UID", ctx.run_uid.clone());
        params
    }

    /// Persist the current or last run through `sink`.
    ///
    /// # Returns
    /// Path reported by the sink.
    #[instrument(skip(self, sink))]
    pub async fn save(&self, sink: &dyn PersistenceSink, tag: &str) -> AppResult<PathBuf> {
        self.ensure_not_busy("save run data")?;
        let record = self.run_record().await?;
        let path = sink
            .save(tag, &record)
            .await
            .map_err(|e| DaqError::Storage(format!("{:#}", e)))?;
        info!(run_uid = %record.run_uid, path = %path.display(), "Run saved");
        Ok(path)
    }
}
