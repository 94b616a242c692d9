//! The experiment loop: the heart of labloop.
//!
//! `Experiment::start()` spawns a tick task on a dedicated single-worker tokio
//! runtime. The task owns every user callback for the duration of the run and
//! hands them back when it is joined by `stop()` or `wait_finished()`, so the
//! same experiment can be run again.
//!
//! Each tick advances the condition sweep when the repeat limit is reached,
//! builds a `Measurement`, calls the measurement function, appends the
//! result to the shared `SampleTable` and fans the row out to the sinks. The
//! first error ends the run.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::csv::CsvLogger;
use crate::error::{LabError, Result, Stage};
use crate::models::{ExperimentConfig, RunStatus, RunSummary};
use crate::plot::SvgPlotter;
use crate::record::Measurement;
use crate::sink::{Logger, PlotSink, Sinks};
use crate::storage::ParquetLogger;
use crate::sweep::{ConditionRow, ConditionSet, ConditionSweep, RepeatLimit, SweepStep};
use crate::table::{SampleTable, Snapshot, MIN_CAPACITY};

/// Measurement function: adds the measured columns to the builder.
pub type MeasureFn = Box<dyn FnMut(&mut Measurement) -> anyhow::Result<()> + Send>;

/// Called once per condition row, before the first measurement under it.
pub type ApplyConditionFn = Box<dyn FnMut(&Measurement) -> anyhow::Result<()> + Send>;

/// Everything the tick task takes ownership of while a run is in progress.
struct Hooks {
    measure: MeasureFn,
    apply_condition: Vec<ApplyConditionFn>,
    sinks: Sinks,
}

type TaskOutput = (Hooks, Result<RunSummary>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Builder ─────────────────────────────────────────────────────────────────

pub struct ExperimentBuilder {
    name: String,
    measure: MeasureFn,
    apply_condition: Vec<ApplyConditionFn>,
    sinks: Sinks,
    conditions: ConditionSet,
    measurements_per_condition: Option<u64>,
    initial_capacity: usize,
}

impl ExperimentBuilder {
    fn new(measure: MeasureFn) -> Self {
        Self {
            name: "experiment".to_string(),
            measure,
            apply_condition: Vec::new(),
            sinks: Sinks::new(),
            conditions: ConditionSet::new(),
            measurements_per_condition: None,
            initial_capacity: MIN_CAPACITY,
        }
    }

    /// Wire conditions and file sinks from a config. The interval is not part
    /// of the experiment; pass `config.interval()?` to `start` or `run`.
    pub fn from_config<F>(config: &ExperimentConfig, measure: F) -> Self
    where
        F: FnMut(&mut Measurement) -> anyhow::Result<()> + Send + 'static,
    {
        let mut builder = Experiment::builder(measure)
            .name(&config.name)
            .conditions(config.condition_set());
        if let Some(n) = config.measurements_per_condition {
            builder = builder.measurements_per_condition(n);
        }
        if let Some(csv) = &config.csv {
            builder = builder.logger(CsvLogger::new(&csv.path).with_separator(csv.separator));
        }
        if let Some(pq) = &config.parquet {
            builder = builder
                .logger(ParquetLogger::new(&pq.path).with_flush_interval(pq.flush_interval_rows));
        }
        if let Some(plot) = &config.plot {
            let mut plotter = SvgPlotter::new(&plot.path)
                .size(plot.width, plot.height)
                .every(plot.every);
            if let Some(columns) = &plot.columns {
                plotter = plotter.columns(columns.iter().cloned());
            }
            builder = builder.plot(plotter);
        }
        builder
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn plot(mut self, plot: impl PlotSink + 'static) -> Self {
        self.sinks.add_plot(plot);
        self
    }

    pub fn logger(mut self, logger: impl Logger + 'static) -> Self {
        self.sinks.add_logger(logger);
        self
    }

    pub fn apply_condition<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&Measurement) -> anyhow::Result<()> + Send + 'static,
    {
        self.apply_condition.push(Box::new(hook));
        self
    }

    pub fn conditions(mut self, conditions: ConditionSet) -> Self {
        self.conditions = conditions;
        self
    }

    /// Ticks spent on each condition row (default 1).
    pub fn measurements_per_condition(mut self, n: u64) -> Self {
        self.measurements_per_condition = Some(n);
        self
    }

    /// Rows preallocated in the sample table (at least 2).
    pub fn initial_capacity(mut self, rows: usize) -> Self {
        self.initial_capacity = rows.max(MIN_CAPACITY);
        self
    }

    pub fn build(self) -> Result<Experiment> {
        let sweep = ConditionSweep::new(self.conditions)?;
        let limit = match self.measurements_per_condition {
            Some(0) => {
                return Err(LabError::Construction(
                    "measurements_per_condition must be at least 1".into(),
                ))
            }
            Some(n) if sweep.is_unbounded() => {
                warn!(n, "measurements_per_condition has no effect without conditions");
                RepeatLimit::Unbounded
            }
            Some(n) => RepeatLimit::Count(n),
            None => RepeatLimit::default_for(sweep.conditions()),
        };

        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("labloop-tick")
                .enable_all()
                .build()?,
        );

        debug!(
            experiment = %self.name,
            rows = ?sweep.len(),
            loggers = self.sinks.loggers(),
            "experiment built"
        );

        Ok(Experiment {
            name: self.name,
            hooks: Some(Hooks {
                measure: self.measure,
                apply_condition: self.apply_condition,
                sinks: self.sinks,
            }),
            sweep,
            limit,
            initial_capacity: self.initial_capacity,
            table: Arc::new(Mutex::new(SampleTable::with_capacity(self.initial_capacity))),
            control: Arc::new(Control::default()),
            task: None,
            runtime: Some(runtime),
        })
    }
}

// ─── Stop control ────────────────────────────────────────────────────────────

/// Cancellation token of the current run, replaced on every start.
#[derive(Default)]
struct Control {
    current: Mutex<CancellationToken>,
}

impl Control {
    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *lock(&self.current) = token.clone();
        token
    }

    fn cancel(&self) {
        lock(&self.current).cancel();
    }
}

/// Cloneable handle that stops the current run without waiting for it.
///
/// Safe to use from other threads and from inside callbacks; the run ends
/// after the tick in progress completes.
#[derive(Clone)]
pub struct StopHandle {
    control: Arc<Control>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.control.cancel();
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle").finish_non_exhaustive()
    }
}

// ─── Experiment ──────────────────────────────────────────────────────────────

/// A repeating measurement loop over a condition sweep.
pub struct Experiment {
    name: String,
    /// `None` while a run owns the callbacks.
    hooks: Option<Hooks>,
    sweep: ConditionSweep,
    limit: RepeatLimit,
    initial_capacity: usize,
    table: Arc<Mutex<SampleTable>>,
    control: Arc<Control>,
    task: Option<JoinHandle<TaskOutput>>,
    /// Keep the runtime alive as long as the experiment exists; taken on drop.
    runtime: Option<Arc<Runtime>>,
}

impl Experiment {
    pub fn builder<F>(measure: F) -> ExperimentBuilder
    where
        F: FnMut(&mut Measurement) -> anyhow::Result<()> + Send + 'static,
    {
        ExperimentBuilder::new(Box::new(measure))
    }

    /// An experiment without conditions or sinks.
    pub fn new<F>(measure: F) -> Result<Self>
    where
        F: FnMut(&mut Measurement) -> anyhow::Result<()> + Send + 'static,
    {
        Self::builder(measure).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start a run with ticks `interval` apart (back to back when zero).
    ///
    /// A run already in progress is stopped first and its outcome discarded.
    /// The table is cleared and the sweep rewound.
    pub fn start(&mut self, interval: Duration) -> Result<()> {
        if self.task.is_some() {
            ensure_blocking_allowed()?;
            match self.stop() {
                Ok(summary) => warn!(
                    run_id = %summary.run_id,
                    samples = summary.samples,
                    "previous run stopped by restart"
                ),
                Err(e) => warn!(error = %e, "previous run failed, outcome discarded by restart"),
            }
        }

        let hooks = self.hooks.take().ok_or_else(|| {
            LabError::TickTask("callbacks were lost when an earlier run aborted".into())
        })?;

        *lock(&self.table) = SampleTable::with_capacity(self.initial_capacity);
        let mut sweep = self.sweep.clone();
        sweep.reset();
        let token = self.control.arm();

        let run = Run::new(&self.name, hooks, sweep, self.limit, Arc::clone(&self.table));
        let span = info_span!("run", run_id = %run.id, experiment = %self.name);
        info!(parent: &span, ?interval, "run started");
        let task = self
            .runtime()?
            .spawn(run.execute(interval, token).instrument(span));
        self.task = Some(task);
        Ok(())
    }

    /// Stop the run, wait for the tick in progress and return the outcome.
    ///
    /// Blocks, so it fails with `AsyncContext` on a tokio runtime thread
    /// and leaves the run going.
    pub fn stop(&mut self) -> Result<RunSummary> {
        ensure_blocking_allowed()?;
        self.control.cancel();
        self.join()
    }

    /// Block until the run ends by itself (sweep exhausted, stop handle or
    /// error) and return its outcome.
    pub fn wait_finished(&mut self) -> Result<RunSummary> {
        self.join()
    }

    /// `start` followed by `wait_finished`.
    pub fn run(&mut self, interval: Duration) -> Result<RunSummary> {
        ensure_blocking_allowed()?;
        self.start(interval)?;
        self.wait_finished()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Copy of every sample of the current or most recent run.
    pub fn get_data(&self) -> Snapshot {
        lock(&self.table).snapshot()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            control: Arc::clone(&self.control),
        }
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime
            .as_deref()
            .ok_or_else(|| LabError::TickTask("runtime already shut down".into()))
    }

    fn join(&mut self) -> Result<RunSummary> {
        ensure_blocking_allowed()?;
        let task = self.task.take().ok_or(LabError::NotRunning)?;
        match self.runtime()?.block_on(task) {
            Ok((hooks, outcome)) => {
                self.hooks = Some(hooks);
                outcome
            }
            Err(e) => {
                error!(experiment = %self.name, error = %e, "tick task aborted");
                Err(LabError::TickTask(e.to_string()))
            }
        }
    }
}

/// `Runtime::block_on` and dropping a runtime both panic inside another
/// runtime's context.
fn ensure_blocking_allowed() -> Result<()> {
    match Handle::try_current() {
        Ok(_) => Err(LabError::AsyncContext),
        Err(_) => Ok(()),
    }
}

impl Drop for Experiment {
    fn drop(&mut self) {
        let task = self.task.take();
        if task.is_some() {
            self.control.cancel();
        }
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if ensure_blocking_allowed().is_err() {
            // The cancelled run is abandoned; its loggers are not finished.
            if let Ok(runtime) = Arc::try_unwrap(runtime) {
                runtime.shutdown_background();
            }
            return;
        }
        if let Some(task) = task {
            // Give the cancelled run a moment to finish its loggers
            let _ = runtime.block_on(async { time::timeout(Duration::from_secs(5), task).await });
        }
    }
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ─── Tick task ───────────────────────────────────────────────────────────────

enum Tick {
    Sampled,
    Exhausted,
}

/// State of one run, owned by the tick task.
struct Run {
    id: Uuid,
    experiment: String,
    hooks: Hooks,
    sweep: ConditionSweep,
    limit: RepeatLimit,
    repeats: u64,
    row: ConditionRow,
    first: bool,
    t0: Instant,
    started_at: chrono::DateTime<Utc>,
    table: Arc<Mutex<SampleTable>>,
    samples: usize,
    conditions_applied: usize,
}

impl Run {
    fn new(
        experiment: &str,
        hooks: Hooks,
        sweep: ConditionSweep,
        limit: RepeatLimit,
        table: Arc<Mutex<SampleTable>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            experiment: experiment.to_string(),
            hooks,
            sweep,
            limit,
            // first tick moves onto row 0
            repeats: limit.saturated(),
            row: ConditionRow::default(),
            first: true,
            t0: Instant::now(),
            started_at: Utc::now(),
            table,
            samples: 0,
            conditions_applied: 0,
        }
    }

    async fn execute(mut self, interval: Duration, token: CancellationToken) -> TaskOutput {
        let outcome = self.drive(interval, &token).await;
        let outcome = self.finish(outcome);
        (self.hooks, outcome)
    }

    async fn drive(&mut self, interval: Duration, token: &CancellationToken) -> Result<RunStatus> {
        let mut ticker = (!interval.is_zero()).then(|| {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            match ticker.as_mut() {
                Some(ticker) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {}
                        _ = ticker.tick() => {}
                    }
                }
                None => tokio::task::yield_now().await,
            }
            if token.is_cancelled() {
                return Ok(RunStatus::Stopped);
            }
            if let Tick::Exhausted = self.tick()? {
                return Ok(RunStatus::Completed);
            }
        }
    }

    fn tick(&mut self) -> Result<Tick> {
        let elapsed = self.t0.elapsed().as_secs_f64();

        let mut changed = false;
        if self.limit.reached(self.repeats) {
            self.repeats = 0;
            match self.sweep.next_row() {
                SweepStep::Row(row) => {
                    self.row = row;
                    changed = true;
                }
                SweepStep::Exhausted => {
                    debug!(rows = self.conditions_applied, "sweep exhausted");
                    return Ok(Tick::Exhausted);
                }
            }
        }
        self.repeats += 1;

        let mut measurement = Measurement::new(elapsed, self.row.assignments());

        if changed {
            self.conditions_applied += 1;
            debug!(row = self.row.index(), conditions = ?self.row.assignments(), "applying condition");
            for hook in &mut self.hooks.apply_condition {
                hook(&measurement).map_err(|e| LabError::failure(Stage::ApplyCondition, e))?;
            }
        }

        (self.hooks.measure)(&mut measurement)
            .map_err(|e| LabError::failure(Stage::Measure, e))?;

        let row = lock(&self.table).append(&measurement)?;
        self.samples += 1;

        if self.first {
            self.first = false;
            debug!(schema = %row.schema(), "first sample");
            self.hooks.sinks.start(&row)?;
        }
        self.hooks.sinks.log(&row)?;

        if self.hooks.sinks.has_plots() {
            let snapshot = lock(&self.table).snapshot();
            self.hooks.sinks.render(&snapshot)?;
        }

        trace!(sample = self.samples, time = elapsed, "tick");
        Ok(Tick::Sampled)
    }

    /// Close the loggers and turn the loop outcome into the run outcome.
    fn finish(&mut self, outcome: Result<RunStatus>) -> Result<RunSummary> {
        let finished = self.hooks.sinks.finish();
        match (outcome, finished) {
            (Ok(status), Ok(())) => {
                let summary = RunSummary {
                    run_id: self.id,
                    experiment: self.experiment.clone(),
                    status,
                    samples: self.samples,
                    conditions_applied: self.conditions_applied,
                    started_at: self.started_at,
                    finished_at: Utc::now(),
                    duration_secs: self.t0.elapsed().as_secs_f64(),
                };
                info!(
                    status = %summary.status,
                    samples = summary.samples,
                    duration_secs = summary.duration_secs,
                    "run finished"
                );
                Ok(summary)
            }
            (Ok(_), Err(e)) => {
                error!(error = %e, samples = self.samples, "run failed while closing loggers");
                Err(e)
            }
            (Err(e), finished) => {
                if let Err(fe) = finished {
                    warn!(error = %fe, "logger finish failed after run error");
                }
                error!(error = %e, samples = self.samples, "run failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;

    #[test]
    fn zero_repeats_is_rejected() {
        let err = Experiment::builder(|_| Ok(()))
            .conditions(ConditionSet::new().vary("v", [1]))
            .measurements_per_condition(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, LabError::Construction(_)));
    }

    #[test]
    fn repeats_without_conditions_stay_unbounded() {
        let exp = Experiment::builder(|_| Ok(()))
            .measurements_per_condition(3)
            .build()
            .unwrap();
        assert_eq!(exp.limit, RepeatLimit::Unbounded);
    }

    #[test]
    fn stop_when_idle_is_not_running() {
        let mut exp = Experiment::new(|_| Ok(())).unwrap();
        assert!(!exp.is_running());
        assert!(matches!(exp.stop(), Err(LabError::NotRunning)));
        assert!(matches!(exp.wait_finished(), Err(LabError::NotRunning)));
    }

    #[test]
    fn overwriting_a_condition_is_a_schema_mismatch() {
        let mut exp = Experiment::builder(|m| {
            m.set("v", 10)?;
            Ok(())
        })
        .conditions(ConditionSet::new().vary("v", [Value::Int(1)]))
        .build()
        .unwrap();
        let err = exp.run(Duration::ZERO).unwrap_err();
        assert!(matches!(err, LabError::SchemaMismatch { .. }));
        assert!(exp.get_data().is_empty());
    }

    #[test]
    fn empty_sweep_completes_without_samples() {
        let set = ConditionSet::grid(vec![("v".into(), vec![])]);
        let mut exp = Experiment::builder(|_| Ok(())).conditions(set).build().unwrap();
        let summary = exp.run(Duration::ZERO).unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.samples, 0);
    }

    #[test]
    fn first_tick_waits_one_interval() {
        let stop_after_one = Arc::new(Mutex::new(None::<StopHandle>));
        let handle = Arc::clone(&stop_after_one);
        let mut exp = Experiment::new(move |m| {
            m.set("x", 1.0)?;
            if let Some(h) = lock(&handle).as_ref() {
                h.stop();
            }
            Ok(())
        })
        .unwrap();
        *lock(&stop_after_one) = Some(exp.stop_handle());

        exp.run(Duration::from_millis(40)).unwrap();
        let data = exp.get_data();
        assert_eq!(data.len(), 1);
        assert!(data.floats("time").unwrap()[0] >= 0.035);
    }

    #[tokio::test]
    async fn dropping_inside_an_async_runtime_does_not_panic() {
        let idle = Experiment::new(|_| Ok(())).unwrap();
        drop(idle);

        let mut running = Experiment::new(|m| {
            m.set("x", 1.0)?;
            Ok(())
        })
        .unwrap();
        running.start(Duration::from_millis(5)).unwrap();
        assert!(matches!(running.wait_finished(), Err(LabError::AsyncContext)));
        assert!(matches!(running.stop(), Err(LabError::AsyncContext)));
        assert!(matches!(running.start(Duration::ZERO), Err(LabError::AsyncContext)));
        assert!(running.is_running());
        drop(running);
    }

    #[tokio::test]
    async fn run_inside_an_async_runtime_is_refused_before_starting() {
        let mut exp = Experiment::new(|_| Ok(())).unwrap();
        assert!(matches!(exp.run(Duration::ZERO), Err(LabError::AsyncContext)));
        assert!(!exp.is_running());
    }

    #[tokio::test]
    async fn plain_thread_can_drive_a_run_from_an_async_host() {
        let summary = std::thread::spawn(|| {
            let mut exp = Experiment::builder(|m| {
                m.set("x", 1.0)?;
                Ok(())
            })
            .conditions(ConditionSet::new().vary("v", [1, 2]))
            .build()?;
            exp.run(Duration::ZERO)
        })
        .join()
        .unwrap()
        .unwrap();
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.status, RunStatus::Completed);
    }
}
