//! MeasurementEngine - run orchestration state machine
//!
//! Sequences one measurement run from device snapshot to written report.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  run()  ┌───────────┐     ┌────────────┐     ┌──────────────────────┐
//! │ Idle │────────▶│ Preparing │────▶│ Validating │────▶│ AwaitingConfirmation │
//! └──────┘         └───────────┘     └─────┬──────┘     └──────────┬───────────┘
//!    ▲                                     │ no warnings            │ confirmed
//!    │                                     ▼                        │
//!    │            ┌────────────┐      ┌─────────┐                   │
//!    └────────────│ Finalizing │◀─────│ Running │◀──────────────────┘
//!                 └────────────┘      └─────────┘
//! ```
//!
//! Every path, including faults and cancellation, leaves through
//! `Finalizing`, which saves whatever data exists, settles the thermal
//! chamber, shows exactly one completion message and returns to `Idle`.
//!
//! `Running` nests an optional temperature loop around the relay loop, which
//! in turn invokes the category executors once per sample.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = MeasurementEngine::new(collaborators);
//! let report = engine
//!     .run(Some("lot7"), &registry, &tabs, &config.run, &config.debug)
//!     .await?;
//! println!("{}", report.summary);
//! ```

use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::config::{DebugOptions, RunSettings};
use crate::device::{AddressRecord, Device, DeviceId};
use crate::dialog::Dialog;
use crate::error::{MeasError, MeasResult, Severity};
use crate::executor::{CategoryExecutor, ExecutionContext};
use crate::registry::DeviceRegistry;
use crate::relay::{RelayMultiplexer, RelayTransport, SampleStep};
use crate::report::{ReportWriter, ResultAggregator};
use crate::rowlog::RowLog;
use crate::settings::{Category, CategoryBinding, TabSet};
use crate::thermal::ThermalController;
use crate::validation::{Validator, Verdict};

/// Completion message used when a run produced no annotation.
pub const COMPLETED_NORMALLY: &str = "Measurement completed normally.";

/// Summary header of a cancelled run.
pub const INTERRUPTED: &str = "Run interrupted by user; partial data preserved.";

/// Summary header of a faulted run.
pub const FAILED: &str = "Run failed.";

/// Annotation recorded when no category has an enabled tab.
pub const NOTHING_SELECTED: &str = "No measurement item is selected; nothing was measured.";

const DIALOG_TITLE: &str = "Measurement";

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Ready to accept a run
    Idle,
    /// Snapshotting options and devices
    Preparing,
    /// Address, plan and category checks
    Validating,
    /// Waiting for the operator to accept auto-range warnings
    AwaitingConfirmation,
    /// Temperature/relay/category loops
    Running,
    /// Saving, settling the chamber, reporting
    Finalizing,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Preparing => write!(f, "preparing"),
            EngineState::Validating => write!(f, "validating"),
            EngineState::AwaitingConfirmation => write!(f, "awaiting confirmation"),
            EngineState::Running => write!(f, "running"),
            EngineState::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Faulted,
}

/// Result of one run, returned once the engine is idle again.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    /// Text shown in the completion message
    pub summary: String,
    /// Written report file, if any
    pub report_path: Option<PathBuf>,
    /// Everything the run logged, data and annotations
    pub log: RowLog,
}

/// Everything the engine talks to, constructed once by the caller.
pub struct Collaborators {
    pub validator: Validator,
    /// At most one executor per category is used; the first registered wins
    pub executors: Vec<Arc<dyn CategoryExecutor>>,
    pub relay: Arc<dyn RelayTransport>,
    pub thermal: Arc<dyn ThermalController>,
    pub aggregator: Arc<dyn ResultAggregator>,
    pub dialog: Arc<dyn Dialog>,
    pub writer: ReportWriter,
}

#[derive(Debug, Clone, PartialEq)]
enum SaveState {
    NotAttempted,
    Skipped,
    Written(PathBuf),
    Failed,
}

/// Why the pipeline stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineEnd {
    Measured,
    NothingSelected,
}

/// Per-run state, owned by the run and dropped with it.
struct RunContext {
    debug: DebugOptions,
    records: Vec<AddressRecord>,
    plan: RunSettings,
    cancel: CancelFlag,
    log: RowLog,
    bindings: Vec<(Arc<dyn CategoryExecutor>, CategoryBinding)>,
    save: SaveState,
    thermal_initialized: bool,
    notes: Vec<String>,
}

impl RunContext {
    fn record(&self, id: DeviceId) -> Option<&AddressRecord> {
        self.records
            .iter()
            .find(|r| r.id == id && r.checked && !r.address.trim().is_empty())
    }

    /// Record a warning; fatal when `stop_on_warning` is set.
    fn warn(&mut self, message: String) -> MeasResult<()> {
        warn!(message = %message, "Run warning");
        self.log.annotate(message.clone());
        if self.debug.stop_on_warning {
            Err(MeasError::fatal(message))
        } else {
            Ok(())
        }
    }
}

struct CategoryPrep {
    category: Category,
    binding: CategoryBinding,
    structure: Verdict,
    auto_range: Verdict,
}

/// The run orchestrator. At most one run is in flight at a time.
pub struct MeasurementEngine {
    collab: Collaborators,
    state: RwLock<EngineState>,
    /// Cancellation flag of the active run
    active: Mutex<Option<CancelFlag>>,
}

/// Returns the engine to `Idle` even if the run future is dropped early.
///
/// Releasing is tied to the run's cancel flag, so a guard outliving its run
/// never touches a run started after it.
struct IdleGuard<'a> {
    engine: &'a MeasurementEngine,
    run: CancelFlag,
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.engine.release(&self.run);
    }
}

impl MeasurementEngine {
    pub fn new(collab: Collaborators) -> Self {
        Self {
            collab,
            state: RwLock::new(EngineState::Idle),
            active: Mutex::new(None),
        }
    }

    /// Get current engine state
    pub fn state(&self) -> EngineState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request cooperative cancellation of the active run.
    ///
    /// The run stops at its next safe point (top of a temperature or sample
    /// iteration) and still finalizes.
    pub fn cancel(&self) -> MeasResult<()> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_ref() {
            Some(flag) => {
                info!("Cancellation requested");
                flag.cancel();
                Ok(())
            }
            None => Err(MeasError::fatal("Cannot cancel: no run in progress")),
        }
    }

    fn set_state(&self, next: EngineState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        debug!(from = %*state, to = %next, "Engine state");
        *state = next;
    }

    /// Leave `Idle`, or fail if a run is already active.
    fn begin(&self) -> MeasResult<CancelFlag> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != EngineState::Idle {
            return Err(MeasError::Busy(format!("Cannot start: engine is {}", *state)));
        }
        *state = EngineState::Preparing;
        let flag = CancelFlag::new();
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(flag.clone());
        Ok(flag)
    }

    /// Return to `Idle` if `run` is still the active run. Lock order matches
    /// [`MeasurementEngine::begin`].
    fn release(&self, run: &CancelFlag) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|flag| flag.same_as(run)) {
            *active = None;
            *state = EngineState::Idle;
        }
    }

    /// Execute one measurement run.
    ///
    /// `output_name` names the report file; `None` uses the timestamped
    /// default. Device and tab state is copied at the start; later changes by
    /// the caller do not affect the run.
    ///
    /// Returns `MeasError::Busy` if a run is already active. Every other
    /// failure is reported through the returned [`RunReport`].
    pub async fn run(
        &self,
        output_name: Option<&str>,
        registry: &DeviceRegistry,
        tabs: &TabSet,
        plan: &RunSettings,
        debug: &DebugOptions,
    ) -> MeasResult<RunReport> {
        let cancel = self.begin()?;
        let _idle = IdleGuard {
            engine: self,
            run: cancel.clone(),
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);
        let report = async {
            info!(output = ?output_name, "Run started");
            let mut ctx = RunContext {
                debug: debug.clone(),
                records: registry.snapshot(),
                plan: plan.clone(),
                cancel,
                log: RowLog::new(),
                bindings: Vec::new(),
                save: SaveState::NotAttempted,
                thermal_initialized: false,
                notes: Vec::new(),
            };
            let result = self.pipeline(&mut ctx, tabs, output_name).await;
            self.finalize(run_id, ctx, result, output_name).await
        }
        .instrument(span)
        .await;
        Ok(report)
    }

    async fn pipeline(
        &self,
        ctx: &mut RunContext,
        tabs: &TabSet,
        output_name: Option<&str>,
    ) -> MeasResult<PipelineEnd> {
        self.set_state(EngineState::Validating);
        self.validate_devices(ctx, output_name)?;

        if tabs.enabled_categories().is_empty() {
            info!("No category enabled");
            ctx.log.annotate(NOTHING_SELECTED);
            return Ok(PipelineEnd::NothingSelected);
        }

        let warnings = self.prepare_categories(ctx, tabs)?;
        if !warnings.is_empty() {
            self.set_state(EngineState::AwaitingConfirmation);
            for warning in &warnings {
                ctx.log.annotate(warning.clone());
            }
            let question = format!(
                "{}\n\nAuto range may give unrepeatable results. Continue?",
                warnings.join("\n")
            );
            if !self.collab.dialog.confirm("Auto range", &question).await {
                return Err(MeasError::fatal("Auto-range warnings were not accepted"));
            }
        }

        self.set_state(EngineState::Running);
        if ctx.plan.multi_temperature {
            self.temperature_loop(ctx).await?;
        } else {
            self.relay_loop(ctx, None).await?;
        }

        self.save(ctx, output_name).await?;
        Ok(PipelineEnd::Measured)
    }

    /// Address rules, run-plan checks and the report name. Nothing has
    /// touched hardware yet.
    fn validate_devices(&self, ctx: &mut RunContext, output_name: Option<&str>) -> MeasResult<()> {
        let validator = &self.collab.validator;
        let mut verdict = validator.validate_addresses(&ctx.records);
        verdict.merge(validator.validate_run_plan(&ctx.plan));

        if let Err(e) = self.collab.writer.path_for(output_name) {
            verdict.fail(e.to_string());
        }

        if ctx.plan.multi_sample && ctx.record(DeviceId::Relay).is_none() {
            verdict.fail("Multi-sample mode requires the relay controller to be selected");
        }
        if ctx.plan.multi_temperature && ctx.record(DeviceId::Thermo).is_none() {
            verdict.fail("Multi-temperature mode requires the thermal chamber to be selected");
        }

        for message in &verdict.messages {
            ctx.log.annotate(message.clone());
        }
        if !verdict.ok {
            error!(problems = verdict.messages.len(), "Device validation failed");
            return Err(MeasError::fatal("Device validation failed"));
        }
        Ok(())
    }

    /// Build and check the binding of every enabled category.
    ///
    /// Each category is prepared from the snapshot alone, independent of the
    /// others; results are applied to the run only after all are built.
    /// Returns the auto-range warnings of the categories that were kept.
    fn prepare_categories(&self, ctx: &mut RunContext, tabs: &TabSet) -> MeasResult<Vec<String>> {
        let preps: Vec<CategoryPrep> = tabs
            .enabled_categories()
            .into_iter()
            .map(|category| self.prepare_category(category, tabs, &ctx.records))
            .collect();

        let mut warnings = Vec::new();
        for prep in preps {
            for message in &prep.structure.messages {
                ctx.log.annotate(message.clone());
            }
            if !prep.structure.ok {
                ctx.warn(format!("{}: skipped, settings are incomplete", prep.category))?;
                continue;
            }
            let executor = self
                .collab
                .executors
                .iter()
                .find(|e| e.category() == prep.category)
                .cloned();
            let Some(executor) = executor else {
                ctx.warn(format!("{}: skipped, no executor is registered", prep.category))?;
                continue;
            };
            debug!(category = %prep.category, devices = prep.binding.devices.len(), "Category prepared");
            warnings.extend(prep.auto_range.messages);
            ctx.bindings.push((executor, prep.binding));
        }

        if ctx.bindings.is_empty() {
            return Err(MeasError::fatal("No enabled category can be measured"));
        }
        Ok(warnings)
    }

    fn prepare_category(
        &self,
        category: Category,
        tabs: &TabSet,
        records: &[AddressRecord],
    ) -> CategoryPrep {
        let validator = &self.collab.validator;
        let enabled: Vec<_> = tabs.enabled(category).into_iter().cloned().collect();
        let mut structure = Verdict::pass();
        let mut devices: Vec<Device> = Vec::new();

        for tab in &enabled {
            structure.merge(validator.check_numeric(&tab.name, &tab.numeric_inputs));
            for id in tab.devices() {
                let Some(record) = records
                    .iter()
                    .find(|r| r.id == id && r.checked && !r.address.trim().is_empty())
                else {
                    continue;
                };
                let index = match devices.iter().position(|d| d.id == id) {
                    Some(index) => index,
                    None => {
                        devices.push(Device::from_record(record));
                        devices.len() - 1
                    }
                };
                if let Err(e) = devices[index].insert_setting(tab.name.clone(), tab.payload.clone()) {
                    structure.fail(e.to_string());
                }
            }
        }

        let binding = CategoryBinding {
            category,
            tabs: enabled,
            devices,
        };
        structure.merge(validator.check_category(&binding, records));
        let auto_range = validator.check_auto_range(&binding.tabs);

        CategoryPrep {
            category,
            binding,
            structure,
            auto_range,
        }
    }

    async fn temperature_loop(&self, ctx: &mut RunContext) -> MeasResult<()> {
        let address = ctx
            .record(DeviceId::Thermo)
            .map(|r| r.address.clone())
            .unwrap_or_default();
        self.collab
            .thermal
            .initialize(&address)
            .await
            .map_err(|e| {
                MeasError::Instrument(format!("Thermal chamber initialization failed: {}", e))
            })?;
        ctx.thermal_initialized = true;

        let set_points = ctx.plan.temperatures.clone();
        for celsius in set_points {
            ctx.cancel.check()?;
            info!(celsius, "Moving to set point");
            match self
                .collab
                .thermal
                .set_and_stabilize(celsius, ctx.debug.thermal_soak)
                .await
            {
                Ok(()) => self.relay_loop(ctx, Some(celsius)).await?,
                Err(e) => ctx.warn(format!("Temperature {}°C: {}", celsius, e))?,
            }
        }
        Ok(())
    }

    async fn relay_loop(&self, ctx: &mut RunContext, temperature: Option<f64>) -> MeasResult<()> {
        let serial = ctx
            .record(DeviceId::Relay)
            .map(|r| r.address.clone())
            .unwrap_or_default();
        let mux = RelayMultiplexer::new(self.collab.relay.clone(), serial);

        let mut pass = CategoryPass {
            bindings: &ctx.bindings,
            temperature,
            debug: &ctx.debug,
            cancel: &ctx.cancel,
        };
        mux.run_samples(
            ctx.plan.sample_mode(),
            &ctx.cancel,
            &mut ctx.log,
            &mut pass,
            ctx.debug.stop_on_warning,
        )
        .await
    }

    /// Write the report once. Fewer than two data rows are not worth a file.
    async fn save(&self, ctx: &mut RunContext, output_name: Option<&str>) -> MeasResult<()> {
        if ctx.save != SaveState::NotAttempted {
            return Ok(());
        }
        let data = ctx.log.data_rows();
        if data.len() < 2 {
            info!(rows = data.len(), "Too few data rows, report not written");
            ctx.save = SaveState::Skipped;
            return Ok(());
        }

        ctx.save = SaveState::Failed;
        let mut lines = self.collab.aggregator.create_pivot_rows(
            &data,
            ctx.plan.multi_temperature,
            ctx.plan.multi_sample,
        )?;
        if !ctx.debug.suppress_footer {
            let devices = footer_devices(&ctx.bindings);
            lines.extend(self.collab.aggregator.build_settings_footer(&devices)?);
        }
        let path = self.collab.writer.write(output_name, &lines).await?;
        ctx.save = SaveState::Written(path);
        Ok(())
    }

    async fn finalize(
        &self,
        run_id: Uuid,
        mut ctx: RunContext,
        result: MeasResult<PipelineEnd>,
        output_name: Option<&str>,
    ) -> RunReport {
        self.set_state(EngineState::Finalizing);

        let (outcome, header) = match &result {
            Ok(_) => (RunOutcome::Completed, None),
            Err(e) if e.is_cancelled() => {
                info!("Run cancelled");
                (RunOutcome::Cancelled, Some(INTERRUPTED))
            }
            Err(e) => {
                error!(error = %e, "Run aborted");
                ctx.log.annotate(e.to_string());
                (RunOutcome::Faulted, Some(FAILED))
            }
        };

        if let Err(e) = self.save(&mut ctx, output_name).await {
            error!(error = %e, "Saving report failed");
            ctx.notes.push(format!("Report could not be saved: {}", e));
        }
        match &ctx.save {
            SaveState::Written(path) => ctx.notes.push(format!("Report: {}", path.display())),
            SaveState::Skipped if !matches!(result, Ok(PipelineEnd::NothingSelected)) => ctx
                .notes
                .push("No report written: fewer than two data rows.".to_string()),
            _ => {}
        }

        if ctx.thermal_initialized {
            let thermal = &self.collab.thermal;
            let settled = match outcome {
                RunOutcome::Completed => thermal.restore_neutral().await,
                RunOutcome::Cancelled | RunOutcome::Faulted => thermal.stop_control().await,
            };
            if let Err(e) = settled {
                warn!(error = %e, "Thermal chamber did not settle");
                ctx.notes.push(format!("Thermal chamber: {}", e));
            }
        }

        let summary = summarize(header, &ctx.log, &ctx.notes, ctx.debug.max_log_lines);
        let report_path = match &ctx.save {
            SaveState::Written(path) => Some(path.clone()),
            _ => None,
        };
        info!(?outcome, rows = ctx.log.data_len(), "Run finished");

        self.release(&ctx.cancel);
        match outcome {
            RunOutcome::Faulted => self.collab.dialog.show_error(DIALOG_TITLE, &summary),
            RunOutcome::Completed | RunOutcome::Cancelled => {
                self.collab.dialog.show_message(DIALOG_TITLE, &summary)
            }
        }

        RunReport {
            run_id,
            outcome,
            summary,
            report_path,
            log: ctx.log,
        }
    }
}

/// Devices of all bindings, merged by id, for the settings footer.
fn footer_devices(bindings: &[(Arc<dyn CategoryExecutor>, CategoryBinding)]) -> Vec<Device> {
    let mut merged: Vec<Device> = Vec::new();
    for (_, binding) in bindings {
        for device in &binding.devices {
            match merged.iter_mut().find(|d| d.id == device.id) {
                Some(existing) => {
                    for (tab, payload) in device.settings() {
                        // Tab names are unique across categories; a clash keeps the first.
                        let _ = existing.insert_setting(tab, payload.clone());
                    }
                }
                None => merged.push(device.clone()),
            }
        }
    }
    merged
}

fn summarize(header: Option<&str>, log: &RowLog, notes: &[String], max_lines: usize) -> String {
    let annotations = log.annotations();
    let mut lines: Vec<String> = header.map(str::to_string).into_iter().collect();

    if annotations.is_empty() && header.is_none() {
        lines.push(COMPLETED_NORMALLY.to_string());
    }
    lines.extend(annotations.iter().take(max_lines).map(|a| a.to_string()));
    if annotations.len() > max_lines {
        lines.push(format!("... {} more", annotations.len() - max_lines));
    }
    lines.extend(notes.iter().cloned());
    lines.join("\n")
}

/// Invokes every prepared category executor for one sample.
struct CategoryPass<'a> {
    bindings: &'a [(Arc<dyn CategoryExecutor>, CategoryBinding)],
    temperature: Option<f64>,
    debug: &'a DebugOptions,
    cancel: &'a CancelFlag,
}

#[async_trait::async_trait]
impl<'a> SampleStep for CategoryPass<'a> {
    async fn run_sample(&mut self, sample: Option<u8>, log: &mut RowLog) -> MeasResult<()> {
        for (executor, binding) in self.bindings {
            let ctx = ExecutionContext {
                binding,
                temperature: self.temperature,
                sample,
                debug: self.debug,
                cancel: self.cancel,
            };
            debug!(category = %binding.category, ?sample, temperature = ?self.temperature, "Executing category");
            match executor.execute(&ctx, log).await {
                Ok(()) => {}
                Err(e) if e.severity() == Some(Severity::Warning) => {
                    let message = format!("{}{}: {}", binding.category, position(self.temperature, sample), e);
                    warn!(message = %message, "Category warning");
                    log.annotate(message);
                    if self.debug.stop_on_warning {
                        return Err(e.escalate());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn position(temperature: Option<f64>, sample: Option<u8>) -> String {
    match (temperature, sample) {
        (Some(t), Some(s)) => format!(" at {}°C, sample {}", t, s),
        (Some(t), None) => format!(" at {}°C", t),
        (None, Some(s)) => format!(" on sample {}", s),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_defaults_when_clean() {
        let log = RowLog::new();
        assert_eq!(summarize(None, &log, &[], 10), COMPLETED_NORMALLY);
    }

    #[test]
    fn summary_caps_annotations() {
        let mut log = RowLog::new();
        for i in 0..5 {
            log.annotate(format!("note {}", i));
        }
        log.push_data("1,2,3");
        let summary = summarize(Some(INTERRUPTED), &log, &["Report: x.csv".to_string()], 2);
        assert_eq!(
            summary,
            format!("{}\nnote 0\nnote 1\n... 3 more\nReport: x.csv", INTERRUPTED)
        );
    }

    #[test]
    fn position_describes_loop_point() {
        assert_eq!(position(Some(25.0), Some(2)), " at 25°C, sample 2");
        assert_eq!(position(None, None), "");
    }
}
