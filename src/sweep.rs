//! Sweep Orchestrator
//!
//! A sweep is described by a [`SweepRequest`], checked and turned into a
//! [`SweepPlan`] without touching the instrument, then executed by a
//! [`SweepOrchestrator`]:
//!
//! ```text
//! Configuring ──► Armed ──► Running ──► Complete
//!      │            │          │
//!      └────────────┴──────────┴──► Failed
//! ```
//!
//! - *Configuring*: measure settings, source settings (no level), clear the
//!   target buffer and, for a custom list, store each level in the
//!   configuration list.
//! - *Armed*: the single sweep command is written. It only describes the sweep.
//! - *Running*: `trigger.model.initiate()` starts it and `waitcomplete()` blocks
//!   until the trigger model is idle, followed by a short settle delay.
//! - *Complete*: the completion notice is posted.
//!
//! There is no progress reporting and no cancellation: the wait is a single
//! blocking call bounded only by the transport's own timeout.

use crate::buffer::BufferRegistry;
use crate::config::SessionConfig;
use crate::connection::ConnectionHandle;
use crate::error::{SmuError, SmuResult};
use crate::mode::SourceMeasureSettings;
use crate::sequencer;
use crate::tsp::{self, SweepArgs};
use crate::validation::{is_finite, is_in_range, is_quotable};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, instrument};

/// Fewest points a sweep can have.
pub const MIN_SWEEP_POINTS: u32 = 2;
/// Most points a sweep can have.
pub const MAX_SWEEP_POINTS: u32 = 1_000_000;
/// Most times a sweep can be repeated.
pub const MAX_SWEEP_ITERATIONS: u32 = 268_435_455;
/// Shortest non-zero delay between source and measure, in seconds.
pub const MIN_SWEEP_DELAY: f64 = 50e-6;
/// Longest delay between source and measure, in seconds.
pub const MAX_SWEEP_DELAY: f64 = 1e4;
/// Configuration list name used when the request does not give one.
pub const DEFAULT_CONFIG_LIST: &str = "SmuSweep";

/// Shape of the source levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SweepSpec {
    /// Evenly spaced levels, given as a point count.
    ByPoints {
        start: f64,
        stop: f64,
        points: u32,
        delay: f64,
        iterations: u32,
    },
    /// Evenly spaced levels, given as a step; the point count is derived.
    ByStep {
        start: f64,
        stop: f64,
        step: f64,
        delay: f64,
        iterations: u32,
    },
    /// Logarithmically spaced levels, given as a point count.
    Logarithmic {
        start: f64,
        stop: f64,
        points: u32,
        delay: f64,
        iterations: u32,
    },
    /// Explicit ordered levels.
    CustomList {
        levels: Vec<f64>,
        delay: f64,
        iterations: u32,
    },
}

/// Number of points of a stepped sweep: `floor((stop - start) / step) + 1`.
///
/// The quotient is nudged up by a few ULP to absorb round-off only, so `0..1`
/// in steps of `0.1` gives 11 points rather than 10.
pub fn step_point_count(start: f64, stop: f64, step: f64) -> SmuResult<u32> {
    for (field, value) in [("start", start), ("stop", stop), ("step", step)] {
        is_finite(value)
            .map_err(|reason| SmuError::configuration(format!("sweep {field}: {reason}")))?;
    }
    if step <= 0.0 {
        return Err(SmuError::configuration(format!(
            "sweep step {step} must be greater than zero"
        )));
    }
    let quotient = (stop - start) / step;
    let intervals = (quotient + quotient.abs() * 4.0 * f64::EPSILON).floor();
    if intervals < f64::from(MIN_SWEEP_POINTS - 1) {
        return Err(SmuError::configuration(format!(
            "sweep from {start} to {stop} in steps of {step} has fewer than {MIN_SWEEP_POINTS} points"
        )));
    }
    if intervals >= f64::from(MAX_SWEEP_POINTS) {
        return Err(SmuError::configuration(format!(
            "sweep from {start} to {stop} in steps of {step} has more than {MAX_SWEEP_POINTS} points"
        )));
    }
    Ok(intervals as u32 + 1)
}

impl SweepSpec {
    pub fn delay(&self) -> f64 {
        match self {
            SweepSpec::ByPoints { delay, .. }
            | SweepSpec::ByStep { delay, .. }
            | SweepSpec::Logarithmic { delay, .. }
            | SweepSpec::CustomList { delay, .. } => *delay,
        }
    }

    pub fn iterations(&self) -> u32 {
        match self {
            SweepSpec::ByPoints { iterations, .. }
            | SweepSpec::ByStep { iterations, .. }
            | SweepSpec::Logarithmic { iterations, .. }
            | SweepSpec::CustomList { iterations, .. } => *iterations,
        }
    }

    /// Source points per pass.
    pub fn point_count(&self) -> SmuResult<u32> {
        match self {
            SweepSpec::ByPoints { points, .. } | SweepSpec::Logarithmic { points, .. } => {
                Ok(*points)
            }
            SweepSpec::ByStep {
                start, stop, step, ..
            } => step_point_count(*start, *stop, *step),
            SweepSpec::CustomList { levels, .. } => u32::try_from(levels.len())
                .map_err(|_| SmuError::configuration("custom list has too many levels")),
        }
    }

    /// Label shown on the instrument while the sweep runs.
    pub fn label(&self) -> &'static str {
        match self {
            SweepSpec::ByPoints { .. } => "Linear Sweep",
            SweepSpec::ByStep { .. } => "Linear Step Sweep",
            SweepSpec::Logarithmic { .. } => "Log Sweep",
            SweepSpec::CustomList { .. } => "Custom Sweep",
        }
    }

    /// Check every parameter. `dual` is only meaningful for the generated shapes.
    pub fn validate(&self, dual: bool) -> SmuResult<()> {
        let delay = self.delay();
        if !(delay == 0.0 || (MIN_SWEEP_DELAY..=MAX_SWEEP_DELAY).contains(&delay)) {
            return Err(SmuError::configuration(format!(
                "sweep delay {delay} s must be 0 or between {MIN_SWEEP_DELAY} and {MAX_SWEEP_DELAY}"
            )));
        }
        is_in_range(self.iterations(), 1..=MAX_SWEEP_ITERATIONS).map_err(|_| {
            SmuError::configuration(format!(
                "sweep iterations {} must be between 1 and {MAX_SWEEP_ITERATIONS}",
                self.iterations()
            ))
        })?;

        match self {
            SweepSpec::ByPoints {
                start, stop, points, ..
            } => {
                check_bounds(*start, *stop)?;
                check_points(*points)
            }
            SweepSpec::ByStep {
                start, stop, step, ..
            } => step_point_count(*start, *stop, *step).map(|_| ()),
            SweepSpec::Logarithmic {
                start, stop, points, ..
            } => {
                check_bounds(*start, *stop)?;
                if *start == 0.0 || *stop == 0.0 || start.signum() != stop.signum() {
                    return Err(SmuError::configuration(format!(
                        "logarithmic sweep from {start} to {stop} needs non-zero bounds of the same sign"
                    )));
                }
                check_points(*points)
            }
            SweepSpec::CustomList { levels, .. } => {
                if levels.is_empty() {
                    return Err(SmuError::configuration("custom list sweep needs at least one level"));
                }
                if let Some(bad) = levels.iter().find(|l| !l.is_finite()) {
                    return Err(SmuError::configuration(format!(
                        "custom list level {bad} is not a finite number"
                    )));
                }
                if dual {
                    return Err(SmuError::configuration(
                        "custom list sweeps run in list order only; dual is not supported",
                    ));
                }
                Ok(())
            }
        }
    }
}

fn check_bounds(start: f64, stop: f64) -> SmuResult<()> {
    is_finite(start)
        .and_then(|_| is_finite(stop))
        .map_err(|reason| SmuError::configuration(format!("sweep bounds: {reason}")))
}

fn check_points(points: u32) -> SmuResult<()> {
    is_in_range(points, MIN_SWEEP_POINTS..=MAX_SWEEP_POINTS).map_err(|_| {
        SmuError::configuration(format!(
            "sweep point count {points} must be between {MIN_SWEEP_POINTS} and {MAX_SWEEP_POINTS}"
        ))
    })
}

/// Everything needed to run one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRequest {
    pub settings: SourceMeasureSettings,
    pub spec: SweepSpec,
    /// Name of the configuration list the sweep is stored under
    #[serde(default = "default_config_list")]
    pub config_list: String,
    /// Abort when the source limit is exceeded
    #[serde(default = "default_fail_abort")]
    pub fail_abort: bool,
    /// Run start to stop, then stop to start
    #[serde(default)]
    pub dual: bool,
    /// Target buffer; the active buffer when `None`
    #[serde(default)]
    pub buffer: Option<String>,
}

fn default_config_list() -> String {
    DEFAULT_CONFIG_LIST.to_string()
}

fn default_fail_abort() -> bool {
    true
}

impl SweepRequest {
    pub fn new(settings: SourceMeasureSettings, spec: SweepSpec) -> Self {
        Self {
            settings,
            spec,
            config_list: default_config_list(),
            fail_abort: default_fail_abort(),
            dual: false,
            buffer: None,
        }
    }

    pub fn with_config_list(mut self, name: impl Into<String>) -> Self {
        self.config_list = name.into();
        self
    }

    pub fn with_fail_abort(mut self, fail_abort: bool) -> Self {
        self.fail_abort = fail_abort;
        self
    }

    pub fn with_dual(mut self, dual: bool) -> Self {
        self.dual = dual;
        self
    }

    pub fn with_buffer(mut self, buffer: impl Into<String>) -> Self {
        self.buffer = Some(buffer.into());
        self
    }

    pub fn validate(&self) -> SmuResult<()> {
        is_quotable(&self.config_list).map_err(|reason| {
            SmuError::configuration(format!(
                "configuration list name '{}': {reason}",
                self.config_list
            ))
        })?;
        self.settings.validate()?;
        self.spec.validate(self.dual)
    }

    /// The one command that describes the sweep to the instrument.
    pub fn sweep_command(&self, buffer: &str) -> String {
        let count = self.spec.iterations();
        let delay = self.spec.delay();
        let args = |start: f64, stop: f64| SweepArgs {
            config_list: &self.config_list,
            start,
            stop,
            delay,
            count,
            fail_abort: self.fail_abort,
            dual: self.dual,
            buffer,
        };
        match &self.spec {
            SweepSpec::ByPoints {
                start, stop, points, ..
            } => tsp::sweep_linear(&args(*start, *stop), *points),
            SweepSpec::ByStep {
                start, stop, step, ..
            } => tsp::sweep_linear_step(&args(*start, *stop), *step),
            SweepSpec::Logarithmic {
                start, stop, points, ..
            } => tsp::sweep_log(&args(*start, *stop), *points),
            SweepSpec::CustomList { .. } => {
                tsp::sweep_list(&self.config_list, delay, count, self.fail_abort, buffer)
            }
        }
    }

    /// Commands that fill the configuration list; empty for generated shapes.
    pub fn config_list_commands(&self) -> Vec<String> {
        let SweepSpec::CustomList { levels, .. } = &self.spec else {
            return Vec::new();
        };
        let mut commands = vec![tsp::configlist_create(&self.config_list)];
        for level in levels {
            commands.push(tsp::source_level(*level));
            commands.push(tsp::configlist_store(&self.config_list));
        }
        commands
    }
}

/// A checked request with every command already rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    /// Buffer the readings go to
    pub buffer: String,
    /// Source points per pass
    pub points: u32,
    /// Text shown on the instrument while configuring
    pub title: &'static str,
    pub subtitle: &'static str,
    /// Commands sent while configuring
    pub configure: Vec<String>,
    /// The sweep command itself
    pub command: String,
}

impl SweepPlan {
    /// Validate `request` against the session and render its commands.
    ///
    /// Nothing is sent; every error from here is a validation error.
    pub fn build(
        request: &SweepRequest,
        config: &SessionConfig,
        registry: &BufferRegistry,
    ) -> SmuResult<Self> {
        request.validate()?;
        let buffer = request
            .buffer
            .clone()
            .unwrap_or_else(|| registry.active().to_string());
        registry.ensure_known(&buffer)?;

        let mut configure = sequencer::function_settings(&request.settings, config, None);
        configure.push(tsp::clear_buffer(&buffer));
        configure.extend(request.config_list_commands());

        Ok(Self {
            points: request.spec.point_count()?,
            title: request.settings.mode.display_label(),
            subtitle: request.spec.label(),
            command: request.sweep_command(&buffer),
            configure,
            buffer,
        })
    }
}

/// Where a sweep invocation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Configuring,
    Armed,
    Running,
    Complete,
    Failed,
}

impl fmt::Display for SweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SweepState::Configuring => "configuring",
            SweepState::Armed => "armed",
            SweepState::Running => "running",
            SweepState::Complete => "complete",
            SweepState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Runs one [`SweepPlan`] through the sweep state machine.
#[derive(Debug)]
pub struct SweepOrchestrator {
    state: SweepState,
    history: Vec<SweepState>,
}

impl Default for SweepOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepOrchestrator {
    pub fn new() -> Self {
        Self {
            state: SweepState::Configuring,
            history: vec![SweepState::Configuring],
        }
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[SweepState] {
        &self.history
    }

    fn enter(&mut self, next: SweepState) {
        info!(from = %self.state, to = %next, "Sweep state");
        self.state = next;
        self.history.push(next);
    }

    /// Send the plan. On failure the state becomes `Failed`; once the trigger
    /// model has been started, the source output is switched off before the
    /// error is returned.
    #[instrument(name = "sweep", skip_all, fields(buffer = %plan.buffer, points = plan.points))]
    pub fn execute(&mut self, conn: &mut ConnectionHandle, plan: &SweepPlan) -> SmuResult<()> {
        if let Err(e) = self.configure_and_arm(conn, plan) {
            self.enter(SweepState::Failed);
            return Err(e);
        }
        if let Err(e) = self.run_to_completion(conn) {
            self.enter(SweepState::Failed);
            sequencer::output_off_after_failure(conn);
            return Err(e);
        }
        Ok(())
    }

    fn configure_and_arm(&mut self, conn: &mut ConnectionHandle, plan: &SweepPlan) -> SmuResult<()> {
        conn.send_all(&plan.configure)?;
        self.enter(SweepState::Armed);
        conn.send(&plan.command)
    }

    fn run_to_completion(&mut self, conn: &mut ConnectionHandle) -> SmuResult<()> {
        conn.send(tsp::INITIATE)?;
        self.enter(SweepState::Running);
        conn.send(tsp::WAIT_COMPLETE)?;
        conn.send(&tsp::delay(tsp::SETTLE_DELAY))?;
        conn.send_all(sequencer::completion_notice())?;
        self.enter(SweepState::Complete);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockTransport;
    use crate::mode::SourceMeasureMode;

    fn svmi() -> SourceMeasureSettings {
        SourceMeasureSettings::new(SourceMeasureMode::SourceVoltageMeasureCurrent)
    }

    fn by_points(start: f64, stop: f64, points: u32) -> SweepSpec {
        SweepSpec::ByPoints {
            start,
            stop,
            points,
            delay: 1e-3,
            iterations: 1,
        }
    }

    #[test]
    fn test_step_point_count_formula() {
        let cases: [(f64, f64, f64); 6] = [
            (0.0, 1.0, 0.25),
            (-1.0, 1.0, 0.5),
            (0.0, 10.0, 3.0),
            (-2.0, 2.0, 1.0),
            (0.0, 7.0, 2.0),
            (1.0, 2.0, 0.125),
        ];
        for (start, stop, step) in cases {
            let expected = ((stop - start) / step).floor() as u32 + 1;
            assert_eq!(step_point_count(start, stop, step).unwrap(), expected);
        }
    }

    #[test]
    fn test_step_point_count_absorbs_float_error() {
        assert_eq!(step_point_count(0.0, 1.0, 0.1).unwrap(), 11);
        assert_eq!(step_point_count(-0.5, 0.25, 0.05).unwrap(), 16);
    }

    #[test]
    fn test_step_point_count_near_integer_quotient() {
        assert_eq!(step_point_count(0.0, 2.9999999995, 1.0).unwrap(), 3);
        assert_eq!(step_point_count(0.0, 10.0 - 1e-9, 2.0).unwrap(), 5);
        assert!(step_point_count(0.0, 0.9999999995, 1.0).is_err());
    }

    #[test]
    fn test_step_must_be_positive_and_give_two_points() {
        assert!(step_point_count(0.0, 1.0, 0.0).is_err());
        assert!(step_point_count(0.0, 1.0, -0.1).is_err());
        assert!(step_point_count(0.0, 1.0, 2.0).is_err());
        assert!(step_point_count(1.0, 0.0, 0.1).is_err());
    }

    #[test]
    fn test_point_count_limits() {
        assert!(by_points(-1.0, 1.0, 1).validate(false).is_err());
        assert!(by_points(-1.0, 1.0, 2).validate(false).is_ok());
        assert!(by_points(-1.0, 1.0, MAX_SWEEP_POINTS + 1).validate(false).is_err());
    }

    #[test]
    fn test_delay_and_iteration_limits() {
        let spec = |delay: f64, iterations: u32| SweepSpec::ByPoints {
            start: 0.0,
            stop: 1.0,
            points: 10,
            delay,
            iterations,
        };
        assert!(spec(0.0, 1).validate(false).is_ok());
        assert!(spec(1e-6, 1).validate(false).is_err());
        assert!(spec(1e-3, 0).validate(false).is_err());
        assert!(spec(1e-3, MAX_SWEEP_ITERATIONS).validate(false).is_ok());
    }

    #[test]
    fn test_log_bounds_must_share_sign() {
        let log = |start: f64, stop: f64| SweepSpec::Logarithmic {
            start,
            stop,
            points: 20,
            delay: 1e-3,
            iterations: 1,
        };
        assert!(log(1e-3, 1.0).validate(false).is_ok());
        assert!(log(-1.0, -1e-3).validate(false).is_ok());
        assert!(log(0.0, 1.0).validate(false).is_err());
        assert!(log(-1.0, 1.0).validate(false).is_err());
    }

    #[test]
    fn test_custom_list_rules() {
        let list = |levels: Vec<f64>| SweepSpec::CustomList {
            levels,
            delay: 1e-3,
            iterations: 1,
        };
        assert!(list(vec![]).validate(false).is_err());
        assert!(list(vec![0.0, f64::NAN]).validate(false).is_err());
        assert!(list(vec![0.0, 0.01]).validate(true).is_err());
        assert!(list(vec![0.0, 0.01]).validate(false).is_ok());
    }

    #[test]
    fn test_sweep_commands_per_shape() {
        let step = SweepRequest::new(
            svmi(),
            SweepSpec::ByStep {
                start: 0.0,
                stop: 1.0,
                step: 0.25,
                delay: 0.0,
                iterations: 2,
            },
        )
        .with_config_list("Step")
        .with_dual(true);
        assert_eq!(
            step.sweep_command("defbuffer1"),
            "smu.source.sweeplinearstep(\"Step\", 0, 1, 0.25, 0, 2, smu.RANGE_FIXED, smu.ON, smu.ON, defbuffer1)"
        );

        let log = SweepRequest::new(
            svmi(),
            SweepSpec::Logarithmic {
                start: 1.0,
                stop: 10.0,
                points: 20,
                delay: 1e-3,
                iterations: 1,
            },
        )
        .with_fail_abort(false);
        assert_eq!(
            log.sweep_command("ivbuf"),
            "smu.source.sweeplog(\"SmuSweep\", 1, 10, 20, 0.001, 1, smu.RANGE_FIXED, smu.OFF, smu.OFF, ivbuf)"
        );
    }

    #[test]
    fn test_custom_list_stores_levels_in_order() {
        let request = SweepRequest::new(
            svmi(),
            SweepSpec::CustomList {
                levels: vec![0.0, 0.5, -0.5],
                delay: 1e-3,
                iterations: 1,
            },
        )
        .with_config_list("Pulse");
        assert_eq!(
            request.config_list_commands(),
            vec![
                "smu.source.configlist.create(\"Pulse\")",
                "smu.source.level = 0",
                "smu.source.configlist.store(\"Pulse\")",
                "smu.source.level = 0.5",
                "smu.source.configlist.store(\"Pulse\")",
                "smu.source.level = -0.5",
                "smu.source.configlist.store(\"Pulse\")",
            ]
        );
    }

    #[test]
    fn test_plan_rejects_unknown_buffer_and_bad_name() {
        let config = SessionConfig::default();
        let registry = BufferRegistry::new();
        let request = SweepRequest::new(svmi(), by_points(-1.0, 1.0, 10)).with_buffer("ghost");
        assert!(matches!(
            SweepPlan::build(&request, &config, &registry),
            Err(SmuError::UnknownBuffer(_))
        ));

        let request = SweepRequest::new(svmi(), by_points(-1.0, 1.0, 10)).with_config_list("a\"b");
        assert!(SweepPlan::build(&request, &config, &registry).is_err());
    }

    #[test]
    fn test_execute_walks_every_state() {
        let mock = MockTransport::new();
        let log = mock.call_log();
        let mut conn = ConnectionHandle::new("USB0::MOCK::INSTR", Box::new(mock));
        let request = SweepRequest::new(svmi(), by_points(-1.0, 1.0, 100));
        let plan = SweepPlan::build(&request, &SessionConfig::default(), &BufferRegistry::new()).unwrap();

        let mut orchestrator = SweepOrchestrator::new();
        orchestrator.execute(&mut conn, &plan).unwrap();

        assert_eq!(
            orchestrator.history(),
            &[
                SweepState::Configuring,
                SweepState::Armed,
                SweepState::Running,
                SweepState::Complete
            ]
        );
        let sweep = log.index_of(&plan.command).unwrap();
        let initiate = log.index_of(tsp::INITIATE).unwrap();
        let wait = log.index_of(tsp::WAIT_COMPLETE).unwrap();
        let clear = log.index_of("defbuffer1.clear()").unwrap();
        assert!(clear < sweep && sweep < initiate && initiate < wait);
        assert_eq!(log.count(tsp::OUTPUT_OFF), 0);
    }

    #[test]
    fn test_failure_before_initiate_does_not_touch_output() {
        let mock = MockTransport::new().fail_on("sweeplinear");
        let log = mock.call_log();
        let mut conn = ConnectionHandle::new("USB0::MOCK::INSTR", Box::new(mock));
        let request = SweepRequest::new(svmi(), by_points(0.0, 1.0, 5));
        let plan = SweepPlan::build(&request, &SessionConfig::default(), &BufferRegistry::new()).unwrap();

        let mut orchestrator = SweepOrchestrator::new();
        assert!(orchestrator.execute(&mut conn, &plan).is_err());
        assert_eq!(orchestrator.state(), SweepState::Failed);
        assert_eq!(log.count(tsp::INITIATE), 0);
        assert_eq!(log.count(tsp::OUTPUT_OFF), 0);
    }

    #[test]
    fn test_failure_while_running_turns_output_off() {
        let mock = MockTransport::new().fail_on("waitcomplete");
        let log = mock.call_log();
        let mut conn = ConnectionHandle::new("USB0::MOCK::INSTR", Box::new(mock));
        let request = SweepRequest::new(svmi(), by_points(0.0, 1.0, 5));
        let plan = SweepPlan::build(&request, &SessionConfig::default(), &BufferRegistry::new()).unwrap();

        let mut orchestrator = SweepOrchestrator::new();
        let err = orchestrator.execute(&mut conn, &plan).unwrap_err();
        assert!(matches!(err, SmuError::Command { ref command, .. } if command == "waitcomplete()"));
        assert_eq!(
            orchestrator.history(),
            &[
                SweepState::Configuring,
                SweepState::Armed,
                SweepState::Running,
                SweepState::Failed
            ]
        );
        assert_eq!(log.commands().last().map(String::as_str), Some(tsp::OUTPUT_OFF));
    }
}
