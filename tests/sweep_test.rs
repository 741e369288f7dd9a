// Sweep integration tests
//
// Run sweeps through a Session over MockTransport and check the command log.

use smu2450::buffer::{BufferRegistry, DEFAULT_BUFFER};
use smu2450::connection::{CallLog, MockTransport};
use smu2450::mode::{SourceMeasureMode, SourceMeasureSettings};
use smu2450::sweep::{step_point_count, SweepOrchestrator, SweepPlan, SweepState};
use smu2450::tsp;
use smu2450::{Session, SessionConfig, SmuError, SweepRequest, SweepSpec};

fn ready_session(mock: MockTransport) -> (Session, CallLog) {
    let log = mock.call_log();
    let mut session = Session::with_transport("USB0::MOCK::INSTR", Box::new(mock));
    session.initialize(SessionConfig::default()).unwrap();
    log.clear();
    (session, log)
}

fn settings(mode: SourceMeasureMode) -> SourceMeasureSettings {
    SourceMeasureSettings::new(mode)
}

fn linear(start: f64, stop: f64, points: u32) -> SweepSpec {
    SweepSpec::ByPoints {
        start,
        stop,
        points,
        delay: 0.0,
        iterations: 1,
    }
}

#[test]
fn test_by_points_sweep_issues_one_command_initiate_and_wait() {
    let (mut session, log) = ready_session(MockTransport::new());
    let request = SweepRequest::new(
        settings(SourceMeasureMode::SourceVoltageMeasureCurrent),
        linear(-1.0, 1.0, 100),
    );

    let buffer = session.sweep(&request).unwrap();
    assert_eq!(buffer, DEFAULT_BUFFER);

    assert_eq!(log.count_prefix("smu.source.sweep"), 1);
    let command = log
        .commands()
        .into_iter()
        .find(|c| c.starts_with("smu.source.sweeplinear("))
        .unwrap();
    assert_eq!(
        command,
        "smu.source.sweeplinear(\"SmuSweep\", -1, 1, 100, 0, 1, smu.RANGE_FIXED, smu.ON, smu.OFF, defbuffer1)"
    );

    assert_eq!(log.count(tsp::INITIATE), 1);
    assert_eq!(log.count(tsp::WAIT_COMPLETE), 1);
    let sweep = log.index_of_prefix("smu.source.sweeplinear(").unwrap();
    let initiate = log.index_of(tsp::INITIATE).unwrap();
    let wait = log.index_of(tsp::WAIT_COMPLETE).unwrap();
    let settle = log.index_of("delay(0.00001)").unwrap();
    let notice = log.index_of("display.settext(display.TEXT2, \"Process Successful!\")").unwrap();
    assert!(sweep < initiate && initiate < wait && wait < settle && settle < notice);
}

#[test]
fn test_sweep_configures_before_the_sweep_command() {
    let (mut session, log) = ready_session(MockTransport::new());
    let request = SweepRequest::new(
        settings(SourceMeasureMode::SourceCurrentMeasureVoltage),
        linear(-1e-3, 1e-3, 11),
    );

    session.sweep(&request).unwrap();

    let reset = log.index_of(tsp::SMU_RESET).unwrap();
    let measure = log.index_of_prefix("smu.measure.func").unwrap();
    let source = log.index_of_prefix("smu.source.func").unwrap();
    let clear = log.index_of("defbuffer1.clear()").unwrap();
    let sweep = log.index_of_prefix("smu.source.sweeplinear(").unwrap();
    assert!(reset < measure && measure < source && source < clear && clear < sweep);
    assert_eq!(log.count_prefix("smu.source.level"), 0);
    assert_eq!(log.count(tsp::OUTPUT_ON), 0);
}

#[test]
fn test_sweep_orders_functions_for_every_mode() {
    for mode in SourceMeasureMode::ALL {
        let (mut session, log) = ready_session(MockTransport::new());
        session
            .sweep(&SweepRequest::new(settings(mode), linear(1e-4, 1e-3, 10)))
            .unwrap();

        let measure = log.index_of_prefix("smu.measure.func").unwrap();
        let source = log.index_of_prefix("smu.source.func").unwrap();
        assert!(measure < source, "{mode}");
    }
}

#[test]
fn test_by_step_point_count() {
    let cases = [
        (0.0, 1.0, 0.25, 5),
        (-1.0, 1.0, 0.3, 7),
        (0.0, 10.0, 3.0, 4),
        (-5.0, 5.0, 0.7, 15),
        (2.0, 3.0, 0.5, 3),
        (-0.5, 0.25, 0.05, 16),
        (0.0, 2.9999999995, 1.0, 3),
    ];
    for (start, stop, step, expected) in cases {
        assert_eq!(step_point_count(start, stop, step).unwrap(), expected);

        let spec = SweepSpec::ByStep {
            start,
            stop,
            step,
            delay: 0.0,
            iterations: 1,
        };
        let request = SweepRequest::new(settings(SourceMeasureMode::SourceVoltageMeasureCurrent), spec);
        let plan = SweepPlan::build(&request, &SessionConfig::default(), &BufferRegistry::new()).unwrap();
        assert_eq!(plan.points, expected);
        assert!(plan.command.starts_with("smu.source.sweeplinearstep("));
        assert!(plan.command.contains(&format!(", {step}, ")));
    }
}

#[test]
fn test_by_step_rejects_non_positive_step() {
    let (mut session, log) = ready_session(MockTransport::new());
    for step in [0.0, -0.1, f64::NAN] {
        let spec = SweepSpec::ByStep {
            start: 0.0,
            stop: 1.0,
            step,
            delay: 0.0,
            iterations: 1,
        };
        let request = SweepRequest::new(settings(SourceMeasureMode::SourceVoltageMeasureCurrent), spec);
        let err = session.sweep(&request).unwrap_err();
        assert!(matches!(err, SmuError::Configuration(_)), "step {step}");
    }
    assert!(log.calls().is_empty());
}

#[test]
fn test_invalid_sweeps_send_nothing() {
    let (mut session, log) = ready_session(MockTransport::new());
    let base = settings(SourceMeasureMode::SourceVoltageMeasureCurrent);

    let requests = [
        SweepRequest::new(base.clone(), linear(-1.0, 1.0, 1)),
        SweepRequest::new(base.clone(), linear(-1.0, f64::INFINITY, 10)),
        SweepRequest::new(
            base.clone(),
            SweepSpec::Logarithmic {
                start: -1.0,
                stop: 1.0,
                points: 10,
                delay: 0.0,
                iterations: 1,
            },
        ),
        SweepRequest::new(
            base.clone(),
            SweepSpec::CustomList {
                levels: vec![],
                delay: 0.0,
                iterations: 1,
            },
        ),
        SweepRequest::new(
            base.clone(),
            SweepSpec::CustomList {
                levels: vec![1.0, 2.0],
                delay: 0.0,
                iterations: 1,
            },
        )
        .with_dual(true),
        SweepRequest::new(base.clone(), linear(0.0, 1.0, 10)).with_config_list("bad\"name"),
        SweepRequest::new(
            base.clone(),
            SweepSpec::ByPoints {
                start: 0.0,
                stop: 1.0,
                points: 10,
                delay: 1e-6,
                iterations: 1,
            },
        ),
        SweepRequest::new(
            base.clone(),
            SweepSpec::ByPoints {
                start: 0.0,
                stop: 1.0,
                points: 10,
                delay: 0.0,
                iterations: 0,
            },
        ),
    ];
    for request in &requests {
        let err = session.sweep(request).unwrap_err();
        assert!(matches!(err, SmuError::Configuration(_)), "{request:?}");
    }

    let err = session
        .sweep(&SweepRequest::new(base, linear(0.0, 1.0, 10)).with_buffer("missing"))
        .unwrap_err();
    assert!(matches!(err, SmuError::UnknownBuffer(_)));
    assert!(log.calls().is_empty());
}

#[test]
fn test_sweep_without_initialize_fails() {
    let mock = MockTransport::new();
    let log = mock.call_log();
    let mut session = Session::with_transport("USB0::MOCK::INSTR", Box::new(mock));
    let request = SweepRequest::new(
        settings(SourceMeasureMode::SourceVoltageMeasureCurrent),
        linear(0.0, 1.0, 10),
    );

    assert!(matches!(session.sweep(&request), Err(SmuError::NotInitialized)));
    assert!(log.calls().is_empty());
}

#[test]
fn test_logarithmic_sweep_command() {
    let (mut session, log) = ready_session(MockTransport::new());
    let spec = SweepSpec::Logarithmic {
        start: 1e-3,
        stop: 10.0,
        points: 41,
        delay: 1e-3,
        iterations: 2,
    };
    let request = SweepRequest::new(settings(SourceMeasureMode::SourceVoltageMeasureCurrent), spec)
        .with_fail_abort(false)
        .with_dual(true)
        .with_config_list("IvLog");

    session.sweep(&request).unwrap();

    assert_eq!(
        log.count(
            "smu.source.sweeplog(\"IvLog\", 0.001, 10, 41, 0.001, 2, smu.RANGE_FIXED, smu.OFF, smu.ON, defbuffer1)"
        ),
        1
    );
    assert_eq!(log.count("display.settext(display.TEXT2, \"Log Sweep\")"), 1);
}

#[test]
fn test_custom_list_stores_levels_before_sweep() {
    let (mut session, log) = ready_session(MockTransport::new());
    let spec = SweepSpec::CustomList {
        levels: vec![0.0, 0.5, -0.5],
        delay: 0.0,
        iterations: 1,
    };
    let request = SweepRequest::new(settings(SourceMeasureMode::SourceVoltageMeasureCurrent), spec)
        .with_config_list("IvList");

    session.sweep(&request).unwrap();

    let commands = log.commands();
    let create = log.index_of("smu.source.configlist.create(\"IvList\")").unwrap();
    let sweep = log.index_of_prefix("smu.source.sweeplist(").unwrap();
    let stored: Vec<&str> = commands[create + 1..sweep].iter().map(String::as_str).collect();
    assert_eq!(
        stored,
        vec![
            "smu.source.level = 0",
            "smu.source.configlist.store(\"IvList\")",
            "smu.source.level = 0.5",
            "smu.source.configlist.store(\"IvList\")",
            "smu.source.level = -0.5",
            "smu.source.configlist.store(\"IvList\")",
        ]
    );
    assert_eq!(
        commands[sweep],
        "smu.source.sweeplist(\"IvList\", 1, 0, 1, smu.ON, defbuffer1)"
    );
    assert!(log.index_of_prefix("smu.source.func").unwrap() < create);
    assert_eq!(log.count(tsp::INITIATE), 1);
}

#[test]
fn test_sweep_into_user_buffer_activates_it() {
    let (mut session, log) = ready_session(MockTransport::new());
    session.create_buffer("ivbuf", 1_000).unwrap();
    session.activate_buffer(None).unwrap();

    let request = SweepRequest::new(
        settings(SourceMeasureMode::SourceVoltageMeasureCurrent),
        linear(0.0, 1.0, 5),
    )
    .with_buffer("ivbuf");
    let buffer = session.sweep(&request).unwrap();

    assert_eq!(buffer, "ivbuf");
    assert_eq!(session.active_buffer(), "ivbuf");
    assert!(log.index_of("ivbuf.clear()").is_some());
    assert!(log
        .commands()
        .iter()
        .any(|c| c.starts_with("smu.source.sweeplinear(") && c.ends_with(", ivbuf)")));
}

#[test]
fn test_failure_after_initiate_turns_output_off() {
    let mock = MockTransport::new().fail_on(tsp::WAIT_COMPLETE);
    let (mut session, log) = ready_session(mock);
    let request = SweepRequest::new(
        settings(SourceMeasureMode::SourceVoltageMeasureCurrent),
        linear(-1.0, 1.0, 10),
    );

    let err = session.sweep(&request).unwrap_err();

    assert!(matches!(err, SmuError::Command { ref command, .. } if command == tsp::WAIT_COMPLETE));
    assert_eq!(log.commands().last().unwrap(), tsp::OUTPUT_OFF);
    assert!(log.index_of_prefix("display.settext(display.TEXT2, \"Process").is_none());
}

#[test]
fn test_failure_before_initiate_sends_no_cleanup() {
    let mock = MockTransport::new().fail_on("smu.source.sweeplinear(");
    let (mut session, log) = ready_session(mock);
    let request = SweepRequest::new(
        settings(SourceMeasureMode::SourceVoltageMeasureCurrent),
        linear(-1.0, 1.0, 10),
    );

    assert!(session.sweep(&request).is_err());
    assert_eq!(log.count(tsp::INITIATE), 0);
    assert_eq!(log.count(tsp::OUTPUT_OFF), 0);
}

#[test]
fn test_orchestrator_state_history() {
    let config = SessionConfig::default();
    let registry = BufferRegistry::new();
    let request = SweepRequest::new(
        settings(SourceMeasureMode::SourceVoltageMeasureCurrent),
        linear(0.0, 1.0, 3),
    );
    let plan = SweepPlan::build(&request, &config, &registry).unwrap();

    let mock = MockTransport::new();
    let mut conn = smu2450::ConnectionHandle::new("USB0::MOCK::INSTR", Box::new(mock));
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

    let failing = MockTransport::new().fail_on("defbuffer1.clear()");
    let mut conn = smu2450::ConnectionHandle::new("USB0::MOCK::INSTR", Box::new(failing));
    let mut orchestrator = SweepOrchestrator::new();
    assert!(orchestrator.execute(&mut conn, &plan).is_err());
    assert_eq!(orchestrator.state(), SweepState::Failed);
    assert_eq!(
        orchestrator.history(),
        &[SweepState::Configuring, SweepState::Failed]
    );
}

#[test]
fn test_unnamed_sweep_uses_active_buffer() {
    let (mut session, log) = ready_session(MockTransport::new());
    session.create_buffer("ivbuf", 1_000).unwrap();
    assert_eq!(session.active_buffer(), "ivbuf");

    let request = SweepRequest::new(
        settings(SourceMeasureMode::SourceVoltageMeasureCurrent),
        linear(0.0, 1.0, 5),
    );
    let buffer = session.sweep(&request).unwrap();

    assert_eq!(buffer, "ivbuf");
    assert_eq!(session.active_buffer(), "ivbuf");
    assert!(log.index_of("ivbuf.clear()").is_some());
    assert_eq!(log.count("defbuffer1.clear()"), 0);
    assert!(log
        .commands()
        .iter()
        .any(|c| c.starts_with("smu.source.sweeplinear(") && c.ends_with(", ivbuf)")));
}

#[test]
fn test_plan_targets_registry_active_buffer() {
    let mut registry = BufferRegistry::new();
    registry.activate(Some("defbuffer2")).unwrap();
    let request = SweepRequest::new(
        settings(SourceMeasureMode::SourceVoltageMeasureCurrent),
        linear(-1.0, 1.0, 3),
    );

    let plan = SweepPlan::build(&request, &SessionConfig::default(), &registry).unwrap();
    assert_eq!(plan.buffer, "defbuffer2");
    assert!(plan.command.ends_with(", defbuffer2)"));
}
