//! Configuration Sequencer
//!
//! Turns the stored [`SessionConfig`] and per-operation [`SourceMeasureSettings`]
//! into ordered command lists. Command lists are built first and sent
//! afterwards, so every builder here is a pure function that tests can inspect
//! without a transport.
//!
//! Order matters on the instrument:
//! - a full `reset()` wipes user buffers, so buffers are created after it;
//! - autozero and terminal settings are volatile, so they follow the reset;
//! - setting the measure function can reset the source function, so the
//!   measure function is always written first and the measure range is only
//!   written once the source function is in place.

use crate::buffer::BufferRegistry;
use crate::config::{AutoZero, SessionConfig};
use crate::connection::ConnectionHandle;
use crate::error::SmuResult;
use crate::mode::SourceMeasureSettings;
use crate::tsp::{self, DisplayLine};
use tracing::{info, warn};

/// Top line shown after `initialize`.
pub const CONNECTION_OK: &str = "Connection is OK!";
/// Bottom line shown when an operation finishes.
pub const PROCESS_SUCCESSFUL: &str = "Process Successful!";

/// Switch to the user screen and show one or two lines of text.
pub fn notification(top: &str, bottom: Option<&str>) -> Vec<String> {
    let mut commands = vec![
        tsp::DISPLAY_USER_SCREEN.to_string(),
        tsp::DISPLAY_CLEAR.to_string(),
        tsp::display_text(DisplayLine::Top, top),
    ];
    if let Some(bottom) = bottom {
        commands.push(tsp::display_text(DisplayLine::Bottom, bottom));
    }
    commands
}

/// Completion message posted at the end of an operation.
pub fn completion_notice() -> Vec<String> {
    vec![
        tsp::DISPLAY_CLEAR.to_string(),
        tsp::display_text(DisplayLine::Bottom, PROCESS_SUCCESSFUL),
    ]
}

/// SMU-level reset followed by the session's global settings.
///
/// `smu.reset()` leaves reading buffers alone, so this is safe to run before
/// every operation.
pub fn global_settings(config: &SessionConfig) -> Vec<String> {
    let mut commands = vec![tsp::SMU_RESET.to_string()];
    match config.autozero {
        AutoZero::Periodic => commands.push(tsp::autozero_enable(true)),
        AutoZero::Once => {
            commands.push(tsp::autozero_enable(false));
            commands.push(tsp::AUTOZERO_ONCE.to_string());
        }
        AutoZero::Off => commands.push(tsp::autozero_enable(false)),
    }
    commands.push(tsp::terminals(config.terminals));
    commands.push(tsp::sense(config.four_wire));
    commands.push(tsp::source_readback(config.source_readback));
    commands.push(tsp::nplc(config.effective_nplc()));
    commands
}

/// Commands that select and condition the measure side.
pub fn measure_settings(settings: &SourceMeasureSettings, config: &SessionConfig) -> Vec<String> {
    let mode = settings.mode;
    let mut commands = vec![tsp::measure_function(mode.measure_function())];
    if mode.ohm_unit() {
        commands.push(tsp::MEASURE_UNIT_OHM.to_string());
    }
    if mode.wants_offset_compensation(config.four_wire) {
        commands.push(tsp::OFFSET_COMPENSATION_ON.to_string());
    }
    if let Some(limits) = &settings.limits {
        commands.push(tsp::LIMIT_CLEAR.to_string());
        commands.push(tsp::LIMIT_AUTOCLEAR_OFF.to_string());
        commands.push(tsp::limit_low(limits.low));
        commands.push(tsp::limit_high(limits.high));
        if limits.beep_on_fail {
            commands.push(tsp::LIMIT_AUDIBLE_FAIL.to_string());
        }
        commands.push(tsp::LIMIT_ENABLE.to_string());
    }
    commands
}

/// Commands that select and condition the source side, plus the measure range.
///
/// `level` is omitted for sweeps, where the sweep command supplies the levels.
pub fn source_settings(
    settings: &SourceMeasureSettings,
    config: &SessionConfig,
    level: Option<f64>,
) -> Vec<String> {
    let source = settings.mode.source_function();
    let mut commands = vec![tsp::source_function(source)];
    match settings.measure_range_or(config) {
        Some(range) => commands.push(tsp::measure_range(range)),
        None => commands.push(tsp::MEASURE_AUTORANGE_ON.to_string()),
    }
    commands.push(tsp::source_range(settings.source_range_or(config)));
    if let Some(protection) = settings.protection {
        commands.push(tsp::protection(protection));
    }
    if let Some(level) = level {
        commands.push(tsp::source_level(level));
    }
    commands.push(tsp::source_limit(source, settings.source_limit_or(config)));
    commands
}

/// Measure settings followed by source settings.
pub fn function_settings(
    settings: &SourceMeasureSettings,
    config: &SessionConfig,
    level: Option<f64>,
) -> Vec<String> {
    let mut commands = measure_settings(settings, config);
    commands.extend(source_settings(settings, config, level));
    commands
}

/// Full initialization: reset, notification, global settings, user buffer, activation.
///
/// With `activate_default_buffer` set, activation ends with a capacity query
/// on the active buffer.
///
/// The registry is reset together with the instrument, so afterwards it holds
/// the system buffers plus the configured user buffer, if any.
pub fn initialize(
    conn: &mut ConnectionHandle,
    registry: &mut BufferRegistry,
    config: &SessionConfig,
) -> SmuResult<()> {
    config.validate()?;

    conn.send(tsp::FULL_RESET)?;
    registry.reset();
    conn.send_all(notification(CONNECTION_OK, None))?;
    conn.send_all(global_settings(config))?;

    if let Some(buffer) = &config.user_buffer {
        registry.create(conn, &buffer.name, buffer.capacity)?;
    }
    let active = registry
        .activate(config.user_buffer.as_ref().map(|b| b.name.as_str()))?
        .to_string();
    if config.activate_default_buffer {
        // the instrument selects a buffer once it has been referenced
        let capacity = registry.query_capacity(conn, &active)?;
        info!(active_buffer = %active, capacity, "Instrument initialized");
    } else {
        info!(active_buffer = %active, "Instrument initialized");
    }
    Ok(())
}

/// Reconfigure-before-measure: notification plus global settings.
pub fn reconfigure(
    conn: &mut ConnectionHandle,
    config: &SessionConfig,
    title: &str,
    subtitle: &str,
) -> SmuResult<()> {
    conn.send_all(notification(title, Some(subtitle)))?;
    conn.send_all(global_settings(config))
}

/// Best-effort `smu.source.output = smu.OFF` after a failure.
///
/// A failure here is only logged; the caller still returns its own error.
pub fn output_off_after_failure(conn: &mut ConnectionHandle) {
    if let Err(e) = conn.send(tsp::OUTPUT_OFF) {
        warn!(error = %e, "Could not turn the source output off after a failed command");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Terminals, UserBuffer};
    use crate::connection::MockTransport;
    use crate::mode::{MeasureLimits, SourceMeasureMode};
    use tracing_test::traced_test;

    fn position(commands: &[String], prefix: &str) -> usize {
        commands
            .iter()
            .position(|c| c.starts_with(prefix))
            .unwrap_or_else(|| panic!("'{prefix}' not found in {commands:#?}"))
    }

    #[test]
    fn test_autozero_policies() {
        let periodic = global_settings(&SessionConfig {
            autozero: AutoZero::Periodic,
            ..SessionConfig::default()
        });
        assert!(periodic.contains(&"smu.measure.autozero.enable = smu.ON".to_string()));
        assert!(!periodic.contains(&tsp::AUTOZERO_ONCE.to_string()));

        let once = global_settings(&SessionConfig::default());
        let off = position(&once, "smu.measure.autozero.enable = smu.OFF");
        let single = position(&once, "smu.measure.autozero.once()");
        assert!(off < single);

        let disabled = global_settings(&SessionConfig {
            autozero: AutoZero::Off,
            ..SessionConfig::default()
        });
        assert!(disabled.contains(&"smu.measure.autozero.enable = smu.OFF".to_string()));
        assert!(!disabled.contains(&tsp::AUTOZERO_ONCE.to_string()));
    }

    #[test]
    fn test_global_settings_start_with_smu_reset() {
        let config = SessionConfig {
            terminals: Terminals::Rear,
            four_wire: false,
            nplc: Some(0.5),
            ..SessionConfig::default()
        };
        let commands = global_settings(&config);
        assert_eq!(commands[0], "smu.reset()");
        assert!(commands.contains(&"smu.measure.terminals = smu.TERMINALS_REAR".to_string()));
        assert!(commands.contains(&"smu.measure.sense = smu.SENSE_2WIRE".to_string()));
        assert!(commands.contains(&"smu.measure.nplc = 0.5".to_string()));
    }

    #[test]
    fn test_measure_function_precedes_source_function_for_every_mode() {
        let config = SessionConfig::default();
        for mode in SourceMeasureMode::ALL {
            let commands = function_settings(&SourceMeasureSettings::new(mode), &config, Some(1.0));
            let measure = position(&commands, "smu.measure.func");
            let source = position(&commands, "smu.source.func");
            let range = commands
                .iter()
                .position(|c| c.starts_with("smu.measure.range") || c.starts_with("smu.measure.autorange"))
                .unwrap();
            assert!(measure < source, "{mode}");
            assert!(source < range, "{mode}");
        }
    }

    #[test]
    fn test_resistance_overlay_and_autorange() {
        let config = SessionConfig {
            measure_resistance_range: None,
            four_wire: true,
            ..SessionConfig::default()
        };
        let direct = function_settings(
            &SourceMeasureSettings::new(SourceMeasureMode::SourceCurrentMeasureResistance),
            &config,
            None,
        );
        assert!(direct.contains(&"smu.measure.func = smu.FUNC_RESISTANCE".to_string()));
        assert!(direct.contains(&tsp::OFFSET_COMPENSATION_ON.to_string()));
        assert!(direct.contains(&tsp::MEASURE_AUTORANGE_ON.to_string()));
        assert!(!direct.contains(&tsp::MEASURE_UNIT_OHM.to_string()));

        let overlay = function_settings(
            &SourceMeasureSettings::new(SourceMeasureMode::SourceVoltageMeasureCurrentOhms),
            &config,
            None,
        );
        assert!(overlay.contains(&"smu.measure.func = smu.FUNC_DC_CURRENT".to_string()));
        assert!(overlay.contains(&tsp::MEASURE_UNIT_OHM.to_string()));
        assert!(overlay.contains(&"smu.measure.range = 0.1".to_string()));
    }

    #[test]
    fn test_limits_sequence() {
        let settings = SourceMeasureSettings::new(SourceMeasureMode::SourceVoltageMeasureCurrent)
            .with_limits(MeasureLimits::new(-0.01, 0.01).unwrap().with_beep());
        let commands = measure_settings(&settings, &SessionConfig::default());
        assert_eq!(
            &commands[1..],
            &[
                "smu.measure.limit[1].clear()",
                "smu.measure.limit[1].autoclear = smu.OFF",
                "smu.measure.limit[1].low.value = -0.01",
                "smu.measure.limit[1].high.value = 0.01",
                "smu.measure.limit[1].audible = smu.AUDIBLE_FAIL",
                "smu.measure.limit[1].enable = smu.ON",
            ]
        );
    }

    #[test]
    fn test_source_settings_without_level() {
        let settings = SourceMeasureSettings::new(SourceMeasureMode::SourceCurrentMeasureVoltage)
            .with_protection(40)
            .unwrap();
        let commands = source_settings(&settings, &SessionConfig::default(), None);
        assert!(commands.iter().all(|c| !c.starts_with("smu.source.level")));
        assert!(commands.contains(&"smu.source.protect.level = smu.PROTECT_40V".to_string()));
        assert_eq!(commands.last().unwrap(), "smu.source.vlimit.level = 20");
    }

    #[test]
    fn test_initialize_order() {
        let mock = MockTransport::new();
        let log = mock.call_log();
        let mut conn = ConnectionHandle::new("USB0::MOCK::INSTR", Box::new(mock));
        let mut registry = BufferRegistry::new();
        let config = SessionConfig {
            user_buffer: Some(UserBuffer::new("ivbuf", 2_000)),
            ..SessionConfig::default()
        };

        initialize(&mut conn, &mut registry, &config).unwrap();

        let reset = log.index_of("reset()").unwrap();
        let screen = log.index_of(tsp::DISPLAY_USER_SCREEN).unwrap();
        let autozero = log.index_of_prefix("smu.measure.autozero").unwrap();
        let make = log.index_of("ivbuf = buffer.make(2000)").unwrap();
        assert!(reset < screen && screen < autozero && autozero < make);
        assert_eq!(reset, 0);
        assert_eq!(registry.active(), "ivbuf");
    }

    #[test]
    fn test_initialize_rejects_invalid_config_before_sending() {
        let mock = MockTransport::new();
        let log = mock.call_log();
        let mut conn = ConnectionHandle::new("USB0::MOCK::INSTR", Box::new(mock));
        let mut registry = BufferRegistry::new();
        let config = SessionConfig {
            current_limit: -1.0,
            ..SessionConfig::default()
        };

        assert!(initialize(&mut conn, &mut registry, &config).is_err());
        assert!(log.calls().is_empty());
    }

    #[test]
    #[traced_test]
    fn test_failed_cleanup_is_logged() {
        let mock = MockTransport::new().fail_on(tsp::OUTPUT_OFF);
        let log = mock.call_log();
        let mut conn = ConnectionHandle::new("USB0::MOCK::INSTR", Box::new(mock));

        output_off_after_failure(&mut conn);

        assert_eq!(log.count(tsp::OUTPUT_OFF), 1);
        assert!(logs_contain("Could not turn the source output off"));
    }

    #[test]
    fn test_initialize_touches_active_buffer() {
        let mock = MockTransport::new().with_response("print(defbuffer1.capacity)", "100000");
        let log = mock.call_log();
        let mut conn = ConnectionHandle::new("USB0::MOCK::INSTR", Box::new(mock));
        let mut registry = BufferRegistry::new();

        initialize(&mut conn, &mut registry, &SessionConfig::default()).unwrap();
        assert_eq!(log.queries(), vec!["print(defbuffer1.capacity)".to_string()]);

        log.clear();
        let quiet = SessionConfig {
            activate_default_buffer: false,
            ..SessionConfig::default()
        };
        initialize(&mut conn, &mut registry, &quiet).unwrap();
        assert!(log.queries().is_empty());
    }
}
