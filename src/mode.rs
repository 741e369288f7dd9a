//! Source/measure modes and the per-operation settings that go with them.
//!
//! A [`SourceMeasureMode`] picks which quantity is sourced and which is
//! measured. The two "calculated resistance" modes are an overlay on the plain
//! voltage/current measurement: the measure function is unchanged and only the
//! display unit switches to ohms.

use crate::config::SessionConfig;
use crate::error::{SmuError, SmuResult};
use crate::validation::{is_finite, is_positive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Quantity driven by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFunction {
    Voltage,
    Current,
}

impl SourceFunction {
    pub fn tsp_constant(self) -> &'static str {
        match self {
            SourceFunction::Voltage => "smu.FUNC_DC_VOLTAGE",
            SourceFunction::Current => "smu.FUNC_DC_CURRENT",
        }
    }
}

/// Quantity read by the measure side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasureFunction {
    Current,
    Voltage,
    Resistance,
}

impl MeasureFunction {
    pub fn tsp_constant(self) -> &'static str {
        match self {
            MeasureFunction::Current => "smu.FUNC_DC_CURRENT",
            MeasureFunction::Voltage => "smu.FUNC_DC_VOLTAGE",
            MeasureFunction::Resistance => "smu.FUNC_RESISTANCE",
        }
    }
}

/// What is sourced and what is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceMeasureMode {
    /// Source voltage, measure current
    SourceVoltageMeasureCurrent,
    /// Source current, measure voltage
    SourceCurrentMeasureVoltage,
    /// Source current, measure resistance directly
    SourceCurrentMeasureResistance,
    /// Source current, measure voltage, report in ohms
    SourceCurrentMeasureVoltageOhms,
    /// Source voltage, measure current, report in ohms
    SourceVoltageMeasureCurrentOhms,
}

impl SourceMeasureMode {
    /// Every mode, in declaration order.
    pub const ALL: [SourceMeasureMode; 5] = [
        SourceMeasureMode::SourceVoltageMeasureCurrent,
        SourceMeasureMode::SourceCurrentMeasureVoltage,
        SourceMeasureMode::SourceCurrentMeasureResistance,
        SourceMeasureMode::SourceCurrentMeasureVoltageOhms,
        SourceMeasureMode::SourceVoltageMeasureCurrentOhms,
    ];

    pub fn source_function(self) -> SourceFunction {
        match self {
            SourceMeasureMode::SourceVoltageMeasureCurrent
            | SourceMeasureMode::SourceVoltageMeasureCurrentOhms => SourceFunction::Voltage,
            SourceMeasureMode::SourceCurrentMeasureVoltage
            | SourceMeasureMode::SourceCurrentMeasureResistance
            | SourceMeasureMode::SourceCurrentMeasureVoltageOhms => SourceFunction::Current,
        }
    }

    pub fn measure_function(self) -> MeasureFunction {
        match self {
            SourceMeasureMode::SourceVoltageMeasureCurrent
            | SourceMeasureMode::SourceVoltageMeasureCurrentOhms => MeasureFunction::Current,
            SourceMeasureMode::SourceCurrentMeasureVoltage
            | SourceMeasureMode::SourceCurrentMeasureVoltageOhms => MeasureFunction::Voltage,
            SourceMeasureMode::SourceCurrentMeasureResistance => MeasureFunction::Resistance,
        }
    }

    /// True when the measurement unit is switched to ohms on top of a V or I reading.
    pub fn ohm_unit(self) -> bool {
        matches!(
            self,
            SourceMeasureMode::SourceCurrentMeasureVoltageOhms
                | SourceMeasureMode::SourceVoltageMeasureCurrentOhms
        )
    }

    /// True for every mode whose readings are reported in ohms.
    pub fn is_resistance(self) -> bool {
        self.ohm_unit() || self.measure_function() == MeasureFunction::Resistance
    }

    /// Offset compensation applies to resistance readings taken with remote sense.
    pub fn wants_offset_compensation(self, four_wire: bool) -> bool {
        four_wire && self.is_resistance()
    }

    /// Source range from the session when the operation does not give one.
    pub fn default_source_range(self, config: &SessionConfig) -> f64 {
        match self.source_function() {
            SourceFunction::Voltage => config.source_voltage_range,
            SourceFunction::Current => config.source_current_range,
        }
    }

    /// Measure range from the session; `None` means autorange.
    pub fn default_measure_range(self, config: &SessionConfig) -> Option<f64> {
        match self.measure_function() {
            MeasureFunction::Current => Some(config.measure_current_range),
            MeasureFunction::Voltage => Some(config.measure_voltage_range),
            MeasureFunction::Resistance => config.measure_resistance_range,
        }
    }

    /// Compliance limit from the session: current when sourcing voltage, voltage when sourcing current.
    pub fn default_source_limit(self, config: &SessionConfig) -> f64 {
        match self.source_function() {
            SourceFunction::Voltage => config.current_limit,
            SourceFunction::Current => config.voltage_limit,
        }
    }

    /// Text shown on the instrument's user screen while the mode runs.
    pub fn display_label(self) -> &'static str {
        match self {
            SourceMeasureMode::SourceVoltageMeasureCurrent => "Send V - Measure I",
            SourceMeasureMode::SourceCurrentMeasureVoltage => "Send I - Measure V",
            SourceMeasureMode::SourceCurrentMeasureResistance => "Send I - Measure R",
            SourceMeasureMode::SourceCurrentMeasureVoltageOhms => "Send I - Measure V (R)",
            SourceMeasureMode::SourceVoltageMeasureCurrentOhms => "Send V - Measure I (R)",
        }
    }

    /// Short name used on the command line.
    pub fn short_name(self) -> &'static str {
        match self {
            SourceMeasureMode::SourceVoltageMeasureCurrent => "svmi",
            SourceMeasureMode::SourceCurrentMeasureVoltage => "simv",
            SourceMeasureMode::SourceCurrentMeasureResistance => "simr",
            SourceMeasureMode::SourceCurrentMeasureVoltageOhms => "simv-ohm",
            SourceMeasureMode::SourceVoltageMeasureCurrentOhms => "svmi-ohm",
        }
    }
}

impl fmt::Display for SourceMeasureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl FromStr for SourceMeasureMode {
    type Err = SmuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase();
        SourceMeasureMode::ALL
            .into_iter()
            .find(|mode| mode.short_name() == wanted)
            .ok_or_else(|| {
                SmuError::configuration(format!(
                    "unknown mode '{s}', expected one of: svmi, simv, simr, simv-ohm, svmi-ohm"
                ))
            })
    }
}

/// Overvoltage protection level; only the instrument's fixed set of values is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct OverVoltageProtection(u16);

impl OverVoltageProtection {
    /// Allowed protection levels in volts.
    pub const ALLOWED: [u16; 12] = [2, 5, 10, 20, 40, 60, 80, 100, 120, 140, 160, 180];

    pub fn new(volts: u16) -> SmuResult<Self> {
        if Self::ALLOWED.contains(&volts) {
            Ok(Self(volts))
        } else {
            Err(SmuError::configuration(format!(
                "overvoltage protection {volts} V is not one of {:?}",
                Self::ALLOWED
            )))
        }
    }

    pub fn volts(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for OverVoltageProtection {
    type Error = SmuError;

    fn try_from(volts: u16) -> Result<Self, Self::Error> {
        Self::new(volts)
    }
}

impl From<OverVoltageProtection> for u16 {
    fn from(level: OverVoltageProtection) -> Self {
        level.0
    }
}

/// Pass/fail window on the measured value (limit 1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasureLimits {
    pub low: f64,
    pub high: f64,
    /// Sound the beeper when a reading falls outside the window
    #[serde(default)]
    pub beep_on_fail: bool,
}

impl MeasureLimits {
    pub fn new(low: f64, high: f64) -> SmuResult<Self> {
        let limits = Self {
            low,
            high,
            beep_on_fail: false,
        };
        limits.validate()?;
        Ok(limits)
    }

    pub fn with_beep(mut self) -> Self {
        self.beep_on_fail = true;
        self
    }

    pub fn validate(&self) -> SmuResult<()> {
        is_finite(self.low)
            .and_then(|_| is_finite(self.high))
            .map_err(|reason| SmuError::configuration(format!("measure limits: {reason}")))?;
        if self.low >= self.high {
            return Err(SmuError::configuration(format!(
                "measure limit low {} must be below high {}",
                self.low, self.high
            )));
        }
        Ok(())
    }
}

/// Per-operation source/measure settings. Unset ranges and limits fall back to
/// the session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMeasureSettings {
    pub mode: SourceMeasureMode,
    #[serde(default)]
    pub source_range: Option<f64>,
    #[serde(default)]
    pub measure_range: Option<f64>,
    #[serde(default)]
    pub source_limit: Option<f64>,
    #[serde(default)]
    pub protection: Option<OverVoltageProtection>,
    #[serde(default)]
    pub limits: Option<MeasureLimits>,
}

impl SourceMeasureSettings {
    pub fn new(mode: SourceMeasureMode) -> Self {
        Self {
            mode,
            source_range: None,
            measure_range: None,
            source_limit: None,
            protection: None,
            limits: None,
        }
    }

    pub fn with_source_range(mut self, range: f64) -> Self {
        self.source_range = Some(range);
        self
    }

    pub fn with_measure_range(mut self, range: f64) -> Self {
        self.measure_range = Some(range);
        self
    }

    pub fn with_source_limit(mut self, limit: f64) -> Self {
        self.source_limit = Some(limit);
        self
    }

    /// Set overvoltage protection; values outside the allowed set are rejected here.
    pub fn with_protection(mut self, volts: u16) -> SmuResult<Self> {
        self.protection = Some(OverVoltageProtection::new(volts)?);
        Ok(self)
    }

    pub fn with_limits(mut self, limits: MeasureLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn validate(&self) -> SmuResult<()> {
        let optional = [
            ("source_range", self.source_range),
            ("measure_range", self.measure_range),
            ("source_limit", self.source_limit),
        ];
        for (field, value) in optional {
            if let Some(value) = value {
                is_positive(value).map_err(|reason| {
                    SmuError::configuration(format!("{field} = {value}: {reason}"))
                })?;
            }
        }
        if let Some(limits) = &self.limits {
            limits.validate()?;
        }
        Ok(())
    }

    pub fn source_range_or(&self, config: &SessionConfig) -> f64 {
        self.source_range
            .unwrap_or_else(|| self.mode.default_source_range(config))
    }

    pub fn measure_range_or(&self, config: &SessionConfig) -> Option<f64> {
        self.measure_range
            .or_else(|| self.mode.default_measure_range(config))
    }

    pub fn source_limit_or(&self, config: &SessionConfig) -> f64 {
        self.source_limit
            .unwrap_or_else(|| self.mode.default_source_limit(config))
    }
}
