//! Instrument session.
//!
//! A [`Session`] is the single owner of everything that changes while talking
//! to one instrument: the connection, the configuration stored by
//! [`Session::initialize`] and the [`BufferRegistry`]. Every operation takes
//! `&mut self`, so two callers can never interleave commands on the same link.
//!
//! ## Operations
//!
//! - **`initialize`**: full reset, global settings, optional user buffer.
//! - **`measure`** / **`measure_list`**: host-driven readings at one level or a
//!   list of levels.
//! - **`sweep`**: a sweep run by the instrument's trigger model.
//! - **`retrieve`**, **`buffer_capacity`**, **`buffer_len`**: read buffers back.
//! - **`create_buffer`**, **`activate_buffer`**, **`change_terminals`**,
//!   **`beep_test`**, **`close`**.
//!
//! Measurement and sweep entry points re-apply the global settings before doing
//! anything else, so no operation sees settings left behind by a previous one.
//! Parameter checks run before the first command; a failure after that leaves
//! the instrument partly configured and the remedy is another `initialize`.

use crate::buffer::{BufferData, BufferReading, BufferRegistry, RetrievalMode};
use crate::config::{SessionConfig, Terminals};
use crate::connection::{ConnectionHandle, Transport};
use crate::error::{SmuError, SmuResult};
use crate::mode::SourceMeasureSettings;
use crate::sequencer;
use crate::sweep::{SweepOrchestrator, SweepPlan, SweepRequest};
use crate::tsp;
use crate::validation::is_finite;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

/// Precision used for buffer dumps before `initialize` has stored one.
const DEFAULT_ASCII_PRECISION: u8 = 10;

/// One reading at a fixed source level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointMeasurement {
    pub settings: SourceMeasureSettings,
    /// Source level (V or A, depending on the mode)
    pub level: f64,
    /// Target buffer; the active buffer when `None`
    #[serde(default)]
    pub buffer: Option<String>,
}

impl PointMeasurement {
    pub fn new(settings: SourceMeasureSettings, level: f64) -> Self {
        Self {
            settings,
            level,
            buffer: None,
        }
    }

    pub fn with_buffer(mut self, buffer: impl Into<String>) -> Self {
        self.buffer = Some(buffer.into());
        self
    }
}

/// One reading per level, stepped by the host with a delay between levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListMeasurement {
    pub settings: SourceMeasureSettings,
    pub levels: Vec<f64>,
    /// Seconds to wait after each reading
    #[serde(default = "default_list_delay")]
    pub delay: f64,
    #[serde(default)]
    pub buffer: Option<String>,
}

fn default_list_delay() -> f64 {
    0.01
}

impl ListMeasurement {
    pub fn new(settings: SourceMeasureSettings, levels: Vec<f64>) -> Self {
        Self {
            settings,
            levels,
            delay: default_list_delay(),
            buffer: None,
        }
    }

    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_buffer(mut self, buffer: impl Into<String>) -> Self {
        self.buffer = Some(buffer.into());
        self
    }
}

/// Owned connection, stored configuration and buffer registry for one instrument.
#[derive(Debug)]
pub struct Session {
    conn: ConnectionHandle,
    config: Option<SessionConfig>,
    buffers: BufferRegistry,
}

impl Session {
    /// Wrap a connection. Nothing is sent until the first operation.
    pub fn new(conn: ConnectionHandle) -> Self {
        Self {
            conn,
            config: None,
            buffers: BufferRegistry::new(),
        }
    }

    /// Build a session over any transport.
    pub fn with_transport(address: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self::new(ConnectionHandle::new(address, transport))
    }

    /// Build a session over VISA.
    #[cfg(feature = "instrument_visa")]
    pub fn visa(address: impl Into<String>) -> Self {
        Self::with_transport(address, Box::new(crate::connection::VisaTransport::new()))
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.conn
    }

    /// Configuration stored by the last `initialize`.
    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    pub fn buffers(&self) -> &BufferRegistry {
        &self.buffers
    }

    pub fn active_buffer(&self) -> &str {
        self.buffers.active()
    }

    fn require_config(&self) -> SmuResult<&SessionConfig> {
        self.config.as_ref().ok_or(SmuError::NotInitialized)
    }

    /// Store `config` and bring the instrument to a known state.
    ///
    /// Safe to call again at any time; it is the only way to change global settings.
    #[instrument(skip_all, fields(address = %self.conn.address()))]
    pub fn initialize(&mut self, config: SessionConfig) -> SmuResult<()> {
        config.validate()?;
        self.config = Some(config.clone());
        sequencer::initialize(&mut self.conn, &mut self.buffers, &config)
    }

    /// Create a user buffer and make it active.
    #[instrument(skip(self))]
    pub fn create_buffer(&mut self, name: &str, capacity: u64) -> SmuResult<()> {
        self.buffers.create(&mut self.conn, name, capacity)
    }

    /// Register a user buffer created on the instrument by an earlier session.
    ///
    /// Nothing is sent; the buffer can then be read back or written to by name.
    pub fn adopt_buffer(&mut self, name: &str, capacity: u64) -> SmuResult<()> {
        self.buffers.adopt(name, capacity)
    }

    /// Make `name` (or `defbuffer1` when `None`) the active buffer.
    pub fn activate_buffer(&mut self, name: Option<&str>) -> SmuResult<()> {
        self.buffers.activate(name).map(|_| ())
    }

    /// Take one reading at `request.level`. Returns the buffer the reading went to.
    #[instrument(skip_all, fields(mode = %request.settings.mode, level = request.level))]
    pub fn measure(&mut self, request: &PointMeasurement) -> SmuResult<String> {
        request.settings.validate()?;
        is_finite(request.level).map_err(|reason| {
            SmuError::configuration(format!("source level {}: {reason}", request.level))
        })?;
        let buffer = self.target_buffer(request.buffer.as_deref())?;
        let config = self.require_config()?.clone();

        sequencer::reconfigure(
            &mut self.conn,
            &config,
            request.settings.mode.display_label(),
            "Single Point",
        )?;
        self.buffers.activate(Some(buffer.as_str()))?;
        self.conn.send_all(sequencer::function_settings(
            &request.settings,
            &config,
            Some(request.level),
        ))?;
        self.conn.send(&tsp::clear_buffer(&buffer))?;

        self.conn.send(tsp::OUTPUT_ON)?;
        let read = tsp::measure_read(&buffer);
        self.with_output_on(|conn| {
            conn.send(&read)?;
            conn.send(tsp::OUTPUT_OFF)
        })?;

        info!(buffer = %buffer, "Point measurement complete");
        Ok(buffer)
    }

    /// Take one reading per level, in order. Returns the buffer the readings went to.
    #[instrument(skip_all, fields(mode = %request.settings.mode, levels = request.levels.len()))]
    pub fn measure_list(&mut self, request: &ListMeasurement) -> SmuResult<String> {
        request.settings.validate()?;
        if request.levels.is_empty() {
            return Err(SmuError::configuration("level list is empty"));
        }
        if let Some(bad) = request.levels.iter().find(|l| !l.is_finite()) {
            return Err(SmuError::configuration(format!(
                "source level {bad} is not a finite number"
            )));
        }
        if !(request.delay.is_finite() && request.delay >= 0.0) {
            return Err(SmuError::configuration(format!(
                "delay {} s must be zero or positive",
                request.delay
            )));
        }
        let buffer = self.target_buffer(request.buffer.as_deref())?;
        let config = self.require_config()?.clone();

        sequencer::reconfigure(
            &mut self.conn,
            &config,
            request.settings.mode.display_label(),
            "Level List",
        )?;
        self.buffers.activate(Some(buffer.as_str()))?;
        self.conn
            .send_all(sequencer::function_settings(&request.settings, &config, None))?;
        self.conn.send(&tsp::clear_buffer(&buffer))?;

        self.conn.send(tsp::OUTPUT_ON)?;
        let read = tsp::measure_read(&buffer);
        let pause = tsp::delay(request.delay);
        self.with_output_on(|conn| {
            for level in &request.levels {
                conn.send(&tsp::source_level(*level))?;
                conn.send(&read)?;
                conn.send(&pause)?;
            }
            conn.send(tsp::OUTPUT_OFF)
        })?;

        info!(buffer = %buffer, "List measurement complete");
        Ok(buffer)
    }

    /// Run a sweep on the instrument's trigger model and wait for it to finish.
    ///
    /// Returns the buffer holding the readings, which is then the active buffer.
    #[instrument(skip_all, fields(mode = %request.settings.mode, sweep = request.spec.label()))]
    pub fn sweep(&mut self, request: &SweepRequest) -> SmuResult<String> {
        let config = self.require_config()?.clone();
        let plan = SweepPlan::build(request, &config, &self.buffers)?;

        sequencer::reconfigure(&mut self.conn, &config, plan.title, plan.subtitle)?;
        let mut orchestrator = SweepOrchestrator::new();
        orchestrator.execute(&mut self.conn, &plan)?;

        self.buffers.activate(Some(plan.buffer.as_str()))?;
        info!(buffer = %plan.buffer, points = plan.points, "Sweep complete");
        Ok(plan.buffer)
    }

    /// Read a buffer back (the active buffer when `None`).
    ///
    /// An unknown name fails with [`SmuError::UnknownBuffer`] before anything is sent.
    #[instrument(skip(self))]
    pub fn retrieve(&mut self, name: Option<&str>, mode: RetrievalMode) -> SmuResult<BufferData> {
        let name = name.unwrap_or_else(|| self.buffers.active()).to_string();
        let precision = self
            .config
            .as_ref()
            .map_or(DEFAULT_ASCII_PRECISION, |c| c.ascii_precision);
        self.buffers.retrieve(&mut self.conn, &name, mode, precision)
    }

    /// [`Session::retrieve`] in separated mode, unwrapped.
    pub fn retrieve_reading(&mut self, name: Option<&str>) -> SmuResult<BufferReading> {
        match self.retrieve(name, RetrievalMode::Separated)? {
            BufferData::Separated(reading) => Ok(reading),
            BufferData::Whole(_) => Err(SmuError::buffer_read(
                name.unwrap_or_else(|| self.buffers.active()),
                "expected separated columns",
            )),
        }
    }

    /// Capacity of a known buffer, as reported by the instrument.
    pub fn buffer_capacity(&mut self, name: &str) -> SmuResult<u64> {
        self.buffers.query_capacity(&mut self.conn, name)
    }

    /// Number of readings stored in a known buffer.
    pub fn buffer_len(&mut self, name: &str) -> SmuResult<usize> {
        self.buffers.query_count(&mut self.conn, name)
    }

    /// Switch between front and rear terminals.
    ///
    /// The choice is kept in the stored configuration so later operations keep it.
    pub fn change_terminals(&mut self, terminals: Terminals) -> SmuResult<()> {
        self.conn.send(&tsp::terminals(terminals))?;
        if let Some(config) = self.config.as_mut() {
            config.terminals = terminals;
        }
        info!(?terminals, "Terminals changed");
        Ok(())
    }

    /// Beep three times to confirm the link works.
    pub fn beep_test(&mut self) -> SmuResult<()> {
        let beep = tsp::beep(0.1, 2400);
        let pause = tsp::delay(0.5);
        self.conn
            .send_all([&beep, &pause, &beep, &pause, &beep])
    }

    /// Release the link. The session can be used again; the link reopens lazily.
    pub fn close(&mut self) -> SmuResult<()> {
        self.conn.close()
    }

    fn target_buffer(&self, name: Option<&str>) -> SmuResult<String> {
        let name = name.unwrap_or_else(|| self.buffers.active());
        self.buffers.ensure_known(name)?;
        Ok(name.to_string())
    }

    /// Run `body` while the source output is on; on failure, try to switch it off.
    fn with_output_on<F>(&mut self, body: F) -> SmuResult<()>
    where
        F: FnOnce(&mut ConnectionHandle) -> SmuResult<()>,
    {
        let result = body(&mut self.conn);
        if result.is_err() {
            sequencer::output_off_after_failure(&mut self.conn);
        }
        result
    }
}
