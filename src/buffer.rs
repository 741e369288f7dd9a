//! Buffer Registry
//!
//! Tracks the reading buffers that exist on the instrument and reads them back.
//!
//! Two system buffers (`defbuffer1`, `defbuffer2`) always exist. User buffers
//! are added by [`BufferRegistry::create`] and disappear with a full instrument
//! reset, so whoever sends `reset()` must also call [`BufferRegistry::reset`].
//!
//! Retrieval in [`RetrievalMode::Separated`] issues one dump query per column.
//! Every column has to come back with exactly as many entries as the buffer
//! holds; anything shorter or longer is a [`SmuError::BufferRead`], never a
//! padded or truncated result.

use crate::connection::ConnectionHandle;
use crate::error::{SmuError, SmuResult};
use crate::tsp;
use crate::validation::is_tsp_identifier;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// First system buffer; active by default.
pub const DEFAULT_BUFFER: &str = "defbuffer1";
/// Second system buffer.
pub const SECOND_BUFFER: &str = "defbuffer2";
/// Largest standard buffer the instrument can allocate.
pub const MAX_BUFFER_CAPACITY: u64 = 6_875_000;

const SYSTEM_BUFFERS: [&str; 2] = [DEFAULT_BUFFER, SECOND_BUFFER];

/// True for the two buffers that exist by construction.
pub fn is_system_buffer(name: &str) -> bool {
    SYSTEM_BUFFERS.contains(&name)
}

/// A buffer known to exist on the instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub name: String,
    /// Requested capacity; `None` for system buffers, whose size the driver never sets
    pub capacity: Option<u64>,
}

/// One column of a reading buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferColumn {
    SourceValues,
    SourceUnits,
    Readings,
    Units,
    RelativeTimestamps,
}

impl BufferColumn {
    /// Columns in the order they are dumped.
    pub const ALL: [BufferColumn; 5] = [
        BufferColumn::SourceValues,
        BufferColumn::SourceUnits,
        BufferColumn::Readings,
        BufferColumn::Units,
        BufferColumn::RelativeTimestamps,
    ];

    /// Attribute name on the buffer object.
    pub fn attribute(self) -> &'static str {
        match self {
            BufferColumn::SourceValues => "sourcevalues",
            BufferColumn::SourceUnits => "sourceunits",
            BufferColumn::Readings => "readings",
            BufferColumn::Units => "units",
            BufferColumn::RelativeTimestamps => "relativetimestamps",
        }
    }
}

/// How a buffer is read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrievalMode {
    /// One raw reply with readings, units and timestamps interleaved
    AsWhole,
    /// Five parallel columns
    #[default]
    Separated,
}

/// Result of [`BufferRegistry::retrieve`].
#[derive(Debug, Clone, PartialEq)]
pub enum BufferData {
    Whole(String),
    Separated(BufferReading),
}

/// Parallel columns read from one buffer; all have the same length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferReading {
    #[serde(rename = "sourcevalues")]
    pub source_values: Vec<f64>,
    #[serde(rename = "sourceunits")]
    pub source_units: Vec<String>,
    pub readings: Vec<f64>,
    pub units: Vec<String>,
    pub timestamps: Vec<f64>,
}

impl BufferReading {
    /// Number of stored readings.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Readings divided by a device area in cm², e.g. current density from current.
    pub fn current_density(&self, area_cm2: f64) -> SmuResult<Vec<f64>> {
        crate::validation::is_positive(area_cm2).map_err(|reason| {
            SmuError::configuration(format!("device area {area_cm2} cm²: {reason}"))
        })?;
        Ok(self.readings.iter().map(|r| r / area_cm2).collect())
    }
}

/// Multiply every value by `factor` (e.g. `1e3` for A to mA).
pub fn scaled(values: &[f64], factor: f64) -> Vec<f64> {
    values.iter().map(|v| v * factor).collect()
}

/// Sign-preserving base-10 logarithm: `-log10(-x)` for negative `x`, `log10(x)` otherwise.
///
/// Zero maps to negative infinity.
pub fn signed_log10(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .map(|&v| if v < 0.0 { -(-v).log10() } else { v.log10() })
        .collect()
}

/// Known buffers and the currently active one.
#[derive(Debug, Clone)]
pub struct BufferRegistry {
    buffers: Vec<Buffer>,
    active: String,
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferRegistry {
    /// Registry holding only the system buffers, with `defbuffer1` active.
    pub fn new() -> Self {
        Self {
            buffers: SYSTEM_BUFFERS
                .iter()
                .map(|name| Buffer {
                    name: name.to_string(),
                    capacity: None,
                })
                .collect(),
            active: DEFAULT_BUFFER.to_string(),
        }
    }

    /// Forget every user buffer. Call whenever the instrument performs a full reset.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.buffers.iter().any(|b| b.name == name)
    }

    /// Names of every known buffer, system buffers first.
    pub fn names(&self) -> Vec<&str> {
        self.buffers.iter().map(|b| b.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Buffer> {
        self.buffers.iter().find(|b| b.name == name)
    }

    /// Name of the buffer readings currently go to.
    pub fn active(&self) -> &str {
        &self.active
    }

    /// Fail with [`SmuError::UnknownBuffer`] unless `name` is known.
    pub fn ensure_known(&self, name: &str) -> SmuResult<()> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(SmuError::UnknownBuffer(name.to_string()))
        }
    }

    /// Check a creation request without touching the instrument.
    pub fn validate_new(name: &str, capacity: u64) -> SmuResult<()> {
        is_tsp_identifier(name).map_err(|reason| {
            SmuError::configuration(format!("buffer name '{name}': {reason}"))
        })?;
        if is_system_buffer(name) {
            return Err(SmuError::configuration(format!(
                "buffer name '{name}' is reserved for a system buffer"
            )));
        }
        if !(1..=MAX_BUFFER_CAPACITY).contains(&capacity) {
            return Err(SmuError::InvalidBufferCapacity {
                name: name.to_string(),
                capacity,
                max: MAX_BUFFER_CAPACITY,
            });
        }
        Ok(())
    }

    /// Create a user buffer on the instrument, register it and make it active.
    ///
    /// Creating a name that already exists replaces it on the instrument; the
    /// registry keeps one entry with the new capacity.
    pub fn create(
        &mut self,
        conn: &mut ConnectionHandle,
        name: &str,
        capacity: u64,
    ) -> SmuResult<()> {
        Self::validate_new(name, capacity)?;
        conn.send(&tsp::make_buffer(name, capacity))?;

        match self.buffers.iter_mut().find(|b| b.name == name) {
            Some(existing) => existing.capacity = Some(capacity),
            None => self.buffers.push(Buffer {
                name: name.to_string(),
                capacity: Some(capacity),
            }),
        }
        self.active = name.to_string();
        info!(buffer = name, capacity, "Buffer created");
        Ok(())
    }

    /// Register a user buffer the instrument already holds, without sending anything.
    ///
    /// The active buffer is left alone.
    pub fn adopt(&mut self, name: &str, capacity: u64) -> SmuResult<()> {
        Self::validate_new(name, capacity)?;
        match self.buffers.iter_mut().find(|b| b.name == name) {
            Some(existing) => existing.capacity = Some(capacity),
            None => self.buffers.push(Buffer {
                name: name.to_string(),
                capacity: Some(capacity),
            }),
        }
        debug!(buffer = name, capacity, "Buffer adopted");
        Ok(())
    }

    /// Make `name` the active buffer, or `defbuffer1` when `None`.
    ///
    /// Returns the name that is now active.
    pub fn activate(&mut self, name: Option<&str>) -> SmuResult<&str> {
        let name = name.unwrap_or(DEFAULT_BUFFER);
        self.ensure_known(name)?;
        if self.active != name {
            debug!(buffer = name, "Buffer activated");
            self.active = name.to_string();
        }
        Ok(&self.active)
    }

    /// Capacity reported by the instrument.
    pub fn query_capacity(&self, conn: &mut ConnectionHandle, name: &str) -> SmuResult<u64> {
        self.ensure_known(name)?;
        let reply = conn.send_query(&tsp::print_capacity(name))?;
        parse_count(name, &reply)
    }

    /// Number of readings currently stored.
    pub fn query_count(&self, conn: &mut ConnectionHandle, name: &str) -> SmuResult<usize> {
        self.ensure_known(name)?;
        let reply = conn.send_query(&tsp::print_count(name))?;
        let count = parse_count(name, &reply)?;
        usize::try_from(count)
            .map_err(|_| SmuError::buffer_read(name, format!("reading count {count} too large")))
    }

    /// Read a buffer back from the instrument.
    ///
    /// An unknown name fails before anything is sent.
    pub fn retrieve(
        &self,
        conn: &mut ConnectionHandle,
        name: &str,
        mode: RetrievalMode,
        precision: u8,
    ) -> SmuResult<BufferData> {
        self.ensure_known(name)?;
        conn.send(tsp::FORMAT_ASCII)?;
        conn.send(&tsp::ascii_precision(precision))?;

        match mode {
            RetrievalMode::AsWhole => {
                let raw = conn.send_query(&tsp::print_whole(name))?;
                Ok(BufferData::Whole(raw))
            }
            RetrievalMode::Separated => {
                let expected = self.query_count(conn, name)?;
                let reading = if expected == 0 {
                    BufferReading::default()
                } else {
                    read_columns(conn, name, expected)?
                };
                info!(buffer = name, readings = reading.len(), "Buffer retrieved");
                Ok(BufferData::Separated(reading))
            }
        }
    }
}

fn read_columns(
    conn: &mut ConnectionHandle,
    name: &str,
    expected: usize,
) -> SmuResult<BufferReading> {
    let mut reading = BufferReading::default();
    for column in BufferColumn::ALL {
        let reply = conn
            .send_query(&tsp::print_column(name, column))
            .map_err(|e| SmuError::buffer_read(name, format!("{} dump failed: {e}", column.attribute())))?;
        let fields = split_fields(&reply);
        if fields.len() != expected {
            return Err(SmuError::buffer_read(
                name,
                format!(
                    "{} returned {} entries, expected {}",
                    column.attribute(),
                    fields.len(),
                    expected
                ),
            ));
        }
        match column {
            BufferColumn::SourceValues => reading.source_values = parse_numbers(name, column, &fields)?,
            BufferColumn::SourceUnits => reading.source_units = to_strings(&fields),
            BufferColumn::Readings => reading.readings = parse_numbers(name, column, &fields)?,
            BufferColumn::Units => reading.units = to_strings(&fields),
            BufferColumn::RelativeTimestamps => {
                reading.timestamps = parse_numbers(name, column, &fields)?
            }
        }
    }
    Ok(reading)
}

/// Split one comma-separated dump line. An empty reply has no fields.
fn split_fields(reply: &str) -> Vec<&str> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Vec::new();
    }
    reply.split(',').map(str::trim).collect()
}

fn to_strings(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

fn parse_numbers(name: &str, column: BufferColumn, fields: &[&str]) -> SmuResult<Vec<f64>> {
    fields
        .iter()
        .enumerate()
        .map(|(i, field)| {
            field.parse::<f64>().map_err(|_| {
                SmuError::buffer_read(
                    name,
                    format!("{} entry {} is not a number: '{field}'", column.attribute(), i + 1),
                )
            })
        })
        .collect()
}

/// Counts come back as integers, sometimes in float notation (`1.0e+04`).
fn parse_count(name: &str, reply: &str) -> SmuResult<u64> {
    let trimmed = reply.trim();
    if let Ok(count) = trimmed.parse::<u64>() {
        return Ok(count);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64 => {
            Ok(value as u64)
        }
        _ => Err(SmuError::buffer_read(
            name,
            format!("expected a count, got '{trimmed}'"),
        )),
    }
}
