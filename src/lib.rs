//! # smu2450
//!
//! Driver core for a 2450-class source-measure unit (SMU) controlled over a
//! textual command protocol. The crate owns the instrument session: it tracks
//! the declared configuration, manages the on-device reading buffers and runs
//! the multi-step command sequences (configure, arm, trigger, wait, retrieve)
//! behind every measurement and sweep.
//!
//! ## Crate Structure
//!
//! - **`session`**: [`Session`], the owned value every operation goes through.
//! - **`connection`**: the [`connection::Transport`] seam, the lazily opened
//!   [`ConnectionHandle`], a VISA transport (feature `instrument_visa`) and a
//!   recording mock used by tests and the CLI's `--simulate` mode.
//! - **`sequencer`**: reset, global settings and function settings, always in
//!   the same order.
//! - **`sweep`**: sweep variants, the command builder and the sweep state machine.
//! - **`buffer`**: known buffers, activation and the retrieval protocol.
//! - **`mode`**: source/measure modes, overvoltage protection and limit tests.
//! - **`tsp`**: rendering of every command string the crate sends.
//! - **`config`**: serde configuration loaded with `figment`.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: [`SmuError`] and [`SmuResult`].
//! - **`validation`**: small parameter checks shared by the modules above.
//!
//! ## Example
//!
//! ```no_run
//! use smu2450::connection::MockTransport;
//! use smu2450::mode::{SourceMeasureMode, SourceMeasureSettings};
//! use smu2450::{PointMeasurement, Session, SessionConfig};
//!
//! # fn main() -> smu2450::SmuResult<()> {
//! let mut session = Session::with_transport("USB0::0x05E6::0x2450::INSTR", Box::new(MockTransport::new()));
//! session.initialize(SessionConfig::default())?;
//!
//! let settings = SourceMeasureSettings::new(SourceMeasureMode::SourceVoltageMeasureCurrent);
//! session.measure(&PointMeasurement::new(settings, 2.0))?;
//! let reading = session.retrieve_reading(None)?;
//! println!("{} readings", reading.len());
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod mode;
pub mod sequencer;
pub mod session;
pub mod sweep;
pub mod tsp;
pub mod validation;

pub use buffer::{BufferData, BufferReading, RetrievalMode};
pub use config::{AppConfig, AutoZero, SessionConfig, Terminals, UserBuffer};
pub use connection::ConnectionHandle;
pub use error::{SmuError, SmuResult};
pub use mode::{SourceMeasureMode, SourceMeasureSettings};
pub use session::{ListMeasurement, PointMeasurement, Session};
pub use sweep::{SweepRequest, SweepSpec};
