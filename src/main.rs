//! CLI entry point for smu2450
//!
//! One subcommand per operation; every parameter comes from flags or the
//! configuration file, never from prompts.
//!
//! # Usage
//!
//! ```bash
//! smu2450 --simulate beep
//! smu2450 measure --mode svmi 0.5 1.0 1.5 --delay 0.1
//! smu2450 sweep --mode simv --json by-points --start -1e-3 --stop 1e-3 --points 100
//! smu2450 retrieve defbuffer1 --csv readings.csv
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use smu2450::config::{AppConfig, InstrumentConfig, LoggingConfig, DEFAULT_CONFIG_PATH};
use smu2450::connection::{CallLog, MockTransport};
use smu2450::mode::{MeasureLimits, SourceMeasureMode, SourceMeasureSettings};
use smu2450::sweep::DEFAULT_CONFIG_LIST;
use smu2450::buffer::{scaled, signed_log10};
use smu2450::{
    logging, BufferData, BufferReading, ListMeasurement, PointMeasurement, RetrievalMode, Session,
    SessionConfig, SmuError, SweepRequest, SweepSpec,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;

#[derive(Parser)]
#[command(name = "smu2450")]
#[command(about = "Drive a 2450-class source-measure unit", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// VISA resource address, overrides the configuration file
    #[arg(long, global = true)]
    address: Option<String>,

    /// Use the in-memory transport and print every command instead of talking to hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Logging level, overrides the configuration file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Beep three times to check the connection
    Beep,

    /// Measure at one level, or at each of several levels in turn
    Measure {
        #[command(flatten)]
        mode: ModeArgs,

        /// Source level(s), in V or A depending on the mode
        #[arg(required = true, num_args = 1.., allow_negative_numbers = true)]
        levels: Vec<f64>,

        /// Seconds between levels when more than one is given
        #[arg(long, default_value_t = 0.01)]
        delay: f64,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Run a sweep on the instrument's trigger model
    Sweep {
        #[command(flatten)]
        mode: ModeArgs,

        /// Run start to stop and back again
        #[arg(long)]
        dual: bool,

        /// Keep going when the source limit is exceeded
        #[arg(long)]
        no_fail_abort: bool,

        /// Configuration list the sweep is stored under
        #[arg(long, default_value = DEFAULT_CONFIG_LIST)]
        config_list: String,

        #[command(flatten)]
        output: OutputArgs,

        #[command(subcommand)]
        shape: SweepShape,
    },

    /// Read a buffer back without resetting the instrument
    ///
    /// Known buffers are the system buffers plus the configured user buffer.
    Retrieve {
        /// Buffer name, defaults to defbuffer1
        buffer: Option<String>,

        /// Fetch readings, units and timestamps as one raw reply
        #[arg(long)]
        whole: bool,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Print the effective configuration as TOML
    Config,

    /// List the VISA resources the resource manager can see
    Resources,
}

#[derive(Args)]
struct ModeArgs {
    /// svmi, simv, simr, simv-ohm or svmi-ohm
    #[arg(long, short)]
    mode: SourceMeasureMode,

    /// Source range, defaults to the session value for the mode
    #[arg(long)]
    source_range: Option<f64>,

    /// Measure range, defaults to the session value for the mode
    #[arg(long)]
    measure_range: Option<f64>,

    /// Compliance limit, defaults to the session value for the mode
    #[arg(long)]
    source_limit: Option<f64>,

    /// Overvoltage protection in volts
    #[arg(long)]
    protection: Option<u16>,

    /// Lower bound of the limit test
    #[arg(long, requires = "limit_high", allow_negative_numbers = true)]
    limit_low: Option<f64>,

    /// Upper bound of the limit test
    #[arg(long, requires = "limit_low", allow_negative_numbers = true)]
    limit_high: Option<f64>,

    /// Beep when the limit test fails
    #[arg(long)]
    limit_beep: bool,

    /// Buffer to store readings in, defaults to the active buffer
    #[arg(long)]
    buffer: Option<String>,
}

impl ModeArgs {
    fn settings(&self) -> Result<SourceMeasureSettings> {
        let mut settings = SourceMeasureSettings::new(self.mode);
        settings.source_range = self.source_range;
        settings.measure_range = self.measure_range;
        settings.source_limit = self.source_limit;
        if let Some(volts) = self.protection {
            settings = settings.with_protection(volts)?;
        }
        if let (Some(low), Some(high)) = (self.limit_low, self.limit_high) {
            let mut limits = MeasureLimits::new(low, high)?;
            if self.limit_beep {
                limits = limits.with_beep();
            }
            settings = settings.with_limits(limits);
        }
        Ok(settings)
    }
}

#[derive(Subcommand)]
enum SweepShape {
    /// Evenly spaced levels, given as a point count
    ByPoints {
        #[command(flatten)]
        bounds: Bounds,
        #[arg(long)]
        points: u32,
    },
    /// Evenly spaced levels, given as a step
    ByStep {
        #[command(flatten)]
        bounds: Bounds,
        #[arg(long)]
        step: f64,
    },
    /// Logarithmically spaced levels
    Log {
        #[command(flatten)]
        bounds: Bounds,
        #[arg(long)]
        points: u32,
    },
    /// Explicit levels, in order
    List {
        #[arg(required = true, num_args = 1.., allow_negative_numbers = true)]
        levels: Vec<f64>,
        #[command(flatten)]
        timing: Timing,
    },
}

#[derive(Args)]
struct Bounds {
    #[arg(long, allow_negative_numbers = true)]
    start: f64,
    #[arg(long, allow_negative_numbers = true)]
    stop: f64,
    #[command(flatten)]
    timing: Timing,
}

#[derive(Args)]
struct Timing {
    /// Seconds between source and measure at each point (0 for auto)
    #[arg(long, default_value_t = 0.0)]
    delay: f64,
    /// Number of times the sweep runs
    #[arg(long, default_value_t = 1)]
    iterations: u32,
}

impl SweepShape {
    fn spec(&self) -> SweepSpec {
        match self {
            SweepShape::ByPoints { bounds, points } => SweepSpec::ByPoints {
                start: bounds.start,
                stop: bounds.stop,
                points: *points,
                delay: bounds.timing.delay,
                iterations: bounds.timing.iterations,
            },
            SweepShape::ByStep { bounds, step } => SweepSpec::ByStep {
                start: bounds.start,
                stop: bounds.stop,
                step: *step,
                delay: bounds.timing.delay,
                iterations: bounds.timing.iterations,
            },
            SweepShape::Log { bounds, points } => SweepSpec::Logarithmic {
                start: bounds.start,
                stop: bounds.stop,
                points: *points,
                delay: bounds.timing.delay,
                iterations: bounds.timing.iterations,
            },
            SweepShape::List { levels, timing } => SweepSpec::CustomList {
                levels: levels.clone(),
                delay: timing.delay,
                iterations: timing.iterations,
            },
        }
    }
}

#[derive(Args)]
struct OutputArgs {
    /// Print the readings as JSON
    #[arg(long)]
    json: bool,

    /// Also write the readings to a CSV file
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Device area in cm², adds current density (jvalues) to the output
    #[arg(long)]
    area: Option<f64>,

    /// Multiply readings by this factor (e.g. 1e3 for mA), adds scaledreadings
    #[arg(long, allow_negative_numbers = true)]
    scale: Option<f64>,

    /// Add sign-preserving log10 columns (logreadings, and logjvalues with --area)
    #[arg(long)]
    log: bool,
}

impl OutputArgs {
    /// Columns derived from the readings, in output order.
    fn derived(&self, reading: &BufferReading) -> Result<Vec<(&'static str, Vec<f64>)>> {
        let mut columns = Vec::new();
        let jvalues = match self.area {
            Some(area) => Some(reading.current_density(area)?),
            None => None,
        };
        if let Some(factor) = self.scale {
            columns.push(("scaledreadings", scaled(&reading.readings, factor)));
        }
        if self.log {
            columns.push(("logreadings", signed_log10(&reading.readings)));
            if let Some(j) = &jvalues {
                columns.push(("logjvalues", signed_log10(j)));
            }
        }
        if let Some(j) = jvalues {
            columns.insert(0, ("jvalues", j));
        }
        Ok(columns)
    }
}

/// Exit status for requests rejected before anything reached the instrument
const EXIT_INVALID_REQUEST: u8 = 2;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init(&config.logging)?;

    match &cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Resources => return list_resources().map(|()| ExitCode::SUCCESS),
        _ => {}
    }

    let (mut session, log) = open_session(&config.instrument)?;
    let result = run(&mut session, &cli.command, &config.session);
    if let Some(log) = log {
        for command in log.commands() {
            eprintln!("> {command}");
        }
    }
    session.close()?;
    exit_status(result)
}

/// Report rejected requests with their own status; other errors propagate.
fn exit_status(result: Result<()>) -> Result<ExitCode> {
    match result {
        Err(err) if err.downcast_ref::<SmuError>().is_some_and(SmuError::is_validation) => {
            eprintln!("Error: {err:#}");
            Ok(ExitCode::from(EXIT_INVALID_REQUEST))
        }
        other => other.map(|()| ExitCode::SUCCESS),
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = if path.exists() {
        AppConfig::load_from(&path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?
    } else if cli.config.is_some() {
        bail!("configuration file {} not found", path.display());
    } else {
        AppConfig {
            instrument: InstrumentConfig {
                address: String::new(),
                simulate: false,
            },
            logging: LoggingConfig::default(),
            session: SessionConfig::default(),
        }
    };

    if let Some(address) = &cli.address {
        config.instrument.address = address.clone();
    }
    if cli.simulate {
        config.instrument.simulate = true;
        if config.instrument.address.is_empty() {
            config.instrument.address = "SIM::2450::INSTR".to_string();
        }
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

fn open_session(instrument: &InstrumentConfig) -> Result<(Session, Option<CallLog>)> {
    if instrument.simulate {
        let mock = MockTransport::new();
        let log = mock.call_log();
        let session = Session::with_transport(instrument.address.clone(), Box::new(mock));
        return Ok((session, Some(log)));
    }
    open_hardware(&instrument.address).map(|session| (session, None))
}

#[cfg(feature = "instrument_visa")]
fn list_resources() -> Result<()> {
    for resource in smu2450::connection::visa::list_resources()? {
        println!("{resource}");
    }
    Ok(())
}

#[cfg(not(feature = "instrument_visa"))]
fn list_resources() -> Result<()> {
    bail!("resource listing needs the instrument_visa feature")
}

#[cfg(feature = "instrument_visa")]
fn open_hardware(address: &str) -> Result<Session> {
    Ok(Session::visa(address))
}

#[cfg(not(feature = "instrument_visa"))]
fn open_hardware(address: &str) -> Result<Session> {
    bail!("cannot reach {address}: built without the instrument_visa feature, use --simulate")
}

fn run(session: &mut Session, command: &Commands, config: &SessionConfig) -> Result<()> {
    match command {
        Commands::Beep => {
            session.beep_test()?;
            println!("Connection is OK");
        }
        Commands::Measure {
            mode,
            levels,
            delay,
            output,
        } => {
            let settings = mode.settings()?;
            session.initialize(config.clone())?;
            let buffer = if let [level] = levels.as_slice() {
                let mut request = PointMeasurement::new(settings, *level);
                request.buffer = mode.buffer.clone();
                session.measure(&request)?
            } else {
                let mut request = ListMeasurement::new(settings, levels.clone()).with_delay(*delay);
                request.buffer = mode.buffer.clone();
                session.measure_list(&request)?
            };
            let reading = session.retrieve_reading(Some(buffer.as_str()))?;
            emit(&reading, output)?;
        }
        Commands::Sweep {
            mode,
            dual,
            no_fail_abort,
            config_list,
            output,
            shape,
        } => {
            let mut request = SweepRequest::new(mode.settings()?, shape.spec())
                .with_config_list(config_list.clone())
                .with_dual(*dual)
                .with_fail_abort(!*no_fail_abort);
            request.buffer = mode.buffer.clone();
            session.initialize(config.clone())?;
            let buffer = session.sweep(&request)?;
            let reading = session.retrieve_reading(Some(buffer.as_str()))?;
            emit(&reading, output)?;
        }
        Commands::Retrieve {
            buffer,
            whole,
            output,
        } => {
            if let Some(user) = &config.user_buffer {
                session.adopt_buffer(&user.name, user.capacity)?;
            }
            let mode = if *whole {
                RetrievalMode::AsWhole
            } else {
                RetrievalMode::Separated
            };
            match session.retrieve(buffer.as_deref(), mode)? {
                BufferData::Whole(raw) => println!("{raw}"),
                BufferData::Separated(reading) => emit(&reading, output)?,
            }
        }
        Commands::Config | Commands::Resources => {}
    }
    Ok(())
}

fn emit(reading: &BufferReading, output: &OutputArgs) -> Result<()> {
    let derived = output.derived(reading)?;

    if output.json {
        let mut value = serde_json::to_value(reading)?;
        if let Some(map) = value.as_object_mut() {
            for (name, column) in &derived {
                map.insert((*name).to_string(), serde_json::json!(column));
            }
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        for i in 0..reading.len() {
            let mut line = format!(
                "{}\t{}\t{}\t{}\t{}",
                reading.source_values[i],
                reading.source_units[i],
                reading.readings[i],
                reading.units[i],
                reading.timestamps[i]
            );
            for (_, column) in &derived {
                line.push_str(&format!("\t{}", column[i]));
            }
            println!("{line}");
        }
    }

    if let Some(path) = &output.csv {
        write_csv(path, reading, &derived)?;
    }

    info!(readings = reading.len(), "Readings retrieved");
    Ok(())
}

#[cfg(feature = "storage_csv")]
fn write_csv(path: &Path, reading: &BufferReading, derived: &[(&str, Vec<f64>)]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    let mut header = vec!["sourcevalues", "sourceunits", "readings", "units", "timestamps"];
    header.extend(derived.iter().map(|(name, _)| *name));
    writer.write_record(&header)?;

    for i in 0..reading.len() {
        let mut row = vec![
            reading.source_values[i].to_string(),
            reading.source_units[i].clone(),
            reading.readings[i].to_string(),
            reading.units[i].clone(),
            reading.timestamps[i].to_string(),
        ];
        row.extend(derived.iter().map(|(_, column)| column[i].to_string()));
        writer.write_record(&row)?;
    }
    writer.flush()?;
    info!(path = %path.display(), "Readings written");
    Ok(())
}

#[cfg(not(feature = "storage_csv"))]
fn write_csv(path: &Path, _reading: &BufferReading, _derived: &[(&str, Vec<f64>)]) -> Result<()> {
    bail!("cannot write {}: built without the storage_csv feature", path.display())
}
