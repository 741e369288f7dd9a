//! Command vocabulary of the instrument's script interface.
//!
//! Every string written to the instrument is produced here, so the rest of the
//! crate never formats command text by hand. Numbers are rendered with Rust's
//! shortest round-trip `Display` form (`2`, `-0.5`, `0.00001`), which the
//! instrument accepts as-is.

use crate::buffer::BufferColumn;
use crate::config::Terminals;
use crate::mode::{MeasureFunction, OverVoltageProtection, SourceFunction};

pub const FULL_RESET: &str = "reset()";
pub const SMU_RESET: &str = "smu.reset()";

pub const DISPLAY_USER_SCREEN: &str = "display.changescreen(display.SCREEN_USER_SWIPE)";
pub const DISPLAY_CLEAR: &str = "display.clear()";

pub const AUTOZERO_ONCE: &str = "smu.measure.autozero.once()";
pub const MEASURE_AUTORANGE_ON: &str = "smu.measure.autorange = smu.ON";
pub const MEASURE_UNIT_OHM: &str = "smu.measure.unit = smu.UNIT_OHM";
pub const OFFSET_COMPENSATION_ON: &str = "smu.measure.offsetcompensation = smu.ON";

pub const LIMIT_CLEAR: &str = "smu.measure.limit[1].clear()";
pub const LIMIT_AUTOCLEAR_OFF: &str = "smu.measure.limit[1].autoclear = smu.OFF";
pub const LIMIT_AUDIBLE_FAIL: &str = "smu.measure.limit[1].audible = smu.AUDIBLE_FAIL";
pub const LIMIT_ENABLE: &str = "smu.measure.limit[1].enable = smu.ON";

pub const OUTPUT_ON: &str = "smu.source.output = smu.ON";
pub const OUTPUT_OFF: &str = "smu.source.output = smu.OFF";

pub const INITIATE: &str = "trigger.model.initiate()";
pub const WAIT_COMPLETE: &str = "waitcomplete()";

pub const FORMAT_ASCII: &str = "format.data = format.ASCII";

/// Delay issued after a sweep reports completion, in seconds.
pub const SETTLE_DELAY: f64 = 1e-5;

/// Line of the user swipe screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayLine {
    Top,
    Bottom,
}

/// `smu.ON` / `smu.OFF`
pub fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "smu.ON"
    } else {
        "smu.OFF"
    }
}

/// Put `text` on one line of the user screen. Double quotes are dropped.
pub fn display_text(line: DisplayLine, text: &str) -> String {
    let slot = match line {
        DisplayLine::Top => "display.TEXT1",
        DisplayLine::Bottom => "display.TEXT2",
    };
    let text: String = text.chars().filter(|c| *c != '"').collect();
    format!("display.settext({slot}, \"{text}\")")
}

pub fn autozero_enable(enabled: bool) -> String {
    format!("smu.measure.autozero.enable = {}", on_off(enabled))
}

pub fn terminals(terminals: Terminals) -> String {
    let value = match terminals {
        Terminals::Front => "smu.TERMINALS_FRONT",
        Terminals::Rear => "smu.TERMINALS_REAR",
    };
    format!("smu.measure.terminals = {value}")
}

pub fn sense(four_wire: bool) -> String {
    let value = if four_wire {
        "smu.SENSE_4WIRE"
    } else {
        "smu.SENSE_2WIRE"
    };
    format!("smu.measure.sense = {value}")
}

pub fn source_readback(enabled: bool) -> String {
    format!("smu.source.readback = {}", on_off(enabled))
}

pub fn nplc(cycles: f64) -> String {
    format!("smu.measure.nplc = {cycles}")
}

pub fn make_buffer(name: &str, capacity: u64) -> String {
    format!("{name} = buffer.make({capacity})")
}

pub fn clear_buffer(name: &str) -> String {
    format!("{name}.clear()")
}

pub fn measure_function(function: MeasureFunction) -> String {
    format!("smu.measure.func = {}", function.tsp_constant())
}

pub fn source_function(function: SourceFunction) -> String {
    format!("smu.source.func = {}", function.tsp_constant())
}

pub fn measure_range(range: f64) -> String {
    format!("smu.measure.range = {range}")
}

pub fn source_range(range: f64) -> String {
    format!("smu.source.range = {range}")
}

pub fn protection(level: OverVoltageProtection) -> String {
    format!("smu.source.protect.level = smu.PROTECT_{}V", level.volts())
}

pub fn source_level(level: f64) -> String {
    format!("smu.source.level = {level}")
}

/// The limit setter depends on what is sourced: a current limit when sourcing
/// voltage, a voltage limit when sourcing current.
pub fn source_limit(function: SourceFunction, limit: f64) -> String {
    match function {
        SourceFunction::Voltage => format!("smu.source.ilimit.level = {limit}"),
        SourceFunction::Current => format!("smu.source.vlimit.level = {limit}"),
    }
}

pub fn limit_low(value: f64) -> String {
    format!("smu.measure.limit[1].low.value = {value}")
}

pub fn limit_high(value: f64) -> String {
    format!("smu.measure.limit[1].high.value = {value}")
}

pub fn measure_read(buffer: &str) -> String {
    format!("smu.measure.read({buffer})")
}

pub fn delay(seconds: f64) -> String {
    format!("delay({seconds})")
}

pub fn ascii_precision(digits: u8) -> String {
    format!("format.asciiprecision = {digits}")
}

pub fn print_count(buffer: &str) -> String {
    format!("print({buffer}.n)")
}

pub fn print_capacity(buffer: &str) -> String {
    format!("print({buffer}.capacity)")
}

/// Dump one column over the full index range of `buffer`.
pub fn print_column(buffer: &str, column: BufferColumn) -> String {
    format!(
        "printbuffer({buffer}.startindex, {buffer}.endindex, {buffer}.{})",
        column.attribute()
    )
}

/// Dump readings, units and timestamps interleaved in a single reply.
pub fn print_whole(buffer: &str) -> String {
    format!(
        "printbuffer({buffer}.startindex, {buffer}.endindex, {buffer}.readings, {buffer}.units, {buffer}.relativetimestamps)"
    )
}

pub fn beep(duration: f64, frequency: u32) -> String {
    format!("beeper.beep({duration}, {frequency})")
}

pub fn configlist_create(name: &str) -> String {
    format!("smu.source.configlist.create(\"{name}\")")
}

pub fn configlist_store(name: &str) -> String {
    format!("smu.source.configlist.store(\"{name}\")")
}

/// Arguments shared by the linear and logarithmic sweep builders.
#[derive(Debug, Clone, Copy)]
pub struct SweepArgs<'a> {
    pub config_list: &'a str,
    pub start: f64,
    pub stop: f64,
    pub delay: f64,
    pub count: u32,
    pub fail_abort: bool,
    pub dual: bool,
    pub buffer: &'a str,
}

pub fn sweep_linear(args: &SweepArgs<'_>, points: u32) -> String {
    format!(
        "smu.source.sweeplinear(\"{}\", {}, {}, {}, {}, {}, smu.RANGE_FIXED, {}, {}, {})",
        args.config_list,
        args.start,
        args.stop,
        points,
        args.delay,
        args.count,
        on_off(args.fail_abort),
        on_off(args.dual),
        args.buffer
    )
}

pub fn sweep_linear_step(args: &SweepArgs<'_>, step: f64) -> String {
    format!(
        "smu.source.sweeplinearstep(\"{}\", {}, {}, {}, {}, {}, smu.RANGE_FIXED, {}, {}, {})",
        args.config_list,
        args.start,
        args.stop,
        step,
        args.delay,
        args.count,
        on_off(args.fail_abort),
        on_off(args.dual),
        args.buffer
    )
}

pub fn sweep_log(args: &SweepArgs<'_>, points: u32) -> String {
    format!(
        "smu.source.sweeplog(\"{}\", {}, {}, {}, {}, {}, smu.RANGE_FIXED, {}, {}, {})",
        args.config_list,
        args.start,
        args.stop,
        points,
        args.delay,
        args.count,
        on_off(args.fail_abort),
        on_off(args.dual),
        args.buffer
    )
}

/// Sweep over a stored configuration list, starting at index 1.
pub fn sweep_list(config_list: &str, delay: f64, count: u32, fail_abort: bool, buffer: &str) -> String {
    format!(
        "smu.source.sweeplist(\"{config_list}\", 1, {delay}, {count}, {}, {buffer})",
        on_off(fail_abort)
    )
}
