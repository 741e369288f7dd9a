//! VISA transport for GPIB/USB/Ethernet instruments
//!
//! Wraps the `visa-rs` crate. Supports resource strings like:
//! - "GPIB0::12::INSTR" (GPIB interface)
//! - "USB0::0x05E6::0x2450::04586850::INSTR" (USB-TMC)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
//!
//! The transport does not set an I/O timeout of its own; whatever the VISA
//! session defaults to bounds the longest blocking call, including the
//! `waitcomplete()` at the end of a sweep.

use super::{AdapterError, Transport};
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use tracing::debug;
use visa_rs::prelude::*;

/// VISA transport for the instrument link
pub struct VisaTransport {
    /// Line terminator appended to every command (TSP expects "\n")
    line_terminator: String,

    /// Resource manager; must outlive the instrument session
    rm: Option<DefaultRM>,

    /// The open VISA session
    instrument: Option<Instrument>,
}

impl VisaTransport {
    /// Create a new, unconnected VISA transport
    pub fn new() -> Self {
        Self {
            line_terminator: "\n".to_string(),
            rm: None,
            instrument: None,
        }
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }

    fn instrument(&self) -> Result<&Instrument, AdapterError> {
        self.instrument.as_ref().ok_or(AdapterError::NotConnected)
    }

    fn framed(&self, command: &str) -> String {
        format!("{}{}", command, self.line_terminator)
    }
}

impl Default for VisaTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for VisaTransport {
    fn name(&self) -> &str {
        "visa"
    }

    fn connect(&mut self, address: &str) -> Result<(), AdapterError> {
        let rm = DefaultRM::new().map_err(|e| {
            AdapterError::ConnectionFailed(format!("Failed to create VISA resource manager: {e}"))
        })?;
        let c_string = CString::new(address)
            .map_err(|_| AdapterError::InvalidAddress(address.to_string()))?;
        let visa_string = visa_rs::VisaString::from(c_string);
        let instrument = rm
            .open(&visa_string, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
            .map_err(|e| AdapterError::ConnectionFailed(format!("Failed to open '{address}': {e}")))?;

        debug!("VISA session opened: {}", address);
        self.instrument = Some(instrument);
        self.rm = Some(rm);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), AdapterError> {
        // Session first, then the manager that owns it.
        self.instrument = None;
        self.rm = None;
        Ok(())
    }

    fn write(&mut self, command: &str) -> Result<(), AdapterError> {
        let framed = self.framed(command);
        let mut instrument: &Instrument = self.instrument()?;
        instrument
            .write_all(framed.as_bytes())
            .map_err(|e| AdapterError::SendFailed(format!("VISA write failed for '{command}': {e}")))
    }

    fn query(&mut self, command: &str) -> Result<String, AdapterError> {
        let framed = self.framed(command);
        let mut instrument: &Instrument = self.instrument()?;
        instrument
            .write_all(framed.as_bytes())
            .map_err(|e| AdapterError::QueryFailed(format!("VISA write failed for '{command}': {e}")))?;

        let mut reply = String::new();
        BufReader::new(instrument)
            .read_line(&mut reply)
            .map_err(|e| AdapterError::QueryFailed(format!("VISA read failed for '{command}': {e}")))?;
        if reply.is_empty() {
            return Err(AdapterError::MalformedReply(format!(
                "empty reply to '{command}'"
            )));
        }
        Ok(reply.trim().to_string())
    }
}

/// List every instrument address the VISA resource manager can see.
pub fn list_resources() -> Result<Vec<String>, AdapterError> {
    let rm = DefaultRM::new().map_err(|e| {
        AdapterError::ConnectionFailed(format!("Failed to create VISA resource manager: {e}"))
    })?;
    let expr = CString::new("?*INSTR").map_err(|_| AdapterError::InvalidAddress("?*INSTR".into()))?;
    let expr = visa_rs::VisaString::from(expr);
    let mut list = rm
        .find_res_list(&expr)
        .map_err(|e| AdapterError::QueryFailed(format!("Resource search failed: {e}")))?;

    let mut found = Vec::new();
    while let Some(resource) = list
        .find_next()
        .map_err(|e| AdapterError::QueryFailed(format!("Resource search failed: {e}")))?
    {
        found.push(resource.to_string());
    }
    Ok(found)
}
