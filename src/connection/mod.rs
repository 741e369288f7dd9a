//! Connection handle
//!
//! Low-level link to the instrument. A [`Transport`] moves text over a bus
//! (VISA, or the in-memory mock); [`ConnectionHandle`] owns one transport,
//! tracks whether it is open and turns transport failures into [`SmuError`]s.
//!
//! Every call blocks until the bus returns. There are no retries: the first
//! failed write or query is reported straight back to the caller.

pub mod mock;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use mock::{CallLog, MockTransport};
#[cfg(feature = "instrument_visa")]
pub use visa::VisaTransport;

use crate::error::{SmuError, SmuResult};
use tracing::{debug, info};

/// An error that can occur when interacting with a transport.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Synchronous text transport to a single instrument.
pub trait Transport: Send {
    /// Short name of the transport, used in logs.
    fn name(&self) -> &str;

    /// Claim the link.
    fn connect(&mut self, address: &str) -> Result<(), AdapterError>;

    /// Release the link.
    fn disconnect(&mut self) -> Result<(), AdapterError>;

    /// Write one command, no reply expected.
    fn write(&mut self, command: &str) -> Result<(), AdapterError>;

    /// Write one command and read one line back (terminator stripped).
    fn query(&mut self, command: &str) -> Result<String, AdapterError>;
}

/// Whether the link is currently claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Open,
}

/// Exclusive owner of the link to one instrument.
pub struct ConnectionHandle {
    address: String,
    state: LinkState,
    transport: Box<dyn Transport>,
}

impl ConnectionHandle {
    /// Create a closed handle; the link is claimed on first use.
    pub fn new(address: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            address: address.into(),
            state: LinkState::Closed,
            transport,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// Claim the link. Calling this on an open handle does nothing.
    pub fn open(&mut self) -> SmuResult<()> {
        if self.is_open() {
            return Ok(());
        }
        self.transport
            .connect(&self.address)
            .map_err(|source| SmuError::Connection {
                address: self.address.clone(),
                source,
            })?;
        self.state = LinkState::Open;
        info!(address = %self.address, transport = self.transport.name(), "Connection opened");
        Ok(())
    }

    /// Release the link. Calling this on a closed handle does nothing.
    pub fn close(&mut self) -> SmuResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.state = LinkState::Closed;
        self.transport
            .disconnect()
            .map_err(|source| SmuError::Connection {
                address: self.address.clone(),
                source,
            })?;
        info!(address = %self.address, "Connection closed");
        Ok(())
    }

    /// Fire-and-forget write. Opens the link first if needed.
    pub fn send(&mut self, command: &str) -> SmuResult<()> {
        self.open()?;
        debug!(command, "write");
        self.transport
            .write(command)
            .map_err(|source| SmuError::Command {
                command: command.to_string(),
                source,
            })
    }

    /// Write-then-read. Opens the link first if needed.
    pub fn send_query(&mut self, command: &str) -> SmuResult<String> {
        self.open()?;
        let reply = self
            .transport
            .query(command)
            .map_err(|source| SmuError::Command {
                command: command.to_string(),
                source,
            })?;
        debug!(command, reply = %reply, "query");
        Ok(reply)
    }

    /// Send a batch in order, stopping at the first failure.
    pub fn send_all<I, S>(&mut self, commands: I) -> SmuResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for command in commands {
            self.send(command.as_ref())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("address", &self.address)
            .field("state", &self.state)
            .field("transport", &self.transport.name())
            .finish()
    }
}
