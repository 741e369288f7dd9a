//! Mock transport for testing
//!
//! This transport implements [`Transport`] without any hardware behind it. It
//! provides:
//! - A shared call log for verifying the exact command sequence
//! - Controllable failure injection (on connect, or on any command matching a pattern)
//! - Scripted query replies, including whole reading-buffer fixtures

use super::{AdapterError, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One recorded interaction with the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect(String),
    Disconnect,
    Write(String),
    Query(String),
}

/// Cloneable view on everything a [`MockTransport`] has seen.
///
/// The transport itself is moved into a `Session`, so tests keep a `CallLog`
/// and inspect it afterwards.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    fn lock(&self) -> MutexGuard<'_, Vec<Call>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, call: Call) {
        self.lock().push(call);
    }

    /// Every call, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().clone()
    }

    /// Command text of every write and query, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|call| match call {
                Call::Write(cmd) | Call::Query(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn writes(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|call| match call {
                Call::Write(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|call| match call {
                Call::Query(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.lock()
            .iter()
            .filter(|call| matches!(call, Call::Connect(_)))
            .count()
    }

    pub fn disconnects(&self) -> usize {
        self.lock()
            .iter()
            .filter(|call| matches!(call, Call::Disconnect))
            .count()
    }

    /// Position of the first command exactly equal to `command`.
    pub fn index_of(&self, command: &str) -> Option<usize> {
        self.commands().iter().position(|c| c == command)
    }

    /// Position of the first command starting with `prefix`.
    pub fn index_of_prefix(&self, prefix: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.starts_with(prefix))
    }

    /// Number of commands exactly equal to `command`.
    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    /// Number of commands starting with `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// One row of a buffer fixture: source value, source unit, reading, reading unit,
/// relative timestamp.
pub type FixtureRow<'a> = (f64, &'a str, f64, &'a str, f64);

/// In-memory transport.
///
/// # Example
///
/// ```
/// use smu2450::connection::{ConnectionHandle, MockTransport};
///
/// let mock = MockTransport::new().with_response("print(defbuffer1.n)", "3");
/// let log = mock.call_log();
/// let mut conn = ConnectionHandle::new("USB0::MOCK::INSTR", Box::new(mock));
///
/// assert_eq!(conn.send_query("print(defbuffer1.n)").unwrap(), "3");
/// assert_eq!(log.queries().len(), 1);
/// ```
pub struct MockTransport {
    log: CallLog,
    fail_connect: Arc<AtomicBool>,
    fail_patterns: Vec<String>,
    responses: Vec<(String, String)>,
    default_reply: String,
}

impl MockTransport {
    /// Create a mock that accepts everything and answers queries with `0`.
    pub fn new() -> Self {
        Self {
            log: CallLog::default(),
            fail_connect: Arc::new(AtomicBool::new(false)),
            fail_patterns: Vec::new(),
            responses: Vec::new(),
            default_reply: "0".to_string(),
        }
    }

    /// Handle on the shared call log.
    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    /// Make the next connect attempt fail.
    pub fn trigger_connect_failure(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    /// Fail every write or query whose text contains `pattern`.
    pub fn fail_on(mut self, pattern: impl Into<String>) -> Self {
        self.fail_patterns.push(pattern.into());
        self
    }

    /// Answer queries containing `pattern` with `reply`. First registered match wins.
    pub fn with_response(mut self, pattern: impl Into<String>, reply: impl Into<String>) -> Self {
        self.responses.push((pattern.into(), reply.into()));
        self
    }

    /// Reply used when no scripted response matches.
    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// Script the count, capacity and all five dump columns of one buffer.
    pub fn with_buffer(self, name: &str, capacity: u64, rows: &[FixtureRow<'_>]) -> Self {
        fn join_num(values: impl Iterator<Item = f64>) -> String {
            values
                .map(|v| format!("{v:e}"))
                .collect::<Vec<_>>()
                .join(", ")
        }
        fn join_str<'s>(values: impl Iterator<Item = &'s str>) -> String {
            values.collect::<Vec<_>>().join(", ")
        }

        let source_values = join_num(rows.iter().map(|r| r.0));
        let source_units = join_str(rows.iter().map(|r| r.1));
        let readings = join_num(rows.iter().map(|r| r.2));
        let units = join_str(rows.iter().map(|r| r.3));
        let timestamps = join_num(rows.iter().map(|r| r.4));

        self.with_response(format!("print({name}.n)"), rows.len().to_string())
            .with_response(format!("print({name}.capacity)"), capacity.to_string())
            .with_response(format!("{name}.sourcevalues)"), source_values)
            .with_response(format!("{name}.sourceunits)"), source_units)
            .with_response(format!("{name}.readings)"), readings)
            .with_response(format!("{name}.units)"), units)
            .with_response(format!("{name}.relativetimestamps)"), timestamps)
    }

    fn should_fail(&self, command: &str) -> bool {
        self.fail_patterns.iter().any(|p| command.contains(p.as_str()))
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn connect(&mut self, address: &str) -> Result<(), AdapterError> {
        self.log.push(Call::Connect(address.to_string()));
        if self.fail_connect.swap(false, Ordering::SeqCst) {
            return Err(AdapterError::ConnectionFailed(format!(
                "mock refused '{address}'"
            )));
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), AdapterError> {
        self.log.push(Call::Disconnect);
        Ok(())
    }

    fn write(&mut self, command: &str) -> Result<(), AdapterError> {
        self.log.push(Call::Write(command.to_string()));
        if self.should_fail(command) {
            return Err(AdapterError::SendFailed(format!("mock rejected '{command}'")));
        }
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, AdapterError> {
        self.log.push(Call::Query(command.to_string()));
        if self.should_fail(command) {
            return Err(AdapterError::QueryFailed(format!("mock rejected '{command}'")));
        }
        let reply = self
            .responses
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.default_reply.clone());
        Ok(reply)
    }
}
