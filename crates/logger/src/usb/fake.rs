//! In-memory loggers for exercising the device manager and poll worker

use crate::usb::manager::{Transport, UsbBackend};
use common::test_utils::no_data_frame;
use common::{Error, Result};
use protocol::{Command, Frame};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct LoggerState {
    responses: VecDeque<Frame>,
    sent: Vec<Command>,
    failing_opcodes: HashSet<u8>,
    fail_all: bool,
    fail_init: bool,
    initialized: bool,
    resets: usize,
}

/// Scripted logger; clones share state so tests can inspect a device the
/// manager owns.
#[derive(Clone)]
pub(crate) struct FakeLogger {
    name: String,
    state: Arc<Mutex<LoggerState>>,
}

impl FakeLogger {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(LoggerState::default())),
        }
    }

    pub(crate) fn failing_init(self) -> Self {
        self.state.lock().unwrap().fail_init = true;
        self
    }

    /// Queue a response to the next poll request
    pub(crate) fn push_response(&self, frame: Frame) {
        self.state.lock().unwrap().responses.push_back(frame);
    }

    pub(crate) fn fail_all(&self, fail: bool) {
        self.state.lock().unwrap().fail_all = fail;
    }

    pub(crate) fn fail_opcode(&self, opcode: u8) {
        self.state.lock().unwrap().failing_opcodes.insert(opcode);
    }

    /// Commands received, including ones that failed
    pub(crate) fn sent(&self) -> Vec<Command> {
        self.state.lock().unwrap().sent.clone()
    }

    pub(crate) fn sent_opcodes(&self) -> Vec<u8> {
        self.sent().iter().map(Command::opcode).collect()
    }

    pub(crate) fn resets(&self) -> usize {
        self.state.lock().unwrap().resets
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().initialized
    }
}

impl Transport for FakeLogger {
    fn location(&self) -> String {
        self.name.clone()
    }

    fn initialize(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_init {
            return Err(Error::DeviceInit("no bulk endpoints".to_string()));
        }
        state.initialized = true;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state.lock().unwrap().resets += 1;
        Ok(())
    }

    fn exchange(&mut self, request: &Frame, _timeout: Duration) -> Result<Frame> {
        let command = Command::decode(request)?;
        let mut state = self.state.lock().unwrap();
        state.sent.push(command);

        if state.fail_all || state.failing_opcodes.contains(&command.opcode()) {
            return Err(Error::Transport("read timed out".to_string()));
        }

        match command {
            Command::Poll => Ok(state.responses.pop_front().unwrap_or_else(no_data_frame)),
            Command::SetClock { .. } | Command::EraseFlash => Ok(no_data_frame()),
        }
    }
}

#[derive(Default)]
struct BackendState {
    loggers: Vec<FakeLogger>,
    discover_calls: usize,
    fail_enumeration: bool,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub(crate) fn new(loggers: Vec<FakeLogger>) -> Self {
        let backend = Self::default();
        backend.set_loggers(loggers);
        backend
    }

    pub(crate) fn set_loggers(&self, loggers: Vec<FakeLogger>) {
        self.state.lock().unwrap().loggers = loggers;
    }

    pub(crate) fn fail_enumeration(&self, fail: bool) {
        self.state.lock().unwrap().fail_enumeration = fail;
    }

    pub(crate) fn discover_calls(&self) -> usize {
        self.state.lock().unwrap().discover_calls
    }
}

impl UsbBackend for FakeBackend {
    type Transport = FakeLogger;

    fn discover(&self) -> Result<Vec<FakeLogger>> {
        let mut state = self.state.lock().unwrap();
        state.discover_calls += 1;
        if state.fail_enumeration {
            return Err(Error::Transport("enumeration failed".to_string()));
        }
        Ok(state.loggers.clone())
    }

    fn count(&self) -> Result<usize> {
        let state = self.state.lock().unwrap();
        if state.fail_enumeration {
            return Err(Error::Transport("enumeration failed".to_string()));
        }
        Ok(state.loggers.len())
    }
}
