//! Endpoints that bridge the terminal side of the embedder: keystrokes in,
//! display and error output back, window-size changes as a signal, and the
//! synthetic `/dev/urandom` file.

#[allow(unused_imports)]
use {
    crate::error::{Errno, Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::endpoint::{Endpoint, FileIo, Reader, SignalSource, TargetCell, Writer};
use crate::host::{BusMessage, EmbedderBus};

/// Keystroke queue feeding descriptor 0. The embedder thread injects with
/// [`handle_input`](Keyboard::handle_input); the worker thread reads.
#[derive(Clone)]
pub struct Keyboard {
    inner: Arc<KeyboardInner>,
}

struct KeyboardInner {
    keypresses: Mutex<VecDeque<u8>>,
    target: TargetCell,
}

impl Keyboard {
    pub fn new() -> Keyboard {
        Keyboard {
            inner: Arc::new(KeyboardInner {
                keypresses: Mutex::new(VecDeque::new()),
                target: TargetCell::new(),
            }),
        }
    }

    pub fn handle_input(&self, input: &str) {
        if input.is_empty() {
            return;
        }
        {
            let mut keys = self.inner.keypresses.lock().unwrap();
            keys.extend(input.bytes());
        }
        self.inner.target.update_read(true);
    }
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIo for Keyboard {
    fn target(&self) -> &TargetCell {
        &self.inner.target
    }
}

impl Reader for Keyboard {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Errno> {
        let mut keys = self.inner.keypresses.lock().unwrap();
        let mut n = 0;
        for dst in buf.iter_mut() {
            match keys.pop_front() {
                Some(b) => {
                    *dst = b;
                    n += 1;
                }
                None => break,
            }
        }
        self.inner.target.update_read(!keys.is_empty());
        Ok(n)
    }
}

/// Descriptor 1: forwards terminal output to the embedder display.
pub struct Terminal {
    bus: Arc<dyn EmbedderBus>,
    target: TargetCell,
}

impl Terminal {
    pub fn new(bus: Arc<dyn EmbedderBus>) -> Terminal {
        Terminal { bus, target: TargetCell::new() }
    }
}

impl FileIo for Terminal {
    fn target(&self) -> &TargetCell {
        &self.target
    }
}

impl Writer for Terminal {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Errno> {
        self.bus
            .post(BusMessage::Display(String::from_utf8_lossy(buf).into_owned()));
        Ok(buf.len())
    }
}

/// Descriptor 2: forwards stderr to the embedder as error lines.
pub struct ErrorLog {
    bus: Arc<dyn EmbedderBus>,
    target: TargetCell,
}

impl ErrorLog {
    pub fn new(bus: Arc<dyn EmbedderBus>) -> ErrorLog {
        ErrorLog { bus, target: TargetCell::new() }
    }
}

impl FileIo for ErrorLog {
    fn target(&self) -> &TargetCell {
        &self.target
    }
}

impl Writer for ErrorLog {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Errno> {
        self.bus
            .post(BusMessage::Error(String::from_utf8_lossy(buf).into_owned()));
        Ok(buf.len())
    }
}

/// Window geometry changes delivered as a signal. The embedder thread
/// calls [`update`](WindowChange::update); the facade's `pselect` invokes
/// the handler on the worker thread.
#[derive(Clone)]
pub struct WindowChange {
    inner: Arc<WindowChangeInner>,
}

struct WindowChangeInner {
    // (width, height)
    size: Mutex<(u16, u16)>,
    handler: Mutex<Option<Box<dyn FnMut() + Send>>>,
    target: TargetCell,
}

impl WindowChange {
    pub fn new() -> WindowChange {
        WindowChange {
            inner: Arc::new(WindowChangeInner {
                size: Mutex::new((80, 24)),
                handler: Mutex::new(None),
                target: TargetCell::new(),
            }),
        }
    }

    /// Records the new geometry and raises the signal. Updates before a
    /// handler is installed only store the size; there is nobody to tell.
    pub fn update(&self, width: u16, height: u16) {
        *self.inner.size.lock().unwrap() = (width, height);
        if self.inner.handler.lock().unwrap().is_some() {
            self.inner.target.update_read(true);
        }
    }

    pub fn set_handler(&self, handler: Box<dyn FnMut() + Send>) {
        *self.inner.handler.lock().unwrap() = Some(handler);
    }

    pub fn size(&self) -> (u16, u16) {
        *self.inner.size.lock().unwrap()
    }
}

impl Default for WindowChange {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIo for WindowChange {
    fn target(&self) -> &TargetCell {
        &self.inner.target
    }
}

impl SignalSource for WindowChange {
    fn handle(&mut self) {
        let mut handler = self.inner.handler.lock().unwrap();
        if let Some(h) = handler.as_mut() {
            h();
            self.inner.target.update_read(false);
        }
    }
}

/// The synthetic `/dev/urandom` file.
pub struct DevUrandom {
    target: TargetCell,
}

impl DevUrandom {
    pub fn endpoint() -> Endpoint {
        Endpoint::RandomReader(Box::new(DevUrandom { target: TargetCell::new() }))
    }
}

impl FileIo for DevUrandom {
    fn target(&self) -> &TargetCell {
        &self.target
    }

    fn on_install(&self) {
        // Random bytes are always available.
        self.target.update_read(true);
    }
}

impl Reader for DevUrandom {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Errno> {
        getrandom::getrandom(buf).map_err(|_| Errno::EIO)?;
        Ok(buf.len())
    }
}
