//! Buffered byte-stream receive path shared by TCP and named local
//! sockets.
//!
//! The transport side appends with [`StreamCore::add_data`] from whichever
//! thread its completions run on; the application side consumes with
//! [`StreamCore::receive`]. The blocking wait, if any, happens in the
//! facade before `receive` is called.

#[allow(unused_imports)]
use {
    crate::error::{Errno, Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::endpoint::TargetCell;
use crate::posix::{MSG_DONTWAIT, MSG_PEEK};

pub struct StreamCore {
    buffer: Mutex<VecDeque<u8>>,
    conn_errno: Mutex<Option<Errno>>,
    target: TargetCell,
}

impl StreamCore {
    pub fn new() -> Arc<StreamCore> {
        Arc::new(StreamCore {
            buffer: Mutex::new(VecDeque::new()),
            conn_errno: Mutex::new(None),
            target: TargetCell::new(),
        })
    }

    pub fn target(&self) -> &TargetCell {
        &self.target
    }

    /// Records an asynchronous connection failure. Subsequent receives
    /// fail with `ECONNABORTED`; the stored code answers `SO_ERROR`.
    pub fn set_conn_errno(&self, errno: Errno) {
        *self.conn_errno.lock().unwrap() = Some(errno);
    }

    pub fn conn_errno(&self) -> Option<Errno> {
        *self.conn_errno.lock().unwrap()
    }

    /// Appends received bytes. Safe to call from a thread other than the
    /// consumer's; raises the read-ready edge.
    pub fn add_data(&self, buf: &[u8]) {
        {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.extend(buf.iter().copied());
        }
        self.target.update_read(true);
    }

    /// Non-blocking receive. `MSG_PEEK` copies without consuming; other
    /// unrecognized flags are logged and ignored.
    pub fn receive(&self, buf: &mut [u8], flags: i32) -> Result<usize, Errno> {
        let peek = flags & MSG_PEEK != 0;
        let rest = flags & !(MSG_PEEK | MSG_DONTWAIT);
        if rest != 0 {
            warn!("stream receive: unsupported flags {rest:#x}");
        }

        if self.conn_errno().is_some() {
            return Err(Errno::ECONNABORTED);
        }

        let mut buffer = self.buffer.lock().unwrap();
        if buffer.is_empty() {
            return Err(Errno::EWOULDBLOCK);
        }

        let count = buf.len().min(buffer.len());
        if peek {
            for (dst, src) in buf.iter_mut().zip(buffer.iter()) {
                *dst = *src;
            }
        } else {
            for dst in buf.iter_mut().take(count) {
                *dst = buffer.pop_front().unwrap();
            }
            // Re-evaluated under the buffer lock, so a concurrent producer
            // cannot leave unread bytes behind a lowered flag.
            self.target.update_read(!buffer.is_empty());
        }
        Ok(count)
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }
}
