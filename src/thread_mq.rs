//! Asynchronous message passing between the main thread and the I/O thread.
//!
//! Two FIFO queues: `inq` carries control messages towards the I/O thread
//! and signals an eventfd so the realtime poll wakes up; `outq` carries
//! engine notifications back. Synchronous requests carry a reply sender.
//!
//! On a fatal engine error the I/O thread posts
//! [EngineMessage::UnloadModule] and parks in [IoMq::wait_for_shutdown],
//! draining (and failing) whatever the main thread still sends until the
//! shutdown message arrives. Nothing is ever dropped unanswered.

use crate::libc as c;
use crate::source::SourceState;
use crate::unix::poll::{PollFd, PollFlags};
use crate::unix::Errno;
use crate::{Error, Result};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

/// Control messages processed by the I/O thread.
pub enum ControlMessage {
    /// Move the source to a new state; replies once the transition is done.
    SetState {
        /// The target state.
        state: SourceState,
        /// Transition outcome.
        reply: Sender<Result<()>>,
    },
    /// Query the current source latency.
    GetLatency {
        /// Smoothed latency in microseconds; 0 while suspended.
        reply: Sender<u64>,
    },
    /// Query the dynamic latency range.
    GetLatencyRange {
        /// `(min, max)` in microseconds.
        reply: Sender<(u64, u64)>,
    },
    /// Query the engine's timing snapshot.
    GetTimingInfo {
        /// The current snapshot.
        reply: Sender<crate::capture::TimingInfo>,
    },
    /// The requested end-to-end latency changed; re-derive the watermarks.
    SetRequestedLatency(Option<u64>),
    /// Stop the I/O thread.
    Shutdown,
}

/// Notifications posted by the I/O thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMessage {
    /// The engine hit a fatal error; the owner should tear the source down.
    UnloadModule,
}

/// Helper wrapper around an eventfd.
#[derive(Debug)]
pub(crate) struct EventFd {
    fd: c::c_int,
}

impl EventFd {
    fn new() -> Result<Self, Errno> {
        unsafe {
            Ok(Self {
                fd: errno!(c::eventfd(0, c::EFD_NONBLOCK))?,
            })
        }
    }

    /// Add the given number to the eventfd.
    fn send(&self, v: u64) -> Result<(), Errno> {
        unsafe {
            let n = v.to_ne_bytes();
            errno!(c::write(self.fd, n.as_ptr() as *const c::c_void, 8) as i32)?;
            Ok(())
        }
    }

    /// Drain the counter. Non-blocking; returns quietly when already empty.
    fn drain(&self) {
        unsafe {
            let mut bytes = [0u8; 8];
            let _ = c::read(self.fd, bytes.as_mut_ptr() as *mut c::c_void, 8);
        }
    }

    fn pollfd(&self) -> PollFd {
        PollFd::new(self.fd, PollFlags::POLLIN)
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.fd);
        }
    }
}

/// Construct the two queue endpoints.
pub fn thread_mq() -> Result<(MainMq, IoMq), Errno> {
    let wake = Arc::new(EventFd::new()?);
    let (in_tx, in_rx) = channel();
    let (out_tx, out_rx) = channel();

    Ok((
        MainMq {
            tx: in_tx,
            wake: wake.clone(),
            outq: out_rx,
        },
        IoMq {
            rx: in_rx,
            wake,
            tx: out_tx,
        },
    ))
}

/// The main thread's endpoint.
pub struct MainMq {
    tx: Sender<ControlMessage>,
    wake: Arc<EventFd>,
    outq: Receiver<EngineMessage>,
}

impl MainMq {
    /// Post a control message and wake the I/O thread.
    pub fn post(&self, msg: ControlMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::ThreadGone)?;

        if let Err(e) = self.wake.send(1) {
            tracing::error!("failed to signal the I/O thread: {}", e);
        }

        Ok(())
    }

    /// Pop a pending engine notification, if any.
    pub fn try_recv(&self) -> Option<EngineMessage> {
        self.outq.try_recv().ok()
    }
}

/// The I/O thread's endpoint.
pub struct IoMq {
    rx: Receiver<ControlMessage>,
    wake: Arc<EventFd>,
    tx: Sender<EngineMessage>,
}

impl IoMq {
    /// The descriptor to register with the realtime poll.
    pub fn pollfd(&self) -> PollFd {
        self.wake.pollfd()
    }

    /// Pop the next pending control message.
    pub fn try_recv(&self) -> Option<ControlMessage> {
        self.wake.drain();
        self.rx.try_recv().ok()
    }

    /// Post a notification to the main thread.
    pub fn post(&self, msg: EngineMessage) {
        if self.tx.send(msg).is_err() {
            tracing::warn!("main thread is gone, dropping engine message");
        }
    }

    /// Park until [ControlMessage::Shutdown] arrives, answering everything
    /// else with an error so no sender is left hanging.
    pub fn wait_for_shutdown(&self) {
        loop {
            match self.rx.recv() {
                Ok(ControlMessage::Shutdown) | Err(_) => return,
                Ok(ControlMessage::SetState { reply, .. }) => {
                    let _ = reply.send(Err(Error::ThreadGone));
                }
                Ok(ControlMessage::GetLatency { reply }) => {
                    let _ = reply.send(0);
                }
                Ok(ControlMessage::GetLatencyRange { reply }) => {
                    let _ = reply.send((0, 0));
                }
                // Dropping the reply is answer enough; the requester sees
                // a disconnect instead of hanging.
                Ok(ControlMessage::GetTimingInfo { .. }) => {}
                Ok(ControlMessage::SetRequestedLatency(_)) => {}
            }
        }
    }
}
