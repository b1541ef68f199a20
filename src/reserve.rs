//! Exclusive device access arbitration with peer audio servers.
//!
//! The transport (the session bus in a desktop deployment) lives outside
//! this crate; what the engine relies on is the contract: at most one
//! holder per reservation name, release requests are delivered to the
//! holder, and the holder answers OK after suspending or CANCEL to keep
//! the device. The reservation is dropped while the source is suspended
//! and re-acquired on resume.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors raised by the reservation subsystem.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReserveError {
    /// The name is already held and the holder refused to yield.
    #[error("device reservation {0} is held by another application")]
    Busy(String),
}

/// The holder's answer to a release request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    /// The holder yielded the device.
    Ok,
    /// The holder could not suspend; the requester must back off.
    Cancel,
}

/// A pending request from a peer to give up the device.
pub struct ReleaseRequest {
    forced: bool,
    reply: Sender<HookResult>,
}

impl ReleaseRequest {
    /// Whether the peer will take the device regardless of the answer.
    pub fn forced(&self) -> bool {
        self.forced
    }

    /// Answer the request.
    pub fn respond(self, result: HookResult) {
        let _ = self.reply.send(result);
    }
}

/// A held reservation.
///
/// Dropping the handle releases the name.
pub trait Reservation: Send {
    /// Poll for a pending release request from a peer.
    fn try_recv_release(&mut self) -> Option<ReleaseRequest>;
}

/// Acquires reservations by name.
pub trait ReserveManager {
    /// Acquire `name`, failing when a peer holds it.
    fn acquire(&self, name: &str) -> Result<Box<dyn Reservation>, ReserveError>;
}

/// Derive the reservation name for an ALSA device string.
///
/// Physical devices reserve `Audio<card>`; pseudo devices that do not pin
/// hardware reserve nothing.
///
/// # Examples
///
/// ```
/// use alsa_capture::reserve::reserve_name;
///
/// assert_eq!(reserve_name("hw:0,1").as_deref(), Some("Audio0"));
/// assert_eq!(reserve_name("plughw:2"), Some("Audio2".to_owned()));
/// assert_eq!(reserve_name("default"), None);
/// ```
pub fn reserve_name(device: &str) -> Option<String> {
    if device == "default" || device == "null" {
        return None;
    }

    // "hw:0,1" pins card 0; named cards ("hw:SB") reserve under the name.
    let card = match device.split_once(':') {
        Some((_, rest)) => rest.split(',').next().unwrap_or(rest),
        None => device,
    };

    if card.is_empty() {
        return None;
    }

    Some(format!("Audio{}", card))
}

type Registry = Arc<Mutex<HashMap<String, Holder>>>;

struct Holder {
    token: u64,
    tx: Sender<ReleaseRequest>,
}

/// An in-process reservation registry.
///
/// Implements the full contract within one process; used by the tests and
/// by embedders that do not talk to a session bus.
#[derive(Default, Clone)]
pub struct LocalReserveManager {
    registry: Registry,
    next_token: Arc<Mutex<u64>>,
}

impl LocalReserveManager {
    /// Construct an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the current holder of `name` to yield.
    ///
    /// Returns the channel the answer arrives on, or `None` when the name
    /// is free (or the holder is gone), in which case [ReserveManager::acquire]
    /// can be retried directly.
    pub fn request_release(&self, name: &str, forced: bool) -> Option<Receiver<HookResult>> {
        let registry = self.registry.lock().ok()?;
        let holder = registry.get(name)?;

        let (reply, rx) = channel();
        holder.tx.send(ReleaseRequest { forced, reply }).ok()?;
        Some(rx)
    }
}

impl ReserveManager for LocalReserveManager {
    fn acquire(&self, name: &str) -> Result<Box<dyn Reservation>, ReserveError> {
        let mut registry = match self.registry.lock() {
            Ok(r) => r,
            Err(_) => return Err(ReserveError::Busy(name.to_owned())),
        };

        if registry.contains_key(name) {
            return Err(ReserveError::Busy(name.to_owned()));
        }

        let token = {
            let mut t = match self.next_token.lock() {
                Ok(t) => t,
                Err(_) => return Err(ReserveError::Busy(name.to_owned())),
            };
            *t += 1;
            *t
        };

        let (tx, rx) = channel();
        registry.insert(name.to_owned(), Holder { token, tx });

        tracing::debug!(name, "reservation acquired");

        Ok(Box::new(LocalReservation {
            registry: self.registry.clone(),
            name: name.to_owned(),
            token,
            rx,
        }))
    }
}

struct LocalReservation {
    registry: Registry,
    name: String,
    token: u64,
    rx: Receiver<ReleaseRequest>,
}

impl Reservation for LocalReservation {
    fn try_recv_release(&mut self) -> Option<ReleaseRequest> {
        self.rx.try_recv().ok()
    }
}

impl Drop for LocalReservation {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            // Only remove the entry if we are still the holder.
            if registry.get(&self.name).map(|h| h.token) == Some(self.token) {
                registry.remove(&self.name);
                tracing::debug!(name = %self.name, "reservation released");
            }
        }
    }
}
