use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TrySendError};

use crate::device::{Transport, TransportError};

/// A completion notification carrying the matching event's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// No notification arrived in time. The device may have dropped it.
    Timeout,
    /// The transport released its event callback; nothing will arrive.
    Closed,
    /// The cancellation flag was set while waiting.
    Cancelled,
}

/// Longest single blocking receive, so cancellation is noticed even when
/// waiting without a timeout.
const WAIT_SLICE: Duration = Duration::from_millis(250);

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "timed out waiting for completion event"),
            WaitError::Closed => write!(f, "completion event channel closed"),
            WaitError::Cancelled => write!(f, "cancelled while waiting for completion event"),
        }
    }
}

/// Receiving side of a completion subscription.
///
/// The slot holds at most one notification, which matches the protocol's
/// single outstanding trigger.
pub struct SignalHandle {
    rx: Receiver<Signal>,
}

/// Register `predicate` with the transport's event stream. Events for which
/// it returns true fill the handle's slot; everything else is ignored.
pub fn subscribe<T, P>(transport: &mut T, predicate: P) -> Result<SignalHandle, TransportError>
where
    T: Transport + ?Sized,
    P: Fn(&[u8]) -> bool + Send + 'static,
{
    let (tx, rx) = bounded::<Signal>(1);
    transport.subscribe_events(Box::new(move |payload: &[u8]| {
        if !predicate(payload) {
            return;
        }
        match tx.try_send(Signal {
            payload: payload.to_vec(),
        }) {
            Ok(()) => log::trace!("completion event queued"),
            Err(TrySendError::Full(_)) => {
                log::warn!("completion event arrived while one is still pending, dropped")
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }))?;
    Ok(SignalHandle { rx })
}

/// Matches events whose payload starts with `marker`.
pub fn marker_predicate(marker: [u8; 4]) -> impl Fn(&[u8]) -> bool + Send + 'static {
    move |payload: &[u8]| payload.starts_with(&marker)
}

impl SignalHandle {
    /// Block until a notification arrives, `timeout` passes or `cancel` is
    /// set. `None` waits until one of the other two happens.
    pub fn await_one(&self, timeout: Option<Duration>, cancel: &AtomicBool) -> Result<Signal, WaitError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(WaitError::Cancelled);
            }
            let slice = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()).min(WAIT_SLICE),
                None => WAIT_SLICE,
            };
            match self.rx.recv_timeout(slice) {
                Ok(signal) => return Ok(signal),
                Err(RecvTimeoutError::Disconnected) => return Err(WaitError::Closed),
                Err(RecvTimeoutError::Timeout) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(WaitError::Timeout);
                    }
                }
            }
        }
    }

    /// Discard notifications that arrived late, e.g. after a timeout, so
    /// the next trigger is paired with its own notification. Returns how
    /// many were dropped.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}
