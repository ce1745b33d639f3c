use crate::protocol::Frame;
use crate::subsystems::DriverError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const LOOPBACK_CAPACITY: usize = 1024;

/// Frame transport to the vehicle bus.
pub trait BusTransport: Send {
    fn send(&mut self, frame: &Frame) -> Result<(), DriverError>;
    /// Next inbound frame, or `None` when nothing is pending.
    fn receive(&mut self) -> Result<Option<Frame>, DriverError>;
}

#[derive(Debug, Default)]
struct LoopbackState {
    inbound: VecDeque<Frame>,
    sent: VecDeque<Frame>,
    connected: bool,
}

/// In-memory transport. Clones share the same queues, so one handle can be
/// given to the scheduler while another injects frames and inspects output.
#[derive(Debug, Clone)]
pub struct LoopbackBus {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState {
                connected: true,
                ..LoopbackState::default()
            })),
        }
    }

    /// Queue a frame for the next `receive`. Oldest frames are dropped at capacity.
    pub fn inject(&self, frame: Frame) {
        if let Ok(mut state) = self.state.lock() {
            if state.inbound.len() >= LOOPBACK_CAPACITY {
                state.inbound.pop_front();
            }
            state.inbound.push_back(frame);
        }
    }

    /// Drain every frame sent so far.
    pub fn take_sent(&self) -> Vec<Frame> {
        self.state
            .lock()
            .map(|mut state| state.sent.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn set_connected(&self, connected: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.connected = connected;
        }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusTransport for LoopbackBus {
    fn send(&mut self, frame: &Frame) -> Result<(), DriverError> {
        let mut state = self.state.lock().map_err(|_| DriverError::Poisoned)?;
        if !state.connected {
            return Err(DriverError::Disconnected);
        }
        if state.sent.len() >= LOOPBACK_CAPACITY {
            state.sent.pop_front();
        }
        state.sent.push_back(frame.clone());
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Frame>, DriverError> {
        let mut state = self.state.lock().map_err(|_| DriverError::Poisoned)?;
        if !state.connected {
            return Err(DriverError::Disconnected);
        }
        Ok(state.inbound.pop_front())
    }
}
