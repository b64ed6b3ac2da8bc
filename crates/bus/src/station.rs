use std::collections::VecDeque;

use ethersim_core::{SimTime, StationId, TransitionError, Transmission, TransmissionId, TransmissionStatus};

use crate::BusError;

/// One endpoint on the bus.
///
/// A station works on at most one frame at a time (`current`); everything
/// else waits in its FIFO queue.
#[derive(Debug)]
pub struct Station {
    id: StationId,
    queue: VecDeque<Transmission>,
    current: Option<Transmission>,
    backoff_counter: u32,
    deferring: bool,
}

impl Station {
    pub fn new(id: StationId) -> Self {
        Self {
            id,
            queue: VecDeque::new(),
            current: None,
            backoff_counter: 0,
            deferring: false,
        }
    }

    pub fn id(&self) -> StationId {
        self.id
    }

    /// Collisions suffered by the current frame.
    pub fn backoff_counter(&self) -> u32 {
        self.backoff_counter
    }

    pub fn current(&self) -> Option<&Transmission> {
        self.current.as_ref()
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut Transmission> {
        self.current.as_mut()
    }

    pub fn queue(&self) -> impl Iterator<Item = &Transmission> {
        self.queue.iter()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    pub fn has_work(&self) -> bool {
        self.current.is_some() || !self.queue.is_empty()
    }

    /// Validates and queues a new frame addressed to `receiver`.
    pub fn enqueue(
        &mut self,
        id: TransmissionId,
        msg: &str,
        receiver: i64,
        station_count: u32,
        mtu: usize,
        now: SimTime,
    ) -> Result<&Transmission, BusError> {
        let payload = msg.trim();
        if payload.is_empty() {
            return Err(BusError::EmptyMessage);
        }
        if receiver == self.id as i64 || receiver < 1 || receiver > station_count as i64 {
            return Err(BusError::InvalidReceiver {
                sender: self.id,
                receiver,
            });
        }
        if payload.len() > mtu {
            return Err(BusError::PayloadTooLarge {
                len: payload.len(),
                mtu,
            });
        }

        let t = Transmission::new(id, self.id, receiver as StationId, payload.to_string(), now);
        self.queue.push_back(t);
        Ok(&self.queue[self.queue.len() - 1])
    }

    /// Promotes the queue head when the station is idle. Returns the id of
    /// the frame that becomes current.
    pub fn tick(&mut self) -> Option<TransmissionId> {
        if self.current.is_some() {
            return None;
        }
        let next = self.queue.pop_front()?;
        let id = next.id;
        self.current = Some(next);
        self.backoff_counter = 0;
        self.deferring = false;
        Some(id)
    }

    /// The current frame, if it wants the bus right now.
    pub fn offer(&self) -> Option<&Transmission> {
        self.current
            .as_ref()
            .filter(|t| t.status() == TransmissionStatus::Pending)
    }

    pub(crate) fn note_collision(&mut self) {
        self.backoff_counter += 1;
        self.deferring = false;
    }

    /// Marks a deferral; true when this starts a new deferral episode.
    pub(crate) fn note_deferral(&mut self) -> bool {
        !std::mem::replace(&mut self.deferring, true)
    }

    pub(crate) fn clear_deferral(&mut self) {
        self.deferring = false;
    }

    /// Takes the current frame once it is terminal.
    pub(crate) fn finish(&mut self) -> Option<Transmission> {
        if !self.current.as_ref().is_some_and(|t| t.is_terminal()) {
            return None;
        }
        let done = self.current.take();
        if done.as_ref().is_some_and(|t| t.status() == TransmissionStatus::Delivered) {
            self.backoff_counter = 0;
        }
        self.deferring = false;
        done
    }

    /// Cancels a frame that has not reached the wire.
    pub(crate) fn cancel(&mut self, id: TransmissionId) -> Result<Option<Transmission>, BusError> {
        if let Some(pos) = self.queue.iter().position(|t| t.id == id) {
            let Some(mut t) = self.queue.remove(pos) else {
                return Ok(None);
            };
            t.cancel()?;
            return Ok(Some(t));
        }
        match self.current.as_mut() {
            Some(t) if t.id == id => {
                t.cancel().map_err(|e| match e {
                    TransitionError::InFlight { id } => BusError::CancelInFlight(id),
                    other => BusError::Transition(other),
                })?;
                Ok(self.finish())
            }
            _ => Ok(None),
        }
    }
}
