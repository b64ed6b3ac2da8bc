use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BackoffWindow, SimTime, StationId, TransmissionId};

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionStatus {
    Pending,
    InFlight,
    Collided,
    Backoff,
    Delivered,
    Failed,
    Cancelled,
}

impl TransmissionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TransmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InFlight => "inflight",
            Self::Collided => "collided",
            Self::Backoff => "backoff",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("transmission {id}: illegal transition {from} -> {to}")]
    Illegal {
        id: TransmissionId,
        from: TransmissionStatus,
        to: TransmissionStatus,
    },

    #[error("transmission {id} is in flight and cannot be cancelled")]
    InFlight { id: TransmissionId },
}

/// One frame on its way from `sender` to `receiver`.
///
/// Status changes only go through the transition methods below, so a
/// transmission that reached a terminal status can never be touched again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transmission {
    pub id: TransmissionId,
    pub sender: StationId,
    pub receiver: StationId,
    pub payload: String,
    pub created_at: SimTime,
    attempts: u32,
    status: TransmissionStatus,
    resume_at: Option<SimTime>,
    first_collision: Option<BackoffWindow>,
}

impl Transmission {
    pub fn new(
        id: TransmissionId,
        sender: StationId,
        receiver: StationId,
        payload: String,
        created_at: SimTime,
    ) -> Self {
        Self {
            id,
            sender,
            receiver,
            payload,
            created_at,
            attempts: 0,
            status: TransmissionStatus::Pending,
            resume_at: None,
            first_collision: None,
        }
    }

    pub fn status(&self) -> TransmissionStatus {
        self.status
    }

    /// Number of times this frame contended for the medium.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn resume_at(&self) -> Option<SimTime> {
        self.resume_at
    }

    /// Delays drawn when the very first attempt collided, if it did.
    pub fn first_collision(&self) -> Option<BackoffWindow> {
        self.first_collision
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn illegal(&self, to: TransmissionStatus) -> TransitionError {
        TransitionError::Illegal {
            id: self.id,
            from: self.status,
            to,
        }
    }

    /// Pending -> InFlight, counting the attempt.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        if self.status != TransmissionStatus::Pending {
            return Err(self.illegal(TransmissionStatus::InFlight));
        }
        self.attempts += 1;
        self.status = TransmissionStatus::InFlight;
        Ok(())
    }

    /// Pending or InFlight -> Collided. A pending frame collides on the
    /// attempt it was just offered for, so that attempt is counted here.
    pub fn collide(&mut self) -> Result<(), TransitionError> {
        match self.status {
            TransmissionStatus::Pending => self.attempts += 1,
            TransmissionStatus::InFlight => {}
            _ => return Err(self.illegal(TransmissionStatus::Collided)),
        }
        self.status = TransmissionStatus::Collided;
        Ok(())
    }

    /// Records the window of the first collision. Later collisions are ignored.
    pub fn note_window(&mut self, window: BackoffWindow) {
        if self.attempts == 1 && self.first_collision.is_none() {
            self.first_collision = Some(window);
        }
    }

    /// Collided -> Backoff until `resume_at`.
    pub fn back_off(&mut self, resume_at: SimTime) -> Result<(), TransitionError> {
        if self.status != TransmissionStatus::Collided {
            return Err(self.illegal(TransmissionStatus::Backoff));
        }
        self.status = TransmissionStatus::Backoff;
        self.resume_at = Some(resume_at);
        Ok(())
    }

    /// Backoff -> Pending.
    pub fn resume(&mut self) -> Result<(), TransitionError> {
        if self.status != TransmissionStatus::Backoff {
            return Err(self.illegal(TransmissionStatus::Pending));
        }
        self.status = TransmissionStatus::Pending;
        self.resume_at = None;
        Ok(())
    }

    /// InFlight -> Delivered.
    pub fn deliver(&mut self) -> Result<(), TransitionError> {
        if self.status != TransmissionStatus::InFlight {
            return Err(self.illegal(TransmissionStatus::Delivered));
        }
        self.status = TransmissionStatus::Delivered;
        Ok(())
    }

    /// Collided -> Failed, once the retry budget is spent.
    pub fn fail(&mut self) -> Result<(), TransitionError> {
        if self.status != TransmissionStatus::Collided {
            return Err(self.illegal(TransmissionStatus::Failed));
        }
        self.status = TransmissionStatus::Failed;
        self.resume_at = None;
        Ok(())
    }

    /// Pending or Backoff -> Cancelled. The bus has no mid-flight abort.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        match self.status {
            TransmissionStatus::Pending | TransmissionStatus::Backoff => {
                self.status = TransmissionStatus::Cancelled;
                self.resume_at = None;
                Ok(())
            }
            TransmissionStatus::InFlight => Err(TransitionError::InFlight { id: self.id }),
            _ => Err(self.illegal(TransmissionStatus::Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame() -> Transmission {
        Transmission::new(7, 1, 2, "hello".to_string(), Duration::ZERO)
    }

    #[test]
    fn test_clean_delivery() {
        let mut t = frame();
        t.start().unwrap();
        assert_eq!(t.status(), TransmissionStatus::InFlight);
        t.deliver().unwrap();
        assert_eq!(t.status(), TransmissionStatus::Delivered);
        assert_eq!(t.attempts(), 1);
        assert!(t.first_collision().is_none());
    }

    #[test]
    fn test_collision_cycle_counts_attempts() {
        let mut t = frame();
        t.collide().unwrap();
        assert_eq!(t.attempts(), 1);
        t.note_window(BackoffWindow {
            old_message: Duration::from_secs(1),
            new_message: Duration::from_secs(2),
        });
        t.back_off(Duration::from_secs(2)).unwrap();
        assert_eq!(t.resume_at(), Some(Duration::from_secs(2)));
        t.resume().unwrap();
        t.start().unwrap();
        t.collide().unwrap();
        assert_eq!(t.attempts(), 2);
        t.note_window(BackoffWindow {
            old_message: Duration::from_secs(9),
            new_message: Duration::from_secs(9),
        });
        assert_eq!(t.first_collision().unwrap().new_message, Duration::from_secs(2));
    }

    #[test]
    fn test_terminal_is_immutable() {
        let mut t = frame();
        t.start().unwrap();
        t.deliver().unwrap();
        assert!(t.start().is_err());
        assert!(t.collide().is_err());
        assert!(t.cancel().is_err());
        assert!(t.deliver().is_err());
        assert_eq!(t.status(), TransmissionStatus::Delivered);
    }

    #[test]
    fn test_cancel_rules() {
        let mut pending = frame();
        pending.cancel().unwrap();
        assert_eq!(pending.status(), TransmissionStatus::Cancelled);

        let mut flying = frame();
        flying.start().unwrap();
        assert_eq!(flying.cancel(), Err(TransitionError::InFlight { id: 7 }));
        assert_eq!(flying.status(), TransmissionStatus::InFlight);

        let mut waiting = frame();
        waiting.collide().unwrap();
        waiting.back_off(Duration::from_secs(1)).unwrap();
        waiting.cancel().unwrap();
        assert!(waiting.resume_at().is_none());
    }
}
