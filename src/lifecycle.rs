//! Lifecycle state machine for a guest surface
//!
//! ```text
//! Uninitialized --mount--> Mounted --ready-signal--> Ready --render-data--> Active
//!        \___________________\_________________________\__________________\--> Disposed
//! ```
//!
//! Host -> guest messages sent before `Ready` are queued in order and
//! released exactly once when the guest signals readiness.

use std::collections::VecDeque;
use std::fmt;

use serde_json::Value;

use crate::envelope::{Envelope, Message};
use crate::error::{Error, Result};

/// Readiness stage of the guest surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Mounted,
    Ready,
    Active,
    Disposed,
}

impl Phase {
    /// Whether outbound data may be transmitted directly
    pub fn is_ready(&self) -> bool {
        matches!(self, Phase::Ready | Phase::Active)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Mounted => "mounted",
            Phase::Ready => "ready",
            Phase::Active => "active",
            Phase::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Outcome of passing a host message through the lifecycle gate
#[derive(Debug, PartialEq)]
pub enum Outbound {
    /// Transmit now
    Deliver(Envelope),
    /// Held until the guest is ready
    Buffered,
}

#[derive(Debug)]
pub struct Lifecycle {
    phase: Phase,
    buffer: VecDeque<Envelope>,
    capacity: usize,
    render_data: Option<Value>,
}

impl Lifecycle {
    /// Create a lifecycle holding at most `capacity` messages before ready
    pub fn new(capacity: usize) -> Self {
        Self {
            phase: Phase::Uninitialized,
            buffer: VecDeque::new(),
            capacity,
            render_data: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of messages waiting for the guest
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Most recent render data sent (or queued) for the guest
    pub fn latest_render_data(&self) -> Option<&Value> {
        self.render_data.as_ref()
    }

    pub fn mount(&mut self) -> Result<()> {
        match self.phase {
            Phase::Uninitialized => {
                self.transition(Phase::Mounted);
                Ok(())
            }
            Phase::Disposed => Err(Error::Disposed),
            from => Err(Error::InvalidTransition {
                from,
                to: Phase::Mounted,
            }),
        }
    }

    /// Handle the guest's ready signal.
    ///
    /// Returns the queued messages in send order on the first signal and
    /// `None` when the guest was already ready.
    pub fn mark_ready(&mut self) -> Result<Option<Vec<Envelope>>> {
        match self.phase {
            Phase::Mounted => {
                self.transition(Phase::Ready);
                let flushed: Vec<Envelope> = self.buffer.drain(..).collect();
                if flushed
                    .iter()
                    .any(|e| matches!(e.message, Message::RenderData(_)))
                {
                    self.transition(Phase::Active);
                }
                Ok(Some(flushed))
            }
            Phase::Ready | Phase::Active => Ok(None),
            Phase::Uninitialized => Err(Error::NotMounted),
            Phase::Disposed => Err(Error::Disposed),
        }
    }

    /// Record that render data reached the guest
    pub fn mark_active(&mut self) -> Result<()> {
        match self.phase {
            Phase::Ready => {
                self.transition(Phase::Active);
                Ok(())
            }
            Phase::Active => Ok(()),
            Phase::Uninitialized => Err(Error::NotMounted),
            Phase::Disposed => Err(Error::Disposed),
            from => Err(Error::InvalidTransition {
                from,
                to: Phase::Active,
            }),
        }
    }

    /// Move to `Disposed`. Returns `true` only on the first call.
    pub fn dispose(&mut self) -> bool {
        if self.phase == Phase::Disposed {
            return false;
        }
        self.transition(Phase::Disposed);
        self.buffer.clear();
        true
    }

    /// Fail fast unless the session is mounted and not disposed
    pub fn ensure_live(&self) -> Result<()> {
        match self.phase {
            Phase::Uninitialized => Err(Error::NotMounted),
            Phase::Disposed => Err(Error::Disposed),
            _ => Ok(()),
        }
    }

    /// Whether guest messages should be processed
    pub fn accepts_inbound(&self) -> bool {
        matches!(self.phase, Phase::Mounted | Phase::Ready | Phase::Active)
    }

    /// Pass a host -> guest message through the readiness gate
    pub fn gate(&mut self, envelope: Envelope) -> Result<Outbound> {
        self.ensure_live()?;

        let is_render = if let Message::RenderData(data) = &envelope.message {
            self.render_data = Some(data.clone());
            true
        } else {
            false
        };

        if self.phase.is_ready() {
            if is_render {
                self.mark_active()?;
            }
            return Ok(Outbound::Deliver(envelope));
        }

        if self.buffer.len() >= self.capacity {
            return Err(Error::BufferFull(self.buffer.len()));
        }
        self.buffer.push_back(envelope);
        Ok(Outbound::Buffered)
    }

    fn transition(&mut self, to: Phase) {
        tracing::debug!(from = %self.phase, to = %to, "lifecycle transition");
        self.phase = to;
    }
}
