use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Up,
    Down,
}

/// Serial-session liveness tracker.
///
/// Starts `Disconnected`; comes up on the first valid frame and goes down
/// again after `silence_timeout` without one, or on a hard transport error.
/// Each transition is reported exactly once. Time is injected so the state
/// machine is testable without a device.
#[derive(Debug)]
pub struct LinkMonitor {
    status: LinkStatus,
    silence_timeout: Duration,
    last_activity_at: Option<Instant>,
}

impl LinkMonitor {
    pub fn new(silence_timeout: Duration) -> Self {
        Self {
            status: LinkStatus::Disconnected,
            silence_timeout,
            last_activity_at: None,
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    /// A valid frame arrived.
    pub fn on_frame(&mut self, now: Instant) -> Option<LinkEvent> {
        self.last_activity_at = Some(now);
        match self.status {
            LinkStatus::Disconnected => {
                self.status = LinkStatus::Connected;
                Some(LinkEvent::Up)
            }
            LinkStatus::Connected => None,
        }
    }

    /// Periodic tick. Reports `Down` once when the silence window elapses.
    pub fn check_silence(&mut self, now: Instant) -> Option<LinkEvent> {
        if self.status == LinkStatus::Connected {
            if let Some(last) = self.last_activity_at {
                if now.duration_since(last) > self.silence_timeout {
                    self.status = LinkStatus::Disconnected;
                    return Some(LinkEvent::Down);
                }
            }
        }
        None
    }

    /// The transport reported a hard error (not a timeout).
    pub fn on_transport_error(&mut self) -> Option<LinkEvent> {
        match self.status {
            LinkStatus::Connected => {
                self.status = LinkStatus::Disconnected;
                Some(LinkEvent::Down)
            }
            LinkStatus::Disconnected => None,
        }
    }
}
