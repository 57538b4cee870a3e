//! Connection state machine and reconnect backoff

use std::time::Duration;

use decoynet_settings::ReconnectSettings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; reached only through [`ConnectionEvent::Stop`]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection attempt begins
    Attempt,
    /// The Command stream is open
    Established,
    /// Dial, registration, send or receive failed
    Failed,
    Stop,
}

/// Pure transition function. Events that do not apply to the current
/// state leave it unchanged.
pub fn transition(state: ConnectionState, event: ConnectionEvent) -> ConnectionState {
    use ConnectionEvent::*;
    use ConnectionState::*;

    match (state, event) {
        (Stopped, _) => Stopped,
        (_, Stop) => Stopped,
        (Disconnected, Attempt) => Connecting,
        (Connecting, Established) => Connected,
        (Connecting, Failed) | (Connected, Failed) => Disconnected,
        (state, _) => state,
    }
}

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    floor: Duration,
    ceiling: Duration,
    multiplier: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2)
    }
}

impl From<&ReconnectSettings> for Backoff {
    fn from(settings: &ReconnectSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.floor_secs),
            Duration::from_secs(settings.ceiling_secs),
            settings.multiplier,
        )
    }
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration, multiplier: u32) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            current: floor,
            floor,
            ceiling,
            multiplier: multiplier.max(1),
        }
    }

    /// Delay before the next attempt
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Take the delay for this failure and grow the next one
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(self.multiplier)
            .unwrap_or(self.ceiling)
            .min(self.ceiling);
        delay
    }

    pub fn on_success(&mut self) {
        self.current = self.floor;
    }
}

/// Connection state plus backoff, one per connection manager
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    state: ConnectionState,
    backoff: Backoff,
}

impl ReconnectState {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Apply an event. Returns the reconnect delay when the event schedules
    /// a retry.
    pub fn apply(&mut self, event: ConnectionEvent) -> Option<Duration> {
        let previous = self.state;
        self.state = transition(previous, event);

        match (previous, self.state) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                self.backoff.on_success();
                None
            }
            (ConnectionState::Connecting | ConnectionState::Connected, ConnectionState::Disconnected) => {
                Some(self.backoff.on_failure())
            }
            _ => None,
        }
    }
}
