//! Socket-free connection lifecycle and backoff.
//!
//! [`ConnectionMachine`] consumes named [`ConnectionEvent`]s and answers with
//! the [`ConnectionAction`]s the transport driver must perform. It never
//! touches a socket or a timer itself, which keeps the reconnect policy
//! testable without a network.
//!
//! ```text
//!            OpenRequested             Connected
//!   Idle ─────────────────▶ Connecting ─────────▶ Open
//!                             ▲    │                │
//!             RetryTimerFired │    │ ConnectFailed  │ Disconnected
//!                             │    ▼                ▼
//!                         Reconnecting ◀────────────┘
//!                             │
//!                             │ attempts == max
//!                             ▼
//!                     Closed(Exhausted)
//! ```
//!
//! `CloseRequested` moves any state to `Closed(Explicit)`.

use std::time::Duration;

use medbot_types::{CloseReason, ConnectionState};

/// Backoff parameters for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect; doubled for every later attempt.
    pub base_interval: Duration,
    /// Number of reconnects attempted before giving up.
    pub max_attempts: u32,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(base_interval: Duration, max_attempts: u32) -> Self {
        Self {
            base_interval,
            max_attempts,
            ..Self::default()
        }
    }

    /// Builder-style override of [`max_delay`](Self::max_delay).
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before the reconnect that follows `attempts` earlier reconnects:
    /// `base × 2^attempts`, capped at `max_delay`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_interval
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(500),
            max_attempts: 5,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Things that happen to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    OpenRequested,
    Connected,
    ConnectFailed,
    Disconnected,
    RetryTimerFired,
    CloseRequested,
}

/// Work the driver must perform in response to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    Connect,
    ScheduleReconnect(Duration),
    CancelReconnect,
    FlushQueue,
    CloseSocket,
    /// Abandon an in-flight connect attempt.
    AbortConnect,
}

/// Explicit `Idle → Connecting → Open → Closed` lifecycle with backoff.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Idle,
            attempts: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Reconnects scheduled since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Advance the machine by one event.
    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<ConnectionAction> {
        use ConnectionAction as A;
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (event, self.state.clone()) {
            // Opening an active connection is a no-op.
            (E::OpenRequested, s) if s.is_active() => vec![],
            (E::OpenRequested, _) => {
                self.attempts = 0;
                self.state = S::Connecting;
                vec![A::Connect]
            }

            (E::Connected, S::Connecting) => {
                self.attempts = 0;
                self.state = S::Open;
                vec![A::FlushQueue]
            }
            // A connect that resolves after an explicit close is discarded.
            (E::Connected, _) => vec![A::CloseSocket],

            (E::ConnectFailed, S::Connecting) | (E::Disconnected, S::Open) => self.on_failure(),
            (E::ConnectFailed | E::Disconnected, _) => vec![],

            (E::RetryTimerFired, S::Reconnecting { .. }) => {
                self.state = S::Connecting;
                vec![A::Connect]
            }
            (E::RetryTimerFired, _) => vec![],

            (E::CloseRequested, S::Closed(CloseReason::Explicit)) => vec![],
            (E::CloseRequested, previous) => {
                let actions = match previous {
                    S::Reconnecting { .. } => vec![A::CancelReconnect],
                    S::Connecting => vec![A::AbortConnect],
                    S::Open => vec![A::CloseSocket],
                    _ => vec![],
                };
                self.state = S::Closed(CloseReason::Explicit);
                actions
            }
        }
    }

    fn on_failure(&mut self) -> Vec<ConnectionAction> {
        if self.attempts < self.policy.max_attempts {
            let delay = self.policy.delay_for(self.attempts);
            self.attempts += 1;
            self.state = ConnectionState::Reconnecting {
                attempt: self.attempts,
                delay,
            };
            vec![ConnectionAction::ScheduleReconnect(delay)]
        } else {
            self.state = ConnectionState::Closed(CloseReason::Exhausted {
                attempts: self.attempts,
            });
            vec![]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionAction as A;
    use ConnectionEvent as E;

    fn policy(base_ms: u64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_millis(base_ms), max_attempts)
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let p = policy(100, 10);
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(400));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped_and_never_overflows() {
        let p = policy(100, 100).with_max_delay(Duration::from_secs(5));
        assert_eq!(p.delay_for(10), Duration::from_secs(5));
        assert_eq!(p.delay_for(40), Duration::from_secs(5));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn open_is_idempotent_while_active() {
        let mut m = ConnectionMachine::new(policy(10, 3));
        assert_eq!(m.handle(E::OpenRequested), vec![A::Connect]);
        assert_eq!(m.handle(E::OpenRequested), vec![]);

        m.handle(E::Connected);
        assert_eq!(m.state(), &ConnectionState::Open);
        assert_eq!(m.handle(E::OpenRequested), vec![]);
    }

    #[test]
    fn successful_open_flushes_queue() {
        let mut m = ConnectionMachine::new(policy(10, 3));
        m.handle(E::OpenRequested);
        assert_eq!(m.handle(E::Connected), vec![A::FlushQueue]);
    }

    #[test]
    fn attempt_k_waits_base_times_two_to_the_k_minus_one() {
        let base = 50;
        let mut m = ConnectionMachine::new(policy(base, 4));
        m.handle(E::OpenRequested);

        for k in 1..=4u32 {
            let actions = m.handle(E::ConnectFailed);
            let expected = Duration::from_millis(base * 2u64.pow(k - 1));
            assert_eq!(actions, vec![A::ScheduleReconnect(expected)], "attempt {k}");
            assert_eq!(
                m.state(),
                &ConnectionState::Reconnecting { attempt: k, delay: expected }
            );
            assert_eq!(m.handle(E::RetryTimerFired), vec![A::Connect]);
        }

        // Fifth failure: the ceiling is reached and nothing more is scheduled.
        assert_eq!(m.handle(E::ConnectFailed), vec![]);
        assert_eq!(
            m.state(),
            &ConnectionState::Closed(CloseReason::Exhausted { attempts: 4 })
        );
        assert_eq!(m.handle(E::RetryTimerFired), vec![]);
    }

    #[test]
    fn zero_max_attempts_never_reconnects() {
        let mut m = ConnectionMachine::new(policy(10, 0));
        m.handle(E::OpenRequested);
        assert_eq!(m.handle(E::ConnectFailed), vec![]);
        assert!(m.state().is_exhausted());
    }

    #[test]
    fn successful_open_resets_attempt_counter() {
        let mut m = ConnectionMachine::new(policy(10, 5));
        m.handle(E::OpenRequested);
        m.handle(E::ConnectFailed);
        m.handle(E::RetryTimerFired);
        m.handle(E::ConnectFailed);
        assert_eq!(m.attempts(), 2);

        m.handle(E::RetryTimerFired);
        m.handle(E::Connected);
        assert_eq!(m.attempts(), 0);

        // The next drop starts again from the base interval.
        assert_eq!(
            m.handle(E::Disconnected),
            vec![A::ScheduleReconnect(Duration::from_millis(10))]
        );
    }

    #[test]
    fn close_cancels_pending_reconnect_and_stays_closed() {
        let mut m = ConnectionMachine::new(policy(10, 5));
        m.handle(E::OpenRequested);
        m.handle(E::ConnectFailed);

        assert_eq!(m.handle(E::CloseRequested), vec![A::CancelReconnect]);
        assert_eq!(m.state(), &ConnectionState::Closed(CloseReason::Explicit));

        // Late events after an explicit close never schedule anything.
        assert_eq!(m.handle(E::RetryTimerFired), vec![]);
        assert_eq!(m.handle(E::Disconnected), vec![]);
        assert_eq!(m.handle(E::Connected), vec![A::CloseSocket]);
    }

    #[test]
    fn close_while_open_closes_socket() {
        let mut m = ConnectionMachine::new(policy(10, 5));
        m.handle(E::OpenRequested);
        m.handle(E::Connected);
        assert_eq!(m.handle(E::CloseRequested), vec![A::CloseSocket]);
        assert_eq!(m.handle(E::CloseRequested), vec![]);
    }

    #[test]
    fn close_while_connecting_aborts_attempt() {
        let mut m = ConnectionMachine::new(policy(10, 5));
        m.handle(E::OpenRequested);
        assert_eq!(m.handle(E::CloseRequested), vec![A::AbortConnect]);
    }

    #[test]
    fn close_after_exhaustion_is_explicit() {
        let mut m = ConnectionMachine::new(policy(10, 0));
        m.handle(E::OpenRequested);
        m.handle(E::ConnectFailed);
        assert_eq!(m.handle(E::CloseRequested), vec![]);
        assert_eq!(m.state(), &ConnectionState::Closed(CloseReason::Explicit));
    }

    #[test]
    fn exhausted_connection_can_be_reopened_explicitly() {
        let mut m = ConnectionMachine::new(policy(10, 0));
        m.handle(E::OpenRequested);
        m.handle(E::ConnectFailed);
        assert!(m.state().is_exhausted());

        assert_eq!(m.handle(E::OpenRequested), vec![A::Connect]);
        assert_eq!(m.state(), &ConnectionState::Connecting);
    }
}
