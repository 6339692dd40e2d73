use std::fmt;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};

use crate::error::AttemptError;

/// The independently configurable deadlines of one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    /// From attempt start until the request is fully sent.
    Request,
    /// From upload completion until response headers arrive.
    Response,
    /// Inactivity on the connection once one is assigned.
    IdleSocket,
    /// From attempt start until the response body is fully consumed.
    Total,
}

impl Deadline {
    pub const ALL: [Deadline; 4] = [
        Deadline::Request,
        Deadline::Response,
        Deadline::IdleSocket,
        Deadline::Total,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "timeoutRequest",
            Self::Response => "timeoutResponse",
            Self::IdleSocket => "timeoutIdleSocket",
            Self::Total => "timeoutTotal",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Request => 0,
            Self::Response => 1,
            Self::IdleSocket => 2,
            Self::Total => 3,
        }
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Configured thresholds. A zero threshold counts as not configured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadlines {
    pub request: Option<Duration>,
    pub response: Option<Duration>,
    pub idle_socket: Option<Duration>,
    pub total: Option<Duration>,
}

impl Deadlines {
    pub fn get(&self, deadline: Deadline) -> Option<Duration> {
        let threshold = match deadline {
            Deadline::Request => self.request,
            Deadline::Response => self.response,
            Deadline::IdleSocket => self.idle_socket,
            Deadline::Total => self.total,
        };
        threshold.filter(|threshold| !threshold.is_zero())
    }

    pub fn any(&self) -> bool {
        Deadline::ALL
            .into_iter()
            .any(|deadline| self.get(deadline).is_some())
    }
}

/// Arms and disarms the deadlines of a single attempt.
///
/// The idle-socket deadline is only tracked here for its threshold; the
/// transport owns the inactivity timer itself.
#[derive(Debug)]
pub struct TimeoutSupervisor {
    thresholds: Deadlines,
    armed: [Option<Instant>; 4],
}

impl TimeoutSupervisor {
    pub fn new(thresholds: Deadlines) -> Self {
        Self {
            thresholds,
            armed: [None; 4],
        }
    }

    /// Creates a supervisor with the request and total deadlines running.
    pub fn start(thresholds: Deadlines) -> Self {
        let mut supervisor = Self::new(thresholds);
        supervisor.arm(Deadline::Request);
        supervisor.arm(Deadline::Total);
        supervisor
    }

    pub fn thresholds(&self) -> &Deadlines {
        &self.thresholds
    }

    pub fn threshold(&self, deadline: Deadline) -> Option<Duration> {
        self.thresholds.get(deadline)
    }

    /// Starts `deadline` from now. Unconfigured deadlines stay disarmed.
    pub fn arm(&mut self, deadline: Deadline) {
        self.armed[deadline.index()] = self
            .thresholds
            .get(deadline)
            .map(|threshold| Instant::now() + threshold);
    }

    pub fn disarm(&mut self, deadline: Deadline) {
        self.armed[deadline.index()] = None;
    }

    pub fn disarm_all(&mut self) {
        self.armed = [None; 4];
    }

    pub fn is_armed(&self, deadline: Deadline) -> bool {
        self.armed[deadline.index()].is_some()
    }

    fn next_expiry(&self) -> Option<(Deadline, Instant)> {
        let mut next: Option<(Deadline, Instant)> = None;
        for deadline in Deadline::ALL {
            let Some(at) = self.armed[deadline.index()] else {
                continue;
            };
            if next.is_none_or(|(_, earliest)| at < earliest) {
                next = Some((deadline, at));
            }
        }
        next
    }

    /// Resolves with the earliest armed deadline once it passes.
    ///
    /// Never resolves while nothing is armed.
    pub async fn expired(&self) -> Deadline {
        match self.next_expiry() {
            Some((deadline, at)) => {
                sleep_until(at).await;
                deadline
            }
            None => std::future::pending().await,
        }
    }

    pub fn timeout_error(&self, deadline: Deadline) -> AttemptError {
        let threshold_ms = self
            .threshold(deadline)
            .map(|threshold| threshold.as_millis().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0);
        AttemptError::Timeout {
            deadline,
            threshold_ms,
        }
    }
}
