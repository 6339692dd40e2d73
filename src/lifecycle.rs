//! Lifecycle signals of one attempt and the observer that turns them into
//! phase timings and deadline transitions.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tracing::trace;

use crate::deadline::{Deadline, Deadlines, TimeoutSupervisor};
use crate::error::AttemptError;
use crate::timing::{Phase, PhaseTimer, PhaseTimings};

/// One-shot notifications a transport emits while it runs an attempt.
///
/// Apart from `BodyChunk`, each signal is expected at most once.
#[derive(Debug)]
pub enum LifecycleEvent {
    /// A connection, new or reused, is now associated with the attempt.
    SocketAcquired { reused: bool },
    /// Only on newly established connections.
    DnsResolved,
    /// Only on newly established connections.
    TcpConnected,
    /// Only on new, not yet authorized secure connections.
    TlsHandshakeComplete,
    UploadFinished,
    ResponseHeaders {
        status: StatusCode,
        headers: HeaderMap,
    },
    BodyChunk(Bytes),
    /// Terminal success signal.
    BodyEnded,
    /// The idle timer armed through [`Attempt::arm_idle_timeout`] elapsed.
    IdleTimeout,
    /// Body streaming failed after the headers were received.
    ResponseError(AttemptError),
    /// The attempt failed before a response was obtained.
    Error(AttemptError),
}

/// A single in-flight transport operation.
///
/// Implementations yield lifecycle signals in arrival order and return `None`
/// once nothing more will arrive.
pub trait Attempt: Send {
    fn next_event(&mut self) -> impl Future<Output = Option<LifecycleEvent>> + Send;

    /// Terminates the in-flight operation.
    fn abort(&mut self);

    /// Arms an inactivity timer on the underlying connection. The transport
    /// rearms it on any traffic and yields [`LifecycleEvent::IdleTimeout`]
    /// when it elapses.
    fn arm_idle_timeout(&mut self, timeout: Duration);
}

/// Produces a fresh transport operation for every attempt.
pub trait AttemptFactory: Send {
    type Attempt: Attempt;

    fn start_attempt(&mut self) -> Self::Attempt;
}

impl<F, A> AttemptFactory for F
where
    F: FnMut() -> A + Send,
    A: Attempt,
{
    type Attempt = A;

    fn start_attempt(&mut self) -> A {
        self()
    }
}

/// Drives a [`PhaseTimer`] and a [`TimeoutSupervisor`] from the signals of
/// exactly one attempt.
#[derive(Debug)]
pub struct LifecycleObserver {
    timer: PhaseTimer,
    supervisor: TimeoutSupervisor,
    connection_reused: bool,
    ended: bool,
}

impl LifecycleObserver {
    /// Starts the clock and the request/total deadlines.
    pub fn start(deadlines: Deadlines) -> Self {
        Self {
            timer: PhaseTimer::start(),
            supervisor: TimeoutSupervisor::start(deadlines),
            connection_reused: false,
            ended: false,
        }
    }

    pub fn supervisor(&self) -> &TimeoutSupervisor {
        &self.supervisor
    }

    pub fn timings(&self) -> &PhaseTimings {
        self.timer.timings()
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// Applies one signal.
    ///
    /// Returns the idle-socket deadline when the signal reports that the
    /// connection went idle for longer than the configured threshold.
    pub fn on_event<A: Attempt>(
        &mut self,
        event: &LifecycleEvent,
        attempt: &mut A,
    ) -> Option<Deadline> {
        if self.ended {
            return None;
        }
        match event {
            LifecycleEvent::SocketAcquired { reused } => {
                self.connection_reused = *reused;
                self.timer.end_phase(Phase::Socket);
                if let Some(idle) = self.supervisor.threshold(Deadline::IdleSocket) {
                    attempt.arm_idle_timeout(idle);
                }
            }
            LifecycleEvent::DnsResolved => self.end_connection_phase(Phase::Dns),
            LifecycleEvent::TcpConnected => self.end_connection_phase(Phase::TcpConnect),
            LifecycleEvent::TlsHandshakeComplete => self.end_connection_phase(Phase::Tls),
            LifecycleEvent::UploadFinished => {
                self.supervisor.disarm(Deadline::Request);
                self.timer.end_phase(Phase::Upload);
                self.supervisor.arm(Deadline::Response);
            }
            LifecycleEvent::ResponseHeaders { .. } => {
                self.supervisor.disarm(Deadline::Response);
                self.timer.end_phase(Phase::Response);
            }
            LifecycleEvent::BodyChunk(_) => {}
            LifecycleEvent::BodyEnded
            | LifecycleEvent::ResponseError(_)
            | LifecycleEvent::Error(_) => self.end(),
            LifecycleEvent::IdleTimeout => {
                if self.supervisor.threshold(Deadline::IdleSocket).is_some() {
                    return Some(Deadline::IdleSocket);
                }
            }
        }
        trace!(total_ms = self.timer.timings().total_ms(), "lifecycle checkpoint");
        None
    }

    fn end_connection_phase(&mut self, phase: Phase) {
        // Reused connections skip connection setup; those phases stay at zero.
        if !self.connection_reused {
            self.timer.end_phase(phase);
        }
    }

    fn end(&mut self) {
        self.supervisor.disarm_all();
        self.timer.end_phase(Phase::Download);
        self.ended = true;
    }

    /// Disarms every deadline and returns the frozen timings.
    pub fn finish(mut self) -> PhaseTimings {
        self.supervisor.disarm_all();
        self.timer.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::{HeaderMap, StatusCode};
    use tokio::time::advance;

    use super::{Attempt, LifecycleEvent, LifecycleObserver};
    use crate::deadline::{Deadline, Deadlines};
    use crate::timing::Phase;

    #[derive(Default)]
    struct NullAttempt {
        idle_timeout: Option<Duration>,
    }

    impl Attempt for NullAttempt {
        async fn next_event(&mut self) -> Option<LifecycleEvent> {
            None
        }

        fn abort(&mut self) {}

        fn arm_idle_timeout(&mut self, timeout: Duration) {
            self.idle_timeout = Some(timeout);
        }
    }

    fn deadlines() -> Deadlines {
        Deadlines {
            request: Some(Duration::from_millis(100)),
            response: Some(Duration::from_millis(100)),
            idle_socket: Some(Duration::from_millis(30)),
            total: Some(Duration::from_millis(500)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn upload_moves_from_request_to_response_deadline() {
        let mut attempt = NullAttempt::default();
        let mut observer = LifecycleObserver::start(deadlines());

        observer.on_event(&LifecycleEvent::SocketAcquired { reused: false }, &mut attempt);
        assert_eq!(attempt.idle_timeout, Some(Duration::from_millis(30)));

        advance(Duration::from_millis(4)).await;
        observer.on_event(&LifecycleEvent::UploadFinished, &mut attempt);
        assert!(!observer.supervisor().is_armed(Deadline::Request));
        assert!(observer.supervisor().is_armed(Deadline::Response));

        advance(Duration::from_millis(6)).await;
        let headers = LifecycleEvent::ResponseHeaders {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        };
        observer.on_event(&headers, &mut attempt);
        assert!(!observer.supervisor().is_armed(Deadline::Response));
        assert!(observer.supervisor().is_armed(Deadline::Total));

        observer.on_event(&LifecycleEvent::BodyEnded, &mut attempt);
        assert!(observer.has_ended());
        assert!(!observer.supervisor().is_armed(Deadline::Total));

        let timings = observer.finish();
        assert_eq!(timings.get(Phase::Upload), Duration::from_millis(4));
        assert_eq!(timings.get(Phase::Response), Duration::from_millis(6));
        assert_eq!(timings.total(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn reused_connection_skips_setup_phases() {
        let mut attempt = NullAttempt::default();
        let mut observer = LifecycleObserver::start(Deadlines::default());

        advance(Duration::from_millis(1)).await;
        observer.on_event(&LifecycleEvent::SocketAcquired { reused: true }, &mut attempt);
        advance(Duration::from_millis(2)).await;
        observer.on_event(&LifecycleEvent::DnsResolved, &mut attempt);
        observer.on_event(&LifecycleEvent::TcpConnected, &mut attempt);
        observer.on_event(&LifecycleEvent::TlsHandshakeComplete, &mut attempt);
        advance(Duration::from_millis(3)).await;
        observer.on_event(&LifecycleEvent::UploadFinished, &mut attempt);

        let timings = observer.finish();
        assert_eq!(timings.get(Phase::Dns), Duration::ZERO);
        assert_eq!(timings.get(Phase::TcpConnect), Duration::ZERO);
        assert_eq!(timings.get(Phase::Tls), Duration::ZERO);
        assert_eq!(timings.get(Phase::Upload), Duration::from_millis(5));
        assert!(attempt.idle_timeout.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_signal_without_threshold_is_ignored() {
        let mut attempt = NullAttempt::default();
        let mut observer = LifecycleObserver::start(Deadlines::default());
        assert_eq!(
            observer.on_event(&LifecycleEvent::IdleTimeout, &mut attempt),
            None
        );

        let mut observer = LifecycleObserver::start(deadlines());
        assert_eq!(
            observer.on_event(&LifecycleEvent::IdleTimeout, &mut attempt),
            Some(Deadline::IdleSocket)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn signals_after_end_are_ignored() {
        let mut attempt = NullAttempt::default();
        let mut observer = LifecycleObserver::start(deadlines());
        observer.on_event(&LifecycleEvent::BodyEnded, &mut attempt);
        advance(Duration::from_millis(9)).await;
        observer.on_event(&LifecycleEvent::UploadFinished, &mut attempt);

        assert!(!observer.supervisor().is_armed(Deadline::Response));
        assert_eq!(observer.timings().get(Phase::Upload), Duration::ZERO);
    }
}
