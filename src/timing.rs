//! Phase checkpoints for one attempt.
//!
//! A [`PhaseTimer`] keeps a running `total` and charges each checkpoint the
//! time elapsed since the previous one, so the per-phase values always add up
//! to the total.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Socket,
    Dns,
    TcpConnect,
    Tls,
    Upload,
    Response,
    Download,
}

impl Phase {
    /// Nominal order in which a fresh connection passes through the phases.
    pub const ALL: [Phase; 7] = [
        Phase::Socket,
        Phase::Dns,
        Phase::TcpConnect,
        Phase::Tls,
        Phase::Upload,
        Phase::Response,
        Phase::Download,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::Dns => "dns",
            Self::TcpConnect => "tcpConnect",
            Self::Tls => "tls",
            Self::Upload => "upload",
            Self::Response => "response",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown phase \"{name}\"")]
pub struct UnknownPhase {
    name: String,
}

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == name)
            .ok_or_else(|| UnknownPhase {
                name: name.to_owned(),
            })
    }
}

/// Per-phase durations of one attempt plus the running total.
///
/// Phases whose signal never fired stay at zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseTimings {
    socket: Duration,
    dns: Duration,
    tcp_connect: Duration,
    tls: Duration,
    upload: Duration,
    response: Duration,
    download: Duration,
    total: Duration,
}

impl PhaseTimings {
    pub fn get(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Socket => self.socket,
            Phase::Dns => self.dns,
            Phase::TcpConnect => self.tcp_connect,
            Phase::Tls => self.tls,
            Phase::Upload => self.upload,
            Phase::Response => self.response,
            Phase::Download => self.download,
        }
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn get_ms(&self, phase: Phase) -> f64 {
        duration_ms(self.get(phase))
    }

    pub fn total_ms(&self) -> f64 {
        duration_ms(self.total)
    }

    pub fn phases(&self) -> impl Iterator<Item = (Phase, Duration)> + '_ {
        Phase::ALL.into_iter().map(|phase| (phase, self.get(phase)))
    }

    fn slot_mut(&mut self, phase: Phase) -> &mut Duration {
        match phase {
            Phase::Socket => &mut self.socket,
            Phase::Dns => &mut self.dns,
            Phase::TcpConnect => &mut self.tcp_connect,
            Phase::Tls => &mut self.tls,
            Phase::Upload => &mut self.upload,
            Phase::Response => &mut self.response,
            Phase::Download => &mut self.download,
        }
    }
}

// Serialized as milliseconds keyed by phase name, e.g. `{"tcpConnect": 1.25, ..., "total": 9.5}`.
impl Serialize for PhaseTimings {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("PhaseTimings", Phase::ALL.len() + 1)?;
        for (phase, value) in self.phases() {
            state.serialize_field(phase.as_str(), &duration_ms(value))?;
        }
        state.serialize_field("total", &self.total_ms())?;
        state.end()
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

#[derive(Debug)]
pub struct PhaseTimer {
    started_at: Instant,
    timings: PhaseTimings,
}

impl PhaseTimer {
    pub fn start() -> Self {
        Self {
            started_at: Instant::now(),
            timings: PhaseTimings::default(),
        }
    }

    /// Charges the time since the previous checkpoint to `phase`.
    ///
    /// A phase that ends more than once accumulates.
    pub fn end_phase(&mut self, phase: Phase) {
        let elapsed = self.started_at.elapsed().max(self.timings.total);
        let delta = elapsed - self.timings.total;
        *self.timings.slot_mut(phase) += delta;
        self.timings.total = elapsed;
    }

    pub fn timings(&self) -> &PhaseTimings {
        &self.timings
    }

    pub fn finish(self) -> PhaseTimings {
        self.timings
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::advance;

    use super::{Phase, PhaseTimer, PhaseTimings};

    fn phase_sum(timings: &PhaseTimings) -> Duration {
        timings.phases().map(|(_, value)| value).sum()
    }

    #[tokio::test(start_paused = true)]
    async fn end_phase_charges_time_since_previous_checkpoint() {
        let mut timer = PhaseTimer::start();
        advance(Duration::from_millis(3)).await;
        timer.end_phase(Phase::Socket);
        advance(Duration::from_millis(5)).await;
        timer.end_phase(Phase::Upload);
        advance(Duration::from_millis(2)).await;
        timer.end_phase(Phase::Response);

        let timings = timer.finish();
        assert_eq!(timings.get(Phase::Socket), Duration::from_millis(3));
        assert_eq!(timings.get(Phase::Upload), Duration::from_millis(5));
        assert_eq!(timings.get(Phase::Response), Duration::from_millis(2));
        assert_eq!(timings.get(Phase::Dns), Duration::ZERO);
        assert_eq!(timings.total(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn phase_values_always_sum_to_total() {
        let sequence = [
            (Phase::Download, 4),
            (Phase::Socket, 1),
            (Phase::Socket, 7),
            (Phase::Tls, 0),
            (Phase::Response, 2),
            (Phase::Dns, 9),
        ];
        let mut timer = PhaseTimer::start();
        for (phase, wait_ms) in sequence {
            advance(Duration::from_millis(wait_ms)).await;
            timer.end_phase(phase);
            assert_eq!(phase_sum(timer.timings()), timer.timings().total());
        }

        let timings = timer.finish();
        assert_eq!(timings.total(), Duration::from_millis(23));
        assert_eq!(timings.get(Phase::Socket), Duration::from_millis(8));
    }

    #[test]
    fn phase_names_round_trip_and_reject_unknown() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>(), Ok(phase));
        }
        let error = "total".parse::<Phase>().expect_err("total is not a phase");
        assert_eq!(error.to_string(), "unknown phase \"total\"");
    }

    #[tokio::test(start_paused = true)]
    async fn timings_serialize_as_milliseconds() {
        let mut timer = PhaseTimer::start();
        advance(Duration::from_millis(2)).await;
        timer.end_phase(Phase::TcpConnect);

        let value = serde_json::to_value(timer.finish()).expect("timings should serialize");
        assert_eq!(value["tcpConnect"], serde_json::json!(2.0));
        assert_eq!(value["total"], serde_json::json!(2.0));
        assert_eq!(value["tls"], serde_json::json!(0.0));
    }
}
