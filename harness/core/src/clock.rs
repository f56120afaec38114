use std::{
    fmt,
    ops::Add,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A point on the scenario timeline, measured from the start of the run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(Duration);

impl Time {
    pub const ZERO: Self = Self(Duration::ZERO);

    #[must_use]
    pub const fn from_duration(offset: Duration) -> Self {
        Self(offset)
    }

    #[must_use]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self(Duration::from_secs_f64(secs.max(0.0)))
    }

    #[must_use]
    pub const fn as_duration(&self) -> Duration {
        self.0
    }

    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    /// Elapsed time since `earlier`, zero when `earlier` lies ahead.
    #[must_use]
    pub fn since(&self, earlier: Self) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs)
    }
}

impl fmt::Display for Time {
    /// Seconds since scenario start, the position format used in persisted
    /// measurements.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0.as_secs_f64())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("wait interrupted by cancellation")]
pub struct Interrupted;

/// Time source the executor and samplers are written against.
///
/// The wall-clock variant tracks real time; the simulated variant keeps a
/// logical cursor so long scenarios run instantly in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Time;

    /// Blocks the caller until the clock reaches `deadline` or the token
    /// fires, whichever comes first.
    async fn sleep_until(
        &self,
        deadline: Time,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted>;
}

/// Clock backed by the tokio runtime's notion of real time.
pub struct WallClock {
    start: tokio::time::Instant,
}

impl WallClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for WallClock {
    fn now(&self) -> Time {
        Time(self.start.elapsed())
    }

    async fn sleep_until(
        &self,
        deadline: Time,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        let target = self.start + deadline.as_duration();
        tokio::select! {
            () = cancel.cancelled() => Err(Interrupted),
            () = tokio::time::sleep_until(target) => Ok(()),
        }
    }
}

/// Deterministic clock with a single logical time cursor.
///
/// `sleep_until` advances the cursor and returns immediately; all waits are
/// serialized through one mutex, so time observed by concurrent tasks is
/// monotonic.
pub struct SimClock {
    cursor: Mutex<Time>,
}

impl SimClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(Time::ZERO),
        }
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SimClock {
    fn now(&self) -> Time {
        *self.cursor.lock().expect("sim clock poisoned")
    }

    async fn sleep_until(
        &self,
        deadline: Time,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        if cancel.is_cancelled() {
            return Err(Interrupted);
        }
        let mut cursor = self.cursor.lock().expect("sim clock poisoned");
        if *cursor < deadline {
            *cursor = deadline;
        }
        Ok(())
    }
}
