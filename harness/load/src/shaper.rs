use std::{f64::consts::TAU, sync::Arc, time::Duration};

use async_trait::async_trait;
use squall_driver::Rate;
use tokio::time::Instant;
use tracing::debug;

/// Feedback source for load-sensitive traffic shapes.
#[async_trait]
pub trait LoadInfo: Send + Sync {
    async fn sent_transactions(&self) -> Result<u64, String>;
    async fn received_transactions(&self) -> Result<u64, String>;
}

/// Defines the shape of traffic an application produces: how many messages
/// should have been emitted over any given interval.
#[async_trait]
pub trait Shaper: Send {
    /// Notifies the shaper that production starts now and provides the
    /// feedback source for closed-loop shapes.
    fn start(&mut self, now: Instant, load: Arc<dyn LoadInfo>);

    /// Expected number of messages in `[start, start + duration)`. The
    /// result is a non-negative real; the caller carries fractions across
    /// intervals, which keeps the value additive over adjacent intervals.
    async fn messages_in_interval(&mut self, start: Instant, duration: Duration) -> f64;
}

/// Builds the shaper described by a scenario rate; an absent rate produces
/// no traffic.
#[must_use]
pub fn from_rate(rate: Option<&Rate>) -> Box<dyn Shaper> {
    match rate {
        None => Box::new(ConstantShaper::new(0.0)),
        Some(Rate::Constant(hz)) => Box::new(ConstantShaper::new(*hz)),
        Some(Rate::Slope { start, increment }) => {
            Box::new(SlopeShaper::new(*start, *increment))
        }
        Some(Rate::Wave { min, max, period }) => {
            Box::new(WaveShaper::new(min.unwrap_or(0.0), *max, *period))
        }
        Some(Rate::Auto { increase, decrease }) => Box::new(AutoShaper::new(
            increase.unwrap_or(AutoShaper::DEFAULT_INCREASE),
            decrease.unwrap_or(AutoShaper::DEFAULT_DECREASE),
        )),
    }
}

/// Emits messages at a fixed frequency.
pub struct ConstantShaper {
    rate: f64,
}

impl ConstantShaper {
    #[must_use]
    pub fn new(rate: f64) -> Self {
        Self {
            rate: rate.max(0.0),
        }
    }
}

#[async_trait]
impl Shaper for ConstantShaper {
    fn start(&mut self, _now: Instant, _load: Arc<dyn LoadInfo>) {}

    async fn messages_in_interval(&mut self, _start: Instant, duration: Duration) -> f64 {
        self.rate * duration.as_secs_f64()
    }
}

/// Emits messages with a linearly changing frequency
/// `f(t) = start + increment * t`, clipped at zero.
pub struct SlopeShaper {
    start_rate: f64,
    increment: f64,
    started_at: Option<Instant>,
}

impl SlopeShaper {
    #[must_use]
    pub fn new(start_rate: f64, increment: f64) -> Self {
        Self {
            start_rate,
            increment,
            started_at: None,
        }
    }
}

#[async_trait]
impl Shaper for SlopeShaper {
    fn start(&mut self, now: Instant, _load: Arc<dyn LoadInfo>) {
        self.started_at = Some(now);
    }

    async fn messages_in_interval(&mut self, start: Instant, duration: Duration) -> f64 {
        // The message count is the area under the frequency curve over the
        // relative interval [a, b]:
        //
        //   m(a, b) = k/2 * (b^2 - a^2) + d * (b - a)
        //
        // restricted to the region where the frequency is non-negative.
        let origin = self.started_at.unwrap_or(start);
        let mut a = start.duration_since(origin).as_secs_f64();
        let mut b = a + duration.as_secs_f64();

        if self.increment == 0.0 {
            return (b - a) * self.start_rate.max(0.0);
        }

        // The zero point is where the frequency crosses zero.
        let zero = -self.start_rate / self.increment;
        if self.increment > 0.0 {
            a = a.max(zero);
            b = b.max(zero);
        } else {
            a = a.min(zero);
            b = b.min(zero);
        }

        (self.increment / 2.0) * (b * b - a * a) + self.start_rate * (b - a)
    }
}

/// Emits messages at a frequency oscillating sinusoidally between `min` and
/// `max` with the given period.
pub struct WaveShaper {
    min: f64,
    max: f64,
    period: f64,
    started_at: Option<Instant>,
}

impl WaveShaper {
    #[must_use]
    pub fn new(min: f64, max: f64, period: f64) -> Self {
        Self {
            min,
            max,
            period,
            started_at: None,
        }
    }

    /// Antiderivative of `min + (max - min) * (1 + sin(2*pi*t/period)) / 2`.
    fn integral(&self, t: f64) -> f64 {
        let amplitude = (self.max - self.min) / 2.0;
        let mid = self.min + amplitude;
        mid * t - amplitude * (self.period / TAU) * (TAU * t / self.period).cos()
    }
}

#[async_trait]
impl Shaper for WaveShaper {
    fn start(&mut self, now: Instant, _load: Arc<dyn LoadInfo>) {
        self.started_at = Some(now);
    }

    async fn messages_in_interval(&mut self, start: Instant, duration: Duration) -> f64 {
        let origin = self.started_at.unwrap_or(start);
        let a = start.duration_since(origin).as_secs_f64();
        let b = a + duration.as_secs_f64();
        self.integral(b) - self.integral(a)
    }
}

/// Closed-loop shaper: behaves as a constant shaper between control ticks
/// and adjusts its rate once per tick depending on whether the network keeps
/// up with the produced load.
pub struct AutoShaper {
    increase: f64,
    decrease: f64,
    rate: f64,
    load: Option<Arc<dyn LoadInfo>>,
    last_tick: Option<Instant>,
    last_sent: u64,
    last_received: u64,
}

impl AutoShaper {
    pub const DEFAULT_INCREASE: f64 = 1.0;
    pub const DEFAULT_DECREASE: f64 = 0.2;

    /// Control tick between rate adjustments.
    pub const TICK: Duration = Duration::from_secs(1);

    const INITIAL_RATE: f64 = 10.0;
    const MIN_RATE: f64 = 1.0;
    /// Fraction of the sent delta the received delta may fall short of while
    /// still counting as keeping up.
    const KEEP_UP_TOLERANCE: f64 = 0.05;

    #[must_use]
    pub fn new(increase: f64, decrease: f64) -> Self {
        Self {
            increase: increase.max(1.0),
            decrease: decrease.clamp(0.0, 0.99),
            rate: Self::INITIAL_RATE,
            load: None,
            last_tick: None,
            last_sent: 0,
            last_received: 0,
        }
    }

    #[must_use]
    pub fn current_rate(&self) -> f64 {
        self.rate
    }

    async fn adjust(&mut self) {
        let Some(load) = self.load.clone() else {
            return;
        };
        let (sent, received) = match (
            load.sent_transactions().await,
            load.received_transactions().await,
        ) {
            (Ok(sent), Ok(received)) => (sent, received),
            (Err(err), _) | (_, Err(err)) => {
                debug!(%err, "load feedback unavailable, keeping rate");
                return;
            }
        };

        let sent_delta = sent.saturating_sub(self.last_sent) as f64;
        let received_delta = received.saturating_sub(self.last_received) as f64;
        self.last_sent = sent;
        self.last_received = received;

        let keeping_up = received_delta >= (1.0 - Self::KEEP_UP_TOLERANCE) * sent_delta;
        if keeping_up {
            self.rate *= self.increase;
        } else {
            self.rate *= 1.0 - self.decrease;
        }
        self.rate = self.rate.max(Self::MIN_RATE);
        debug!(
            rate = self.rate,
            sent_delta, received_delta, keeping_up, "auto shaper adjusted"
        );
    }
}

#[async_trait]
impl Shaper for AutoShaper {
    fn start(&mut self, now: Instant, load: Arc<dyn LoadInfo>) {
        self.load = Some(load);
        self.last_tick = Some(now);
    }

    async fn messages_in_interval(&mut self, start: Instant, duration: Duration) -> f64 {
        let due = self
            .last_tick
            .is_none_or(|last| start.duration_since(last) >= Self::TICK);
        if due {
            self.last_tick = Some(start);
            self.adjust().await;
        }
        self.rate * duration.as_secs_f64()
    }
}
