//! Background-sampled rate sensors.
//!
//! A [`RateSensor`] turns a cumulative counter into a per-tick delta. The
//! counter is sampled by a single task that owns all mutable state; readers
//! never touch it directly and instead send a request and wait for the task
//! to answer with the last completed delta.

use crate::collectors::network::{self, Direction};
use crate::collectors::{BITS_IN_BYTE, BYTES_IN_MEGABYTE};
use crate::error::SensorError;
use log::{debug, info, warn};
use std::sync::Mutex;
use std::time::Duration;
use systemstat::{Platform, System};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

const REQUEST_CAPACITY: usize = 8;

/// A monotonically increasing counter the sampler can read.
pub trait CounterSource: Send + 'static {
    fn read(&mut self) -> Result<u64, SensorError>;
}

impl<F> CounterSource for F
where
    F: FnMut() -> Result<u64, SensorError> + Send + 'static,
{
    fn read(&mut self) -> Result<u64, SensorError> {
        self()
    }
}

/// Byte counters of all non-loopback interfaces.
pub struct NetworkCounter {
    sys: System,
    direction: Direction,
}

impl NetworkCounter {
    pub fn new(direction: Direction) -> Self {
        Self {
            sys: System::new(),
            direction,
        }
    }
}

impl CounterSource for NetworkCounter {
    fn read(&mut self) -> Result<u64, SensorError> {
        network::collect_counter(&self.sys, self.direction)
    }
}

type Reply = oneshot::Sender<Result<u64, SensorError>>;

/// Counter state, owned by the sampling task only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RateState {
    previous: Option<u64>,
    current: Option<u64>,
}

impl RateState {
    /// Records a new counter value. A counter that went backwards (reset,
    /// interface restart) yields a zero delta for that tick.
    fn observe(&mut self, now: u64) {
        if let Some(previous) = self.previous {
            self.current = Some(now.checked_sub(previous).unwrap_or(0));
        }
        self.previous = Some(now);
    }
}

struct Sampler {
    id: String,
    interval: Duration,
    source: Box<dyn CounterSource>,
    state: RateState,
}

impl Sampler {
    fn sample(&mut self) {
        match self.source.read() {
            Ok(now) => self.state.observe(now),
            Err(e) if self.state.previous.is_none() => {
                warn!("{}: no counter baseline yet: {}", self.id, e);
            }
            Err(e) => warn!("{}: counter read failed: {}", self.id, e),
        }
    }

    fn value(&self) -> Result<u64, SensorError> {
        self.state
            .current
            .ok_or_else(|| SensorError::Unavailable(self.id.clone()))
    }

    async fn run(mut self, mut requests: mpsc::Receiver<Reply>) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Readers that arrived after the baseline but before the first delta.
        let mut waiting: Vec<Reply> = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => {
                    self.sample();
                    for reply in waiting.drain(..) {
                        let _ = reply.send(self.value());
                    }
                }
                request = requests.recv() => {
                    let Some(reply) = request else {
                        break;
                    };
                    match self.state {
                        RateState { previous: Some(_), current: None } => waiting.push(reply),
                        _ => {
                            let _ = reply.send(self.value());
                        }
                    }
                }
            }
        }
        debug!("{}: sampler stopped", self.id);
    }
}

/// Rate of change of a cumulative counter, sampled in the background.
pub struct RateSensor {
    id: String,
    interval: Duration,
    requests: mpsc::Sender<Reply>,
    unstarted: Mutex<Option<(mpsc::Receiver<Reply>, Box<dyn CounterSource>)>>,
}

impl std::fmt::Debug for RateSensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateSensor")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl RateSensor {
    pub fn new(id: impl Into<String>, source: impl CounterSource, interval: Duration) -> Self {
        let (requests, receiver) = mpsc::channel(REQUEST_CAPACITY);
        Self {
            id: id.into(),
            interval,
            requests,
            unstarted: Mutex::new(Some((receiver, Box::new(source)))),
        }
    }

    pub fn network(id: impl Into<String>, direction: Direction) -> Self {
        Self::new(id, NetworkCounter::new(direction), DEFAULT_SAMPLE_INTERVAL)
    }

    /// Spawns the sampling task. Calling it again is a no-op.
    pub fn start(&self) {
        let Some((receiver, source)) = self.unstarted.lock().ok().and_then(|mut u| u.take()) else {
            debug!("{}: sampler already started", self.id);
            return;
        };

        let sampler = Sampler {
            id: self.id.clone(),
            interval: self.interval,
            source,
            state: RateState::default(),
        };
        tokio::spawn(sampler.run(receiver));
        info!("{}: sampling every {:?}", self.id, self.interval);
    }

    fn is_started(&self) -> bool {
        self.unstarted.lock().map(|u| u.is_none()).unwrap_or(true)
    }

    /// Counter delta over the last completed tick.
    pub async fn read(&self) -> Result<u64, SensorError> {
        if !self.is_started() {
            return Err(SensorError::Unavailable(self.id.clone()));
        }

        let (reply, response) = oneshot::channel();
        self.requests
            .send(reply)
            .await
            .map_err(|_| SensorError::SamplerStopped(self.id.clone()))?;
        response
            .await
            .map_err(|_| SensorError::SamplerStopped(self.id.clone()))?
    }

    /// Last delta as Mbit/s with three decimals.
    pub async fn read_mbits(&self) -> Result<String, SensorError> {
        let delta = self.read().await?;
        Ok(format_mbits(delta, self.interval))
    }
}

pub fn format_mbits(delta: u64, interval: Duration) -> String {
    let seconds = interval.as_secs_f64();
    let bytes_per_second = if seconds > 0.0 {
        delta as f64 / seconds
    } else {
        delta as f64
    };
    format!("{:.3}", bytes_per_second / BYTES_IN_MEGABYTE * BITS_IN_BYTE)
}
