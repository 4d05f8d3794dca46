//! The publishing loop.
//!
//! Two timers drive the daemon once it is running: the discovery refresh,
//! which repeats every Home Assistant announcement shortly before it would
//! expire, and the metric update, which publishes the online state and every
//! sensor value. Each firing spawns its work as detached tasks so that a slow
//! sensor never delays the next tick; work from consecutive ticks may
//! overlap.

use crate::broker::Publisher;
use crate::config::AppConfig;
use crate::homeassistant::{self, Announcement};
use crate::sensors::SensorRegistry;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::{self, Instant, MissedTickBehavior};

const STATE_ON: &str = "ON";
const STATE_OFF: &str = "OFF";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct Daemon<P: Publisher> {
    config: Arc<AppConfig>,
    sensors: Arc<SensorRegistry>,
    publisher: Arc<P>,
    state: DaemonState,
}

impl<P: Publisher> Daemon<P> {
    pub fn new(config: AppConfig, sensors: SensorRegistry, publisher: Arc<P>) -> Self {
        Self {
            config: Arc::new(config),
            sensors: Arc::new(sensors),
            publisher,
            state: DaemonState::Starting,
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    fn transition(&mut self, state: DaemonState) {
        debug!("Daemon state: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Runs until SIGINT or SIGTERM.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs until `shutdown` completes, then publishes the offline state and
    /// waits for the broker to acknowledge it.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Starting daemon with {} sensors, update period {}s",
            self.sensors.len(),
            self.config.update_period
        );
        self.sensors.start_samplers();
        announce(&self.config, &self.sensors, self.publisher.as_ref()).await;
        publish_state(&self.config, self.publisher.as_ref()).await;
        self.transition(DaemonState::Running);

        let refresh_period = homeassistant::refresh_interval(self.config.expire_after);
        let update_period = Duration::from_secs(self.config.update_period);
        let mut refresh = time::interval_at(Instant::now() + refresh_period, refresh_period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut update = time::interval_at(Instant::now() + update_period, update_period);
        update.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = refresh.tick() => {
                    let config = Arc::clone(&self.config);
                    let sensors = Arc::clone(&self.sensors);
                    let publisher = Arc::clone(&self.publisher);
                    tokio::spawn(async move {
                        announce(&config, &sensors, publisher.as_ref()).await;
                    });
                }
                _ = update.tick() => {
                    let config = Arc::clone(&self.config);
                    let publisher = Arc::clone(&self.publisher);
                    tokio::spawn(async move {
                        publish_state(&config, publisher.as_ref()).await;
                    });

                    let config = Arc::clone(&self.config);
                    let sensors = Arc::clone(&self.sensors);
                    let publisher = Arc::clone(&self.publisher);
                    tokio::spawn(async move {
                        publish_readings(&config, &sensors, publisher.as_ref()).await;
                    });
                }
            }
        }

        self.transition(DaemonState::ShuttingDown);
        info!("Shutting down, publishing offline state");
        let result = self
            .publisher
            .publish_and_wait(&self.config.state_topic(), STATE_OFF.to_string())
            .await
            .context("Failed to publish offline state");
        self.transition(DaemonState::Stopped);
        result
    }
}

async fn publish_state<P: Publisher>(config: &AppConfig, publisher: &P) {
    if let Err(e) = publisher
        .publish(&config.state_topic(), STATE_ON.to_string())
        .await
    {
        error!("{e}");
    }
}

async fn publish_announcement<P: Publisher>(publisher: &P, announcement: &Announcement) {
    let payload = match announcement.to_json() {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Skipping announcement on {}: {}", announcement.topic, e);
            return;
        }
    };
    if let Err(e) = publisher.publish(&announcement.topic, payload).await {
        warn!("{e}");
    }
}

/// Publishes the device announcement and one per sensor.
async fn announce<P: Publisher>(config: &AppConfig, sensors: &SensorRegistry, publisher: &P) {
    publish_announcement(publisher, &homeassistant::device_announcement(config)).await;
    for sensor in sensors.iter() {
        publish_announcement(publisher, &homeassistant::sensor_announcement(config, sensor)).await;
    }
}

/// Executes every sensor in turn and publishes the values that could be
/// read.
async fn publish_readings<P: Publisher>(
    config: &AppConfig,
    sensors: &SensorRegistry,
    publisher: &P,
) {
    for sensor in sensors.iter() {
        let reading = match sensor.execute().await {
            Ok(reading) => reading,
            Err(e) => {
                error!("{e}");
                continue;
            }
        };
        let topic = config.sensor_topic(&reading.device_class, &reading.id);
        if let Err(e) = publisher.publish(&topic, reading.value).await {
            error!("{e}");
        }
    }
}

/// Completes on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for interrupt: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received interrupt"),
        _ = terminate => info!("Received terminate signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::RecordingPublisher;
    use crate::collectors::cpu;
    use crate::error::SensorError;
    use crate::sensors::rate::RateSensor;
    use crate::sensors::{Builtin, Probe, Sensor};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    fn config() -> AppConfig {
        AppConfig {
            client_id: "nas".to_string(),
            prefix: "msm".to_string(),
            update_period: 10,
            ..AppConfig::default()
        }
    }

    fn sensor(id: &str, device_class: &str, builtin: Builtin) -> Sensor {
        Sensor {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            device_class: device_class.to_string(),
            unit: String::new(),
            state_class: String::new(),
            icon: String::new(),
            probe: Probe::Builtin(builtin),
        }
    }

    /// A rate sensor whose counter grows by 1000 bytes per tick.
    fn steady_rate(id: &str) -> Builtin {
        let mut counter = 0u64;
        let source = move || {
            counter += 1000;
            Ok::<u64, SensorError>(counter)
        };
        Builtin::NetRate(Arc::new(RateSensor::new(id, source, Duration::from_secs(1))))
    }

    fn registry() -> SensorRegistry {
        let mut registry = SensorRegistry::new();
        registry.insert(sensor("cpu_cores", "", Builtin::CpuCores));
        registry.insert(sensor("net_rx", "data_rate", steady_rate("net_rx")));
        registry
    }

    type Running = JoinHandle<(Daemon<RecordingPublisher>, Result<()>)>;

    fn spawn_daemon(
        registry: SensorRegistry,
        publisher: &Arc<RecordingPublisher>,
    ) -> (oneshot::Sender<()>, Running) {
        let (stop, stopped) = oneshot::channel::<()>();
        let mut daemon = Daemon::new(config(), registry, Arc::clone(publisher));
        assert_eq!(daemon.state(), DaemonState::Starting);
        let handle = tokio::spawn(async move {
            let result = daemon
                .run_until(async {
                    let _ = stopped.await;
                })
                .await;
            (daemon, result)
        });
        (stop, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_announces_and_goes_online() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (stop, handle) = spawn_daemon(registry(), &publisher);
        time::sleep(Duration::from_millis(100)).await;

        let topics: Vec<String> = publisher.messages().into_iter().map(|m| m.topic).collect();
        assert_eq!(
            topics,
            vec![
                "homeassistant/binary_sensor/nas/config",
                "homeassistant/sensor/nas_cpu_cores/config",
                "homeassistant/sensor/nas_net_rx/config",
                "msm/nas/state",
            ]
        );
        assert_eq!(publisher.on_topic("msm/nas/state")[0].payload, "ON");

        stop.send(()).unwrap();
        handle.await.unwrap().1.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_interval_publishes_state_and_metrics() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (stop, handle) = spawn_daemon(registry(), &publisher);
        time::sleep(Duration::from_millis(100)).await;
        publisher.clear();

        time::sleep(Duration::from_secs(10)).await;

        let state = publisher.on_topic("msm/nas/state");
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].payload, "ON");

        let cores = publisher.on_topic("msm/nas//cpu_cores");
        assert_eq!(cores.len(), 1);
        assert_eq!(cores[0].payload, cpu::collect_count().unwrap().to_string());

        let rx = publisher.on_topic("msm/nas/data_rate/net_rx");
        assert_eq!(rx.len(), 1);
        assert_eq!(rx[0].payload, "0.008");

        assert_eq!(publisher.messages().len(), 3);

        stop.send(()).unwrap();
        handle.await.unwrap().1.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_publishes_acknowledged_offline_state() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (stop, handle) = spawn_daemon(registry(), &publisher);
        time::sleep(Duration::from_millis(100)).await;
        publisher.clear();

        stop.send(()).unwrap();
        let (daemon, result) = handle.await.unwrap();
        result.unwrap();

        assert_eq!(daemon.state(), DaemonState::Stopped);
        let messages = publisher.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "msm/nas/state");
        assert_eq!(messages[0].payload, "OFF");
        assert!(messages[0].acknowledged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_refreshes_before_expiry() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (stop, handle) = spawn_daemon(registry(), &publisher);
        time::sleep(Duration::from_millis(100)).await;
        publisher.clear();

        time::sleep(Duration::from_millis(58_800)).await;
        assert!(publisher
            .on_topic("homeassistant/binary_sensor/nas/config")
            .is_empty());

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            publisher
                .on_topic("homeassistant/binary_sensor/nas/config")
                .len(),
            1
        );
        assert_eq!(
            publisher
                .on_topic("homeassistant/sensor/nas_net_rx/config")
                .len(),
            1
        );
        assert_eq!(publisher.on_topic("msm/nas/state").len(), 5);

        stop.send(()).unwrap();
        handle.await.unwrap().1.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_sensor_skips_only_itself() {
        let mut registry = registry();
        let broken = RateSensor::new(
            "net_tx",
            || Err::<u64, SensorError>(SensorError::probe("net_tx", "no counters")),
            Duration::from_secs(1),
        );
        registry.insert(sensor(
            "net_tx",
            "data_rate",
            Builtin::NetRate(Arc::new(broken)),
        ));

        let publisher = Arc::new(RecordingPublisher::default());
        let (stop, handle) = spawn_daemon(registry, &publisher);
        time::sleep(Duration::from_millis(100)).await;
        publisher.clear();

        time::sleep(Duration::from_secs(10)).await;
        assert!(publisher.on_topic("msm/nas/data_rate/net_tx").is_empty());
        assert_eq!(publisher.on_topic("msm/nas/data_rate/net_rx").len(), 1);
        assert_eq!(publisher.on_topic("msm/nas//cpu_cores").len(), 1);

        stop.send(()).unwrap();
        handle.await.unwrap().1.unwrap();
    }
}
