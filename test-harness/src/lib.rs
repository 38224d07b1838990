// In-process cluster for integration tests: memory storage, a control
// tower and a pilot wired to it, plus client helpers tuned for fast
// test timing.
use anyhow::{Context, Result};
use cascade_client::{ClientOptions, DataLossInfo, MessageReceived, Observer};
use cascade_common::LogId;
use cascade_msg::MsgLoopOptions;
use cascade_pilot::{Pilot, PilotOptions};
use cascade_router::LogRouter;
use cascade_storage::MemoryLogStorage;
use cascade_tower::{ControlTower, ControlTowerOptions};
use cascade_wire::UnsubscribeReason;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const FIRST_LOG: LogId = 1;
const NUM_LOGS: u64 = 1000;

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn fast_loop_options(listen: bool) -> MsgLoopOptions {
    MsgLoopOptions {
        listen_addr: listen.then(|| "127.0.0.1:0".parse().expect("addr")),
        tick_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(200),
        stream_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn tower_options(addr: Option<SocketAddr>) -> ControlTowerOptions {
    let mut msg_loop = fast_loop_options(true);
    if let Some(addr) = addr {
        msg_loop.listen_addr = Some(addr);
    }
    ControlTowerOptions {
        msg_loop,
        num_rooms: 4,
        num_readers: 2,
        first_log: FIRST_LOG,
        num_logs: NUM_LOGS,
        ..Default::default()
    }
}

pub struct TestCluster {
    pub storage: MemoryLogStorage,
    tower: Option<ControlTower>,
    pilot: Option<Pilot>,
    tower_addr: SocketAddr,
    pilot_addr: SocketAddr,
    router: LogRouter,
}

impl TestCluster {
    pub async fn start() -> Result<Self> {
        init_tracing();
        let storage = MemoryLogStorage::new();
        let tower = ControlTower::start(tower_options(None), Arc::new(storage.clone()))
            .await
            .context("start tower")?;
        let tower_addr = tower.local_addr().context("tower addr")?;
        let pilot = Pilot::start(
            PilotOptions {
                msg_loop: fast_loop_options(true),
                first_log: FIRST_LOG,
                num_logs: NUM_LOGS,
            },
            Arc::new(storage.clone()),
        )
        .await
        .context("start pilot")?;
        let pilot_addr = pilot.local_addr().context("pilot addr")?;
        let router = LogRouter::new(FIRST_LOG, NUM_LOGS).context("router")?;
        Ok(Self {
            storage,
            tower: Some(tower),
            pilot: Some(pilot),
            tower_addr,
            pilot_addr,
            router,
        })
    }

    pub fn tower_addr(&self) -> SocketAddr {
        self.tower_addr
    }

    pub fn pilot_addr(&self) -> SocketAddr {
        self.pilot_addr
    }

    /// The storage log a topic routes to, for tests that poke the log
    /// directly (gap and corruption injection).
    pub fn log_for(&self, namespace: &str, topic: &str) -> LogId {
        self.router.route(namespace, topic).expect("routable topic")
    }

    /// Client options pointed at this cluster, tuned for fast tests:
    /// one worker so every subscription shares a shard.
    pub fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions::new(self.tower_addr);
        options.pilot_addr = Some(self.pilot_addr);
        options.tenant = 102;
        options.msg_loop = fast_loop_options(false);
        options.backoff_initial = Duration::from_millis(50);
        options.backoff_max = Duration::from_millis(500);
        options
    }

    /// Severs every client connection by stopping the tower. Storage is
    /// untouched; `restart_tower` brings the same address back.
    pub async fn stop_tower(&mut self) {
        if let Some(tower) = self.tower.take() {
            tower.stop().await;
        }
    }

    pub async fn restart_tower(&mut self) -> Result<()> {
        let tower = ControlTower::start(
            tower_options(Some(self.tower_addr)),
            Arc::new(self.storage.clone()),
        )
        .await
        .context("restart tower")?;
        self.tower_addr = tower.local_addr().context("tower addr")?;
        self.tower = Some(tower);
        Ok(())
    }

    pub async fn shutdown(mut self) {
        self.stop_tower().await;
        if let Some(pilot) = self.pilot.take() {
            pilot.stop().await;
        }
    }
}

/// What an observer saw, in arrival order.
#[derive(Debug)]
pub enum ObservedEvent {
    Established(u64),
    Message(MessageReceived),
    DataLoss(DataLossInfo),
    Ended(UnsubscribeReason),
}

pub struct CollectingObserver {
    events: mpsc::UnboundedSender<ObservedEvent>,
}

impl Observer for CollectingObserver {
    fn on_message_received(&mut self, message: &MessageReceived) {
        let _ = self.events.send(ObservedEvent::Message(message.clone()));
    }

    fn on_subscription_established(&mut self, start_seqno: u64) {
        let _ = self.events.send(ObservedEvent::Established(start_seqno));
    }

    fn on_data_loss(&mut self, loss: &DataLossInfo) {
        let _ = self.events.send(ObservedEvent::DataLoss(*loss));
    }

    fn on_subscription_ended(&mut self, reason: UnsubscribeReason) {
        let _ = self.events.send(ObservedEvent::Ended(reason));
    }
}

/// An observer that forwards everything onto a channel the test drains.
pub fn collecting_observer() -> (Box<dyn Observer>, mpsc::UnboundedReceiver<ObservedEvent>) {
    let (events, receiver) = mpsc::unbounded_channel();
    (Box::new(CollectingObserver { events }), receiver)
}

/// Waits for the next delivered record, failing on anything else.
pub async fn next_message(
    events: &mut mpsc::UnboundedReceiver<ObservedEvent>,
    deadline: Duration,
) -> Result<MessageReceived> {
    let event = tokio::time::timeout(deadline, events.recv())
        .await
        .context("timed out waiting for a record")?
        .context("observer channel closed")?;
    match event {
        ObservedEvent::Message(message) => Ok(message),
        other => anyhow::bail!("expected a record, observed {other:?}"),
    }
}

/// Waits until the subscription is acknowledged by the tower.
pub async fn wait_established(
    events: &mut mpsc::UnboundedReceiver<ObservedEvent>,
    deadline: Duration,
) -> Result<u64> {
    let event = tokio::time::timeout(deadline, events.recv())
        .await
        .context("timed out waiting for subscription establishment")?
        .context("observer channel closed")?;
    match event {
        ObservedEvent::Established(seqno) => Ok(seqno),
        other => anyhow::bail!("expected establishment, observed {other:?}"),
    }
}
