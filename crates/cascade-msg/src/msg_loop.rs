// Worker pool sharing one listening socket.
//
// Worker 0's listener accepts for the whole pool; connections are handed
// to workers round-robin. Message callbacks are registered before the
// loop starts and shared by every worker.
use cascade_common::{HostId, Status, StreamId, TenantId, GUEST_TENANT};
use cascade_wire::{Message, MessageType};
use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::allocator::StreamIdAllocator;
use crate::event_loop::{run_worker, Command, Event, WorkerCtx};
use crate::flow::Flow;
use crate::{Result, SocketId};

/// Identifies a stream from a worker's point of view: the socket it is
/// multiplexed on plus its on-wire ID. Wire IDs are allocated by the
/// connection initiator and are unique only within one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub socket: SocketId,
    pub stream: StreamId,
}

pub type MessageCallback = Arc<dyn Fn(&mut WorkerCtx, &mut Flow, StreamKey, Message) + Send + Sync>;
pub type TickCallback = Arc<dyn Fn(&mut WorkerCtx, &mut Flow) + Send + Sync>;
pub type UnhealthyCallback = Arc<dyn Fn(&mut WorkerCtx, StreamKey) + Send + Sync>;
pub type WorkerStateFactory = Arc<dyn Fn(usize) -> Box<dyn Any + Send> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MsgLoopOptions {
    /// Listen address; `None` for client-only loops.
    pub listen_addr: Option<SocketAddr>,
    pub num_workers: usize,
    /// Bound on each worker's inbound event queue.
    pub command_queue_size: usize,
    /// High watermark (in frames) of each socket's send queue.
    pub send_queue_size: usize,
    pub max_frame_bytes: usize,
    pub heartbeat_interval: Duration,
    /// A stream missing heartbeats for this long is reported unhealthy.
    pub stream_timeout: Duration,
    pub tick_interval: Duration,
    pub connect_timeout: Duration,
    /// Tenant stamped on socket-level messages (heartbeats, goodbyes).
    pub tenant: TenantId,
    /// Identity announced on outbound streams. The derived client ID
    /// (`hostname:port` plus a per-worker byte) labels this endpoint in
    /// peer logs.
    pub host_id: Option<HostId>,
}

impl Default for MsgLoopOptions {
    fn default() -> Self {
        Self {
            listen_addr: None,
            num_workers: 1,
            command_queue_size: 1024,
            send_queue_size: 1024,
            max_frame_bytes: 16 * 1024 * 1024,
            heartbeat_interval: Duration::from_secs(1),
            stream_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(5),
            tenant: GUEST_TENANT,
            host_id: None,
        }
    }
}

pub(crate) struct LoopShared {
    pub options: MsgLoopOptions,
    pub callbacks: HashMap<MessageType, MessageCallback>,
    pub tick_handler: Option<TickCallback>,
    pub unhealthy_handler: Option<UnhealthyCallback>,
    pub worker_state_factory: Option<WorkerStateFactory>,
    pub allocator: Mutex<StreamIdAllocator>,
    pub next_socket_id: AtomicU64,
    pub workers: Vec<mpsc::Sender<Event>>,
    pub local_addr: Option<SocketAddr>,
}

tokio::task_local! {
    static WORKER_INDEX: usize;
}

/// Index of the worker the current task belongs to, if any.
pub fn current_worker_index() -> Option<usize> {
    WORKER_INDEX.try_with(|index| *index).ok()
}

/// Builder for a worker pool. Callbacks must be registered before
/// `start`; registration of a duplicate message type is rejected.
pub struct MsgLoop {
    options: MsgLoopOptions,
    callbacks: HashMap<MessageType, MessageCallback>,
    tick_handler: Option<TickCallback>,
    unhealthy_handler: Option<UnhealthyCallback>,
    worker_state_factory: Option<WorkerStateFactory>,
}

impl MsgLoop {
    pub fn new(options: MsgLoopOptions) -> Self {
        Self {
            options,
            callbacks: HashMap::new(),
            tick_handler: None,
            unhealthy_handler: None,
            worker_state_factory: None,
        }
    }

    pub fn register_callback(
        &mut self,
        message_type: MessageType,
        callback: MessageCallback,
    ) -> Result<()> {
        if self.callbacks.contains_key(&message_type) {
            return Err(Status::InvalidArgument(format!(
                "duplicate callback for {message_type:?}"
            )));
        }
        self.callbacks.insert(message_type, callback);
        Ok(())
    }

    /// Installs a handler invoked on every worker tick.
    pub fn set_tick_handler(&mut self, handler: TickCallback) {
        self.tick_handler = Some(handler);
    }

    /// Installs the receiver for stream-unhealthy notifications.
    pub fn set_unhealthy_handler(&mut self, handler: UnhealthyCallback) {
        self.unhealthy_handler = Some(handler);
    }

    /// Installs a factory producing per-worker state, retrievable inside
    /// callbacks through [`WorkerCtx::state_mut`].
    pub fn set_worker_state_factory(&mut self, factory: WorkerStateFactory) {
        self.worker_state_factory = Some(factory);
    }

    /// Binds the listener (when configured), spawns the workers and the
    /// accept distributor, and returns a handle for interacting with the
    /// running loop.
    pub async fn start(mut self) -> Result<MsgLoopHandle> {
        if self.options.num_workers == 0 {
            return Err(Status::InvalidArgument("num_workers must be positive".into()));
        }
        // Default handlers, unless the application overrode them: pings
        // are answered in place and goodbyes are logged.
        self.callbacks
            .entry(MessageType::Ping)
            .or_insert_with(|| {
                Arc::new(|ctx, flow, origin, message| {
                    if let Message::Ping {
                        tenant,
                        ping: cascade_wire::PingKind::Request,
                        cookie,
                    } = message
                    {
                        ctx.write_stream(
                            flow,
                            origin,
                            &Message::Ping {
                                tenant,
                                ping: cascade_wire::PingKind::Response,
                                cookie,
                            },
                        );
                    }
                })
            });
        self.callbacks
            .entry(MessageType::Goodbye)
            .or_insert_with(|| {
                Arc::new(|_ctx, _flow, origin, message| {
                    if let Message::Goodbye { code, .. } = message {
                        tracing::debug!(?origin, ?code, "stream said goodbye");
                    }
                })
            });
        self.callbacks
            .entry(MessageType::Introduction)
            .or_insert_with(|| {
                Arc::new(|_ctx, _flow, origin, _message| {
                    tracing::debug!(?origin, "stream introduced");
                })
            });
        let listener = match self.options.listen_addr {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .map_err(|err| Status::IoError(err.to_string()))?,
            ),
            None => None,
        };
        let local_addr = listener
            .as_ref()
            .map(|listener| listener.local_addr())
            .transpose()
            .map_err(|err| Status::IoError(err.to_string()))?;

        let num_workers = self.options.num_workers;
        let mut senders = Vec::with_capacity(num_workers);
        let mut receivers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (tx, rx) = mpsc::channel(self.options.command_queue_size);
            senders.push(tx);
            receivers.push(rx);
        }

        let shared = Arc::new(LoopShared {
            options: self.options,
            callbacks: self.callbacks,
            tick_handler: self.tick_handler,
            unhealthy_handler: self.unhealthy_handler,
            worker_state_factory: self.worker_state_factory,
            allocator: Mutex::new(StreamIdAllocator::new(num_workers)),
            next_socket_id: AtomicU64::new(1),
            workers: senders.clone(),
            local_addr,
        });

        let mut tasks = Vec::with_capacity(num_workers + 1);
        for (index, event_rx) in receivers.into_iter().enumerate() {
            let ctx = WorkerCtx::new(index, Arc::clone(&shared), senders[index].clone());
            tasks.push(tokio::spawn(WORKER_INDEX.scope(
                index,
                run_worker(ctx, event_rx),
            )));
        }
        if let Some(listener) = listener {
            tasks.push(tokio::spawn(run_acceptor(listener, senders)));
        }
        tracing::info!(
            workers = num_workers,
            addr = ?local_addr,
            "message loop started"
        );
        Ok(MsgLoopHandle {
            shared,
            tasks: Arc::new(Mutex::new(tasks)),
        })
    }
}

/// Distributes accepted connections across workers round-robin.
async fn run_acceptor(listener: TcpListener, workers: Vec<mpsc::Sender<Event>>) {
    let mut next = 0usize;
    loop {
        match listener.accept().await {
            Ok((tcp, peer)) => {
                let worker = next % workers.len();
                next = next.wrapping_add(1);
                if workers[worker]
                    .send(Event::Accepted { tcp, peer })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Cloneable handle onto a running loop.
#[derive(Clone)]
pub struct MsgLoopHandle {
    shared: Arc<LoopShared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for MsgLoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgLoopHandle").finish_non_exhaustive()
    }
}

impl MsgLoopHandle {
    pub(crate) fn from_shared(shared: Arc<LoopShared>) -> Self {
        Self {
            shared,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Enqueues a command onto a worker's queue, waiting for space.
    pub async fn send_command(&self, worker: usize, command: Command) -> Result<()> {
        self.worker(worker)?
            .send(Event::Command(command))
            .await
            .map_err(|_| Status::ShutdownInProgress)
    }

    /// Enqueues a command without waiting; fails with `Busy` when the
    /// worker's queue is full.
    pub fn try_send_command(&self, worker: usize, command: Command) -> Result<()> {
        match self.worker(worker)?.try_send(Event::Command(command)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Status::Busy),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Status::ShutdownInProgress),
        }
    }

    /// Opens an outbound stream on the given worker, allocating a fresh
    /// stream ID from that worker's partition.
    pub async fn create_outbound_stream(
        &self,
        dest: SocketAddr,
        worker: usize,
        tenant: TenantId,
    ) -> Result<StreamKey> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.send_command(
            worker,
            Box::new(move |ctx, _flow| {
                let _ = reply_tx.send(ctx.open_stream(dest, tenant));
            }),
        )
        .await?;
        reply_rx.await.map_err(|_| Status::Aborted)
    }

    /// Fire-and-forget write to a stream owned by `worker`. Delivery is
    /// best-effort: a full socket drops the message and counts it.
    pub async fn send_to_stream(&self, worker: usize, key: StreamKey, message: Message) -> Result<()> {
        self.send_command(
            worker,
            Box::new(move |ctx, flow| {
                ctx.write_stream(flow, key, &message);
            }),
        )
        .await
    }

    /// Broadcasts a functor to every worker and collects one result per
    /// worker, ordered by worker index.
    pub async fn gather<T, F>(&self, per_worker: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(&mut WorkerCtx) -> T + Send + Sync + 'static,
    {
        let per_worker = Arc::new(per_worker);
        let num_workers = self.num_workers();
        let (tx, mut rx) = mpsc::channel(num_workers);
        for worker in 0..num_workers {
            let per_worker = Arc::clone(&per_worker);
            let tx = tx.clone();
            self.send_command(
                worker,
                Box::new(move |ctx, _flow| {
                    let _ = tx.try_send((worker, per_worker(ctx)));
                }),
            )
            .await?;
        }
        drop(tx);
        let mut results: Vec<Option<T>> = (0..num_workers).map(|_| None).collect();
        while let Some((worker, value)) = rx.recv().await {
            results[worker] = Some(value);
        }
        results
            .into_iter()
            .collect::<Option<Vec<T>>>()
            .ok_or(Status::Aborted)
    }

    /// Stops every worker and the acceptor. In-flight work is dropped.
    pub async fn stop(&self) {
        for worker in &self.shared.workers {
            let _ = worker.send(Event::Shutdown).await;
        }
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("tasks lock");
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    fn worker(&self, worker: usize) -> Result<&mpsc::Sender<Event>> {
        self.shared
            .workers
            .get(worker)
            .ok_or_else(|| Status::InvalidArgument(format!("no worker {worker}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_wire::PingKind;

    #[test]
    fn duplicate_callback_is_rejected() {
        let mut msg_loop = MsgLoop::new(MsgLoopOptions::default());
        let callback: MessageCallback = Arc::new(|_, _, _, _| {});
        msg_loop
            .register_callback(MessageType::Ping, Arc::clone(&callback))
            .expect("first registration");
        let err = msg_loop
            .register_callback(MessageType::Ping, callback)
            .expect_err("duplicate");
        assert!(matches!(err, Status::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let options = MsgLoopOptions {
            num_workers: 0,
            ..Default::default()
        };
        let err = MsgLoop::new(options).start().await.expect_err("workers");
        assert!(matches!(err, Status::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn ping_round_trip_between_two_loops() {
        // Server echoes pings back as responses.
        let mut server = MsgLoop::new(MsgLoopOptions {
            listen_addr: Some("127.0.0.1:0".parse().expect("addr")),
            ..Default::default()
        });
        server
            .register_callback(
                MessageType::Ping,
                Arc::new(|ctx, flow, origin, message| {
                    if let Message::Ping { tenant, cookie, .. } = message {
                        ctx.write_stream(
                            flow,
                            origin,
                            &Message::Ping {
                                tenant,
                                ping: PingKind::Response,
                                cookie,
                            },
                        );
                    }
                }),
            )
            .expect("register");
        let server = server.start().await.expect("server start");
        let addr = server.local_addr().expect("addr");

        let (pong_tx, mut pong_rx) = mpsc::channel::<bytes::Bytes>(1);
        let mut client = MsgLoop::new(MsgLoopOptions::default());
        client
            .register_callback(
                MessageType::Ping,
                Arc::new(move |_ctx, _flow, _origin, message| {
                    if let Message::Ping { ping, cookie, .. } = message {
                        assert_eq!(ping, PingKind::Response);
                        let _ = pong_tx.try_send(cookie);
                    }
                }),
            )
            .expect("register");
        let client = client.start().await.expect("client start");

        let key = client
            .create_outbound_stream(addr, 0, GUEST_TENANT)
            .await
            .expect("open stream");
        client
            .send_to_stream(
                0,
                key,
                Message::Ping {
                    tenant: GUEST_TENANT,
                    ping: PingKind::Request,
                    cookie: bytes::Bytes::from_static(b"hello"),
                },
            )
            .await
            .expect("send");

        let cookie = tokio::time::timeout(Duration::from_secs(5), pong_rx.recv())
            .await
            .expect("timely pong")
            .expect("pong");
        assert_eq!(cookie, bytes::Bytes::from_static(b"hello"));

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn gather_collects_one_result_per_worker() {
        let options = MsgLoopOptions {
            num_workers: 3,
            ..Default::default()
        };
        let handle = MsgLoop::new(options).start().await.expect("start");
        let indices = handle
            .gather(|ctx| ctx.worker_index())
            .await
            .expect("gather");
        assert_eq!(indices, vec![0, 1, 2]);
        handle.stop().await;
    }

    #[tokio::test]
    async fn worker_index_is_task_local() {
        let handle = MsgLoop::new(MsgLoopOptions::default())
            .start()
            .await
            .expect("start");
        let seen = handle
            .gather(|_ctx| current_worker_index())
            .await
            .expect("gather");
        assert_eq!(seen, vec![Some(0)]);
        // Outside the loop there is no worker index.
        assert_eq!(current_worker_index(), None);
        handle.stop().await;
    }
}
