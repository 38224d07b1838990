// Single worker task: owns a set of sockets, drains a bounded event
// queue, and dispatches inbound messages to registered callbacks.
//
// Nothing in here is reachable concurrently from other workers; all
// cross-worker interaction arrives as posted commands.
use cascade_common::{StreamId, TenantId};
use cascade_wire::{encode_frame, GoodbyeCode, Message, MessageType, OriginKind};
use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::flow::Flow;
use crate::msg_loop::{LoopShared, MsgLoopHandle, StreamKey};
use crate::socket::{run_connect, SocketState};
use crate::SocketId;

/// A closure executed on a worker task, with a flow handle for any writes
/// it performs.
pub type Command = Box<dyn FnOnce(&mut WorkerCtx, &mut Flow) + Send>;

pub(crate) enum Event {
    Command(Command),
    Inbound {
        socket: SocketId,
        stream: StreamId,
        message: Message,
    },
    SocketClosed {
        socket: SocketId,
        /// `None` for a clean remote close, otherwise the failure.
        error: Option<String>,
    },
    Connected {
        socket: SocketId,
        tcp: TcpStream,
    },
    ConnectFailed {
        socket: SocketId,
        error: String,
    },
    Accepted {
        tcp: TcpStream,
        peer: SocketAddr,
    },
    Shutdown,
}

/// Per-worker context handed to callbacks and commands.
pub struct WorkerCtx {
    index: usize,
    shared: Arc<LoopShared>,
    event_tx: mpsc::Sender<Event>,
    sockets: HashMap<SocketId, SocketState>,
    outbound_by_dest: HashMap<SocketAddr, SocketId>,
    /// sink socket -> sources paused until the sink drains.
    blocked_sources: HashMap<SocketId, Vec<SocketId>>,
    state: Option<Box<dyn Any + Send>>,
}

impl WorkerCtx {
    pub(crate) fn new(index: usize, shared: Arc<LoopShared>, event_tx: mpsc::Sender<Event>) -> Self {
        let state = shared.worker_state_factory.as_ref().map(|factory| factory(index));
        Self {
            index,
            shared,
            event_tx,
            sockets: HashMap::new(),
            outbound_by_dest: HashMap::new(),
            blocked_sources: HashMap::new(),
            state,
        }
    }

    pub fn worker_index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> MsgLoopHandle {
        MsgLoopHandle::from_shared(Arc::clone(&self.shared))
    }

    /// Per-worker state installed by the loop's state factory.
    pub fn state_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.state.as_mut()?.downcast_mut::<T>()
    }

    /// Temporarily removes the worker state so a handler can hold it
    /// while still writing through the context. Pair with [`put_state`].
    ///
    /// [`put_state`]: WorkerCtx::put_state
    pub fn take_state(&mut self) -> Option<Box<dyn Any + Send>> {
        self.state.take()
    }

    pub fn put_state(&mut self, state: Box<dyn Any + Send>) {
        self.state = Some(state);
    }

    /// Opens an outbound stream to `dest`, reusing the worker's existing
    /// connection to that destination if one is up. The stream ID comes
    /// from this worker's partition of the ID space. An introduction
    /// message is queued ahead of any payload writes.
    pub fn open_stream(&mut self, dest: SocketAddr, tenant: TenantId) -> StreamKey {
        let socket_id = match self.outbound_by_dest.get(&dest) {
            Some(&id) if self.sockets.contains_key(&id) => id,
            _ => self.create_outbound_socket(dest),
        };
        let wire_id = self
            .shared
            .allocator
            .lock()
            .expect("stream allocator lock")
            .allocate(self.index);
        let key = StreamKey {
            socket: socket_id,
            stream: wire_id,
        };
        let client_properties = match &self.shared.options.host_id {
            Some(host) => vec![(
                "client_id".to_string(),
                host.client_id(self.index as u8),
            )],
            None => Vec::new(),
        };
        let socket = self.sockets.get_mut(&socket_id).expect("socket just ensured");
        socket.register_stream(wire_id);
        let introduction = Message::Introduction {
            tenant,
            stream_properties: Vec::new(),
            client_properties,
        };
        socket.enqueue_frame(encode_frame(wire_id, &introduction));
        tracing::debug!(worker = self.index, socket = socket_id, stream = wire_id, %dest, "opened stream");
        key
    }

    /// Writes a message to a stream. Returns `true` iff the socket still
    /// has send capacity; on `false` the flow records the full sink and
    /// the caller must stop until the sink drains. Writing to a stream
    /// that is already closed silently discards the message.
    pub fn write_stream(&mut self, flow: &mut Flow, key: StreamKey, message: &Message) -> bool {
        let Some(socket) = self.sockets.get_mut(&key.socket) else {
            metrics::counter!("msg_writes_dropped").increment(1);
            return true;
        };
        if !socket.streams.contains(&key.stream) {
            metrics::counter!("msg_writes_dropped").increment(1);
            return true;
        }
        let has_room = socket.enqueue_frame(encode_frame(key.stream, message));
        if !has_room {
            flow.note_full(key.socket);
        }
        if matches!(message, Message::Goodbye { .. }) {
            // After sending a goodbye the stream is retired both ways.
            self.retire_stream(key);
        }
        has_room
    }

    /// Sends a goodbye on the stream and retires it.
    pub fn close_stream(&mut self, flow: &mut Flow, key: StreamKey, code: GoodbyeCode) {
        let origin = match self.sockets.get(&key.socket) {
            Some(socket) if socket.is_inbound => OriginKind::Server,
            _ => OriginKind::Client,
        };
        let goodbye = Message::Goodbye {
            tenant: self.shared.options.tenant,
            code,
            origin,
        };
        self.write_stream(flow, key, &goodbye);
    }

    fn retire_stream(&mut self, key: StreamKey) {
        if let Some(socket) = self.sockets.get_mut(&key.socket) {
            socket.remove_stream(key.stream);
        }
    }

    fn create_outbound_socket(&mut self, dest: SocketAddr) -> SocketId {
        let id = self.shared.next_socket_id.fetch_add(1, Ordering::Relaxed);
        let socket = SocketState::new(id, Some(dest), false, self.shared.options.send_queue_size);
        self.sockets.insert(id, socket);
        self.outbound_by_dest.insert(dest, id);
        tokio::spawn(run_connect(
            id,
            dest,
            self.shared.options.connect_timeout,
            self.event_tx.clone(),
        ));
        id
    }

    pub(crate) fn handle_event(&mut self, event: Event) {
        match event {
            Event::Command(command) => {
                let mut flow = Flow::new();
                command(self, &mut flow);
                // Commands have no readable source to pause; posted work
                // is already bounded by the command queue itself.
            }
            Event::Inbound {
                socket,
                stream,
                message,
            } => self.handle_inbound(socket, stream, message),
            Event::SocketClosed { socket, error } => {
                if let Some(error) = &error {
                    tracing::warn!(worker = self.index, socket, error, "socket failed");
                } else {
                    tracing::debug!(worker = self.index, socket, "socket closed by peer");
                }
                self.close_socket(socket);
            }
            Event::Connected { socket, tcp } => {
                if let Some(state) = self.sockets.get_mut(&socket) {
                    tracing::debug!(worker = self.index, socket, "outbound socket connected");
                    state.attach(tcp, self.event_tx.clone(), self.shared.options.max_frame_bytes);
                }
            }
            Event::ConnectFailed { socket, error } => {
                tracing::warn!(worker = self.index, socket, error, "connect failed");
                self.close_socket(socket);
            }
            Event::Accepted { tcp, peer } => {
                let id = self.shared.next_socket_id.fetch_add(1, Ordering::Relaxed);
                let mut socket = SocketState::new(id, None, true, self.shared.options.send_queue_size);
                socket.attach(tcp, self.event_tx.clone(), self.shared.options.max_frame_bytes);
                self.sockets.insert(id, socket);
                tracing::debug!(worker = self.index, socket = id, %peer, "accepted connection");
            }
            Event::Shutdown => unreachable!("shutdown handled by the run loop"),
        }
    }

    fn handle_inbound(&mut self, socket_id: SocketId, stream: StreamId, message: Message) {
        let Some(socket) = self.sockets.get_mut(&socket_id) else {
            return;
        };
        match message.message_type() {
            MessageType::Heartbeat | MessageType::HeartbeatDelta => {
                // Heartbeats are socket-scoped and never reach callbacks.
                socket.apply_heartbeat(&message);
                return;
            }
            MessageType::Introduction => {
                socket.register_stream(stream);
                let key = StreamKey {
                    socket: socket_id,
                    stream,
                };
                self.dispatch(Some(socket_id), key, message);
                return;
            }
            MessageType::Goodbye => {
                socket.remove_stream(stream);
                let key = StreamKey {
                    socket: socket_id,
                    stream,
                };
                self.dispatch(Some(socket_id), key, message);
                return;
            }
            _ => {}
        }
        // Streams are created on inbound accept: the first message on an
        // unknown wire ID registers the stream.
        socket.register_stream(stream);
        let key = StreamKey {
            socket: socket_id,
            stream,
        };
        self.dispatch(Some(socket_id), key, message);
    }

    fn dispatch(&mut self, source: Option<SocketId>, key: StreamKey, message: Message) {
        metrics::counter!(
            "msg_messages_received",
            "type" => format!("{:?}", message.message_type())
        )
        .increment(1);
        let Some(callback) = self.shared.callbacks.get(&message.message_type()).cloned() else {
            tracing::warn!(
                worker = self.index,
                message_type = ?message.message_type(),
                "no registered callback, dropping message"
            );
            return;
        };
        let mut flow = Flow::new();
        callback(self, &mut flow, key, message);
        if let Some(source) = source {
            for sink in flow.take_full_sinks() {
                // Stop reading the source until the sink drains.
                self.blocked_sources.entry(sink).or_default().push(source);
                if let Some(socket) = self.sockets.get_mut(&source) {
                    socket.set_read_enabled(false);
                }
            }
        }
    }

    pub(crate) fn handle_tick(&mut self) {
        let heartbeat_interval = self.shared.options.heartbeat_interval;
        let stream_timeout = self.shared.options.stream_timeout;
        let tenant = self.shared.options.tenant;

        let mut drained = Vec::new();
        let mut unhealthy = Vec::new();
        for (&id, socket) in &mut self.sockets {
            if socket.poll_writable() {
                drained.push(id);
            }
            if let Some(heartbeat) = socket.heartbeat_due(heartbeat_interval, tenant) {
                socket.enqueue_frame(encode_frame(crate::socket::SOCKET_SCOPE_STREAM, &heartbeat));
            }
            for stream in socket.expired_streams(stream_timeout) {
                unhealthy.push(StreamKey { socket: id, stream });
            }
        }
        for sink in drained {
            self.resume_sources(sink);
        }
        if let Some(handler) = self.shared.unhealthy_handler.clone() {
            for key in unhealthy {
                metrics::counter!("msg_stream_unhealthy").increment(1);
                handler(self, key);
            }
        }
        if let Some(handler) = self.shared.tick_handler.clone() {
            let mut flow = Flow::new();
            handler(self, &mut flow);
        }
    }

    fn resume_sources(&mut self, sink: SocketId) {
        let Some(sources) = self.blocked_sources.remove(&sink) else {
            return;
        };
        for source in sources {
            if let Some(socket) = self.sockets.get_mut(&source) {
                socket.set_read_enabled(true);
            }
        }
    }

    /// Closes a socket: every local stream receives a synthesized goodbye
    /// (no wire traffic, the socket is gone), then the send queue is
    /// discarded and both IO tasks stop.
    fn close_socket(&mut self, socket_id: SocketId) {
        let Some(socket) = self.sockets.remove(&socket_id) else {
            return;
        };
        if let Some(dest) = socket.dest {
            self.outbound_by_dest.remove(&dest);
        }
        self.blocked_sources.remove(&socket_id);
        let origin = if socket.is_inbound {
            OriginKind::Client
        } else {
            OriginKind::Server
        };
        let streams: Vec<StreamId> = socket.streams.iter().copied().collect();
        drop(socket);
        for stream in streams {
            let goodbye = Message::Goodbye {
                tenant: self.shared.options.tenant,
                code: GoodbyeCode::SocketError,
                origin,
            };
            let key = StreamKey {
                socket: socket_id,
                stream,
            };
            self.dispatch(None, key, goodbye);
        }
    }

    pub(crate) fn shutdown(&mut self) {
        let ids: Vec<SocketId> = self.sockets.keys().copied().collect();
        for id in ids {
            self.close_socket(id);
        }
    }
}

pub(crate) async fn run_worker(mut ctx: WorkerCtx, mut event_rx: mpsc::Receiver<Event>) {
    let mut tick = tokio::time::interval(ctx.shared.options.tick_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(Event::Shutdown) | None => break,
                Some(event) => ctx.handle_event(event),
            },
            _ = tick.tick() => ctx.handle_tick(),
        }
    }
    ctx.shutdown();
}
