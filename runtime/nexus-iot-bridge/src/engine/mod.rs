//! Event loop.
//!
//! This module provides the process-wide [`EventLoop`]: the OS-side
//! registry of handles and in-flight requests, the timer queue, and the
//! completion channel fed by the worker pool. It knows nothing about
//! script values; each handle and request record carries a user-data slot
//! holding the [`WrapId`] of the wrap that owns it, and the runtime turns
//! loop output into wrap callbacks.
//!
//! One iteration runs in the usual phases: expired timers, then pending
//! and I/O completions, then close callbacks.

pub mod fs;
pub(crate) mod net;
pub mod pool;
pub(crate) mod timers;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::arena::WrapId;
use crate::config::RuntimeConfig;
use crate::error::{status, Result};
use fs::{FileStat, FileTable, FsOp};
use net::{DatagramOp, DatagramSender, StreamOp, StreamSender};
use pool::WorkPool;
use timers::TimerQueue;

/// Identifier of an OS-level handle owned by the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OsHandleId(pub(crate) u64);

impl fmt::Display for OsHandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Identifier of an OS-level request in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OsRequestId(pub(crate) u64);

impl fmt::Display for OsRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Resource type of an OS handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleKind {
    /// Timer
    Timer,
    /// TCP stream
    Tcp,
    /// UDP socket
    Udp,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Timer => write!(f, "timer"),
            HandleKind::Tcp => write!(f, "tcp"),
            HandleKind::Udp => write!(f, "udp"),
        }
    }
}

/// Result data reported by a finished request
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionPayload {
    /// Status only
    None,
    /// Newly opened descriptor
    Fd(i32),
    /// Byte count
    Count(usize),
    /// Bytes read
    Data(Vec<u8>),
    /// File metadata
    Stat(FileStat),
    /// Directory entry names
    Entries(Vec<String>),
    /// Resolved address
    Address {
        /// Textual address
        address: String,
        /// 4 or 6
        family: u8,
    },
    /// Result of queued work
    Json(serde_json::Value),
}

/// Event on a stream handle
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incoming bytes
    Data(Vec<u8>),
    /// Peer closed its side
    Eof,
    /// Read failure
    Error(i32),
}

/// Event on a datagram handle
#[derive(Debug, Clone, PartialEq)]
pub enum DatagramEvent {
    /// Incoming message
    Message {
        /// Payload
        data: Vec<u8>,
        /// Sender
        from: SocketAddr,
    },
    /// Receive failure
    Error(i32),
}

/// Message delivered to the loop thread
#[derive(Debug)]
pub enum LoopEvent {
    /// A request finished
    Completed {
        /// The request
        req: OsRequestId,
        /// Zero or a negative status
        status: i32,
        /// Kind-specific data
        payload: CompletionPayload,
    },
    /// A stream handle produced data
    Stream {
        /// The handle
        handle: OsHandleId,
        /// What happened
        event: StreamEvent,
    },
    /// A datagram handle produced data
    Datagram {
        /// The handle
        handle: OsHandleId,
        /// What happened
        event: DatagramEvent,
    },
    /// The OS confirmed a handle is fully closed
    Closed {
        /// The handle
        handle: OsHandleId,
    },
}

/// Whether an iteration may block waiting for I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Wait for the next timer or completion
    Block,
    /// Only take what is already available
    NoWait,
}

enum Backend {
    Timer,
    Stream(StreamSender),
    Datagram(Option<DatagramSender>),
}

struct HandleRecord {
    kind: HandleKind,
    data: Option<WrapId>,
    active: bool,
    referenced: bool,
    closing: bool,
    local_addr: Option<SocketAddr>,
    backend: Backend,
}

struct LoopInner {
    handles: HashMap<OsHandleId, HandleRecord>,
    requests: HashMap<OsRequestId, WrapId>,
    timers: TimerQueue,
    pending: VecDeque<LoopEvent>,
    closing: VecDeque<OsHandleId>,
    next_handle: u64,
    next_request: u64,
    iterations: u64,
}

impl LoopInner {
    fn alloc_handle(&mut self, kind: HandleKind, backend: Backend) -> OsHandleId {
        self.next_handle += 1;
        let id = OsHandleId(self.next_handle);
        self.handles.insert(
            id,
            HandleRecord {
                kind,
                data: None,
                active: false,
                referenced: true,
                closing: false,
                local_addr: None,
                backend,
            },
        );
        id
    }

    fn open_record(&mut self, handle: OsHandleId) -> std::result::Result<&mut HandleRecord, i32> {
        match self.handles.get_mut(&handle) {
            Some(record) if !record.closing => Ok(record),
            Some(_) => Err(status::EINVAL),
            None => Err(status::EBADF),
        }
    }

    fn has_alive_handles(&self) -> bool {
        self.handles
            .values()
            .any(|h| h.closing || (h.active && h.referenced))
    }
}

/// The process-wide event loop
pub struct EventLoop {
    inner: RefCell<LoopInner>,
    sender: Sender<LoopEvent>,
    receiver: Receiver<LoopEvent>,
    pool: WorkPool,
    files: std::sync::Arc<FileTable>,
    read_size: usize,
    time_origin: Instant,
}

impl EventLoop {
    /// Create a loop with its worker pool
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let pool = WorkPool::new(config)?;
        let (sender, receiver) = crossbeam_channel::unbounded();

        info!(
            threads = config.thread_pool_size,
            read_size = config.stream_read_size,
            "Initializing event loop"
        );

        Ok(Self {
            inner: RefCell::new(LoopInner {
                handles: HashMap::new(),
                requests: HashMap::new(),
                timers: TimerQueue::new(),
                pending: VecDeque::new(),
                closing: VecDeque::new(),
                next_handle: 0,
                next_request: 0,
                iterations: 0,
            }),
            sender,
            receiver,
            pool,
            files: std::sync::Arc::new(FileTable::new()),
            read_size: config.stream_read_size,
            time_origin: Instant::now(),
        })
    }

    /// Milliseconds since the loop was created
    pub fn now_ms(&self) -> u64 {
        self.time_origin.elapsed().as_millis() as u64
    }

    /// The worker pool
    pub fn pool(&self) -> &WorkPool {
        &self.pool
    }

    /// Descriptor table used by filesystem requests
    pub fn files(&self) -> &FileTable {
        &self.files
    }

    // ---- handles ----

    /// Register a timer handle
    pub fn timer_init(&self) -> OsHandleId {
        self.inner.borrow_mut().alloc_handle(HandleKind::Timer, Backend::Timer)
    }

    /// Arm a timer
    pub fn timer_start(&self, handle: OsHandleId, timeout_ms: u64, repeat_ms: u64) -> i32 {
        let now = self.now_ms();
        let mut inner = self.inner.borrow_mut();
        match inner.open_record(handle) {
            Ok(record) if record.kind == HandleKind::Timer => record.active = true,
            Ok(_) => return status::EINVAL,
            Err(code) => return code,
        }
        inner.timers.start(handle, now, timeout_ms, repeat_ms);
        status::OK
    }

    /// Disarm a timer
    pub fn timer_stop(&self, handle: OsHandleId) -> i32 {
        let mut inner = self.inner.borrow_mut();
        match inner.handles.get_mut(&handle) {
            Some(record) => record.active = false,
            None => return status::EBADF,
        }
        inner.timers.stop(handle);
        status::OK
    }

    /// Register a TCP handle and start its driver
    pub fn tcp_init(&self) -> std::result::Result<OsHandleId, i32> {
        let mut inner = self.inner.borrow_mut();
        let id = OsHandleId(inner.next_handle + 1);
        let ops = net::spawn_stream(&self.pool, id, self.sender.clone(), self.read_size)?;
        Ok(inner.alloc_handle(HandleKind::Tcp, Backend::Stream(ops)))
    }

    fn stream_op(&self, handle: OsHandleId, op: StreamOp) -> i32 {
        let mut inner = self.inner.borrow_mut();
        let record = match inner.open_record(handle) {
            Ok(record) => record,
            Err(code) => return code,
        };
        match &record.backend {
            Backend::Stream(ops) => match ops.send(op) {
                Ok(()) => status::OK,
                Err(_) => status::ECANCELED,
            },
            _ => status::EINVAL,
        }
    }

    /// Queue a connect on a TCP handle
    pub fn tcp_connect(&self, handle: OsHandleId, addr: SocketAddr, req: OsRequestId) -> i32 {
        self.stream_op(handle, StreamOp::Connect { addr, req })
    }

    /// Queue a write on a TCP handle
    pub fn tcp_write(&self, handle: OsHandleId, data: Vec<u8>, req: OsRequestId) -> i32 {
        self.stream_op(handle, StreamOp::Write { data, req })
    }

    /// Queue a write-side shutdown on a TCP handle
    pub fn tcp_shutdown(&self, handle: OsHandleId, req: OsRequestId) -> i32 {
        self.stream_op(handle, StreamOp::Shutdown { req })
    }

    /// Start delivering incoming stream data
    pub fn read_start(&self, handle: OsHandleId) -> i32 {
        let code = self.stream_op(handle, StreamOp::ReadStart);
        if code == status::OK {
            self.set_active(handle, true);
        }
        code
    }

    /// Stop delivering incoming stream data
    pub fn read_stop(&self, handle: OsHandleId) -> i32 {
        let code = self.stream_op(handle, StreamOp::ReadStop);
        if code == status::OK {
            self.set_active(handle, false);
        }
        code
    }

    /// Register a UDP handle. The socket is created on bind.
    pub fn udp_init(&self) -> OsHandleId {
        self.inner
            .borrow_mut()
            .alloc_handle(HandleKind::Udp, Backend::Datagram(None))
    }

    /// Bind a UDP handle synchronously
    pub fn udp_bind(&self, handle: OsHandleId, addr: SocketAddr) -> i32 {
        let mut inner = self.inner.borrow_mut();
        let record = match inner.open_record(handle) {
            Ok(record) => record,
            Err(code) => return code,
        };
        match &record.backend {
            Backend::Datagram(None) => {}
            Backend::Datagram(Some(_)) => return status::EINVAL,
            _ => return status::EINVAL,
        }

        let socket = match std::net::UdpSocket::bind(addr) {
            Ok(socket) => socket,
            Err(e) => return status::from_io_error(&e),
        };
        let local_addr = socket.local_addr().ok();
        match net::spawn_datagram(&self.pool, handle, socket, self.sender.clone(), self.read_size) {
            Ok(ops) => {
                record.backend = Backend::Datagram(Some(ops));
                record.local_addr = local_addr;
                status::OK
            }
            Err(code) => code,
        }
    }

    /// Whether a UDP handle has a socket
    pub fn udp_is_bound(&self, handle: OsHandleId) -> bool {
        matches!(
            self.inner.borrow().handles.get(&handle).map(|r| &r.backend),
            Some(Backend::Datagram(Some(_)))
        )
    }

    /// Address a bound UDP handle listens on
    pub fn udp_local_addr(&self, handle: OsHandleId) -> Option<SocketAddr> {
        self.inner.borrow().handles.get(&handle).and_then(|r| r.local_addr)
    }

    fn datagram_op(&self, handle: OsHandleId, op: DatagramOp) -> i32 {
        let mut inner = self.inner.borrow_mut();
        let record = match inner.open_record(handle) {
            Ok(record) => record,
            Err(code) => return code,
        };
        match &record.backend {
            Backend::Datagram(Some(ops)) => match ops.send(op) {
                Ok(()) => status::OK,
                Err(_) => status::ECANCELED,
            },
            Backend::Datagram(None) => status::EBADF,
            _ => status::EINVAL,
        }
    }

    /// Queue a datagram send, binding an ephemeral port first if needed
    pub fn udp_send(
        &self,
        handle: OsHandleId,
        data: Vec<u8>,
        addr: SocketAddr,
        req: OsRequestId,
    ) -> i32 {
        if !self.udp_is_bound(handle) {
            let any: SocketAddr = if addr.is_ipv6() {
                SocketAddr::from(([0u16; 8], 0))
            } else {
                SocketAddr::from(([0u8; 4], 0))
            };
            let code = self.udp_bind(handle, any);
            if code != status::OK {
                return code;
            }
        }
        self.datagram_op(handle, DatagramOp::Send { data, addr, req })
    }

    /// Start delivering incoming datagrams
    pub fn udp_recv_start(&self, handle: OsHandleId) -> i32 {
        let code = self.datagram_op(handle, DatagramOp::RecvStart);
        if code == status::OK {
            self.set_active(handle, true);
        }
        code
    }

    /// Stop delivering incoming datagrams
    pub fn udp_recv_stop(&self, handle: OsHandleId) -> i32 {
        let code = self.datagram_op(handle, DatagramOp::RecvStop);
        if code == status::OK {
            self.set_active(handle, false);
        }
        code
    }

    fn set_active(&self, handle: OsHandleId, active: bool) {
        if let Some(record) = self.inner.borrow_mut().handles.get_mut(&handle) {
            record.active = active;
        }
    }

    /// Store the owning wrap in a handle's user-data slot
    pub fn set_data(&self, handle: OsHandleId, data: Option<WrapId>) {
        if let Some(record) = self.inner.borrow_mut().handles.get_mut(&handle) {
            record.data = data;
        }
    }

    /// Read a handle's user-data slot
    pub fn data(&self, handle: OsHandleId) -> Option<WrapId> {
        self.inner.borrow().handles.get(&handle).and_then(|r| r.data)
    }

    /// Resource type of a handle
    pub fn handle_kind(&self, handle: OsHandleId) -> Option<HandleKind> {
        self.inner.borrow().handles.get(&handle).map(|r| r.kind)
    }

    /// Whether a close has been requested for this handle
    pub fn is_closing(&self, handle: OsHandleId) -> bool {
        self.inner
            .borrow()
            .handles
            .get(&handle)
            .map(|r| r.closing)
            .unwrap_or(false)
    }

    /// Whether the handle is doing work that keeps the loop alive
    pub fn is_active(&self, handle: OsHandleId) -> bool {
        self.inner
            .borrow()
            .handles
            .get(&handle)
            .map(|r| r.active && !r.closing)
            .unwrap_or(false)
    }

    /// Let the handle keep the loop alive (the default)
    pub fn ref_handle(&self, handle: OsHandleId) {
        if let Some(record) = self.inner.borrow_mut().handles.get_mut(&handle) {
            record.referenced = true;
        }
    }

    /// Stop the handle from keeping the loop alive
    pub fn unref_handle(&self, handle: OsHandleId) {
        if let Some(record) = self.inner.borrow_mut().handles.get_mut(&handle) {
            record.referenced = false;
        }
    }

    /// Begin closing a handle. Confirmation arrives in a later close phase.
    /// Closing a handle twice is ignored.
    pub fn close(&self, handle: OsHandleId) {
        let mut inner = self.inner.borrow_mut();
        let Some(record) = inner.handles.get_mut(&handle) else {
            debug!(handle = %handle, "close on unknown handle");
            return;
        };
        if record.closing {
            debug!(handle = %handle, "handle already closing");
            return;
        }
        record.closing = true;
        record.active = false;

        let confirmed_now = match &record.backend {
            Backend::Timer => true,
            Backend::Stream(ops) => ops.send(StreamOp::Close).is_err(),
            Backend::Datagram(Some(ops)) => ops.send(DatagramOp::Close).is_err(),
            Backend::Datagram(None) => true,
        };
        inner.timers.stop(handle);
        if confirmed_now {
            inner.closing.push_back(handle);
        }
        trace!(handle = %handle, confirmed_now, "close requested");
    }

    /// Handles not yet closing, in creation order
    pub fn walk(&self) -> Vec<OsHandleId> {
        let inner = self.inner.borrow();
        let mut ids: Vec<OsHandleId> = inner
            .handles
            .iter()
            .filter(|(_, r)| !r.closing)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Number of registered handles, closing ones included
    pub fn handle_count(&self) -> usize {
        self.inner.borrow().handles.len()
    }

    // ---- requests ----

    /// Register a request; `data` is its user-data slot
    pub fn register_request(&self, data: WrapId) -> OsRequestId {
        let mut inner = self.inner.borrow_mut();
        inner.next_request += 1;
        let id = OsRequestId(inner.next_request);
        inner.requests.insert(id, data);
        id
    }

    /// Remove a request record, returning its user data. Each request can
    /// be taken once.
    pub fn take_request(&self, req: OsRequestId) -> Option<WrapId> {
        self.inner.borrow_mut().requests.remove(&req)
    }

    /// Requests registered and not yet taken
    pub fn active_requests(&self) -> usize {
        self.inner.borrow().requests.len()
    }

    /// Queue an event for the next poll phase
    pub fn post(&self, event: LoopEvent) {
        self.inner.borrow_mut().pending.push_back(event);
    }

    /// Report a request that failed before reaching the OS.
    ///
    /// On a socket handle the failure is queued behind the socket's earlier
    /// requests; otherwise it goes to the pending queue.
    pub fn fail_request(&self, handle: Option<OsHandleId>, req: OsRequestId, code: i32) {
        let routed = {
            let inner = self.inner.borrow();
            match handle.and_then(|h| inner.handles.get(&h)).map(|r| &r.backend) {
                Some(Backend::Stream(ops)) => {
                    Some(ops.send(StreamOp::Fail { req, status: code }).is_ok())
                }
                Some(Backend::Datagram(Some(ops))) => {
                    Some(ops.send(DatagramOp::Fail { req, status: code }).is_ok())
                }
                _ => None,
            }
        };
        let event = LoopEvent::Completed {
            req,
            status: code,
            payload: CompletionPayload::None,
        };
        match routed {
            Some(true) => {}
            // the driver has stopped; its completions are already in the channel
            Some(false) => {
                let _ = self.sender.send(event);
            }
            None => self.post(event),
        }
    }

    /// Run a filesystem request on the pool
    pub fn fs(&self, req: OsRequestId, op: FsOp) -> i32 {
        let files = std::sync::Arc::clone(&self.files);
        let events = self.sender.clone();
        let submitted = self.pool.spawn_blocking(move || {
            let (status, payload) = files.execute(op);
            let _ = events.send(LoopEvent::Completed {
                req,
                status,
                payload,
            });
        });
        match submitted {
            Ok(()) => status::OK,
            Err(code) => code,
        }
    }

    /// Resolve a host name on the pool. `family` is 0, 4 or 6.
    pub fn getaddrinfo(&self, req: OsRequestId, host: String, family: u8) -> i32 {
        let events = self.sender.clone();
        let submitted = self.pool.spawn(async move {
            let (status, payload) = match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(addrs) => {
                    let found = addrs.into_iter().find(|a| match family {
                        4 => a.is_ipv4(),
                        6 => a.is_ipv6(),
                        _ => true,
                    });
                    match found {
                        Some(addr) => (
                            status::OK,
                            CompletionPayload::Address {
                                address: addr.ip().to_string(),
                                family: if addr.is_ipv4() { 4 } else { 6 },
                            },
                        ),
                        None => (status::EAI_NONAME, CompletionPayload::None),
                    }
                }
                Err(e) => {
                    debug!(host = %host, error = %e, "lookup failed");
                    (status::EAI_NONAME, CompletionPayload::None)
                }
            };
            let _ = events.send(LoopEvent::Completed {
                req,
                status,
                payload,
            });
        });
        match submitted {
            Ok(()) => status::OK,
            Err(code) => code,
        }
    }

    /// Run a job on the pool; its value is delivered as a JSON payload
    pub fn queue_work<F>(&self, req: OsRequestId, job: F) -> i32
    where
        F: FnOnce() -> std::result::Result<serde_json::Value, i32> + Send + 'static,
    {
        let events = self.sender.clone();
        let submitted = self.pool.spawn_blocking(move || {
            let (status, payload) = match job() {
                Ok(value) => (status::OK, CompletionPayload::Json(value)),
                Err(code) => (code, CompletionPayload::None),
            };
            let _ = events.send(LoopEvent::Completed {
                req,
                status,
                payload,
            });
        });
        match submitted {
            Ok(()) => status::OK,
            Err(code) => code,
        }
    }

    // ---- phases ----

    /// Timer phase: pop one expired timer
    pub fn pop_expired_timer(&self) -> Option<OsHandleId> {
        let now = self.now_ms();
        let mut inner = self.inner.borrow_mut();
        let handle = inner.timers.pop_expired(now)?;
        if !inner.timers.is_armed(handle) {
            if let Some(record) = inner.handles.get_mut(&handle) {
                record.active = false;
            }
        }
        Some(handle)
    }

    fn accept(&self, event: LoopEvent, ready: &mut Vec<LoopEvent>) {
        match event {
            LoopEvent::Closed { handle } => self.inner.borrow_mut().closing.push_back(handle),
            other => ready.push(other),
        }
    }

    /// How long the poll phase may block
    fn poll_timeout(&self) -> Option<Duration> {
        if !self.is_alive() {
            return Some(Duration::ZERO);
        }
        let inner = self.inner.borrow();
        if !inner.pending.is_empty() || !inner.closing.is_empty() {
            return Some(Duration::ZERO);
        }
        inner
            .timers
            .next_deadline()
            .map(|deadline| Duration::from_millis(deadline.saturating_sub(self.now_ms())))
    }

    /// Poll phase: collect pending and I/O events, blocking in
    /// [`PollMode::Block`] until the next timer deadline or completion.
    pub fn poll_io(&self, mode: PollMode) -> Vec<LoopEvent> {
        let mut ready: Vec<LoopEvent> = self.inner.borrow_mut().pending.drain(..).collect();

        if ready.is_empty() && mode == PollMode::Block {
            let first = match self.poll_timeout() {
                Some(timeout) if timeout.is_zero() => None,
                Some(timeout) => match self.receiver.recv_timeout(timeout) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => None,
                },
                None => self.receiver.recv().ok(),
            };
            if let Some(event) = first {
                self.accept(event, &mut ready);
            }
        }

        while let Ok(event) = self.receiver.try_recv() {
            self.accept(event, &mut ready);
        }
        ready
    }

    /// Close phase: handles whose close the OS has confirmed
    pub fn take_closed(&self) -> Vec<OsHandleId> {
        self.inner.borrow_mut().closing.drain(..).collect()
    }

    /// Drop a closed handle's record, returning its user data
    pub fn finish_close(&self, handle: OsHandleId) -> Option<WrapId> {
        let record = self.inner.borrow_mut().handles.remove(&handle)?;
        if !record.closing {
            warn!(handle = %handle, "finishing close of a handle that was never closed");
        }
        record.data
    }

    /// Count one full iteration
    pub fn record_iteration(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        inner.iterations += 1;
        inner.iterations
    }

    /// Whether any referenced active handle, closing handle, in-flight
    /// request or queued event remains
    pub fn is_alive(&self) -> bool {
        let inner = self.inner.borrow();
        inner.has_alive_handles()
            || !inner.requests.is_empty()
            || !inner.pending.is_empty()
            || !inner.closing.is_empty()
    }

    /// Stop the worker pool; called once every handle has closed
    pub fn shutdown(&self) {
        let inner = self.inner.borrow();
        if !inner.handles.is_empty() || !inner.requests.is_empty() {
            warn!(
                handles = inner.handles.len(),
                requests = inner.requests.len(),
                "Shutting down loop with live resources"
            );
        }
        drop(inner);
        self.pool.shutdown();
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("EventLoop")
            .field("handles", &inner.handles.len())
            .field("requests", &inner.requests.len())
            .field("iterations", &inner.iterations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_loop() -> EventLoop {
        EventLoop::new(&RuntimeConfig::default().with_thread_pool_size(2)).unwrap()
    }

    #[test]
    fn test_empty_loop_is_not_alive() {
        let lp = create_loop();
        assert!(!lp.is_alive());
        assert!(lp.poll_io(PollMode::Block).is_empty());
    }

    #[test]
    fn test_timer_keeps_loop_alive_until_fired() {
        let lp = create_loop();
        let timer = lp.timer_init();
        assert!(!lp.is_alive());

        assert_eq!(lp.timer_start(timer, 1, 0), status::OK);
        assert!(lp.is_alive());
        assert!(lp.is_active(timer));

        // blocks until the deadline
        assert!(lp.poll_io(PollMode::Block).is_empty());
        assert_eq!(lp.pop_expired_timer(), Some(timer));
        assert!(!lp.is_active(timer));
        assert!(!lp.is_alive());
    }

    #[test]
    fn test_unref_timer_does_not_keep_loop_alive() {
        let lp = create_loop();
        let timer = lp.timer_init();
        lp.timer_start(timer, 1000, 0);
        lp.unref_handle(timer);
        assert!(!lp.is_alive());
        lp.ref_handle(timer);
        assert!(lp.is_alive());
    }

    #[test]
    fn test_timer_close_is_confirmed_in_close_phase() {
        let lp = create_loop();
        let timer = lp.timer_init();
        lp.set_data(timer, Some(WrapId::new(0, 0)));
        lp.timer_start(timer, 1000, 0);

        lp.close(timer);
        lp.close(timer);
        assert!(lp.is_closing(timer));
        assert_eq!(lp.timer_start(timer, 1, 0), status::EINVAL);

        assert_eq!(lp.take_closed(), vec![timer]);
        assert_eq!(lp.finish_close(timer), Some(WrapId::new(0, 0)));
        assert_eq!(lp.handle_count(), 0);
        assert!(!lp.is_alive());
    }

    #[test]
    fn test_request_user_data_taken_once() {
        let lp = create_loop();
        let req = lp.register_request(WrapId::new(4, 2));
        assert!(lp.is_alive());
        assert_eq!(lp.take_request(req), Some(WrapId::new(4, 2)));
        assert_eq!(lp.take_request(req), None);
        assert!(!lp.is_alive());
    }

    #[test]
    fn test_posted_event_is_polled() {
        let lp = create_loop();
        let req = lp.register_request(WrapId::new(0, 0));
        lp.post(LoopEvent::Completed {
            req,
            status: status::EINVAL,
            payload: CompletionPayload::None,
        });
        let events = lp.poll_io(PollMode::Block);
        assert!(matches!(
            events.as_slice(),
            [LoopEvent::Completed { status: status::EINVAL, .. }]
        ));
    }

    #[test]
    fn test_queue_work_completion() {
        let lp = create_loop();
        let req = lp.register_request(WrapId::new(0, 0));
        assert_eq!(lp.queue_work(req, || Ok(serde_json::json!(7))), status::OK);

        let events = lp.poll_io(PollMode::Block);
        match events.as_slice() {
            [LoopEvent::Completed { req: done, status: code, payload }] => {
                assert_eq!(*done, req);
                assert_eq!(*code, status::OK);
                assert_eq!(payload, &CompletionPayload::Json(serde_json::json!(7)));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_walk_skips_closing() {
        let lp = create_loop();
        let a = lp.timer_init();
        let b = lp.udp_init();
        lp.close(a);
        assert_eq!(lp.walk(), vec![b]);
        assert_eq!(lp.handle_kind(b), Some(HandleKind::Udp));
    }
}
