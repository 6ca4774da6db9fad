//! Socket drivers.
//!
//! Each TCP or UDP handle owns one driver task on the worker pool. The
//! loop thread feeds it operations over an unbounded channel; the driver
//! executes them strictly in order and reports each outcome as a
//! [`LoopEvent`]. A separate pump task reads incoming data while reading
//! is enabled.
//!
//! Requests that fail before reaching the socket are queued as `Fail`
//! ops so their completions stay behind the handle's earlier requests.

use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_channel::Sender;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use super::pool::WorkPool;
use super::{CompletionPayload, DatagramEvent, LoopEvent, OsHandleId, OsRequestId, StreamEvent};
use crate::error::status;

/// Operations accepted by a stream driver
#[derive(Debug)]
pub(crate) enum StreamOp {
    Connect { addr: SocketAddr, req: OsRequestId },
    Write { data: Vec<u8>, req: OsRequestId },
    Shutdown { req: OsRequestId },
    Fail { req: OsRequestId, status: i32 },
    ReadStart,
    ReadStop,
    Close,
}

/// Operations accepted by a datagram driver
#[derive(Debug)]
pub(crate) enum DatagramOp {
    Send {
        data: Vec<u8>,
        addr: SocketAddr,
        req: OsRequestId,
    },
    Fail {
        req: OsRequestId,
        status: i32,
    },
    RecvStart,
    RecvStop,
    Close,
}

pub(crate) type StreamSender = mpsc::UnboundedSender<StreamOp>;
pub(crate) type DatagramSender = mpsc::UnboundedSender<DatagramOp>;

fn complete(events: &Sender<LoopEvent>, req: OsRequestId, status: i32) {
    let _ = events.send(LoopEvent::Completed {
        req,
        status,
        payload: CompletionPayload::None,
    });
}

/// Start the driver task for a TCP handle
pub(crate) fn spawn_stream(
    pool: &WorkPool,
    handle: OsHandleId,
    events: Sender<LoopEvent>,
    read_size: usize,
) -> Result<StreamSender, i32> {
    let (tx, rx) = mpsc::unbounded_channel();
    pool.spawn(run_stream(handle, rx, events, read_size))?;
    Ok(tx)
}

async fn run_stream(
    handle: OsHandleId,
    mut ops: mpsc::UnboundedReceiver<StreamOp>,
    events: Sender<LoopEvent>,
    read_size: usize,
) {
    let mut writer: Option<OwnedWriteHalf> = None;
    let mut pump = None;
    let (reading_tx, reading_rx) = watch::channel(false);

    while let Some(op) = ops.recv().await {
        match op {
            StreamOp::Connect { addr, req } => {
                if writer.is_some() {
                    complete(&events, req, status::EINVAL);
                    continue;
                }
                let status = match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        let (read_half, write_half) = stream.into_split();
                        writer = Some(write_half);
                        pump = Some(tokio::spawn(read_pump(
                            handle,
                            read_half,
                            reading_rx.clone(),
                            events.clone(),
                            read_size,
                        )));
                        status::OK
                    }
                    Err(e) => status::from_io_error(&e),
                };
                debug!(handle = %handle, %addr, status, "connect finished");
                complete(&events, req, status);
            }
            StreamOp::Write { data, req } => {
                let status = match writer.as_mut() {
                    Some(w) => match w.write_all(&data).await {
                        Ok(()) => status::OK,
                        Err(e) => status::from_io_error(&e),
                    },
                    None => status::ENOTCONN,
                };
                trace!(handle = %handle, bytes = data.len(), status, "write finished");
                complete(&events, req, status);
            }
            StreamOp::Shutdown { req } => {
                let status = match writer.as_mut() {
                    Some(w) => match w.shutdown().await {
                        Ok(()) => status::OK,
                        Err(e) => status::from_io_error(&e),
                    },
                    None => status::ENOTCONN,
                };
                complete(&events, req, status);
            }
            StreamOp::Fail { req, status } => complete(&events, req, status),
            StreamOp::ReadStart => {
                reading_tx.send_replace(true);
            }
            StreamOp::ReadStop => {
                reading_tx.send_replace(false);
            }
            StreamOp::Close => break,
        }
    }

    ops.close();
    while let Some(op) = ops.recv().await {
        match op {
            StreamOp::Fail { req, status } => complete(&events, req, status),
            StreamOp::Connect { req, .. }
            | StreamOp::Write { req, .. }
            | StreamOp::Shutdown { req } => complete(&events, req, status::ECANCELED),
            _ => {}
        }
    }

    drop(writer);
    drop(reading_tx);
    if let Some(pump) = pump {
        pump.abort();
    }
    debug!(handle = %handle, "stream driver closed");
    let _ = events.send(LoopEvent::Closed { handle });
}

async fn read_pump(
    handle: OsHandleId,
    mut reader: OwnedReadHalf,
    mut reading: watch::Receiver<bool>,
    events: Sender<LoopEvent>,
    read_size: usize,
) {
    loop {
        if !*reading.borrow_and_update() {
            if reading.changed().await.is_err() {
                return;
            }
            continue;
        }

        let mut buf = vec![0u8; read_size];
        tokio::select! {
            changed = reading.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            read = reader.read(&mut buf) => {
                let event = match read {
                    Ok(0) => StreamEvent::Eof,
                    Ok(n) => {
                        buf.truncate(n);
                        StreamEvent::Data(buf)
                    }
                    Err(e) => StreamEvent::Error(status::from_io_error(&e)),
                };
                let done = !matches!(event, StreamEvent::Data(_));
                let _ = events.send(LoopEvent::Stream { handle, event });
                if done {
                    return;
                }
            }
        }
    }
}

/// Start the driver task for a bound UDP socket
pub(crate) fn spawn_datagram(
    pool: &WorkPool,
    handle: OsHandleId,
    socket: std::net::UdpSocket,
    events: Sender<LoopEvent>,
    read_size: usize,
) -> Result<DatagramSender, i32> {
    socket
        .set_nonblocking(true)
        .map_err(|e| status::from_io_error(&e))?;
    let (tx, rx) = mpsc::unbounded_channel();
    pool.spawn(run_datagram(handle, socket, rx, events, read_size))?;
    Ok(tx)
}

async fn run_datagram(
    handle: OsHandleId,
    socket: std::net::UdpSocket,
    mut ops: mpsc::UnboundedReceiver<DatagramOp>,
    events: Sender<LoopEvent>,
    read_size: usize,
) {
    let socket = match UdpSocket::from_std(socket) {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            let code = status::from_io_error(&e);
            // Fail every queued send, then report the close once asked.
            while let Some(op) = ops.recv().await {
                match op {
                    DatagramOp::Send { req, .. } => complete(&events, req, code),
                    DatagramOp::Fail { req, status } => complete(&events, req, status),
                    DatagramOp::Close => ops.close(),
                    _ => {}
                }
            }
            let _ = events.send(LoopEvent::Closed { handle });
            return;
        }
    };

    let (receiving_tx, receiving_rx) = watch::channel(false);
    let pump = tokio::spawn(recv_pump(
        handle,
        Arc::clone(&socket),
        receiving_rx,
        events.clone(),
        read_size,
    ));

    while let Some(op) = ops.recv().await {
        match op {
            DatagramOp::Send { data, addr, req } => {
                let status = match socket.send_to(&data, addr).await {
                    Ok(_) => status::OK,
                    Err(e) => status::from_io_error(&e),
                };
                trace!(handle = %handle, %addr, bytes = data.len(), status, "send finished");
                complete(&events, req, status);
            }
            DatagramOp::Fail { req, status } => complete(&events, req, status),
            DatagramOp::RecvStart => {
                receiving_tx.send_replace(true);
            }
            DatagramOp::RecvStop => {
                receiving_tx.send_replace(false);
            }
            DatagramOp::Close => break,
        }
    }

    ops.close();
    while let Some(op) = ops.recv().await {
        match op {
            DatagramOp::Fail { req, status } => complete(&events, req, status),
            DatagramOp::Send { req, .. } => complete(&events, req, status::ECANCELED),
            _ => {}
        }
    }

    drop(receiving_tx);
    pump.abort();
    debug!(handle = %handle, "datagram driver closed");
    let _ = events.send(LoopEvent::Closed { handle });
}

async fn recv_pump(
    handle: OsHandleId,
    socket: Arc<UdpSocket>,
    mut receiving: watch::Receiver<bool>,
    events: Sender<LoopEvent>,
    read_size: usize,
) {
    loop {
        if !*receiving.borrow_and_update() {
            if receiving.changed().await.is_err() {
                return;
            }
            continue;
        }

        let mut buf = vec![0u8; read_size];
        tokio::select! {
            changed = receiving.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            received = socket.recv_from(&mut buf) => {
                let event = match received {
                    Ok((n, from)) => {
                        buf.truncate(n);
                        DatagramEvent::Message { data: buf, from }
                    }
                    Err(e) => DatagramEvent::Error(status::from_io_error(&e)),
                };
                let _ = events.send(LoopEvent::Datagram { handle, event });
            }
        }
    }
}
