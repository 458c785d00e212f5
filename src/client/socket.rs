/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A TCP connection carrying pipelined commands.
//!
//! Writes go out in batches; every command expecting a reply is appended to `pending` before its
//! bytes hit the wire, and each parsed reply completes the task at the front of `pending`.  Replies
//! are therefore matched to commands purely by order.
//!
//! Reading is driven on demand rather than by a permanently running task: `trigger_receive` starts
//! a read pass only when replies are outstanding and no pass is already running, and a pass keeps
//! re-arming itself until nothing is outstanding.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{
    client::queue::cancel_tasks,
    config::{Endpoint, Settings},
    error::{ConnectionReason, Error, SocketReason},
    protocol::{
        codec::{decode, encode_command},
        Command, RespValue, SendMode,
    },
    task::Task,
};

/// Receive buffer with a read offset and a fill position.  Bytes in `offset..fill` have been
/// received but not yet parsed.
pub(crate) struct ReceiveBuffer {
    data: Vec<u8>,
    offset: usize,
    fill: usize,
}

impl ReceiveBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        ReceiveBuffer {
            data: vec![0; capacity],
            offset: 0,
            fill: 0,
        }
    }

    /// Free space after the fill position, growing the buffer if less than `min` remains
    pub(crate) fn spare(&mut self, min: usize) -> &mut [u8] {
        if self.data.len() - self.fill < min {
            let grown = (self.data.len() * 2).max(self.fill + min);
            self.data.resize(grown, 0);
        }
        &mut self.data[self.fill..]
    }

    pub(crate) fn filled(&mut self, n: usize) {
        self.fill = (self.fill + n).min(self.data.len());
    }

    /// The unparsed bytes
    pub(crate) fn window(&self) -> &[u8] {
        &self.data[self.offset..self.fill]
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.fill);
    }

    /// Reset when everything has been parsed, otherwise shift the partial frame to the front
    pub(crate) fn compact(&mut self) {
        if self.offset == self.fill {
            self.offset = 0;
            self.fill = 0;
        } else if self.offset > 0 {
            self.data.copy_within(self.offset..self.fill, 0);
            self.fill -= self.offset;
            self.offset = 0;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offset == self.fill
    }
}

struct ReadState {
    reader: OwnedReadHalf,
    buffer: ReceiveBuffer,
}

pub(crate) struct BufferedSocket {
    endpoint: Endpoint,
    handle: Handle,
    read_state: tokio::sync::Mutex<ReadState>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Tasks written and still waiting for their reply, in the order they were written
    pending: Mutex<VecDeque<Arc<Task>>>,
    reading: AtomicBool,
    closed: AtomicBool,
    current_db: AtomicI64,
    default_db: Option<i64>,
    read_size: usize,
    write_capacity: usize,
    cancel: CancellationToken,
}

impl BufferedSocket {
    pub(crate) fn new(
        stream: TcpStream,
        endpoint: Endpoint,
        settings: &Settings,
        handle: Handle,
    ) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        let sock = SockRef::from(&stream);
        sock.set_keepalive(true)?;
        sock.set_recv_buffer_size(settings.receive_buffer_size)?;
        sock.set_send_buffer_size(settings.send_buffer_size)?;

        let (reader, writer) = stream.into_split();
        Ok(BufferedSocket {
            endpoint,
            handle,
            read_state: tokio::sync::Mutex::new(ReadState {
                reader,
                buffer: ReceiveBuffer::with_capacity(settings.receive_buffer_size),
            }),
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(VecDeque::new()),
            reading: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            current_db: AtomicI64::new(-1),
            default_db: if settings.db >= 0 { Some(settings.db) } else { None },
            read_size: (settings.receive_buffer_size / 4).max(64),
            write_capacity: settings.send_buffer_size,
            cancel: CancellationToken::new(),
        })
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<Arc<Task>>> {
        match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn pending_replies(&self) -> usize {
        self.lock_pending().len()
    }

    /// Write a batch of commands with a single flush.
    ///
    /// A `SELECT` is written ahead of any command targeting a database other than the current
    /// one.  Send-only commands complete as soon as the write succeeds.  On failure the tasks of
    /// this batch are handed back untouched (the caller decides whether they are retried); any
    /// earlier task still awaiting a reply on this socket is canceled and the socket is closed.
    pub(crate) async fn write_batch(&self, tasks: &[Arc<Task>]) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Connection(ConnectionReason::NotConnected));
        }
        let mut writer = self.writer.lock().await;

        let mut out = BytesMut::with_capacity(self.write_capacity);
        let mut awaiting = Vec::with_capacity(tasks.len());
        let mut send_only = Vec::new();
        let mut db = self.current_db.load(Ordering::Acquire);
        for task in tasks {
            let command = task.command();
            if let Some(target) = command.target_db().or(self.default_db) {
                if target != db {
                    let select = Arc::new(Task::detached(Command::select(target)));
                    encode_command(select.command(), &mut out);
                    awaiting.push(select);
                    db = target;
                }
            }
            encode_command(command, &mut out);
            match command.mode() {
                SendMode::SendReceive => awaiting.push(task.clone()),
                SendMode::SendOnly => send_only.push(task.clone()),
            }
        }

        // Registered before writing so a fast reply always finds its task
        self.lock_pending().extend(awaiting.iter().cloned());

        let written = tokio::select! {
            res = writer.write_all(&out) => res,
            _ = self.cancel.cancelled() => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
        };
        if let Err(e) = written {
            log::warn!("Write to {} failed: {}", self.endpoint, e);
            self.lock_pending()
                .retain(|t| !tasks.iter().any(|ours| Arc::ptr_eq(t, ours)));
            self.fail(Error::Socket(SocketReason::Io(e)));
            return Err(Error::Connection(ConnectionReason::NotConnected));
        }
        self.current_db.store(db, Ordering::Release);

        for task in send_only {
            task.complete(RespValue::Nil);
        }
        Ok(())
    }

    /// Start a receive pass unless one is already running or nothing is awaiting a reply
    pub(crate) fn trigger_receive(self: &Arc<Self>) {
        if self.is_closed() || self.pending_replies() == 0 {
            return;
        }
        if self
            .reading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let socket = self.clone();
        self.handle.spawn(async move { socket.receive_loop().await });
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            let res = self.receive_once().await;
            self.reading.store(false, Ordering::Release);
            if let Err(e) = res {
                self.fail(e);
                return;
            }
            // A writer that registered tasks after the last check will have seen `reading` set
            // and skipped spawning, so check again now it is cleared
            if self.is_closed() || self.pending_replies() == 0 {
                return;
            }
            if self
                .reading
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
        }
    }

    /// Read whatever is available (waiting for at least one byte if nothing is) and complete the
    /// tasks for every whole reply in the buffer
    async fn receive_once(&self) -> Result<(), Error> {
        let mut state = self.read_state.lock().await;
        let ReadState { reader, buffer } = &mut *state;

        let mut received = 0;
        loop {
            match reader.try_read(buffer.spare(self.read_size)) {
                Ok(0) => return Err(closed_by_peer()),
                Ok(n) => {
                    buffer.filled(n);
                    received += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Socket(SocketReason::Io(e))),
            }
        }

        if received == 0 {
            let n = tokio::select! {
                res = reader.read(buffer.spare(self.read_size)) => {
                    res.map_err(|e| Error::Socket(SocketReason::Io(e)))?
                }
                _ = self.cancel.cancelled() => return Ok(()),
            };
            if n == 0 {
                return Err(closed_by_peer());
            }
            buffer.filled(n);
        }

        self.complete_replies(buffer)
    }

    fn complete_replies(&self, buffer: &mut ReceiveBuffer) -> Result<(), Error> {
        while let Some((consumed, value)) = decode(buffer.window(), 0)? {
            buffer.consume(consumed);
            let task = self.lock_pending().pop_front();
            match task {
                Some(task) => {
                    task.complete(value);
                    // Nobody reads the reply to a detached command, so an error reply is only
                    // ever seen here
                    if task.is_detached() {
                        if let Err(e) = task.result().and_then(RespValue::into_result) {
                            log::error!("{:?} failed on {}: {}", task.command(), self.endpoint, e);
                        }
                    }
                }
                None => log::error!("Reply from {} with no command awaiting it", self.endpoint),
            }
        }
        if !buffer.is_empty() {
            log::trace!(
                "{} bytes of a partial reply from {} buffered",
                buffer.window().len(),
                self.endpoint
            );
        }
        buffer.compact();
        Ok(())
    }

    /// Close after a transport failure; every task awaiting a reply is canceled
    pub(crate) fn fail(&self, err: Error) -> usize {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.cancel.cancel();
        let awaiting: Vec<_> = self.lock_pending().drain(..).collect();
        let canceled = cancel_tasks(&awaiting);
        if first {
            log::warn!(
                "Connection to {} failed, {} awaiting replies canceled: {}",
                self.endpoint,
                canceled,
                err
            );
        }
        canceled
    }

    /// Close deliberately, canceling every task awaiting a reply
    pub(crate) fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        let awaiting: Vec<_> = self.lock_pending().drain(..).collect();
        let canceled = cancel_tasks(&awaiting);
        log::debug!("Closed connection to {}", self.endpoint);
        canceled
    }
}

fn closed_by_peer() -> Error {
    Error::Socket(SocketReason::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed by peer",
    )))
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::net::TcpStream;

    use crate::{
        config::{Endpoint, Settings},
        protocol::{Command, RespValue},
        task::Task,
        testing::MockServer,
    };

    use super::{BufferedSocket, ReceiveBuffer};

    #[test]
    fn test_buffer_compaction() {
        let mut buffer = ReceiveBuffer::with_capacity(8);
        let spare = buffer.spare(4);
        spare[..6].copy_from_slice(b":1\r\n:2");
        buffer.filled(6);
        buffer.consume(4);
        buffer.compact();
        assert_eq!(buffer.window(), b":2");

        buffer.consume(2);
        buffer.compact();
        assert!(buffer.is_empty());
        assert_eq!(buffer.window(), b"");
    }

    #[test]
    fn test_buffer_grows() {
        let mut buffer = ReceiveBuffer::with_capacity(4);
        buffer.filled(3);
        assert!(buffer.spare(16).len() >= 16);
        assert_eq!(buffer.window().len(), 3);
    }

    async fn connect(server: &MockServer, settings: &Settings) -> Arc<BufferedSocket> {
        let endpoint: Endpoint = server.endpoint();
        let stream = TcpStream::connect((endpoint.host(), endpoint.port()))
            .await
            .unwrap();
        Arc::new(BufferedSocket::new(stream, endpoint, settings, tokio::runtime::Handle::current()).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pipelined_replies_in_order() {
        let server = MockServer::start().await;
        let settings = Settings::new(vec![server.endpoint()]);
        let socket = connect(&server, &settings).await;

        let mut receivers = Vec::new();
        let mut tasks = Vec::new();
        for i in 0..10 {
            let (task, rx) = Task::future(Command::new("ECHO").arg(format!("v{}", i)));
            tasks.push(Arc::new(task));
            receivers.push(rx);
        }
        socket.write_batch(&tasks).await.unwrap();
        socket.trigger_receive();

        for (i, rx) in receivers.into_iter().enumerate() {
            let value = rx.await.unwrap().unwrap();
            assert_eq!(value, RespValue::BulkString(format!("v{}", i).into_bytes()));
        }
        assert_eq!(socket.pending_replies(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_select_written_ahead() {
        let server = MockServer::start().await;
        let settings = Settings::new(vec![server.endpoint()]);
        let socket = connect(&server, &settings).await;

        let (task, rx) = Task::future(Command::new("PING").db(3));
        socket.write_batch(&[Arc::new(task)]).await.unwrap();
        socket.trigger_receive();
        rx.await.unwrap().unwrap();

        let seen = server.commands();
        assert_eq!(seen, vec![vec!["SELECT", "3"], vec!["PING"]]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_only_completes_on_write() {
        let server = MockServer::start().await;
        let settings = Settings::new(vec![server.endpoint()]);
        let socket = connect(&server, &settings).await;

        let (task, rx) = Task::future(Command::new("QUIT").send_only());
        socket.write_batch(&[Arc::new(task)]).await.unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), RespValue::Nil);
        assert_eq!(socket.pending_replies(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_close_cancels_awaiting() {
        let server = MockServer::start().await;
        server.close_on("BLPOP");
        let settings = Settings::new(vec![server.endpoint()]);
        let socket = connect(&server, &settings).await;

        let tasks: Vec<_> = (0..3)
            .map(|_| Arc::new(Task::detached(Command::new("BLPOP").arg("k").arg_int(0))))
            .collect();
        socket.write_batch(&tasks).await.unwrap();
        socket.trigger_receive();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !socket.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        for task in &tasks {
            assert!(task.status().is_canceled());
        }
    }
}
