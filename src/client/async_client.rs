/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::runtime::Handle;

use crate::{
    client::{
        connect,
        queue::{cancel_tasks, CommandQueue},
        sender::{self, SendExecutor},
        socket::BufferedSocket,
    },
    config::{Endpoint, Settings},
    error::{self, ConnectionReason, Error},
    protocol::{Command, Priority, Reply, ReplyKind, SendMode},
    role::{Role, ServerMode, SlotRange},
    task::{Task, TaskResult},
};

enum ClientState {
    Uninitialized,
    Connecting,
    Connected(Arc<BufferedSocket>),
    Disposed,
}

pub(crate) struct ClientInner {
    endpoint: Endpoint,
    settings: Arc<Settings>,
    handle: Handle,
    queue: CommandQueue,
    state: Mutex<ClientState>,
    connect_lock: tokio::sync::Mutex<()>,
    executor: Box<dyn SendExecutor>,
    sending: AtomicBool,
    role: AtomicU8,
    server: Mutex<(Option<ServerMode>, Vec<SlotRange>)>,
    closed: AtomicBool,
    half_closed: AtomicBool,
}

impl ClientInner {
    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_disposed(&self) -> bool {
        matches!(*self.lock_state(), ClientState::Disposed)
    }

    fn current_socket(&self) -> Option<Arc<BufferedSocket>> {
        match &*self.lock_state() {
            ClientState::Connected(socket) if !socket.is_closed() => Some(socket.clone()),
            _ => None,
        }
    }

    fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    /// Claim the right to run a send pass
    pub(crate) fn begin_send(&self) -> bool {
        self.sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the send pass.  Returns `true` if work arrived meanwhile and the pass was
    /// reclaimed, in which case the caller must run another.
    pub(crate) fn end_send(&self) -> bool {
        self.sending.store(false, Ordering::Release);
        !self.queue.is_empty() && self.begin_send()
    }

    /// The connected socket, connecting first if there is none (or the last one died)
    async fn socket(&self) -> Result<Arc<BufferedSocket>, Error> {
        if let Some(socket) = self.current_socket() {
            return Ok(socket);
        }
        let _connecting = self.connect_lock.lock().await;
        if let Some(socket) = self.current_socket() {
            return Ok(socket);
        }
        {
            let mut state = self.lock_state();
            if let ClientState::Disposed = *state {
                return Err(Error::Connection(ConnectionReason::Disposed));
            }
            *state = ClientState::Connecting;
        }

        match connect::connect(&self.endpoint, &self.settings, self.handle.clone()).await {
            Ok((socket, info)) => {
                let socket = Arc::new(socket);
                self.role.store(info.role.to_u8(), Ordering::Release);
                if let Ok(mut server) = self.server.lock() {
                    *server = (info.mode, info.slots);
                }
                let mut state = self.lock_state();
                if let ClientState::Disposed = *state {
                    socket.close();
                    return Err(Error::Connection(ConnectionReason::Disposed));
                }
                *state = ClientState::Connected(socket.clone());
                Ok(socket)
            }
            Err(e) => {
                let mut state = self.lock_state();
                if let ClientState::Connecting = *state {
                    *state = ClientState::Uninitialized;
                }
                Err(e)
            }
        }
    }

    /// Forget a dead socket so the next use reconnects
    fn forget_socket(&self, dead: &Arc<BufferedSocket>) {
        let mut state = self.lock_state();
        if let ClientState::Connected(socket) = &*state {
            if Arc::ptr_eq(socket, dead) {
                *state = ClientState::Uninitialized;
            }
        }
    }

    fn submit(self: &Arc<Self>, task: Arc<Task>) -> Result<(), Error> {
        self.check_role(task.command())?;
        if self.is_disposed() {
            return Err(Error::Connection(ConnectionReason::Disposed));
        }
        self.queue.enqueue(task);
        self.executor.schedule(self);
        Ok(())
    }

    fn check_role(&self, command: &Command) -> Result<(), Error> {
        let role = self.role();
        if role.serves(command.required_role()) {
            Ok(())
        } else {
            Err(error::not_supported(format!(
                "{:?} requires a {} but {} is a {}",
                command,
                command.required_role(),
                self.endpoint,
                role
            )))
        }
    }

    /// Re-drive both directions: any reply already on the socket gets read, and anything still
    /// queued gets sent
    fn pump(self: &Arc<Self>) {
        if let Some(socket) = self.current_socket() {
            socket.trigger_receive();
        }
        if !self.queue.is_empty() {
            self.executor.schedule(self);
        }
    }

    /// Drain the queue onto the socket, `bulk_send_factor` commands per write
    pub(crate) async fn send_pass(&self) {
        loop {
            let batch = self.queue.dequeue_batch(self.settings.bulk_send_factor);
            if batch.is_empty() {
                return;
            }

            let socket = match self.socket().await {
                Ok(socket) => socket,
                Err(e) => {
                    log::warn!("Cannot connect to {}: {}", self.endpoint, e);
                    self.fail_tasks(&batch, &e);
                    self.fail_queued(&e);
                    return;
                }
            };

            let batch: Vec<_> = batch
                .into_iter()
                .filter(|task| match self.check_role(task.command()) {
                    Ok(()) => true,
                    Err(e) => {
                        task.fail(e);
                        false
                    }
                })
                .collect();
            if batch.is_empty() {
                continue;
            }

            match socket.write_batch(&batch).await {
                Ok(()) => socket.trigger_receive(),
                Err(e) => {
                    self.forget_socket(&socket);
                    self.retry_batch(batch, e);
                }
            }
        }
    }

    /// A write failed.  Future-style tasks get one more attempt: they go back to the head of the
    /// queue, so the rest of this pass sends them first on a fresh connection.  Blocking callers
    /// have no way to be told their command may have been partially written, so theirs are
    /// canceled.
    fn retry_batch(&self, batch: Vec<Arc<Task>>, err: Error) {
        let (retry, abandon): (Vec<_>, Vec<_>) = batch.into_iter().partition(|t| t.take_retry());
        let canceled = cancel_tasks(&abandon);
        log::info!(
            "Reconnecting to {} after write failure ({}); retrying {}, canceled {}",
            self.endpoint,
            err,
            retry.len(),
            canceled
        );
        self.queue.requeue_front(retry);
    }

    fn fail_tasks(&self, tasks: &[Arc<Task>], err: &Error) {
        for task in tasks {
            match err {
                Error::Connection(reason) => task.fail(Error::Connection(reason.clone())),
                _ => task.cancel(),
            };
        }
    }

    fn fail_queued(&self, err: &Error) {
        let mut queued = Vec::with_capacity(self.queue.len());
        while let Some(task) = self.queue.dequeue() {
            queued.push(task);
        }
        self.fail_tasks(&queued, err);
    }
}

/// A connection to one server, shared by cloning.
///
/// Commands are queued, written in batches by a send pass and matched with their replies in
/// order.  The connection is opened lazily on first use, and reopened (once per failed write)
/// if it dies.
///
/// The blocking calls (`execute`, `execute_batch`) must not be made from a thread driving the
/// client's runtime.
#[derive(Clone)]
pub struct AsyncClient {
    inner: Arc<ClientInner>,
}

impl AsyncClient {
    /// A client for the first configured endpoint
    pub fn new(settings: Arc<Settings>, handle: Handle) -> Result<Self, Error> {
        settings.validate()?;
        let endpoint = settings.endpoints()[0].clone();
        Ok(AsyncClient::for_endpoint(endpoint, settings, handle))
    }

    pub fn for_endpoint(endpoint: Endpoint, settings: Arc<Settings>, handle: Handle) -> Self {
        let executor = sender::for_strategy(settings.send_strategy);
        AsyncClient {
            inner: Arc::new(ClientInner {
                endpoint,
                settings,
                handle,
                queue: CommandQueue::new(),
                state: Mutex::new(ClientState::Uninitialized),
                connect_lock: tokio::sync::Mutex::new(()),
                executor,
                sending: AtomicBool::new(false),
                role: AtomicU8::new(Role::Undefined.to_u8()),
                server: Mutex::new((None, Vec::new())),
                closed: AtomicBool::new(false),
                half_closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.inner.settings
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Connect now rather than on first use
    pub async fn connect(&self) -> Result<(), Error> {
        self.inner.socket().await.map(|_| ())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current_socket().is_some()
    }

    /// The role discovered when connecting, or set by the topology layer
    pub fn role(&self) -> Role {
        self.inner.role()
    }

    pub(crate) fn set_role(&self, role: Role) {
        self.inner.role.store(role.to_u8(), Ordering::Release);
    }

    pub fn mode(&self) -> Option<ServerMode> {
        self.inner.server.lock().ok().and_then(|server| server.0)
    }

    pub fn slots(&self) -> Vec<SlotRange> {
        self.inner
            .server
            .lock()
            .map(|server| server.1.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self, closed: bool) {
        self.inner.closed.store(closed, Ordering::Release);
    }

    pub fn is_half_closed(&self) -> bool {
        self.inner.half_closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_half_closed(&self, half_closed: bool) {
        self.inner.half_closed.store(half_closed, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Run a command, blocking the calling thread until its reply arrives or the command
    /// timeout passes.
    ///
    /// While waiting the caller periodically re-drives the receive pump, so a reply sitting
    /// unread on the socket is always picked up even when no runtime thread is free to notice
    /// it.  A timeout cancels the command but leaves the connection open.
    pub fn execute(&self, command: Command) -> Result<Reply, Error> {
        let kind = command.expected();
        let mode = command.mode();
        let task = Arc::new(Task::blocking(command));
        self.inner.submit(task.clone())?;
        let inner = &self.inner;
        let raw = task.wait(
            inner.settings.command_timeout,
            inner.settings.wait_poll_interval,
            || inner.pump(),
        );
        into_reply(kind, mode, raw)
    }

    /// Run a command, resolving when its reply arrives
    pub fn execute_async(
        &self,
        command: Command,
    ) -> impl Future<Output = Result<Reply, Error>> + Send + 'static {
        let kind = command.expected();
        let mode = command.mode();
        let timeout = self.inner.settings.command_timeout;
        let (task, rx) = Task::future(command);
        let task = Arc::new(task);
        let submitted = self.inner.submit(task.clone());
        async move {
            submitted?;
            match tokio::time::timeout(timeout, rx).await {
                Ok(raw) => into_reply(kind, mode, raw?),
                Err(_) => {
                    task.cancel();
                    Err(error::timeout())
                }
            }
        }
    }

    /// Run several commands pipelined together, blocking until every reply arrives.  All the
    /// commands must target the same database.
    pub fn execute_batch(&self, commands: Vec<Command>) -> Result<Vec<Result<Reply, Error>>, Error> {
        let mut dbs = commands.iter().map(Command::target_db);
        if let Some(first) = dbs.next() {
            if dbs.any(|db| db != first) {
                return Err(error::not_supported(
                    "A batch cannot span more than one database",
                ));
            }
        }
        for command in &commands {
            self.inner.check_role(command)?;
        }
        if self.is_disposed() {
            return Err(Error::Connection(ConnectionReason::Disposed));
        }

        let shapes: Vec<_> = commands.iter().map(|c| (c.expected(), c.mode())).collect();
        let tasks: Vec<_> = commands
            .into_iter()
            .map(|c| Arc::new(Task::blocking(c)))
            .collect();
        self.inner.queue.enqueue_all(tasks.iter().cloned());
        self.inner.executor.schedule(&self.inner);

        let settings = &self.inner.settings;
        let deadline = Instant::now() + settings.command_timeout;
        let inner = &self.inner;
        Ok(tasks
            .iter()
            .zip(shapes)
            .map(|(task, (kind, mode))| {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let raw = task.wait(remaining, settings.wait_poll_interval, || inner.pump());
                into_reply(kind, mode, raw)
            })
            .collect())
    }

    /// `PING`, at high priority so it jumps any queued traffic
    pub fn ping(&self) -> impl Future<Output = Result<(), Error>> + Send + 'static {
        let reply = self.execute_async(
            Command::new("PING")
                .priority(Priority::High)
                .expect(ReplyKind::BulkString),
        );
        async move {
            match reply.await? {
                Reply::BulkString(Some(ref s)) if s == "PONG" => Ok(()),
                other => Err(error::unexpected(format!("Unexpected PING reply: {:?}", other))),
            }
        }
    }

    /// Tasks queued or awaiting a reply right now
    pub fn pending(&self) -> usize {
        let awaiting = self
            .inner
            .current_socket()
            .map_or(0, |socket| socket.pending_replies());
        self.inner.queue.len() + awaiting
    }

    /// Close the connection for good.  Every queued command and every command awaiting a reply
    /// is canceled.
    pub fn dispose(&self) {
        let previous = {
            let mut state = self.inner.lock_state();
            std::mem::replace(&mut *state, ClientState::Disposed)
        };
        if let ClientState::Disposed = previous {
            return;
        }
        self.inner.executor.shutdown();
        let mut canceled = self.inner.queue.cancel_all();
        if let ClientState::Connected(socket) = previous {
            canceled += socket.close();
        }
        self.inner.closed.store(true, Ordering::Release);
        log::info!(
            "Disposed client for {}, {} commands canceled",
            self.inner.endpoint,
            canceled
        );
    }
}

fn into_reply(kind: ReplyKind, mode: SendMode, raw: TaskResult) -> Result<Reply, Error> {
    let value = raw?;
    if mode == SendMode::SendOnly {
        return Ok(Reply::Void);
    }
    Reply::from_resp(kind, value)?.into_result()
}
