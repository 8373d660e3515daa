//! Connection management.
//!
//! One [`Connection`] owns a TCP socket and three cooperating tasks: a
//! reader that routes inbound frames to pipeline slots, a writer that
//! flushes a double-buffered outbound queue, and a coarse deadline ticker
//! that fires per-request timeouts independently of the callers. Callers
//! multiplex over the socket through the slot table; correlation is by
//! sequence number, so the server may reply out of order.

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::slots::{ReplyFrame, SlotTable};
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use vexdb_protocol::{
    encode_request, seq_is_valid, Arg, CmdCode, Header, Response, FRAME_HEADER_SIZE,
};

/// Period of the coarse deadline clock, in seconds.
pub const DEADLINE_TICK_SECS: u32 = 1;

/// Completion callback for [`Connection::call_async`]. Invoked exactly once.
pub type Completion = Box<dyn FnOnce(Result<Response, ClientError>) + Send + 'static>;

/// Handler for server-initiated pushes multiplexed on the same socket.
pub type UpdatesHandler = Box<dyn Fn(Response) + Send + Sync + 'static>;

/// Connection lifecycle states. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Init = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Init,
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            _ => ConnState::Failed,
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A single pipelined connection to a vexdb server.
pub struct Connection {
    config: ConnectionConfig,
    slots: SlotTable,
    state: AtomicU8,

    /// Active outbound buffer; the writer task owns the detached twin.
    wr_buf: Mutex<BytesMut>,
    wr_kick: Notify,

    /// First fatal error; set exactly once, then broadcast via `failed_tx`.
    err: RwLock<Option<ClientError>>,
    failed_tx: watch::Sender<bool>,
    term_tx: watch::Sender<bool>,

    /// Coarse seconds since connect, advanced by the deadline ticker.
    now: AtomicU32,
    /// Unix timestamp of the last successful header read.
    last_read_stamp: AtomicI64,
    /// Server start timestamp from the login reply (0 = not reported).
    server_start_ts: AtomicI64,

    pending: AtomicI32,
    updates: RwLock<Option<UpdatesHandler>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens a connection from a URI, logging in with the credentials and
    /// database path it carries.
    pub async fn open(
        uri: &str,
        login_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Arc<Self>, ClientError> {
        let config = ConnectionConfig::from_uri(uri)?
            .with_login_timeout(login_timeout)
            .with_request_timeout(request_timeout);
        Self::connect(config).await
    }

    /// Dials, logs in, and spawns the connection tasks.
    pub async fn connect(config: ConnectionConfig) -> Result<Arc<Self>, ClientError> {
        let (failed_tx, _) = watch::channel(false);
        let (term_tx, _) = watch::channel(false);
        let conn = Arc::new(Self {
            slots: SlotTable::new(config.pipeline_depth),
            state: AtomicU8::new(ConnState::Init as u8),
            wr_buf: Mutex::new(BytesMut::with_capacity(config.buf_capacity)),
            wr_kick: Notify::new(),
            err: RwLock::new(None),
            failed_tx,
            term_tx,
            now: AtomicU32::new(0),
            last_read_stamp: AtomicI64::new(unix_now()),
            server_start_ts: AtomicI64::new(0),
            pending: AtomicI32::new(0),
            updates: RwLock::new(None),
            config,
        });

        // The ticker starts before the dial so `now` covers dial time and
        // the login budget below can subtract it.
        tokio::spawn(Arc::clone(&conn).deadline_ticker());

        conn.state
            .store(ConnState::Connecting as u8, Ordering::SeqCst);
        tracing::debug!("connecting to {}", conn.config.addr);

        let stream = match conn.dial().await {
            Ok(s) => s,
            Err(e) => {
                conn.fail(e.clone());
                return Err(e);
            }
        };
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(Arc::clone(&conn).read_loop(read_half));
        tokio::spawn(Arc::clone(&conn).write_loop(write_half));

        let mut login_budget = conn.config.login_timeout.as_secs() as u32;
        if login_budget != 0 {
            let elapsed = conn.now.load(Ordering::SeqCst);
            if login_budget > elapsed {
                login_budget -= elapsed;
            } else {
                let e = ClientError::Timeout("connect");
                conn.fail(e.clone());
                return Err(e);
            }
        }

        if let Err(e) = conn.login(login_budget).await {
            conn.fail(e.clone());
            return Err(e);
        }
        conn.state
            .store(ConnState::Connected as u8, Ordering::SeqCst);
        tracing::debug!("connected to {}", conn.config.addr);

        if !conn.config.keep_alive_interval.is_zero() {
            tokio::spawn(Arc::clone(&conn).keep_alive_loop());
        }
        Ok(conn)
    }

    async fn dial(&self) -> Result<TcpStream, ClientError> {
        let connect = TcpStream::connect(&self.config.addr);
        let stream = if self.config.login_timeout.is_zero() {
            connect.await
        } else {
            tokio::time::timeout(self.config.login_timeout, connect)
                .await
                .map_err(|_| ClientError::Timeout("connect"))?
        };
        stream.map_err(ClientError::from_io)
    }

    async fn login(&self, timeout_secs: u32) -> Result<(), ClientError> {
        let args = vec![
            Arg::from(self.config.username.as_str()),
            Arg::from(self.config.password.as_str()),
            Arg::from(self.config.database.as_str()),
        ];
        let resp = self
            .rpc_call(CmdCode::Login, timeout_secs, args)
            .await
            .map_err(|e| match e {
                ClientError::Timeout(_) => ClientError::Timeout("login"),
                other => other,
            })?;
        // The second reply argument, when present, is the server start
        // timestamp; the outer client uses it for staleness checks.
        if let Some(ts) = resp.args.get(1).and_then(Arg::as_i64) {
            self.server_start_ts.store(ts, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Issues a request and waits for its reply, timeout, or connection
    /// failure. `timeout_secs` of zero means no deadline.
    pub async fn call(
        &self,
        cmd: CmdCode,
        timeout_secs: u32,
        args: Vec<Arg>,
    ) -> Result<Response, ClientError> {
        self.rpc_call(cmd, timeout_secs, args).await
    }

    /// Like [`Connection::call`], with the deadline as an instant. Fails
    /// with [`ClientError::Canceled`] before submission when the deadline
    /// has already passed.
    pub async fn call_deadline(
        &self,
        cmd: CmdCode,
        deadline: Instant,
        args: Vec<Arg>,
    ) -> Result<Response, ClientError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ClientError::Canceled);
        }
        let mut secs = remaining.as_secs();
        if remaining.subsec_nanos() > 0 {
            secs += 1;
        }
        let secs = u32::try_from(secs).unwrap_or(u32::MAX);
        self.rpc_call_inner(cmd, secs, remaining.as_millis() as i64, args)
            .await
    }

    /// Submits a request whose outcome is delivered to `completion`,
    /// invoked exactly once. A retained `Response` keeps its payload alive
    /// on its own.
    pub fn call_async(
        self: &Arc<Self>,
        cmd: CmdCode,
        timeout_secs: u32,
        args: Vec<Arg>,
        completion: Completion,
    ) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let result = conn.rpc_call(cmd, timeout_secs, args).await;
            completion(result);
            conn.pending.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn rpc_call(
        &self,
        cmd: CmdCode,
        timeout_secs: u32,
        args: Vec<Arg>,
    ) -> Result<Response, ClientError> {
        let exec_timeout_ms = i64::from(timeout_secs) * 1000;
        self.rpc_call_inner(cmd, timeout_secs, exec_timeout_ms, args)
            .await
    }

    async fn rpc_call_inner(
        &self,
        cmd: CmdCode,
        timeout_secs: u32,
        exec_timeout_ms: i64,
        args: Vec<Arg>,
    ) -> Result<Response, ClientError> {
        validate_args(&args)?;
        if let Some(err) = self.err.read().clone() {
            return Err(err);
        }

        let guard = self.slots.acquire().await?;
        let seq = guard.seq();
        let slot = guard.slot();

        if timeout_secs != 0 {
            slot.arm_deadline(self.now.load(Ordering::SeqCst) + timeout_secs);
        }
        slot.publish(seq);

        let frame = encode_request(cmd, seq, &args, exec_timeout_ms)?;
        self.write(&frame);

        let mut failed_rx = self.failed_tx.subscribe();
        let mut reply_rx = slot.reply_rx.lock().await;
        let mut timeout_rx = slot.timeout_rx.lock().await;

        let payload = loop {
            tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(ReplyFrame { seq: rseq, payload }) if rseq == seq => break Ok(payload),
                    Some(_) => {} // stale frame from a previous occupant
                    None => break Err(ClientError::ConnectionClosed),
                },
                fired = timeout_rx.recv() => match fired {
                    Some(s) if s == seq => break Err(ClientError::Timeout("request")),
                    Some(_) => {} // stale firing from a previous occupant
                    None => break Err(ClientError::ConnectionClosed),
                },
                _ = failed_rx.wait_for(|failed| *failed) => {
                    break Err(self.stored_error());
                }
            }
        };

        drop(timeout_rx);
        drop(reply_rx);
        drop(guard);

        // A reply that cannot be decoded means the stream is corrupt, which
        // is fatal to the connection like any other protocol error.
        let resp = match Response::decode(&payload?) {
            Ok(resp) => resp,
            Err(e) => {
                let err = ClientError::from(e);
                self.fail(err.clone());
                return Err(err);
            }
        };
        if !resp.is_ok() {
            return Err(ClientError::Server {
                code: resp.status,
                message: resp.message,
            });
        }
        Ok(resp)
    }

    /// Appends a frame to the active write buffer and kicks the writer.
    fn write(&self, frame: &[u8]) {
        self.wr_buf.lock().extend_from_slice(frame);
        self.wr_kick.notify_one();
    }

    async fn write_loop(self: Arc<Self>, mut socket: OwnedWriteHalf) {
        let mut failed_rx = self.failed_tx.subscribe();
        let mut term_rx = self.term_tx.subscribe();
        let mut detached = BytesMut::with_capacity(self.config.buf_capacity);
        loop {
            tokio::select! {
                _ = failed_rx.wait_for(|f| *f) => return,
                _ = term_rx.wait_for(|t| *t) => return,
                _ = self.wr_kick.notified() => {}
            }
            {
                let mut active = self.wr_buf.lock();
                if active.is_empty() {
                    drop(active);
                    if self.err.read().is_some() {
                        return;
                    }
                    continue;
                }
                std::mem::swap(&mut *active, &mut detached);
            }
            // The socket write happens with the buffer lock released, so
            // submitters never contend with the syscall.
            if let Err(e) = socket.write_all(&detached).await {
                self.fail(ClientError::from_io(e));
                return;
            }
            detached.clear();
        }
    }

    async fn read_loop(self: Arc<Self>, socket: OwnedReadHalf) {
        let mut failed_rx = self.failed_tx.subscribe();
        let mut term_rx = self.term_tx.subscribe();
        let mut reader = BufReader::with_capacity(self.config.buf_capacity, socket);
        let mut hdr = [0u8; FRAME_HEADER_SIZE];
        loop {
            let result = tokio::select! {
                _ = failed_rx.wait_for(|f| *f) => return,
                _ = term_rx.wait_for(|t| *t) => return,
                r = self.read_frame(&mut reader, &mut hdr) => r,
            };
            if let Err(e) = result {
                self.fail(e);
                return;
            }
        }
    }

    async fn read_frame(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        hdr: &mut [u8; FRAME_HEADER_SIZE],
    ) -> Result<(), ClientError> {
        reader
            .read_exact(hdr)
            .await
            .map_err(ClientError::from_io)?;
        let header = Header::decode(hdr, self.slots.max_seq())?;
        self.last_read_stamp.store(unix_now(), Ordering::SeqCst);

        let size = header.payload_len as usize;
        let slot = self.slots.slot(header.seq);
        if slot.seq() == header.seq {
            let mut payload = vec![0u8; size];
            reader
                .read_exact(&mut payload)
                .await
                .map_err(ClientError::from_io)?;
            slot.deliver(ReplyFrame {
                seq: header.seq,
                payload: payload.into(),
            })
            .await;
            return Ok(());
        }

        let slot_is_idle = !seq_is_valid(slot.seq(), self.slots.max_seq());
        if slot_is_idle && self.updates.read().is_some() {
            // Server-initiated push: the sequence matches no live request.
            let mut payload = vec![0u8; size];
            reader
                .read_exact(&mut payload)
                .await
                .map_err(ClientError::from_io)?;
            match Response::decode(&payload) {
                Ok(update) => {
                    if let Some(handler) = self.updates.read().as_ref() {
                        handler(update);
                    }
                }
                Err(e) => {
                    tracing::warn!("dropping undecodable update frame (seq={}): {}", header.seq, e);
                }
            }
            return Ok(());
        }

        // Late or unknown reply: consume the payload and drop it.
        tracing::debug!("discarding stale reply seq={} ({} bytes)", header.seq, size);
        let drained = tokio::io::copy(&mut (&mut *reader).take(size as u64), &mut tokio::io::sink())
            .await
            .map_err(ClientError::from_io)?;
        if drained < size as u64 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(())
    }

    /// Coarse 1-second clock enforcing per-request deadlines, so waiters
    /// blocked on a dead socket still return.
    async fn deadline_ticker(self: Arc<Self>) {
        let period = Duration::from_secs(u64::from(DEADLINE_TICK_SECS));
        let mut ticks =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut failed_rx = self.failed_tx.subscribe();
        let mut term_rx = self.term_tx.subscribe();
        loop {
            tokio::select! {
                _ = failed_rx.wait_for(|f| *f) => return,
                _ = term_rx.wait_for(|t| *t) => return,
                _ = ticks.tick() => {}
            }
            let now = self.now.fetch_add(DEADLINE_TICK_SECS, Ordering::SeqCst) + DEADLINE_TICK_SECS;
            for slot in self.slots.iter() {
                let seq = slot.seq();
                if !seq_is_valid(seq, self.slots.max_seq()) {
                    continue;
                }
                let deadline = slot.deadline();
                if deadline != 0 && now >= deadline {
                    // Clear only after the signal is enqueued: a full
                    // channel still holds a stale firing the occupant has
                    // yet to drain, and the deadline must survive until the
                    // real signal fits.
                    if slot.fire_timeout(seq) {
                        slot.clear_deadline();
                    }
                }
            }
        }
    }

    async fn keep_alive_loop(self: Arc<Self>) {
        let period = self.config.keep_alive_interval;
        let idle_secs = period.as_secs() as i64;
        let mut ticks =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut failed_rx = self.failed_tx.subscribe();
        let mut term_rx = self.term_tx.subscribe();
        loop {
            tokio::select! {
                _ = failed_rx.wait_for(|f| *f) => return,
                _ = term_rx.wait_for(|t| *t) => return,
                _ = ticks.tick() => {}
            }
            // Recent traffic already proves liveness; skip the ping.
            if unix_now() - self.last_read_stamp.load(Ordering::SeqCst) < idle_secs {
                continue;
            }
            let timeout = self.config.request_timeout.as_secs() as u32;
            if let Err(e) = self.rpc_call(CmdCode::Ping, timeout, Vec::new()).await {
                if e.is_fatal() {
                    return;
                }
                tracing::debug!("keep-alive ping failed: {}", e);
            }
        }
    }

    /// One-shot transition to `Failed`. The first error wins; later calls
    /// are no-ops. Every current and future waiter resolves with the
    /// stored error.
    fn fail(&self, err: ClientError) {
        {
            let mut stored = self.err.write();
            if stored.is_some() {
                return;
            }
            tracing::debug!("connection failed: {}", err);
            *stored = Some(err);
        }
        self.state.store(ConnState::Failed as u8, Ordering::SeqCst);
        let _ = self.failed_tx.send(true);
    }

    fn stored_error(&self) -> ClientError {
        self.err
            .read()
            .clone()
            .unwrap_or(ClientError::ConnectionClosed)
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Ticker seconds since the connection was created.
    pub fn now(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }

    /// Time of the last successful header read off the socket.
    pub fn last_read_time(&self) -> SystemTime {
        let stamp = self.last_read_stamp.load(Ordering::SeqCst);
        UNIX_EPOCH + Duration::from_secs(stamp.max(0) as u64)
    }

    /// Server start timestamp from the login reply, when it reported one.
    pub fn server_start_time(&self) -> Option<i64> {
        match self.server_start_ts.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Number of completions submitted through [`Connection::call_async`]
    /// that have not yet been invoked.
    pub fn pending_completions(&self) -> i32 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Installs the handler for server-initiated pushes.
    pub fn set_updates_handler(&self, handler: impl Fn(Response) + Send + Sync + 'static) {
        *self.updates.write() = Some(Box::new(handler));
    }

    /// Stops the periodic tasks (deadline ticker and keep-alive). In-flight
    /// requests are left to resolve on their own.
    pub fn set_terminate(&self) {
        let _ = self.term_tx.send(true);
    }

    /// Tears the connection down: stops the periodic tasks and resolves
    /// every waiter with [`ClientError::ConnectionClosed`]. Idempotent.
    pub fn finalize(&self) {
        self.set_terminate();
        self.fail(ClientError::ConnectionClosed);
    }
}

/// Rejects argument kinds the protocol only allows in replies.
fn validate_args(args: &[Arg]) -> Result<(), ClientError> {
    for arg in args {
        match arg {
            Arg::Double(_) => return Err(ClientError::InvalidArgument("double")),
            Arg::Null => return Err(ClientError::InvalidArgument("null")),
            Arg::Tuple(items) => validate_args(items)?,
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use vexdb_protocol::{max_seq, ProtocolError, Request};

    const SERVER_START_TS: i64 = 1_700_000_123;

    async fn read_request(socket: &mut TcpStream) -> Option<(u32, Request)> {
        let mut hdr = [0u8; FRAME_HEADER_SIZE];
        socket.read_exact(&mut hdr).await.ok()?;
        let header = Header::decode(&hdr, max_seq(40)).ok()?;
        let mut payload = vec![0u8; header.payload_len as usize];
        socket.read_exact(&mut payload).await.ok()?;
        let request = Request::decode(&payload).ok()?;
        Some((header.seq, request))
    }

    async fn send_response(socket: &mut TcpStream, seq: u32, resp: &Response) {
        let frame = resp.encode(seq).unwrap();
        socket.write_all(&frame).await.unwrap();
    }

    /// Answers the login handshake, reporting a server start timestamp.
    async fn handle_login(socket: &mut TcpStream) {
        let (seq, request) = read_request(socket).await.unwrap();
        assert_eq!(request.cmd, CmdCode::Login);
        send_response(
            socket,
            seq,
            &Response::ok(vec![Arg::Int64(0), Arg::Int64(SERVER_START_TS)]),
        )
        .await;
    }

    /// Binds a listener and serves exactly one connection with `handler`.
    async fn spawn_server<F, Fut>(handler: F) -> SocketAddr
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                handler(socket).await;
            }
        });
        addr
    }

    /// A server that logs the client in and then echoes request args back.
    async fn spawn_echo_server() -> SocketAddr {
        spawn_server(|mut socket| async move {
            handle_login(&mut socket).await;
            while let Some((seq, request)) = read_request(&mut socket).await {
                send_response(&mut socket, seq, &Response::ok(request.args)).await;
            }
        })
        .await
    }

    async fn connect_to(addr: SocketAddr) -> Arc<Connection> {
        Connection::connect(ConnectionConfig::new(addr.to_string()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let addr = spawn_echo_server().await;
        let conn = connect_to(addr).await;
        assert!(conn.is_connected());

        let resp = conn.call(CmdCode::Ping, 0, Vec::new()).await.unwrap();
        assert!(resp.is_ok());
        assert!(resp.args.is_empty());
        conn.finalize();
    }

    #[tokio::test]
    async fn test_login_publishes_server_start_time() {
        let addr = spawn_echo_server().await;
        let conn = connect_to(addr).await;
        assert_eq!(conn.server_start_time(), Some(SERVER_START_TS));
        conn.finalize();
    }

    #[tokio::test]
    async fn test_login_failure_is_terminal() {
        let addr = spawn_server(|mut socket| async move {
            let (seq, request) = read_request(&mut socket).await.unwrap();
            assert_eq!(request.cmd, CmdCode::Login);
            send_response(&mut socket, seq, &Response::error(401, "bad credentials")).await;
            // Hold the socket so the client fails on the reply, not on EOF.
            let _ = read_request(&mut socket).await;
        })
        .await;

        let err = Connection::connect(ConnectionConfig::new(addr.to_string()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ClientError::Server {
                code: 401,
                message: "bad credentials".into()
            }
        );
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let addr = spawn_server(|mut socket| async move {
            handle_login(&mut socket).await;
            let mut requests = Vec::new();
            for _ in 0..3 {
                requests.push(read_request(&mut socket).await.unwrap());
            }
            for idx in [2usize, 0, 1] {
                let (seq, request) = &requests[idx];
                send_response(&mut socket, *seq, &Response::ok(request.args.clone())).await;
            }
            let _ = read_request(&mut socket).await;
        })
        .await;

        let conn = connect_to(addr).await;
        let mut tasks = Vec::new();
        for marker in 0..3i32 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move {
                let resp = conn
                    .call(CmdCode::Select, 0, vec![Arg::Int(marker)])
                    .await
                    .unwrap();
                assert_eq!(resp.args, vec![Arg::Int(marker)]);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        conn.finalize();
    }

    #[tokio::test]
    async fn test_request_timeout_then_late_reply_discarded() {
        let addr = spawn_server(|mut socket| async move {
            handle_login(&mut socket).await;
            // First request is left to time out.
            let (stale_seq, _) = read_request(&mut socket).await.unwrap();
            // When the follow-up arrives, answer the dead sequence first.
            let (seq, request) = read_request(&mut socket).await.unwrap();
            send_response(&mut socket, stale_seq, &Response::ok(vec![Arg::from("late")])).await;
            send_response(&mut socket, seq, &Response::ok(request.args)).await;
            let _ = read_request(&mut socket).await;
        })
        .await;

        let conn = connect_to(addr).await;
        let started = Instant::now();
        let err = conn.call(CmdCode::Select, 1, Vec::new()).await.unwrap_err();
        assert_eq!(err, ClientError::Timeout("request"));
        assert!(started.elapsed() < Duration::from_secs(3));

        // The connection survives both the timeout and the late reply.
        let resp = conn
            .call(CmdCode::Select, 0, vec![Arg::Int(9)])
            .await
            .unwrap();
        assert_eq!(resp.args, vec![Arg::Int(9)]);
        assert!(conn.is_connected());
        conn.finalize();
    }

    #[tokio::test]
    async fn test_failure_broadcast_unblocks_all_waiters() {
        let addr = spawn_server(|mut socket| async move {
            handle_login(&mut socket).await;
            for _ in 0..10 {
                read_request(&mut socket).await.unwrap();
            }
            // Dropping the socket fails the connection on the client side.
        })
        .await;

        let conn = connect_to(addr).await;
        let mut tasks = Vec::new();
        for i in 0..10i32 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move {
                conn.call(CmdCode::Select, 0, vec![Arg::Int(i)]).await
            }));
        }
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(err.is_fatal());
            assert_eq!(err, ClientError::ConnectionClosed);
        }
        assert_eq!(conn.state(), ConnState::Failed);

        // Future callers observe the same terminal error immediately.
        let err = conn.call(CmdCode::Ping, 0, Vec::new()).await.unwrap_err();
        assert_eq!(err, ClientError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_slot_recycling_over_two_generations() {
        let addr = spawn_echo_server().await;
        let config = ConnectionConfig::new(addr.to_string()).with_pipeline_depth(4);
        let conn = Connection::connect(config).await.unwrap();

        // 2 * depth + 1 sequential calls walk every slot past its first
        // recycled sequence.
        for i in 0..9i32 {
            let resp = conn
                .call(CmdCode::Select, 0, vec![Arg::Int(i)])
                .await
                .unwrap();
            assert_eq!(resp.args, vec![Arg::Int(i)]);
        }
        conn.finalize();
    }

    #[tokio::test]
    async fn test_protocol_error_is_fatal() {
        let addr = spawn_server(|mut socket| async move {
            handle_login(&mut socket).await;
            let (_, _) = read_request(&mut socket).await.unwrap();
            socket.write_all(&[0u8; FRAME_HEADER_SIZE]).await.unwrap();
            let _ = read_request(&mut socket).await;
        })
        .await;

        let conn = connect_to(addr).await;
        let err = conn.call(CmdCode::Ping, 0, Vec::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::InvalidMagic(0))
        ));
        assert_eq!(conn.state(), ConnState::Failed);
    }

    #[tokio::test]
    async fn test_malformed_reply_payload_is_fatal() {
        let addr = spawn_server(|mut socket| async move {
            handle_login(&mut socket).await;
            let (seq, _) = read_request(&mut socket).await.unwrap();
            // A valid header for the live sequence, but a payload too short
            // to hold a response envelope.
            let mut frame = BytesMut::new();
            Header::encode(1, seq, &mut frame);
            frame.put_u8(0xEE);
            socket.write_all(&frame).await.unwrap();
            let _ = read_request(&mut socket).await;
        })
        .await;

        let conn = connect_to(addr).await;
        let err = conn.call(CmdCode::Ping, 0, Vec::new()).await.unwrap_err();
        assert_eq!(err, ClientError::Protocol(ProtocolError::Truncated));
        assert_eq!(conn.state(), ConnState::Failed);

        // Later callers observe the stored error, not a live connection.
        let err = conn.call(CmdCode::Ping, 0, Vec::new()).await.unwrap_err();
        assert_eq!(err, ClientError::Protocol(ProtocolError::Truncated));
    }

    #[tokio::test]
    async fn test_reply_only_argument_kinds_rejected() {
        let addr = spawn_echo_server().await;
        let conn = connect_to(addr).await;

        let err = conn
            .call(CmdCode::Select, 0, vec![Arg::Double(1.5)])
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::InvalidArgument("double"));

        let err = conn
            .call(CmdCode::Select, 0, vec![Arg::Tuple(vec![Arg::Null])])
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::InvalidArgument("null"));

        // Rejection happens before submission; the connection is unharmed.
        let resp = conn.call(CmdCode::Ping, 0, Vec::new()).await.unwrap();
        assert!(resp.is_ok());
        conn.finalize();
    }

    #[tokio::test]
    async fn test_updates_routed_to_handler() {
        let addr = spawn_server(|mut socket| async move {
            handle_login(&mut socket).await;
            let (seq, request) = read_request(&mut socket).await.unwrap();
            // Push an update on an idle sequence before answering.
            send_response(&mut socket, 7, &Response::ok(vec![Arg::from("push")])).await;
            send_response(&mut socket, seq, &Response::ok(request.args)).await;
            let _ = read_request(&mut socket).await;
        })
        .await;

        let conn = connect_to(addr).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.set_updates_handler(move |update| {
            let _ = tx.send(update);
        });

        let resp = conn.call(CmdCode::Ping, 0, Vec::new()).await.unwrap();
        assert!(resp.is_ok());

        let update = rx.recv().await.unwrap();
        assert_eq!(update.args, vec![Arg::from("push")]);
        assert!(conn.is_connected());
        conn.finalize();
    }

    #[tokio::test]
    async fn test_call_async_completion_invoked_once() {
        let addr = spawn_echo_server().await;
        let conn = connect_to(addr).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.call_async(
            CmdCode::Select,
            0,
            vec![Arg::Int(5)],
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        let result = rx.recv().await.unwrap();
        assert_eq!(result.unwrap().args, vec![Arg::Int(5)]);
        assert!(rx.recv().await.is_none(), "completion must run exactly once");
        // The counter drops just after the completion returns.
        while conn.pending_completions() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        conn.finalize();
    }

    #[tokio::test]
    async fn test_keep_alive_pings_idle_connection() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let addr = spawn_server(move |mut socket| async move {
            handle_login(&mut socket).await;
            while let Some((seq, request)) = read_request(&mut socket).await {
                if request.cmd == CmdCode::Ping {
                    let _ = tx.send(());
                }
                send_response(&mut socket, seq, &Response::ok(request.args)).await;
            }
        })
        .await;

        let config = ConnectionConfig::new(addr.to_string())
            .with_keep_alive_interval(Duration::from_secs(1));
        let conn = Connection::connect(config).await.unwrap();

        // An idle connection gets pinged without any caller involvement.
        let ping = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(ping.is_ok(), "keep-alive ping never reached the server");
        conn.finalize();
    }

    #[tokio::test]
    async fn test_finalize_unblocks_waiters() {
        let addr = spawn_server(|mut socket| async move {
            handle_login(&mut socket).await;
            let _ = read_request(&mut socket).await;
            // Never reply; wait for the client to go away.
            let _ = read_request(&mut socket).await;
        })
        .await;

        let conn = connect_to(addr).await;
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.call(CmdCode::Select, 0, Vec::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.finalize();

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, ClientError::ConnectionClosed);
        assert_eq!(conn.state(), ConnState::Failed);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Connection::connect(ConnectionConfig::new(addr.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Network(_)));
    }

    #[tokio::test]
    async fn test_open_passes_uri_credentials_to_login() {
        let addr = spawn_server(|mut socket| async move {
            let (seq, request) = read_request(&mut socket).await.unwrap();
            assert_eq!(request.cmd, CmdCode::Login);
            assert_eq!(
                request.args,
                vec![Arg::from("alice"), Arg::from("s3cret"), Arg::from("events")]
            );
            send_response(&mut socket, seq, &Response::ok(Vec::new())).await;
            let _ = read_request(&mut socket).await;
        })
        .await;

        let uri = format!("vproto://alice:s3cret@{addr}/events");
        let conn = Connection::open(&uri, Duration::from_secs(5), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(conn.is_connected());
        // This login reply carried no start timestamp.
        assert_eq!(conn.server_start_time(), None);
        conn.finalize();
    }

    #[tokio::test]
    async fn test_call_deadline_already_expired() {
        let addr = spawn_echo_server().await;
        let conn = connect_to(addr).await;

        let err = conn
            .call_deadline(CmdCode::Ping, Instant::now(), Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Canceled);
        conn.finalize();
    }
}
