//! Stratum pool client
//!
//! A blocking protocol engine: one thread runs [`Client::run`] and reads the
//! socket, any thread may send through the shared writer. Transport failures
//! inside the receive loop are answered with [`Client::reconnect`]; a single
//! bad pool message is dropped and logged.

pub mod backoff;
pub mod connection;
pub mod message;
pub mod solo;

pub use backoff::{ReconnectBackoff, ReconnectPolicy};
pub use connection::PoolAddress;
pub use message::{StratumMessage, StratumMethod, StratumRequest, StratumResponse, Subscription};

use crate::types::{RunFlag, RunState};
use crate::work::{Job, Work};
use crate::{Error, Result};
use connection::LineReader;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Default agent string sent with `mining.subscribe`
pub const DEFAULT_AGENT: &str = "meritminer/0.0.1";

/// Longest wait for the subscribe response
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest silence tolerated from the pool before the connection is dropped
const RECV_STALL: Duration = Duration::from_secs(60);

/// Difficulty applied until the pool sends `mining.set_difficulty`
const DEFAULT_DIFFICULTY: f64 = 1.0;

const SUBSCRIBE_ID: u64 = 1;
const AUTHORIZE_ID: u64 = 2;
/// Ids at or above this one belong to share submissions
const FIRST_SUBMIT_ID: u64 = 4;

/// Granularity of interruptible sleeps
const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// Handshake progress of the current socket
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Subscribing = 3,
    Subscribed = 4,
    Authorizing = 5,
    Authorized = 6,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Subscribing,
            4 => Self::Subscribed,
            5 => Self::Authorizing,
            6 => Self::Authorized,
            _ => Self::Disconnected,
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    /// Primary pool first, failover pools after it
    pools: Vec<String>,
    pool_index: usize,
    address: Option<PoolAddress>,
    user: String,
    pass: String,
    session_id: Option<String>,
    xnonce1: Vec<u8>,
    xnonce2_size: usize,
}

#[derive(Debug)]
struct JobSlot {
    job: Option<Job>,
    fresh: bool,
    next_diff: f64,
}

impl Default for JobSlot {
    fn default() -> Self {
        Self {
            job: None,
            fresh: false,
            next_diff: DEFAULT_DIFFICULTY,
        }
    }
}

/// Stratum client shared between the receive loop and its callers
pub struct Client {
    state: AtomicU8,
    run_state: RunFlag,
    agent: RwLock<String>,
    session: Mutex<Session>,
    writer: Mutex<Option<TcpStream>>,
    reader: Mutex<Option<LineReader>>,
    jobs: Mutex<JobSlot>,
    policy: ReconnectPolicy,
    solo_job_id: AtomicU32,
    submit_id: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl Client {
    pub fn new() -> Self {
        Self::with_policy(ReconnectPolicy::default())
    }

    /// Create a client with a custom reconnect policy
    pub fn with_policy(policy: ReconnectPolicy) -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            run_state: RunFlag::new(),
            agent: RwLock::new(DEFAULT_AGENT.to_string()),
            session: Mutex::new(Session::default()),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            jobs: Mutex::new(JobSlot::default()),
            policy,
            solo_job_id: AtomicU32::new(0),
            submit_id: AtomicU64::new(FIRST_SUBMIT_ID),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn set_agent(&self, software: &str, version: &str) {
        *self.agent.write() = format!("{}/{}", software, version);
    }

    pub fn agent(&self) -> String {
        self.agent.read().clone()
    }

    /// Open a connection to the pool at `url` and remember the credentials
    pub fn connect(&self, url: &str, user: &str, pass: &str) -> Result<()> {
        let address = PoolAddress::parse(url)?;
        {
            let mut session = self.session.lock();
            if session.pools.is_empty() {
                session.pools.push(url.to_string());
            } else {
                session.pools[0] = url.to_string();
            }
            session.pool_index = 0;
            session.address = Some(address.clone());
            session.user = user.to_string();
            session.pass = pass.to_string();
        }
        self.open(&address)
    }

    /// Append a failover pool
    pub fn add_pool(&self, url: &str) -> Result<()> {
        PoolAddress::parse(url)?;
        self.session.lock().pools.push(url.to_string());
        Ok(())
    }

    fn open(&self, address: &PoolAddress) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        info!(pool = %address, "Connecting to pool");

        let stream = match connection::open(address) {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let read_half = stream.try_clone()?;

        let mut writer = self.writer.lock();
        *writer = Some(stream);
        *self.reader.lock() = Some(LineReader::new(read_half));
        self.set_state(ConnectionState::Connected);
        info!(pool = %address, "Connected to pool");
        Ok(())
    }

    /// Send `mining.subscribe` and read the session parameters
    ///
    /// A session id from an earlier subscribe on the same connection is
    /// offered back to the pool. `disconnect` forgets it, so a reconnect
    /// always starts a fresh session.
    pub fn subscribe(&self) -> Result<()> {
        self.set_state(ConnectionState::Subscribing);

        let mut params = vec![Value::from(self.agent())];
        if let Some(session_id) = self.session.lock().session_id.clone() {
            params.push(Value::from(session_id));
        }
        let request = StratumRequest::new(SUBSCRIBE_ID, StratumMethod::Subscribe, params);
        self.send(&request.to_line()?)?;

        let line = self
            .recv(SUBSCRIBE_TIMEOUT)?
            .ok_or_else(|| Error::invalid_state("stopped while subscribing"))?;
        let response = match StratumMessage::from_json(&line)? {
            StratumMessage::Response(response) => response,
            StratumMessage::Request(request) => {
                return Err(Error::stratum(format!(
                    "expected subscribe response, got {}",
                    request.method
                )))
            }
        };
        let subscription = message::parse_subscribe_result(&response)?;

        debug!(
            session_id = %subscription.session_id,
            xnonce1 = %hex::encode(&subscription.xnonce1),
            xnonce2_size = subscription.xnonce2_size,
            "Subscribed"
        );
        {
            let mut session = self.session.lock();
            session.session_id = Some(subscription.session_id);
            session.xnonce1 = subscription.xnonce1;
            session.xnonce2_size = subscription.xnonce2_size;
        }
        self.jobs.lock().next_diff = DEFAULT_DIFFICULTY;
        self.set_state(ConnectionState::Subscribed);
        Ok(())
    }

    /// Send `mining.authorize`; the pool's answer is not awaited
    pub fn authorize(&self) -> Result<()> {
        self.set_state(ConnectionState::Authorizing);

        let (user, pass) = {
            let session = self.session.lock();
            (session.user.clone(), session.pass.clone())
        };
        let request = StratumRequest::new(
            AUTHORIZE_ID,
            StratumMethod::Authorize,
            vec![Value::from(user.as_str()), Value::from(pass)],
        );
        self.send(&request.to_line()?)?;

        self.set_state(ConnectionState::Authorized);
        info!(user = %user, "Authorized with pool");
        Ok(())
    }

    /// Receive loop; returns false when the loop was already running
    pub fn run(&self) -> bool {
        if !self.run_state.start() {
            return false;
        }
        info!("Stratum receive loop started");

        while self.running() {
            match self.recv(RECV_STALL) {
                Ok(Some(line)) => {
                    if let Err(e) = self.handle_line(&line) {
                        if e.is_retryable() {
                            warn!(error = %e, "Pool connection failed");
                            self.reconnect();
                        } else {
                            warn!(error = %e, category = e.category(), "Dropping pool message");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Pool connection lost");
                    self.reconnect();
                }
            }
        }

        self.run_state.finish();
        info!("Stratum receive loop stopped");
        true
    }

    /// Ask the receive loop to exit
    pub fn stop(&self) {
        if self.run_state.request_stop() {
            debug!("Stratum stop requested");
        }
    }

    /// Close the socket and forget the session
    pub fn disconnect(&self) {
        {
            let mut writer = self.writer.lock();
            if let Some(stream) = writer.take() {
                connection::shutdown(&stream);
            }
            self.reader.lock().take();
        }
        {
            let mut session = self.session.lock();
            session.session_id = None;
            session.xnonce1.clear();
            session.xnonce2_size = 0;
        }
        *self.jobs.lock() = JobSlot::default();

        if self.state() != ConnectionState::Disconnected {
            info!("Disconnected from pool");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Drop the connection and retry until the handshake succeeds again or
    /// the loop is asked to stop
    pub fn reconnect(&self) {
        self.disconnect();

        let mut backoff = ReconnectBackoff::new(self.policy.clone());
        while self.running() {
            match self.establish() {
                Ok(()) => {
                    info!("Reconnected to pool");
                    return;
                }
                Err(e) => {
                    let (delay, failover) = backoff.on_failure();
                    warn!(error = %e, delay = ?delay, "Reconnect failed, backing off");
                    if failover {
                        self.failover();
                    }
                    self.pause(delay);
                }
            }
        }
    }

    fn establish(&self) -> Result<()> {
        let address = self
            .session
            .lock()
            .address
            .clone()
            .ok_or_else(|| Error::config("no pool configured"))?;

        let result = self
            .open(&address)
            .and_then(|_| self.subscribe())
            .and_then(|_| self.authorize());
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    /// Move to the next configured pool
    fn failover(&self) {
        let mut session = self.session.lock();
        if session.pools.len() < 2 {
            return;
        }
        session.pool_index = (session.pool_index + 1) % session.pools.len();
        let url = session.pools[session.pool_index].clone();
        match PoolAddress::parse(&url) {
            Ok(address) => {
                info!(pool = %address, "Failing over to next pool");
                session.address = Some(address);
            }
            Err(e) => error!(url = %url, error = %e, "Skipping invalid failover pool"),
        }
    }

    /// Sleep for `delay` unless the loop is asked to stop first
    fn pause(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while self.running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }

    fn send(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock();
        let stream = writer
            .as_mut()
            .ok_or_else(|| Error::network("not connected"))?;
        trace!("SEND {}", line);
        connection::write_line(stream, line)
    }

    fn recv(&self, stall: Duration) -> Result<Option<String>> {
        let mut reader = self.reader.lock();
        let reader = reader
            .as_mut()
            .ok_or_else(|| Error::network("not connected"))?;
        let line = reader.read_line(stall, || self.stopping())?;
        if let Some(line) = &line {
            trace!("RECV {}", line);
        }
        Ok(line)
    }

    fn handle_line(&self, line: &str) -> Result<()> {
        if line.trim().is_empty() {
            return Ok(());
        }
        match StratumMessage::from_json(line)? {
            StratumMessage::Request(request) => self.handle_command(&request),
            StratumMessage::Response(response) => {
                self.handle_response(&response);
                Ok(())
            }
        }
    }

    /// Dispatch one pool command
    pub fn handle_command(&self, request: &StratumRequest) -> Result<()> {
        match request.method_enum() {
            StratumMethod::Notify => self.mining_notify(&request.params),
            StratumMethod::SetDifficulty => {
                let diff = message::parse_difficulty(&request.params)?;
                self.jobs.lock().next_diff = diff;
                info!(difficulty = diff, "Pool set difficulty");
                Ok(())
            }
            StratumMethod::Reconnect => {
                let target = message::parse_reconnect(&request.params);
                {
                    let mut session = self.session.lock();
                    if let Some(current) = session.address.as_mut() {
                        if let Some(host) = target.host {
                            current.host = host;
                        }
                        if let Some(port) = target.port {
                            current.port = port;
                        }
                        info!(pool = %current, wait = target.wait_secs, "Pool requested reconnect");
                    }
                }
                self.disconnect();
                self.pause(Duration::from_secs(target.wait_secs));
                self.reconnect();
                Ok(())
            }
            StratumMethod::GetVersion => {
                let response = StratumResponse::success(request.id.clone(), Value::from(self.agent()));
                self.send(&response.to_line()?)
            }
            StratumMethod::ShowMessage => {
                let text = request
                    .params
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                info!(message = %text, "Message from pool");
                Ok(())
            }
            _ => {
                warn!(method = %request.method, "Ignoring unsupported pool method");
                Ok(())
            }
        }
    }

    fn mining_notify(&self, params: &[Value]) -> Result<()> {
        let (xnonce1, xnonce2_size) = {
            let session = self.session.lock();
            (session.xnonce1.clone(), session.xnonce2_size)
        };

        let mut jobs = self.jobs.lock();
        let job = message::parse_notify(params, &xnonce1, xnonce2_size, jobs.next_diff)?;
        debug!(job_id = %job.id, clean = job.clean, difficulty = job.diff, "New job");
        jobs.job = Some(job);
        jobs.fresh = true;
        Ok(())
    }

    fn handle_response(&self, response: &StratumResponse) {
        let id = response.id.as_u64().unwrap_or(0);
        if id < FIRST_SUBMIT_ID {
            debug!(id, result = ?response.result, error = ?response.error, "Pool response");
            return;
        }

        if response.is_accepted() {
            self.accepted.fetch_add(1, Ordering::Relaxed);
            info!(id, "Share accepted");
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            let reason = response
                .error
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_else(|| "rejected".to_string());
            warn!(id, reason = %reason, "Share rejected");
        }
    }

    /// Latest job, at most once per notification
    pub fn get_job(&self) -> Option<Job> {
        let mut jobs = self.jobs.lock();
        if !jobs.fresh {
            return None;
        }
        jobs.fresh = false;
        jobs.job.clone()
    }

    /// Send a solved work to the pool; a failed send drops the connection
    pub fn submit_work(&self, work: &Work) {
        let user = self.session.lock().user.clone();
        let id = self.submit_id.fetch_add(1, Ordering::Relaxed);
        let request = StratumRequest::new(
            id,
            StratumMethod::Submit,
            message::submit_params(&user, work),
        );

        match request.to_line().and_then(|line| self.send(&line)) {
            Ok(()) => info!(id, job_id = %work.job_id, nonce = work.nonce(), "Submitted share"),
            Err(e) => {
                error!(error = %e, job_id = %work.job_id, "Failed to submit share");
                self.disconnect();
            }
        }
    }

    /// Fetch a block template from the node and turn it into a job
    pub fn get_solo_job(&self, auth_token: &str) -> Result<Job> {
        let address = self
            .session
            .lock()
            .address
            .clone()
            .ok_or_else(|| Error::config("no node configured"))?;

        let template = solo::fetch_template(&address, auth_token)?;
        let id = self.solo_job_id.fetch_add(1, Ordering::Relaxed);
        let diff = self.jobs.lock().next_diff;
        solo::template_to_job(&template, id.to_string(), diff)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether a socket is open
    pub fn connected(&self) -> bool {
        self.state() >= ConnectionState::Connected
    }

    pub fn run_state(&self) -> RunState {
        self.run_state.get()
    }

    pub fn running(&self) -> bool {
        self.run_state.is_running()
    }

    pub fn stopping(&self) -> bool {
        self.run_state.is_stopping()
    }

    pub fn accepted_shares(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected_shares(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Pool currently connected to, or next to be tried
    pub fn current_pool(&self) -> Option<PoolAddress> {
        self.session.lock().address.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.lock().session_id.clone()
    }

    pub fn xnonce1(&self) -> Vec<u8> {
        self.session.lock().xnonce1.clone()
    }

    pub fn xnonce2_size(&self) -> usize {
        self.session.lock().xnonce2_size
    }

    /// Difficulty that the next job will carry
    pub fn next_difficulty(&self) -> f64 {
        self.jobs.lock().next_diff
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
