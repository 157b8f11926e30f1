//! Test doubles for the scheduler: a scripted device client and a registry
//! that can be switched into failure mode.

use super::SchedulerContext;
use crate::config::SchedulerConf;
use crate::device::{parse_sense_response, DeviceClient, DeviceError, SenseReport};
use crate::health::HealthTracker;
use crate::models::{Device, DeviceFilter, DeviceStatus, Reading};
use crate::store::{DeviceRegistry, JsonStore, ReadingSink, StatusChange, StatusWriter, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum SenseScript {
    Reply(String),
    /// Never answers; the caller's timeout decides
    Hang,
    Fail,
    Slow(Duration, String),
}

#[derive(Debug, Clone)]
pub enum EchoScript {
    Reply(String),
    Hang,
    Fail,
}

#[derive(Default)]
struct ScriptState {
    queued: HashMap<String, VecDeque<SenseScript>>,
    sense: HashMap<String, SenseScript>,
    echo: HashMap<String, EchoScript>,
    sense_calls: HashMap<String, Vec<Instant>>,
    echo_calls: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Device client answering from per-address scripts; unscripted calls fail.
#[derive(Default)]
pub struct ScriptedClient {
    state: Mutex<ScriptState>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default answer for every SENSE to this address
    pub fn set_sense(&self, address: &str, script: SenseScript) {
        self.state.lock().sense.insert(address.to_string(), script);
    }

    /// One-shot answer, consumed before the default
    pub fn push_sense(&self, address: &str, script: SenseScript) {
        self.state
            .lock()
            .queued
            .entry(address.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn set_echo(&self, address: &str, script: EchoScript) {
        self.state.lock().echo.insert(address.to_string(), script);
    }

    pub fn sense_calls(&self, address: &str) -> usize {
        self.state.lock().sense_calls.get(address).map_or(0, Vec::len)
    }

    pub fn sense_call_times(&self, address: &str) -> Vec<Instant> {
        self.state.lock().sense_calls.get(address).cloned().unwrap_or_default()
    }

    pub fn echo_calls(&self, address: &str) -> usize {
        self.state.lock().echo_calls.get(address).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self, address: &str) -> usize {
        self.state.lock().max_in_flight.get(address).copied().unwrap_or(0)
    }

    fn next_sense(&self, address: &str) -> SenseScript {
        let mut st = self.state.lock();
        st.sense_calls.entry(address.to_string()).or_default().push(Instant::now());
        let current = {
            let n = st.in_flight.entry(address.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let max = st.max_in_flight.entry(address.to_string()).or_insert(0);
        *max = (*max).max(current);

        if let Some(script) = st.queued.get_mut(address).and_then(VecDeque::pop_front) {
            return script;
        }
        st.sense.get(address).cloned().unwrap_or(SenseScript::Fail)
    }

    fn sense_done(&self, address: &str) {
        if let Some(n) = self.state.lock().in_flight.get_mut(address) {
            *n = n.saturating_sub(1);
        }
    }
}

/// Decrements the in-flight counter even when the call future is dropped
struct InFlight<'a> {
    client: &'a ScriptedClient,
    address: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.client.sense_done(self.address);
    }
}

#[async_trait]
impl DeviceClient for ScriptedClient {
    async fn sense(&self, address: &str, _at: OffsetDateTime) -> Result<SenseReport, DeviceError> {
        let script = self.next_sense(address);
        let _guard = InFlight { client: self, address };
        let body = match script {
            SenseScript::Reply(body) => body,
            SenseScript::Hang => std::future::pending::<String>().await,
            SenseScript::Fail => return Err(DeviceError::Transport("connection refused".into())),
            SenseScript::Slow(delay, body) => {
                tokio::time::sleep(delay).await;
                body
            }
        };
        Ok(parse_sense_response(&body)?)
    }

    async fn echo(&self, address: &str) -> Result<String, DeviceError> {
        let script = {
            let mut st = self.state.lock();
            *st.echo_calls.entry(address.to_string()).or_insert(0) += 1;
            st.echo.get(address).cloned().unwrap_or(EchoScript::Fail)
        };
        match script {
            EchoScript::Reply(body) if body.is_empty() => Err(DeviceError::EmptyEcho),
            EchoScript::Reply(body) => Ok(body),
            EchoScript::Hang => std::future::pending().await,
            EchoScript::Fail => Err(DeviceError::Transport("connection refused".into())),
        }
    }
}

/// Registry wrapper whose reads can be made to fail on demand
pub struct FlakyRegistry {
    inner: Arc<JsonStore>,
    failing: AtomicBool,
}

impl FlakyRegistry {
    pub fn new(inner: Arc<JsonStore>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("registry offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DeviceRegistry for FlakyRegistry {
    async fn list_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>, StoreError> {
        self.check()?;
        self.inner.list_devices(filter).await
    }

    async fn get_device(&self, name: &str) -> Result<Option<Device>, StoreError> {
        self.check()?;
        self.inner.get_device(name).await
    }
}

/// Status writer and reading sink whose writes can be made to fail on demand
pub struct FlakyWriter {
    inner: Arc<JsonStore>,
    status_failing: AtomicBool,
    readings_failing: AtomicBool,
}

impl FlakyWriter {
    pub fn new(inner: Arc<JsonStore>) -> Self {
        Self {
            inner,
            status_failing: AtomicBool::new(false),
            readings_failing: AtomicBool::new(false),
        }
    }

    pub fn fail_status(&self, failing: bool) {
        self.status_failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_readings(&self, failing: bool) {
        self.readings_failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatusWriter for FlakyWriter {
    async fn set_status(
        &self,
        name: &str,
        status: DeviceStatus,
        last_connected: OffsetDateTime,
    ) -> Result<StatusChange, StoreError> {
        if self.status_failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("status write refused".into()));
        }
        self.inner.set_status(name, status, last_connected).await
    }
}

#[async_trait]
impl ReadingSink for FlakyWriter {
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        if self.readings_failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reading write refused".into()));
        }
        self.inner.insert_reading(reading).await
    }
}

/// Context wired on an in-memory store with default settings
pub fn context_with(store: Arc<JsonStore>, client: Arc<dyn DeviceClient>) -> SchedulerContext {
    SchedulerContext {
        registry: store.clone(),
        status: store.clone(),
        readings: store,
        client,
        settings: SchedulerConf::default(),
        health: HealthTracker::new(),
        shutdown: CancellationToken::new(),
    }
}
