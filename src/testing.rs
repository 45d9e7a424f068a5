//! Test doubles shared by unit tests

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::audio::buffer::{AudioFrame, SharedRingBuffer};
use crate::audio::capture::{InputRequest, InputSource, InputStream};
use crate::audio::device::{AudioDevice, DeviceInventory, DeviceKind};
use crate::channel::{ChannelConnector, ChannelLink, Credential, NegotiationRequest, RemoteEnd, SessionNegotiator};
use crate::error::{AudioError, ChannelError, SessionError};

pub fn device(name: &str, is_default: bool) -> AudioDevice {
    AudioDevice {
        id: format!("input:{}", name),
        label: name.to_string(),
        kind: DeviceKind::Input,
        is_default,
    }
}

/// Inventory returning whatever the test last set
#[derive(Default)]
pub struct StaticInventory {
    devices: Mutex<Vec<AudioDevice>>,
    denied: AtomicBool,
}

impl StaticInventory {
    pub fn new(devices: Vec<AudioDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            denied: AtomicBool::new(false),
        }
    }

    pub fn set(&self, devices: Vec<AudioDevice>) {
        *self.devices.lock() = devices;
    }

    /// Refuse enumeration from now on
    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }
}

impl DeviceInventory for StaticInventory {
    fn enumerate(&self, kind: DeviceKind) -> Result<Vec<AudioDevice>, AudioError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceEnumeration("permission denied".to_string()));
        }
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct TestInputInner {
    sink: Mutex<Option<SharedRingBuffer>>,
    active: AtomicBool,
    fail: AtomicBool,
    opens: AtomicUsize,
    /// 0 follows the requested rate
    device_rate: AtomicU32,
    gate: Mutex<Option<crossbeam_channel::Receiver<()>>>,
    waiting: AtomicBool,
}

/// Mono input device fed by the test
#[derive(Clone, Default)]
pub struct TestInput {
    inner: Arc<TestInputInner>,
}

impl TestInput {
    pub fn fail_open(&self) {
        self.inner.fail.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.inner.sink.lock().is_some()
    }

    /// Run the device at a fixed rate regardless of the request
    pub fn set_device_rate(&self, rate: u32) {
        self.inner.device_rate.store(rate, Ordering::SeqCst);
    }

    /// Block the next `open` until the returned sender fires or drops
    pub fn gate(&self) -> crossbeam_channel::Sender<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        *self.inner.gate.lock() = Some(rx);
        tx
    }

    /// True while an `open` is held at the gate
    pub fn is_waiting(&self) -> bool {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Deliver one device callback; dropped unless open and active
    pub fn push(&self, samples: Vec<f32>) {
        if !self.inner.active.load(Ordering::SeqCst) {
            return;
        }
        if let Some(sink) = self.inner.sink.lock().as_ref() {
            sink.push(AudioFrame::new(samples, 1, 0));
        }
    }
}

struct TestInputStream {
    device_id: String,
    sample_rate: u32,
    inner: Arc<TestInputInner>,
}

impl InputSource for TestInput {
    fn open(
        &self,
        device_id: Option<&str>,
        request: &InputRequest,
        sink: SharedRingBuffer,
    ) -> Result<Box<dyn InputStream>, AudioError> {
        let gate = self.inner.gate.lock().take();
        if let Some(gate) = gate {
            self.inner.waiting.store(true, Ordering::SeqCst);
            let _ = gate.recv();
            self.inner.waiting.store(false, Ordering::SeqCst);
        }
        if self.inner.fail.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceUnavailable("test input unplugged".to_string()));
        }
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        *self.inner.sink.lock() = Some(sink);
        self.inner.active.store(false, Ordering::SeqCst);
        let sample_rate = match self.inner.device_rate.load(Ordering::SeqCst) {
            0 => request.sample_rate,
            rate => rate,
        };
        Ok(Box::new(TestInputStream {
            device_id: device_id.unwrap_or("input:test").to_string(),
            sample_rate,
            inner: self.inner.clone(),
        }))
    }
}

impl InputStream for TestInputStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_active(&mut self, active: bool) {
        self.inner.active.store(active, Ordering::SeqCst);
    }

    fn check_errors(&self) -> Option<AudioError> {
        None
    }

    fn close(&mut self) {
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.sink.lock().take();
    }
}

/// Negotiator with a canned answer and an optional gate
pub struct ScriptedNegotiator {
    result: Mutex<Result<Credential, SessionError>>,
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

impl ScriptedNegotiator {
    pub fn ok() -> Self {
        Self::with_result(Ok(Credential {
            value: "ek_test".to_string(),
            expires_at: None,
        }))
    }

    pub fn with_result(result: Result<Credential, SessionError>) -> Self {
        Self {
            result: Mutex::new(result),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Hold every negotiation until the returned notify fires
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionNegotiator for ScriptedNegotiator {
    async fn negotiate(&self, _request: &NegotiationRequest) -> Result<Credential, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.result.lock().clone()
    }
}

/// Connector handing out in-memory links; the test takes the remote end
#[derive(Default)]
pub struct LoopbackConnector {
    opens: AtomicUsize,
    fail: AtomicBool,
    gate: Option<Arc<Notify>>,
    remote: Mutex<Option<RemoteEnd>>,
}

impl LoopbackConnector {
    /// Hold every open until the returned notify fires
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let connector = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (connector, gate)
    }


    pub fn fail_open(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn take_remote(&self) -> Option<RemoteEnd> {
        self.remote.lock().take()
    }
}

#[async_trait]
impl ChannelConnector for LoopbackConnector {
    async fn open(&self, _credential: &Credential) -> Result<ChannelLink, ChannelError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChannelError::OpenFailed("loopback refused".to_string()));
        }
        let (link, remote) = ChannelLink::pair();
        *self.remote.lock() = Some(remote);
        Ok(link)
    }
}
