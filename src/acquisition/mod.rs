//-----------------------------------------------------------------------------
// Module acquisition
// Owns the active XCP session of one ECU, the cached signal definitions and the periodic acquisition task
// Every successful read is published as a Reading on a broadcast channel

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::a2l::{A2lDescription, A2lError, A2lReader, ConversionError, MalformedBlockPolicy};
use crate::catalog::{Catalog, DescriptionSource, EcuDescriptor, EcuId, Signal, SignalId, SignalKey};
use crate::xcp::{Connector, SessionConfig, XcpError, XcpSession};

mod periodic;
use periodic::PeriodicTask;

/// Signals registered from a description get ids from here on
pub const LOCAL_SIGNAL_ID_BASE: u32 = 0x8000_0000;

/// Shortest interval of the periodic acquisition
pub const MIN_PERIODIC_INTERVAL: Duration = Duration::from_millis(1);

//-------------------------------------------------------------------------------------------------
// AcquisitionError

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("no transport configured for ECU `{0}`")]
    NoTransportConfigured(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("unknown ECU {0}")]
    UnknownEcu(EcuId),

    #[error("unknown signal {0}")]
    UnknownSignal(SignalId),

    #[error("no parameter `{0}` in the description of the connected ECU")]
    UnknownDefinition(String),

    #[error("not connected")]
    NotConnected,

    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Xcp(#[from] XcpError),

    #[error("description error: {0}")]
    Description(#[from] A2lError),

    #[error("description `{path}` not readable: {source}")]
    DescriptionSource {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

//-------------------------------------------------------------------------------------------------
// Reading

/// One converted value of a signal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub signal_id: SignalId,
    pub key: SignalKey,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

//-------------------------------------------------------------------------------------------------
// AcquisitionConfig

#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub session: SessionConfig,
    pub malformed_block_policy: MalformedBlockPolicy,
    /// Capacity of the Reading channel, slow subscribers lose the oldest readings
    pub channel_capacity: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        AcquisitionConfig {
            session: SessionConfig::default(),
            malformed_block_policy: MalformedBlockPolicy::Skip,
            channel_capacity: 1024,
        }
    }
}

//-------------------------------------------------------------------------------------------------
// Acquisition

#[derive(Clone)]
struct ActiveSession {
    ecu: EcuDescriptor,
    session: Arc<XcpSession>,
    cancel: CancellationToken,
    description: Arc<A2lDescription>,
}

type DescriptionKey = (String, Option<String>);

struct Inner {
    catalog: Arc<dyn Catalog>,
    source: Arc<dyn DescriptionSource>,
    connector: Arc<dyn Connector>,
    config: AcquisitionConfig,

    active: Mutex<Option<ActiveSession>>,
    signals: RwLock<HashMap<SignalId, Signal>>,
    ecu_signals: Mutex<HashMap<EcuId, Vec<SignalId>>>,
    descriptions: Mutex<HashMap<DescriptionKey, Arc<A2lDescription>>>,
    events: broadcast::Sender<Reading>,
    next_local_id: AtomicU32,
}

/// Acquisition coordinator
pub struct Acquisition {
    inner: Arc<Inner>,
    // Serializes connect and disconnect
    lifecycle: tokio::sync::Mutex<()>,
    periodic: tokio::sync::Mutex<Option<PeriodicTask>>,
}

impl Acquisition {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        source: Arc<dyn DescriptionSource>,
        connector: Arc<dyn Connector>,
        config: AcquisitionConfig,
    ) -> Acquisition {
        let (events, _) = broadcast::channel(config.channel_capacity.max(1));
        Acquisition {
            inner: Arc::new(Inner {
                catalog,
                source,
                connector,
                config,
                active: Mutex::new(None),
                signals: RwLock::new(HashMap::new()),
                ecu_signals: Mutex::new(HashMap::new()),
                descriptions: Mutex::new(HashMap::new()),
                events,
                next_local_id: AtomicU32::new(LOCAL_SIGNAL_ID_BASE),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            periodic: tokio::sync::Mutex::new(None),
        }
    }

    //------------------------------------------------------------------------
    // Session lifecycle

    /// Connect to an ECU, an existing session is disconnected first
    /// The description of the ECU is decoded once and cached, a failure to load it disconnects again
    pub async fn connect(&self, ecu: EcuDescriptor) -> Result<(), AcquisitionError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.shutdown().await;

        let (host, port) = ecu.endpoint().ok_or_else(|| AcquisitionError::NoTransportConfigured(ecu.name.clone()))?;
        let session = Arc::new(XcpSession::new(host, port, self.inner.connector.clone(), self.inner.config.session.clone()));
        let cancel = CancellationToken::new();
        session.connect(&cancel).await.map_err(|e| match e {
            XcpError::ConnectFailed(msg) => AcquisitionError::ConnectFailed(msg),
            other => AcquisitionError::ConnectFailed(other.to_string()),
        })?;

        let description = match self.inner.load_description(&ecu.a2l_path).await {
            Ok(description) => description,
            Err(e) => {
                error!("ECU {}: {}", ecu.name, e);
                session.disconnect(&cancel).await;
                return Err(e);
            }
        };

        info!(
            "Connected to ECU {} ({}:{}), {} {} with {} parameters",
            ecu.name,
            host,
            port,
            description.project_name,
            description.module_name,
            description.definitions.len()
        );
        *self.inner.active.lock() = Some(ActiveSession {
            ecu,
            session,
            cancel,
            description,
        });
        Ok(())
    }

    /// Look up an ECU in the catalog and connect to it
    pub async fn connect_ecu(&self, ecu_id: EcuId) -> Result<(), AcquisitionError> {
        let ecu = self.inner.catalog.get_ecu(ecu_id).ok_or(AcquisitionError::UnknownEcu(ecu_id))?;
        self.connect(ecu).await
    }

    /// Cancel pending reads, stop the periodic task, then disconnect and release the session
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.shutdown().await;
    }

    // Reads still waiting for the ECU are cancelled first, DISCONNECT is then sent with a fresh token
    async fn shutdown(&self) {
        let active = self.inner.active.lock().take();
        if let Some(active) = &active {
            active.cancel.cancel();
        }
        self.stop_periodic().await;
        if let Some(active) = active {
            active.session.disconnect(&CancellationToken::new()).await;
            info!("Disconnected from ECU {}", active.ecu.name);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.active.lock().as_ref().map(|a| a.session.is_connected()).unwrap_or(false)
    }

    /// ECU of the current session
    pub fn connected_ecu(&self) -> Option<EcuDescriptor> {
        self.inner.active.lock().as_ref().map(|a| a.ecu.clone())
    }

    /// Decoded description of the connected ECU
    pub fn description(&self) -> Option<Arc<A2lDescription>> {
        self.inner.active.lock().as_ref().map(|a| a.description.clone())
    }

    //------------------------------------------------------------------------
    // Signals

    /// Signals of an ECU from the catalog
    pub fn available_signals(&self, ecu_id: EcuId) -> Vec<Signal> {
        self.inner.available_signals(ecu_id)
    }

    /// Snapshot of a signal, including its current value
    pub fn signal(&self, id: SignalId) -> Option<Signal> {
        self.inner.resolve(id).ok()
    }

    /// Make a parameter of the connected ECU description readable as a signal
    /// Registering the same parameter again returns the same id
    pub fn register_definition(&self, name: &str) -> Result<SignalId, AcquisitionError> {
        self.inner.register_definition(name)
    }

    //------------------------------------------------------------------------
    // Reading

    /// Read, convert and publish the current value of a signal
    /// The signal is read from the connected ECU at its address, also if the catalog assigns it to another ECU
    pub async fn read_once(&self, id: SignalId) -> Result<f64, AcquisitionError> {
        self.inner.read_once(id).await
    }

    /// Receiver for all readings published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Reading> {
        self.inner.events.subscribe()
    }

    /// Start reading the signals round robin, once per interval
    /// A running periodic task is stopped first, an empty signal list starts nothing
    /// The interval is at least MIN_PERIODIC_INTERVAL
    pub async fn start_periodic(&self, ids: &[SignalId], interval: Duration) {
        let mut periodic = self.periodic.lock().await;
        if let Some(task) = periodic.take() {
            task.stop(&self.inner).await;
        }
        if ids.is_empty() {
            warn!("Periodic acquisition without signals not started");
            return;
        }
        let interval = interval.max(MIN_PERIODIC_INTERVAL);
        *periodic = Some(PeriodicTask::start(self.inner.clone(), ids.to_vec(), interval));
    }

    /// Stop the periodic task and wait until it has finished
    pub async fn stop_periodic(&self) {
        let task = self.periodic.lock().await.take();
        if let Some(task) = task {
            task.stop(&self.inner).await;
        }
    }

    pub async fn is_periodic_running(&self) -> bool {
        self.periodic.lock().await.is_some()
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if let Ok(mut periodic) = self.periodic.try_lock() {
            if let Some(task) = periodic.take() {
                task.cancel();
            }
        }
        if let Some(active) = self.inner.active.lock().take() {
            active.cancel.cancel();
        }
    }
}

//-------------------------------------------------------------------------------------------------

impl Inner {
    fn active(&self) -> Result<ActiveSession, AcquisitionError> {
        self.active.lock().clone().ok_or(AcquisitionError::NotConnected)
    }

    // Decoded description by (path, revision), an older revision of the same path is evicted
    async fn load_description(&self, path: &str) -> Result<Arc<A2lDescription>, AcquisitionError> {
        let source_error = |source| AcquisitionError::DescriptionSource { path: path.to_string(), source };

        let revision = self.source.revision(path).await.map_err(source_error)?;
        let key = (path.to_string(), revision);
        if let Some(description) = self.descriptions.lock().get(&key) {
            debug!("Description {} revision {:?} cached", path, key.1);
            return Ok(description.clone());
        }

        let text = self.source.read(path).await.map_err(source_error)?;
        let description = A2lReader::with_policy(self.config.malformed_block_policy).decode(&text)?;
        for skipped in &description.skipped {
            warn!("{}: skipped {}", path, skipped);
        }
        info!(
            "Loaded description {} revision {:?}: {} measurements, {} characteristics",
            path,
            key.1,
            description.measurements().count(),
            description.characteristics().count()
        );

        let description = Arc::new(description);
        let mut descriptions = self.descriptions.lock();
        descriptions.retain(|(p, _), _| p != path);
        descriptions.insert(key, description.clone());
        Ok(description)
    }

    // Cache first, then the catalog, the catalog result is cached
    fn resolve(&self, id: SignalId) -> Result<Signal, AcquisitionError> {
        if let Some(signal) = self.signals.read().get(&id) {
            return Ok(signal.clone());
        }
        let signal = self.catalog.get_signal(id).ok_or(AcquisitionError::UnknownSignal(id))?;
        trace!("Signal {} resolved from catalog: {}", id, signal.key());
        Ok(self.signals.write().entry(id).or_insert(signal).clone())
    }

    fn available_signals(&self, ecu_id: EcuId) -> Vec<Signal> {
        let ids = {
            let mut ecu_signals = self.ecu_signals.lock();
            match ecu_signals.get(&ecu_id) {
                Some(ids) => ids.clone(),
                None => {
                    let signals = self.catalog.get_signals_for_ecu(ecu_id);
                    let ids: Vec<SignalId> = signals.iter().map(|s| s.id).collect();
                    let mut cache = self.signals.write();
                    for signal in signals {
                        cache.entry(signal.id).or_insert(signal);
                    }
                    ecu_signals.insert(ecu_id, ids.clone());
                    ids
                }
            }
        };
        let cache = self.signals.read();
        ids.iter().filter_map(|id| cache.get(id).cloned()).collect()
    }

    fn register_definition(&self, name: &str) -> Result<SignalId, AcquisitionError> {
        let active = self.active()?;
        let definition = active
            .description
            .find(name)
            .ok_or_else(|| AcquisitionError::UnknownDefinition(name.to_string()))?;

        let mut signals = self.signals.write();
        if let Some(existing) = signals
            .values()
            .find(|s| s.ecu_id == active.ecu.id && s.definition.name == definition.name && s.definition.address == definition.address)
        {
            return Ok(existing.id);
        }
        let id = SignalId(self.next_local_id.fetch_add(1, Ordering::Relaxed));
        debug!("Register {} {} as signal {}", definition.name, definition.data_type, id);
        signals.insert(id, Signal::new(id, active.ecu.id, definition.clone()));
        Ok(id)
    }

    async fn read_once(&self, id: SignalId) -> Result<f64, AcquisitionError> {
        let signal = self.resolve(id)?;
        let active = self.active()?;
        if signal.ecu_id != active.ecu.id {
            debug!("Signal {} of ECU {} read from connected ECU {}", signal.key(), signal.ecu_id, active.ecu.id);
        }

        let raw = active
            .session
            .read_typed(signal.definition.address, signal.definition.data_type, &active.cancel)
            .await?;
        let value = signal.convert(raw)?;
        trace!("{} = {} (raw {})", signal.key(), value, raw);

        if let Some(s) = self.signals.write().get_mut(&id) {
            s.current_value = Some(value);
        }
        let reading = Reading {
            signal_id: id,
            key: signal.key(),
            value,
            timestamp: Utc::now(),
        };
        // No receivers is not an error
        let _ = self.events.send(reading);
        Ok(value)
    }

    fn set_monitored(&self, ids: &[SignalId], monitored: bool) {
        for id in ids {
            if monitored {
                let _ = self.resolve(*id);
            }
            if let Some(s) = self.signals.write().get_mut(id) {
                s.is_monitored = monitored;
            }
        }
    }
}

//-------------------------------------------------------------------------------------------------
