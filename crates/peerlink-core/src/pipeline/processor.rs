//! Processor chain
//!
//! Processors run in order on every adapted event. A processor may rewrite an
//! event, drop it by returning `Ok(None)`, or fail. Failures and panics are
//! contained here: the event is dropped and the publishing path carries on.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, error, trace};

use super::PipelineStats;
use crate::errors::ProcessorError;
use crate::event::{DomainEvent, EventKind};
use crate::types::{DeviceId, SystemTimeSource, TimeSource, Timestamp};

/// Outcome of one processing step
pub type ProcessResult = Result<Option<DomainEvent>, ProcessorError>;

/// One step of the processor chain.
///
/// Called concurrently from native callback threads, hence `&self`.
pub trait EventProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, event: DomainEvent) -> ProcessResult;
}

// ----------------------------------------------------------------------------
// Processor Chain
// ----------------------------------------------------------------------------

/// Ordered list of processors applied to each event
#[derive(Clone, Default)]
pub struct ProcessorChain {
    processors: Vec<Arc<dyn EventProcessor>>,
}

impl ProcessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, processor: Arc<dyn EventProcessor>) {
        self.processors.push(processor);
    }

    pub fn with(mut self, processor: Arc<dyn EventProcessor>) -> Self {
        self.push(processor);
        self
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Run `event` through every processor; `None` means it was dropped
    pub fn run(&self, mut event: DomainEvent, stats: &PipelineStats) -> Option<DomainEvent> {
        for processor in &self.processors {
            let name = event.name();
            let outcome = catch_unwind(AssertUnwindSafe(|| processor.process(event)));
            event = match outcome {
                Ok(Ok(Some(next))) => next,
                Ok(Ok(None)) => {
                    trace!("{} dropped {}", processor.name(), name);
                    stats.record_dropped();
                    return None;
                }
                Ok(Err(err)) => {
                    error!("{}; dropping {}", err, name);
                    stats.record_processor_failure();
                    return None;
                }
                Err(_) => {
                    error!("Processor {} panicked; dropping {}", processor.name(), name);
                    stats.record_processor_failure();
                    return None;
                }
            };
        }
        Some(event)
    }
}

impl core::fmt::Debug for ProcessorChain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<&str> = self.processors.iter().map(|p| p.name()).collect();
        f.debug_struct("ProcessorChain").field("processors", &names).finish()
    }
}

// ----------------------------------------------------------------------------
// Duplicate Suppressor
// ----------------------------------------------------------------------------

/// Drops an event identical to the previous event from the same source when
/// both arrive within the window.
///
/// Sources are devices, plus one source each for the advertising and
/// discovering flags. Only consecutive repeats are suppressed, so a device
/// that is found, lost and found again still produces three events.
pub struct DuplicateSuppressor {
    window: Duration,
    capacity: usize,
    last_seen: Mutex<HashMap<String, (String, Timestamp)>>,
    time_source: Box<dyn TimeSource>,
}

impl DuplicateSuppressor {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self::with_time_source(window, capacity, SystemTimeSource)
    }

    pub fn with_time_source<T: TimeSource + 'static>(
        window: Duration,
        capacity: usize,
        time_source: T,
    ) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            last_seen: Mutex::new(HashMap::new()),
            time_source: Box::new(time_source),
        }
    }

    /// Source key and fingerprint; `None` for events that are never duplicates
    fn fingerprint(event: &DomainEvent) -> Option<(String, String)> {
        let fingerprint = match &event.kind {
            EventKind::DeviceFound { device } => format!("found:{:?}", device.display_name),
            EventKind::DeviceLost { .. } => "lost".to_string(),
            EventKind::ConnectionRequested { .. } => "requested".to_string(),
            EventKind::ConnectionResponded { accepted, .. } => format!("responded:{}", accepted),
            EventKind::DeviceStateChanged { device, previous } => {
                format!("state:{}->{}", previous, device.state)
            }
            EventKind::DeviceDisconnected { .. } => "disconnected".to_string(),
            EventKind::DataReceived {
                payload_id: Some(payload_id),
                ..
            } => format!("data:{}", payload_id),
            // Identical unnumbered messages are legitimate repeats
            EventKind::DataReceived { payload_id: None, .. } => return None,
            EventKind::TransferProgress { progress, .. } => format!(
                "progress:{}:{}:{:?}",
                progress.payload_id, progress.bytes_transferred, progress.status
            ),
            EventKind::AdvertisingStateChanged { is_advertising } => {
                return Some(("@advertising".to_string(), is_advertising.to_string()));
            }
            EventKind::DiscoveringStateChanged { is_discovering } => {
                return Some(("@discovering".to_string(), is_discovering.to_string()));
            }
        };
        let source = event.device()?.id.to_string();
        Some((source, fingerprint))
    }

    fn evict(&self, entries: &mut HashMap<String, (String, Timestamp)>, now: Timestamp) {
        let window_ms = self.window.as_millis() as u64;
        entries.retain(|_, (_, seen)| now - *seen <= window_ms);
        while entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (_, seen))| *seen)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn tracked_sources(&self) -> usize {
        self.last_seen.lock().map(|e| e.len()).unwrap_or(0)
    }
}

impl EventProcessor for DuplicateSuppressor {
    fn name(&self) -> &str {
        "duplicate-suppressor"
    }

    fn process(&self, event: DomainEvent) -> ProcessResult {
        let Some((source, fingerprint)) = Self::fingerprint(&event) else {
            return Ok(Some(event));
        };
        let now = self.time_source.now();
        let window_ms = self.window.as_millis() as u64;

        let mut entries = self
            .last_seen
            .lock()
            .map_err(|_| ProcessorError::new(self.name(), "fingerprint table poisoned"))?;

        if let Some((previous, seen)) = entries.get(&source) {
            if *previous == fingerprint && now - *seen <= window_ms {
                debug!("Suppressing duplicate {} for {}", event.name(), source);
                return Ok(None);
            }
        }

        if !entries.contains_key(&source) && entries.len() >= self.capacity {
            self.evict(&mut entries, now);
        }
        entries.insert(source, (fingerprint, now));
        Ok(Some(event))
    }
}

// ----------------------------------------------------------------------------
// Device Filter
// ----------------------------------------------------------------------------

/// Drops every event concerning a blocked device
#[derive(Default)]
pub struct DeviceFilter {
    blocked: RwLock<HashSet<DeviceId>>,
}

impl DeviceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocking<I, D>(ids: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        Self {
            blocked: RwLock::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn block(&self, id: impl Into<DeviceId>) {
        if let Ok(mut blocked) = self.blocked.write() {
            blocked.insert(id.into());
        }
    }

    pub fn unblock(&self, id: &DeviceId) -> bool {
        self.blocked
            .write()
            .map(|mut blocked| blocked.remove(id))
            .unwrap_or(false)
    }

    pub fn is_blocked(&self, id: &DeviceId) -> bool {
        self.blocked
            .read()
            .map(|blocked| blocked.contains(id))
            .unwrap_or(false)
    }
}

impl EventProcessor for DeviceFilter {
    fn name(&self) -> &str {
        "device-filter"
    }

    fn process(&self, event: DomainEvent) -> ProcessResult {
        match event.device() {
            Some(device) if self.is_blocked(&device.id) => Ok(None),
            _ => Ok(Some(event)),
        }
    }
}

// ----------------------------------------------------------------------------
// Closure Processor
// ----------------------------------------------------------------------------

/// Processor backed by a closure
pub struct FnProcessor<F> {
    name: String,
    func: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(DomainEvent) -> ProcessResult + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> EventProcessor for FnProcessor<F>
where
    F: Fn(DomainEvent) -> ProcessResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, event: DomainEvent) -> ProcessResult {
        (self.func)(event)
    }
}
