//! Device registry: the single owner of device lifecycle state
//!
//! Each device lives in its own slot behind a per-device mutex, so state
//! transitions on one id are serialized while different devices proceed in
//! parallel. Slow adapter calls (connect, disconnect) run with no lock held;
//! only the final commit takes the slot lock. Every commit publishes the full
//! post-transition device to the hub while still holding that lock, so the
//! hub sees each device's transitions in commit order.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::time::timeout;

use fleet_adapter::DeviceAdapter;
use fleet_core::prelude::*;
use fleet_core::{AdapterState, Device, DeviceId, DeviceMetadata, DeviceStatus, HubEvent, Transport};

use crate::hub::Hub;

/// Called with a device id whenever that device stops being `Online`
pub type TeardownHook = Arc<dyn Fn(DeviceId) -> BoxFuture<'static, ()> + Send + Sync>;

/// How an in-flight connect ended; shared by every coalesced caller
#[derive(Debug, Clone)]
enum ConnectOutcome {
    Online,
    TimedOut(Duration),
    Cancelled,
    /// The adapter's own error, handed to each waiter as a copy
    Failed(Arc<Error>),
}

impl ConnectOutcome {
    fn into_result(self, device: Option<Device>, id: &str) -> Result<Device> {
        match self {
            ConnectOutcome::Online => device.ok_or_else(|| Error::not_found(id)),
            ConnectOutcome::TimedOut(after) => Err(Error::timeout(format!("connect {}", id), after)),
            ConnectOutcome::Cancelled => Err(Error::cancelled(format!("connect {}", id))),
            ConnectOutcome::Failed(error) => Err(error.replicate()),
        }
    }
}

type OutcomeRx = watch::Receiver<Option<ConnectOutcome>>;

/// Explicit operation currently in flight for a device
enum InFlight {
    Idle,
    Connecting {
        outcome: OutcomeRx,
        cancel: Option<oneshot::Sender<()>>,
    },
    Disconnecting,
}

impl InFlight {
    fn is_idle(&self) -> bool {
        matches!(self, InFlight::Idle)
    }
}

struct Slot {
    device: Device,
    in_flight: InFlight,
    /// Bumped whenever an in-flight connect is superseded
    generation: u64,
}

/// Thread-safe device registry, generic over the device tool
pub struct Registry<A> {
    adapter: Arc<A>,
    hub: Hub,
    slots: RwLock<HashMap<DeviceId, Arc<Mutex<Slot>>>>,
    connect_timeout: Duration,
    teardown: OnceLock<TeardownHook>,
}

impl<A> std::fmt::Debug for Registry<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl<A> Registry<A>
where
    A: DeviceAdapter + Sync + 'static,
{
    pub fn new(adapter: Arc<A>, hub: Hub, connect_timeout: Duration) -> Self {
        Self {
            adapter,
            hub,
            slots: RwLock::new(HashMap::new()),
            connect_timeout,
            teardown: OnceLock::new(),
        }
    }

    /// Install the hook that tears down per-device resources (mirror sessions).
    /// Only the first call has an effect.
    pub fn set_teardown_hook(&self, hook: TeardownHook) {
        if self.teardown.set(hook).is_err() {
            warn!("Registry teardown hook already set");
        }
    }

    // ─────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────

    pub async fn get(&self, id: &str) -> Option<Device> {
        let slot = self.slot(id).await?;
        let slot = slot.lock().await;
        Some(slot.device.clone())
    }

    /// All devices, ordered by id
    pub async fn list(&self) -> Vec<Device> {
        let slots: Vec<_> = self.slots.read().await.values().cloned().collect();
        let mut devices = Vec::with_capacity(slots.len());
        for slot in slots {
            devices.push(slot.lock().await.device.clone());
        }
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub async fn status(&self, id: &str) -> Option<DeviceStatus> {
        self.get(id).await.map(|d| d.status)
    }

    /// Whether an explicit connect/disconnect is in flight for `id`
    pub async fn is_busy(&self, id: &str) -> bool {
        match self.slot(id).await {
            Some(slot) => !slot.lock().await.in_flight.is_idle(),
            None => false,
        }
    }

    /// Record a successful interaction. Not broadcast.
    pub async fn touch(&self, id: &str) {
        if let Some(slot) = self.slot(id).await {
            slot.lock().await.device.touch();
        }
    }

    async fn slot(&self, id: &str) -> Option<Arc<Mutex<Slot>>> {
        self.slots.read().await.get(id).cloned()
    }

    /// Existing slot for `id`, or a new `Disconnected` one. The bool is true
    /// when the slot was created by this call.
    async fn slot_or_insert(&self, id: &str, transport: &Transport) -> (Arc<Mutex<Slot>>, bool) {
        if let Some(slot) = self.slot(id).await {
            return (slot, false);
        }

        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get(id) {
            return (Arc::clone(slot), false);
        }
        let slot = Arc::new(Mutex::new(Slot {
            device: Device::new(id, transport.clone()),
            in_flight: InFlight::Idle,
            generation: 0,
        }));
        slots.insert(id.to_string(), Arc::clone(&slot));
        (slot, true)
    }

    fn emit(&self, device: &Device) {
        publish_device(&self.hub, device);
    }

    async fn run_teardown(&self, id: &str) {
        if let Some(hook) = self.teardown.get() {
            hook(id.to_string()).await;
        }
    }

    // ─────────────────────────────────────────────────────────
    // Explicit transitions
    // ─────────────────────────────────────────────────────────

    /// Connect a device, registering it on first use.
    ///
    /// Already `Online` is a no-op success. A connect already in flight is
    /// joined rather than repeated, and every joined caller gets the same
    /// outcome. `transport` defaults to USB for unknown ids and replaces the
    /// stored transport otherwise.
    #[instrument(skip(self, transport), fields(device = %id))]
    pub async fn connect(self: &Arc<Self>, id: &str, transport: Option<Transport>) -> Result<Device> {
        let requested = transport.clone().unwrap_or(Transport::Usb);
        let (slot, created) = self.slot_or_insert(id, &requested).await;

        let mut outcome = {
            let mut guard = slot.lock().await;

            let joined = match &guard.in_flight {
                InFlight::Connecting { outcome, .. } => Some(outcome.clone()),
                InFlight::Disconnecting => {
                    return Err(Error::invalid_transition(format!(
                        "{} is disconnecting",
                        id
                    )));
                }
                InFlight::Idle => None,
            };

            match joined {
                Some(outcome) => {
                    debug!("Joining connect already in flight");
                    outcome
                }
                None if guard.device.status.is_online() => {
                    return Ok(guard.device.clone());
                }
                None => {
                    if let Some(transport) = transport {
                        guard.device.transport = transport;
                    }
                    if created {
                        info!("Registering {} ({})", id, guard.device.transport);
                    }
                    self.begin_connect(&slot, &mut guard)
                }
            }
        };

        let settled = outcome
            .wait_for(Option::is_some)
            .await
            .map(|value| value.clone());

        match settled {
            Ok(Some(result)) => {
                let device = self.get(id).await;
                result.into_result(device, id)
            }
            _ => Err(Error::cancelled(format!("connect {}", id))),
        }
    }

    /// Mark `Connecting`, emit, and spawn the adapter call. Caller holds the slot lock.
    fn begin_connect(
        self: &Arc<Self>,
        slot: &Arc<Mutex<Slot>>,
        guard: &mut Slot,
    ) -> OutcomeRx {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        guard.generation += 1;
        guard.device.status = DeviceStatus::Connecting;
        guard.in_flight = InFlight::Connecting {
            outcome: outcome_rx.clone(),
            cancel: Some(cancel_tx),
        };
        self.emit(&guard.device);

        let generation = guard.generation;
        let id = guard.device.id.clone();
        let transport = guard.device.transport.clone();
        let registry = Arc::clone(self);
        let slot = Arc::clone(slot);

        tokio::spawn(async move {
            let limit = registry.connect_timeout;
            let attempt = tokio::select! {
                _ = cancel_rx => Err(ConnectOutcome::Cancelled),
                result = timeout(limit, registry.adapter.connect(&id, &transport)) => match result {
                    Ok(Ok(info)) => Ok(info),
                    Ok(Err(e)) => {
                        warn!("connect {} failed: {}", id, e);
                        Err(ConnectOutcome::Failed(Arc::new(e)))
                    }
                    Err(_) => {
                        warn!("connect {} timed out after {:?}", id, limit);
                        Err(ConnectOutcome::TimedOut(limit))
                    }
                },
            };

            let outcome = {
                let mut guard = slot.lock().await;
                if guard.generation != generation {
                    debug!("connect {} superseded, discarding result", id);
                    ConnectOutcome::Cancelled
                } else {
                    guard.in_flight = InFlight::Idle;
                    match attempt {
                        Ok(info) => {
                            guard.device.metadata = info.metadata.merged_with(&guard.device.metadata);
                            guard.device.status = DeviceStatus::Online;
                            guard.device.touch();
                            info!("{} is online", id);
                            publish_device(&registry.hub, &guard.device);
                            ConnectOutcome::Online
                        }
                        Err(outcome) => {
                            guard.device.status = DeviceStatus::Error(match &outcome {
                                ConnectOutcome::TimedOut(_) => "timeout".to_string(),
                                ConnectOutcome::Failed(error) => error.reason(),
                                _ => "cancelled".to_string(),
                            });
                            publish_device(&registry.hub, &guard.device);
                            outcome
                        }
                    }
                }
            };

            let _ = outcome_tx.send(Some(outcome));
        });

        outcome_rx
    }

    /// Disconnect a device: cancel any connect in flight, tear down its mirror
    /// session, detach it from the tool, and leave it `Disconnected`.
    ///
    /// The entry stays registered. Unknown ids are `NotFound`.
    #[instrument(skip(self), fields(device = %id))]
    pub async fn disconnect(&self, id: &str) -> Result<Device> {
        let slot = self.slot(id).await.ok_or_else(|| Error::not_found(id))?;

        let transport = {
            let mut guard = slot.lock().await;
            match std::mem::replace(&mut guard.in_flight, InFlight::Disconnecting) {
                InFlight::Disconnecting => {
                    return Err(Error::invalid_transition(format!(
                        "{} is already disconnecting",
                        id
                    )));
                }
                InFlight::Connecting { cancel, .. } => {
                    info!("Cancelling connect in flight");
                    guard.generation += 1;
                    if let Some(cancel) = cancel {
                        let _ = cancel.send(());
                    }
                }
                InFlight::Idle if guard.device.status == DeviceStatus::Disconnected => {
                    guard.in_flight = InFlight::Idle;
                    return Ok(guard.device.clone());
                }
                InFlight::Idle => {}
            }
            guard.device.transport.clone()
        };

        self.run_teardown(id).await;

        match timeout(self.connect_timeout, self.adapter.disconnect(id, &transport)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("adapter disconnect {} failed: {}", id, e),
            Err(_) => warn!("adapter disconnect {} timed out", id),
        }

        let mut guard = slot.lock().await;
        guard.in_flight = InFlight::Idle;
        guard.device.status = DeviceStatus::Disconnected;
        info!("{} disconnected", id);
        self.emit(&guard.device);
        Ok(guard.device.clone())
    }

    // ─────────────────────────────────────────────────────────
    // Monitor-driven transitions
    // ─────────────────────────────────────────────────────────

    /// Map the serial the tool lists (`Device::serial`) to the registered id.
    ///
    /// A network device registered under its own name is listed by its
    /// address. If two entries share a serial, the one not `Disconnected` wins.
    pub async fn serial_index(&self) -> HashMap<String, DeviceId> {
        let mut index: HashMap<String, (DeviceId, bool)> = HashMap::new();
        for device in self.list().await {
            let live = device.status != DeviceStatus::Disconnected;
            let serial = device.serial().to_string();
            match index.get(&serial) {
                Some((_, true)) if !live => {}
                _ => {
                    index.insert(serial, (device.id, live));
                }
            }
        }
        index.into_iter().map(|(serial, (id, _))| (serial, id)).collect()
    }

    /// Apply what the monitor observed. Returns whether anything changed.
    ///
    /// Unknown devices are registered. Devices with an explicit operation in
    /// flight, and devices explicitly disconnected, are left alone.
    pub async fn apply_monitored_update(
        &self,
        id: &str,
        observed: AdapterState,
        metadata: Option<DeviceMetadata>,
    ) -> bool {
        let status = observed.observed_status();
        let (slot, created) = self
            .slot_or_insert(id, &Transport::from_serial(id))
            .await;

        let left_online = {
            let mut guard = slot.lock().await;

            if !created {
                if !guard.in_flight.is_idle() {
                    trace!("{} has an operation in flight, skipping monitor update", id);
                    return false;
                }
                if guard.device.status == DeviceStatus::Disconnected {
                    return false;
                }
            }

            let before = guard.device.clone();
            if let Some(metadata) = metadata {
                guard.device.metadata = metadata.merged_with(&before.metadata);
            }
            guard.device.status = status;
            if guard.device.status.is_online() {
                guard.device.touch();
            }

            let changed = created
                || guard.device.status != before.status
                || guard.device.metadata != before.metadata;
            if !changed {
                return false;
            }

            if created {
                info!("Discovered {} ({})", id, guard.device.status);
            }
            self.emit(&guard.device);
            before.status.is_online() && !guard.device.status.is_online()
        };

        if left_online {
            info!("{} went offline", id);
            self.run_teardown(id).await;
        }
        true
    }
}

fn publish_device(hub: &Hub, device: &Device) {
    debug!("{} -> {}", device.id, device.status);
    hub.publish(HubEvent::DeviceChanged {
        device: device.clone(),
    });
}
