//! Mirror session manager
//!
//! At most one capture session exists per device. The first `start` spawns
//! the capture process; later `start` calls from other observers join the
//! running session. The session ends when its last subscriber leaves, on an
//! explicit stop, when the device leaves `Online`, or when the process exits.
//!
//! Each device has a gate (an async mutex) that serializes start, stop and
//! mirror-affecting commands. A pump task per session relays frames to the
//! current subscribers through the hub and reaps the session when the
//! process exits. The manager is the only owner of the [`CaptureProcess`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::time::timeout;

use fleet_adapter::{CaptureOptions, CaptureProcess, DeviceAdapter};
use fleet_core::prelude::*;
use fleet_core::{CaptureEvent, DeviceId, HubEvent, MirrorState, ObserverId};

use crate::hub::Hub;
use crate::registry::Registry;

/// Capture events buffered between the process readers and the pump
const CAPTURE_CHANNEL_SIZE: usize = 64;

/// Extra time a stop waits for the pump after the process is gone
const REAP_MARGIN: Duration = Duration::from_secs(3);

/// Public view of a mirror session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub device_id: DeviceId,
    pub state: MirrorState,
    /// Observer whose `start` spawned the process
    pub owner: ObserverId,
    pub subscribers: Vec<ObserverId>,
}

struct MirrorSession {
    generation: u64,
    state: MirrorState,
    owner: ObserverId,
    /// Receiving frames right now
    subscribers: BTreeSet<ObserverId>,
    /// Everyone who subscribed during the session's life and is still attached
    audience: BTreeSet<ObserverId>,
    process: Option<CaptureProcess>,
    state_tx: watch::Sender<MirrorState>,
}

impl MirrorSession {
    fn handle(&self, device_id: &str) -> SessionHandle {
        SessionHandle {
            device_id: device_id.to_string(),
            state: self.state.clone(),
            owner: self.owner,
            subscribers: self.subscribers.iter().copied().collect(),
        }
    }

    fn audience(&self) -> Vec<ObserverId> {
        self.audience.iter().copied().collect()
    }
}

#[derive(Default)]
struct MirrorSlot {
    gate: Arc<Mutex<()>>,
    session: Mutex<Option<MirrorSession>>,
}

/// Why a stop was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopKind {
    /// Explicit stop or device teardown
    Requested,
    /// Last subscriber left; skipped if someone rejoined meanwhile
    Idle,
}

pub struct MirrorManager<A> {
    adapter: Arc<A>,
    registry: Arc<Registry<A>>,
    hub: Hub,
    options: CaptureOptions,
    startup_timeout: Duration,
    stop_grace: Duration,
    slots: RwLock<HashMap<DeviceId, Arc<MirrorSlot>>>,
    generation: AtomicU64,
}

impl<A> std::fmt::Debug for MirrorManager<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorManager")
            .field("options", &self.options)
            .field("startup_timeout", &self.startup_timeout)
            .field("stop_grace", &self.stop_grace)
            .finish_non_exhaustive()
    }
}

impl<A> MirrorManager<A>
where
    A: DeviceAdapter + Sync + 'static,
{
    pub fn new(
        adapter: Arc<A>,
        registry: Arc<Registry<A>>,
        hub: Hub,
        options: CaptureOptions,
        startup_timeout: Duration,
        stop_grace: Duration,
    ) -> Self {
        Self {
            adapter,
            registry,
            hub,
            options,
            startup_timeout,
            stop_grace,
            slots: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(1),
        }
    }

    async fn slot(&self, device_id: &str) -> Arc<MirrorSlot> {
        if let Some(slot) = self.slots.read().await.get(device_id) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(device_id.to_string()).or_default())
    }

    async fn existing_slot(&self, device_id: &str) -> Option<Arc<MirrorSlot>> {
        self.slots.read().await.get(device_id).cloned()
    }

    /// Hold the device's mirror gate, excluding start/stop until dropped
    pub async fn exclusive(&self, device_id: &str) -> OwnedMutexGuard<()> {
        let slot = self.slot(device_id).await;
        Arc::clone(&slot.gate).lock_owned().await
    }

    // ─────────────────────────────────────────────────────────
    // Start / subscribe
    // ─────────────────────────────────────────────────────────

    /// Start mirroring `device_id` for `observer`, or join the running session.
    ///
    /// Resolves once the session is `Streaming`: after the first frame, or
    /// after the startup timeout passes without the process failing.
    #[instrument(skip_all, fields(device = %device_id, observer = %observer))]
    pub async fn start(self: &Arc<Self>, device_id: &str, observer: ObserverId) -> Result<SessionHandle> {
        let slot = self.slot(device_id).await;

        let mut state_rx = {
            let _gate = slot.gate.lock().await;

            let device = self
                .registry
                .get(device_id)
                .await
                .ok_or_else(|| Error::not_found(device_id))?;
            if !device.status.is_online() {
                return Err(Error::invalid_transition(format!(
                    "cannot mirror {}: device is {}",
                    device_id, device.status
                )));
            }

            if let Some(joined) = self.join(&slot, device_id, observer).await? {
                joined
            } else {
                self.launch(&slot, device_id, device.serial(), observer).await?
            }
        };

        let settled = timeout(
            self.startup_timeout + REAP_MARGIN,
            state_rx.wait_for(|state| *state != MirrorState::Starting),
        )
        .await
        .map(|waited| waited.map(|state| state.clone()));

        match settled {
            Ok(Ok(MirrorState::Streaming)) => self
                .session(device_id)
                .await
                .ok_or_else(|| Error::cancelled(format!("mirror {}", device_id))),
            Ok(Ok(MirrorState::Failed(reason))) => Err(Error::tool(reason)),
            Ok(Ok(_)) | Ok(Err(_)) => Err(Error::cancelled(format!("mirror {}", device_id))),
            Err(_) => Err(Error::timeout(
                format!("mirror start {}", device_id),
                self.startup_timeout,
            )),
        }
    }

    /// Add `observer` to a live session. `Ok(None)` when there is no session.
    async fn join(
        &self,
        slot: &MirrorSlot,
        device_id: &str,
        observer: ObserverId,
    ) -> Result<Option<watch::Receiver<MirrorState>>> {
        let mut session = slot.session.lock().await;
        let Some(session) = session.as_mut() else {
            return Ok(None);
        };

        if session.state == MirrorState::Stopping {
            return Err(Error::already_active(device_id));
        }

        if session.subscribers.insert(observer) {
            info!(
                "{} joined mirror of {} ({} subscribers)",
                observer,
                device_id,
                session.subscribers.len()
            );
        }
        session.audience.insert(observer);

        self.hub.publish_to(
            vec![observer],
            HubEvent::MirrorState {
                device_id: device_id.to_string(),
                state: session.state.clone(),
            },
        );
        Ok(Some(session.state_tx.subscribe()))
    }

    /// Spawn the capture process and register a `Starting` session. Gate held.
    async fn launch(
        self: &Arc<Self>,
        slot: &MirrorSlot,
        device_id: &str,
        serial: &str,
        observer: ObserverId,
    ) -> Result<watch::Receiver<MirrorState>> {
        let (event_tx, event_rx) = mpsc::channel(CAPTURE_CHANNEL_SIZE);

        let spawned = timeout(
            self.startup_timeout,
            self.adapter.start_capture(serial, &self.options, event_tx),
        )
        .await;

        let process = match spawned {
            Ok(Ok(process)) => process,
            Ok(Err(e)) => {
                error!("Failed to start capture for {}: {}", device_id, e);
                self.announce_failed(observer, device_id, e.to_string());
                return Err(match e {
                    Error::ToolNotFound { .. } | Error::ExternalToolFailure { .. } => e,
                    other => Error::tool(other.to_string()),
                });
            }
            Err(_) => {
                error!("Capture for {} did not start within {:?}", device_id, self.startup_timeout);
                self.announce_failed(observer, device_id, "timeout".to_string());
                return Err(Error::timeout(
                    format!("mirror start {}", device_id),
                    self.startup_timeout,
                ));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(MirrorState::Starting);

        *slot.session.lock().await = Some(MirrorSession {
            generation,
            state: MirrorState::Starting,
            owner: observer,
            subscribers: BTreeSet::from([observer]),
            audience: BTreeSet::from([observer]),
            process: Some(process),
            state_tx,
        });
        info!("Mirror of {} starting for {}", device_id, observer);

        self.hub.publish_to(
            vec![observer],
            HubEvent::MirrorState {
                device_id: device_id.to_string(),
                state: MirrorState::Starting,
            },
        );

        tokio::spawn(Arc::clone(self).pump(device_id.to_string(), generation, event_rx));
        Ok(state_rx)
    }

    fn announce_failed(&self, observer: ObserverId, device_id: &str, reason: String) {
        self.hub.publish_to(
            vec![observer],
            HubEvent::MirrorState {
                device_id: device_id.to_string(),
                state: MirrorState::Failed(reason.clone()),
            },
        );
        self.hub.publish_to(
            vec![observer],
            HubEvent::MirrorStopped {
                device_id: device_id.to_string(),
                reason: Some(reason),
            },
        );
    }

    /// Join a live session without spawning anything
    pub async fn subscribe(&self, device_id: &str, observer: ObserverId) -> Result<SessionHandle> {
        let slot = self
            .existing_slot(device_id)
            .await
            .ok_or_else(|| no_session(device_id))?;
        if self.join(&slot, device_id, observer).await?.is_none() {
            return Err(no_session(device_id));
        }
        self.session(device_id)
            .await
            .ok_or_else(|| no_session(device_id))
    }

    /// Stop sending frames to `observer`. The session stops when nobody is left.
    pub async fn unsubscribe(&self, device_id: &str, observer: ObserverId) -> Result<()> {
        let slot = self
            .existing_slot(device_id)
            .await
            .ok_or_else(|| no_session(device_id))?;

        let now_empty = {
            let mut session = slot.session.lock().await;
            let Some(session) = session.as_mut() else {
                return Err(no_session(device_id));
            };
            if session.subscribers.remove(&observer) {
                debug!("{} left mirror of {}", observer, device_id);
            }
            session.subscribers.is_empty() && session.state != MirrorState::Stopping
        };

        if now_empty {
            info!("Mirror of {} has no subscribers left, stopping", device_id);
            self.stop_inner(device_id, StopKind::Idle).await;
        }
        Ok(())
    }

    /// Remove an observer from every session; sessions left empty are stopped
    pub async fn detach_observer(&self, observer: ObserverId) {
        let slots: Vec<(DeviceId, Arc<MirrorSlot>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut emptied = Vec::new();
        for (device_id, slot) in slots {
            let mut session = slot.session.lock().await;
            if let Some(session) = session.as_mut() {
                let was_subscribed = session.subscribers.remove(&observer);
                session.audience.remove(&observer);
                if was_subscribed
                    && session.subscribers.is_empty()
                    && session.state != MirrorState::Stopping
                {
                    emptied.push(device_id);
                }
            }
        }

        for device_id in emptied {
            info!("Mirror of {} lost its last observer, stopping", device_id);
            self.stop_inner(&device_id, StopKind::Idle).await;
        }
    }

    // ─────────────────────────────────────────────────────────
    // Stop
    // ─────────────────────────────────────────────────────────

    /// Stop the session for `device_id`. `InvalidTransition` if there is none.
    #[instrument(skip(self), fields(device = %device_id))]
    pub async fn stop(&self, device_id: &str) -> Result<()> {
        if self.stop_inner(device_id, StopKind::Requested).await {
            Ok(())
        } else {
            Err(no_session(device_id))
        }
    }

    /// Stop whatever session exists; used when a device leaves `Online`
    pub async fn teardown(&self, device_id: &str) {
        self.stop_inner(device_id, StopKind::Requested).await;
    }

    /// Stop every session
    pub async fn stop_all(&self) {
        let devices: Vec<DeviceId> = self.slots.read().await.keys().cloned().collect();
        for device_id in devices {
            self.stop_inner(&device_id, StopKind::Requested).await;
        }
    }

    /// Returns whether a session was stopped
    async fn stop_inner(&self, device_id: &str, kind: StopKind) -> bool {
        let Some(slot) = self.existing_slot(device_id).await else {
            return false;
        };
        let _gate = slot.gate.lock().await;

        let (generation, process, mut state_rx) = {
            let mut session = slot.session.lock().await;
            let Some(session) = session.as_mut() else {
                return false;
            };
            if kind == StopKind::Idle && !session.subscribers.is_empty() {
                debug!("Mirror of {} regained subscribers, not stopping", device_id);
                return false;
            }

            session.state = MirrorState::Stopping;
            let _ = session.state_tx.send(MirrorState::Stopping);
            self.hub.publish_to(
                session.audience(),
                HubEvent::MirrorState {
                    device_id: device_id.to_string(),
                    state: MirrorState::Stopping,
                },
            );
            (
                session.generation,
                session.process.take(),
                session.state_tx.subscribe(),
            )
        };

        if let Some(mut process) = process {
            if let Err(e) = process.shutdown(self.stop_grace).await {
                warn!("Capture for {} did not stop cleanly: {}", device_id, e);
            }
        }

        // Resolve to a bool here: the watch::Ref must not live across the await below
        let reaped = timeout(REAP_MARGIN, state_rx.wait_for(MirrorState::is_terminal))
            .await
            .map(|r| r.is_ok());
        if !matches!(reaped, Ok(true)) {
            warn!("Mirror pump for {} did not finish, closing session", device_id);
            self.conclude(&slot, device_id, generation, MirrorState::Stopped, None)
                .await;
        }

        info!("Mirror of {} stopped", device_id);
        true
    }

    // ─────────────────────────────────────────────────────────
    // Pump
    // ─────────────────────────────────────────────────────────

    async fn pump(
        self: Arc<Self>,
        device_id: DeviceId,
        generation: u64,
        mut events: mpsc::Receiver<CaptureEvent>,
    ) {
        let startup = tokio::time::sleep(self.startup_timeout);
        tokio::pin!(startup);

        let mut streaming = false;
        let mut last_stderr: Option<String> = None;

        let code = loop {
            tokio::select! {
                _ = &mut startup, if !streaming => {
                    debug!("No frame from {} yet, assuming stream is up", device_id);
                    streaming = true;
                    self.mark_streaming(&device_id, generation).await;
                }
                event = events.recv() => match event {
                    Some(CaptureEvent::Frame(payload)) => {
                        if !streaming {
                            streaming = true;
                            self.mark_streaming(&device_id, generation).await;
                        }
                        self.fan_out(&device_id, generation, payload).await;
                    }
                    Some(CaptureEvent::Stderr(line)) => {
                        debug!("capture {}: {}", device_id, line);
                        last_stderr = Some(line);
                    }
                    Some(CaptureEvent::Exited { code }) => break code,
                    None => break None,
                },
            }
        };

        let Some(slot) = self.existing_slot(&device_id).await else {
            return;
        };

        let stopping = {
            let session = slot.session.lock().await;
            matches!(&*session, Some(s) if s.generation == generation && s.state == MirrorState::Stopping)
        };

        if stopping || code == Some(0) {
            let reason = (!stopping).then(|| "capture ended".to_string());
            self.conclude(&slot, &device_id, generation, MirrorState::Stopped, reason)
                .await;
        } else {
            let reason = match last_stderr {
                Some(line) => format!("capture exited with {:?}: {}", code, line),
                None => format!("capture exited with {:?}", code),
            };
            warn!("Mirror of {} failed: {}", device_id, reason);
            self.conclude(
                &slot,
                &device_id,
                generation,
                MirrorState::Failed(reason.clone()),
                Some(reason),
            )
            .await;
        }
    }

    async fn mark_streaming(&self, device_id: &str, generation: u64) {
        let Some(slot) = self.existing_slot(device_id).await else {
            return;
        };
        let mut session = slot.session.lock().await;
        if let Some(session) = session.as_mut() {
            if session.generation == generation && session.state == MirrorState::Starting {
                session.state = MirrorState::Streaming;
                let _ = session.state_tx.send(MirrorState::Streaming);
                info!("Mirror of {} streaming", device_id);
                self.hub.publish_to(
                    session.audience(),
                    HubEvent::MirrorState {
                        device_id: device_id.to_string(),
                        state: MirrorState::Streaming,
                    },
                );
            }
        }
    }

    async fn fan_out(&self, device_id: &str, generation: u64, payload: Bytes) {
        let Some(slot) = self.existing_slot(device_id).await else {
            return;
        };
        let session = slot.session.lock().await;
        if let Some(session) = session.as_ref() {
            if session.generation == generation && session.state != MirrorState::Stopping {
                self.hub.publish_to(
                    session.subscribers.iter().copied().collect(),
                    HubEvent::MirrorFrame {
                        device_id: device_id.to_string(),
                        payload,
                    },
                );
            }
        }
    }

    /// Remove the session and tell its audience, once
    async fn conclude(
        &self,
        slot: &MirrorSlot,
        device_id: &str,
        generation: u64,
        state: MirrorState,
        reason: Option<String>,
    ) {
        let mut guard = slot.session.lock().await;
        let Some(session) = guard.take_if(|s| s.generation == generation) else {
            return;
        };
        drop(guard);

        let audience = session.audience();
        let _ = session.state_tx.send(state.clone());
        self.hub.publish_to(
            audience.clone(),
            HubEvent::MirrorState {
                device_id: device_id.to_string(),
                state,
            },
        );
        self.hub.publish_to(
            audience,
            HubEvent::MirrorStopped {
                device_id: device_id.to_string(),
                reason,
            },
        );
    }

    // ─────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────

    pub async fn session(&self, device_id: &str) -> Option<SessionHandle> {
        let slot = self.existing_slot(device_id).await?;
        let session = slot.session.lock().await;
        session.as_ref().map(|s| s.handle(device_id))
    }

    /// All live sessions, ordered by device id
    pub async fn sessions(&self) -> Vec<SessionHandle> {
        let slots: Vec<(DeviceId, Arc<MirrorSlot>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut handles = Vec::new();
        for (device_id, slot) in slots {
            if let Some(session) = slot.session.lock().await.as_ref() {
                handles.push(session.handle(&device_id));
            }
        }
        handles.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        handles
    }
}

fn no_session(device_id: &str) -> Error {
    Error::invalid_transition(format!("no active mirror session for {}", device_id))
}
