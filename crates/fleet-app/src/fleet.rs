//! The orchestrator facade
//!
//! [`Fleet`] builds the hub, registry, mirror manager, gateway and monitor
//! from [`Settings`], wires the registry's teardown hook to the mirror
//! manager, and exposes every operation the front-ends need.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use fleet_adapter::{DeviceAdapter, InputAction, RemoteEntry};
use fleet_core::prelude::*;
use fleet_core::{CommandResult, Device, DeviceId, Interests, ObserverId, Transport};

use crate::config::Settings;
use crate::gateway::{BatchOutcome, CommandGateway};
use crate::hub::{Hub, Observer};
use crate::mirror::{MirrorManager, SessionHandle};
use crate::monitor::{DeviceMonitor, PollReport};
use crate::policy::CommandPolicy;
use crate::registry::Registry;

pub struct Fleet<A> {
    settings: Settings,
    hub: Hub,
    registry: Arc<Registry<A>>,
    mirror: Arc<MirrorManager<A>>,
    gateway: CommandGateway<A>,
    monitor: Arc<DeviceMonitor<A>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<A> std::fmt::Debug for Fleet<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("hub", &self.hub)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl<A> Fleet<A>
where
    A: DeviceAdapter + Sync + 'static,
{
    /// Build every component. Must be called inside a tokio runtime.
    ///
    /// The monitor does not run until [`start_monitor`](Self::start_monitor).
    pub fn new(adapter: Arc<A>, settings: Settings) -> Self {
        let (hub, dropped_rx) = Hub::spawn(settings.hub.observer_queue);

        let registry = Arc::new(Registry::new(
            Arc::clone(&adapter),
            hub.clone(),
            settings.adb.connect_timeout(),
        ));

        let mirror = Arc::new(MirrorManager::new(
            Arc::clone(&adapter),
            Arc::clone(&registry),
            hub.clone(),
            settings.mirror.capture_options(),
            settings.mirror.startup_timeout(),
            settings.mirror.stop_grace(),
        ));

        let hook_mirror = Arc::clone(&mirror);
        registry.set_teardown_hook(Arc::new(move |device_id: DeviceId| {
            let mirror = Arc::clone(&hook_mirror);
            async move { mirror.teardown(&device_id).await }.boxed()
        }));

        let gateway = CommandGateway::new(
            Arc::clone(&adapter),
            Arc::clone(&registry),
            Arc::clone(&mirror),
            CommandPolicy::from_settings(&settings.security),
            settings.adb.command_timeout(),
        )
        .with_storage(
            settings.storage.max_file_size,
            settings.storage.download_path.clone(),
        );

        let monitor = Arc::new(DeviceMonitor::new(
            adapter,
            Arc::clone(&registry),
            settings.monitor.interval(),
            settings.monitor.offline_after,
            settings.adb.connect_timeout(),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        let reaper = tokio::spawn(reap_dropped_observers(dropped_rx, Arc::clone(&mirror)));

        Self {
            settings,
            hub,
            registry,
            mirror,
            gateway,
            monitor,
            shutdown_tx,
            tasks: Mutex::new(vec![reaper]),
        }
    }

    /// Start background polling if `[monitor] enabled`
    pub fn start_monitor(&self) {
        if !self.settings.monitor.enabled {
            info!("Device monitor disabled by configuration");
            return;
        }
        let task = Arc::clone(&self.monitor).spawn(self.shutdown_tx.subscribe());
        self.lock_tasks().push(task);
    }

    /// Run one monitor cycle now
    pub async fn poll_devices(&self) -> Result<PollReport> {
        self.monitor.poll_once().await
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<Registry<A>> {
        &self.registry
    }

    pub fn mirror(&self) -> &Arc<MirrorManager<A>> {
        &self.mirror
    }

    pub fn gateway(&self) -> &CommandGateway<A> {
        &self.gateway
    }

    // ─────────────────────────────────────────────────────────
    // Observers
    // ─────────────────────────────────────────────────────────

    /// Attach an observer. Its first event is a snapshot of every device.
    pub fn attach(&self, interests: Interests) -> Observer {
        self.hub.attach(interests)
    }

    /// Detach from the hub and from every mirror session. Idempotent.
    pub async fn detach(&self, observer: ObserverId) {
        self.hub.detach(observer);
        self.mirror.detach_observer(observer).await;
    }

    // ─────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────

    pub async fn connect(&self, id: &str, transport: Option<Transport>) -> Result<Device> {
        self.registry.connect(id, transport).await
    }

    pub async fn disconnect(&self, id: &str) -> Result<Device> {
        self.registry.disconnect(id).await
    }

    pub async fn device(&self, id: &str) -> Option<Device> {
        self.registry.get(id).await
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.registry.list().await
    }

    // ─────────────────────────────────────────────────────────
    // Mirroring
    // ─────────────────────────────────────────────────────────

    pub async fn start_mirror(&self, id: &str, observer: ObserverId) -> Result<SessionHandle> {
        self.mirror.start(id, observer).await
    }

    pub async fn stop_mirror(&self, id: &str) -> Result<()> {
        self.mirror.stop(id).await
    }

    pub async fn subscribe(&self, id: &str, observer: ObserverId) -> Result<SessionHandle> {
        self.mirror.subscribe(id, observer).await
    }

    pub async fn unsubscribe(&self, id: &str, observer: ObserverId) -> Result<()> {
        self.mirror.unsubscribe(id, observer).await
    }

    pub async fn mirror_session(&self, id: &str) -> Option<SessionHandle> {
        self.mirror.session(id).await
    }

    pub async fn mirror_sessions(&self) -> Vec<SessionHandle> {
        self.mirror.sessions().await
    }

    // ─────────────────────────────────────────────────────────
    // Commands and files
    // ─────────────────────────────────────────────────────────

    pub async fn execute(&self, id: &str, command: &str) -> CommandResult {
        self.gateway.execute(id, command).await
    }

    pub async fn execute_batch(&self, ids: &[DeviceId], command: &str) -> Vec<BatchOutcome> {
        self.gateway.execute_batch(ids, command).await
    }

    pub async fn inject_input(&self, id: &str, action: &InputAction) -> Result<CommandResult> {
        self.gateway.inject_input(id, action).await
    }

    pub async fn list_files(&self, id: &str, path: Option<&str>) -> Result<Vec<RemoteEntry>> {
        self.gateway.list_files(id, path).await
    }

    pub async fn push_file(&self, id: &str, local: &Path, remote: &str) -> Result<String> {
        self.gateway.push_file(id, local, remote).await
    }

    pub async fn pull_file(&self, id: &str, remote: &str) -> Result<PathBuf> {
        self.gateway.pull_file(id, remote).await
    }

    // ─────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────

    /// Stop the monitor, end every mirror session, and close the hub
    pub async fn shutdown(&self) {
        info!("Shutting down fleet");
        self.shutdown_tx.send_replace(true);

        self.mirror.stop_all().await;
        self.hub.shutdown();

        let tasks: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Remove observers the hub dropped from any mirror session they were in.
/// Ends when the hub shuts down.
async fn reap_dropped_observers<A>(
    mut dropped_rx: mpsc::UnboundedReceiver<ObserverId>,
    mirror: Arc<MirrorManager<A>>,
) where
    A: DeviceAdapter + Sync + 'static,
{
    while let Some(observer) = dropped_rx.recv().await {
        info!("Observer {} was dropped by the hub, leaving mirror sessions", observer);
        mirror.detach_observer(observer).await;
    }
    debug!("observer reaper finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fleet_adapter::test_utils::{test_device_info, FakeAdapter};
    use fleet_core::{DeviceStatus, HubEvent};

    fn fleet(settings: Settings) -> Fleet<FakeAdapter> {
        let fake = FakeAdapter::new()
            .with_device(test_device_info("d1", "Pixel 7"))
            .into_arc();
        Fleet::new(fake, settings)
    }

    fn quick_settings() -> Settings {
        let mut settings = Settings::default();
        settings.mirror.startup_timeout_ms = 200;
        settings.mirror.stop_grace_ms = 100;
        settings
    }

    async fn wait_until_no_session(fleet: &Fleet<FakeAdapter>, id: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while fleet.mirror_session(id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session torn down within 2s");
    }

    #[tokio::test]
    async fn test_detach_leaves_mirror_sessions() {
        let fleet = fleet(quick_settings());
        fleet.connect("d1", None).await.unwrap();
        let observer = fleet.attach(Interests::without_frames());

        fleet.start_mirror("d1", observer.id).await.unwrap();
        fleet.detach(observer.id).await;

        assert!(fleet.mirror_session("d1").await.is_none());
        assert!(fleet.hub().observers().await.is_empty());
    }

    #[tokio::test]
    async fn test_slow_observer_is_removed_from_sessions() {
        let mut settings = quick_settings();
        settings.hub.observer_queue = 4;
        let fleet = fleet(settings);
        fleet.connect("d1", None).await.unwrap();

        // Never drained: frames overflow its queue
        let stalled = fleet.attach(Interests::all());
        let _ = fleet.start_mirror("d1", stalled.id).await;

        wait_until_no_session(&fleet, "d1").await;
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_session() {
        let fleet = fleet(quick_settings());
        fleet.connect("d1", None).await.unwrap();
        let observer = fleet.attach(Interests::without_frames());
        fleet.start_mirror("d1", observer.id).await.unwrap();

        let device = fleet.disconnect("d1").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Disconnected);
        assert!(fleet.mirror_session("d1").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_observer_queues() {
        let mut settings = quick_settings();
        settings.monitor.interval_ms = 10;
        let fleet = fleet(settings);
        fleet.start_monitor();

        let mut observer = fleet.attach(Interests::without_frames());
        fleet.shutdown().await;

        let mut closed = false;
        while let Ok(event) =
            tokio::time::timeout(Duration::from_secs(1), observer.events.recv()).await
        {
            match event {
                Some(HubEvent::Snapshot { .. }) | Some(HubEvent::DeviceChanged { .. }) => {}
                Some(other) => panic!("unexpected event {:?}", other),
                None => {
                    closed = true;
                    break;
                }
            }
        }
        assert!(closed);
    }
}
