//! Device monitor: periodic liveness polling
//!
//! Each cycle lists the devices the tool can see and feeds the result to
//! [`Registry::apply_monitored_update`]. A known device has to be missing (or
//! not `Ready`) for `offline_after` consecutive cycles before it is marked
//! `Offline`; a single flaky listing does not flap its status. A failed
//! listing counts against nobody.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use fleet_adapter::DeviceAdapter;
use fleet_core::prelude::*;
use fleet_core::{AdapterState, DeviceId, DeviceInfo, DeviceMetadata, DeviceStatus};

use crate::registry::Registry;

/// Online devices get their metadata (battery, signal) re-queried this often
const METADATA_REFRESH_EVERY: u64 = 10;

/// What one polling cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Devices the tool listed
    pub seen: usize,
    /// Devices whose registry entry changed, in the order they were applied
    pub changed: Vec<DeviceId>,
}

pub struct DeviceMonitor<A> {
    adapter: Arc<A>,
    registry: Arc<Registry<A>>,
    interval: Duration,
    offline_after: u32,
    query_timeout: Duration,
    misses: Mutex<HashMap<DeviceId, u32>>,
    cycles: AtomicU64,
}

impl<A> std::fmt::Debug for DeviceMonitor<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMonitor")
            .field("interval", &self.interval)
            .field("offline_after", &self.offline_after)
            .field("cycles", &self.cycles.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<A> DeviceMonitor<A>
where
    A: DeviceAdapter + Sync + 'static,
{
    pub fn new(
        adapter: Arc<A>,
        registry: Arc<Registry<A>>,
        interval: Duration,
        offline_after: u32,
        query_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            registry,
            interval,
            offline_after: offline_after.max(1),
            query_timeout,
            misses: Mutex::new(HashMap::new()),
            cycles: AtomicU64::new(0),
        }
    }

    /// Run [`poll_once`](Self::poll_once) every interval until `shutdown_rx` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Device monitor started (every {:?})", self.interval);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match self.poll_once().await {
                            Ok(_) => {}
                            // adb server restarts and the like; retry next tick
                            Err(e) if e.is_recoverable() => debug!("Device poll failed: {}", e),
                            Err(e) => warn!("Device poll failed: {}", e),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Device monitor stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One liveness cycle
    pub async fn poll_once(&self) -> Result<PollReport> {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed);
        let refresh = cycle % METADATA_REFRESH_EVERY == 0;

        let listed = match timeout(self.query_timeout, self.adapter.list_devices()).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::timeout("list devices", self.query_timeout)),
        };

        let mut report = PollReport {
            seen: listed.len(),
            ..Default::default()
        };
        // The tool lists network devices by address, not by registered id
        let index = self.registry.serial_index().await;
        let mut seen = HashSet::new();

        for info in listed {
            let id = index
                .get(&info.serial)
                .cloned()
                .unwrap_or_else(|| info.serial.clone());
            seen.insert(id.clone());
            if self.observe(&id, &info, refresh).await {
                report.changed.push(id);
            }
        }

        for device in self.registry.list().await {
            if seen.contains(&device.id) || device.status == DeviceStatus::Disconnected {
                continue;
            }
            if self.record_miss(&device.id) >= self.offline_after
                && self
                    .registry
                    .apply_monitored_update(&device.id, AdapterState::Offline, None)
                    .await
            {
                report.changed.push(device.id);
            }
        }

        trace!("poll {}: {:?}", cycle, report);
        Ok(report)
    }

    /// `id` is the registered id; `info.serial` is what the tool answers to
    async fn observe(&self, id: &str, info: &DeviceInfo, refresh: bool) -> bool {
        let known = self.registry.get(id).await;

        if matches!(&known, Some(d) if d.status == DeviceStatus::Disconnected) {
            return false;
        }
        if self.registry.is_busy(id).await {
            return false;
        }

        if info.state != AdapterState::Ready {
            let reached = self.record_miss(id) >= self.offline_after;
            // First sighting: register it with what the tool reports
            if known.is_none() || reached {
                return self
                    .registry
                    .apply_monitored_update(id, info.state, Some(info.metadata.clone()))
                    .await;
            }
            return false;
        }

        self.clear_misses(id);

        let was_online = known.as_ref().is_some_and(|d| d.status.is_online());
        let metadata = if !was_online || refresh {
            Some(self.describe(&info.serial).await.merged_with(&info.metadata))
        } else {
            None
        };

        if was_online && metadata.is_none() {
            self.registry.touch(id).await;
            return false;
        }
        self.registry
            .apply_monitored_update(id, AdapterState::Ready, metadata)
            .await
    }

    /// Best-effort; an unanswered query yields empty metadata
    async fn describe(&self, serial: &str) -> DeviceMetadata {
        match timeout(self.query_timeout, self.adapter.describe(serial)).await {
            Ok(Ok(metadata)) => metadata,
            Ok(Err(e)) => {
                debug!("describe {} failed: {}", serial, e);
                DeviceMetadata::default()
            }
            Err(_) => {
                debug!("describe {} timed out", serial);
                DeviceMetadata::default()
            }
        }
    }

    fn record_miss(&self, id: &str) -> u32 {
        let mut misses = self.misses.lock().unwrap_or_else(|e| e.into_inner());
        let count = misses.entry(id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn clear_misses(&self, id: &str) {
        self.misses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_adapter::test_utils::{test_device_info, Calls, FakeAdapter};

    use fleet_core::Transport;

    use crate::hub::Hub;

    fn monitor(
        fake: FakeAdapter,
        offline_after: u32,
    ) -> (Arc<DeviceMonitor<FakeAdapter>>, Arc<Registry<FakeAdapter>>, Arc<FakeAdapter>) {
        let fake = Arc::new(fake);
        let (hub, _dropped) = Hub::spawn(64);
        let registry = Arc::new(Registry::new(
            Arc::clone(&fake),
            hub,
            Duration::from_secs(1),
        ));
        let monitor = Arc::new(DeviceMonitor::new(
            Arc::clone(&fake),
            Arc::clone(&registry),
            Duration::from_millis(10),
            offline_after,
            Duration::from_secs(1),
        ));
        (monitor, registry, fake)
    }

    #[tokio::test]
    async fn test_discovers_ready_devices_with_metadata() {
        let (monitor, registry, fake) =
            monitor(FakeAdapter::new().with_device(test_device_info("d1", "Pixel 7")), 3);

        let report = monitor.poll_once().await.unwrap();
        assert_eq!(report.changed, vec!["d1".to_string()]);

        let device = registry.get("d1").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.metadata.battery_percent, Some(80));

        // Steady state: no change, no extra query
        let report = monitor.poll_once().await.unwrap();
        assert!(report.changed.is_empty());
        assert_eq!(Calls::get(&fake.calls.describe), 1);
    }

    #[tokio::test]
    async fn test_offline_after_consecutive_misses() {
        let (monitor, registry, fake) =
            monitor(FakeAdapter::new().with_device(test_device_info("d1", "Pixel 7")), 2);
        monitor.poll_once().await.unwrap();

        fake.remove_device("d1");
        monitor.poll_once().await.unwrap();
        assert_eq!(registry.status("d1").await, Some(DeviceStatus::Online));

        monitor.poll_once().await.unwrap();
        assert_eq!(registry.status("d1").await, Some(DeviceStatus::Offline));

        fake.add_device(test_device_info("d1", "Pixel 7"));
        monitor.poll_once().await.unwrap();
        assert_eq!(registry.status("d1").await, Some(DeviceStatus::Online));
    }

    #[tokio::test]
    async fn test_network_device_is_matched_by_address() {
        let (monitor, registry, _fake) = monitor(
            FakeAdapter::new().with_device(test_device_info("10.0.0.5:5555", "Pixel 7")),
            2,
        );
        let transport = Transport::Network {
            address: "10.0.0.5:5555".into(),
        };
        registry.connect("phone1", Some(transport)).await.unwrap();

        for _ in 0..3 {
            monitor.poll_once().await.unwrap();
        }

        assert_eq!(registry.status("phone1").await, Some(DeviceStatus::Online));
        assert!(registry.get("10.0.0.5:5555").await.is_none());
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reappearing_device_resets_miss_count() {
        let (monitor, registry, fake) =
            monitor(FakeAdapter::new().with_device(test_device_info("d1", "Pixel 7")), 2);
        monitor.poll_once().await.unwrap();

        fake.set_state("d1", AdapterState::Offline);
        monitor.poll_once().await.unwrap();
        fake.set_state("d1", AdapterState::Ready);
        monitor.poll_once().await.unwrap();
        fake.set_state("d1", AdapterState::Offline);
        monitor.poll_once().await.unwrap();

        assert_eq!(registry.status("d1").await, Some(DeviceStatus::Online));
    }

    #[tokio::test]
    async fn test_unauthorized_device_is_registered_offline() {
        let mut info = test_device_info("d9", "Pixel 8");
        info.state = AdapterState::Unauthorized;
        let (monitor, registry, _fake) = monitor(FakeAdapter::new().with_device(info), 3);

        monitor.poll_once().await.unwrap();
        assert_eq!(registry.status("d9").await, Some(DeviceStatus::Offline));
    }

    #[tokio::test]
    async fn test_explicit_disconnect_is_sticky() {
        let (monitor, registry, _fake) =
            monitor(FakeAdapter::new().with_device(test_device_info("d1", "Pixel 7")), 1);
        registry.connect("d1", None).await.unwrap();
        registry.disconnect("d1").await.unwrap();

        monitor.poll_once().await.unwrap();
        assert_eq!(registry.status("d1").await, Some(DeviceStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_listing_failure_changes_nothing() {
        let (monitor, registry, fake) =
            monitor(FakeAdapter::new().with_device(test_device_info("d1", "Pixel 7")), 1);
        monitor.poll_once().await.unwrap();

        fake.set_list_failure(Some("adb server restarting"));
        assert!(monitor.poll_once().await.is_err());
        assert_eq!(registry.status("d1").await, Some(DeviceStatus::Online));
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let (monitor, registry, _fake) =
            monitor(FakeAdapter::new().with_device(test_device_info("d1", "Pixel 7")), 3);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = Arc::clone(&monitor).spawn(shutdown_rx);
        while registry.status("d1").await.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor stops within 1s")
            .unwrap();
    }
}
