//! Broadcast hub: ordered fan-out of fleet events to attached observers
//!
//! A single sequencer task owns the observer table and a mirror of the device
//! list. Every publish, attach and detach goes through one command queue, so
//! all observers see events in the same order and an attach snapshot is
//! exactly the state implied by the events published before it.
//!
//! Delivery to each observer is a `try_send` into that observer's bounded
//! queue. An observer whose queue is full (or whose receiver is gone) is
//! removed and reported on the dropped-observer channel; nobody else waits.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::{mpsc, oneshot};

use fleet_core::prelude::*;
use fleet_core::{Device, DeviceId, HubEvent, Interests, ObserverId};

/// An attached observer: its id and the receiving end of its event queue
#[derive(Debug)]
pub struct Observer {
    pub id: ObserverId,
    pub events: mpsc::Receiver<HubEvent>,
}

enum HubCommand {
    Publish(HubEvent),
    PublishTo {
        targets: Vec<ObserverId>,
        event: HubEvent,
    },
    Attach {
        id: ObserverId,
        interests: Interests,
        tx: mpsc::Sender<HubEvent>,
    },
    Detach(ObserverId),
    Observers(oneshot::Sender<Vec<ObserverId>>),
    Shutdown,
}

struct Subscriber {
    interests: Interests,
    tx: mpsc::Sender<HubEvent>,
}

/// Handle to the hub's sequencer task. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    cmd_tx: mpsc::UnboundedSender<HubCommand>,
    queue_size: usize,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("queue_size", &self.queue_size)
            .field("closed", &self.cmd_tx.is_closed())
            .finish()
    }
}

impl Hub {
    /// Start the sequencer task.
    ///
    /// Returns the hub handle and a receiver of observers the hub dropped on
    /// its own (queue overflow or receiver gone).
    pub fn spawn(queue_size: usize) -> (Self, mpsc::UnboundedReceiver<ObserverId>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_sequencer(cmd_rx, dropped_tx));

        (
            Self {
                cmd_tx,
                queue_size: queue_size.max(1),
            },
            dropped_rx,
        )
    }

    /// Deliver to every attached observer interested in the event's kind
    pub fn publish(&self, event: HubEvent) {
        self.send(HubCommand::Publish(event));
    }

    /// Deliver only to `targets` (still subject to their interests)
    pub fn publish_to(&self, targets: Vec<ObserverId>, event: HubEvent) {
        if targets.is_empty() {
            return;
        }
        self.send(HubCommand::PublishTo { targets, event });
    }

    /// Register a new observer. Its first event is always a `Snapshot`.
    pub fn attach(&self, interests: Interests) -> Observer {
        let id = ObserverId::next();
        let (tx, events) = mpsc::channel(self.queue_size);
        self.send(HubCommand::Attach { id, interests, tx });
        debug!("Observer {} attaching", id);
        Observer { id, events }
    }

    /// Remove an observer. Idempotent.
    pub fn detach(&self, id: ObserverId) {
        self.send(HubCommand::Detach(id));
    }

    /// Currently attached observers, in attach order
    pub async fn observers(&self) -> Vec<ObserverId> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Observers(tx));
        rx.await.unwrap_or_default()
    }

    /// Stop the sequencer; every observer queue closes after pending events
    pub fn shutdown(&self) {
        self.send(HubCommand::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    fn send(&self, command: HubCommand) {
        if self.cmd_tx.send(command).is_err() {
            trace!("hub is shut down, command discarded");
        }
    }
}

async fn run_sequencer(
    mut cmd_rx: mpsc::UnboundedReceiver<HubCommand>,
    dropped_tx: mpsc::UnboundedSender<ObserverId>,
) {
    let mut devices: BTreeMap<DeviceId, Device> = BTreeMap::new();
    let mut subscribers: HashMap<ObserverId, Subscriber> = HashMap::new();
    let mut order: Vec<ObserverId> = Vec::new();

    while let Some(command) = cmd_rx.recv().await {
        match command {
            HubCommand::Publish(event) => {
                if let HubEvent::DeviceChanged { device } = &event {
                    devices.insert(device.id.clone(), device.clone());
                }
                let targets = order.clone();
                deliver(&targets, &event, &mut subscribers, &mut order, &dropped_tx);
            }
            HubCommand::PublishTo { targets, event } => {
                deliver(&targets, &event, &mut subscribers, &mut order, &dropped_tx);
            }
            HubCommand::Attach { id, interests, tx } => {
                let snapshot = HubEvent::Snapshot {
                    devices: devices.values().cloned().collect(),
                };
                // The queue is fresh, so the snapshot always fits.
                if tx.try_send(snapshot).is_err() {
                    debug!("Observer {} went away before attaching", id);
                    continue;
                }
                subscribers.insert(id, Subscriber { interests, tx });
                order.push(id);
                info!("Observer {} attached ({} total)", id, order.len());
            }
            HubCommand::Detach(id) => {
                if subscribers.remove(&id).is_some() {
                    order.retain(|o| *o != id);
                    info!("Observer {} detached ({} remaining)", id, order.len());
                }
            }
            HubCommand::Observers(reply) => {
                let _ = reply.send(order.clone());
            }
            HubCommand::Shutdown => {
                info!("Hub shutting down with {} observers", order.len());
                break;
            }
        }
    }

    debug!("hub sequencer finished");
}

fn deliver(
    targets: &[ObserverId],
    event: &HubEvent,
    subscribers: &mut HashMap<ObserverId, Subscriber>,
    order: &mut Vec<ObserverId>,
    dropped_tx: &mpsc::UnboundedSender<ObserverId>,
) {
    let kind = event.kind();
    let mut dropped = Vec::new();

    for id in targets {
        let Some(subscriber) = subscribers.get(id) else {
            continue;
        };
        if !subscriber.interests.wants(kind) {
            continue;
        }

        match subscriber.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Observer {} receiver closed", id);
                dropped.push(*id);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Observer {} cannot keep up, dropping it", id);
                dropped.push(*id);
            }
        }
    }

    for id in dropped {
        subscribers.remove(&id);
        order.retain(|o| *o != id);
        let _ = dropped_tx.send(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use fleet_core::{DeviceStatus, MirrorState, Transport};
    use std::time::Duration;
    use tokio::time::timeout;

    fn device(id: &str, status: DeviceStatus) -> Device {
        Device {
            status,
            ..Device::new(id, Transport::Usb)
        }
    }

    async fn recv(observer: &mut Observer) -> HubEvent {
        timeout(Duration::from_secs(1), observer.events.recv())
            .await
            .expect("event within 1s")
            .expect("hub still open")
    }

    #[tokio::test]
    async fn test_snapshot_is_first_event() {
        let (hub, _dropped) = Hub::spawn(16);
        hub.publish(HubEvent::DeviceChanged {
            device: device("d1", DeviceStatus::Online),
        });

        let mut observer = hub.attach(Interests::all());
        match recv(&mut observer).await {
            HubEvent::Snapshot { devices } => {
                assert_eq!(devices.len(), 1);
                assert_eq!(devices[0].status, DeviceStatus::Online);
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_observers_see_same_order() {
        let (hub, _dropped) = Hub::spawn(64);
        let mut a = hub.attach(Interests::all());
        let mut b = hub.attach(Interests::all());
        recv(&mut a).await;
        recv(&mut b).await;

        for status in [
            DeviceStatus::Connecting,
            DeviceStatus::Online,
            DeviceStatus::Offline,
        ] {
            hub.publish(HubEvent::DeviceChanged {
                device: device("d1", status),
            });
        }

        for observer in [&mut a, &mut b] {
            let mut seen = Vec::new();
            for _ in 0..3 {
                if let HubEvent::DeviceChanged { device } = recv(observer).await {
                    seen.push(device.status);
                }
            }
            assert_eq!(
                seen,
                vec![
                    DeviceStatus::Connecting,
                    DeviceStatus::Online,
                    DeviceStatus::Offline
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_slow_observer_dropped_without_blocking_others() {
        let (hub, mut dropped) = Hub::spawn(2);
        let mut fast = hub.attach(Interests::all());
        let slow = hub.attach(Interests::all());
        recv(&mut fast).await;

        // Snapshot already occupies one of the slow observer's two slots
        for i in 0..4 {
            hub.publish(HubEvent::DeviceChanged {
                device: device(&format!("d{}", i), DeviceStatus::Online),
            });
            recv(&mut fast).await;
        }

        let gone = timeout(Duration::from_secs(1), dropped.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gone, slow.id);
        assert_eq!(hub.observers().await, vec![fast.id]);
    }

    #[tokio::test]
    async fn test_targeted_and_filtered_delivery() {
        let (hub, _dropped) = Hub::spawn(16);
        let mut viewer = hub.attach(Interests::all());
        let mut dashboard = hub.attach(Interests::without_frames());
        recv(&mut viewer).await;
        recv(&mut dashboard).await;

        hub.publish_to(
            vec![viewer.id, dashboard.id],
            HubEvent::MirrorFrame {
                device_id: "d1".into(),
                payload: Bytes::from_static(b"\x00\x01"),
            },
        );
        hub.publish_to(
            vec![dashboard.id],
            HubEvent::MirrorState {
                device_id: "d1".into(),
                state: MirrorState::Streaming,
            },
        );

        assert!(matches!(recv(&mut viewer).await, HubEvent::MirrorFrame { .. }));
        assert!(matches!(
            recv(&mut dashboard).await,
            HubEvent::MirrorState { .. }
        ));
        assert!(viewer.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let (hub, _dropped) = Hub::spawn(16);
        let observer = hub.attach(Interests::all());
        hub.detach(observer.id);
        hub.detach(observer.id);
        assert!(hub.observers().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_queues() {
        let (hub, _dropped) = Hub::spawn(16);
        let mut observer = hub.attach(Interests::all());
        recv(&mut observer).await;

        hub.shutdown();
        let closed = timeout(Duration::from_secs(1), observer.events.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishers_seen_in_one_order() {
        const PUBLISHERS: usize = 4;
        const PER_PUBLISHER: usize = 50;

        let (hub, _dropped) = Hub::spawn(PUBLISHERS * PER_PUBLISHER + 8);
        let mut observers: Vec<Observer> = (0..3).map(|_| hub.attach(Interests::all())).collect();

        let tasks: Vec<_> = (0..PUBLISHERS)
            .map(|p| {
                let hub = hub.clone();
                tokio::spawn(async move {
                    for i in 0..PER_PUBLISHER {
                        hub.publish(HubEvent::MirrorStopped {
                            device_id: format!("p{}", p),
                            reason: Some(i.to_string()),
                        });
                        if i % 7 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let mut sequences = Vec::new();
        for observer in &mut observers {
            assert!(matches!(recv(observer).await, HubEvent::Snapshot { .. }));
            let mut seen = Vec::new();
            while seen.len() < PUBLISHERS * PER_PUBLISHER {
                if let HubEvent::MirrorStopped { device_id, reason } = recv(observer).await {
                    seen.push((device_id, reason.unwrap_or_default()));
                }
            }
            sequences.push(seen);
        }

        // Identical interleaving for everyone
        assert!(sequences.iter().all(|seq| *seq == sequences[0]));

        // Each publisher's own events stay in the order it sent them
        for p in 0..PUBLISHERS {
            let tag = format!("p{}", p);
            let order: Vec<usize> = sequences[0]
                .iter()
                .filter(|(id, _)| *id == tag)
                .map(|(_, n)| n.parse().unwrap())
                .collect();
            assert_eq!(order, (0..PER_PUBLISHER).collect::<Vec<_>>());
        }
    }
}
