//! Test utilities: a scripted in-memory [`DeviceAdapter`]
//!
//! `FakeAdapter` stands in for adb in orchestrator tests. Devices, connect
//! outcomes, command responses and capture behaviour are scripted up front
//! (builder methods) or changed while a test runs (`set_*` methods), and
//! every call is counted so tests can assert what reached the tool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use fleet_core::events::CaptureEvent;
use fleet_core::prelude::*;
use fleet_core::types::{AdapterState, DeviceInfo, DeviceMetadata, ExecOutput, Transport};

use crate::adapter::{CaptureOptions, DeviceAdapter, RemoteEntry};
use crate::process::{CaptureProcess, CaptureScript};

/// How `connect` behaves for a device id
#[derive(Debug, Clone)]
pub enum ConnectBehaviour {
    /// Succeed if the device is listed as ready
    Succeed,
    /// Succeed after a delay
    Delay(Duration),
    Fail(String),
    /// Never resolve
    Hang,
}

/// How `exec` behaves for commands matching a prefix
#[derive(Debug, Clone)]
pub enum ExecBehaviour {
    Output(ExecOutput),
    Delayed(Duration, ExecOutput),
    Fail(String),
    /// Never resolve; the caller's timeout must fire
    Hang,
}

/// How `start_capture` behaves
#[derive(Debug, Clone)]
pub enum CaptureBehaviour {
    Stream(CaptureScript),
    SpawnFailure(String),
}

/// Creates a ready test device entry.
pub fn test_device_info(serial: &str, model: &str) -> DeviceInfo {
    DeviceInfo {
        serial: serial.to_string(),
        state: AdapterState::Ready,
        metadata: DeviceMetadata {
            model: Some(model.to_string()),
            os_version: Some("14".to_string()),
            resolution: Some("1080x2400".to_string()),
            ..Default::default()
        }
        .with_battery(80)
        .with_signal(4),
    }
}

#[derive(Debug, Default)]
struct Script {
    devices: Vec<DeviceInfo>,
    connect: HashMap<String, ConnectBehaviour>,
    exec: Vec<(String, ExecBehaviour)>,
    capture: Option<CaptureBehaviour>,
    list_failure: Option<String>,
    directories: HashMap<String, Vec<RemoteEntry>>,
    exec_log: Vec<(String, String)>,
    pushed: Vec<(PathBuf, String)>,
}

/// Counts of calls that reached the fake tool
#[derive(Debug, Default)]
pub struct Calls {
    pub connect: AtomicUsize,
    pub disconnect: AtomicUsize,
    pub exec: AtomicUsize,
    /// Exec calls whose future was dropped before completing (timed out or cancelled)
    pub exec_abandoned: AtomicUsize,
    pub connect_abandoned: AtomicUsize,
    pub capture_starts: AtomicUsize,
    pub list_devices: AtomicUsize,
    pub describe: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Scripted in-memory device tool
#[derive(Debug, Default)]
pub struct FakeAdapter {
    script: Mutex<Script>,
    pub calls: Calls,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn with_device(self, info: DeviceInfo) -> Self {
        self.lock().devices.push(info);
        self
    }

    pub fn with_connect(self, id: &str, behaviour: ConnectBehaviour) -> Self {
        self.set_connect(id, behaviour);
        self
    }

    pub fn with_exec(self, prefix: &str, behaviour: ExecBehaviour) -> Self {
        self.lock().exec.push((prefix.to_string(), behaviour));
        self
    }

    pub fn with_capture(self, behaviour: CaptureBehaviour) -> Self {
        self.set_capture(behaviour);
        self
    }

    pub fn with_directory(self, path: &str, entries: Vec<RemoteEntry>) -> Self {
        self.lock().directories.insert(path.to_string(), entries);
        self
    }

    pub fn set_connect(&self, id: &str, behaviour: ConnectBehaviour) {
        self.lock().connect.insert(id.to_string(), behaviour);
    }

    pub fn set_capture(&self, behaviour: CaptureBehaviour) {
        self.lock().capture = Some(behaviour);
    }

    /// Change the state a listed device reports
    pub fn set_state(&self, serial: &str, state: AdapterState) {
        let mut script = self.lock();
        if let Some(device) = script.devices.iter_mut().find(|d| d.serial == serial) {
            device.state = state;
        }
    }

    /// Unplug a device: it disappears from listings
    pub fn remove_device(&self, serial: &str) {
        self.lock().devices.retain(|d| d.serial != serial);
    }

    pub fn add_device(&self, info: DeviceInfo) {
        let mut script = self.lock();
        script.devices.retain(|d| d.serial != info.serial);
        script.devices.push(info);
    }

    /// Make `list_devices` fail until cleared with `None`
    pub fn set_list_failure(&self, message: Option<&str>) {
        self.lock().list_failure = message.map(str::to_string);
    }

    /// `(serial, command)` pairs that reached `exec`, in call order
    pub fn exec_log(&self) -> Vec<(String, String)> {
        self.lock().exec_log.clone()
    }

    /// `(local, remote)` pairs that reached `push`
    pub fn pushed(&self) -> Vec<(PathBuf, String)> {
        self.lock().pushed.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        // A panicking test thread must not cascade into unrelated assertions
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listed(&self, serial: &str) -> Result<DeviceInfo> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.serial == serial)
            .cloned()
            .ok_or_else(|| Error::tool(format!("device '{}' not found", serial)))
    }

    fn ready(&self, serial: &str) -> Result<DeviceInfo> {
        let info = self.listed(serial)?;
        if info.state != AdapterState::Ready {
            return Err(Error::tool(format!("device '{}' is {:?}", serial, info.state)));
        }
        Ok(info)
    }
}

/// Counts a call as abandoned unless disarmed
struct AbandonGuard<'a> {
    counter: &'a AtomicUsize,
    armed: bool,
}

impl<'a> AbandonGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        Self {
            counter,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl DeviceAdapter for FakeAdapter {
    async fn connect(&self, id: &str, transport: &Transport) -> Result<DeviceInfo> {
        self.calls.connect.fetch_add(1, Ordering::SeqCst);
        let guard = AbandonGuard::new(&self.calls.connect_abandoned);

        let behaviour = self
            .lock()
            .connect
            .get(id)
            .cloned()
            .unwrap_or(ConnectBehaviour::Succeed);

        let serial = match transport {
            Transport::Usb => id,
            Transport::Network { address } => address.as_str(),
        };

        let result = match behaviour {
            ConnectBehaviour::Succeed => self.ready(serial),
            ConnectBehaviour::Delay(delay) => {
                tokio::time::sleep(delay).await;
                self.ready(serial)
            }
            ConnectBehaviour::Fail(message) => Err(Error::tool(message)),
            ConnectBehaviour::Hang => std::future::pending().await,
        };
        guard.disarm();
        result
    }

    async fn disconnect(&self, _id: &str, _transport: &Transport) -> Result<()> {
        self.calls.disconnect.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_capture(
        &self,
        serial: &str,
        _options: &CaptureOptions,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<CaptureProcess> {
        self.calls.capture_starts.fetch_add(1, Ordering::SeqCst);
        self.ready(serial)?;

        let behaviour = self
            .lock()
            .capture
            .clone()
            .unwrap_or(CaptureBehaviour::Stream(CaptureScript::default()));

        match behaviour {
            CaptureBehaviour::Stream(script) => Ok(CaptureProcess::simulated(script, events)),
            CaptureBehaviour::SpawnFailure(reason) => Err(Error::ProcessSpawn { reason }),
        }
    }

    async fn exec(&self, serial: &str, command: &str, _timeout: Duration) -> Result<ExecOutput> {
        self.calls.exec.fetch_add(1, Ordering::SeqCst);
        let guard = AbandonGuard::new(&self.calls.exec_abandoned);

        let behaviour = {
            let mut script = self.lock();
            script
                .exec_log
                .push((serial.to_string(), command.to_string()));
            script
                .exec
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))
                .map(|(_, behaviour)| behaviour.clone())
        };

        let result = match behaviour {
            None => Ok(ExecOutput::ok(format!("{}: {}", serial, command))),
            Some(ExecBehaviour::Output(output)) => Ok(output),
            Some(ExecBehaviour::Delayed(delay, output)) => {
                tokio::time::sleep(delay).await;
                Ok(output)
            }
            Some(ExecBehaviour::Fail(message)) => Err(Error::tool(message)),
            Some(ExecBehaviour::Hang) => std::future::pending().await,
        };
        guard.disarm();
        result
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        self.calls.list_devices.fetch_add(1, Ordering::SeqCst);
        let script = self.lock();
        match &script.list_failure {
            Some(message) => Err(Error::tool(message.clone())),
            None => Ok(script.devices.clone()),
        }
    }

    async fn describe(&self, serial: &str) -> Result<DeviceMetadata> {
        self.calls.describe.fetch_add(1, Ordering::SeqCst);
        Ok(self.ready(serial)?.metadata)
    }

    async fn push(
        &self,
        serial: &str,
        local: &Path,
        remote: &str,
        _timeout: Duration,
    ) -> Result<()> {
        self.ready(serial)?;
        if !local.is_file() {
            return Err(Error::tool(format!("cannot stat '{}'", local.display())));
        }
        self.lock()
            .pushed
            .push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    async fn pull(
        &self,
        serial: &str,
        remote: &str,
        local: &Path,
        _timeout: Duration,
    ) -> Result<()> {
        self.ready(serial)?;
        std::fs::write(local, format!("{}:{}", serial, remote))?;
        Ok(())
    }

    async fn list_dir(
        &self,
        serial: &str,
        path: &str,
        _timeout: Duration,
    ) -> Result<Vec<RemoteEntry>> {
        self.ready(serial)?;
        self.lock()
            .directories
            .get(path)
            .cloned()
            .ok_or_else(|| Error::tool(format!("ls: {}: No such file or directory", path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_requires_ready_device() {
        let fake = FakeAdapter::new()
            .with_device(test_device_info("d1", "Pixel 7"))
            .with_device(DeviceInfo {
                state: AdapterState::Unauthorized,
                ..test_device_info("d2", "Pixel 6")
            });

        assert!(fake.connect("d1", &Transport::Usb).await.is_ok());
        assert!(fake.connect("d2", &Transport::Usb).await.is_err());
        assert!(fake.connect("missing", &Transport::Usb).await.is_err());
        assert_eq!(Calls::get(&fake.calls.connect), 3);
    }

    #[tokio::test]
    async fn test_abandoned_exec_is_counted() {
        let fake = FakeAdapter::new()
            .with_device(test_device_info("d1", "Pixel 7"))
            .with_exec("shell sleep", ExecBehaviour::Hang);

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            fake.exec("d1", "shell sleep 100", Duration::from_secs(60)),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(Calls::get(&fake.calls.exec_abandoned), 1);
        assert_eq!(fake.exec_log(), vec![("d1".to_string(), "shell sleep 100".to_string())]);
    }

    #[tokio::test]
    async fn test_default_exec_echoes() {
        let fake = FakeAdapter::new().with_device(test_device_info("d1", "Pixel 7"));
        let output = fake
            .exec("d1", "shell getprop", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(output.stdout, "d1: shell getprop");
        assert_eq!(Calls::get(&fake.calls.exec_abandoned), 0);
    }

    #[tokio::test]
    async fn test_capture_spawn_failure() {
        let fake = FakeAdapter::new()
            .with_device(test_device_info("d1", "Pixel 7"))
            .with_capture(CaptureBehaviour::SpawnFailure("no screenrecord".into()));
        let (tx, _rx) = mpsc::channel(8);

        let result = fake
            .start_capture("d1", &CaptureOptions::default(), tx)
            .await;
        assert!(matches!(result, Err(Error::ProcessSpawn { .. })));
    }

    #[tokio::test]
    async fn test_listing_follows_script() {
        let fake = FakeAdapter::new().with_device(test_device_info("d1", "Pixel 7"));
        fake.set_state("d1", AdapterState::Offline);
        let listed = fake.list_devices().await.unwrap();
        assert_eq!(listed[0].state, AdapterState::Offline);

        fake.remove_device("d1");
        assert!(fake.list_devices().await.unwrap().is_empty());

        fake.set_list_failure(Some("adb server died"));
        assert!(fake.list_devices().await.is_err());
    }
}
