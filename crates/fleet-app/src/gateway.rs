//! Command gateway
//!
//! Validates commands against device state and [`CommandPolicy`] before they
//! reach the adapter, bounds every invocation with a timeout, and serializes
//! mirror-affecting commands against mirror start/stop on the same device.
//! Also hosts input injection and file transfer, which share the same
//! Online check and timeout discipline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::timeout;

use fleet_adapter::{DeviceAdapter, InputAction, RemoteEntry};
use fleet_core::prelude::*;
use fleet_core::{CommandResult, Device, DeviceId, RejectReason};

use crate::mirror::MirrorManager;
use crate::policy::CommandPolicy;
use crate::registry::Registry;

/// Directory listed when `list_files` gets no path
pub const DEFAULT_REMOTE_DIR: &str = "/sdcard/";

/// Slack on top of the tool's own timeout before the gateway gives up
const TIMEOUT_SLACK: Duration = Duration::from_millis(500);

/// Per-device result of a batch command, in submission order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub device_id: DeviceId,
    #[serde(flatten)]
    pub result: CommandResult,
}

pub struct CommandGateway<A> {
    adapter: Arc<A>,
    registry: Arc<Registry<A>>,
    mirror: Arc<MirrorManager<A>>,
    policy: CommandPolicy,
    command_timeout: Duration,
    max_file_size: u64,
    download_path: PathBuf,
}

impl<A> std::fmt::Debug for CommandGateway<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandGateway")
            .field("policy", &self.policy)
            .field("command_timeout", &self.command_timeout)
            .field("max_file_size", &self.max_file_size)
            .field("download_path", &self.download_path)
            .finish_non_exhaustive()
    }
}

impl<A> CommandGateway<A>
where
    A: DeviceAdapter + Sync + 'static,
{
    pub fn new(
        adapter: Arc<A>,
        registry: Arc<Registry<A>>,
        mirror: Arc<MirrorManager<A>>,
        policy: CommandPolicy,
        command_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            registry,
            mirror,
            policy,
            command_timeout,
            max_file_size: u64::MAX,
            download_path: PathBuf::from("."),
        }
    }

    pub fn with_storage(mut self, max_file_size: u64, download_path: impl Into<PathBuf>) -> Self {
        self.max_file_size = max_file_size;
        self.download_path = download_path.into();
        self
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    // ─────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────

    /// Validate and run `command` on one device.
    ///
    /// Order: device known and `Online`, command non-empty, block-list,
    /// allow-list. Rejected commands never reach the adapter.
    #[instrument(skip(self), fields(device = %device_id))]
    pub async fn execute(&self, device_id: &str, command: &str) -> CommandResult {
        let device = match self.registry.get(device_id).await {
            Some(device) => device,
            None => return CommandResult::rejected(RejectReason::DeviceNotFound),
        };
        if !device.status.is_online() {
            return CommandResult::rejected(RejectReason::DeviceOffline);
        }

        let command = command.trim();
        if let Err(reason) = self.policy.check(command) {
            info!("Rejected command for {}: {:?} ({})", device_id, command, reason);
            return CommandResult::rejected(reason);
        }

        let _gate = if self.policy.affects_mirror(command) {
            debug!("{:?} affects mirroring, taking the mirror gate", command);
            Some(self.mirror.exclusive(device_id).await)
        } else {
            None
        };

        self.run(&device, command).await
    }

    /// Run the same command on every device concurrently; all results settle
    pub async fn execute_batch(&self, device_ids: &[DeviceId], command: &str) -> Vec<BatchOutcome> {
        let runs = device_ids.iter().map(|device_id| async move {
            BatchOutcome {
                device_id: device_id.clone(),
                result: self.execute(device_id, command).await,
            }
        });
        join_all(runs).await
    }

    /// Inject a tap, swipe, key or text event.
    ///
    /// The command line is built here, so the allow-list does not apply.
    /// An action that cannot be rendered safely is `PolicyRejected`.
    pub async fn inject_input(&self, device_id: &str, action: &InputAction) -> Result<CommandResult> {
        let device = match self.registry.get(device_id).await {
            Some(device) => device,
            None => return Ok(CommandResult::rejected(RejectReason::DeviceNotFound)),
        };
        if !device.status.is_online() {
            return Ok(CommandResult::rejected(RejectReason::DeviceOffline));
        }

        let command = format!("shell {}", action.to_shell()?);
        Ok(self.run(&device, &command).await)
    }

    async fn run(&self, device: &Device, command: &str) -> CommandResult {
        let exec = self
            .adapter
            .exec(device.serial(), command, self.command_timeout);

        match timeout(self.command_timeout + TIMEOUT_SLACK, exec).await {
            Ok(Ok(output)) if output.success() => {
                self.registry.touch(&device.id).await;
                CommandResult::Success {
                    stdout: output.stdout,
                }
            }
            Ok(Ok(output)) => CommandResult::Failure {
                exit_code: output.exit_code,
                stderr: output.stderr,
            },
            Ok(Err(Error::Timeout { .. })) | Err(_) => {
                warn!(
                    "Command on {} timed out after {:?}: {:?}",
                    device.id, self.command_timeout, command
                );
                CommandResult::Timeout
            }
            Ok(Err(e)) => {
                warn!("Command on {} failed: {}", device.id, e);
                CommandResult::Failure {
                    exit_code: None,
                    stderr: e.to_string(),
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────
    // Files
    // ─────────────────────────────────────────────────────────

    /// List a remote directory, `/sdcard/` by default
    pub async fn list_files(&self, device_id: &str, path: Option<&str>) -> Result<Vec<RemoteEntry>> {
        let device = self.require_online(device_id).await?;
        let path = path.filter(|p| !p.trim().is_empty()).unwrap_or(DEFAULT_REMOTE_DIR);

        self.bounded(
            format!("list {} on {}", path, device_id),
            self.adapter
                .list_dir(device.serial(), path, self.command_timeout),
        )
        .await
    }

    /// Upload a local file. A `remote` ending in `/` keeps the local file name.
    pub async fn push_file(&self, device_id: &str, local: &Path, remote: &str) -> Result<String> {
        let device = self.require_online(device_id).await?;

        let size = tokio::fs::metadata(local).await?.len();
        if size > self.max_file_size {
            return Err(Error::policy(format!(
                "{} is {} bytes, limit is {}",
                local.display(),
                size,
                self.max_file_size
            )));
        }

        let remote = if remote.ends_with('/') {
            let name = local
                .file_name()
                .ok_or_else(|| Error::policy(format!("{} has no file name", local.display())))?;
            format!("{}{}", remote, name.to_string_lossy())
        } else {
            remote.to_string()
        };

        self.bounded(
            format!("push to {}", device_id),
            self.adapter
                .push(device.serial(), local, &remote, self.command_timeout),
        )
        .await?;

        info!("Pushed {} to {}:{}", local.display(), device_id, remote);
        Ok(remote)
    }

    /// Download a remote file into the download directory
    pub async fn pull_file(&self, device_id: &str, remote: &str) -> Result<PathBuf> {
        let device = self.require_online(device_id).await?;

        let name = remote
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::policy(format!("{:?} does not name a file", remote)))?;

        tokio::fs::create_dir_all(&self.download_path).await?;
        let local = self.download_path.join(name);

        self.bounded(
            format!("pull from {}", device_id),
            self.adapter
                .pull(device.serial(), remote, &local, self.command_timeout),
        )
        .await?;

        info!("Pulled {}:{} to {}", device_id, remote, local.display());
        Ok(local)
    }

    async fn require_online(&self, device_id: &str) -> Result<Device> {
        let device = self
            .registry
            .get(device_id)
            .await
            .ok_or_else(|| Error::not_found(device_id))?;
        if !device.status.is_online() {
            return Err(Error::invalid_transition(format!(
                "{} is {}",
                device_id, device.status
            )));
        }
        Ok(device)
    }

    async fn bounded<T>(
        &self,
        operation: String,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout(self.command_timeout + TIMEOUT_SLACK, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(operation, self.command_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_adapter::test_utils::{test_device_info, Calls, ExecBehaviour, FakeAdapter};
    use fleet_adapter::CaptureOptions;
    use fleet_core::ExecOutput;

    use crate::hub::Hub;

    struct Harness {
        fake: Arc<FakeAdapter>,
        registry: Arc<Registry<FakeAdapter>>,
        gateway: CommandGateway<FakeAdapter>,
    }

    fn harness(fake: FakeAdapter, command_timeout: Duration) -> Harness {
        let fake = Arc::new(fake);
        let (hub, _dropped) = Hub::spawn(64);
        let registry = Arc::new(Registry::new(
            Arc::clone(&fake),
            hub.clone(),
            Duration::from_secs(1),
        ));
        let mirror = Arc::new(MirrorManager::new(
            Arc::clone(&fake),
            Arc::clone(&registry),
            hub,
            CaptureOptions::default(),
            Duration::from_millis(200),
            Duration::from_millis(100),
        ));
        let gateway = CommandGateway::new(
            Arc::clone(&fake),
            Arc::clone(&registry),
            mirror,
            CommandPolicy::from_settings(&Default::default()),
            command_timeout,
        );
        Harness {
            fake,
            registry,
            gateway,
        }
    }

    fn two_devices() -> FakeAdapter {
        FakeAdapter::new()
            .with_device(test_device_info("d1", "Pixel 7"))
            .with_device(test_device_info("d2", "Galaxy S23"))
    }

    #[tokio::test]
    async fn test_rejections_never_reach_adapter() {
        let h = harness(two_devices(), Duration::from_secs(1));

        assert_eq!(
            h.gateway.execute("nope", "shell ls").await,
            CommandResult::rejected(RejectReason::DeviceNotFound)
        );

        h.registry.connect("d1", None).await.unwrap();
        h.registry.disconnect("d1").await.unwrap();
        assert_eq!(
            h.gateway.execute("d1", "shell ls").await,
            CommandResult::rejected(RejectReason::DeviceOffline)
        );

        h.registry.connect("d1", None).await.unwrap();
        assert_eq!(
            h.gateway.execute("d1", "rm -rf /").await,
            CommandResult::rejected(RejectReason::Blocked)
        );
        assert_eq!(
            h.gateway.execute("d1", "reboot bootloader").await,
            CommandResult::rejected(RejectReason::NotAllowed)
        );
        assert_eq!(
            h.gateway.execute("d1", "  ").await,
            CommandResult::rejected(RejectReason::EmptyCommand)
        );
        assert_eq!(Calls::get(&h.fake.calls.exec), 0);
    }

    #[tokio::test]
    async fn test_success_and_failure() {
        let h = harness(
            two_devices().with_exec(
                "shell false",
                ExecBehaviour::Output(ExecOutput::failed(1, "nope")),
            ),
            Duration::from_secs(1),
        );
        h.registry.connect("d1", None).await.unwrap();

        assert_eq!(
            h.gateway.execute("d1", "shell getprop ro.product.model").await,
            CommandResult::Success {
                stdout: "d1: shell getprop ro.product.model".into()
            }
        );
        assert_eq!(
            h.gateway.execute("d1", "shell false").await,
            CommandResult::Failure {
                exit_code: Some(1),
                stderr: "nope".into()
            }
        );
    }

    #[tokio::test]
    async fn test_hung_command_times_out_and_is_abandoned() {
        let h = harness(
            two_devices().with_exec("shell sleep", ExecBehaviour::Hang),
            Duration::from_millis(50),
        );
        h.registry.connect("d1", None).await.unwrap();

        assert_eq!(
            h.gateway.execute("d1", "shell sleep 999").await,
            CommandResult::Timeout
        );
        assert_eq!(Calls::get(&h.fake.calls.exec_abandoned), 1);
    }

    #[tokio::test]
    async fn test_batch_settles_all_in_order() {
        let h = harness(
            two_devices().with_exec(
                "shell uptime",
                ExecBehaviour::Delayed(Duration::from_millis(30), ExecOutput::ok("up")),
            ),
            Duration::from_secs(1),
        );
        h.registry.connect("d1", None).await.unwrap();
        h.registry.connect("d2", None).await.unwrap();

        let ids: Vec<DeviceId> = vec!["d2".into(), "missing".into(), "d1".into()];
        let outcomes = h.gateway.execute_batch(&ids, "shell uptime").await;

        let order: Vec<&str> = outcomes.iter().map(|o| o.device_id.as_str()).collect();
        assert_eq!(order, vec!["d2", "missing", "d1"]);
        assert!(outcomes[0].result.is_success());
        assert_eq!(
            outcomes[1].result,
            CommandResult::rejected(RejectReason::DeviceNotFound)
        );
        assert!(outcomes[2].result.is_success());
    }

    #[tokio::test]
    async fn test_input_bypasses_allow_list() {
        let h = harness(two_devices(), Duration::from_secs(1));
        h.registry.connect("d1", None).await.unwrap();

        let result = h
            .gateway
            .inject_input("d1", &InputAction::Tap { x: 10, y: 20 })
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(
            h.fake.exec_log(),
            vec![("d1".to_string(), "shell input tap 10 20".to_string())]
        );

        let err = h
            .gateway
            .inject_input("d1", &InputAction::Text { text: "a\nb".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PolicyRejected { .. }));
    }

    #[tokio::test]
    async fn test_push_respects_size_limit() {
        let temp = tempfile::tempdir().unwrap();
        let local = temp.path().join("big.bin");
        std::fs::write(&local, vec![0u8; 64]).unwrap();

        let h = harness(two_devices(), Duration::from_secs(1));
        let gateway = h.gateway.with_storage(16, temp.path().join("downloads"));
        h.registry.connect("d1", None).await.unwrap();

        let err = gateway.push_file("d1", &local, "/sdcard/").await.unwrap_err();
        assert!(matches!(err, Error::PolicyRejected { .. }));
        assert!(h.fake.pushed().is_empty());
    }

    #[tokio::test]
    async fn test_push_and_pull() {
        let temp = tempfile::tempdir().unwrap();
        let local = temp.path().join("notes.txt");
        std::fs::write(&local, "hello").unwrap();

        let h = harness(two_devices(), Duration::from_secs(1));
        let gateway = h.gateway.with_storage(1024, temp.path().join("downloads"));
        h.registry.connect("d1", None).await.unwrap();

        let remote = gateway.push_file("d1", &local, "/sdcard/").await.unwrap();
        assert_eq!(remote, "/sdcard/notes.txt");
        assert_eq!(h.fake.pushed(), vec![(local.clone(), remote)]);

        let pulled = gateway.pull_file("d1", "/sdcard/DCIM/shot.png").await.unwrap();
        assert_eq!(pulled, temp.path().join("downloads").join("shot.png"));
        assert_eq!(
            std::fs::read_to_string(&pulled).unwrap(),
            "d1:/sdcard/DCIM/shot.png"
        );
    }

    #[tokio::test]
    async fn test_file_ops_require_online() {
        let h = harness(two_devices(), Duration::from_secs(1));
        h.registry.connect("d1", None).await.unwrap();
        h.registry.disconnect("d1").await.unwrap();
        assert!(matches!(
            h.gateway.list_files("d1", None).await,
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.gateway.pull_file("zz", "/sdcard/x").await,
            Err(Error::NotFound { .. })
        ));
    }
}
