//! `adb`-backed implementation of [`DeviceAdapter`]

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;

use fleet_core::events::CaptureEvent;
use fleet_core::prelude::*;
use fleet_core::types::{AdapterState, DeviceInfo, DeviceMetadata, ExecOutput, Transport};

use crate::adapter::{CaptureOptions, DeviceAdapter, RemoteEntry};
use crate::devices::{
    apply_getprop, parse_battery_level, parse_device_list, parse_ls_output, parse_signal_level,
    parse_wm_size,
};
use crate::process::CaptureProcess;
use crate::tool::{run_tool, run_tool_checked};

/// Talks to devices through the `adb` command-line tool
#[derive(Debug, Clone)]
pub struct AdbAdapter {
    program: String,
    /// Bound for the adapter's own housekeeping calls (listing, probing)
    query_timeout: Duration,
}

impl AdbAdapter {
    pub fn new(program: impl Into<String>, query_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            query_timeout,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn adb(&self, args: &[&str], limit: Duration) -> Result<ExecOutput> {
        run_tool(&self.program, args, limit).await
    }

    async fn adb_checked(&self, args: &[&str], limit: Duration) -> Result<String> {
        run_tool_checked(&self.program, args, limit).await
    }

    /// Run a device shell command for probing; failures are logged and dropped
    async fn shell_query(&self, serial: &str, command: &str) -> Option<String> {
        match self
            .adb_checked(&["-s", serial, "shell", command], self.query_timeout)
            .await
        {
            Ok(stdout) => Some(stdout),
            Err(e) => {
                debug!("query '{}' on {} failed: {}", command, serial, e);
                None
            }
        }
    }

    async fn find_device(&self, serial: &str) -> Result<DeviceInfo> {
        let devices = self.list_devices().await?;
        devices
            .into_iter()
            .find(|d| d.serial == serial)
            .ok_or_else(|| Error::tool(format!("device {} is not attached", serial)))
    }
}

impl DeviceAdapter for AdbAdapter {
    async fn connect(&self, id: &str, transport: &Transport) -> Result<DeviceInfo> {
        let serial = match transport {
            Transport::Usb => id.to_string(),
            Transport::Network { address } => {
                let stdout = self
                    .adb_checked(&["connect", address.as_str()], self.query_timeout)
                    .await?;
                // adb exits 0 even when the connection is refused
                let lowered = stdout.to_lowercase();
                if lowered.contains("failed") || lowered.contains("unable") {
                    return Err(Error::tool(stdout.trim().to_string()));
                }
                info!("adb connect {}: {}", address, stdout.trim());
                address.clone()
            }
        };

        let listed = self.find_device(&serial).await?;
        if listed.state != AdapterState::Ready {
            return Err(Error::tool(format!(
                "device {} is {:?}",
                serial, listed.state
            )));
        }

        let metadata = match self.describe(&serial).await {
            Ok(described) => described.merged_with(&listed.metadata),
            Err(e) => {
                warn!("Could not describe {}: {}", serial, e);
                listed.metadata.clone()
            }
        };

        Ok(DeviceInfo {
            serial,
            state: listed.state,
            metadata,
        })
    }

    async fn disconnect(&self, _id: &str, transport: &Transport) -> Result<()> {
        match transport {
            Transport::Usb => Ok(()),
            Transport::Network { address } => {
                self.adb_checked(&["disconnect", address.as_str()], self.query_timeout)
                    .await?;
                Ok(())
            }
        }
    }

    async fn start_capture(
        &self,
        serial: &str,
        options: &CaptureOptions,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<CaptureProcess> {
        let mut args: Vec<String> = [
            "-s",
            serial,
            "exec-out",
            "screenrecord",
            "--output-format=h264",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if options.max_size > 0 {
            let resolution = self
                .shell_query(serial, "wm size")
                .await
                .and_then(|out| parse_wm_size(&out));
            if let Some(size) = resolution.and_then(|r| scaled_size(&r, options.max_size)) {
                args.push(format!("--size={}", size));
            }
        }
        args.push(format!("--bit-rate={}", options.bit_rate));
        args.push("-".to_string());

        CaptureProcess::spawn(&self.program, &args, events)
    }

    async fn exec(&self, serial: &str, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let command = command.trim();
        let mut args = vec!["-s".to_string(), serial.to_string()];

        // The device shell gets the remainder verbatim; its own quoting applies there.
        match command.split_once(char::is_whitespace) {
            Some(("shell", rest)) => {
                args.push("shell".to_string());
                args.push(rest.trim_start().to_string());
            }
            _ => args.extend(split_words(command)?),
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.adb(&args, timeout).await
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let stdout = self.adb_checked(&["devices", "-l"], self.query_timeout).await?;
        Ok(parse_device_list(&stdout))
    }

    async fn describe(&self, serial: &str) -> Result<DeviceMetadata> {
        // getprop doubles as the reachability check
        let props = self
            .adb_checked(&["-s", serial, "shell", "getprop"], self.query_timeout)
            .await?;

        let mut metadata = DeviceMetadata::default();
        apply_getprop(&props, &mut metadata);

        let (wm, battery, telephony) = tokio::join!(
            self.shell_query(serial, "wm size"),
            self.shell_query(serial, "dumpsys battery"),
            self.shell_query(serial, "dumpsys telephony.registry"),
        );

        metadata.resolution = wm.as_deref().and_then(parse_wm_size);
        metadata.set_battery_percent(battery.as_deref().and_then(parse_battery_level));
        metadata.set_signal_level(telephony.as_deref().and_then(parse_signal_level));

        Ok(metadata)
    }

    async fn push(
        &self,
        serial: &str,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<()> {
        let local = local.to_string_lossy();
        self.adb_checked(&["-s", serial, "push", &*local, remote], timeout)
            .await?;
        Ok(())
    }

    async fn pull(
        &self,
        serial: &str,
        remote: &str,
        local: &Path,
        timeout: Duration,
    ) -> Result<()> {
        let local = local.to_string_lossy();
        self.adb_checked(&["-s", serial, "pull", remote, &*local], timeout)
            .await?;
        Ok(())
    }

    async fn list_dir(
        &self,
        serial: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<Vec<RemoteEntry>> {
        let command = format!("ls -l {}", shell_quote(path));
        let output = self.adb(&["-s", serial, "shell", command.as_str()], timeout).await?;

        let entries = parse_ls_output(&output.stdout);
        if !output.success() && entries.is_empty() {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim()
            } else {
                output.stderr.trim()
            };
            return Err(Error::tool(format!("ls {} failed: {}", path, detail)));
        }
        Ok(entries)
    }
}

/// Scale `WxH` so that its longest edge is at most `max`, keeping dimensions even
fn scaled_size(resolution: &str, max: u32) -> Option<String> {
    let (w, h) = resolution.split_once('x')?;
    let (w, h): (u32, u32) = (w.parse().ok()?, h.parse().ok()?);
    if w == 0 || h == 0 {
        return None;
    }

    let longest = w.max(h);
    if longest <= max {
        return Some(format!("{}x{}", w, h));
    }

    let scale = |v: u32| ((u64::from(v) * u64::from(max) / u64::from(longest)) as u32) & !1;
    Some(format!("{}x{}", scale(w), scale(h)))
}

/// Wrap `s` in single quotes for the device shell
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Split an adb argument line into words, honouring single and double quotes
fn split_words(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(Error::policy("unterminated quote in command"));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
