//! Headless mode runner - stdin commands in, NDJSON events out
//!
//! One observer is attached for the lifetime of the process; everything the
//! hub sends it is printed. Commands read from stdin are parsed into
//! [`StdinCommand`] and dispatched against the [`Fleet`] one at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use fleet_adapter::{AdbAdapter, DeviceAdapter, InputAction, ToolAvailability};
use fleet_app::{load_settings, Fleet, DEFAULT_REMOTE_DIR};
use fleet_core::prelude::*;
use fleet_core::{DeviceId, Interests, ObserverId, Transport};

use super::{HeadlessEvent, TransferDirection};

/// A parsed stdin line
#[derive(Debug, Clone, PartialEq)]
pub enum StdinCommand {
    List,
    Poll,
    Sessions,
    Connect {
        id: String,
        transport: Transport,
    },
    Disconnect {
        id: String,
    },
    Exec {
        id: String,
        command: String,
    },
    Batch {
        ids: Vec<DeviceId>,
        command: String,
    },
    Mirror {
        id: String,
    },
    Unmirror {
        id: String,
    },
    Stop {
        id: String,
    },
    Input {
        id: String,
        action: InputAction,
    },
    Ls {
        id: String,
        path: Option<String>,
    },
    Pull {
        id: String,
        remote: String,
    },
    Push {
        id: String,
        local: PathBuf,
        remote: String,
    },
    Quit,
}

/// Parse one stdin line. `Ok(None)` for blank lines.
pub fn parse_command(line: &str) -> std::result::Result<Option<StdinCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (verb, rest) = split_first(line);
    let command = match verb {
        "list" | "ls-devices" => StdinCommand::List,
        "poll" => StdinCommand::Poll,
        "sessions" => StdinCommand::Sessions,
        "q" | "quit" => StdinCommand::Quit,
        "connect" => {
            let (id, address) = split_first(rest);
            let id = required(id, "connect <id> [address]")?;
            let transport = if address.is_empty() {
                Transport::from_serial(&id)
            } else {
                Transport::Network {
                    address: address.to_string(),
                }
            };
            StdinCommand::Connect { id, transport }
        }
        "disconnect" => StdinCommand::Disconnect {
            id: required(rest, "disconnect <id>")?,
        },
        "exec" => {
            let (id, command) = split_first(rest);
            StdinCommand::Exec {
                id: required(id, "exec <id> <command...>")?,
                command: required(command, "exec <id> <command...>")?,
            }
        }
        "batch" => {
            let (ids, command) = split_first(rest);
            let ids: Vec<DeviceId> = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect();
            if ids.is_empty() {
                return Err("usage: batch <id,id,...> <command...>".to_string());
            }
            StdinCommand::Batch {
                ids,
                command: required(command, "batch <id,id,...> <command...>")?,
            }
        }
        "mirror" => StdinCommand::Mirror {
            id: required(rest, "mirror <id>")?,
        },
        "unmirror" => StdinCommand::Unmirror {
            id: required(rest, "unmirror <id>")?,
        },
        "stop" => StdinCommand::Stop {
            id: required(rest, "stop <id>")?,
        },
        "tap" => {
            let (id, n) = numbers(rest, 2, 2, "tap <id> <x> <y>")?;
            StdinCommand::Input {
                id,
                action: InputAction::Tap { x: n[0], y: n[1] },
            }
        }
        "swipe" => {
            let (id, n) = numbers(rest, 4, 5, "swipe <id> <x1> <y1> <x2> <y2> [ms]")?;
            StdinCommand::Input {
                id,
                action: InputAction::Swipe {
                    x1: n[0],
                    y1: n[1],
                    x2: n[2],
                    y2: n[3],
                    duration_ms: n.get(4).copied(),
                },
            }
        }
        "text" => {
            let (id, text) = split_first(rest);
            StdinCommand::Input {
                id: required(id, "text <id> <text...>")?,
                action: InputAction::Text {
                    text: required(text, "text <id> <text...>")?,
                },
            }
        }
        "key" => {
            let (id, code) = split_first(rest);
            StdinCommand::Input {
                id: required(id, "key <id> <code>")?,
                action: InputAction::Key {
                    code: required(code, "key <id> <code>")?,
                },
            }
        }
        "back" => StdinCommand::Input {
            id: required(rest, "back <id>")?,
            action: InputAction::Back,
        },
        "home" => StdinCommand::Input {
            id: required(rest, "home <id>")?,
            action: InputAction::Home,
        },
        "ls" => {
            let (id, path) = split_first(rest);
            StdinCommand::Ls {
                id: required(id, "ls <id> [path]")?,
                path: (!path.is_empty()).then(|| path.to_string()),
            }
        }
        "pull" => {
            let (id, remote) = split_first(rest);
            StdinCommand::Pull {
                id: required(id, "pull <id> <remote>")?,
                remote: required(remote, "pull <id> <remote>")?,
            }
        }
        "push" => {
            let (id, rest) = split_first(rest);
            let (local, remote) = split_first(rest);
            StdinCommand::Push {
                id: required(id, "push <id> <local> <remote>")?,
                local: PathBuf::from(required(local, "push <id> <local> <remote>")?),
                remote: required(remote, "push <id> <local> <remote>")?,
            }
        }
        other => return Err(format!("unknown command: {}", other)),
    };

    Ok(Some(command))
}

fn split_first(text: &str) -> (&str, &str) {
    let text = text.trim();
    match text.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim()),
        None => (text, ""),
    }
}

fn required(value: &str, usage: &str) -> std::result::Result<String, String> {
    if value.is_empty() {
        Err(format!("usage: {}", usage))
    } else {
        Ok(value.to_string())
    }
}

/// `<id> n1 n2 ...` with between `min` and `max` numbers
fn numbers(
    rest: &str,
    min: usize,
    max: usize,
    usage: &str,
) -> std::result::Result<(String, Vec<u32>), String> {
    let mut parts = rest.split_whitespace();
    let id = required(parts.next().unwrap_or_default(), usage)?;
    let values = parts
        .map(|p| p.parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| format!("usage: {}", usage))?;
    if values.len() < min || values.len() > max {
        return Err(format!("usage: {}", usage));
    }
    Ok((id, values))
}

/// Run a parsed command. Returns `false` when the service should exit.
pub async fn dispatch<A>(fleet: &Fleet<A>, observer: ObserverId, command: StdinCommand) -> bool
where
    A: DeviceAdapter + Sync + 'static,
{
    match command {
        StdinCommand::Quit => return false,
        StdinCommand::List => HeadlessEvent::device_snapshot(fleet.devices().await).emit(),
        StdinCommand::Sessions => HeadlessEvent::sessions(fleet.mirror_sessions().await).emit(),
        StdinCommand::Poll => {
            if let Err(e) = fleet.poll_devices().await {
                report(e);
            }
        }
        StdinCommand::Connect { id, transport } => {
            // State changes arrive through the observer
            if let Err(e) = fleet.connect(&id, Some(transport)).await {
                report(e);
            }
        }
        StdinCommand::Disconnect { id } => {
            if let Err(e) = fleet.disconnect(&id).await {
                report(e);
            }
        }
        StdinCommand::Exec { id, command } => {
            let result = fleet.execute(&id, &command).await;
            HeadlessEvent::command_result(&id, &command, result).emit();
        }
        StdinCommand::Batch { ids, command } => {
            let outcomes = fleet.execute_batch(&ids, &command).await;
            HeadlessEvent::batch_result(&command, outcomes).emit();
        }
        StdinCommand::Mirror { id } => {
            if let Err(e) = fleet.start_mirror(&id, observer).await {
                report(e);
            }
        }
        StdinCommand::Unmirror { id } => {
            if let Err(e) = fleet.unsubscribe(&id, observer).await {
                report(e);
            }
        }
        StdinCommand::Stop { id } => {
            if let Err(e) = fleet.stop_mirror(&id).await {
                report(e);
            }
        }
        StdinCommand::Input { id, action } => match fleet.inject_input(&id, &action).await {
            Ok(result) => {
                let label = action.to_shell().unwrap_or_default();
                HeadlessEvent::command_result(&id, &label, result).emit();
            }
            Err(e) => report(e),
        },
        StdinCommand::Ls { id, path } => match fleet.list_files(&id, path.as_deref()).await {
            Ok(entries) => {
                let path = path.as_deref().unwrap_or(DEFAULT_REMOTE_DIR);
                HeadlessEvent::files(&id, path, entries).emit();
            }
            Err(e) => report(e),
        },
        StdinCommand::Pull { id, remote } => match fleet.pull_file(&id, &remote).await {
            Ok(local) => {
                HeadlessEvent::file_transferred(&id, TransferDirection::Pull, &local, &remote)
                    .emit()
            }
            Err(e) => report(e),
        },
        StdinCommand::Push { id, local, remote } => {
            match fleet.push_file(&id, &local, &remote).await {
                Ok(remote) => {
                    HeadlessEvent::file_transferred(&id, TransferDirection::Push, &local, &remote)
                        .emit()
                }
                Err(e) => report(e),
            }
        }
    }
    true
}

fn report(e: Error) {
    if e.is_validation() {
        info!("Command refused: {}", e);
    } else {
        warn!("Command failed: {}", e);
    }
    HeadlessEvent::error(e.to_string(), e.is_fatal()).emit();
}

/// Run in headless mode with the `adb` adapter
pub async fn run_headless(base_path: &Path, frames: bool) -> Result<()> {
    info!("═══════════════════════════════════════════════════════");
    info!("fleetd starting in HEADLESS mode");
    info!("Working directory: {}", base_path.display());
    info!("═══════════════════════════════════════════════════════");

    let settings = load_settings(base_path);

    let availability = ToolAvailability::check(&settings.adb.path).await;
    if let Some(message) = availability.unavailability_message() {
        error!("{}", message);
        HeadlessEvent::error(message, true).emit();
        return Err(Error::ToolNotFound {
            tool: settings.adb.path.clone(),
        });
    }

    let adb_program = availability
        .adb_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| settings.adb.path.clone());
    let adapter = Arc::new(AdbAdapter::new(adb_program, settings.adb.connect_timeout()));

    let fleet = Fleet::new(adapter, settings);

    let (line_tx, line_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        spawn_stdin_reader_blocking(line_tx);
    });

    fleet.start_monitor();
    HeadlessEvent::ready(availability.adb_version).emit();

    let result = serve(&fleet, line_rx, frames).await;

    fleet.shutdown().await;
    info!("fleetd headless mode exiting");
    result
}

/// Attach the headless observer and process commands until `quit` or EOF
pub async fn serve<A>(fleet: &Fleet<A>, mut lines: mpsc::Receiver<String>, frames: bool) -> Result<()>
where
    A: DeviceAdapter + Sync + 'static,
{
    let interests = if frames {
        Interests::all()
    } else {
        Interests::without_frames()
    };
    let mut observer = fleet.attach(interests);
    let observer_id = observer.id;

    let printer = tokio::spawn(async move {
        while let Some(event) = observer.events.recv().await {
            HeadlessEvent::from(event).emit();
        }
    });

    while let Some(line) = lines.recv().await {
        match parse_command(&line) {
            Ok(Some(command)) => {
                if !dispatch(fleet, observer_id, command).await {
                    info!("Quit requested");
                    break;
                }
            }
            Ok(None) => {}
            Err(message) => {
                warn!("Bad stdin command {:?}: {}", line, message);
                HeadlessEvent::error(message, false).emit();
            }
        }
    }

    fleet.detach(observer_id).await;
    printer.abort();
    Ok(())
}

/// Forward stdin lines to the command loop (blocking; runs on its own thread)
fn spawn_stdin_reader_blocking(line_tx: mpsc::Sender<String>) {
    use std::io::BufRead;

    let stdin = std::io::stdin();
    let reader = stdin.lock();

    for line in reader.lines() {
        match line {
            Ok(line) => {
                if line_tx.blocking_send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        }
    }

    info!("Stdin reader exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> StdinCommand {
        parse_command(line).unwrap().unwrap()
    }

    #[test]
    fn test_parse_connect() {
        assert_eq!(
            parse("connect R58M123ABC"),
            StdinCommand::Connect {
                id: "R58M123ABC".into(),
                transport: Transport::Usb
            }
        );
        assert_eq!(
            parse("connect tv 192.168.1.20:5555"),
            StdinCommand::Connect {
                id: "tv".into(),
                transport: Transport::Network {
                    address: "192.168.1.20:5555".into()
                }
            }
        );
    }

    #[test]
    fn test_parse_exec_keeps_command_text() {
        assert_eq!(
            parse("exec d1 shell getprop ro.product.model"),
            StdinCommand::Exec {
                id: "d1".into(),
                command: "shell getprop ro.product.model".into()
            }
        );
    }

    #[test]
    fn test_parse_batch() {
        assert!(parse_command("batch , shell uptime").is_err());
        assert_eq!(
            parse("batch d1,d2 shell uptime"),
            StdinCommand::Batch {
                ids: vec!["d1".into(), "d2".into()],
                command: "shell uptime".into()
            }
        );
    }

    #[test]
    fn test_parse_input() {
        assert_eq!(
            parse("tap d1 100 200"),
            StdinCommand::Input {
                id: "d1".into(),
                action: InputAction::Tap { x: 100, y: 200 }
            }
        );
        assert_eq!(
            parse("swipe d1 1 2 3 4 300"),
            StdinCommand::Input {
                id: "d1".into(),
                action: InputAction::Swipe {
                    x1: 1,
                    y1: 2,
                    x2: 3,
                    y2: 4,
                    duration_ms: Some(300)
                }
            }
        );
        assert_eq!(
            parse("text d1 hello world"),
            StdinCommand::Input {
                id: "d1".into(),
                action: InputAction::Text {
                    text: "hello world".into()
                }
            }
        );
    }

    #[test]
    fn test_parse_files() {
        assert_eq!(
            parse("ls d1"),
            StdinCommand::Ls {
                id: "d1".into(),
                path: None
            }
        );
        assert_eq!(
            parse("push d1 ./notes.txt /sdcard/"),
            StdinCommand::Push {
                id: "d1".into(),
                local: PathBuf::from("./notes.txt"),
                remote: "/sdcard/".into()
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_command("   "), Ok(None));
        assert!(parse_command("tap d1 x y").is_err());
        assert!(parse_command("tap d1 1").is_err());
        assert!(parse_command("exec d1").is_err());
        assert!(parse_command("frobnicate").is_err());
        assert_eq!(parse("q"), StdinCommand::Quit);
    }

    #[tokio::test]
    async fn test_dispatch_runs_against_fleet() {
        use fleet_adapter::test_utils::{test_device_info, Calls, FakeAdapter};
        use fleet_app::Settings;

        let fake = FakeAdapter::new()
            .with_device(test_device_info("d1", "Pixel 7"))
            .into_arc();
        let fleet = Fleet::new(fake.clone(), Settings::default());
        let observer = fleet.attach(Interests::without_frames());

        assert!(dispatch(&fleet, observer.id, parse("connect d1")).await);
        assert!(fleet.device("d1").await.is_some_and(|d| d.status.is_online()));

        assert!(dispatch(&fleet, observer.id, parse("exec d1 rm -rf /")).await);
        assert!(dispatch(&fleet, observer.id, parse("exec d1 shell uptime")).await);
        assert_eq!(Calls::get(&fake.calls.exec), 1);

        assert!(!dispatch(&fleet, observer.id, StdinCommand::Quit).await);
        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn test_serve_stops_on_quit() {
        use fleet_adapter::test_utils::FakeAdapter;
        use fleet_app::Settings;

        let fleet = Fleet::new(FakeAdapter::new().into_arc(), Settings::default());
        let (line_tx, line_rx) = mpsc::channel(8);
        line_tx.send("list".to_string()).await.unwrap();
        line_tx.send("bogus".to_string()).await.unwrap();
        line_tx.send("quit".to_string()).await.unwrap();

        // The sender stays open; only `quit` ends the loop
        tokio::time::timeout(std::time::Duration::from_secs(2), serve(&fleet, line_rx, false))
            .await
            .expect("serve returns on quit")
            .unwrap();
        assert!(fleet.hub().observers().await.is_empty());
        drop(line_tx);
        fleet.shutdown().await;
    }
}
