//! Parsers for adb device listings and property queries

use std::sync::LazyLock;

use regex::Regex;

use fleet_core::types::{AdapterState, DeviceInfo, DeviceMetadata};

use crate::adapter::RemoteEntry;

/// `key:value` attributes printed by `adb devices -l`
static ATTRIBUTE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\w+):(\S+)").expect("Invalid device attribute regex")
});

/// `[ro.product.model]: [Pixel 7]`
static GETPROP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[([^\]]+)\]:\s*\[(.*)\]\s*$").expect("Invalid getprop line regex")
});

/// `Physical size: 1080x2400` / `Override size: 720x1600`
static WM_SIZE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(Physical|Override) size:\s*(\d+x\d+)").expect("Invalid wm size regex")
});

static BATTERY_LEVEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*level:\s*(\d+)\s*$").expect("Invalid battery level regex")
});

/// `mSignalStrength=SignalStrength: ... level=3` style lines from `dumpsys telephony.registry`
static SIGNAL_LEVEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\blevel=(\d+)").expect("Invalid signal level regex")
});

/// Parse the output of `adb devices -l`.
///
/// Header lines, daemon chatter (`* daemon started successfully`) and blank
/// lines are skipped.
pub fn parse_device_list(output: &str) -> Vec<DeviceInfo> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(parse_device_line)
        .collect()
}

fn parse_device_line(line: &str) -> Option<DeviceInfo> {
    let mut parts = line.split_whitespace();
    let serial = parts.next()?.to_string();
    let state = AdapterState::from_adb(parts.next()?);

    let mut metadata = DeviceMetadata::default();
    for caps in ATTRIBUTE_REGEX.captures_iter(line) {
        let value = caps[2].replace('_', " ");
        match &caps[1] {
            "model" => metadata.model = Some(value),
            "device" => metadata.name = Some(value),
            _ => {}
        }
    }

    Some(DeviceInfo {
        serial,
        state,
        metadata,
    })
}

/// Fill metadata from `adb shell getprop` output
pub fn apply_getprop(output: &str, metadata: &mut DeviceMetadata) {
    for line in output.lines() {
        let Some(caps) = GETPROP_REGEX.captures(line.trim()) else {
            continue;
        };
        let value = caps[2].trim();
        if value.is_empty() {
            continue;
        }
        match &caps[1] {
            "ro.product.model" => metadata.model = Some(value.to_string()),
            "ro.build.version.release" => metadata.os_version = Some(value.to_string()),
            "ro.product.marketname" | "ro.product.device" if metadata.name.is_none() => {
                metadata.name = Some(value.to_string())
            }
            _ => {}
        }
    }
}

/// Screen resolution from `wm size`; an override wins over the physical size
pub fn parse_wm_size(output: &str) -> Option<String> {
    let mut physical = None;
    for caps in WM_SIZE_REGEX.captures_iter(output) {
        match &caps[1] {
            "Override" => return Some(caps[2].to_string()),
            _ => physical = Some(caps[2].to_string()),
        }
    }
    physical
}

/// Battery level from `dumpsys battery`
pub fn parse_battery_level(output: &str) -> Option<u32> {
    BATTERY_LEVEL_REGEX
        .captures(output)
        .and_then(|caps| caps[1].parse().ok())
}

/// Signal level (0-5) from `dumpsys telephony.registry`
pub fn parse_signal_level(output: &str) -> Option<u32> {
    SIGNAL_LEVEL_REGEX
        .captures(output)
        .and_then(|caps| caps[1].parse().ok())
}

/// Parse `ls -l` output into directory entries.
///
/// Works with both toybox (`-rw-rw---- 1 root sdcard_rw 1234 2024-01-01 10:00 name`)
/// and older busybox-style listings. `total N` lines and `.`/`..` are skipped.
pub fn parse_ls_output(output: &str) -> Vec<RemoteEntry> {
    output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with("total "))
        .filter_map(parse_ls_line)
        .filter(|entry| entry.name != "." && entry.name != "..")
        .collect()
}

fn parse_ls_line(line: &str) -> Option<RemoteEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let permissions = *fields.first()?;
    let kind = permissions.chars().next()?;
    if !matches!(kind, '-' | 'd' | 'l' | 'c' | 'b' | 'p' | 's') {
        return None;
    }

    // Date/time are the two fields before the name: find the first HH:MM field.
    let time_idx = fields.iter().position(|f| is_clock(f))?;
    if time_idx + 1 >= fields.len() || time_idx < 2 {
        return None;
    }

    let mut name = fields[time_idx + 1..].join(" ");
    if kind == 'l' {
        if let Some((link, _target)) = name.split_once(" -> ") {
            name = link.to_string();
        }
    }

    let size = fields[time_idx - 2].parse::<u64>().ok();

    Some(RemoteEntry {
        name,
        is_dir: kind == 'd',
        size: if kind == 'd' { None } else { size },
        permissions: permissions.to_string(),
    })
}

fn is_clock(field: &str) -> bool {
    match field.split_once(':') {
        Some((h, m)) => {
            h.len() <= 2
                && m.len() == 2
                && h.chars().all(|c| c.is_ascii_digit())
                && m.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}
