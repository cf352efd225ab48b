//! Host information commands: hostname, clock, timezone, OS and CPUs.

use std::collections::HashMap;
use std::io;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::to_return;
use crate::error::HandlerError;
use crate::registry::CommandDescriptor;

const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";
const OS_RELEASE_PATHS: &[&str] = &["/etc/os-release", "/usr/lib/os-release"];

pub fn descriptors() -> Vec<CommandDescriptor> {
    vec![
        CommandDescriptor::new("guest-get-host-name", get_host_name),
        // Older clients use the unhyphenated spelling.
        CommandDescriptor::new("guest-get-hostname", get_host_name),
        CommandDescriptor::new("guest-get-time", get_time),
        CommandDescriptor::new("guest-get-timezone", get_timezone),
        CommandDescriptor::new("guest-get-osinfo", get_osinfo),
        CommandDescriptor::new("guest-get-vcpus", get_vcpus),
    ]
}

/// Run a program and return its trimmed stdout.
fn command_output(program: &str, args: &[&str]) -> io::Result<String> {
    let output = Command::new(program).args(args).output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "{program} exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn get_host_name(_: Option<&RawValue>) -> Result<Value, HandlerError> {
    let name = match std::fs::read_to_string(HOSTNAME_PATH) {
        Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => command_output("hostname", &[])
            .map_err(|e| HandlerError::io("failed to read hostname", e))?,
    };
    debug!(hostname = %name, "Read hostname");
    Ok(json!({ "host-name": name }))
}

/// Nanoseconds since the Unix epoch.
fn get_time(_: Option<&RawValue>) -> Result<Value, HandlerError> {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| HandlerError::failed(format!("system clock is before the Unix epoch: {e}")))?;
    let nanos = i64::try_from(since_epoch.as_nanos())
        .map_err(|_| HandlerError::failed("system time does not fit in 64 bits"))?;
    Ok(json!(nanos))
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct Timezone {
    zone: String,
    /// Seconds east of UTC.
    offset: i32,
}

fn get_timezone(_: Option<&RawValue>) -> Result<Value, HandlerError> {
    let output =
        command_output("date", &["+%Z %z"]).map_err(|e| HandlerError::io("failed to run date", e))?;
    let timezone = parse_timezone(&output)
        .ok_or_else(|| HandlerError::failed(format!("unexpected date output: {output:?}")))?;
    to_return(&timezone)
}

/// Parse `"<zone> <±hhmm>"` as printed by `date +'%Z %z'`.
fn parse_timezone(text: &str) -> Option<Timezone> {
    let (zone, offset) = text.trim().rsplit_once(char::is_whitespace)?;
    Some(Timezone {
        zone: zone.trim().to_string(),
        offset: parse_utc_offset(offset)?,
    })
}

fn parse_utc_offset(text: &str) -> Option<i32> {
    let (sign, digits) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    Some(sign * (hours * 3600 + minutes * 60))
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
struct OsInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    kernel_release: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kernel_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    machine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pretty_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    variant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    variant_id: Option<String>,
}

impl OsInfo {
    fn from_os_release(fields: &HashMap<String, String>) -> Self {
        let get = |key: &str| fields.get(key).cloned();
        Self {
            id: get("ID"),
            name: get("NAME"),
            pretty_name: get("PRETTY_NAME"),
            version: get("VERSION"),
            version_id: get("VERSION_ID"),
            variant: get("VARIANT"),
            variant_id: get("VARIANT_ID"),
            ..Self::default()
        }
    }
}

fn get_osinfo(_: Option<&RawValue>) -> Result<Value, HandlerError> {
    let release = OS_RELEASE_PATHS
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|text| parse_os_release(&text))
        .unwrap_or_default();

    let mut info = OsInfo::from_os_release(&release);
    info.kernel_release = command_output("uname", &["-r"]).ok();
    info.kernel_version = command_output("uname", &["-v"]).ok();
    info.machine = command_output("uname", &["-m"]).ok();

    info!(
        id = info.id.as_deref().unwrap_or("unknown"),
        kernel = info.kernel_release.as_deref().unwrap_or("unknown"),
        "Collected OS information"
    );
    to_return(&info)
}

/// Parse `KEY=value` lines of an os-release file. Quotes around values are
/// removed; comments and malformed lines are skipped.
fn parse_os_release(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), unquote(value.trim()).to_string()))
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

fn get_vcpus(_: Option<&RawValue>) -> Result<Value, HandlerError> {
    let count = std::thread::available_parallelism()
        .map_err(|e| HandlerError::io("failed to count CPUs", e))?
        .get();
    let vcpus: Vec<Value> = (0..count)
        .map(|id| json!({ "logical-id": id, "online": true, "can-offline": false }))
        .collect();
    Ok(Value::Array(vcpus))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_is_positive_and_advances() {
        let first = get_time(None).unwrap().as_i64().unwrap();
        let second = get_time(None).unwrap().as_i64().unwrap();
        assert!(first > 0);
        assert!(second >= first);
    }

    #[test]
    fn parses_utc_offsets() {
        assert_eq!(parse_utc_offset("+0000"), Some(0));
        assert_eq!(parse_utc_offset("+0530"), Some(19_800));
        assert_eq!(parse_utc_offset("-0800"), Some(-28_800));
        assert_eq!(parse_utc_offset("0800"), None);
        assert_eq!(parse_utc_offset("+08"), None);
        assert_eq!(parse_utc_offset(""), None);
    }

    #[test]
    fn parses_date_timezone_output() {
        assert_eq!(
            parse_timezone("CEST +0200\n"),
            Some(Timezone {
                zone: "CEST".into(),
                offset: 7200
            })
        );
        assert!(parse_timezone("garbage").is_none());
    }

    #[test]
    fn parses_os_release() {
        let text = r#"
# comment
NAME="Ubuntu"
VERSION_ID='22.04'
ID=ubuntu
PRETTY_NAME="Ubuntu 22.04.4 LTS"
not a pair
"#;
        let fields = parse_os_release(text);
        assert_eq!(fields["NAME"], "Ubuntu");
        assert_eq!(fields["VERSION_ID"], "22.04");
        assert_eq!(fields["ID"], "ubuntu");
        assert_eq!(fields.len(), 4);

        let info = OsInfo::from_os_release(&fields);
        let value = to_return(&info).unwrap();
        assert_eq!(value["pretty-name"], "Ubuntu 22.04.4 LTS");
        assert_eq!(value["version-id"], "22.04");
        assert!(value.get("variant").is_none());
    }

    #[test]
    fn osinfo_is_an_object() {
        assert!(get_osinfo(None).unwrap().is_object());
    }

    #[test]
    fn vcpus_are_numbered_from_zero() {
        let vcpus = get_vcpus(None).unwrap();
        let vcpus = vcpus.as_array().unwrap();
        assert!(!vcpus.is_empty());
        for (i, cpu) in vcpus.iter().enumerate() {
            assert_eq!(cpu["logical-id"], i);
            assert_eq!(cpu["online"], true);
        }
    }

    #[test]
    fn hostname_is_reported() {
        let value = get_host_name(None).unwrap();
        assert!(!value["host-name"].as_str().unwrap().is_empty());
    }
}
