use serde::{Deserialize, Serialize};

/// Raw `{{json .}}` row printed by the engine's stats command.
#[derive(Debug, Deserialize)]
struct RawStats {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "PIDs", default)]
    pids: String,
}

/// Point-in-time resource usage of one container.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub name: String,
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub pids: u64,
}

/// Parse one stats row. `None` when the row is not valid JSON.
pub fn parse_stats(line: &str) -> Option<ContainerStats> {
    let raw: RawStats = serde_json::from_str(line.trim()).ok()?;
    let (used, limit) = raw.mem_usage.split_once('/').unwrap_or((&raw.mem_usage, ""));
    Some(ContainerStats {
        name: raw.name,
        cpu_percent: raw.cpu_perc.trim().trim_end_matches('%').parse().unwrap_or(0.0),
        memory_used_bytes: parse_size(used).unwrap_or(0),
        memory_limit_bytes: parse_size(limit).unwrap_or(0),
        pids: raw.pids.trim().parse().unwrap_or(0),
    })
}

/// `10.5MiB`, `1GiB`, `512kB`, `0B` to bytes. Unit prefixes are powers of 1024.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let power = match unit.trim().to_ascii_lowercase().chars().next() {
        None | Some('b') => 0,
        Some('k') => 1,
        Some('m') => 2,
        Some('g') => 3,
        Some('t') => 4,
        Some(_) => return None,
    };
    let bytes = value * 1024f64.powi(power);
    Some(bytes.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_use_binary_units() {
        assert_eq!(parse_size("0B"), Some(0));
        assert_eq!(parse_size("1KiB"), Some(1024));
        assert_eq!(parse_size("1.5MiB"), Some(1_572_864));
        assert_eq!(parse_size(" 1GiB "), Some(1_073_741_824));
        assert_eq!(parse_size("12kB"), Some(12_288));
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn parses_stats_row() {
        let line = r#"{"BlockIO":"0B / 0B","CPUPerc":"1.25%","Container":"abc","ID":"abc","MemPerc":"1.00%","MemUsage":"10MiB / 1GiB","Name":"web","NetIO":"1kB / 0B","PIDs":"7"}"#;
        let stats = parse_stats(line).unwrap();
        assert_eq!(stats.name, "web");
        assert!((stats.cpu_percent - 1.25).abs() < f64::EPSILON);
        assert_eq!(stats.memory_used_bytes, 10 * 1024 * 1024);
        assert_eq!(stats.memory_limit_bytes, 1024 * 1024 * 1024);
        assert_eq!(stats.pids, 7);
    }

    #[test]
    fn garbage_row_is_none() {
        assert!(parse_stats("Error response from daemon").is_none());
    }
}
