//! Conversion helpers shared by the runtime adapters.

use std::collections::HashMap;

use bollard::models::{
    ContainerNetworkStats, ContainerStatsResponse, PortBinding, PortMap, RestartPolicy,
    RestartPolicyNameEnum,
};

pub(crate) type ExposedPorts = HashMap<String, HashMap<(), ()>>;

pub(crate) fn format_env(env: &HashMap<String, String>) -> Option<Vec<String>> {
    if env.is_empty() {
        return None;
    }
    let mut entries: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    entries.sort();
    Some(entries)
}

/// Builds Docker port maps from `"hostPort:containerPort"` entries. Entries
/// without a colon are skipped. Container ports are bound as tcp.
pub(crate) fn build_ports(ports: &[String]) -> (Option<PortMap>, Option<ExposedPorts>) {
    let mut port_bindings: PortMap = HashMap::new();
    let mut exposed_ports: ExposedPorts = HashMap::new();

    for mapping in ports {
        let Some((host_port, container_port)) = mapping.split_once(':') else {
            continue;
        };
        let key = format!("{container_port}/tcp");
        exposed_ports.entry(key.clone()).or_default();

        let entry = port_bindings.entry(key).or_insert_with(|| Some(Vec::new()));
        if let Some(bindings) = entry.as_mut() {
            bindings.push(PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            });
        }
    }

    if port_bindings.is_empty() {
        (None, None)
    } else {
        (Some(port_bindings), Some(exposed_ports))
    }
}

/// Maps a restart policy name to the Docker enum; unset or unknown values
/// fall back to `unless-stopped`.
pub(crate) fn restart_policy(policy: Option<&str>) -> RestartPolicy {
    let name = match policy.unwrap_or("unless-stopped") {
        "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::UNLESS_STOPPED,
    };
    RestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    }
}

pub(crate) fn calculate_cpu_percent(stats: &ContainerStatsResponse) -> Option<f64> {
    let cpu = stats.cpu_stats.as_ref()?;
    let pre = stats.precpu_stats.as_ref()?;

    let cpu_total = cpu.cpu_usage.as_ref()?.total_usage?;
    let pre_total = pre.cpu_usage.as_ref()?.total_usage?;
    let cpu_delta = cpu_total.saturating_sub(pre_total);

    let system_delta = cpu
        .system_cpu_usage
        .unwrap_or_default()
        .saturating_sub(pre.system_cpu_usage.unwrap_or_default());

    if cpu_delta == 0 || system_delta == 0 {
        return None;
    }

    let cpu_count = cpu
        .online_cpus
        .or_else(|| {
            cpu.cpu_usage
                .as_ref()?
                .percpu_usage
                .as_ref()
                .map(|v| v.len() as u32)
        })
        .unwrap_or(1);

    Some((cpu_delta as f64 / system_delta as f64) * cpu_count as f64 * 100.0)
}

pub(crate) fn network_bytes(
    stats: &ContainerStatsResponse,
    selector: impl Fn(&ContainerNetworkStats) -> Option<u64>,
) -> u64 {
    stats
        .networks
        .as_ref()
        .map(|map| map.values().filter_map(&selector).sum())
        .unwrap_or_default()
}

/// Parses `"12.5%"` from `docker stats` output.
pub(crate) fn parse_percent(value: &str) -> f64 {
    value
        .trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .unwrap_or_default()
}

/// Parses a byte quantity with a docker-style unit suffix, e.g. `"7.27MiB"`.
pub(crate) fn parse_bytes(value: &str) -> u64 {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number: f64 = match number.parse() {
        Ok(n) => n,
        Err(_) => return 0,
    };

    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return 0,
    };

    (number * multiplier) as u64
}

/// Parses a `"rx / tx"` byte pair from `docker stats` output.
pub(crate) fn parse_io_pair(value: &str) -> (u64, u64) {
    match value.split_once('/') {
        Some((rx, tx)) => (parse_bytes(rx), parse_bytes(tx)),
        None => (parse_bytes(value), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerCpuStats, ContainerCpuUsage};

    #[test]
    fn format_env_is_sorted_and_none_when_empty() {
        assert_eq!(format_env(&HashMap::new()), None);

        let mut env = HashMap::new();
        env.insert("ZED".to_string(), "1".to_string());
        env.insert("API_KEY".to_string(), "secret".to_string());
        assert_eq!(
            format_env(&env),
            Some(vec!["API_KEY=secret".to_string(), "ZED=1".to_string()])
        );
    }

    #[test]
    fn build_ports_maps_host_to_container() {
        let ports = vec!["8080:80".to_string(), "5432:5432".to_string()];
        let (bindings, exposed) = build_ports(&ports);

        let bindings = bindings.expect("bindings");
        let exposed = exposed.expect("exposed");
        assert!(bindings.contains_key("80/tcp"));
        assert!(bindings.contains_key("5432/tcp"));
        assert!(exposed.contains_key("80/tcp"));

        let binding = bindings["80/tcp"].as_ref().expect("some")[0].clone();
        assert_eq!(binding.host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn build_ports_skips_malformed_entries() {
        let ports = vec!["oops".to_string()];
        let (bindings, exposed) = build_ports(&ports);
        assert!(bindings.is_none());
        assert!(exposed.is_none());
    }

    #[test]
    fn restart_policy_maps_names_with_fallback() {
        assert_eq!(
            restart_policy(Some("always")).name,
            Some(RestartPolicyNameEnum::ALWAYS)
        );
        assert_eq!(
            restart_policy(Some("no")).name,
            Some(RestartPolicyNameEnum::NO)
        );
        assert_eq!(
            restart_policy(Some("on-failure")).name,
            Some(RestartPolicyNameEnum::ON_FAILURE)
        );
        assert_eq!(
            restart_policy(None).name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
        assert_eq!(
            restart_policy(Some("whatever")).name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
    }

    #[test]
    fn cpu_percent_uses_online_cpus() {
        let stats = ContainerStatsResponse {
            cpu_stats: Some(ContainerCpuStats {
                cpu_usage: Some(ContainerCpuUsage {
                    total_usage: Some(2000),
                    ..Default::default()
                }),
                system_cpu_usage: Some(10_000),
                online_cpus: Some(2),
                ..Default::default()
            }),
            precpu_stats: Some(ContainerCpuStats {
                cpu_usage: Some(ContainerCpuUsage {
                    total_usage: Some(1000),
                    ..Default::default()
                }),
                system_cpu_usage: Some(9_000),
                ..Default::default()
            }),
            ..Default::default()
        };

        let percent = calculate_cpu_percent(&stats).expect("cpu percent");
        assert!((percent - 200.0).abs() < 0.0001);

        assert_eq!(calculate_cpu_percent(&ContainerStatsResponse::default()), None);
    }

    #[test]
    fn network_bytes_sums_interfaces() {
        let mut networks = HashMap::new();
        networks.insert(
            "eth0".to_string(),
            ContainerNetworkStats {
                rx_bytes: Some(100),
                tx_bytes: Some(200),
                ..Default::default()
            },
        );
        networks.insert(
            "eth1".to_string(),
            ContainerNetworkStats {
                rx_bytes: Some(50),
                tx_bytes: None,
                ..Default::default()
            },
        );
        let stats = ContainerStatsResponse {
            networks: Some(networks),
            ..Default::default()
        };

        assert_eq!(network_bytes(&stats, |net| net.rx_bytes), 150);
        assert_eq!(network_bytes(&stats, |net| net.tx_bytes), 200);
    }

    #[test]
    fn parse_percent_strips_suffix() {
        assert_eq!(parse_percent("12.5%"), 12.5);
        assert_eq!(parse_percent(" 0.07% "), 0.07);
        assert_eq!(parse_percent("bogus"), 0.0);
    }

    #[test]
    fn parse_bytes_handles_docker_units() {
        assert_eq!(parse_bytes("648B"), 648);
        assert_eq!(parse_bytes("1.2kB"), 1200);
        assert_eq!(parse_bytes("7MiB"), 7 * 1024 * 1024);
        assert_eq!(parse_bytes("2GiB"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_bytes("1.5GB"), 1_500_000_000);
        assert_eq!(parse_bytes("garbage"), 0);
        assert_eq!(parse_bytes("12XB"), 0);
    }

    #[test]
    fn parse_io_pair_splits_rx_tx() {
        assert_eq!(parse_io_pair("1.2kB / 648B"), (1200, 648));
        assert_eq!(parse_io_pair("10B"), (10, 0));
    }
}
