//! Host port allocation and discovery of published ports.
//!
//! Discovery is a chain of [`PortStrategy`] implementations tried in order;
//! the first one that yields at least one mapping wins. Each strategy degrades
//! to "nothing found" on engine errors so a later tier still gets its turn.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use sandbox::{ImageBuilder, PortMapping, StackRunner};
use serde::Deserialize;
use tracing::{debug, trace};

pub const DEFAULT_PORT_MIN: u16 = 32768;
pub const DEFAULT_PORT_MAX: u16 = 60999;

/// Ephemeral ports the OS hands out before falling back to a range scan.
const EPHEMERAL_ATTEMPTS: usize = 32;

#[allow(clippy::unwrap_used)]
static ARROW_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)->(\d+)").unwrap());

#[allow(clippy::unwrap_used)]
static PORT_TABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)/\w+\s*->\s*\S*:(\d+)\s*$").unwrap());

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Inclusive range that published host ports must fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_PORT_MIN,
            max: DEFAULT_PORT_MAX,
        }
    }
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }
}

#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self { range }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// In range and currently bindable on all interfaces.
    pub fn is_free(&self, port: u16) -> bool {
        self.range.contains(port) && TcpListener::bind(("0.0.0.0", port)).is_ok()
    }

    /// A bindable port inside the range.
    ///
    /// Asks the OS for ephemeral ports first, then scans the range starting at
    /// a time-derived offset so concurrent allocators spread out.
    pub fn free_port(&self) -> std::io::Result<u16> {
        for _ in 0..EPHEMERAL_ATTEMPTS {
            let port = TcpListener::bind(("0.0.0.0", 0))?.local_addr()?.port();
            if self.range.contains(port) {
                return Ok(port);
            }
        }

        let span = u32::from(self.range.max.saturating_sub(self.range.min)) + 1;
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        for step in 0..span {
            let offset = (seed.wrapping_add(step)) % span;
            let Ok(port) = u16::try_from(u32::from(self.range.min) + offset) else {
                continue;
            };
            if TcpListener::bind(("0.0.0.0", port)).is_ok() {
                return Ok(port);
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no free port in {}-{}", self.range.min, self.range.max),
        ))
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Every `host->container` pair in a ports column such as
/// `0.0.0.0:32768->80/tcp, :::32768->80/tcp`.
pub fn parse_arrow_ports(service: &str, ports: &str) -> Vec<PortMapping> {
    let mut mappings = Vec::new();
    for caps in ARROW_RE.captures_iter(ports) {
        let host = caps.get(1).and_then(|m| m.as_str().parse().ok());
        let container = caps.get(2).and_then(|m| m.as_str().parse().ok());
        if let (Some(host), Some(container)) = (host, container) {
            mappings.push(PortMapping::new(service, host, container));
        }
    }
    dedup(mappings)
}

/// `name|ports` lines, as printed by both the stack tool and the engine.
pub fn parse_named_ports(text: &str) -> Vec<PortMapping> {
    let mut mappings = Vec::new();
    for line in text.lines() {
        let Some((name, ports)) = line.split_once('|') else {
            continue;
        };
        mappings.extend(parse_arrow_ports(name.trim(), ports));
    }
    dedup(mappings)
}

/// Per-container port table (`80/tcp -> 0.0.0.0:32768`, `80/tcp -> [::]:32768`).
pub fn parse_port_table(service: &str, text: &str) -> Vec<PortMapping> {
    let mut mappings = Vec::new();
    for line in text.lines() {
        let Some(caps) = PORT_TABLE_RE.captures(line.trim()) else {
            continue;
        };
        let container = caps.get(1).and_then(|m| m.as_str().parse().ok());
        let host = caps.get(2).and_then(|m| m.as_str().parse().ok());
        if let (Some(host), Some(container)) = (host, container) {
            mappings.push(PortMapping::new(service, host, container));
        }
    }
    dedup(mappings)
}

/// Drop repeats (IPv4 and IPv6 bindings of the same port) keeping first-seen order.
fn dedup(mappings: Vec<PortMapping>) -> Vec<PortMapping> {
    let mut seen = HashSet::new();
    mappings
        .into_iter()
        .filter(|m| seen.insert(m.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Discovery strategies
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PortStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Mappings for the project; empty when this strategy cannot tell.
    async fn collect(&self, project: &str) -> Vec<PortMapping>;
}

/// Ports column of the stack tool's own service listing.
pub struct StackServicePorts(pub Arc<dyn StackRunner>);

#[async_trait]
impl PortStrategy for StackServicePorts {
    fn name(&self) -> &'static str {
        "stack service listing"
    }

    async fn collect(&self, project: &str) -> Vec<PortMapping> {
        match self.0.service_ports(project).await {
            Ok(text) => parse_named_ports(&text),
            Err(e) => {
                trace!(project, error = %e, "service listing unavailable");
                Vec::new()
            }
        }
    }
}

/// Engine container listing filtered by the project label.
pub struct LabeledContainerPorts(pub Arc<dyn StackRunner>);

#[async_trait]
impl PortStrategy for LabeledContainerPorts {
    fn name(&self) -> &'static str {
        "labeled container listing"
    }

    async fn collect(&self, project: &str) -> Vec<PortMapping> {
        match self.0.labeled_ports(project).await {
            Ok(text) => parse_named_ports(&text),
            Err(e) => {
                trace!(project, error = %e, "labeled listing unavailable");
                Vec::new()
            }
        }
    }
}

/// Port table of each project container, named after the container.
pub struct ContainerPortTables {
    pub stacks: Arc<dyn StackRunner>,
    pub images: Arc<dyn ImageBuilder>,
}

#[async_trait]
impl PortStrategy for ContainerPortTables {
    fn name(&self) -> &'static str {
        "per-container port tables"
    }

    async fn collect(&self, project: &str) -> Vec<PortMapping> {
        let Ok(ids) = self.stacks.container_ids(project).await else {
            return Vec::new();
        };
        let mut mappings = Vec::new();
        for id in ids {
            let Ok(table) = self.images.port_table(&id).await else {
                continue;
            };
            let name = match self.images.container_name(&id).await {
                Ok(name) if !name.is_empty() => name,
                _ => id.clone(),
            };
            mappings.extend(parse_port_table(&name, &table));
        }
        dedup(mappings)
    }
}

/// The default three-tier chain for compose projects.
pub fn compose_strategies(
    stacks: &Arc<dyn StackRunner>,
    images: &Arc<dyn ImageBuilder>,
) -> Vec<Box<dyn PortStrategy>> {
    vec![
        Box::new(StackServicePorts(Arc::clone(stacks))),
        Box::new(LabeledContainerPorts(Arc::clone(stacks))),
        Box::new(ContainerPortTables {
            stacks: Arc::clone(stacks),
            images: Arc::clone(images),
        }),
    ]
}

/// Run strategies in order until one yields mappings.
///
/// Returns the mappings and the name of the strategy that produced them.
pub async fn collect_ports(
    strategies: &[Box<dyn PortStrategy>],
    project: &str,
) -> Option<(Vec<PortMapping>, &'static str)> {
    for strategy in strategies {
        let mappings = strategy.collect(project).await;
        debug!(project, strategy = strategy.name(), found = mappings.len(), "port discovery");
        if !mappings.is_empty() {
            return Some((mappings, strategy.name()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrow_ports_dedup_ipv4_and_ipv6() {
        let mappings = parse_arrow_ports("web", "0.0.0.0:32768->80/tcp, :::32768->80/tcp");
        assert_eq!(mappings, vec![PortMapping::new("web", 32768, 80)]);
    }

    #[test]
    fn named_ports_skip_lines_without_ports() {
        let text = "app-web-1|0.0.0.0:40001->8080/tcp\napp-worker-1|\nnot a row\n";
        let mappings = parse_named_ports(text);
        assert_eq!(mappings, vec![PortMapping::new("app-web-1", 40001, 8080)]);
    }

    #[test]
    fn named_ports_with_multiple_publishers() {
        let text = "db|0.0.0.0:40002->5432/tcp, 0.0.0.0:40003->5433/tcp";
        let mappings = parse_named_ports(text);
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[1], PortMapping::new("db", 40003, 5433));
    }

    #[test]
    fn port_table_handles_both_families() {
        let text = "80/tcp -> 0.0.0.0:32770\n80/tcp -> [::]:32770\n443/tcp -> 0.0.0.0:32771\n";
        let mappings = parse_port_table("abc123", text);
        assert_eq!(
            mappings,
            vec![
                PortMapping::new("abc123", 32770, 80),
                PortMapping::new("abc123", 32771, 443),
            ]
        );
    }

    #[test]
    fn port_table_ignores_noise() {
        assert!(parse_port_table("x", "Error: No such container: x").is_empty());
    }

    #[test]
    fn out_of_range_port_is_not_free() {
        let allocator = PortAllocator::new(PortRange { min: 40000, max: 40100 });
        assert!(!allocator.is_free(5432));
    }

    #[test]
    fn bound_port_is_not_free() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let allocator = PortAllocator::new(PortRange { min: port, max: port });
        assert!(!allocator.is_free(port));
    }

    #[test]
    fn free_port_stays_in_range() {
        let range = PortRange { min: 41000, max: 41200 };
        let port = PortAllocator::new(range).free_port().unwrap();
        assert!(range.contains(port));
    }

    struct Fixed(&'static str, Vec<PortMapping>);

    #[async_trait]
    impl PortStrategy for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }
        async fn collect(&self, _project: &str) -> Vec<PortMapping> {
            self.1.clone()
        }
    }

    #[tokio::test]
    async fn first_non_empty_strategy_wins() {
        let chain: Vec<Box<dyn PortStrategy>> = vec![
            Box::new(Fixed("empty", Vec::new())),
            Box::new(Fixed("second", vec![PortMapping::new("web", 40000, 80)])),
            Box::new(Fixed("third", vec![PortMapping::new("web", 40001, 80)])),
        ];
        let (mappings, name) = collect_ports(&chain, "p").await.unwrap();
        assert_eq!(name, "second");
        assert_eq!(mappings[0].host_port, 40000);
    }

    #[tokio::test]
    async fn exhausted_chain_yields_none() {
        let chain: Vec<Box<dyn PortStrategy>> = vec![Box::new(Fixed("empty", Vec::new()))];
        assert!(collect_ports(&chain, "p").await.is_none());
    }
}
