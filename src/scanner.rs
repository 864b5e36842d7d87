use crate::config::ScanConfig;
use crate::conntable::{self, ConnTable, TableError};
use crate::services;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeSelector {
    #[default]
    Common,
    Extended,
    All,
}

impl RangeSelector {
    pub fn ports(self) -> RangeInclusive<u16> {
        match self {
            RangeSelector::Common => 1..=1024,
            RangeSelector::Extended => 1..=10000,
            RangeSelector::All => 1..=u16::MAX,
        }
    }
}

impl FromStr for RangeSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "common" => Ok(RangeSelector::Common),
            "extended" => Ok(RangeSelector::Extended),
            "all" => Ok(RangeSelector::All),
            other => Err(format!(
                "unknown range '{other}', expected common, extended or all"
            )),
        }
    }
}

impl std::fmt::Display for RangeSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeSelector::Common => write!(f, "common"),
            RangeSelector::Extended => write!(f, "extended"),
            RangeSelector::All => write!(f, "all"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortStatus {
    /// Answered a connect probe.
    Open,
    /// Reported in LISTEN state by the connection table.
    Listening,
}

impl std::fmt::Display for PortStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortStatus::Open => write!(f, "OPEN"),
            PortStatus::Listening => write!(f, "LISTENING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRecord {
    pub port: u16,
    pub protocol: Protocol,
    pub status: PortStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owning_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    pub service_label: String,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Scanner {
    config: ScanConfig,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Ports in use within `range`, ascending, each port once.
    ///
    /// `cap` bounds the probe fallback only; `None` uses the configured default.
    pub async fn scan(&self, range: RangeSelector, cap: Option<usize>) -> Vec<PortRecord> {
        let snapshot = match tokio::task::spawn_blocking(conntable::snapshot).await {
            Ok(result) => result,
            Err(e) => Err(TableError::Unavailable(e.to_string())),
        };
        self.scan_from(snapshot, range, cap).await
    }

    /// Scan against an already captured connection-table snapshot.
    pub async fn scan_from(
        &self,
        snapshot: Result<ConnTable, TableError>,
        range: RangeSelector,
        cap: Option<usize>,
    ) -> Vec<PortRecord> {
        let (table, mut records) = match snapshot {
            Ok(table) => {
                let records = listening_records(&table, range);
                (table, records)
            }
            Err(e) => {
                tracing::warn!(error = %e, "connection table read failed, degrading to empty table");
                let records = if self.config.probe_fallback {
                    let targets = probe_targets(range, cap.unwrap_or(self.config.default_cap));
                    tracing::debug!(ports = targets.len(), %range, "probing ports");
                    probe_ports(
                        &targets,
                        self.config.probe_timeout(),
                        self.config.batch_size,
                    )
                    .await
                    .into_iter()
                    .map(|port| bare_record(port, PortStatus::Open, None))
                    .collect()
                } else {
                    Vec::new()
                };
                (ConnTable::default(), records)
            }
        };

        enrich(&mut records, &table).await;
        records.sort_by_key(|r| r.port);
        records
    }
}

fn bare_record(port: u16, status: PortStatus, owning_pid: Option<u32>) -> PortRecord {
    PortRecord {
        port,
        protocol: Protocol::Tcp,
        status,
        owning_pid,
        process_name: None,
        service_label: String::new(),
    }
}

/// One LISTENING record per distinct port in range.
fn listening_records(table: &ConnTable, range: RangeSelector) -> Vec<PortRecord> {
    let range = range.ports();
    let mut by_port: BTreeMap<u16, Option<u32>> = BTreeMap::new();
    for entry in table.listening().filter(|e| range.contains(&e.port)) {
        let owner = by_port.entry(entry.port).or_insert(None);
        if owner.is_none() {
            *owner = entry.pid;
        }
    }
    by_port
        .into_iter()
        .map(|(port, pid)| bare_record(port, PortStatus::Listening, pid))
        .collect()
}

/// Ports to probe: the whole range for `all`, otherwise its first `cap` ports.
pub fn probe_targets(range: RangeSelector, cap: usize) -> Vec<u16> {
    let ports = range.ports();
    match range {
        RangeSelector::All => ports.collect(),
        _ => ports.take(cap.max(1)).collect(),
    }
}

/// Connect-probe `127.0.0.1` on each port, `batch_size` at a time.
///
/// Every batch is joined before the next one starts, so at most `batch_size`
/// sockets are in flight. Refused or timed-out connects are closed ports.
pub async fn probe_ports(ports: &[u16], timeout: Duration, batch_size: usize) -> Vec<u16> {
    let mut open = Vec::new();
    for batch in ports.chunks(batch_size.max(1)) {
        let mut set = JoinSet::new();
        for &port in batch {
            set.spawn(async move {
                match tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await
                {
                    Ok(Ok(_stream)) => Some(port),
                    _ => None,
                }
            });
        }
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(port)) = joined {
                open.push(port);
            }
        }
    }
    open.sort_unstable();
    open
}

/// Fill owners from the scan-start snapshot, then names and labels.
async fn enrich(records: &mut [PortRecord], table: &ConnTable) {
    for record in records.iter_mut().filter(|r| r.owning_pid.is_none()) {
        record.owning_pid = table.owner_of(record.port);
    }

    let mut pids: Vec<u32> = records.iter().filter_map(|r| r.owning_pid).collect();
    pids.sort_unstable();
    pids.dedup();

    let names = if pids.is_empty() {
        HashMap::new()
    } else {
        tokio::task::spawn_blocking(move || process_names(&pids))
            .await
            .unwrap_or_default()
    };

    for record in records.iter_mut() {
        record.process_name = record.owning_pid.and_then(|pid| names.get(&pid).cloned());
        record.service_label = services::label(record.port, record.process_name.as_deref());
    }
}

/// Executable names for `pids` from one process-table refresh. Missing pids are absent.
pub fn process_names(pids: &[u32]) -> HashMap<u32, String> {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let targets: Vec<Pid> = pids.iter().map(|p| Pid::from_u32(*p)).collect();
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&targets), true);

    pids.iter()
        .filter_map(|pid| {
            let process = system.process(Pid::from_u32(*pid))?;
            Some((*pid, process.name().to_string_lossy().into_owned()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntable::SocketEntry;

    fn entry(port: u16, listening: bool, pid: Option<u32>) -> SocketEntry {
        SocketEntry {
            port,
            listening,
            pid,
        }
    }

    #[test]
    fn test_range_bounds() {
        assert_eq!(RangeSelector::Common.ports(), 1..=1024);
        assert_eq!(RangeSelector::Extended.ports(), 1..=10000);
        assert_eq!(RangeSelector::All.ports(), 1..=65535);
    }

    #[test]
    fn test_range_from_str() {
        assert_eq!("common".parse::<RangeSelector>(), Ok(RangeSelector::Common));
        assert_eq!("EXTENDED".parse::<RangeSelector>(), Ok(RangeSelector::Extended));
        assert_eq!("all".parse::<RangeSelector>(), Ok(RangeSelector::All));
        assert!("udp".parse::<RangeSelector>().is_err());
    }

    #[test]
    fn test_probe_targets_truncates_unless_all() {
        assert_eq!(probe_targets(RangeSelector::Extended, 2000).len(), 2000);
        assert_eq!(probe_targets(RangeSelector::Common, 2000).len(), 1024);
        assert_eq!(probe_targets(RangeSelector::All, 10).len(), 65535);
        assert_eq!(probe_targets(RangeSelector::Common, 0), vec![1]);
        let targets = probe_targets(RangeSelector::Extended, 3);
        assert_eq!(targets, vec![1, 2, 3]);
    }

    #[test]
    fn test_port_record_json_shape() {
        let record = PortRecord {
            port: 80,
            protocol: Protocol::Tcp,
            status: PortStatus::Listening,
            owning_pid: Some(42),
            process_name: Some("nginx".to_string()),
            service_label: "HTTP".to_string(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "port": 80,
                "protocol": "TCP",
                "status": "LISTENING",
                "owningPid": 42,
                "processName": "nginx",
                "serviceLabel": "HTTP",
            })
        );
    }

    #[tokio::test]
    async fn test_table_scan_only_port_80() {
        let table = ConnTable::from_entries(vec![entry(80, true, None)]);
        let scanner = Scanner::default();
        let records = scanner
            .scan_from(Ok(table), RangeSelector::Common, None)
            .await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].port, 80);
        assert_eq!(records[0].protocol, Protocol::Tcp);
        assert_eq!(records[0].status, PortStatus::Listening);
        assert_eq!(records[0].service_label, "HTTP");
        assert_eq!(records[0].owning_pid, None);
    }

    #[tokio::test]
    async fn test_table_scan_dedups_sorts_and_filters_range() {
        let table = ConnTable::from_entries(vec![
            entry(8080, true, None),
            entry(443, true, None),
            entry(22, true, None),
            entry(443, true, None),
            entry(5000, false, None),
            entry(40000, true, None),
        ]);
        let scanner = Scanner::default();

        let common = scanner
            .scan_from(Ok(table.clone()), RangeSelector::Common, None)
            .await;
        let ports: Vec<u16> = common.iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![22, 443]);

        let all = scanner.scan_from(Ok(table), RangeSelector::All, None).await;
        let ports: Vec<u16> = all.iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![22, 443, 8080, 40000]);
    }

    #[tokio::test]
    async fn test_table_scan_resolves_own_process_name() {
        let pid = std::process::id();
        let table = ConnTable::from_entries(vec![entry(45123, true, Some(pid))]);
        let scanner = Scanner::default();
        let records = scanner.scan_from(Ok(table), RangeSelector::All, None).await;
        assert_eq!(records[0].owning_pid, Some(pid));
        assert!(records[0].process_name.is_some());
    }

    #[tokio::test]
    async fn test_vanished_owner_leaves_name_unset() {
        let table = ConnTable::from_entries(vec![entry(45124, true, Some(4_194_999))]);
        let scanner = Scanner::default();
        let records = scanner.scan_from(Ok(table), RangeSelector::All, None).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].owning_pid, Some(4_194_999));
        assert_eq!(records[0].process_name, None);
        assert_eq!(records[0].service_label, services::UNKNOWN_SERVICE);
    }

    #[tokio::test]
    async fn test_denied_table_without_fallback_is_empty() {
        let config = ScanConfig {
            probe_fallback: false,
            ..ScanConfig::default()
        };
        let scanner = Scanner::new(config);
        let records = scanner
            .scan_from(Err(TableError::PermissionDenied), RangeSelector::Common, None)
            .await;
        assert!(records.is_empty());
    }

    async fn spawn_accepting_listener() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            while listener.accept().await.is_ok() {}
        });
        (port, accept)
    }

    #[tokio::test]
    async fn test_denied_table_falls_back_to_probing() {
        let (port, accept) = spawn_accepting_listener().await;
        let scanner = Scanner::default();

        let records = scanner
            .scan_from(Err(TableError::PermissionDenied), RangeSelector::All, None)
            .await;

        assert!(records.windows(2).all(|w| w[0].port < w[1].port));
        let matching: Vec<_> = records.iter().filter(|r| r.port == port).collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].status, PortStatus::Open);
        assert_eq!(matching[0].protocol, Protocol::Tcp);
        assert!(!matching[0].service_label.is_empty());
        accept.abort();
    }

    #[tokio::test]
    async fn test_probe_fallback_honours_cap() {
        let scanner = Scanner::default();

        let capped = scanner
            .scan_from(
                Err(TableError::Unavailable("no table".to_string())),
                RangeSelector::Extended,
                Some(5),
            )
            .await;
        assert!(capped.iter().all(|r| r.port <= 5));

        let default_cap = scanner.config.default_cap;
        let uncapped = scanner
            .scan_from(
                Err(TableError::Unavailable("no table".to_string())),
                RangeSelector::Extended,
                None,
            )
            .await;
        assert!(uncapped.iter().all(|r| usize::from(r.port) <= default_cap));
    }

    #[tokio::test]
    async fn test_same_table_scans_identically() {
        let table = ConnTable::from_entries(vec![
            entry(22, true, None),
            entry(5432, true, None),
            entry(8080, false, None),
            entry(45125, true, Some(std::process::id())),
        ]);
        let scanner = Scanner::default();

        let first = scanner
            .scan_from(Ok(table.clone()), RangeSelector::All, None)
            .await;
        let second = scanner.scan_from(Ok(table), RangeSelector::All, None).await;
        assert_eq!(first, second);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_repeated_scans_agree_on_held_ports() {
        let held: Vec<std::net::TcpListener> = (0..3)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let ports: Vec<u16> = held
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect();

        let scanner = Scanner::default();
        let owned = |records: Vec<PortRecord>| -> Vec<u16> {
            records
                .into_iter()
                .map(|r| r.port)
                .filter(|p| ports.contains(p))
                .collect()
        };
        let first = owned(scanner.scan(RangeSelector::All, None).await);
        let second = owned(scanner.scan(RangeSelector::All, None).await);

        let mut expected = ports.clone();
        expected.sort_unstable();
        assert_eq!(first, expected);
        assert_eq!(first, second);
        drop(held);
    }

    #[tokio::test]
    async fn test_probe_finds_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        // A closed neighbour next to the open port.
        let closed = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let open = probe_ports(&[closed, port], Duration::from_millis(500), 1).await;
        assert_eq!(open, vec![port]);
        accept.abort();
    }

    #[tokio::test]
    async fn test_probe_empty_port_list() {
        let open = probe_ports(&[], Duration::from_millis(10), 200).await;
        assert!(open.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_full_scan_sees_listener_with_owner() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let scanner = Scanner::default();
        let records = scanner.scan(RangeSelector::All, None).await;

        assert!(records.windows(2).all(|w| w[0].port < w[1].port));
        let matching: Vec<_> = records.iter().filter(|r| r.port == port).collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].owning_pid, Some(std::process::id()));
        drop(listener);
    }
}
