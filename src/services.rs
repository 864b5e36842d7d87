/// Label used when neither the port nor the process is recognized.
pub const UNKNOWN_SERVICE: &str = "Unknown";

const WELL_KNOWN_PORTS: &[(u16, &str)] = &[
    (20, "FTP Data"),
    (21, "FTP"),
    (22, "SSH"),
    (23, "Telnet"),
    (25, "SMTP"),
    (53, "DNS"),
    (80, "HTTP"),
    (110, "POP3"),
    (111, "RPC"),
    (139, "NetBIOS"),
    (143, "IMAP"),
    (443, "HTTPS"),
    (445, "SMB"),
    (465, "SMTPS"),
    (587, "SMTP Submission"),
    (631, "CUPS"),
    (993, "IMAPS"),
    (995, "POP3S"),
    (1433, "MSSQL"),
    (1521, "Oracle"),
    (1883, "MQTT"),
    (2375, "Docker"),
    (3000, "Dev Server"),
    (3306, "MySQL"),
    (3389, "RDP"),
    (4200, "Angular Dev Server"),
    (5000, "Flask"),
    (5173, "Vite"),
    (5432, "PostgreSQL"),
    (5672, "RabbitMQ"),
    (5900, "VNC"),
    (6379, "Redis"),
    (8000, "HTTP Alt"),
    (8080, "HTTP Proxy"),
    (8443, "HTTPS Alt"),
    (8888, "Jupyter"),
    (9000, "PHP-FPM"),
    (9090, "Prometheus"),
    (9200, "Elasticsearch"),
    (11211, "Memcached"),
    (15672, "RabbitMQ Management"),
    (27017, "MongoDB"),
];

/// Checked in order against the lowercased process name.
const PROCESS_HINTS: &[(&str, &str)] = &[
    ("postgres", "PostgreSQL"),
    ("mysqld", "MySQL"),
    ("mariadb", "MariaDB"),
    ("redis", "Redis"),
    ("mongod", "MongoDB"),
    ("nginx", "nginx"),
    ("httpd", "Apache"),
    ("apache", "Apache"),
    ("docker", "Docker"),
    ("node", "Node.js"),
    ("deno", "Deno"),
    ("bun", "Bun"),
    ("python", "Python"),
    ("ruby", "Ruby"),
    ("java", "Java"),
    ("php", "PHP"),
    ("sshd", "SSH"),
    ("cupsd", "CUPS"),
];

pub fn well_known(port: u16) -> Option<&'static str> {
    WELL_KNOWN_PORTS
        .binary_search_by_key(&port, |(p, _)| *p)
        .ok()
        .map(|i| WELL_KNOWN_PORTS[i].1)
}

pub fn from_process_name(name: &str) -> Option<&'static str> {
    let lower = name.to_lowercase();
    PROCESS_HINTS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, label)| *label)
}

/// Port table first, then the process-name hints, then [`UNKNOWN_SERVICE`].
pub fn label(port: u16, process_name: Option<&str>) -> String {
    well_known(port)
        .or_else(|| process_name.and_then(from_process_name))
        .unwrap_or(UNKNOWN_SERVICE)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_table_is_sorted() {
        assert!(WELL_KNOWN_PORTS.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_well_known_port_wins_over_process() {
        assert_eq!(label(80, Some("node")), "HTTP");
        assert_eq!(label(5432, None), "PostgreSQL");
    }

    #[test]
    fn test_process_fallback_for_unknown_port() {
        assert_eq!(label(43123, Some("node")), "Node.js");
        assert_eq!(label(43123, Some("Python3.12")), "Python");
        assert_eq!(label(43123, Some("postgres: writer")), "PostgreSQL");
    }

    #[test]
    fn test_unknown_everything() {
        assert_eq!(label(43123, None), UNKNOWN_SERVICE);
        assert_eq!(label(43123, Some("mystery")), UNKNOWN_SERVICE);
    }
}
