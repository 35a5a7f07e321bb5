use ahash::AHashSet as HashSet;
use serde::Deserialize;

/// The workload's own control port. It is always exposed.
pub const CONTROL_PORT: u16 = 10350;
pub const CONTROL_PORT_NAME: &str = "tilt";
pub const PROTOCOL_TCP: &str = "TCP";

const ENDPOINT_PREFIX: &str = "http://0.0.0.0:";

/// The command that lists the resources tracked inside a workload.
pub fn introspection_command() -> Vec<String> {
    ["tilt", "get", "uiresources", "-o", "json"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// The resource list printed by the introspection command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ResourceList {
    #[serde(default)]
    pub items: Vec<Resource>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Resource {
    pub metadata: ResourceMeta,

    #[serde(default)]
    pub status: ResourceStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ResourceMeta {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default)]
    pub runtime_status: String,

    #[serde(default)]
    pub endpoint_links: Vec<EndpointLink>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct EndpointLink {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServicePort {
    pub name: String,
    pub protocol: String,
    pub port: u16,
}

// === impl ResourceList ===

impl ResourceList {
    pub fn parse(stdout: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(stdout)
    }

    /// Whether any resource has yet to reach a terminal runtime state, in
    /// which case more endpoints may still appear.
    pub fn has_pending(&self) -> bool {
        self.items.iter().any(|r| r.status.is_pending())
    }

    /// Determines the ports exposed by the workload.
    ///
    /// The control port always comes first. Each port is exposed once, under
    /// the name of the first resource that claimed it; names that collide
    /// get a numeric suffix. The result is ordered by port.
    pub fn service_ports(&self) -> Vec<ServicePort> {
        let mut ports = PortSet::default();
        ports.add(CONTROL_PORT_NAME, CONTROL_PORT);

        for resource in &self.items {
            for link in &resource.status.endpoint_links {
                if let Some(port) = endpoint_port(&link.url) {
                    ports.add(&resource.metadata.name, port);
                }
            }
        }

        let mut ports = ports.ports;
        ports.sort_by_key(|p| p.port);
        ports
    }
}

// === impl ResourceStatus ===

impl ResourceStatus {
    fn is_pending(&self) -> bool {
        matches!(self.runtime_status.as_str(), "" | "pending" | "unknown")
    }
}

// === impl ServicePort ===

impl ServicePort {
    pub fn tcp(name: impl ToString, port: u16) -> Self {
        Self {
            name: name.to_string(),
            protocol: PROTOCOL_TCP.to_string(),
            port,
        }
    }
}

/// Compares port sets without regard to order.
pub fn same_ports(a: &[ServicePort], b: &[ServicePort]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.iter().collect::<Vec<_>>();
    let mut b = b.iter().collect::<Vec<_>>();
    a.sort();
    b.sort();
    a == b
}

/// Parses the port out of an endpoint URL of the form
/// `http://0.0.0.0:<port>/...`.
pub fn endpoint_port(url: &str) -> Option<u16> {
    let rest = url.strip_prefix(ENDPOINT_PREFIX)?;
    let end = rest.find(|c: char| !c.is_ascii_digit())?;
    if !rest[end..].starts_with('/') {
        return None;
    }
    match rest[..end].parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

#[derive(Default)]
struct PortSet {
    ports: Vec<ServicePort>,
    names: HashSet<String>,
    taken: HashSet<u16>,
}

impl PortSet {
    fn add(&mut self, name: &str, port: u16) {
        if self.taken.contains(&port) {
            return;
        }

        let mut candidate = name.to_string();
        let mut i = 1;
        while self.names.contains(&candidate) {
            i += 1;
            candidate = format!("{name}-{i}");
        }

        self.names.insert(candidate.clone());
        self.taken.insert(port);
        self.ports.push(ServicePort::tcp(candidate, port));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn list(json: &str) -> ResourceList {
        ResourceList::parse(json.as_bytes()).expect("list must parse")
    }

    #[test]
    fn parses_endpoint_ports() {
        assert_eq!(endpoint_port("http://0.0.0.0:8000/"), Some(8000));
        assert_eq!(endpoint_port("http://0.0.0.0:8000/api/v1"), Some(8000));
        assert_eq!(endpoint_port("http://0.0.0.0:8000"), None);
        assert_eq!(endpoint_port("http://0.0.0.0:0/"), None);
        assert_eq!(endpoint_port("http://0.0.0.0:70000/"), None);
        assert_eq!(endpoint_port("http://localhost:8000/"), None);
        assert_eq!(endpoint_port("http://0.0.0.0:/"), None);
    }

    #[test]
    fn always_exposes_control_port() {
        assert_eq!(
            ResourceList::default().service_ports(),
            vec![ServicePort::tcp("tilt", 10350)]
        );
    }

    #[test]
    fn dedupes_ports() {
        let list = list(
            r#"{"items": [
                {"metadata": {"name": "web"}, "status": {"runtimeStatus": "ok", "endpointLinks": [
                    {"url": "http://0.0.0.0:8000/"},
                    {"url": "http://0.0.0.0:8000/admin"}
                ]}},
                {"metadata": {"name": "api"}, "status": {"runtimeStatus": "ok", "endpointLinks": [
                    {"url": "http://0.0.0.0:8000/"}
                ]}}
            ]}"#,
        );
        assert_eq!(
            list.service_ports(),
            vec![
                ServicePort::tcp("web", 8000),
                ServicePort::tcp("tilt", 10350),
            ]
        );
    }

    #[test]
    fn disambiguates_names() {
        let list = list(
            r#"{"items": [
                {"metadata": {"name": "web"}, "status": {"endpointLinks": [
                    {"url": "http://0.0.0.0:9000/"},
                    {"url": "http://0.0.0.0:8000/"}
                ]}},
                {"metadata": {"name": "tilt"}, "status": {"endpointLinks": [
                    {"url": "http://0.0.0.0:7000/"}
                ]}}
            ]}"#,
        );
        assert_eq!(
            list.service_ports(),
            vec![
                ServicePort::tcp("tilt-2", 7000),
                ServicePort::tcp("web-2", 8000),
                ServicePort::tcp("web", 9000),
                ServicePort::tcp("tilt", 10350),
            ]
        );
    }

    #[test]
    fn pending_resources() {
        let list = list(
            r#"{"items": [
                {"metadata": {"name": "a"}, "status": {"runtimeStatus": "ok"}},
                {"metadata": {"name": "b"}, "status": {"runtimeStatus": "not_applicable"}}
            ]}"#,
        );
        assert!(!list.has_pending());

        for status in ["pending", "unknown", ""] {
            let list = self::list(&format!(
                r#"{{"items": [{{"metadata": {{"name": "a"}}, "status": {{"runtimeStatus": "{status}"}}}}]}}"#
            ));
            assert!(list.has_pending(), "{status:?} must be pending");
        }

        let list = self::list(r#"{"items": [{"metadata": {"name": "a"}}]}"#);
        assert!(list.has_pending());
    }

    #[test]
    fn rejects_malformed_output() {
        assert!(ResourceList::parse(b"Error: no tilt server").is_err());
    }

    #[test]
    fn compares_port_sets_without_order() {
        let a = vec![ServicePort::tcp("a", 1), ServicePort::tcp("b", 2)];
        let b = vec![ServicePort::tcp("b", 2), ServicePort::tcp("a", 1)];
        assert!(same_ports(&a, &b));
        assert!(!same_ports(&a, &[ServicePort::tcp("a", 1)]));
        assert!(!same_ports(
            &a,
            &[ServicePort::tcp("a", 1), ServicePort::tcp("c", 2)]
        ));
    }
}
