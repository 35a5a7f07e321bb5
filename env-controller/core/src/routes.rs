use crate::ports::CONTROL_PORT;

/// The subdomain under which the control port is published.
pub const CONTROL_SUBDOMAIN: &str = "tilt";

/// One public hostname routed to one service port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub host: String,
    pub service: String,
    pub port: u16,
}

/// The ports a derived service exposes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePorts {
    pub service: String,
    pub ports: Vec<u16>,
}

pub fn subdomain(port: u16) -> String {
    if port == CONTROL_PORT {
        return CONTROL_SUBDOMAIN.to_string();
    }
    port.to_string()
}

pub fn host(port: u16, service: &str, base_domain: &str) -> String {
    format!("{}.{service}.{base_domain}", subdomain(port))
}

/// Synthesizes one rule per service port.
///
/// Rules are ordered by service name and then by port, independent of the
/// input order, so that the same set of services always produces the same
/// rules.
pub fn synthesize(
    base_domain: &str,
    services: impl IntoIterator<Item = ServicePorts>,
) -> Vec<Rule> {
    let mut services = services.into_iter().collect::<Vec<_>>();
    services.sort_by(|a, b| a.service.cmp(&b.service));

    let mut rules = Vec::new();
    for ServicePorts { service, mut ports } in services {
        ports.sort_unstable();
        ports.dedup();
        for port in ports {
            rules.push(Rule {
                host: host(port, &service, base_domain),
                service: service.clone(),
                port,
            });
        }
    }
    rules
}

/// Whether a hostname has the shape of a synthesized rule. Rules that don't
/// are maintained by someone else and are left in place.
pub fn is_synthesized_host(host: &str, base_domain: &str) -> bool {
    let prefix = match host
        .strip_suffix(base_domain)
        .and_then(|h| h.strip_suffix('.'))
    {
        Some(prefix) => prefix,
        None => return false,
    };

    match prefix.split_once('.') {
        Some((sub, service)) if !service.is_empty() && !service.contains('.') => {
            sub == CONTROL_SUBDOMAIN || sub.parse::<u16>().is_ok()
        }
        _ => false,
    }
}
