use crate::{
    api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressServiceBackend,
        ServiceBackendPort,
    },
    Ingress, IngressRule,
};
use ephemerator_controller_core::routes::{self, Rule};

pub fn rules(ingress: &Ingress) -> &[IngressRule] {
    ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_deref())
        .unwrap_or_default()
}

/// Computes the full rule list for the gateway: rules maintained by others
/// keep their place at the front, followed by `synthesized`.
pub fn desired_rules(
    ingress: &Ingress,
    base_domain: &str,
    synthesized: &[Rule],
) -> Vec<IngressRule> {
    rules(ingress)
        .iter()
        .filter(|rule| {
            let host = rule.host.as_deref().unwrap_or_default();
            !routes::is_synthesized_host(host, base_domain)
        })
        .cloned()
        .chain(synthesized.iter().map(to_k8s))
        .collect()
}

/// Returns a copy of `ingress` with its rules replaced.
pub fn with_rules(ingress: &Ingress, rules: Vec<IngressRule>) -> Ingress {
    let mut ingress = ingress.clone();
    ingress.spec.get_or_insert_with(Default::default).rules = Some(rules);
    ingress
}

fn to_k8s(rule: &Rule) -> IngressRule {
    IngressRule {
        host: Some(rule.host.clone()),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_string()),
                path_type: "Prefix".to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: rule.service.clone(),
                        port: Some(ServiceBackendPort {
                            number: Some(rule.port.into()),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
            }],
        }),
    }
}
