use super::crd::{sanitize_dns, AttackResponse};
use crate::config::ControllerConfig;
use crate::error::Error;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use serde_json::json;

/// The closed set of decoy behaviors, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Behaviorally indistinguishable from the real upstream.
    Mirror,
    /// Adds fixed artificial latency to every request.
    Delayed,
    /// Logs request detail at high fidelity.
    Verbose,
}

pub const VARIANTS: [Variant; 3] = [Variant::Mirror, Variant::Delayed, Variant::Verbose];

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Mirror => "mirror",
            Variant::Delayed => "delayed",
            Variant::Verbose => "verbose",
        }
    }

    fn artificial_latency_ms(&self) -> u32 {
        match self {
            Variant::Delayed => 1000,
            _ => 0,
        }
    }

    fn log_detail(&self) -> &'static str {
        match self {
            Variant::Verbose => "verbose",
            _ => "normal",
        }
    }
}

pub fn decoy_name(response_name: &str, variant: Variant) -> String {
    format!("{}-{}", response_name, variant.as_str())
}

/// In-cluster URL the gateway fans out to; backed by the per-decoy Service
/// so it stays stable across pod IP churn.
pub fn decoy_url(name: &str, namespace: &str, port: u16) -> String {
    format!("http://{}.{}.svc.cluster.local:{}", name, namespace, port)
}

fn owner_ref(ar: &AttackResponse) -> Result<OwnerReference, Error> {
    ar.controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("metadata.name"))
}

fn decoy_labels(ar: &AttackResponse, name: &str, variant: Variant) -> serde_json::Value {
    json!({
        "app": "mirage-decoy",
        "mirage.dev/decoy": name,
        "mirage.dev/variant": variant.as_str(),
        "mirage.dev/attacker": sanitize_dns(&ar.spec.source_ip),
    })
}

/// Single-container pod running the upstream image with the variant's
/// behavior knobs in its environment.
pub fn build_decoy_pod(
    ar: &AttackResponse,
    cfg: &ControllerConfig,
    variant: Variant,
    name: &str,
) -> Result<Pod, Error> {
    let oref = owner_ref(ar)?;
    let pod = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": cfg.namespace,
            "labels": decoy_labels(ar, name, variant),
            "ownerReferences": [serde_json::to_value(&oref)?],
        },
        "spec": {
            "restartPolicy": "Always",
            "containers": [{
                "name": "decoy",
                "image": cfg.decoy_image,
                "imagePullPolicy": "IfNotPresent",
                "ports": [{"containerPort": cfg.decoy_port, "protocol": "TCP"}],
                "env": [
                    {"name": "VARIANT", "value": variant.as_str()},
                    {"name": "ARTIFICIAL_LATENCY_MS", "value": variant.artificial_latency_ms().to_string()},
                    {"name": "LOG_DETAIL", "value": variant.log_detail()},
                    {"name": "PORT", "value": cfg.decoy_port.to_string()},
                ],
            }],
        },
    }))?;
    Ok(pod)
}

/// ClusterIP Service selecting exactly this decoy pod.
pub fn build_decoy_service(
    ar: &AttackResponse,
    cfg: &ControllerConfig,
    variant: Variant,
    name: &str,
) -> Result<Service, Error> {
    let oref = owner_ref(ar)?;
    let svc = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": cfg.namespace,
            "labels": decoy_labels(ar, name, variant),
            "ownerReferences": [serde_json::to_value(&oref)?],
        },
        "spec": {
            "selector": {"mirage.dev/decoy": name},
            "ports": [{"port": cfg.decoy_port, "targetPort": cfg.decoy_port, "protocol": "TCP"}],
        },
    }))?;
    Ok(svc)
}

/// Isolation around one decoy: ingress only from gateway-labeled pods,
/// egress only to the metrics sink plus cluster DNS. Everything else is
/// denied by the policy's existence.
pub fn build_decoy_network_policy(
    ar: &AttackResponse,
    cfg: &ControllerConfig,
    variant: Variant,
    name: &str,
) -> Result<NetworkPolicy, Error> {
    let oref = owner_ref(ar)?;
    let (gw_key, gw_value) = split_label(&cfg.gateway_label)?;
    let (sink_key, sink_value) = split_label(&cfg.metrics_sink_label)?;

    let policy = serde_json::from_value(json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": {
            "name": format!("{}-isolation", name),
            "namespace": cfg.namespace,
            "labels": decoy_labels(ar, name, variant),
            "ownerReferences": [serde_json::to_value(&oref)?],
        },
        "spec": {
            "podSelector": {"matchLabels": {"mirage.dev/decoy": name}},
            "policyTypes": ["Ingress", "Egress"],
            "ingress": [{
                "from": [{"podSelector": {"matchLabels": {gw_key: gw_value}}}],
                "ports": [{"port": cfg.decoy_port, "protocol": "TCP"}],
            }],
            "egress": [
                {
                    "to": [{"podSelector": {"matchLabels": {sink_key: sink_value}}}],
                },
                {
                    "to": [{
                        "namespaceSelector": {},
                        "podSelector": {"matchLabels": {"k8s-app": "kube-dns"}},
                    }],
                    "ports": [
                        {"port": 53, "protocol": "UDP"},
                        {"port": 53, "protocol": "TCP"},
                    ],
                },
            ],
        },
    }))?;
    Ok(policy)
}

fn split_label(label: &str) -> Result<(&str, &str), Error> {
    label
        .split_once('=')
        .ok_or(Error::MissingObjectKey("label selector"))
}
