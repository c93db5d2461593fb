use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    Condition,
    Time,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{
    Deserialize,
    Serialize,
};
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "kube-system";
pub const DEFAULT_PROBE_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_TEST_DOMAIN: &str = "kubernetes.default.svc.cluster.local";
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Watches the cluster DNS service, probes name resolution and heals CoreDNS when it degrades.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "infra.sharduljunagade.github.io",
    version = "v1alpha1",
    kind = "DNSMonitor",
    namespaced,
    status = "DNSMonitorStatus",
    printcolumn = r#"{"name":"Healthy", "type":"boolean", "jsonPath":".status.healthy"}"#,
    printcolumn = r#"{"name":"Failures", "type":"integer", "jsonPath":".status.failCount"}"#,
    printcolumn = r#"{"name":"Last Action", "type":"string", "jsonPath":".status.lastAction"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DNSMonitorSpec {
    /// Namespace the DNS service runs in. Defaults to kube-system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Seconds between two reconciliation passes. Defaults to 30.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_interval_seconds: Option<u64>,
    /// Name resolved by the probe job. Defaults to kubernetes.default.svc.cluster.local.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_domain: Option<String>,
    /// Consecutive probe failures after which all DNS pods are restarted. Defaults to 3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    /// Lower bound for the replica count of the DNS deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DNSMonitorStatus {
    #[serde(default)]
    pub healthy: bool,
    /// Consecutive probe failures since the last success or remediation.
    #[serde(default)]
    pub fail_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

/// Spec values with defaults applied. Never written back to the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub namespace: String,
    pub probe_interval: Duration,
    pub test_domain: String,
    pub failure_threshold: u32,
    pub desired_replicas: Option<i32>,
}

impl DNSMonitorSpec {
    pub fn settings(&self) -> MonitorSettings {
        fn non_empty(value: &Option<String>, default: &str) -> String {
            value
                .as_deref()
                .filter(|value| !value.is_empty())
                .unwrap_or(default)
                .to_string()
        }

        let interval = self
            .probe_interval_seconds
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_PROBE_INTERVAL_SECONDS);

        MonitorSettings {
            namespace: non_empty(&self.namespace, DEFAULT_NAMESPACE),
            probe_interval: Duration::from_secs(interval),
            test_domain: non_empty(&self.test_domain, DEFAULT_TEST_DOMAIN),
            failure_threshold: self
                .failure_threshold
                .filter(|threshold| *threshold > 0)
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            desired_replicas: self.desired_replicas.filter(|replicas| *replicas > 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_spec_gets_defaults() {
        let settings = DNSMonitorSpec::default().settings();
        assert_eq!(settings.namespace, "kube-system");
        assert_eq!(settings.probe_interval, Duration::from_secs(30));
        assert_eq!(settings.test_domain, "kubernetes.default.svc.cluster.local");
        assert_eq!(settings.failure_threshold, 3);
        assert_eq!(settings.desired_replicas, None);
    }

    #[test]
    fn zero_and_empty_values_count_as_unset() {
        let spec = DNSMonitorSpec {
            namespace: Some(String::new()),
            probe_interval_seconds: Some(0),
            test_domain: Some(String::new()),
            failure_threshold: Some(0),
            desired_replicas: Some(0),
        };
        assert_eq!(spec.settings(), DNSMonitorSpec::default().settings());
    }

    #[test]
    fn explicit_values_are_kept() {
        let spec = DNSMonitorSpec {
            namespace: Some("dns".to_string()),
            probe_interval_seconds: Some(10),
            test_domain: Some("example.com".to_string()),
            failure_threshold: Some(5),
            desired_replicas: Some(2),
        };
        let settings = spec.settings();
        assert_eq!(settings.namespace, "dns");
        assert_eq!(settings.probe_interval, Duration::from_secs(10));
        assert_eq!(settings.test_domain, "example.com");
        assert_eq!(settings.failure_threshold, 5);
        assert_eq!(settings.desired_replicas, Some(2));
    }

    #[test]
    fn spec_uses_camel_case_on_the_wire() {
        let spec: DNSMonitorSpec = serde_json::from_value(serde_json::json!({
            "probeIntervalSeconds": 15,
            "testDomain": "svc.example",
            "failureThreshold": 2,
            "desiredReplicas": 3,
        }))
        .unwrap();
        assert_eq!(spec.probe_interval_seconds, Some(15));
        assert_eq!(spec.test_domain.as_deref(), Some("svc.example"));
        assert_eq!(spec.failure_threshold, Some(2));
        assert_eq!(spec.desired_replicas, Some(3));
        assert_eq!(spec.namespace, None);
    }
}
