use crate::{
    probe_job::DEFAULT_PROBE_IMAGE,
    store::ObjectStore,
};
use std::sync::Arc;

pub const DEFAULT_DNS_DEPLOYMENT: &str = "coredns";
pub const DEFAULT_DNS_POD_SELECTOR: &str = "k8s-app=kube-dns";

/// Holds what every reconciliation pass needs besides the monitor itself.
pub struct Context {
    pub store: Arc<dyn ObjectStore>,
    pub dns: DnsTarget,
}

/// Identifies the DNS workload inside a monitor's target namespace and how to probe it.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsTarget {
    pub deployment: String,
    pub pod_selector: String,
    pub probe_image: String,
}

impl Default for DnsTarget {
    fn default() -> Self {
        Self {
            deployment: DEFAULT_DNS_DEPLOYMENT.to_string(),
            pod_selector: DEFAULT_DNS_POD_SELECTOR.to_string(),
            probe_image: DEFAULT_PROBE_IMAGE.to_string(),
        }
    }
}
