use k8s_openapi::api::core::v1::Pod;

/// A pod is ready iff it reports a `Ready` condition with status `True`.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
}
