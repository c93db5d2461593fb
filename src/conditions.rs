use crate::resources::DNSMonitorStatus;
use chrono::prelude::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    Condition,
    Time,
};

pub(crate) const HEALTHY: &str = "Healthy";

/// Builds the `Healthy` condition for a new status. The transition time only moves when the verdict flips.
pub(crate) fn healthy_condition(
    previous: &DNSMonitorStatus,
    healthy: bool,
    reason: impl ToString,
    message: impl ToString,
    now: DateTime<Utc>,
    observed_generation: Option<i64>,
) -> Condition {
    let last_condition = last_healthy_condition(previous.conditions.as_ref());
    let status = if healthy { "True" } else { "False" };

    let last_transition_time = last_condition
        .filter(|condition| condition.status == status)
        .map(|condition| condition.last_transition_time.clone())
        .unwrap_or_else(|| Time(now));

    Condition {
        type_: HEALTHY.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time,
        observed_generation,
    }
}

fn last_healthy_condition(conditions: Option<&Vec<Condition>>) -> Option<&Condition> {
    conditions.and_then(|conditions| conditions.iter().find(|condition| condition.type_ == HEALTHY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn first_condition_uses_now() {
        let now = Utc::now();
        let condition = healthy_condition(&DNSMonitorStatus::default(), true, "ProbeSucceeded", "ok", now, Some(1));
        assert_eq!(condition.type_, "Healthy");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.last_transition_time, Time(now));
        assert_eq!(condition.observed_generation, Some(1));
    }

    #[test]
    fn unchanged_verdict_keeps_transition_time() {
        let earlier = Utc::now() - Duration::minutes(5);
        let previous = DNSMonitorStatus {
            conditions: Some(vec![healthy_condition(
                &DNSMonitorStatus::default(),
                false,
                "ProbeFailed",
                "",
                earlier,
                None,
            )]),
            ..Default::default()
        };

        let condition = healthy_condition(&previous, false, "ProbeFailed", "", Utc::now(), None);
        assert_eq!(condition.last_transition_time, Time(earlier));

        let now = Utc::now();
        let flipped = healthy_condition(&previous, true, "ProbeSucceeded", "", now, None);
        assert_eq!(flipped.last_transition_time, Time(now));
    }
}
