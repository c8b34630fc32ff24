//! Built-in health rules
//!
//! Each rule reads `status` (and sometimes `spec`) of a live object. Missing
//! counters are treated as zero, so a freshly created object reads as
//! Progressing until its controller reports back.

use serde_json::Value;

use super::HealthAssessment;
use crate::models::{HealthStatus, Manifest};

fn int_at(value: Option<&Value>, path: &[&str]) -> Option<i64> {
    let mut current = value?;
    for segment in path {
        current = current.get(segment)?;
    }
    current.as_i64()
}

fn str_at<'a>(value: Option<&'a Value>, path: &[&str]) -> Option<&'a str> {
    let mut current = value?;
    for segment in path {
        current = current.get(segment)?;
    }
    current.as_str()
}

fn status_int(manifest: &Manifest, field: &str) -> i64 {
    int_at(manifest.status(), &[field]).unwrap_or(0)
}

/// A status condition, as reported in `status.conditions`.
struct Condition<'a> {
    status: &'a str,
    reason: Option<&'a str>,
    message: Option<&'a str>,
}

fn condition<'a>(manifest: &'a Manifest, condition_type: &str) -> Option<Condition<'a>> {
    manifest
        .status()
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(condition_type))
        .map(|c| Condition {
            status: c.get("status").and_then(|s| s.as_str()).unwrap_or("Unknown"),
            reason: c.get("reason").and_then(|r| r.as_str()),
            message: c.get("message").and_then(|m| m.as_str()),
        })
}

fn generation_observed(manifest: &Manifest) -> bool {
    let generation = manifest
        .metadata()
        .and_then(|m| m.get("generation"))
        .and_then(|g| g.as_i64());
    let observed = int_at(manifest.status(), &["observedGeneration"]);
    match (generation, observed) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

fn desired_replicas(manifest: &Manifest) -> i64 {
    int_at(manifest.spec(), &["replicas"]).unwrap_or(1)
}

pub fn deployment(manifest: &Manifest) -> HealthAssessment {
    if manifest
        .spec()
        .and_then(|s| s.get("paused"))
        .and_then(|p| p.as_bool())
        .unwrap_or(false)
    {
        return HealthAssessment::suspended("Deployment is paused");
    }
    if !generation_observed(manifest) {
        return HealthAssessment::progressing(
            "Waiting for rollout to finish: observed generation is behind",
        );
    }
    if let Some(progressing) = condition(manifest, "Progressing") {
        if progressing.reason == Some("ProgressDeadlineExceeded") {
            return HealthAssessment::degraded(format!(
                "Deployment {} has exceeded its progress deadline",
                manifest.name()
            ));
        }
    }

    let replicas = desired_replicas(manifest);
    let updated = status_int(manifest, "updatedReplicas");
    let current = status_int(manifest, "replicas");
    let available = status_int(manifest, "availableReplicas");

    if updated < replicas {
        return HealthAssessment::progressing(format!(
            "Waiting for rollout to finish: {} out of {} new replicas have been updated",
            updated, replicas
        ));
    }
    if current > updated {
        return HealthAssessment::progressing(format!(
            "Waiting for rollout to finish: {} old replicas are pending termination",
            current - updated
        ));
    }
    if available < updated {
        return HealthAssessment::progressing(format!(
            "Waiting for rollout to finish: {} of {} updated replicas are available",
            available, updated
        ));
    }
    HealthAssessment::healthy()
}

pub fn stateful_set(manifest: &Manifest) -> HealthAssessment {
    if !generation_observed(manifest) {
        return HealthAssessment::progressing(
            "Waiting for statefulset spec update to be observed",
        );
    }
    if str_at(manifest.spec(), &["updateStrategy", "type"]) == Some("OnDelete") {
        return HealthAssessment::with_message(
            HealthStatus::Healthy,
            "OnDelete update strategy: rollout status not tracked",
        );
    }

    let replicas = desired_replicas(manifest);
    let ready = status_int(manifest, "readyReplicas");
    if ready < replicas {
        return HealthAssessment::progressing(format!(
            "Waiting for {} pods to be ready",
            replicas - ready
        ));
    }

    let current = str_at(manifest.status(), &["currentRevision"]);
    let update = str_at(manifest.status(), &["updateRevision"]);
    if let (Some(current), Some(update)) = (current, update) {
        if current != update {
            return HealthAssessment::progressing(format!(
                "Waiting for rolling update to complete: revision {} -> {}",
                current, update
            ));
        }
    }
    HealthAssessment::healthy()
}

pub fn daemon_set(manifest: &Manifest) -> HealthAssessment {
    if !generation_observed(manifest) {
        return HealthAssessment::progressing("Waiting for daemon set spec update to be observed");
    }
    if str_at(manifest.spec(), &["updateStrategy", "type"]) == Some("OnDelete") {
        return HealthAssessment::with_message(
            HealthStatus::Healthy,
            "OnDelete update strategy: rollout status not tracked",
        );
    }

    let desired = status_int(manifest, "desiredNumberScheduled");
    let updated = status_int(manifest, "updatedNumberScheduled");
    let available = status_int(manifest, "numberAvailable");
    if updated < desired {
        return HealthAssessment::progressing(format!(
            "Waiting for daemon set rollout: {} out of {} new pods have been updated",
            updated, desired
        ));
    }
    if available < desired {
        return HealthAssessment::progressing(format!(
            "Waiting for daemon set rollout: {} of {} updated pods are available",
            available, desired
        ));
    }
    HealthAssessment::healthy()
}

pub fn replica_set(manifest: &Manifest) -> HealthAssessment {
    if !generation_observed(manifest) {
        return HealthAssessment::progressing("Waiting for replica set spec update to be observed");
    }
    if let Some(failure) = condition(manifest, "ReplicaFailure") {
        if failure.status == "True" {
            return HealthAssessment::degraded(
                failure.message.unwrap_or("replica set failed to create pods"),
            );
        }
    }
    let replicas = desired_replicas(manifest);
    let available = status_int(manifest, "availableReplicas");
    if available < replicas {
        return HealthAssessment::progressing(format!(
            "Waiting for rollout to finish: {} out of {} replicas are available",
            available, replicas
        ));
    }
    HealthAssessment::healthy()
}

const POD_FAILURE_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

pub fn pod(manifest: &Manifest) -> HealthAssessment {
    let status = manifest.status();
    let phase = str_at(status, &["phase"]).unwrap_or("Pending");
    let message = str_at(status, &["message"]);

    let container_statuses = status
        .and_then(|s| s.get("containerStatuses"))
        .and_then(|c| c.as_array())
        .map(|c| c.as_slice())
        .unwrap_or_default();

    for container in container_statuses {
        if let Some(reason) = str_at(Some(container), &["state", "waiting", "reason"]) {
            if POD_FAILURE_REASONS.contains(&reason) {
                let detail = str_at(Some(container), &["state", "waiting", "message"])
                    .unwrap_or(reason);
                return HealthAssessment::degraded(detail.to_string());
            }
        }
    }

    match phase {
        "Succeeded" => HealthAssessment::healthy(),
        "Failed" => HealthAssessment::degraded(message.unwrap_or("pod failed")),
        "Running" => {
            let all_ready = !container_statuses.is_empty()
                && container_statuses
                    .iter()
                    .all(|c| c.get("ready").and_then(|r| r.as_bool()).unwrap_or(false));
            if all_ready {
                HealthAssessment::healthy()
            } else {
                HealthAssessment::progressing("Waiting for containers to become ready")
            }
        }
        "Pending" => HealthAssessment::progressing(message.unwrap_or("pod is pending")),
        other => HealthAssessment::with_message(
            HealthStatus::Unknown,
            format!("unrecognised pod phase: {}", other),
        ),
    }
}

pub fn job(manifest: &Manifest) -> HealthAssessment {
    if let Some(failed) = condition(manifest, "Failed") {
        if failed.status == "True" {
            return HealthAssessment::degraded(
                failed
                    .message
                    .or(failed.reason)
                    .unwrap_or("job failed")
                    .to_string(),
            );
        }
    }
    if let Some(complete) = condition(manifest, "Complete") {
        if complete.status == "True" {
            return HealthAssessment::with_message(HealthStatus::Healthy, "job completed");
        }
    }
    if manifest
        .spec()
        .and_then(|s| s.get("suspend"))
        .and_then(|s| s.as_bool())
        .unwrap_or(false)
    {
        return HealthAssessment::suspended("job is suspended");
    }
    HealthAssessment::progressing("job is running")
}

pub fn persistent_volume_claim(manifest: &Manifest) -> HealthAssessment {
    match str_at(manifest.status(), &["phase"]) {
        Some("Bound") => HealthAssessment::healthy(),
        Some("Lost") => HealthAssessment::degraded("claim lost its underlying volume"),
        Some("Pending") | None => HealthAssessment::progressing("claim is pending"),
        Some(other) => HealthAssessment::with_message(
            HealthStatus::Unknown,
            format!("unrecognised claim phase: {}", other),
        ),
    }
}

fn load_balancer_assigned(manifest: &Manifest) -> bool {
    manifest
        .status()
        .and_then(|s| s.get("loadBalancer"))
        .and_then(|lb| lb.get("ingress"))
        .and_then(|i| i.as_array())
        .map(|i| !i.is_empty())
        .unwrap_or(false)
}

pub fn service(manifest: &Manifest) -> HealthAssessment {
    if str_at(manifest.spec(), &["type"]) != Some("LoadBalancer") {
        return HealthAssessment::healthy();
    }
    if load_balancer_assigned(manifest) {
        HealthAssessment::healthy()
    } else {
        HealthAssessment::progressing("Waiting for load balancer address")
    }
}

pub fn ingress(manifest: &Manifest) -> HealthAssessment {
    if load_balancer_assigned(manifest) {
        HealthAssessment::healthy()
    } else {
        HealthAssessment::progressing("Waiting for ingress address")
    }
}

/// Fallback for kinds without a dedicated rule.
///
/// `spec.suspend: true` reads as Suspended. Otherwise the `Ready` condition
/// decides; objects without one are Healthy once they exist.
pub fn generic(manifest: &Manifest) -> HealthAssessment {
    if manifest
        .spec()
        .and_then(|s| s.get("suspend"))
        .and_then(|s| s.as_bool())
        .unwrap_or(false)
    {
        return HealthAssessment::suspended(format!("{} is suspended", manifest.kind()));
    }

    if let Some(reconciling) = condition(manifest, "Reconciling") {
        if reconciling.status == "True" {
            return HealthAssessment::progressing(
                reconciling.message.unwrap_or("reconciliation in progress"),
            );
        }
    }

    match condition(manifest, "Ready") {
        None => HealthAssessment::healthy(),
        Some(ready) => match ready.status {
            "True" => match ready.message {
                Some(msg) => HealthAssessment::with_message(HealthStatus::Healthy, msg),
                None => HealthAssessment::healthy(),
            },
            "False" => {
                let progressing = ready
                    .reason
                    .map(|r| r.contains("Progressing") || r.contains("Reconciling"))
                    .unwrap_or(false);
                let message = ready.message.or(ready.reason).unwrap_or("not ready");
                if progressing {
                    HealthAssessment::progressing(message)
                } else {
                    HealthAssessment::degraded(message)
                }
            }
            _ => HealthAssessment::progressing(ready.message.unwrap_or("readiness unknown")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(value: Value) -> Manifest {
        Manifest::new(value).unwrap()
    }

    #[test]
    fn test_deployment_rollout_states() {
        let rolling = manifest(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "generation": 2},
            "spec": {"replicas": 3},
            "status": {"observedGeneration": 2, "replicas": 3, "updatedReplicas": 1, "availableReplicas": 1}
        }));
        assert_eq!(deployment(&rolling).status, HealthStatus::Progressing);

        let done = manifest(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "generation": 2},
            "spec": {"replicas": 3},
            "status": {"observedGeneration": 2, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 3}
        }));
        assert_eq!(deployment(&done).status, HealthStatus::Healthy);
    }

    #[test]
    fn test_deployment_paused_and_deadline() {
        let paused = manifest(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"},
            "spec": {"paused": true}
        }));
        assert_eq!(deployment(&paused).status, HealthStatus::Suspended);

        let stuck = manifest(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"},
            "spec": {"replicas": 1},
            "status": {"conditions": [
                {"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}
            ]}
        }));
        assert_eq!(deployment(&stuck).status, HealthStatus::Degraded);
    }

    #[test]
    fn test_pod_crash_loop_is_degraded() {
        let pod_value = manifest(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p"},
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"name": "app", "ready": false, "state": {"waiting": {"reason": "CrashLoopBackOff"}}}
                ]
            }
        }));
        assert_eq!(pod(&pod_value).status, HealthStatus::Degraded);
    }

    #[test]
    fn test_generic_ready_condition() {
        let ready = manifest(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "w"},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        }));
        assert_eq!(generic(&ready).status, HealthStatus::Healthy);

        let failing = manifest(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "w"},
            "status": {"conditions": [{"type": "Ready", "status": "False", "reason": "BuildFailed", "message": "boom"}]}
        }));
        let assessment = generic(&failing);
        assert_eq!(assessment.status, HealthStatus::Degraded);
        assert_eq!(assessment.message.as_deref(), Some("boom"));

        let suspended = manifest(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "w"},
            "spec": {"suspend": true}
        }));
        assert_eq!(generic(&suspended).status, HealthStatus::Suspended);
    }
}
