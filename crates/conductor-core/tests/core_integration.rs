#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::*;

fn busy_host() -> SystemResources {
    SystemResources {
        cpu: CpuUsage {
            usage_percent: 92.5,
            cores: 8,
        },
        memory: MemoryUsage {
            total_mb: 16_384,
            used_mb: 15_000,
            available_mb: 1_384,
            usage_percent: 91.6,
        },
        active_background_agents: 3,
    }
}

// ---------------------------------------------------------------------------
// 1. Admission verdict serialization
// ---------------------------------------------------------------------------

#[test]
fn test_rejection_serializes_with_snake_case_kind() {
    let check = ResourceCheckResult::rejected(
        RejectionKind::CpuThreshold,
        "CPU usage 92.5% exceeds threshold 80.0%",
        "Wait for running tasks to finish",
        busy_host(),
    );
    let json = serde_json::to_value(&check).unwrap();
    assert_eq!(json["can_execute"], false);
    assert_eq!(json["rejection"], "cpu_threshold");
    assert_eq!(json["resources"]["memory"]["available_mb"], 1_384);

    let back: ResourceCheckResult = serde_json::from_value(json).unwrap();
    assert_eq!(back, check);
}

#[test]
fn test_allowed_verdict_has_no_reason() {
    let check = ResourceCheckResult::allowed(SystemResources::default());
    assert!(check.can_execute);
    assert!(check.wait_is_viable());
    assert!(check.reason.is_none() && check.suggestion.is_none());
}

// ---------------------------------------------------------------------------
// 2. Waiting is only viable for transient rejections
// ---------------------------------------------------------------------------

#[test]
fn test_wait_viability_by_kind() {
    let verdict = |kind| ResourceCheckResult::rejected(kind, "r", "s", busy_host());
    for kind in [
        RejectionKind::AgentLimit,
        RejectionKind::CpuThreshold,
        RejectionKind::MemoryThreshold,
        RejectionKind::CpuHeadroom,
        RejectionKind::MemoryHeadroom,
    ] {
        assert!(verdict(kind).wait_is_viable(), "{kind}");
    }
    assert!(!verdict(RejectionKind::ExceedsCapacity).wait_is_viable());
}

// ---------------------------------------------------------------------------
// 3. Error taxonomy
// ---------------------------------------------------------------------------

#[test]
fn test_error_messages() {
    let io = ConductorError::from(std::io::Error::other("disk gone"));
    assert!(io.to_string().contains("disk gone"));

    let json = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    assert!(matches!(ConductorError::from(json), ConductorError::Json(_)));

    let wait = ConductorError::SlotWaitTimeout {
        kind: "e2e".into(),
        orchestrator_id: "nightly".into(),
        waited_ms: 300_000,
    };
    assert_eq!(
        wait.to_string(),
        "Timed out after 300000ms waiting for a e2e slot for orchestrator 'nightly'"
    );
}

// ---------------------------------------------------------------------------
// 4. Redaction keeps lines correlatable
// ---------------------------------------------------------------------------

#[test]
fn test_same_secret_same_digest() {
    let a = redact_secrets("first failure api_key=abc123def456ghi789");
    let b = redact_secrets("second failure api_key=abc123def456ghi789");
    let tag = |s: &str| s[s.find("[REDACTED:").unwrap()..].to_string();
    assert_eq!(tag(&a), tag(&b));
    assert!(!a.contains("abc123def456ghi789"));
}
