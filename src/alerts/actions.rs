//! Analyst playbook: suggested actions and alert text.

use crate::detect::rules::RuleResult;
use crate::detect::{ActionTier, CompositeRiskScore};
use crate::model::EntityRef;

use super::AlertType;

pub fn title(alert_type: AlertType) -> &'static str {
    match alert_type {
        AlertType::VelocityAttack => "Velocity Attack Detected",
        AlertType::GeographicAnomaly => "Geographic Anomaly Detected",
        AlertType::BiometricFailureSpike => "Biometric Failure Spike Detected",
        AlertType::OffHoursSpike => "Off-Hours Activity Spike",
        AlertType::ServiceProviderAnomaly => "Service Provider Anomaly Detected",
        AlertType::BehavioralAnomaly => "Behavioral Anomaly Detected",
    }
}

fn playbook(alert_type: AlertType, tier: ActionTier) -> Option<&'static [&'static str]> {
    use ActionTier::*;
    use AlertType::*;
    let actions: &'static [&'static str] = match (alert_type, tier) {
        (VelocityAttack, DeviceBlacklist) => &[
            "IMMEDIATE: Block device from further authentications",
            "Notify affected service providers",
            "Generate device abuse report",
            "Escalate to cybercrime team if pattern persists",
        ],
        (VelocityAttack, EnhancedReview) => &[
            "Flag device for enhanced monitoring",
            "Review authentication patterns over 48 hours",
            "Cross-reference with known fraud patterns",
        ],
        (VelocityAttack, MonitorOnly) => &[
            "Continue monitoring device activity",
            "Set alert if frequency increases",
        ],
        (GeographicAnomaly, EscalateRegional) => &[
            "Alert regional offices in affected states",
            "Coordinate investigation across regions",
            "Review cross-border authentication patterns",
        ],
        (GeographicAnomaly, EnhancedReview) => &[
            "Verify travel feasibility between locations",
            "Check for legitimate use cases (family/business)",
            "Monitor for 24-hour patterns",
        ],
        (GeographicAnomaly, MonitorOnly) => &[
            "Track geographic patterns",
            "Set threshold alerts for rapid movement",
        ],
        (BiometricFailureSpike, EnhancedReview) => &[
            "Investigate biometric quality indicators",
            "Check for device tampering signs",
            "Review OTP fallback patterns",
        ],
        (BiometricFailureSpike, MonitorOnly) => &[
            "Monitor biometric success rates",
            "Track fallback usage patterns",
        ],
        (OffHoursSpike, EnhancedReview) => &[
            "Verify legitimacy of night-time authentications",
            "Check for automated/scripted patterns",
            "Review service provider operational windows",
        ],
        (OffHoursSpike, MonitorOnly) => &["Track off-hours patterns", "Set alerts for volume spikes"],
        (ServiceProviderAnomaly, EscalateRegional) => &[
            "Notify the service provider's compliance contact",
            "Audit the provider's recent authentication volume by region",
        ],
        (ServiceProviderAnomaly, MonitorOnly) => &[
            "Track provider request volume",
            "Compare against the provider's category peers",
        ],
        (BehavioralAnomaly, MonitorOnly) => &[
            "Continue monitoring entity activity",
            "Review contributing metrics on the next evaluation",
        ],
        (_, ImmediateResponse) => &[
            "IMMEDIATE: Suspend authentications for the affected entity",
            "Open an incident with the security operations team",
            "Preserve evaluation evidence for investigation",
        ],
        _ => return None,
    };
    Some(actions)
}

/// Playbook entry for (type, tier), falling back to the type's MONITOR_ONLY list.
pub fn suggested_actions(alert_type: AlertType, tier: ActionTier) -> Vec<String> {
    playbook(alert_type, tier)
        .or_else(|| playbook(alert_type, ActionTier::MonitorOnly))
        .unwrap_or(&[])
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn description(entity: &EntityRef, score: &CompositeRiskScore, rules: &[RuleResult], deviation: f64) -> String {
    let mut lines = vec![
        format!("Risk: {} (composite {:.1})", score.severity.as_str(), score.composite),
        format!(
            "Confidence: {:.0}% | Action tier: {}",
            score.confidence * 100.0,
            score.action_tier.as_str()
        ),
        format!("Entity: {} {}", entity.entity_type(), abbreviate(entity.entity_id())),
    ];
    if deviation > 0.1 {
        lines.push(format!("Baseline deviation: {:.0}% from context norm", deviation * 100.0));
    }
    for r in rules.iter().filter(|r| r.triggered) {
        lines.push(format!("{}: {}", r.rule_id, r.explanation));
    }
    lines.push(format!(
        "Rule score {:.1}/100, anomaly score {:.1}/100{}",
        score.rule_score,
        score.anomaly_score,
        if score.rule_only { " (rules only)" } else { "" }
    ));
    lines.join("\n")
}

fn abbreviate(id: &str) -> String {
    if id.len() > 16 {
        format!("{}...", &id[..16])
    } else {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_falls_back_to_monitor_only() {
        let actions = suggested_actions(AlertType::BiometricFailureSpike, ActionTier::EscalateRegional);
        assert_eq!(actions, suggested_actions(AlertType::BiometricFailureSpike, ActionTier::MonitorOnly));
        assert!(!actions.is_empty());
    }

    #[test]
    fn test_every_type_has_actions() {
        for t in [
            AlertType::VelocityAttack,
            AlertType::GeographicAnomaly,
            AlertType::BiometricFailureSpike,
            AlertType::OffHoursSpike,
            AlertType::ServiceProviderAnomaly,
            AlertType::BehavioralAnomaly,
        ] {
            assert!(!suggested_actions(t, ActionTier::EnhancedReview).is_empty());
            assert!(!title(t).is_empty());
        }
        assert!(suggested_actions(AlertType::VelocityAttack, ActionTier::DeviceBlacklist)[0].starts_with("IMMEDIATE"));
    }
}
