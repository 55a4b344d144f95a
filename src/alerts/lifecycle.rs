//! Alert state machine.

use chrono::{DateTime, Utc};

use super::{Alert, AlertError, AlertStatus, FeedbackInput};

/// The only legal moves. RESOLVED is terminal.
const TRANSITIONS: &[(AlertStatus, AlertStatus)] = &[
    (AlertStatus::Active, AlertStatus::Acknowledged),
    (AlertStatus::Active, AlertStatus::Resolved),
    (AlertStatus::Acknowledged, AlertStatus::Resolved),
];

pub fn can_transition(from: AlertStatus, to: AlertStatus) -> bool {
    TRANSITIONS.contains(&(from, to))
}

pub fn apply_transition(alert: &mut Alert, to: AlertStatus, actor: &str, now: DateTime<Utc>) -> Result<(), AlertError> {
    if !can_transition(alert.status, to) {
        return Err(AlertError::IllegalTransition { from: alert.status, to });
    }
    match to {
        AlertStatus::Acknowledged => {
            alert.acknowledged_at = Some(now);
            alert.acknowledged_by = Some(actor.to_string());
        }
        AlertStatus::Resolved => alert.resolved_at = Some(now),
        AlertStatus::Active => {}
    }
    alert.status = to;
    alert.updated_at = now;
    Ok(())
}

/// Feedback is write-once and closed after resolution.
pub fn apply_feedback(alert: &mut Alert, input: &FeedbackInput, now: DateTime<Utc>) -> Result<(), AlertError> {
    if alert.status == AlertStatus::Resolved {
        return Err(AlertError::FeedbackOnResolved(alert.id.clone()));
    }
    if alert.feedback.is_some() {
        return Err(AlertError::FeedbackAlreadyRecorded(alert.id.clone()));
    }
    if let Some(c) = input.analyst_confidence {
        if !(0.0..=1.0).contains(&c) || c.is_nan() {
            return Err(AlertError::InvalidConfidence(c));
        }
    }
    alert.feedback = Some(input.feedback);
    alert.analyst_confidence = input.analyst_confidence;
    alert.feedback_notes = input.notes.clone();
    alert.feedback_by = Some(input.analyst.clone());
    alert.feedback_at = Some(now);
    alert.updated_at = now;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::repository::test_support::sample_alert;
    use crate::alerts::Feedback;

    fn feedback(confidence: Option<f64>) -> FeedbackInput {
        FeedbackInput {
            feedback: Feedback::FalsePositive,
            analyst_confidence: confidence,
            notes: Some("known kiosk".into()),
            analyst: "analyst-1".into(),
        }
    }

    #[test]
    fn test_transition_table() {
        use AlertStatus::*;
        let all = [Active, Acknowledged, Resolved];
        for from in all {
            for to in all {
                let expected = matches!(
                    (from, to),
                    (Active, Acknowledged) | (Active, Resolved) | (Acknowledged, Resolved)
                );
                assert_eq!(can_transition(from, to), expected, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_acknowledge_then_resolve() {
        let now = Utc::now();
        let mut alert = sample_alert("ALR-00000001", now);
        apply_transition(&mut alert, AlertStatus::Acknowledged, "analyst-1", now).unwrap();
        assert_eq!(alert.acknowledged_by.as_deref(), Some("analyst-1"));
        apply_transition(&mut alert, AlertStatus::Resolved, "analyst-1", now).unwrap();
        assert!(alert.resolved_at.is_some());

        let err = apply_transition(&mut alert, AlertStatus::Active, "analyst-1", now).unwrap_err();
        assert!(matches!(err, AlertError::IllegalTransition { .. }));
    }

    #[test]
    fn test_feedback_rules() {
        let now = Utc::now();
        let mut alert = sample_alert("ALR-00000002", now);
        assert!(matches!(
            apply_feedback(&mut alert, &feedback(Some(1.5)), now),
            Err(AlertError::InvalidConfidence(_))
        ));
        apply_feedback(&mut alert, &feedback(Some(0.9)), now).unwrap();
        assert_eq!(alert.feedback, Some(Feedback::FalsePositive));
        assert!(matches!(
            apply_feedback(&mut alert, &feedback(None), now),
            Err(AlertError::FeedbackAlreadyRecorded(_))
        ));

        let mut resolved = sample_alert("ALR-00000003", now);
        apply_transition(&mut resolved, AlertStatus::Resolved, "a", now).unwrap();
        assert!(matches!(
            apply_feedback(&mut resolved, &feedback(None), now),
            Err(AlertError::FeedbackOnResolved(_))
        ));
    }
}
