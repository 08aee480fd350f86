//! Risk evaluation from live readings
//!
//! Each rule is a pair of thresholds on heart rate and HRV, with an optional
//! stress floor. Rules are independent: every rule whose condition holds
//! contributes an alert, so one reading can raise several at once.

use serde::{Deserialize, Serialize};

use crate::models::{AthleteState, RiskAlert, RiskLevel};

/// A named alert condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRule {
    pub name: String,
    pub message: String,
    pub level: RiskLevel,

    /// Fires only when heart rate is strictly above this
    pub heart_rate_above: f64,

    /// Fires only when HRV is strictly below this
    pub hrv_below: f64,

    /// Optional extra condition on stress, strictly above
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stress_above: Option<f64>,
}

impl RiskRule {
    pub fn new(
        name: impl Into<String>,
        message: impl Into<String>,
        level: RiskLevel,
        heart_rate_above: f64,
        hrv_below: f64,
    ) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            level,
            heart_rate_above,
            hrv_below,
            stress_above: None,
        }
    }

    /// The standard alert table
    pub fn default_rules() -> Vec<RiskRule> {
        vec![
            RiskRule::new(
                "High Intensity Training",
                "Extended high-intensity activity detected. Monitor recovery.",
                RiskLevel::Medium,
                170.0,
                50.0,
            ),
            RiskRule::new(
                "Overtraining Risk",
                "Potential overtraining detected. Rest recommended.",
                RiskLevel::High,
                150.0,
                40.0,
            ),
            RiskRule::new(
                "Poor Recovery",
                "Poor recovery indicators. Consider rest day.",
                RiskLevel::High,
                80.0,
                30.0,
            ),
        ]
    }

    /// Whether the rule's condition holds for these readings
    pub fn matches(&self, state: &AthleteState) -> bool {
        state.heart_rate > self.heart_rate_above
            && state.hrv < self.hrv_below
            && self.stress_above.map_or(true, |s| state.stress_level > s)
    }

    fn alert(&self) -> RiskAlert {
        RiskAlert {
            name: self.name.clone(),
            message: self.message.clone(),
            level: self.level,
        }
    }
}

/// Stateless evaluator over a fixed rule table
#[derive(Debug, Clone, PartialEq)]
pub struct RiskEvaluator {
    rules: Vec<RiskRule>,
}

impl Default for RiskEvaluator {
    fn default() -> Self {
        Self::new(RiskRule::default_rules())
    }
}

impl RiskEvaluator {
    pub fn new(rules: Vec<RiskRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[RiskRule] {
        &self.rules
    }

    /// All alerts active for the given state, in table order
    pub fn evaluate(&self, state: &AthleteState) -> Vec<RiskAlert> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(state))
            .map(RiskRule::alert)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state_with(heart_rate: f64, hrv: f64) -> AthleteState {
        let mut state = AthleteState::baseline(Utc::now());
        state.heart_rate = heart_rate;
        state.hrv = hrv;
        state
    }

    fn names(alerts: &[RiskAlert]) -> Vec<&str> {
        alerts.iter().map(|a| a.name.as_str()).collect()
    }

    #[test]
    fn test_high_intensity_only() {
        let alerts = RiskEvaluator::default().evaluate(&state_with(175.0, 45.0));

        assert_eq!(names(&alerts), vec!["High Intensity Training"]);
        assert_eq!(alerts[0].level, RiskLevel::Medium);
    }

    #[test]
    fn test_rules_fire_together() {
        let alerts = RiskEvaluator::default().evaluate(&state_with(180.0, 25.0));

        assert_eq!(
            names(&alerts),
            vec!["High Intensity Training", "Overtraining Risk", "Poor Recovery"]
        );
    }

    #[test]
    fn test_poor_recovery_at_moderate_heart_rate() {
        let alerts = RiskEvaluator::default().evaluate(&state_with(90.0, 28.0));

        assert_eq!(names(&alerts), vec!["Poor Recovery"]);
        assert_eq!(alerts[0].level, RiskLevel::High);
    }

    #[test]
    fn test_thresholds_are_strict() {
        let evaluator = RiskEvaluator::default();
        assert!(evaluator.evaluate(&state_with(170.0, 49.0)).iter().all(|a| a.name != "High Intensity Training"));
        assert!(evaluator.evaluate(&state_with(80.0, 20.0)).is_empty());
        assert!(evaluator.evaluate(&state_with(70.0, 65.0)).is_empty());
    }

    #[test]
    fn test_stress_condition() {
        let mut rule = RiskRule::new("Stressed", "High stress at rest.", RiskLevel::Medium, 45.0, 100.0);
        rule.stress_above = Some(80.0);
        let evaluator = RiskEvaluator::new(vec![rule]);

        let mut state = state_with(70.0, 60.0);
        assert!(evaluator.evaluate(&state).is_empty());

        state.stress_level = 85.0;
        assert_eq!(evaluator.evaluate(&state).len(), 1);
    }

    #[test]
    fn test_evaluation_does_not_mutate() {
        let state = state_with(190.0, 20.0);
        let before = state.clone();
        let _ = RiskEvaluator::default().evaluate(&state);
        assert_eq!(state, before);
    }
}
