use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a simulated athlete is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Resting,
    Walking,
    Running,
    Workout,
}

impl Activity {
    /// Every activity, in table order
    pub const ALL: [Activity; 4] = [
        Activity::Resting,
        Activity::Walking,
        Activity::Running,
        Activity::Workout,
    ];

    /// Wire name of the activity
    pub fn as_str(&self) -> &'static str {
        match self {
            Activity::Resting => "resting",
            Activity::Walking => "walking",
            Activity::Running => "running",
            Activity::Workout => "workout",
        }
    }

    /// Physiological profile driving the model while in this activity
    pub fn profile(&self) -> ActivityProfile {
        match self {
            Activity::Resting => ActivityProfile {
                heart_rate_range: (60.0, 75.0),
                cadence_range: (0.0, 5.0),
                stress_delta: -5.0,
                dehydration_per_hour: 0.5,
                met: 1.0,
            },
            Activity::Walking => ActivityProfile {
                heart_rate_range: (75.0, 100.0),
                cadence_range: (85.0, 110.0),
                stress_delta: 0.0,
                dehydration_per_hour: 1.0,
                met: 3.5,
            },
            Activity::Running => ActivityProfile {
                heart_rate_range: (140.0, 180.0),
                cadence_range: (150.0, 180.0),
                stress_delta: 10.0,
                dehydration_per_hour: 3.0,
                met: 8.0,
            },
            Activity::Workout => ActivityProfile {
                heart_rate_range: (120.0, 160.0),
                cadence_range: (30.0, 60.0),
                stress_delta: 15.0,
                dehydration_per_hour: 2.5,
                met: 6.0,
            },
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Activity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "resting" => Ok(Activity::Resting),
            "walking" => Ok(Activity::Walking),
            "running" => Ok(Activity::Running),
            "workout" => Ok(Activity::Workout),
            _ => Err(format!("Invalid activity: {}", s)),
        }
    }
}

/// Per-activity targets and rates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityProfile {
    /// Target heart rate range in bpm
    pub heart_rate_range: (f64, f64),

    /// Step cadence range in steps per minute
    pub cadence_range: (f64, f64),

    /// Stress pressure applied each tick
    pub stress_delta: f64,

    /// Hydration units lost per hour
    pub dehydration_per_hour: f64,

    /// Metabolic equivalent of task
    pub met: f64,
}

/// Inclusive bounds for a clamped signal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalBounds {
    pub min: f64,
    pub max: f64,
}

impl SignalBounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

pub const HEART_RATE_BOUNDS: SignalBounds = SignalBounds::new(45.0, 200.0);
pub const HRV_BOUNDS: SignalBounds = SignalBounds::new(20.0, 100.0);
pub const STRESS_BOUNDS: SignalBounds = SignalBounds::new(0.0, 100.0);
pub const RECOVERY_BOUNDS: SignalBounds = SignalBounds::new(0.0, 100.0);
pub const HYDRATION_BOUNDS: SignalBounds = SignalBounds::new(0.0, 100.0);

/// Live physiological state of one tracked athlete
///
/// Owned by the engine while the athlete is tracked. Only the tick loop
/// writes it; everyone else reads an [`AthleteSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AthleteState {
    /// Heart rate in bpm, within [`HEART_RATE_BOUNDS`]
    pub heart_rate: f64,

    /// Accumulated steps; fractional internally, never decreases
    pub step_count: f64,

    /// Heart rate variability, within [`HRV_BOUNDS`]
    pub hrv: f64,

    /// Duration of the last completed sleep session in hours
    pub sleep_hours: f64,

    /// Whether a sleep session is in progress
    pub is_sleeping: bool,

    /// Start of the current sleep session; present iff `is_sleeping`
    pub sleep_session_start: Option<DateTime<Utc>>,

    /// Stress level 0-100
    pub stress_level: f64,

    /// Recovery score 0-100
    pub recovery_score: f64,

    /// Hydration level 0-100
    pub hydration_level: f64,

    /// Accumulated kcal; never decreases
    pub calories_burned: f64,

    pub current_activity: Activity,

    /// Seconds spent continuously in `current_activity`
    pub activity_elapsed: f64,

    /// When this state was last advanced
    pub last_tick_at: DateTime<Utc>,
}

impl AthleteState {
    /// Baseline state for a newly tracked athlete
    pub fn baseline(now: DateTime<Utc>) -> Self {
        Self {
            heart_rate: 70.0,
            step_count: 0.0,
            hrv: 65.0,
            sleep_hours: 0.0,
            is_sleeping: false,
            sleep_session_start: None,
            stress_level: 50.0,
            recovery_score: 85.0,
            hydration_level: 100.0,
            calories_burned: 0.0,
            current_activity: Activity::Resting,
            activity_elapsed: 0.0,
            last_tick_at: now,
        }
    }

    /// Point-in-time view with wire rounding applied
    pub fn snapshot(&self) -> AthleteSnapshot {
        AthleteSnapshot {
            heart_rate: round_to_int(self.heart_rate) as u16,
            hrv: round_to_int(self.hrv) as u16,
            steps: self.step_count.trunc() as u64,
            sleep_hours: round_to_tenth(self.sleep_hours),
            activity: self.current_activity,
            calories_burned: self.calories_burned.trunc() as u64,
            stress_level: round_to_int(self.stress_level) as u8,
            recovery_score: round_to_int(self.recovery_score) as u8,
            hydration_level: round_to_int(self.hydration_level) as u8,
            is_sleeping: self.is_sleeping,
        }
    }

    /// Names of every invariant the state currently breaks
    pub fn invariant_violations(&self) -> Vec<&'static str> {
        let mut violations = Vec::new();
        if !HEART_RATE_BOUNDS.contains(self.heart_rate) {
            violations.push("heart_rate");
        }
        if !HRV_BOUNDS.contains(self.hrv) {
            violations.push("hrv");
        }
        if !STRESS_BOUNDS.contains(self.stress_level) {
            violations.push("stress_level");
        }
        if !RECOVERY_BOUNDS.contains(self.recovery_score) {
            violations.push("recovery_score");
        }
        if !HYDRATION_BOUNDS.contains(self.hydration_level) {
            violations.push("hydration_level");
        }
        if self.is_sleeping != self.sleep_session_start.is_some() {
            violations.push("sleep_session_start");
        }
        if self.step_count.is_nan() || self.step_count < 0.0 {
            violations.push("step_count");
        }
        if self.calories_burned.is_nan() || self.calories_burned < 0.0 {
            violations.push("calories_burned");
        }
        violations
    }
}

/// Python-compatible rounding: ties go to the even neighbour
fn round_to_int(value: f64) -> f64 {
    value.round_ties_even()
}

fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round_ties_even() / 10.0
}

/// Risk alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// Alert produced for a single tick; never stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAlert {
    pub name: String,
    pub message: String,
    pub level: RiskLevel,
}

/// Rounded, serializable view of an athlete's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AthleteSnapshot {
    pub heart_rate: u16,
    pub hrv: u16,
    pub steps: u64,
    /// Hours, one decimal place
    pub sleep_hours: f64,
    pub activity: Activity,
    pub calories_burned: u64,
    pub stress_level: u8,
    pub recovery_score: u8,
    pub hydration_level: u8,
    pub is_sleeping: bool,
}

/// Snapshot fields plus the alerts active for this tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickData {
    #[serde(flatten)]
    pub snapshot: AthleteSnapshot,
    pub risks: Vec<RiskAlert>,
}

/// Update pushed to observers once per athlete per tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickEvent {
    pub athlete_id: String,
    pub data: TickData,
}

impl TickEvent {
    pub fn new(athlete_id: impl Into<String>, state: &AthleteState, risks: Vec<RiskAlert>) -> Self {
        Self {
            athlete_id: athlete_id.into(),
            data: TickData {
                snapshot: state.snapshot(),
                risks,
            },
        }
    }

    pub fn snapshot(&self) -> &AthleteSnapshot {
        &self.data.snapshot
    }

    pub fn risks(&self) -> &[RiskAlert] {
        &self.data.risks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_snapshot() {
        let state = AthleteState::baseline(Utc::now());
        let snapshot = state.snapshot();

        assert_eq!(snapshot.heart_rate, 70);
        assert_eq!(snapshot.hrv, 65);
        assert_eq!(snapshot.recovery_score, 85);
        assert_eq!(snapshot.hydration_level, 100);
        assert_eq!(snapshot.stress_level, 50);
        assert_eq!(snapshot.activity, Activity::Resting);
        assert_eq!(snapshot.steps, 0);
        assert_eq!(snapshot.calories_burned, 0);
        assert!(!snapshot.is_sleeping);
        assert!(state.invariant_violations().is_empty());
    }

    #[test]
    fn test_snapshot_rounding() {
        let mut state = AthleteState::baseline(Utc::now());
        state.heart_rate = 72.5;
        state.hrv = 64.6;
        state.step_count = 12.99;
        state.calories_burned = 4.7;
        state.sleep_hours = 7.46;
        state.stress_level = 33.5;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.heart_rate, 72);
        assert_eq!(snapshot.hrv, 65);
        assert_eq!(snapshot.steps, 12);
        assert_eq!(snapshot.calories_burned, 4);
        assert_eq!(snapshot.sleep_hours, 7.5);
        assert_eq!(snapshot.stress_level, 34);
    }

    #[test]
    fn test_invariant_violations() {
        let mut state = AthleteState::baseline(Utc::now());
        state.heart_rate = 210.0;
        state.is_sleeping = true;

        let violations = state.invariant_violations();
        assert!(violations.contains(&"heart_rate"));
        assert!(violations.contains(&"sleep_session_start"));
    }

    #[test]
    fn test_activity_parsing() {
        assert_eq!("running".parse::<Activity>().unwrap(), Activity::Running);
        assert_eq!("Workout".parse::<Activity>().unwrap(), Activity::Workout);
        assert!("swimming".parse::<Activity>().is_err());
    }

    #[test]
    fn test_tick_event_wire_format() {
        let state = AthleteState::baseline(Utc::now());
        let event = TickEvent::new(
            "A1",
            &state,
            vec![RiskAlert {
                name: "Poor Recovery".to_string(),
                message: "Consider rest day.".to_string(),
                level: RiskLevel::High,
            }],
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["athlete_id"], "A1");
        assert_eq!(json["data"]["heart_rate"], 70);
        assert_eq!(json["data"]["activity"], "resting");
        assert_eq!(json["data"]["is_sleeping"], false);
        assert_eq!(json["data"]["risks"][0]["level"], "high");
    }
}
