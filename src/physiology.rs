//! Physiological signal model
//!
//! Every signal has its own update function taking the current value, the
//! elapsed time and a random source. [`PhysiologyModel`] composes them in a
//! fixed order: activity, heart rate, steps, sleep, stress, HRV, recovery,
//! hydration, calories. HRV and recovery read the values produced earlier in
//! the same tick, so the order matters.
//!
//! Clamped signals stay inside their [`SignalBounds`](crate::models::SignalBounds)
//! and the step and calorie counters never decrease, whatever the random draws.

use chrono::{DateTime, Utc};
use rand::{Rng, RngCore};

use crate::config::{ModelConfig, SleepConfig};
use crate::error::SimulationError;
use crate::models::{
    Activity, AthleteState, HEART_RATE_BOUNDS, HRV_BOUNDS, HYDRATION_BOUNDS, RECOVERY_BOUNDS,
    STRESS_BOUNDS,
};

/// Timing information for one tick of one athlete
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickContext {
    /// Wall-clock time of this tick
    pub now: DateTime<Utc>,

    /// Seconds since the athlete's previous tick
    pub elapsed_secs: f64,
}

impl TickContext {
    /// Context for a tick at `now` following one at `last_tick_at`
    pub fn between(last_tick_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let elapsed_secs = (now - last_tick_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self { now, elapsed_secs }
    }
}

/// Advances one athlete's state by one tick
///
/// Implementations must return a complete new state or an error; the engine
/// keeps the previous state untouched when an error comes back.
pub trait AthleteModel: Send + Sync {
    fn advance(
        &self,
        athlete_id: &str,
        state: &AthleteState,
        ctx: &TickContext,
        rng: &mut dyn RngCore,
    ) -> Result<AthleteState, SimulationError>;
}

/// The stochastic model driven by [`ModelConfig`] and [`SleepConfig`]
#[derive(Debug, Clone, Default)]
pub struct PhysiologyModel {
    model: ModelConfig,
    sleep: SleepConfig,
}

impl PhysiologyModel {
    pub fn new(model: ModelConfig, sleep: SleepConfig) -> Self {
        Self { model, sleep }
    }
}

impl AthleteModel for PhysiologyModel {
    fn advance(
        &self,
        _athlete_id: &str,
        state: &AthleteState,
        ctx: &TickContext,
        rng: &mut dyn RngCore,
    ) -> Result<AthleteState, SimulationError> {
        if !ctx.elapsed_secs.is_finite() {
            return Err(SimulationError::InvalidElapsed {
                seconds: ctx.elapsed_secs,
            });
        }
        let elapsed = ctx.elapsed_secs.max(0.0);
        let cfg = &self.model;
        let mut next = state.clone();

        let activity = next_activity(state.current_activity, cfg.activity_change_probability, rng);
        if activity == state.current_activity {
            next.activity_elapsed += elapsed;
        } else {
            next.current_activity = activity;
            next.activity_elapsed = 0.0;
        }

        next.heart_rate = next_heart_rate(next.heart_rate, activity, next.stress_level, cfg, rng);
        next.step_count += step_increment(activity, elapsed, rng);

        let local_hour = self.sleep.local_hour(ctx.now);
        let sleep = next_sleep(
            SleepState::of(&next),
            local_hour,
            ctx.now,
            &self.sleep,
            rng,
        );
        sleep.apply(&mut next);

        next.stress_level = next_stress(next.stress_level, activity, next.is_sleeping, cfg, rng);
        next.hrv = next_hrv(next.heart_rate, next.stress_level, next.sleep_hours, cfg.hrv_noise, rng);
        next.recovery_score = next_recovery(
            next.hrv,
            next.sleep_hours,
            next.stress_level,
            cfg.recovery_noise,
            rng,
        );
        next.hydration_level = next_hydration(next.hydration_level, activity, elapsed, cfg, rng);
        next.calories_burned += calorie_increment(activity, elapsed, cfg.body_mass_kg);
        next.last_tick_at = ctx.now;

        ensure_finite(&next)?;
        Ok(next)
    }
}

fn ensure_finite(state: &AthleteState) -> Result<(), SimulationError> {
    for (signal, value) in [
        ("heart_rate", state.heart_rate),
        ("step_count", state.step_count),
        ("hrv", state.hrv),
        ("sleep_hours", state.sleep_hours),
        ("stress_level", state.stress_level),
        ("recovery_score", state.recovery_score),
        ("hydration_level", state.hydration_level),
        ("calories_burned", state.calories_burned),
        ("activity_elapsed", state.activity_elapsed),
    ] {
        if !value.is_finite() {
            return Err(SimulationError::NonFinite { signal, value });
        }
    }
    Ok(())
}

/// Uniform draw from an inclusive range; a degenerate range yields its lower end
fn uniform<R: Rng + ?Sized>(rng: &mut R, (lo, hi): (f64, f64)) -> f64 {
    if lo < hi {
        rng.gen_range(lo..=hi)
    } else {
        lo
    }
}

fn noise<R: Rng + ?Sized>(rng: &mut R, amplitude: f64) -> f64 {
    let a = amplitude.abs();
    uniform(rng, (-a, a))
}

fn chance<R: Rng + ?Sized>(rng: &mut R, probability: f64) -> bool {
    rng.gen::<f64>() < probability
}

/// Occasionally switch to one of the other activities
pub fn next_activity<R: Rng + ?Sized>(current: Activity, probability: f64, rng: &mut R) -> Activity {
    if !chance(rng, probability) {
        return current;
    }
    let others: Vec<Activity> = Activity::ALL
        .iter()
        .copied()
        .filter(|a| *a != current)
        .collect();
    others[rng.gen_range(0..others.len())]
}

/// Move a fifth of the way toward a sampled activity target
///
/// The target carries an occasional spike and a stress bias.
pub fn next_heart_rate<R: Rng + ?Sized>(
    current: f64,
    activity: Activity,
    stress: f64,
    cfg: &ModelConfig,
    rng: &mut R,
) -> f64 {
    let mut target = uniform(rng, activity.profile().heart_rate_range);
    if chance(rng, cfg.spike_probability) {
        target += uniform(rng, cfg.spike_range);
    }
    target += stress / 100.0 * cfg.stress_heart_rate_gain;

    let change = (target - current) * cfg.heart_rate_approach + noise(rng, cfg.heart_rate_noise);
    HEART_RATE_BOUNDS.clamp(current + change)
}

/// Steps taken over `elapsed_secs` at a sampled cadence
pub fn step_increment<R: Rng + ?Sized>(activity: Activity, elapsed_secs: f64, rng: &mut R) -> f64 {
    let cadence = uniform(rng, activity.profile().cadence_range);
    (cadence * (elapsed_secs / 60.0)).max(0.0)
}

/// Sleep-related fields, kept together so the session invariant holds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SleepState {
    pub is_sleeping: bool,
    pub session_start: Option<DateTime<Utc>>,
    pub sleep_hours: f64,
}

impl SleepState {
    pub fn of(state: &AthleteState) -> Self {
        Self {
            is_sleeping: state.is_sleeping,
            session_start: state.sleep_session_start,
            sleep_hours: state.sleep_hours,
        }
    }

    pub fn apply(self, state: &mut AthleteState) {
        state.is_sleeping = self.is_sleeping;
        state.sleep_session_start = self.session_start;
        state.sleep_hours = self.sleep_hours;
    }
}

/// Fall asleep in the evening window, wake in the morning window
///
/// Waking records the finished session length in `sleep_hours`.
pub fn next_sleep<R: Rng + ?Sized>(
    current: SleepState,
    local_hour: u32,
    now: DateTime<Utc>,
    cfg: &SleepConfig,
    rng: &mut R,
) -> SleepState {
    if !current.is_sleeping {
        if cfg.evening_window.contains(local_hour) && chance(rng, cfg.transition_probability) {
            return SleepState {
                is_sleeping: true,
                session_start: Some(now),
                sleep_hours: 0.0,
            };
        }
        return SleepState {
            session_start: None,
            ..current
        };
    }

    if cfg.morning_window.contains(local_hour) && chance(rng, cfg.transition_probability) {
        let started = current.session_start.unwrap_or(now);
        let hours = (now - started)
            .to_std()
            .map(|d| d.as_secs_f64() / 3600.0)
            .unwrap_or(0.0);
        return SleepState {
            is_sleeping: false,
            session_start: None,
            sleep_hours: hours,
        };
    }

    SleepState {
        session_start: current.session_start.or(Some(now)),
        ..current
    }
}

/// Drift a tenth of the way toward the activity's stress pressure
pub fn next_stress<R: Rng + ?Sized>(
    current: f64,
    activity: Activity,
    is_sleeping: bool,
    cfg: &ModelConfig,
    rng: &mut R,
) -> f64 {
    let mut pressure = activity.profile().stress_delta + noise(rng, cfg.stress_noise);
    if is_sleeping {
        pressure -= cfg.sleeping_stress_relief;
    }
    STRESS_BOUNDS.clamp(current + pressure * cfg.stress_approach)
}

/// HRV derived from heart rate, stress and last night's sleep
pub fn next_hrv<R: Rng + ?Sized>(
    heart_rate: f64,
    stress: f64,
    sleep_hours: f64,
    noise_amplitude: f64,
    rng: &mut R,
) -> f64 {
    let hrv = 100.0 - heart_rate * 0.3 - stress * 0.2 + sleep_hours * 2.0;
    HRV_BOUNDS.clamp(hrv + noise(rng, noise_amplitude))
}

/// Mean of HRV, capped sleep credit and inverse stress
pub fn next_recovery<R: Rng + ?Sized>(
    hrv: f64,
    sleep_hours: f64,
    stress: f64,
    noise_amplitude: f64,
    rng: &mut R,
) -> f64 {
    let sleep_factor = (sleep_hours * 10.0).min(80.0);
    let score = (hrv + sleep_factor + (100.0 - stress)) / 3.0;
    RECOVERY_BOUNDS.clamp(score + noise(rng, noise_amplitude))
}

/// Activity-dependent water loss with the occasional drink
pub fn next_hydration<R: Rng + ?Sized>(
    current: f64,
    activity: Activity,
    elapsed_secs: f64,
    cfg: &ModelConfig,
    rng: &mut R,
) -> f64 {
    let mut level = current;
    if chance(rng, cfg.hydration_event_probability) {
        level = (level + uniform(rng, cfg.hydration_gain)).min(HYDRATION_BOUNDS.max);
    }
    let loss = activity.profile().dehydration_per_hour * (elapsed_secs / 3600.0);
    HYDRATION_BOUNDS.clamp(level - loss)
}

/// kcal burned over `elapsed_secs`
pub fn calorie_increment(activity: Activity, elapsed_secs: f64, body_mass_kg: f64) -> f64 {
    let per_minute = activity.profile().met * 3.5 * body_mass_kg / 200.0;
    (per_minute * (elapsed_secs / 60.0)).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn utc_sleep() -> SleepConfig {
        SleepConfig {
            utc_offset_minutes: Some(0),
            ..SleepConfig::default()
        }
    }

    fn model() -> PhysiologyModel {
        PhysiologyModel::new(ModelConfig::default(), utc_sleep())
    }

    #[test]
    fn test_activity_change_always_differs() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let next = next_activity(Activity::Running, 1.0, &mut rng);
            assert_ne!(next, Activity::Running);
        }
        assert_eq!(next_activity(Activity::Walking, 0.0, &mut rng), Activity::Walking);
    }

    #[test]
    fn test_heart_rate_approaches_activity_range() {
        let cfg = ModelConfig {
            spike_probability: 0.0,
            heart_rate_noise: 0.0,
            stress_heart_rate_gain: 0.0,
            ..ModelConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let mut hr = 70.0;
        for _ in 0..100 {
            hr = next_heart_rate(hr, Activity::Running, 0.0, &cfg, &mut rng);
        }
        assert!((139.0..=181.0).contains(&hr), "hr = {}", hr);
    }

    #[test]
    fn test_heart_rate_clamped() {
        let cfg = ModelConfig {
            spike_probability: 1.0,
            ..ModelConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let hr = next_heart_rate(199.0, Activity::Running, 100.0, &cfg, &mut rng);
        assert!(hr <= 200.0);

        let hr = next_heart_rate(45.0, Activity::Resting, 0.0, &ModelConfig::default(), &mut rng);
        assert!(hr >= 45.0);
    }

    #[test]
    fn test_step_increment_scales_with_time() {
        let mut rng = StdRng::seed_from_u64(2);
        let steps = step_increment(Activity::Running, 60.0, &mut rng);
        assert!((150.0..=180.0).contains(&steps));
        assert_eq!(step_increment(Activity::Running, 0.0, &mut rng), 0.0);
    }

    #[test]
    fn test_stress_targets() {
        let cfg = ModelConfig {
            stress_noise: 0.0,
            ..ModelConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(4);
        assert_eq!(next_stress(50.0, Activity::Resting, false, &cfg, &mut rng), 49.5);
        assert_eq!(next_stress(50.0, Activity::Walking, false, &cfg, &mut rng), 50.0);
        assert_eq!(next_stress(50.0, Activity::Running, false, &cfg, &mut rng), 51.0);
        assert_eq!(next_stress(50.0, Activity::Workout, false, &cfg, &mut rng), 51.5);
        assert_eq!(next_stress(50.0, Activity::Resting, true, &cfg, &mut rng), 48.5);
        assert_eq!(next_stress(0.2, Activity::Resting, true, &cfg, &mut rng), 0.0);
    }

    #[test]
    fn test_hrv_and_recovery_formulas() {
        let mut rng = StdRng::seed_from_u64(5);
        // 100 - 21 - 10 + 16 = 85
        assert!((next_hrv(70.0, 50.0, 8.0, 0.0, &mut rng) - 85.0).abs() < 1e-9);
        assert_eq!(next_hrv(200.0, 100.0, 0.0, 0.0, &mut rng), 20.0);

        // sleep credit capped at 80
        let score = next_recovery(70.0, 12.0, 40.0, 0.0, &mut rng);
        assert!((score - (70.0 + 80.0 + 60.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_hydration_loss_per_hour() {
        let cfg = ModelConfig {
            hydration_event_probability: 0.0,
            ..ModelConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(6);
        let level = next_hydration(100.0, Activity::Running, 3600.0, &cfg, &mut rng);
        assert!((level - 97.0).abs() < 1e-9);
        assert_eq!(next_hydration(0.1, Activity::Running, 3600.0, &cfg, &mut rng), 0.0);
    }

    #[test]
    fn test_calories_use_met() {
        // running: 8 * 3.5 * 70 / 200 = 9.8 kcal/min
        assert!((calorie_increment(Activity::Running, 60.0, 70.0) - 9.8).abs() < 1e-9);
        assert_eq!(calorie_increment(Activity::Resting, 0.0, 70.0), 0.0);
    }

    #[test]
    fn test_sleep_session_lifecycle() {
        let cfg = SleepConfig {
            transition_probability: 1.0,
            ..utc_sleep()
        };
        let mut rng = StdRng::seed_from_u64(8);
        let evening = Utc.with_ymd_and_hms(2024, 5, 1, 22, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
        let morning = evening + Duration::hours(8) + Duration::minutes(30);

        let awake = SleepState {
            is_sleeping: false,
            session_start: None,
            sleep_hours: 6.0,
        };
        assert_eq!(next_sleep(awake, 12, noon, &cfg, &mut rng), awake);

        let asleep = next_sleep(awake, 22, evening, &cfg, &mut rng);
        assert!(asleep.is_sleeping);
        assert_eq!(asleep.session_start, Some(evening));
        assert_eq!(asleep.sleep_hours, 0.0);

        // still asleep outside the morning window
        assert_eq!(next_sleep(asleep, 3, evening, &cfg, &mut rng), asleep);

        let woke = next_sleep(asleep, 6, morning, &cfg, &mut rng);
        assert!(!woke.is_sleeping);
        assert!(woke.session_start.is_none());
        assert!((woke.sleep_hours - 8.5).abs() < 1e-9);
    }

    #[test]
    fn test_advance_rejects_non_finite_elapsed() {
        let mut rng = StdRng::seed_from_u64(9);
        let now = Utc::now();
        let state = AthleteState::baseline(now);
        let ctx = TickContext {
            now,
            elapsed_secs: f64::NAN,
        };
        assert!(matches!(
            model().advance("A1", &state, &ctx, &mut rng),
            Err(SimulationError::InvalidElapsed { .. })
        ));
    }

    #[test]
    fn test_advance_one_second_from_baseline() {
        let mut rng = StdRng::seed_from_u64(10);
        let start = Utc::now();
        let state = AthleteState::baseline(start);
        let now = start + Duration::seconds(1);

        let next = model()
            .advance("A1", &state, &TickContext::between(start, now), &mut rng)
            .unwrap();

        assert!(next.invariant_violations().is_empty());
        assert!(next.step_count >= 0.0);
        assert_eq!(next.last_tick_at, now);
    }

    #[test]
    fn test_tick_context_ignores_clock_going_backwards() {
        let now = Utc::now();
        let ctx = TickContext::between(now, now - Duration::seconds(5));
        assert_eq!(ctx.elapsed_secs, 0.0);
    }

    proptest! {
        #[test]
        fn test_invariants_hold_over_many_ticks(
            seed in any::<u64>(),
            start_hour in 0u32..24,
            ticks in 1usize..300,
            step_secs in 0.0f64..7200.0,
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let model = PhysiologyModel::new(
                ModelConfig::default(),
                SleepConfig { transition_probability: 0.5, ..utc_sleep() },
            );
            let start = Utc.with_ymd_and_hms(2024, 6, 1, start_hour, 0, 0).unwrap();
            let mut state = AthleteState::baseline(start);

            for _ in 0..ticks {
                let now = state.last_tick_at + Duration::milliseconds((step_secs * 1000.0) as i64);
                let ctx = TickContext::between(state.last_tick_at, now);
                let next = model.advance("A1", &state, &ctx, &mut rng).unwrap();

                prop_assert!(next.invariant_violations().is_empty(), "{:?}", next.invariant_violations());
                prop_assert!(next.step_count >= state.step_count);
                prop_assert!(next.calories_burned >= state.calories_burned);
                prop_assert_eq!(next.is_sleeping, next.sleep_session_start.is_some());
                state = next;
            }
        }

        #[test]
        fn test_extreme_start_values_are_pulled_into_bounds(
            seed in any::<u64>(),
            heart_rate in 45.0f64..=200.0,
            stress in 0.0f64..=100.0,
            hydration in 0.0f64..=100.0,
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let now = Utc::now();
            let mut state = AthleteState::baseline(now);
            state.heart_rate = heart_rate;
            state.stress_level = stress;
            state.hydration_level = hydration;

            let ctx = TickContext { now, elapsed_secs: 1.0 };
            let next = model().advance("A1", &state, &ctx, &mut rng).unwrap();
            prop_assert!(next.invariant_violations().is_empty());
        }
    }
}
