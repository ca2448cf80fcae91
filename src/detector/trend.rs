//! Trend confirmation: the anti-flap persistence test run before any
//! incident is opened.

use super::eval::RuleObservation;

/// Fraction of trafficked sub-windows that must individually satisfy the
/// rule before the signal counts as persistent.
const PERSISTENCE_RATIO: f64 = 0.6;

/// A firing rule only opens an incident when the signal is persistent:
///
/// - the condition held in >= 60% of sub-windows containing traffic,
/// - the window's adverse-outcome count reached the configured floor
///   (rate metrics only; volume has no adverse outcome), and
/// - the condition held somewhere before the most recent minute, so a
///   single fresh spike is ignored. Single-minute windows are exempt,
///   otherwise they could never confirm.
pub fn confirmed(observation: &RuleObservation, min_adverse: u64) -> bool {
    let samples = &observation.samples;
    let trafficked = samples.iter().filter(|s| s.trafficked).count();
    if trafficked == 0 {
        return false;
    }

    let holding = samples.iter().filter(|s| s.holds).count();
    if (holding as f64) < PERSISTENCE_RATIO * trafficked as f64 {
        return false;
    }

    if observation.window_minutes > 1 {
        let holds_before_last = samples[..samples.len() - 1].iter().any(|s| s.holds);
        if !holds_before_last {
            return false;
        }
    }

    // Volume rules run on a single-minute window and carry no adverse
    // outcome; the floor only binds the multi-minute rate windows.
    if observation.window_minutes > 1 && observation.adverse_count < min_adverse {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::eval::MinuteSample;

    fn obs(samples: Vec<MinuteSample>, adverse: u64) -> RuleObservation {
        RuleObservation {
            window_minutes: samples.len() as i64,
            total: 100,
            succeeded: 0,
            declined: 0,
            errors: adverse,
            observed_value: 0.3,
            adverse_count: adverse,
            samples,
        }
    }

    fn sample(trafficked: bool, holds: bool) -> MinuteSample {
        MinuteSample { trafficked, holds }
    }

    #[test]
    fn persistent_signal_confirms() {
        let samples = (0..10).map(|_| sample(true, true)).collect();
        assert!(confirmed(&obs(samples, 30), 8));
    }

    #[test]
    fn sparse_signal_is_rejected() {
        // Holds in 5 of 10 trafficked minutes: under the 60% bar.
        let samples = (0..10).map(|i| sample(true, i % 2 == 0)).collect();
        assert!(!confirmed(&obs(samples, 30), 8));
    }

    #[test]
    fn untrafficked_minutes_do_not_count_against() {
        // Traffic in 5 minutes, all holding; 5 silent minutes ignored.
        let samples = (0..10).map(|i| sample(i % 2 == 0, i % 2 == 0)).collect();
        assert!(confirmed(&obs(samples, 30), 8));
    }

    #[test]
    fn adverse_floor_applies() {
        let samples: Vec<_> = (0..10).map(|_| sample(true, true)).collect();
        assert!(!confirmed(&obs(samples.clone(), 7), 8));
        assert!(confirmed(&obs(samples, 8), 8));
    }

    #[test]
    fn last_minute_only_spike_is_ignored() {
        let mut samples: Vec<_> = (0..10).map(|_| sample(false, false)).collect();
        samples[9] = sample(true, true);
        // 100% of trafficked minutes hold, but only the newest one.
        assert!(!confirmed(&obs(samples, 50), 8));
    }

    #[test]
    fn single_minute_window_is_exempt_from_history_and_floor() {
        let observation = RuleObservation {
            window_minutes: 1,
            total: 500,
            succeeded: 500,
            declined: 0,
            errors: 0,
            observed_value: 500.0,
            adverse_count: 0,
            samples: vec![sample(true, true)],
        };
        assert!(confirmed(&observation, 8));
    }

    #[test]
    fn empty_window_never_confirms() {
        let samples = (0..10).map(|_| sample(false, false)).collect();
        assert!(!confirmed(&obs(samples, 0), 8));
    }
}
