//! Pacing: how long virtual users pause between actions and between sessions.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use strum_macros::{Display, EnumString};

use crate::session::{IdentityPolicy, SessionSettings};

/// A named preset of pacing, session length and identity policy.
#[derive(Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PacingProfile {
    /// Returning visitors reading at human speed: 5-15 seconds between page views,
    /// 30-60 seconds between sessions of 3-6 page views.
    #[default]
    Realistic,
    /// Many short visits as fast as plausible: 50-150 milliseconds between every
    /// action, sessions of 4-6 page views, a new visitor each session.
    Aggressive,
}
impl PacingProfile {
    /// The inclusive range of the pause between actions within a session.
    pub fn think_time(&self) -> (Duration, Duration) {
        match self {
            PacingProfile::Realistic => (Duration::from_secs(5), Duration::from_secs(15)),
            PacingProfile::Aggressive => (Duration::from_millis(50), Duration::from_millis(150)),
        }
    }

    /// The inclusive range of the pause after a session completes.
    pub fn session_gap(&self) -> (Duration, Duration) {
        match self {
            PacingProfile::Realistic => (Duration::from_secs(30), Duration::from_secs(60)),
            PacingProfile::Aggressive => (Duration::from_millis(50), Duration::from_millis(150)),
        }
    }

    pub fn session_length(&self) -> SessionSettings {
        match self {
            PacingProfile::Realistic => SessionSettings {
                min_length: 3,
                max_length: 6,
            },
            PacingProfile::Aggressive => SessionSettings {
                min_length: 4,
                max_length: 6,
            },
        }
    }

    pub fn identity_policy(&self) -> IdentityPolicy {
        match self {
            PacingProfile::Realistic => IdentityPolicy::Persistent,
            PacingProfile::Aggressive => IdentityPolicy::PerSession,
        }
    }
}

/// Draws pauses uniformly from inclusive ranges.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Pacer {
    pub inter_action: (Duration, Duration),
    pub inter_session: (Duration, Duration),
}
impl Pacer {
    pub fn new(inter_action: (Duration, Duration), inter_session: (Duration, Duration)) -> Self {
        Pacer {
            inter_action,
            inter_session,
        }
    }

    /// The pause before the next action of the same session.
    pub fn inter_action_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        uniform(self.inter_action, rng)
    }

    /// The pause after a session completes, before the next one starts.
    pub fn inter_session_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        uniform(self.inter_session, rng)
    }
}

fn uniform<R: Rng + ?Sized>(range: (Duration, Duration), rng: &mut R) -> Duration {
    let (min, max) = range;
    if min >= max {
        return min;
    }
    rng.random_range(min..=max)
}

/// How a pause ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Pause {
    Completed,
    Cancelled,
}

/// Sleep for `delay`, unless `cancelled` resolves first.
///
/// Cancellation is checked before the timer, so a pause that is already cancelled
/// never sleeps.
pub async fn pause<F>(delay: Duration, cancelled: F) -> Pause
where
    F: Future<Output = ()>,
{
    tokio::select! {
        biased;
        _ = cancelled => Pause::Cancelled,
        _ = tokio::time::sleep(delay) => Pause::Completed,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::str::FromStr;

    #[test]
    fn delays_within_range() {
        let aggressive = PacingProfile::Aggressive;
        let pacer = Pacer::new(aggressive.think_time(), aggressive.session_gap());
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..1_000 {
            let delay = pacer.inter_action_delay(&mut rng);
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
        }

        let realistic = PacingProfile::Realistic;
        let pacer = Pacer::new(realistic.think_time(), realistic.session_gap());
        let mut total = Duration::ZERO;
        for _ in 0..1_000 {
            let delay = pacer.inter_session_delay(&mut rng);
            assert!(delay >= Duration::from_secs(30) && delay <= Duration::from_secs(60));
            total += delay;
        }
        // Uniform draws average to the middle of the range.
        let average = total.as_secs_f64() / 1_000.0;
        assert!((average - 45.0).abs() < 1.5, "average {}", average);

        // A range of a single value always returns it.
        let pacer = Pacer::new(
            (Duration::from_millis(10), Duration::from_millis(10)),
            (Duration::ZERO, Duration::ZERO),
        );
        assert_eq!(pacer.inter_action_delay(&mut rng), Duration::from_millis(10));
        assert_eq!(pacer.inter_session_delay(&mut rng), Duration::ZERO);
    }

    #[test]
    fn profiles() {
        assert_eq!(
            PacingProfile::from_str("aggressive").unwrap(),
            PacingProfile::Aggressive
        );
        assert_eq!(
            PacingProfile::from_str("Realistic").unwrap(),
            PacingProfile::Realistic
        );
        assert!(PacingProfile::from_str("ludicrous").is_err());
        assert_eq!(PacingProfile::default().to_string(), "realistic");
        assert_eq!(
            PacingProfile::Aggressive.identity_policy(),
            IdentityPolicy::PerSession
        );
        assert_eq!(PacingProfile::Realistic.session_length().min_length, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_completes() {
        let started = tokio::time::Instant::now();
        let result = pause(Duration::from_secs(5), futures::future::pending()).await;
        assert_eq!(result, Pause::Completed);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_cancelled() {
        let started = tokio::time::Instant::now();
        let (sender, receiver) = flume::bounded::<()>(1);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = sender.send(());
        });
        let result = pause(Duration::from_secs(60), async move {
            let _ = receiver.recv_async().await;
        })
        .await;
        assert_eq!(result, Pause::Cancelled);
        assert_eq!(started.elapsed(), Duration::from_secs(1));

        // Already cancelled, no time passes.
        let started = tokio::time::Instant::now();
        let result = pause(Duration::from_secs(60), async {}).await;
        assert_eq!(result, Pause::Cancelled);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
