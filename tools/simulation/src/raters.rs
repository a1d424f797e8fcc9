//! Seeded rater bots
//!
//! Each rater visits venues at random and scores them around the venue's
//! true busyness. A small share of actions inject legacy records with a
//! missing or out-of-range score straight into the store.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use types::ids::UserId;
use types::rating::{MAX_SCORE, MIN_SCORE};

/// Configuration for rater behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaterConfig {
    /// Probability of acting on a given tick (0.0 to 1.0)
    pub activity: f64,
    /// Maximum deviation from a venue's true busyness
    pub noise: i64,
    /// Probability that an action writes a malformed legacy record
    pub malformed_ratio: f64,
    /// Probability that a rating carries a note
    pub note_ratio: f64,
}

impl Default for RaterConfig {
    fn default() -> Self {
        Self {
            activity: 0.4,
            noise: 1,
            malformed_ratio: 0.05,
            note_ratio: 0.2,
        }
    }
}

/// What a rater does on one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum RaterAction {
    Idle,
    Rate {
        venue: usize,
        score: i64,
        note: Option<String>,
    },
    InjectMalformed {
        venue: usize,
        score: Value,
    },
}

const NOTES: [&str; 4] = ["line out the door", "quiet", "filling up", "dance floor packed"];

/// Rater bot with deterministic seeded RNG.
pub struct Rater {
    pub user: UserId,
    pub config: RaterConfig,
    pub actions_taken: usize,
    rng: ChaCha8Rng,
}

impl Rater {
    /// Create a new rater with a deterministic seed.
    pub fn new(user: UserId, config: RaterConfig, seed: u64) -> Self {
        Self {
            user,
            config,
            actions_taken: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Decide this tick's action given each venue's true busyness.
    pub fn next_action(&mut self, busyness: &[i64]) -> RaterAction {
        if busyness.is_empty() || !self.rng.gen_bool(self.config.activity) {
            return RaterAction::Idle;
        }

        let venue = self.rng.gen_range(0..busyness.len());
        self.actions_taken += 1;

        if self.rng.gen_bool(self.config.malformed_ratio) {
            let score = if self.rng.gen_bool(0.5) {
                Value::Null
            } else {
                json!(MAX_SCORE + 4)
            };
            return RaterAction::InjectMalformed { venue, score };
        }

        let noise = if self.config.noise > 0 {
            self.rng.gen_range(-self.config.noise..=self.config.noise)
        } else {
            0
        };
        let score = (busyness[venue] + noise).clamp(MIN_SCORE, MAX_SCORE);

        let note = if self.rng.gen_bool(self.config.note_ratio) {
            Some(NOTES[self.rng.gen_range(0..NOTES.len())].to_string())
        } else {
            None
        };

        RaterAction::Rate { venue, score, note }
    }
}
