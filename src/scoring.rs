//! Turn quality scoring and tier detection
//!
//! The audit path scores each buffered turn; scores at or above
//! [`QUALITY_THRESHOLD`] are persisted as memories. Scoring is a fixed
//! weighted sum and fully deterministic for a given input.

use once_cell::sync::Lazy;

use crate::types::{Role, Tier};

/// Minimum quality score for a turn to be persisted
pub const QUALITY_THRESHOLD: f32 = 0.65;

const ROLE_WEIGHT: f32 = 0.25;
const LENGTH_WEIGHT: f32 = 0.20;
const SALIENCE_WEIGHT: f32 = 0.40;
const RECENCY_WEIGHT: f32 = 0.15;

/// First-person cues that make a turn worth keeping
static SALIENCE_CUES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "my name is",
        "call me",
        "i am ",
        "i'm ",
        "i live",
        "i work",
        "i use",
        "i prefer",
        "i like",
        "i love",
        "i hate",
        "i want",
        "i need",
        "my favorite",
        "my goal",
        "remember",
        "always",
        "never",
        "don't forget",
        "make sure",
        "from now on",
    ]
});

static IDENTITY_CUES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "my name is",
        "call me",
        "i am a",
        "i am an",
        "i'm a ",
        "i'm an ",
        "i live",
        "i work at",
        "i work for",
        "years old",
        "my birthday",
        "my timezone",
        "my email",
        "my pronouns",
    ]
});

static PREFERENCE_CUES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "i prefer",
        "i like",
        "i love",
        "i hate",
        "i dislike",
        "favorite",
        "i want to",
        "i'd rather",
        "my goal",
        "i'm trying to",
        "i plan to",
        "i usually",
    ]
});

/// Position of a turn inside the audited window
#[derive(Debug, Clone, Copy)]
pub struct TurnContext {
    /// 0-based index within the window
    pub position: usize,
    pub window_len: usize,
}

fn role_component(role: Role) -> f32 {
    match role {
        Role::User => 1.0,
        Role::Assistant => 0.3,
        Role::System => 0.0,
    }
}

fn length_component(content: &str) -> f32 {
    let len = content.chars().count();
    if len < 10 {
        len as f32 / 10.0
    } else if len <= 500 {
        1.0
    } else {
        (1.0 - (len as f32 - 500.0) / 1000.0).max(0.0)
    }
}

fn salience_component(content: &str) -> f32 {
    let lower = content.to_lowercase();
    let hits = SALIENCE_CUES.iter().filter(|cue| lower.contains(**cue)).count();
    (hits as f32 * 0.5).min(1.0)
}

fn recency_component(ctx: TurnContext) -> f32 {
    if ctx.window_len <= 1 {
        return 1.0;
    }
    (ctx.position as f32 + 1.0) / ctx.window_len as f32
}

/// Quality score in [0, 1] for one turn
pub fn quality_score(role: Role, content: &str, ctx: TurnContext) -> f32 {
    let score = ROLE_WEIGHT * role_component(role)
        + LENGTH_WEIGHT * length_component(content)
        + SALIENCE_WEIGHT * salience_component(content)
        + RECENCY_WEIGHT * recency_component(ctx);
    score.clamp(0.0, 1.0)
}

/// Classify a turn into a retention tier
///
/// T1 for identity and durable facts, T2 for preferences and goals,
/// T3 otherwise. Explicit saves override this with T1 upstream.
pub fn detect_tier(content: &str) -> Tier {
    let lower = content.to_lowercase();
    if IDENTITY_CUES.iter().any(|cue| lower.contains(cue)) {
        return Tier::T1;
    }
    if PREFERENCE_CUES.iter().any(|cue| lower.contains(cue)) {
        return Tier::T2;
    }
    Tier::T3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mid_window() -> TurnContext {
        TurnContext {
            position: 2,
            window_len: 6,
        }
    }

    #[test]
    fn salient_user_turn_passes_threshold() {
        let score = quality_score(
            Role::User,
            "my name is Dana and I work at Meridian Labs",
            TurnContext {
                position: 5,
                window_len: 6,
            },
        );
        assert!(score >= QUALITY_THRESHOLD, "score = {score}");
    }

    #[test]
    fn small_talk_stays_below_threshold() {
        let score = quality_score(Role::User, "what's the weather like today?", mid_window());
        assert!(score < QUALITY_THRESHOLD, "score = {score}");
    }

    #[test]
    fn assistant_turns_score_lower_than_user_turns() {
        let content = "i prefer tabs over spaces in this repo";
        let user = quality_score(Role::User, content, mid_window());
        let assistant = quality_score(Role::Assistant, content, mid_window());
        assert!(user > assistant);
    }

    #[test]
    fn extreme_lengths_are_penalized() {
        let tiny = quality_score(Role::User, "ok", mid_window());
        let huge = quality_score(Role::User, &"x".repeat(1600), mid_window());
        let normal = quality_score(Role::User, "i use neovim with the lazy plugin manager", mid_window());
        assert!(normal > tiny);
        assert!(normal > huge);
    }

    #[test]
    fn scoring_is_deterministic() {
        let a = quality_score(Role::User, "i like rust", mid_window());
        let b = quality_score(Role::User, "i like rust", mid_window());
        assert_eq!(a, b);
    }

    #[test]
    fn tier_detection() {
        assert_eq!(detect_tier("My name is Dana"), Tier::T1);
        assert_eq!(detect_tier("I work at Meridian Labs"), Tier::T1);
        assert_eq!(detect_tier("I prefer dark roast coffee"), Tier::T2);
        assert_eq!(detect_tier("my favorite color is blue"), Tier::T2);
        assert_eq!(detect_tier("the deploy finished at noon"), Tier::T3);
    }
}
