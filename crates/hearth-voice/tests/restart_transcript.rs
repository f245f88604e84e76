//! Seeded random recognizer sessions: partial and final text mixed with the
//! platform ending runs on its own. However many restarts happen, the turn
//! that gets sent is the finalized text in order, plus the open hypothesis
//! only when the user sends before the recognizer settles.

mod common;

use common::{test_config, Harness};
use hearth_voice::{ChatTurn, ControllerConfig, EndReason, TurnState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

const WORDS: &[&str] = &["so", "the", "garden", "needs", "rain", "today", "maybe", "tomorrow"];

/// What the session should produce if nothing is lost or repeated.
#[derive(Default)]
struct Expected {
    finals: String,
    interim: Option<String>,
}

async fn end_and_wait_for_restart(h: &mut Harness, reason: EndReason) {
    let starts = h.recognizer.starts();
    h.recognizer.end(reason);
    h.settle().await;
    // Upstream ends restart after the backoff; no-speech restarts at once.
    while h.recognizer.starts() == starts {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.settle().await;
    }
}

async fn run_seed(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    // A long silence timeout so only the end of the script commits.
    let config = ControllerConfig {
        silence_timeout_ms: 60_000,
        ..test_config()
    };
    let mut h = Harness::start(config);
    h.handle.begin_turn().unwrap();
    h.settle().await;

    let mut expected = Expected::default();
    let opening = WORDS[rng.random_range(0..WORDS.len())];
    h.recognizer.final_segment(opening);
    expected.finals.push_str(opening);

    for _ in 0..rng.random_range(5..40) {
        let word = format!(" {}", WORDS[rng.random_range(0..WORDS.len())]);
        match rng.random_range(0..10) {
            0..=3 => {
                h.recognizer.final_segment(&word);
                expected.finals.push_str(&word);
                expected.interim = None;
            }
            4..=6 => {
                h.recognizer.partial(&word);
                expected.interim = Some(word);
            }
            7 | 8 => {
                end_and_wait_for_restart(&mut h, EndReason::NoSpeech).await;
                expected.interim = None;
            }
            _ => {
                end_and_wait_for_restart(&mut h, EndReason::UpstreamEnded).await;
                expected.interim = None;
            }
        }
        h.settle().await;
        assert!(h.commits().is_empty(), "seed {seed}: committed early");
    }

    let want = if rng.random_bool(0.5) {
        h.handle.force_commit().unwrap();
        format!("{}{}", expected.finals, expected.interim.unwrap_or_default())
    } else {
        // The run ends with nothing more heard and the silence deadline
        // closes the turn.
        end_and_wait_for_restart(&mut h, EndReason::NoSpeech).await;
        expected.finals
    };
    let want = want.trim().to_string();

    assert_eq!(h.wait_for_commit().await, want, "seed {seed}");
    h.wait_for_state(TurnState::Speaking).await;
    assert_eq!(h.commits().len(), 1, "seed {seed}");
    assert_eq!(
        h.pipeline.last_call(),
        Some(vec![ChatTurn::user(want.clone())]),
        "seed {seed}"
    );
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn committed_turn_is_the_finals_across_restarts() {
    for seed in [3, 11, 99, 512, 4096, 31337, 65535, 777_777] {
        run_seed(seed).await;
    }
}
