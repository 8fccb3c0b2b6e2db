//! Spaced repetition scheduling
//!
//! Deterministic state machine mapping (current progress, rating) to the
//! next review state. SM-2 derived: an ease factor (floored at 1.3)
//! controls interval growth once a card graduates to long-term review,
//! while fresh and lapsed cards pass through a short fixed sequence of
//! learning steps first.
//!
//! Pure function, no I/O and no clock access: `now` is a parameter, so the
//! same inputs always produce the same outputs on every device, which the
//! last-writer-wins merge relies on.

use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::store::{Rating, ReviewProgress, ReviewStatus};

/// Minimum ease factor allowed.
pub const MIN_EASE_FACTOR: f32 = 1.3;

/// Ease factor assigned to a card with no prior progress.
pub const DEFAULT_EASE_FACTOR: f32 = 2.5;

/// Short-term learning delays, in minutes. A "Good" rating walks the card
/// through these steps; passing the end graduates it to review.
pub const LEARNING_STEPS_MINUTES: [i64; 2] = [10, 60];

/// Result of rating a card.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOutcome {
    /// Review interval in whole days (0 while learning).
    pub interval: i32,
    pub ease_factor: f32,
    pub status: ReviewStatus,
    pub due_date: DateTime<Utc>,
}

/// Compute the next review state for a card.
///
/// `previous` is the existing progress record, or `None` for an untouched
/// ("new") card. Ease adjustments are applied and floored before any
/// interval formula that references the ease factor.
pub fn rate(
    previous: Option<&ReviewProgress>,
    rating: Rating,
    now: DateTime<Utc>,
) -> SchedulerOutcome {
    let (status, interval, ease) = match previous {
        Some(p) => (p.status, p.interval, p.ease_factor),
        None => (ReviewStatus::New, 0, DEFAULT_EASE_FACTOR),
    };

    match status {
        ReviewStatus::New => rate_new(rating, ease, now),
        ReviewStatus::Learning { step } => rate_learning(step, rating, ease, now),
        ReviewStatus::Review => rate_review(interval, rating, ease, now),
    }
}

fn rate_new(rating: Rating, ease: f32, now: DateTime<Utc>) -> SchedulerOutcome {
    match rating {
        Rating::Again => learning_step(0, adjust_ease(ease, -0.20), now),
        Rating::Hard | Rating::Good => learning_step(1, ease, now),
        Rating::Easy => review(1, ease, now),
        Rating::VeryEasy => review(4, adjust_ease(ease, 0.15), now),
    }
}

fn rate_learning(step: usize, rating: Rating, ease: f32, now: DateTime<Utc>) -> SchedulerOutcome {
    match rating {
        Rating::Again => learning_step(0, adjust_ease(ease, -0.20), now),
        Rating::Hard => learning_step(step, adjust_ease(ease, -0.15), now),
        Rating::Good => {
            let next = step + 1;
            if next >= LEARNING_STEPS_MINUTES.len() {
                // Graduation.
                review(1, ease, now)
            } else {
                learning_step(next, ease, now)
            }
        }
        Rating::Easy => review(1, ease, now),
        Rating::VeryEasy => review(1, adjust_ease(ease, 0.15), now),
    }
}

fn rate_review(interval: i32, rating: Rating, ease: f32, now: DateTime<Utc>) -> SchedulerOutcome {
    match rating {
        // Lapse: back to the first learning step, interval reset.
        Rating::Again => learning_step(0, adjust_ease(ease, -0.20), now),
        Rating::Hard => {
            let ease = adjust_ease(ease, -0.15);
            review(grow(interval, 1.2), ease, now)
        }
        Rating::Good => review(grow(interval, ease), ease, now),
        Rating::Easy => {
            let ease = adjust_ease(ease, 0.15);
            review(grow(interval, ease * 1.3), ease, now)
        }
        Rating::VeryEasy => {
            let ease = adjust_ease(ease, 0.30);
            review(grow(interval, ease * 1.8), ease, now)
        }
    }
}

fn adjust_ease(ease: f32, delta: f32) -> f32 {
    (ease + delta).max(MIN_EASE_FACTOR)
}

/// Grow a review interval by a factor, with the monotonicity guarantee:
/// a successful review must push the card at least one day further out.
fn grow(interval: i32, factor: f32) -> i32 {
    let next = (interval as f32 * factor).round() as i32;
    if next > interval {
        next
    } else {
        interval + 1
    }
}

fn learning_step(step: usize, ease: f32, now: DateTime<Utc>) -> SchedulerOutcome {
    // Synced progress from another client may carry a step index past the
    // end of the table; clamp instead of panicking.
    let step = step.min(LEARNING_STEPS_MINUTES.len() - 1);
    SchedulerOutcome {
        interval: 0,
        ease_factor: ease,
        status: ReviewStatus::Learning { step },
        // Learning steps are due at a time, not a date.
        due_date: now + Duration::minutes(LEARNING_STEPS_MINUTES[step]),
    }
}

fn review(interval: i32, ease: f32, now: DateTime<Utc>) -> SchedulerOutcome {
    let due_day = now.date_naive() + Duration::days(interval as i64);
    SchedulerOutcome {
        interval,
        ease_factor: ease,
        status: ReviewStatus::Review,
        // Review intervals are day-granular: due dates are
        // midnight-normalized so "is due" compares dates, not times.
        due_date: due_day.and_time(NaiveTime::MIN).and_utc(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EntityId, UserId, WorkspaceId};
    use uuid::Uuid;

    fn progress(status: ReviewStatus, interval: i32, ease: f32) -> ReviewProgress {
        let mut p = ReviewProgress::new(
            WorkspaceId(Uuid::new_v4()),
            EntityId::fresh_temporary(),
            UserId(Uuid::new_v4()),
        );
        p.status = status;
        p.interval = interval;
        p.ease_factor = ease;
        p
    }

    fn assert_ease(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-5,
            "ease {} != {}",
            actual,
            expected
        );
    }

    #[test]
    fn new_card_ratings() {
        let now = Utc::now();

        let again = rate(None, Rating::Again, now);
        assert_eq!(again.status, ReviewStatus::Learning { step: 0 });
        assert_ease(again.ease_factor, 2.3);
        assert_eq!(again.due_date, now + Duration::minutes(LEARNING_STEPS_MINUTES[0]));

        for rating in [Rating::Hard, Rating::Good] {
            let r = rate(None, rating, now);
            assert_eq!(r.status, ReviewStatus::Learning { step: 1 });
            assert_eq!(r.ease_factor, DEFAULT_EASE_FACTOR);
            assert_eq!(r.due_date, now + Duration::minutes(LEARNING_STEPS_MINUTES[1]));
        }

        // Scenario: new card rated Easy goes straight to review, 1 day out.
        let easy = rate(None, Rating::Easy, now);
        assert_eq!(easy.status, ReviewStatus::Review);
        assert_eq!(easy.interval, 1);
        assert_eq!(
            easy.due_date,
            (now.date_naive() + Duration::days(1)).and_time(NaiveTime::MIN).and_utc()
        );

        let very_easy = rate(None, Rating::VeryEasy, now);
        assert_eq!(very_easy.status, ReviewStatus::Review);
        assert_eq!(very_easy.interval, 4);
        assert_ease(very_easy.ease_factor, 2.65);
    }

    #[test]
    fn learning_steps_walk_and_graduate() {
        let now = Utc::now();
        let step0 = progress(ReviewStatus::Learning { step: 0 }, 0, 2.5);

        let again = rate(Some(&step0), Rating::Again, now);
        assert_eq!(again.status, ReviewStatus::Learning { step: 0 });
        assert_ease(again.ease_factor, 2.3);

        let hard = rate(Some(&step0), Rating::Hard, now);
        assert_eq!(hard.status, ReviewStatus::Learning { step: 0 });
        assert_ease(hard.ease_factor, 2.35);
        assert_eq!(hard.due_date, now + Duration::minutes(LEARNING_STEPS_MINUTES[0]));

        let good = rate(Some(&step0), Rating::Good, now);
        assert_eq!(good.status, ReviewStatus::Learning { step: 1 });

        // Good on the last step graduates to a 1-day review interval.
        let step1 = progress(ReviewStatus::Learning { step: 1 }, 0, 2.5);
        let graduated = rate(Some(&step1), Rating::Good, now);
        assert_eq!(graduated.status, ReviewStatus::Review);
        assert_eq!(graduated.interval, 1);
        assert_ease(graduated.ease_factor, 2.5);

        let easy = rate(Some(&step0), Rating::Easy, now);
        assert_eq!(easy.status, ReviewStatus::Review);
        assert_eq!(easy.interval, 1);
        assert_ease(easy.ease_factor, 2.5);

        let very_easy = rate(Some(&step0), Rating::VeryEasy, now);
        assert_eq!(very_easy.status, ReviewStatus::Review);
        assert_eq!(very_easy.interval, 1);
        assert_ease(very_easy.ease_factor, 2.65);
    }

    #[test]
    fn review_good_multiplies_by_ease() {
        // interval=10, ease=2.5, Good => interval 25, ease unchanged.
        let p = progress(ReviewStatus::Review, 10, 2.5);
        let r = rate(Some(&p), Rating::Good, Utc::now());
        assert_eq!(r.interval, 25);
        assert_ease(r.ease_factor, 2.5);
        assert_eq!(r.status, ReviewStatus::Review);
    }

    #[test]
    fn review_lapse_resets_to_first_learning_step() {
        // interval=10, ease=2.5, Again => Learning(0), interval 0, ease 2.3.
        let p = progress(ReviewStatus::Review, 10, 2.5);
        let now = Utc::now();
        let r = rate(Some(&p), Rating::Again, now);
        assert_eq!(r.status, ReviewStatus::Learning { step: 0 });
        assert_eq!(r.interval, 0);
        assert_ease(r.ease_factor, 2.3);
        assert_eq!(r.due_date, now + Duration::minutes(LEARNING_STEPS_MINUTES[0]));
    }

    #[test]
    fn review_hard_shrinks_growth_and_ease() {
        let p = progress(ReviewStatus::Review, 10, 2.5);
        let r = rate(Some(&p), Rating::Hard, Utc::now());
        assert_eq!(r.interval, 12); // round(10 * 1.2)
        assert_ease(r.ease_factor, 2.35);
    }

    #[test]
    fn successful_reviews_always_grow_the_interval() {
        let now = Utc::now();
        for rating in [Rating::Hard, Rating::Good, Rating::Easy, Rating::VeryEasy] {
            for interval in [1, 2, 10, 365] {
                // Ease pinned at the floor: the raw formula can stall for
                // Hard (round(1 * 1.2) == 1), which the clamp must correct.
                let p = progress(ReviewStatus::Review, interval, MIN_EASE_FACTOR);
                let r = rate(Some(&p), rating, now);
                assert!(
                    r.interval > interval,
                    "rating {:?} at interval {} produced {}",
                    rating,
                    interval,
                    r.interval
                );
            }
        }
    }

    #[test]
    fn ease_factor_never_drops_below_floor() {
        let now = Utc::now();
        let mut p = progress(ReviewStatus::Review, 10, 1.35);
        for _ in 0..5 {
            let r = rate(Some(&p), Rating::Again, now);
            assert!(r.ease_factor >= MIN_EASE_FACTOR);
            p.status = r.status;
            p.interval = r.interval;
            p.ease_factor = r.ease_factor;
        }
        assert_eq!(p.ease_factor, MIN_EASE_FACTOR);
    }

    #[test]
    fn out_of_range_learning_step_is_clamped() {
        // Progress written by a client with a longer step table.
        let now = Utc::now();
        let p = progress(ReviewStatus::Learning { step: 7 }, 0, 2.5);

        let hard = rate(Some(&p), Rating::Hard, now);
        assert_eq!(
            hard.status,
            ReviewStatus::Learning { step: LEARNING_STEPS_MINUTES.len() - 1 }
        );
        assert_eq!(
            hard.due_date,
            now + Duration::minutes(*LEARNING_STEPS_MINUTES.last().unwrap())
        );

        // Good past the end still graduates.
        let good = rate(Some(&p), Rating::Good, now);
        assert_eq!(good.status, ReviewStatus::Review);
        assert_eq!(good.interval, 1);
    }

    #[test]
    fn review_due_dates_are_midnight_normalized() {
        let p = progress(ReviewStatus::Review, 10, 2.5);
        let r = rate(Some(&p), Rating::Good, Utc::now());
        assert_eq!(r.due_date.time(), NaiveTime::MIN);
    }

    #[test]
    fn same_inputs_same_outputs() {
        let now = Utc::now();
        let p = progress(ReviewStatus::Review, 7, 2.1);
        assert_eq!(
            rate(Some(&p), Rating::Easy, now),
            rate(Some(&p), Rating::Easy, now)
        );
    }
}
