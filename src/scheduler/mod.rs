mod algorithm;

pub use algorithm::{
    rate, SchedulerOutcome, DEFAULT_EASE_FACTOR, LEARNING_STEPS_MINUTES, MIN_EASE_FACTOR,
};
