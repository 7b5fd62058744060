use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;

/// Injectable time source. Every "now" read in the services goes through a
/// clock so tests can freeze or advance it.
#[derive(Clone)]
pub enum Clock {
    System,
    Fixed(Arc<Mutex<DateTime<Utc>>>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    pub fn fixed(at: DateTime<Utc>) -> Self {
        Clock::Fixed(Arc::new(Mutex::new(at)))
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(at) => match at.lock() {
                Ok(at) => *at,
                Err(poisoned) => *poisoned.into_inner(),
            },
        }
    }

    /// Advances a fixed clock; no-op on the system clock.
    pub fn advance(&self, by: Duration) {
        if let Clock::Fixed(at) = self {
            match at.lock() {
                Ok(mut at) => *at += by,
                Err(poisoned) => *poisoned.into_inner() += by,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fixed_clock_freezes_and_advances() {
        let start = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("timestamp");
        let clock = Clock::fixed(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::hours(2));
        assert_eq!(clock.now(), start + Duration::hours(2));
    }
}
