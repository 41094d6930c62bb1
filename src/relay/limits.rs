//! In-memory request limiting.
//!
//! Sliding-window RPM per token plus a concurrency cap per user. One mutex
//! guards the whole map; the critical section is a few queue operations.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use super::error::{RelayError, RelayResult};
use crate::config;

#[derive(Default)]
struct LimitState {
    rpm_windows: HashMap<i64, VecDeque<Instant>>,
    concurrent_by_user: HashMap<i64, u32>,
}

static LIMIT_STATE: Lazy<Arc<Mutex<LimitState>>> =
    Lazy::new(|| Arc::new(Mutex::new(LimitState::default())));

/// Releases the concurrency slot when dropped.
pub struct LimitGuard {
    user_id: i64,
    counted: bool,
    state: Arc<Mutex<LimitState>>,
}

impl Drop for LimitGuard {
    fn drop(&mut self) {
        if !self.counted {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.concurrent_by_user.get_mut(&self.user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.concurrent_by_user.remove(&self.user_id);
            }
        }
    }
}

fn trim_window(window: &mut VecDeque<Instant>, now: Instant) {
    let cutoff = now - Duration::from_secs(60);
    while matches!(window.front(), Some(ts) if *ts < cutoff) {
        window.pop_front();
    }
}

/// Admit one request for (token, user); the returned guard must live for
/// the whole request.
pub fn acquire(token_id: i64, user_id: i64) -> RelayResult<LimitGuard> {
    let cfg = config::load();
    let state_arc = Arc::clone(&LIMIT_STATE);

    if cfg.rpm_limit.is_none() && cfg.max_concurrent_per_user.is_none() {
        return Ok(LimitGuard {
            user_id,
            counted: false,
            state: state_arc,
        });
    }

    let mut state = state_arc.lock().unwrap();
    let now = Instant::now();

    if let Some(rpm) = cfg.rpm_limit {
        if rpm == 0 {
            return Err(RelayError::RateLimited(
                "request rate limit is 0; all requests are blocked".to_string(),
            ));
        }
        let window = state.rpm_windows.entry(token_id).or_default();
        trim_window(window, now);
        if window.len() as u32 >= rpm {
            return Err(RelayError::RateLimited(format!(
                "token exceeded {} requests per minute",
                rpm
            )));
        }
        window.push_back(now);
    }

    let mut counted = false;
    if let Some(max) = cfg.max_concurrent_per_user {
        if max == 0 {
            return Err(RelayError::RateLimited(
                "concurrency limit is 0; all requests are blocked".to_string(),
            ));
        }
        let current = state.concurrent_by_user.get(&user_id).copied().unwrap_or(0);
        if current >= max {
            return Err(RelayError::RateLimited(format!(
                "user has {} requests in flight (limit {})",
                current, max
            )));
        }
        *state.concurrent_by_user.entry(user_id).or_insert(0) += 1;
        counted = true;
    }

    drop(state);
    Ok(LimitGuard {
        user_id,
        counted,
        state: state_arc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    // Limiter state and settings are process-global; every test holds the
    // settings lock and uses distinct ids.

    #[test]
    fn no_limits_configured_always_admits() {
        let _lock = config::test_support::lock();
        config::install(Settings::default());
        for _ in 0..100 {
            acquire(9001, 9001).unwrap();
        }
    }

    #[test]
    fn rpm_window_blocks_at_cap() {
        let _lock = config::test_support::lock();
        let mut cfg = Settings::default();
        cfg.rpm_limit = Some(3);
        config::install(cfg);

        let mut guards = Vec::new();
        for _ in 0..3 {
            guards.push(acquire(9002, 9002).unwrap());
        }
        assert!(matches!(
            acquire(9002, 9002),
            Err(RelayError::RateLimited(_))
        ));
        config::install(Settings::default());
    }

    #[test]
    fn concurrency_slot_released_on_drop() {
        let _lock = config::test_support::lock();
        let mut cfg = Settings::default();
        cfg.max_concurrent_per_user = Some(1);
        config::install(cfg);

        let guard = acquire(9003, 9003).unwrap();
        assert!(matches!(
            acquire(9004, 9003),
            Err(RelayError::RateLimited(_))
        ));
        drop(guard);
        let _second = acquire(9005, 9003).unwrap();
        config::install(Settings::default());
    }
}
