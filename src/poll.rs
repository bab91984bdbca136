//! Bounded fixed-interval polling for kernel-published state.
//!
//! Device provisioning repeatedly has to wait for the kernel to materialize
//! something under configfs or sysfs. Every such wait in this crate goes
//! through [`poll`]: a fixed interval, a fixed attempt count, and a typed
//! [`LayerError::DeviceNotReady`] on exhaustion. There is no exponential
//! backoff and no unbounded retry.

use std::{thread::sleep, time::Duration};

use crate::error::{LayerError, Result};

/// Named polling parameters, kept in configuration rather than inline at the
/// call sites so tests can shrink them.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub attempts: u32,
}

impl PollConfig {
    pub const fn new(interval: Duration, attempts: u32) -> Self {
        Self { interval, attempts }
    }
}

/// Runs `check` up to `config.attempts` times, sleeping `config.interval`
/// between attempts, until it produces a value.
///
/// `stage` names what is being waited for and ends up in the
/// [`LayerError::DeviceNotReady`] error when the attempt budget is exhausted.
pub fn poll<T>(
    config: &PollConfig,
    stage: &'static str,
    mut check: impl FnMut() -> Option<T>,
) -> Result<T> {
    for attempt in 0..config.attempts {
        if let Some(value) = check() {
            return Ok(value);
        }
        if attempt + 1 < config.attempts {
            sleep(config.interval);
        }
    }
    Err(LayerError::DeviceNotReady {
        stage,
        attempts: config.attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: PollConfig = PollConfig::new(Duration::from_millis(1), 5);

    #[test]
    fn test_immediate_success() {
        let mut calls = 0;
        let value = poll(&FAST, "thing", || {
            calls += 1;
            Some(42)
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_eventual_success() {
        let mut calls = 0;
        let value = poll(&FAST, "thing", || {
            calls += 1;
            (calls == 3).then_some("ready")
        })
        .unwrap();
        assert_eq!(value, "ready");
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_exhaustion_is_typed() {
        let mut calls = 0;
        let result = poll::<()>(&FAST, "scsi address", || {
            calls += 1;
            None
        });
        assert_eq!(calls, 5);
        match result {
            Err(LayerError::DeviceNotReady { stage, attempts }) => {
                assert_eq!(stage, "scsi address");
                assert_eq!(attempts, 5);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
