// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Retry logic for async calls

use std::time::Duration;

use backoff::backoff::Backoff;

/// Constant with Max Retry Count is a backoff policy which always returns
/// a constant duration, until it exceeds the maximum retry count.
#[derive(Debug, Clone)]
pub struct ConstantWithMaxRetryCount {
    interval: Duration,
    max_retry_count: usize,
    count: usize,
}

impl ConstantWithMaxRetryCount {
    /// Creates a new Constant backoff with `interval` and `max_retry_count`.
    /// `interval` is the duration to wait between retries, and
    /// `max_retry_count` is the maximum number of retries, after which we
    /// return `None` to indicate that we should stop retrying.
    pub fn new(interval: Duration, max_retry_count: usize) -> Self {
        Self {
            interval,
            max_retry_count,
            count: 0,
        }
    }
}

impl Backoff for ConstantWithMaxRetryCount {
    fn next_backoff(&mut self) -> Option<Duration> {
        (self.count < self.max_retry_count).then(|| {
            self.count += 1;
            self.interval
        })
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

/// Builds the capped exponential policy used when the indexer restarts
/// after a provider failure.
///
/// `max_elapsed` of zero means retry forever.
pub fn restart_backoff(
    initial: Duration,
    max_interval: Duration,
    max_elapsed: Duration,
) -> backoff::ExponentialBackoff {
    backoff::ExponentialBackoff {
        initial_interval: initial,
        current_interval: initial,
        max_interval,
        max_elapsed_time: (!max_elapsed.is_zero()).then_some(max_elapsed),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_backoff_stops_after_max_retries() {
        let mut policy =
            ConstantWithMaxRetryCount::new(Duration::from_millis(10), 3);
        for _ in 0..3 {
            assert_eq!(
                policy.next_backoff(),
                Some(Duration::from_millis(10))
            );
        }
        assert_eq!(policy.next_backoff(), None);
        policy.reset();
        assert!(policy.next_backoff().is_some());
    }

    #[test]
    fn restart_backoff_is_capped() {
        let mut policy = restart_backoff(
            Duration::from_millis(100),
            Duration::from_millis(400),
            Duration::ZERO,
        );
        assert!(policy.max_elapsed_time.is_none());
        for _ in 0..10 {
            let next = policy.next_backoff().unwrap();
            // randomization factor may push past the cap by up to half.
            assert!(next <= Duration::from_millis(600));
        }
    }
}
