// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Threshold checks for host performance counters.
//!
//! A counter is considered exceeded when its current value is strictly greater
//! than `limit * threshold`. Counters whose limit is zero or negative are not
//! enforced by the environment and are never reported.

use crate::counters::PerformanceCounterSnapshot;

/// Fraction of a counter limit above which the host starts throttling.
pub const DEFAULT_COUNTER_THRESHOLD: f64 = 0.8;

/// Returns true if `current` is above `threshold` of `limit`.
///
/// # Examples
///
/// ```
/// use functions_host_core::threshold::exceeded;
///
/// assert!(!exceeded(60, 100, 0.6));
/// assert!(exceeded(61, 100, 0.6));
/// assert!(!exceeded(101, 0, 0.6));
/// ```
pub fn exceeded(current: i64, limit: i64, threshold: f64) -> bool {
    if limit <= 0 {
        return false;
    }
    current as f64 > limit as f64 * threshold
}

/// Evaluates every limited counter of `snapshot` and returns the names of the
/// ones above `threshold`, in the fixed order of
/// [`PerformanceCounterSnapshot::limited_counters`].
pub fn evaluate_counter_set(snapshot: &PerformanceCounterSnapshot, threshold: f64) -> Vec<&'static str> {
    snapshot
        .limited_counters()
        .into_iter()
        .filter(|counter| exceeded(counter.current, counter.limit, threshold))
        .map(|counter| counter.name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exceeded_boundaries() {
        let cases = [
            (0, 100, 0.60, false),
            (60, 100, 0.60, false),
            (61, 100, 0.60, true),
            (100, 100, 0.60, true),
            (101, 100, 0.60, true),
            (101, 0, 0.60, false),
            (101, -1, 0.60, false),
        ];
        for (current, limit, threshold, expected) in cases {
            assert_eq!(
                exceeded(current, limit, threshold),
                expected,
                "exceeded({current}, {limit}, {threshold})"
            );
        }
    }

    fn assert_single_counter(
        build: fn(i64) -> PerformanceCounterSnapshot,
        name: &str,
        cases: &[(i64, bool)],
    ) {
        for &(current, expected) in cases {
            let exceeded = evaluate_counter_set(&build(current), DEFAULT_COUNTER_THRESHOLD);
            if expected {
                assert_eq!(exceeded, vec![name], "{name}={current}");
            } else {
                assert!(exceeded.is_empty(), "{name}={current} should not trigger");
            }
        }
    }

    #[test]
    fn test_connections() {
        assert_single_counter(
            |v| PerformanceCounterSnapshot {
                connections: v,
                connection_limit: 300,
                ..Default::default()
            },
            "Connections",
            &[(0, false), (10, false), (240, false), (241, true), (290, true), (300, true), (310, true)],
        );
    }

    #[test]
    fn test_active_connections() {
        assert_single_counter(
            |v| PerformanceCounterSnapshot {
                active_connections: v,
                active_connection_limit: 600,
                ..Default::default()
            },
            "ActiveConnections",
            &[(0, false), (10, false), (480, false), (481, true), (500, true), (600, true), (610, true)],
        );
    }

    #[test]
    fn test_remote_dir_monitors() {
        assert_single_counter(
            |v| PerformanceCounterSnapshot {
                remote_dir_monitors: v,
                remote_dir_monitor_limit: 500,
                ..Default::default()
            },
            "RemoteDirMonitors",
            &[(0, false), (10, false), (400, false), (401, true), (500, true), (600, true)],
        );
    }

    #[test]
    fn test_threads() {
        assert_single_counter(
            |v| PerformanceCounterSnapshot {
                threads: v,
                thread_limit: 512,
                ..Default::default()
            },
            "Threads",
            &[(0, false), (10, false), (409, false), (410, true), (500, true), (512, true), (513, true)],
        );
    }

    #[test]
    fn test_processes() {
        assert_single_counter(
            |v| PerformanceCounterSnapshot {
                processes: v,
                process_limit: 32,
                ..Default::default()
            },
            "Processes",
            &[(0, false), (10, false), (25, false), (26, true), (30, true), (32, true), (33, true)],
        );
    }

    #[test]
    fn test_named_pipes() {
        assert_single_counter(
            |v| PerformanceCounterSnapshot {
                named_pipes: v,
                named_pipe_limit: 128,
                ..Default::default()
            },
            "NamedPipes",
            &[(0, false), (10, false), (102, false), (103, true), (120, true), (128, true), (129, true)],
        );
    }

    #[test]
    fn test_multiple_exceeded_counters_keep_fixed_order() {
        let snapshot = PerformanceCounterSnapshot {
            named_pipes: 130,
            named_pipe_limit: 128,
            processes: 40,
            process_limit: 32,
            threads: 600,
            thread_limit: 512,
            ..Default::default()
        };

        let exceeded = evaluate_counter_set(&snapshot, 0.8);
        assert_eq!(exceeded, vec!["Threads", "Processes", "NamedPipes"]);

        // no state between calls
        assert_eq!(evaluate_counter_set(&snapshot, 0.8), exceeded);
    }

    #[test]
    fn test_unlimited_counters_are_ignored() {
        let snapshot = PerformanceCounterSnapshot {
            threads: 10_000,
            thread_limit: -1,
            handles: 50_000,
            ..Default::default()
        };
        assert!(evaluate_counter_set(&snapshot, 0.1).is_empty());
    }

    proptest! {
        #[test]
        fn prop_non_positive_limit_never_exceeds(
            current in any::<i32>(),
            limit in i32::MIN..=0,
            threshold in 0.0f64..=1.0,
        ) {
            prop_assert!(!exceeded(current as i64, limit as i64, threshold));
        }

        #[test]
        fn prop_matches_strict_comparison(
            current in 0i64..100_000,
            limit in 1i64..100_000,
            threshold in 0.01f64..=1.0,
        ) {
            prop_assert_eq!(
                exceeded(current, limit, threshold),
                current as f64 > limit as f64 * threshold
            );
        }
    }
}
