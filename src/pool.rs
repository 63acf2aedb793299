// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Bounded worker pool
//!
//! Replaying one task is CPU-bound and independent of every other task, so
//! the driver fans the task list out to at most N worker threads. Items are
//! pulled from a shared queue as workers free up; nothing is cancelled
//! mid-flight.

use crossbeam_channel::unbounded;

/// Run `work` over `items` on at most `max_workers` threads
///
/// Results are returned in completion order.
pub fn run_bounded<T, R, F>(items: Vec<T>, max_workers: usize, work: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let workers = max_workers.clamp(1, items.len().max(1));
    let (item_tx, item_rx) = unbounded();
    for item in items {
        item_tx.send(item).expect("queue cannot be disconnected");
    }
    drop(item_tx);

    let (result_tx, result_rx) = unbounded();
    std::thread::scope(|scope| {
        for _ in 0..workers {
            let item_rx = item_rx.clone();
            let result_tx = result_tx.clone();
            let work = &work;
            scope.spawn(move || {
                while let Ok(item) = item_rx.recv() {
                    if result_tx.send(work(item)).is_err() {
                        return;
                    }
                }
            });
        }
    });
    drop(result_tx);

    result_rx.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn all_items_are_processed() {
        let mut results = run_bounded((0..100).collect(), 4, |i| i * 2);
        results.sort_unstable();
        assert_eq!(results, (0..100).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn concurrency_stays_bounded() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        run_bounded((0..32).collect::<Vec<u32>>(), 3, |_| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(2));
            running.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn zero_workers_still_makes_progress() {
        let results = run_bounded(vec![1, 2, 3], 0, |i| i);
        assert_eq!(results.len(), 3);
    }
}
