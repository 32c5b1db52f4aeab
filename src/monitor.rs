//! The headless consumer loop: polls the live buffer until the run is over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::info;

use crate::config::SessionConfig;

/// Longest the loop sleeps before looking at the shutdown flag again.
const SHUTDOWN_CHECK: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Interrupted,
    DurationElapsed,
    StreamQuiet,
}

/// Calls `poll` once per poll interval until the configured run time elapses,
/// the stream stops growing (unbounded runs only) or `shutdown` is set.
///
/// `poll` returns how many samples are buffered.
pub fn poll_until_done<F>(config: &SessionConfig, shutdown: &AtomicBool, mut poll: F) -> PollOutcome
where
    F: FnMut() -> usize,
{
    let started = Instant::now();
    let mut last_len = 0;
    loop {
        if !sleep_unless_shutdown(config.poll_interval(), shutdown) {
            info!("shutdown requested, stopping");
            return PollOutcome::Interrupted;
        }
        let len = poll();

        match config.run_duration() {
            Some(limit) if started.elapsed() >= limit => return PollOutcome::DurationElapsed,
            Some(_) => {}
            None if len > 0 && len == last_len => {
                info!("stream went quiet, stopping");
                return PollOutcome::StreamQuiet;
            }
            None => {}
        }
        last_len = len;
    }
}

/// Sleeps for `total` in short slices; false as soon as `shutdown` is set.
fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SHUTDOWN_CHECK));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(run_seconds: u64, poll_interval_ms: u64) -> SessionConfig {
        SessionConfig {
            run_seconds,
            poll_interval_ms,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn shutdown_flag_interrupts_a_long_poll() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&shutdown);
        let signal = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            setter.store(true, Ordering::SeqCst);
        });

        let started = Instant::now();
        // an hour-long run with a minute between polls
        let outcome = poll_until_done(&config(3600, 60_000), &shutdown, || 1);
        signal.join().unwrap();
        assert_eq!(outcome, PollOutcome::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn flag_set_before_polling_never_polls() {
        let shutdown = AtomicBool::new(true);
        let mut polls = 0;
        let outcome = poll_until_done(&config(3600, 10), &shutdown, || {
            polls += 1;
            0
        });
        assert_eq!(outcome, PollOutcome::Interrupted);
        assert_eq!(polls, 0);
    }

    #[test]
    fn bounded_run_ends_after_its_duration() {
        let shutdown = AtomicBool::new(false);
        let mut len = 0;
        let outcome = poll_until_done(&config(1, 100), &shutdown, || {
            len += 1;
            len
        });
        assert_eq!(outcome, PollOutcome::DurationElapsed);
        assert!(len >= 5);
    }

    #[test]
    fn unbounded_run_ends_when_the_stream_stops_growing() {
        let shutdown = AtomicBool::new(false);
        let mut counts = vec![0, 3, 7, 7].into_iter();
        let outcome = poll_until_done(&config(0, 5), &shutdown, || counts.next().unwrap_or(7));
        assert_eq!(outcome, PollOutcome::StreamQuiet);
        assert_eq!(counts.next(), None);
    }
}
