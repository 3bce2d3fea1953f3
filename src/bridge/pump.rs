//! The multiplexing loop.
//!
//! A dedicated thread blocks in `poll(2)` on the filter's stdout and on
//! the read end of a private wake pipe. Stdout readiness triggers exactly
//! one non-blocking read whose result is posted downstream immediately; a
//! byte on the wake pipe is the shutdown sentinel. There is no timeout:
//! the poll wait is the only place this thread ever sleeps.
//!
//! Writes to the filter's stdin are not driven from here, see
//! [`super::outbound`].

use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::chunk::{FillOutcome, PipeBuffers, fill_from};
use super::endpoint::InboundSink;
use super::fault::FaultReporter;
use crate::error::{BridgeError, PipeDirection};

/// What the loop did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// Number of times `poll` returned.
    pub wakeups: u64,
    pub posts: u64,
    pub bytes_in: u64,
    /// Whether the loop stopped because of a fault.
    pub faulted: bool,
}

/// Handle to a running multiplexing loop.
pub struct Pump {
    wake: Option<File>,
    thread: Option<JoinHandle<PumpReport>>,
}

impl Pump {
    /// Start the loop on its own thread. `source` is the non-blocking read
    /// end of the filter's stdout.
    pub fn spawn(
        source: Arc<File>,
        sink: Box<dyn InboundSink>,
        faults: Arc<FaultReporter>,
        chunk_capacity: usize,
    ) -> Result<Self, BridgeError> {
        let (wake_rx, wake_tx) =
            wake_pipe().map_err(|e| BridgeError::io(PipeDirection::FromLambda, e))?;

        let worker = PumpLoop {
            source,
            wake: wake_rx,
            sink,
            faults,
            buffers: PipeBuffers::new(chunk_capacity),
            report: PumpReport::default(),
        };

        let thread = std::thread::Builder::new()
            .name("lambda-pump".to_string())
            .spawn(move || worker.run())
            .map_err(|e| BridgeError::Spawn {
                command: "lambda-pump thread".to_string(),
                source: e,
            })?;

        Ok(Self {
            wake: Some(wake_tx),
            thread: Some(thread),
        })
    }

    /// Post the shutdown sentinel and join the thread.
    pub fn stop(mut self) -> Option<PumpReport> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<PumpReport> {
        if let Some(mut wake) = self.wake.take() {
            // A full wake pipe already holds a sentinel.
            if let Err(e) = wake.write(&[1])
                && e.kind() != std::io::ErrorKind::WouldBlock
            {
                log::warn!("Failed to wake lambda pump: {}", e);
            }
        }
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(report) => Some(report),
            Err(_) => {
                log::error!("Lambda pump thread panicked");
                None
            }
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct PumpLoop {
    source: Arc<File>,
    wake: File,
    sink: Box<dyn InboundSink>,
    faults: Arc<FaultReporter>,
    buffers: PipeBuffers,
    report: PumpReport,
}

impl PumpLoop {
    fn run(mut self) -> PumpReport {
        log::debug!("Lambda pump starting up");

        if let Err(e) = self.serve() {
            self.report.faulted = true;
            // Teardown belongs to the bridge owner: report, then park until
            // it sends the sentinel.
            self.faults.report(e);
            self.wait_for_shutdown();
        }

        self.buffers.release_inbound();
        log::debug!(
            "Lambda pump shutting down ({} wakeups, {} posts, {} bytes)",
            self.report.wakeups,
            self.report.posts,
            self.report.bytes_in
        );
        self.report
    }

    fn serve(&mut self) -> Result<(), BridgeError> {
        loop {
            let mut fds = [
                libc::pollfd {
                    fd: self.source.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.wake.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];

            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(BridgeError::io(PipeDirection::FromLambda, err));
            }
            self.report.wakeups += 1;

            if fds[1].revents != 0 {
                return Ok(());
            }

            let revents = fds[0].revents;
            if revents & libc::POLLNVAL != 0 {
                return Err(BridgeError::io(
                    PipeDirection::FromLambda,
                    std::io::Error::from_raw_os_error(libc::EBADF),
                ));
            }
            // POLLHUP without data surfaces as a zero-byte read.
            if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                self.service_readable()?;
            }
        }
    }

    fn service_readable(&mut self) -> Result<(), BridgeError> {
        let chunk = self.buffers.acquire_inbound();
        let mut source: &File = &self.source;

        match fill_from(&mut source, chunk)? {
            FillOutcome::WouldBlock => return Ok(()),
            FillOutcome::Filled(n) => {
                log::trace!("Read {} bytes from lambda", n);
                self.sink.post(chunk.pending());
                chunk.mark_drained();
                self.report.posts += 1;
                self.report.bytes_in += n as u64;
            }
        }

        self.buffers.recycle_if_exhausted();
        Ok(())
    }

    fn wait_for_shutdown(&self) {
        loop {
            let mut pfd = libc::pollfd {
                fd: self.wake.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
            if ret > 0 {
                return;
            }
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    log::error!("Lambda pump could not wait for shutdown: {}", err);
                    return;
                }
            }
        }
    }
}

/// Non-blocking, close-on-exec pipe used as the shutdown sentinel.
/// Returns `(read end, write end)`.
fn wake_pipe() -> std::io::Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: pipe2 succeeded, both descriptors are fresh and owned here.
    let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((File::from(rx), File::from(tx)))
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use super::*;
    use crate::bridge::fault::BridgeEvent;
    use crate::bridge::outbound::OutboundWriter;
    use crate::lambda::LambdaProcess;
    use crate::lambda::process::tests::GRACE;

    #[derive(Clone, Default)]
    struct Collector(Arc<Mutex<Vec<u8>>>);

    impl InboundSink for Collector {
        fn post(&mut self, bytes: &[u8]) {
            self.0.lock().extend_from_slice(bytes);
        }
    }

    impl Collector {
        fn wait_for(&self, len: usize, timeout: Duration) -> Vec<u8> {
            let deadline = Instant::now() + timeout;
            while self.0.lock().len() < len && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            self.0.lock().clone()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_cat_round_trip_preserves_order() {
        let mut lambda = LambdaProcess::spawn("cat", &[], GRACE).unwrap();
        let (tx, rx) = mpsc::channel();
        let faults = Arc::new(FaultReporter::new(tx));
        let collector = Collector::default();
        // Small chunk so the data wraps the inbound buffer many times.
        let pump = Pump::spawn(
            lambda.from_lambda().unwrap(),
            Box::new(collector.clone()),
            faults.clone(),
            1000,
        )
        .unwrap();

        let writer = OutboundWriter::new(lambda.to_lambda().unwrap(), faults);
        let data = pattern(48 * 1024);
        for piece in data.chunks(3000) {
            let mut rest = piece;
            while !rest.is_empty() {
                let rejected = writer.write(rest);
                rest = &rest[rest.len() - rejected..];
                if rejected > 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }

        let received = collector.wait_for(data.len(), Duration::from_secs(10));
        assert_eq!(received.len(), data.len());
        assert!(received == data, "inbound bytes differ from what was written");

        drop(writer);
        let report = pump.stop().unwrap();
        assert!(!report.faulted);
        assert_eq!(report.bytes_in, data.len() as u64);
        // At most one post per wakeup, and every wakeup did some work.
        assert!(report.posts <= report.wakeups);
        assert!(report.wakeups <= report.posts + 2);
        assert!(rx.try_recv().is_err());

        lambda.terminate();
    }

    #[test]
    fn test_filter_exit_is_reported_once_and_pump_parks() {
        let mut lambda = LambdaProcess::spawn("printf abc", &[], GRACE).unwrap();
        let (tx, rx) = mpsc::channel();
        let faults = Arc::new(FaultReporter::new(tx));
        let collector = Collector::default();
        let pump = Pump::spawn(
            lambda.from_lambda().unwrap(),
            Box::new(collector.clone()),
            faults,
            64,
        )
        .unwrap();

        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(BridgeEvent::Fault(BridgeError::ProtocolViolation { pipe })) => {
                assert_eq!(pipe, PipeDirection::FromLambda)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(collector.wait_for(3, Duration::from_secs(1)), b"abc");

        // Parked, not spinning: nothing else is reported while it waits.
        std::thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());

        let report = pump.stop().unwrap();
        assert!(report.faulted);
        assert!(rx.try_recv().is_err());
        lambda.terminate();
    }

    #[test]
    fn test_stop_while_idle_returns_promptly() {
        let mut lambda = LambdaProcess::spawn("exec sleep 30", &[], GRACE).unwrap();
        let (tx, _rx) = mpsc::channel();
        let pump = Pump::spawn(
            lambda.from_lambda().unwrap(),
            Box::new(Collector::default()),
            Arc::new(FaultReporter::new(tx)),
            64,
        )
        .unwrap();

        let started = Instant::now();
        let report = pump.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.posts, 0);
        assert!(!report.faulted);
        lambda.terminate();
    }
}
