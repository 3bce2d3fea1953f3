//! One-shot reporting of conditions that end the bridge.
//!
//! Faults can be observed from the multiplexing loop and from the PipeWire
//! data thread at the same time. Neither may tear anything down itself:
//! both post a single [`BridgeEvent`] to whoever owns the bridge, and only
//! the first report gets through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

use parking_lot::Mutex;

use crate::error::BridgeError;

/// Messages from the bridge's worker contexts to its owner.
#[derive(Debug)]
pub enum BridgeEvent {
    /// A pipe failed or the filter went away.
    Fault(BridgeError),
    /// A PipeWire endpoint was destroyed or errored outside our control.
    EndpointRemoved { endpoint: String },
    /// SIGINT/SIGTERM or another external stop request.
    ShutdownRequested { reason: String },
}

pub struct FaultReporter {
    tripped: AtomicBool,
    events: Mutex<Option<Sender<BridgeEvent>>>,
}

impl FaultReporter {
    pub fn new(events: Sender<BridgeEvent>) -> Self {
        Self {
            tripped: AtomicBool::new(false),
            events: Mutex::new(Some(events)),
        }
    }

    /// Report a fatal error. Returns `true` for the first report only.
    pub fn report(&self, error: BridgeError) -> bool {
        if self.tripped.swap(true, Ordering::AcqRel) {
            log::debug!("Suppressed follow-up fault: {}", error);
            return false;
        }
        log::error!("Bridge fault: {}", error);
        self.post(BridgeEvent::Fault(error));
        true
    }

    /// Report that an endpoint vanished. Shares the one-shot latch with
    /// [`FaultReporter::report`].
    pub fn endpoint_removed(&self, endpoint: &str) -> bool {
        if self.tripped.swap(true, Ordering::AcqRel) {
            return false;
        }
        log::warn!("Endpoint {} was removed externally", endpoint);
        self.post(BridgeEvent::EndpointRemoved {
            endpoint: endpoint.to_string(),
        });
        true
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Drop the event sender so nothing more is posted after teardown.
    pub fn disarm(&self) {
        self.events.lock().take();
    }

    fn post(&self, event: BridgeEvent) {
        if let Some(tx) = self.events.lock().as_ref()
            && tx.send(event).is_err()
        {
            log::debug!("Bridge owner is gone, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;

    use super::*;
    use crate::error::PipeDirection;

    fn violation() -> BridgeError {
        BridgeError::ProtocolViolation {
            pipe: PipeDirection::FromLambda,
        }
    }

    #[test]
    fn test_only_first_fault_is_posted() {
        let (tx, rx) = mpsc::channel();
        let faults = FaultReporter::new(tx);
        assert!(faults.report(violation()));
        assert!(!faults.report(violation()));
        assert!(!faults.endpoint_removed("lambda_sink"));
        assert!(faults.is_tripped());

        assert!(matches!(rx.try_recv(), Ok(BridgeEvent::Fault(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_reports_post_once() {
        let (tx, rx) = mpsc::channel();
        let faults = Arc::new(FaultReporter::new(tx));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let faults = faults.clone();
                std::thread::spawn(move || faults.report(violation()))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|first| *first)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_disarm_drops_sender() {
        let (tx, rx) = mpsc::channel();
        let faults = FaultReporter::new(tx);
        faults.disarm();
        assert!(faults.endpoint_removed("lambda_source"));
        assert!(matches!(rx.recv(), Err(mpsc::RecvError)));
    }
}
