//! Startup and teardown ordering for one bridge instance.

use std::sync::Arc;
use std::sync::mpsc::Sender;

use super::endpoint::{InboundSink, PipelineEndpoints};
use super::fault::{BridgeEvent, FaultReporter};
use super::outbound::{OutboundStats, OutboundWriter};
use super::pump::Pump;
use crate::audio::SampleSpec;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::lambda::LambdaProcess;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    SpawningFilter,
    Live,
    Unwinding,
    Closed,
}

/// Everything an endpoint factory needs to hook the pipeline up to the
/// filter process.
pub struct BridgeWiring {
    /// Writes demand into the filter's stdin. Belongs to the sink side.
    pub writer: OutboundWriter,
    /// Shared fault latch, for endpoints that notice they were removed.
    pub faults: Arc<FaultReporter>,
    pub spec: SampleSpec,
    /// PID of the spawned filter.
    pub pid: i32,
}

/// A filter process spliced into a pipeline by a pair of endpoints.
///
/// Teardown runs exactly once, from [`Bridge::shutdown`] or from `Drop`,
/// whichever comes first, and tolerates any partially started state.
pub struct Bridge<E: PipelineEndpoints> {
    state: LifecycleState,
    command: Option<String>,
    faults: Arc<FaultReporter>,
    process: Option<LambdaProcess>,
    endpoints: Option<E>,
    pump: Option<Pump>,
    outbound: Option<Arc<OutboundStats>>,
}

impl<E: PipelineEndpoints> Bridge<E> {
    /// Spawn the filter, build the endpoints with `build`, start the
    /// multiplexing loop and finally publish the endpoints.
    ///
    /// `events` receives at most one fault or endpoint-removal event; the
    /// owner should answer it by calling [`Bridge::shutdown`]. On failure
    /// everything created so far is torn down before the error returns.
    pub fn start<F>(
        config: &BridgeConfig,
        events: Sender<BridgeEvent>,
        build: F,
    ) -> Result<Self, BridgeError>
    where
        F: FnOnce(BridgeWiring) -> Result<(E, Box<dyn InboundSink>), BridgeError>,
    {
        config.validate()?;

        let mut bridge = Self {
            state: LifecycleState::Uninitialized,
            command: Some(config.command.clone()),
            faults: Arc::new(FaultReporter::new(events)),
            process: None,
            endpoints: None,
            pump: None,
            outbound: None,
        };

        match bridge.bring_up(config, build) {
            Ok(()) => Ok(bridge),
            Err(e) => {
                log::error!("Bridge startup failed: {}", e);
                bridge.shutdown();
                Err(e)
            }
        }
    }

    fn bring_up<F>(&mut self, config: &BridgeConfig, build: F) -> Result<(), BridgeError>
    where
        F: FnOnce(BridgeWiring) -> Result<(E, Box<dyn InboundSink>), BridgeError>,
    {
        self.transition(LifecycleState::SpawningFilter);

        let spec = config.spec();
        let process = LambdaProcess::spawn(
            &config.command,
            &spec.lambda_env(config.buffer_frames),
            config.terminate_grace(),
        )?;
        let pid = process.pid();
        let pipes = process.to_lambda().zip(process.from_lambda());
        self.process = Some(process);
        let (to_lambda, from_lambda) = pipes.ok_or_else(|| BridgeError::Spawn {
            command: config.command.clone(),
            source: std::io::Error::other("filter pipes already closed"),
        })?;

        let writer = OutboundWriter::new(to_lambda, self.faults.clone());
        self.outbound = Some(writer.stats());

        let (endpoints, sink) = build(BridgeWiring {
            writer,
            faults: self.faults.clone(),
            spec,
            pid,
        })?;
        self.endpoints = Some(endpoints);

        self.pump = Some(Pump::spawn(
            from_lambda,
            sink,
            self.faults.clone(),
            config.chunk_capacity,
        )?);

        if let Some(endpoints) = self.endpoints.as_mut() {
            endpoints.publish()?;
        }

        self.transition(LifecycleState::Live);
        Ok(())
    }

    #[cfg(test)]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    #[cfg(test)]
    pub fn pid(&self) -> Option<i32> {
        self.process.as_ref().map(|p| p.pid())
    }

    #[cfg(test)]
    pub fn is_faulted(&self) -> bool {
        self.faults.is_tripped()
    }

    /// Ordered teardown. Safe to call repeatedly and from any state.
    ///
    /// Endpoints go first so no new demand arrives, then the loop is
    /// stopped and joined (releasing its chunk), then the filter is
    /// terminated and reaped, and only then are the pipes closed.
    pub fn shutdown(&mut self) {
        if matches!(
            self.state,
            LifecycleState::Unwinding | LifecycleState::Closed
        ) {
            return;
        }
        self.transition(LifecycleState::Unwinding);

        if let Some(mut endpoints) = self.endpoints.take() {
            endpoints.unpublish();
        }

        if let Some(pump) = self.pump.take()
            && let Some(report) = pump.stop()
        {
            log::info!(
                "Inbound: {} bytes in {} posts ({} wakeups)",
                report.bytes_in,
                report.posts,
                report.wakeups
            );
        }

        if let Some(mut process) = self.process.take() {
            process.terminate();
            process.close_pipes();
        }

        if let Some(stats) = self.outbound.take() {
            let stats = stats.snapshot();
            if stats.rejected > 0 {
                log::warn!(
                    "Outbound: {} bytes written, {} bytes dropped ({} full-pipe demands)",
                    stats.written,
                    stats.rejected,
                    stats.would_block
                );
            } else {
                log::info!("Outbound: {} bytes written", stats.written);
            }
        }

        self.faults.disarm();
        self.command = None;
        self.transition(LifecycleState::Closed);
    }

    fn transition(&mut self, next: LifecycleState) {
        log::debug!("Bridge {:?} -> {:?}", self.state, next);
        if next == LifecycleState::Live
            && let Some(command) = &self.command
        {
            log::info!("Bridge live: `{}`", command);
        }
        self.state = next;
    }
}

impl<E: PipelineEndpoints> Drop for Bridge<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
