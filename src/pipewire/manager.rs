use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use pipewire::{context::ContextRc, core::CoreRc, main_loop::MainLoopRc};

use super::endpoint::{
    EndpointConfig, EndpointNode, EndpointRole, MAX_QUANTUM, Processor, PwEndpoints,
};
use super::ring::{RingSink, RingStats, inbound_ring};
use crate::bridge::{Bridge, BridgeEvent, BridgeWiring, InboundSink};
use crate::config::BridgeConfig;
use crate::error::BridgeError;

/// Run one bridge on the PipeWire main loop until it faults, one of its
/// endpoints disappears, or a shutdown is requested.
pub fn run(config: &BridgeConfig) -> Result<(), BridgeError> {
    config.validate()?;
    pipewire::init();

    let mainloop = MainLoopRc::new(None).map_err(device_error)?;
    let context = ContextRc::new(&mainloop, None).map_err(device_error)?;
    let core = context.connect_rc(None).map_err(device_error)?;

    // Worker contexts and the signal handler post into a std channel; a
    // forwarding thread moves events onto the loop.
    let (event_tx, event_rx) = std::sync::mpsc::channel::<BridgeEvent>();
    let (pw_event_tx, pw_event_rx) = pipewire::channel::channel::<BridgeEvent>();
    std::thread::spawn(move || {
        while let Ok(event) = event_rx.recv() {
            if pw_event_tx.send(event).is_err() {
                break;
            }
        }
    });

    install_signal_handler(event_tx.clone());

    let core_error: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
    let _core_listener = core
        .add_listener_local()
        .error({
            let mainloop = mainloop.clone();
            let core_error = core_error.clone();
            move |id, seq, res, message| {
                log::error!(
                    "PipeWire error: id={} seq={} res={} {}",
                    id,
                    seq,
                    res,
                    message
                );
                if id == pipewire::core::PW_ID_CORE {
                    *core_error.borrow_mut() = Some(message.to_string());
                    mainloop.quit();
                }
            }
        })
        .register();

    let mut ring_stats: Option<Arc<RingStats>> = None;
    let mut bridge = Bridge::start(config, event_tx, |wiring| {
        let (endpoints, ring_sink) = build_endpoints(&core, config, wiring)?;
        ring_stats = Some(ring_sink.stats());
        Ok((endpoints, Box::new(ring_sink) as Box<dyn InboundSink>))
    })?;

    let outcome: Rc<RefCell<Option<BridgeEvent>>> = Rc::new(RefCell::new(None));
    let _event_receiver = pw_event_rx.attach(mainloop.loop_(), {
        let mainloop = mainloop.clone();
        let outcome = outcome.clone();
        move |event| {
            log::debug!("Main loop received {:?}", event);
            let mut outcome = outcome.borrow_mut();
            if outcome.is_none() {
                *outcome = Some(event);
                mainloop.quit();
            }
        }
    });

    log::info!("PipeWire main loop running");
    mainloop.run();

    // Teardown happens here, on the loop thread, before the core goes away.
    bridge.shutdown();
    drop(bridge);
    if let Some(stats) = ring_stats {
        log_ring_stats(&stats);
    }

    if let Some(message) = core_error.borrow_mut().take() {
        return Err(BridgeError::DeviceConnection(message));
    }
    match outcome.borrow_mut().take() {
        Some(BridgeEvent::Fault(e)) => Err(e),
        Some(BridgeEvent::EndpointRemoved { endpoint }) => Err(BridgeError::DeviceConnection(
            format!("endpoint {} was removed", endpoint),
        )),
        Some(BridgeEvent::ShutdownRequested { reason }) => {
            log::info!("Shut down: {}", reason);
            Ok(())
        }
        None => Ok(()),
    }
}

fn build_endpoints(
    core: &CoreRc,
    config: &BridgeConfig,
    wiring: BridgeWiring,
) -> Result<(PwEndpoints, RingSink), BridgeError> {
    let BridgeWiring {
        writer,
        faults,
        spec,
        pid,
    } = wiring;
    let positions = config.positions();

    let (ring_sink, reader) =
        inbound_ring(config.ring_capacity, spec.format, spec.channels, MAX_QUANTUM);

    let sink = EndpointNode::new(
        core,
        EndpointConfig {
            role: EndpointRole::Sink,
            name: config.sink_name.clone(),
            description: config.sink_description.clone(),
            positions: positions.clone(),
            rate: spec.rate,
            buffer_frames: config.buffer_frames,
            target: config.capture_target.clone(),
            filter_pid: pid,
        },
        Processor::sink(writer, spec.format, spec.channels),
        faults.clone(),
    )?;

    let source = EndpointNode::new(
        core,
        EndpointConfig {
            role: EndpointRole::Source,
            name: config.source_name.clone(),
            description: config.source_description.clone(),
            positions,
            rate: spec.rate,
            buffer_frames: config.buffer_frames,
            target: config.playback_target.clone(),
            filter_pid: pid,
        },
        Processor::source(reader),
        faults,
    )?;

    Ok((PwEndpoints { sink, source }, ring_sink))
}

fn install_signal_handler(events: Sender<BridgeEvent>) {
    let result = ctrlc::set_handler(move || {
        let _ = events.send(BridgeEvent::ShutdownRequested {
            reason: "interrupted".to_string(),
        });
    });
    if let Err(e) = result {
        log::warn!("Could not install signal handler: {}", e);
    }
}

fn log_ring_stats(stats: &RingStats) {
    if stats.overflow_bytes() > 0 {
        log::warn!(
            "Inbound ring overflowed, {} bytes of filter output dropped",
            stats.overflow_bytes()
        );
    }
    if stats.underrun_frames() > 0 {
        log::info!(
            "Source rendered {} frames of silence while waiting for the filter",
            stats.underrun_frames()
        );
    }
}

fn device_error(e: pipewire::Error) -> BridgeError {
    BridgeError::DeviceConnection(e.to_string())
}
