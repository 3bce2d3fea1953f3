use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pipewire::core::CoreRc;

use super::ring::FrameReader;
use crate::audio::SampleFormat;
use crate::audio::convert::encode_interleaved;
use crate::bridge::endpoint::{ControlMessage, ControlReply, handle_control};
use crate::bridge::{FaultReporter, OutboundWriter, PipelineEndpoints};
use crate::config::MAX_CHANNELS;
use crate::error::BridgeError;

/// Largest quantum the process callbacks handle.
pub const MAX_QUANTUM: usize = 8192;

/// Stands in for an input port that has no buffer this cycle.
static SILENCE: [f32; MAX_QUANTUM] = [0.0; MAX_QUANTUM];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// Consumes pipeline audio and feeds it to the filter.
    Sink,
    /// Plays the filter's output into the pipeline.
    Source,
}

impl EndpointRole {
    fn direction(self) -> libspa::sys::spa_direction {
        match self {
            EndpointRole::Sink => libspa::sys::SPA_DIRECTION_INPUT,
            EndpointRole::Source => libspa::sys::SPA_DIRECTION_OUTPUT,
        }
    }

    fn port_prefix(self) -> &'static str {
        match self {
            EndpointRole::Sink => "playback",
            EndpointRole::Source => "capture",
        }
    }

    fn media_class(self, routed: bool) -> &'static str {
        match (self, routed) {
            (EndpointRole::Sink, false) => "Audio/Sink",
            (EndpointRole::Source, false) => "Audio/Source",
            (EndpointRole::Sink, true) => "Stream/Input/Audio",
            (EndpointRole::Source, true) => "Stream/Output/Audio",
        }
    }

    fn link_message(self, linked: bool) -> ControlMessage {
        match (self, linked) {
            (EndpointRole::Sink, true) => ControlMessage::AddInput,
            (EndpointRole::Sink, false) => ControlMessage::RemoveInput,
            (EndpointRole::Source, true) => ControlMessage::AddOutput,
            (EndpointRole::Source, false) => ControlMessage::RemoveOutput,
        }
    }
}

/// Configuration for one endpoint node.
pub struct EndpointConfig {
    pub role: EndpointRole,
    pub name: String,
    pub description: String,
    /// One DSP port per position.
    pub positions: Vec<String>,
    pub rate: u32,
    pub buffer_frames: u32,
    /// Object to route to instead of exposing a virtual device.
    pub target: Option<String>,
    pub filter_pid: i32,
}

/// What the process callback does with each quantum.
pub enum Processor {
    /// Interleave the input ports and hand the bytes to the filter.
    Sink {
        writer: OutboundWriter,
        format: SampleFormat,
        scratch: Vec<u8>,
    },
    /// Fill the output ports from the filter's queued output.
    Source { reader: FrameReader },
}

impl Processor {
    pub fn sink(writer: OutboundWriter, format: SampleFormat, channels: usize) -> Self {
        Processor::Sink {
            writer,
            format,
            scratch: vec![0; MAX_QUANTUM * channels * format.bytes_per_sample()],
        }
    }

    pub fn source(reader: FrameReader) -> Self {
        Processor::Source { reader }
    }
}

/// A `pw_filter` node standing in for one side of the bridge.
pub struct EndpointNode {
    /// Raw pw_filter pointer (we own this)
    filter: *mut pipewire::sys::pw_filter,
    _hook: Box<libspa::sys::spa_hook>,
    _events: Box<pipewire::sys::pw_filter_events>,
    user_data: *mut FilterData,
    /// Keep the core alive so it outlives the filter
    _core: CoreRc,
    connected: bool,
    pub name: String,
}

#[repr(C)]
struct PortData {
    index: u32,
}

struct FilterData {
    role: EndpointRole,
    name: String,
    processor: Processor,
    faults: Arc<FaultReporter>,
    /// Set before disconnect/destroy so callbacks stop touching the
    /// processor.
    shutting_down: AtomicBool,
    /// The node reached Streaming at least once.
    streamed: AtomicBool,
    port_ptrs: Vec<*mut std::ffi::c_void>,
}

// FilterData is accessed from the RT thread via raw pointer. PipeWire never
// runs on_process concurrently with itself, and the main thread only
// touches the atomics.
unsafe impl Send for FilterData {}

impl EndpointNode {
    /// Create the filter and its ports. The node stays invisible to the
    /// graph until [`EndpointNode::connect`].
    pub fn new(
        core: &CoreRc,
        config: EndpointConfig,
        processor: Processor,
        faults: Arc<FaultReporter>,
    ) -> Result<Self, BridgeError> {
        if config.positions.is_empty() || config.positions.len() > MAX_CHANNELS {
            return Err(BridgeError::Config(format!(
                "{}: unsupported channel count {}",
                config.name,
                config.positions.len()
            )));
        }
        let c_name = cstring(&config.name)?;

        let props = unsafe {
            let p = pipewire::sys::pw_properties_new(
                c_str(b"media.type\0"),
                c_str(b"Audio\0"),
                c_str(b"media.category\0"),
                c_str(b"Filter\0"),
                c_str(b"media.role\0"),
                c_str(b"DSP\0"),
                std::ptr::null::<std::os::raw::c_char>(),
            );
            let routed = config.target.is_some();
            set_prop(p, "media.class", config.role.media_class(routed))?;
            set_prop(p, "node.name", &config.name)?;
            set_prop(p, "node.description", &config.description)?;
            set_prop(p, "node.rate", &format!("1/{}", config.rate))?;
            set_prop(
                p,
                "node.latency",
                &format!("{}/{}", config.buffer_frames, config.rate),
            )?;
            set_prop(p, "audio.channels", &config.positions.len().to_string())?;
            set_prop(p, "audio.position", &config.positions.join(","))?;
            set_prop(p, "pw-lambda.pid", &config.filter_pid.to_string())?;
            match &config.target {
                Some(target) => {
                    set_prop(p, "target.object", target)?;
                    set_prop(p, "node.autoconnect", "true")?;
                }
                None => set_prop(p, "node.virtual", "true")?,
            }
            p
        };

        // Takes ownership of props
        let filter =
            unsafe { pipewire::sys::pw_filter_new(core.as_raw_ptr(), c_name.as_ptr(), props) };
        if filter.is_null() {
            return Err(BridgeError::DeviceConnection(format!(
                "failed to create pw_filter {}",
                config.name
            )));
        }

        let user_data = Box::into_raw(Box::new(FilterData {
            role: config.role,
            name: config.name.clone(),
            processor,
            faults,
            shutting_down: AtomicBool::new(false),
            streamed: AtomicBool::new(false),
            port_ptrs: Vec::with_capacity(config.positions.len()),
        }));

        let events = Box::new(pipewire::sys::pw_filter_events {
            version: pipewire::sys::PW_VERSION_FILTER_EVENTS,
            destroy: None,
            state_changed: Some(on_state_changed),
            io_changed: None,
            param_changed: Some(on_param_changed),
            add_buffer: None,
            remove_buffer: None,
            process: Some(on_process),
            drained: None,
            command: None,
        });

        let mut hook = Box::new(unsafe { std::mem::zeroed::<libspa::sys::spa_hook>() });
        unsafe {
            pipewire::sys::pw_filter_add_listener(
                filter,
                hook.as_mut() as *mut libspa::sys::spa_hook,
                events.as_ref() as *const pipewire::sys::pw_filter_events,
                user_data as *mut std::ffi::c_void,
            );
        }

        let node = Self {
            filter,
            _hook: hook,
            _events: events,
            user_data,
            _core: core.clone(),
            connected: false,
            name: config.name.clone(),
        };

        for (i, position) in config.positions.iter().enumerate() {
            let port_name = cstring(&format!("{}_{}", config.role.port_prefix(), position))?;
            let channel = cstring(position)?;
            let port_props = unsafe {
                pipewire::sys::pw_properties_new(
                    c_str(b"port.name\0"),
                    port_name.as_ptr(),
                    c_str(b"audio.channel\0"),
                    channel.as_ptr(),
                    c_str(b"format.dsp\0"),
                    c_str(b"32 bit float mono audio\0"),
                    std::ptr::null::<std::os::raw::c_char>(),
                )
            };
            let port_data = unsafe {
                pipewire::sys::pw_filter_add_port(
                    filter,
                    config.role.direction(),
                    pipewire::sys::pw_filter_port_flags_PW_FILTER_PORT_FLAG_MAP_BUFFERS,
                    std::mem::size_of::<PortData>(),
                    port_props,
                    std::ptr::null_mut(),
                    0,
                )
            };
            if port_data.is_null() {
                // Dropping `node` destroys the filter and the ports added so far.
                return Err(BridgeError::DeviceConnection(format!(
                    "{}: failed to add port {}",
                    config.name, position
                )));
            }
            unsafe {
                (*(port_data as *mut PortData)).index = i as u32;
                (*user_data).port_ptrs.push(port_data);
            }
        }

        log::info!(
            "Created {:?} endpoint {} ({} channels{})",
            config.role,
            config.name,
            config.positions.len(),
            config
                .target
                .as_deref()
                .map(|t| format!(", routed to {}", t))
                .unwrap_or_default()
        );

        Ok(node)
    }

    /// Make the node visible to the graph.
    pub fn connect(&mut self) -> Result<(), BridgeError> {
        if self.connected {
            return Ok(());
        }
        // RT_PROCESS so on_process runs directly on the data thread where
        // pw_filter_get_dsp_buffer is valid.
        let flags = pipewire::sys::pw_filter_flags_PW_FILTER_FLAG_RT_PROCESS;
        let ret =
            unsafe { pipewire::sys::pw_filter_connect(self.filter, flags, std::ptr::null_mut(), 0) };
        if ret < 0 {
            return Err(BridgeError::DeviceConnection(format!(
                "failed to connect {}: error {}",
                self.name, ret
            )));
        }
        self.connected = true;
        Ok(())
    }

    /// Stop processing and take the node off the graph.
    pub fn disconnect(&mut self) {
        if !self.user_data.is_null() {
            unsafe {
                (*self.user_data)
                    .shutting_down
                    .store(true, Ordering::SeqCst);
            }
        }
        if self.connected && !self.filter.is_null() {
            unsafe {
                pipewire::sys::pw_filter_disconnect(self.filter);
            }
            self.connected = false;
        }
    }

    pub fn node_id(&self) -> u32 {
        if self.filter.is_null() {
            return 0;
        }
        unsafe { pipewire::sys::pw_filter_get_node_id(self.filter) }
    }
}

impl Drop for EndpointNode {
    fn drop(&mut self) {
        if !self.user_data.is_null() {
            unsafe {
                (*self.user_data)
                    .shutting_down
                    .store(true, Ordering::SeqCst);
            }
        }
        // No callbacks fire once pw_filter_destroy returns.
        if !self.filter.is_null() {
            unsafe {
                pipewire::sys::pw_filter_destroy(self.filter);
            }
            self.filter = std::ptr::null_mut();
        }
        if !self.user_data.is_null() {
            unsafe {
                drop(Box::from_raw(self.user_data));
            }
            self.user_data = std::ptr::null_mut();
        }
        log::debug!("Destroyed endpoint {}", self.name);
    }
}

/// The sink and source nodes published together.
pub struct PwEndpoints {
    pub sink: EndpointNode,
    pub source: EndpointNode,
}

impl PipelineEndpoints for PwEndpoints {
    fn publish(&mut self) -> Result<(), BridgeError> {
        // Source first, so filter output has somewhere to go by the time
        // the first demand reaches the filter.
        self.source.connect()?;
        if let Err(e) = self.sink.connect() {
            self.source.disconnect();
            return Err(e);
        }
        log::info!(
            "Published {} (node {}) and {} (node {})",
            self.sink.name,
            self.sink.node_id(),
            self.source.name,
            self.source.node_id()
        );
        Ok(())
    }

    fn unpublish(&mut self) {
        self.sink.disconnect();
        self.source.disconnect();
    }
}

fn cstring(value: &str) -> Result<CString, BridgeError> {
    CString::new(value)
        .map_err(|_| BridgeError::Config(format!("`{}` contains a NUL byte", value)))
}

/// # Safety
/// `props` must be a valid `pw_properties` pointer.
unsafe fn set_prop(
    props: *mut pipewire::sys::pw_properties,
    key: &str,
    value: &str,
) -> Result<(), BridgeError> {
    let key = cstring(key)?;
    let value = cstring(value)?;
    unsafe {
        pipewire::sys::pw_properties_set(props, key.as_ptr(), value.as_ptr());
    }
    Ok(())
}

#[inline]
fn c_str(bytes: &[u8]) -> *const std::os::raw::c_char {
    bytes.as_ptr() as *const std::os::raw::c_char
}

// ─── Filter callbacks ──────────────────────────────────────────────────────────

unsafe extern "C" fn on_state_changed(
    data: *mut std::ffi::c_void,
    _old: pipewire::sys::pw_filter_state,
    state: pipewire::sys::pw_filter_state,
    error: *const std::os::raw::c_char,
) {
    let fd = unsafe { &*(data as *const FilterData) };
    let state_str = match state {
        pipewire::sys::pw_filter_state_PW_FILTER_STATE_ERROR => "Error",
        pipewire::sys::pw_filter_state_PW_FILTER_STATE_UNCONNECTED => "Unconnected",
        pipewire::sys::pw_filter_state_PW_FILTER_STATE_CONNECTING => "Connecting",
        pipewire::sys::pw_filter_state_PW_FILTER_STATE_PAUSED => "Paused",
        pipewire::sys::pw_filter_state_PW_FILTER_STATE_STREAMING => "Streaming",
        _ => "Unknown",
    };
    if !error.is_null() {
        let err = unsafe { std::ffi::CStr::from_ptr(error) }.to_string_lossy();
        log::info!("Endpoint {} state: {} ({})", fd.name, state_str, err);
    } else {
        log::info!("Endpoint {} state: {}", fd.name, state_str);
    }

    if fd.shutting_down.load(Ordering::Acquire) {
        return;
    }

    match state {
        pipewire::sys::pw_filter_state_PW_FILTER_STATE_STREAMING => {
            fd.streamed.store(true, Ordering::Release);
            let reply = handle_control(fd.role.link_message(true));
            log::debug!("Endpoint {} linked: {:?}", fd.name, reply);
        }
        pipewire::sys::pw_filter_state_PW_FILTER_STATE_PAUSED => {
            if fd.streamed.load(Ordering::Acquire) {
                let reply = handle_control(fd.role.link_message(false));
                log::debug!("Endpoint {} unlinked: {:?}", fd.name, reply);
            }
        }
        pipewire::sys::pw_filter_state_PW_FILTER_STATE_ERROR => {
            fd.faults.endpoint_removed(&fd.name);
        }
        pipewire::sys::pw_filter_state_PW_FILTER_STATE_UNCONNECTED => {
            if fd.streamed.load(Ordering::Acquire) {
                fd.faults.endpoint_removed(&fd.name);
            }
        }
        _ => {}
    }
}

unsafe extern "C" fn on_param_changed(
    data: *mut std::ffi::c_void,
    _port_data: *mut std::ffi::c_void,
    id: u32,
    _param: *const libspa::sys::spa_pod,
) {
    if id != libspa::sys::SPA_PARAM_Latency {
        return;
    }
    let fd = unsafe { &*(data as *const FilterData) };
    // The node publishes no Latency param of its own; the zero reply is
    // only logged.
    if let ControlReply::Latency(latency) = handle_control(ControlMessage::GetLatency) {
        log::debug!(
            "Endpoint {} latency query: reporting {:?}",
            fd.name,
            latency
        );
    }
}

/// Process callback, runs on the PipeWire real-time data thread.
///
/// # Safety
/// - Called from the RT data thread (PW_FILTER_FLAG_RT_PROCESS).
/// - `data` is a valid `*mut FilterData` allocated with Box::into_raw.
/// - PipeWire guarantees this is not called concurrently with itself.
unsafe extern "C" fn on_process(
    data: *mut std::ffi::c_void,
    position: *mut libspa::sys::spa_io_position,
) {
    unsafe {
        let fd = &mut *(data as *mut FilterData);

        if fd.shutting_down.load(Ordering::Acquire) {
            return;
        }

        let n_samples = if !position.is_null() {
            (*position).clock.duration as usize
        } else {
            return;
        };
        if n_samples == 0 {
            return;
        }

        match &mut fd.processor {
            Processor::Sink {
                writer,
                format,
                scratch,
            } => {
                // Larger than the scratch buffer; the quantum is dropped.
                if n_samples > MAX_QUANTUM {
                    return;
                }
                let mut inputs: [&[f32]; MAX_CHANNELS] = [&SILENCE[..0]; MAX_CHANNELS];
                for (slot, port_ptr) in inputs.iter_mut().zip(&fd.port_ptrs) {
                    let buf = pipewire::sys::pw_filter_get_dsp_buffer(*port_ptr, n_samples as u32);
                    *slot = if buf.is_null() {
                        &SILENCE[..n_samples]
                    } else {
                        std::slice::from_raw_parts(buf as *const f32, n_samples)
                    };
                }
                let inputs = &inputs[..fd.port_ptrs.len()];
                let len = encode_interleaved(*format, inputs, n_samples, scratch);
                // Whatever the pipe does not take this cycle is dropped.
                writer.write(&scratch[..len]);
            }
            Processor::Source { reader } => {
                let mut outputs: [&mut [f32]; MAX_CHANNELS] = Default::default();
                let mut n_out = 0;
                for port_ptr in &fd.port_ptrs {
                    let buf = pipewire::sys::pw_filter_get_dsp_buffer(*port_ptr, n_samples as u32);
                    if buf.is_null() {
                        continue;
                    }
                    outputs[n_out] = std::slice::from_raw_parts_mut(buf as *mut f32, n_samples);
                    n_out += 1;
                }
                // Frames are laid out per channel, so a missing port buffer
                // would shift every channel after it. A quantum larger than
                // the reader's staging is decoded up to MAX_QUANTUM frames and
                // the rest is silence.
                if n_out < reader.channels() {
                    for output in outputs[..n_out].iter_mut() {
                        output.fill(0.0);
                    }
                    return;
                }
                reader.read_frames(&mut outputs[..n_out], n_samples);
            }
        }
    }
}
