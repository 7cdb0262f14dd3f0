//! Client half of the video protocol.
//!
//! Outbound: raw capture frames are converted to planar Y'CbCr, mirrored
//! into a triple-buffered local preview, and encoded; the freshest packet
//! is offered with each CLIENT_UPDATE. Inbound: each remote stream gets a
//! packet slot with a condition variable and a dedicated decode thread;
//! the render pass draws the latest decoded frame on a quad projected
//! through the remote's navigation mapping.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{error, info, warn};

use conclave_proto::pipe::protocol_error;
use conclave_proto::{ClientPlugin, MessageBuffer, PipeReader, PipeWriter};
use conclave_types::{projection, ClientId, ClientState, OrthoTransform, Point, RigidTransform};
use conclave_utils::{triple_buffer, TripleBufferReader, TripleBufferWriter};

use crate::caps::{FrameSink, FrameSinkFactory, ImageExtractor, VideoCodec, VideoFrame};

use super::{VideoConfig, VideoPacket, MAX_HEADERS_SIZE, PROTOCOL_NAME, PROTOCOL_VERSION};

/// Wakes the decode thread when a packet is published or the stream ends.
struct PacketSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

#[derive(Default)]
struct SignalState {
    fresh: bool,
    stop: bool,
}

impl PacketSignal {
    fn new() -> Self {
        PacketSignal {
            state: Mutex::new(SignalState::default()),
            cond: Condvar::new(),
        }
    }

    fn notify_packet(&self) {
        self.state.lock().unwrap().fresh = true;
        self.cond.notify_one();
    }

    fn notify_stop(&self) {
        self.state.lock().unwrap().stop = true;
        self.cond.notify_one();
    }

    /// Wait for a packet; false once the stream is shutting down.
    fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while !state.fresh && !state.stop {
            state = self.cond.wait(state).unwrap();
        }
        state.fresh = false;
        !state.stop
    }
}

/// Per-remote receive pipeline.
struct RemoteVideo {
    has_video: bool,
    video_transform: RigidTransform,
    video_size: [f32; 2],
    packet_writer: Option<TripleBufferWriter<VideoPacket>>,
    signal: Option<Arc<PacketSignal>>,
    decode_thread: Option<JoinHandle<()>>,
    frame_reader: Option<TripleBufferReader<VideoFrame>>,
    sink: Option<Box<dyn FrameSink>>,
    /// Video panel placement in the local physical frame.
    local_transform: OrthoTransform,
}

fn shut_down_remote(remote: &mut RemoteVideo) {
    // The decode thread is cancelled synchronously before the rest of the
    // per-remote state goes away.
    if let Some(signal) = &remote.signal {
        signal.notify_stop();
    }
    if let Some(handle) = remote.decode_thread.take() {
        let _ = handle.join();
    }
    remote.signal = None;
    remote.packet_writer = None;
}

fn decode_thread(
    signal: Arc<PacketSignal>,
    mut packets: TripleBufferReader<VideoPacket>,
    mut decoder: Box<dyn crate::caps::VideoDecoder>,
    mut frames: TripleBufferWriter<VideoFrame>,
) {
    while signal.wait() {
        if packets.acquire() {
            match decoder.decode(packets.current()) {
                Ok(Some(frame)) => frames.write(frame),
                Ok(None) => {}
                Err(err) => {
                    // Only this peer's video dies; the session continues.
                    error!("video decoder failed, dropping stream: {}", err);
                    return;
                }
            }
        }
    }
}

/// Client-side video plugin.
pub struct VideoClient {
    message_id_base: u16,
    config: VideoConfig,
    codec: Option<Arc<dyn VideoCodec>>,
    sinks: Option<Arc<dyn FrameSinkFactory>>,
    extractor: Option<Box<dyn ImageExtractor>>,
    encoder: Option<Box<dyn crate::caps::VideoEncoder>>,
    headers: Vec<u8>,
    paused: bool,
    /// Scratch frame the extractor fills before preview and encode.
    scratch: VideoFrame,
    preview_writer: TripleBufferWriter<VideoFrame>,
    preview_reader: TripleBufferReader<VideoFrame>,
    packet_writer: TripleBufferWriter<VideoPacket>,
    packet_reader: TripleBufferReader<VideoPacket>,
    remotes: HashMap<ClientId, RemoteVideo>,
}

impl VideoClient {
    /// Create the plugin. Capture is advertised only when the config
    /// enables it and an encoder could be constructed; without a codec the
    /// client still negotiates the protocol and discards peers' packets.
    pub fn new(
        config: VideoConfig,
        codec: Option<Arc<dyn VideoCodec>>,
        sinks: Option<Arc<dyn FrameSinkFactory>>,
    ) -> Self {
        let mut encoder = None;
        let mut headers = Vec::new();
        if config.enable_capture {
            match codec.as_ref().map(|codec| codec.new_encoder(&config)) {
                Some(Ok(mut enc)) => match enc.stream_headers() {
                    Ok(blob) => {
                        headers = blob;
                        encoder = Some(enc);
                    }
                    Err(err) => warn!("video encoder has no stream headers: {}", err),
                },
                Some(Err(err)) => warn!("video capture disabled, encoder failed: {}", err),
                None => info!("video capture requested but no codec is available"),
            }
        }

        let (preview_writer, preview_reader) = triple_buffer();
        let (packet_writer, packet_reader) = triple_buffer();
        let scratch = VideoFrame::new(config.width, config.height);
        VideoClient {
            message_id_base: 0,
            config,
            codec,
            sinks,
            extractor: None,
            encoder,
            headers,
            paused: false,
            scratch,
            preview_writer,
            preview_reader,
            packet_writer,
            packet_reader,
            remotes: HashMap::new(),
        }
    }

    fn sending(&self) -> bool {
        self.encoder.is_some()
    }

    /// Install the camera backend's planar extractor; capture frames are
    /// ignored until one is present.
    pub fn set_extractor(&mut self, extractor: Box<dyn ImageExtractor>) {
        self.extractor = Some(extractor);
    }

    /// Capture callback: convert a raw frame, publish the local preview,
    /// and feed the encoder.
    pub fn submit_raw_frame(&mut self, raw: &[u8]) {
        let (extractor, encoder) = match (&mut self.extractor, &mut self.encoder) {
            (Some(extractor), Some(encoder)) => (extractor, encoder),
            _ => return,
        };
        if let Err(err) = extractor.extract(raw, &mut self.scratch) {
            warn!("video frame extraction failed: {}", err);
            return;
        }
        self.preview_writer
            .back_mut()
            .clone_from(&self.scratch);
        self.preview_writer.publish();

        match encoder.encode(&self.scratch) {
            Ok(Some(packet)) => self.packet_writer.write(packet),
            Ok(None) => {}
            Err(err) => warn!("video encode failed: {}", err),
        }
    }

    /// Latest local preview frame, if capture produced one.
    pub fn preview<R>(&mut self, f: impl FnOnce(&VideoFrame) -> R) -> R {
        self.preview_reader.latest(f)
    }

    /// Pause or resume transmission.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }
}

impl Drop for VideoClient {
    fn drop(&mut self) {
        for (_, remote) in self.remotes.iter_mut() {
            shut_down_remote(remote);
        }
    }
}

impl ClientPlugin for VideoClient {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn message_id_base(&self) -> u16 {
        self.message_id_base
    }

    fn set_message_id_base(&mut self, base: u16) {
        self.message_id_base = base;
    }

    fn send_connect_request(&mut self, pipe: &mut PipeWriter) -> io::Result<()> {
        let mut payload = MessageBuffer::new();
        {
            let mut w = payload.writer();
            w.write_u32(PROTOCOL_VERSION)?;
            if self.sending() {
                w.write_u8(1)?;
                w.write_rigid(self.config.virtual_video_transform)?;
                w.write_f32(self.config.virtual_video_width)?;
                w.write_f32(self.config.virtual_video_height)?;
                w.write_u32(self.headers.len() as u32)?;
                w.write_bytes(&self.headers)?;
            } else {
                w.write_u8(0)?;
            }
        }
        payload.write_to(pipe)
    }

    fn receive_client_connect(&mut self, remote: ClientId, pipe: &mut PipeReader) -> io::Result<()> {
        let has_video = pipe.read_u8()? != 0;
        let mut entry = RemoteVideo {
            has_video,
            video_transform: RigidTransform::IDENTITY,
            video_size: [0.0; 2],
            packet_writer: None,
            signal: None,
            decode_thread: None,
            frame_reader: None,
            sink: None,
            local_transform: OrthoTransform::IDENTITY,
        };

        if has_video {
            entry.video_transform = pipe.read_rigid()?;
            entry.video_size = [pipe.read_f32()?, pipe.read_f32()?];
            let headers_size = pipe.read_u32()?;
            if headers_size > MAX_HEADERS_SIZE {
                return Err(protocol_error("video: implausible stream header size"));
            }
            let mut headers = vec![0u8; headers_size as usize];
            pipe.read_bytes(&mut headers)?;

            match &self.codec {
                Some(codec) => match codec.new_decoder() {
                    Ok(mut decoder) => {
                        decoder.feed_headers(&headers)?;
                        let (packet_writer, packet_reader) = triple_buffer();
                        let (frame_writer, frame_reader) = triple_buffer();
                        let signal = Arc::new(PacketSignal::new());
                        let thread_signal = Arc::clone(&signal);
                        entry.decode_thread = Some(thread::spawn(move || {
                            decode_thread(thread_signal, packet_reader, decoder, frame_writer)
                        }));
                        entry.packet_writer = Some(packet_writer);
                        entry.signal = Some(signal);
                        entry.frame_reader = Some(frame_reader);
                        match self.sinks.as_ref().map(|factory| factory.new_sink()) {
                            Some(Ok(sink)) => entry.sink = Some(sink),
                            Some(Err(err)) => {
                                warn!("video: no frame sink for client {}: {}", remote, err)
                            }
                            None => {}
                        }
                    }
                    Err(err) => {
                        // Capability degraded: keep reading the stream's
                        // framing, just never decode it.
                        warn!("video: decoder unavailable for client {}: {}", remote, err);
                    }
                },
                None => {
                    info!(
                        "video: client {} streams video but no codec is available; discarding",
                        remote
                    );
                }
            }
        }

        self.remotes.insert(remote, entry);
        Ok(())
    }

    fn disconnect_client(&mut self, remote: ClientId) {
        if let Some(mut entry) = self.remotes.remove(&remote) {
            shut_down_remote(&mut entry);
        }
    }

    fn send_client_update(&mut self, pipe: &mut PipeWriter) -> io::Result<()> {
        if !self.sending() {
            return Ok(());
        }
        if !self.paused && self.packet_reader.acquire() {
            pipe.write_u8(1)?;
            self.packet_reader.current().write(pipe)
        } else {
            pipe.write_u8(0)
        }
    }

    fn receive_server_update(&mut self, remote: ClientId, pipe: &mut PipeReader) -> io::Result<bool> {
        let entry = self
            .remotes
            .get_mut(&remote)
            .ok_or_else(|| protocol_error(format!("video: update for unknown client {}", remote)))?;
        if !entry.has_video {
            return Ok(false);
        }
        if pipe.read_u8()? == 0 {
            return Ok(false);
        }
        let packet = VideoPacket::read(pipe)?;
        if let (Some(writer), Some(signal)) = (&mut entry.packet_writer, &entry.signal) {
            writer.write(packet);
            signal.notify_packet();
        }
        Ok(false)
    }

    fn frame_remote(&mut self, remote: ClientId, state: &ClientState, local_nav: OrthoTransform) {
        // Panel placement: video space through the remote's physical frame,
        // then across the navigation mapping into the local frame.
        if let Some(entry) = self.remotes.get_mut(&remote) {
            entry.local_transform = projection::remote_to_local(local_nav, state.nav_transform)
                .concat(OrthoTransform::from_rigid(entry.video_transform));
        }
    }

    fn gl_render_remote(&mut self, remote: ClientId) {
        let entry = match self.remotes.get_mut(&remote) {
            Some(entry) => entry,
            None => return,
        };
        let (reader, sink) = match (&mut entry.frame_reader, &mut entry.sink) {
            (Some(reader), Some(sink)) => (reader, sink),
            _ => return,
        };
        reader.acquire();
        let frame = reader.current();
        if frame.width == 0 {
            return;
        }
        let (w, h) = (entry.video_size[0], entry.video_size[1]);
        let corners = [
            Point::new(-w / 2.0, -h / 2.0, 0.0),
            Point::new(w / 2.0, -h / 2.0, 0.0),
            Point::new(w / 2.0, h / 2.0, 0.0),
            Point::new(-w / 2.0, h / 2.0, 0.0),
        ]
        .map(|corner| entry.local_transform.apply(corner));
        sink.present(frame, corners);
    }
}
