//! Client half of the audio protocol: capture/encode pipeline on the way
//! out, jitter buffer, decode thread, and spatialised playback on the way
//! in.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info, warn};

use conclave_proto::pipe::protocol_error;
use conclave_proto::{ClientPlugin, PipeReader, PipeWriter};
use conclave_types::{projection, ClientId, ClientState, OrthoTransform, Point};
use conclave_utils::{drop_ring, RingConsumer, RingProducer};

use crate::caps::{AudioCodec, PcmSource, PlaybackBackend, PlaybackSink};

use super::{
    AudioConfig, CONNECT_PAYLOAD_LEN, MAX_FRAME_SIZE, MAX_PACKET_SIZE, PROTOCOL_NAME,
    PROTOCOL_VERSION,
};

/// The local capture → encode pipeline.
struct Capture {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    packets: RingConsumer<Vec<u8>>,
}

impl Capture {
    fn shut_down(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Per-remote receive pipeline.
struct RemoteAudio {
    frame_size: u32,
    packet_size: u32,
    /// The remote speaker's mouth in its main viewer's space.
    mouth_position: Point,
    /// Mouth projected into the local physical frame, refreshed per frame.
    local_mouth: Point,
    /// Feeds the decode thread; dropping it stops the thread.
    jitter_tx: Option<RingProducer<Vec<u8>>>,
    decode_thread: Option<JoinHandle<()>>,
    decoded: Option<RingConsumer<Vec<i16>>>,
    sink: Option<Box<dyn PlaybackSink>>,
}

/// Client-side audio plugin.
pub struct AudioClient {
    message_id_base: u16,
    config: AudioConfig,
    codec: Option<Arc<dyn AudioCodec>>,
    playback: Option<Arc<dyn PlaybackBackend>>,
    /// Temporarily drain-and-discard instead of transmitting.
    paused: bool,
    capture: Option<Capture>,
    remotes: HashMap<ClientId, RemoteAudio>,
}

impl AudioClient {
    /// Create the plugin. Without a codec the client still negotiates the
    /// protocol and skips the audio payloads of its peers; without a
    /// playback backend remote audio is decoded and dropped.
    pub fn new(
        config: AudioConfig,
        codec: Option<Arc<dyn AudioCodec>>,
        playback: Option<Arc<dyn PlaybackBackend>>,
    ) -> Self {
        AudioClient {
            message_id_base: 0,
            config,
            codec,
            playback,
            paused: false,
            capture: None,
            remotes: HashMap::new(),
        }
    }

    fn sending(&self) -> bool {
        self.config.enable_recording && self.codec.is_some()
    }

    /// Start the capture thread on the given PCM source. The source's
    /// blocking read is expected to return at frame granularity so the
    /// stop flag is polled between frames.
    pub fn start_capture(&mut self, mut source: Box<dyn PcmSource>) -> io::Result<()> {
        let codec = self
            .codec
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "no audio codec"))?;
        if self.capture.is_some() {
            return Ok(());
        }
        let frame_size = codec.frame_size();
        let packet_size = codec.packet_size();
        let mut encoder = codec.new_encoder()?;
        let (tx, rx) = drop_ring(self.config.send_queue_size.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = thread::spawn(move || {
            let mut frame = vec![0i16; frame_size];
            let mut packet = vec![0u8; packet_size];
            while !thread_stop.load(Ordering::SeqCst) {
                if let Err(err) = source.read_frame(&mut frame) {
                    error!("audio capture stopped: {}", err);
                    break;
                }
                if let Err(err) = encoder.encode(&frame, &mut packet) {
                    error!("audio encoder failed: {}", err);
                    break;
                }
                tx.push(packet.clone());
            }
        });

        info!("audio capture running ({} samples/frame)", frame_size);
        self.capture = Some(Capture {
            stop,
            thread: Some(thread),
            packets: rx,
        });
        Ok(())
    }

    /// Stop the capture thread.
    pub fn stop_capture(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.shut_down();
        }
    }

    /// Pause or resume transmission; while paused, captured packets are
    /// drained and discarded.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }
}

impl Drop for AudioClient {
    fn drop(&mut self) {
        self.stop_capture();
        for (_, remote) in self.remotes.iter_mut() {
            shut_down_remote(remote);
        }
    }
}

fn shut_down_remote(remote: &mut RemoteAudio) {
    // Dropping the jitter producer ends the decode thread's blocking pop.
    remote.jitter_tx = None;
    if let Some(handle) = remote.decode_thread.take() {
        let _ = handle.join();
    }
}

fn decode_thread(
    jitter: RingConsumer<Vec<u8>>,
    decoded: RingProducer<Vec<i16>>,
    mut decoder: Box<dyn crate::caps::AudioDecoder>,
    frame_size: usize,
) {
    while let Some(packet) = jitter.pop_blocking() {
        let mut frame = vec![0i16; frame_size];
        if let Err(err) = decoder.decode(&packet, &mut frame) {
            error!("audio decoder failed, dropping stream: {}", err);
            break;
        }
        decoded.push(frame);
    }
}

impl ClientPlugin for AudioClient {
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
        let (frame_size, packet_size) = match (&self.codec, self.sending()) {
            (Some(codec), true) => (codec.frame_size() as u32, codec.packet_size() as u32),
            _ => (0, 0),
        };
        pipe.write_u32(CONNECT_PAYLOAD_LEN)?;
        pipe.write_u32(PROTOCOL_VERSION)?;
        pipe.write_point(self.config.mouth_position)?;
        pipe.write_u32(frame_size)?;
        pipe.write_u32(packet_size)?;
        pipe.write_u32(self.config.send_queue_size as u32)
    }

    fn receive_client_connect(&mut self, remote: ClientId, pipe: &mut PipeReader) -> io::Result<()> {
        let mouth_position = pipe.read_point()?;
        let frame_size = pipe.read_u32()?;
        let packet_size = pipe.read_u32()?;
        if frame_size > MAX_FRAME_SIZE || packet_size > MAX_PACKET_SIZE {
            return Err(protocol_error("audio: implausible remote stream geometry"));
        }

        let mut entry = RemoteAudio {
            frame_size,
            packet_size,
            mouth_position,
            local_mouth: mouth_position,
            jitter_tx: None,
            decode_thread: None,
            decoded: None,
            sink: None,
        };

        if frame_size > 0 {
            if let Some(codec) = &self.codec {
                let decoder = codec.new_decoder()?;
                let depth = self.config.jitter_buffer_size.max(1);
                let (jitter_tx, jitter_rx) = drop_ring(depth);
                let (decoded_tx, decoded_rx) = drop_ring(depth);
                let frame_samples = frame_size as usize;
                entry.jitter_tx = Some(jitter_tx);
                entry.decoded = Some(decoded_rx);
                entry.decode_thread = Some(thread::spawn(move || {
                    decode_thread(jitter_rx, decoded_tx, decoder, frame_samples)
                }));

                match self.playback.as_ref().map(|backend| backend.new_sink()) {
                    Some(Ok(mut sink)) => {
                        sink.set_rolloff(self.config.rolloff_factor);
                        entry.sink = Some(sink);
                    }
                    Some(Err(err)) => {
                        warn!("audio: no playback for client {}: {}", remote, err)
                    }
                    None => {}
                }
            } else {
                info!(
                    "audio: client {} sends audio but no codec is available; discarding",
                    remote
                );
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
        let packets = match &self.capture {
            Some(capture) => capture.packets.drain(),
            None => Vec::new(),
        };
        if self.paused {
            pipe.write_u16(0)
        } else {
            pipe.write_u16(packets.len() as u16)?;
            for packet in &packets {
                pipe.write_bytes(packet)?;
            }
            Ok(())
        }
    }

    fn receive_server_update(&mut self, remote: ClientId, pipe: &mut PipeReader) -> io::Result<bool> {
        let entry = self
            .remotes
            .get_mut(&remote)
            .ok_or_else(|| protocol_error(format!("audio: update for unknown client {}", remote)))?;
        if entry.frame_size == 0 {
            return Ok(false);
        }
        let count = pipe.read_u16()?;
        for _ in 0..count {
            let mut packet = vec![0u8; entry.packet_size as usize];
            pipe.read_bytes(&mut packet)?;
            if let Some(jitter) = &entry.jitter_tx {
                jitter.push(packet);
            }
        }
        Ok(false)
    }

    fn frame_remote(&mut self, remote: ClientId, state: &ClientState, local_nav: OrthoTransform) {
        // Project the remote speaker's mouth into the local physical frame:
        // through its first viewer into remote physical space, then across
        // the navigational mapping.
        if let Some(entry) = self.remotes.get_mut(&remote) {
            let physical = match state.viewer_states.first() {
                Some(viewer) => viewer.apply(entry.mouth_position),
                None => entry.mouth_position,
            };
            entry.local_mouth =
                projection::remote_to_local(local_nav, state.nav_transform).apply(physical);
        }
    }

    fn al_render_remote(&mut self, remote: ClientId) {
        let entry = match self.remotes.get_mut(&remote) {
            Some(entry) => entry,
            None => return,
        };
        let (sink, decoded) = match (&mut entry.sink, &entry.decoded) {
            (Some(sink), Some(decoded)) => (sink, decoded),
            _ => return,
        };

        // Refill freed playback buffers with decoded frames, one codec
        // frame per buffer.
        let mut free = sink.free_buffers();
        while free > 0 {
            match decoded.pop() {
                Some(frame) => {
                    if let Err(err) = sink.queue_frame(&frame) {
                        warn!("audio playback failed for client {}: {}", remote, err);
                        return;
                    }
                    free -= 1;
                }
                None => break,
            }
        }

        // Jitter warm-up: after an underflow, resume only once at least
        // half of the buffer pool is queued again.
        if !sink.is_playing() && sink.free_buffers() <= sink.buffer_count() / 2 {
            if let Err(err) = sink.restart() {
                warn!("audio restart failed for client {}: {}", remote, err);
                return;
            }
        }

        sink.set_position(entry.local_mouth);
    }
}
