//! End-to-end media sessions over loopback, with fake codecs and backends
//! standing in for the out-of-scope capture and output stacks.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use conclave_media::caps::{
    AudioCodec, AudioDecoder, AudioEncoder, FrameSink, FrameSinkFactory, ImageExtractor,
    PcmSource, PlaybackBackend, PlaybackSink, VideoCodec, VideoDecoder, VideoEncoder, VideoFrame,
};
use conclave_media::video::VideoPacket;
use conclave_media::{AudioClient, AudioConfig, AudioServer, VideoClient, VideoConfig, VideoServer};
use conclave_net::{Client, ClientConfig, Server, ServerConfig};
use conclave_proto::{ClientPlugin, ServerPlugin};
use conclave_types::{ClientState, Point};

const TIMEOUT: Duration = Duration::from_secs(5);
const FRAME_SIZE: usize = 160;

// ── audio fakes ────────────────────────────────────────────────

/// Identity codec: a packet is the frame's samples in little-endian bytes.
struct ToneCodec;

struct ToneEncoder;
struct ToneDecoder;

impl AudioCodec for ToneCodec {
    fn frame_size(&self) -> usize {
        FRAME_SIZE
    }

    fn packet_size(&self) -> usize {
        FRAME_SIZE * 2
    }

    fn new_encoder(&self) -> io::Result<Box<dyn AudioEncoder>> {
        Ok(Box::new(ToneEncoder))
    }

    fn new_decoder(&self) -> io::Result<Box<dyn AudioDecoder>> {
        Ok(Box::new(ToneDecoder))
    }
}

impl AudioEncoder for ToneEncoder {
    fn encode(&mut self, frame: &[i16], packet: &mut [u8]) -> io::Result<()> {
        for (sample, out) in frame.iter().zip(packet.chunks_exact_mut(2)) {
            out.copy_from_slice(&sample.to_le_bytes());
        }
        Ok(())
    }
}

impl AudioDecoder for ToneDecoder {
    fn decode(&mut self, packet: &[u8], frame: &mut [i16]) -> io::Result<()> {
        for (bytes, sample) in packet.chunks_exact(2).zip(frame.iter_mut()) {
            *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        }
        Ok(())
    }
}

/// Capture source producing a ramp, pacing itself like a real device.
struct ToneSource {
    next: i16,
}

impl PcmSource for ToneSource {
    fn read_frame(&mut self, frame: &mut [i16]) -> io::Result<()> {
        for sample in frame.iter_mut() {
            *sample = self.next;
            self.next = self.next.wrapping_add(1);
        }
        std::thread::sleep(Duration::from_micros(500));
        Ok(())
    }
}

#[derive(Default)]
struct SinkState {
    queued: Vec<Vec<i16>>,
    played: Vec<Vec<i16>>,
    playing: bool,
    position: Point,
    rolloff: f32,
}

const SINK_BUFFERS: usize = 8;

/// Playback sink whose state the test can observe from outside.
#[derive(Clone)]
struct SharedSink(Arc<Mutex<SinkState>>);

impl PlaybackSink for SharedSink {
    fn buffer_count(&self) -> usize {
        SINK_BUFFERS
    }

    fn free_buffers(&mut self) -> usize {
        let mut state = self.0.lock().unwrap();
        if state.playing {
            // A playing device consumes its queue.
            let drained: Vec<Vec<i16>> = state.queued.drain(..).collect();
            state.played.extend(drained);
        }
        SINK_BUFFERS - state.queued.len()
    }

    fn queue_frame(&mut self, frame: &[i16]) -> io::Result<()> {
        self.0.lock().unwrap().queued.push(frame.to_vec());
        Ok(())
    }

    fn is_playing(&mut self) -> bool {
        self.0.lock().unwrap().playing
    }

    fn restart(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().playing = true;
        Ok(())
    }

    fn set_position(&mut self, position: Point) {
        self.0.lock().unwrap().position = position;
    }

    fn set_rolloff(&mut self, rolloff: f32) {
        self.0.lock().unwrap().rolloff = rolloff;
    }
}

struct SinkBackend(Arc<Mutex<SinkState>>);

impl PlaybackBackend for SinkBackend {
    fn new_sink(&self) -> io::Result<Box<dyn PlaybackSink>> {
        Ok(Box::new(SharedSink(Arc::clone(&self.0))))
    }
}

// ── video fakes ────────────────────────────────────────────────

/// Codec whose headers carry the frame dimensions and whose packets carry
/// the raw luma plane.
struct DimCodec;

struct DimEncoder {
    width: u32,
    height: u32,
    seq: i64,
}

struct DimDecoder {
    dims: Option<(u32, u32)>,
}

impl VideoCodec for DimCodec {
    fn new_encoder(&self, config: &VideoConfig) -> io::Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(DimEncoder {
            width: config.width,
            height: config.height,
            seq: 0,
        }))
    }

    fn new_decoder(&self) -> io::Result<Box<dyn VideoDecoder>> {
        Ok(Box::new(DimDecoder { dims: None }))
    }
}

impl VideoEncoder for DimEncoder {
    fn stream_headers(&mut self) -> io::Result<Vec<u8>> {
        let mut headers = Vec::new();
        headers.extend_from_slice(&self.width.to_le_bytes());
        headers.extend_from_slice(&self.height.to_le_bytes());
        Ok(headers)
    }

    fn encode(&mut self, frame: &VideoFrame) -> io::Result<Option<VideoPacket>> {
        let packet = VideoPacket {
            bos: self.seq == 0,
            granule_pos: self.seq,
            packet_no: self.seq,
            data: frame.planes[0].clone(),
        };
        self.seq += 1;
        Ok(Some(packet))
    }
}

impl VideoDecoder for DimDecoder {
    fn feed_headers(&mut self, headers: &[u8]) -> io::Result<()> {
        if headers.len() != 8 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad headers"));
        }
        let width = u32::from_le_bytes([headers[0], headers[1], headers[2], headers[3]]);
        let height = u32::from_le_bytes([headers[4], headers[5], headers[6], headers[7]]);
        self.dims = Some((width, height));
        Ok(())
    }

    fn decode(&mut self, packet: &VideoPacket) -> io::Result<Option<VideoFrame>> {
        let (width, height) = self
            .dims
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no headers"))?;
        let mut frame = VideoFrame::new(width, height);
        frame.planes[0].copy_from_slice(&packet.data);
        Ok(Some(frame))
    }
}

/// Extractor copying raw capture bytes straight into the luma plane.
struct LumaExtractor;

impl ImageExtractor for LumaExtractor {
    fn extract(&mut self, raw: &[u8], out: &mut VideoFrame) -> io::Result<()> {
        let len = raw.len().min(out.planes[0].len());
        out.planes[0][..len].copy_from_slice(&raw[..len]);
        Ok(())
    }
}

#[derive(Default)]
struct FrameLog(Arc<Mutex<Vec<(VideoFrame, [Point; 4])>>>);

struct LogSink(Arc<Mutex<Vec<(VideoFrame, [Point; 4])>>>);

impl FrameSink for LogSink {
    fn present(&mut self, frame: &VideoFrame, corners: [Point; 4]) {
        self.0.lock().unwrap().push((frame.clone(), corners));
    }
}

impl FrameSinkFactory for FrameLog {
    fn new_sink(&self) -> io::Result<Box<dyn FrameSink>> {
        Ok(Box::new(LogSink(Arc::clone(&self.0))))
    }
}

// ── harness ────────────────────────────────────────────────────

fn start_server(plugins: Vec<Box<dyn ServerPlugin>>) -> (Server, String) {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".into(),
    };
    let mut server = Server::bind(&config).expect("bind test server");
    for plugin in plugins {
        server.register_plugin(plugin);
    }
    server.start();
    let addr = server.local_addr().to_string();
    (server, addr)
}

fn connect(addr: &str, name: &str, plugins: Vec<Box<dyn ClientPlugin>>) -> Client {
    Client::connect(
        &ClientConfig {
            server_addr: addr.into(),
            client_name: name.into(),
        },
        plugins,
        ClientState::default(),
    )
    .expect("client connects")
}

// ── scenarios ──────────────────────────────────────────────────

#[test]
fn audio_fans_out_and_playback_warms_up() {
    let (server, addr) = start_server(vec![Box::new(AudioServer::new())]);

    let codec: Arc<dyn AudioCodec> = Arc::new(ToneCodec);
    let speaker_config = AudioConfig {
        enable_recording: true,
        ..AudioConfig::default()
    };
    let mut speaker = connect(
        &addr,
        "speaker",
        vec![Box::new(AudioClient::new(
            speaker_config,
            Some(Arc::clone(&codec)),
            None,
        ))],
    );
    speaker
        .with_plugin("audio", |plugin| {
            let audio = plugin.as_any().downcast_mut::<AudioClient>().unwrap();
            audio.start_capture(Box::new(ToneSource { next: 0 }))
        })
        .unwrap()
        .unwrap();

    let sink_state = Arc::new(Mutex::new(SinkState::default()));
    let backend: Arc<dyn PlaybackBackend> = Arc::new(SinkBackend(Arc::clone(&sink_state)));
    let mut listener = connect(
        &addr,
        "listener",
        vec![Box::new(AudioClient::new(
            AudioConfig::default(),
            Some(Arc::clone(&codec)),
            Some(backend),
        ))],
    );

    let start = Instant::now();
    let mut warmed_up = false;
    while start.elapsed() < TIMEOUT {
        server.update();
        speaker.frame();
        listener.frame();
        listener.al_render();
        {
            let state = sink_state.lock().unwrap();
            if state.playing && !state.played.is_empty() {
                warmed_up = true;
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(warmed_up, "playback never warmed up");

    // Frames come out at codec granularity, carrying the captured ramp.
    let state = sink_state.lock().unwrap();
    for frame in state.played.iter().chain(state.queued.iter()) {
        assert_eq!(frame.len(), FRAME_SIZE);
        for pair in frame.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
    }
}

#[test]
fn paused_sender_discards_instead_of_transmitting() {
    let (server, addr) = start_server(vec![Box::new(AudioServer::new())]);

    let codec: Arc<dyn AudioCodec> = Arc::new(ToneCodec);
    let mut speaker = connect(
        &addr,
        "muted",
        vec![Box::new(AudioClient::new(
            AudioConfig {
                enable_recording: true,
                ..AudioConfig::default()
            },
            Some(Arc::clone(&codec)),
            None,
        ))],
    );
    speaker.with_plugin("audio", |plugin| {
        let audio = plugin.as_any().downcast_mut::<AudioClient>().unwrap();
        audio.set_paused(true);
        audio.start_capture(Box::new(ToneSource { next: 0 }))
    });

    let sink_state = Arc::new(Mutex::new(SinkState::default()));
    let backend: Arc<dyn PlaybackBackend> = Arc::new(SinkBackend(Arc::clone(&sink_state)));
    let mut listener = connect(
        &addr,
        "listener",
        vec![Box::new(AudioClient::new(
            AudioConfig::default(),
            Some(codec),
            Some(backend),
        ))],
    );

    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(500) {
        server.update();
        speaker.frame();
        listener.frame();
        listener.al_render();
        std::thread::sleep(Duration::from_millis(5));
    }
    let state = sink_state.lock().unwrap();
    assert!(state.queued.is_empty() && state.played.is_empty());
}

#[test]
fn video_reaches_capable_peers_and_skips_past_incapable_ones() {
    let (server, addr) = start_server(vec![Box::new(VideoServer::new())]);

    let codec: Arc<dyn VideoCodec> = Arc::new(DimCodec);
    let sender_config = VideoConfig {
        enable_capture: true,
        width: 64,
        height: 48,
        ..VideoConfig::default()
    };
    let mut sender = connect(
        &addr,
        "camera",
        vec![Box::new(VideoClient::new(
            sender_config,
            Some(Arc::clone(&codec)),
            None,
        ))],
    );
    sender.with_plugin("video", |plugin| {
        let video = plugin.as_any().downcast_mut::<VideoClient>().unwrap();
        video.set_extractor(Box::new(LumaExtractor));
    });

    let frames = FrameLog::default();
    let frame_log = Arc::clone(&frames.0);
    let mut viewer = connect(
        &addr,
        "viewer",
        vec![Box::new(VideoClient::new(
            VideoConfig::default(),
            Some(Arc::clone(&codec)),
            Some(Arc::new(frames)),
        ))],
    );

    // The third client negotiates the protocol but has no codec at all:
    // it must read and discard the stream headers and every packet.
    let mut incapable = connect(
        &addr,
        "no-codec",
        vec![Box::new(VideoClient::new(VideoConfig::default(), None, None))],
    );

    let start = Instant::now();
    let mut presented = false;
    let mut capture_ticks = 0u8;
    while start.elapsed() < TIMEOUT {
        server.update();
        sender.with_plugin("video", |plugin| {
            let video = plugin.as_any().downcast_mut::<VideoClient>().unwrap();
            video.submit_raw_frame(&[capture_ticks; 64 * 48]);
        });
        capture_ticks = capture_ticks.wrapping_add(1);
        sender.frame();
        viewer.frame();
        incapable.frame();
        viewer.gl_render();
        if !frame_log.lock().unwrap().is_empty() {
            presented = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(presented, "no decoded frame was presented");

    let log = frame_log.lock().unwrap();
    let (frame, corners) = &log[0];
    assert_eq!(frame.width, 64);
    assert_eq!(frame.height, 48);
    // The quad spans the sender's advertised panel size around its origin.
    assert!((corners[1].0[0] - corners[0].0[0] - 1.0).abs() < 1e-4);

    // The codec-less client survived the whole stream.
    assert!(incapable.is_connected());
    assert!(incapable.frame());
}
