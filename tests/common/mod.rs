// 场景测试共用的合成媒体源、编解码器、音频输出和画面输出
#![allow(dead_code)]

use avsync_player::core::{
    AudioSamples, MediaType, Packet, PixelFormat, PlayerError, Rational, Result, SubtitleFrame, VideoFrame,
    VideoPicture,
};
use avsync_player::player::audio_output::AudioRenderer;
use avsync_player::player::decoder::{CodecBackend, DecodedUnit, Receive, SendStatus};
use avsync_player::player::{
    AudioBackend, AudioSpec, CodecInstance, MediaSource, ReadOutcome, SeekRequest, SourceInfo, StreamInfo,
    VideoSink,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const VIDEO_STREAM: usize = 0;
pub const AUDIO_STREAM: usize = 1;
/// 视频帧间隔（毫秒，25fps）
pub const VIDEO_STEP_MS: i64 = 40;
/// 音频包间隔（毫秒）
pub const AUDIO_STEP_MS: i64 = 20;
pub const SAMPLE_RATE: u32 = 48_000;

fn packet(stream_index: usize, pts_ms: i64, duration: i64) -> Packet {
    Packet {
        stream_index,
        pts: Some(pts_ms),
        dts: Some(pts_ms),
        duration,
        pos: pts_ms * 100 + stream_index as i64,
        keyframe: true,
        data: vec![0u8; 16],
    }
}

fn stream(index: usize, kind: MediaType) -> StreamInfo {
    StreamInfo {
        index,
        kind,
        time_base: Rational::new(1, 1000),
        start_time: Some(0),
        frame_rate: (kind == MediaType::Video).then(|| Rational::new(25, 1)),
        sample_rate: if kind == MediaType::Audio { SAMPLE_RATE } else { 0 },
        channels: if kind == MediaType::Audio { 2 } else { 0 },
        width: if kind == MediaType::Video { 1 } else { 0 },
        height: if kind == MediaType::Video { 1 } else { 0 },
        attached_pic: false,
        codec_name: "synthetic".to_string(),
    }
}

/// 内存里的合成媒体：时间基 1/1000，全部为关键帧
pub struct SyntheticSource {
    info: SourceInfo,
    streams: Vec<StreamInfo>,
    packets: Vec<Packet>,
    cursor: usize,
    fail_at: Option<usize>,
    video_decode_delay: Duration,
    cover: Option<Packet>,
    pub seeks: Arc<Mutex<Vec<SeekRequest>>>,
}

impl SyntheticSource {
    /// `seconds` 秒的媒体，按需带音频流
    pub fn new(seconds: i64, with_audio: bool) -> Self {
        let total_ms = seconds * 1000;
        let mut packets: Vec<Packet> = (0..total_ms / VIDEO_STEP_MS)
            .map(|i| packet(VIDEO_STREAM, i * VIDEO_STEP_MS, VIDEO_STEP_MS))
            .collect();
        let mut streams = vec![stream(VIDEO_STREAM, MediaType::Video)];
        if with_audio {
            packets.extend((0..total_ms / AUDIO_STEP_MS).map(|i| packet(AUDIO_STREAM, i * AUDIO_STEP_MS, AUDIO_STEP_MS)));
            streams.push(stream(AUDIO_STREAM, MediaType::Audio));
        }
        packets.sort_by_key(|p| (p.pts, p.stream_index));

        Self {
            info: SourceInfo {
                format_name: "synthetic".to_string(),
                duration_us: Some(total_ms * 1000),
                start_time_us: Some(0),
                bit_rate: 0,
                byte_size: None,
                ts_discontinuous: false,
                realtime: false,
                seekable: true,
                chapters: Vec::new(),
            },
            streams,
            packets,
            cursor: 0,
            fail_at: None,
            video_decode_delay: Duration::ZERO,
            cover: None,
            seeks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 读到第 `n` 个包时返回硬错误
    pub fn failing_at(mut self, n: usize) -> Self {
        self.fail_at = Some(n);
        self
    }

    /// 音频 + 封面图：视频流只有一张附带图片，不再产生视频包
    pub fn with_cover_art(seconds: i64) -> Self {
        let mut source = Self::new(seconds, true);
        source.packets.retain(|p| p.stream_index != VIDEO_STREAM);
        if let Some(video) = source.streams.iter_mut().find(|s| s.index == VIDEO_STREAM) {
            video.attached_pic = true;
        }
        source.cover = Some(packet(VIDEO_STREAM, 0, 0));
        source
    }

    /// 视频解码每帧额外耗时
    pub fn with_video_decode_delay(mut self, delay: Duration) -> Self {
        self.video_decode_delay = delay;
        self
    }
}

impl MediaSource for SyntheticSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<ReadOutcome> {
        if self.fail_at == Some(self.cursor) {
            return Err(PlayerError::ReadError("synthetic failure".to_string()));
        }
        match self.packets.get(self.cursor) {
            Some(packet) => {
                self.cursor += 1;
                Ok(ReadOutcome::Packet(packet.clone()))
            }
            None => Ok(ReadOutcome::Eof),
        }
    }

    fn seek(&mut self, request: &SeekRequest) -> Result<()> {
        self.seeks.lock().push(*request);
        self.cursor = self
            .packets
            .iter()
            .position(|p| p.pts.unwrap_or(0) * 1000 >= request.pos)
            .unwrap_or(self.packets.len());
        Ok(())
    }

    fn open_codec(&mut self, stream: usize, audio_target: Option<AudioSpec>) -> Result<CodecInstance> {
        match stream {
            VIDEO_STREAM => Ok(CodecInstance::Video(Box::new(PictureCodec {
                ready: VecDeque::new(),
                draining: false,
                delay: self.video_decode_delay,
            }))),
            AUDIO_STREAM => {
                let spec = audio_target.ok_or_else(|| PlayerError::AudioError("missing spec".to_string()))?;
                Ok(CodecInstance::Audio(Box::new(ToneCodec {
                    ready: VecDeque::new(),
                    draining: false,
                    spec,
                })))
            }
            _ => Err(PlayerError::OpenError(format!("no stream {}", stream))),
        }
    }

    fn byte_position(&self) -> i64 {
        self.cursor as i64
    }

    fn attached_picture(&self, stream: usize) -> Option<Packet> {
        self.cover.clone().filter(|_| stream == VIDEO_STREAM)
    }

    fn description(&self) -> String {
        "synthetic".to_string()
    }
}

/// 每个包产出一张 1x1 画面
struct PictureCodec {
    ready: VecDeque<DecodedUnit<VideoPicture>>,
    draining: bool,
    delay: Duration,
}

impl CodecBackend for PictureCodec {
    type Output = VideoPicture;

    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus> {
        if packet.is_null() {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let picture = VideoPicture {
            format: PixelFormat::RGBA,
            stride: 4,
            data: Arc::new(vec![0u8; 4]),
        };
        let mut unit = DecodedUnit::new(picture, packet.pts);
        unit.pos = packet.pos;
        unit.width = 1;
        unit.height = 1;
        self.ready.push_back(unit);
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> Result<Receive<VideoPicture>> {
        if let Some(unit) = self.ready.pop_front() {
            return Ok(Receive::Frame(unit));
        }
        if self.draining {
            self.draining = false;
            return Ok(Receive::Drained);
        }
        Ok(Receive::NeedInput)
    }

    fn flush(&mut self) {
        self.ready.clear();
        self.draining = false;
    }
}

/// 每个包产出一段静音，长度与包时长一致
struct ToneCodec {
    ready: VecDeque<DecodedUnit<AudioSamples>>,
    draining: bool,
    spec: AudioSpec,
}

impl CodecBackend for ToneCodec {
    type Output = AudioSamples;

    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus> {
        if packet.is_null() {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        }
        let frames = (self.spec.sample_rate as i64 * packet.duration / 1000) as usize;
        let samples = AudioSamples {
            sample_rate: self.spec.sample_rate,
            channels: self.spec.channels,
            data: Arc::new(vec![0.0; frames * self.spec.channels as usize]),
        };
        let mut unit = DecodedUnit::new(samples, packet.pts);
        unit.pos = packet.pos;
        self.ready.push_back(unit);
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> Result<Receive<AudioSamples>> {
        if let Some(unit) = self.ready.pop_front() {
            return Ok(Receive::Frame(unit));
        }
        if self.draining {
            self.draining = false;
            return Ok(Receive::Drained);
        }
        Ok(Receive::NeedInput)
    }

    fn flush(&mut self) {
        self.ready.clear();
        self.draining = false;
    }
}

/// 用后台线程按设备节奏调用渲染器的假音频输出
pub struct PacedAudioBackend {
    renderer: Arc<Mutex<Option<AudioRenderer>>>,
    stop: Arc<AtomicBool>,
    pump: Option<thread::JoinHandle<()>>,
}

pub const BUFFER_FRAMES: u32 = 1024;

impl PacedAudioBackend {
    pub fn new() -> Self {
        Self {
            renderer: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }
}

impl AudioBackend for PacedAudioBackend {
    fn open(&mut self, wanted: AudioSpec) -> Result<AudioSpec> {
        Ok(AudioSpec {
            sample_rate: wanted.sample_rate,
            channels: wanted.channels,
            buffer_frames: BUFFER_FRAMES,
        })
    }

    fn start(&mut self, renderer: AudioRenderer) -> Result<()> {
        let spec = renderer.spec();
        *self.renderer.lock() = Some(renderer);
        self.stop.store(false, Ordering::SeqCst);

        let slot = self.renderer.clone();
        let stop = self.stop.clone();
        let period = Duration::from_secs_f64(spec.buffer_duration());
        let mut buf = vec![0.0f32; spec.buffer_frames as usize * spec.channels as usize];
        self.pump = Some(thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                if let Some(renderer) = slot.lock().as_mut() {
                    renderer.fill(&mut buf);
                }
                thread::sleep(period);
            }
        }));
        Ok(())
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        self.renderer.lock().take();
    }
}

/// 记录显示过的画面 (pts, serial)
#[derive(Default)]
pub struct RecordingSink {
    pub frames: Vec<(f64, i32)>,
}

impl VideoSink for RecordingSink {
    fn display_picture(&mut self, frame: &VideoFrame, _subtitle: Option<&SubtitleFrame>) {
        self.frames.push((frame.pts, frame.serial));
    }
}
