use crate::core::{
    AudioSamples, MediaType, Packet, PlaybackStats, Rational, Result, ShowMode, Subtitle, SubtitleFrame, VideoFrame,
    VideoPicture,
};
use crate::player::control::SeekRequest;
use crate::player::decoder::BoxedCodec;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// 章节（微秒）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Chapter {
    pub start_us: i64,
    pub end_us: i64,
}

/// 媒体源整体信息
#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    pub format_name: String,
    pub duration_us: Option<i64>,
    pub start_time_us: Option<i64>,
    /// 0 表示未知
    pub bit_rate: i64,
    /// 字节总长度（按字节 seek 时使用）
    pub byte_size: Option<i64>,
    /// 时间戳可能不连续（如 MPEG-TS）
    pub ts_discontinuous: bool,
    pub realtime: bool,
    pub seekable: bool,
    pub chapters: Vec<Chapter>,
}

/// 单条流信息
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaType,
    pub time_base: Rational,
    /// 流起始时间（流时间基）
    pub start_time: Option<i64>,
    pub frame_rate: Option<Rational>,
    pub sample_rate: u32,
    pub channels: u16,
    pub width: u32,
    pub height: u32,
    /// 封面图（attached picture）
    pub attached_pic: bool,
    pub codec_name: String,
}

impl StreamInfo {
    /// 音频流参数无效时不可选
    pub fn is_playable(&self) -> bool {
        match self.kind {
            MediaType::Audio => self.sample_rate != 0 && self.channels != 0,
            _ => true,
        }
    }
}

/// 一次读包的结果；硬 I/O 错误通过 `Err` 返回
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(Packet),
    Eof,
    /// 暂时没有数据，稍后重试
    Again,
}

/// 音频输出参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
    /// 设备缓冲大小（每声道采样数）
    pub buffer_frames: u32,
}

impl AudioSpec {
    /// 设备缓冲对应的时长（秒）
    pub fn buffer_duration(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.buffer_frames as f64 / self.sample_rate as f64
        }
    }
}

/// 打开的编解码器实例
pub enum CodecInstance {
    Video(BoxedCodec<VideoPicture>),
    Audio(BoxedCodec<AudioSamples>),
    Subtitle(BoxedCodec<Subtitle>),
}

/// 媒体数据源抽象接口
///
/// 负责解封装和创建编解码器。本地文件、网络流、测试用的合成源都实现这个 trait。
pub trait MediaSource: Send {
    fn info(&self) -> &SourceInfo;

    fn streams(&self) -> &[StreamInfo];

    /// 按流编号查找（编号不一定连续）
    fn stream(&self, index: usize) -> Option<&StreamInfo> {
        self.streams().iter().find(|s| s.index == index)
    }

    /// 读取下一个包
    fn read_packet(&mut self) -> Result<ReadOutcome>;

    /// 按容差窗口 seek
    fn seek(&mut self, request: &SeekRequest) -> Result<()>;

    /// 为 `stream` 创建编解码器；音频流会给出协商后的输出格式
    fn open_codec(&mut self, stream: usize, audio_target: Option<AudioSpec>) -> Result<CodecInstance>;

    /// 选出某类型的默认流，`related` 为已选中的相关流
    fn best_stream(&self, kind: MediaType, related: Option<usize>) -> Option<usize> {
        let _ = related;
        self.streams()
            .iter()
            .find(|s| s.kind == kind && s.is_playable())
            .map(|s| s.index)
    }

    /// 阻塞调用中轮询的中断标志
    fn set_interrupt(&mut self, abort: Arc<AtomicBool>) {
        let _ = abort;
    }

    /// 暂停网络读取；不支持返回 false
    fn read_pause(&mut self) -> bool {
        false
    }

    fn read_play(&mut self) {}

    /// 当前字节位置，未知为 -1
    fn byte_position(&self) -> i64 {
        -1
    }

    /// 封面图的数据包
    fn attached_picture(&self, stream: usize) -> Option<Packet> {
        let _ = stream;
        None
    }

    fn description(&self) -> String;
}

/// 音频输出设备
///
/// `open` 协商格式，`start` 把渲染器交给设备回调。
pub trait AudioBackend: Send {
    fn open(&mut self, wanted: AudioSpec) -> Result<AudioSpec>;

    fn start(&mut self, renderer: crate::player::audio_output::AudioRenderer) -> Result<()>;

    fn close(&mut self);
}

/// 画面输出
pub trait VideoSink {
    /// 显示一帧画面及其上应叠加的字幕
    fn display_picture(&mut self, frame: &VideoFrame, subtitle: Option<&SubtitleFrame>);

    /// 音频可视化（波形 / 频谱）
    fn display_audio(&mut self, mode: ShowMode, samples: &[f32], channels: u16) {
        let _ = (mode, samples, channels);
    }

    /// 周期性状态快照
    fn status(&mut self, stats: &PlaybackStats) {
        let _ = stats;
    }
}
