use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 内部时间基：微秒
pub const TIME_BASE: i64 = 1_000_000;

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Subtitle => "subtitle",
        }
    }
}

/// 有理数时间基（num/den 秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// 微秒时间基
    pub const fn micros() -> Self {
        Self { num: 1, den: TIME_BASE as i32 }
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    pub fn to_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    pub fn invert(&self) -> Self {
        Self { num: self.den, den: self.num }
    }

    /// 把 `value`（以 `from` 为单位）换算到 `to`，四舍五入到最近整数
    pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
        let b = from.num as i128 * to.den as i128;
        let c = from.den as i128 * to.num as i128;
        if c == 0 {
            return 0;
        }
        let v = value as i128 * b;
        let half = c.abs() / 2;
        let r = if (v < 0) != (c < 0) { (v - half) / c } else { (v + half) / c };
        r.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self { num: 0, den: 1 }
    }
}

/// 压缩数据包
///
/// `data` 为空的包是"空包"，用于通知解码器流已结束（drain）。
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub pos: i64, // 源数据字节位置，-1 表示未知
    pub keyframe: bool,
    pub data: Vec<u8>,
}

impl Packet {
    /// 构造指定流的空包（EOF 信号）
    pub fn null(stream_index: usize) -> Self {
        Self {
            stream_index,
            pos: -1,
            ..Default::default()
        }
    }

    pub fn is_null(&self) -> bool {
        self.data.is_empty()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// pts 缺失时退回 dts
    pub fn best_timestamp(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    RGB,
    YUV420P,
    NV12,
}

/// 解码后的图像（数据由 Arc 共享，复制帧只增加引用计数）
#[derive(Debug, Clone)]
pub struct VideoPicture {
    pub format: PixelFormat,
    pub stride: usize,
    pub data: Arc<Vec<u8>>,
}

/// 解码后的音频采样（交错 f32）
#[derive(Debug, Clone)]
pub struct AudioSamples {
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Arc<Vec<f32>>,
}

impl AudioSamples {
    /// 每声道采样数
    pub fn nb_samples(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels as usize
        }
    }
}

/// 字幕类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleKind {
    Text,
    Bitmap,
}

/// 位图字幕的一块区域，像素已按调色板展开为 RGBA
#[derive(Debug, Clone)]
pub struct SubtitleRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub rgba: Arc<Vec<u8>>,
}

impl SubtitleRect {
    /// 由调色板索引图构造；调色板项为 0xAARRGGBB，越界索引视为透明
    pub fn from_palette(x: i32, y: i32, width: u32, height: u32, indices: &[u8], stride: usize, palette: &[u32]) -> Self {
        let (w, h) = (width as usize, height as usize);
        let mut rgba = Vec::with_capacity(w * h * 4);
        for row in 0..h {
            for col in 0..w {
                let argb = indices
                    .get(row * stride + col)
                    .and_then(|&i| palette.get(i as usize))
                    .copied()
                    .unwrap_or(0);
                rgba.extend_from_slice(&[(argb >> 16) as u8, (argb >> 8) as u8, argb as u8, (argb >> 24) as u8]);
            }
        }
        Self {
            x,
            y,
            width,
            height,
            rgba: Arc::new(rgba),
        }
    }
}

/// 解码后的字幕
#[derive(Debug, Clone)]
pub struct Subtitle {
    pub kind: SubtitleKind,
    pub start_display_ms: u32, // 相对 pts 的开始显示偏移
    pub end_display_ms: u32,   // 相对 pts 的结束显示偏移
    pub text: String,
    /// 位图字幕的区域，文本字幕为空
    pub rects: Vec<SubtitleRect>,
}

impl Subtitle {
    pub fn start_offset(&self) -> f64 {
        self.start_display_ms as f64 / 1000.0
    }

    pub fn end_offset(&self) -> f64 {
        self.end_display_ms as f64 / 1000.0
    }
}

/// 帧队列中的一个槽位内容
///
/// `serial` 记录解码时所在的包队列代次，seek 之后旧代次的帧会被直接丢弃。
#[derive(Debug, Clone)]
pub struct Frame<T> {
    pub payload: T,
    pub serial: i32,
    pub pts: f64,      // 秒，未知为 NaN
    pub duration: f64, // 估计时长（秒）
    pub pos: i64,      // 源数据字节位置
    pub width: u32,
    pub height: u32,
    pub sar: Rational,
}

impl<T> Frame<T> {
    pub fn new(payload: T, serial: i32) -> Self {
        Self {
            payload,
            serial,
            pts: f64::NAN,
            duration: 0.0,
            pos: -1,
            width: 0,
            height: 0,
            sar: Rational::default(),
        }
    }
}

pub type VideoFrame = Frame<VideoPicture>;
pub type AudioFrame = Frame<AudioSamples>;
pub type SubtitleFrame = Frame<Subtitle>;

/// 主时钟来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncSource {
    #[default]
    Audio,
    Video,
    External,
}

/// 丢帧策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FrameDropPolicy {
    Off,
    On,
    /// 只有视频不是主时钟时才丢帧
    #[default]
    Auto,
}

impl FrameDropPolicy {
    pub fn allows_drop(&self, master: SyncSource) -> bool {
        match self {
            FrameDropPolicy::Off => false,
            FrameDropPolicy::On => true,
            FrameDropPolicy::Auto => master != SyncSource::Video,
        }
    }
}

/// 显示模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowMode {
    None,
    Video,
    Waves,
    Rdft,
}

impl ShowMode {
    pub fn next(&self) -> ShowMode {
        match self {
            ShowMode::None | ShowMode::Rdft => ShowMode::Video,
            ShowMode::Video => ShowMode::Waves,
            ShowMode::Waves => ShowMode::Rdft,
        }
    }
}

/// 播放状态快照（日志 / UI 状态栏）
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlaybackStats {
    pub master_clock: f64,
    pub diff_label: String,
    pub av_diff: f64,
    pub frame_drops: u64,
    pub audio_queue_bytes: usize,
    pub video_queue_bytes: usize,
    pub subtitle_queue_bytes: usize,
}

impl PlaybackStats {
    pub fn status_line(&self) -> String {
        format!(
            "{:7.2} {}:{:7.3} fd={:4} aq={:5}KB vq={:5}KB sq={:5}B",
            self.master_clock,
            self.diff_label,
            self.av_diff,
            self.frame_drops,
            self.audio_queue_bytes / 1024,
            self.video_queue_bytes / 1024,
            self.subtitle_queue_bytes,
        )
    }
}
