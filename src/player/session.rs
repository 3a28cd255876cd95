use crossbeam::atomic::AtomicCell;
use crossbeam_channel::Sender;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::core::{
    log_ctx, relative_time, AudioSamples, MediaType, PlaybackStats, PlayerOptions, ShowMode, Subtitle,
    VideoPicture, TIME_BASE,
};
use crate::player::control::ControlState;
use crate::player::frame_queue::{FrameQueue, SAMPLE_QUEUE_SIZE, SUBPICTURE_QUEUE_SIZE, VIDEO_PICTURE_QUEUE_SIZE};
use crate::player::packet_queue::PacketQueue;
use crate::player::source::{AudioSpec, SourceInfo, StreamInfo};
use crate::player::sync::SyncController;

/// 可视化采样环大小
pub const SAMPLE_ARRAY_SIZE: usize = 8 * 65536;

/// 交给宿主的播放器事件
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// 终止播放；附带错误信息时表示异常结束
    Quit(Option<String>),
    /// 播放完毕且配置了自动退出
    EndOfStream,
}

/// 音频可视化用的采样环
pub struct SampleRing {
    data: Vec<f32>,
    index: usize,
}

impl SampleRing {
    pub fn new() -> Self {
        Self {
            data: vec![0.0; SAMPLE_ARRAY_SIZE],
            index: 0,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        let mut rest = samples;
        while !rest.is_empty() {
            let len = rest.len().min(SAMPLE_ARRAY_SIZE - self.index);
            self.data[self.index..self.index + len].copy_from_slice(&rest[..len]);
            self.index = (self.index + len) % SAMPLE_ARRAY_SIZE;
            rest = &rest[len..];
        }
    }

    /// 取出在写指针之前 `delay` 个采样处结束、长度为 `len` 的窗口
    pub fn window(&self, len: usize, delay: usize) -> Vec<f32> {
        let len = len.min(SAMPLE_ARRAY_SIZE);
        let back = (delay + len) % SAMPLE_ARRAY_SIZE;
        let start = (self.index + SAMPLE_ARRAY_SIZE - back) % SAMPLE_ARRAY_SIZE;
        (0..len).map(|i| self.data[(start + i) % SAMPLE_ARRAY_SIZE]).collect()
    }

    pub fn reset(&mut self) {
        self.data.iter_mut().for_each(|s| *s = 0.0);
        self.index = 0;
    }
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new()
    }
}

/// 当前打开的流与按源决定的运行参数
#[derive(Debug, Clone)]
pub struct StreamSelection {
    pub source: SourceInfo,
    pub streams: Vec<StreamInfo>,
    pub video: Option<StreamInfo>,
    pub audio: Option<StreamInfo>,
    pub subtitle: Option<StreamInfo>,
    /// 最近一次选中的流，轮换时从这里开始找
    pub last_video: Option<usize>,
    pub last_audio: Option<usize>,
    pub last_subtitle: Option<usize>,
    pub seek_by_bytes: bool,
    pub infinite_buffer: bool,
    pub show_mode: ShowMode,
    pub audio_spec: Option<AudioSpec>,
}

impl Default for StreamSelection {
    fn default() -> Self {
        Self {
            source: SourceInfo::default(),
            streams: Vec::new(),
            video: None,
            audio: None,
            subtitle: None,
            last_video: None,
            last_audio: None,
            last_subtitle: None,
            seek_by_bytes: false,
            infinite_buffer: false,
            show_mode: ShowMode::None,
            audio_spec: None,
        }
    }
}

impl StreamSelection {
    pub fn current(&self, kind: MediaType) -> Option<&StreamInfo> {
        match kind {
            MediaType::Video => self.video.as_ref(),
            MediaType::Audio => self.audio.as_ref(),
            MediaType::Subtitle => self.subtitle.as_ref(),
        }
    }

    pub fn last_index(&self, kind: MediaType) -> Option<usize> {
        match kind {
            MediaType::Video => self.last_video,
            MediaType::Audio => self.last_audio,
            MediaType::Subtitle => self.last_subtitle,
        }
    }

    pub fn set_current(&mut self, kind: MediaType, stream: Option<StreamInfo>) {
        let index = stream.as_ref().map(|s| s.index);
        match kind {
            MediaType::Video => {
                self.video = stream;
                if index.is_some() {
                    self.last_video = index;
                }
            }
            MediaType::Audio => {
                self.audio = stream;
                if index.is_some() {
                    self.last_audio = index;
                }
            }
            MediaType::Subtitle => {
                self.subtitle = stream;
                if index.is_some() {
                    self.last_subtitle = index;
                }
            }
        }
    }

    /// 当前视频流是否为封面图
    pub fn video_is_attached_pic(&self) -> bool {
        self.video.as_ref().map(|s| s.attached_pic).unwrap_or(false)
    }
}

/// 一次播放会话的共享状态
///
/// 读取线程、解码线程、音频回调和宿主刷新循环都持有同一个 `Arc<Session>`。
pub struct Session {
    pub options: Arc<PlayerOptions>,
    pub audioq: Arc<PacketQueue>,
    pub videoq: Arc<PacketQueue>,
    pub subtitleq: Arc<PacketQueue>,
    pub pictq: Arc<FrameQueue<VideoPicture>>,
    pub sampq: Arc<FrameQueue<AudioSamples>>,
    pub subpq: Arc<FrameQueue<Subtitle>>,
    pub sync: SyncController,
    pub control: ControlState,
    pub streams: RwLock<StreamSelection>,
    pub volume: AtomicCell<f32>,
    pub samples: Mutex<SampleRing>,
    byte_position: AtomicI64,
    events: Sender<PlayerEvent>,
}

impl Session {
    pub fn new(options: Arc<PlayerOptions>, events: Sender<PlayerEvent>) -> Arc<Self> {
        let audioq = Arc::new(PacketQueue::new());
        let videoq = Arc::new(PacketQueue::new());
        let subtitleq = Arc::new(PacketQueue::new());

        let pictq = Arc::new(FrameQueue::new(videoq.clone(), VIDEO_PICTURE_QUEUE_SIZE, true));
        let subpq = Arc::new(FrameQueue::new(subtitleq.clone(), SUBPICTURE_QUEUE_SIZE, false));
        let sampq = Arc::new(FrameQueue::new(audioq.clone(), SAMPLE_QUEUE_SIZE, true));

        let sync = SyncController::new(options.sync, audioq.serial_handle(), videoq.serial_handle());
        let volume = options.volume;

        Arc::new(Self {
            options,
            audioq,
            videoq,
            subtitleq,
            pictq,
            sampq,
            subpq,
            sync,
            control: ControlState::new(),
            streams: RwLock::new(StreamSelection::default()),
            volume: AtomicCell::new(volume),
            samples: Mutex::new(SampleRing::new()),
            byte_position: AtomicI64::new(-1),
            events,
        })
    }

    /// 通知宿主
    pub fn post(&self, event: PlayerEvent) {
        if self.events.send(event).is_err() {
            debug!("{} 事件接收端已关闭", log_ctx());
        }
    }

    pub fn set_byte_position(&self, pos: i64) {
        self.byte_position.store(pos, Ordering::Release);
    }

    pub fn byte_position(&self) -> i64 {
        self.byte_position.load(Ordering::Acquire)
    }

    /// 切换暂停状态，补偿暂停期间的 frame_timer 并重新锚定视频 / 外部时钟
    pub fn stream_toggle_pause(&self) {
        let sync = &self.sync;
        let paused = self.control.is_paused();
        if paused {
            let now = relative_time();
            sync.set_frame_timer(sync.frame_timer() + now - sync.vidclk.last_updated());
            if self.control.read_pause_supported() {
                sync.vidclk.set_paused(false);
            }
            sync.vidclk.set(sync.vidclk.get(), sync.vidclk.serial());
        }
        sync.extclk.set(sync.extclk.get(), sync.extclk.serial());

        let paused = !paused;
        self.control.set_paused(paused);
        sync.audclk.set_paused(paused);
        sync.vidclk.set_paused(paused);
        sync.extclk.set_paused(paused);
    }

    pub fn toggle_pause(&self) {
        self.stream_toggle_pause();
        self.control.set_step(false);
        info!("{} {} 暂停状态: {}", log_ctx(), if self.control.is_paused() { "⏸" } else { "▶" }, self.control.is_paused());
    }

    /// 单步：暂停中先恢复，刷新循环显示一帧后重新暂停
    pub fn step_to_next_frame(&self) {
        if self.control.is_paused() {
            self.stream_toggle_pause();
        }
        self.control.set_step(true);
    }

    /// 提交 seek（微秒或字节），已有未执行请求时忽略
    pub fn stream_seek(&self, pos: i64, rel: i64, by_bytes: bool) {
        if self.control.request_seek(pos, rel, by_bytes) {
            debug!("{} ⏩ seek 请求: pos={} rel={} bytes={}", log_ctx(), pos, rel, by_bytes);
        }
    }

    /// 相对当前位置 seek `incr` 秒
    pub fn seek_relative(&self, incr: f64) {
        let selection = self.streams.read();
        if selection.seek_by_bytes {
            let mut pos = -1;
            if selection.video.is_some() {
                pos = self.pictq.last_pos();
            }
            if pos < 0 && selection.audio.is_some() {
                pos = self.sampq.last_pos();
            }
            if pos < 0 {
                pos = self.byte_position();
            }
            let bytes = if selection.source.bit_rate > 0 {
                incr * selection.source.bit_rate as f64 / 8.0
            } else {
                incr * 180_000.0
            };
            drop(selection);
            self.stream_seek((pos as f64 + bytes) as i64, bytes as i64, true);
        } else {
            let start = selection.source.start_time_us;
            drop(selection);
            let mut pos = self.sync.master_clock();
            if pos.is_nan() {
                pos = self.control.last_seek_pos() as f64 / TIME_BASE as f64;
            }
            pos += incr;
            if let Some(start) = start {
                let start = start as f64 / TIME_BASE as f64;
                if pos < start {
                    pos = start;
                }
            }
            self.stream_seek((pos * TIME_BASE as f64) as i64, (incr * TIME_BASE as f64) as i64, false);
        }
    }

    /// 按时长比例 seek；时长未知或按字节 seek 时按文件大小比例
    pub fn seek_to_fraction(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        let selection = self.streams.read();
        let source = &selection.source;
        match source.duration_us {
            Some(duration) if duration > 0 && !selection.seek_by_bytes => {
                let mut ts = (fraction * duration as f64) as i64;
                if let Some(start) = source.start_time_us {
                    ts += start;
                }
                drop(selection);
                self.stream_seek(ts, 0, false);
            }
            _ => {
                if let Some(size) = source.byte_size {
                    let pos = (size as f64 * fraction) as i64;
                    drop(selection);
                    self.stream_seek(pos, 0, true);
                }
            }
        }
    }

    /// 跳到相邻章节；章节不足两个时退化为 ±600 秒
    pub fn seek_chapter(&self, incr: i32) {
        let chapters = self.streams.read().source.chapters.clone();
        if chapters.len() <= 1 {
            self.seek_relative(600.0 * incr.signum() as f64);
            return;
        }
        let clock = self.sync.master_clock();
        let pos = if clock.is_nan() {
            self.control.last_seek_pos()
        } else {
            (clock * TIME_BASE as f64) as i64
        };
        let current = chapters
            .iter()
            .position(|ch| pos < ch.start_us)
            .map(|i| i as i64 - 1)
            .unwrap_or(chapters.len() as i64);
        let target = (current + incr as i64).max(0);
        if let Some(chapter) = chapters.get(target as usize) {
            info!("{} 📖 跳转到章节 {}", log_ctx(), target);
            self.stream_seek(chapter.start_us, 0, false);
        }
    }

    /// 轮换显示模式，跳过当前流不支持的模式
    pub fn cycle_show_mode(&self) {
        let mut selection = self.streams.write();
        let current = selection.show_mode;
        let mut candidate = current;
        let mut chosen = None;
        for _ in 0..3 {
            candidate = candidate.next();
            if candidate == current {
                break;
            }
            let supported = match candidate {
                ShowMode::Video => selection.video.is_some(),
                _ => selection.audio.is_some(),
            };
            if supported {
                chosen = Some(candidate);
                break;
            }
        }
        if let Some(next) = chosen {
            selection.show_mode = next;
            self.control.set_force_refresh(true);
        }
    }

    /// 状态快照
    pub fn stats(&self) -> PlaybackStats {
        let selection = self.streams.read();
        let has_audio = selection.audio.is_some();
        let has_video = selection.video.is_some();
        drop(selection);

        let sync = &self.sync;
        let (label, av_diff) = match (has_audio, has_video) {
            (true, true) => ("A-V", sync.audclk.get() - sync.vidclk.get()),
            (false, true) => ("M-V", sync.master_clock() - sync.vidclk.get()),
            (true, false) => ("M-A", sync.master_clock() - sync.audclk.get()),
            (false, false) => ("   ", 0.0),
        };

        PlaybackStats {
            master_clock: sync.master_clock(),
            diff_label: label.to_string(),
            av_diff,
            frame_drops: sync.frame_drops(),
            audio_queue_bytes: if has_audio { self.audioq.size_bytes() } else { 0 },
            video_queue_bytes: if has_video { self.videoq.size_bytes() } else { 0 },
            subtitle_queue_bytes: self.subtitleq.size_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::source::Chapter;
    use crossbeam_channel::unbounded;

    fn session() -> Arc<Session> {
        let (tx, _rx) = unbounded();
        Session::new(Arc::new(PlayerOptions::default()), tx)
    }

    fn take_seek(s: &Session) -> Option<crate::player::control::SeekRequest> {
        let req = s.control.pending_seek();
        s.control.finish_seek();
        req
    }

    #[test]
    fn test_sample_ring_wraps() {
        let mut ring = SampleRing::new();
        let chunk: Vec<f32> = (0..SAMPLE_ARRAY_SIZE - 2).map(|_| 0.5).collect();
        ring.push(&chunk);
        ring.push(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ring.window(4, 0), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ring.window(2, 2), vec![1.0, 2.0]);
    }

    #[test]
    fn test_toggle_pause_pauses_all_clocks() {
        let s = session();
        s.toggle_pause();
        assert!(s.control.is_paused());
        assert!(s.sync.audclk.is_paused());
        assert!(s.sync.vidclk.is_paused());
        assert!(s.sync.extclk.is_paused());
        s.toggle_pause();
        assert!(!s.control.is_paused());
        assert!(!s.sync.extclk.is_paused());
    }

    #[test]
    fn test_resume_compensates_frame_timer() {
        let s = session();
        s.sync.vidclk.set(1.0, 0);
        s.sync.set_frame_timer(10.0);
        s.toggle_pause();
        std::thread::sleep(std::time::Duration::from_millis(30));
        s.toggle_pause();
        assert!(s.sync.frame_timer() > 10.02);
    }

    #[test]
    fn test_step_unpauses_and_sets_step() {
        let s = session();
        s.toggle_pause();
        s.step_to_next_frame();
        assert!(!s.control.is_paused());
        assert!(s.control.is_stepping());
    }

    #[test]
    fn test_relative_seek_by_time_clamps_to_start() {
        let s = session();
        s.streams.write().source.start_time_us = Some(0);
        s.sync.extclk.set(3.0, 0);
        s.seek_relative(-10.0);
        let req = take_seek(&s).unwrap();
        assert_eq!(req.pos, 0);
        assert_eq!(req.rel, -10_000_000);
        assert!(!req.by_bytes);
    }

    #[test]
    fn test_relative_seek_by_bytes_uses_bitrate() {
        let s = session();
        {
            let mut sel = s.streams.write();
            sel.seek_by_bytes = true;
            sel.source.bit_rate = 800_000;
        }
        s.set_byte_position(1_000);
        s.seek_relative(10.0);
        let req = take_seek(&s).unwrap();
        assert!(req.by_bytes);
        assert_eq!(req.pos, 1_000 + 1_000_000);
        assert_eq!(req.rel, 1_000_000);
    }

    #[test]
    fn test_seek_chapter() {
        let s = session();
        s.streams.write().source.chapters = vec![
            Chapter { start_us: 0, end_us: 60_000_000 },
            Chapter { start_us: 60_000_000, end_us: 120_000_000 },
            Chapter { start_us: 120_000_000, end_us: 180_000_000 },
        ];
        s.sync.extclk.set(70.0, 0);
        s.seek_chapter(1);
        assert_eq!(take_seek(&s).unwrap().pos, 120_000_000);
        s.seek_chapter(-1);
        assert_eq!(take_seek(&s).unwrap().pos, 0);
        // 超出最后一章不跳
        s.seek_chapter(5);
        assert!(take_seek(&s).is_none());
    }

    #[test]
    fn test_seek_chapter_falls_back_to_ten_minutes() {
        let s = session();
        s.sync.extclk.set(5.0, 0);
        s.seek_chapter(1);
        let req = take_seek(&s).unwrap();
        assert_eq!(req.rel, 600_000_000);
    }

    #[test]
    fn test_seek_to_fraction() {
        let s = session();
        s.streams.write().source.duration_us = Some(100_000_000);
        s.seek_to_fraction(0.25);
        assert_eq!(take_seek(&s).unwrap().pos, 25_000_000);

        {
            let mut sel = s.streams.write();
            sel.source.duration_us = None;
            sel.source.byte_size = Some(4_000);
        }
        s.seek_to_fraction(0.5);
        let req = take_seek(&s).unwrap();
        assert!(req.by_bytes);
        assert_eq!(req.pos, 2_000);
    }
}
