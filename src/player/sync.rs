use crossbeam::atomic::AtomicCell;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::{log_ctx, relative_time, Clock, Frame, MediaType, ShowMode, SyncSource};
use crate::player::session::Session;
use crate::player::source::VideoSink;

/// 同步阈值下限（秒）
pub const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;
/// 同步阈值上限（秒）
pub const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;
/// 帧时长超过该值时不再用重复帧方式追赶
pub const AV_SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;

pub const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
pub const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;
pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;

/// 默认刷新间隔（秒）
pub const REFRESH_RATE: f64 = 0.01;

/// 状态行最短间隔（秒）
const STATUS_INTERVAL: f64 = 0.03;

/// 可视化窗口（每声道采样数）
const VIS_WINDOW_FRAMES: usize = 1024;

/// 按视频时钟与主时钟的差值修正帧间延迟
///
/// `diff` 为 视频时钟 - 主时钟。落在死区内或差值异常（NaN、超过 `max_frame_duration`）时不修正。
pub fn target_delay(delay: f64, diff: f64, max_frame_duration: f64) -> f64 {
    let sync_threshold = AV_SYNC_THRESHOLD_MIN.max(AV_SYNC_THRESHOLD_MAX.min(delay));
    if diff.is_nan() || diff.abs() >= max_frame_duration {
        return delay;
    }
    if diff <= -sync_threshold {
        (delay + diff).max(0.0)
    } else if diff >= sync_threshold && delay > AV_SYNC_FRAMEDUP_THRESHOLD {
        delay + diff
    } else if diff >= sync_threshold {
        2.0 * delay
    } else {
        delay
    }
}

/// 两帧之间的名义时长；serial 不同返回 0
pub fn frame_duration<T>(vp: &Frame<T>, next: &Frame<T>, max_frame_duration: f64) -> f64 {
    if vp.serial != next.serial {
        return 0.0;
    }
    let duration = next.pts - vp.pts;
    if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
        vp.duration
    } else {
        duration
    }
}

/// 外部时钟速度的下一步取值
///
/// 参数为各已打开流的包队列长度（未打开为 None）。
pub fn next_external_speed(speed: f64, video_packets: Option<usize>, audio_packets: Option<usize>) -> f64 {
    let starving = video_packets.map_or(false, |n| n <= EXTERNAL_CLOCK_MIN_FRAMES)
        || audio_packets.map_or(false, |n| n <= EXTERNAL_CLOCK_MIN_FRAMES);
    let plenty = video_packets.map_or(true, |n| n > EXTERNAL_CLOCK_MAX_FRAMES)
        && audio_packets.map_or(true, |n| n > EXTERNAL_CLOCK_MAX_FRAMES);

    if starving {
        EXTERNAL_CLOCK_SPEED_MIN.max(speed - EXTERNAL_CLOCK_SPEED_STEP)
    } else if plenty {
        EXTERNAL_CLOCK_SPEED_MAX.min(speed + EXTERNAL_CLOCK_SPEED_STEP)
    } else if speed != 1.0 {
        speed + EXTERNAL_CLOCK_SPEED_STEP * (1.0 - speed) / (1.0 - speed).abs()
    } else {
        speed
    }
}

/// 三个时钟与主时钟选择
pub struct SyncController {
    pub audclk: Clock,
    pub vidclk: Clock,
    pub extclk: Clock,
    configured: SyncSource,
    has_audio: AtomicBool,
    has_video: AtomicBool,
    frame_timer: AtomicCell<f64>,
    max_frame_duration: AtomicCell<f64>,
    frame_drops_early: AtomicU64,
    frame_drops_late: AtomicU64,
}

impl SyncController {
    pub fn new(configured: SyncSource, audio_serial: Arc<AtomicI32>, video_serial: Arc<AtomicI32>) -> Self {
        Self {
            audclk: Clock::new(Some(audio_serial)),
            vidclk: Clock::new(Some(video_serial)),
            extclk: Clock::new(None),
            configured,
            has_audio: AtomicBool::new(false),
            has_video: AtomicBool::new(false),
            frame_timer: AtomicCell::new(0.0),
            max_frame_duration: AtomicCell::new(3600.0),
            frame_drops_early: AtomicU64::new(0),
            frame_drops_late: AtomicU64::new(0),
        }
    }

    /// 读取线程打开 / 关闭流时更新
    pub fn set_stream_present(&self, kind: MediaType, present: bool) {
        match kind {
            MediaType::Audio => self.has_audio.store(present, Ordering::Release),
            MediaType::Video => self.has_video.store(present, Ordering::Release),
            MediaType::Subtitle => {}
        }
    }

    /// 实际生效的主时钟：视频缺失退回音频，音频缺失退回外部时钟
    pub fn master_sync_type(&self) -> SyncSource {
        match self.configured {
            SyncSource::Video => {
                if self.has_video.load(Ordering::Acquire) {
                    SyncSource::Video
                } else {
                    SyncSource::Audio
                }
            }
            SyncSource::Audio => {
                if self.has_audio.load(Ordering::Acquire) {
                    SyncSource::Audio
                } else {
                    SyncSource::External
                }
            }
            SyncSource::External => SyncSource::External,
        }
    }

    pub fn master_clock(&self) -> f64 {
        match self.master_sync_type() {
            SyncSource::Video => self.vidclk.get(),
            SyncSource::Audio => self.audclk.get(),
            SyncSource::External => self.extclk.get(),
        }
    }

    /// 视频不是主时钟时，按视频时钟与主时钟的偏差修正延迟
    pub fn compute_target_delay(&self, delay: f64) -> f64 {
        if self.master_sync_type() == SyncSource::Video {
            return delay;
        }
        let diff = self.vidclk.get() - self.master_clock();
        let corrected = target_delay(delay, diff, self.max_frame_duration());
        debug!("video: delay={:.3} A-V={:.3}", corrected, -diff);
        corrected
    }

    pub fn vp_duration<T>(&self, vp: &Frame<T>, next: &Frame<T>) -> f64 {
        frame_duration(vp, next, self.max_frame_duration())
    }

    /// 根据缓冲水位微调外部时钟速度
    pub fn check_external_clock_speed(&self, video_packets: Option<usize>, audio_packets: Option<usize>) {
        let speed = self.extclk.speed();
        let next = next_external_speed(speed, video_packets, audio_packets);
        if next != speed {
            self.extclk.set_speed(next);
        }
    }

    /// 显示新帧后更新视频时钟，并让外部时钟跟随
    pub fn update_video_pts(&self, pts: f64, serial: i32) {
        self.vidclk.set(pts, serial);
        self.extclk.sync_to_slave(&self.vidclk);
    }

    pub fn frame_timer(&self) -> f64 {
        self.frame_timer.load()
    }

    pub fn set_frame_timer(&self, value: f64) {
        self.frame_timer.store(value);
    }

    pub fn max_frame_duration(&self) -> f64 {
        self.max_frame_duration.load()
    }

    pub fn set_max_frame_duration(&self, value: f64) {
        self.max_frame_duration.store(value);
    }

    pub fn count_early_drop(&self) {
        self.frame_drops_early.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_late_drop(&self) {
        self.frame_drops_late.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_drops_early(&self) -> u64 {
        self.frame_drops_early.load(Ordering::Relaxed)
    }

    pub fn frame_drops_late(&self) -> u64 {
        self.frame_drops_late.load(Ordering::Relaxed)
    }

    pub fn frame_drops(&self) -> u64 {
        self.frame_drops_early() + self.frame_drops_late()
    }
}

/// 宿主线程上的刷新循环状态
pub struct Presenter {
    last_status_time: Option<f64>,
    last_vis_time: f64,
}

impl Presenter {
    pub fn new() -> Self {
        Self {
            last_status_time: None,
            last_vis_time: 0.0,
        }
    }

    /// 一次刷新：决定显示、丢弃或等待，`remaining_time` 只会被调小
    pub fn video_refresh(&mut self, s: &Session, sink: &mut dyn VideoSink, remaining_time: &mut f64) {
        let sync = &s.sync;
        let control = &s.control;
        let options = &s.options;
        let (has_video, has_audio, has_subtitle, show_mode, realtime) = {
            let sel = s.streams.read();
            (
                sel.video.is_some(),
                sel.audio.is_some(),
                sel.subtitle.is_some(),
                sel.show_mode,
                sel.source.realtime,
            )
        };

        if !control.is_paused() && sync.master_sync_type() == SyncSource::External && realtime {
            sync.check_external_clock_speed(
                has_video.then(|| s.videoq.len()),
                has_audio.then(|| s.audioq.len()),
            );
        }

        if !options.display_disable && show_mode != ShowMode::Video && has_audio {
            let time = relative_time();
            if control.force_refresh() || self.last_vis_time + options.rdftspeed < time {
                self.display_audio(s, sink, show_mode);
                self.last_vis_time = time;
            }
            *remaining_time = remaining_time.min(self.last_vis_time + options.rdftspeed - time);
        }

        if has_video {
            self.refresh_picture(s, sink, remaining_time, has_subtitle, show_mode);
        }
        control.set_force_refresh(false);

        if options.show_status {
            let now = relative_time();
            let due = self.last_status_time.map_or(true, |last| now - last >= STATUS_INTERVAL);
            if due {
                let stats = s.stats();
                debug!("{}", stats.status_line());
                sink.status(&stats);
                self.last_status_time = Some(now);
            }
        }
    }

    fn refresh_picture(
        &mut self,
        s: &Session,
        sink: &mut dyn VideoSink,
        remaining_time: &mut f64,
        has_subtitle: bool,
        show_mode: ShowMode,
    ) {
        let sync = &s.sync;
        let control = &s.control;
        let pictq = &s.pictq;

        let mut redisplay = control.force_refresh() && pictq.prev();

        loop {
            if pictq.nb_remaining() == 0 {
                // 队列里没有可显示的画面
                return;
            }
            let (lastvp, vp) = match (pictq.peek_last(), pictq.peek()) {
                (Some(lastvp), Some(vp)) => (lastvp, vp),
                _ => return,
            };

            if vp.serial != s.videoq.serial() {
                pictq.next();
                redisplay = false;
                continue;
            }

            if lastvp.serial != vp.serial && !redisplay {
                sync.set_frame_timer(relative_time());
            }

            if !control.is_paused() {
                let last_duration = sync.vp_duration(&lastvp, &vp);
                let delay = if redisplay { 0.0 } else { sync.compute_target_delay(last_duration) };

                let time = relative_time();
                let frame_timer = sync.frame_timer();
                if time < frame_timer + delay && !redisplay {
                    *remaining_time = remaining_time.min(frame_timer + delay - time);
                    return;
                }

                let mut frame_timer = frame_timer + delay;
                if delay > 0.0 && time - frame_timer > AV_SYNC_THRESHOLD_MAX {
                    frame_timer = time;
                }
                sync.set_frame_timer(frame_timer);

                if !redisplay && !vp.pts.is_nan() {
                    sync.update_video_pts(vp.pts, vp.serial);
                }

                if pictq.nb_remaining() > 1 {
                    if let Some(nextvp) = pictq.peek_next() {
                        let duration = sync.vp_duration(&vp, &nextvp);
                        let drop_allowed =
                            redisplay || s.options.framedrop.allows_drop(sync.master_sync_type());
                        if !control.is_stepping() && drop_allowed && time > frame_timer + duration {
                            if !redisplay {
                                sync.count_late_drop();
                                debug!("{} 🗑 丢弃迟到帧 pts={:.3}", log_ctx(), vp.pts);
                            }
                            pictq.next();
                            redisplay = false;
                            continue;
                        }
                    }
                }

                if has_subtitle {
                    Self::expire_subtitles(s);
                }
            }

            if !s.options.display_disable && show_mode == ShowMode::Video {
                let subtitle = if has_subtitle { Self::visible_subtitle(s, vp.pts) } else { None };
                sink.display_picture(&vp, subtitle.as_ref());
            }
            pictq.next();

            if control.is_stepping() && !control.is_paused() {
                s.stream_toggle_pause();
            }
            return;
        }
    }

    /// 丢弃显示窗口已过或已被下一条覆盖的字幕
    fn expire_subtitles(s: &Session) {
        let vid_pts = s.sync.vidclk.pts();
        while s.subpq.nb_remaining() > 0 {
            let sp = match s.subpq.peek() {
                Some(sp) => sp,
                None => break,
            };
            let sp2 = if s.subpq.nb_remaining() > 1 { s.subpq.peek_next() } else { None };
            let expired = sp.serial != s.subtitleq.serial()
                || vid_pts > sp.pts + sp.payload.end_offset()
                || sp2.map_or(false, |sp2| vid_pts > sp2.pts + sp2.payload.start_offset());
            if !expired {
                break;
            }
            s.subpq.next();
        }
    }

    fn visible_subtitle(s: &Session, pts: f64) -> Option<crate::core::SubtitleFrame> {
        if s.subpq.nb_remaining() == 0 {
            return None;
        }
        s.subpq
            .peek()
            .filter(|sp| pts >= sp.pts + sp.payload.start_offset())
    }

    fn display_audio(&self, s: &Session, sink: &mut dyn VideoSink, mode: ShowMode) {
        let spec = match s.streams.read().audio_spec {
            Some(spec) => spec,
            None => return,
        };
        let channels = spec.channels.max(1);
        let delay = 2 * spec.buffer_frames as usize * channels as usize;
        let window = s.samples.lock().window(VIS_WINDOW_FRAMES * channels as usize, delay);
        sink.display_audio(mode, &window, channels);
    }
}

impl Default for Presenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pts: f64, serial: i32, duration: f64) -> Frame<()> {
        let mut f = Frame::new((), serial);
        f.pts = pts;
        f.duration = duration;
        f
    }

    #[test]
    fn test_target_delay_inside_dead_band() {
        assert_eq!(target_delay(0.04, 0.01, 10.0), 0.04);
        assert_eq!(target_delay(0.04, f64::NAN, 10.0), 0.04);
        // 差值超过最大帧时长，不修正
        assert_eq!(target_delay(0.04, 20.0, 10.0), 0.04);
    }

    #[test]
    fn test_target_delay_catch_up() {
        // 视频落后：缩短延迟，不小于 0
        assert!((target_delay(0.04, -0.05, 10.0) - 0.0).abs() < 1e-12);
        assert!((target_delay(0.2, -0.15, 10.0) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_target_delay_slow_down() {
        // 视频超前且帧时长小：加倍
        assert!((target_delay(0.04, 0.05, 10.0) - 0.08).abs() < 1e-12);
        // 帧时长超过重复帧阈值：直接加上差值
        assert!((target_delay(0.2, 0.15, 10.0) - 0.35).abs() < 1e-12);
    }

    #[test]
    fn test_frame_duration() {
        let a = frame(1.0, 1, 0.04);
        let b = frame(1.04, 1, 0.04);
        assert!((frame_duration(&a, &b, 10.0) - 0.04).abs() < 1e-9);

        // 时间戳倒退，退回帧自带时长
        let back = frame(0.5, 1, 0.04);
        assert_eq!(frame_duration(&a, &back, 10.0), 0.04);

        // 间隔超过上限
        let far = frame(30.0, 1, 0.04);
        assert_eq!(frame_duration(&a, &far, 10.0), 0.04);

        // serial 不同
        let other = frame(1.04, 2, 0.04);
        assert_eq!(frame_duration(&a, &other, 10.0), 0.0);
    }

    #[test]
    fn test_external_speed_controller() {
        // 任一队列见底：减速
        assert!((next_external_speed(1.0, Some(2), Some(50)) - 0.999).abs() < 1e-12);
        assert_eq!(next_external_speed(EXTERNAL_CLOCK_SPEED_MIN, Some(0), None), EXTERNAL_CLOCK_SPEED_MIN);
        // 全部充足：加速，不超过上限
        assert!((next_external_speed(1.0, Some(11), Some(11)) - 1.001).abs() < 1e-12);
        assert_eq!(next_external_speed(EXTERNAL_CLOCK_SPEED_MAX, Some(20), None), EXTERNAL_CLOCK_SPEED_MAX);
        // 中间水位：向 1.0 回归
        assert!((next_external_speed(0.95, Some(5), Some(5)) - 0.951).abs() < 1e-12);
        assert!((next_external_speed(1.005, Some(5), None) - 1.004).abs() < 1e-12);
        assert_eq!(next_external_speed(1.0, Some(5), None), 1.0);
    }

    #[test]
    fn test_master_sync_fallback() {
        let ctl = SyncController::new(
            SyncSource::Video,
            Arc::new(AtomicI32::new(0)),
            Arc::new(AtomicI32::new(0)),
        );
        assert_eq!(ctl.master_sync_type(), SyncSource::Audio);
        ctl.set_stream_present(MediaType::Video, true);
        assert_eq!(ctl.master_sync_type(), SyncSource::Video);

        let ctl = SyncController::new(
            SyncSource::Audio,
            Arc::new(AtomicI32::new(0)),
            Arc::new(AtomicI32::new(0)),
        );
        assert_eq!(ctl.master_sync_type(), SyncSource::External);
        ctl.set_stream_present(MediaType::Audio, true);
        assert_eq!(ctl.master_sync_type(), SyncSource::Audio);
    }

    fn subtitle_session() -> Arc<Session> {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let s = Session::new(Arc::new(crate::core::PlayerOptions::default()), tx);
        s.subtitleq.start();
        s
    }

    fn push_subtitle(s: &Session, pts: f64, start_ms: u32, end_ms: u32, text: &str) {
        let subtitle = crate::core::Subtitle {
            kind: crate::core::SubtitleKind::Text,
            start_display_ms: start_ms,
            end_display_ms: end_ms,
            text: text.to_string(),
            rects: Vec::new(),
        };
        let mut frame = Frame::new(subtitle, s.subtitleq.serial());
        frame.pts = pts;
        assert!(s.subpq.peek_writable().is_some());
        s.subpq.push(frame);
    }

    fn front_text(s: &Session) -> Option<String> {
        s.subpq.peek().map(|sp| sp.payload.text)
    }

    #[test]
    fn test_subtitle_expires_after_end_window() {
        let s = subtitle_session();
        push_subtitle(&s, 1.0, 0, 2000, "a");

        s.sync.vidclk.set(2.5, 0);
        Presenter::expire_subtitles(&s);
        assert_eq!(front_text(&s).as_deref(), Some("a"));

        s.sync.vidclk.set(3.5, 0);
        Presenter::expire_subtitles(&s);
        assert_eq!(s.subpq.nb_remaining(), 0);
    }

    #[test]
    fn test_subtitle_replaced_by_next_one() {
        let s = subtitle_session();
        push_subtitle(&s, 1.0, 0, 10_000, "a");
        push_subtitle(&s, 2.0, 0, 10_000, "b");

        s.sync.vidclk.set(1.5, 0);
        Presenter::expire_subtitles(&s);
        assert_eq!(front_text(&s).as_deref(), Some("a"));

        s.sync.vidclk.set(2.5, 0);
        Presenter::expire_subtitles(&s);
        assert_eq!(front_text(&s).as_deref(), Some("b"));
        assert_eq!(s.subpq.nb_remaining(), 1);
    }

    #[test]
    fn test_subtitle_from_old_serial_expires() {
        let s = subtitle_session();
        push_subtitle(&s, 1.0, 0, 10_000, "old");
        s.subtitleq.put_flush().unwrap();
        push_subtitle(&s, 8.0, 0, 1000, "new");

        s.sync.vidclk.set(1.5, 0);
        Presenter::expire_subtitles(&s);
        assert_eq!(front_text(&s).as_deref(), Some("new"));
    }

    #[test]
    fn test_subtitle_visible_after_start_offset() {
        let s = subtitle_session();
        assert!(Presenter::visible_subtitle(&s, 1.0).is_none());

        push_subtitle(&s, 1.0, 500, 2000, "a");
        assert!(Presenter::visible_subtitle(&s, 1.2).is_none());
        let shown = Presenter::visible_subtitle(&s, 1.6).map(|sp| sp.payload.text);
        assert_eq!(shown.as_deref(), Some("a"));
    }

    #[test]
    fn test_compute_target_delay_uses_master() {
        let ctl = SyncController::new(
            SyncSource::External,
            Arc::new(AtomicI32::new(0)),
            Arc::new(AtomicI32::new(0)),
        );
        ctl.set_max_frame_duration(10.0);
        ctl.vidclk.set(10.0, 0);
        ctl.extclk.set(10.5, 0);
        // 视频落后 0.5 秒
        assert_eq!(ctl.compute_target_delay(0.04), 0.0);
    }
}
