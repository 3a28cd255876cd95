use crate::core::{log_ctx, MediaType, PlaybackStats, PlayerError, PlayerOptions, Result, ShowMode};
use crate::player::reader::ReaderThread;
use crate::player::session::{PlayerEvent, Session};
use crate::player::source::{AudioBackend, MediaSource, VideoSink};
use crate::player::sync::{Presenter, REFRESH_RATE};
use crossbeam_channel::{select, unbounded, Receiver};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

/// 宿主发给播放器的控制命令
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    TogglePause,
    StepFrame,
    /// 相对 seek（秒）
    SeekRelative(f64),
    /// 按总时长比例 seek，0.0 ~ 1.0
    SeekToFraction(f64),
    /// 相对章节跳转
    SeekChapter(i32),
    CycleStream(MediaType),
    CycleShowMode,
    ForceRefresh,
    SetVolume(f32),
    ToggleMute,
    Quit,
}

/// 播放器 - 宿主侧入口
///
/// `open` 启动读取线程（再由它拉起各路解码线程和音频输出），
/// 宿主在自己的线程里调用 [`run`](Self::run) 或周期性调用 [`refresh`](Self::refresh) 驱动画面。
pub struct Player {
    session: Arc<Session>,
    reader: Option<ReaderThread>,
    presenter: Presenter,
    events: Receiver<PlayerEvent>,
}

impl Player {
    pub fn open(
        source: Box<dyn MediaSource>,
        audio_backend: Option<Box<dyn AudioBackend>>,
        options: PlayerOptions,
    ) -> Result<Self> {
        options.validate()?;
        info!("{} 🎮 创建播放器: {}", log_ctx(), source.description());

        let (events_tx, events) = unbounded();
        let session = Session::new(Arc::new(options), events_tx);
        let reader = ReaderThread::start(session.clone(), source, audio_backend)?;

        info!("{} ✅ 播放器已启动", log_ctx());
        Ok(Self {
            session,
            reader: Some(reader),
            presenter: Presenter::new(),
            events,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// 读取线程发出的事件
    pub fn events(&self) -> &Receiver<PlayerEvent> {
        &self.events
    }

    pub fn stats(&self) -> PlaybackStats {
        self.session.stats()
    }

    /// 执行一条命令，返回 false 表示宿主要求退出
    pub fn handle_command(&mut self, command: HostCommand) -> bool {
        let s = &self.session;
        debug!("{} 🎛 收到命令: {:?}", log_ctx(), command);
        match command {
            HostCommand::TogglePause => s.toggle_pause(),
            HostCommand::StepFrame => s.step_to_next_frame(),
            HostCommand::SeekRelative(incr) => s.seek_relative(incr),
            HostCommand::SeekToFraction(fraction) => s.seek_to_fraction(fraction),
            HostCommand::SeekChapter(incr) => s.seek_chapter(incr),
            HostCommand::CycleStream(kind) => s.control.request_stream_cycle(kind),
            HostCommand::CycleShowMode => s.cycle_show_mode(),
            HostCommand::ForceRefresh => s.control.set_force_refresh(true),
            HostCommand::SetVolume(volume) => {
                s.volume.store(volume.clamp(0.0, 1.0));
                info!("{} 🔊 音量: {:.2}", log_ctx(), s.volume.load());
            }
            HostCommand::ToggleMute => {
                let muted = s.control.toggle_mute();
                info!("{} 🔇 静音: {}", log_ctx(), muted);
            }
            HostCommand::Quit => return false,
        }
        true
    }

    /// 刷新一次画面，返回距下次刷新的建议等待时间（秒）
    pub fn refresh(&mut self, sink: &mut dyn VideoSink) -> f64 {
        let mut remaining_time = REFRESH_RATE;
        let s = &self.session;
        let show_mode = s.streams.read().show_mode;
        if show_mode != ShowMode::None && (!s.control.is_paused() || s.control.force_refresh()) {
            self.presenter.video_refresh(s, sink, &mut remaining_time);
        }
        remaining_time
    }

    /// 宿主事件循环：等待命令或读取线程事件，空闲时按节奏刷新画面
    ///
    /// 读取线程因错误退出时返回 `Err`。
    pub fn run(&mut self, sink: &mut dyn VideoSink, commands: &Receiver<HostCommand>) -> Result<()> {
        let events = self.events.clone();
        let mut remaining_time = 0.0f64;

        let result = loop {
            let timeout = Duration::from_secs_f64(remaining_time.max(0.0));
            select! {
                recv(commands) -> command => match command {
                    Ok(command) => {
                        if !self.handle_command(command) {
                            info!("{} ⏹ 宿主请求退出", log_ctx());
                            break Ok(());
                        }
                        // 处理完命令立即刷新一次
                        remaining_time = 0.0;
                    }
                    Err(_) => {
                        info!("{} 命令通道已关闭，退出", log_ctx());
                        break Ok(());
                    }
                },
                recv(events) -> event => match event {
                    Ok(PlayerEvent::EndOfStream) | Ok(PlayerEvent::Quit(None)) | Err(_) => break Ok(()),
                    Ok(PlayerEvent::Quit(Some(message))) => break Err(PlayerError::ReadError(message)),
                },
                default(timeout) => {
                    remaining_time = self.refresh(sink);
                }
            }
        };

        self.close();
        result
    }

    /// 停止读取线程（它负责关闭各路解码线程和音频输出）
    pub fn close(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            info!("{} ⏹️  关闭播放器", log_ctx());
            reader.stop();
            info!("{} ✅ 播放器已关闭", log_ctx());
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}
