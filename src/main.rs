use anyhow::{Context, Result};
use avsync_player::core::{MediaType, PlaybackStats, ShowMode, SubtitleFrame, VideoFrame};
use avsync_player::player::{AudioBackend, FfmpegSource, HostCommand, Player, VideoSink};
use avsync_player::PlayerOptions;
use crossbeam_channel::{unbounded, Sender};
use log::{debug, info, warn};
use std::io::BufRead;
use std::thread;

/// 没有窗口时的画面输出：只记录显示了哪些帧
struct LogSink {
    frames: u64,
}

impl VideoSink for LogSink {
    fn display_picture(&mut self, frame: &VideoFrame, subtitle: Option<&SubtitleFrame>) {
        self.frames += 1;
        debug!("🖼 显示第 {} 帧 pts={:.3} {}x{}", self.frames, frame.pts, frame.width, frame.height);
        if let Some(sub) = subtitle {
            debug!("💬 {}", sub.payload.text);
        }
    }

    fn display_audio(&mut self, mode: ShowMode, samples: &[f32], channels: u16) {
        debug!("📊 {:?}: {} 个采样, {} 声道", mode, samples.len(), channels);
    }

    fn status(&mut self, stats: &PlaybackStats) {
        debug!("{}", serde_json::to_string(stats).unwrap_or_default());
    }
}

/// 标准输入按行读取按键
fn spawn_key_reader(commands: Sender<HostCommand>, seek_interval: f64) {
    let spawned = thread::Builder::new().name("stdin_keys".to_string()).spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            let command = match line.trim() {
                "q" => HostCommand::Quit,
                "p" | "" => HostCommand::TogglePause,
                "s" => HostCommand::StepFrame,
                "m" => HostCommand::ToggleMute,
                "a" => HostCommand::CycleStream(MediaType::Audio),
                "v" => HostCommand::CycleStream(MediaType::Video),
                "t" => HostCommand::CycleStream(MediaType::Subtitle),
                "w" => HostCommand::CycleShowMode,
                "left" => HostCommand::SeekRelative(-seek_interval),
                "right" => HostCommand::SeekRelative(seek_interval),
                "down" => HostCommand::SeekRelative(-60.0),
                "up" => HostCommand::SeekRelative(60.0),
                "pgdown" => HostCommand::SeekChapter(-1),
                "pgup" => HostCommand::SeekChapter(1),
                other => {
                    if let Some(fraction) = other.strip_suffix('%').and_then(|v| v.parse::<f64>().ok()) {
                        HostCommand::SeekToFraction(fraction / 100.0)
                    } else if let Some(volume) = other.strip_prefix("vol ").and_then(|v| v.parse::<f32>().ok()) {
                        HostCommand::SetVolume(volume)
                    } else {
                        warn!("未知命令: {}", other);
                        continue;
                    }
                }
            };
            if commands.send(command).is_err() {
                break;
            }
        }
    });
    if let Err(e) = spawned {
        warn!("无法启动按键读取线程: {}", e);
    }
}

#[cfg(feature = "cpal-output")]
fn audio_backend() -> Option<Box<dyn AudioBackend>> {
    Some(Box::new(avsync_player::player::CpalAudioBackend::new()))
}

#[cfg(not(feature = "cpal-output"))]
fn audio_backend() -> Option<Box<dyn AudioBackend>> {
    warn!("⚠️ 未启用音频输出，音频流将被忽略");
    None
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mut args = std::env::args().skip(1);
    let url = args
        .next()
        .context("用法: avsync_player <文件或URL> [配置文件.json]")?;
    let options = match args.next() {
        Some(path) => PlayerOptions::load(&path)?,
        None => PlayerOptions::default(),
    };

    info!("🎬 avsync_player 启动");
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("FFmpeg 初始化失败: {}", e))?;
    info!("✅ FFmpeg 初始化成功");

    let seek_interval = options.seek_interval;
    let source = FfmpegSource::open(&url)?;
    let mut player = Player::open(Box::new(source), audio_backend(), options)?;

    let (commands_tx, commands) = unbounded();
    spawn_key_reader(commands_tx, seek_interval);

    let mut sink = LogSink { frames: 0 };
    player.run(&mut sink, &commands)?;

    info!("👋 退出，共显示 {} 帧", sink.frames);
    Ok(())
}
