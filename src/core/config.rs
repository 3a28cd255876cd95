use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{PlayerError, Result};
use super::types::{FrameDropPolicy, ShowMode, SyncSource};

/// 播放参数快照
///
/// 会话建立时固定下来，以 `Arc<PlayerOptions>` 交给读取线程、解码线程与刷新循环，
/// 运行期间不再修改。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerOptions {
    /// 播放区间起点（秒）
    pub start_time: Option<f64>,
    /// 播放区间长度（秒）
    pub duration: Option<f64>,
    /// 循环次数，0 表示无限循环
    pub loop_count: u32,
    /// None：实时源自动开启
    pub infinite_buffer: Option<bool>,
    pub framedrop: FrameDropPolicy,
    pub sync: SyncSource,
    /// 播放结束后自动退出
    pub autoexit: bool,
    /// None：时间戳不连续且不是 ogg 时按字节 seek
    pub seek_by_bytes: Option<bool>,
    /// None：best effort；Some(true)：用包 pts；Some(false)：用包 dts
    pub decoder_reorder_pts: Option<bool>,
    pub show_status: bool,
    /// None：有视频流显示视频，否则显示频谱
    pub show_mode: Option<ShowMode>,
    /// 音频可视化刷新间隔（秒）
    pub rdftspeed: f64,
    pub audio_disable: bool,
    pub video_disable: bool,
    pub subtitle_disable: bool,
    pub display_disable: bool,
    pub max_queue_bytes: usize,
    pub min_frames: usize,
    pub volume: f32,
    /// 左右方向键的相对 seek 步长（秒）
    pub seek_interval: f64,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            start_time: None,
            duration: None,
            loop_count: 1,
            infinite_buffer: None,
            framedrop: FrameDropPolicy::Auto,
            sync: SyncSource::Audio,
            autoexit: false,
            seek_by_bytes: None,
            decoder_reorder_pts: None,
            show_status: true,
            show_mode: None,
            rdftspeed: 0.02,
            audio_disable: false,
            video_disable: false,
            subtitle_disable: false,
            display_disable: false,
            max_queue_bytes: 15 * 1024 * 1024,
            min_frames: 25,
            volume: 1.0,
            seek_interval: 10.0,
        }
    }
}

impl PlayerOptions {
    /// 从 JSON 文件加载并校验
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let options: PlayerOptions = serde_json::from_str(&text)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(PlayerError::ConfigError(format!("音量超出范围: {}", self.volume)));
        }
        if let Some(d) = self.duration {
            if d < 0.0 {
                return Err(PlayerError::ConfigError(format!("播放时长不能为负: {}", d)));
            }
        }
        if let Some(s) = self.start_time {
            if s.is_nan() {
                return Err(PlayerError::ConfigError("起始时间无效".to_string()));
            }
        }
        if !(self.rdftspeed > 0.0) {
            return Err(PlayerError::ConfigError(format!("rdftspeed 必须为正: {}", self.rdftspeed)));
        }
        if !(self.seek_interval > 0.0) {
            return Err(PlayerError::ConfigError(format!("seek 步长必须为正: {}", self.seek_interval)));
        }
        Ok(())
    }

    /// 起点换算为微秒
    pub fn start_time_us(&self) -> Option<i64> {
        self.start_time.map(|s| (s * 1_000_000.0) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = PlayerOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.loop_count, 1);
        assert_eq!(options.max_queue_bytes, 15 * 1024 * 1024);
        assert_eq!(options.min_frames, 25);
        assert_eq!(options.framedrop, FrameDropPolicy::Auto);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: PlayerOptions =
            serde_json::from_str(r#"{"loop_count": 0, "sync": "external", "framedrop": "on"}"#).unwrap();
        assert_eq!(options.loop_count, 0);
        assert_eq!(options.sync, SyncSource::External);
        assert_eq!(options.framedrop, FrameDropPolicy::On);
        assert!(options.show_status);
        assert_eq!(options.rdftspeed, 0.02);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut options = PlayerOptions::default();
        options.volume = 1.5;
        assert!(matches!(options.validate(), Err(PlayerError::ConfigError(_))));

        let mut options = PlayerOptions::default();
        options.duration = Some(-1.0);
        assert!(options.validate().is_err());

        let mut options = PlayerOptions::default();
        options.rdftspeed = 0.0;
        assert!(options.validate().is_err());

        for bad in [0.0, -10.0, f64::NAN] {
            let mut options = PlayerOptions::default();
            options.seek_interval = bad;
            assert!(options.validate().is_err(), "seek_interval={} 应被拒绝", bad);
        }
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("avsync_options_{}.json", std::process::id()));
        std::fs::write(&path, r#"{"autoexit": true, "volume": 0.5}"#).unwrap();
        let options = PlayerOptions::load(&path).unwrap();
        assert!(options.autoexit);
        assert_eq!(options.volume, 0.5);
        let _ = std::fs::remove_file(&path);

        assert!(PlayerOptions::load("/nonexistent/avsync.json").is_err());
    }
}
