use crate::core::{log_ctx, relative_time, ShowMode, SyncSource};
use crate::core::clock::AV_NOSYNC_THRESHOLD;
use crate::player::session::Session;
use crate::player::source::AudioSpec;
use log::{debug, trace};
use std::sync::Arc;
use std::time::Duration;

/// A-V 差值滑动平均的样本数
pub const AUDIO_DIFF_AVG_NB: u32 = 20;
/// 单帧最多修正的采样比例（百分比）
pub const SAMPLE_CORRECTION_PERCENT_MAX: usize = 10;

/// 拉取式音频渲染器，运行在输出设备的回调线程
///
/// 每次回调从采样帧队列取数据填满设备缓冲，按主时钟微调采样数，最后重新锚定音频时钟。
pub struct AudioRenderer {
    session: Arc<Session>,
    spec: AudioSpec,
    buf: Vec<f32>,
    buf_index: usize,
    has_data: bool,
    audio_clock: f64,
    audio_clock_serial: i32,
    diff_cum: f64,
    diff_avg_coef: f64,
    diff_threshold: f64,
    diff_avg_count: u32,
}

impl AudioRenderer {
    pub fn new(session: Arc<Session>, spec: AudioSpec) -> Self {
        Self {
            session,
            spec,
            buf: Vec::new(),
            buf_index: 0,
            has_data: false,
            audio_clock: f64::NAN,
            audio_clock_serial: -1,
            diff_cum: 0.0,
            diff_avg_coef: (0.01f64.ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            diff_threshold: spec.buffer_duration(),
            diff_avg_count: 0,
        }
    }

    pub fn spec(&self) -> AudioSpec {
        self.spec
    }

    /// 填满设备缓冲（交错 f32）
    pub fn fill(&mut self, out: &mut [f32]) {
        let callback_time = relative_time();
        let channels = self.spec.channels.max(1) as usize;
        let volume = self.session.volume.load();
        let muted = self.session.control.is_muted();

        let mut written = 0;
        while written < out.len() {
            if self.buf_index >= self.buf.len() {
                match self.decode_frame(callback_time) {
                    Some(samples) => {
                        self.buf = samples;
                        self.has_data = true;
                    }
                    None => {
                        // 没有数据时输出一个设备缓冲长度的静音
                        self.buf = vec![0.0; (self.spec.buffer_frames as usize).max(1) * channels];
                        self.has_data = false;
                    }
                }
                self.buf_index = 0;
            }

            let len = (self.buf.len() - self.buf_index).min(out.len() - written);
            let src = &self.buf[self.buf_index..self.buf_index + len];
            let dst = &mut out[written..written + len];
            if muted || !self.has_data {
                dst.iter_mut().for_each(|s| *s = 0.0);
            } else if volume >= 1.0 {
                dst.copy_from_slice(src);
            } else {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = *s * volume;
                }
            }
            written += len;
            self.buf_index += len;
        }

        let write_buf_frames = (self.buf.len() - self.buf_index) / channels;
        if !self.audio_clock.is_nan() {
            let latency = (2 * self.spec.buffer_frames as usize + write_buf_frames) as f64
                / self.spec.sample_rate.max(1) as f64;
            let sync = &self.session.sync;
            sync.audclk.set_at(self.audio_clock - latency, self.audio_clock_serial, callback_time);
            sync.extclk.sync_to_slave(&sync.audclk);
        }
    }

    /// 取出下一帧并做同步修正；暂停或取不到数据返回 None
    fn decode_frame(&mut self, callback_time: f64) -> Option<Vec<f32>> {
        let session = self.session.clone();
        if session.control.is_paused() {
            return None;
        }

        let frame = loop {
            // 最多等待半个设备缓冲时长
            let elapsed = relative_time() - callback_time;
            let budget = self.spec.buffer_duration() / 2.0 - elapsed;
            if budget <= 0.0 && session.sampq.nb_remaining() == 0 {
                return None;
            }
            let timeout = Duration::from_secs_f64(budget.max(0.0));
            let frame = session.sampq.peek_readable(Some(timeout))?;
            session.sampq.next();
            if frame.serial == session.audioq.serial() {
                break frame;
            }
            trace!("{} 丢弃过期音频帧 serial={}", log_ctx(), frame.serial);
        };

        let samples = &frame.payload;
        let channels = samples.channels.max(1) as usize;
        let nb_samples = samples.nb_samples();
        let wanted = self.synchronize(nb_samples);
        let data = adjust_sample_count(&samples.data, channels, nb_samples, wanted);

        if session.streams.read().show_mode != ShowMode::Video {
            session.samples.lock().push(&data);
        }

        self.audio_clock = if frame.pts.is_nan() {
            f64::NAN
        } else {
            frame.pts + nb_samples as f64 / samples.sample_rate.max(1) as f64
        };
        self.audio_clock_serial = frame.serial;
        Some(data)
    }

    /// 音频不是主时钟时，按平均 A-V 差值计算期望采样数
    fn synchronize(&mut self, nb_samples: usize) -> usize {
        let sync = &self.session.sync;
        if sync.master_sync_type() == SyncSource::Audio {
            return nb_samples;
        }

        let diff = sync.audclk.get() - sync.master_clock();
        if diff.is_nan() || diff.abs() >= AV_NOSYNC_THRESHOLD {
            self.diff_avg_count = 0;
            self.diff_cum = 0.0;
            return nb_samples;
        }

        self.diff_cum = diff + self.diff_avg_coef * self.diff_cum;
        if self.diff_avg_count < AUDIO_DIFF_AVG_NB {
            self.diff_avg_count += 1;
            return nb_samples;
        }

        let avg_diff = self.diff_cum * (1.0 - self.diff_avg_coef);
        if avg_diff.abs() < self.diff_threshold {
            return nb_samples;
        }
        let wanted = nb_samples as i64 + (diff * self.spec.sample_rate as f64) as i64;
        let min = (nb_samples * (100 - SAMPLE_CORRECTION_PERCENT_MAX) / 100) as i64;
        let max = (nb_samples * (100 + SAMPLE_CORRECTION_PERCENT_MAX) / 100) as i64;
        let wanted = wanted.clamp(min, max) as usize;
        debug!(
            "diff={:.3} adiff={:.3} sample_diff={} apts={:.3} threshold={:.3}",
            diff,
            avg_diff,
            wanted as i64 - nb_samples as i64,
            self.audio_clock,
            self.diff_threshold
        );
        wanted
    }
}

/// 截断或重复最后一组采样，使每声道采样数变为 `wanted`
fn adjust_sample_count(data: &[f32], channels: usize, nb_samples: usize, wanted: usize) -> Vec<f32> {
    if wanted == nb_samples || nb_samples == 0 {
        return data.to_vec();
    }
    if wanted < nb_samples {
        return data[..wanted * channels].to_vec();
    }
    let mut out = Vec::with_capacity(wanted * channels);
    out.extend_from_slice(&data[..nb_samples * channels]);
    let last = &data[(nb_samples - 1) * channels..nb_samples * channels];
    for _ in nb_samples..wanted {
        out.extend_from_slice(last);
    }
    out
}

#[cfg(feature = "cpal-output")]
pub use self::device::CpalAudioBackend;

#[cfg(feature = "cpal-output")]
mod device {
    use super::AudioRenderer;
    use crate::core::{log_ctx, PlayerError, Result};
    use crate::player::source::{AudioBackend, AudioSpec};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
    use log::{debug, error, info, warn};

    /// 设备不支持请求格式时依次尝试
    const FALLBACK_CONFIGS: [(u32, u16); 4] = [(48000, 2), (44100, 2), (48000, 1), (44100, 1)];

    /// 默认设备缓冲（每声道采样数）
    const DEFAULT_BUFFER_FRAMES: u32 = 1024;

    /// cpal 音频输出
    pub struct CpalAudioBackend {
        device: Option<Device>,
        config: Option<StreamConfig>,
        stream: Option<Stream>,
    }

    // cpal::Stream 不是 Send；它只在读取线程里创建、启动和销毁
    unsafe impl Send for CpalAudioBackend {}

    impl CpalAudioBackend {
        pub fn new() -> Self {
            Self {
                device: None,
                config: None,
                stream: None,
            }
        }

        fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
            config.sample_rate.0 >= supported.min_sample_rate().0
                && config.sample_rate.0 <= supported.max_sample_rate().0
                && config.channels == supported.channels()
        }

        fn supports(device: &Device, config: &StreamConfig) -> Result<bool> {
            let supported = device
                .supported_output_configs()
                .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?;
            Ok(supported.into_iter().any(|range| Self::is_config_compatible(config, &range)))
        }
    }

    impl Default for CpalAudioBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    impl AudioBackend for CpalAudioBackend {
        fn open(&mut self, wanted: AudioSpec) -> Result<AudioSpec> {
            info!("{} 🔊 初始化音频输出: {} Hz, {} 声道", log_ctx(), wanted.sample_rate, wanted.channels);

            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
            debug!("使用音频设备: {}", device.name().unwrap_or_default());

            let buffer_frames = if wanted.buffer_frames > 0 { wanted.buffer_frames } else { DEFAULT_BUFFER_FRAMES };
            let mut config = StreamConfig {
                channels: wanted.channels,
                sample_rate: cpal::SampleRate(wanted.sample_rate),
                buffer_size: cpal::BufferSize::Fixed(buffer_frames),
            };

            if !Self::supports(&device, &config)? {
                warn!("⚠️  音频设备不支持 {} Hz, {} 声道配置，回退到标准配置", wanted.sample_rate, wanted.channels);
                let mut found = false;
                for (rate, channels) in FALLBACK_CONFIGS {
                    let candidate = StreamConfig {
                        channels,
                        sample_rate: cpal::SampleRate(rate),
                        buffer_size: cpal::BufferSize::Fixed(buffer_frames),
                    };
                    if Self::supports(&device, &candidate)? {
                        info!("✅ 使用回退配置: {} Hz, {} 声道", rate, channels);
                        config = candidate;
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Err(PlayerError::AudioError(format!(
                        "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
                        wanted.sample_rate, wanted.channels
                    )));
                }
            }

            let spec = AudioSpec {
                sample_rate: config.sample_rate.0,
                channels: config.channels,
                buffer_frames,
            };
            self.device = Some(device);
            self.config = Some(config);
            Ok(spec)
        }

        fn start(&mut self, mut renderer: AudioRenderer) -> Result<()> {
            let (device, config) = match (&self.device, &self.config) {
                (Some(device), Some(config)) => (device, config),
                _ => return Err(PlayerError::AudioError("音频设备尚未打开".to_string())),
            };

            let stream = device
                .build_output_stream(
                    config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| renderer.fill(data),
                    move |err| error!("❌ 音频流错误: {}", err),
                    None,
                )
                .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?;
            stream
                .play()
                .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))?;

            self.stream = Some(stream);
            info!("{} ✅ 音频输出已启动", log_ctx());
            Ok(())
        }

        fn close(&mut self) {
            if let Some(stream) = self.stream.take() {
                drop(stream);
                info!("{} 🛑 音频输出已停止", log_ctx());
            }
            self.config = None;
            self.device = None;
        }
    }

    impl Drop for CpalAudioBackend {
        fn drop(&mut self) {
            self.close();
        }
    }
}
