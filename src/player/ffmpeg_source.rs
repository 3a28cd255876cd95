use crate::core::{
    ass_dialogue_text, clean_subtitle_text, log_ctx, AudioSamples, MediaType, Packet, PixelFormat, PlayerError,
    Rational, Result, Subtitle, SubtitleKind, SubtitleRect, VideoPicture,
};
use crate::player::control::SeekRequest;
use crate::player::decoder::{CodecBackend, DecodedUnit, Receive, SendStatus};
use crate::player::source::{
    AudioSpec, Chapter, CodecInstance, MediaSource, ReadOutcome, SourceInfo, StreamInfo,
};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::util::error::EAGAIN;
use ffmpeg_next::{codec, format, media, software, util};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 字幕没有结束时间时的默认显示时长（毫秒）
const DEFAULT_SUBTITLE_MS: u32 = 3000;

fn to_rational(r: ffmpeg::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

fn opt_ts(ts: i64) -> Option<i64> {
    if ts == ffi::AV_NOPTS_VALUE {
        None
    } else {
        Some(ts)
    }
}

fn media_kind(medium: media::Type) -> Option<MediaType> {
    match medium {
        media::Type::Video => Some(MediaType::Video),
        media::Type::Audio => Some(MediaType::Audio),
        media::Type::Subtitle => Some(MediaType::Subtitle),
        _ => None,
    }
}

fn is_network_url(url: &str) -> bool {
    ["http://", "https://", "rtsp://", "rtmp://", "rtp://", "udp://"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
        || url.contains(".m3u8")
}

unsafe extern "C" fn interrupt_cb(opaque: *mut c_void) -> c_int {
    let abort = &*(opaque as *const AtomicBool);
    abort.load(Ordering::Acquire) as c_int
}

/// 基于 FFmpeg 的媒体源（本地文件或网络流）
pub struct FfmpegSource {
    input: format::context::Input,
    url: String,
    info: SourceInfo,
    streams: Vec<StreamInfo>,
    // 中断回调的 opaque 指针指向这里，必须和 input 同生命周期
    abort: Option<Arc<AtomicBool>>,
}

impl FfmpegSource {
    pub fn open(url: &str) -> Result<Self> {
        info!("{} 📂 正在打开: {}", log_ctx(), url);

        let input = if is_network_url(url) {
            info!("{} 🌐 检测到网络流，应用网络选项", log_ctx());
            let mut options = ffmpeg::Dictionary::new();
            options.set("fflags", "+genpts+discardcorrupt");
            options.set("rw_timeout", "8000000");
            options.set("reconnect", "1");
            options.set("reconnect_streamed", "1");
            options.set("reconnect_delay_max", "4");
            format::input_with_dictionary(&url, options)
                .map_err(|e| PlayerError::OpenError(format!("无法打开网络流 {}: {}", url, e)))?
        } else {
            format::input(&url).map_err(|e| PlayerError::OpenError(format!("无法打开文件 {}: {}", url, e)))?
        };

        let streams = Self::collect_streams(&input)?;
        let info = Self::collect_info(&input, url);
        debug!("{} 媒体信息: {:?}", log_ctx(), info);

        Ok(Self {
            input,
            url: url.to_string(),
            info,
            streams,
            abort: None,
        })
    }

    fn collect_info(input: &format::context::Input, url: &str) -> SourceInfo {
        let format_name = input.format().name().to_string();

        let (start_time, byte_size, iformat_flags) = unsafe {
            let ic = input.as_ptr();
            let pb = (*ic).pb;
            let size = if pb.is_null() { -1 } else { ffi::avio_size(pb) };
            ((*ic).start_time, size, (*(*ic).iformat).flags)
        };

        let no_seek_flags = (ffi::AVFMT_NOBINSEARCH | ffi::AVFMT_NOGENSEARCH | ffi::AVFMT_NO_BYTE_SEEK) as c_int;
        let realtime = matches!(format_name.as_str(), "rtp" | "rtsp" | "sdp")
            || url.starts_with("rtp:")
            || url.starts_with("udp:");

        let chapters = input
            .chapters()
            .map(|ch| {
                let tb = to_rational(ch.time_base());
                Chapter {
                    start_us: Rational::rescale(ch.start(), tb, Rational::micros()),
                    end_us: Rational::rescale(ch.end(), tb, Rational::micros()),
                }
            })
            .collect();

        SourceInfo {
            format_name,
            duration_us: Some(input.duration()).filter(|d| *d > 0 && *d != ffi::AV_NOPTS_VALUE),
            start_time_us: opt_ts(start_time),
            bit_rate: input.bit_rate(),
            byte_size: Some(byte_size).filter(|s| *s > 0),
            ts_discontinuous: iformat_flags & ffi::AVFMT_TS_DISCONT as c_int != 0,
            realtime,
            seekable: iformat_flags & no_seek_flags == 0,
            chapters,
        }
    }

    fn collect_streams(input: &format::context::Input) -> Result<Vec<StreamInfo>> {
        let mut streams = Vec::new();
        for stream in input.streams() {
            let params = stream.parameters();
            let kind = match media_kind(params.medium()) {
                Some(kind) => kind,
                None => continue,
            };
            let codec_name = params.id().name().to_string();
            let frame_rate = [stream.avg_frame_rate(), stream.rate()]
                .into_iter()
                .map(to_rational)
                .find(|r| r.is_valid() && r.num > 0);

            let mut info = StreamInfo {
                index: stream.index(),
                kind,
                time_base: to_rational(stream.time_base()),
                start_time: opt_ts(stream.start_time()),
                frame_rate,
                sample_rate: 0,
                channels: 0,
                width: 0,
                height: 0,
                attached_pic: stream
                    .disposition()
                    .contains(format::stream::Disposition::ATTACHED_PIC),
                codec_name,
            };

            let context = codec::context::Context::from_parameters(params)?;
            match kind {
                MediaType::Video => {
                    if let Ok(video) = context.decoder().video() {
                        info.width = video.width();
                        info.height = video.height();
                    }
                }
                MediaType::Audio => {
                    if let Ok(audio) = context.decoder().audio() {
                        info.sample_rate = audio.rate();
                        info.channels = audio.channels();
                    }
                }
                MediaType::Subtitle => {}
            }
            debug!("{} 流 #{}: {:?} {}", log_ctx(), info.index, info.kind, info.codec_name);
            streams.push(info);
        }
        Ok(streams)
    }

    fn convert_packet(packet: &ffmpeg::Packet) -> Packet {
        Packet {
            stream_index: packet.stream(),
            pts: packet.pts(),
            dts: packet.dts(),
            duration: packet.duration(),
            pos: packet.position() as i64,
            keyframe: packet.is_key(),
            data: packet.data().map(|d| d.to_vec()).unwrap_or_default(),
        }
    }
}

impl MediaSource for FfmpegSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<ReadOutcome> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => Ok(ReadOutcome::Packet(Self::convert_packet(&packet))),
            Err(ffmpeg::Error::Eof) => Ok(ReadOutcome::Eof),
            Err(e) => {
                let (io_error, at_eof) = unsafe {
                    let pb = (*self.input.as_ptr()).pb;
                    if pb.is_null() {
                        (0, false)
                    } else {
                        ((*pb).error, ffi::avio_feof(pb) != 0)
                    }
                };
                if io_error != 0 {
                    return Err(PlayerError::ReadError(format!("{}: {}", self.url, e)));
                }
                if at_eof {
                    Ok(ReadOutcome::Eof)
                } else {
                    debug!("{} 读包暂时失败: {}", log_ctx(), e);
                    Ok(ReadOutcome::Again)
                }
            }
        }
    }

    fn seek(&mut self, request: &SeekRequest) -> Result<()> {
        let flags = if request.by_bytes { ffi::AVSEEK_FLAG_BYTE as c_int } else { 0 };
        let ret = unsafe {
            ffi::avformat_seek_file(
                self.input.as_mut_ptr(),
                -1,
                request.min(),
                request.pos,
                request.max(),
                flags,
            )
        };
        if ret < 0 {
            return Err(ffmpeg::Error::from(ret).into());
        }
        Ok(())
    }

    fn open_codec(&mut self, index: usize, audio_target: Option<AudioSpec>) -> Result<CodecInstance> {
        let stream = self
            .input
            .stream(index)
            .ok_or_else(|| PlayerError::OpenError(format!("流 #{} 不存在", index)))?;
        let time_base = stream.time_base();
        let mut context = codec::context::Context::from_parameters(stream.parameters())?;
        unsafe {
            (*context.as_mut_ptr()).pkt_timebase = time_base.into();
        }

        match media_kind(stream.parameters().medium()) {
            Some(MediaType::Video) => {
                let decoder = context.decoder().video()?;
                info!("{} 🎞 视频解码器: {}x{} {:?}", log_ctx(), decoder.width(), decoder.height(), decoder.format());
                Ok(CodecInstance::Video(Box::new(VideoCodec {
                    decoder,
                    scaler: None,
                    scaler_key: None,
                })))
            }
            Some(MediaType::Audio) => {
                let decoder = context.decoder().audio()?;
                let target = audio_target.unwrap_or(AudioSpec {
                    sample_rate: decoder.rate(),
                    channels: decoder.channels(),
                    buffer_frames: 0,
                });
                info!(
                    "{} 🎵 音频解码器: {} Hz/{} 声道 → {} Hz/{} 声道",
                    log_ctx(),
                    decoder.rate(),
                    decoder.channels(),
                    target.sample_rate,
                    target.channels
                );
                Ok(CodecInstance::Audio(Box::new(AudioCodec {
                    decoder,
                    resampler: None,
                    resampler_key: None,
                    target,
                })))
            }
            Some(MediaType::Subtitle) => {
                let decoder = context.decoder().subtitle()?;
                Ok(CodecInstance::Subtitle(Box::new(SubtitleCodec {
                    decoder,
                    time_base: to_rational(time_base),
                    pending: VecDeque::new(),
                    draining: false,
                })))
            }
            None => Err(PlayerError::OpenError(format!("流 #{} 类型不支持", index))),
        }
    }

    fn best_stream(&self, kind: MediaType, related: Option<usize>) -> Option<usize> {
        let medium = match kind {
            MediaType::Video => media::Type::Video,
            MediaType::Audio => media::Type::Audio,
            MediaType::Subtitle => media::Type::Subtitle,
        };
        let related = related.map(|r| r as c_int).unwrap_or(-1);
        let ret = unsafe {
            ffi::av_find_best_stream(
                self.input.as_ptr() as *mut _,
                medium.into(),
                -1,
                related,
                std::ptr::null_mut(),
                0,
            )
        };
        if ret < 0 {
            return None;
        }
        Some(ret as usize).filter(|index| self.stream(*index).map_or(false, |s| s.is_playable()))
    }

    fn set_interrupt(&mut self, abort: Arc<AtomicBool>) {
        unsafe {
            let ic = self.input.as_mut_ptr();
            (*ic).interrupt_callback = ffi::AVIOInterruptCB {
                callback: Some(interrupt_cb),
                opaque: Arc::as_ptr(&abort) as *mut c_void,
            };
        }
        self.abort = Some(abort);
    }

    fn read_pause(&mut self) -> bool {
        let ret = unsafe { ffi::av_read_pause(self.input.as_mut_ptr()) };
        ret != -(util::error::ENOSYS)
    }

    fn read_play(&mut self) {
        unsafe {
            ffi::av_read_play(self.input.as_mut_ptr());
        }
    }

    fn byte_position(&self) -> i64 {
        unsafe {
            let pb = (*self.input.as_ptr()).pb;
            if pb.is_null() {
                -1
            } else {
                // SEEK_CUR
                ffi::avio_seek(pb, 0, 1)
            }
        }
    }

    fn attached_picture(&self, index: usize) -> Option<Packet> {
        let stream = self.input.stream(index)?;
        let data = unsafe {
            let pkt = &(*stream.as_ptr()).attached_pic;
            if pkt.data.is_null() || pkt.size <= 0 {
                return None;
            }
            std::slice::from_raw_parts(pkt.data, pkt.size as usize).to_vec()
        };
        Some(Packet {
            stream_index: index,
            pts: None,
            dts: None,
            duration: 0,
            pos: -1,
            keyframe: true,
            data,
        })
    }

    fn description(&self) -> String {
        format!("FFmpeg: {}", self.url)
    }
}

fn to_ffmpeg_packet(packet: &Packet) -> ffmpeg::Packet {
    let mut out = ffmpeg::Packet::copy(&packet.data);
    out.set_stream(packet.stream_index);
    out.set_pts(packet.pts);
    out.set_dts(packet.dts);
    out.set_duration(packet.duration);
    out.set_position(packet.pos as isize);
    out
}

fn send_status(result: std::result::Result<(), ffmpeg::Error>) -> Result<SendStatus> {
    match result {
        Ok(()) => Ok(SendStatus::Accepted),
        Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(SendStatus::Again),
        // drain 模式下再送空包
        Err(ffmpeg::Error::Eof) => Ok(SendStatus::Accepted),
        Err(e) => Err(e.into()),
    }
}

/// 视频解码 + 转换为 RGBA
struct VideoCodec {
    decoder: codec::decoder::Video,
    scaler: Option<software::scaling::Context>,
    scaler_key: Option<(util::format::Pixel, u32, u32)>,
}

// SwsContext 不是 Send，但每个实例只在自己的解码线程里使用
unsafe impl Send for VideoCodec {}

impl VideoCodec {
    fn convert(&mut self, frame: &util::frame::Video) -> Result<VideoPicture> {
        let width = frame.width();
        let height = frame.height();
        let key = (frame.format(), width, height);
        if self.scaler_key != Some(key) {
            self.scaler = Some(software::scaling::Context::get(
                frame.format(),
                width,
                height,
                util::format::Pixel::RGBA,
                width,
                height,
                software::scaling::Flags::BILINEAR,
            )?);
            self.scaler_key = Some(key);
        }
        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| PlayerError::DecodeError("缩放器未初始化".to_string()))?;

        let mut rgba = util::frame::Video::empty();
        scaler.run(frame, &mut rgba)?;

        let row = width as usize * 4;
        let stride = rgba.stride(0);
        let src = rgba.data(0);
        let mut data = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            data.extend_from_slice(&src[y * stride..y * stride + row]);
        }
        Ok(VideoPicture {
            format: PixelFormat::RGBA,
            stride: row,
            data: Arc::new(data),
        })
    }
}

impl CodecBackend for VideoCodec {
    type Output = VideoPicture;

    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus> {
        if packet.is_null() {
            send_status(self.decoder.send_eof())
        } else {
            send_status(self.decoder.send_packet(&to_ffmpeg_packet(packet)))
        }
    }

    fn receive_frame(&mut self) -> Result<Receive<VideoPicture>> {
        let mut frame = util::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                let picture = self.convert(&frame)?;
                let mut unit = DecodedUnit::new(picture, frame.pts());
                unit.best_effort_ts = frame.timestamp();
                let (pkt_dts, pkt_pos) = unsafe { ((*frame.as_ptr()).pkt_dts, (*frame.as_ptr()).pkt_pos) };
                unit.pkt_dts = opt_ts(pkt_dts);
                unit.pos = pkt_pos;
                unit.width = frame.width();
                unit.height = frame.height();
                unit.sar = to_rational(frame.aspect_ratio());
                Ok(Receive::Frame(unit))
            }
            Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(Receive::NeedInput),
            Err(ffmpeg::Error::Eof) => Ok(Receive::Drained),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

/// 音频解码 + 重采样为输出格式（交错 f32）
struct AudioCodec {
    decoder: codec::decoder::Audio,
    resampler: Option<software::resampling::Context>,
    resampler_key: Option<(util::format::Sample, u64, u32)>,
    target: AudioSpec,
}

// SwrContext 同上
unsafe impl Send for AudioCodec {}

fn layout_for(channels: u16) -> util::channel_layout::ChannelLayout {
    match channels {
        1 => util::channel_layout::ChannelLayout::MONO,
        6 => util::channel_layout::ChannelLayout::_5POINT1,
        8 => util::channel_layout::ChannelLayout::_7POINT1,
        _ => util::channel_layout::ChannelLayout::STEREO,
    }
}

impl AudioCodec {
    fn convert(&mut self, frame: &util::frame::Audio) -> Result<AudioSamples> {
        let source_layout = if frame.channel_layout().is_empty() {
            layout_for(frame.channels())
        } else {
            frame.channel_layout()
        };
        let key = (frame.format(), source_layout.bits(), frame.rate());
        if self.resampler_key != Some(key) {
            debug!(
                "{} 🔧 初始化重采样器: {}Hz/{}ch → {}Hz/{}ch",
                log_ctx(),
                frame.rate(),
                frame.channels(),
                self.target.sample_rate,
                self.target.channels
            );
            self.resampler = Some(software::resampling::Context::get(
                frame.format(),
                source_layout,
                frame.rate(),
                util::format::Sample::F32(util::format::sample::Type::Packed),
                layout_for(self.target.channels),
                self.target.sample_rate,
            )?);
            self.resampler_key = Some(key);
        }
        let resampler = self
            .resampler
            .as_mut()
            .ok_or_else(|| PlayerError::DecodeError("重采样器未初始化".to_string()))?;

        let mut resampled = util::frame::Audio::empty();
        resampler.run(frame, &mut resampled)?;

        let count = resampled.samples() * self.target.channels as usize;
        let data = resampled.data(0)[..count * 4]
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(AudioSamples {
            sample_rate: self.target.sample_rate,
            channels: self.target.channels,
            data: Arc::new(data),
        })
    }
}

impl CodecBackend for AudioCodec {
    type Output = AudioSamples;

    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus> {
        if packet.is_null() {
            send_status(self.decoder.send_eof())
        } else {
            send_status(self.decoder.send_packet(&to_ffmpeg_packet(packet)))
        }
    }

    fn receive_frame(&mut self) -> Result<Receive<AudioSamples>> {
        let mut frame = util::frame::Audio::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                let samples = self.convert(&frame)?;
                let mut unit = DecodedUnit::new(samples, frame.pts());
                unit.pos = unsafe { (*frame.as_ptr()).pkt_pos };
                Ok(Receive::Frame(unit))
            }
            Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(Receive::NeedInput),
            Err(ffmpeg::Error::Eof) => Ok(Receive::Drained),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

/// 字幕解码：FFmpeg 的字幕接口是一包一解，这里包装成送包 / 取帧模型
/// 复制位图字幕的索引图和调色板
fn bitmap_rect(bitmap: &codec::subtitle::Bitmap) -> Option<SubtitleRect> {
    unsafe {
        let rect = &*bitmap.as_ptr();
        if rect.w <= 0 || rect.h <= 0 || rect.data[0].is_null() || rect.data[1].is_null() {
            return None;
        }
        let stride = rect.linesize[0].max(0) as usize;
        let indices = std::slice::from_raw_parts(rect.data[0], stride * rect.h as usize);
        let palette = std::slice::from_raw_parts(rect.data[1] as *const u32, rect.nb_colors.clamp(0, 256) as usize);
        Some(SubtitleRect::from_palette(
            rect.x,
            rect.y,
            rect.w as u32,
            rect.h as u32,
            indices,
            stride,
            palette,
        ))
    }
}

struct SubtitleCodec {
    decoder: codec::decoder::Subtitle,
    time_base: Rational,
    pending: VecDeque<DecodedUnit<Subtitle>>,
    draining: bool,
}

unsafe impl Send for SubtitleCodec {}

impl CodecBackend for SubtitleCodec {
    type Output = Subtitle;

    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus> {
        if packet.is_null() {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        }

        let mut subtitle = codec::subtitle::Subtitle::default();
        let got = match self.decoder.decode(&to_ffmpeg_packet(packet), &mut subtitle) {
            Ok(got) => got,
            Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => false,
            Err(e) => return Err(e.into()),
        };
        if got {
            let mut kind = SubtitleKind::Text;
            let mut text = String::new();
            let mut rects = Vec::new();
            for rect in subtitle.rects() {
                match rect {
                    codec::subtitle::Rect::Text(t) => {
                        text.push_str(t.get());
                        text.push('\n');
                    }
                    codec::subtitle::Rect::Ass(a) => {
                        text.push_str(ass_dialogue_text(a.get()));
                        text.push('\n');
                    }
                    codec::subtitle::Rect::Bitmap(bitmap) => {
                        kind = SubtitleKind::Bitmap;
                        if let Some(rect) = bitmap_rect(&bitmap) {
                            rects.push(rect);
                        }
                    }
                    codec::subtitle::Rect::None(_) => {}
                }
            }
            let end = if subtitle.end() > 0 { subtitle.end() } else { DEFAULT_SUBTITLE_MS };
            let pts = subtitle
                .pts()
                .map(|us| Rational::rescale(us, Rational::micros(), self.time_base))
                .or(packet.pts);
            let mut unit = DecodedUnit::new(
                Subtitle {
                    kind,
                    start_display_ms: subtitle.start(),
                    end_display_ms: end,
                    text: clean_subtitle_text(&text),
                    rects,
                },
                pts,
            );
            unit.pos = packet.pos;
            self.pending.push_back(unit);
        }

        // 释放 rects 持有的内存
        unsafe {
            ffi::avsubtitle_free(subtitle.as_mut_ptr());
        }
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> Result<Receive<Subtitle>> {
        if let Some(unit) = self.pending.pop_front() {
            return Ok(Receive::Frame(unit));
        }
        if self.draining {
            self.draining = false;
            return Ok(Receive::Drained);
        }
        Ok(Receive::NeedInput)
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            warn!("{} 丢弃 {} 条未显示的字幕", log_ctx(), self.pending.len());
        }
        self.pending.clear();
        self.draining = false;
        self.decoder.flush();
    }
}
