use crate::core::{log_ctx, AudioSamples, MediaType, PlayerError, Rational, Result, ShowMode, Subtitle, VideoPicture};
use crate::player::audio_output::AudioRenderer;
use crate::player::control::SeekRequest;
use crate::player::decoder::{Decoder, DecoderParams, DecoderThread};
use crate::player::packet_queue::PacketQueue;
use crate::player::session::{PlayerEvent, Session};
use crate::player::source::{AudioBackend, AudioSpec, CodecInstance, MediaSource, ReadOutcome, StreamInfo};
use crate::player::stream_decoders::{audio_thread, subtitle_thread, video_thread};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 背压 / 无数据时的等待时长
const READ_WAIT: Duration = Duration::from_millis(10);

/// 读取循环结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadExit {
    Aborted,
    AutoExit,
}

/// 循环切换流时的下一个候选
///
/// 返回 `None` 表示没有其他可选流；`Some(None)` 表示字幕切到"无"。
pub fn next_stream_index(streams: &[StreamInfo], kind: MediaType, start: Option<usize>) -> Option<Option<usize>> {
    let nb = streams.len() as i64;
    let start_pos = start
        .and_then(|index| streams.iter().position(|s| s.index == index))
        .map(|pos| pos as i64)
        .unwrap_or(-1);
    let mut pos = start_pos;
    loop {
        pos += 1;
        if pos >= nb {
            if kind == MediaType::Subtitle {
                return Some(None);
            }
            if start_pos == -1 {
                return None;
            }
            pos = 0;
        }
        if pos == start_pos {
            return None;
        }
        let stream = &streams[pos as usize];
        if stream.kind == kind && stream.is_playable() {
            return Some(Some(stream.index));
        }
    }
}

/// 包是否落在 [start_time, start_time + duration] 播放区间内
pub fn in_play_range(
    pkt_ts: Option<i64>,
    stream_start: Option<i64>,
    time_base: Rational,
    start_time: Option<f64>,
    duration: Option<f64>,
) -> bool {
    let (duration, ts) = match (duration, pkt_ts) {
        (Some(duration), Some(ts)) => (duration, ts),
        _ => return true,
    };
    let offset = (ts - stream_start.unwrap_or(0)) as f64 * time_base.to_f64();
    offset - start_time.unwrap_or(0.0) <= duration
}

/// 包队列是否已经足够，读取线程据此暂停读包
///
/// 字节总量超过上限，或每路打开的流都已攒够 `min_frames` 个包（封面图流不计）。
pub fn buffers_full(s: &Session) -> bool {
    let total = s.audioq.size_bytes() + s.videoq.size_bytes() + s.subtitleq.size_bytes();
    if total > s.options.max_queue_bytes {
        return true;
    }
    let min_frames = s.options.min_frames;
    let sel = s.streams.read();
    let enough = |open: bool, queue: &PacketQueue| !open || queue.is_aborted() || queue.len() > min_frames;
    enough(sel.audio.is_some(), &s.audioq)
        && (sel.video_is_attached_pic() || enough(sel.video.is_some(), &s.videoq))
        && enough(sel.subtitle.is_some(), &s.subtitleq)
}

/// 读取线程
///
/// 打开媒体源与各路解码器，循环读包分发到包队列，处理 seek / 暂停 / 背压 / 循环播放。
pub struct StreamReader {
    session: Arc<Session>,
    source: Box<dyn MediaSource>,
    audio_backend: Option<Box<dyn AudioBackend>>,
    video: Option<DecoderThread<VideoPicture>>,
    audio: Option<DecoderThread<AudioSamples>>,
    subtitle: Option<DecoderThread<Subtitle>>,
    loop_count: u32,
    last_paused: bool,
    eof: bool,
}

impl StreamReader {
    pub fn new(
        session: Arc<Session>,
        source: Box<dyn MediaSource>,
        audio_backend: Option<Box<dyn AudioBackend>>,
    ) -> Self {
        let loop_count = session.options.loop_count;
        Self {
            session,
            source,
            audio_backend,
            video: None,
            audio: None,
            subtitle: None,
            loop_count,
            last_paused: false,
            eof: false,
        }
    }

    /// 线程主体：打开 → 读取循环 → 关闭所有组件
    pub fn run(mut self) {
        info!("{} 🎬 读取线程启动: {}", log_ctx(), self.source.description());

        let result = self.open().and_then(|_| self.read_loop());

        for kind in [MediaType::Audio, MediaType::Video, MediaType::Subtitle] {
            self.stream_component_close(kind);
        }

        match result {
            Ok(ReadExit::Aborted) => info!("{} ⏹ 读取线程收到中止请求", log_ctx()),
            Ok(ReadExit::AutoExit) => {
                info!("{} 🏁 播放结束，自动退出", log_ctx());
                self.session.post(PlayerEvent::EndOfStream);
            }
            Err(e) => {
                error!("{} ❌ 读取线程出错: {}", log_ctx(), e);
                self.session.post(PlayerEvent::Quit(Some(e.to_string())));
            }
        }
        info!("{} 🛑 读取线程退出", log_ctx());
    }

    fn open(&mut self) -> Result<()> {
        let s = self.session.clone();
        let opts = &s.options;
        self.source.set_interrupt(s.control.abort_handle());

        let info = self.source.info().clone();
        let streams = self.source.streams().to_vec();
        info!(
            "{} 📂 打开媒体源: {} [{}], {} 条流, 时长 {:?}us",
            log_ctx(),
            self.source.description(),
            info.format_name,
            streams.len(),
            info.duration_us
        );

        let seek_by_bytes = opts
            .seek_by_bytes
            .unwrap_or(info.ts_discontinuous && info.format_name != "ogg");
        s.sync
            .set_max_frame_duration(if info.ts_discontinuous { 10.0 } else { 3600.0 });

        if let Some(start) = opts.start_time_us() {
            let pos = start + info.start_time_us.unwrap_or(0);
            let request = SeekRequest { pos, rel: 0, by_bytes: false };
            if let Err(e) = self.source.seek(&request) {
                warn!("{} ⚠️ 无法定位到起始位置 {:.3}s: {}", log_ctx(), pos as f64 / 1e6, e);
            }
        }

        let infinite_buffer = opts.infinite_buffer.unwrap_or(info.realtime);

        let video_disabled = opts.video_disable || opts.display_disable;
        let video_index = if video_disabled {
            None
        } else {
            self.source.best_stream(MediaType::Video, None)
        };
        let audio_index = if opts.audio_disable {
            None
        } else {
            self.source.best_stream(MediaType::Audio, video_index)
        };
        let subtitle_index = if opts.subtitle_disable || video_disabled {
            None
        } else {
            self.source.best_stream(MediaType::Subtitle, audio_index.or(video_index))
        };

        {
            let mut sel = s.streams.write();
            sel.source = info;
            sel.streams = streams;
            sel.seek_by_bytes = seek_by_bytes;
            sel.infinite_buffer = infinite_buffer;
            sel.show_mode = opts.show_mode.unwrap_or(ShowMode::None);
        }

        if let Some(index) = audio_index {
            self.open_component(index);
        }
        if let Some(index) = video_index {
            self.open_component(index);
        }
        if opts.show_mode.is_none() {
            s.streams.write().show_mode = if self.video.is_some() { ShowMode::Video } else { ShowMode::Rdft };
        }
        if let Some(index) = subtitle_index {
            self.open_component(index);
        }

        if self.video.is_none() && self.audio.is_none() {
            return Err(PlayerError::NoStream);
        }
        Ok(())
    }

    fn read_loop(&mut self) -> Result<ReadExit> {
        let s = self.session.clone();
        let signal = s.control.continue_read().clone();

        loop {
            if s.control.is_aborted() {
                return Ok(ReadExit::Aborted);
            }

            while let Some(kind) = s.control.take_stream_cycle() {
                self.cycle_stream(kind);
            }

            let paused = s.control.is_paused();
            if paused != self.last_paused {
                self.last_paused = paused;
                if paused {
                    let supported = self.source.read_pause();
                    s.control.set_read_pause_supported(supported);
                } else {
                    self.source.read_play();
                }
            }

            if let Some(request) = s.control.pending_seek() {
                self.handle_seek(request);
                s.control.finish_seek();
            }

            if s.control.take_attachments_request() {
                self.queue_attachments();
            }

            let infinite_buffer = s.streams.read().infinite_buffer;
            if !infinite_buffer && buffers_full(&s) {
                signal.wait_timeout(READ_WAIT);
                continue;
            }

            if !paused && self.playback_drained() {
                let should_loop = match self.loop_count {
                    1 => false,
                    0 => true,
                    _ => {
                        self.loop_count -= 1;
                        true
                    }
                };
                if should_loop {
                    info!("{} 🔁 循环播放，剩余次数 {}", log_ctx(), self.loop_count);
                    s.stream_seek(s.options.start_time_us().unwrap_or(0), 0, false);
                } else if s.options.autoexit {
                    return Ok(ReadExit::AutoExit);
                }
            }

            match self.source.read_packet() {
                Ok(ReadOutcome::Packet(packet)) => {
                    self.eof = false;
                    let pos = self.source.byte_position();
                    s.set_byte_position(if pos >= 0 { pos } else { packet.pos });
                    self.route_packet(packet);
                }
                Ok(ReadOutcome::Eof) => {
                    if !self.eof {
                        info!("{} 📭 读到文件末尾", log_ctx());
                        self.put_null_packets();
                        self.eof = true;
                    }
                    signal.wait_timeout(READ_WAIT);
                }
                Ok(ReadOutcome::Again) => signal.wait_timeout(READ_WAIT),
                Err(e) => {
                    if !self.eof {
                        self.put_null_packets();
                    }
                    return Err(e);
                }
            }
        }
    }

    fn handle_seek(&mut self, request: SeekRequest) {
        let s = &self.session;
        info!(
            "{} ⏩ 执行 seek: pos={} 窗口=[{}, {}] bytes={}",
            log_ctx(),
            request.pos,
            request.min(),
            request.max(),
            request.by_bytes
        );
        match self.source.seek(&request) {
            Err(e) => error!("{} ❌ seek 失败: {}", log_ctx(), e),
            Ok(()) => {
                let queues = [
                    (&s.audioq, self.audio.is_some()),
                    (&s.subtitleq, self.subtitle.is_some()),
                    (&s.videoq, self.video.is_some()),
                ];
                for (queue, open) in queues {
                    if open {
                        queue.flush();
                        let _ = queue.put_flush();
                    }
                }
                if request.by_bytes {
                    s.sync.extclk.set(f64::NAN, 0);
                } else {
                    s.sync.extclk.set(request.pos as f64 / 1e6, 0);
                }
                debug!("{} 🧹 包队列已清空并插入 flush 标记", log_ctx());
            }
        }
        s.control.request_attachments();
        self.eof = false;
        if s.control.is_paused() {
            s.step_to_next_frame();
        }
    }

    /// 封面图作为单帧视频送入视频包队列
    fn queue_attachments(&mut self) {
        let s = &self.session;
        let stream = match s.streams.read().video.clone() {
            Some(stream) if stream.attached_pic => stream,
            _ => return,
        };
        if let Some(packet) = self.source.attached_picture(stream.index) {
            let _ = s.videoq.put(packet);
            let _ = s.videoq.put_nullpacket(stream.index);
            debug!("{} 🖼 已送入封面图 (stream #{})", log_ctx(), stream.index);
        }
    }

    fn route_packet(&self, packet: crate::core::Packet) {
        let s = &self.session;
        let stream = match self.source.stream(packet.stream_index) {
            Some(stream) => stream,
            None => return,
        };
        if !in_play_range(
            packet.best_timestamp(),
            stream.start_time,
            stream.time_base,
            s.options.start_time,
            s.options.duration,
        ) {
            return;
        }

        let sel = s.streams.read();
        let index = Some(packet.stream_index);
        if sel.audio.as_ref().map(|st| st.index) == index {
            let _ = s.audioq.put(packet);
        } else if sel.video.as_ref().map(|st| st.index) == index && !sel.video_is_attached_pic() {
            let _ = s.videoq.put(packet);
        } else if sel.subtitle.as_ref().map(|st| st.index) == index {
            let _ = s.subtitleq.put(packet);
        }
    }

    /// 向每个打开的流送一个空包，让解码器 drain
    fn put_null_packets(&self) {
        let s = &self.session;
        let sel = s.streams.read();
        if let Some(stream) = &sel.video {
            let _ = s.videoq.put_nullpacket(stream.index);
        }
        if let Some(stream) = &sel.audio {
            let _ = s.audioq.put_nullpacket(stream.index);
        }
        if let Some(stream) = &sel.subtitle {
            let _ = s.subtitleq.put_nullpacket(stream.index);
        }
    }

    /// 音视频解码器都已 drain 且帧队列为空
    fn playback_drained(&self) -> bool {
        let s = &self.session;
        let audio_done = self
            .audio
            .as_ref()
            .map_or(true, |t| t.finished() == s.audioq.serial() && s.sampq.nb_remaining() == 0);
        let video_done = self
            .video
            .as_ref()
            .map_or(true, |t| t.finished() == s.videoq.serial() && s.pictq.nb_remaining() == 0);
        audio_done && video_done
    }

    fn cycle_stream(&mut self, kind: MediaType) {
        let s = self.session.clone();
        let (start, old) = {
            let sel = s.streams.read();
            (sel.last_index(kind), sel.current(kind).map(|st| st.index))
        };
        let target = match next_stream_index(self.source.streams(), kind, start) {
            Some(target) => target,
            None => {
                debug!("{} 没有其他可切换的{}流", log_ctx(), kind.as_str());
                return;
            }
        };
        info!("{} 🔀 切换{}流: {:?} → {:?}", log_ctx(), kind.as_str(), old, target);

        if old.is_some() {
            self.stream_component_close(kind);
        }
        match target {
            Some(index) => self.open_component(index),
            None => s.streams.write().last_subtitle = None,
        }
    }

    /// 打开失败只放弃这一路流
    fn open_component(&mut self, index: usize) {
        if let Err(e) = self.stream_component_open(index) {
            let kind = self.source.stream(index).map(|st| st.kind);
            warn!("{} ⚠️ 无法打开流 #{}: {}", log_ctx(), index, e);
            if let Some(kind) = kind {
                self.stream_component_close(kind);
            }
        }
    }

    pub fn stream_component_open(&mut self, index: usize) -> Result<()> {
        let stream = self
            .source
            .stream(index)
            .cloned()
            .ok_or_else(|| PlayerError::OpenError(format!("流 #{} 不存在", index)))?;
        let s = self.session.clone();
        let signal = s.control.continue_read().clone();
        let reorder_pts = s.options.decoder_reorder_pts;

        match stream.kind {
            MediaType::Audio => {
                let backend = self
                    .audio_backend
                    .as_mut()
                    .ok_or_else(|| PlayerError::AudioError("没有可用的音频输出".to_string()))?;
                let wanted = AudioSpec {
                    sample_rate: stream.sample_rate,
                    channels: stream.channels,
                    buffer_frames: 0,
                };
                let spec = backend.open(wanted)?;
                let codec = match self.source.open_codec(index, Some(spec))? {
                    CodecInstance::Audio(codec) => codec,
                    _ => return Err(PlayerError::OpenError(format!("流 #{} 不是音频流", index))),
                };
                let start_pts = if self.source.info().seekable { None } else { stream.start_time };
                let params = DecoderParams {
                    kind: MediaType::Audio,
                    pkt_timebase: stream.time_base,
                    start_pts,
                    reorder_pts,
                };
                let decoder = Decoder::new(codec, params, s.audioq.clone(), signal);
                let finished = decoder.finished_handle();

                {
                    let mut sel = s.streams.write();
                    sel.set_current(MediaType::Audio, Some(stream.clone()));
                    sel.audio_spec = Some(spec);
                }
                s.sync.set_stream_present(MediaType::Audio, true);
                s.samples.lock().reset();

                let worker = s.clone();
                self.audio = Some(DecoderThread::start("audio_decoder", s.sampq.clone(), finished, move || {
                    audio_thread(worker, decoder, stream)
                })?);
                backend.start(AudioRenderer::new(s.clone(), spec))?;
            }
            MediaType::Video => {
                let codec = match self.source.open_codec(index, None)? {
                    CodecInstance::Video(codec) => codec,
                    _ => return Err(PlayerError::OpenError(format!("流 #{} 不是视频流", index))),
                };
                let params = DecoderParams {
                    kind: MediaType::Video,
                    pkt_timebase: stream.time_base,
                    start_pts: None,
                    reorder_pts,
                };
                let decoder = Decoder::new(codec, params, s.videoq.clone(), signal);
                let finished = decoder.finished_handle();

                s.streams.write().set_current(MediaType::Video, Some(stream.clone()));
                s.sync.set_stream_present(MediaType::Video, true);

                let worker = s.clone();
                self.video = Some(DecoderThread::start("video_decoder", s.pictq.clone(), finished, move || {
                    video_thread(worker, decoder, stream)
                })?);
                s.control.request_attachments();
            }
            MediaType::Subtitle => {
                let codec = match self.source.open_codec(index, None)? {
                    CodecInstance::Subtitle(codec) => codec,
                    _ => return Err(PlayerError::OpenError(format!("流 #{} 不是字幕流", index))),
                };
                let params = DecoderParams {
                    kind: MediaType::Subtitle,
                    pkt_timebase: stream.time_base,
                    start_pts: None,
                    reorder_pts,
                };
                let decoder = Decoder::new(codec, params, s.subtitleq.clone(), signal);
                let finished = decoder.finished_handle();

                s.streams.write().set_current(MediaType::Subtitle, Some(stream.clone()));

                let worker = s.clone();
                self.subtitle = Some(DecoderThread::start("subtitle_decoder", s.subpq.clone(), finished, move || {
                    subtitle_thread(worker, decoder, stream)
                })?);
            }
        }
        Ok(())
    }

    /// 关闭一路流：先停音频设备，再中止解码线程
    pub fn stream_component_close(&mut self, kind: MediaType) {
        let s = &self.session;
        match kind {
            MediaType::Audio => {
                if self.audio.is_some() {
                    if let Some(backend) = self.audio_backend.as_mut() {
                        backend.close();
                    }
                }
                if let Some(mut thread) = self.audio.take() {
                    thread.abort();
                }
                s.samples.lock().reset();
                s.streams.write().audio_spec = None;
            }
            MediaType::Video => {
                if let Some(mut thread) = self.video.take() {
                    thread.abort();
                }
            }
            MediaType::Subtitle => {
                if let Some(mut thread) = self.subtitle.take() {
                    thread.abort();
                }
            }
        }
        s.streams.write().set_current(kind, None);
        if kind != MediaType::Subtitle {
            s.sync.set_stream_present(kind, false);
        }
    }
}

/// 读取线程句柄
pub struct ReaderThread {
    session: Arc<Session>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ReaderThread {
    pub fn start(
        session: Arc<Session>,
        source: Box<dyn MediaSource>,
        audio_backend: Option<Box<dyn AudioBackend>>,
    ) -> Result<Self> {
        let reader = StreamReader::new(session.clone(), source, audio_backend);
        let thread_handle = thread::Builder::new()
            .name("read_thread".to_string())
            .spawn(move || reader.run())?;
        Ok(Self {
            session,
            thread_handle: Some(thread_handle),
        })
    }

    /// 请求中止并等待线程退出
    pub fn stop(&mut self) {
        self.session.control.request_abort();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("{} ⚠️ 读取线程异常退出", log_ctx());
            }
        }
    }
}

impl Drop for ReaderThread {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.stop();
        }
    }
}
