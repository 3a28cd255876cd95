use crate::core::{log_ctx, AudioSamples, MediaType, Packet, Rational, Result, Subtitle, VideoPicture};
use crate::player::control::ReadSignal;
use crate::player::frame_queue::FrameQueue;
use crate::player::packet_queue::{PacketGet, PacketQueue};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// 解码输出的元数据需求
pub trait DecodedPayload {
    /// 每声道采样数（非音频为 0）
    fn nb_samples(&self) -> usize {
        0
    }

    /// 采样率（非音频为 0）
    fn sample_rate(&self) -> u32 {
        0
    }
}

impl DecodedPayload for VideoPicture {}
impl DecodedPayload for Subtitle {}

impl DecodedPayload for AudioSamples {
    fn nb_samples(&self) -> usize {
        AudioSamples::nb_samples(self)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// 解码器吐出的一帧（时间戳均以流时间基为单位）
#[derive(Debug, Clone)]
pub struct DecodedUnit<O> {
    pub payload: O,
    pub pts: Option<i64>,
    pub pkt_dts: Option<i64>,
    pub best_effort_ts: Option<i64>,
    pub pos: i64,
    pub width: u32,
    pub height: u32,
    pub sar: Rational,
}

impl<O> DecodedUnit<O> {
    pub fn new(payload: O, pts: Option<i64>) -> Self {
        Self {
            payload,
            pts,
            pkt_dts: pts,
            best_effort_ts: pts,
            pos: -1,
            width: 0,
            height: 0,
            sar: Rational::default(),
        }
    }
}

/// `send_packet` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// 解码器内部已满，需要先取帧；包会在下一轮重新送入
    Again,
}

/// `receive_frame` 的结果
#[derive(Debug)]
pub enum Receive<O> {
    Frame(DecodedUnit<O>),
    NeedInput,
    /// 空包之后所有缓存帧都已吐出
    Drained,
}

/// 编解码能力接口
///
/// 空包（`Packet::is_null`）表示进入 drain 模式。
pub trait CodecBackend: Send {
    type Output;

    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus>;

    fn receive_frame(&mut self) -> Result<Receive<Self::Output>>;

    /// 丢弃内部缓存，回到初始状态
    fn flush(&mut self);
}

pub type BoxedCodec<O> = Box<dyn CodecBackend<Output = O>>;

/// `decode_frame` 的结果
#[derive(Debug)]
pub enum DecodeStatus<O> {
    /// 得到一帧，附带换算后的时间基
    Frame { unit: DecodedUnit<O>, time_base: Rational },
    /// 这个包解码失败，已跳过
    NoFrame,
    EndOfStream,
    Aborted,
}

/// 时间戳策略
#[derive(Debug, Clone, Copy)]
pub struct DecoderParams {
    pub kind: MediaType,
    pub pkt_timebase: Rational,
    /// 重置后的起始 pts（流时间基）
    pub start_pts: Option<i64>,
    /// None：best effort；Some(true)：解码器 pts；Some(false)：包 dts
    pub reorder_pts: Option<bool>,
}

/// 通用解码引擎
///
/// 从包队列取包送入编解码器，识别 flush 标记与过期 serial，记录 drain 完成时的 serial。
pub struct Decoder<O> {
    codec: BoxedCodec<O>,
    params: DecoderParams,
    queue: Arc<PacketQueue>,
    pending: Option<Packet>,
    pkt_serial: i32,
    finished: Arc<AtomicI32>,
    next_pts: Option<i64>,
    next_pts_tb: Rational,
    empty_queue_signal: Arc<ReadSignal>,
}

impl<O: DecodedPayload> Decoder<O> {
    pub fn new(
        codec: BoxedCodec<O>,
        params: DecoderParams,
        queue: Arc<PacketQueue>,
        empty_queue_signal: Arc<ReadSignal>,
    ) -> Self {
        Self {
            codec,
            params,
            queue,
            pending: None,
            pkt_serial: -1,
            finished: Arc::new(AtomicI32::new(0)),
            next_pts: params.start_pts,
            next_pts_tb: params.pkt_timebase,
            empty_queue_signal,
        }
    }

    /// 当前包的 serial
    pub fn pkt_serial(&self) -> i32 {
        self.pkt_serial
    }

    /// drain 完成时的 serial，0 表示尚未结束
    pub fn finished_handle(&self) -> Arc<AtomicI32> {
        self.finished.clone()
    }

    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    pub fn kind(&self) -> MediaType {
        self.params.kind
    }

    fn reset(&mut self, serial: i32) {
        self.codec.flush();
        self.pkt_serial = serial;
        self.finished.store(0, Ordering::Release);
        self.next_pts = self.params.start_pts;
        self.next_pts_tb = self.params.pkt_timebase;
        self.pending = None;
    }

    /// 解出下一帧
    pub fn decode_frame(&mut self) -> DecodeStatus<O> {
        loop {
            if self.queue.serial() == self.pkt_serial {
                loop {
                    if self.queue.is_aborted() {
                        return DecodeStatus::Aborted;
                    }
                    match self.codec.receive_frame() {
                        Ok(Receive::Frame(mut unit)) => {
                            let time_base = self.normalize(&mut unit);
                            return DecodeStatus::Frame { unit, time_base };
                        }
                        Ok(Receive::Drained) => {
                            self.finished.store(self.pkt_serial, Ordering::Release);
                            self.codec.flush();
                            return DecodeStatus::EndOfStream;
                        }
                        Ok(Receive::NeedInput) => break,
                        Err(e) => {
                            warn!("{} ⚠️ {} 取帧失败（已跳过）: {}", log_ctx(), self.params.kind.as_str(), e);
                            break;
                        }
                    }
                }
            }

            let packet = loop {
                if self.queue.is_empty() {
                    self.empty_queue_signal.notify();
                }
                let packet = match self.pending.take() {
                    Some(packet) => packet,
                    None => match self.queue.get(true) {
                        PacketGet::Aborted => return DecodeStatus::Aborted,
                        PacketGet::Empty => continue,
                        PacketGet::Flush { serial } => {
                            debug!("{} 🧹 {} 解码器收到 flush，serial={}", log_ctx(), self.params.kind.as_str(), serial);
                            self.reset(serial);
                            continue;
                        }
                        PacketGet::Packet { packet, serial } => {
                            self.pkt_serial = serial;
                            packet
                        }
                    },
                };
                if self.queue.serial() == self.pkt_serial {
                    break packet;
                }
            };

            match self.codec.send_packet(&packet) {
                Ok(SendStatus::Accepted) => {}
                Ok(SendStatus::Again) => {
                    self.pending = Some(packet);
                }
                Err(e) => {
                    warn!("{} ⚠️ {} 解码错误（已跳过）: {}", log_ctx(), self.params.kind.as_str(), e);
                    return DecodeStatus::NoFrame;
                }
            }
        }
    }

    /// 按媒体类型整理时间戳，返回帧 pts 的时间基
    fn normalize(&mut self, unit: &mut DecodedUnit<O>) -> Rational {
        match self.params.kind {
            MediaType::Video => {
                unit.pts = match self.params.reorder_pts {
                    None => unit.best_effort_ts,
                    Some(true) => unit.pts,
                    Some(false) => unit.pkt_dts,
                };
                self.params.pkt_timebase
            }
            MediaType::Audio => {
                let rate = unit.payload.sample_rate();
                if rate == 0 {
                    return self.params.pkt_timebase;
                }
                let tb = Rational::new(1, rate as i32);
                if let Some(pts) = unit.pts {
                    unit.pts = Some(Rational::rescale(pts, self.params.pkt_timebase, tb));
                } else if let Some(next) = self.next_pts {
                    unit.pts = Some(Rational::rescale(next, self.next_pts_tb, tb));
                }
                if let Some(pts) = unit.pts {
                    self.next_pts = Some(pts + unit.payload.nb_samples() as i64);
                    self.next_pts_tb = tb;
                }
                tb
            }
            MediaType::Subtitle => self.params.pkt_timebase,
        }
    }
}

/// 解码线程句柄
///
/// `start` 启动包队列并起线程；`abort` 严格按 中止包队列 → 唤醒帧队列 → join → 清空包队列 的顺序收尾。
pub struct DecoderThread<T: Clone> {
    name: String,
    queue: Arc<PacketQueue>,
    frames: Arc<FrameQueue<T>>,
    finished: Arc<AtomicI32>,
    thread_handle: Option<JoinHandle<()>>,
}

impl<T: Clone + Send + 'static> DecoderThread<T> {
    pub fn start<F>(name: &str, frames: Arc<FrameQueue<T>>, finished: Arc<AtomicI32>, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = frames.packet_queue().clone();
        queue.start();
        let thread_handle = thread::Builder::new().name(name.to_string()).spawn(body)?;
        info!("{} 🎬 {} 线程已启动", log_ctx(), name);
        Ok(Self {
            name: name.to_string(),
            queue,
            frames,
            finished,
            thread_handle: Some(thread_handle),
        })
    }

    /// drain 完成时的 serial
    pub fn finished(&self) -> i32 {
        self.finished.load(Ordering::Acquire)
    }

    pub fn abort(&mut self) {
        self.queue.abort();
        self.frames.signal();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("{} ⚠️ {} 线程异常退出", log_ctx(), self.name);
            }
        }
        self.queue.flush();
        info!("{} 🛑 {} 线程已停止", log_ctx(), self.name);
    }
}

impl<T: Clone> Drop for DecoderThread<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            warn!("{} ⚠ {} 被 drop 但未调用 abort()，正在停止", log_ctx(), self.name);
            self.queue.abort();
            self.frames.signal();
            let _ = handle.join();
            self.queue.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PlayerError;
    use std::collections::VecDeque;

    /// 每个包直接产出一帧，负载为包 pts；空包之后报告 Drained
    struct EchoCodec {
        ready: VecDeque<DecodedUnit<u32>>,
        draining: bool,
        flushes: Arc<AtomicI32>,
    }

    impl DecodedPayload for u32 {}

    impl CodecBackend for EchoCodec {
        type Output = u32;

        fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus> {
            if packet.is_null() {
                self.draining = true;
                return Ok(SendStatus::Accepted);
            }
            if packet.data[0] == 0xFF {
                return Err(PlayerError::DecodeError("bad packet".into()));
            }
            let mut unit = DecodedUnit::new(packet.pts.unwrap_or(0) as u32, packet.pts);
            unit.pos = packet.pos;
            self.ready.push_back(unit);
            Ok(SendStatus::Accepted)
        }

        fn receive_frame(&mut self) -> Result<Receive<u32>> {
            if let Some(unit) = self.ready.pop_front() {
                return Ok(Receive::Frame(unit));
            }
            if self.draining {
                return Ok(Receive::Drained);
            }
            Ok(Receive::NeedInput)
        }

        fn flush(&mut self) {
            self.ready.clear();
            self.draining = false;
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn packet(pts: i64) -> Packet {
        Packet {
            stream_index: 0,
            pts: Some(pts),
            dts: Some(pts),
            duration: 1,
            pos: pts,
            keyframe: true,
            data: vec![1, 2, 3],
        }
    }

    fn decoder() -> (Decoder<u32>, Arc<PacketQueue>, Arc<AtomicI32>) {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let flushes = Arc::new(AtomicI32::new(0));
        let codec = EchoCodec { ready: VecDeque::new(), draining: false, flushes: flushes.clone() };
        let params = DecoderParams {
            kind: MediaType::Video,
            pkt_timebase: Rational::new(1, 1000),
            start_pts: None,
            reorder_pts: None,
        };
        let dec = Decoder::new(Box::new(codec), params, queue.clone(), Arc::new(ReadSignal::new()));
        (dec, queue, flushes)
    }

    #[test]
    fn test_decodes_in_order_with_serial() {
        let (mut dec, queue, _) = decoder();
        queue.put(packet(10)).unwrap();
        queue.put(packet(20)).unwrap();
        for expected in [10, 20] {
            match dec.decode_frame() {
                DecodeStatus::Frame { unit, time_base } => {
                    assert_eq!(unit.payload, expected);
                    assert_eq!(time_base, Rational::new(1, 1000));
                }
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(dec.pkt_serial(), 1);
        }
    }

    #[test]
    fn test_flush_resets_codec_and_finished() {
        let (mut dec, queue, flushes) = decoder();
        queue.put(packet(1)).unwrap();
        queue.put_nullpacket(0).unwrap();
        assert!(matches!(dec.decode_frame(), DecodeStatus::Frame { .. }));
        assert!(matches!(dec.decode_frame(), DecodeStatus::EndOfStream));
        assert_eq!(dec.finished_handle().load(Ordering::SeqCst), 1);

        queue.put_flush().unwrap();
        queue.put(packet(5)).unwrap();
        match dec.decode_frame() {
            DecodeStatus::Frame { unit, .. } => assert_eq!(unit.payload, 5),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(dec.pkt_serial(), 2);
        assert_eq!(dec.finished_handle().load(Ordering::SeqCst), 0);
        assert!(flushes.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_bad_packet_is_skipped() {
        let (mut dec, queue, _) = decoder();
        let mut bad = packet(1);
        bad.data = vec![0xFF];
        queue.put(bad).unwrap();
        queue.put(packet(2)).unwrap();
        assert!(matches!(dec.decode_frame(), DecodeStatus::NoFrame));
        match dec.decode_frame() {
            DecodeStatus::Frame { unit, .. } => assert_eq!(unit.payload, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_abort_returns_aborted() {
        let (mut dec, queue, _) = decoder();
        queue.abort();
        assert!(matches!(dec.decode_frame(), DecodeStatus::Aborted));
    }

    #[test]
    fn test_audio_pts_rebased_to_sample_rate() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let params = DecoderParams {
            kind: MediaType::Audio,
            pkt_timebase: Rational::new(1, 90_000),
            start_pts: None,
            reorder_pts: None,
        };
        let mut dec: Decoder<AudioSamples> =
            Decoder::new(Box::new(SilenceCodec { pending: VecDeque::new() }), params, queue.clone(), Arc::new(ReadSignal::new()));

        queue.put(packet(90_000)).unwrap();
        let mut no_pts = packet(0);
        no_pts.pts = None;
        queue.put(no_pts).unwrap();

        match dec.decode_frame() {
            DecodeStatus::Frame { unit, time_base } => {
                assert_eq!(time_base, Rational::new(1, 48_000));
                assert_eq!(unit.pts, Some(48_000));
            }
            other => panic!("unexpected {:?}", other),
        }
        // 缺失 pts 时由上一帧推算
        match dec.decode_frame() {
            DecodeStatus::Frame { unit, .. } => assert_eq!(unit.pts, Some(48_000 + 1024)),
            other => panic!("unexpected {:?}", other),
        }
    }

    struct SilenceCodec {
        pending: VecDeque<Option<i64>>,
    }

    impl CodecBackend for SilenceCodec {
        type Output = AudioSamples;

        fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus> {
            self.pending.push_back(packet.pts);
            Ok(SendStatus::Accepted)
        }

        fn receive_frame(&mut self) -> Result<Receive<AudioSamples>> {
            match self.pending.pop_front() {
                Some(pts) => Ok(Receive::Frame(DecodedUnit::new(
                    AudioSamples { sample_rate: 48_000, channels: 2, data: Arc::new(vec![0.0; 2048]) },
                    pts,
                ))),
                None => Ok(Receive::NeedInput),
            }
        }

        fn flush(&mut self) {
            self.pending.clear();
        }
    }
}
