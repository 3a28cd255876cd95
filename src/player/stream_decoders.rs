use crate::core::{log_ctx, AudioSamples, Frame, Rational, Subtitle, VideoPicture};
use crate::player::decoder::{DecodeStatus, Decoder, DecodedUnit};
use crate::player::session::Session;
use crate::player::source::StreamInfo;
use log::{debug, info};
use std::sync::Arc;

fn pts_seconds(pts: Option<i64>, time_base: Rational) -> f64 {
    pts.map(|p| p as f64 * time_base.to_f64()).unwrap_or(f64::NAN)
}

/// 已经落后于主时钟的画面在入队前丢弃
fn should_drop_early(s: &Session, dpts: f64, pkt_serial: i32) -> bool {
    let sync = &s.sync;
    if dpts.is_nan() || !s.options.framedrop.allows_drop(sync.master_sync_type()) {
        return false;
    }
    let diff = dpts - sync.master_clock();
    // 没有滤镜链，滤镜延迟恒为 0
    let filter_delay = 0.0;
    !diff.is_nan()
        && diff.abs() < crate::core::AV_NOSYNC_THRESHOLD
        && diff - filter_delay < 0.0
        && pkt_serial == sync.vidclk.serial()
        && !s.videoq.is_empty()
}

/// 视频解码线程
pub fn video_thread(s: Arc<Session>, mut decoder: Decoder<VideoPicture>, stream: StreamInfo) {
    info!("{} 🎬 视频解码线程启动: stream #{} {}", log_ctx(), stream.index, stream.codec_name);
    let frame_duration = stream
        .frame_rate
        .filter(|r| r.is_valid())
        .map(|r| r.invert().to_f64())
        .unwrap_or(0.0);

    let mut decoded = 0u64;
    loop {
        let (unit, time_base) = match decoder.decode_frame() {
            DecodeStatus::Frame { unit, time_base } => (unit, time_base),
            DecodeStatus::NoFrame | DecodeStatus::EndOfStream => continue,
            DecodeStatus::Aborted => break,
        };

        let pts = pts_seconds(unit.pts, time_base);
        if should_drop_early(&s, pts, decoder.pkt_serial()) {
            s.sync.count_early_drop();
            debug!("{} 🗑 提前丢弃视频帧 pts={:.3}", log_ctx(), pts);
            continue;
        }

        if !queue_picture(&s, unit, pts, frame_duration, decoder.pkt_serial()) {
            break;
        }
        decoded += 1;
    }
    info!("{} 🛑 视频解码线程退出（共 {} 帧）", log_ctx(), decoded);
}

fn queue_picture(s: &Session, unit: DecodedUnit<VideoPicture>, pts: f64, duration: f64, serial: i32) -> bool {
    if s.pictq.peek_writable().is_none() {
        return false;
    }
    let mut frame = Frame::new(unit.payload, serial);
    frame.pts = pts;
    frame.duration = duration;
    frame.pos = unit.pos;
    frame.width = unit.width;
    frame.height = unit.height;
    frame.sar = unit.sar;
    s.pictq.push(frame);
    true
}

/// 音频解码线程
pub fn audio_thread(s: Arc<Session>, mut decoder: Decoder<AudioSamples>, stream: StreamInfo) {
    info!(
        "{} 🔊 音频解码线程启动: stream #{} {} Hz, {} 声道",
        log_ctx(),
        stream.index,
        stream.sample_rate,
        stream.channels
    );

    loop {
        let (unit, time_base) = match decoder.decode_frame() {
            DecodeStatus::Frame { unit, time_base } => (unit, time_base),
            DecodeStatus::NoFrame | DecodeStatus::EndOfStream => continue,
            DecodeStatus::Aborted => break,
        };

        if s.sampq.peek_writable().is_none() {
            break;
        }
        let nb_samples = unit.payload.nb_samples();
        let rate = unit.payload.sample_rate.max(1);
        let mut frame = Frame::new(unit.payload, decoder.pkt_serial());
        frame.pts = pts_seconds(unit.pts, time_base);
        frame.pos = unit.pos;
        frame.duration = nb_samples as f64 / rate as f64;
        s.sampq.push(frame);
    }
    info!("{} 🛑 音频解码线程退出", log_ctx());
}

/// 字幕解码线程
pub fn subtitle_thread(s: Arc<Session>, mut decoder: Decoder<Subtitle>, stream: StreamInfo) {
    info!("{} 💬 字幕解码线程启动: stream #{}", log_ctx(), stream.index);

    loop {
        if s.subpq.peek_writable().is_none() {
            break;
        }
        let (unit, time_base) = match decoder.decode_frame() {
            DecodeStatus::Frame { unit, time_base } => (unit, time_base),
            DecodeStatus::NoFrame | DecodeStatus::EndOfStream => continue,
            DecodeStatus::Aborted => break,
        };

        let mut frame = Frame::new(unit.payload, decoder.pkt_serial());
        frame.pts = unit.pts.map(|p| p as f64 * time_base.to_f64()).unwrap_or(0.0);
        frame.pos = unit.pos;
        frame.width = unit.width;
        frame.height = unit.height;
        frame.duration = frame.payload.end_offset() - frame.payload.start_offset();
        s.subpq.push(frame);
    }
    info!("{} 🛑 字幕解码线程退出", log_ctx());
}
