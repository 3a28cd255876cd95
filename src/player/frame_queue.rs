use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

use super::packet_queue::PacketQueue;
use crate::core::Frame;

pub const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
pub const SUBPICTURE_QUEUE_SIZE: usize = 16;
pub const SAMPLE_QUEUE_SIZE: usize = 9;
/// 帧队列容量上限
pub const FRAME_QUEUE_SIZE: usize = 16;

struct RingState<T> {
    slots: Vec<Option<Frame<T>>>,
    rindex: usize,
    windex: usize,
    size: usize,
    rindex_shown: usize,
}

/// 解码帧环形队列
///
/// 单生产者（解码线程）单消费者（刷新循环 / 音频回调）。
/// `keep_last` 打开时，最近显示的一帧在下一次 `next()` 之前一直保留在队列里，
/// 用于暂停重绘和单步。
pub struct FrameQueue<T> {
    state: Mutex<RingState<T>>,
    cond: Condvar,
    max_size: usize,
    keep_last: bool,
    pktq: Arc<PacketQueue>,
}

impl<T: Clone> FrameQueue<T> {
    pub fn new(pktq: Arc<PacketQueue>, max_size: usize, keep_last: bool) -> Self {
        let max_size = max_size.clamp(1, FRAME_QUEUE_SIZE);
        Self {
            state: Mutex::new(RingState {
                slots: (0..max_size).map(|_| None).collect(),
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
            max_size,
            keep_last,
            pktq,
        }
    }

    pub fn packet_queue(&self) -> &Arc<PacketQueue> {
        &self.pktq
    }

    /// 唤醒所有等待者（中止时解除阻塞用）
    pub fn signal(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    /// 当前待显示的帧
    pub fn peek(&self) -> Option<Frame<T>> {
        let state = self.state.lock();
        state.slots[(state.rindex + state.rindex_shown) % self.max_size].clone()
    }

    /// 待显示帧之后的一帧
    pub fn peek_next(&self) -> Option<Frame<T>> {
        let state = self.state.lock();
        state.slots[(state.rindex + state.rindex_shown + 1) % self.max_size].clone()
    }

    /// 最近一次显示的帧
    pub fn peek_last(&self) -> Option<Frame<T>> {
        let state = self.state.lock();
        state.slots[state.rindex].clone()
    }

    /// 等待出现空位，返回写入位置；队列中止时返回 None
    pub fn peek_writable(&self) -> Option<usize> {
        let mut state = self.state.lock();
        while state.size >= self.max_size && !self.pktq.is_aborted() {
            self.cond.wait(&mut state);
        }
        if self.pktq.is_aborted() {
            return None;
        }
        Some(state.windex)
    }

    /// 等待可读帧；`timeout` 为 None 时一直等到有帧或中止
    pub fn peek_readable(&self, timeout: Option<Duration>) -> Option<Frame<T>> {
        let mut state = self.state.lock();
        while state.size <= state.rindex_shown && !self.pktq.is_aborted() {
            match timeout {
                Some(t) => {
                    if self.cond.wait_for(&mut state, t).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        if self.pktq.is_aborted() || state.size <= state.rindex_shown {
            return None;
        }
        state.slots[(state.rindex + state.rindex_shown) % self.max_size].clone()
    }

    /// 写入 `peek_writable` 返回的位置并推进写指针
    pub fn push(&self, frame: Frame<T>) {
        let mut state = self.state.lock();
        let windex = state.windex;
        state.slots[windex] = Some(frame);
        state.windex = (windex + 1) % self.max_size;
        state.size += 1;
        self.cond.notify_one();
    }

    /// 推进读指针
    ///
    /// `keep_last` 下第一次调用只把当前帧标记为已显示。
    pub fn next(&self) {
        let mut state = self.state.lock();
        if self.keep_last && state.rindex_shown == 0 {
            state.rindex_shown = 1;
            return;
        }
        if state.size == 0 {
            return;
        }
        let rindex = state.rindex;
        state.slots[rindex] = None;
        state.rindex = (rindex + 1) % self.max_size;
        state.size -= 1;
        self.cond.notify_one();
    }

    /// 取消已显示标记，让最近显示的帧重新可读；返回之前是否有已显示帧
    pub fn prev(&self) -> bool {
        let mut state = self.state.lock();
        let had_shown = state.rindex_shown == 1;
        state.rindex_shown = 0;
        had_shown
    }

    /// 未显示的帧数
    pub fn nb_remaining(&self) -> usize {
        let state = self.state.lock();
        state.size - state.rindex_shown
    }

    /// 最近显示帧的字节位置；没有或已过期返回 -1
    pub fn last_pos(&self) -> i64 {
        let state = self.state.lock();
        match &state.slots[state.rindex] {
            Some(frame) if state.rindex_shown == 1 && frame.serial == self.pktq.serial() => frame.pos,
            _ => -1,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn frame(pts: f64, serial: i32) -> Frame<u32> {
        let mut f = Frame::new(pts as u32, serial);
        f.pts = pts;
        f.pos = (pts * 1000.0) as i64;
        f
    }

    fn queue(max: usize, keep_last: bool) -> FrameQueue<u32> {
        let pktq = Arc::new(PacketQueue::new());
        pktq.start();
        FrameQueue::new(pktq, max, keep_last)
    }

    #[test]
    fn test_push_and_consume_in_order() {
        let fq = queue(3, false);
        for i in 0..3 {
            assert!(fq.peek_writable().is_some());
            fq.push(frame(i as f64, 1));
        }
        assert_eq!(fq.nb_remaining(), 3);
        assert_eq!(fq.peek().unwrap().payload, 0);
        assert_eq!(fq.peek_next().unwrap().payload, 1);
        fq.next();
        assert_eq!(fq.peek().unwrap().payload, 1);
        assert_eq!(fq.nb_remaining(), 2);
    }

    #[test]
    fn test_keep_last_redisplay() {
        let fq = queue(3, true);
        fq.peek_writable();
        fq.push(frame(1.0, 1));
        fq.next();
        assert_eq!(fq.nb_remaining(), 0);
        assert_eq!(fq.peek_last().unwrap().payload, 1);
        assert!(fq.prev());
        assert_eq!(fq.nb_remaining(), 1);
        assert!(!fq.prev());
    }

    #[test]
    fn test_last_pos_requires_matching_serial() {
        let fq = queue(3, true);
        let serial = fq.packet_queue().serial();
        fq.push(frame(2.0, serial));
        assert_eq!(fq.last_pos(), -1);
        fq.next();
        assert_eq!(fq.last_pos(), 2000);
        fq.packet_queue().put_flush().unwrap();
        assert_eq!(fq.last_pos(), -1);
    }

    #[test]
    fn test_capacity_is_clamped() {
        let fq = queue(100, false);
        assert_eq!(fq.max_size(), FRAME_QUEUE_SIZE);
    }

    #[test]
    fn test_writer_blocks_until_space() {
        let fq = Arc::new(queue(1, false));
        fq.push(frame(0.0, 1));
        let writer = {
            let fq = fq.clone();
            thread::spawn(move || {
                let slot = fq.peek_writable();
                fq.push(frame(1.0, 1));
                slot
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(fq.nb_remaining(), 1);
        fq.next();
        assert!(writer.join().unwrap().is_some());
        assert_eq!(fq.peek().unwrap().payload, 1);
    }

    #[test]
    fn test_abort_releases_writer_and_reader() {
        let fq = Arc::new(queue(1, false));
        fq.push(frame(0.0, 1));
        let writer = {
            let fq = fq.clone();
            thread::spawn(move || fq.peek_writable())
        };
        thread::sleep(Duration::from_millis(30));
        fq.packet_queue().abort();
        fq.signal();
        assert!(writer.join().unwrap().is_none());
        assert!(fq.peek_readable(None).is_none());
    }

    #[test]
    fn test_peek_readable_times_out() {
        let fq = queue(3, false);
        assert!(fq.peek_readable(Some(Duration::from_millis(5))).is_none());
        fq.push(frame(4.0, 1));
        assert_eq!(fq.peek_readable(Some(Duration::from_millis(5))).unwrap().payload, 4);
    }
}
