use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::MediaType;

/// 读取线程唤醒信号
///
/// seek / 暂停 / 解码器取空时用来提前唤醒读取线程；读取线程每轮都会重新检查状态，
/// 虚假唤醒无害。
pub struct ReadSignal {
    lock: Mutex<()>,
    cond: Condvar,
}

impl ReadSignal {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_one();
    }

    /// 最多等待 `timeout`
    pub fn wait_timeout(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        self.cond.wait_for(&mut guard, timeout);
    }
}

impl Default for ReadSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// 待执行的 seek
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekRequest {
    /// 目标位置：微秒或字节
    pub pos: i64,
    /// 相对位移（同单位），用于计算容差窗口
    pub rel: i64,
    pub by_bytes: bool,
}

impl SeekRequest {
    /// 容差窗口下界
    pub fn min(&self) -> i64 {
        if self.rel > 0 {
            self.pos - self.rel + 2
        } else {
            i64::MIN
        }
    }

    /// 容差窗口上界
    pub fn max(&self) -> i64 {
        if self.rel < 0 {
            self.pos - self.rel - 2
        } else {
            i64::MAX
        }
    }
}

struct Requests {
    seek: Option<SeekRequest>,
    last_seek_pos: i64,
    stream_cycles: VecDeque<MediaType>,
}

/// 宿主线程与读取线程之间共享的控制状态
pub struct ControlState {
    abort: Arc<AtomicBool>,
    paused: AtomicBool,
    step: AtomicBool,
    force_refresh: AtomicBool,
    queue_attachments_req: AtomicBool,
    read_pause_supported: AtomicBool,
    muted: AtomicBool,
    requests: Mutex<Requests>,
    continue_read: Arc<ReadSignal>,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            abort: Arc::new(AtomicBool::new(false)),
            paused: AtomicBool::new(false),
            step: AtomicBool::new(false),
            force_refresh: AtomicBool::new(false),
            queue_attachments_req: AtomicBool::new(false),
            read_pause_supported: AtomicBool::new(true),
            muted: AtomicBool::new(false),
            requests: Mutex::new(Requests {
                seek: None,
                last_seek_pos: 0,
                stream_cycles: VecDeque::new(),
            }),
            continue_read: Arc::new(ReadSignal::new()),
        }
    }

    /// 中止标志句柄，交给媒体源作为阻塞调用的中断检查
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
        self.continue_read.notify();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub fn continue_read(&self) -> &Arc<ReadSignal> {
        &self.continue_read
    }

    /// 提交 seek；上一个请求尚未执行时忽略
    pub fn request_seek(&self, pos: i64, rel: i64, by_bytes: bool) -> bool {
        let mut requests = self.requests.lock();
        if requests.seek.is_some() {
            return false;
        }
        requests.seek = Some(SeekRequest { pos, rel, by_bytes });
        requests.last_seek_pos = pos;
        drop(requests);
        self.continue_read.notify();
        true
    }

    /// 当前待执行的 seek（执行完毕后调用 [`finish_seek`](Self::finish_seek)）
    pub fn pending_seek(&self) -> Option<SeekRequest> {
        self.requests.lock().seek
    }

    pub fn finish_seek(&self) {
        self.requests.lock().seek = None;
    }

    pub fn seek_pending(&self) -> bool {
        self.requests.lock().seek.is_some()
    }

    /// 最近一次请求的 seek 目标
    pub fn last_seek_pos(&self) -> i64 {
        self.requests.lock().last_seek_pos
    }

    pub fn request_stream_cycle(&self, kind: MediaType) {
        self.requests.lock().stream_cycles.push_back(kind);
        self.continue_read.notify();
    }

    pub fn take_stream_cycle(&self) -> Option<MediaType> {
        self.requests.lock().stream_cycles.pop_front()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        self.continue_read.notify();
    }

    pub fn is_stepping(&self) -> bool {
        self.step.load(Ordering::Acquire)
    }

    pub fn set_step(&self, step: bool) {
        self.step.store(step, Ordering::Release);
    }

    pub fn force_refresh(&self) -> bool {
        self.force_refresh.load(Ordering::Acquire)
    }

    pub fn set_force_refresh(&self, value: bool) {
        self.force_refresh.store(value, Ordering::Release);
    }

    pub fn request_attachments(&self) {
        self.queue_attachments_req.store(true, Ordering::Release);
    }

    pub fn take_attachments_request(&self) -> bool {
        self.queue_attachments_req.swap(false, Ordering::AcqRel)
    }

    pub fn read_pause_supported(&self) -> bool {
        self.read_pause_supported.load(Ordering::Acquire)
    }

    pub fn set_read_pause_supported(&self, supported: bool) {
        self.read_pause_supported.store(supported, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn toggle_mute(&self) -> bool {
        !self.muted.fetch_xor(true, Ordering::AcqRel)
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}
