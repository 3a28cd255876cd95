use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::core::Packet;

/// 每个节点的额外开销，计入队列字节数
const NODE_OVERHEAD: usize = 64;

/// 队列已中止，不再接收数据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("包队列已中止")]
pub struct QueueAborted;

/// `get` 的结果
#[derive(Debug)]
pub enum PacketGet {
    /// 数据包（含空包）及其入队时的 serial
    Packet { packet: Packet, serial: i32 },
    /// flush 标记：消费者应重置解码器状态
    Flush { serial: i32 },
    /// 非阻塞模式下队列为空
    Empty,
    /// 队列已中止
    Aborted,
}

enum QueueItem {
    Flush,
    Data(Packet),
}

struct QueueEntry {
    item: QueueItem,
    serial: i32,
}

struct QueueState {
    entries: VecDeque<QueueEntry>,
    size: usize,
    abort: bool,
    serial: i32,
}

/// 压缩包队列
///
/// 每次插入 flush 标记时 serial 加一，之后入队的包都带上新 serial，
/// 消费者据此识别 seek 之前残留的数据。
pub struct PacketQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    // 以下原子量只在持锁时写入，供其他线程无锁读取
    serial: Arc<AtomicI32>,
    aborted: AtomicBool,
    nb_packets: AtomicUsize,
    size: AtomicUsize,
}

impl PacketQueue {
    /// 新建的队列处于中止状态，需调用 [`start`](Self::start)
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                size: 0,
                abort: true,
                serial: 0,
            }),
            cond: Condvar::new(),
            serial: Arc::new(AtomicI32::new(0)),
            aborted: AtomicBool::new(true),
            nb_packets: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
        }
    }

    fn put_locked(&self, state: &mut QueueState, item: QueueItem) -> Result<(), QueueAborted> {
        if state.abort {
            return Err(QueueAborted);
        }
        if matches!(item, QueueItem::Flush) {
            state.serial += 1;
            self.serial.store(state.serial, Ordering::Release);
        }
        let bytes = match &item {
            QueueItem::Flush => NODE_OVERHEAD,
            QueueItem::Data(pkt) => pkt.size() + NODE_OVERHEAD,
        };
        let serial = state.serial;
        state.entries.push_back(QueueEntry { item, serial });
        state.size += bytes;
        self.sync_counters(state);
        self.cond.notify_one();
        Ok(())
    }

    fn sync_counters(&self, state: &QueueState) {
        self.nb_packets.store(state.entries.len(), Ordering::Release);
        self.size.store(state.size, Ordering::Release);
    }

    pub fn put(&self, packet: Packet) -> Result<(), QueueAborted> {
        let mut state = self.state.lock();
        self.put_locked(&mut state, QueueItem::Data(packet))
    }

    /// 插入 flush 标记
    pub fn put_flush(&self) -> Result<(), QueueAborted> {
        let mut state = self.state.lock();
        self.put_locked(&mut state, QueueItem::Flush)
    }

    /// 插入空包，通知解码器该流已结束
    pub fn put_nullpacket(&self, stream_index: usize) -> Result<(), QueueAborted> {
        self.put(Packet::null(stream_index))
    }

    /// 取出队首
    ///
    /// `block` 为 true 时在空队列上等待，直到有数据或被中止。
    pub fn get(&self, block: bool) -> PacketGet {
        let mut state = self.state.lock();
        loop {
            if state.abort {
                return PacketGet::Aborted;
            }
            if let Some(entry) = state.entries.pop_front() {
                let bytes = match &entry.item {
                    QueueItem::Flush => NODE_OVERHEAD,
                    QueueItem::Data(pkt) => pkt.size() + NODE_OVERHEAD,
                };
                state.size -= bytes;
                self.sync_counters(&state);
                return match entry.item {
                    QueueItem::Flush => PacketGet::Flush { serial: entry.serial },
                    QueueItem::Data(packet) => PacketGet::Packet { packet, serial: entry.serial },
                };
            }
            if !block {
                return PacketGet::Empty;
            }
            self.cond.wait(&mut state);
        }
    }

    /// 丢弃所有节点，不改变 serial 和中止状态
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.size = 0;
        self.sync_counters(&state);
    }

    /// 清除中止标志并立即插入一个 flush 标记
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.abort = false;
        self.aborted.store(false, Ordering::Release);
        // 刚清除中止标志，插入不会失败
        let _ = self.put_locked(&mut state, QueueItem::Flush);
    }

    /// 设置中止标志并唤醒所有等待者（可重复调用）
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.abort = true;
        self.aborted.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// 当前 serial
    pub fn serial(&self) -> i32 {
        self.serial.load(Ordering::Acquire)
    }

    /// serial 句柄，供时钟判断过期
    pub fn serial_handle(&self) -> Arc<AtomicI32> {
        self.serial.clone()
    }

    /// 节点数（含 flush 标记）
    pub fn len(&self) -> usize {
        self.nb_packets.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 总字节数（负载 + 节点开销）
    pub fn size_bytes(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn packet(pts: i64) -> Packet {
        Packet {
            stream_index: 0,
            pts: Some(pts),
            dts: Some(pts),
            duration: 1,
            pos: pts * 100,
            keyframe: true,
            data: vec![0u8; 10],
        }
    }

    fn started() -> PacketQueue {
        let q = PacketQueue::new();
        q.start();
        match q.get(false) {
            PacketGet::Flush { serial } => assert_eq!(serial, 1),
            other => panic!("expected flush, got {:?}", other),
        }
        q
    }

    #[test]
    fn test_fifo_order() {
        let q = started();
        for i in 0..5 {
            q.put(packet(i)).unwrap();
        }
        assert_eq!(q.len(), 5);
        for i in 0..5 {
            match q.get(true) {
                PacketGet::Packet { packet, serial } => {
                    assert_eq!(packet.pts, Some(i));
                    assert_eq!(serial, 1);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(q.get(false), PacketGet::Empty));
        assert_eq!(q.size_bytes(), 0);
    }

    #[test]
    fn test_serial_changes_only_on_flush() {
        let q = started();
        q.put(packet(0)).unwrap();
        assert_eq!(q.serial(), 1);
        q.flush();
        assert_eq!(q.serial(), 1);
        q.put_flush().unwrap();
        assert_eq!(q.serial(), 2);
        q.put(packet(1)).unwrap();
        q.put(packet(2)).unwrap();

        assert!(matches!(q.get(false), PacketGet::Flush { serial: 2 }));
        for _ in 0..2 {
            match q.get(false) {
                PacketGet::Packet { serial, .. } => assert_eq!(serial, 2),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_size_accounting() {
        let q = started();
        q.put(packet(0)).unwrap();
        q.put_nullpacket(0).unwrap();
        assert_eq!(q.size_bytes(), 10 + 2 * NODE_OVERHEAD);
        q.flush();
        assert_eq!(q.size_bytes(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_put_after_abort_fails() {
        let q = started();
        q.abort();
        assert_eq!(q.put(packet(0)), Err(QueueAborted));
        assert!(matches!(q.get(false), PacketGet::Aborted));
        assert!(q.is_aborted());
    }

    #[test]
    fn test_new_queue_rejects_until_started() {
        let q = PacketQueue::new();
        assert!(q.put(packet(0)).is_err());
        q.start();
        assert!(q.put(packet(0)).is_ok());
    }

    #[test]
    fn test_abort_unblocks_waiter() {
        let q = Arc::new(started());
        let waiter = {
            let q = q.clone();
            thread::spawn(move || matches!(q.get(true), PacketGet::Aborted))
        };
        thread::sleep(Duration::from_millis(50));
        q.abort();
        assert!(waiter.join().unwrap());
    }
}
