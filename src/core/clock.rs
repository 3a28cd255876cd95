use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// 时钟差超过该值（秒）时不再尝试同步，直接跳变
pub const AV_NOSYNC_THRESHOLD: f64 = 10.0;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// 进程内单调时间（秒），所有时钟共用同一个起点
pub fn relative_time() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// 播放时钟 - 用于音视频同步
///
/// 记录最近一次更新时的 pts 以及它与墙钟的差值（drift），读取时按墙钟外推。
/// 若所属包队列的 serial 已经前进（seek 之后），时钟视为过期，返回 NaN。
#[derive(Clone)]
pub struct Clock {
    inner: Arc<Mutex<ClockInner>>,
    queue_serial: Option<Arc<AtomicI32>>, // None：以自身 serial 为准（外部时钟）
}

struct ClockInner {
    pts: f64,
    pts_drift: f64,
    last_updated: f64,
    speed: f64,
    serial: i32,
    paused: bool,
}

impl ClockInner {
    fn value_at(&self, now: f64) -> f64 {
        if self.paused {
            self.pts
        } else {
            self.pts_drift + now - (now - self.last_updated) * (1.0 - self.speed)
        }
    }

    fn anchor(&mut self, pts: f64, serial: i32, time: f64) {
        self.pts = pts;
        self.last_updated = time;
        self.pts_drift = pts - time;
        self.serial = serial;
    }
}

impl Clock {
    /// `queue_serial` 为所属包队列的 serial 句柄
    pub fn new(queue_serial: Option<Arc<AtomicI32>>) -> Self {
        let now = relative_time();
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: now,
                speed: 1.0,
                serial: -1,
                paused: false,
            })),
            queue_serial,
        }
    }

    fn live_serial(&self, inner: &ClockInner) -> i32 {
        match &self.queue_serial {
            Some(serial) => serial.load(Ordering::Acquire),
            None => inner.serial,
        }
    }

    /// 当前时钟值（秒），过期返回 NaN
    pub fn get(&self) -> f64 {
        self.get_at(relative_time())
    }

    pub fn get_at(&self, now: f64) -> f64 {
        let inner = self.inner.lock();
        if self.live_serial(&inner) != inner.serial {
            return f64::NAN;
        }
        inner.value_at(now)
    }

    pub fn set(&self, pts: f64, serial: i32) {
        self.set_at(pts, serial, relative_time());
    }

    pub fn set_at(&self, pts: f64, serial: i32, time: f64) {
        self.inner.lock().anchor(pts, serial, time);
    }

    /// 先冻结当前外推值再改速率，避免时钟跳变
    pub fn set_speed(&self, speed: f64) {
        let now = relative_time();
        let mut inner = self.inner.lock();
        let current = if self.live_serial(&inner) != inner.serial {
            f64::NAN
        } else {
            inner.value_at(now)
        };
        let serial = inner.serial;
        inner.anchor(current, serial, now);
        inner.speed = speed;
    }

    /// 本时钟无效或与 `slave` 相差超过 [`AV_NOSYNC_THRESHOLD`] 时，对齐到 `slave`
    pub fn sync_to_slave(&self, slave: &Clock) {
        let clock = self.get();
        let slave_clock = slave.get();
        if !slave_clock.is_nan()
            && (clock.is_nan() || (clock - slave_clock).abs() > AV_NOSYNC_THRESHOLD)
        {
            self.set(slave_clock, slave.serial());
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.lock().paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn serial(&self) -> i32 {
        self.inner.lock().serial
    }

    pub fn pts(&self) -> f64 {
        self.inner.lock().pts
    }

    pub fn last_updated(&self) -> f64 {
        self.inner.lock().last_updated
    }

    pub fn speed(&self) -> f64 {
        self.inner.lock().speed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(None)
    }
}
