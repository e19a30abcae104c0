use dashmap::DashMap;
use marketcore_core::bus::signal::Signal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::error;

pub type SignalHandler = Arc<dyn Fn(&Signal) + Send + Sync>;

/// # Summary
/// 跨线程信号总线：异步域以非阻塞方式入队，消费域以同步方式直接触发。
///
/// # Invariants
/// - `enqueue` 绝不 `await`，只做一次短临界区的队列写入。
/// - `drain` 对每个取出的信号独立触发所有订阅者；单个订阅者 panic 不影响其余订阅者或后续信号。
/// - 订阅者注册/注销在 `drain` 执行期间调用也是安全的（不会死锁或破坏正在进行的遍历）。
pub struct SignalBus {
    queue: Mutex<VecDeque<Signal>>,
    subscribers: DashMap<u64, SignalHandler>,
    next_id: AtomicU64,
}

impl SignalBus {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// # Summary
    /// 非阻塞地将信号推入队列，供异步域（Streamer/CandleFactory 所在协程）调用。
    pub fn enqueue(&self, signal: Signal) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(signal);
    }

    /// # Summary
    /// 同步地直接触发所有订阅者，供消费域（已经在合适线程上的调用方）调用，不经过队列。
    pub fn publish(&self, signal: &Signal) {
        self.invoke_subscribers(signal);
    }

    /// # Summary
    /// 取出队列中的全部信号并逐个触发订阅者。
    ///
    /// # Returns
    /// 本次 drain 处理的信号数量。
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        loop {
            let next = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.pop_front()
            };
            match next {
                Some(signal) => {
                    drained += 1;
                    self.invoke_subscribers(&signal);
                }
                None => break,
            }
        }
        drained
    }

    /// # Summary
    /// 当前排队等待 drain 的信号数量，供背压策略使用。
    pub fn qsize(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// # Summary
    /// 注册一个订阅者，返回其句柄供后续 `deregister` 使用。
    pub fn register(&self, handler: SignalHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.insert(id, handler);
        id
    }

    pub fn deregister(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// # Summary
    /// 触发所有当前订阅者。先整体快照句柄列表，保证遍历过程中注册/注销不会互相干扰。
    fn invoke_subscribers(&self, signal: &Signal) {
        let handlers: Vec<_> = self.subscribers.iter().map(|entry| entry.value().clone()).collect();
        for handler in handlers {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(signal)));
            if outcome.is_err() {
                error!("signal subscriber panicked, isolating failure from other subscribers");
            }
        }
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketcore_core::bus::signal::ErrorKind;
    use marketcore_core::common::{Market, StreamKey};
    use std::sync::atomic::AtomicUsize;

    fn task_error_signal() -> Signal {
        Signal::TaskError {
            stream_key: StreamKey::Trades(Market::new("coinbase", "BTC/USD")),
            kind: ErrorKind::Internal,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn drain_invokes_subscribers_for_each_queued_signal() {
        let bus = SignalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        bus.register(Arc::new(move |_signal: &Signal| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        bus.enqueue(task_error_signal());
        bus.enqueue(task_error_signal());
        assert_eq!(bus.qsize(), 2);

        let drained = bus.drain();
        assert_eq!(drained, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(bus.qsize(), 0);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let bus = SignalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(Arc::new(|_signal: &Signal| {
            panic!("intentional test panic");
        }));
        let count_clone = count.clone();
        bus.register(Arc::new(move |_signal: &Signal| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        bus.enqueue(task_error_signal());
        bus.drain();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deregister_stops_future_invocations() {
        let bus = SignalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let id = bus.register(Arc::new(move |_signal: &Signal| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        bus.deregister(id);

        bus.enqueue(task_error_signal());
        bus.drain();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn publish_bypasses_queue_and_invokes_immediately() {
        let bus = SignalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        bus.register(Arc::new(move |_signal: &Signal| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        bus.publish(&task_error_signal());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.qsize(), 0);
    }
}
