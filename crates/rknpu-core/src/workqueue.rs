//! Deferred work off the interrupt path.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

use crate::sync::lock;

type Work = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Work),
    Flush(mpsc::Sender<()>),
}

/// Single worker thread running queued closures in submission order.
///
/// Once shut down, or if the worker could not be started, queued work runs inline on the
/// caller.
pub(crate) struct WorkQueue {
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueue {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::channel::<Message>();
        let worker = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                for message in rx {
                    match message {
                        Message::Run(work) => work(),
                        Message::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            });
        match worker {
            Ok(worker) => Self {
                tx: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(worker)),
            },
            Err(err) => {
                warn!(%err, name, "workqueue thread unavailable; running work inline");
                Self {
                    tx: Mutex::new(None),
                    worker: Mutex::new(None),
                }
            }
        }
    }

    pub fn queue(&self, work: impl FnOnce() + Send + 'static) {
        let work: Work = Box::new(work);
        let rejected = match lock(&self.tx).as_ref() {
            Some(tx) => tx.send(Message::Run(work)).err(),
            None => Some(mpsc::SendError(Message::Run(work))),
        };
        if let Some(mpsc::SendError(Message::Run(work))) = rejected {
            work();
        }
    }

    /// Blocks until everything queued before this call has run.
    pub fn flush(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        let sent = match lock(&self.tx).as_ref() {
            Some(tx) => tx.send(Message::Flush(done_tx)).is_ok(),
            None => false,
        };
        if sent {
            let _ = done_rx.recv();
        }
    }

    /// Runs the remaining work and stops the worker.
    pub fn shutdown(&self) {
        lock(&self.tx).take();
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        if worker.thread().id() == std::thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            warn!("workqueue worker panicked");
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Background thread calling `tick` every `interval` until dropped.
pub(crate) struct PeriodicTask {
    stop: Arc<(Mutex<bool>, Condvar)>,
    worker: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn(
        name: &str,
        interval: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> Option<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let worker_stop = stop.clone();
        let worker = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let (stopped, cond) = &*worker_stop;
                let mut guard = lock(stopped);
                loop {
                    let (next, timeout) = cond
                        .wait_timeout_while(guard, interval, |stopped| !*stopped)
                        .unwrap_or_else(PoisonError::into_inner);
                    guard = next;
                    if *guard {
                        return;
                    }
                    if timeout.timed_out() {
                        drop(guard);
                        tick();
                        guard = lock(stopped);
                    }
                }
            })
            .map_err(|err| warn!(%err, name, "periodic task not started"))
            .ok()?;
        Some(Self {
            stop,
            worker: Some(worker),
        })
    }

    pub fn stop(&mut self) {
        let (stopped, cond) = &*self.stop;
        *lock(stopped) = true;
        cond.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("periodic task panicked");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn work_runs_in_order_and_flush_waits() {
        let wq = WorkQueue::new("test-wq");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let log = log.clone();
            wq.queue(move || log.lock().unwrap().push(i));
        }
        wq.flush();
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn work_after_shutdown_runs_inline() {
        let wq = WorkQueue::new("test-wq");
        wq.shutdown();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        wq.queue(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_task_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut task = PeriodicTask::spawn("test-tick", Duration::from_millis(2), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        task.stop();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
