//! 后台任务：副作用队列与定时清理 / Background work: side-effect jobs and periodic sweeps

pub mod presence_sweep;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct Job {
    name: &'static str,
    future: JobFuture,
}

/// 有界副作用队列 / Bounded best-effort side-effect queue
///
/// Cache appends, counter bumps and summary upserts ride here so the hot
/// send path never blocks on them. Overflow drops the job with a warning and
/// a failed job is logged and swallowed; everything dispatched through here
/// must be reconstructible from the durable store.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Job>,
}

impl JobQueue {
    /// 启动工作协程并返回队列句柄 / Spawn the workers and hand back the queue handle
    pub fn start(queue_size: usize, workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>(queue_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        for worker_id in 0..workers.max(1) {
            let receiver = receiver.clone();
            tokio::spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    match job {
                        Some(job) => {
                            if let Err(err) = job.future.await {
                                warn!("job '{}' failed: {err:#}", job.name);
                            }
                        }
                        None => {
                            debug!("job worker {worker_id} stopping");
                            break;
                        }
                    }
                }
            });
        }
        Self { sender }
    }

    /// 尝试入队；队列满则丢弃 / Try to enqueue; a full queue drops the job
    pub fn dispatch<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let job = Job {
            name,
            future: Box::pin(future),
        };
        if self.sender.try_send(job).is_err() {
            warn!("job queue full, dropping '{name}'");
        }
    }
}
