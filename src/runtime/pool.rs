//! Responder worker pool.
//!
//! Requests are handed to worker threads over a channel so a slow responder
//! never stalls the event loop. Each finished request is sent back as a
//! `Completion` and the loop is woken through its `mio::Waker`.
//!
//! Stopping the pool discards requests no worker has started and waits for
//! busy workers only until a deadline; workers still inside the responder
//! after that are detached.

use crate::responder::{self, Responder, ResponderError};
use crate::runtime::token::ConnToken;
use crossbeam_channel::{Receiver, Sender};
use mio::Waker;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Extra time idle workers get to notice the closed channel.
const EXIT_SLACK: Duration = Duration::from_millis(50);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A request waiting for a worker.
#[derive(Debug)]
pub struct Job {
    pub token: ConnToken,
    pub request: String,
}

/// A finished request on its way back to the event loop.
#[derive(Debug)]
pub struct Completion {
    pub token: ConnToken,
    pub result: Result<String, ResponderError>,
}

pub struct ResponderPool {
    jobs: Option<Sender<Job>>,
    queued: Receiver<Job>,
    stopping: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl ResponderPool {
    /// Start `workers` threads calling `responder`.
    pub fn spawn(
        workers: usize,
        responder: Arc<dyn Responder>,
        completions: Sender<Completion>,
        waker: Arc<Waker>,
    ) -> io::Result<Self> {
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded::<Job>();
        let stopping = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let jobs = jobs_rx.clone();
            let stopping = Arc::clone(&stopping);
            let responder = Arc::clone(&responder);
            let completions = completions.clone();
            let waker = Arc::clone(&waker);

            let handle = thread::Builder::new()
                .name(format!("responder-{worker_id}"))
                .spawn(move || {
                    worker_loop(worker_id, jobs, &stopping, responder, completions, waker)
                })?;
            handles.push(handle);
        }

        debug!(workers, "Responder pool started");
        Ok(Self {
            jobs: Some(jobs_tx),
            queued: jobs_rx,
            stopping,
            handles,
        })
    }

    /// Queue a request for the next free worker.
    pub fn submit(&self, job: Job) -> io::Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "responder pool stopped"))?;
        jobs.send(job)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "responder pool stopped"))
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Stop accepting jobs, drop the ones not yet started and join the
    /// workers that finish by `deadline`. Returns the number of discarded jobs.
    pub fn stop(&mut self, deadline: Instant) -> usize {
        if self.jobs.take().is_none() {
            return 0;
        }
        self.stopping.store(true, Ordering::SeqCst);
        let discarded = self.queued.try_iter().count();

        let deadline = deadline.max(Instant::now() + EXIT_SLACK);
        loop {
            let (finished, busy): (Vec<_>, Vec<_>) =
                self.handles.drain(..).partition(|h| h.is_finished());
            for handle in finished {
                let _ = handle.join();
            }
            self.handles = busy;
            if self.handles.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }

        if !self.handles.is_empty() {
            warn!(
                workers = self.handles.len(),
                "Detaching responder workers still handling requests"
            );
            self.handles.clear();
        }
        debug!(discarded, "Responder pool stopped");
        discarded
    }
}

impl Drop for ResponderPool {
    fn drop(&mut self) {
        self.stop(Instant::now());
    }
}

fn worker_loop(
    worker_id: usize,
    jobs: Receiver<Job>,
    stopping: &AtomicBool,
    responder: Arc<dyn Responder>,
    completions: Sender<Completion>,
    waker: Arc<Waker>,
) {
    for job in jobs.iter() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        trace!(worker = worker_id, conn_id = job.token.slot, "Handling request");
        let result = responder::invoke(responder.as_ref(), &job.request);
        if completions
            .send(Completion {
                token: job.token,
                result,
            })
            .is_err()
        {
            // Event loop is gone.
            break;
        }
        if let Err(e) = waker.wake() {
            error!(worker = worker_id, error = %e, "Failed to wake event loop");
        }
    }
    trace!(worker = worker_id, "Responder worker exiting");
}
