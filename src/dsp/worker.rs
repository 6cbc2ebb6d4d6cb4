//! Worker: background thread for heavy per-block jobs.
//!
//! The audio thread hands owned jobs to the worker over lock-free
//! single-producer/single-consumer rings (one pair per [`WorkerLane`]) and
//! gets them back, completed, on a second ring. Nothing on the audio side
//! ever blocks: a full ring or a late result is reported to the caller.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use rtrb::{Consumer, Producer, RingBuffer};

/// A unit of work executed off the audio thread.
pub trait Job: Send + 'static {
    fn run(&mut self);
}

/// Audio-side end of one job queue pair.
pub struct WorkerLane<J: Job> {
    jobs: Producer<Box<J>>,
    results: Consumer<Box<J>>,
    thread: Thread,
}

impl<J: Job> WorkerLane<J> {
    /// Queue a job and wake the worker. The job is handed back if the
    /// queue is full.
    pub fn submit(&mut self, job: Box<J>) -> Result<(), Box<J>> {
        match self.jobs.push(job) {
            Ok(()) => {
                self.thread.unpark();
                Ok(())
            }
            Err(rtrb::PushError::Full(job)) => Err(job),
        }
    }

    /// Jobs the lane holds in each direction.
    pub fn capacity(&self) -> usize {
        self.jobs.buffer().capacity()
    }

    /// Take one completed job, if any.
    pub fn collect(&mut self) -> Option<Box<J>> {
        self.results.pop().ok()
    }
}

/// Worker-side end of one job queue pair.
pub struct JobQueue<J: Job> {
    jobs: Consumer<Box<J>>,
    results: Producer<Box<J>>,
}

impl<J: Job> JobQueue<J> {
    /// Run queued jobs while there is room to hand them back. A job stays
    /// queued until its result can be returned. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut done = 0;
        while self.results.slots() > 0 {
            let Ok(mut job) = self.jobs.pop() else {
                break;
            };
            job.run();
            if self.results.push(job).is_err() {
                break;
            }
            done += 1;
        }
        done
    }
}

/// Create a connected lane and queue with room for `capacity` jobs each
/// way. `thread` is woken on every submit.
pub fn lane_pair<J: Job>(capacity: usize, thread: Thread) -> (WorkerLane<J>, JobQueue<J>) {
    let capacity = capacity.max(1);
    let (job_tx, job_rx) = RingBuffer::<Box<J>>::new(capacity);
    let (result_tx, result_rx) = RingBuffer::<Box<J>>::new(capacity);
    (
        WorkerLane {
            jobs: job_tx,
            results: result_rx,
            thread,
        },
        JobQueue {
            jobs: job_rx,
            results: result_tx,
        },
    )
}

/// Owns the worker thread. Dropping it stops and joins the thread.
pub struct Worker {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// How long the worker sleeps when it finds no work.
    const IDLE_TIMEOUT: Duration = Duration::from_millis(2);

    /// Start a worker serving `lanes` independent queues, each holding up
    /// to `capacity` jobs in flight.
    pub fn spawn<J: Job>(lanes: usize, capacity: usize) -> io::Result<(Worker, Vec<WorkerLane<J>>)> {
        let running = Arc::new(AtomicBool::new(true));
        let (mut lanes, queues): (Vec<_>, Vec<_>) =
            (0..lanes).map(|_| lane_pair::<J>(capacity, thread::current())).unzip();

        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("organ-worker".into())
            .spawn(move || run_loop(flag, queues))?;

        for lane in lanes.iter_mut() {
            lane.thread = handle.thread().clone();
        }

        log::debug!("worker thread started");

        Ok((
            Worker {
                running,
                thread: Some(handle),
            },
            lanes,
        ))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::warn!("worker thread panicked");
            }
            log::debug!("worker thread stopped");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop<J: Job>(running: Arc<AtomicBool>, mut queues: Vec<JobQueue<J>>) {
    while running.load(Ordering::Acquire) {
        let mut idle = true;

        for queue in queues.iter_mut() {
            if queue.run_pending() > 0 {
                idle = false;
            }
        }

        if idle {
            thread::park_timeout(Worker::IDLE_TIMEOUT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct Square {
        input: u64,
        output: u64,
    }

    impl Job for Square {
        fn run(&mut self) {
            self.output = self.input * self.input;
        }
    }

    fn wait_for<J: Job>(lane: &mut WorkerLane<J>) -> Option<Box<J>> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if let Some(job) = lane.collect() {
                return Some(job);
            }
            thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn jobs_come_back_completed() {
        let (_worker, mut lanes) = Worker::spawn::<Square>(2, 4).expect("spawn failed");

        lanes[0].submit(Box::new(Square { input: 7, output: 0 })).ok().expect("queue full");
        lanes[1].submit(Box::new(Square { input: 9, output: 0 })).ok().expect("queue full");

        let a = wait_for(&mut lanes[0]).expect("lane 0 timed out");
        let b = wait_for(&mut lanes[1]).expect("lane 1 timed out");
        assert_eq!(a.output, 49);
        assert_eq!(b.output, 81);
    }

    #[test]
    fn full_queue_returns_the_job() {
        let (mut worker, mut lanes) = Worker::spawn::<Square>(1, 1).expect("spawn failed");
        worker.stop();

        assert!(lanes[0].submit(Box::new(Square { input: 1, output: 0 })).is_ok());
        let rejected = lanes[0].submit(Box::new(Square { input: 2, output: 0 }));
        assert_eq!(rejected.err().map(|j| j.input), Some(2));
    }

    #[test]
    fn full_result_ring_keeps_jobs_queued() {
        let (mut lane, mut queue) = lane_pair::<Square>(2, thread::current());
        for input in 1..=2 {
            assert!(lane.submit(Box::new(Square { input, output: 0 })).is_ok());
        }
        assert_eq!(queue.run_pending(), 2);

        assert!(lane.submit(Box::new(Square { input: 3, output: 0 })).is_ok());
        assert_eq!(queue.run_pending(), 0, "no room for the result yet");

        assert_eq!(lane.collect().map(|j| j.output), Some(1));
        assert_eq!(queue.run_pending(), 1);
        let outputs: Vec<u64> = std::iter::from_fn(|| lane.collect()).map(|j| j.output).collect();
        assert_eq!(outputs, vec![4, 9]);
    }

    #[test]
    fn stop_joins_the_thread() {
        let (mut worker, _lanes) = Worker::spawn::<Square>(1, 1).expect("spawn failed");
        assert!(worker.is_running());
        worker.stop();
        assert!(!worker.is_running());
    }
}
