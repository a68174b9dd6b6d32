use std::{
	io,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread,
	time::{Duration, Instant},
};

use futures::executor::ThreadPool;
use static_assertions::assert_impl_all;

struct Timer {
	last_run: Instant,
	period: Duration,
	active: Arc<AtomicBool>,
}

impl Timer {
	fn new(period: Duration) -> (Self, Arc<AtomicBool>) {
		let active = Arc::new(AtomicBool::new(true));
		let timer = Self {
			last_run: Instant::now(),
			period,
			active: Arc::clone(&active),
		};
		(timer, active)
	}

	fn sleep_duration(&self) -> Option<Duration> {
		if !self.active.load(Ordering::Relaxed) {
			return None;
		}
		Some(self.period.saturating_sub(self.last_run.elapsed()))
	}

	fn reset(&mut self) {
		self.last_run = Instant::now();
	}
}

/// Stops the scheduled task it belongs to when dropped.
pub(crate) struct ScheduledTaskHandle {
	running: Arc<AtomicBool>,
}

impl Drop for ScheduledTaskHandle {
	fn drop(&mut self) {
		self.running.store(false, Ordering::Relaxed);
	}
}

/// Runs storage I/O and background work off the calling thread.
pub(crate) struct IoDispatcher {
	pool: ThreadPool,
}

assert_impl_all!(IoDispatcher: Send, Sync);

impl IoDispatcher {
	pub fn new(num_threads: usize) -> Result<Self, io::Error> {
		let pool = ThreadPool::builder()
			.pool_size(num_threads.max(1))
			.name_prefix("bufpool-io-")
			.create()?;
		Ok(Self { pool })
	}

	pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
		self.pool.spawn_ok(async move { job() });
	}

	/// Runs `task` every `period` on a thread of its own, until the returned
	/// handle is dropped. The task never occupies one of the I/O threads.
	pub fn schedule(
		&self,
		name: &str,
		period: Duration,
		task: impl Fn() + Send + 'static,
	) -> Result<ScheduledTaskHandle, io::Error> {
		let (mut timer, running) = Timer::new(period);
		thread::Builder::new()
			.name(format!("bufpool-{name}"))
			.spawn(move || {
				while let Some(duration) = timer.sleep_duration() {
					thread::sleep(duration);
					if timer.sleep_duration().is_none() {
						break;
					}
					timer.reset();
					task();
				}
			})?;
		Ok(ScheduledTaskHandle { running })
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{atomic::AtomicUsize, mpsc};

	use super::*;

	#[test]
	fn spawned_job_runs() {
		// given
		let dispatcher = IoDispatcher::new(1).unwrap();
		let (tx, rx) = mpsc::channel();

		// when
		dispatcher.spawn(move || tx.send(69).unwrap());

		// then
		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 69);
	}

	#[test]
	fn scheduled_task_stops_with_handle() {
		// given
		let dispatcher = IoDispatcher::new(2).unwrap();
		let runs = Arc::new(AtomicUsize::new(0));
		let task_runs = Arc::clone(&runs);

		// when
		let handle = dispatcher
			.schedule("test", Duration::from_millis(5), move || {
				task_runs.fetch_add(1, Ordering::Relaxed);
			})
			.unwrap();
		thread::sleep(Duration::from_millis(100));
		drop(handle);
		thread::sleep(Duration::from_millis(20));
		let after_stop = runs.load(Ordering::Relaxed);
		thread::sleep(Duration::from_millis(50));

		// then
		assert!(after_stop > 0);
		assert_eq!(runs.load(Ordering::Relaxed), after_stop);
	}

	#[test]
	fn scheduled_task_leaves_io_threads_free() {
		// given
		let dispatcher = IoDispatcher::new(1).unwrap();
		let _handle = dispatcher
			.schedule("test", Duration::from_millis(5), || ())
			.unwrap();
		let (tx, rx) = mpsc::channel();

		// when
		dispatcher.spawn(move || tx.send(()).unwrap());

		// then
		assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
	}
}
