//! Queue handle and its consumer loop.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, error, info, warn};

use keyline_core::{ConnectionError, Escalation, QueueError, QueueOptions, Reply, Request};
use keyline_events::{InMemoryNotifier, Notice, Notifier, QueueEvent, Subscription};

use super::{ConnectionSource, Job, WorkFn};
use crate::connection::ResilientConnection;

type QueueNotifier = InMemoryNotifier<Notice<QueueEvent>>;

/// Holds the worker while no consumer is running. A consumer takes it on
/// start and puts it back when its loop ends, however it ends.
type WorkerSlot = Arc<Mutex<Option<WorkFn>>>;

/// A consumer thread and the connection it pops from.
struct Running {
    handle: thread::JoinHandle<Result<(), QueueError>>,
    connection: ResilientConnection,
}

impl Running {
    fn is_current(&self) -> bool {
        self.handle.thread().id() == thread::current().id()
    }

    fn is_live(&self) -> bool {
        !self.handle.is_finished() && !self.connection.is_closing()
    }
}

struct QueueState {
    connection: Option<ResilientConnection>,
    consumer: Option<Running>,
}

impl QueueState {
    /// Take the consumer unless it is the calling thread, which cannot join
    /// itself. That handle stays put so a later `open()` or `join()` from
    /// elsewhere can still reap it.
    fn take_joinable(&mut self) -> Option<Running> {
        if self.consumer.as_ref().is_some_and(Running::is_current) {
            return None;
        }
        self.consumer.take()
    }
}

/// A named list with producer operations and an optional consumer loop.
pub struct WorkQueue {
    key: String,
    options: QueueOptions,
    source: ConnectionSource,
    worker: WorkerSlot,
    has_worker: bool,
    state: Mutex<QueueState>,
    notifier: Arc<QueueNotifier>,
}

impl core::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("key", &self.key)
            .field("options", &self.options)
            .field("source", &self.source)
            .field("has_worker", &self.has_worker)
            .finish()
    }
}

impl WorkQueue {
    pub fn new(
        source: ConnectionSource,
        key: impl Into<String>,
        worker: Option<WorkFn>,
        options: QueueOptions,
    ) -> Self {
        Self {
            key: key.into(),
            options,
            source,
            has_worker: worker.is_some(),
            worker: Arc::new(Mutex::new(worker)),
            state: Mutex::new(QueueState {
                connection: None,
                consumer: None,
            }),
            notifier: Arc::new(InMemoryNotifier::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Queue notifications. A live subscription also counts as an observer
    /// for worker errors, which keeps them from being escalated.
    ///
    /// Each subscription buffers a bounded number of notices; once full,
    /// newer notices are dropped for it until it is drained. A full
    /// subscription still counts as an observer.
    pub fn subscribe(&self) -> Subscription<Notice<QueueEvent>> {
        self.notifier.subscribe()
    }

    /// Append to the tail (normal priority, FIFO).
    pub fn push(&self, value: impl AsRef<[u8]>) -> Result<(), QueueError> {
        self.write(Request::rpush(&self.key, value))
    }

    /// Prepend to the head; popped before everything already queued.
    pub fn push_urgent(&self, value: impl AsRef<[u8]>) -> Result<(), QueueError> {
        self.write(Request::lpush(&self.key, value))
    }

    /// Number of items waiting in the list.
    pub fn len(&self) -> Result<u64, QueueError> {
        let request = Request::llen(&self.key);
        let reply = self.connection()?.command(&request)?;
        reply
            .as_int()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| self.unexpected(&request, &reply))
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        self.len().map(|n| n == 0)
    }

    /// Attach to a connection and, with a worker, start consuming.
    ///
    /// With a factory source every call builds a new connection and closes
    /// the previous one (joining its consumer first). Calling `open()` while
    /// a consumer is running on a live connection is a no-op; a consumer
    /// whose connection was closed is reaped and replaced.
    pub fn open(&self) -> Result<(), QueueError> {
        let previous = match &self.source {
            ConnectionSource::Shared(connection) => {
                let mut state = self.lock_state();
                state.connection.get_or_insert_with(|| connection.clone());
                None
            }
            ConnectionSource::Factory(factory) => {
                let fresh = factory()?;
                let mut state = self.lock_state();
                let old = state.connection.replace(fresh);
                Some((old, state.take_joinable()))
            }
        };

        if let Some((old, consumer)) = previous {
            if let Some(old) = old {
                old.close();
            }
            if let Some(running) = consumer {
                self.reap(running);
            }
        }

        let consuming = self.start_consumer()?;
        if consuming {
            debug!(queue = %self.key, "ready to accept jobs");
        } else {
            debug!(queue = %self.key, "ready to send jobs");
        }
        self.notifier.notify(Notice::new(
            self.key.as_str(),
            QueueEvent::Ready { consuming },
        ));
        Ok(())
    }

    /// Close the connection and wait for the consumer to stop.
    ///
    /// Returns the reason the consumer halted, if it halted on an error.
    /// Called from inside the worker function, it only closes; the consumer
    /// exits after the worker returns and the queue can be opened again.
    pub fn close(&self) -> Result<(), QueueError> {
        let (connection, consumer) = {
            let mut state = self.lock_state();
            (state.connection.clone(), state.take_joinable())
        };

        if let Some(connection) = connection {
            connection.close();
        }
        info!(queue = %self.key, "queue closed");

        match consumer {
            Some(running) => self.finish(running),
            None => Ok(()),
        }
    }

    /// Block until the consumer loop stops; `Ok` if none is running or when
    /// called from the consumer itself.
    pub fn join(&self) -> Result<(), QueueError> {
        let consumer = self.lock_state().take_joinable();
        match consumer {
            Some(running) => self.finish(running),
            None => Ok(()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self) -> Result<ResilientConnection, QueueError> {
        if let Some(connection) = &self.lock_state().connection {
            return Ok(connection.clone());
        }
        match &self.source {
            ConnectionSource::Shared(connection) => Ok(connection.clone()),
            ConnectionSource::Factory(_) => Err(QueueError::NotOpen(self.key.clone())),
        }
    }

    fn write(&self, request: Request) -> Result<(), QueueError> {
        let reply = self.connection()?.command(&request)?;
        match reply {
            Reply::Int(_) => Ok(()),
            other => Err(self.unexpected(&request, &other)),
        }
    }

    fn unexpected(&self, request: &Request, reply: &Reply) -> QueueError {
        QueueError::UnexpectedReply {
            queue: self.key.clone(),
            command: request.name().to_string(),
            reply: reply.to_string(),
        }
    }

    /// Spawn the consumer thread if there is a worker and none is running.
    fn start_consumer(&self) -> Result<bool, QueueError> {
        if !self.has_worker {
            return Ok(false);
        }

        let mut state = self.lock_state();
        if state.consumer.as_ref().is_some_and(Running::is_live) {
            return Ok(true);
        }
        if let Some(stale) = state.take_joinable() {
            drop(state);
            self.reap(stale);
            state = self.lock_state();
            if state.consumer.as_ref().is_some_and(Running::is_live) {
                return Ok(true);
            }
        }

        let Some(connection) = state.connection.clone() else {
            return Err(QueueError::NotOpen(self.key.clone()));
        };
        if lock_slot(&self.worker).is_none() {
            // Opened from inside the worker: the current consumer still holds it.
            debug!(queue = %self.key, "worker busy in the running consumer");
            return Ok(false);
        }

        let consumer = Consumer {
            key: self.key.clone(),
            connection: connection.clone(),
            options: self.options.clone(),
            notifier: self.notifier.clone(),
            slot: self.worker.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("keyline-queue-{}", self.key))
            .spawn(move || consumer.run())
            .map_err(|e| QueueError::Spawn {
                queue: self.key.clone(),
                reason: e.to_string(),
            })?;

        state.consumer = Some(Running { handle, connection });
        Ok(true)
    }

    /// Join a consumer and return its outcome.
    fn finish(&self, running: Running) -> Result<(), QueueError> {
        match running.handle.join() {
            Ok(outcome) => outcome,
            Err(panic) => Err(QueueError::WorkerPanicked {
                queue: self.key.clone(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    /// Like [`finish`](Self::finish) but only logs the outcome.
    fn reap(&self, running: Running) {
        if let Err(err) = self.finish(running) {
            warn!(queue = %self.key, error = %err, "previous consumer had halted");
        }
    }
}

fn lock_slot(slot: &WorkerSlot) -> MutexGuard<'_, Option<WorkFn>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Consumer {
    key: String,
    connection: ResilientConnection,
    options: QueueOptions,
    notifier: Arc<QueueNotifier>,
    slot: WorkerSlot,
}

impl Consumer {
    fn run(self) -> Result<(), QueueError> {
        let Some(mut worker) = lock_slot(&self.slot).take() else {
            return Ok(());
        };
        info!(
            queue = %self.key,
            timeout_secs = self.options.blocking_timeout_secs(),
            "consumer started"
        );

        let outcome = self.consume(&mut worker);

        match &outcome {
            Ok(()) => info!(queue = %self.key, "consumer stopped"),
            Err(err) => error!(queue = %self.key, error = %err, "consumer halted"),
        }
        *lock_slot(&self.slot) = Some(worker);
        self.notifier
            .notify(Notice::new(self.key.as_str(), QueueEvent::Stopped));

        outcome
    }

    fn consume(&self, worker: &mut WorkFn) -> Result<(), QueueError> {
        let request = Request::blpop(&self.key, self.options.blocking_timeout_secs());

        loop {
            if self.connection.is_closing() {
                return Ok(());
            }

            match self.connection.command(&request) {
                Ok(reply) => {
                    if let Some(job) = self.job_from(reply)? {
                        self.dispatch(worker, job)?;
                    }
                }
                Err(ConnectionError::Closed { .. }) => return Ok(()),
                Err(err) if err.is_terminal() => return Err(err.into()),
                Err(err) => {
                    debug!(queue = %self.key, error = %err, "error on next job");
                }
            }

            thread::yield_now();
        }
    }

    /// `None` on a timed-out pop.
    fn job_from(&self, reply: Reply) -> Result<Option<Job>, QueueError> {
        if reply.is_nil() {
            return Ok(None);
        }

        let rendered = reply.to_string();
        let payload = reply
            .into_array()
            .filter(|items| items.len() == 2)
            .and_then(|mut items| items.pop())
            .and_then(|item| item.as_bytes().map(<[u8]>::to_vec));

        match payload {
            Some(payload) => Ok(Some(Job::new(self.key.clone(), payload))),
            None => Err(QueueError::UnexpectedReply {
                queue: self.key.clone(),
                command: "BLPOP".to_string(),
                reply: rendered,
            }),
        }
    }

    fn dispatch(&self, worker: &mut WorkFn, job: Job) -> Result<(), QueueError> {
        debug!(queue = %self.key, bytes = job.payload().len(), "dispatching job");

        let failure = match panic::catch_unwind(AssertUnwindSafe(|| worker(job))) {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => QueueError::Worker {
                queue: self.key.clone(),
                message: format!("{err:#}"),
            },
            Err(panic) => QueueError::WorkerPanicked {
                queue: self.key.clone(),
                message: panic_message(panic.as_ref()),
            },
        };

        let observers = self.notifier.notify(Notice::new(
            self.key.as_str(),
            QueueEvent::WorkerError {
                message: failure.to_string(),
            },
        ));
        if observers > 0 {
            warn!(queue = %self.key, error = %failure, observers, "worker error reported");
            return Ok(());
        }

        error!(
            queue = %self.key,
            error = %failure,
            escalation = ?self.options.escalation,
            "unobserved worker error; no further jobs will be taken"
        );
        match self.options.escalation {
            Escalation::Abort => process::abort(),
            Escalation::HaltLoop => Err(failure),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::discovery::{DiscoveryGroup, InMemoryDiscovery};
    use crate::queue::create_queue;
    use crate::store::InMemoryCluster;
    use keyline_core::{ClientOptions, Endpoint};

    fn primary() -> Endpoint {
        Endpoint::new("127.0.0.1", 6379)
    }

    fn backends() -> (InMemoryCluster, Arc<DiscoveryGroup>) {
        let agent = Endpoint::new("sentinel-1", 26379);
        let discovery = InMemoryDiscovery::new();
        discovery.add_agent(agent.clone());
        discovery.set_primary("primary", primary());

        let cluster = InMemoryCluster::new();
        cluster.add_node(primary());

        let group = Arc::new(DiscoveryGroup::new([agent], Arc::new(discovery)));
        (cluster, group)
    }

    fn connect(
        cluster: &InMemoryCluster,
        group: &Arc<DiscoveryGroup>,
    ) -> keyline_core::ConnectionResult<ResilientConnection> {
        ResilientConnection::open(
            group.clone(),
            Arc::new(cluster.clone()),
            "primary",
            ClientOptions::default()
                .with_retry_delays(Duration::from_millis(10), Duration::from_millis(40))
                .with_ping_interval(Duration::ZERO),
        )
    }

    fn setup() -> (InMemoryCluster, ResilientConnection) {
        let (cluster, group) = backends();
        let conn = connect(&cluster, &group).unwrap();
        (cluster, conn)
    }

    fn fast() -> QueueOptions {
        QueueOptions::default()
            .with_timeout(Duration::from_millis(1000))
            .with_escalation(Escalation::HaltLoop)
    }

    #[test]
    fn producer_only_queue_pushes_without_open() {
        let (cluster, conn) = setup();
        let queue = create_queue(conn.clone(), "jobs", None, fast());

        queue.push("a").unwrap();
        queue.push("b").unwrap();
        queue.push_urgent("first").unwrap();

        assert_eq!(
            cluster.list("jobs"),
            vec![b"first".to_vec(), b"a".to_vec(), b"b".to_vec()]
        );
        assert_eq!(queue.len().unwrap(), 3);
        conn.close();
    }

    #[test]
    fn factory_queue_is_not_open_until_opened() {
        let (_cluster, conn) = setup();
        let queue = create_queue(
            ConnectionSource::Factory(Box::new(move || Ok(conn.clone()))),
            "jobs",
            None,
            fast(),
        );

        assert!(matches!(queue.push("a"), Err(QueueError::NotOpen(_))));
        queue.open().unwrap();
        queue.push("a").unwrap();
        queue.close().unwrap();
    }

    #[test]
    fn open_announces_whether_it_consumes() {
        let (_cluster, conn) = setup();
        let queue = create_queue(conn, "jobs", None, fast());
        let events = queue.subscribe();

        queue.open().unwrap();

        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap().into_event(),
            QueueEvent::Ready { consuming: false }
        );
        queue.close().unwrap();
    }

    #[test]
    fn consumer_runs_worker_per_item_in_order() {
        let (_cluster, conn) = setup();
        let (tx, rx) = mpsc::channel();
        let worker: WorkFn = Box::new(move |job: Job| {
            tx.send(job.as_str().unwrap_or_default().to_string())?;
            Ok(())
        });
        let queue = create_queue(conn, "jobs", Some(worker), fast());

        queue.push("one").unwrap();
        queue.push("two").unwrap();
        queue.open().unwrap();
        // A second open on the same connection must not start a second loop.
        queue.open().unwrap();
        queue.push("three").unwrap();

        let got: Vec<String> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(got, ["one", "two", "three"]);

        queue.close().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn worker_panic_is_contained_when_observed() {
        let (cluster, conn) = setup();
        let (tx, rx) = mpsc::channel();
        let worker: WorkFn = Box::new(move |job: Job| {
            if job.as_str() == Some("boom") {
                panic!("worker exploded");
            }
            tx.send(job.into_payload())?;
            Ok(())
        });
        let queue = create_queue(conn, "jobs", Some(worker), fast());
        let events = queue.subscribe();

        queue.push("boom").unwrap();
        queue.push("fine").unwrap();
        queue.open().unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"fine");
        let reported = events
            .drain()
            .into_iter()
            .map(Notice::into_event)
            .find(|e| matches!(e, QueueEvent::WorkerError { .. }));
        assert!(matches!(
            reported,
            Some(QueueEvent::WorkerError { message }) if message.contains("worker exploded")
        ));

        queue.close().unwrap();
        assert!(cluster.list("jobs").is_empty());
    }

    #[test]
    fn close_from_inside_worker_stops_the_loop() {
        let (cluster, conn) = setup();
        let producer = create_queue(conn.clone(), "jobs", None, fast());
        producer.push("stop").unwrap();
        producer.push("left").unwrap();

        let slot = Arc::new(Mutex::new(None::<Arc<WorkQueue>>));
        let worker_slot = slot.clone();
        let worker: WorkFn = Box::new(move |_job| {
            if let Some(queue) = worker_slot.lock().unwrap().as_ref() {
                queue.close()?;
            }
            Ok(())
        });
        let consuming = Arc::new(create_queue(conn.clone(), "jobs", Some(worker), fast()));
        *slot.lock().unwrap() = Some(consuming.clone());

        consuming.open().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !conn.is_closing() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(conn.is_closing());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(cluster.list("jobs"), vec![b"left".to_vec()]);
        slot.lock().unwrap().take();
    }

    #[test]
    fn queue_reopens_after_close_from_inside_worker() {
        let (cluster, group) = backends();
        let factory = {
            let cluster = cluster.clone();
            Box::new(move || connect(&cluster, &group))
        };

        let slot = Arc::new(Mutex::new(None::<Arc<WorkQueue>>));
        let worker_slot = slot.clone();
        let (tx, rx) = mpsc::channel();
        let worker: WorkFn = Box::new(move |job: Job| {
            let text = job.as_str().unwrap_or_default().to_string();
            if text == "stop" {
                if let Some(queue) = worker_slot.lock().unwrap().as_ref() {
                    queue.close()?;
                }
            }
            tx.send(text)?;
            Ok(())
        });
        let queue = Arc::new(create_queue(
            ConnectionSource::Factory(factory),
            "jobs",
            Some(worker),
            fast(),
        ));
        *slot.lock().unwrap() = Some(queue.clone());
        let events = queue.subscribe();

        queue.open().unwrap();
        queue.push("stop").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "stop");

        let stopped = (0..3).any(|_| {
            events
                .recv_timeout(Duration::from_secs(2))
                .is_ok_and(|n| matches!(n.event(), QueueEvent::Stopped))
        });
        assert!(stopped);

        queue.open().unwrap();
        queue.push("again").unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "again");
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap().into_event(),
            QueueEvent::Ready { consuming: true }
        );
        assert!(cluster.list("jobs").is_empty());

        queue.close().unwrap();
        slot.lock().unwrap().take();
    }

    const ABORT_LOG_ENV: &str = "KEYLINE_TEST_ABORT_LOG";

    /// Runs in a child process: consumes with the default escalation and no
    /// observers, recording each payload the worker sees.
    fn consume_until_abort(log: &str) {
        let (_cluster, conn) = setup();
        let log = log.to_string();
        let worker: WorkFn = Box::new(move |job: Job| -> anyhow::Result<()> {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log)?;
            writeln!(file, "{}", job.as_str().unwrap_or_default())?;
            anyhow::bail!("cannot handle job")
        });
        let options = QueueOptions::default().with_timeout(Duration::from_millis(1000));
        let queue = create_queue(conn, "jobs", Some(worker), options);

        queue.push("bad").unwrap();
        queue.push("next").unwrap();
        queue.open().unwrap();
        let _ = queue.join();
    }

    #[test]
    fn unobserved_worker_error_aborts_by_default() {
        if let Ok(log) = std::env::var(ABORT_LOG_ENV) {
            consume_until_abort(&log);
            return;
        }

        let log = std::env::temp_dir().join(format!("keyline-abort-{}.log", process::id()));
        let _ = std::fs::remove_file(&log);

        let status = process::Command::new(std::env::current_exe().unwrap())
            .args([
                "queue::work_queue::tests::unobserved_worker_error_aborts_by_default",
                "--exact",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(ABORT_LOG_ENV, &log)
            .stdout(process::Stdio::null())
            .stderr(process::Stdio::null())
            .status()
            .unwrap();

        assert!(!status.success());
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(status.signal(), Some(6));
        }
        let seen = std::fs::read_to_string(&log).unwrap();
        assert_eq!(seen.lines().collect::<Vec<_>>(), ["bad"]);
        let _ = std::fs::remove_file(&log);
    }
}
