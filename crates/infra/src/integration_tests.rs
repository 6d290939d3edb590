//! Integration tests for the full queue path.
//!
//! Tests: WorkQueue → ResilientConnection → DiscoveryGroup → agents → store
//!
//! Verifies:
//! - Producers and a consumer on separate connections see FIFO order, with
//!   urgent items jumping ahead
//! - A consumer keeps going across a primary failover
//! - Worker errors are either reported to observers or halt the loop

#[cfg(test)]
mod tests {
    use std::sync::{Arc, mpsc};
    use std::thread;
    use std::time::Duration;

    use keyline_core::{ClientOptions, Endpoint, Escalation, QueueError, QueueOptions};
    use keyline_events::QueueEvent;

    use crate::connection::ResilientConnection;
    use crate::discovery::{DiscoveryGroup, InMemoryDiscovery};
    use crate::queue::{ConnectionSource, Job, WorkFn, create_queue};
    use crate::store::InMemoryCluster;

    const NAME: &str = "mymaster";

    fn agent(n: u16) -> Endpoint {
        Endpoint::new(format!("sentinel-{n}"), 26379)
    }

    fn node(port: u16) -> Endpoint {
        Endpoint::new("10.0.0.1", port)
    }

    struct Env {
        discovery: InMemoryDiscovery,
        cluster: InMemoryCluster,
        group: Arc<DiscoveryGroup>,
    }

    fn setup() -> Env {
        let discovery = InMemoryDiscovery::new();
        discovery.add_agent(agent(1));
        discovery.add_agent(agent(2));
        discovery.set_primary(NAME, node(6379));

        let cluster = InMemoryCluster::new();
        cluster.add_node(node(6379));
        cluster.add_node(node(6380));

        let group = Arc::new(DiscoveryGroup::new(
            [agent(1), agent(2)],
            Arc::new(discovery.clone()),
        ));
        Env {
            discovery,
            cluster,
            group,
        }
    }

    impl Env {
        fn connect(&self) -> ResilientConnection {
            ResilientConnection::open(
                self.group.clone(),
                Arc::new(self.cluster.clone()),
                NAME,
                ClientOptions::default()
                    .with_retry_delays(Duration::from_millis(10), Duration::from_millis(50))
                    .with_ping_interval(Duration::ZERO),
            )
            .unwrap()
        }
    }

    fn queue_options() -> QueueOptions {
        QueueOptions::default()
            .with_timeout(Duration::from_millis(1000))
            .with_escalation(Escalation::HaltLoop)
    }

    fn collecting_worker() -> (WorkFn, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let worker: WorkFn = Box::new(move |job: Job| {
            tx.send(job.as_str().unwrap_or_default().to_string())?;
            Ok(())
        });
        (worker, rx)
    }

    fn receive(rx: &mpsc::Receiver<String>, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| rx.recv_timeout(Duration::from_secs(3)).unwrap())
            .collect()
    }

    #[test]
    fn fifo_with_urgent_items_first_across_connections() {
        let env = setup();
        let producer = create_queue(env.connect(), "jobs", None, queue_options());

        producer.push("v1").unwrap();
        producer.push("v2").unwrap();
        producer.push_urgent("v0").unwrap();

        let (worker, rx) = collecting_worker();
        let consumer = create_queue(env.connect(), "jobs", Some(worker), queue_options());
        consumer.open().unwrap();

        assert_eq!(receive(&rx, 3), ["v0", "v1", "v2"]);

        consumer.close().unwrap();
        producer.close().unwrap();
    }

    #[test]
    fn idle_queue_keeps_polling_without_calling_worker() {
        let env = setup();
        let (worker, rx) = collecting_worker();
        let queue = create_queue(env.connect(), "jobs", Some(worker), queue_options());
        queue.open().unwrap();

        // Two full blocking-pop timeouts with nothing to pop.
        thread::sleep(Duration::from_millis(2300));

        assert!(rx.try_recv().is_err());
        assert!(env.cluster.command_count("BLPOP") >= 2);

        queue.push("late").unwrap();
        assert_eq!(receive(&rx, 1), ["late"]);
        queue.close().unwrap();
    }

    #[test]
    fn consumer_survives_primary_failover() {
        let env = setup();
        let (worker, rx) = collecting_worker();
        let queue = create_queue(env.connect(), "jobs", Some(worker), queue_options());
        queue.open().unwrap();

        queue.push("before").unwrap();
        assert_eq!(receive(&rx, 1), ["before"]);

        // Old primary dies, agents now report the replica as primary.
        env.discovery.set_primary(NAME, node(6380));
        env.cluster.set_down(&node(6379), true);

        let mut pushed = false;
        for _ in 0..100 {
            if queue.push("after").is_ok() {
                pushed = true;
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(pushed);
        assert_eq!(receive(&rx, 1), ["after"]);
        assert!(env.cluster.connect_count(&node(6380)) >= 1);

        queue.close().unwrap();
    }

    #[test]
    fn factory_queue_reopens_on_a_fresh_connection() {
        let env = setup();
        let group = env.group.clone();
        let cluster = env.cluster.clone();
        let factory = Box::new(move || {
            ResilientConnection::open(
                group.clone(),
                Arc::new(cluster.clone()),
                NAME,
                ClientOptions::default().with_ping_interval(Duration::ZERO),
            )
        });
        let (worker, rx) = collecting_worker();
        let queue = create_queue(
            ConnectionSource::Factory(factory),
            "jobs",
            Some(worker),
            queue_options(),
        );

        queue.open().unwrap();
        queue.push("first").unwrap();
        assert_eq!(receive(&rx, 1), ["first"]);

        queue.open().unwrap();
        queue.push("second").unwrap();
        assert_eq!(receive(&rx, 1), ["second"]);
        assert_eq!(env.cluster.connect_count(&node(6379)), 2);

        queue.close().unwrap();
    }

    #[test]
    fn unobserved_worker_error_halts_the_loop() {
        let env = setup();
        let worker: WorkFn = Box::new(|job: Job| -> anyhow::Result<()> {
            anyhow::bail!("cannot handle {}", job.as_str().unwrap_or_default())
        });
        let queue = create_queue(env.connect(), "jobs", Some(worker), queue_options());

        queue.push("bad").unwrap();
        queue.push("untouched").unwrap();
        queue.open().unwrap();

        let err = queue.join().unwrap_err();

        assert_eq!(
            err,
            QueueError::Worker {
                queue: "jobs".into(),
                message: "cannot handle bad".into()
            }
        );
        assert_eq!(env.cluster.list("jobs"), vec![b"untouched".to_vec()]);
        queue.close().unwrap();
    }

    #[test]
    fn observed_worker_error_does_not_stop_processing() {
        let env = setup();
        let (tx, rx) = mpsc::channel();
        let worker: WorkFn = Box::new(move |job: Job| -> anyhow::Result<()> {
            let text = job.as_str().unwrap_or_default().to_string();
            if text == "bad" {
                anyhow::bail!("rejected");
            }
            tx.send(text)?;
            Ok(())
        });
        let queue = create_queue(env.connect(), "jobs", Some(worker), queue_options());
        let events = queue.subscribe();

        queue.push("bad").unwrap();
        queue.push("good").unwrap();
        queue.open().unwrap();

        assert_eq!(receive(&rx, 1), ["good"]);
        assert!(events.drain().iter().any(|n| matches!(
            n.event(),
            QueueEvent::WorkerError { message } if message.contains("rejected")
        )));

        queue.close().unwrap();
    }

    #[test]
    fn unreachable_first_agent_is_demoted_behind_the_one_that_answered() {
        let env = setup();
        env.discovery.set_agent_down(&agent(1), true);

        let conn = env.connect();
        assert_eq!(
            conn.wait_ready(Some(Duration::from_secs(2))).unwrap(),
            node(6379)
        );
        assert_eq!(env.group.endpoints(), vec![agent(2), agent(1)]);

        env.discovery.reset_queries();
        env.discovery.set_agent_down(&agent(1), false);
        env.cluster.drop_connections(&node(6379));
        let _ = conn.command(&keyline_core::Request::ping());
        conn.wait_ready(Some(Duration::from_secs(2))).unwrap();

        // The agent that answered last is asked first.
        assert_eq!(env.discovery.queries().first(), Some(&agent(2)));
        conn.close();
    }
}
