use mongodb_sdam::error::Error;
use mongodb_sdam::pool::{ConnectionPool, PoolOptions};

use bson::Document;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::support::{self, host, MockConnector, Scripted};

fn pool_options(max_size: usize, min_size: usize) -> PoolOptions {
    PoolOptions {
        max_size: max_size,
        min_size: min_size,
        wait_queue_timeout: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(1),
        app_name: Some("pool-tests".to_owned()),
    }
}

fn pool(max_size: usize, min_size: usize) -> (ConnectionPool, Arc<MockConnector>) {
    let connector = MockConnector::new();
    connector.reply(&host("a"), support::standalone());
    let pool = ConnectionPool::new(host("a"), connector.clone(), pool_options(max_size, min_size));
    (pool, connector)
}

#[test]
fn returned_connections_are_reused() {
    let (pool, connector) = pool(2, 0);

    let conn = pool.checkout().unwrap();
    assert_eq!(pool.stats().unwrap().idle, 0);
    drop(conn);

    let stats = pool.stats().unwrap();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.total, 1);

    let _conn = pool.checkout().unwrap();
    assert_eq!(connector.connects(&host("a")), 1);
}

#[test]
fn broken_connections_are_closed_on_return() {
    let (pool, connector) = pool(2, 0);

    let mut conn = pool.checkout().unwrap();
    conn.mark_broken();
    drop(conn);

    let stats = pool.stats().unwrap();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.total, 0);

    let _conn = pool.checkout().unwrap();
    assert_eq!(connector.connects(&host("a")), 2);
}

#[test]
fn network_errors_mark_connections_broken() {
    let (pool, connector) = pool(1, 0);
    connector.script(&host("a"), Scripted::NetworkError);

    let mut conn = pool.checkout().unwrap();
    let err = conn.send_command("admin", Document::new(), None).unwrap_err();
    assert!(err.is_network_error());
    assert!(conn.is_broken());
}

#[test]
fn checkout_times_out_when_the_pool_is_exhausted() {
    let (pool, _) = pool(1, 0);
    let _held = pool.checkout().unwrap();

    let start = Instant::now();
    match pool.checkout() {
        Err(Error::WaitQueueTimeout { ref host }) => assert_eq!(*host, support::host("a")),
        Err(other) => panic!("expected a wait queue timeout, got {}", other),
        Ok(_) => panic!("expected a wait queue timeout"),
    }
    assert!(start.elapsed() >= Duration::from_millis(200));
}

#[test]
fn an_earlier_deadline_cuts_the_wait_short() {
    let connector = MockConnector::new();
    connector.reply(&host("a"), support::standalone());
    let mut options = pool_options(1, 0);
    options.wait_queue_timeout = Duration::from_secs(10);
    let pool = ConnectionPool::new(host("a"), connector.clone(), options);
    let _held = pool.checkout().unwrap();

    let start = Instant::now();
    match pool.checkout_with_deadline(start + Duration::from_millis(150)) {
        Err(Error::WaitQueueTimeout { .. }) => (),
        Err(other) => panic!("expected a wait queue timeout, got {}", other),
        Ok(_) => panic!("expected a wait queue timeout"),
    }

    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(150));
    assert!(waited < Duration::from_secs(2));
}

#[test]
fn waiters_are_woken_by_returned_connections() {
    let connector = MockConnector::new();
    connector.reply(&host("a"), support::standalone());
    let mut options = pool_options(1, 0);
    options.wait_queue_timeout = Duration::from_secs(5);
    let pool = ConnectionPool::new(host("a"), connector.clone(), options);

    let held = pool.checkout().unwrap();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.checkout().map(|conn| conn.generation()))
    };

    thread::sleep(Duration::from_millis(50));
    drop(held);

    assert_eq!(waiter.join().unwrap().unwrap(), 0);
    assert_eq!(connector.connects(&host("a")), 1);
}

#[test]
fn clearing_discards_connections_of_older_generations() {
    let (pool, _) = pool(2, 0);

    let idle = pool.checkout().unwrap();
    let in_use = pool.checkout().unwrap();
    drop(idle);
    assert_eq!(pool.stats().unwrap().idle, 1);

    pool.clear().unwrap();
    let stats = pool.stats().unwrap();
    assert_eq!(stats.generation, 1);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.total, 1);

    assert_eq!(in_use.generation(), 0);
    drop(in_use);
    let stats = pool.stats().unwrap();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.total, 0);

    assert_eq!(pool.checkout().unwrap().generation(), 1);
}

#[test]
fn invalidation_only_applies_to_the_current_generation() {
    let (pool, _) = pool(2, 0);

    assert!(pool.invalidate(0).unwrap());
    assert!(!pool.invalidate(0).unwrap());
    assert_eq!(pool.generation().unwrap(), 1);
}

#[test]
fn populate_opens_the_minimum() {
    let (pool, connector) = pool(4, 2);
    pool.populate_min().unwrap();

    let stats = pool.stats().unwrap();
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.total, 2);
    assert_eq!(stats.max_size, 4);

    // Already satisfied.
    pool.populate_min().unwrap();
    assert_eq!(connector.connects(&host("a")), 2);
}

#[test]
fn closed_pools_reject_checkouts() {
    let (pool, _) = pool(2, 0);
    let conn = pool.checkout().unwrap();
    pool.close().unwrap();
    drop(conn);

    assert_eq!(pool.stats().unwrap().total, 0);
    match pool.checkout() {
        Err(Error::PoolClosed { .. }) => (),
        Err(other) => panic!("expected a closed pool, got {}", other),
        Ok(_) => panic!("expected a closed pool"),
    }
}

#[test]
fn failed_connects_release_their_slot() {
    let (pool, connector) = pool(1, 0);
    connector.refuse(&host("a"));

    let err = pool.checkout().err().expect("refused connection must fail");
    assert!(err.is_network_error());
    assert_eq!(pool.stats().unwrap().total, 0);

    connector.reply(&host("a"), support::standalone());
    assert!(pool.checkout().is_ok());
}

#[test]
fn failed_handshakes_are_network_errors() {
    let (pool, connector) = pool(1, 0);
    connector.reply(&host("a"), support::command_failure(18, "auth failed"));

    let err = pool.checkout().err().expect("failed handshake must fail");
    match err {
        Error::HandshakeError { ref host, .. } => assert_eq!(*host, support::host("a")),
        ref other => panic!("expected a handshake error, got {}", other),
    }
    assert!(err.is_network_error());
    assert_eq!(pool.stats().unwrap().total, 0);
}
