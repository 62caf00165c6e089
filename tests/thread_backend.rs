//! Thread backend contract: FIFO processing, bounded-queue backpressure,
//! and a shutdown that drains queued sessions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connected_pair, Scripted};
use postguard::config::Config;
use postguard::plugins::Plugin;
use postguard::session::SessionHandler;
use postguard::stats::StatsKeeper;
use postguard::threadpool::ThreadPool;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn queued_session(plugins: &Arc<Vec<Arc<dyn Plugin>>>) -> (tokio::net::TcpStream, SessionHandler) {
    let (mut client, server) = connected_pair().await;
    client
        .write_all(b"sender=a@b\nrecipient=c@d\n\n")
        .await
        .expect("send request");
    let session = SessionHandler::new(server, Arc::new(Config::new()), Arc::clone(plugins));
    (client, session)
}

async fn read_response(client: &mut tokio::net::TcpStream) -> String {
    let mut response = String::new();
    client
        .read_to_string(&mut response)
        .await
        .expect("read response");
    response
}

#[tokio::test]
async fn workers_process_queued_sessions() {
    let stats = Arc::new(StatsKeeper::new());
    let pool = ThreadPool::start(1, 2, Arc::clone(&stats));
    assert_eq!(pool.min_threads(), 1);
    assert_eq!(pool.max_threads(), 2);
    assert_eq!(pool.queue_size(), 20);

    let plugins: Arc<Vec<Arc<dyn Plugin>>> = Arc::new(vec![Scripted::answering("P", "dunno")]);
    let mut clients = Vec::new();
    for _ in 0..5 {
        let (client, session) = queued_session(&plugins).await;
        pool.add_task(session).await;
        clients.push(client);
    }
    for client in &mut clients {
        assert_eq!(read_response(client).await, "action=dunno\n\n");
    }
    pool.shutdown().await;
    assert_eq!(stats.total(), 5);
}

#[tokio::test]
async fn full_queue_applies_backpressure() {
    let stats = Arc::new(StatsKeeper::new());
    // one worker, queue capacity 10
    let pool = ThreadPool::start(1, 1, stats);
    let slow: Arc<Vec<Arc<dyn Plugin>>> = Arc::new(vec![Scripted::slow(
        "slow",
        "dunno",
        Duration::from_secs(2),
    )]);

    // occupy the worker, then fill the queue
    let mut clients = Vec::new();
    for _ in 0..11 {
        let (client, session) = queued_session(&slow).await;
        pool.add_task(session).await;
        clients.push(client);
    }
    // the twelfth enqueue has nowhere to go and must wait
    let (client, session) = queued_session(&slow).await;
    let blocked = tokio::time::timeout(Duration::from_millis(200), pool.add_task(session)).await;
    assert!(blocked.is_err(), "add_task should block while the queue is full");
    drop(client);
    drop(clients);
}

#[tokio::test]
async fn shutdown_drains_pending_sessions() {
    let stats = Arc::new(StatsKeeper::new());
    let pool = ThreadPool::start(1, 1, stats);
    let plugins: Arc<Vec<Arc<dyn Plugin>>> = Arc::new(vec![Scripted::answering("P", "ok")]);

    let mut clients = Vec::new();
    for _ in 0..3 {
        let (client, session) = queued_session(&plugins).await;
        pool.add_task(session).await;
        clients.push(client);
    }
    // everything enqueued before shutdown still gets a real answer
    pool.shutdown().await;
    for client in &mut clients {
        assert_eq!(read_response(client).await, "action=ok\n\n");
    }
}
