//! End-to-end broadcast behaviour against a running server

mod common;

use common::{assert_silent, read_exact_text, send, TestServer, QUIET};
use rustchat::client::format_envelope;
use tokio::time::sleep;

#[tokio::test]
async fn test_lone_client_then_second_client_scenario() {
    let server = TestServer::start().await;

    let mut a = server.connect().await;
    send(&mut a, "hello").await;
    server.wait_for_messages(1).await;
    // Let the empty fan-out finish before B shows up.
    sleep(QUIET).await;
    assert_eq!(server.manager.metrics().deliveries(), 0);
    assert_eq!(server.manager.metrics().delivery_failures(), 0);

    let mut b = server.connect().await;
    send(&mut a, "hi B").await;

    assert_eq!(read_exact_text(&mut b, 4).await, "hi B");
    assert_silent(&mut b).await;
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn test_message_reaches_every_other_client() {
    let server = TestServer::start().await;

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(server.connect().await);
    }

    send(&mut clients[2], "from two").await;

    for (i, client) in clients.iter_mut().enumerate() {
        if i == 2 {
            assert_silent(client).await;
        } else {
            assert_eq!(read_exact_text(client, 8).await, "from two");
        }
    }
}

#[tokio::test]
async fn test_envelope_is_forwarded_verbatim() {
    let server = TestServer::start().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    let message = format_envelope("blue", "héllo wörld");
    send(&mut a, &message).await;

    assert_eq!(read_exact_text(&mut b, message.len()).await, message);
}

#[tokio::test]
async fn test_messages_from_one_sender_keep_order() {
    let server = TestServer::start().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    let mut expected = String::new();
    for i in 0..20 {
        let part = format!("m{:02};", i);
        send(&mut a, &part).await;
        expected.push_str(&part);
    }

    assert_eq!(read_exact_text(&mut b, expected.len()).await, expected);
}

#[tokio::test]
async fn test_concurrent_broadcasts_are_both_delivered() {
    let server = TestServer::start().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;
    let mut c = server.connect().await;

    let (from_a, from_b) = ("alpha-message", "bravo-message");
    tokio::join!(send(&mut a, from_a), send(&mut b, from_b));

    let seen = read_exact_text(&mut c, from_a.len() + from_b.len()).await;
    assert!(seen.contains(from_a), "missing {:?} in {:?}", from_a, seen);
    assert!(seen.contains(from_b), "missing {:?} in {:?}", from_b, seen);

    assert_eq!(read_exact_text(&mut a, from_b.len()).await, from_b);
    assert_eq!(read_exact_text(&mut b, from_a.len()).await, from_a);
}
