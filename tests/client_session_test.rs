use std::sync::Arc;
use std::time::Duration;
use switchboard::client::Client;
use switchboard::config::ClientConfig;
use switchboard::request::{InfoQuery, RequestError};
use switchboard::stanza::{Stanza, StanzaBuilder};
use switchboard::transport::TransportEvent;
use switchboard::transport::mock::{MockConnection, MockTransportFactory};
use switchboard::types::events::Event;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> ClientConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    ClientConfig {
        uid: "201".to_string(),
        password: "secret".to_string(),
        realm: "pbx.local".to_string(),
        endpoint: "wss://pbx.local/ws".to_string(),
        ..Default::default()
    }
}

fn record_events(client: &Arc<Client>) -> mpsc::UnboundedReceiver<&'static str> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.add_event_handler(Arc::new(move |event: &Event| {
        let _ = tx.send(event.name());
    }));
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<&'static str>) -> &'static str {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn connected_client() -> (
    Arc<Client>,
    Arc<MockTransportFactory>,
    MockConnection,
    mpsc::UnboundedReceiver<&'static str>,
) {
    let factory = Arc::new(MockTransportFactory::auto_connect());
    let client = Client::new(config(), factory.clone());
    let mut events = record_events(&client);
    client.start();
    client.connect().await;

    let conn = factory
        .wait_for_connection(1, WAIT)
        .await
        .expect("no transport was opened");
    assert_eq!(next_event(&mut events).await, "connected");
    (client, factory, conn, events)
}

fn reply_to(request: &Stanza, kind: &str) -> Stanza {
    StanzaBuilder::new("iq")
        .attr("type", kind)
        .attr("id", request.id().unwrap_or_default())
        .build()
}

#[tokio::test]
async fn test_connect_opens_transport_and_announces_presence() {
    let (client, _factory, conn, _events) = connected_client().await;

    assert!(client.is_connected());
    assert_eq!(conn.params.uid, "201");
    assert_eq!(conn.params.endpoint, "wss://pbx.local/ws");

    let presence = conn
        .transport
        .wait_for_sent(|s| s.tag == "presence", WAIT)
        .await
        .expect("initial presence was not sent");
    assert!(presence.attrs.is_empty());
}

#[tokio::test]
async fn test_request_waits_for_matching_reply() {
    let (client, _factory, conn, _events) = connected_client().await;

    let requester = client.clone();
    let pending = tokio::spawn(async move {
        requester
            .send_iq(InfoQuery::get("urn:switchboard:pub:subscribe"))
            .await
    });

    let request = conn
        .transport
        .wait_for_sent(|s| s.tag == "iq", WAIT)
        .await
        .expect("request was not sent");
    assert!(request.id().is_some());

    let unrelated = StanzaBuilder::new("iq")
        .attr("type", "result")
        .attr("id", "someone-else")
        .build();
    conn.deliver(unrelated).await;
    conn.deliver(reply_to(&request, "result")).await;

    let reply = pending.await.unwrap().unwrap();
    assert_eq!(reply.id(), request.id());
}

#[tokio::test]
async fn test_error_reply_becomes_server_error() {
    let (client, _factory, conn, _events) = connected_client().await;

    let requester = client.clone();
    let pending =
        tokio::spawn(async move { requester.send_iq(InfoQuery::set("urn:switchboard:cc")).await });

    let request = conn
        .transport
        .wait_for_sent(|s| s.tag == "iq", WAIT)
        .await
        .unwrap();
    conn.deliver(request.error_reply(403, "auth", "forbidden"))
        .await;

    assert_eq!(
        pending.await.unwrap(),
        Err(RequestError::Server {
            code: 403,
            reason: "forbidden".to_string()
        })
    );
}

#[tokio::test]
async fn test_pending_request_fails_when_session_drops() {
    let (client, _factory, conn, mut events) = connected_client().await;

    let requester = client.clone();
    let pending =
        tokio::spawn(async move { requester.send_iq(InfoQuery::set("urn:switchboard:cc")).await });
    conn.transport
        .wait_for_sent(|s| s.tag == "iq", WAIT)
        .await
        .unwrap();

    conn.emit(TransportEvent::Disconnected).await;

    assert_eq!(pending.await.unwrap(), Err(RequestError::Disconnected));
    assert_eq!(next_event(&mut events).await, "disconnected");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_request_without_session_fails_fast() {
    let client = Client::new(config(), Arc::new(MockTransportFactory::new()));
    assert_eq!(
        client.send_iq(InfoQuery::get("urn:switchboard:cc")).await,
        Err(RequestError::NotConnected)
    );
}

#[tokio::test]
async fn test_unhandled_iq_is_rejected() {
    let (_client, _factory, conn, _events) = connected_client().await;

    let request = StanzaBuilder::new("iq")
        .attr("type", "get")
        .attr("id", "srv-1")
        .attr("from", "pbx.local")
        .child(
            StanzaBuilder::new("query")
                .attr("xmlns", "urn:example:unknown")
                .build(),
        )
        .build();
    conn.deliver(request).await;

    let rejection = conn
        .transport
        .wait_for_sent(|s| s.id() == Some("srv-1"), WAIT)
        .await
        .expect("unhandled iq was not answered");
    assert_eq!(rejection.stanza_type(), Some("error"));
    assert_eq!(rejection.attr("to"), Some("pbx.local"));
    let error = rejection.get_optional_child("error").unwrap();
    assert_eq!(error.attr("code"), Some("501"));
    assert!(error.get_optional_child("feature-not-implemented").is_some());
}

#[tokio::test]
async fn test_unexpected_close_reconnects() {
    let (client, factory, conn, mut events) = connected_client().await;

    conn.emit(TransportEvent::Disconnected).await;
    assert_eq!(next_event(&mut events).await, "disconnected");

    let second = factory
        .wait_for_connection(2, WAIT)
        .await
        .expect("client did not reconnect");
    assert_eq!(second.params.attempt, conn.params.attempt + 1);
    assert_eq!(next_event(&mut events).await, "connected");
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_explicit_disconnect_stays_down() {
    let (client, factory, conn, mut events) = connected_client().await;

    client.disconnect().await;
    assert_eq!(next_event(&mut events).await, "disconnected");
    assert!(conn.transport.is_closed());

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(factory.connection_count(), 1);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_refused_connection_retries_after_backoff() {
    let mut config = config();
    config.reconnect.backoff_min = 1;
    config.reconnect.backoff_max = 1;

    let factory = Arc::new(MockTransportFactory::auto_connect());
    factory.set_refuse(true);
    let client = Client::new(config, factory.clone());
    let mut events = record_events(&client);
    client.start();
    client.connect().await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(factory.connection_count(), 0);
    factory.set_refuse(false);

    factory
        .wait_for_connection(1, WAIT)
        .await
        .expect("client did not retry");
    assert_eq!(next_event(&mut events).await, "connected");
}
