use chrono::Utc;
use levelwatch_feed::{
    BrokerCredentials, Tick,
    backoff::ReconnectionBackoffPolicy,
    client::{ConnectionState, FeedClient, FeedConfig, FeedHandle},
    codec::BrokerRequest,
    test_util::{BrokerSide, FakeConnector},
};
use levelwatch_instrument::{
    exchange::Exchange,
    instrument::{InstrumentToken, MarketId},
};
use levelwatch_integration::channel::{ConflatingRx, conflating};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

fn test_config() -> FeedConfig {
    FeedConfig {
        read_deadline: Duration::from_secs(5),
        backoff: ReconnectionBackoffPolicy {
            backoff_ms_initial: 10,
            backoff_multiplier: 2,
            backoff_ms_max: 50,
            jitter: 0.0,
        },
        batch_window: Duration::from_millis(10),
        empty_linger: Duration::from_secs(30),
        decode_error_threshold: 3,
        auth_timeout: Duration::from_secs(2),
    }
}

fn market(token: u32) -> MarketId {
    MarketId::new(Exchange::Nse, InstrumentToken(token))
}

fn tick(token: u32, ltp: Decimal) -> Tick {
    Tick::new(market(token), ltp, Utc::now())
}

fn credentials() -> BrokerCredentials {
    BrokerCredentials::new("api-key".into(), "access-token".into())
}

struct Fixture {
    handle: FeedHandle<u8>,
    mailbox: ConflatingRx<MarketId, Tick>,
    brokers: Vec<BrokerSide>,
}

fn spawn_client(transport_count: usize) -> Fixture {
    let (connector, brokers) = FakeConnector::provision(transport_count);
    let (handle, _task) = FeedClient::<u8, _>::spawn(test_config(), connector);

    let (tick_tx, mailbox) = conflating();
    handle.register(1, tick_tx);
    handle.add_credentials(credentials());

    Fixture {
        handle,
        mailbox,
        brokers,
    }
}

async fn recv_tick(mailbox: &mut ConflatingRx<MarketId, Tick>) -> (MarketId, Tick) {
    tokio::time::timeout(Duration::from_secs(2), mailbox.recv())
        .await
        .expect("timed out waiting for tick")
}

#[tokio::test]
async fn test_first_subscription_wakes_connects_and_emits_one_delta() {
    let mut fixture = spawn_client(1);
    let mut broker = fixture.brokers.remove(0);

    fixture.handle.subscribe(1, &[market(2885)]);

    assert_eq!(
        broker.next_request().await,
        BrokerRequest::auth(&credentials())
    );
    broker.send_auth_ack(true);

    // Exactly one subscribe delta containing the new token
    let request = broker.next_request().await;
    assert_eq!(request, BrokerRequest::subscribe([market(2885)]));

    let mut state = fixture.handle.state();
    state
        .wait_for(|state| *state == ConnectionState::Live)
        .await
        .unwrap();
    assert_eq!(fixture.handle.metrics().connection_generation, 1);
}

#[tokio::test]
async fn test_tick_dispatch_conflates_to_latest() {
    let mut fixture = spawn_client(1);
    let mut broker = fixture.brokers.remove(0);

    fixture.handle.subscribe(1, &[market(2885)]);
    broker.next_request().await;
    broker.send_auth_ack(true);
    broker.next_request().await;

    broker.send_ticks(&[tick(2885, dec!(2498.0))]);
    broker.send_ticks(&[tick(2885, dec!(2499.0))]);
    broker.send_ticks(&[tick(2885, dec!(2500.0))]);

    // Give the decoder a moment to drain all three frames
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (key, latest) = recv_tick(&mut fixture.mailbox).await;
    assert_eq!(key, market(2885));
    assert_eq!(latest.ltp, dec!(2500.0));
    assert!(fixture.mailbox.is_empty(), "intermediate ticks must conflate");

    assert_eq!(fixture.handle.metrics().frames_received, 3);
    assert_eq!(fixture.handle.metrics().ticks_decoded, 3);
}

#[tokio::test]
async fn test_reconnect_resubscribes_full_ledger() {
    let mut fixture = spawn_client(2);
    let mut second = fixture.brokers.remove(1);
    let mut first = fixture.brokers.remove(0);

    fixture.handle.subscribe(1, &[market(2885), market(11536)]);
    first.next_request().await;
    first.send_auth_ack(true);
    first.next_request().await;

    // Kill the transport; the client must reconnect and resubscribe everything
    first.disconnect();

    assert_eq!(
        second.next_request().await,
        BrokerRequest::auth(&credentials())
    );
    second.send_auth_ack(true);

    let request = second.next_request().await;
    let BrokerRequest::Subscribe { mut v } = request else {
        panic!("expected full resubscribe, got {request:?}");
    };
    v.sort();
    assert_eq!(v, vec![(1, 2885), (1, 11536)]);

    assert_eq!(fixture.handle.metrics().connection_generation, 2);
}

#[tokio::test]
async fn test_rejected_credentials_rotate_to_next_in_pool() {
    let mut fixture = spawn_client(1);
    let mut broker = fixture.brokers.remove(0);

    let stale = credentials();
    let fresh = BrokerCredentials::new("api-key-2".into(), "access-token-2".into());
    fixture.handle.add_credentials(fresh.clone());

    fixture.handle.subscribe(1, &[market(2885)]);

    assert_eq!(broker.next_request().await, BrokerRequest::auth(&stale));
    broker.send_auth_ack(false);

    assert_eq!(broker.next_request().await, BrokerRequest::auth(&fresh));
    broker.send_auth_ack(true);

    assert_eq!(
        broker.next_request().await,
        BrokerRequest::subscribe([market(2885)])
    );
}

#[tokio::test]
async fn test_decode_error_run_triggers_reconnect() {
    let mut fixture = spawn_client(2);
    let mut second = fixture.brokers.remove(1);
    let mut first = fixture.brokers.remove(0);

    fixture.handle.subscribe(1, &[market(2885)]);
    first.next_request().await;
    first.send_auth_ack(true);
    first.next_request().await;

    // One bad frame is dropped, a run of them tears the connection down
    first.send_garbage();
    first.send_ticks(&[tick(2885, dec!(2500.0))]);
    recv_tick(&mut fixture.mailbox).await;

    first.send_garbage();
    first.send_garbage();
    first.send_garbage();

    assert_eq!(
        second.next_request().await,
        BrokerRequest::auth(&credentials())
    );
    second.send_auth_ack(true);
    second.next_request().await;

    assert!(fixture.handle.metrics().decode_errors >= 3);
    assert_eq!(fixture.handle.metrics().connection_generation, 2);
}

#[tokio::test]
async fn test_opposing_deltas_within_batch_window_cancel_out() {
    let mut fixture = spawn_client(1);
    let mut broker = fixture.brokers.remove(0);

    // Keep one market live so the connection stays up
    fixture.handle.subscribe(1, &[market(2885)]);
    broker.next_request().await;
    broker.send_auth_ack(true);
    broker.next_request().await;

    // Subscribe then immediately unsubscribe inside the batch window
    fixture.handle.subscribe(1, &[market(11536)]);
    fixture.handle.unsubscribe(1, &[market(11536)]);

    // Follow with a real delta and assert the cancelled one never surfaced
    tokio::time::sleep(Duration::from_millis(30)).await;
    fixture.handle.subscribe(1, &[market(3045)]);

    assert_eq!(
        broker.next_request().await,
        BrokerRequest::subscribe([market(3045)])
    );
}

#[tokio::test]
async fn test_deregister_releases_only_exclusive_markets() {
    let mut fixture = spawn_client(1);
    let mut broker = fixture.brokers.remove(0);

    let (tick_tx, _mailbox) = conflating();
    fixture.handle.register(2, tick_tx);

    fixture.handle.subscribe(1, &[market(2885)]);
    fixture.handle.subscribe(2, &[market(2885), market(11536)]);

    broker.next_request().await;
    broker.send_auth_ack(true);
    let request = broker.next_request().await;
    let BrokerRequest::Subscribe { mut v } = request else {
        panic!("expected subscribe, got {request:?}");
    };
    v.sort();
    assert_eq!(v, vec![(1, 2885), (1, 11536)]);

    // Subscriber 2 leaves: 11536 was exclusively theirs, 2885 stays live
    fixture.handle.deregister(2);
    assert_eq!(
        broker.next_request().await,
        BrokerRequest::unsubscribe([market(11536)])
    );
    assert!(fixture.handle.is_subscribed(1, market(2885)));
}
