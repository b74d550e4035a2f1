//! In-memory broker doubles for exercising the feed client without a network.

use crate::{
    Tick,
    client::BrokerConnector,
    codec::{BrokerRequest, BrokerResponse, encode_frame},
};
use futures::Sink;
use levelwatch_integration::{
    error::SocketError,
    protocol::websocket::{WsError, WsMessage},
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Client-side half of an in-memory transport pair.
#[derive(Debug)]
pub struct FakeTransport {
    inbound: UnboundedReceiver<Result<WsMessage, WsError>>,
    outbound: UnboundedSender<WsMessage>,
}

impl futures::Stream for FakeTransport {
    type Item = Result<WsMessage, WsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_recv(cx)
    }
}

impl Sink<WsMessage> for FakeTransport {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsMessage) -> Result<(), Self::Error> {
        self.outbound.send(item).map_err(|_| WsError::AlreadyClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Broker-side half: scripted responses and assertions on client requests.
#[derive(Debug)]
pub struct BrokerSide {
    to_client: UnboundedSender<Result<WsMessage, WsError>>,
    from_client: UnboundedReceiver<WsMessage>,
}

impl BrokerSide {
    /// Next text command the client sent, skipping anything else.
    ///
    /// # Panics
    /// After two seconds without a request, or on an unparseable one.
    pub async fn next_request(&mut self) -> BrokerRequest {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), self.from_client.recv())
                .await
                .expect("timed out waiting for client request")
                .expect("client transport closed");
            if let WsMessage::Text(payload) = message {
                return serde_json::from_str(&payload).expect("client sent invalid request");
            }
        }
    }

    /// Like [`BrokerSide::next_request`] but returns `None` when `wait`
    /// elapses without any text command arriving.
    pub async fn try_next_request(&mut self, wait: Duration) -> Option<BrokerRequest> {
        loop {
            let message = tokio::time::timeout(wait, self.from_client.recv())
                .await
                .ok()??;
            if let WsMessage::Text(payload) = message {
                return serde_json::from_str(&payload).ok();
            }
        }
    }

    pub fn send_auth_ack(&self, ok: bool) {
        let response = BrokerResponse::AuthAck {
            ok,
            reason: (!ok).then(|| "token expired".to_string()),
        };
        self.send_response(&response);
    }

    pub fn send_response(&self, response: &BrokerResponse) {
        let payload = serde_json::to_string(response).expect("serialise broker response");
        self.to_client
            .send(Ok(WsMessage::text(payload)))
            .expect("client transport closed");
    }

    pub fn send_ticks(&self, ticks: &[Tick]) {
        let frame = encode_frame(ticks).expect("encode tick frame");
        self.to_client
            .send(Ok(WsMessage::binary(frame)))
            .expect("client transport closed");
    }

    /// An undecodable binary frame.
    pub fn send_garbage(&self) {
        self.to_client
            .send(Ok(WsMessage::binary(vec![0xde, 0xad])))
            .expect("client transport closed");
    }

    pub fn disconnect(self) {
        drop(self.to_client);
    }
}

/// Build a connected client/broker transport pair.
pub fn transport_pair() -> (FakeTransport, BrokerSide) {
    let (to_client, inbound) = unbounded_channel();
    let (outbound, from_client) = unbounded_channel();
    (
        FakeTransport { inbound, outbound },
        BrokerSide {
            to_client,
            from_client,
        },
    )
}

/// [`BrokerConnector`] handing out pre-provisioned in-memory transports; a
/// connect with none left fails like an unreachable endpoint.
#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    transports: Arc<Mutex<VecDeque<FakeTransport>>>,
}

impl FakeConnector {
    /// Provision `count` transports, returning their broker sides in connect
    /// order.
    pub fn provision(count: usize) -> (Self, Vec<BrokerSide>) {
        let mut transports = VecDeque::new();
        let mut brokers = Vec::new();
        for _ in 0..count {
            let (transport, broker) = transport_pair();
            transports.push_back(transport);
            brokers.push(broker);
        }
        (
            Self {
                transports: Arc::new(Mutex::new(transports)),
            },
            brokers,
        )
    }
}

#[async_trait::async_trait]
impl BrokerConnector for FakeConnector {
    type Transport = FakeTransport;

    async fn connect(&self) -> Result<Self::Transport, SocketError> {
        self.transports
            .lock()
            .pop_front()
            .ok_or_else(|| SocketError::Subscribe("no transport provisioned".to_string()))
    }
}
