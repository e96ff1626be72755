//! WebSocket Server
//!
//! Streaming channel for new blocks and validation outcomes. Clients send
//! JSON text frames tagged by `type`; every connection drains its own bounded
//! receivers so a slow client only ever lags itself.

use crate::{
    methods::RpcContext,
    subscriptions::{Notification, NotificationBus, SubscriptionId},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use l2_consensus::{Channel, ClientMessage, ServerMessage};
use std::sync::Arc;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast::{self, error::RecvError},
};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

/// WebSocket Server
pub struct WebSocketServer {
    context: Arc<RpcContext>,
    bus: Arc<NotificationBus>,
}

impl WebSocketServer {
    pub fn new(context: Arc<RpcContext>, bus: Arc<NotificationBus>) -> Self {
        Self { context, bus }
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("WebSocket server listening on {}", addr);
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let context = self.context.clone();
            let bus = self.bus.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, context, bus).await {
                    tracing::warn!("WebSocket connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

type ChannelSubscription = Option<(SubscriptionId, broadcast::Receiver<Notification>)>;

/// Per-connection subscription state
#[derive(Default)]
struct Connection {
    blocks: ChannelSubscription,
    validations: ChannelSubscription,
}

impl Connection {
    fn slot(&mut self, channel: Channel) -> &mut ChannelSubscription {
        match channel {
            Channel::Blocks => &mut self.blocks,
            Channel::Validations => &mut self.validations,
        }
    }

    fn subscribe(&mut self, bus: &NotificationBus, channel: Channel) {
        let slot = self.slot(channel);
        if slot.is_none() {
            *slot = Some(bus.subscribe(channel));
        }
    }

    fn unsubscribe(&mut self, bus: &NotificationBus, channel: Channel) {
        if let Some((id, _)) = self.slot(channel).take() {
            bus.unsubscribe(id);
        }
    }

    fn close(&mut self, bus: &NotificationBus) {
        self.unsubscribe(bus, Channel::Blocks);
        self.unsubscribe(bus, Channel::Validations);
    }
}

/// Next notification on a channel; never resolves while unsubscribed
async fn next_notification(slot: &mut ChannelSubscription) -> Result<Notification, RecvError> {
    match slot {
        Some((_, receiver)) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    context: Arc<RpcContext>,
    bus: Arc<NotificationBus>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut conn = Connection::default();

    let result: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let Some(msg) = msg else { break };
                    match msg? {
                        Message::Text(text) => {
                            if let Some(reply) = handle_client_message(&context, &bus, &mut conn, &text) {
                                ws_sender.send(Message::Text(reply.to_json())).await?;
                            }
                        }
                        Message::Ping(data) => ws_sender.send(Message::Pong(data)).await?,
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                notification = next_notification(&mut conn.blocks) => {
                    forward(&mut ws_sender, &mut conn, Channel::Blocks, &bus, notification).await?;
                }
                notification = next_notification(&mut conn.validations) => {
                    forward(&mut ws_sender, &mut conn, Channel::Validations, &bus, notification).await?;
                }
            }
        }
        Ok(())
    }
    .await;

    // Clean up subscriptions on disconnect
    conn.close(&bus);
    result
}

async fn forward(
    ws_sender: &mut WsSender,
    conn: &mut Connection,
    channel: Channel,
    bus: &NotificationBus,
    notification: Result<Notification, RecvError>,
) -> anyhow::Result<()> {
    match notification {
        Ok(text) => ws_sender.send(Message::Text(text.as_str().to_owned())).await?,
        Err(RecvError::Lagged(n)) => {
            tracing::warn!("Subscriber lagged, dropped {} {:?} messages", n, channel);
        }
        Err(RecvError::Closed) => conn.unsubscribe(bus, channel),
    }
    Ok(())
}

/// Apply one client frame; returns the direct reply, if any
fn handle_client_message(
    context: &RpcContext,
    bus: &NotificationBus,
    conn: &mut Connection,
    text: &str,
) -> Option<ServerMessage> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            return Some(ServerMessage::Error {
                message: format!("unrecognized message: {}", e),
            })
        }
    };

    match message {
        ClientMessage::Subscribe { channel } => {
            conn.subscribe(bus, channel);
            Some(ServerMessage::Subscribed { channel })
        }
        ClientMessage::Unsubscribe { channel } => {
            conn.unsubscribe(bus, channel);
            Some(ServerMessage::Unsubscribed { channel })
        }
        ClientMessage::Ping => Some(ServerMessage::Pong),
        ClientMessage::Validate(vote) => match context.registry.process_vote(&vote) {
            Ok(report) => {
                bus.publish_validation(report.clone());
                Some(ServerMessage::Validation { data: report })
            }
            Err(e) => Some(ServerMessage::Error {
                message: e.to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_context;
    use tokio_tungstenite::connect_async;

    async fn recv_json<S>(ws: &mut S) -> serde_json::Value
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_subscribe_ping_and_vote() {
        let (_dir, context) = test_context();
        let bus = Arc::new(NotificationBus::new(16));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(WebSocketServer::new(context.clone(), bus.clone()).serve(listener));

        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        ws.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await.unwrap();
        assert_eq!(recv_json(&mut ws).await["type"], "pong");

        ws.send(Message::Text(r#"{"type":"subscribe","channel":"newBlock"}"#.to_string()))
            .await
            .unwrap();
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["type"], "subscribed");
        assert_eq!(reply["channel"], "blocks");

        let genesis = context.store.get_block(0).unwrap();
        assert_eq!(bus.publish_block(&genesis), 1);
        let pushed = recv_json(&mut ws).await;
        assert_eq!(pushed["type"], "newBlock");
        assert_eq!(pushed["block"]["hash"], genesis.hash.to_string());

        let validator = context.registry.list()[0].address;
        let vote = ClientMessage::Validate(l2_consensus::ValidationVote {
            validator,
            height: 0,
            hash: genesis.hash,
            valid: true,
        });
        ws.send(Message::Text(vote.to_json())).await.unwrap();
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["type"], "validation");
        assert_eq!(reply["data"]["confirmed"], true);

        ws.send(Message::Text("not json".to_string())).await.unwrap();
        assert_eq!(recv_json(&mut ws).await["type"], "error");
    }
}
