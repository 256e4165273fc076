//! Runs the client against an in-process loopback "server" that accepts every
//! attach, acknowledges every publish and echoes messages back.
//!
//! Usage: `RUST_LOG=debug cargo run --example loopback`

use std::time::{SystemTime, UNIX_EPOCH};

use ably_realtime::{
    Action, ClientOptions, ConnectionDetails, Event, ProtocolMessage, Realtime, Transport,
    TransportSink,
};

const CONNECTION_ID: &str = "loopback-conn";

#[derive(Default)]
struct Loopback {
    sink: Option<TransportSink>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl Loopback {
    fn reply(&self, msg: ProtocolMessage) {
        if let Some(sink) = &self.sink {
            sink.frame_received(msg);
        }
    }

    fn echo(&self, mut msg: ProtocolMessage) {
        let serial = msg.msg_serial.unwrap_or_default();
        msg.id = Some(format!("{CONNECTION_ID}:{serial}"));
        msg.connection_id = Some(CONNECTION_ID.to_string());
        msg.timestamp = Some(now_ms());
        msg.msg_serial = None;
        self.reply(msg);

        let mut ack = ProtocolMessage::new(Action::Ack);
        ack.msg_serial = Some(serial);
        ack.count = Some(1);
        self.reply(ack);
    }
}

impl Transport for Loopback {
    fn open(&mut self, _resume_key: Option<&str>, sink: TransportSink) {
        sink.opened();
        sink.frame_received(ProtocolMessage {
            action: Action::Connected,
            connection_id: Some(CONNECTION_ID.to_string()),
            connection_details: Some(ConnectionDetails {
                connection_key: Some(format!("{CONNECTION_ID}!key")),
                connection_state_ttl: Some(120_000),
                max_idle_interval: Some(15_000),
                ..Default::default()
            }),
            ..Default::default()
        });
        self.sink = Some(sink);
    }

    fn send(&mut self, message: ProtocolMessage) -> Result<(), ably_realtime::Error> {
        match message.action {
            Action::Attach => self.reply(ProtocolMessage {
                action: Action::Attached,
                channel: message.channel,
                channel_serial: Some("loopback:0".to_string()),
                ..Default::default()
            }),
            Action::Detach => self.reply(ProtocolMessage {
                action: Action::Detached,
                channel: message.channel,
                ..Default::default()
            }),
            Action::Message | Action::Presence => self.echo(message),
            Action::Close => self.reply(ProtocolMessage::new(Action::Closed)),
            other => tracing::debug!(action = ?other, "Loopback ignoring frame"),
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.closed(None);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ably_realtime::Error> {
    tracing_subscriber::fmt::init();

    let options = ClientOptions {
        client_id: Some("demo-user".to_string()),
        ..Default::default()
    };
    let client = Realtime::new(options, Loopback::default());
    let mut connection_events = client.subscribe();
    client.connect();

    let channel = client.channel("demo");
    let mut channel_events = channel.subscribe();
    channel.attach().await?;
    channel
        .presence()
        .enter(Some(serde_json::json!({"status": "online"})))
        .await?;
    channel
        .publish("greeting", serde_json::json!("hello, loopback"))
        .await?;

    while let Some(event) = channel_events.try_next() {
        match event {
            Event::Message { message, .. } => {
                println!("message {:?}: {:?}", message.name, message.data);
            }
            Event::Presence { message, .. } => {
                println!("presence {} {:?}", message.action, message.client_id);
            }
            Event::ChannelStateChange { change, .. } => {
                println!("channel {} -> {}", change.previous, change.current);
            }
            Event::ConnectionStateChange(_) => {}
        }
    }

    for member in channel.presence().get().await? {
        println!("member {:?} data={:?}", member.client_id, member.data);
    }

    client.close();
    while let Some(event) = connection_events.next().await {
        if let Event::ConnectionStateChange(change) = event {
            println!("connection {} -> {}", change.previous, change.current);
            if change.current == ably_realtime::ConnectionState::Closed {
                break;
            }
        }
    }
    Ok(())
}
