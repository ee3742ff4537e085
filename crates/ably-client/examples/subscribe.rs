//! Subscribe to a channel and print incoming messages.
//!
//! Usage: ABLY_KEY=appId.keyId:secret cargo run --example subscribe -- <channel>

use ably_client::{ChannelEvent, ClientOptions, Message, Realtime};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let key = std::env::var("ABLY_KEY").expect("set ABLY_KEY to an API key");
    let channel_name = std::env::args().nth(1).unwrap_or_else(|| "demo".to_string());

    let client = Realtime::new(ClientOptions::with_key(key))?;
    client.connect().await?;
    println!("connected: {:?}", client.connection().id());

    let channel = client.channel(&channel_name);
    let _guard = channel.on(ChannelEvent::Attached, |change| {
        println!("attached (resumed={})", change.resumed);
    });
    channel.attach().await?;

    channel
        .publish(Message::new("greeting", "hello from ably-client"))
        .await?;

    let mut sub = channel.subscribe();
    println!("listening on {channel_name:?}; ctrl-c to exit");
    while let Some(msg) = sub.next().await {
        println!("{}: {:?}", msg.name.as_deref().unwrap_or("(unnamed)"), msg.data);
    }
    Ok(())
}
