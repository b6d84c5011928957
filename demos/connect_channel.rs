use std::error::Error;
use std::time::Duration;

use bagman_sdk::{Client, ClientConfig, GlobalEvent, Presence};
use secrecy::SecretString;
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let api_key = "REPLACE_WITH_API_KEY".to_string();
    let endpoint = "http://localhost:8080".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = Client::new(
            ClientConfig::new()
                .with_url(endpoint)
                .with_api_key(SecretString::new(api_key)),
        )?;
        client.listen(GlobalEvent::Disconnect, |reason| {
            println!("disconnected reason={reason}");
        });

        let channel = client.subscribe("lobby").await?;
        channel.listen("message", |data| println!("lobby message={data}"));
        channel.publish("message", json!({"text": "hello"})).await?;

        let presences: Vec<Presence> = channel.presences().await?;
        for presence in &presences {
            println!("present id={} user={}", presence.id, presence.user);
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        channel.unsubscribe().await?;
        client.close();
        Ok::<(), Box<dyn Error>>(())
    })
}
