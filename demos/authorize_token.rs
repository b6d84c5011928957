use std::collections::BTreeMap;
use std::error::Error;

use bagman_sdk::{AuthorizerConfig, Client, ClientConfig, Deferred, GlobalEvent};
use reqwest::Method;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let session_cookie = "REPLACE_WITH_SESSION_COOKIE".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let authorizer = AuthorizerConfig::new("auth.example.com", "/realtime/token")
            .with_port(443)
            .with_method(Method::POST)
            .with_extra_headers(Deferred::from_fn(move || {
                BTreeMap::from([("cookie".to_string(), session_cookie.clone())])
            }))
            .with_body(Deferred::from_async_fn(|| async {
                r#"{"scope":"lobby"}"#.to_string()
            }));

        let client = Client::new(ClientConfig::new().with_authorizer(authorizer))?;
        client.listen(GlobalEvent::Connect, |_| println!("connected"));
        client.listen(GlobalEvent::ConnectError, |err| println!("connect_error={err}"));

        client.authorize().await?;
        println!("authorized={}", client.is_authorized());

        let channel = client.subscribe("lobby").await?;
        println!("subscribed channel={}", channel.name());
        client.close();
        Ok::<(), Box<dyn Error>>(())
    })
}
