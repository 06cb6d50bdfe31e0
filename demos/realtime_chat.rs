use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use minichat_sdk::api::ApiClient;
use minichat_sdk::config::ClientConfig;
use minichat_sdk::realtime::RealtimeClient;
use minichat_sdk::session::SessionStore;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ClientConfig::from_env();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let sessions = SessionStore::in_memory();
        let auth = ApiClient::new(config.auth_base_url.clone(), sessions.clone())?;

        let login: Value = auth
            .post_data(
                "/auth/login",
                &json!({"account": "REPLACE_WITH_ACCOUNT", "password": "REPLACE_WITH_PASSWORD"}),
            )
            .await?;
        let token = login
            .get("token")
            .and_then(Value::as_str)
            .ok_or("login response carried no token")?;
        let session_id = sessions.sign_in(token);
        println!("signed in session_id={session_id}");

        let client = RealtimeClient::new(&config.realtime_endpoint, Arc::new(sessions.clone()))?;
        client.on_open(|| println!("connected"));
        client.on_close(|reason| println!("disconnected reason={reason}"));
        client.on_error(|err| eprintln!("realtime error: {err}"));
        client.on_message(|data| println!("message {data}"));

        client.connect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        client.disconnect();

        Ok::<(), Box<dyn Error>>(())
    })
}
