use anyhow::{Context, Result};
use smtp_hooks::{HookSet, Server};
use std::net::SocketAddr;

mod config;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = config::load()?;
    let store = store::Store::new(config.smtp.domain, config.auth.users);

    let mut hooks = HookSet::new(store.clone()).with_delivery(store.clone());

    if store.has_users() {
        hooks = hooks.with_auth(store.clone());
    }

    if let Some(size) = config.smtp.max_message_size {
        hooks = hooks.with_max_message_size(size);
    }

    let addr = SocketAddr::new(config.smtp.address, config.smtp.port);
    let server = Server::bind(addr, hooks)
        .await
        .context("could not start SMTP server")?;

    server.run_until(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("could not listen for interrupt: {err}");
            std::future::pending::<()>().await;
        }
    }).await?;

    log::info!("{} messages received", store.messages().await.len());

    Ok(())
}
