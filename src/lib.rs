pub mod config;
pub mod membership;

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::config::ENV;
use crate::membership::{Gossiper, Member, MemberAddress};

#[derive(Debug)]
pub struct StartUp;

impl StartUp {
    pub async fn run(self) -> Result<()> {
        let bind_addr = ENV.bind_addr()?;
        let (gossiper, tasks, port) =
            Gossiper::start(bind_addr, ENV.service(), &ENV.gossiper_options()).await?;
        info!(port, "meshguard gossiping");

        gossiper
            .add_listener("log", Box::new(log_member_changes))
            .await;

        for seed in ENV.seeds() {
            gossiper.connect_to(seed).await;
        }

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        tasks
            .stop(&gossiper, Duration::from_millis(ENV.shutdown_grace_ms))
            .await;
        Ok(())
    }
}

fn log_member_changes(
    from: Option<MemberAddress>,
    address: MemberAddress,
    new: Option<&Member>,
    _old: Option<&Member>,
) {
    let from = from.map(|a| a.to_string()).unwrap_or_else(|| "local".into());
    match new {
        Some(member) => info!(%address, state = %member, %from, "member changed"),
        None => info!(%address, %from, "member removed"),
    }
}
