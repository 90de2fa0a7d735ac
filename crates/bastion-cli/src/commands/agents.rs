//! `bastionctl agents`: list agents registered with the bastion.

use anyhow::Result;

use crate::admin::AdminClient;

pub async fn run(client: &AdminClient) -> Result<()> {
    let agents = client.agents().await?;
    println!("{:<24} {:<26} {}", "AGENT", "CONNECTED", "SESSIONS");
    for agent in &agents {
        println!(
            "{:<24} {:<26} {}",
            agent.agent_id, agent.connected_at, agent.sessions
        );
    }
    if agents.is_empty() {
        println!("(no agents connected)");
    }
    Ok(())
}
