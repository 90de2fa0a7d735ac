//! `bastionctl policy list` / `bastionctl policy reload`.

use anyhow::Result;

use crate::admin::AdminClient;

pub async fn run_list(client: &AdminClient, json: bool) -> Result<()> {
    let policies = client.policies().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&policies)?);
        return Ok(());
    }

    println!("{:<20} {:<16} {}", "USER", "ROLE", "TARGETS");
    for (user, entry) in &policies {
        println!("{:<20} {:<16} {}", user, entry.role, entry.targets.join(", "));
    }
    if policies.is_empty() {
        println!("(no policies)");
    }
    Ok(())
}

pub async fn run_reload(client: &AdminClient, path: &str) -> Result<()> {
    let reply = client.reload(path).await?;
    println!("{}", reply.trim());
    Ok(())
}
