//! # Ansible Operator
//!
//! Reconciles custom resources by running Ansible roles and playbooks.
//!
//! Configuration comes from environment variables (see
//! `ControllerConfig::from_env`) and the watch configuration file named by
//! `WATCHES_FILE`.

use ansible_operator::runtime::{initialize, run_watch_loop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let init = initialize().await?;
    run_watch_loop(init).await
}
