//! `mc init` -- starter config and database creation.

use std::path::Path;

use anyhow::Result;

use crate::setup;

const STARTER_CONFIG: &str = r#"[target]
name = "my-project"
path = "."
branch = "main"
objective = "Make the test suite pass"

[target.verification]
command = "cargo test"
timeout = 300

[scheduler.parallel]
num_workers = 3

[rounds]
max_rounds = 20

[green_branch]
auto_push = false
"#;

pub async fn run(config_path: &Path, db_path: &Path) -> Result<bool> {
    if config_path.exists() {
        println!("config already exists at {}", config_path.display());
    } else {
        std::fs::write(config_path, STARTER_CONFIG)?;
        println!("wrote starter config to {}", config_path.display());
    }

    setup::open_store(db_path).await?;
    println!("database ready at {}", db_path.display());

    Ok(true)
}
