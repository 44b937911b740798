#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = trickle::config::find_config_file()?;
    let trickle = trickle::config::load(&config_path)?;

    trickle.run(Some(config_path)).await
}
