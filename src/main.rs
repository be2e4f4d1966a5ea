use argus::config::Config;
use argus::lifecycle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lifecycle::init_logging();

    let config = Config::from_env();
    let collaborators = lifecycle::Collaborators::from_config(&config);
    let ctx = lifecycle::bootstrap(&config, collaborators).await?;

    let _workers = lifecycle::start_background(&ctx);
    log::info!("argusd running; data dir {}", config.data_dir.display());

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    Ok(())
}
