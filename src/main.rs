#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use rtprelay::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.control.is_empty() {
        log::warn!("no control endpoints configured, nothing for this process to do");
        return Ok(());
    }

    rtprelay::startup(config).await
}
