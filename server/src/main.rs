use clap::Parser;
use log::info;
use server::network::{MasterCommand, MasterController};
use shared::{ui_channels, GameConfig, NetOptions};
use tokio::sync::mpsc;

/// Hosts a game without any local presentation.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the hosting player
    #[arg(short, long, default_value = "master")]
    name: String,

    /// Unicast port to listen on (0 picks a free one)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Board width in cells
    #[arg(short = 'W', long, default_value_t = shared::config::DEFAULT_WIDTH)]
    width: i32,

    /// Board height in cells (no short flag to avoid conflict with --help)
    #[arg(long, default_value_t = shared::config::DEFAULT_HEIGHT)]
    height: i32,

    /// Food kept on the board regardless of snake count
    #[arg(short, long, default_value_t = shared::config::DEFAULT_FOOD_STATIC)]
    food_static: u32,

    /// Milliseconds between ticks
    #[arg(short = 'd', long, default_value_t = shared::config::DEFAULT_STATE_DELAY_MS)]
    state_delay_ms: u64,

    /// Do not announce the game on the multicast group
    #[arg(long)]
    no_multicast: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = GameConfig {
        width: args.width.max(1),
        height: args.height.max(1),
        food_static: args.food_static,
        state_delay_ms: args.state_delay_ms.max(1),
    };
    let options = NetOptions {
        multicast: !args.no_multicast,
        port: (args.port != 0).then_some(args.port),
    };

    let (sink, mut feed) = ui_channels();
    let master = MasterController::host(config, &args.name, options, sink).await?;
    info!("Hosting {}x{} game on {}", config.width, config.height, master.local_address()?);

    let (commands, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(master.run(rx));

    // Nobody renders here; drain the state feed so it does not grow.
    tokio::spawn(async move { while feed.states.recv().await.is_some() {} });

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    commands.send(MasterCommand::Stop).ok();
    handle.await??;

    Ok(())
}
