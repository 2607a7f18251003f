use clap::Parser;
use client::node::Node;
use log::info;
use shared::{Direction, GameConfig, GameListing, GameSnapshot, NetOptions};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Plays from the terminal: one command per line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Player name
    #[arg(short, long, default_value = "player")]
    name: String,

    /// Unicast port to bind (0 picks a free one)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Master address to join directly instead of discovering
    #[arg(short, long)]
    connect: Option<SocketAddr>,

    /// Host a new game instead of joining one
    #[arg(long)]
    host: bool,

    /// Board width when hosting
    #[arg(short = 'W', long, default_value_t = shared::config::DEFAULT_WIDTH)]
    width: i32,

    /// Board height when hosting
    #[arg(long, default_value_t = shared::config::DEFAULT_HEIGHT)]
    height: i32,

    /// Food kept on the board when hosting
    #[arg(short, long, default_value_t = shared::config::DEFAULT_FOOD_STATIC)]
    food_static: u32,

    /// Milliseconds between ticks when hosting
    #[arg(short = 'd', long, default_value_t = shared::config::DEFAULT_STATE_DELAY_MS)]
    state_delay_ms: u64,

    /// Disable multicast discovery
    #[arg(long)]
    no_multicast: bool,
}

fn print_games(games: &[GameListing]) {
    println!("{} game(s):", games.len());
    for (index, game) in games.iter().enumerate() {
        println!(
            "  [{}] {} at {} ({}x{}, {} players{})",
            index,
            game.name,
            game.address,
            game.config.width,
            game.config.height,
            game.player_count,
            if game.can_join { "" } else { ", full" }
        );
    }
}

fn print_state(state: &GameSnapshot) {
    let scores: Vec<String> = state
        .players
        .iter()
        .map(|p| format!("{}:{}={}", p.id, p.name, p.score))
        .collect();
    println!(
        "#{} snakes={} food={} [{}]",
        state.order,
        state.snakes.len(),
        state.foods.len(),
        scores.join(" ")
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let options = NetOptions {
        multicast: !args.no_multicast,
        port: (args.port != 0).then_some(args.port),
    };

    let (node, mut feed) = Node::start(options);

    if args.host {
        let config = GameConfig {
            width: args.width.max(1),
            height: args.height.max(1),
            food_static: args.food_static,
            state_delay_ms: args.state_delay_ms.max(1),
        };
        node.host_with(&args.name, config)?;
    } else if let Some(addr) = args.connect {
        node.join_addr(addr, None, &args.name)?;
    } else {
        node.discover()?;
    }

    info!("Controls: w/a/s/d steer, r respawn, l leave and rejoin, j<N> join game N, g discover, q quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                match line {
                    "w" => node.steer(Direction::Up)?,
                    "a" => node.steer(Direction::Left)?,
                    "s" => node.steer(Direction::Down)?,
                    "d" => node.steer(Direction::Right)?,
                    "r" => node.respawn_self()?,
                    "l" => node.leave_and_respawn()?,
                    "g" => node.discover()?,
                    "q" => break,
                    _ => match line.strip_prefix('j').and_then(|n| n.trim().parse().ok()) {
                        Some(index) => node.join(index, &args.name)?,
                        None => println!("unknown command {:?}", line),
                    },
                }
            },
            Some(games) = feed.games.recv() => print_games(&games),
            Some(state) = feed.states.recv() => print_state(&state),
        }
    }

    node.stop().await?;
    Ok(())
}
