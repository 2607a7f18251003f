//! Role-switching facade handed to a presentation layer.
//!
//! A [`Node`] owns one driver task. The driver runs either a Normal or a
//! Master controller, forwards user commands to whichever is active and
//! swaps them when the user hosts a game or a Deputy has to take over.

use crate::network::{NormalCommand, NormalController, NormalExit};
use log::{debug, info, warn};
use server::network::{Handover, MasterCommand, MasterController};
use shared::{
    ui_channels, Direction, GameConfig, NetOptions, NodeRole, Result, SnakeError, UiFeed, UiSink,
};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeCommand {
    Host { name: String, config: GameConfig },
    Normal(NormalCommand),
    Steer(Direction),
    RespawnSelf,
    Stop,
}

pub struct Node {
    commands: mpsc::UnboundedSender<NodeCommand>,
    driver: JoinHandle<Result<()>>,
}

impl Node {
    /// Spawns the driver in discovery mode. Must be called inside a tokio
    /// runtime.
    pub fn start(options: NetOptions) -> (Node, UiFeed) {
        let (sink, feed) = ui_channels();
        let (commands, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(options, sink, rx));
        (Node { commands, driver }, feed)
    }

    fn send(&self, command: NodeCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SnakeError::ControllerStopped)
    }

    /// Becomes the Master of a fresh game with default settings.
    pub fn host(&self, name: &str) -> Result<()> {
        self.host_with(name, GameConfig::default())
    }

    pub fn host_with(&self, name: &str, config: GameConfig) -> Result<()> {
        self.send(NodeCommand::Host {
            name: name.to_string(),
            config,
        })
    }

    /// Joins the game at `index` of the last published game list.
    pub fn join(&self, index: usize, name: &str) -> Result<()> {
        self.send(NodeCommand::Normal(NormalCommand::Join {
            index,
            name: name.to_string(),
            role: NodeRole::Normal,
        }))
    }

    pub fn join_addr(&self, addr: SocketAddr, config: Option<GameConfig>, name: &str) -> Result<()> {
        self.join_addr_as(addr, config, name, NodeRole::Normal)
    }

    pub fn join_addr_as(
        &self,
        addr: SocketAddr,
        config: Option<GameConfig>,
        name: &str,
        role: NodeRole,
    ) -> Result<()> {
        self.send(NodeCommand::Normal(NormalCommand::JoinAddr {
            addr,
            config,
            name: name.to_string(),
            role,
        }))
    }

    pub fn steer(&self, direction: Direction) -> Result<()> {
        self.send(NodeCommand::Steer(direction))
    }

    pub fn leave_and_respawn(&self) -> Result<()> {
        self.send(NodeCommand::Normal(NormalCommand::LeaveAndRespawn))
    }

    pub fn respawn_self(&self) -> Result<()> {
        self.send(NodeCommand::RespawnSelf)
    }

    pub fn discover(&self) -> Result<()> {
        self.send(NodeCommand::Normal(NormalCommand::Discover))
    }

    /// Stops whichever controller is active and waits for the driver.
    pub async fn stop(self) -> Result<()> {
        self.commands.send(NodeCommand::Stop).ok();
        match self.driver.await {
            Ok(result) => result,
            Err(e) => {
                warn!("Node driver failed: {}", e);
                Err(SnakeError::ControllerStopped)
            }
        }
    }
}

struct ActiveNormal {
    commands: mpsc::UnboundedSender<NormalCommand>,
    handle: JoinHandle<Result<NormalExit>>,
}

struct ActiveMaster {
    commands: mpsc::UnboundedSender<MasterCommand>,
    handle: JoinHandle<Result<()>>,
}

enum Mode {
    Normal(ActiveNormal),
    Master(ActiveMaster),
}

async fn drive(
    options: NetOptions,
    sink: UiSink,
    mut commands: mpsc::UnboundedReceiver<NodeCommand>,
) -> Result<()> {
    let mut mode = Mode::Normal(spawn_normal(options, sink.clone()).await?);

    loop {
        let next = match mode {
            Mode::Normal(active) => run_normal(active, &mut commands, options, &sink).await?,
            Mode::Master(active) => run_master(active, &mut commands, options, &sink).await?,
        };
        match next {
            Some(next) => mode = next,
            None => return Ok(()),
        }
    }
}

async fn spawn_normal(options: NetOptions, sink: UiSink) -> Result<ActiveNormal> {
    let controller = NormalController::start(options, sink).await?;
    let (commands, rx) = mpsc::unbounded_channel();
    Ok(ActiveNormal {
        commands,
        handle: tokio::spawn(controller.run(rx)),
    })
}

fn spawn_master(controller: MasterController) -> ActiveMaster {
    let (commands, rx) = mpsc::unbounded_channel();
    ActiveMaster {
        commands,
        handle: tokio::spawn(controller.run(rx)),
    }
}

async fn stop_normal(active: ActiveNormal) {
    active.commands.send(NormalCommand::Stop).ok();
    match active.handle.await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Normal controller failed: {}", e),
        Err(e) => warn!("Normal controller panicked: {}", e),
    }
}

/// Serves commands while a Normal controller is active. Returns the next
/// mode, or `None` once the node is stopped.
async fn run_normal(
    mut active: ActiveNormal,
    commands: &mut mpsc::UnboundedReceiver<NodeCommand>,
    options: NetOptions,
    sink: &UiSink,
) -> Result<Option<Mode>> {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(NodeCommand::Stop) | None => {
                    stop_normal(active).await;
                    return Ok(None);
                }
                Some(NodeCommand::Host { name, config }) => {
                    stop_normal(active).await;
                    let master = MasterController::host(config, &name, options, sink.clone()).await?;
                    return Ok(Some(Mode::Master(spawn_master(master))));
                }
                Some(NodeCommand::Normal(command)) => forward(&active.commands, command),
                Some(NodeCommand::Steer(direction)) => {
                    forward(&active.commands, NormalCommand::Steer(direction))
                }
                Some(NodeCommand::RespawnSelf) => forward(&active.commands, NormalCommand::RespawnSelf),
            },

            exit = &mut active.handle => {
                let exit = exit.map_err(|_| SnakeError::ControllerStopped)??;
                return match exit {
                    NormalExit::Stopped => Ok(None),
                    NormalExit::Promote(handover) => Ok(Some(promote(handover, options, sink).await?)),
                };
            },
        }
    }
}

async fn promote(handover: Handover, options: NetOptions, sink: &UiSink) -> Result<Mode> {
    info!(
        "Promoting player {} from state {}",
        handover.self_id, handover.snapshot.order
    );
    let master = MasterController::bootstrap(handover, options, sink.clone()).await?;
    Ok(Mode::Master(spawn_master(master)))
}

/// Serves commands while this node is Master. A Master that stops on its
/// own hands the node back to discovery.
async fn run_master(
    mut active: ActiveMaster,
    commands: &mut mpsc::UnboundedReceiver<NodeCommand>,
    options: NetOptions,
    sink: &UiSink,
) -> Result<Option<Mode>> {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(NodeCommand::Stop) | None => {
                    active.commands.send(MasterCommand::Stop).ok();
                    if let Ok(Err(e)) = active.handle.await {
                        warn!("Master controller failed: {}", e);
                    }
                    return Ok(None);
                }
                Some(NodeCommand::Steer(direction)) => {
                    active.commands.send(MasterCommand::Steer(direction)).ok();
                }
                Some(NodeCommand::RespawnSelf) => {
                    active.commands.send(MasterCommand::RespawnSelf).ok();
                }
                Some(other) => debug!("Ignoring {:?} while hosting", other),
            },

            exit = &mut active.handle => {
                match exit {
                    Ok(Ok(())) => info!("Master stopped, back to discovery"),
                    Ok(Err(e)) => warn!("Master failed, back to discovery: {}", e),
                    Err(e) => warn!("Master panicked, back to discovery: {}", e),
                }
                return Ok(Some(Mode::Normal(spawn_normal(options, sink.clone()).await?)));
            },
        }
    }
}

fn forward(commands: &mpsc::UnboundedSender<NormalCommand>, command: NormalCommand) {
    if commands.send(command).is_err() {
        debug!("Normal controller is gone");
    }
}
