/// Fixed-rate driver for a [`SceneGraph`].
///
/// Ticks the graph on a tokio interval, publishes a status snapshot after
/// every tick, and stops on shutdown or, when configured, once the final
/// scene is reached. Prompts should go through a
/// [`BackgroundExecutor`](super::capability::BackgroundExecutor) so a slow
/// model never holds up the loop.
use log::{error, info};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use super::scene::SceneGraph;
use super::status::SharedStatus;

/// Runs until `shutdown` turns true (or its sender is dropped), or until
/// the final scene is reached with `exit_on_complete` set. Hands the graph
/// back for inspection.
pub async fn run(
    mut graph: SceneGraph,
    status: SharedStatus,
    mut shutdown: watch::Receiver<bool>,
) -> SceneGraph {
    let mut interval = time::interval(graph.config().frame_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        "Driver | Running '{}' at {} fps",
        graph.script().name,
        graph.config().frame_rate
    );
    status.publish(graph.status());

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Driver | Shutdown requested");
                    break;
                }
                continue;
            }
        }

        if let Err(err) = graph.tick() {
            error!("Driver | Tick failed: {err}");
        }
        status.publish(graph.status());

        if graph.is_finished() && graph.config().exit_on_complete {
            info!("Driver | Exiting on complete");
            break;
        }
    }
    graph
}
