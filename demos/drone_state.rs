extern crate tello_control;

use tello_control::{Tello, TelloConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // TELLO_CONFIG=tello.toml to override the defaults
    let config = match std::env::var("TELLO_CONFIG") {
        Ok(path) => TelloConfig::load(path)?,
        Err(_) => TelloConfig::default(),
    };

    let drone = Tello::with_config(config)
        .connect().await?;

    let mut state_rx = drone.watch_telemetry();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow_and_update().clone();
            println!("STATE {state:#?}");
        }
    });

    drone.take_off().await?;
    drone.turn_clockwise(360).await?;
    drone.land().await?;

    let stats = drone.telemetry_stats();
    println!("{} status reports, {} malformed", stats.received(), stats.malformed());

    drone.cleanup().await;
    Ok(())
}
