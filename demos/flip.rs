extern crate tello_control;

use tello_control::{Tello, Result};

#[tokio::main]
async fn main() {
    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    fly().await.unwrap();
}

async fn fly() -> Result<()> {
    let drone = Tello::new()
        .connect().await?;

    drone.take_off().await?;

    drone.flip_left().await?;
    drone.flip_right().await?;

    drone.flip_forward().await?;
    drone.flip_back().await?;

    drone.stop_and_hover().await?;
    drone.land().await?;

    drone.cleanup().await;
    Ok(())
}
