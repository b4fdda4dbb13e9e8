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

    drone.emergency_stop().await?; // warning! this will make the drone drop like a brick

    drone.cleanup().await;
    Ok(())
}
