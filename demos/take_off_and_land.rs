extern crate tello_control;

use tello_control::{Tello, Result};

#[tokio::main]
async fn main() {
    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    take_off_and_land().await.unwrap();
}

async fn take_off_and_land() -> Result<()> {
    let drone = Tello::new()
        .connect().await?;

    drone.take_off().await?;
    drone.land().await?;

    drone.cleanup().await;
    Ok(())
}
