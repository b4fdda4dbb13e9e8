//////////////////////////////////////////////////////////////////////////////
//
// Remote control without a controller: fly a slow circle using rc values,
// then hover and land.
//
// The drone never replies to rc, so each call returns as soon as the values
// are sent. They need resending regularly or the drone stops.
//
//////////////////////////////////////////////////////////////////////////////

extern crate tello_control;

use std::time::Duration;

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

    // forwards while turning right
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    for _ in 0..80 {
        ticker.tick().await;
        drone.remote_control(0, 30, 0, 25).await?;
    }

    drone.remote_control(0, 0, 0, 0).await?;
    drone.stop_and_hover().await?;
    drone.land().await?;

    drone.cleanup().await;
    Ok(())
}
