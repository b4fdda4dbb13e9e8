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

    // we want video...
    let mut frames = drone.subscribe_frames()?;

    tokio::spawn(async move {
        while let Some(frame) = frames.next().await {
            println!("video frame: {} bytes", frame.data.len());
        }
        println!("VIDEO END");
    });

    drone.start_video().await?;

    drone.take_off().await?;
    drone.land().await?;

    drone.stop_video().await?;
    drone.cleanup().await;
    Ok(())
}
