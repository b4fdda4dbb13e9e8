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
    drone.move_up(50).await?;
    drone.move_down(50).await?;
    drone.move_left(50).await?;
    drone.move_right(50).await?;
    drone.move_forward(50).await?;
    drone.move_back(50).await?;
    println!("height {} cm", drone.query_height().await?);
    drone.land().await?;

    drone.cleanup().await;
    Ok(())
}
