use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::errors::{Result, TelloError};
use crate::transport::traits::{CommandLink, DatagramSource};

const MAX_REPLY_SIZE: usize = 1024;
const CONNECT_ATTEMPTS: u32 = 10;

/// The command socket, bound locally and connected to the drone.
#[derive(Debug)]
pub struct UdpCommandLink {
    sock: UdpSocket,
    buf: Vec<u8>,
}

impl UdpCommandLink {
    pub async fn connect(local_address: &str, drone_address: &str) -> Result<Self> {
        debug!("[Tello] binding local {local_address}...");
        let sock = UdpSocket::bind(local_address).await?;

        debug!("[Tello] connecting to drone at {drone_address}...");
        let mut i = 0;
        loop {
            i += 1;
            match sock.connect(drone_address).await {
                Ok(_) => break,
                Err(err) if i < CONNECT_ATTEMPTS => {
                    warn!("[Tello] connection attempt #{i} failed ({err}), retrying...");
                    sleep(Duration::from_millis(100)).await;
                }
                Err(err) => return Err(TelloError::Io(err)),
            }
        }

        Ok(Self { sock, buf: vec![0; MAX_REPLY_SIZE] })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.sock.local_addr()?)
    }
}

#[async_trait]
impl CommandLink for UdpCommandLink {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.sock.send(bytes).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        let n = self.sock.recv(&mut self.buf).await?;
        Ok(self.buf[..n].to_vec())
    }

    fn discard_stale(&mut self) -> usize {
        let mut n = 0;
        while self.sock.try_recv(&mut self.buf).is_ok() {
            n += 1;
        }
        n
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}

/// A bound, receive-only socket for the status or video stream.
#[derive(Debug)]
pub struct UdpDatagramSource {
    sock: UdpSocket,
    buf: Vec<u8>,
}

impl UdpDatagramSource {
    pub async fn bind(local_address: &str, max_datagram: usize) -> Result<Self> {
        let sock = UdpSocket::bind(local_address).await?;
        Ok(Self { sock, buf: vec![0; max_datagram] })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.sock.local_addr()?)
    }
}

#[async_trait]
impl DatagramSource for UdpDatagramSource {
    async fn recv(&mut self) -> Result<Vec<u8>> {
        let n = self.sock.recv(&mut self.buf).await?;
        Ok(self.buf[..n].to_vec())
    }
}
