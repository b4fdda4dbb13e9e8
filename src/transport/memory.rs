//! In-memory transport for simulators and tests.
//!
//! Behaves like UDP towards a drone that may be gone: sends never fail, and
//! a dropped far end is indistinguishable from silence.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::transport::traits::{CommandLink, DatagramSource};

/// Creates a connected command link and the drone-side end of it.
pub fn command_link() -> (MemoryCommandLink, SimulatedDrone) {
    let (to_drone, commands) = mpsc::unbounded_channel();
    let (replies, from_drone) = mpsc::unbounded_channel();
    (
        MemoryCommandLink { to_drone, from_drone },
        SimulatedDrone { commands, replies },
    )
}

/// Creates a receive-only datagram channel and its sending end.
pub fn datagram_link() -> (MemoryDatagramSource, DatagramInjector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryDatagramSource { rx }, DatagramInjector { tx })
}

#[derive(Debug)]
pub struct MemoryCommandLink {
    to_drone: mpsc::UnboundedSender<Vec<u8>>,
    from_drone: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl CommandLink for MemoryCommandLink {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let _ = self.to_drone.send(bytes.to_vec());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        match self.from_drone.recv().await {
            Some(bytes) => Ok(bytes),
            None => std::future::pending().await,
        }
    }

    fn discard_stale(&mut self) -> usize {
        let mut n = 0;
        while self.from_drone.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// The drone's side of a [`MemoryCommandLink`].
#[derive(Debug)]
pub struct SimulatedDrone {
    commands: mpsc::UnboundedReceiver<Vec<u8>>,
    replies: mpsc::UnboundedSender<Vec<u8>>,
}

impl SimulatedDrone {
    /// Waits for the next command sent by the controller.
    pub async fn next_command(&mut self) -> Option<String> {
        self.commands.recv().await.map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    /// The next command if one has already been sent.
    pub fn try_next_command(&mut self) -> Option<String> {
        self.commands.try_recv().ok().map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    pub fn reply(&self, text: &str) {
        self.reply_bytes(text.as_bytes());
    }

    pub fn reply_bytes(&self, bytes: &[u8]) {
        let _ = self.replies.send(bytes.to_vec());
    }
}

#[derive(Debug)]
pub struct MemoryDatagramSource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl DatagramSource for MemoryDatagramSource {
    async fn recv(&mut self) -> Result<Vec<u8>> {
        match self.rx.recv().await {
            Some(bytes) => Ok(bytes),
            None => std::future::pending().await,
        }
    }
}

/// Feeds datagrams into a [`MemoryDatagramSource`].
#[derive(Debug, Clone)]
pub struct DatagramInjector {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl DatagramInjector {
    pub fn send(&self, bytes: &[u8]) {
        let _ = self.tx.send(bytes.to_vec());
    }

    pub fn send_text(&self, text: &str) {
        self.send(text.as_bytes());
    }
}
