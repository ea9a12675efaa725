//! In-process duplex channel carrying encoded [`OpMessage`] frames.
//!
//! Any ordered duplex transport can stand in for it; frames are plain bytes.

use tokio::sync::mpsc;

use crate::error::OpError;
use crate::op::message::OpMessage;

/// One endpoint of a [`MessageChannel`].
#[derive(Debug)]
pub struct Port {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Port {
    /// Split into the outgoing half and the incoming half.
    pub fn split(self) -> (PortSender, mpsc::UnboundedReceiver<Vec<u8>>) {
        (PortSender { inner: self.sender }, self.receiver)
    }
}

/// Cloneable outgoing half of a [`Port`].
#[derive(Debug, Clone)]
pub struct PortSender {
    inner: mpsc::UnboundedSender<Vec<u8>>,
}

impl PortSender {
    /// Encode and post a frame.
    pub fn post(&self, msg: &OpMessage) -> Result<(), OpError> {
        let bytes = msg.encode()?;
        self.inner.send(bytes).map_err(|_| OpError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Pair of connected ports.
pub struct MessageChannel;

impl MessageChannel {
    /// Create two ports; what one posts, the other receives, in order.
    pub fn pair() -> (Port, Port) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Port {
                sender: a_tx,
                receiver: a_rx,
            },
            Port {
                sender: b_tx,
                receiver: b_rx,
            },
        )
    }
}
