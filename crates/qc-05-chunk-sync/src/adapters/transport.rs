//! In-process transport

use tokio::sync::mpsc;

use crate::ports::Connection;

/// Two connected ends; frames written to one are read from the other
pub fn duplex(capacity: usize) -> (Connection, Connection) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        Connection {
            sender: a_tx,
            receiver: b_rx,
        },
        Connection {
            sender: b_tx,
            receiver: a_rx,
        },
    )
}
