//! The tokio driver: UDP sockets and worker threads around one [Engine]
//!
//! The engine itself never touches a socket or spawns a thread. This loop
//! feeds it datagrams and finished crypto tasks, drains its outboxes after
//! every step and sleeps until the earliest timer deadline. Crypto work is
//! executed on the blocking pool so a slow DH never stalls the state
//! machine's thread.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, instrument, trace};

use crate::engine::{Engine, Timestamp};
use crate::tasks;

/// Errors that may occur while driving the engine
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum DaemonError {
    #[error("Could not bind: {0}")]
    CouldNotBind(io::Error),
    #[error("Could not recv: {0}")]
    Receive(io::Error),
    #[error("Could not send: {0}")]
    Send(io::Error),
}

/// Handle the receival of datagrams
async fn handle_receive(
    socket: Arc<UdpSocket>,
    tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
) -> Result<(), DaemonError> {
    loop {
        const MAX_DATAGRAM_SIZE: usize = 65_507;
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = socket
            .recv_from(&mut buf)
            .await
            .map_err(DaemonError::Receive)?;
        if tx.send((from, buf[..len].to_vec())).is_err() {
            return Ok(());
        }
    }
}

/// Drive the engine until the process is stopped
#[instrument(skip_all)]
pub async fn run(mut engine: Engine) -> Result<(), DaemonError> {
    let local = engine.local_addr();
    let socket = Arc::new(
        UdpSocket::bind(local)
            .await
            .map_err(DaemonError::CouldNotBind)?,
    );
    debug!("Listening on {local}");

    let (net_tx, mut net_rx) = mpsc::unbounded_channel();
    tokio::spawn(handle_receive(socket.clone(), net_tx));

    let (task_tx, mut task_rx) = mpsc::unbounded_channel();
    let started = Instant::now();

    loop {
        // drain everything the last step produced
        for request in engine.take_tasks() {
            let tx = task_tx.clone();
            tokio::task::spawn_blocking(move || {
                let done = tasks::run(request);
                let _ = tx.send(done);
            });
        }
        for datagram in engine.take_datagrams() {
            trace!("Sending {} bytes to {}", datagram.bytes.len(), datagram.to);
            socket
                .send_to(&datagram.bytes, datagram.to)
                .await
                .map_err(DaemonError::Send)?;
        }

        let now = Timestamp::from_elapsed(started.elapsed());
        let until_deadline = engine
            .next_deadline()
            .map(|deadline| deadline.since(now))
            .unwrap_or(Duration::from_secs(3600));

        select! {
            received = net_rx.recv() => {
                let Some((from, bytes)) = received else {
                    return Ok(());
                };
                engine.handle_datagram(Timestamp::from_elapsed(started.elapsed()), from, bytes);
            }
            done = task_rx.recv() => {
                if let Some(done) = done {
                    engine.complete_task(Timestamp::from_elapsed(started.elapsed()), done);
                }
            }
            _ = sleep(until_deadline) => {
                engine.tick(Timestamp::from_elapsed(started.elapsed()));
            }
        }
    }
}
