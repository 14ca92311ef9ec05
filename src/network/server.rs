use crate::config::Config;
use crate::core::{Blockchain, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::packet::{read_packet, Message, Packet};
use crate::network::sync::PeerSync;
use crate::network::transport::{TcpTransport, Transport};
use crossbeam_channel::{bounded, Receiver};
use log::{debug, error, info, warn};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

/// TCP front end of a node: a fixed pool of workers fed through a bounded
/// accept queue, plus a resync timer.
pub struct Server {
    sync: Arc<PeerSync>,
}

impl Server {
    pub fn new(config: Config, blockchain: Blockchain) -> Server {
        let transport = Arc::new(TcpTransport::new(
            config.dial_timeout(),
            config.io_timeout(),
            config.max_frame_bytes,
        ));
        Self::with_transport(config, blockchain, transport)
    }

    pub fn with_transport(
        config: Config,
        blockchain: Blockchain,
        transport: Arc<dyn Transport>,
    ) -> Server {
        Server {
            sync: Arc::new(PeerSync::new(config, blockchain, transport)),
        }
    }

    pub fn get_sync(&self) -> &Arc<PeerSync> {
        &self.sync
    }

    /// Binds the configured address and serves until the process exits.
    pub fn run(&self) -> Result<()> {
        let addr = self.sync.node_address().to_string();
        let listener = TcpListener::bind(&addr)
            .map_err(|e| BlockchainError::Io(format!("Failed to bind to {addr}: {e}")))?;
        info!("Server listening on {addr}");

        if let Err(e) = self.sync.announce_height() {
            warn!("Initial height announcement failed: {e}");
        }
        self.start_resync_timer();
        self.serve(listener)
    }

    /// Accept loop. Blocks once `accept_queue` connections are waiting for
    /// a worker.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        let config = self.sync.get_config();
        let (sender, receiver) = bounded::<TcpStream>(config.accept_queue);

        for id in 0..config.worker_threads {
            let receiver = receiver.clone();
            let sync = Arc::clone(&self.sync);
            thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || Self::worker_loop(sync, receiver))?;
        }

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if sender.send(stream).is_err() {
                        return Err(BlockchainError::Io("All workers have stopped".to_string()));
                    }
                }
                Err(e) => error!("Error accepting connection: {e}"),
            }
        }
        Ok(())
    }

    fn worker_loop(sync: Arc<PeerSync>, receiver: Receiver<TcpStream>) {
        for stream in receiver.iter() {
            let peer = stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            if let Err(e) = Self::handle_connection(&sync, stream) {
                Self::log_failure(&peer, &e);
            }
        }
    }

    fn handle_connection(sync: &PeerSync, mut stream: TcpStream) -> Result<()> {
        let config = sync.get_config();
        stream.set_read_timeout(Some(config.io_timeout()))?;
        let packet = read_packet(&mut stream, config.max_frame_bytes);
        let _ = stream.shutdown(Shutdown::Both);
        sync.handle_packet(&packet?)
    }

    // Nothing from the network may stop the node; failures are only logged.
    fn log_failure(peer: &str, e: &BlockchainError) {
        if e.is_validation() {
            warn!("Rejected data from {peer}: {e}");
        } else {
            match e {
                BlockchainError::Protocol(_) => warn!("Dropped packet from {peer}: {e}"),
                BlockchainError::MiningCancelled | BlockchainError::StaleTip { .. } => {
                    info!("Mining round abandoned: {e}")
                }
                BlockchainError::PeerUnreachable(_) | BlockchainError::NoReachablePeers => {
                    warn!("Synchronisation with {peer} failed: {e}")
                }
                _ => error!("Error handling connection from {peer}: {e}"),
            }
        }
    }

    fn start_resync_timer(&self) {
        let sync = Arc::clone(&self.sync);
        let interval = sync.get_config().sync_interval();
        let spawned = thread::Builder::new()
            .name("resync".to_string())
            .spawn(move || loop {
                thread::sleep(interval);
                if let Err(e) = sync.resync() {
                    debug!("Resync round failed: {e}");
                }
            });
        if let Err(e) = spawned {
            error!("Failed to start resync timer: {e}");
        }
    }
}

/// Hands a locally created transaction to `addr` for relay and mining.
pub fn send_tx(config: &Config, addr: &str, tx: &Transaction) -> Result<()> {
    let transport = TcpTransport::new(
        config.dial_timeout(),
        config.io_timeout(),
        config.max_frame_bytes,
    );
    let packet = Packet::new(&config.node_address, addr, &Message::Tx(tx.clone()))?;
    transport.send(addr, &packet)
}
