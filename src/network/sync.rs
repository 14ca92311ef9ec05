// PeerSync: the per-packet state machine that keeps this node's chain in step
// with its peers. One instance is shared by every connection worker, the
// resync timer and the local mining path.

use crate::config::Config;
use crate::core::{Block, Blockchain, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::node::Nodes;
use crate::network::packet::{Message, OpType, Packet};
use crate::network::transport::Transport;
use crate::storage::MemoryPool;
use data_encoding::HEXLOWER;
use log::{debug, info, warn};
use std::sync::Arc;

/// Extra hashes requested on top of the height gap, so blocks mined while
/// the request is in flight are covered too.
pub const SYNC_MARGIN: u64 = 6;

pub struct PeerSync {
    config: Config,
    blockchain: Blockchain,
    nodes: Nodes,
    mempool: MemoryPool,
    transport: Arc<dyn Transport>,
}

impl PeerSync {
    /// Seeds the registry with the configured seed nodes.
    pub fn new(config: Config, blockchain: Blockchain, transport: Arc<dyn Transport>) -> PeerSync {
        let sync = PeerSync {
            config,
            blockchain,
            nodes: Nodes::new(),
            mempool: MemoryPool::new(),
            transport,
        };
        for seed in &sync.config.seed_nodes {
            sync.register_peer(seed);
        }
        sync
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn get_nodes(&self) -> &Nodes {
        &self.nodes
    }

    pub fn get_mempool(&self) -> &MemoryPool {
        &self.mempool
    }

    pub fn get_config(&self) -> &Config {
        &self.config
    }

    pub fn node_address(&self) -> &str {
        &self.config.node_address
    }

    fn register_peer(&self, addr: &str) {
        if addr != self.node_address() && self.nodes.add_node(addr) {
            info!("Registered peer {addr}");
        }
    }

    /// Decodes and dispatches one inbound packet.
    pub fn handle_packet(&self, packet: &Packet) -> Result<()> {
        let message = packet.message()?;
        let source = packet.source.as_str();
        debug!("Received {:?} from {source}", packet.command);

        match message {
            Message::BlockHeight { best_height } => self.handle_block_height(source, best_height),
            Message::GetBlocks { count } => self.handle_get_blocks(source, count),
            Message::Inv { op_type, items } => self.handle_inv(source, op_type, &items),
            Message::GetData { op_type, id } => self.handle_get_data(source, op_type, &id),
            Message::Block(block) => self.handle_block(source, &block),
            Message::Tx(tx) => self.handle_tx(source, tx),
        }
    }

    /// Sends directly to `addr`. An unreachable peer is evicted.
    pub fn send(&self, addr: &str, message: &Message) -> Result<()> {
        let packet = Packet::new(self.node_address(), addr, message)?;
        match self.transport.send(addr, &packet) {
            Err(e @ BlockchainError::PeerUnreachable(_)) => {
                if self.nodes.evict_node(addr) {
                    warn!("Evicted unreachable peer {addr}");
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Sends to a randomly chosen known peer, evicting and retrying on
    /// failure until one accepts or none are left.
    pub fn send_to_random_peer(&self, message: &Message) -> Result<String> {
        loop {
            let addr = self
                .nodes
                .random_node()
                .ok_or(BlockchainError::NoReachablePeers)?;
            match self.send(&addr, message) {
                Ok(()) => return Ok(addr),
                Err(BlockchainError::PeerUnreachable(reason)) => {
                    debug!("Retrying after unreachable peer: {reason}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends to every known peer; unreachable ones are evicted. Returns how
    /// many peers accepted the packet.
    pub fn broadcast(&self, message: &Message, except: Option<&str>) -> usize {
        self.nodes
            .get_nodes()
            .iter()
            .filter(|addr| Some(addr.as_str()) != except)
            .filter(|addr| match self.send(addr, message) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Broadcast to {addr} failed: {e}");
                    false
                }
            })
            .count()
    }

    fn local_height_message(&self) -> Result<Message> {
        Ok(Message::BlockHeight {
            best_height: self.blockchain.get_best_height()?,
        })
    }

    /// Announces the local height to every known peer.
    pub fn announce_height(&self) -> Result<usize> {
        let message = self.local_height_message()?;
        Ok(self.broadcast(&message, None))
    }

    /// Asks one random peer to compare heights with us. Driven by the resync
    /// timer; an empty registry just fails this round.
    pub fn resync(&self) -> Result<()> {
        let message = self.local_height_message()?;
        let addr = self.send_to_random_peer(&message)?;
        debug!("Resync round started with {addr}");
        Ok(())
    }

    pub fn handle_block_height(&self, source: &str, best_height: u64) -> Result<()> {
        self.register_peer(source);

        let local_height = self.blockchain.get_best_height()?;
        if local_height > best_height {
            self.send(source, &self.local_height_message()?)?;
        } else if local_height < best_height {
            info!("Peer {source} is at height {best_height}, local height {local_height}");
            self.send(source, &history_request(best_height - local_height))?;
        }
        Ok(())
    }

    pub fn handle_get_blocks(&self, source: &str, count: u64) -> Result<()> {
        let limit = usize::try_from(count).unwrap_or(usize::MAX);
        let items = self.blockchain.get_block_hashes(limit)?;
        self.send(
            source,
            &Message::Inv {
                op_type: OpType::Block,
                items,
            },
        )
    }

    pub fn handle_inv(&self, source: &str, op_type: OpType, items: &[Vec<u8>]) -> Result<()> {
        match op_type {
            OpType::Block => {
                // Inventories run tip to genesis; ask for the oldest missing first.
                for hash in items.iter().rev() {
                    if self.blockchain.block_exists(hash)? {
                        continue;
                    }
                    let request = Message::GetData {
                        op_type: OpType::Block,
                        id: hash.clone(),
                    };
                    let peer = self.send_to_random_peer(&request)?;
                    debug!("Requested block {} from {peer}", HEXLOWER.encode(hash));
                }
            }
            OpType::Tx => {
                for txid in items {
                    if self.mempool.contains(&HEXLOWER.encode(txid)) {
                        continue;
                    }
                    self.send(
                        source,
                        &Message::GetData {
                            op_type: OpType::Tx,
                            id: txid.clone(),
                        },
                    )?;
                }
            }
        }
        Ok(())
    }

    pub fn handle_get_data(&self, source: &str, op_type: OpType, id: &[u8]) -> Result<()> {
        match op_type {
            OpType::Block => match self.blockchain.get_block(id)? {
                Some(block) => self.send(source, &Message::Block(block)),
                None => {
                    debug!("{source} asked for unknown block {}", HEXLOWER.encode(id));
                    Ok(())
                }
            },
            OpType::Tx => match self.mempool.get(&HEXLOWER.encode(id)) {
                Some(tx) => self.send(source, &Message::Tx(tx)),
                None => Ok(()),
            },
        }
    }

    pub fn handle_block(&self, source: &str, block: &Block) -> Result<()> {
        let local_height = self.blockchain.get_best_height()?;

        if block.get_height() <= local_height {
            debug!(
                "Ignoring block {} at height {} (local height {local_height})",
                block.hash_hex(),
                block.get_height()
            );
            // Lets a lagging sender notice it is behind.
            return self.send(source, &self.local_height_message()?);
        }

        if block.get_height() > local_height.saturating_add(1) {
            let gap = block.get_height() - local_height;
            info!("Block from {source} is {gap} ahead; requesting history");
            return self.send(source, &history_request(gap));
        }

        self.blockchain.validate_next_block(block)?;
        self.blockchain.add_block(block)?;
        self.mempool.remove_conflicting(block.get_transactions());
        info!(
            "Accepted block {} at height {} from {source}",
            block.hash_hex(),
            block.get_height()
        );
        Ok(())
    }

    pub fn handle_tx(&self, source: &str, tx: Transaction) -> Result<()> {
        if self.mempool.contains(&tx.id_hex()) {
            return Ok(());
        }
        self.blockchain.check_transaction(&tx)?;

        let txid = tx.get_id().to_vec();
        self.mempool.add(tx);
        info!("Pooled transaction {} from {source}", HEXLOWER.encode(&txid));

        self.broadcast(
            &Message::Inv {
                op_type: OpType::Tx,
                items: vec![txid],
            },
            Some(source),
        );

        if self.config.is_miner() && self.mempool.len() >= self.config.mempool_threshold {
            self.mine_pending()?;
        }
        Ok(())
    }

    /// Mines whatever in the pool is still valid, then announces the new
    /// height. Returns `None` when nothing was left to mine.
    pub fn mine_pending(&self) -> Result<Option<Block>> {
        let miner = self.config.mining_address.as_deref().ok_or_else(|| {
            BlockchainError::Config("Mining address not configured".to_string())
        })?;

        let pending = self.mempool.get_all();
        let selected = self.blockchain.select_mineable(&pending);
        for tx in &pending {
            if !selected.contains(tx) {
                self.mempool.remove(&tx.id_hex());
            }
        }
        if selected.is_empty() {
            return Ok(None);
        }

        let block = self.blockchain.mine_block(&selected, miner)?;
        self.mempool.remove_conflicting(block.get_transactions());
        info!("New block {} is mined!", block.hash_hex());

        self.announce_height()?;
        Ok(Some(block))
    }
}

// Heights come from peers, so the count saturates instead of wrapping. The
// reply is bounded by the responder's own chain length.
fn history_request(gap: u64) -> Message {
    Message::GetBlocks {
        count: gap.saturating_add(SYNC_MARGIN),
    }
}
