// Wire format: every connection carries one frame, a 4-byte big-endian
// length followed by the JSON-encoded `Packet`. The packet payload is the
// bincode encoding of the command-specific structure.

use crate::core::{Block, Transaction};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

pub const PROTOCOL_VERSION: u32 = 1;

const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    BlockHeight,
    GetBlocks,
    Inv,
    GetData,
    Block,
    Tx,
}

/// What an `inv` or `getData` refers to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum OpType {
    Tx,
    Block,
}

/// Decoded packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    BlockHeight { best_height: u64 },
    GetBlocks { count: u64 },
    Inv { op_type: OpType, items: Vec<Vec<u8>> },
    GetData { op_type: OpType, id: Vec<u8> },
    Block(Block),
    Tx(Transaction),
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::BlockHeight { .. } => Command::BlockHeight,
            Message::GetBlocks { .. } => Command::GetBlocks,
            Message::Inv { .. } => Command::Inv,
            Message::GetData { .. } => Command::GetData,
            Message::Block(_) => Command::Block,
            Message::Tx(_) => Command::Tx,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        match self {
            Message::BlockHeight { best_height } => serialize(best_height),
            Message::GetBlocks { count } => serialize(count),
            Message::Inv { op_type, items } => serialize(&(*op_type, items.clone())),
            Message::GetData { op_type, id } => serialize(&(*op_type, id.clone())),
            Message::Block(block) => block.serialize(),
            Message::Tx(tx) => tx.serialize(),
        }
    }

    fn decode_payload(command: Command, payload: &[u8]) -> Result<Message> {
        let message = match command {
            Command::BlockHeight => deserialize(payload).map(|best_height| Message::BlockHeight { best_height }),
            Command::GetBlocks => deserialize(payload).map(|count| Message::GetBlocks { count }),
            Command::Inv => deserialize::<(OpType, Vec<Vec<u8>>)>(payload)
                .map(|(op_type, items)| Message::Inv { op_type, items }),
            Command::GetData => deserialize::<(OpType, Vec<u8>)>(payload)
                .map(|(op_type, id)| Message::GetData { op_type, id }),
            Command::Block => Block::deserialize(payload).map(Message::Block),
            Command::Tx => Transaction::deserialize(payload).map(Message::Tx),
        };
        message.map_err(|e| BlockchainError::Protocol(format!("Malformed {command:?} payload: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub version: u32,
    pub command: Command,
    pub source: String,
    pub destination: String,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(source: &str, destination: &str, message: &Message) -> Result<Packet> {
        Ok(Packet {
            version: PROTOCOL_VERSION,
            command: message.command(),
            source: source.to_string(),
            destination: destination.to_string(),
            payload: message.encode_payload()?,
        })
    }

    pub fn message(&self) -> Result<Message> {
        if self.version != PROTOCOL_VERSION {
            return Err(BlockchainError::Protocol(format!(
                "Unsupported protocol version {} from {}",
                self.version, self.source
            )));
        }
        Message::decode_payload(self.command, &self.payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| BlockchainError::Serialization(format!("Failed to encode packet: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Packet> {
        serde_json::from_slice(bytes)
            .map_err(|e| BlockchainError::Protocol(format!("Failed to decode packet: {e}")))
    }
}

pub fn write_packet<W: Write>(writer: &mut W, packet: &Packet, max_frame_bytes: usize) -> Result<()> {
    let body = packet.encode()?;
    if body.len() > max_frame_bytes {
        return Err(BlockchainError::Protocol(format!(
            "Packet of {} bytes exceeds frame limit {max_frame_bytes}",
            body.len()
        )));
    }
    let len = u32::try_from(body.len())
        .map_err(|_| BlockchainError::Protocol("Packet too large to frame".to_string()))?;

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. Truncated or oversized frames are protocol faults.
pub fn read_packet<R: Read>(reader: &mut R, max_frame_bytes: usize) -> Result<Packet> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|e| BlockchainError::Protocol(format!("Failed to read frame header: {e}")))?;

    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_bytes {
        return Err(BlockchainError::Protocol(format!(
            "Frame of {len} bytes exceeds limit {max_frame_bytes}"
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| BlockchainError::Protocol(format!("Failed to read frame body: {e}")))?;
    Packet::decode(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;
    use std::io::Cursor;

    const MAX: usize = 1 << 20;

    fn through_frame(message: Message) -> Message {
        let packet = Packet::new("127.0.0.1:3000", "127.0.0.1:3001", &message).unwrap();
        let mut buf = vec![];
        write_packet(&mut buf, &packet, MAX).unwrap();

        let decoded = read_packet(&mut Cursor::new(buf), MAX).unwrap();
        assert_eq!(decoded, packet);
        decoded.message().unwrap()
    }

    #[test]
    fn test_every_message_survives_the_wire() {
        let tx = Transaction::new_coinbase_tx(&Wallet::new().unwrap().get_address()).unwrap();
        let block = Block::new_block(vec![], &[tx.clone()], 0, 4).unwrap();

        let messages = vec![
            Message::BlockHeight { best_height: 42 },
            Message::GetBlocks { count: 7 },
            Message::Inv {
                op_type: OpType::Block,
                items: vec![vec![1; 32], vec![2; 32]],
            },
            Message::GetData {
                op_type: OpType::Tx,
                id: vec![3; 32],
            },
            Message::Block(block),
            Message::Tx(tx),
        ];
        for message in messages {
            assert_eq!(through_frame(message.clone()), message);
        }
    }

    #[test]
    fn test_command_tags_on_the_wire() {
        let packet =
            Packet::new("a", "b", &Message::BlockHeight { best_height: 1 }).unwrap();
        let json = String::from_utf8(packet.encode().unwrap()).unwrap();
        assert!(json.contains("\"blockHeight\""));

        let get_blocks = Packet::new("a", "b", &Message::GetBlocks { count: 1 }).unwrap();
        assert!(String::from_utf8(get_blocks.encode().unwrap())
            .unwrap()
            .contains("\"getBlocks\""));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = vec![];
        buf.extend_from_slice(&(MAX as u32 + 1).to_be_bytes());
        let err = read_packet(&mut Cursor::new(buf), MAX).unwrap_err();
        assert!(matches!(err, BlockchainError::Protocol(_)));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let packet = Packet::new("a", "b", &Message::GetBlocks { count: 1 }).unwrap();
        let mut buf = vec![];
        write_packet(&mut buf, &packet, MAX).unwrap();
        buf.truncate(buf.len() - 3);

        let err = read_packet(&mut Cursor::new(buf), MAX).unwrap_err();
        assert!(matches!(err, BlockchainError::Protocol(_)));
    }

    #[test]
    fn test_unknown_command_and_bad_payload() {
        let raw = br#"{"version":1,"command":"ping","source":"a","destination":"b","payload":[]}"#;
        assert!(matches!(
            Packet::decode(raw),
            Err(BlockchainError::Protocol(_))
        ));

        let packet = Packet {
            version: PROTOCOL_VERSION,
            command: Command::Block,
            source: "a".to_string(),
            destination: "b".to_string(),
            payload: vec![0xFF; 3],
        };
        assert!(matches!(packet.message(), Err(BlockchainError::Protocol(_))));

        let packet = Packet {
            version: 99,
            ..packet
        };
        assert!(matches!(packet.message(), Err(BlockchainError::Protocol(_))));
    }
}
