use emberd_consensus::{ConsensusOptions, Hash256};
use emberd_primitives::block::{Block, BlockHeader};
use emberd_primitives::outpoint::OutPoint;
use emberd_primitives::transaction::{Transaction, TxIn, TxOut};

fn seq_array<const N: usize>(start: u8) -> [u8; N] {
    std::array::from_fn(|i| start.wrapping_add(i as u8))
}

fn seq_hash(start: u8) -> Hash256 {
    seq_array::<32>(start)
}

fn push_hash_le(buffer: &mut Vec<u8>, start: u8) {
    for byte in 0u8..=0x1f {
        buffer.push(start.wrapping_add(byte));
    }
}

fn plain_options() -> ConsensusOptions {
    ConsensusOptions::default()
}

#[test]
fn serialize_block_header() {
    let options = plain_options();
    let header = BlockHeader {
        version: 4,
        prev_block: seq_hash(0x00),
        merkle_root: seq_hash(0x20),
        time: 0x01020304,
        bits: 0x0a0b0c0d,
        nonce: 0x11223344,
        signature: Vec::new(),
    };

    let encoded = header.consensus_encode(&options);
    let mut expected = Vec::new();
    expected.extend_from_slice(&4i32.to_le_bytes());
    push_hash_le(&mut expected, 0x00);
    push_hash_le(&mut expected, 0x20);
    expected.extend_from_slice(&0x01020304u32.to_le_bytes());
    expected.extend_from_slice(&0x0a0b0c0du32.to_le_bytes());
    expected.extend_from_slice(&0x11223344u32.to_le_bytes());

    assert_eq!(encoded, expected);
    assert_eq!(encoded.len(), 80);

    let decoded = BlockHeader::consensus_decode(&encoded, &options).expect("decode header");
    assert_eq!(decoded, header);
}

#[test]
fn serialize_signed_block_header() {
    let options = ConsensusOptions {
        block_signature: true,
        transaction_timestamp: false,
    };
    let header = BlockHeader {
        version: 4,
        prev_block: seq_hash(0x00),
        merkle_root: seq_hash(0x20),
        time: 0x01020304,
        bits: 0x0a0b0c0d,
        nonce: 0x11223344,
        signature: vec![0xaa, 0xbb, 0xcc],
    };

    let encoded = header.consensus_encode(&options);
    // 80-byte core, then the signature as a length-prefixed blob.
    assert_eq!(encoded.len(), 80 + 1 + 3);
    assert_eq!(&encoded[80..], &[3, 0xaa, 0xbb, 0xcc]);

    let decoded = BlockHeader::consensus_decode(&encoded, &options).expect("decode header");
    assert_eq!(decoded, header);

    // The hash never covers the signature.
    let mut unsigned = header.clone();
    unsigned.signature.clear();
    assert_eq!(header.hash(), unsigned.hash());
}

#[test]
fn serialize_transaction_layout() {
    let options = plain_options();
    let tx = Transaction {
        version: 1,
        time: 0,
        vin: vec![TxIn {
            prevout: OutPoint::new(seq_hash(0x40), 7),
            script_sig: vec![0x51],
            sequence: TxIn::SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: 0x0102030405060708,
            script_pubkey: vec![0x6a, 0x01, 0x02],
        }],
        lock_time: 0x6000_0000,
    };

    let encoded = tx.consensus_encode(&options);
    let mut expected = Vec::new();
    expected.extend_from_slice(&1i32.to_le_bytes());
    expected.push(1);
    push_hash_le(&mut expected, 0x40);
    expected.extend_from_slice(&7u32.to_le_bytes());
    expected.push(1);
    expected.push(0x51);
    expected.extend_from_slice(&TxIn::SEQUENCE_FINAL.to_le_bytes());
    expected.push(1);
    expected.extend_from_slice(&0x0102030405060708i64.to_le_bytes());
    expected.push(3);
    expected.extend_from_slice(&[0x6a, 0x01, 0x02]);
    expected.extend_from_slice(&0x6000_0000u32.to_le_bytes());

    assert_eq!(encoded, expected);

    let decoded = Transaction::consensus_decode(&encoded, &options).expect("decode tx");
    assert_eq!(decoded, tx);
}

#[test]
fn transaction_timestamp_field_is_optional() {
    let plain = plain_options();
    let timestamped = ConsensusOptions {
        block_signature: false,
        transaction_timestamp: true,
    };

    let mut tx = Transaction {
        version: 1,
        time: 0x5566_7788,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x00],
            sequence: TxIn::SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: 50,
            script_pubkey: Vec::new(),
        }],
        lock_time: 0,
    };

    let with_time = tx.consensus_encode(&timestamped);
    let without = tx.consensus_encode(&plain);
    assert_eq!(with_time.len(), without.len() + 4);
    assert_eq!(&with_time[4..8], &0x5566_7788u32.to_le_bytes());

    // The plain wire format does not carry the field at all.
    tx.time = 0;
    assert_eq!(tx.consensus_encode(&plain), without);

    let decoded = Transaction::consensus_decode(&with_time, &timestamped).expect("decode tx");
    assert_eq!(decoded.time, 0x5566_7788);
}

#[test]
fn serialize_block_round_trip() {
    let options = plain_options();
    let coinbase = Transaction {
        version: 1,
        time: 0,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x02, 0x01, 0x00],
            sequence: TxIn::SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: 50_0000_0000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };
    let block = Block {
        header: BlockHeader {
            version: 2,
            prev_block: seq_hash(0x10),
            merkle_root: seq_hash(0x30),
            time: 1_296_688_602,
            bits: 0x207f_ffff,
            nonce: 2,
            signature: Vec::new(),
        },
        transactions: vec![coinbase],
    };

    let encoded = block.consensus_encode(&options);
    let decoded = Block::consensus_decode(&encoded, &options).expect("decode block");
    assert_eq!(decoded, block);
}

#[test]
fn decode_rejects_trailing_bytes() {
    let options = plain_options();
    let header = BlockHeader {
        version: 1,
        prev_block: [0u8; 32],
        merkle_root: [0u8; 32],
        time: 0,
        bits: 0x207f_ffff,
        nonce: 0,
        signature: Vec::new(),
    };
    let mut encoded = header.consensus_encode(&options);
    encoded.push(0x00);
    assert!(BlockHeader::consensus_decode(&encoded, &options).is_err());
}
