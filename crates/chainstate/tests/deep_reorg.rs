use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use emberd_chainstate::blockstore::BlockRepository;
use emberd_chainstate::coinview::CoinView;
use emberd_chainstate::rules::{merkle_root, RuleRegistry, ValidationFlags};
use emberd_chainstate::state::ChainState;
use emberd_consensus::{block_subsidy, consensus_params, ConsensusParams, Hash256, Network};
use emberd_pow::difficulty::{compact_to_target, hash_meets_target};
use emberd_primitives::block::{Block, BlockHeader};
use emberd_primitives::outpoint::OutPoint;
use emberd_primitives::transaction::{Transaction, TxIn, TxOut};
use emberd_storage::memory::MemoryStore;

const REGTEST_BITS: u32 = 0x207fffff;
const FEE: i64 = 1_000;

fn coinbase_tx(params: &ConsensusParams, height: i32, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        time: 0,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x01, tag, (height & 0xff) as u8, (height >> 8) as u8],
            sequence: TxIn::SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: block_subsidy(height, params),
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

fn spend_tx(prevout: OutPoint, value: i64) -> Transaction {
    Transaction {
        version: 1,
        time: 0,
        vin: vec![TxIn {
            prevout,
            script_sig: vec![0x01, 0xaa],
            sequence: TxIn::SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: value - FEE,
            script_pubkey: vec![0x52],
        }],
        lock_time: 0,
    }
}

fn mine(params: &ConsensusParams, prev: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
    let target = compact_to_target(REGTEST_BITS).expect("regtest bits");
    let txids: Vec<Hash256> = transactions
        .iter()
        .map(|tx| tx.txid(&params.options))
        .collect();
    let root = merkle_root(&txids).0;
    for nonce in 0..10_000u32 {
        let header = BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: root,
            time,
            bits: REGTEST_BITS,
            nonce,
            signature: Vec::new(),
        };
        if hash_meets_target(&header.hash(), &target) {
            return Block {
                header,
                transactions,
            };
        }
    }
    panic!("no nonce satisfied the regtest target");
}

#[test]
fn reorg_across_spend_restores_the_spent_coin() {
    let mut params = consensus_params(Network::Regtest);
    let genesis = mine(
        &params,
        [0u8; 32],
        params.genesis_time,
        vec![coinbase_tx(&params, 0, 0)],
    );
    params.hash_genesis_block = genesis.hash();

    let store = Arc::new(MemoryStore::new());
    let state = ChainState::new(Arc::clone(&store), params.clone(), RuleRegistry::standard());
    state.initialize(&genesis).expect("initialize");
    let repo = BlockRepository::new(Arc::clone(&store), params.options.clone(), false);
    repo.initialize(&genesis).expect("repo initialize");

    let flags = ValidationFlags::default();
    let base_time = params.genesis_time;
    let adjusted = (base_time + 1_000 * 600) as i64;
    let time_at = |height: i32| base_time + height as u32 * 600;

    // Chain A: 105 empty blocks, then one that spends the height-1
    // coinbase (mature by then: 106 - 1 >= 100).
    let mut chain_a: Vec<Block> = Vec::new();
    let mut prev = genesis.hash();
    for height in 1..=105 {
        let block = mine(
            &params,
            prev,
            time_at(height),
            vec![coinbase_tx(&params, height, 0xa0)],
        );
        prev = block.hash();
        chain_a.push(block);
    }
    let mature_coinbase = chain_a[0].transactions[0].clone();
    let mature_txid = mature_coinbase.txid(&params.options);
    let spend = spend_tx(OutPoint::new(mature_txid, 0), mature_coinbase.vout[0].value);
    let spend_txid = spend.txid(&params.options);
    let spender = mine(
        &params,
        prev,
        time_at(106),
        vec![coinbase_tx(&params, 106, 0xa0), spend],
    );
    chain_a.push(spender);

    for block in &chain_a {
        repo.put_blocks(block.hash(), std::slice::from_ref(block))
            .expect("store block");
        state.connect_block(block, adjusted, flags).expect("connect");
    }
    let tip = state.best_block().expect("tip").expect("some tip");
    assert_eq!(tip.height, 106);

    let view = CoinView::new(Arc::clone(&store));
    assert!(view.get(&mature_txid).expect("get").is_none());
    assert!(view.get(&spend_txid).expect("get").is_some());

    // Chain B forks at height 100 and overtakes by two blocks.
    let fork_point = chain_a[99].hash();
    let mut chain_b: Vec<Block> = Vec::new();
    let mut prev = fork_point;
    for height in 101..=108 {
        let block = mine(
            &params,
            prev,
            time_at(height) + 300,
            vec![coinbase_tx(&params, height, 0xb0)],
        );
        prev = block.hash();
        chain_b.push(block);
    }
    for block in &chain_b {
        repo.put_blocks(block.hash(), std::slice::from_ref(block))
            .expect("store block");
        state
            .insert_header(&block.header, adjusted, true)
            .expect("insert header");
    }

    let stop = AtomicBool::new(false);
    let outcome = state
        .activate_best_chain(adjusted, flags, &stop)
        .expect("reorg");
    assert_eq!(outcome.disconnected, 6);
    assert_eq!(outcome.connected, 8);

    let tip = state.best_block().expect("tip").expect("some tip");
    assert_eq!(tip.height, 108);
    assert_eq!(tip.hash, chain_b.last().expect("tip block").hash());

    // The undo data put the spent coinbase back and erased the spender.
    let restored = view.get(&mature_txid).expect("get").expect("restored");
    assert_eq!(
        restored.get(0).map(|out| out.value),
        Some(mature_coinbase.vout[0].value),
    );
    assert!(view.get(&spend_txid).expect("get").is_none());

    // Disconnected chain A coins are gone; chain B coins exist.
    let a105 = chain_a[104].transactions[0].txid(&params.options);
    assert!(view.get(&a105).expect("get").is_none());
    let b108 = chain_b[7].transactions[0].txid(&params.options);
    assert!(view.get(&b108).expect("get").is_some());
}

#[test]
fn interrupted_reorg_resumes_cleanly() {
    let mut params = consensus_params(Network::Regtest);
    let genesis = mine(
        &params,
        [0u8; 32],
        params.genesis_time,
        vec![coinbase_tx(&params, 0, 0)],
    );
    params.hash_genesis_block = genesis.hash();

    let store = Arc::new(MemoryStore::new());
    let state = ChainState::new(Arc::clone(&store), params.clone(), RuleRegistry::standard());
    state.initialize(&genesis).expect("initialize");
    let repo = BlockRepository::new(Arc::clone(&store), params.options.clone(), false);
    repo.initialize(&genesis).expect("repo initialize");

    let flags = ValidationFlags::default();
    let base_time = params.genesis_time;
    let adjusted = (base_time + 100 * 600) as i64;

    let mut prev = genesis.hash();
    let mut blocks = Vec::new();
    for height in 1..=3 {
        let block = mine(
            &params,
            prev,
            base_time + height as u32 * 600,
            vec![coinbase_tx(&params, height, 0xcc)],
        );
        prev = block.hash();
        repo.put_blocks(block.hash(), std::slice::from_ref(&block))
            .expect("store block");
        state
            .insert_header(&block.header, adjusted, true)
            .expect("insert header");
        blocks.push(block);
    }

    // An already-raised stop flag connects nothing.
    let stop = AtomicBool::new(true);
    let outcome = state
        .activate_best_chain(adjusted, flags, &stop)
        .expect("activate");
    assert!(outcome.interrupted);
    assert_eq!(outcome.connected, 0);
    assert_eq!(state.best_block().expect("tip").expect("tip").height, 0);

    // Clearing the flag finishes the job.
    let stop = AtomicBool::new(false);
    let outcome = state
        .activate_best_chain(adjusted, flags, &stop)
        .expect("activate");
    assert!(!outcome.interrupted);
    assert_eq!(outcome.connected, 3);
    assert_eq!(state.best_block().expect("tip").expect("tip").height, 3);
}
