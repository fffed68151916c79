use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use emberd_chainstate::blockstore::BlockRepository;
use emberd_chainstate::coinview::CoinView;
use emberd_chainstate::rules::{RuleRegistry, ValidationFlags};
use emberd_chainstate::state::ChainState;
use emberd_consensus::{block_subsidy, consensus_params, ConsensusParams, Hash256, Network};
use emberd_pow::difficulty::{compact_to_target, hash_meets_target};
use emberd_primitives::block::{Block, BlockHeader};
use emberd_primitives::outpoint::OutPoint;
use emberd_primitives::transaction::{Transaction, TxIn, TxOut};
use emberd_storage::memory::MemoryStore;

const REGTEST_BITS: u32 = 0x207fffff;

fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn coinbase_tx(params: &ConsensusParams, height: i32, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        time: 0,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x01, tag],
            sequence: TxIn::SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: block_subsidy(height, params),
            script_pubkey: p2pkh_script(tag),
        }],
        lock_time: 0,
    }
}

fn merkle_root_of(params: &ConsensusParams, transactions: &[Transaction]) -> Hash256 {
    let txids: Vec<Hash256> = transactions
        .iter()
        .map(|tx| tx.txid(&params.options))
        .collect();
    emberd_chainstate::rules::merkle_root(&txids).0
}

/// Grind the nonce until the header satisfies regtest proof of work.
fn mine(params: &ConsensusParams, prev: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
    let target = compact_to_target(REGTEST_BITS).expect("regtest bits");
    let merkle_root = merkle_root_of(params, &transactions);
    for nonce in 0..10_000u32 {
        let header = BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root,
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

struct Harness {
    params: ConsensusParams,
    store: Arc<MemoryStore>,
    state: ChainState<MemoryStore>,
    repo: BlockRepository<MemoryStore>,
    genesis: Block,
}

fn harness() -> Harness {
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
    let repo = BlockRepository::new(Arc::clone(&store), params.options.clone(), true);
    repo.initialize(&genesis).expect("repo initialize");

    Harness {
        params,
        store,
        state,
        repo,
        genesis,
    }
}

#[test]
fn heavier_fork_wins_and_coins_follow() {
    let h = harness();
    let flags = ValidationFlags::default();
    let base_time = h.params.genesis_time;
    let adjusted = (base_time + 100 * 600) as i64;

    // Chain A: two blocks on genesis.
    let a1 = mine(
        &h.params,
        h.genesis.hash(),
        base_time + 600,
        vec![coinbase_tx(&h.params, 1, 0xa1)],
    );
    let a2 = mine(
        &h.params,
        a1.hash(),
        base_time + 1200,
        vec![coinbase_tx(&h.params, 2, 0xa2)],
    );
    for block in [&a1, &a2] {
        h.repo
            .put_blocks(block.hash(), std::slice::from_ref(block))
            .expect("store block");
        h.state.connect_block(block, adjusted, flags).expect("connect");
    }
    let tip = h.state.best_block().expect("tip").expect("some tip");
    assert_eq!(tip.height, 2);
    assert_eq!(tip.hash, a2.hash());

    // Chain B: three blocks on genesis, strictly more work.
    let b1 = mine(
        &h.params,
        h.genesis.hash(),
        base_time + 300,
        vec![coinbase_tx(&h.params, 1, 0xb1)],
    );
    let b2 = mine(
        &h.params,
        b1.hash(),
        base_time + 900,
        vec![coinbase_tx(&h.params, 2, 0xb2)],
    );
    let b3 = mine(
        &h.params,
        b2.hash(),
        base_time + 1500,
        vec![coinbase_tx(&h.params, 3, 0xb3)],
    );
    for block in [&b1, &b2, &b3] {
        h.repo
            .put_blocks(block.hash(), std::slice::from_ref(block))
            .expect("store block");
        h.state
            .insert_header(&block.header, adjusted, true)
            .expect("insert header");
    }
    let best_header = h.state.best_header().expect("header tip").expect("some");
    assert_eq!(best_header.hash, b3.hash());

    let stop = AtomicBool::new(false);
    let outcome = h
        .state
        .activate_best_chain(adjusted, flags, &stop)
        .expect("reorg");
    assert_eq!(outcome.disconnected, 2);
    assert_eq!(outcome.connected, 3);
    assert!(!outcome.interrupted);

    let tip = h.state.best_block().expect("tip").expect("some tip");
    assert_eq!(tip.height, 3);
    assert_eq!(tip.hash, b3.hash());

    // Coins moved over with the winning branch.
    let view = CoinView::new(Arc::clone(&h.store));
    let a1_coinbase = a1.transactions[0].txid(&h.params.options);
    let b1_coinbase = b1.transactions[0].txid(&h.params.options);
    assert!(view.get(&a1_coinbase).expect("get").is_none());
    assert!(view.get(&b1_coinbase).expect("get").is_some());
}

#[test]
fn equal_work_fork_does_not_reorganize() {
    let h = harness();
    let flags = ValidationFlags::default();
    let base_time = h.params.genesis_time;
    let adjusted = (base_time + 100 * 600) as i64;

    let a1 = mine(
        &h.params,
        h.genesis.hash(),
        base_time + 600,
        vec![coinbase_tx(&h.params, 1, 0xa1)],
    );
    h.repo
        .put_blocks(a1.hash(), std::slice::from_ref(&a1))
        .expect("store block");
    h.state.connect_block(&a1, adjusted, flags).expect("connect");

    // Same height, same work: first seen stays active.
    let b1 = mine(
        &h.params,
        h.genesis.hash(),
        base_time + 300,
        vec![coinbase_tx(&h.params, 1, 0xb1)],
    );
    h.repo
        .put_blocks(b1.hash(), std::slice::from_ref(&b1))
        .expect("store block");
    h.state
        .insert_header(&b1.header, adjusted, true)
        .expect("insert header");

    let stop = AtomicBool::new(false);
    let outcome = h
        .state
        .activate_best_chain(adjusted, flags, &stop)
        .expect("activate");
    assert_eq!(outcome.disconnected, 0);
    assert_eq!(outcome.connected, 0);

    let tip = h.state.best_block().expect("tip").expect("some tip");
    assert_eq!(tip.hash, a1.hash());
}
