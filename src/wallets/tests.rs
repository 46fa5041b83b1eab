use std::sync::atomic::{AtomicUsize, Ordering};

use bitcoin::hashes::Hash;
use bitcoin::Txid;

use super::*;
use crate::cache::CacheSettings;
use crate::model::output_status::UNSPENT;
use crate::model::{AddressId, TxInput, TxOutput};
use crate::store::memory::MemoryStore;

struct Chain {
    store: Arc<MemoryStore>,
    next_transaction_id: TransactionId,
}

impl Chain {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            next_transaction_id: 1,
        }
    }

    fn address(&self, seq: i64, wallet_id: WalletId) -> AddressId {
        let address_id = AddressType::P2pkh.id_base() + seq;
        self.store.put_address(Address {
            address_id,
            address: vec![seq as u8; 20],
            wallet_id,
        });
        if wallet_id != UNASSIGNED_WALLET {
            self.store.put_wallet(wallet_id);
        }
        address_id
    }

    fn transaction(&mut self, n_inputs: i32) -> TransactionId {
        let transaction_id = self.next_transaction_id;
        self.next_transaction_id += 1;
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&transaction_id.to_le_bytes());
        self.store.put_transaction(Transaction {
            transaction_id,
            txid: Txid::from_byte_array(bytes),
            block_height: 1,
            n_inputs,
            n_outputs: 1,
        });
        transaction_id
    }

    /// A transaction without inputs paying `address_id`.
    fn fund(&mut self, address_id: AddressId) -> (TransactionId, i16) {
        let transaction_id = self.transaction(0);
        self.store.put_output(TxOutput {
            transaction_id,
            pos: 0,
            address_id,
            amount: 1_000,
            status: UNSPENT,
        });
        (transaction_id, 0)
    }

    fn spend(&mut self, spent: &[(TransactionId, i16)]) -> TransactionId {
        let transaction_id = self.transaction(spent.len() as i32);
        for (pos, (in_transaction_id, in_pos)) in spent.iter().enumerate() {
            self.store.put_input(TxInput {
                transaction_id,
                pos: pos as i16,
                in_transaction_id: *in_transaction_id,
                in_pos: *in_pos,
            });
        }
        transaction_id
    }

    fn wallet_of(&self, address_id: AddressId) -> WalletId {
        self.store.address(address_id).unwrap().wallet_id
    }

    fn engine(&self, batch_size: i32) -> WalletClusterer {
        let caches = Arc::new(Caches::new(self.store.clone(), &CacheSettings::default()));
        WalletClusterer::new(
            self.store.clone(),
            caches,
            WalletSettings {
                batch_size,
                threads: 4,
                idle_wait_secs: 0,
                exit_when_caught_up: true,
                ..WalletSettings::default()
            },
        )
    }
}

struct Never;

impl StopSignal for Never {
    fn should_stop(&self) -> bool {
        false
    }
}

struct StopAfter {
    checks: AtomicUsize,
    limit: usize,
}

impl StopAfter {
    fn new(limit: usize) -> Self {
        Self {
            checks: AtomicUsize::new(0),
            limit,
        }
    }
}

impl StopSignal for StopAfter {
    fn should_stop(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst) >= self.limit
    }
}

/// a1 and a3 unassigned, a2 and a4 in wallet 5, a5 in wallet 7, a6 in
/// wallet 8. T1 spends a1; T2 spends a2 and a3; T3 spends a4 and a5.
fn worked_example() -> (Chain, [AddressId; 6]) {
    let mut chain = Chain::new();
    let a1 = chain.address(1, 0);
    let a2 = chain.address(2, 5);
    let a3 = chain.address(3, 0);
    let a4 = chain.address(4, 5);
    let a5 = chain.address(5, 7);
    let a6 = chain.address(6, 8);
    let funded: Vec<_> = [a1, a2, a3, a4, a5].iter().map(|a| chain.fund(*a)).collect();
    chain.spend(&[funded[0]]);
    chain.spend(&[funded[1], funded[2]]);
    chain.spend(&[funded[3], funded[4]]);
    (chain, [a1, a2, a3, a4, a5, a6])
}

#[test]
fn worked_example_assigns_and_merges() {
    let (chain, [a1, a2, a3, a4, a5, a6]) = worked_example();
    let engine = chain.engine(2);
    let mut cursor = Cursor::Memory(1);

    let stats = engine.run(&mut cursor, &Never).unwrap();

    assert_eq!(chain.wallet_of(a1), 9, "fresh wallet above the highest row");
    assert_eq!(chain.wallet_of(a2), 5);
    assert_eq!(chain.wallet_of(a3), 5);
    assert_eq!(chain.wallet_of(a4), 5);
    assert_eq!(chain.wallet_of(a5), 5);
    assert_eq!(chain.wallet_of(a6), 8);
    assert!(engine.free_wallets().contains(7));
    assert!(chain.store.wallets().contains(&9));

    assert_eq!(stats.flagged, 3);
    assert_eq!(stats.new_wallets, 2);
    assert_eq!(stats.merged, 1);
    assert_eq!(cursor.position(), 9);
}

#[test]
fn merges_are_transitive_and_free_replaced_ids() {
    let mut chain = Chain::new();
    let a = chain.address(1, 1);
    let b = chain.address(2, 2);
    let c = chain.address(3, 3);
    let fa = chain.fund(a);
    let fb = chain.fund(b);
    let fb2 = chain.fund(b);
    let fc = chain.fund(c);
    chain.spend(&[fa, fb]);
    chain.spend(&[fb2, fc]);

    let engine = chain.engine(100);
    engine.run(&mut Cursor::Memory(1), &Never).unwrap();

    for address in [a, b, c] {
        assert_eq!(chain.wallet_of(address), 1);
    }
    assert!(engine.free_wallets().contains(2));
    assert!(engine.free_wallets().contains(3));
}

#[test]
fn freed_wallet_is_reused_before_allocating() {
    let mut chain = Chain::new();
    let a = chain.address(1, 5);
    let b = chain.address(2, 7);
    let c = chain.address(3, 0);
    let fa = chain.fund(a);
    let fb = chain.fund(b);
    let fc = chain.fund(c);
    chain.spend(&[fa, fb]);
    chain.spend(&[fc]);

    let engine = chain.engine(100);
    let stats = engine.run(&mut Cursor::Memory(1), &Never).unwrap();

    assert_eq!(chain.wallet_of(b), 5);
    assert_eq!(chain.wallet_of(c), 7);
    assert!(engine.free_wallets().is_empty());
    assert_eq!(chain.store.wallets().into_iter().collect::<Vec<_>>(), vec![5, 7]);
    assert_eq!(stats.new_wallets, 1);
    assert_eq!(stats.merged, 1);
}

#[test]
fn consistent_transactions_cause_no_writes() {
    let mut chain = Chain::new();
    let a = chain.address(1, 4);
    let b = chain.address(2, 4);
    let fa = chain.fund(a);
    let fb = chain.fund(b);
    chain.spend(&[fa, fb]);

    let engine = chain.engine(100);
    let stats = engine.run(&mut Cursor::Memory(1), &Never).unwrap();

    assert_eq!(stats.transactions, 1);
    assert_eq!(stats.flagged, 0);
    assert_eq!(chain.store.batches(), 0);
}

#[test]
fn second_pass_finds_nothing_to_do() {
    let (chain, addresses) = worked_example();
    chain.engine(2).run(&mut Cursor::Memory(1), &Never).unwrap();
    let before: Vec<WalletId> = addresses.iter().map(|a| chain.wallet_of(*a)).collect();

    let engine = chain.engine(2);
    let stats = engine.run(&mut Cursor::Memory(1), &Never).unwrap();

    assert_eq!(stats.flagged, 0);
    let after: Vec<WalletId> = addresses.iter().map(|a| chain.wallet_of(*a)).collect();
    assert_eq!(before, after);
    // Wallet 7 lost its last address in the first pass.
    assert!(engine.free_wallets().contains(7));
}

#[test]
fn interrupted_run_resumes_to_the_same_result() {
    let (reference, addresses) = worked_example();
    reference.engine(1).run(&mut Cursor::Memory(1), &Never).unwrap();

    let (chain, _) = worked_example();
    let mut cursor = Cursor::Memory(1);
    // Seven single-transaction batches: stops right before T3.
    chain.engine(1).run(&mut cursor, &StopAfter::new(7)).unwrap();
    assert_eq!(cursor.position(), 8);
    assert_eq!(chain.wallet_of(addresses[4]), 7, "T3 not processed yet");

    chain.engine(1).run(&mut cursor, &Never).unwrap();
    for address in addresses {
        assert_eq!(chain.wallet_of(address), reference.wallet_of(address));
    }
}

#[test]
fn failed_flush_leaves_cursor_in_place() {
    let mut chain = Chain::new();
    let a = chain.address(1, 0);
    let fa = chain.fund(a);
    chain.spend(&[fa]);
    chain.store.fail_next_batch();

    let mut cursor = Cursor::Memory(1);
    let result = chain.engine(10).run(&mut cursor, &Never);
    assert!(matches!(result, Err(WalletError::Store(_))));
    assert_eq!(cursor.position(), 1);

    chain.engine(10).run(&mut cursor, &Never).unwrap();
    assert_ne!(chain.wallet_of(a), UNASSIGNED_WALLET);
    assert_eq!(cursor.position(), 11);
}

#[test]
fn unresolvable_inputs_are_skipped() {
    let mut chain = Chain::new();
    let unpaid = chain.fund(0);
    chain.spend(&[(999, 0), unpaid]);

    let stats = chain.engine(10).run(&mut Cursor::Memory(1), &Never).unwrap();
    assert_eq!(stats.transactions, 1);
    assert_eq!(stats.flagged, 0);
    assert_eq!(stats.skipped, 1);
}

#[test]
fn resolution_follows_transaction_order() {
    let mut chain = Chain::new();
    let addresses: Vec<AddressId> = (1..=40).map(|seq| chain.address(seq, 0)).collect();
    let funded: Vec<_> = addresses.iter().map(|a| chain.fund(*a)).collect();
    for spent in &funded {
        chain.spend(&[*spent]);
    }

    chain.engine(1_000).run(&mut Cursor::Memory(1), &Never).unwrap();

    let wallets: Vec<WalletId> = addresses.iter().map(|a| chain.wallet_of(*a)).collect();
    assert_eq!(wallets, (1..=40).collect::<Vec<_>>());
}

#[test]
fn reconcile_records_missing_rows_and_pools_unused_ones() {
    let chain = Chain::new();
    chain.address(1, 3);
    chain.store.put_wallet(6);
    chain.store.put_address(Address {
        address_id: AddressType::P2sh.id_base() + 1,
        address: vec![9; 20],
        wallet_id: 4,
    });

    let engine = chain.engine(10);
    engine.reconcile().unwrap();

    assert!(chain.store.wallets().contains(&4));
    assert!(engine.free_wallets().contains(6));
    assert!(!engine.free_wallets().contains(3));
}

#[test]
fn invalid_merges_are_rejected() {
    let chain = Chain::new();
    let engine = chain.engine(10);
    assert!(matches!(
        engine.merge(3, 3),
        Err(WalletError::InvalidMerge { keep: 3, replace: 3 })
    ));
    assert!(matches!(
        engine.merge(0, 4),
        Err(WalletError::InvalidMerge { .. })
    ));
    assert!(matches!(
        engine.merge(4, 0),
        Err(WalletError::InvalidMerge { .. })
    ));
}
