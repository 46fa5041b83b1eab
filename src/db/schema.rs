// Kept in sync with migrations/2024-05-01-000000_create_scanner_tables by hand.

diesel::table! {
    block (height) {
        height -> Int4,
        hash -> Bytea,
        txn_count -> Int4,
    }
}

diesel::table! {
    transaction (id) {
        id -> Int4,
        txid -> Bytea,
        block_height -> Int4,
        n_inputs -> Int4,
        n_outputs -> Int4,
    }
}

diesel::table! {
    output (transaction_id, pos) {
        transaction_id -> Int4,
        pos -> Int2,
        address_id -> Int8,
        amount -> Int8,
        spent_status -> Int2,
    }
}

diesel::table! {
    input (transaction_id, pos) {
        transaction_id -> Int4,
        pos -> Int2,
        in_transaction_id -> Int4,
        in_pos -> Int2,
    }
}

diesel::table! {
    wallet (id) {
        id -> Int4,
    }
}

// The four per-type address tables (address_p2pkh, address_p2sh,
// address_p2wpkh, address_p2wsh) share one layout and are queried by name.

diesel::joinable!(output -> transaction (transaction_id));
diesel::joinable!(input -> transaction (transaction_id));

diesel::allow_tables_to_appear_in_same_query!(
    block,
    input,
    output,
    transaction,
    wallet,
);
