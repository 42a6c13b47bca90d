//! Statement layer integration tests.
//!
//! Covers the statement lifecycle end to end:
//! - Layout and size of every constructor
//! - UPSERT to REPLACE transform
//! - Surrogate DELETE projection
//! - Key extraction, plain and multikey
//! - Format reference counting across threads
//! - Region statements
//! - Bloom filters over statements

use rmp::encode;
use std::sync::Arc;
use std::thread;

use tessera_common::{StmtEnvConfig, StmtFlags, StmtType, TesseraError};
use tessera_stmt::{
    bloom_builder_add, bloom_maybe_has, extract_key, extract_key_raw, msgpack, Cord, ExecContext,
    FieldType, FuncCache, KeyDef, KeyPart, MainCord, Stmt, StmtEntry, StmtEnv, StmtHeader,
    TupleBloomBuilder, TupleFormat,
};

// =============================================================================
// Helpers
// =============================================================================

fn env(main: &MainCord) -> StmtEnv {
    StmtEnv::new(StmtEnvConfig::default(), Arc::new(FuncCache::new()), main).unwrap()
}

fn primary() -> Arc<KeyDef> {
    Arc::new(KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]).unwrap())
}

/// Secondary key on the second element of field 2.
fn nested_secondary() -> Arc<KeyDef> {
    Arc::new(
        KeyDef::new(vec![KeyPart::new(2, FieldType::Unsigned)
            .with_path("[2]")
            .unwrap()])
        .unwrap(),
    )
}

fn multikey_secondary() -> Arc<KeyDef> {
    Arc::new(
        KeyDef::new(vec![KeyPart::new(1, FieldType::Unsigned)
            .with_path("[*]")
            .unwrap()])
        .unwrap(),
    )
}

/// [1, "skip", [10, 20, 30], "tail"]
fn wide_tuple() -> Vec<u8> {
    let mut buf = Vec::new();
    encode::write_array_len(&mut buf, 4).unwrap();
    encode::write_uint(&mut buf, 1).unwrap();
    encode::write_str(&mut buf, "skip").unwrap();
    encode::write_array_len(&mut buf, 3).unwrap();
    for v in [10, 20, 30] {
        encode::write_uint(&mut buf, v).unwrap();
    }
    encode::write_str(&mut buf, "tail").unwrap();
    buf
}

/// [id, name]
fn pair(id: u64, name: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    encode::write_array_len(&mut buf, 2).unwrap();
    encode::write_uint(&mut buf, id).unwrap();
    encode::write_str(&mut buf, name).unwrap();
    buf
}

/// [["+", 2, 1]]
fn add_op() -> Vec<u8> {
    let mut buf = Vec::new();
    encode::write_array_len(&mut buf, 1).unwrap();
    encode::write_array_len(&mut buf, 3).unwrap();
    encode::write_str(&mut buf, "+").unwrap();
    encode::write_uint(&mut buf, 2).unwrap();
    encode::write_uint(&mut buf, 1).unwrap();
    buf
}

fn assert_layout(stmt: &Stmt, format: &TupleFormat, payload: usize) {
    let view = stmt.view();
    assert_eq!(
        stmt.size(),
        StmtHeader::SIZE + format.field_map_size() as usize + payload
    );
    assert_eq!(
        view.data_offset() as usize,
        StmtHeader::SIZE + format.field_map_size() as usize
    );
    assert_eq!(view.bsize() as usize, payload);
}

// =============================================================================
// Layout and constructors
// =============================================================================

#[test]
fn test_constructors_share_one_layout() {
    let main = MainCord::new();
    let env = env(&main);
    let format = env
        .format_new(&main, &[primary(), nested_secondary()])
        .unwrap();
    assert_eq!(format.field_map_size(), 4);

    let mut ctx = ExecContext::main(&main);
    let tuple = wide_tuple();
    let ops = add_op();

    let insert = Stmt::new_insert(&mut ctx, &format, &tuple).unwrap();
    let replace = Stmt::new_replace(&mut ctx, &format, &tuple).unwrap();
    let delete = Stmt::new_delete(&mut ctx, &format, &tuple).unwrap();
    let upsert = Stmt::new_upsert(&mut ctx, &format, &tuple, &[&ops]).unwrap();

    for stmt in [&insert, &replace, &delete] {
        assert_layout(stmt, &format, tuple.len());
        assert_eq!(stmt.view().upsert_data(), &tuple[..]);
    }
    assert_layout(&upsert, &format, tuple.len() + ops.len());
    assert_eq!(upsert.view().upsert_data(), &tuple[..]);
    assert_eq!(upsert.view().upsert_ops(), &ops[..]);

    assert_eq!(insert.stmt_type(), StmtType::Insert);
    assert_eq!(replace.stmt_type(), StmtType::Replace);
    assert_eq!(delete.stmt_type(), StmtType::Delete);
    assert_eq!(upsert.stmt_type(), StmtType::Upsert);
    assert_eq!(insert.lsn(), 0);
    assert!(insert.flags().is_empty());
}

#[test]
fn test_field_access_through_field_map() {
    let main = MainCord::new();
    let env = env(&main);
    let secondary = nested_secondary();
    let format = env.format_new(&main, &[primary(), secondary.clone()]).unwrap();
    let mut ctx = ExecContext::main(&main);

    let stmt = env.tuple_new(&mut ctx, &format, &wide_tuple()).unwrap();
    let view = stmt.view();
    assert_eq!(view.field_count().unwrap(), 4);
    assert_eq!(msgpack::to_string(view.field(1).unwrap().unwrap()), "\"skip\"");
    assert!(view.field(9).unwrap().is_none());
    let part = &secondary.parts()[0];
    assert_eq!(
        msgpack::to_string(view.field_by_part(part, None).unwrap().unwrap()),
        "20"
    );
}

#[test]
fn test_tuple_new_validates() {
    let main = MainCord::new();
    let env = env(&main);
    let format = env
        .format_new(&main, &[primary(), nested_secondary()])
        .unwrap();
    let mut ctx = ExecContext::main(&main);

    let mut short = Vec::new();
    encode::write_array_len(&mut short, 1).unwrap();
    encode::write_uint(&mut short, 1).unwrap();
    assert!(matches!(
        env.tuple_new(&mut ctx, &format, &short),
        Err(TesseraError::MinFieldCount { expected: 3, actual: 1 })
    ));

    let mut mistyped = Vec::new();
    encode::write_array_len(&mut mistyped, 3).unwrap();
    encode::write_str(&mut mistyped, "one").unwrap();
    encode::write_nil(&mut mistyped).unwrap();
    encode::write_array_len(&mut mistyped, 0).unwrap();
    let err = env.tuple_new(&mut ctx, &format, &mistyped).unwrap_err();
    assert!(matches!(err, TesseraError::FieldType { .. }));
    assert!(err.is_client_error());

    let mut scalar = Vec::new();
    encode::write_uint(&mut scalar, 1).unwrap();
    assert!(env.tuple_new(&mut ctx, &format, &scalar).is_err());
}

#[test]
fn test_max_tuple_size_rejected() {
    let main = MainCord::new();
    let config = StmtEnvConfig {
        max_tuple_size: 64,
        ..Default::default()
    };
    let env = StmtEnv::new(config, Arc::new(FuncCache::new()), &main).unwrap();
    let format = env.format_new(&main, &[primary()]).unwrap();
    let mut ctx = ExecContext::main(&main);

    assert!(Stmt::new_replace(&mut ctx, &format, &pair(1, "a")).is_ok());
    let long = "x".repeat(64);
    assert!(matches!(
        Stmt::new_replace(&mut ctx, &format, &pair(1, &long)),
        Err(TesseraError::MaxTupleSize { max: 64, .. })
    ));
}

#[test]
fn test_setters_require_exclusive_stmt() {
    let main = MainCord::new();
    let env = env(&main);
    let format = env.format_new(&main, &[primary()]).unwrap();
    let mut ctx = ExecContext::main(&main);

    let mut stmt = Stmt::new_replace(&mut ctx, &format, &pair(1, "a")).unwrap();
    stmt.set_lsn(10).unwrap();
    let mut flags = StmtFlags::empty();
    flags.set(StmtFlags::DEFERRED_DELETE, true);
    stmt.set_flags(flags).unwrap();
    assert_eq!(stmt.lsn(), 10);
    assert!(stmt.flags().contains(StmtFlags::DEFERRED_DELETE));

    let shared = stmt.clone();
    assert_eq!(stmt.refs(), 2);
    assert!(matches!(
        stmt.set_lsn(11),
        Err(TesseraError::StmtShared { refs: 2 })
    ));
    drop(shared);
    stmt.set_type(StmtType::Delete).unwrap();
    assert_eq!(stmt.stmt_type(), StmtType::Delete);
}

#[test]
fn test_display() {
    let main = MainCord::new();
    let env = env(&main);
    let format = env.format_new(&main, &[primary()]).unwrap();
    let mut ctx = ExecContext::main(&main);

    let mut replace = Stmt::new_replace(&mut ctx, &format, &pair(1, "a")).unwrap();
    replace.set_lsn(10).unwrap();
    assert_eq!(replace.to_string(), "REPLACE([1, \"a\"], lsn=10)");

    let mut one = Vec::new();
    encode::write_array_len(&mut one, 1).unwrap();
    encode::write_uint(&mut one, 1).unwrap();
    let mut upsert = Stmt::new_upsert(&mut ctx, &format, &one, &[&add_op()]).unwrap();
    upsert.set_lsn(3).unwrap();
    assert_eq!(upsert.to_string(), "UPSERT([1], ops=[[\"+\", 2, 1]], lsn=3)");
}

// =============================================================================
// Transforms
// =============================================================================

#[test]
fn test_replace_from_upsert() {
    let main = MainCord::new();
    let env = env(&main);
    let format = env
        .format_new(&main, &[primary(), nested_secondary()])
        .unwrap();
    let mut ctx = ExecContext::main(&main);
    let tuple = wide_tuple();

    let mut upsert = Stmt::new_upsert(&mut ctx, &format, &tuple, &[&add_op()]).unwrap();
    upsert.set_lsn(42).unwrap();
    let mut flags = StmtFlags::empty();
    flags.set(StmtFlags::UPDATE, true);
    upsert.set_flags(flags).unwrap();

    let replace = upsert.replace_from_upsert(ctx.cord()).unwrap();
    assert_eq!(replace.stmt_type(), StmtType::Replace);
    assert_eq!(replace.lsn(), 42);
    assert!(replace.flags().is_empty());
    assert_eq!(replace.view().data(), &tuple[..]);
    assert!(replace.view().upsert_ops().is_empty());
    assert_layout(&replace, &format, tuple.len());
    assert_eq!(replace.view().field_map().get(0), upsert.view().field_map().get(0));

    assert!(matches!(
        replace.replace_from_upsert(ctx.cord()),
        Err(TesseraError::Internal(_))
    ));
}

#[test]
fn test_surrogate_delete_keeps_indexed_fields() {
    let main = MainCord::new();
    let env = env(&main);
    let secondary = nested_secondary();
    let format = env.format_new(&main, &[primary(), secondary.clone()]).unwrap();
    let mut ctx = ExecContext::main(&main);

    let mut replace = Stmt::new_replace(&mut ctx, &format, &wide_tuple()).unwrap();
    replace.set_lsn(7).unwrap();
    let delete = replace.new_surrogate_delete(&mut ctx).unwrap();

    assert_eq!(delete.stmt_type(), StmtType::Delete);
    assert_eq!(delete.lsn(), 0);
    assert_eq!(
        msgpack::to_string(delete.view().data()),
        "[1, null, [null, 20]]"
    );
    let part = &secondary.parts()[0];
    assert_eq!(
        delete.view().field_by_part(part, None).unwrap(),
        replace.view().field_by_part(part, None).unwrap()
    );
    assert_layout(&delete, &format, delete.view().bsize() as usize);
    assert_eq!(ctx.region_used(), 0);
}

#[test]
fn test_surrogate_delete_maps_and_multikey() {
    let main = MainCord::new();
    let env = env(&main);
    let by_name = Arc::new(
        KeyDef::new(vec![KeyPart::new(2, FieldType::String)
            .with_path(".name")
            .unwrap()])
        .unwrap(),
    );
    let format = env
        .format_new(&main, &[primary(), multikey_secondary(), by_name])
        .unwrap();
    let mut ctx = ExecContext::main(&main);

    // [5, [1, 2, 3], {"name": "n", "age": 30}, "extra"]
    let mut tuple = Vec::new();
    encode::write_array_len(&mut tuple, 4).unwrap();
    encode::write_uint(&mut tuple, 5).unwrap();
    encode::write_array_len(&mut tuple, 3).unwrap();
    for v in [1, 2, 3] {
        encode::write_uint(&mut tuple, v).unwrap();
    }
    encode::write_map_len(&mut tuple, 2).unwrap();
    encode::write_str(&mut tuple, "name").unwrap();
    encode::write_str(&mut tuple, "n").unwrap();
    encode::write_str(&mut tuple, "age").unwrap();
    encode::write_uint(&mut tuple, 30).unwrap();
    encode::write_str(&mut tuple, "extra").unwrap();

    let delete = tessera_stmt::new_surrogate_delete_raw(&mut ctx, &format, &tuple).unwrap();
    assert_eq!(
        msgpack::to_string(delete.view().data()),
        "[5, [1, 2, 3], {\"name\": \"n\", null: null}]"
    );
}

// =============================================================================
// Key extraction
// =============================================================================

#[test]
fn test_extract_key_statement() {
    let main = MainCord::new();
    let env = env(&main);
    let secondary = nested_secondary();
    let format = env.format_new(&main, &[primary(), secondary.clone()]).unwrap();
    let mut ctx = ExecContext::main(&main);
    let stmt = Stmt::new_replace(&mut ctx, &format, &wide_tuple()).unwrap();

    let key = extract_key(&mut ctx, &stmt, &secondary, env.key_format(), None).unwrap();
    assert!(key.is_key());
    assert_eq!(key.view().data_offset() as usize, StmtHeader::SIZE);
    assert_eq!(msgpack::to_string(key.view().data()), "[20]");
    assert_eq!(ctx.region_used(), 0);

    let raw = extract_key_raw(&mut ctx, &wide_tuple(), &primary(), env.key_format(), None).unwrap();
    assert_eq!(msgpack::to_string(raw.view().data()), "[1]");
}

#[test]
fn test_multikey_extraction_per_index() {
    let main = MainCord::new();
    let env = env(&main);
    let multikey = multikey_secondary();
    let format = env.format_new(&main, &[primary(), multikey.clone()]).unwrap();
    let mut ctx = ExecContext::main(&main);

    // [9, [4, 5, 6]]
    let mut tuple = Vec::new();
    encode::write_array_len(&mut tuple, 2).unwrap();
    encode::write_uint(&mut tuple, 9).unwrap();
    encode::write_array_len(&mut tuple, 3).unwrap();
    for v in [4, 5, 6] {
        encode::write_uint(&mut tuple, v).unwrap();
    }
    let stmt = Stmt::new_replace(&mut ctx, &format, &tuple).unwrap();

    let keys: Vec<String> = (0..3)
        .map(|i| {
            let key = extract_key(&mut ctx, &stmt, &multikey, env.key_format(), Some(i)).unwrap();
            msgpack::to_string(key.view().data())
        })
        .collect();
    assert_eq!(keys, vec!["[4]", "[5]", "[6]"]);

    assert!(matches!(
        extract_key(&mut ctx, &stmt, &multikey, env.key_format(), None),
        Err(TesseraError::MultikeyIndexRequired)
    ));
    let past_end = extract_key(&mut ctx, &stmt, &multikey, env.key_format(), Some(3)).unwrap();
    assert_eq!(msgpack::to_string(past_end.view().data()), "[null]");
}

// =============================================================================
// Reference counting
// =============================================================================

#[test]
fn test_format_pinned_by_main_thread_stmts() {
    let main = MainCord::new();
    let env = env(&main);
    let format = env.format_new(&main, &[primary()]).unwrap();
    let mut ctx = ExecContext::main(&main);
    assert_eq!(format.refs(), 0);

    let a = Stmt::new_replace(&mut ctx, &format, &pair(1, "a")).unwrap();
    let b = a.dup(ctx.cord()).unwrap();
    assert!(a.is_pinned());
    assert_eq!(format.refs(), 2);
    assert_eq!(a.refs(), 1);
    assert!(!a.ptr_eq(&b));

    drop(a);
    assert_eq!(format.refs(), 1);
    drop(b);
    assert_eq!(format.refs(), 0);
    // Unpinned but still held: the id stays bound.
    let id = format.id();
    assert!(Arc::ptr_eq(&env.registry().get(id).unwrap(), &format));
    drop(format);
    assert!(env.registry().get(id).is_none());
}

#[test]
fn test_format_id_stable_while_referenced() {
    let main = MainCord::new();
    let env = env(&main);
    let first = env.format_new(&main, &[primary()]).unwrap();

    let worker_format = first.clone();
    let worker_stmt = thread::spawn(move || {
        let mut ctx = ExecContext::worker();
        Stmt::new_replace(&mut ctx, &worker_format, &pair(1, "w")).unwrap()
    })
    .join()
    .unwrap();
    let mut ctx = ExecContext::main(&main);
    drop(Stmt::new_replace(&mut ctx, &first, &pair(2, "m")).unwrap());
    assert_eq!(first.refs(), 0);
    drop(first);

    let second = env.format_new(&main, &[primary()]).unwrap();
    let stmt_format_id = worker_stmt.view().header().format_id;
    assert_ne!(second.id(), stmt_format_id);
    let found = env.registry().get(stmt_format_id).unwrap();
    assert!(Arc::ptr_eq(&found, worker_stmt.format()));

    // Once the last statement goes, the id is handed out again.
    drop(found);
    drop(worker_stmt);
    assert!(env.registry().get(stmt_format_id).is_none());
    let third = env.format_new(&main, &[primary()]).unwrap();
    assert_eq!(third.id(), stmt_format_id);
}

#[test]
fn test_worker_stmts_do_not_pin() {
    let main = MainCord::new();
    let env = env(&main);
    let format = env.format_new(&main, &[primary()]).unwrap();

    let worker_format = format.clone();
    let stmt = thread::spawn(move || {
        let mut ctx = ExecContext::worker();
        Stmt::new_replace(&mut ctx, &worker_format, &pair(1, "w")).unwrap()
    })
    .join()
    .unwrap();
    assert!(!stmt.is_pinned());
    assert_eq!(format.refs(), 0);
    drop(stmt);
    assert_eq!(format.pending_releases(), 0);
}

#[test]
fn test_release_off_main_thread_is_deferred() {
    let main = MainCord::new();
    let env = env(&main);
    let format = env.format_new(&main, &[primary()]).unwrap();
    let mut ctx = ExecContext::main(&main);

    let keep = Stmt::new_replace(&mut ctx, &format, &pair(1, "a")).unwrap();
    let handed = Stmt::new_replace(&mut ctx, &format, &pair(2, "b")).unwrap();
    assert_eq!(format.refs(), 2);

    thread::spawn(move || drop(handed)).join().unwrap();
    assert_eq!(format.refs(), 2);
    assert_eq!(format.pending_releases(), 1);

    assert_eq!(format.reclaim(&main), 1);
    assert_eq!(format.refs(), 1);
    assert_eq!(format.pending_releases(), 0);
    drop(keep);
    assert_eq!(format.refs(), 0);
}

#[test]
fn test_region_stmt() {
    let main = MainCord::new();
    let env = env(&main);
    let format = env.format_new(&main, &[primary()]).unwrap();
    let mut ctx = ExecContext::main(&main);
    let region = env.lsregion();

    let mut upsert = Stmt::new_upsert(&mut ctx, &format, &pair(1, "a"), &[&add_op()]).unwrap();
    upsert.set_lsn(5).unwrap();
    let copy = upsert.dup_region(&region, 5).unwrap();
    assert_eq!(copy.refs(), 0);
    assert_eq!(copy.upsert_counter(), Some(0));
    assert_eq!(copy.alloc_size(), upsert.size() + 1);
    assert_eq!(copy.view().raw(), upsert.view().raw());
    assert_eq!(copy.to_string(), upsert.to_string());

    let replace = Stmt::new_replace(&mut ctx, &format, &pair(2, "b")).unwrap();
    let plain = replace.dup_region(&region, 6).unwrap();
    assert_eq!(plain.upsert_counter(), None);
    assert_eq!(plain.alloc_size(), replace.size());
    assert_eq!(plain.alloc_id(), 6);
    // Region copies do not hold format references.
    assert_eq!(format.refs(), 2);
}

#[test]
fn test_cord_accessors() {
    let main = MainCord::new();
    assert_eq!(main.thread(), thread::current().id());
    let ctx = ExecContext::main(&main);
    assert!(ctx.cord().is_main());
    assert!(!Cord::Worker.is_main());
}

// =============================================================================
// Bloom filters
// =============================================================================

#[test]
fn test_bloom_over_statements_and_keys() {
    let main = MainCord::new();
    let env = env(&main);
    let pk = primary();
    let format = env.format_new(&main, &[pk.clone()]).unwrap();
    let mut ctx = ExecContext::main(&main);

    let mut builder = TupleBloomBuilder::new(pk.part_count());
    for id in 0..50 {
        let stmt = Stmt::new_replace(&mut ctx, &format, &pair(id * 2, "v")).unwrap();
        bloom_builder_add(&mut builder, StmtEntry::new(&stmt), &pk).unwrap();
    }
    let bloom = builder.build(env.config().bloom_fpr).unwrap();

    for id in 0..50 {
        let stmt = Stmt::new_replace(&mut ctx, &format, &pair(id * 2, "other")).unwrap();
        assert!(bloom_maybe_has(&bloom, StmtEntry::new(&stmt), &pk).unwrap());
        let key = extract_key(&mut ctx, &stmt, &pk, env.key_format(), None).unwrap();
        assert!(bloom_maybe_has(&bloom, StmtEntry::new(&key), &pk).unwrap());
    }
}
