//! End-to-end tests for the generic key commands, driven through `CommandHandler`
//! against a real shard set with a virtual clock.

use bytes::Bytes;
use shardkv::commands::CommandHandler;
use shardkv::config::EngineConfig;
use shardkv::engine::ShardSet;
use shardkv::reply::Reply;
use shardkv::storage::Clock;
use std::collections::BTreeSet;
use std::sync::Arc;

const EXPIRE_NOW: u64 = 1_700_000_000_000;

fn create_handler(shards: usize) -> (Clock, CommandHandler) {
    let clock = Clock::manual(EXPIRE_NOW);
    let config = EngineConfig {
        shards,
        scan_slots: 64,
        ..EngineConfig::default()
    };
    let set = ShardSet::new(&config, clock.clone()).unwrap();
    (clock, CommandHandler::new(Arc::new(set)))
}

fn argv<S: AsRef<[u8]>>(args: &[S]) -> Vec<Bytes> {
    args.iter()
        .map(|a| Bytes::copy_from_slice(a.as_ref()))
        .collect()
}

async fn run<S: AsRef<[u8]>>(handler: &mut CommandHandler, args: &[S]) -> Reply {
    handler.execute(argv(args)).await
}

async fn checked_int<S: AsRef<[u8]>>(handler: &mut CommandHandler, args: &[S]) -> i64 {
    let reply = run(handler, args).await;
    reply
        .as_integer()
        .unwrap_or_else(|| panic!("expected integer reply, got {:?}", reply))
}

fn bulk(s: &str) -> Reply {
    Reply::bulk(Bytes::from(s.to_string()))
}

fn strings(reply: &Reply) -> Vec<String> {
    reply
        .as_array()
        .unwrap_or_else(|| panic!("expected array reply, got {:?}", reply))
        .iter()
        .map(|r| String::from_utf8(r.as_bytes().unwrap().to_vec()).unwrap())
        .collect()
}

fn distinct_shards(handler: &CommandHandler, keys: &[&str]) -> usize {
    keys.iter()
        .map(|k| handler.shard_set().route_key(k.as_bytes()))
        .collect::<BTreeSet<_>>()
        .len()
}

/// Runs SCAN to completion and returns every key it reported.
async fn scan_all(handler: &mut CommandHandler, options: &[&str]) -> Vec<String> {
    let mut cursor = "0".to_string();
    let mut keys = Vec::new();
    loop {
        let mut args = vec!["scan".to_string(), cursor.clone()];
        args.extend(options.iter().map(|s| s.to_string()));
        let reply = run(handler, &args).await;
        let parts = reply.as_array().expect("scan replies with an array");
        assert_eq!(parts.len(), 2);
        cursor = String::from_utf8(parts[0].as_bytes().unwrap().to_vec()).unwrap();
        keys.extend(strings(&parts[1]));
        if cursor == "0" {
            return keys;
        }
    }
}

#[tokio::test]
async fn test_expire() {
    let (clock, mut h) = create_handler(4);

    run(&mut h, &["set", "key", "val"]).await;
    assert_eq!(checked_int(&mut h, &["expire", "key", "1"]).await, 1);
    clock.set_virtual_now(EXPIRE_NOW + 1000);
    assert!(run(&mut h, &["get", "key"]).await.is_nil());

    run(&mut h, &["set", "key", "val"]).await;
    let at = (EXPIRE_NOW + 2000).to_string();
    assert_eq!(checked_int(&mut h, &["pexpireat", "key", at.as_str()]).await, 1);

    // override
    let at = (EXPIRE_NOW + 3000).to_string();
    assert_eq!(checked_int(&mut h, &["pexpireat", "key", at.as_str()]).await, 1);

    clock.set_virtual_now(EXPIRE_NOW + 2999);
    assert_eq!(run(&mut h, &["get", "key"]).await, bulk("val"));

    clock.set_virtual_now(EXPIRE_NOW + 3000);
    assert!(run(&mut h, &["get", "key"]).await.is_nil());
}

#[tokio::test]
async fn test_expire_missing_and_past_deadline() {
    let (_clock, mut h) = create_handler(4);

    assert_eq!(checked_int(&mut h, &["expire", "missing", "10"]).await, 0);

    run(&mut h, &["set", "key", "val"]).await;
    assert_eq!(checked_int(&mut h, &["expire", "key", "-1"]).await, 1);
    assert_eq!(checked_int(&mut h, &["exists", "key"]).await, 0);

    run(&mut h, &["set", "key", "val"]).await;
    let past = (EXPIRE_NOW / 1000 - 10).to_string();
    assert_eq!(checked_int(&mut h, &["expireat", "key", past.as_str()]).await, 1);
    assert!(run(&mut h, &["get", "key"]).await.is_nil());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_del() {
    const PAIRS: usize = 2000;
    let (_clock, mut h) = create_handler(4);
    for i in 0..PAIRS {
        run(&mut h, &["set".to_string(), format!("foo{}", i), "1".into()]).await;
        run(&mut h, &["set".to_string(), format!("bar{}", i), "1".into()]).await;
    }
    assert_eq!(checked_int(&mut h, &["dbsize"]).await, 2 * PAIRS as i64);

    let set = Arc::clone(h.shard_set());
    let exists_task = tokio::spawn({
        let mut h = CommandHandler::new(Arc::clone(&set));
        async move {
            for i in 0..PAIRS {
                let found = checked_int(
                    &mut h,
                    &["exists".to_string(), format!("foo{}", i), format!("bar{}", i)],
                )
                .await;
                assert!(found == 0 || found == 2, "{} at {}", found, i);
            }
        }
    });
    let del_task = tokio::spawn({
        let mut h = CommandHandler::new(Arc::clone(&set));
        async move {
            for i in 0..PAIRS {
                let removed = checked_int(
                    &mut h,
                    &["del".to_string(), format!("foo{}", i), format!("bar{}", i)],
                )
                .await;
                assert_eq!(removed, 2, "at {}", i);
            }
        }
    });

    exists_task.await.unwrap();
    del_task.await.unwrap();
    assert_eq!(checked_int(&mut h, &["dbsize"]).await, 0);
    assert_eq!(checked_int(&mut h, &["del", "foo0", "bar0"]).await, 0);
}

#[tokio::test]
async fn test_ttl() {
    let (clock, mut h) = create_handler(4);
    assert_eq!(checked_int(&mut h, &["ttl", "foo"]).await, -2);
    assert_eq!(checked_int(&mut h, &["pttl", "foo"]).await, -2);
    run(&mut h, &["set", "foo", "bar"]).await;
    assert_eq!(checked_int(&mut h, &["ttl", "foo"]).await, -1);
    assert_eq!(checked_int(&mut h, &["pttl", "foo"]).await, -1);

    run(&mut h, &["pexpire", "foo", "10000"]).await;
    clock.advance(std::time::Duration::from_millis(2_400));
    assert_eq!(checked_int(&mut h, &["pttl", "foo"]).await, 7_600);
    assert_eq!(checked_int(&mut h, &["ttl", "foo"]).await, 8);
}

#[tokio::test]
async fn test_exists() {
    let (_clock, mut h) = create_handler(4);
    run(&mut h, &["mset", "x", "0", "y", "1"]).await;
    assert_eq!(checked_int(&mut h, &["exists", "x", "y", "x"]).await, 3);
    assert_eq!(checked_int(&mut h, &["exists", "nope", "x"]).await, 1);
}

#[tokio::test]
async fn test_rename() {
    let (_clock, mut h) = create_handler(4);
    let b_val = "b".repeat(32);
    let x_val = "x".repeat(32);

    let reply = run(&mut h, &["mset", "x", x_val.as_str(), "b", b_val.as_str()]).await;
    assert_eq!(reply, Reply::ok());
    let expected_shards = distinct_shards(&h, &["x", "b"]);
    assert_eq!(h.last_debug_info().unwrap().shards_count, expected_shards);

    let reply = run(&mut h, &["rename", "z", "b"]).await;
    assert_eq!(reply, Reply::error("ERR no such key"));
    assert_eq!(run(&mut h, &["get", "b"]).await, bulk(&b_val));

    assert_eq!(run(&mut h, &["rename", "x", "b"]).await, Reply::ok());
    assert_eq!(h.last_debug_info().unwrap().shards_count, expected_shards);
    assert!(run(&mut h, &["get", "x"]).await.is_nil());
    assert_eq!(run(&mut h, &["get", "b"]).await, bulk(&x_val));
    assert_eq!(checked_int(&mut h, &["exists", "x", "b"]).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rename_concurrent_with_exists() {
    let (_clock, mut h) = create_handler(4);
    run(&mut h, &["set", "b", "v"]).await;

    let set = Arc::clone(h.shard_set());
    let rename_task = tokio::spawn({
        let mut h = CommandHandler::new(Arc::clone(&set));
        async move {
            let keys = ["b", "x"];
            for i in 0..2000 {
                let j = i % 2;
                let reply = run(&mut h, &["rename", keys[j], keys[1 - j]]).await;
                assert_eq!(reply, Reply::ok(), "at {}", i);
            }
        }
    });
    let exists_task = tokio::spawn({
        let mut h = CommandHandler::new(Arc::clone(&set));
        async move {
            for i in 0..3000 {
                let found = checked_int(&mut h, &["exists", "x", "b"]).await;
                assert_eq!(found, 1, "at {}", i);
            }
        }
    });

    rename_task.await.unwrap();
    exists_task.await.unwrap();
    // An even number of renames ends where it started.
    assert_eq!(checked_int(&mut h, &["exists", "b"]).await, 1);
    assert_eq!(checked_int(&mut h, &["exists", "x"]).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cross_shard_rename_never_observed_half_done() {
    let (_clock, mut h) = create_handler(4);
    let src_shard = h.shard_set().route_key(b"src");
    let dst = (0..)
        .map(|i| format!("dst{}", i))
        .find(|k| h.shard_set().route_key(k.as_bytes()) != src_shard)
        .unwrap();
    run(&mut h, &["set", "src", "v"]).await;

    let set = Arc::clone(h.shard_set());
    let rename_task = tokio::spawn({
        let mut h = CommandHandler::new(Arc::clone(&set));
        let dst = dst.clone();
        async move {
            for i in 0..2000 {
                let (from, to) = if i % 2 == 0 {
                    ("src", dst.as_str())
                } else {
                    (dst.as_str(), "src")
                };
                let reply = run(&mut h, &["rename", from, to]).await;
                assert_eq!(reply, Reply::ok(), "at {}", i);
                assert_eq!(h.last_debug_info().unwrap().shards_count, 2);
            }
        }
    });
    let exists_task = tokio::spawn({
        let mut h = CommandHandler::new(Arc::clone(&set));
        let dst = dst.clone();
        async move {
            for i in 0..3000 {
                let found = checked_int(&mut h, &["exists", "src", dst.as_str()]).await;
                assert_eq!(found, 1, "at {}", i);
            }
        }
    });

    rename_task.await.unwrap();
    exists_task.await.unwrap();
    assert_eq!(run(&mut h, &["get", "src"]).await, bulk("v"));
}

#[tokio::test]
async fn test_rename_keeps_expiry() {
    let (clock, mut h) = create_handler(4);
    run(&mut h, &["set", "src", "v", "PX", "5000"]).await;
    assert_eq!(run(&mut h, &["rename", "src", "dst"]).await, Reply::ok());
    assert_eq!(checked_int(&mut h, &["pttl", "dst"]).await, 5000);

    clock.advance(std::time::Duration::from_millis(5000));
    assert!(run(&mut h, &["get", "dst"]).await.is_nil());
}

#[tokio::test]
async fn test_rename_non_string() {
    let (_clock, mut h) = create_handler(4);
    assert_eq!(checked_int(&mut h, &["lpush", "x", "elem"]).await, 1);
    assert_eq!(run(&mut h, &["rename", "x", "b"]).await, Reply::ok());
    assert_eq!(
        h.last_debug_info().unwrap().shards_count,
        distinct_shards(&h, &["x", "b"])
    );

    assert_eq!(checked_int(&mut h, &["del", "x"]).await, 0);
    assert_eq!(checked_int(&mut h, &["del", "b"]).await, 1);
}

#[tokio::test]
async fn test_rename_binary() {
    let (_clock, mut h) = create_handler(4);
    let key1: &[u8] = b"\x01\x02\x03\x04";
    let key2: &[u8] = b"\x05\x06\x07\x08";

    run(&mut h, &[b"set".as_slice(), key1, b"bar".as_slice()]).await;
    run(&mut h, &[b"rename".as_slice(), key1, key2]).await;
    assert!(run(&mut h, &[b"get".as_slice(), key1]).await.is_nil());
    assert_eq!(run(&mut h, &[b"get".as_slice(), key2]).await, bulk("bar"));
}

async fn populate_scan_fixture(h: &mut CommandHandler) {
    for i in 0..10 {
        run(h, &["set".to_string(), format!("key{}", i), "bar".into()]).await;
        run(h, &["set".to_string(), format!("str{}", i), "bar".into()]).await;
        run(h, &["sadd".to_string(), format!("set{}", i), "bar".into()]).await;
        run(h, &["zadd".to_string(), format!("zset{}", i), "0".into(), "bar".into()]).await;
    }
}

#[tokio::test]
async fn test_scan() {
    let (_clock, mut h) = create_handler(4);
    populate_scan_fixture(&mut h).await;

    let reply = run(&mut h, &["scan", "0", "count", "20", "type", "string"]).await;
    let parts = reply.as_array().unwrap();
    assert_eq!(parts.len(), 2);
    let first_batch = strings(&parts[1]);
    assert!(first_batch
        .iter()
        .all(|k| k.starts_with("str") || k.starts_with("key")));

    let strings_found: BTreeSet<String> = scan_all(&mut h, &["count", "20", "type", "string"])
        .await
        .into_iter()
        .collect();
    assert_eq!(strings_found.len(), 20);
    assert!(strings_found
        .iter()
        .all(|k| k.starts_with("str") || k.starts_with("key")));

    let zsets: BTreeSet<String> = scan_all(&mut h, &["count", "20", "match", "zset*"])
        .await
        .into_iter()
        .collect();
    assert_eq!(zsets.len(), 10);
    assert!(zsets.iter().all(|k| k.starts_with("zset")));
}

#[tokio::test]
async fn test_scan_reports_stable_keys_despite_churn() {
    let (_clock, mut h) = create_handler(4);
    for i in 0..100 {
        run(&mut h, &["set".to_string(), format!("stable{}", i), "v".into()]).await;
    }

    let mut cursor = "0".to_string();
    let mut seen = BTreeSet::new();
    let mut round = 0;
    loop {
        let reply = run(&mut h, &["scan", cursor.as_str(), "count", "5"]).await;
        let parts = reply.as_array().unwrap();
        cursor = String::from_utf8(parts[0].as_bytes().unwrap().to_vec()).unwrap();
        seen.extend(strings(&parts[1]));

        // Churn between calls: add and drop unrelated keys.
        run(&mut h, &["set".to_string(), format!("churn{}", round), "v".into()]).await;
        if round > 0 {
            run(&mut h, &["del".to_string(), format!("churn{}", round - 1)]).await;
        }
        round += 1;

        if cursor == "0" {
            break;
        }
    }

    for i in 0..100 {
        assert!(seen.contains(&format!("stable{}", i)), "stable{} missed", i);
    }
}

#[tokio::test]
async fn test_scan_skips_expired_keys() {
    let (clock, mut h) = create_handler(2);
    run(&mut h, &["set", "live", "v"]).await;
    run(&mut h, &["set", "doomed", "v", "PX", "10"]).await;
    clock.advance(std::time::Duration::from_millis(10));

    let keys = scan_all(&mut h, &[]).await;
    assert_eq!(keys, vec!["live".to_string()]);
}

async fn sort_fixture(h: &mut CommandHandler) {
    run(h, &["lpush", "mylist", "4", "2", "3", "9", "0"]).await;
    for (k, v) in [("ttt_3", "6"), ("ttt_4", "5"), ("ttt_9", "0"), ("ttt_0", "9"), ("ttt_2", "7")] {
        assert_eq!(run(h, &["set", k, v]).await, Reply::ok());
    }
}

#[tokio::test]
async fn test_sort() {
    let (_clock, mut h) = create_handler(4);
    sort_fixture(&mut h).await;
    assert_eq!(run(&mut h, &["get", "ttt_0"]).await, bulk("9"));
    assert_eq!(run(&mut h, &["get", "ttt_9"]).await, bulk("0"));

    let reply = run(&mut h, &["sort", "mylist", "by", "ttt_*"]).await;
    assert_eq!(strings(&reply), vec!["9", "4", "3", "2", "0"]);

    let reply = run(&mut h, &["sort", "mylist", "by", "ttt_*", "desc"]).await;
    assert_eq!(strings(&reply), vec!["0", "2", "3", "4", "9"]);

    let reply = run(&mut h, &["sort", "mylist", "by", "ttt_*", "limit", "1", "2"]).await;
    assert_eq!(strings(&reply), vec!["4", "3"]);
}

#[tokio::test]
async fn test_sort_without_by() {
    let (_clock, mut h) = create_handler(4);
    sort_fixture(&mut h).await;

    let reply = run(&mut h, &["sort", "mylist"]).await;
    assert_eq!(strings(&reply), vec!["0", "2", "3", "4", "9"]);

    run(&mut h, &["lpush", "mylist2", "1", "dda", "ee", "ad", "pps"]).await;
    let reply = run(&mut h, &["sort", "mylist2", "alpha"]).await;
    assert_eq!(strings(&reply), vec!["1", "ad", "dda", "ee", "pps"]);

    let reply = run(&mut h, &["sort", "mylist2", "alpha", "limit", "1", "2"]).await;
    assert_eq!(strings(&reply), vec!["ad", "dda"]);

    let reply = run(&mut h, &["sort", "mylist2"]).await;
    assert!(reply.is_error());

    run(&mut h, &["lpush", "mylist3", "1.1", "3.3", "2.2", "5.5", "4.4"]).await;
    let reply = run(&mut h, &["sort", "mylist3"]).await;
    assert_eq!(strings(&reply), vec!["1.1", "2.2", "3.3", "4.4", "5.5"]);
}

#[tokio::test]
async fn test_sort_nosort_and_missing_weights() {
    let (_clock, mut h) = create_handler(4);
    run(&mut h, &["lpush", "mylist3", "1.1", "3.3", "2.2", "5.5", "4.4"]).await;

    // A BY pattern without `*` keeps source order.
    let reply = run(&mut h, &["sort", "mylist3", "by", "not-exists-key"]).await;
    assert_eq!(strings(&reply), vec!["4.4", "5.5", "2.2", "3.3", "1.1"]);

    // All weights missing: every element weighs 0 and the stable sort keeps order.
    let reply = run(&mut h, &["sort", "mylist3", "by", "cwass*"]).await;
    assert_eq!(strings(&reply), vec!["4.4", "5.5", "2.2", "3.3", "1.1"]);

    let reply = run(&mut h, &["sort", "nosuchlist"]).await;
    assert_eq!(reply, Reply::Array(vec![]));
}

#[tokio::test]
async fn test_sort_sets() {
    let (_clock, mut h) = create_handler(4);
    run(&mut h, &["sadd", "s", "3", "1", "2"]).await;
    let reply = run(&mut h, &["sort", "s"]).await;
    assert_eq!(strings(&reply), vec!["1", "2", "3"]);

    run(&mut h, &["zadd", "z", "1", "c", "2", "a", "3", "b"]).await;
    let reply = run(&mut h, &["sort", "z", "alpha", "desc"]).await;
    assert_eq!(strings(&reply), vec!["c", "b", "a"]);
}

#[tokio::test]
async fn test_type_and_keys() {
    let (_clock, mut h) = create_handler(4);
    populate_scan_fixture(&mut h).await;
    assert_eq!(run(&mut h, &["type", "key1"]).await, Reply::status("string"));
    assert_eq!(run(&mut h, &["type", "set1"]).await, Reply::status("set"));
    assert_eq!(run(&mut h, &["type", "zset1"]).await, Reply::status("zset"));

    let keys: BTreeSet<String> = strings(&run(&mut h, &["keys", "set?"]).await)
        .into_iter()
        .collect();
    assert_eq!(keys.len(), 10);
    assert_eq!(h.last_debug_info().unwrap().shards_count, 4);
}
