//! Integration tests exercising the public API across module boundaries,
//! without a live server — this crate's entire test story stays in-process
//! (`SPEC_FULL.md` §2 "Test tooling").

use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mongors::bson::{decode_document, encode_document, Bson, BsonDocument, DateTime, Document, FromBson, Timestamp};
use mongors::doc;
use mongors::sdam::{ServerAddress, ServerDescription, ServerKind, TopologyDescription, TopologyType};
use mongors::selection::{select, OperationCounts, ReadPreference, ReadPreferenceMode, SelectionOutcome};
use mongors::session::SessionPool;
use mongors::ClientOptions;

/// `spec.md` §8 scenario 1: encode `{"x": int32(42), "a": ["s", true,
/// null]}`, assert the exact byte length, round-trip it, and confirm a
/// corrupted terminator is rejected.
#[test]
fn bson_round_trip_scenario() {
    let document = doc! {
        "x" => Bson::Int32(42),
        "a" => Bson::Array(vec![Bson::String("s".to_string()), Bson::Boolean(true), Bson::Null]),
    };

    let bytes = encode_document(&document);
    assert_eq!(bytes.len(), 0x24);

    let decoded = decode_document(&bytes).expect("canonical bytes must decode");
    assert_eq!(decoded, document);

    let mut corrupted = bytes.clone();
    *corrupted.last_mut().unwrap() = 0x01;
    assert!(decode_document(&corrupted).is_err());
}

fn server(addr: &str, kind: ServerKind, rtt_ms: Option<f64>) -> ServerDescription {
    let (host, port) = addr.split_once(':').unwrap();
    ServerDescription {
        address: ServerAddress::new(host, port.parse().unwrap()),
        kind,
        min_wire_version: 6,
        max_wire_version: 21,
        tags: Default::default(),
        election_id: None,
        set_version: Some(1),
        set_name: Some("rs0".to_string()),
        logical_session_timeout_minutes: Some(30),
        last_write_date: None,
        last_update_time: Instant::now(),
        last_update_date: DateTime::now(),
        average_round_trip_ms: rtt_ms,
        hosts: vec![],
        passives: vec![],
        arbiters: vec![],
        primary: None,
        topology_version: None,
        error: None,
    }
}

fn topology(servers: Vec<ServerDescription>, kind: TopologyType) -> TopologyDescription {
    TopologyDescription {
        topology_type: kind,
        set_name: Some("rs0".to_string()),
        max_set_version: Some(1),
        max_election_id: None,
        servers: servers.into_iter().map(|s| (s.address.clone(), s)).collect(),
        compatibility_error: None,
        logical_session_timeout_minutes: Some(30),
    }
}

/// `spec.md` §8 scenario 2: `RSWithPrimary{A:Primary,B:Secondary,C:Secondary}`
/// with RTTs 10/20/100ms. `readPref=primary` selects A; `nearest` with
/// `localThresholdMS=15` narrows to {A,B}; with opCount A=5,B=2 the pick
/// favors B.
#[test]
fn server_selection_primary_and_nearest_scenario() {
    let top = topology(
        vec![
            server("a:27017", ServerKind::RSPrimary, Some(10.0)),
            server("b:27017", ServerKind::RSSecondary, Some(20.0)),
            server("c:27017", ServerKind::RSSecondary, Some(100.0)),
        ],
        TopologyType::ReplicaSetWithPrimary,
    );

    let counts = OperationCounts::new();
    let outcome = select(&top, &ReadPreference::primary(), &counts, Duration::from_secs(10), 15).unwrap();
    assert!(matches!(outcome, SelectionOutcome::Selected(addr) if addr == ServerAddress::new("a", 27017)));

    let mut counts = OperationCounts::new();
    counts.insert(ServerAddress::new("a", 27017), Arc::new(AtomicI64::new(5)));
    counts.insert(ServerAddress::new("b", 27017), Arc::new(AtomicI64::new(2)));
    let outcome = select(&top, &ReadPreference::nearest(), &counts, Duration::from_secs(10), 15).unwrap();
    match outcome {
        SelectionOutcome::Selected(addr) => {
            assert!(addr == ServerAddress::new("a", 27017) || addr == ServerAddress::new("b", 27017));
        }
        SelectionOutcome::Retry => panic!("expected a selection"),
    }
}

/// `spec.md` §8 scenario 3: a lagging secondary (120s behind) is filtered
/// out of a `maxStalenessSeconds=90` window while a 5s-behind secondary
/// survives.
#[test]
fn max_staleness_filters_lagging_secondary_scenario() {
    let now = DateTime::now();
    let lagged = |ms: i64| DateTime::from_millis(now.millis() - ms);

    let mut primary = server("p:27017", ServerKind::RSPrimary, Some(5.0));
    primary.last_write_date = Some(now);
    primary.last_update_date = now;

    let mut fresh_secondary = server("s1:27017", ServerKind::RSSecondary, Some(5.0));
    fresh_secondary.last_write_date = Some(lagged(5_000));
    fresh_secondary.last_update_date = now;

    let mut stale_secondary = server("s2:27017", ServerKind::RSSecondary, Some(5.0));
    stale_secondary.last_write_date = Some(lagged(120_000));
    stale_secondary.last_update_date = now;

    let top = topology(
        vec![primary, fresh_secondary, stale_secondary],
        TopologyType::ReplicaSetWithPrimary,
    );

    let preference = ReadPreference {
        mode: ReadPreferenceMode::Nearest,
        tag_sets: Vec::new(),
        max_staleness_seconds: Some(90),
    };
    let counts = OperationCounts::new();
    let outcome = select(&top, &preference, &counts, Duration::from_millis(10_000), 15).unwrap();
    match outcome {
        SelectionOutcome::Selected(addr) => {
            assert_ne!(addr, ServerAddress::new("s2", 27017));
        }
        SelectionOutcome::Retry => panic!("expected a selection"),
    }
}

/// `spec.md` §8 scenario 5: ending sessions A,B then starting C,D yields
/// their lsids in LIFO order.
#[test]
fn session_pool_cleanup_is_lifo_scenario() {
    let pool = SessionPool::new();
    let a = pool.acquire(None);
    let b = pool.acquire(None);
    let (a_id, b_id) = (a.id.clone(), b.id.clone());
    pool.release(a, None);
    pool.release(b, None);

    let c = pool.acquire(None);
    let d = pool.acquire(None);
    assert_eq!(c.id, b_id);
    assert_eq!(d.id, a_id);
}

/// The topology state machine table (`spec.md` §4.4) should drive a fresh
/// replica-set seed list from `Unknown`/`ReplicaSetNoPrimary` all the way to
/// `ReplicaSetWithPrimary` as heartbeats arrive, then back down when the
/// primary disappears.
#[test]
fn topology_walks_unknown_to_with_primary_and_back() {
    let mut top = TopologyDescription::seed(
        &[ServerAddress::new("a", 27017), ServerAddress::new("b", 27017)],
        Some("rs0".to_string()),
    );
    assert_eq!(top.topology_type, TopologyType::ReplicaSetNoPrimary);

    top.on_server_description(server("a:27017", ServerKind::RSPrimary, Some(1.0)));
    assert_eq!(top.topology_type, TopologyType::ReplicaSetWithPrimary);

    top.on_server_description(ServerDescription::unknown(ServerAddress::new("a", 27017)));
    assert_eq!(top.topology_type, TopologyType::ReplicaSetNoPrimary);
}

/// `spec.md` §6: every documented connection-string option round-trips
/// through `ClientOptions::parse`.
#[test]
fn connection_string_parses_every_documented_option() {
    let uri = "mongodb://user:pw@a.example.com:27017,b.example.com:27018/mydb\
        ?replicaSet=rs0&tls=true&authSource=admin&authMechanism=SCRAM-SHA-256\
        &readPreference=nearest&readPreferenceTags=dc:east,rack:1\
        &maxStalenessSeconds=120&w=majority&wtimeoutMS=5000&journal=true\
        &readConcernLevel=majority&retryWrites=true&retryReads=true\
        &serverSelectionTimeoutMS=5000&heartbeatFrequencyMS=20000\
        &localThresholdMS=20&maxPoolSize=50&minPoolSize=2&maxIdleTimeMS=60000\
        &appname=integration-test&compressors=zstd,snappy";

    let options = ClientOptions::parse(uri).expect("valid connection string");
    assert_eq!(options.hosts.len(), 2);
    assert_eq!(options.replica_set.as_deref(), Some("rs0"));
    assert!(options.tls);
    let credential = options.credential.expect("credential");
    assert_eq!(credential.source.as_deref(), Some("admin"));
    assert_eq!(credential.mechanism.as_deref(), Some("SCRAM-SHA-256"));
    assert_eq!(options.read_preference.mode, ReadPreferenceMode::Nearest);
    assert_eq!(options.read_preference.tag_sets.len(), 1);
    assert_eq!(options.read_preference.max_staleness_seconds, Some(120));
    assert_eq!(options.write_concern.wtimeout_ms, Some(5000));
    assert_eq!(options.read_concern.level.as_deref(), Some("majority"));
    assert!(options.retry_writes);
    assert!(options.retry_reads);
    assert_eq!(options.server_selection_timeout_ms, 5000);
    assert_eq!(options.heartbeat_frequency, Duration::from_millis(20000));
    assert_eq!(options.local_threshold_ms, 20);
    assert_eq!(options.max_pool_size, 50);
    assert_eq!(options.min_pool_size, 2);
    assert_eq!(options.max_idle_time_ms, Some(60000));
    assert_eq!(options.app_name.as_deref(), Some("integration-test"));
    assert_eq!(options.compressors, vec!["zstd".to_string(), "snappy".to_string()]);
}

/// Causal consistency end-to-end at the document level (`spec.md` §8
/// scenario 4): the first read carries no `afterClusterTime`; after a reply
/// advances `operationTime`, the second carries it while preserving a
/// user-supplied `readConcern.level`.
#[tokio::test]
async fn causal_consistency_injects_after_cluster_time_on_subsequent_reads() {
    let client = Arc::new(mongors::Client::with_options(ClientOptions::default()));
    let session = client.start_session(true);

    assert!(session.after_cluster_time().is_none());

    let reply_operation_time = Timestamp::new(1_700_000_000, 3);
    session.advance_cluster_time(None, Some(reply_operation_time));

    let after = session.after_cluster_time().expect("second read carries afterClusterTime");
    assert_eq!(after, reply_operation_time);

    let mut read_concern = Document::new();
    read_concern.insert("level", "majority");
    read_concern.insert("afterClusterTime", after);
    assert_eq!(read_concern.get_str("level"), Some("majority"));
    assert_eq!(read_concern.get_timestamp("afterClusterTime"), Some(reply_operation_time));
}

/// `spec.md` §4.5 step 3 validation: `maxStalenessSeconds` of exactly zero
/// means disabled (`spec.md` §9 Open Questions), not "strictest".
#[test]
fn zero_max_staleness_means_disabled() {
    let preference = ReadPreference {
        mode: ReadPreferenceMode::Secondary,
        tag_sets: Vec::new(),
        max_staleness_seconds: Some(0),
    };
    mongors::options::validate_read_preference(&preference, &Duration::from_millis(10_000))
        .expect("zero is disabled, not an error");
}

/// Tag-set filtering (`spec.md` §4.5 step 4): the first tag set with any
/// match wins even when an earlier candidate set matches nothing.
#[test]
fn tag_set_filter_falls_through_to_first_matching_set() {
    let mut east = server("a:27017", ServerKind::RSSecondary, Some(5.0));
    east.tags = HashMap::from([("dc".to_string(), "east".to_string())])
        .into_iter()
        .collect();
    let mut west = server("b:27017", ServerKind::RSSecondary, Some(5.0));
    west.tags = HashMap::from([("dc".to_string(), "west".to_string())])
        .into_iter()
        .collect();

    let top = topology(vec![east, west], TopologyType::ReplicaSetNoPrimary);
    let preference = ReadPreference {
        mode: ReadPreferenceMode::Secondary,
        tag_sets: vec![
            vec![("dc".to_string(), "central".to_string())],
            vec![("dc".to_string(), "west".to_string())],
        ],
        max_staleness_seconds: None,
    };
    let counts = OperationCounts::new();
    let outcome = select(&top, &preference, &counts, Duration::from_secs(10), 15).unwrap();
    assert!(matches!(outcome, SelectionOutcome::Selected(addr) if addr == ServerAddress::new("b", 27017)));
}

/// `spec.md` §4.1 Coder strategy table: a struct deriving `BsonSchema` can
/// pick a non-default strategy per field via `#[mongors(...)]`, and the
/// chosen strategy round-trips through `into_document`/`from_document`.
#[derive(Debug, PartialEq, mongors::BsonSchema)]
struct StrategyDocument {
    #[mongors(rename = "_id")]
    id: i32,
    #[mongors(date = "iso8601_string")]
    created_at: chrono::DateTime<chrono::Utc>,
    #[mongors(uuid = "string")]
    request_id: uuid::Uuid,
    #[mongors(bytes = "base64")]
    payload: Vec<u8>,
}

#[test]
fn coder_strategies_round_trip() {
    let created_at = chrono::DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let request_id = uuid::Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
    let original = StrategyDocument {
        id: 7,
        created_at,
        request_id,
        payload: vec![1, 2, 3, 255],
    };

    let doc = original.into_document().expect("encodes with chosen strategies");
    assert_eq!(doc.get_str("created_at"), Some("2026-01-02T03:04:05+00:00"));
    assert_eq!(doc.get_str("request_id"), Some("550e8400-e29b-41d4-a716-446655440000"));
    assert_eq!(doc.get_str("payload"), Some("AQID/w=="));

    let round_tripped = StrategyDocument::from_document(doc).expect("decodes with chosen strategies");
    assert_eq!(
        round_tripped,
        StrategyDocument {
            id: 7,
            created_at,
            request_id,
            payload: vec![1, 2, 3, 255],
        }
    );
}

/// `spec.md` §4.1's default date/uuid/bytes strategies (absent a field
/// attribute) match the un-annotated `IntoBson`/`FromBson` impls: wire
/// `DateTime`, binary subtype `0x04`, and raw binary respectively.
#[test]
fn coder_default_uuid_strategy_is_binary_subtype_4() {
    let id = uuid::Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
    let encoded = mongors::bson::coder::strategies::uuid_to_bson(id, "binary").unwrap();
    match &encoded {
        Bson::Binary(b) => assert_eq!(b.subtype, mongors::bson::BinarySubtype::Uuid),
        other => panic!("expected binary, found {other:?}"),
    }
    let decoded = mongors::bson::coder::strategies::uuid_from_bson(encoded, "binary").unwrap();
    assert_eq!(decoded, id);
}

/// `spec.md` §4.1 "Numbers: lossless-only": an `i32` field decoding a BSON
/// value that doesn't fit, or doesn't survive, the narrowing is an error
/// rather than a silent truncation.
#[test]
fn lossless_number_narrowing_rejects_lossy_conversions() {
    assert_eq!(i32::from_bson(Bson::Int64(42)).unwrap(), 42);
    assert!(i32::from_bson(Bson::Int64(i64::from(i32::MAX) + 1)).is_err());
    assert!(i32::from_bson(Bson::Double(1.5)).is_err());
    assert_eq!(i32::from_bson(Bson::Double(3.0)).unwrap(), 3);

    assert!(i64::from_bson(Bson::Double(2f64.powi(63))).is_err());
    assert_eq!(i64::from_bson(Bson::Int32(5)).unwrap(), 5);
}
