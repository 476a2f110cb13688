use std::{io::Write, net::IpAddr, time::Duration};

use axum::{Router, routing::get};
use pinfetch::{
    DenyReason, DomainResolver, FetchOptions, Hostname, Rejection, SafeFetcher,
    ValidationOutcome,
};
use pinfetch_rebind::{RebindingResolver, StaticAnswer, StaticRecords};

/// Start a server on the loopback address returning `body` for every path
async fn test_server(body: &'static str) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = Router::new().route("/", get(move || async move { body }));
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    port
}

fn test_options() -> FetchOptions {
    let mut options = FetchOptions::default();
    options.policy.allow = vec!["127.0.0.1/32".parse().unwrap()];
    options.connect_timeout = Duration::from_secs(2);
    options.request_timeout = Duration::from_secs(5);
    options
}

fn rebinding_resolver() -> RebindingResolver {
    RebindingResolver::new(
        "rebind.test",
        "127.0.0.1".parse().unwrap(),
        "10.0.0.1".parse().unwrap(),
    )
}

/// A validate-then-fetch client resolving twice would be sent to the
/// internal address, the pinned fetch connects to the address it validated
#[tokio::test]
async fn test_rebinding_defeated_by_pinning() {
    let port = test_server("external").await;
    let fetcher = SafeFetcher::with_resolver(test_options(), rebinding_resolver());
    let url = format!("http://attack.rebind.test:{port}/");

    let response = fetcher.get(&url).await.unwrap();
    assert_eq!(&response.body[..], b"external");
    assert_eq!(response.remote_addr.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());

    let resolver = fetcher.validator().resolver().inner();
    assert_eq!(resolver.query_count("attack.rebind.test").await, 1);

    // The name now rebinds to the internal address and is refused
    let error = fetcher.get(&url).await.unwrap_err();
    assert_eq!(
        error.rejection().map(Rejection::reasons),
        Some(vec![DenyReason::PrivateRange])
    );
    assert!(!error.is_retryable());
    assert_eq!(resolver.query_count("attack.rebind.test").await, 2);
}

/// The check passing tells nothing about what a second resolution returns
#[tokio::test]
async fn test_check_then_resolve_again_is_unsafe() {
    let fetcher = SafeFetcher::with_resolver(test_options(), rebinding_resolver());

    let outcome = fetcher.check("http://naive.rebind.test/").await.unwrap();
    assert!(outcome.is_validated());

    let resolver = fetcher.validator().resolver().inner();
    let second = resolver.resolve_domain("naive.rebind.test").await.unwrap();
    assert_eq!(second, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);

    let outcome = fetcher
        .validator()
        .validate(&Hostname::parse("naive.rebind.test").unwrap())
        .await;
    assert!(matches!(outcome, ValidationOutcome::Rejected { .. }));
}

#[tokio::test]
async fn test_load_static_records_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"{
            "records": {
                "static.rebind.test": { "type": "A", "value": "127.0.0.1" },
                "www.example.com": [
                    { "type": "CNAME", "value": "static.rebind.test." },
                    { "type": "TXT", "value": "hello" }
                ]
            }
        }"#,
    )
    .unwrap();

    let records = StaticRecords::load(Some(file.path())).unwrap();
    assert_eq!(
        records.lookup("www.example.com"),
        Some(StaticAnswer::Addresses(vec!["127.0.0.1".parse().unwrap()]))
    );

    let port = test_server("static").await;
    let fetcher = SafeFetcher::with_resolver(
        test_options(),
        rebinding_resolver().with_records(records),
    );

    // Static answers never rebind
    for _ in 0..2 {
        let response = fetcher
            .get(&format!("http://static.rebind.test:{port}/"))
            .await
            .unwrap();
        assert_eq!(&response.body[..], b"static");
    }
}

#[tokio::test]
async fn test_load_static_records_yaml_file() {
    let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
    file.write_all(
        br#"
record:
  static.rebind.test:
    type: A
    value: 127.0.0.1
  alias.example.com:
    type: CNAME
    value: static.rebind.test
"#,
    )
    .unwrap();

    let records = StaticRecords::load(Some(file.path())).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(
        records.lookup("alias.example.com"),
        Some(StaticAnswer::Addresses(vec!["127.0.0.1".parse().unwrap()]))
    );

    // JSON content under a YAML name is still read as YAML
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(br#"{"record": {"a.example.com": {"type": "A", "value": "192.0.2.1"}}}"#)
        .unwrap();
    let records = StaticRecords::load(Some(file.path())).unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_load_records_errors() {
    assert!(StaticRecords::load(None).unwrap().is_empty());

    let missing = StaticRecords::load(Some("/nonexistent/records.json".as_ref()));
    assert!(missing.is_err());

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"not json").unwrap();
    assert!(StaticRecords::load(Some(file.path())).is_err());
}
