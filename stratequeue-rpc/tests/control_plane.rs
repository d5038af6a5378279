//! Control-plane endpoint tests against a live supervisor.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use stratequeue_broker::DataProviderAdapter;
use stratequeue_config::CredentialStore;
use stratequeue_data::DataManager;
use stratequeue_demo::{DemoConfig, DemoProvider};
use stratequeue_engine::register_builtin_evaluators;
use stratequeue_paper::{PaperBroker, PaperConfig};
use stratequeue_rpc::{build_router, AppState};
use stratequeue_runtime::{
    ShutdownSignal, Supervisor, SupervisorConfig, SupervisorDeps, SystemClock,
};
use stratequeue_stats::StatisticsManager;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    _strategy_file: tempfile::NamedTempFile,
    strategy_path: String,
    upload_dir: tempfile::TempDir,
    credentials_path: std::path::PathBuf,
}

async fn test_app() -> TestApp {
    register_builtin_evaluators();
    let _ = tracing_subscriber::fmt::try_init();

    let mut providers: HashMap<String, Arc<dyn DataProviderAdapter>> = HashMap::new();
    providers.insert(
        "demo".to_string(),
        Arc::new(DemoProvider::new(DemoConfig {
            volatility_bps: 0,
            feed_interval_ms: Some(5),
            ..DemoConfig::default()
        })),
    );
    let (data, _data_task) = DataManager::spawn(providers);

    let mut brokers: HashMap<String, Arc<dyn stratequeue_broker::BrokerAdapter>> = HashMap::new();
    brokers.insert(
        "paper".to_string(),
        Arc::new(PaperBroker::new("paper", PaperConfig::default())),
    );

    let stats = Arc::new(StatisticsManager::new());
    let (supervisor, _task) = Supervisor::spawn(SupervisorDeps {
        data,
        providers: vec!["demo".to_string()],
        brokers,
        stats,
        clock: Arc::new(SystemClock),
        config: SupervisorConfig::default(),
        shutdown: ShutdownSignal::new(),
    });

    let upload_dir = tempfile::tempdir().unwrap();
    let credentials_dir = tempfile::tempdir().unwrap();
    let credentials_path = credentials_dir.path().join("credentials.toml");
    // Leak the credentials dir so the path outlives the test body.
    std::mem::forget(credentials_dir);

    let mut strategy_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(strategy_file, "from strategies import SmaCross").unwrap();
    let strategy_path = strategy_file.path().to_string_lossy().to_string();

    let router = build_router(AppState {
        supervisor,
        credentials: CredentialStore::open(&credentials_path),
        upload_dir: upload_dir.path().to_path_buf(),
    });
    TestApp {
        router,
        _strategy_file: strategy_file,
        strategy_path,
        upload_dir,
        credentials_path,
    }
}

fn deploy_body(app: &TestApp, id: &str) -> Value {
    json!({
        "strategy": app.strategy_path,
        "strategy_id": id,
        "engine": "sma-cross",
        "symbols": ["AAPL"],
        "granularity": "1m",
        "lookback": 5,
        "allocation": 0.25,
        "data_source": "demo",
        "broker": "paper",
        "mode": "paper",
        "params": {}
    })
}

async fn post_json(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap();
    (status, value)
}

#[tokio::test(flavor = "multi_thread")]
async fn engines_endpoint_lists_builtins() {
    let app = test_app().await;
    let (status, body) = get_json(&app.router, "/engines").await;
    assert_eq!(status, StatusCode::OK);
    let engines = body["engines"].as_array().unwrap();
    assert!(engines
        .iter()
        .any(|engine| engine["name"] == "sma-cross" && engine["available"] == true));
}

#[tokio::test(flavor = "multi_thread")]
async fn validate_reports_structured_errors() {
    let app = test_app().await;
    let mut body = deploy_body(&app, "bad");
    body["symbols"] = json!([]);
    body["data_source"] = json!("nope");
    let (status, response) = post_json(&app.router, "/deploy/validate", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["valid"], false);
    let errors = response["errors"].as_array().unwrap();
    assert!(!errors.is_empty());

    let (status, response) =
        post_json(&app.router, "/deploy/validate", deploy_body(&app, "ok")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["valid"], true);
}

#[tokio::test(flavor = "multi_thread")]
async fn deploy_list_statistics_and_lifecycle() {
    let app = test_app().await;
    let (status, response) =
        post_json(&app.router, "/deploy/start", deploy_body(&app, "alpha")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["id"], "alpha");

    // Redeploying the active id conflicts.
    let (status, _) = post_json(&app.router, "/deploy/start", deploy_body(&app, "alpha")).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = get_json(&app.router, "/strategies").await;
    assert_eq!(status, StatusCode::OK);
    let strategies = body["strategies"].as_array().unwrap();
    let record = strategies
        .iter()
        .find(|record| record["id"] == "alpha")
        .unwrap();
    assert_eq!(record["data_source"], "demo");
    assert_eq!(record["mode"], "paper");
    assert_eq!(record["symbols"], json!(["AAPL"]));

    // Wait for warmup, then exercise pause/resume/stop.
    for _ in 0..200 {
        let (_, body) = get_json(&app.router, "/strategies").await;
        if body["strategies"][0]["status"] == "RUNNING" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let (status, _) = post_json(&app.router, "/strategies/alpha/pause", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = post_json(&app.router, "/strategies/alpha/resume", json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = get_json(&app.router, "/strategies/alpha/statistics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["metrics"].is_object());
    // Decimal fields arrive as strings on the wire.
    assert!(body["metrics"]["equity"].is_string());

    let (status, _) = post_json(
        &app.router,
        "/strategies/alpha/stop",
        json!({"liquidate": false, "force": false}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The statistics endpoint keeps serving the last snapshot after stop.
    for _ in 0..200 {
        let (_, body) = get_json(&app.router, "/strategies/alpha/statistics").await;
        if body["status"] == "STOPPED" {
            assert!(body["metrics"].is_object());
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("strategy never stopped");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_strategy_is_not_found() {
    let app = test_app().await;
    let (status, _) = get_json(&app.router, "/strategies/ghost/statistics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = post_json(&app.router, "/strategies/ghost/pause", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_strategy_writes_file() {
    let app = test_app().await;
    let boundary = "sqboundary";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"my_strategy.py\"\r\nContent-Type: text/x-python\r\n\r\nprint('hello')\r\n--{boundary}--\r\n"
    );
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/upload_strategy")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    let path = value["path"].as_str().unwrap();
    assert!(path.ends_with("my_strategy.py"));
    let written = std::fs::read_to_string(app.upload_dir.path().join("my_strategy.py")).unwrap();
    assert_eq!(written, "print('hello')");
}

#[tokio::test(flavor = "multi_thread")]
async fn config_endpoint_persists_credentials() {
    let app = test_app().await;
    let (status, _) = post_json(
        &app.router,
        "/config",
        json!({"alpaca_key": "abc", "alpaca_secret": "def"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let store = CredentialStore::open(&app.credentials_path);
    assert_eq!(store.get("alpaca_key").unwrap().as_deref(), Some("abc"));
    assert_eq!(store.get("alpaca_secret").unwrap().as_deref(), Some("def"));
}

#[tokio::test(flavor = "multi_thread")]
async fn allocation_over_equity_fails_validation() {
    let app = test_app().await;
    let mut body = deploy_body(&app, "greedy");
    body["allocation"] = json!(2_000_000);
    let (status, response) = post_json(&app.router, "/deploy/validate", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["valid"], false);
    let errors = response["errors"].as_array().unwrap();
    assert!(errors.iter().any(|e| e
        .as_str()
        .unwrap()
        .contains("unallocated equity")));
}
