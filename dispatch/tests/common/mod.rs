use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use dispatch::config::{Config, EnvSecsDuration};
use dispatch::discovery::DiscoveredClass;
use dispatch::reporter::Reporter;
use dispatch::result::MethodResult;
use dispatch::server::run;

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(|| Config {
    address: SocketAddr::from_str("127.0.0.1:0").unwrap(),
    runner_timeout: EnvSecsDuration(Duration::from_secs(300)),
    server_timeout: EnvSecsDuration(Duration::from_secs(300)),
    revision: None,
    shutdown_delay_for_connection_close: EnvSecsDuration(Duration::from_millis(10)),
    shutdown_delay_for_outstanding_runners: EnvSecsDuration(Duration::from_secs(2)),
    disable_requeueing: false,
    failure_limit: 0,
    test_manifest: None,
});

/// Reporter that just remembers what it saw, so scenarios can assert on
/// the reported stream after the run ends.
#[derive(Default)]
pub struct RecordingReporter {
    completes: Mutex<Vec<MethodResult>>,
}

impl RecordingReporter {
    pub fn completed(&self) -> Vec<MethodResult> {
        self.completes.lock().unwrap().clone()
    }
}

impl Reporter for RecordingReporter {
    fn test_start(&self, _result: &MethodResult) {}

    fn test_complete(&self, result: &MethodResult) {
        self.completes.lock().unwrap().push(result.clone());
    }

    fn report(&self) -> bool {
        true
    }
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    pub reporter: Arc<RecordingReporter>,
    server: JoinHandle<bool>,
    client: reqwest::Client,
}

impl ServerHandle {
    pub async fn for_config(config: Config, classes: Vec<DiscoveredClass>) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let reporter = Arc::new(RecordingReporter::default());

        let server = {
            let reporter = reporter.clone();
            tokio::spawn(
                async move { run(config, move || Ok(classes), vec![reporter], listener).await },
            )
        };

        ServerHandle {
            addr,
            reporter,
            server,
            client: reqwest::Client::new(),
        }
    }

    pub async fn get_tests(&self, runner: &str) -> reqwest::Response {
        self.client
            .get(format!("http://{}/tests", self.addr))
            .query(&[("runner", runner)])
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn get_tests_with_revision(&self, runner: &str, revision: &str) -> reqwest::Response {
        self.client
            .get(format!("http://{}/tests", self.addr))
            .query(&[("runner", runner), ("revision", revision)])
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn post_result(&self, runner: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("http://{}/results", self.addr))
            .query(&[("runner", runner)])
            .json(&body)
            .send()
            .await
            .expect("failed to send request")
    }

    /// Wait for the server to stop and return the run's final verdict.
    pub async fn finished(self) -> bool {
        self.server.await.expect("server task panicked")
    }
}

pub fn discovered(module: &str, class: &str, methods: &[&str]) -> DiscoveredClass {
    DiscoveredClass {
        module: module.to_string(),
        class: class.to_string(),
        methods: methods.iter().map(|m| m.to_string()).collect(),
    }
}

pub fn method_result(module: &str, class: &str, name: &str, success: bool) -> serde_json::Value {
    json!({
        "method": {
            "module": module,
            "class": class,
            "name": name,
            "full_name": format!("{} {}.{}", module, class, name),
            "fixture_type": null,
        },
        "success": success,
        "start_time": 1.0,
        "end_time": 2.0,
        "run_time": 1.0,
        "normalized_run_time": "1.00s",
        "complete": true,
        "failure": !success,
        "error": null,
        "interrupted": null,
        "exception_info": null,
        "exception_info_pretty": null,
        "exception_only": null,
        "runner_id": "unused",
    })
}
