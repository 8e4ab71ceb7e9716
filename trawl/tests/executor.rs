//! End-to-end executor tests: real `bash` subprocesses, an in-memory
//! store double, no database required.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};

use trawl::executor::process;
use trawl::notify::Notifier;
use trawl_core::data::AlertType;
use trawl_core::{Data, Pipe};
use trawl_store::{Result as StoreResult, Store};

/// Insert-or-ignore store double mirroring the Postgres asset-override
/// semantics, with everything observable for assertions.
#[derive(Default)]
struct MemoryStore {
    rows: Mutex<BTreeMap<String, (String, Value)>>,
    alerts: Mutex<Vec<(String, String, String)>>,
    blocked: Vec<String>,
}

impl MemoryStore {
    fn with_blocked(blocked: &[&str]) -> Self {
        Self {
            blocked: blocked.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    fn asset_of(&self, ident: &str) -> Option<String> {
        self.rows
            .lock()
            .unwrap()
            .get(ident)
            .map(|(asset, _)| asset.clone())
    }

    fn alert_messages(&self) -> Vec<String> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn setup_schema(&self, _tables: &[String]) -> StoreResult<()> {
        Ok(())
    }

    async fn add_task(&self, _pipe: &str, _ident: &str, _note: Option<&str>) -> StoreResult<()> {
        Ok(())
    }

    async fn should_run(&self, _pipe: &str, _ident: &str, _interval: Duration) -> StoreResult<bool> {
        Ok(true)
    }

    async fn retrieve(
        &self,
        _table: &str,
        _pipe: &str,
        _filter: &BTreeMap<String, String>,
        _threshold: &BTreeMap<String, f64>,
        _interval: Duration,
    ) -> StoreResult<Vec<Data>> {
        Ok(Vec::new())
    }

    async fn retrieve_by_target(
        &self,
        _table: &str,
        _filter: &BTreeMap<String, String>,
        _target: &str,
    ) -> StoreResult<Vec<Data>> {
        Ok(Vec::new())
    }

    async fn retrieve_targets(&self) -> StoreResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn retrieve_blocked(&self) -> StoreResult<Vec<String>> {
        Ok(self.blocked.clone())
    }

    async fn save(
        &self,
        _table: &str,
        _pipe: &str,
        id: &str,
        data: &Data,
        mut result: Map<String, Value>,
    ) -> StoreResult<bool> {
        let mut asset = data.asset.clone();
        if let Some(Value::String(rendered)) = result.get("asset") {
            if !rendered.is_empty() {
                asset = rendered.clone();
            }
        }
        result.remove("asset");

        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(id) {
            return Ok(false);
        }
        rows.insert(id.to_string(), (asset, Value::Object(result)));
        Ok(true)
    }

    async fn save_alert(
        &self,
        pipe: &str,
        ident: &str,
        message: &str,
        _alert_type: AlertType,
    ) -> StoreResult<()> {
        self.alerts.lock().unwrap().push((
            pipe.to_string(),
            ident.to_string(),
            message.to_string(),
        ));
        Ok(())
    }
}

fn pipe_from(yaml: &str) -> Pipe {
    let pipe: Pipe = serde_yaml::from_str(yaml).expect("parsing test pipe");
    pipe.validate().expect("validating test pipe");
    pipe
}

fn seed() -> Data {
    Data {
        id: "a".to_string(),
        asset: "example.com".to_string(),
        target: "t".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn first_discovery_creates_record_and_alert_exactly_once() {
    let pipe = pipe_from(
        r#"
name: echo
input:
  table: domains
cmd: |-
  echo '{"h":"sub.example.com"}'
output:
  table: domains
  ident: ${.outputJson.h}
  asset: ${.outputJson.h}
"#,
    );
    let store = MemoryStore::default();
    let notifier = Notifier::new(None);

    process(&pipe, &seed(), &store, &notifier).await.unwrap();

    assert_eq!(store.row_count(), 1);
    assert_eq!(
        store.asset_of("sub.example.com").as_deref(),
        Some("sub.example.com")
    );
    assert_eq!(store.alert_messages(), vec!["sub.example.com"]);

    // idempotent re-run: no new row, no new alert
    process(&pipe, &seed(), &store, &notifier).await.unwrap();
    assert_eq!(store.row_count(), 1);
    assert_eq!(store.alert_messages().len(), 1);
}

#[tokio::test]
async fn blank_lines_produce_no_records() {
    let pipe = pipe_from(
        r#"
name: blanks
input:
  table: domains
cmd: |-
  printf '\n   \n\t\n'
output:
  table: domains
  ident: ${.output}
"#,
    );
    let store = MemoryStore::default();

    process(&pipe, &seed(), &store, &Notifier::new(None))
        .await
        .unwrap();
    assert_eq!(store.row_count(), 0);
    assert!(store.alert_messages().is_empty());
}

#[tokio::test]
async fn filter_predicates_exclude_matching_lines() {
    let pipe = pipe_from(
        r#"
name: filtered
input:
  table: domains
cmd: |-
  printf 'http://localhost:8080\nhttp://example.com\n'
filter:
  skipLocal: 'string.find(output, "localhost") ~= nil'
output:
  table: domains
  ident: ${.output}
"#,
    );
    let store = MemoryStore::default();

    process(&pipe, &seed(), &store, &Notifier::new(None))
        .await
        .unwrap();

    let rows = store.rows.lock().unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows.contains_key("http://example.com"));
}

#[tokio::test]
async fn broken_filter_drops_the_line_not_the_job() {
    let pipe = pipe_from(
        r#"
name: broken_filter
input:
  table: domains
cmd: |-
  echo keep
filter:
  broken: 'this is not lua'
output:
  table: domains
  ident: ${.output}
"#,
    );
    let store = MemoryStore::default();

    // the job itself still succeeds
    process(&pipe, &seed(), &store, &Notifier::new(None))
        .await
        .unwrap();
    assert_eq!(store.row_count(), 0);
}

#[tokio::test]
async fn timeout_kills_the_subprocess_without_failing_the_job() {
    let pipe = pipe_from(
        r#"
name: sleeper
input:
  table: domains
cmd: sleep 5
timeout: 300ms
output:
  table: domains
  ident: ${.output}
"#,
    );
    let store = MemoryStore::default();

    let started = Instant::now();
    process(&pipe, &seed(), &store, &Notifier::new(None))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(4), "must not wait out the sleep");
    assert_eq!(store.row_count(), 0);
}

#[tokio::test]
async fn nonzero_exit_still_commits_earlier_lines() {
    let pipe = pipe_from(
        r#"
name: failing
input:
  table: domains
cmd: |-
  echo '{"h":"early.example.com"}'; exit 3
output:
  table: domains
  ident: ${.outputJson.h}
  asset: ${.outputJson.h}
"#,
    );
    let store = MemoryStore::default();

    process(&pipe, &seed(), &store, &Notifier::new(None))
        .await
        .unwrap();
    assert_eq!(store.row_count(), 1);
}

#[tokio::test]
async fn empty_ident_skips_the_line() {
    let pipe = pipe_from(
        r#"
name: no_ident
input:
  table: domains
cmd: |-
  echo 'not json'
output:
  table: domains
  ident: ${.outputJson.h}
"#,
    );
    let store = MemoryStore::default();

    process(&pipe, &seed(), &store, &Notifier::new(None))
        .await
        .unwrap();
    assert_eq!(store.row_count(), 0);
}

#[tokio::test]
async fn invalid_asset_syntax_skips_the_line() {
    let pipe = pipe_from(
        r#"
name: bad_asset
input:
  table: domains
cmd: |-
  echo '{"h":"bad_host!"}'
output:
  table: domains
  ident: ${.outputJson.h}
  asset: ${.outputJson.h}
"#,
    );
    let store = MemoryStore::default();

    process(&pipe, &seed(), &store, &Notifier::new(None))
        .await
        .unwrap();
    assert_eq!(store.row_count(), 0);
}

#[tokio::test]
async fn blocklisted_asset_skips_the_line() {
    let pipe = pipe_from(
        r#"
name: blocklisted
input:
  table: domains
cmd: |-
  echo '{"h":"internal.example.com"}'
output:
  table: domains
  ident: ${.outputJson.h}
  asset: ${.outputJson.h}
"#,
    );
    let store = MemoryStore::with_blocked(&["internal.example.com"]);

    process(&pipe, &seed(), &store, &Notifier::new(None))
        .await
        .unwrap();
    assert_eq!(store.row_count(), 0);
    assert!(store.alert_messages().is_empty());
}

#[tokio::test]
async fn debug_mode_logs_without_persisting() {
    let pipe = pipe_from(
        r#"
name: debugging
input:
  table: domains
cmd: |-
  echo '{"h":"sub.example.com"}'
debug: true
output:
  table: domains
  ident: ${.outputJson.h}
"#,
    );
    let store = MemoryStore::default();

    process(&pipe, &seed(), &store, &Notifier::new(None))
        .await
        .unwrap();
    assert_eq!(store.row_count(), 0);
    assert!(store.alert_messages().is_empty());
}

#[tokio::test]
async fn alert_msg_template_feeds_the_alert() {
    let pipe = pipe_from(
        r#"
name: alerting
input:
  table: domains
cmd: |-
  echo '{"h":"sub.example.com"}'
alert_msg: 'new host: ${.outputJson.h}'
output:
  table: domains
  ident: ${.outputJson.h}
  asset: ${.outputJson.h}
"#,
    );
    let store = MemoryStore::default();

    process(&pipe, &seed(), &store, &Notifier::new(None))
        .await
        .unwrap();
    assert_eq!(store.alert_messages(), vec!["new host: sub.example.com"]);
}

#[tokio::test]
async fn as_file_temp_file_is_removed_after_the_run() {
    let mut staged = tempfile::NamedTempFile::new().unwrap();
    writeln!(staged, "one.example.com").unwrap();
    writeln!(staged, "two.example.com").unwrap();
    let (_, path) = staged.keep().unwrap();

    let pipe = pipe_from(
        r#"
name: batched
input:
  table: domains
  as_file: ${.input.asset}
cmd: cat ${.input.as_file}
output:
  table: domains
  ident: ${.output}
  asset: ${.output}
"#,
    );

    let mut data = Data {
        target: "t".to_string(),
        ..Default::default()
    };
    data.data.insert(
        "as_file".to_string(),
        Value::String(path.display().to_string()),
    );

    let store = MemoryStore::default();
    process(&pipe, &data, &store, &Notifier::new(None))
        .await
        .unwrap();

    assert_eq!(store.row_count(), 2);
    assert!(!path.exists(), "temp file must be removed after the job");
}
