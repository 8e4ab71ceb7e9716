//! Print-only store for `--noDb` runs.
//!
//! Accepts everything, persists nothing, writes each would-be record to
//! stdout. `should_run` always answers true so every asset is processed.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use trawl_core::data::{AlertType, Data};

use crate::{Result, Store};

pub struct PrintStore;

#[async_trait]
impl Store for PrintStore {
    async fn setup_schema(&self, _tables: &[String]) -> Result<()> {
        Ok(())
    }

    async fn add_task(&self, _pipe: &str, _ident: &str, _note: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn should_run(&self, _pipe: &str, _ident: &str, _interval: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn retrieve(
        &self,
        _table: &str,
        _pipe: &str,
        _filter: &BTreeMap<String, String>,
        _threshold: &BTreeMap<String, f64>,
        _interval: Duration,
    ) -> Result<Vec<Data>> {
        Ok(Vec::new())
    }

    async fn retrieve_by_target(
        &self,
        _table: &str,
        _filter: &BTreeMap<String, String>,
        _target: &str,
    ) -> Result<Vec<Data>> {
        Ok(Vec::new())
    }

    async fn retrieve_targets(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn retrieve_blocked(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn save(
        &self,
        table: &str,
        pipe: &str,
        id: &str,
        data: &Data,
        result: Map<String, Value>,
    ) -> Result<bool> {
        println!("table={table} ident={id} pipe={pipe} asset={}", data.asset);
        println!("result={}", Value::Object(result));
        Ok(true)
    }

    async fn save_alert(
        &self,
        _pipe: &str,
        _ident: &str,
        _message: &str,
        _alert_type: AlertType,
    ) -> Result<()> {
        Ok(())
    }
}
