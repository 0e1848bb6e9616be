//! Recording connection and mapped classes shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};

use tessera::{
    ClassSpec, ColumnSpec, Connection, Database, Error, Mapped, QueryResult, Result, Row, Store,
    Value,
};

#[derive(Default)]
struct Recorded {
    executed: Vec<(String, Vec<Value>)>,
    responses: Vec<(String, Vec<Vec<Value>>)>,
    failures: Vec<(String, String)>,
    next_id: Option<i64>,
    commits: usize,
}

/// Shared view of everything a [`MockConnection`] was asked to run.
#[derive(Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<Recorded>>,
}

impl Recorder {
    /// Answer statements containing `needle` with `rows`.
    pub fn respond(&self, needle: &str, rows: Vec<Vec<Value>>) {
        let mut inner = self.inner.lock().unwrap();
        inner.responses.retain(|(n, _)| n != needle);
        inner.responses.insert(0, (needle.to_string(), rows));
    }

    pub fn fail_next(&self, needle: &str, message: &str) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .push((needle.to_string(), message.to_string()));
    }

    /// Identity reported for the next inserts.
    pub fn next_id(&self, id: i64) {
        self.inner.lock().unwrap().next_id = Some(id);
    }

    pub fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.inner.lock().unwrap().executed.clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.executed().into_iter().map(|(sql, _)| sql).collect()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.statements().iter().filter(|s| s.starts_with(prefix)).count()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().executed.clear();
    }

    pub fn commits(&self) -> usize {
        self.inner.lock().unwrap().commits
    }
}

pub struct MockConnection {
    recorder: Recorder,
}

impl MockConnection {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl Connection for MockConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let mut inner = self.recorder.inner.lock().unwrap();
        if let Some(pos) = inner.failures.iter().position(|(n, _)| sql.contains(n.as_str())) {
            let (_, message) = inner.failures.remove(pos);
            return Err(Error::Custom(message));
        }
        inner.executed.push((sql.to_string(), params.to_vec()));
        let rows = inner
            .responses
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();
        let mut result = QueryResult::from_rows(rows.into_iter().map(Row::from_values).collect());
        if sql.starts_with("INSERT") || sql.starts_with("UPDATE") || sql.starts_with("DELETE") {
            result = result.with_rowcount(1);
        }
        if sql.starts_with("INSERT") {
            if let Some(id) = inner.next_id {
                result = result.with_last_insert_id(id);
            }
        }
        Ok(result)
    }

    fn commit(&mut self) -> Result<()> {
        self.recorder.inner.lock().unwrap().commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Route tracing output through the test harness once per binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn store() -> (Store, Recorder) {
    init_tracing();
    let recorder = Recorder::default();
    let store = Store::new(Database::new(MockConnection::new(recorder.clone())));
    (store, recorder)
}

/// `person(id, name, age)`; variables are ordered age, id, name.
pub struct Person;

impl Mapped for Person {
    fn class_spec() -> ClassSpec {
        ClassSpec::new("person")
            .column("id", ColumnSpec::int().primary())
            .column("name", ColumnSpec::text())
            .column("age", ColumnSpec::int())
    }
}

pub fn person_row(id: i64, name: &str, age: i64) -> Vec<Value> {
    vec![Value::BigInt(age), Value::BigInt(id), Value::Text(name.to_string())]
}

/// `team(id, name)`.
pub struct Team;

impl Mapped for Team {
    fn class_spec() -> ClassSpec {
        ClassSpec::new("team")
            .column("id", ColumnSpec::int().primary())
            .column("name", ColumnSpec::text())
    }
}

/// `player(id, name, team_id)`.
pub struct Player;

impl Mapped for Player {
    fn class_spec() -> ClassSpec {
        ClassSpec::new("player")
            .column("id", ColumnSpec::int().primary())
            .column("name", ColumnSpec::text())
            .column("team_id", ColumnSpec::int())
    }
}
