//! Shared fixtures for unit tests: a recording connection and a few
//! mapped classes.

use std::sync::{Arc, Mutex};

use tessera_core::{Connection, Error, QueryResult, Result, Row, Value};

use crate::config::StoreConfig;
use crate::database::Database;
use crate::info::{ClassSpec, ColumnSpec, Mapped};
use crate::store::Store;

#[derive(Default)]
struct MockState {
    executed: Vec<(String, Vec<Value>)>,
    responses: Vec<(String, Vec<Vec<Value>>)>,
    failures: Vec<(String, String)>,
    last_insert_id: Option<i64>,
    commits: usize,
    rollbacks: usize,
}

/// Test-side view of the connection behind a mock store.
#[derive(Clone, Default)]
pub(crate) struct MockDb {
    state: Arc<Mutex<MockState>>,
}

impl MockDb {
    /// Answer statements containing `needle` with `rows`. Newer answers
    /// take precedence over older ones.
    pub(crate) fn respond(&self, needle: &str, rows: Vec<Vec<Value>>) {
        let mut state = self.state.lock().unwrap();
        state.responses.retain(|(n, _)| n != needle);
        state.responses.insert(0, (needle.to_string(), rows));
    }

    pub(crate) fn fail_next(&self, needle: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.failures.push((needle.to_string(), message.to_string()));
    }

    pub(crate) fn set_last_insert_id(&self, id: i64) {
        self.state.lock().unwrap().last_insert_id = Some(id);
    }

    pub(crate) fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().unwrap().executed.clone()
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.executed().into_iter().map(|(sql, _)| sql).collect()
    }

    pub(crate) fn clear(&self) {
        self.state.lock().unwrap().executed.clear();
    }

    pub(crate) fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }
}

struct MockConnection {
    db: MockDb,
}

impl Connection for MockConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let mut state = self.db.state.lock().unwrap();
        if let Some(position) = state.failures.iter().position(|(n, _)| sql.contains(n.as_str())) {
            let (_, message) = state.failures.remove(position);
            return Err(Error::Custom(message));
        }
        state.executed.push((sql.to_string(), params.to_vec()));
        let rows = state
            .responses
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();
        let mut result = QueryResult::from_rows(rows.into_iter().map(Row::from_values).collect());
        if sql.starts_with("INSERT") {
            result = result.with_rowcount(1);
            if let Some(id) = state.last_insert_id {
                result = result.with_last_insert_id(id);
            }
        }
        Ok(result)
    }

    fn commit(&mut self) -> Result<()> {
        self.db.state.lock().unwrap().commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.db.state.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}

pub(crate) fn mock_store() -> (Store, MockDb) {
    mock_store_with(StoreConfig::default())
}

pub(crate) fn mock_store_with(config: StoreConfig) -> (Store, MockDb) {
    let db = MockDb::default();
    let store = Store::with_config(Database::new(MockConnection { db: db.clone() }), config);
    (store, db)
}

/// `person(id, name, age)`, attributes sorted as age, id, name.
pub(crate) struct Person;

impl Mapped for Person {
    fn class_spec() -> ClassSpec {
        ClassSpec::new("person")
            .column("id", ColumnSpec::int().primary())
            .column("name", ColumnSpec::text())
            .column("age", ColumnSpec::int())
    }
}

/// `team(id, name)`.
pub(crate) struct Team;

impl Mapped for Team {
    fn class_spec() -> ClassSpec {
        ClassSpec::new("team")
            .column("id", ColumnSpec::int().primary())
            .column("name", ColumnSpec::text())
    }
}

/// `player(id, name, team_id)`, attributes sorted as id, name, team_id.
pub(crate) struct Player;

impl Mapped for Player {
    fn class_spec() -> ClassSpec {
        ClassSpec::new("player")
            .column("id", ColumnSpec::int().primary())
            .column("name", ColumnSpec::text())
            .column("team_id", ColumnSpec::int())
    }
}

/// `membership(team_id, person_id)` link table.
pub(crate) struct Membership;

impl Mapped for Membership {
    fn class_spec() -> ClassSpec {
        ClassSpec::new("membership")
            .column("person_id", ColumnSpec::int())
            .column("team_id", ColumnSpec::int())
            .primary_key(["team_id", "person_id"])
    }
}
