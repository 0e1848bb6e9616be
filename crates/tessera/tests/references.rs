//! References through the public surface, with stores opened by URI.

mod common;

use std::sync::LazyLock;

use common::{MockConnection, Player, Recorder, Team, init_tracing};
use tessera::{Database, Reference, ReferenceSet, Store, Value, create_store, register_scheme};

static TEAM: LazyLock<Reference> =
    LazyLock::new(|| Reference::new::<Player, Team, _, _>(["team_id"], ["id"]));
static PLAYERS: LazyLock<ReferenceSet> = LazyLock::new(|| {
    ReferenceSet::new::<Team, Player, _, _>(["id"], ["team_id"])
        .order_by([tessera::column_of::<Player>("name").map(|c| c.desc()).unwrap()])
});

fn open(name: &str) -> (Store, Recorder) {
    init_tracing();
    let recorder = Recorder::default();
    let shared = recorder.clone();
    register_scheme(name, move |_| Ok(Database::new(MockConnection::new(shared.clone()))));
    let store = create_store(&format!("{name}://localhost/league?cache_size=2")).unwrap();
    (store, recorder)
}

#[test]
fn uri_options_configure_the_store() {
    let (store, _) = open("mock-config");
    assert_eq!(store.config().cache_size, 2);
}

#[test]
fn generated_team_key_reaches_the_player_row() {
    let (mut store, db) = open("mock-generated");
    db.next_id(10);
    db.respond("SELECT team.id FROM team", vec![vec![Value::BigInt(10)]]);

    let team = store.create::<Team>().unwrap();
    store.set_value(team, "name", "Reds").unwrap();
    let player = store.create::<Player>().unwrap();
    store.set_value(player, "id", 1).unwrap();
    store.set_value(player, "name", "Ann").unwrap();

    TEAM.set(&mut store, player, Some(team)).unwrap();
    store.add(player).unwrap();
    store.commit().unwrap();

    let inserts: Vec<(String, Vec<Value>)> = db
        .executed()
        .into_iter()
        .filter(|(sql, _)| sql.starts_with("INSERT"))
        .collect();
    assert_eq!(inserts.len(), 2);
    assert!(inserts[0].0.starts_with("INSERT INTO team"));
    assert!(inserts[1].0.starts_with("INSERT INTO player"));
    assert_eq!(inserts[1].1[2], Value::BigInt(10));
}

#[test]
fn reference_set_queries_follow_the_foreign_key() {
    let (mut store, db) = open("mock-set");
    db.respond(
        "FROM team WHERE team.id = ?",
        vec![vec![Value::BigInt(3), Value::Text("Reds".into())]],
    );
    let team = store.get::<Team>(3).unwrap().unwrap();

    db.respond(
        "FROM player WHERE player.team_id = ?",
        vec![
            vec![Value::BigInt(8), Value::Text("Cy".into()), Value::BigInt(3)],
            vec![Value::BigInt(7), Value::Text("Bo".into()), Value::BigInt(3)],
        ],
    );
    let players = PLAYERS.bind(team).unwrap();
    let all = players.all(&mut store).unwrap();
    assert_eq!(all.len(), 2);
    assert!(
        db.statements()
            .last()
            .unwrap()
            .ends_with("WHERE player.team_id = ? ORDER BY player.name DESC")
    );

    let cy = all[0];
    assert_eq!(TEAM.get(&mut store, cy).unwrap(), Some(team));
}
