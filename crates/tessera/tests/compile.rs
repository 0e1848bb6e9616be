//! Statements built from mapped columns, compiled with the generic dialect.

mod common;

use common::{Person, store};
use tessera::{Compiler, Expr, Select, Value, column_of, compile};

#[test]
fn select_of_mapped_columns() {
    let name = column_of::<Person>("name").unwrap();
    let age = column_of::<Person>("age").unwrap();
    let select = Select::new([name.clone()])
        .filter(age.gt(21))
        .order_by([name.desc()])
        .limit(5);

    let compiled = compile(&select.into()).unwrap();
    assert_eq!(
        compiled.sql,
        "SELECT person.name FROM person WHERE person.age > ? ORDER BY person.name DESC LIMIT 5"
    );
    assert!(compiled.sql.ends_with("LIMIT 5"));
    let params: Vec<Value> = compiled
        .params
        .iter()
        .map(|p| p.get(false).unwrap().unwrap_or(Value::Null))
        .collect();
    assert_eq!(params, vec![Value::BigInt(21)]);
}

#[test]
fn result_set_statement_uses_class_columns() {
    let (mut store, _) = store();
    let age = column_of::<Person>("age").unwrap();
    let result = store
        .find::<Person>(Some(age.gt(21)))
        .unwrap()
        .order_by([age.desc()])
        .unwrap()
        .config(Some(true), None, Some(3));
    let compiled = Compiler::default().compile(&result.statement()).unwrap();
    assert_eq!(
        compiled.sql,
        "SELECT DISTINCT person.age, person.id, person.name FROM person \
         WHERE person.age > ? ORDER BY person.age DESC LIMIT 3"
    );
}

#[test]
fn union_of_result_sets() {
    let (mut store, _) = store();
    let age = column_of::<Person>("age").unwrap();
    let young = store.find::<Person>(Some(age.lt(18))).unwrap();
    let old = store.find::<Person>(Some(age.gt(65))).unwrap();
    let both = young.union(&old, false).unwrap();
    let sql = compile(&both.statement()).unwrap().sql;
    assert!(sql.contains(" UNION "));
    assert_eq!(sql.matches("FROM person").count(), 2);
}

#[test]
fn raw_expressions_pass_through() {
    let compiled = compile(&Select::new([Expr::raw("1")]).into()).unwrap();
    assert_eq!(compiled.sql, "SELECT 1");
    assert!(compiled.params.is_empty());
}
