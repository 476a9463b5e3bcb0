//! Executing compiled units and test blocks against the in-memory backend

mod common;

use std::collections::HashMap;

use common::{float, int, shop_backend, text, MemoryBackend};
use flow_compiler::prelude::*;
use flow_compiler::{RuntimeError, SecretResolver};
use flow_ir::{BackendError, ResolvedSource};

fn secrets(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn no_secrets() -> Executor<HashMap<String, String>> {
    Executor::new(HashMap::new())
}

#[test]
fn test_execute_pipeline_into_sink() {
    let unit = compile_str(
        r#"
        orders = Source.File(path: "orders.csv")
        sink out = Sink.File(path: "out.csv")
        orders
            |> filter(amount >= 100)
            |> mutate(with_tax = amount * 1.5)
            |> sort(with_tax, desc)
            |> select(id, with_tax)
            |> out
        "#,
    )
    .unwrap();

    let mut backend = shop_backend();
    let report = no_secrets().execute(&unit.operations, &mut backend).unwrap();
    assert_eq!(report.operations, unit.len());
    assert_eq!(report.persisted, 1);

    let (_, written) = &backend.persisted[0];
    assert_eq!(written.columns, vec!["id", "with_tax"]);
    assert_eq!(written.column("id"), vec![int(3), int(1)]);
    assert_eq!(written.column("with_tax"), vec![float(450.0), float(180.0)]);
}

#[test]
fn test_one_backend_call_per_operation() {
    let unit = compile_str(
        r#"
        orders = Source.File(path: "orders.csv")
        customers = Source.File(path: "customers.csv")
        both = join(orders, customers, on: orders.customer == customers.customer)
        both |> group_by(city) |> aggregate(total = sum(amount), n = count())
        "#,
    )
    .unwrap();

    let mut backend = shop_backend();
    no_secrets().execute(&unit.operations, &mut backend).unwrap();

    let called: Vec<_> = backend.calls.iter().map(|c| c.split(' ').next().unwrap_or("")).collect();
    let emitted: Vec<_> = unit.operations.iter().map(Operation::kind).collect();
    assert_eq!(called, emitted);
}

#[test]
fn test_group_aggregate_results() {
    let unit = compile_str(
        r#"
        orders = Source.File(path: "orders.csv")
        sink out = Sink.File(path: "out.csv")
        orders |> group_by(customer) |> aggregate(total = sum(amount), n = count(), avg_amount = mean(amount)) |> out
        "#,
    )
    .unwrap();

    let mut backend = shop_backend();
    no_secrets().execute(&unit.operations, &mut backend).unwrap();

    let (_, written) = &backend.persisted[0];
    assert_eq!(written.columns, vec!["customer", "total", "n", "avg_amount"]);
    let ada = written
        .rows
        .iter()
        .find(|r| r["customer"] == text("ada"))
        .unwrap();
    assert_eq!(ada["total"], float(420.0));
    assert_eq!(ada["n"], int(2));
    assert_eq!(ada["avg_amount"], float(210.0));
}

#[test]
fn test_missing_secret_is_a_runtime_error() {
    let unit = compile_str(
        r#"
        users = Source.Postgres(user: "etl", password: env("PG_PASSWORD"), host: "db", database: "app", table: "orders.csv")
        "#,
    )
    .unwrap();

    let mut backend = shop_backend();
    let err = no_secrets().execute(&unit.operations, &mut backend).unwrap_err();
    assert!(matches!(&err, RuntimeError::MissingSecret(missing) if missing.name == "PG_PASSWORD"));
    assert!(backend.calls.is_empty());

    let executor = Executor::new(secrets(&[("PG_PASSWORD", "hunter2")]));
    executor.execute(&unit.operations, &mut backend).unwrap();
    match &backend.loaded[0] {
        ResolvedSource::Postgres(pg) => {
            assert_eq!(pg.password, "hunter2");
            assert!(!format!("{:?}", pg).contains("hunter2"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_secret_resolvers() {
    let map = secrets(&[("A", "1")]);
    assert_eq!(map.lookup("A").as_deref(), Some("1"));
    assert_eq!(map.lookup("B"), None);
}

#[test]
fn test_backend_failure_names_operation() {
    let unit = compile_str(r#"missing = Source.File(path: "nowhere.csv")"#).unwrap();
    let err = no_secrets().execute(&unit.operations, &mut MemoryBackend::new()).unwrap_err();
    assert!(matches!(err, RuntimeError::BackendFailure { operation: "load", .. }));
}

#[test]
fn test_assert_on_aggregate_output() {
    let unit = compile_str(
        r#"
        schema Order { id: int, customer: string, amount: float }
        orders = Source.File(path: "orders.csv") using Order
        totals = orders |> group_by(customer) |> aggregate(total = sum(amount), n = count())
        assert totals.total >= 50
        "#,
    )
    .unwrap();

    let report = no_secrets().execute(&unit.operations, &mut shop_backend()).unwrap();
    assert_eq!(report.assertions, 1);
}

#[test]
fn test_literal_assertions_evaluated_in_process() {
    let unit = compile_str("assert 2 * 3 == 6").unwrap();
    let mut backend = MemoryBackend::new();
    no_secrets().execute(&unit.operations, &mut backend).unwrap();
    assert!(backend.calls.is_empty());

    let unit = compile_str("assert 1 > 2").unwrap();
    let err = no_secrets().execute(&unit.operations, &mut backend).unwrap_err();
    assert!(matches!(err, RuntimeError::AssertionFailed { assertion } if assertion == "1 > 2"));
}

const TESTS: &str = r#"
# Test blocks never see this declaration
schema Order { id: int, customer: string, amount: float }

test "large orders are large" {
    schema Order { id: int, customer: string, amount: float }
    orders = Source.File(path: "orders.csv") using Order
    large = orders |> filter(amount > 100)
    assert large.amount > 100
}

test "every order is small" {
    orders = Source.File(path: "orders.csv")
    assert orders.amount < 100
}

test "reads a missing file" {
    orders = Source.File(path: "missing.csv")
    assert orders.amount > 0
}

test "uses an unknown column" {
    schema Order { id: int }
    orders = Source.File(path: "orders.csv") using Order
    orders |> select(amount)
}

test "sees no top-level schema" {
    orders = Source.File(path: "orders.csv") using Order
}

test "empty relations pass vacuously" {
    orders = Source.File(path: "orders.csv")
    none = orders |> filter(amount > 1000)
    assert none.amount < 0
}
"#;

fn expected_outcomes(report: &TestReport) {
    let outcomes: Vec<_> = report.results.iter().map(|r| (r.name.as_str(), &r.outcome)).collect();
    assert_eq!(outcomes[0], ("large orders are large", &TestOutcome::Passed));
    assert_eq!(
        outcomes[1],
        ("every order is small", &TestOutcome::Failed("orders.amount < 100".to_string()))
    );
    assert!(matches!(outcomes[2], ("reads a missing file", TestOutcome::Error(_))));
    assert!(matches!(outcomes[3], ("uses an unknown column", TestOutcome::Error(e)) if e.contains("UnknownColumn")));
    assert!(matches!(outcomes[4], ("sees no top-level schema", TestOutcome::Error(e)) if e.contains("UnknownSchema")));
    assert_eq!(outcomes[5], ("empty relations pass vacuously", &TestOutcome::Passed));

    assert_eq!(report.passed(), 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.errored(), 3);
    assert!(!report.succeeded());
}

#[test]
fn test_runner_isolates_blocks() {
    let program = flow_ast::parse(TESTS).unwrap();
    let runner = TestRunner::new(no_secrets());
    let report = runner.run(&program, || Ok::<_, BackendError>(shop_backend()));
    expected_outcomes(&report);
}

#[test]
fn test_parallel_runner_keeps_source_order() {
    let program = flow_ast::parse(TESTS).unwrap();
    let runner = TestRunner::new(no_secrets());
    let report = runner.run_parallel(&program, || Ok::<_, BackendError>(shop_backend()));
    expected_outcomes(&report);
}

#[test]
fn test_backend_factory_failure_is_an_error() {
    let program = flow_ast::parse(r#"test "t" { assert 1 == 1 }"#).unwrap();
    let runner = TestRunner::new(no_secrets());
    let report = runner.run(&program, || {
        Err::<MemoryBackend, _>(BackendError::Unsupported("no database".to_string()))
    });
    assert_eq!(report.errored(), 1);
}

#[test]
fn test_all_passing_run_succeeds() {
    let program = flow_ast::parse(
        r#"
        test "a" { assert 1 == 1 }
        test "b" { assert "x" + "y" == "xy" }
        "#,
    )
    .unwrap();
    let report = TestRunner::new(no_secrets()).run(&program, || Ok::<_, BackendError>(MemoryBackend::new()));
    assert!(report.succeeded());
    assert_eq!(report.passed(), 2);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["results"][0]["outcome"]["status"], "Passed");
}
