//! Compiled Flow programs executed on DuckDB against CSV fixtures

use std::fs;
use std::path::PathBuf;

use flow_compiler::{compile_str, Executor, RuntimeError, TestOutcome, TestRunner};
use flow_duck::DuckBackend;
use flow_ir::{Operation, Value};

/// A scratch directory under the system temp dir, removed on drop
struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("flow-duck-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        Self { dir }
    }

    fn write(&self, file: &str, contents: &str) -> String {
        let path = self.dir.join(file);
        fs::write(&path, contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn path(&self, file: &str) -> String {
        self.dir.join(file).to_string_lossy().into_owned()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

const ORDERS: &str = "id,customer,amount\n1,ada,120.0\n2,bob,80.0\n3,ada,300.0\n4,cy,50.0\n";
const CUSTOMERS: &str = "customer,city\nada,London\nbob,Paris\n";

fn executor() -> Executor<std::collections::HashMap<String, String>> {
    Executor::new(Default::default())
}

#[test]
fn test_pipeline_writes_csv_sink() -> Result<(), Box<dyn std::error::Error>> {
    let scratch = Scratch::new("sink");
    let orders = scratch.write("orders.csv", ORDERS);
    let out = scratch.path("big.csv");

    let unit = compile_str(&format!(
        r#"
        schema Order {{ id: int, customer: string, amount: float }}
        orders = Source.File(path: "{}") using Order
        sink big = Sink.File(path: "{}")
        orders |> filter(amount > 100) |> sort(amount, desc) |> select(id, amount) |> big
        "#,
        orders, out
    ))?;

    let mut backend = DuckBackend::new()?;
    executor().execute(&unit.operations, &mut backend)?;

    let written = fs::read_to_string(&out)?;
    let lines: Vec<_> = written.lines().collect();
    assert_eq!(lines[0], "id,amount");
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("3,"));
    Ok(())
}

#[test]
fn test_join_and_aggregate() -> Result<(), Box<dyn std::error::Error>> {
    let scratch = Scratch::new("join");
    let orders = scratch.write("orders.csv", ORDERS);
    let customers = scratch.write("customers.csv", CUSTOMERS);

    let unit = compile_str(&format!(
        r#"
        orders = Source.File(path: "{}")
        customers = Source.File(path: "{}")
        both = join(orders, customers, on: orders.customer == customers.customer)
        totals = both |> group_by(city) |> aggregate(total = sum(amount), n = count()) |> sort(city)
        "#,
        orders, customers
    ))?;

    let mut backend = DuckBackend::new()?;
    executor().execute(&unit.operations, &mut backend)?;

    let last = unit
        .operations
        .iter()
        .rev()
        .find_map(Operation::output)
        .expect("pipeline produces a relation");
    let result = backend.fetch(last)?;
    assert_eq!(result.columns, vec!["city", "total", "n"]);
    assert_eq!(
        result.column("city"),
        Some(vec![Value::String("London".into()), Value::String("Paris".into())])
    );
    assert_eq!(result.column("total"), Some(vec![Value::Float(420.0), Value::Float(80.0)]));
    assert_eq!(result.column("n"), Some(vec![Value::Int(2), Value::Int(1)]));
    Ok(())
}

#[test]
fn test_missing_file_is_backend_failure() -> Result<(), Box<dyn std::error::Error>> {
    let scratch = Scratch::new("missing");
    let unit = compile_str(&format!(
        r#"orders = Source.File(path: "{}")"#,
        scratch.path("absent.csv")
    ))?;

    let err = executor()
        .execute(&unit.operations, &mut DuckBackend::new()?)
        .unwrap_err();
    assert!(matches!(err, RuntimeError::BackendFailure { operation: "load", .. }));
    Ok(())
}

#[test]
fn test_test_blocks_on_duckdb() -> Result<(), Box<dyn std::error::Error>> {
    let scratch = Scratch::new("tests");
    let orders = scratch.write("orders.csv", ORDERS);

    let program = flow_ast::parse(&format!(
        r#"
        test "filter keeps large orders" {{
            orders = Source.File(path: "{path}")
            large = orders |> filter(amount > 100)
            assert large.amount > 100
        }}

        test "not every order is large" {{
            orders = Source.File(path: "{path}")
            assert orders.amount > 100
        }}
        "#,
        path = orders
    ))?;

    let runner = TestRunner::new(executor());
    let report = runner.run_parallel(&program, DuckBackend::fresh);

    assert_eq!(report.results[0].outcome, TestOutcome::Passed);
    assert_eq!(
        report.results[1].outcome,
        TestOutcome::Failed("orders.amount > 100".to_string())
    );
    Ok(())
}
