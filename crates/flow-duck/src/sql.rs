//! SQL text for IR expressions and identifiers

use flow_ir::{AggFunc, Aggregation, BinOp, Expr, PostgresConnection, Value};

/// Double-quoted identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quoted string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// libpq `key=value` connection string with every value quoted
pub fn postgres_dsn(pg: &PostgresConnection) -> String {
    [
        ("host", &pg.host),
        ("user", &pg.user),
        ("password", &pg.password),
        ("dbname", &pg.database),
    ]
    .iter()
    .map(|(key, value)| format!("{}={}", key, quote_dsn_value(value)))
    .collect::<Vec<_>>()
    .join(" ")
}

fn quote_dsn_value(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

pub fn render_expr(expr: &Expr) -> String {
    match expr {
        Expr::Literal { value } => render_value(value),
        Expr::Column { name } | Expr::InputColumn { name, .. } => quote_ident(name),
        Expr::BinaryOp { op, left, right } => {
            format!("({} {} {})", render_expr(left), render_op(*op), render_expr(right))
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(x) if x.is_finite() => format!("{:?}", x),
        Value::Float(x) => format!("'{}'::DOUBLE", x),
        Value::String(s) => quote_literal(s),
    }
}

fn render_op(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        BinOp::Eq => "=",
        BinOp::Ne => "<>",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::And => "AND",
        BinOp::Or => "OR",
    }
}

pub fn render_aggregation(agg: &Aggregation) -> String {
    let call = match (agg.func, &agg.column) {
        (AggFunc::Count, None) => "count(*)".to_string(),
        (func, Some(column)) => format!("{}({})", func.name(), quote_ident(column)),
        // Arity is checked by the compiler; only count may omit its column
        (func, None) => format!("{}(*)", func.name()),
    };
    format!("{} AS {}", call, quote_ident(&agg.name))
}

pub fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("order id"), "\"order id\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_postgres_dsn_quotes_values() {
        let pg = PostgresConnection {
            user: "etl".to_string(),
            password: "p w' dbname=other \\x".to_string(),
            host: "db".to_string(),
            database: "app".to_string(),
            table: "orders".to_string(),
        };
        assert_eq!(
            postgres_dsn(&pg),
            r"host='db' user='etl' password='p w\' dbname=other \\x' dbname='app'"
        );
    }

    #[test]
    fn test_render_nested_expression() {
        let expr = Expr::binary(
            BinOp::And,
            Expr::binary(BinOp::Gt, Expr::column("amount"), Expr::literal(Value::Float(100.0))),
            Expr::binary(BinOp::Ne, Expr::column("name"), Expr::literal(Value::String("o'neil".to_string()))),
        );
        assert_eq!(
            render_expr(&expr),
            "((\"amount\" > 100.0) AND (\"name\" <> 'o''neil'))"
        );
    }

    #[test]
    fn test_render_aggregations() {
        let count = Aggregation {
            name: "n".to_string(),
            column: None,
            func: AggFunc::Count,
        };
        let avg = Aggregation {
            name: "avg amount".to_string(),
            column: Some("amount".to_string()),
            func: AggFunc::Avg,
        };
        assert_eq!(render_aggregation(&count), "count(*) AS \"n\"");
        assert_eq!(render_aggregation(&avg), "avg(\"amount\") AS \"avg amount\"");
    }
}
