//! Table constraint enforcement: primary key, unique and check
//! constraints evaluated before a mutation links its pending version.

use heron_common::{Datum, OwnedRow, TxnError};
use serde::{Deserialize, Serialize};

use crate::schema::Schema;

/// A constraint attached to a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableConstraint {
    PrimaryKey { columns: Vec<String> },
    Unique { name: String, columns: Vec<String> },
    Check { name: String, expression: String },
}

impl TableConstraint {
    pub fn name(&self) -> &str {
        match self {
            TableConstraint::PrimaryKey { .. } => "primary_key",
            TableConstraint::Unique { name, .. } => name,
            TableConstraint::Check { name, .. } => name,
        }
    }
}

fn violation(name: &str, columns: &[String], detail: String) -> TxnError {
    TxnError::ConstraintViolation {
        name: name.to_string(),
        columns: columns.to_vec(),
        detail,
    }
}

/// Comparison operator of a check expression term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn parse(s: &str) -> Option<CmpOp> {
        match s {
            "=" | "==" => Some(CmpOp::Eq),
            "!=" | "<>" => Some(CmpOp::Ne),
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::Le),
            ">" => Some(CmpOp::Gt),
            ">=" => Some(CmpOp::Ge),
            _ => None,
        }
    }
}

/// One `column <op> literal` term.
#[derive(Debug, Clone)]
struct CheckTerm {
    column: String,
    op: CmpOp,
    literal: Datum,
}

impl CheckTerm {
    /// Three-valued result: `None` when the column is NULL or the
    /// comparison is not defined for the operand types.
    fn eval(&self, schema: &Schema, row: &OwnedRow) -> Option<bool> {
        let value = schema.value(row, &self.column)?;
        let ord = value.compare(&self.literal)?;
        Some(match self.op {
            CmpOp::Eq => ord == std::cmp::Ordering::Equal,
            CmpOp::Ne => ord != std::cmp::Ordering::Equal,
            CmpOp::Lt => ord == std::cmp::Ordering::Less,
            CmpOp::Le => ord != std::cmp::Ordering::Greater,
            CmpOp::Gt => ord == std::cmp::Ordering::Greater,
            CmpOp::Ge => ord != std::cmp::Ordering::Less,
        })
    }
}

/// A parsed check expression: comparison terms joined with AND.
#[derive(Debug, Clone)]
pub struct CheckExpr {
    terms: Vec<CheckTerm>,
}

impl CheckExpr {
    pub fn parse(expression: &str) -> Result<CheckExpr, String> {
        let mut terms = Vec::new();
        for clause in split_and(expression) {
            let tokens = tokenize(&clause)?;
            if tokens.len() != 3 {
                return Err(format!(
                    "expected `column <op> literal`, found `{}`",
                    clause.trim()
                ));
            }
            let op = CmpOp::parse(&tokens[1])
                .ok_or_else(|| format!("unknown operator `{}`", tokens[1]))?;
            let literal = parse_literal(&tokens[2])?;
            terms.push(CheckTerm {
                column: tokens[0].to_ascii_lowercase(),
                op,
                literal,
            });
        }
        if terms.is_empty() {
            return Err("empty expression".to_string());
        }
        Ok(CheckExpr { terms })
    }

    /// SQL semantics: the row passes only when every term is true; a
    /// NULL term fails the check.
    pub fn passes(&self, schema: &Schema, row: &OwnedRow) -> bool {
        self.terms
            .iter()
            .all(|t| t.eval(schema, row) == Some(true))
    }
}

fn split_and(expression: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let chars: Vec<char> = expression.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\'' {
            in_string = !in_string;
        }
        if !in_string
            && i + 3 <= chars.len()
            && chars[i..i + 3]
                .iter()
                .collect::<String>()
                .eq_ignore_ascii_case("and")
            && (i == 0 || chars[i - 1].is_whitespace())
            && chars.get(i + 3).map_or(false, |c| c.is_whitespace())
        {
            clauses.push(std::mem::take(&mut current));
            i += 3;
            continue;
        }
        current.push(chars[i]);
        i += 1;
    }
    clauses.push(current);
    clauses
}

fn tokenize(clause: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = clause.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' {
            chars.next();
            let mut s = String::from("'");
            let mut closed = false;
            for ch in chars.by_ref() {
                if ch == '\'' {
                    closed = true;
                    break;
                }
                s.push(ch);
            }
            if !closed {
                return Err("unterminated string literal".to_string());
            }
            s.push('\'');
            tokens.push(s);
        } else if "=!<>".contains(c) {
            let mut op = String::new();
            while let Some(&c) = chars.peek() {
                if "=!<>".contains(c) {
                    op.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(op);
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || "=!<>".contains(c) {
                    break;
                }
                word.push(c);
                chars.next();
            }
            tokens.push(word);
        }
    }
    Ok(tokens)
}

fn parse_literal(token: &str) -> Result<Datum, String> {
    if let Some(inner) = token.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Ok(Datum::Text(inner.to_string()));
    }
    match token.to_ascii_lowercase().as_str() {
        "null" => return Ok(Datum::Null),
        "true" => return Ok(Datum::Boolean(true)),
        "false" => return Ok(Datum::Boolean(false)),
        _ => {}
    }
    if let Ok(i) = token.parse::<i64>() {
        return Ok(Datum::Int64(i));
    }
    if let Ok(f) = token.parse::<f64>() {
        return Ok(Datum::Float64(f));
    }
    Err(format!("unparseable literal `{token}`"))
}

/// Validate a proposed row against every constraint of its collection.
///
/// `has_visible_match(indices, values)` answers whether any other row
/// visible to the writing transaction carries the same values at the
/// given column indices; the engine supplies it bound to the snapshot.
pub fn validate<F>(
    constraints: &[TableConstraint],
    schema: &Schema,
    row: &OwnedRow,
    mut has_visible_match: F,
) -> Result<(), TxnError>
where
    F: FnMut(&[usize], &[Datum]) -> bool,
{
    for constraint in constraints {
        match constraint {
            TableConstraint::PrimaryKey { columns }
            | TableConstraint::Unique { columns, .. } => {
                let name = constraint.name();
                let mut indices = Vec::with_capacity(columns.len());
                for column in columns {
                    let idx = schema.index_of(column).ok_or_else(|| {
                        violation(name, columns, format!("unknown column `{column}`"))
                    })?;
                    indices.push(idx);
                }
                let values: Vec<Datum> = indices
                    .iter()
                    .map(|&i| row.get(i).cloned().unwrap_or(Datum::Null))
                    .collect();
                if matches!(constraint, TableConstraint::PrimaryKey { .. })
                    && values.iter().any(Datum::is_null)
                {
                    return Err(violation(
                        name,
                        columns,
                        "primary key column is NULL".to_string(),
                    ));
                }
                // NULL never matches NULL, so nullable unique values
                // fall through the visibility scan on their own.
                if has_visible_match(&indices, &values) {
                    return Err(violation(
                        name,
                        columns,
                        format!(
                            "duplicate value ({})",
                            values
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join(", ")
                        ),
                    ));
                }
            }
            TableConstraint::Check { name, expression } => {
                let expr = CheckExpr::parse(expression).map_err(|reason| {
                    violation(name, &[], format!("invalid expression `{expression}`: {reason}"))
                })?;
                if !expr.passes(schema, row) {
                    return Err(violation(
                        name,
                        &[],
                        format!("row {row} fails `{expression}`"),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec!["id", "email", "age"])
    }

    fn row(id: i64, email: &str, age: i64) -> OwnedRow {
        OwnedRow::new(vec![
            Datum::Int64(id),
            Datum::Text(email.to_string()),
            Datum::Int64(age),
        ])
    }

    #[test]
    fn test_check_expr_parse_and_eval() {
        let expr = CheckExpr::parse("age >= 18 AND age < 150").unwrap();
        assert!(expr.passes(&schema(), &row(1, "a@b", 30)));
        assert!(!expr.passes(&schema(), &row(1, "a@b", 10)));
        assert!(!expr.passes(&schema(), &row(1, "a@b", 150)));
    }

    #[test]
    fn test_check_expr_null_is_falsy() {
        let expr = CheckExpr::parse("age > 0").unwrap();
        let r = OwnedRow::new(vec![Datum::Int64(1), Datum::Text("a@b".into()), Datum::Null]);
        assert!(!expr.passes(&schema(), &r));
    }

    #[test]
    fn test_check_expr_string_literal() {
        let expr = CheckExpr::parse("email != 'blocked user'").unwrap();
        assert!(expr.passes(&schema(), &row(1, "a@b", 1)));
        assert!(!expr.passes(&schema(), &row(1, "blocked user", 1)));
    }

    #[test]
    fn test_check_expr_rejects_garbage() {
        assert!(CheckExpr::parse("").is_err());
        assert!(CheckExpr::parse("age").is_err());
        assert!(CheckExpr::parse("age ~ 3").is_err());
        assert!(CheckExpr::parse("age > 'open").is_err());
    }

    #[test]
    fn test_unique_violation_names_constraint_and_column() {
        let constraints = vec![TableConstraint::Unique {
            name: "users_email_key".to_string(),
            columns: vec!["email".to_string()],
        }];
        let err = validate(&constraints, &schema(), &row(1, "a@b.com", 30), |_, _| true)
            .unwrap_err();
        match err {
            TxnError::ConstraintViolation { name, columns, .. } => {
                assert_eq!(name, "users_email_key");
                assert_eq!(columns, vec!["email".to_string()]);
            }
            other => panic!("expected constraint violation, got {other:?}"),
        }
    }

    #[test]
    fn test_unique_passes_without_match() {
        let constraints = vec![TableConstraint::Unique {
            name: "users_email_key".to_string(),
            columns: vec!["email".to_string()],
        }];
        assert!(validate(&constraints, &schema(), &row(1, "a@b.com", 30), |_, _| false).is_ok());
    }

    #[test]
    fn test_primary_key_rejects_null() {
        let constraints = vec![TableConstraint::PrimaryKey {
            columns: vec!["id".to_string()],
        }];
        let r = OwnedRow::new(vec![Datum::Null, Datum::Text("a@b".into()), Datum::Int64(1)]);
        let err = validate(&constraints, &schema(), &r, |_, _| false).unwrap_err();
        assert!(matches!(err, TxnError::ConstraintViolation { .. }));
    }

    #[test]
    fn test_check_violation_names_expression() {
        let constraints = vec![TableConstraint::Check {
            name: "age_positive".to_string(),
            expression: "age > 0".to_string(),
        }];
        let err = validate(&constraints, &schema(), &row(1, "a@b", -5), |_, _| false)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("age_positive"));
        assert!(msg.contains("age > 0"));
    }

    #[test]
    fn test_unknown_constraint_column() {
        let constraints = vec![TableConstraint::Unique {
            name: "bad".to_string(),
            columns: vec!["missing".to_string()],
        }];
        assert!(validate(&constraints, &schema(), &row(1, "a@b", 1), |_, _| false).is_err());
    }
}
