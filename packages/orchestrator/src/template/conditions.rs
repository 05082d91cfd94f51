//! Condition expression evaluation.
//!
//! Infix comparisons (`==  !=  <  <=  >  >=`), `contains`, the postfix
//! `is_not_empty` operator, boolean `and` / `or` / `not`, and truthy
//! bareword variables. Operands are numbers, quoted strings, `true` /
//! `false` / `null` literals, or dotted variable paths. Any evaluation
//! failure yields `false`.

use serde_json::{Map, Value};

use super::engine::lookup_path;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Operand(String),
    Op(String),
    And,
    Or,
    Not,
    IsNotEmpty,
}

fn tokenize(expr: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    let mut current = String::new();

    let flush = |current: &mut String, tokens: &mut Vec<Token>| {
        if current.is_empty() {
            return;
        }
        let word = std::mem::take(current);
        let token = match word.as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "is_not_empty" => Token::IsNotEmpty,
            "contains" => Token::Op("contains".to_string()),
            "==" | "!=" | "<" | "<=" | ">" | ">=" => Token::Op(word),
            _ => Token::Operand(word),
        };
        tokens.push(token);
    };

    while let Some(ch) = chars.next() {
        match ch {
            '\'' | '"' => {
                flush(&mut current, &mut tokens);
                let quote = ch;
                let mut literal = String::from(quote);
                for inner in chars.by_ref() {
                    if inner == quote {
                        break;
                    }
                    literal.push(inner);
                }
                literal.push(quote);
                tokens.push(Token::Operand(literal));
            }
            c if c.is_whitespace() => flush(&mut current, &mut tokens),
            '=' | '!' | '<' | '>' => {
                if !current.is_empty() && !current.chars().all(|c| "=!<>".contains(c)) {
                    flush(&mut current, &mut tokens);
                }
                current.push(ch);
                if chars.peek() == Some(&'=') {
                    current.push('=');
                    chars.next();
                }
                flush(&mut current, &mut tokens);
            }
            _ => current.push(ch),
        }
    }
    flush(&mut current, &mut tokens);
    tokens
}

/// Resolve an operand token to a JSON value.
fn resolve_operand(raw: &str, vars: &Map<String, Value>) -> Value {
    let trimmed = raw.trim();
    if (trimmed.starts_with('\'') && trimmed.ends_with('\'') && trimmed.len() >= 2)
        || (trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2)
    {
        return Value::String(trimmed[1..trimmed.len() - 1].to_string());
    }
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" | "None" => return Value::Null,
        _ => {}
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        return Value::from(float);
    }
    lookup_path(vars, trimmed).unwrap_or(Value::Null)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(left: &Value, op: &str, right: &Value) -> bool {
    match op {
        "==" => values_equal(left, right),
        "!=" => !values_equal(left, right),
        "contains" => match (left, right) {
            (Value::String(haystack), needle) => {
                let needle = match needle {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                haystack.contains(&needle)
            }
            (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
        "<" | "<=" | ">" | ">=" => {
            if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
                match op {
                    "<" => l < r,
                    "<=" => l <= r,
                    ">" => l > r,
                    ">=" => l >= r,
                    _ => false,
                }
            } else if let (Value::String(l), Value::String(r)) = (left, right) {
                match op {
                    "<" => l < r,
                    "<=" => l <= r,
                    ">" => l > r,
                    ">=" => l >= r,
                    _ => false,
                }
            } else {
                false
            }
        }
        _ => false,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    // Numeric equality across int/float/string forms
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l == r;
    }
    // String form comparison as a last resort ("true" == true)
    match (left, right) {
        (Value::String(s), other) | (other, Value::String(s)) => {
            s == &value_string(other)
        }
        _ => false,
    }
}

fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate one comparison clause (a slice of tokens with no and/or).
fn eval_clause(tokens: &[Token], vars: &Map<String, Value>) -> bool {
    match tokens {
        [] => false,
        [Token::Not, rest @ ..] => !eval_clause(rest, vars),
        [Token::Operand(operand)] => truthy(&resolve_operand(operand, vars)),
        [Token::Operand(operand), Token::IsNotEmpty] => {
            truthy(&resolve_operand(operand, vars))
        }
        [Token::Operand(left), Token::Op(op), Token::Operand(right)] => {
            compare(&resolve_operand(left, vars), op, &resolve_operand(right, vars))
        }
        _ => false,
    }
}

/// Evaluate a condition expression. `or` binds looser than `and`; evaluation
/// failures yield `false`.
pub fn evaluate_condition(expr: &str, vars: &Map<String, Value>) -> bool {
    let tokens = tokenize(expr);
    if tokens.is_empty() {
        return false;
    }
    tokens
        .split(|t| *t == Token::Or)
        .any(|or_term| {
            !or_term.is_empty()
                && or_term
                    .split(|t| *t == Token::And)
                    .all(|and_term| eval_clause(and_term, vars))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Map<String, Value> {
        json!({
            "count": 5,
            "name": "ada",
            "flag": true,
            "items": ["a", "b"],
            "empty_list": [],
            "user": {"role": "admin"},
            "price": 2.5
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn numeric_comparisons() {
        assert!(evaluate_condition("count == 5", &vars()));
        assert!(evaluate_condition("count != 4", &vars()));
        assert!(evaluate_condition("count > 4", &vars()));
        assert!(evaluate_condition("count >= 5", &vars()));
        assert!(evaluate_condition("count < 6", &vars()));
        assert!(evaluate_condition("count <= 5", &vars()));
        assert!(!evaluate_condition("count > 5", &vars()));
    }

    #[test]
    fn rendered_literal_comparisons() {
        // Conditions arrive template-rendered, so both sides may be literals
        assert!(evaluate_condition("5 == 5", &vars()));
        assert!(evaluate_condition("'x' != 'y'", &vars()));
        assert!(!evaluate_condition("3 >= 4", &vars()));
    }

    #[test]
    fn string_comparisons() {
        assert!(evaluate_condition("name == 'ada'", &vars()));
        assert!(evaluate_condition("name != \"bob\"", &vars()));
    }

    #[test]
    fn dotted_path_operand() {
        assert!(evaluate_condition("user.role == 'admin'", &vars()));
    }

    #[test]
    fn contains_operator() {
        assert!(evaluate_condition("name contains 'ad'", &vars()));
        assert!(evaluate_condition("items contains 'a'", &vars()));
        assert!(!evaluate_condition("items contains 'z'", &vars()));
    }

    #[test]
    fn is_not_empty_operator() {
        assert!(evaluate_condition("items is_not_empty", &vars()));
        assert!(!evaluate_condition("empty_list is_not_empty", &vars()));
        assert!(!evaluate_condition("ghost is_not_empty", &vars()));
    }

    #[test]
    fn boolean_connectives() {
        assert!(evaluate_condition("count == 5 and name == 'ada'", &vars()));
        assert!(evaluate_condition("count == 1 or name == 'ada'", &vars()));
        assert!(!evaluate_condition("count == 1 and name == 'ada'", &vars()));
        assert!(evaluate_condition(
            "count == 1 or count == 2 or count == 5",
            &vars()
        ));
    }

    #[test]
    fn not_operator() {
        assert!(evaluate_condition("not flag == false", &vars()));
        assert!(!evaluate_condition("not flag", &vars()));
        assert!(evaluate_condition("not ghost", &vars()));
    }

    #[test]
    fn truthy_bareword() {
        assert!(evaluate_condition("flag", &vars()));
        assert!(evaluate_condition("items", &vars()));
        assert!(!evaluate_condition("empty_list", &vars()));
        assert!(!evaluate_condition("ghost", &vars()));
    }

    #[test]
    fn garbage_evaluates_false() {
        assert!(!evaluate_condition("", &vars()));
        assert!(!evaluate_condition("== ==", &vars()));
        assert!(!evaluate_condition("count == ", &vars()));
    }

    #[test]
    fn glued_operators_tokenize() {
        assert!(evaluate_condition("count==5", &vars()));
        assert!(evaluate_condition("count>=5", &vars()));
        assert!(evaluate_condition("price<=2.5", &vars()));
    }

    #[test]
    fn cross_type_equality_via_strings() {
        assert!(evaluate_condition("'5' == 5", &vars()));
        assert!(evaluate_condition("flag == 'true'", &vars()));
    }
}
