//! SQL text scanning
//!
//! A small quote- and comment-aware scanner used to split DDL scripts into
//! statements and to check that SQL fragments have balanced quotes and
//! parentheses. It is not a parser.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment,
}

/// Split a script into trimmed statements without their terminating `;`.
///
/// Comments are stripped. Fails on unterminated quotes or comments, on
/// unbalanced parentheses, and on `;` nested inside parentheses.
pub fn split_statements(sql: &str) -> Result<Vec<String>, String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut depth: i32 = 0;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '\'' => {
                    state = State::SingleQuote;
                    current.push(c);
                }
                '"' => {
                    state = State::DoubleQuote;
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err("unbalanced ')'".to_string());
                    }
                    current.push(c);
                }
                ';' => {
                    if depth != 0 {
                        return Err("';' inside parentheses".to_string());
                    }
                    let statement = current.trim();
                    if !statement.is_empty() {
                        statements.push(statement.to_string());
                    }
                    current.clear();
                }
                _ => current.push(c),
            },
            State::SingleQuote => {
                current.push(c);
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        // '' is an escaped quote
                        current.push('\'');
                        chars.next();
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuote => {
                current.push(c);
                if c == '"' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Normal;
                    current.push(' ');
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Normal;
                    current.push(' ');
                }
            }
        }
    }

    match state {
        State::SingleQuote => return Err("unterminated string literal".to_string()),
        State::DoubleQuote => return Err("unterminated quoted identifier".to_string()),
        State::BlockComment => return Err("unterminated block comment".to_string()),
        State::Normal | State::LineComment => {}
    }
    if depth != 0 {
        return Err("unbalanced '('".to_string());
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    Ok(statements)
}

/// Check that a single SQL fragment (a default or policy expression) is
/// balanced and contains neither a statement separator nor a comment.
pub fn check_fragment(fragment: &str) -> Result<(), String> {
    let trimmed = fragment.trim();
    if trimmed.is_empty() {
        return Err("empty expression".to_string());
    }
    let statements = split_statements(trimmed)?;
    match statements.as_slice() {
        [single] if single == trimmed => Ok(()),
        _ => Err("expression must not contain ';' or comments".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_simple_script() {
        let statements = split_statements(
            "ALTER TABLE users ADD COLUMN phone text;\nDROP TABLE IF EXISTS orders;",
        )
        .unwrap();
        assert_eq!(
            statements,
            vec![
                "ALTER TABLE users ADD COLUMN phone text".to_string(),
                "DROP TABLE IF EXISTS orders".to_string(),
            ]
        );
    }

    #[test]
    fn test_semicolon_inside_literal_is_kept() {
        let statements =
            split_statements("ALTER TABLE t ALTER COLUMN c SET DEFAULT 'a;b';").unwrap();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].ends_with("'a;b'"));
    }

    #[test]
    fn test_escaped_quote() {
        let statements = split_statements("ALTER TABLE t ALTER COLUMN c SET DEFAULT 'it''s'").unwrap();
        assert_eq!(statements.len(), 1);
    }

    #[test]
    fn test_comments_are_stripped() {
        let statements = split_statements("-- header\nDROP TABLE IF EXISTS a; /* x; */").unwrap();
        assert_eq!(statements, vec!["DROP TABLE IF EXISTS a".to_string()]);
    }

    #[test]
    fn test_unbalanced_input_is_rejected() {
        assert!(split_statements("CREATE TABLE t (id uuid").is_err());
        assert!(split_statements("CREATE TABLE t id uuid)").is_err());
        assert!(split_statements("SELECT 'open").is_err());
        assert!(split_statements("SELECT \"open").is_err());
        assert!(split_statements("CREATE TABLE t (a int; b int)").is_err());
    }

    #[test]
    fn test_fragment_checks() {
        assert!(check_fragment("now()").is_ok());
        assert!(check_fragment("'a;b'").is_ok());
        assert!(check_fragment("(owner_id = current_user_id())").is_ok());
        assert!(check_fragment("0; DROP TABLE users").is_err());
        assert!(check_fragment("now();").is_err());
        assert!(check_fragment("now() --").is_err());
        assert!(check_fragment("lower(name").is_err());
        assert!(check_fragment("  ").is_err());
    }
}
