//! Pre-flight read-only guard for the PostgreSQL CLI executor.
//!
//! The PostgreSQL CLI executor wraps the caller's SQL inside a scripted
//! `BEGIN; SET TRANSACTION READ ONLY; ...; COMMIT;`. Without this guard a
//! query like `; COMMIT; DROP TABLE x` could close the read-only transaction
//! early and run arbitrary statements afterwards. Every other executor path
//! relies on database-level read-only enforcement and never calls this.

use crate::error::GatewayError;

const TRANSACTION_VERBS: &[&str] = &[
    "COMMIT",
    "ROLLBACK",
    "ABORT",
    "END",
    "BEGIN",
    "START TRANSACTION",
    "SET TRANSACTION",
    "SET SESSION CHARACTERISTICS",
    "SAVEPOINT",
    "RELEASE SAVEPOINT",
    "ROLLBACK TO SAVEPOINT",
    "PREPARE TRANSACTION",
    "COMMIT PREPARED",
    "ROLLBACK PREPARED",
];

/// Validate `query` and return the trimmed SQL that is safe to splice into a
/// `BEGIN; SET TRANSACTION READ ONLY; ...; COMMIT;` script.
pub fn sanitize_read_only_sql(query: &str) -> Result<String, GatewayError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::ReadOnlyViolation(
            "Query must not be empty".to_string(),
        ));
    }

    ensure_single_statement(trimmed)?;
    reject_transaction_control(trimmed)?;
    Ok(trimmed.to_string())
}

fn ensure_single_statement(query: &str) -> Result<(), GatewayError> {
    let semicolons = find_semicolons_outside_literals(query);
    if semicolons.is_empty() {
        return Ok(());
    }
    if semicolons.len() > 1 || !only_trailing_semicolon(query, semicolons[0]) {
        return Err(GatewayError::ReadOnlyViolation(
            "Multiple SQL statements are not allowed in read-only mode".to_string(),
        ));
    }
    Ok(())
}

fn reject_transaction_control(query: &str) -> Result<(), GatewayError> {
    let upper = query.trim_start().to_uppercase();
    for verb in TRANSACTION_VERBS {
        if matches_verb_prefix(&upper, verb) {
            return Err(GatewayError::ReadOnlyViolation(
                "Transaction control statements are not allowed in read-only mode".to_string(),
            ));
        }
    }
    Ok(())
}

/// `upper` starts with `verb` (whose internal whitespace may vary) followed
/// by whitespace, a semicolon, or end of string.
fn matches_verb_prefix(upper: &str, verb: &str) -> bool {
    let verb_words: Vec<&str> = verb.split_whitespace().collect();
    let mut rest = upper;
    for (i, word) in verb_words.iter().enumerate() {
        rest = rest.trim_start();
        if !rest.starts_with(word) {
            return false;
        }
        rest = &rest[word.len()..];
        if i + 1 < verb_words.len() {
            // Require at least one whitespace char between words of a multi-word verb.
            if !rest.starts_with(char::is_whitespace) {
                return false;
            }
        }
    }
    rest.is_empty() || rest.starts_with(char::is_whitespace) || rest.starts_with(';')
}

fn only_trailing_semicolon(query: &str, index: usize) -> bool {
    let tail = &query[index + 1..];
    remove_comments(tail).trim().is_empty()
}

fn remove_comments(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let len = chars.len();
    let mut result = String::with_capacity(len);
    let mut i = 0;
    let mut in_block = 0u32;

    while i < len {
        let ch = chars[i];
        let nxt = chars.get(i + 1).copied().unwrap_or('\0');

        if in_block > 0 {
            if ch == '*' && nxt == '/' {
                in_block -= 1;
                i += 2;
            } else if ch == '/' && nxt == '*' {
                in_block += 1;
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }

        if ch == '-' && nxt == '-' {
            i += 2;
            while i < len && chars[i] != '\r' && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        if ch == '/' && nxt == '*' {
            in_block = 1;
            i += 2;
            continue;
        }

        result.push(ch);
        i += 1;
    }

    result
}

/// Scan `query` for semicolons that sit outside string literals, quoted
/// identifiers, dollar-quoted blocks, and comments.
fn find_semicolons_outside_literals(query: &str) -> Vec<usize> {
    let chars: Vec<char> = query.chars().collect();
    let len = chars.len();
    let mut semicolons = Vec::new();
    let mut i = 0;

    let mut in_single = false;
    let mut in_double = false;
    let mut in_line_comment = false;
    let mut in_block_comment = 0u32;
    let mut dollar_tag: Option<Vec<char>> = None;

    while i < len {
        let ch = chars[i];
        let nxt = chars.get(i + 1).copied().unwrap_or('\0');

        if in_line_comment {
            if ch == '\r' || ch == '\n' {
                in_line_comment = false;
            }
            i += 1;
            continue;
        }

        if in_block_comment > 0 {
            if ch == '*' && nxt == '/' {
                in_block_comment -= 1;
                i += 2;
            } else if ch == '/' && nxt == '*' {
                in_block_comment += 1;
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }

        if let Some(tag) = &dollar_tag {
            if chars[i..].starts_with(tag.as_slice()) {
                i += tag.len();
                dollar_tag = None;
            } else {
                i += 1;
            }
            continue;
        }

        if in_single {
            if ch == '\'' {
                if nxt == '\'' {
                    i += 2;
                    continue;
                }
                in_single = false;
            }
            i += 1;
            continue;
        }

        if in_double {
            if ch == '"' {
                if nxt == '"' {
                    i += 2;
                    continue;
                }
                in_double = false;
            }
            i += 1;
            continue;
        }

        if ch == '-' && nxt == '-' {
            in_line_comment = true;
            i += 2;
            continue;
        }

        if ch == '/' && nxt == '*' {
            in_block_comment = 1;
            i += 2;
            continue;
        }

        if ch == '\'' {
            in_single = true;
            i += 1;
            continue;
        }

        if ch == '"' {
            in_double = true;
            i += 1;
            continue;
        }

        if ch == '$' {
            let mut tag_end = i + 1;
            while tag_end < len && (chars[tag_end].is_alphanumeric() || chars[tag_end] == '_') {
                tag_end += 1;
            }
            if tag_end < len && chars[tag_end] == '$' {
                dollar_tag = Some(chars[i..=tag_end].to_vec());
                i = tag_end + 1;
                continue;
            }
        }

        if ch == ';' {
            semicolons.push(i);
        }

        i += 1;
    }

    semicolons
}
