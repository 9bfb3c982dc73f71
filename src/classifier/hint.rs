use super::RouteHint;

/// Find a `route to master|slave|server <name>` hint inside a SQL comment
///
/// `primary` and `replica` are accepted as synonyms. Only the first hint
/// counts; text outside comments is never inspected.
pub fn parse_route_hint(sql: &str) -> Option<RouteHint> {
    comments(sql).find_map(hint_in_comment)
}

fn hint_in_comment(comment: &str) -> Option<RouteHint> {
    let words: Vec<&str> = comment.split_whitespace().collect();
    let start = words
        .windows(2)
        .position(|w| w[0].eq_ignore_ascii_case("route") && w[1].eq_ignore_ascii_case("to"))?;

    let target = words.get(start + 2)?;
    match target.to_ascii_lowercase().as_str() {
        "master" | "primary" => Some(RouteHint::Primary),
        "slave" | "replica" => Some(RouteHint::Replica),
        "server" => words
            .get(start + 3)
            .map(|name| RouteHint::Server(name.trim_end_matches(';').to_string())),
        _ => None,
    }
}

/// Bodies of `/* */`, `--` and `#` comments outside quoted strings
fn comments(sql: &str) -> impl Iterator<Item = &str> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    let mut quote: Option<u8> = None;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 1;
            } else if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match b {
            b'\'' | b'"' | b'`' => {
                quote = Some(b);
                i += 1;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = sql[i + 2..].find("*/").map(|e| i + 2 + e).unwrap_or(bytes.len());
                found.push(&sql[i + 2..end]);
                i = end + 2;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = sql[i..].find('\n').map(|e| i + e).unwrap_or(bytes.len());
                found.push(&sql[i + 2..end]);
                i = end + 1;
            }
            b'#' => {
                let end = sql[i..].find('\n').map(|e| i + e).unwrap_or(bytes.len());
                found.push(&sql[i + 1..end]);
                i = end + 1;
            }
            _ => i += 1,
        }
    }

    found.into_iter()
}
