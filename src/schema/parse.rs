use super::SchemaDescriptor;
use crate::types::{Attr, Result, UmbraError, ValueType};

/// Parses schema text into predicate descriptors.
///
/// One predicate per line:
///
/// ```text
/// # comment
/// name: string @index(exact, term) @upsert .
/// friend: [uid] @reverse @count .
/// ```
pub fn parse_schema(text: &str, namespace: u64) -> Result<Vec<(Attr, SchemaDescriptor)>> {
    let mut out = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let entry = parse_line(line, namespace).map_err(|msg| {
            UmbraError::SchemaViolation(format!("line {}: {msg}", lineno + 1))
        })?;
        if out.iter().any(|(attr, _)| attr == &entry.0) {
            return Err(UmbraError::SchemaViolation(format!(
                "line {}: predicate [{}] declared twice",
                lineno + 1,
                entry.0
            )));
        }
        out.push(entry);
    }
    Ok(out)
}

fn parse_line(line: &str, namespace: u64) -> std::result::Result<(Attr, SchemaDescriptor), String> {
    let body = line
        .strip_suffix('.')
        .ok_or_else(|| "schema line must end with '.'".to_string())?
        .trim();
    let (name, rest) = body
        .split_once(':')
        .ok_or_else(|| "expected `name: type`".to_string())?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(format!("invalid predicate name [{name}]"));
    }
    let rest = rest.trim();
    let (type_part, directives) = match rest.find('@') {
        Some(at) => (rest[..at].trim(), &rest[at..]),
        None => (rest, ""),
    };
    let (list, type_name) = match type_part
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
    {
        Some(inner) => (true, inner.trim()),
        None => (false, type_part),
    };
    let value_type =
        ValueType::from_name(type_name).ok_or_else(|| format!("unknown type [{type_name}]"))?;
    let mut descriptor = SchemaDescriptor::new(value_type);
    descriptor.list = list;
    for directive in split_directives(directives)? {
        apply_directive(&mut descriptor, directive)?;
    }
    Ok((Attr::new(namespace, name), descriptor))
}

fn split_directives(text: &str) -> std::result::Result<Vec<&str>, String> {
    let mut out = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        let Some(stripped) = rest.strip_prefix('@') else {
            return Err(format!("unexpected text [{rest}]"));
        };
        let end = match (stripped.find('('), stripped.find(char::is_whitespace)) {
            (Some(open), ws) if ws.map_or(true, |ws| open < ws) => stripped[open..]
                .find(')')
                .map(|close| open + close + 1)
                .ok_or_else(|| "unclosed directive arguments".to_string())?,
            (_, Some(ws)) => ws,
            (_, None) => stripped.len(),
        };
        out.push(&stripped[..end]);
        rest = stripped[end..].trim_start();
    }
    Ok(out)
}

fn apply_directive(
    descriptor: &mut SchemaDescriptor,
    directive: &str,
) -> std::result::Result<(), String> {
    let (name, args) = match directive.split_once('(') {
        Some((name, args)) => (
            name.trim(),
            Some(args.strip_suffix(')').unwrap_or(args)),
        ),
        None => (directive.trim(), None),
    };
    match (name, args) {
        ("index", Some(args)) => {
            descriptor.index = true;
            descriptor.tokenizers = args
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_owned)
                .collect();
        }
        ("reverse", None) => descriptor.reverse = true,
        ("count", None) => descriptor.count = true,
        ("unique", None) => descriptor.unique = true,
        ("upsert", None) => descriptor.upsert = true,
        ("lang", None) => descriptor.lang = true,
        _ => return Err(format!("unknown directive [@{directive}]")),
    }
    Ok(())
}
