//! Key-value env file persistence.
//!
//! Topology state lives in `<state>/.env` as simple `KEY='VALUE'` lines so
//! the instance manager script can source it directly. Values are written
//! single-quoted with `'\''` escaping; reads tolerate unquoted, single- and
//! double-quoted values, blank lines, and comments.

use std::collections::BTreeMap;
use std::path::Path;

/// Read an env file into a map. A missing or unreadable file yields an
/// empty map; topology falls back to defaults.
pub fn read_env(path: &Path) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return data;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = unquote(value.trim());
        data.insert(key.trim().to_string(), value);
    }
    data
}

/// Merge `updates` into the existing file contents and write everything
/// back in `KEY='VALUE'` form. Last writer wins on concurrent updates.
pub fn write_env_kv(
    path: &Path,
    updates: impl IntoIterator<Item = (String, String)>,
) -> std::io::Result<()> {
    let mut merged = read_env(path);
    for (key, value) in updates {
        merged.insert(key, value);
    }
    let mut out = String::new();
    for (key, value) in &merged {
        out.push_str(key);
        out.push('=');
        out.push_str(&quote(value));
        out.push('\n');
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, out)
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 {
        let bytes = value.as_bytes();
        if (bytes[0] == b'\'' && bytes[value.len() - 1] == b'\'')
            || (bytes[0] == b'"' && bytes[value.len() - 1] == b'"')
        {
            let inner = &value[1..value.len() - 1];
            return inner.replace("'\\''", "'");
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");

        write_env_kv(
            &path,
            [
                ("NO_EDGE".to_string(), "0".to_string()),
                ("BASE_PATH".to_string(), "/desk".to_string()),
            ],
        )
        .unwrap();

        let env = read_env(&path);
        assert_eq!(env.get("NO_EDGE").unwrap(), "0");
        assert_eq!(env.get("BASE_PATH").unwrap(), "/desk");
    }

    #[test]
    fn test_merge_preserves_existing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");

        write_env_kv(&path, [("A".to_string(), "1".to_string())]).unwrap();
        write_env_kv(&path, [("B".to_string(), "2".to_string())]).unwrap();

        let env = read_env(&path);
        assert_eq!(env.get("A").unwrap(), "1");
        assert_eq!(env.get("B").unwrap(), "2");
    }

    #[test]
    fn test_read_tolerates_comments_and_quotes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "# comment\n\nPLAIN=value\nSINGLE='quoted'\nDOUBLE=\"also quoted\"\nBROKEN\n",
        )
        .unwrap();

        let env = read_env(&path);
        assert_eq!(env.get("PLAIN").unwrap(), "value");
        assert_eq!(env.get("SINGLE").unwrap(), "quoted");
        assert_eq!(env.get("DOUBLE").unwrap(), "also quoted");
        assert!(!env.contains_key("BROKEN"));
    }

    #[test]
    fn test_quote_escaping_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        write_env_kv(
            &path,
            [("DOMAIN".to_string(), "it's.example.com".to_string())],
        )
        .unwrap();
        let env = read_env(&path);
        assert_eq!(env.get("DOMAIN").unwrap(), "it's.example.com");
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_env(&dir.path().join("nope")).is_empty());
    }
}
