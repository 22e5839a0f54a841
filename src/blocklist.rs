//! Host blocklist: a small, immutable set of substrings checked against
//! each CONNECT target. Matching is a plain linear scan; with a cap of 100
//! entries a smarter multi-pattern matcher (Aho-Corasick or similar) isn't
//! worth the complexity.

use std::fs;
use std::path::Path;

use crate::config::ConfigError;

pub const MAX_ENTRIES: usize = 100;

pub struct Blocklist {
    entries: Vec<String>,
}

impl Blocklist {
    pub fn load(path: &Path) -> Result<Blocklist, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Blocklist(format!("cannot read {}: {e}", path.display())))?;

        let entries: Vec<String> = contents
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();

        if entries.len() > MAX_ENTRIES {
            return Err(ConfigError::Blocklist(format!(
                "blocklist has {} entries, max is {MAX_ENTRIES}",
                entries.len()
            )));
        }

        Ok(Blocklist { entries })
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        self.entries.iter().any(|entry| host.contains(entry.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn write_temp(contents: &str) -> std::path::PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("connect-proxy-blocklist-test-{}-{n}", std::process::id()));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn matches_substring() {
        let path = write_temp("evil.example.com\nblocked.test\n");
        let blocklist = Blocklist::load(&path).unwrap();
        assert!(blocklist.is_blocked("sub.evil.example.com"));
        assert!(!blocklist.is_blocked("good.example.com"));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn skips_blank_lines_and_crlf() {
        let path = write_temp("one.test\r\n\r\ntwo.test\r\n");
        let blocklist = Blocklist::load(&path).unwrap();
        assert_eq!(blocklist.entries.len(), 2);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn rejects_too_many_entries() {
        let contents = (0..=MAX_ENTRIES).map(|i| format!("host{i}.test")).collect::<Vec<_>>().join("\n");
        let path = write_temp(&contents);
        assert!(Blocklist::load(&path).is_err());
        fs::remove_file(&path).unwrap();
    }
}
