use std::{collections::HashMap, env, fs, path::PathBuf, time::Duration};

use directories::BaseDirs;

#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    /// Defaults, then `.codeboxrc`, then environment variables.
    pub fn load() -> Self {
        let mut map = default_map();
        let config_path = default_config_path();

        if config_path.exists() {
            if let Ok(text) = fs::read_to_string(&config_path) {
                parse_rc(&text, &mut map);
            }
        }

        // Overlay environment variables (take precedence)
        for (k, v) in env::vars() {
            if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self { inner: map, config_path }
    }

    /// Defaults overlaid with `pairs`; ignores the rc file and the environment.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = default_map();
        map.extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self { inner: map, config_path: default_config_path() }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).cloned()
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    /// A whole number of seconds; `0` means unset.
    pub fn get_secs(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).filter(|s| *s > 0).map(Duration::from_secs)
    }
}

fn parse_rc(text: &str, map: &mut HashMap<String, String>) {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
}

fn is_config_key(k: &str) -> bool {
    k.starts_with("CODEBOX_")
}

fn default_config_path() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("codebox").join(".codeboxrc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("CODEBOX_INTERPRETER".into(), "python3".into());
    m.insert("CODEBOX_PRELUDE".into(), String::new());

    // Seconds
    m.insert("CODEBOX_TIMEOUT".into(), "30".into());
    m.insert("CODEBOX_LOAD_TIMEOUT".into(), "120".into());
    m.insert("CODEBOX_FETCH_TIMEOUT".into(), "60".into());

    m.insert("CODEBOX_STDERR_POLICY".into(), "fail".into());
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc_lines_override_defaults() {
        let mut map = default_map();
        parse_rc("# comment\n\nCODEBOX_TIMEOUT = 5\nCODEBOX_PRELUDE=https://example.com/prelude.py\nnot a pair\n", &mut map);
        assert_eq!(map["CODEBOX_TIMEOUT"], "5");
        assert_eq!(map["CODEBOX_PRELUDE"], "https://example.com/prelude.py");
        assert_eq!(map["CODEBOX_INTERPRETER"], "python3");
    }

    #[test]
    fn zero_seconds_reads_as_unset() {
        let cfg = Config::from_pairs([("CODEBOX_LOAD_TIMEOUT", "0"), ("CODEBOX_TIMEOUT", "abc")]);
        assert_eq!(cfg.get_secs("CODEBOX_LOAD_TIMEOUT"), None);
        assert_eq!(cfg.get_secs("CODEBOX_TIMEOUT"), None);
        assert_eq!(cfg.get_secs("CODEBOX_FETCH_TIMEOUT"), Some(Duration::from_secs(60)));
    }

    #[test]
    fn only_prefixed_env_keys_are_config() {
        assert!(is_config_key("CODEBOX_TIMEOUT"));
        assert!(!is_config_key("PATH"));
    }
}
