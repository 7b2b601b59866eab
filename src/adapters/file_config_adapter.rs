//! INI file configuration adapter.
//!
//! Section and key names are case-insensitive. Numbers that fail to parse
//! fall back to the caller's default; validation catches the values that
//! matter before any command runs.

use crate::domain::error::LedgerError;
use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug)]
pub struct FileConfigAdapter {
    ini: Ini,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let mut ini = Ini::new();
        ini.load(path).map_err(|reason| LedgerError::ConfigParse {
            file: path.display().to_string(),
            reason,
        })?;
        Ok(Self { ini })
    }

    pub fn from_string(content: &str) -> Result<Self, LedgerError> {
        let mut ini = Ini::new();
        ini.read(content.to_string())
            .map_err(|reason| LedgerError::ConfigParse {
                file: "<inline>".to_string(),
                reason,
            })?;
        Ok(Self { ini })
    }

    fn parse<T: FromStr>(&self, section: &str, key: &str) -> Option<T> {
        self.ini.get(section, key)?.trim().parse().ok()
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.ini.get(section, key)
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.parse(section, key).unwrap_or(default)
    }

    fn get_double(&self, section: &str, key: &str, default: f64) -> f64 {
        self.parse::<f64>(section, key)
            .filter(|v| v.is_finite())
            .unwrap_or(default)
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.ini.get(section, key).map(|v| v.trim().to_lowercase()) {
            Some(v) if matches!(v.as_str(), "true" | "yes" | "on" | "1") => true,
            Some(v) if matches!(v.as_str(), "false" | "no" | "off" | "0") => false,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn from_string_parses_config() {
        let content = r#"
[sqlite]
path = /var/lib/lotwarden/ledger.db

[reconciliation]
fills_path = /srv/exports/fills.csv
"#;
        let adapter = FileConfigAdapter::from_string(content).unwrap();
        assert_eq!(
            adapter.get_string("sqlite", "path"),
            Some("/var/lib/lotwarden/ledger.db".to_string())
        );
        assert_eq!(
            adapter.get_string("reconciliation", "fills_path"),
            Some("/srv/exports/fills.csv".to_string())
        );
    }

    #[test]
    fn section_names_are_case_insensitive() {
        let adapter = FileConfigAdapter::from_string("[SQLite]\nPath = a.db\n").unwrap();
        assert_eq!(adapter.get_string("sqlite", "path"), Some("a.db".to_string()));
    }

    #[test]
    fn get_string_returns_none_for_missing_key() {
        let adapter = FileConfigAdapter::from_string("[sqlite]\npool_size = 4\n").unwrap();
        assert_eq!(adapter.get_string("sqlite", "missing"), None);
        assert_eq!(adapter.get_string("missing_section", "key"), None);
    }

    #[test]
    fn require_string_rejects_blank_values() {
        let adapter = FileConfigAdapter::from_string("[sqlite]\npath =   \n").unwrap();
        let err = adapter.require_string("sqlite", "path").unwrap_err();
        assert!(matches!(err, LedgerError::ConfigMissing { section, key }
            if section == "sqlite" && key == "path"));
    }

    #[test]
    fn get_int_returns_value() {
        let adapter =
            FileConfigAdapter::from_string("[exit]\nsignal_max_age_secs = 120\n").unwrap();
        assert_eq!(adapter.get_int("exit", "signal_max_age_secs", 0), 120);
    }

    #[test]
    fn get_int_returns_default_for_missing_or_non_numeric() {
        let adapter = FileConfigAdapter::from_string("[sqlite]\npool_size = many\n").unwrap();
        assert_eq!(adapter.get_int("sqlite", "pool_size", 4), 4);
        assert_eq!(adapter.get_int("sqlite", "absent", 7), 7);
    }

    #[test]
    fn get_double_returns_value() {
        let adapter = FileConfigAdapter::from_string("[exit]\nhard_stop_pct = 7.5\n").unwrap();
        assert_eq!(adapter.get_double("exit", "hard_stop_pct", 0.0), 7.5);
    }

    #[test]
    fn get_double_parses_scientific_notation() {
        let adapter = FileConfigAdapter::from_string("[allocation]\nepsilon = 1e-9\n").unwrap();
        assert_eq!(adapter.get_double("allocation", "epsilon", 0.0), 1e-9);
    }

    #[test]
    fn get_double_rejects_non_finite() {
        let adapter = FileConfigAdapter::from_string(
            "[exit]\nsoft_stop_pct = not_a_number\nhard_stop_pct = inf\n",
        )
        .unwrap();
        assert_eq!(adapter.get_double("exit", "soft_stop_pct", 2.5), 2.5);
        assert_eq!(adapter.get_double("exit", "hard_stop_pct", 5.0), 5.0);
    }

    #[test]
    fn get_bool_accepts_common_spellings() {
        let adapter = FileConfigAdapter::from_string(
            "[allocation]\na = true\nb = Yes\nc = on\nd = 0\ne = no\nf = maybe\n",
        )
        .unwrap();
        assert!(adapter.get_bool("allocation", "a", false));
        assert!(adapter.get_bool("allocation", "b", false));
        assert!(adapter.get_bool("allocation", "c", false));
        assert!(!adapter.get_bool("allocation", "d", true));
        assert!(!adapter.get_bool("allocation", "e", true));
        assert!(adapter.get_bool("allocation", "f", true));
        assert!(!adapter.get_bool("allocation", "missing", false));
    }

    #[test]
    fn from_file_reads_config() {
        let file = create_temp_config("[sqlite]\npath = ledger.db\n");
        let adapter = FileConfigAdapter::from_file(file.path()).unwrap();
        assert_eq!(
            adapter.get_string("sqlite", "path"),
            Some("ledger.db".to_string())
        );
    }

    #[test]
    fn from_file_reports_missing_file_as_parse_error() {
        let err = FileConfigAdapter::from_file("/nonexistent/path/config.ini").unwrap_err();
        assert!(matches!(err, LedgerError::ConfigParse { file, .. }
            if file == "/nonexistent/path/config.ini"));
    }
}
