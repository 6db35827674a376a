//! Configuration system
//!
//! Configuration files are plain serde structures stored as TOML or RON.
//! The format is picked from the file extension.

pub use serde::{Serialize, Deserialize};
use std::path::{Path, PathBuf};

/// Configuration loadable from and savable to TOML or RON files
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let parse_error = |message: String| ConfigError::Parse { path: path.to_path_buf(), message };
        match format {
            ConfigFormat::Toml => toml::from_str(&contents).map_err(|e| parse_error(e.to_string())),
            ConfigFormat::Ron => ron::from_str(&contents).map_err(|e| parse_error(e.to_string())),
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = match ConfigFormat::from_path(path)? {
            ConfigFormat::Toml => {
                toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
            }
            ConfigFormat::Ron => ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?,
        };

        std::fs::write(path, contents).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Ron,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("ron") => Ok(Self::Ron),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The file could not be read or written
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        /// File being accessed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The file contents are not a valid configuration
    #[error("Failed to parse {}: {message}", path.display())]
    Parse {
        /// File being parsed
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// The configuration could not be serialized
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// The extension is neither `.toml` nor `.ron`
    #[error("Unsupported configuration format: {}", .0.display())]
    UnsupportedFormat(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_extension() {
        assert!(matches!(
            ConfigFormat::from_path(Path::new("settings.json")),
            Err(ConfigError::UnsupportedFormat(_))
        ));
        assert_eq!(ConfigFormat::from_path(Path::new("a/b.toml")).ok(), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_path(Path::new("b.ron")).ok(), Some(ConfigFormat::Ron));
    }

    #[test]
    fn test_missing_file_reports_path() {
        #[derive(Serialize, Deserialize, Default)]
        struct Empty {}
        impl Config for Empty {}

        let err = match Empty::load_from_file("does/not/exist.toml") {
            Err(err) => err,
            Ok(_) => panic!("loading a missing file must fail"),
        };
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("exist.toml"));
    }
}
