//! Artifact and metadata coordinates
//!
//! A coordinate identifies one versioned artifact inside a repository:
//! group, name, version, an optional classifier and a file extension.
//! The repository path layout is the slash-joined convention
//! `group/.../name/version/name-version[-classifier].extension` that
//! remote repositories and the local store both honor.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Extension used when a coordinate does not specify one.
pub const DEFAULT_EXTENSION: &str = "tgz";

/// Identity of a versioned artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinate {
    /// Dotted group, e.g. `com.acme`
    pub group: String,

    /// Artifact name
    pub name: String,

    /// Version string (opaque to this layer)
    pub version: String,

    /// Optional classifier, e.g. `sources`
    #[serde(default)]
    pub classifier: Option<String>,

    /// File extension without the leading dot
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

impl Coordinate {
    /// Create a coordinate with the default extension.
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self> {
        let coordinate = Self {
            group: group.into(),
            name: name.into(),
            version: version.into(),
            classifier: None,
            extension: default_extension(),
        };
        coordinate.validate()?;
        Ok(coordinate)
    }

    /// Set a classifier.
    pub fn with_classifier(mut self, classifier: impl Into<String>) -> Self {
        self.classifier = Some(classifier.into());
        self
    }

    /// Set the file extension (without the leading dot).
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Parse a textual coordinate of the form
    /// `group:name:version[:classifier[:extension]]`.
    pub fn parse(input: &str) -> Result<Self> {
        let parts: Vec<&str> = input.split(':').collect();
        if parts.len() < 3 || parts.len() > 5 {
            return Err(CoreError::InvalidCoordinate {
                input: input.to_string(),
                reason: "expected group:name:version[:classifier[:extension]]".to_string(),
            });
        }

        let mut coordinate = Self {
            group: parts[0].to_string(),
            name: parts[1].to_string(),
            version: parts[2].to_string(),
            classifier: parts.get(3).map(|s| s.to_string()),
            extension: parts
                .get(4)
                .map(|s| s.to_string())
                .unwrap_or_else(default_extension),
        };
        if coordinate.classifier.as_deref() == Some("") {
            coordinate.classifier = None;
        }
        coordinate.validate()?;
        Ok(coordinate)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| CoreError::InvalidCoordinate {
            input: self.to_string(),
            reason: reason.to_string(),
        };

        for (field, value) in [
            ("group", &self.group),
            ("name", &self.name),
            ("version", &self.version),
            ("extension", &self.extension),
        ] {
            if value.is_empty() {
                return Err(invalid(&format!("{field} must not be empty")));
            }
        }

        let mut segments: Vec<&str> = vec![&self.name, &self.version, &self.extension];
        segments.extend(self.group.split('.'));
        if let Some(classifier) = &self.classifier {
            segments.push(classifier);
        }
        for segment in segments {
            if segment.is_empty()
                || segment == ".."
                || segment.contains('/')
                || segment.contains('\\')
            {
                return Err(invalid("segments must not contain path separators"));
            }
        }
        Ok(())
    }

    /// File name within the version directory.
    pub fn file_name(&self) -> String {
        match &self.classifier {
            Some(classifier) => format!(
                "{}-{}-{}.{}",
                self.name, self.version, classifier, self.extension
            ),
            None => format!("{}-{}.{}", self.name, self.version, self.extension),
        }
    }

    /// Repository-relative path of this artifact.
    pub fn repository_path(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.group.replace('.', "/"),
            self.name,
            self.version,
            self.file_name()
        )
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.name, self.version)?;
        if let Some(classifier) = &self.classifier {
            write!(f, ":{classifier}")?;
        }
        if self.extension != DEFAULT_EXTENSION || self.classifier.is_some() {
            if self.classifier.is_none() {
                write!(f, ":")?;
            }
            write!(f, ":{}", self.extension)?;
        }
        Ok(())
    }
}

/// Identity of repository metadata, resolved at group, group+name or
/// group+name+version level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRef {
    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    pub file_name: String,
}

impl MetadataRef {
    /// Metadata at the repository root.
    pub fn root(file_name: impl Into<String>) -> Self {
        Self {
            group: None,
            name: None,
            version: None,
            file_name: file_name.into(),
        }
    }

    /// Metadata scoped to a group.
    pub fn for_group(group: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            name: None,
            version: None,
            file_name: file_name.into(),
        }
    }

    /// Metadata scoped to an artifact name.
    pub fn for_name(
        group: impl Into<String>,
        name: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            group: Some(group.into()),
            name: Some(name.into()),
            version: None,
            file_name: file_name.into(),
        }
    }

    /// Metadata scoped to one artifact version.
    pub fn for_version(
        group: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            group: Some(group.into()),
            name: Some(name.into()),
            version: Some(version.into()),
            file_name: file_name.into(),
        }
    }

    /// Repository-relative path of this metadata resource.
    pub fn repository_path(&self) -> String {
        let mut segments = Vec::new();
        if let Some(group) = &self.group {
            segments.push(group.replace('.', "/"));
        }
        if let Some(name) = &self.name {
            segments.push(name.clone());
        }
        if let Some(version) = &self.version {
            segments.push(version.clone());
        }
        segments.push(self.file_name.clone());
        segments.join("/")
    }
}

impl fmt::Display for MetadataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let c = Coordinate::parse("com.acme:lib:1.0").unwrap();
        assert_eq!(c.group, "com.acme");
        assert_eq!(c.name, "lib");
        assert_eq!(c.version, "1.0");
        assert_eq!(c.classifier, None);
        assert_eq!(c.extension, DEFAULT_EXTENSION);
    }

    #[test]
    fn test_parse_full() {
        let c = Coordinate::parse("com.acme:lib:1.0:docs:zip").unwrap();
        assert_eq!(c.classifier.as_deref(), Some("docs"));
        assert_eq!(c.extension, "zip");

        let c = Coordinate::parse("com.acme:lib:1.0::zip").unwrap();
        assert_eq!(c.classifier, None);
        assert_eq!(c.extension, "zip");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Coordinate::parse("com.acme:lib").is_err());
        assert!(Coordinate::parse("com.acme:lib:1.0:a:b:c").is_err());
        assert!(Coordinate::parse("com.acme::1.0").is_err());
        assert!(Coordinate::parse("com.acme:li/b:1.0").is_err());
        assert!(Coordinate::parse("com..acme:lib:1.0").is_err());
    }

    #[test]
    fn test_repository_path() {
        let c = Coordinate::new("com.acme", "lib", "1.0").unwrap();
        assert_eq!(c.repository_path(), "com/acme/lib/1.0/lib-1.0.tgz");

        let c = c.with_classifier("docs").with_extension("zip");
        assert_eq!(c.repository_path(), "com/acme/lib/1.0/lib-1.0-docs.zip");
    }

    #[test]
    fn test_metadata_paths() {
        let m = MetadataRef::for_name("com.acme", "lib", "versions.xml");
        assert_eq!(m.repository_path(), "com/acme/lib/versions.xml");

        let m = MetadataRef::root("index.xml");
        assert_eq!(m.repository_path(), "index.xml");

        let m = MetadataRef::for_version("com.acme", "lib", "1.0", "build.info");
        assert_eq!(m.repository_path(), "com/acme/lib/1.0/build.info");
    }
}
