//! Course catalog.
//!
//! Static mapping of course code to display name, loaded once at process
//! start. The default catalog is embedded at compile time from
//! `contrib/courses.toml`; deployments point `ROLLCALL_COURSES_PATH` at
//! their own file.

use crate::types::{Course, CourseCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const DEFAULT_CATALOG: &str = include_str!("../../../contrib/courses.toml");

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("unknown course: {0}")]
    UnknownCourse(CourseCode),
    #[error("bad course catalog: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot read course catalog {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid course catalog: {0}")]
    Invalid(String),
}

/// Top-level catalog file structure.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    course: Vec<CourseEntry>,
}

/// One `[[course]]` table.
#[derive(Debug, Deserialize)]
struct CourseEntry {
    code: String,
    name: String,
}

/// Known courses, keyed by code.
#[derive(Debug, Clone)]
pub struct CourseCatalog {
    courses: BTreeMap<CourseCode, Course>,
}

impl CourseCatalog {
    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml(DEFAULT_CATALOG)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let src = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_toml(&src)?;
        tracing::info!(path = %path.display(), courses = catalog.len(), "loaded course catalog");
        Ok(catalog)
    }

    pub fn from_toml(src: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(src)?;
        let mut courses = BTreeMap::new();
        for entry in file.course {
            let code = entry.code.trim();
            if code.is_empty() {
                return Err(CatalogError::Invalid("empty course code".into()));
            }
            let code = CourseCode::new(code);
            let course = Course {
                code: code.clone(),
                name: entry.name,
            };
            if courses.insert(code.clone(), course).is_some() {
                return Err(CatalogError::Invalid(format!("duplicate course code {code}")));
            }
        }
        Ok(Self { courses })
    }

    /// Look up a course, rejecting codes not in the catalog.
    pub fn get(&self, code: &CourseCode) -> Result<&Course, CatalogError> {
        self.courses
            .get(code)
            .ok_or_else(|| CatalogError::UnknownCourse(code.clone()))
    }

    pub fn contains(&self, code: &CourseCode) -> bool {
        self.courses.contains_key(code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Course> {
        self.courses.values()
    }

    pub fn codes(&self) -> impl Iterator<Item = &CourseCode> {
        self.courses.keys()
    }

    pub fn len(&self) -> usize {
        self.courses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
    }
}
