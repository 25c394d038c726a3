use std::{env, fs::File, io::Read, path::Path};

use dotenv::dotenv;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::{database::schema::TableSchema, error::BulkWriteError};

pub fn connection_string() -> Result<String, env::VarError> {
    dotenv().ok();
    let connection = env::var("DATABASE_URL")?;
    Ok(connection)
}

/// Columns the caller wants echoed back from written rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ReturningColumns", into = "ReturningColumns")]
pub enum Returning {
    #[default]
    None,
    Column(String),
    Columns(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ReturningColumns {
    Single(String),
    Multiple(Vec<String>),
}

impl From<ReturningColumns> for Returning {
    fn from(value: ReturningColumns) -> Self {
        match value {
            ReturningColumns::Single(column) => Returning::Column(column),
            ReturningColumns::Multiple(columns) if columns.is_empty() => Returning::None,
            ReturningColumns::Multiple(columns) => Returning::Columns(columns),
        }
    }
}

impl From<Returning> for ReturningColumns {
    fn from(value: Returning) -> Self {
        match value {
            Returning::None => ReturningColumns::Multiple(vec![]),
            Returning::Column(column) => ReturningColumns::Single(column),
            Returning::Columns(columns) => ReturningColumns::Multiple(columns),
        }
    }
}

impl Returning {
    pub fn is_none(&self) -> bool {
        matches!(self, Returning::None)
    }

    pub fn is_requested(&self) -> bool {
        !self.column_names().is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        match self {
            Returning::None => vec![],
            Returning::Column(column) => vec![column.as_str()],
            Returning::Columns(columns) => columns.iter().map(String::as_str).collect(),
        }
    }
}

fn default_auto_chunk() -> bool {
    true
}

fn default_chunk_size() -> usize {
    1000
}

/// Per call write options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Chunk only when the input holds more than `chunk_size` records. When set
    /// this decides on its own and `force_chunk` is ignored.
    #[serde(default = "default_auto_chunk")]
    pub auto_chunk: bool,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Explicit chunking switch, only read when `auto_chunk` is off.
    #[serde(default)]
    pub force_chunk: bool,

    #[serde(default, skip_serializing_if = "Returning::is_none")]
    pub returning: Returning,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            auto_chunk: default_auto_chunk(),
            chunk_size: default_chunk_size(),
            force_chunk: false,
            returning: Returning::None,
        }
    }
}

impl WriteOptions {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Turns auto chunking off and forces (or forbids) chunking.
    pub fn with_forced_chunking(mut self, force_chunk: bool) -> Self {
        self.auto_chunk = false;
        self.force_chunk = force_chunk;
        self
    }

    pub fn with_returning(mut self, returning: Returning) -> Self {
        self.returning = returning;
        self
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BulkWriteConfig {
    /// Usually `${DATABASE_URL}`, resolved from the environment while loading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default)]
    pub write: WriteOptions,

    #[serde(default)]
    pub tables: Vec<TableSchema>,
}

impl BulkWriteConfig {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables
            .iter()
            .find(|table| table.name.as_str() == name || table.qualified_name() == name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReadConfigError {
    #[error("Could not open file: {0}")]
    CouldNotOpenFile(#[from] std::io::Error),

    #[error("Could not parse config: {0}")]
    CouldNotParseConfig(#[from] serde_yaml::Error),

    #[error("Could not substitute env variables: {0}")]
    CouldNotSubstituteEnvVariables(#[from] regex::Error),

    #[error("Environment variable {0} not found")]
    EnvironmentVariableNotFound(String),

    #[error("Could not validate config: {0}")]
    CouldNotValidateConfig(#[from] BulkWriteError),
}

fn substitute_env_variables(contents: &str) -> Result<String, ReadConfigError> {
    let re = Regex::new(r"\$\{([^}]+)\}")?;

    if let Some(missing) = re
        .captures_iter(contents)
        .map(|caps| caps[1].to_string())
        .find(|var| env::var(var).is_err())
    {
        return Err(ReadConfigError::EnvironmentVariableNotFound(missing));
    }

    let result = re.replace_all(contents, |caps: &Captures| env::var(&caps[1]).unwrap_or_default());
    Ok(result.into_owned())
}

pub fn read_config(file_path: &Path) -> Result<BulkWriteConfig, ReadConfigError> {
    dotenv().ok();

    let mut file = File::open(file_path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let contents = substitute_env_variables(&contents)?;
    let config: BulkWriteConfig = serde_yaml::from_str(&contents)?;

    if config.write.chunk_size == 0 {
        return Err(BulkWriteError::InvalidChunkSize.into());
    }
    for table in &config.tables {
        table.validate()?;
    }

    Ok(config)
}
