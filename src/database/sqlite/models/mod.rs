
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Subproject {
    pub id: i64,
    pub name: String,
    pub status: IndexStatus,
    pub total_files: i64,
    pub indexed_files: i64,
    pub total_chunks: i64,
    pub error_message: Option<String>,
    pub last_indexed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Repository {
    pub id: i64,
    pub subproject_id: i64,
    pub path: String,
    pub status: IndexStatus,
    pub total_files: i64,
    pub indexed_files: i64,
    pub total_chunks: i64,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Lifecycle of a subproject or repository row: `new -> indexing -> indexed | error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    New,
    Indexing,
    Indexed,
    Error,
}

impl std::fmt::Display for IndexStatus {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            IndexStatus::New => write!(f, "New"),
            IndexStatus::Indexing => write!(f, "Indexing"),
            IndexStatus::Indexed => write!(f, "Indexed"),
            IndexStatus::Error => write!(f, "Error"),
        }
    }
}

/// Counters and terminal status written back after an indexing run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub status: IndexStatus,
    pub total_files: i64,
    pub indexed_files: i64,
    pub total_chunks: i64,
    pub error_message: Option<String>,
}
