use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct InviteCode {
    pub id: Uuid,
    pub code: String,
    pub batch_id: Uuid,
    pub description: Option<String>,
    pub created_by: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct InviteCodeResponse {
    pub id: Uuid,
    pub code: String,
    pub batch_id: Uuid,
    pub description: Option<String>,
    pub created_by: String,
    pub active: bool,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
}

impl InviteCode {
    /// The only place a redemption count is attached to a code. The count is
    /// always recomputed from the ledger, never stored on the row.
    pub fn into_response(self, usage_count: i64) -> InviteCodeResponse {
        InviteCodeResponse {
            id: self.id,
            code: self.code,
            batch_id: self.batch_id,
            description: self.description,
            created_by: self.created_by,
            active: self.active,
            usage_count,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub count: i64,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub code: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    Code,
    BatchId,
}

impl SortField {
    pub fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::Code => "code",
            Self::BatchId => "batch_id",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}
