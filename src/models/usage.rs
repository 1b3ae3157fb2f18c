use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct UsageRecord {
    pub id: Uuid,
    pub invite_code_id: Uuid,
    pub user_id: Option<String>,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub used_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct UsageRecordResponse {
    pub id: Uuid,
    pub invite_code_id: Uuid,
    pub code: String,
    pub user_id: Option<String>,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub used_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn into_response(self, code: String) -> UsageRecordResponse {
        UsageRecordResponse {
            id: self.id,
            invite_code_id: self.invite_code_id,
            code,
            user_id: self.user_id,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            used_at: self.used_at,
        }
    }
}
