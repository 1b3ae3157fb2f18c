use std::collections::HashMap;

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::codegen;
use crate::error::AppError;
use crate::models::invite::{InviteCode, InviteCodeResponse, SortDirection, SortField};
use crate::models::usage::{UsageRecord, UsageRecordResponse};
use crate::models::Page;

/// Collisions are retried with a fresh candidate; after this many misses for
/// a single code the batch is abandoned rather than looping against a store
/// that is pathologically full.
const MAX_CODE_ATTEMPTS: u32 = 5;

const MAX_PAGE_SIZE: i64 = 100;

/// Mint `count` codes sharing one batch id. All inserts run in a single
/// transaction: a failure partway through leaves nothing behind.
pub async fn generate_batch(
    db: &PgPool,
    count: i64,
    description: Option<&str>,
    created_by: &str,
) -> Result<Vec<InviteCodeResponse>, AppError> {
    if count < 1 {
        return Err(AppError::BadRequest("count must be at least 1".into()));
    }

    let batch_id = Uuid::new_v4();
    let mut tx = db.begin().await?;

    let mut created = Vec::with_capacity(count as usize);
    for _ in 0..count {
        created.push(insert_unique_code(&mut tx, batch_id, description, created_by).await?);
    }

    tx.commit().await?;
    tracing::info!(%batch_id, count, created_by, "generated invite code batch");

    // Fresh codes have no redemptions yet
    Ok(created.into_iter().map(|c| c.into_response(0)).collect())
}

async fn insert_unique_code(
    tx: &mut Transaction<'_, Postgres>,
    batch_id: Uuid,
    description: Option<&str>,
    created_by: &str,
) -> Result<InviteCode, AppError> {
    for attempt in 1..=MAX_CODE_ATTEMPTS {
        let candidate = codegen::generate_code();

        // Existence pre-check cuts down on constraint conflicts; the unique
        // index on code is what actually enforces the invariant.
        let (taken,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM invite_codes WHERE code = $1)")
                .bind(&candidate)
                .fetch_one(&mut **tx)
                .await?;
        if taken {
            tracing::warn!(attempt, "invite code candidate already taken, retrying");
            continue;
        }

        let inserted = sqlx::query_as::<_, InviteCode>(
            "INSERT INTO invite_codes (code, batch_id, description, created_by)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (code) DO NOTHING
             RETURNING *",
        )
        .bind(&candidate)
        .bind(batch_id)
        .bind(description)
        .bind(created_by)
        .fetch_optional(&mut **tx)
        .await?;

        match inserted {
            Some(invite) => return Ok(invite),
            // Lost the race against a concurrent writer; take a fresh candidate
            None => tracing::warn!(attempt, "invite code candidate conflicted on insert, retrying"),
        }
    }

    tracing::error!(attempts = MAX_CODE_ATTEMPTS, "invite code generation exhausted");
    Err(AppError::GenerationExhausted(MAX_CODE_ATTEMPTS))
}

/// Redeem a code. Returns false for unknown or disabled codes; on success a
/// usage record is appended. Lookup and append share one transaction, so
/// usage is never recorded against a row this call itself saw as disabled.
pub async fn verify(
    db: &PgPool,
    code: &str,
    user_id: Option<&str>,
    ip_address: &str,
    user_agent: Option<&str>,
) -> Result<bool, AppError> {
    let mut tx = db.begin().await?;

    let invite = sqlx::query_as::<_, InviteCode>("SELECT * FROM invite_codes WHERE code = $1")
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(invite) = invite.filter(|i| i.active) else {
        tracing::warn!(code, "rejected invite code");
        return Ok(false);
    };

    sqlx::query(
        "INSERT INTO usage_records (invite_code_id, user_id, ip_address, user_agent)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(invite.id)
    .bind(user_id)
    .bind(ip_address)
    .bind(user_agent)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    tracing::info!(code, user_id, "invite code redeemed");

    Ok(true)
}

pub async fn get_by_id(db: &PgPool, id: Uuid) -> Result<Option<InviteCodeResponse>, AppError> {
    let invite = sqlx::query_as::<_, InviteCode>("SELECT * FROM invite_codes WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await?;

    attach_usage_count(db, invite).await
}

pub async fn get_by_code(db: &PgPool, code: &str) -> Result<Option<InviteCodeResponse>, AppError> {
    let invite = sqlx::query_as::<_, InviteCode>("SELECT * FROM invite_codes WHERE code = $1")
        .bind(code)
        .fetch_optional(db)
        .await?;

    attach_usage_count(db, invite).await
}

/// Idempotent activation toggle. None when the id is unknown.
pub async fn set_active(
    db: &PgPool,
    id: Uuid,
    active: bool,
) -> Result<Option<InviteCodeResponse>, AppError> {
    let invite = sqlx::query_as::<_, InviteCode>(
        "UPDATE invite_codes SET active = $2 WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(active)
    .fetch_optional(db)
    .await?;

    attach_usage_count(db, invite).await
}

pub async fn list(
    db: &PgPool,
    page: i64,
    page_size: i64,
    sort_by: SortField,
    direction: SortDirection,
) -> Result<Page<InviteCodeResponse>, AppError> {
    let page = page.max(0);
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM invite_codes")
        .fetch_one(db)
        .await?;

    // Sort column and direction come from closed enums, never caller strings
    let sql = format!(
        "SELECT * FROM invite_codes ORDER BY {} {} LIMIT $1 OFFSET $2",
        sort_by.column(),
        direction.keyword()
    );
    let rows = sqlx::query_as::<_, InviteCode>(&sql)
        .bind(page_size)
        .bind(page * page_size)
        .fetch_all(db)
        .await?;

    let ids: Vec<Uuid> = rows.iter().map(|c| c.id).collect();
    let mut counts = usage_counts_batch(db, &ids).await?;

    Ok(Page {
        items: rows
            .into_iter()
            .map(|c| {
                let count = counts.remove(&c.id).unwrap_or(0);
                c.into_response(count)
            })
            .collect(),
        page,
        page_size,
        total,
    })
}

pub async fn list_usage(
    db: &PgPool,
    code_id: Uuid,
    page: i64,
    page_size: i64,
) -> Result<Page<UsageRecordResponse>, AppError> {
    let page = page.max(0);
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

    // Unknown code ids yield an empty page, not an error
    let code: Option<(String,)> = sqlx::query_as("SELECT code FROM invite_codes WHERE id = $1")
        .bind(code_id)
        .fetch_optional(db)
        .await?;
    let Some((code,)) = code else {
        return Ok(Page::empty(page, page_size));
    };

    let (total,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM usage_records WHERE invite_code_id = $1")
            .bind(code_id)
            .fetch_one(db)
            .await?;

    let rows = sqlx::query_as::<_, UsageRecord>(
        "SELECT * FROM usage_records WHERE invite_code_id = $1
         ORDER BY used_at DESC LIMIT $2 OFFSET $3",
    )
    .bind(code_id)
    .bind(page_size)
    .bind(page * page_size)
    .fetch_all(db)
    .await?;

    Ok(Page {
        items: rows
            .into_iter()
            .map(|r| r.into_response(code.clone()))
            .collect(),
        page,
        page_size,
        total,
    })
}

async fn attach_usage_count(
    db: &PgPool,
    invite: Option<InviteCode>,
) -> Result<Option<InviteCodeResponse>, AppError> {
    match invite {
        Some(invite) => {
            let count = usage_count(db, invite.id).await?;
            Ok(Some(invite.into_response(count)))
        }
        None => Ok(None),
    }
}

async fn usage_count(db: &PgPool, code_id: Uuid) -> Result<i64, AppError> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM usage_records WHERE invite_code_id = $1")
            .bind(code_id)
            .fetch_one(db)
            .await?;
    Ok(count)
}

/// One grouped count for a whole page of codes instead of a query per item.
async fn usage_counts_batch(
    db: &PgPool,
    code_ids: &[Uuid],
) -> Result<HashMap<Uuid, i64>, AppError> {
    if code_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<(Uuid, i64)> = sqlx::query_as(
        "SELECT invite_code_id, COUNT(*) FROM usage_records
         WHERE invite_code_id = ANY($1)
         GROUP BY invite_code_id",
    )
    .bind(code_ids)
    .fetch_all(db)
    .await?;

    Ok(rows.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{MAX_CODE_LEN, MIN_CODE_LEN};
    use std::collections::HashSet;

    async fn redeem(db: &PgPool, code: &str, user: &str) -> bool {
        verify(db, code, Some(user), "127.0.0.1", Some("test-agent"))
            .await
            .unwrap()
    }

    #[sqlx::test]
    async fn generate_batch_creates_distinct_active_codes(db: PgPool) {
        let codes = generate_batch(&db, 8, Some("launch"), "admin").await.unwrap();

        assert_eq!(codes.len(), 8);
        let batch_id = codes[0].batch_id;
        let mut seen = HashSet::new();
        for c in &codes {
            assert_eq!(c.batch_id, batch_id);
            assert!(c.active);
            assert_eq!(c.usage_count, 0);
            assert_eq!(c.description.as_deref(), Some("launch"));
            assert_eq!(c.created_by, "admin");
            assert!((MIN_CODE_LEN..=MAX_CODE_LEN).contains(&c.code.len()));
            assert!(seen.insert(c.code.clone()), "duplicate code in batch");
        }

        // a second batch gets its own id and stays distinct from the first
        let more = generate_batch(&db, 8, None, "admin").await.unwrap();
        assert_ne!(more[0].batch_id, batch_id);
        for c in &more {
            assert!(seen.insert(c.code.clone()), "code reused across batches");
        }
    }

    #[sqlx::test]
    async fn generate_batch_rejects_non_positive_count(db: PgPool) {
        assert!(matches!(
            generate_batch(&db, 0, None, "admin").await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            generate_batch(&db, -3, None, "admin").await,
            Err(AppError::BadRequest(_))
        ));

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM invite_codes")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(total, 0);
    }

    #[sqlx::test]
    async fn verify_active_code_records_usage(db: PgPool) {
        let codes = generate_batch(&db, 1, None, "admin").await.unwrap();
        let code = &codes[0];

        assert!(redeem(&db, &code.code, "user-1").await);

        let view = get_by_id(&db, code.id).await.unwrap().unwrap();
        assert_eq!(view.usage_count, 1);
    }

    #[sqlx::test]
    async fn verify_unknown_code_leaves_no_record(db: PgPool) {
        assert!(!redeem(&db, "NOSUCHCODE", "user-1").await);

        let (records,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM usage_records")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(records, 0);
    }

    #[sqlx::test]
    async fn verify_disabled_code_leaves_no_record(db: PgPool) {
        let codes = generate_batch(&db, 1, None, "admin").await.unwrap();
        let code = &codes[0];

        set_active(&db, code.id, false).await.unwrap().unwrap();

        assert!(!redeem(&db, &code.code, "user-1").await);
        let view = get_by_id(&db, code.id).await.unwrap().unwrap();
        assert_eq!(view.usage_count, 0);
    }

    #[sqlx::test]
    async fn set_active_toggles_and_is_idempotent(db: PgPool) {
        let codes = generate_batch(&db, 1, None, "admin").await.unwrap();
        let id = codes[0].id;

        let disabled = set_active(&db, id, false).await.unwrap().unwrap();
        assert!(!disabled.active);

        let restored = set_active(&db, id, true).await.unwrap().unwrap();
        assert!(restored.active);

        // toggling to the current state changes nothing observable
        let again = set_active(&db, id, true).await.unwrap().unwrap();
        assert!(again.active);
        assert!(redeem(&db, &codes[0].code, "user-1").await);
    }

    #[sqlx::test]
    async fn lookups_miss_as_none(db: PgPool) {
        assert!(get_by_id(&db, Uuid::new_v4()).await.unwrap().is_none());
        assert!(get_by_code(&db, "MISSING123").await.unwrap().is_none());
        assert!(set_active(&db, Uuid::new_v4(), false).await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn listing_tracks_per_code_usage(db: PgPool) {
        let codes = generate_batch(&db, 5, Some("batch-A"), "admin").await.unwrap();

        let page = list(&db, 0, 10, SortField::CreatedAt, SortDirection::Desc)
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 5);
        assert!(page.items.iter().all(|c| c.usage_count == 0));

        let target = &codes[2];
        for i in 0..3 {
            assert!(redeem(&db, &target.code, &format!("user-{i}")).await);
        }

        let page = list(&db, 0, 10, SortField::CreatedAt, SortDirection::Desc)
            .await
            .unwrap();
        for item in &page.items {
            let expected = if item.id == target.id { 3 } else { 0 };
            assert_eq!(item.usage_count, expected);
        }

        set_active(&db, target.id, false).await.unwrap().unwrap();
        assert!(!redeem(&db, &target.code, "user-9").await);

        let view = get_by_code(&db, &target.code).await.unwrap().unwrap();
        assert!(!view.active);
        assert_eq!(view.usage_count, 3);
    }

    #[sqlx::test]
    async fn list_pages_and_sorts(db: PgPool) {
        generate_batch(&db, 12, None, "admin").await.unwrap();

        let first = list(&db, 0, 5, SortField::Code, SortDirection::Asc)
            .await
            .unwrap();
        assert_eq!(first.total, 12);
        assert_eq!(first.items.len(), 5);
        let codes: Vec<_> = first.items.iter().map(|c| c.code.clone()).collect();
        let mut sorted = codes.clone();
        sorted.sort();
        assert_eq!(codes, sorted);

        let last = list(&db, 2, 5, SortField::Code, SortDirection::Asc)
            .await
            .unwrap();
        assert_eq!(last.items.len(), 2);
    }

    #[sqlx::test]
    async fn usage_listing_references_owning_code(db: PgPool) {
        let codes = generate_batch(&db, 2, None, "admin").await.unwrap();
        let (a, b) = (&codes[0], &codes[1]);

        for i in 0..3 {
            assert!(redeem(&db, &a.code, &format!("user-{i}")).await);
        }
        assert!(redeem(&db, &b.code, "other").await);

        let page = list_usage(&db, a.id, 0, 10).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 3);
        for record in &page.items {
            assert_eq!(record.invite_code_id, a.id);
            assert_eq!(record.code, a.code);
            assert_eq!(record.ip_address, "127.0.0.1");
        }
        // newest first
        assert!(page.items.windows(2).all(|w| w[0].used_at >= w[1].used_at));
    }

    #[sqlx::test]
    async fn usage_listing_for_unknown_code_is_empty(db: PgPool) {
        let page = list_usage(&db, Uuid::new_v4(), 0, 10).await.unwrap();
        assert_eq!(page.total, 0);
        assert!(page.items.is_empty());
    }
}
