use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{QueryBuilder, Row};

use super::models::*;
use super::StoreError;
use crate::db::DatabaseProxy;
use crate::services::srs::{Mastery, ReviewState};
use crate::services::weak_words::normalize_word;

/// SQL twin of `normalize_word` applied to the stored lemma.
const LEMMA_KEY_SQL: &str = r#"BTRIM(REGEXP_REPLACE(
    TRANSLATE(LOWER("naturalKey"), E'\u2019\u2010\u2011\u2013\u2014', '''----'),
    '[^[:alnum:]''-]+', '', 'g'), '''-')"#;

const ITEM_COLUMNS: &str =
    r#""id","domain","languageId","naturalKey","difficulty","active","content""#;
const STATE_COLUMNS: &str = r#"s."id",s."userId",s."domain",s."itemId",s."mastery",s."familiarity",
    s."easeFactor",s."repetition",s."intervalDays",s."lapseCount",s."lastReviewedAt",
    s."nextReviewAt",s."lastSource",s."createdAt",s."updatedAt""#;
const ATTEMPT_COLUMNS: &str = r#""id","userId","languageId","taskType","origin","status","strictness",
    "durationSec","items","scorePercent","aiResult","error","createdAt","submittedAt","updatedAt""#;

#[derive(Clone)]
pub struct PostgresStore {
    proxy: Arc<DatabaseProxy>,
}

impl PostgresStore {
    pub fn new(proxy: Arc<DatabaseProxy>) -> Self {
        Self { proxy }
    }

    pub(super) async fn get_settings(
        &self,
        user_id: &str,
        language_id: &str,
    ) -> Result<Option<ReviewSettings>, StoreError> {
        let row = sqlx::query(
            r#"SELECT "userId","languageId","dailyNewLimit","dailyReviewLimit","updatedAt"
               FROM "user_review_settings" WHERE "userId" = $1 AND "languageId" = $2"#,
        )
        .bind(user_id)
        .bind(language_id)
        .fetch_optional(self.proxy.pool())
        .await?;
        row.map(|r| map_settings(&r)).transpose()
    }

    pub(super) async fn upsert_settings(
        &self,
        settings: &ReviewSettings,
    ) -> Result<ReviewSettings, StoreError> {
        let row = sqlx::query(
            r#"INSERT INTO "user_review_settings"
                 ("userId","languageId","dailyNewLimit","dailyReviewLimit","updatedAt")
               VALUES ($1,$2,$3,$4,$5)
               ON CONFLICT ("userId","languageId") DO UPDATE SET
                 "dailyNewLimit" = EXCLUDED."dailyNewLimit",
                 "dailyReviewLimit" = EXCLUDED."dailyReviewLimit",
                 "updatedAt" = EXCLUDED."updatedAt"
               RETURNING "userId","languageId","dailyNewLimit","dailyReviewLimit","updatedAt""#,
        )
        .bind(&settings.user_id)
        .bind(&settings.language_id)
        .bind(settings.daily_new_limit)
        .bind(settings.daily_review_limit)
        .bind(settings.updated_at)
        .fetch_one(self.proxy.pool())
        .await?;
        map_settings(&row)
    }

    pub(super) async fn get_item(
        &self,
        domain: Domain,
        item_id: &str,
    ) -> Result<Option<ReviewableItem>, StoreError> {
        let sql = format!(
            r#"SELECT {ITEM_COLUMNS} FROM "review_items" WHERE "id" = $1 AND "domain" = $2"#
        );
        let row = sqlx::query(&sql)
            .bind(item_id)
            .bind(domain.as_str())
            .fetch_optional(self.proxy.pool())
            .await?;
        row.map(|r| map_item(&r)).transpose()
    }

    pub(super) async fn get_items(
        &self,
        domain: Domain,
        ids: &[String],
    ) -> Result<Vec<ReviewableItem>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<sqlx::Postgres>::new(format!(
            r#"SELECT {ITEM_COLUMNS} FROM "review_items" WHERE "domain" = "#
        ));
        qb.push_bind(domain.as_str());
        qb.push(r#" AND "id" IN ("#);
        {
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(id);
            }
        }
        qb.push(")");
        let rows = qb.build().fetch_all(self.proxy.pool()).await?;
        rows.iter().map(map_item).collect()
    }

    pub(super) async fn list_new_items(
        &self,
        user_id: &str,
        language_id: &str,
        domain: Domain,
        limit: usize,
    ) -> Result<Vec<ReviewableItem>, StoreError> {
        let sql = format!(
            r#"SELECT {ITEM_COLUMNS} FROM "review_items" i
               WHERE i."domain" = $1 AND i."languageId" = $2 AND i."active" = TRUE
                 AND NOT EXISTS (
                   SELECT 1 FROM "user_review_states" s
                   WHERE s."userId" = $3 AND s."domain" = i."domain" AND s."itemId" = i."id"
                     AND (s."lastReviewedAt" IS NOT NULL OR s."nextReviewAt" IS NOT NULL)
                 )
               ORDER BY i."difficulty" ASC, i."naturalKey" ASC
               LIMIT $4"#
        );
        let rows = sqlx::query(&sql)
            .bind(domain.as_str())
            .bind(language_id)
            .bind(user_id)
            .bind(limit as i64)
            .fetch_all(self.proxy.pool())
            .await?;
        rows.iter().map(map_item).collect()
    }

    pub(super) async fn find_lexeme_by_lemma(
        &self,
        language_id: &str,
        lemma: &str,
    ) -> Result<Option<ReviewableItem>, StoreError> {
        let sql = format!(
            r#"SELECT {ITEM_COLUMNS} FROM "review_items"
               WHERE "domain" = 'VOCABULARY' AND "languageId" = $1 AND "active" = TRUE
                 AND {LEMMA_KEY_SQL} = $2
               ORDER BY "id" LIMIT 1"#
        );
        let row = sqlx::query(&sql)
            .bind(language_id)
            .bind(normalize_word(lemma))
            .fetch_optional(self.proxy.pool())
            .await?;
        row.map(|r| map_item(&r)).transpose()
    }

    pub(super) async fn list_due_states(
        &self,
        user_id: &str,
        language_id: &str,
        domain: Domain,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StateRecord>, StoreError> {
        let sql = format!(
            r#"SELECT {STATE_COLUMNS} FROM "user_review_states" s
               JOIN "review_items" i ON i."id" = s."itemId"
               WHERE s."userId" = $1 AND s."domain" = $2 AND i."languageId" = $3
                 AND i."active" = TRUE AND s."nextReviewAt" <= $4
               ORDER BY s."nextReviewAt" ASC, s."updatedAt" ASC
               LIMIT $5"#
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(domain.as_str())
            .bind(language_id)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(self.proxy.pool())
            .await?;
        rows.iter().map(map_state).collect()
    }

    pub(super) async fn get_state(
        &self,
        user_id: &str,
        domain: Domain,
        item_id: &str,
    ) -> Result<Option<StateRecord>, StoreError> {
        let sql = format!(
            r#"SELECT {STATE_COLUMNS} FROM "user_review_states" s
               WHERE s."userId" = $1 AND s."domain" = $2 AND s."itemId" = $3"#
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(domain.as_str())
            .bind(item_id)
            .fetch_optional(self.proxy.pool())
            .await?;
        row.map(|r| map_state(&r)).transpose()
    }

    pub(super) async fn insert_state_if_absent(
        &self,
        record: StateRecord,
    ) -> Result<StateRecord, StoreError> {
        let inserted = sqlx::query(
            r#"INSERT INTO "user_review_states"
                 ("id","userId","domain","itemId","mastery","familiarity","easeFactor","repetition",
                  "intervalDays","lapseCount","lastReviewedAt","nextReviewAt","lastSource",
                  "createdAt","updatedAt")
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
               ON CONFLICT ("userId","domain","itemId") DO NOTHING"#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(record.domain.as_str())
        .bind(&record.item_id)
        .bind(record.state.mastery.as_str())
        .bind(record.state.familiarity)
        .bind(record.state.ease_factor)
        .bind(record.state.repetition)
        .bind(record.state.interval_days)
        .bind(record.state.lapse_count)
        .bind(record.state.last_reviewed_at)
        .bind(record.state.next_review_at)
        .bind(&record.last_source)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(self.proxy.pool())
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(record);
        }
        self.get_state(&record.user_id, record.domain, &record.item_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("state for item {} vanished", record.item_id)))
    }

    pub(super) async fn save_state(&self, record: &StateRecord) -> Result<(), StoreError> {
        save_state_with(self.proxy.pool(), record).await
    }

    pub(super) async fn record_review(
        &self,
        state: Option<&StateRecord>,
        attempt: &ReviewAttempt,
    ) -> Result<(), StoreError> {
        let mut tx = self.proxy.pool().begin().await?;
        if let Some(record) = state {
            save_state_with(&mut *tx, record).await?;
        }
        sqlx::query(
            r#"INSERT INTO "review_attempts"
                 ("id","userId","languageId","domain","itemId","sessionId","mode","isCorrect",
                  "scorePercent","rating","userAnswer","expected","meta","createdAt")
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)"#,
        )
        .bind(&attempt.id)
        .bind(&attempt.user_id)
        .bind(&attempt.language_id)
        .bind(attempt.domain.as_str())
        .bind(&attempt.item_id)
        .bind(&attempt.session_id)
        .bind(attempt.mode.as_str())
        .bind(attempt.is_correct)
        .bind(i16::from(attempt.score_percent))
        .bind(i16::from(attempt.rating))
        .bind(&attempt.user_answer)
        .bind(&attempt.expected)
        .bind(&attempt.meta)
        .bind(attempt.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn review_stats(
        &self,
        user_id: &str,
        language_id: &str,
        domain: Domain,
        now: DateTime<Utc>,
    ) -> Result<ReviewStats, StoreError> {
        let row = sqlx::query(
            r#"SELECT
                 COUNT(*) FILTER (WHERE s."nextReviewAt" <= $4) AS "dueNow",
                 COUNT(*) FILTER (WHERE s."nextReviewAt" IS NOT NULL) AS "scheduled",
                 COUNT(*) FILTER (WHERE s."mastery" = 'MASTERED') AS "mastered",
                 COUNT(*) FILTER (WHERE s."mastery" = 'LEARNING') AS "learning",
                 COALESCE(AVG(s."familiarity")::float8, 0) AS "avgFamiliarity"
               FROM "user_review_states" s
               JOIN "review_items" i ON i."id" = s."itemId"
               WHERE s."userId" = $1 AND s."domain" = $2 AND i."languageId" = $3"#,
        )
        .bind(user_id)
        .bind(domain.as_str())
        .bind(language_id)
        .bind(now)
        .fetch_one(self.proxy.pool())
        .await?;

        let reviewed_7d: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM "review_attempts"
               WHERE "userId" = $1 AND "languageId" = $2 AND "domain" = $3 AND "createdAt" >= $4"#,
        )
        .bind(user_id)
        .bind(language_id)
        .bind(domain.as_str())
        .bind(now - Duration::days(7))
        .fetch_one(self.proxy.pool())
        .await?;

        Ok(ReviewStats {
            due_now: row.try_get("dueNow")?,
            scheduled_total: row.try_get("scheduled")?,
            mastered: row.try_get("mastered")?,
            learning: row.try_get("learning")?,
            avg_familiarity: row.try_get("avgFamiliarity")?,
            reviewed_7d,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) async fn upsert_word_error(
        &self,
        user_id: &str,
        lexeme_id: &str,
        error_type: WordErrorType,
        source: WordErrorSource,
        severity: Severity,
        evidence: Value,
        now: DateTime<Utc>,
    ) -> Result<UserWordError, StoreError> {
        let row = sqlx::query(
            r#"INSERT INTO "user_word_errors"
                 ("id","userId","lexemeId","errorType","source","severity","occurCount",
                  "lastOccurredAt","evidence")
               VALUES ($1,$2,$3,$4,$5,$6,1,$7,$8)
               ON CONFLICT ("userId","lexemeId","errorType") DO UPDATE SET
                 "occurCount" = "user_word_errors"."occurCount" + 1,
                 "source" = EXCLUDED."source",
                 "severity" = EXCLUDED."severity",
                 "lastOccurredAt" = EXCLUDED."lastOccurredAt",
                 "evidence" = EXCLUDED."evidence"
               RETURNING "id","userId","lexemeId","errorType","source","severity","occurCount",
                 "lastOccurredAt","evidence""#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(lexeme_id)
        .bind(error_type.as_str())
        .bind(source.as_str())
        .bind(severity.as_str())
        .bind(now)
        .bind(&evidence)
        .fetch_one(self.proxy.pool())
        .await?;
        map_word_error(&row)
    }

    pub(super) async fn list_weak_words(
        &self,
        user_id: &str,
        language_id: &str,
        limit: usize,
    ) -> Result<Vec<WeakWord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT e."lexemeId", i."naturalKey", e."errorType", e."severity", e."occurCount",
                      e."lastOccurredAt", e."evidence"
               FROM "user_word_errors" e
               JOIN "review_items" i ON i."id" = e."lexemeId"
               WHERE e."userId" = $1 AND i."languageId" = $2
               ORDER BY e."lastOccurredAt" DESC, e."occurCount" DESC
               LIMIT $3"#,
        )
        .bind(user_id)
        .bind(language_id)
        .bind(limit as i64)
        .fetch_all(self.proxy.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(WeakWord {
                    lexeme_id: row.try_get("lexemeId")?,
                    lemma: row.try_get("naturalKey")?,
                    error_type: parse_json_enum(row.try_get::<String, _>("errorType")?)?,
                    severity: Severity::parse_lenient(&row.try_get::<String, _>("severity")?),
                    occur_count: row.try_get("occurCount")?,
                    last_occurred_at: row.try_get("lastOccurredAt")?,
                    evidence: row.try_get("evidence")?,
                })
            })
            .collect()
    }

    pub(super) async fn word_errors_for(
        &self,
        user_id: &str,
        lexeme_ids: &[String],
    ) -> Result<Vec<UserWordError>, StoreError> {
        if lexeme_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<sqlx::Postgres>::new(
            r#"SELECT "id","userId","lexemeId","errorType","source","severity","occurCount",
                 "lastOccurredAt","evidence"
               FROM "user_word_errors" WHERE "userId" = "#,
        );
        qb.push_bind(user_id);
        qb.push(r#" AND "lexemeId" IN ("#);
        {
            let mut sep = qb.separated(", ");
            for id in lexeme_ids {
                sep.push_bind(id);
            }
        }
        qb.push(r#") ORDER BY "lastOccurredAt" DESC"#);
        let rows = qb.build().fetch_all(self.proxy.pool()).await?;
        rows.iter().map(map_word_error).collect()
    }

    pub(super) async fn get_speaking_task(
        &self,
        task_id: &str,
    ) -> Result<Option<SpeakingTask>, StoreError> {
        let row = sqlx::query(
            r#"SELECT "id","languageId","taskType","title","active","items"
               FROM "speaking_tasks" WHERE "id" = $1"#,
        )
        .bind(task_id)
        .fetch_optional(self.proxy.pool())
        .await?;

        row.map(|row| {
            Ok(SpeakingTask {
                id: row.try_get("id")?,
                language_id: row.try_get("languageId")?,
                task_type: parse_json_enum(row.try_get::<String, _>("taskType")?)?,
                title: row.try_get("title")?,
                active: row.try_get("active")?,
                items: serde_json::from_value(row.try_get("items")?)?,
            })
        })
        .transpose()
    }

    pub(super) async fn insert_speaking_attempt(
        &self,
        attempt: &SpeakingAttempt,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            r#"INSERT INTO "speaking_attempts" ({ATTEMPT_COLUMNS})
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
               ON CONFLICT ("id") DO NOTHING"#
        ))
        .bind(&attempt.id)
        .bind(&attempt.user_id)
        .bind(&attempt.language_id)
        .bind(attempt.task_type.as_str())
        .bind(serde_json::to_value(&attempt.origin)?)
        .bind(attempt.status.as_str())
        .bind(i16::from(attempt.strictness))
        .bind(attempt.duration_sec)
        .bind(serde_json::to_value(&attempt.items)?)
        .bind(attempt.score_percent.map(i16::from))
        .bind(attempt.ai_result.as_ref().map(serde_json::to_value).transpose()?)
        .bind(attempt.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(attempt.created_at)
        .bind(attempt.submitted_at)
        .bind(attempt.updated_at)
        .execute(self.proxy.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub(super) async fn get_speaking_attempt(
        &self,
        attempt_id: &str,
    ) -> Result<Option<SpeakingAttempt>, StoreError> {
        let row = sqlx::query(&format!(
            r#"SELECT {ATTEMPT_COLUMNS} FROM "speaking_attempts" WHERE "id" = $1"#
        ))
        .bind(attempt_id)
        .fetch_optional(self.proxy.pool())
        .await?;
        row.map(|r| map_attempt(&r)).transpose()
    }

    pub(super) async fn update_attempt_if(
        &self,
        attempt: &SpeakingAttempt,
        expected: AttemptStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE "speaking_attempts" SET
                 "status" = $3, "strictness" = $4, "durationSec" = $5, "items" = $6,
                 "submittedAt" = $7, "updatedAt" = $8
               WHERE "id" = $1 AND "status" = $2"#,
        )
        .bind(&attempt.id)
        .bind(expected.as_str())
        .bind(attempt.status.as_str())
        .bind(i16::from(attempt.strictness))
        .bind(attempt.duration_sec)
        .bind(serde_json::to_value(&attempt.items)?)
        .bind(attempt.submitted_at)
        .bind(attempt.updated_at)
        .execute(self.proxy.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub(super) async fn complete_attempt(
        &self,
        attempt_id: &str,
        completion: &AttemptCompletion,
        now: DateTime<Utc>,
    ) -> Result<Option<SpeakingAttempt>, StoreError> {
        let row = match completion {
            AttemptCompletion::Scored {
                score_percent,
                ai_result,
            } => {
                sqlx::query(&format!(
                    r#"UPDATE "speaking_attempts" SET
                         "status" = 'SCORED', "scorePercent" = $2, "aiResult" = $3,
                         "error" = NULL, "updatedAt" = $4
                       WHERE "id" = $1 AND (
                         "status" IN ('SUBMITTED','PENDING_AI')
                         OR ("status" = 'FAILED' AND ("error"->>'retryable')::boolean IS TRUE)
                       )
                       RETURNING {ATTEMPT_COLUMNS}"#
                ))
                .bind(attempt_id)
                .bind(i16::from(*score_percent))
                .bind(serde_json::to_value(ai_result)?)
                .bind(now)
                .fetch_optional(self.proxy.pool())
                .await?
            }
            AttemptCompletion::Failed { error } => {
                sqlx::query(&format!(
                    r#"UPDATE "speaking_attempts" SET
                         "status" = 'FAILED', "error" = $2, "updatedAt" = $3
                       WHERE "id" = $1 AND "status" IN ('SUBMITTED','PENDING_AI','FAILED')
                       RETURNING {ATTEMPT_COLUMNS}"#
                ))
                .bind(attempt_id)
                .bind(serde_json::to_value(error)?)
                .bind(now)
                .fetch_optional(self.proxy.pool())
                .await?
            }
        };
        row.map(|r| map_attempt(&r)).transpose()
    }

    pub(super) async fn list_stale_attempts(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SpeakingAttempt>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {ATTEMPT_COLUMNS} FROM "speaking_attempts"
               WHERE (
                 "status" IN ('SUBMITTED','PENDING_AI')
                 OR ("status" = 'FAILED' AND ("error"->>'retryable')::boolean IS TRUE)
               ) AND "updatedAt" < $1
               ORDER BY "updatedAt" ASC
               LIMIT $2"#
        ))
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(self.proxy.pool())
        .await?;
        rows.iter().map(map_attempt).collect()
    }
}

async fn save_state_with<'e, E>(executor: E, record: &StateRecord) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"INSERT INTO "user_review_states"
             ("id","userId","domain","itemId","mastery","familiarity","easeFactor","repetition",
              "intervalDays","lapseCount","lastReviewedAt","nextReviewAt","lastSource",
              "createdAt","updatedAt")
           VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
           ON CONFLICT ("userId","domain","itemId") DO UPDATE SET
             "mastery" = EXCLUDED."mastery",
             "familiarity" = EXCLUDED."familiarity",
             "easeFactor" = EXCLUDED."easeFactor",
             "repetition" = EXCLUDED."repetition",
             "intervalDays" = EXCLUDED."intervalDays",
             "lapseCount" = EXCLUDED."lapseCount",
             "lastReviewedAt" = EXCLUDED."lastReviewedAt",
             "nextReviewAt" = EXCLUDED."nextReviewAt",
             "lastSource" = EXCLUDED."lastSource",
             "updatedAt" = EXCLUDED."updatedAt""#,
    )
    .bind(&record.id)
    .bind(&record.user_id)
    .bind(record.domain.as_str())
    .bind(&record.item_id)
    .bind(record.state.mastery.as_str())
    .bind(record.state.familiarity)
    .bind(record.state.ease_factor)
    .bind(record.state.repetition)
    .bind(record.state.interval_days)
    .bind(record.state.lapse_count)
    .bind(record.state.last_reviewed_at)
    .bind(record.state.next_review_at)
    .bind(&record.last_source)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

fn parse_json_enum<T: serde::de::DeserializeOwned>(raw: String) -> Result<T, StoreError> {
    serde_json::from_value(Value::String(raw)).map_err(StoreError::from)
}

fn parse_domain(raw: &str) -> Result<Domain, StoreError> {
    Domain::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("unknown domain {raw}")))
}

fn map_settings(row: &PgRow) -> Result<ReviewSettings, StoreError> {
    Ok(ReviewSettings {
        user_id: row.try_get("userId")?,
        language_id: row.try_get("languageId")?,
        daily_new_limit: row.try_get("dailyNewLimit")?,
        daily_review_limit: row.try_get("dailyReviewLimit")?,
        updated_at: row.try_get("updatedAt")?,
    })
}

fn map_item(row: &PgRow) -> Result<ReviewableItem, StoreError> {
    Ok(ReviewableItem {
        id: row.try_get("id")?,
        domain: parse_domain(&row.try_get::<String, _>("domain")?)?,
        language_id: row.try_get("languageId")?,
        natural_key: row.try_get("naturalKey")?,
        difficulty: row.try_get("difficulty")?,
        active: row.try_get("active")?,
        content: serde_json::from_value(row.try_get("content")?)?,
    })
}

fn map_state(row: &PgRow) -> Result<StateRecord, StoreError> {
    let mastery: String = row.try_get("mastery")?;
    Ok(StateRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("userId")?,
        domain: parse_domain(&row.try_get::<String, _>("domain")?)?,
        item_id: row.try_get("itemId")?,
        state: ReviewState {
            mastery: Mastery::parse(&mastery)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown mastery {mastery}")))?,
            familiarity: row.try_get("familiarity")?,
            ease_factor: row.try_get("easeFactor")?,
            repetition: row.try_get("repetition")?,
            interval_days: row.try_get("intervalDays")?,
            lapse_count: row.try_get("lapseCount")?,
            last_reviewed_at: row.try_get("lastReviewedAt")?,
            next_review_at: row.try_get("nextReviewAt")?,
        },
        last_source: row.try_get("lastSource")?,
        created_at: row.try_get("createdAt")?,
        updated_at: row.try_get("updatedAt")?,
    })
}

fn map_word_error(row: &PgRow) -> Result<UserWordError, StoreError> {
    Ok(UserWordError {
        id: row.try_get("id")?,
        user_id: row.try_get("userId")?,
        lexeme_id: row.try_get("lexemeId")?,
        error_type: parse_json_enum(row.try_get::<String, _>("errorType")?)?,
        source: parse_json_enum(row.try_get::<String, _>("source")?)?,
        severity: Severity::parse_lenient(&row.try_get::<String, _>("severity")?),
        occur_count: row.try_get("occurCount")?,
        last_occurred_at: row.try_get("lastOccurredAt")?,
        evidence: row.try_get("evidence")?,
    })
}

fn map_attempt(row: &PgRow) -> Result<SpeakingAttempt, StoreError> {
    let status: String = row.try_get("status")?;
    let ai_result: Option<Value> = row.try_get("aiResult")?;
    let error: Option<Value> = row.try_get("error")?;
    let score: Option<i16> = row.try_get("scorePercent")?;
    let strictness: i16 = row.try_get("strictness")?;
    Ok(SpeakingAttempt {
        id: row.try_get("id")?,
        user_id: row.try_get("userId")?,
        language_id: row.try_get("languageId")?,
        task_type: parse_json_enum(row.try_get::<String, _>("taskType")?)?,
        origin: serde_json::from_value(row.try_get("origin")?)?,
        status: AttemptStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown attempt status {status}")))?,
        strictness: strictness.clamp(0, 100) as u8,
        duration_sec: row.try_get("durationSec")?,
        items: serde_json::from_value(row.try_get("items")?)?,
        score_percent: score.map(|s| s.clamp(0, 100) as u8),
        ai_result: ai_result.map(serde_json::from_value).transpose()?,
        error: error.map(serde_json::from_value).transpose()?,
        created_at: row.try_get("createdAt")?,
        submitted_at: row.try_get("submittedAt")?,
        updated_at: row.try_get("updatedAt")?,
    })
}
