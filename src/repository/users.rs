//! Users, subscriptions, follows and sent-alert records.

use chrono::Utc;
use diesel::prelude::*;

use super::models::{ActiveSubscription, SubscriptionRecord, UserRecord};
use super::pool::{run_blocking, DieselError, SqlitePool};
use crate::schema::{alert, app_user, tender_follow, user_subscription};

#[derive(Debug, Clone, Default)]
pub struct UserUpsert {
    pub telegram_user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
}

#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_user(&self, user: UserUpsert) -> Result<UserRecord, DieselError> {
        let now = Utc::now().to_rfc3339();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            let existing: Option<i32> = app_user::table
                .select(app_user::id)
                .filter(app_user::telegram_user_id.eq(user.telegram_user_id))
                .first(conn)
                .optional()?;
            match existing {
                Some(id) => {
                    diesel::update(app_user::table.find(id))
                        .set((
                            app_user::username.eq(&user.username),
                            app_user::first_name.eq(&user.first_name),
                            app_user::last_name.eq(&user.last_name),
                            app_user::language_code.eq(&user.language_code),
                            app_user::updated_at.eq(&now),
                        ))
                        .execute(conn)?;
                }
                None => {
                    diesel::insert_into(app_user::table)
                        .values((
                            app_user::telegram_user_id.eq(user.telegram_user_id),
                            app_user::username.eq(&user.username),
                            app_user::first_name.eq(&user.first_name),
                            app_user::last_name.eq(&user.last_name),
                            app_user::language_code.eq(&user.language_code),
                            app_user::created_at.eq(&now),
                            app_user::updated_at.eq(&now),
                        ))
                        .execute(conn)?;
                }
            }
            app_user::table
                .filter(app_user::telegram_user_id.eq(user.telegram_user_id))
                .first::<UserRecord>(conn)
        })
        .await
    }

    pub async fn find_by_telegram_id(&self, telegram_user_id: i64) -> Result<Option<UserRecord>, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            app_user::table
                .filter(app_user::telegram_user_id.eq(telegram_user_id))
                .first::<UserRecord>(conn)
                .optional()
        })
        .await
    }

    pub async fn follow(&self, user_id: i32, tender_id: i32) -> Result<(), DieselError> {
        let now = Utc::now().to_rfc3339();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            // replace keeps the pair unique without failing on refollow
            diesel::replace_into(tender_follow::table)
                .values((
                    tender_follow::user_id.eq(user_id),
                    tender_follow::tender_id.eq(tender_id),
                    tender_follow::created_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn unfollow(&self, user_id: i32, tender_id: i32) -> Result<(), DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::delete(
                tender_follow::table
                    .filter(tender_follow::user_id.eq(user_id))
                    .filter(tender_follow::tender_id.eq(tender_id)),
            )
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn create_subscription(
        &self,
        user_id: i32,
        filters: &str,
        delivery: &str,
        frequency: &str,
    ) -> Result<SubscriptionRecord, DieselError> {
        let filters = filters.to_string();
        let delivery = delivery.to_string();
        let frequency = frequency.to_string();
        let now = Utc::now().to_rfc3339();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::insert_into(user_subscription::table)
                .values((
                    user_subscription::user_id.eq(user_id),
                    user_subscription::filters.eq(&filters),
                    user_subscription::delivery.eq(&delivery),
                    user_subscription::frequency.eq(&frequency),
                    user_subscription::is_active.eq(1),
                    user_subscription::created_at.eq(&now),
                    user_subscription::updated_at.eq(&now),
                ))
                .execute(conn)?;
            user_subscription::table
                .filter(user_subscription::user_id.eq(user_id))
                .order(user_subscription::id.desc())
                .first::<SubscriptionRecord>(conn)
        })
        .await
    }

    /// Partial update; `None` fields keep their current value.
    pub async fn update_subscription(
        &self,
        id: i32,
        filters: Option<String>,
        delivery: Option<String>,
        frequency: Option<String>,
        is_active: Option<bool>,
    ) -> Result<Option<SubscriptionRecord>, DieselError> {
        let now = Utc::now().to_rfc3339();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            let current: Option<SubscriptionRecord> = user_subscription::table
                .find(id)
                .first(conn)
                .optional()?;
            let Some(current) = current else {
                return Ok(None);
            };
            diesel::update(user_subscription::table.find(id))
                .set((
                    user_subscription::filters.eq(filters.as_ref().unwrap_or(&current.filters)),
                    user_subscription::delivery.eq(delivery.as_ref().unwrap_or(&current.delivery)),
                    user_subscription::frequency.eq(frequency.as_ref().unwrap_or(&current.frequency)),
                    user_subscription::is_active
                        .eq(is_active.map(|b| b as i32).unwrap_or(current.is_active)),
                    user_subscription::updated_at.eq(&now),
                ))
                .execute(conn)?;
            user_subscription::table.find(id).first(conn).optional()
        })
        .await
    }

    pub async fn list_subscriptions(&self, user_id: i32) -> Result<Vec<SubscriptionRecord>, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            user_subscription::table
                .filter(user_subscription::user_id.eq(user_id))
                .order(user_subscription::id.desc())
                .load::<SubscriptionRecord>(conn)
        })
        .await
    }

    pub async fn set_all_active(&self, user_id: i32, is_active: bool) -> Result<usize, DieselError> {
        let now = Utc::now().to_rfc3339();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::update(user_subscription::table.filter(user_subscription::user_id.eq(user_id)))
                .set((
                    user_subscription::is_active.eq(is_active as i32),
                    user_subscription::updated_at.eq(&now),
                ))
                .execute(conn)
        })
        .await
    }

    pub async fn set_frequency(&self, user_id: i32, frequency: &str) -> Result<usize, DieselError> {
        let frequency = frequency.to_string();
        let now = Utc::now().to_rfc3339();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::update(user_subscription::table.filter(user_subscription::user_id.eq(user_id)))
                .set((
                    user_subscription::frequency.eq(&frequency),
                    user_subscription::updated_at.eq(&now),
                ))
                .execute(conn)
        })
        .await
    }

    /// All active subscriptions joined with the owner's chat id, newest first.
    /// Optionally restricted to one frequency.
    pub async fn active_subscriptions(
        &self,
        frequency: Option<&str>,
    ) -> Result<Vec<ActiveSubscription>, DieselError> {
        let frequency = frequency.map(String::from);
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            let mut query = user_subscription::table
                .inner_join(app_user::table)
                .filter(user_subscription::is_active.eq(1))
                .order(user_subscription::id.desc())
                .select((
                    user_subscription::id,
                    user_subscription::user_id,
                    user_subscription::filters,
                    user_subscription::delivery,
                    user_subscription::frequency,
                    app_user::telegram_user_id,
                ))
                .into_boxed();
            if let Some(ref freq) = frequency {
                query = query.filter(user_subscription::frequency.eq(freq));
            }
            query.load::<ActiveSubscription>(conn)
        })
        .await
    }

    /// Once-per-day digest guard.
    pub async fn alert_sent_since(
        &self,
        user_id: i32,
        kind: &str,
        since_rfc3339: &str,
    ) -> Result<bool, DieselError> {
        let kind = kind.to_string();
        let since = since_rfc3339.to_string();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            use diesel::dsl::count_star;
            let count: i64 = alert::table
                .filter(alert::user_id.eq(user_id))
                .filter(alert::kind.eq(&kind))
                .filter(alert::sent_at.ge(&since))
                .select(count_star())
                .first(conn)?;
            Ok(count > 0)
        })
        .await
    }

    pub async fn record_alert(&self, user_id: i32, kind: &str, payload: &str) -> Result<(), DieselError> {
        let kind = kind.to_string();
        let payload = payload.to_string();
        let now = Utc::now().to_rfc3339();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            diesel::insert_into(alert::table)
                .values((
                    alert::user_id.eq(user_id),
                    alert::kind.eq(&kind),
                    alert::payload.eq(&payload),
                    alert::sent_at.eq(&now),
                    alert::created_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}
