//! Daily digest worker: one summary per user per calendar day.

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::PipelineContext;
use crate::config::DailyConfig;
use crate::notify::{format_daily, matches_filters, Notifier, Subscription};
use crate::repository::tender_info;

pub async fn run(ctx: PipelineContext, config: DailyConfig, notifier: Notifier) {
    info!(poll_s = config.poll_s, lookback_h = config.lookback_h, "daily worker started");

    while !ctx.shutting_down() {
        if let Err(e) = tick(&ctx, &config, &notifier).await {
            warn!(error = %e, "daily tick failed");
        }
        sleep_with_shutdown(&ctx, config.poll_s).await;
    }
    info!("daily worker stopped");
}

async fn tick(ctx: &PipelineContext, config: &DailyConfig, notifier: &Notifier) -> Result<(), String> {
    let subs = ctx
        .users
        .active_subscriptions(Some("daily"))
        .await
        .map_err(|e| e.to_string())?;
    if subs.is_empty() {
        return Ok(());
    }

    let since = (chrono::Utc::now() - chrono::Duration::hours(config.lookback_h)).to_rfc3339();
    let tenders = ctx
        .tenders
        .published_since(&since)
        .await
        .map_err(|e| e.to_string())?;
    let infos: Vec<Map<String, Value>> = tenders.iter().map(tender_info).collect();

    // group subscriptions per user; one digest covers all of them
    let mut by_user: Vec<(i32, i64, Vec<Subscription>)> = Vec::new();
    for record in &subs {
        let sub = Subscription::from_record(record);
        match by_user.iter_mut().find(|(uid, _, _)| *uid == record.user_id) {
            Some((_, _, list)) => list.push(sub),
            None => by_user.push((record.user_id, record.telegram_user_id, vec![sub])),
        }
    }

    let day_start = chrono::Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().to_rfc3339())
        .unwrap_or_else(|| since.clone());

    for (user_id, telegram_user_id, user_subs) in by_user {
        let already = ctx
            .users
            .alert_sent_since(user_id, "daily_summary", &day_start)
            .await
            .unwrap_or(false);
        if already {
            continue;
        }

        let mut matched: Vec<Map<String, Value>> = Vec::new();
        for tender in &infos {
            if user_subs.iter().any(|s| matches_filters(tender, &s.filters)) {
                matched.push(tender.clone());
            }
            if matched.len() >= config.max_items {
                break;
            }
        }

        let message = format_daily(&matched);
        notifier
            .send_direct(&telegram_user_id.to_string(), &message)
            .await;
        let payload = json!({"count": matched.len(), "lookback_h": config.lookback_h});
        if let Err(e) = ctx
            .users
            .record_alert(user_id, "daily_summary", &payload.to_string())
            .await
        {
            warn!(user_id, error = %e, "failed to record daily alert");
        }
    }
    Ok(())
}

async fn sleep_with_shutdown(ctx: &PipelineContext, secs: u64) {
    for _ in 0..secs {
        if ctx.shutting_down() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}
