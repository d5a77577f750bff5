use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, info, warn};
use turnstile_core::repository::{ExpiredOrder, LedgerCategory, LedgerConfirmation, LedgerRepository};
use turnstile_core::{CoreError, CoreResult};
use turnstile_shared::HoldEntry;

fn ledger_err(e: impl Display) -> CoreError {
    CoreError::LedgerError(e.to_string())
}

#[derive(sqlx::FromRow)]
struct CategoryRow {
    id: String,
    event_id: String,
    quantity_total: i64,
    available_quantity: i64,
}

#[derive(sqlx::FromRow)]
struct ExpiredOrderRow {
    id: String,
    hold_token: Option<String>,
}

/// Authoritative ledger on Postgres.
#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        info!("Migrations completed successfully.");
        Ok(())
    }
}

#[async_trait]
impl LedgerRepository for DbClient {
    async fn categories(&self, event_id: &str) -> CoreResult<Vec<LedgerCategory>> {
        let rows = sqlx::query_as::<_, CategoryRow>(
            r#"
            SELECT id, event_id, quantity_total, available_quantity
            FROM ticket_categories
            WHERE event_id = $1
            ORDER BY id
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(ledger_err)?;

        Ok(rows
            .into_iter()
            .map(|r| LedgerCategory {
                event_id: r.event_id,
                category_id: r.id,
                quantity_total: r.quantity_total,
                available_quantity: r.available_quantity,
            })
            .collect())
    }

    async fn active_reservations(&self, event_id: &str, category_id: &str, now: DateTime<Utc>) -> CoreResult<i64> {
        let reserved: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(quantity)::BIGINT
            FROM reservations
            WHERE event_id = $1
              AND category_id = $2
              AND status = 'active'
              AND expires_at > $3
            "#,
        )
        .bind(event_id)
        .bind(category_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(ledger_err)?;

        Ok(reserved.unwrap_or(0))
    }

    async fn confirm_hold(&self, hold_token: &str, entries: &[HoldEntry]) -> CoreResult<LedgerConfirmation> {
        let mut tx = self.pool.begin().await.map_err(ledger_err)?;

        // Takes the order row lock the expiry pass skips, so the two never
        // both act on one order.
        sqlx::query(
            r#"
            UPDATE orders
            SET status = 'paid', payment_status = 'paid', updated_at = NOW()
            WHERE hold_token = $1 AND status = 'pending_payment'
            "#,
        )
        .bind(hold_token)
        .execute(&mut *tx)
        .await
        .map_err(ledger_err)?;

        let cancelled: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM orders WHERE hold_token = $1 AND status = 'cancelled'
            )
            "#,
        )
        .bind(hold_token)
        .fetch_one(&mut *tx)
        .await
        .map_err(ledger_err)?;

        if cancelled {
            tx.rollback().await.map_err(ledger_err)?;
            warn!("Order for hold {} was cancelled before payment confirmed", hold_token);
            return Ok(LedgerConfirmation::OrderCancelled);
        }

        let mut applied = 0;

        for entry in entries {
            // Returns a row only when this call moved the reservation to confirmed.
            let confirmed: Option<String> = sqlx::query_scalar(
                r#"
                INSERT INTO reservations (hold_token, event_id, category_id, quantity, status, expires_at)
                VALUES ($1, $2, $3, $4, 'confirmed', NOW() + INTERVAL '1 year')
                ON CONFLICT (hold_token, category_id) DO UPDATE
                    SET status = 'confirmed', quantity = EXCLUDED.quantity, updated_at = NOW()
                    WHERE reservations.status <> 'confirmed'
                RETURNING hold_token
                "#,
            )
            .bind(hold_token)
            .bind(&entry.event_id)
            .bind(&entry.category_id)
            .bind(entry.quantity)
            .fetch_optional(&mut *tx)
            .await
            .map_err(ledger_err)?;

            if confirmed.is_none() {
                debug!("Reservation {}:{} already confirmed", hold_token, entry.category_id);
                continue;
            }

            sqlx::query(
                r#"
                UPDATE ticket_categories
                SET available_quantity = available_quantity - $3,
                    updated_at = NOW()
                WHERE event_id = $1 AND id = $2
                "#,
            )
            .bind(&entry.event_id)
            .bind(&entry.category_id)
            .bind(entry.quantity)
            .execute(&mut *tx)
            .await
            .map_err(ledger_err)?;

            applied += 1;
        }

        tx.commit().await.map_err(ledger_err)?;
        Ok(LedgerConfirmation::Confirmed(applied))
    }

    async fn expire_pending_orders(&self, now: DateTime<Utc>, limit: usize) -> CoreResult<Vec<ExpiredOrder>> {
        let rows = sqlx::query_as::<_, ExpiredOrderRow>(
            r#"
            UPDATE orders
            SET status = 'cancelled', payment_status = 'expired', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM orders
                WHERE status = 'pending_payment' AND expires_at < $1
                ORDER BY expires_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, hold_token
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(ledger_err)?;

        Ok(rows
            .into_iter()
            .map(|r| ExpiredOrder {
                order_id: r.id,
                hold_token: r.hold_token,
            })
            .collect())
    }
}
