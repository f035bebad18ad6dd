//! Host item tables (`appointments`, `bills`) behind the [`EntityStore`] seam.

use super::actor::{DbActor, DbActorHandle, DbActorMessage, rpc_err};
use crate::error::SyncError;
use crate::sync::types::{Appointment, Bill, EntityStore, SyncEntity};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

const APPOINTMENT_COLUMNS: &str =
    "id, user_id, title, starts_at, ends_at, location, notes, status, updated_at";
const BILL_COLUMNS: &str = "id, user_id, title, amount_cents, currency, due_date, status, updated_at";

#[async_trait]
impl EntityStore for DbActorHandle {
    async fn get_entity(&self, item_id: &str) -> Result<Option<SyncEntity>, SyncError> {
        ractor::call!(self.actor, DbActorMessage::GetEntity, item_id.to_string())
            .map_err(rpc_err("GetEntity"))?
    }

    async fn list_entities_for_user(&self, user_id: &str) -> Result<Vec<SyncEntity>, SyncError> {
        ractor::call!(
            self.actor,
            DbActorMessage::ListEntitiesForUser,
            user_id.to_string()
        )
        .map_err(rpc_err("ListEntitiesForUser"))?
    }

    async fn update_entity(&self, entity: SyncEntity) -> Result<(), SyncError> {
        ractor::call!(self.actor, DbActorMessage::UpdateEntity, entity)
            .map_err(rpc_err("UpdateEntity"))?
    }

    async fn cancel_entity(&self, item_id: &str) -> Result<(), SyncError> {
        ractor::call!(self.actor, DbActorMessage::CancelEntity, item_id.to_string())
            .map_err(rpc_err("CancelEntity"))?
    }

    async fn upsert_entity(&self, entity: SyncEntity) -> Result<(), SyncError> {
        ractor::call!(self.actor, DbActorMessage::UpsertEntity, entity)
            .map_err(rpc_err("UpsertEntity"))?
    }
}

impl DbActorHandle {
    /// Hard-delete an item, as the host does when a user removes it.
    pub async fn delete_entity(&self, item_id: &str) -> Result<(), SyncError> {
        ractor::call!(self.actor, DbActorMessage::DeleteEntity, item_id.to_string())
            .map_err(rpc_err("DeleteEntity"))?
    }
}

impl DbActor {
    pub(super) async fn get_entity(
        &self,
        pool: &SqlitePool,
        item_id: &str,
    ) -> Result<Option<SyncEntity>, SyncError> {
        let sql = format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?");
        if let Some(a) = sqlx::query_as::<_, Appointment>(&sql)
            .bind(item_id)
            .fetch_optional(pool)
            .await?
        {
            return Ok(Some(SyncEntity::Appointment(a)));
        }

        let sql = format!("SELECT {BILL_COLUMNS} FROM bills WHERE id = ?");
        let bill = sqlx::query_as::<_, Bill>(&sql)
            .bind(item_id)
            .fetch_optional(pool)
            .await?;
        Ok(bill.map(SyncEntity::Bill))
    }

    pub(super) async fn list_entities_for_user(
        &self,
        pool: &SqlitePool,
        user_id: &str,
    ) -> Result<Vec<SyncEntity>, SyncError> {
        let sql = format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE user_id = ? ORDER BY starts_at, id"
        );
        let appointments = sqlx::query_as::<_, Appointment>(&sql)
            .bind(user_id)
            .fetch_all(pool)
            .await?;

        let sql = format!("SELECT {BILL_COLUMNS} FROM bills WHERE user_id = ? ORDER BY due_date, id");
        let bills = sqlx::query_as::<_, Bill>(&sql)
            .bind(user_id)
            .fetch_all(pool)
            .await?;

        Ok(appointments
            .into_iter()
            .map(SyncEntity::Appointment)
            .chain(bills.into_iter().map(SyncEntity::Bill))
            .collect())
    }

    pub(super) async fn update_entity(
        &self,
        pool: &SqlitePool,
        entity: &SyncEntity,
    ) -> Result<(), SyncError> {
        let now = Utc::now();
        let res = match entity {
            SyncEntity::Appointment(a) => {
                sqlx::query(
                    r#"
                    UPDATE appointments
                    SET title = ?, starts_at = ?, ends_at = ?, location = ?, notes = ?,
                        status = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&a.title)
                .bind(a.starts_at)
                .bind(a.ends_at)
                .bind(&a.location)
                .bind(&a.notes)
                .bind(a.status)
                .bind(now)
                .bind(&a.id)
                .execute(pool)
                .await?
            }
            SyncEntity::Bill(b) => {
                sqlx::query(
                    r#"
                    UPDATE bills
                    SET title = ?, amount_cents = ?, currency = ?, due_date = ?, status = ?,
                        updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&b.title)
                .bind(b.amount_cents)
                .bind(&b.currency)
                .bind(b.due_date)
                .bind(b.status)
                .bind(now)
                .bind(&b.id)
                .execute(pool)
                .await?
            }
        };

        if res.rows_affected() == 0 {
            return Err(SyncError::Unexpected(format!(
                "item not found for id={}",
                entity.id()
            )));
        }
        Ok(())
    }

    pub(super) async fn cancel_entity(
        &self,
        pool: &SqlitePool,
        item_id: &str,
    ) -> Result<(), SyncError> {
        let now = Utc::now();
        let res = sqlx::query(
            "UPDATE appointments SET status = 'cancelled', updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(item_id)
        .execute(pool)
        .await?;
        if res.rows_affected() > 0 {
            return Ok(());
        }

        let res = sqlx::query("UPDATE bills SET status = 'cancelled', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(item_id)
            .execute(pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(SyncError::Unexpected(format!(
                "item not found for id={item_id}"
            )));
        }
        Ok(())
    }

    pub(super) async fn upsert_entity(
        &self,
        pool: &SqlitePool,
        entity: &SyncEntity,
    ) -> Result<(), SyncError> {
        match entity {
            SyncEntity::Appointment(a) => {
                sqlx::query(
                    r#"
                    INSERT INTO appointments (
                        id, user_id, title, starts_at, ends_at, location, notes, status, updated_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        title = excluded.title,
                        starts_at = excluded.starts_at,
                        ends_at = excluded.ends_at,
                        location = excluded.location,
                        notes = excluded.notes,
                        status = excluded.status,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&a.id)
                .bind(&a.user_id)
                .bind(&a.title)
                .bind(a.starts_at)
                .bind(a.ends_at)
                .bind(&a.location)
                .bind(&a.notes)
                .bind(a.status)
                .bind(a.updated_at)
                .execute(pool)
                .await?;
            }
            SyncEntity::Bill(b) => {
                sqlx::query(
                    r#"
                    INSERT INTO bills (
                        id, user_id, title, amount_cents, currency, due_date, status, updated_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        title = excluded.title,
                        amount_cents = excluded.amount_cents,
                        currency = excluded.currency,
                        due_date = excluded.due_date,
                        status = excluded.status,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&b.id)
                .bind(&b.user_id)
                .bind(&b.title)
                .bind(b.amount_cents)
                .bind(&b.currency)
                .bind(b.due_date)
                .bind(b.status)
                .bind(b.updated_at)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    pub(super) async fn delete_entity(
        &self,
        pool: &SqlitePool,
        item_id: &str,
    ) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM appointments WHERE id = ?")
            .bind(item_id)
            .execute(pool)
            .await?;
        sqlx::query("DELETE FROM bills WHERE id = ?")
            .bind(item_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
