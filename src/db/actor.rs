use crate::db::models::{Credential, LinkStats, SyncLink, SyncStatus, WatchChannel};
use crate::db::patch::{CredentialPatch, CredentialUpsert};
use crate::db::schema::SQLITE_INIT;
use crate::error::SyncError;
use crate::sync::types::SyncEntity;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::{str::FromStr, time::Duration};
use tracing::{debug, info};

type Reply<T> = RpcReplyPort<Result<T, SyncError>>;

#[derive(Debug)]
pub enum DbActorMessage {
    GetCredential(String, Reply<Option<Credential>>),

    /// Insert or refresh the tokens of a user's credential.
    UpsertCredential(CredentialUpsert, Reply<Credential>),

    /// Read-modify-write of one credential row.
    PatchCredential(String, CredentialPatch, Reply<Credential>),

    DeleteCredential(String, Reply<()>),

    /// Users with a credential that does not need re-authorization.
    ListConnectedUsers(Reply<Vec<String>>),

    GetLink(String, Reply<Option<SyncLink>>),
    FindLinkByEvent(String, String, Reply<Option<SyncLink>>),
    ListLinksForUser(String, Reply<Vec<SyncLink>>),
    SaveLink(SyncLink, Reply<()>),
    DeleteLink(String, Reply<()>),
    LinkStats(String, Reply<LinkStats>),

    InsertChannel(WatchChannel, Reply<()>),
    GetChannel(String, Reply<Option<WatchChannel>>),
    ListChannelsForUser(String, Reply<Vec<WatchChannel>>),
    DeleteChannel(String, Reply<()>),
    ListAllChannels(Reply<Vec<WatchChannel>>),

    GetEntity(String, Reply<Option<SyncEntity>>),
    ListEntitiesForUser(String, Reply<Vec<SyncEntity>>),
    UpdateEntity(SyncEntity, Reply<()>),
    CancelEntity(String, Reply<()>),
    UpsertEntity(SyncEntity, Reply<()>),
    DeleteEntity(String, Reply<()>),
}

#[derive(Clone)]
pub struct DbActorHandle {
    pub(super) actor: ActorRef<DbActorMessage>,
}

pub(super) fn rpc_err<E: std::fmt::Display>(op: &'static str) -> impl FnOnce(E) -> SyncError {
    move |e| SyncError::RactorError(format!("DbActor {op} RPC failed: {e}"))
}

impl DbActorHandle {
    pub async fn get_credential(&self, user_id: &str) -> Result<Option<Credential>, SyncError> {
        ractor::call!(self.actor, DbActorMessage::GetCredential, user_id.to_string())
            .map_err(rpc_err("GetCredential"))?
    }

    pub async fn upsert_credential(
        &self,
        upsert: CredentialUpsert,
    ) -> Result<Credential, SyncError> {
        ractor::call!(self.actor, DbActorMessage::UpsertCredential, upsert)
            .map_err(rpc_err("UpsertCredential"))?
    }

    pub async fn patch_credential(
        &self,
        user_id: &str,
        patch: CredentialPatch,
    ) -> Result<Credential, SyncError> {
        ractor::call!(
            self.actor,
            DbActorMessage::PatchCredential,
            user_id.to_string(),
            patch
        )
        .map_err(rpc_err("PatchCredential"))?
    }

    pub async fn delete_credential(&self, user_id: &str) -> Result<(), SyncError> {
        ractor::call!(self.actor, DbActorMessage::DeleteCredential, user_id.to_string())
            .map_err(rpc_err("DeleteCredential"))?
    }

    pub async fn list_connected_users(&self) -> Result<Vec<String>, SyncError> {
        ractor::call!(self.actor, DbActorMessage::ListConnectedUsers)
            .map_err(rpc_err("ListConnectedUsers"))?
    }

    pub async fn get_link(&self, item_id: &str) -> Result<Option<SyncLink>, SyncError> {
        ractor::call!(self.actor, DbActorMessage::GetLink, item_id.to_string())
            .map_err(rpc_err("GetLink"))?
    }

    pub async fn find_link_by_event(
        &self,
        user_id: &str,
        event_id: &str,
    ) -> Result<Option<SyncLink>, SyncError> {
        ractor::call!(
            self.actor,
            DbActorMessage::FindLinkByEvent,
            user_id.to_string(),
            event_id.to_string()
        )
        .map_err(rpc_err("FindLinkByEvent"))?
    }

    pub async fn list_links_for_user(&self, user_id: &str) -> Result<Vec<SyncLink>, SyncError> {
        ractor::call!(self.actor, DbActorMessage::ListLinksForUser, user_id.to_string())
            .map_err(rpc_err("ListLinksForUser"))?
    }

    pub async fn save_link(&self, link: SyncLink) -> Result<(), SyncError> {
        ractor::call!(self.actor, DbActorMessage::SaveLink, link).map_err(rpc_err("SaveLink"))?
    }

    pub async fn delete_link(&self, item_id: &str) -> Result<(), SyncError> {
        ractor::call!(self.actor, DbActorMessage::DeleteLink, item_id.to_string())
            .map_err(rpc_err("DeleteLink"))?
    }

    pub async fn link_stats(&self, user_id: &str) -> Result<LinkStats, SyncError> {
        ractor::call!(self.actor, DbActorMessage::LinkStats, user_id.to_string())
            .map_err(rpc_err("LinkStats"))?
    }

    pub async fn insert_channel(&self, channel: WatchChannel) -> Result<(), SyncError> {
        ractor::call!(self.actor, DbActorMessage::InsertChannel, channel)
            .map_err(rpc_err("InsertChannel"))?
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Option<WatchChannel>, SyncError> {
        ractor::call!(self.actor, DbActorMessage::GetChannel, channel_id.to_string())
            .map_err(rpc_err("GetChannel"))?
    }

    pub async fn list_channels_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<WatchChannel>, SyncError> {
        ractor::call!(
            self.actor,
            DbActorMessage::ListChannelsForUser,
            user_id.to_string()
        )
        .map_err(rpc_err("ListChannelsForUser"))?
    }

    pub async fn delete_channel(&self, channel_id: &str) -> Result<(), SyncError> {
        ractor::call!(self.actor, DbActorMessage::DeleteChannel, channel_id.to_string())
            .map_err(rpc_err("DeleteChannel"))?
    }

    /// Channels that are expired or expire before `before`.
    pub async fn list_expiring_channels(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<WatchChannel>, SyncError> {
        let channels: Vec<WatchChannel> = ractor::call!(self.actor, DbActorMessage::ListAllChannels)
            .map_err(rpc_err("ListAllChannels"))??;
        Ok(channels
            .into_iter()
            .filter(|c| c.expiration.is_some_and(|at| at <= before))
            .collect())
    }
}

pub(super) struct DbActorState {
    pub(super) pool: SqlitePool,
}

pub(super) struct DbActor;

#[ractor::async_trait]
impl Actor for DbActor {
    type Msg = DbActorMessage;
    type State = DbActorState;
    type Arguments = String;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        database_url: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let connect_opts = SqliteConnectOptions::from_str(database_url.as_str())
            .map_err(|e| ActorProcessingErr::from(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .connect_with(connect_opts)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db connect failed: {e}")))?;

        apply_schema(&pool)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db schema init failed: {e}")))?;

        info!("DbActor initialized");
        Ok(DbActorState { pool })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let pool = &state.pool;
        match message {
            DbActorMessage::GetCredential(user_id, reply) => {
                let _ = reply.send(self.get_credential(pool, &user_id).await);
            }
            DbActorMessage::UpsertCredential(upsert, reply) => {
                let _ = reply.send(self.upsert_credential(pool, upsert).await);
            }
            DbActorMessage::PatchCredential(user_id, patch, reply) => {
                let _ = reply.send(self.patch_credential(pool, &user_id, patch).await);
            }
            DbActorMessage::DeleteCredential(user_id, reply) => {
                let _ = reply.send(self.delete_credential(pool, &user_id).await);
            }
            DbActorMessage::ListConnectedUsers(reply) => {
                let _ = reply.send(self.list_connected_users(pool).await);
            }
            DbActorMessage::GetLink(item_id, reply) => {
                let _ = reply.send(self.get_link(pool, &item_id).await);
            }
            DbActorMessage::FindLinkByEvent(user_id, event_id, reply) => {
                let _ = reply.send(self.find_link_by_event(pool, &user_id, &event_id).await);
            }
            DbActorMessage::ListLinksForUser(user_id, reply) => {
                let _ = reply.send(self.list_links_for_user(pool, &user_id).await);
            }
            DbActorMessage::SaveLink(link, reply) => {
                let _ = reply.send(self.save_link(pool, link).await);
            }
            DbActorMessage::DeleteLink(item_id, reply) => {
                let _ = reply.send(self.delete_link(pool, &item_id).await);
            }
            DbActorMessage::LinkStats(user_id, reply) => {
                let res = self
                    .list_links_for_user(pool, &user_id)
                    .await
                    .map(|links| link_stats(&links));
                let _ = reply.send(res);
            }
            DbActorMessage::InsertChannel(channel, reply) => {
                let _ = reply.send(self.insert_channel(pool, channel).await);
            }
            DbActorMessage::GetChannel(channel_id, reply) => {
                let _ = reply.send(self.get_channel(pool, &channel_id).await);
            }
            DbActorMessage::ListChannelsForUser(user_id, reply) => {
                let _ = reply.send(self.list_channels(pool, Some(&user_id)).await);
            }
            DbActorMessage::DeleteChannel(channel_id, reply) => {
                let _ = reply.send(self.delete_channel(pool, &channel_id).await);
            }
            DbActorMessage::ListAllChannels(reply) => {
                let _ = reply.send(self.list_channels(pool, None).await);
            }
            DbActorMessage::GetEntity(item_id, reply) => {
                let _ = reply.send(self.get_entity(pool, &item_id).await);
            }
            DbActorMessage::ListEntitiesForUser(user_id, reply) => {
                let _ = reply.send(self.list_entities_for_user(pool, &user_id).await);
            }
            DbActorMessage::UpdateEntity(entity, reply) => {
                let _ = reply.send(self.update_entity(pool, &entity).await);
            }
            DbActorMessage::CancelEntity(item_id, reply) => {
                let _ = reply.send(self.cancel_entity(pool, &item_id).await);
            }
            DbActorMessage::UpsertEntity(entity, reply) => {
                let _ = reply.send(self.upsert_entity(pool, &entity).await);
            }
            DbActorMessage::DeleteEntity(item_id, reply) => {
                let _ = reply.send(self.delete_entity(pool, &item_id).await);
            }
        }
        Ok(())
    }
}

const CREDENTIAL_COLUMNS: &str = r#"
    user_id, access_token, refresh_token, scope, expires_at, account_email, calendar_id,
    sync_token, last_pulled_at, managed_calendar_id, managed_calendar_summary,
    managed_calendar_state, managed_calendar_verified_at, managed_calendar_acl_role,
    managed_calendar_acl_verified_at, legacy_calendar_id, needs_reauth, created_at, updated_at
"#;

const LINK_COLUMNS: &str = r#"
    item_id, item_kind, user_id, calendar_id, event_id, etag, last_synced_at,
    last_sync_direction, local_hash, remote_updated_at, sync_status, last_error
"#;

const CHANNEL_COLUMNS: &str = r#"
    channel_id, user_id, calendar_id, resource_id, resource_uri, expiration, channel_token,
    created_at
"#;

impl DbActor {
    async fn get_credential(
        &self,
        pool: &SqlitePool,
        user_id: &str,
    ) -> Result<Option<Credential>, SyncError> {
        let sql = format!("SELECT {CREDENTIAL_COLUMNS} FROM calendar_credentials WHERE user_id = ?");
        let row = sqlx::query_as::<_, Credential>(&sql)
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    async fn upsert_credential(
        &self,
        pool: &SqlitePool,
        c: CredentialUpsert,
    ) -> Result<Credential, SyncError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO calendar_credentials (
                user_id, access_token, refresh_token, scope, expires_at, account_email,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                scope = COALESCE(excluded.scope, scope),
                expires_at = excluded.expires_at,
                account_email = COALESCE(excluded.account_email, account_email),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&c.user_id)
        .bind(c.access_token)
        .bind(c.refresh_token)
        .bind(c.scope)
        .bind(c.expires_at)
        .bind(c.account_email)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        self.get_credential(pool, &c.user_id)
            .await?
            .ok_or_else(|| SyncError::Unexpected(format!("credential {} vanished", c.user_id)))
    }

    async fn patch_credential(
        &self,
        pool: &SqlitePool,
        user_id: &str,
        patch: CredentialPatch,
    ) -> Result<Credential, SyncError> {
        let mut cred = self
            .get_credential(pool, user_id)
            .await?
            .ok_or_else(|| SyncError::NotConnected(user_id.to_string()))?;
        patch.apply_to(&mut cred, Utc::now());

        let res = sqlx::query(
            r#"
            UPDATE calendar_credentials
            SET
                access_token = ?,
                refresh_token = ?,
                scope = ?,
                expires_at = ?,
                account_email = ?,
                calendar_id = ?,
                sync_token = ?,
                last_pulled_at = ?,
                managed_calendar_id = ?,
                managed_calendar_summary = ?,
                managed_calendar_state = ?,
                managed_calendar_verified_at = ?,
                managed_calendar_acl_role = ?,
                managed_calendar_acl_verified_at = ?,
                legacy_calendar_id = ?,
                needs_reauth = ?,
                updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(&cred.access_token)
        .bind(&cred.refresh_token)
        .bind(&cred.scope)
        .bind(cred.expires_at)
        .bind(&cred.account_email)
        .bind(&cred.calendar_id)
        .bind(&cred.sync_token)
        .bind(cred.last_pulled_at)
        .bind(&cred.managed_calendar_id)
        .bind(&cred.managed_calendar_summary)
        .bind(cred.managed_calendar_state)
        .bind(cred.managed_calendar_verified_at)
        .bind(&cred.managed_calendar_acl_role)
        .bind(cred.managed_calendar_acl_verified_at)
        .bind(&cred.legacy_calendar_id)
        .bind(cred.needs_reauth)
        .bind(cred.updated_at)
        .bind(user_id)
        .execute(pool)
        .await?;

        debug!(
            user_id,
            affected = res.rows_affected(),
            calendar_id = ?cred.calendar_id,
            state = ?cred.managed_calendar_state,
            needs_reauth = cred.needs_reauth,
            "credential patch applied"
        );
        Ok(cred)
    }

    async fn delete_credential(&self, pool: &SqlitePool, user_id: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM calendar_credentials WHERE user_id = ?")
            .bind(user_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn list_connected_users(&self, pool: &SqlitePool) -> Result<Vec<String>, SyncError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT user_id FROM calendar_credentials WHERE needs_reauth = 0 ORDER BY user_id",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    async fn get_link(&self, pool: &SqlitePool, item_id: &str) -> Result<Option<SyncLink>, SyncError> {
        let sql = format!("SELECT {LINK_COLUMNS} FROM sync_links WHERE item_id = ?");
        let row = sqlx::query_as::<_, SyncLink>(&sql)
            .bind(item_id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    async fn find_link_by_event(
        &self,
        pool: &SqlitePool,
        user_id: &str,
        event_id: &str,
    ) -> Result<Option<SyncLink>, SyncError> {
        let sql = format!(
            "SELECT {LINK_COLUMNS} FROM sync_links WHERE user_id = ? AND event_id = ? ORDER BY item_id LIMIT 1"
        );
        let row = sqlx::query_as::<_, SyncLink>(&sql)
            .bind(user_id)
            .bind(event_id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    async fn list_links_for_user(
        &self,
        pool: &SqlitePool,
        user_id: &str,
    ) -> Result<Vec<SyncLink>, SyncError> {
        let sql = format!("SELECT {LINK_COLUMNS} FROM sync_links WHERE user_id = ? ORDER BY item_id");
        let rows = sqlx::query_as::<_, SyncLink>(&sql)
            .bind(user_id)
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    async fn save_link(&self, pool: &SqlitePool, link: SyncLink) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO sync_links (
                item_id, item_kind, user_id, calendar_id, event_id, etag, last_synced_at,
                last_sync_direction, local_hash, remote_updated_at, sync_status, last_error
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(item_id) DO UPDATE SET
                item_kind = excluded.item_kind,
                user_id = excluded.user_id,
                calendar_id = excluded.calendar_id,
                event_id = excluded.event_id,
                etag = excluded.etag,
                last_synced_at = excluded.last_synced_at,
                last_sync_direction = excluded.last_sync_direction,
                local_hash = excluded.local_hash,
                remote_updated_at = excluded.remote_updated_at,
                sync_status = excluded.sync_status,
                last_error = excluded.last_error
            "#,
        )
        .bind(&link.item_id)
        .bind(link.item_kind)
        .bind(&link.user_id)
        .bind(&link.calendar_id)
        .bind(&link.event_id)
        .bind(&link.etag)
        .bind(link.last_synced_at)
        .bind(link.last_sync_direction)
        .bind(&link.local_hash)
        .bind(link.remote_updated_at)
        .bind(link.sync_status)
        .bind(&link.last_error)
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn delete_link(&self, pool: &SqlitePool, item_id: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM sync_links WHERE item_id = ?")
            .bind(item_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn insert_channel(&self, pool: &SqlitePool, c: WatchChannel) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO watch_channels (
                channel_id, user_id, calendar_id, resource_id, resource_uri, expiration,
                channel_token, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(c.channel_id)
        .bind(c.user_id)
        .bind(c.calendar_id)
        .bind(c.resource_id)
        .bind(c.resource_uri)
        .bind(c.expiration)
        .bind(c.channel_token)
        .bind(c.created_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn get_channel(
        &self,
        pool: &SqlitePool,
        channel_id: &str,
    ) -> Result<Option<WatchChannel>, SyncError> {
        let sql = format!("SELECT {CHANNEL_COLUMNS} FROM watch_channels WHERE channel_id = ?");
        let row = sqlx::query_as::<_, WatchChannel>(&sql)
            .bind(channel_id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    async fn list_channels(
        &self,
        pool: &SqlitePool,
        user_id: Option<&str>,
    ) -> Result<Vec<WatchChannel>, SyncError> {
        let rows = match user_id {
            Some(user_id) => {
                let sql = format!(
                    "SELECT {CHANNEL_COLUMNS} FROM watch_channels WHERE user_id = ? ORDER BY created_at"
                );
                sqlx::query_as::<_, WatchChannel>(&sql)
                    .bind(user_id)
                    .fetch_all(pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {CHANNEL_COLUMNS} FROM watch_channels ORDER BY user_id");
                sqlx::query_as::<_, WatchChannel>(&sql).fetch_all(pool).await?
            }
        };
        Ok(rows)
    }

    async fn delete_channel(&self, pool: &SqlitePool, channel_id: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM watch_channels WHERE channel_id = ?")
            .bind(channel_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

fn link_stats(links: &[SyncLink]) -> LinkStats {
    LinkStats {
        not_idle: links
            .iter()
            .filter(|l| l.sync_status != SyncStatus::Idle)
            .count() as i64,
        last_synced_at: links.iter().filter_map(|l| l.last_synced_at).max(),
        last_error: links
            .iter()
            .filter(|l| l.sync_status == SyncStatus::Error)
            .find_map(|l| l.last_error.clone()),
    }
}

/// Spawn the database actor and return a cloneable handle.
///
/// The actor is unnamed, so several databases can live in one process.
pub async fn spawn(database_url: &str) -> DbActorHandle {
    let (actor, _jh) = ractor::Actor::spawn(None, DbActor, database_url.to_string())
        .await
        .expect("failed to spawn DbActor");

    DbActorHandle { actor }
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), SyncError> {
    for stmt in SQLITE_INIT.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(pool).await?;
    }
    Ok(())
}
