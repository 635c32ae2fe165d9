use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    keys, scripts, ConfirmOutcome, ExpiredReleaseOutcome, InventoryError, InventoryStore,
    QueueJoinOk, QueuePosition, ReleaseMode, ReleaseOk, ReservationRecord, ReservationState,
    ReserveOk, ReserveRequest,
};

/// Redis-backed inventory store. One script invocation per operation; the
/// scripts are loaded once and executed by SHA thereafter.
pub struct RedisInventoryStore {
    client: Arc<redis::Client>,
    manager: ConnectionManager,
    reserve: Script,
    release: Script,
    confirm: Script,
    release_expired: Script,
    join_queue: Script,
    put_pass: Script,
    take_pass: Script,
    count_passes: Script,
}

impl RedisInventoryStore {
    pub async fn connect(client: Arc<redis::Client>) -> Result<Self, InventoryError> {
        let manager = client
            .get_tokio_connection_manager()
            .await
            .map_err(io_err)?;
        Ok(Self {
            client,
            manager,
            reserve: Script::new(scripts::RESERVE),
            release: Script::new(scripts::RELEASE),
            confirm: Script::new(scripts::CONFIRM),
            release_expired: Script::new(scripts::RELEASE_EXPIRED),
            join_queue: Script::new(scripts::JOIN_QUEUE),
            put_pass: Script::new(scripts::PUT_PASS),
            take_pass: Script::new(scripts::TAKE_PASS),
            count_passes: Script::new(scripts::COUNT_ACTIVE_PASSES),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn io_err(e: redis::RedisError) -> InventoryError {
    InventoryError::Io(e.to_string())
}

fn value_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Int(n) => Some(*n),
        Value::Data(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
        Value::Status(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_string(v: &Value) -> Option<String> {
    match v {
        Value::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::Status(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

fn epoch_ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Decomposes the shared `{flag, ...}` script reply shape.
struct ScriptReply {
    ok: bool,
    fields: Vec<Value>,
}

impl ScriptReply {
    fn parse(raw: Vec<Value>) -> Result<Self, InventoryError> {
        let mut iter = raw.into_iter();
        let flag = iter
            .next()
            .as_ref()
            .and_then(value_i64)
            .ok_or_else(|| InventoryError::Io("malformed script reply".to_string()))?;
        Ok(Self {
            ok: flag == 1,
            fields: iter.collect(),
        })
    }

    fn code(&self) -> &str {
        self.fields
            .first()
            .and_then(|v| match v {
                Value::Data(bytes) => std::str::from_utf8(bytes).ok(),
                Value::Status(s) => Some(s.as_str()),
                _ => None,
            })
            .unwrap_or("")
    }

    fn detail_i64(&self, index: usize) -> Option<i64> {
        self.fields.get(index).and_then(value_i64)
    }

    fn into_error(self, zone_id: Uuid) -> InventoryError {
        match self.code() {
            "ZONE_NOT_FOUND" => InventoryError::ZoneNotFound { zone_id },
            "INSUFFICIENT_STOCK" => InventoryError::InsufficientStock {
                available: self.detail_i64(1).unwrap_or(0),
            },
            "USER_LIMIT_EXCEEDED" => InventoryError::UserLimitExceeded {
                current: self.detail_i64(1).unwrap_or(0),
            },
            "RESERVATION_NOT_FOUND" => InventoryError::ReservationNotFound,
            "ALREADY_RELEASED" => InventoryError::AlreadyReleased,
            "OWNER_MISMATCH" => InventoryError::OwnerMismatch,
            "ALREADY_CONFIRMED" => InventoryError::AlreadyConfirmed {
                confirmed_at: self
                    .detail_i64(1)
                    .and_then(epoch_ms_to_datetime),
            },
            "VALIDATION_ERROR" => InventoryError::Validation(
                self.fields
                    .get(1)
                    .and_then(value_string)
                    .unwrap_or_default(),
            ),
            other => InventoryError::Io(format!("unexpected script error code {:?}", other)),
        }
    }
}

#[async_trait]
impl InventoryStore for RedisInventoryStore {
    async fn reserve(&self, req: &ReserveRequest) -> Result<ReserveOk, InventoryError> {
        let mut conn = self.conn();
        let now_ms = Utc::now().timestamp_millis();
        let raw: Vec<Value> = self
            .reserve
            .key(keys::zone_availability(req.zone_id))
            .key(keys::user_tally(req.user_id, req.event_id))
            .key(keys::reservation(req.booking_id))
            .arg(req.quantity)
            .arg(req.max_per_user)
            .arg(req.user_id.to_string())
            .arg(req.booking_id.to_string())
            .arg(req.zone_id.to_string())
            .arg(req.event_id.to_string())
            .arg(req.show_id.to_string())
            .arg(req.unit_price.to_string())
            .arg(req.ttl.as_secs())
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(io_err)?;

        let reply = ScriptReply::parse(raw)?;
        if !reply.ok {
            return Err(reply.into_error(req.zone_id));
        }
        let remaining = reply
            .detail_i64(0)
            .ok_or_else(|| InventoryError::Io("reserve reply missing remaining".to_string()))?;
        let user_tally = reply
            .detail_i64(1)
            .ok_or_else(|| InventoryError::Io("reserve reply missing tally".to_string()))?;
        let already_reserved = reply
            .fields
            .get(2)
            .and_then(value_string)
            .map(|s| s == "ALREADY_RESERVED")
            .unwrap_or(false);
        if already_reserved {
            debug!(booking_id = %req.booking_id, "reserve retry observed existing reservation");
        }
        Ok(ReserveOk {
            remaining,
            user_tally,
            already_reserved,
        })
    }

    async fn release(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
        zone_id: Uuid,
        event_id: Uuid,
        mode: ReleaseMode,
    ) -> Result<ReleaseOk, InventoryError> {
        let mut conn = self.conn();
        let mode_arg = match mode {
            ReleaseMode::ReservedOnly => "",
            ReleaseMode::Compensation => "allow_confirmed",
        };
        let raw: Vec<Value> = self
            .release
            .key(keys::zone_availability(zone_id))
            .key(keys::user_tally(user_id, event_id))
            .key(keys::reservation(booking_id))
            .key(keys::reservation_tombstone(booking_id))
            .arg(booking_id.to_string())
            .arg(user_id.to_string())
            .arg(mode_arg)
            .invoke_async(&mut conn)
            .await
            .map_err(io_err)?;

        let reply = ScriptReply::parse(raw)?;
        if !reply.ok {
            return Err(reply.into_error(zone_id));
        }
        Ok(ReleaseOk {
            availability: reply.detail_i64(0).unwrap_or(0),
            user_tally: reply.detail_i64(1).unwrap_or(0),
        })
    }

    async fn confirm(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
        payment_id: Option<&str>,
    ) -> Result<ConfirmOutcome, InventoryError> {
        let mut conn = self.conn();
        let now_ms = Utc::now().timestamp_millis();
        let raw: Vec<Value> = self
            .confirm
            .key(keys::reservation(booking_id))
            .arg(booking_id.to_string())
            .arg(user_id.to_string())
            .arg(payment_id.unwrap_or(""))
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(io_err)?;

        let reply = ScriptReply::parse(raw)?;
        if reply.ok {
            let confirmed_at = reply
                .detail_i64(1)
                .and_then(epoch_ms_to_datetime)
                .unwrap_or_else(Utc::now);
            return Ok(ConfirmOutcome::Confirmed { confirmed_at });
        }
        if reply.code() == "ALREADY_CONFIRMED" {
            return Ok(ConfirmOutcome::AlreadyConfirmed {
                confirmed_at: reply.detail_i64(1).and_then(epoch_ms_to_datetime),
            });
        }
        Err(reply.into_error(Uuid::nil()))
    }

    async fn release_expired(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
        zone_id: Uuid,
        event_id: Uuid,
        quantity: i64,
    ) -> Result<ExpiredReleaseOutcome, InventoryError> {
        let mut conn = self.conn();
        let raw: Vec<Value> = self
            .release_expired
            .key(keys::zone_availability(zone_id))
            .key(keys::user_tally(user_id, event_id))
            .key(keys::reservation(booking_id))
            .key(keys::reservation_tombstone(booking_id))
            .arg(booking_id.to_string())
            .arg(quantity)
            .invoke_async(&mut conn)
            .await
            .map_err(io_err)?;

        let reply = ScriptReply::parse(raw)?;
        if !reply.ok {
            if reply.code() == "ALREADY_CONFIRMED" {
                return Ok(ExpiredReleaseOutcome::AlreadyConfirmed);
            }
            return Err(reply.into_error(zone_id));
        }
        let availability = reply.detail_i64(1).unwrap_or(0);
        match reply.code() {
            "RELEASED" => Ok(ExpiredReleaseOutcome::Released { availability }),
            "RESTORED" => Ok(ExpiredReleaseOutcome::Restored { availability }),
            _ => Ok(ExpiredReleaseOutcome::AlreadyRestored),
        }
    }

    async fn availability(&self, zone_id: Uuid) -> Result<Option<i64>, InventoryError> {
        let mut conn = self.conn();
        let value: Option<i64> = conn
            .get(keys::zone_availability(zone_id))
            .await
            .map_err(io_err)?;
        Ok(value)
    }

    async fn reservation(
        &self,
        booking_id: Uuid,
    ) -> Result<Option<ReservationRecord>, InventoryError> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = conn
            .hgetall(keys::reservation(booking_id))
            .await
            .map_err(io_err)?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_reservation(&map)?))
    }

    async fn seed_availability(
        &self,
        zone_id: Uuid,
        value: i64,
        force: bool,
    ) -> Result<bool, InventoryError> {
        let mut conn = self.conn();
        let key = keys::zone_availability(zone_id);
        if force {
            let _: () = conn.set(&key, value).await.map_err(io_err)?;
            Ok(true)
        } else {
            let written: bool = conn.set_nx(&key, value).await.map_err(io_err)?;
            Ok(written)
        }
    }

    async fn join_queue(
        &self,
        event_id: Uuid,
        user_id: Uuid,
        max_queue_size: i64,
        meta_ttl: Duration,
    ) -> Result<QueueJoinOk, InventoryError> {
        let mut conn = self.conn();
        let now_ms = Utc::now().timestamp_millis();
        let raw: Vec<Value> = self
            .join_queue
            .key(keys::queue(event_id))
            .key(keys::queue_user(event_id, user_id))
            .key(keys::queue_events())
            .arg(user_id.to_string())
            .arg(event_id.to_string())
            .arg(now_ms)
            .arg(meta_ttl.as_secs())
            .arg(max_queue_size)
            .invoke_async(&mut conn)
            .await
            .map_err(io_err)?;

        let reply = ScriptReply::parse(raw)?;
        if reply.ok {
            return Ok(QueueJoinOk {
                position: reply.detail_i64(1).unwrap_or(0),
                queue_len: reply.detail_i64(2).unwrap_or(0),
            });
        }
        match reply.code() {
            "ALREADY_IN_QUEUE" => Err(InventoryError::AlreadyInQueue {
                position: reply.detail_i64(1).unwrap_or(0),
                queue_len: reply.detail_i64(2).unwrap_or(0),
            }),
            "QUEUE_FULL" => Err(InventoryError::QueueFull {
                queue_len: reply.detail_i64(1).unwrap_or(0),
            }),
            _ => Err(reply.into_error(event_id)),
        }
    }

    async fn queue_position(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<QueuePosition>, InventoryError> {
        let mut conn = self.conn();
        let rank: Option<i64> = conn
            .zrank(keys::queue(event_id), user_id.to_string())
            .await
            .map_err(io_err)?;
        match rank {
            None => Ok(None),
            Some(rank) => {
                let queue_len: i64 = conn.zcard(keys::queue(event_id)).await.map_err(io_err)?;
                Ok(Some(QueuePosition {
                    position: rank + 1,
                    queue_len,
                }))
            }
        }
    }

    async fn leave_queue(&self, event_id: Uuid, user_id: Uuid) -> Result<bool, InventoryError> {
        let mut conn = self.conn();
        let removed: i64 = conn
            .zrem(keys::queue(event_id), user_id.to_string())
            .await
            .map_err(io_err)?;
        let _: i64 = conn
            .del(keys::queue_user(event_id, user_id))
            .await
            .map_err(io_err)?;
        Ok(removed > 0)
    }

    async fn queue_max_concurrent(&self, event_id: Uuid) -> Result<Option<i64>, InventoryError> {
        let mut conn = self.conn();
        let value: Option<i64> = conn
            .hget(keys::queue_config(event_id), "max_concurrent")
            .await
            .map_err(io_err)?;
        Ok(value)
    }

    async fn set_queue_max_concurrent(
        &self,
        event_id: Uuid,
        max_concurrent: i64,
    ) -> Result<(), InventoryError> {
        let mut conn = self.conn();
        let _: () = conn
            .hset(keys::queue_config(event_id), "max_concurrent", max_concurrent)
            .await
            .map_err(io_err)?;
        Ok(())
    }

    async fn active_queue_events(&self) -> Result<Vec<Uuid>, InventoryError> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.smembers(keys::queue_events()).await.map_err(io_err)?;
        Ok(members
            .into_iter()
            .filter_map(|m| Uuid::parse_str(&m).ok())
            .collect())
    }

    async fn pop_queue_batch(
        &self,
        event_id: Uuid,
        count: i64,
    ) -> Result<Vec<Uuid>, InventoryError> {
        if count <= 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let popped: Vec<(String, f64)> = conn
            .zpopmin(keys::queue(event_id), count as isize)
            .await
            .map_err(io_err)?;
        Ok(popped
            .into_iter()
            .filter_map(|(member, _)| Uuid::parse_str(&member).ok())
            .collect())
    }

    async fn count_active_passes(&self, event_id: Uuid) -> Result<i64, InventoryError> {
        let mut conn = self.conn();
        let now_ms = Utc::now().timestamp_millis();
        let count: i64 = self
            .count_passes
            .key(keys::queue_pass_index(event_id))
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(io_err)?;
        Ok(count)
    }

    async fn put_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
        token: &str,
        ttl: Duration,
    ) -> Result<(), InventoryError> {
        let mut conn = self.conn();
        let expires_ms = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        let _: i64 = self
            .put_pass
            .key(keys::queue_pass(event_id, user_id))
            .key(keys::queue_pass_index(event_id))
            .arg(user_id.to_string())
            .arg(token)
            .arg(ttl.as_secs())
            .arg(expires_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(io_err)?;
        Ok(())
    }

    async fn peek_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<String>, InventoryError> {
        let mut conn = self.conn();
        let token: Option<String> = conn
            .get(keys::queue_pass(event_id, user_id))
            .await
            .map_err(io_err)?;
        Ok(token)
    }

    async fn take_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<String>, InventoryError> {
        let mut conn = self.conn();
        let token: Option<String> = self
            .take_pass
            .key(keys::queue_pass(event_id, user_id))
            .key(keys::queue_pass_index(event_id))
            .arg(user_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(io_err)?;
        Ok(token)
    }

    async fn publish_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
        token: &str,
    ) -> Result<(), InventoryError> {
        let mut conn = self.conn();
        let _: i64 = conn
            .publish(keys::queue_pass(event_id, user_id), token)
            .await
            .map_err(io_err)?;
        Ok(())
    }

    async fn subscribe_pass(
        &self,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<mpsc::Receiver<String>, InventoryError> {
        let channel = keys::queue_pass(event_id, user_id);
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(io_err)?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(&channel).await.map_err(io_err)?;

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<String>() {
                    Ok(token) => {
                        // A pass is terminal for the subscription.
                        let _ = tx.send(token).await;
                        break;
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "undecodable pass message");
                    }
                }
            }
        });
        Ok(rx)
    }
}

fn parse_reservation(map: &HashMap<String, String>) -> Result<ReservationRecord, InventoryError> {
    let field = |name: &str| -> Result<&String, InventoryError> {
        map.get(name)
            .ok_or_else(|| InventoryError::Io(format!("reservation hash missing {}", name)))
    };
    let uuid_field = |name: &str| -> Result<Uuid, InventoryError> {
        Uuid::parse_str(field(name)?)
            .map_err(|_| InventoryError::Io(format!("reservation hash bad uuid in {}", name)))
    };
    let ms_field = |name: &str| -> Result<DateTime<Utc>, InventoryError> {
        field(name)?
            .parse::<i64>()
            .ok()
            .and_then(epoch_ms_to_datetime)
            .ok_or_else(|| InventoryError::Io(format!("reservation hash bad timestamp in {}", name)))
    };

    let status = ReservationState::parse(field("status")?)
        .ok_or_else(|| InventoryError::Io("reservation hash bad status".to_string()))?;

    Ok(ReservationRecord {
        booking_id: uuid_field("booking_id")?,
        user_id: uuid_field("user_id")?,
        zone_id: uuid_field("zone_id")?,
        event_id: uuid_field("event_id")?,
        show_id: uuid_field("show_id")?,
        quantity: field("quantity")?
            .parse()
            .map_err(|_| InventoryError::Io("reservation hash bad quantity".to_string()))?,
        unit_price: field("unit_price")?.clone(),
        status,
        created_at: ms_field("created_at")?,
        expires_at: ms_field("expires_at")?,
        confirmed_at: map
            .get("confirmed_at")
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(epoch_ms_to_datetime),
        payment_id: map
            .get("payment_id")
            .filter(|s| !s.is_empty())
            .cloned(),
    })
}
