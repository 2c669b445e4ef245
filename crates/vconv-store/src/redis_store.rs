//! Redis-backed store.
//!
//! ## Layout
//!
//! Every record is a hash whose fields are the JSON encodings of the
//! record's camelCase fields, so a Lua script can compare and overwrite
//! single fields without decoding payloads. Fields starting with `_` are
//! bookkeeping and never surface in the model.
//!
//! ```text
//! {p}:queue:{id}            hash   Queue
//! {p}:queues                set    queue ids
//! {p}:queue:by_name         hash   name -> id
//! {p}:queue:{id}:tasks      set    task ids of the queue
//! {p}:queue:{id}:waiting    zset   WAITING rank members of the queue
//! {p}:task:{id}             hash   Task (+ _queue, _rank)
//! {p}:tasks                 set    task ids
//! {p}:waiting               zset   WAITING rank members, all queues
//! {p}:machine:{id}          hash   Machine
//! {p}:machines              set    machine ids
//! {p}:machine:by_{field}    hash   name/ip/token -> id
//! {p}:token:{token}         hash   ApiToken
//! {p}:tokens                set    tokens
//! ```
//!
//! WAITING sets are scored 0 and ordered lexicographically by a rank member
//! that encodes (priority desc, createdAt asc, id asc), so the best candidate
//! is the first member.
//!
//! Scripts derive per-queue key names from the prefix, which assumes a
//! single Redis node.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use vconv_models::{
    ApiToken, Machine, MachineId, Queue, QueueId, Stage, Task, TaskId, TaskStatus, TerminalOutcome,
};

use crate::error::{StoreError, StoreResult};
use crate::store::{ClaimOutcome, DeleteOutcome, OverrideOutcome, Store, TransitionOutcome};

/// Appends the record's fields to a tagged reply. Shared by scripts that
/// return the updated record.
const REPLY_WITH_RECORD: &str = r"
local function tagged(key, tag)
  local out = {tag}
  local fields = redis.call('HGETALL', key)
  for i = 1, #fields do out[#out + 1] = fields[i] end
  return out
end
";

/// KEYS: record, registry set, unique index hashes...
/// ARGV: id, unique values (one per index)..., field/value pairs...
const INSERT_UNIQUE: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 'id' end
local indexes = #KEYS - 2
for i = 1, indexes do
  if redis.call('HEXISTS', KEYS[2 + i], ARGV[1 + i]) == 1 then return tostring(i) end
end
for i = 1, indexes do
  redis.call('HSET', KEYS[2 + i], ARGV[1 + i], ARGV[1])
end
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[1], unpack(ARGV, 2 + indexes))
return 'ok'
";

/// KEYS: task, tasks set, queue tasks set, global waiting, queue waiting, queue
/// ARGV: id, rank ('' when not WAITING), field/value pairs...
const INSERT_TASK: &str = r"
if redis.call('EXISTS', KEYS[6]) == 0 then return -1 end
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[1])
if ARGV[2] ~= '' then
  redis.call('ZADD', KEYS[4], 0, ARGV[2])
  redis.call('ZADD', KEYS[5], 0, ARGV[2])
end
return 1
";

/// KEYS: task, global waiting
/// ARGV: prefix, WAITING, DOWNLOADING, machine id, updatedAt
const CLAIM: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return {'missing'} end
if status ~= ARGV[2] then return {'status', status} end
local rank = redis.call('HGET', KEYS[1], '_rank')
local queue = redis.call('HGET', KEYS[1], '_queue')
redis.call('HSET', KEYS[1], 'status', ARGV[3], 'machineId', ARGV[4], 'updatedAt', ARGV[5])
redis.call('ZREM', KEYS[2], rank)
redis.call('ZREM', ARGV[1] .. ':queue:' .. queue .. ':waiting', rank)
return tagged(KEYS[1], 'ok')
";

/// KEYS: task
/// ARGV: machine id, FINISHED, FAILED, payload field, payload, status, updatedAt
const PROGRESS: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return {'missing'} end
if redis.call('HGET', KEYS[1], 'machineId') ~= ARGV[1] then return {'not_owner'} end
if status == ARGV[2] or status == ARGV[3] then return {'terminal', status} end
redis.call('HSET', KEYS[1], ARGV[4], ARGV[5], 'status', ARGV[6], 'updatedAt', ARGV[7])
return tagged(KEYS[1], 'ok')
";

/// KEYS: task, machine
/// ARGV: machine id, FINISHED, FAILED, outcome field, outcome, status, updatedAt, counter field
const FINISH: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return {'missing'} end
if redis.call('EXISTS', KEYS[2]) == 0 then return {'not_owner'} end
if redis.call('HGET', KEYS[1], 'machineId') ~= ARGV[1] then return {'not_owner'} end
if status == ARGV[2] or status == ARGV[3] then return {'terminal', status} end
redis.call('HSET', KEYS[1], ARGV[4], ARGV[5], 'status', ARGV[6], 'updatedAt', ARGV[7])
redis.call('HINCRBY', KEYS[2], ARGV[8], 1)
return tagged(KEYS[1], 'ok')
";

/// KEYS: task, global waiting
/// ARGV: prefix, queue id, status, updatedAt, WAITING, null, '1' if status is active
const OVERRIDE: &str = r"
if redis.call('HGET', KEYS[1], '_queue') ~= ARGV[2] then return {'missing'} end
if ARGV[7] == '1' then
  local owner = redis.call('HGET', KEYS[1], 'machineId')
  if not owner or owner == ARGV[6] then return {'unowned'} end
end
local rank = redis.call('HGET', KEYS[1], '_rank')
local queue_waiting = ARGV[1] .. ':queue:' .. ARGV[2] .. ':waiting'
redis.call('HSET', KEYS[1], 'status', ARGV[3], 'updatedAt', ARGV[4])
if ARGV[3] == ARGV[5] then
  redis.call('HSET', KEYS[1], 'machineId', ARGV[6])
  redis.call('ZADD', KEYS[2], 0, rank)
  redis.call('ZADD', queue_waiting, 0, rank)
else
  redis.call('ZREM', KEYS[2], rank)
  redis.call('ZREM', queue_waiting, rank)
end
return tagged(KEYS[1], 'ok')
";

/// KEYS: task, tasks set, queue tasks set, global waiting, queue waiting
/// ARGV: queue id, task id
const DELETE_TASK: &str = r"
if redis.call('HGET', KEYS[1], '_queue') ~= ARGV[1] then return 0 end
local rank = redis.call('HGET', KEYS[1], '_rank')
redis.call('ZREM', KEYS[4], rank)
redis.call('ZREM', KEYS[5], rank)
redis.call('SREM', KEYS[2], ARGV[2])
redis.call('SREM', KEYS[3], ARGV[2])
redis.call('DEL', KEYS[1])
return 1
";

/// KEYS: queue, queue tasks set, by_name, queues set
/// ARGV: queue id, name
const DELETE_QUEUE: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 'missing' end
if redis.call('SCARD', KEYS[2]) > 0 then return 'not_empty' end
redis.call('DEL', KEYS[1])
redis.call('HDEL', KEYS[3], ARGV[2])
redis.call('SREM', KEYS[4], ARGV[1])
return 'ok'
";

/// KEYS: machine
/// ARGV: now, null, heartbeat field count, field/value pairs...
const STAMP_MACHINE: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'missing'} end
if redis.call('HGET', KEYS[1], 'firstHeartbeat') == ARGV[2] then
  redis.call('HSET', KEYS[1], 'firstHeartbeat', ARGV[1])
end
if tonumber(ARGV[3]) > 0 then
  redis.call('HSET', KEYS[1], unpack(ARGV, 4))
end
return tagged(KEYS[1], 'ok')
";

/// Redis-backed store.
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    insert_unique: redis::Script,
    insert_task: redis::Script,
    claim: redis::Script,
    progress: redis::Script,
    finish: redis::Script,
    override_status: redis::Script,
    delete_task: redis::Script,
    delete_queue: redis::Script,
    stamp_machine: redis::Script,
}

fn with_record(body: &str) -> redis::Script {
    redis::Script::new(&format!("{}{}", REPLY_WITH_RECORD, body))
}

/// JSON-encode each top-level field of `value` as a hash field.
fn to_fields<T: Serialize>(value: &T) -> StoreResult<Vec<(String, String)>> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => {
            Ok(map.into_iter().map(|(k, v)| (k, v.to_string())).collect())
        }
        other => Err(StoreError::corrupt(format!("expected an object, got {}", other))),
    }
}

/// Rebuild a record from its hash. An empty hash means the record is absent.
fn from_fields<T: DeserializeOwned>(fields: HashMap<String, String>) -> StoreResult<Option<T>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let mut map = serde_json::Map::with_capacity(fields.len());
    for (key, raw) in fields {
        if key.starts_with('_') {
            continue;
        }
        map.insert(key, serde_json::from_str(&raw)?);
    }
    Ok(Some(serde_json::from_value(serde_json::Value::Object(map))?))
}

/// Rebuild a record from a flat `[field, value, ...]` reply.
fn from_pairs<T: DeserializeOwned>(pairs: &[String]) -> StoreResult<T> {
    let fields: HashMap<String, String> = pairs
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    from_fields(fields)?.ok_or_else(|| StoreError::corrupt("script returned an empty record"))
}

fn json<T: Serialize>(value: &T) -> StoreResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn parse_status(raw: &str) -> StoreResult<TaskStatus> {
    Ok(serde_json::from_str(raw)?)
}

/// Lexicographic rank of a WAITING task: priority desc, createdAt asc, id asc.
fn waiting_rank(task: &Task) -> String {
    let flipped = i64::from(i32::MAX) - i64::from(task.priority);
    let micros = task.created_at.timestamp_micros().max(0);
    format!("{:020}:{:020}:{}", flipped, micros, task.id)
}

fn task_id_from_rank(rank: &str) -> Option<TaskId> {
    rank.splitn(3, ':').nth(2).map(TaskId::from)
}

impl RedisStore {
    /// Create a store client. Does not connect until first use.
    pub fn new(redis_url: &str, prefix: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        info!("Redis store configured with key prefix '{}'", prefix);
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            insert_unique: redis::Script::new(INSERT_UNIQUE),
            insert_task: redis::Script::new(INSERT_TASK),
            claim: with_record(CLAIM),
            progress: with_record(PROGRESS),
            finish: with_record(FINISH),
            override_status: with_record(OVERRIDE),
            delete_task: redis::Script::new(DELETE_TASK),
            delete_queue: redis::Script::new(DELETE_QUEUE),
            stamp_machine: with_record(STAMP_MACHINE),
        })
    }

    async fn conn(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    fn task_key(&self, id: &TaskId) -> String {
        self.key(&["task", id.as_str()])
    }

    fn machine_key(&self, id: &MachineId) -> String {
        self.key(&["machine", id.as_str()])
    }

    fn queue_key(&self, id: &QueueId) -> String {
        self.key(&["queue", id.as_str()])
    }

    fn queue_waiting_key(&self, id: &QueueId) -> String {
        self.key(&["queue", id.as_str(), "waiting"])
    }

    fn queue_tasks_key(&self, id: &QueueId) -> String {
        self.key(&["queue", id.as_str(), "tasks"])
    }

    /// Insert a record guarded by unique indexes. Returns the name of the
    /// violated constraint, if any.
    async fn insert_guarded(
        &self,
        record_key: String,
        registry_key: String,
        id: &str,
        unique: &[(String, String, &str)],
        fields: Vec<(String, String)>,
    ) -> StoreResult<Option<String>> {
        let mut invocation = self.insert_unique.prepare_invoke();
        invocation.key(record_key).key(registry_key);
        for (index, _, _) in unique {
            invocation.key(index.as_str());
        }
        invocation.arg(id);
        for (_, value, _) in unique {
            invocation.arg(value.as_str());
        }
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.conn().await?;
        let reply: String = invocation.invoke_async(&mut conn).await?;
        Ok(match reply.as_str() {
            "ok" => None,
            "id" => Some("id".to_string()),
            n => {
                let position: usize = n
                    .parse()
                    .map_err(|_| StoreError::corrupt(format!("unexpected insert reply '{}'", n)))?;
                let violated = position.checked_sub(1).and_then(|i| unique.get(i));
                Some(violated.map_or("unique field", |u| u.2).to_string())
            }
        })
    }

    async fn load_all<T: DeserializeOwned>(&self, keys: Vec<String>) -> StoreResult<Vec<T>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hgetall(key);
        }
        let mut conn = self.conn().await?;
        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            // Removed between SMEMBERS and HGETALL.
            if let Some(record) = from_fields(row)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn load<T: DeserializeOwned>(&self, key: String) -> StoreResult<Option<T>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        from_fields(fields)
    }

    fn owner_checked(reply: Vec<String>) -> StoreResult<TransitionOutcome> {
        match reply.first().map(String::as_str) {
            Some("ok") => Ok(TransitionOutcome::Applied(from_pairs(&reply[1..])?)),
            Some("missing") => Ok(TransitionOutcome::NotFound),
            Some("not_owner") => Ok(TransitionOutcome::NotOwner),
            Some("terminal") => {
                let raw = reply.get(1).map(String::as_str).unwrap_or_default();
                Ok(TransitionOutcome::AlreadyTerminal(parse_status(raw)?))
            }
            other => Err(StoreError::corrupt(format!("unexpected script reply {:?}", other))),
        }
    }

    async fn stamp(
        &self,
        id: &MachineId,
        now: DateTime<Utc>,
        fields: Vec<(&str, String)>,
    ) -> StoreResult<Option<Machine>> {
        let mut invocation = self.stamp_machine.prepare_invoke();
        invocation
            .key(self.machine_key(id))
            .arg(json(&now)?)
            .arg("null")
            .arg(fields.len());
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.conn().await?;
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        match reply.first().map(String::as_str) {
            Some("ok") => Ok(Some(from_pairs(&reply[1..])?)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn create_queue(&self, name: &str, now: DateTime<Utc>) -> StoreResult<Queue> {
        let queue = Queue::new(name, now);
        let violated = self
            .insert_guarded(
                self.queue_key(&queue.id),
                self.key(&["queues"]),
                queue.id.as_str(),
                &[(self.key(&["queue", "by_name"]), name.to_string(), "queue name")],
                to_fields(&queue)?,
            )
            .await?;
        if let Some(field) = violated {
            return Err(StoreError::duplicate(field));
        }
        debug!("Created queue {} ({})", queue.id, queue.name);
        Ok(queue)
    }

    async fn list_queues(&self) -> StoreResult<Vec<Queue>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(self.key(&["queues"])).await?;
        let keys = ids.into_iter().map(|id| self.queue_key(&QueueId::from(id))).collect();
        let mut queues: Vec<Queue> = self.load_all(keys).await?;
        queues.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(queues)
    }

    async fn get_queue(&self, id: &QueueId) -> StoreResult<Option<Queue>> {
        self.load(self.queue_key(id)).await
    }

    async fn delete_queue(&self, id: &QueueId) -> StoreResult<DeleteOutcome> {
        let Some(queue) = self.get_queue(id).await? else {
            return Ok(DeleteOutcome::NotFound);
        };
        let mut conn = self.conn().await?;
        let reply: String = self
            .delete_queue
            .key(self.queue_key(id))
            .key(self.queue_tasks_key(id))
            .key(self.key(&["queue", "by_name"]))
            .key(self.key(&["queues"]))
            .arg(id.as_str())
            .arg(queue.name.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(match reply.as_str() {
            "ok" => DeleteOutcome::Deleted,
            "not_empty" => DeleteOutcome::NotEmpty,
            _ => DeleteOutcome::NotFound,
        })
    }

    async fn insert_task(&self, task: &Task) -> StoreResult<bool> {
        let rank = if task.status == TaskStatus::Waiting {
            waiting_rank(task)
        } else {
            String::new()
        };

        let mut invocation = self.insert_task.prepare_invoke();
        invocation
            .key(self.task_key(&task.id))
            .key(self.key(&["tasks"]))
            .key(self.queue_tasks_key(&task.queue_id))
            .key(self.key(&["waiting"]))
            .key(self.queue_waiting_key(&task.queue_id))
            .key(self.queue_key(&task.queue_id))
            .arg(task.id.as_str())
            .arg(rank.as_str())
            .arg("_queue")
            .arg(task.queue_id.as_str())
            .arg("_rank")
            .arg(waiting_rank(task));
        for (field, value) in to_fields(task)? {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.conn().await?;
        let inserted: i64 = invocation.invoke_async(&mut conn).await?;
        match inserted {
            -1 => Ok(false),
            0 => Err(StoreError::duplicate(format!("task id '{}'", task.id))),
            _ => Ok(true),
        }
    }

    async fn get_task(&self, id: &TaskId) -> StoreResult<Option<Task>> {
        self.load(self.task_key(id)).await
    }

    async fn list_tasks(&self, queue: &QueueId) -> StoreResult<Vec<Task>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(self.queue_tasks_key(queue)).await?;
        let keys = ids.into_iter().map(|id| self.task_key(&TaskId::from(id))).collect();
        let mut tasks: Vec<Task> = self.load_all(keys).await?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn delete_task(&self, queue: &QueueId, id: &TaskId) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = self
            .delete_task
            .key(self.task_key(id))
            .key(self.key(&["tasks"]))
            .key(self.queue_tasks_key(queue))
            .key(self.key(&["waiting"]))
            .key(self.queue_waiting_key(queue))
            .arg(queue.as_str())
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn peek_waiting(&self, queue: Option<&QueueId>) -> StoreResult<Option<Task>> {
        let index = match queue {
            Some(queue) => self.queue_waiting_key(queue),
            None => self.key(&["waiting"]),
        };
        let mut conn = self.conn().await?;
        let head: Vec<String> = conn.zrangebylex_limit(index, "-", "+", 0, 1).await?;
        match head.first().and_then(|rank| task_id_from_rank(rank)) {
            Some(id) => self.get_task(&id).await,
            None => Ok(None),
        }
    }

    async fn claim_task(
        &self,
        id: &TaskId,
        machine: &MachineId,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        let mut conn = self.conn().await?;
        let reply: Vec<String> = self
            .claim
            .key(self.task_key(id))
            .key(self.key(&["waiting"]))
            .arg(self.prefix.as_str())
            .arg(json(&TaskStatus::Waiting)?)
            .arg(json(&TaskStatus::Downloading)?)
            .arg(json(machine)?)
            .arg(json(&now)?)
            .invoke_async(&mut conn)
            .await?;

        match reply.first().map(String::as_str) {
            Some("ok") => Ok(ClaimOutcome::Claimed(from_pairs(&reply[1..])?)),
            Some("missing") => Ok(ClaimOutcome::NotFound),
            Some("status") => {
                let raw = reply.get(1).map(String::as_str).unwrap_or_default();
                Ok(ClaimOutcome::NotWaiting(parse_status(raw)?))
            }
            other => Err(StoreError::corrupt(format!("unexpected claim reply {:?}", other))),
        }
    }

    async fn record_progress(
        &self,
        id: &TaskId,
        machine: &MachineId,
        stage: Stage,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<TransitionOutcome> {
        let mut conn = self.conn().await?;
        let reply: Vec<String> = self
            .progress
            .key(self.task_key(id))
            .arg(json(machine)?)
            .arg(json(&TaskStatus::Finished)?)
            .arg(json(&TaskStatus::Failed)?)
            .arg(stage.payload_field())
            .arg(payload.to_string())
            .arg(json(&stage.target_status())?)
            .arg(json(&now)?)
            .invoke_async(&mut conn)
            .await?;
        Self::owner_checked(reply)
    }

    async fn finish_task(
        &self,
        id: &TaskId,
        machine: &MachineId,
        outcome: TerminalOutcome,
        now: DateTime<Utc>,
    ) -> StoreResult<TransitionOutcome> {
        let status = outcome.status();
        let (field, value, counter) = match outcome {
            TerminalOutcome::Finished(result) => ("result", result.to_string(), "successCount"),
            TerminalOutcome::Failed(error) => ("error", json(&error)?, "failedCount"),
        };

        let mut conn = self.conn().await?;
        let reply: Vec<String> = self
            .finish
            .key(self.task_key(id))
            .key(self.machine_key(machine))
            .arg(json(machine)?)
            .arg(json(&TaskStatus::Finished)?)
            .arg(json(&TaskStatus::Failed)?)
            .arg(field)
            .arg(value)
            .arg(json(&status)?)
            .arg(json(&now)?)
            .arg(counter)
            .invoke_async(&mut conn)
            .await?;
        Self::owner_checked(reply)
    }

    async fn override_status(
        &self,
        queue: &QueueId,
        id: &TaskId,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<OverrideOutcome> {
        let mut conn = self.conn().await?;
        let reply: Vec<String> = self
            .override_status
            .key(self.task_key(id))
            .key(self.key(&["waiting"]))
            .arg(self.prefix.as_str())
            .arg(queue.as_str())
            .arg(json(&status)?)
            .arg(json(&now)?)
            .arg(json(&TaskStatus::Waiting)?)
            .arg("null")
            .arg(if status.is_active() { "1" } else { "" })
            .invoke_async(&mut conn)
            .await?;
        match reply.first().map(String::as_str) {
            Some("ok") => Ok(OverrideOutcome::Applied(from_pairs(&reply[1..])?)),
            Some("unowned") => Ok(OverrideOutcome::Unowned),
            _ => Ok(OverrideOutcome::NotFound),
        }
    }

    async fn task_status_counts(
        &self,
        machine: Option<&MachineId>,
    ) -> StoreResult<Vec<(TaskStatus, u64)>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(self.key(&["tasks"])).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hget(self.task_key(&TaskId::from(id.as_str())), &["status", "machineId"]);
        }
        let rows: Vec<(Option<String>, Option<String>)> = pipe.query_async(&mut conn).await?;

        let wanted = machine.map(json).transpose()?;
        let mut counts: HashMap<TaskStatus, u64> = HashMap::new();
        for (status, owner) in rows {
            let Some(status) = status else { continue };
            if wanted.is_some() && owner != wanted {
                continue;
            }
            *counts.entry(parse_status(&status)?).or_insert(0) += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn create_machine(&self, machine: &Machine) -> StoreResult<()> {
        let violated = self
            .insert_guarded(
                self.machine_key(&machine.id),
                self.key(&["machines"]),
                machine.id.as_str(),
                &[
                    (self.key(&["machine", "by_name"]), machine.name.clone(), "machine name"),
                    (self.key(&["machine", "by_ip"]), machine.ip.clone(), "machine ip"),
                    (self.key(&["machine", "by_token"]), machine.token.clone(), "machine token"),
                ],
                to_fields(machine)?,
            )
            .await?;
        match violated {
            Some(field) => Err(StoreError::duplicate(field)),
            None => Ok(()),
        }
    }

    async fn list_machines(&self) -> StoreResult<Vec<Machine>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(self.key(&["machines"])).await?;
        let keys = ids.into_iter().map(|id| self.machine_key(&MachineId::from(id))).collect();
        let mut machines: Vec<Machine> = self.load_all(keys).await?;
        machines.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(machines)
    }

    async fn get_machine(&self, id: &MachineId) -> StoreResult<Option<Machine>> {
        self.load(self.machine_key(id)).await
    }

    async fn find_machine_by_token(&self, token: &str) -> StoreResult<Option<Machine>> {
        let mut conn = self.conn().await?;
        let id: Option<String> = conn.hget(self.key(&["machine", "by_token"]), token).await?;
        match id {
            Some(id) => self.get_machine(&MachineId::from(id)).await,
            None => Ok(None),
        }
    }

    async fn delete_machine(&self, id: &MachineId) -> StoreResult<bool> {
        let Some(machine) = self.get_machine(id).await? else {
            return Ok(false);
        };
        let mut conn = self.conn().await?;
        let (removed,): (i64,) = redis::pipe()
            .atomic()
            .del(self.machine_key(id))
            .hdel(self.key(&["machine", "by_name"]), &machine.name)
            .ignore()
            .hdel(self.key(&["machine", "by_ip"]), &machine.ip)
            .ignore()
            .hdel(self.key(&["machine", "by_token"]), &machine.token)
            .ignore()
            .srem(self.key(&["machines"]), id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn record_heartbeat(
        &self,
        id: &MachineId,
        device_info: serde_json::Value,
        encoder: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Machine>> {
        let fields = vec![
            ("heartbeat", json(&now)?),
            ("deviceInfo", device_info.to_string()),
            ("encoder", json(&encoder)?),
        ];
        self.stamp(id, now, fields).await
    }

    async fn mark_online(&self, id: &MachineId, now: DateTime<Utc>) -> StoreResult<Option<Machine>> {
        self.stamp(id, now, Vec::new()).await
    }

    async fn create_token(&self, token: &ApiToken) -> StoreResult<()> {
        let violated = self
            .insert_guarded(
                self.key(&["token", token.token.as_str()]),
                self.key(&["tokens"]),
                token.token.as_str(),
                &[],
                to_fields(token)?,
            )
            .await?;
        match violated {
            Some(_) => Err(StoreError::duplicate("api token")),
            None => Ok(()),
        }
    }

    async fn find_token(&self, token: &str) -> StoreResult<Option<ApiToken>> {
        self.load(self.key(&["token", token])).await
    }

    async fn count_tokens(&self) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.scard(self.key(&["tokens"])).await?)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_rank_orders_like_dispatch() {
        let t0 = Utc::now();
        let q = QueueId::from("q");
        let mut tasks = vec![
            Task::new(q.clone(), "low", -3, t0),
            Task::new(q.clone(), "late", 5, t0 + Duration::seconds(2)),
            Task::new(q.clone(), "early", 5, t0 + Duration::seconds(1)),
            Task::new(q, "urgent", 10, t0 + Duration::seconds(3)),
        ];

        let mut by_rank = tasks.clone();
        by_rank.sort_by_key(waiting_rank);
        tasks.sort_by(|a, b| a.dispatch_order(b));
        assert_eq!(by_rank, tasks);
    }

    #[test]
    fn test_task_id_from_rank() {
        let task = Task::new(QueueId::from("q"), "clip", 1, Utc::now());
        assert_eq!(task_id_from_rank(&waiting_rank(&task)), Some(task.id));
    }

    #[test]
    fn test_fields_round_trip_and_skip_bookkeeping() {
        let task = Task::new(QueueId::from("q"), "clip", 1, Utc::now());
        let mut fields: HashMap<String, String> = to_fields(&task).unwrap().into_iter().collect();
        assert_eq!(fields["status"], "\"WAITING\"");
        assert_eq!(fields["machineId"], "null");

        fields.insert("_rank".to_string(), "not json".to_string());
        let back: Task = from_fields(fields).unwrap().unwrap();
        assert_eq!(back, task);
        assert!(from_fields::<Task>(HashMap::new()).unwrap().is_none());
    }
}
