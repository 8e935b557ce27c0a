//! Redis-backed store client
//!
//! Works against both single-node and cluster deployments:
//! - Topology is probed with `INFO cluster`; in cluster mode
//!   `CLUSTER NODES` supplies primaries and their slot ranges
//! - One multiplexed connection per node, cached and reused
//! - Scans use `SCAN cursor MATCH pattern COUNT n [TYPE t]`
//! - Mutations are sent as one pipeline per batch; replies are read raw so
//!   an error reply fails only its own key

use crate::action::KeyType;
use crate::error::{StoreError, StoreResult};
use crate::store::{KeyOutcome, Mutation, NodeHandle, ShardedStoreClient, SlotRange};

use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::{Client, ConnectionAddr, ConnectionInfo, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Redis store client
pub struct RedisStore {
    client: Client,
    seed_address: String,
    connections: RwLock<HashMap<String, MultiplexedConnection>>,
    closed: AtomicBool,
}

impl RedisStore {
    /// Connect to the deployment reachable at `url`
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| StoreError::Disconnected(e.to_string()))?;

        let seed_address = client.get_connection_info().addr.to_string();

        let connection = client.get_multiplexed_async_connection().await?;

        let mut connections = HashMap::new();
        connections.insert(seed_address.clone(), connection);

        Ok(Self {
            client,
            seed_address,
            connections: RwLock::new(connections),
            closed: AtomicBool::new(false),
        })
    }

    /// Close the client; every later call reports a lost connection
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Disconnected("store client closed".to_string()));
        }
        Ok(())
    }

    /// Get (or open) the connection for `address`
    async fn conn_for(&self, address: &str) -> StoreResult<MultiplexedConnection> {
        self.ensure_open()?;

        if let Some(conn) = self.connections.read().await.get(address) {
            return Ok(conn.clone());
        }

        let conn = if address == self.seed_address {
            self.client.get_multiplexed_async_connection().await?
        } else {
            let (host, port) = split_address(address)?;
            let info = ConnectionInfo {
                addr: ConnectionAddr::Tcp(host, port),
                redis: self.client.get_connection_info().redis.clone(),
            };
            let client =
                Client::open(info).map_err(|e| StoreError::Disconnected(e.to_string()))?;
            client.get_multiplexed_async_connection().await?
        };

        debug!(address, "opened node connection");
        self.connections
            .write()
            .await
            .insert(address.to_string(), conn.clone());
        Ok(conn)
    }

    /// Map a failed call, dropping the cached connection if it is gone
    async fn on_error(&self, address: &str, err: redis::RedisError) -> StoreError {
        let err = StoreError::from(err);
        if matches!(err, StoreError::Disconnected(_)) {
            warn!(address, "connection lost, evicting");
            self.connections.write().await.remove(address);
        }
        err
    }

    async fn is_cluster(&self) -> StoreResult<bool> {
        let mut conn = self.conn_for(&self.seed_address).await?;
        let info: String = redis::cmd("INFO")
            .arg("cluster")
            .query_async(&mut conn)
            .await?;
        Ok(info
            .lines()
            .any(|line| line.trim() == "cluster_enabled:1"))
    }
}

#[async_trait::async_trait]
impl ShardedStoreClient for RedisStore {
    async fn list_primary_nodes(&self) -> StoreResult<Vec<NodeHandle>> {
        if !self.is_cluster().await? {
            return Ok(vec![NodeHandle::standalone(&self.seed_address)]);
        }

        let mut conn = self.conn_for(&self.seed_address).await?;
        let text: String = redis::cmd("CLUSTER")
            .arg("NODES")
            .query_async(&mut conn)
            .await?;
        parse_cluster_nodes(&text)
    }

    async fn scan_page(
        &self,
        node: &NodeHandle,
        cursor: &str,
        pattern: &str,
        key_type: Option<KeyType>,
        count: usize,
    ) -> StoreResult<(Vec<String>, String)> {
        let mut conn = self.conn_for(&node.address).await?;

        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count);
        if let Some(key_type) = key_type {
            cmd.arg("TYPE").arg(key_type.as_store_name());
        }

        match cmd.query_async::<(String, Vec<String>)>(&mut conn).await {
            Ok((next, keys)) => Ok((keys, next)),
            Err(e) => Err(self.on_error(&node.address, e).await),
        }
    }

    async fn pipeline_apply(
        &self,
        node: &NodeHandle,
        mutations: &[Mutation],
    ) -> StoreResult<Vec<KeyOutcome>> {
        if mutations.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn_for(&node.address).await?;

        let mut pipe = redis::pipe();
        for mutation in mutations {
            match mutation {
                Mutation::Delete(key) => {
                    pipe.cmd("DEL").arg(key);
                }
                Mutation::Unlink(key) => {
                    pipe.cmd("UNLINK").arg(key);
                }
                Mutation::Set { key, value, ttl_ms } => {
                    pipe.cmd("SET").arg(key).arg(value);
                    if let Some(ttl) = ttl_ms {
                        pipe.arg("PX").arg(*ttl);
                    }
                }
            }
        }

        // query_async would turn one error reply into a whole-pipeline error
        let replies = match conn.req_packed_commands(&pipe, 0, mutations.len()).await {
            Ok(replies) => replies,
            Err(e) => return Err(self.on_error(&node.address, e).await),
        };

        if replies.len() != mutations.len() {
            return Err(StoreError::Command(format!(
                "pipeline returned {} replies for {} commands",
                replies.len(),
                mutations.len()
            )));
        }

        Ok(mutations
            .iter()
            .zip(replies)
            .map(|(mutation, reply)| reply_outcome(mutation, reply))
            .collect())
    }
}

/// Interpret one pipeline reply
fn reply_outcome(mutation: &Mutation, reply: Value) -> KeyOutcome {
    let key = mutation.key();
    match reply {
        Value::Int(n) if n > 0 => KeyOutcome::ok(key),
        Value::Int(_) => KeyOutcome::failed(key, "key not found"),
        Value::Okay => KeyOutcome::ok(key),
        Value::SimpleString(ref s) if s == "OK" => KeyOutcome::ok(key),
        Value::ServerError(err) => {
            let message = match err.details() {
                Some(details) => format!("{} {}", err.code(), details),
                None => err.code().to_string(),
            };
            KeyOutcome::failed(key, message)
        }
        other => KeyOutcome::failed(key, format!("unexpected reply: {:?}", other)),
    }
}

fn split_address(address: &str) -> StoreResult<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| StoreError::Topology(format!("malformed node address '{}'", address)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| StoreError::Topology(format!("malformed node port in '{}'", address)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

/// Parse `CLUSTER NODES` output into primary node handles
///
/// Line format:
/// `<id> <ip:port@cport[,hostname]> <flags> <master> <ping> <pong> <epoch> <link> <slot>...`
pub fn parse_cluster_nodes(text: &str) -> StoreResult<Vec<NodeHandle>> {
    let mut primaries = Vec::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(StoreError::Topology(format!("malformed node line '{}'", line)));
        }

        let id = fields[0];
        let address = fields[1]
            .split(['@', ','])
            .next()
            .unwrap_or_default();
        let flags: Vec<&str> = fields[2].split(',').collect();

        let is_primary = flags.contains(&"master");
        let is_replica = flags.contains(&"slave") || flags.contains(&"replica");
        if !is_primary && !is_replica {
            return Err(StoreError::Topology(format!(
                "node {} has no role (flags '{}')",
                id, fields[2]
            )));
        }
        if is_replica {
            continue;
        }

        let mut slots = Vec::new();
        for field in &fields[8..] {
            // Migrating/importing markers look like [slot->-id]
            if field.starts_with('[') {
                continue;
            }
            let range = match field.split_once('-') {
                Some((start, end)) => parse_slot(start).zip(parse_slot(end)),
                None => parse_slot(field).map(|s| (s, s)),
            };
            match range {
                Some((start, end)) => slots.push(SlotRange::new(start, end)),
                None => {
                    return Err(StoreError::Topology(format!(
                        "node {} has malformed slot range '{}'",
                        id, field
                    )))
                }
            }
        }

        // A primary without slots owns no keys
        if slots.is_empty() {
            continue;
        }
        if flags.contains(&"fail") || flags.contains(&"noaddr") || address.is_empty() {
            return Err(StoreError::Topology(format!(
                "primary {} serving slots is unreachable (flags '{}')",
                id, fields[2]
            )));
        }

        primaries.push(NodeHandle {
            id: id.to_string(),
            address: address.to_string(),
            slots,
        });
    }

    if primaries.is_empty() {
        return Err(StoreError::Topology("no primary nodes own any slots".to_string()));
    }

    primaries.sort_by(|a, b| a.slots[0].start.cmp(&b.slots[0].start));
    Ok(primaries)
}

fn parse_slot(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|slot| *slot < crate::store::SLOT_COUNT)
}
