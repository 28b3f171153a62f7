//! Redis backend for [`KbConnection`].

use std::collections::HashMap;

use async_trait::async_trait;
use redis::{AsyncCommands, RedisError, aio::MultiplexedConnection};
use tracing::{debug, info};

use super::{KbConnection, KbConnector, KbContext, KbError, KbResult, RetryPolicy};
use crate::config::KbConfig;

fn map_err(command: &'static str) -> impl Fn(RedisError) -> KbError {
    move |e| {
        if e.is_io_error() || e.is_connection_refusal() {
            KbError::Connection(format!("{command}: {e}"))
        } else {
            KbError::command(command, e)
        }
    }
}

/// One socket per context. The selected database is connection state, so
/// the connection is never handed to anyone else.
pub struct RedisConnection {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("connection", &"MultiplexedConnection")
            .finish()
    }
}

#[async_trait]
impl KbConnection for RedisConnection {
    async fn select(&mut self, index: usize) -> KbResult<()> {
        redis::cmd("SELECT")
            .arg(index)
            .query_async::<()>(&mut self.conn)
            .await
            .map_err(map_err("SELECT"))
    }

    async fn rpush(&mut self, key: &str, values: &[String]) -> KbResult<()> {
        self.conn
            .rpush::<_, _, ()>(key, values)
            .await
            .map_err(map_err("RPUSH"))
    }

    async fn lpush(&mut self, key: &str, values: &[String]) -> KbResult<()> {
        self.conn
            .lpush::<_, _, ()>(key, values)
            .await
            .map_err(map_err("LPUSH"))
    }

    async fn lrange(&mut self, key: &str) -> KbResult<Vec<String>> {
        self.conn
            .lrange(key, 0, -1)
            .await
            .map_err(map_err("LRANGE"))
    }

    async fn rpop(&mut self, key: &str) -> KbResult<Option<String>> {
        redis::cmd("RPOP")
            .arg(key)
            .query_async(&mut self.conn)
            .await
            .map_err(map_err("RPOP"))
    }

    async fn lindex(&mut self, key: &str, index: isize) -> KbResult<Option<String>> {
        self.conn
            .lindex(key, index)
            .await
            .map_err(map_err("LINDEX"))
    }

    async fn lrem_all(&mut self, key: &str, value: &str) -> KbResult<usize> {
        self.conn
            .lrem(key, 0, value)
            .await
            .map_err(map_err("LREM"))
    }

    async fn replace_list(&mut self, key: &str, values: &[String]) -> KbResult<()> {
        redis::pipe()
            .atomic()
            .del(key)
            .ignore()
            .rpush(key, values)
            .ignore()
            .query_async::<()>(&mut self.conn)
            .await
            .map_err(map_err("MULTI"))
    }

    async fn keys(&mut self, pattern: &str) -> KbResult<Vec<String>> {
        self.conn.keys(pattern).await.map_err(map_err("KEYS"))
    }

    async fn hsetnx(&mut self, key: &str, field: &str, value: &str) -> KbResult<bool> {
        self.conn
            .hset_nx(key, field, value)
            .await
            .map_err(map_err("HSETNX"))
    }

    async fn hdel(&mut self, key: &str, field: &str) -> KbResult<()> {
        self.conn
            .hdel::<_, _, ()>(key, field)
            .await
            .map_err(map_err("HDEL"))
    }

    async fn config_get(&mut self, name: &str) -> KbResult<Option<String>> {
        let reply: HashMap<String, String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg(name)
            .query_async(&mut self.conn)
            .await
            .map_err(map_err("CONFIG"))?;
        Ok(reply.get(name).cloned())
    }

    async fn flushdb(&mut self) -> KbResult<()> {
        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut self.conn)
            .await
            .map_err(map_err("FLUSHDB"))
    }
}

/// Opens a dedicated Redis connection per context.
#[derive(Debug)]
pub struct RedisConnector {
    client: redis::Client,
    address: String,
    retry: RetryPolicy,
}

impl RedisConnector {
    pub fn new(config: &KbConfig) -> KbResult<Self> {
        let client = redis::Client::open(config.address.as_str()).map_err(|e| {
            KbError::Configuration(format!("Invalid KB address {}: {e}", config.address))
        })?;
        info!(target: "kb::client", address = %config.address, "Using Redis KB store");
        Ok(Self {
            client,
            address: config.address.clone(),
            retry: RetryPolicy::from_config(config),
        })
    }
}

#[async_trait]
impl KbConnector for RedisConnector {
    async fn connect(&self) -> KbResult<KbContext> {
        let conn = super::connect_with_retry(&self.retry, &self.address, || async {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| KbError::Connection(e.to_string()))
        })
        .await?;
        debug!(target: "kb::client", address = %self.address, "Opened KB connection");
        Ok(KbContext::new(Box::new(RedisConnection { conn })))
    }
}
