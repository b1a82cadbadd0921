use std::fmt::Debug;

use redis::{
    aio::MultiplexedConnection, cluster::ClusterClientBuilder, cluster_async::ClusterConnection,
    AsyncCommands, Client, FromRedisValue, Pipeline, PushInfo, RedisResult,
};
use tokio::sync::mpsc::UnboundedSender;

/// Configuration for a Redis connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// The nodes to use to connect to the Redis cluster or instance.
    pub nodes: Vec<String>,
    /// The password to use to connect to the Redis cluster or instance.
    pub password: Option<String>,
    /// Whether to use cluster mode for the Redis connection.
    pub cluster_mode: bool,
}

/// A wrapper around a Redis connection that can be used to
/// get a connection to a Redis cluster or instance.
/// This provides a unified interface for both single node and cluster mode
/// connections for the subset of Redis commands used by the dialcast runtime.
pub enum ConnectionWrapper {
    Cluster(ClusterConnection),
    SingleNode(MultiplexedConnection),
}

impl Debug for ConnectionWrapper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConnectionWrapper::Cluster(_) => write!(f, "ConnectionWrapper::Cluster"),
            ConnectionWrapper::SingleNode(_) => write!(f, "ConnectionWrapper::SingleNode"),
        }
    }
}

impl Clone for ConnectionWrapper {
    fn clone(&self) -> Self {
        match self {
            ConnectionWrapper::Cluster(conn) => ConnectionWrapper::Cluster(conn.clone()),
            ConnectionWrapper::SingleNode(conn) => ConnectionWrapper::SingleNode(conn.clone()),
        }
    }
}

impl ConnectionWrapper {
    /// Get the value of a key, `None` if the key does not exist.
    /// [Redis Docs](https://redis.io/commands/GET)
    pub async fn get(&mut self, key: &str) -> RedisResult<Option<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.get(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.get(key).await,
        }
    }

    /// Set the value and expiration of a key, in milliseconds.
    /// [Redis Docs](https://redis.io/commands/SET)
    pub async fn pset_ex(&mut self, key: &str, value: &str, expire_ms: u64) -> RedisResult<bool> {
        let result: Option<String> = match self {
            ConnectionWrapper::Cluster(conn) => conn.pset_ex(key, value, expire_ms).await?,
            ConnectionWrapper::SingleNode(conn) => conn.pset_ex(key, value, expire_ms).await?,
        };

        Ok(result.is_some())
    }

    /// Set the value and expiration of a key, in milliseconds, only if the key
    /// does not exist.
    /// This maps to the `SET` command with the `NX` and `PX` options.
    ///
    /// Returns `true` if the key was set, `false` if the key already existed.
    pub async fn pset_ex_nx(
        &mut self,
        key: &str,
        value: &str,
        expire_ms: u64,
    ) -> RedisResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(expire_ms);

        let result: Option<String> = match self {
            ConnectionWrapper::Cluster(conn) => cmd.query_async(conn).await?,
            ConnectionWrapper::SingleNode(conn) => cmd.query_async(conn).await?,
        };

        Ok(result.is_some())
    }

    /// Removes the specified key.
    /// [Redis Docs](https://redis.io/commands/DEL)
    pub async fn del(&mut self, key: &str) -> RedisResult<i64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.del(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.del(key).await,
        }
    }

    /// Determines whether the specified key exists.
    /// [Redis Docs](https://redis.io/commands/EXISTS)
    pub async fn exists(&mut self, key: &str) -> RedisResult<bool> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.exists(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.exists(key).await,
        }
    }

    /// Increments the numeric value of a key by the given amount,
    /// creating the key when it does not exist.
    /// [Redis Docs](https://redis.io/commands/INCRBY)
    pub async fn incr_by(&mut self, key: &str, delta: i64) -> RedisResult<i64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.incr(key, delta).await,
            ConnectionWrapper::SingleNode(conn) => conn.incr(key, delta).await,
        }
    }

    /// Sets the expiry of a key in milliseconds.
    /// [Redis Docs](https://redis.io/commands/PEXPIRE)
    pub async fn pexpire(&mut self, key: &str, expire_ms: i64) -> RedisResult<bool> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.pexpire(key, expire_ms).await,
            ConnectionWrapper::SingleNode(conn) => conn.pexpire(key, expire_ms).await,
        }
    }

    /// Returns the cardinality of the set stored at the given key.
    /// [Redis Docs](https://redis.io/commands/SCARD)
    pub async fn scard(&mut self, key: &str) -> RedisResult<u64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.scard(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.scard(key).await,
        }
    }

    /// Returns all members of the set stored at the given key.
    /// [Redis Docs](https://redis.io/commands/SMEMBERS)
    pub async fn smembers(&mut self, key: &str) -> RedisResult<Vec<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.smembers(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.smembers(key).await,
        }
    }

    /// Returns the length of the list stored at the given key.
    /// [Redis Docs](https://redis.io/commands/LLEN)
    pub async fn llen(&mut self, key: &str) -> RedisResult<u64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.llen(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.llen(key).await,
        }
    }

    /// Returns the requested range of the list stored at the given key.
    /// [Redis Docs](https://redis.io/commands/LRANGE)
    pub async fn lrange(
        &mut self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> RedisResult<Vec<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.lrange(key, start, stop).await,
            ConnectionWrapper::SingleNode(conn) => conn.lrange(key, start, stop).await,
        }
    }

    /// Pushes values to the head of the list stored at the given key.
    /// [Redis Docs](https://redis.io/commands/LPUSH)
    pub async fn lpush(&mut self, key: &str, values: &[String]) -> RedisResult<u64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.lpush(key, values).await,
            ConnectionWrapper::SingleNode(conn) => conn.lpush(key, values).await,
        }
    }

    /// Pushes values to the tail of the list stored at the given key.
    /// [Redis Docs](https://redis.io/commands/RPUSH)
    pub async fn rpush(&mut self, key: &str, values: &[String]) -> RedisResult<u64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.rpush(key, values).await,
            ConnectionWrapper::SingleNode(conn) => conn.rpush(key, values).await,
        }
    }

    /// Adds a member with the given score to the sorted set stored at
    /// the given key.
    /// [Redis Docs](https://redis.io/commands/ZADD)
    pub async fn zadd(&mut self, key: &str, member: &str, score: f64) -> RedisResult<u64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.zadd(key, member, score).await,
            ConnectionWrapper::SingleNode(conn) => conn.zadd(key, member, score).await,
        }
    }

    /// Returns the members of the sorted set at the given key with their
    /// scores, limited to the provided inclusive score range.
    /// [Redis Docs](https://redis.io/commands/ZRANGEBYSCORE)
    pub async fn zrangebyscore_withscores(
        &mut self,
        key: &str,
        min: f64,
        max: f64,
    ) -> RedisResult<Vec<(String, f64)>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.zrangebyscore_withscores(key, min, max).await,
            ConnectionWrapper::SingleNode(conn) => {
                conn.zrangebyscore_withscores(key, min, max).await
            }
        }
    }

    /// Returns the cardinality of the sorted set stored at the given key.
    /// [Redis Docs](https://redis.io/commands/ZCARD)
    pub async fn zcard(&mut self, key: &str) -> RedisResult<u64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.zcard(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.zcard(key).await,
        }
    }

    /// Returns the members of the sorted set at the given key with scores
    /// in the provided inclusive score range.
    /// [Redis Docs](https://redis.io/commands/ZRANGEBYSCORE)
    pub async fn zrangebyscore(
        &mut self,
        key: &str,
        min: f64,
        max: f64,
    ) -> RedisResult<Vec<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.zrangebyscore(key, min, max).await,
            ConnectionWrapper::SingleNode(conn) => conn.zrangebyscore(key, min, max).await,
        }
    }

    /// Evaluates a Lua script.
    /// [Redis Docs](https://redis.io/commands/EVAL)
    pub async fn eval_script<T: Default + FromRedisValue>(
        &mut self,
        script: &str,
        keys: &[&str],
        args: &[&str],
    ) -> RedisResult<T> {
        if keys.is_empty() {
            return Ok(T::default());
        }

        let script_obj = redis::Script::new(script);
        let mut script_invocation = &mut script_obj.key(keys[0]);
        for key in keys.iter().skip(1) {
            script_invocation = script_invocation.key(key);
        }

        for arg in args {
            script_invocation = script_invocation.arg(arg);
        }

        let expected: T = match self {
            ConnectionWrapper::Cluster(conn) => script_invocation.invoke_async(conn).await?,
            ConnectionWrapper::SingleNode(conn) => script_invocation.invoke_async(conn).await?,
        };

        Ok(expected)
    }

    /// Executes a pipeline of commands asynchronously.
    /// [Redis Docs](https://redis.io/docs/latest/reference/pipelining/)
    pub async fn query_pipeline_async(
        &mut self,
        pipeline: &mut Pipeline,
    ) -> RedisResult<Vec<Option<String>>> {
        match self {
            ConnectionWrapper::Cluster(conn) => pipeline.query_async(conn).await,
            ConnectionWrapper::SingleNode(conn) => pipeline.query_async(conn).await,
        }
    }

    /// Subscribes to a new channel(s).
    ///
    /// Updates from the sender will be sent on the push sender that was passed
    /// to the connection when it was created. If the connection was configured
    /// without a push sender, the connection won't be able to pass messages back
    /// to the user.
    ///
    /// This method is only available when the connection is using the RESP3
    /// protocol, and will return an error otherwise. The subscription will be
    /// automatically resubscribed after disconnections.
    pub async fn subscribe(&mut self, channel_name: &str) -> RedisResult<()> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.subscribe(channel_name).await,
            ConnectionWrapper::SingleNode(conn) => conn.subscribe(channel_name).await,
        }
    }

    /// Posts a message to the given channel.
    /// [Redis Docs](https://redis.io/commands/PUBLISH)
    pub async fn publish(&mut self, channel_name: &str, message: String) -> RedisResult<i32> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.publish(channel_name, message).await,
            ConnectionWrapper::SingleNode(conn) => conn.publish(channel_name, message).await,
        }
    }
}

/// Creates a connection to a Redis cluster or instance.
///
/// If a `redis_tx` is provided, the connection will be configured to
/// use the `PushInfo` sender to surface pub/sub messages pushed by the
/// Redis server, used for the slot-available wake-up channel.
///
/// If a `redis_tx` is not provided, the connection will be configured
/// to use the default Redis connection configuration.
pub async fn get_redis_connection(
    conn_config: &ConnectionConfig,
    redis_tx: Option<UnboundedSender<PushInfo>>,
) -> RedisResult<ConnectionWrapper> {
    if !conn_config.cluster_mode {
        let client = Client::open(conn_config.nodes[0].clone())?;
        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(redis_tx) = redis_tx {
            config = config.set_push_sender(redis_tx);
        }
        return Ok(ConnectionWrapper::SingleNode(
            client
                .get_multiplexed_async_connection_with_config(&config)
                .await?,
        ));
    }
    let mut builder = ClusterClientBuilder::new(conn_config.nodes.clone())
        .use_protocol(redis::ProtocolVersion::RESP3);

    if let Some(password) = conn_config.password.clone() {
        builder = builder.password(password);
    }

    let client = if let Some(redis_tx) = redis_tx {
        builder.push_sender(redis_tx).build()?
    } else {
        builder.build()?
    };

    Ok(ConnectionWrapper::Cluster(
        client.get_async_connection().await?,
    ))
}
