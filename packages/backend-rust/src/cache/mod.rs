pub mod keys;

use redis::aio::MultiplexedConnection;

/// Shared multiplexed connection. Cloning is cheap and every clone talks over
/// the same socket.
#[derive(Clone)]
pub struct RedisCache {
    connection: MultiplexedConnection,
}

impl RedisCache {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        Ok(Self::new(connection))
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.connection.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }
}
