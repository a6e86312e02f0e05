use redis::RedisResult;

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    /// Fixed-window counter. True while `key` has been hit at most `limit`
    /// times in the current window.
    pub async fn check_rate_limit(&self, key: &str, limit: i64, window_seconds: i64) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, window_seconds)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count <= limit)
    }
}

/// Counter key for one caller in the window containing `epoch_seconds`.
pub fn rate_limit_key(caller: &str, epoch_seconds: i64, window_seconds: i64) -> String {
    let window = if window_seconds > 0 { epoch_seconds / window_seconds } else { 0 };
    format!("ratelimit:{}:{}", caller, window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_key_buckets_by_window() {
        assert_eq!(rate_limit_key("actor:42", 119, 60), "ratelimit:actor:42:1");
        assert_eq!(rate_limit_key("actor:42", 120, 60), "ratelimit:actor:42:2");
        assert_eq!(rate_limit_key("ip:10.0.0.1", 5, 0), "ratelimit:ip:10.0.0.1:0");
    }
}
