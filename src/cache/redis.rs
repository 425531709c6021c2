use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Value;

use super::SimilaritySearch;
use crate::context::RequestContext;
use crate::types::SearchResult;
use crate::Result;

const KEY_PREFIX: &str = "cache:";

/// Vector similarity search over a Redis KNN index. Records are hashes under
/// the `cache:` prefix with an `embedding` (float32 LE), `data`, and
/// `indexed_at` field; distances use the cosine metric.
pub struct RedisVectorSearch {
    client: redis::Client,
    index_name: String,
    dimension: usize,
}

impl RedisVectorSearch {
    /// Opens the client and makes sure the index exists with the expected
    /// dimension. An existing index with a different dimension is dropped
    /// and recreated, discarding cached entries; the cache is best-effort,
    /// so that trade is acceptable.
    pub async fn connect(
        url: &str,
        index_name: impl Into<String>,
        dimension: usize,
    ) -> Result<Self> {
        let search = Self {
            client: redis::Client::open(url)?,
            index_name: index_name.into(),
            dimension,
        };
        search.ensure_index().await?;
        Ok(search)
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn ensure_index(&self) -> Result<()> {
        let mut conn = self.connection().await?;

        let info = redis::cmd("FT.INFO")
            .arg(&self.index_name)
            .query_async::<Value>(&mut conn)
            .await;
        match info {
            Ok(info) => {
                match find_dimension(&info) {
                    Some(existing) if existing != self.dimension => {
                        tracing::warn!(
                            index = %self.index_name,
                            existing,
                            expected = self.dimension,
                            "recreating vector index with incompatible dimension"
                        );
                        redis::cmd("FT.DROPINDEX")
                            .arg(&self.index_name)
                            .arg("DD")
                            .query_async::<()>(&mut conn)
                            .await?;
                        self.create_index(&mut conn).await
                    }
                    _ => {
                        tracing::debug!(index = %self.index_name, "vector index already exists");
                        Ok(())
                    }
                }
            }
            Err(_) => self.create_index(&mut conn).await,
        }
    }

    async fn create_index(&self, conn: &mut MultiplexedConnection) -> Result<()> {
        tracing::info!(
            index = %self.index_name,
            dimension = self.dimension,
            "creating vector index"
        );

        redis::cmd("FT.CREATE")
            .arg(&self.index_name)
            .arg("ON")
            .arg("HASH")
            .arg("PREFIX")
            .arg(1)
            .arg(KEY_PREFIX)
            .arg("SCHEMA")
            .arg("embedding")
            .arg("VECTOR")
            .arg("FLAT")
            .arg(6)
            .arg("TYPE")
            .arg("FLOAT32")
            .arg("DIM")
            .arg(self.dimension)
            .arg("DISTANCE_METRIC")
            .arg("COSINE")
            .arg("data")
            .arg("TEXT")
            .arg("indexed_at")
            .arg("NUMERIC")
            .arg("SORTABLE")
            .query_async::<()>(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SimilaritySearch for RedisVectorSearch {
    async fn search(
        &self,
        cx: &RequestContext,
        embedding: &[f64],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let vector = floats_to_bytes(embedding);
        let mut conn = self.connection().await?;

        let query = format!("*=>[KNN {limit} @embedding $vec AS score]");
        let mut cmd = redis::cmd("FT.SEARCH");
        cmd.arg(&self.index_name)
            .arg(&query)
            .arg("PARAMS")
            .arg(2)
            .arg("vec")
            .arg(&vector[..])
            .arg("RETURN")
            .arg(3)
            .arg("data")
            .arg("indexed_at")
            .arg("score")
            .arg("SORTBY")
            .arg("score")
            .arg("DIALECT")
            .arg(2);

        let reply = cx
            .run(async move { Ok(cmd.query_async::<Value>(&mut conn).await?) })
            .await?;
        Ok(parse_search_reply(reply, threshold))
    }

    async fn index(
        &self,
        cx: &RequestContext,
        key: &str,
        embedding: &[f64],
        data: &[u8],
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.connection().await?;

        let mut pipe = redis::pipe();
        pipe.cmd("HSET")
            .arg(key)
            .arg("embedding")
            .arg(&floats_to_bytes(embedding)[..])
            .arg("data")
            .arg(data)
            .arg("indexed_at")
            .arg(Utc::now().timestamp())
            .ignore();
        if !ttl.is_zero() {
            pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs()).ignore();
        }

        cx.run(async move {
            let _: () = pipe.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}

/// Serialize an embedding the way the index stores vectors: IEEE-754 32-bit
/// little-endian. The narrowing from f64 is immaterial for cosine search.
pub(crate) fn floats_to_bytes(values: &[f64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for value in values {
        buf.extend_from_slice(&(*value as f32).to_le_bytes());
    }
    buf
}

fn parse_search_reply(reply: Value, threshold: f64) -> Vec<SearchResult> {
    let Value::Array(items) = reply else {
        return Vec::new();
    };

    let mut iter = items.into_iter();
    // First element is the total document count.
    let _ = iter.next();

    let mut results = Vec::new();
    while let (Some(key), Some(fields)) = (iter.next(), iter.next()) {
        if let Some(result) = parse_document(key, fields, threshold) {
            results.push(result);
        }
    }
    results
}

fn parse_document(key: Value, fields: Value, threshold: f64) -> Option<SearchResult> {
    let key = value_to_string(&key)?;
    let Value::Array(fields) = fields else {
        return None;
    };

    let mut map = HashMap::new();
    let mut iter = fields.into_iter();
    while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
        if let Some(name) = value_to_string(&name) {
            map.insert(name, value);
        }
    }

    let distance: f64 = value_to_string(map.get("score")?)?.parse().ok()?;
    let similarity = (1.0 - distance).clamp(0.0, 1.0);
    if similarity < threshold {
        return None;
    }

    let data = value_to_bytes(map.get("data")?)?;
    let indexed_at = map
        .get("indexed_at")
        .and_then(value_to_string)
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or_default();

    Some(SearchResult {
        key,
        similarity,
        data,
        indexed_at,
    })
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::SimpleString(text) => Some(text.clone()),
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::Int(number) => Some(number.to_string()),
        Value::Double(number) => Some(number.to_string()),
        _ => None,
    }
}

fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(bytes) => Some(bytes.clone()),
        Value::SimpleString(text) => Some(text.clone().into_bytes()),
        _ => None,
    }
}

fn find_dimension(value: &Value) -> Option<usize> {
    match value {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if value_to_string(item).is_some_and(|text| text.eq_ignore_ascii_case("dim")) {
                    if let Some(dim) = items.get(i + 1).and_then(value_to_usize) {
                        return Some(dim);
                    }
                }
                if let Some(found) = find_dimension(item) {
                    return Some(found);
                }
            }
            None
        }
        Value::Map(entries) => {
            for (name, entry) in entries {
                if value_to_string(name).is_some_and(|text| text.eq_ignore_ascii_case("dim")) {
                    if let Some(dim) = value_to_usize(entry) {
                        return Some(dim);
                    }
                }
                if let Some(found) = find_dimension(entry) {
                    return Some(found);
                }
            }
            None
        }
        _ => None,
    }
}

fn value_to_usize(value: &Value) -> Option<usize> {
    match value {
        Value::Int(number) => usize::try_from(*number).ok(),
        other => value_to_string(other)?.parse().ok(),
    }
}
