//! Discord REST history source.
//!
//! Pages through `GET /channels/{id}/messages` with `after`/`before`
//! anchors. Discord serves at most 100 messages per request and returns
//! them newest first whatever the anchor, so larger pages are assembled
//! from several requests and every page is re-sorted into traversal order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{FetchError, FetchResult};
use crate::traits::source::{HistorySource, PageRequest};
use crate::types::record::{AuthorId, ChannelId, ChannelInfo, Direction, GuildId, Record, RecordId};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Largest `limit` the messages endpoint accepts.
pub const MAX_MESSAGES_PER_REQUEST: usize = 100;

const GUILD_TEXT: u8 = 0;

/// Thin authenticated Discord REST client.
#[derive(Clone)]
pub struct DiscordApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl DiscordApi {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_API_BASE.to_string(),
            token: token.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> FetchResult<T> {
        let response = self
            .http
            .get(self.url(path))
            .header(reqwest::header::AUTHORIZATION, self.auth())
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::Http(Box::new(e)))?;

        let response = check_status(path, response).await?;
        response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }

    pub(crate) async fn patch_json(&self, path: &str, body: &serde_json::Value) -> FetchResult<()> {
        let response = self
            .http
            .patch(self.url(path))
            .header(reqwest::header::AUTHORIZATION, self.auth())
            .json(body)
            .send()
            .await
            .map_err(|e| FetchError::Http(Box::new(e)))?;

        check_status(path, response).await?;
        Ok(())
    }
}

async fn check_status(path: &str, response: Response) -> FetchResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let header_hint = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok());
    let body = response.text().await.unwrap_or_default();

    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited {
            retry_after: retry_after_from_body(&body)
                .or(header_hint)
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
        },
        StatusCode::NOT_FOUND => FetchError::NotFound {
            what: path.to_string(),
        },
        _ => FetchError::Status {
            status: status.as_u16(),
            body,
        },
    })
}

/// `retry_after` seconds from a 429 body.
fn retry_after_from_body(body: &str) -> Option<f64> {
    #[derive(Deserialize)]
    struct RateLimitBody {
        retry_after: f64,
    }
    serde_json::from_str::<RateLimitBody>(body)
        .ok()
        .map(|b| b.retry_after)
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: String,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    id: String,
    channel_id: String,
    author: ApiUser,
    #[serde(default)]
    content: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ApiChannel {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    position: Option<i64>,
}

fn snowflake(raw: &str) -> FetchResult<u64> {
    raw.parse()
        .map_err(|_| FetchError::Decode(format!("invalid snowflake {raw:?}")))
}

impl ApiMessage {
    fn into_record(self) -> FetchResult<Record> {
        Ok(Record {
            id: RecordId(snowflake(&self.id)?),
            channel_id: ChannelId(snowflake(&self.channel_id)?),
            author_id: AuthorId(snowflake(&self.author.id)?),
            author_name: self.author.global_name.unwrap_or(self.author.username),
            content: self.content,
            timestamp: self.timestamp,
        })
    }
}

/// Query for one messages request.
///
/// A forward crawl with no anchor starts after id 0, since an anchorless
/// request would return the newest messages.
fn page_query(
    direction: Direction,
    anchor: Option<RecordId>,
    limit: usize,
) -> Vec<(&'static str, String)> {
    let mut query = vec![("limit", limit.to_string())];
    match (direction, anchor) {
        (Direction::Forward, anchor) => {
            query.push(("after", anchor.map_or(0, RecordId::get).to_string()))
        }
        (Direction::Backward, Some(anchor)) => query.push(("before", anchor.to_string())),
        (Direction::Backward, None) => {}
    }
    query
}

fn into_traversal_order(
    direction: Direction,
    messages: Vec<ApiMessage>,
) -> FetchResult<Vec<Record>> {
    let mut records = messages
        .into_iter()
        .map(ApiMessage::into_record)
        .collect::<FetchResult<Vec<_>>>()?;
    match direction {
        Direction::Forward => records.sort_by_key(|r| r.id),
        Direction::Backward => records.sort_by_key(|r| std::cmp::Reverse(r.id)),
    }
    Ok(records)
}

fn text_channels(channels: Vec<ApiChannel>) -> FetchResult<Vec<ChannelInfo>> {
    let mut text: Vec<_> = channels
        .into_iter()
        .filter(|c| c.kind == GUILD_TEXT)
        .collect();
    text.sort_by_key(|c| c.position.unwrap_or(i64::MAX));
    text.into_iter()
        .map(|c| {
            Ok(ChannelInfo {
                id: ChannelId(snowflake(&c.id)?),
                name: c.name.unwrap_or_default(),
            })
        })
        .collect()
}

/// [`HistorySource`] over the Discord REST API.
#[derive(Clone)]
pub struct DiscordHistorySource {
    api: DiscordApi,
}

impl DiscordHistorySource {
    pub fn new(api: DiscordApi) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &DiscordApi {
        &self.api
    }

    async fn fetch_chunk(
        &self,
        channel_id: ChannelId,
        direction: Direction,
        anchor: Option<RecordId>,
        limit: usize,
    ) -> FetchResult<Vec<Record>> {
        let path = format!("/channels/{channel_id}/messages");
        let messages: Vec<ApiMessage> = self
            .api
            .get_json(&path, &page_query(direction, anchor, limit))
            .await?;
        into_traversal_order(direction, messages)
    }
}

#[async_trait]
impl HistorySource for DiscordHistorySource {
    async fn fetch_page(&self, request: &PageRequest) -> FetchResult<Vec<Record>> {
        let mut page = Vec::with_capacity(request.limit);
        let mut anchor = request.anchor;

        while page.len() < request.limit {
            let want = (request.limit - page.len()).min(MAX_MESSAGES_PER_REQUEST);
            let chunk = self
                .fetch_chunk(request.channel_id, request.direction, anchor, want)
                .await?;
            let short = chunk.len() < want;
            anchor = chunk.last().map(|r| r.id).or(anchor);
            page.extend(chunk);
            if short {
                break;
            }
        }

        debug!(
            channel_id = %request.channel_id,
            direction = %request.direction,
            records = page.len(),
            "discord page fetched"
        );
        Ok(page)
    }

    async fn resolve_anchor(
        &self,
        channel_id: ChannelId,
        record_id: RecordId,
    ) -> FetchResult<RecordId> {
        let path = format!("/channels/{channel_id}/messages/{record_id}");
        let message: ApiMessage = self.api.get_json(&path, &[]).await?;
        Ok(RecordId(snowflake(&message.id)?))
    }

    async fn list_channels(&self, guild_id: GuildId) -> FetchResult<Vec<ChannelInfo>> {
        let path = format!("/guilds/{guild_id}/channels");
        let channels: Vec<ApiChannel> = self.api.get_json(&path, &[]).await?;
        text_channels(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_json(id: u64) -> String {
        serde_json::json!({
            "id": id.to_string(),
            "channel_id": "55",
            "author": { "id": "9", "username": "monkey", "global_name": null },
            "content": format!("msg {id}"),
            "timestamp": "2021-05-01T10:00:00.000000+00:00",
        })
        .to_string()
    }

    fn messages(ids: &[u64]) -> Vec<ApiMessage> {
        let body = format!(
            "[{}]",
            ids.iter().map(|id| message_json(*id)).collect::<Vec<_>>().join(",")
        );
        serde_json::from_str(&body).unwrap()
    }

    #[test]
    fn test_message_decodes_into_record() {
        let record = messages(&[42]).pop().unwrap().into_record().unwrap();
        assert_eq!(record.id, RecordId(42));
        assert_eq!(record.channel_id, ChannelId(55));
        assert_eq!(record.author_name, "monkey");
        assert_eq!(record.content, "msg 42");
    }

    #[test]
    fn test_pages_are_sorted_into_traversal_order() {
        let forward = into_traversal_order(Direction::Forward, messages(&[30, 10, 20])).unwrap();
        let ids: Vec<_> = forward.iter().map(|r| r.id.get()).collect();
        assert_eq!(ids, vec![10, 20, 30]);

        let backward = into_traversal_order(Direction::Backward, messages(&[10, 30, 20])).unwrap();
        let ids: Vec<_> = backward.iter().map(|r| r.id.get()).collect();
        assert_eq!(ids, vec![30, 20, 10]);
    }

    #[test]
    fn test_page_query_anchors() {
        assert_eq!(
            page_query(Direction::Forward, None, 100),
            vec![("limit", "100".to_string()), ("after", "0".to_string())]
        );
        assert_eq!(
            page_query(Direction::Forward, Some(RecordId(7)), 50),
            vec![("limit", "50".to_string()), ("after", "7".to_string())]
        );
        assert_eq!(
            page_query(Direction::Backward, Some(RecordId(7)), 50),
            vec![("limit", "50".to_string()), ("before", "7".to_string())]
        );
        assert_eq!(
            page_query(Direction::Backward, None, 10),
            vec![("limit", "10".to_string())]
        );
    }

    #[test]
    fn test_only_text_channels_are_listed() {
        let channels: Vec<ApiChannel> = serde_json::from_str(
            r#"[
                {"id":"3","type":2,"name":"voice","position":0},
                {"id":"2","type":0,"name":"random","position":2},
                {"id":"1","type":0,"name":"general","position":1},
                {"id":"4","type":4,"name":"category","position":0}
            ]"#,
        )
        .unwrap();

        let text = text_channels(channels).unwrap();
        assert_eq!(
            text,
            vec![ChannelInfo::new(1u64, "general"), ChannelInfo::new(2u64, "random")]
        );
    }

    #[test]
    fn test_retry_after_body() {
        let body = r#"{"message":"You are being rate limited.","retry_after":1.5,"global":false}"#;
        assert_eq!(retry_after_from_body(body), Some(1.5));
        assert_eq!(retry_after_from_body("<html>"), None);
    }

    #[test]
    fn test_bad_snowflake_is_decode_error() {
        assert!(matches!(snowflake("abc"), Err(FetchError::Decode(_))));
    }
}
