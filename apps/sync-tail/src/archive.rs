use async_trait::async_trait;
use realtime_sync::{ArchivePager, CommandHistoryRecord, Page, SyncError, SyncResult};
use serde::Deserialize;

/// Pages through `GET {api}/archive/{instance}/commands`, newest first.
pub struct CommandArchive {
    http: reqwest::Client,
    api_url: String,
    instance: String,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListCommandsResponse {
    #[serde(default, alias = "commands")]
    entry: Vec<CommandHistoryRecord>,
    continuation_token: Option<String>,
}

impl CommandArchive {
    pub fn new(api_url: &str, instance: &str, page_size: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            instance: instance.to_string(),
            page_size,
        }
    }

    fn listing_url(&self) -> String {
        format!("{}/archive/{}/commands", self.api_url, self.instance)
    }

    fn query(&self, continuation: Option<&str>) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("limit", self.page_size.to_string()),
            ("order", "desc".to_string()),
        ];
        if let Some(token) = continuation {
            query.push(("next", token.to_string()));
        }
        query
    }
}

#[async_trait]
impl ArchivePager<CommandHistoryRecord> for CommandArchive {
    async fn load_page(&self, continuation: Option<&str>) -> SyncResult<Page<CommandHistoryRecord>> {
        let response = self
            .http
            .get(self.listing_url())
            .query(&self.query(continuation))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| SyncError::Archive(err.to_string()))?;
        let body: ListCommandsResponse = response
            .json()
            .await
            .map_err(|err| SyncError::Archive(err.to_string()))?;
        Ok(Page {
            entries: body.entry,
            continuation_token: body.continuation_token,
        })
    }
}
