//! Resource API: rooms, calls and the roster live behind plain HTTP.

use async_trait::async_trait;
use parley_shared::constants::API_KEY_HEADER;
use parley_shared::types::{CallId, CallInfo, RoomId, RoomInfo, RosterEntry, UserId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::{path_join, ClientConfig};
use crate::error::ApiError;

#[async_trait]
pub trait ResourceApi: Send + Sync {
    async fn create_room(&self, name: &str) -> Result<RoomInfo, ApiError>;

    async fn create_direct_room(&self, peer: &UserId) -> Result<RoomInfo, ApiError>;

    async fn get_room(&self, room: &RoomId) -> Result<RoomInfo, ApiError>;

    async fn get_rooms(&self) -> Result<Vec<RoomInfo>, ApiError>;

    async fn create_call(&self, users: &[UserId]) -> Result<CallInfo, ApiError>;

    async fn create_direct_call(&self, peer: &UserId) -> Result<CallInfo, ApiError>;

    async fn get_call(&self, call: &CallId) -> Result<CallInfo, ApiError>;

    async fn get_calls(&self) -> Result<Vec<CallInfo>, ApiError>;

    async fn get_roster(&self) -> Result<Vec<RosterEntry>, ApiError>;
}

#[derive(Serialize)]
struct CreateRoom<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct CreateDirect<'a> {
    peer: &'a UserId,
}

#[derive(Serialize)]
struct CreateCall<'a> {
    users: &'a [UserId],
}

/// [`ResourceApi`] over HTTP with JSON bodies.
#[derive(Debug, Clone)]
pub struct HttpResourceApi {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpResourceApi {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn url(&self, segments: &[&str]) -> String {
        path_join(&self.base_url, segments)
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ApiError> {
        let url = self.url(segments);
        debug!(url = %url, "GET");
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        Self::parse(request.send().await?).await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.url(segments);
        debug!(url = %url, "POST");
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        Self::parse(request.send().await?).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ResourceApi for HttpResourceApi {
    async fn create_room(&self, name: &str) -> Result<RoomInfo, ApiError> {
        self.post(&["room", "create"], &CreateRoom { name }).await
    }

    async fn create_direct_room(&self, peer: &UserId) -> Result<RoomInfo, ApiError> {
        self.post(&["room", "create-direct"], &CreateDirect { peer })
            .await
    }

    async fn get_room(&self, room: &RoomId) -> Result<RoomInfo, ApiError> {
        self.get(&["room", room.as_str()]).await
    }

    async fn get_rooms(&self) -> Result<Vec<RoomInfo>, ApiError> {
        self.get(&["room"]).await
    }

    async fn create_call(&self, users: &[UserId]) -> Result<CallInfo, ApiError> {
        self.post(&["call", "create"], &CreateCall { users }).await
    }

    async fn create_direct_call(&self, peer: &UserId) -> Result<CallInfo, ApiError> {
        self.post(&["call", "create-direct"], &CreateDirect { peer })
            .await
    }

    async fn get_call(&self, call: &CallId) -> Result<CallInfo, ApiError> {
        self.get(&["call", call.as_str()]).await
    }

    async fn get_calls(&self) -> Result<Vec<CallInfo>, ApiError> {
        self.get(&["call"]).await
    }

    async fn get_roster(&self) -> Result<Vec<RosterEntry>, ApiError> {
        self.get(&["roster"]).await
    }
}
