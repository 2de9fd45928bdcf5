use std::time::Duration;

use async_trait::async_trait;
use marquee_protocol::pb::{Activity, PersonalState, User};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{DataService, Friend, PersistedMessage, ServiceError, Theater};

/// JSON-over-HTTP client for the data service.
#[derive(Clone)]
pub struct HttpDataService {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct PresenceBody {
    state: PersonalState,
}

#[derive(Serialize)]
struct NewMessageBody<'a> {
    recipient_id: &'a str,
    content: &'a str,
}

impl HttpDataService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn request(&self, method: Method, path: &str, token: Option<&str>) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let req = self.http.request(method, url);
        match token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ServiceError> {
        let resp = check(req.send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn execute(&self, req: RequestBuilder) -> Result<(), ServiceError> {
        check(req.send().await?).await?;
        Ok(())
    }
}

async fn check(resp: Response) -> Result<Response, ServiceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ServiceError::Unauthorized),
        StatusCode::NOT_FOUND => Err(ServiceError::NotFound),
        _ => {
            let message = resp.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), %message, "data service call failed");
            Err(ServiceError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl DataService for HttpDataService {
    async fn authenticate(&self, token: &str) -> Result<User, ServiceError> {
        self.fetch(self.request(Method::GET, "/v1/users/@me", Some(token)))
            .await
    }

    async fn get_friends(&self, token: &str) -> Result<Vec<Friend>, ServiceError> {
        self.fetch(self.request(Method::GET, "/v1/users/@me/friends", Some(token)))
            .await
    }

    async fn update_presence(&self, token: &str, state: PersonalState) -> Result<(), ServiceError> {
        let req = self
            .request(Method::PUT, "/v1/users/@me/state", Some(token))
            .json(&PresenceBody { state });
        self.execute(req).await
    }

    async fn update_activity(&self, token: &str, activity: &Activity) -> Result<(), ServiceError> {
        let req = self
            .request(Method::PUT, "/v1/users/@me/activity", Some(token))
            .json(activity);
        self.execute(req).await
    }

    async fn remove_activity(&self, token: &str) -> Result<(), ServiceError> {
        self.execute(self.request(Method::DELETE, "/v1/users/@me/activity", Some(token)))
            .await
    }

    async fn create_message(
        &self,
        token: &str,
        recipient_id: &str,
        content: &str,
    ) -> Result<PersistedMessage, ServiceError> {
        let req = self
            .request(Method::POST, "/v1/messages", Some(token))
            .json(&NewMessageBody {
                recipient_id,
                content,
            });
        self.fetch(req).await
    }

    async fn get_theater(&self, theater_id: &str, token: Option<&str>) -> Result<Theater, ServiceError> {
        let path = format!("/v1/theaters/{theater_id}");
        self.fetch(self.request(Method::GET, &path, token)).await
    }
}
