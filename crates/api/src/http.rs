#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use huddle_core::resources::ResourceSpec;
use huddle_core::{ApiError, ApiResult, CollectionResult, Entity, EntityId};
use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::{decode_ack, decode_list, ApiConfig, CollectionApi, ListRequest, MutationAck, Session};

/// REST implementation of `CollectionApi` for one resource.
pub struct HttpCollection<E> {
    client: reqwest::Client,
    base_url: String,
    resource: ResourceSpec,
    session: Arc<dyn Session>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> HttpCollection<E> {
    pub fn new(config: &ApiConfig, resource: ResourceSpec, session: Arc<dyn Session>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self::with_client(client, &config.base_url, resource, session))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, resource: ResourceSpec, session: Arc<dyn Session>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            resource,
            session,
            _entity: PhantomData,
        }
    }

    pub fn resource(&self) -> &ResourceSpec { &self.resource }

    pub(crate) fn collection_url(&self) -> String {
        format!("{}/{}", self.base_url, self.resource.path.trim_matches('/'))
    }

    pub(crate) fn item_url(&self, id: &EntityId) -> String {
        format!("{}/{}", self.collection_url(), id)
    }

    pub(crate) fn action_url(&self, id: &EntityId, action: &str) -> String {
        format!("{}/{}", self.item_url(id), action.trim_matches('/'))
    }

    fn authorize(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.session.bearer_token() {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    /// Send a request and return the body of a 2xx response, or a classified error.
    async fn send(&self, op: &'static str, rb: reqwest::RequestBuilder) -> ApiResult<Vec<u8>> {
        let t0 = Instant::now();
        let resp = self.authorize(rb).send().await.map_err(|e| {
            warn!(resource = %self.resource.key, op, error = %e, "api: transport failure");
            counter!("api_transport_errors_total", 1u64, "op" => op);
            ApiError::Transport(e.to_string())
        })?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| ApiError::Transport(e.to_string()))?;
        histogram!("api_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
        if status.is_success() {
            debug!(resource = %self.resource.key, op, status = status.as_u16(), bytes = body.len(), took_ms = %t0.elapsed().as_millis(), "api: ok");
            Ok(body.to_vec())
        } else {
            let err = ApiError::from_response(status.as_u16(), &body);
            info!(resource = %self.resource.key, op, status = status.as_u16(), error = %err, "api: error response");
            Err(err)
        }
    }
}

#[async_trait::async_trait]
impl<E> CollectionApi<E> for HttpCollection<E>
where
    E: Entity + DeserializeOwned,
{
    async fn list(&self, request: &ListRequest) -> ApiResult<CollectionResult<E>> {
        let params = request.params();
        let rb = self.client.get(self.collection_url()).query(params.as_slice());
        let body = self.send("list", rb).await?;
        decode_list(&body, &request.query)
    }

    async fn create(&self, payload: serde_json::Value) -> ApiResult<MutationAck<E>> {
        let rb = self.client.post(self.collection_url()).json(&payload);
        decode_ack(&self.send("create", rb).await?)
    }

    async fn update(&self, id: &EntityId, payload: serde_json::Value) -> ApiResult<MutationAck<E>> {
        let rb = self.client.put(self.item_url(id)).json(&payload);
        decode_ack(&self.send("update", rb).await?)
    }

    async fn delete(&self, id: &EntityId) -> ApiResult<MutationAck<E>> {
        let rb = self.client.delete(self.item_url(id));
        decode_ack(&self.send("delete", rb).await?)
    }

    async fn transition(
        &self,
        id: &EntityId,
        action: &str,
        payload: Option<serde_json::Value>,
    ) -> ApiResult<MutationAck<E>> {
        let mut rb = self.client.post(self.action_url(id, action));
        if let Some(p) = payload {
            rb = rb.json(&p);
        }
        decode_ack(&self.send("transition", rb).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NoSession, StaticSession};
    use huddle_core::resources::resource_for;
    use huddle_core::Record;

    fn coll(base: &str, key: &str) -> HttpCollection<Record> {
        let spec = resource_for(key).expect("resource");
        HttpCollection::with_client(reqwest::Client::new(), base, spec, Arc::new(NoSession))
    }

    #[test]
    fn urls_join_without_double_slashes() {
        let c = coll("http://api.local/v1/", "cancellations");
        assert_eq!(c.collection_url(), "http://api.local/v1/cancellation-requests");
        assert_eq!(c.item_url(&EntityId::new("12")), "http://api.local/v1/cancellation-requests/12");
        assert_eq!(
            c.action_url(&EntityId::new("12"), "/approve"),
            "http://api.local/v1/cancellation-requests/12/approve"
        );
    }

    #[test]
    fn session_token_is_attached() {
        let spec = resource_for("badges").expect("badges");
        let c: HttpCollection<Record> = HttpCollection::with_client(
            reqwest::Client::new(),
            "http://api.local",
            spec,
            Arc::new(StaticSession("tok".into())),
        );
        let req = c.authorize(c.client.get(c.collection_url())).build().expect("request");
        let auth = req.headers().get(reqwest::header::AUTHORIZATION).expect("auth header");
        assert_eq!(auth.to_str().unwrap(), "Bearer tok");
    }

    #[test]
    fn no_session_sends_no_auth() {
        let c = coll("http://api.local", "badges");
        let req = c.authorize(c.client.get(c.collection_url())).build().expect("request");
        assert!(req.headers().get(reqwest::header::AUTHORIZATION).is_none());
    }
}
