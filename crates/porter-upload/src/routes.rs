use serde_json::json;

use porter_session::{
    Call, PersistedRequestInfo, SessionCoordinator, TaskDescriptor, Transport, UploadBody,
};
use porter_types::{FinishArg, FinishBatchResult, SessionCursor, StartResult};

/// Header carrying the JSON argument of content-endpoint calls.
pub const ARG_HEADER: &str = "Dropbox-API-Arg";

pub const START_ROUTE: &str = "upload_session/start";
pub const APPEND_ROUTE: &str = "upload_session/append_v2";
pub const FINISH_BATCH_ROUTE: &str = "upload_session/finish_batch_v2";

/// The three upload-session endpoints the batch engine drives.
pub trait UploadSessionRoutes: Send + Sync + 'static {
    /// Background sessions cannot drive batch uploads.
    fn supports_batch_upload(&self) -> bool;

    fn start(&self, close: bool, body: UploadBody) -> Call<StartResult>;

    fn append(&self, cursor: &SessionCursor, close: bool, body: UploadBody) -> Call<()>;

    fn finish_batch(&self, entries: &[FinishArg]) -> Call<FinishBatchResult>;
}

#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub api_url: String,
    pub content_url: String,
    pub access_token: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.dropboxapi.com/2".into(),
            content_url: "https://content.dropboxapi.com/2".into(),
            access_token: String::new(),
        }
    }
}

/// JSON-over-HTTP routes issued through a [`SessionCoordinator`].
pub struct ApiRoutes<T: Transport> {
    coordinator: SessionCoordinator<T>,
    config: RouteConfig,
}

impl<T: Transport> ApiRoutes<T> {
    pub fn new(coordinator: SessionCoordinator<T>, config: RouteConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    pub fn coordinator(&self) -> &SessionCoordinator<T> {
        &self.coordinator
    }

    fn content_call<R>(&self, route: &str, arg: serde_json::Value, body: UploadBody) -> Call<R>
    where
        R: serde::de::DeserializeOwned,
    {
        let descriptor = TaskDescriptor::upload(format!("{}/files/{route}", self.config.content_url), body)
            .header("Authorization", format!("Bearer {}", self.config.access_token))
            .header("Content-Type", "application/octet-stream")
            .header(ARG_HEADER, arg.to_string())
            .tag(route);
        let info = PersistedRequestInfo::upload("files", route);
        Call::new(self.coordinator.upload_task(descriptor, Some(&info)))
    }
}

impl<T: Transport> UploadSessionRoutes for ApiRoutes<T> {
    fn supports_batch_upload(&self) -> bool {
        !self.coordinator.is_background()
    }

    fn start(&self, close: bool, body: UploadBody) -> Call<StartResult> {
        self.content_call(START_ROUTE, json!({ "close": close }), body)
    }

    fn append(&self, cursor: &SessionCursor, close: bool, body: UploadBody) -> Call<()> {
        self.content_call(APPEND_ROUTE, json!({ "cursor": cursor, "close": close }), body)
    }

    fn finish_batch(&self, entries: &[FinishArg]) -> Call<FinishBatchResult> {
        let body = json!({ "entries": entries }).to_string();
        let descriptor = TaskDescriptor::data(
            format!("{}/files/{FINISH_BATCH_ROUTE}", self.config.api_url),
            body,
        )
        .header("Authorization", format!("Bearer {}", self.config.access_token))
        .header("Content-Type", "application/json")
        .tag(FINISH_BATCH_ROUTE);
        Call::new(self.coordinator.data_task(descriptor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porter_session::mock::{MockReply, MockTransport};
    use porter_session::{CoordinatorOptions, event_channel};
    use porter_types::{CommitInfo, TaskKind};

    fn routes(background: bool) -> (ApiRoutes<MockTransport>, MockTransport) {
        let (sink, events) = event_channel();
        let transport = if background {
            MockTransport::background(sink, "porter.background")
        } else {
            MockTransport::new(sink)
        };
        let handle = transport.clone();
        let coordinator = SessionCoordinator::new(transport, events, CoordinatorOptions::default());
        let config = RouteConfig {
            access_token: "tok".into(),
            ..RouteConfig::default()
        };
        (ApiRoutes::new(coordinator, config), handle)
    }

    #[tokio::test]
    async fn append_sends_cursor_in_arg_header() {
        let (routes, transport) = routes(false);
        transport.set_responder(|_| MockReply::bytes(200, "null"));
        let cursor = SessionCursor {
            session_id: "sess-9".into(),
            offset: 2048,
        };
        routes
            .append(&cursor, true, UploadBody::range("/tmp/staged", 2048, 4096))
            .response()
            .await
            .unwrap();

        let task = transport.created_with_tag(APPEND_ROUTE).remove(0);
        let descriptor = task.descriptor();
        assert_eq!(descriptor.kind, TaskKind::Upload);
        assert_eq!(
            descriptor.url,
            "https://content.dropboxapi.com/2/files/upload_session/append_v2"
        );
        assert_eq!(descriptor.header_value("authorization"), Some("Bearer tok"));
        let arg: serde_json::Value =
            serde_json::from_str(descriptor.header_value(ARG_HEADER).unwrap()).unwrap();
        assert_eq!(arg, json!({ "cursor": { "session_id": "sess-9", "offset": 2048 }, "close": true }));
        assert_eq!(descriptor.body, UploadBody::range("/tmp/staged", 2048, 4096));
    }

    #[tokio::test]
    async fn start_persists_route_and_decodes_session() {
        let (routes, transport) = routes(false);
        transport.set_responder(|_| MockReply::json(json!({ "session_id": "abc" })));
        let result = routes
            .start(false, UploadBody::range("/tmp/staged", 0, 10))
            .response()
            .await
            .unwrap();
        assert_eq!(result.session_id, "abc");

        let task = transport.created_with_tag(START_ROUTE).remove(0);
        let description = task.descriptor().description.as_deref();
        let info = PersistedRequestInfo::from_description(description).unwrap();
        assert_eq!(info.route_name(), START_ROUTE);
    }

    #[tokio::test]
    async fn finish_batch_posts_json_entries() {
        let (routes, transport) = routes(false);
        transport.set_responder(|_| MockReply::json(json!({ "entries": [] })));
        let entries = vec![FinishArg {
            cursor: SessionCursor {
                session_id: "s".into(),
                offset: 5,
            },
            commit: CommitInfo::new("/a.txt"),
            content_hash: None,
        }];
        let result = routes.finish_batch(&entries).response().await.unwrap();
        assert!(result.entries.is_empty());

        let task = transport.created_with_tag(FINISH_BATCH_ROUTE).remove(0);
        let UploadBody::Data { bytes } = &task.descriptor().body else {
            panic!("finish body should be in memory");
        };
        let sent: serde_json::Value = serde_json::from_slice(bytes).unwrap();
        assert_eq!(sent["entries"][0]["commit"]["path"], "/a.txt");
        assert_eq!(sent["entries"][0]["cursor"]["offset"], 5);
    }

    #[tokio::test]
    async fn background_routes_refuse_batches() {
        assert!(routes(false).0.supports_batch_upload());
        assert!(!routes(true).0.supports_batch_upload());
    }
}
