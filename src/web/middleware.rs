//! Tracking middleware
//!
//! Turns API calls and resource downloads into collector events and hands
//! them to the event relay. The request is never held up by delivery.

use axum::{
    body::Body,
    extract::Query,
    http::{header, HeaderMap, Request, Uri},
    response::Response,
};
use futures::future::BoxFuture;
use std::{
    collections::HashMap,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};

use crate::relay::{EventDescriptor, EventRelay, RequestContext};

/// Header carrying the authenticated user, set by the fronting proxy
pub const USER_HEADER: &str = "x-remote-user";

/// Query parameters that name the object an API call is about, by priority
const LABEL_PARAMS: &[&str] = &["id", "q", "query"];

/// What a request is reported as
#[derive(Debug, Clone, PartialEq, Eq)]
enum Tracked {
    Api { action: String, label: Option<String> },
    Download { resource_id: String },
}

/// `/dataset/{id}/resource/{rid}/download[/...]` is a download of `rid`.
/// Any path under `/api/` is an API call; its action is the segment after
/// `action` when present, otherwise the rest of the path.
fn classify(uri: &Uri) -> Option<Tracked> {
    let segments: Vec<&str> = uri.path().split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        ["dataset", _, "resource", resource_id, "download", ..] => Some(Tracked::Download {
            resource_id: resource_id.to_string(),
        }),
        ["api", rest @ ..] if !rest.is_empty() => {
            let action = match rest.iter().position(|s| *s == "action") {
                Some(pos) => rest.get(pos + 1)?.to_string(),
                None => rest.join("/"),
            };
            Some(Tracked::Api {
                action,
                label: label_param(uri),
            })
        }
        _ => None,
    }
}

fn label_param(uri: &Uri) -> Option<String> {
    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(uri).ok()?;
    LABEL_PARAMS
        .iter()
        .find_map(|key| params.get(*key).filter(|v| !v.is_empty()).cloned())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn request_context(uri: &Uri, headers: &HeaderMap) -> RequestContext {
    RequestContext {
        host: header_str(headers, header::HOST.as_str())
            .or_else(|| uri.host())
            .unwrap_or_default()
            .to_string(),
        path: uri.path().to_string(),
        referrer: header_str(headers, header::REFERER.as_str())
            .unwrap_or_default()
            .to_string(),
    }
}

/// Relay handle plus the property events are sent to
pub struct Tracker {
    relay: EventRelay,
    tracking_id: String,
}

impl Tracker {
    pub fn new(relay: EventRelay, tracking_id: &str) -> Self {
        Self {
            relay,
            tracking_id: tracking_id.to_string(),
        }
    }

    fn track(&self, request: &Request<Body>) {
        let Some(tracked) = classify(request.uri()) else {
            return;
        };
        let headers = request.headers();
        let user = header_str(headers, USER_HEADER);
        let context = request_context(request.uri(), headers);

        let event = match tracked {
            Tracked::Api { action, label } => {
                EventDescriptor::api_request(&self.tracking_id, user, context, &action, label.as_deref())
            }
            Tracked::Download { resource_id } => {
                EventDescriptor::resource_download(&self.tracking_id, user, context, &resource_id)
            }
        };
        self.relay.enqueue(event);
    }
}

/// Layer for request tracking
#[derive(Clone)]
pub struct TrackingLayer {
    tracker: Arc<Tracker>,
}

impl TrackingLayer {
    pub fn new(tracker: Tracker) -> Self {
        Self {
            tracker: Arc::new(tracker),
        }
    }
}

impl<S> Layer<S> for TrackingLayer {
    type Service = TrackingMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TrackingMiddleware {
            inner,
            tracker: self.tracker.clone(),
        }
    }
}

/// Middleware service for request tracking
#[derive(Clone)]
pub struct TrackingMiddleware<S> {
    inner: S,
    tracker: Arc<Tracker>,
}

impl<S> Service<Request<Body>> for TrackingMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // enqueue only pushes onto the relay channel
        self.tracker.track(&request);

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::collector::ChannelCollector;
    use crate::relay::{API_EVENT_CATEGORY, DOWNLOAD_EVENT_ACTION, DOWNLOAD_EVENT_CATEGORY};
    use axum::{http::StatusCode, routing::get, Router};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn app() -> (Router, mpsc::UnboundedReceiver<EventDescriptor>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = EventRelay::start(Arc::new(ChannelCollector(tx)), 1);
        let router = Router::new()
            .route("/api/3/action/:action", get(|| async { "ok" }))
            .route("/dataset/:id/resource/:rid/download", get(|| async { "file" }))
            .route("/about", get(|| async { "about" }))
            .layer(TrackingLayer::new(Tracker::new(relay, "UA-9")));
        (router, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<EventDescriptor>) -> EventDescriptor {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&uri("/api/3/action/package_show?id=abc")),
            Some(Tracked::Api {
                action: "package_show".to_string(),
                label: Some("abc".to_string())
            })
        );
        assert_eq!(
            classify(&uri("/api/action/package_search?q=water&rows=5")),
            Some(Tracked::Api {
                action: "package_search".to_string(),
                label: Some("water".to_string())
            })
        );
        assert_eq!(
            classify(&uri("/api/stats/datasets/top")),
            Some(Tracked::Api {
                action: "stats/datasets/top".to_string(),
                label: None
            })
        );
        assert_eq!(
            classify(&uri("/dataset/abc/resource/r1/download/data.csv")),
            Some(Tracked::Download {
                resource_id: "r1".to_string()
            })
        );
        assert_eq!(classify(&uri("/api/3/action")), None);
        assert_eq!(classify(&uri("/api")), None);
        assert_eq!(classify(&uri("/dataset/abc")), None);
    }

    #[test]
    fn test_label_priority() {
        assert_eq!(label_param(&uri("/api/x?query=b&id=a")), Some("a".to_string()));
        assert_eq!(label_param(&uri("/api/x?id=&q=b")), Some("b".to_string()));
        assert_eq!(label_param(&uri("/api/x")), None);
    }

    #[tokio::test]
    async fn test_api_call_is_tracked() {
        let (app, mut rx) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/3/action/package_show?id=abc")
                    .header("host", "data.example.org")
                    .header("referer", "https://example.org/")
                    .header(USER_HEADER, "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let event = next_event(&mut rx).await;
        assert_eq!(event.tid, "UA-9");
        assert_eq!(event.ec, API_EVENT_CATEGORY);
        assert_eq!(event.ea, "package_show");
        assert_eq!(event.el, "abc");
        assert_eq!(event.dh, "data.example.org");
        assert_eq!(event.dp, "/api/3/action/package_show");
        assert_eq!(event.dr, "https://example.org/");
        assert_eq!(event.cid, crate::relay::client_id(Some("alice")));
    }

    #[tokio::test]
    async fn test_download_is_tracked() {
        let (app, mut rx) = app();
        app.oneshot(
            Request::builder()
                .uri("/dataset/abc/resource/r1/download")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.ec, DOWNLOAD_EVENT_CATEGORY);
        assert_eq!(event.ea, DOWNLOAD_EVENT_ACTION);
        assert_eq!(event.el, "r1");
        assert_eq!(event.cid, crate::relay::ANONYMOUS_CLIENT_ID);
    }

    #[tokio::test]
    async fn test_other_pages_are_not_tracked() {
        let (app, mut rx) = app();
        app.clone()
            .oneshot(Request::builder().uri("/about").body(Body::empty()).unwrap())
            .await
            .unwrap();
        app.oneshot(
            Request::builder()
                .uri("/api/3/action/status_show")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

        // The single worker delivers in order, so the first event is the API call
        let event = next_event(&mut rx).await;
        assert_eq!(event.ea, "status_show");
        assert!(rx.try_recv().is_err());
    }
}
