//! Asynchronous relay of tracking events to the collector
//!
//! Producers push onto an unbounded channel and return immediately. A fixed
//! pool of workers takes one event at a time and delivers it. Failed
//! deliveries are logged and dropped.

pub mod collector;

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use collector::Collector;

pub const API_EVENT_CATEGORY: &str = "API Request";
pub const DOWNLOAD_EVENT_CATEGORY: &str = "Resource Download Request";
pub const DOWNLOAD_EVENT_ACTION: &str = "ResourceDownload";

/// Client id sent for requests without a user
pub const ANONYMOUS_CLIENT_ID: &str = "anonymous";

/// Request the event describes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub host: String,
    pub path: String,
    pub referrer: String,
}

/// One measurement-protocol hit; serializes to the collector's form fields
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EventDescriptor {
    pub v: u8,
    pub tid: String,
    pub cid: String,
    pub t: String,
    pub dh: String,
    pub dp: String,
    pub dr: String,
    pub ec: String,
    pub ea: String,
    pub el: String,
}

/// One-way hash of the user identifier
pub fn client_id(user: Option<&str>) -> String {
    match user.filter(|u| !u.is_empty()) {
        Some(user) => hex::encode(Sha256::digest(user.as_bytes())),
        None => ANONYMOUS_CLIENT_ID.to_string(),
    }
}

impl EventDescriptor {
    pub fn new(
        tracking_id: &str,
        user: Option<&str>,
        context: RequestContext,
        category: &str,
        action: &str,
        label: &str,
    ) -> Self {
        Self {
            v: 1,
            tid: tracking_id.to_string(),
            cid: client_id(user),
            t: "event".to_string(),
            dh: context.host,
            dp: context.path,
            dr: context.referrer,
            ec: category.to_string(),
            ea: action.to_string(),
            el: label.to_string(),
        }
    }

    /// An API call; `label` is the object the call was about, if any
    pub fn api_request(
        tracking_id: &str,
        user: Option<&str>,
        context: RequestContext,
        action: &str,
        label: Option<&str>,
    ) -> Self {
        Self::new(tracking_id, user, context, API_EVENT_CATEGORY, action, label.unwrap_or_default())
    }

    pub fn resource_download(tracking_id: &str, user: Option<&str>, context: RequestContext, resource_id: &str) -> Self {
        Self::new(
            tracking_id,
            user,
            context,
            DOWNLOAD_EVENT_CATEGORY,
            DOWNLOAD_EVENT_ACTION,
            resource_id,
        )
    }
}

/// Handle producers use to queue events. Cloning is cheap; the workers stop
/// once every handle is dropped and the queue is drained.
#[derive(Clone)]
pub struct EventRelay {
    sender: mpsc::UnboundedSender<EventDescriptor>,
}

impl EventRelay {
    /// Spawn `workers` delivery tasks on the current runtime
    pub fn start(collector: Arc<dyn Collector>, workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(receiver));

        for id in 0..workers {
            tokio::spawn(worker_task(id, queue.clone(), collector.clone()));
        }
        info!("Event relay started ({} workers)", workers);

        Self { sender }
    }

    /// Queue an event for delivery. Never blocks.
    pub fn enqueue(&self, event: EventDescriptor) {
        if self.sender.send(event).is_err() {
            warn!("Event relay is shut down; dropping event");
        }
    }
}

async fn worker_task(
    id: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<EventDescriptor>>>,
    collector: Arc<dyn Collector>,
) {
    loop {
        // Lock only while waiting for the next event so deliveries overlap
        let next = queue.lock().await.recv().await;
        let Some(event) = next else {
            debug!("Relay worker {} shutting down", id);
            break;
        };

        match collector.deliver(&event).await {
            Ok(()) => debug!("Relay worker {} delivered {} / {}", id, event.ec, event.ea),
            Err(e) => warn!("Failed to deliver event {} / {}: {}", event.ec, event.ea, e),
        }
    }
}
