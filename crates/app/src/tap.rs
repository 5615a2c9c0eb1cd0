use std::{collections::HashSet, time::Duration};

use axum::response::sse::{Event, KeepAlive};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Auth,
    Quiz,
    Vote,
    Storage,
    App,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Auth => "auth",
            StageKind::Quiz => "quiz",
            StageKind::Vote => "vote",
            StageKind::Storage => "storage",
            StageKind::App => "app",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "auth" => Some(StageKind::Auth),
            "quiz" => Some(StageKind::Quiz),
            "vote" => Some(StageKind::Vote),
            "storage" => Some(StageKind::Storage),
            "app" => Some(StageKind::App),
            _ => None,
        }
    }
}

/// Activity record streamed to `/_debug/tap` subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub ts: DateTime<Utc>,
    pub stage: StageKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl StageEvent {
    pub fn new(ts: DateTime<Utc>, stage: StageKind, message: &str) -> Self {
        Self {
            ts,
            stage,
            message: message.to_string(),
            user_id: None,
            payload: Value::Null,
        }
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn event_name(&self) -> &'static str {
        self.stage.as_str()
    }

    pub fn into_sse_event(self) -> Result<Event, serde_json::Error> {
        let event = Event::default().event(self.event_name());
        let data = serde_json::to_string(&self)?;
        Ok(event.data(data))
    }
}

#[derive(Clone)]
pub struct TapHub {
    sender: broadcast::Sender<StageEvent>,
}

impl TapHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(128);
        Self { sender }
    }

    /// Broadcasts the event to current subscribers. Dropped when nobody listens.
    pub fn publish(&self, event: StageEvent) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        if let Err(err) = self.sender.send(event) {
            warn!(stage = "app", error = %err, "failed to broadcast tap event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TapFilter {
    stages: Option<HashSet<StageKind>>,
}

impl TapFilter {
    pub fn from_stages(stages: Option<HashSet<StageKind>>) -> Self {
        Self { stages }
    }

    /// Selected stage names, sorted; empty when every stage passes.
    pub fn stage_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .stages
            .iter()
            .flatten()
            .map(|stage| stage.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn matches(&self, event: &StageEvent) -> bool {
        match &self.stages {
            Some(stages) => stages.contains(&event.stage),
            None => true,
        }
    }
}

pub fn tap_stream(
    hub: TapHub,
    filter: TapFilter,
) -> impl Stream<Item = Result<Event, serde_json::Error>> + Send + 'static {
    BroadcastStream::new(hub.subscribe()).filter_map(move |result| match result {
        Ok(event) if filter.matches(&event) => Some(event.into_sse_event()),
        Ok(_) => None,
        Err(_) => None,
    })
}

pub fn tap_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(20))
        .text("heartbeat")
}

pub fn parse_stage_list(value: Option<String>) -> Result<Option<HashSet<StageKind>>, String> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let mut set = HashSet::new();
    for item in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let name = item.trim().to_lowercase();
        let stage = StageKind::parse(&name).ok_or_else(|| format!("unknown stage '{name}'"))?;
        set.insert(stage);
    }

    if set.is_empty() {
        Ok(None)
    } else {
        Ok(Some(set))
    }
}
