use crate::fetch::{FetchError, Upstream};
use crate::types::{Payload, SourceLocation};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// In-process upstream keyed by spreadsheet id or URL. Unscripted locations fail.
#[derive(Default)]
pub struct ScriptedUpstream {
    responses: Mutex<HashMap<String, Result<Payload, String>>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch sleeps for `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        ScriptedUpstream {
            delay,
            ..Default::default()
        }
    }

    pub fn respond(&self, key: &str, payload: Payload) {
        self.responses.lock().insert(key.to_string(), Ok(payload));
    }

    pub fn fail(&self, key: &str, message: &str) {
        self.responses
            .lock()
            .insert(key.to_string(), Err(message.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Keys in the order their fetches started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }
}

pub fn location_key(location: &SourceLocation) -> &str {
    match location {
        SourceLocation::Sheet { spreadsheet_id, .. } => spreadsheet_id,
        SourceLocation::Csv { url, .. } | SourceLocation::Document { url } => url,
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn fetch(&self, location: &SourceLocation) -> Result<Payload, FetchError> {
        let key = location_key(location).to_string();
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().push(key.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let response = self.responses.lock().get(&key).cloned();
        match response {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(message)) => Err(FetchError::AllMirrorsFailed(vec![message])),
            None => Err(FetchError::Timeout(key)),
        }
    }
}

pub fn sheet(id: &str) -> SourceLocation {
    SourceLocation::Sheet {
        spreadsheet_id: id.to_string(),
        tab: "Sheet1".to_string(),
    }
}

pub fn document(url: &str) -> SourceLocation {
    SourceLocation::Document {
        url: url.to_string(),
    }
}

pub fn rows(n: usize) -> Payload {
    Payload::Rows(
        (0..n)
            .map(|i| crate::types::Row::from([("id".to_string(), i.to_string())]))
            .collect(),
    )
}
